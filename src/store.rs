//! In-memory variant store for a population of genomes.
//!
//! Genome and contig names are interned under a single mutex guarding the
//! population's key structure. Each (genome, contig) pair owns a slot with its
//! own lock, so inserts into different contigs never contend once the slot
//! exists.

use crate::seqidx::NameIndex;
use crate::variant::{AtomicEdit, ContigId, EditKind, GenomeId, Variant};
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Offset-keyed multimap of variants on one contig of one genome.
#[derive(Debug, Default)]
pub struct ContigSlot {
    variants: Mutex<BTreeMap<u64, Vec<Variant>>>,
}

impl ContigSlot {
    fn lock(&self) -> MutexGuard<'_, BTreeMap<u64, Vec<Variant>>> {
        self.variants.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert(&self, variant: Variant) {
        self.lock().entry(variant.offset()).or_default().push(variant);
    }

    pub fn len(&self) -> usize {
        self.lock().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn at(&self, offset: u64) -> Vec<Variant> {
        self.lock().get(&offset).cloned().unwrap_or_default()
    }

    pub fn counts(&self) -> SlotCounts {
        let mut counts = SlotCounts::default();
        for variant in self.lock().values().flatten() {
            match variant {
                Variant::Substitution(_) => counts.substitutions += 1,
                Variant::Insert(_) => counts.inserts += 1,
                Variant::Delete(_) => counts.deletes += 1,
                Variant::Compound(_) => counts.compounds += 1,
            }
        }
        counts
    }

    /// Remove and return every atomic edit of the given kinds, in offset order.
    pub fn drain_atomic(&self, kinds: &[EditKind]) -> Vec<AtomicEdit> {
        let mut map = self.lock();
        let mut drained = Vec::new();
        for variants in map.values_mut() {
            let mut kept = Vec::with_capacity(variants.len());
            for variant in variants.drain(..) {
                match variant {
                    Variant::Substitution(e) | Variant::Insert(e) | Variant::Delete(e)
                        if kinds.contains(&e.kind) =>
                    {
                        drained.push(e)
                    }
                    other => kept.push(other),
                }
            }
            *variants = kept;
        }
        map.retain(|_, variants| !variants.is_empty());
        drained
    }

    /// Every variant in offset order.
    pub fn variants(&self) -> Vec<Variant> {
        self.lock().values().flatten().cloned().collect()
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SlotCounts {
    pub substitutions: usize,
    pub inserts: usize,
    pub deletes: usize,
    pub compounds: usize,
}

impl SlotCounts {
    pub fn total(&self) -> usize {
        self.substitutions + self.inserts + self.deletes + self.compounds
    }
}

#[derive(Debug, Default)]
struct PopulationKeys {
    genomes: NameIndex,
    contigs: NameIndex,
    slots: FxHashMap<(GenomeId, ContigId), Arc<ContigSlot>>,
}

#[derive(Debug, Default)]
pub struct Population {
    keys: Mutex<PopulationKeys>,
}

impl Population {
    pub fn new() -> Self {
        Self::default()
    }

    fn keys(&self) -> MutexGuard<'_, PopulationKeys> {
        self.keys.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get_or_create_genome(&self, name: &str) -> GenomeId {
        GenomeId(self.keys().genomes.get_or_insert_id(name))
    }

    /// Intern `name` and make sure `genome` has a slot for it.
    pub fn get_or_create_contig(&self, genome: GenomeId, name: &str) -> ContigId {
        let mut keys = self.keys();
        let contig = ContigId(keys.contigs.get_or_insert_id(name));
        keys.slots.entry((genome, contig)).or_default();
        contig
    }

    /// Contig id for `name` without creating any slot.
    pub fn intern_contig(&self, name: &str) -> ContigId {
        ContigId(self.keys().contigs.get_or_insert_id(name))
    }

    pub fn genome_id(&self, name: &str) -> Option<GenomeId> {
        self.keys().genomes.get_id(name).map(GenomeId)
    }

    pub fn contig_id(&self, name: &str) -> Option<ContigId> {
        self.keys().contigs.get_id(name).map(ContigId)
    }

    pub fn genome_name(&self, genome: GenomeId) -> Option<String> {
        self.keys().genomes.get_name(genome.0).map(str::to_string)
    }

    pub fn contig_name(&self, contig: ContigId) -> Option<String> {
        self.keys().contigs.get_name(contig.0).map(str::to_string)
    }

    pub fn genome_count(&self) -> usize {
        self.keys().genomes.len()
    }

    /// Slot for (genome, contig), created if missing. The key lock is
    /// released before the caller touches the slot.
    pub fn slot(&self, genome: GenomeId, contig: ContigId) -> Arc<ContigSlot> {
        Arc::clone(self.keys().slots.entry((genome, contig)).or_default())
    }

    fn existing_slot(&self, genome: GenomeId, contig: ContigId) -> Option<Arc<ContigSlot>> {
        self.keys().slots.get(&(genome, contig)).cloned()
    }

    /// Store `variant` under its offset. Duplicates are kept.
    pub fn add_variant(&self, variant: Variant) {
        self.slot(variant.genome(), variant.contig()).insert(variant);
    }

    pub fn add_variants<I: IntoIterator<Item = Variant>>(&self, variants: I) {
        let mut current: Option<((GenomeId, ContigId), Arc<ContigSlot>)> = None;
        for variant in variants {
            let key = (variant.genome(), variant.contig());
            let slot = match &current {
                Some((k, slot)) if *k == key => Arc::clone(slot),
                _ => {
                    let slot = self.slot(key.0, key.1);
                    current = Some((key, Arc::clone(&slot)));
                    slot
                }
            };
            slot.insert(variant);
        }
    }

    pub fn variants_at(&self, genome: &str, contig: &str, offset: u64) -> Vec<Variant> {
        let (Some(genome), Some(contig)) = (self.genome_id(genome), self.contig_id(contig)) else {
            return Vec::new();
        };
        self.existing_slot(genome, contig)
            .map(|slot| slot.at(offset))
            .unwrap_or_default()
    }

    /// All (genome, contig) pairs with a slot, sorted by id.
    pub fn slot_keys(&self) -> Vec<(GenomeId, ContigId)> {
        let mut keys: Vec<_> = self.keys().slots.keys().copied().collect();
        keys.sort_unstable();
        keys
    }

    /// Number of (genome, contig) slots.
    pub fn contig_count(&self) -> usize {
        self.keys().slots.len()
    }

    pub fn variant_count(&self) -> usize {
        self.slots().iter().map(|(_, slot)| slot.len()).sum()
    }

    pub fn counts(&self, genome: GenomeId, contig: ContigId) -> SlotCounts {
        self.existing_slot(genome, contig)
            .map(|slot| slot.counts())
            .unwrap_or_default()
    }

    /// Snapshot of every slot; the key lock is not held while the caller works.
    pub fn slots(&self) -> Vec<((GenomeId, ContigId), Arc<ContigSlot>)> {
        let keys = self.keys();
        let mut slots: Vec<_> = keys
            .slots
            .iter()
            .map(|(key, slot)| (*key, Arc::clone(slot)))
            .collect();
        drop(keys);
        slots.sort_unstable_by_key(|(key, _)| *key);
        slots
    }
}
