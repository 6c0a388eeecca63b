//! Atomic sequence edits and the variant sum type held by the store.

use crate::annotation::CodingContext;
use std::fmt;

/// Dense id of a genome (sample) within a population.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GenomeId(pub u32);

/// Dense id of a contig name within a population, shared across genomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContigId(pub u32);

/// Which homologous copy a call belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum Phase {
    #[default]
    Unphased,
    A,
    B,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Unphased => write!(f, "."),
            Phase::A => write!(f, "A"),
            Phase::B => write!(f, "B"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EditKind {
    Substitution,
    Insert,
    Delete,
}

impl EditKind {
    pub const ALL: [EditKind; 3] = [EditKind::Substitution, EditKind::Insert, EditKind::Delete];

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "substitution" | "snp" | "snv" | "sub" => Some(EditKind::Substitution),
            "insert" | "insertion" | "ins" => Some(EditKind::Insert),
            "delete" | "deletion" | "del" => Some(EditKind::Delete),
            _ => None,
        }
    }
}

impl fmt::Display for EditKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EditKind::Substitution => write!(f, "SUB"),
            EditKind::Insert => write!(f, "INS"),
            EditKind::Delete => write!(f, "DEL"),
        }
    }
}

/// Per-call evidence carried along with every atomic edit.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Evidence {
    pub quality: Option<f32>,
    /// INFO `DP`
    pub site_depth: Option<u32>,
    /// Sample `GQ`
    pub genotype_quality: Option<f32>,
    /// Sample `DP`
    pub sample_depth: Option<u32>,
    /// Sample `AD` entry for the carried allele
    pub allele_depth: Option<u32>,
    pub filter_pass: bool,
    /// 1-based POS of the source record
    pub source_pos: u64,
    pub record_id: Option<String>,
}

/// One base-level edit. `offset` is in drift-corrected coordinates;
/// `ref_offset` is the uncorrected offset it was decomposed at. For inserts
/// that is the insertion anchor plus the base's rank within the run, not a
/// reference base.
#[derive(Debug, Clone, PartialEq)]
pub struct AtomicEdit {
    pub genome: GenomeId,
    pub contig: ContigId,
    pub phase: Phase,
    pub offset: u64,
    pub ref_offset: u64,
    pub kind: EditKind,
    /// Empty for inserts
    pub ref_base: Option<u8>,
    /// Empty for deletes
    pub alt_base: Option<u8>,
    pub coding: Option<CodingContext>,
    pub evidence: Evidence,
}

/// Identity of an edit for set bookkeeping, ignoring its evidence.
pub type EditKey = (GenomeId, ContigId, Phase, u64, EditKind, Option<u8>, Option<u8>);

impl AtomicEdit {
    pub fn key(&self) -> EditKey {
        (
            self.genome,
            self.contig,
            self.phase,
            self.offset,
            self.kind,
            self.ref_base,
            self.alt_base,
        )
    }

    /// Alternate content as printable text ("-" for a deletion).
    pub fn alt_text(&self) -> String {
        self.alt_base
            .map(|b| (b as char).to_string())
            .unwrap_or_else(|| "-".to_string())
    }

    pub fn ref_text(&self) -> String {
        self.ref_base
            .map(|b| (b as char).to_string())
            .unwrap_or_else(|| "-".to_string())
    }
}

/// Merged run of contiguous same-kind edits, see [`crate::compound`].
#[derive(Debug, Clone, PartialEq)]
pub struct CompoundVariant {
    pub genome: GenomeId,
    pub contig: ContigId,
    pub phase: Phase,
    pub kind: EditKind,
    /// Constituents in ascending offset order
    pub edits: Vec<AtomicEdit>,
    pub canonical_offset: u64,
    pub quality: Option<f32>,
    pub coding: Option<CodingContext>,
}

impl CompoundVariant {
    pub fn len(&self) -> usize {
        self.edits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edits.is_empty()
    }

    pub fn first_offset(&self) -> u64 {
        self.edits.first().map(|e| e.offset).unwrap_or(self.canonical_offset)
    }

    pub fn last_offset(&self) -> u64 {
        self.edits.last().map(|e| e.offset).unwrap_or(self.canonical_offset)
    }

    pub fn ref_text(&self) -> String {
        self.edits.iter().filter_map(|e| e.ref_base).map(char::from).collect()
    }

    pub fn alt_text(&self) -> String {
        self.edits.iter().filter_map(|e| e.alt_base).map(char::from).collect()
    }
}

/// Everything the store can hold at an offset.
#[derive(Debug, Clone, PartialEq)]
pub enum Variant {
    Substitution(AtomicEdit),
    Insert(AtomicEdit),
    Delete(AtomicEdit),
    Compound(CompoundVariant),
}

impl From<AtomicEdit> for Variant {
    fn from(edit: AtomicEdit) -> Self {
        match edit.kind {
            EditKind::Substitution => Variant::Substitution(edit),
            EditKind::Insert => Variant::Insert(edit),
            EditKind::Delete => Variant::Delete(edit),
        }
    }
}

impl From<CompoundVariant> for Variant {
    fn from(compound: CompoundVariant) -> Self {
        Variant::Compound(compound)
    }
}

impl Variant {
    pub fn genome(&self) -> GenomeId {
        match self {
            Variant::Substitution(e) | Variant::Insert(e) | Variant::Delete(e) => e.genome,
            Variant::Compound(c) => c.genome,
        }
    }

    pub fn contig(&self) -> ContigId {
        match self {
            Variant::Substitution(e) | Variant::Insert(e) | Variant::Delete(e) => e.contig,
            Variant::Compound(c) => c.contig,
        }
    }

    /// Key under which the variant is stored.
    pub fn offset(&self) -> u64 {
        match self {
            Variant::Substitution(e) | Variant::Insert(e) | Variant::Delete(e) => e.offset,
            Variant::Compound(c) => c.canonical_offset,
        }
    }

    pub fn phase(&self) -> Phase {
        match self {
            Variant::Substitution(e) | Variant::Insert(e) | Variant::Delete(e) => e.phase,
            Variant::Compound(c) => c.phase,
        }
    }

    pub fn kind(&self) -> EditKind {
        match self {
            Variant::Substitution(_) => EditKind::Substitution,
            Variant::Insert(_) => EditKind::Insert,
            Variant::Delete(_) => EditKind::Delete,
            Variant::Compound(c) => c.kind,
        }
    }

    pub fn as_atomic(&self) -> Option<&AtomicEdit> {
        match self {
            Variant::Substitution(e) | Variant::Insert(e) | Variant::Delete(e) => Some(e),
            Variant::Compound(_) => None,
        }
    }

    pub fn is_compound(&self) -> bool {
        matches!(self, Variant::Compound(_))
    }

    pub fn label(&self) -> &'static str {
        match self {
            Variant::Substitution(_) => "SUB",
            Variant::Insert(_) => "INS",
            Variant::Delete(_) => "DEL",
            Variant::Compound(_) => "COMPOUND",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edit(kind: EditKind, offset: u64) -> AtomicEdit {
        AtomicEdit {
            genome: GenomeId(0),
            contig: ContigId(0),
            phase: Phase::Unphased,
            offset,
            ref_offset: offset,
            kind,
            ref_base: Some(b'A'),
            alt_base: Some(b'C'),
            coding: None,
            evidence: Evidence::default(),
        }
    }

    #[test]
    fn test_variant_from_edit_matches_kind() {
        assert!(matches!(
            Variant::from(edit(EditKind::Insert, 3)),
            Variant::Insert(_)
        ));
        assert!(matches!(
            Variant::from(edit(EditKind::Delete, 3)),
            Variant::Delete(_)
        ));
        let v = Variant::from(edit(EditKind::Substitution, 7));
        assert_eq!(v.offset(), 7);
        assert_eq!(v.kind(), EditKind::Substitution);
        assert!(v.as_atomic().is_some());
    }

    #[test]
    fn test_edit_kind_parse() {
        assert_eq!(EditKind::parse("Insertion"), Some(EditKind::Insert));
        assert_eq!(EditKind::parse("del"), Some(EditKind::Delete));
        assert_eq!(EditKind::parse("snp"), Some(EditKind::Substitution));
        assert_eq!(EditKind::parse("mnp"), None);
    }
}
