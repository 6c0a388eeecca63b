//! Indel coordinate-offset ledger.
//!
//! Every indel already applied to a (genome, contig) shifts the coordinates of
//! everything after it. The ledger records one signed length delta per raw
//! reference offset and answers "how far has offset O drifted so far".
//!
//! For a mutation at raw offset `O` the shift must be read with
//! [`IndelLedger::adjust_indel_offsets`] before its edits are built, and its own
//! delta registered with [`IndelLedger::update_indel_accounting`] only after.
//! [`LedgerBook::with_mutations`] runs that sequence under the ledger lock.

use crate::variant::{ContigId, GenomeId};
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerErr {
    DuplicateOffset { offset: u64, existing: i64, rejected: i64 },
}

impl fmt::Display for LedgerErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LedgerErr::DuplicateOffset {
                offset,
                existing,
                rejected,
            } => write!(
                f,
                "Indel delta {rejected} rejected at offset {offset}: delta {existing} already registered"
            ),
        }
    }
}

impl std::error::Error for LedgerErr {}

#[derive(Debug, Default, Clone)]
pub struct IndelLedger {
    deltas: BTreeMap<u64, i64>,
}

impl IndelLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sum of all registered deltas at offsets `<= offset`.
    pub fn adjust_indel_offsets(&self, offset: u64) -> i64 {
        self.deltas.range(..=offset).map(|(_, delta)| delta).sum()
    }

    /// Register `delta` at `offset`. Zero deltas are ignored; a second
    /// non-zero delta at the same offset is rejected and leaves the ledger as is.
    pub fn update_indel_accounting(&mut self, offset: u64, delta: i64) -> Result<(), LedgerErr> {
        if delta == 0 {
            return Ok(());
        }
        if let Some(&existing) = self.deltas.get(&offset) {
            return Err(LedgerErr::DuplicateOffset {
                offset,
                existing,
                rejected: delta,
            });
        }
        self.deltas.insert(offset, delta);
        Ok(())
    }

    /// Net length change of the contig after every registered indel.
    pub fn total_indel_offset(&self) -> i64 {
        self.deltas.values().sum()
    }

    pub fn len(&self) -> usize {
        self.deltas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = (u64, i64)> + '_ {
        self.deltas.iter().map(|(&offset, &delta)| (offset, delta))
    }
}

/// Shift a reference offset by a ledger adjustment, clamped at zero.
pub fn shifted(offset: u64, shift: i64) -> u64 {
    let shifted = offset as i128 + shift as i128;
    shifted.clamp(0, u64::MAX as i128) as u64
}

type LedgerKey = (GenomeId, ContigId);

/// One ledger per (genome, contig), created on first use.
#[derive(Debug, Default)]
pub struct LedgerBook {
    ledgers: Mutex<FxHashMap<LedgerKey, Arc<Mutex<IndelLedger>>>>,
}

impl LedgerBook {
    pub fn new() -> Self {
        Self::default()
    }

    fn ledger(&self, genome: GenomeId, contig: ContigId) -> Arc<Mutex<IndelLedger>> {
        let mut ledgers = self.ledgers.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(ledgers.entry((genome, contig)).or_default())
    }

    /// Build the edits of one record's alleles as a single unit on their
    /// ledger: read the shift at `raw_offset`, hand it to `build`, then
    /// register each delta in order. Returns the rejected registrations.
    pub fn with_mutations<T, F>(
        &self,
        genome: GenomeId,
        contig: ContigId,
        raw_offset: u64,
        deltas: &[i64],
        build: F,
    ) -> (T, Vec<LedgerErr>)
    where
        F: FnOnce(i64) -> T,
    {
        let ledger = self.ledger(genome, contig);
        let mut ledger = ledger.lock().unwrap_or_else(PoisonError::into_inner);
        let shift = ledger.adjust_indel_offsets(raw_offset);
        let built = build(shift);
        let rejected = deltas
            .iter()
            .filter_map(|&delta| ledger.update_indel_accounting(raw_offset, delta).err())
            .collect();
        (built, rejected)
    }

    /// Snapshot of one ledger.
    pub fn snapshot(&self, genome: GenomeId, contig: ContigId) -> Option<IndelLedger> {
        let ledgers = self.ledgers.lock().unwrap_or_else(PoisonError::into_inner);
        ledgers
            .get(&(genome, contig))
            .map(|l| l.lock().unwrap_or_else(PoisonError::into_inner).clone())
    }

    pub fn len(&self) -> usize {
        self.ledgers.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
