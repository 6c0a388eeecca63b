//! Compound variant aggregation and disaggregation.
//!
//! Contiguous same-kind edits of one haplotype (genome, contig, phase) are
//! merged greedily into maximal runs. A run only continues while the coding
//! context stays the same, so a run never straddles a gene boundary.
//! Differing edits at one offset are conflicts: each one continues or opens
//! its own run, so no run mixes them.

use crate::annotation::Strand;
use crate::variant::{AtomicEdit, CompoundVariant, ContigId, EditKey, EditKind, GenomeId, Phase};
use log::{debug, warn};
use rustc_hash::FxHashSet;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// How constituent qualities combine into a compound quality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QualityPolicy {
    /// Weakest constituent
    #[default]
    Min,
    Mean,
    /// Lowest-offset constituent
    First,
}

impl QualityPolicy {
    /// Combine qualities in offset order; missing qualities are ignored.
    pub fn combine<I: IntoIterator<Item = Option<f32>>>(&self, qualities: I) -> Option<f32> {
        let mut iter = qualities.into_iter();
        match self {
            QualityPolicy::First => iter.next().flatten(),
            QualityPolicy::Min => iter.flatten().reduce(f32::min),
            QualityPolicy::Mean => {
                let (sum, n) = iter
                    .flatten()
                    .fold((0f64, 0usize), |(sum, n), q| (sum + q as f64, n + 1));
                (n > 0).then(|| (sum / n as f64) as f32)
            }
        }
    }
}

impl FromStr for QualityPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "min" => Ok(QualityPolicy::Min),
            "mean" => Ok(QualityPolicy::Mean),
            "first" => Ok(QualityPolicy::First),
            other => Err(format!(
                "Unknown quality policy '{other}' (expected min, mean or first)"
            )),
        }
    }
}

impl fmt::Display for QualityPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QualityPolicy::Min => write!(f, "min"),
            QualityPolicy::Mean => write!(f, "mean"),
            QualityPolicy::First => write!(f, "first"),
        }
    }
}

#[derive(Debug, PartialEq)]
pub enum CompoundErr {
    EmptyGroup,
    MixedGroup,
    NotContiguous { previous: u64, offset: u64 },
}

impl fmt::Display for CompoundErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompoundErr::EmptyGroup => write!(f, "Cannot build a compound variant from no edits"),
            CompoundErr::MixedGroup => write!(
                f,
                "Compound constituents must share genome, contig, phase, kind and coding context"
            ),
            CompoundErr::NotContiguous { previous, offset } => write!(
                f,
                "Compound constituents are not contiguous: {offset} does not follow {previous}"
            ),
        }
    }
}

impl std::error::Error for CompoundErr {}

/// Result of one aggregation pass.
#[derive(Debug, Default)]
pub struct Aggregation {
    pub compounds: Vec<CompoundVariant>,
    /// Edits left atomic: singletons, conflicts, and unselected kinds
    pub atomic: Vec<AtomicEdit>,
    pub conflicts: usize,
    pub duplicates: usize,
}

type RunKey = (GenomeId, ContigId, Phase, EditKind);

/// Merge maximal contiguous runs of the edit kinds in `kinds`.
pub fn create(edits: Vec<AtomicEdit>, kinds: &[EditKind], policy: QualityPolicy) -> Aggregation {
    let mut aggregation = Aggregation::default();
    let mut groups: BTreeMap<RunKey, Vec<AtomicEdit>> = BTreeMap::new();

    for edit in edits {
        if kinds.contains(&edit.kind) {
            groups
                .entry((edit.genome, edit.contig, edit.phase, edit.kind))
                .or_default()
                .push(edit);
        } else {
            aggregation.atomic.push(edit);
        }
    }

    for (_, mut group) in groups {
        // Stable: among equal offsets the first ingested edit leads
        group.sort_by_key(|e| e.offset);
        // Runs that ended at the previous offset and may still grow
        let mut open: Vec<Vec<AtomicEdit>> = Vec::new();
        let mut group = group.into_iter().peekable();

        while let Some(first) = group.next() {
            let offset = first.offset;
            let mut distinct = vec![first];
            while let Some(edit) = group.next_if(|e| e.offset == offset) {
                if distinct.iter().any(|d| same_change(d, &edit)) {
                    debug!("Dropping duplicate {} edit at offset {}", edit.kind, offset);
                    aggregation.duplicates += 1;
                } else {
                    warn!(
                        "Conflicting {} edits at offset {}: '{}' vs '{}', keeping them separate",
                        edit.kind,
                        offset,
                        distinct[0].alt_text(),
                        edit.alt_text()
                    );
                    aggregation.conflicts += 1;
                    distinct.push(edit);
                }
            }

            // Each open run takes at most one edit per offset, preferring an
            // edit from the record that started it
            let mut pending: Vec<Option<Vec<AtomicEdit>>> = open.drain(..).map(Some).collect();
            for edit in distinct {
                let extends = |run: &Vec<AtomicEdit>| {
                    run.last()
                        .is_some_and(|last| last.offset + 1 == offset && last.coding == edit.coding)
                };
                let pick = pending
                    .iter()
                    .position(|run| {
                        run.as_ref().is_some_and(|run| {
                            extends(run) && run.last().is_some_and(|last| same_source(last, &edit))
                        })
                    })
                    .or_else(|| {
                        pending
                            .iter()
                            .position(|run| run.as_ref().is_some_and(|run| extends(run)))
                    });
                let mut run = pick.and_then(|i| pending[i].take()).unwrap_or_default();
                run.push(edit);
                open.push(run);
            }
            for run in pending.into_iter().flatten() {
                flush_run(run, policy, &mut aggregation);
            }
        }
        for run in open {
            flush_run(run, policy, &mut aggregation);
        }
    }

    aggregation
}

fn same_change(a: &AtomicEdit, b: &AtomicEdit) -> bool {
    a.ref_base == b.ref_base && a.alt_base == b.alt_base
}

fn same_source(a: &AtomicEdit, b: &AtomicEdit) -> bool {
    a.evidence.source_pos == b.evidence.source_pos && a.evidence.record_id == b.evidence.record_id
}

fn flush_run(run: Vec<AtomicEdit>, policy: QualityPolicy, aggregation: &mut Aggregation) {
    match run.len() {
        0 => {}
        1 => aggregation.atomic.extend(run),
        _ => match create_compound_variant(run, policy) {
            Ok(compound) => aggregation.compounds.push(compound),
            // Runs are built contiguous and homogeneous above
            Err(e) => warn!("Skipping compound run: {e}"),
        },
    }
}

/// Build one compound from a contiguous, homogeneous group sorted by offset.
pub fn create_compound_variant(
    group: Vec<AtomicEdit>,
    policy: QualityPolicy,
) -> Result<CompoundVariant, CompoundErr> {
    let first = group.first().ok_or(CompoundErr::EmptyGroup)?;
    let (genome, contig, phase, kind) = (first.genome, first.contig, first.phase, first.kind);
    let coding = first.coding.clone();

    for pair in group.windows(2) {
        let (prev, next) = (&pair[0], &pair[1]);
        if next.genome != genome
            || next.contig != contig
            || next.phase != phase
            || next.kind != kind
            || next.coding != coding
        {
            return Err(CompoundErr::MixedGroup);
        }
        if next.offset != prev.offset + 1 {
            return Err(CompoundErr::NotContiguous {
                previous: prev.offset,
                offset: next.offset,
            });
        }
    }

    let canonical_offset = match coding.as_ref().map(|c| c.strand) {
        Some(Strand::Reverse) => group[group.len() - 1].offset,
        _ => first.offset,
    };
    let quality = policy.combine(group.iter().map(|e| e.evidence.quality));

    Ok(CompoundVariant {
        genome,
        contig,
        phase,
        kind,
        canonical_offset,
        quality,
        coding,
        edits: group,
    })
}

/// Constituent edits of `compound`, in offset order.
pub fn disaggregate(compound: &CompoundVariant) -> Vec<AtomicEdit> {
    compound.edits.clone()
}

/// Raw edits not accounted for by any compound.
pub fn residual_edits(raw: &[AtomicEdit], compounds: &[CompoundVariant]) -> Vec<AtomicEdit> {
    let covered: FxHashSet<EditKey> = compounds
        .iter()
        .flat_map(disaggregate)
        .map(|e| e.key())
        .collect();
    raw.iter()
        .filter(|e| !covered.contains(&e.key()))
        .cloned()
        .collect()
}
