//! Coding-sequence context lookup used when merging compound variants.

use coitrees::{BasicCOITree, Interval, IntervalTree};
use log::debug;
use rustc_hash::FxHashMap;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::sync::Arc;

/// Transcript orientation of a gene
#[derive(Default, PartialEq, Eq, Hash, Clone, Copy, Debug)]
pub enum Strand {
    #[default]
    Forward,
    Reverse,
}

/// Gene a reference position falls in, if any.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CodingContext {
    pub gene: Arc<str>,
    pub strand: Strand,
}

impl CodingContext {
    pub fn new(gene: &str, strand: Strand) -> Self {
        CodingContext {
            gene: Arc::from(gene),
            strand,
        }
    }
}

/// Read interface onto a gene annotation database.
pub trait CodingAnnotation: Send + Sync {
    fn coding_context(&self, contig: &str, offset: u64) -> Option<CodingContext>;
}

/// Treats every position as non-coding.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoAnnotation;

impl CodingAnnotation for NoAnnotation {
    fn coding_context(&self, _contig: &str, _offset: u64) -> Option<CodingContext> {
        None
    }
}

/// Gene intervals per contig, loaded from BED6
/// (`contig start end name score strand`, 0-based half-open).
pub struct GeneIntervals {
    genes: Vec<CodingContext>,
    trees: FxHashMap<String, BasicCOITree<usize, u32>>,
}

impl GeneIntervals {
    pub fn from_bed_file(bed_file: &str) -> io::Result<Self> {
        let file = File::open(bed_file).map_err(|e| {
            io::Error::new(
                e.kind(),
                format!("Failed to open gene annotation '{bed_file}': {e}"),
            )
        })?;
        Self::from_bed_reader(BufReader::new(file))
    }

    pub fn from_bed_reader<R: BufRead>(reader: R) -> io::Result<Self> {
        let mut genes = Vec::new();
        let mut intervals: FxHashMap<String, Vec<Interval<usize>>> = FxHashMap::default();

        for (line_no, line) in reader.lines().enumerate() {
            let line = line?;
            if line.is_empty()
                || line.starts_with('#')
                || line.starts_with("track")
                || line.starts_with("browser")
            {
                continue;
            }
            let parts: Vec<&str> = line.split('\t').collect();
            if parts.len() < 4 {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("Invalid BED line {}: expected at least 4 columns", line_no + 1),
                ));
            }

            let (start, end) = parse_bed_range(parts[1], parts[2]).map_err(|msg| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("Invalid BED line {}: {msg}", line_no + 1),
                )
            })?;
            let strand = match parts.get(5).copied() {
                Some("-") => Strand::Reverse,
                _ => Strand::Forward,
            };

            let gene_idx = genes.len();
            genes.push(CodingContext::new(parts[3], strand));
            intervals
                .entry(parts[0].to_string())
                .or_default()
                .push(Interval {
                    first: start,
                    last: end - 1,
                    metadata: gene_idx,
                });
        }

        debug!(
            "Loaded {} gene intervals on {} contigs",
            genes.len(),
            intervals.len()
        );

        let trees = intervals
            .into_iter()
            .map(|(contig, nodes)| (contig, BasicCOITree::new(nodes.as_slice())))
            .collect();

        Ok(GeneIntervals { genes, trees })
    }

    pub fn gene_count(&self) -> usize {
        self.genes.len()
    }
}

impl CodingAnnotation for GeneIntervals {
    fn coding_context(&self, contig: &str, offset: u64) -> Option<CodingContext> {
        let tree = self.trees.get(contig)?;
        let pos = i32::try_from(offset).ok()?;

        // Lowest gene index wins when genes overlap
        let mut hit: Option<usize> = None;
        tree.query(pos, pos, |interval| {
            let idx: usize = interval.metadata.clone();
            hit = Some(hit.map_or(idx, |h| h.min(idx)));
        });
        hit.map(|idx| self.genes[idx].clone())
    }
}

fn parse_bed_range(start: &str, end: &str) -> Result<(i32, i32), String> {
    let start = start
        .parse::<i32>()
        .map_err(|_| format!("invalid start value '{start}'"))?;
    let end = end
        .parse::<i32>()
        .map_err(|_| format!("invalid end value '{end}'"))?;
    if start < 0 || start >= end {
        return Err("start value must be less than end value".to_string());
    }
    Ok((start, end))
}
