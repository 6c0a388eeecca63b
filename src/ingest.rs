//! Concurrent VCF ingestion.
//!
//! One producer (the calling thread) reads the header, then streams data lines
//! into bounded channels, one per consumer. Lines are routed by contig, so a
//! contig is owned by exactly one consumer and its indel ledger is updated in
//! file order. Each consumer tokenizes its lines, decomposes them against the
//! reference and writes atomic edits into the [`Population`]. End of input is
//! one `Done` message per consumer. Once every consumer has
//! finished, each (genome, contig) slot is aggregated into compound variants
//! in parallel.

use crate::annotation::CodingAnnotation;
use crate::compound::{self, QualityPolicy};
use crate::decompose::{Decomposer, GenomeSlot};
use crate::ledger::LedgerBook;
use crate::reference::ReferenceProvider;
use crate::store::Population;
use crate::variant::{EditKind, Variant};
use crate::vcf::{self, VcfHeader};
use crossbeam_channel::{bounded, Receiver};
use log::{debug, error, info, warn};
use noodles::bgzf;
use rayon::prelude::*;
use rustc_hash::{FxHashSet, FxHasher};
use std::fs::File;
use std::hash::{Hash, Hasher};
use std::io::{self, BufRead, BufReader};
use std::num::NonZeroUsize;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::Instant;

pub const MIN_WORKERS: usize = 1;
pub const MAX_WORKERS: usize = 32;
pub const DEFAULT_QUEUE_CAPACITY: usize = 4096;
pub const DEFAULT_GENOME: &str = "sites";
/// Per-kind failures logged at `warn!` before falling back to `debug!`
const MAX_WARNINGS: usize = 10;

#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Consumer threads; `None` derives it from the available CPUs
    pub workers: Option<usize>,
    pub queue_capacity: usize,
    pub compound_kinds: Vec<EditKind>,
    pub quality_policy: QualityPolicy,
    /// Genome that sites-only records are attributed to
    pub default_genome: String,
    pub aggregate: bool,
}

impl Default for IngestConfig {
    fn default() -> Self {
        IngestConfig {
            workers: None,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            compound_kinds: EditKind::ALL.to_vec(),
            quality_policy: QualityPolicy::default(),
            default_genome: DEFAULT_GENOME.to_string(),
            aggregate: true,
        }
    }
}

impl IngestConfig {
    pub fn worker_count(&self) -> usize {
        self.workers
            .unwrap_or_else(num_cpus::get)
            .clamp(MIN_WORKERS, MAX_WORKERS)
    }
}

/// End-of-run counts.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IngestSummary {
    /// Every line read, header included
    pub lines_read: usize,
    pub records_read: usize,
    /// Malformed lines and records on contigs missing from the reference
    pub records_skipped: usize,
    /// Records rejected during decomposition
    pub records_errored: usize,
    pub samples_skipped: usize,
    /// Distinct contigs absent from the reference
    pub missing_contigs: usize,
    /// Atomic edits produced before aggregation
    pub atomic_edits: usize,
    pub compound_variants: usize,
    pub duplicate_offsets: usize,
    pub aggregation_conflicts: usize,
    pub duplicate_edits: usize,
}

/// Open a VCF, transparently decompressing `.gz`/`.bgz` files.
pub fn open_vcf(path: &str, threads: NonZeroUsize) -> io::Result<Box<dyn BufRead>> {
    let file = File::open(path).map_err(|e| {
        io::Error::new(e.kind(), format!("Failed to open VCF file '{path}': {e}"))
    })?;
    let reader: Box<dyn io::Read> = if [".gz", ".bgz"].iter().any(|e| path.ends_with(e)) {
        Box::new(bgzf::io::MultithreadedReader::with_worker_count(threads, file))
    } else {
        Box::new(file)
    };
    Ok(Box::new(BufReader::new(reader)))
}

pub fn ingest_path(
    path: &str,
    population: &Population,
    reference: &dyn ReferenceProvider,
    annotation: &dyn CodingAnnotation,
    config: &IngestConfig,
) -> io::Result<IngestSummary> {
    let threads = NonZeroUsize::new(config.worker_count()).unwrap_or(NonZeroUsize::MIN);
    let reader = open_vcf(path, threads)?;
    ingest_reader(reader, population, reference, annotation, config)
}

enum Message {
    Line(String),
    Done,
}

#[derive(Default)]
struct Counters {
    records_read: AtomicUsize,
    records_skipped: AtomicUsize,
    records_errored: AtomicUsize,
    samples_skipped: AtomicUsize,
    atomic_edits: AtomicUsize,
    duplicate_offsets: AtomicUsize,
}

/// State shared by every consumer of one run.
struct Session<'a> {
    header: &'a VcfHeader,
    population: &'a Population,
    reference: &'a dyn ReferenceProvider,
    decomposer: Decomposer<'a>,
    genomes: Vec<GenomeSlot>,
    counters: Counters,
    missing_contigs: Mutex<FxHashSet<String>>,
}

impl Session<'_> {
    fn consume(&self, rx: &Receiver<Message>) {
        while let Ok(Message::Line(line)) = rx.recv() {
            // A panic rejects the record, not the worker
            if panic::catch_unwind(AssertUnwindSafe(|| self.process_line(&line))).is_err() {
                self.counters.records_errored.fetch_add(1, Ordering::Relaxed);
                let contig = line.split('\t').next().unwrap_or_default();
                error!("Rejecting record on contig '{contig}': processing panicked");
            }
        }
    }

    fn process_line(&self, line: &str) {
        if line.starts_with('#') || line.trim().is_empty() {
            return;
        }
        let n = self.counters.records_read.fetch_add(1, Ordering::Relaxed) + 1;

        let record = match vcf::parse_vcf_line(line, self.header.samples.len()) {
            Ok(record) => record,
            Err(e) => {
                let skipped = self.counters.records_skipped.fetch_add(1, Ordering::Relaxed);
                if skipped < MAX_WARNINGS {
                    warn!("Skipping malformed record {n}: {e}");
                } else {
                    debug!("Skipping malformed record {n}: {e}");
                }
                return;
            }
        };

        if !self.reference.has_contig(&record.contig) {
            let mut missing = self
                .missing_contigs
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if missing.insert(record.contig.clone()) {
                info!(
                    "Contig '{}' is not in the reference, its records are skipped",
                    record.contig
                );
            }
            self.counters.records_skipped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let contig = self.population.intern_contig(&record.contig);
        match self.decomposer.process_record(&record, contig, &self.genomes) {
            Ok(out) => {
                self.counters
                    .samples_skipped
                    .fetch_add(out.samples_skipped, Ordering::Relaxed);
                self.counters
                    .duplicate_offsets
                    .fetch_add(out.duplicate_offsets, Ordering::Relaxed);
                self.counters
                    .atomic_edits
                    .fetch_add(out.edits.len(), Ordering::Relaxed);
                self.population
                    .add_variants(out.edits.into_iter().map(Variant::from));
            }
            Err(e) => {
                let errored = self.counters.records_errored.fetch_add(1, Ordering::Relaxed);
                if errored < MAX_WARNINGS {
                    warn!("Rejecting record at {}:{}: {}", record.contig, record.pos(), e);
                } else {
                    debug!("Rejecting record at {}:{}: {}", record.contig, record.pos(), e);
                }
            }
        }
    }
}

/// Worker that owns the contig of `line`. Every record of a contig goes to
/// the same worker, so each ledger sees its mutations in file order.
fn owning_worker(line: &str, workers: usize) -> usize {
    let contig = line.split('\t').next().unwrap_or_default();
    let mut hasher = FxHasher::default();
    contig.hash(&mut hasher);
    (hasher.finish() % workers as u64) as usize
}

fn warn_on_length_mismatch(header: &VcfHeader, reference: &dyn ReferenceProvider) {
    for meta in &header.contigs {
        let (Some(declared), Some(actual)) = (meta.length, reference.contig_length(&meta.id))
        else {
            continue;
        };
        if declared != actual as u64 {
            warn!(
                "Contig '{}' is declared with length {} but the reference has {}",
                meta.id, declared, actual
            );
        }
    }
}

/// Ingest a VCF stream into `population`.
///
/// Only a missing or broken header and read failures are fatal; bad records
/// are counted and skipped.
pub fn ingest_reader<R: BufRead>(
    mut reader: R,
    population: &Population,
    reference: &dyn ReferenceProvider,
    annotation: &dyn CodingAnnotation,
    config: &IngestConfig,
) -> io::Result<IngestSummary> {
    let start_time = Instant::now();
    let (header, header_lines) = vcf::read_header(&mut reader)?;
    info!(
        "Parsed VCF header with {} samples and {} declared contigs",
        header.samples.len(),
        header.contigs.len()
    );
    warn_on_length_mismatch(&header, reference);
    // Declared contigs get ids in header order, independent of worker timing
    for meta in &header.contigs {
        population.intern_contig(&meta.id);
    }

    let genomes: Vec<GenomeSlot> = if header.samples.is_empty() {
        vec![GenomeSlot {
            genome: population.get_or_create_genome(&config.default_genome),
            sample_idx: None,
        }]
    } else {
        header
            .samples
            .iter()
            .enumerate()
            .map(|(idx, name)| GenomeSlot {
                genome: population.get_or_create_genome(name),
                sample_idx: Some(idx),
            })
            .collect()
    };

    let ledgers = LedgerBook::new();
    let session = Session {
        header: &header,
        population,
        reference,
        decomposer: Decomposer::new(reference, annotation, &ledgers),
        genomes,
        counters: Counters::default(),
        missing_contigs: Mutex::new(FxHashSet::default()),
    };

    let workers = config.worker_count();
    let capacity = (config.queue_capacity / workers).max(1);
    let (senders, receivers): (Vec<_>, Vec<_>) =
        (0..workers).map(|_| bounded::<Message>(capacity)).unzip();
    info!("Starting {} ingestion workers", workers);

    let mut data_lines = 0usize;
    let mut read_error: Option<io::Error> = None;
    let mut panicked = 0usize;

    thread::scope(|scope| {
        let handles: Vec<_> = receivers
            .into_iter()
            .map(|rx| {
                let session = &session;
                scope.spawn(move || session.consume(&rx))
            })
            .collect();

        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line) {
                Ok(0) => break,
                Ok(_) => {
                    data_lines += 1;
                    let trimmed = line.trim_end_matches(['\n', '\r']);
                    let worker = owning_worker(trimmed, workers);
                    if senders[worker].send(Message::Line(trimmed.to_string())).is_err() {
                        error!("Ingestion worker {worker} stopped early");
                        break;
                    }
                }
                Err(e) => {
                    error!("Failed to read VCF line {}: {}", header_lines + data_lines + 1, e);
                    read_error = Some(e);
                    break;
                }
            }
        }
        for tx in &senders {
            // A consumer that already exited has nothing left to stop
            let _ = tx.send(Message::Done);
        }

        for handle in handles {
            if handle.join().is_err() {
                panicked += 1;
            }
        }
    });

    if let Some(e) = read_error {
        return Err(e);
    }
    if panicked > 0 {
        return Err(io::Error::other(format!(
            "{panicked} ingestion worker(s) panicked"
        )));
    }

    let counters = &session.counters;
    let mut summary = IngestSummary {
        lines_read: header_lines + data_lines,
        records_read: counters.records_read.load(Ordering::Relaxed),
        records_skipped: counters.records_skipped.load(Ordering::Relaxed),
        records_errored: counters.records_errored.load(Ordering::Relaxed),
        samples_skipped: counters.samples_skipped.load(Ordering::Relaxed),
        missing_contigs: session
            .missing_contigs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len(),
        atomic_edits: counters.atomic_edits.load(Ordering::Relaxed),
        duplicate_offsets: counters.duplicate_offsets.load(Ordering::Relaxed),
        ..IngestSummary::default()
    };
    info!(
        "Ingested {} records ({} skipped, {} errored) into {} atomic edits in {:.2?}",
        summary.records_read,
        summary.records_skipped,
        summary.records_errored,
        summary.atomic_edits,
        start_time.elapsed()
    );

    if config.aggregate {
        let stats = aggregate_population(population, &config.compound_kinds, config.quality_policy);
        summary.compound_variants = stats.compounds;
        summary.aggregation_conflicts = stats.conflicts;
        summary.duplicate_edits = stats.duplicates;
    }

    Ok(summary)
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AggregationStats {
    pub compounds: usize,
    pub atomic: usize,
    pub conflicts: usize,
    pub duplicates: usize,
}

impl AggregationStats {
    fn merge(self, other: Self) -> Self {
        AggregationStats {
            compounds: self.compounds + other.compounds,
            atomic: self.atomic + other.atomic,
            conflicts: self.conflicts + other.conflicts,
            duplicates: self.duplicates + other.duplicates,
        }
    }
}

/// Replace the atomic edits of `kinds` in every slot by their compound
/// aggregation. Slots are processed in parallel on the rayon pool.
pub fn aggregate_population(
    population: &Population,
    kinds: &[EditKind],
    policy: QualityPolicy,
) -> AggregationStats {
    let start_time = Instant::now();
    let stats = population
        .slots()
        .par_iter()
        .map(|(_, slot)| {
            let edits = slot.drain_atomic(kinds);
            let aggregation = compound::create(edits, kinds, policy);
            let stats = AggregationStats {
                compounds: aggregation.compounds.len(),
                atomic: aggregation.atomic.len(),
                conflicts: aggregation.conflicts,
                duplicates: aggregation.duplicates,
            };
            for compound in aggregation.compounds {
                slot.insert(Variant::from(compound));
            }
            for edit in aggregation.atomic {
                slot.insert(Variant::from(edit));
            }
            stats
        })
        .reduce(AggregationStats::default, AggregationStats::merge);

    info!(
        "Aggregated {} compound variants ({} atomic edits left, {} conflicts) in {:.2?}",
        stats.compounds,
        stats.atomic,
        stats.conflicts,
        start_time.elapsed()
    );
    stats
}
