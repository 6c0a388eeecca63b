use clap::Parser;
use log::info;
use rayon::ThreadPoolBuilder;
use std::io::{self, BufWriter, Write};
use std::num::NonZeroUsize;
use varcomp::annotation::{CodingAnnotation, GeneIntervals, NoAnnotation};
use varcomp::compound::QualityPolicy;
use varcomp::ingest::{self, IngestConfig, IngestSummary, DEFAULT_GENOME, DEFAULT_QUEUE_CAPACITY};
use varcomp::reference::FastaReference;
use varcomp::store::Population;
use varcomp::variant::{EditKind, Variant};

/// Common options shared between all commands
#[derive(Parser, Debug)]
struct CommonOpts {
    /// Number of threads for ingestion workers and aggregation (defaults to available CPUs).
    #[clap(short = 't', long, value_parser)]
    num_threads: Option<NonZeroUsize>,

    /// Verbosity level (-v = info, -vv = debug)
    #[clap(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

/// Command-line tool for decomposing VCF variant calls into atomic and compound edits.
#[derive(Parser, Debug)]
#[command(author, version, about, disable_help_subcommand = true)]
enum Args {
    /// Ingest a VCF file and report the variants it produces
    Ingest {
        #[clap(flatten)]
        common: CommonOpts,

        /// Path to the VCF file (plain, .gz or .bgz)
        #[clap(short = 'i', long, value_parser)]
        vcf_file: String,

        /// Reference FASTA file(s); indexed with faidx if no .fai exists
        #[clap(short = 'r', long, value_parser, num_args = 1.., required = true)]
        reference: Vec<String>,

        /// BED6 gene annotation used to pick compound canonical offsets
        #[clap(short = 'g', long, value_parser)]
        genes: Option<String>,

        /// Lines buffered between the reader and the workers
        #[clap(long, value_parser, default_value_t = DEFAULT_QUEUE_CAPACITY)]
        queue_capacity: usize,

        /// Edit kinds merged into compound variants
        #[clap(long, value_parser = parse_edit_kind, value_delimiter = ',', default_value = "insert,delete,substitution")]
        compound_kinds: Vec<EditKind>,

        /// How constituent qualities combine into a compound quality (min, mean, first)
        #[clap(long, value_parser, default_value = "min")]
        quality_policy: QualityPolicy,

        /// Genome name for sites-only VCFs
        #[clap(long, value_parser, default_value = DEFAULT_GENOME)]
        default_genome: String,

        /// Keep every edit atomic
        #[clap(long, action)]
        no_aggregate: bool,

        /// Print every stored variant as TSV
        #[clap(long, action)]
        dump: bool,
    },
}

fn parse_edit_kind(s: &str) -> Result<EditKind, String> {
    EditKind::parse(s).ok_or_else(|| {
        format!("Unknown edit kind '{s}' (expected insert, delete or substitution)")
    })
}

fn main() -> io::Result<()> {
    let args = Args::parse();

    match args {
        Args::Ingest {
            common,
            vcf_file,
            reference,
            genes,
            queue_capacity,
            compound_kinds,
            quality_policy,
            default_genome,
            no_aggregate,
            dump,
        } => {
            let workers = initialize(&common)?;

            let reference = FastaReference::build_from_files(&reference)?;
            let annotation: Box<dyn CodingAnnotation> = match genes {
                Some(bed) => {
                    let genes = GeneIntervals::from_bed_file(&bed)?;
                    info!("Loaded {} genes from {}", genes.gene_count(), bed);
                    Box::new(genes)
                }
                None => Box::new(NoAnnotation),
            };

            let config = IngestConfig {
                workers: Some(workers),
                queue_capacity,
                compound_kinds,
                quality_policy,
                default_genome,
                aggregate: !no_aggregate,
            };
            let population = Population::new();
            let summary = ingest::ingest_path(
                &vcf_file,
                &population,
                &reference,
                annotation.as_ref(),
                &config,
            )?;

            let stdout = io::stdout();
            let mut out = BufWriter::new(stdout.lock());
            if dump {
                write_variants(&mut out, &population)?;
            } else {
                write_summary(&mut out, &summary)?;
                write_counts(&mut out, &population)?;
            }
            out.flush()?;
        }
    }

    Ok(())
}

/// Initialize logging and the rayon pool, returning the worker count
fn initialize(common: &CommonOpts) -> io::Result<usize> {
    env_logger::Builder::new()
        .filter_level(match common.verbose {
            0 => log::LevelFilter::Error,
            1 => log::LevelFilter::Info,
            _ => log::LevelFilter::Debug,
        })
        .init();

    let workers = IngestConfig {
        workers: common.num_threads.map(NonZeroUsize::get),
        ..IngestConfig::default()
    }
    .worker_count();

    ThreadPoolBuilder::new()
        .num_threads(workers)
        .build_global()
        .map_err(|e| io::Error::other(format!("Failed to build thread pool: {e}")))?;

    Ok(workers)
}

fn write_summary<W: Write>(out: &mut W, summary: &IngestSummary) -> io::Result<()> {
    writeln!(out, "Lines read: {}", summary.lines_read)?;
    writeln!(out, "Records read: {}", summary.records_read)?;
    writeln!(out, "Records skipped: {}", summary.records_skipped)?;
    writeln!(out, "Records errored: {}", summary.records_errored)?;
    writeln!(out, "Samples skipped: {}", summary.samples_skipped)?;
    writeln!(out, "Missing contigs: {}", summary.missing_contigs)?;
    writeln!(out, "Atomic edits: {}", summary.atomic_edits)?;
    writeln!(out, "Compound variants: {}", summary.compound_variants)?;
    writeln!(out, "Duplicate indel offsets: {}", summary.duplicate_offsets)?;
    writeln!(out, "Aggregation conflicts: {}", summary.aggregation_conflicts)?;
    writeln!(out, "Duplicate edits: {}", summary.duplicate_edits)?;
    Ok(())
}

/// (genome name, contig name, slot) sorted naturally by name
fn named_slots(
    population: &Population,
) -> Vec<(String, String, std::sync::Arc<varcomp::store::ContigSlot>)> {
    let mut slots: Vec<_> = population
        .slots()
        .into_iter()
        .filter_map(|((genome, contig), slot)| {
            Some((
                population.genome_name(genome)?,
                population.contig_name(contig)?,
                slot,
            ))
        })
        .collect();
    slots.sort_by(|a, b| natord::compare(&a.0, &b.0).then_with(|| natord::compare(&a.1, &b.1)));
    slots
}

fn write_counts<W: Write>(out: &mut W, population: &Population) -> io::Result<()> {
    writeln!(out, "\ngenome\tcontig\tSUB\tINS\tDEL\tCOMPOUND\ttotal")?;
    for (genome, contig, slot) in named_slots(population) {
        let counts = slot.counts();
        writeln!(
            out,
            "{}\t{}\t{}\t{}\t{}\t{}\t{}",
            genome,
            contig,
            counts.substitutions,
            counts.inserts,
            counts.deletes,
            counts.compounds,
            counts.total()
        )?;
    }
    Ok(())
}

fn write_variants<W: Write>(out: &mut W, population: &Population) -> io::Result<()> {
    writeln!(out, "genome\tcontig\toffset\tphase\ttype\tref\talt\tlength\tquality\tsource_pos")?;
    for (genome, contig, slot) in named_slots(population) {
        for variant in slot.variants() {
            let (reference, alternate, length, quality, source_pos) = match &variant {
                Variant::Substitution(e) | Variant::Insert(e) | Variant::Delete(e) => (
                    e.ref_text(),
                    e.alt_text(),
                    1,
                    e.evidence.quality,
                    e.evidence.source_pos,
                ),
                Variant::Compound(c) => (
                    c.ref_text(),
                    c.alt_text(),
                    c.len(),
                    c.quality,
                    c.edits.first().map_or(0, |e| e.evidence.source_pos),
                ),
            };
            let quality = quality.map_or_else(|| ".".to_string(), |q| format!("{q:.2}"));
            writeln!(
                out,
                "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
                genome,
                contig,
                variant.offset(),
                variant.phase(),
                variant.label(),
                if reference.is_empty() { "-" } else { &reference },
                if alternate.is_empty() { "-" } else { &alternate },
                length,
                quality,
                source_pos
            )?;
        }
    }
    Ok(())
}
