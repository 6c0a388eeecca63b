//! Read-only access to reference contig sequences.
//!
//! Decomposition validates every reference base a variant touches against a
//! [`ReferenceProvider`]. Two providers are available: an in-memory one for
//! small genomes and tests, and an htslib faidx-backed one for indexed FASTA.

use rust_htslib::faidx;
use rustc_hash::FxHashMap;
use std::cell::RefCell;
use std::collections::HashMap;
use std::io::{self, BufRead};

/// Trait for reference sequence lookup. Coordinates are 0-based, half-open.
pub trait ReferenceProvider: Send + Sync {
    fn contig_length(&self, contig: &str) -> Option<usize>;

    /// Uppercase bases of `contig[start..end]`.
    fn fetch_sequence(&self, contig: &str, start: usize, end: usize) -> io::Result<Vec<u8>>;

    fn has_contig(&self, contig: &str) -> bool {
        self.contig_length(contig).is_some()
    }

    fn base_at(&self, contig: &str, offset: usize) -> io::Result<u8> {
        let seq = self.fetch_sequence(contig, offset, offset + 1)?;
        seq.first().copied().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("Offset {offset} is past the end of contig '{contig}'"),
            )
        })
    }
}

fn out_of_range(contig: &str, start: usize, end: usize, len: usize) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("Range {start}-{end} is outside contig '{contig}' of length {len}"),
    )
}

/// Contig sequences held in memory, keyed by name.
#[derive(Debug, Default, Clone)]
pub struct InMemoryReference {
    contigs: FxHashMap<String, Vec<u8>>,
}

impl InMemoryReference {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: &str, sequence: &[u8]) {
        self.contigs
            .insert(name.to_string(), sequence.to_ascii_uppercase());
    }

    pub fn with_contig(mut self, name: &str, sequence: &[u8]) -> Self {
        self.insert(name, sequence);
        self
    }

    /// Parse an uncompressed multi-FASTA stream. The contig name is the first
    /// whitespace-delimited word of each `>` line.
    pub fn from_fasta<R: BufRead>(reader: R) -> io::Result<Self> {
        let mut reference = Self::new();
        let mut current: Option<(String, Vec<u8>)> = None;

        for line in reader.lines() {
            let line = line?;
            let line = line.trim_end();
            if let Some(header) = line.strip_prefix('>') {
                if let Some((name, seq)) = current.take() {
                    reference.contigs.insert(name, seq);
                }
                let name = header.split_whitespace().next().unwrap_or("").to_string();
                if name.is_empty() {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "FASTA record with an empty name",
                    ));
                }
                current = Some((name, Vec::new()));
            } else if !line.is_empty() {
                match current.as_mut() {
                    Some((_, seq)) => seq.extend(line.bytes().map(|b| b.to_ascii_uppercase())),
                    None => {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "FASTA sequence data before the first header",
                        ))
                    }
                }
            }
        }
        if let Some((name, seq)) = current {
            reference.contigs.insert(name, seq);
        }

        Ok(reference)
    }

    pub fn len(&self) -> usize {
        self.contigs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contigs.is_empty()
    }
}

impl ReferenceProvider for InMemoryReference {
    fn contig_length(&self, contig: &str) -> Option<usize> {
        self.contigs.get(contig).map(Vec::len)
    }

    fn fetch_sequence(&self, contig: &str, start: usize, end: usize) -> io::Result<Vec<u8>> {
        let seq = self.contigs.get(contig).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("Contig '{contig}' not found in reference"),
            )
        })?;
        if start > end || end > seq.len() {
            return Err(out_of_range(contig, start, end, seq.len()));
        }
        Ok(seq[start..end].to_vec())
    }
}

// Simple cache for FASTA file handles with random eviction
struct FaidxCache {
    capacity: usize,
    readers: HashMap<String, faidx::Reader>,
}

impl FaidxCache {
    fn new(capacity: usize) -> Self {
        FaidxCache {
            capacity,
            readers: HashMap::with_capacity(capacity),
        }
    }

    fn get_or_open(&mut self, path: &str) -> io::Result<&mut faidx::Reader> {
        if !self.readers.contains_key(path) {
            if self.readers.len() >= self.capacity {
                if let Some(key_to_remove) = self.readers.keys().next().cloned() {
                    self.readers.remove(&key_to_remove);
                }
            }
            let reader = faidx::Reader::from_path(path).map_err(|e| {
                io::Error::other(format!("Failed to open FASTA file '{path}': {e}"))
            })?;
            self.readers.insert(path.to_string(), reader);
        }

        self.readers
            .get_mut(path)
            .ok_or_else(|| io::Error::other(format!("FASTA reader for '{path}' was evicted")))
    }
}

thread_local! {
    // One reader per FASTA per ingestion worker
    static FAIDX_CACHE: RefCell<FaidxCache> = RefCell::new(FaidxCache::new(8));
}

/// Indexed FASTA reference, possibly split across several files.
///
/// Only the `.fai` indices are read up front; sequence is fetched on demand
/// through a per-thread htslib reader, so the provider is shared across
/// ingestion workers without locking.
#[derive(Debug)]
pub struct FastaReference {
    fasta_paths: Vec<String>,
    contig_to_fasta: FxHashMap<String, usize>,
    contig_lengths: FxHashMap<String, usize>,
}

impl FastaReference {
    pub fn build_from_files(fasta_files: &[String]) -> io::Result<Self> {
        if fasta_files.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "No reference FASTA files provided",
            ));
        }

        let mut reference = FastaReference {
            fasta_paths: Vec::with_capacity(fasta_files.len()),
            contig_to_fasta: FxHashMap::default(),
            contig_lengths: FxHashMap::default(),
        };

        for (fasta_idx, fasta_path) in fasta_files.iter().enumerate() {
            reference.fasta_paths.push(fasta_path.clone());

            let fai_path = format!("{fasta_path}.fai");
            let fai_content = match std::fs::read_to_string(&fai_path) {
                Ok(content) => content,
                Err(_) => {
                    // Opening through htslib builds the missing index
                    faidx::Reader::from_path(fasta_path).map_err(|e| {
                        io::Error::other(format!(
                            "Failed to create FASTA index for '{fasta_path}': {e}"
                        ))
                    })?;
                    std::fs::read_to_string(&fai_path)?
                }
            };

            for line in fai_content.lines() {
                let fields: Vec<&str> = line.split('\t').collect();
                if fields.len() < 2 || fields[0].is_empty() {
                    continue;
                }
                reference
                    .contig_to_fasta
                    .insert(fields[0].to_string(), fasta_idx);
                if let Ok(length) = fields[1].parse::<usize>() {
                    reference
                        .contig_lengths
                        .insert(fields[0].to_string(), length);
                }
            }
        }

        Ok(reference)
    }

    fn fasta_path(&self, contig: &str) -> Option<&str> {
        self.contig_to_fasta
            .get(contig)
            .map(|&idx| self.fasta_paths[idx].as_str())
    }
}

impl ReferenceProvider for FastaReference {
    fn contig_length(&self, contig: &str) -> Option<usize> {
        self.contig_lengths.get(contig).copied()
    }

    fn fetch_sequence(&self, contig: &str, start: usize, end: usize) -> io::Result<Vec<u8>> {
        let fasta_path = self.fasta_path(contig).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("Contig '{contig}' not found in any FASTA file"),
            )
        })?;
        let len = self.contig_length(contig).unwrap_or(0);
        if start > end || end > len {
            return Err(out_of_range(contig, start, end, len));
        }
        if start == end {
            return Ok(Vec::new());
        }

        FAIDX_CACHE.with(|cache_cell| -> io::Result<Vec<u8>> {
            let mut cache = cache_cell.borrow_mut();
            let reader = cache.get_or_open(fasta_path)?;

            // fetch_seq takes an inclusive end coordinate
            match reader.fetch_seq(contig, start, end - 1) {
                Ok(seq) => {
                    let mut seq_vec = seq.to_vec();
                    unsafe { libc::free(seq.as_ptr() as *mut std::ffi::c_void) }; // htslib hands back an owned buffer (https://github.com/rust-bio/rust-htslib/issues/401)
                    seq_vec.make_ascii_uppercase();
                    Ok(seq_vec)
                }
                Err(e) => Err(io::Error::other(format!(
                    "Failed to fetch sequence for {contig}:{start}-{end}: {e}"
                ))),
            }
        })
    }
}
