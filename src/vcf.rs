//! VCF header and record tokenizing.
//!
//! The header is read once, up to and including the `#CHROM` line, before any
//! data line is handed to the ingestion workers. Data lines are tokenized
//! independently into immutable [`VcfRecord`]s.

use log::debug;
use regex::Regex;
use std::io::{self, BufRead};
use std::num::{ParseFloatError, ParseIntError};
use std::sync::OnceLock;

/// Number of mandatory columns (CHROM..INFO)
pub const MANDATORY_COLUMNS: usize = 8;
/// Index of the first sample column
pub const FIRST_SAMPLE_COLUMN: usize = 9;
pub const HEADER_PREFIX: &str = "#CHROM";

#[derive(Debug)]
pub enum ParseErr {
    NotEnoughFields(usize),
    ColumnCountMismatch { expected: usize, found: usize },
    InvalidPosition(ParseIntError),
    ZeroPosition,
    InvalidQuality(ParseFloatError),
    InvalidAllele(String),
    MissingHeader,
    InvalidHeader(String),
    IoError(io::Error),
}

impl std::fmt::Display for ParseErr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseErr::NotEnoughFields(found) => write!(
                f,
                "Not enough fields in VCF record: found {found}, need at least {MANDATORY_COLUMNS}"
            ),
            ParseErr::ColumnCountMismatch { expected, found } => write!(
                f,
                "Column count mismatch: expected {expected}, found {found}"
            ),
            ParseErr::InvalidPosition(e) => write!(f, "Invalid POS field: {e}"),
            ParseErr::ZeroPosition => write!(f, "POS must be 1-based"),
            ParseErr::InvalidQuality(e) => write!(f, "Invalid QUAL field: {e}"),
            ParseErr::InvalidAllele(allele) => write!(f, "Invalid REF allele '{allele}'"),
            ParseErr::MissingHeader => write!(f, "Missing '{HEADER_PREFIX}' header line"),
            ParseErr::InvalidHeader(msg) => write!(f, "Invalid header: {msg}"),
            ParseErr::IoError(e) => write!(f, "IO error: {e}"),
        }
    }
}

impl std::error::Error for ParseErr {}

impl From<ParseErr> for io::Error {
    fn from(e: ParseErr) -> Self {
        match e {
            ParseErr::IoError(e) => e,
            other => io::Error::new(io::ErrorKind::InvalidData, other.to_string()),
        }
    }
}

/// `##contig` metadata line
#[derive(Debug, Clone, PartialEq)]
pub struct ContigMeta {
    pub id: String,
    pub length: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct VcfHeader {
    /// Sample / genome names in column order
    pub samples: Vec<String>,
    pub contigs: Vec<ContigMeta>,
    pub meta_lines: usize,
}

impl VcfHeader {
    /// Number of tab-separated columns every data line must have.
    pub fn expected_columns(&self) -> Option<usize> {
        if self.samples.is_empty() {
            None
        } else {
            Some(FIRST_SAMPLE_COLUMN + self.samples.len())
        }
    }

    pub fn contig_length(&self, contig: &str) -> Option<u64> {
        self.contigs
            .iter()
            .find(|c| c.id == contig)
            .and_then(|c| c.length)
    }
}

fn contig_line_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^##contig=<(?:.*,)?ID=([^,>]+)(?:.*?,length=(\d+))?").expect("valid regex")
    })
}

fn parse_contig_line(line: &str) -> Option<ContigMeta> {
    let caps = contig_line_regex().captures(line)?;
    let id = caps.get(1)?.as_str().to_string();
    let length = caps.get(2).and_then(|m| m.as_str().parse::<u64>().ok());
    Some(ContigMeta { id, length })
}

/// Parse the `#CHROM` column line into sample names.
pub fn parse_column_line(line: &str) -> Result<Vec<String>, ParseErr> {
    let fields: Vec<&str> = line.trim_end_matches(['\n', '\r']).split('\t').collect();
    if fields.len() < MANDATORY_COLUMNS {
        return Err(ParseErr::InvalidHeader(format!(
            "expected at least {MANDATORY_COLUMNS} columns in '{HEADER_PREFIX}' line, found {}",
            fields.len()
        )));
    }
    Ok(fields
        .iter()
        .skip(FIRST_SAMPLE_COLUMN)
        .map(|s| s.to_string())
        .collect())
}

/// Consume header lines from `reader` up to and including `#CHROM`.
/// Returns the number of lines consumed alongside the header.
pub fn read_header<R: BufRead>(reader: &mut R) -> Result<(VcfHeader, usize), ParseErr> {
    let mut header = VcfHeader::default();
    let mut line = String::new();
    let mut lines_read = 0usize;

    loop {
        line.clear();
        let n = reader.read_line(&mut line).map_err(ParseErr::IoError)?;
        if n == 0 {
            return Err(ParseErr::MissingHeader);
        }
        lines_read += 1;

        let trimmed = line.trim_end_matches(['\n', '\r']);
        if trimmed.starts_with(HEADER_PREFIX) {
            header.samples = parse_column_line(trimmed)?;
            debug!(
                "Parsed VCF header: {} meta lines, {} contigs, {} samples",
                header.meta_lines,
                header.contigs.len(),
                header.samples.len()
            );
            return Ok((header, lines_read));
        } else if trimmed.starts_with("##") {
            header.meta_lines += 1;
            if let Some(contig) = parse_contig_line(trimmed) {
                header.contigs.push(contig);
            }
        } else if !trimmed.is_empty() {
            return Err(ParseErr::MissingHeader);
        }
    }
}

/// One tokenized data line. POS is stored 0-based in `offset`.
#[derive(Debug, Clone, PartialEq)]
pub struct VcfRecord {
    pub contig: String,
    pub offset: u64,
    pub id: Option<String>,
    pub reference: String,
    pub alternates: Vec<String>,
    pub quality: Option<f32>,
    pub filter: String,
    pub info: String,
    pub format: Option<String>,
    pub samples: Vec<String>,
}

impl VcfRecord {
    /// 1-based POS
    pub fn pos(&self) -> u64 {
        self.offset + 1
    }

    /// `Some(Some(v))` for `KEY=v`, `Some(None)` for a bare flag.
    pub fn info_value(&self, key: &str) -> Option<Option<&str>> {
        if self.info == "." {
            return None;
        }
        self.info.split(';').find_map(|entry| match entry.split_once('=') {
            Some((k, v)) if k == key => Some(Some(v)),
            None if entry == key => Some(None),
            _ => None,
        })
    }

    pub fn info_flag(&self, key: &str) -> bool {
        self.info_value(key).is_some()
    }

    pub fn format_keys(&self) -> Vec<&str> {
        self.format
            .as_deref()
            .map(|f| f.split(':').collect())
            .unwrap_or_default()
    }

    /// Value of FORMAT field `key` for the sample in column `sample_idx`.
    /// Trailing fields may be dropped in a sample column.
    pub fn sample_field(&self, sample_idx: usize, key: &str) -> Option<&str> {
        let position = self.format_keys().iter().position(|k| *k == key)?;
        let sample = self.samples.get(sample_idx)?;
        sample.split(':').nth(position)
    }

    pub fn filter_pass(&self) -> bool {
        self.filter == "PASS" || self.filter == "."
    }
}

/// Split a data line into a [`VcfRecord`].
///
/// `sample_count` comes from the header; when non-zero every line must carry
/// FORMAT plus exactly that many sample columns.
pub fn parse_vcf_line(line: &str, sample_count: usize) -> Result<VcfRecord, ParseErr> {
    let line = line.trim_end_matches(['\n', '\r']);
    let fields: Vec<&str> = line.split('\t').collect();
    if fields.len() < MANDATORY_COLUMNS {
        return Err(ParseErr::NotEnoughFields(fields.len()));
    }
    if sample_count > 0 {
        let expected = FIRST_SAMPLE_COLUMN + sample_count;
        if fields.len() != expected {
            return Err(ParseErr::ColumnCountMismatch {
                expected,
                found: fields.len(),
            });
        }
    } else if fields.len() > FIRST_SAMPLE_COLUMN {
        return Err(ParseErr::ColumnCountMismatch {
            expected: FIRST_SAMPLE_COLUMN,
            found: fields.len(),
        });
    }

    let pos = fields[1].parse::<u64>().map_err(ParseErr::InvalidPosition)?;
    if pos == 0 {
        return Err(ParseErr::ZeroPosition);
    }

    let reference = fields[3].to_ascii_uppercase();
    if reference.is_empty() || reference == "." || !reference.bytes().all(|b| b.is_ascii_alphabetic()) {
        return Err(ParseErr::InvalidAllele(fields[3].to_string()));
    }

    let alternates = match fields[4] {
        "." | "" => Vec::new(),
        alts => alts.split(',').map(|a| a.to_ascii_uppercase()).collect(),
    };

    let quality = match fields[5] {
        "." | "" => None,
        q => Some(q.parse::<f32>().map_err(ParseErr::InvalidQuality)?),
    };

    let id = match fields[2] {
        "." | "" => None,
        id => Some(id.to_string()),
    };

    Ok(VcfRecord {
        contig: fields[0].to_string(),
        offset: pos - 1,
        id,
        reference,
        alternates,
        quality,
        filter: fields[6].to_string(),
        info: fields[7].to_string(),
        format: fields.get(8).map(|s| s.to_string()),
        samples: fields
            .iter()
            .skip(FIRST_SAMPLE_COLUMN)
            .map(|s| s.to_string())
            .collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str = "##fileformat=VCFv4.2\n\
        ##contig=<ID=chr1,length=248956422>\n\
        ##contig=<ID=chrM>\n\
        ##INFO=<ID=DP,Number=1,Type=Integer,Description=\"Depth\">\n\
        #CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO\tFORMAT\tsample1\tsample2\n\
        chr1\t100\t.\tA\tAT\t50\t.\tDP=10\tGT\t0/1\t1|1\n";

    #[test]
    fn test_read_header() {
        let mut reader = HEADER.as_bytes();
        let (header, lines) = read_header(&mut reader).unwrap();
        assert_eq!(lines, 5);
        assert_eq!(header.samples, vec!["sample1", "sample2"]);
        assert_eq!(header.meta_lines, 4);
        assert_eq!(
            header.contigs,
            vec![
                ContigMeta {
                    id: "chr1".to_string(),
                    length: Some(248956422)
                },
                ContigMeta {
                    id: "chrM".to_string(),
                    length: None
                },
            ]
        );
        assert_eq!(header.expected_columns(), Some(11));

        // The reader is left at the first data line
        let mut rest = String::new();
        reader.read_line(&mut rest).unwrap();
        assert!(rest.starts_with("chr1\t100"));
    }

    #[test]
    fn test_read_header_missing() {
        let mut reader = "##fileformat=VCFv4.2\nchr1\t1\t.\tA\tC\t.\t.\t.\n".as_bytes();
        assert!(matches!(
            read_header(&mut reader),
            Err(ParseErr::MissingHeader)
        ));
        let mut empty = "".as_bytes();
        assert!(matches!(read_header(&mut empty), Err(ParseErr::MissingHeader)));
    }

    #[test]
    fn test_parse_vcf_line_valid() {
        let line = "chr1\t100\trs1\ta\tAT,G\t50\tPASS\tDP=10;SOMATIC\tGT:GQ\t0/1:30\n";
        let record = parse_vcf_line(line, 1).unwrap();
        assert_eq!(record.contig, "chr1");
        assert_eq!(record.offset, 99);
        assert_eq!(record.pos(), 100);
        assert_eq!(record.id.as_deref(), Some("rs1"));
        assert_eq!(record.reference, "A");
        assert_eq!(record.alternates, vec!["AT", "G"]);
        assert_eq!(record.quality, Some(50.0));
        assert!(record.filter_pass());
        assert_eq!(record.info_value("DP"), Some(Some("10")));
        assert_eq!(record.info_value("SOMATIC"), Some(None));
        assert!(record.info_flag("SOMATIC"));
        assert_eq!(record.info_value("AF"), None);
        assert_eq!(record.format_keys(), vec!["GT", "GQ"]);
        assert_eq!(record.sample_field(0, "GQ"), Some("30"));
        assert_eq!(record.sample_field(0, "DP"), None);
        assert_eq!(record.sample_field(1, "GT"), None);
    }

    #[test]
    fn test_parse_vcf_line_sites_only() {
        let record = parse_vcf_line("chr2\t5\t.\tG\t.\t.\tq10\t.", 0).unwrap();
        assert!(record.alternates.is_empty());
        assert_eq!(record.quality, None);
        assert!(!record.filter_pass());
        assert!(record.format.is_none());
        assert_eq!(record.info_value("DP"), None);
    }

    #[test]
    fn test_parse_vcf_line_errors() {
        assert!(matches!(
            parse_vcf_line("chr1\t100\t.\tA", 0),
            Err(ParseErr::NotEnoughFields(4))
        ));
        assert!(matches!(
            parse_vcf_line("chr1\t100\t.\tA\tC\t50\t.\t.\tGT", 2),
            Err(ParseErr::ColumnCountMismatch {
                expected: 11,
                found: 9
            })
        ));
        assert!(matches!(
            parse_vcf_line("chr1\tx\t.\tA\tC\t50\t.\t.", 0),
            Err(ParseErr::InvalidPosition(_))
        ));
        assert!(matches!(
            parse_vcf_line("chr1\t0\t.\tA\tC\t50\t.\t.", 0),
            Err(ParseErr::ZeroPosition)
        ));
        assert!(matches!(
            parse_vcf_line("chr1\t1\t.\tA\tC\thigh\t.\t.", 0),
            Err(ParseErr::InvalidQuality(_))
        ));
        assert!(matches!(
            parse_vcf_line("chr1\t1\t.\t.\tC\t1\t.\t.", 0),
            Err(ParseErr::InvalidAllele(_))
        ));
    }
}
