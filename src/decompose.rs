//! Decomposition of VCF alleles into atomic, reference-validated edits.

use crate::annotation::CodingAnnotation;
use crate::cigar::{check_consumption, compute_edit_script, parse_cigar, CigarErr, CigarOp};
use crate::ledger::{shifted, LedgerBook};
use crate::reference::ReferenceProvider;
use crate::variant::{AtomicEdit, ContigId, EditKind, Evidence, GenomeId, Phase};
use crate::vcf::VcfRecord;
use log::{debug, warn};
use std::fmt;

#[derive(Debug)]
pub enum DecomposeErr {
    ReferenceMismatch {
        contig: String,
        offset: u64,
        expected: char,
        found: char,
    },
    ReferenceFetch(String),
    Cigar(CigarErr),
    AltMismatch { offset: u64, op: char },
    InvalidInfo { key: &'static str, value: String },
}

impl fmt::Display for DecomposeErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecomposeErr::ReferenceMismatch {
                contig,
                offset,
                expected,
                found,
            } => write!(
                f,
                "REF base '{expected}' disagrees with reference base '{found}' at {contig}:{}",
                offset + 1
            ),
            DecomposeErr::ReferenceFetch(msg) => write!(f, "Reference lookup failed: {msg}"),
            DecomposeErr::Cigar(e) => write!(f, "{e}"),
            DecomposeErr::AltMismatch { offset, op } => write!(
                f,
                "ALT base at reference offset {offset} contradicts CIGAR operation '{op}'"
            ),
            DecomposeErr::InvalidInfo { key, value } => {
                write!(f, "Invalid INFO value {key}={value}")
            }
        }
    }
}

impl std::error::Error for DecomposeErr {}

impl From<CigarErr> for DecomposeErr {
    fn from(e: CigarErr) -> Self {
        DecomposeErr::Cigar(e)
    }
}

/// Problems confined to one sample column; the rest of the record survives.
#[derive(Debug, PartialEq)]
pub enum SampleErr {
    MissingFormatKey(&'static str),
    InvalidGenotype(String),
    InvalidNumeric { key: &'static str, value: String },
}

impl fmt::Display for SampleErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SampleErr::MissingFormatKey(key) => write!(f, "FORMAT lacks required key {key}"),
            SampleErr::InvalidGenotype(gt) => write!(f, "Invalid genotype '{gt}'"),
            SampleErr::InvalidNumeric { key, value } => {
                write!(f, "Non-numeric {key} value '{value}'")
            }
        }
    }
}

impl std::error::Error for SampleErr {}

/// One base of an allele pair after walking its edit script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaseEdit {
    NoOp { ref_offset: u64, base: u8 },
    Substitution { ref_offset: u64, ref_base: u8, alt_base: u8 },
    /// `anchor` is the reference offset the run is inserted before; `offset`
    /// is the anchor plus the base's rank within the run
    Insert { anchor: u64, offset: u64, alt_base: u8 },
    Delete { ref_offset: u64, ref_base: u8 },
}

impl BaseEdit {
    pub fn kind(&self) -> Option<EditKind> {
        match self {
            BaseEdit::NoOp { .. } => None,
            BaseEdit::Substitution { .. } => Some(EditKind::Substitution),
            BaseEdit::Insert { .. } => Some(EditKind::Insert),
            BaseEdit::Delete { .. } => Some(EditKind::Delete),
        }
    }
}

/// Validated decomposition of one REF/ALT pair.
#[derive(Debug, Clone, PartialEq)]
pub struct AlleleDecomposition {
    pub alt_index: usize,
    pub script: Vec<CigarOp>,
    pub edits: Vec<BaseEdit>,
    /// ALT length minus REF length
    pub delta: i64,
}

impl AlleleDecomposition {
    fn count(&self, kind: Option<EditKind>) -> usize {
        self.edits.iter().filter(|e| e.kind() == kind).count()
    }

    pub fn matches(&self) -> usize {
        self.count(None)
    }

    pub fn substitutions(&self) -> usize {
        self.count(Some(EditKind::Substitution))
    }

    pub fn inserts(&self) -> usize {
        self.count(Some(EditKind::Insert))
    }

    pub fn deletes(&self) -> usize {
        self.count(Some(EditKind::Delete))
    }
}

/// ALT alleles that do not spell out bases: `<DEL>`, `*`, `.`, breakends.
pub fn is_symbolic(alt: &str) -> bool {
    alt.is_empty()
        || alt == "*"
        || alt == "."
        || alt.starts_with('<')
        || alt.contains('[')
        || alt.contains(']')
        || !alt.bytes().all(|b| b.is_ascii_alphabetic())
}

fn bases_agree(allele_base: u8, reference_base: u8) -> bool {
    allele_base.eq_ignore_ascii_case(&reference_base)
        || allele_base.eq_ignore_ascii_case(&b'N')
        || reference_base.eq_ignore_ascii_case(&b'N')
}

/// Walk `script` over a REF/ALT pair anchored at 0-based `offset`, checking
/// every consumed REF base against the reference.
pub fn decompose_allele(
    contig: &str,
    offset: u64,
    reference_allele: &[u8],
    alternate: &[u8],
    script: Vec<CigarOp>,
    reference: &dyn ReferenceProvider,
) -> Result<AlleleDecomposition, DecomposeErr> {
    check_consumption(&script, reference_allele.len(), alternate.len())?;

    let start = offset as usize;
    let region = reference
        .fetch_sequence(contig, start, start + reference_allele.len())
        .map_err(|e| DecomposeErr::ReferenceFetch(e.to_string()))?;

    let validate = |rc: usize| -> Result<u8, DecomposeErr> {
        let expected = reference_allele[rc];
        let found = region[rc];
        if bases_agree(expected, found) {
            Ok(expected.to_ascii_uppercase())
        } else {
            Err(DecomposeErr::ReferenceMismatch {
                contig: contig.to_string(),
                offset: offset + rc as u64,
                expected: expected as char,
                found: found as char,
            })
        }
    };

    let mut edits = Vec::with_capacity(reference_allele.len().max(alternate.len()));
    let (mut rc, mut ac) = (0usize, 0usize);

    for op in &script {
        match op.op() {
            '=' | 'X' | 'M' => {
                for _ in 0..op.len() {
                    let ref_base = validate(rc)?;
                    let alt_base = alternate[ac].to_ascii_uppercase();
                    let ref_offset = offset + rc as u64;
                    let same = ref_base == alt_base;
                    match (op.op(), same) {
                        ('=', false) | ('X', true) => {
                            return Err(DecomposeErr::AltMismatch {
                                offset: ref_offset,
                                op: op.op(),
                            })
                        }
                        (_, true) => edits.push(BaseEdit::NoOp {
                            ref_offset,
                            base: ref_base,
                        }),
                        (_, false) => edits.push(BaseEdit::Substitution {
                            ref_offset,
                            ref_base,
                            alt_base,
                        }),
                    }
                    rc += 1;
                    ac += 1;
                }
            }
            'I' => {
                let cursor = offset + rc as u64;
                for k in 0..op.len() {
                    edits.push(BaseEdit::Insert {
                        anchor: cursor,
                        offset: cursor + k as u64,
                        alt_base: alternate[ac].to_ascii_uppercase(),
                    });
                    ac += 1;
                }
            }
            'D' => {
                for _ in 0..op.len() {
                    let ref_base = validate(rc)?;
                    edits.push(BaseEdit::Delete {
                        ref_offset: offset + rc as u64,
                        ref_base,
                    });
                    rc += 1;
                }
            }
            other => return Err(CigarErr::UnsupportedCigarOperation(other).into()),
        }
    }

    Ok(AlleleDecomposition {
        alt_index: 0,
        script,
        edits,
        delta: alternate.len() as i64 - reference_allele.len() as i64,
    })
}

/// Edit script for ALT `alt_index`: INFO `CIGAR` if present, else computed.
fn edit_script(record: &VcfRecord, alt_index: usize) -> Result<Vec<CigarOp>, CigarErr> {
    let explicit = record
        .info_value("CIGAR")
        .flatten()
        .and_then(|cigars| cigars.split(',').nth(alt_index))
        .filter(|c| !c.is_empty() && *c != ".");
    match explicit {
        Some(cigar) => parse_cigar(cigar),
        None => Ok(compute_edit_script(
            record.reference.as_bytes(),
            record.alternates[alt_index].as_bytes(),
        )),
    }
}

/// Decompose every ALT of `record`. Symbolic ALTs yield `None`; any failure
/// rejects the whole record.
pub fn decompose_record(
    record: &VcfRecord,
    reference: &dyn ReferenceProvider,
) -> Result<Vec<Option<AlleleDecomposition>>, DecomposeErr> {
    record
        .alternates
        .iter()
        .enumerate()
        .map(|(alt_index, alt)| -> Result<Option<AlleleDecomposition>, DecomposeErr> {
            if is_symbolic(alt) {
                debug!(
                    "Skipping symbolic ALT '{}' at {}:{}",
                    alt,
                    record.contig,
                    record.pos()
                );
                return Ok(None);
            }
            let script = edit_script(record, alt_index)?;
            let mut decomposition = decompose_allele(
                &record.contig,
                record.offset,
                record.reference.as_bytes(),
                alt.as_bytes(),
                script,
                reference,
            )?;
            decomposition.alt_index = alt_index;
            Ok(Some(decomposition))
        })
        .collect()
}

/// Genotype and per-sample numeric fields of one sample column.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SampleCall {
    /// Allele indices (0 = REF); `None` for `.`
    pub alleles: Vec<Option<usize>>,
    pub phased: bool,
    pub genotype_quality: Option<f32>,
    pub depth: Option<u32>,
    pub allele_depths: Vec<Option<u32>>,
}

fn parse_optional<T: std::str::FromStr>(
    key: &'static str,
    value: Option<&str>,
) -> Result<Option<T>, SampleErr> {
    match value {
        None | Some(".") | Some("") => Ok(None),
        Some(v) => v.parse::<T>().map(Some).map_err(|_| SampleErr::InvalidNumeric {
            key,
            value: v.to_string(),
        }),
    }
}

impl SampleCall {
    pub fn parse(record: &VcfRecord, sample_idx: usize) -> Result<Self, SampleErr> {
        if !record.format_keys().contains(&"GT") {
            return Err(SampleErr::MissingFormatKey("GT"));
        }
        let gt = record
            .sample_field(sample_idx, "GT")
            .ok_or(SampleErr::MissingFormatKey("GT"))?;

        let phased = gt.contains('|');
        let mut alleles = Vec::with_capacity(2);
        for allele in gt.split(['/', '|']) {
            if allele == "." {
                alleles.push(None);
                continue;
            }
            let idx = allele
                .parse::<usize>()
                .map_err(|_| SampleErr::InvalidGenotype(gt.to_string()))?;
            if idx > record.alternates.len() {
                return Err(SampleErr::InvalidGenotype(gt.to_string()));
            }
            alleles.push(Some(idx));
        }

        let allele_depths = match record.sample_field(sample_idx, "AD") {
            None | Some(".") | Some("") => Vec::new(),
            Some(ad) => ad
                .split(',')
                .map(|v| parse_optional::<u32>("AD", Some(v)))
                .collect::<Result<_, _>>()?,
        };

        Ok(SampleCall {
            alleles,
            phased,
            genotype_quality: parse_optional("GQ", record.sample_field(sample_idx, "GQ"))?,
            depth: parse_optional("DP", record.sample_field(sample_idx, "DP"))?,
            allele_depths,
        })
    }

    /// (0-based ALT index, phase) for every haplotype carrying an ALT.
    /// Unphased calls report each distinct ALT once.
    pub fn carriers(&self) -> Vec<(usize, Phase)> {
        let mut carried = Vec::new();
        if self.phased && self.alleles.len() == 2 {
            for (hap, allele) in self.alleles.iter().enumerate() {
                if let Some(idx) = allele.filter(|&a| a > 0) {
                    let phase = if hap == 0 { Phase::A } else { Phase::B };
                    carried.push((idx - 1, phase));
                }
            }
        } else {
            for idx in self.alleles.iter().flatten().filter(|&&a| a > 0) {
                if !carried.iter().any(|&(c, _)| c == idx - 1) {
                    carried.push((idx - 1, Phase::Unphased));
                }
            }
        }
        carried
    }
}

/// Evidence shared by every sample of a record.
pub fn record_evidence(record: &VcfRecord) -> Result<Evidence, DecomposeErr> {
    let site_depth = match record.info_value("DP").flatten() {
        None | Some(".") => None,
        Some(dp) => Some(dp.parse::<u32>().map_err(|_| DecomposeErr::InvalidInfo {
            key: "DP",
            value: dp.to_string(),
        })?),
    };
    Ok(Evidence {
        quality: record.quality,
        site_depth,
        genotype_quality: None,
        sample_depth: None,
        allele_depth: None,
        filter_pass: record.filter_pass(),
        source_pos: record.pos(),
        record_id: record.id.clone(),
    })
}

/// `base` completed with the sample fields of the haplotypes carrying `alt`.
fn allele_evidence(base: &Evidence, call: Option<&SampleCall>, alt: usize) -> Evidence {
    let mut evidence = base.clone();
    if let Some(call) = call {
        evidence.genotype_quality = call.genotype_quality;
        evidence.sample_depth = call.depth;
        evidence.allele_depth = call.allele_depths.get(alt + 1).copied().flatten();
    }
    evidence
}

/// Genome a sample column (or a sites-only record) is attributed to.
#[derive(Debug, Clone, Copy)]
pub struct GenomeSlot {
    pub genome: GenomeId,
    /// `None` for sites-only input
    pub sample_idx: Option<usize>,
}

/// What one record contributed.
#[derive(Debug, Default)]
pub struct RecordEdits {
    pub edits: Vec<AtomicEdit>,
    pub samples_skipped: usize,
    pub duplicate_offsets: usize,
}

/// Turns validated decompositions into drift-corrected atomic edits.
pub struct Decomposer<'a> {
    pub reference: &'a dyn ReferenceProvider,
    pub annotation: &'a dyn CodingAnnotation,
    pub ledgers: &'a LedgerBook,
}

impl<'a> Decomposer<'a> {
    pub fn new(
        reference: &'a dyn ReferenceProvider,
        annotation: &'a dyn CodingAnnotation,
        ledgers: &'a LedgerBook,
    ) -> Self {
        Decomposer {
            reference,
            annotation,
            ledgers,
        }
    }

    /// Decompose `record` and emit edits for every genome carrying an ALT.
    /// Errors reject the whole record; sample-level problems only skip the sample.
    pub fn process_record(
        &self,
        record: &VcfRecord,
        contig: ContigId,
        genomes: &[GenomeSlot],
    ) -> Result<RecordEdits, DecomposeErr> {
        let decompositions = decompose_record(record, self.reference)?;
        let base_evidence = record_evidence(record)?;
        let mut out = RecordEdits::default();

        for slot in genomes {
            let (carriers, call) = match slot.sample_idx {
                None => {
                    let carriers = (0..record.alternates.len())
                        .map(|alt| (alt, Phase::Unphased))
                        .collect::<Vec<_>>();
                    (carriers, None)
                }
                Some(sample_idx) => match SampleCall::parse(record, sample_idx) {
                    Ok(call) => (call.carriers(), Some(call)),
                    Err(e) => {
                        debug!(
                            "Skipping sample {} at {}:{}: {}",
                            sample_idx,
                            record.contig,
                            record.pos(),
                            e
                        );
                        out.samples_skipped += 1;
                        continue;
                    }
                },
            };

            // Group haplotypes by ALT so each mutation hits the ledger once
            let mut by_alt: Vec<(&AlleleDecomposition, Vec<Phase>)> = Vec::new();
            for (alt, phase) in carriers {
                let Some(decomposition) = decompositions.get(alt).and_then(Option::as_ref) else {
                    continue;
                };
                match by_alt.iter_mut().find(|(d, _)| d.alt_index == alt) {
                    Some((_, phases)) => phases.push(phase),
                    None => by_alt.push((decomposition, vec![phase])),
                }
            }
            if by_alt.is_empty() {
                continue;
            }

            // Sibling ALTs share one shift; their deltas only apply downstream
            let deltas: Vec<i64> = by_alt.iter().map(|(d, _)| d.delta).collect();
            let (edits, rejected) = self.ledgers.with_mutations(
                slot.genome,
                contig,
                record.offset,
                &deltas,
                |shift| {
                    let mut edits = Vec::new();
                    for (decomposition, phases) in &by_alt {
                        let evidence =
                            allele_evidence(&base_evidence, call.as_ref(), decomposition.alt_index);
                        for &phase in phases {
                            edits.extend(self.build_edits(
                                decomposition,
                                &record.contig,
                                slot.genome,
                                contig,
                                phase,
                                shift,
                                &evidence,
                            ));
                        }
                    }
                    edits
                },
            );
            for e in rejected {
                warn!("{} ({}:{})", e, record.contig, record.pos());
                out.duplicate_offsets += 1;
            }
            out.edits.extend(edits);
        }

        Ok(out)
    }

    /// Atomic edits for one haplotype, shifted by the ledger adjustment.
    #[allow(clippy::too_many_arguments)]
    pub fn build_edits(
        &self,
        decomposition: &AlleleDecomposition,
        contig_name: &str,
        genome: GenomeId,
        contig: ContigId,
        phase: Phase,
        shift: i64,
        evidence: &Evidence,
    ) -> Vec<AtomicEdit> {
        decomposition
            .edits
            .iter()
            .filter_map(|edit| {
                // Inserted bases take the coding context of their anchor
                let (kind, ref_offset, context_offset, ref_base, alt_base) = match *edit {
                    BaseEdit::NoOp { .. } => return None,
                    BaseEdit::Substitution {
                        ref_offset,
                        ref_base,
                        alt_base,
                    } => (
                        EditKind::Substitution,
                        ref_offset,
                        ref_offset,
                        Some(ref_base),
                        Some(alt_base),
                    ),
                    BaseEdit::Insert {
                        anchor,
                        offset,
                        alt_base,
                    } => (EditKind::Insert, offset, anchor, None, Some(alt_base)),
                    BaseEdit::Delete {
                        ref_offset,
                        ref_base,
                    } => (EditKind::Delete, ref_offset, ref_offset, Some(ref_base), None),
                };
                Some(AtomicEdit {
                    genome,
                    contig,
                    phase,
                    offset: shifted(ref_offset, shift),
                    ref_offset,
                    kind,
                    ref_base,
                    alt_base,
                    coding: self.annotation.coding_context(contig_name, context_offset),
                    evidence: evidence.clone(),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotation::{GeneIntervals, NoAnnotation};
    use crate::compound::{self, QualityPolicy};
    use crate::reference::InMemoryReference;
    use crate::vcf::parse_vcf_line;

    //                    0         1         2
    //                    0123456789012345678901234
    const CHR1: &[u8] = b"GATTACAGATTACAGATTACAGATT";

    fn reference() -> InMemoryReference {
        InMemoryReference::new().with_contig("chr1", CHR1)
    }

    fn script(cigar: &str) -> Vec<CigarOp> {
        parse_cigar(cigar).unwrap()
    }

    #[test]
    fn test_decompose_3m2i1m() {
        let reference = reference();
        // REF TTAC at offset 2, ALT TTAGGC
        let d = decompose_allele("chr1", 2, b"TTAC", b"TTAGGC", script("3M2I1M"), &reference)
            .unwrap();
        assert_eq!(d.matches(), 4);
        assert_eq!(d.inserts(), 2);
        assert_eq!(d.substitutions(), 0);
        assert_eq!(d.deletes(), 0);
        assert_eq!(d.delta, 2);
        assert_eq!(
            &d.edits[3..5],
            &[
                BaseEdit::Insert {
                    anchor: 5,
                    offset: 5,
                    alt_base: b'G'
                },
                BaseEdit::Insert {
                    anchor: 5,
                    offset: 6,
                    alt_base: b'G'
                },
            ]
        );
        // Three matches precede the insertion and one follows it
        assert!(matches!(d.edits[2], BaseEdit::NoOp { ref_offset: 4, .. }));
        assert!(matches!(d.edits[5], BaseEdit::NoOp { ref_offset: 5, base: b'C' }));
    }

    #[test]
    fn test_single_mismatch_rejects_allele() {
        let reference = reference();
        // Offset 2 holds TTAC, claim TTGC
        let err = decompose_allele("chr1", 2, b"TTGC", b"TTGGGC", script("3M2I1M"), &reference)
            .unwrap_err();
        assert!(matches!(
            err,
            DecomposeErr::ReferenceMismatch {
                offset: 4,
                expected: 'G',
                found: 'A',
                ..
            }
        ));
    }

    #[test]
    fn test_deletion_validates_each_base() {
        let reference = reference();
        let d = decompose_allele("chr1", 0, b"GATT", b"G", script("1M3D"), &reference).unwrap();
        assert_eq!(d.deletes(), 3);
        assert_eq!(d.delta, -3);
        assert_eq!(
            d.edits[1],
            BaseEdit::Delete {
                ref_offset: 1,
                ref_base: b'A'
            }
        );

        let err = decompose_allele("chr1", 0, b"GACT", b"G", script("1M3D"), &reference)
            .unwrap_err();
        assert!(matches!(err, DecomposeErr::ReferenceMismatch { offset: 2, .. }));
    }

    #[test]
    fn test_substitution_and_cigar_disagreement() {
        let reference = reference();
        let d = decompose_allele("chr1", 4, b"ACA", b"AGT", script("3M"), &reference).unwrap();
        assert_eq!(d.substitutions(), 2);
        assert_eq!(d.matches(), 1);

        let err = decompose_allele("chr1", 4, b"ACA", b"AGA", script("3="), &reference)
            .unwrap_err();
        assert!(matches!(err, DecomposeErr::AltMismatch { offset: 5, op: '=' }));

        let err = decompose_allele("chr1", 4, b"ACA", b"AGA", script("3M1I"), &reference)
            .unwrap_err();
        assert!(matches!(err, DecomposeErr::Cigar(CigarErr::LengthMismatch { .. })));
    }

    #[test]
    fn test_computed_and_explicit_scripts_agree_on_consumption() {
        let reference = reference();
        let explicit =
            decompose_allele("chr1", 7, b"GATTA", b"GTA", script("1M2D2M"), &reference).unwrap();
        let computed = decompose_allele(
            "chr1",
            7,
            b"GATTA",
            b"GTA",
            compute_edit_script(b"GATTA", b"GTA"),
            &reference,
        )
        .unwrap();
        assert_eq!(explicit.delta, computed.delta);
        assert_eq!(explicit.deletes(), computed.deletes());
        assert_eq!(
            explicit.matches() + explicit.substitutions(),
            computed.matches() + computed.substitutions()
        );
    }

    #[test]
    fn test_reference_past_contig_end() {
        let reference = reference();
        let err = decompose_allele("chr1", 24, b"TA", b"T", script("1M1D"), &reference)
            .unwrap_err();
        assert!(matches!(err, DecomposeErr::ReferenceFetch(_)));
    }

    #[test]
    fn test_symbolic_alts() {
        assert!(is_symbolic("<DEL>"));
        assert!(is_symbolic("*"));
        assert!(is_symbolic("G]chr2:100]"));
        assert!(!is_symbolic("ACGT"));
    }

    #[test]
    fn test_sample_call_parsing() {
        let line = "chr1\t1\t.\tG\tA,C\t.\t.\t.\tGT:GQ:DP:AD\t0|1:30:12:5,7,0\t1/2:x:3:.\t./.\t1/1";
        let record = parse_vcf_line(line, 4).unwrap();

        let call = SampleCall::parse(&record, 0).unwrap();
        assert!(call.phased);
        assert_eq!(call.alleles, vec![Some(0), Some(1)]);
        assert_eq!(call.genotype_quality, Some(30.0));
        assert_eq!(call.depth, Some(12));
        assert_eq!(call.allele_depths, vec![Some(5), Some(7), Some(0)]);
        assert_eq!(call.carriers(), vec![(0, Phase::B)]);

        assert_eq!(
            SampleCall::parse(&record, 1),
            Err(SampleErr::InvalidNumeric {
                key: "GQ",
                value: "x".to_string()
            })
        );

        let missing = SampleCall::parse(&record, 2).unwrap();
        assert!(missing.carriers().is_empty());

        // Truncated trailing fields are allowed
        let hom = SampleCall::parse(&record, 3).unwrap();
        assert_eq!(hom.carriers(), vec![(0, Phase::Unphased)]);
    }

    #[test]
    fn test_sample_call_rejects_bad_genotype() {
        let record = parse_vcf_line("chr1\t1\t.\tG\tA\t.\t.\t.\tGT\t0/3", 1).unwrap();
        assert_eq!(
            SampleCall::parse(&record, 0),
            Err(SampleErr::InvalidGenotype("0/3".to_string()))
        );
        let record = parse_vcf_line("chr1\t1\t.\tG\tA\t.\t.\t.\tGQ\t10", 1).unwrap();
        assert_eq!(
            SampleCall::parse(&record, 0),
            Err(SampleErr::MissingFormatKey("GT"))
        );
    }

    #[test]
    fn test_process_record_insert_example() {
        let mut seq = vec![b'C'; 120];
        seq[99] = b'A';
        let reference = InMemoryReference::new().with_contig("chr1", &seq);
        let ledgers = LedgerBook::new();
        let decomposer = Decomposer::new(&reference, &NoAnnotation, &ledgers);

        let record = parse_vcf_line("chr1\t100\t.\tA\tAT\t50\t.\tDP=10\tGT\t0/1", 1).unwrap();
        let slots = [GenomeSlot {
            genome: GenomeId(0),
            sample_idx: Some(0),
        }];
        let out = decomposer.process_record(&record, ContigId(0), &slots).unwrap();
        assert_eq!(out.edits.len(), 1);
        let edit = &out.edits[0];
        assert_eq!(edit.kind, EditKind::Insert);
        assert_eq!(edit.offset, 100);
        assert_eq!(edit.alt_base, Some(b'T'));
        assert_eq!(edit.phase, Phase::Unphased);
        assert_eq!(edit.evidence.quality, Some(50.0));
        assert_eq!(edit.evidence.site_depth, Some(10));

        // The insertion shifts a later substitution by one
        let record = parse_vcf_line("chr1\t111\t.\tC\tG\t40\t.\t.\tGT\t1/1", 1).unwrap();
        let out = decomposer.process_record(&record, ContigId(0), &slots).unwrap();
        assert_eq!(out.edits.len(), 1);
        assert_eq!(out.edits[0].ref_offset, 110);
        assert_eq!(out.edits[0].offset, 111);
    }

    #[test]
    fn test_process_record_phased_and_skipped_samples() {
        let reference = reference();
        let ledgers = LedgerBook::new();
        let decomposer = Decomposer::new(&reference, &NoAnnotation, &ledgers);
        let record =
            parse_vcf_line("chr1\t1\t.\tGA\tG\t.\t.\t.\tGT\t1|1\tz/1", 2).unwrap();
        let slots = [
            GenomeSlot {
                genome: GenomeId(0),
                sample_idx: Some(0),
            },
            GenomeSlot {
                genome: GenomeId(1),
                sample_idx: Some(1),
            },
        ];
        let out = decomposer.process_record(&record, ContigId(0), &slots).unwrap();
        assert_eq!(out.samples_skipped, 1);
        assert_eq!(out.edits.len(), 2);
        assert_eq!(out.edits[0].phase, Phase::A);
        assert_eq!(out.edits[1].phase, Phase::B);
        assert!(out.edits.iter().all(|e| e.kind == EditKind::Delete && e.offset == 1));

        // Both haplotypes share one ledger entry
        let ledger = ledgers.snapshot(GenomeId(0), ContigId(0)).unwrap();
        assert_eq!(ledger.total_indel_offset(), -1);
        assert!(ledgers.snapshot(GenomeId(1), ContigId(0)).is_none());
    }

    #[test]
    fn test_process_record_duplicate_indel_offset() {
        let reference = reference();
        let ledgers = LedgerBook::new();
        let decomposer = Decomposer::new(&reference, &NoAnnotation, &ledgers);
        let record =
            parse_vcf_line("chr1\t1\t.\tGA\tG,GAA\t.\t.\t.\tGT\t1/2", 1).unwrap();
        let slots = [GenomeSlot {
            genome: GenomeId(0),
            sample_idx: Some(0),
        }];
        let out = decomposer.process_record(&record, ContigId(0), &slots).unwrap();
        assert_eq!(out.duplicate_offsets, 1);
        assert_eq!(out.edits.len(), 2);
        let ledger = ledgers.snapshot(GenomeId(0), ContigId(0)).unwrap();
        assert_eq!(ledger.total_indel_offset(), -1);
    }

    fn edit_summary(edits: &[AtomicEdit]) -> Vec<(EditKind, u64, Phase)> {
        edits.iter().map(|e| (e.kind, e.offset, e.phase)).collect()
    }

    #[test]
    fn test_sibling_alts_do_not_shift_each_other() {
        let reference = reference();
        let slots = [GenomeSlot {
            genome: GenomeId(0),
            sample_idx: Some(0),
        }];

        // Offset 4 holds A; ALT 1 inserts TT after it, ALT 2 substitutes it
        for (gt, insert_phase, sub_phase) in [("1|2", Phase::A, Phase::B), ("2|1", Phase::B, Phase::A)]
        {
            let ledgers = LedgerBook::new();
            let decomposer = Decomposer::new(&reference, &NoAnnotation, &ledgers);
            let line = format!("chr1\t5\t.\tA\tATT,C\t.\t.\t.\tGT\t{gt}");
            let record = parse_vcf_line(&line, 1).unwrap();
            let out = decomposer.process_record(&record, ContigId(0), &slots).unwrap();

            let mut edits = edit_summary(&out.edits);
            edits.sort_by_key(|&(_, offset, _)| offset);
            assert_eq!(
                edits,
                vec![
                    (EditKind::Substitution, 4, sub_phase),
                    (EditKind::Insert, 5, insert_phase),
                    (EditKind::Insert, 6, insert_phase),
                ],
                "genotype {gt}"
            );
            assert_eq!(out.duplicate_offsets, 0);

            // The insertion still shifts later records
            let ledger = ledgers.snapshot(GenomeId(0), ContigId(0)).unwrap();
            assert_eq!(ledger.total_indel_offset(), 2);
            assert_eq!(ledger.adjust_indel_offsets(4), 2);
        }
    }

    #[test]
    fn test_insert_takes_coding_context_of_anchor() {
        let reference = reference();
        let genes = GeneIntervals::from_bed_reader("chr1\t10\t20\tG1\t0\t+\n".as_bytes()).unwrap();
        let ledgers = LedgerBook::new();
        let decomposer = Decomposer::new(&reference, &genes, &ledgers);
        let slots = [GenomeSlot {
            genome: GenomeId(0),
            sample_idx: None,
        }];

        // Anchored just before the gene: the whole run stays outside it
        let record = parse_vcf_line("chr1\t9\t.\tA\tATTTTT\t.\t.\t.", 0).unwrap();
        let out = decomposer.process_record(&record, ContigId(0), &slots).unwrap();
        assert_eq!(out.edits.len(), 5);
        assert!(out.edits.iter().all(|e| e.coding.is_none()));
        let aggregation = compound::create(out.edits, &EditKind::ALL, QualityPolicy::Min);
        assert_eq!(aggregation.compounds.len(), 1);
        assert_eq!(aggregation.compounds[0].alt_text(), "TTTTT");
        assert!(aggregation.atomic.is_empty());

        // Anchored on the gene's last base: the run ends past it but stays inside
        let record = parse_vcf_line("chr1\t19\t.\tA\tAGG\t.\t.\t.", 0).unwrap();
        let out = decomposer.process_record(&record, ContigId(0), &slots).unwrap();
        assert_eq!(out.edits.len(), 2);
        assert!(out
            .edits
            .iter()
            .all(|e| e.coding.as_ref().is_some_and(|c| &*c.gene == "G1")));
    }

    #[test]
    fn test_process_record_rejects_mismatch_and_bad_info() {
        let reference = reference();
        let ledgers = LedgerBook::new();
        let decomposer = Decomposer::new(&reference, &NoAnnotation, &ledgers);
        let slots = [GenomeSlot {
            genome: GenomeId(0),
            sample_idx: None,
        }];

        // Second ALT is fine but the record still fails as a whole
        let record = parse_vcf_line("chr1\t1\t.\tC\tA,T\t.\t.\t.", 0).unwrap();
        assert!(decomposer.process_record(&record, ContigId(0), &slots).is_err());

        let record = parse_vcf_line("chr1\t1\t.\tG\tA\t.\t.\tDP=ten", 0).unwrap();
        assert!(matches!(
            decomposer.process_record(&record, ContigId(0), &slots),
            Err(DecomposeErr::InvalidInfo { key: "DP", .. })
        ));
        assert!(ledgers.is_empty());
    }

    #[test]
    fn test_explicit_info_cigar_is_used_per_alt() {
        let reference = reference();
        let record = parse_vcf_line(
            "chr1\t3\t.\tTTAC\tTTAGGC,TTAT\t.\t.\tCIGAR=3M2I1M,4M",
            0,
        )
        .unwrap();
        let decompositions = decompose_record(&record, &reference).unwrap();
        let first = decompositions[0].as_ref().unwrap();
        assert_eq!(first.inserts(), 2);
        assert_eq!(first.alt_index, 0);
        let second = decompositions[1].as_ref().unwrap();
        assert_eq!(second.substitutions(), 1);
        assert_eq!(second.alt_index, 1);
    }
}
