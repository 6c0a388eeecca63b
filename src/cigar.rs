//! Edit scripts between a REF and an ALT allele.
//!
//! An edit script is either supplied by the caller (INFO `CIGAR`) or computed
//! here. Whatever its origin it must consume exactly the REF and ALT alleles.

use bio::alignment::pairwise::Aligner;
use bio::alignment::AlignmentOperation;
use std::fmt;

#[derive(Debug, PartialEq)]
pub enum CigarErr {
    InvalidCigarFormat(String),
    UnsupportedCigarOperation(char),
    LengthMismatch {
        ref_expected: usize,
        ref_consumed: usize,
        alt_expected: usize,
        alt_consumed: usize,
    },
}

impl fmt::Display for CigarErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CigarErr::InvalidCigarFormat(cigar) => write!(f, "Invalid CIGAR format '{cigar}'"),
            CigarErr::UnsupportedCigarOperation(op) => {
                write!(f, "Unsupported CIGAR operation '{op}'")
            }
            CigarErr::LengthMismatch {
                ref_expected,
                ref_consumed,
                alt_expected,
                alt_consumed,
            } => write!(
                f,
                "CIGAR consumes {ref_consumed} REF / {alt_consumed} ALT bases, alleles have {ref_expected} / {alt_expected}"
            ),
        }
    }
}

impl std::error::Error for CigarErr {}

/// A run of one alignment operation, packed into a `u32`:
/// three high bits for the operation and the rest for the run length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CigarOp {
    val: u32,
}

const LEN_BITS: u32 = 29;
const LEN_MASK: u32 = (1 << LEN_BITS) - 1;

impl CigarOp {
    pub fn new(len: u32, op: char) -> Result<Self, CigarErr> {
        let code = match op {
            '=' => 0,
            'X' => 1,
            'I' => 2,
            'D' => 3,
            'M' => 4,
            _ => return Err(CigarErr::UnsupportedCigarOperation(op)),
        };
        if len > LEN_MASK {
            return Err(CigarErr::InvalidCigarFormat(format!("{len}{op}")));
        }
        Ok(Self {
            val: (code << LEN_BITS) | len,
        })
    }

    pub fn op(&self) -> char {
        match self.val >> LEN_BITS {
            0 => '=',
            1 => 'X',
            2 => 'I',
            3 => 'D',
            _ => 'M',
        }
    }

    pub fn len(&self) -> usize {
        (self.val & LEN_MASK) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// REF bases consumed by this run
    pub fn ref_delta(&self) -> usize {
        match self.op() {
            '=' | 'X' | 'D' | 'M' => self.len(),
            _ => 0,
        }
    }

    /// ALT bases consumed by this run
    pub fn alt_delta(&self) -> usize {
        match self.op() {
            '=' | 'X' | 'I' | 'M' => self.len(),
            _ => 0,
        }
    }

    fn extend(&mut self, by: u32) {
        self.val += by;
    }
}

impl fmt::Display for CigarOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.len(), self.op())
    }
}

pub fn cigar_to_string(ops: &[CigarOp]) -> String {
    ops.iter().map(|op| op.to_string()).collect()
}

/// Parse a CIGAR string such as `3M2I1M`. Zero-length runs are dropped.
pub fn parse_cigar(cigar: &str) -> Result<Vec<CigarOp>, CigarErr> {
    let mut ops = Vec::new();
    let mut len: Option<u32> = None;

    for c in cigar.chars() {
        if let Some(digit) = c.to_digit(10) {
            let current = len.unwrap_or(0);
            len = Some(
                current
                    .checked_mul(10)
                    .and_then(|v| v.checked_add(digit))
                    .ok_or_else(|| CigarErr::InvalidCigarFormat(cigar.to_string()))?,
            );
        } else {
            let run = len
                .take()
                .ok_or_else(|| CigarErr::InvalidCigarFormat(cigar.to_string()))?;
            let op = CigarOp::new(run, c)?;
            if !op.is_empty() {
                ops.push(op);
            }
        }
    }

    if len.is_some() || ops.is_empty() {
        return Err(CigarErr::InvalidCigarFormat(cigar.to_string()));
    }
    Ok(ops)
}

/// Check that `ops` consume exactly `ref_len` REF and `alt_len` ALT bases.
pub fn check_consumption(ops: &[CigarOp], ref_len: usize, alt_len: usize) -> Result<(), CigarErr> {
    let ref_consumed: usize = ops.iter().map(CigarOp::ref_delta).sum();
    let alt_consumed: usize = ops.iter().map(CigarOp::alt_delta).sum();
    if ref_consumed != ref_len || alt_consumed != alt_len {
        return Err(CigarErr::LengthMismatch {
            ref_expected: ref_len,
            ref_consumed,
            alt_expected: alt_len,
            alt_consumed,
        });
    }
    Ok(())
}

fn push_run(ops: &mut Vec<CigarOp>, op: char, len: u32) {
    if len == 0 {
        return;
    }
    if let Some(last) = ops.last_mut() {
        if last.op() == op {
            last.extend(len);
            return;
        }
    }
    // Only '=', 'X', 'I', 'D' reach here
    if let Ok(run) = CigarOp::new(len, op) {
        ops.push(run);
    }
}

/// Compute an edit script turning `reference` into `alternate`.
///
/// Same-length alleles and anchored pure insertions/deletions are resolved
/// directly; anything else goes through a global alignment.
pub fn compute_edit_script(reference: &[u8], alternate: &[u8]) -> Vec<CigarOp> {
    let mut ops = Vec::new();

    if reference.len() == alternate.len() {
        for (r, a) in reference.iter().zip(alternate) {
            push_run(&mut ops, if r.eq_ignore_ascii_case(a) { '=' } else { 'X' }, 1);
        }
        return ops;
    }

    if alternate.len() > reference.len() && starts_with_ignore_case(alternate, reference) {
        push_run(&mut ops, '=', reference.len() as u32);
        push_run(&mut ops, 'I', (alternate.len() - reference.len()) as u32);
        return ops;
    }

    if reference.len() > alternate.len() && starts_with_ignore_case(reference, alternate) {
        push_run(&mut ops, '=', alternate.len() as u32);
        push_run(&mut ops, 'D', (reference.len() - alternate.len()) as u32);
        return ops;
    }

    let score = |a: u8, b: u8| {
        if a.eq_ignore_ascii_case(&b) {
            1i32
        } else {
            -1i32
        }
    };
    let mut aligner = Aligner::with_capacity(alternate.len(), reference.len(), -5, -1, &score);
    // x = ALT, y = REF: Ins consumes ALT only, Del consumes REF only
    let alignment = aligner.global(alternate, reference);
    for operation in alignment.operations {
        match operation {
            AlignmentOperation::Match => push_run(&mut ops, '=', 1),
            AlignmentOperation::Subst => push_run(&mut ops, 'X', 1),
            AlignmentOperation::Ins => push_run(&mut ops, 'I', 1),
            AlignmentOperation::Del => push_run(&mut ops, 'D', 1),
            AlignmentOperation::Xclip(n) => push_run(&mut ops, 'I', n as u32),
            AlignmentOperation::Yclip(n) => push_run(&mut ops, 'D', n as u32),
        }
    }
    ops
}

fn starts_with_ignore_case(haystack: &[u8], prefix: &[u8]) -> bool {
    haystack.len() >= prefix.len() && haystack[..prefix.len()].eq_ignore_ascii_case(prefix)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ops(cigar: &str) -> Vec<CigarOp> {
        parse_cigar(cigar).unwrap()
    }

    #[test]
    fn test_cigar_op_packing() {
        let op = CigarOp::new(12, 'D').unwrap();
        assert_eq!(op.op(), 'D');
        assert_eq!(op.len(), 12);
        assert_eq!(op.ref_delta(), 12);
        assert_eq!(op.alt_delta(), 0);
        assert_eq!(op.to_string(), "12D");
        assert!(CigarOp::new(1, 'S').is_err());
    }

    #[test]
    fn test_parse_cigar_basic() {
        let parsed = ops("3M2I1M");
        assert_eq!(
            parsed,
            vec![
                CigarOp::new(3, 'M').unwrap(),
                CigarOp::new(2, 'I').unwrap(),
                CigarOp::new(1, 'M').unwrap(),
            ]
        );
        assert_eq!(cigar_to_string(&parsed), "3M2I1M");
        assert!(check_consumption(&parsed, 4, 6).is_ok());
        assert!(check_consumption(&parsed, 5, 6).is_err());
    }

    #[test]
    fn test_parse_cigar_invalid() {
        assert!(matches!(
            parse_cigar("10Q"),
            Err(CigarErr::UnsupportedCigarOperation('Q'))
        ));
        assert!(matches!(parse_cigar("M"), Err(CigarErr::InvalidCigarFormat(_))));
        assert!(matches!(parse_cigar("3M2"), Err(CigarErr::InvalidCigarFormat(_))));
        assert!(matches!(parse_cigar(""), Err(CigarErr::InvalidCigarFormat(_))));
    }

    #[test]
    fn test_compute_edit_script_simple_cases() {
        assert_eq!(cigar_to_string(&compute_edit_script(b"A", b"AT")), "1=1I");
        assert_eq!(cigar_to_string(&compute_edit_script(b"ACG", b"A")), "1=2D");
        assert_eq!(cigar_to_string(&compute_edit_script(b"ACGT", b"ACCT")), "2=1X1=");
    }

    #[test]
    fn test_compute_edit_script_consumes_both_alleles() {
        let cases: [(&[u8], &[u8]); 4] = [
            (b"ACGTACGT", b"ACGACGT"),
            (b"ACGT", b"TTACGT"),
            (b"GATTACA", b"GCTTAAACA"),
            (b"A", b"CCCC"),
        ];
        for (reference, alternate) in cases {
            let script = compute_edit_script(reference, alternate);
            assert!(
                check_consumption(&script, reference.len(), alternate.len()).is_ok(),
                "{} for {:?}->{:?}",
                cigar_to_string(&script),
                reference,
                alternate
            );
        }
    }
}
