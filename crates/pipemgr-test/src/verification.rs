//! Verification helpers for instruction streams

use crate::fixtures::PostedInstr;
use pipemgr_hw::{InstrKind, Instruction};
use thiserror::Error;

/// Verification error types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VerificationError {
    #[error("Expected instruction kinds {expected:?}, got {actual:?}")]
    SequenceMismatch {
        expected: Vec<InstrKind>,
        actual: Vec<InstrKind>,
    },

    #[error("Instruction {kind:?} not found")]
    KindNotFound { kind: InstrKind },

    #[error("Expected {first:?} before {second:?}")]
    OrderViolation { first: InstrKind, second: InstrKind },
}

/// Result type for verification operations
pub type VerifyResult<T> = Result<T, VerificationError>;

/// Kinds of the given instructions, in order
pub fn kinds(instrs: &[Instruction]) -> Vec<InstrKind> {
    instrs.iter().map(Instruction::kind).collect()
}

/// Kinds of posted instructions, in order
pub fn posted_kinds(posted: &[PostedInstr]) -> Vec<InstrKind> {
    posted.iter().map(|p| p.instr.kind()).collect()
}

/// Number of instructions of one kind
pub fn count_kind(instrs: &[Instruction], kind: InstrKind) -> usize {
    instrs.iter().filter(|i| i.kind() == kind).count()
}

/// Verify the exact kind sequence
pub fn expect_kinds(instrs: &[Instruction], expected: &[InstrKind]) -> VerifyResult<()> {
    let actual = kinds(instrs);
    if actual != expected {
        return Err(VerificationError::SequenceMismatch {
            expected: expected.to_vec(),
            actual,
        });
    }
    Ok(())
}

/// Panicking form of [`expect_kinds`]
pub fn assert_kinds(instrs: &[Instruction], expected: &[InstrKind]) {
    if let Err(e) = expect_kinds(instrs, expected) {
        panic!("{}", e);
    }
}

/// Verify that the first `first` precedes the first `second`
pub fn expect_before(instrs: &[Instruction], first: InstrKind, second: InstrKind) -> VerifyResult<()> {
    let pos = |kind| {
        instrs
            .iter()
            .position(|i| i.kind() == kind)
            .ok_or(VerificationError::KindNotFound { kind })
    };
    if pos(first)? < pos(second)? {
        Ok(())
    } else {
        Err(VerificationError::OrderViolation { first, second })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expect_kinds() {
        let instrs = vec![Instruction::Noop, Instruction::Unlatch];
        assert!(expect_kinds(&instrs, &[InstrKind::Noop, InstrKind::Unlatch]).is_ok());
        assert!(expect_kinds(&instrs, &[InstrKind::Noop]).is_err());
        assert_eq!(count_kind(&instrs, InstrKind::Noop), 1);
    }

    #[test]
    fn test_expect_before() {
        let instrs = vec![Instruction::CopyLatched, Instruction::Noop];
        assert!(expect_before(&instrs, InstrKind::CopyLatched, InstrKind::Noop).is_ok());
        assert_eq!(
            expect_before(&instrs, InstrKind::Noop, InstrKind::CopyLatched),
            Err(VerificationError::OrderViolation {
                first: InstrKind::Noop,
                second: InstrKind::CopyLatched
            })
        );
        assert_eq!(
            expect_before(&instrs, InstrKind::Unlatch, InstrKind::Noop),
            Err(VerificationError::KindNotFound {
                kind: InstrKind::Unlatch
            })
        );
    }
}
