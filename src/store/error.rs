//! Store error taxonomy. Reorgs are distinguished by SQLSTATE, never by
//! matching on error message text.

use std::fmt;

/// PostgreSQL not-null violation: the deliberate signal the blocks upsert
/// raises when a number collision carries a different hash.
const SQLSTATE_NOT_NULL_VIOLATION: &str = "23502";
/// Unique or primary-key violation.
const SQLSTATE_UNIQUE_VIOLATION: &str = "23505";

#[derive(Debug)]
pub enum StoreError {
    /// A block number already exists with a different hash. The chain below
    /// the finalized tip is assumed immutable, so this is fatal: resolving
    /// the conflict is out of scope and nothing is overwritten.
    ReorgDetected { number: Option<u64> },
    /// A key collision that the idempotent insert paths did not absorb.
    Conflict,
    Other(anyhow::Error),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::ReorgDetected { number: Some(number) } => {
                write!(f, "reorg detected: block {number} exists with a different hash")
            }
            StoreError::ReorgDetected { number: None } => {
                write!(f, "reorg detected: a block exists with a different hash")
            }
            StoreError::Conflict => write!(f, "store key conflict"),
            StoreError::Other(cause) => write!(f, "store failure: {cause}"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Other(cause) => Some(cause.as_ref()),
            _ => None,
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(ref db_err) = err {
            match db_err.code().as_deref() {
                Some(SQLSTATE_NOT_NULL_VIOLATION) => {
                    return StoreError::ReorgDetected { number: None };
                }
                Some(SQLSTATE_UNIQUE_VIOLATION) => return StoreError::Conflict,
                _ => {}
            }
        }
        StoreError::Other(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reorg_display_names_the_block_when_known() {
        let with_number = StoreError::ReorgDetected { number: Some(500) };
        assert_eq!(
            with_number.to_string(),
            "reorg detected: block 500 exists with a different hash"
        );

        let without = StoreError::ReorgDetected { number: None };
        assert!(without.to_string().starts_with("reorg detected"));
    }

    #[test]
    fn reorg_survives_an_anyhow_round_trip() {
        let err: anyhow::Error = StoreError::ReorgDetected { number: Some(7) }.into();
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::ReorgDetected { number: Some(7) })
        ));
    }
}
