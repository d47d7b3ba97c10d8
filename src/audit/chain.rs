//! Hash-chain verification for audit logs.

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;

use thiserror::Error;

use super::AuditEntry;

/// `prevHash` of the first entry in a chain.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Why an audit log failed verification.
#[derive(Debug, Error)]
pub enum ChainError {
    #[error("failed to read audit log: {0}")]
    Io(#[from] io::Error),

    #[error("line {line}: not a valid audit entry: {source}")]
    Parse {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("line {line}: expected sequence {expected}, found {found}")]
    Sequence {
        line: usize,
        expected: u64,
        found: u64,
    },

    #[error("sequence {sequence}: previous hash does not match the preceding entry")]
    Linkage { sequence: u64 },

    #[error("sequence {sequence}: entry hash does not match its contents")]
    Tampered { sequence: u64 },
}

/// Summary of a verified log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainSummary {
    /// Number of entries checked.
    pub entries: u64,
    /// Hash of the last entry, or [`GENESIS_HASH`] for an empty log.
    pub last_hash: String,
}

/// Verifies every entry of the log at `path`.
///
/// # Errors
///
/// Returns the first inconsistency found: an unreadable line, a gap in the
/// sequence numbers, a broken link, or an entry whose contents do not match
/// its hash.
pub fn verify_chain(path: &Path) -> Result<ChainSummary, ChainError> {
    let reader = BufReader::new(File::open(path)?);
    let mut expected_sequence = 0u64;
    let mut last_hash = GENESIS_HASH.to_string();

    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let line_no = index + 1;
        let entry: AuditEntry = serde_json::from_str(&line).map_err(|source| ChainError::Parse {
            line: line_no,
            source,
        })?;

        if entry.sequence != expected_sequence {
            return Err(ChainError::Sequence {
                line: line_no,
                expected: expected_sequence,
                found: entry.sequence,
            });
        }
        if entry.prev_hash != last_hash {
            return Err(ChainError::Linkage {
                sequence: entry.sequence,
            });
        }
        let recomputed = entry.compute_hash().map_err(|source| ChainError::Parse {
            line: line_no,
            source,
        })?;
        if recomputed != entry.hash {
            return Err(ChainError::Tampered {
                sequence: entry.sequence,
            });
        }

        expected_sequence += 1;
        last_hash = entry.hash;
    }

    Ok(ChainSummary {
        entries: expected_sequence,
        last_hash,
    })
}
