//! Ingest error taxonomy
//!
//! Callers match on the kind, never on message strings: transient transport
//! failures are retried with backoff, validation failures latch the
//! publisher until admin action, archive write failures halt the archive
//! run while load failures skip a single advertisement.

use sextant_core::PeerId;
use thiserror::Error;

/// Result type alias using [`IngestError`]
pub type Result<T> = std::result::Result<T, IngestError>;

/// Errors from the ingest pipeline.
#[derive(Error, Debug)]
pub enum IngestError {
    /// Publisher unreachable or a block fetch failed; retried with backoff.
    #[error("transport error: {0}")]
    Transport(String),

    /// Bad signature, undecodable block, or a malformed chain. The
    /// publisher's sync is latched failed until admin intervention.
    #[error("invalid advertisement {cid}: {reason}")]
    Validation { cid: String, reason: String },

    /// Policy denied the publisher or provider.
    #[error("peer {0} is not allowed")]
    NotAllowed(PeerId),

    /// Error writing an archive; the archive run halts.
    #[error("archive write error: {0}")]
    ArchiveWrite(#[source] sextant_core::Error),

    /// Error loading staged blocks for archiving; the advertisement is
    /// skipped and the run continues.
    #[error("archive load error: {0}")]
    ArchiveLoad(#[source] sextant_core::Error),

    /// Underlying store or datastore error.
    #[error(transparent)]
    Core(#[from] sextant_core::Error),
}

impl IngestError {
    pub fn transport(msg: impl Into<String>) -> Self {
        IngestError::Transport(msg.into())
    }

    pub fn validation(cid: impl ToString, reason: impl Into<String>) -> Self {
        IngestError::Validation {
            cid: cid.to_string(),
            reason: reason.into(),
        }
    }

    /// Transient errors are retried; everything else needs intervention.
    pub fn is_transient(&self) -> bool {
        matches!(self, IngestError::Transport(_))
            || matches!(self, IngestError::Core(sextant_core::Error::Storage(_)))
    }

    /// Validation errors latch the publisher failed.
    pub fn is_validation(&self) -> bool {
        matches!(self, IngestError::Validation { .. })
    }

    /// True when the indexer froze mid-operation.
    pub fn is_frozen(&self) -> bool {
        matches!(self, IngestError::Core(sextant_core::Error::Frozen))
    }
}
