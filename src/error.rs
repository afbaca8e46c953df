// This module defines error types for the sharded emission pipeline using
// the thiserror crate. ImageError covers the fatal internal-consistency
// failures (missing or malformed index tables, corrupt serialized buffers,
// alias resolution problems, partition invariant violations) as well as the
// shard-worker wrapper that records which shard and which pipeline phase
// failed. Backend failures cross over via a transparent variant.

//! Error types for the emission pipeline.

use thiserror::Error;

use crate::backend::BackendError;
use crate::timing::WorkerPhase;

/// Main error type for image emission.
///
/// Everything here is fatal to the pipeline: a partially-completed shard
/// set cannot be made self-consistent after the fact.
#[derive(Error, Debug)]
pub enum ImageError {
    #[error("index table `{table}` is missing from the unit")]
    MissingIndexTable { table: &'static str },

    #[error("index table `{table}` is malformed: {reason}")]
    MalformedIndexTable {
        table: &'static str,
        reason: String,
    },

    #[error("duplicate symbol `{name}` in compilation unit")]
    DuplicateSymbol { name: String },

    #[error("unknown symbol `{name}`")]
    UnknownSymbol { name: String },

    #[error("corrupt serialized unit: {reason}")]
    Decode { reason: String },

    #[error("alias `{alias}`: {reason}")]
    Alias { alias: String, reason: String },

    #[error("partition invariant violated: {reason}")]
    PartitionInvariant { reason: String },

    #[error("no output kind requested")]
    NoOutputRequested,

    #[error("shard {shard} failed while {phase}: {source}")]
    Shard {
        shard: usize,
        phase: WorkerPhase,
        #[source]
        source: Box<ImageError>,
    },

    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl ImageError {
    /// Attach shard and phase context to a worker-side failure.
    pub fn in_shard(self, shard: usize, phase: WorkerPhase) -> ImageError {
        ImageError::Shard {
            shard,
            phase,
            source: Box::new(self),
        }
    }
}

/// Result type alias for emission operations.
pub type ImageResult<T> = Result<T, ImageError>;
