//! aotshard - Parallel multi-shard native-code emission.
//!
//! This crate takes one monolithic compilation unit (a graph of named,
//! weighted symbols produced by earlier front-end stages), splits it into
//! independently compilable shards, compiles every shard on its own worker
//! thread through an opaque backend, and reassembles the results into
//! archives a runtime loader can consume.
//!
//! # Primary Usage
//!
//! ```ignore
//! use aotshard::{emit_image, write_image_archives, ArchivePaths};
//! use aotshard::{ObjectBackend, OutputRequest, PipelineConfig};
//!
//! let image = emit_image(unit, &ObjectBackend, OutputRequest::object_only(),
//!                        &PipelineConfig::default(), None)?;
//! write_image_archives(&image, &target, &ArchivePaths {
//!     obj: Some("image.a".into()),
//!     ..ArchivePaths::default()
//! });
//! ```
//!
//! # Architecture
//!
//! - [`unit`] - Symbol and compilation-unit model
//! - [`extract`] - Index-table extraction
//! - [`partition`] - Union-find connectivity and LPT weight balancing
//! - [`serialize`] - One-shot encode, lazy concurrent decode
//! - [`materialize`] - Per-shard reconstruction and alias edge cases
//! - [`vartable`] - Per-shard index-table regeneration
//! - [`backend`] - The opaque compile seam and a reference object backend
//! - [`metadata`] - Loader metadata and preamble units
//! - [`pipeline`] - Thread-count heuristics and worker coordination
//! - [`archive`] - Archive bundling
//!
//! The unit has exactly one owner at every stage: it moves through
//! extraction, partitioning, and serialization, is released before the
//! fan-out, and each worker owns its own materialized copy from then on.
//! The only shared state across workers is the immutable serialized
//! buffer.

pub mod archive;
pub mod backend;
pub mod error;
pub mod extract;
pub mod mangle;
pub mod materialize;
pub mod metadata;
pub mod partition;
pub mod pipeline;
pub mod serialize;
pub mod timing;
pub mod unit;
pub mod vartable;

// Re-export the surface most callers need.
pub use archive::{member_name, write_image_archives, ArchivePaths};
pub use backend::{
    BackendCompiler, BackendError, ObjectBackend, OutputKind, OutputRequest, ShardOutputs,
};
pub use error::{ImageError, ImageResult};
pub use extract::{extract_index_tables, IndexTable};
pub use materialize::materialize_preserved;
pub use metadata::{build_metadata_unit, build_preamble_unit, META_FORMAT_VERSION};
pub use partition::{compute_unit_info, partition_unit, Partition, UnitInfo};
pub use pipeline::{compute_thread_count, emit_image, emit_unit, EmittedImage, PipelineConfig};
pub use serialize::{serialize_unit, LazyUnit};
pub use timing::{ShardTimers, WorkerPhase};
pub use unit::{
    Architecture, BinaryFormat, CompilationUnit, FunctionBody, Linkage, Symbol, SymbolKind,
    TargetSpec, Visibility, FUNCTION_INDEX_SYMBOL, GLOBAL_INDEX_SYMBOL,
};
pub use vartable::construct_var_tables;
