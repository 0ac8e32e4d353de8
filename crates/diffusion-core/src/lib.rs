//! diffusion-core
//!
//! Run lifecycle primitives for diffusion-model training:
//! - Resolving configs strictly against a schema (`ConfigResolver`)
//! - Creating and re-opening run directories (`RunLayout`, `RunDirectory`)
//! - Stamping provenance once per run (`stamp`)
//! - Append-only metric logs (`MetricsLogger`)
//! - Crash-safe checkpoints (`CheckpointManager`)
//! - Seeding and reproducibility reporting (`DeterminismController`)
//! - Driving a session end to end (`start_run`, `resume_run`, `SmokeLoop`)

pub mod checkpoint;
pub mod clock;
pub mod config;
pub mod determinism;
pub mod error;
pub mod layout;
pub mod manifest;
pub mod metrics;
pub mod progress;
pub mod provenance;
pub mod runner;

pub use checkpoint::{BlobEntry, CheckpointManager, CheckpointRecord, CheckpointSlot, CheckpointState};
pub use config::{
    application_schema, resolve, ConfigErrorKind, ConfigResolver, ConfigSchema, ConfigValidationError, ConfigValue,
    Override, ResolvedConfig, RunSettings, ValueType,
};
pub use determinism::{BackendClass, BackendInfo, CpuBackend, DeterminismController, NumericBackend, Tolerance};
pub use error::{RunError, RunResult};
pub use layout::{RunDirectory, RunId, RunLayout, RunLock, LAYOUT_VERSION};
pub use manifest::{read_manifest, write_manifest, ManifestEntry, ManifestKind, RunManifest};
pub use metrics::{read_events, ClockBasis, MetricEvent, MetricsLogger};
pub use progress::{ProgressEvent, ProgressSink, TracingProgressSink};
pub use provenance::{
    read_provenance, stamp, validate_provenance_file, EnvInfo, GitInfo, GitSource, LockfileRef, ProvenanceRecord,
};
pub use runner::{
    read_resumes, resume_run, start_run, ResumeEvent, ResumeRequest, RunSession, SmokeLoop, SmokeOutcome, SmokeState,
    StartRequest,
};
