//! Resource-governance and safety services
//!
//! Everything between untrusted request input and external tool execution:
//! path and argument sanitation, streaming upload staging, content sniffing,
//! memory-aware admission, supervised subprocesses, disk retention, and the
//! two job flows built on them.

pub mod admission_gate;
pub mod audio_extract;
pub mod cleanup_scheduler;
pub mod content_sniffer;
pub mod exit_cleanup;
pub mod memory_governor;
pub mod path_guard;
pub mod process_supervisor;
pub mod retention_manager;
pub mod stem_job;
pub mod tool_commands;
pub mod upload_policy;
pub mod upload_streamer;

pub use admission_gate::{AdmissionGate, OperationSlot};
pub use audio_extract::{AudioExtractor, ExtractOutput, ExtractRequest, ExtractSettings};
pub use cleanup_scheduler::CleanupScheduler;
pub use content_sniffer::{AudioFormat, SniffResult};
pub use exit_cleanup::{ExitCleanupRegistry, ScopedPath};
pub use memory_governor::{
    MemoryGovernor, MemoryProbe, MemorySnapshot, OperationClass, StaticMemoryProbe, SysinfoProbe,
};
pub use path_guard::{validate_enum, validate_filename, validate_identifier, PathGuard, ValidatedPath};
pub use process_supervisor::{ProcessSupervisor, SafeArg, ToolCommand, ToolOutput};
pub use retention_manager::{DirectoryStats, RetentionManager, SweepReport, SweepStatus};
pub use stem_job::{StemJobOutput, StemJobSettings, StemRequest, StemSeparator};
pub use tool_commands::{
    AudioQuality, DownloadFormat, SeparationModel, StemFormat, StemName, VideoSource,
};
pub use upload_policy::{check_declared_upload, DeclaredUpload};
pub use upload_streamer::{UploadSession, UploadStreamer};
