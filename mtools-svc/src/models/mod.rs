//! Request and response models for the HTTP surface

pub mod requests;
pub mod responses;

pub use requests::{ExtractForm, StemForm};
pub use responses::{
    CleanupResponse, DirectoryStatsBody, ExtractResponse, FormatsResponse, HealthResponse, MemoryBody,
    ModelsResponse, StatsResponse, StemSeparationResponse,
};
