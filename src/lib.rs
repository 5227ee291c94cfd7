pub mod admission;
pub mod api;
pub mod batch;
pub mod config;
pub mod error;
pub mod model;
pub mod pool;
pub mod prompt;
pub mod server;

pub use admission::{Admission, ApiKeyAuth, AuthOutcome};
pub use batch::{BatchCoordinator, BatchItem};
pub use crate::config::AppConfig;
pub use error::ServiceError;
pub use model::{GenerationParams, GenerationRequest, GenerationResult, ModelCapability};
pub use pool::ExecutionSlotPool;
pub use server::build_router;
