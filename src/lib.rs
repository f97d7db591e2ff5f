pub mod artifact;
pub mod broadcast;
pub mod config;
pub mod cu;
pub mod engine;
pub mod error;
pub mod eval;
pub mod log;
pub mod pipeline;
pub mod registry;
pub mod resolver;
pub mod results;
pub mod snapshot;
pub mod source;
pub mod testing;
pub mod types;
pub mod updater;

pub use config::CuConfig;
pub use cu::{ComputeUnit, ComputeUnitBuilder};

pub mod prelude {
    pub use crate::config::CuConfig;
    pub use crate::cu::{ComputeUnit, CuStats};
    pub use crate::error::{CuError, Result};
    pub use crate::eval::{ExecutionEngine, FailurePolicy, HandleResponse, ProcessHandle};
    pub use crate::results::ResultStore;
    pub use crate::broadcast::Broadcaster;
    pub use crate::types::{EvaluationResult, Message, ProcessDefinition};
}
