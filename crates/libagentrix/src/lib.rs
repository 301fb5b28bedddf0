pub mod automation;
pub mod broker;
pub mod error;
pub mod output;
pub mod pty;
pub mod rate_limit;
pub mod registry;
pub mod session;
pub mod task;
pub mod tmux;
pub mod validation;

use std::time::{SystemTime, UNIX_EPOCH};

pub use automation::{AutomationRunner, AutomationServices, StepFailure, StepId};
pub use error::AgentrixError;
pub use rate_limit::RateLimiter;
pub use registry::{CloseOptions, RegistryConfig, SessionRegistry, SpawnOptions, SpawnedSession};
pub use session::{Attachment, ExitStatus, ProcessSession, SessionPhase};
pub use task::{TaskHandle, TaskProgress, TaskStore};
pub use validation::{AgentCommands, LaunchRequest, validate_launch_payload, verify_api_key};

pub(crate) fn epoch_ms(at: SystemTime) -> u64 {
    at.duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
