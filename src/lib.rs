pub mod cache;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod enforcement;
pub mod logging;
pub mod propagation;
pub mod store;

pub const ENGINE_NAME: &str = "warden";
pub const MUTATION_TARGET: &str = "warden::mutation";
pub const PROPAGATION_TARGET: &str = "warden::propagation";
pub const ERROR_TARGET: &str = "warden::error";
pub const CONSOLE_TARGET: &str = "warden::console";

pub use config::{EngineConfig, FailSafePolicy};
pub use engine::{ActiveRecords, EnforcementEngine, ReadSource, ViolationOutcome};
pub use enforcement::{
    ActorId, ChangeKind, ChangeNotice, EnforcementAction, EnforcementError, EnforcementKind,
    EnforcementRecord, EnforcementResult, EnforcementState, RecordId, SubjectId, ViolationPoints,
};
pub type Error = Box<dyn std::error::Error + Send + Sync>;
