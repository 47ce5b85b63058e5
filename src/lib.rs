pub mod capabilities;
pub mod chromium;
pub mod config;
pub mod error;
pub mod executor;
pub mod grounding;
pub mod intent;
pub mod judge;
pub mod knowledge;
pub mod model_client;
pub mod orchestrator;
pub mod planner;
pub mod retry;
pub mod safety;
pub mod session;
pub mod snapshots;
pub mod types;

pub use config::{AssistConfig, ChromiumConfig, ModelConfig};
pub use chromium::ChromiumScreen;
pub use error::{AssistError, FailureKind, FailureReport};
pub use intent::{SessionProfile, TechLevel};
pub use knowledge::StaticKnowledgeBase;
pub use model_client::ModelClient;
pub use orchestrator::{Collaborators, Orchestrator};
pub use session::{SessionRegistry, TaskHandle};
pub use types::{Procedure, ProcedureStep, StepKind, TaskSnapshot, TaskState};
