pub mod backend;
pub mod gate;
pub mod heartbeat;
pub mod identity;
pub mod scheduler;
pub mod session;
pub mod store;
pub mod task;
pub mod text;
pub mod transport;
pub mod trigger;

#[cfg(test)]
pub(crate) mod testing;

// Re-export key types
pub use backend::{AgentBackend, AgentEvent, AgentRequest, BackendError, ResumeToken};
pub use gate::{build_gate, GateDecision, RecipientGate};
pub use heartbeat::{CheckReport, HeartbeatRunner, HeartbeatSettings};
pub use identity::{ExternalUser, IdentityDirectory, Recipient, RecipientKind, Role};
pub use scheduler::{ScheduleReport, ScheduleStore, SchedulerRunner};
pub use session::{EphemeralSession, SessionManager, SessionSettings, StreamItem, UserSession};
pub use store::Store;
pub use task::{TaskRepository, TaskStatus, TaskSummary};
pub use transport::Transport;
pub use trigger::{TriggerEvent, TriggerExecutor};
