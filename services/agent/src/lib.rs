//! Argus agent - session-gated detection and checkout for edge devices.
//!
//! The agent wires the vision and platform crates together under a
//! dependency-ordered service orchestrator:
//!
//! - [`session::SessionManager`] opens and closes remote maintenance
//!   sessions, gating the camera and the detection pipeline
//! - [`orchestrator::ServiceOrchestrator`] validates the service
//!   dependency DAG, starts everything in order and supervises health
//! - [`status_api`] exposes the operator controls and observable status

pub mod config;
pub mod orchestrator;
pub mod services;
pub mod session;
pub mod status_api;

// Re-export main types
pub use config::{AgentConfig, AgentConfigError, SessionConfig};
pub use orchestrator::{
    OrchestratorError, RestartPolicy, Service, ServiceOrchestrator, ServiceSpec, ServiceState,
};
pub use session::{
    OperatorNotice, Session, SessionError, SessionManager, SessionSnapshot, SessionState,
    SessionTimings,
};
