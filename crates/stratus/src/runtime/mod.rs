//! The repository runtime: registry, process sessions, log capture, the
//! lifecycle manager, and startup reconciliation.

pub mod bootstrap;
pub mod error;
pub mod logs;
pub mod manager;
pub mod registry;
pub mod session;

pub use bootstrap::{BootstrapSummary, reconcile};
pub use error::{RuntimeError, TeardownReport};
pub use logs::{LogEntry, LogSink, LogStore, LogStream};
pub use manager::{CreateOutcome, RuntimeManager, SessionStatus, WebhookDisposition};
pub use registry::RuntimeRegistry;
pub use session::{ProcessSession, SessionState};
