//! Repository records, persistence, and the lifecycle service.

pub mod models;
pub mod service;
pub mod store;

pub use models::{NewRepository, RepositoryRecord, RepositoryUpdate};
pub use service::RepositoryService;
pub use store::RepositoryStore;
