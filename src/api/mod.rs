//! Compliance backend: key taxonomy, HTTP transport and the cached client.

pub mod client;
pub mod keys;
pub mod synced_client;
pub mod types;

pub use client::ApiClient;
pub use keys::ApiKey;
pub use synced_client::SyncedClient;
pub use types::{ComplianceCheck, Guideline, NewProject, Project, Rule, RuleFilter, Violation};
