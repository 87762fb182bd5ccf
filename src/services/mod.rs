//! Business logic services.
//!
//! The lifecycle engine owns change request state. It relies on the audit
//! log and the capability gates, and hands approved work to the automation
//! coordinator, which notifies CI/CD through the webhook client. The HTTP
//! layer (`api`, `identity`, `server`) sits on top and holds no workflow rules.

pub mod api;
pub mod audit_log;
pub mod automation;
pub mod directory;
pub mod gates;
pub mod identity;
pub mod lifecycle;
pub mod server;
pub mod webhook;

pub use automation::{AutomationCoordinator, AutomationHandle, AutomationOutcome};
pub use lifecycle::LifecycleEngine;
pub use server::AppState;
pub use webhook::{WebhookConfig, WebhookNotifier};
