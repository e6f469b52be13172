//! Session persistence and lifecycle.

mod manager;
mod store;

pub use manager::{SessionManager, ValidationOutcome};
pub use store::SessionStore;
