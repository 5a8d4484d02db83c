//! In-memory implementations of the orchestrator's seams, for testing.

pub mod backend;
pub mod templates;

pub use backend::{Backend, Calls};
pub use templates::Templates;
