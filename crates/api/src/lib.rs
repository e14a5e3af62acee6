//! Health and metrics HTTP endpoints for the audit processor.

pub mod response;
pub mod routes;
pub mod state;

pub use routes::{router, serve};
pub use state::AppState;
