//! Process wiring for the examgate caching and rate-limiting services.

pub mod error;
pub mod observability;
pub mod prometheus;
pub mod routes;
pub mod server;
pub mod services;

pub use error::ServerError;
pub use observability::init_tracing;
pub use routes::{AppState, build_router};
pub use services::Services;
