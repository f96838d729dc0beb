//! HTTP and WebSocket surface of the engine

pub mod handlers;
pub mod routes;
pub mod ws_handlers;

pub use handlers::{AppError, FeatherState, ServerState};
pub use routes::create_router;
