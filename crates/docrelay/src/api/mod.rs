//! HTTP API module.
//!
//! Provides the streaming relay endpoint and the progress pass-through.

mod error;
mod handlers;
mod routes;
mod state;

pub use error::{ApiError, ApiResult, ErrorResponse};
pub use handlers::bearer_token;
pub use routes::create_router;
pub use state::AppState;
