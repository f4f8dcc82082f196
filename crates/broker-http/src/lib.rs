//! The control-plane HTTP surface: public task endpoints (create, list,
//! snapshot, SSE subscribe) and bearer-authenticated internal endpoints
//! (claim, ack, append event).

mod auth;
mod error;
mod internal;
mod public;
mod router;
mod session;
mod sse;
mod state;

pub use error::{ApiError, ApiResult};
pub use router::build_router;
pub use state::{AppState, HttpConfig};
