//! HTTP API served on the control socket.
//!
//! Every `/v1` route acts on exactly one webspace: the one owned by the
//! connecting user, or by the user named in [`USER_HEADER`] when the caller
//! is privileged.

mod auth;
mod error;
mod handlers;
mod routes;
mod state;
mod terminal;

pub use auth::{CurrentUser, PeerCredentials, USER_HEADER};
pub use error::{ApiError, ApiResult, ErrorResponse};
pub use handlers::{AddressResponse, ConfigPatch, ExecRequest, HealthResponse, PortMapping};
pub use routes::create_router;
pub use state::AppState;
