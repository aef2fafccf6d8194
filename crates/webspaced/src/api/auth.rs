//! Peer-credential authentication for the control socket.
//!
//! There are no tokens: the kernel tells us the uid of the process on the
//! other end of the Unix socket, and that uid is the caller.

use axum::{
    extract::{ConnectInfo, FromRequestParts, Request, State, connect_info::Connected},
    http::request::Parts,
    middleware::Next,
    response::Response,
    serve::IncomingStream,
};
use log::{info, warn};
use tokio::net::UnixListener;

use super::error::ApiError;
use super::state::AppState;
use crate::identity::Identity;

/// Header privileged callers use to act for another user.
pub const USER_HEADER: &str = "X-Webspace-User";

/// Credentials of the connecting process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerCredentials {
    /// `None` when the kernel could not report credentials.
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub pid: Option<i32>,
}

impl PeerCredentials {
    pub fn from_uid(uid: u32) -> Self {
        Self {
            uid: Some(uid),
            gid: None,
            pid: None,
        }
    }
}

impl Connected<IncomingStream<'_, UnixListener>> for PeerCredentials {
    fn connect_info(stream: IncomingStream<'_, UnixListener>) -> Self {
        match stream.io().peer_cred() {
            Ok(cred) => Self {
                uid: Some(cred.uid()),
                gid: Some(cred.gid()),
                pid: cred.pid(),
            },
            Err(e) => {
                warn!("Failed to read peer credentials: {}", e);
                Self {
                    uid: None,
                    gid: None,
                    pid: None,
                }
            }
        }
    }
}

/// The user a request acts for.
#[derive(Debug, Clone)]
pub struct CurrentUser {
    /// Webspace owner the request operates on.
    pub user_id: u32,
    pub username: String,
    /// Who actually connected.
    pub caller: Identity,
}

impl<S> FromRequestParts<S> for CurrentUser
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<CurrentUser>()
            .cloned()
            .ok_or_else(|| ApiError::unauthorized("no caller identity"))
    }
}

/// Resolve the caller from peer credentials and inject [`CurrentUser`].
///
/// Root and admin group members may set [`USER_HEADER`] to act for
/// another user. The header is ignored for everyone else.
pub async fn identity_middleware(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<PeerCredentials>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let uid = peer
        .uid
        .ok_or_else(|| ApiError::unauthorized("peer credentials unavailable"))?;

    let requested = req
        .headers()
        .get(USER_HEADER)
        .and_then(|h| h.to_str().ok())
        .map(str::to_string);

    let caller = state.identity.identify(uid).await;
    let (user_id, username) = state
        .identity
        .effective_user(&caller, requested.as_deref())
        .await?;
    if user_id != caller.uid {
        info!("{} (uid {}) acting as {}", caller.username, caller.uid, username);
    }

    req.extensions_mut().insert(CurrentUser {
        user_id,
        username,
        caller,
    });
    Ok(next.run(req).await)
}
