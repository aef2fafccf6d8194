//! Application state shared across handlers.

use std::sync::Arc;

use crate::identity::IdentityResolver;
use crate::webspace::WebspaceManager;

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<WebspaceManager>,
    pub identity: Arc<IdentityResolver>,
}

impl AppState {
    pub fn new(manager: Arc<WebspaceManager>, identity: Arc<IdentityResolver>) -> Self {
        Self { manager, identity }
    }
}
