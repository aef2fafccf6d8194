//! Caller identity resolution.
//!
//! Turns the uid reported by the control socket's peer credentials into a
//! username and an admin flag, and decides which user a request acts for.
//! Directory failures never fail a request: the username falls back to
//! `u<uid>` and admin checks fall back to "not an admin".

mod directory;

pub use directory::{Directory, DirectoryError, DirectoryResult, SystemDirectory, User};

use std::sync::Arc;

use log::warn;

/// Who is on the other end of the control socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub uid: u32,
    pub username: String,
    /// Root or a member of the admin group.
    pub privileged: bool,
}

/// Pick the username a request acts for.
///
/// Privileged callers may act for `requested`; everyone else always acts
/// for themselves.
pub fn effective_identity<'a>(
    resolved: &'a str,
    requested: Option<&'a str>,
    privileged: bool,
) -> &'a str {
    match requested {
        Some(name) if privileged && !name.is_empty() => name,
        _ => resolved,
    }
}

pub struct IdentityResolver {
    directory: Arc<dyn Directory>,
    admin_group: String,
}

impl IdentityResolver {
    pub fn new(directory: Arc<dyn Directory>, admin_group: impl Into<String>) -> Self {
        Self {
            directory,
            admin_group: admin_group.into(),
        }
    }

    pub fn directory(&self) -> &Arc<dyn Directory> {
        &self.directory
    }

    /// Username for `uid`, or `u<uid>` when the directory can't tell us.
    pub async fn resolve_username(&self, uid: u32) -> String {
        match self.directory.username_for_uid(uid).await {
            Ok(name) => name,
            Err(e) => {
                warn!("Failed to resolve username for uid {}: {}", uid, e);
                format!("u{uid}")
            }
        }
    }

    pub async fn is_admin(&self, username: &str) -> bool {
        match self
            .directory
            .is_group_member(username, &self.admin_group)
            .await
        {
            Ok(member) => member,
            Err(e) => {
                warn!(
                    "Failed to check membership of {} in group {}: {}",
                    username, self.admin_group, e
                );
                false
            }
        }
    }

    /// Resolve the full identity of a peer uid.
    pub async fn identify(&self, uid: u32) -> Identity {
        let username = self.resolve_username(uid).await;
        let privileged = uid == 0 || self.is_admin(&username).await;
        Identity {
            uid,
            username,
            privileged,
        }
    }

    /// Map the effective username of a request to a webspace user id.
    ///
    /// Acting for oneself never touches the directory.
    pub async fn effective_user(
        &self,
        identity: &Identity,
        requested: Option<&str>,
    ) -> DirectoryResult<(u32, String)> {
        let name = effective_identity(&identity.username, requested, identity.privileged);
        if name == identity.username {
            return Ok((identity.uid, identity.username.clone()));
        }

        let user = self.directory.user_by_name(name).await?;
        Ok((user.id, user.username))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct StaticDirectory;

    #[async_trait]
    impl Directory for StaticDirectory {
        async fn user_by_id(&self, uid: u32) -> DirectoryResult<User> {
            match uid {
                1000 => Ok(User {
                    id: 1000,
                    username: "alice".into(),
                    gid: 1000,
                }),
                2000 => Ok(User {
                    id: 2000,
                    username: "root-ish".into(),
                    gid: 2000,
                }),
                _ => Err(DirectoryError::UserNotFound(uid.to_string())),
            }
        }

        async fn user_by_name(&self, username: &str) -> DirectoryResult<User> {
            match username {
                "alice" => self.user_by_id(1000).await,
                "root-ish" => self.user_by_id(2000).await,
                _ => Err(DirectoryError::UserNotFound(username.to_string())),
            }
        }

        async fn is_group_member(&self, username: &str, group: &str) -> DirectoryResult<bool> {
            if group != "webspace-admin" {
                return Err(DirectoryError::GroupNotFound(group.to_string()));
            }
            Ok(username == "root-ish")
        }
    }

    fn resolver(group: &str) -> IdentityResolver {
        IdentityResolver::new(Arc::new(StaticDirectory), group)
    }

    // ========================================================================
    // effective_identity
    // ========================================================================

    #[test]
    fn test_unprivileged_cannot_impersonate() {
        assert_eq!(effective_identity("alice", Some("bob"), false), "alice");
        assert_eq!(effective_identity("alice", None, false), "alice");
    }

    #[test]
    fn test_privileged_impersonates() {
        assert_eq!(effective_identity("root", Some("bob"), true), "bob");
        assert_eq!(effective_identity("root", None, true), "root");
        assert_eq!(effective_identity("root", Some(""), true), "root");
    }

    // ========================================================================
    // IdentityResolver
    // ========================================================================

    #[tokio::test]
    async fn test_resolve_username_falls_back() {
        let r = resolver("webspace-admin");
        assert_eq!(r.resolve_username(1000).await, "alice");
        assert_eq!(r.resolve_username(4242).await, "u4242");
    }

    #[tokio::test]
    async fn test_is_admin_failure_is_not_admin() {
        assert!(resolver("webspace-admin").is_admin("root-ish").await);
        assert!(!resolver("webspace-admin").is_admin("alice").await);
        assert!(!resolver("missing-group").is_admin("root-ish").await);
    }

    #[tokio::test]
    async fn test_identify_root_is_privileged() {
        let r = resolver("webspace-admin");
        let root = r.identify(0).await;
        assert_eq!(root.username, "u0");
        assert!(root.privileged);

        let alice = r.identify(1000).await;
        assert!(!alice.privileged);
    }

    #[tokio::test]
    async fn test_effective_user() {
        let r = resolver("webspace-admin");
        let admin = r.identify(2000).await;
        assert_eq!(
            r.effective_user(&admin, Some("alice")).await.unwrap(),
            (1000, "alice".to_string())
        );
        assert!(matches!(
            r.effective_user(&admin, Some("nobody")).await,
            Err(DirectoryError::UserNotFound(_))
        ));

        // Unknown callers still act for themselves without a directory hit.
        let stranger = r.identify(4242).await;
        assert_eq!(
            r.effective_user(&stranger, Some("alice")).await.unwrap(),
            (4242, "u4242".to_string())
        );
    }
}
