//! User/group directory lookups.

use async_trait::async_trait;
use log::debug;
use thiserror::Error;
use tokio::process::Command;

/// Result type for directory lookups.
pub type DirectoryResult<T> = Result<T, DirectoryError>;

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("user not found: {0}")]
    UserNotFound(String),

    #[error("group not found: {0}")]
    GroupNotFound(String),

    /// The directory answered with something we could not parse.
    #[error("malformed directory entry: {0}")]
    Malformed(String),

    #[error("directory lookup failed: {0}")]
    Lookup(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A directory user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: u32,
    pub username: String,
    /// Primary group id.
    pub gid: u32,
}

/// Source of user and group information.
#[async_trait]
pub trait Directory: Send + Sync {
    async fn user_by_id(&self, uid: u32) -> DirectoryResult<User>;

    async fn user_by_name(&self, username: &str) -> DirectoryResult<User>;

    /// Whether `username` belongs to `group`, as a listed member or via its primary group.
    async fn is_group_member(&self, username: &str, group: &str) -> DirectoryResult<bool>;

    async fn username_for_uid(&self, uid: u32) -> DirectoryResult<String> {
        Ok(self.user_by_id(uid).await?.username)
    }
}

/// Directory backed by the system NSS databases via `getent`.
#[derive(Debug, Clone, Default)]
pub struct SystemDirectory;

impl SystemDirectory {
    pub fn new() -> Self {
        Self
    }

    /// Run `getent <database> <key>`, returning `None` when the key does not exist.
    async fn getent(database: &str, key: &str) -> DirectoryResult<Option<String>> {
        debug!("getent {} {}", database, key);
        let output = Command::new("getent")
            .args([database, key])
            .output()
            .await?;

        match output.status.code() {
            Some(0) => Ok(Some(
                String::from_utf8_lossy(&output.stdout).trim().to_string(),
            )),
            // getent exits with 2 when the key is not in the database.
            Some(2) => Ok(None),
            _ => Err(DirectoryError::Lookup(format!(
                "getent {database} {key}: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ))),
        }
    }

    async fn passwd(key: &str) -> DirectoryResult<User> {
        let line = Self::getent("passwd", key)
            .await?
            .ok_or_else(|| DirectoryError::UserNotFound(key.to_string()))?;
        parse_passwd(&line)
    }
}

#[async_trait]
impl Directory for SystemDirectory {
    async fn user_by_id(&self, uid: u32) -> DirectoryResult<User> {
        Self::passwd(&uid.to_string()).await
    }

    async fn user_by_name(&self, username: &str) -> DirectoryResult<User> {
        // A purely numeric name would be looked up as a uid by getent.
        if username.is_empty() || username.chars().all(|c| c.is_ascii_digit()) {
            return Err(DirectoryError::UserNotFound(username.to_string()));
        }
        Self::passwd(username).await
    }

    async fn is_group_member(&self, username: &str, group: &str) -> DirectoryResult<bool> {
        let line = Self::getent("group", group)
            .await?
            .ok_or_else(|| DirectoryError::GroupNotFound(group.to_string()))?;
        let entry = parse_group(&line)?;
        if entry.members.iter().any(|m| m == username) {
            return Ok(true);
        }

        let user = self.user_by_name(username).await?;
        Ok(user.gid == entry.gid)
    }
}

#[derive(Debug, PartialEq, Eq)]
struct GroupEntry {
    gid: u32,
    members: Vec<String>,
}

/// Parse a `name:passwd:uid:gid:gecos:home:shell` line.
fn parse_passwd(line: &str) -> DirectoryResult<User> {
    let parts: Vec<&str> = line.split(':').collect();
    if parts.len() < 4 {
        return Err(DirectoryError::Malformed(line.to_string()));
    }

    let id = parts[2]
        .parse()
        .map_err(|_| DirectoryError::Malformed(line.to_string()))?;
    let gid = parts[3]
        .parse()
        .map_err(|_| DirectoryError::Malformed(line.to_string()))?;

    Ok(User {
        id,
        username: parts[0].to_string(),
        gid,
    })
}

/// Parse a `name:passwd:gid:member,member` line.
fn parse_group(line: &str) -> DirectoryResult<GroupEntry> {
    let parts: Vec<&str> = line.split(':').collect();
    if parts.len() < 4 {
        return Err(DirectoryError::Malformed(line.to_string()));
    }

    let gid = parts[2]
        .parse()
        .map_err(|_| DirectoryError::Malformed(line.to_string()))?;
    let members = parts[3]
        .split(',')
        .filter(|m| !m.is_empty())
        .map(str::to_string)
        .collect();

    Ok(GroupEntry { gid, members })
}
