//! Webspace error taxonomy and LXD error translation.

use thiserror::Error;

use crate::identity::DirectoryError;
use crate::lxd::LxdError;

/// Result type for webspace operations.
pub type WebspaceResult<T> = Result<T, WebspaceError>;

/// Errors surfaced by webspace and allocation operations.
#[derive(Debug, Error)]
pub enum WebspaceError {
    #[error("not found")]
    NotFound,

    #[error("webspace already exists")]
    AlreadyExists,

    #[error("webspace is not running")]
    NotRunning,

    #[error("webspace is already running")]
    AlreadyRunning,

    /// A port or domain is already claimed by some webspace.
    #[error("{0} is already in use")]
    AlreadyUsed(String),

    #[error("bad value: {0}")]
    BadValue(String),

    /// No TXT record on the domain proves ownership.
    #[error("domain {0} is not verified (missing TXT record)")]
    DomainUnverified(String),

    #[error("too many ports (maximum is {0})")]
    TooManyPorts(u16),

    #[error("no free ports left in range {start}-{end}")]
    PortsExhausted { start: u16, end: u16 },

    #[error("webspace has no network interface")]
    NoInterface,

    #[error("webspace has no IPv4 address")]
    NoAddress,

    #[error(transparent)]
    Directory(#[from] DirectoryError),

    #[error("failed to look up TXT records: {0}")]
    Dns(String),

    /// Command ran but exited non-zero.
    #[error("command exited with code {code}")]
    ExecFailed {
        code: i64,
        stdout: String,
        stderr: String,
    },

    #[error("failed to serialize webspace metadata: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Backend error with no known meaning, passed through unmodified.
    #[error("failed to {op}: {source}")]
    Unknown {
        op: &'static str,
        #[source]
        source: LxdError,
    },
}

/// Known LXD error messages and the kind each one means.
///
/// LXD does not return usable codes for these, so matching is on the exact text.
const KNOWN_LXD_ERRORS: &[(&str, Known)] = &[
    ("not found", Known::NotFound),
    ("No such object", Known::NotFound),
    ("Instance not found", Known::NotFound),
    (
        "Create instance: Add instance info to the database: This instance already exists",
        Known::AlreadyExists,
    ),
    ("The container is already stopped", Known::NotRunning),
    ("The instance is already stopped", Known::NotRunning),
    (
        "Common start logic: The container is already running",
        Known::AlreadyRunning,
    ),
    ("The instance is already running", Known::AlreadyRunning),
];

#[derive(Debug, Clone, Copy)]
enum Known {
    NotFound,
    AlreadyExists,
    NotRunning,
    AlreadyRunning,
}

impl From<Known> for WebspaceError {
    fn from(kind: Known) -> Self {
        match kind {
            Known::NotFound => WebspaceError::NotFound,
            Known::AlreadyExists => WebspaceError::AlreadyExists,
            Known::NotRunning => WebspaceError::NotRunning,
            Known::AlreadyRunning => WebspaceError::AlreadyRunning,
        }
    }
}

/// Translate an LXD error into the webspace taxonomy.
///
/// `op` names the attempted operation and is kept on unrecognized errors.
pub fn translate(op: &'static str, err: LxdError) -> WebspaceError {
    let message = err.to_string();
    KNOWN_LXD_ERRORS
        .iter()
        .find(|(known, _)| *known == message)
        .map(|(_, kind)| WebspaceError::from(*kind))
        .unwrap_or(WebspaceError::Unknown { op, source: err })
}

/// Shorthand for `map_err(|e| translate(op, e))`.
pub(crate) fn lxd_err(op: &'static str) -> impl FnOnce(LxdError) -> WebspaceError {
    move |err| translate(op, err)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api(status: u16, message: &str) -> LxdError {
        LxdError::Api {
            status,
            message: message.to_string(),
        }
    }

    #[test]
    fn test_translate_known_messages() {
        assert!(matches!(
            translate("get instance", api(404, "not found")),
            WebspaceError::NotFound
        ));
        assert!(matches!(
            translate("get instance", api(404, "Instance not found")),
            WebspaceError::NotFound
        ));
        assert!(matches!(
            translate("get instance", LxdError::Operation("No such object".into())),
            WebspaceError::NotFound
        ));
        assert!(matches!(
            translate(
                "create instance",
                LxdError::Operation(
                    "Create instance: Add instance info to the database: This instance already exists"
                        .into()
                )
            ),
            WebspaceError::AlreadyExists
        ));
        assert!(matches!(
            translate("stop", LxdError::Operation("The instance is already stopped".into())),
            WebspaceError::NotRunning
        ));
        assert!(matches!(
            translate("stop", api(400, "The container is already stopped")),
            WebspaceError::NotRunning
        ));
        assert!(matches!(
            translate(
                "start",
                LxdError::Operation("Common start logic: The container is already running".into())
            ),
            WebspaceError::AlreadyRunning
        ));
        assert!(matches!(
            translate("start", api(400, "The instance is already running")),
            WebspaceError::AlreadyRunning
        ));
    }

    #[test]
    fn test_translate_unknown_passes_through() {
        let err = translate("update instance", api(500, "disk on fire"));
        match &err {
            WebspaceError::Unknown { op, source } => {
                assert_eq!(*op, "update instance");
                assert_eq!(source.to_string(), "disk on fire");
            }
            other => panic!("expected Unknown, got {other:?}"),
        }
        assert_eq!(err.to_string(), "failed to update instance: disk on fire");
    }

    #[test]
    fn test_translate_matches_text_not_status() {
        // A 404 whose text is not in the table is still unknown.
        let err = translate("get network", api(404, "Network not found"));
        assert!(matches!(err, WebspaceError::Unknown { .. }));

        // Partial matches do not count.
        let err = translate("get instance", api(404, "not found: ws-u1"));
        assert!(matches!(err, WebspaceError::Unknown { .. }));
    }
}
