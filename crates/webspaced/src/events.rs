//! Lifecycle event logging.
//!
//! Subscribes to LXD lifecycle events and logs the ones that concern
//! webspace instances. The subscription is re-established with backoff
//! whenever it drops.

use std::sync::Arc;

use futures::StreamExt;
use log::{debug, info, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::lxd::{Event, LxdApi};
use crate::retry::ExponentialBackoff;

static ACTION_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\S+-(\S+)$").expect("Invalid regex pattern for event action"));

/// Pattern matching the `source` of events for instances named `{prefix}u<uid>`.
pub fn source_pattern(prefix: &str) -> Result<Regex, regex::Error> {
    Regex::new(&format!(r"^/1\.0/\S+/{}u(\d+)$", regex::escape(prefix)))
}

/// Extract `(uid, action)` from a webspace lifecycle event.
///
/// `instance-started` becomes `started`. Events for other instances, or
/// with missing metadata, yield `None`.
pub fn describe_event(source: &Regex, event: &Event) -> Option<(u32, String)> {
    let origin = event.metadata.get("source")?.as_str()?;
    let uid = source.captures(origin)?.get(1)?.as_str().parse().ok()?;

    let action = event.metadata.get("action")?.as_str()?;
    let action = ACTION_PATTERN
        .captures(action)
        .and_then(|c| c.get(1))
        .map_or(action, |m| m.as_str());

    Some((uid, action.to_string()))
}

/// Background task logging webspace lifecycle events.
pub struct EventLogger {
    lxd: Arc<dyn LxdApi>,
    source: Regex,
    backoff: ExponentialBackoff,
}

impl EventLogger {
    pub fn new(lxd: Arc<dyn LxdApi>, instance_prefix: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            lxd,
            source: source_pattern(instance_prefix)?,
            backoff: ExponentialBackoff::default(),
        })
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Consume events forever, resubscribing after failures.
    pub async fn run(self) {
        let mut delay = self.backoff.initial_interval;
        loop {
            match self.lxd.lifecycle_events().await {
                Ok(mut events) => {
                    debug!("Subscribed to LXD lifecycle events");
                    delay = self.backoff.initial_interval;
                    while let Some(event) = events.next().await {
                        match event {
                            Ok(event) => self.log(&event),
                            Err(e) => {
                                warn!("LXD event stream failed: {}", e);
                                break;
                            }
                        }
                    }
                    warn!("LXD event stream ended, resubscribing in {:?}", delay);
                }
                Err(e) => {
                    warn!(
                        "Failed to subscribe to LXD events: {}, retrying in {:?}",
                        e, delay
                    );
                }
            }
            sleep(delay).await;
            delay = self.backoff.grow(delay);
        }
    }

    fn log(&self, event: &Event) {
        if let Some((uid, action)) = describe_event(&self.source, event) {
            info!("Webspace of uid {} {}", uid, action);
        }
    }
}
