//! Booting a webspace and waiting for its address.

use std::time::Duration;

use log::debug;

use super::error::{WebspaceError, WebspaceResult, lxd_err};
use super::manager::WebspaceManager;
use super::model::Webspace;
use crate::lxd::InstanceState;
use crate::retry::retry;

/// Interface the address is read from.
const PRIMARY_INTERFACE: &str = "eth0";

/// Global IPv4 address of the primary interface.
pub fn select_address(state: &InstanceState) -> WebspaceResult<String> {
    let iface = state
        .network
        .as_ref()
        .and_then(|network| network.get(PRIMARY_INTERFACE))
        .ok_or(WebspaceError::NoInterface)?;

    iface
        .addresses
        .iter()
        .find(|addr| addr.family == "inet" && addr.scope == "global")
        .map(|addr| addr.address.clone())
        .ok_or(WebspaceError::NoAddress)
}

impl WebspaceManager {
    pub async fn get_ip(&self, webspace: &Webspace) -> WebspaceResult<String> {
        let state = self
            .lxd
            .get_instance_state(&self.instance_name(webspace.user_id))
            .await
            .map_err(lxd_err("get instance state"))?;
        select_address(&state)
    }

    /// Poll for the address until the backoff budget runs out.
    pub async fn await_ip(&self, webspace: &Webspace) -> WebspaceResult<String> {
        retry(
            &self.ip_backoff,
            || self.get_ip(webspace),
            |err, delay| {
                debug!(
                    "Failed to get IP of webspace for uid {} ({}), retrying in {:?}",
                    webspace.user_id, err, delay
                );
            },
        )
        .await
    }

    /// Return the webspace's address, booting it first if it is stopped.
    ///
    /// A freshly booted webspace gets exactly its configured startup delay
    /// and a single address lookup.
    pub async fn ensure_started(&self, webspace: &Webspace) -> WebspaceResult<String> {
        let state = self
            .lxd
            .get_instance_state(&self.instance_name(webspace.user_id))
            .await
            .map_err(lxd_err("get instance state"))?;

        if state.is_running() {
            return self.await_ip(webspace).await;
        }

        // Stored metadata is not validated on read.
        let delay = Duration::try_from_secs_f64(webspace.config.startup_delay).map_err(|_| {
            WebspaceError::BadValue(format!(
                "invalid startup delay {}",
                webspace.config.startup_delay
            ))
        })?;

        self.boot(webspace).await?;
        tokio::time::sleep(delay).await;
        self.get_ip(webspace).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lxd::{InstanceStateNetwork, InstanceStateNetworkAddress};
    use std::collections::HashMap;

    fn addr(family: &str, address: &str, scope: &str) -> InstanceStateNetworkAddress {
        InstanceStateNetworkAddress {
            family: family.into(),
            address: address.into(),
            netmask: "24".into(),
            scope: scope.into(),
        }
    }

    fn with_interface(name: &str, addresses: Vec<InstanceStateNetworkAddress>) -> InstanceState {
        let mut network = HashMap::new();
        network.insert(
            name.to_string(),
            InstanceStateNetwork {
                addresses,
                ..Default::default()
            },
        );
        InstanceState {
            network: Some(network),
            ..Default::default()
        }
    }

    #[test]
    fn test_select_address_picks_global_ipv4() {
        let state = with_interface(
            "eth0",
            vec![
                addr("inet6", "fe80::1", "link"),
                addr("inet", "127.0.0.2", "local"),
                addr("inet", "10.172.0.15", "global"),
            ],
        );
        assert_eq!(select_address(&state).unwrap(), "10.172.0.15");
    }

    #[test]
    fn test_select_address_missing_interface() {
        assert!(matches!(
            select_address(&InstanceState::default()),
            Err(WebspaceError::NoInterface)
        ));
        let state = with_interface("eth1", vec![addr("inet", "10.0.0.1", "global")]);
        assert!(matches!(
            select_address(&state),
            Err(WebspaceError::NoInterface)
        ));
    }

    #[test]
    fn test_select_address_no_global_ipv4() {
        let state = with_interface("eth0", vec![addr("inet6", "fd42::5", "global")]);
        assert!(matches!(
            select_address(&state),
            Err(WebspaceError::NoAddress)
        ));
    }
}
