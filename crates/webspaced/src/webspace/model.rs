//! Webspace records and the views derived from LXD state.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use super::error::{WebspaceError, WebspaceResult};
use crate::lxd::{ExecControl, Instance, InstanceState};

/// Instance config key holding the serialized webspace.
pub const METADATA_KEY: &str = "user._webspaced";

/// Longest startup delay a webspace may be configured with, in seconds.
pub const MAX_STARTUP_DELAY: f64 = 3600.0;

/// User-tunable webspace settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WebspaceConfig {
    /// Seconds to wait after boot before asking for the address.
    pub startup_delay: f64,
    /// Port the reverse proxy forwards HTTP traffic to.
    pub http_port: u16,
    /// Pass TLS through untouched instead of terminating it.
    pub sni_passthrough: bool,
}

impl Default for WebspaceConfig {
    fn default() -> Self {
        Self {
            startup_delay: 3.0,
            http_port: 80,
            sni_passthrough: false,
        }
    }
}

impl WebspaceConfig {
    pub fn validate(&self) -> WebspaceResult<()> {
        if !(0.0..=MAX_STARTUP_DELAY).contains(&self.startup_delay) {
            return Err(WebspaceError::BadValue(format!(
                "startup delay must be between 0 and {MAX_STARTUP_DELAY} seconds"
            )));
        }
        if self.http_port == 0 {
            return Err(WebspaceError::BadValue("HTTP port cannot be 0".to_string()));
        }
        Ok(())
    }
}

/// A user's webspace, as stored in its instance's config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Webspace {
    #[serde(rename = "user")]
    pub user_id: u32,
    pub config: WebspaceConfig,
    #[serde(default)]
    pub domains: Vec<String>,
    /// External port to internal port.
    #[serde(default)]
    pub ports: BTreeMap<u16, u16>,
}

impl Webspace {
    pub fn new(user_id: u32, config: WebspaceConfig) -> Self {
        Self {
            user_id,
            config,
            domains: Vec::new(),
            ports: BTreeMap::new(),
        }
    }

    /// Serialize for storage under [`METADATA_KEY`].
    pub fn to_metadata(&self) -> WebspaceResult<String> {
        if self.config.startup_delay < 0.0 {
            return Err(WebspaceError::BadValue(
                "startup delay cannot be negative".to_string(),
            ));
        }
        Ok(serde_json::to_string(self)?)
    }

    /// Load the webspace stored in an instance's config.
    ///
    /// Instances without the metadata key are not webspaces.
    pub fn from_instance(instance: &Instance) -> WebspaceResult<Self> {
        let raw = instance
            .put
            .config
            .get(METADATA_KEY)
            .ok_or(WebspaceError::NotFound)?;
        Ok(serde_json::from_str(raw)?)
    }

    pub fn claims_port(&self, external: u16) -> bool {
        self.ports.contains_key(&external)
    }

    pub fn claims_domain(&self, domain: &str) -> bool {
        self.domains.iter().any(|d| d == domain)
    }

    /// Remove a custom domain. Order of the remaining domains is not kept.
    pub fn remove_domain(&mut self, domain: &str) -> WebspaceResult<()> {
        let index = self
            .domains
            .iter()
            .position(|d| d == domain)
            .ok_or(WebspaceError::NotFound)?;
        self.domains.swap_remove(index);
        Ok(())
    }

    pub fn remove_port(&mut self, external: u16) -> WebspaceResult<()> {
        self.ports
            .remove(&external)
            .map(|_| ())
            .ok_or(WebspaceError::NotFound)
    }
}

/// Request to create a webspace.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitRequest {
    /// Image alias or fingerprint.
    pub image: String,
    /// Root password to set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// SSH public key to authorize for root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_key: Option<String>,
}

/// Output of a command run inside a webspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
}

/// Request to start an interactive command.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ExecInteractiveRequest {
    pub command: Vec<String>,
    pub environment: HashMap<String, String>,
    /// Initial terminal width in columns.
    pub width: u32,
    /// Initial terminal height in rows.
    pub height: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResizeRequest {
    pub width: u32,
    pub height: u32,
}

/// Control message for a running interactive command.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecInteractiveControl {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resize: Option<ResizeRequest>,
    /// Signal to send to the process.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal: Option<i32>,
}

impl ExecInteractiveControl {
    /// The backend messages this control stands for, resize first.
    pub fn controls(&self) -> Vec<ExecControl> {
        self.resize
            .map(|size| ExecControl::Resize {
                width: size.width,
                height: size.height,
            })
            .into_iter()
            .chain(self.signal.map(ExecControl::Signal))
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterfaceAddress {
    pub family: String,
    pub address: String,
    pub netmask: String,
    pub scope: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterfaceCounters {
    pub bytes_received: i64,
    pub bytes_sent: i64,
    pub packets_received: i64,
    pub packets_sent: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInterface {
    pub mac: String,
    pub mtu: i64,
    pub state: String,
    pub counters: InterfaceCounters,
    pub addresses: Vec<InterfaceAddress>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub cpu: i64,
    pub disks: BTreeMap<String, i64>,
    pub memory: i64,
    pub processes: i64,
}

/// Point-in-time view of a webspace's instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebspaceState {
    pub running: bool,
    pub usage: Usage,
    pub network_interfaces: BTreeMap<String, NetworkInterface>,
}

impl From<&InstanceState> for WebspaceState {
    fn from(state: &InstanceState) -> Self {
        // -1 means the storage driver can't report usage.
        let disks = state
            .disk
            .iter()
            .filter(|(_, disk)| disk.usage != -1)
            .map(|(name, disk)| (name.clone(), disk.usage))
            .collect();

        let empty = HashMap::new();
        let network_interfaces = state
            .network
            .as_ref()
            .unwrap_or(&empty)
            .iter()
            .filter(|(name, _)| name.as_str() != "lo")
            .map(|(name, net)| {
                let iface = NetworkInterface {
                    mac: net.hwaddr.clone(),
                    mtu: net.mtu,
                    state: net.state.clone(),
                    counters: InterfaceCounters {
                        bytes_received: net.counters.bytes_received,
                        bytes_sent: net.counters.bytes_sent,
                        packets_received: net.counters.packets_received,
                        packets_sent: net.counters.packets_sent,
                    },
                    addresses: net
                        .addresses
                        .iter()
                        .map(|a| InterfaceAddress {
                            family: a.family.clone(),
                            address: a.address.clone(),
                            netmask: a.netmask.clone(),
                            scope: a.scope.clone(),
                        })
                        .collect(),
                };
                (name.clone(), iface)
            })
            .collect();

        Self {
            running: state.is_running(),
            usage: Usage {
                cpu: state.cpu.usage,
                disks,
                memory: state.memory.usage,
                processes: state.processes,
            },
            network_interfaces,
        }
    }
}
