//! In-memory fakes for LXD, the user directory and DNS.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::Router;
use axum::extract::connect_info::MockConnectInfo;
use bytes::Bytes;
use futures::channel::{mpsc, oneshot};
use futures::{FutureExt, SinkExt, StreamExt, stream};

use webspaced::api::{self, AppState, PeerCredentials};
use webspaced::config::PortsConfig;
use webspaced::dns::{DnsError, TxtResolver};
use webspaced::identity::{Directory, DirectoryError, DirectoryResult, IdentityResolver, User};
use webspaced::lxd::{
    EventStream, ExecControl, ExecOutcome, ExecSession, Instance, InstanceExecPost, InstancePut,
    InstanceState, InstanceStateDisk, InstanceStateNetwork, InstanceStateNetworkAddress,
    InstancesPost, LogStream, LxdApi, LxdError, LxdResult, STATUS_RUNNING, STATUS_STOPPED,
    StateAction,
};
use webspaced::webspace::{
    ManagerConfig, METADATA_KEY, Webspace, WebspaceConfig, WebspaceManager,
};

pub const PREFIX: &str = "ws-";
pub const DOMAIN: &str = "webspace.test";
pub const ADMIN_GROUP: &str = "webspace-admin";

pub const ALICE: u32 = 1000;
pub const BOB: u32 = 1001;
pub const ADMIN: u32 = 2000;

pub fn instance_name(user_id: u32) -> String {
    format!("{PREFIX}u{user_id}")
}

fn api_error(status: u16, message: &str) -> LxdError {
    LxdError::Api {
        status,
        message: message.to_string(),
    }
}

// ============================================================================
// LXD
// ============================================================================

struct FakeInstance {
    instance: Instance,
    running: bool,
}

#[derive(Default)]
struct LxdInner {
    instances: BTreeMap<String, FakeInstance>,
    calls: Vec<String>,
    list_calls: usize,
    state_polls: usize,
    networks: Vec<String>,
    address: Option<String>,
    /// State polls of a running instance before it reports an address.
    address_after: usize,
    exec_exit_code: i64,
    exec_stdout: String,
    exec_stderr: String,
    interactive_requests: Vec<InstanceExecPost>,
    exec_controls: Vec<ExecControl>,
    fail_updates: bool,
}

/// LXD backed by a map of instances.
///
/// Running instances report `address` on `eth0` once they have been
/// polled `address_after` times. Interactive commands echo their input
/// until it ends (exit 0) or a signal arrives (exit 128 + signal).
pub struct FakeLxd {
    inner: Arc<Mutex<LxdInner>>,
}

impl Default for FakeLxd {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeLxd {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(LxdInner {
                networks: vec!["lxdbr0".to_string()],
                address: Some("10.0.3.15".to_string()),
                ..Default::default()
            })),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LxdInner> {
        self.inner.lock().unwrap()
    }

    /// Store `webspace` as an instance with metadata.
    pub fn insert_webspace(&self, webspace: &Webspace, running: bool) {
        let metadata = serde_json::to_string(webspace).unwrap();
        self.insert_instance(
            &instance_name(webspace.user_id),
            HashMap::from([(METADATA_KEY.to_string(), metadata)]),
            running,
        );
    }

    pub fn insert_instance(&self, name: &str, config: HashMap<String, String>, running: bool) {
        let instance = Instance {
            name: name.to_string(),
            put: InstancePut {
                config,
                ..Default::default()
            },
            ..Default::default()
        };
        self.lock().instances.insert(
            name.to_string(),
            FakeInstance { instance, running },
        );
    }

    pub fn has_instance(&self, name: &str) -> bool {
        self.lock().instances.contains_key(name)
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.lock()
            .instances
            .get(name)
            .is_some_and(|i| i.running)
    }

    pub fn set_running(&self, name: &str, running: bool) {
        if let Some(instance) = self.lock().instances.get_mut(name) {
            instance.running = running;
        }
    }

    /// Metadata stored on the instance, parsed.
    pub fn stored(&self, user_id: u32) -> Option<Webspace> {
        let inner = self.lock();
        let raw = inner
            .instances
            .get(&instance_name(user_id))?
            .instance
            .put
            .config
            .get(METADATA_KEY)?
            .clone();
        serde_json::from_str(&raw).ok()
    }

    pub fn instance(&self, name: &str) -> Option<Instance> {
        self.lock().instances.get(name).map(|i| i.instance.clone())
    }

    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    pub fn list_calls(&self) -> usize {
        self.lock().list_calls
    }

    pub fn state_polls(&self) -> usize {
        self.lock().state_polls
    }

    pub fn set_address(&self, address: Option<&str>) {
        self.lock().address = address.map(str::to_string);
    }

    pub fn set_address_after(&self, polls: usize) {
        self.lock().address_after = polls;
    }

    pub fn set_exec_output(&self, exit_code: i64, stdout: &str, stderr: &str) {
        let mut inner = self.lock();
        inner.exec_exit_code = exit_code;
        inner.exec_stdout = stdout.to_string();
        inner.exec_stderr = stderr.to_string();
    }

    pub fn interactive_requests(&self) -> Vec<InstanceExecPost> {
        self.lock().interactive_requests.clone()
    }

    pub fn exec_controls(&self) -> Vec<ExecControl> {
        self.lock().exec_controls.clone()
    }

    pub fn fail_updates(&self) {
        self.lock().fail_updates = true;
    }

    pub fn remove_network(&self, name: &str) {
        self.lock().networks.retain(|n| n != name);
    }
}

fn log_stream(text: String) -> LogStream {
    Box::pin(stream::iter(vec![Ok(Bytes::from(text))]))
}

#[async_trait]
impl LxdApi for FakeLxd {
    async fn list_instances(&self) -> LxdResult<Vec<Instance>> {
        // Let concurrent callers interleave, as they would over the socket.
        tokio::task::yield_now().await;
        let mut inner = self.lock();
        inner.list_calls += 1;
        inner.calls.push("list".to_string());
        Ok(inner
            .instances
            .values()
            .map(|i| i.instance.clone())
            .collect())
    }

    async fn get_instance(&self, name: &str) -> LxdResult<Instance> {
        self.lock()
            .instances
            .get(name)
            .map(|i| i.instance.clone())
            .ok_or_else(|| api_error(404, "not found"))
    }

    async fn create_instance(&self, request: &InstancesPost) -> LxdResult<()> {
        let mut inner = self.lock();
        inner.calls.push(format!("create {}", request.name));
        if inner.instances.contains_key(&request.name) {
            return Err(LxdError::Operation(
                "Create instance: Add instance info to the database: This instance already exists"
                    .to_string(),
            ));
        }
        let instance = Instance {
            name: request.name.clone(),
            put: request.put.clone(),
            ..Default::default()
        };
        inner.instances.insert(
            request.name.clone(),
            FakeInstance {
                instance,
                running: false,
            },
        );
        Ok(())
    }

    async fn update_instance(&self, name: &str, put: &InstancePut) -> LxdResult<()> {
        tokio::task::yield_now().await;
        let mut inner = self.lock();
        inner.calls.push(format!("update {name}"));
        if inner.fail_updates {
            return Err(api_error(500, "disk quota exceeded"));
        }
        let instance = inner
            .instances
            .get_mut(name)
            .ok_or_else(|| api_error(404, "not found"))?;
        instance.instance.put = put.clone();
        Ok(())
    }

    async fn delete_instance(&self, name: &str) -> LxdResult<()> {
        let mut inner = self.lock();
        inner.calls.push(format!("delete {name}"));
        let running = inner.instances.get(name).map(|i| i.running);
        match running {
            None => Err(api_error(404, "not found")),
            Some(true) => Err(LxdError::Operation("Instance is running".to_string())),
            Some(false) => {
                inner.instances.remove(name);
                Ok(())
            }
        }
    }

    async fn update_instance_state(&self, name: &str, action: StateAction) -> LxdResult<()> {
        let mut inner = self.lock();
        inner.calls.push(format!("{action} {name}"));
        let instance = inner
            .instances
            .get_mut(name)
            .ok_or_else(|| api_error(404, "not found"))?;
        match (action, instance.running) {
            (StateAction::Start, true) => Err(LxdError::Operation(
                "The instance is already running".to_string(),
            )),
            (StateAction::Stop, false) | (StateAction::Restart, false) => Err(
                LxdError::Operation("The instance is already stopped".to_string()),
            ),
            (StateAction::Start, false) => {
                instance.running = true;
                Ok(())
            }
            (StateAction::Stop, true) => {
                instance.running = false;
                Ok(())
            }
            (StateAction::Restart, true) => Ok(()),
        }
    }

    async fn get_instance_state(&self, name: &str) -> LxdResult<InstanceState> {
        let mut inner = self.lock();
        inner.state_polls += 1;
        let running = inner
            .instances
            .get(name)
            .map(|i| i.running)
            .ok_or_else(|| api_error(404, "not found"))?;

        if !running {
            return Ok(InstanceState {
                status: "Stopped".to_string(),
                status_code: STATUS_STOPPED,
                ..Default::default()
            });
        }

        let mut addresses = vec![InstanceStateNetworkAddress {
            family: "inet6".to_string(),
            address: "fe80::1".to_string(),
            netmask: "64".to_string(),
            scope: "link".to_string(),
        }];
        if inner.state_polls > inner.address_after {
            if let Some(address) = &inner.address {
                addresses.push(InstanceStateNetworkAddress {
                    family: "inet".to_string(),
                    address: address.clone(),
                    netmask: "24".to_string(),
                    scope: "global".to_string(),
                });
            }
        }
        let network = HashMap::from([
            (
                "eth0".to_string(),
                InstanceStateNetwork {
                    addresses,
                    hwaddr: "00:16:3e:aa:bb:cc".to_string(),
                    mtu: 1500,
                    state: "up".to_string(),
                    ..Default::default()
                },
            ),
            (
                "lo".to_string(),
                InstanceStateNetwork {
                    mtu: 65536,
                    state: "up".to_string(),
                    ..Default::default()
                },
            ),
        ]);

        Ok(InstanceState {
            status: "Running".to_string(),
            status_code: STATUS_RUNNING,
            disk: HashMap::from([
                ("root".to_string(), InstanceStateDisk { usage: 4096 }),
                ("scratch".to_string(), InstanceStateDisk { usage: -1 }),
            ]),
            network: Some(network),
            processes: 12,
            ..Default::default()
        })
    }

    async fn exec_instance(
        &self,
        name: &str,
        request: &InstanceExecPost,
    ) -> LxdResult<ExecOutcome> {
        let mut inner = self.lock();
        inner
            .calls
            .push(format!("exec {name} {}", request.command.join(" ")));
        let running = inner
            .instances
            .get(name)
            .map(|i| i.running)
            .ok_or_else(|| api_error(404, "not found"))?;
        if !running {
            return Err(api_error(400, "Instance is not running"));
        }
        Ok(ExecOutcome {
            stdout_log: "exec_1.stdout".to_string(),
            stderr_log: "exec_1.stderr".to_string(),
            exit_code: inner.exec_exit_code,
        })
    }

    async fn exec_interactive(
        &self,
        name: &str,
        request: &InstanceExecPost,
    ) -> LxdResult<ExecSession> {
        {
            let mut inner = self.lock();
            inner
                .calls
                .push(format!("exec-interactive {name} {}", request.command.join(" ")));
            let running = inner
                .instances
                .get(name)
                .map(|i| i.running)
                .ok_or_else(|| api_error(404, "not found"))?;
            if !running {
                return Err(api_error(400, "Instance is not running"));
            }
            inner.interactive_requests.push(request.clone());
        }

        let (input_tx, mut input_rx) = mpsc::unbounded::<Bytes>();
        let (control_tx, mut control_rx) = mpsc::unbounded::<ExecControl>();
        let (output_tx, output_rx) = mpsc::unbounded::<LxdResult<Bytes>>();
        let (exit_tx, exit_rx) = oneshot::channel::<i64>();
        let inner = Arc::clone(&self.inner);

        tokio::spawn(async move {
            let code = loop {
                tokio::select! {
                    chunk = input_rx.next() => match chunk {
                        Some(chunk) => {
                            let _ = output_tx.unbounded_send(Ok(chunk));
                        }
                        None => break 0,
                    },
                    Some(control) = control_rx.next() => {
                        inner.lock().unwrap().exec_controls.push(control);
                        if let ExecControl::Signal(signal) = control {
                            break 128 + i64::from(signal);
                        }
                    }
                }
            };
            drop(output_tx);
            let _ = exit_tx.send(code);
        });

        let channel_err = |e: mpsc::SendError| LxdError::WebSocket(e.to_string());
        Ok(ExecSession {
            input: Box::pin(input_tx.sink_map_err(channel_err)),
            output: output_rx.boxed(),
            control: Box::pin(control_tx.sink_map_err(channel_err)),
            exit: async move {
                exit_rx
                    .await
                    .map_err(|_| LxdError::Operation("exec session dropped".to_string()))
            }
            .boxed(),
        })
    }

    async fn get_instance_log_file(&self, _name: &str, file: &str) -> LxdResult<LogStream> {
        let inner = self.lock();
        let text = if file.ends_with(".stdout") {
            inner.exec_stdout.clone()
        } else {
            inner.exec_stderr.clone()
        };
        Ok(log_stream(text))
    }

    async fn get_instance_console_log(&self, name: &str) -> LxdResult<LogStream> {
        if !self.has_instance(name) {
            return Err(api_error(404, "not found"));
        }
        Ok(log_stream(format!("console of {name}\n")))
    }

    async fn get_network(&self, name: &str) -> LxdResult<()> {
        if self.lock().networks.iter().any(|n| n == name) {
            Ok(())
        } else {
            Err(api_error(404, "not found"))
        }
    }

    async fn lifecycle_events(&self) -> LxdResult<EventStream> {
        Ok(Box::pin(stream::empty()))
    }
}

// ============================================================================
// Directory
// ============================================================================

/// Fixed passwd/group database.
pub struct FakeDirectory {
    users: Vec<User>,
    groups: HashMap<String, Vec<String>>,
}

impl Default for FakeDirectory {
    fn default() -> Self {
        let user = |id, name: &str| User {
            id,
            username: name.to_string(),
            gid: id,
        };
        Self {
            users: vec![
                user(0, "root"),
                user(ALICE, "alice"),
                user(BOB, "bob"),
                user(ADMIN, "admin"),
            ],
            groups: HashMap::from([(ADMIN_GROUP.to_string(), vec!["admin".to_string()])]),
        }
    }
}

#[async_trait]
impl Directory for FakeDirectory {
    async fn user_by_id(&self, uid: u32) -> DirectoryResult<User> {
        self.users
            .iter()
            .find(|u| u.id == uid)
            .cloned()
            .ok_or_else(|| DirectoryError::UserNotFound(uid.to_string()))
    }

    async fn user_by_name(&self, username: &str) -> DirectoryResult<User> {
        self.users
            .iter()
            .find(|u| u.username == username)
            .cloned()
            .ok_or_else(|| DirectoryError::UserNotFound(username.to_string()))
    }

    async fn is_group_member(&self, username: &str, group: &str) -> DirectoryResult<bool> {
        let members = self
            .groups
            .get(group)
            .ok_or_else(|| DirectoryError::GroupNotFound(group.to_string()))?;
        Ok(members.iter().any(|m| m == username))
    }
}

// ============================================================================
// DNS
// ============================================================================

/// TXT records by domain. Lookups of `fail.<anything>` fail.
#[derive(Default)]
pub struct FakeResolver {
    records: Mutex<HashMap<String, Vec<String>>>,
}

impl FakeResolver {
    pub fn set_txt(&self, domain: &str, records: &[&str]) {
        self.records.lock().unwrap().insert(
            domain.to_string(),
            records.iter().map(|r| r.to_string()).collect(),
        );
    }
}

#[async_trait]
impl TxtResolver for FakeResolver {
    async fn lookup_txt(&self, domain: &str) -> Result<Vec<String>, DnsError> {
        if domain.starts_with("fail.") {
            return Err(DnsError {
                domain: domain.to_string(),
                message: "SERVFAIL".to_string(),
            });
        }
        Ok(self
            .records
            .lock()
            .unwrap()
            .get(domain)
            .cloned()
            .unwrap_or_default())
    }
}

// ============================================================================
// Wiring
// ============================================================================

pub fn manager_config(ports: PortsConfig) -> ManagerConfig {
    ManagerConfig {
        instance_prefix: PREFIX.to_string(),
        profiles: vec!["default".to_string()],
        domain: DOMAIN.to_string(),
        config_defaults: WebspaceConfig::default(),
        ports,
    }
}

/// Ports 10000-10010, at most two per webspace.
pub fn small_ports() -> PortsConfig {
    PortsConfig {
        start: 10000,
        end: 10010,
        max: 2,
    }
}

pub struct Harness {
    pub lxd: Arc<FakeLxd>,
    pub resolver: Arc<FakeResolver>,
    pub manager: Arc<WebspaceManager>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_ports(small_ports())
    }

    pub fn with_ports(ports: PortsConfig) -> Self {
        let lxd = Arc::new(FakeLxd::new());
        let resolver = Arc::new(FakeResolver::default());
        let manager = Arc::new(WebspaceManager::new(
            lxd.clone(),
            Arc::new(FakeDirectory::default()),
            resolver.clone(),
            manager_config(ports),
        ));
        Self {
            lxd,
            resolver,
            manager,
        }
    }

    /// Store an empty webspace for `user_id` and return it.
    pub fn seed(&self, user_id: u32, running: bool) -> Webspace {
        let webspace = Webspace::new(user_id, WebspaceConfig::default());
        self.lxd.insert_webspace(&webspace, running);
        webspace
    }

    /// Router whose every connection comes from `uid`.
    pub fn router_as(&self, uid: u32) -> Router {
        let identity = Arc::new(IdentityResolver::new(
            Arc::new(FakeDirectory::default()),
            ADMIN_GROUP,
        ));
        api::create_router(AppState::new(self.manager.clone(), identity))
            .layer(MockConnectInfo(PeerCredentials::from_uid(uid)))
    }
}
