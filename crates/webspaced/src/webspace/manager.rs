//! Webspace manager: lookup, creation and persistence.

use std::collections::HashMap;
use std::sync::Arc;

use futures::TryStreamExt;
use log::{debug, info, warn};
use tokio::sync::Mutex;

use super::error::{WebspaceError, WebspaceResult, lxd_err};
use super::model::{
    ExecInteractiveRequest, ExecOutput, InitRequest, METADATA_KEY, Webspace, WebspaceConfig,
};
use crate::config::PortsConfig;
use crate::dns::TxtResolver;
use crate::identity::Directory;
use crate::lxd::{
    ExecSession, InstanceExecPost, InstancePut, InstancesPost, LogStream, LxdApi, LxdResult,
};
use crate::retry::ExponentialBackoff;

/// Terminal type for interactive commands that don't set one.
const DEFAULT_TERM: &str = "xterm-256color";

/// Settings the manager needs from the daemon config.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub instance_prefix: String,
    pub profiles: Vec<String>,
    /// Suffix of every primary domain.
    pub domain: String,
    pub config_defaults: WebspaceConfig,
    pub ports: PortsConfig,
}

/// Owns all webspaces.
///
/// LXD is the only store: every read goes to the backend and every
/// mutation is written back into the instance config. Operations that check
/// then claim ports or domains, as well as creation and deletion, are
/// serialized by a single allocation lock.
pub struct WebspaceManager {
    pub(super) lxd: Arc<dyn LxdApi>,
    pub(super) directory: Arc<dyn Directory>,
    pub(super) resolver: Arc<dyn TxtResolver>,
    pub(super) config: ManagerConfig,
    pub(super) allocation: Mutex<()>,
    pub(super) ip_backoff: ExponentialBackoff,
}

impl WebspaceManager {
    pub fn new(
        lxd: Arc<dyn LxdApi>,
        directory: Arc<dyn Directory>,
        resolver: Arc<dyn TxtResolver>,
        config: ManagerConfig,
    ) -> Self {
        Self {
            lxd,
            directory,
            resolver,
            config,
            allocation: Mutex::new(()),
            ip_backoff: ExponentialBackoff::default()
                .with_max_elapsed(std::time::Duration::from_secs(10)),
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Name of the instance backing `user_id`'s webspace.
    pub fn instance_name(&self, user_id: u32) -> String {
        format!("{}u{}", self.config.instance_prefix, user_id)
    }

    /// Inverse of [`instance_name`](Self::instance_name).
    pub fn user_id_for_instance(&self, name: &str) -> Option<u32> {
        let id = name
            .strip_prefix(&self.config.instance_prefix)?
            .strip_prefix('u')?;
        if id.is_empty() || !id.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
        id.parse().ok()
    }

    pub async fn get(&self, user_id: u32) -> WebspaceResult<Webspace> {
        let instance = self
            .lxd
            .get_instance(&self.instance_name(user_id))
            .await
            .map_err(lxd_err("get instance"))?;
        Webspace::from_instance(&instance)
    }

    /// Every webspace, read fresh from LXD.
    ///
    /// Instances that are not ours or carry unreadable metadata are skipped.
    pub async fn get_all(&self) -> WebspaceResult<Vec<Webspace>> {
        let instances = self
            .lxd
            .list_instances()
            .await
            .map_err(lxd_err("list instances"))?;

        let mut webspaces = Vec::new();
        for instance in &instances {
            if self.user_id_for_instance(&instance.name).is_none() {
                continue;
            }
            match Webspace::from_instance(instance) {
                Ok(ws) => webspaces.push(ws),
                Err(e) => warn!("Skipping instance {}: {}", instance.name, e),
            }
        }

        Ok(webspaces)
    }

    /// Create the webspace for `user_id` from an image.
    ///
    /// When a root password or SSH key is requested, the instance is booted
    /// to apply them and shut down again. If that fails the instance is
    /// removed so creation can be retried.
    pub async fn create(&self, user_id: u32, request: &InitRequest) -> WebspaceResult<Webspace> {
        if request.image.is_empty() {
            return Err(WebspaceError::BadValue("image cannot be empty".to_string()));
        }

        let _guard = self.allocation.lock().await;

        let webspace = Webspace::new(user_id, self.config.config_defaults.clone());
        let name = self.instance_name(user_id);
        let put = InstancePut {
            config: HashMap::from([(METADATA_KEY.to_string(), webspace.to_metadata()?)]),
            profiles: self.config.profiles.clone(),
            ..Default::default()
        };

        self.lxd
            .create_instance(&InstancesPost::container(&name, &request.image, put))
            .await
            .map_err(lxd_err("create instance"))?;
        info!("Created webspace {} for user {}", name, user_id);

        if request.password.is_some() || request.ssh_key.is_some() {
            if let Err(e) = self.initial_setup(&webspace, request).await {
                warn!("Setup of {} failed, removing instance: {}", name, e);
                if let Err(cleanup) = self.discard(&webspace).await {
                    warn!("Failed to remove {}: {}", name, cleanup);
                }
                return Err(e);
            }
        }

        Ok(webspace)
    }

    async fn initial_setup(&self, webspace: &Webspace, request: &InitRequest) -> WebspaceResult<()> {
        self.boot(webspace).await?;
        let applied = self.apply_credentials(webspace, request).await;
        let shutdown = self.shutdown(webspace).await;
        applied.and(shutdown)
    }

    async fn apply_credentials(
        &self,
        webspace: &Webspace,
        request: &InitRequest,
    ) -> WebspaceResult<()> {
        if let Some(password) = &request.password {
            let entry = shell_quote(&format!("root:{password}"));
            self.exec_checked(webspace, &format!("echo {entry} | chpasswd"))
                .await?;
        }
        if let Some(key) = &request.ssh_key {
            let key = shell_quote(key);
            self.exec_checked(
                webspace,
                &format!(
                    "mkdir -p /root/.ssh && chmod 700 /root/.ssh && echo {key} >> /root/.ssh/authorized_keys"
                ),
            )
            .await?;
        }
        Ok(())
    }

    /// Remove a webspace's instance without taking the allocation lock.
    pub(super) async fn discard(&self, webspace: &Webspace) -> WebspaceResult<()> {
        let name = self.instance_name(webspace.user_id);
        let state = self
            .lxd
            .get_instance_state(&name)
            .await
            .map_err(lxd_err("get instance state"))?;
        if state.is_running() {
            self.shutdown(webspace).await?;
        }

        self.lxd
            .delete_instance(&name)
            .await
            .map_err(lxd_err("delete instance"))
    }

    /// Write the webspace's metadata back into its instance config.
    pub async fn save(&self, webspace: &Webspace) -> WebspaceResult<()> {
        let metadata = webspace.to_metadata()?;
        let name = self.instance_name(webspace.user_id);

        let mut instance = self
            .lxd
            .get_instance(&name)
            .await
            .map_err(lxd_err("get instance"))?;
        instance
            .put
            .config
            .insert(METADATA_KEY.to_string(), metadata);

        self.lxd
            .update_instance(&name, &instance.put)
            .await
            .map_err(lxd_err("update instance"))?;
        debug!("Saved webspace {}", name);
        Ok(())
    }

    /// `<username>.<domain>`, from a live directory lookup.
    pub async fn primary_domain(&self, user_id: u32) -> WebspaceResult<String> {
        let username = self.directory.username_for_uid(user_id).await?;
        Ok(format!("{}.{}", username, self.config.domain))
    }

    /// The primary domain followed by the custom domains.
    pub async fn domains(&self, webspace: &Webspace) -> WebspaceResult<Vec<String>> {
        let mut domains = Vec::with_capacity(webspace.domains.len() + 1);
        domains.push(self.primary_domain(webspace.user_id).await?);
        domains.extend(webspace.domains.iter().cloned());
        Ok(domains)
    }

    /// Run `sh -c <command>` inside the webspace and collect its output.
    pub async fn exec(&self, webspace: &Webspace, command: &str) -> WebspaceResult<ExecOutput> {
        let name = self.instance_name(webspace.user_id);
        let request = InstanceExecPost::recorded(vec![
            "sh".to_string(),
            "-c".to_string(),
            command.to_string(),
        ]);

        let outcome = self
            .lxd
            .exec_instance(&name, &request)
            .await
            .map_err(lxd_err("execute command"))?;

        let stdout = self
            .lxd
            .get_instance_log_file(&name, &outcome.stdout_log)
            .await
            .map_err(lxd_err("retrieve command stdout"))?;
        let stdout = read_log(stdout)
            .await
            .map_err(lxd_err("read command stdout"))?;

        let stderr = self
            .lxd
            .get_instance_log_file(&name, &outcome.stderr_log)
            .await
            .map_err(lxd_err("retrieve command stderr"))?;
        let stderr = read_log(stderr)
            .await
            .map_err(lxd_err("read command stderr"))?;

        Ok(ExecOutput {
            stdout,
            stderr,
            exit_code: outcome.exit_code,
        })
    }

    /// Start an interactive command attached to a terminal in the webspace.
    pub async fn exec_interactive(
        &self,
        webspace: &Webspace,
        request: &ExecInteractiveRequest,
    ) -> WebspaceResult<ExecSession> {
        if request.command.is_empty() {
            return Err(WebspaceError::BadValue("command cannot be empty".to_string()));
        }

        let name = self.instance_name(webspace.user_id);
        let mut environment = request.environment.clone();
        environment
            .entry("TERM".to_string())
            .or_insert_with(|| DEFAULT_TERM.to_string());
        let post = InstanceExecPost::interactive(
            request.command.clone(),
            environment,
            request.width,
            request.height,
        );

        let session = self
            .lxd
            .exec_interactive(&name, &post)
            .await
            .map_err(lxd_err("execute command"))?;
        info!(
            "Webspace {}: started interactive command {:?}",
            name, request.command
        );
        Ok(session)
    }

    /// Like [`exec`](Self::exec), but a non-zero exit code is an error.
    async fn exec_checked(&self, webspace: &Webspace, command: &str) -> WebspaceResult<()> {
        let output = self.exec(webspace, command).await?;
        if output.exit_code != 0 {
            return Err(WebspaceError::ExecFailed {
                code: output.exit_code,
                stdout: output.stdout,
                stderr: output.stderr,
            });
        }
        Ok(())
    }

    /// The instance's console log. Dropping the stream closes it.
    pub async fn console_log(&self, webspace: &Webspace) -> WebspaceResult<LogStream> {
        self.lxd
            .get_instance_console_log(&self.instance_name(webspace.user_id))
            .await
            .map_err(lxd_err("get console log"))
    }
}

async fn read_log(stream: LogStream) -> LxdResult<String> {
    let chunks: Vec<bytes::Bytes> = stream.try_collect().await?;
    Ok(String::from_utf8_lossy(&chunks.concat()).into_owned())
}

/// Quote `value` as a single POSIX shell word.
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}
