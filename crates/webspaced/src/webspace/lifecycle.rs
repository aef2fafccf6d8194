//! State transitions and state snapshots.

use log::info;

use super::error::{WebspaceError, WebspaceResult, lxd_err};
use super::manager::WebspaceManager;
use super::model::{Webspace, WebspaceConfig, WebspaceState};
use crate::lxd::StateAction;

impl WebspaceManager {
    async fn change_state(&self, webspace: &Webspace, action: StateAction) -> WebspaceResult<()> {
        let name = self.instance_name(webspace.user_id);
        self.lxd
            .update_instance_state(&name, action)
            .await
            .map_err(lxd_err("change instance state"))?;
        info!("Webspace {}: {}", name, action);
        Ok(())
    }

    /// Start the instance. Fails with `AlreadyRunning` if it is running.
    pub async fn boot(&self, webspace: &Webspace) -> WebspaceResult<()> {
        self.change_state(webspace, StateAction::Start).await
    }

    /// Stop the instance. Fails with `NotRunning` if it is stopped.
    pub async fn shutdown(&self, webspace: &Webspace) -> WebspaceResult<()> {
        self.change_state(webspace, StateAction::Stop).await
    }

    /// Restart a running instance.
    pub async fn reboot(&self, webspace: &Webspace) -> WebspaceResult<()> {
        let state = self
            .lxd
            .get_instance_state(&self.instance_name(webspace.user_id))
            .await
            .map_err(lxd_err("get instance state"))?;
        if !state.is_running() {
            return Err(WebspaceError::NotRunning);
        }

        self.change_state(webspace, StateAction::Restart).await
    }

    /// Delete the webspace, stopping it first if needed.
    ///
    /// Holds the allocation lock so freed ports and domains can't be
    /// claimed halfway through.
    pub async fn delete(&self, webspace: &Webspace) -> WebspaceResult<()> {
        let _guard = self.allocation.lock().await;
        self.discard(webspace).await?;
        info!("Deleted webspace {}", self.instance_name(webspace.user_id));
        Ok(())
    }

    pub async fn state(&self, webspace: &Webspace) -> WebspaceResult<WebspaceState> {
        let state = self
            .lxd
            .get_instance_state(&self.instance_name(webspace.user_id))
            .await
            .map_err(lxd_err("get instance state"))?;
        Ok(WebspaceState::from(&state))
    }

    /// Replace the webspace's config and persist it.
    ///
    /// On success `webspace` is replaced with the freshly saved record; on
    /// failure it is left untouched.
    pub async fn update_config(
        &self,
        webspace: &mut Webspace,
        config: WebspaceConfig,
    ) -> WebspaceResult<()> {
        config.validate()?;

        let _guard = self.allocation.lock().await;
        let mut current = self.get(webspace.user_id).await?;
        current.config = config;
        self.save(&current).await?;
        *webspace = current;
        Ok(())
    }
}
