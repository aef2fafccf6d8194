//! Port and domain allocation across all webspaces.
//!
//! External ports and custom domains are unique across the whole
//! collection. Every claim re-reads the collection from LXD while holding
//! the allocation lock, so two requests can never claim the same value.
//! Releases also re-read the stored record under the lock, so a stale copy
//! held by the caller never undoes a concurrent change.

use std::collections::BTreeSet;

use log::info;
use rand::Rng;

use super::error::{WebspaceError, WebspaceResult};
use super::manager::WebspaceManager;
use super::model::Webspace;

impl WebspaceManager {
    /// Forward `external` to `internal`, picking a free external port when
    /// `external` is 0. Returns the external port used.
    ///
    /// On success `webspace` is replaced with the freshly saved record.
    pub async fn add_port(
        &self,
        webspace: &mut Webspace,
        external: u16,
        internal: u16,
    ) -> WebspaceResult<u16> {
        let range = self.config.ports;
        if internal == 0 {
            return Err(WebspaceError::BadValue(
                "internal port cannot be 0".to_string(),
            ));
        }
        if webspace.ports.len() >= usize::from(range.max) {
            return Err(WebspaceError::TooManyPorts(range.max));
        }
        if external != 0 && !(range.start..=range.end).contains(&external) {
            return Err(WebspaceError::BadValue(format!(
                "external port out of range {}-{}",
                range.start, range.end
            )));
        }

        let _guard = self.allocation.lock().await;
        let all = self.get_all().await?;
        let mut current = own_record(&all, webspace.user_id)?;
        if current.ports.len() >= usize::from(range.max) {
            return Err(WebspaceError::TooManyPorts(range.max));
        }

        let external = if external != 0 {
            if all.iter().any(|ws| ws.claims_port(external)) {
                return Err(WebspaceError::AlreadyUsed(format!("port {external}")));
            }
            external
        } else {
            let used: BTreeSet<u16> = all
                .iter()
                .flat_map(|ws| ws.ports.keys().copied())
                .filter(|port| (range.start..=range.end).contains(port))
                .collect();
            let capacity = u32::from(range.end) - u32::from(range.start) + 1;
            let free = capacity.saturating_sub(used.len() as u32);
            let exhausted = WebspaceError::PortsExhausted {
                start: range.start,
                end: range.end,
            };
            if free == 0 {
                return Err(exhausted);
            }

            let rank = rand::rng().random_range(0..free);
            nth_free_port(range.start, range.end, &used, rank).ok_or(exhausted)?
        };

        current.ports.insert(external, internal);
        self.save(&current).await?;
        *webspace = current;

        info!(
            "Webspace {}: forwarded port {} to {}",
            self.instance_name(webspace.user_id),
            external,
            internal
        );
        Ok(external)
    }

    /// Stop forwarding `external`.
    ///
    /// On success `webspace` is replaced with the freshly saved record.
    pub async fn remove_port(&self, webspace: &mut Webspace, external: u16) -> WebspaceResult<()> {
        let _guard = self.allocation.lock().await;
        let mut current = self.get(webspace.user_id).await?;
        current.remove_port(external)?;
        self.save(&current).await?;
        *webspace = current;

        info!(
            "Webspace {}: removed port {}",
            self.instance_name(webspace.user_id),
            external
        );
        Ok(())
    }

    /// Add a custom domain after checking its `webspace:<uid>` TXT record.
    /// Domains are compared exactly, so case matters.
    ///
    /// On success `webspace` is replaced with the freshly saved record.
    pub async fn add_domain(&self, webspace: &mut Webspace, domain: &str) -> WebspaceResult<()> {
        if domain.is_empty() {
            return Err(WebspaceError::BadValue("domain cannot be empty".to_string()));
        }
        if domain == self.primary_domain(webspace.user_id).await? {
            return Err(WebspaceError::AlreadyUsed(domain.to_string()));
        }

        let records = self
            .resolver
            .lookup_txt(domain)
            .await
            .map_err(|e| WebspaceError::Dns(e.to_string()))?;
        let expected = format!("webspace:{}", webspace.user_id);
        if !records.iter().any(|record| *record == expected) {
            return Err(WebspaceError::DomainUnverified(domain.to_string()));
        }

        let _guard = self.allocation.lock().await;
        let all = self.get_all().await?;
        if all.iter().any(|ws| ws.claims_domain(domain)) {
            return Err(WebspaceError::AlreadyUsed(domain.to_string()));
        }

        let mut current = own_record(&all, webspace.user_id)?;
        current.domains.push(domain.to_string());
        self.save(&current).await?;
        *webspace = current;

        info!(
            "Webspace {}: added domain {}",
            self.instance_name(webspace.user_id),
            domain
        );
        Ok(())
    }

    /// Remove a custom domain, matched exactly.
    ///
    /// On success `webspace` is replaced with the freshly saved record.
    pub async fn remove_domain(&self, webspace: &mut Webspace, domain: &str) -> WebspaceResult<()> {
        let _guard = self.allocation.lock().await;
        let mut current = self.get(webspace.user_id).await?;
        current.remove_domain(domain)?;
        self.save(&current).await?;
        *webspace = current;

        info!(
            "Webspace {}: removed domain {}",
            self.instance_name(webspace.user_id),
            domain
        );
        Ok(())
    }
}

fn own_record(all: &[Webspace], user_id: u32) -> WebspaceResult<Webspace> {
    all.iter()
        .find(|ws| ws.user_id == user_id)
        .cloned()
        .ok_or(WebspaceError::NotFound)
}

/// The `rank`-th (0-based) port in `[start, end]` not in `used`.
pub(crate) fn nth_free_port(start: u16, end: u16, used: &BTreeSet<u16>, rank: u32) -> Option<u16> {
    let mut candidate = u32::from(start) + rank;
    for &port in used.range(start..=end) {
        if u32::from(port) > candidate {
            break;
        }
        candidate += 1;
    }

    u16::try_from(candidate).ok().filter(|port| *port <= end)
}
