//! Tenant channel config gate.
//!
//! A missing config row never blocks anything: channels fail open, live mode
//! fails closed.

use chrono::Utc;
use tracing::debug;

use jtd_core::{Channel, PipelineResult, TenantChannelConfig, TenantId};

use crate::store::TenantConfigStore;

#[derive(Debug, Clone)]
pub struct ChannelGate<S> {
    store: S,
}

impl<S: TenantConfigStore> ChannelGate<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// The stored row, if any, regardless of `is_active`.
    pub async fn channel_config(
        &self,
        tenant_id: TenantId,
        source_type: &str,
    ) -> PipelineResult<Option<TenantChannelConfig>> {
        Ok(self.store.channel_config(tenant_id, source_type).await?)
    }

    /// Whether `channel` may be used for `source_type` notifications of this
    /// tenant. Missing or inactive rows allow every channel.
    pub async fn is_channel_enabled(
        &self,
        tenant_id: TenantId,
        source_type: &str,
        channel: Channel,
    ) -> PipelineResult<bool> {
        let config = self.store.channel_config(tenant_id, source_type).await?;
        let enabled = match config {
            Some(config) if config.is_active => config.channel_enabled(channel),
            _ => {
                debug!(%tenant_id, source_type, "no active channel config; allowing");
                true
            }
        };
        Ok(enabled)
    }

    /// Live only if the tenant has at least one active row and every active
    /// row is live.
    pub async fn resolve_is_live(&self, tenant_id: TenantId) -> PipelineResult<bool> {
        let configs = self.store.tenant_configs(tenant_id).await?;
        let mut active = configs.iter().filter(|c| c.is_active).peekable();
        if active.peek().is_none() {
            debug!(%tenant_id, "no active channel config; test mode");
            return Ok(false);
        }
        Ok(active.all(|c| c.is_live))
    }

    pub async fn upsert_channel_config(
        &self,
        mut config: TenantChannelConfig,
    ) -> PipelineResult<TenantChannelConfig> {
        config.updated_at = Utc::now();
        self.store.upsert_channel_config(config.clone()).await?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryPipelineStore;
    use std::sync::Arc;

    fn gate() -> (Arc<InMemoryPipelineStore>, ChannelGate<Arc<InMemoryPipelineStore>>) {
        let store = Arc::new(InMemoryPipelineStore::new());
        (store.clone(), ChannelGate::new(store))
    }

    #[tokio::test]
    async fn missing_row_fails_open_for_channels_and_closed_for_live_mode() {
        let (_, gate) = gate();
        let tenant = TenantId::new();

        assert!(gate
            .is_channel_enabled(tenant, "user_invite", Channel::Email)
            .await
            .unwrap());
        assert!(!gate.resolve_is_live(tenant).await.unwrap());
    }

    #[tokio::test]
    async fn disabled_channel_is_reported() {
        let (_, gate) = gate();
        let tenant = TenantId::new();
        gate.upsert_channel_config(
            TenantChannelConfig::new(tenant, "user_invite").with_channel(Channel::Sms, false),
        )
        .await
        .unwrap();

        assert!(!gate
            .is_channel_enabled(tenant, "user_invite", Channel::Sms)
            .await
            .unwrap());
        assert!(gate
            .is_channel_enabled(tenant, "user_invite", Channel::Email)
            .await
            .unwrap());
        // other source types have no row
        assert!(gate
            .is_channel_enabled(tenant, "password_reset", Channel::Sms)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn inactive_row_is_ignored() {
        let (_, gate) = gate();
        let tenant = TenantId::new();
        gate.upsert_channel_config(
            TenantChannelConfig::new(tenant, "user_invite")
                .with_channel(Channel::Email, false)
                .live(true)
                .active(false),
        )
        .await
        .unwrap();

        assert!(gate
            .is_channel_enabled(tenant, "user_invite", Channel::Email)
            .await
            .unwrap());
        assert!(!gate.resolve_is_live(tenant).await.unwrap());
    }

    #[tokio::test]
    async fn live_mode_requires_every_active_row_live() {
        let (_, gate) = gate();
        let tenant = TenantId::new();
        gate.upsert_channel_config(TenantChannelConfig::new(tenant, "user_invite").live(true))
            .await
            .unwrap();
        assert!(gate.resolve_is_live(tenant).await.unwrap());

        gate.upsert_channel_config(TenantChannelConfig::new(tenant, "receipt").live(false))
            .await
            .unwrap();
        assert!(!gate.resolve_is_live(tenant).await.unwrap());
    }
}
