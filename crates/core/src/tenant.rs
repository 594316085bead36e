//! Per-tenant channel configuration.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::TenantId;
use crate::job::Channel;

/// Channel toggles for one `(tenant, source_type)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantChannelConfig {
    pub tenant_id: TenantId,
    pub source_type: String,
    pub email_enabled: bool,
    pub sms_enabled: bool,
    pub whatsapp_enabled: bool,
    pub inapp_enabled: bool,
    pub is_live: bool,
    pub is_active: bool,
    pub updated_at: DateTime<Utc>,
}

impl TenantChannelConfig {
    /// All channels enabled, test mode.
    pub fn new(tenant_id: TenantId, source_type: impl Into<String>) -> Self {
        Self {
            tenant_id,
            source_type: source_type.into(),
            email_enabled: true,
            sms_enabled: true,
            whatsapp_enabled: true,
            inapp_enabled: true,
            is_live: false,
            is_active: true,
            updated_at: Utc::now(),
        }
    }

    pub fn channel_enabled(&self, channel: Channel) -> bool {
        match channel {
            Channel::Email => self.email_enabled,
            Channel::Sms => self.sms_enabled,
            Channel::Whatsapp => self.whatsapp_enabled,
            Channel::Inapp => self.inapp_enabled,
        }
    }

    pub fn with_channel(mut self, channel: Channel, enabled: bool) -> Self {
        match channel {
            Channel::Email => self.email_enabled = enabled,
            Channel::Sms => self.sms_enabled = enabled,
            Channel::Whatsapp => self.whatsapp_enabled = enabled,
            Channel::Inapp => self.inapp_enabled = enabled,
        }
        self
    }

    pub fn live(mut self, is_live: bool) -> Self {
        self.is_live = is_live;
        self
    }

    pub fn active(mut self, is_active: bool) -> Self {
        self.is_active = is_active;
        self
    }
}
