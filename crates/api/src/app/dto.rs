use serde::{Deserialize, Serialize};

use jtd_core::{Channel, JobStatus, TenantChannelConfig, TenantId};
use jtd_infra::{CreateOutcome, ForceOutcome, JobFilter, Pagination, PurgeReport};

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct StatusQuery {
    pub source_type: String,
    pub source_id: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListJobsQuery {
    pub status: Option<JobStatus>,
    pub tenant_id: Option<TenantId>,
    pub event_type: Option<String>,
    pub channel: Option<Channel>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

impl ListJobsQuery {
    pub fn filter(&self) -> JobFilter {
        JobFilter {
            status: self.status,
            tenant_id: self.tenant_id,
            event_type: self.event_type.clone().filter(|e| !e.is_empty()),
            channel: self.channel,
        }
    }

    pub fn pagination(&self) -> Pagination {
        Pagination::new(self.limit, self.offset)
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct PageQuery {
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

impl PageQuery {
    pub fn pagination(&self) -> Pagination {
        Pagination::new(self.limit, self.offset)
    }
}

#[derive(Debug, Deserialize)]
pub struct ForceCompleteRequest {
    pub outcome: ForceOutcome,
}

/// Partial channel config update. Omitted fields keep their stored value,
/// or the default for a new row.
#[derive(Debug, Default, Deserialize)]
pub struct ChannelConfigRequest {
    pub email_enabled: Option<bool>,
    pub sms_enabled: Option<bool>,
    pub whatsapp_enabled: Option<bool>,
    pub inapp_enabled: Option<bool>,
    pub is_live: Option<bool>,
    pub is_active: Option<bool>,
}

impl ChannelConfigRequest {
    pub fn apply_to(&self, mut config: TenantChannelConfig) -> TenantChannelConfig {
        let toggles = [
            (Channel::Email, self.email_enabled),
            (Channel::Sms, self.sms_enabled),
            (Channel::Whatsapp, self.whatsapp_enabled),
            (Channel::Inapp, self.inapp_enabled),
        ];
        for (channel, enabled) in toggles {
            if let Some(enabled) = enabled {
                config = config.with_channel(channel, enabled);
            }
        }
        if let Some(live) = self.is_live {
            config = config.live(live);
        }
        if let Some(active) = self.is_active {
            config = config.active(active);
        }
        config
    }
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum CreateJobResponse {
    Created {
        success: bool,
        jtd_id: String,
        msg_id: i64,
        status: JobStatus,
    },
    Skipped {
        success: bool,
        skipped: bool,
        reason: String,
    },
}

impl From<CreateOutcome> for CreateJobResponse {
    fn from(outcome: CreateOutcome) -> Self {
        match outcome {
            CreateOutcome::Created {
                jtd_id,
                msg_id,
                status,
            } => CreateJobResponse::Created {
                success: true,
                jtd_id: jtd_id.to_string(),
                msg_id: msg_id.get(),
                status,
            },
            CreateOutcome::Skipped { reason } => CreateJobResponse::Skipped {
                success: false,
                skipped: true,
                reason,
            },
        }
    }
}

#[derive(Debug, Serialize)]
pub struct MutationResponse {
    pub success: bool,
    pub message: String,
}

impl MutationResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PurgeResponse {
    pub success: bool,
    pub message: String,
    pub purged: usize,
}

impl From<PurgeReport> for PurgeResponse {
    fn from(report: PurgeReport) -> Self {
        Self {
            success: true,
            message: format!("purged {} message(s) from the dead-letter queue", report.purged),
            purged: report.purged,
        }
    }
}
