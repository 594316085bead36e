//! The JTD record and its pure state transitions.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, PipelineResult};
use crate::history::StatusHistoryEntry;
use crate::id::{JobId, TenantId};
use crate::status::JobStatus;

/// Delivery channel of a notification.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Email,
    Sms,
    Whatsapp,
    Inapp,
}

impl Channel {
    pub const ALL: [Channel; 4] = [Channel::Email, Channel::Sms, Channel::Whatsapp, Channel::Inapp];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Email => "email",
            Channel::Sms => "sms",
            Channel::Whatsapp => "whatsapp",
            Channel::Inapp => "inapp",
        }
    }
}

impl core::fmt::Display for Channel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Channel::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| PipelineError::validation(format!("unknown channel: {s}")))
    }
}

/// Channel-specific addressing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipientData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mobile: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Who caused a transition (`performed_by_type`).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorKind {
    System,
    Admin,
    Worker,
}

impl ActorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActorKind::System => "system",
            ActorKind::Admin => "admin",
            ActorKind::Worker => "worker",
        }
    }
}

impl core::fmt::Display for ActorKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActorKind {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "system" => Ok(ActorKind::System),
            "admin" => Ok(ActorKind::Admin),
            "worker" => Ok(ActorKind::Worker),
            other => Err(PipelineError::validation(format!("unknown actor kind: {other}"))),
        }
    }
}

/// Actor identity recorded on the job and in history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub kind: ActorKind,
    pub name: String,
}

impl Actor {
    pub fn system() -> Self {
        Self {
            kind: ActorKind::System,
            name: "system".to_string(),
        }
    }

    pub fn admin(name: impl Into<String>) -> Self {
        Self {
            kind: ActorKind::Admin,
            name: name.into(),
        }
    }

    pub fn worker(name: impl Into<String>) -> Self {
        Self {
            kind: ActorKind::Worker,
            name: name.into(),
        }
    }
}

impl core::fmt::Display for Actor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}:{}", self.kind, self.name)
    }
}

/// A job creation request from a collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    pub event_type: String,
    pub channel: Channel,
    pub tenant_id: TenantId,
    #[serde(default)]
    pub tenant_name: Option<String>,
    pub source_type: String,
    pub source_id: String,
    #[serde(default)]
    pub recipient_data: RecipientData,
    #[serde(default)]
    pub template_data: serde_json::Value,
    #[serde(default)]
    pub metadata: serde_json::Value,
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub max_retries: Option<u32>,
}

impl NewJob {
    pub fn new(
        tenant_id: TenantId,
        channel: Channel,
        event_type: impl Into<String>,
        source_type: impl Into<String>,
        source_id: impl Into<String>,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            channel,
            tenant_id,
            tenant_name: None,
            source_type: source_type.into(),
            source_id: source_id.into(),
            recipient_data: RecipientData::default(),
            template_data: serde_json::Value::Null,
            metadata: serde_json::Value::Null,
            priority: None,
            scheduled_at: None,
            max_retries: None,
        }
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.recipient_data.email = Some(email.into());
        self
    }

    pub fn with_mobile(mut self, mobile: impl Into<String>) -> Self {
        self.recipient_data.mobile = Some(mobile.into());
        self
    }

    pub fn with_tenant_name(mut self, name: impl Into<String>) -> Self {
        self.tenant_name = Some(name.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn validate(&self) -> PipelineResult<()> {
        if self.event_type.trim().is_empty() {
            return Err(PipelineError::validation("event_type is required"));
        }
        if self.source_type.trim().is_empty() {
            return Err(PipelineError::validation("source_type is required"));
        }
        if self.source_id.trim().is_empty() {
            return Err(PipelineError::validation("source_id is required"));
        }

        let present = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.trim().is_empty());
        match self.channel {
            Channel::Email if !present(&self.recipient_data.email) => Err(
                PipelineError::validation("email channel requires recipient_data.email"),
            ),
            Channel::Sms | Channel::Whatsapp if !present(&self.recipient_data.mobile) => {
                Err(PipelineError::validation(format!(
                    "{} channel requires recipient_data.mobile",
                    self.channel
                )))
            }
            _ => Ok(()),
        }
    }
}

/// Field updates carried alongside a transition.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobPatch {
    pub retry_count: Option<u32>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub provider_code: Option<String>,
    pub cost: Option<f64>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub clear_error: bool,
}

impl JobPatch {
    pub fn error(code: Option<String>, message: impl Into<String>) -> Self {
        Self {
            error_code: code,
            error_message: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn delivered_by(provider_code: impl Into<String>, cost: Option<f64>) -> Self {
        Self {
            provider_code: Some(provider_code.into()),
            cost,
            ..Default::default()
        }
    }
}

/// A JTD record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub event_type: String,
    pub channel: Channel,
    pub tenant_id: TenantId,
    pub tenant_name: Option<String>,
    pub source_type: String,
    pub source_id: String,
    pub current_status: JobStatus,
    pub priority: i32,
    pub recipient_data: RecipientData,
    pub template_data: serde_json::Value,
    pub metadata: serde_json::Value,
    pub retry_count: u32,
    pub max_retries: u32,
    pub cost: Option<f64>,
    pub provider_code: Option<String>,
    pub error_message: Option<String>,
    pub error_code: Option<String>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub executed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub archived_at: Option<DateTime<Utc>>,
    pub status_changed_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub is_live: bool,
    pub is_active: bool,
    pub performed_by: Actor,
}

impl Job {
    /// Build a `created` record from a validated request.
    pub fn from_request(
        request: NewJob,
        default_priority: i32,
        default_max_retries: u32,
        is_live: bool,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: JobId::new(),
            event_type: request.event_type,
            channel: request.channel,
            tenant_id: request.tenant_id,
            tenant_name: request.tenant_name,
            source_type: request.source_type,
            source_id: request.source_id,
            current_status: JobStatus::Created,
            priority: request.priority.unwrap_or(default_priority),
            recipient_data: request.recipient_data,
            template_data: request.template_data,
            metadata: request.metadata,
            retry_count: 0,
            max_retries: request.max_retries.unwrap_or(default_max_retries),
            cost: None,
            provider_code: None,
            error_message: None,
            error_code: None,
            scheduled_at: request.scheduled_at,
            executed_at: None,
            completed_at: None,
            created_at: now,
            sent_at: None,
            delivered_at: None,
            next_retry_at: None,
            archived_at: None,
            status_changed_at: now,
            updated_at: now,
            is_live,
            is_active: true,
            performed_by: Actor::system(),
        }
    }

    /// History entry recording the creation itself.
    pub fn creation_entry(&self) -> StatusHistoryEntry {
        StatusHistoryEntry::new(
            self.id,
            None,
            JobStatus::Created,
            0,
            &self.performed_by,
            Some("job created".to_string()),
            self.created_at,
        )
    }

    /// Whether the job can still be retried automatically.
    pub fn is_retryable(&self) -> bool {
        self.current_status == JobStatus::Failed && self.retry_count < self.max_retries
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.current_status {
            JobStatus::Scheduled => self.scheduled_at.is_none_or(|at| at <= now),
            JobStatus::Failed => self.next_retry_at.is_none_or(|at| at <= now),
            _ => false,
        }
    }

    /// Move to `to`, applying `patch`, and return the history entry.
    ///
    /// Illegal transitions return `InvalidTransition` and leave the job
    /// untouched.
    pub fn transition(
        &mut self,
        to: JobStatus,
        actor: &Actor,
        reason: Option<String>,
        patch: JobPatch,
        now: DateTime<Utc>,
    ) -> PipelineResult<StatusHistoryEntry> {
        let from = self.current_status;
        if self.archived_at.is_some() {
            return Err(PipelineError::InvalidTransition { from, to });
        }
        from.check_transition(to)?;

        let duration = (now - self.status_changed_at).num_seconds();

        if from == JobStatus::Failed {
            self.next_retry_at = None;
        }
        match to {
            JobStatus::Processing => self.executed_at = Some(now),
            JobStatus::Sent => {
                self.sent_at = Some(now);
                self.error_code = None;
                self.error_message = None;
            }
            JobStatus::Queued => self.completed_at = None,
            _ => {}
        }
        if to.sets_completed_at() {
            self.completed_at = Some(now);
        }

        self.apply_patch(patch);

        self.current_status = to;
        self.status_changed_at = now;
        self.updated_at = now;
        self.performed_by = actor.clone();

        Ok(StatusHistoryEntry::new(
            self.id,
            Some(from),
            to,
            duration,
            actor,
            reason,
            now,
        ))
    }

    /// Archive a dead-lettered job when its DLQ entry is purged.
    ///
    /// The status stays `dead_letter`; the audit entry records
    /// `dead_letter -> dead_letter`. Archived jobs accept no further
    /// transitions.
    pub fn archive(
        &mut self,
        actor: &Actor,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> PipelineResult<StatusHistoryEntry> {
        if self.current_status != JobStatus::DeadLetter || self.archived_at.is_some() {
            return Err(PipelineError::InvalidTransition {
                from: self.current_status,
                to: JobStatus::DeadLetter,
            });
        }

        let duration = (now - self.status_changed_at).num_seconds();
        self.archived_at = Some(now);
        self.updated_at = now;
        self.performed_by = actor.clone();

        Ok(StatusHistoryEntry::new(
            self.id,
            Some(JobStatus::DeadLetter),
            JobStatus::DeadLetter,
            duration,
            actor,
            Some(reason.into()),
            now,
        ))
    }

    /// Apply field updates without a status change.
    pub fn apply_patch(&mut self, patch: JobPatch) {
        if patch.clear_error {
            self.error_code = None;
            self.error_message = None;
        }
        if let Some(retry_count) = patch.retry_count {
            self.retry_count = retry_count;
        }
        if patch.error_code.is_some() {
            self.error_code = patch.error_code;
        }
        if patch.error_message.is_some() {
            self.error_message = patch.error_message;
        }
        if patch.provider_code.is_some() {
            self.provider_code = patch.provider_code;
        }
        if patch.cost.is_some() {
            self.cost = patch.cost;
        }
        if patch.next_retry_at.is_some() {
            self.next_retry_at = patch.next_retry_at;
        }
    }

    /// Admission steps run in the creation transaction:
    /// `created -> pending -> queued`, then `queued -> scheduled` when
    /// `scheduled_at` is in the future.
    pub fn admit(&mut self, now: DateTime<Utc>) -> PipelineResult<Vec<StatusHistoryEntry>> {
        let system = Actor::system();
        let mut entries = Vec::with_capacity(3);
        entries.push(self.transition(
            JobStatus::Pending,
            &system,
            Some("admitted".to_string()),
            JobPatch::default(),
            now,
        )?);
        entries.push(self.transition(
            JobStatus::Queued,
            &system,
            Some("enqueued".to_string()),
            JobPatch::default(),
            now,
        )?);
        if self.scheduled_at.is_some_and(|at| at > now) {
            entries.push(self.transition(
                JobStatus::Scheduled,
                &system,
                Some("scheduled for later delivery".to_string()),
                JobPatch::default(),
                now,
            )?);
        }
        Ok(entries)
    }

    /// Earliest time the queue entry may be leased.
    pub fn not_before(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self.scheduled_at {
            Some(at) if at > now => at,
            _ => now,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::Duration;
    use proptest::prelude::*;

    pub(crate) fn email_job(now: DateTime<Utc>) -> Job {
        let request = NewJob::new(
            TenantId::new(),
            Channel::Email,
            "notification",
            "user_invite",
            "invite-1",
        )
        .with_email("a@example.com");
        Job::from_request(request, 5, 3, false, now)
    }

    #[test]
    fn admission_reaches_queued() {
        let now = Utc::now();
        let mut job = email_job(now);
        let entries = job.admit(now).unwrap();

        assert_eq!(job.current_status, JobStatus::Queued);
        let path: Vec<_> = entries.iter().map(|e| (e.from_status, e.to_status)).collect();
        assert_eq!(
            path,
            vec![
                (Some(JobStatus::Created), JobStatus::Pending),
                (Some(JobStatus::Pending), JobStatus::Queued),
            ]
        );
    }

    #[test]
    fn future_schedule_parks_the_job() {
        let now = Utc::now();
        let mut job = email_job(now);
        job.scheduled_at = Some(now + Duration::hours(1));
        job.admit(now).unwrap();

        assert_eq!(job.current_status, JobStatus::Scheduled);
        assert_eq!(job.not_before(now), now + Duration::hours(1));
        assert!(!job.is_due(now));
        assert!(job.is_due(now + Duration::hours(2)));
    }

    #[test]
    fn duration_is_time_in_previous_state() {
        let t0 = Utc::now();
        let mut job = email_job(t0);
        job.admit(t0).unwrap();

        let t1 = t0 + Duration::seconds(42);
        let entry = job
            .transition(
                JobStatus::Processing,
                &Actor::worker("w1"),
                None,
                JobPatch::default(),
                t1,
            )
            .unwrap();

        assert_eq!(entry.duration_seconds, 42);
        assert_eq!(job.executed_at, Some(t1));
        assert_eq!(job.performed_by, Actor::worker("w1"));
    }

    #[test]
    fn sent_sets_terminal_timestamps_and_clears_error() {
        let now = Utc::now();
        let mut job = email_job(now);
        job.admit(now).unwrap();
        job.transition(JobStatus::Processing, &Actor::worker("w"), None, JobPatch::default(), now)
            .unwrap();
        job.error_message = Some("earlier failure".into());

        job.transition(
            JobStatus::Sent,
            &Actor::worker("w"),
            None,
            JobPatch::delivered_by("smtp", Some(0.01)),
            now,
        )
        .unwrap();

        assert_eq!(job.sent_at, Some(now));
        assert_eq!(job.completed_at, Some(now));
        assert_eq!(job.error_message, None);
        assert_eq!(job.provider_code.as_deref(), Some("smtp"));
    }

    #[test]
    fn validation_requires_channel_address() {
        let tenant = TenantId::new();
        let sms = NewJob::new(tenant, Channel::Sms, "notification", "user_invite", "x");
        assert!(matches!(sms.validate(), Err(PipelineError::Validation(_))));
        assert!(sms.with_mobile("+15550100").validate().is_ok());

        let email = NewJob::new(tenant, Channel::Email, "notification", "user_invite", "x");
        assert!(email.validate().is_err());

        let inapp = NewJob::new(tenant, Channel::Inapp, "notification", "user_invite", "x");
        assert!(inapp.validate().is_ok());

        let blank = NewJob::new(tenant, Channel::Inapp, " ", "user_invite", "x");
        assert!(blank.validate().is_err());
    }

    #[test]
    fn only_failed_jobs_under_the_retry_limit_are_retryable() {
        let now = Utc::now();
        let mut job = email_job(now);
        assert!(!job.is_retryable());

        job.current_status = JobStatus::Failed;
        job.retry_count = 2;
        assert!(job.is_retryable());

        job.retry_count = job.max_retries;
        assert!(!job.is_retryable());
    }

    #[test]
    fn archived_job_is_frozen() {
        let now = Utc::now();
        let mut job = email_job(now);
        job.current_status = JobStatus::DeadLetter;

        let entry = job.archive(&Actor::admin("ops"), "purged", now).unwrap();
        assert_eq!(entry.from_status, Some(JobStatus::DeadLetter));
        assert_eq!(entry.to_status, JobStatus::DeadLetter);
        assert_eq!(job.archived_at, Some(now));

        assert!(job.archive(&Actor::admin("ops"), "again", now).is_err());
        assert!(job
            .transition(JobStatus::Queued, &Actor::admin("ops"), None, JobPatch::default(), now)
            .is_err());
    }

    fn any_status() -> impl Strategy<Value = JobStatus> {
        (0..JobStatus::ALL.len()).prop_map(|i| JobStatus::ALL[i])
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        #[test]
        fn rejected_transitions_leave_job_unchanged(from in any_status(), to in any_status()) {
            let now = Utc::now();
            let mut job = email_job(now);
            job.current_status = from;
            let before = job.clone();

            let result = job.transition(to, &Actor::system(), None, JobPatch::default(), now);
            if from.can_transition_to(to) {
                prop_assert!(result.is_ok());
                prop_assert_eq!(job.current_status, to);
            } else {
                prop_assert_eq!(result, Err(PipelineError::InvalidTransition { from, to }));
                prop_assert_eq!(job, before);
            }
        }
    }
}
