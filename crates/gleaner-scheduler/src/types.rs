//! Scheduler types.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Months, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::SchedulerError;

/// Default number of failed runs before a job becomes terminally failed.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// A persisted unit of scraping work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    /// Unique identifier, immutable after creation.
    pub id: String,
    /// Display label.
    pub name: String,
    /// Name of the fetch configuration this job runs.
    pub config_ref: String,
    pub status: JobStatus,
    /// Informational only; dispatch order does not depend on it.
    #[serde(default)]
    pub priority: JobPriority,
    #[serde(default)]
    pub schedule: Option<ScheduleRule>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub last_run: Option<DateTime<Utc>>,
    /// Set only while the job is [`JobStatus::Scheduled`].
    #[serde(default)]
    pub next_run: Option<DateTime<Utc>>,
    /// Completed executions.
    #[serde(default)]
    pub run_count: u32,
    #[serde(default)]
    pub max_runs: Option<u32>,
    /// Failed executions. Never decremented.
    #[serde(default)]
    pub retries: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Message of the most recent failure.
    #[serde(default)]
    pub error_message: Option<String>,
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for the next poll.
    #[default]
    Pending,
    /// Waiting for `next_run`.
    Scheduled,
    /// Currently executing.
    Running,
    /// Finished with no further occurrence.
    Completed,
    /// Ran out of retries.
    Failed,
    /// Withdrawn before it ran.
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 6] = [
        JobStatus::Pending,
        JobStatus::Scheduled,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Scheduled => "scheduled",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| SchedulerError::Validation(format!("unknown job status: {s}")))
    }
}

/// Job priority.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    Low,
    #[default]
    Normal,
    High,
}

impl fmt::Display for JobPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobPriority::Low => f.write_str("low"),
            JobPriority::Normal => f.write_str("normal"),
            JobPriority::High => f.write_str("high"),
        }
    }
}

/// Kind of recurrence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleType {
    Once,
    Daily,
    Weekly,
    Monthly,
    Custom,
}

impl fmt::Display for ScheduleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ScheduleType::Once => "once",
            ScheduleType::Daily => "daily",
            ScheduleType::Weekly => "weekly",
            ScheduleType::Monthly => "monthly",
            ScheduleType::Custom => "custom",
        };
        f.write_str(s)
    }
}

/// When and how often a job runs.
///
/// Constructed through [`ScheduleRule::new`] or the per-type helpers, which
/// reject a missing `repeat_interval` (every type but `Once`) and a missing
/// or unparsable `cron_expression` (`Custom`). Deserialization applies the
/// same checks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawScheduleRule", into = "RawScheduleRule")]
pub struct ScheduleRule {
    kind: ScheduleType,
    start_time: DateTime<Utc>,
    end_time: Option<DateTime<Utc>>,
    repeat_interval: Option<u32>,
    cron_expression: Option<String>,
}

/// Wire form of [`ScheduleRule`], before validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawScheduleRule {
    #[serde(rename = "type")]
    kind: ScheduleType,
    start_time: DateTime<Utc>,
    #[serde(default)]
    end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    repeat_interval: Option<u32>,
    #[serde(default)]
    cron_expression: Option<String>,
}

impl TryFrom<RawScheduleRule> for ScheduleRule {
    type Error = SchedulerError;

    fn try_from(raw: RawScheduleRule) -> Result<Self, Self::Error> {
        let rule = ScheduleRule::new(
            raw.kind,
            raw.start_time,
            raw.repeat_interval,
            raw.cron_expression,
        )?;
        Ok(match raw.end_time {
            Some(end) => rule.until(end),
            None => rule,
        })
    }
}

impl From<ScheduleRule> for RawScheduleRule {
    fn from(rule: ScheduleRule) -> Self {
        Self {
            kind: rule.kind,
            start_time: rule.start_time,
            end_time: rule.end_time,
            repeat_interval: rule.repeat_interval,
            cron_expression: rule.cron_expression,
        }
    }
}

impl ScheduleRule {
    /// Create a validated rule.
    pub fn new(
        kind: ScheduleType,
        start_time: DateTime<Utc>,
        repeat_interval: Option<u32>,
        cron_expression: Option<String>,
    ) -> Result<Self, SchedulerError> {
        if kind != ScheduleType::Once {
            match repeat_interval {
                None => {
                    return Err(SchedulerError::Validation(format!(
                        "repeat_interval is required for {kind} schedules"
                    )));
                }
                Some(0) => {
                    return Err(SchedulerError::Validation(
                        "repeat_interval must be at least 1".to_string(),
                    ));
                }
                Some(_) => {}
            }
        }

        if kind == ScheduleType::Custom {
            match cron_expression.as_deref() {
                None => {
                    return Err(SchedulerError::Validation(
                        "cron_expression is required for custom schedules".to_string(),
                    ));
                }
                Some(expr) => {
                    parse_cron(expr)?;
                }
            }
        }

        Ok(Self {
            kind,
            start_time,
            end_time: None,
            repeat_interval,
            cron_expression,
        })
    }

    /// Run once at `at`.
    pub fn once(at: DateTime<Utc>) -> Self {
        Self {
            kind: ScheduleType::Once,
            start_time: at,
            end_time: None,
            repeat_interval: None,
            cron_expression: None,
        }
    }

    /// Every `days` days from `start`.
    pub fn daily(start: DateTime<Utc>, days: u32) -> Result<Self, SchedulerError> {
        Self::new(ScheduleType::Daily, start, Some(days), None)
    }

    /// Every `weeks` weeks from `start`.
    pub fn weekly(start: DateTime<Utc>, weeks: u32) -> Result<Self, SchedulerError> {
        Self::new(ScheduleType::Weekly, start, Some(weeks), None)
    }

    /// Every `months` calendar months from `start`.
    pub fn monthly(start: DateTime<Utc>, months: u32) -> Result<Self, SchedulerError> {
        Self::new(ScheduleType::Monthly, start, Some(months), None)
    }

    /// Follow a cron expression, first run at `start`.
    pub fn custom(start: DateTime<Utc>, expression: impl Into<String>) -> Result<Self, SchedulerError> {
        Self::new(ScheduleType::Custom, start, Some(1), Some(expression.into()))
    }

    /// Stop recurring after `end`.
    pub fn until(mut self, end: DateTime<Utc>) -> Self {
        self.end_time = Some(end);
        self
    }

    pub fn kind(&self) -> ScheduleType {
        self.kind
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.end_time
    }

    pub fn repeat_interval(&self) -> Option<u32> {
        self.repeat_interval
    }

    pub fn cron_expression(&self) -> Option<&str> {
        self.cron_expression.as_deref()
    }

    /// The occurrence following a run at `last_run`, or `None` when the
    /// schedule has no further occurrence.
    ///
    /// Monthly recurrence clamps the day of month to the last day of the
    /// target month. Occurrences after `end_time` are dropped.
    pub fn next_occurrence(&self, last_run: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let interval = self.repeat_interval.unwrap_or(1);

        let next = match self.kind {
            ScheduleType::Once => None,
            ScheduleType::Daily => last_run.checked_add_signed(Duration::days(interval.into())),
            ScheduleType::Weekly => last_run.checked_add_signed(Duration::weeks(interval.into())),
            ScheduleType::Monthly => last_run.checked_add_months(Months::new(interval)),
            ScheduleType::Custom => {
                let schedule = parse_cron(self.cron_expression.as_deref()?).ok()?;
                schedule.after(&last_run).next()
            }
        }?;

        match self.end_time {
            Some(end) if next > end => None,
            _ => Some(next),
        }
    }
}

/// Parse a cron expression, accepting the common five-field form.
///
/// Five-field expressions (minute through weekday) get a leading seconds
/// field of `0`.
pub fn parse_cron(expression: &str) -> Result<cron::Schedule, SchedulerError> {
    let trimmed = expression.trim();
    let normalized = if trimmed.split_whitespace().count() == 5 {
        format!("0 {trimmed}")
    } else {
        trimmed.to_string()
    };

    cron::Schedule::from_str(&normalized)
        .map_err(|e| SchedulerError::Validation(format!("invalid cron expression '{trimmed}': {e}")))
}

/// Fields of a job that [`JobManager::update_job`](crate::JobManager::update_job)
/// may change. `None` leaves the field as it is.
#[derive(Debug, Clone, Default)]
pub struct JobPatch {
    pub name: Option<String>,
    pub config_ref: Option<String>,
    pub priority: Option<JobPriority>,
    pub schedule: Option<ScheduleRule>,
    pub max_runs: Option<u32>,
    pub max_retries: Option<u32>,
}

impl JobPatch {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.config_ref.is_none()
            && self.priority.is_none()
            && self.schedule.is_none()
            && self.max_runs.is_none()
            && self.max_retries.is_none()
    }
}

impl JobRecord {
    /// Create a job with a fresh id.
    ///
    /// Without a schedule the job is `Pending`; with one it is `Scheduled`
    /// for the schedule's start time.
    pub fn new(
        name: impl Into<String>,
        config_ref: impl Into<String>,
        schedule: Option<ScheduleRule>,
    ) -> Self {
        let now = Utc::now();
        let (status, next_run) = match &schedule {
            Some(rule) => (JobStatus::Scheduled, Some(rule.start_time)),
            None => (JobStatus::Pending, None),
        };

        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            config_ref: config_ref.into(),
            status,
            priority: JobPriority::default(),
            schedule,
            created_at: now,
            updated_at: now,
            last_run: None,
            next_run,
            run_count: 0,
            max_runs: None,
            retries: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            error_message: None,
        }
    }

    /// Whether the job should be dispatched at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            JobStatus::Pending => true,
            JobStatus::Scheduled => self.next_run.is_some_and(|next| next <= now),
            _ => false,
        }
    }

    /// Whether the job has a schedule and has not used up `max_runs`.
    pub fn can_recur(&self) -> bool {
        self.schedule.is_some() && self.max_runs.is_none_or(|max| self.run_count < max)
    }

    /// When the job should next run after its last completed run.
    pub fn calculate_next_run(&self) -> Option<DateTime<Utc>> {
        if !self.can_recur() {
            return None;
        }
        let rule = self.schedule.as_ref()?;
        rule.next_occurrence(self.last_run?)
    }

    /// Move to `status`, keeping `next_run` set exactly while `Scheduled`.
    pub fn set_status(&mut self, status: JobStatus, now: DateTime<Utc>) {
        self.status = status;
        if status == JobStatus::Scheduled {
            self.next_run.get_or_insert(now);
        } else {
            self.next_run = None;
        }
        self.updated_at = now;
    }

    /// Book a successful execution finished at `now`.
    pub fn record_success(&mut self, now: DateTime<Utc>) {
        self.run_count = self.run_count.saturating_add(1);
        self.last_run = Some(now);

        match self.calculate_next_run() {
            Some(next) => {
                self.next_run = Some(next);
                self.set_status(JobStatus::Scheduled, now);
            }
            None => self.set_status(JobStatus::Completed, now),
        }
    }

    /// Book a failed execution at `now`.
    ///
    /// Retries immediately while attempts remain.
    pub fn record_failure(&mut self, message: impl Into<String>, now: DateTime<Utc>) {
        self.retries = self.retries.saturating_add(1);
        self.error_message = Some(message.into());

        if self.retries < self.max_retries {
            self.next_run = Some(now);
            self.set_status(JobStatus::Scheduled, now);
        } else {
            self.set_status(JobStatus::Failed, now);
        }
    }

    /// Apply the fields present in `patch`.
    pub fn apply(&mut self, patch: JobPatch, now: DateTime<Utc>) {
        if let Some(name) = patch.name {
            self.name = name;
        }
        if let Some(config_ref) = patch.config_ref {
            self.config_ref = config_ref;
        }
        if let Some(priority) = patch.priority {
            self.priority = priority;
        }
        if let Some(schedule) = patch.schedule {
            if self.status == JobStatus::Scheduled && self.last_run.is_none() {
                self.next_run = Some(schedule.start_time);
            }
            self.schedule = Some(schedule);
        }
        if let Some(max_runs) = patch.max_runs {
            self.max_runs = Some(max_runs);
        }
        if let Some(max_retries) = patch.max_retries {
            self.max_retries = max_retries;
        }
        self.updated_at = now;
    }
}
