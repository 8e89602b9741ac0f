use std::path::Path;
use std::time::Duration;

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};

use crate::models::{BusinessHours, CoreError, CoreResult};
use crate::orchestration::RetryPolicy;

const TIME_FORMAT: &str = "%H:%M";

/// Scheduler settings. Every field is optional in the JSON form and falls back to the
/// defaults below.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub business_hours: BusinessHoursConfig,
    pub granularity_minutes: u32,
    pub lookahead_days: u32,
    pub weekdays_only: bool,
    /// Upper bound on proposed candidates; zero means unlimited.
    pub max_candidates: usize,
    pub retry: RetryConfig,
    pub agents: AgentLimits,
    pub max_concurrent_steps: usize,
    pub workflow_timeout_ms: Option<u64>,
    pub conflict: ConflictConfig,
    pub notification_template: String,
    pub cancellation_template: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            business_hours: BusinessHoursConfig::default(),
            granularity_minutes: 30,
            lookahead_days: 7,
            weekdays_only: true,
            max_candidates: 10,
            retry: RetryConfig::default(),
            agents: AgentLimits::default(),
            max_concurrent_steps: 4,
            workflow_timeout_ms: None,
            conflict: ConflictConfig::default(),
            notification_template: "interview_invitation".to_string(),
            cancellation_template: "interview_cancellation".to_string(),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusinessHoursConfig {
    /// Local wall-clock time, `HH:MM`.
    pub start: String,
    pub end: String,
    pub utc_offset_minutes: i32,
}

impl Default for BusinessHoursConfig {
    fn default() -> Self {
        Self {
            start: "09:00".to_string(),
            end: "18:00".to_string(),
            utc_offset_minutes: 540,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 200,
            max_delay_ms: 5_000,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentLimits {
    pub calendar: usize,
    pub booking: usize,
    pub notification: usize,
    pub slot_selection: usize,
}

impl Default for AgentLimits {
    fn default() -> Self {
        Self {
            calendar: 5,
            booking: 1,
            notification: 5,
            slot_selection: 1,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Re-run slot selection with the next candidate, up to `max_reselections` times.
    #[default]
    Reselect,
    /// Fail the booking step and report the conflict to the caller.
    Surface,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConflictConfig {
    pub policy: ConflictPolicy,
    pub max_reselections: u32,
}

impl Default for ConflictConfig {
    fn default() -> Self {
        Self {
            policy: ConflictPolicy::Reselect,
            max_reselections: 1,
        }
    }
}

impl SchedulerConfig {
    pub fn from_json_str(raw: &str) -> CoreResult<Self> {
        let config: Self = serde_json::from_str(raw).map_err(|error| {
            CoreError::validation(format!("invalid scheduler config: {error}"))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> CoreResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|error| {
            CoreError::validation(format!(
                "failed to read scheduler config '{}': {error}",
                path.display()
            ))
        })?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> CoreResult<()> {
        self.business_hours()?;
        self.retry_policy()?;

        if self.granularity_minutes == 0 {
            return Err(CoreError::validation("granularity_minutes must be positive"));
        }
        if self.lookahead_days == 0 {
            return Err(CoreError::validation("lookahead_days must be positive"));
        }
        if self.max_concurrent_steps == 0 {
            return Err(CoreError::validation("max_concurrent_steps must be positive"));
        }
        if self.workflow_timeout_ms == Some(0) {
            return Err(CoreError::validation(
                "workflow_timeout_ms must be positive when set",
            ));
        }

        let limits = [
            ("calendar", self.agents.calendar),
            ("booking", self.agents.booking),
            ("notification", self.agents.notification),
            ("slot_selection", self.agents.slot_selection),
        ];
        if let Some((agent, _)) = limits.iter().find(|(_, limit)| *limit == 0) {
            return Err(CoreError::validation(format!(
                "agents.{agent} must allow at least one concurrent task"
            )));
        }

        for (field, template) in [
            ("notification_template", &self.notification_template),
            ("cancellation_template", &self.cancellation_template),
        ] {
            if template.trim().is_empty() {
                return Err(CoreError::validation(format!("{field} must not be empty")));
            }
        }
        Ok(())
    }

    pub fn business_hours(&self) -> CoreResult<BusinessHours> {
        BusinessHours::new(
            parse_time("business_hours.start", &self.business_hours.start)?,
            parse_time("business_hours.end", &self.business_hours.end)?,
            self.business_hours.utc_offset_minutes,
        )
    }

    pub fn retry_policy(&self) -> CoreResult<RetryPolicy> {
        RetryPolicy::new(
            self.retry.max_attempts,
            Duration::from_millis(self.retry.base_delay_ms),
            Duration::from_millis(self.retry.max_delay_ms),
        )
    }

    pub fn workflow_deadline(&self) -> Option<Duration> {
        self.workflow_timeout_ms.map(Duration::from_millis)
    }

    /// Reselection budget handed to the orchestrator; `Surface` disables reselection.
    pub fn max_reselections(&self) -> u32 {
        match self.conflict.policy {
            ConflictPolicy::Reselect => self.conflict.max_reselections,
            ConflictPolicy::Surface => 0,
        }
    }
}

fn parse_time(field: &str, raw: &str) -> CoreResult<NaiveTime> {
    NaiveTime::parse_from_str(raw.trim(), TIME_FORMAT).map_err(|error| {
        CoreError::validation(format!("{field} '{raw}' is not an HH:MM time: {error}"))
    })
}

#[cfg(test)]
mod tests {
    use super::{ConflictPolicy, SchedulerConfig};

    #[test]
    fn empty_document_yields_defaults() {
        let config = SchedulerConfig::from_json_str("{}").unwrap();
        assert_eq!(config, SchedulerConfig::default());
        assert_eq!(config.business_hours().unwrap().utc_offset_minutes, 540);
        assert_eq!(config.max_reselections(), 1);
    }

    #[test]
    fn surface_policy_disables_reselection() {
        let config =
            SchedulerConfig::from_json_str(r#"{"conflict": {"policy": "surface"}}"#).unwrap();
        assert_eq!(config.conflict.policy, ConflictPolicy::Surface);
        assert_eq!(config.max_reselections(), 0);
    }
}
