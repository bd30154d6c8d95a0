//! Job definitions: what to watch, and what to run when it fires.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::JobId;
use super::task::TaskTarget;
use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Job Record
// ---------------------------------------------------------------------------

/// A long-lived trigger definition, owned by exactly one worker while active.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: JobId,
    pub task_definition_id: i32,
    /// Past this instant the job is terminal, recurring or not.
    pub expiration_time: DateTime<Utc>,
    #[serde(default)]
    pub recurring: bool,
    /// The contract call dispatched when the trigger fires.
    pub target: TaskTarget,
    pub trigger: JobTrigger,
}

impl JobRecord {
    pub fn kind(&self) -> JobKind {
        match self.trigger {
            JobTrigger::Condition(_) => JobKind::Condition,
            JobTrigger::Event(_) => JobKind::Event,
            JobTrigger::Socket(_) => JobKind::Socket,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expiration_time
    }

    /// Admission checks. Nothing here touches the network.
    pub fn validate(&self) -> Result<()> {
        if self.target.target_chain_id.trim().is_empty() {
            return Err(Error::InvalidJob(format!(
                "job {} has no target chain",
                self.job_id
            )));
        }
        if self.target.target_contract_address.trim().is_empty() {
            return Err(Error::InvalidJob(format!(
                "job {} has no target contract",
                self.job_id
            )));
        }
        match &self.trigger {
            JobTrigger::Condition(spec) => {
                spec.condition_type()?;
                let source = spec.source_type()?;
                if source == SourceType::Static {
                    spec.static_value()?;
                } else if spec.value_source_url.trim().is_empty() {
                    return Err(Error::InvalidJob(format!(
                        "job {} has no value source url",
                        self.job_id
                    )));
                }
            }
            JobTrigger::Event(spec) => {
                if spec.trigger_contract_address.trim().is_empty()
                    || spec.trigger_event.trim().is_empty()
                {
                    return Err(Error::InvalidJob(format!(
                        "job {} needs a trigger contract and event signature",
                        self.job_id
                    )));
                }
            }
            JobTrigger::Socket(spec) => {
                spec.condition_type()?;
                if spec.socket_url.trim().is_empty() {
                    return Err(Error::InvalidJob(format!(
                        "job {} has no socket url",
                        self.job_id
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Which worker type monitors a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Condition,
    Event,
    Socket,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Condition => "condition",
            JobKind::Event => "event",
            JobKind::Socket => "socket",
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Exactly one trigger payload per job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobTrigger {
    Condition(ConditionSpec),
    Event(EventSpec),
    Socket(SocketSpec),
}

// ---------------------------------------------------------------------------
// Trigger payloads
// ---------------------------------------------------------------------------

/// Poll a value source and compare against limits.
///
/// The enum fields stay as strings so that admission, not deserialization,
/// reports an unsupported value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionSpec {
    pub condition_type: String,
    #[serde(default)]
    pub upper_limit: f64,
    #[serde(default)]
    pub lower_limit: f64,
    pub value_source_type: String,
    /// URL for `api`/`oracle`; the literal number for `static`.
    pub value_source_url: String,
    /// Dot path into the response body, e.g. `data.0.price`.
    #[serde(default)]
    pub selected_key_route: Option<String>,
}

impl ConditionSpec {
    pub fn condition_type(&self) -> Result<ConditionType> {
        self.condition_type.parse()
    }

    pub fn source_type(&self) -> Result<SourceType> {
        self.value_source_type.parse()
    }

    /// The constant of a `static` source.
    pub fn static_value(&self) -> Result<f64> {
        let raw = self.value_source_url.trim();
        raw.parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .ok_or_else(|| Error::InvalidStaticValue(raw.to_string()))
    }

    pub fn evaluate(&self, value: f64) -> Result<bool> {
        Ok(self
            .condition_type()?
            .is_satisfied(value, self.lower_limit, self.upper_limit))
    }
}

/// Watch contract logs for an event signature.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventSpec {
    pub trigger_chain_id: String,
    pub trigger_contract_address: String,
    /// Event signature, e.g. `Transfer(address,address,uint256)`.
    pub trigger_event: String,
    #[serde(default)]
    pub event_filter_parameter_name: Option<String>,
    #[serde(default)]
    pub event_filter_parameter_value: Option<String>,
}

impl EventSpec {
    /// The filter value, if one is set and non-empty.
    pub fn filter_value(&self) -> Option<&str> {
        self.event_filter_parameter_value
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
    }
}

/// Evaluate each message of a WebSocket feed against limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocketSpec {
    pub socket_url: String,
    pub condition_type: String,
    #[serde(default)]
    pub upper_limit: f64,
    #[serde(default)]
    pub lower_limit: f64,
    #[serde(default)]
    pub selected_key_route: Option<String>,
    /// Sent once after connecting, for feeds that need a subscribe frame.
    #[serde(default)]
    pub subscribe_message: Option<String>,
}

impl SocketSpec {
    pub fn condition_type(&self) -> Result<ConditionType> {
        self.condition_type.parse()
    }

    pub fn evaluate(&self, value: f64) -> Result<bool> {
        Ok(self
            .condition_type()?
            .is_satisfied(value, self.lower_limit, self.upper_limit))
    }
}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionType {
    GreaterThan,
    LessThan,
    Between,
    Equals,
    NotEquals,
    GreaterEqual,
    LessEqual,
}

impl ConditionType {
    /// `greater_*`, `equals` and `not_equals` compare against `lower`;
    /// `less_*` compare against `upper`.
    pub fn is_satisfied(&self, value: f64, lower: f64, upper: f64) -> bool {
        match self {
            ConditionType::GreaterThan => value > lower,
            ConditionType::LessThan => value < upper,
            ConditionType::Between => value >= lower && value <= upper,
            ConditionType::Equals => value == lower,
            ConditionType::NotEquals => value != lower,
            ConditionType::GreaterEqual => value >= lower,
            ConditionType::LessEqual => value <= upper,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConditionType::GreaterThan => "greater_than",
            ConditionType::LessThan => "less_than",
            ConditionType::Between => "between",
            ConditionType::Equals => "equals",
            ConditionType::NotEquals => "not_equals",
            ConditionType::GreaterEqual => "greater_equal",
            ConditionType::LessEqual => "less_equal",
        }
    }
}

impl std::fmt::Display for ConditionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ConditionType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "greater_than" => Ok(ConditionType::GreaterThan),
            "less_than" => Ok(ConditionType::LessThan),
            "between" => Ok(ConditionType::Between),
            "equals" => Ok(ConditionType::Equals),
            "not_equals" => Ok(ConditionType::NotEquals),
            "greater_equal" => Ok(ConditionType::GreaterEqual),
            "less_equal" => Ok(ConditionType::LessEqual),
            other => Err(Error::InvalidConditionType(other.to_string())),
        }
    }
}

/// Where a condition job reads its value from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Api,
    Oracle,
    Static,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Api => "api",
            SourceType::Oracle => "oracle",
            SourceType::Static => "static",
        }
    }
}

impl std::fmt::Display for SourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SourceType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "api" => Ok(SourceType::Api),
            "oracle" => Ok(SourceType::Oracle),
            "static" => Ok(SourceType::Static),
            other => Err(Error::InvalidSourceType(other.to_string())),
        }
    }
}
