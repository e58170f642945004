//! External task data model.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::TaskError;

/// JSON variables exchanged with workers.
pub type Variables = serde_json::Map<String, serde_json::Value>;

/// Unique identifier for an external task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// An exclusive, time-bounded claim on a task.
///
/// Worker id and expiration only ever exist together, so the pair lives in
/// one value and an unlocked task simply has no lease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub worker_id: String,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// A unit of dispatchable work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalTask {
    pub id: TaskId,
    pub topic_name: String,
    pub process_instance_id: String,
    pub process_definition_id: String,
    pub process_definition_key: String,
    pub process_definition_version_tag: Option<String>,
    pub deployment_id: Option<String>,
    pub execution_id: String,
    pub activity_id: String,
    pub activity_instance_id: String,
    pub priority: i64,
    pub create_time: DateTime<Utc>,
    pub retries: Option<i32>,
    pub error_message: Option<String>,
    pub suspended: bool,
    pub tenant_id: Option<String>,
    pub business_key: Option<String>,
    pub extension_properties: BTreeMap<String, String>,
    pub lease: Option<Lease>,
    /// Not fetchable before this instant after a failure report.
    pub retry_after: Option<DateTime<Utc>>,
    /// Store insertion order; the fallback fetch order.
    pub seq: i64,
}

impl ExternalTask {
    pub fn worker_id(&self) -> Option<&str> {
        self.lease.as_ref().map(|l| l.worker_id.as_str())
    }

    pub fn lock_expiration_time(&self) -> Option<DateTime<Utc>> {
        self.lease.as_ref().map(|l| l.expires_at)
    }

    /// True while a lease exists and has not expired.
    pub fn is_locked_at(&self, now: DateTime<Utc>) -> bool {
        self.lease.as_ref().is_some_and(|l| !l.is_expired_at(now))
    }

    /// Whether a fetch may hand this task out at `now`, ignoring topic filters.
    pub fn is_fetchable_at(&self, now: DateTime<Utc>) -> bool {
        !self.suspended
            && !self.is_locked_at(now)
            && self.retry_after.map_or(true, |t| t <= now)
            && self.retries != Some(0)
    }
}

/// Priority declared on an activity or a process definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Priority {
    Value(i64),
    /// `${name}` reads an integer process-instance variable when the task is created.
    Expression(String),
}

impl Priority {
    /// Parse a priority attribute as written in a process model.
    pub fn parse(element_id: &str, raw: &str) -> Result<Self, TaskError> {
        let trimmed = raw.trim();
        if let Some(name) = trimmed
            .strip_prefix("${")
            .and_then(|rest| rest.strip_suffix('}'))
        {
            let name = name.trim();
            if name.is_empty() {
                return Err(TaskError::validation(format!(
                    "Empty priority expression on element '{}'",
                    element_id
                )));
            }
            return Ok(Self::Expression(name.to_string()));
        }
        trimmed.parse::<i64>().map(Self::Value).map_err(|_| {
            TaskError::validation(format!(
                "Value '{}' for attribute 'taskPriority' is not a valid number (element '{}')",
                raw, element_id
            ))
        })
    }
}

/// Descriptor for a task created when a process reaches an external activity.
#[derive(Debug, Clone)]
pub struct NewExternalTask {
    pub topic_name: String,
    pub process_instance_id: String,
    pub process_definition_id: String,
    pub process_definition_key: String,
    pub process_definition_version_tag: Option<String>,
    pub deployment_id: Option<String>,
    pub execution_id: String,
    pub activity_id: String,
    pub activity_instance_id: Option<String>,
    pub tenant_id: Option<String>,
    pub business_key: Option<String>,
    pub extension_properties: BTreeMap<String, String>,
    /// Priority declared on the activity itself.
    pub activity_priority: Option<Priority>,
    /// Priority declared on the owning process definition.
    pub process_priority: Option<Priority>,
}

impl NewExternalTask {
    /// Start a descriptor; the process definition defaults to `key:1`.
    pub fn new(
        topic_name: impl Into<String>,
        process_definition_key: impl Into<String>,
        process_instance_id: impl Into<String>,
        activity_id: impl Into<String>,
    ) -> Self {
        let key = process_definition_key.into();
        let process_instance_id = process_instance_id.into();
        Self {
            topic_name: topic_name.into(),
            process_definition_id: format!("{}:1", key),
            process_definition_key: key,
            process_definition_version_tag: None,
            deployment_id: None,
            execution_id: process_instance_id.clone(),
            process_instance_id,
            activity_id: activity_id.into(),
            activity_instance_id: None,
            tenant_id: None,
            business_key: None,
            extension_properties: BTreeMap::new(),
            activity_priority: None,
            process_priority: None,
        }
    }

    pub fn process_definition_id(mut self, id: impl Into<String>) -> Self {
        self.process_definition_id = id.into();
        self
    }

    pub fn version_tag(mut self, tag: impl Into<String>) -> Self {
        self.process_definition_version_tag = Some(tag.into());
        self
    }

    pub fn deployment(mut self, deployment_id: impl Into<String>) -> Self {
        self.deployment_id = Some(deployment_id.into());
        self
    }

    pub fn execution(mut self, execution_id: impl Into<String>) -> Self {
        self.execution_id = execution_id.into();
        self
    }

    pub fn tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn business_key(mut self, business_key: impl Into<String>) -> Self {
        self.business_key = Some(business_key.into());
        self
    }

    pub fn extension_property(mut self, key: &str, value: &str) -> Self {
        self.extension_properties
            .insert(key.to_string(), value.to_string());
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.activity_priority = Some(priority);
        self
    }

    pub fn process_priority(mut self, priority: Priority) -> Self {
        self.process_priority = Some(priority);
        self
    }
}

/// A task handed to a worker by a fetch call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LockedExternalTask {
    pub task: ExternalTask,
    pub worker_id: String,
    pub lock_expiration_time: DateTime<Utc>,
    pub variables: Variables,
    pub error_details: Option<String>,
}

impl LockedExternalTask {
    pub fn id(&self) -> &TaskId {
        &self.task.id
    }

    pub fn topic_name(&self) -> &str {
        &self.task.topic_name
    }

    pub fn priority(&self) -> i64 {
        self.task.priority
    }

    pub fn activity_id(&self) -> &str {
        &self.task.activity_id
    }

    pub fn retries(&self) -> Option<i32> {
        self.task.retries
    }

    pub fn error_message(&self) -> Option<&str> {
        self.task.error_message.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_static_priority() {
        assert_eq!(Priority::parse("a", " 42 ").unwrap(), Priority::Value(42));
        assert_eq!(Priority::parse("a", "-3").unwrap(), Priority::Value(-3));
    }

    #[test]
    fn test_parse_expression_priority() {
        assert_eq!(
            Priority::parse("a", "${priority}").unwrap(),
            Priority::Expression("priority".to_string())
        );
    }

    #[test]
    fn test_parse_malformed_priority() {
        let err = Priority::parse("externalTaskWithPrio", "NOTaNumber").unwrap_err();
        assert!(err
            .to_string()
            .contains("Value 'NOTaNumber' for attribute 'taskPriority' is not a valid number"));
        assert!(err.to_string().contains("externalTaskWithPrio"));
    }
}
