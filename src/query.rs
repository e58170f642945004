//! Read-only query over external tasks.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};

use crate::error::TaskError;
use crate::fetch::Direction;
use crate::task::{ExternalTask, TaskId};

/// Property a query result can be sorted by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortKey {
    Id,
    ProcessInstanceId,
    ProcessDefinitionId,
    ProcessDefinitionKey,
    LockExpirationTime,
    CreateTime,
    Priority,
    TenantId,
}

impl SortKey {
    fn compare(&self, a: &ExternalTask, b: &ExternalTask) -> Ordering {
        match self {
            Self::Id => a.id.cmp(&b.id),
            Self::ProcessInstanceId => a.process_instance_id.cmp(&b.process_instance_id),
            Self::ProcessDefinitionId => a.process_definition_id.cmp(&b.process_definition_id),
            Self::ProcessDefinitionKey => a.process_definition_key.cmp(&b.process_definition_key),
            // Unlocked tasks sort first, as NULLs do ascending.
            Self::LockExpirationTime => a.lock_expiration_time().cmp(&b.lock_expiration_time()),
            Self::CreateTime => a.create_time.cmp(&b.create_time),
            Self::Priority => a.priority.cmp(&b.priority),
            Self::TenantId => a.tenant_id.cmp(&b.tenant_id),
        }
    }
}

/// Filters and sorting for listing external tasks.
///
/// All filters are conjunctive. Id lists of any length are accepted; the
/// store splits them across statements.
#[derive(Debug, Clone, Default)]
pub struct ExternalTaskQuery {
    pub id: Option<TaskId>,
    pub id_in: Option<Vec<TaskId>>,
    pub activity_id: Option<String>,
    pub activity_id_in: Option<Vec<String>>,
    pub execution_id: Option<String>,
    pub process_instance_id: Option<String>,
    pub process_instance_id_in: Option<Vec<String>>,
    pub process_definition_id: Option<String>,
    pub process_definition_key: Option<String>,
    pub process_definition_key_in: Option<Vec<String>>,
    pub topic_name: Option<String>,
    pub worker_id: Option<String>,
    pub lock_expiration_before: Option<DateTime<Utc>>,
    pub lock_expiration_after: Option<DateTime<Utc>>,
    /// `Some(true)` for locked only, `Some(false)` for not locked only.
    pub locked: Option<bool>,
    pub suspended: Option<bool>,
    /// `Some(true)`: retries unset or above zero. `Some(false)`: retries exactly zero.
    pub retries_left: Option<bool>,
    pub priority_at_least: Option<i64>,
    pub priority_at_most: Option<i64>,
    pub business_key: Option<String>,
    pub tenant_id_in: Option<Vec<String>>,
    pub without_tenant_id: bool,
    pub sorting: Vec<(SortKey, Direction)>,
    pending_sort: Option<SortKey>,
    misuse: Option<String>,
}

impl ExternalTaskQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn external_task_id(mut self, id: impl Into<TaskId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn external_task_id_in<I, T>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<TaskId>,
    {
        self.id_in = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    pub fn activity_id(mut self, activity_id: &str) -> Self {
        self.activity_id = Some(activity_id.to_string());
        self
    }

    pub fn activity_id_in(mut self, activity_ids: &[&str]) -> Self {
        self.activity_id_in = Some(activity_ids.iter().map(|s| s.to_string()).collect());
        self
    }

    pub fn execution_id(mut self, execution_id: &str) -> Self {
        self.execution_id = Some(execution_id.to_string());
        self
    }

    pub fn process_instance_id(mut self, id: &str) -> Self {
        self.process_instance_id = Some(id.to_string());
        self
    }

    pub fn process_instance_id_in<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.process_instance_id_in = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    pub fn process_definition_id(mut self, id: &str) -> Self {
        self.process_definition_id = Some(id.to_string());
        self
    }

    pub fn process_definition_key(mut self, key: &str) -> Self {
        self.process_definition_key = Some(key.to_string());
        self
    }

    pub fn process_definition_key_in(mut self, keys: &[&str]) -> Self {
        self.process_definition_key_in = Some(keys.iter().map(|s| s.to_string()).collect());
        self
    }

    pub fn topic_name(mut self, topic: &str) -> Self {
        self.topic_name = Some(topic.to_string());
        self
    }

    pub fn worker_id(mut self, worker_id: &str) -> Self {
        self.worker_id = Some(worker_id.to_string());
        self
    }

    pub fn lock_expiration_before(mut self, at: DateTime<Utc>) -> Self {
        self.lock_expiration_before = Some(at);
        self
    }

    pub fn lock_expiration_after(mut self, at: DateTime<Utc>) -> Self {
        self.lock_expiration_after = Some(at);
        self
    }

    pub fn locked(mut self) -> Self {
        self.locked = Some(true);
        self
    }

    pub fn not_locked(mut self) -> Self {
        self.locked = Some(false);
        self
    }

    pub fn suspended(mut self) -> Self {
        self.suspended = Some(true);
        self
    }

    pub fn active(mut self) -> Self {
        self.suspended = Some(false);
        self
    }

    pub fn with_retries_left(mut self) -> Self {
        self.retries_left = Some(true);
        self
    }

    pub fn no_retries_left(mut self) -> Self {
        self.retries_left = Some(false);
        self
    }

    pub fn priority_higher_than_or_equals(mut self, priority: i64) -> Self {
        self.priority_at_least = Some(priority);
        self
    }

    pub fn priority_lower_than_or_equals(mut self, priority: i64) -> Self {
        self.priority_at_most = Some(priority);
        self
    }

    pub fn business_key(mut self, business_key: &str) -> Self {
        self.business_key = Some(business_key.to_string());
        self
    }

    pub fn tenant_id_in(mut self, tenants: &[&str]) -> Self {
        self.tenant_id_in = Some(tenants.iter().map(|s| s.to_string()).collect());
        self
    }

    pub fn without_tenant_id(mut self) -> Self {
        self.without_tenant_id = true;
        self
    }

    pub fn order_by_id(self) -> Self {
        self.order_by(SortKey::Id)
    }

    pub fn order_by_process_instance_id(self) -> Self {
        self.order_by(SortKey::ProcessInstanceId)
    }

    pub fn order_by_process_definition_id(self) -> Self {
        self.order_by(SortKey::ProcessDefinitionId)
    }

    pub fn order_by_process_definition_key(self) -> Self {
        self.order_by(SortKey::ProcessDefinitionKey)
    }

    pub fn order_by_lock_expiration_time(self) -> Self {
        self.order_by(SortKey::LockExpirationTime)
    }

    pub fn order_by_create_time(self) -> Self {
        self.order_by(SortKey::CreateTime)
    }

    pub fn order_by_priority(self) -> Self {
        self.order_by(SortKey::Priority)
    }

    pub fn order_by_tenant_id(self) -> Self {
        self.order_by(SortKey::TenantId)
    }

    pub fn asc(self) -> Self {
        self.direction(Direction::Asc)
    }

    pub fn desc(self) -> Self {
        self.direction(Direction::Desc)
    }

    fn order_by(mut self, key: SortKey) -> Self {
        if self.pending_sort.is_some() && self.misuse.is_none() {
            self.misuse = Some("Invalid query: call asc() or desc() after using orderByXX()".into());
        }
        self.pending_sort = Some(key);
        self
    }

    fn direction(mut self, direction: Direction) -> Self {
        match self.pending_sort.take() {
            Some(key) => self.sorting.push((key, direction)),
            None => {
                if self.misuse.is_none() {
                    self.misuse = Some(
                        "You should call any of the orderBy methods first before specifying a direction: currentOrderingProperty is null"
                            .into(),
                    );
                }
            }
        }
        self
    }

    /// Report builder misuse before the query runs.
    pub fn check(&self) -> Result<(), TaskError> {
        if let Some(message) = &self.misuse {
            return Err(TaskError::validation(message.clone()));
        }
        if self.pending_sort.is_some() {
            return Err(TaskError::validation(
                "Invalid query: call asc() or desc() after using orderByXX()",
            ));
        }
        Ok(())
    }

    /// Order results by the configured sort keys, falling back to insertion order.
    pub fn sort(&self, tasks: &mut [ExternalTask]) {
        tasks.sort_by(|a, b| {
            for (key, direction) in &self.sorting {
                let ord = key.compare(a, b);
                let ord = match direction {
                    Direction::Asc => ord,
                    Direction::Desc => ord.reverse(),
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            a.seq.cmp(&b.seq)
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_without_order_by_is_misuse() {
        let query = ExternalTaskQuery::new().asc();
        assert!(query.check().is_err());
    }

    #[test]
    fn test_order_by_without_direction_is_misuse() {
        let query = ExternalTaskQuery::new().order_by_priority();
        assert!(query.check().is_err());
    }

    #[test]
    fn test_multi_key_sorting_recorded_in_order() {
        let query = ExternalTaskQuery::new()
            .order_by_priority()
            .desc()
            .order_by_create_time()
            .asc();
        assert!(query.check().is_ok());
        assert_eq!(
            query.sorting,
            vec![
                (SortKey::Priority, Direction::Desc),
                (SortKey::CreateTime, Direction::Asc)
            ]
        );
    }
}
