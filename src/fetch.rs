//! Fetch requests and their builder.

use std::cmp::Ordering;

use crate::error::TaskError;
use crate::task::ExternalTask;

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

/// Which variables to return with each fetched task.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum VariableSelection {
    #[default]
    All,
    /// Only these names; an empty list returns no variables.
    Named(Vec<String>),
}

impl VariableSelection {
    pub fn includes(&self, name: &str) -> bool {
        match self {
            Self::All => true,
            Self::Named(names) => names.iter().any(|n| n == name),
        }
    }
}

/// Tenant restriction of a subscription.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TenantFilter {
    #[default]
    Any,
    In(Vec<String>),
    WithoutTenant,
}

/// One topic a worker subscribes to in a fetch call.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TopicSubscription {
    pub topic_name: String,
    pub lock_duration_ms: i64,
    pub variables: VariableSelection,
    /// Resolve variables from the task's own execution only.
    pub local_variables: bool,
    pub process_definition_id: Option<String>,
    pub process_definition_id_in: Vec<String>,
    pub process_definition_key: Option<String>,
    pub process_definition_key_in: Vec<String>,
    pub process_definition_version_tag: Option<String>,
    pub business_key: Option<String>,
    pub tenants: TenantFilter,
    /// Process-instance variables that must all equal the given values.
    pub variable_equals: Vec<(String, serde_json::Value)>,
    pub include_extension_properties: bool,
}

impl TopicSubscription {
    pub fn new(topic_name: impl Into<String>, lock_duration_ms: i64) -> Self {
        Self {
            topic_name: topic_name.into(),
            lock_duration_ms,
            ..Default::default()
        }
    }
}

/// A worker's request for work across one or more topics.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FetchRequest {
    pub worker_id: String,
    /// Cap on the number of tasks returned across all topics.
    pub max_tasks: i64,
    pub use_priority: bool,
    /// Only honoured when a direction was given.
    pub order_by_create_time: Option<Direction>,
    pub topics: Vec<TopicSubscription>,
}

/// Global ordering applied across all subscriptions of one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FetchOrdering {
    pub use_priority: bool,
    pub create_time: Option<Direction>,
}

impl FetchOrdering {
    /// Priority descending first when enabled, then create time, then insertion order.
    pub fn compare(&self, a: &ExternalTask, b: &ExternalTask) -> Ordering {
        let by_priority = if self.use_priority {
            b.priority.cmp(&a.priority)
        } else {
            Ordering::Equal
        };
        let by_create_time = match self.create_time {
            Some(Direction::Asc) => a.create_time.cmp(&b.create_time),
            Some(Direction::Desc) => b.create_time.cmp(&a.create_time),
            None => Ordering::Equal,
        };
        by_priority
            .then(by_create_time)
            .then_with(|| a.seq.cmp(&b.seq))
    }
}

impl FetchRequest {
    pub fn ordering(&self) -> FetchOrdering {
        FetchOrdering {
            use_priority: self.use_priority,
            create_time: self.order_by_create_time,
        }
    }

    pub fn builder(worker_id: impl Into<String>, max_tasks: i64) -> FetchBuilder {
        FetchBuilder::new(worker_id, max_tasks)
    }

    /// Check the request before any side effect happens.
    pub fn validate(&self) -> Result<(), TaskError> {
        if self.worker_id.is_empty() {
            return Err(TaskError::validation("workerId is null"));
        }
        if self.max_tasks < 0 {
            return Err(TaskError::validation(
                "maxResults is not greater than or equal to 0",
            ));
        }
        for topic in &self.topics {
            if topic.topic_name.is_empty() {
                return Err(TaskError::validation("topicName is null"));
            }
            if topic.lock_duration_ms <= 0 {
                return Err(TaskError::validation(
                    "lockTime is not greater than 0",
                ));
            }
        }
        Ok(())
    }
}

/// Fluent construction of a [`FetchRequest`].
///
/// Per-topic options apply to the most recently added topic.
///
/// ```rust,ignore
/// let request = FetchRequest::builder("worker-1", 10)
///     .use_priority(true)
///     .topic("invoices", 30_000)
///     .variables(&["amount"])
///     .business_key("order-7")
///     .topic("shipping", 60_000)
///     .order_by_create_time()
///     .desc()
///     .build()?;
/// ```
#[derive(Debug)]
pub struct FetchBuilder {
    request: FetchRequest,
    ordering_started: bool,
    error: Option<TaskError>,
}

impl FetchBuilder {
    fn new(worker_id: impl Into<String>, max_tasks: i64) -> Self {
        Self {
            request: FetchRequest {
                worker_id: worker_id.into(),
                max_tasks,
                ..Default::default()
            },
            ordering_started: false,
            error: None,
        }
    }

    pub fn use_priority(mut self, use_priority: bool) -> Self {
        self.request.use_priority = use_priority;
        self
    }

    /// Subscribe to a topic with the given lock duration in milliseconds.
    pub fn topic(mut self, topic_name: impl Into<String>, lock_duration_ms: i64) -> Self {
        self.request
            .topics
            .push(TopicSubscription::new(topic_name, lock_duration_ms));
        self
    }

    pub fn variables(self, names: &[&str]) -> Self {
        let names = names.iter().map(|n| n.to_string()).collect();
        self.with_topic(|t| t.variables = VariableSelection::Named(names))
    }

    pub fn all_variables(self) -> Self {
        self.with_topic(|t| t.variables = VariableSelection::All)
    }

    pub fn local_variables(self) -> Self {
        self.with_topic(|t| t.local_variables = true)
    }

    pub fn process_definition_id(self, id: &str) -> Self {
        self.with_topic(|t| t.process_definition_id = Some(id.to_string()))
    }

    pub fn process_definition_id_in(self, ids: &[&str]) -> Self {
        self.with_topic(|t| {
            t.process_definition_id_in = ids.iter().map(|s| s.to_string()).collect()
        })
    }

    pub fn process_definition_key(self, key: &str) -> Self {
        self.with_topic(|t| t.process_definition_key = Some(key.to_string()))
    }

    pub fn process_definition_key_in(self, keys: &[&str]) -> Self {
        self.with_topic(|t| {
            t.process_definition_key_in = keys.iter().map(|s| s.to_string()).collect()
        })
    }

    pub fn process_definition_version_tag(self, tag: &str) -> Self {
        self.with_topic(|t| t.process_definition_version_tag = Some(tag.to_string()))
    }

    pub fn business_key(self, business_key: &str) -> Self {
        self.with_topic(|t| t.business_key = Some(business_key.to_string()))
    }

    pub fn tenant_id_in(self, tenant_ids: &[&str]) -> Self {
        self.with_topic(|t| {
            t.tenants = TenantFilter::In(tenant_ids.iter().map(|s| s.to_string()).collect())
        })
    }

    pub fn without_tenant_id(self) -> Self {
        self.with_topic(|t| t.tenants = TenantFilter::WithoutTenant)
    }

    pub fn process_instance_variable_equals(
        self,
        name: &str,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        let value = value.into();
        self.with_topic(|t| t.variable_equals.push((name.to_string(), value)))
    }

    pub fn include_extension_properties(self) -> Self {
        self.with_topic(|t| t.include_extension_properties = true)
    }

    /// Start ordering by create time; a direction must follow.
    pub fn order_by_create_time(mut self) -> Self {
        self.ordering_started = true;
        self
    }

    pub fn asc(self) -> Self {
        self.direction(Direction::Asc)
    }

    pub fn desc(self) -> Self {
        self.direction(Direction::Desc)
    }

    fn direction(mut self, direction: Direction) -> Self {
        if !self.ordering_started {
            self.fail(TaskError::validation(
                "You should call any of the orderBy methods first before specifying a direction: currentOrderingProperty is null",
            ));
            return self;
        }
        self.request.order_by_create_time = Some(direction);
        self.ordering_started = false;
        self
    }

    fn with_topic(mut self, f: impl FnOnce(&mut TopicSubscription)) -> Self {
        match self.request.topics.last_mut() {
            Some(topic) => f(topic),
            None => self.fail(TaskError::validation(
                "a topic must be added before configuring it",
            )),
        }
        self
    }

    fn fail(&mut self, err: TaskError) {
        if self.error.is_none() {
            self.error = Some(err);
        }
    }

    /// Finish the request. Builder misuse is reported here.
    pub fn build(self) -> Result<FetchRequest, TaskError> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.request),
        }
    }
}
