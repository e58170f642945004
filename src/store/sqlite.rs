//! SQLite implementation of TaskStore.

use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Sqlite, SqliteConnection, SqlitePool};

use super::{Completion, FailureUpdate, IncidentFilter, TaskStore};
use crate::clock::from_millis;
use crate::config::EngineConfig;
use crate::error::TaskError;
use crate::fetch::{Direction, FetchOrdering, TenantFilter, TopicSubscription};
use crate::history::{HistoricLogEntry, LogState};
use crate::incident::{Incident, IncidentAction, IncidentState};
use crate::query::ExternalTaskQuery;
use crate::task::{ExternalTask, Lease, TaskId, Variables};

const TASK_COLUMNS: &str = "seq, id, topic_name, process_instance_id, process_definition_id, \
    process_definition_key, process_definition_version_tag, deployment_id, execution_id, \
    activity_id, activity_instance_id, priority, create_time, retries, error_message, \
    error_details_id, suspended, tenant_id, business_key, extension_properties, worker_id, \
    lock_expiration_time, retry_after";

const LOG_COLUMNS: &str = "id, external_task_id, timestamp, state, topic_name, worker_id, \
    retries, priority, error_message, error_details, activity_id, execution_id, \
    process_instance_id, process_definition_id, process_definition_key, tenant_id";

const INCIDENT_COLUMNS: &str = "id, incident_type, configuration, history_configuration, \
    execution_id, activity_id, process_definition_id, process_instance_id, tenant_id, \
    incident_message, cause_incident_id, root_cause_incident_id, timestamp, end_time, state";

fn storage(e: sqlx::Error) -> TaskError {
    TaskError::Storage(e.to_string())
}

fn serialization(e: serde_json::Error) -> TaskError {
    TaskError::Serialization(e.to_string())
}

#[derive(sqlx::FromRow)]
struct TaskRow {
    seq: i64,
    id: String,
    topic_name: String,
    process_instance_id: String,
    process_definition_id: String,
    process_definition_key: String,
    process_definition_version_tag: Option<String>,
    deployment_id: Option<String>,
    execution_id: String,
    activity_id: String,
    activity_instance_id: String,
    priority: i64,
    create_time: i64,
    retries: Option<i32>,
    error_message: Option<String>,
    error_details_id: Option<String>,
    suspended: bool,
    tenant_id: Option<String>,
    business_key: Option<String>,
    extension_properties: String,
    worker_id: Option<String>,
    lock_expiration_time: Option<i64>,
    retry_after: Option<i64>,
}

impl TaskRow {
    fn into_task(self) -> Result<ExternalTask, TaskError> {
        let extension_properties: BTreeMap<String, String> =
            serde_json::from_str(&self.extension_properties).map_err(serialization)?;
        let lease = match (self.worker_id, self.lock_expiration_time) {
            (Some(worker_id), Some(expires_at)) => Some(Lease {
                worker_id,
                expires_at: from_millis(expires_at),
            }),
            _ => None,
        };
        Ok(ExternalTask {
            id: TaskId(self.id),
            topic_name: self.topic_name,
            process_instance_id: self.process_instance_id,
            process_definition_id: self.process_definition_id,
            process_definition_key: self.process_definition_key,
            process_definition_version_tag: self.process_definition_version_tag,
            deployment_id: self.deployment_id,
            execution_id: self.execution_id,
            activity_id: self.activity_id,
            activity_instance_id: self.activity_instance_id,
            priority: self.priority,
            create_time: from_millis(self.create_time),
            retries: self.retries,
            error_message: self.error_message,
            suspended: self.suspended,
            tenant_id: self.tenant_id,
            business_key: self.business_key,
            extension_properties,
            lease,
            retry_after: self.retry_after.map(from_millis),
            seq: self.seq,
        })
    }
}

#[derive(sqlx::FromRow)]
struct LogRow {
    id: String,
    external_task_id: String,
    timestamp: i64,
    state: String,
    topic_name: String,
    worker_id: Option<String>,
    retries: Option<i32>,
    priority: i64,
    error_message: Option<String>,
    error_details: Option<String>,
    activity_id: String,
    execution_id: String,
    process_instance_id: String,
    process_definition_id: String,
    process_definition_key: String,
    tenant_id: Option<String>,
}

impl LogRow {
    fn into_entry(self) -> Result<HistoricLogEntry, TaskError> {
        let state = LogState::parse(&self.state).ok_or_else(|| {
            TaskError::Serialization(format!("unknown log state: {}", self.state))
        })?;
        Ok(HistoricLogEntry {
            id: self.id,
            external_task_id: TaskId(self.external_task_id),
            timestamp: from_millis(self.timestamp),
            state,
            topic_name: self.topic_name,
            worker_id: self.worker_id,
            retries: self.retries,
            priority: self.priority,
            error_message: self.error_message,
            error_details: self.error_details,
            activity_id: self.activity_id,
            execution_id: self.execution_id,
            process_instance_id: self.process_instance_id,
            process_definition_id: self.process_definition_id,
            process_definition_key: self.process_definition_key,
            tenant_id: self.tenant_id,
        })
    }
}

#[derive(sqlx::FromRow)]
struct IncidentRow {
    id: String,
    incident_type: String,
    configuration: String,
    history_configuration: Option<String>,
    execution_id: String,
    activity_id: String,
    process_definition_id: String,
    process_instance_id: String,
    tenant_id: Option<String>,
    incident_message: Option<String>,
    cause_incident_id: String,
    root_cause_incident_id: String,
    timestamp: i64,
    end_time: Option<i64>,
    state: String,
}

impl IncidentRow {
    fn into_incident(self) -> Result<Incident, TaskError> {
        let state = IncidentState::parse(&self.state).ok_or_else(|| {
            TaskError::Serialization(format!("unknown incident state: {}", self.state))
        })?;
        Ok(Incident {
            id: self.id,
            incident_type: self.incident_type,
            configuration: TaskId(self.configuration),
            history_configuration: self.history_configuration,
            execution_id: self.execution_id,
            activity_id: self.activity_id,
            process_definition_id: self.process_definition_id,
            process_instance_id: self.process_instance_id,
            tenant_id: self.tenant_id,
            incident_message: self.incident_message,
            cause_incident_id: self.cause_incident_id,
            root_cause_incident_id: self.root_cause_incident_id,
            timestamp: from_millis(self.timestamp),
            end_time: self.end_time.map(from_millis),
            state,
        })
    }
}

/// SQLite-backed external task store.
pub struct SqliteTaskStore {
    pool: SqlitePool,
    max_ids_per_statement: usize,
}

impl SqliteTaskStore {
    /// Create a new SqliteTaskStore with default settings.
    pub fn new(pool: SqlitePool) -> Self {
        Self::with_config(pool, &EngineConfig::default())
    }

    /// Create a store that splits id lists per `config.max_ids_per_statement`.
    pub fn with_config(pool: SqlitePool, config: &EngineConfig) -> Self {
        Self {
            pool,
            max_ids_per_statement: config.max_ids_per_statement.max(1),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Run migrations to create the task, log, incident and variable tables.
    pub async fn run_migrations(&self) -> Result<(), TaskError> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS external_tasks (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                topic_name TEXT NOT NULL,
                process_instance_id TEXT NOT NULL,
                process_definition_id TEXT NOT NULL,
                process_definition_key TEXT NOT NULL,
                process_definition_version_tag TEXT,
                deployment_id TEXT,
                execution_id TEXT NOT NULL,
                activity_id TEXT NOT NULL,
                activity_instance_id TEXT NOT NULL,
                priority INTEGER NOT NULL DEFAULT 0,
                create_time INTEGER NOT NULL,
                retries INTEGER,
                error_message TEXT,
                error_details_id TEXT,
                suspended INTEGER NOT NULL DEFAULT 0,
                tenant_id TEXT,
                business_key TEXT,
                extension_properties TEXT NOT NULL DEFAULT '{}',
                worker_id TEXT,
                lock_expiration_time INTEGER,
                retry_after INTEGER,
                CHECK ((worker_id IS NULL) = (lock_expiration_time IS NULL))
            )
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_external_tasks_topic
            ON external_tasks(topic_name, suspended, lock_expiration_time)
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_external_tasks_process_instance
            ON external_tasks(process_instance_id)
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS external_task_log (
                log_seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                external_task_id TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                state TEXT NOT NULL,
                topic_name TEXT NOT NULL,
                worker_id TEXT,
                retries INTEGER,
                priority INTEGER NOT NULL,
                error_message TEXT,
                error_details TEXT,
                activity_id TEXT NOT NULL,
                execution_id TEXT NOT NULL,
                process_instance_id TEXT NOT NULL,
                process_definition_id TEXT NOT NULL,
                process_definition_key TEXT NOT NULL,
                tenant_id TEXT
            )
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_external_task_log_task
            ON external_task_log(external_task_id)
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS external_task_incidents (
                id TEXT PRIMARY KEY,
                incident_type TEXT NOT NULL,
                configuration TEXT NOT NULL,
                history_configuration TEXT,
                execution_id TEXT NOT NULL,
                activity_id TEXT NOT NULL,
                process_definition_id TEXT NOT NULL,
                process_instance_id TEXT NOT NULL,
                tenant_id TEXT,
                incident_message TEXT,
                cause_incident_id TEXT NOT NULL,
                root_cause_incident_id TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                end_time INTEGER,
                state TEXT NOT NULL
            )
            "#,
            // At most one open incident per task.
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_external_task_incidents_open
            ON external_task_incidents(configuration) WHERE state = 'open'
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS external_task_variables (
                scope_id TEXT NOT NULL,
                name TEXT NOT NULL,
                value TEXT NOT NULL,
                PRIMARY KEY (scope_id, name)
            )
            "#,
        ];

        for statement in statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(storage)?;
        }

        Ok(())
    }

    fn filtered(
        query: &ExternalTaskQuery,
        now_ms: i64,
        lists: &InLists,
    ) -> QueryBuilder<'static, Sqlite> {
        let mut qb = QueryBuilder::new(format!(
            "SELECT {} FROM external_tasks WHERE 1 = 1",
            TASK_COLUMNS
        ));

        push_eq(&mut qb, "id", query.id.as_ref().map(|id| id.as_str()));
        if let Some(ids) = &lists.ids {
            push_in(&mut qb, "id", ids.iter().cloned());
        }
        push_eq(&mut qb, "activity_id", query.activity_id.as_deref());
        if let Some(activity_ids) = &lists.activity_ids {
            push_in(&mut qb, "activity_id", activity_ids.iter().cloned());
        }
        push_eq(&mut qb, "execution_id", query.execution_id.as_deref());
        push_eq(&mut qb, "process_instance_id", query.process_instance_id.as_deref());
        if let Some(pis) = &lists.process_instance_ids {
            push_in(&mut qb, "process_instance_id", pis.iter().cloned());
        }
        push_eq(&mut qb, "process_definition_id", query.process_definition_id.as_deref());
        push_eq(&mut qb, "process_definition_key", query.process_definition_key.as_deref());
        if let Some(keys) = &lists.process_definition_keys {
            push_in(&mut qb, "process_definition_key", keys.iter().cloned());
        }
        push_eq(&mut qb, "topic_name", query.topic_name.as_deref());
        push_eq(&mut qb, "worker_id", query.worker_id.as_deref());
        push_eq(&mut qb, "business_key", query.business_key.as_deref());

        if let Some(before) = query.lock_expiration_before {
            qb.push(" AND lock_expiration_time < ")
                .push_bind(before.timestamp_millis());
        }
        if let Some(after) = query.lock_expiration_after {
            qb.push(" AND lock_expiration_time > ")
                .push_bind(after.timestamp_millis());
        }
        match query.locked {
            Some(true) => {
                qb.push(" AND lock_expiration_time > ").push_bind(now_ms);
            }
            Some(false) => {
                qb.push(" AND (lock_expiration_time IS NULL OR lock_expiration_time <= ")
                    .push_bind(now_ms)
                    .push(")");
            }
            None => {}
        }
        if let Some(suspended) = query.suspended {
            qb.push(" AND suspended = ").push_bind(suspended);
        }
        match query.retries_left {
            Some(true) => {
                qb.push(" AND (retries IS NULL OR retries > 0)");
            }
            Some(false) => {
                qb.push(" AND retries = 0");
            }
            None => {}
        }
        if let Some(min) = query.priority_at_least {
            qb.push(" AND priority >= ").push_bind(min);
        }
        if let Some(max) = query.priority_at_most {
            qb.push(" AND priority <= ").push_bind(max);
        }
        if let Some(tenants) = &lists.tenant_ids {
            push_in(&mut qb, "tenant_id", tenants.iter().cloned());
        }
        if query.without_tenant_id {
            qb.push(" AND tenant_id IS NULL");
        }

        qb
    }
}

fn push_eq(qb: &mut QueryBuilder<'static, Sqlite>, column: &str, value: Option<&str>) {
    if let Some(value) = value {
        qb.push(" AND ")
            .push(column)
            .push(" = ")
            .push_bind(value.to_string());
    }
}

fn push_in(
    qb: &mut QueryBuilder<'static, Sqlite>,
    column: &str,
    values: impl IntoIterator<Item = String>,
) {
    let mut values = values.into_iter().peekable();
    if values.peek().is_none() {
        qb.push(" AND 0");
        return;
    }
    qb.push(" AND ").push(column).push(" IN (");
    let mut separated = qb.separated(", ");
    for value in values {
        separated.push_bind(value);
    }
    separated.push_unseparated(")");
}

/// The id-in filters of one query statement.
#[derive(Debug, Clone, Default, PartialEq)]
struct InLists {
    ids: Option<Vec<String>>,
    activity_ids: Option<Vec<String>>,
    process_instance_ids: Option<Vec<String>>,
    process_definition_keys: Option<Vec<String>>,
    tenant_ids: Option<Vec<String>>,
}

impl InLists {
    fn of(query: &ExternalTaskQuery) -> Self {
        Self {
            ids: query
                .id_in
                .as_ref()
                .map(|ids| ids.iter().map(|id| id.0.clone()).collect()),
            activity_ids: query.activity_id_in.clone(),
            process_instance_ids: query.process_instance_id_in.clone(),
            process_definition_keys: query.process_definition_key_in.clone(),
            tenant_ids: query.tenant_id_in.clone(),
        }
    }

    /// Split every list into pieces of at most `size` values and return one
    /// statement per combination of pieces. Each row matches exactly one
    /// combination, so the union of the results equals the unsplit query.
    /// An empty list yields no statements at all.
    fn chunked(self, size: usize) -> Vec<InLists> {
        let mut out = vec![InLists::default()];
        out = expand(out, self.ids, size, |l, v| l.ids = v);
        out = expand(out, self.activity_ids, size, |l, v| l.activity_ids = v);
        out = expand(out, self.process_instance_ids, size, |l, v| {
            l.process_instance_ids = v
        });
        out = expand(out, self.process_definition_keys, size, |l, v| {
            l.process_definition_keys = v
        });
        expand(out, self.tenant_ids, size, |l, v| l.tenant_ids = v)
    }
}

fn expand(
    partial: Vec<InLists>,
    values: Option<Vec<String>>,
    size: usize,
    set: impl Fn(&mut InLists, Option<Vec<String>>),
) -> Vec<InLists> {
    let Some(mut values) = values else {
        return partial;
    };
    // Duplicates split across pieces would return a row twice.
    let mut seen = HashSet::new();
    values.retain(|v| seen.insert(v.clone()));

    let mut out = Vec::with_capacity(partial.len());
    for lists in &partial {
        for piece in values.chunks(size.max(1)) {
            let mut next = lists.clone();
            set(&mut next, Some(piece.to_vec()));
            out.push(next);
        }
    }
    out
}

async fn fetch_task(conn: &mut SqliteConnection, id: &str) -> Result<Option<TaskRow>, TaskError> {
    sqlx::query_as::<_, TaskRow>(&format!(
        "SELECT {} FROM external_tasks WHERE id = ?",
        TASK_COLUMNS
    ))
    .bind(id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(storage)
}

async fn insert_log(conn: &mut SqliteConnection, entry: &HistoricLogEntry) -> Result<(), TaskError> {
    sqlx::query(&format!(
        "INSERT INTO external_task_log ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        LOG_COLUMNS
    ))
    .bind(&entry.id)
    .bind(entry.external_task_id.as_str())
    .bind(entry.timestamp.timestamp_millis())
    .bind(entry.state.as_str())
    .bind(&entry.topic_name)
    .bind(&entry.worker_id)
    .bind(entry.retries)
    .bind(entry.priority)
    .bind(&entry.error_message)
    .bind(&entry.error_details)
    .bind(&entry.activity_id)
    .bind(&entry.execution_id)
    .bind(&entry.process_instance_id)
    .bind(&entry.process_definition_id)
    .bind(&entry.process_definition_key)
    .bind(&entry.tenant_id)
    .execute(&mut *conn)
    .await
    .map_err(storage)?;
    Ok(())
}

async fn close_incidents(
    conn: &mut SqliteConnection,
    task_id: &TaskId,
    state: IncidentState,
    now: DateTime<Utc>,
) -> Result<u64, TaskError> {
    let result = sqlx::query(
        r#"
        UPDATE external_task_incidents
        SET state = ?, end_time = ?
        WHERE configuration = ? AND state = 'open'
        "#,
    )
    .bind(state.as_str())
    .bind(now.timestamp_millis())
    .bind(task_id.as_str())
    .execute(&mut *conn)
    .await
    .map_err(storage)?;
    Ok(result.rows_affected())
}

async fn apply_incident(
    conn: &mut SqliteConnection,
    task_id: &TaskId,
    action: &IncidentAction,
    now: DateTime<Utc>,
) -> Result<(), TaskError> {
    match action {
        IncidentAction::Resolve => {
            close_incidents(conn, task_id, IncidentState::Resolved, now).await?;
        }
        IncidentAction::Open(incident) => {
            // The partial unique index turns a second open incident into a no-op.
            sqlx::query(&format!(
                "INSERT OR IGNORE INTO external_task_incidents ({}) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                INCIDENT_COLUMNS
            ))
            .bind(&incident.id)
            .bind(&incident.incident_type)
            .bind(incident.configuration.as_str())
            .bind(&incident.history_configuration)
            .bind(&incident.execution_id)
            .bind(&incident.activity_id)
            .bind(&incident.process_definition_id)
            .bind(&incident.process_instance_id)
            .bind(&incident.tenant_id)
            .bind(&incident.incident_message)
            .bind(&incident.cause_incident_id)
            .bind(&incident.root_cause_incident_id)
            .bind(incident.timestamp.timestamp_millis())
            .bind(incident.end_time.map(|t| t.timestamp_millis()))
            .bind(incident.state.as_str())
            .execute(&mut *conn)
            .await
            .map_err(storage)?;
        }
    }
    Ok(())
}

async fn write_variables(
    conn: &mut SqliteConnection,
    scope_id: &str,
    variables: &Variables,
) -> Result<(), TaskError> {
    for (name, value) in variables {
        let encoded = serde_json::to_string(value).map_err(serialization)?;
        sqlx::query(
            r#"
            INSERT INTO external_task_variables (scope_id, name, value)
            VALUES (?, ?, ?)
            ON CONFLICT(scope_id, name) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(scope_id)
        .bind(name)
        .bind(encoded)
        .execute(&mut *conn)
        .await
        .map_err(storage)?;
    }
    Ok(())
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn insert(&self, mut task: ExternalTask) -> Result<ExternalTask, TaskError> {
        let extension_properties =
            serde_json::to_string(&task.extension_properties).map_err(serialization)?;

        let mut tx = self.pool.begin().await.map_err(storage)?;

        let seq = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO external_tasks (
                id, topic_name, process_instance_id, process_definition_id,
                process_definition_key, process_definition_version_tag, deployment_id,
                execution_id, activity_id, activity_instance_id, priority, create_time,
                retries, error_message, suspended, tenant_id, business_key,
                extension_properties, worker_id, lock_expiration_time, retry_after
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING seq
            "#,
        )
        .bind(task.id.as_str())
        .bind(&task.topic_name)
        .bind(&task.process_instance_id)
        .bind(&task.process_definition_id)
        .bind(&task.process_definition_key)
        .bind(&task.process_definition_version_tag)
        .bind(&task.deployment_id)
        .bind(&task.execution_id)
        .bind(&task.activity_id)
        .bind(&task.activity_instance_id)
        .bind(task.priority)
        .bind(task.create_time.timestamp_millis())
        .bind(task.retries)
        .bind(&task.error_message)
        .bind(task.suspended)
        .bind(&task.tenant_id)
        .bind(&task.business_key)
        .bind(extension_properties)
        .bind(task.worker_id())
        .bind(task.lock_expiration_time().map(|t| t.timestamp_millis()))
        .bind(task.retry_after.map(|t| t.timestamp_millis()))
        .fetch_one(&mut *tx)
        .await
        .map_err(storage)?;

        task.seq = seq;
        let entry = HistoricLogEntry::record(&task, LogState::Created, task.create_time);
        insert_log(&mut tx, &entry).await?;

        tx.commit().await.map_err(storage)?;
        Ok(task)
    }

    async fn get(&self, id: &TaskId) -> Result<Option<ExternalTask>, TaskError> {
        let mut conn = self.pool.acquire().await.map_err(storage)?;
        fetch_task(&mut conn, id.as_str())
            .await?
            .map(TaskRow::into_task)
            .transpose()
    }

    async fn find(
        &self,
        query: &ExternalTaskQuery,
        now: DateTime<Utc>,
    ) -> Result<Vec<ExternalTask>, TaskError> {
        query.check()?;
        let now_ms = now.timestamp_millis();

        let mut tasks = Vec::new();
        for lists in InLists::of(query).chunked(self.max_ids_per_statement) {
            let mut qb = Self::filtered(query, now_ms, &lists);
            let rows: Vec<TaskRow> = qb
                .build_query_as()
                .fetch_all(&self.pool)
                .await
                .map_err(storage)?;
            for row in rows {
                tasks.push(row.into_task()?);
            }
        }

        query.sort(&mut tasks);
        Ok(tasks)
    }

    async fn select_candidates(
        &self,
        subscription: &TopicSubscription,
        ordering: FetchOrdering,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<ExternalTask>, TaskError> {
        let now_ms = now.timestamp_millis();
        let mut qb: QueryBuilder<'static, Sqlite> = QueryBuilder::new(format!(
            "SELECT {} FROM external_tasks WHERE suspended = 0",
            TASK_COLUMNS
        ));
        qb.push(" AND topic_name = ")
            .push_bind(subscription.topic_name.clone());
        qb.push(" AND (lock_expiration_time IS NULL OR lock_expiration_time <= ")
            .push_bind(now_ms)
            .push(")");
        qb.push(" AND (retry_after IS NULL OR retry_after <= ")
            .push_bind(now_ms)
            .push(")");
        qb.push(" AND (retries IS NULL OR retries != 0)");

        push_eq(&mut qb, "process_definition_id", subscription.process_definition_id.as_deref());
        if !subscription.process_definition_id_in.is_empty() {
            push_in(
                &mut qb,
                "process_definition_id",
                subscription.process_definition_id_in.iter().cloned(),
            );
        }
        push_eq(&mut qb, "process_definition_key", subscription.process_definition_key.as_deref());
        if !subscription.process_definition_key_in.is_empty() {
            push_in(
                &mut qb,
                "process_definition_key",
                subscription.process_definition_key_in.iter().cloned(),
            );
        }
        push_eq(
            &mut qb,
            "process_definition_version_tag",
            subscription.process_definition_version_tag.as_deref(),
        );
        push_eq(&mut qb, "business_key", subscription.business_key.as_deref());

        match &subscription.tenants {
            TenantFilter::Any => {}
            TenantFilter::In(tenants) => push_in(&mut qb, "tenant_id", tenants.iter().cloned()),
            TenantFilter::WithoutTenant => {
                qb.push(" AND tenant_id IS NULL");
            }
        }

        for (name, value) in &subscription.variable_equals {
            let encoded = serde_json::to_string(value).map_err(serialization)?;
            qb.push(
                " AND EXISTS (SELECT 1 FROM external_task_variables v \
                 WHERE v.scope_id = external_tasks.process_instance_id AND v.name = ",
            )
            .push_bind(name.clone())
            .push(" AND v.value = ")
            .push_bind(encoded)
            .push(")");
        }

        qb.push(" ORDER BY ");
        if ordering.use_priority {
            qb.push("priority DESC, ");
        }
        match ordering.create_time {
            Some(Direction::Asc) => {
                qb.push("create_time ASC, ");
            }
            Some(Direction::Desc) => {
                qb.push("create_time DESC, ");
            }
            None => {}
        }
        qb.push("seq ASC LIMIT ").push_bind(limit as i64);

        let rows: Vec<TaskRow> = qb
            .build_query_as()
            .fetch_all(&self.pool)
            .await
            .map_err(storage)?;

        rows.into_iter().map(TaskRow::into_task).collect()
    }

    async fn try_acquire(
        &self,
        id: &TaskId,
        observed: Option<&Lease>,
        lease: &Lease,
        now: DateTime<Utc>,
    ) -> Result<bool, TaskError> {
        let now_ms = now.timestamp_millis();
        let result = sqlx::query(
            r#"
            UPDATE external_tasks
            SET worker_id = ?, lock_expiration_time = ?, retry_after = NULL
            WHERE id = ?
              AND worker_id IS ? AND lock_expiration_time IS ?
              AND suspended = 0
              AND (lock_expiration_time IS NULL OR lock_expiration_time <= ?)
              AND (retry_after IS NULL OR retry_after <= ?)
              AND (retries IS NULL OR retries != 0)
            "#,
        )
        .bind(&lease.worker_id)
        .bind(lease.expires_at.timestamp_millis())
        .bind(id.as_str())
        .bind(observed.map(|l| l.worker_id.as_str()))
        .bind(observed.map(|l| l.expires_at.timestamp_millis()))
        .bind(now_ms)
        .bind(now_ms)
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        Ok(result.rows_affected() == 1)
    }

    async fn replace_lease(
        &self,
        id: &TaskId,
        observed: Option<&Lease>,
        lease: &Lease,
    ) -> Result<bool, TaskError> {
        let result = sqlx::query(
            r#"
            UPDATE external_tasks
            SET worker_id = ?, lock_expiration_time = ?, retry_after = NULL
            WHERE id = ? AND worker_id IS ? AND lock_expiration_time IS ? AND suspended = 0
            "#,
        )
        .bind(&lease.worker_id)
        .bind(lease.expires_at.timestamp_millis())
        .bind(id.as_str())
        .bind(observed.map(|l| l.worker_id.as_str()))
        .bind(observed.map(|l| l.expires_at.timestamp_millis()))
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        Ok(result.rows_affected() == 1)
    }

    async fn release(&self, id: &TaskId) -> Result<bool, TaskError> {
        let result = sqlx::query(
            r#"
            UPDATE external_tasks
            SET worker_id = NULL, lock_expiration_time = NULL, retry_after = NULL
            WHERE id = ?
            "#,
        )
        .bind(id.as_str())
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        Ok(result.rows_affected() == 1)
    }

    async fn record_failure(&self, failure: &FailureUpdate) -> Result<Option<ExternalTask>, TaskError> {
        let log_id = uuid::Uuid::new_v4().to_string();
        let mut tx = self.pool.begin().await.map_err(storage)?;

        // The lease is kept but expires now; retry_after gates the next fetch.
        let result = sqlx::query(
            r#"
            UPDATE external_tasks
            SET error_message = ?, error_details_id = ?, retries = ?,
                lock_expiration_time = ?, retry_after = ?
            WHERE id = ? AND worker_id = ?
            "#,
        )
        .bind(&failure.error_message)
        .bind(&log_id)
        .bind(failure.retries)
        .bind(failure.now.timestamp_millis())
        .bind(failure.retry_after.timestamp_millis())
        .bind(failure.task_id.as_str())
        .bind(&failure.worker_id)
        .execute(&mut *tx)
        .await
        .map_err(storage)?;

        if result.rows_affected() == 0 {
            tx.rollback().await.map_err(storage)?;
            return Ok(None);
        }

        let task = fetch_task(&mut tx, failure.task_id.as_str())
            .await?
            .ok_or_else(|| TaskError::not_found(Some(failure.task_id.as_str())))?
            .into_task()?;

        let mut entry = HistoricLogEntry::record(&task, LogState::Failed, failure.now);
        entry.id = log_id.clone();
        entry.error_details = failure.error_details.clone();
        insert_log(&mut tx, &entry).await?;

        let action = IncidentAction::for_retries(&task, failure.retries, Some(log_id), failure.now);
        apply_incident(&mut tx, &task.id, &action, failure.now).await?;

        write_variables(&mut tx, &task.process_instance_id, &failure.variables).await?;
        write_variables(&mut tx, &task.execution_id, &failure.local_variables).await?;

        tx.commit().await.map_err(storage)?;
        Ok(Some(task))
    }

    async fn update_retries(
        &self,
        ids: &[TaskId],
        retries: i32,
        require_all: bool,
        now: DateTime<Utc>,
    ) -> Result<Vec<TaskId>, TaskError> {
        let mut tx = self.pool.begin().await.map_err(storage)?;

        let mut rows: Vec<TaskRow> = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(self.max_ids_per_statement) {
            let mut qb: QueryBuilder<'static, Sqlite> = QueryBuilder::new(format!(
                "SELECT {} FROM external_tasks WHERE 1 = 1",
                TASK_COLUMNS
            ));
            push_in(&mut qb, "id", chunk.iter().map(|id| id.0.clone()));
            let found: Vec<TaskRow> = qb
                .build_query_as()
                .fetch_all(&mut *tx)
                .await
                .map_err(storage)?;
            rows.extend(found);
        }

        if require_all {
            let found: HashSet<&str> = rows.iter().map(|r| r.id.as_str()).collect();
            if let Some(missing) = ids.iter().find(|id| !found.contains(id.as_str())) {
                let message = format!("Cannot find external task with id {}", missing);
                tx.rollback().await.map_err(storage)?;
                return Err(TaskError::BadRequest(message));
            }
        }

        let mut updated = Vec::with_capacity(rows.len());
        for row in rows {
            let last_failure = row.error_details_id.clone();
            let mut task = row.into_task()?;

            sqlx::query("UPDATE external_tasks SET retries = ? WHERE id = ?")
                .bind(retries)
                .bind(task.id.as_str())
                .execute(&mut *tx)
                .await
                .map_err(storage)?;

            task.retries = Some(retries);
            let action = IncidentAction::for_retries(&task, retries, last_failure, now);
            apply_incident(&mut tx, &task.id, &action, now).await?;
            updated.push(task.id);
        }

        tx.commit().await.map_err(storage)?;
        Ok(updated)
    }

    async fn complete(&self, completion: &Completion) -> Result<Option<ExternalTask>, TaskError> {
        let mut tx = self.pool.begin().await.map_err(storage)?;

        let row = sqlx::query_as::<_, TaskRow>(&format!(
            "SELECT {} FROM external_tasks WHERE id = ? AND worker_id = ?",
            TASK_COLUMNS
        ))
        .bind(completion.task_id.as_str())
        .bind(&completion.worker_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(storage)?;

        let Some(row) = row else {
            tx.rollback().await.map_err(storage)?;
            return Ok(None);
        };
        let task = row.into_task()?;

        sqlx::query("DELETE FROM external_tasks WHERE id = ?")
            .bind(task.id.as_str())
            .execute(&mut *tx)
            .await
            .map_err(storage)?;

        let entry = HistoricLogEntry::record(&task, LogState::Successful, completion.now);
        insert_log(&mut tx, &entry).await?;
        close_incidents(&mut tx, &task.id, IncidentState::Resolved, completion.now).await?;

        write_variables(&mut tx, &task.process_instance_id, &completion.variables).await?;
        write_variables(&mut tx, &task.execution_id, &completion.local_variables).await?;

        tx.commit().await.map_err(storage)?;
        Ok(Some(task))
    }

    async fn delete_process_instance(
        &self,
        process_instance_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<TaskId>, TaskError> {
        let mut tx = self.pool.begin().await.map_err(storage)?;

        let rows = sqlx::query_as::<_, TaskRow>(&format!(
            "SELECT {} FROM external_tasks WHERE process_instance_id = ? ORDER BY seq",
            TASK_COLUMNS
        ))
        .bind(process_instance_id)
        .fetch_all(&mut *tx)
        .await
        .map_err(storage)?;

        let mut removed = Vec::with_capacity(rows.len());
        for row in rows {
            let task = row.into_task()?;
            let entry = HistoricLogEntry::record(&task, LogState::Deleted, now);
            insert_log(&mut tx, &entry).await?;
            close_incidents(&mut tx, &task.id, IncidentState::Deleted, now).await?;

            sqlx::query("DELETE FROM external_task_variables WHERE scope_id = ?")
                .bind(&task.execution_id)
                .execute(&mut *tx)
                .await
                .map_err(storage)?;
            removed.push(task.id);
        }

        sqlx::query("DELETE FROM external_tasks WHERE process_instance_id = ?")
            .bind(process_instance_id)
            .execute(&mut *tx)
            .await
            .map_err(storage)?;
        sqlx::query("DELETE FROM external_task_variables WHERE scope_id = ?")
            .bind(process_instance_id)
            .execute(&mut *tx)
            .await
            .map_err(storage)?;

        tx.commit().await.map_err(storage)?;
        Ok(removed)
    }

    async fn set_priority(&self, id: &TaskId, priority: i64) -> Result<bool, TaskError> {
        let result = sqlx::query("UPDATE external_tasks SET priority = ? WHERE id = ?")
            .bind(priority)
            .bind(id.as_str())
            .execute(&self.pool)
            .await
            .map_err(storage)?;
        Ok(result.rows_affected() == 1)
    }

    async fn set_suspended(&self, process_instance_id: &str, suspended: bool) -> Result<u64, TaskError> {
        let result = sqlx::query("UPDATE external_tasks SET suspended = ? WHERE process_instance_id = ?")
            .bind(suspended)
            .bind(process_instance_id)
            .execute(&self.pool)
            .await
            .map_err(storage)?;
        Ok(result.rows_affected())
    }

    async fn topic_names(
        &self,
        with_locked: bool,
        with_unlocked: bool,
        with_retries_left: bool,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>, TaskError> {
        let now_ms = now.timestamp_millis();
        let mut qb: QueryBuilder<'static, Sqlite> =
            QueryBuilder::new("SELECT DISTINCT topic_name FROM external_tasks WHERE 1 = 1");
        if with_locked && !with_unlocked {
            qb.push(" AND lock_expiration_time > ").push_bind(now_ms);
        } else if with_unlocked && !with_locked {
            qb.push(" AND (lock_expiration_time IS NULL OR lock_expiration_time <= ")
                .push_bind(now_ms)
                .push(")");
        }
        if with_retries_left {
            qb.push(" AND (retries IS NULL OR retries > 0)");
        }
        qb.push(" ORDER BY topic_name");

        qb.build_query_scalar::<String>()
            .fetch_all(&self.pool)
            .await
            .map_err(storage)
    }

    async fn set_variables(&self, scope_id: &str, variables: &Variables) -> Result<(), TaskError> {
        let mut tx = self.pool.begin().await.map_err(storage)?;
        write_variables(&mut tx, scope_id, variables).await?;
        tx.commit().await.map_err(storage)?;
        Ok(())
    }

    async fn variables(&self, scope_id: &str) -> Result<Variables, TaskError> {
        let rows = sqlx::query_as::<_, (String, String)>(
            "SELECT name, value FROM external_task_variables WHERE scope_id = ? ORDER BY name",
        )
        .bind(scope_id)
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;

        let mut variables = Variables::new();
        for (name, value) in rows {
            let value: serde_json::Value = serde_json::from_str(&value).map_err(serialization)?;
            variables.insert(name, value);
        }
        Ok(variables)
    }

    async fn deployments(&self, ids: &[TaskId]) -> Result<Vec<(TaskId, Option<String>)>, TaskError> {
        let mut found = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(self.max_ids_per_statement) {
            let mut qb: QueryBuilder<'static, Sqlite> =
                QueryBuilder::new("SELECT id, deployment_id FROM external_tasks WHERE 1 = 1");
            push_in(&mut qb, "id", chunk.iter().map(|id| id.0.clone()));
            qb.push(" ORDER BY seq");
            let rows: Vec<(String, Option<String>)> = qb
                .build_query_as()
                .fetch_all(&self.pool)
                .await
                .map_err(storage)?;
            found.extend(rows.into_iter().map(|(id, dep)| (TaskId(id), dep)));
        }
        Ok(found)
    }

    async fn incidents(&self, filter: &IncidentFilter) -> Result<Vec<Incident>, TaskError> {
        let mut qb: QueryBuilder<'static, Sqlite> = QueryBuilder::new(format!(
            "SELECT {} FROM external_task_incidents WHERE 1 = 1",
            INCIDENT_COLUMNS
        ));
        push_eq(&mut qb, "configuration", filter.configuration.as_ref().map(|id| id.as_str()));
        push_eq(&mut qb, "process_instance_id", filter.process_instance_id.as_deref());
        push_eq(&mut qb, "state", filter.state.as_ref().map(|s| s.as_str()));
        qb.push(" ORDER BY timestamp, rowid");

        let rows: Vec<IncidentRow> = qb
            .build_query_as()
            .fetch_all(&self.pool)
            .await
            .map_err(storage)?;
        rows.into_iter().map(IncidentRow::into_incident).collect()
    }

    async fn history(&self, id: &TaskId) -> Result<Vec<HistoricLogEntry>, TaskError> {
        let rows = sqlx::query_as::<_, LogRow>(&format!(
            "SELECT {} FROM external_task_log WHERE external_task_id = ? ORDER BY log_seq",
            LOG_COLUMNS
        ))
        .bind(id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;
        rows.into_iter().map(LogRow::into_entry).collect()
    }

    async fn error_details(&self, id: &TaskId) -> Result<Option<String>, TaskError> {
        let row = sqlx::query_as::<_, (Option<String>,)>(
            r#"
            SELECT l.error_details
            FROM external_tasks t
            LEFT JOIN external_task_log l ON l.id = t.error_details_id
            WHERE t.id = ?
            "#,
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?;

        match row {
            Some((details,)) => Ok(details),
            None => Err(TaskError::not_found(Some(id.as_str()))),
        }
    }
}
