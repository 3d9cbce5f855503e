//! In-memory collaborators.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::config::ParameterKeys;
use crate::ports::{
    JobHandle, JobRunner, JobSpec, JobStatus, NotificationChannel, NotificationMessage,
    ObjectEntry, ObjectStore, ParameterStore, PortError, StatementRequest, StatementState,
    Warehouse,
};
use crate::stages::unload_target;

/// Objects kept in a concurrent map keyed by full location.
#[derive(Debug, Default)]
pub struct InMemoryObjectStore {
    objects: DashMap<String, Vec<u8>>,
}

impl InMemoryObjectStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts an object directly.
    pub fn insert(&self, location: impl Into<String>, bytes: Vec<u8>) {
        self.objects.insert(location.into(), bytes);
    }

    /// Returns the number of stored objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Returns true if the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn put(&self, location: &str, bytes: Vec<u8>) -> Result<(), PortError> {
        self.objects.insert(location.to_string(), bytes);
        Ok(())
    }

    async fn get(&self, location: &str) -> Result<Vec<u8>, PortError> {
        self.objects
            .get(location)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| PortError::NotFound(location.to_string()))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectEntry>, PortError> {
        let mut entries: Vec<ObjectEntry> = self
            .objects
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| ObjectEntry {
                location: entry.key().clone(),
                size: entry.value().len() as u64,
            })
            .collect();
        entries.sort_by(|a, b| a.location.cmp(&b.location));
        Ok(entries)
    }
}

/// Parameters kept in a concurrent map.
#[derive(Debug, Default)]
pub struct InMemoryParameterStore {
    values: DashMap<String, String>,
    lookups: AtomicUsize,
}

impl InMemoryParameterStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store holding a value for every default key.
    #[must_use]
    pub fn complete() -> Self {
        let keys = ParameterKeys::default();
        let store = Self::new();
        store.set(&keys.sql, "SELECT id, cleaned_comment FROM comments WHERE day = :run_date");
        store.set(&keys.data_bucket, "data-bucket");
        store.set(&keys.workgroup, "scoring-wg");
        store.set(&keys.database, "analytics");
        store.set(&keys.unload_role, "arn:role");
        store.set(&keys.notify_topic, "arn:topic");
        store
    }

    /// Sets a parameter.
    pub fn set(&self, key: &str, value: &str) {
        self.values.insert(key.to_string(), value.to_string());
    }

    /// Removes a parameter.
    pub fn remove(&self, key: &str) {
        self.values.remove(key);
    }

    /// Returns how many lookups were made.
    #[must_use]
    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ParameterStore for InMemoryParameterStore {
    async fn get(&self, key: &str) -> Result<Option<String>, PortError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self.values.get(key).map(|v| v.value().clone()))
    }
}

#[derive(Debug, Clone)]
enum StatementScript {
    Finish {
        store: Arc<InMemoryObjectStore>,
        objects: usize,
        rows: Option<u64>,
    },
    Fail(String),
    Hang,
}

/// A warehouse whose statements follow a script.
///
/// A finishing warehouse writes its snapshot objects on submission and
/// reports `started` once before `finished`. Resubmitting a client token
/// returns the original statement id until that statement fails or is
/// cancelled.
#[derive(Debug)]
pub struct ScriptedWarehouse {
    script: StatementScript,
    failures_left: AtomicUsize,
    doomed: DashMap<String, ()>,
    executed: Mutex<Vec<StatementRequest>>,
    tokens: DashMap<String, String>,
    polls: DashMap<String, usize>,
    cancelled: Mutex<Vec<String>>,
}

impl ScriptedWarehouse {
    fn with_script(script: StatementScript) -> Self {
        Self {
            script,
            failures_left: AtomicUsize::new(0),
            doomed: DashMap::new(),
            executed: Mutex::new(Vec::new()),
            tokens: DashMap::new(),
            polls: DashMap::new(),
            cancelled: Mutex::new(Vec::new()),
        }
    }

    /// Finishes every statement, writing `objects` data objects to `store`.
    #[must_use]
    pub fn finishing(store: Arc<InMemoryObjectStore>, objects: usize, rows: Option<u64>) -> Self {
        Self::with_script(StatementScript::Finish {
            store,
            objects,
            rows,
        })
    }

    /// Fails the first `failures` statements, then behaves like
    /// [`finishing`](Self::finishing).
    #[must_use]
    pub fn failing_first(
        failures: usize,
        store: Arc<InMemoryObjectStore>,
        objects: usize,
        rows: Option<u64>,
    ) -> Self {
        let warehouse = Self::finishing(store, objects, rows);
        warehouse.failures_left.store(failures, Ordering::SeqCst);
        warehouse
    }

    /// Fails every statement with `error`.
    #[must_use]
    pub fn failing(error: &str) -> Self {
        Self::with_script(StatementScript::Fail(error.to_string()))
    }

    /// Leaves every statement running.
    #[must_use]
    pub fn hanging() -> Self {
        Self::with_script(StatementScript::Hang)
    }

    /// Returns every distinct request submitted.
    #[must_use]
    pub fn executed(&self) -> Vec<StatementRequest> {
        self.executed.lock().clone()
    }

    /// Returns the ids of cancelled statements.
    #[must_use]
    pub fn cancelled(&self) -> Vec<String> {
        self.cancelled.lock().clone()
    }

    fn release_token(&self, statement_id: &str) {
        self.tokens.retain(|_, id| id != statement_id);
    }
}

#[async_trait]
impl Warehouse for ScriptedWarehouse {
    async fn execute(&self, request: &StatementRequest) -> Result<String, PortError> {
        if let Some(id) = self.tokens.get(&request.client_token) {
            return Ok(id.value().clone());
        }
        let id = {
            let mut executed = self.executed.lock();
            executed.push(request.clone());
            format!("stmt-{}", executed.len())
        };
        self.tokens.insert(request.client_token.clone(), id.clone());

        let doomed = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if doomed {
            self.doomed.insert(id.clone(), ());
            return Ok(id);
        }

        if let StatementScript::Finish { store, objects, .. } = &self.script {
            let target = unload_target(&request.sql)
                .ok_or_else(|| PortError::Rejected("statement has no target".to_string()))?;
            for part in 0..*objects {
                store.insert(format!("{target}{part:04}_part_00.parquet"), b"PAR1".to_vec());
            }
        }
        Ok(id)
    }

    async fn describe(&self, statement_id: &str) -> Result<StatementState, PortError> {
        let polls = {
            let mut entry = self.polls.entry(statement_id.to_string()).or_insert(0);
            *entry += 1;
            *entry
        };
        let state = match &self.script {
            _ if polls > 1 && self.doomed.contains_key(statement_id) => StatementState::Failed {
                error: "transient warehouse outage".to_string(),
            },
            StatementScript::Finish { rows, .. } if polls > 1 => {
                StatementState::Finished { rows: *rows }
            }
            StatementScript::Fail(error) if polls > 1 => StatementState::Failed {
                error: error.clone(),
            },
            _ => StatementState::Started,
        };
        if state.is_unsuccessful() {
            self.release_token(statement_id);
        }
        Ok(state)
    }

    async fn cancel(&self, statement_id: &str) -> Result<(), PortError> {
        self.cancelled.lock().push(statement_id.to_string());
        self.release_token(statement_id);
        Ok(())
    }
}

#[derive(Debug, Clone)]
enum JobScript {
    Succeed { polls: usize },
    Fail { exit_code: i32, reason: String },
    Unschedulable,
    Hang,
}

#[derive(Debug, Default)]
struct JobLedger {
    submitted: Mutex<Vec<JobSpec>>,
    stopped: Mutex<Vec<String>>,
}

/// A job runner whose jobs follow a script.
#[derive(Debug)]
pub struct ScriptedJobRunner {
    script: JobScript,
    ledger: Arc<JobLedger>,
}

impl ScriptedJobRunner {
    fn with_script(script: JobScript) -> Self {
        Self {
            script,
            ledger: Arc::new(JobLedger::default()),
        }
    }

    /// Jobs run for `polls` status polls, then succeed.
    #[must_use]
    pub fn succeeding(polls: usize) -> Self {
        Self::with_script(JobScript::Succeed { polls })
    }

    /// Jobs fail with an exit code and reason.
    #[must_use]
    pub fn failing(exit_code: i32, reason: &str) -> Self {
        Self::with_script(JobScript::Fail {
            exit_code,
            reason: reason.to_string(),
        })
    }

    /// Submission fails with `ResourceExhausted`.
    #[must_use]
    pub fn unschedulable() -> Self {
        Self::with_script(JobScript::Unschedulable)
    }

    /// Jobs run until stopped.
    #[must_use]
    pub fn hanging() -> Self {
        Self::with_script(JobScript::Hang)
    }

    /// Returns every submitted job spec.
    #[must_use]
    pub fn submitted(&self) -> Vec<JobSpec> {
        self.ledger.submitted.lock().clone()
    }

    /// Returns the reasons jobs were stopped with.
    #[must_use]
    pub fn stopped(&self) -> Vec<String> {
        self.ledger.stopped.lock().clone()
    }
}

struct ScriptedJob {
    id: String,
    script: JobScript,
    polls: AtomicUsize,
    ledger: Arc<JobLedger>,
}

#[async_trait]
impl JobHandle for ScriptedJob {
    fn id(&self) -> &str {
        &self.id
    }

    async fn status(&self) -> Result<JobStatus, PortError> {
        let polls = self.polls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(match &self.script {
            JobScript::Succeed { polls: needed } if polls >= *needed => JobStatus::Succeeded,
            JobScript::Fail { exit_code, reason } => JobStatus::Failed {
                exit_code: Some(*exit_code),
                reason: reason.clone(),
            },
            _ => JobStatus::Running,
        })
    }

    async fn stop(&self, reason: &str) -> Result<(), PortError> {
        self.ledger.stopped.lock().push(reason.to_string());
        Ok(())
    }
}

#[async_trait]
impl JobRunner for ScriptedJobRunner {
    async fn submit(&self, spec: &JobSpec) -> Result<Box<dyn JobHandle>, PortError> {
        if matches!(self.script, JobScript::Unschedulable) {
            return Err(PortError::ResourceExhausted("no capacity".to_string()));
        }
        let id = {
            let mut submitted = self.ledger.submitted.lock();
            submitted.push(spec.clone());
            format!("job-{}", submitted.len())
        };
        Ok(Box::new(ScriptedJob {
            id,
            script: self.script.clone(),
            polls: AtomicUsize::new(0),
            ledger: Arc::clone(&self.ledger),
        }))
    }
}

/// A notification channel that records published messages.
#[derive(Debug, Default)]
pub struct RecordingChannel {
    fail_first: usize,
    attempts: AtomicUsize,
    published: Mutex<Vec<(String, NotificationMessage)>>,
}

impl RecordingChannel {
    /// Creates a channel that accepts every message.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a channel whose first `failures` publishes are unavailable.
    #[must_use]
    pub fn failing_first(failures: usize) -> Self {
        Self {
            fail_first: failures,
            ..Self::default()
        }
    }

    /// Returns every accepted `(topic, message)` pair.
    #[must_use]
    pub fn published(&self) -> Vec<(String, NotificationMessage)> {
        self.published.lock().clone()
    }

    /// Returns how many publishes were attempted.
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Returns published messages grouped by topic.
    #[must_use]
    pub fn by_topic(&self) -> HashMap<String, Vec<NotificationMessage>> {
        let mut grouped: HashMap<String, Vec<NotificationMessage>> = HashMap::new();
        for (topic, message) in self.published.lock().iter() {
            grouped.entry(topic.clone()).or_default().push(message.clone());
        }
        grouped
    }
}

#[async_trait]
impl NotificationChannel for RecordingChannel {
    async fn publish(
        &self,
        topic: &str,
        message: &NotificationMessage,
    ) -> Result<String, PortError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt <= self.fail_first {
            return Err(PortError::Unavailable(format!("attempt {attempt} refused")));
        }
        let mut published = self.published.lock();
        published.push((topic.to_string(), message.clone()));
        Ok(format!("msg-{}", published.len()))
    }
}
