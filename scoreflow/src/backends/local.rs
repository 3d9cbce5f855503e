//! Process and filesystem backed collaborators.
//!
//! These let the CLI run a full pipeline on one machine: `scheme://bucket/key`
//! locations map onto a root directory, the extraction and scoring steps are
//! child processes, and notifications go to the log.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::{Child, Command};
use tracing::{debug, info};

use crate::context::Location;
use crate::ports::{
    JobHandle, JobRunner, JobSpec, JobStatus, NotificationChannel, NotificationMessage,
    ObjectEntry, ObjectStore, ParameterStore, PortError, StatementRequest, StatementState,
    Warehouse,
};
use crate::stages::{unload_target, INPUT_PREFIX_VAR, OUTPUT_PREFIX_VAR};
use crate::utils::generate_uuid;

/// Prefix of environment variables that override parameters.
pub const PARAM_ENV_PREFIX: &str = "SCOREFLOW_PARAM_";

/// Object storage on the local filesystem.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    /// Creates a store rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns the root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Maps a location onto a path under the root.
    ///
    /// `s3://bucket/key` becomes `{root}/bucket/key`; a bare path is taken
    /// relative to the root. Parent components are rejected.
    pub fn path_for(&self, location: &str) -> Result<PathBuf, PortError> {
        let relative = match Location::parse(location) {
            Ok(loc) => PathBuf::from(loc.bucket).join(loc.key),
            Err(_) => PathBuf::from(location.trim_start_matches('/')),
        };
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(PortError::Rejected(format!(
                "location escapes the store root: {location}"
            )));
        }
        Ok(self.root.join(relative))
    }
}

fn io_error(location: &str, err: &std::io::Error) -> PortError {
    match err.kind() {
        std::io::ErrorKind::NotFound => PortError::NotFound(location.to_string()),
        std::io::ErrorKind::PermissionDenied => {
            PortError::PermissionDenied(format!("{location}: {err}"))
        }
        _ => PortError::Unavailable(format!("{location}: {err}")),
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put(&self, location: &str, bytes: Vec<u8>) -> Result<(), PortError> {
        let path = self.path_for(location)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(location, &e))?;
        }
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| io_error(location, &e))
    }

    async fn get(&self, location: &str) -> Result<Vec<u8>, PortError> {
        let path = self.path_for(location)?;
        tokio::fs::read(&path)
            .await
            .map_err(|e| io_error(location, &e))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectEntry>, PortError> {
        let base = match prefix.rfind('/') {
            Some(idx) => &prefix[..=idx],
            None => "",
        };
        let dir = self.path_for(base)?;
        let mut entries = Vec::new();
        let mut pending = vec![dir.clone()];

        while let Some(current) = pending.pop() {
            let mut read_dir = match tokio::fs::read_dir(&current).await {
                Ok(read_dir) => read_dir,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(io_error(prefix, &e)),
            };
            while let Some(entry) = read_dir
                .next_entry()
                .await
                .map_err(|e| io_error(prefix, &e))?
            {
                let path = entry.path();
                let metadata = entry.metadata().await.map_err(|e| io_error(prefix, &e))?;
                if metadata.is_dir() {
                    pending.push(path);
                    continue;
                }
                let Ok(relative) = path.strip_prefix(&dir) else {
                    continue;
                };
                let location = format!("{base}{}", relative.to_string_lossy().replace('\\', "/"));
                if location.starts_with(prefix) {
                    entries.push(ObjectEntry {
                        location,
                        size: metadata.len(),
                    });
                }
            }
        }

        entries.sort_by(|a, b| a.location.cmp(&b.location));
        Ok(entries)
    }
}

struct StatementSlot {
    token: String,
    child: Mutex<Option<Child>>,
    state: Mutex<StatementState>,
}

/// A warehouse that runs a local command per statement.
///
/// The command sees the statement in `SCOREFLOW_STATEMENT`, the target
/// location in `SCOREFLOW_TARGET` and the matching directory in
/// `SCOREFLOW_TARGET_DIR`. A zero exit status finishes the statement.
/// Client tokens deduplicate running and finished statements only; a
/// failed or aborted statement frees its token for the next attempt.
pub struct ProcessWarehouse {
    command: Vec<String>,
    store: FsObjectStore,
    statements: DashMap<String, Arc<StatementSlot>>,
    tokens: DashMap<String, String>,
}

impl ProcessWarehouse {
    /// Creates a warehouse running `command`.
    #[must_use]
    pub fn new(command: Vec<String>, store: FsObjectStore) -> Self {
        Self {
            command,
            store,
            statements: DashMap::new(),
            tokens: DashMap::new(),
        }
    }

    fn slot(&self, statement_id: &str) -> Result<Arc<StatementSlot>, PortError> {
        self.statements
            .get(statement_id)
            .map(|slot| Arc::clone(slot.value()))
            .ok_or_else(|| PortError::NotFound(format!("statement {statement_id}")))
    }

    fn release_token(&self, statement_id: &str, slot: &StatementSlot) {
        if self
            .tokens
            .remove_if(&slot.token, |_, id| id == statement_id)
            .is_some()
        {
            debug!(statement_id = %statement_id, "Released client token");
        }
    }
}

#[async_trait]
impl Warehouse for ProcessWarehouse {
    async fn execute(&self, request: &StatementRequest) -> Result<String, PortError> {
        if let Some(id) = self.tokens.get(&request.client_token) {
            return Ok(id.value().clone());
        }
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| PortError::Rejected("no export command configured".to_string()))?;
        let target = unload_target(&request.sql)
            .ok_or_else(|| PortError::Rejected("statement has no unload target".to_string()))?;
        let target_dir = self.store.path_for(target)?;
        if let Some(parent) = target_dir.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(target, &e))?;
        }

        let child = Command::new(program)
            .args(args)
            .env("SCOREFLOW_STATEMENT", &request.sql)
            .env("SCOREFLOW_TARGET", target)
            .env("SCOREFLOW_TARGET_DIR", &target_dir)
            .env("SCOREFLOW_WORKGROUP", &request.workgroup)
            .env("SCOREFLOW_DATABASE", &request.database)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| PortError::Unavailable(format!("failed to start {program}: {e}")))?;

        let id = generate_uuid().to_string();
        self.statements.insert(
            id.clone(),
            Arc::new(StatementSlot {
                token: request.client_token.clone(),
                child: Mutex::new(Some(child)),
                state: Mutex::new(StatementState::Started),
            }),
        );
        self.tokens.insert(request.client_token.clone(), id.clone());
        debug!(statement_id = %id, program = %program, "Started export command");
        Ok(id)
    }

    async fn describe(&self, statement_id: &str) -> Result<StatementState, PortError> {
        let slot = self.slot(statement_id)?;
        let mut state = slot.state.lock();
        if state.is_terminal() {
            return Ok(state.clone());
        }
        let mut child = slot.child.lock();
        let Some(process) = child.as_mut() else {
            return Ok(state.clone());
        };
        match process.try_wait() {
            Ok(Some(status)) if status.success() => *state = StatementState::Finished { rows: None },
            Ok(Some(status)) => {
                *state = StatementState::Failed {
                    error: format!("export command exited with {status}"),
                };
            }
            Ok(None) => {}
            Err(e) => return Err(PortError::Unavailable(e.to_string())),
        }
        if state.is_terminal() {
            *child = None;
        }
        if state.is_unsuccessful() {
            self.release_token(statement_id, &slot);
        }
        Ok(state.clone())
    }

    async fn cancel(&self, statement_id: &str) -> Result<(), PortError> {
        let slot = self.slot(statement_id)?;
        if let Some(process) = slot.child.lock().as_mut() {
            process
                .start_kill()
                .map_err(|e| PortError::Unavailable(e.to_string()))?;
        }
        let mut state = slot.state.lock();
        if !state.is_terminal() {
            *state = StatementState::Aborted;
        }
        if state.is_unsuccessful() {
            self.release_token(statement_id, &slot);
        }
        Ok(())
    }
}

/// Runs jobs as local child processes.
///
/// The job command must be set; the image is only logged. Besides the job
/// environment the process sees `INPUT_DIR` and `OUTPUT_DIR`, the local
/// directories behind the two prefixes.
#[derive(Debug, Clone)]
pub struct ProcessJobRunner {
    store: FsObjectStore,
}

impl ProcessJobRunner {
    /// Creates a runner resolving locations through `store`.
    #[must_use]
    pub const fn new(store: FsObjectStore) -> Self {
        Self { store }
    }

    fn local_dirs(&self, spec: &JobSpec) -> Result<BTreeMap<String, PathBuf>, PortError> {
        let mut dirs = BTreeMap::new();
        for (var, dir_var) in [(INPUT_PREFIX_VAR, "INPUT_DIR"), (OUTPUT_PREFIX_VAR, "OUTPUT_DIR")] {
            if let Some(location) = spec.environment.get(var) {
                dirs.insert(dir_var.to_string(), self.store.path_for(location)?);
            }
        }
        Ok(dirs)
    }
}

struct ProcessJob {
    id: String,
    child: Mutex<Child>,
    stop_reason: Mutex<Option<String>>,
}

#[async_trait]
impl JobHandle for ProcessJob {
    fn id(&self) -> &str {
        &self.id
    }

    async fn status(&self) -> Result<JobStatus, PortError> {
        let waited = self.child.lock().try_wait();
        match waited {
            Ok(Some(status)) if status.success() => Ok(JobStatus::Succeeded),
            Ok(Some(status)) => {
                let reason = self
                    .stop_reason
                    .lock()
                    .clone()
                    .map_or_else(|| format!("exited with {status}"), |r| format!("stopped: {r}"));
                Ok(JobStatus::Failed {
                    exit_code: status.code(),
                    reason,
                })
            }
            Ok(None) => Ok(JobStatus::Running),
            Err(e) => Err(PortError::Unavailable(e.to_string())),
        }
    }

    async fn stop(&self, reason: &str) -> Result<(), PortError> {
        *self.stop_reason.lock() = Some(reason.to_string());
        self.child
            .lock()
            .start_kill()
            .map_err(|e| PortError::Unavailable(e.to_string()))
    }
}

#[async_trait]
impl JobRunner for ProcessJobRunner {
    async fn submit(&self, spec: &JobSpec) -> Result<Box<dyn JobHandle>, PortError> {
        let (program, args) = spec
            .command
            .split_first()
            .ok_or_else(|| PortError::Rejected("no compute command configured".to_string()))?;
        let dirs = self.local_dirs(spec)?;
        for (name, dir) in &dirs {
            if name == "OUTPUT_DIR" {
                tokio::fs::create_dir_all(dir)
                    .await
                    .map_err(|e| PortError::ResourceExhausted(e.to_string()))?;
            }
        }

        let child = Command::new(program)
            .args(args)
            .envs(&spec.environment)
            .envs(&dirs)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| PortError::ResourceExhausted(format!("failed to start {program}: {e}")))?;

        let id = format!("local-{}", generate_uuid());
        info!(job_id = %id, image = %spec.image, program = %program, "Started compute job");
        Ok(Box::new(ProcessJob {
            id,
            child: Mutex::new(child),
            stop_reason: Mutex::new(None),
        }))
    }
}

/// Publishes notifications to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogChannel;

#[async_trait]
impl NotificationChannel for LogChannel {
    async fn publish(
        &self,
        topic: &str,
        message: &NotificationMessage,
    ) -> Result<String, PortError> {
        let id = generate_uuid().to_string();
        info!(
            topic = %topic,
            message_id = %id,
            recipient = ?message.recipient,
            subject = %message.subject,
            body = %message.body,
            "Notification"
        );
        Ok(id)
    }
}

/// Static parameters overlaid by environment variables.
///
/// `/trust_scoring/sql` is overridden by `SCOREFLOW_PARAM_TRUST_SCORING_SQL`.
#[derive(Debug, Clone, Default)]
pub struct LayeredParameterStore {
    values: BTreeMap<String, String>,
}

impl LayeredParameterStore {
    /// Creates a store over static values.
    #[must_use]
    pub const fn new(values: BTreeMap<String, String>) -> Self {
        Self { values }
    }

    /// Returns the environment variable that overrides `key`.
    #[must_use]
    pub fn env_var_name(key: &str) -> String {
        let normalised: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        format!("{PARAM_ENV_PREFIX}{}", normalised.trim_matches('_'))
    }
}

#[async_trait]
impl ParameterStore for LayeredParameterStore {
    async fn get(&self, key: &str) -> Result<Option<String>, PortError> {
        if let Ok(value) = std::env::var(Self::env_var_name(key)) {
            return Ok(Some(value));
        }
        Ok(self.values.get(key).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn store() -> (tempfile::TempDir, FsObjectStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());
        (dir, store)
    }

    #[test]
    fn test_path_for_maps_bucket_and_key() {
        let (dir, store) = store();
        assert_eq!(
            store.path_for("s3://bucket/raw/a.parquet").unwrap(),
            dir.path().join("bucket").join("raw").join("a.parquet")
        );
        assert_eq!(
            store.path_for("/scored/run_id=R1/").unwrap(),
            dir.path().join("scored").join("run_id=R1")
        );
    }

    #[test]
    fn test_path_for_rejects_parent_components() {
        let (_dir, store) = store();
        assert!(matches!(
            store.path_for("s3://bucket/../../etc/passwd"),
            Err(PortError::Rejected(_))
        ));
    }

    #[tokio::test]
    async fn test_fs_store_put_get_list() {
        let (_dir, store) = store();
        store
            .put("s3://b/raw/run_id=R1/batch_0000_part_00.parquet", b"abc".to_vec())
            .await
            .unwrap();
        store
            .put("s3://b/raw/run_id=R1/nested/batch_0001.parquet", b"d".to_vec())
            .await
            .unwrap();
        store.put("s3://b/raw/run_id=R2/x.csv", vec![]).await.unwrap();

        assert_eq!(
            store
                .get("s3://b/raw/run_id=R1/batch_0000_part_00.parquet")
                .await
                .unwrap(),
            b"abc"
        );

        let listed = store.list("s3://b/raw/run_id=R1/").await.unwrap();
        let locations: Vec<_> = listed.iter().map(|e| e.location.as_str()).collect();
        assert_eq!(
            locations,
            vec![
                "s3://b/raw/run_id=R1/batch_0000_part_00.parquet",
                "s3://b/raw/run_id=R1/nested/batch_0001.parquet",
            ]
        );

        let partial = store.list("s3://b/raw/run_id=R1/batch_").await.unwrap();
        assert_eq!(partial.len(), 1);
        assert_eq!(partial[0].size, 3);
    }

    #[tokio::test]
    async fn test_fs_store_missing() {
        let (_dir, store) = store();
        assert!(store.list("s3://b/none/").await.unwrap().is_empty());
        assert!(matches!(
            store.get("s3://b/none/x").await,
            Err(PortError::NotFound(_))
        ));
    }

    #[test]
    fn test_env_var_name() {
        assert_eq!(
            LayeredParameterStore::env_var_name("/trust_scoring/redshift/workgroup"),
            "SCOREFLOW_PARAM_TRUST_SCORING_REDSHIFT_WORKGROUP"
        );
    }

    #[tokio::test]
    async fn test_layered_store_env_overrides_static() {
        let mut values = BTreeMap::new();
        values.insert("/scoreflow_test/layered".to_string(), "static".to_string());
        values.insert("/scoreflow_test/plain".to_string(), "plain".to_string());
        let store = LayeredParameterStore::new(values);

        std::env::set_var(
            LayeredParameterStore::env_var_name("/scoreflow_test/layered"),
            "from-env",
        );

        assert_eq!(
            store.get("/scoreflow_test/layered").await.unwrap().as_deref(),
            Some("from-env")
        );
        assert_eq!(
            store.get("/scoreflow_test/plain").await.unwrap().as_deref(),
            Some("plain")
        );
        assert_eq!(store.get("/scoreflow_test/absent").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_log_channel_returns_message_id() {
        let message = NotificationMessage {
            subject: "Scoring complete: R1".to_string(),
            body: "Status: succeeded".to_string(),
            recipient: None,
        };
        let id = LogChannel.publish("local", &message).await.unwrap();
        assert!(!id.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_job_runner_success_and_failure() {
        let (_dir, store) = store();
        let runner = ProcessJobRunner::new(store);

        let mut spec = JobSpec {
            image: "local".to_string(),
            command: vec!["sh".to_string(), "-c".to_string(), "test -d \"$OUTPUT_DIR\"".to_string()],
            environment: BTreeMap::new(),
        };
        spec.environment
            .insert(OUTPUT_PREFIX_VAR.to_string(), "/scored/run_id=R1/".to_string());

        let job = runner.submit(&spec).await.unwrap();
        let status = wait_terminal(job.as_ref()).await;
        assert_eq!(status, JobStatus::Succeeded);

        spec.command = vec!["sh".to_string(), "-c".to_string(), "exit 3".to_string()];
        let job = runner.submit(&spec).await.unwrap();
        let status = wait_terminal(job.as_ref()).await;
        assert!(matches!(status, JobStatus::Failed { exit_code: Some(3), .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_job_runner_stop() {
        let (_dir, store) = store();
        let runner = ProcessJobRunner::new(store);
        let spec = JobSpec {
            image: "local".to_string(),
            command: vec!["sleep".to_string(), "30".to_string()],
            environment: BTreeMap::new(),
        };

        let job = runner.submit(&spec).await.unwrap();
        job.stop("deadline").await.unwrap();
        let status = wait_terminal(job.as_ref()).await;

        match status {
            JobStatus::Failed { reason, .. } => assert_eq!(reason, "stopped: deadline"),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_process_job_runner_requires_command() {
        let (_dir, store) = store();
        let runner = ProcessJobRunner::new(store);
        assert!(runner.submit(&JobSpec::default()).await.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_warehouse_runs_command() {
        let (dir, store) = store();
        let warehouse = ProcessWarehouse::new(
            vec![
                "sh".to_string(),
                "-c".to_string(),
                "mkdir -p \"$(dirname \"$SCOREFLOW_TARGET_DIR\")\" && echo x > \"${SCOREFLOW_TARGET_DIR}0000.csv\"".to_string(),
            ],
            store.clone(),
        );
        let request = StatementRequest {
            workgroup: "wg".to_string(),
            database: "db".to_string(),
            sql: "UNLOAD ($$SELECT 1$$) TO 's3://b/raw/run_id=R1/batch_' IAM_ROLE 'r' FORMAT AS PARQUET PARALLEL ON;".to_string(),
            client_token: "tok".to_string(),
        };

        let id = warehouse.execute(&request).await.unwrap();
        assert_eq!(warehouse.execute(&request).await.unwrap(), id);

        let mut state = warehouse.describe(&id).await.unwrap();
        for _ in 0..100 {
            if state.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
            state = warehouse.describe(&id).await.unwrap();
        }
        assert_eq!(state, StatementState::Finished { rows: None });
        assert!(dir.path().join("b/raw/run_id=R1/batch_0000.csv").exists());
        assert_eq!(store.list("s3://b/raw/run_id=R1/").await.unwrap().len(), 1);
    }

    #[cfg(unix)]
    fn unload_request(token: &str) -> StatementRequest {
        StatementRequest {
            workgroup: "wg".to_string(),
            database: "db".to_string(),
            sql: "UNLOAD ($$SELECT 1$$) TO 's3://b/raw/run_id=R1/batch_' IAM_ROLE 'r' FORMAT AS PARQUET PARALLEL ON;".to_string(),
            client_token: token.to_string(),
        }
    }

    #[cfg(unix)]
    async fn wait_statement(warehouse: &ProcessWarehouse, id: &str) -> StatementState {
        for _ in 0..200 {
            let state = warehouse.describe(id).await.unwrap();
            if state.is_terminal() {
                return state;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("statement did not terminate");
    }

    /// A command that fails on its first run and writes one object afterwards.
    #[cfg(unix)]
    fn fails_once(marker: &Path) -> Vec<String> {
        vec![
            "sh".to_string(),
            "-c".to_string(),
            format!(
                "if [ ! -e '{m}' ]; then touch '{m}'; exit 1; fi; echo x > \"${{SCOREFLOW_TARGET_DIR}}0000_part_00.parquet\"",
                m = marker.display()
            ),
        ]
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_warehouse_failed_statement_releases_token() {
        let (dir, store) = store();
        let warehouse = ProcessWarehouse::new(fails_once(&dir.path().join("ran")), store);
        let request = unload_request("tok");

        let first = warehouse.execute(&request).await.unwrap();
        assert!(wait_statement(&warehouse, &first).await.is_unsuccessful());

        let second = warehouse.execute(&request).await.unwrap();
        assert_ne!(first, second);
        assert_eq!(
            wait_statement(&warehouse, &second).await,
            StatementState::Finished { rows: None }
        );
        assert_eq!(warehouse.execute(&request).await.unwrap(), second);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_warehouse_cancel_releases_token() {
        let (_dir, store) = store();
        let warehouse =
            ProcessWarehouse::new(vec!["sleep".to_string(), "30".to_string()], store);
        let request = unload_request("tok");

        let first = warehouse.execute(&request).await.unwrap();
        warehouse.cancel(&first).await.unwrap();
        assert_eq!(warehouse.describe(&first).await.unwrap(), StatementState::Aborted);

        let second = warehouse.execute(&request).await.unwrap();
        assert_ne!(first, second);
        warehouse.cancel(&second).await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_retrying_export_reruns_failed_statement() {
        use crate::cancellation::CancellationToken;
        use crate::config::PipelineConfig;
        use crate::context::{RunContext, RunParameters};
        use crate::interceptors::Retrying;
        use crate::pipeline::{JitterStrategy, RetryConfig};
        use crate::stages::{ExportStage, WarehouseExportStage};
        use crate::testing::{fixture_run_date, InMemoryParameterStore};

        let (dir, store) = store();
        let marker = dir.path().join("ran");
        let warehouse = Arc::new(ProcessWarehouse::new(fails_once(&marker), store.clone()));
        let mut config = PipelineConfig::default();
        config.export.poll_initial_seconds = 0.02;
        config.export.poll_max_seconds = 0.05;
        let export = Retrying::new(
            WarehouseExportStage::new(
                warehouse,
                Arc::new(store),
                Arc::new(InMemoryParameterStore::complete()),
                &config,
            ),
            RetryConfig::new()
                .with_max_attempts(3)
                .with_base_delay_ms(10)
                .with_jitter(JitterStrategy::None),
        );
        let ctx = RunContext::new(
            RunParameters::new()
                .with_run_id("R1")
                .with_run_date(fixture_run_date()),
        );

        let result = export.run(&ctx, &CancellationToken::new()).await.unwrap();

        assert!(marker.exists());
        assert_eq!(result.object_count, 1);
        assert!(!result.reused_snapshot);
    }

    #[tokio::test]
    async fn test_process_warehouse_unknown_statement() {
        let (_dir, store) = store();
        let warehouse = ProcessWarehouse::new(Vec::new(), store);
        assert!(matches!(
            warehouse.describe("nope").await,
            Err(PortError::NotFound(_))
        ));
    }

    async fn wait_terminal(job: &dyn JobHandle) -> JobStatus {
        for _ in 0..200 {
            let status = job.status().await.unwrap();
            if status.is_terminal() {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("job did not terminate");
    }
}
