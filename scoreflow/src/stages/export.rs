//! Warehouse-backed snapshot export.

use super::{elapsed_ms, ExportResult, ExportStage};
use crate::cancellation::CancellationToken;
use crate::config::{EmptyResultPolicy, ExportConfig, ParameterKeys, PipelineConfig};
use crate::context::{is_data_object, snapshot_prefix, RunContext, SNAPSHOT_OBJECT_STEM};
use crate::errors::{ErrorKind, StageError};
use crate::ports::{
    require_parameter, ObjectStore, ParameterStore, PortError, RequiredParameterError,
    StatementRequest, StatementState, Warehouse,
};
use crate::utils::{date_in, generate_run_id, now_utc, statement_token, Timestamp};
use async_trait::async_trait;
use chrono::NaiveDate;
use chrono_tz::Tz;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Renders the extraction statement that writes a snapshot to `target`.
///
/// Every `:run_date` placeholder in the query becomes a `DATE` literal.
#[must_use]
pub fn render_unload(sql: &str, run_date: NaiveDate, target: &str, role: &str) -> String {
    let body = sql.replace(":run_date", &format!("DATE '{run_date}'"));
    format!("UNLOAD ($${body}$$) TO '{target}' IAM_ROLE '{role}' FORMAT AS PARQUET PARALLEL ON;")
}

/// Extracts the target prefix from a rendered statement.
#[must_use]
pub fn unload_target(statement: &str) -> Option<&str> {
    let (_, rest) = statement.rsplit_once("$$) TO '")?;
    rest.split_once('\'').map(|(target, _)| target)
}

/// Exports a snapshot by submitting an `UNLOAD` to the warehouse.
///
/// Re-running with the same run id and date reuses an existing snapshot
/// instead of extracting again.
pub struct WarehouseExportStage {
    warehouse: Arc<dyn Warehouse>,
    store: Arc<dyn ObjectStore>,
    parameters: Arc<dyn ParameterStore>,
    keys: ParameterKeys,
    raw_namespace: String,
    timezone: Tz,
    config: ExportConfig,
}

enum Interrupt {
    Timeout,
    Cancelled(String),
}

enum Submission {
    Reused(ExportResult),
    Started(Started),
}

struct Started {
    run_id: String,
    run_date: NaiveDate,
    prefix: String,
    statement_id: String,
}

struct Resolved {
    sql: String,
    bucket: String,
    workgroup: String,
    database: String,
    role: String,
}

impl WarehouseExportStage {
    /// Creates an export stage from the pipeline configuration.
    #[must_use]
    pub fn new(
        warehouse: Arc<dyn Warehouse>,
        store: Arc<dyn ObjectStore>,
        parameters: Arc<dyn ParameterStore>,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            warehouse,
            store,
            parameters,
            keys: config.parameters.clone(),
            raw_namespace: config.namespaces.raw.clone(),
            timezone: config.run_date_timezone,
            config: config.export.clone(),
        }
    }

    async fn require(&self, key: &str) -> Result<String, StageError> {
        require_parameter(self.parameters.as_ref(), key)
            .await
            .map_err(|e| match e {
                RequiredParameterError::Missing(key) => StageError::configuration_missing(&key),
                other @ RequiredParameterError::Lookup { .. } => {
                    StageError::new(ErrorKind::ExportUnavailable, other.to_string())
                }
            })
    }

    async fn resolve(&self) -> Result<Resolved, StageError> {
        Ok(Resolved {
            sql: self.require(&self.keys.sql).await?,
            bucket: self.require(&self.keys.data_bucket).await?,
            workgroup: self.require(&self.keys.workgroup).await?,
            database: self.require(&self.keys.database).await?,
            role: self.require(&self.keys.unload_role).await?,
        })
    }

    async fn count_data_objects(&self, prefix: &str) -> Result<usize, StageError> {
        let entries = self.store.list(prefix).await.map_err(unavailable)?;
        Ok(entries
            .iter()
            .filter(|e| is_data_object(&e.location, &self.config.data_extensions))
            .count())
    }

    async fn wait_for_statement(&self, statement_id: &str) -> Result<Option<u64>, StageError> {
        let mut delay = std::time::Duration::from_secs_f64(self.config.poll_initial_seconds);
        loop {
            let state = self
                .warehouse
                .describe(statement_id)
                .await
                .map_err(unavailable)?;
            debug!(statement_id = %statement_id, state = ?state, "Polled export statement");

            match state {
                StatementState::Finished { rows } => return Ok(rows),
                StatementState::Failed { error } => {
                    return Err(StageError::new(
                        ErrorKind::ExportUnavailable,
                        format!("statement {statement_id} failed: {error}"),
                    ))
                }
                StatementState::Aborted => {
                    return Err(StageError::new(
                        ErrorKind::ExportUnavailable,
                        format!("statement {statement_id} was aborted"),
                    ))
                }
                StatementState::Submitted | StatementState::Started => {
                    tokio::time::sleep(delay).await;
                    delay = self.config.next_poll_delay(delay);
                }
            }
        }
    }

    fn default_run_date(&self, now: Timestamp) -> NaiveDate {
        date_in(now, self.timezone)
    }

    /// Resolves the snapshot and either reuses it or submits the statement.
    async fn submit(&self, ctx: &RunContext, start: Instant) -> Result<Submission, StageError> {
        let resolved = self.resolve().await?;

        let run_id = ctx.params().run_id.clone().unwrap_or_else(generate_run_id);
        let run_date = ctx
            .params()
            .run_date
            .unwrap_or_else(|| self.default_run_date(now_utc()));
        let prefix = snapshot_prefix(&resolved.bucket, &self.raw_namespace, run_date, &run_id)
            .map_err(|e| StageError::new(ErrorKind::ExportUnavailable, e.to_string()))?;

        let existing = self.count_data_objects(&prefix).await?;
        if existing > 0 {
            info!(run_id = %run_id, prefix = %prefix, objects = existing, "Reusing existing snapshot");
            return Ok(Submission::Reused(
                ExportResult::new(run_id, run_date, prefix)
                    .with_object_count(existing)
                    .reused()
                    .with_duration_ms(elapsed_ms(start)),
            ));
        }

        let target = format!("{prefix}{SNAPSHOT_OBJECT_STEM}");
        let statement = render_unload(&resolved.sql, run_date, &target, &resolved.role);
        let request = StatementRequest {
            workgroup: resolved.workgroup,
            database: resolved.database,
            client_token: statement_token(&[&run_id, &statement]),
            sql: statement,
        };

        let statement_id = self.warehouse.execute(&request).await.map_err(unavailable)?;
        info!(run_id = %run_id, statement_id = %statement_id, "Submitted export statement");
        Ok(Submission::Started(Started {
            run_id,
            run_date,
            prefix,
            statement_id,
        }))
    }

    /// Waits for the statement and counts what it wrote.
    async fn collect(&self, started: &Started) -> Result<(Option<u64>, usize), StageError> {
        let rows = self.wait_for_statement(&started.statement_id).await?;
        let objects = self.count_data_objects(&started.prefix).await?;
        Ok((rows, objects))
    }

    fn timeout_error(&self, what: &str) -> StageError {
        StageError::new(
            ErrorKind::ExportTimeout,
            format!("{what} did not finish within {}s", self.config.timeout_seconds),
        )
    }

    async fn cancel_statement(&self, statement_id: &str) {
        if let Err(e) = self.warehouse.cancel(statement_id).await {
            warn!(statement_id = %statement_id, error = %e, "Failed to cancel export statement");
        }
    }
}

fn unavailable(err: PortError) -> StageError {
    StageError::new(ErrorKind::ExportUnavailable, err.to_string())
}

fn cancelled(cancel: &CancellationToken) -> StageError {
    StageError::deadline(format!(
        "export cancelled before submission: {}",
        cancel.reason().unwrap_or_default()
    ))
}

#[async_trait]
impl ExportStage for WarehouseExportStage {
    async fn run(
        &self,
        ctx: &RunContext,
        cancel: &CancellationToken,
    ) -> Result<ExportResult, StageError> {
        let start = Instant::now();
        let stage_deadline = start + self.config.timeout();

        let submitted = tokio::select! {
            result = self.submit(ctx, start) => result?,
            () = tokio::time::sleep_until(stage_deadline) => {
                return Err(self.timeout_error("export submission"));
            }
            () = cancel.cancelled() => {
                return Err(cancelled(cancel));
            }
        };
        let started = match submitted {
            Submission::Reused(result) => return Ok(result),
            Submission::Started(started) => started,
        };
        let statement_id = started.statement_id.as_str();

        let collected = tokio::select! {
            result = self.collect(&started) => Ok(result),
            () = tokio::time::sleep_until(stage_deadline) => Err(Interrupt::Timeout),
            () = cancel.cancelled() => Err(Interrupt::Cancelled(cancel.reason().unwrap_or_default())),
        };

        let (rows, objects) = match collected {
            Ok(result) => result?,
            Err(Interrupt::Timeout) => {
                self.cancel_statement(statement_id).await;
                return Err(self.timeout_error(&format!("statement {statement_id}")));
            }
            Err(Interrupt::Cancelled(reason)) => {
                self.cancel_statement(statement_id).await;
                return Err(StageError::deadline(format!(
                    "export cancelled: {reason}"
                )));
            }
        };

        let Started {
            run_id,
            run_date,
            prefix,
            ..
        } = started;
        if (objects == 0 || rows == Some(0)) && self.config.empty_result == EmptyResultPolicy::Fail
        {
            return Err(StageError::new(
                ErrorKind::ExportEmptyResult,
                format!("no rows exported under {prefix}"),
            ));
        }

        let mut result = ExportResult::new(run_id, run_date, prefix)
            .with_object_count(objects)
            .with_duration_ms(elapsed_ms(start));
        if let Some(rows) = rows {
            result = result.with_row_count(rows);
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RunParameters;
    use crate::testing::{InMemoryObjectStore, InMemoryParameterStore, ScriptedWarehouse};
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, 1).unwrap()
    }

    fn stage(
        warehouse: Arc<ScriptedWarehouse>,
        store: Arc<InMemoryObjectStore>,
        config: &PipelineConfig,
    ) -> WarehouseExportStage {
        WarehouseExportStage::new(
            warehouse,
            store,
            Arc::new(InMemoryParameterStore::complete()),
            config,
        )
    }

    fn ctx(run_id: &str) -> RunContext {
        RunContext::new(RunParameters::new().with_run_id(run_id).with_run_date(date()))
    }

    /// Accepts nothing: every submission hangs.
    struct StuckWarehouse;

    #[async_trait]
    impl Warehouse for StuckWarehouse {
        async fn execute(&self, _request: &StatementRequest) -> Result<String, PortError> {
            std::future::pending().await
        }

        async fn describe(&self, statement_id: &str) -> Result<StatementState, PortError> {
            Err(PortError::NotFound(statement_id.to_string()))
        }

        async fn cancel(&self, statement_id: &str) -> Result<(), PortError> {
            Err(PortError::NotFound(statement_id.to_string()))
        }
    }

    fn stuck_stage(config: &PipelineConfig) -> WarehouseExportStage {
        WarehouseExportStage::new(
            Arc::new(StuckWarehouse),
            Arc::new(InMemoryObjectStore::new()),
            Arc::new(InMemoryParameterStore::complete()),
            config,
        )
    }

    #[test]
    fn test_render_unload_substitutes_run_date() {
        let sql = "SELECT * FROM comments WHERE day = :run_date";
        let rendered = render_unload(sql, date(), "s3://b/raw/batch_", "arn:role");
        assert_eq!(
            rendered,
            "UNLOAD ($$SELECT * FROM comments WHERE day = DATE '2024-06-01'$$) TO 's3://b/raw/batch_' IAM_ROLE 'arn:role' FORMAT AS PARQUET PARALLEL ON;"
        );
        assert_eq!(unload_target(&rendered), Some("s3://b/raw/batch_"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_export_writes_snapshot_and_reports_location() {
        let store = Arc::new(InMemoryObjectStore::new());
        let warehouse = Arc::new(ScriptedWarehouse::finishing(store.clone(), 2, Some(10)));
        let export = stage(warehouse.clone(), store, &PipelineConfig::default());

        let result = export.run(&ctx("R1"), &CancellationToken::new()).await.unwrap();

        assert_eq!(
            result.input_location,
            "s3://data-bucket/trust_scoring/raw/run_date=2024-06-01/run_id=R1/"
        );
        assert_eq!(result.row_count, Some(10));
        assert_eq!(result.object_count, 2);
        assert!(!result.reused_snapshot);
        assert_eq!(warehouse.executed().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_export_reuses_existing_snapshot() {
        let store = Arc::new(InMemoryObjectStore::new());
        store.insert(
            "s3://data-bucket/trust_scoring/raw/run_date=2024-06-01/run_id=R1/batch_0000_part_00.parquet",
            b"x".to_vec(),
        );
        let warehouse = Arc::new(ScriptedWarehouse::finishing(store.clone(), 1, Some(1)));
        let export = stage(warehouse.clone(), store, &PipelineConfig::default());

        let result = export.run(&ctx("R1"), &CancellationToken::new()).await.unwrap();

        assert!(result.reused_snapshot);
        assert!(warehouse.executed().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_export_client_token_is_deterministic() {
        let first = Arc::new(InMemoryObjectStore::new());
        let second = Arc::new(InMemoryObjectStore::new());
        let wh1 = Arc::new(ScriptedWarehouse::finishing(first.clone(), 1, None));
        let wh2 = Arc::new(ScriptedWarehouse::finishing(second.clone(), 1, None));
        let config = PipelineConfig::default();

        stage(wh1.clone(), first, &config)
            .run(&ctx("R1"), &CancellationToken::new())
            .await
            .unwrap();
        stage(wh2.clone(), second, &config)
            .run(&ctx("R1"), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(wh1.executed()[0].client_token, wh2.executed()[0].client_token);
    }

    #[tokio::test(start_paused = true)]
    async fn test_export_empty_result_fails_by_default() {
        let store = Arc::new(InMemoryObjectStore::new());
        let warehouse = Arc::new(ScriptedWarehouse::finishing(store.clone(), 0, Some(0)));
        let export = stage(warehouse, store, &PipelineConfig::default());

        let err = export.run(&ctx("R1"), &CancellationToken::new()).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::ExportEmptyResult);
    }

    #[tokio::test(start_paused = true)]
    async fn test_export_empty_result_allowed_by_policy() {
        let store = Arc::new(InMemoryObjectStore::new());
        let warehouse = Arc::new(ScriptedWarehouse::finishing(store.clone(), 0, Some(0)));
        let mut config = PipelineConfig::default();
        config.export.empty_result = EmptyResultPolicy::Allow;
        let export = stage(warehouse, store, &config);

        let result = export.run(&ctx("R1"), &CancellationToken::new()).await.unwrap();
        assert_eq!(result.object_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_export_failed_statement_is_unavailable() {
        let store = Arc::new(InMemoryObjectStore::new());
        let warehouse = Arc::new(ScriptedWarehouse::failing("permission denied for relation"));
        let export = stage(warehouse, store, &PipelineConfig::default());

        let err = export.run(&ctx("R1"), &CancellationToken::new()).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::ExportUnavailable);
        assert!(err.message.contains("permission denied"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_export_missing_parameter() {
        let store = Arc::new(InMemoryObjectStore::new());
        let warehouse = Arc::new(ScriptedWarehouse::finishing(store.clone(), 1, None));
        let params = InMemoryParameterStore::complete();
        params.remove("/trust_scoring/sql");
        let export = WarehouseExportStage::new(
            warehouse.clone(),
            store,
            Arc::new(params),
            &PipelineConfig::default(),
        );

        let err = export.run(&ctx("R1"), &CancellationToken::new()).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::ConfigurationMissing);
        assert!(warehouse.executed().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_export_timeout_cancels_statement() {
        let store = Arc::new(InMemoryObjectStore::new());
        let warehouse = Arc::new(ScriptedWarehouse::hanging());
        let mut config = PipelineConfig::default();
        config.export.timeout_seconds = 60.0;
        let export = stage(warehouse.clone(), store, &config);

        let err = export.run(&ctx("R1"), &CancellationToken::new()).await.unwrap_err();

        assert_eq!(err.kind, ErrorKind::ExportTimeout);
        assert_eq!(warehouse.cancelled().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_export_stuck_submission_times_out() {
        let mut config = PipelineConfig::default();
        config.export.timeout_seconds = 60.0;
        let export = stuck_stage(&config);
        let start = Instant::now();

        let err = tokio::time::timeout(
            Duration::from_secs(3600),
            export.run(&ctx("R1"), &CancellationToken::new()),
        )
        .await
        .expect("stage timeout should fire first")
        .unwrap_err();

        assert_eq!(err.kind, ErrorKind::ExportTimeout);
        assert!(err.message.contains("60s"));
        assert!(start.elapsed() >= Duration::from_secs(60));
        assert!(start.elapsed() < Duration::from_secs(61));
    }

    #[tokio::test(start_paused = true)]
    async fn test_export_stuck_submission_observes_cancellation() {
        let export = stuck_stage(&PipelineConfig::default());
        let token = Arc::new(CancellationToken::new());

        let canceller = Arc::clone(&token);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            canceller.cancel("deadline elapsed");
        });

        let err = export.run(&ctx("R1"), &token).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Timeout);
        assert!(err.message.contains("deadline elapsed"));
    }

    #[test]
    fn test_default_run_date_uses_configured_zone() {
        let late_evening = "2024-06-01T23:15:00Z".parse::<Timestamp>().unwrap();
        let london = stuck_stage(&PipelineConfig::default());
        assert_eq!(
            london.default_run_date(late_evening),
            NaiveDate::from_ymd_opt(2024, 6, 2).unwrap()
        );

        let mut config = PipelineConfig::default();
        config.run_date_timezone = chrono_tz::UTC;
        assert_eq!(stuck_stage(&config).default_run_date(late_evening), date());
    }

    #[tokio::test(start_paused = true)]
    async fn test_export_observes_cancellation() {
        let store = Arc::new(InMemoryObjectStore::new());
        let warehouse = Arc::new(ScriptedWarehouse::hanging());
        let export = stage(warehouse.clone(), store, &PipelineConfig::default());
        let token = Arc::new(CancellationToken::new());

        let canceller = Arc::clone(&token);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            canceller.cancel("deadline elapsed");
        });

        let err = export.run(&ctx("R1"), &token).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Timeout);
        assert_eq!(warehouse.cancelled().len(), 1);
    }
}
