//! Completion notification.

use super::{NotifyResult, NotifyStage};
use crate::cancellation::CancellationToken;
use crate::config::{NotifyConfig, ParameterKeys};
use crate::context::RunContext;
use crate::errors::{ErrorKind, StageError};
use crate::pipeline::retry_while;
use crate::ports::{
    require_parameter, NotificationChannel, NotificationMessage, ParameterStore, PortError,
    RequiredParameterError,
};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::info;

/// Renders the summary for a run whose outcome is decided.
///
/// A recorded failure makes this a failure notice.
#[must_use]
pub fn render_message(ctx: &RunContext, subject_prefix: &str) -> NotificationMessage {
    let run_id = ctx.display_id();
    let failed = ctx.failure().is_some();
    let (verb, status) = if failed {
        ("failed", "failed")
    } else {
        ("complete", "succeeded")
    };

    let date = ctx
        .run_date()
        .map_or_else(|| "unknown".to_string(), |d| d.to_string());
    let mut lines = vec![format!("Status: {status}"), format!("Date: {date}")];
    if let Some(input) = ctx.input_location() {
        lines.push(format!("Input: {input}"));
    }
    if let Some(output) = ctx.output_location() {
        lines.push(format!("Outputs: {output}"));
    }
    if let Some(failure) = ctx.failure() {
        lines.push(format!("Stage: {}", failure.stage));
        lines.push(format!("Kind: {}", failure.kind));
        lines.push(format!("Cause: {}", failure.cause));
    }

    NotificationMessage {
        subject: format!("{subject_prefix} {verb}: {run_id}"),
        body: lines.join("\n"),
        recipient: ctx.params().recipient.clone(),
    }
}

const fn is_transient(err: &PortError) -> bool {
    matches!(err, PortError::Unavailable(_) | PortError::ResourceExhausted(_))
}

/// Publishes the summary to a topic with bounded retries.
pub struct TopicNotifyStage {
    channel: Arc<dyn NotificationChannel>,
    parameters: Arc<dyn ParameterStore>,
    topic_key: String,
    config: NotifyConfig,
}

impl TopicNotifyStage {
    /// Creates a notify stage.
    #[must_use]
    pub fn new(
        channel: Arc<dyn NotificationChannel>,
        parameters: Arc<dyn ParameterStore>,
        keys: &ParameterKeys,
        config: NotifyConfig,
    ) -> Self {
        Self {
            channel,
            parameters,
            topic_key: keys.notify_topic.clone(),
            config,
        }
    }
}

#[async_trait]
impl NotifyStage for TopicNotifyStage {
    async fn run(
        &self,
        ctx: &RunContext,
        cancel: &CancellationToken,
    ) -> Result<NotifyResult, StageError> {
        let topic = require_parameter(self.parameters.as_ref(), &self.topic_key)
            .await
            .map_err(|e| match e {
                RequiredParameterError::Missing(key) => StageError::configuration_missing(&key),
                other @ RequiredParameterError::Lookup { .. } => {
                    StageError::new(ErrorKind::NotifyDeliveryFailed, other.to_string())
                }
            })?;
        let message = render_message(ctx, &self.config.subject_prefix);

        let counter = AtomicUsize::new(0);
        let attempts = &counter;
        let channel = self.channel.as_ref();
        let topic = topic.as_str();
        let msg = &message;

        let published = retry_while(&self.config.retry, "notify", cancel, is_transient, move || async move {
            attempts.fetch_add(1, Ordering::SeqCst);
            channel.publish(topic, msg).await
        })
        .await;

        let attempts = counter.load(Ordering::SeqCst);
        match published {
            Ok(message_id) => {
                info!(run_id = %ctx.display_id(), message_id = %message_id, attempts, "Notification published");
                Ok(NotifyResult::new(message_id, attempts))
            }
            Err(e) => Err(StageError::new(
                ErrorKind::NotifyDeliveryFailed,
                format!("delivery failed after {attempts} attempt(s): {e}"),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::context::RunParameters;
    use crate::core::{FailureRecord, RunStatus, StageName};
    use crate::pipeline::{JitterStrategy, RetryConfig};
    use crate::testing::{InMemoryParameterStore, RecordingChannel};
    use pretty_assertions::assert_eq;

    fn notify_config(attempts: usize) -> NotifyConfig {
        NotifyConfig {
            retry: RetryConfig::new()
                .with_max_attempts(attempts)
                .with_base_delay_ms(1)
                .with_jitter(JitterStrategy::None),
            ..NotifyConfig::default()
        }
    }

    fn stage(channel: Arc<RecordingChannel>, attempts: usize) -> TopicNotifyStage {
        TopicNotifyStage::new(
            channel,
            Arc::new(InMemoryParameterStore::complete()),
            &PipelineConfig::default().parameters,
            notify_config(attempts),
        )
    }

    fn succeeded_ctx() -> RunContext {
        let mut ctx = RunContext::new(RunParameters::new().with_recipient("ops@example.com"));
        ctx.set_run_id("R1".to_string()).unwrap();
        ctx.set_output_location("/scored/run_id=R1/".to_string()).unwrap();
        ctx
    }

    #[test]
    fn test_render_success_message() {
        let message = render_message(&succeeded_ctx(), "Scoring");

        assert_eq!(message.subject, "Scoring complete: R1");
        assert_eq!(
            message.body,
            "Status: succeeded\nDate: unknown\nOutputs: /scored/run_id=R1/"
        );
        assert_eq!(message.recipient.as_deref(), Some("ops@example.com"));
    }

    #[test]
    fn test_render_failure_message_uses_execution_id() {
        let mut ctx = RunContext::new(RunParameters::new());
        ctx.transition(RunStatus::Exporting).unwrap();
        ctx.record_failure(FailureRecord::new(
            StageName::Export,
            ErrorKind::ExportUnavailable,
            "warehouse unreachable",
        ))
        .unwrap();

        let message = render_message(&ctx, "Scoring");

        assert_eq!(
            message.subject,
            format!("Scoring failed: {}", ctx.execution_id())
        );
        assert!(message.body.contains("Stage: export"));
        assert!(message.body.contains("Kind: export_unavailable"));
        assert!(message.body.contains("Cause: warehouse unreachable"));
        assert!(!message.body.contains("Outputs:"));
    }

    #[tokio::test]
    async fn test_notify_publishes_once() {
        let channel = Arc::new(RecordingChannel::new());
        let result = stage(channel.clone(), 3)
            .run(&succeeded_ctx(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.attempts, 1);
        assert_eq!(channel.published().len(), 1);
        assert_eq!(channel.published()[0].0, "arn:topic");
    }

    #[tokio::test]
    async fn test_notify_retries_transient_errors() {
        let channel = Arc::new(RecordingChannel::failing_first(2));
        let result = stage(channel.clone(), 3)
            .run(&succeeded_ctx(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.attempts, 3);
        assert_eq!(channel.published().len(), 1);
    }

    #[tokio::test]
    async fn test_notify_gives_up_after_max_attempts() {
        let channel = Arc::new(RecordingChannel::failing_first(10));
        let err = stage(channel.clone(), 3)
            .run(&succeeded_ctx(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err.kind, ErrorKind::NotifyDeliveryFailed);
        assert!(err.message.contains("3 attempt(s)"));
        assert_eq!(channel.attempts(), 3);
    }

    #[tokio::test]
    async fn test_notify_missing_topic() {
        let params = InMemoryParameterStore::complete();
        params.remove("/trust_scoring/notify_topic_arn");
        let channel = Arc::new(RecordingChannel::new());
        let stage = TopicNotifyStage::new(
            channel.clone(),
            Arc::new(params),
            &PipelineConfig::default().parameters,
            notify_config(3),
        );

        let err = stage
            .run(&succeeded_ctx(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::ConfigurationMissing);
        assert_eq!(channel.attempts(), 0);
    }
}
