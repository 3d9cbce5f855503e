//! Concrete collaborators and pipeline wiring.
//!
//! The local backends run everything on one machine. `local_coordinator`
//! assembles the reference stages over them, wrapping export and compute in
//! [`Retrying`] when the configuration asks for it.

mod local;

pub use local::{
    FsObjectStore, LayeredParameterStore, LogChannel, ProcessJobRunner, ProcessWarehouse,
    PARAM_ENV_PREFIX,
};

use crate::config::PipelineConfig;
use crate::errors::ScoreflowError;
use crate::events::EventSink;
use crate::interceptors::Retrying;
use crate::pipeline::PipelineCoordinator;
use crate::stages::{
    ComputeStage, ContainerComputeStage, ExportStage, NotifyStage, TopicNotifyStage,
    WarehouseExportStage,
};
use std::sync::Arc;

/// Builds a coordinator over the local backends.
pub fn local_coordinator(
    config: &PipelineConfig,
    events: Arc<dyn EventSink>,
) -> Result<PipelineCoordinator, ScoreflowError> {
    let store = FsObjectStore::new(&config.local.root);
    let parameters = Arc::new(LayeredParameterStore::new(config.local.parameters.clone()));
    let warehouse = Arc::new(ProcessWarehouse::new(
        config.local.export_command.clone(),
        store.clone(),
    ));
    let runner = Arc::new(ProcessJobRunner::new(store.clone()));
    let store = Arc::new(store);

    let export = WarehouseExportStage::new(warehouse, store.clone(), parameters.clone(), config);
    let export: Arc<dyn ExportStage> = match &config.export.retry {
        Some(retry) => Arc::new(Retrying::new(export, retry.clone())),
        None => Arc::new(export),
    };

    let compute = ContainerComputeStage::new(runner, store, config.compute.clone());
    let compute: Arc<dyn ComputeStage> = match &config.compute.retry {
        Some(retry) => Arc::new(Retrying::new(compute, retry.clone())),
        None => Arc::new(compute),
    };

    let notify: Arc<dyn NotifyStage> = Arc::new(TopicNotifyStage::new(
        Arc::new(LogChannel),
        parameters.clone(),
        &config.parameters,
        config.notify.clone(),
    ));

    PipelineCoordinator::builder()
        .export(export)
        .compute(compute)
        .notify(notify)
        .parameters(parameters)
        .config(config.clone())
        .event_sink(events)
        .build()
}
