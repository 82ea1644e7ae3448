//! Cancellable download, upload and reset tasks.

use crate::config::{CsvConfig, SyncConfig};
use crate::engine::RowSyncEngine;
use crate::error::Result;
use crate::session::ServerSession;
use crate::state::{Progress, TaskOutcome};
use crate::validate;
use async_trait::async_trait;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, instrument};

/// Cooperative cancellation signal shared between a task and its caller.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    /// Creates a handle that is not cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation. The task stops at its next check.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Returns true once cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Receives cumulative progress after each page or batch.
pub trait ProgressListener: Send + Sync {
    /// Called with the counts so far.
    fn on_progress(&self, progress: &Progress);
}

impl<F> ProgressListener for F
where
    F: Fn(&Progress) + Send + Sync,
{
    fn on_progress(&self, progress: &Progress) {
        self(progress)
    }
}

/// Kind of operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    /// Server to CSV.
    Download,
    /// CSV to server.
    Upload,
    /// Delete all rows on the server.
    Reset,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OperationKind::Download => "download",
            OperationKind::Upload => "upload",
            OperationKind::Reset => "reset",
        })
    }
}

/// A unit of work the runner can execute.
#[async_trait]
pub trait Operation: Send + Sync {
    /// Kind of operation.
    fn kind(&self) -> OperationKind;

    /// Table the operation targets.
    fn table_id(&self) -> &str;

    /// Runs the operation on `engine`.
    async fn execute(&self, engine: &RowSyncEngine) -> Result<TaskOutcome>;
}

/// Validated download parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadParams {
    table_id: String,
    csv: CsvConfig,
    output_root: PathBuf,
}

impl DownloadParams {
    /// Validates download parameters. `output` defaults to `./Download`.
    pub fn new(table_id: &str, csv: CsvConfig, output: Option<&Path>) -> Result<Self> {
        validate::check_download_fields(table_id, output)?;
        Ok(Self {
            table_id: table_id.trim().to_string(),
            csv,
            output_root: output
                .map(Path::to_path_buf)
                .unwrap_or_else(validate::default_download_dir),
        })
    }

    /// Root directory of the output.
    pub fn output_root(&self) -> &Path {
        &self.output_root
    }

    /// CSV configuration.
    pub fn csv(&self) -> &CsvConfig {
        &self.csv
    }
}

#[async_trait]
impl Operation for DownloadParams {
    fn kind(&self) -> OperationKind {
        OperationKind::Download
    }

    fn table_id(&self) -> &str {
        &self.table_id
    }

    async fn execute(&self, engine: &RowSyncEngine) -> Result<TaskOutcome> {
        engine
            .download(&self.table_id, &self.csv, &self.output_root)
            .await
    }
}

/// Validated upload parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadParams {
    table_id: String,
    input: PathBuf,
    data_version: String,
}

impl UploadParams {
    /// Validates upload parameters. `input` defaults to `./Upload`.
    pub fn new(table_id: &str, input: Option<&Path>, data_version: Option<&str>) -> Result<Self> {
        validate::check_upload_fields(table_id, data_version, input)?;
        Ok(Self {
            table_id: table_id.trim().to_string(),
            input: input
                .map(Path::to_path_buf)
                .unwrap_or_else(validate::default_upload_dir),
            data_version: data_version.unwrap_or_default().trim().to_string(),
        })
    }

    /// CSV file or root directory to read.
    pub fn input(&self) -> &Path {
        &self.input
    }

    /// Data version the upload is made against.
    pub fn data_version(&self) -> &str {
        &self.data_version
    }
}

#[async_trait]
impl Operation for UploadParams {
    fn kind(&self) -> OperationKind {
        OperationKind::Upload
    }

    fn table_id(&self) -> &str {
        &self.table_id
    }

    async fn execute(&self, engine: &RowSyncEngine) -> Result<TaskOutcome> {
        engine
            .upload(&self.table_id, &self.input, Some(&self.data_version))
            .await
    }
}

/// Validated reset parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResetParams {
    table_id: String,
    data_version: String,
}

impl ResetParams {
    /// Validates reset parameters.
    pub fn new(table_id: &str, data_version: Option<&str>) -> Result<Self> {
        validate::check_reset_fields(table_id, data_version)?;
        Ok(Self {
            table_id: table_id.trim().to_string(),
            data_version: data_version.unwrap_or_default().trim().to_string(),
        })
    }
}

#[async_trait]
impl Operation for ResetParams {
    fn kind(&self) -> OperationKind {
        OperationKind::Reset
    }

    fn table_id(&self) -> &str {
        &self.table_id
    }

    async fn execute(&self, engine: &RowSyncEngine) -> Result<TaskOutcome> {
        engine.reset(&self.table_id, Some(&self.data_version)).await
    }
}

/// One of the three operations with its parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Task {
    /// Server to CSV.
    Download(DownloadParams),
    /// CSV to server.
    Upload(UploadParams),
    /// Delete all rows on the server.
    Reset(ResetParams),
}

impl Task {
    /// The operation carried by this task.
    pub fn operation(&self) -> &dyn Operation {
        match self {
            Task::Download(params) => params,
            Task::Upload(params) => params,
            Task::Reset(params) => params,
        }
    }
}

#[async_trait]
impl Operation for Task {
    fn kind(&self) -> OperationKind {
        self.operation().kind()
    }

    fn table_id(&self) -> &str {
        self.operation().table_id()
    }

    async fn execute(&self, engine: &RowSyncEngine) -> Result<TaskOutcome> {
        self.operation().execute(engine).await
    }
}

/// Runs operations against one server session.
///
/// A cancelled runner stays cancelled; create a new one for further work.
pub struct TaskRunner {
    session: Arc<dyn ServerSession>,
    config: SyncConfig,
    cancel: CancelHandle,
    listener: Option<Arc<dyn ProgressListener>>,
}

impl TaskRunner {
    /// Creates a runner.
    pub fn new(session: Arc<dyn ServerSession>, config: SyncConfig) -> Self {
        Self {
            session,
            config,
            cancel: CancelHandle::new(),
            listener: None,
        }
    }

    /// Reports progress of every run to `listener`.
    pub fn with_listener(mut self, listener: impl ProgressListener + 'static) -> Self {
        self.listener = Some(Arc::new(listener));
        self
    }

    /// Handle that cancels the current and all later runs.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Runs one operation to completion, cancellation or failure.
    #[instrument(skip_all, fields(kind = %operation.kind(), table_id = operation.table_id()))]
    pub async fn run(&self, operation: &dyn Operation) -> Result<TaskOutcome> {
        let mut engine = RowSyncEngine::new(self.session.clone(), self.config.clone())
            .with_cancel_handle(self.cancel.clone());
        if let Some(listener) = &self.listener {
            engine = engine.with_listener(listener.clone());
        }

        info!("task started");
        let outcome = operation.execute(&engine).await;
        match &outcome {
            Ok(TaskOutcome::Completed(_)) => info!("task completed"),
            Ok(TaskOutcome::Cancelled(_)) => info!("task cancelled"),
            Err(e) => error!(error = %e, "task failed"),
        }
        outcome
    }
}
