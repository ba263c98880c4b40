//! Orchestration entry points for the three run modes.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{error, info, warn};

use crate::config::MysqlEndpoint;
use crate::error::{CopyError, Result};
use crate::report::Reporter;
use crate::source::dbapi::DbApiSource;
use crate::source::mysql::MysqlSource;
use crate::source::{CopySource, SourceConfig};
use crate::target::{connect_target, CopySink, MysqlTarget};
use crate::task::TaskQueue;
use crate::triggers::TriggerBracket;
use crate::worker::{CopyWorker, WorkerStats};

/// Where rows come from; each worker materialises its own session from this.
#[derive(Debug, Clone)]
pub enum SourceSpec {
    MySql(MysqlEndpoint),
    Odbc {
        connstring: String,
        password: String,
    },
    /// Pluggable driver, selected by connection-string scheme.
    DbApi {
        connstring: String,
        password: String,
    },
}

impl SourceSpec {
    pub fn create(&self) -> Result<Box<dyn CopySource>> {
        match self {
            SourceSpec::MySql(endpoint) => Ok(Box::new(MysqlSource::new(endpoint.clone()))),
            #[cfg(feature = "odbc")]
            SourceSpec::Odbc {
                connstring,
                password,
            } => Ok(Box::new(crate::source::odbc::OdbcSource::new(
                connstring.clone(),
                password.clone(),
            ))),
            #[cfg(not(feature = "odbc"))]
            SourceSpec::Odbc { .. } => Err(CopyError::Invocation(
                "this build does not include ODBC support; rebuild with --features odbc".into(),
            )),
            SourceSpec::DbApi {
                connstring,
                password,
            } => Ok(Box::new(DbApiSource::new(
                connstring.clone(),
                password.clone(),
            ))),
        }
    }
}

/// Settings shared by every worker of one copy run.
#[derive(Debug, Clone)]
pub struct CopyOptions {
    pub thread_count: usize,
    pub bulk_insert_batch_size: usize,
    pub truncate_target: bool,
    pub show_progress: bool,
    pub abort_on_oversized_blobs: bool,
    pub force_utf8: bool,
    pub disable_triggers: bool,
    pub app_name: String,
}

/// Aggregated result of a copy run.
#[derive(Debug, Default, Clone, Copy)]
pub struct RunSummary {
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub rows_copied: u64,
}

impl RunSummary {
    fn absorb(&mut self, stats: WorkerStats) {
        self.tasks_completed += stats.tasks_completed;
        self.tasks_failed += stats.tasks_failed;
        self.rows_copied += stats.rows_copied;
    }
}

/// Count mode: one source session, one `ROW_COUNT:` line per task.
pub fn run_count_only(
    source_spec: &SourceSpec,
    queue: &Arc<TaskQueue>,
    reporter: &Reporter,
) -> Result<()> {
    let mut source = source_spec.create()?;
    source.configure(SourceConfig::default());
    source.connect()?;

    while let Some(task) = queue.pop() {
        let total = source.count_rows(&task.source_schema, &task.source_table, &task.spec)?;
        reporter.row_count(&task.source_schema, &task.source_table, total);
    }
    Ok(())
}

/// Standalone trigger backup (`--disable-triggers-on`).
pub fn run_disable_triggers(endpoint: &MysqlEndpoint, schemas: &BTreeSet<String>) -> Result<()> {
    let mut conn = connect_target(endpoint)?;
    let backup = crate::triggers::backup_triggers(&mut conn, schemas)?;
    info!(triggers = backup.len(), "trigger backup complete");
    Ok(())
}

/// Standalone trigger restore (`--reenable-triggers-on`).
pub fn run_reenable_triggers(endpoint: &MysqlEndpoint, schemas: &BTreeSet<String>) -> Result<()> {
    let mut conn = connect_target(endpoint)?;
    let restored = crate::triggers::restore_triggers(&mut conn, schemas)?;
    info!(triggers = restored, "trigger restore complete");
    Ok(())
}

/// Copy mode: bracket with the trigger backup, launch workers, join, restore.
pub fn run_copy(
    source_spec: &SourceSpec,
    target: &MysqlEndpoint,
    queue: Arc<TaskQueue>,
    trigger_schemas: &BTreeSet<String>,
    options: &CopyOptions,
    reporter: Arc<Reporter>,
) -> Result<RunSummary> {
    let mut bracket = if options.disable_triggers {
        Some(TriggerBracket::backup(target, trigger_schemas)?)
    } else {
        None
    };
    if let Some(bracket) = &bracket {
        info!(triggers = bracket.captured(), "target triggers disabled for the copy");
    }

    let thread_count = options.thread_count.max(1);
    let mut handles = Vec::with_capacity(thread_count);
    for index in 0..thread_count {
        let name = format!("task-{}", index + 1);
        let source_spec = source_spec.clone();
        let target = target.clone();
        let queue = Arc::clone(&queue);
        let reporter = Arc::clone(&reporter);
        let options = options.clone();

        let handle = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || -> Result<WorkerStats> {
                let source = source_spec.create()?;
                let mut sink: Box<dyn CopySink> = Box::new(MysqlTarget::new(
                    target,
                    &options.app_name,
                    options.truncate_target,
                ));
                sink.set_batch_size(options.bulk_insert_batch_size);

                let config = SourceConfig {
                    abort_on_oversized_blobs: options.abort_on_oversized_blobs,
                    force_utf8: options.force_utf8,
                    ..SourceConfig::default()
                };
                CopyWorker::new(
                    name,
                    source,
                    sink,
                    queue,
                    reporter,
                    config,
                    options.show_progress,
                )
                .run()
            })
            .map_err(|e| CopyError::Driver(format!("cannot spawn worker thread: {e}")))?;
        handles.push(handle);
    }

    let mut summary = RunSummary::default();
    let mut fatal: Option<CopyError> = None;
    for handle in handles {
        match handle.join() {
            Ok(Ok(stats)) => summary.absorb(stats),
            Ok(Err(err)) => {
                error!(error = %err, "worker failed to start");
                fatal.get_or_insert(err);
            }
            Err(_) => {
                fatal.get_or_insert(CopyError::Driver("worker thread panicked".into()));
            }
        }
    }

    // Restore runs on every path: explicitly here, or from the bracket's
    // Drop if the restore call itself is never reached.
    if let Some(bracket) = bracket.as_mut() {
        match bracket.restore() {
            Ok(n) => info!(triggers = n, "target triggers restored"),
            Err(e) => {
                error!(error = %e, "failed to restore target triggers");
                fatal.get_or_insert(e);
            }
        }
    }
    drop(bracket);

    if let Some(err) = fatal {
        return Err(err);
    }
    if summary.tasks_failed > 0 {
        warn!(
            failed = summary.tasks_failed,
            completed = summary.tasks_completed,
            "copy finished with failed tasks"
        );
    }
    Ok(summary)
}
