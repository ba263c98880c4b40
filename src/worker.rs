//! Copy workers.
//!
//! Each worker owns one source session and one target session and drains the
//! task queue until the closed-empty sentinel. A task runs through open
//! source, open target, optional truncate, streaming (with a large-value
//! detour per oversized column), final flush and commit. A task abort is
//! contained: the worker logs it, rolls back, and moves on.

use std::sync::Arc;

use tracing::{error, info};

use crate::error::Result;
use crate::mapper::bind_row;
use crate::report::Reporter;
use crate::source::{CopySource, SourceConfig};
use crate::target::CopySink;
use crate::task::{TableTask, TaskQueue};

/// Outcome of one worker's pass over the queue.
#[derive(Debug, Default, Clone, Copy)]
pub struct WorkerStats {
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub rows_copied: u64,
}

pub struct CopyWorker {
    name: String,
    source: Box<dyn CopySource>,
    sink: Box<dyn CopySink>,
    queue: Arc<TaskQueue>,
    reporter: Arc<Reporter>,
    config: SourceConfig,
    show_progress: bool,
}

impl CopyWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: String,
        source: Box<dyn CopySource>,
        sink: Box<dyn CopySink>,
        queue: Arc<TaskQueue>,
        reporter: Arc<Reporter>,
        config: SourceConfig,
        show_progress: bool,
    ) -> Self {
        Self {
            name,
            source,
            sink,
            queue,
            reporter,
            config,
            show_progress,
        }
    }

    /// Connect both sessions and drain the queue. Connection failures are
    /// fatal to the whole run; per-task failures are counted and contained.
    pub fn run(mut self) -> Result<WorkerStats> {
        self.sink.connect()?;

        // Source limits derive from what the target session will accept.
        let mut config = self.config.clone();
        config.max_blob_chunk_size = self.sink.max_allowed_packet();
        config.max_parameter_size = self.sink.max_long_data_size();
        self.config = config.clone();
        self.source.configure(config);
        self.source.connect()?;

        let mut stats = WorkerStats::default();
        while let Some(task) = self.queue.pop() {
            info!(worker = %self.name, table = %task.source_name(), "starting table copy");
            match self.copy_task(&task) {
                Ok(rows) => {
                    info!(
                        worker = %self.name,
                        table = %task.source_name(),
                        rows,
                        "table copy finished"
                    );
                    stats.tasks_completed += 1;
                    stats.rows_copied += rows;
                }
                Err(err) => {
                    error!(
                        worker = %self.name,
                        table = %task.source_name(),
                        error = %err,
                        "table copy failed"
                    );
                    if let Err(rollback_err) = self.sink.rollback() {
                        error!(
                            worker = %self.name,
                            error = %rollback_err,
                            "rollback after failed copy also failed"
                        );
                    }
                    stats.tasks_failed += 1;
                }
            }
        }
        Ok(stats)
    }

    fn copy_task(&mut self, task: &TableTask) -> Result<u64> {
        let total = if self.show_progress {
            self.source
                .count_rows(&task.source_schema, &task.source_table, &task.spec)?
        } else {
            0
        };

        let mut cursor = self.source.open_cursor(task)?;
        let columns = cursor.columns().to_vec();
        self.sink.begin_table(task, &columns)?;

        let chunk_size = self.config.max_blob_chunk_size;
        let mut copied = 0u64;
        while let Some(row) = cursor.next_row()? {
            let (bound, lobs) = bind_row(&row.values, &columns)?;
            self.sink.append_row(bound)?;

            // Large values detour through chunked streaming, one column at a
            // time, before the row may leave the pending batch.
            for (column, _handle) in &lobs {
                let mut offset = 0u64;
                loop {
                    let chunk = cursor.read_lob_chunk(&row, *column, offset, chunk_size)?;
                    let read = chunk.data.len();
                    self.sink.append_lob_chunk(*column, &chunk)?;
                    offset += read as u64;
                    if read < chunk_size {
                        break;
                    }
                }
            }
            copied += 1;
        }

        self.sink.flush()?;
        self.sink.commit()?;

        if self.show_progress {
            self.reporter
                .progress(&task.source_schema, &task.source_table, copied, total);
        }
        Ok(copied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CopyError;
    use crate::task::CopySpec;
    use crate::value::{CellValue, ColumnInfo, LobChunk, SourceRow, TypeFamily};
    use mysql::Value;
    use std::sync::Mutex;

    fn column(ordinal: usize, family: TypeFamily) -> ColumnInfo {
        ColumnInfo {
            ordinal,
            name: format!("c{ordinal}"),
            family,
            type_name: "TEST".into(),
            length: 0,
            scale: 0,
            nullable: true,
            charset: None,
        }
    }

    /// Canned source feeding a fixed set of rows per task.
    struct ScriptedSource {
        columns: Vec<ColumnInfo>,
        rows: Vec<Vec<CellValue>>,
        fail_open: bool,
    }

    impl CopySource for ScriptedSource {
        fn connect(&mut self) -> Result<()> {
            Ok(())
        }
        fn configure(&mut self, _config: SourceConfig) {}
        fn count_rows(&mut self, _s: &str, _t: &str, _spec: &CopySpec) -> Result<u64> {
            Ok(self.rows.len() as u64)
        }
        fn open_cursor(&mut self, _task: &TableTask) -> Result<Box<dyn crate::source::SourceCursor>> {
            if self.fail_open {
                return Err(CopyError::Driver("scripted open failure".into()));
            }
            Ok(Box::new(ScriptedCursor {
                columns: self.columns.clone(),
                rows: self.rows.clone().into_iter(),
            }))
        }
    }

    struct ScriptedCursor {
        columns: Vec<ColumnInfo>,
        rows: std::vec::IntoIter<Vec<CellValue>>,
    }

    impl crate::source::SourceCursor for ScriptedCursor {
        fn columns(&self) -> &[ColumnInfo] {
            &self.columns
        }
        fn next_row(&mut self) -> Result<Option<SourceRow>> {
            Ok(self.rows.next().map(|values| SourceRow { values }))
        }
    }

    /// In-memory sink capturing what a real target would receive.
    struct MemorySink {
        committed: Arc<Mutex<Vec<Vec<Value>>>>,
        pending: Vec<Vec<Value>>,
        flushes: usize,
        rollbacks: usize,
        packet_limit: usize,
    }

    impl Default for MemorySink {
        fn default() -> Self {
            Self {
                committed: Arc::default(),
                pending: Vec::new(),
                flushes: 0,
                rollbacks: 0,
                packet_limit: 1024 * 1024,
            }
        }
    }

    impl CopySink for MemorySink {
        fn connect(&mut self) -> Result<()> {
            Ok(())
        }
        fn max_allowed_packet(&self) -> usize {
            self.packet_limit
        }
        fn max_long_data_size(&self) -> usize {
            16 * 1024 * 1024
        }
        fn set_batch_size(&mut self, _rows: usize) {}
        fn begin_table(&mut self, _task: &TableTask, _columns: &[ColumnInfo]) -> Result<()> {
            Ok(())
        }
        fn append_row(&mut self, row: Vec<Value>) -> Result<()> {
            self.pending.push(row);
            Ok(())
        }
        fn append_lob_chunk(&mut self, column: usize, chunk: &LobChunk) -> Result<()> {
            let row = self.pending.last_mut().expect("no pending row");
            match &mut row[column] {
                Value::Bytes(buffer) => buffer.extend_from_slice(&chunk.data),
                other => *other = Value::Bytes(chunk.data.clone()),
            }
            Ok(())
        }
        fn flush(&mut self) -> Result<()> {
            self.flushes += 1;
            self.committed
                .lock()
                .unwrap()
                .append(&mut self.pending);
            Ok(())
        }
        fn commit(&mut self) -> Result<()> {
            Ok(())
        }
        fn rollback(&mut self) -> Result<()> {
            self.rollbacks += 1;
            self.pending.clear();
            Ok(())
        }
    }

    fn task() -> TableTask {
        TableTask {
            source_schema: "s".into(),
            source_table: "t".into(),
            target_schema: "s".into(),
            target_table: "t".into(),
            select_expression: "*".into(),
            spec: CopySpec::All,
        }
    }

    #[test]
    fn worker_copies_all_rows_and_reassembles_lobs() {
        let payload: Vec<u8> = (0u8..=255).cycle().take(10_000).collect();
        let source = ScriptedSource {
            columns: vec![
                column(0, TypeFamily::SignedInteger),
                column(1, TypeFamily::Bytes),
            ],
            rows: vec![
                vec![
                    CellValue::Int(1),
                    CellValue::Lob(crate::value::LobHandle::new(payload.clone(), false)),
                ],
                vec![CellValue::Int(2), CellValue::Bytes(vec![9, 9])],
            ],
            fail_open: false,
        };

        let committed = Arc::new(Mutex::new(Vec::new()));
        let sink = MemorySink {
            committed: Arc::clone(&committed),
            // Chunk bound derives from the packet bound, forcing ten chunks
            // for the first row's payload.
            packet_limit: 1000,
            ..MemorySink::default()
        };

        let queue = Arc::new(TaskQueue::new());
        queue.push(task());

        let worker = CopyWorker::new(
            "w1".into(),
            Box::new(source),
            Box::new(sink),
            queue,
            Arc::new(Reporter::new()),
            SourceConfig::default(),
            false,
        );
        let stats = worker.run().unwrap();
        assert_eq!(stats.tasks_completed, 1);
        assert_eq!(stats.tasks_failed, 0);
        assert_eq!(stats.rows_copied, 2);

        let rows = committed.lock().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0][0], Value::Int(1));
        assert_eq!(rows[0][1], Value::Bytes(payload));
        assert_eq!(rows[1][1], Value::Bytes(vec![9, 9]));
    }

    #[test]
    fn failed_task_does_not_stop_the_worker() {
        let source = ScriptedSource {
            columns: vec![column(0, TypeFamily::SignedInteger)],
            rows: vec![vec![CellValue::Int(1)]],
            fail_open: true,
        };
        let committed = Arc::new(Mutex::new(Vec::new()));
        let sink = MemorySink {
            committed: Arc::clone(&committed),
            ..MemorySink::default()
        };

        let queue = Arc::new(TaskQueue::new());
        queue.push(task());
        queue.push(task());

        let worker = CopyWorker::new(
            "w1".into(),
            Box::new(source),
            Box::new(sink),
            queue,
            Arc::new(Reporter::new()),
            SourceConfig::default(),
            false,
        );
        let stats = worker.run().unwrap();
        // Both tasks hit the scripted open failure, the worker survived both.
        assert_eq!(stats.tasks_failed, 2);
        assert_eq!(stats.tasks_completed, 0);
        assert!(committed.lock().unwrap().is_empty());
    }

    #[test]
    fn range_error_aborts_the_task() {
        let source = ScriptedSource {
            columns: vec![column(0, TypeFamily::UnsignedInteger)],
            rows: vec![vec![CellValue::Int(-1)]],
            fail_open: false,
        };
        let committed = Arc::new(Mutex::new(Vec::new()));
        let sink = MemorySink {
            committed: Arc::clone(&committed),
            ..MemorySink::default()
        };

        let queue = Arc::new(TaskQueue::new());
        queue.push(task());

        let worker = CopyWorker::new(
            "w1".into(),
            Box::new(source),
            Box::new(sink),
            queue,
            Arc::new(Reporter::new()),
            SourceConfig::default(),
            false,
        );
        let stats = worker.run().unwrap();
        assert_eq!(stats.tasks_failed, 1);
        assert!(committed.lock().unwrap().is_empty());
    }
}
