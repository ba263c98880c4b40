//! Table-copy tasks and the worker queue.

use std::collections::VecDeque;
use std::sync::Mutex;

/// What to copy out of one source table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CopySpec {
    /// Every row returned by the select expression.
    All,
    /// Rows whose integer `key` lies in `[start, end]`; `-1` on either bound
    /// means unbounded on that side.
    Range { key: String, start: i64, end: i64 },
    /// At most `rows` rows in source order.
    Count { rows: u64 },
}

/// One unit of work, immutable once enqueued.
#[derive(Debug, Clone)]
pub struct TableTask {
    pub source_schema: String,
    pub source_table: String,
    pub target_schema: String,
    pub target_table: String,
    /// Source-side projection; `*` means all columns.
    pub select_expression: String,
    pub spec: CopySpec,
}

impl TableTask {
    /// `schema.table` identity used in log lines.
    pub fn source_name(&self) -> String {
        format!("{}.{}", self.source_schema, self.source_table)
    }

    pub fn target_name(&self) -> String {
        format!("{}.{}", self.target_schema, self.target_table)
    }
}

/// Mutex-guarded FIFO of copy tasks.
///
/// The orchestrator pushes before workers launch; afterwards the queue only
/// drains. `pop` returning `None` is the closed-empty sentinel that tells a
/// worker to terminate.
#[derive(Debug, Default)]
pub struct TaskQueue {
    tasks: Mutex<VecDeque<TableTask>>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, task: TableTask) {
        self.tasks.lock().expect("task queue poisoned").push_back(task);
    }

    pub fn pop(&self) -> Option<TableTask> {
        self.tasks.lock().expect("task queue poisoned").pop_front()
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().expect("task queue poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
