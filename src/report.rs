//! Machine-readable stdout markers.
//!
//! The migration frontend scrapes `ROW_COUNT:`, `PROGRESS:` and `FINISHED`
//! lines from standard output, so every marker is written and flushed while
//! holding a single lock: lines never interleave across workers. Everything
//! else the engine has to say goes through `tracing` to stderr or the log
//! file.

use std::io::Write;
use std::sync::Mutex;

#[derive(Debug, Default)]
pub struct Reporter {
    lock: Mutex<()>,
}

impl Reporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn row_count(&self, schema: &str, table: &str, total: u64) {
        self.emit(format_args!("ROW_COUNT:{schema}:{table}: {total}\n"));
    }

    pub fn progress(&self, schema: &str, table: &str, copied: u64, total: u64) {
        self.emit(format_args!("PROGRESS:{schema}:{table}: {copied}/{total}\n"));
    }

    pub fn finished(&self) {
        self.emit(format_args!("FINISHED\n"));
    }

    fn emit(&self, line: std::fmt::Arguments<'_>) {
        let _guard = self.lock.lock().expect("report lock poisoned");
        let mut out = std::io::stdout().lock();
        let _ = out.write_fmt(line);
        let _ = out.flush();
    }
}
