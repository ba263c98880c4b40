//! Thread-backed streaming cursors.
//!
//! The blocking drivers tie their result handles to the connection borrow, so
//! a cursor that must outlive one function call runs the driver loop on its
//! own thread and hands rows over a bounded channel. The channel bound gives
//! backpressure: the producer blocks once the consumer falls behind, keeping
//! at most [`ROW_CHANNEL_CAPACITY`] rows in flight instead of the full result
//! set.

use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Receiver, Sender};
use tracing::debug;

use crate::error::{CopyError, Result};
use crate::value::{ColumnInfo, SourceRow};

pub(crate) const ROW_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug)]
enum RowEvent {
    Row(SourceRow),
    End,
    Failed(CopyError),
}

/// Producer half handed to the driver loop.
pub(crate) struct PumpSession {
    header_tx: Sender<Result<Vec<ColumnInfo>>>,
    row_tx: Sender<RowEvent>,
    header_sent: bool,
}

impl PumpSession {
    /// Publish the column descriptors; must happen exactly once, before rows.
    pub fn columns(&mut self, columns: Vec<ColumnInfo>) {
        if !self.header_sent {
            self.header_sent = true;
            let _ = self.header_tx.send(Ok(columns));
        }
    }

    /// Hand one row to the consumer. Returns `false` once the consumer has
    /// dropped the cursor and the producer should stop.
    pub fn row(&mut self, row: SourceRow) -> bool {
        self.row_tx.send(RowEvent::Row(row)).is_ok()
    }

    fn fail(&mut self, err: CopyError) {
        if self.header_sent {
            let _ = self.row_tx.send(RowEvent::Failed(err));
        } else {
            self.header_sent = true;
            let _ = self.header_tx.send(Err(err));
        }
    }

    fn finish(&mut self) {
        let _ = self.row_tx.send(RowEvent::End);
    }
}

/// Consumer half: a streaming cursor fed by a driver thread.
#[derive(Debug)]
pub(crate) struct CursorPump {
    columns: Vec<ColumnInfo>,
    rows: Receiver<RowEvent>,
    handle: Option<JoinHandle<()>>,
    done: bool,
}

impl CursorPump {
    /// Spawn `producer` on its own named thread and wait for the column
    /// header. The producer publishes columns via [`PumpSession::columns`],
    /// then streams rows; returning an error before the header fails the
    /// open itself.
    pub fn spawn<F>(thread_name: String, producer: F) -> Result<Self>
    where
        F: FnOnce(&mut PumpSession) -> Result<()> + Send + 'static,
    {
        let (header_tx, header_rx) = bounded(1);
        let (row_tx, row_rx) = bounded(ROW_CHANNEL_CAPACITY);

        let handle = std::thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                let mut session = PumpSession {
                    header_tx,
                    row_tx,
                    header_sent: false,
                };
                match producer(&mut session) {
                    Ok(()) => session.finish(),
                    Err(err) => session.fail(err),
                }
            })
            .map_err(|e| CopyError::Driver(format!("cannot spawn cursor thread: {e}")))?;

        match header_rx.recv() {
            Ok(Ok(columns)) => Ok(Self {
                columns,
                rows: row_rx,
                handle: Some(handle),
                done: false,
            }),
            Ok(Err(err)) => {
                let _ = handle.join();
                Err(err)
            }
            Err(_) => {
                let _ = handle.join();
                Err(CopyError::Driver(format!(
                    "cursor thread '{thread_name}' exited before describing columns"
                )))
            }
        }
    }

    pub fn columns(&self) -> &[ColumnInfo] {
        &self.columns
    }

    pub fn next_row(&mut self) -> Result<Option<SourceRow>> {
        if self.done {
            return Ok(None);
        }
        match self.rows.recv() {
            Ok(RowEvent::Row(row)) => Ok(Some(row)),
            Ok(RowEvent::End) => {
                self.done = true;
                self.join();
                Ok(None)
            }
            Ok(RowEvent::Failed(err)) => {
                self.done = true;
                self.join();
                Err(err)
            }
            Err(_) => {
                self.done = true;
                Err(CopyError::Driver("cursor thread terminated unexpectedly".into()))
            }
        }
    }

    fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                debug!("cursor thread panicked after end of stream");
            }
        }
    }
}

impl Drop for CursorPump {
    fn drop(&mut self) {
        // Closing the receiver makes the producer's next send fail, which
        // unwinds its loop; the join then cannot deadlock.
        let drained = std::mem::replace(&mut self.rows, bounded(0).1);
        drop(drained);
        self.join();
    }
}
