//! MySQL bulk-insert target.
//!
//! Rows are buffered into multi-row `INSERT` batches bound against a prepared
//! statement; the batch closes on a row budget or on the packet budget,
//! whichever is hit first. Large values arrive as chunks appended onto the
//! pending row's parameter. Workers talk to the writer through [`CopySink`]
//! so the pipeline can run against an in-memory sink in tests.

use mysql::prelude::*;
use mysql::{Conn, Opts, OptsBuilder, Params, Statement, Value};
use tracing::{debug, info, warn};

use crate::config::MysqlEndpoint;
use crate::error::{CopyError, Result};
use crate::mapper::estimated_bind_size;
use crate::task::TableTask;
use crate::value::{ColumnInfo, LobChunk};

/// MySQL refuses packets above `max_allowed_packet` with this server error.
const ER_NET_PACKET_TOO_LARGE: u16 = 1153;

/// Fraction of `max_allowed_packet` a batch may occupy before it is flushed.
const PACKET_BUDGET: f64 = 0.9;

pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Row sink half of the copy pipeline.
pub trait CopySink: Send {
    fn connect(&mut self) -> Result<()>;

    /// Server bound for one protocol packet; sources derive their chunk size
    /// from it.
    fn max_allowed_packet(&self) -> usize;

    /// Server bound for one reassembled parameter value.
    fn max_long_data_size(&self) -> usize;

    /// Rows per `INSERT`; floor 1.
    fn set_batch_size(&mut self, rows: usize);

    /// Validate the column layout and prepare for one task's inserts,
    /// truncating first when requested.
    fn begin_table(&mut self, task: &TableTask, columns: &[ColumnInfo]) -> Result<()>;

    /// Buffer one bound row, flushing a full batch first when necessary. The
    /// appended row always stays pending until the next call so that its
    /// large-value chunks can still be attached.
    fn append_row(&mut self, row: Vec<Value>) -> Result<()>;

    /// Append one chunk of a large value onto the pending row's column.
    fn append_lob_chunk(&mut self, column: usize, chunk: &LobChunk) -> Result<()>;

    /// Write out whatever is buffered.
    fn flush(&mut self) -> Result<()>;

    fn commit(&mut self) -> Result<()>;

    /// Drop the buffered batch and roll back the open transaction.
    fn rollback(&mut self) -> Result<()>;
}

pub struct MysqlTarget {
    endpoint: MysqlEndpoint,
    app_name: String,
    truncate: bool,
    batch_size: usize,
    conn: Option<Conn>,
    max_allowed_packet: usize,
    max_long_data_size: usize,
    // Per-table state.
    insert_prefix: String,
    column_count: usize,
    prepared: Option<(usize, Statement)>,
    pending: Vec<Vec<Value>>,
    pending_bytes: usize,
}

impl MysqlTarget {
    pub fn new(endpoint: MysqlEndpoint, app_name: &str, truncate: bool) -> Self {
        Self {
            endpoint,
            app_name: app_name.to_string(),
            truncate,
            batch_size: DEFAULT_BATCH_SIZE,
            conn: None,
            max_allowed_packet: 4 * 1024 * 1024,
            max_long_data_size: 4 * 1024 * 1024,
            insert_prefix: String::new(),
            column_count: 0,
            prepared: None,
            pending: Vec::new(),
            pending_bytes: 0,
        }
    }

    fn conn(&mut self) -> Result<&mut Conn> {
        self.conn
            .as_mut()
            .ok_or_else(|| CopyError::Driver("MySQL target is not connected".into()))
    }

    fn packet_budget(&self) -> usize {
        (self.max_allowed_packet as f64 * PACKET_BUDGET) as usize
    }

    fn statement_for(&mut self, rows: usize) -> Result<Statement> {
        if let Some((prepared_rows, stmt)) = &self.prepared {
            if *prepared_rows == rows {
                return Ok(stmt.clone());
            }
        }
        let row_placeholders = format!(
            "({})",
            vec!["?"; self.column_count].join(", ")
        );
        let sql = format!(
            "{} VALUES {}",
            self.insert_prefix,
            vec![row_placeholders.as_str(); rows].join(", ")
        );
        let stmt = self.conn()?.prep(sql)?;
        self.prepared = Some((rows, stmt.clone()));
        Ok(stmt)
    }

    fn execute_batch(&mut self, rows: &[Vec<Value>]) -> Result<()> {
        let stmt = self.statement_for(rows.len())?;
        let params: Vec<Value> = rows.iter().flatten().cloned().collect();
        let result = self.conn()?.exec_drop(&stmt, Params::Positional(params));
        match result {
            Ok(()) => Ok(()),
            Err(mysql::Error::MySqlError(server)) if server.code == ER_NET_PACKET_TOO_LARGE => {
                Err(CopyError::PacketTooLarge(format!(
                    "batch of {} rows refused by the server",
                    rows.len()
                )))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Execute with the halve-and-retry fallback for over-sized batches.
    fn execute_with_retry(&mut self, rows: Vec<Vec<Value>>) -> Result<()> {
        match self.execute_batch(&rows) {
            Err(CopyError::PacketTooLarge(_)) if rows.len() > 1 => {
                let half = rows.len() / 2;
                warn!(
                    rows = rows.len(),
                    "batch exceeded max_allowed_packet, retrying in halves"
                );
                let (first, second) = rows.split_at(half);
                self.execute_batch(first)?;
                self.execute_batch(second)?;
                Ok(())
            }
            other => other,
        }
    }
}

impl CopySink for MysqlTarget {
    fn connect(&mut self) -> Result<()> {
        let mut conn = Conn::new(target_opts(&self.endpoint))
            .map_err(|e| CopyError::Connect(format!("MySQL target: {e}")))?;

        // Bulk-load session: no per-row integrity churn, one explicit commit
        // per table.
        conn.query_drop("SET NAMES utf8mb4")?;
        conn.query_drop("SET FOREIGN_KEY_CHECKS = 0")?;
        conn.query_drop("SET UNIQUE_CHECKS = 0")?;
        conn.query_drop("SET autocommit = 0")?;

        let packet: Option<u64> = conn.query_first("SELECT @@max_allowed_packet")?;
        if let Some(packet) = packet {
            self.max_allowed_packet = packet as usize;
        }
        // Dropped in MySQL 8.0; fall back to the packet bound.
        self.max_long_data_size = match conn.query_first::<u64, _>("SELECT @@max_long_data_size") {
            Ok(Some(size)) => size as usize,
            _ => self.max_allowed_packet,
        };

        info!(
            app = %self.app_name,
            max_allowed_packet = self.max_allowed_packet,
            max_long_data_size = self.max_long_data_size,
            "connected to target"
        );
        self.conn = Some(conn);
        Ok(())
    }

    fn max_allowed_packet(&self) -> usize {
        self.max_allowed_packet
    }

    fn max_long_data_size(&self) -> usize {
        self.max_long_data_size
    }

    fn set_batch_size(&mut self, rows: usize) {
        self.batch_size = rows.max(1);
    }

    fn begin_table(&mut self, task: &TableTask, columns: &[ColumnInfo]) -> Result<()> {
        let target_columns: Vec<String> = self.conn()?.exec(
            "SELECT COLUMN_NAME FROM information_schema.COLUMNS \
             WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ? \
             ORDER BY ORDINAL_POSITION",
            (&task.target_schema, &task.target_table),
        )?;
        if target_columns.is_empty() {
            return Err(CopyError::SchemaMismatch(format!(
                "target table {} does not exist",
                task.target_name()
            )));
        }
        // The INSERT carries no column list, so source cursor order must line
        // up with the target's column order name by name.
        check_column_layout(&task.target_name(), columns, &target_columns)?;

        self.insert_prefix = format!(
            "INSERT INTO `{}`.`{}`",
            task.target_schema.replace('`', "``"),
            task.target_table.replace('`', "``")
        );
        self.column_count = columns.len();
        self.prepared = None;
        self.pending.clear();
        self.pending_bytes = 0;

        if self.truncate {
            let sql = format!(
                "TRUNCATE TABLE `{}`.`{}`",
                task.target_schema.replace('`', "``"),
                task.target_table.replace('`', "``")
            );
            debug!(table = %task.target_name(), "truncating target table");
            self.conn()?.query_drop(sql)?;
        }
        Ok(())
    }

    fn append_row(&mut self, row: Vec<Value>) -> Result<()> {
        if row.len() != self.column_count {
            return Err(CopyError::SchemaMismatch(format!(
                "row with {} values bound against {} columns",
                row.len(),
                self.column_count
            )));
        }
        let row_bytes: usize = row.iter().map(estimated_bind_size).sum();
        if !self.pending.is_empty()
            && (self.pending.len() >= self.batch_size
                || self.pending_bytes + row_bytes > self.packet_budget())
        {
            self.flush()?;
        }
        self.pending.push(row);
        self.pending_bytes += row_bytes;
        Ok(())
    }

    fn append_lob_chunk(&mut self, column: usize, chunk: &LobChunk) -> Result<()> {
        let row = self
            .pending
            .last_mut()
            .ok_or_else(|| CopyError::Driver("no pending row for large-value chunk".into()))?;
        let slot = row
            .get_mut(column)
            .ok_or_else(|| CopyError::Driver(format!("no such column {column}")))?;
        match slot {
            Value::Bytes(buffer) => buffer.extend_from_slice(&chunk.data),
            other => *other = Value::Bytes(chunk.data.clone()),
        }
        self.pending_bytes += chunk.data.len();
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let batch = std::mem::take(&mut self.pending);
        self.pending_bytes = 0;
        self.execute_with_retry(batch)
    }

    fn commit(&mut self) -> Result<()> {
        self.conn()?.query_drop("COMMIT")?;
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        self.pending.clear();
        self.pending_bytes = 0;
        if let Some(conn) = self.conn.as_mut() {
            conn.query_drop("ROLLBACK")?;
        }
        Ok(())
    }
}

/// Compare the source cursor's columns against the target table's, position
/// by position. MySQL identifiers compare case-insensitively.
fn check_column_layout(
    target_name: &str,
    source: &[ColumnInfo],
    target: &[String],
) -> Result<()> {
    if target.len() != source.len() {
        return Err(CopyError::SchemaMismatch(format!(
            "source produces {} columns but target table {} has {}",
            source.len(),
            target_name,
            target.len()
        )));
    }
    for (source_column, target_column) in source.iter().zip(target) {
        if !source_column.name.eq_ignore_ascii_case(target_column) {
            return Err(CopyError::SchemaMismatch(format!(
                "column {} is '{}' on the source but '{}' in target table {}",
                source_column.ordinal + 1,
                source_column.name,
                target_column,
                target_name
            )));
        }
    }
    Ok(())
}

fn target_opts(endpoint: &MysqlEndpoint) -> Opts {
    let mut builder = OptsBuilder::new()
        .user(Some(&endpoint.user))
        .pass(Some(&endpoint.password));
    if let Some(socket) = &endpoint.socket {
        builder = builder.socket(Some(socket));
    } else {
        builder = builder
            .ip_or_hostname(Some(&endpoint.host))
            .tcp_port(endpoint.port);
    }
    Opts::from(builder)
}

/// A plain session on the target server, used by the trigger bracket.
pub fn connect_target(endpoint: &MysqlEndpoint) -> Result<Conn> {
    Conn::new(target_opts(endpoint)).map_err(|e| CopyError::Connect(format!("MySQL target: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::TypeFamily;

    fn source_columns(names: &[&str]) -> Vec<ColumnInfo> {
        names
            .iter()
            .enumerate()
            .map(|(ordinal, name)| ColumnInfo {
                ordinal,
                name: name.to_string(),
                family: TypeFamily::SignedInteger,
                type_name: "INT".into(),
                length: 0,
                scale: 0,
                nullable: true,
                charset: None,
            })
            .collect()
    }

    fn target_columns(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn matching_column_layout_passes() {
        let source = source_columns(&["id", "name", "email"]);
        let target = target_columns(&["id", "name", "email"]);
        assert!(check_column_layout("s.t", &source, &target).is_ok());
    }

    #[test]
    fn column_names_compare_case_insensitively() {
        let source = source_columns(&["ID", "Name"]);
        let target = target_columns(&["id", "name"]);
        assert!(check_column_layout("s.t", &source, &target).is_ok());
    }

    #[test]
    fn reordered_columns_are_a_schema_mismatch() {
        // Equal counts, same name set, different order: positional binding
        // would write into the wrong columns.
        let source = source_columns(&["id", "name", "email"]);
        let target = target_columns(&["id", "email", "name"]);
        let err = check_column_layout("s.t", &source, &target).unwrap_err();
        match err {
            CopyError::SchemaMismatch(msg) => {
                assert!(msg.contains("'name'") && msg.contains("'email'"), "{msg}");
            }
            other => panic!("expected a schema mismatch, got {other:?}"),
        }
    }

    #[test]
    fn column_count_mismatch_is_a_schema_mismatch() {
        let source = source_columns(&["id", "name"]);
        let target = target_columns(&["id", "name", "email"]);
        let err = check_column_layout("s.t", &source, &target).unwrap_err();
        assert!(matches!(err, CopyError::SchemaMismatch(_)));
    }

    #[test]
    fn batch_size_has_a_floor_of_one() {
        let mut target = MysqlTarget::new(MysqlEndpoint::default(), "test", false);
        target.set_batch_size(0);
        assert_eq!(target.batch_size, 1);
        target.set_batch_size(250);
        assert_eq!(target.batch_size, 250);
    }

    #[test]
    fn packet_budget_leaves_headroom() {
        let mut target = MysqlTarget::new(MysqlEndpoint::default(), "test", false);
        target.max_allowed_packet = 1000;
        assert_eq!(target.packet_budget(), 900);
    }
}
