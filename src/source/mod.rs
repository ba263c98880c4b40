//! Source adapters.
//!
//! Workers see every source database through the [`CopySource`] /
//! [`SourceCursor`] pair: schema introspection at cursor open, forward-only
//! row iteration, counting, and chunked reads of large values. Adapters for
//! the native MySQL protocol, ODBC and pluggable drivers live in the
//! submodules.

pub mod dbapi;
pub mod mysql;
#[cfg(feature = "odbc")]
pub mod odbc;
pub(crate) mod pump;

use tracing::warn;

use crate::error::{CopyError, Result};
use crate::task::{CopySpec, TableTask};
use crate::value::{CellValue, ColumnInfo, LobChunk, LobHandle, SourceRow};

/// Limits and charset policy applied to a source before cursors open.
#[derive(Debug, Clone)]
pub struct SourceConfig {
    /// Upper bound for one [`LobChunk`], derived from the target's
    /// `max_allowed_packet`.
    pub max_blob_chunk_size: usize,
    /// Upper bound for one whole parameter value, derived from the target's
    /// `max_long_data_size`.
    pub max_parameter_size: usize,
    /// Oversized values fail the task instead of being truncated.
    pub abort_on_oversized_blobs: bool,
    /// Pass source bytes through as UTF-8 without transcoding or validation.
    pub force_utf8: bool,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            max_blob_chunk_size: 1024 * 1024,
            max_parameter_size: 64 * 1024 * 1024,
            abort_on_oversized_blobs: false,
            force_utf8: false,
        }
    }
}

/// A streaming source database session, owned by one worker.
pub trait CopySource: Send {
    /// Establish the session. Configuration must already be applied.
    fn connect(&mut self) -> Result<()>;

    /// Apply limits and charset policy; called before `connect`/`open_cursor`.
    fn configure(&mut self, config: SourceConfig);

    /// Count the rows the given spec would copy.
    fn count_rows(&mut self, schema: &str, table: &str, spec: &CopySpec) -> Result<u64>;

    /// Prepare a streaming cursor for one task. Implementations never buffer
    /// the full result set.
    fn open_cursor(&mut self, task: &TableTask) -> Result<Box<dyn SourceCursor>>;
}

/// A forward-only cursor over one task's result set.
pub trait SourceCursor: Send {
    /// Column descriptors, available before the first fetch.
    fn columns(&self) -> &[ColumnInfo];

    /// Produce the next row, or `None` at end-of-stream.
    fn next_row(&mut self) -> Result<Option<SourceRow>>;

    /// Stream one bounded chunk of a large value. The end of the value is
    /// signalled by a short (possibly empty) final chunk.
    fn read_lob_chunk(
        &mut self,
        row: &SourceRow,
        column: usize,
        offset: u64,
        max_size: usize,
    ) -> Result<LobChunk> {
        match row.values.get(column) {
            Some(CellValue::Lob(handle)) => Ok(handle.chunk(offset, max_size)),
            Some(_) => Err(CopyError::Driver(format!(
                "column {column} does not hold a large value"
            ))),
            None => Err(CopyError::Driver(format!("no such column {column}"))),
        }
    }
}

/// Identifier quoting dialect for generated SQL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// Backtick quoting, `LIMIT` supported.
    MySql,
    /// Double-quote quoting, row limits enforced client-side.
    Ansi,
}

pub(crate) fn quote_ident(name: &str, dialect: Dialect) -> String {
    match dialect {
        Dialect::MySql => format!("`{}`", name.replace('`', "``")),
        Dialect::Ansi => format!("\"{}\"", name.replace('"', "\"\"")),
    }
}

fn quote_table(schema: &str, table: &str, dialect: Dialect) -> String {
    format!(
        "{}.{}",
        quote_ident(schema, dialect),
        quote_ident(table, dialect)
    )
}

/// A generated statement plus any bound range parameters and a row limit that
/// the dialect could not express in SQL.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SelectStatement {
    pub sql: String,
    pub params: Vec<i64>,
    pub client_row_limit: Option<u64>,
}

/// Render the range predicate; `placeholders` selects `?` binding over
/// inlined literals (the bounds are integers either way).
fn range_predicate(
    key: &str,
    start: i64,
    end: i64,
    dialect: Dialect,
    placeholders: bool,
    params: &mut Vec<i64>,
) -> Option<String> {
    let key = quote_ident(key, dialect);
    let bind = |value: i64, params: &mut Vec<i64>| -> String {
        if placeholders {
            params.push(value);
            "?".to_string()
        } else {
            value.to_string()
        }
    };
    match (start >= 0, end >= 0) {
        (true, true) => {
            let lo = bind(start, params);
            let hi = bind(end, params);
            Some(format!("{key} BETWEEN {lo} AND {hi}"))
        }
        (true, false) => {
            let lo = bind(start, params);
            Some(format!("{key} >= {lo}"))
        }
        (false, true) => {
            let hi = bind(end, params);
            Some(format!("{key} <= {hi}"))
        }
        (false, false) => None,
    }
}

/// Build the streaming select for one task, honouring its copy spec.
pub(crate) fn build_select(task: &TableTask, dialect: Dialect, placeholders: bool) -> SelectStatement {
    let projection = if task.select_expression.trim().is_empty() {
        "*"
    } else {
        task.select_expression.trim()
    };
    let mut sql = format!(
        "SELECT {} FROM {}",
        projection,
        quote_table(&task.source_schema, &task.source_table, dialect)
    );
    let mut params = Vec::new();
    let mut client_row_limit = None;

    match &task.spec {
        CopySpec::All => {}
        CopySpec::Range { key, start, end } => {
            if let Some(predicate) =
                range_predicate(key, *start, *end, dialect, placeholders, &mut params)
            {
                // Keep any caller-supplied filter by AND-ing onto it.
                if sql.to_ascii_uppercase().contains(" WHERE ") {
                    sql.push_str(" AND ");
                } else {
                    sql.push_str(" WHERE ");
                }
                sql.push_str(&predicate);
            }
        }
        CopySpec::Count { rows } => match dialect {
            Dialect::MySql => sql.push_str(&format!(" LIMIT {rows}")),
            Dialect::Ansi => client_row_limit = Some(*rows),
        },
    }

    SelectStatement {
        sql,
        params,
        client_row_limit,
    }
}

/// Build the counting statement for one spec. `CopyCount` still counts the
/// whole table; callers clamp to the requested row count.
pub(crate) fn build_count(
    schema: &str,
    table: &str,
    spec: &CopySpec,
    dialect: Dialect,
    placeholders: bool,
) -> (String, Vec<i64>) {
    let mut sql = format!("SELECT COUNT(*) FROM {}", quote_table(schema, table, dialect));
    let mut params = Vec::new();
    if let CopySpec::Range { key, start, end } = spec {
        if let Some(predicate) =
            range_predicate(key, *start, *end, dialect, placeholders, &mut params)
        {
            sql.push_str(" WHERE ");
            sql.push_str(&predicate);
        }
    }
    (sql, params)
}

/// Clamp a raw `COUNT(*)` result to the spec's row budget.
pub(crate) fn clamp_count(total: u64, spec: &CopySpec) -> u64 {
    match spec {
        CopySpec::Count { rows } => total.min(*rows),
        _ => total,
    }
}

/// Apply the large-value policy to one fully fetched payload.
///
/// Values above `max_parameter_size` abort or truncate per configuration;
/// values above the chunk bound come back as handles so the worker drains
/// them through `read_lob_chunk`.
pub(crate) fn apply_lob_policy(
    payload: Vec<u8>,
    column: &ColumnInfo,
    config: &SourceConfig,
) -> Result<CellValue> {
    let mut payload = payload;
    let mut truncated = false;
    if payload.len() > config.max_parameter_size {
        if config.abort_on_oversized_blobs {
            return Err(CopyError::OversizedBlob(format!(
                "column '{}' holds {} bytes, parameter limit is {}",
                column.name,
                payload.len(),
                config.max_parameter_size
            )));
        }
        warn!(
            column = %column.name,
            size = payload.len(),
            limit = config.max_parameter_size,
            "truncating oversized value"
        );
        payload.truncate(config.max_parameter_size);
        truncated = true;
    }
    if payload.len() > config.max_blob_chunk_size {
        Ok(CellValue::Lob(LobHandle::new(payload, truncated)))
    } else {
        Ok(CellValue::Bytes(payload))
    }
}

/// Decode a character payload under the charset policy.
pub(crate) fn decode_text(
    payload: Vec<u8>,
    column: &ColumnInfo,
    config: &SourceConfig,
) -> Result<CellValue> {
    if config.force_utf8 {
        // The operator asserts the bytes are already UTF-8; pass them through.
        return Ok(CellValue::Bytes(payload));
    }
    match String::from_utf8(payload) {
        Ok(text) => Ok(CellValue::Text(text)),
        Err(_) => Err(CopyError::Encoding(format!(
            "column '{}' holds data that is not valid UTF-8 \
             (consider --force-utf8-for-source)",
            column.name
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::TypeFamily;

    fn task(spec: CopySpec) -> TableTask {
        TableTask {
            source_schema: "s".into(),
            source_table: "t".into(),
            target_schema: "s".into(),
            target_table: "t".into(),
            select_expression: "*".into(),
            spec,
        }
    }

    fn column() -> ColumnInfo {
        ColumnInfo {
            ordinal: 0,
            name: "photo".into(),
            family: TypeFamily::Bytes,
            type_name: "BLOB".into(),
            length: 0,
            scale: 0,
            nullable: true,
            charset: None,
        }
    }

    #[test]
    fn select_for_copy_all() {
        let stmt = build_select(&task(CopySpec::All), Dialect::MySql, true);
        assert_eq!(stmt.sql, "SELECT * FROM `s`.`t`");
        assert!(stmt.params.is_empty());
        assert!(stmt.client_row_limit.is_none());
    }

    #[test]
    fn select_for_bounded_range_binds_both_ends() {
        let spec = CopySpec::Range {
            key: "id".into(),
            start: 1,
            end: 333,
        };
        let stmt = build_select(&task(spec), Dialect::MySql, true);
        assert_eq!(stmt.sql, "SELECT * FROM `s`.`t` WHERE `id` BETWEEN ? AND ?");
        assert_eq!(stmt.params, vec![1, 333]);
    }

    #[test]
    fn select_for_open_ended_ranges() {
        let upper_open = CopySpec::Range {
            key: "id".into(),
            start: 667,
            end: -1,
        };
        let stmt = build_select(&task(upper_open), Dialect::MySql, false);
        assert_eq!(stmt.sql, "SELECT * FROM `s`.`t` WHERE `id` >= 667");

        let lower_open = CopySpec::Range {
            key: "id".into(),
            start: -1,
            end: 333,
        };
        let stmt = build_select(&task(lower_open), Dialect::Ansi, false);
        assert_eq!(stmt.sql, "SELECT * FROM \"s\".\"t\" WHERE \"id\" <= 333");

        let unbounded = CopySpec::Range {
            key: "id".into(),
            start: -1,
            end: -1,
        };
        let stmt = build_select(&task(unbounded), Dialect::MySql, true);
        assert_eq!(stmt.sql, "SELECT * FROM `s`.`t`");
    }

    #[test]
    fn select_for_row_count_uses_limit_or_client_cap() {
        let spec = CopySpec::Count { rows: 10 };
        let stmt = build_select(&task(spec.clone()), Dialect::MySql, true);
        assert_eq!(stmt.sql, "SELECT * FROM `s`.`t` LIMIT 10");
        assert!(stmt.client_row_limit.is_none());

        let stmt = build_select(&task(spec), Dialect::Ansi, false);
        assert_eq!(stmt.sql, "SELECT * FROM \"s\".\"t\"");
        assert_eq!(stmt.client_row_limit, Some(10));
    }

    #[test]
    fn range_filter_is_anded_onto_existing_where() {
        let mut t = task(CopySpec::Range {
            key: "id".into(),
            start: 0,
            end: 10,
        });
        t.select_expression = "* FROM `s`.`overridden` WHERE deleted = 0 --".into();
        let stmt = build_select(&t, Dialect::MySql, false);
        assert!(stmt.sql.contains(" AND `id` BETWEEN 0 AND 10"));
    }

    #[test]
    fn count_statement_honours_range() {
        let spec = CopySpec::Range {
            key: "seq".into(),
            start: -1,
            end: 42,
        };
        let (sql, params) = build_count("s", "t", &spec, Dialect::MySql, true);
        assert_eq!(sql, "SELECT COUNT(*) FROM `s`.`t` WHERE `seq` <= ?");
        assert_eq!(params, vec![42]);
    }

    #[test]
    fn count_clamps_to_requested_rows() {
        assert_eq!(clamp_count(250, &CopySpec::Count { rows: 100 }), 100);
        assert_eq!(clamp_count(50, &CopySpec::Count { rows: 100 }), 50);
        assert_eq!(clamp_count(250, &CopySpec::All), 250);
    }

    #[test]
    fn backticks_in_identifiers_are_escaped() {
        assert_eq!(quote_ident("we`ird", Dialect::MySql), "`we``ird`");
        assert_eq!(quote_ident("we\"ird", Dialect::Ansi), "\"we\"\"ird\"");
    }

    #[test]
    fn oversized_value_aborts_when_requested() {
        let config = SourceConfig {
            max_parameter_size: 16,
            max_blob_chunk_size: 8,
            abort_on_oversized_blobs: true,
            force_utf8: false,
        };
        let err = apply_lob_policy(vec![0u8; 17], &column(), &config).unwrap_err();
        assert!(matches!(err, CopyError::OversizedBlob(_)));
    }

    #[test]
    fn oversized_value_truncates_by_default() {
        let config = SourceConfig {
            max_parameter_size: 16,
            max_blob_chunk_size: 8,
            abort_on_oversized_blobs: false,
            force_utf8: false,
        };
        match apply_lob_policy(vec![0u8; 64], &column(), &config).unwrap() {
            CellValue::Lob(handle) => {
                assert_eq!(handle.len(), 16);
                assert!(handle.truncated);
            }
            other => panic!("expected a large-value handle, got {other:?}"),
        }
    }

    #[test]
    fn small_values_stay_inline() {
        let config = SourceConfig::default();
        match apply_lob_policy(vec![1, 2, 3], &column(), &config).unwrap() {
            CellValue::Bytes(b) => assert_eq!(b, vec![1, 2, 3]),
            other => panic!("expected inline bytes, got {other:?}"),
        }
    }

    #[test]
    fn invalid_utf8_is_an_encoding_error_unless_forced() {
        let bad = vec![0xff, 0xfe, 0x41];
        let mut config = SourceConfig::default();

        let err = decode_text(bad.clone(), &column(), &config).unwrap_err();
        assert!(matches!(err, CopyError::Encoding(_)));

        config.force_utf8 = true;
        match decode_text(bad.clone(), &column(), &config).unwrap() {
            CellValue::Bytes(b) => assert_eq!(b, bad),
            other => panic!("expected raw passthrough, got {other:?}"),
        }
    }
}
