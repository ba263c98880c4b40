//! MySQL source adapter.
//!
//! Streams rows over the native protocol one at a time: the cursor runs the
//! prepared-statement fetch loop on a pump thread with its own connection,
//! so a slow target never forces the full result set into memory. Column
//! metadata comes from the prepared statement before the first fetch.

use mysql::consts::{ColumnFlags, ColumnType};
use mysql::prelude::*;
use mysql::{Conn, Opts, OptsBuilder, Params, Value};
use tracing::warn;

use crate::config::MysqlEndpoint;
use crate::error::{CopyError, Result};
use crate::source::pump::CursorPump;
use crate::source::{
    apply_lob_policy, build_count, build_select, clamp_count, decode_text, CopySource, Dialect,
    SourceConfig, SourceCursor,
};
use crate::task::{CopySpec, TableTask};
use crate::value::{CellValue, ColumnInfo, SourceRow, TypeFamily};

/// Collation id MySQL reports for binary (non-character) payloads.
const BINARY_CHARSET: u16 = 63;

pub struct MysqlSource {
    endpoint: MysqlEndpoint,
    config: SourceConfig,
    conn: Option<Conn>,
}

impl MysqlSource {
    pub fn new(endpoint: MysqlEndpoint) -> Self {
        Self {
            endpoint,
            config: SourceConfig::default(),
            conn: None,
        }
    }

    fn conn(&mut self) -> Result<&mut Conn> {
        self.conn
            .as_mut()
            .ok_or_else(|| CopyError::Driver("MySQL source is not connected".into()))
    }
}

impl CopySource for MysqlSource {
    fn connect(&mut self) -> Result<()> {
        let mut conn = Conn::new(connection_opts(&self.endpoint))
            .map_err(|e| CopyError::Connect(format!("MySQL source: {e}")))?;
        init_session(&mut conn, self.config.force_utf8)?;
        self.conn = Some(conn);
        Ok(())
    }

    fn configure(&mut self, config: SourceConfig) {
        self.config = config;
    }

    fn count_rows(&mut self, schema: &str, table: &str, spec: &CopySpec) -> Result<u64> {
        let (sql, params) = build_count(schema, table, spec, Dialect::MySql, true);
        let conn = self.conn()?;
        let total: Option<u64> = conn.exec_first(&sql, bind_params(params))?;
        Ok(clamp_count(total.unwrap_or(0), spec))
    }

    fn open_cursor(&mut self, task: &TableTask) -> Result<Box<dyn SourceCursor>> {
        let stmt = build_select(task, Dialect::MySql, true);
        let endpoint = self.endpoint.clone();
        let config = self.config.clone();
        let thread_name = format!("mysql-cursor-{}", task.source_table);

        let pump = CursorPump::spawn(thread_name, move |session| {
            // The cursor owns its own connection so the worker's session stays
            // free for counting while rows stream.
            let mut conn = Conn::new(connection_opts(&endpoint))
                .map_err(|e| CopyError::Connect(format!("MySQL source: {e}")))?;
            init_session(&mut conn, config.force_utf8)?;

            let prepared = conn.prep(&stmt.sql)?;
            let columns = describe_columns(prepared.columns());
            session.columns(columns.clone());

            let result = conn.exec_iter(&prepared, bind_params(stmt.params))?;
            for row in result {
                let row = row?;
                let raw: Vec<Value> = row.unwrap();
                let mut values = Vec::with_capacity(raw.len());
                for (value, column) in raw.into_iter().zip(&columns) {
                    values.push(convert_value(value, column, &config)?);
                }
                if !session.row(SourceRow { values }) {
                    return Ok(());
                }
            }
            Ok(())
        })?;

        Ok(Box::new(MysqlCursor { pump }))
    }
}

struct MysqlCursor {
    pump: CursorPump,
}

impl SourceCursor for MysqlCursor {
    fn columns(&self) -> &[ColumnInfo] {
        self.pump.columns()
    }

    fn next_row(&mut self) -> Result<Option<SourceRow>> {
        self.pump.next_row()
    }
}

fn connection_opts(endpoint: &MysqlEndpoint) -> Opts {
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

fn init_session(conn: &mut Conn, force_utf8: bool) -> Result<()> {
    if force_utf8 {
        // No conversion: payload bytes arrive exactly as stored.
        conn.query_drop("SET NAMES binary")?;
    } else {
        conn.query_drop("SET NAMES utf8mb4")?;
    }
    Ok(())
}

fn bind_params(params: Vec<i64>) -> Params {
    if params.is_empty() {
        Params::Empty
    } else {
        Params::Positional(params.into_iter().map(Value::Int).collect())
    }
}

fn describe_columns(columns: &[mysql::Column]) -> Vec<ColumnInfo> {
    columns
        .iter()
        .enumerate()
        .map(|(ordinal, col)| {
            let charset = col.character_set();
            let family = classify(col.column_type(), col.flags(), charset);
            ColumnInfo {
                ordinal,
                name: col.name_str().to_string(),
                family,
                type_name: type_name(col.column_type()).to_string(),
                length: col.column_length(),
                scale: col.decimals(),
                nullable: !col.flags().contains(ColumnFlags::NOT_NULL_FLAG),
                charset: match family {
                    TypeFamily::Text => Some("utf8mb4".into()),
                    TypeFamily::Bytes => Some("binary".into()),
                    _ => None,
                },
            }
        })
        .collect()
}

fn classify(column_type: ColumnType, flags: ColumnFlags, charset: u16) -> TypeFamily {
    use ColumnType::*;
    match column_type {
        MYSQL_TYPE_TINY | MYSQL_TYPE_SHORT | MYSQL_TYPE_INT24 | MYSQL_TYPE_LONG
        | MYSQL_TYPE_LONGLONG | MYSQL_TYPE_YEAR => {
            if flags.contains(ColumnFlags::UNSIGNED_FLAG) {
                TypeFamily::UnsignedInteger
            } else {
                TypeFamily::SignedInteger
            }
        }
        MYSQL_TYPE_DECIMAL | MYSQL_TYPE_NEWDECIMAL => TypeFamily::Decimal,
        MYSQL_TYPE_FLOAT | MYSQL_TYPE_DOUBLE => TypeFamily::Float,
        MYSQL_TYPE_DATE | MYSQL_TYPE_NEWDATE => TypeFamily::Date,
        MYSQL_TYPE_TIME | MYSQL_TYPE_TIME2 => TypeFamily::Time,
        MYSQL_TYPE_DATETIME | MYSQL_TYPE_DATETIME2 | MYSQL_TYPE_TIMESTAMP
        | MYSQL_TYPE_TIMESTAMP2 => TypeFamily::Timestamp,
        MYSQL_TYPE_BIT | MYSQL_TYPE_GEOMETRY => TypeFamily::Bytes,
        _ => {
            if charset == BINARY_CHARSET {
                TypeFamily::Bytes
            } else {
                TypeFamily::Text
            }
        }
    }
}

fn type_name(column_type: ColumnType) -> &'static str {
    use ColumnType::*;
    match column_type {
        MYSQL_TYPE_TINY => "TINYINT",
        MYSQL_TYPE_SHORT => "SMALLINT",
        MYSQL_TYPE_INT24 => "MEDIUMINT",
        MYSQL_TYPE_LONG => "INT",
        MYSQL_TYPE_LONGLONG => "BIGINT",
        MYSQL_TYPE_YEAR => "YEAR",
        MYSQL_TYPE_DECIMAL | MYSQL_TYPE_NEWDECIMAL => "DECIMAL",
        MYSQL_TYPE_FLOAT => "FLOAT",
        MYSQL_TYPE_DOUBLE => "DOUBLE",
        MYSQL_TYPE_DATE | MYSQL_TYPE_NEWDATE => "DATE",
        MYSQL_TYPE_TIME | MYSQL_TYPE_TIME2 => "TIME",
        MYSQL_TYPE_DATETIME | MYSQL_TYPE_DATETIME2 => "DATETIME",
        MYSQL_TYPE_TIMESTAMP | MYSQL_TYPE_TIMESTAMP2 => "TIMESTAMP",
        MYSQL_TYPE_BIT => "BIT",
        MYSQL_TYPE_JSON => "JSON",
        MYSQL_TYPE_ENUM => "ENUM",
        MYSQL_TYPE_SET => "SET",
        MYSQL_TYPE_GEOMETRY => "GEOMETRY",
        MYSQL_TYPE_TINY_BLOB | MYSQL_TYPE_MEDIUM_BLOB | MYSQL_TYPE_LONG_BLOB
        | MYSQL_TYPE_BLOB => "BLOB",
        MYSQL_TYPE_VARCHAR | MYSQL_TYPE_VAR_STRING => "VARCHAR",
        MYSQL_TYPE_STRING => "CHAR",
        _ => "UNKNOWN",
    }
}

fn convert_value(value: Value, column: &ColumnInfo, config: &SourceConfig) -> Result<CellValue> {
    let cell = match value {
        Value::NULL => CellValue::Null,
        Value::Int(i) => CellValue::Int(i),
        Value::UInt(u) => CellValue::UInt(u),
        Value::Float(f) => CellValue::Double(f as f64),
        Value::Double(f) => CellValue::Double(f),
        Value::Date(year, month, day, hour, minute, second, micros) => {
            convert_temporal(column, year, month, day, hour, minute, second, micros)
        }
        Value::Time(negative, days, hours, minutes, seconds, micros) => CellValue::Time {
            negative,
            hours: days * 24 + hours as u32,
            minutes,
            seconds,
            micro_seconds: micros,
        },
        Value::Bytes(bytes) => match column.family {
            TypeFamily::Decimal => CellValue::Decimal(
                String::from_utf8(bytes)
                    .map_err(|_| CopyError::Encoding(format!(
                        "column '{}' returned a non-ASCII decimal",
                        column.name
                    )))?,
            ),
            TypeFamily::Text => {
                if bytes.len() > config.max_blob_chunk_size
                    || bytes.len() > config.max_parameter_size
                {
                    apply_lob_policy(bytes, column, config)?
                } else {
                    decode_text(bytes, column, config)?
                }
            }
            TypeFamily::Bytes => apply_lob_policy(bytes, column, config)?,
            // Text-protocol leftovers for numeric columns; the target parses
            // the digits.
            _ => CellValue::Bytes(bytes),
        },
    };
    Ok(cell)
}

#[allow(clippy::too_many_arguments)]
fn convert_temporal(
    column: &ColumnInfo,
    year: u16,
    month: u8,
    day: u8,
    hour: u8,
    minute: u8,
    second: u8,
    micros: u32,
) -> CellValue {
    use chrono::{NaiveDate, NaiveDateTime};

    // Zero dates have no chrono representation; they travel as NULL.
    let date = NaiveDate::from_ymd_opt(year as i32, month as u32, day as u32);
    let Some(date) = date else {
        if year != 0 || month != 0 || day != 0 {
            warn!(column = %column.name, "invalid date value replaced with NULL");
        }
        return CellValue::Null;
    };

    if column.family == TypeFamily::Date {
        return CellValue::Date(date);
    }
    let datetime: Option<NaiveDateTime> =
        date.and_hms_micro_opt(hour as u32, minute as u32, second as u32, micros);
    match datetime {
        Some(dt) => CellValue::DateTime(dt),
        None => CellValue::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn column(family: TypeFamily) -> ColumnInfo {
        ColumnInfo {
            ordinal: 0,
            name: "c".into(),
            family,
            type_name: "TEST".into(),
            length: 0,
            scale: 0,
            nullable: true,
            charset: None,
        }
    }

    #[test]
    fn integer_types_classify_by_sign_flag() {
        assert_eq!(
            classify(ColumnType::MYSQL_TYPE_LONG, ColumnFlags::empty(), 63),
            TypeFamily::SignedInteger
        );
        assert_eq!(
            classify(
                ColumnType::MYSQL_TYPE_LONGLONG,
                ColumnFlags::UNSIGNED_FLAG,
                63
            ),
            TypeFamily::UnsignedInteger
        );
    }

    #[test]
    fn string_types_classify_by_charset() {
        assert_eq!(
            classify(ColumnType::MYSQL_TYPE_BLOB, ColumnFlags::empty(), 63),
            TypeFamily::Bytes
        );
        assert_eq!(
            classify(ColumnType::MYSQL_TYPE_BLOB, ColumnFlags::empty(), 255),
            TypeFamily::Text
        );
        assert_eq!(
            classify(ColumnType::MYSQL_TYPE_VAR_STRING, ColumnFlags::empty(), 224),
            TypeFamily::Text
        );
    }

    #[test]
    fn zero_dates_become_null() {
        let cell = convert_temporal(&column(TypeFamily::Date), 0, 0, 0, 0, 0, 0, 0);
        assert!(matches!(cell, CellValue::Null));
    }

    #[test]
    fn datetimes_keep_microseconds() {
        let cell = convert_temporal(&column(TypeFamily::Timestamp), 2020, 6, 1, 12, 30, 5, 999_999);
        match cell {
            CellValue::DateTime(dt) => {
                use chrono::Timelike;
                assert_eq!(dt.nanosecond(), 999_999_000);
            }
            other => panic!("expected a datetime, got {other:?}"),
        }
    }

    #[test]
    fn negative_time_spans_survive_conversion() {
        let config = SourceConfig::default();
        let cell = convert_value(
            Value::Time(true, 1, 10, 5, 1, 0),
            &column(TypeFamily::Time),
            &config,
        )
        .unwrap();
        match cell {
            CellValue::Time {
                negative, hours, ..
            } => {
                assert!(negative);
                assert_eq!(hours, 34);
            }
            other => panic!("expected a time, got {other:?}"),
        }
    }

    #[test]
    fn blob_larger_than_chunk_bound_becomes_a_handle() {
        let config = SourceConfig {
            max_blob_chunk_size: 8,
            max_parameter_size: 1024,
            ..SourceConfig::default()
        };
        let cell = convert_value(
            Value::Bytes(vec![7u8; 100]),
            &column(TypeFamily::Bytes),
            &config,
        )
        .unwrap();
        assert!(matches!(cell, CellValue::Lob(_)));
    }
}
