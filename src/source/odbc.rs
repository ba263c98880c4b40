//! ODBC source adapter.
//!
//! One ODBC 3 environment per process, initialised lazily and shared by every
//! worker; each cursor owns its own connection and statement handle, driven on
//! a pump thread so all driver calls for one result set stay on one thread.
//! Character data arrives in the driver manager's narrow encoding and is
//! treated as UTF-8; large values are drained through `SQLGetData`.

use std::sync::OnceLock;

use odbc_api::{ColumnDescription, ConnectionOptions, Cursor, DataType, Environment, Nullability};
use tracing::warn;

use crate::error::{CopyError, Result};
use crate::source::pump::CursorPump;
use crate::source::{
    apply_lob_policy, build_count, build_select, clamp_count, decode_text, CopySource, Dialect,
    SourceConfig, SourceCursor,
};
use crate::task::{CopySpec, TableTask};
use crate::value::{CellValue, ColumnInfo, SourceRow, TypeFamily};

static ODBC_ENV: OnceLock<Environment> = OnceLock::new();

fn environment() -> Result<&'static Environment> {
    if let Some(env) = ODBC_ENV.get() {
        return Ok(env);
    }
    let env = Environment::new()
        .map_err(|e| CopyError::Connect(format!("ODBC environment: {e}")))?;
    Ok(ODBC_ENV.get_or_init(|| env))
}

pub struct OdbcSource {
    connstring: String,
    password: String,
    config: SourceConfig,
}

impl OdbcSource {
    pub fn new(connstring: String, password: String) -> Self {
        Self {
            connstring,
            password,
            config: SourceConfig::default(),
        }
    }

    /// The connection string is opaque; the password is spliced in only when
    /// the operator did not embed one.
    fn effective_connstring(&self) -> String {
        if self.password.is_empty() || self.connstring.to_ascii_uppercase().contains("PWD=") {
            self.connstring.clone()
        } else {
            format!("{};PWD={}", self.connstring.trim_end_matches(';'), self.password)
        }
    }
}

impl CopySource for OdbcSource {
    fn connect(&mut self) -> Result<()> {
        // Cursors own their connections; connecting here just validates the
        // connection string and credentials early.
        let env = environment()?;
        env.connect_with_connection_string(
            &self.effective_connstring(),
            ConnectionOptions::default(),
        )
        .map_err(|e| CopyError::Connect(format!("ODBC source: {e}")))?;
        Ok(())
    }

    fn configure(&mut self, config: SourceConfig) {
        self.config = config;
    }

    fn count_rows(&mut self, schema: &str, table: &str, spec: &CopySpec) -> Result<u64> {
        let (sql, _) = build_count(schema, table, spec, Dialect::Ansi, false);
        let env = environment()?;
        let conn = env
            .connect_with_connection_string(
                &self.effective_connstring(),
                ConnectionOptions::default(),
            )
            .map_err(|e| CopyError::Connect(format!("ODBC source: {e}")))?;

        let cursor = conn
            .execute(&sql, ())
            .map_err(odbc_err)?
            .ok_or_else(|| CopyError::Driver("count query produced no result set".into()))?;
        let total = read_count(cursor)?;
        Ok(clamp_count(total, spec))
    }

    fn open_cursor(&mut self, task: &TableTask) -> Result<Box<dyn SourceCursor>> {
        let stmt = build_select(task, Dialect::Ansi, false);
        let connstring = self.effective_connstring();
        let config = self.config.clone();
        let thread_name = format!("odbc-cursor-{}", task.source_table);

        let pump = CursorPump::spawn(thread_name, move |session| {
            let env = environment()?;
            let conn = env
                .connect_with_connection_string(&connstring, ConnectionOptions::default())
                .map_err(|e| CopyError::Connect(format!("ODBC source: {e}")))?;

            let mut cursor = conn
                .execute(&stmt.sql, ())
                .map_err(odbc_err)?
                .ok_or_else(|| CopyError::Driver("select produced no result set".into()))?;

            let columns = describe_columns(&mut cursor)?;
            session.columns(columns.clone());

            let mut produced = 0u64;
            loop {
                if let Some(limit) = stmt.client_row_limit {
                    if produced >= limit {
                        break;
                    }
                }
                let Some(mut row) = cursor.next_row().map_err(odbc_err)? else {
                    break;
                };
                let mut values = Vec::with_capacity(columns.len());
                for column in &columns {
                    values.push(fetch_value(&mut row, column, &config)?);
                }
                if !session.row(SourceRow { values }) {
                    return Ok(());
                }
                produced += 1;
            }
            Ok(())
        })?;

        Ok(Box::new(OdbcCursor { pump }))
    }
}

struct OdbcCursor {
    pump: CursorPump,
}

impl SourceCursor for OdbcCursor {
    fn columns(&self) -> &[ColumnInfo] {
        self.pump.columns()
    }

    fn next_row(&mut self) -> Result<Option<SourceRow>> {
        self.pump.next_row()
    }
}

fn odbc_err(err: odbc_api::Error) -> CopyError {
    CopyError::Driver(format!("ODBC: {err}"))
}

fn read_count(mut cursor: impl Cursor) -> Result<u64> {
    let mut row = cursor
        .next_row()
        .map_err(odbc_err)?
        .ok_or_else(|| CopyError::Driver("count query returned no rows".into()))?;
    let mut value = odbc_api::Nullable::<i64>::null();
    row.get_data(1, &mut value).map_err(odbc_err)?;
    match value.into_opt() {
        Some(n) if n >= 0 => Ok(n as u64),
        Some(n) => Err(CopyError::Driver(format!("negative row count {n}"))),
        None => Ok(0),
    }
}

fn describe_columns(cursor: &mut impl Cursor) -> Result<Vec<ColumnInfo>> {
    let count = cursor.num_result_cols().map_err(odbc_err)? as u16;
    let mut columns = Vec::with_capacity(count as usize);
    for index in 1..=count {
        let mut description = ColumnDescription::default();
        cursor
            .describe_col(index, &mut description)
            .map_err(odbc_err)?;
        let name = description
            .name_to_string()
            .unwrap_or_else(|_| format!("column_{index}"));
        let family = classify(&description.data_type);
        columns.push(ColumnInfo {
            ordinal: (index - 1) as usize,
            name,
            family,
            type_name: format!("{:?}", description.data_type),
            length: 0,
            scale: 0,
            nullable: !matches!(description.nullability, Nullability::NoNulls),
            charset: match family {
                TypeFamily::Text => Some("utf8".into()),
                TypeFamily::Bytes => Some("binary".into()),
                _ => None,
            },
        });
    }
    Ok(columns)
}

/// Classify an ODBC SQL type into one of the nine families.
fn classify(data_type: &DataType) -> TypeFamily {
    match data_type {
        DataType::TinyInt
        | DataType::SmallInt
        | DataType::Integer
        | DataType::BigInt => TypeFamily::SignedInteger,
        DataType::Bit => TypeFamily::UnsignedInteger,
        DataType::Numeric { .. } | DataType::Decimal { .. } => TypeFamily::Decimal,
        DataType::Real | DataType::Float { .. } | DataType::Double => TypeFamily::Float,
        DataType::Date => TypeFamily::Date,
        DataType::Time { .. } => TypeFamily::Time,
        DataType::Timestamp { .. } => TypeFamily::Timestamp,
        DataType::Binary { .. }
        | DataType::Varbinary { .. }
        | DataType::LongVarbinary { .. } => TypeFamily::Bytes,
        _ => TypeFamily::Text,
    }
}

fn fetch_value(
    row: &mut odbc_api::CursorRow<'_>,
    column: &ColumnInfo,
    config: &SourceConfig,
) -> Result<CellValue> {
    use chrono::NaiveDate;

    let index = (column.ordinal + 1) as u16;
    let cell = match column.family {
        TypeFamily::SignedInteger | TypeFamily::UnsignedInteger => {
            let mut value = odbc_api::Nullable::<i64>::null();
            row.get_data(index, &mut value).map_err(odbc_err)?;
            match value.into_opt() {
                Some(n) => CellValue::Int(n),
                None => CellValue::Null,
            }
        }
        TypeFamily::Float => {
            let mut value = odbc_api::Nullable::<f64>::null();
            row.get_data(index, &mut value).map_err(odbc_err)?;
            match value.into_opt() {
                Some(f) => CellValue::Double(f),
                None => CellValue::Null,
            }
        }
        TypeFamily::Decimal => {
            let mut buffer = Vec::new();
            if row.get_text(index, &mut buffer).map_err(odbc_err)? {
                CellValue::Decimal(String::from_utf8(buffer).map_err(|_| {
                    CopyError::Encoding(format!(
                        "column '{}' returned a non-ASCII decimal",
                        column.name
                    ))
                })?)
            } else {
                CellValue::Null
            }
        }
        TypeFamily::Date => {
            let mut value = odbc_api::Nullable::<odbc_api::sys::Date>::null();
            row.get_data(index, &mut value).map_err(odbc_err)?;
            match value.into_opt() {
                Some(d) => {
                    match NaiveDate::from_ymd_opt(d.year as i32, d.month as u32, d.day as u32) {
                        Some(date) => CellValue::Date(date),
                        None => {
                            warn!(column = %column.name, "invalid date value replaced with NULL");
                            CellValue::Null
                        }
                    }
                }
                None => CellValue::Null,
            }
        }
        TypeFamily::Time => {
            let mut value = odbc_api::Nullable::<odbc_api::sys::Time>::null();
            row.get_data(index, &mut value).map_err(odbc_err)?;
            match value.into_opt() {
                Some(t) => CellValue::Time {
                    negative: false,
                    hours: t.hour as u32,
                    minutes: t.minute as u8,
                    seconds: t.second as u8,
                    micro_seconds: 0,
                },
                None => CellValue::Null,
            }
        }
        TypeFamily::Timestamp => {
            let mut value = odbc_api::Nullable::<odbc_api::sys::Timestamp>::null();
            row.get_data(index, &mut value).map_err(odbc_err)?;
            match value.into_opt() {
                Some(ts) => {
                    let datetime =
                        NaiveDate::from_ymd_opt(ts.year as i32, ts.month as u32, ts.day as u32)
                            .and_then(|date| {
                                date.and_hms_nano_opt(
                                    ts.hour as u32,
                                    ts.minute as u32,
                                    ts.second as u32,
                                    ts.fraction,
                                )
                            });
                    match datetime {
                        Some(dt) => CellValue::DateTime(dt),
                        None => {
                            warn!(column = %column.name, "invalid timestamp replaced with NULL");
                            CellValue::Null
                        }
                    }
                }
                None => CellValue::Null,
            }
        }
        TypeFamily::Bytes => {
            let mut buffer = Vec::new();
            if row.get_binary(index, &mut buffer).map_err(odbc_err)? {
                apply_lob_policy(buffer, column, config)?
            } else {
                CellValue::Null
            }
        }
        TypeFamily::Text => {
            let mut buffer = Vec::new();
            if row.get_text(index, &mut buffer).map_err(odbc_err)? {
                if buffer.len() > config.max_blob_chunk_size
                    || buffer.len() > config.max_parameter_size
                {
                    apply_lob_policy(buffer, column, config)?
                } else {
                    decode_text(buffer, column, config)?
                }
            } else {
                CellValue::Null
            }
        }
    };
    Ok(cell)
}
