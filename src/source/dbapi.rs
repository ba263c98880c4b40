//! Pluggable generic-driver source adapter.
//!
//! The adapter speaks to any driver implementing the [`DbDriver`] /
//! [`DbConnection`] / [`DbCursor`] contract: connect with an opaque
//! connection string, open a cursor for a statement, describe its columns,
//! fetch rows one at a time. Drivers register in a process-wide registry
//! keyed by connection-string scheme; a SQLite driver ships built in and is
//! the workhorse of the test suite.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock};

use crate::error::{CopyError, Result};
use crate::source::pump::CursorPump;
use crate::source::{
    apply_lob_policy, build_count, build_select, clamp_count, CopySource, Dialect, SourceConfig,
    SourceCursor,
};
use crate::task::{CopySpec, TableTask};
use crate::value::{CellValue, ColumnInfo, SourceRow, TypeFamily};

/// A named driver able to open connections for its scheme.
pub trait DbDriver: Send + Sync {
    /// Connection-string scheme this driver claims, e.g. `sqlite`.
    fn scheme(&self) -> &str;

    fn connect(&self, connstring: &str, password: &str) -> Result<Box<dyn DbConnection>>;
}

impl std::fmt::Debug for dyn DbDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbDriver").field("scheme", &self.scheme()).finish()
    }
}

pub trait DbConnection: Send {
    /// Execute a statement and return a forward-only cursor over its rows.
    fn open_cursor(&mut self, sql: &str) -> Result<Box<dyn DbCursor>>;
}

pub trait DbCursor: Send {
    /// Column descriptors, available before the first fetch.
    fn describe(&self) -> &[ColumnInfo];

    fn fetch_row(&mut self) -> Result<Option<SourceRow>>;
}

fn registry() -> &'static Mutex<HashMap<String, Arc<dyn DbDriver>>> {
    static REGISTRY: OnceLock<Mutex<HashMap<String, Arc<dyn DbDriver>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        let mut drivers: HashMap<String, Arc<dyn DbDriver>> = HashMap::new();
        drivers.insert("sqlite".into(), Arc::new(SqliteDriver));
        Mutex::new(drivers)
    })
}

/// Register a driver, replacing any earlier claim on the same scheme.
pub fn register_driver(driver: Arc<dyn DbDriver>) {
    registry()
        .lock()
        .expect("driver registry poisoned")
        .insert(driver.scheme().to_string(), driver);
}

fn find_driver(connstring: &str) -> Result<Arc<dyn DbDriver>> {
    let scheme = connstring.split(':').next().unwrap_or("");
    registry()
        .lock()
        .expect("driver registry poisoned")
        .get(scheme)
        .cloned()
        .ok_or_else(|| {
            CopyError::Connect(format!(
                "no driver registered for connection string scheme '{scheme}'"
            ))
        })
}

/// Source adapter delegating to a registered driver.
pub struct DbApiSource {
    connstring: String,
    password: String,
    config: SourceConfig,
    conn: Option<Box<dyn DbConnection>>,
}

impl DbApiSource {
    pub fn new(connstring: String, password: String) -> Self {
        Self {
            connstring,
            password,
            config: SourceConfig::default(),
            conn: None,
        }
    }

    fn conn(&mut self) -> Result<&mut Box<dyn DbConnection>> {
        self.conn
            .as_mut()
            .ok_or_else(|| CopyError::Driver("driver source is not connected".into()))
    }
}

impl CopySource for DbApiSource {
    fn connect(&mut self) -> Result<()> {
        let driver = find_driver(&self.connstring)?;
        self.conn = Some(driver.connect(&self.connstring, &self.password)?);
        Ok(())
    }

    fn configure(&mut self, config: SourceConfig) {
        self.config = config;
    }

    fn count_rows(&mut self, schema: &str, table: &str, spec: &CopySpec) -> Result<u64> {
        let (sql, _) = build_count(schema, table, spec, Dialect::Ansi, false);
        let mut cursor = self.conn()?.open_cursor(&sql)?;
        let row = cursor
            .fetch_row()?
            .ok_or_else(|| CopyError::Driver("count query returned no rows".into()))?;
        let total = match row.values.first() {
            Some(CellValue::Int(n)) if *n >= 0 => *n as u64,
            Some(CellValue::UInt(n)) => *n,
            other => {
                return Err(CopyError::Driver(format!(
                    "count query returned a non-integer: {other:?}"
                )))
            }
        };
        Ok(clamp_count(total, spec))
    }

    fn open_cursor(&mut self, task: &TableTask) -> Result<Box<dyn SourceCursor>> {
        let stmt = build_select(task, Dialect::Ansi, false);
        let config = self.config.clone();
        let inner = self.conn()?.open_cursor(&stmt.sql)?;
        let columns = inner.describe().to_vec();
        Ok(Box::new(DbApiCursor {
            inner,
            columns,
            config,
            remaining: stmt.client_row_limit,
        }))
    }
}

/// Applies the size and charset policy on top of a raw driver cursor, and
/// enforces row limits the dialect could not push into SQL.
struct DbApiCursor {
    inner: Box<dyn DbCursor>,
    columns: Vec<ColumnInfo>,
    config: SourceConfig,
    remaining: Option<u64>,
}

impl SourceCursor for DbApiCursor {
    fn columns(&self) -> &[ColumnInfo] {
        &self.columns
    }

    fn next_row(&mut self) -> Result<Option<SourceRow>> {
        if self.remaining == Some(0) {
            return Ok(None);
        }
        let Some(row) = self.inner.fetch_row()? else {
            return Ok(None);
        };
        if let Some(remaining) = &mut self.remaining {
            *remaining -= 1;
        }

        let mut values = Vec::with_capacity(row.values.len());
        for (value, column) in row.values.into_iter().zip(&self.columns) {
            let value = match value {
                CellValue::Bytes(bytes) => apply_lob_policy(bytes, column, &self.config)?,
                CellValue::Text(text)
                    if text.len() > self.config.max_blob_chunk_size
                        || text.len() > self.config.max_parameter_size =>
                {
                    apply_lob_policy(text.into_bytes(), column, &self.config)?
                }
                other => other,
            };
            values.push(value);
        }
        Ok(Some(SourceRow { values }))
    }
}

// --- built-in SQLite driver -------------------------------------------------

struct SqliteDriver;

impl DbDriver for SqliteDriver {
    fn scheme(&self) -> &str {
        "sqlite"
    }

    fn connect(&self, connstring: &str, _password: &str) -> Result<Box<dyn DbConnection>> {
        let path = sqlite_path(connstring)?;
        // Probe the file now so connect failures surface as ConnectError
        // instead of on the first cursor.
        rusqlite::Connection::open(&path)
            .map_err(|e| CopyError::Connect(format!("sqlite {}: {e}", path.display())))?;
        Ok(Box::new(SqliteConnection { path }))
    }
}

fn sqlite_path(connstring: &str) -> Result<PathBuf> {
    let rest = connstring.strip_prefix("sqlite:").ok_or_else(|| {
        CopyError::Connect(format!("not a sqlite connection string: '{connstring}'"))
    })?;
    let path = rest.strip_prefix("//").unwrap_or(rest);
    if path.is_empty() {
        return Err(CopyError::Connect(
            "sqlite connection string is missing a database path".into(),
        ));
    }
    Ok(PathBuf::from(path))
}

struct SqliteConnection {
    path: PathBuf,
}

impl DbConnection for SqliteConnection {
    fn open_cursor(&mut self, sql: &str) -> Result<Box<dyn DbCursor>> {
        // The SQLite statement borrows its connection, so the fetch loop runs
        // on a pump thread owning a per-cursor connection.
        let path = self.path.clone();
        let sql = sql.to_string();
        let pump = CursorPump::spawn("sqlite-cursor".into(), move |session| {
            let conn = rusqlite::Connection::open(&path)
                .map_err(|e| CopyError::Connect(format!("sqlite {}: {e}", path.display())))?;
            let mut stmt = conn.prepare(&sql).map_err(sqlite_err)?;

            let columns: Vec<ColumnInfo> = stmt
                .columns()
                .iter()
                .enumerate()
                .map(|(ordinal, col)| {
                    let family = family_from_decl(col.decl_type());
                    ColumnInfo {
                        ordinal,
                        name: col.name().to_string(),
                        family,
                        type_name: col.decl_type().unwrap_or("").to_uppercase(),
                        length: 0,
                        scale: 0,
                        nullable: true,
                        charset: match family {
                            TypeFamily::Text => Some("utf8".into()),
                            TypeFamily::Bytes => Some("binary".into()),
                            _ => None,
                        },
                    }
                })
                .collect();
            session.columns(columns.clone());

            let mut rows = stmt.query([]).map_err(sqlite_err)?;
            while let Some(row) = rows.next().map_err(sqlite_err)? {
                let mut values = Vec::with_capacity(columns.len());
                for column in &columns {
                    let value = row.get_ref(column.ordinal).map_err(sqlite_err)?;
                    values.push(convert_sqlite_value(value, column)?);
                }
                if !session.row(SourceRow { values }) {
                    return Ok(());
                }
            }
            Ok(())
        })?;
        Ok(Box::new(SqliteCursor { pump }))
    }
}

struct SqliteCursor {
    pump: CursorPump,
}

impl DbCursor for SqliteCursor {
    fn describe(&self) -> &[ColumnInfo] {
        self.pump.columns()
    }

    fn fetch_row(&mut self) -> Result<Option<SourceRow>> {
        self.pump.next_row()
    }
}

fn sqlite_err(err: rusqlite::Error) -> CopyError {
    CopyError::Driver(format!("sqlite: {err}"))
}

fn family_from_decl(decl: Option<&str>) -> TypeFamily {
    let Some(decl) = decl else {
        return TypeFamily::Text;
    };
    let decl = decl.to_uppercase();
    if decl.contains("UNSIGNED") {
        TypeFamily::UnsignedInteger
    } else if decl.contains("INT") || decl.contains("BOOL") {
        TypeFamily::SignedInteger
    } else if decl.contains("DEC") || decl.contains("NUMERIC") {
        TypeFamily::Decimal
    } else if decl.contains("REAL") || decl.contains("FLOA") || decl.contains("DOUB") {
        TypeFamily::Float
    } else if decl.contains("TIMESTAMP") || decl.contains("DATETIME") {
        TypeFamily::Timestamp
    } else if decl.contains("DATE") {
        TypeFamily::Date
    } else if decl.contains("TIME") {
        TypeFamily::Time
    } else if decl.contains("BLOB") || decl.contains("BINARY") {
        TypeFamily::Bytes
    } else {
        TypeFamily::Text
    }
}

fn convert_sqlite_value(
    value: rusqlite::types::ValueRef<'_>,
    column: &ColumnInfo,
) -> Result<CellValue> {
    use rusqlite::types::ValueRef;

    let cell = match value {
        ValueRef::Null => CellValue::Null,
        ValueRef::Integer(i) => CellValue::Int(i),
        ValueRef::Real(f) => CellValue::Double(f),
        ValueRef::Blob(bytes) => CellValue::Bytes(bytes.to_vec()),
        ValueRef::Text(bytes) => {
            let text = std::str::from_utf8(bytes).map_err(|_| {
                CopyError::Encoding(format!(
                    "column '{}' holds data that is not valid UTF-8",
                    column.name
                ))
            })?;
            parse_temporal_text(text, column.family)
        }
    };
    Ok(cell)
}

/// SQLite stores temporal values as text; parse them into broken-down form
/// where the declared type says so, falling back to the literal text.
fn parse_temporal_text(text: &str, family: TypeFamily) -> CellValue {
    use chrono::{NaiveDate, NaiveDateTime, NaiveTime, Timelike};

    match family {
        TypeFamily::Date => NaiveDate::parse_from_str(text, "%Y-%m-%d")
            .map(CellValue::Date)
            .unwrap_or_else(|_| CellValue::Text(text.to_string())),
        TypeFamily::Timestamp => NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f")
            .or_else(|_| NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f"))
            .map(CellValue::DateTime)
            .unwrap_or_else(|_| CellValue::Text(text.to_string())),
        TypeFamily::Time => NaiveTime::parse_from_str(text, "%H:%M:%S%.f")
            .map(|t| CellValue::Time {
                negative: false,
                hours: t.hour(),
                minutes: t.minute() as u8,
                seconds: t.second() as u8,
                micro_seconds: t.nanosecond() / 1000,
            })
            .unwrap_or_else(|_| CellValue::Text(text.to_string())),
        _ => CellValue::Text(text.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_scheme_is_a_connect_error() {
        let err = find_driver("oracle:whatever").unwrap_err();
        assert!(matches!(err, CopyError::Connect(_)));
    }

    #[test]
    fn sqlite_driver_is_registered_by_default() {
        assert!(find_driver("sqlite:/tmp/x.db").is_ok());
    }

    #[test]
    fn sqlite_paths_accept_both_spellings() {
        assert_eq!(
            sqlite_path("sqlite:/tmp/a.db").unwrap(),
            PathBuf::from("/tmp/a.db")
        );
        assert_eq!(
            sqlite_path("sqlite:///tmp/a.db").unwrap(),
            PathBuf::from("/tmp/a.db")
        );
        assert!(sqlite_path("sqlite:").is_err());
        assert!(sqlite_path("mysql:x").is_err());
    }

    #[test]
    fn declared_types_map_to_families() {
        assert_eq!(family_from_decl(Some("INTEGER")), TypeFamily::SignedInteger);
        assert_eq!(
            family_from_decl(Some("BIGINT UNSIGNED")),
            TypeFamily::UnsignedInteger
        );
        assert_eq!(family_from_decl(Some("DECIMAL(10,2)")), TypeFamily::Decimal);
        assert_eq!(family_from_decl(Some("DOUBLE")), TypeFamily::Float);
        assert_eq!(family_from_decl(Some("DATETIME")), TypeFamily::Timestamp);
        assert_eq!(family_from_decl(Some("DATE")), TypeFamily::Date);
        assert_eq!(family_from_decl(Some("TIME")), TypeFamily::Time);
        assert_eq!(family_from_decl(Some("BLOB")), TypeFamily::Bytes);
        assert_eq!(family_from_decl(Some("VARCHAR(64)")), TypeFamily::Text);
        assert_eq!(family_from_decl(None), TypeFamily::Text);
    }

    #[test]
    fn temporal_text_parses_into_components() {
        match parse_temporal_text("2023-05-04", TypeFamily::Date) {
            CellValue::Date(d) => assert_eq!(d.to_string(), "2023-05-04"),
            other => panic!("{other:?}"),
        }
        assert!(matches!(
            parse_temporal_text("2023-05-04 10:00:00", TypeFamily::Timestamp),
            CellValue::DateTime(_)
        ));
        assert!(matches!(
            parse_temporal_text("10:00:00", TypeFamily::Time),
            CellValue::Time { .. }
        ));
        // Unparseable temporals fall back to the literal text.
        assert!(matches!(
            parse_temporal_text("not-a-date", TypeFamily::Date),
            CellValue::Text(_)
        ));
    }
}
