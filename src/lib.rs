//! copytable
//!
//! A parallel table-copy engine: streams row data from a heterogeneous source
//! database into a MySQL target, as the data-transfer worker of a
//! schema-migration toolchain.
//!
//! # Features
//!
//! - Parallel copy: N worker threads cooperatively drain a shared task queue
//! - Sources: native MySQL, ODBC (cargo feature `odbc`), pluggable drivers
//! - Copy specs: full table, integer key range, first-N rows
//! - Large values: chunked transfer bounded by the target's packet limits
//! - Trigger bracket: target triggers are backed up, dropped and restored
//!   around the copy so bulk-inserted rows never fire them
//!
//! # CLI Usage
//!
//! ```bash
//! # Copy one table with four workers
//! copytable --mysql-source=user:pw@host:3306 --target=user:pw@host:3307 \
//!     --thread-count=4 --table sakila actor sakila actor '*'
//!
//! # Count what a range task would copy
//! copytable --mysql-source=user:pw@host:3306 --count-only \
//!     --table-range sakila film sakila film film_id 1 500
//!
//! # Restore triggers left disabled by an interrupted run
//! copytable --target=user:pw@host:3307 --reenable-triggers-on=sakila
//! ```

pub mod config;
pub mod error;
pub mod mapper;
pub mod report;
pub mod run;
pub mod source;
pub mod target;
pub mod task;
pub mod triggers;
pub mod value;
pub mod worker;

pub use config::{parse_mysql_connstring, MysqlEndpoint};
pub use error::{CopyError, Result};
pub use report::Reporter;
pub use run::{CopyOptions, RunSummary, SourceSpec};
pub use source::{CopySource, SourceConfig, SourceCursor};
pub use target::{CopySink, MysqlTarget};
pub use task::{CopySpec, TableTask, TaskQueue};
pub use value::{CellValue, ColumnInfo, LobChunk, LobHandle, SourceRow, TypeFamily};
