use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use clap::{ArgAction, Parser};
use tracing::warn;
use tracing_subscriber::EnvFilter;

use copytable::config::{
    self, parse_mysql_connstring, read_passwords_from_stdin, MysqlEndpoint, StdinPasswordMode,
};
use copytable::error::{CopyError, Result};
use copytable::report::Reporter;
use copytable::run::{self, CopyOptions, SourceSpec};
use copytable::task::{CopySpec, TableTask, TaskQueue};

#[derive(Parser, Debug)]
#[command(
    name = "copytable",
    version,
    about = "Copy table data from a MySQL, ODBC or pluggable-driver source into a MySQL target"
)]
struct Cli {
    /// ODBC connection string for the source database
    #[arg(long = "odbc-source", value_name = "CONNSTRING")]
    odbc_source: Option<String>,

    /// MySQL connection string for the source database
    #[arg(long = "mysql-source", value_name = "CONNSTRING")]
    mysql_source: Option<String>,

    /// Pluggable-driver connection string (flag name kept from the DB-API edition)
    #[arg(long = "pythondbapi-source", value_name = "CONNSTRING")]
    pythondbapi_source: Option<String>,

    /// MySQL connection string for the target database
    #[arg(long = "target", value_name = "CONNSTRING")]
    target: Option<String>,

    #[arg(long = "source-password", value_name = "PASSWORD")]
    source_password: Option<String>,

    #[arg(long = "target-password", value_name = "PASSWORD")]
    target_password: Option<String>,

    /// Read one password line from stdin: `src<TAB>tgt`, or a single password
    #[arg(long = "passwords-from-stdin")]
    passwords_from_stdin: bool,

    /// Treat source bytes as UTF-8 without transcoding
    #[arg(long = "force-utf8-for-source")]
    force_utf8_for_source: bool,

    /// TRUNCATE each target table before its first insert
    #[arg(long = "truncate-target")]
    truncate_target: bool,

    /// Emit one PROGRESS: line per copied table
    #[arg(long = "progress")]
    progress: bool,

    /// Only count the rows each task would copy
    #[arg(long = "count-only")]
    count_only: bool,

    /// Fail a task on an oversized value instead of truncating it
    #[arg(long = "abort-on-oversized-blobs")]
    abort_on_oversized_blobs: bool,

    /// Skip the trigger backup/restore bracket around the copy
    #[arg(long = "dont-disable-triggers")]
    dont_disable_triggers: bool,

    /// Standalone: back up and drop the triggers of one schema, then exit
    #[arg(long = "disable-triggers-on", value_name = "SCHEMA")]
    disable_triggers_on: Option<String>,

    /// Standalone: restore previously backed-up triggers of one schema
    #[arg(long = "reenable-triggers-on", value_name = "SCHEMA")]
    reenable_triggers_on: Option<String>,

    /// Exit 0 even when individual tasks failed
    #[arg(long = "ignore-task-errors")]
    ignore_task_errors: bool,

    /// Number of copy workers
    #[arg(long = "thread-count", value_name = "COUNT", default_value_t = 1)]
    thread_count: usize,

    /// Rows per bulk INSERT
    #[arg(long = "bulk-insert-batch-size", value_name = "SIZE", default_value_t = 100)]
    bulk_insert_batch_size: usize,

    #[arg(long = "log-file", value_name = "PATH")]
    log_file: Option<PathBuf>,

    #[arg(long = "log-level", value_name = "LEVEL", env = "WB_LOG_LEVEL")]
    log_level: Option<String>,

    /// Read tab-delimited table tasks from a file
    #[arg(long = "table-file", value_name = "PATH")]
    table_file: Option<PathBuf>,

    /// Copy every row of one table
    #[arg(
        long = "table",
        num_args = 5,
        value_names = ["SRC_SCHEMA", "SRC_TABLE", "TGT_SCHEMA", "TGT_TABLE", "SELECT_EXPR"],
        action = ArgAction::Append
    )]
    table: Vec<String>,

    /// Copy one integer-key range of a table; -1 leaves a bound open
    #[arg(
        long = "table-range",
        num_args = 7,
        value_names = ["SRC_SCHEMA", "SRC_TABLE", "TGT_SCHEMA", "TGT_TABLE", "KEY", "START", "END"],
        action = ArgAction::Append
    )]
    table_range: Vec<String>,

    /// Copy at most N rows of a table in source order
    #[arg(
        long = "table-row-count",
        num_args = 5,
        value_names = ["SRC_SCHEMA", "SRC_TABLE", "TGT_SCHEMA", "TGT_TABLE", "ROW_COUNT"],
        action = ArgAction::Append
    )]
    table_row_count: Vec<String>,
}

fn main() {
    let cli = Cli::parse();
    let code = match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("copytable: {err:#}");
            1
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> anyhow::Result<i32> {
    init_logging(cli.log_level.as_deref(), cli.log_file.as_deref())?;

    let app_name = std::env::args()
        .next()
        .and_then(|arg| {
            Path::new(&arg)
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
        })
        .unwrap_or_else(|| "copytable".to_string());

    // Standalone trigger operations are mutually exclusive with each other
    // and with count mode.
    let trigger_standalone =
        cli.disable_triggers_on.is_some() || cli.reenable_triggers_on.is_some();
    if cli.disable_triggers_on.is_some() && cli.reenable_triggers_on.is_some() {
        return Err(CopyError::Invocation(
            "--disable-triggers-on and --reenable-triggers-on cannot be combined".into(),
        )
        .into());
    }
    if trigger_standalone && cli.count_only {
        return Err(CopyError::Invocation(
            "--count-only cannot be combined with standalone trigger operations".into(),
        )
        .into());
    }

    let queue = Arc::new(TaskQueue::new());
    let mut trigger_schemas = BTreeSet::new();
    collect_tasks(&cli, &queue, &mut trigger_schemas)?;
    if let Some(path) = &cli.table_file {
        config::read_tasks_from_file(path, cli.count_only, &queue, &mut trigger_schemas)
            .with_context(|| {
                format!(
                    "error reading table definitions from table file {}",
                    path.display()
                )
            })?;
    }
    if let Some(schema) = &cli.disable_triggers_on {
        trigger_schemas.insert(schema.clone());
    }
    if let Some(schema) = &cli.reenable_triggers_on {
        trigger_schemas.insert(schema.clone());
    }

    let source_connstring = source_connstring(&cli)?;
    if source_connstring.is_none() && !trigger_standalone {
        return Err(CopyError::Invocation("missing source DB server".into()).into());
    }
    if cli.target.is_none() && !cli.count_only {
        return Err(CopyError::Invocation("missing target DB server".into()).into());
    }
    if queue.is_empty() && !trigger_standalone {
        warn!("missing table list specification, nothing to do");
        return Ok(0);
    }

    let (mut source_password, mut target_password) =
        (cli.source_password.clone(), cli.target_password.clone());
    if cli.passwords_from_stdin {
        let mode = if cli.count_only {
            StdinPasswordMode::SourceOnly
        } else if trigger_standalone {
            StdinPasswordMode::TargetOnly
        } else {
            StdinPasswordMode::Both
        };
        let (src, tgt) = read_passwords_from_stdin(mode)?;
        source_password = src.or(source_password);
        target_password = tgt.or(target_password);
    }

    let reporter = Arc::new(Reporter::new());

    if cli.count_only {
        let spec = build_source_spec(&cli, source_password.as_deref())?;
        run::run_count_only(&spec, &queue, &reporter)?;
        reporter.finished();
        return Ok(0);
    }

    let target = target_endpoint(&cli, target_password.as_deref())?;

    if let Some(schema) = &cli.disable_triggers_on {
        run::run_disable_triggers(&target, &BTreeSet::from([schema.clone()]))?;
        reporter.finished();
        return Ok(0);
    }
    if let Some(schema) = &cli.reenable_triggers_on {
        run::run_reenable_triggers(&target, &BTreeSet::from([schema.clone()]))?;
        reporter.finished();
        return Ok(0);
    }

    let spec = build_source_spec(&cli, source_password.as_deref())?;
    let options = CopyOptions {
        thread_count: cli.thread_count.max(1),
        bulk_insert_batch_size: cli.bulk_insert_batch_size.max(1),
        truncate_target: cli.truncate_target,
        show_progress: cli.progress,
        abort_on_oversized_blobs: cli.abort_on_oversized_blobs,
        force_utf8: cli.force_utf8_for_source,
        disable_triggers: !cli.dont_disable_triggers,
        app_name,
    };

    let summary = run::run_copy(
        &spec,
        &target,
        Arc::clone(&queue),
        &trigger_schemas,
        &options,
        Arc::clone(&reporter),
    )?;

    if summary.tasks_failed > 0 && !cli.ignore_task_errors {
        return Ok(1);
    }
    reporter.finished();
    Ok(0)
}

fn init_logging(level: Option<&str>, log_file: Option<&Path>) -> Result<()> {
    let level = level.unwrap_or("info");
    let directive = match level.to_ascii_lowercase().as_str() {
        "error" => "error",
        "warning" | "warn" => "warn",
        "info" => "info",
        "debug" | "debug1" => "debug",
        "debug2" | "debug3" | "trace" => "trace",
        "none" | "disabled" | "off" => "off",
        _ => {
            return Err(CopyError::Invocation(format!(
                "invalid argument '{level}' for option --log-level"
            )))
        }
    };
    let filter = EnvFilter::new(directive);

    match log_file {
        Some(path) => {
            let file = std::fs::File::create(path).map_err(|e| {
                CopyError::Invocation(format!("cannot open log file {}: {e}", path.display()))
            })?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(Mutex::new(file))
                .with_ansi(false)
                .init();
        }
        None => {
            // Stdout carries the machine-readable markers; logs go to stderr.
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
    Ok(())
}

fn trim_quotes(value: &str) -> &str {
    value.trim_matches('"')
}

fn source_connstring(cli: &Cli) -> Result<Option<String>> {
    let given = [
        cli.mysql_source.as_deref(),
        cli.odbc_source.as_deref(),
        cli.pythondbapi_source.as_deref(),
    ];
    if given.iter().flatten().count() > 1 {
        return Err(CopyError::Invocation(
            "exactly one of --mysql-source, --odbc-source or --pythondbapi-source is allowed"
                .into(),
        ));
    }
    Ok(given
        .into_iter()
        .flatten()
        .next()
        .map(|s| trim_quotes(s).to_string()))
}

fn build_source_spec(cli: &Cli, password: Option<&str>) -> Result<SourceSpec> {
    let password = password.unwrap_or("");
    if let Some(connstring) = &cli.mysql_source {
        let mut endpoint = parse_mysql_connstring(trim_quotes(connstring))?;
        if endpoint.password.is_empty() {
            endpoint.password = password.to_string();
        }
        return Ok(SourceSpec::MySql(endpoint));
    }
    if let Some(connstring) = &cli.odbc_source {
        return Ok(SourceSpec::Odbc {
            connstring: trim_quotes(connstring).to_string(),
            password: password.to_string(),
        });
    }
    if let Some(connstring) = &cli.pythondbapi_source {
        return Ok(SourceSpec::DbApi {
            connstring: trim_quotes(connstring).to_string(),
            password: password.to_string(),
        });
    }
    Err(CopyError::Invocation("missing source DB server".into()))
}

fn target_endpoint(cli: &Cli, password: Option<&str>) -> Result<MysqlEndpoint> {
    let connstring = cli
        .target
        .as_deref()
        .ok_or_else(|| CopyError::Invocation("missing target DB server".into()))?;
    let mut endpoint = parse_mysql_connstring(trim_quotes(connstring))?;
    if endpoint.password.is_empty() {
        if let Some(password) = password {
            endpoint.password = password.to_string();
        }
    }
    Ok(endpoint)
}

fn collect_tasks(
    cli: &Cli,
    queue: &Arc<TaskQueue>,
    trigger_schemas: &mut BTreeSet<String>,
) -> Result<()> {
    for fields in cli.table.chunks(5) {
        let [src_schema, src_table, tgt_schema, tgt_table, expr] = fields else {
            return Err(CopyError::Invocation(
                "missing value for table copy specification".into(),
            ));
        };
        trigger_schemas.insert(tgt_schema.clone());
        queue.push(TableTask {
            source_schema: src_schema.clone(),
            source_table: src_table.clone(),
            target_schema: tgt_schema.clone(),
            target_table: tgt_table.clone(),
            select_expression: expr.clone(),
            spec: CopySpec::All,
        });
    }

    for fields in cli.table_range.chunks(7) {
        let [src_schema, src_table, tgt_schema, tgt_table, key, start, end] = fields else {
            return Err(CopyError::Invocation(
                "missing value for table range specification".into(),
            ));
        };
        let start = parse_bound(start)?;
        let end = parse_bound(end)?;
        trigger_schemas.insert(tgt_schema.clone());
        queue.push(TableTask {
            source_schema: src_schema.clone(),
            source_table: src_table.clone(),
            target_schema: tgt_schema.clone(),
            target_table: tgt_table.clone(),
            select_expression: "*".into(),
            spec: CopySpec::Range {
                key: key.clone(),
                start,
                end,
            },
        });
    }

    for fields in cli.table_row_count.chunks(5) {
        let [src_schema, src_table, tgt_schema, tgt_table, rows] = fields else {
            return Err(CopyError::Invocation(
                "missing value for table row-count specification".into(),
            ));
        };
        let rows = rows.parse::<u64>().map_err(|_| {
            CopyError::Invocation(format!("invalid row count '{rows}' in table specification"))
        })?;
        trigger_schemas.insert(tgt_schema.clone());
        queue.push(TableTask {
            source_schema: src_schema.clone(),
            source_table: src_table.clone(),
            target_schema: tgt_schema.clone(),
            target_table: tgt_table.clone(),
            select_expression: "*".into(),
            spec: CopySpec::Count { rows },
        });
    }
    Ok(())
}

fn parse_bound(value: &str) -> Result<i64> {
    value.parse::<i64>().map_err(|_| {
        CopyError::Invocation(format!("invalid range bound '{value}' in table specification"))
    })
}
