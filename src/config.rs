//! Invocation-side configuration: connection strings, stdin passwords and
//! table files.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::Arc;

use tracing::info;

use crate::error::{CopyError, Result};
use crate::task::{CopySpec, TableTask, TaskQueue};

/// Connection parameters for a MySQL endpoint, either TCP or socket.
#[derive(Debug, Clone, Default)]
pub struct MysqlEndpoint {
    pub user: String,
    pub password: String,
    pub host: String,
    pub port: u16,
    pub socket: Option<String>,
}

/// Parse the `user[:pass]@host:port` / `user[:pass]@::socket` grammar used by
/// the command-line utilities.
pub fn parse_mysql_connstring(connstring: &str) -> Result<MysqlEndpoint> {
    let at = connstring.rfind('@').ok_or_else(|| invalid_connstring(connstring))?;
    let (user_part, server_part) = (&connstring[..at], &connstring[at + 1..]);

    let (user, password) = match user_part.split_once(':') {
        Some((user, pass)) => (user.to_string(), pass.to_string()),
        None => (user_part.to_string(), String::new()),
    };
    if user.is_empty() {
        return Err(invalid_connstring(connstring));
    }

    let mut endpoint = MysqlEndpoint {
        user,
        password,
        port: 3306,
        ..MysqlEndpoint::default()
    };

    match server_part.split_once(':') {
        Some(("", socket_part)) => {
            // `::socket` form: everything after the second colon is the path.
            let socket = socket_part
                .strip_prefix(':')
                .ok_or_else(|| invalid_connstring(connstring))?;
            if socket.is_empty() {
                return Err(invalid_connstring(connstring));
            }
            endpoint.socket = Some(socket.to_string());
        }
        Some((host, port)) => {
            endpoint.host = host.to_string();
            endpoint.port = port
                .parse::<u16>()
                .map_err(|_| invalid_connstring(connstring))?;
        }
        None => {
            if server_part.is_empty() {
                return Err(invalid_connstring(connstring));
            }
            endpoint.host = server_part.to_string();
        }
    }

    Ok(endpoint)
}

fn invalid_connstring(connstring: &str) -> CopyError {
    CopyError::Invocation(format!(
        "invalid MySQL connection string '{connstring}'; \
         must be user[:pass]@host:port or user[:pass]@::socket"
    ))
}

/// Which sessions the single stdin line provides passwords for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StdinPasswordMode {
    /// Count-only runs read rows from the source only.
    SourceOnly,
    /// Standalone trigger operations touch the target only.
    TargetOnly,
    /// A copy run needs both, tab-separated; a single token is the source's.
    Both,
}

/// Split one stdin line into `(source_password, target_password)`.
pub fn parse_stdin_passwords(line: &str, mode: StdinPasswordMode) -> (Option<String>, Option<String>) {
    let line = line.trim_end_matches(['\r', '\n']);
    match mode {
        StdinPasswordMode::SourceOnly => {
            let token = line.split('\t').next().unwrap_or("");
            (Some(token.to_string()), None)
        }
        StdinPasswordMode::TargetOnly => {
            let token = line.split('\t').next().unwrap_or("");
            (None, Some(token.to_string()))
        }
        StdinPasswordMode::Both => match line.split_once('\t') {
            Some((src, tgt)) => (Some(src.to_string()), Some(tgt.to_string())),
            None => (Some(line.to_string()), None),
        },
    }
}

/// Read the single password line from standard input.
pub fn read_passwords_from_stdin(mode: StdinPasswordMode) -> Result<(Option<String>, Option<String>)> {
    let mut line = String::new();
    std::io::stdin()
        .read_line(&mut line)
        .map_err(|e| CopyError::Invocation(format!("error reading passwords from stdin: {e}")))?;
    if line.is_empty() {
        return Err(CopyError::Invocation(
            "error reading passwords from stdin: empty input".into(),
        ));
    }
    Ok(parse_stdin_passwords(&line, mode))
}

/// Load tasks from a tab-delimited table file.
///
/// Count-only files carry `src_schema<TAB>src_table` per line; copy files
/// carry `src_schema<TAB>src_table<TAB>tgt_schema<TAB>tgt_table<TAB>expr`,
/// where the select expression keeps any further tabs verbatim.
pub fn read_tasks_from_file(
    path: &Path,
    count_only: bool,
    queue: &Arc<TaskQueue>,
    trigger_schemas: &mut BTreeSet<String>,
) -> Result<()> {
    let file = File::open(path).map_err(|e| {
        CopyError::Invocation(format!("cannot open table file {}: {e}", path.display()))
    })?;

    info!("Loading table information from file {}", path.display());

    for (lineno, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|e| {
            CopyError::Invocation(format!("error reading table file {}: {e}", path.display()))
        })?;
        if line.is_empty() {
            continue;
        }

        let task = parse_table_line(&line, count_only).ok_or_else(|| {
            CopyError::Invocation(format!(
                "malformed table definition at {}:{}",
                path.display(),
                lineno + 1
            ))
        })?;

        info!("--table {}", line);
        if !count_only {
            trigger_schemas.insert(task.target_schema.clone());
        }
        queue.push(task);
    }

    Ok(())
}

fn parse_table_line(line: &str, count_only: bool) -> Option<TableTask> {
    let field_count = if count_only { 2 } else { 5 };
    let fields: Vec<&str> = line.splitn(field_count, '\t').collect();
    if fields.len() != field_count || fields.iter().any(|f| f.is_empty()) {
        return None;
    }

    let mut task = TableTask {
        source_schema: fields[0].to_string(),
        source_table: fields[1].to_string(),
        target_schema: String::new(),
        target_table: String::new(),
        select_expression: "*".to_string(),
        spec: CopySpec::All,
    };
    if !count_only {
        task.target_schema = fields[2].to_string();
        task.target_table = fields[3].to_string();
        task.select_expression = fields[4].to_string();
    }
    Some(task)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parses_tcp_connstring() {
        let ep = parse_mysql_connstring("admin:secret@db.example.com:3307").unwrap();
        assert_eq!(ep.user, "admin");
        assert_eq!(ep.password, "secret");
        assert_eq!(ep.host, "db.example.com");
        assert_eq!(ep.port, 3307);
        assert!(ep.socket.is_none());
    }

    #[test]
    fn parses_connstring_without_password_or_port() {
        let ep = parse_mysql_connstring("root@localhost").unwrap();
        assert_eq!(ep.user, "root");
        assert_eq!(ep.password, "");
        assert_eq!(ep.host, "localhost");
        assert_eq!(ep.port, 3306);
    }

    #[test]
    fn parses_socket_connstring() {
        let ep = parse_mysql_connstring("root:pw@::/var/run/mysqld/mysqld.sock").unwrap();
        assert_eq!(ep.user, "root");
        assert_eq!(ep.socket.as_deref(), Some("/var/run/mysqld/mysqld.sock"));
        assert!(ep.host.is_empty());
    }

    #[test]
    fn password_may_contain_at_sign() {
        let ep = parse_mysql_connstring("root:p@ss@localhost:3306").unwrap();
        assert_eq!(ep.password, "p@ss");
        assert_eq!(ep.host, "localhost");
    }

    #[test]
    fn rejects_malformed_connstrings() {
        for bad in ["", "nouser", "user@", "user@host:notaport", "user@::"] {
            assert!(parse_mysql_connstring(bad).is_err(), "{bad:?}");
        }
    }

    #[test]
    fn stdin_passwords_split_per_mode() {
        assert_eq!(
            parse_stdin_passwords("src\ttgt\n", StdinPasswordMode::Both),
            (Some("src".into()), Some("tgt".into()))
        );
        assert_eq!(
            parse_stdin_passwords("only\n", StdinPasswordMode::Both),
            (Some("only".into()), None)
        );
        assert_eq!(
            parse_stdin_passwords("pw\textra\n", StdinPasswordMode::SourceOnly),
            (Some("pw".into()), None)
        );
        assert_eq!(
            parse_stdin_passwords("pw\r\n", StdinPasswordMode::TargetOnly),
            (None, Some("pw".into()))
        );
    }

    #[test]
    fn table_file_round_trip() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "sakila\tactor\tsakila\tactor\t*").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "sakila\tfilm\tarchive\tfilm\tfilm_id, title").unwrap();

        let queue = Arc::new(TaskQueue::new());
        let mut schemas = BTreeSet::new();
        read_tasks_from_file(file.path(), false, &queue, &mut schemas).unwrap();

        assert_eq!(queue.len(), 2);
        let first = queue.pop().unwrap();
        assert_eq!(first.source_name(), "sakila.actor");
        assert_eq!(first.select_expression, "*");
        let second = queue.pop().unwrap();
        assert_eq!(second.target_name(), "archive.film");
        assert_eq!(second.select_expression, "film_id, title");
        assert!(schemas.contains("sakila") && schemas.contains("archive"));
    }

    #[test]
    fn count_only_table_file_takes_two_fields() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "sakila\tactor").unwrap();

        let queue = Arc::new(TaskQueue::new());
        let mut schemas = BTreeSet::new();
        read_tasks_from_file(file.path(), true, &queue, &mut schemas).unwrap();

        assert_eq!(queue.len(), 1);
        assert!(schemas.is_empty());
    }

    #[test]
    fn malformed_table_file_line_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "only_one_field").unwrap();

        let queue = Arc::new(TaskQueue::new());
        let mut schemas = BTreeSet::new();
        let err = read_tasks_from_file(file.path(), false, &queue, &mut schemas).unwrap_err();
        assert!(err.to_string().contains("malformed table definition"));
    }
}
