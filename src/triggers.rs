//! Trigger backup and restore.
//!
//! Bulk-loading rows must not fire the target's triggers, so the copy is
//! bracketed: capture every `CREATE TRIGGER` statement, drop the triggers,
//! copy, re-create them verbatim. Captured definitions live both in an
//! in-memory map and in `wb_tmp`.`trigger_backup` on the target server, so a
//! later standalone `--reenable-triggers-on` run can pick them up.

use std::collections::{BTreeMap, BTreeSet};

use chrono::Utc;
use mysql::prelude::*;
use mysql::Conn;
use tracing::{info, warn};

use crate::config::MysqlEndpoint;
use crate::error::Result;
use crate::target::connect_target;

const BACKUP_SCHEMA: &str = "wb_tmp";
const BACKUP_TABLE: &str = "trigger_backup";

/// One captured trigger definition.
#[derive(Debug, Clone)]
pub struct TriggerDef {
    pub sql_mode: String,
    pub statement: String,
}

/// Captured triggers keyed by `(schema, trigger_name)`.
pub type TriggerBackup = BTreeMap<(String, String), TriggerDef>;

fn ensure_backup_store(conn: &mut Conn) -> Result<()> {
    conn.query_drop(format!("CREATE DATABASE IF NOT EXISTS `{BACKUP_SCHEMA}`"))?;
    conn.query_drop(format!(
        "CREATE TABLE IF NOT EXISTS `{BACKUP_SCHEMA}`.`{BACKUP_TABLE}` (
             schema_name VARCHAR(64) NOT NULL,
             trigger_name VARCHAR(64) NOT NULL,
             sql_mode TEXT NOT NULL,
             definition LONGTEXT NOT NULL,
             backed_up_at DATETIME NOT NULL,
             PRIMARY KEY (schema_name, trigger_name)
         )"
    ))?;
    Ok(())
}

fn stored_backups(conn: &mut Conn, schema: &str) -> Result<Vec<(String, TriggerDef)>> {
    let rows: Vec<(String, String, String)> = conn.exec(
        format!(
            "SELECT trigger_name, sql_mode, definition \
             FROM `{BACKUP_SCHEMA}`.`{BACKUP_TABLE}` WHERE schema_name = ?"
        ),
        (schema,),
    )?;
    Ok(rows
        .into_iter()
        .map(|(name, sql_mode, statement)| (name, TriggerDef { sql_mode, statement }))
        .collect())
}

/// Capture and drop every trigger in the given schemas.
///
/// Idempotent: a schema whose triggers are already gone but whose backup rows
/// exist is left alone, and the stored definitions are folded into the
/// returned map.
pub fn backup_triggers(conn: &mut Conn, schemas: &BTreeSet<String>) -> Result<TriggerBackup> {
    let mut backup = TriggerBackup::new();
    if schemas.is_empty() {
        return Ok(backup);
    }
    ensure_backup_store(conn)?;
    let now = Utc::now().format("%Y-%m-%d %H:%M:%S").to_string();

    for schema in schemas {
        let names: Vec<String> = conn.exec(
            "SELECT TRIGGER_NAME FROM information_schema.TRIGGERS \
             WHERE TRIGGER_SCHEMA = ? ORDER BY TRIGGER_NAME",
            (schema,),
        )?;

        if names.is_empty() {
            let stored = stored_backups(conn, schema)?;
            if stored.is_empty() {
                info!(schema = %schema, "no triggers to back up");
            } else {
                info!(
                    schema = %schema,
                    count = stored.len(),
                    "triggers already backed up by an earlier run"
                );
                for (name, def) in stored {
                    backup.insert((schema.clone(), name), def);
                }
            }
            continue;
        }

        for name in names {
            let row: Option<mysql::Row> = conn.query_first(format!(
                "SHOW CREATE TRIGGER `{}`.`{}`",
                schema.replace('`', "``"),
                name.replace('`', "``")
            ))?;
            let Some(row) = row else {
                warn!(schema = %schema, trigger = %name, "trigger vanished during backup");
                continue;
            };
            let sql_mode: String = row.get(1).unwrap_or_default();
            let statement: String = row.get(2).unwrap_or_default();
            if statement.is_empty() {
                warn!(schema = %schema, trigger = %name, "empty trigger definition, skipping");
                continue;
            }

            conn.exec_drop(
                format!(
                    "REPLACE INTO `{BACKUP_SCHEMA}`.`{BACKUP_TABLE}` \
                     (schema_name, trigger_name, sql_mode, definition, backed_up_at) \
                     VALUES (?, ?, ?, ?, ?)"
                ),
                (schema, &name, &sql_mode, &statement, &now),
            )?;
            conn.query_drop(format!(
                "DROP TRIGGER `{}`.`{}`",
                schema.replace('`', "``"),
                name.replace('`', "``")
            ))?;

            info!(schema = %schema, trigger = %name, "trigger backed up and dropped");
            backup.insert((schema.clone(), name), TriggerDef { sql_mode, statement });
        }
    }
    Ok(backup)
}

/// Re-create every backed-up trigger in the given schemas.
///
/// A schema without backup rows is a warning, not an error: there may simply
/// have been nothing to disable.
pub fn restore_triggers(conn: &mut Conn, schemas: &BTreeSet<String>) -> Result<usize> {
    let store_exists: Option<u64> = conn.exec_first(
        "SELECT COUNT(*) FROM information_schema.TABLES \
         WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ?",
        (BACKUP_SCHEMA, BACKUP_TABLE),
    )?;
    if store_exists.unwrap_or(0) == 0 {
        warn!("no trigger backup found on the target server; nothing to restore");
        return Ok(0);
    }

    let mut restored = 0;
    for schema in schemas {
        let stored = stored_backups(conn, schema)?;
        if stored.is_empty() {
            warn!(schema = %schema, "no trigger backup for schema");
            continue;
        }

        conn.query_drop(format!("USE `{}`", schema.replace('`', "``")))?;
        for (name, def) in stored {
            conn.exec_drop("SET SESSION sql_mode = ?", (&def.sql_mode,))?;
            conn.query_drop(&def.statement)?;
            conn.exec_drop(
                format!(
                    "DELETE FROM `{BACKUP_SCHEMA}`.`{BACKUP_TABLE}` \
                     WHERE schema_name = ? AND trigger_name = ?"
                ),
                (schema, &name),
            )?;
            info!(schema = %schema, trigger = %name, "trigger restored");
            restored += 1;
        }
    }
    Ok(restored)
}

/// Scoped backup/restore pair around a copy run.
///
/// Restore runs on every exit path: explicitly via [`TriggerBracket::restore`]
/// on the success path, or from `Drop` when the copy bails out early.
pub struct TriggerBracket {
    conn: Conn,
    schemas: BTreeSet<String>,
    backup: TriggerBackup,
    restored: bool,
}

impl TriggerBracket {
    pub fn backup(endpoint: &MysqlEndpoint, schemas: &BTreeSet<String>) -> Result<Self> {
        let mut conn = connect_target(endpoint)?;
        let backup = backup_triggers(&mut conn, schemas)?;
        Ok(Self {
            conn,
            schemas: schemas.clone(),
            backup,
            restored: false,
        })
    }

    /// Number of triggers captured at backup time.
    pub fn captured(&self) -> usize {
        self.backup.len()
    }

    pub fn restore(&mut self) -> Result<usize> {
        self.restored = true;
        restore_triggers(&mut self.conn, &self.schemas)
    }
}

impl Drop for TriggerBracket {
    fn drop(&mut self) {
        if !self.restored {
            match restore_triggers(&mut self.conn, &self.schemas) {
                Ok(n) => warn!(restored = n, "triggers restored during abnormal exit"),
                Err(e) => warn!(error = %e, "failed to restore triggers during abnormal exit"),
            }
        }
    }
}
