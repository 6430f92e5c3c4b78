use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use time::format_description::FormatItem;
use time::macros::format_description;
use time::OffsetDateTime;

use crate::domain_xml;
use crate::env::Environment;
use crate::error::{OpsError, Result};
use crate::executor::{CopySpec, Executor, LocalCommand, Location};
use crate::opts::SyncSettings;

const FORMAT: &[FormatItem<'_>] = format_description!("[year][month][day]-[hour][minute][second]");

pub fn backup_dir_name(at: OffsetDateTime) -> Result<String> {
  let formatted = at.format(FORMAT).map_err(|e| {
    OpsError::Io(io::Error::new(
      io::ErrorKind::Other,
      format!("failed to format backup timestamp: {e}"),
    ))
  })?;
  Ok(format!("dataverse-backup-{formatted}"))
}

/// `pg_dump`/`psql` invocation against the local database.
pub fn local_db_command(env: &Environment, program: &str) -> Result<LocalCommand> {
  let mut cmd = LocalCommand::new(program).args([
    "-h",
    env.require("DB_HOST")?,
    "-p",
    env.require("DB_PORT")?,
    "-U",
    env.require("DB_USER")?,
  ]);
  if let Some(password) = env.get("DB_PASSWORD") {
    cmd = cmd.env("PGPASSWORD", password);
  }
  Ok(cmd)
}

/// SQL string literal with embedded quotes doubled.
pub fn sql_literal(raw: &str) -> String {
  format!("'{}'", raw.replace('\'', "''"))
}

/// Snapshot the local instance before it is overwritten: a custom-format
/// database dump, `domain.xml`, and the Solr `conf/` directory.
pub fn create_backup(env: &Environment, settings: &SyncSettings, executor: &dyn Executor) -> Result<PathBuf> {
  let dest = settings.backup_root.join(backup_dir_name(OffsetDateTime::now_utc())?);
  fs::create_dir_all(&dest)?;
  tracing::info!("backing up local instance to {}", dest.display());

  let dump = dest.join("local-db.dump");
  let cmd = local_db_command(env, "pg_dump")?
    .args(["-Fc", "-f"])
    .arg(dump.display().to_string())
    .arg(env.require("DB_NAME")?);
  executor.run_local(&cmd)?;

  let domain_xml = domain_xml::config_path(Path::new(env.require("PAYARA")?));
  match fs::copy(&domain_xml, dest.join("domain.xml")) {
    Ok(_) => {}
    Err(err) if err.kind() == io::ErrorKind::NotFound => {
      tracing::warn!("{} not found; not backed up", domain_xml.display());
    }
    Err(err) => return Err(err.into()),
  }

  let solr_conf = solr_conf_dir(env.require("SOLR_PATH")?);
  executor.copy(&CopySpec::new(
    Location::Local(PathBuf::from(&solr_conf)),
    Location::Local(dest.join("solr-conf")),
  )
  .contents())?;

  Ok(dest)
}

/// The `collection1` core under a Solr install.
pub fn solr_core_dir(solr_path: &str) -> String {
  format!("{}/server/solr/collection1", solr_path.trim_end_matches('/'))
}

pub fn solr_conf_dir(solr_path: &str) -> String {
  format!("{}/conf", solr_core_dir(solr_path))
}
