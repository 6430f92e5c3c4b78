//! The production → staging sync workflow.
//!
//! Step order is fixed: backup, database, files, solr, counter, cron,
//! permissions. Configuration is validated and the safety guard has passed
//! before the first step runs.

use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::admin::AdminApi;
use crate::backup::{self, solr_conf_dir, solr_core_dir, sql_literal};
use crate::confirm::Confirm;
use crate::env::{self, Environment};
use crate::error::{OpsError, Result};
use crate::executor::{quote, CopySpec, Executor, LocalCommand, Location, RemoteHost};
use crate::guard;
use crate::opts::{Skips, SyncSettings};
use crate::pipeline::{Aborted, Enablement, Pipeline, Step};
use crate::report::ExecutionReport;
use crate::rewrite::{self, Rewrites};

/// Never copied from production: keys, certificates and credential files.
pub const SENSITIVE_EXCLUDES: &[&str] = &[
    "*.pem",
    "*.key",
    "*.p12",
    "*.pfx",
    "*.jks",
    "*.keystore",
    "*.crt",
    "*.cer",
    "id_rsa*",
    ".ssh/",
    "*password*",
    "*credentials*",
    ".env",
];

/// Counter processor files whose contents are rewritten.
const REWRITTEN_EXTENSIONS: &[&str] = &[
    "yaml", "yml", "sh", "cfg", "conf", "ini", "properties", "env", "txt",
];

pub struct SyncContext<'a> {
    pub env: &'a Environment,
    pub settings: &'a SyncSettings,
    pub skips: Skips,
    pub executor: &'a dyn Executor,
    pub admin: &'a dyn AdminApi,
    pub confirm: &'a dyn Confirm,
    pub scratch: &'a Path,
    /// Set by the backup step.
    pub backup_dir: Option<PathBuf>,
}

impl<'a> SyncContext<'a> {
    pub fn new(
        env: &'a Environment,
        settings: &'a SyncSettings,
        executor: &'a dyn Executor,
        admin: &'a dyn AdminApi,
        confirm: &'a dyn Confirm,
        scratch: &'a Path,
    ) -> Self {
        Self {
            env,
            settings,
            skips: Skips::default(),
            executor,
            admin,
            confirm,
            scratch,
            backup_dir: None,
        }
    }

    fn production(&self) -> Result<RemoteHost> {
        Ok(RemoteHost::new(
            self.env.require("PRODUCTION_SERVER")?,
            self.env.require("PRODUCTION_SSH_USER")?,
        ))
    }

    fn remote(&self, path: impl Into<String>) -> Result<Location> {
        Ok(Location::Remote {
            host: self.production()?,
            path: path.into(),
        })
    }

    fn systemctl(&self, action: &str, service: &str) -> Result<()> {
        self.executor
            .run_local(&LocalCommand::new("systemctl").args([action, service]))?;
        Ok(())
    }

    fn counter_enablement(&self) -> Enablement {
        if self.skips.counter {
            return Enablement::disabled("--skip-counter");
        }
        let missing = self.env.missing_keys(&env::COUNTER);
        if missing.is_empty() {
            Enablement::Enabled
        } else {
            Enablement::disabled(format!("counter settings incomplete ({})", missing.join(", ")))
        }
    }
}

/// Production names mapped to their local counterparts.
pub fn staging_rewrites(env: &Environment) -> Result<Rewrites> {
    let mut rules = Rewrites::new().host(env.require("PRODUCTION_DOMAIN")?, env.require("DOMAIN")?);
    for (prod, local) in [
        ("PRODUCTION_DATAVERSE_CONTENT_STORAGE", "DATAVERSE_CONTENT_STORAGE"),
        ("PRODUCTION_SOLR_PATH", "SOLR_PATH"),
        ("PRODUCTION_PAYARA", "PAYARA"),
        ("PRODUCTION_COUNTER_PROCESSOR_DIR", "COUNTER_PROCESSOR_DIR"),
    ] {
        if let (Some(from), Some(to)) = (env.get(prod), env.get(local)) {
            rules = rules.path(from, to);
        }
    }
    Ok(rules)
}

/// Statements applied after the restore so the copy cannot mail users or
/// mint real DOIs, and announces itself as a test instance.
pub fn post_restore_sql(staging_domain: &str, production_domain: &str) -> String {
    let banner = format!(
        "This is a test instance at {staging_domain}, cloned from {production_domain}. \
         Changes made here are not preserved and no DOIs are registered."
    );
    format!(
        "BEGIN;\n\
         DELETE FROM setting WHERE name = ':SystemEmail';\n\
         DELETE FROM setting WHERE name = ':DoiProvider';\n\
         INSERT INTO setting (name, content) VALUES (':DoiProvider', 'FAKE');\n\
         DELETE FROM setting WHERE name IN (':DoiUsername', ':DoiPassword', ':DoiBaseUrlString', ':DataCiteRestApiUrlString');\n\
         WITH banner AS (\n\
         \x20 INSERT INTO bannermessage (active, dismissiblebyuser) VALUES (true, false) RETURNING id\n\
         )\n\
         INSERT INTO bannermessagetext (lang, message, bannermessage_id)\n\
         SELECT 'en', {}, id FROM banner;\n\
         COMMIT;\n",
        sql_literal(&banner)
    )
}

/// Copy `src` to `dst` line by line, replacing the production hostname.
/// Returns the number of replacements.
pub fn rewrite_dump(src: &Path, dst: &Path, production_domain: &str, domain: &str) -> Result<usize> {
    let mut reader = BufReader::new(File::open(src)?);
    let mut writer = BufWriter::new(File::create(dst)?);
    let mut total = 0;
    let mut line = Vec::new();
    while reader.read_until(b'\n', &mut line)? > 0 {
        let body_len = if line.ends_with(b"\n") { line.len() - 1 } else { line.len() };
        let (body, terminator) = line.split_at(body_len);
        // Dumps may carry non-UTF-8 bytea text; such lines pass through.
        match std::str::from_utf8(body) {
            Ok(text) => {
                let (rewritten, n) = rewrite::replace_host(text, production_domain, domain);
                total += n;
                writer.write_all(rewritten.as_bytes())?;
            }
            Err(_) => writer.write_all(body)?,
        }
        writer.write_all(terminator)?;
        line.clear();
    }
    writer.flush()?;
    Ok(total)
}

pub struct BackupStep;

impl<'a> Step<SyncContext<'a>> for BackupStep {
    fn name(&self) -> &'static str {
        "backup"
    }

    fn enablement(&self, ctx: &SyncContext<'a>) -> Enablement {
        if ctx.skips.backup {
            Enablement::disabled("--skip-backup")
        } else {
            Enablement::Enabled
        }
    }

    fn describe(&self, ctx: &SyncContext<'a>) -> String {
        format!(
            "back up the local database, domain.xml and Solr conf under {}",
            ctx.settings.backup_root.display()
        )
    }

    fn execute(&self, ctx: &mut SyncContext<'a>) -> Result<Option<String>> {
        let dir = backup::create_backup(ctx.env, ctx.settings, ctx.executor)?;
        let detail = format!("saved to {}", dir.display());
        ctx.backup_dir = Some(dir);
        Ok(Some(detail))
    }
}

pub struct DatabaseStep;

impl DatabaseStep {
    /// Dump production into `remote_dump` and pull it to `local`.
    fn fetch_dump(
        ctx: &SyncContext<'_>,
        host: &RemoteHost,
        remote_dump: &str,
        local: &Path,
    ) -> Result<()> {
        let env = ctx.env;
        let prod_db = env.require("PRODUCTION_DB_NAME")?;
        tracing::info!("dumping {prod_db} on {}", host.host);
        ctx.executor.run_remote(
            host,
            &format!(
                "pg_dump -h {} -U {} --no-owner --no-privileges -f {} {}",
                quote(env.require("PRODUCTION_DB_HOST")?),
                quote(env.require("PRODUCTION_DB_USER")?),
                quote(remote_dump),
                quote(prod_db)
            ),
        )?;
        ctx.executor.copy(&CopySpec::new(
            ctx.remote(remote_dump)?,
            Location::Local(local.to_path_buf()),
        ))?;
        Ok(())
    }
}

impl<'a> Step<SyncContext<'a>> for DatabaseStep {
    fn name(&self) -> &'static str {
        "database"
    }

    fn enablement(&self, ctx: &SyncContext<'a>) -> Enablement {
        if ctx.skips.db {
            Enablement::disabled("--skip-db")
        } else {
            Enablement::Enabled
        }
    }

    fn describe(&self, ctx: &SyncContext<'a>) -> String {
        format!(
            "replace local database {} with a dump of production database {}",
            ctx.env.get_or("DB_NAME", "?"),
            ctx.env.get_or("PRODUCTION_DB_NAME", "?")
        )
    }

    fn execute(&self, ctx: &mut SyncContext<'a>) -> Result<Option<String>> {
        let env = ctx.env;
        let prod_db = env.require("PRODUCTION_DB_NAME")?;
        let db_name = env.require("DB_NAME")?;
        let host = ctx.production()?;

        let remote_dump = ctx
            .executor
            .run_remote(&host, "mktemp -t dvops-dump.XXXXXXXX")?
            .output
            .trim()
            .to_string();
        if remote_dump.is_empty() {
            return Err(OpsError::Execution {
                command: format!("ssh {} mktemp", host.destination()),
                status: None,
                output: "no temporary file name returned".to_string(),
            });
        }
        let fetched = ctx.scratch.join("production.sql");
        let fetch = DatabaseStep::fetch_dump(ctx, &host, &remote_dump, &fetched);
        if let Err(err) = ctx
            .executor
            .run_remote(&host, &format!("rm -f {}", quote(&remote_dump)))
        {
            tracing::warn!("could not remove {remote_dump} on {}: {err}", host.host);
        }
        fetch?;

        let rewritten = ctx.scratch.join("staging.sql");
        let replaced = rewrite_dump(
            &fetched,
            &rewritten,
            env.require("PRODUCTION_DOMAIN")?,
            env.require("DOMAIN")?,
        )?;
        fs::remove_file(&fetched)?;
        tracing::info!("rewrote {replaced} hostname occurrence(s) in the dump");

        ctx.systemctl("stop", env.payara_service())?;

        ctx.executor.run_local(
            &backup::local_db_command(env, "dropdb")?.args(["--if-exists", db_name]),
        )?;
        ctx.executor.run_local(
            &backup::local_db_command(env, "createdb")?.args(["-O", env.require("DB_USER")?, db_name]),
        )?;
        let psql = |file: &Path| -> Result<LocalCommand> {
            Ok(backup::local_db_command(env, "psql")?
                .args(["-q", "-v", "ON_ERROR_STOP=1", "-d", db_name, "-f"])
                .arg(file.display().to_string()))
        };
        tracing::info!("restoring into {db_name}");
        ctx.executor.run_local(&psql(&rewritten)?)?;

        let safety_sql = ctx.scratch.join("post-restore.sql");
        fs::write(
            &safety_sql,
            post_restore_sql(env.require("DOMAIN")?, env.require("PRODUCTION_DOMAIN")?),
        )?;
        ctx.executor.run_local(&psql(&safety_sql)?)?;
        tracing::info!("disabled outbound email and DOI registration; test banner added");

        ctx.systemctl("start", env.payara_service())?;

        Ok(Some(format!(
            "restored {prod_db} into {db_name} ({replaced} hostname rewrites)"
        )))
    }
}

pub struct FilesStep;

impl<'a> Step<SyncContext<'a>> for FilesStep {
    fn name(&self) -> &'static str {
        "files"
    }

    fn enablement(&self, ctx: &SyncContext<'a>) -> Enablement {
        if ctx.skips.files {
            Enablement::disabled("--skip-files")
        } else {
            Enablement::Enabled
        }
    }

    fn describe(&self, ctx: &SyncContext<'a>) -> String {
        let mut text = format!(
            "copy {} from production to {} excluding {} credential patterns",
            ctx.env.get_or("PRODUCTION_DATAVERSE_CONTENT_STORAGE", "?"),
            ctx.env.get_or("DATAVERSE_CONTENT_STORAGE", "?"),
            SENSITIVE_EXCLUDES.len() + ctx.settings.extra_excludes.len()
        );
        if let Some(limit) = &ctx.settings.max_file_size {
            text.push_str(&format!(", skipping files over {limit}"));
        }
        text
    }

    fn execute(&self, ctx: &mut SyncContext<'a>) -> Result<Option<String>> {
        let local = ctx.env.require("DATAVERSE_CONTENT_STORAGE")?;
        let spec = CopySpec::new(
            ctx.remote(ctx.env.require("PRODUCTION_DATAVERSE_CONTENT_STORAGE")?)?,
            Location::Local(PathBuf::from(local)),
        )
        .contents()
        .excluding(SENSITIVE_EXCLUDES.iter().copied())
        .excluding(ctx.settings.extra_excludes.iter().cloned())
        .max_size(ctx.settings.max_file_size.clone());
        ctx.executor.copy(&spec)?;
        Ok(Some(format!("content store copied to {local}")))
    }
}

pub struct SolrStep;

impl<'a> Step<SyncContext<'a>> for SolrStep {
    fn name(&self) -> &'static str {
        "solr"
    }

    fn enablement(&self, ctx: &SyncContext<'a>) -> Enablement {
        if ctx.skips.solr {
            Enablement::disabled("--skip-solr")
        } else {
            Enablement::Enabled
        }
    }

    fn describe(&self, ctx: &SyncContext<'a>) -> String {
        format!(
            "copy Solr configuration to {} (and optionally the full index)",
            solr_conf_dir(ctx.env.get_or("SOLR_PATH", "?"))
        )
    }

    fn execute(&self, ctx: &mut SyncContext<'a>) -> Result<Option<String>> {
        let env = ctx.env;
        let local_conf = solr_conf_dir(env.require("SOLR_PATH")?);
        let remote_conf = solr_conf_dir(env.require("PRODUCTION_SOLR_PATH")?);
        ctx.executor.copy(
            &CopySpec::new(ctx.remote(remote_conf)?, Location::Local(PathBuf::from(&local_conf)))
                .contents(),
        )?;

        if !ctx.confirm.confirm(
            "Also copy the full Solr index from production? Solr is stopped while copying.",
            false,
        ) {
            return Ok(Some("configuration copied; index left in place".to_string()));
        }

        let local_data = format!("{}/data", solr_core_dir(env.require("SOLR_PATH")?));
        let remote_data = format!("{}/data", solr_core_dir(env.require("PRODUCTION_SOLR_PATH")?));
        ctx.systemctl("stop", env.solr_service())?;
        ctx.executor.copy(
            &CopySpec::new(ctx.remote(remote_data)?, Location::Local(PathBuf::from(&local_data)))
                .contents(),
        )?;
        ctx.systemctl("start", env.solr_service())?;
        Ok(Some("configuration and index copied".to_string()))
    }
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) -> std::io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            collect_files(&path, out)?;
        } else {
            out.push(path);
        }
    }
    Ok(())
}

fn is_rewritable(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| REWRITTEN_EXTENSIONS.contains(&ext))
}

/// Rewrite configuration and script files under `dir` in place; returns how
/// many files changed.
pub fn rewrite_tree(dir: &Path, rules: &Rewrites) -> Result<usize> {
    let mut files = Vec::new();
    collect_files(dir, &mut files)?;
    files.sort();
    let mut changed = 0;
    for path in files.iter().filter(|p| is_rewritable(p)) {
        let Ok(text) = fs::read_to_string(path) else {
            tracing::debug!("skipping non-text file {}", path.display());
            continue;
        };
        let (rewritten, n) = rewrite::rewrite_config(&text, rules);
        if n > 0 {
            fs::write(path, rewritten)?;
            tracing::debug!("rewrote {n} reference(s) in {}", path.display());
            changed += 1;
        }
    }
    Ok(changed)
}

pub struct CounterStep;

impl<'a> Step<SyncContext<'a>> for CounterStep {
    fn name(&self) -> &'static str {
        "counter"
    }

    fn enablement(&self, ctx: &SyncContext<'a>) -> Enablement {
        ctx.counter_enablement()
    }

    fn describe(&self, ctx: &SyncContext<'a>) -> String {
        format!(
            "copy the counter processor from {} to {}, rewriting paths and domain",
            ctx.env.get_or("PRODUCTION_COUNTER_PROCESSOR_DIR", "?"),
            ctx.env.get_or("COUNTER_PROCESSOR_DIR", "?")
        )
    }

    fn execute(&self, ctx: &mut SyncContext<'a>) -> Result<Option<String>> {
        let env = ctx.env;
        let staged = ctx.scratch.join("counter");
        fs::create_dir_all(&staged)?;
        ctx.executor.copy(
            &CopySpec::new(
                ctx.remote(env.require("PRODUCTION_COUNTER_PROCESSOR_DIR")?)?,
                Location::Local(staged.clone()),
            )
            .contents()
            .excluding(SENSITIVE_EXCLUDES.iter().copied()),
        )?;

        let changed = rewrite_tree(&staged, &staging_rewrites(env)?)?;

        let local = env.require("COUNTER_PROCESSOR_DIR")?;
        ctx.executor.copy(
            &CopySpec::new(Location::Local(staged), Location::Local(PathBuf::from(local))).contents(),
        )?;
        Ok(Some(format!("installed to {local}; {changed} file(s) rewritten")))
    }
}

pub struct CronStep;

impl<'a> Step<SyncContext<'a>> for CronStep {
    fn name(&self) -> &'static str {
        "cron"
    }

    fn describe(&self, ctx: &SyncContext<'a>) -> String {
        format!(
            "write production's crontab for {}, rewritten for staging, to {} for review",
            ctx.env.get_or("DATAVERSE_USER", "?"),
            ctx.settings.cron_review_path.display()
        )
    }

    fn execute(&self, ctx: &mut SyncContext<'a>) -> Result<Option<String>> {
        let user = ctx.env.require("DATAVERSE_USER")?;
        let listing = match ctx
            .executor
            .run_remote(&ctx.production()?, &format!("crontab -l -u {}", quote(user)))
        {
            Ok(out) => out.output,
            Err(OpsError::Execution { output, .. }) if output.contains("no crontab for") => {
                tracing::info!("{user} has no crontab on production");
                String::new()
            }
            Err(err) => return Err(err),
        };

        let lines = rewrite::parse_crontab(&listing);
        let jobs = lines
            .iter()
            .filter(|l| matches!(l, rewrite::CronLine::Job { .. }))
            .count();
        let (lines, changed) = rewrite::rewrite_crontab(lines, &staging_rewrites(ctx.env)?);

        let path = &ctx.settings.cron_review_path;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, rewrite::render_crontab(&lines))?;
        tracing::warn!(
            "crontab written to {} and NOT installed; review it, then run: crontab -u {user} {}",
            path.display(),
            path.display()
        );
        Ok(Some(format!(
            "{jobs} job(s), {changed} rewritten; review {}",
            path.display()
        )))
    }
}

pub struct PermissionsStep;

impl PermissionsStep {
    /// Trees written by the enabled copy steps and their owners.
    fn targets(ctx: &SyncContext<'_>) -> Vec<(String, String)> {
        let env = ctx.env;
        let mut targets = Vec::new();
        if !ctx.skips.files {
            if let (Some(path), Some(owner)) =
                (env.get("DATAVERSE_CONTENT_STORAGE"), env.get("DATAVERSE_USER"))
            {
                targets.push((path.to_string(), owner.to_string()));
            }
        }
        if !ctx.skips.solr {
            if let (Some(path), Some(owner)) = (env.get("SOLR_PATH"), env.get("SOLR_USER")) {
                targets.push((solr_core_dir(path), owner.to_string()));
            }
        }
        if ctx.counter_enablement() == Enablement::Enabled {
            if let (Some(path), Some(owner)) =
                (env.get("COUNTER_PROCESSOR_DIR"), env.get("DATAVERSE_USER"))
            {
                targets.push((path.to_string(), owner.to_string()));
            }
        }
        targets
    }
}

impl<'a> Step<SyncContext<'a>> for PermissionsStep {
    fn name(&self) -> &'static str {
        "permissions"
    }

    fn enablement(&self, ctx: &SyncContext<'a>) -> Enablement {
        if Self::targets(ctx).is_empty() {
            Enablement::disabled("no copied trees")
        } else {
            Enablement::Enabled
        }
    }

    fn describe(&self, ctx: &SyncContext<'a>) -> String {
        let listed: Vec<String> = Self::targets(ctx)
            .into_iter()
            .map(|(path, owner)| format!("{path} to {owner}"))
            .collect();
        format!("chown {}", listed.join(", "))
    }

    fn execute(&self, ctx: &mut SyncContext<'a>) -> Result<Option<String>> {
        let targets = Self::targets(ctx);
        for (path, owner) in &targets {
            ctx.executor.run_local(
                &LocalCommand::new("chown")
                    .arg("-R")
                    .arg(format!("{owner}:"))
                    .arg(path.as_str()),
            )?;
        }
        Ok(Some(format!("{} tree(s) re-owned", targets.len())))
    }
}

pub fn pipeline<'a>() -> Pipeline<SyncContext<'a>> {
    Pipeline::new("sync")
        .step(BackupStep)
        .step(DatabaseStep)
        .step(FilesStep)
        .step(SolrStep)
        .step(CounterStep)
        .step(CronStep)
        .step(PermissionsStep)
}

/// Validate, guard, confirm, then run every sync step.
pub fn run(ctx: &mut SyncContext<'_>, dry_run: bool) -> std::result::Result<ExecutionReport, Aborted> {
    let report = ExecutionReport::new("sync", dry_run);

    if let Err(err) = ctx
        .env
        .validate_required(&[env::LOCAL, env::PRODUCTION, env::DATABASE])
    {
        return Err(Aborted::before_start(report, err));
    }
    if let Err(err) = guard::preflight(ctx.env, ctx.executor, ctx.admin, ctx.confirm) {
        return Err(Aborted::before_start(report, err));
    }

    if !dry_run {
        let prompt = format!(
            "Overwrite this server ({}) with data from production ({})?",
            ctx.env.get_or("DOMAIN", "?"),
            ctx.env.get_or("PRODUCTION_DOMAIN", "?")
        );
        if !ctx.confirm.confirm(&prompt, false) {
            return Err(Aborted::before_start(
                report,
                OpsError::Declined("sync not confirmed".to_string()),
            ));
        }
    }

    pipeline().run_into(report, ctx)
}
