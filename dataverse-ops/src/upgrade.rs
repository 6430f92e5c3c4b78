//! In-place upgrade of the application server, the application package,
//! Solr and the metadata blocks.
//!
//! Progress is tracked by [`UpgradeState`]. Each mandatory step moves the
//! state forward once its action succeeded; optional steps move it only when
//! they actually ran. The runtime swap keeps the previous installation as a
//! snapshot, and any failure after that point offers (never forces) a
//! rollback to it.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::admin::{same_version, wait_for_version, AdminApi};
use crate::backup::{solr_conf_dir, solr_core_dir, sql_literal};
use crate::checksum::{self, fetch_verified};
use crate::confirm::Confirm;
use crate::domain_xml;
use crate::env::{self, Environment};
use crate::error::{OpsError, Result};
use crate::executor::{Executor, LocalCommand};
use crate::opts::{Skips, UpgradeSettings};
use crate::pipeline::{Aborted, Enablement, Pipeline, Step};
use crate::report::{ExecutionReport, StepOutcome};

/// Generated state under `domain1` that the new runtime must rebuild.
const GENERATED_DIRS: &[&str] = &["generated", "osgi-cache", "lib/databases"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum UpgradeState {
    NotStarted,
    VersionChecked,
    Undeployed,
    ServerStopped,
    DirsCleaned,
    RuntimeUpgraded,
    Deployed,
    ServerRestarted,
    MetadataUpdated,
    SearchUpgraded,
    FeaturesEnabled,
    Reindexed,
    Verified,
    Done,
    RolledBack,
}

impl UpgradeState {
    const ORDER: [UpgradeState; 13] = [
        UpgradeState::NotStarted,
        UpgradeState::VersionChecked,
        UpgradeState::Undeployed,
        UpgradeState::ServerStopped,
        UpgradeState::DirsCleaned,
        UpgradeState::RuntimeUpgraded,
        UpgradeState::Deployed,
        UpgradeState::ServerRestarted,
        UpgradeState::MetadataUpdated,
        UpgradeState::SearchUpgraded,
        UpgradeState::FeaturesEnabled,
        UpgradeState::Reindexed,
        UpgradeState::Verified,
    ];

    pub fn is_optional(self) -> bool {
        matches!(
            self,
            UpgradeState::SearchUpgraded | UpgradeState::FeaturesEnabled | UpgradeState::Reindexed
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, UpgradeState::Done | UpgradeState::RolledBack)
    }

    /// The closest earlier state that may not be skipped.
    fn mandatory_predecessor(self) -> Option<UpgradeState> {
        Self::ORDER
            .iter()
            .copied()
            .take_while(|s| *s < self)
            .filter(|s| !s.is_optional())
            .last()
    }

    /// Move to `to`. Forward only, without skipping a mandatory state;
    /// `Done` and `RolledBack` end the machine from anywhere.
    pub fn advance(&mut self, to: UpgradeState) -> Result<()> {
        let allowed = if self.is_terminal() {
            false
        } else if to.is_terminal() {
            true
        } else {
            to > *self && self.mandatory_predecessor_reached(to)
        };
        if !allowed {
            return Err(OpsError::InvalidTransition {
                from: self.to_string(),
                to: to.to_string(),
            });
        }
        tracing::debug!("upgrade state {self} -> {to}");
        *self = to;
        Ok(())
    }

    fn mandatory_predecessor_reached(self, to: UpgradeState) -> bool {
        to.mandatory_predecessor().map_or(true, |pred| self >= pred)
    }
}

impl fmt::Display for UpgradeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

pub struct UpgradeContext<'a> {
    pub env: &'a Environment,
    pub settings: &'a UpgradeSettings,
    pub skips: Skips,
    pub executor: &'a dyn Executor,
    pub admin: &'a dyn AdminApi,
    pub confirm: &'a dyn Confirm,
    pub scratch: &'a Path,
    pub state: UpgradeState,
    /// Set by any step whose effect needs a full reindex.
    pub reindex_required: bool,
    /// Previous runtime, moved aside by the runtime swap.
    pub snapshot: Option<PathBuf>,
}

impl<'a> UpgradeContext<'a> {
    pub fn new(
        env: &'a Environment,
        settings: &'a UpgradeSettings,
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
            state: UpgradeState::NotStarted,
            reindex_required: false,
            snapshot: None,
        }
    }

    fn payara(&self) -> Result<PathBuf> {
        Ok(PathBuf::from(self.env.require("PAYARA")?.trim_end_matches('/')))
    }

    fn asadmin(&self) -> Result<LocalCommand> {
        Ok(LocalCommand::new(
            self.payara()?.join("bin").join("asadmin").display().to_string(),
        ))
    }

    fn run(&self, cmd: LocalCommand) -> Result<String> {
        Ok(self.executor.run_local(&cmd)?.output)
    }

    fn systemctl(&self, action: &str, service: &str) -> Result<()> {
        self.run(LocalCommand::new("systemctl").args([action, service]))?;
        Ok(())
    }

    fn restart_and_wait(&self) -> Result<String> {
        self.systemctl("restart", self.env.payara_service())?;
        wait_for_version(
            self.admin,
            Duration::from_secs(self.settings.poll_interval_secs),
            Duration::from_secs(self.settings.poll_timeout_secs),
        )
    }

    fn move_path(&self, from: &Path, to: &Path) -> Result<()> {
        self.run(
            LocalCommand::new("mv")
                .arg(from.display().to_string())
                .arg(to.display().to_string()),
        )?;
        Ok(())
    }

    /// Undeploy every `dataverse*` application; returns their names.
    fn undeploy_all(&self) -> Result<Vec<String>> {
        let listing = self.run(self.asadmin()?.arg("list-applications"))?;
        let apps = deployed_applications(&listing);
        for app in &apps {
            tracing::info!("undeploying {app}");
            self.run(self.asadmin()?.args(["undeploy", app.as_str()]))?;
        }
        Ok(apps)
    }
}

/// Application names from `asadmin list-applications` output.
pub fn deployed_applications(listing: &str) -> Vec<String> {
    listing
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .filter(|name| name.starts_with("dataverse"))
        .map(str::to_string)
        .collect()
}

pub struct CheckVersionStep;

impl<'a> Step<UpgradeContext<'a>> for CheckVersionStep {
    fn name(&self) -> &'static str {
        "check-version"
    }

    fn describe(&self, ctx: &UpgradeContext<'a>) -> String {
        format!(
            "check that version {} is deployed",
            ctx.env.get_or("CURRENT_VERSION", "?")
        )
    }

    fn execute(&self, ctx: &mut UpgradeContext<'a>) -> Result<Option<String>> {
        let expected = ctx.env.require("CURRENT_VERSION")?;
        let actual = ctx.admin.version()?;
        if !same_version(&actual, expected) {
            return Err(OpsError::VersionMismatch {
                expected: expected.to_string(),
                actual,
            });
        }
        ctx.state.advance(UpgradeState::VersionChecked)?;
        Ok(Some(format!("running {actual}")))
    }
}

pub struct UndeployStep;

impl<'a> Step<UpgradeContext<'a>> for UndeployStep {
    fn name(&self) -> &'static str {
        "undeploy"
    }

    fn describe(&self, _ctx: &UpgradeContext<'a>) -> String {
        "undeploy the running Dataverse application".to_string()
    }

    fn execute(&self, ctx: &mut UpgradeContext<'a>) -> Result<Option<String>> {
        let apps = ctx.undeploy_all()?;
        ctx.state.advance(UpgradeState::Undeployed)?;
        if apps.is_empty() {
            Ok(Some("nothing was deployed".to_string()))
        } else {
            Ok(Some(format!("undeployed {}", apps.join(", "))))
        }
    }
}

pub struct StopServerStep;

impl<'a> Step<UpgradeContext<'a>> for StopServerStep {
    fn name(&self) -> &'static str {
        "stop-server"
    }

    fn describe(&self, ctx: &UpgradeContext<'a>) -> String {
        format!("stop service {}", ctx.env.payara_service())
    }

    fn execute(&self, ctx: &mut UpgradeContext<'a>) -> Result<Option<String>> {
        ctx.systemctl("stop", ctx.env.payara_service())?;
        ctx.state.advance(UpgradeState::ServerStopped)?;
        Ok(None)
    }
}

pub struct CleanDirsStep;

impl<'a> Step<UpgradeContext<'a>> for CleanDirsStep {
    fn name(&self) -> &'static str {
        "clean-dirs"
    }

    fn describe(&self, _ctx: &UpgradeContext<'a>) -> String {
        format!("remove {} from domain1", GENERATED_DIRS.join(", "))
    }

    fn execute(&self, ctx: &mut UpgradeContext<'a>) -> Result<Option<String>> {
        let domain = domain_xml::domain_dir(&ctx.payara()?);
        for dir in GENERATED_DIRS {
            ctx.run(LocalCommand::new("rm").arg("-rf").arg(domain.join(dir).display().to_string()))?;
        }
        ctx.state.advance(UpgradeState::DirsCleaned)?;
        Ok(None)
    }
}

pub struct UpgradeRuntimeStep;

impl UpgradeRuntimeStep {
    fn snapshot_path(payara: &Path, current_version: &str) -> PathBuf {
        PathBuf::from(format!("{}.pre-{current_version}", payara.display()))
    }
}

impl<'a> Step<UpgradeContext<'a>> for UpgradeRuntimeStep {
    fn name(&self) -> &'static str {
        "upgrade-runtime"
    }

    fn describe(&self, ctx: &UpgradeContext<'a>) -> String {
        format!(
            "install {} over {} (keeping the old runtime as a snapshot) and add {} JVM option(s)",
            checksum::file_name_from_url(ctx.env.get_or("PAYARA_DOWNLOAD_URL", "?")),
            ctx.env.get_or("PAYARA", "?"),
            ctx.settings.jvm_options.len()
        )
    }

    fn execute(&self, ctx: &mut UpgradeContext<'a>) -> Result<Option<String>> {
        let env = ctx.env;
        let payara = ctx.payara()?;
        let archive = fetch_verified(
            ctx.admin,
            env.require("PAYARA_DOWNLOAD_URL")?,
            env.require("PAYARA_SHA256")?,
            ctx.scratch,
        )?;

        let unpacked = ctx.scratch.join("runtime");
        fs::create_dir_all(&unpacked)?;
        ctx.run(
            LocalCommand::new("unzip")
                .arg("-q")
                .arg(archive.display().to_string())
                .arg("-d")
                .arg(unpacked.display().to_string()),
        )?;

        let snapshot = Self::snapshot_path(&payara, env.require("CURRENT_VERSION")?);
        if snapshot.exists() {
            return Err(OpsError::invalid_options(format!(
                "{} already exists; move it away before upgrading again",
                snapshot.display()
            )));
        }
        ctx.move_path(&payara, &snapshot)?;
        ctx.snapshot = Some(snapshot.clone());
        tracing::info!("previous runtime kept at {}", snapshot.display());

        ctx.move_path(&unpacked.join(&ctx.settings.runtime_dir_name), &payara)?;

        let new_domain = domain_xml::domain_dir(&payara);
        let dist = new_domain.with_file_name("domain1.dist");
        ctx.move_path(&new_domain, &dist)?;
        ctx.run(
            LocalCommand::new("cp")
                .arg("-a")
                .arg(domain_xml::domain_dir(&snapshot).display().to_string())
                .arg(new_domain.display().to_string()),
        )?;

        let required: Vec<&str> = ctx.settings.jvm_options.iter().map(String::as_str).collect();
        let changes = domain_xml::ensure_jvm_options_file(&payara, &required)?;
        for change in &changes {
            tracing::info!("domain.xml: {change}");
        }

        ctx.run(
            LocalCommand::new("chown")
                .arg("-R")
                .arg(format!("{}:", env.require("DATAVERSE_USER")?))
                .arg(payara.display().to_string()),
        )?;

        ctx.state.advance(UpgradeState::RuntimeUpgraded)?;
        Ok(Some(format!(
            "runtime replaced; {} JVM option change(s)",
            changes.len()
        )))
    }
}

pub struct DeployStep;

impl<'a> Step<UpgradeContext<'a>> for DeployStep {
    fn name(&self) -> &'static str {
        "deploy"
    }

    fn describe(&self, ctx: &UpgradeContext<'a>) -> String {
        format!(
            "deploy {}",
            checksum::file_name_from_url(ctx.env.get_or("WAR_DOWNLOAD_URL", "?"))
        )
    }

    fn execute(&self, ctx: &mut UpgradeContext<'a>) -> Result<Option<String>> {
        let war = fetch_verified(
            ctx.admin,
            ctx.env.require("WAR_DOWNLOAD_URL")?,
            ctx.env.require("WAR_SHA256")?,
            ctx.scratch,
        )?;
        ctx.systemctl("start", ctx.env.payara_service())?;
        ctx.run(ctx.asadmin()?.arg("deploy").arg(war.display().to_string()))?;
        ctx.state.advance(UpgradeState::Deployed)?;
        Ok(Some(format!("deployed {}", war.display())))
    }
}

pub struct RestartServerStep;

impl<'a> Step<UpgradeContext<'a>> for RestartServerStep {
    fn name(&self) -> &'static str {
        "restart-server"
    }

    fn describe(&self, ctx: &UpgradeContext<'a>) -> String {
        format!(
            "restart {} and wait up to {}s for the version endpoint",
            ctx.env.payara_service(),
            ctx.settings.poll_timeout_secs
        )
    }

    fn execute(&self, ctx: &mut UpgradeContext<'a>) -> Result<Option<String>> {
        let version = ctx.restart_and_wait()?;
        ctx.state.advance(UpgradeState::ServerRestarted)?;
        Ok(Some(format!("answering as {version}")))
    }
}

pub struct UpdateMetadataStep;

impl<'a> Step<UpgradeContext<'a>> for UpdateMetadataStep {
    fn name(&self) -> &'static str {
        "update-metadata"
    }

    fn describe(&self, ctx: &UpgradeContext<'a>) -> String {
        format!(
            "load {} metadata block(s)",
            ctx.env.list("METADATA_BLOCK_URLS").len()
        )
    }

    fn execute(&self, ctx: &mut UpgradeContext<'a>) -> Result<Option<String>> {
        let urls = ctx.env.list("METADATA_BLOCK_URLS");
        let dir = ctx.scratch.join("metadata");
        fs::create_dir_all(&dir)?;
        for url in &urls {
            let tsv = dir.join(checksum::file_name_from_url(url));
            ctx.admin.download(url, &tsv)?;
            let answer = ctx.admin.load_metadata_block(&tsv)?;
            tracing::debug!("loaded {}: {}", tsv.display(), answer.trim());
        }
        ctx.state.advance(UpgradeState::MetadataUpdated)?;
        if urls.is_empty() {
            Ok(Some("no metadata blocks configured".to_string()))
        } else {
            Ok(Some(format!("{} block(s) loaded", urls.len())))
        }
    }
}

pub struct UpgradeSearchStep;

impl<'a> Step<UpgradeContext<'a>> for UpgradeSearchStep {
    fn name(&self) -> &'static str {
        "upgrade-search"
    }

    fn enablement(&self, ctx: &UpgradeContext<'a>) -> Enablement {
        if ctx.skips.solr {
            return Enablement::disabled("--skip-solr");
        }
        let missing = ctx.env.missing_keys(&env::SEARCH_UPGRADE);
        if missing.is_empty() {
            Enablement::Enabled
        } else {
            Enablement::disabled(format!("search upgrade settings incomplete ({})", missing.join(", ")))
        }
    }

    fn describe(&self, ctx: &UpgradeContext<'a>) -> String {
        let mut text = format!(
            "install new schema.xml and solrconfig.xml into {}",
            solr_conf_dir(ctx.env.get_or("SOLR_PATH", "?"))
        );
        if ctx.env.is_complete(&env::FIELD_UPDATER) {
            text.push_str(" and update custom metadata fields");
        }
        text
    }

    fn execute(&self, ctx: &mut UpgradeContext<'a>) -> Result<Option<String>> {
        if !ctx
            .confirm
            .confirm("Upgrade the Solr schema and configuration now? Solr is stopped meanwhile.", true)
        {
            return Ok(Some("declined by operator".to_string()));
        }
        let env = ctx.env;
        let solr_path = env.require("SOLR_PATH")?;
        let conf = solr_conf_dir(solr_path);
        let dir = ctx.scratch.join("solr");
        fs::create_dir_all(&dir)?;

        let schema = dir.join("schema.xml");
        let config = dir.join("solrconfig.xml");
        ctx.admin.download(env.require("SOLR_SCHEMA_URL")?, &schema)?;
        ctx.admin.download(env.require("SOLR_CONFIG_URL")?, &config)?;

        ctx.systemctl("stop", env.solr_service())?;
        for file in [&schema, &config] {
            ctx.run(
                LocalCommand::new("cp")
                    .arg(file.display().to_string())
                    .arg(format!("{conf}/")),
            )?;
        }

        let mut detail = "schema and configuration installed".to_string();
        if env.is_complete(&env::FIELD_UPDATER) {
            let script = dir.join("update-fields.sh");
            ctx.admin.download(env.require("UPDATE_FIELDS_URL")?, &script)?;
            let fields = dir.join("fields.txt");
            fs::write(&fields, ctx.admin.solr_field_schema()?)?;
            ctx.run(
                LocalCommand::new("bash")
                    .arg(script.display().to_string())
                    .arg(format!("{conf}/schema.xml"))
                    .arg(fields.display().to_string()),
            )?;
            let blocks = env.list("CUSTOM_METADATA_BLOCKS");
            tracing::info!("schema fields updated for {}", blocks.join(", "));
            detail.push_str(&format!("; fields updated for {} custom block(s)", blocks.len()));
        }

        ctx.run(
            LocalCommand::new("chown")
                .arg("-R")
                .arg(format!("{}:", env.require("SOLR_USER")?))
                .arg(solr_core_dir(solr_path)),
        )?;
        ctx.systemctl("start", env.solr_service())?;

        ctx.reindex_required = true;
        ctx.state.advance(UpgradeState::SearchUpgraded)?;
        Ok(Some(detail))
    }
}

pub struct EnableFeaturesStep;

impl<'a> Step<UpgradeContext<'a>> for EnableFeaturesStep {
    fn name(&self) -> &'static str {
        "enable-features"
    }

    fn enablement(&self, ctx: &UpgradeContext<'a>) -> Enablement {
        if ctx.env.is_complete(&env::FEATURES) {
            Enablement::Enabled
        } else {
            Enablement::disabled("no FEATURE_FLAGS")
        }
    }

    fn describe(&self, ctx: &UpgradeContext<'a>) -> String {
        format!(
            "offer feature flags {}",
            ctx.env.list("FEATURE_FLAGS").join(", ")
        )
    }

    fn execute(&self, ctx: &mut UpgradeContext<'a>) -> Result<Option<String>> {
        let current = ctx.run(ctx.asadmin()?.arg("list-jvm-options"))?;
        let mut enabled = Vec::new();
        let mut already = Vec::new();
        for flag in ctx.env.list("FEATURE_FLAGS") {
            let key = feature_option_key(&flag);
            let existing = jvm_option_value(&current, &key);
            if existing == Some("true") {
                tracing::info!("feature flag {flag} is already enabled");
                already.push(flag);
                continue;
            }
            if !ctx.confirm.confirm(&format!("Enable feature flag '{flag}'?"), false) {
                continue;
            }
            // create-jvm-options refuses to add a key that is already set.
            if let Some(value) = existing {
                ctx.run(ctx.asadmin()?.arg("delete-jvm-options").arg(format!("{key}={value}")))?;
            }
            ctx.run(ctx.asadmin()?.arg("create-jvm-options").arg(format!("{key}=true")))?;
            enabled.push(flag);
        }
        if enabled.is_empty() {
            if already.is_empty() {
                return Ok(Some("none enabled".to_string()));
            }
            return Ok(Some(format!("already enabled: {}", already.join(", "))));
        }
        ctx.reindex_required = true;
        ctx.restart_and_wait()?;
        ctx.state.advance(UpgradeState::FeaturesEnabled)?;
        Ok(Some(format!("enabled {}", enabled.join(", "))))
    }
}

fn feature_option_key(flag: &str) -> String {
    format!("-Ddataverse.feature.{flag}")
}

/// Value of `key` in `asadmin list-jvm-options` output, if it is set.
pub fn jvm_option_value<'l>(listing: &'l str, key: &str) -> Option<&'l str> {
    listing.lines().find_map(|line| {
        let (name, value) = line.trim().split_once('=')?;
        (name == key).then(|| value.trim())
    })
}

pub struct ReindexStep;

impl<'a> Step<UpgradeContext<'a>> for ReindexStep {
    fn name(&self) -> &'static str {
        "reindex"
    }

    fn describe(&self, ctx: &UpgradeContext<'a>) -> String {
        if ctx.reindex_required {
            "start a full reindex".to_string()
        } else {
            "offer a full reindex".to_string()
        }
    }

    fn execute(&self, ctx: &mut UpgradeContext<'a>) -> Result<Option<String>> {
        if ctx.reindex_required {
            tracing::info!("a full reindex is required by earlier changes");
        } else if !ctx.confirm.confirm("Start a full reindex now?", false) {
            return Ok(Some("not requested".to_string()));
        }
        let answer = ctx.admin.reindex()?;
        tracing::debug!("reindex: {}", answer.trim());
        ctx.reindex_required = false;
        ctx.state.advance(UpgradeState::Reindexed)?;
        Ok(Some("full reindex started".to_string()))
    }
}

/// Advisory SQL for moving one dataset field to a new field type.
pub fn field_migration_sql(field: &str, field_type: &str) -> String {
    let field = sql_literal(field);
    let field_type = sql_literal(&field_type.to_ascii_uppercase());
    format!(
        "-- Review, then run against the Dataverse database and reindex.\n\
         -- Values that do not fit the new type must be fixed first:\n\
         SELECT dsf.id, dfv.value\n\
         \x20 FROM datasetfieldvalue dfv\n\
         \x20 JOIN datasetfield dsf ON dsf.id = dfv.datasetfield_id\n\
         \x20 JOIN datasetfieldtype dft ON dft.id = dsf.datasetfieldtype_id\n\
         \x20WHERE dft.name = {field};\n\
         \n\
         UPDATE datasetfieldtype SET fieldtype = {field_type} WHERE name = {field};\n"
    )
}

pub struct MigrateFieldStep;

impl<'a> Step<UpgradeContext<'a>> for MigrateFieldStep {
    fn name(&self) -> &'static str {
        "migrate-field"
    }

    fn enablement(&self, ctx: &UpgradeContext<'a>) -> Enablement {
        if ctx.env.is_complete(&env::FIELD_MIGRATION) {
            Enablement::Enabled
        } else {
            Enablement::disabled("no field migration configured")
        }
    }

    fn describe(&self, ctx: &UpgradeContext<'a>) -> String {
        format!(
            "write advisory SQL for field {} to {}",
            ctx.env.get_or("MIGRATION_FIELD_NAME", "?"),
            ctx.settings.review_dir.display()
        )
    }

    fn execute(&self, ctx: &mut UpgradeContext<'a>) -> Result<Option<String>> {
        let sql = field_migration_sql(
            ctx.env.require("MIGRATION_FIELD_NAME")?,
            ctx.env.require("MIGRATION_FIELD_TYPE")?,
        );
        fs::create_dir_all(&ctx.settings.review_dir)?;
        let path = ctx.settings.review_dir.join("field-migration.sql");
        fs::write(&path, &sql)?;
        tracing::warn!(
            "field migration is NOT applied automatically; run {} by hand:\n{sql}",
            path.display()
        );

        if ctx
            .confirm
            .confirm("Reindex once the migration SQL has been applied?", false)
        {
            ctx.admin.reindex()?;
            return Ok(Some(format!("SQL at {}; reindex started", path.display())));
        }
        Ok(Some(format!("SQL at {}", path.display())))
    }
}

pub struct VerifyStep;

impl<'a> Step<UpgradeContext<'a>> for VerifyStep {
    fn name(&self) -> &'static str {
        "verify"
    }

    fn describe(&self, ctx: &UpgradeContext<'a>) -> String {
        format!(
            "check that version {} is deployed",
            ctx.env.get_or("TARGET_VERSION", "?")
        )
    }

    fn execute(&self, ctx: &mut UpgradeContext<'a>) -> Result<Option<String>> {
        let expected = ctx.env.require("TARGET_VERSION")?;
        let actual = ctx.admin.version()?;
        if !same_version(&actual, expected) {
            return Err(OpsError::VersionMismatch {
                expected: expected.to_string(),
                actual,
            });
        }
        ctx.state.advance(UpgradeState::Verified)?;
        Ok(Some(format!("running {actual}")))
    }
}

pub fn pipeline<'a>() -> Pipeline<UpgradeContext<'a>> {
    Pipeline::new("upgrade")
        .step(CheckVersionStep)
        .step(UndeployStep)
        .step(StopServerStep)
        .step(CleanDirsStep)
        .step(UpgradeRuntimeStep)
        .step(DeployStep)
        .step(RestartServerStep)
        .step(UpdateMetadataStep)
        .step(UpgradeSearchStep)
        .step(EnableFeaturesStep)
        .step(ReindexStep)
        .step(MigrateFieldStep)
        .step(VerifyStep)
}

/// Restore the snapshot taken before the runtime swap.
fn roll_back(ctx: &UpgradeContext<'_>, snapshot: &Path) -> Result<String> {
    let payara = ctx.payara()?;
    if let Err(err) = ctx.undeploy_all() {
        tracing::warn!("undeploy during rollback failed: {err}");
    }
    if let Err(err) = ctx.systemctl("stop", ctx.env.payara_service()) {
        tracing::warn!("stopping the server during rollback failed: {err}");
    }
    let failed = PathBuf::from(format!(
        "{}.failed-{}",
        payara.display(),
        ctx.env.get_or("TARGET_VERSION", "upgrade")
    ));
    // The swap can fail between moving the old runtime aside and putting
    // the new one in place.
    let kept = if payara.exists() {
        ctx.move_path(&payara, &failed)?;
        Some(failed)
    } else {
        tracing::warn!("{} is missing; restoring the snapshot in its place", payara.display());
        None
    };
    ctx.move_path(snapshot, &payara)?;
    ctx.systemctl("start", ctx.env.payara_service())?;
    tracing::warn!(
        "runtime restored; redeploy the {} application package",
        ctx.env.get_or("CURRENT_VERSION", "previous")
    );
    Ok(match kept {
        Some(failed) => format!(
            "restored {}; failed runtime kept at {}",
            snapshot.display(),
            failed.display()
        ),
        None => format!("restored {}", snapshot.display()),
    })
}

/// Ask whether to roll back after a failure and record the outcome.
fn offer_rollback(ctx: &mut UpgradeContext<'_>, report: &mut ExecutionReport, failed_step: &str) {
    let Some(snapshot) = ctx.snapshot.clone() else {
        return;
    };
    let prompt = format!(
        "Upgrade failed at '{failed_step}'. Roll back to the previous runtime at {}?",
        snapshot.display()
    );
    if !ctx.confirm.confirm(&prompt, false) {
        report.record("rollback", StepOutcome::Skipped, "declined by operator");
        finish(ctx, UpgradeState::Done);
        return;
    }
    match roll_back(ctx, &snapshot) {
        Ok(detail) => {
            report.record("rollback", StepOutcome::Ok, detail);
            finish(ctx, UpgradeState::RolledBack);
        }
        Err(err) => {
            tracing::error!("rollback failed: {err}");
            report.record("rollback", StepOutcome::Failed, err.to_string());
        }
    }
}

fn finish(ctx: &mut UpgradeContext<'_>, to: UpgradeState) {
    if let Err(err) = ctx.state.advance(to) {
        tracing::warn!("{err}");
    }
}

/// Validate, confirm, run every upgrade step, and offer a rollback when a
/// step fails after the runtime snapshot exists.
pub fn run(ctx: &mut UpgradeContext<'_>, dry_run: bool) -> std::result::Result<ExecutionReport, Aborted> {
    let report = ExecutionReport::new("upgrade", dry_run);
    if let Err(err) = ctx.env.validate_required(&[env::UPGRADE]) {
        return Err(Aborted::before_start(report, err));
    }

    if !dry_run {
        let prompt = format!(
            "Upgrade this server from {} to {}? The application is unavailable meanwhile.",
            ctx.env.get_or("CURRENT_VERSION", "?"),
            ctx.env.get_or("TARGET_VERSION", "?")
        );
        if !ctx.confirm.confirm(&prompt, false) {
            return Err(Aborted::before_start(
                report,
                OpsError::Declined("upgrade not confirmed".to_string()),
            ));
        }
    }

    match pipeline().run_into(report, ctx) {
        Ok(report) => {
            if !dry_run {
                finish(ctx, UpgradeState::Done);
            }
            Ok(report)
        }
        Err(mut aborted) => {
            let step = aborted.step.clone().unwrap_or_default();
            offer_rollback(ctx, &mut aborted.report, &step);
            Err(aborted)
        }
    }
}
