use std::fs;
use std::path::Path;

use dataverse_ops as dv;
use dv::confirm::CannedAnswers;
use dv::env::Environment;
use dv::error::OpsError;
use dv::guard::SafetyViolation;
use dv::opts::SyncSettings;
use dv::report::StepOutcome;
use dv::sync::SyncContext;
use tempfile::TempDir;

mod common;
use common::*;

fn settings(root: &Path) -> SyncSettings {
    SyncSettings {
        backup_root: root.join("backups"),
        cron_review_path: root.join("review").join("crontab.txt"),
        ..SyncSettings::default()
    }
}

struct Harness {
    root: TempDir,
    scratch: TempDir,
    settings: SyncSettings,
}

impl Harness {
    fn new() -> Self {
        let root = TempDir::new().unwrap();
        write_domain_xml(&root.path().join("payara6"), STAGING_DOMAIN);
        let settings = settings(root.path());
        Self {
            root,
            scratch: TempDir::new().unwrap(),
            settings,
        }
    }

    fn env(&self) -> EnvBuilder {
        sync_env(self.root.path())
    }

    fn run(
        &self,
        env: &Environment,
        executor: &FakeExecutor,
        admin: &FakeAdmin,
        confirm: &CannedAnswers,
        dry_run: bool,
    ) -> Result<dv::report::ExecutionReport, dv::pipeline::Aborted> {
        let mut ctx = SyncContext::new(
            env,
            &self.settings,
            executor,
            admin,
            confirm,
            self.scratch.path(),
        );
        dv::sync::run(&mut ctx, dry_run)
    }
}

fn matching_versions() -> (FakeExecutor, FakeAdmin) {
    (
        FakeExecutor::new()
            .respond("api/info/version", &version_body("6.3"))
            .respond("mktemp", "/tmp/dvops-dump.k3Jd9QxZ\n"),
        FakeAdmin::new(["6.3"]),
    )
}

#[test]
fn dry_run_only_reads_versions() {
    let h = Harness::new();
    let env = h.env().build();
    let (executor, admin) = matching_versions();
    let confirm = CannedAnswers::new([]);

    let report = h.run(&env, &executor, &admin, &confirm, true).unwrap();

    assert_eq!(report.count(StepOutcome::WouldRun), 7);
    assert_eq!(report.count(StepOutcome::Ok), 0);
    let calls = executor.texts();
    assert_eq!(calls.len(), 1, "unexpected calls: {calls:?}");
    assert!(calls[0].contains("curl -fsS http://localhost:8080/api/info/version"));
    assert_eq!(admin.calls(), vec!["version"]);
    assert!(confirm.asked().is_empty());
    assert!(!h.settings.backup_root.exists());
    assert!(!h.settings.cron_review_path.exists());
}

#[test]
fn local_database_on_production_host_is_refused() {
    let h = Harness::new();
    let env = h.env().set("DB_HOST", "DB-PROD.example.edu.").build();
    let (executor, admin) = matching_versions();
    let confirm = CannedAnswers::new([true]);

    let aborted = h.run(&env, &executor, &admin, &confirm, false).unwrap_err();

    match &aborted.error {
        OpsError::Safety(SafetyViolation::DatabaseIsProduction { matched_key, .. }) => {
            assert_eq!(*matched_key, "PRODUCTION_DB_HOST")
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(aborted.step, None);
    assert!(aborted.report.records().is_empty());
    assert!(executor.calls().is_empty());
    assert_eq!(aborted.exit_code(), 1);
}

#[test]
fn production_identity_is_refused_even_in_dry_run() {
    let h = Harness::new();
    write_domain_xml(&h.root.path().join("payara6"), PRODUCTION_DOMAIN);
    let env = h.env().build();
    let (executor, admin) = matching_versions();
    let confirm = CannedAnswers::new([]);

    let aborted = h.run(&env, &executor, &admin, &confirm, true).unwrap_err();

    assert!(matches!(
        aborted.error,
        OpsError::Safety(SafetyViolation::IdentityIsProduction { .. })
    ));
    assert!(aborted.error.to_string().contains(PRODUCTION_DOMAIN));
    assert!(executor.calls().is_empty());
}

#[test]
fn unknown_identity_needs_an_explicit_answer() {
    let h = Harness::new();
    fs::remove_file(dv::domain_xml::config_path(&h.root.path().join("payara6"))).unwrap();
    let env = h.env().build();
    let (executor, admin) = matching_versions();
    let confirm = CannedAnswers::new([]);

    let aborted = h.run(&env, &executor, &admin, &confirm, true).unwrap_err();

    assert!(matches!(aborted.error, OpsError::Declined(_)));
    assert_eq!(aborted.exit_code(), 0);
    assert_eq!(confirm.asked().len(), 1);
    assert!(confirm.asked()[0].contains("NOT the production instance"));
}

#[test]
fn version_mismatch_is_confirmed_not_fatal() {
    let h = Harness::new();
    let env = h.env().build();
    let executor = FakeExecutor::new().respond("api/info/version", &version_body("6.4"));
    let admin = FakeAdmin::new(["6.3"]);
    let confirm = CannedAnswers::new([true]);

    let report = h.run(&env, &executor, &admin, &confirm, true).unwrap();

    assert_eq!(confirm.asked().len(), 1);
    assert!(confirm.asked()[0].contains("Production runs 6.4"));
    assert_eq!(report.count(StepOutcome::WouldRun), 7);
}

#[test]
fn missing_keys_are_reported_together() {
    let h = Harness::new();
    let env = h
        .env()
        .unset("PRODUCTION_SERVER")
        .unset("DB_PORT")
        .set("SOLR_USER", "   ")
        .build();
    let (executor, admin) = matching_versions();
    let confirm = CannedAnswers::new([]);

    let aborted = h.run(&env, &executor, &admin, &confirm, true).unwrap_err();

    assert_eq!(
        aborted.error.missing_keys(),
        vec!["SOLR_USER", "PRODUCTION_SERVER", "DB_PORT"]
    );
    assert!(executor.calls().is_empty());
}

#[test]
fn incomplete_counter_settings_disable_the_counter_step() {
    let h = Harness::new();
    let env = h.env().unset("COUNTER_PROCESSOR_DIR").build();
    let (executor, admin) = matching_versions();
    let confirm = CannedAnswers::new([]);

    let report = h.run(&env, &executor, &admin, &confirm, true).unwrap();

    assert_eq!(report.outcome_of("counter"), Some(StepOutcome::Skipped));
    let record = report.records().iter().find(|r| r.step == "counter").unwrap();
    assert!(record.message.contains("COUNTER_PROCESSOR_DIR"));
    assert_eq!(report.count(StepOutcome::WouldRun), 6);
}

#[test]
fn declining_the_overwrite_touches_nothing() {
    let h = Harness::new();
    let env = h.env().build();
    let (executor, admin) = matching_versions();
    let confirm = CannedAnswers::new([false]);

    let aborted = h.run(&env, &executor, &admin, &confirm, false).unwrap_err();

    assert!(matches!(aborted.error, OpsError::Declined(_)));
    assert_eq!(executor.calls().len(), 1);
    assert!(aborted.report.records().is_empty());
}

#[test]
fn full_sync_clones_and_rewrites_production() {
    let h = Harness::new();
    let env = h.env().build();
    let counter_stage = h.scratch.path().join("counter").display().to_string();
    let (executor, admin) = matching_versions();
    let executor = executor
        .on_copy_write(
            "production.sql",
            "",
            "INSERT INTO setting (name, content) VALUES (':SiteUrl', 'https://dataverse.example.edu');\n",
        )
        .on_copy_write(
            &counter_stage,
            "counter-processor-config.yaml",
            "platform_url: https://dataverse.example.edu\n\
             log_name_pattern: /usr/local/payara6/glassfish/domains/domain1/logs/mdc/counter_(yyyy-mm-dd).log\n",
        )
        .respond(
            "crontab -l",
            "# nightly stats\n\
             0 3 * * * /usr/local/counter-processor/run.sh https://dataverse.example.edu\n",
        );
    // overwrite: yes, full Solr index: no
    let confirm = CannedAnswers::new([true, false]);

    let report = h.run(&env, &executor, &admin, &confirm, false).unwrap();

    assert_eq!(report.count(StepOutcome::Ok), 7, "{:?}", report.records());

    let restored = fs::read_to_string(h.scratch.path().join("staging.sql")).unwrap();
    assert!(restored.contains("'https://staging.example.edu'"));
    assert!(!h.scratch.path().join("production.sql").exists());

    let stop = executor.position("systemctl stop payara").unwrap();
    let drop = executor.position("dropdb").unwrap();
    let create = executor.position("createdb").unwrap();
    let restore = executor.position("staging.sql").unwrap();
    let safety = executor.position("post-restore.sql").unwrap();
    let start = executor.position("systemctl start payara").unwrap();
    assert!(stop < drop && drop < create && create < restore);
    assert!(restore < safety && safety < start);
    let dump = executor.position("-f /tmp/dvops-dump.k3Jd9QxZ dvndb").unwrap();
    assert!(executor.position("mktemp -t dvops-dump.").unwrap() < dump);
    assert!(dump < executor.position("rm -f /tmp/dvops-dump.k3Jd9QxZ").unwrap());
    assert!(!executor.ran("systemctl stop solr"));

    let config = fs::read_to_string(
        h.scratch.path().join("counter").join("counter-processor-config.yaml"),
    )
    .unwrap();
    assert!(config.contains("platform_url: https://staging.example.edu"));
    let local_payara = h.root.path().join("payara6").display().to_string();
    assert!(config.contains(&format!("{local_payara}/glassfish/domains/domain1/logs")));

    let crontab = fs::read_to_string(&h.settings.cron_review_path).unwrap();
    assert!(crontab.starts_with("# nightly stats\n"));
    assert!(crontab.contains("https://staging.example.edu"));
    assert_eq!(
        executor.texts().iter().filter(|t| t.contains("crontab")).count(),
        1,
        "crontab must only be read"
    );

    assert!(executor.ran("chown -R dataverse:"));
    assert!(executor.ran("chown -R solr:"));
    assert!(executor.texts().iter().all(|t| !t.contains("staging-secret")));
    assert!(fs::read_dir(&h.settings.backup_root).unwrap().count() == 1);
}

#[test]
fn failing_step_stops_the_run() {
    let h = Harness::new();
    let env = h.env().build();
    let (executor, admin) = matching_versions();
    let executor = executor
        .on_copy_write("production.sql", "", "SELECT 1;\n")
        .fail_on("createdb", "createdb: error: permission denied to create database");
    let confirm = CannedAnswers::new([true]);

    let aborted = h.run(&env, &executor, &admin, &confirm, false).unwrap_err();

    assert_eq!(aborted.step.as_deref(), Some("database"));
    assert_eq!(aborted.report.outcome_of("backup"), Some(StepOutcome::Ok));
    assert_eq!(aborted.report.outcome_of("database"), Some(StepOutcome::Failed));
    assert_eq!(aborted.report.outcome_of("files"), None);
    assert!(!executor.ran("/usr/local/dvn/data"));
    assert!(aborted.to_string().contains("database"));
    assert!(aborted.error.to_string().contains("permission denied"));
}

#[test]
fn remote_dump_is_removed_when_the_transfer_fails() {
    let h = Harness::new();
    let env = h.env().build();
    let (executor, admin) = matching_versions();
    let executor = executor.fail_on("production.sql", "rsync: connection unexpectedly closed");
    let confirm = CannedAnswers::new([true]);

    let aborted = h.run(&env, &executor, &admin, &confirm, false).unwrap_err();

    assert_eq!(aborted.step.as_deref(), Some("database"));
    let failed_copy = executor.position("production.sql").unwrap();
    let cleanup = executor.position("rm -f /tmp/dvops-dump.k3Jd9QxZ").unwrap();
    assert!(failed_copy < cleanup);
    assert!(!executor.ran("dropdb"));
}

fn solr_only(
    h: &Harness,
    executor: &FakeExecutor,
    admin: &FakeAdmin,
    confirm: &CannedAnswers,
) -> Result<dv::report::ExecutionReport, dv::pipeline::Aborted> {
    let env = h.env().build();
    let mut ctx = SyncContext::new(
        &env,
        &h.settings,
        executor,
        admin,
        confirm,
        h.scratch.path(),
    );
    ctx.skips.backup = true;
    ctx.skips.db = true;
    ctx.skips.files = true;
    ctx.skips.counter = true;
    dv::sync::run(&mut ctx, false)
}

#[test]
fn full_index_copy_runs_while_solr_is_stopped() {
    let h = Harness::new();
    let (executor, admin) = matching_versions();
    // overwrite: yes, full Solr index: yes
    let confirm = CannedAnswers::new([true, true]);

    let report = solr_only(&h, &executor, &admin, &confirm).unwrap();

    assert_eq!(report.outcome_of("solr"), Some(StepOutcome::Ok));
    assert!(confirm.asked()[1].contains("full Solr index"));
    let conf = executor.position("collection1/conf").unwrap();
    let stop = executor.position("systemctl stop solr").unwrap();
    let data = executor.position("collection1/data").unwrap();
    let start = executor.position("systemctl start solr").unwrap();
    assert!(conf < stop && stop < data && data < start);
}

#[test]
fn failed_index_copy_aborts_the_sync() {
    let h = Harness::new();
    let (executor, admin) = matching_versions();
    let executor = executor.fail_on("collection1/data", "rsync: write failed: No space left on device");
    let confirm = CannedAnswers::new([true, true]);

    let aborted = solr_only(&h, &executor, &admin, &confirm).unwrap_err();

    assert_eq!(aborted.step.as_deref(), Some("solr"));
    assert_eq!(aborted.report.outcome_of("solr"), Some(StepOutcome::Failed));
    assert_eq!(aborted.report.outcome_of("cron"), None);
    assert!(!executor.ran("crontab -l"));
    assert!(aborted.error.to_string().contains("No space left"));
}

#[test]
fn skip_flags_disable_steps() {
    let h = Harness::new();
    let env = h.env().build();
    let (executor, admin) = matching_versions();
    let confirm = CannedAnswers::new([]);
    let mut ctx = SyncContext::new(
        &env,
        &h.settings,
        &executor,
        &admin,
        &confirm,
        h.scratch.path(),
    );
    ctx.skips.db = true;
    ctx.skips.files = true;
    ctx.skips.solr = true;
    ctx.skips.counter = true;
    ctx.skips.backup = true;

    let report = dv::sync::run(&mut ctx, true).unwrap();

    // Only cron remains, and permissions has nothing left to re-own.
    assert_eq!(report.count(StepOutcome::WouldRun), 1);
    assert_eq!(report.outcome_of("cron"), Some(StepOutcome::WouldRun));
    assert_eq!(report.outcome_of("permissions"), Some(StepOutcome::Skipped));
}
