use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::domain_xml::DEFAULT_JVM_OPTIONS;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode { Sync, Upgrade }

impl Mode {
  pub fn name(self) -> &'static str {
    match self {
      Mode::Sync => "sync",
      Mode::Upgrade => "upgrade",
    }
  }
}

/// Steps switched off from the command line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Skips {
  pub db: bool,
  pub files: bool,
  pub solr: bool,
  pub counter: bool,
  pub backup: bool,
}

#[derive(Debug, Clone)]
pub struct SyncSettings {
  pub backup_root: PathBuf,
  pub cron_review_path: PathBuf,
  /// rsync size limit (`500M`, `2G`) for the content store copy.
  pub max_file_size: Option<String>,
  pub extra_excludes: Vec<String>,
}

impl Default for SyncSettings {
  fn default() -> Self {
    Self {
      backup_root: PathBuf::from("/var/backups/dataverse"),
      cron_review_path: PathBuf::from("/tmp/dataverse-sync-crontab.txt"),
      max_file_size: None,
      extra_excludes: Vec::new(),
    }
  }
}

#[derive(Debug, Clone)]
pub struct UpgradeSettings {
  pub poll_interval_secs: u64,
  pub poll_timeout_secs: u64,
  pub review_dir: PathBuf,
  pub jvm_options: Vec<String>,
  /// Top-level directory inside the runtime archive.
  pub runtime_dir_name: String,
}

impl Default for UpgradeSettings {
  fn default() -> Self {
    Self {
      poll_interval_secs: 5,
      poll_timeout_secs: 300,
      review_dir: PathBuf::from("/tmp/dataverse-upgrade"),
      jvm_options: DEFAULT_JVM_OPTIONS.iter().map(|s| s.to_string()).collect(),
      runtime_dir_name: "payara6".to_string(),
    }
  }
}

/// Tool settings; everything here has a default and may be overridden from
/// the TOML config file.
#[derive(Debug, Clone)]
pub struct Settings {
  pub log_file: PathBuf,
  pub sync: SyncSettings,
  pub upgrade: UpgradeSettings,
}

impl Default for Settings {
  fn default() -> Self {
    Self {
      log_file: PathBuf::from("dvops.log"),
      sync: SyncSettings::default(),
      upgrade: UpgradeSettings::default(),
    }
  }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileLogging {
  file: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileSync {
  backup_root: Option<PathBuf>,
  cron_review_path: Option<PathBuf>,
  max_file_size: Option<String>,
  extra_excludes: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileUpgrade {
  poll_interval_secs: Option<u64>,
  poll_timeout_secs: Option<u64>,
  review_dir: Option<PathBuf>,
  jvm_options: Option<Vec<String>>,
  runtime_dir_name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
  logging: Option<FileLogging>,
  sync: Option<FileSync>,
  upgrade: Option<FileUpgrade>,
}

macro_rules! apply_field {
  ($dest:expr, $src:expr, $field:ident) => {
    if let Some(value) = $src.$field {
      $dest.$field = value;
    }
  };
}

impl FileConfig {
  fn apply(self, settings: &mut Settings) {
    if let Some(logging) = self.logging {
      if let Some(file) = logging.file {
        settings.log_file = file;
      }
    }
    if let Some(sync) = self.sync {
      apply_field!(settings.sync, sync, backup_root);
      apply_field!(settings.sync, sync, cron_review_path);
      apply_field!(settings.sync, sync, extra_excludes);
      if sync.max_file_size.is_some() {
        settings.sync.max_file_size = sync.max_file_size;
      }
    }
    if let Some(upgrade) = self.upgrade {
      apply_field!(settings.upgrade, upgrade, poll_interval_secs);
      apply_field!(settings.upgrade, upgrade, poll_timeout_secs);
      apply_field!(settings.upgrade, upgrade, review_dir);
      apply_field!(settings.upgrade, upgrade, jvm_options);
      apply_field!(settings.upgrade, upgrade, runtime_dir_name);
    }
  }
}

#[derive(Debug, Clone)]
pub struct Options {
  pub mode: Mode,
  pub dry_run: bool,
  pub verbose: bool,
  pub skips: Skips,
  pub env_file: PathBuf,
  pub report_json: Option<PathBuf>,
  pub non_interactive: bool,
  /// Unrecognised arguments; reported once logging is up, otherwise ignored.
  pub unknown: Vec<String>,
  pub settings: Settings,
}

impl Options {
  pub fn new(mode: Mode) -> Self {
    Self {
      mode,
      dry_run: false,
      verbose: false,
      skips: Skips::default(),
      env_file: PathBuf::from(".env"),
      report_json: None,
      non_interactive: false,
      unknown: Vec::new(),
      settings: Settings::default(),
    }
  }
}

/// Why a command line could not be turned into [`Options`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Usage {
  Help,
  Error(String),
}

pub fn parse_args() -> Options {
  use std::env;
  let args: Vec<String> = env::args().skip(1).collect();
  let config_env = env::var("DVOPS_CONFIG").ok().filter(|v| !v.is_empty()).map(PathBuf::from);
  match parse_from(&args, config_env) {
    Ok(opts) => opts,
    Err(Usage::Help) => {
      print_help();
      std::process::exit(0);
    }
    Err(Usage::Error(msg)) => {
      eprintln!("error: {msg}");
      eprintln!("Run 'dvops --help' for usage.");
      std::process::exit(2);
    }
  }
}

/// Parse `args` (without the program name). `config_env` is the value of
/// `DVOPS_CONFIG`, if set; `--config` wins over it.
pub fn parse_from(args: &[String], config_env: Option<PathBuf>) -> Result<Options, Usage> {
  let mut mode = None;
  let mut config_override = config_env;
  let mut opts = Options::new(Mode::Sync);

  let mut it = args.iter();
  while let Some(arg) = it.next() {
    match arg.as_str() {
      "sync" if mode.is_none() => mode = Some(Mode::Sync),
      "upgrade" if mode.is_none() => mode = Some(Mode::Upgrade),
      "-h" | "--help" => return Err(Usage::Help),
      "--dry-run" | "-n" => opts.dry_run = true,
      "--verbose" | "-v" => opts.verbose = true,
      "--skip-db" => opts.skips.db = true,
      "--skip-files" => opts.skips.files = true,
      "--skip-solr" => opts.skips.solr = true,
      "--skip-counter" => opts.skips.counter = true,
      "--skip-backup" => opts.skips.backup = true,
      "--non-interactive" => opts.non_interactive = true,
      "--env" => opts.env_file = PathBuf::from(value_for("--env", it.next())?),
      "--config" => config_override = Some(PathBuf::from(value_for("--config", it.next())?)),
      "--report-json" => {
        opts.report_json = Some(PathBuf::from(value_for("--report-json", it.next())?))
      }
      other => match other.split_once('=') {
        Some(("--env", value)) => opts.env_file = PathBuf::from(inline_value("--env", value)?),
        Some(("--config", value)) => config_override = Some(PathBuf::from(inline_value("--config", value)?)),
        Some(("--report-json", value)) => {
          opts.report_json = Some(PathBuf::from(inline_value("--report-json", value)?))
        }
        _ => opts.unknown.push(other.to_string()),
      },
    }
  }

  opts.mode = mode.ok_or_else(|| Usage::Error("missing command: expected 'sync' or 'upgrade'".to_string()))?;

  let (path, explicit) = match config_override {
    Some(path) => (path, true),
    None => (PathBuf::from("dvops.toml"), false),
  };
  match load_settings(&path) {
    Ok(settings) => opts.settings = settings,
    Err(ConfigError::Io(err)) => {
      use std::io::ErrorKind;
      if explicit || err.kind() != ErrorKind::NotFound {
        return Err(Usage::Error(format!("failed to read config at {}: {}", path.display(), err)));
      }
    }
    Err(ConfigError::Parse(err)) => {
      return Err(Usage::Error(format!("failed to parse config at {}: {}", path.display(), err)));
    }
  }

  Ok(opts)
}

fn value_for(flag: &str, value: Option<&String>) -> Result<String, Usage> {
  value
    .cloned()
    .ok_or_else(|| Usage::Error(format!("{flag} requires a value")))
}

fn inline_value(flag: &str, value: &str) -> Result<String, Usage> {
  if value.is_empty() {
    return Err(Usage::Error(format!("{flag}= requires a value")));
  }
  Ok(value.to_string())
}

enum ConfigError {
  Io(std::io::Error),
  Parse(toml::de::Error),
}

fn load_settings(path: &Path) -> Result<Settings, ConfigError> {
  let raw = fs::read_to_string(path).map_err(ConfigError::Io)?;
  parse_settings(&raw).map_err(ConfigError::Parse)
}

fn parse_settings(raw: &str) -> Result<Settings, toml::de::Error> {
  let config: FileConfig = toml::from_str(raw)?;
  let mut settings = Settings::default();
  config.apply(&mut settings);
  Ok(settings)
}

const HELP: &str = "dvops - staging sync and in-place upgrades for Dataverse\n\
Usage: dvops <sync|upgrade> [options]\n\
\n\
Commands:\n\
  sync                        Clone production database, files, Solr config\n\
                              and counter processor onto this staging server\n\
  upgrade                     Upgrade Payara, the Dataverse WAR, Solr and\n\
                              metadata blocks in place\n\
\n\
Sync steps:\n\
  --skip-backup               Do not back up the local instance first\n\
  --skip-db                   Leave the local database untouched\n\
  --skip-files                Do not copy the content store\n\
  --skip-solr                 Do not copy Solr configuration (sync) or\n\
                              upgrade Solr (upgrade)\n\
  --skip-counter              Do not copy the counter processor\n\
\n\
Execution behavior & output:\n\
  --dry-run, -n               Report every action without performing it\n\
  --verbose, -v               Show debug messages on the console\n\
  --non-interactive           Answer every confirmation with its default\n\
  --report-json FILE          Write the step report as JSON\n\
\n\
Misc:\n\
  --env FILE                  Env file with instance settings (default .env;\n\
                              the process environment is used if absent)\n\
  --config FILE               Tool settings in TOML (default dvops.toml, or\n\
                              $DVOPS_CONFIG)\n\
  -h, --help                  Show this help message\n\
";

pub fn print_help() {
  print!("{}", HELP);
}
