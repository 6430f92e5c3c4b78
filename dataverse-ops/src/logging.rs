use std::fs::OpenOptions;
use std::io;
use std::path::Path;
use std::sync::Mutex;

use time::macros::format_description;
use tracing_subscriber::filter::{EnvFilter, LevelFilter};
use tracing_subscriber::fmt::{self, time::UtcTime};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

/// Overrides the console filter, e.g. `DVOPS_LOG=debug`.
pub const LOG_ENV: &str = "DVOPS_LOG";

/// Install console and log file output.
///
/// The console shows INFO and above (DEBUG with `verbose`); the log file is
/// appended to across runs and always gets DEBUG. If the file cannot be
/// opened the run continues with console output only.
pub fn init(verbose: bool, log_file: &Path) {
  let timer = UtcTime::new(format_description!("[year]-[month]-[day] [hour]:[minute]:[second]"));

  let console_filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| {
    EnvFilter::default().add_directive(if verbose { LevelFilter::DEBUG } else { LevelFilter::INFO }.into())
  });
  let console = fmt::layer()
    .with_writer(io::stderr)
    .with_target(false)
    .with_timer(timer.clone())
    .with_filter(console_filter);

  let file = match OpenOptions::new().create(true).append(true).open(log_file) {
    Ok(file) => Some(
      fmt::layer()
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .with_target(false)
        .with_timer(timer)
        .with_filter(LevelFilter::DEBUG),
    ),
    Err(err) => {
      eprintln!("warning: cannot open log file {}: {err}", log_file.display());
      None
    }
  };

  // A second init (tests, embedding) keeps the first subscriber.
  let _ = tracing_subscriber::registry().with(console).with(file).try_init();
}
