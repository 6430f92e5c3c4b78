pub mod admin;
pub mod backup;
pub mod checksum;
pub mod confirm;
pub mod domain_xml;
pub mod env;
pub mod error;
pub mod executor;
pub mod guard;
pub mod logging;
pub mod opts;
pub mod pipeline;
pub mod report;
pub mod rewrite;
pub mod sync;
pub mod upgrade;
pub mod workspace;

pub use error::{OpsError, Result};
pub use opts::{Mode, Options};

use admin::HttpAdmin;
use confirm::{AssumeDefault, Confirm, TerminalConfirm};
use env::Environment;
use executor::ProcessExecutor;
use pipeline::Aborted;
use report::ExecutionReport;
use sync::SyncContext;
use upgrade::UpgradeContext;
use workspace::ScratchWorkspace;

/// Run the selected workflow against the real system.
///
/// The scratch workspace lives for the duration of this call and is removed
/// before it returns.
pub fn run(opts: &Options) -> std::result::Result<ExecutionReport, Aborted> {
    let setup = |err: OpsError| {
        Aborted::before_start(ExecutionReport::new(opts.mode.name(), opts.dry_run), err)
    };

    let env = Environment::load(&opts.env_file).map_err(setup)?;
    match env.origin() {
        Some(path) => tracing::info!("configuration from {}", path.display()),
        None => tracing::info!("configuration from the process environment"),
    }

    let workspace = ScratchWorkspace::create().map_err(|err| setup(err.into()))?;
    workspace.install_interrupt_cleanup();

    let executor = ProcessExecutor::new();
    let admin = HttpAdmin::new(env.api_url()).map_err(setup)?;
    let confirm: &dyn Confirm = if opts.non_interactive {
        &AssumeDefault
    } else {
        &TerminalConfirm
    };

    if opts.dry_run {
        tracing::info!("DRY RUN: nothing will be changed");
    }

    match opts.mode {
        Mode::Sync => {
            let mut ctx = SyncContext::new(
                &env,
                &opts.settings.sync,
                &executor,
                &admin,
                confirm,
                workspace.path(),
            );
            ctx.skips = opts.skips;
            sync::run(&mut ctx, opts.dry_run)
        }
        Mode::Upgrade => {
            let mut ctx = UpgradeContext::new(
                &env,
                &opts.settings.upgrade,
                &executor,
                &admin,
                confirm,
                workspace.path(),
            );
            ctx.skips = opts.skips;
            let result = upgrade::run(&mut ctx, opts.dry_run);
            tracing::info!("upgrade finished in state {}", ctx.state);
            result
        }
    }
}
