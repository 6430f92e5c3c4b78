use std::fs;
use std::path::Path;

use tempfile::TempDir;

/// Process-owned scratch directory (`dvops-*` under the system temp dir).
///
/// Removed when dropped. [`ScratchWorkspace::install_interrupt_cleanup`]
/// also removes it on Ctrl-C or SIGTERM, where destructors do not run.
#[derive(Debug)]
pub struct ScratchWorkspace {
    dir: TempDir,
}

impl ScratchWorkspace {
    pub fn create() -> std::io::Result<Self> {
        let dir = tempfile::Builder::new().prefix("dvops-").tempdir()?;
        tracing::debug!("scratch workspace at {}", dir.path().display());
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Remove the directory and exit with status 130 on interrupt.
    pub fn install_interrupt_cleanup(&self) {
        let path = self.dir.path().to_path_buf();
        let result = ctrlc::set_handler(move || {
            eprintln!("interrupted; removing {}", path.display());
            let _ = fs::remove_dir_all(&path);
            std::process::exit(130);
        });
        if let Err(err) = result {
            tracing::warn!("could not install interrupt handler: {err}");
        }
    }
}
