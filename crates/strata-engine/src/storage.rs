//! Engine storage readiness.
//!
//! Storage counts as formatted once the format marker exists under the
//! mount. Formatting also creates the superblock. Waiters are released
//! through a `watch` channel so any number of them observe the same state.

use std::path::{Path, PathBuf};

use tokio::sync::watch;
use tracing::info;

use strata_core::{Context, ContextError};

use crate::error::{EngineError, EngineResult};
use crate::superblock::Superblock;

pub const FORMAT_MARKER: &str = ".strata_formatted";

#[derive(Debug)]
pub struct ScmStorage {
    mount: PathBuf,
    system: String,
    formatted: watch::Sender<bool>,
}

impl ScmStorage {
    pub fn new(mount: impl Into<PathBuf>, system: impl Into<String>) -> Self {
        let mount = mount.into();
        let formatted = mount.join(FORMAT_MARKER).exists();
        Self {
            mount,
            system: system.into(),
            formatted: watch::Sender::new(formatted),
        }
    }

    pub fn mount(&self) -> &Path {
        &self.mount
    }

    pub fn system(&self) -> &str {
        &self.system
    }

    pub fn is_formatted(&self) -> bool {
        *self.formatted.borrow()
    }

    /// Format the mount: create it if needed, write a fresh superblock unless
    /// one exists, then set the marker and release waiters.
    pub fn format(&self) -> EngineResult<()> {
        std::fs::create_dir_all(&self.mount).map_err(|e| EngineError::io(&self.mount, e))?;
        if Superblock::read(&self.mount)?.is_none() {
            Superblock::new(&self.system).write(&self.mount)?;
        }
        let marker = self.mount.join(FORMAT_MARKER);
        std::fs::write(&marker, b"").map_err(|e| EngineError::io(&marker, e))?;

        info!(mount = %self.mount.display(), "storage formatted");
        self.formatted.send_replace(true);
        Ok(())
    }

    /// Remove the superblock and the format marker.
    pub fn reset(&self) -> EngineResult<()> {
        Superblock::remove(&self.mount)?;
        let marker = self.mount.join(FORMAT_MARKER);
        match std::fs::remove_file(&marker) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(EngineError::io(marker, e)),
        }

        info!(mount = %self.mount.display(), "storage format reset");
        self.formatted.send_replace(false);
        Ok(())
    }

    /// Block until the storage is formatted or `ctx` is done.
    pub async fn wait_formatted(&self, ctx: &Context) -> Result<(), ContextError> {
        let mut rx = self.formatted.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = ctx.run(rx.wait_for(|formatted| *formatted)).await?;
        Ok(())
    }
}
