//! Storage changes on a possibly running VM.
//!
//! VirtualBox cannot reconfigure storage of a running machine, but it will
//! silently do so while the machine is paused:
//!
//! ```text
//! setextradata SilentReconfigureWhilePaused 1
//! running? ─yes─► pause ─► change ─► resume
//!     └──no─────────────► change
//! ```
//!
//! Resume is attempted even when the change fails; a VM left paused after a
//! failed attach would never come back on its own.

use std::future::Future;

use anyhow::{Context, Result};
use tracing::{debug, error};

use super::Vm;

impl Vm {
    pub(crate) async fn hot_plug_if<F, Fut>(&self, necessary: bool, change: F) -> Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        if necessary {
            self.hot_plug(change).await
        } else {
            change().await
        }
    }

    pub(crate) async fn hot_plug<F, Fut>(&self, change: F) -> Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let id = self.id();
        self.driver
            .run(&["setextradata", id, "VBoxInternal2/SilentReconfigureWhilePaused", "1"])
            .await?;

        let paused = if self.is_running().await? {
            debug!(vm = %id, "Pausing VM for storage change");
            self.driver.run(&["controlvm", id, "pause"]).await?;
            true
        } else {
            false
        };

        let result = change().await;

        if paused {
            let resumed = self
                .driver
                .run(&["controlvm", id, "resume"])
                .await
                .context("Resuming VM");
            match (&result, resumed) {
                (Ok(()), Err(err)) => return Err(err),
                (Err(_), Err(err)) => {
                    error!(vm = %id, error = ?err, "Failed to resume VM after failed storage change");
                }
                (_, Ok(_)) => {}
            }
        }
        result
    }
}
