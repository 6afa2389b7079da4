//! VirtualBox VMs cloned from stemcells.
//!
//! A [`Vm`] is a handle: an id plus the collaborators needed to act on it.
//! Nothing about the VM is cached; power state is read from VirtualBox on
//! every call.
//!
//! ```text
//! Factory::create ─► clonevm ─► set_props ─► configure_nics ─► configure_agent
//!                         ─► attach_ephemeral_disk ─► start
//!        └─ any failure after clonevm ─► Vm::delete (logged) ─► original error
//! ```
//!
//! Per-VM state that VirtualBox does not keep lives in the VM store
//! (`<store>/vms/<vm-id>/`): the agent env, metadata and the disk
//! attachment journal.

use anyhow::{Context, Result, bail};
use tracing::{info, warn};

pub mod agent_env;
pub mod disks;
pub mod factory;
pub mod hot_plug;
pub mod networks;
pub mod nics;
pub mod port_devices;
pub mod props;
pub mod store;

pub use agent_env::{AgentEnv, AgentOptions};
pub use factory::{Factory, FactoryOpts};
pub use networks::{Network, Networks};
pub use port_devices::{Controller, DiskHint, PortDevices};
pub use props::VmProps;
pub use store::Store;

use crate::disk;
use crate::driver::exec::{ExecuteOpts, is_missing_vm_err};
use crate::driver::Driver;

const STARTED_MARKER: &str = "has been successfully started";

// ---------------------------------------------------------------------------
// Power state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VmState {
    Running,
    Paused,
    PoweredOff,
    /// VirtualBox lost track of the VM's files.
    Inaccessible,
    Other(String),
}

impl VmState {
    fn parse(output: &str) -> Result<Self> {
        if output.lines().any(|l| l.trim() == "name=\"<inaccessible>\"") {
            return Ok(VmState::Inaccessible);
        }
        let state = output
            .lines()
            .find_map(|l| l.trim().strip_prefix("VMState=\"")?.strip_suffix('"'))
            .with_context(|| format!("Unknown VM state:\nOutput: '{output}'"))?;
        Ok(match state {
            "running" => VmState::Running,
            "paused" => VmState::Paused,
            "poweroff" => VmState::PoweredOff,
            other => VmState::Other(other.to_string()),
        })
    }
}

// ---------------------------------------------------------------------------
// Vm handle
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct Vm {
    id: String,
    driver: Driver,
    store: Store,
    port_devices: PortDevices,
    disks: disk::Factory,
    /// Stemcell API version of the current request.
    stemcell_api_version: u32,
}

impl Vm {
    pub fn new(
        id: impl Into<String>,
        driver: Driver,
        store: Store,
        port_devices: PortDevices,
        disks: disk::Factory,
        stemcell_api_version: u32,
    ) -> Self {
        Self {
            id: id.into(),
            driver,
            store,
            port_devices,
            disks,
            stemcell_api_version,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn exists(&self) -> Result<bool> {
        match self.show_info().await {
            Ok(_) => Ok(true),
            Err(err) if is_missing_vm_err(&err) => Ok(false),
            Err(err) => Err(err),
        }
    }

    pub async fn state(&self) -> Result<VmState> {
        VmState::parse(&self.show_info().await?)
    }

    pub async fn is_running(&self) -> Result<bool> {
        Ok(self.state().await? == VmState::Running)
    }

    async fn show_info(&self) -> Result<String> {
        self.driver
            .run(&["showvminfo", &self.id, "--machinereadable"])
            .await
    }

    /// Boot the VM. `startvm` sometimes exits non-zero for a VM that did
    /// start, so its output decides.
    pub async fn start(&self, gui: bool) -> Result<()> {
        let mode = if gui { "gui" } else { "headless" };
        info!(vm = %self.id, mode, "Starting VM");
        let output = self
            .driver
            .run_with_opts(
                &["startvm", &self.id, "--type", mode],
                ExecuteOpts {
                    ignore_non_zero_exit: true,
                },
            )
            .await?;
        if !output.contains(STARTED_MARKER) {
            bail!("Starting VM '{}':\nOutput: '{}'", self.id, output.trim());
        }
        Ok(())
    }

    pub async fn halt(&self) -> Result<()> {
        info!(vm = %self.id, "Powering off VM");
        self.driver.run(&["controlvm", &self.id, "poweroff"]).await?;
        Ok(())
    }

    pub async fn halt_if_running(&self) -> Result<()> {
        if self.is_running().await? {
            self.halt().await?;
        }
        Ok(())
    }

    pub async fn reboot(&self) -> Result<()> {
        self.halt_if_running().await?;
        self.start(false).await
    }

    pub async fn set_metadata(&self, meta: &serde_json::Value) -> Result<()> {
        let bytes = serde_json::to_vec(meta).context("Marshaling VM metadata")?;
        self.store
            .put("metadata.json", &bytes)
            .await
            .context("Saving VM metadata")
    }

    /// Tear the VM down: power off, release persistent disks, unregister
    /// (deleting attached media), then remove ephemeral disk directories and
    /// the VM store. Disk errors block deletion.
    pub async fn delete(&self) -> Result<()> {
        info!(vm = %self.id, "Deleting VM");

        if self.exists().await? {
            self.halt_if_running().await?;
            self.detach_persistent_disks()
                .await
                .context("Detaching persistent disks")?;

            if let Err(err) = self.driver.run(&["unregistervm", &self.id, "--delete"]).await {
                if !is_missing_vm_err(&err) {
                    return Err(err.context("Unregistering VM"));
                }
            }
        } else {
            warn!(vm = %self.id, "VM is not registered, removing its files only");
        }

        for id in self.ephemeral_disk_ids().await? {
            self.disks.find(&id).remove_files().await?;
        }
        self.store.delete().await.context("Deleting VM store")
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
