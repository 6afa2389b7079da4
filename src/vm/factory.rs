//! VM provisioning pipeline.
//!
//! `create` runs a fixed sequence of steps. Everything after `clonevm`
//! happens to a registered VM, so any failure from there on deletes that VM
//! again before the error is returned; a failure of the deletion itself is
//! only logged so the caller sees what actually went wrong.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info};
use uuid::Uuid;

use super::agent_env::{AgentEnv, AgentOptions};
use super::networks::Networks;
use super::port_devices::{Controller, PortDevices};
use super::props::VmProps;
use super::store::Store;
use super::Vm;
use crate::disk;
use crate::driver::{Driver, Runner};
use crate::network::HostNetworks;
use crate::stemcell::Stemcell;

#[derive(Debug, Clone)]
pub struct FactoryOpts {
    /// Parent of all VM stores (`<store>/vms`).
    pub dir_path: String,
    pub storage_controller: Controller,
    /// Reconcile host networks before cloning.
    pub auto_enable_networks: bool,
}

pub struct Factory {
    opts: FactoryOpts,
    driver: Driver,
    runner: Arc<dyn Runner>,
    disks: disk::Factory,
    host: HostNetworks,
    agent: AgentOptions,
    stemcell_api_version: u32,
}

impl Factory {
    pub fn new(
        opts: FactoryOpts,
        driver: Driver,
        runner: Arc<dyn Runner>,
        disks: disk::Factory,
        host: HostNetworks,
        agent: AgentOptions,
        stemcell_api_version: u32,
    ) -> Self {
        Self {
            opts,
            driver,
            runner,
            disks,
            host,
            agent,
            stemcell_api_version,
        }
    }

    pub fn find(&self, id: &str) -> Vm {
        let store = Store::new(
            format!("{}/{}", self.opts.dir_path.trim_end_matches('/'), id),
            self.runner.clone(),
        );
        let port_devices = PortDevices::new(self.driver.clone(), id, self.opts.storage_controller);
        Vm::new(
            id,
            self.driver.clone(),
            store,
            port_devices,
            self.disks.clone(),
            self.stemcell_api_version,
        )
    }

    pub async fn create(
        &self,
        agent_id: &str,
        stemcell: &Stemcell,
        props: &VmProps,
        mut networks: Networks,
        env: serde_json::Value,
    ) -> Result<Vm> {
        if self.opts.auto_enable_networks {
            self.enable_networks(&networks)
                .await
                .context("Enabling networks")?;
        }

        let vm = self.clone_vm(stemcell).await?;

        match self.provision(&vm, agent_id, props, &mut networks, env).await {
            Ok(()) => Ok(vm),
            Err(err) => {
                if let Err(cleanup) = vm.delete().await {
                    error!(vm = %vm.id(), error = ?cleanup, "Failed to clean up partially created VM");
                }
                Err(err)
            }
        }
    }

    async fn enable_networks(&self, networks: &Networks) -> Result<()> {
        for (name, net) in networks {
            let intent = net.intent()?;
            self.host
                .reconcile(&intent)
                .await
                .with_context(|| format!("Reconciling network '{name}'"))?;
        }
        Ok(())
    }

    async fn clone_vm(&self, stemcell: &Stemcell) -> Result<Vm> {
        let uuid = Uuid::new_v4().to_string();
        let id = format!("vm-{uuid}");
        info!(vm = %id, stemcell = %stemcell.id(), "Cloning VM");

        self.driver
            .run(&[
                "clonevm",
                stemcell.id(),
                "--snapshot",
                stemcell.snapshot_name(),
                "--options",
                "link",
                "--name",
                &id,
                "--uuid",
                &uuid,
                "--register",
            ])
            .await
            .context("Cloning VM")?;

        Ok(self.find(&id))
    }

    async fn provision(
        &self,
        vm: &Vm,
        agent_id: &str,
        props: &VmProps,
        networks: &mut Networks,
        env: serde_json::Value,
    ) -> Result<()> {
        vm.set_props(props).await.context("Setting VM properties")?;

        vm.configure_nics(networks, &self.host)
            .await
            .context("Configuring NICs")?;

        let agent_env = AgentEnv::for_vm(agent_id, vm.id(), networks, env, &self.agent);
        vm.configure_agent(&agent_env)
            .await
            .context("Initial agent configuration")?;

        let ephemeral = self
            .disks
            .create(props.ephemeral_disk)
            .await
            .context("Creating ephemeral disk")?;
        if let Err(err) = vm.attach_ephemeral_disk(&ephemeral).await {
            // A journaled disk goes away with the VM; anything else is ours.
            let journaled = vm
                .ephemeral_disk_ids()
                .await
                .map(|ids| ids.iter().any(|id| id == ephemeral.id()))
                .unwrap_or(true);
            if !journaled {
                if let Err(cleanup) = ephemeral.delete().await {
                    error!(disk = %ephemeral.id(), error = ?cleanup, "Failed to clean up ephemeral disk");
                }
            }
            return Err(err.context("Attaching ephemeral disk"));
        }

        vm.start(props.gui).await.context("Starting VM")
    }
}
