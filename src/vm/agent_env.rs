//! Agent environment delivered to the guest.
//!
//! The environment is kept as `env.json` in the VM store. Before boot that
//! file is all there is; once the VM has been started, every change also
//! rewrites `env.iso` (a config drive labelled `ENV`) and remounts it in
//! the VM's DVD drive so the agent picks it up.

use std::collections::BTreeMap;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::Vm;
use super::networks::Networks;
use super::port_devices::DiskHint;
use crate::config_drive;

const ENV_JSON: &str = "env.json";
const ENV_ISO: &str = "env.iso";
const ENV_LABEL: &str = "ENV";

// ---------------------------------------------------------------------------
// Agent options (from the CPI configuration)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlobstoreOptions {
    #[serde(default, alias = "Provider", alias = "Type")]
    pub provider: String,
    #[serde(default, alias = "Options")]
    pub options: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentOptions {
    #[serde(default, alias = "Mbus")]
    pub mbus: String,
    #[serde(default, alias = "NTP")]
    pub ntp: Vec<String>,
    #[serde(default, alias = "Blobstore")]
    pub blobstore: BlobstoreOptions,
}

impl AgentOptions {
    pub fn validate(&self) -> Result<()> {
        if self.mbus.is_empty() {
            bail!("Must provide non-empty Mbus");
        }
        if self.blobstore.provider.is_empty() {
            bail!("Must provide non-empty Blobstore.Provider");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Environment document
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmRef {
    pub name: String,
    pub id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DisksEnv {
    pub system: DiskHint,
    #[serde(default)]
    pub ephemeral: Option<DiskHint>,
    #[serde(default)]
    pub persistent: BTreeMap<String, DiskHint>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentEnv {
    pub agent_id: String,
    pub vm: VmRef,
    pub mbus: String,
    #[serde(default)]
    pub ntp: Vec<String>,
    pub blobstore: BlobstoreOptions,
    pub networks: Networks,
    pub disks: DisksEnv,
    #[serde(default)]
    pub env: serde_json::Value,
}

impl AgentEnv {
    /// Environment for a freshly cloned VM: no disks besides the system
    /// disk, which the agent expects at index 0.
    pub fn for_vm(
        agent_id: &str,
        vm_id: &str,
        networks: &Networks,
        env: serde_json::Value,
        options: &AgentOptions,
    ) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            vm: VmRef {
                name: vm_id.to_string(),
                id: vm_id.to_string(),
            },
            mbus: options.mbus.clone(),
            ntp: options.ntp.clone(),
            blobstore: options.blobstore.clone(),
            networks: networks.clone(),
            disks: DisksEnv {
                system: DiskHint::String("0".into()),
                ..DisksEnv::default()
            },
            env: if env.is_null() {
                serde_json::Value::Object(Default::default())
            } else {
                env
            },
        }
    }

    pub fn attach_ephemeral_disk(&mut self, hint: DiskHint) {
        self.disks.ephemeral = Some(hint);
    }

    pub fn attach_persistent_disk(&mut self, disk_id: &str, hint: DiskHint) {
        self.disks.persistent.insert(disk_id.to_string(), hint);
    }

    pub fn detach_persistent_disk(&mut self, disk_id: &str) {
        self.disks.persistent.remove(disk_id);
    }
}

// ---------------------------------------------------------------------------
// Delivery
// ---------------------------------------------------------------------------

impl Vm {
    /// Write the initial environment. Only `env.json` is written: the guest
    /// has not booted yet and the drive is mounted by the first
    /// reconfiguration.
    pub async fn configure_agent(&self, env: &AgentEnv) -> Result<()> {
        self.write_agent_env(env).await.map(drop)
    }

    async fn write_agent_env(&self, env: &AgentEnv) -> Result<Vec<u8>> {
        let bytes = serde_json::to_vec(env).context("Marshalling agent env")?;
        self.store
            .put(ENV_JSON, &bytes)
            .await
            .context("Updating agent env")?;
        Ok(bytes)
    }

    pub async fn agent_env(&self) -> Result<AgentEnv> {
        let bytes = self.store.get(ENV_JSON).await.context("Fetching agent env")?;
        serde_json::from_slice(&bytes).context("Unmarshalling agent env")
    }

    /// Apply `update` to the stored environment and hand the result to the
    /// guest through a freshly mounted config drive.
    pub(crate) async fn reconfigure_agent<F>(&self, hot_plug: bool, update: F) -> Result<()>
    where
        F: FnOnce(&mut AgentEnv),
    {
        let mut env = self.agent_env().await?;
        update(&mut env);
        let contents = self.write_agent_env(&env).await?;

        let iso = config_drive::encode(ENV_LABEL, &contents).context("Marshaling agent env to ISO")?;
        self.store
            .put(ENV_ISO, &iso)
            .await
            .context("Updating agent env")?;
        debug!(vm = %self.id(), bytes = iso.len(), "Wrote agent env config drive");

        let iso_path = self.store.path(ENV_ISO);
        self.hot_plug_if(hot_plug, || async {
            let cdrom = self.port_devices.cdrom().await?;
            self.port_devices.mount_iso(&cdrom, &iso_path).await
        })
        .await
        .context("Mounting agent env")
    }
}
