//! Disk attachment and the per-VM attachment journal.
//!
//! Every attached disk has exactly one `<disk-id>-disk-attachment.json`
//! record in the VM store; the set of records is the journal. Attach
//! writes the record after VirtualBox has accepted the disk, detach removes
//! it after VirtualBox has let go.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::Vm;
use super::port_devices::{Controller, DiskHint};
use super::store::Store;
use crate::disk::Disk;

const RECORD_SUFFIX: &str = "-disk-attachment.json";

/// Stemcells from this API version on find persistent disks without an
/// agent env rewrite.
const MOUNT_DISK_V2_API_VERSION: u32 = 2;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentRecord {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Ephemeral")]
    pub ephemeral: bool,
    #[serde(rename = "Controller")]
    pub controller: Controller,
    #[serde(rename = "Port")]
    pub port: String,
    #[serde(rename = "Device")]
    pub device: String,
}

/// Journal view over a VM store.
pub struct AttachmentRecords<'a> {
    store: &'a Store,
}

impl<'a> AttachmentRecords<'a> {
    pub fn new(store: &'a Store) -> Self {
        Self { store }
    }

    /// Ids of all journaled disks.
    pub async fn list(&self) -> Result<Vec<String>> {
        let keys = self.store.list().await.context("Listing disk attachments")?;
        Ok(keys
            .iter()
            .filter_map(|k| k.strip_suffix(RECORD_SUFFIX))
            .map(String::from)
            .collect())
    }

    pub async fn get(&self, disk_id: &str) -> Result<AttachmentRecord> {
        let bytes = self
            .store
            .get(&record_key(disk_id))
            .await
            .with_context(|| format!("Getting disk attachment for '{disk_id}'"))?;
        serde_json::from_slice(&bytes).context("Deserializing disk attachment")
    }

    pub async fn save(&self, rec: &AttachmentRecord) -> Result<()> {
        let bytes = serde_json::to_vec(rec).context("Serializing disk attachment")?;
        self.store
            .put(&record_key(&rec.id), &bytes)
            .await
            .context("Saving disk attachment")
    }

    pub async fn delete(&self, disk_id: &str) -> Result<()> {
        self.store.delete_one(&record_key(disk_id)).await
    }
}

fn record_key(disk_id: &str) -> String {
    format!("{disk_id}{RECORD_SUFFIX}")
}

impl Vm {
    fn records(&self) -> AttachmentRecords<'_> {
        AttachmentRecords::new(&self.store)
    }

    /// Persistent disks currently attached, per the journal.
    pub async fn disk_ids(&self) -> Result<Vec<String>> {
        let records = self.records();
        let mut ids = Vec::new();
        for id in records.list().await? {
            if !records.get(&id).await?.ephemeral {
                ids.push(id);
            }
        }
        Ok(ids)
    }

    pub(crate) async fn ephemeral_disk_ids(&self) -> Result<Vec<String>> {
        let records = self.records();
        let mut ids = Vec::new();
        for id in records.list().await? {
            if records.get(&id).await?.ephemeral {
                ids.push(id);
            }
        }
        Ok(ids)
    }

    pub async fn attach_disk(&self, disk: &Disk) -> Result<DiskHint> {
        self.attach(disk, false).await
    }

    /// Ephemeral disks are attached before first boot only, so no pause is
    /// needed.
    pub async fn attach_ephemeral_disk(&self, disk: &Disk) -> Result<()> {
        self.attach(disk, true).await.map(drop)
    }

    async fn attach(&self, disk: &Disk, ephemeral: bool) -> Result<DiskHint> {
        let pd = self.port_devices.find_available().await?;
        info!(
            vm = %self.id(),
            disk = %disk.id(),
            ephemeral,
            port = %pd.port,
            device = %pd.device,
            "Attaching disk"
        );

        let vmdk = disk.vmdk_path();
        self.hot_plug_if(!ephemeral, || self.port_devices.attach(&pd, &vmdk))
            .await?;

        let rec = AttachmentRecord {
            id: disk.id().to_string(),
            ephemeral,
            controller: pd.controller,
            port: pd.port.clone(),
            device: pd.device.clone(),
        };
        if let Err(err) = self.records().save(&rec).await {
            // Without a record nothing would ever detach the disk again.
            let undo = self
                .hot_plug_if(!ephemeral, || self.port_devices.detach(&pd))
                .await;
            if let Err(undo_err) = undo {
                warn!(vm = %self.id(), disk = %disk.id(), error = ?undo_err, "Failed to detach unrecorded disk");
            }
            return Err(err);
        }

        let hint = self.port_devices.hint(&pd).await?;

        if ephemeral || self.stemcell_api_version < MOUNT_DISK_V2_API_VERSION {
            debug!(vm = %self.id(), "Reconfiguring agent");
            let agent_hint = hint.clone();
            self.reconfigure_agent(!ephemeral, |env| {
                if ephemeral {
                    env.attach_ephemeral_disk(agent_hint);
                } else {
                    env.attach_persistent_disk(disk.id(), agent_hint);
                }
            })
            .await
            .context("Reconfiguring agent after attaching disk")?;
        } else {
            debug!(vm = %self.id(), "Skipping agent reconfiguration");
        }

        Ok(hint)
    }

    /// Detach a journaled persistent disk. An unknown disk is an error and
    /// leaves the VM untouched.
    pub async fn detach_disk(&self, disk: &Disk) -> Result<()> {
        let rec = self.records().get(disk.id()).await?;
        let pd = self
            .port_devices
            .find(rec.controller, &rec.port, &rec.device)
            .await?;
        info!(vm = %self.id(), disk = %disk.id(), port = %pd.port, device = %pd.device, "Detaching disk");

        self.hot_plug(|| self.port_devices.detach(&pd)).await?;
        self.records().delete(disk.id()).await?;

        self.reconfigure_agent(false, |env| env.detach_persistent_disk(disk.id()))
            .await
            .context("Reconfiguring agent after detaching disk")
    }

    /// Detach every persistent disk of a halted VM, keeping the agent env
    /// as it is.
    pub(crate) async fn detach_persistent_disks(&self) -> Result<()> {
        let records = self.records();
        for id in records.list().await? {
            let rec = records.get(&id).await?;
            if rec.ephemeral {
                continue;
            }
            let pd = self
                .port_devices
                .find(rec.controller, &rec.port, &rec.device)
                .await?;
            self.port_devices
                .detach(&pd)
                .await
                .with_context(|| format!("Detaching disk '{id}'"))?;
            records.delete(&id).await?;
        }
        Ok(())
    }
}
