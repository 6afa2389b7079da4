//! Storage controller slots of a VM.
//!
//! VirtualBox reports slots in `showvminfo --machinereadable` output:
//!
//! ```text
//! storagecontrollername0="IDE Controller"
//! storagecontrollername1="SCSI"
//! "SCSI-0-0"="/store/stemcells/sc-1/image-disk1.vmdk"
//! "SCSI-1-0"="none"                        <- free slot (port 1, device 0)
//! "SCSI-ImageUUID-0-0"="b1ade788-61d2-..."
//! ```
//!
//! Controller names vary between VirtualBox versions and locales, so they
//! are found by a case-insensitive prefix on the configured controller kind.

use std::fmt;
use std::str::FromStr;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::driver::Driver;

/// Guest-side hint locating an attached disk. A bare string or a map,
/// depending on the controller.
pub type DiskHint = serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Controller {
    Ide,
    #[default]
    Scsi,
    Sata,
}

impl Controller {
    pub fn as_str(&self) -> &'static str {
        match self {
            Controller::Ide => "ide",
            Controller::Scsi => "scsi",
            Controller::Sata => "sata",
        }
    }

    fn name_prefix(&self) -> &'static str {
        match self {
            Controller::Ide => "IDE",
            Controller::Scsi => "SCSI",
            Controller::Sata => "SATA",
        }
    }
}

impl fmt::Display for Controller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Controller {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ide" => Ok(Controller::Ide),
            "scsi" | "" => Ok(Controller::Scsi),
            "sata" => Ok(Controller::Sata),
            other => bail!("Unexpected storage controller '{other}'"),
        }
    }
}

// ---------------------------------------------------------------------------
// Machine-readable output decoding
// ---------------------------------------------------------------------------

/// Name of the first controller of `kind` declared in `output`.
fn controller_name(output: &str, kind: Controller) -> Option<String> {
    output.lines().find_map(|line| {
        let rest = line.trim().strip_prefix("storagecontrollername")?;
        let (index, value) = rest.split_once('=')?;
        if !index.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
        let name = value.strip_prefix('"')?.strip_suffix('"')?;
        let prefix = kind.name_prefix();
        name.get(..prefix.len())
            .is_some_and(|head| head.eq_ignore_ascii_case(prefix))
            .then(|| name.to_string())
    })
}

/// Split a `"<name>-<port>-<device>"="<value>"` line for controller `name`.
fn slot_entry<'a>(line: &'a str, name: &str) -> Option<(&'a str, &'a str, &'a str)> {
    let rest = line.trim().strip_prefix('"')?.strip_prefix(name)?.strip_prefix('-')?;
    let (key, value) = rest.split_once("\"=\"")?;
    let value = value.strip_suffix('"')?;
    let (port, device) = key.split_once('-')?;
    let numeric = |s: &str| !s.is_empty() && s.chars().all(|c| c.is_ascii_digit());
    (numeric(port) && numeric(device)).then_some((port, device, value))
}

/// Free `(port, device)` slots of controller `name`, in listing order.
fn free_slots(output: &str, name: &str) -> Vec<(String, String)> {
    output
        .lines()
        .filter_map(|line| slot_entry(line, name))
        .filter(|(_, _, value)| *value == "none")
        .map(|(port, device, _)| (port.to_string(), device.to_string()))
        .collect()
}

fn image_uuid(output: &str, name: &str, port: &str, device: &str) -> Option<String> {
    let key = format!("\"{name}-ImageUUID-{port}-{device}\"=\"");
    output.lines().find_map(|line| {
        line.trim()
            .strip_prefix(&key)?
            .strip_suffix('"')
            .map(String::from)
    })
}

// ---------------------------------------------------------------------------
// Port devices
// ---------------------------------------------------------------------------

/// One `(controller, port, device)` slot of a VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortDevice {
    pub controller: Controller,
    /// VirtualBox's name for the controller, e.g. `SCSI Controller`.
    pub name: String,
    pub port: String,
    pub device: String,
}

#[derive(Clone)]
pub struct PortDevices {
    driver: Driver,
    vm_id: String,
    controller: Controller,
}

impl PortDevices {
    pub fn new(driver: Driver, vm_id: impl Into<String>, controller: Controller) -> Self {
        Self {
            driver,
            vm_id: vm_id.into(),
            controller,
        }
    }

    /// First unused slot on the configured controller.
    pub async fn find_available(&self) -> Result<PortDevice> {
        let (name, output) = self.determine_controller_name(self.controller).await?;
        let (port, device) = free_slots(&output, &name)
            .into_iter()
            .next()
            .with_context(|| format!("No available {name} port & device"))?;
        Ok(PortDevice {
            controller: self.controller,
            name,
            port,
            device,
        })
    }

    /// A previously allocated slot, as recorded in the attachment journal.
    pub async fn find(&self, controller: Controller, port: &str, device: &str) -> Result<PortDevice> {
        let (name, _) = self.determine_controller_name(controller).await?;
        Ok(PortDevice {
            controller,
            name,
            port: port.to_string(),
            device: device.to_string(),
        })
    }

    /// The DVD drive used for the agent config drive: secondary master on
    /// the IDE controller.
    pub async fn cdrom(&self) -> Result<PortDevice> {
        let (name, _) = self.determine_controller_name(Controller::Ide).await?;
        Ok(PortDevice {
            controller: Controller::Ide,
            name,
            port: "1".into(),
            device: "0".into(),
        })
    }

    pub async fn attach(&self, pd: &PortDevice, medium: &str) -> Result<()> {
        self.storage_attach(pd, "hdd", medium, true).await
    }

    pub async fn detach(&self, pd: &PortDevice) -> Result<()> {
        self.storage_attach(pd, "hdd", "none", false).await
    }

    pub async fn mount_iso(&self, pd: &PortDevice, iso_path: &str) -> Result<()> {
        self.storage_attach(pd, "dvddrive", iso_path, false).await
    }

    /// How the guest agent finds the disk in `pd`.
    pub async fn hint(&self, pd: &PortDevice) -> Result<DiskHint> {
        Ok(match pd.controller {
            // Port 0 holds the system disk; its devices map to plain indexes.
            Controller::Ide if pd.port == "0" => json!(pd.device),
            Controller::Ide => json!({"id": "1ATA"}),
            // The agent probes the root disk's SCSI host for this port.
            Controller::Scsi => json!(pd.port),
            // The guest lists SATA disks under /dev/disk/by-id as
            // ata-VBOX_HARDDISK_VB<first uuid segment>-...
            Controller::Sata => {
                let output = self.show_vm_info().await.context("Determining imageUUID")?;
                let uuid = image_uuid(&output, &pd.name, &pd.port, &pd.device).with_context(|| {
                    format!(
                        "Failed to determine imageUUID for {} {}-{}",
                        pd.name, pd.port, pd.device
                    )
                })?;
                let prefix = uuid.split('-').next().unwrap_or(&uuid);
                json!({"id": format!("{prefix}*")})
            }
        })
    }

    async fn storage_attach(&self, pd: &PortDevice, kind: &str, medium: &str, normal: bool) -> Result<()> {
        let mut argv = vec![
            "storageattach",
            self.vm_id.as_str(),
            "--storagectl",
            pd.name.as_str(),
            "--port",
            pd.port.as_str(),
            "--device",
            pd.device.as_str(),
            "--type",
            kind,
            "--medium",
            medium,
        ];
        if normal {
            argv.extend(["--mtype", "normal"]);
        }
        self.driver.run(&argv).await?;
        Ok(())
    }

    async fn show_vm_info(&self) -> Result<String> {
        self.driver
            .run(&["showvminfo", &self.vm_id, "--machinereadable"])
            .await
    }

    async fn determine_controller_name(&self, kind: Controller) -> Result<(String, String)> {
        let output = self
            .show_vm_info()
            .await
            .with_context(|| format!("Determining {} controller name", kind.name_prefix()))?;
        match controller_name(&output, kind) {
            Some(name) => {
                debug!(vm = %self.vm_id, controller = %name, "Determined controller name");
                Ok((name, output))
            }
            None => bail!("Unknown {} controller name", kind.name_prefix()),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
