//! VM cloud properties and their application through `modifyvm`.

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::Vm;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedFolder {
    #[serde(default)]
    pub host_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmProps {
    #[serde(alias = "Memory")]
    pub memory: u32,
    #[serde(alias = "CPUs")]
    pub cpus: u32,
    /// Ephemeral disk size in megabytes.
    pub ephemeral_disk: u64,
    pub paravirtprovider: String,
    pub audio: String,
    #[serde(alias = "GUI")]
    pub gui: bool,
    pub shared_folders: Vec<SharedFolder>,
}

impl Default for VmProps {
    fn default() -> Self {
        Self {
            memory: 512,
            cpus: 1,
            ephemeral_disk: 5000,
            // Let VBoxManage pick the paravirtualization interface.
            paravirtprovider: "default".into(),
            audio: "none".into(),
            gui: false,
            shared_folders: Vec::new(),
        }
    }
}

impl VmProps {
    /// Parse the `cloud_properties` of a `create_vm` request.
    pub fn from_cloud_props(value: serde_json::Value) -> Result<Self> {
        let props: VmProps = if value.is_null() {
            VmProps::default()
        } else {
            serde_json::from_value(value).context("Unmarshaling VM cloud properties")?
        };
        if props.shared_folders.iter().any(|f| f.host_path.is_empty()) {
            bail!("Expected host paths not to be empty");
        }
        Ok(props)
    }
}

impl Vm {
    pub async fn set_props(&self, props: &VmProps) -> Result<()> {
        let id = self.id();
        info!(vm = %id, memory = props.memory, cpus = props.cpus, "Setting VM properties");

        let memory = props.memory.to_string();
        let cpus = props.cpus.to_string();
        self.driver
            .run(&[
                "modifyvm",
                id,
                "--name",
                id,
                "--memory",
                &memory,
                "--cpus",
                &cpus,
                "--paravirtprovider",
                &props.paravirtprovider,
                "--audio",
                &props.audio,
            ])
            .await?;

        for (index, folder) in props.shared_folders.iter().enumerate() {
            let name = format!("folder-{index}");
            // Must be set before the folder is added.
            let symlinks = format!("VBoxInternal2/SharedFoldersEnableSymlinksCreate/{name}");
            self.driver.run(&["setextradata", id, &symlinks, "1"]).await?;
            self.driver
                .run(&["sharedfolder", "add", id, "--name", &name, "--hostpath", &folder.host_path])
                .await
                .with_context(|| format!("Adding shared folder '{}'", folder.host_path))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults_fill_missing_properties() {
        let props = VmProps::from_cloud_props(json!({"memory": 1024})).unwrap();
        assert_eq!(props.memory, 1024);
        assert_eq!(props.cpus, 1);
        assert_eq!(props.ephemeral_disk, 5000);
        assert_eq!(props.paravirtprovider, "default");
        assert_eq!(props.audio, "none");
        assert!(!props.gui);

        assert_eq!(VmProps::from_cloud_props(serde_json::Value::Null).unwrap(), VmProps::default());
    }

    #[test]
    fn shared_folders_need_a_host_path() {
        let err = VmProps::from_cloud_props(json!({"shared_folders": [{"host_path": ""}]})).unwrap_err();
        assert_eq!(err.to_string(), "Expected host paths not to be empty");
    }
}
