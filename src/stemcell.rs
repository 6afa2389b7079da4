//! Stemcells: imported OVF appliances that VMs are linked-cloned from.
//!
//! ```text
//! image (tgz) ─► unpack to tempdir ─► [IDE: move root disk, fix image.mf]
//!     ─► upload to <store>/stemcells/sc-<uuid>/ ─► VBoxManage import
//!     ─► rename to sc-<uuid> ─► snapshot "prepared-clone"
//! ```

use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use flate2::bufread::GzDecoder;
use ring::digest;
use tar::Archive;
use tokio::task::spawn_blocking;
use tracing::{error, info};
use uuid::Uuid;

use crate::disk::run_file_cmd;
use crate::driver::exec::is_missing_vm_err;
use crate::driver::{Driver, Retrier, Retryable, Runner};
use crate::vm::Controller;

pub const SNAPSHOT_NAME: &str = "prepared-clone";

const STEMCELL_FILES: [&str; 3] = ["image-disk1.vmdk", "image.mf", "image.ovf"];
const SCSI_PARENT: &str = "<rasd:Parent>3</rasd:Parent>";
const IDE_PARENT: &str = "<rasd:Parent>4</rasd:Parent>";

#[derive(Clone)]
pub struct Stemcell {
    id: String,
    path: String,
    driver: Driver,
    runner: Arc<dyn Runner>,
}

impl std::fmt::Debug for Stemcell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stemcell")
            .field("id", &self.id)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl Stemcell {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn snapshot_name(&self) -> &str {
        SNAPSHOT_NAME
    }

    pub async fn exists(&self) -> Result<bool> {
        match self
            .driver
            .run(&["showvminfo", &self.id, "--machinereadable"])
            .await
        {
            Ok(_) => Ok(true),
            Err(err) if is_missing_vm_err(&err) => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn prepare(&self) -> Result<()> {
        self.driver
            .run(&["snapshot", &self.id, "take", SNAPSHOT_NAME])
            .await
            .context("Preparing for future cloning")?;
        Ok(())
    }

    pub async fn delete(&self) -> Result<()> {
        info!(stemcell = %self.id, "Deleting stemcell");
        if let Err(err) = self.driver.run(&["unregistervm", &self.id, "--delete"]).await {
            if !is_missing_vm_err(&err) {
                return Err(err.context("Unregistering stemcell VM"));
            }
        }
        run_file_cmd(&*self.runner, "rm", &["-rf", &self.path])
            .await
            .with_context(|| format!("Deleting stemcell '{}'", self.path))
    }
}

#[derive(Clone)]
pub struct Importer {
    dir_path: String,
    controller: Controller,
    driver: Driver,
    runner: Arc<dyn Runner>,
    import_retrier: Retrier,
}

impl Importer {
    pub fn new(
        dir_path: impl Into<String>,
        controller: Controller,
        driver: Driver,
        runner: Arc<dyn Runner>,
        import_retrier: Retrier,
    ) -> Self {
        Self {
            dir_path: dir_path.into(),
            controller,
            driver,
            runner,
            import_retrier,
        }
    }

    pub fn find(&self, id: &str) -> Stemcell {
        Stemcell {
            id: id.to_string(),
            path: format!("{}/{}", self.dir_path.trim_end_matches('/'), id),
            driver: self.driver.clone(),
            runner: self.runner.clone(),
        }
    }

    /// Import the gzipped tarball at `image_path`.
    pub async fn import(&self, image_path: &Path) -> Result<Stemcell> {
        let stemcell = self.find(&format!("sc-{}", Uuid::new_v4()));
        info!(stemcell = %stemcell.id, image = %image_path.display(), "Importing stemcell");

        self.upload(image_path, &stemcell.path).await?;

        let ovf = format!("{}/image.ovf", stemcell.path);
        let internal_id = self.import_ovf(&ovf).await?;

        let renamed = self
            .driver
            .run(&["modifyvm", &internal_id, "--name", &stemcell.id])
            .await
            .context("Setting stemcell name");
        if let Err(err) = renamed {
            self.clean_up_partial_import(&internal_id).await;
            return Err(err);
        }

        if let Err(err) = stemcell.prepare().await {
            self.clean_up_partial_import(&internal_id).await;
            return Err(err.context("Preparing stemcell"));
        }
        Ok(stemcell)
    }

    async fn upload(&self, image_path: &Path, dst: &str) -> Result<()> {
        let tmp = tempfile::Builder::new()
            .prefix("virtualbox-cpi-stemcell-upload")
            .tempdir()
            .context("Creating tmp stemcell directory")?;

        let src = image_path.to_path_buf();
        let dir = tmp.path().to_path_buf();
        let controller = self.controller;
        spawn_blocking(move || -> Result<()> {
            unpack(&src, &dir)
                .with_context(|| format!("Unpacking stemcell '{}' to '{}'", src.display(), dir.display()))?;
            if controller == Controller::Ide {
                switch_root_disk_to_ide(&dir).context("Switching root disk to IDE Controller")?;
            }
            Ok(())
        })
        .await??;

        run_file_cmd(&*self.runner, "mkdir", &["-p", dst])
            .await
            .context("Creating stemcell parent")?;

        for name in STEMCELL_FILES {
            let from: PathBuf = tmp.path().join(name);
            self.runner
                .upload(&from, &format!("{dst}/{name}"))
                .await
                .with_context(|| format!("Uploading stemcell file '{name}'"))?;
        }
        Ok(())
    }

    /// Import the OVF and return the id VirtualBox registered it under.
    async fn import_ovf(&self, ovf: &str) -> Result<String> {
        self.import_retrier
            .retry(|| async {
                let output = self
                    .driver
                    .run(&["import", ovf])
                    .await
                    .map_err(Retryable::wrap)?;
                let suggested = suggested_vm_name(&output).ok_or_else(|| {
                    Retryable::wrap(anyhow!("Couldn't find VM name in the output:\nOutput: '{output}'"))
                })?;

                let listed = match self.driver.run(&["list", "vms"]).await {
                    Ok(listed) => listed,
                    Err(err) => {
                        self.clean_up_partial_import(&suggested).await;
                        return Err(Retryable::wrap(err.context("Listing VMs after an import")));
                    }
                };
                match vm_uuid(&listed, &suggested) {
                    Some(id) => Ok(id),
                    None => {
                        self.clean_up_partial_import(&suggested).await;
                        Err(Retryable::wrap(anyhow!("Failed to import '{ovf}'")))
                    }
                }
            })
            .await
    }

    async fn clean_up_partial_import(&self, name_or_id: &str) {
        if let Err(err) = self.driver.run(&["unregistervm", name_or_id, "--delete"]).await {
            error!(stemcell = %name_or_id, error = ?err, "Failed to clean up partially imported stemcell");
        }
    }
}

fn suggested_vm_name(output: &str) -> Option<String> {
    let rest = output.split("Suggested VM name \"").nth(1)?;
    let (name, _) = rest.split_once('"')?;
    (!name.is_empty()).then(|| name.to_string())
}

/// `"<name>" {<uuid>}` line of `list vms` for `name`.
fn vm_uuid(listing: &str, name: &str) -> Option<String> {
    let prefix = format!("\"{name}\" {{");
    listing.lines().find_map(|line| {
        line.trim()
            .strip_prefix(&prefix)?
            .strip_suffix('}')
            .map(String::from)
    })
}

fn unpack(tarball: &Path, dest: &Path) -> Result<()> {
    let file = File::open(tarball)?;
    let mut archive = Archive::new(GzDecoder::new(BufReader::new(file)));
    archive.set_overwrite(true);
    archive.unpack(dest)?;
    Ok(())
}

fn sha1_hex(contents: &[u8]) -> String {
    hex::encode(digest::digest(&digest::SHA1_FOR_LEGACY_USE_ONLY, contents))
}

/// Re-parent the root disk from the SCSI controller (item 3) to the IDE
/// controller (item 4) and keep `image.mf` consistent with the new OVF.
fn switch_root_disk_to_ide(dir: &Path) -> Result<()> {
    let ovf_path = dir.join("image.ovf");
    let ovf = fs::read_to_string(&ovf_path).context("Reading image.ovf")?;
    let before = sha1_hex(ovf.as_bytes());
    let ovf = ovf.replacen(SCSI_PARENT, IDE_PARENT, 1);
    let after = sha1_hex(ovf.as_bytes());
    fs::write(&ovf_path, &ovf).context("Writing image.ovf")?;

    let mf_path = dir.join("image.mf");
    let mf = fs::read_to_string(&mf_path).context("Reading image.mf")?;
    fs::write(&mf_path, mf.replacen(&before, &after, 1)).context("Writing image.mf")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::fake::FakeRunner;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::time::Duration;

    const OVF: &str = "<Item><rasd:InstanceID>5</rasd:InstanceID><rasd:Parent>3</rasd:Parent></Item>";

    fn write_image(dir: &Path) -> PathBuf {
        let path = dir.join("image");
        let gz = GzEncoder::new(File::create(&path).unwrap(), Compression::default());
        let mut builder = tar::Builder::new(gz);
        let mf = format!(
            "SHA1(image.ovf)= {}\nSHA1(image-disk1.vmdk)= 00\n",
            sha1_hex(OVF.as_bytes())
        );
        for (name, contents) in [
            ("image.ovf", OVF.as_bytes()),
            ("image.mf", mf.as_bytes()),
            ("image-disk1.vmdk", b"vmdk".as_slice()),
        ] {
            let mut header = tar::Header::new_gnu();
            header.set_size(contents.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, contents).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();
        path
    }

    fn importer(runner: Arc<FakeRunner>, controller: Controller) -> Importer {
        let driver = Driver::new(runner.clone(), Retrier::new(1, Duration::ZERO), "VBoxManage");
        Importer::new(
            "/store/stemcells",
            controller,
            driver,
            runner,
            Retrier::new(2, Duration::ZERO),
        )
    }

    #[test]
    fn import_output_parsing() {
        let out = "0%...100%\nVirtual system 0:\n 0: Suggested OS type: \"Ubuntu_64\"\n 1: Suggested VM name \"vm\"\n";
        assert_eq!(suggested_vm_name(out).as_deref(), Some("vm"));
        assert_eq!(suggested_vm_name("nothing here"), None);

        let listing = "\"vm-1\" {11111111-0000-0000-0000-000000000000}\n\"vm\" {22222222-0000-0000-0000-000000000000}\n";
        assert_eq!(vm_uuid(listing, "vm").as_deref(), Some("22222222-0000-0000-0000-000000000000"));
        assert_eq!(vm_uuid(listing, "v"), None);
    }

    #[tokio::test]
    async fn import_uploads_renames_and_snapshots() {
        let tmp = tempfile::tempdir().unwrap();
        let image = write_image(tmp.path());
        let runner = Arc::new(FakeRunner::new());
        runner.on("import", " 1: Suggested VM name \"vm\"\n", 0);
        runner.on("list vms", "\"vm\" {abcd-1234}\n", 0);

        let stemcell = importer(runner.clone(), Controller::Scsi)
            .import(&image)
            .await
            .unwrap();
        let id = stemcell.id().to_string();
        assert!(id.starts_with("sc-"));

        assert_eq!(
            runner.commands(),
            vec![
                format!("import /store/stemcells/{id}/image.ovf"),
                "list vms".to_string(),
                format!("modifyvm abcd-1234 --name {id}"),
                format!("snapshot {id} take prepared-clone"),
            ]
        );
        let ovf = runner.file(&format!("/store/stemcells/{id}/image.ovf")).unwrap();
        assert_eq!(ovf, OVF.as_bytes());
        assert!(runner.file(&format!("/store/stemcells/{id}/image-disk1.vmdk")).is_some());
    }

    #[tokio::test]
    async fn ide_controller_rewrites_ovf_and_manifest() {
        let tmp = tempfile::tempdir().unwrap();
        let image = write_image(tmp.path());
        let runner = Arc::new(FakeRunner::new());
        runner.on("import", " 1: Suggested VM name \"vm\"\n", 0);
        runner.on("list vms", "\"vm\" {abcd-1234}\n", 0);

        let stemcell = importer(runner.clone(), Controller::Ide)
            .import(&image)
            .await
            .unwrap();
        let dir = format!("/store/stemcells/{}", stemcell.id());

        let ovf = String::from_utf8(runner.file(&format!("{dir}/image.ovf")).unwrap()).unwrap();
        assert!(ovf.contains(IDE_PARENT));
        let mf = String::from_utf8(runner.file(&format!("{dir}/image.mf")).unwrap()).unwrap();
        assert!(mf.contains(&sha1_hex(ovf.as_bytes())));
        assert!(!mf.contains(&sha1_hex(OVF.as_bytes())));
    }

    #[tokio::test]
    async fn failed_snapshot_unregisters_the_imported_vm() {
        let tmp = tempfile::tempdir().unwrap();
        let image = write_image(tmp.path());
        let runner = Arc::new(FakeRunner::new());
        runner.on("import", " 1: Suggested VM name \"vm\"\n", 0);
        runner.on("list vms", "\"vm\" {abcd-1234}\n", 0);
        runner.on("snapshot", "VBoxManage: error: no space", 1);

        let err = importer(runner.clone(), Controller::Scsi)
            .import(&image)
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("Preparing stemcell"));
        assert_eq!(
            runner.commands_matching("unregistervm"),
            vec!["unregistervm abcd-1234 --delete"]
        );
    }

    #[tokio::test]
    async fn import_without_listed_vm_is_retried_then_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let image = write_image(tmp.path());
        let runner = Arc::new(FakeRunner::new());
        runner.on("import", " 1: Suggested VM name \"vm\"\n", 0);
        runner.on("list vms", "", 0);

        let err = importer(runner.clone(), Controller::Scsi)
            .import(&image)
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("Failed to import"));
        assert_eq!(runner.commands_matching("import").len(), 2);
        assert_eq!(runner.commands_matching("unregistervm vm --delete").len(), 2);
    }

    #[tokio::test]
    async fn delete_tolerates_a_missing_vm() {
        let runner = Arc::new(FakeRunner::new());
        runner.on(
            "unregistervm",
            "VBoxManage: error: Could not find a registered machine with UUID {sc-1}",
            1,
        );
        runner.insert_file("/store/stemcells/sc-1/image.ovf", b"x");
        let stemcell = importer(runner.clone(), Controller::Scsi).find("sc-1");

        stemcell.delete().await.unwrap();
        assert!(runner.file_paths().is_empty());
    }
}
