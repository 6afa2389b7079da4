//! Disks stored as VMDK files under `<store>/disks/<disk-id>/disk.vmdk`.

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use tracing::{info, warn};
use uuid::Uuid;

use crate::driver::{Driver, Runner, args};

#[derive(Clone)]
pub struct Factory {
    dir_path: String,
    driver: Driver,
    runner: Arc<dyn Runner>,
}

impl Factory {
    pub fn new(dir_path: impl Into<String>, driver: Driver, runner: Arc<dyn Runner>) -> Self {
        Self {
            dir_path: dir_path.into(),
            driver,
            runner,
        }
    }

    /// Create an empty disk of `size_mb` megabytes.
    pub async fn create(&self, size_mb: u64) -> Result<Disk> {
        let disk = self.find(&format!("disk-{}", Uuid::new_v4()));
        info!(disk = %disk.id, size_mb, "Creating disk");

        run_file_cmd(&*self.runner, "mkdir", &["-p", &disk.path])
            .await
            .context("Creating disk parent")?;

        let size = size_mb.to_string();
        let vmdk = disk.vmdk_path();
        let created = self
            .driver
            .run(&[
                "createhd",
                "--filename",
                &vmdk,
                "--size",
                &size,
                "--format",
                "VMDK",
                "--variant",
                "Standard",
            ])
            .await;

        if let Err(err) = created {
            if let Err(cleanup) = disk.remove_files().await {
                warn!(disk = %disk.id, error = ?cleanup, "Failed to clean up disk directory");
            }
            return Err(err.context("Creating disk"));
        }
        Ok(disk)
    }

    pub fn find(&self, id: &str) -> Disk {
        Disk {
            id: id.to_string(),
            path: format!("{}/{}", self.dir_path.trim_end_matches('/'), id),
            driver: self.driver.clone(),
            runner: self.runner.clone(),
        }
    }
}

#[derive(Clone)]
pub struct Disk {
    id: String,
    path: String,
    driver: Driver,
    runner: Arc<dyn Runner>,
}

impl std::fmt::Debug for Disk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Disk")
            .field("id", &self.id)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl Disk {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn vmdk_path(&self) -> String {
        format!("{}/disk.vmdk", self.path)
    }

    pub async fn exists(&self) -> Result<bool> {
        let out = self
            .runner
            .execute("test", &args(["-d", self.path.as_str()]))
            .await
            .with_context(|| format!("Checking disk '{}'", self.path))?;
        Ok(out.success())
    }

    /// Forget the medium in VirtualBox's registry and remove its files.
    pub async fn delete(&self) -> Result<()> {
        let vmdk = self.vmdk_path();
        // A disk that was never registered, or already went with its VM.
        if let Err(err) = self.driver.run(&["closemedium", "disk", &vmdk]).await {
            warn!(disk = %self.id, error = ?err, "Failed to close disk medium");
        }
        self.remove_files().await
    }

    pub async fn remove_files(&self) -> Result<()> {
        run_file_cmd(&*self.runner, "rm", &["-rf", &self.path])
            .await
            .with_context(|| format!("Deleting disk '{}'", self.path))
    }
}

pub(crate) async fn run_file_cmd(runner: &dyn Runner, program: &str, argv: &[&str]) -> Result<()> {
    let out = runner.execute(program, &args(argv.iter().copied())).await?;
    if !out.success() {
        bail!(
            "'{program} {}' exited with status {}: {}",
            argv.join(" "),
            out.status,
            out.output.trim()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::Retrier;
    use crate::driver::fake::FakeRunner;
    use std::time::Duration;

    fn factory(runner: Arc<FakeRunner>) -> Factory {
        let driver = Driver::new(runner.clone(), Retrier::new(1, Duration::ZERO), "VBoxManage");
        Factory::new("/store/disks", driver, runner)
    }

    #[tokio::test]
    async fn create_runs_createhd_in_a_fresh_directory() {
        let runner = Arc::new(FakeRunner::new());
        let disk = factory(runner.clone()).create(5000).await.unwrap();

        assert!(disk.id().starts_with("disk-"));
        assert_eq!(disk.path(), format!("/store/disks/{}", disk.id()));
        assert_eq!(
            runner.commands(),
            vec![format!(
                "createhd --filename /store/disks/{}/disk.vmdk --size 5000 --format VMDK --variant Standard",
                disk.id()
            )]
        );
        assert!(disk.exists().await.unwrap());
    }

    #[test]
    fn debug_shows_identity_only() {
        let disk = factory(Arc::new(FakeRunner::new())).find("disk-1");
        assert_eq!(
            format!("{disk:?}"),
            "Disk { id: \"disk-1\", path: \"/store/disks/disk-1\", .. }"
        );
    }

    #[tokio::test]
    async fn failed_createhd_removes_the_directory() {
        let runner = Arc::new(FakeRunner::new());
        runner.on("createhd", "VBoxManage: error: disk full", 1);

        let err = factory(runner.clone()).create(10).await.unwrap_err();
        assert!(format!("{err:#}").contains("Creating disk"));
        let id = runner.commands()[0]
            .split('/')
            .nth(3)
            .unwrap()
            .to_string();
        assert!(!factory(runner).find(&id).exists().await.unwrap());
    }

    #[tokio::test]
    async fn delete_tolerates_an_unregistered_medium() {
        let runner = Arc::new(FakeRunner::new());
        runner.on("closemedium", "VBoxManage: error: Could not find file", 1);
        let disks = factory(runner.clone());
        let disk = disks.create(10).await.unwrap();

        disk.delete().await.unwrap();
        assert!(!disk.exists().await.unwrap());
        assert_eq!(runner.commands_matching("closemedium").len(), 1);
    }
}
