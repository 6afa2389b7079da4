//! Per-VM key/value store on the execution target.
//!
//! Each VM owns a directory `<vms>/<vm-id>/` holding `env.json`, `env.iso`,
//! `metadata.json` and one attachment record per disk. Every access goes
//! through the [`Runner`] so the store lives next to VirtualBox, local or
//! remote.

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use tracing::debug;

use crate::driver::{Runner, args};

#[derive(Clone)]
pub struct Store {
    path: String,
    runner: Arc<dyn Runner>,
}

impl Store {
    pub fn new(path: impl Into<String>, runner: Arc<dyn Runner>) -> Self {
        Self {
            path: path.into(),
            runner,
        }
    }

    /// Location of `key` on the execution target.
    pub fn path(&self, key: &str) -> String {
        format!("{}/{}", self.path.trim_end_matches('/'), key)
    }

    pub fn root(&self) -> &str {
        &self.path
    }

    /// Keys in the store. A store that was never written, or was deleted,
    /// lists as empty and is not created.
    pub async fn list(&self) -> Result<Vec<String>> {
        if !self.exists().await? {
            return Ok(Vec::new());
        }
        let output = self.file_cmd("ls", &["-1", &self.path]).await?;
        Ok(output
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }

    pub async fn put(&self, key: &str, contents: &[u8]) -> Result<()> {
        self.mkdir().await?;
        let path = self.path(key);
        debug!(path = %path, bytes = contents.len(), "Writing store entry");
        self.runner
            .put(&path, contents)
            .await
            .with_context(|| format!("Writing '{path}'"))
    }

    pub async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.path(key);
        self.runner
            .get(&path)
            .await
            .with_context(|| format!("Reading '{path}'"))
    }

    pub async fn delete_one(&self, key: &str) -> Result<()> {
        let path = self.path(key);
        self.file_cmd("rm", &["-rf", &path]).await.map(drop)
    }

    /// Remove the whole store directory.
    pub async fn delete(&self) -> Result<()> {
        self.file_cmd("rm", &["-rf", &self.path]).await.map(drop)
    }

    async fn exists(&self) -> Result<bool> {
        let out = self
            .runner
            .execute("test", &args(["-d", self.path.as_str()]))
            .await
            .with_context(|| format!("Checking store '{}'", self.path))?;
        Ok(out.success())
    }

    async fn mkdir(&self) -> Result<()> {
        self.file_cmd("mkdir", &["-p", &self.path]).await.map(drop)
    }

    async fn file_cmd(&self, program: &str, argv: &[&str]) -> Result<String> {
        let out = self
            .runner
            .execute(program, &args(argv.iter().copied()))
            .await
            .with_context(|| format!("Running '{program}' on store '{}'", self.path))?;
        if !out.success() {
            bail!(
                "'{program} {}' exited with status {}: {}",
                argv.join(" "),
                out.status,
                out.output.trim()
            );
        }
        Ok(out.output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::fake::FakeRunner;

    #[tokio::test]
    async fn entries_round_trip_through_the_runner() {
        let runner = Arc::new(FakeRunner::new());
        let store = Store::new("/store/vms/vm-1", runner.clone());

        store.put("env.json", b"{}").await.unwrap();
        store.put("disk-1-disk-attachment.json", b"{}").await.unwrap();

        assert_eq!(
            store.list().await.unwrap(),
            vec!["disk-1-disk-attachment.json", "env.json"]
        );
        assert_eq!(store.get("env.json").await.unwrap(), b"{}");

        store.delete_one("env.json").await.unwrap();
        assert_eq!(store.list().await.unwrap(), vec!["disk-1-disk-attachment.json"]);

        store.delete().await.unwrap();
        assert!(runner.file_paths().is_empty());
        assert!(!runner.has_dir("/store/vms/vm-1"));
    }

    #[tokio::test]
    async fn listing_an_untouched_store_is_empty() {
        let runner = Arc::new(FakeRunner::new());
        let store = Store::new("/store/vms/vm-2/", runner.clone());
        assert!(store.list().await.unwrap().is_empty());
        assert!(!runner.has_dir("/store/vms/vm-2"));
        assert_eq!(store.path("env.iso"), "/store/vms/vm-2/env.iso");
    }

    #[tokio::test]
    async fn listing_a_deleted_store_does_not_recreate_it() {
        let runner = Arc::new(FakeRunner::new());
        let store = Store::new("/store/vms/vm-4", runner.clone());
        store.put("env.json", b"{}").await.unwrap();
        store.delete().await.unwrap();

        assert!(store.list().await.unwrap().is_empty());
        assert!(!runner.has_dir("/store/vms/vm-4"));
    }

    #[tokio::test]
    async fn missing_entry_is_an_error() {
        let store = Store::new("/store/vms/vm-3", Arc::new(FakeRunner::new()));
        let err = store.get("metadata.json").await.unwrap_err();
        assert!(format!("{err:#}").contains("/store/vms/vm-3/metadata.json"));
    }
}
