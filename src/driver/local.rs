//! Runner that executes on this machine.

use std::path::Path;

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use super::{ExecOutput, Runner, args};

/// Search path for every command. On a remote host it is appended to the
/// login shell's own `PATH`.
pub(crate) const EXTRA_PATH: &str = "/usr/local/bin:/usr/bin:/bin:/usr/sbin:/sbin";

/// Variables carried over from the CPI's own environment. Everything else is
/// dropped so VBoxManage sees the same environment however the CPI was
/// launched.
const INHERITED_ENV: &[&str] = &["USER", "LOGNAME", "HOME"];

#[derive(Debug, Clone, Default)]
pub struct LocalRunner;

impl LocalRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Runner for LocalRunner {
    async fn execute(&self, path: &str, args: &[String]) -> Result<ExecOutput> {
        debug!(cmd = %path, args = ?args, "Running local command");

        let mut cmd = Command::new(path);
        cmd.args(args).env_clear().env("PATH", EXTRA_PATH);
        for key in INHERITED_ENV {
            if let Some(value) = std::env::var_os(key) {
                cmd.env(key, value);
            }
        }

        let out = cmd
            .stdin(std::process::Stdio::null())
            .output()
            .await
            .with_context(|| format!("failed to spawn `{path}`"))?;

        // A signal-terminated child has no exit code.
        let status = out
            .status
            .code()
            .ok_or_else(|| anyhow!("`{path}` was terminated by a signal"))?;

        let output = format!(
            "{}\n{}",
            String::from_utf8_lossy(&out.stdout),
            String::from_utf8_lossy(&out.stderr)
        );

        debug!(cmd = %path, status, bytes = output.len(), "Local command finished");
        Ok(ExecOutput { output, status })
    }

    async fn put(&self, path: &str, contents: &[u8]) -> Result<()> {
        debug!(path, bytes = contents.len(), "Writing file");
        tokio::fs::write(path, contents)
            .await
            .with_context(|| format!("writing {path}"))
    }

    async fn get(&self, path: &str) -> Result<Vec<u8>> {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("reading {path}"))?;
        debug!(path, bytes = bytes.len(), "Read file");
        Ok(bytes)
    }

    async fn upload(&self, src: &Path, dst: &str) -> Result<()> {
        debug!(src = %src.display(), dst, "Moving file into place");
        tokio::fs::rename(src, dst)
            .await
            .with_context(|| format!("moving {} to {dst}", src.display()))
    }

    /// Home directory of the effective user, as `~user` resolves it.
    async fn home_dir(&self) -> Result<String> {
        let out = self
            .execute("sh", &args(["-c", "eval echo ~$(whoami)"]))
            .await
            .context("resolving home directory")?;
        let home = out.output.trim().to_string();
        if !out.success() || home.is_empty() || home.starts_with('~') {
            bail!("Failed to expand home directory, got '{home}'");
        }
        Ok(home)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn execute_combines_stdout_and_stderr() {
        let runner = LocalRunner::new();
        let out = runner
            .execute("sh", &args(["-c", "echo out; echo err >&2; exit 3"]))
            .await
            .unwrap();

        assert_eq!(out.status, 3);
        assert_eq!(out.output, "out\n\nerr\n");
        assert!(!out.success());
    }

    #[tokio::test]
    async fn execute_runs_with_a_fixed_path() {
        let runner = LocalRunner::new();
        let out = runner
            .execute("sh", &args(["-c", "echo \"$PATH\"; env"]))
            .await
            .unwrap();

        assert_eq!(out.output.lines().next(), Some(EXTRA_PATH));
        // `cargo test` exports CARGO_* to the test process; none may leak through.
        assert!(!out.output.lines().any(|l| l.starts_with("CARGO")), "{}", out.output);
    }

    #[tokio::test]
    async fn home_dir_resolves_the_current_user() {
        let home = LocalRunner::new().home_dir().await.unwrap();
        assert!(home.starts_with('/'), "{home}");
        assert!(!home.contains('~'));
    }

    #[tokio::test]
    async fn execute_missing_binary_is_an_error() {
        let runner = LocalRunner::new();
        let result = runner.execute("/nonexistent/VBoxManage", &[]).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn put_get_and_upload_use_the_local_filesystem() {
        let dir = tempfile::tempdir().unwrap();
        let runner = LocalRunner::new();

        let src = dir.path().join("src.txt");
        let src_str = src.to_str().unwrap();
        runner.put(src_str, b"hello").await.unwrap();
        assert_eq!(runner.get(src_str).await.unwrap(), b"hello");

        let dst = dir.path().join("dst.txt");
        runner.upload(&src, dst.to_str().unwrap()).await.unwrap();
        assert!(!src.exists());
        assert_eq!(std::fs::read(&dst).unwrap(), b"hello");
    }
}
