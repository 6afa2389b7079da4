//! Runner that executes on a remote hypervisor host over SSH.
//!
//! Uses the system `ssh` binary. The private key from the configuration is
//! written to a private scratch directory, which also holds the
//! `ControlMaster` socket so consecutive commands reuse one authenticated
//! connection for the lifetime of the runner.
//!
//! Commands are wrapped as `sh -c '<quoted argv> [> file]'`: every argument
//! is single-quoted for the inner `sh`, and the whole script is single-quoted
//! again for the remote login shell, so neither shell expands anything.

use std::path::Path;
use std::process::Stdio;

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::process::Command;
use tracing::debug;

use super::local::EXTRA_PATH;
use super::{ExecOutput, Runner};

/// SSH options shared by every invocation.
///
/// * `StrictHostKeyChecking=no` / `UserKnownHostsFile=/dev/null`: the
///   hypervisor host is operator-owned and its key is not pinned.
/// * `BatchMode=yes`: fail instead of prompting for a password.
const SSH_OPTS: &[&str] = &[
    "-o", "StrictHostKeyChecking=no",
    "-o", "UserKnownHostsFile=/dev/null",
    "-o", "LogLevel=ERROR",
    "-o", "BatchMode=yes",
    "-o", "ConnectTimeout=10",
    "-o", "ControlMaster=auto",
    "-o", "ControlPersist=60",
];

/// `ssh` exits with 255 when the connection itself failed.
const SSH_TRANSPORT_FAILURE: i32 = 255;

#[derive(Debug, Clone)]
pub struct SshOpts {
    pub host: String,
    pub username: String,
    pub private_key: String,
    pub port: u16,
}

pub struct SshRunner {
    opts: SshOpts,
    scratch: TempDir,
    program: String,
}

impl SshRunner {
    pub fn new(opts: SshOpts) -> Result<Self> {
        let scratch = tempfile::Builder::new()
            .prefix("vbox-cpi-ssh")
            .tempdir()
            .context("creating ssh scratch directory")?;

        let key_path = scratch.path().join("id");
        let mut key = opts.private_key.clone();
        if !key.ends_with('\n') {
            key.push('\n');
        }
        std::fs::write(&key_path, key).context("writing ssh private key")?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&key_path, std::fs::Permissions::from_mode(0o600))
                .context("restricting ssh private key permissions")?;
        }

        Ok(Self {
            opts,
            scratch,
            program: "ssh".to_string(),
        })
    }

    fn ssh_command(&self, remote_cmd: &str) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(SSH_OPTS)
            .arg("-o")
            .arg(format!("ControlPath={}", self.scratch.path().join("cm").display()))
            .arg("-i")
            .arg(self.scratch.path().join("id"))
            .arg("-p")
            .arg(self.opts.port.to_string())
            .arg(format!("{}@{}", self.opts.username, self.opts.host))
            .arg(remote_cmd);
        cmd
    }

    async fn run_raw(&self, remote_cmd: &str) -> Result<(Vec<u8>, Vec<u8>, i32)> {
        debug!(host = %self.opts.host, cmd = %remote_cmd, "Running remote command");

        let out = self
            .ssh_command(remote_cmd)
            .stdin(Stdio::null())
            .output()
            .await
            .context("failed to spawn `ssh`")?;

        let status = out
            .status
            .code()
            .ok_or_else(|| anyhow!("`ssh` was terminated by a signal"))?;

        if status == SSH_TRANSPORT_FAILURE {
            bail!(
                "SSH connection to {}@{} failed: {}",
                self.opts.username,
                self.opts.host,
                String::from_utf8_lossy(&out.stderr).trim()
            );
        }

        Ok((out.stdout, out.stderr, status))
    }

    /// Pipe `source` into `cat > path` on the remote host without buffering
    /// it in memory.
    async fn stream_to<R>(&self, path: &str, source: &mut R) -> Result<()>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut child = self
            .ssh_command(&sh_cmd("cat", &[], Some(path)))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .context("failed to spawn `ssh`")?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("ssh stdin was not captured"))?;
        let copied = tokio::io::copy(source, &mut stdin).await;
        let flushed = stdin.shutdown().await;
        drop(stdin);

        let out = child.wait_with_output().await.context("waiting for `ssh`")?;
        if !out.status.success() {
            bail!(
                "Putting file {path} failed (exit {}): {}",
                out.status.code().unwrap_or(-1),
                String::from_utf8_lossy(&out.stderr).trim()
            );
        }
        let bytes = copied.with_context(|| format!("streaming {path} to remote host"))?;
        flushed.with_context(|| format!("streaming {path} to remote host"))?;
        debug!(host = %self.opts.host, path, bytes, "Put remote file");
        Ok(())
    }
}

#[async_trait]
impl Runner for SshRunner {
    async fn execute(&self, path: &str, args: &[String]) -> Result<ExecOutput> {
        let (stdout, stderr, status) = self.run_raw(&sh_cmd(path, args, None)).await?;
        let output = format!(
            "{}\n{}",
            String::from_utf8_lossy(&stdout),
            String::from_utf8_lossy(&stderr)
        );
        Ok(ExecOutput { output, status })
    }

    async fn put(&self, path: &str, contents: &[u8]) -> Result<()> {
        debug!(host = %self.opts.host, path, bytes = contents.len(), "Putting remote file");
        let mut contents = contents;
        self.stream_to(path, &mut contents).await
    }

    async fn get(&self, path: &str) -> Result<Vec<u8>> {
        let (stdout, stderr, status) = self
            .run_raw(&sh_cmd("cat", &[path.to_string()], None))
            .await?;
        if status != 0 {
            bail!(
                "Getting file {path} failed (exit {status}): {}",
                String::from_utf8_lossy(&stderr).trim()
            );
        }
        debug!(host = %self.opts.host, path, bytes = stdout.len(), "Got remote file");
        Ok(stdout)
    }

    async fn upload(&self, src: &Path, dst: &str) -> Result<()> {
        debug!(src = %src.display(), dst, "Uploading file");
        let mut file = tokio::fs::File::open(src)
            .await
            .with_context(|| format!("opening {} for upload", src.display()))?;
        self.stream_to(dst, &mut file).await
    }

    async fn home_dir(&self) -> Result<String> {
        let (stdout, _, _) = self
            .run_raw("sh -c 'USER= HOME= eval echo ~`whoami`'")
            .await?;
        let home = String::from_utf8_lossy(&stdout).trim().to_string();
        if home.is_empty() || home.starts_with('~') {
            bail!("Failed to expand home directory, got '{home}'");
        }
        Ok(home)
    }
}

// ---------------------------------------------------------------------------
// Shell quoting
// ---------------------------------------------------------------------------

fn sh_cmd(path: &str, args: &[String], stdout_path: Option<&str>) -> String {
    let mut argv = Vec::with_capacity(args.len() + 1);
    argv.push(shell_quote(path));
    argv.extend(args.iter().map(|a| shell_quote(a)));

    let mut inner = format!("PATH=\"$PATH:{EXTRA_PATH}\" {}", argv.join(" "));
    if let Some(stdout_path) = stdout_path {
        inner.push_str(" > ");
        inner.push_str(&shell_quote(stdout_path));
    }
    format!("sh -c {}", shell_quote(&inner))
}

/// Single-quote `arg` for a POSIX shell. Embedded quotes become `'\''`.
fn shell_quote(arg: &str) -> String {
    if !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-.,:/@=%+".contains(c))
    {
        return arg.to_string();
    }
    format!("'{}'", arg.replace('\'', "'\\''"))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    /// Run `sh_cmd` output the way sshd does: through a login shell's `-c`.
    fn through_login_shell(remote_cmd: &str) -> String {
        let out = std::process::Command::new("sh")
            .arg("-c")
            .arg(remote_cmd)
            .env("HOME", "/home/u")
            .output()
            .unwrap();
        assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
        String::from_utf8(out.stdout).unwrap()
    }

    #[test]
    fn shell_quote_leaves_safe_text_alone() {
        assert_eq!(shell_quote("vm-1234,abc:/tmp/x@y_z.vmdk"), "vm-1234,abc:/tmp/x@y_z.vmdk");
        assert_eq!(shell_quote("--nic1=hostonly"), "--nic1=hostonly");
    }

    #[test]
    fn shell_quote_wraps_specials_and_splits_quotes() {
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("$HOME"), "'$HOME'");
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
    }

    #[test]
    fn arguments_survive_both_shells_verbatim() {
        let tricky = [
            "/srv/a$HOME-b",
            "`id`",
            "say \"hi\"",
            "it's",
            "back\\slash",
            "a b\tc",
            "line\nbreak",
            "{\"id\":1}",
            "",
            "*",
        ];
        let argv: Vec<String> = std::iter::once("%s|".to_string())
            .chain(tricky.iter().map(|a| a.to_string()))
            .collect();

        let printed = through_login_shell(&sh_cmd("printf", &argv, None));
        let expected: String = tricky.iter().map(|a| format!("{a}|")).collect();
        assert_eq!(printed, expected);
    }

    #[test]
    fn path_is_extended_on_the_remote_side() {
        let printed = through_login_shell(&sh_cmd("sh", &["-c".into(), "echo \"$PATH\"".into()], None));
        assert!(printed.trim_end().ends_with(EXTRA_PATH), "{printed}");
    }

    #[test]
    fn redirect_target_is_quoted() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("env $HOME.json");
        let target = target.to_str().unwrap();

        through_login_shell(&sh_cmd("echo", &["ok".into()], Some(target)));
        assert_eq!(std::fs::read_to_string(target).unwrap(), "ok\n");
    }

    /// Runner whose `ssh` runs the remote command through a local login shell.
    fn loopback_runner(dir: &Path) -> SshRunner {
        let program = dir.join("ssh");
        std::fs::write(&program, "#!/bin/sh\nfor last; do :; done\nexec sh -c \"$last\"\n").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&program, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let mut runner = SshRunner::new(SshOpts {
            host: "hv".into(),
            username: "u".into(),
            private_key: "key".into(),
            port: 22,
        })
        .unwrap();
        runner.program = program.to_string_lossy().into_owned();
        runner
    }

    #[tokio::test]
    async fn upload_streams_the_file_to_the_remote_path() {
        let dir = tempfile::tempdir().unwrap();
        let runner = loopback_runner(dir.path());

        let src = dir.path().join("image-disk1.vmdk");
        let payload: Vec<u8> = (0..4 * 1024 * 1024u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&src, &payload).unwrap();

        let dst = dir.path().join("stemcell $1 dir.vmdk");
        runner.upload(&src, dst.to_str().unwrap()).await.unwrap();
        assert_eq!(std::fs::read(&dst).unwrap(), payload);
    }

    #[tokio::test]
    async fn put_then_get_round_trips_through_the_remote_shell() {
        let dir = tempfile::tempdir().unwrap();
        let runner = loopback_runner(dir.path());

        let path = dir.path().join("it's env.json");
        let path = path.to_str().unwrap();
        runner.put(path, b"{\"a\":\"$b\"}").await.unwrap();
        assert_eq!(runner.get(path).await.unwrap(), b"{\"a\":\"$b\"}");
    }

    #[tokio::test]
    async fn upload_of_a_missing_file_fails_before_connecting() {
        let dir = tempfile::tempdir().unwrap();
        let runner = loopback_runner(dir.path());
        let err = runner
            .upload(&dir.path().join("missing.vmdk"), "/tmp/x")
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("opening"), "{err:#}");
    }

    #[test]
    fn new_writes_private_key_with_trailing_newline() {
        let runner = SshRunner::new(SshOpts {
            host: "192.168.50.1".into(),
            username: "ubuntu".into(),
            private_key: "-----BEGIN KEY-----".into(),
            port: 22,
        })
        .unwrap();

        let key = std::fs::read_to_string(runner.scratch.path().join("id")).unwrap();
        assert_eq!(key, "-----BEGIN KEY-----\n");
    }
}
