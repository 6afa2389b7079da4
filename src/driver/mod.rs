//! Command execution layer for the VirtualBox CPI.
//!
//! Everything the CPI does to the hypervisor or to its own store goes through
//! a [`Runner`]: VBoxManage invocations, journal reads and writes, stemcell
//! uploads. Two transports implement it:
//!
//! ```text
//! Driver (exec.rs)                 classify output, retry transient failures
//!     └─► ExpandingPathRunner      expand a leading `~` in every path argument
//!             ├─► LocalRunner      tokio::process on this machine
//!             └─► SshRunner        `ssh` binary against a remote hypervisor host
//! ```
//!
//! A runner reports the exit status of the command it ran; it only returns
//! `Err` when the command could not be launched or the transport failed.
//! Interpreting non-zero statuses is the [`exec::Driver`]'s job.

use std::path::Path;

use anyhow::Result;
use async_trait::async_trait;

pub mod exec;
pub mod expanding;
#[cfg(any(test, feature = "test-util"))]
pub mod fake;
pub mod local;
pub mod retry;
pub mod ssh;

// ---------------------------------------------------------------------------
// Shared types
// ---------------------------------------------------------------------------

/// Outcome of one command invocation.
///
/// `output` is stdout followed by a newline and stderr. VBoxManage prints
/// diagnostics to either stream, so callers always match against the
/// combined text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub output: String,
    pub status: i32,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// Where commands and file transfers happen.
#[async_trait]
pub trait Runner: Send + Sync {
    /// Run `path` with `args` and wait for it to exit.
    async fn execute(&self, path: &str, args: &[String]) -> Result<ExecOutput>;

    /// Write `contents` to `path`, replacing any existing file.
    async fn put(&self, path: &str, contents: &[u8]) -> Result<()>;

    /// Read the whole file at `path`.
    async fn get(&self, path: &str) -> Result<Vec<u8>>;

    /// Move a local file at `src` to `dst` on the execution target.
    async fn upload(&self, src: &Path, dst: &str) -> Result<()>;

    /// Home directory of the user commands run as.
    async fn home_dir(&self) -> Result<String>;
}

pub use exec::{Driver, DriverError, ExecuteOpts};
pub use expanding::ExpandingPathRunner;
pub use local::LocalRunner;
pub use retry::{Retrier, Retryable};
pub use ssh::{SshOpts, SshRunner};

/// Shorthand used by callers that build argument lists from string literals.
pub fn args<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    items.into_iter().map(Into::into).collect()
}
