//! VBoxManage invocation with output classification and retry.
//!
//! VBoxManage does not reliably signal failure through its exit status, so
//! every result is classified from both the status and the combined output:
//!
//! | Condition                                     | Outcome                  |
//! |-----------------------------------------------|--------------------------|
//! | runner could not launch / transport failed    | retried                  |
//! | output says the object is not ready           | retried                  |
//! | exit status 126                               | corrupted installation   |
//! | other non-zero status                         | failure unless ignored   |
//! | status 0, `/dev/vboxnetctl` could not open    | missing host driver      |
//! | status 0, output carries `VBoxManage: error:` | failure                  |

use std::sync::Arc;

use anyhow::{Result, anyhow};
use tracing::debug;

use super::retry::{Retrier, Retryable};
use super::{ExecOutput, Runner};

const NOT_READY: &str = "VBoxManage: error: The object is not ready";
const DEV_CTL_ERROR: &str = "failed to open /dev/vboxnetctl";
const GENERIC_ERROR: &str = "VBoxManage: error:";
const MISSING_VM: &str = "Could not find a registered machine with UUID";

/// Status a shell reports when the program was found but one of its own
/// dependencies could not be executed.
const STATUS_CANNOT_EXECUTE: i32 = 126;

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("Most likely corrupted VirtualBox installation")]
    CorruptedInstallation { output: String },

    #[error("Error message about vboxnetctl: VirtualBox kernel drivers are most likely not loaded")]
    MissingHostDriver { output: String },

    #[error("Error executing command:\nCommand: '{args}'\nExit code: {status}\nOutput: '{output}'")]
    CommandFailed {
        args: String,
        status: i32,
        output: String,
    },
}

impl DriverError {
    pub fn output(&self) -> &str {
        match self {
            DriverError::CorruptedInstallation { output }
            | DriverError::MissingHostDriver { output }
            | DriverError::CommandFailed { output, .. } => output,
        }
    }
}

/// Output of the failed VBoxManage command anywhere in `err`'s chain.
pub fn error_output(err: &anyhow::Error) -> Option<&str> {
    err.chain()
        .find_map(|e| e.downcast_ref::<DriverError>())
        .map(DriverError::output)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ExecuteOpts {
    /// Return the output of a non-zero exit instead of failing. Callers use
    /// this when they recognise success from the text itself.
    pub ignore_non_zero_exit: bool,
}

/// Executes VBoxManage through a [`Runner`].
#[derive(Clone)]
pub struct Driver {
    runner: Arc<dyn Runner>,
    retrier: Retrier,
    bin_path: String,
}

impl Driver {
    pub fn new(runner: Arc<dyn Runner>, retrier: Retrier, bin_path: impl Into<String>) -> Self {
        Self {
            runner,
            retrier,
            bin_path: bin_path.into(),
        }
    }

    pub fn runner(&self) -> &Arc<dyn Runner> {
        &self.runner
    }

    pub async fn run(&self, args: &[&str]) -> Result<String> {
        self.run_with_opts(args, ExecuteOpts::default()).await
    }

    pub async fn run_with_opts(&self, args: &[&str], opts: ExecuteOpts) -> Result<String> {
        let argv: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        debug!(bin = %self.bin_path, args = ?argv, "Executing VBoxManage");

        let ExecOutput { output, status } = self
            .retrier
            .retry(|| async {
                let out = self
                    .runner
                    .execute(&self.bin_path, &argv)
                    .await
                    .map_err(Retryable::wrap)?;
                if out.output.contains(NOT_READY) {
                    return Err(Retryable::wrap(anyhow!(
                        "VirtualBox object is not ready (exit {}): {}",
                        out.status,
                        out.output.trim()
                    )));
                }
                Ok(out)
            })
            .await?;

        let output = output.replace("\r\n", "\n");
        classify(&argv, status, output, opts)
    }
}

/// Whether VBoxManage output says the referenced VM is not registered.
pub fn is_missing_vm(output: &str) -> bool {
    output.contains(MISSING_VM)
}

/// Whether `err` is a VBoxManage failure about an unregistered VM.
pub fn is_missing_vm_err(err: &anyhow::Error) -> bool {
    error_output(err).is_some_and(is_missing_vm)
}

fn classify(argv: &[String], status: i32, output: String, opts: ExecuteOpts) -> Result<String> {
    let errored = if status != 0 {
        if status == STATUS_CANNOT_EXECUTE {
            return Err(DriverError::CorruptedInstallation { output }.into());
        }
        !opts.ignore_non_zero_exit
    } else {
        if output.contains(DEV_CTL_ERROR) {
            return Err(DriverError::MissingHostDriver { output }.into());
        }
        if output.contains(GENERIC_ERROR) {
            debug!("VBoxManage error text found, assuming error");
            true
        } else {
            false
        }
    };

    if errored {
        return Err(DriverError::CommandFailed {
            args: argv.join(" "),
            status,
            output,
        }
        .into());
    }

    Ok(output)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
