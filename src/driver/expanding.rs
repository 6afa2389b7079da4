//! Runner decorator that expands a leading `~` in path arguments.
//!
//! The store directory in the configuration is usually written as
//! `~/.bosh_virtualbox_cpi`, which only the target machine can resolve. The
//! home directory is looked up once and cached for the process lifetime.

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::OnceCell;

use super::{ExecOutput, Runner};

pub struct ExpandingPathRunner {
    inner: Arc<dyn Runner>,
    home: OnceCell<String>,
}

impl ExpandingPathRunner {
    pub fn new(inner: Arc<dyn Runner>) -> Self {
        Self {
            inner,
            home: OnceCell::new(),
        }
    }

    async fn expand(&self, arg: &str) -> Result<String> {
        let rest = match arg.strip_prefix('~') {
            Some(rest) if rest.is_empty() || rest.starts_with('/') => rest,
            _ => return Ok(arg.to_string()),
        };

        let home = self
            .home
            .get_or_try_init(|| async { self.inner.home_dir().await })
            .await?;

        let home = home.trim_end_matches('/');
        Ok(format!("{home}{rest}"))
    }
}

#[async_trait]
impl Runner for ExpandingPathRunner {
    async fn execute(&self, path: &str, args: &[String]) -> Result<ExecOutput> {
        let mut expanded = Vec::with_capacity(args.len());
        for arg in args {
            expanded.push(self.expand(arg).await?);
        }
        self.inner.execute(path, &expanded).await
    }

    async fn put(&self, path: &str, contents: &[u8]) -> Result<()> {
        let path = self.expand(path).await?;
        self.inner.put(&path, contents).await
    }

    async fn get(&self, path: &str) -> Result<Vec<u8>> {
        let path = self.expand(path).await?;
        self.inner.get(&path).await
    }

    async fn upload(&self, src: &Path, dst: &str) -> Result<()> {
        let dst = self.expand(dst).await?;
        self.inner.upload(src, &dst).await
    }

    async fn home_dir(&self) -> Result<String> {
        self.home
            .get_or_try_init(|| async { self.inner.home_dir().await })
            .await
            .cloned()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Recorder {
        home_lookups: AtomicUsize,
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Runner for Recorder {
        async fn execute(&self, _path: &str, args: &[String]) -> Result<ExecOutput> {
            self.seen.lock().unwrap().extend(args.iter().cloned());
            Ok(ExecOutput { output: String::new(), status: 0 })
        }
        async fn put(&self, path: &str, _contents: &[u8]) -> Result<()> {
            self.seen.lock().unwrap().push(path.to_string());
            Ok(())
        }
        async fn get(&self, path: &str) -> Result<Vec<u8>> {
            self.seen.lock().unwrap().push(path.to_string());
            Ok(Vec::new())
        }
        async fn upload(&self, _src: &Path, dst: &str) -> Result<()> {
            self.seen.lock().unwrap().push(dst.to_string());
            Ok(())
        }
        async fn home_dir(&self) -> Result<String> {
            self.home_lookups.fetch_add(1, Ordering::SeqCst);
            Ok("/home/vcap".to_string())
        }
    }

    #[tokio::test]
    async fn expands_leading_tilde_and_caches_home() {
        let inner = Arc::new(Recorder::default());
        let runner = ExpandingPathRunner::new(inner.clone());

        runner
            .execute(
                "VBoxManage",
                &crate::driver::args(["~/vms/vm-1", "~", "a~b", "~other/x"]),
            )
            .await
            .unwrap();
        runner.put("~/disks/d/x", b"").await.unwrap();
        runner.get("/abs/path").await.unwrap();

        let seen = inner.seen.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![
                "/home/vcap/vms/vm-1",
                "/home/vcap",
                "a~b",
                "~other/x",
                "/home/vcap/disks/d/x",
                "/abs/path",
            ]
        );
        assert_eq!(inner.home_lookups.load(Ordering::SeqCst), 1);
    }
}
