//! Scripted in-memory [`Runner`] for exercising the CPI without VirtualBox.
//!
//! VBoxManage invocations are answered from a rule table keyed by command
//! prefix (arguments joined by spaces, binary name omitted) and recorded in
//! order. File operations (`put`, `get`, `mkdir -p`, `ls -1`, `rm -rf`,
//! `test -d`) act on an in-memory file map so store and journal code
//! behaves as it would against a real filesystem.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;

use super::{ExecOutput, Runner};

type Handler = Arc<dyn Fn(&str) -> (String, i32) + Send + Sync>;

enum Reply {
    Output(String, i32),
    Dynamic(Handler),
    Transport,
}

struct Rule {
    prefix: String,
    replies: VecDeque<Reply>,
}

#[derive(Default)]
pub struct FakeRunner {
    rules: Mutex<Vec<Rule>>,
    commands: Mutex<Vec<String>>,
    files: Mutex<BTreeMap<String, Vec<u8>>>,
    dirs: Mutex<BTreeSet<String>>,
    home: Mutex<Option<String>>,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Always answer commands starting with `prefix` with `output`/`status`.
    /// Later rules take precedence over earlier ones.
    pub fn on(&self, prefix: &str, output: &str, status: i32) {
        self.push_rule(prefix, vec![Reply::Output(output.to_string(), status)]);
    }

    /// Answer successive matching commands in order; the last reply repeats.
    pub fn on_seq(&self, prefix: &str, replies: Vec<(String, i32)>) {
        self.push_rule(
            prefix,
            replies.into_iter().map(|(o, s)| Reply::Output(o, s)).collect(),
        );
    }

    /// Answer matching commands by calling `handler` with the full command
    /// line. Lets a test keep its own model of hypervisor state.
    pub fn on_fn<F>(&self, prefix: &str, handler: F)
    where
        F: Fn(&str) -> (String, i32) + Send + Sync + 'static,
    {
        self.push_rule(prefix, vec![Reply::Dynamic(Arc::new(handler))]);
    }

    /// Matching commands fail as if the transport were down.
    pub fn fail_transport(&self, prefix: &str) {
        self.push_rule(prefix, vec![Reply::Transport]);
    }

    pub fn set_home(&self, home: &str) {
        *lock(&self.home) = Some(home.to_string());
    }

    fn push_rule(&self, prefix: &str, replies: Vec<Reply>) {
        lock(&self.rules).push(Rule {
            prefix: prefix.to_string(),
            replies: replies.into(),
        });
    }

    /// Every VBoxManage command run so far, arguments joined by spaces.
    pub fn commands(&self) -> Vec<String> {
        lock(&self.commands).clone()
    }

    /// Commands starting with `prefix`.
    pub fn commands_matching(&self, prefix: &str) -> Vec<String> {
        self.commands()
            .into_iter()
            .filter(|c| c.starts_with(prefix))
            .collect()
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        lock(&self.files).get(path).cloned()
    }

    pub fn file_paths(&self) -> Vec<String> {
        lock(&self.files).keys().cloned().collect()
    }

    pub fn insert_file(&self, path: &str, contents: &[u8]) {
        lock(&self.files).insert(path.to_string(), contents.to_vec());
    }

    fn reply_for(&self, cmd: &str) -> Result<ExecOutput> {
        let mut rules = lock(&self.rules);
        let Some(rule) = rules.iter_mut().rev().find(|r| cmd.starts_with(&r.prefix)) else {
            return Ok(ExecOutput {
                output: String::new(),
                status: 0,
            });
        };

        let reply = if rule.replies.len() > 1 {
            rule.replies.pop_front()
        } else {
            None
        };
        let reply = match &reply {
            Some(r) => r,
            None => rule
                .replies
                .front()
                .ok_or_else(|| anyhow!("rule for '{}' has no replies", rule.prefix))?,
        };

        match reply {
            Reply::Output(output, status) => Ok(ExecOutput {
                output: output.clone(),
                status: *status,
            }),
            Reply::Dynamic(handler) => {
                let (output, status) = handler(cmd);
                Ok(ExecOutput { output, status })
            }
            Reply::Transport => bail!("connection reset while running '{cmd}'"),
        }
    }

    fn file_command(&self, path: &str, args: &[String]) -> Result<ExecOutput> {
        let mut files = lock(&self.files);
        let mut dirs = lock(&self.dirs);
        let (output, status) = match (path, args) {
            ("mkdir", [_, dir]) => {
                dirs.insert(dir.trim_end_matches('/').to_string());
                (String::new(), 0)
            }
            ("ls", [_, dir]) => {
                let prefix = format!("{}/", dir.trim_end_matches('/'));
                let mut names: Vec<&str> = files
                    .keys()
                    .chain(dirs.iter())
                    .filter_map(|k| k.strip_prefix(&prefix))
                    .map(|rest| rest.split('/').next().unwrap_or(rest))
                    .collect();
                names.sort();
                names.dedup();
                (names.join("\n"), 0)
            }
            ("rm", [_, target]) => {
                let target = target.trim_end_matches('/');
                let prefix = format!("{target}/");
                files.retain(|k, _| k != target && !k.starts_with(&prefix));
                dirs.retain(|k| k != target && !k.starts_with(&prefix));
                (String::new(), 0)
            }
            ("test", [_, target]) => {
                let target = target.trim_end_matches('/');
                let prefix = format!("{target}/");
                let found = dirs.contains(target) || files.keys().any(|k| k.starts_with(&prefix));
                (String::new(), if found { 0 } else { 1 })
            }
            _ => bail!("unsupported file command: {path} {}", args.join(" ")),
        };
        Ok(ExecOutput { output, status })
    }

    /// Whether `mkdir -p` created `dir` (and nothing removed it since).
    pub fn has_dir(&self, dir: &str) -> bool {
        lock(&self.dirs).contains(dir.trim_end_matches('/'))
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl Runner for FakeRunner {
    async fn execute(&self, path: &str, args: &[String]) -> Result<ExecOutput> {
        if matches!(path, "mkdir" | "ls" | "rm" | "test") {
            return self.file_command(path, args);
        }
        let cmd = args.join(" ");
        lock(&self.commands).push(cmd.clone());
        self.reply_for(&cmd)
    }

    async fn put(&self, path: &str, contents: &[u8]) -> Result<()> {
        self.insert_file(path, contents);
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Vec<u8>> {
        self.file(path)
            .ok_or_else(|| anyhow!("cat: {path}: No such file or directory"))
    }

    async fn upload(&self, src: &Path, dst: &str) -> Result<()> {
        let contents = std::fs::read(src)?;
        self.insert_file(dst, &contents);
        Ok(())
    }

    async fn home_dir(&self) -> Result<String> {
        lock(&self.home)
            .clone()
            .ok_or_else(|| anyhow!("home directory is not scripted"))
    }
}
