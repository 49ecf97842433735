//! Terminal command history.
//!
//! The printer keeps a short ring of recently executed commands. Every
//! command that has been reported to the backend is echoed into a local
//! append-only log, so that after a restart the same ring is not reported
//! again. [`reconcile`] compares the ring against the log tail and returns
//! the unseen suffix.

use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::AgentError;
use crate::gateway::PrinterGateway;
use crate::util::timestamp_now;

/// Log is compacted back to its tail once it grows past this size.
const COMPACT_THRESHOLD_BYTES: u64 = 256 * 1024;

/// Return the commands in `fetched` not already covered by `tail`.
///
/// Log lines carry a timestamp prefix, so matching is substring containment.
/// The first tail line containing `fetched[0]` anchors the comparison; from
/// there each fetched command must appear in the corresponding tail line
/// until either list runs out. A failed comparison moves on to the next
/// anchor. Without any anchor the whole fetched list is new.
pub fn reconcile<T: AsRef<str>, F: AsRef<str>>(tail: &[T], fetched: &[F]) -> Vec<String> {
    let Some(first) = fetched.first() else {
        return Vec::new();
    };
    for (index, line) in tail.iter().enumerate() {
        if !line.as_ref().contains(first.as_ref()) {
            continue;
        }
        let aligned = tail[index..]
            .iter()
            .zip(fetched)
            .all(|(line, cmd)| line.as_ref().contains(cmd.as_ref()));
        if aligned {
            let covered = tail.len() - index;
            if covered > fetched.len() {
                return Vec::new();
            }
            return owned(&fetched[covered..]);
        }
    }
    owned(fetched)
}

fn owned<F: AsRef<str>>(items: &[F]) -> Vec<String> {
    items.iter().map(|s| s.as_ref().to_owned()).collect()
}

/// Keep commands containing any of `patterns`.
///
/// An empty pattern list keeps every command rather than none, so a status
/// query still reports new commands before any filter is configured.
pub fn cherry_pick(commands: &[String], patterns: &[String]) -> Vec<String> {
    if patterns.is_empty() {
        return commands.to_vec();
    }
    commands
        .iter()
        .filter(|cmd| patterns.iter().any(|p| cmd.contains(p.as_str())))
        .cloned()
        .collect()
}

#[derive(Debug)]
pub struct CommandHistory {
    path: PathBuf,
    tail_lines: usize,
    fetch_count: usize,
    lock: Mutex<()>,
}

impl CommandHistory {
    pub fn new(path: impl Into<PathBuf>, tail_lines: usize, fetch_count: usize) -> Self {
        Self {
            path: path.into(),
            tail_lines,
            fetch_count,
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Fetch the printer's recent commands, record the unseen ones, and
    /// return them.
    pub async fn unseen(&self, gateway: &dyn PrinterGateway) -> Result<Vec<String>, AgentError> {
        let fetched: Vec<String> = gateway
            .recent_commands(self.fetch_count)
            .await?
            .into_iter()
            .map(|cmd| cmd.replace('\n', "\\n"))
            .collect();

        let _guard = self.lock.lock().await;
        let tail = self.tail().await?;
        let fresh = reconcile(&tail[..], &fetched[..]);
        debug!(
            fetched = fetched.len(),
            fresh = fresh.len(),
            "reconciled terminal commands"
        );
        self.append(&fresh).await?;
        Ok(fresh)
    }

    /// Last `tail_lines` lines of the log, oldest first. A missing log is empty.
    pub async fn tail(&self) -> Result<Vec<String>, AgentError> {
        let text = match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(AgentError::io(&self.path, err)),
        };
        Ok(last_lines(&text, self.tail_lines))
    }

    async fn append(&self, commands: &[String]) -> Result<(), AgentError> {
        if commands.is_empty() {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| AgentError::io(parent, e))?;
        }

        let stamp = timestamp_now();
        let mut block = String::new();
        for cmd in commands {
            block.push_str(&format!("{stamp} {cmd}\n"));
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| AgentError::io(&self.path, e))?;
        file.write_all(block.as_bytes())
            .await
            .map_err(|e| AgentError::io(&self.path, e))?;
        file.flush().await.map_err(|e| AgentError::io(&self.path, e))?;
        let len = file
            .metadata()
            .await
            .map_err(|e| AgentError::io(&self.path, e))?
            .len();
        drop(file);

        if len > COMPACT_THRESHOLD_BYTES {
            self.compact().await?;
        }
        Ok(())
    }

    async fn compact(&self) -> Result<(), AgentError> {
        let text = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| AgentError::io(&self.path, e))?;
        let mut kept = last_lines(&text, self.tail_lines).join("\n");
        kept.push('\n');
        tokio::fs::write(&self.path, kept)
            .await
            .map_err(|e| AgentError::io(&self.path, e))?;
        debug!(path = ?self.path, "compacted command log");
        Ok(())
    }
}

fn last_lines(text: &str, n: usize) -> Vec<String> {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].iter().map(|l| (*l).to_owned()).collect()
}
