//! Request recorder: in `record` mode every raw response body is
//! persisted with a monotonic sequence number, pruned to the most recent
//! `keep_last`; in `replay` mode outbound calls are answered from disk
//! in the same order. Replay drives deterministic tests.

use oxpoll_common::config::{RecorderConfig, RecorderMode};
use oxpoll_common::error::{Error, Result};
use std::path::{Path, PathBuf};

const SUFFIX: &str = "rec";

#[derive(Debug)]
pub struct Recorder {
    dir: PathBuf,
    mode: RecorderMode,
    keep_last: usize,
    next_seq: u64,
}

impl Recorder {
    pub fn from_config(config: &RecorderConfig) -> Result<Self> {
        let dir = PathBuf::from(&config.path);
        let next_seq = match config.mode {
            RecorderMode::Record => {
                std::fs::create_dir_all(&dir)?;
                existing_seqs(&dir)?.last().map_or(1, |max| max + 1)
            }
            RecorderMode::Replay => existing_seqs(&dir)?.first().copied().unwrap_or(1),
        };
        Ok(Recorder {
            dir,
            mode: config.mode,
            keep_last: config.keep_last.max(1),
            next_seq,
        })
    }

    pub fn mode(&self) -> RecorderMode {
        self.mode
    }

    pub fn is_replay(&self) -> bool {
        self.mode == RecorderMode::Replay
    }

    /// Persists one response body and prunes old entries.
    pub fn record(&mut self, body: &str) -> Result<()> {
        if self.is_replay() {
            return Ok(());
        }
        let path = self.entry_path(self.next_seq);
        std::fs::write(path, body)?;
        self.next_seq += 1;
        self.prune()
    }

    /// The next recorded response, in recording order.
    pub fn next_response(&mut self) -> Result<String> {
        let path = self.entry_path(self.next_seq);
        let body = std::fs::read_to_string(&path).map_err(|_| {
            Error::Protocol(format!(
                "replay exhausted at sequence {} ({})",
                self.next_seq,
                path.display()
            ))
        })?;
        self.next_seq += 1;
        Ok(body)
    }

    fn entry_path(&self, seq: u64) -> PathBuf {
        self.dir.join(format!("{seq:08}.{SUFFIX}"))
    }

    fn prune(&self) -> Result<()> {
        let seqs = existing_seqs(&self.dir)?;
        if seqs.len() <= self.keep_last {
            return Ok(());
        }
        for seq in &seqs[..seqs.len() - self.keep_last] {
            std::fs::remove_file(self.entry_path(*seq))?;
        }
        Ok(())
    }
}

fn existing_seqs(dir: &Path) -> Result<Vec<u64>> {
    let mut seqs = Vec::new();
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(seqs),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        let name = entry?.file_name();
        let name = name.to_string_lossy();
        if let Some(stem) = name.strip_suffix(&format!(".{SUFFIX}")) {
            if let Ok(seq) = stem.parse::<u64>() {
                seqs.push(seq);
            }
        }
    }
    seqs.sort_unstable();
    Ok(seqs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder(dir: &Path, mode: RecorderMode, keep_last: usize) -> Recorder {
        Recorder::from_config(&RecorderConfig {
            path: dir.to_string_lossy().to_string(),
            mode,
            keep_last,
        })
        .unwrap()
    }

    #[test]
    fn record_then_replay_preserves_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut rec = recorder(dir.path(), RecorderMode::Record, 10);
        rec.record("first").unwrap();
        rec.record("second").unwrap();

        let mut replay = recorder(dir.path(), RecorderMode::Replay, 10);
        assert_eq!(replay.next_response().unwrap(), "first");
        assert_eq!(replay.next_response().unwrap(), "second");
        assert!(matches!(
            replay.next_response(),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn keep_last_prunes_oldest_entries() {
        let dir = tempfile::tempdir().unwrap();
        let mut rec = recorder(dir.path(), RecorderMode::Record, 2);
        rec.record("one").unwrap();
        rec.record("two").unwrap();
        rec.record("three").unwrap();

        let mut replay = recorder(dir.path(), RecorderMode::Replay, 2);
        assert_eq!(replay.next_response().unwrap(), "two");
        assert_eq!(replay.next_response().unwrap(), "three");
    }

    #[test]
    fn recording_resumes_after_existing_sequence() {
        let dir = tempfile::tempdir().unwrap();
        recorder(dir.path(), RecorderMode::Record, 10)
            .record("one")
            .unwrap();
        // a second session must not overwrite the first entry
        recorder(dir.path(), RecorderMode::Record, 10)
            .record("two")
            .unwrap();

        let mut replay = recorder(dir.path(), RecorderMode::Replay, 10);
        assert_eq!(replay.next_response().unwrap(), "one");
        assert_eq!(replay.next_response().unwrap(), "two");
    }
}
