use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStdout, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use lumberjack_types::LogLine;

use crate::LogBuffer;

/// Size of a single read from a tail process
const READ_CHUNK: usize = 8 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum TailError {
    #[error("failed to spawn tail for {path}: {source}")]
    Spawn {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("tail for {0} has no stdout")]
    NoStdout(PathBuf),
}

/// Splits a byte stream into complete lines
///
/// A trailing partial line is held back until its newline arrives.
#[derive(Debug, Default)]
pub struct LineSplitter {
    partial: Vec<u8>,
}

impl LineSplitter {
    /// Feed a chunk and return the lines it completed
    pub fn push(&mut self, chunk: &[u8]) -> Vec<LogLine> {
        let mut lines = Vec::new();
        let mut rest = chunk;

        while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            self.partial.extend_from_slice(&rest[..pos]);
            lines.push(self.take_line());
            rest = &rest[pos + 1..];
        }
        self.partial.extend_from_slice(rest);

        lines
    }

    /// Flush whatever is left once the stream closes
    pub fn finish(&mut self) -> Option<LogLine> {
        if self.partial.is_empty() {
            None
        } else {
            Some(self.take_line())
        }
    }

    fn take_line(&mut self) -> LogLine {
        let mut bytes = std::mem::take(&mut self.partial);
        if bytes.last() == Some(&b'\r') {
            bytes.pop();
        }
        LogLine::from(String::from_utf8_lossy(&bytes).into_owned())
    }
}

/// Runs one `tail -F` process per watched file and feeds its buffer
pub struct TailManager {
    /// Cancellation token for stopping tails
    cancel: CancellationToken,

    /// Active tail task handles
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl TailManager {
    pub fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            tasks: Vec::new(),
        }
    }

    /// Start following `path`, backfilling up to `backfill` existing lines
    pub fn start(
        &mut self,
        path: impl AsRef<Path>,
        buffer: LogBuffer,
        backfill: usize,
    ) -> Result<(), TailError> {
        let path = path.as_ref().to_path_buf();

        let mut child = Command::new("tail")
            .arg("-F")
            .arg(format!("-n{}", backfill))
            .arg(&path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| TailError::Spawn {
                path: path.clone(),
                source,
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TailError::NoStdout(path.clone()))?;

        info!(path = %path.display(), "Tailing");
        let task = self.spawn_reader(path, child, stdout, buffer);
        self.tasks.push(task);
        Ok(())
    }

    fn spawn_reader(
        &self,
        path: PathBuf,
        mut child: Child,
        mut stdout: ChildStdout,
        buffer: LogBuffer,
    ) -> tokio::task::JoinHandle<()> {
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let mut splitter = LineSplitter::default();
            let mut chunk = vec![0u8; READ_CHUNK];

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,

                    read = stdout.read(&mut chunk) => {
                        match read {
                            Ok(0) => {
                                debug!(path = %path.display(), "Closing");
                                break;
                            }
                            Ok(n) => {
                                let lines = splitter.push(&chunk[..n]);
                                if !lines.is_empty() {
                                    buffer.append_batch(lines);
                                }
                            }
                            Err(e) => {
                                warn!(path = %path.display(), error = %e, "Tail read failed");
                                break;
                            }
                        }
                    }
                }
            }

            if let Some(line) = splitter.finish() {
                buffer.append(line);
            }
            if let Err(e) = child.kill().await {
                debug!(path = %path.display(), error = %e, "Tail already gone");
            }
        })
    }

    /// Stop all tails
    pub fn stop(&mut self) {
        self.cancel.cancel();
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.cancel = CancellationToken::new();
    }

    /// Get the number of tails still running
    pub fn active_count(&self) -> usize {
        self.tasks.iter().filter(|t| !t.is_finished()).count()
    }
}

impl Default for TailManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TailManager {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;

    fn texts(lines: &[LogLine]) -> Vec<String> {
        lines.iter().map(|l| l.to_string()).collect()
    }

    #[test]
    fn test_splitter_holds_partial_line() {
        let mut splitter = LineSplitter::default();

        assert_eq!(texts(&splitter.push(b"one\ntw")), ["one"]);
        assert_eq!(texts(&splitter.push(b"o\r\nthree\n\nfo")), ["two", "three", ""]);
        assert_eq!(splitter.finish().map(|l| l.to_string()), Some("fo".to_string()));
        assert!(splitter.finish().is_none());
    }

    #[test]
    fn test_splitter_replaces_invalid_utf8() {
        let mut splitter = LineSplitter::default();
        let lines = splitter.push(b"ok \xff\n");
        assert_eq!(texts(&lines), ["ok \u{fffd}"]);
    }

    #[tokio::test]
    async fn test_tail_feeds_buffer() {
        let path = std::env::temp_dir().join(format!("lumberjack-tail-{}.log", std::process::id()));
        {
            let mut file = std::fs::File::create(&path).unwrap();
            writeln!(file, "first").unwrap();
            writeln!(file, "second").unwrap();
        }

        let buffer = LogBuffer::new(10);
        let mut manager = TailManager::new();
        manager.start(&path, buffer.clone(), 10).unwrap();

        tokio::time::timeout(Duration::from_secs(10), async {
            while buffer.len() < 2 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(texts(&buffer.snapshot()), ["first", "second"]);
        assert_eq!(manager.active_count(), 1);

        manager.stop();
        let _ = std::fs::remove_file(&path);
    }
}
