//! Waiting for expected output on a remote shell.
//!
//! `Expecter` wraps a `Shell` and keeps every byte of output seen since the
//! last successful match. `expect_any` blocks until one of an ordered list of
//! patterns shows up in that buffer, the stream ends, the timeout passes, or
//! the run is cancelled.

use std::fmt;
use std::time::Duration;

use memchr::memmem;
use tokio::time::Instant;

use crate::error::DeployError;
use crate::session::{Chunk, Shell};
use crate::sync::Cancel;

/// Per-read wait while `expect_any` has no deadline.
const UNBOUNDED_READ_WAIT: Duration = Duration::from_secs(60);
/// Shortest poll `drain` uses, whatever it is asked for.
pub const MIN_DRAIN_POLL: Duration = Duration::from_millis(10);

/// Something `expect_any` can wait for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pattern {
    /// Substring of the output.
    Text(String),
    /// The remote side closed the stream.
    Eof,
    /// Nothing else matched before the timeout.
    Timeout,
}

impl Pattern {
    pub fn text(text: impl Into<String>) -> Self {
        Pattern::Text(text.into())
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Pattern::Text(text) => write!(f, "{:?}", text),
            Pattern::Eof => write!(f, "<EOF>"),
            Pattern::Timeout => write!(f, "<TIMEOUT>"),
        }
    }
}

/// Index of the first text pattern (in list order) contained in `buffer`, and
/// where that occurrence ends.
fn first_match(buffer: &[u8], patterns: &[Pattern]) -> Option<(usize, usize)> {
    patterns.iter().enumerate().find_map(|(index, pattern)| match pattern {
        Pattern::Text(text) => {
            memmem::find(buffer, text.as_bytes()).map(|start| (index, start + text.len()))
        }
        Pattern::Eof | Pattern::Timeout => None,
    })
}

fn position(patterns: &[Pattern], wanted: &Pattern) -> Option<usize> {
    patterns.iter().position(|pattern| pattern == wanted)
}

pub struct Expecter {
    shell: Box<dyn Shell>,
    cancel: Cancel,
    /// Output since the last successful match.
    buffer: Vec<u8>,
    eof: bool,
}

impl Expecter {
    pub fn new(shell: Box<dyn Shell>, cancel: Cancel) -> Self {
        Self {
            shell,
            cancel,
            buffer: Vec::new(),
            eof: false,
        }
    }

    pub async fn send_line(&mut self, text: &str) -> Result<(), DeployError> {
        tracing::trace!(line = text, "send");
        self.shell.send_line(text).await
    }

    /// Read until nothing new arrives for `quiet`, polling every `poll`.
    ///
    /// Returns everything read, which is also dropped from the match buffer.
    /// Never fails: end-of-stream, read errors and cancellation just end the
    /// drain, and the next `expect_any` reports them.
    pub async fn drain(&mut self, poll: Duration, quiet: Duration) -> String {
        let poll = poll.max(MIN_DRAIN_POLL);
        let mut drained = std::mem::take(&mut self.buffer);
        let mut last_data = Instant::now();
        while !self.eof && !self.cancel.is_cancelled() {
            let chunk = tokio::select! {
                chunk = self.shell.read(poll) => chunk,
                _ = self.cancel.cancelled() => break,
            };
            match chunk {
                Ok(Chunk::Data(bytes)) => {
                    drained.extend_from_slice(&bytes);
                    last_data = Instant::now();
                }
                Ok(Chunk::Quiet) => {
                    if last_data.elapsed() >= quiet {
                        break;
                    }
                }
                Ok(Chunk::Eof) | Err(_) => self.eof = true,
            }
        }
        String::from_utf8_lossy(&drained).into_owned()
    }

    /// Wait until one of `patterns` appears, returning its index.
    ///
    /// Patterns are tried in list order after every read, so when several are
    /// present in the buffer at once the earliest listed one wins. `None` as
    /// the timeout waits forever (or until cancelled), and so does a timeout
    /// too large to be represented as a deadline.
    pub async fn expect_any(
        &mut self,
        patterns: &[Pattern],
        timeout: Option<Duration>,
    ) -> Result<usize, DeployError> {
        let (index, _) = self.wait_for(patterns, timeout).await?;
        Ok(index)
    }

    /// Wait for `marker` and return the output that came before it.
    pub async fn read_until(
        &mut self,
        marker: &str,
        timeout: Option<Duration>,
    ) -> Result<String, DeployError> {
        let (_, consumed) = self.wait_for(&[Pattern::text(marker)], timeout).await?;
        let before = &consumed[..consumed.len() - marker.len()];
        Ok(String::from_utf8_lossy(before).into_owned())
    }

    /// Index of the pattern that fired, and the buffered output it consumed.
    async fn wait_for(
        &mut self,
        patterns: &[Pattern],
        timeout: Option<Duration>,
    ) -> Result<(usize, Vec<u8>), DeployError> {
        let deadline = timeout.and_then(|timeout| Instant::now().checked_add(timeout));
        loop {
            if let Some((index, end)) = first_match(&self.buffer, patterns) {
                let consumed = self.buffer.drain(..end).collect();
                tracing::debug!(pattern = %patterns[index], "matched");
                return Ok((index, consumed));
            }
            if self.eof {
                self.buffer.clear();
                return position(patterns, &Pattern::Eof)
                    .map(|index| (index, Vec::new()))
                    .ok_or(DeployError::EndOfStream);
            }
            let wait = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return position(patterns, &Pattern::Timeout)
                            .map(|index| (index, Vec::new()))
                            .ok_or_else(|| timeout_error(patterns));
                    }
                    deadline - now
                }
                None => UNBOUNDED_READ_WAIT,
            };
            let chunk = tokio::select! {
                chunk = self.shell.read(wait) => chunk,
                _ = self.cancel.cancelled() => return Err(DeployError::Cancelled),
            };
            match chunk {
                Ok(Chunk::Data(bytes)) => self.buffer.extend_from_slice(&bytes),
                Ok(Chunk::Quiet) => {}
                Ok(Chunk::Eof) => self.eof = true,
                Err(e) => {
                    tracing::debug!(error = %e, "read failed, treating as end of stream");
                    self.eof = true;
                }
            }
        }
    }

    pub async fn close(self) {
        self.shell.close().await;
    }
}

fn timeout_error(patterns: &[Pattern]) -> DeployError {
    DeployError::Timeout(patterns.iter().map(ToString::to_string).collect())
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;

    use super::*;

    /// Hands out canned chunks, then reports quiet (or EOF once exhausted, if asked to).
    struct CannedShell {
        chunks: VecDeque<Chunk>,
        eof_when_empty: bool,
    }

    impl CannedShell {
        fn boxed(chunks: &[&str], eof_when_empty: bool) -> Box<dyn Shell> {
            Box::new(Self {
                chunks: chunks
                    .iter()
                    .map(|c| Chunk::Data(c.as_bytes().to_vec()))
                    .collect(),
                eof_when_empty,
            })
        }
    }

    #[async_trait]
    impl Shell for CannedShell {
        async fn send_line(&mut self, _line: &str) -> Result<(), DeployError> {
            Ok(())
        }

        async fn read(&mut self, wait: Duration) -> Result<Chunk, DeployError> {
            match self.chunks.pop_front() {
                Some(chunk) => Ok(chunk),
                None if self.eof_when_empty => Ok(Chunk::Eof),
                None => {
                    tokio::time::sleep(wait).await;
                    Ok(Chunk::Quiet)
                }
            }
        }

        async fn close(self: Box<Self>) {}
    }

    /// Never says anything; counts how often it was asked.
    struct CountingShell {
        reads: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Shell for CountingShell {
        async fn send_line(&mut self, _line: &str) -> Result<(), DeployError> {
            Ok(())
        }

        async fn read(&mut self, wait: Duration) -> Result<Chunk, DeployError> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(wait).await;
            Ok(Chunk::Quiet)
        }

        async fn close(self: Box<Self>) {}
    }

    fn texts(patterns: &[&str]) -> Vec<Pattern> {
        patterns.iter().map(|p| Pattern::text(*p)).collect()
    }

    #[test]
    fn test_first_listed_pattern_wins() {
        let buffer = b"Nothing to do\nIs this ok [y/N]:";
        let patterns = texts(&["Is this ok", "Nothing to do"]);
        assert_eq!(first_match(buffer, &patterns), Some((0, 24)));
    }

    #[test]
    fn test_first_match_ignores_pseudo_patterns() {
        let patterns = vec![Pattern::Eof, Pattern::Timeout, Pattern::text("ok")];
        assert_eq!(first_match(b"ok", &patterns), Some((2, 2)));
        assert_eq!(first_match(b"nope", &patterns), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_match_split_across_chunks() {
        let shell = CannedShell::boxed(&["Is th", "is ok [y/d/N]"], false);
        let mut expecter = Expecter::new(shell, Cancel::new());
        let patterns = texts(&["Nothing to do", "Is this ok"]);
        let index = expecter
            .expect_any(&patterns, Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(index, 1);
        // Consumed through the end of the match.
        assert_eq!(expecter.buffer, b" [y/d/N]");
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_an_error_unless_listed() {
        let shell = CannedShell::boxed(&["chatter"], false);
        let mut expecter = Expecter::new(shell, Cancel::new());
        let result = expecter
            .expect_any(&texts(&["never"]), Some(Duration::from_secs(5)))
            .await;
        assert!(matches!(result, Err(DeployError::Timeout(_))));

        let patterns = vec![Pattern::text("never"), Pattern::Timeout];
        let result = expecter
            .expect_any(&patterns, Some(Duration::from_secs(5)))
            .await;
        assert_eq!(result.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_eof_is_an_error_unless_listed() {
        let shell = CannedShell::boxed(&["bye"], true);
        let mut expecter = Expecter::new(shell, Cancel::new());
        let result = expecter.expect_any(&texts(&["never"]), None).await;
        assert!(matches!(result, Err(DeployError::EndOfStream)));
        // Stays at EOF.
        let result = expecter.expect_any(&[Pattern::Eof], None).await;
        assert_eq!(result.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_resolves_unbounded_wait() {
        let cancel = Cancel::new();
        let shell = CannedShell::boxed(&[], false);
        let mut expecter = Expecter::new(shell, cancel.clone());
        let waiter = tokio::spawn(async move {
            expecter.expect_any(&[Pattern::text("never")], None).await
        });
        tokio::time::sleep(Duration::from_secs(3600)).await;
        cancel.cancel();
        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(DeployError::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_collects_until_quiet() {
        let shell = CannedShell::boxed(&["Last login: today\n", "motd\n"], false);
        let mut expecter = Expecter::new(shell, Cancel::new());
        let drained = expecter
            .drain(Duration::from_millis(100), Duration::from_millis(100))
            .await;
        assert_eq!(drained, "Last login: today\nmotd\n");
        assert!(expecter.buffer.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_of_silent_shell_is_empty() {
        let shell = CannedShell::boxed(&[], false);
        let mut expecter = Expecter::new(shell, Cancel::new());
        let drained = expecter
            .drain(Duration::from_millis(100), Duration::from_millis(100))
            .await;
        assert_eq!(drained, "");
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_until_returns_output_before_marker() {
        let shell = CannedShell::boxed(
            &["ps aux | grep srv; echo m-'done'\r\n", "root 12 srv\r\nm-", "done\r\n$ "],
            false,
        );
        let mut expecter = Expecter::new(shell, Cancel::new());
        let listing = expecter
            .read_until("m-done", Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(listing, "ps aux | grep srv; echo m-'done'\r\nroot 12 srv\r\n");
        assert_eq!(expecter.buffer, b"\r\n$ ");
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_until_times_out_without_marker() {
        let shell = CannedShell::boxed(&["root 12 srv\r\n"], false);
        let mut expecter = Expecter::new(shell, Cancel::new());
        let result = expecter
            .read_until("m-done", Some(Duration::from_secs(5)))
            .await;
        assert!(matches!(result, Err(DeployError::Timeout(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_huge_timeout_does_not_overflow() {
        let shell = CannedShell::boxed(&["", "Nothing to do"], false);
        let mut expecter = Expecter::new(shell, Cancel::new());
        let index = expecter
            .expect_any(&texts(&["Nothing to do"]), Some(Duration::MAX))
            .await
            .unwrap();
        assert_eq!(index, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_poll_drain_still_waits_between_reads() {
        let reads = Arc::new(AtomicUsize::new(0));
        let shell = Box::new(CountingShell {
            reads: Arc::clone(&reads),
        });
        let mut expecter = Expecter::new(shell, Cancel::new());
        let drained = expecter
            .drain(Duration::ZERO, Duration::from_millis(100))
            .await;
        assert_eq!(drained, "");
        let reads = reads.load(Ordering::SeqCst);
        assert!(reads <= 11, "{} reads", reads);
    }
}
