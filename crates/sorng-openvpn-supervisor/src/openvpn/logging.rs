//! Output capture: the session log buffer and the tasks that drain the
//! child's stdout and stderr line by line.

use crate::openvpn::types::OutputStream;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::task::JoinHandle;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Log buffer
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Ordered record of every line the process printed this session.
/// Unbounded unless a limit is given, in which case the oldest lines go.
#[derive(Debug, Clone, Default)]
pub struct LogBuffer {
    lines: VecDeque<String>,
    limit: Option<usize>,
}

impl LogBuffer {
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            lines: VecDeque::new(),
            limit,
        }
    }

    pub fn push(&mut self, line: impl Into<String>) {
        self.lines.push_back(line.into());
        if let Some(max) = self.limit {
            while self.lines.len() > max {
                self.lines.pop_front();
            }
        }
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn clear(&mut self) {
        self.lines.clear();
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.lines.iter().cloned().collect()
    }

    /// Get the last N lines.
    pub fn tail(&self, n: usize) -> Vec<String> {
        let start = self.lines.len().saturating_sub(n);
        self.lines.iter().skip(start).cloned().collect()
    }

    /// Lines containing `query`, case-insensitive.
    pub fn search(&self, query: &str) -> Vec<String> {
        let lower = query.to_lowercase();
        self.lines
            .iter()
            .filter(|l| l.to_lowercase().contains(&lower))
            .cloned()
            .collect()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Stream readers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Receives every line read from the child. Implementations must be
/// safe to call from the stdout and stderr readers at the same time.
#[async_trait]
pub trait LineSink: Send + Sync {
    async fn on_line(&self, stream: OutputStream, line: String);
}

/// Strip the line terminator (`\n` or `\r\n`) and decode lossily;
/// `openvpn` output is not guaranteed to be UTF-8.
pub fn decode_line(raw: &[u8]) -> String {
    let mut end = raw.len();
    while end > 0 && (raw[end - 1] == b'\n' || raw[end - 1] == b'\r') {
        end -= 1;
    }
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

/// Drain `reader` until EOF or a read error, handing each line to `sink`.
pub fn spawn_output_reader<R>(
    stream: OutputStream,
    reader: R,
    sink: Arc<dyn LineSink>,
    log_target: String,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::with_capacity(256);
        let mut count = 0u64;
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    count += 1;
                    sink.on_line(stream, decode_line(&buf)).await;
                }
                Err(e) => {
                    log::debug!(target: log_target.as_str(), "{} reader stopped on read error: {}", stream, e);
                    break;
                }
            }
        }
        log::debug!(target: log_target.as_str(), "{} reader finished after {} lines", stream, count);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct Collect {
        lines: Mutex<Vec<(OutputStream, String)>>,
    }

    #[async_trait]
    impl LineSink for Collect {
        async fn on_line(&self, stream: OutputStream, line: String) {
            self.lines.lock().await.push((stream, line));
        }
    }

    #[test]
    fn buffer_unbounded_by_default() {
        let mut b = LogBuffer::new(None);
        for i in 0..500 {
            b.push(format!("line {}", i));
        }
        assert_eq!(b.len(), 500);
        assert_eq!(b.snapshot()[0], "line 0");
    }

    #[test]
    fn buffer_limit_drops_oldest() {
        let mut b = LogBuffer::new(Some(3));
        for i in 0..5 {
            b.push(format!("{}", i));
        }
        assert_eq!(b.snapshot(), vec!["2", "3", "4"]);
    }

    #[test]
    fn buffer_tail_and_search() {
        let mut b = LogBuffer::new(None);
        b.push("TLS: Initial packet");
        b.push("VERIFY OK: depth=1");
        b.push("Peer Connection Initiated");
        assert_eq!(b.tail(2), vec!["VERIFY OK: depth=1", "Peer Connection Initiated"]);
        assert_eq!(b.tail(10).len(), 3);
        assert_eq!(b.search("verify"), vec!["VERIFY OK: depth=1"]);
        b.clear();
        assert!(b.is_empty());
    }

    #[test]
    fn decode_strips_terminators() {
        assert_eq!(decode_line(b"hello\n"), "hello");
        assert_eq!(decode_line(b"hello\r\n"), "hello");
        assert_eq!(decode_line(b"no newline"), "no newline");
        assert_eq!(decode_line(b"\n"), "");
    }

    #[test]
    fn decode_is_lossy() {
        assert_eq!(decode_line(b"bad \xff byte\n"), "bad \u{fffd} byte");
    }

    #[tokio::test]
    async fn reader_forwards_lines_until_eof() {
        let sink = Arc::new(Collect::default());
        let (mut tx, rx) = tokio::io::duplex(64);
        let handle = spawn_output_reader(OutputStream::Stderr, rx, sink.clone(), "test".into());

        tx.write_all(b"first\nsecond\r\nlast-without-newline").await.unwrap();
        drop(tx);
        handle.await.unwrap();

        let lines = sink.lines.lock().await;
        assert_eq!(
            *lines,
            vec![
                (OutputStream::Stderr, "first".to_string()),
                (OutputStream::Stderr, "second".to_string()),
                (OutputStream::Stderr, "last-without-newline".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn two_readers_share_one_sink() {
        let sink = Arc::new(Collect::default());
        let (mut out_tx, out_rx) = tokio::io::duplex(64);
        let (mut err_tx, err_rx) = tokio::io::duplex(64);
        let a = spawn_output_reader(OutputStream::Stdout, out_rx, sink.clone(), "test".into());
        let b = spawn_output_reader(OutputStream::Stderr, err_rx, sink.clone(), "test".into());

        out_tx.write_all(b"o1\no2\n").await.unwrap();
        err_tx.write_all(b"e1\n").await.unwrap();
        drop(out_tx);
        drop(err_tx);
        a.await.unwrap();
        b.await.unwrap();

        let lines = sink.lines.lock().await;
        assert_eq!(lines.len(), 3);
        let stdout: Vec<_> = lines
            .iter()
            .filter(|(s, _)| *s == OutputStream::Stdout)
            .map(|(_, l)| l.as_str())
            .collect();
        assert_eq!(stdout, vec!["o1", "o2"]);
    }
}
