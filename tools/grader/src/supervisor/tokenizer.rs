//! Turns raw process output into discrete lines.
//!
//! `\n` and `\r` end a line at once. A burst that ends mid-line arms a
//! deadline; more data re-arms it, and if it expires first the partial buffer
//! is emitted as a line. End of stream flushes whatever is left. Error streams
//! skip the deadline and emit each burst's partial line straight away.

use crate::logging::append_run_log;
use crate::runtime::ProcessEvent;
use crate::types::Side;
use serde_json::json;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::Instant;

pub const ERROR_PREFIX: &str = "[ERR] ";

const READ_CHUNK: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone)]
pub struct LineTokenizer {
    side: Side,
    kind: StreamKind,
    debounce: Duration,
    events: UnboundedSender<ProcessEvent>,
}

impl LineTokenizer {
    pub fn new(
        side: Side,
        kind: StreamKind,
        debounce: Duration,
        events: UnboundedSender<ProcessEvent>,
    ) -> Self {
        Self {
            side,
            kind,
            debounce,
            events,
        }
    }

    /// Reads until end of stream or a read error.
    pub async fn run<R>(self, mut reader: R)
    where
        R: AsyncRead + Unpin,
    {
        let mut chunk = [0u8; READ_CHUNK];
        let mut pending = Vec::new();
        let mut deadline: Option<Instant> = None;

        loop {
            let wake = deadline.unwrap_or_else(Instant::now);
            tokio::select! {
                read = reader.read(&mut chunk) => {
                    let count = match read {
                        Ok(0) => break,
                        Ok(count) => count,
                        Err(error) => {
                            append_run_log(
                                "warn",
                                "process.output.read_failed",
                                json!({ "side": self.side.as_str(), "error": error.to_string() }),
                            );
                            break;
                        }
                    };
                    for byte in &chunk[..count] {
                        if matches!(byte, b'\n' | b'\r') {
                            self.flush(&mut pending);
                        } else {
                            pending.push(*byte);
                        }
                    }
                    deadline = None;
                    if !pending.is_empty() {
                        match self.kind {
                            StreamKind::Stderr => self.flush(&mut pending),
                            StreamKind::Stdout => deadline = Some(Instant::now() + self.debounce),
                        }
                    }
                }
                _ = tokio::time::sleep_until(wake), if deadline.is_some() => {
                    deadline = None;
                    self.flush(&mut pending);
                }
            }
        }

        self.flush(&mut pending);
    }

    fn flush(&self, pending: &mut Vec<u8>) {
        if pending.is_empty() {
            return;
        }
        let body = String::from_utf8_lossy(pending).into_owned();
        pending.clear();
        let text = match self.kind {
            StreamKind::Stdout => body,
            StreamKind::Stderr => format!("{ERROR_PREFIX}{body}"),
        };
        append_run_log(
            "debug",
            "process.output.line",
            json!({ "side": self.side.as_str(), "line": text }),
        );
        let _ = self.events.send(ProcessEvent::Line {
            side: self.side,
            text,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::sync::mpsc;

    fn lines(rx: &mut mpsc::UnboundedReceiver<ProcessEvent>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event.console_text());
        }
        out
    }

    fn spawn_tokenizer(
        kind: StreamKind,
    ) -> (
        tokio::io::DuplexStream,
        mpsc::UnboundedReceiver<ProcessEvent>,
        tokio::task::JoinHandle<()>,
    ) {
        let (writer, reader) = tokio::io::duplex(256);
        let (tx, rx) = mpsc::unbounded_channel();
        let tokenizer = LineTokenizer::new(Side::Client, kind, Duration::from_millis(100), tx);
        let handle = tokio::spawn(tokenizer.run(reader));
        (writer, rx, handle)
    }

    #[tokio::test(start_paused = true)]
    async fn terminators_split_lines_and_skip_blanks() {
        let (mut writer, mut rx, handle) = spawn_tokenizer(StreamKind::Stdout);
        writer.write_all(b"one\r\ntwo\n\nthree\n").await.expect("write");
        drop(writer);
        handle.await.expect("join");
        assert_eq!(lines(&mut rx), vec!["one", "two", "three"]);
    }

    #[tokio::test(start_paused = true)]
    async fn quiet_partial_line_flushes_once_after_debounce() {
        let (mut writer, mut rx, handle) = spawn_tokenizer(StreamKind::Stdout);
        writer.write_all(b"partial").await.expect("write");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(lines(&mut rx).is_empty());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(lines(&mut rx), vec!["partial"]);

        drop(writer);
        handle.await.expect("join");
        assert!(lines(&mut rx).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn terminator_within_debounce_window_is_not_duplicated() {
        let (mut writer, mut rx, handle) = spawn_tokenizer(StreamKind::Stdout);
        writer.write_all(b"partial").await.expect("write");
        tokio::time::sleep(Duration::from_millis(60)).await;
        writer.write_all(b"\n").await.expect("write");
        tokio::time::sleep(Duration::from_millis(300)).await;
        drop(writer);
        handle.await.expect("join");
        assert_eq!(lines(&mut rx), vec!["partial"]);
    }

    #[tokio::test(start_paused = true)]
    async fn new_data_reschedules_the_deadline() {
        let (mut writer, mut rx, handle) = spawn_tokenizer(StreamKind::Stdout);
        writer.write_all(b"Enter ").await.expect("write");
        tokio::time::sleep(Duration::from_millis(80)).await;
        writer.write_all(b"name: ").await.expect("write");
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(lines(&mut rx).is_empty());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(lines(&mut rx), vec!["Enter name: "]);
        drop(writer);
        handle.await.expect("join");
    }

    #[tokio::test(start_paused = true)]
    async fn end_of_stream_flushes_the_remainder() {
        let (mut writer, mut rx, handle) = spawn_tokenizer(StreamKind::Stdout);
        writer.write_all(b"bye").await.expect("write");
        drop(writer);
        handle.await.expect("join");
        assert_eq!(lines(&mut rx), vec!["bye"]);
    }

    #[tokio::test(start_paused = true)]
    async fn error_stream_is_tagged_and_not_debounced() {
        let (mut writer, mut rx, handle) = spawn_tokenizer(StreamKind::Stderr);
        writer.write_all(b"boom\nhalf").await.expect("write");
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(lines(&mut rx), vec!["[ERR] boom", "[ERR] half"]);
        drop(writer);
        handle.await.expect("join");
    }
}
