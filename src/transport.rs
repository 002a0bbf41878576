//! Newline-delimited JSON on stdin/stdout (spec §4.1).
//!
//! The transport never interprets the body: it only knows how to decode one
//! `Message` per line of input, and how to emit one `Message` per line of
//! output, atomically with respect to other emissions.

use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::io::Stdin;
use tokio::io::Stdout;
use tokio::sync::Mutex;

use crate::message::Message;

/// Reads newline-delimited JSON messages from stdin, and writes them
/// line-atomically to stdout.
pub struct Transport {
    reader: Mutex<BufReader<Stdin>>,
    writer: Mutex<Stdout>,
}

impl Transport {
    pub fn new() -> Self {
        Self {
            reader: Mutex::new(BufReader::new(tokio::io::stdin())),
            writer: Mutex::new(tokio::io::stdout()),
        }
    }

    /// Read and decode the next line of input.
    ///
    /// Returns `Ok(None)` when stdin has closed (clean EOF). A malformed
    /// line is a fatal error for the process per spec §4.1.
    #[tracing::instrument(level = "trace", skip(self))]
    pub async fn recv(&self) -> anyhow::Result<Option<Message>> {
        let mut reader = self.reader.lock().await;
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            return Ok(None);
        }
        let trimmed = line.trim_end();
        if trimmed.is_empty() {
            return self.recv_boxed().await;
        }
        let msg: Message = serde_json::from_str(trimmed)
            .map_err(|err| anyhow::anyhow!("malformed json on stdin: {} (line: {:?})", err, trimmed))?;
        tracing::trace!(src = %msg.src, dest = %msg.dest, kind = %msg.kind(), "recv");
        Ok(Some(msg))
    }

    // `recv` can't recurse directly since it's async and borrows `self.reader`
    // across the recursive call; box the continuation instead (blank input
    // lines are otherwise indistinguishable from EOF).
    fn recv_boxed<'a>(&'a self) -> std::pin::Pin<Box<dyn std::future::Future<Output = anyhow::Result<Option<Message>>> + 'a>> {
        Box::pin(self.recv())
    }

    /// Serialize and emit `msg` as a single, newline-terminated line.
    #[tracing::instrument(level = "trace", skip(self, msg), fields(dest = %msg.dest, kind = %msg.kind()))]
    pub async fn send(&self, msg: &Message) -> anyhow::Result<()> {
        let mut line = serde_json::to_string(msg)?;
        line.push('\n');
        let mut writer = self.writer.lock().await;
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }
}

impl Default for Transport {
    fn default() -> Self {
        Self::new()
    }
}
