// src/plugin/transport.rs

//! Newline-delimited JSON framing over any async byte stream.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::errors::{ConveyorError, Result};
use crate::plugin::protocol::{Method, Request, Response};

pub type BoxedReader = Box<dyn AsyncBufRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// One request/response channel to a plugin.
///
/// Assigns increasing request ids. Blank lines from the plugin are ignored;
/// a line that is not a valid response frame is a protocol error.
pub struct LineChannel {
    reader: BoxedReader,
    writer: BoxedWriter,
    next_id: u64,
}

impl LineChannel {
    pub fn new(reader: BoxedReader, writer: BoxedWriter) -> Self {
        Self {
            reader,
            writer,
            next_id: 1,
        }
    }

    /// Write one request frame and return its id.
    pub async fn send(&mut self, method: Method, job: Option<&str>) -> Result<u64> {
        let id = self.next_id;
        self.next_id += 1;

        let request = Request {
            id,
            method,
            job: job.map(str::to_string),
        };
        let mut frame = serde_json::to_string(&request)?;
        trace!(%frame, "-> plugin");
        frame.push('\n');

        let write = async {
            self.writer.write_all(frame.as_bytes()).await?;
            self.writer.flush().await
        };
        write.await.map_err(|e| {
            ConveyorError::PluginCrashed(format!("failed to send {method:?} request: {e}"))
        })?;

        Ok(id)
    }

    /// Read the next response frame; `None` once the plugin closed the stream.
    pub async fn recv(&mut self) -> Result<Option<Response>> {
        let mut line = String::new();
        loop {
            line.clear();
            let n = self
                .reader
                .read_line(&mut line)
                .await
                .map_err(|e| ConveyorError::PluginCrashed(format!("reading from plugin: {e}")))?;
            if n == 0 {
                return Ok(None);
            }

            let frame = line.trim();
            if frame.is_empty() {
                continue;
            }
            trace!(%frame, "<- plugin");

            return serde_json::from_str(frame).map(Some).map_err(|e| {
                ConveyorError::PluginProtocolError(format!("malformed frame {frame:?}: {e}"))
            });
        }
    }
}

impl std::fmt::Debug for LineChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LineChannel")
            .field("next_id", &self.next_id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{BufReader, duplex, split};

    use super::*;

    #[tokio::test]
    async fn frames_requests_and_responses() {
        let (host, plugin) = duplex(4096);
        let (host_r, host_w) = split(host);
        let mut channel = LineChannel::new(Box::new(BufReader::new(host_r)), Box::new(host_w));

        let (plugin_r, mut plugin_w) = split(plugin);
        let mut plugin_lines = BufReader::new(plugin_r).lines();

        let id = channel.send(Method::Execute, Some("build")).await.unwrap();
        assert_eq!(id, 1);
        let seen = plugin_lines.next_line().await.unwrap().unwrap();
        assert_eq!(seen, r#"{"id":1,"method":"execute","job":"build"}"#);

        plugin_w
            .write_all(b"\n{\"id\":1,\"log\":\"compiling\"}\nnot json\n")
            .await
            .unwrap();

        let log = channel.recv().await.unwrap().unwrap();
        assert_eq!(log.log.as_deref(), Some("compiling"));

        let err = channel.recv().await.unwrap_err();
        assert!(matches!(err, ConveyorError::PluginProtocolError(_)));

        drop(plugin_w);
        drop(plugin_lines);
        assert!(channel.recv().await.unwrap().is_none());
    }
}
