// src/plugin/client.rs

//! Request/response semantics on top of a [`LineChannel`].

use tracing::{debug, warn};

use crate::domain::{JobDescriptor, JobOutcome};
use crate::errors::{ConveyorError, Result};
use crate::plugin::protocol::{Method, Response};
use crate::plugin::transport::LineChannel;

/// Transport-agnostic plugin client. One call in flight at a time.
#[derive(Debug)]
pub struct RpcClient {
    pipeline: String,
    channel: LineChannel,
}

impl RpcClient {
    pub fn new(pipeline: impl Into<String>, channel: LineChannel) -> Self {
        Self {
            pipeline: pipeline.into(),
            channel,
        }
    }

    pub async fn get_jobs(&mut self) -> Result<Vec<JobDescriptor>> {
        let id = self.channel.send(Method::GetJobs, None).await?;

        loop {
            let response = self.expect_frame(id, "get_jobs").await?;

            if let Some(jobs) = response.jobs {
                debug!(pipeline = %self.pipeline, jobs = jobs.len(), "plugin declared jobs");
                return Ok(jobs);
            }
            if let Some(error) = response.error {
                return Err(ConveyorError::PluginProtocolError(format!(
                    "get_jobs failed: {error}"
                )));
            }
            if let Some(line) = response.log {
                debug!(pipeline = %self.pipeline, "plugin: {}", line);
                continue;
            }
            return Err(ConveyorError::PluginProtocolError(
                "get_jobs answered without a job list".to_string(),
            ));
        }
    }

    /// Execute `job`, passing every log frame to `logs` before the result.
    pub async fn execute(
        &mut self,
        job: &str,
        logs: &mut (dyn FnMut(&str) + Send),
    ) -> Result<JobOutcome> {
        let id = self.channel.send(Method::Execute, Some(job)).await?;

        loop {
            let response = self.expect_frame(id, "execute").await?;

            if let Some(line) = response.log {
                logs(&line);
                continue;
            }
            if let Some(result) = response.result {
                return Ok(result.into());
            }
            if let Some(error) = response.error {
                return Ok(JobOutcome::Failure(error));
            }
            return Err(ConveyorError::PluginProtocolError(format!(
                "unexpected frame while executing job '{job}'"
            )));
        }
    }

    /// Best-effort shutdown request; the plugin may already be gone.
    pub async fn shutdown(&mut self) {
        if let Err(e) = self.channel.send(Method::Shutdown, None).await {
            debug!(pipeline = %self.pipeline, error = %e, "shutdown request not delivered");
        }
    }

    async fn expect_frame(&mut self, id: u64, call: &str) -> Result<Response> {
        let response = self.channel.recv().await?.ok_or_else(|| {
            ConveyorError::PluginCrashed(format!(
                "plugin for '{}' closed the connection during {call}",
                self.pipeline
            ))
        })?;

        if response.id != id {
            warn!(
                pipeline = %self.pipeline,
                expected = id,
                got = response.id,
                "response id mismatch"
            );
            return Err(ConveyorError::PluginProtocolError(format!(
                "expected response to request {id}, got {}",
                response.id
            )));
        }
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, duplex, split};

    use super::*;

    /// Client wired to an in-memory plugin that answers each request line
    /// with the canned frames produced by `reply`.
    fn client_with_plugin<F>(reply: F) -> RpcClient
    where
        F: Fn(&str) -> Vec<String> + Send + 'static,
    {
        let (host, plugin) = duplex(8192);
        let (host_r, host_w) = split(host);
        let channel = LineChannel::new(Box::new(BufReader::new(host_r)), Box::new(host_w));

        tokio::spawn(async move {
            let (plugin_r, mut plugin_w) = split(plugin);
            let mut lines = BufReader::new(plugin_r).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                for frame in reply(&line) {
                    if plugin_w.write_all(frame.as_bytes()).await.is_err() {
                        return;
                    }
                    let _ = plugin_w.write_all(b"\n").await;
                }
                if reply(&line).is_empty() {
                    return;
                }
            }
        });

        RpcClient::new("demo", channel)
    }

    #[tokio::test]
    async fn streams_logs_then_result() {
        let mut client = client_with_plugin(|line| {
            if line.contains("get_jobs") {
                vec![r#"{"id":1,"jobs":[{"name":"build"}]}"#.into()]
            } else {
                vec![
                    r#"{"id":2,"log":"step 1"}"#.into(),
                    r#"{"id":2,"log":"step 2"}"#.into(),
                    r#"{"id":2,"result":{"status":"success"}}"#.into(),
                ]
            }
        });

        let jobs = client.get_jobs().await.unwrap();
        assert_eq!(jobs, vec![JobDescriptor::new("build")]);

        let mut seen = Vec::new();
        let outcome = client
            .execute("build", &mut |l: &str| seen.push(l.to_string()))
            .await
            .unwrap();
        assert_eq!(outcome, JobOutcome::Success);
        assert_eq!(seen, vec!["step 1", "step 2"]);
    }

    #[tokio::test]
    async fn mismatched_id_is_a_protocol_error() {
        let mut client = client_with_plugin(|_| vec![r#"{"id":99,"jobs":[]}"#.into()]);
        let err = client.get_jobs().await.unwrap_err();
        assert!(matches!(err, ConveyorError::PluginProtocolError(_)));
    }

    #[tokio::test]
    async fn closed_stream_mid_execute_is_a_crash() {
        let mut client = client_with_plugin(|line| {
            if line.contains("execute") {
                Vec::new()
            } else {
                vec![r#"{"id":1,"jobs":[{"name":"build"}]}"#.into()]
            }
        });

        client.get_jobs().await.unwrap();
        let err = client.execute("build", &mut |_: &str| {}).await.unwrap_err();
        assert!(matches!(err, ConveyorError::PluginCrashed(_)));
    }

    #[tokio::test]
    async fn error_frame_fails_the_job() {
        let mut client =
            client_with_plugin(|_| vec![r#"{"id":1,"error":"no such job 'x'"}"#.into()]);
        let outcome = client.execute("x", &mut |_: &str| {}).await.unwrap();
        assert_eq!(outcome, JobOutcome::Failure("no such job 'x'".into()));
    }
}
