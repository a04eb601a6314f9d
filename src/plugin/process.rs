// src/plugin/process.rs

//! Production connector: one child process per run.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::domain::{JobDescriptor, JobOutcome, Pipeline};
use crate::errors::{ConveyorError, Result};
use crate::logging::PLUGIN_STDERR_TARGET;
use crate::plugin::client::RpcClient;
use crate::plugin::handshake::{COOKIE_KEY, COOKIE_VALUE, Endpoint, Handshake};
use crate::plugin::transport::{BoxedReader, BoxedWriter, LineChannel};
use crate::plugin::{BoxFuture, PluginConnector, PluginSession};

#[derive(Debug, Clone)]
pub struct ConnectorOptions {
    /// Deadline for the handshake line and for connecting to the endpoint.
    pub handshake_timeout: Duration,
    /// How long `close` waits for a clean exit before killing the child.
    pub shutdown_grace: Duration,
    /// Working directory for plugin children; inherited when `None`.
    pub workspace_dir: Option<PathBuf>,
}

impl Default for ConnectorOptions {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            shutdown_grace: Duration::from_millis(500),
            workspace_dir: None,
        }
    }
}

/// Launches pipeline binaries as plugin children.
#[derive(Debug, Clone, Default)]
pub struct ProcessConnector {
    options: ConnectorOptions,
}

impl ProcessConnector {
    pub fn new(options: ConnectorOptions) -> Self {
        Self { options }
    }

    async fn launch(&self, pipeline: &Pipeline) -> Result<ProcessSession> {
        info!(
            pipeline = %pipeline.name,
            exec = ?pipeline.exec_path,
            "starting plugin process"
        );

        let mut cmd = Command::new(&pipeline.exec_path);
        cmd.env(COOKIE_KEY, COOKIE_VALUE)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.options.workspace_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| {
            ConveyorError::PluginCrashed(format!(
                "failed to launch {:?}: {e}",
                pipeline.exec_path
            ))
        })?;

        // Always consume stderr so buffers don't fill; log at debug.
        if let Some(stderr) = child.stderr.take() {
            let name = pipeline.name.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(target: PLUGIN_STDERR_TARGET, pipeline = %name, "{}", line);
                }
            });
        }

        let stdin = child.stdin.take();
        let stdout = child.stdout.take().map(BufReader::new);

        let (handshake, stdout) = match self.read_handshake(&pipeline.name, stdout).await {
            Ok(ok) => ok,
            Err(e) => {
                reap(&mut child, &pipeline.name).await;
                return Err(e);
            }
        };
        debug!(pipeline = %pipeline.name, pid = ?child.id(), ?handshake, "plugin handshake complete");

        let limit = self.options.handshake_timeout;
        let connected =
            connect_endpoint(&handshake.endpoint, stdin, stdout, &pipeline.name, limit).await;
        let (reader, writer, stdin) = match connected {
            Ok(parts) => parts,
            Err(e) => {
                reap(&mut child, &pipeline.name).await;
                return Err(e);
            }
        };

        Ok(ProcessSession {
            pipeline: pipeline.name.clone(),
            child,
            client: RpcClient::new(pipeline.name.clone(), LineChannel::new(reader, writer)),
            _stdin: stdin,
            grace: self.options.shutdown_grace,
        })
    }

    async fn read_handshake(
        &self,
        pipeline: &str,
        stdout: Option<BufReader<ChildStdout>>,
    ) -> Result<(Handshake, BufReader<ChildStdout>)> {
        let mut stdout = stdout.ok_or_else(|| {
            ConveyorError::PluginCrashed(format!("plugin '{pipeline}' has no stdout"))
        })?;

        let limit = self.options.handshake_timeout;
        let read = async {
            let mut line = String::new();
            loop {
                line.clear();
                let n = stdout.read_line(&mut line).await?;
                if n == 0 || !line.trim().is_empty() {
                    return Ok::<_, std::io::Error>((n, line));
                }
            }
        };

        let (n, line) = match timeout(limit, read).await {
            Ok(res) => res?,
            Err(_) => {
                warn!(pipeline, ?limit, "plugin handshake timed out");
                return Err(ConveyorError::PluginHandshakeTimeout(limit));
            }
        };
        if n == 0 {
            return Err(ConveyorError::PluginCrashed(format!(
                "plugin '{pipeline}' exited before completing the handshake"
            )));
        }

        let handshake = line.parse::<Handshake>()?;
        Ok((handshake, stdout))
    }
}

impl PluginConnector for ProcessConnector {
    fn connect<'a>(
        &'a self,
        pipeline: &'a Pipeline,
    ) -> BoxFuture<'a, Result<Box<dyn PluginSession>>> {
        Box::pin(async move {
            let session = self.launch(pipeline).await?;
            Ok(Box::new(session) as Box<dyn PluginSession>)
        })
    }
}

/// Open the advertised endpoint and return the framed halves.
///
/// For `stdio` the child's own pipes carry the protocol. For sockets, stdout
/// is drained into the debug log for the rest of the session and stdin is
/// kept open so the plugin never observes EOF on it.
async fn connect_endpoint(
    endpoint: &Endpoint,
    stdin: Option<ChildStdin>,
    stdout: BufReader<ChildStdout>,
    pipeline: &str,
    limit: Duration,
) -> Result<(BoxedReader, BoxedWriter, Option<ChildStdin>)> {
    match endpoint {
        Endpoint::Stdio => {
            let stdin = stdin.ok_or_else(|| {
                ConveyorError::PluginCrashed(format!("plugin '{pipeline}' has no stdin"))
            })?;
            Ok((Box::new(stdout), Box::new(stdin), None))
        }
        Endpoint::Tcp(addr) => {
            let stream = timeout(limit, tokio::net::TcpStream::connect(addr.as_str()))
                .await
                .map_err(|_| ConveyorError::PluginHandshakeTimeout(limit))?
                .map_err(|e| {
                    ConveyorError::PluginCrashed(format!("connecting to plugin at {addr}: {e}"))
                })?;
            drain_stdout(stdout, pipeline.to_string());
            let (r, w) = stream.into_split();
            Ok((Box::new(BufReader::new(r)), Box::new(w), stdin))
        }
        #[cfg(unix)]
        Endpoint::Unix(path) => {
            let stream = timeout(limit, tokio::net::UnixStream::connect(path))
                .await
                .map_err(|_| ConveyorError::PluginHandshakeTimeout(limit))?
                .map_err(|e| {
                    ConveyorError::PluginCrashed(format!("connecting to plugin at {path:?}: {e}"))
                })?;
            drain_stdout(stdout, pipeline.to_string());
            let (r, w) = stream.into_split();
            Ok((Box::new(BufReader::new(r)), Box::new(w), stdin))
        }
        #[cfg(not(unix))]
        Endpoint::Unix(_) => Err(ConveyorError::PluginVersionUnsupported(
            "unix sockets are not available on this platform".to_string(),
        )),
    }
}

fn drain_stdout(stdout: BufReader<ChildStdout>, pipeline: String) {
    tokio::spawn(async move {
        let mut lines = stdout.lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(pipeline = %pipeline, "plugin stdout: {}", line);
        }
    });
}

/// Kill the child and wait for it so no zombie is left behind.
async fn reap(child: &mut Child, pipeline: &str) {
    if let Err(e) = child.kill().await {
        warn!(pipeline, error = %e, "failed to kill plugin process");
    }
}

/// A running plugin child plus its RPC client.
#[derive(Debug)]
pub struct ProcessSession {
    pipeline: String,
    child: Child,
    client: RpcClient,
    _stdin: Option<ChildStdin>,
    grace: Duration,
}

impl PluginSession for ProcessSession {
    fn get_jobs(&mut self) -> BoxFuture<'_, Result<Vec<JobDescriptor>>> {
        Box::pin(self.client.get_jobs())
    }

    fn execute<'a>(
        &'a mut self,
        job: &'a str,
        logs: &'a mut (dyn FnMut(&str) + Send),
    ) -> BoxFuture<'a, Result<JobOutcome>> {
        Box::pin(self.client.execute(job, logs))
    }

    fn close(self: Box<Self>) -> BoxFuture<'static, Result<()>> {
        let mut this = *self;
        Box::pin(async move {
            this.client.shutdown().await;

            match timeout(this.grace, this.child.wait()).await {
                Ok(Ok(status)) => {
                    debug!(pipeline = %this.pipeline, ?status, "plugin exited");
                }
                Ok(Err(e)) => {
                    warn!(pipeline = %this.pipeline, error = %e, "waiting for plugin failed");
                    reap(&mut this.child, &this.pipeline).await;
                }
                Err(_) => {
                    debug!(
                        pipeline = %this.pipeline,
                        grace = ?this.grace,
                        "plugin still running after grace period; killing"
                    );
                    reap(&mut this.child, &this.pipeline).await;
                }
            }
            Ok(())
        })
    }
}
