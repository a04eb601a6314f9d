// src/plugin/mod.rs

//! Talking to pipeline binaries.
//!
//! The worker pool never touches processes or sockets directly; it goes
//! through two traits:
//!
//! - [`PluginConnector`] launches (or otherwise reaches) the plugin for a
//!   pipeline and returns a connected session.
//! - [`PluginSession`] is one connected client: `get_jobs`, `execute` one job
//!   at a time, then `close`.
//!
//! Production code uses [`ProcessConnector`], which spawns the binary, reads
//! the handshake line and speaks JSON lines over stdio, TCP or a Unix
//! socket. Tests plug in scripted fakes.

use std::future::Future;
use std::pin::Pin;

use crate::domain::{JobDescriptor, JobOutcome, Pipeline};
use crate::errors::Result;

pub mod client;
pub mod handshake;
pub mod process;
pub mod protocol;
pub mod transport;

pub use client::RpcClient;
pub use handshake::{Endpoint, Handshake};
pub use process::{ConnectorOptions, ProcessConnector, ProcessSession};
pub use transport::LineChannel;

/// Boxed, sendable future used at the plugin trait seams.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Launches plugins for pipelines.
pub trait PluginConnector: Send + Sync {
    /// Start the plugin for `pipeline` and complete the handshake.
    ///
    /// Errors here mean the run never started: handshake timeout, version
    /// mismatch, a binary that could not be launched, or a failed connect.
    fn connect<'a>(&'a self, pipeline: &'a Pipeline)
    -> BoxFuture<'a, Result<Box<dyn PluginSession>>>;
}

/// A connected plugin client. Exactly one request is in flight at a time.
pub trait PluginSession: Send {
    /// Ask the plugin which jobs it declares for this run.
    fn get_jobs(&mut self) -> BoxFuture<'_, Result<Vec<JobDescriptor>>>;

    /// Execute one job, forwarding each log line to `logs` as it arrives.
    ///
    /// `Ok` carries the job's own result; `Err` is a transport or protocol
    /// failure (the plugin went away, or answered nonsense).
    fn execute<'a>(
        &'a mut self,
        job: &'a str,
        logs: &'a mut (dyn FnMut(&str) + Send),
    ) -> BoxFuture<'a, Result<JobOutcome>>;

    /// Ask the plugin to shut down and make sure the child is gone.
    fn close(self: Box<Self>) -> BoxFuture<'static, Result<()>>;
}
