use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use conveyor::domain::{JobDescriptor, JobOutcome, Pipeline};
use conveyor::errors::{ConveyorError, Result};
use conveyor::plugin::{BoxFuture, PluginConnector, PluginSession};
use tokio::sync::Semaphore;

/// A latch tests open to let gated jobs finish.
#[derive(Clone)]
pub struct Gate(Arc<Semaphore>);

impl Gate {
    pub fn new() -> Self {
        Self(Arc::new(Semaphore::new(0)))
    }

    /// Let `n` waiting (or future) jobs through.
    pub fn open(&self, n: usize) {
        self.0.add_permits(n);
    }

    async fn pass(&self) {
        if let Ok(permit) = self.0.acquire().await {
            permit.forget();
        }
    }
}

impl Default for Gate {
    fn default() -> Self {
        Self::new()
    }
}

/// What a fake job does when executed.
#[derive(Clone)]
pub enum JobBehaviour {
    Succeed,
    Fail(String),
    /// The plugin "goes away" mid-job.
    Crash(String),
    /// Never answers.
    Hang,
    Panic(String),
    /// Succeeds once the gate lets it through.
    WaitFor(Gate),
    Sleep(Duration),
}

/// How `connect` behaves for a pipeline.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectBehaviour {
    #[default]
    Ok,
    HandshakeTimeout,
    VersionUnsupported,
    Crash,
}

/// Scripted plugin for one pipeline name.
#[derive(Clone)]
pub struct PluginScript {
    jobs: Vec<JobDescriptor>,
    behaviours: HashMap<String, JobBehaviour>,
    logs: HashMap<String, Vec<String>>,
    connect: ConnectBehaviour,
    get_jobs_error: Option<String>,
}

impl PluginScript {
    pub fn new(jobs: Vec<JobDescriptor>) -> Self {
        Self {
            jobs,
            behaviours: HashMap::new(),
            logs: HashMap::new(),
            connect: ConnectBehaviour::Ok,
            get_jobs_error: None,
        }
    }

    pub fn job(mut self, name: &str, behaviour: JobBehaviour) -> Self {
        self.behaviours.insert(name.to_string(), behaviour);
        self
    }

    pub fn logs(mut self, name: &str, lines: &[&str]) -> Self {
        self.logs
            .insert(name.to_string(), lines.iter().map(|l| l.to_string()).collect());
        self
    }

    pub fn connect(mut self, behaviour: ConnectBehaviour) -> Self {
        self.connect = behaviour;
        self
    }

    pub fn get_jobs_error(mut self, message: &str) -> Self {
        self.get_jobs_error = Some(message.to_string());
        self
    }
}

/// Counters shared by the connector and all of its sessions.
#[derive(Default)]
pub struct FakeStats {
    executed: Mutex<Vec<String>>,
    connects: AtomicUsize,
    open_sessions: AtomicUsize,
    max_open_sessions: AtomicUsize,
    closed: AtomicUsize,
}

impl FakeStats {
    /// Executed jobs as `pipeline/job`, in start order.
    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }

    /// Executed jobs of one pipeline, in start order.
    pub fn executed_jobs(&self, pipeline: &str) -> Vec<String> {
        let prefix = format!("{pipeline}/");
        self.executed()
            .into_iter()
            .filter_map(|e| e.strip_prefix(&prefix).map(str::to_string))
            .collect()
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn open_sessions(&self) -> usize {
        self.open_sessions.load(Ordering::SeqCst)
    }

    pub fn max_open_sessions(&self) -> usize {
        self.max_open_sessions.load(Ordering::SeqCst)
    }

    /// Sessions closed through `PluginSession::close`.
    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Counts a session as open until dropped, including on panic unwind.
struct OpenGuard(Arc<FakeStats>);

impl OpenGuard {
    fn new(stats: Arc<FakeStats>) -> Self {
        let now = stats.open_sessions.fetch_add(1, Ordering::SeqCst) + 1;
        stats.max_open_sessions.fetch_max(now, Ordering::SeqCst);
        Self(stats)
    }
}

impl Drop for OpenGuard {
    fn drop(&mut self) {
        self.0.open_sessions.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A `PluginConnector` that never launches anything.
///
/// Pipelines without their own script get the default one.
pub struct FakeConnector {
    scripts: Mutex<HashMap<String, PluginScript>>,
    default: PluginScript,
    stats: Arc<FakeStats>,
}

impl FakeConnector {
    pub fn new(default: PluginScript) -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            default,
            stats: Arc::new(FakeStats::default()),
        }
    }

    pub fn with_script(self, pipeline: &str, script: PluginScript) -> Self {
        self.set_script(pipeline, script);
        self
    }

    pub fn set_script(&self, pipeline: &str, script: PluginScript) {
        self.scripts
            .lock()
            .unwrap()
            .insert(pipeline.to_string(), script);
    }

    pub fn stats(&self) -> Arc<FakeStats> {
        self.stats.clone()
    }

    fn script_for(&self, pipeline: &str) -> PluginScript {
        self.scripts
            .lock()
            .unwrap()
            .get(pipeline)
            .cloned()
            .unwrap_or_else(|| self.default.clone())
    }
}

impl PluginConnector for FakeConnector {
    fn connect<'a>(
        &'a self,
        pipeline: &'a Pipeline,
    ) -> BoxFuture<'a, Result<Box<dyn PluginSession>>> {
        Box::pin(async move {
            self.stats.connects.fetch_add(1, Ordering::SeqCst);
            let script = self.script_for(&pipeline.name);

            match script.connect {
                ConnectBehaviour::Ok => {}
                ConnectBehaviour::HandshakeTimeout => {
                    return Err(ConveyorError::PluginHandshakeTimeout(Duration::from_millis(
                        50,
                    )));
                }
                ConnectBehaviour::VersionUnsupported => {
                    return Err(ConveyorError::PluginVersionUnsupported(
                        "protocol version 99".to_string(),
                    ));
                }
                ConnectBehaviour::Crash => {
                    return Err(ConveyorError::PluginCrashed(
                        "exited before handshake".to_string(),
                    ));
                }
            }

            let session = FakeSession {
                pipeline: pipeline.name.clone(),
                script,
                stats: self.stats.clone(),
                _open: OpenGuard::new(self.stats.clone()),
            };
            Ok(Box::new(session) as Box<dyn PluginSession>)
        })
    }
}

struct FakeSession {
    pipeline: String,
    script: PluginScript,
    stats: Arc<FakeStats>,
    _open: OpenGuard,
}

impl PluginSession for FakeSession {
    fn get_jobs(&mut self) -> BoxFuture<'_, Result<Vec<JobDescriptor>>> {
        Box::pin(async move {
            if let Some(message) = &self.script.get_jobs_error {
                return Err(ConveyorError::PluginProtocolError(message.clone()));
            }
            Ok(self.script.jobs.clone())
        })
    }

    fn execute<'a>(
        &'a mut self,
        job: &'a str,
        logs: &'a mut (dyn FnMut(&str) + Send),
    ) -> BoxFuture<'a, Result<JobOutcome>> {
        Box::pin(async move {
            self.stats
                .executed
                .lock()
                .unwrap()
                .push(format!("{}/{job}", self.pipeline));

            if let Some(lines) = self.script.logs.get(job) {
                for line in lines {
                    logs(line);
                }
            }

            let behaviour = self
                .script
                .behaviours
                .get(job)
                .cloned()
                .unwrap_or(JobBehaviour::Succeed);
            match behaviour {
                JobBehaviour::Succeed => Ok(JobOutcome::Success),
                JobBehaviour::Fail(message) => Ok(JobOutcome::Failure(message)),
                JobBehaviour::Crash(message) => Err(ConveyorError::PluginCrashed(message)),
                JobBehaviour::Hang => std::future::pending::<Result<JobOutcome>>().await,
                JobBehaviour::Panic(message) => panic!("{message}"),
                JobBehaviour::WaitFor(gate) => {
                    gate.pass().await;
                    Ok(JobOutcome::Success)
                }
                JobBehaviour::Sleep(duration) => {
                    tokio::time::sleep(duration).await;
                    Ok(JobOutcome::Success)
                }
            }
        })
    }

    fn close(self: Box<Self>) -> BoxFuture<'static, Result<()>> {
        Box::pin(async move {
            self.stats.closed.fetch_add(1, Ordering::SeqCst);
            drop(self);
            Ok(())
        })
    }
}
