//! Job handlers and the jobtype registry.
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use anyhow::Context;
use futures::future::BoxFuture;
use futures::FutureExt;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::types::job::Job;

type TaskFn =
    dyn Fn(Job) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync;
type BlockingFn = dyn Fn(Job) -> anyhow::Result<()> + Send + Sync;

/// How a job of some jobtype gets executed.
///
/// Whatever the flavour, a handler runs in its own unit: a panic or error
/// in it is reported as that job's failure and affects nothing else.
#[derive(Clone)]
pub struct Handler(Flavour);

#[derive(Clone)]
enum Flavour {
    Task(Arc<TaskFn>),
    Blocking(Arc<BlockingFn>),
    Process(Arc<ProcessSpec>),
}

struct ProcessSpec {
    program: PathBuf,
    args: Vec<String>,
}

impl Handler {
    /// An async handler run as a tokio task; suits I/O-bound work. It is
    /// aborted if still running when the grace period ends.
    pub fn task<F, Fut>(f: F) -> Self
    where
        F: Fn(Job) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self(Flavour::Task(Arc::new(move |job| f(job).boxed())))
    }

    /// A synchronous handler run on the blocking thread pool, for CPU-bound
    /// work. Threads can't be killed: one still running when the grace period
    /// ends is left to finish, and its outcome is discarded.
    pub fn blocking<F>(f: F) -> Self
    where
        F: Fn(Job) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self(Flavour::Blocking(Arc::new(f)))
    }

    /// Runs `program` once per job, with the job's JSON on stdin and
    /// `FAKTORY_JID`/`FAKTORY_JOBTYPE` in its environment. Exit status zero
    /// is success. The process is killed if still running when the grace
    /// period ends.
    pub fn command(program: impl Into<PathBuf>) -> Self {
        Self::command_with_args(program, Vec::<String>::new())
    }

    pub fn command_with_args<I, S>(program: impl Into<PathBuf>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(Flavour::Process(Arc::new(ProcessSpec {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        })))
    }

    /// Starts the job in its own execution unit.
    pub(crate) fn spawn(&self, job: Job) -> JoinHandle<anyhow::Result<()>> {
        match &self.0 {
            Flavour::Task(f) => tokio::spawn(f(job)),
            Flavour::Blocking(f) => {
                let f = f.clone();
                tokio::task::spawn_blocking(move || f(job))
            },
            Flavour::Process(spec) => {
                tokio::spawn(run_process(spec.clone(), job))
            },
        }
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Flavour::Task(_) => f.write_str("Handler::Task"),
            Flavour::Blocking(_) => f.write_str("Handler::Blocking"),
            Flavour::Process(spec) => {
                write!(f, "Handler::Command({})", spec.program.display())
            },
        }
    }
}

/// A command handler's process exited unsuccessfully.
#[derive(Error, Debug)]
#[error("{program} exited with {status}")]
pub struct ProcessFailure {
    pub program: String,
    pub status: String,
    /// What it wrote to stderr, one entry per line.
    pub stderr: Vec<String>,
}

async fn run_process(spec: Arc<ProcessSpec>, job: Job) -> anyhow::Result<()> {
    let payload = job.encode()?;
    let program = spec.program.display().to_string();

    let mut child = Command::new(&spec.program)
        .args(&spec.args)
        .env("FAKTORY_JID", job.jid())
        .env("FAKTORY_JOBTYPE", job.jobtype())
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("spawning {program}"))?;
    debug!(jid = job.jid(), %program, pid = child.id(), "spawned");

    if let Some(mut stdin) = child.stdin.take() {
        // A child that never reads its input isn't an error in itself.
        if let Err(error) = stdin.write_all(payload.as_bytes()).await {
            debug!(%error, "child closed stdin early");
        }
    }

    let output = child
        .wait_with_output()
        .await
        .with_context(|| format!("waiting for {program}"))?;
    if output.status.success() {
        return Ok(());
    }

    Err(ProcessFailure {
        program,
        status: output.status.to_string(),
        stderr: String::from_utf8_lossy(&output.stderr)
            .lines()
            .map(str::to_owned)
            .collect(),
    }
    .into())
}

/// The jobtype to handler mapping. Built up while configuring a consumer and
/// read-only once it runs.
#[derive(Clone, Debug, Default)]
pub(crate) struct Registry {
    handlers: HashMap<String, Handler>,
}

impl Registry {
    /// Registers `handler` for `jobtype`, replacing any earlier one.
    pub fn register(&mut self, jobtype: String, handler: Handler) {
        if self.handlers.contains_key(&jobtype) {
            warn!(%jobtype, "replacing previously registered handler");
        }
        self.handlers.insert(jobtype, handler);
    }

    pub fn get(&self, jobtype: &str) -> Option<&Handler> {
        self.handlers.get(jobtype)
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn jobtypes(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }
}
