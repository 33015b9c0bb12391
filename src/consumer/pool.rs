//! Bounded concurrent execution of fetched jobs, and reporting their
//! outcome.
use std::any::Any;
use std::backtrace::BacktraceStatus;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;
use tracing::{debug, error, instrument, warn};

use super::handler::{Handler, ProcessFailure, Registry};
use crate::client::Client;
use crate::error::HandlerError;
use crate::types::job::Job;
use crate::types::protocol::FailReport;

/// Called with every failure just before it is reported to the server, e.g.
/// to forward it to an error tracker. It runs on the blocking pool; if it
/// errors, panics or takes longer than [`HOOK_TIMEOUT`] the failure is
/// reported anyway.
pub type FailureHook =
    Arc<dyn Fn(&Job, &JobFault) -> anyhow::Result<()> + Send + Sync>;

pub const HOOK_TIMEOUT: Duration = Duration::from_secs(5);

/// Why a job failed, in the shape `FAIL` reports it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct JobFault {
    pub kind: String,
    pub message: String,
    pub backtrace: Vec<String>,
}

impl JobFault {
    /// Keeps at most `limit` backtrace lines.
    pub(crate) fn from_error(err: &anyhow::Error, limit: usize) -> Self {
        let handler_error = err.downcast_ref::<HandlerError>();
        let (kind, message, backtrace) = if let Some(e) = handler_error {
            (e.kind.clone(), e.message.clone(), trace_of(err))
        } else if let Some(e) = err.downcast_ref::<ProcessFailure>() {
            ("CommandFailed".to_owned(), e.to_string(), e.stderr.clone())
        } else {
            ("Error".to_owned(), err.to_string(), trace_of(err))
        };

        Self {
            kind,
            message,
            backtrace: backtrace.into_iter().take(limit).collect(),
        }
    }

    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_owned()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "handler panicked".to_owned()
        };

        Self {
            kind: "Panic".to_owned(),
            message,
            backtrace: vec![],
        }
    }

    pub(crate) fn unknown_jobtype(jobtype: &str) -> Self {
        Self {
            kind: "UnknownJobType".to_owned(),
            message: format!("no handler registered for jobtype {jobtype:?}"),
            backtrace: vec![],
        }
    }

    fn into_report(self, jid: String) -> FailReport {
        FailReport {
            jid,
            errtype: self.kind,
            message: self.message,
            backtrace: self.backtrace,
        }
    }
}

/// The captured backtrace if there is one, otherwise the chain of causes.
fn trace_of(err: &anyhow::Error) -> Vec<String> {
    let bt = err.backtrace();
    if bt.status() == BacktraceStatus::Captured {
        bt.to_string().lines().map(str::to_owned).collect()
    } else {
        err.chain().skip(1).map(ToString::to_string).collect()
    }
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Outcome {
    Success,
    Failure(JobFault),
    /// The unit was cancelled: nothing is reported and the server will hand
    /// the job out again once its reservation lapses.
    Abandoned,
}

/// Aborts the execution unit if its supervisor is dropped, e.g. when the
/// pool is shut down before the job finishes.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

pub(crate) struct WorkerPool {
    client: Client,
    registry: Arc<Registry>,
    slots: Arc<Semaphore>,
    capacity: usize,
    running: JoinSet<()>,
    hook: Option<FailureHook>,
}

impl WorkerPool {
    pub fn new(
        client: Client,
        registry: Arc<Registry>,
        concurrency: usize,
        hook: Option<FailureHook>,
    ) -> Self {
        Self {
            client,
            registry,
            slots: Arc::new(Semaphore::new(concurrency)),
            capacity: concurrency,
            running: JoinSet::new(),
            hook,
        }
    }

    /// Waits for a free slot. The permit travels with the job and frees the
    /// slot once its outcome has been reported.
    pub async fn reserve(&self) -> Option<OwnedSemaphorePermit> {
        self.slots.clone().acquire_owned().await.ok()
    }

    pub fn dispatch(&mut self, job: Job, permit: OwnedSemaphorePermit) {
        let handler = self.registry.get(job.jobtype()).cloned();
        self.running.spawn(supervise(
            self.client.clone(),
            handler,
            job,
            self.hook.clone(),
            permit,
        ));
    }

    /// Collects finished supervisors without waiting.
    pub fn reap(&mut self) {
        while let Some(result) = self.running.try_join_next() {
            log_supervisor(result);
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn in_flight(&self) -> usize {
        self.running.len()
    }

    /// Waits for every in-flight job to finish and be reported.
    pub async fn drain(&mut self) {
        while let Some(result) = self.running.join_next().await {
            log_supervisor(result);
        }
    }

    /// Forcibly stops every in-flight job. None of them is reported.
    pub async fn abort_all(&mut self) {
        let abandoned = self.running.len();
        self.running.abort_all();
        while self.running.join_next().await.is_some() {}
        if abandoned > 0 {
            warn!(
                abandoned,
                "stopped in-flight jobs, the server will redeliver them"
            );
        }
    }
}

fn log_supervisor(result: Result<(), tokio::task::JoinError>) {
    if let Err(error) = result {
        if error.is_panic() {
            error!(%error, "job supervisor panicked");
        }
    }
}

/// Runs one job in its own unit and reports how it went.
#[instrument(
    name = "job",
    skip_all,
    fields(jid = job.jid(), jobtype = job.jobtype())
)]
async fn supervise(
    client: Client,
    handler: Option<Handler>,
    job: Job,
    hook: Option<FailureHook>,
    _permit: OwnedSemaphorePermit,
) {
    let outcome = match handler {
        None => Outcome::Failure(JobFault::unknown_jobtype(job.jobtype())),
        Some(handler) => execute(&handler, &job).await,
    };
    report(&client, &job, outcome, hook).await;
}

async fn execute(handler: &Handler, job: &Job) -> Outcome {
    let mut unit = AbortOnDrop(handler.spawn(job.clone()));
    match (&mut unit.0).await {
        Ok(Ok(())) => Outcome::Success,
        Ok(Err(err)) => {
            let limit = job.backtrace() as usize;
            Outcome::Failure(JobFault::from_error(&err, limit))
        },
        Err(e) if e.is_panic() => {
            Outcome::Failure(JobFault::from_panic(e.into_panic()))
        },
        Err(_) => Outcome::Abandoned,
    }
}

async fn report(
    client: &Client,
    job: &Job,
    outcome: Outcome,
    hook: Option<FailureHook>,
) {
    let jid = job.jid().to_owned();
    match outcome {
        Outcome::Success => match client.ack(&jid).await {
            Ok(()) => debug!("acked"),
            Err(error) => error!(%error, "ACK not delivered"),
        },
        Outcome::Failure(fault) => {
            warn!(kind = %fault.kind, message = %fault.message, "job failed");
            if let Some(hook) = hook {
                run_hook(hook, job, &fault).await;
            }
            match client.fail(fault.into_report(jid)).await {
                Ok(()) => debug!("failure reported"),
                Err(error) => error!(%error, "FAIL not delivered"),
            }
        },
        Outcome::Abandoned => warn!("abandoned, the server will redeliver it"),
    }
}

async fn run_hook(hook: FailureHook, job: &Job, fault: &JobFault) {
    let (job, fault) = (job.clone(), fault.clone());
    let call = tokio::task::spawn_blocking(move || hook(&job, &fault));
    match timeout(HOOK_TIMEOUT, call).await {
        Ok(Ok(Ok(()))) => {},
        Ok(Ok(Err(error))) => warn!(%error, "failure hook returned an error"),
        Ok(Err(error)) => warn!(%error, "failure hook panicked"),
        Err(_) => warn!(timeout = ?HOOK_TIMEOUT, "failure hook timed out"),
    }
}
