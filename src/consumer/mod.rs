//! The worker side: fetch jobs by queue priority, run them in a bounded pool
//! and report outcomes, while a heartbeat keeps the server informed and
//! relays its quiet/terminate requests.
mod handler;
mod heartbeat;
mod lifecycle;
mod pool;
mod scheduler;

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, instrument, warn};

pub use self::handler::{Handler, ProcessFailure};
pub use self::lifecycle::{LifecycleState, Trigger};
pub use self::pool::{FailureHook, JobFault, HOOK_TIMEOUT};
pub use self::scheduler::Priority;

use self::handler::Registry;
use self::heartbeat::HeartbeatConfig;
use self::lifecycle::{listen_for_signals, Lifecycle};
use self::pool::WorkerPool;
use self::scheduler::Scheduler;
use crate::client::Client;
use crate::config::ClientOptions;
use crate::error::{Error, Result};
use crate::types::job::{Job, DEFAULT_QUEUE};
use crate::types::states::Role;

pub const DEFAULT_CONCURRENCY: usize = 4;
pub const DEFAULT_GRACE: Duration = Duration::from_secs(25);
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(15);
/// Beat intervals outside this range work, but either load the server for no
/// benefit or risk it deciding the worker is gone.
pub const RECOMMENDED_HEARTBEAT: (Duration, Duration) =
    (Duration::from_secs(5), Duration::from_secs(60));
pub const DEFAULT_HEARTBEAT_RETRIES: u32 = 3;
pub const DEFAULT_IDLE_BACKOFF: Duration = Duration::from_millis(100);
const HEARTBEAT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Configures a [`Consumer`]. Nothing is checked until [`build`] or
/// [`connect`], and both check everything before touching the network.
///
/// [`build`]: ConsumerBuilder::build
/// [`connect`]: ConsumerBuilder::connect
pub struct ConsumerBuilder {
    queues: Vec<String>,
    priority: Priority,
    weights: Option<Vec<f64>>,
    concurrency: usize,
    grace: Duration,
    heartbeat: Duration,
    heartbeat_retries: u32,
    idle_backoff: Duration,
    handle_signals: bool,
    hook: Option<FailureHook>,
    registry: Registry,
    seed: Option<u64>,
}

impl Default for ConsumerBuilder {
    fn default() -> Self {
        Self {
            queues: vec![DEFAULT_QUEUE.to_owned()],
            priority: Priority::default(),
            weights: None,
            concurrency: DEFAULT_CONCURRENCY,
            grace: DEFAULT_GRACE,
            heartbeat: DEFAULT_HEARTBEAT,
            heartbeat_retries: DEFAULT_HEARTBEAT_RETRIES,
            idle_backoff: DEFAULT_IDLE_BACKOFF,
            handle_signals: true,
            hook: None,
            registry: Registry::default(),
            seed: None,
        }
    }
}

impl ConsumerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queues<I, S>(mut self, queues: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.queues = queues.into_iter().map(Into::into).collect();
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// One weight per queue, in the same order. Only for
    /// [`Priority::Weighted`].
    pub fn weights<I: IntoIterator<Item = f64>>(mut self, weights: I) -> Self {
        self.weights = Some(weights.into_iter().collect());
        self
    }

    /// How many jobs may run at once.
    pub fn concurrency(mut self, n: usize) -> Self {
        self.concurrency = n;
        self
    }

    /// How long in-flight jobs get to finish once shutdown starts.
    pub fn grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat = interval;
        self
    }

    pub fn heartbeat_retries(mut self, retries: u32) -> Self {
        self.heartbeat_retries = retries;
        self
    }

    /// Pause after a fetch finds every queue empty.
    pub fn idle_backoff(mut self, backoff: Duration) -> Self {
        self.idle_backoff = backoff;
        self
    }

    /// Whether SIGINT/SIGTERM shut the consumer down. On by default.
    pub fn handle_signals(mut self, enabled: bool) -> Self {
        self.handle_signals = enabled;
        self
    }

    pub fn on_failure<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Job, &JobFault) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.hook = Some(Arc::new(hook));
        self
    }

    /// Sets the handler for `jobtype`. Registering the same jobtype twice
    /// keeps the later handler.
    pub fn register(
        mut self,
        jobtype: impl Into<String>,
        handler: Handler,
    ) -> Self {
        self.registry.register(jobtype.into(), handler);
        self
    }

    /// Makes the scheduler's random choices reproducible.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    fn validate(self) -> Result<Plan> {
        if self.concurrency == 0 {
            return Err(Error::config("concurrency must be at least 1"));
        }
        if self.heartbeat.is_zero() {
            return Err(Error::config("heartbeat interval must be non-zero"));
        }
        let (lo, hi) = RECOMMENDED_HEARTBEAT;
        if self.heartbeat < lo || self.heartbeat > hi {
            warn!(
                interval = ?self.heartbeat,
                "heartbeat interval outside {lo:?}..={hi:?}"
            );
        }
        if self.registry.is_empty() {
            return Err(Error::config("no job handlers registered"));
        }
        if self.registry.jobtypes().any(str::is_empty) {
            return Err(Error::config(
                "cannot register a handler for an empty jobtype",
            ));
        }

        let (queues, priority, weights) =
            (self.queues, self.priority, self.weights);
        let scheduler = match self.seed {
            Some(seed) => Scheduler::seeded(queues, priority, weights, seed),
            None => Scheduler::new(queues, priority, weights),
        }?;

        Ok(Plan {
            scheduler,
            registry: Arc::new(self.registry),
            concurrency: self.concurrency,
            hook: self.hook,
            grace: self.grace,
            heartbeat: HeartbeatConfig {
                interval: self.heartbeat,
                retries: self.heartbeat_retries,
                retry_delay: HEARTBEAT_RETRY_DELAY.min(self.heartbeat),
            },
            idle_backoff: self.idle_backoff,
            handle_signals: self.handle_signals,
        })
    }

    /// Builds a consumer over an existing worker client.
    pub fn build(self, client: Client) -> Result<Consumer> {
        let plan = self.validate()?;
        if !client.role().permits(Role::Consumer) {
            return Err(Error::config(format!(
                "a {} client can't act as a consumer",
                client.role()
            )));
        }
        Ok(plan.into_consumer(client))
    }

    /// Validates the configuration, then connects.
    pub async fn connect(self, options: ClientOptions) -> Result<Consumer> {
        let plan = self.validate()?;
        if !options.role.permits(Role::Consumer) {
            return Err(Error::config(format!(
                "a {} client can't act as a consumer",
                options.role
            )));
        }
        let client = Client::connect(options).await?;
        Ok(plan.into_consumer(client))
    }
}

/// A validated configuration, waiting for its client.
struct Plan {
    scheduler: Scheduler,
    registry: Arc<Registry>,
    concurrency: usize,
    hook: Option<FailureHook>,
    grace: Duration,
    heartbeat: HeartbeatConfig,
    idle_backoff: Duration,
    handle_signals: bool,
}

impl Plan {
    fn into_consumer(self, client: Client) -> Consumer {
        let pool = WorkerPool::new(
            client.clone(),
            self.registry,
            self.concurrency,
            self.hook,
        );
        Consumer {
            pool,
            client,
            scheduler: self.scheduler,
            lifecycle: Lifecycle::new(),
            grace: self.grace,
            heartbeat: self.heartbeat,
            idle_backoff: self.idle_backoff,
            handle_signals: self.handle_signals,
        }
    }
}

/// Lets other tasks ask a running consumer to wind down, exactly as the
/// server's heartbeat replies would.
#[derive(Clone)]
pub struct ConsumerHandle {
    lifecycle: Lifecycle,
}

impl ConsumerHandle {
    /// Stop fetching; in-flight jobs carry on.
    pub fn quiet(&self) {
        self.lifecycle.trigger(Trigger::Quiet);
    }

    /// Stop fetching, give in-flight jobs the grace period, then stop.
    pub fn terminate(&self) {
        self.lifecycle.trigger(Trigger::Terminate);
    }

    pub fn state(&self) -> LifecycleState {
        self.lifecycle.state()
    }
}

pub struct Consumer {
    client: Client,
    scheduler: Scheduler,
    pool: WorkerPool,
    lifecycle: Lifecycle,
    grace: Duration,
    heartbeat: HeartbeatConfig,
    idle_backoff: Duration,
    handle_signals: bool,
}

impl Consumer {
    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn handle(&self) -> ConsumerHandle {
        ConsumerHandle {
            lifecycle: self.lifecycle.clone(),
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.lifecycle.state()
    }

    /// Runs until told to stop, by the server or a signal, or until the
    /// server can no longer be reached. Closes the client on the way out.
    #[instrument(name = "consumer", skip_all, fields(wid = self.client.wid()))]
    pub async fn run(mut self) -> Result<()> {
        self.lifecycle.start()?;
        info!(
            queues = ?self.scheduler.queues(),
            concurrency = self.pool.capacity(),
            "consumer running"
        );

        let mut heartbeat = Some(tokio::spawn(heartbeat::run(
            self.client.clone(),
            self.lifecycle.clone(),
            self.heartbeat,
        )));
        let signals = self
            .handle_signals
            .then(|| tokio::spawn(listen_for_signals(self.lifecycle.clone())));

        let mut outcome = tokio::select! {
            fetched = self.fetch_loop() => fetched,
            beat = wait_for(&mut heartbeat) => beat,
        };

        // Quiet: in-flight jobs carry on until shutdown is asked for.
        if outcome.is_ok() {
            let draining = self.lifecycle.draining();
            let stopped = self.lifecycle.stopped();
            tokio::select! {
                _ = draining.cancelled() => {},
                _ = stopped.cancelled() => {},
                beat = wait_for(&mut heartbeat) => outcome = beat,
            }
        }

        if outcome.is_ok() {
            outcome = self.drain(&mut heartbeat).await;
        }
        if outcome.is_err() {
            self.lifecycle.trigger(Trigger::Failed);
        }
        self.pool.abort_all().await;

        if let Some(beating) = heartbeat {
            beating.abort();
        }
        if let Some(listening) = signals {
            listening.abort();
        }
        self.client.close().await;

        match &outcome {
            Ok(()) => info!("consumer stopped"),
            Err(error) => error!(%error, "consumer stopped"),
        }
        outcome
    }

    /// Fetches and dispatches until quiesced.
    async fn fetch_loop(&mut self) -> Result<()> {
        let quiesced = self.lifecycle.quiesced();

        loop {
            self.pool.reap();

            let permit = tokio::select! {
                biased;
                _ = quiesced.cancelled() => return Ok(()),
                permit = self.pool.reserve() => match permit {
                    Some(permit) => permit,
                    None => return Ok(()),
                },
            };

            // Once sent, a FETCH is always seen through: abandoning it could
            // strand a reserved job until its reservation runs out. A job that
            // arrives just after quiescing is therefore still run.
            match self.client.fetch(self.scheduler.next_order()).await {
                Ok(Some(job)) => {
                    debug!(
                        jid = job.jid(),
                        jobtype = job.jobtype(),
                        queue = job.queue(),
                        "fetched"
                    );
                    self.pool.dispatch(job, permit);
                },
                Ok(None) => {
                    drop(permit);
                    tokio::select! {
                        _ = sleep(self.idle_backoff) => {},
                        _ = quiesced.cancelled() => return Ok(()),
                    }
                },
                Err(error) => {
                    error!(%error, "fetch failed");
                    return Err(error);
                },
            }
        }
    }

    /// Gives in-flight jobs the grace period to finish. Losing the heartbeat
    /// meanwhile cuts the drain short with its error.
    async fn drain(
        &mut self,
        heartbeat: &mut Option<JoinHandle<Result<()>>>,
    ) -> Result<()> {
        if self.lifecycle.state() == LifecycleState::Stopped {
            return Ok(());
        }

        info!(
            in_flight = self.pool.in_flight(),
            grace = ?self.grace,
            "draining"
        );
        let stopped = self.lifecycle.stopped();
        tokio::select! {
            drained = timeout(self.grace, self.pool.drain()) => {
                let trigger = match drained {
                    Ok(()) => Trigger::Drained,
                    Err(_) => Trigger::GraceExpired,
                };
                self.lifecycle.trigger(trigger);
            },
            // Escalated, e.g. by a second signal.
            _ = stopped.cancelled() => {},
            beat = wait_for(heartbeat) => beat?,
        }
        Ok(())
    }
}

/// Waits for the heartbeat task, if it is still around. Once it has
/// finished the slot is emptied, so it is never polled again.
async fn wait_for(
    heartbeat: &mut Option<JoinHandle<Result<()>>>,
) -> Result<()> {
    let Some(handle) = heartbeat.as_mut() else {
        return std::future::pending().await;
    };
    let joined = handle.await;
    *heartbeat = None;
    match joined {
        Ok(result) => result,
        Err(error) => {
            Err(Error::Connection(format!("heartbeat task failed: {error}")))
        },
    }
}
