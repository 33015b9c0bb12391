//! The consumer's run state, and the one place it changes.
//!
//! Heartbeat replies and OS signals both arrive here as a [`Trigger`]; what
//! happens next depends only on the trigger and the current state, never on
//! who sent it.
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{Error, Result};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LifecycleState {
    Idle,
    Running,
    /// No new fetches; in-flight jobs carry on.
    Quiescing,
    Stopped,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            LifecycleState::Idle => "idle",
            LifecycleState::Running => "running",
            LifecycleState::Quiescing => "quiescing",
            LifecycleState::Stopped => "stopped",
        })
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Trigger {
    /// The server asked the worker to stop fetching.
    Quiet,
    /// The server asked the worker to shut down.
    Terminate,
    /// SIGINT or SIGTERM. A second one while draining stops immediately.
    Signal,
    /// In-flight jobs outlived the grace period.
    GraceExpired,
    /// Every in-flight job has finished.
    Drained,
    /// The consumer can no longer talk to the server.
    Failed,
}

struct Phase {
    state: LifecycleState,
    /// Set once shutdown (rather than just quiet) has been asked for.
    draining: bool,
}

/// Shared between the fetch loop, heartbeat and signal listener.
#[derive(Clone)]
pub(crate) struct Lifecycle {
    phase: Arc<Mutex<Phase>>,
    quiesce: CancellationToken,
    drain: CancellationToken,
    stop: CancellationToken,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            phase: Arc::new(Mutex::new(Phase {
                state: LifecycleState::Idle,
                draining: false,
            })),
            quiesce: CancellationToken::new(),
            drain: CancellationToken::new(),
            stop: CancellationToken::new(),
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.phase.lock().state
    }

    pub fn start(&self) -> Result<()> {
        let mut phase = self.phase.lock();
        if phase.state != LifecycleState::Idle {
            return Err(Error::config(format!(
                "consumer cannot start while {}",
                phase.state
            )));
        }
        phase.state = LifecycleState::Running;
        info!(
            from = %LifecycleState::Idle,
            to = %LifecycleState::Running,
            "lifecycle"
        );
        Ok(())
    }

    /// Applies a trigger and returns the resulting state.
    pub fn trigger(&self, trigger: Trigger) -> LifecycleState {
        use LifecycleState::*;

        let mut phase = self.phase.lock();
        let from = phase.state;

        let (to, drain) = match (from, trigger, phase.draining) {
            (Stopped, _, _) => return Stopped,
            (
                _,
                Trigger::GraceExpired | Trigger::Drained | Trigger::Failed,
                _,
            ) => (Stopped, phase.draining),
            (Idle, Trigger::Signal | Trigger::Terminate, _) => (Stopped, true),
            (Idle, Trigger::Quiet, _) => return Idle,
            (Running, Trigger::Quiet, _) => (Quiescing, false),
            (Quiescing, Trigger::Quiet, _) => return Quiescing,
            (Running | Quiescing, Trigger::Terminate, _) => (Quiescing, true),
            (Running, Trigger::Signal, _) => (Quiescing, true),
            (Quiescing, Trigger::Signal, false) => (Quiescing, true),
            (Quiescing, Trigger::Signal, true) => {
                warn!("signalled again while draining, stopping now");
                (Stopped, true)
            },
        };

        phase.state = to;
        phase.draining = drain;
        drop(phase);

        if to != Running {
            self.quiesce.cancel();
        }
        if drain {
            self.drain.cancel();
        }
        if to == Stopped {
            self.stop.cancel();
        }
        if to != from {
            info!(%from, %to, ?trigger, "lifecycle");
        }

        to
    }

    /// Fires once fetching must stop.
    pub fn quiesced(&self) -> CancellationToken {
        self.quiesce.clone()
    }

    /// Fires once in-flight jobs should be drained and the consumer shut
    /// down.
    pub fn draining(&self) -> CancellationToken {
        self.drain.clone()
    }

    /// Fires on reaching `Stopped`.
    pub fn stopped(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// What the heartbeat should report as this worker's own state.
    pub fn beat_label(&self) -> Option<&'static str> {
        let phase = self.phase.lock();
        match phase.state {
            LifecycleState::Quiescing if phase.draining => Some("terminate"),
            LifecycleState::Quiescing => Some("quiet"),
            LifecycleState::Stopped => Some("terminate"),
            _ => None,
        }
    }
}

/// Feeds SIGINT and SIGTERM into the lifecycle until it stops.
pub(crate) async fn listen_for_signals(lifecycle: Lifecycle) {
    let term = signal(SignalKind::terminate());
    let int = signal(SignalKind::interrupt());
    let (mut sigterm, mut sigint) = match (term, int) {
        (Ok(term), Ok(int)) => (term, int),
        (Err(error), _) | (_, Err(error)) => {
            warn!(%error, "unable to install signal handlers");
            return;
        },
    };

    let stopped = lifecycle.stopped();
    loop {
        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM"),
            _ = sigint.recv() => info!("received SIGINT"),
            _ = stopped.cancelled() => return,
        }
        if lifecycle.trigger(Trigger::Signal) == LifecycleState::Stopped {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn running() -> Lifecycle {
        let l = Lifecycle::new();
        l.start().unwrap();
        l
    }

    #[test]
    fn start_only_once() {
        let l = running();
        assert_eq!(l.state(), LifecycleState::Running);
        assert!(l.start().is_err());
    }

    #[test]
    fn quiet_stops_fetching_but_does_not_drain() {
        let l = running();
        assert_eq!(l.trigger(Trigger::Quiet), LifecycleState::Quiescing);
        assert!(l.quiesced().is_cancelled());
        assert!(!l.draining().is_cancelled());
        assert_eq!(l.beat_label(), Some("quiet"));

        // Repeats are harmless.
        assert_eq!(l.trigger(Trigger::Quiet), LifecycleState::Quiescing);
    }

    #[test]
    fn terminate_drains_then_stops() {
        let l = running();
        assert_eq!(l.trigger(Trigger::Terminate), LifecycleState::Quiescing);
        assert!(l.draining().is_cancelled());
        assert!(!l.stopped().is_cancelled());
        assert_eq!(l.beat_label(), Some("terminate"));

        assert_eq!(l.trigger(Trigger::Drained), LifecycleState::Stopped);
        assert!(l.stopped().is_cancelled());
    }

    #[test]
    fn signals_and_server_share_one_path() {
        let by_signal = running();
        let by_server = running();
        by_signal.trigger(Trigger::Signal);
        by_server.trigger(Trigger::Terminate);
        assert_eq!(by_signal.state(), by_server.state());
        assert_eq!(by_signal.beat_label(), by_server.beat_label());
    }

    #[test]
    fn second_signal_escalates() {
        let l = running();
        l.trigger(Trigger::Signal);
        assert_eq!(l.state(), LifecycleState::Quiescing);
        assert_eq!(l.trigger(Trigger::Signal), LifecycleState::Stopped);
    }

    #[test]
    fn signal_after_quiet_starts_draining() {
        let l = running();
        l.trigger(Trigger::Quiet);
        assert_eq!(l.trigger(Trigger::Signal), LifecycleState::Quiescing);
        assert!(l.draining().is_cancelled());
    }

    #[test]
    fn stopped_is_final() {
        let l = running();
        assert_eq!(l.trigger(Trigger::GraceExpired), LifecycleState::Stopped);
        assert_eq!(l.trigger(Trigger::Quiet), LifecycleState::Stopped);
        assert_eq!(l.trigger(Trigger::Signal), LifecycleState::Stopped);
        assert!(l.quiesced().is_cancelled());
    }
}
