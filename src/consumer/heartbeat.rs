use std::time::Duration;

use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, error, instrument, warn};

use super::lifecycle::{Lifecycle, Trigger};
use crate::client::Client;
use crate::error::{Error, Result};
use crate::types::protocol::BeatState;

#[derive(Clone, Copy, Debug)]
pub(crate) struct HeartbeatConfig {
    pub interval: Duration,
    /// How many failed beats in a row are retried before giving up.
    pub retries: u32,
    pub retry_delay: Duration,
}

/// Beats every `interval` until the consumer stops, forwarding the server's
/// requests to the lifecycle. Returns an error once the server can't be
/// reached even after retrying.
#[instrument(name = "heartbeat", skip_all, fields(wid = client.wid()))]
pub(crate) async fn run(
    client: Client,
    lifecycle: Lifecycle,
    config: HeartbeatConfig,
) -> Result<()> {
    let mut ticker = interval(config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let stopped = lifecycle.stopped();

    loop {
        tokio::select! {
            _ = ticker.tick() => {},
            _ = stopped.cancelled() => return Ok(()),
        }

        match beat(&client, &lifecycle, &config).await? {
            BeatState::Ok => {},
            BeatState::Quiet => {
                lifecycle.trigger(Trigger::Quiet);
            },
            BeatState::Terminate => {
                lifecycle.trigger(Trigger::Terminate);
            },
        }
    }
}

async fn beat(
    client: &Client,
    lifecycle: &Lifecycle,
    config: &HeartbeatConfig,
) -> Result<BeatState> {
    let mut failures = 0;
    loop {
        match client.beat(lifecycle.beat_label()).await {
            Ok(state) => {
                debug!(?state, "beat");
                return Ok(state);
            },
            Err(error) if error.is_transport() && failures < config.retries => {
                failures += 1;
                warn!(%error, failures, "heartbeat failed, retrying");
                sleep(config.retry_delay).await;
            },
            Err(error) if error.is_transport() => {
                error!(%error, "heartbeat failed, giving up");
                return Err(Error::Connection(format!(
                    "no heartbeat after {} attempts: {error}",
                    failures + 1
                )));
            },
            Err(error) => return Err(error),
        }
    }
}
