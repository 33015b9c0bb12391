use std::collections::BTreeMap;

use tracing::{debug, info, instrument, warn};

use crate::client::Client;
use crate::config::ClientOptions;
use crate::error::{Error, Result};
use crate::types::batch::{
    validate_bid, validate_queue_list, Batch, BatchStatus,
};
use crate::types::job::Job;
use crate::types::mutate::MutateOperation;
use crate::types::protocol::ServerInfo;
use crate::types::states::Role;

/// Per-job outcome of [`Producer::push_bulk`], keyed by jid: `None` when the
/// job was accepted, otherwise why it wasn't.
pub type BulkPushResult = BTreeMap<String, Option<String>>;

/// Enqueues jobs and administers the server.
///
/// Everything is validated locally before anything is sent, so an invalid
/// job or operation never costs a round trip.
#[derive(Clone)]
pub struct Producer {
    client: Client,
}

impl Producer {
    /// Wraps a client able to produce.
    pub fn new(client: Client) -> Result<Self> {
        if !client.role().permits(Role::Producer) {
            return Err(Error::config(format!(
                "a {} client can't act as a producer",
                client.role()
            )));
        }
        Ok(Self { client })
    }

    pub async fn connect(options: ClientOptions) -> Result<Self> {
        Self::new(Client::connect(options).await?)
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    #[instrument(skip_all, fields(jid = job.jid(), jobtype = job.jobtype()))]
    pub async fn push(&self, job: &Job) -> Result<()> {
        job.validate()?;
        self.client.push(job.clone()).await?;
        debug!(queue = job.queue(), "pushed");
        Ok(())
    }

    /// Pushes many jobs in one round trip.
    ///
    /// Jobs failing local validation are reported in the result rather than
    /// failing the call, and are not sent. Only a transport or protocol
    /// failure of the round trip itself is an `Err`.
    #[instrument(skip_all)]
    pub async fn push_bulk<I>(&self, jobs: I) -> Result<BulkPushResult>
    where
        I: IntoIterator<Item = Job>,
    {
        let mut results = BulkPushResult::new();
        let mut valid = Vec::new();
        for job in jobs {
            match job.validate() {
                Ok(()) => {
                    results.insert(job.jid().to_owned(), None);
                    valid.push(job);
                },
                Err(e) => {
                    results.insert(job.jid().to_owned(), Some(e.to_string()));
                },
            }
        }

        if valid.is_empty() {
            debug!("nothing valid to push");
            return Ok(results);
        }

        let sent = valid.len();
        let rejected = self.client.push_bulk(valid).await?;
        let refused = rejected.len();
        for (jid, reason) in rejected {
            results.insert(jid, Some(reason));
        }
        info!(sent, refused, "bulk push");

        Ok(results)
    }

    /// Creates a batch and returns the id the server assigned to it. Jobs are
    /// added by pushing them with the bid set, then the batch is committed.
    #[instrument(skip_all)]
    pub async fn batch_new(&self, batch: &Batch) -> Result<String> {
        batch.validate()?;
        let bid = self.client.batch_new(batch.clone()).await?;
        debug!(%bid, "batch created");
        Ok(bid)
    }

    /// Reopens a committed batch so more jobs can be added.
    pub async fn batch_open(&self, bid: &str) -> Result<()> {
        validate_bid(bid)?;
        self.client.batch_open(bid).await
    }

    pub async fn batch_commit(&self, bid: &str) -> Result<()> {
        validate_bid(bid)?;
        self.client.batch_commit(bid).await
    }

    pub async fn batch_status(&self, bid: &str) -> Result<BatchStatus> {
        validate_bid(bid)?;
        self.client.batch_status(bid).await
    }

    /// Applies a bulk change to the scheduled, retry or dead set.
    #[instrument(skip_all, fields(cmd = ?op.cmd, target = %op.target))]
    pub async fn mutate(&self, op: &MutateOperation) -> Result<()> {
        op.validate()?;
        if op.filter.as_ref().map_or(true, |f| f.is_unconstrained()) {
            warn!("unfiltered mutation applies to the whole set");
        }
        self.client.mutate(op.clone()).await
    }

    /// Deletes every job in the named queues. `*` names all of them.
    pub async fn queue_remove(&self, queues: &[&str]) -> Result<()> {
        validate_queue_list(queues)?;
        self.client.queue_remove(owned(queues)).await
    }

    /// Stops the named queues being fetched from, leaving them intact.
    pub async fn queue_pause(&self, queues: &[&str]) -> Result<()> {
        validate_queue_list(queues)?;
        self.client.queue_pause(owned(queues)).await
    }

    pub async fn queue_resume(&self, queues: &[&str]) -> Result<()> {
        validate_queue_list(queues)?;
        self.client.queue_resume(owned(queues)).await
    }

    pub async fn info(&self) -> Result<ServerInfo> {
        self.client.info().await
    }

    pub async fn flush(&self) -> Result<()> {
        self.client.flush().await
    }
}

fn owned(queues: &[&str]) -> Vec<String> {
    queues.iter().map(|q| (*q).to_owned()).collect()
}
