use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::ClientOptions;
use crate::connection::{Connection, Transport};
use crate::error::{Error, Result};
use crate::types::batch::{Batch, BatchStatus};
use crate::types::job::Job;
use crate::types::mutate::MutateOperation;
use crate::types::protocol::{
    parse_push_bulk_reply, Beat, BeatState, Command, FailReport, Reply,
    ServerInfo,
};
use crate::types::states::Role;

/// A shared handle on one server connection.
///
/// Clones share the connection. Requests are serialised through an async
/// mutex, so each command and its reply form an uninterrupted exchange even
/// when the heartbeat and the workers of a consumer all use the same client.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Shared>,
}

struct Shared {
    conn: Mutex<Connection>,
    options: ClientOptions,
    /// Whether a broken connection may be replaced by dialling again. Not the
    /// case for clients handed a ready-made stream.
    redial: bool,
    closed: AtomicBool,
}

impl Client {
    /// Connects to the server named in `options`.
    pub async fn connect(options: ClientOptions) -> Result<Self> {
        let options = options.resolve()?;
        let conn = Connection::connect(&options).await?;
        Ok(Self::from_parts(conn, options, true))
    }

    /// Runs the protocol over an already-open stream. The client can't
    /// reconnect by itself if that stream fails.
    pub async fn connect_with<S>(
        stream: S,
        options: ClientOptions,
    ) -> Result<Self>
    where
        S: Transport + 'static,
    {
        let options = options.resolve()?;
        let conn = Connection::handshake(stream, &options).await?;
        Ok(Self::from_parts(conn, options, false))
    }

    fn from_parts(
        conn: Connection,
        options: ClientOptions,
        redial: bool,
    ) -> Self {
        Self {
            inner: Arc::new(Shared {
                conn: Mutex::new(conn),
                options,
                redial,
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn role(&self) -> Role {
        self.inner.options.role
    }

    /// The worker id sent in the handshake, if this client is a worker.
    pub fn wid(&self) -> Option<&str> {
        self.inner.options.wid.as_deref()
    }

    pub fn options(&self) -> &ClientOptions {
        &self.inner.options
    }

    /// Sends one command and waits for its reply, dialling again once if the
    /// connection turns out to be broken.
    pub(crate) async fn call(&self, cmd: Command) -> Result<Reply> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::Connection("client has been closed".into()));
        }

        let mut conn = self.inner.conn.lock().await;
        match conn.request(&cmd).await {
            Err(error) if error.is_transport() && self.inner.redial => {
                warn!(
                    %error,
                    verb = cmd.verb(),
                    "request failed, reconnecting"
                );
                conn.close().await;
                *conn = Connection::connect(&self.inner.options).await?;
                conn.request(&cmd).await
            },
            result => result,
        }
    }

    pub async fn info(&self) -> Result<ServerInfo> {
        let body = self.call(Command::Info).await?.expect_bulk()?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// Clears every queue and set on the server. Meant for tests.
    pub async fn flush(&self) -> Result<()> {
        self.call(Command::Flush).await?.expect_ok()
    }

    /// Says goodbye to the server. Idempotent; the client is unusable
    /// afterwards.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.conn.lock().await.close().await;
        debug!("client closed");
    }

    pub(crate) async fn push(&self, job: Job) -> Result<()> {
        self.call(Command::Push(job)).await?.expect_ok()
    }

    /// Returns the jids the server refused, with its reasons.
    pub(crate) async fn push_bulk(
        &self,
        jobs: Vec<Job>,
    ) -> Result<BTreeMap<String, String>> {
        parse_push_bulk_reply(self.call(Command::PushBulk(jobs)).await?)
    }

    /// `None` when every queue stayed empty for the server's blocking window.
    pub(crate) async fn fetch(
        &self,
        queues: Vec<String>,
    ) -> Result<Option<Job>> {
        match self.call(Command::Fetch { queues }).await? {
            Reply::Bulk(None) => Ok(None),
            Reply::Bulk(Some(body)) => Job::decode(&body).map(Some),
            other => Err(Error::protocol(format!(
                "unexpected FETCH reply {other:?}"
            ))),
        }
    }

    pub(crate) async fn ack(&self, jid: &str) -> Result<()> {
        self.call(Command::Ack { jid: jid.to_owned() })
            .await?
            .expect_ok()
    }

    pub(crate) async fn fail(&self, report: FailReport) -> Result<()> {
        self.call(Command::Fail(report)).await?.expect_ok()
    }

    pub(crate) async fn beat(
        &self,
        current_state: Option<&'static str>,
    ) -> Result<BeatState> {
        let wid = self
            .wid()
            .ok_or_else(|| Error::config("only a worker can heartbeat"))?
            .to_owned();
        let beat = Beat {
            wid,
            current_state,
            rss_kb: None,
        };
        BeatState::from_reply(self.call(Command::Beat(beat)).await?)
    }

    pub(crate) async fn mutate(&self, op: MutateOperation) -> Result<()> {
        self.call(Command::Mutate(op)).await?.expect_ok()
    }

    pub(crate) async fn batch_new(&self, batch: Batch) -> Result<String> {
        match self.call(Command::BatchNew(batch)).await? {
            Reply::Simple(bid) if !bid.is_empty() => Ok(bid),
            other => Err(Error::protocol(format!(
                "expected a batch id, got {other:?}"
            ))),
        }
    }

    pub(crate) async fn batch_open(&self, bid: &str) -> Result<()> {
        self.call(Command::BatchOpen { bid: bid.to_owned() })
            .await?
            .expect_ok()
    }

    pub(crate) async fn batch_commit(&self, bid: &str) -> Result<()> {
        self.call(Command::BatchCommit { bid: bid.to_owned() })
            .await?
            .expect_ok()
    }

    pub(crate) async fn batch_status(&self, bid: &str) -> Result<BatchStatus> {
        let body = self
            .call(Command::BatchStatus { bid: bid.to_owned() })
            .await?
            .expect_bulk()?;
        Ok(serde_json::from_slice(&body)?)
    }

    pub(crate) async fn queue_remove(&self, queues: Vec<String>) -> Result<()> {
        self.call(Command::QueueRemove { queues }).await?.expect_ok()
    }

    pub(crate) async fn queue_pause(&self, queues: Vec<String>) -> Result<()> {
        self.call(Command::QueuePause { queues }).await?.expect_ok()
    }

    pub(crate) async fn queue_resume(&self, queues: Vec<String>) -> Result<()> {
        self.call(Command::QueueResume { queues }).await?.expect_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use crate::config::ServerUrl;
    use crate::testing::{bulk, Answer, ScriptedServer, HI};

    fn options(role: Role) -> ClientOptions {
        ClientOptions::new(ServerUrl::parse("tcp://localhost").unwrap(), role)
            .with_read_timeout(Duration::from_secs(2))
    }

    #[tokio::test]
    async fn info_and_flush() {
        let (server, stream) = ScriptedServer::start(HI, |line| match line {
            "INFO" => bulk(r#"{"server":{"faktory_version":"1.9.0"}}"#),
            _ => Answer::Ok,
        });
        let client = Client::connect_with(stream, options(Role::Producer))
            .await
            .unwrap();

        assert_eq!(client.info().await.unwrap().version(), Some("1.9.0"));
        client.flush().await.unwrap();
        assert_eq!(&server.commands()[1..], ["INFO", "FLUSH"]);
    }

    #[tokio::test]
    async fn fetch_decodes_jobs_and_nil() {
        let mut served = false;
        let (_server, stream) = ScriptedServer::start(HI, move |line| {
            assert!(line.starts_with("FETCH "));
            if std::mem::replace(&mut served, true) {
                "$-1".into()
            } else {
                bulk(r#"{"jid":"j1","jobtype":"t","args":[1],"queue":"q"}"#)
            }
        });
        let client = Client::connect_with(stream, options(Role::Consumer))
            .await
            .unwrap();

        let job = client.fetch(vec!["q".into()]).await.unwrap().unwrap();
        assert_eq!(job.jid(), "j1");
        assert_eq!(job.queue(), "q");
        assert!(client.fetch(vec!["q".into()]).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn beat_carries_wid_and_state() {
        let (server, stream) = ScriptedServer::start(HI, |_| {
            bulk(r#"{"state":"quiet"}"#)
        });
        let client = Client::connect_with(
            stream,
            options(Role::Consumer).with_wid("worker-0001"),
        )
        .await
        .unwrap();

        assert_eq!(
            client.beat(Some("quiet")).await.unwrap(),
            BeatState::Quiet
        );
        assert_eq!(
            server.commands()[1],
            r#"BEAT {"wid":"worker-0001","current_state":"quiet"}"#
        );
    }

    #[tokio::test]
    async fn batch_new_returns_the_bid() {
        let (_server, stream) =
            ScriptedServer::start(HI, |_| "+b-123".into());
        let client = Client::connect_with(stream, options(Role::Producer))
            .await
            .unwrap();
        assert_eq!(client.batch_new(Batch::new("d")).await.unwrap(), "b-123");
    }

    #[tokio::test]
    async fn closed_client_refuses_requests() {
        let (mut server, stream) = ScriptedServer::start(HI, |_| Answer::Ok);
        let client = Client::connect_with(stream, options(Role::Both))
            .await
            .unwrap();
        client.close().await;
        client.close().await;
        server.finished().await;

        assert_eq!(server.count("END"), 1);
        assert!(matches!(client.flush().await, Err(Error::Connection(_))));
    }

    #[tokio::test]
    async fn dropped_connection_is_redialled_once() {
        let infos = Arc::new(AtomicUsize::new(0));
        let seen = infos.clone();
        let (server, url) = ScriptedServer::listen(HI, move |line| {
            match line {
                // The first INFO kills its connection.
                "INFO" if seen.fetch_add(1, Ordering::SeqCst) == 0 => {
                    Answer::HangUp
                },
                "INFO" => bulk("{}"),
                _ => Answer::Ok,
            }
        })
        .await;

        let client = Client::connect(ClientOptions::new(url, Role::Producer))
            .await
            .unwrap();
        client.info().await.unwrap();

        assert_eq!(infos.load(Ordering::SeqCst), 2);
        assert_eq!(server.count("HELLO"), 2);
    }

    #[tokio::test]
    async fn server_errors_are_not_retried() {
        let (server, url) =
            ScriptedServer::listen(HI, |_| "-ERR broken".into()).await;
        let client = Client::connect(ClientOptions::new(url, Role::Producer))
            .await
            .unwrap();

        assert!(matches!(client.flush().await, Err(Error::Server { .. })));
        assert_eq!(server.count("HELLO"), 1);
    }
}
