//! One socket to the server: handshake, framing and the request/response
//! discipline. The protocol is not multiplexed, so a `Connection` is only
//! ever used by one task at a time; see [`crate::client::Client`] for the
//! shared handle.
use std::process;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::io::{
    self, AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf,
};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, instrument, trace, warn};

use crate::config::ClientOptions;
use crate::error::{Error, Result};
use crate::line_reader::LineReader;
use crate::parser::ReplyHead;
use crate::tls;
use crate::types::protocol::{Command, Hello, Hi, Reply, PROTOCOL_VERSION};
use crate::types::serialisable::FwpSerialisable;
use crate::types::states::{ConnectionState, Role};
use crate::util::{bytes_to_human_str, hostname};

/// Any byte stream the protocol can run over: TCP, TLS, or an in-memory
/// pipe.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for T {}

type BoxTransport = Box<dyn Transport>;

pub struct Connection {
    reader: LineReader<ReadHalf<BoxTransport>>,
    writer: WriteHalf<BoxTransport>,
    state: ConnectionState,
    role: Role,
    read_timeout: Duration,
    /// Set from sending a request until its reply is fully read. If a request
    /// is abandoned halfway (an error, or its task being cancelled) this stays
    /// set and the connection refuses further use, as the next read would
    /// pick up a stale reply.
    in_flight: bool,
}

/// Stretches the password the way the server checks it: SHA-256 over
/// password then salt, re-hashed until `iterations` digests have been taken,
/// hex-encoded.
pub fn hash_password(password: &str, salt: &str, iterations: u32) -> String {
    let mut digest = Sha256::new()
        .chain_update(password.as_bytes())
        .chain_update(salt.as_bytes())
        .finalize();
    for _ in 1..iterations {
        digest = Sha256::digest(digest);
    }
    hex::encode(digest)
}

impl Connection {
    /// Dials the configured server, wrapping in TLS if asked, and performs
    /// the handshake.
    #[instrument(name = "connect", skip_all, fields(server = %options.url))]
    pub async fn connect(options: &ClientOptions) -> Result<Self> {
        let addr = options.url.authority();
        debug!(state = %ConnectionState::Connecting, "dialling");

        let tcp = timeout(options.read_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| Error::Timeout(options.read_timeout))?
            .map_err(|e| {
                Error::Connection(format!("connecting to {addr}: {e}"))
            })?;
        tcp.set_nodelay(true)?;

        let stream: BoxTransport = if options.url.tls {
            Box::new(tls::wrap(tcp, &options.url.host, &options.tls).await?)
        } else {
            Box::new(tcp)
        };

        Self::handshake(stream, options).await
    }

    /// Runs the handshake over an already-open stream.
    pub async fn handshake<S>(
        stream: S,
        options: &ClientOptions,
    ) -> Result<Self>
    where
        S: Transport + 'static,
    {
        let (r, w) = io::split(Box::new(stream) as BoxTransport);
        let mut conn = Self {
            reader: r.into(),
            writer: w,
            state: ConnectionState::Handshaking,
            role: options.role,
            read_timeout: options.read_timeout,
            in_flight: false,
        };

        let hi = match conn.read_reply().await? {
            Reply::Simple(text) => Hi::parse(&text)?,
            other => {
                return Err(Error::protocol(format!(
                    "expected HI greeting, got {other:?}"
                )))
            },
        };
        if hi.v != PROTOCOL_VERSION {
            return Err(Error::protocol(format!(
                "server speaks protocol version {}, this client only {}",
                hi.v, PROTOCOL_VERSION
            )));
        }

        let pwdhash = match hi.challenge() {
            Some((iterations, salt)) => {
                let password =
                    options.url.password.as_deref().ok_or_else(|| {
                        Error::Auth(
                            "server requires a password, none configured"
                                .into(),
                        )
                    })?;
                debug!(iterations, "answering password challenge");
                Some(hash_password(password, salt, iterations))
            },
            None => None,
        };

        let worker = options.role.is_worker();
        let hello = Hello {
            v: PROTOCOL_VERSION,
            hostname: worker.then(hostname),
            wid: if worker { options.wid.clone() } else { None },
            pid: worker.then(process::id),
            labels: if worker { options.labels.clone() } else { vec![] },
            pwdhash,
        };

        match conn.request(&Command::Hello(hello)).await {
            Ok(reply) => reply.expect_ok()?,
            Err(Error::Server { code, message }) => {
                return Err(Error::Auth(format!("{code} {message}")))
            },
            Err(e) => return Err(e),
        }

        conn.state = ConnectionState::Ready;
        info!(role = %options.role, wid = options.wid.as_deref(), "connected");

        Ok(conn)
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Whether the next request can go out on this socket.
    pub fn is_usable(&self) -> bool {
        self.state == ConnectionState::Ready && !self.in_flight
    }

    fn check_allowed(&self, cmd: &Command) -> Result<()> {
        if let Some(required) = cmd.required_role() {
            if !self.role.permits(required) {
                return Err(Error::protocol(format!(
                    "{} is not available to a {} connection",
                    cmd.verb(),
                    self.role
                )));
            }
        }

        let expected = match cmd {
            Command::Hello(_) => ConnectionState::Handshaking,
            _ => ConnectionState::Ready,
        };
        if self.state != expected {
            return Err(Error::Connection(format!(
                "cannot send {} while {}",
                cmd.verb(),
                self.state
            )));
        }
        if self.in_flight {
            return Err(Error::Connection(
                "an earlier request was abandoned mid-flight".into(),
            ));
        }
        Ok(())
    }

    /// Sends one command and reads its reply. An error reply comes back as
    /// [`Error::Server`], carrying the server's text unmodified.
    pub async fn request(&mut self, cmd: &Command) -> Result<Reply> {
        self.check_allowed(cmd)?;

        self.in_flight = true;
        self.send_command(cmd).await?;
        let reply = self.read_reply().await;

        // A server error is still a complete exchange; anything else that
        // failed may have left part of a reply unread.
        if matches!(reply, Ok(_) | Err(Error::Server { .. })) {
            self.in_flight = false;
        }
        reply
    }

    /// Writes a command line. Bounded by the read timeout, so a stalled peer
    /// can't block a writer forever.
    pub async fn send_command(&mut self, cmd: &Command) -> Result<()> {
        let line = cmd.serialise_fwp()?;
        match cmd {
            // Carries the password hash.
            Command::Hello(_) => trace!("C: HELLO {{...}}"),
            _ => trace!("C: {}", bytes_to_human_str(&line)),
        }

        let limit = self.read_timeout;
        let writer = &mut self.writer;
        timeout(limit, async move {
            writer.write_all(&line).await?;
            writer.flush().await
        })
        .await
        .map_err(|_| Error::Timeout(limit))??;

        Ok(())
    }

    /// Reads one complete reply, bulk body included, within the read timeout.
    pub async fn read_reply(&mut self) -> Result<Reply> {
        let limit = self.read_timeout;
        timeout(limit, self.read_reply_unbounded())
            .await
            .map_err(|_| Error::Timeout(limit))?
    }

    async fn read_reply_unbounded(&mut self) -> Result<Reply> {
        let line = self.reader.read_line().await?.ok_or_else(|| {
            Error::Connection("server closed the connection".into())
        })?;
        trace!("S: {}", bytes_to_human_str(&line));

        match ReplyHead::try_from(&line[..])? {
            ReplyHead::Simple(text) => Ok(Reply::Simple(text)),
            ReplyHead::Error { code, message } => {
                Err(Error::Server { code, message })
            },
            ReplyHead::Bulk(None) => Ok(Reply::Bulk(None)),
            ReplyHead::Bulk(Some(len)) => {
                let body = self.reader.read_bulk(len).await?;
                trace!("S: {}", bytes_to_human_str(&body));
                Ok(Reply::Bulk(Some(body)))
            },
        }
    }

    /// Says goodbye and shuts the socket. Safe to call more than once, and on
    /// a connection that has already failed.
    pub async fn close(&mut self) {
        if self.state == ConnectionState::Disconnected {
            return;
        }

        if self.is_usable() {
            self.state = ConnectionState::Closing;
            if let Err(error) = self.send_command(&Command::End).await {
                debug!(%error, "END not delivered");
            }
        }
        self.state = ConnectionState::Closing;

        match timeout(self.read_timeout, self.writer.shutdown()).await {
            Ok(Ok(())) => {},
            Ok(Err(error)) => debug!(%error, "during shutdown"),
            Err(_) => warn!("timed out shutting down the socket"),
        }

        self.state = ConnectionState::Disconnected;
        debug!("closed connection");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::config::ServerUrl;
    use crate::testing::{bulk, greet_and_serve, Answer, ScriptedServer, HI};

    fn options(url: &str, role: Role) -> ClientOptions {
        ClientOptions::new(ServerUrl::parse(url).unwrap(), role)
            .with_wid("test-worker-1")
            .with_read_timeout(Duration::from_secs(2))
    }

    async fn open<S>(stream: S, url: &str, role: Role) -> Result<Connection>
    where
        S: Transport + 'static,
    {
        Connection::handshake(stream, &options(url, role)).await
    }

    const CHALLENGE: &str = "+HI {\"v\":2,\"i\":3,\"s\":\"abc\"}";

    #[test]
    fn password_stretching() {
        let once = hash_password("pw", "salt", 1);
        assert_eq!(once, hex::encode(Sha256::digest(b"pwsalt")));

        let twice = hash_password("pw", "salt", 2);
        assert_eq!(
            twice,
            hex::encode(Sha256::digest(Sha256::digest(b"pwsalt")))
        );
        assert_eq!(hash_password("pw", "salt", 0), once);
        assert_eq!(twice.len(), 64);
    }

    #[tokio::test]
    async fn consumer_handshake_identifies_the_worker() {
        let (server, stream) = ScriptedServer::start(HI, |_| Answer::Ok);
        let conn = Connection::handshake(
            stream,
            &options("tcp://localhost", Role::Consumer),
        )
        .await
        .unwrap();
        assert_eq!(conn.state(), ConnectionState::Ready);

        let hello = server.commands().remove(0);
        let body = hello.strip_prefix("HELLO ").unwrap();
        let payload: serde_json::Value = serde_json::from_str(body).unwrap();
        assert_eq!(payload["v"], 2);
        assert_eq!(payload["wid"], "test-worker-1");
        assert_eq!(payload["labels"], serde_json::json!(["rust"]));
        assert_eq!(payload["pid"], process::id());
        assert!(payload.get("pwdhash").is_none());
    }

    #[tokio::test]
    async fn producer_handshake_sends_only_the_version() {
        let (server, stream) = ScriptedServer::start(HI, |_| Answer::Ok);
        open(stream, "tcp://h", Role::Producer).await.unwrap();
        assert_eq!(server.commands(), vec!["HELLO {\"v\":2}"]);
    }

    #[tokio::test]
    async fn password_challenge_is_answered() {
        let (server, stream) = ScriptedServer::start(CHALLENGE, |_| Answer::Ok);
        open(stream, "tcp://:secret@h", Role::Producer).await.unwrap();

        let expected = hash_password("secret", "abc", 3);
        assert_eq!(
            server.commands(),
            vec![format!("HELLO {{\"v\":2,\"pwdhash\":\"{expected}\"}}")]
        );
    }

    #[tokio::test]
    async fn missing_password_is_an_auth_error() {
        let (_server, stream) =
            ScriptedServer::start(CHALLENGE, |_| Answer::Ok);
        let err = open(stream, "tcp://h", Role::Producer).await.err().unwrap();
        assert!(matches!(err, Error::Auth(_)), "{err}");
    }

    #[tokio::test]
    async fn rejected_password_is_an_auth_error() {
        let (_server, stream) = greet_and_serve(
            "+HI {\"v\":2,\"i\":1,\"s\":\"x\"}",
            "-ERR Invalid password",
            |_| Answer::Ok,
        );
        let err = open(stream, "tcp://:bad@h", Role::Producer)
            .await
            .err()
            .unwrap();
        assert!(
            matches!(&err, Error::Auth(m) if m == "ERR Invalid password"),
            "{err}"
        );
    }

    #[tokio::test]
    async fn unknown_protocol_version_is_refused() {
        let (_server, stream) =
            ScriptedServer::start("+HI {\"v\":3}", |_| Answer::Ok);
        let err = open(stream, "tcp://h", Role::Producer).await.err().unwrap();
        assert!(matches!(err, Error::Protocol(_)), "{err}");
    }

    #[tokio::test]
    async fn requests_and_error_replies() {
        let (_server, stream) = ScriptedServer::start(HI, |line| match line {
            "INFO" => bulk("{}"),
            "FLUSH" => "-ERR nope, not today".into(),
            _ => Answer::Ok,
        });
        let mut conn = open(stream, "tcp://h", Role::Both).await.unwrap();

        assert_eq!(
            conn.request(&Command::Info).await.unwrap(),
            Reply::Bulk(Some(bytes::Bytes::from_static(b"{}")))
        );
        let err = conn.request(&Command::Flush).await.unwrap_err();
        assert!(matches!(
            &err,
            Error::Server { code, message }
                if code == "ERR" && message == "nope, not today"
        ));
        // Still in sync after an error reply.
        assert!(conn.is_usable());
        assert_eq!(
            conn.request(&Command::Ack { jid: "j".into() }).await.unwrap(),
            Reply::Simple("OK".into())
        );
    }

    #[tokio::test]
    async fn role_is_enforced_before_io() {
        let (server, stream) = ScriptedServer::start(HI, |_| Answer::Ok);
        let mut conn = open(stream, "tcp://h", Role::Producer).await.unwrap();
        let err = conn
            .request(&Command::Fetch {
                queues: vec!["default".into()],
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
        assert_eq!(server.commands().len(), 1);
    }

    #[tokio::test]
    async fn silent_server_times_out_and_poisons_the_connection() {
        let (_server, stream) = ScriptedServer::start(HI, |_| Answer::Silence);
        let options = options("tcp://h", Role::Both)
            .with_read_timeout(Duration::from_millis(100));
        let mut conn = Connection::handshake(stream, &options).await.unwrap();

        let err = conn.request(&Command::Info).await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert!(!conn.is_usable());
        let err = conn.request(&Command::Info).await.unwrap_err();
        assert!(err.is_transport());
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (mut server, stream) = ScriptedServer::start(HI, |_| Answer::Ok);
        let mut conn = open(stream, "tcp://h", Role::Both).await.unwrap();
        conn.close().await;
        conn.close().await;
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        server.finished().await;
        assert_eq!(server.commands().last().unwrap(), "END");
    }
}
