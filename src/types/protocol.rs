use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::batch::Batch;
use super::job::Job;
use super::mutate::MutateOperation;
use super::serialisable::FwpSerialisable;
use super::states::Role;
use crate::error::{Error, Result};

/// The protocol revision this client speaks.
pub const PROTOCOL_VERSION: u32 = 2;

/// A command sent by the client to the server.
#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    /// Identifies the client, answering the server's `HI`.
    ///
    /// On the wire: `HELLO {...}`
    Hello(Hello),
    /// Wipes all server state.
    ///
    /// On the wire: `FLUSH`
    Flush,
    /// Asks for a JSON snapshot of server statistics.
    ///
    /// On the wire: `INFO`
    Info,
    /// Says goodbye; the server closes the connection without replying.
    ///
    /// On the wire: `END`
    End,
    /// Enqueues one job.
    ///
    /// On the wire: `PUSH {job}`
    Push(Job),
    /// Enqueues many jobs in one round trip. The server answers with the
    /// jids it rejected, if any.
    ///
    /// On the wire: `PUSHB [{job}, ...]`
    PushBulk(Vec<Job>),
    /// Reserves the next job from the first non-empty queue, in the order
    /// given. Blocks for up to two seconds server-side when all are empty.
    ///
    /// On the wire: `FETCH <queue> [<queue> ...]`
    Fetch { queues: Vec<String> },
    /// Reports a job as done.
    ///
    /// On the wire: `ACK {"jid":...}`
    Ack { jid: String },
    /// Reports a job as failed.
    ///
    /// On the wire: `FAIL {"jid":...,"errtype":...,"message":...,"backtrace":[...]}`
    Fail(FailReport),
    /// Proves this worker is alive and picks up control signals.
    ///
    /// On the wire: `BEAT {"wid":...}`
    Beat(Beat),
    /// Bulk-changes the scheduled, retry or dead set.
    ///
    /// On the wire: `MUTATE {"cmd":...,"target":...,"filter":{...}}`
    Mutate(MutateOperation),
    /// On the wire: `BATCH NEW {...}`, answered with `+<bid>`.
    BatchNew(Batch),
    /// Reopens a committed batch to add jobs.
    ///
    /// On the wire: `BATCH OPEN <bid>`
    BatchOpen { bid: String },
    /// On the wire: `BATCH COMMIT <bid>`
    BatchCommit { bid: String },
    /// On the wire: `BATCH STATUS <bid>`
    BatchStatus { bid: String },
    /// On the wire: `QUEUE REMOVE <queue> [<queue> ...]`
    QueueRemove { queues: Vec<String> },
    /// On the wire: `QUEUE PAUSE <queue> [<queue> ...]`
    QueuePause { queues: Vec<String> },
    /// On the wire: `QUEUE RESUME <queue> [<queue> ...]`
    QueueResume { queues: Vec<String> },
}

impl Command {
    /// The command's verb, safe to log.
    pub fn verb(&self) -> &'static str {
        use Command::*;

        match self {
            Hello(_) => "HELLO",
            Flush => "FLUSH",
            Info => "INFO",
            End => "END",
            Push(_) => "PUSH",
            PushBulk(_) => "PUSHB",
            Fetch { .. } => "FETCH",
            Ack { .. } => "ACK",
            Fail(_) => "FAIL",
            Beat(_) => "BEAT",
            Mutate(_) => "MUTATE",
            BatchNew(_) => "BATCH NEW",
            BatchOpen { .. } => "BATCH OPEN",
            BatchCommit { .. } => "BATCH COMMIT",
            BatchStatus { .. } => "BATCH STATUS",
            QueueRemove { .. } => "QUEUE REMOVE",
            QueuePause { .. } => "QUEUE PAUSE",
            QueueResume { .. } => "QUEUE RESUME",
        }
    }

    /// Which side of the protocol may issue this command, or `None` if any
    /// client may.
    pub fn required_role(&self) -> Option<Role> {
        use Command::*;

        match self {
            Push(_) | PushBulk(_) | BatchNew(_) | BatchOpen { .. }
            | BatchCommit { .. } => Some(Role::Producer),
            Fetch { .. } | Ack { .. } | Fail(_) | Beat(_) => {
                Some(Role::Consumer)
            },
            _ => None,
        }
    }
}

impl FwpSerialisable for Command {
    fn serialise_fwp(&self) -> Result<Vec<u8>> {
        use Command::*;

        let mut line = self.verb().as_bytes().to_vec();
        let mut arg = |a: &[u8]| {
            line.push(b' ');
            line.extend_from_slice(a);
        };

        match self {
            Flush | Info | End => {},
            Hello(hello) => arg(&serde_json::to_vec(hello)?),
            Push(job) => arg(&serde_json::to_vec(job)?),
            PushBulk(jobs) => arg(&serde_json::to_vec(jobs)?),
            Fetch { queues }
            | QueueRemove { queues }
            | QueuePause { queues }
            | QueueResume { queues } => {
                for q in queues {
                    arg(q.as_bytes());
                }
            },
            Ack { jid } => {
                arg(&serde_json::to_vec(&serde_json::json!({ "jid": jid }))?)
            },
            Fail(report) => arg(&serde_json::to_vec(report)?),
            Beat(beat) => arg(&serde_json::to_vec(beat)?),
            Mutate(op) => arg(&serde_json::to_vec(op)?),
            BatchNew(batch) => arg(&serde_json::to_vec(batch)?),
            BatchOpen { bid } | BatchCommit { bid } | BatchStatus { bid } => {
                arg(bid.as_bytes())
            },
        }

        line.extend_from_slice(b"\r\n");
        Ok(line)
    }
}

/// The server's greeting: `+HI {"v":2,"i":<iterations>,"s":"<salt>"}`.
/// Iterations and salt are only present when a password is required.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize)]
pub struct Hi {
    pub v: u32,
    #[serde(default, rename = "i")]
    pub iterations: Option<u32>,
    #[serde(default, rename = "s")]
    pub salt: Option<String>,
}

impl Hi {
    pub fn parse(text: &str) -> Result<Self> {
        let payload = text.strip_prefix("HI ").ok_or_else(|| {
            Error::protocol(format!("expected HI greeting, got {text:?}"))
        })?;
        Ok(serde_json::from_str(payload)?)
    }

    /// The challenge, if the server wants a password.
    pub fn challenge(&self) -> Option<(u32, &str)> {
        match (self.iterations, &self.salt) {
            (Some(i), Some(s)) => Some((i, s.as_str())),
            _ => None,
        }
    }
}

/// Payload of `HELLO`. Worker fields are only sent by consumers.
#[derive(Clone, PartialEq, Serialize)]
pub struct Hello {
    pub v: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pwdhash: Option<String>,
}

// Hand-written so the password hash never reaches a log line.
impl std::fmt::Debug for Hello {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hello")
            .field("v", &self.v)
            .field("hostname", &self.hostname)
            .field("wid", &self.wid)
            .field("pid", &self.pid)
            .field("labels", &self.labels)
            .field("pwdhash", &self.pwdhash.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Payload of `FAIL`.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct FailReport {
    pub jid: String,
    pub errtype: String,
    pub message: String,
    pub backtrace: Vec<String>,
}

/// Payload of `BEAT`.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct Beat {
    pub wid: String,
    /// Set once the worker is winding down, so the server's UI can show it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_state: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rss_kb: Option<u64>,
}

/// What the server wants a worker to do, per its `BEAT` reply.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BeatState {
    Ok,
    Quiet,
    Terminate,
}

impl BeatState {
    /// Interprets a `BEAT` reply: `+OK`, or a bulk `{"state": ...}`.
    pub fn from_reply(reply: Reply) -> Result<Self> {
        #[derive(Deserialize)]
        struct StatePayload {
            state: BeatState,
        }

        match reply {
            Reply::Simple(s) if s == "OK" => Ok(BeatState::Ok),
            Reply::Bulk(Some(body)) => {
                Ok(serde_json::from_slice::<StatePayload>(&body)?.state)
            },
            other => Err(Error::protocol(format!(
                "unexpected BEAT reply {other:?}"
            ))),
        }
    }
}

/// A successful reply. Error replies never get this far: they become
/// [`Error::Server`] in the connection.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Reply {
    Simple(String),
    /// `None` is the nil bulk, e.g. FETCH finding no job.
    Bulk(Option<Bytes>),
}

impl Reply {
    /// Insists on `+OK`.
    pub fn expect_ok(self) -> Result<()> {
        match self {
            Reply::Simple(s) if s == "OK" => Ok(()),
            other => {
                Err(Error::protocol(format!("expected +OK, got {other:?}")))
            },
        }
    }

    /// Insists on a non-nil bulk body.
    pub fn expect_bulk(self) -> Result<Bytes> {
        match self {
            Reply::Bulk(Some(body)) => Ok(body),
            other => Err(Error::protocol(format!(
                "expected a bulk reply, got {other:?}"
            ))),
        }
    }
}

/// Jids the server refused in a `PUSHB`, with its reasons.
pub(crate) fn parse_push_bulk_reply(
    reply: Reply,
) -> Result<BTreeMap<String, String>> {
    match reply {
        Reply::Simple(s) if s == "OK" => Ok(BTreeMap::new()),
        Reply::Bulk(Some(body)) => Ok(serde_json::from_slice(&body)?),
        other => Err(Error::protocol(format!(
            "unexpected PUSHB reply {other:?}"
        ))),
    }
}

/// A read-only snapshot returned by `INFO`.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(transparent)]
pub struct ServerInfo(Value);

impl ServerInfo {
    pub fn as_value(&self) -> &Value {
        &self.0
    }

    /// Looks up a value by JSON pointer, e.g. `/faktory/total_processed`.
    pub fn get(&self, pointer: &str) -> Option<&Value> {
        self.0.pointer(pointer)
    }

    pub fn version(&self) -> Option<&str> {
        self.get("/server/faktory_version").and_then(Value::as_str)
    }

    /// Size of each known queue.
    pub fn queue_sizes(&self) -> BTreeMap<String, u64> {
        self.get("/faktory/queues")
            .and_then(Value::as_object)
            .map(|queues| {
                queues
                    .iter()
                    .filter_map(|(name, n)| Some((name.clone(), n.as_u64()?)))
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::types::mutate::{MutateCommand, MutateTarget};

    #[track_caller]
    fn wire(cmd: Command) -> String {
        String::from_utf8(cmd.serialise_fwp().unwrap()).unwrap()
    }

    #[test]
    fn test_serialise_commands() {
        assert_eq!(wire(Command::Info), "INFO\r\n");
        assert_eq!(wire(Command::End), "END\r\n");
        assert_eq!(
            wire(Command::Fetch {
                queues: vec!["critical".into(), "default".into()]
            }),
            "FETCH critical default\r\n"
        );
        assert_eq!(
            wire(Command::Ack { jid: "j1".into() }),
            "ACK {\"jid\":\"j1\"}\r\n"
        );
        assert_eq!(
            wire(Command::Fail(FailReport {
                jid: "j1".into(),
                errtype: "Boom".into(),
                message: "it broke".into(),
                backtrace: vec!["a.rs:1".into()],
            })),
            concat!(
                r#"FAIL {"jid":"j1","errtype":"Boom","message":"it broke","#,
                r#""backtrace":["a.rs:1"]}"#,
                "\r\n",
            )
        );
        assert_eq!(
            wire(Command::Beat(Beat {
                wid: "w12345678".into(),
                current_state: Some("quiet"),
                rss_kb: None,
            })),
            "BEAT {\"wid\":\"w12345678\",\"current_state\":\"quiet\"}\r\n"
        );
        assert_eq!(
            wire(Command::Mutate(MutateOperation::new(
                MutateCommand::Discard,
                MutateTarget::Scheduled
            ))),
            "MUTATE {\"cmd\":\"discard\",\"target\":\"scheduled\"}\r\n"
        );
        assert_eq!(
            wire(Command::BatchCommit { bid: "b-1".into() }),
            "BATCH COMMIT b-1\r\n"
        );
        assert_eq!(
            wire(Command::QueuePause {
                queues: vec!["*".into()]
            }),
            "QUEUE PAUSE *\r\n"
        );
        assert_eq!(
            wire(Command::Push(Job::builder("t").jid("j").build().unwrap())),
            "PUSH {\"jid\":\"j\",\"jobtype\":\"t\",\"args\":[]}\r\n"
        );
    }

    #[test]
    fn hello_omits_worker_fields_for_producers() {
        let hello = Hello {
            v: PROTOCOL_VERSION,
            hostname: None,
            wid: None,
            pid: None,
            labels: vec![],
            pwdhash: Some("abc".into()),
        };
        assert_eq!(
            wire(Command::Hello(hello.clone())),
            "HELLO {\"v\":2,\"pwdhash\":\"abc\"}\r\n"
        );
        assert!(!format!("{hello:?}").contains("abc"));
    }

    #[test]
    fn roles() {
        assert_eq!(
            Command::Push(Job::new("t", [1])).required_role(),
            Some(Role::Producer)
        );
        assert_eq!(
            Command::Ack { jid: "j".into() }.required_role(),
            Some(Role::Consumer)
        );
        assert_eq!(Command::Info.required_role(), None);
    }

    #[test]
    fn hi_greeting() {
        let hi = Hi::parse("HI {\"v\":2}").unwrap();
        assert_eq!(hi.v, 2);
        assert!(hi.challenge().is_none());

        let hi = Hi::parse("HI {\"v\":2,\"i\":1735,\"s\":\"13c8b8\"}").unwrap();
        assert_eq!(hi.challenge(), Some((1735, "13c8b8")));

        assert!(Hi::parse("HELLO").is_err());
        assert!(Hi::parse("HI {").is_err());
    }

    #[test]
    fn beat_replies() {
        assert_eq!(
            BeatState::from_reply(Reply::Simple("OK".into())).unwrap(),
            BeatState::Ok
        );
        assert_eq!(
            BeatState::from_reply(Reply::Bulk(Some(Bytes::from_static(
                b"{\"state\":\"quiet\"}"
            ))))
            .unwrap(),
            BeatState::Quiet
        );
        assert_eq!(
            BeatState::from_reply(Reply::Bulk(Some(Bytes::from_static(
                b"{\"state\":\"terminate\"}"
            ))))
            .unwrap(),
            BeatState::Terminate
        );
        assert!(BeatState::from_reply(Reply::Bulk(Some(Bytes::from_static(
            b"{\"state\":\"dance\"}"
        ))))
        .is_err());
        assert!(BeatState::from_reply(Reply::Bulk(None)).is_err());
    }

    #[test]
    fn push_bulk_replies() {
        assert!(parse_push_bulk_reply(Reply::Simple("OK".into()))
            .unwrap()
            .is_empty());
        let rejected = parse_push_bulk_reply(Reply::Bulk(Some(
            Bytes::from_static(b"{\"j2\":\"jobtype is blank\"}"),
        )))
        .unwrap();
        assert_eq!(rejected["j2"], "jobtype is blank");
    }

    #[test]
    fn info_accessors() {
        let info: ServerInfo = serde_json::from_str(
            r#"{"faktory":{"queues":{"default":3,"critical":0}},
                "server":{"faktory_version":"1.9.0"}}"#,
        )
        .unwrap();
        assert_eq!(info.version(), Some("1.9.0"));
        assert_eq!(info.queue_sizes()["default"], 3);
        assert!(info.get("/nope").is_none());
    }
}
