use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{Error, Result};

pub const DEFAULT_QUEUE: &str = "default";
pub const DEFAULT_PRIORITY: u8 = 5;
pub const DEFAULT_RETRY: i32 = 25;
pub const DEFAULT_RESERVE_FOR: u32 = 1800;
pub const MIN_RESERVE_FOR: u32 = 60;
pub const MAX_QUEUE_NAME_LEN: usize = 200;

/// Key under `custom` that ties a job to a batch.
const BID_KEY: &str = "bid";

/// A unit of work.
///
/// A job is built and validated by the producer, then owned by the server once
/// pushed. On the consumer side it is decoded from a FETCH reply and dropped
/// as soon as its ACK or FAIL has been sent. The fields a caller sets are
/// immutable after construction; use [`Job::builder`] to set anything beyond
/// the job type and arguments.
///
/// Only optional fields that differ from the server's defaults are put on the
/// wire.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Job {
    jid: String,
    jobtype: String,
    #[serde(default)]
    args: Vec<Value>,
    #[serde(
        default = "default_queue",
        skip_serializing_if = "is_default_queue"
    )]
    queue: String,
    #[serde(
        default = "default_priority",
        skip_serializing_if = "is_default_priority"
    )]
    priority: u8,
    #[serde(
        default = "default_retry",
        skip_serializing_if = "is_default_retry"
    )]
    retry: i32,
    #[serde(
        default = "default_reserve_for",
        skip_serializing_if = "is_default_reserve_for"
    )]
    reserve_for: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "is_zero")]
    backtrace: u32,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    custom: Map<String, Value>,

    // Populated by the server; never sent by a producer.
    #[serde(default, skip_serializing)]
    created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing)]
    enqueued_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing)]
    failure: Option<Failure>,
}

/// Details of the last failed attempt, as reported by the server.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub failed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub next_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default, rename = "errtype")]
    pub kind: Option<String>,
    #[serde(default)]
    pub backtrace: Vec<String>,
}

fn default_queue() -> String {
    DEFAULT_QUEUE.to_owned()
}
fn is_default_queue(q: &String) -> bool {
    q == DEFAULT_QUEUE
}
fn default_priority() -> u8 {
    DEFAULT_PRIORITY
}
fn is_default_priority(p: &u8) -> bool {
    *p == DEFAULT_PRIORITY
}
fn default_retry() -> i32 {
    DEFAULT_RETRY
}
fn is_default_retry(r: &i32) -> bool {
    *r == DEFAULT_RETRY
}
fn default_reserve_for() -> u32 {
    DEFAULT_RESERVE_FOR
}
fn is_default_reserve_for(r: &u32) -> bool {
    *r == DEFAULT_RESERVE_FOR
}
fn is_zero(n: &u32) -> bool {
    *n == 0
}

/// Generates a fresh job id.
pub fn new_jid() -> String {
    Uuid::new_v4().simple().to_string()
}

impl Job {
    /// A job with a fresh jid and default options. It is validated when
    /// pushed.
    pub fn new<A>(jobtype: impl Into<String>, args: A) -> Self
    where
        A: IntoIterator,
        A::Item: Into<Value>,
    {
        Self {
            jid: new_jid(),
            jobtype: jobtype.into(),
            args: args.into_iter().map(Into::into).collect(),
            queue: default_queue(),
            priority: DEFAULT_PRIORITY,
            retry: DEFAULT_RETRY,
            reserve_for: DEFAULT_RESERVE_FOR,
            at: None,
            backtrace: 0,
            custom: Map::new(),
            created_at: None,
            enqueued_at: None,
            failure: None,
        }
    }

    pub fn builder(jobtype: impl Into<String>) -> JobBuilder {
        JobBuilder {
            job: Job::new(jobtype, Vec::<Value>::new()),
            at_error: None,
        }
    }

    pub fn jid(&self) -> &str {
        &self.jid
    }
    pub fn jobtype(&self) -> &str {
        &self.jobtype
    }
    pub fn args(&self) -> &[Value] {
        &self.args
    }
    pub fn queue(&self) -> &str {
        &self.queue
    }
    pub fn priority(&self) -> u8 {
        self.priority
    }
    pub fn retry(&self) -> i32 {
        self.retry
    }
    pub fn reserve_for(&self) -> u32 {
        self.reserve_for
    }
    pub fn at(&self) -> Option<DateTime<Utc>> {
        self.at
    }
    /// How many backtrace lines the server keeps when this job fails.
    pub fn backtrace(&self) -> u32 {
        self.backtrace
    }
    pub fn custom(&self) -> &Map<String, Value> {
        &self.custom
    }
    /// The batch this job belongs to, if any.
    pub fn bid(&self) -> Option<&str> {
        self.custom.get(BID_KEY).and_then(Value::as_str)
    }
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created_at
    }
    pub fn enqueued_at(&self) -> Option<DateTime<Utc>> {
        self.enqueued_at
    }
    pub fn failure(&self) -> Option<&Failure> {
        self.failure.as_ref()
    }

    /// Checks everything the server would otherwise reject, without touching
    /// the network.
    pub fn validate(&self) -> Result<()> {
        if self.jid.is_empty() {
            return Err(Error::validation("jid must not be empty"));
        }
        if self.jobtype.is_empty() {
            return Err(Error::validation("jobtype must not be empty"));
        }
        validate_queue_name(&self.queue)?;
        if !(1..=9).contains(&self.priority) {
            return Err(Error::validation(format!(
                "priority {} is outside 1..=9",
                self.priority
            )));
        }
        if self.retry < -1 {
            return Err(Error::validation(format!(
                "retry {} must be -1 or greater",
                self.retry
            )));
        }
        if self.reserve_for < MIN_RESERVE_FOR {
            return Err(Error::validation(format!(
                "reserve_for {} must be at least {MIN_RESERVE_FOR}",
                self.reserve_for
            )));
        }
        Ok(())
    }

    /// The canonical wire payload.
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parses a FETCH payload.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let job: Job = serde_json::from_slice(payload)?;
        if job.jid.is_empty() || job.jobtype.is_empty() {
            return Err(Error::protocol("fetched job lacks a jid or jobtype"));
        }
        Ok(job)
    }
}

/// Queue names are limited to ASCII alphanumerics plus `.`, `_` and `-`.
pub fn validate_queue_name(name: &str) -> Result<()> {
    fn char_is_name_safe(c: u8) -> bool {
        c.is_ascii_alphanumeric() || matches!(c, b'.' | b'_' | b'-')
    }

    if !name.is_empty()
        && name.len() <= MAX_QUEUE_NAME_LEN
        && name.bytes().all(char_is_name_safe)
    {
        Ok(())
    } else {
        Err(Error::validation(format!("invalid queue name {name:?}")))
    }
}

/// Sets the optional fields of a [`Job`]. `build` validates the result.
#[derive(Clone, Debug)]
pub struct JobBuilder {
    job: Job,
    at_error: Option<String>,
}

impl JobBuilder {
    pub fn jid(mut self, jid: impl Into<String>) -> Self {
        self.job.jid = jid.into();
        self
    }

    pub fn args<A>(mut self, args: A) -> Self
    where
        A: IntoIterator,
        A::Item: Into<Value>,
    {
        self.job.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.job.queue = queue.into();
        self
    }

    pub fn priority(mut self, priority: u8) -> Self {
        self.job.priority = priority;
        self
    }

    pub fn retry(mut self, retry: i32) -> Self {
        self.job.retry = retry;
        self
    }

    pub fn reserve_for(mut self, seconds: u32) -> Self {
        self.job.reserve_for = seconds;
        self
    }

    pub fn at(mut self, at: DateTime<Utc>) -> Self {
        self.job.at = Some(at);
        self
    }

    /// Like [`JobBuilder::at`], from an RFC 3339 timestamp. A malformed
    /// timestamp is reported by `build`.
    pub fn at_rfc3339(mut self, at: &str) -> Self {
        match DateTime::parse_from_rfc3339(at) {
            Ok(at) => self.job.at = Some(at.with_timezone(&Utc)),
            Err(e) => self.at_error = Some(format!("at {at:?}: {e}")),
        }
        self
    }

    pub fn backtrace(mut self, lines: u32) -> Self {
        self.job.backtrace = lines;
        self
    }

    pub fn custom(
        mut self,
        key: impl Into<String>,
        value: impl Into<Value>,
    ) -> Self {
        self.job.custom.insert(key.into(), value.into());
        self
    }

    /// Makes the job a member of a batch.
    pub fn bid(self, bid: impl Into<String>) -> Self {
        self.custom(BID_KEY, bid.into())
    }

    pub fn build(self) -> Result<Job> {
        if let Some(e) = self.at_error {
            return Err(Error::Validation(e));
        }
        self.job.validate()?;
        Ok(self.job)
    }
}
