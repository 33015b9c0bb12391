use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::types::job::{validate_queue_name, Job, DEFAULT_QUEUE};

/// The callback job a batch enqueues once its members succeed or complete.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TargetJob {
    pub jobtype: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default = "default_queue")]
    pub queue: String,
}

fn default_queue() -> String {
    DEFAULT_QUEUE.to_owned()
}

impl TargetJob {
    pub fn new<A>(jobtype: impl Into<String>, args: A) -> Self
    where
        A: IntoIterator,
        A::Item: Into<Value>,
    {
        Self {
            jobtype: jobtype.into(),
            args: args.into_iter().map(Into::into).collect(),
            queue: default_queue(),
        }
    }

    pub fn on_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    fn validate(&self) -> Result<()> {
        // Same rules as any other job.
        Job::builder(self.jobtype.as_str())
            .args(self.args.iter().cloned())
            .queue(self.queue.as_str())
            .build()
            .map(drop)
    }
}

/// A group of jobs with aggregate callbacks. The bid is assigned by the
/// server on `BATCH NEW`; a batch that is never committed expires server-side
/// after 30 minutes.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_bid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<TargetJob>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub complete: Option<TargetJob>,
}

impl Batch {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: Some(description.into()),
            ..Default::default()
        }
    }

    pub fn with_parent(mut self, bid: impl Into<String>) -> Self {
        self.parent_bid = Some(bid.into());
        self
    }

    pub fn on_success(mut self, job: TargetJob) -> Self {
        self.success = Some(job);
        self
    }

    pub fn on_complete(mut self, job: TargetJob) -> Self {
        self.complete = Some(job);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(job) = &self.success {
            job.validate()?;
        }
        if let Some(job) = &self.complete {
            job.validate()?;
        }
        if let Some(parent) = &self.parent_bid {
            if parent.is_empty() {
                return Err(crate::Error::validation("parent_bid is empty"));
            }
        }
        Ok(())
    }
}

/// The server's view of a batch, from `BATCH STATUS`.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct BatchStatus {
    pub bid: String,
    #[serde(default)]
    pub parent_bid: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub pending: u64,
    #[serde(default)]
    pub failed: u64,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    /// State of the complete callback, e.g. `""`, `"1"` (enqueued), `"2"`
    /// (finished).
    #[serde(default, rename = "complete_st")]
    pub complete_state: String,
    #[serde(default, rename = "success_st")]
    pub success_state: String,
}

pub(crate) fn validate_bid(bid: &str) -> Result<()> {
    if bid.is_empty() || bid.contains(char::is_whitespace) {
        Err(crate::Error::validation(format!("invalid bid {bid:?}")))
    } else {
        Ok(())
    }
}

pub(crate) fn validate_queue_list(queues: &[&str]) -> Result<()> {
    if queues.is_empty() {
        return Err(crate::Error::validation("no queues given"));
    }
    queues.iter().try_for_each(|q| {
        // `*` addresses every queue in the QUEUE commands.
        if *q == "*" {
            Ok(())
        } else {
            validate_queue_name(q)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    #[test]
    fn batch_payload_omits_unset_fields() {
        let batch = Batch::new("nightly")
            .on_success(TargetJob::new("report", ["ok"]).on_queue("reports"));
        assert_eq!(
            serde_json::to_value(&batch).unwrap(),
            json!({
                "description": "nightly",
                "success": {
                    "jobtype": "report",
                    "args": ["ok"],
                    "queue": "reports",
                },
            })
        );
    }

    #[test]
    fn callbacks_are_validated() {
        let batch = Batch::new("x").on_complete(TargetJob::new("", [1]));
        assert!(batch.validate().is_err());
        let target = TargetJob::new("t", [1]).on_queue("no way");
        let batch = Batch::new("x").on_complete(target);
        assert!(batch.validate().is_err());
        assert!(Batch::new("x").with_parent("b-1").validate().is_ok());
    }

    #[test]
    fn status_decodes() {
        let status: BatchStatus = serde_json::from_str(
            r#"{"bid":"b-1","total":3,"pending":1,"failed":0,
                "created_at":"2024-05-01T10:00:00Z",
                "complete_st":"","success_st":"1"}"#,
        )
        .unwrap();
        assert_eq!(status.total, 3);
        assert_eq!(status.success_state, "1");
    }

    #[test]
    fn queue_lists() {
        assert!(validate_queue_list(&[]).is_err());
        assert!(validate_queue_list(&["*"]).is_ok());
        assert!(validate_queue_list(&["a", "b c"]).is_err());
        assert!(validate_bid("b 1").is_err());
    }
}
