use std::collections::BTreeSet;
use std::fmt;

use serde::Serialize;

use crate::error::{Error, Result};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MutateCommand {
    /// Remove matching jobs from the target set.
    Clear,
    /// Delete matching jobs.
    Discard,
    /// Move matching jobs to the dead set.
    Kill,
    /// Enqueue matching jobs for immediate execution.
    Requeue,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MutateTarget {
    Scheduled,
    Retries,
    Dead,
}

impl fmt::Display for MutateTarget {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Self::Scheduled => "scheduled",
            Self::Retries => "retries",
            Self::Dead => "dead",
        })
    }
}

/// Narrows a mutation to some jobs of the target set.
///
/// Every discriminator is optional and they combine with AND. A filter with
/// none of them set matches the *whole* target set: `Requeue` of `Dead` with
/// an empty filter resurrects every dead job.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct JobFilter {
    #[serde(skip_serializing_if = "BTreeSet::is_empty")]
    pub jids: BTreeSet<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jobtype: Option<String>,
    /// A server-side match pattern over the raw job payload, in the glob
    /// dialect of Redis `SCAN MATCH`: `*`, `?`, `[...]` classes and `\`
    /// escapes, e.g. `*"queue":"mailer"*`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub regexp: Option<String>,
}

impl JobFilter {
    pub fn jids<I, S>(jids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            jids: jids.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn jobtype(jobtype: impl Into<String>) -> Self {
        Self {
            jobtype: Some(jobtype.into()),
            ..Default::default()
        }
    }

    pub fn pattern(pattern: impl Into<String>) -> Self {
        Self {
            regexp: Some(pattern.into()),
            ..Default::default()
        }
    }

    pub fn is_unconstrained(&self) -> bool {
        self.jids.is_empty() && self.jobtype.is_none() && self.regexp.is_none()
    }

    pub fn validate(&self) -> Result<()> {
        if self.jids.iter().any(String::is_empty) {
            return Err(Error::validation("filter contains an empty jid"));
        }
        if self.jobtype.as_deref() == Some("") {
            return Err(Error::validation("filter jobtype is empty"));
        }
        if let Some(pattern) = &self.regexp {
            validate_pattern(pattern)?;
        }
        Ok(())
    }
}

/// Checks a match pattern is structurally sound: every `[` class is closed
/// and no `\` escape dangles at the end.
fn validate_pattern(pattern: &str) -> Result<()> {
    if pattern.is_empty() {
        return Err(Error::validation("filter pattern is empty"));
    }

    let mut chars = pattern.chars();
    let mut in_class = false;
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if chars.next().is_none() {
                    return Err(Error::validation(format!(
                        "filter pattern {pattern:?} ends in a bare escape"
                    )));
                }
            },
            '[' if !in_class => in_class = true,
            ']' if in_class => in_class = false,
            _ => {},
        }
    }

    if in_class {
        Err(Error::validation(format!(
            "filter pattern {pattern:?} has an unclosed character class"
        )))
    } else {
        Ok(())
    }
}

/// An administrative bulk change to one of the server's sorted sets.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct MutateOperation {
    pub cmd: MutateCommand,
    pub target: MutateTarget,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<JobFilter>,
}

impl MutateOperation {
    pub fn new(cmd: MutateCommand, target: MutateTarget) -> Self {
        Self {
            cmd,
            target,
            filter: None,
        }
    }

    pub fn filtered(mut self, filter: JobFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn validate(&self) -> Result<()> {
        match &self.filter {
            Some(filter) => filter.validate(),
            None => Ok(()),
        }
    }
}
