use std::path::PathBuf;

use clap::{Parser, Subcommand};
use faktory_client::consumer::{DEFAULT_CONCURRENCY, DEFAULT_GRACE};
use faktory_client::types::job::DEFAULT_QUEUE;
use faktory_client::Priority;

#[derive(Parser, Debug)]
#[command(about, long_about = None, version)]
pub(crate) struct Args {
    /// Server URL, e.g. tcp://:password@localhost:7419. Taken from the
    /// environment when not given.
    #[arg(short, long, global = true)]
    pub(crate) url: Option<String>,
    /// Enables human-friendly logging.
    #[arg(short, long, default_value_t, global = true)]
    pub(crate) debug: bool,
    #[command(subcommand)]
    pub(crate) command: Cmd,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Cmd {
    /// Pushes one job and prints its jid.
    Push {
        jobtype: String,
        /// Job arguments as a JSON array.
        #[arg(default_value = "[]")]
        args: String,
        #[arg(short, long, default_value = DEFAULT_QUEUE)]
        queue: String,
        #[arg(short, long)]
        priority: Option<u8>,
        /// Remaining retries; -1 sends failures straight to the dead set.
        #[arg(short, long, allow_negative_numbers = true)]
        retry: Option<i32>,
        /// Schedules the job for later (RFC 3339).
        #[arg(long)]
        at: Option<String>,
    },
    /// Prints the server's INFO snapshot.
    Info,
    /// Queue administration.
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },
    /// Runs a worker whose jobs are handled by external programs.
    Work(WorkArgs),
}

#[derive(Subcommand, Debug)]
pub(crate) enum QueueAction {
    /// Stops the queues being fetched from.
    Pause {
        #[arg(required = true)]
        queues: Vec<String>,
    },
    Resume {
        #[arg(required = true)]
        queues: Vec<String>,
    },
    /// Deletes every job in the queues; `*` means all queues.
    Remove {
        #[arg(required = true)]
        queues: Vec<String>,
    },
}

#[derive(clap::Args, Debug)]
pub(crate) struct WorkArgs {
    /// Queue to fetch from; repeat for several.
    #[arg(short, long = "queue", default_value = DEFAULT_QUEUE)]
    pub(crate) queues: Vec<String>,
    /// strict, uniform or weighted.
    #[arg(short, long, default_value_t = Priority::Uniform)]
    pub(crate) priority: Priority,
    /// Queue weight for weighted priority, in --queue order.
    #[arg(short, long = "weight")]
    pub(crate) weights: Vec<f64>,
    #[arg(short, long, default_value_t = DEFAULT_CONCURRENCY)]
    pub(crate) concurrency: usize,
    /// Seconds in-flight jobs get to finish on shutdown.
    #[arg(short, long, default_value_t = DEFAULT_GRACE.as_secs())]
    pub(crate) grace: u64,
    /// Label shown against the worker; repeat for several.
    #[arg(short, long = "label")]
    pub(crate) labels: Vec<String>,
    /// JOBTYPE=PROGRAM: run PROGRAM for each job of JOBTYPE.
    #[arg(long = "handler", value_parser = parse_handler, required = true)]
    pub(crate) handlers: Vec<(String, PathBuf)>,
}

fn parse_handler(s: &str) -> Result<(String, PathBuf), String> {
    match s.split_once('=') {
        Some((jobtype, program))
            if !jobtype.is_empty() && !program.is_empty() =>
        {
            Ok((jobtype.to_owned(), PathBuf::from(program)))
        },
        _ => Err(format!("expected JOBTYPE=PROGRAM, got {s:?}")),
    }
}
