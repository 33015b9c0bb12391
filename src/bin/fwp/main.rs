mod args;

use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use faktory_client::{
    ClientOptions, ConsumerBuilder, Handler, Job, Producer, Role, ServerUrl,
};
use serde_json::Value;
use tracing::{error, info, Level};
use tracing_subscriber::EnvFilter;

use crate::args::{Args, Cmd, QueueAction, WorkArgs};

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Logging
    let level = if args.debug { Level::TRACE } else { Level::INFO };
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();
    if args.debug {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    }

    if let Err(error) = begin(args).await {
        error!(error = format!("{error:#}"), "encountered runtime error");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

async fn begin(args: Args) -> Result<()> {
    let role = match args.command {
        Cmd::Work(_) => Role::Consumer,
        _ => Role::Producer,
    };
    let options = match &args.url {
        Some(url) => {
            let url = ServerUrl::parse(url).context("parsing --url")?;
            ClientOptions::new(url, role)
        },
        None => ClientOptions::from_env(role)
            .context("reading server URL from environment")?,
    };

    match args.command {
        Cmd::Push {
            jobtype,
            args,
            queue,
            priority,
            retry,
            at,
        } => {
            let args: Vec<Value> = serde_json::from_str(&args)
                .context("job arguments must be a JSON array")?;
            let mut job = Job::builder(jobtype).args(args).queue(queue);
            if let Some(priority) = priority {
                job = job.priority(priority);
            }
            if let Some(retry) = retry {
                job = job.retry(retry);
            }
            if let Some(at) = at {
                job = job.at_rfc3339(&at);
            }
            let job = job.build().context("invalid job")?;

            let producer = connect(options).await?;
            let pushed = producer.push(&job).await.context("pushing job");
            producer.client().close().await;
            pushed?;
            println!("{}", job.jid());
        },
        Cmd::Info => {
            let producer = connect(options).await?;
            let info = producer.info().await.context("fetching INFO");
            producer.client().close().await;
            println!("{}", serde_json::to_string_pretty(info?.as_value())?);
        },
        Cmd::Queue { action } => {
            let producer = connect(options).await?;
            let done = match &action {
                QueueAction::Pause { queues } => {
                    producer.queue_pause(&borrowed(queues)).await
                },
                QueueAction::Resume { queues } => {
                    producer.queue_resume(&borrowed(queues)).await
                },
                QueueAction::Remove { queues } => {
                    producer.queue_remove(&borrowed(queues)).await
                },
            };
            producer.client().close().await;
            done.with_context(|| format!("{action:?}"))?;
        },
        Cmd::Work(work) => run_worker(options, work).await?,
    }

    Ok(())
}

async fn run_worker(options: ClientOptions, work: WorkArgs) -> Result<()> {
    let options = if work.labels.is_empty() {
        options
    } else {
        options.with_labels(work.labels)
    };

    let mut builder = ConsumerBuilder::new()
        .queues(work.queues)
        .priority(work.priority)
        .concurrency(work.concurrency)
        .grace(Duration::from_secs(work.grace));
    if !work.weights.is_empty() {
        builder = builder.weights(work.weights);
    }
    for (jobtype, program) in work.handlers {
        builder = builder.register(jobtype, Handler::command(program));
    }

    let consumer = builder.connect(options).await.context("starting worker")?;
    info!(wid = consumer.client().wid(), "worker started");
    consumer.run().await.context("worker stopped")
}

async fn connect(options: ClientOptions) -> Result<Producer> {
    Producer::connect(options).await.context("connecting")
}

fn borrowed(queues: &[String]) -> Vec<&str> {
    queues.iter().map(String::as_str).collect()
}
