//! A client for the Faktory work server.
//!
//! [`Producer`] submits jobs and batches and administers queues; [`Consumer`]
//! fetches jobs, runs them through registered [`Handler`]s and reports the
//! outcome, heartbeating all the while. Both sit on a [`Client`], which owns
//! the connection and speaks the line protocol.
pub mod client;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod error;
pub mod line_reader;
pub mod parser;
pub mod producer;
pub mod types;
pub mod util;

#[cfg(test)]
mod testing;
mod tls;

pub use crate::client::Client;
pub use crate::config::{ClientOptions, ServerUrl, TlsOptions};
pub use crate::consumer::{
    Consumer, ConsumerBuilder, ConsumerHandle, Handler, JobFault, Priority,
};
pub use crate::error::{Error, HandlerError, Result};
pub use crate::producer::{BulkPushResult, Producer};
pub use crate::types::batch::{Batch, BatchStatus, TargetJob};
pub use crate::types::job::{Job, JobBuilder};
pub use crate::types::mutate::{
    JobFilter, MutateCommand, MutateOperation, MutateTarget,
};
pub use crate::types::protocol::ServerInfo;
pub use crate::types::states::Role;
