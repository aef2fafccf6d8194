//! LXD backend adapter.
//!
//! Provides the narrow set of LXD operations webspaced needs, behind the
//! [`LxdApi`] trait so the webspace manager can be driven by a fake in tests.
//! The real implementation talks to the LXD REST API over its Unix socket.

mod client;
mod error;
mod types;

pub use client::LxdClient;
pub use error::{LxdError, LxdResult};
pub use types::{
    Event, ExecControl, ExecOutcome, Instance, InstanceExecControl, InstanceExecPost, InstancePut,
    InstanceSource, InstanceState, InstanceStateCpu, InstanceStateDisk, InstanceStateMemory,
    InstanceStateNetwork, InstanceStateNetworkAddress, InstanceStateNetworkCounters,
    InstanceStatePut, InstancesPost, Operation, STATUS_RUNNING, STATUS_STOPPED, StateAction,
};

use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Sink;
use futures::future::BoxFuture;
use futures::stream::BoxStream;

/// Byte stream of a log file. Dropping it releases the underlying connection.
pub type LogStream = BoxStream<'static, LxdResult<Bytes>>;

/// Stream of backend events.
pub type EventStream = BoxStream<'static, LxdResult<Event>>;

/// Terminal input of an interactive command. Closing it sends end-of-file.
pub type InputSink = Pin<Box<dyn Sink<Bytes, Error = LxdError> + Send>>;

pub type ControlSink = Pin<Box<dyn Sink<ExecControl, Error = LxdError> + Send>>;

/// A running interactive command.
pub struct ExecSession {
    pub input: InputSink,
    /// Terminal output. Ends when the command exits.
    pub output: LogStream,
    pub control: ControlSink,
    /// Resolves to the exit code once the command has finished.
    pub exit: BoxFuture<'static, LxdResult<i64>>,
}

/// LXD abstraction for testability.
///
/// Every mutating call returns only once the LXD background operation it
/// started has finished.
#[async_trait]
pub trait LxdApi: Send + Sync {
    /// List all instances with their full records.
    async fn list_instances(&self) -> LxdResult<Vec<Instance>>;

    async fn get_instance(&self, name: &str) -> LxdResult<Instance>;

    async fn create_instance(&self, request: &InstancesPost) -> LxdResult<()>;

    async fn update_instance(&self, name: &str, put: &InstancePut) -> LxdResult<()>;

    async fn delete_instance(&self, name: &str) -> LxdResult<()>;

    /// Start, stop or restart an instance.
    async fn update_instance_state(&self, name: &str, action: StateAction) -> LxdResult<()>;

    async fn get_instance_state(&self, name: &str) -> LxdResult<InstanceState>;

    /// Run a non-interactive command with recorded output.
    async fn exec_instance(&self, name: &str, request: &InstanceExecPost)
    -> LxdResult<ExecOutcome>;

    /// Start a command attached to a terminal.
    async fn exec_interactive(
        &self,
        name: &str,
        request: &InstanceExecPost,
    ) -> LxdResult<ExecSession>;

    /// Fetch one of the instance's log files (e.g. recorded exec output).
    async fn get_instance_log_file(&self, name: &str, file: &str) -> LxdResult<LogStream>;

    /// Fetch the instance's `/dev/console` log.
    async fn get_instance_console_log(&self, name: &str) -> LxdResult<LogStream>;

    /// Check that a managed network exists.
    async fn get_network(&self, name: &str) -> LxdResult<()>;

    /// Subscribe to lifecycle events.
    async fn lifecycle_events(&self) -> LxdResult<EventStream>;
}
