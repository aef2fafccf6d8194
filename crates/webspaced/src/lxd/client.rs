//! LXD REST client over the LXD Unix socket.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{FutureExt, SinkExt, StreamExt, TryStreamExt, future};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::{Method, Request, header};
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use hyperlocal::UnixConnector;
use log::{debug, trace};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::net::UnixStream;
use tokio_tungstenite::{WebSocketStream, client_async};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;

use super::error::{LxdError, LxdResult};
use super::types::{
    Event, ExecControl, ExecOutcome, Instance, InstanceExecControl, InstanceExecPost, InstancePut,
    InstanceState, InstanceStatePut, InstancesPost, Operation, ResponseEnvelope, StateAction,
};
use super::{EventStream, ExecSession, LogStream, LxdApi};

/// Exec output paths look like `/1.0/instances/<name>/logs/<file>`.
static LOG_FILENAME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"/1\.0/instances/\S+/logs/(\S+)").expect("log filename regex is valid")
});

/// LXD client talking HTTP over the daemon's Unix socket.
#[derive(Clone)]
pub struct LxdClient {
    socket: PathBuf,
    client: Client<UnixConnector, Full<Bytes>>,
}

impl std::fmt::Debug for LxdClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LxdClient")
            .field("socket", &self.socket)
            .finish()
    }
}

impl LxdClient {
    /// Create a client for the LXD socket at `socket`.
    ///
    /// No connection is made until the first request.
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: socket.into(),
            client: Client::builder(TokioExecutor::new()).build(UnixConnector),
        }
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> LxdResult<hyper::Response<Incoming>> {
        let uri: hyper::Uri = hyperlocal::Uri::new(&self.socket, path).into();
        let mut builder = Request::builder().method(method.clone()).uri(uri);
        let body = match body {
            Some(bytes) => {
                builder = builder.header(header::CONTENT_TYPE, "application/json");
                Full::new(Bytes::from(bytes))
            }
            None => Full::new(Bytes::new()),
        };
        let request = builder
            .body(body)
            .map_err(|e| LxdError::Http(e.to_string()))?;

        trace!("LXD {} {}", method, path);
        self.client
            .request(request)
            .await
            .map_err(|e| LxdError::Http(e.to_string()))
    }

    /// Send a request and decode the response envelope, turning LXD error
    /// responses into [`LxdError::Api`].
    async fn call(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> LxdResult<ResponseEnvelope> {
        let response = self.send(method, path, body).await?;
        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .map_err(|e| LxdError::Http(e.to_string()))?
            .to_bytes();

        let envelope: ResponseEnvelope = serde_json::from_slice(&bytes)?;
        if envelope.kind == "error" {
            return Err(LxdError::Api {
                status: u16::try_from(envelope.error_code)
                    .ok()
                    .filter(|code| *code != 0)
                    .unwrap_or(status.as_u16()),
                message: envelope.error,
            });
        }

        Ok(envelope)
    }

    async fn sync_call<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> LxdResult<T> {
        let envelope = self.call(method, path, body).await?;
        Ok(serde_json::from_value(envelope.metadata)?)
    }

    /// Start a background operation and wait for it to finish.
    async fn async_call(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> LxdResult<Operation> {
        let envelope = self.call(method, path, body).await?;
        if envelope.kind != "async" || envelope.operation.is_empty() {
            return Err(LxdError::Unexpected(format!(
                "expected an async operation from {path}, got '{}'",
                envelope.kind
            )));
        }

        self.wait_operation(&envelope.operation).await
    }

    async fn wait_operation(&self, operation: &str) -> LxdResult<Operation> {
        let op: Operation = self
            .sync_call(Method::GET, &format!("{operation}/wait"), None)
            .await?;
        if op.failed() {
            return Err(LxdError::Operation(op.err));
        }

        Ok(op)
    }

    /// Open a websocket to `path` over the LXD socket.
    async fn websocket(&self, path: &str) -> LxdResult<WebSocketStream<UnixStream>> {
        let stream = UnixStream::connect(&self.socket).await?;

        // The host part is ignored on a Unix socket but the request must be a valid URL.
        let request = format!("ws://localhost{path}")
            .into_client_request()
            .map_err(|e| LxdError::WebSocket(e.to_string()))?;
        let (socket, _response) = client_async(request, stream)
            .await
            .map_err(|e| LxdError::WebSocket(e.to_string()))?;
        Ok(socket)
    }

    async fn stream(&self, path: &str) -> LxdResult<LogStream> {
        let response = self.send(Method::GET, path, None).await?;
        let status = response.status();
        if !status.is_success() {
            let bytes = response
                .into_body()
                .collect()
                .await
                .map_err(|e| LxdError::Http(e.to_string()))?
                .to_bytes();
            let message = serde_json::from_slice::<ResponseEnvelope>(&bytes)
                .map(|envelope| envelope.error)
                .unwrap_or_else(|_| String::from_utf8_lossy(&bytes).into_owned());
            return Err(LxdError::Api {
                status: status.as_u16(),
                message,
            });
        }

        Ok(response
            .into_body()
            .into_data_stream()
            .map_err(|e| LxdError::Http(e.to_string()))
            .boxed())
    }
}

fn encode<T: Serialize>(value: &T) -> LxdResult<Option<Vec<u8>>> {
    Ok(Some(serde_json::to_vec(value)?))
}

fn exec_metadata(op: &Operation) -> LxdResult<&serde_json::Value> {
    op.metadata
        .as_ref()
        .ok_or_else(|| LxdError::Unexpected("exec operation has no metadata".to_string()))
}

fn exit_code(op: &Operation) -> LxdResult<i64> {
    let metadata = exec_metadata(op)?;
    metadata["return"]
        .as_i64()
        .or_else(|| metadata["return"].as_f64().map(|code| code as i64))
        .ok_or_else(|| LxdError::Unexpected("exec operation has no exit code".to_string()))
}

/// Websocket secrets of an interactive exec.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct ExecSecrets {
    pub data: String,
    pub control: String,
}

/// Extract the websocket secrets from a just-started interactive exec.
pub(crate) fn parse_exec_secrets(op: &Operation) -> LxdResult<ExecSecrets> {
    let fds = &exec_metadata(op)?["fds"];
    let secret = |fd: &str| -> LxdResult<String> {
        fds[fd].as_str().map(str::to_string).ok_or_else(|| {
            LxdError::Unexpected(format!("exec operation has no websocket for fd {fd}"))
        })
    };

    Ok(ExecSecrets {
        data: secret("0")?,
        control: secret("control")?,
    })
}

fn control_message(control: ExecControl) -> LxdResult<Message> {
    let text = serde_json::to_string(&InstanceExecControl::from(control))?;
    Ok(Message::Text(text.into()))
}

/// Extract log file names and the exit code from a finished exec operation.
pub(crate) fn parse_exec_outcome(op: &Operation) -> LxdResult<ExecOutcome> {
    let metadata = exec_metadata(op)?;

    let log_name = |fd: &str| -> LxdResult<String> {
        let path = metadata["output"][fd].as_str().ok_or_else(|| {
            LxdError::Unexpected(format!("exec operation has no output for fd {fd}"))
        })?;
        LOG_FILENAME_RE
            .captures(path)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
            .ok_or_else(|| LxdError::Unexpected(format!("unrecognized exec log path '{path}'")))
    };

    Ok(ExecOutcome {
        stdout_log: log_name("1")?,
        stderr_log: log_name("2")?,
        exit_code: exit_code(op)?,
    })
}

#[async_trait]
impl LxdApi for LxdClient {
    async fn list_instances(&self) -> LxdResult<Vec<Instance>> {
        self.sync_call(Method::GET, "/1.0/instances?recursion=1", None)
            .await
    }

    async fn get_instance(&self, name: &str) -> LxdResult<Instance> {
        self.sync_call(Method::GET, &format!("/1.0/instances/{name}"), None)
            .await
    }

    async fn create_instance(&self, request: &InstancesPost) -> LxdResult<()> {
        self.async_call(Method::POST, "/1.0/instances", encode(request)?)
            .await?;
        Ok(())
    }

    async fn update_instance(&self, name: &str, put: &InstancePut) -> LxdResult<()> {
        self.async_call(Method::PUT, &format!("/1.0/instances/{name}"), encode(put)?)
            .await?;
        Ok(())
    }

    async fn delete_instance(&self, name: &str) -> LxdResult<()> {
        self.async_call(Method::DELETE, &format!("/1.0/instances/{name}"), None)
            .await?;
        Ok(())
    }

    async fn update_instance_state(&self, name: &str, action: StateAction) -> LxdResult<()> {
        self.async_call(
            Method::PUT,
            &format!("/1.0/instances/{name}/state"),
            encode(&InstanceStatePut::new(action))?,
        )
        .await?;
        Ok(())
    }

    async fn get_instance_state(&self, name: &str) -> LxdResult<InstanceState> {
        self.sync_call(Method::GET, &format!("/1.0/instances/{name}/state"), None)
            .await
    }

    async fn exec_instance(
        &self,
        name: &str,
        request: &InstanceExecPost,
    ) -> LxdResult<ExecOutcome> {
        let op = self
            .async_call(
                Method::POST,
                &format!("/1.0/instances/{name}/exec"),
                encode(request)?,
            )
            .await?;
        parse_exec_outcome(&op)
    }

    async fn exec_interactive(
        &self,
        name: &str,
        request: &InstanceExecPost,
    ) -> LxdResult<ExecSession> {
        let envelope = self
            .call(
                Method::POST,
                &format!("/1.0/instances/{name}/exec"),
                encode(request)?,
            )
            .await?;
        if envelope.kind != "async" || envelope.operation.is_empty() {
            return Err(LxdError::Unexpected(format!(
                "expected an async exec operation, got '{}'",
                envelope.kind
            )));
        }
        let operation = envelope.operation;
        let started: Operation = serde_json::from_value(envelope.metadata)?;
        let secrets = parse_exec_secrets(&started)?;

        let data = self
            .websocket(&format!("{operation}/websocket?secret={}", secrets.data))
            .await?;
        let control = self
            .websocket(&format!("{operation}/websocket?secret={}", secrets.control))
            .await?;
        debug!("Attached to interactive exec {} in {}", operation, name);

        let (data_tx, data_rx) = data.split();
        let input = data_tx
            .sink_map_err(|e| LxdError::WebSocket(e.to_string()))
            .with(|chunk: Bytes| future::ready(Ok::<_, LxdError>(Message::Binary(chunk))));
        let output = data_rx.filter_map(|message| async move {
            match message {
                Ok(Message::Binary(chunk)) => Some(Ok(chunk)),
                Ok(_) => None,
                Err(e) => Some(Err(LxdError::WebSocket(e.to_string()))),
            }
        });
        let control = control
            .sink_map_err(|e| LxdError::WebSocket(e.to_string()))
            .with(|control: ExecControl| future::ready(control_message(control)));

        let client = self.clone();
        let exit = async move {
            let op = client.wait_operation(&operation).await?;
            exit_code(&op)
        };

        Ok(ExecSession {
            input: Box::pin(input),
            output: output.boxed(),
            control: Box::pin(control),
            exit: exit.boxed(),
        })
    }

    async fn get_instance_log_file(&self, name: &str, file: &str) -> LxdResult<LogStream> {
        self.stream(&format!("/1.0/instances/{name}/logs/{file}"))
            .await
    }

    async fn get_instance_console_log(&self, name: &str) -> LxdResult<LogStream> {
        self.stream(&format!("/1.0/instances/{name}/console")).await
    }

    async fn get_network(&self, name: &str) -> LxdResult<()> {
        let _: serde_json::Value = self
            .sync_call(Method::GET, &format!("/1.0/networks/{name}"), None)
            .await?;
        Ok(())
    }

    async fn lifecycle_events(&self) -> LxdResult<EventStream> {
        let socket = self.websocket("/1.0/events?type=lifecycle").await?;

        let events = socket.filter_map(|message| async move {
            match message {
                Ok(Message::Text(text)) => {
                    Some(serde_json::from_str::<Event>(text.as_str()).map_err(LxdError::from))
                }
                Ok(_) => None,
                Err(e) => Some(Err(LxdError::WebSocket(e.to_string()))),
            }
        });

        Ok(events.boxed())
    }
}
