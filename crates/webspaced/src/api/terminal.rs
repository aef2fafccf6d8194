//! Interactive exec over a client WebSocket.
//!
//! Client -> server:
//!   first text message = `ExecInteractiveRequest` JSON
//!   binary             = terminal input
//!   text               = `ExecInteractiveControl` JSON (resize, signal)
//!   close              = end of input
//!
//! Server -> client:
//!   binary             = terminal output
//!   last text message  = `{"exitCode": N}` or `{"error": "..."}`, then close

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tracing::{debug, info};

use crate::lxd::{ControlSink, ExecSession, LxdResult};
use crate::webspace::{ExecInteractiveControl, ExecInteractiveRequest, Webspace, WebspaceManager};

/// Run one interactive command for the client on `socket`.
pub async fn run_terminal(socket: WebSocket, manager: Arc<WebspaceManager>, webspace: Webspace) {
    let (mut client_tx, mut client_rx) = socket.split();

    let request = match read_request(&mut client_rx).await {
        Ok(request) => request,
        Err(message) => {
            finish(&mut client_tx, json!({ "error": message })).await;
            return;
        }
    };
    let ExecSession {
        mut input,
        mut output,
        mut control,
        exit,
    } = match manager.exec_interactive(&webspace, &request).await {
        Ok(session) => session,
        Err(e) => {
            finish(&mut client_tx, json!({ "error": e.to_string() })).await;
            return;
        }
    };

    {
        let client_to_exec = async {
            while let Some(Ok(message)) = client_rx.next().await {
                let forwarded = match message {
                    Message::Binary(data) => input.send(data).await,
                    Message::Text(text) => forward_control(&mut control, text.as_str()).await,
                    Message::Close(_) => break,
                    Message::Ping(_) | Message::Pong(_) => Ok(()),
                };
                if let Err(e) = forwarded {
                    debug!("Terminal input closed: {}", e);
                    break;
                }
            }
            let _ = input.close().await;
        };

        let exec_to_client = async {
            while let Some(chunk) = output.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        debug!("Terminal output ended: {}", e);
                        break;
                    }
                };
                if client_tx.send(Message::Binary(chunk)).await.is_err() {
                    break;
                }
            }
        };
        tokio::pin!(exec_to_client);

        // Output ends when the command exits. Input ending first only
        // means the client is done typing.
        tokio::select! {
            _ = &mut exec_to_client => {}
            _ = client_to_exec => exec_to_client.as_mut().await,
        }
    }
    drop(input);
    drop(control);

    let report = match exit.await {
        Ok(code) => {
            info!(
                "Interactive command in webspace of uid {} exited with {}",
                webspace.user_id, code
            );
            json!({ "exitCode": code })
        }
        Err(e) => json!({ "error": e.to_string() }),
    };
    finish(&mut client_tx, report).await;
}

async fn read_request(
    client_rx: &mut SplitStream<WebSocket>,
) -> Result<ExecInteractiveRequest, String> {
    while let Some(message) = client_rx.next().await {
        match message.map_err(|e| e.to_string())? {
            Message::Text(text) => {
                return serde_json::from_str(text.as_str())
                    .map_err(|e| format!("invalid exec request: {e}"));
            }
            Message::Binary(_) => return Err("expected an exec request first".to_string()),
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }
    Err("connection closed before the exec request".to_string())
}

async fn forward_control(control: &mut ControlSink, text: &str) -> LxdResult<()> {
    let request: ExecInteractiveControl = match serde_json::from_str(text) {
        Ok(request) => request,
        Err(e) => {
            debug!("Ignoring malformed control message: {}", e);
            return Ok(());
        }
    };
    for message in request.controls() {
        control.send(message).await?;
    }
    Ok(())
}

async fn finish(client_tx: &mut SplitSink<WebSocket, Message>, report: serde_json::Value) {
    let _ = client_tx
        .send(Message::Text(report.to_string().into()))
        .await;
    let _ = client_tx.close().await;
}
