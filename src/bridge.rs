//! WebSocket bridge for remote terminal sessions.
//!
//! The core does not render terminals; it exposes one WebSocket per remote
//! shell carrying raw stdin/stdout bytes. Text frames are control messages,
//! currently only `{"type":"resize","cols":…,"rows":…}`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures_util::{SinkExt, StreamExt};
use log::{debug, warn};
use russh::ChannelMsg;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_util::sync::CancellationToken;

use crate::connect::SshSession;
use crate::error::{Error, Result};
use crate::events::EventBus;

/// Returned by `StartRemoteSession`; the UI dials `url` and pipes bytes.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TerminalSessionInfo {
    pub id: String,
    pub url: String,
    #[serde(rename = "type")]
    pub session_type: String,
}

#[derive(Debug, Deserialize)]
struct ControlFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    cols: u32,
    #[serde(default)]
    rows: u32,
}

struct PendingSession {
    channel: russh::Channel<russh::client::Msg>,
    session: Arc<SshSession>,
    alias: String,
}

/// One process-wide WebSocket listener multiplexing terminal sessions by
/// URL path.
pub struct TerminalBridge {
    events: EventBus,
    cancel: CancellationToken,
    port: u16,
    pending: Arc<Mutex<HashMap<String, PendingSession>>>,
}

impl TerminalBridge {
    /// Binds an ephemeral localhost port and starts accepting.
    pub async fn start(events: EventBus, cancel: CancellationToken) -> Result<Arc<Self>> {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
        let port = listener.local_addr()?.port();
        let bridge = Arc::new(Self {
            events,
            cancel: cancel.clone(),
            port,
            pending: Arc::new(Mutex::new(HashMap::new())),
        });

        let acceptor = bridge.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, _)) => acceptor.clone().handle_connection(stream),
                            Err(err) => {
                                warn!("terminal bridge accept failed: {err}");
                                break;
                            }
                        }
                    }
                }
            }
            debug!("terminal bridge listener ended");
        });

        Ok(bridge)
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Registers an opened shell channel under a session id and returns the
    /// connection info for the UI.
    pub fn register(
        &self,
        session_id: &str,
        alias: &str,
        channel: russh::Channel<russh::client::Msg>,
        session: Arc<SshSession>,
    ) -> TerminalSessionInfo {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).insert(
            session_id.to_string(),
            PendingSession {
                channel,
                session,
                alias: alias.to_string(),
            },
        );
        TerminalSessionInfo {
            id: session_id.to_string(),
            url: format!("ws://127.0.0.1:{}/{}", self.port, session_id),
            session_type: "remote".to_string(),
        }
    }

    fn handle_connection(self: Arc<Self>, stream: TcpStream) {
        let cancel = self.cancel.child_token();
        tokio::spawn(async move {
            let mut path = String::new();
            let websocket = match tokio_tungstenite::accept_hdr_async(
                stream,
                |request: &Request, response: Response| {
                    path = request.uri().path().trim_start_matches('/').to_string();
                    Ok(response)
                },
            )
            .await
            {
                Ok(websocket) => websocket,
                Err(err) => {
                    warn!("websocket handshake failed: {err}");
                    return;
                }
            };

            let pending = self
                .pending
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&path);
            let Some(pending) = pending else {
                warn!("no terminal session registered for '{path}'");
                return;
            };

            self.events
                .ssh_status(&pending.alias, "attached", format!("terminal {path}"));
            pump(websocket, pending.channel, cancel).await;
            self.events
                .ssh_status(&pending.alias, "detached", format!("terminal {path}"));
            pending.session.close().await;
        });
    }
}

/// Splices the WebSocket and the shell channel until either side closes.
async fn pump(
    websocket: tokio_tungstenite::WebSocketStream<TcpStream>,
    mut channel: russh::Channel<russh::client::Msg>,
    cancel: CancellationToken,
) {
    let (mut sink, mut stream) = websocket.split();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            msg = channel.wait() => {
                match msg {
                    Some(ChannelMsg::Data { ref data }) => {
                        if sink.send(Message::Binary(data.to_vec())).await.is_err() {
                            break;
                        }
                    }
                    Some(ChannelMsg::ExtendedData { ref data, .. }) => {
                        if sink.send(Message::Binary(data.to_vec())).await.is_err() {
                            break;
                        }
                    }
                    Some(ChannelMsg::ExitStatus { exit_status }) => {
                        debug!("remote shell exited with status {exit_status}");
                    }
                    Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => break,
                    Some(_) => {}
                }
            }
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Binary(bytes))) => {
                        if channel.data(&bytes[..]).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Text(text))) => {
                        if let Ok(frame) = serde_json::from_str::<ControlFrame>(&text) {
                            if frame.kind == "resize" {
                                let _ = channel
                                    .window_change(frame.cols, frame.rows, 0, 0)
                                    .await;
                                continue;
                            }
                        }
                        if channel.data(text.as_bytes()).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        debug!("websocket read error: {err}");
                        break;
                    }
                }
            }
        }
    }
    let _ = channel.eof().await;
    let _ = sink.send(Message::Close(None)).await;
}

/// Validation shared by the surface: session ids become URL path segments.
pub fn valid_session_id(id: &str) -> Result<()> {
    if id.is_empty()
        || !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(Error::Validation(format!(
            "invalid terminal session id '{id}'"
        )));
    }
    Ok(())
}
