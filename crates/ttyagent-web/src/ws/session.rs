//! Per-connection session lifecycle.
//!
//! Each WebSocket connection runs one session task that owns both socket
//! halves. The task emits `ready`, gates everything behind ticket
//! consumption, buffers the pre-exec window size, spawns the exec bridge
//! on the first post-auth resize, and relays bridge events back to the
//! client. Because every outbound frame goes through this single task,
//! server frames are totally ordered per socket.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use axum::extract::ws::{close_code, CloseFrame, Message, Utf8Bytes, WebSocket};
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use ttyagent_core::protocol::{parse_client_frame, ClientFrame, ServerFrame, TermSize};
use ttyagent_core::target::ExecTarget;
use ttyagent_core::ticket::ConsumerMeta;

use crate::state::{AppState, SessionEntry};
use crate::ws::exec::{self, BridgeEvent};

/// Stdin chunks buffered between the client and the exec stream.
const STDIN_CHANNEL_CAPACITY: usize = 256;
/// Upstream output events in flight between the bridge and this task.
const EVENT_CHANNEL_CAPACITY: usize = 32;

type WsSender = SplitSink<WebSocket, Message>;

enum Lifecycle {
    Ready,
    Authed,
    Starting,
    Started,
}

/// Whether handling a message keeps the session running.
enum Flow {
    Continue,
    Close,
}

/// What to do with a client frame that arrives before authentication:
/// `auth` and `ping` act, a resize is buffered for the exec start, and
/// stdin is a policy violation.
#[derive(Debug, PartialEq, Eq)]
enum PreAuth {
    Handle,
    Buffer,
    Reject,
}

fn pre_auth_disposition(frame: &ClientFrame) -> PreAuth {
    match frame {
        ClientFrame::Auth { .. } | ClientFrame::Ping => PreAuth::Handle,
        ClientFrame::Resize { .. } => PreAuth::Buffer,
        ClientFrame::Stdin { .. } => PreAuth::Reject,
    }
}

struct AuthContext {
    kubeconfig: String,
    target: ExecTarget,
}

struct Bridge {
    resize_tx: watch::Sender<TermSize>,
    task: JoinHandle<()>,
}

struct Session {
    id: Uuid,
    state: AppState,
    peer: SocketAddr,
    lifecycle: Lifecycle,
    auth: Option<AuthContext>,
    pending_size: Option<TermSize>,
    bridge: Option<Bridge>,
    stdin_tx: mpsc::Sender<Bytes>,
    stdin_rx: Option<mpsc::Receiver<Bytes>>,
    events_tx: mpsc::Sender<BridgeEvent>,
    is_alive: bool,
}

pub async fn run(socket: WebSocket, state: AppState, query_ticket: Option<String>, peer: SocketAddr) {
    let id = Uuid::new_v4();
    state.sessions.insert(
        id,
        SessionEntry {
            peer,
            connected_at: Instant::now(),
        },
    );
    tracing::info!(session = %id, peer = %peer, "session opened");

    let (stdin_tx, stdin_rx) = mpsc::channel(STDIN_CHANNEL_CAPACITY);
    let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let session = Session {
        id,
        state: state.clone(),
        peer,
        lifecycle: Lifecycle::Ready,
        auth: None,
        pending_size: None,
        bridge: None,
        stdin_tx,
        stdin_rx: Some(stdin_rx),
        events_tx,
        is_alive: true,
    };
    session.drive(socket, events_rx, query_ticket).await;

    state.sessions.remove(&id);
    tracing::info!(session = %id, "session closed");
}

impl Session {
    async fn drive(
        mut self,
        socket: WebSocket,
        mut events_rx: mpsc::Receiver<BridgeEvent>,
        query_ticket: Option<String>,
    ) {
        let (mut sender, mut receiver): (WsSender, SplitStream<WebSocket>) = socket.split();

        if send_frame(&mut sender, &ServerFrame::Ready).await.is_err() {
            self.cleanup();
            return;
        }

        // A query-string ticket is consumed immediately; its single use is
        // spent here whether or not the rest of the handshake succeeds.
        if let Some(ticket) = query_ticket {
            let ticket = ticket.trim().to_string();
            if let Flow::Close = self.consume_ticket(&mut sender, &ticket).await {
                self.cleanup();
                return;
            }
        }

        let auth_deadline = tokio::time::Instant::now()
            + Duration::from_millis(self.state.config.ws_auth_timeout_ms);
        let heartbeat = Duration::from_millis(self.state.config.ws_heartbeat_interval_ms);
        let mut heartbeat_tick =
            tokio::time::interval_at(tokio::time::Instant::now() + heartbeat, heartbeat);

        loop {
            tokio::select! {
                message = receiver.next() => match message {
                    Some(Ok(message)) => {
                        if let Flow::Close = self.handle_message(&mut sender, message).await {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        tracing::debug!(session = %self.id, "socket read error: {e}");
                        break;
                    }
                    None => break,
                },
                _ = tokio::time::sleep_until(auth_deadline), if self.auth.is_none() => {
                    tracing::info!(session = %self.id, "auth timeout");
                    let _ = send_frame(
                        &mut sender,
                        &ServerFrame::error("Auth timeout: no valid ticket received."),
                    )
                    .await;
                    let _ = send_close(&mut sender, close_code::POLICY, "auth timeout").await;
                    break;
                }
                _ = heartbeat_tick.tick() => {
                    if !self.is_alive {
                        tracing::info!(session = %self.id, "heartbeat missed; terminating");
                        break;
                    }
                    self.is_alive = false;
                    if sender.send(Message::Ping(Bytes::new())).await.is_err() {
                        break;
                    }
                }
                event = events_rx.recv() => match event {
                    Some(event) => {
                        if let Flow::Close = self.handle_bridge_event(&mut sender, event).await {
                            break;
                        }
                    }
                    // Unreachable while this session holds an events_tx clone.
                    None => break,
                },
            }
        }

        tracing::debug!(session = %self.id, state = self.state_name(), "session loop exited");
        self.cleanup();
    }

    fn state_name(&self) -> &'static str {
        match self.lifecycle {
            Lifecycle::Ready => "ready",
            Lifecycle::Authed => "authed",
            Lifecycle::Starting => "starting",
            Lifecycle::Started => "started",
        }
    }

    async fn handle_message(&mut self, sender: &mut WsSender, message: Message) -> Flow {
        match message {
            Message::Text(text) => self.handle_text(sender, text.as_str()).await,
            Message::Binary(data) => self.handle_stdin(sender, data).await,
            Message::Pong(_) => {
                self.is_alive = true;
                Flow::Continue
            }
            // The websocket layer answers pings itself.
            Message::Ping(_) => Flow::Continue,
            Message::Close(_) => Flow::Close,
        }
    }

    async fn handle_text(&mut self, sender: &mut WsSender, text: &str) -> Flow {
        let frame = match parse_client_frame(text) {
            Ok(frame) => frame,
            Err(e) => {
                // Invalid frames get one error reply and never advance the
                // session state.
                tracing::debug!(session = %self.id, "rejected frame: {e}");
                if send_frame(sender, &ServerFrame::error(e.to_string())).await.is_err() {
                    return Flow::Close;
                }
                return Flow::Continue;
            }
        };

        if self.auth.is_none() {
            match pre_auth_disposition(&frame) {
                PreAuth::Handle => {}
                PreAuth::Buffer => {
                    if let ClientFrame::Resize { cols, rows } = frame {
                        self.pending_size = Some(TermSize::clamped(cols, rows));
                    }
                    return Flow::Continue;
                }
                PreAuth::Reject => return self.reject_unauthenticated(sender).await,
            }
        }

        match frame {
            ClientFrame::Ping => {
                if send_frame(sender, &ServerFrame::Pong).await.is_err() {
                    return Flow::Close;
                }
                Flow::Continue
            }
            ClientFrame::Auth { ticket } => {
                if self.auth.is_some() {
                    // The ticket was already spent for this session; a
                    // repeated auth is acknowledged without a second
                    // consumption.
                    if send_frame(sender, &ServerFrame::Authed).await.is_err() {
                        return Flow::Close;
                    }
                    return Flow::Continue;
                }
                self.consume_ticket(sender, &ticket).await
            }
            ClientFrame::Stdin { data } => self.handle_stdin(sender, Bytes::from(data)).await,
            ClientFrame::Resize { cols, rows } => {
                self.handle_resize(sender, TermSize::clamped(cols, rows)).await
            }
        }
    }

    async fn consume_ticket(&mut self, sender: &mut WsSender, ticket: &str) -> Flow {
        let consumer = ConsumerMeta {
            remote_addr: self.peer.to_string(),
        };
        match self.state.tickets.consume(ticket, &consumer) {
            Ok((kubeconfig, target)) => {
                self.auth = Some(AuthContext { kubeconfig, target });
                self.lifecycle = Lifecycle::Authed;
                if send_frame(sender, &ServerFrame::Authed).await.is_err() {
                    return Flow::Close;
                }
                // A resize that arrived pre-auth starts the exec now.
                if let Some(size) = self.pending_size.take() {
                    return self.start_bridge(sender, size).await;
                }
                Flow::Continue
            }
            Err(e) => {
                let _ = send_frame(sender, &ServerFrame::error(e.to_string())).await;
                let _ = send_close(sender, close_code::POLICY, "invalid ticket").await;
                Flow::Close
            }
        }
    }

    async fn handle_stdin(&mut self, sender: &mut WsSender, data: Bytes) -> Flow {
        if self.auth.is_none() {
            return self.reject_unauthenticated(sender).await;
        }
        if self.bridge.is_some() {
            // Awaiting the bounded channel is the stdin backpressure: a
            // slow exec stream pauses reads from the client.
            if self.stdin_tx.send(data).await.is_err() {
                tracing::debug!(session = %self.id, "stdin dropped; bridge gone");
            }
        } else if self.stdin_tx.try_send(data).is_err() {
            // Before the first resize there is no consumer; buffer up to
            // the channel capacity rather than wedge the control loop.
            tracing::debug!(session = %self.id, "pre-start stdin buffer full; dropping chunk");
        }
        Flow::Continue
    }

    async fn handle_resize(&mut self, sender: &mut WsSender, size: TermSize) -> Flow {
        match &self.bridge {
            Some(bridge) => {
                // Last one wins; the bridge reads the latest value.
                let _ = bridge.resize_tx.send(size);
                Flow::Continue
            }
            None => self.start_bridge(sender, size).await,
        }
    }

    /// Spawns the exec bridge with `size` as the initial TTY window. The
    /// exec starts at most once per session: a second call finds the
    /// stdin receiver already taken and does nothing.
    async fn start_bridge(&mut self, _sender: &mut WsSender, size: TermSize) -> Flow {
        let Some(auth) = &self.auth else {
            return Flow::Continue;
        };
        let Some(stdin_rx) = self.stdin_rx.take() else {
            return Flow::Continue;
        };

        let (resize_tx, resize_rx) = watch::channel(size);
        let task = exec::spawn(
            self.id,
            auth.kubeconfig.clone(),
            auth.target.clone(),
            resize_rx,
            stdin_rx,
            self.events_tx.clone(),
        );
        self.bridge = Some(Bridge { resize_tx, task });
        self.lifecycle = Lifecycle::Starting;
        tracing::debug!(session = %self.id, cols = size.cols, rows = size.rows, "exec starting");
        Flow::Continue
    }

    async fn handle_bridge_event(&mut self, sender: &mut WsSender, event: BridgeEvent) -> Flow {
        match event {
            BridgeEvent::Started => {
                self.lifecycle = Lifecycle::Started;
                if send_frame(sender, &ServerFrame::Started).await.is_err() {
                    return Flow::Close;
                }
                Flow::Continue
            }
            BridgeEvent::Output(data) => {
                // Awaited send: WebSocket backpressure propagates to the
                // bounded event channel and pauses the upstream read.
                if sender.send(Message::Binary(data)).await.is_err() {
                    return Flow::Close;
                }
                Flow::Continue
            }
            BridgeEvent::Status(status) => {
                if send_frame(sender, &ServerFrame::Status { status }).await.is_err() {
                    return Flow::Close;
                }
                Flow::Continue
            }
            BridgeEvent::Fatal {
                message,
                close_code,
                reason,
            } => {
                let _ = send_frame(sender, &ServerFrame::error(message)).await;
                let _ = send_close(sender, close_code, reason).await;
                Flow::Close
            }
            BridgeEvent::Finished { close_code, reason } => {
                let _ = send_close(sender, close_code, reason).await;
                Flow::Close
            }
        }
    }

    async fn reject_unauthenticated(&mut self, sender: &mut WsSender) -> Flow {
        let _ = send_frame(sender, &ServerFrame::error("Not authenticated.")).await;
        let _ = send_close(sender, close_code::POLICY, "not authenticated").await;
        Flow::Close
    }

    /// Safe to call more than once.
    fn cleanup(&mut self) {
        if let Some(bridge) = self.bridge.take() {
            bridge.task.abort();
        }
        self.pending_size = None;
        self.auth = None;
        self.lifecycle = Lifecycle::Ready;
    }
}

async fn send_frame(sender: &mut WsSender, frame: &ServerFrame) -> Result<(), axum::Error> {
    sender
        .send(Message::Text(Utf8Bytes::from(frame.encode())))
        .await
}

async fn send_close(sender: &mut WsSender, code: u16, reason: &str) -> Result<(), axum::Error> {
    sender
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: Utf8Bytes::from(reason.to_string()),
        })))
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_and_ping_act_pre_auth() {
        assert_eq!(
            pre_auth_disposition(&ClientFrame::Auth {
                ticket: "t".to_string()
            }),
            PreAuth::Handle
        );
        assert_eq!(pre_auth_disposition(&ClientFrame::Ping), PreAuth::Handle);
    }

    #[test]
    fn resize_is_buffered_pre_auth() {
        assert_eq!(
            pre_auth_disposition(&ClientFrame::Resize { cols: 80, rows: 24 }),
            PreAuth::Buffer
        );
    }

    #[test]
    fn stdin_is_rejected_pre_auth() {
        assert_eq!(
            pre_auth_disposition(&ClientFrame::Stdin {
                data: "ls\n".to_string()
            }),
            PreAuth::Reject
        );
    }
}
