//! WebSocket termination and control-message dispatch. Each accepted socket
//! gets a reader task (owning the read half) and a writer task draining a
//! bounded channel, so a slow consumer never stalls the hub. Shared state is
//! read on every relay and written only on connect, disconnect, and session
//! transitions; no lock is held across socket or database awaits.

use crate::config::HubConfig;
use crate::directory::{handle_from_email, AuthenticatedUser, Directory, DirectoryError};
use crate::metrics::Metrics;
use crate::registry::{ConnectionEntry, Outbound, Registry};
use crate::session::{SessionError, SessionTable};
use chrono::Utc;
use flux_proto::signal::{ClientMessage, FileHint, FriendView, ServerMessage};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

pub const CLOSE_UPGRADE_FAILURE: u16 = 4000;
pub const CLOSE_INVALID_TOKEN: u16 = 4001;
pub const CLOSE_SUPERSEDED: u16 = 1001;

const WRITE_CHANNEL_CAPACITY: usize = 128;

pub struct HubState {
    pub config: HubConfig,
    pub directory: Arc<dyn Directory>,
    pub registry: Registry,
    pub sessions: SessionTable,
    pub metrics: Arc<Metrics>,
}

pub struct FluxHub {
    state: Arc<HubState>,
}

impl FluxHub {
    pub fn new(config: HubConfig, directory: Arc<dyn Directory>) -> Self {
        Self {
            state: Arc::new(HubState {
                config,
                directory,
                registry: Registry::new(),
                sessions: SessionTable::new(),
                metrics: Arc::new(Metrics::new()),
            }),
        }
    }

    pub fn state(&self) -> Arc<HubState> {
        Arc::clone(&self.state)
    }

    /// Accept loop; one task per socket.
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        loop {
            let (stream, remote) = listener.accept().await?;
            let state = Arc::clone(&self.state);
            tokio::spawn(async move {
                if let Err(error) = handle_socket(state, stream, remote).await {
                    debug!(remote = %remote, error = %error, "socket terminated");
                }
            });
        }
    }
}

async fn handle_socket(
    state: Arc<HubState>,
    stream: TcpStream,
    remote: SocketAddr,
) -> Result<(), WsError> {
    let mut request_uri = None;
    let callback = |request: &Request, response: Response| {
        request_uri = Some(request.uri().clone());
        Ok(response)
    };
    let mut socket = tokio_tungstenite::accept_hdr_async(stream, callback).await?;

    let (path, token) = match request_uri {
        Some(uri) => (
            uri.path().to_string(),
            query_param(uri.query().unwrap_or(""), "token"),
        ),
        None => (String::new(), None),
    };
    if path != "/flux" {
        debug!(remote = %remote, path = %path, "rejecting unknown upgrade path");
        return close_with(&mut socket, CLOSE_UPGRADE_FAILURE, "unknown path").await;
    }
    let token = match token {
        Some(token) if !token.is_empty() => token,
        _ => {
            debug!(remote = %remote, "rejecting upgrade without token");
            return close_with(&mut socket, CLOSE_INVALID_TOKEN, "missing token").await;
        }
    };
    let user = match state.directory.verify_token(&token).await {
        Ok(user) => user,
        Err(DirectoryError::Unauthenticated) => {
            info!(remote = %remote, "rejecting invalid token");
            return close_with(&mut socket, CLOSE_INVALID_TOKEN, "invalid token").await;
        }
        Err(error) => {
            warn!(remote = %remote, error = %error, "token verification failed");
            return close_with(&mut socket, CLOSE_UPGRADE_FAILURE, "upgrade failure").await;
        }
    };

    let handle = handle_from_email(&user.email);
    let (writer_tx, writer_rx) = mpsc::channel::<Outbound>(WRITE_CHANNEL_CAPACITY);
    let (write_half, mut read_half) = socket.split();
    let writer_task = tokio::spawn(run_writer(
        write_half,
        writer_rx,
        Arc::clone(&state.metrics),
    ));

    let connection_id = state.registry.allocate_connection_id();
    let entry = ConnectionEntry {
        user_id: user.user_id.clone(),
        email: user.email.clone(),
        handle: handle.clone(),
        sender: writer_tx.clone(),
        connection_id,
        connected_at: Utc::now(),
    };
    match state.registry.register(entry).await {
        Some(previous) => {
            info!(user = %user.user_id, "superseding previous connection");
            let _ = previous
                .sender
                .send(Outbound::Close(CLOSE_SUPERSEDED, "superseded"))
                .await;
        }
        // Only an actual offline-to-online edge is broadcast.
        None => broadcast_presence(&state, &user.user_id, true).await,
    }
    state.metrics.incr_connections();
    info!(user = %user.user_id, remote = %remote, "peer connected");

    let _ = writer_tx
        .send(Outbound::Message(ServerMessage::Connected {
            user_id: user.user_id.clone(),
            email: user.email.clone(),
        }))
        .await;

    let mut keepalive =
        tokio::time::interval(Duration::from_secs(state.config.keepalive_secs.max(1)));
    keepalive.tick().await; // the first tick fires immediately
    let idle_timeout = Duration::from_secs(state.config.idle_timeout_secs.max(60));
    let mut last_seen = Instant::now();

    loop {
        tokio::select! {
            _ = keepalive.tick() => {
                if last_seen.elapsed() > idle_timeout {
                    info!(user = %user.user_id, "closing idle connection");
                    let _ = writer_tx
                        .send(Outbound::Close(1001, "idle timeout"))
                        .await;
                    break;
                }
                if writer_tx
                    .send(Outbound::Message(ServerMessage::Ping))
                    .await
                    .is_err()
                {
                    break;
                }
            }
            inbound = read_half.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        last_seen = Instant::now();
                        state.metrics.mark_ingress();
                        dispatch(&state, &user, &handle, &writer_tx, &text).await;
                    }
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                        last_seen = Instant::now();
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(error)) => {
                        debug!(user = %user.user_id, error = %error, "read failure");
                        break;
                    }
                }
            }
        }
    }

    cleanup_connection(&state, &user, connection_id).await;
    drop(writer_tx);
    let _ = writer_task.await;
    Ok(())
}

/// Socket close semantics: unregister (guarded against supersession), purge
/// sessions, notify surviving peers, broadcast offline presence.
async fn cleanup_connection(state: &HubState, user: &AuthenticatedUser, connection_id: u64) {
    let removed = state.registry.unregister(&user.user_id, connection_id).await;
    if removed {
        let purged = state.sessions.purge_for_peer(&user.user_id).await;
        state.metrics.mark_sessions_purged(purged.len() as u64);
        for session in &purged {
            if let Some(other) = session.other_peer(&user.user_id) {
                if let Some(sender) = state.registry.sender_for(other).await {
                    let _ = sender
                        .send(Outbound::Message(ServerMessage::RtcSessionClose {
                            session_id: session.session_id.clone(),
                        }))
                        .await;
                }
            }
        }
        broadcast_presence(state, &user.user_id, false).await;
        info!(user = %user.user_id, sessions = purged.len(), "peer disconnected");
    } else {
        debug!(user = %user.user_id, connection = connection_id, "superseded socket, cleanup skipped");
    }
    state.metrics.decr_connections();
}

async fn run_writer(
    mut sink: SplitSink<WebSocketStream<TcpStream>, Message>,
    mut outbound: mpsc::Receiver<Outbound>,
    metrics: Arc<Metrics>,
) {
    while let Some(command) = outbound.recv().await {
        match command {
            Outbound::Message(message) => match serde_json::to_string(&message) {
                Ok(encoded) => {
                    if sink.send(Message::Text(encoded)).await.is_err() {
                        break;
                    }
                    metrics.mark_egress();
                }
                Err(error) => warn!(error = %error, "egress encode failed"),
            },
            Outbound::Close(code, reason) => {
                let _ = sink
                    .send(Message::Close(Some(CloseFrame {
                        code: CloseCode::from(code),
                        reason: reason.into(),
                    })))
                    .await;
                break;
            }
        }
    }
}

async fn dispatch(
    state: &HubState,
    user: &AuthenticatedUser,
    handle: &str,
    writer: &mpsc::Sender<Outbound>,
    text: &str,
) {
    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(error) => {
            warn!(user = %user.user_id, error = %error, "malformed control message");
            reply_error(writer, "Internal error").await;
            return;
        }
    };
    let tag = value
        .get("type")
        .and_then(Value::as_str)
        .map(str::to_string);
    let message: ClientMessage = match serde_json::from_value(value) {
        Ok(message) => message,
        Err(error) => {
            match tag {
                // Unknown types are tolerated; recognized types with broken
                // payloads are not.
                Some(tag) if !ClientMessage::is_known_type(&tag) => {
                    debug!(user = %user.user_id, %tag, "ignoring unknown message type");
                }
                _ => {
                    warn!(user = %user.user_id, error = %error, "malformed control message");
                    reply_error(writer, "Internal error").await;
                }
            }
            return;
        }
    };

    match message {
        ClientMessage::Ping => send(writer, ServerMessage::Pong).await,
        ClientMessage::GetConnectCode => handle_connect_code(state, user, writer).await,
        ClientMessage::GetFriends => handle_get_friends(state, user, writer).await,
        ClientMessage::AddFriend { code } => {
            handle_add_friend(state, user, handle, writer, &code).await
        }
        ClientMessage::RtcSessionRequest {
            peer_id,
            session_id,
            file,
        } => handle_session_request(state, user, handle, writer, peer_id, session_id, file).await,
        ClientMessage::RtcSessionAccept { session_id } => {
            handle_session_accept(state, user, writer, &session_id).await
        }
        ClientMessage::RtcSessionReject { session_id } => {
            handle_session_reject(state, user, &session_id).await
        }
        ClientMessage::RtcOffer { peer_id, offer } => {
            relay_to_peer(
                state,
                writer,
                &peer_id,
                ServerMessage::RtcOffer {
                    sender_id: user.user_id.clone(),
                    offer,
                },
            )
            .await
        }
        ClientMessage::RtcAnswer { peer_id, answer } => {
            relay_to_peer(
                state,
                writer,
                &peer_id,
                ServerMessage::RtcAnswer {
                    sender_id: user.user_id.clone(),
                    answer,
                },
            )
            .await
        }
        ClientMessage::RtcIceCandidate { peer_id, candidate } => {
            relay_to_peer(
                state,
                writer,
                &peer_id,
                ServerMessage::RtcIceCandidate {
                    sender_id: user.user_id.clone(),
                    candidate,
                },
            )
            .await
        }
        ClientMessage::RtcSessionReady { session_id } => {
            handle_session_ready(state, user, writer, &session_id).await
        }
        ClientMessage::RtcSessionClose { session_id } => {
            handle_session_close(state, user, &session_id).await
        }
    }
}

async fn handle_connect_code(
    state: &HubState,
    user: &AuthenticatedUser,
    writer: &mpsc::Sender<Outbound>,
) {
    match state.directory.connect_code(&user.user_id).await {
        Ok(code) => send(writer, ServerMessage::ConnectCode { code }).await,
        Err(error) => {
            warn!(user = %user.user_id, error = %error, "connect code allocation failed");
            reply_error(writer, "Internal error").await;
        }
    }
}

async fn handle_get_friends(
    state: &HubState,
    user: &AuthenticatedUser,
    writer: &mpsc::Sender<Outbound>,
) {
    let friend_ids = match state.directory.friend_ids(&user.user_id).await {
        Ok(ids) => ids,
        Err(error) => {
            warn!(user = %user.user_id, error = %error, "friend listing failed");
            reply_error(writer, "Internal error").await;
            return;
        }
    };
    let mut friends = Vec::with_capacity(friend_ids.len());
    for friend_id in friend_ids {
        friends.push(friend_view(state, &friend_id).await);
    }
    send(writer, ServerMessage::FriendsList { friends }).await;
}

async fn handle_add_friend(
    state: &HubState,
    user: &AuthenticatedUser,
    handle: &str,
    writer: &mpsc::Sender<Outbound>,
    code: &str,
) {
    let code = code.trim().to_ascii_uppercase();
    let friend_id = match state.directory.resolve_code(&code).await {
        Ok(Some(friend_id)) => friend_id,
        Ok(None) => {
            reply_error(writer, "Invalid connect code").await;
            return;
        }
        Err(error) => {
            warn!(user = %user.user_id, error = %error, "code resolution failed");
            reply_error(writer, "Internal error").await;
            return;
        }
    };
    if friend_id == user.user_id {
        reply_error(writer, "Cannot add yourself").await;
        return;
    }
    match state.directory.add_friendship(&user.user_id, &friend_id).await {
        Ok(()) => {}
        Err(DirectoryError::AlreadyFriends) => {
            reply_error(writer, "Already friends").await;
            return;
        }
        Err(DirectoryError::SelfFriend) => {
            reply_error(writer, "Cannot add yourself").await;
            return;
        }
        Err(error) => {
            warn!(user = %user.user_id, error = %error, "friendship insert failed");
            reply_error(writer, "Internal error").await;
            return;
        }
    }
    info!(user = %user.user_id, friend = %friend_id, "friendship added");
    let view = friend_view(state, &friend_id).await;
    send(writer, ServerMessage::FriendAdded { friend: view }).await;
    if let Some(sender) = state.registry.sender_for(&friend_id).await {
        let _ = sender
            .send(Outbound::Message(ServerMessage::FriendAdded {
                friend: FriendView {
                    id: user.user_id.clone(),
                    name: handle.to_string(),
                    is_online: true,
                },
            }))
            .await;
    }
}

async fn handle_session_request(
    state: &HubState,
    user: &AuthenticatedUser,
    handle: &str,
    writer: &mpsc::Sender<Outbound>,
    peer_id: String,
    session_id: String,
    file: FileHint,
) {
    if !state.registry.is_online(&peer_id).await {
        reply_error(writer, "Peer not connected").await;
        return;
    }
    match state
        .sessions
        .create(&session_id, &user.user_id, &peer_id, file.clone())
        .await
    {
        Ok(()) => state.metrics.mark_session_created(),
        Err(error) => {
            reply_error(writer, session_error_text(&error)).await;
            return;
        }
    }
    match state.registry.sender_for(&peer_id).await {
        Some(sender) => {
            debug!(session = %session_id, initiator = %user.user_id, responder = %peer_id, "session requested");
            let _ = sender
                .send(Outbound::Message(ServerMessage::RtcSessionRequest {
                    sender_id: user.user_id.clone(),
                    sender_name: handle.to_string(),
                    session_id,
                    file,
                }))
                .await;
            state.metrics.mark_relay();
        }
        None => {
            // The peer vanished between the presence check and the relay.
            state.sessions.remove_for(&session_id, &user.user_id).await;
            reply_error(writer, "Peer not connected").await;
        }
    }
}

async fn handle_session_accept(
    state: &HubState,
    user: &AuthenticatedUser,
    writer: &mpsc::Sender<Outbound>,
    session_id: &str,
) {
    match state.sessions.accept(session_id, &user.user_id).await {
        Ok(session) => {
            forward(
                state,
                &session.initiator,
                ServerMessage::RtcSessionAccept {
                    session_id: session_id.to_string(),
                    sender_id: user.user_id.clone(),
                },
            )
            .await;
        }
        Err(error) => reply_error(writer, session_error_text(&error)).await,
    }
}

async fn handle_session_reject(state: &HubState, user: &AuthenticatedUser, session_id: &str) {
    if let Some(session) = state.sessions.remove_for(session_id, &user.user_id).await {
        forward(
            state,
            &session.initiator,
            ServerMessage::RtcSessionReject {
                session_id: session_id.to_string(),
                sender_id: user.user_id.clone(),
            },
        )
        .await;
    }
}

async fn handle_session_ready(
    state: &HubState,
    user: &AuthenticatedUser,
    writer: &mpsc::Sender<Outbound>,
    session_id: &str,
) {
    match state.sessions.mark_connected(session_id, &user.user_id).await {
        Ok(session) => {
            if let Some(other) = session.other_peer(&user.user_id) {
                forward(
                    state,
                    other,
                    ServerMessage::RtcSessionReady {
                        session_id: session_id.to_string(),
                        sender_id: user.user_id.clone(),
                    },
                )
                .await;
            }
        }
        Err(error) => reply_error(writer, session_error_text(&error)).await,
    }
}

async fn handle_session_close(state: &HubState, user: &AuthenticatedUser, session_id: &str) {
    if let Some(session) = state.sessions.remove_for(session_id, &user.user_id).await {
        if let Some(other) = session.other_peer(&user.user_id) {
            forward(
                state,
                other,
                ServerMessage::RtcSessionClose {
                    session_id: session_id.to_string(),
                },
            )
            .await;
        }
    }
}

/// Verbatim relay of opaque signaling payloads to a named peer.
async fn relay_to_peer(
    state: &HubState,
    writer: &mpsc::Sender<Outbound>,
    peer_id: &str,
    message: ServerMessage,
) {
    match state.registry.sender_for(peer_id).await {
        Some(sender) => {
            let _ = sender.send(Outbound::Message(message)).await;
            state.metrics.mark_relay();
        }
        None => reply_error(writer, "Peer not connected").await,
    }
}

async fn forward(state: &HubState, user_id: &str, message: ServerMessage) {
    if let Some(sender) = state.registry.sender_for(user_id).await {
        let _ = sender.send(Outbound::Message(message)).await;
        state.metrics.mark_relay();
    }
}

/// Presence deltas go to the peer's currently connected friends.
async fn broadcast_presence(state: &HubState, user_id: &str, online: bool) {
    let friends = match state.directory.friend_ids(user_id).await {
        Ok(friends) => friends,
        Err(error) => {
            warn!(user = %user_id, error = %error, "presence fan-out skipped");
            return;
        }
    };
    for friend_id in friends {
        if let Some(sender) = state.registry.sender_for(&friend_id).await {
            let message = if online {
                ServerMessage::FriendOnline {
                    friend_id: user_id.to_string(),
                }
            } else {
                ServerMessage::FriendOffline {
                    friend_id: user_id.to_string(),
                }
            };
            let _ = sender.send(Outbound::Message(message)).await;
        }
    }
}

async fn friend_view(state: &HubState, friend_id: &str) -> FriendView {
    if let Some(peer) = state.registry.peer_view(friend_id).await {
        return FriendView {
            id: friend_id.to_string(),
            name: peer.handle,
            is_online: true,
        };
    }
    let name = match state.directory.lookup_user(friend_id).await {
        Ok(Some(user)) => handle_from_email(&user.email),
        _ => friend_id.to_string(),
    };
    FriendView {
        id: friend_id.to_string(),
        name,
        is_online: false,
    }
}

fn session_error_text(error: &SessionError) -> &'static str {
    match error {
        SessionError::NotFound | SessionError::NotParticipant => "Session not found",
        SessionError::AlreadyExists => "Session already exists",
        SessionError::InvalidTransition => "Invalid session state",
    }
}

async fn send(writer: &mpsc::Sender<Outbound>, message: ServerMessage) {
    let _ = writer.send(Outbound::Message(message)).await;
}

async fn reply_error(writer: &mpsc::Sender<Outbound>, message: &str) {
    send(
        writer,
        ServerMessage::Error {
            message: message.to_string(),
        },
    )
    .await;
}

async fn close_with(
    socket: &mut WebSocketStream<TcpStream>,
    code: u16,
    reason: &'static str,
) -> Result<(), WsError> {
    socket
        .close(Some(CloseFrame {
            code: CloseCode::from(code),
            reason: reason.into(),
        }))
        .await
}

fn query_param(query: &str, name: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let mut parts = pair.splitn(2, '=');
        match (parts.next(), parts.next()) {
            (Some(key), Some(value)) if key == name => Some(value.to_string()),
            _ => None,
        }
    })
}
