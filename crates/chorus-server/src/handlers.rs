//! Connection handlers for the Chorus server.
//!
//! This module handles the connection lifecycle: the Connect handshake,
//! frame dispatch into the realtime engine, event fan-out back to the
//! socket, and disconnect cleanup.

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use bytes::BytesMut;
use chorus_core::{
    Authenticator, BusConfig, BusError, CallCoordinator, CallStateMachine, CallStore,
    ConnectionRegistry, Delivery, EngineError, GroupBus, MessageDeliveryTracker, MessageStore,
    PresenceBroadcaster, ProfileStore, ServerEvent, SignalKind, SignalingRelay,
};
use chorus_protocol::{codec, error_codes, CallKind, Frame, ProtocolError, PROTOCOL_VERSION};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

type WsSink = SplitSink<WebSocket, Message>;

/// Shared server state.
pub struct AppState {
    /// Server configuration.
    pub config: Config,
    /// Connection-to-user registry.
    pub registry: Arc<ConnectionRegistry>,
    /// The broadcast bus.
    pub bus: Arc<GroupBus>,
    /// Call lifecycle state machine.
    pub calls: Arc<CallStateMachine>,
    /// Call orchestration and broadcasts.
    pub coordinator: CallCoordinator,
    /// Signaling relay.
    pub relay: SignalingRelay,
    /// Delivered/read receipt tracker.
    pub receipts: MessageDeliveryTracker,
    /// Presence transitions.
    pub presence: PresenceBroadcaster,
    /// Message and chat-membership persistence.
    pub messages: Arc<dyn MessageStore>,
    /// Token resolution.
    pub auth: Arc<dyn Authenticator>,
}

impl AppState {
    /// Create app state backed by the in-memory collaborators.
    ///
    /// Membership is wide open and the token is taken as the user id;
    /// suitable for development and testing only.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self::with_collaborators(
            config,
            Arc::new(chorus_core::MemoryCallStore::new()),
            Arc::new(chorus_core::MemoryMessageStore::open()),
            Arc::new(chorus_core::MemoryProfileStore::new()),
            Arc::new(chorus_core::InsecureAuthenticator),
        )
    }

    /// Create app state with explicit persistence and auth collaborators.
    #[must_use]
    pub fn with_collaborators(
        config: Config,
        call_store: Arc<dyn CallStore>,
        messages: Arc<dyn MessageStore>,
        profiles: Arc<dyn ProfileStore>,
        auth: Arc<dyn Authenticator>,
    ) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let bus = Arc::new(GroupBus::with_config(
            Arc::clone(&registry),
            BusConfig {
                max_groups_per_connection: config.limits.max_groups_per_connection,
                ..BusConfig::default()
            },
        ));
        let calls = Arc::new(CallStateMachine::new(call_store));
        let coordinator = CallCoordinator::new(Arc::clone(&calls), Arc::clone(&bus));
        let relay =
            SignalingRelay::with_max_payload(Arc::clone(&bus), config.limits.max_signal_payload_bytes);
        let presence = PresenceBroadcaster::new(Arc::clone(&bus), profiles);

        Self {
            config,
            registry,
            bus,
            calls,
            coordinator,
            relay,
            receipts: MessageDeliveryTracker::new(),
            presence,
            messages,
            auth,
        }
    }
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let state = Arc::new(AppState::new(config.clone()));

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    // Build router
    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state);

    // Bind and serve
    let addr = config.bind_addr();
    let listener = TcpListener::bind(addr).await?;

    info!("Chorus server listening on {}", addr);
    info!("WebSocket endpoint: ws://{}/ws", addr);

    axum::serve(listener, app).await?;

    Ok(())
}

/// Health check handler.
async fn health_handler() -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_websocket(socket, state))
}

/// Handle a WebSocket connection.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>) {
    // Record connection metrics
    let _metrics_guard = ConnectionMetricsGuard::new();

    // Generate connection ID
    let connection_id = format!(
        "conn_{}",
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos()
    );

    debug!(connection = %connection_id, "WebSocket connected");

    // Split the WebSocket
    let (mut sender, mut receiver) = socket.split();

    // Read buffer for partial frames; shared between handshake and loop so
    // bytes that arrived behind the Connect frame are not lost.
    let mut read_buffer = BytesMut::with_capacity(4096);

    // The first frame must be Connect.
    let Some(frame) = await_first_frame(&mut receiver, &mut read_buffer).await else {
        debug!(connection = %connection_id, "Closed before handshake");
        return;
    };
    let Frame::Connect { version, token } = frame else {
        let _ = send_frame(
            &mut sender,
            &Frame::error(0, error_codes::UNAUTHENTICATED, "Expected Connect frame"),
        )
        .await;
        return;
    };
    if version != PROTOCOL_VERSION {
        let _ = send_frame(
            &mut sender,
            &Frame::error(
                0,
                error_codes::MALFORMED,
                format!("Unsupported protocol version {version}"),
            ),
        )
        .await;
        return;
    }
    if state.registry.connection_count() >= state.config.limits.max_connections {
        let _ = send_frame(
            &mut sender,
            &Frame::error(0, error_codes::UNAVAILABLE, "Server at connection capacity"),
        )
        .await;
        return;
    }

    // Resolve the token; this identity is the only one trusted from here on.
    let user_id = match state.auth.authenticate(&token).await {
        Ok(Some(user_id)) => user_id,
        Ok(None) => {
            let _ = send_frame(
                &mut sender,
                &Frame::error(0, error_codes::UNAUTHENTICATED, "Invalid token"),
            )
            .await;
            return;
        }
        Err(e) => {
            warn!(connection = %connection_id, error = %e, "Authentication backend failed");
            metrics::record_error("auth");
            let _ = send_frame(
                &mut sender,
                &Frame::error(0, error_codes::UNAVAILABLE, "Authentication unavailable"),
            )
            .await;
            return;
        }
    };

    // Open the direct lane, register, announce presence.
    let mut direct_rx = state.bus.attach(&connection_id);
    let first = state.registry.register(&connection_id, &user_id);
    state.presence.connection_opened(&user_id, first);

    let connected = Frame::connected(
        &connection_id,
        &user_id,
        state.config.heartbeat.interval_ms as u32,
    );
    if send_frame(&mut sender, &connected).await.is_err() {
        error!(connection = %connection_id, "Failed to send Connected frame");
        teardown(&state, &connection_id, &user_id).await;
        return;
    }

    info!(connection = %connection_id, user = %user_id, "Session established");

    // All outbound events funnel through one mpsc lane: the direct lane is
    // forwarded by a task, and each joined group gets a forwarder task that
    // applies the delivery's exclusions.
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<Arc<ServerEvent>>();
    let direct_task = {
        let tx = event_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = direct_rx.recv().await {
                if tx.send(event).is_err() {
                    break;
                }
            }
        })
    };
    let mut group_tasks: HashMap<String, JoinHandle<()>> = HashMap::new();

    // Message processing loop
    loop {
        tokio::select! {
            biased;

            // Events bound for this connection
            Some(event) = event_rx.recv() => {
                if send_event(&mut sender, &event).await.is_err() {
                    break;
                }
            }

            // Receive from WebSocket
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        let start = Instant::now();
                        metrics::record_frame(data.len(), "inbound");
                        read_buffer.extend_from_slice(&data);

                        let (frames, decode_err) = drain_frames(&mut read_buffer);
                        for frame in &frames {
                            if let Err(e) = handle_frame(
                                frame,
                                &connection_id,
                                &user_id,
                                &state,
                                &mut sender,
                                &mut group_tasks,
                                &event_tx,
                            ).await {
                                error!(connection = %connection_id, error = %e, "Frame handling error");
                                break;
                            }
                        }
                        metrics::record_latency(start.elapsed().as_secs_f64());

                        if let Some(e) = decode_err {
                            // Framing is lost once a frame fails to parse;
                            // later bytes would misparse as length prefixes.
                            warn!(connection = %connection_id, error = %e, "Malformed frame, closing");
                            metrics::record_error("decode");
                            let _ = send_frame(
                                &mut sender,
                                &Frame::error(0, error_codes::MALFORMED, e.to_string()),
                            ).await;
                            break;
                        }
                    }
                    Some(Ok(Message::Text(text))) => {
                        // Treat text as binary
                        read_buffer.extend_from_slice(text.as_bytes());
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        // Ignore pongs
                    }
                    Some(Ok(Message::Close(_))) => {
                        debug!(connection = %connection_id, "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(connection = %connection_id, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(connection = %connection_id, "WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    // Cleanup: abort forwarder tasks, then unwind engine state.
    direct_task.abort();
    for (_, handle) in group_tasks {
        handle.abort();
    }
    teardown(&state, &connection_id, &user_id).await;

    debug!(connection = %connection_id, user = %user_id, "WebSocket disconnected");
}

/// Unwind all engine state held for a connection.
async fn teardown(state: &Arc<AppState>, connection_id: &str, user_id: &str) {
    state.bus.detach(connection_id);
    state.coordinator.leave_all(user_id).await;
    if let Some((user, last)) = state.registry.unregister(connection_id) {
        state.presence.connection_closed(&user, last);
    }
    metrics::set_active_groups(state.bus.stats().group_count);
    metrics::set_active_calls(state.calls.active_call_count());
}

/// Read frames until the first complete one arrives.
async fn await_first_frame(
    receiver: &mut SplitStream<WebSocket>,
    read_buffer: &mut BytesMut,
) -> Option<Frame> {
    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Binary(data)) => read_buffer.extend_from_slice(&data),
            Ok(Message::Text(text)) => read_buffer.extend_from_slice(text.as_bytes()),
            Ok(Message::Ping(_) | Message::Pong(_)) => continue,
            Ok(Message::Close(_)) | Err(_) => return None,
        }
        match codec::decode_from(read_buffer) {
            Ok(Some(frame)) => return Some(frame),
            Ok(None) => continue,
            Err(e) => {
                warn!(error = %e, "Malformed handshake frame");
                return None;
            }
        }
    }
    None
}

/// Handle a decoded frame from an authenticated connection.
async fn handle_frame(
    frame: &Frame,
    connection_id: &str,
    user_id: &str,
    state: &Arc<AppState>,
    sender: &mut WsSink,
    group_tasks: &mut HashMap<String, JoinHandle<()>>,
    event_tx: &mpsc::UnboundedSender<Arc<ServerEvent>>,
) -> Result<()> {
    match frame {
        Frame::JoinChat { id, chat_id } => {
            debug!(connection = %connection_id, chat = %chat_id, "Join chat request");

            if !check_membership(state, sender, *id, chat_id, user_id).await? {
                return Ok(());
            }

            let response = match state.bus.join_group(connection_id, chat_id) {
                Ok(rx) => {
                    let handle =
                        spawn_group_forwarder(rx, connection_id.to_string(), event_tx.clone());
                    group_tasks.insert(chat_id.clone(), handle);
                    metrics::set_active_groups(state.bus.stats().group_count);
                    Frame::ack(*id)
                }
                // Rejoin is a no-op; the forwarder is already running.
                Err(BusError::AlreadyJoined(_)) => Frame::ack(*id),
                Err(e @ BusError::InvalidGroup(_)) => {
                    Frame::error(*id, error_codes::MALFORMED, e.to_string())
                }
                Err(e @ BusError::MaxGroupsReached) => {
                    Frame::error(*id, error_codes::CONFLICT, e.to_string())
                }
            };
            send_frame(sender, &response).await?;
        }

        Frame::LeaveChat { id, chat_id } => {
            debug!(connection = %connection_id, chat = %chat_id, "Leave chat request");

            if let Some(handle) = group_tasks.remove(chat_id) {
                handle.abort();
            }
            // Leaving a chat you never joined is a harmless no-op.
            state.bus.leave_group(connection_id, chat_id);
            metrics::set_active_groups(state.bus.stats().group_count);
            send_frame(sender, &Frame::ack(*id)).await?;
        }

        Frame::SendMessage {
            id,
            chat_id,
            content,
            kind,
        } => {
            if content.len() > state.config.limits.max_message_bytes {
                send_frame(
                    sender,
                    &Frame::error(*id, error_codes::PAYLOAD_TOO_LARGE, "Message too large"),
                )
                .await?;
                return Ok(());
            }
            if !check_membership(state, sender, *id, chat_id, user_id).await? {
                return Ok(());
            }

            let message = chorus_core::Message::new(chat_id, user_id, content, *kind);
            if let Err(e) = state.messages.save_message(&message).await {
                warn!(connection = %connection_id, error = %e, "Message save failed");
                metrics::record_error("store");
                send_frame(
                    sender,
                    &Frame::error(*id, error_codes::UNAVAILABLE, "Storage unavailable"),
                )
                .await?;
                return Ok(());
            }

            let recipients = state
                .bus
                .publish_to_group(chat_id, ServerEvent::MessageReceived { message }, &[]);
            debug!(connection = %connection_id, chat = %chat_id, recipients, "Message published");
            send_frame(sender, &Frame::ack(*id)).await?;
        }

        Frame::StartTyping { chat_id } => {
            // Fire-and-forget; the typist's own connection is excluded.
            state.bus.publish_to_group(
                chat_id,
                ServerEvent::UserTyping {
                    chat_id: chat_id.clone(),
                    user_id: user_id.to_string(),
                },
                &[connection_id.to_string()],
            );
        }

        Frame::StopTyping { chat_id } => {
            state.bus.publish_to_group(
                chat_id,
                ServerEvent::UserStoppedTyping {
                    chat_id: chat_id.clone(),
                    user_id: user_id.to_string(),
                },
                &[connection_id.to_string()],
            );
        }

        Frame::AddReaction {
            id,
            message_id,
            emoji,
        } => {
            let Some(message) = load_message(state, sender, *id, message_id).await? else {
                return Ok(());
            };
            if !check_membership(state, sender, *id, &message.chat_id, user_id).await? {
                return Ok(());
            }

            match state.messages.add_reaction(message_id, user_id, emoji).await {
                Ok(Some(added)) => {
                    if added {
                        state.bus.publish_to_group(
                            &message.chat_id,
                            ServerEvent::ReactionAdded {
                                message_id: message_id.clone(),
                                user_id: user_id.to_string(),
                                emoji: emoji.clone(),
                            },
                            &[],
                        );
                    }
                    send_frame(sender, &Frame::ack(*id)).await?;
                }
                Ok(None) => {
                    send_frame(
                        sender,
                        &Frame::error(*id, error_codes::NOT_FOUND, "Unknown message"),
                    )
                    .await?;
                }
                Err(e) => {
                    warn!(connection = %connection_id, error = %e, "Reaction write failed");
                    metrics::record_error("store");
                    send_frame(
                        sender,
                        &Frame::error(*id, error_codes::UNAVAILABLE, "Storage unavailable"),
                    )
                    .await?;
                }
            }
        }

        Frame::RemoveReaction {
            id,
            message_id,
            emoji,
        } => {
            let Some(message) = load_message(state, sender, *id, message_id).await? else {
                return Ok(());
            };
            if !check_membership(state, sender, *id, &message.chat_id, user_id).await? {
                return Ok(());
            }

            match state
                .messages
                .remove_reaction(message_id, user_id, emoji)
                .await
            {
                Ok(Some(removed)) => {
                    if removed {
                        state.bus.publish_to_group(
                            &message.chat_id,
                            ServerEvent::ReactionRemoved {
                                message_id: message_id.clone(),
                                user_id: user_id.to_string(),
                                emoji: emoji.clone(),
                            },
                            &[],
                        );
                    }
                    send_frame(sender, &Frame::ack(*id)).await?;
                }
                Ok(None) => {
                    send_frame(
                        sender,
                        &Frame::error(*id, error_codes::NOT_FOUND, "Unknown message"),
                    )
                    .await?;
                }
                Err(e) => {
                    warn!(connection = %connection_id, error = %e, "Reaction write failed");
                    metrics::record_error("store");
                    send_frame(
                        sender,
                        &Frame::error(*id, error_codes::UNAVAILABLE, "Storage unavailable"),
                    )
                    .await?;
                }
            }
        }

        Frame::MarkDelivered { id, message_id } => {
            let Some(message) = load_message(state, sender, *id, message_id).await? else {
                return Ok(());
            };
            if !check_membership(state, sender, *id, &message.chat_id, user_id).await? {
                return Ok(());
            }

            // Repeated marks grow nothing and publish nothing.
            if state
                .receipts
                .mark_delivered(message_id, &message.sender_id, user_id)
            {
                let counts = state.receipts.counts(message_id);
                state.bus.publish_to_group(
                    &message.chat_id,
                    ServerEvent::MessageDelivered {
                        message_id: message_id.clone(),
                        user_id: user_id.to_string(),
                        delivered_count: counts.delivered,
                    },
                    &[],
                );
            }
            send_frame(sender, &Frame::ack(*id)).await?;
        }

        Frame::MarkRead { id, message_id } => {
            let Some(message) = load_message(state, sender, *id, message_id).await? else {
                return Ok(());
            };
            if !check_membership(state, sender, *id, &message.chat_id, user_id).await? {
                return Ok(());
            }

            if state
                .receipts
                .mark_read(message_id, &message.sender_id, user_id)
            {
                let counts = state.receipts.counts(message_id);
                state.bus.publish_to_group(
                    &message.chat_id,
                    ServerEvent::MessageRead {
                        message_id: message_id.clone(),
                        user_id: user_id.to_string(),
                        read_count: counts.read,
                    },
                    &[],
                );
            }
            send_frame(sender, &Frame::ack(*id)).await?;
        }

        Frame::StartCall { id, chat_id, kind } => {
            debug!(connection = %connection_id, chat = %chat_id, ?kind, "Start call request");

            if !check_membership(state, sender, *id, chat_id, user_id).await? {
                return Ok(());
            }

            let response = match state.coordinator.start_call(chat_id, user_id, *kind).await {
                Ok(_) => {
                    metrics::record_call_started(call_kind_label(*kind));
                    metrics::set_active_calls(state.calls.active_call_count());
                    Frame::ack(*id)
                }
                Err(e) => engine_error_frame(*id, &e),
            };
            send_frame(sender, &response).await?;
        }

        Frame::JoinCall { id, call_id } => {
            if let Err(denial) = authorize_call_access(state, *id, call_id, user_id).await {
                send_frame(sender, &denial).await?;
                return Ok(());
            }

            let response = match state.coordinator.join_call(call_id, user_id).await {
                Ok(()) => Frame::ack(*id),
                Err(e) => engine_error_frame(*id, &e),
            };
            send_frame(sender, &response).await?;
        }

        Frame::LeaveCall { id, call_id } => {
            let response = match state.coordinator.leave_call(call_id, user_id).await {
                Ok(true) => {
                    metrics::set_active_calls(state.calls.active_call_count());
                    Frame::ack(*id)
                }
                Ok(false) => {
                    Frame::error(*id, error_codes::NOT_FOUND, "Not an active participant")
                }
                Err(e) => engine_error_frame(*id, &e),
            };
            send_frame(sender, &response).await?;
        }

        Frame::EndCall { id, call_id } => {
            // Force-end is open to any member of the call's chat.
            if let Err(denial) = authorize_call_access(state, *id, call_id, user_id).await {
                send_frame(sender, &denial).await?;
                return Ok(());
            }

            let response = match state.coordinator.end_call(call_id).await {
                Ok(true) => {
                    metrics::set_active_calls(state.calls.active_call_count());
                    Frame::ack(*id)
                }
                Ok(false) => Frame::error(*id, error_codes::CONFLICT, "Call already ended"),
                Err(e) => engine_error_frame(*id, &e),
            };
            send_frame(sender, &response).await?;
        }

        Frame::ToggleMute { id, call_id } => {
            let response = match state.coordinator.toggle_mute(call_id, user_id).await {
                Ok(Some(_)) => Frame::ack(*id),
                Ok(None) => {
                    Frame::error(*id, error_codes::NOT_FOUND, "Not an active participant")
                }
                Err(e) => engine_error_frame(*id, &e),
            };
            send_frame(sender, &response).await?;
        }

        Frame::ToggleVideo { id, call_id } => {
            let response = match state.coordinator.toggle_video(call_id, user_id).await {
                Ok(Some(_)) => Frame::ack(*id),
                Ok(None) => {
                    Frame::error(*id, error_codes::NOT_FOUND, "Not an active participant")
                }
                Err(e) => engine_error_frame(*id, &e),
            };
            send_frame(sender, &response).await?;
        }

        Frame::ToggleScreenShare { id, call_id } => {
            let response = match state.coordinator.toggle_screen_share(call_id, user_id).await {
                Ok(Some(_)) => Frame::ack(*id),
                Ok(None) => {
                    Frame::error(*id, error_codes::NOT_FOUND, "Not an active participant")
                }
                Err(e) => engine_error_frame(*id, &e),
            };
            send_frame(sender, &response).await?;
        }

        Frame::Offer {
            call_id,
            target_user_id,
            payload,
        } => {
            relay_signal(
                state,
                sender,
                SignalKind::Offer,
                call_id,
                user_id,
                target_user_id,
                payload,
            )
            .await?;
        }

        Frame::Answer {
            call_id,
            target_user_id,
            payload,
        } => {
            relay_signal(
                state,
                sender,
                SignalKind::Answer,
                call_id,
                user_id,
                target_user_id,
                payload,
            )
            .await?;
        }

        Frame::IceCandidate {
            call_id,
            target_user_id,
            payload,
        } => {
            relay_signal(
                state,
                sender,
                SignalKind::IceCandidate,
                call_id,
                user_id,
                target_user_id,
                payload,
            )
            .await?;
        }

        Frame::Ping { timestamp } => {
            send_frame(sender, &Frame::pong(*timestamp)).await?;
        }

        Frame::Pong { .. } => {
            // Keepalive response; nothing to do.
        }

        Frame::Connect { .. } => {
            debug!(connection = %connection_id, "Connect frame on established session, ignored");
        }

        Frame::Connected { .. } | Frame::Ack { .. } | Frame::Error { .. } | Frame::Event { .. } => {
            warn!(connection = %connection_id, "Unexpected server-to-client frame from client");
        }
    }

    Ok(())
}

/// Drain complete frames from the read buffer.
///
/// Stops at the first malformed frame: once a frame fails to parse the
/// stream offset is unrecoverable and the connection must be dropped.
fn drain_frames(read_buffer: &mut BytesMut) -> (Vec<Frame>, Option<ProtocolError>) {
    let mut frames = Vec::new();
    loop {
        match codec::decode_from(read_buffer) {
            Ok(Some(frame)) => frames.push(frame),
            Ok(None) => return (frames, None),
            Err(e) => return (frames, Some(e)),
        }
    }
}

/// Resolve a call's chat and verify the caller belongs to it.
///
/// Returns the error frame to answer with when the call is unknown or the
/// caller is not a member of its chat.
async fn authorize_call_access(
    state: &Arc<AppState>,
    id: u64,
    call_id: &str,
    user_id: &str,
) -> Result<(), Frame> {
    let Some(snapshot) = state.calls.snapshot(call_id).await else {
        return Err(Frame::error(id, error_codes::NOT_FOUND, "Unknown call"));
    };
    match state
        .messages
        .is_chat_member(&snapshot.call.chat_id, user_id)
        .await
    {
        Ok(true) => Ok(()),
        Ok(false) => Err(Frame::error(
            id,
            error_codes::UNAUTHORIZED,
            "Not a chat member",
        )),
        Err(e) => {
            warn!(call = %call_id, error = %e, "Membership lookup failed");
            metrics::record_error("store");
            Err(Frame::error(
                id,
                error_codes::UNAVAILABLE,
                "Storage unavailable",
            ))
        }
    }
}

/// Verify chat membership, answering with an error frame on denial.
///
/// Returns `false` when the caller may not proceed.
async fn check_membership(
    state: &Arc<AppState>,
    sender: &mut WsSink,
    id: u64,
    chat_id: &str,
    user_id: &str,
) -> Result<bool> {
    match state.messages.is_chat_member(chat_id, user_id).await {
        Ok(true) => Ok(true),
        Ok(false) => {
            send_frame(
                sender,
                &Frame::error(id, error_codes::UNAUTHORIZED, "Not a chat member"),
            )
            .await?;
            Ok(false)
        }
        Err(e) => {
            warn!(chat = %chat_id, error = %e, "Membership lookup failed");
            metrics::record_error("store");
            send_frame(
                sender,
                &Frame::error(id, error_codes::UNAVAILABLE, "Storage unavailable"),
            )
            .await?;
            Ok(false)
        }
    }
}

/// Load a message, answering with an error frame when it cannot be had.
async fn load_message(
    state: &Arc<AppState>,
    sender: &mut WsSink,
    id: u64,
    message_id: &str,
) -> Result<Option<chorus_core::Message>> {
    match state.messages.load_message(message_id).await {
        Ok(Some(message)) => Ok(Some(message)),
        Ok(None) => {
            send_frame(
                sender,
                &Frame::error(id, error_codes::NOT_FOUND, "Unknown message"),
            )
            .await?;
            Ok(None)
        }
        Err(e) => {
            warn!(message = %message_id, error = %e, "Message load failed");
            metrics::record_error("store");
            send_frame(
                sender,
                &Frame::error(id, error_codes::UNAVAILABLE, "Storage unavailable"),
            )
            .await?;
            Ok(None)
        }
    }
}

/// Relay a signaling payload, answering with an error frame on rejection.
async fn relay_signal(
    state: &Arc<AppState>,
    sender: &mut WsSink,
    kind: SignalKind,
    call_id: &str,
    from_user_id: &str,
    target_user_id: &str,
    payload: &[u8],
) -> Result<()> {
    match state
        .relay
        .relay(kind, call_id, from_user_id, target_user_id, payload.to_vec())
    {
        Ok(_) => {
            metrics::record_signal(signal_kind_label(kind));
        }
        Err(e) => {
            // Signaling frames carry no request id; the error stands alone.
            send_frame(sender, &engine_error_frame(0, &e)).await?;
        }
    }
    Ok(())
}

/// Spawn a task forwarding group deliveries to the connection's event lane,
/// honoring each delivery's exclusion list.
fn spawn_group_forwarder(
    mut rx: broadcast::Receiver<Arc<Delivery>>,
    connection_id: String,
    tx: mpsc::UnboundedSender<Arc<ServerEvent>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(delivery) => {
                    if delivery.excludes(&connection_id) {
                        continue;
                    }
                    if tx.send(Arc::clone(&delivery.event)).is_err() {
                        break; // Receiver dropped
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(connection = %connection_id, skipped, "Group forwarder lagged");
                    metrics::record_error("lagged");
                }
            }
        }
    })
}

/// Map an engine error to the wire error frame, logging opaque failures.
fn engine_error_frame(id: u64, err: &EngineError) -> Frame {
    match err {
        EngineError::NotFound(m) => Frame::error(id, error_codes::NOT_FOUND, m.clone()),
        EngineError::Conflict(m) => Frame::error(id, error_codes::CONFLICT, m.clone()),
        EngineError::Unauthorized(m) => Frame::error(id, error_codes::UNAUTHORIZED, m.clone()),
        EngineError::Payload(m) => Frame::error(id, error_codes::PAYLOAD_TOO_LARGE, m.clone()),
        EngineError::Transient(m) => {
            warn!(error = %m, "Transient engine failure");
            metrics::record_error("store");
            Frame::error(id, error_codes::UNAVAILABLE, "Storage unavailable")
        }
        EngineError::Internal(m) => {
            error!(error = %m, "Internal engine failure");
            metrics::record_error("internal");
            Frame::error(id, error_codes::INTERNAL, "Internal error")
        }
    }
}

fn call_kind_label(kind: CallKind) -> &'static str {
    match kind {
        CallKind::Voice => "voice",
        CallKind::Video => "video",
        CallKind::AudioRoom => "audio_room",
    }
}

fn signal_kind_label(kind: SignalKind) -> &'static str {
    match kind {
        SignalKind::Offer => "offer",
        SignalKind::Answer => "answer",
        SignalKind::IceCandidate => "ice_candidate",
    }
}

/// Encode an event into an Event frame and send it.
async fn send_event(sender: &mut WsSink, event: &ServerEvent) -> Result<()> {
    let payload = rmp_serde::to_vec_named(event)?;
    send_frame(sender, &Frame::event(event.name(), payload)).await
}

/// Send a frame to the WebSocket.
async fn send_frame(sender: &mut WsSink, frame: &Frame) -> Result<()> {
    let data = codec::encode(frame)?;
    metrics::record_frame(data.len(), "outbound");
    sender.send(Message::Binary(data.to_vec())).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_errors_map_to_wire_codes() {
        let cases = [
            (EngineError::NotFound("x".into()), error_codes::NOT_FOUND),
            (EngineError::Conflict("x".into()), error_codes::CONFLICT),
            (
                EngineError::Unauthorized("x".into()),
                error_codes::UNAUTHORIZED,
            ),
            (
                EngineError::Payload("x".into()),
                error_codes::PAYLOAD_TOO_LARGE,
            ),
            (EngineError::Transient("x".into()), error_codes::UNAVAILABLE),
            (EngineError::Internal("x".into()), error_codes::INTERNAL),
        ];
        for (err, expected) in cases {
            match engine_error_frame(7, &err) {
                Frame::Error { id, code, .. } => {
                    assert_eq!(id, 7);
                    assert_eq!(code, expected);
                }
                other => panic!("unexpected frame: {other:?}"),
            }
        }
    }

    #[test]
    fn transient_details_stay_out_of_the_wire_message() {
        let frame = engine_error_frame(1, &EngineError::Transient("db host 10.0.0.3 down".into()));
        match frame {
            Frame::Error { message, .. } => assert_eq!(message, "Storage unavailable"),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn malformed_input_stops_the_frame_drain() {
        let mut buf = BytesMut::new();
        codec::encode_into(&Frame::ack(1), &mut buf).unwrap();
        // A length prefix far beyond the frame cap, then junk.
        buf.extend_from_slice(&u32::MAX.to_be_bytes());
        buf.extend_from_slice(b"junk");

        let (frames, err) = drain_frames(&mut buf);
        assert_eq!(frames, vec![Frame::ack(1)]);
        assert!(matches!(err, Some(ProtocolError::FrameTooLarge(_))));
    }

    #[tokio::test]
    async fn call_access_requires_chat_membership() {
        let messages = Arc::new(chorus_core::MemoryMessageStore::new());
        messages.add_chat_member("chat-1", "alice");
        let state = Arc::new(AppState::with_collaborators(
            Config::default(),
            Arc::new(chorus_core::MemoryCallStore::new()),
            messages,
            Arc::new(chorus_core::MemoryProfileStore::new()),
            Arc::new(chorus_core::InsecureAuthenticator),
        ));
        let call = state
            .coordinator
            .start_call("chat-1", "alice", CallKind::Voice)
            .await
            .unwrap()
            .call;

        // A non-member is denied before any call mutation runs.
        match authorize_call_access(&state, 3, &call.id, "mallory").await {
            Err(Frame::Error { id, code, .. }) => {
                assert_eq!(id, 3);
                assert_eq!(code, error_codes::UNAUTHORIZED);
            }
            other => panic!("expected denial, got {other:?}"),
        }
        let roster = state.calls.snapshot(&call.id).await.unwrap();
        assert_eq!(roster.participants.len(), 1);

        assert!(authorize_call_access(&state, 3, &call.id, "alice")
            .await
            .is_ok());

        match authorize_call_access(&state, 3, "missing", "alice").await {
            Err(Frame::Error { code, .. }) => assert_eq!(code, error_codes::NOT_FOUND),
            other => panic!("expected denial, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn app_state_wires_the_engine() {
        let state = AppState::new(Config::default());
        assert_eq!(state.registry.connection_count(), 0);
        assert_eq!(state.calls.active_call_count(), 0);

        // The default collaborators accept any member.
        assert!(state
            .messages
            .is_chat_member("chat-1", "anyone")
            .await
            .unwrap());
    }
}
