use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use invitrack_core::{InviteTracker, Notification};
use invitrack_models::gateway::{
    parse_dispatch, Dispatch, GatewayMessage, OP_DISPATCH, OP_HEARTBEAT, OP_HEARTBEAT_ACK,
    OP_HELLO, OP_INVALID_SESSION, OP_RECONNECT,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const HELLO_TIMEOUT: Duration = Duration::from_secs(15);
const RECONNECT_BASE_DELAY: Duration = Duration::from_secs(1);
const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(60);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWriter = Arc<Mutex<SplitSink<WsStream, Message>>>;

/// What to do with one decoded dispatch.
#[derive(Debug, PartialEq)]
pub enum Route {
    Bootstrap(Vec<i64>),
    Notify(Notification),
    Skip,
}

/// Servers seen on this gateway connection, across reconnects.
#[derive(Debug, Default)]
pub struct ServerRegistry {
    known: HashSet<i64>,
    /// Servers loaded by the READY bootstrap whose GUILD_CREATE has not arrived yet.
    awaiting_create: HashSet<i64>,
    bootstrapped: bool,
}

impl ServerRegistry {
    pub fn route(&mut self, dispatch: Dispatch) -> Route {
        match dispatch {
            Dispatch::Ready { server_ids } => {
                if self.bootstrapped {
                    // Reconnect: each server follows with its own GUILD_CREATE.
                    return Route::Skip;
                }
                self.bootstrapped = true;
                self.known.extend(&server_ids);
                self.awaiting_create.extend(&server_ids);
                Route::Bootstrap(server_ids)
            }
            Dispatch::GuildCreate { server_id } => {
                if self.awaiting_create.remove(&server_id) {
                    Route::Skip
                } else if self.known.insert(server_id) {
                    Route::Notify(Notification::ServerJoined(server_id))
                } else {
                    Route::Notify(Notification::ServerAvailable(server_id))
                }
            }
            Dispatch::GuildDelete {
                server_id,
                unavailable,
            } => {
                self.awaiting_create.remove(&server_id);
                if unavailable {
                    Route::Notify(Notification::ServerUnavailable(server_id))
                } else {
                    self.known.remove(&server_id);
                    Route::Notify(Notification::ServerRemoved(server_id))
                }
            }
            Dispatch::InviteCreate(invite) => Route::Notify(Notification::InviteCreated(invite)),
            Dispatch::InviteDelete { server_id, code } => {
                Route::Notify(Notification::InviteDeleted { server_id, code })
            }
            Dispatch::ChannelDelete {
                server_id,
                channel_id,
            } => Route::Notify(Notification::ChannelDeleted {
                server_id,
                channel_id,
            }),
            Dispatch::MemberAdd(member) => Route::Notify(Notification::MemberJoined(member)),
            Dispatch::Ignored => Route::Skip,
        }
    }
}

enum SessionEnd {
    Reconnect,
    Closed,
}

/// WebSocket consumer that feeds platform dispatches to the tracker in
/// arrival order.
pub struct GatewayConsumer {
    url: String,
    token: String,
    intents: u64,
    tracker: Arc<InviteTracker>,
    registry: ServerRegistry,
}

impl GatewayConsumer {
    pub fn new(url: &str, token: &str, intents: u64, tracker: Arc<InviteTracker>) -> Self {
        Self {
            url: url.to_string(),
            token: token.to_string(),
            intents,
            tracker,
            registry: ServerRegistry::default(),
        }
    }

    /// Connect and reconnect forever. Cancel by aborting the task.
    pub async fn run(mut self) {
        let mut delay = RECONNECT_BASE_DELAY;
        loop {
            match self.session().await {
                Ok(SessionEnd::Reconnect) => {
                    tracing::info!("Gateway asked to reconnect");
                    delay = RECONNECT_BASE_DELAY;
                }
                Ok(SessionEnd::Closed) => {
                    tracing::warn!("Gateway connection closed");
                    delay = RECONNECT_BASE_DELAY;
                }
                Err(e) => {
                    tracing::warn!("Gateway session failed: {:#}", e);
                }
            }
            tracing::info!("Reconnecting to gateway in {:?}", delay);
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(RECONNECT_MAX_DELAY);
        }
    }

    async fn session(&mut self) -> Result<SessionEnd> {
        let (stream, _) = tokio::time::timeout(
            CONNECT_TIMEOUT,
            tokio_tungstenite::connect_async(self.url.as_str()),
        )
        .await
        .map_err(|_| anyhow!("connect timed out after {:?}", CONNECT_TIMEOUT))?
        .context("gateway connect failed")?;
        let (writer, mut reader) = stream.split();
        let writer: WsWriter = Arc::new(Mutex::new(writer));

        let hello = tokio::time::timeout(HELLO_TIMEOUT, next_message(&mut reader))
            .await
            .map_err(|_| anyhow!("no HELLO within {:?}", HELLO_TIMEOUT))??
            .ok_or_else(|| anyhow!("gateway closed before HELLO"))?;
        let interval_ms = hello
            .heartbeat_interval_ms()
            .ok_or_else(|| anyhow!("expected HELLO, got op {}", hello.op))?;

        send(&writer, &GatewayMessage::identify(&self.token, self.intents)).await?;
        tracing::info!(heartbeat_ms = interval_ms, "Gateway connected, identified");

        let (sequence_tx, sequence_rx) = watch::channel(None::<u64>);
        let heartbeat = tokio::spawn(heartbeat_loop(
            writer.clone(),
            Duration::from_millis(interval_ms.max(1)),
            sequence_rx,
        ));

        let result = self.read_loop(&mut reader, &writer, &sequence_tx).await;
        heartbeat.abort();
        let _ = writer.lock().await.close().await;
        result
    }

    async fn read_loop(
        &mut self,
        reader: &mut futures_util::stream::SplitStream<WsStream>,
        writer: &WsWriter,
        sequence: &watch::Sender<Option<u64>>,
    ) -> Result<SessionEnd> {
        while let Some(message) = next_message(reader).await? {
            if let Some(seq) = message.s {
                sequence.send_replace(Some(seq));
            }
            match message.op {
                OP_DISPATCH => {
                    let Some(event_type) = message.t.as_deref() else {
                        continue;
                    };
                    let payload = message.d.unwrap_or_default();
                    match parse_dispatch(event_type, payload, Utc::now()) {
                        Ok(dispatch) => self.dispatch(dispatch).await,
                        Err(e) => {
                            tracing::warn!(event_type, error = %e, "Malformed dispatch dropped")
                        }
                    }
                }
                OP_HEARTBEAT => {
                    let last = *sequence.borrow();
                    send(writer, &GatewayMessage::heartbeat(last)).await?;
                }
                OP_HEARTBEAT_ACK => {}
                OP_RECONNECT | OP_INVALID_SESSION => return Ok(SessionEnd::Reconnect),
                OP_HELLO => bail!("unexpected second HELLO"),
                other => tracing::debug!(op = other, "Unhandled gateway opcode"),
            }
        }
        Ok(SessionEnd::Closed)
    }

    async fn dispatch(&mut self, dispatch: Dispatch) {
        match self.registry.route(dispatch) {
            Route::Bootstrap(server_ids) => {
                self.tracker.bootstrap(&server_ids).await;
                // The first recompute must see the bootstrapped cache.
                self.tracker.start();
            }
            Route::Notify(notification) => {
                let server_id = notification.server_id();
                if let Err(e) = self.tracker.handle(notification).await {
                    tracing::warn!(server_id, error = %e, "Notification dropped");
                }
            }
            Route::Skip => {}
        }
    }
}

/// Next JSON frame, skipping pings and binary frames. `None` once the peer closes.
async fn next_message(
    reader: &mut futures_util::stream::SplitStream<WsStream>,
) -> Result<Option<GatewayMessage>> {
    while let Some(frame) = reader.next().await {
        match frame.context("gateway read failed")? {
            Message::Text(text) => {
                let message = serde_json::from_str(text.as_str())
                    .context("gateway frame is not a gateway message")?;
                return Ok(Some(message));
            }
            Message::Close(frame) => {
                if let Some(frame) = frame {
                    tracing::info!(code = %frame.code, reason = %frame.reason.as_str(), "Gateway closed");
                }
                return Ok(None);
            }
            _ => {}
        }
    }
    Ok(None)
}

async fn send(writer: &WsWriter, message: &GatewayMessage) -> Result<()> {
    let text = serde_json::to_string(message)?;
    writer
        .lock()
        .await
        .send(Message::text(text))
        .await
        .context("gateway write failed")
}

async fn heartbeat_loop(
    writer: WsWriter,
    period: Duration,
    sequence: watch::Receiver<Option<u64>>,
) {
    let mut interval = tokio::time::interval(period);
    // The first tick completes immediately; IDENTIFY has just been sent.
    interval.tick().await;
    loop {
        interval.tick().await;
        let last = *sequence.borrow();
        if let Err(e) = send(&writer, &GatewayMessage::heartbeat(last)).await {
            tracing::warn!("Heartbeat failed: {:#}", e);
            break;
        }
    }
}
