use super::protocol::{self, PhoenixMessage, ReplyPayload};
use super::{ChangeFeed, ChangeFilter, Subscription, SubscriptionEvent, SubscriptionStatus};
use crate::error::RealtimeError;
use crate::retry::{with_retry, RetryConfig};
use async_trait::async_trait;
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message as WsMessage},
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    /// Project URL, e.g. `https://abc.supabase.co`.
    pub url: String,
    pub api_key: String,
    pub schema: String,
    pub heartbeat_interval: Duration,
    pub join_timeout: Duration,
    pub retry: RetryConfig,
}

impl RealtimeConfig {
    pub fn new(url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            api_key: api_key.into(),
            schema: "public".to_string(),
            heartbeat_interval: Duration::from_secs(30),
            join_timeout: Duration::from_secs(10),
            retry: RetryConfig::default(),
        }
    }

    pub fn websocket_url(&self) -> String {
        let base = self.url.trim_end_matches('/');
        let base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            base.to_string()
        };
        format!("{}/realtime/v1/websocket?apikey={}&vsn=1.0.0", base, self.api_key)
    }
}

type JoinAck = oneshot::Sender<Result<(), RealtimeError>>;

enum Command {
    Join {
        topic: String,
        payload: Value,
        events: mpsc::Sender<SubscriptionEvent>,
        ack: JoinAck,
    },
    Leave {
        topic: String,
    },
    Shutdown,
}

/// One multiplexed websocket connection to the realtime service. Channels
/// registered through [`ChangeFeed::subscribe`] survive reconnects: after
/// the socket comes back every live channel is joined again and reports
/// [`SubscriptionStatus::Resubscribed`].
pub struct RealtimeClient {
    config: RealtimeConfig,
    commands: mpsc::Sender<Command>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RealtimeClient {
    /// Starts the connection task. The socket is opened lazily, when the
    /// first channel is joined.
    pub fn connect(config: RealtimeConfig) -> Self {
        let (commands, rx) = mpsc::channel(64);
        let task = tokio::spawn(run(config.clone(), rx));
        Self {
            config,
            commands,
            task: Mutex::new(Some(task)),
        }
    }

    /// Leaves every channel and closes the socket.
    pub async fn close(&self) {
        let _ = self.commands.send(Command::Shutdown).await;
        if let Some(task) = self.task.lock().await.take() {
            if let Err(e) = task.await {
                error!("Realtime connection task failed: {}", e);
            }
        }
        info!("Realtime client closed");
    }
}

#[async_trait]
impl ChangeFeed for RealtimeClient {
    async fn subscribe(&self, filter: ChangeFilter) -> Result<Subscription, RealtimeError> {
        let scope = filter.phone_number.as_deref().unwrap_or(&filter.table);
        let topic = format!("realtime:{}-{}", scope, Uuid::new_v4().simple());
        let payload = protocol::join_payload(&filter, &self.config.schema, &self.config.api_key);

        let (subscription, events, leave) = Subscription::channel(topic.clone());
        let (ack, joined) = oneshot::channel();

        self.commands
            .send(Command::Join {
                topic: topic.clone(),
                payload,
                events,
                ack,
            })
            .await
            .map_err(|_| RealtimeError::Closed)?;

        let commands = self.commands.clone();
        let leave_topic = topic.clone();
        tokio::spawn(async move {
            let _ = leave.await;
            let _ = commands.send(Command::Leave { topic: leave_topic }).await;
        });

        match tokio::time::timeout(self.config.join_timeout, joined).await {
            Ok(Ok(Ok(()))) => Ok(subscription),
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => Err(RealtimeError::Closed),
            Err(_) => Err(RealtimeError::SubscriptionFailed(format!(
                "join of {} timed out",
                topic
            ))),
        }
    }
}

struct Channel {
    payload: Value,
    events: mpsc::Sender<SubscriptionEvent>,
    join_ref: Option<String>,
    ack: Option<JoinAck>,
    joined_once: bool,
    dropped: u64,
}

impl Channel {
    /// Hands an event to the subscriber without ever blocking the socket.
    /// Events that do not fit are counted and reported as a lag.
    fn deliver(&mut self, topic: &str, event: SubscriptionEvent) {
        if self.dropped > 0 {
            let lag = SubscriptionEvent::Status(SubscriptionStatus::Lagged(self.dropped));
            if self.events.try_send(lag).is_ok() {
                warn!(topic, dropped = self.dropped, "Realtime subscriber lagged");
                self.dropped = 0;
            }
        }

        match self.events.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => self.dropped += 1,
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(topic, "Subscriber gone, waiting for leave");
            }
        }
    }

    fn status(&mut self, topic: &str, status: SubscriptionStatus) {
        info!(topic, status = %status, "Realtime channel status");
        self.deliver(topic, SubscriptionEvent::Status(status));
    }
}

enum Exit {
    Shutdown,
    Disconnected(String),
}

struct Connection {
    channels: HashMap<String, Channel>,
    next_ref: u64,
    heartbeat_ref: Option<String>,
}

impl Connection {
    fn new() -> Self {
        Self {
            channels: HashMap::new(),
            next_ref: 0,
            heartbeat_ref: None,
        }
    }

    fn make_ref(&mut self) -> String {
        self.next_ref += 1;
        self.next_ref.to_string()
    }

    fn register(&mut self, topic: String, payload: Value, events: mpsc::Sender<SubscriptionEvent>, ack: JoinAck) {
        self.channels.insert(
            topic,
            Channel {
                payload,
                events,
                join_ref: None,
                ack: Some(ack),
                joined_once: false,
                dropped: 0,
            },
        );
    }

    fn join_frame(&mut self, topic: &str) -> Option<PhoenixMessage> {
        let reference = self.make_ref();
        let channel = self.channels.get_mut(topic)?;
        channel.join_ref = Some(reference.clone());
        Some(PhoenixMessage::join(topic, channel.payload.clone(), reference))
    }

    /// Applies a command while no socket is open.
    fn apply_offline(&mut self, command: Command) -> bool {
        match command {
            Command::Join {
                topic,
                payload,
                events,
                ack,
            } => {
                self.register(topic, payload, events, ack);
                true
            }
            Command::Leave { topic } => {
                self.channels.remove(&topic);
                true
            }
            Command::Shutdown => false,
        }
    }

    fn disconnected(&mut self, reason: &str) {
        self.heartbeat_ref = None;
        for (topic, channel) in self.channels.iter_mut() {
            channel.join_ref = None;
            channel.status(topic, SubscriptionStatus::ChannelError(reason.to_string()));
        }
    }

    fn close_all(&mut self, reason: &str) {
        for (topic, mut channel) in self.channels.drain() {
            if let Some(ack) = channel.ack.take() {
                let _ = ack.send(Err(RealtimeError::SubscriptionFailed(reason.to_string())));
            }
            channel.status(&topic, SubscriptionStatus::Closed);
        }
    }

    /// Handles one inbound frame; returns a frame to send back, if any.
    fn handle_frame(&mut self, text: &str) -> Option<PhoenixMessage> {
        let frame: PhoenixMessage = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "Ignoring undecodable realtime frame");
                return None;
            }
        };

        if frame.topic == protocol::PHOENIX_TOPIC {
            if frame.event == protocol::EVENT_REPLY && frame.reference == self.heartbeat_ref {
                self.heartbeat_ref = None;
            }
            return None;
        }

        let topic = frame.topic.clone();
        let Some(channel) = self.channels.get_mut(&topic) else {
            debug!(topic = %topic, event = %frame.event, "Frame for unknown channel");
            return None;
        };

        match frame.event.as_str() {
            protocol::EVENT_REPLY if frame.reference.is_some() && frame.reference == channel.join_ref => {
                let reply: ReplyPayload = match serde_json::from_value(frame.payload) {
                    Ok(reply) => reply,
                    Err(e) => {
                        warn!(topic = %topic, error = %e, "Malformed join reply");
                        return None;
                    }
                };

                if reply.is_ok() {
                    let status = if channel.joined_once {
                        SubscriptionStatus::Resubscribed
                    } else {
                        SubscriptionStatus::Subscribed
                    };
                    channel.joined_once = true;
                    channel.status(&topic, status);
                    if let Some(ack) = channel.ack.take() {
                        let _ = ack.send(Ok(()));
                    }
                } else {
                    let reason = reply.reason();
                    channel.status(&topic, SubscriptionStatus::ChannelError(reason.clone()));
                    if let Some(ack) = channel.ack.take() {
                        let _ = ack.send(Err(RealtimeError::SubscriptionFailed(reason)));
                    }
                }
                None
            }
            protocol::EVENT_POSTGRES_CHANGES => {
                if let Some(change) = protocol::decode_change(&frame.payload) {
                    channel.deliver(&topic, SubscriptionEvent::Change(change));
                }
                None
            }
            protocol::EVENT_SYSTEM => {
                let status = frame.payload.get("status").and_then(Value::as_str).unwrap_or("");
                let message = frame.payload.get("message").and_then(Value::as_str).unwrap_or("");
                if status == "error" {
                    channel.status(&topic, SubscriptionStatus::ChannelError(message.to_string()));
                } else {
                    debug!(topic = %topic, message, "Realtime system message");
                }
                None
            }
            protocol::EVENT_ERROR => {
                // The server side of the channel crashed; join it again.
                channel.status(&topic, SubscriptionStatus::ChannelError("channel error".to_string()));
                self.join_frame(&topic)
            }
            protocol::EVENT_CLOSE => None,
            other => {
                debug!(topic = %topic, event = other, "Unhandled realtime event");
                None
            }
        }
    }

    async fn drive<S>(&mut self, socket: S, commands: &mut mpsc::Receiver<Command>, heartbeat: Duration) -> Exit
    where
        S: Stream<Item = Result<WsMessage, WsError>> + Sink<WsMessage, Error = WsError> + Unpin,
    {
        let (mut write, mut read) = socket.split();

        let topics: Vec<String> = self.channels.keys().cloned().collect();
        for topic in topics {
            if let Some(frame) = self.join_frame(&topic) {
                if let Err(e) = send_frame(&mut write, &frame).await {
                    return Exit::Disconnected(e);
                }
            }
        }

        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + heartbeat, heartbeat);

        loop {
            let outgoing = tokio::select! {
                command = commands.recv() => match command {
                    None | Some(Command::Shutdown) => {
                        let topics: Vec<String> = self.channels.keys().cloned().collect();
                        for topic in topics {
                            let frame = PhoenixMessage::leave(&topic, self.make_ref());
                            let _ = send_frame(&mut write, &frame).await;
                        }
                        let _ = write.close().await;
                        return Exit::Shutdown;
                    }
                    Some(Command::Join { topic, payload, events, ack }) => {
                        self.register(topic.clone(), payload, events, ack);
                        self.join_frame(&topic)
                    }
                    Some(Command::Leave { topic }) => {
                        if self.channels.remove(&topic).is_some() {
                            info!(topic = %topic, "Leaving realtime channel");
                            Some(PhoenixMessage::leave(&topic, self.make_ref()))
                        } else {
                            None
                        }
                    }
                },
                _ = ticker.tick() => {
                    if self.heartbeat_ref.is_some() {
                        return Exit::Disconnected("heartbeat timed out".to_string());
                    }
                    let reference = self.make_ref();
                    self.heartbeat_ref = Some(reference.clone());
                    Some(PhoenixMessage::heartbeat(reference))
                },
                frame = read.next() => match frame {
                    None => return Exit::Disconnected("socket closed".to_string()),
                    Some(Err(e)) => return Exit::Disconnected(e.to_string()),
                    Some(Ok(WsMessage::Close(_))) => return Exit::Disconnected("server closed the socket".to_string()),
                    Some(Ok(WsMessage::Text(text))) => self.handle_frame(&text),
                    Some(Ok(_)) => None,
                },
            };

            if let Some(frame) = outgoing {
                if let Err(e) = send_frame(&mut write, &frame).await {
                    return Exit::Disconnected(e);
                }
            }
        }
    }
}

async fn send_frame<W>(write: &mut W, frame: &PhoenixMessage) -> Result<(), String>
where
    W: Sink<WsMessage, Error = WsError> + Unpin,
{
    let json = serde_json::to_string(frame).map_err(|e| e.to_string())?;
    debug!("-> realtime: {}", json);
    write.send(WsMessage::Text(json)).await.map_err(|e| e.to_string())
}

async fn run(config: RealtimeConfig, mut commands: mpsc::Receiver<Command>) {
    let mut connection = Connection::new();
    let url = config.websocket_url();

    loop {
        // Nothing to listen for: wait for the first join before dialling.
        while connection.channels.is_empty() {
            match commands.recv().await {
                Some(command) => {
                    if !connection.apply_offline(command) {
                        return;
                    }
                }
                None => return,
            }
        }

        // Commands keep flowing while the backoff runs, so a shutdown or a
        // leave never waits for the retries to run out.
        let dial = with_retry(&config.retry, "realtime connect", || connect_async(url.as_str()));
        tokio::pin!(dial);
        let dialled = loop {
            tokio::select! {
                result = &mut dial => break Some(result),
                command = commands.recv() => {
                    let open = match command {
                        Some(command) => connection.apply_offline(command),
                        None => false,
                    };
                    if !open {
                        connection.close_all("client closed");
                        return;
                    }
                    if connection.channels.is_empty() {
                        debug!("Every channel left while offline, no longer dialling");
                        break None;
                    }
                }
            }
        };

        let socket = match dialled {
            None => continue,
            Some(Ok((socket, _))) => socket,
            Some(Err(e)) => {
                error!(error = %e, "Giving up on realtime connection");
                connection.close_all(&e.to_string());
                continue;
            }
        };

        info!(url = %config.url, "Realtime connected");
        match connection.drive(socket, &mut commands, config.heartbeat_interval).await {
            Exit::Shutdown => {
                connection.close_all("client closed");
                return;
            }
            Exit::Disconnected(reason) => {
                warn!(reason = %reason, "Realtime connection lost, reconnecting");
                connection.disconnected(&reason);
            }
        }
    }
}
