//! Hosted realtime backend over Phoenix channels (`vsn=1.0.0`, JSON frames).
//!
//! One websocket carries one channel topic, `realtime:<channel>`, joined with a
//! `postgres_changes` listener per watched table. After the join is
//! acknowledged a pump task owns the socket: it forwards decoded changes,
//! answers the heartbeat schedule and sends `phx_leave` once the consumer drops
//! the stream.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::RealtimeSettings;

use super::error::RealtimeError;
use super::events::{ChangeEvent, ChangeKind};
use super::feed::{ChangeFeed, ChangeStream, SubscriptionSpec};

const PROTOCOL_VERSION: &str = "1.0.0";
const PHOENIX_TOPIC: &str = "phoenix";
const EVENT_JOIN: &str = "phx_join";
const EVENT_LEAVE: &str = "phx_leave";
const EVENT_REPLY: &str = "phx_reply";
const EVENT_ERROR: &str = "phx_error";
const EVENT_CLOSE: &str = "phx_close";
const EVENT_HEARTBEAT: &str = "heartbeat";
const EVENT_SYSTEM: &str = "system";
const EVENT_POSTGRES_CHANGES: &str = "postgres_changes";
const JOIN_REF: &str = "1";
const EVENT_BUFFER: usize = 256;
const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(25);
const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(10);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

#[derive(Debug, Clone)]
pub struct PhoenixConfig {
    /// Base endpoint, e.g. `wss://<project>.example.co/realtime/v1`.
    pub endpoint: Url,
    pub api_key: Option<String>,
    /// Sent with the join when row level security needs a user token.
    pub access_token: Option<String>,
    pub heartbeat: Duration,
    /// Bound on the websocket handshake and on waiting for the join reply.
    pub join_timeout: Duration,
}

impl PhoenixConfig {
    pub fn new(endpoint: Url) -> Self {
        Self {
            endpoint,
            api_key: None,
            access_token: None,
            heartbeat: DEFAULT_HEARTBEAT,
            join_timeout: DEFAULT_JOIN_TIMEOUT,
        }
    }

    pub fn from_settings(settings: &RealtimeSettings) -> Result<Self, RealtimeError> {
        let endpoint = settings
            .endpoint
            .clone()
            .ok_or_else(|| RealtimeError::Endpoint("realtime.url is not configured".into()))?;

        Ok(Self {
            endpoint,
            api_key: settings.api_key.clone(),
            access_token: settings.access_token.clone(),
            heartbeat: settings.heartbeat,
            join_timeout: settings.join_timeout,
        })
    }

    /// Websocket URL with the transport path and query parameters applied.
    pub fn socket_url(&self) -> Url {
        let mut url = self.endpoint.clone();
        let path = url.path().trim_end_matches('/').to_string();
        if !path.ends_with("/websocket") {
            url.set_path(&format!("{path}/websocket"));
        }

        url.set_query(None);
        {
            let mut query = url.query_pairs_mut();
            if let Some(key) = self.api_key.as_deref() {
                query.append_pair("apikey", key);
            }
            query.append_pair("vsn", PROTOCOL_VERSION);
        }
        url
    }
}

/// [`ChangeFeed`] backed by the hosted realtime websocket.
#[derive(Debug, Clone)]
pub struct PhoenixFeed {
    config: PhoenixConfig,
}

impl PhoenixFeed {
    pub fn new(config: PhoenixConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PhoenixConfig {
        &self.config
    }
}

#[async_trait]
impl ChangeFeed for PhoenixFeed {
    async fn subscribe(&self, spec: &SubscriptionSpec) -> Result<ChangeStream, RealtimeError> {
        let url = self.config.socket_url();
        let timeout = self.config.join_timeout;

        let (socket, _) = tokio::time::timeout(
            timeout,
            tokio_tungstenite::connect_async(url.as_str()),
        )
        .await
        .map_err(|_| RealtimeError::Timeout("websocket handshake"))??;
        debug!(host = url.host_str().unwrap_or_default(), "Realtime socket connected");

        let (mut sink, mut source) = socket.split();
        let topic = channel_topic(&spec.channel);

        let join = PhoenixMessage::new(
            &topic,
            EVENT_JOIN,
            join_payload(spec, self.config.access_token.as_deref()),
            JOIN_REF,
        )
        .with_join_ref(JOIN_REF);
        sink.send(join.encode()?).await?;

        tokio::time::timeout(timeout, await_join_reply(&mut source, &topic))
            .await
            .map_err(|_| RealtimeError::Timeout("channel join reply"))??;
        info!(
            topic = %topic,
            tables = spec.tables.len(),
            "Realtime channel subscribed"
        );

        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let (close_tx, close_rx) = oneshot::channel::<()>();
        tokio::spawn(pump(
            sink,
            source,
            topic,
            self.config.heartbeat,
            events_tx,
            close_rx,
        ));

        // The close sender lives in the stream state; dropping the stream
        // wakes the pump, which then leaves the channel.
        let events = stream::unfold((events_rx, close_tx), |(mut rx, close)| async move {
            rx.recv().await.map(|item| (item, (rx, close)))
        });
        Ok(events.boxed())
    }
}

fn channel_topic(channel: &str) -> String {
    format!("realtime:{channel}")
}

fn join_payload(spec: &SubscriptionSpec, access_token: Option<&str>) -> Value {
    let listeners: Vec<Value> = spec
        .tables
        .iter()
        .map(|table| json!({ "event": "*", "schema": spec.schema, "table": table }))
        .collect();

    let mut payload = json!({
        "config": {
            "broadcast": { "ack": false, "self": false },
            "presence": { "key": "" },
            "postgres_changes": listeners,
            "private": false,
        }
    });
    if let (Some(token), Some(object)) = (access_token, payload.as_object_mut()) {
        object.insert("access_token".to_string(), Value::String(token.to_string()));
    }
    payload
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PhoenixMessage {
    topic: String,
    event: String,
    #[serde(default)]
    payload: Value,
    #[serde(rename = "ref", default)]
    reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    join_ref: Option<String>,
}

impl PhoenixMessage {
    fn new(topic: &str, event: &str, payload: Value, reference: &str) -> Self {
        Self {
            topic: topic.to_string(),
            event: event.to_string(),
            payload,
            reference: Some(reference.to_string()),
            join_ref: None,
        }
    }

    fn with_join_ref(mut self, join_ref: &str) -> Self {
        self.join_ref = Some(join_ref.to_string());
        self
    }

    fn encode(&self) -> Result<Message, RealtimeError> {
        let text = serde_json::to_string(self)
            .map_err(|err| RealtimeError::protocol(format!("failed to encode frame: {err}")))?;
        Ok(Message::text(text))
    }

    fn status(&self) -> Option<&str> {
        self.payload.get("status").and_then(Value::as_str)
    }

    fn reason(&self) -> String {
        let payload = &self.payload;
        payload
            .pointer("/response/reason")
            .or_else(|| payload.get("message"))
            .or_else(|| payload.get("reason"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| payload.to_string())
    }
}

#[derive(Debug, Deserialize)]
struct PostgresChangesPayload {
    data: PostgresChange,
}

#[derive(Debug, Deserialize)]
struct PostgresChange {
    schema: String,
    table: String,
    #[serde(rename = "type")]
    kind: ChangeKind,
    #[serde(default)]
    record: Option<Value>,
    #[serde(default)]
    old_record: Option<Value>,
    #[serde(default)]
    commit_timestamp: Option<String>,
}

impl From<PostgresChange> for ChangeEvent {
    fn from(change: PostgresChange) -> Self {
        let mut event = ChangeEvent::new(change.kind, change.table)
            .with_schema(change.schema)
            .with_records(non_empty(change.old_record), non_empty(change.record));
        if let Some(timestamp) = change
            .commit_timestamp
            .as_deref()
            .and_then(|raw| OffsetDateTime::parse(raw, &Rfc3339).ok())
        {
            event = event.with_commit_timestamp(timestamp);
        }
        event
    }
}

/// Deletes carry `record: {}`; treat empty rows as absent.
fn non_empty(record: Option<Value>) -> Option<Value> {
    record.filter(|value| value.as_object().is_none_or(|object| !object.is_empty()))
}

/// What one inbound text frame means for the subscribed channel.
#[derive(Debug)]
enum Inbound {
    Change(ChangeEvent),
    HeartbeatAck(String),
    Fatal(RealtimeError),
    Ignored,
}

fn classify(text: &str, topic: &str) -> Inbound {
    let message: PhoenixMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(err) => {
            warn!(error = %err, "Discarding undecodable realtime frame");
            return Inbound::Ignored;
        }
    };

    if message.topic == PHOENIX_TOPIC {
        return match (message.event.as_str(), message.reference) {
            (EVENT_REPLY, Some(reference)) => Inbound::HeartbeatAck(reference),
            _ => Inbound::Ignored,
        };
    }
    if message.topic != topic {
        return Inbound::Ignored;
    }

    match message.event.as_str() {
        EVENT_POSTGRES_CHANGES => {
            match serde_json::from_value::<PostgresChangesPayload>(message.payload) {
                Ok(payload) => Inbound::Change(payload.data.into()),
                Err(err) => {
                    warn!(error = %err, "Discarding malformed postgres change");
                    Inbound::Ignored
                }
            }
        }
        EVENT_SYSTEM if message.status() == Some("error") => {
            Inbound::Fatal(RealtimeError::rejected(message.reason()))
        }
        EVENT_ERROR => Inbound::Fatal(RealtimeError::closed("channel errored on server")),
        EVENT_CLOSE => Inbound::Fatal(RealtimeError::closed("channel closed by server")),
        _ => Inbound::Ignored,
    }
}

async fn await_join_reply(source: &mut WsSource, topic: &str) -> Result<(), RealtimeError> {
    while let Some(message) = source.next().await {
        let text = match message? {
            Message::Text(text) => text,
            Message::Close(frame) => return Err(RealtimeError::closed(close_reason(frame))),
            _ => continue,
        };
        let reply: PhoenixMessage = serde_json::from_str(&text)
            .map_err(|err| RealtimeError::protocol(format!("undecodable frame: {err}")))?;
        if reply.topic != topic {
            continue;
        }

        match reply.event.as_str() {
            EVENT_REPLY if reply.reference.as_deref() == Some(JOIN_REF) => {
                return match reply.status() {
                    Some("ok") => Ok(()),
                    _ => Err(RealtimeError::rejected(reply.reason())),
                };
            }
            EVENT_SYSTEM if reply.status() == Some("error") => {
                return Err(RealtimeError::rejected(reply.reason()));
            }
            EVENT_ERROR | EVENT_CLOSE => {
                return Err(RealtimeError::closed(format!("{} before join reply", reply.event)));
            }
            _ => {}
        }
    }
    Err(RealtimeError::closed("connection ended before join reply"))
}

fn close_reason(frame: Option<CloseFrame>) -> String {
    frame
        .map(|frame| frame.reason.to_string())
        .filter(|reason| !reason.is_empty())
        .unwrap_or_else(|| "closed by server".to_string())
}

async fn pump(
    mut sink: WsSink,
    mut source: WsSource,
    topic: String,
    heartbeat: Duration,
    events: mpsc::Sender<Result<ChangeEvent, RealtimeError>>,
    mut close: oneshot::Receiver<()>,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + heartbeat, heartbeat);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // Ref "1" belongs to the join.
    let mut next_ref: u64 = 1;
    let mut pending_heartbeat: Option<String> = None;

    let failure = loop {
        tokio::select! {
            _ = &mut close => {
                leave(&mut sink, &topic, next_ref + 1).await;
                return;
            }
            _ = ticker.tick() => {
                if pending_heartbeat.is_some() {
                    break RealtimeError::HeartbeatTimeout;
                }
                next_ref += 1;
                let reference = next_ref.to_string();
                let beat = PhoenixMessage::new(PHOENIX_TOPIC, EVENT_HEARTBEAT, json!({}), &reference);
                match beat.encode() {
                    Ok(message) => {
                        if let Err(err) = sink.send(message).await {
                            break err.into();
                        }
                    }
                    Err(err) => break err,
                }
                debug!(reference = %reference, "Realtime heartbeat sent");
                pending_heartbeat = Some(reference);
            }
            message = source.next() => {
                let text = match message {
                    None => break RealtimeError::closed("connection ended"),
                    Some(Err(err)) => break err.into(),
                    Some(Ok(Message::Close(frame))) => break RealtimeError::closed(close_reason(frame)),
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(_)) => continue,
                };

                match classify(&text, &topic) {
                    Inbound::Change(event) => {
                        if events.send(Ok(event)).await.is_err() {
                            leave(&mut sink, &topic, next_ref + 1).await;
                            return;
                        }
                    }
                    Inbound::HeartbeatAck(reference) => {
                        if pending_heartbeat.as_deref() == Some(reference.as_str()) {
                            pending_heartbeat = None;
                        }
                    }
                    Inbound::Fatal(err) => break err,
                    Inbound::Ignored => {}
                }
            }
        }
    };

    warn!(topic = %topic, error = %failure, "Realtime channel lost");
    let _ = events.send(Err(failure)).await;
}

async fn leave(sink: &mut WsSink, topic: &str, reference: u64) {
    let frame = PhoenixMessage::new(topic, EVENT_LEAVE, json!({}), &reference.to_string())
        .with_join_ref(JOIN_REF);
    if let Ok(message) = frame.encode() {
        let _ = sink.send(message).await;
    }
    let _ = sink.close().await;
    debug!(topic, "Realtime channel left");
}
