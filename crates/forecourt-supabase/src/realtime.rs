// Realtime row subscriptions over the Phoenix channel protocol.
//
// Each subscription owns one WebSocket. A pump task joins the channel, keeps
// it alive with heartbeats, decodes `postgres_changes` frames into
// `ChangeEvent`s, and reconnects with capped backoff when the socket drops.

use std::time::Duration;

use forecourt_core::remote::{ChangeEvent, ChangeOp, Disposer, RemoteError, Subscription, Topic};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const PROTOCOL_VERSION: &str = "1.0.0";
const SUBSCRIPTION_BUFFER: usize = 64;
const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Framing
// ---------------------------------------------------------------------------

/// `http(s)://host` becomes `ws(s)://host/realtime/v1/websocket?...`.
pub fn socket_url(base_url: &str, anon_key: &str) -> String {
    let base = base_url.trim_end_matches('/');
    let ws_base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        base.to_string()
    };
    format!("{ws_base}/realtime/v1/websocket?apikey={anon_key}&vsn={PROTOCOL_VERSION}")
}

pub fn channel_topic(topic: &Topic) -> String {
    format!("realtime:{}", topic.channel_name())
}

/// The `postgres_changes` binding a topic listens on.
pub fn change_filter(topic: &Topic) -> Value {
    match topic {
        Topic::Station(id) => json!({
            "event": "UPDATE",
            "schema": "public",
            "table": "stations",
            "filter": format!("station_id=eq.{id}"),
        }),
        Topic::Tanks(id) => json!({
            "event": "*",
            "schema": "public",
            "table": "tanks",
            "filter": format!("station_id=eq.{id}"),
        }),
        Topic::Settings => json!({
            "event": "UPDATE",
            "schema": "public",
            "table": "system_settings",
            "filter": "id=eq.1",
        }),
    }
}

pub fn join_message(topic: &Topic, msg_ref: u64) -> String {
    json!({
        "topic": channel_topic(topic),
        "event": "phx_join",
        "payload": {
            "config": {
                "broadcast": {"self": false},
                "presence": {"key": ""},
                "postgres_changes": [change_filter(topic)],
            }
        },
        "ref": msg_ref.to_string(),
    })
    .to_string()
}

pub fn heartbeat_message(msg_ref: u64) -> String {
    json!({
        "topic": "phoenix",
        "event": "heartbeat",
        "payload": {},
        "ref": msg_ref.to_string(),
    })
    .to_string()
}

/// What an inbound text frame means to a subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Change(ChangeEvent),
    /// Reply to our join. `ok` is false when the server rejected it.
    JoinReply { ok: bool, detail: String },
    /// Heartbeat replies, presence, system notices.
    Other,
}

pub fn parse_frame(text: &str) -> Frame {
    let Ok(frame) = serde_json::from_str::<Value>(text) else {
        warn!("Ignoring non-JSON realtime frame");
        return Frame::Other;
    };
    let event = frame.get("event").and_then(Value::as_str).unwrap_or_default();
    let payload = frame.get("payload").cloned().unwrap_or(Value::Null);

    match event {
        "postgres_changes" => {
            let data = &payload["data"];
            let op = match data["type"].as_str() {
                Some("INSERT") => ChangeOp::Insert,
                Some("UPDATE") => ChangeOp::Update,
                Some("DELETE") => ChangeOp::Delete,
                other => {
                    debug!("Unknown change type {other:?}");
                    return Frame::Other;
                }
            };
            let record = match (op, data.get("record")) {
                (ChangeOp::Delete, _) => None,
                (_, Some(Value::Object(row))) if !row.is_empty() => Some(Value::Object(row.clone())),
                _ => None,
            };
            Frame::Change(ChangeEvent { op, record })
        }
        "phx_reply" => {
            let is_join = frame.get("ref").and_then(Value::as_str) == Some("1");
            if !is_join {
                return Frame::Other;
            }
            Frame::JoinReply {
                ok: payload["status"].as_str() == Some("ok"),
                detail: payload["response"].to_string(),
            }
        }
        "phx_error" => Frame::JoinReply {
            ok: false,
            detail: payload.to_string(),
        },
        _ => Frame::Other,
    }
}

// ---------------------------------------------------------------------------
// Subscription pump
// ---------------------------------------------------------------------------

/// Settings shared by every subscription of one remote.
#[derive(Debug, Clone)]
pub struct RealtimeOptions {
    pub socket_url: String,
    pub heartbeat: Duration,
    pub connect_timeout: Duration,
}

/// Open the socket and join the channel, then hand the connection to a pump
/// task. Failing to connect the first time is an error; later drops are
/// retried in the background until the subscription is disposed.
pub async fn subscribe(options: &RealtimeOptions, topic: Topic) -> Result<Subscription, RemoteError> {
    let socket = connect(options).await?;
    let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
    info!("Subscribed to {}", channel_topic(&topic));

    let handle = tokio::spawn(pump(options.clone(), topic.clone(), socket, tx));
    Ok(Subscription::new(
        topic,
        rx,
        Disposer::new(move || handle.abort()),
    ))
}

async fn connect(options: &RealtimeOptions) -> Result<Socket, RemoteError> {
    let attempt = tokio_tungstenite::connect_async(options.socket_url.as_str());
    match tokio::time::timeout(options.connect_timeout, attempt).await {
        Ok(Ok((socket, _response))) => Ok(socket),
        Ok(Err(e)) => Err(RemoteError::Unreachable(e.to_string())),
        Err(_) => Err(RemoteError::Timeout),
    }
}

enum SessionEnd {
    /// The subscriber dropped its receiver.
    ReceiverGone,
    /// The socket closed or failed.
    Dropped(String),
}

async fn pump(options: RealtimeOptions, topic: Topic, first: Socket, tx: mpsc::Sender<ChangeEvent>) {
    let channel = channel_topic(&topic);
    let mut socket = first;
    let mut backoff = INITIAL_BACKOFF;

    loop {
        match run_session(socket, &topic, options.heartbeat, &tx).await {
            SessionEnd::ReceiverGone => {
                debug!("{channel}: subscriber gone, stopping");
                return;
            }
            SessionEnd::Dropped(reason) => warn!("{channel}: connection dropped: {reason}"),
        }

        socket = loop {
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(MAX_BACKOFF);
            if tx.is_closed() {
                return;
            }
            match connect(&options).await {
                Ok(socket) => break socket,
                Err(e) => warn!("{channel}: reconnect failed, retrying in {backoff:?}: {e}"),
            }
        };
        backoff = INITIAL_BACKOFF;
        info!("{channel}: reconnected");

        // Changes may have been missed while disconnected.
        if tx.send(ChangeEvent::resync()).await.is_err() {
            return;
        }
    }
}

async fn run_session(
    socket: Socket,
    topic: &Topic,
    heartbeat: Duration,
    tx: &mpsc::Sender<ChangeEvent>,
) -> SessionEnd {
    let (mut write, mut read) = socket.split();
    if let Err(e) = write.send(Message::Text(join_message(topic, 1).into())).await {
        return SessionEnd::Dropped(e.to_string());
    }

    let mut msg_ref = 1u64;
    let mut ticker = tokio::time::interval(heartbeat);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                msg_ref += 1;
                if let Err(e) = write.send(Message::Text(heartbeat_message(msg_ref).into())).await {
                    return SessionEnd::Dropped(e.to_string());
                }
            }

            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => match parse_frame(text.as_str()) {
                        Frame::Change(event) => {
                            if tx.send(event).await.is_err() {
                                return SessionEnd::ReceiverGone;
                            }
                        }
                        Frame::JoinReply { ok: false, detail } => {
                            warn!("{}: join rejected: {detail}", channel_topic(topic));
                        }
                        Frame::JoinReply { ok: true, .. } | Frame::Other => {}
                    },
                    Some(Ok(Message::Close(_))) | None => {
                        return SessionEnd::Dropped("closed by server".into());
                    }
                    Some(Err(e)) => return SessionEnd::Dropped(e.to_string()),
                    Some(Ok(_)) => {
                        // Binary, Ping, Pong and raw frames carry nothing for us.
                    }
                }
            }

            _ = tx.closed() => return SessionEnd::ReceiverGone,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    #[test]
    fn socket_url_switches_scheme() {
        assert_eq!(
            socket_url("https://abc.supabase.co/", "key"),
            "wss://abc.supabase.co/realtime/v1/websocket?apikey=key&vsn=1.0.0"
        );
        assert_eq!(
            socket_url("http://localhost:54321", "key"),
            "ws://localhost:54321/realtime/v1/websocket?apikey=key&vsn=1.0.0"
        );
    }

    #[test]
    fn join_carries_topic_and_filter() {
        let join: Value = serde_json::from_str(&join_message(&Topic::Tanks("S1".into()), 1)).unwrap();
        assert_eq!(join["topic"], "realtime:tank-updates-S1");
        assert_eq!(join["event"], "phx_join");
        assert_eq!(join["ref"], "1");
        let filter = &join["payload"]["config"]["postgres_changes"][0];
        assert_eq!(filter["table"], "tanks");
        assert_eq!(filter["event"], "*");
        assert_eq!(filter["filter"], "station_id=eq.S1");

        let settings = change_filter(&Topic::Settings);
        assert_eq!(settings["table"], "system_settings");
        assert_eq!(settings["filter"], "id=eq.1");
    }

    #[test]
    fn heartbeat_targets_phoenix_topic() {
        let hb: Value = serde_json::from_str(&heartbeat_message(7)).unwrap();
        assert_eq!(hb["topic"], "phoenix");
        assert_eq!(hb["event"], "heartbeat");
        assert_eq!(hb["ref"], "7");
    }

    #[test]
    fn update_frame_becomes_change() {
        let text = r#"{"event":"postgres_changes","topic":"realtime:station-updates-S1","ref":null,
            "payload":{"ids":[1],"data":{"type":"UPDATE","table":"stations","record":{"station_id":"S1","name":"New"},"old_record":{"station_id":"S1"}}}}"#;
        assert_eq!(
            parse_frame(text),
            Frame::Change(ChangeEvent {
                op: ChangeOp::Update,
                record: Some(json!({"station_id": "S1", "name": "New"})),
            })
        );
    }

    #[test]
    fn delete_frame_has_no_record() {
        let text = r#"{"event":"postgres_changes","payload":{"data":{"type":"DELETE","record":{},"old_record":{"id":4}}}}"#;
        assert_eq!(
            parse_frame(text),
            Frame::Change(ChangeEvent {
                op: ChangeOp::Delete,
                record: None
            })
        );
    }

    #[test]
    fn join_replies_and_noise() {
        let ok = r#"{"event":"phx_reply","ref":"1","payload":{"status":"ok","response":{}}}"#;
        assert!(matches!(parse_frame(ok), Frame::JoinReply { ok: true, .. }));

        let rejected = r#"{"event":"phx_reply","ref":"1","payload":{"status":"error","response":{"reason":"bad filter"}}}"#;
        match parse_frame(rejected) {
            Frame::JoinReply { ok, detail } => {
                assert!(!ok);
                assert!(detail.contains("bad filter"));
            }
            other => panic!("expected join reply, got {other:?}"),
        }

        let heartbeat_reply = r#"{"event":"phx_reply","ref":"2","payload":{"status":"ok","response":{}}}"#;
        assert_eq!(parse_frame(heartbeat_reply), Frame::Other);
        assert_eq!(parse_frame(r#"{"event":"presence_state","payload":{}}"#), Frame::Other);
        assert_eq!(parse_frame("garbage"), Frame::Other);
    }

    /// A server that accepts two connections: the first delivers one change
    /// and closes, the second stays open until told to stop.
    #[tokio::test]
    async fn reconnect_emits_resync() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (joins_tx, mut joins_rx) = mpsc::channel::<String>(4);
        let (stop_tx, stop_rx) = oneshot::channel::<()>();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            if let Some(Ok(Message::Text(join))) = ws.next().await {
                joins_tx.send(join.to_string()).await.unwrap();
            }
            let change = r#"{"event":"postgres_changes","payload":{"data":{"type":"INSERT","record":{"id":9,"station_id":"S1"}}}}"#;
            ws.send(Message::Text(change.into())).await.unwrap();
            ws.close(None).await.unwrap();

            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            if let Some(Ok(Message::Text(join))) = ws.next().await {
                joins_tx.send(join.to_string()).await.unwrap();
            }
            let _ = stop_rx.await;
        });

        let options = RealtimeOptions {
            socket_url: socket_url(&format!("http://{addr}"), "key"),
            heartbeat: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
        };
        let mut sub = subscribe(&options, Topic::Tanks("S1".into())).await.unwrap();

        let wait = Duration::from_secs(10);
        let first = tokio::time::timeout(wait, sub.next()).await.unwrap().unwrap();
        assert_eq!(first.op, ChangeOp::Insert);
        assert_eq!(first.record.unwrap()["id"], 9);

        let second = tokio::time::timeout(wait, sub.next()).await.unwrap().unwrap();
        assert_eq!(second, ChangeEvent::resync());

        for _ in 0..2 {
            let join: Value = serde_json::from_str(&joins_rx.recv().await.unwrap()).unwrap();
            assert_eq!(join["topic"], "realtime:tank-updates-S1");
        }
        let _ = stop_tx.send(());
    }

    #[tokio::test]
    async fn unreachable_socket_fails_subscribe() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let options = RealtimeOptions {
            socket_url: socket_url(&format!("http://{addr}"), "key"),
            heartbeat: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
        };
        let result = subscribe(&options, Topic::Settings).await;
        assert!(matches!(result, Err(RemoteError::Unreachable(_))));
    }
}
