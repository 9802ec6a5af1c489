//! ActiveMQ adapter speaking STOMP 1.2 over TCP (optionally TLS).
//!
//! The codec implements the STOMP frame grammar: a command line, header
//! lines, a blank line, then a body terminated by NUL. Bodies with a
//! `content-length` header may contain NUL bytes. Lone EOLs between frames
//! are heartbeats and are skipped.

use std::collections::HashMap;
use std::time::Duration;

use bytes::{Buf, BufMut, BytesMut};
use dgfacade_config::{DestinationKind, ResolvedChannel};
use dgfacade_core::MessageEnvelope;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::codec::{Decoder, Encoder, Framed};
use tracing::{debug, trace, warn};

use async_trait::async_trait;

use crate::error::{BrokerError, BrokerResult};
use crate::publisher::PublisherTransport;
use crate::ssl::build_tls_config;
use crate::subscriber::{Delivery, SubscriberTransport};

/// Headers owned by the protocol, not carried into envelopes.
const RESERVED_HEADERS: &[&str] = &[
    "destination",
    "message-id",
    "subscription",
    "content-length",
    "ack",
];

/// One STOMP frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StompFrame {
    /// Frame command (CONNECT, SEND, MESSAGE, ...).
    pub command: String,
    /// Header name/value pairs in order.
    pub headers: Vec<(String, String)>,
    /// Frame body.
    pub body: Vec<u8>,
}

impl StompFrame {
    /// Create a frame with no headers or body.
    #[must_use]
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    /// Append a header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Set the body.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// First value of a header, if present.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

/// Commands whose headers are never escaped per the STOMP 1.2 grammar.
fn escaping_exempt(command: &str) -> bool {
    command == "CONNECT" || command == "CONNECTED"
}

fn escape_header(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\r' => out.push_str("\\r"),
            '\n' => out.push_str("\\n"),
            ':' => out.push_str("\\c"),
            other => out.push(other),
        }
    }
    out
}

fn unescape_header(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('r') => out.push('\r'),
            Some('n') => out.push('\n'),
            Some('c') => out.push(':'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            },
            None => out.push('\\'),
        }
    }
    out
}

/// STOMP 1.2 frame codec.
#[derive(Debug, Default)]
pub struct StompCodec;

impl Decoder for StompCodec {
    type Item = StompFrame;
    type Error = BrokerError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<StompFrame>, Self::Error> {
        // Heartbeats are lone EOLs between frames.
        while !src.is_empty() {
            if src[0] == b'\n' {
                src.advance(1);
            } else if src.len() >= 2 && src[0] == b'\r' && src[1] == b'\n' {
                src.advance(2);
            } else {
                break;
            }
        }
        if src.is_empty() {
            return Ok(None);
        }

        // Header block ends at the first blank line.
        let Some(header_end) = find_blank_line(src) else {
            return Ok(None);
        };
        let head = std::str::from_utf8(&src[..header_end.index])
            .map_err(|e| BrokerError::Protocol(format!("non-UTF8 frame head: {e}")))?;
        let mut lines = head.lines();
        let command = lines
            .next()
            .ok_or_else(|| BrokerError::Protocol("empty frame".to_owned()))?
            .trim_end_matches('\r')
            .to_owned();
        let exempt = escaping_exempt(&command);

        let mut headers = Vec::new();
        let mut content_length: Option<usize> = None;
        for line in lines {
            let line = line.trim_end_matches('\r');
            let Some((name, value)) = line.split_once(':') else {
                return Err(BrokerError::Protocol(format!("malformed header {line}")));
            };
            let value = if exempt {
                value.to_owned()
            } else {
                unescape_header(value)
            };
            if name == "content-length" {
                content_length = value.parse().ok();
            }
            headers.push((name.to_owned(), value));
        }

        let body_start = header_end.index.saturating_add(header_end.separator);
        let (body, consumed) = if let Some(length) = content_length {
            let needed = body_start.saturating_add(length).saturating_add(1);
            if src.len() < needed {
                return Ok(None);
            }
            let end = body_start.saturating_add(length);
            if src[end] != 0 {
                return Err(BrokerError::Protocol(
                    "frame body not NUL-terminated".to_owned(),
                ));
            }
            (src[body_start..end].to_vec(), needed)
        } else {
            let Some(nul) = src[body_start..].iter().position(|&b| b == 0) else {
                return Ok(None);
            };
            let end = body_start.saturating_add(nul);
            (
                src[body_start..end].to_vec(),
                end.saturating_add(1),
            )
        };
        src.advance(consumed);

        Ok(Some(StompFrame {
            command,
            headers,
            body,
        }))
    }
}

struct BlankLine {
    index: usize,
    separator: usize,
}

fn find_blank_line(src: &BytesMut) -> Option<BlankLine> {
    let lf = src
        .windows(2)
        .position(|pair| pair == b"\n\n")
        .map(|index| BlankLine {
            index: index.saturating_add(1),
            separator: 1,
        });
    let crlf = src
        .windows(4)
        .position(|quad| quad == b"\r\n\r\n")
        .map(|index| BlankLine {
            index: index.saturating_add(2),
            separator: 2,
        });
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.index <= b.index { a } else { b }),
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b),
        (None, None) => None,
    }
}

impl Encoder<StompFrame> for StompCodec {
    type Error = BrokerError;

    fn encode(&mut self, frame: StompFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let exempt = escaping_exempt(&frame.command);
        dst.put_slice(frame.command.as_bytes());
        dst.put_u8(b'\n');
        for (name, value) in &frame.headers {
            dst.put_slice(name.as_bytes());
            dst.put_u8(b':');
            let value = if exempt {
                value.clone()
            } else {
                escape_header(value)
            };
            dst.put_slice(value.as_bytes());
            dst.put_u8(b'\n');
        }
        if !frame.body.is_empty() {
            dst.put_slice(format!("content-length:{}\n", frame.body.len()).as_bytes());
        }
        dst.put_u8(b'\n');
        dst.put_slice(&frame.body);
        dst.put_u8(0);
        Ok(())
    }
}

trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

type StompConnection = Framed<Box<dyn AsyncStream>, StompCodec>;

async fn open_connection(channel: &ResolvedChannel) -> BrokerResult<StompConnection> {
    let host = channel.property_str("host").unwrap_or("localhost").to_owned();
    let port = channel.property_u64("port", 61_613);
    let port = u16::try_from(port)
        .map_err(|_| BrokerError::Protocol(format!("port {port} out of range")))?;

    let tcp = TcpStream::connect((host.as_str(), port)).await?;
    let mut connection: StompConnection = if let Some(tls) = build_tls_config(&channel.ssl)? {
        let connector = tokio_rustls::TlsConnector::from(tls);
        let server_name = rustls::pki_types::ServerName::try_from(host.clone())
            .map_err(|e| BrokerError::Protocol(format!("invalid TLS server name: {e}")))?;
        let stream = connector.connect(server_name, tcp).await?;
        Framed::new(Box::new(stream), StompCodec)
    } else {
        Framed::new(Box::new(tcp), StompCodec)
    };

    let mut connect = StompFrame::new("CONNECT")
        .with_header("accept-version", "1.2")
        .with_header("host", channel.property_str("vhost").unwrap_or(&host))
        .with_header("heart-beat", "0,0");
    if let Some(login) = channel
        .authentication
        .get("username")
        .and_then(serde_json::Value::as_str)
    {
        connect = connect.with_header("login", login);
    }
    if let Some(passcode) = channel
        .authentication
        .get("password")
        .and_then(serde_json::Value::as_str)
    {
        connect = connect.with_header("passcode", passcode);
    }
    connection.send(connect).await?;

    let reply = tokio::time::timeout(Duration::from_secs(10), connection.next())
        .await
        .map_err(|_| BrokerError::Protocol("CONNECTED timed out".to_owned()))?
        .ok_or_else(|| BrokerError::Protocol("connection closed during CONNECT".to_owned()))??;
    match reply.command.as_str() {
        "CONNECTED" => {
            debug!(host = %host, port, "STOMP session established");
            Ok(connection)
        },
        "ERROR" => Err(BrokerError::Protocol(format!(
            "broker rejected CONNECT: {}",
            reply.header("message").unwrap_or("no message")
        ))),
        other => Err(BrokerError::Protocol(format!(
            "unexpected frame {other} during CONNECT"
        ))),
    }
}

fn destination_path(
    kinds: &HashMap<String, DestinationKind>,
    name: &str,
    default_kind: DestinationKind,
) -> String {
    if name.starts_with('/') {
        return name.to_owned();
    }
    let kind = kinds.get(name).copied().unwrap_or(default_kind);
    match kind {
        DestinationKind::Topic => format!("/topic/{name}"),
        _ => format!("/queue/{name}"),
    }
}

fn destination_kinds(channel: &ResolvedChannel) -> HashMap<String, DestinationKind> {
    channel
        .destinations
        .iter()
        .map(|destination| (destination.name.clone(), destination.kind))
        .collect()
}

/// STOMP publisher transport.
pub struct StompPublisherTransport {
    connection: Option<StompConnection>,
    kinds: HashMap<String, DestinationKind>,
}

impl StompPublisherTransport {
    /// Create an unconnected transport.
    #[must_use]
    pub fn new() -> Self {
        Self {
            connection: None,
            kinds: HashMap::new(),
        }
    }
}

impl Default for StompPublisherTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PublisherTransport for StompPublisherTransport {
    async fn connect(&mut self, channel: &ResolvedChannel) -> BrokerResult<()> {
        self.kinds = destination_kinds(channel);
        self.connection = Some(open_connection(channel).await?);
        Ok(())
    }

    async fn send(&mut self, topic: &str, envelope: &MessageEnvelope) -> BrokerResult<()> {
        let Some(connection) = self.connection.as_mut() else {
            return Err(BrokerError::NotConnected("stomp".to_owned()));
        };
        // Streamed responses default to pub/sub delivery.
        let path = destination_path(&self.kinds, topic, DestinationKind::Topic);
        let mut frame = StompFrame::new("SEND")
            .with_header("destination", path)
            .with_header("message-id", envelope.message_id.clone());
        for (name, value) in &envelope.headers {
            frame = frame.with_header(name.clone(), value.clone());
        }
        frame = frame.with_body(envelope.payload.clone().into_bytes());
        let result = connection.send(frame).await;
        if result.is_err() {
            self.connection = None;
        }
        result
    }

    async fn close(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            let _ = connection.send(StompFrame::new("DISCONNECT")).await;
        }
    }
}

/// STOMP subscriber transport.
pub struct StompSubscriberTransport {
    connection: Option<StompConnection>,
    kinds: HashMap<String, DestinationKind>,
    /// destination name -> subscription id
    subscriptions: HashMap<String, String>,
    /// destination path -> destination name
    paths: HashMap<String, String>,
    next_subscription: u64,
    poll_timeout: Duration,
    batch_size: usize,
}

impl StompSubscriberTransport {
    /// Create an unconnected transport.
    #[must_use]
    pub fn new() -> Self {
        Self {
            connection: None,
            kinds: HashMap::new(),
            subscriptions: HashMap::new(),
            paths: HashMap::new(),
            next_subscription: 0,
            poll_timeout: Duration::from_millis(200),
            batch_size: 50,
        }
    }

    fn envelope_from(&self, frame: &StompFrame) -> Delivery {
        let path = frame.header("destination").unwrap_or_default();
        let destination = self
            .paths
            .get(path)
            .cloned()
            .unwrap_or_else(|| path.to_owned());
        let mut envelope = MessageEnvelope::new(
            destination.clone(),
            String::from_utf8_lossy(&frame.body).into_owned(),
        );
        if let Some(id) = frame.header("message-id") {
            envelope.message_id = id.to_owned();
        }
        for (name, value) in &frame.headers {
            if !RESERVED_HEADERS.contains(&name.as_str()) {
                envelope.headers.insert(name.clone(), value.clone());
            }
        }
        Delivery {
            destination,
            envelope,
        }
    }
}

impl Default for StompSubscriberTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SubscriberTransport for StompSubscriberTransport {
    async fn connect(&mut self, channel: &ResolvedChannel) -> BrokerResult<()> {
        self.kinds = destination_kinds(channel);
        self.poll_timeout = Duration::from_millis(channel.property_u64("poll_interval_ms", 200));
        self.batch_size = usize::try_from(channel.property_u64("batch_size", 50)).unwrap_or(50);
        self.connection = Some(open_connection(channel).await?);
        // connect() is also the reconnect path; subscriptions are replayed
        // by the supervisor through subscribe().
        self.subscriptions.clear();
        self.paths.clear();
        Ok(())
    }

    async fn subscribe(&mut self, destination: &str) -> BrokerResult<()> {
        let Some(connection) = self.connection.as_mut() else {
            return Err(BrokerError::NotConnected("stomp".to_owned()));
        };
        if self.subscriptions.contains_key(destination) {
            return Ok(());
        }
        let id = format!("sub-{}", self.next_subscription);
        self.next_subscription = self.next_subscription.saturating_add(1);
        // Queues for point-to-point intake.
        let path = destination_path(&self.kinds, destination, DestinationKind::Queue);
        connection
            .send(
                StompFrame::new("SUBSCRIBE")
                    .with_header("id", id.clone())
                    .with_header("destination", path.clone())
                    .with_header("ack", "auto"),
            )
            .await?;
        self.subscriptions.insert(destination.to_owned(), id);
        self.paths.insert(path, destination.to_owned());
        Ok(())
    }

    async fn unsubscribe(&mut self, destination: &str) -> BrokerResult<()> {
        let Some(connection) = self.connection.as_mut() else {
            return Err(BrokerError::NotConnected("stomp".to_owned()));
        };
        if let Some(id) = self.subscriptions.remove(destination) {
            connection
                .send(StompFrame::new("UNSUBSCRIBE").with_header("id", id))
                .await?;
        }
        self.paths.retain(|_, name| name != destination);
        Ok(())
    }

    async fn poll(&mut self) -> BrokerResult<Vec<Delivery>> {
        if self.connection.is_none() {
            return Err(BrokerError::NotConnected("stomp".to_owned()));
        }
        let mut deliveries = Vec::new();
        while deliveries.len() < self.batch_size {
            // Wait the full interval only while empty-handed; once a batch
            // has started, drain whatever is already buffered.
            let wait = if deliveries.is_empty() {
                self.poll_timeout
            } else {
                Duration::from_millis(1)
            };
            let connection = self.connection.as_mut().expect("checked above");
            let frame = match tokio::time::timeout(wait, connection.next()).await {
                Err(_) => break,
                Ok(None) => {
                    self.connection = None;
                    return Err(BrokerError::Protocol("connection closed".to_owned()));
                },
                Ok(Some(Err(err))) => {
                    self.connection = None;
                    return Err(err);
                },
                Ok(Some(Ok(frame))) => frame,
            };
            match frame.command.as_str() {
                "MESSAGE" => deliveries.push(self.envelope_from(&frame)),
                "ERROR" => {
                    self.connection = None;
                    return Err(BrokerError::Protocol(format!(
                        "broker error: {}",
                        frame.header("message").unwrap_or("no message")
                    )));
                },
                other => trace!(command = other, "ignoring frame"),
            }
        }
        Ok(deliveries)
    }

    async fn close(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            if let Err(err) = connection.send(StompFrame::new("DISCONNECT")).await {
                warn!(error = %err, "DISCONNECT failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(codec: &mut StompCodec, src: &mut BytesMut) -> Vec<StompFrame> {
        let mut frames = Vec::new();
        while let Ok(Some(frame)) = codec.decode(src) {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn encode_decode_roundtrip() {
        let mut codec = StompCodec;
        let frame = StompFrame::new("MESSAGE")
            .with_header("destination", "/queue/in")
            .with_header("message-id", "m-1")
            .with_body(b"hello".to_vec());

        let mut buffer = BytesMut::new();
        codec.encode(frame.clone(), &mut buffer).unwrap();
        let decoded = codec.decode(&mut buffer).unwrap().unwrap();

        assert_eq!(decoded.command, "MESSAGE");
        assert_eq!(decoded.header("destination"), Some("/queue/in"));
        assert_eq!(decoded.header("content-length"), Some("5"));
        assert_eq!(decoded.body, b"hello");
        assert!(buffer.is_empty());
    }

    #[test]
    fn body_with_nul_uses_content_length() {
        let mut codec = StompCodec;
        let frame = StompFrame::new("SEND")
            .with_header("destination", "/queue/bin")
            .with_body(vec![1, 0, 2, 0, 3]);

        let mut buffer = BytesMut::new();
        codec.encode(frame, &mut buffer).unwrap();
        let decoded = codec.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(decoded.body, vec![1, 0, 2, 0, 3]);
    }

    #[test]
    fn partial_frame_returns_none() {
        let mut codec = StompCodec;
        let mut buffer = BytesMut::from(&b"MESSAGE\ndestination:/queue/in\n\npart"[..]);
        assert!(codec.decode(&mut buffer).unwrap().is_none());
        buffer.put_u8(0);
        assert!(codec.decode(&mut buffer).unwrap().is_some());
    }

    #[test]
    fn heartbeats_are_skipped() {
        let mut codec = StompCodec;
        let mut buffer = BytesMut::from(&b"\n\r\n\nCONNECTED\nversion:1.2\n\n\x00"[..]);
        let frames = decode_all(&mut codec, &mut buffer);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].command, "CONNECTED");
    }

    #[test]
    fn header_values_escape_and_unescape() {
        let mut codec = StompCodec;
        let frame =
            StompFrame::new("SEND").with_header("note", "a:b\nc\\d");
        let mut buffer = BytesMut::new();
        codec.encode(frame, &mut buffer).unwrap();

        let raw = String::from_utf8_lossy(&buffer).into_owned();
        assert!(raw.contains("note:a\\cb\\nc\\\\d"));

        let decoded = codec.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(decoded.header("note"), Some("a:b\nc\\d"));
    }

    #[test]
    fn two_frames_in_one_buffer() {
        let mut codec = StompCodec;
        let mut buffer = BytesMut::new();
        codec
            .encode(StompFrame::new("RECEIPT").with_header("receipt-id", "1"), &mut buffer)
            .unwrap();
        codec
            .encode(StompFrame::new("RECEIPT").with_header("receipt-id", "2"), &mut buffer)
            .unwrap();
        let frames = decode_all(&mut codec, &mut buffer);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1].header("receipt-id"), Some("2"));
    }

    /// Minimal in-process STOMP broker for client tests: accepts one
    /// connection, answers CONNECT, and echoes every SEND back as a
    /// MESSAGE on the subscribed destination.
    async fn run_echo_broker(listener: tokio::net::TcpListener) {
        let (socket, _) = listener.accept().await.unwrap();
        let mut framed = Framed::new(socket, StompCodec);
        let mut subscription: Option<(String, String)> = None;
        while let Some(Ok(frame)) = framed.next().await {
            match frame.command.as_str() {
                "CONNECT" => {
                    framed
                        .send(StompFrame::new("CONNECTED").with_header("version", "1.2"))
                        .await
                        .unwrap();
                },
                "SUBSCRIBE" => {
                    subscription = Some((
                        frame.header("id").unwrap().to_owned(),
                        frame.header("destination").unwrap().to_owned(),
                    ));
                },
                "SEND" => {
                    if let Some((id, destination)) = &subscription {
                        let mut message = StompFrame::new("MESSAGE")
                            .with_header("destination", destination.clone())
                            .with_header("subscription", id.clone())
                            .with_header(
                                "message-id",
                                frame.header("message-id").unwrap_or("m-0"),
                            )
                            .with_body(frame.body.clone());
                        for (name, value) in &frame.headers {
                            if !RESERVED_HEADERS.contains(&name.as_str()) {
                                message = message.with_header(name.clone(), value.clone());
                            }
                        }
                        framed.send(message).await.unwrap();
                    }
                },
                "DISCONNECT" => return,
                _ => {},
            }
        }
    }

    fn channel_for(port: u16) -> ResolvedChannel {
        let broker: dgfacade_config::BrokerConfig = serde_json::from_value(serde_json::json!({
            "type": "activemq",
            "connection": {"host": "127.0.0.1", "port": port},
            "authentication": {"username": "dgf", "password": "secret"}
        }))
        .unwrap();
        let channel: dgfacade_config::ChannelConfig = serde_json::from_value(serde_json::json!({
            "type": "jms",
            "broker": "amq",
            "destinations": [{"name": "requests", "type": "queue"}]
        }))
        .unwrap();
        dgfacade_config::resolve::resolve_channel("amq-channel", &channel, &broker).unwrap()
    }

    #[tokio::test]
    async fn publish_and_receive_through_broker() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let broker = tokio::spawn(run_echo_broker(listener));

        let channel = channel_for(port);
        // One connection serves both halves in this test: subscribe first,
        // then publish through the same session.
        let mut subscriber = StompSubscriberTransport::new();
        subscriber.connect(&channel).await.unwrap();
        subscriber.subscribe("requests").await.unwrap();

        let envelope = MessageEnvelope::new("requests", "ping").with_header("origin", "test");
        {
            let connection = subscriber.connection.as_mut().unwrap();
            let mut frame = StompFrame::new("SEND")
                .with_header("destination", "/queue/requests")
                .with_header("message-id", envelope.message_id.clone())
                .with_body(envelope.payload.clone().into_bytes());
            for (name, value) in &envelope.headers {
                frame = frame.with_header(name.clone(), value.clone());
            }
            connection.send(frame).await.unwrap();
        }

        let batch = subscriber.poll().await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].destination, "requests");
        assert_eq!(batch[0].envelope.payload, "ping");
        assert_eq!(batch[0].envelope.message_id, envelope.message_id);
        assert_eq!(
            batch[0].envelope.headers.get("origin").map(String::as_str),
            Some("test")
        );

        subscriber.close().await;
        let _ = broker.await;
    }

    #[tokio::test]
    async fn connect_failure_surfaces_io_error() {
        // Nothing is listening on this port.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut publisher = StompPublisherTransport::new();
        let err = publisher.connect(&channel_for(port)).await.unwrap_err();
        assert!(matches!(err, BrokerError::Io(_)));
    }
}
