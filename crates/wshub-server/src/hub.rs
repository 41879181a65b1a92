//! Per-connection protocol state machine.
//!
//! Every inbound text frame goes through [`Hub::handle_text`]: decode, dispatch
//! on the message kind, and convert any [`HubError`] into an `error` reply to
//! the sender at that single boundary. Nothing raised while handling one frame
//! closes the connection or reaches other clients.

use std::collections::HashSet;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, error, info, instrument};

use crate::protocol::{self, DecodeError, Message, MessageKind};
use crate::websocket::connection::{ClientConnection, ConnectionState};
use crate::websocket::registry::ConnectionRegistry;

/// Reply text for a `register` with a token outside the configured set.
pub const WRONG_AUTH_TOKEN: &str = "Wrong auth token";

/// Why one inbound frame produced an `error` reply.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HubError {
    /// Malformed envelope or missing/invalid field.
    #[error(transparent)]
    Decode(DecodeError),
    /// `register` with a token outside the configured set.
    #[error("wrong auth token")]
    Auth,
    /// A `type` that clients may not send.
    #[error("unknown message type: {0}")]
    UnknownType(String),
}

impl From<DecodeError> for HubError {
    fn from(err: DecodeError) -> Self {
        match err {
            DecodeError::UnknownType(tag) => Self::UnknownType(tag),
            // `auth_token` is the only field of `register`; a token of the
            // wrong shape cannot be in the configured set
            DecodeError::InvalidField {
                kind: MessageKind::Register,
                ..
            } => Self::Auth,
            other => Self::Decode(other),
        }
    }
}

impl HubError {
    /// Text of the `error` reply for the frame `raw`.
    pub fn reply_text(&self, raw: &str) -> String {
        match self {
            Self::Decode(err) => format!("Error: {err}, in message: {raw}"),
            Self::Auth => WRONG_AUTH_TOKEN.to_string(),
            Self::UnknownType(tag) => format!("Received unknown message type: {tag}"),
        }
    }

    /// Short label for log fields.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Decode(_) => "decode",
            Self::Auth => "auth",
            Self::UnknownType(_) => "unknown_type",
        }
    }
}

/// Shared protocol logic for every connection.
pub struct Hub {
    registry: Arc<ConnectionRegistry>,
    tokens: HashSet<String>,
}

impl Hub {
    /// Create a hub over `registry` accepting the given auth tokens.
    pub fn new(registry: Arc<ConnectionRegistry>, tokens: impl IntoIterator<Item = String>) -> Self {
        Self {
            registry,
            tokens: tokens.into_iter().collect(),
        }
    }

    /// The registry this hub broadcasts through.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Whether `token` is in the configured set.
    pub fn accepts_token(&self, token: &str) -> bool {
        self.tokens.contains(token)
    }

    /// Handle one inbound text frame from `conn`.
    #[instrument(skip_all, fields(conn_id = %conn.id()))]
    pub async fn handle_text(&self, conn: &Arc<ClientConnection>, raw: &str) {
        if conn.state() == ConnectionState::Closed {
            debug!("dropping frame for closed connection");
            return;
        }
        debug!(frame = raw, "received");
        if let Err(err) = self.dispatch(conn, raw).await {
            error!(category = err.category(), error = %err, "protocol error");
            conn.send_to_self(&Message::error(err.reply_text(raw)));
        }
    }

    async fn dispatch(&self, conn: &Arc<ClientConnection>, raw: &str) -> Result<(), HubError> {
        match protocol::decode_inbound(raw)? {
            Message::Ping { message } => {
                conn.send_to_self(&Message::Pong { message });
                Ok(())
            }
            Message::Register { auth_token } => self.on_register(conn, &auth_token).await,
            Message::Data { id, message } => {
                self.on_data(conn, id, message).await;
                Ok(())
            }
            // Unreachable through decode_inbound; kept so the match stays total
            other => Err(HubError::UnknownType(other.kind().to_string())),
        }
    }

    async fn on_register(&self, conn: &Arc<ClientConnection>, token: &str) -> Result<(), HubError> {
        if !self.accepts_token(token) {
            return Err(HubError::Auth);
        }
        if conn.authenticate() {
            if let Err(err) = self.registry.add(Arc::clone(conn)).await {
                error!(error = %err, "registry invariant violated");
            }
            info!(members = self.registry.member_count(), "client registered");
        } else {
            debug!("client already registered");
        }
        conn.send_to_self(&Message::registered());
        Ok(())
    }

    async fn on_data(&self, conn: &Arc<ClientConnection>, id: String, payload: String) {
        conn.send_to_self(&Message::data_echo(id, &payload));
        // Only registry members reach others
        if conn.is_authenticated() {
            let report = conn
                .send_to_others(&self.registry, &Message::chat(conn.id(), payload))
                .await;
            debug!(recipients = report.recipients, failed = report.failed, "chat relayed");
        }
    }

    /// Tear down `conn` after its transport closed.
    pub async fn disconnect(&self, conn: &ClientConnection) {
        let previous = conn.close(&self.registry).await;
        info!(
            conn_id = %conn.id(),
            was = ?previous,
            age_ms = u64::try_from(conn.age().as_millis()).unwrap_or(u64::MAX),
            drops = conn.drop_count(),
            "client disconnected"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use axum::extract::ws::Utf8Bytes;
    use tokio::sync::mpsc;
    use tracing::Level;
    use wshub_core::logging::capture_logs;

    struct Client {
        conn: Arc<ClientConnection>,
        rx: mpsc::Receiver<Utf8Bytes>,
    }

    impl Client {
        fn next(&mut self) -> String {
            self.rx.try_recv().unwrap().as_str().to_owned()
        }

        fn next_json(&mut self) -> serde_json::Value {
            serde_json::from_str(&self.next()).unwrap()
        }

        fn is_idle(&mut self) -> bool {
            self.rx.try_recv().is_err()
        }
    }

    fn make_hub() -> Hub {
        Hub::new(
            Arc::new(ConnectionRegistry::new()),
            ["asdf", "asdf1"].map(String::from),
        )
    }

    fn connect(hub: &Hub) -> Client {
        let (tx, rx) = mpsc::channel(32);
        let conn = ClientConnection::new(hub.registry().next_connection_id(), tx);
        Client {
            conn: Arc::new(conn),
            rx,
        }
    }

    async fn registered(hub: &Hub) -> Client {
        let mut client = connect(hub);
        hub.handle_text(&client.conn, r#"{"type":"register","auth_token":"asdf"}"#)
            .await;
        let _ = client.next();
        client
    }

    #[test]
    fn decode_unknown_type_becomes_unknown_type() {
        let err = HubError::from(DecodeError::UnknownType("foo".into()));
        assert_matches!(err, HubError::UnknownType(ref t) if t == "foo");
        let err = HubError::from(DecodeError::MissingType);
        assert_matches!(err, HubError::Decode(DecodeError::MissingType));
    }

    #[test]
    fn reply_texts() {
        assert_eq!(HubError::Auth.reply_text("x"), "Wrong auth token");
        assert_eq!(
            HubError::UnknownType("foo".into()).reply_text("x"),
            "Received unknown message type: foo"
        );
        let text = HubError::Decode(DecodeError::MissingType).reply_text(r#"{"a":1}"#);
        assert!(text.starts_with("Error: missing field `type`"));
        assert!(text.ends_with(r#"in message: {"a":1}"#));
    }

    #[tokio::test]
    async fn register_with_valid_token() {
        let hub = make_hub();
        let mut client = connect(&hub);
        hub.handle_text(&client.conn, r#"{"type":"register","auth_token":"asdf1"}"#)
            .await;

        assert_eq!(client.next(), r#"{"type":"registered","response":"you are cool"}"#);
        assert!(client.is_idle());
        assert!(client.conn.is_authenticated());
        assert!(hub.registry().contains(client.conn.id()).await);
    }

    #[tokio::test]
    async fn register_with_wrong_token() {
        let (logs, _guard) = capture_logs();
        let hub = make_hub();
        let mut client = connect(&hub);
        hub.handle_text(&client.conn, r#"{"type":"register","auth_token":"bad"}"#)
            .await;

        assert_eq!(client.next(), r#"{"type":"error","response":"Wrong auth token"}"#);
        assert!(client.is_idle());
        assert_eq!(client.conn.state(), ConnectionState::Pending);
        assert_eq!(hub.registry().member_count(), 0);
        assert!(logs.has_event(Level::ERROR, "protocol error"));
    }

    #[tokio::test]
    async fn re_register_does_not_duplicate() {
        let (logs, _guard) = capture_logs();
        let hub = make_hub();
        let mut client = registered(&hub).await;
        hub.handle_text(&client.conn, r#"{"type":"register","auth_token":"asdf"}"#)
            .await;

        assert_eq!(client.next_json()["type"], "registered");
        assert_eq!(hub.registry().member_count(), 1);
        assert!(!logs.has_event(Level::ERROR, "invariant"));
    }

    #[tokio::test]
    async fn ping_before_registering() {
        let hub = make_hub();
        let mut client = connect(&hub);
        hub.handle_text(&client.conn, r#"{"type":"ping","message":{"n":[1,2]}}"#)
            .await;

        assert_eq!(client.next(), r#"{"type":"pong","message":{"n":[1,2]}}"#);
        assert_eq!(client.conn.state(), ConnectionState::Pending);
    }

    #[tokio::test]
    async fn ping_with_null_payload() {
        let hub = make_hub();
        let mut client = registered(&hub).await;
        hub.handle_text(&client.conn, r#"{"type":"ping","message":null}"#)
            .await;
        assert_eq!(client.next(), r#"{"type":"pong","message":null}"#);
    }

    #[tokio::test]
    async fn data_echoes_and_broadcasts() {
        let hub = make_hub();
        let mut a = registered(&hub).await;
        let mut b = registered(&hub).await;
        let mut c = registered(&hub).await;

        hub.handle_text(&a.conn, r#"{"type":"data","id":"7","message":"hi"}"#)
            .await;

        assert_eq!(a.next(), r#"{"type":"data","id":"7","message":"aGk="}"#);
        assert!(a.is_idle());
        let expected = format!(r#"{{"type":"chat","from":"{}","message":"hi"}}"#, a.conn.id());
        assert_eq!(b.next(), expected);
        assert_eq!(c.next(), expected);
        assert!(b.is_idle());
        assert!(c.is_idle());
    }

    #[tokio::test]
    async fn unregistered_data_is_echoed_but_not_broadcast() {
        let hub = make_hub();
        let mut member = registered(&hub).await;
        let mut pending = connect(&hub);

        hub.handle_text(&pending.conn, r#"{"type":"data","id":"1","message":"hi"}"#)
            .await;

        assert_eq!(pending.next_json()["message"], "aGk=");
        assert!(member.is_idle());
    }

    #[tokio::test]
    async fn unregistered_client_does_not_receive_chat() {
        let hub = make_hub();
        let a = registered(&hub).await;
        let mut pending = connect(&hub);

        hub.handle_text(&a.conn, r#"{"type":"data","id":"1","message":"x"}"#)
            .await;
        assert!(pending.is_idle());
    }

    #[tokio::test]
    async fn malformed_inputs_yield_one_error_each() {
        let hub = make_hub();
        let mut client = registered(&hub).await;
        let mut other = registered(&hub).await;

        for raw in [
            "not json",
            r#"{"message":"no type"}"#,
            r#"{"type":"foo"}"#,
            r#"{"type":"data","id":"1"}"#,
            r#"{"type":"register"}"#,
            r#"[1,2,3]"#,
        ] {
            hub.handle_text(&client.conn, raw).await;
            let reply = client.next_json();
            assert_eq!(reply["type"], "error", "input: {raw}");
            assert!(client.is_idle());
        }
        assert!(other.is_idle());
        assert!(client.conn.is_authenticated());
        assert_eq!(hub.registry().member_count(), 2);
    }

    #[tokio::test]
    async fn decode_error_reply_includes_offending_frame() {
        let hub = make_hub();
        let mut client = connect(&hub);
        hub.handle_text(&client.conn, "not json").await;
        let reply = client.next_json();
        let text = reply["response"].as_str().unwrap();
        assert!(text.starts_with("Error: invalid JSON"));
        assert!(text.ends_with("in message: not json"));
    }

    #[tokio::test]
    async fn server_only_kinds_are_unknown() {
        let hub = make_hub();
        let mut client = connect(&hub);
        hub.handle_text(&client.conn, r#"{"type":"chat","from":"1","message":"x"}"#)
            .await;
        assert_eq!(
            client.next(),
            r#"{"type":"error","response":"Received unknown message type: chat"}"#
        );
    }

    #[tokio::test]
    async fn server_only_kinds_are_unknown_whatever_their_fields() {
        let hub = make_hub();
        let mut client = registered(&hub).await;
        for (raw, tag) in [
            (r#"{"type":"pong"}"#, "pong"),
            (r#"{"type":"chat"}"#, "chat"),
            (r#"{"type":"registered"}"#, "registered"),
            (r#"{"type":"error","response":1}"#, "error"),
        ] {
            hub.handle_text(&client.conn, raw).await;
            assert_eq!(
                client.next_json()["response"],
                format!("Received unknown message type: {tag}"),
                "input: {raw}"
            );
            assert!(client.is_idle());
        }
    }

    #[tokio::test]
    async fn non_string_token_is_a_wrong_token() {
        let hub = make_hub();
        let mut client = connect(&hub);
        for raw in [
            r#"{"type":"register","auth_token":5}"#,
            r#"{"type":"register","auth_token":["asdf"]}"#,
        ] {
            hub.handle_text(&client.conn, raw).await;
            assert_eq!(client.next(), r#"{"type":"error","response":"Wrong auth token"}"#);
        }
        assert_eq!(client.conn.state(), ConnectionState::Pending);
        assert_eq!(hub.registry().member_count(), 0);
    }

    #[test]
    fn invalid_register_field_maps_to_auth() {
        let err = HubError::from(DecodeError::InvalidField {
            kind: MessageKind::Register,
            detail: "invalid type".into(),
        });
        assert_eq!(err, HubError::Auth);
        let err = HubError::from(DecodeError::InvalidField {
            kind: MessageKind::Data,
            detail: "invalid type".into(),
        });
        assert_matches!(err, HubError::Decode(DecodeError::InvalidField { .. }));
    }

    #[tokio::test]
    async fn unknown_type_reply() {
        let hub = make_hub();
        let mut client = connect(&hub);
        hub.handle_text(&client.conn, r#"{"type":"foo"}"#).await;
        assert_eq!(
            client.next(),
            r#"{"type":"error","response":"Received unknown message type: foo"}"#
        );
    }

    #[tokio::test]
    async fn disconnect_removes_from_future_broadcasts() {
        let (logs, _guard) = capture_logs();
        let hub = make_hub();
        let a = registered(&hub).await;
        let mut b = registered(&hub).await;
        let mut c = registered(&hub).await;

        hub.disconnect(&b.conn).await;
        assert_eq!(b.conn.state(), ConnectionState::Closed);
        assert!(logs.has_event(Level::INFO, "client disconnected"));

        hub.handle_text(&a.conn, r#"{"type":"data","id":"2","message":"m"}"#)
            .await;
        assert!(b.is_idle());
        assert_eq!(c.next_json()["type"], "chat");
        assert_eq!(logs.count_at_level(Level::WARN), 0);
    }

    #[tokio::test]
    async fn disconnect_twice_is_harmless() {
        let hub = make_hub();
        let a = registered(&hub).await;
        let _b = registered(&hub).await;
        hub.disconnect(&a.conn).await;
        hub.disconnect(&a.conn).await;
        assert_eq!(hub.registry().member_count(), 1);
    }

    #[tokio::test]
    async fn closed_connection_ignores_frames() {
        let hub = make_hub();
        let mut client = registered(&hub).await;
        hub.disconnect(&client.conn).await;
        hub.handle_text(&client.conn, r#"{"type":"register","auth_token":"asdf"}"#)
            .await;
        assert!(client.is_idle());
        assert_eq!(hub.registry().member_count(), 0);
    }

    #[tokio::test]
    async fn peer_with_closed_transport_does_not_break_broadcast() {
        let hub = make_hub();
        let mut a = registered(&hub).await;
        let Client { conn: gone, rx } = registered(&hub).await;
        drop(rx);
        let mut c = registered(&hub).await;

        hub.handle_text(&a.conn, r#"{"type":"data","id":"3","message":"z"}"#)
            .await;
        assert_eq!(a.next_json()["message"], "eg==");
        assert_eq!(c.next_json()["message"], "z");
        assert!(hub.registry().contains(gone.id()).await);
    }
}
