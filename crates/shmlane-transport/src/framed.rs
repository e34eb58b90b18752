//! Typed messages over a [`Connection`].
//!
//! Outbound frames are encoded once and written in chunks of at most a
//! quarter of the ring, so a frame larger than the free space moves across
//! several writes. Chunks not yet written stay queued; the next send writes
//! them first, so the byte stream never carries a torn frame.
//!
//! Inbound bytes accumulate until a whole frame is buffered. The header is
//! validated as soon as its 24 bytes arrive.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use shm_primitives::WriteResult;
use shmlane_codec::{
    Deflate, ErrorCode, ErrorPayload, Frame, FrameCodec, FrameError, FrameFlags, FrameHeader,
    MessageType, TypeRegistry,
};

use crate::config::{ChecksumPolicy, TransportConfig, UnknownTypePolicy};
use crate::connection::Connection;
use crate::error::{ConnectionError, DisconnectReason, TransportError};

/// Polls that only yield before [`MessageStream::next_message`] starts sleeping.
const SPIN_POLLS: u32 = 64;
const IDLE_POLL: Duration = Duration::from_millis(1);

/// Per-send overrides.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendOptions {
    pub flags: FrameFlags,
    /// Compress if the payload is above the codec threshold and shrinks.
    pub compress: bool,
    /// Use this id instead of allocating the next one.
    pub message_id: Option<u64>,
}

/// A decoded inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub msg_type: MessageType,
    pub flags: FrameFlags,
    pub message_id: u64,
    pub payload: Bytes,
}

impl Message {
    pub fn is_request(&self) -> bool {
        self.flags.contains(FrameFlags::REQUEST)
    }

    pub fn is_response(&self) -> bool {
        self.flags.contains(FrameFlags::RESPONSE)
    }

    /// The parsed body of an ERROR message.
    pub fn error_payload(&self) -> Option<ErrorPayload> {
        if self.msg_type != MessageType::ERROR {
            return None;
        }
        ErrorPayload::decode(&self.payload).ok()
    }
}

impl From<Frame> for Message {
    fn from(frame: Frame) -> Self {
        Self {
            msg_type: frame.msg_type,
            flags: frame.flags,
            message_id: frame.message_id,
            payload: frame.payload,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incoming {
    Message(Message),
    /// A well-formed frame whose type is not in the registry.
    Unrecognized(Message),
}

impl Incoming {
    pub fn message(&self) -> &Message {
        match self {
            Self::Message(m) | Self::Unrecognized(m) => m,
        }
    }

    pub fn into_message(self) -> Message {
        match self {
            Self::Message(m) | Self::Unrecognized(m) => m,
        }
    }
}

pub struct MessageStream {
    conn: Connection,
    codec: FrameCodec,
    registry: TypeRegistry,
    checksum_policy: ChecksumPolicy,
    unknown_type_policy: UnknownTypePolicy,
    inbound: BytesMut,
    /// Encoded frames waiting to be written; `offset` bytes of the front are out.
    outbound: VecDeque<Bytes>,
    offset: usize,
    next_id: u64,
    chunk: usize,
}

impl MessageStream {
    pub fn new(conn: Connection, config: &TransportConfig) -> Self {
        let chunk = (conn.capacity() as usize / 4).max(1);
        Self {
            conn,
            codec: FrameCodec::new(Arc::new(Deflate::default()), config.compression_threshold),
            registry: TypeRegistry::with_builtins(),
            checksum_policy: config.checksum_policy,
            unknown_type_policy: config.unknown_type_policy,
            inbound: BytesMut::new(),
            outbound: VecDeque::new(),
            offset: 0,
            next_id: 1,
            chunk,
        }
    }

    pub fn with_codec(mut self, codec: FrameCodec) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_registry(mut self, registry: TypeRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Recognize `ty` on receive. Returns `false` if it already was.
    pub fn register_type(&mut self, ty: MessageType, name: impl Into<String>) -> bool {
        self.registry.register(ty, name)
    }

    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn connection_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    /// Whether part of an earlier frame is still waiting to be written.
    pub fn has_pending(&self) -> bool {
        !self.outbound.is_empty()
    }

    fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1).max(1);
        id
    }

    /// Send a request. Returns the message id the response will echo.
    pub async fn send(
        &mut self,
        msg_type: MessageType,
        payload: impl Into<Bytes>,
    ) -> Result<u64, TransportError> {
        let options = SendOptions {
            flags: FrameFlags::REQUEST,
            ..SendOptions::default()
        };
        self.send_with(msg_type, payload, options).await
    }

    /// Answer the request `message_id`.
    pub async fn reply(
        &mut self,
        msg_type: MessageType,
        payload: impl Into<Bytes>,
        message_id: u64,
    ) -> Result<(), TransportError> {
        let options = SendOptions {
            flags: FrameFlags::RESPONSE,
            message_id: Some(message_id),
            ..SendOptions::default()
        };
        self.send_with(msg_type, payload, options).await.map(|_| ())
    }

    pub async fn heartbeat(&mut self) -> Result<u64, TransportError> {
        self.send(MessageType::HEARTBEAT, Bytes::new()).await
    }

    /// Encode and send one frame.
    ///
    /// If the frame is partly written when backpressure times out, the rest
    /// stays queued and goes out ahead of the next send. A frame none of
    /// which was written is dropped with the error.
    pub async fn send_with(
        &mut self,
        msg_type: MessageType,
        payload: impl Into<Bytes>,
        options: SendOptions,
    ) -> Result<u64, TransportError> {
        self.flush().await?;

        let message_id = match options.message_id {
            Some(id) => id,
            None => self.allocate_id(),
        };
        let frame = Frame::new(msg_type, payload)
            .with_flags(options.flags)
            .with_message_id(message_id);
        let bytes = self.codec.encode(&frame, options.compress)?;
        let len = bytes.len();
        self.outbound.push_back(bytes);

        if let Err(e) = self.flush().await {
            if self.outbound.len() == 1 && self.offset == 0 {
                self.outbound.clear();
            }
            return Err(e);
        }
        self.conn.metrics().frame_sent();
        tracing::trace!(message_id, ?msg_type, len, "frame sent");
        Ok(message_id)
    }

    async fn flush(&mut self) -> Result<(), TransportError> {
        while let Some(front) = self.outbound.front() {
            let end = (self.offset + self.chunk).min(front.len());
            let chunk = front.slice(self.offset..end);
            self.conn.send(&chunk).await?;
            self.advance(end);
        }
        Ok(())
    }

    /// Write queued chunks without waiting.
    fn try_flush(&mut self) -> Result<(), ConnectionError> {
        while let Some(front) = self.outbound.front() {
            let end = (self.offset + self.chunk).min(front.len());
            let chunk = front.slice(self.offset..end);
            match self.conn.try_send(&chunk)? {
                WriteResult::Written(_) => self.advance(end),
                WriteResult::WouldBlock => break,
            }
        }
        Ok(())
    }

    fn advance(&mut self, end: usize) {
        let done = self.outbound.front().is_some_and(|f| f.len() == end);
        if done {
            self.outbound.pop_front();
            self.offset = 0;
        } else {
            self.offset = end;
        }
    }

    /// Next whole message, if one is buffered. Never blocks.
    pub fn receive(&mut self) -> Result<Option<Incoming>, TransportError> {
        if self.conn.is_closed() {
            return Err(ConnectionError::Closed.into());
        }
        if let Err(e) = self.try_flush() {
            // Whatever the peer already sent can still be read.
            tracing::trace!(slot_id = self.conn.slot_id(), %e, "could not flush queued frames");
        }
        loop {
            if let Some(incoming) = self.decode_buffered()? {
                return Ok(Some(incoming));
            }
            match self.conn.receive()? {
                Some(bytes) => self.inbound.extend_from_slice(&bytes),
                None => return Ok(None),
            }
        }
    }

    /// Poll [`receive`](Self::receive) until a message arrives.
    pub async fn next_message(&mut self) -> Result<Incoming, TransportError> {
        let mut idle = 0u32;
        loop {
            if let Some(incoming) = self.receive()? {
                return Ok(incoming);
            }
            idle = idle.saturating_add(1);
            if idle <= SPIN_POLLS {
                tokio::task::yield_now().await;
            } else {
                tokio::time::sleep(IDLE_POLL).await;
            }
        }
    }

    fn decode_buffered(&mut self) -> Result<Option<Incoming>, TransportError> {
        loop {
            let frame = match self.codec.decode_from(&mut self.inbound) {
                Ok(Some(frame)) => frame,
                Ok(None) => return Ok(None),
                Err(err @ FrameError::ChecksumMismatch { message_id, .. }) => {
                    self.conn.metrics().checksum_failure();
                    tracing::warn!(
                        slot_id = self.conn.slot_id(),
                        message_id,
                        %err,
                        "checksum mismatch"
                    );
                    self.queue_error(ErrorPayload::from_frame_error(&err, message_id));
                    match self.checksum_policy {
                        ChecksumPolicy::RequestRetransmit => continue,
                        ChecksumPolicy::Close => {
                            self.shutdown();
                            return Err(err.into());
                        }
                    }
                }
                Err(err) => {
                    let message_id = FrameHeader::peek_message_id(&self.inbound).unwrap_or(0);
                    self.conn.metrics().protocol_error();
                    tracing::warn!(
                        slot_id = self.conn.slot_id(),
                        message_id,
                        code = ?err.error_code(),
                        %err,
                        "protocol error, closing connection"
                    );
                    self.queue_error(ErrorPayload::from_frame_error(&err, message_id));
                    self.shutdown();
                    return Err(err.into());
                }
            };

            self.conn.metrics().frame_received();
            if frame.msg_type == MessageType::DISCONNECT {
                tracing::debug!(slot_id = self.conn.slot_id(), "peer sent disconnect");
                self.shutdown();
                return Err(
                    ConnectionError::Disconnected(DisconnectReason::RemoteDisconnect).into(),
                );
            }

            let message = Message::from(frame);
            if self.registry.is_known(message.msg_type) {
                return Ok(Some(Incoming::Message(message)));
            }

            self.conn.metrics().unrecognized_type();
            match self.unknown_type_policy {
                UnknownTypePolicy::Deliver => return Ok(Some(Incoming::Unrecognized(message))),
                UnknownTypePolicy::Skip => {
                    tracing::debug!(
                        message_id = message.message_id,
                        msg_type = ?message.msg_type,
                        "skipping unrecognized message"
                    );
                }
                UnknownTypePolicy::Close => {
                    tracing::warn!(
                        message_id = message.message_id,
                        msg_type = ?message.msg_type,
                        "unrecognized message type, closing connection"
                    );
                    self.queue_error(ErrorPayload::new(
                        ErrorCode::Internal,
                        message.message_id,
                        format!("unrecognized message type {:?}", message.msg_type),
                    ));
                    self.shutdown();
                    return Err(TransportError::UnrecognizedType {
                        msg_type: message.msg_type.0,
                        message_id: message.message_id,
                    });
                }
            }
        }
    }

    fn queue_error(&mut self, payload: ErrorPayload) {
        let frame = Frame::new(MessageType::ERROR, payload.encode())
            .with_flags(FrameFlags::RESPONSE)
            .with_message_id(payload.message_id);
        match self.codec.encode(&frame, false) {
            Ok(bytes) => self.outbound.push_back(bytes),
            Err(e) => tracing::warn!(%e, "cannot encode error frame"),
        }
        if let Err(e) = self.try_flush() {
            tracing::debug!(%e, "error frame left queued");
        }
    }

    /// Best-effort flush, then close the connection.
    fn shutdown(&mut self) {
        let _ = self.try_flush();
        self.inbound.clear();
        self.outbound.clear();
        self.offset = 0;
        self.conn.close();
    }

    /// Tell the peer we are leaving, then close. Idempotent.
    pub fn close(&mut self) {
        if self.conn.is_closed() {
            return;
        }
        let frame = Frame::new(MessageType::DISCONNECT, Bytes::new())
            .with_message_id(self.allocate_id());
        if let Ok(bytes) = self.codec.encode(&frame, false) {
            self.outbound.push_back(bytes);
        }
        self.shutdown();
    }
}

impl Drop for MessageStream {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for MessageStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageStream")
            .field("conn", &self.conn)
            .field("next_id", &self.next_id)
            .field("pending", &self.outbound.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackoffConfig;
    use crate::testing::{Fixture, fast_backoff, fixture};

    fn streams(
        fx: &Fixture,
        backoff: BackoffConfig,
        config: &TransportConfig,
    ) -> (MessageStream, MessageStream) {
        let (server, client) = fx.pair(backoff);
        (MessageStream::new(server, config), MessageStream::new(client, config))
    }

    fn patient() -> BackoffConfig {
        BackoffConfig {
            initial: Duration::from_millis(1),
            max: Duration::from_millis(10),
            max_attempts: 50,
        }
    }

    #[tokio::test]
    async fn request_and_reply_correlate() {
        let fx = fixture("framed_reply");
        let config = TransportConfig::default();
        let (mut server, mut client) = streams(&fx, fast_backoff(), &config);

        let id = client.send(MessageType::ASK_REQUEST, "question").await.unwrap();
        assert_eq!(id, 1);
        let request = server.receive().unwrap().unwrap().into_message();
        assert!(request.is_request());
        assert_eq!(request.message_id, 1);
        assert_eq!(request.payload, "question");

        server
            .reply(MessageType::ASK_RESPONSE, "answer", request.message_id)
            .await
            .unwrap();
        let Incoming::Message(response) = client.receive().unwrap().unwrap() else {
            panic!("expected a recognized message");
        };
        assert!(response.is_response());
        assert_eq!(response.message_id, id);
        assert_eq!(response.msg_type, MessageType::ASK_RESPONSE);
        assert_eq!(client.send(MessageType::HEARTBEAT, Bytes::new()).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn frames_larger_than_the_ring_arrive_whole() {
        let fx = fixture("framed_large");
        let config = TransportConfig::default();
        let (mut server, mut client) = streams(&fx, patient(), &config);
        let payload: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();

        let expected = payload.clone();
        let (sent, received) = tokio::join!(
            client.send(MessageType::TOOL_RESULT, payload),
            server.next_message()
        );
        let id = sent.unwrap();
        let message = received.unwrap().into_message();
        assert_eq!(message.message_id, id);
        assert_eq!(message.payload, expected);
    }

    #[tokio::test]
    async fn compressed_payload_is_restored() {
        let fx = fixture("framed_compress");
        let config = TransportConfig::default();
        let (mut server, mut client) = streams(&fx, fast_backoff(), &config);
        let payload = Bytes::from(vec![b'z'; 64 * 1024]);

        let options = SendOptions {
            flags: FrameFlags::REQUEST,
            compress: true,
            message_id: None,
        };
        client
            .send_with(MessageType::CHAT_MESSAGE, payload.clone(), options)
            .await
            .unwrap();
        let message = server.receive().unwrap().unwrap().into_message();
        assert_eq!(message.payload, payload);
        assert!(!message.flags.contains(FrameFlags::COMPRESSED));
    }

    #[tokio::test]
    async fn partial_frame_is_flushed_before_the_next_send() {
        let fx = fixture("framed_pending");
        let config = TransportConfig::default();
        let (mut server, mut client) = streams(&fx, fast_backoff(), &config);

        let err = client
            .send(MessageType::EDIT_REQUEST, vec![7u8; 6000])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TransportError::Connection(ConnectionError::BackpressureTimeout { .. })
        ));
        assert!(client.has_pending());

        // Drains the ring without completing the frame.
        assert_eq!(server.receive().unwrap(), None);

        client.heartbeat().await.unwrap();
        assert!(!client.has_pending());
        let first = server.receive().unwrap().unwrap().into_message();
        assert_eq!(first.msg_type, MessageType::EDIT_REQUEST);
        assert_eq!(first.payload.len(), 6000);
        let second = server.receive().unwrap().unwrap().into_message();
        assert_eq!(second.msg_type, MessageType::HEARTBEAT);
    }

    #[tokio::test]
    async fn unknown_types_follow_policy() {
        let custom = MessageType(0x8123);

        let fx = fixture("framed_deliver");
        let config = TransportConfig::default();
        let (mut server, mut client) = streams(&fx, fast_backoff(), &config);
        client.send(custom, "x").await.unwrap();
        assert!(matches!(
            server.receive().unwrap(),
            Some(Incoming::Unrecognized(m)) if m.msg_type == custom
        ));
        server.register_type(custom, "Custom");
        client.send(custom, "y").await.unwrap();
        assert!(matches!(server.receive().unwrap(), Some(Incoming::Message(_))));
        drop((server, client));

        let fx = fixture("framed_skip");
        let config = TransportConfig {
            unknown_type_policy: UnknownTypePolicy::Skip,
            ..TransportConfig::default()
        };
        let (mut server, mut client) = streams(&fx, fast_backoff(), &config);
        client.send(custom, "x").await.unwrap();
        client.heartbeat().await.unwrap();
        let next = server.receive().unwrap().unwrap();
        assert_eq!(next.message().msg_type, MessageType::HEARTBEAT);
        assert_eq!(server.connection().metrics().snapshot().unrecognized_types, 1);
        drop((server, client));

        let fx = fixture("framed_close");
        let config = TransportConfig {
            unknown_type_policy: UnknownTypePolicy::Close,
            ..TransportConfig::default()
        };
        let (mut server, mut client) = streams(&fx, fast_backoff(), &config);
        client.send(custom, "x").await.unwrap();
        assert!(matches!(
            server.receive(),
            Err(TransportError::UnrecognizedType { msg_type: 0x8123, message_id: 1 })
        ));
        assert!(server.connection().is_closed());
    }

    fn corrupt_frame(codec: &FrameCodec, id: u64) -> Vec<u8> {
        let frame = Frame::new(MessageType::ASK_REQUEST, "payload")
            .with_flags(FrameFlags::REQUEST)
            .with_message_id(id);
        let mut bytes = codec.encode(&frame, false).unwrap().to_vec();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        bytes
    }

    #[tokio::test]
    async fn checksum_mismatch_can_request_retransmit() {
        let fx = fixture("framed_retransmit");
        let config = TransportConfig {
            checksum_policy: ChecksumPolicy::RequestRetransmit,
            ..TransportConfig::default()
        };
        let (mut server, mut client) = streams(&fx, fast_backoff(), &config);

        let bad = corrupt_frame(&FrameCodec::default(), 42);
        client.connection_mut().send(&bad).await.unwrap();
        client.heartbeat().await.unwrap();

        let next = server.receive().unwrap().unwrap();
        assert_eq!(next.message().msg_type, MessageType::HEARTBEAT);
        assert!(!server.connection().is_closed());

        let error = client.receive().unwrap().unwrap().into_message();
        let body = error.error_payload().unwrap();
        assert_eq!(body.code(), Some(ErrorCode::ChecksumMismatch));
        assert_eq!(body.message_id, 42);
    }

    #[tokio::test]
    async fn checksum_mismatch_closes_by_default() {
        let fx = fixture("framed_crc_close");
        let config = TransportConfig::default();
        let (mut server, mut client) = streams(&fx, fast_backoff(), &config);

        let bad = corrupt_frame(&FrameCodec::default(), 7);
        client.connection_mut().send(&bad).await.unwrap();
        assert!(matches!(
            server.receive(),
            Err(TransportError::Frame(FrameError::ChecksumMismatch { message_id: 7, .. }))
        ));
        assert!(server.connection().is_closed());

        let error = client.receive().unwrap().unwrap().into_message();
        assert_eq!(
            error.error_payload().unwrap().code(),
            Some(ErrorCode::ChecksumMismatch)
        );
    }

    #[tokio::test]
    async fn bad_magic_sends_error_and_closes() {
        let fx = fixture("framed_magic");
        let config = TransportConfig::default();
        let (mut server, mut client) = streams(&fx, fast_backoff(), &config);

        let mut garbage = vec![0u8; 24];
        garbage[..4].copy_from_slice(b"JUNK");
        client.connection_mut().send(&garbage).await.unwrap();
        assert!(matches!(
            server.receive(),
            Err(TransportError::Frame(FrameError::ProtocolMismatch { .. }))
        ));

        let error = client.receive().unwrap().unwrap().into_message();
        assert_eq!(
            error.error_payload().unwrap().code(),
            Some(ErrorCode::ProtocolMismatch)
        );
        assert_eq!(
            client.receive().unwrap_err().disconnect_reason(),
            Some(DisconnectReason::PeerClosed)
        );
    }

    #[tokio::test]
    async fn close_sends_disconnect() {
        let fx = fixture("framed_disconnect");
        let config = TransportConfig::default();
        let (mut server, mut client) = streams(&fx, fast_backoff(), &config);

        client.close();
        client.close();
        assert_eq!(
            server.receive().unwrap_err().disconnect_reason(),
            Some(DisconnectReason::RemoteDisconnect)
        );
        assert!(matches!(
            server.receive(),
            Err(TransportError::Connection(ConnectionError::Closed))
        ));
    }
}
