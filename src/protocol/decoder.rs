//! Per-connection protocol decoder.
//!
//! Bytes from both directions are pushed into [`Decoder::on_data`] as they arrive. The decoder
//! cuts complete messages out of the buffer, hands the interesting ones to the callbacks and
//! writes everything else, unchanged, into the outbound buffer of its direction.

use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, error, trace, warn};

use super::codec::Validation;
use super::messages::{
    backend_message, frontend_message, CommandCompleteMessage, DataRowMessage,
    EmptyQueryResponseMessage, ErrorResponseMessage, Message, MessageSpec, ParseMessage,
    QueryMessage, RawMessage, ReadyForQueryMessage, RowDescriptionMessage, STARTUP_MESSAGE,
};

/// Largest startup packet the server itself accepts.
pub const MAX_STARTUP_PACKET_LENGTH: u32 = 10000;

/// Default cap for steady-state messages (the server's own allocation limit).
pub const DEFAULT_MAX_MESSAGE_SIZE: u32 = 0x3fff_ffff;

pub const SSL_REQUEST_CODE: u32 = 0x04d2_162f;

/// Startup codes at or above this value ask to negotiate encryption instead of a session.
pub const NEGOTIATE_CODE_MIN: u32 = 0x04d2_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderState {
    Init,
    NegotiatingUpstreamSsl,
    InSync,
    OutOfSync,
    Encrypted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeResult {
    /// A message was handled; call again if bytes remain.
    ReadyForNext,
    /// The buffer holds a partial message and was left untouched.
    NeedMoreData,
    /// The caller must pause this direction, e.g. to perform a TLS handshake.
    Stopped,
}

/// Replacement data produced while decoding, per destination.
#[derive(Debug, Default)]
pub struct Outbound {
    /// Bytes for the server.
    pub upstream: BytesMut,
    /// Bytes for the client.
    pub downstream: BytesMut,
}

impl Outbound {
    pub fn is_empty(&self) -> bool {
        self.upstream.is_empty() && self.downstream.is_empty()
    }
}

/// Hooks invoked by the decoder. Message hooks take ownership of the message and are
/// responsible for writing whatever should be forwarded; the defaults forward unchanged.
pub trait DecoderCallbacks {
    fn process_query(&mut self, message: QueryMessage, out: &mut Outbound) {
        message.write(&mut out.upstream);
    }

    fn process_parse(&mut self, message: ParseMessage, out: &mut Outbound) {
        message.write(&mut out.upstream);
    }

    fn process_row_description(&mut self, message: RowDescriptionMessage, out: &mut Outbound) {
        message.write(&mut out.downstream);
    }

    fn process_data_row(&mut self, message: DataRowMessage, out: &mut Outbound) {
        message.write(&mut out.downstream);
    }

    fn process_command_complete(&mut self, message: CommandCompleteMessage, out: &mut Outbound) {
        message.write(&mut out.downstream);
    }

    fn process_empty_query_response(
        &mut self,
        message: EmptyQueryResponseMessage,
        out: &mut Outbound,
    ) {
        message.write(&mut out.downstream);
    }

    fn process_error_response(&mut self, message: ErrorResponseMessage, out: &mut Outbound) {
        message.write(&mut out.downstream);
    }

    fn process_ready_for_query(&mut self, message: ReadyForQueryMessage, out: &mut Outbound) {
        message.write(&mut out.downstream);
    }

    /// Any other validated message.
    fn process_raw(&mut self, message: RawMessage, frontend: bool, out: &mut Outbound) {
        if frontend {
            out.upstream.put_slice(&message.bytes);
        } else {
            out.downstream.put_slice(&message.bytes);
        }
    }

    /// Client asked for TLS. Returns true to pass the request to the server untouched, false
    /// when the transport terminates TLS itself and a plaintext startup will follow.
    fn on_ssl_request(&mut self) -> bool;

    fn should_encrypt_upstream(&self) -> bool;

    fn send_upstream(&mut self, data: Bytes);

    /// Server answered the synthetic SSLRequest. `startup` is the client's buffered startup
    /// packet. Returns true once the upstream channel is secured and the packet replayed.
    fn encrypt_upstream(&mut self, upstream_agreed: bool, startup: Bytes) -> bool;

    fn on_protocol_violation(&mut self, _frontend: bool, _reason: &str) {}
}

pub struct Decoder {
    state: DecoderState,
    max_message_size: u32,
    outbound: Outbound,
    startup_packet: BytesMut,
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder {
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_MAX_MESSAGE_SIZE)
    }

    pub fn with_limits(max_message_size: u32) -> Self {
        Self {
            state: DecoderState::Init,
            max_message_size,
            outbound: Outbound::default(),
            startup_packet: BytesMut::new(),
        }
    }

    pub fn state(&self) -> DecoderState {
        self.state
    }

    pub fn outbound_mut(&mut self) -> &mut Outbound {
        &mut self.outbound
    }

    /// Takes everything produced so far.
    pub fn take_outbound(&mut self) -> Outbound {
        std::mem::take(&mut self.outbound)
    }

    /// Handles at most one message from `data`, removing the consumed bytes.
    pub fn on_data(
        &mut self,
        data: &mut BytesMut,
        frontend: bool,
        callbacks: &mut dyn DecoderCallbacks,
    ) -> DecodeResult {
        match self.state {
            DecoderState::Init => self.on_data_init(data, frontend, callbacks),
            DecoderState::InSync => self.on_data_in_sync(data, frontend, callbacks),
            DecoderState::NegotiatingUpstreamSsl => {
                self.on_data_negotiating(data, frontend, callbacks)
            }
            DecoderState::OutOfSync | DecoderState::Encrypted => self.on_data_ignore(data, frontend),
        }
    }

    fn direction_buffer(&mut self, frontend: bool) -> &mut BytesMut {
        if frontend {
            &mut self.outbound.upstream
        } else {
            &mut self.outbound.downstream
        }
    }

    fn on_data_ignore(&mut self, data: &mut BytesMut, frontend: bool) -> DecodeResult {
        let chunk = data.split();
        self.direction_buffer(frontend).unsplit(chunk);
        DecodeResult::ReadyForNext
    }

    fn go_out_of_sync(
        &mut self,
        data: &mut BytesMut,
        frontend: bool,
        reason: &str,
        callbacks: &mut dyn DecoderCallbacks,
    ) -> DecodeResult {
        error!("postgres protocol out of sync: {}", reason);
        callbacks.on_protocol_violation(frontend, reason);
        self.state = DecoderState::OutOfSync;
        self.on_data_ignore(data, frontend)
    }

    fn on_data_init(
        &mut self,
        data: &mut BytesMut,
        frontend: bool,
        callbacks: &mut dyn DecoderCallbacks,
    ) -> DecodeResult {
        if !frontend {
            // Nothing the server sends before a startup packet is subject to rewriting.
            return self.on_data_ignore(data, frontend);
        }
        if data.len() < 4 {
            return DecodeResult::NeedMoreData;
        }

        let message_len = BigEndian::read_u32(&data[0..4]);
        if message_len > MAX_STARTUP_PACKET_LENGTH || message_len < 8 {
            let reason = format!("invalid startup packet length {}", message_len);
            return self.go_out_of_sync(data, frontend, &reason, callbacks);
        }

        let mut pos = 4;
        let mut left = message_len as usize - 4;
        match STARTUP_MESSAGE.format.validate(data, &mut pos, &mut left) {
            Validation::NeedMoreData => return DecodeResult::NeedMoreData,
            Validation::Failed => {
                return self.go_out_of_sync(data, frontend, "malformed startup packet", callbacks);
            }
            Validation::Ok => {}
        }

        let code = BigEndian::read_u32(&data[4..8]);
        let packet = data.split_to(message_len as usize).freeze();
        let mut result = DecodeResult::ReadyForNext;

        if code >= NEGOTIATE_CODE_MIN {
            let pass_through = code != SSL_REQUEST_CODE || callbacks.on_ssl_request();
            if pass_through {
                trace!("detected encrypted traffic");
                self.state = DecoderState::Encrypted;
            } else {
                // TLS is terminated locally; the client repeats its startup afterwards.
                debug!("terminating client TLS");
                result = DecodeResult::Stopped;
            }
        } else {
            debug!("detected version {}.{} of Postgres", code >> 16, code & 0xffff);
            if callbacks.should_encrypt_upstream() {
                self.startup_packet.clear();
                self.startup_packet.extend_from_slice(&packet);

                let mut ssl_request = BytesMut::with_capacity(8);
                ssl_request.put_u32(8);
                ssl_request.put_u32(SSL_REQUEST_CODE);
                callbacks.send_upstream(ssl_request.freeze());

                result = DecodeResult::Stopped;
                self.state = DecoderState::NegotiatingUpstreamSsl;
            } else {
                self.state = DecoderState::InSync;
            }
        }

        self.outbound.upstream.put_slice(&packet);
        result
    }

    fn on_data_negotiating(
        &mut self,
        data: &mut BytesMut,
        frontend: bool,
        callbacks: &mut dyn DecoderCallbacks,
    ) -> DecodeResult {
        if frontend {
            return self.go_out_of_sync(
                data,
                frontend,
                "client data received while negotiating upstream TLS",
                callbacks,
            );
        }

        let reply = data.split();
        let mut upstream_agreed = false;
        self.state = DecoderState::Init;
        match reply.as_ref() {
            [b'S'] => upstream_agreed = true,
            [b'N'] | [b'E'] => {}
            _ => {
                warn!("unexpected reply of {} bytes to SSLRequest", reply.len());
                callbacks.on_protocol_violation(frontend, "unexpected reply to SSLRequest");
                self.state = DecoderState::OutOfSync;
            }
        }

        let startup = self.startup_packet.split().freeze();
        if callbacks.encrypt_upstream(upstream_agreed, startup) {
            self.state = DecoderState::InSync;
        }
        DecodeResult::Stopped
    }

    fn on_data_in_sync(
        &mut self,
        data: &mut BytesMut,
        frontend: bool,
        callbacks: &mut dyn DecoderCallbacks,
    ) -> DecodeResult {
        if data.len() < 5 {
            return DecodeResult::NeedMoreData;
        }

        let tag = data[0];
        let spec: MessageSpec = if frontend {
            frontend_message(tag)
        } else {
            backend_message(tag)
        };

        let message_len = BigEndian::read_u32(&data[1..5]);
        if message_len < 4 {
            let reason = format!("{} message length {} is too small", spec.name, message_len);
            return self.go_out_of_sync(data, frontend, &reason, callbacks);
        }
        if message_len > self.max_message_size {
            let reason = format!("{} message of {} bytes exceeds limit", spec.name, message_len);
            return self.go_out_of_sync(data, frontend, &reason, callbacks);
        }

        let mut pos = 5;
        let mut left = message_len as usize - 4;
        match spec.format.validate(data, &mut pos, &mut left) {
            Validation::NeedMoreData => {
                trace!("cannot parse {} yet, {} bytes buffered", spec.name, data.len());
                return DecodeResult::NeedMoreData;
            }
            Validation::Ok if left == 0 => {}
            Validation::Ok | Validation::Failed => {
                let reason = format!("malformed {} message", spec.name);
                return self.go_out_of_sync(data, frontend, &reason, callbacks);
            }
        }

        let frame = data.split_to(message_len as usize + 1).freeze();
        trace!(
            "{} message {} ({} bytes)",
            if frontend { "frontend" } else { "backend" },
            spec.name,
            frame.len()
        );

        let message = match spec.format.decode(Some(tag), frame.clone(), 5) {
            Ok(message) => message,
            Err(e) => {
                // Validated bytes that still cannot be decoded are forwarded as they are.
                warn!("unable to decode {} message: {}", spec.name, e);
                self.direction_buffer(frontend).put_slice(&frame);
                return DecodeResult::ReadyForNext;
            }
        };

        let out = &mut self.outbound;
        match message {
            Message::Query(m) => callbacks.process_query(m, out),
            Message::Parse(m) => callbacks.process_parse(m, out),
            Message::RowDescription(m) => callbacks.process_row_description(m, out),
            Message::DataRow(m) => callbacks.process_data_row(m, out),
            Message::CommandComplete(m) => callbacks.process_command_complete(m, out),
            Message::EmptyQueryResponse(m) => callbacks.process_empty_query_response(m, out),
            Message::ErrorResponse(m) => callbacks.process_error_response(m, out),
            Message::ReadyForQuery(m) => callbacks.process_ready_for_query(m, out),
            Message::Raw(raw) => callbacks.process_raw(raw, frontend, out),
        }
        DecodeResult::ReadyForNext
    }
}
