//! Byte-level filter for one proxied connection.
//!
//! The filter owns the decoder and the mutation manager of a session. The socket layer pushes
//! whatever it reads from either peer and writes back whatever the filter returns. Anything
//! that needs the sockets themselves, such as TLS handshakes, goes through [`Transport`].

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tracing::{debug, trace};

use crate::config::ProxySettings;
use crate::mutation_manager::{ManagerSettings, MutationManager};
use crate::mutators::MutatorContext;
use crate::protocol::decoder::{DecodeResult, Decoder, DecoderCallbacks, DecoderState, Outbound};
use crate::protocol::messages::{
    CommandCompleteMessage, DataRowMessage, EmptyQueryResponseMessage, ErrorResponseMessage,
    ParseMessage, QueryMessage, RawMessage, ReadyForQueryMessage, RowDescriptionMessage,
};
use crate::security::{events, SecurityAuditLogger};

/// Socket-side operations requested while decoding.
pub trait Transport {
    /// Client sent SSLRequest. Return true to hand it to the server, false after arranging
    /// to answer `S` and terminate TLS locally.
    fn on_ssl_request(&mut self) -> bool;

    fn should_encrypt_upstream(&self) -> bool;

    /// Raw bytes that must reach the server before anything else in the current batch.
    fn send_upstream(&mut self, data: Bytes);

    /// Server answered the proxy's SSLRequest. Return true when the upstream handshake will
    /// go ahead and `startup` will be replayed over it.
    fn encrypt_upstream(&mut self, upstream_agreed: bool, startup: Bytes) -> bool;
}

#[derive(Debug, Clone, Copy)]
pub struct FilterSettings {
    pub manager: ManagerSettings,
    pub max_message_size: u32,
}

impl Default for FilterSettings {
    fn default() -> Self {
        FilterSettings {
            manager: ManagerSettings::default(),
            max_message_size: crate::protocol::decoder::DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

impl From<&ProxySettings> for FilterSettings {
    fn from(settings: &ProxySettings) -> Self {
        FilterSettings {
            manager: ManagerSettings {
                enable_sql_parsing: settings.enable_sql_parsing,
                permissive_parsing: settings.permissive_parsing,
            },
            max_message_size: settings.max_message_size,
        }
    }
}

/// Bytes to write after one read.
#[derive(Debug, Default)]
pub struct FilterOutput {
    pub to_upstream: Bytes,
    pub to_downstream: Bytes,
    /// Decoding of this direction paused; the transport has work to do first.
    pub stopped: bool,
}

struct Session<T> {
    manager: MutationManager,
    transport: T,
    audit: Arc<SecurityAuditLogger>,
    session_id: String,
}

/// Bytes already queued in the direction `frontend` data flows to.
fn forwarded_len(out: &Outbound, frontend: bool) -> usize {
    if frontend {
        out.upstream.len()
    } else {
        out.downstream.len()
    }
}

fn direction(frontend: bool) -> &'static str {
    if frontend { "frontend" } else { "backend" }
}

impl<T: Transport> DecoderCallbacks for Session<T> {
    fn process_query(&mut self, message: QueryMessage, out: &mut Outbound) {
        self.manager.process_query(message, out);
    }

    fn process_parse(&mut self, message: ParseMessage, out: &mut Outbound) {
        self.manager.process_parse(message, out);
    }

    fn process_row_description(&mut self, message: RowDescriptionMessage, out: &mut Outbound) {
        self.manager.process_row_description(message, out);
    }

    fn process_data_row(&mut self, message: DataRowMessage, out: &mut Outbound) {
        self.manager.process_data_row(message, out);
    }

    fn process_command_complete(&mut self, message: CommandCompleteMessage, out: &mut Outbound) {
        self.manager.process_command_complete(message, out);
    }

    fn process_empty_query_response(
        &mut self,
        message: EmptyQueryResponseMessage,
        out: &mut Outbound,
    ) {
        self.manager.process_empty_query_response(message, out);
    }

    fn process_error_response(&mut self, message: ErrorResponseMessage, out: &mut Outbound) {
        self.manager.process_error_response(message, out);
    }

    fn process_ready_for_query(&mut self, message: ReadyForQueryMessage, out: &mut Outbound) {
        self.manager.process_ready_for_query(message, out);
    }

    fn process_raw(&mut self, message: RawMessage, frontend: bool, out: &mut Outbound) {
        if frontend {
            self.manager.process_frontend_raw(message, out);
        } else {
            message.write_to(&mut out.downstream);
        }
    }

    fn on_ssl_request(&mut self) -> bool {
        let pass_through = self.transport.on_ssl_request();
        let outcome = if pass_through { "forwarded" } else { "terminated" };
        events::ssl_negotiation(&self.audit, &self.session_id, "client", outcome);
        pass_through
    }

    fn should_encrypt_upstream(&self) -> bool {
        self.transport.should_encrypt_upstream()
    }

    fn send_upstream(&mut self, data: Bytes) {
        self.transport.send_upstream(data);
    }

    fn encrypt_upstream(&mut self, upstream_agreed: bool, startup: Bytes) -> bool {
        let secured = self.transport.encrypt_upstream(upstream_agreed, startup);
        let outcome = match (upstream_agreed, secured) {
            (true, true) => "established",
            (false, _) => "refused by server",
            (true, false) => "failed",
        };
        events::ssl_negotiation(&self.audit, &self.session_id, "server", outcome);
        secured
    }

    fn on_protocol_violation(&mut self, frontend: bool, reason: &str) {
        events::protocol_violation(&self.audit, &self.session_id, direction(frontend), reason);
    }
}

/// Decoder, mutation manager and the partial data of both directions.
pub struct TdeFilter<T: Transport> {
    decoder: Decoder,
    session: Session<T>,
    frontend: BytesMut,
    backend: BytesMut,
}

impl<T: Transport> TdeFilter<T> {
    pub fn new(
        settings: FilterSettings,
        context: &MutatorContext,
        audit: Arc<SecurityAuditLogger>,
        session_id: impl Into<String>,
        transport: T,
    ) -> Self {
        let session_id = session_id.into();
        let manager = MutationManager::new(settings.manager, context, audit.clone(), session_id.clone());
        Self::with_manager(settings.max_message_size, manager, audit, session_id, transport)
    }

    pub fn with_manager(
        max_message_size: u32,
        manager: MutationManager,
        audit: Arc<SecurityAuditLogger>,
        session_id: impl Into<String>,
        transport: T,
    ) -> Self {
        TdeFilter {
            decoder: Decoder::with_limits(max_message_size),
            session: Session {
                manager,
                transport,
                audit,
                session_id: session_id.into(),
            },
            frontend: BytesMut::new(),
            backend: BytesMut::new(),
        }
    }

    pub fn state(&self) -> DecoderState {
        self.decoder.state()
    }

    pub fn transport(&self) -> &T {
        &self.session.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.session.transport
    }

    /// Bytes read from the client.
    pub fn on_frontend_data(&mut self, data: &[u8]) -> FilterOutput {
        self.frontend.extend_from_slice(data);
        self.drain(true)
    }

    /// Bytes read from the server.
    pub fn on_backend_data(&mut self, data: &[u8]) -> FilterOutput {
        self.backend.extend_from_slice(data);
        self.drain(false)
    }

    fn drain(&mut self, frontend: bool) -> FilterOutput {
        let buffer = if frontend { &mut self.frontend } else { &mut self.backend };
        let mut stopped = false;
        let mut message_start = 0;
        while !buffer.is_empty() {
            message_start = forwarded_len(self.decoder.outbound_mut(), frontend);
            match self.decoder.on_data(buffer, frontend, &mut self.session) {
                DecodeResult::ReadyForNext => {}
                DecodeResult::NeedMoreData => {
                    trace!("{} waiting for {} more bytes", direction(frontend), buffer.len());
                    break;
                }
                DecodeResult::Stopped => {
                    debug!("{} decoding stopped in state {:?}", direction(frontend), self.decoder.state());
                    stopped = true;
                    break;
                }
            }
        }

        let mut out = self.decoder.take_outbound();
        if stopped {
            // The packet that caused the stop is handled by the transport, not forwarded.
            if frontend {
                out.upstream.truncate(message_start);
            } else {
                out.downstream.truncate(message_start);
            }
        }
        FilterOutput {
            to_upstream: out.upstream.freeze(),
            to_downstream: out.downstream.freeze(),
            stopped,
        }
    }
}
