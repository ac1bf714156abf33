//! Accept loop and per-connection relay.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{ProxySettings, UpstreamSsl};
use crate::crypto::RustCryptoProvider;
use crate::error::{TdeError, TdeResult};
use crate::mutators::MutatorContext;
use crate::protocol::messages::ErrorResponseMessage;
use crate::security::{events, SecurityAuditLogger};
use crate::session::{FilterOutput, FilterSettings, TdeFilter, Transport};
use crate::tls;

const READ_BUFFER_SIZE: usize = 16 * 1024;

trait ProxyIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ProxyIo for T {}

/// Either side of a connection, before or after its TLS upgrade.
type ProxyStream = Box<dyn ProxyIo>;

/// Socket work requested by the filter, applied once the current read is processed.
#[derive(Debug, PartialEq)]
enum TransportAction {
    AcceptClientTls,
    SendUpstream(Bytes),
    StartUpstreamTls(Bytes),
    Close(&'static str),
}

struct SocketTransport {
    terminate_ssl: bool,
    encrypt_upstream: bool,
    actions: Vec<TransportAction>,
}

impl SocketTransport {
    fn new(settings: &ProxySettings) -> Self {
        SocketTransport {
            terminate_ssl: settings.terminate_ssl,
            encrypt_upstream: settings.upstream_ssl == UpstreamSsl::Require,
            actions: Vec::new(),
        }
    }

    fn take_actions(&mut self) -> Vec<TransportAction> {
        std::mem::take(&mut self.actions)
    }
}

impl Transport for SocketTransport {
    fn on_ssl_request(&mut self) -> bool {
        if self.terminate_ssl {
            self.actions.push(TransportAction::AcceptClientTls);
            false
        } else {
            true
        }
    }

    fn should_encrypt_upstream(&self) -> bool {
        self.encrypt_upstream
    }

    fn send_upstream(&mut self, data: Bytes) {
        self.actions.push(TransportAction::SendUpstream(data));
    }

    fn encrypt_upstream(&mut self, upstream_agreed: bool, startup: Bytes) -> bool {
        if upstream_agreed {
            self.actions.push(TransportAction::StartUpstreamTls(startup));
            true
        } else {
            self.actions.push(TransportAction::Close("server does not support TLS"));
            false
        }
    }
}

pub struct ProxyServer {
    settings: ProxySettings,
    context: MutatorContext,
    audit: Arc<SecurityAuditLogger>,
    acceptor: Option<TlsAcceptor>,
    connector: Option<(TlsConnector, ServerName<'static>)>,
}

impl ProxyServer {
    pub fn new(settings: ProxySettings, audit: Arc<SecurityAuditLogger>) -> TdeResult<Self> {
        settings.validate()?;
        let encryption = settings.encryption_config()?;
        let context = MutatorContext::new(Arc::new(encryption), Arc::new(RustCryptoProvider::new()));
        Ok(ProxyServer {
            acceptor: tls::build_acceptor(&settings)?,
            connector: tls::build_connector(&settings)?,
            settings,
            context,
            audit,
        })
    }

    pub async fn run(self) -> TdeResult<()> {
        let listener = TcpListener::bind(&self.settings.listen).await?;
        info!(
            "pgtde listening on {}, forwarding to {}",
            listener.local_addr()?,
            self.settings.upstream
        );
        Arc::new(self).serve(listener).await
    }

    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> TdeResult<()> {
        loop {
            let (socket, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("failed to accept connection: {}", e);
                    continue;
                }
            };
            let server = self.clone();
            tokio::spawn(async move {
                let session_id = Uuid::new_v4().to_string();
                events::connection_accepted(&server.audit, &session_id, addr);
                let reason = match server.handle_connection(socket, addr, &session_id).await {
                    Ok(reason) => reason.to_string(),
                    Err(e) => {
                        warn!("session {} from {} ended with error: {}", session_id, addr, e);
                        e.to_string()
                    }
                };
                events::connection_closed(&server.audit, &session_id, &reason);
            });
        }
    }

    async fn handle_connection(
        &self,
        socket: TcpStream,
        addr: SocketAddr,
        session_id: &str,
    ) -> TdeResult<&'static str> {
        socket.set_nodelay(true)?;
        let mut client: ProxyStream = Box::new(socket);

        let upstream = match TcpStream::connect(&self.settings.upstream).await {
            Ok(upstream) => upstream,
            Err(e) => {
                error!("cannot connect to {}: {}", self.settings.upstream, e);
                let mut reply = BytesMut::new();
                ErrorResponseMessage::error("08006", "pgtde: could not connect to server")
                    .write(&mut reply);
                client.write_all(&reply).await?;
                return Err(e.into());
            }
        };
        upstream.set_nodelay(true)?;
        let mut server: ProxyStream = Box::new(upstream);
        debug!("session {} from {} connected to {}", session_id, addr, self.settings.upstream);

        let mut filter = TdeFilter::new(
            FilterSettings::from(&self.settings),
            &self.context,
            self.audit.clone(),
            session_id,
            SocketTransport::new(&self.settings),
        );
        let mut client_buf = vec![0u8; READ_BUFFER_SIZE];
        let mut server_buf = vec![0u8; READ_BUFFER_SIZE];

        loop {
            let output: FilterOutput = tokio::select! {
                read = client.read(&mut client_buf) => {
                    let n = read?;
                    if n == 0 {
                        return Ok("client disconnected");
                    }
                    filter.on_frontend_data(&client_buf[..n])
                }
                read = server.read(&mut server_buf) => {
                    let n = read?;
                    if n == 0 {
                        return Ok("server disconnected");
                    }
                    filter.on_backend_data(&server_buf[..n])
                }
            };

            if !output.to_upstream.is_empty() {
                server.write_all(&output.to_upstream).await?;
            }
            if !output.to_downstream.is_empty() {
                client.write_all(&output.to_downstream).await?;
            }

            for action in filter.transport_mut().take_actions() {
                match action {
                    TransportAction::AcceptClientTls => {
                        let acceptor = self
                            .acceptor
                            .as_ref()
                            .ok_or_else(|| TdeError::Tls("TLS termination is not configured".to_string()))?;
                        client.write_all(b"S").await?;
                        client.flush().await?;
                        client = Box::new(acceptor.accept(client).await?);
                        debug!("session {} client TLS established", session_id);
                    }
                    TransportAction::SendUpstream(data) => {
                        server.write_all(&data).await?;
                    }
                    TransportAction::StartUpstreamTls(startup) => {
                        let (connector, name) = self
                            .connector
                            .as_ref()
                            .ok_or_else(|| TdeError::Tls("upstream TLS is not configured".to_string()))?;
                        let mut secured = connector.connect(name.clone(), server).await?;
                        secured.write_all(&startup).await?;
                        server = Box::new(secured);
                        debug!("session {} server TLS established", session_id);
                    }
                    TransportAction::Close(reason) => {
                        let mut reply = BytesMut::new();
                        ErrorResponseMessage::error("08006", &format!("pgtde: {}", reason))
                            .write(&mut reply);
                        client.write_all(&reply).await?;
                        return Ok(reason);
                    }
                }
            }
        }
    }
}
