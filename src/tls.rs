//! TLS endpoints of the proxy: the acceptor that terminates client TLS and the connector used
//! towards the server.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{info, warn};

use crate::config::{ProxySettings, UpstreamSsl};
use crate::error::{TdeError, TdeResult};

fn tls_error(context: &str, e: impl std::fmt::Display) -> TdeError {
    TdeError::Tls(format!("{}: {}", context, e))
}

pub fn load_certs(path: &Path) -> TdeResult<Vec<CertificateDer<'static>>> {
    let file = File::open(path).map_err(|e| tls_error(&format!("cannot open {}", path.display()), e))?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| tls_error("cannot parse certificates", e))?;
    if certs.is_empty() {
        return Err(TdeError::Tls(format!("no certificates in {}", path.display())));
    }
    Ok(certs)
}

pub fn load_private_key(path: &Path) -> TdeResult<PrivateKeyDer<'static>> {
    let file = File::open(path).map_err(|e| tls_error(&format!("cannot open {}", path.display()), e))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| tls_error("cannot parse private key", e))?
        .ok_or_else(|| TdeError::Tls(format!("no private key in {}", path.display())))
}

/// Throwaway certificate for `localhost`, used when TLS termination has no configured identity.
pub fn self_signed_identity() -> TdeResult<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
        .map_err(|e| tls_error("cannot generate certificate", e))?;
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der()));
    Ok((vec![certified.cert.der().clone()], key))
}

/// Acceptor for client connections, if the proxy terminates TLS.
pub fn build_acceptor(settings: &ProxySettings) -> TdeResult<Option<TlsAcceptor>> {
    if !settings.terminate_ssl {
        return Ok(None);
    }

    let (certs, key) = match (&settings.tls_cert, &settings.tls_key) {
        (Some(cert), Some(key)) => (load_certs(cert)?, load_private_key(key)?),
        _ => {
            warn!("no tls_cert/tls_key configured, using a self-signed certificate");
            self_signed_identity()?
        }
    };

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| tls_error("invalid server certificate", e))?;
    info!("client TLS termination enabled");
    Ok(Some(TlsAcceptor::from(Arc::new(config))))
}

/// Connector for the server side plus the name to verify, if upstream TLS is required.
pub fn build_connector(
    settings: &ProxySettings,
) -> TdeResult<Option<(TlsConnector, ServerName<'static>)>> {
    if settings.upstream_ssl != UpstreamSsl::Require {
        return Ok(None);
    }

    let config = match &settings.upstream_ca {
        Some(ca) => {
            let mut roots = RootCertStore::empty();
            for cert in load_certs(ca)? {
                roots
                    .add(cert)
                    .map_err(|e| tls_error("cannot add CA certificate", e))?;
            }
            ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth()
        }
        None => {
            warn!("no upstream_ca configured, the server certificate is not verified");
            ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(verifier::AcceptAnyServerCert::new()))
                .with_no_client_auth()
        }
    };

    let host = settings.upstream_host();
    let server_name = ServerName::try_from(host.clone())
        .map_err(|e| tls_error(&format!("invalid server name {}", host), e))?;
    Ok(Some((TlsConnector::from(Arc::new(config)), server_name)))
}

mod verifier {
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, WebPkiSupportedAlgorithms};
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{DigitallySignedStruct, Error, SignatureScheme};

    /// Encrypts without authenticating the server. Handshake signatures are still checked.
    #[derive(Debug)]
    pub struct AcceptAnyServerCert {
        algorithms: WebPkiSupportedAlgorithms,
    }

    impl AcceptAnyServerCert {
        pub fn new() -> Self {
            AcceptAnyServerCert {
                algorithms: rustls::crypto::ring::default_provider().signature_verification_algorithms,
            }
        }
    }

    impl ServerCertVerifier for AcceptAnyServerCert {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, Error> {
            verify_tls12_signature(message, cert, dss, &self.algorithms)
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, Error> {
            verify_tls13_signature(message, cert, dss, &self.algorithms)
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            self.algorithms.supported_schemes()
        }
    }
}
