//! Socket acquisition.
//!
//! Produces the boxed byte stream a [`Client`](crate::Client) drives:
//! plain TCP, a named local socket, or TLS over either. The connector is
//! built once per client; only the SNI name varies per attempt, because a
//! request may override the servername mid-queue.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio_rustls::rustls;
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName};
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::error::{Error, Result};
use crate::origin::Origin;
use crate::upgrade::Io;

pub(crate) type BoxIo = Box<dyn Io + Send>;

/// TLS settings for an `https` origin.
#[derive(Clone, Debug, Default)]
pub struct TlsOptions {
    extra_roots: Vec<CertificateDer<'static>>,
    servername: Option<String>,
    accept_invalid_certs: bool,
}

impl TlsOptions {
    /// TLS with the bundled webpki roots and full verification.
    pub fn new() -> TlsOptions {
        TlsOptions::default()
    }

    /// Trust an additional DER-encoded root certificate.
    pub fn add_root_certificate(mut self, cert: CertificateDer<'static>) -> TlsOptions {
        self.extra_roots.push(cert);
        self
    }

    /// Use this SNI name instead of the origin host.
    pub fn servername(mut self, servername: impl Into<String>) -> TlsOptions {
        self.servername = Some(servername.into());
        self
    }

    /// Disable certificate verification.
    ///
    /// # Warning
    ///
    /// Anyone on the network path can impersonate the server. Only for
    /// test rigs.
    pub fn danger_accept_invalid_certs(mut self, accept: bool) -> TlsOptions {
        self.accept_invalid_certs = accept;
        self
    }

    pub(crate) fn default_servername(&self) -> Option<&str> {
        self.servername.as_deref()
    }

    fn into_config(self) -> rustls::ClientConfig {
        if self.accept_invalid_certs {
            return rustls::ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoVerifier::new()))
                .with_no_client_auth();
        }
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        for cert in self.extra_roots {
            // An unparsable caller-provided root is a configuration bug,
            // surfaced on first connect instead of here.
            let _ = roots.add(cert);
        }
        rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth()
    }
}

/// Acquires sockets for one origin.
pub(crate) struct Connector {
    timeout: Duration,
    socket_path: Option<PathBuf>,
    tls: Option<TlsConnector>,
}

impl Connector {
    pub(crate) fn new(
        origin: &Origin,
        timeout: Duration,
        socket_path: Option<PathBuf>,
        tls: TlsOptions,
    ) -> Connector {
        let tls = if origin.is_https() {
            Some(TlsConnector::from(Arc::new(tls.into_config())))
        } else {
            None
        };
        Connector {
            timeout,
            socket_path,
            tls,
        }
    }

    /// Open a connection, completing any TLS handshake, within the connect
    /// timeout.
    pub(crate) async fn connect(
        &self,
        origin: &Origin,
        servername: Option<&str>,
    ) -> Result<BoxIo> {
        let fut = self.connect_inner(origin, servername);
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_elapsed) => Err(Error::new_connect_timeout()),
        }
    }

    async fn connect_inner(&self, origin: &Origin, servername: Option<&str>) -> Result<BoxIo> {
        let tcp: BoxIo = match self.socket_path {
            #[cfg(unix)]
            Some(ref path) => {
                let stream = tokio::net::UnixStream::connect(path)
                    .await
                    .map_err(Error::new_socket_io)?;
                debug!(path = %path.display(), "connected unix socket");
                Box::new(stream)
            }
            #[cfg(not(unix))]
            Some(_) => {
                return Err(Error::new_invalid_arg(
                    "socket_path is not supported on this platform",
                ))
            }
            None => {
                let stream = TcpStream::connect((origin.host(), origin.port()))
                    .await
                    .map_err(Error::new_socket_io)?;
                let _ = stream.set_nodelay(true);
                debug!(host = origin.host(), port = origin.port(), "connected");
                Box::new(stream)
            }
        };

        let tls = match self.tls {
            Some(ref tls) => tls,
            None => return Ok(tcp),
        };

        let name = servername.unwrap_or_else(|| origin.host());
        let name = ServerName::try_from(name.to_owned())
            .map_err(|_| Error::new_invalid_arg("invalid servername"))?;
        let stream = tls
            .connect(name, tcp)
            .await
            .map_err(Error::new_socket_io)?;
        Ok(Box::new(stream))
    }
}

/// Whether a connect error was a certificate name mismatch; those fail
/// only the requests pinned to the offending servername.
pub(crate) fn is_cert_altname_error(err: &Error) -> bool {
    matches!(
        err.find_source::<rustls::Error>(),
        Some(rustls::Error::InvalidCertificate(
            rustls::CertificateError::NotValidForName
        ))
    )
}

#[derive(Debug)]
struct NoVerifier {
    schemes: Vec<rustls::SignatureScheme>,
}

impl NoVerifier {
    fn new() -> NoVerifier {
        let provider = rustls::crypto::ring::default_provider();
        NoVerifier {
            schemes: provider
                .signature_verification_algorithms
                .supported_schemes(),
        }
    }
}

impl rustls::client::danger::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.schemes.clone()
    }
}
