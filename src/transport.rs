//! Transport modes and stream abstraction
//!
//! Three transports share one read/write surface:
//! - **Plaintext**: direct TCP
//! - **TLS**: TLS over TCP; the client logs the peer certificate and
//!   accepts it (deployments use self-signed listener certificates)
//! - **RA-TLS**: TLS whose listener certificate embeds an enclave quote;
//!   the client hands every peer certificate to the attestation provider
//!   and the handshake fails on a quote or measurement mismatch
//!
//! Establishment is strictly ordered: TCP connect, then (for the secure
//! modes) the TLS handshake, and only then is the connection handed to the
//! message handler.

use crate::attestation::AttestationProvider;
use crate::config::Settings;
use crate::error::{Error, Result};
use clap::ValueEnum;
use sha2::{Digest, Sha256};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use tokio_rustls::rustls::server::{ClientHello, ResolvesServerCert};
use tokio_rustls::rustls::sign::{CertifiedKey, Signer, SigningKey};
use tokio_rustls::rustls::{
    self, ClientConfig, DigitallySignedStruct, ServerConfig, SignatureAlgorithm, SignatureScheme,
};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, info};

/// Transport flavor of a handler, fixed for its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TransportMode {
    #[value(name = "plain")]
    Plaintext,
    Tls,
    Ratls,
}

impl std::str::FromStr for TransportMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "plain" => Ok(Self::Plaintext),
            "tls" => Ok(Self::Tls),
            "ratls" => Ok(Self::Ratls),
            other => Err(format!("unknown mode: {} (plain|tls|ratls)", other)),
        }
    }
}

impl std::fmt::Display for TransportMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Plaintext => "plain",
            Self::Tls => "tls",
            Self::Ratls => "ratls",
        })
    }
}

/// A connected stream in any transport mode.
#[derive(Debug)]
pub enum Transport {
    Plain(TcpStream),
    Secure(Box<tokio_rustls::TlsStream<TcpStream>>),
}

impl AsyncRead for Transport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Transport::Secure(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Transport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Transport::Secure(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_flush(cx),
            Transport::Secure(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Transport::Secure(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Client-side verifier for plain TLS: log the certificate, then accept.
#[derive(Debug)]
struct LogOnlyVerifier;

impl ServerCertVerifier for LogOnlyVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        info!(
            server = ?server_name,
            fingerprint = %hex::encode(Sha256::digest(end_entity.as_ref())),
            "Verifying peer certificate"
        );
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Client-side verifier for RA-TLS: every certificate in the peer chain is
/// handed to the attestation provider in DER form.
struct RatlsVerifier {
    provider: Arc<dyn AttestationProvider>,
}

impl std::fmt::Debug for RatlsVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RatlsVerifier")
    }
}

impl ServerCertVerifier for RatlsVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        let started = Instant::now();

        for cert in std::iter::once(end_entity).chain(intermediates.iter()) {
            info!(
                server = ?server_name,
                fingerprint = %hex::encode(Sha256::digest(cert.as_ref())),
                "Verifying peer certificate quote"
            );
            self.provider
                .verify_peer(cert.as_ref())
                .map_err(|e| rustls::Error::General(e.to_string()))?;
        }

        debug!(
            elapsed_us = started.elapsed().as_micros() as u64,
            "RA-TLS verification passed"
        );
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Dials the coordinator in the configured mode.
pub struct Connector {
    mode: TransportMode,
    tls: Option<TlsConnector>,
}

impl Connector {
    /// Builds a connector. `provider` is required for RA-TLS and ignored
    /// otherwise.
    pub fn new(
        mode: TransportMode,
        provider: Option<Arc<dyn AttestationProvider>>,
    ) -> Result<Self> {
        let tls = match mode {
            TransportMode::Plaintext => None,
            TransportMode::Tls => {
                let config = ClientConfig::builder()
                    .dangerous()
                    .with_custom_certificate_verifier(Arc::new(LogOnlyVerifier))
                    .with_no_client_auth();
                Some(TlsConnector::from(Arc::new(config)))
            }
            TransportMode::Ratls => {
                let provider = provider.ok_or_else(|| {
                    Error::Init("RA-TLS mode requires an attestation provider".into())
                })?;
                let config = ClientConfig::builder()
                    .dangerous()
                    .with_custom_certificate_verifier(Arc::new(RatlsVerifier { provider }))
                    .with_no_client_auth();
                Some(TlsConnector::from(Arc::new(config)))
            }
        };
        Ok(Self { mode, tls })
    }

    pub fn mode(&self) -> TransportMode {
        self.mode
    }

    /// TCP connect, then handshake for the secure modes.
    pub async fn connect(&self, host: &str, port: u16) -> Result<Transport> {
        let stream = TcpStream::connect((host, port))
            .await
            .map_err(|e| Error::Transport(format!("connect {}:{}: {}", host, port, e)))?;
        debug!(host, port, mode = %self.mode, "Connected");

        let Some(tls) = &self.tls else {
            return Ok(Transport::Plain(stream));
        };

        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| Error::Transport(format!("invalid server name {}: {}", host, e)))?;

        let started = Instant::now();
        let tls_stream = tls
            .connect(server_name, stream)
            .await
            .map_err(|e| Error::Transport(format!("TLS handshake with {}: {}", host, e)))?;
        debug!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Handshake complete"
        );

        Ok(Transport::Secure(Box::new(tokio_rustls::TlsStream::Client(
            tls_stream,
        ))))
    }
}

/// Accepts worker connections in the configured mode.
pub struct Acceptor {
    mode: TransportMode,
    tls: Option<TlsAcceptor>,
}

impl Acceptor {
    /// Builds an acceptor. TLS mode reads the PEM credentials named in
    /// config; RA-TLS asks the attestation provider for fresh
    /// quote-embedding credentials.
    pub fn new(
        mode: TransportMode,
        settings: &Settings,
        provider: Option<Arc<dyn AttestationProvider>>,
    ) -> Result<Self> {
        let tls = match mode {
            TransportMode::Plaintext => None,
            TransportMode::Tls => Some(TlsAcceptor::from(Arc::new(pem_server_config(
                settings,
            )?))),
            TransportMode::Ratls => {
                let provider = provider.ok_or_else(|| {
                    Error::Init("RA-TLS mode requires an attestation provider".into())
                })?;
                Some(TlsAcceptor::from(Arc::new(ratls_server_config(
                    provider.as_ref(),
                )?)))
            }
        };
        Ok(Self { mode, tls })
    }

    pub fn mode(&self) -> TransportMode {
        self.mode
    }

    /// Handshakes an accepted socket into a [`Transport`].
    pub async fn accept(&self, stream: TcpStream) -> Result<Transport> {
        let Some(tls) = &self.tls else {
            return Ok(Transport::Plain(stream));
        };

        let started = Instant::now();
        let tls_stream = tls
            .accept(stream)
            .await
            .map_err(|e| Error::Transport(format!("TLS accept: {}", e)))?;
        debug!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Handshake complete"
        );

        Ok(Transport::Secure(Box::new(tokio_rustls::TlsStream::Server(
            tls_stream,
        ))))
    }
}

/// Server config for plain TLS mode: PEM chain and key from disk.
fn pem_server_config(settings: &Settings) -> Result<ServerConfig> {
    let cert_path = settings
        .tls_cert_path
        .as_ref()
        .ok_or_else(|| Error::Init("tls.cert_path is not configured".into()))?;
    let key_path = settings
        .tls_key_path
        .as_ref()
        .ok_or_else(|| Error::Init("tls.key_path is not configured".into()))?;

    let cert_pem = std::fs::read(cert_path)
        .map_err(|e| Error::Init(format!("cannot read {}: {}", cert_path.display(), e)))?;
    let key_pem = std::fs::read(key_path)
        .map_err(|e| Error::Init(format!("cannot read {}: {}", key_path.display(), e)))?;

    let certs = rustls_pemfile::certs(&mut cert_pem.as_slice())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Init(format!("bad certificate chain: {}", e)))?;
    let key = rustls_pemfile::private_key(&mut key_pem.as_slice())
        .map_err(|e| Error::Init(format!("bad private key: {}", e)))?
        .ok_or_else(|| Error::Init("no private key found in key file".into()))?;

    ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| Error::Init(format!("TLS server config: {}", e)))
}

/// Signature schemes the RA-TLS listener will negotiate.
const RATLS_SIGNATURE_SCHEMES: [SignatureScheme; 2] = [
    SignatureScheme::ECDSA_NISTP256_SHA256,
    SignatureScheme::RSA_PKCS1_SHA256,
];

/// Filters a client's offered signature schemes down to the RA-TLS
/// allow list.
fn restrict_signature_schemes(offered: &[SignatureScheme]) -> Vec<SignatureScheme> {
    offered
        .iter()
        .copied()
        .filter(|scheme| RATLS_SIGNATURE_SCHEMES.contains(scheme))
        .collect()
}

/// Signing key that only signs with the RA-TLS signature schemes.
#[derive(Debug)]
struct RestrictedSigningKey {
    inner: Arc<dyn SigningKey>,
}

impl SigningKey for RestrictedSigningKey {
    fn choose_scheme(&self, offered: &[SignatureScheme]) -> Option<Box<dyn Signer>> {
        self.inner
            .choose_scheme(&restrict_signature_schemes(offered))
    }

    fn algorithm(&self) -> SignatureAlgorithm {
        self.inner.algorithm()
    }
}

/// Always serves the quote-embedding certificate.
#[derive(Debug)]
struct RatlsCertResolver {
    certified: Arc<CertifiedKey>,
}

impl ResolvesServerCert for RatlsCertResolver {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(self.certified.clone())
    }
}

/// Server config for RA-TLS: fresh quote-embedding credentials, key
/// exchange restricted to X25519, signatures restricted to
/// ECDSA-P256-SHA256 / RSA-PKCS1-SHA256, no session tickets.
fn ratls_server_config(provider: &dyn AttestationProvider) -> Result<ServerConfig> {
    let credentials = provider.server_credentials()?;

    let cert = CertificateDer::from(credentials.cert_der);
    let key = PrivateKeyDer::try_from(credentials.key_der.as_slice())
        .map_err(|e| Error::Init(format!("attestation key not usable: {}", e)))?
        .clone_key();
    let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)
        .map_err(|e| Error::Init(format!("attestation key not usable: {}", e)))?;
    let certified = Arc::new(CertifiedKey::new(
        vec![cert],
        Arc::new(RestrictedSigningKey { inner: signing_key }),
    ));

    let mut crypto = rustls::crypto::ring::default_provider();
    crypto.kx_groups = vec![rustls::crypto::ring::kx_group::X25519];

    let mut config = ServerConfig::builder_with_provider(Arc::new(crypto))
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::Init(format!("TLS protocol versions: {}", e)))?
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(RatlsCertResolver { certified }));
    config.send_tls13_tickets = 0;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attestation::{Measurements, ServerCredentials};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    const QUOTE_MARKER: &[u8] = b"TESTQUOTE:";

    /// Test provider whose certificates carry the quote measurements in a
    /// custom X.509 extension, found again by scanning the DER bytes.
    struct StubAttestation {
        expected: Measurements,
        quote: Measurements,
    }

    impl StubAttestation {
        fn new(expected: Measurements, quote: Measurements) -> Self {
            Self { expected, quote }
        }
    }

    impl AttestationProvider for StubAttestation {
        fn server_credentials(&self) -> crate::error::Result<ServerCredentials> {
            let mut quote = QUOTE_MARKER.to_vec();
            quote.extend_from_slice(&self.quote.mrenclave);
            quote.extend_from_slice(&self.quote.mrsigner);

            let key_pair = rcgen::KeyPair::generate().expect("key pair");
            let mut params = rcgen::CertificateParams::new(vec!["coordinator".to_string()])
                .expect("params");
            params
                .custom_extensions
                .push(rcgen::CustomExtension::from_oid_content(
                    &[1, 3, 6, 1, 4, 1, 99999, 1, 1],
                    quote,
                ));
            let cert = params.self_signed(&key_pair).expect("cert");

            Ok(ServerCredentials {
                cert_der: cert.der().to_vec(),
                key_der: key_pair.serialize_der(),
            })
        }

        fn verify_peer(&self, cert_der: &[u8]) -> crate::error::Result<()> {
            let pos = cert_der
                .windows(QUOTE_MARKER.len())
                .position(|w| w == QUOTE_MARKER)
                .ok_or_else(|| Error::Attestation("no quote in certificate".into()))?;
            let quote = &cert_der[pos + QUOTE_MARKER.len()..pos + QUOTE_MARKER.len() + 64];

            if !self.expected.matches(&quote[..32], &quote[32..]) {
                return Err(Error::Attestation("measurement mismatch".into()));
            }
            Ok(())
        }
    }

    fn measurements(fill: u8) -> Measurements {
        Measurements {
            mrenclave: [fill; 32],
            mrsigner: [fill; 32],
        }
    }

    fn test_settings() -> Settings {
        Settings {
            app_home: std::path::PathBuf::from("/tmp"),
            num_threads: 2,
            coordinator_host: "127.0.0.1".to_string(),
            worker_manager_port: 0,
            enable_ratls: false,
            mrenclave: None,
            mrsigner: None,
            tls_cert_path: None,
            tls_key_path: None,
            storage_engine: "filesystem".to_string(),
            ledgebase_base_path: None,
            ledgebase_storage_path: None,
            scheduler_slots: 2,
            scheduler_compat_check: true,
        }
    }

    async fn spawn_ratls_listener(
        quote: Measurements,
    ) -> (std::net::SocketAddr, tokio::task::JoinHandle<()>) {
        let provider: Arc<dyn AttestationProvider> =
            Arc::new(StubAttestation::new(measurements(0), quote));
        let acceptor =
            Acceptor::new(TransportMode::Ratls, &test_settings(), Some(provider)).expect("acceptor");

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");

        let handle = tokio::spawn(async move {
            // Keep accepting so a rejected handshake does not stop the
            // listener.
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    return;
                };
                match acceptor.accept(socket).await {
                    Ok(mut transport) => {
                        let mut buf = [0u8; 4];
                        if transport.read_exact(&mut buf).await.is_ok() {
                            let _ = transport.write_all(&buf).await;
                        }
                    }
                    Err(_) => continue,
                }
            }
        });

        (addr, handle)
    }

    #[tokio::test]
    async fn test_plaintext_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let acceptor = Acceptor::new(TransportMode::Plaintext, &test_settings(), None)
            .expect("acceptor");

        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.expect("accept");
            let mut transport = acceptor.accept(socket).await.expect("handshake");
            let mut buf = [0u8; 4];
            transport.read_exact(&mut buf).await.expect("read");
            transport.write_all(&buf).await.expect("write");
        });

        let connector = Connector::new(TransportMode::Plaintext, None).expect("connector");
        let mut transport = connector
            .connect("127.0.0.1", addr.port())
            .await
            .expect("connect");
        transport.write_all(b"ping").await.expect("write");
        let mut buf = [0u8; 4];
        transport.read_exact(&mut buf).await.expect("read");
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn test_ratls_handshake_succeeds_on_matching_measurements() {
        let (addr, handle) = spawn_ratls_listener(measurements(0x2a)).await;

        let provider: Arc<dyn AttestationProvider> =
            Arc::new(StubAttestation::new(measurements(0x2a), measurements(0)));
        let connector = Connector::new(TransportMode::Ratls, Some(provider)).expect("connector");

        let mut transport = connector
            .connect("127.0.0.1", addr.port())
            .await
            .expect("handshake should pass");
        transport.write_all(b"pong").await.expect("write");
        let mut buf = [0u8; 4];
        transport.read_exact(&mut buf).await.expect("read");
        assert_eq!(&buf, b"pong");

        handle.abort();
    }

    #[tokio::test]
    async fn test_ratls_handshake_fails_on_measurement_mismatch() {
        // Listener quote says 0x02..., client expects 0x01...
        let (addr, handle) = spawn_ratls_listener(measurements(0x02)).await;

        let provider: Arc<dyn AttestationProvider> =
            Arc::new(StubAttestation::new(measurements(0x01), measurements(0)));
        let connector = Connector::new(TransportMode::Ratls, Some(provider)).expect("connector");

        let err = connector
            .connect("127.0.0.1", addr.port())
            .await
            .expect_err("handshake must fail");
        assert!(matches!(err, Error::Transport(_)));
        assert!(err.to_string().contains("mismatch"), "{}", err);

        // The listener survives the rejected peer: a matching client can
        // still connect.
        let good: Arc<dyn AttestationProvider> =
            Arc::new(StubAttestation::new(measurements(0x02), measurements(0)));
        let connector = Connector::new(TransportMode::Ratls, Some(good)).expect("connector");
        connector
            .connect("127.0.0.1", addr.port())
            .await
            .expect("listener should still accept");

        handle.abort();
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!("plain".parse::<TransportMode>().unwrap(), TransportMode::Plaintext);
        assert_eq!("TLS".parse::<TransportMode>().unwrap(), TransportMode::Tls);
        assert_eq!("ratls".parse::<TransportMode>().unwrap(), TransportMode::Ratls);
        assert!("quic".parse::<TransportMode>().is_err());
    }

    #[test]
    fn test_signature_scheme_restriction() {
        let offered = [
            SignatureScheme::ED25519,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::RSA_PKCS1_SHA256,
        ];
        assert_eq!(
            restrict_signature_schemes(&offered),
            vec![
                SignatureScheme::ECDSA_NISTP256_SHA256,
                SignatureScheme::RSA_PKCS1_SHA256,
            ]
        );
        assert!(restrict_signature_schemes(&[SignatureScheme::ED25519]).is_empty());
    }
}
