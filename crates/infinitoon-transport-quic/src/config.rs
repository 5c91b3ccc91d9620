//! QUIC transport configuration

use infinitoon_transport::{
    TransportConfig, TransportError, TransportResult, TransportSecurityConfig,
};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Default keep-alive period for tunnel endpoints
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(10 * 60);

/// Default idle timeout
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Certificate and key a relay presents in the handshake
#[derive(Clone)]
enum Identity {
    PemFiles { cert: PathBuf, key: PathBuf },
    Der { cert: Vec<u8>, pkcs8_key: Vec<u8> },
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identity::PemFiles { cert, key } => f
                .debug_struct("PemFiles")
                .field("cert", cert)
                .field("key", key)
                .finish(),
            Identity::Der { cert, .. } => f
                .debug_struct("Der")
                .field("cert_len", &cert.len())
                .finish_non_exhaustive(),
        }
    }
}

impl Identity {
    fn load(
        &self,
    ) -> TransportResult<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
        match self {
            Identity::PemFiles { cert, key } => {
                let chain = rustls_pemfile::certs(&mut open_pem(cert)?)
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|e| {
                        TransportError::TlsError(format!("Failed to parse {:?}: {}", cert, e))
                    })?;
                if chain.is_empty() {
                    return Err(TransportError::TlsError(format!(
                        "No certificate found in {:?}",
                        cert
                    )));
                }

                let private_key = rustls_pemfile::private_key(&mut open_pem(key)?)
                    .map_err(|e| {
                        TransportError::TlsError(format!("Failed to parse {:?}: {}", key, e))
                    })?
                    .ok_or_else(|| {
                        TransportError::TlsError(format!("No private key found in {:?}", key))
                    })?;

                Ok((chain, private_key))
            }
            Identity::Der { cert, pkcs8_key } => Ok((
                vec![CertificateDer::from(cert.clone())],
                PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(pkcs8_key.clone())),
            )),
        }
    }
}

fn open_pem(path: &Path) -> TransportResult<BufReader<File>> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| TransportError::TlsError(format!("Failed to open {:?}: {}", path, e)))
}

fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// QUIC endpoint settings
///
/// One type serves both sides: relays need an identity, clients a way to
/// verify it. Keep-alive, idle timeout and the stream limit apply to both.
#[derive(Debug, Clone)]
pub struct QuicConfig {
    security: TransportSecurityConfig,
    identity: Option<Identity>,

    /// Requested keep-alive period; see [`QuicConfig::effective_keep_alive`]
    pub keep_alive_interval: Duration,

    /// Connection is dropped after this long without any traffic
    pub max_idle_timeout: Duration,

    /// Bidirectional streams the peer may have open at once
    pub max_concurrent_streams: u64,
}

impl QuicConfig {
    fn base(max_concurrent_streams: u64) -> Self {
        Self {
            security: TransportSecurityConfig::default(),
            identity: None,
            keep_alive_interval: DEFAULT_KEEP_ALIVE,
            max_idle_timeout: DEFAULT_IDLE_TIMEOUT,
            max_concurrent_streams,
        }
    }

    /// Client verifying the relay against the bundled web PKI roots
    pub fn client_default() -> Self {
        Self::base(100)
    }

    /// Client accepting any relay certificate
    ///
    /// **INSECURE**: only for local development against self-signed relays.
    pub fn client_insecure() -> Self {
        Self::client_default().with_insecure_skip_verify()
    }

    /// Relay presenting the PEM certificate chain and key at the given paths
    ///
    /// Fails when either file does not exist. The files are parsed when the
    /// listener is created.
    pub fn server_default(
        cert_path: impl Into<PathBuf>,
        key_path: impl Into<PathBuf>,
    ) -> TransportResult<Self> {
        let cert = cert_path.into();
        let key = key_path.into();

        for path in [&cert, &key] {
            if !path.is_file() {
                return Err(TransportError::ConfigurationError(format!(
                    "TLS file not found: {:?}",
                    path
                )));
            }
        }

        let mut config = Self::base(1000);
        config.identity = Some(Identity::PemFiles { cert, key });
        Ok(config)
    }

    /// Relay presenting a freshly generated self-signed certificate
    ///
    /// The certificate only lives in memory. Clients must skip verification
    /// or trust it explicitly with [`QuicConfig::with_root_certificate`].
    pub fn server_ephemeral() -> TransportResult<Self> {
        let generated = infinitoon_cert::generate_self_signed_cert()
            .map_err(|e| TransportError::TlsError(e.to_string()))?;

        let mut config = Self::base(1000);
        config.identity = Some(Identity::Der {
            cert: generated.cert_der.to_vec(),
            pkcs8_key: generated.key_der.secret_der().to_vec(),
        });
        Ok(config)
    }

    pub fn with_keep_alive(mut self, interval: Duration) -> Self {
        self.keep_alive_interval = interval;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.max_idle_timeout = timeout;
        self
    }

    pub fn with_max_streams(mut self, max: u64) -> Self {
        self.max_concurrent_streams = max;
        self
    }

    /// Accept any server certificate
    pub fn with_insecure_skip_verify(mut self) -> Self {
        self.security.verify_server_cert = false;
        self
    }

    /// Trust `cert_der` instead of the web PKI roots
    pub fn with_root_certificate(mut self, cert_der: Vec<u8>) -> Self {
        self.security.root_certs.push(cert_der);
        self
    }

    pub fn with_alpn_protocols(mut self, protocols: Vec<String>) -> Self {
        self.security.alpn_protocols = protocols;
        self
    }

    /// Keep-alive period put on the wire
    ///
    /// At most half the idle timeout, so an otherwise silent connection
    /// always sees traffic before the timeout fires.
    pub fn effective_keep_alive(&self) -> Duration {
        self.keep_alive_interval.min(self.max_idle_timeout / 2)
    }

    fn transport(&self) -> TransportResult<Arc<quinn::TransportConfig>> {
        let idle = quinn::IdleTimeout::try_from(self.max_idle_timeout).map_err(|_| {
            TransportError::ConfigurationError(format!(
                "Idle timeout out of range: {:?}",
                self.max_idle_timeout
            ))
        })?;
        let streams = quinn::VarInt::from_u64(self.max_concurrent_streams).map_err(|_| {
            TransportError::ConfigurationError(format!(
                "Stream limit out of range: {}",
                self.max_concurrent_streams
            ))
        })?;

        let mut transport = quinn::TransportConfig::default();
        transport
            .keep_alive_interval(Some(self.effective_keep_alive()))
            .max_idle_timeout(Some(idle))
            .max_concurrent_bidi_streams(streams);
        Ok(Arc::new(transport))
    }

    fn alpn(&self) -> Vec<Vec<u8>> {
        self.security
            .alpn_protocols
            .iter()
            .map(|p| p.as_bytes().to_vec())
            .collect()
    }

    fn root_store(&self) -> TransportResult<RootCertStore> {
        if self.security.root_certs.is_empty() {
            return Ok(RootCertStore {
                roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
            });
        }

        let mut roots = RootCertStore::empty();
        for der in &self.security.root_certs {
            roots
                .add(CertificateDer::from(der.clone()))
                .map_err(|e| {
                    TransportError::ConfigurationError(format!("Invalid root certificate: {}", e))
                })?;
        }
        Ok(roots)
    }

    pub(crate) fn build_client_config(&self) -> TransportResult<quinn::ClientConfig> {
        let provider = crypto_provider();
        let builder = rustls::ClientConfig::builder_with_provider(provider.clone())
            .with_protocol_versions(&[&rustls::version::TLS13])
            .map_err(|e| TransportError::TlsError(e.to_string()))?;

        let mut crypto = if self.security.verify_server_cert {
            builder
                .with_root_certificates(self.root_store()?)
                .with_no_client_auth()
        } else {
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert(provider)))
                .with_no_client_auth()
        };
        crypto.alpn_protocols = self.alpn();

        let crypto = quinn::crypto::rustls::QuicClientConfig::try_from(crypto)
            .map_err(|e| TransportError::TlsError(e.to_string()))?;

        let mut client = quinn::ClientConfig::new(Arc::new(crypto));
        client.transport_config(self.transport()?);
        Ok(client)
    }

    pub(crate) fn build_server_config(&self) -> TransportResult<quinn::ServerConfig> {
        let identity = self.identity.as_ref().ok_or_else(|| {
            TransportError::ConfigurationError("Relay requires a certificate and key".to_string())
        })?;
        let (chain, key) = identity.load()?;

        let mut crypto = rustls::ServerConfig::builder_with_provider(crypto_provider())
            .with_protocol_versions(&[&rustls::version::TLS13])
            .map_err(|e| TransportError::TlsError(e.to_string()))?
            .with_no_client_auth()
            .with_single_cert(chain, key)
            .map_err(|e| TransportError::TlsError(format!("Certificate rejected: {}", e)))?;
        crypto.alpn_protocols = self.alpn();

        let crypto = quinn::crypto::rustls::QuicServerConfig::try_from(crypto)
            .map_err(|e| TransportError::TlsError(e.to_string()))?;

        let mut server = quinn::ServerConfig::with_crypto(Arc::new(crypto));
        server.transport_config(self.transport()?);
        Ok(server)
    }
}

impl TransportConfig for QuicConfig {
    fn security_config(&self) -> &TransportSecurityConfig {
        &self.security
    }

    fn validate(&self) -> TransportResult<()> {
        if self.max_idle_timeout.is_zero() {
            return Err(TransportError::ConfigurationError(
                "Idle timeout must be > 0".to_string(),
            ));
        }
        if self.effective_keep_alive().is_zero() {
            return Err(TransportError::ConfigurationError(
                "Keep-alive interval must be > 0".to_string(),
            ));
        }
        if self.max_concurrent_streams == 0 {
            return Err(TransportError::ConfigurationError(
                "Stream limit must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Skips certificate checks but still verifies handshake signatures
#[derive(Debug)]
struct AcceptAnyServerCert(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_defaults() {
        let config = QuicConfig::client_default();
        assert_eq!(config.keep_alive_interval, Duration::from_secs(600));
        assert_eq!(config.max_idle_timeout, Duration::from_secs(30));
        assert_eq!(config.max_concurrent_streams, 100);
        assert!(config.security_config().verify_server_cert);
        assert!(!QuicConfig::client_insecure().security_config().verify_server_cert);
    }

    #[test]
    fn test_effective_keep_alive_capped_by_idle_timeout() {
        let config = QuicConfig::client_default();
        assert_eq!(config.effective_keep_alive(), Duration::from_secs(15));

        let config = config
            .with_keep_alive(Duration::from_secs(5))
            .with_idle_timeout(Duration::from_secs(60));
        assert_eq!(config.effective_keep_alive(), Duration::from_secs(5));
    }

    #[test]
    fn test_validation() {
        assert!(QuicConfig::client_default().validate().is_ok());

        for config in [
            QuicConfig::client_default().with_keep_alive(Duration::ZERO),
            QuicConfig::client_default().with_idle_timeout(Duration::ZERO),
            QuicConfig::client_default().with_max_streams(0),
        ] {
            assert!(matches!(
                config.validate(),
                Err(TransportError::ConfigurationError(_))
            ));
        }
    }

    #[test]
    fn test_server_requires_identity() {
        assert!(matches!(
            QuicConfig::client_default().build_server_config(),
            Err(TransportError::ConfigurationError(_))
        ));
    }

    #[test]
    fn test_server_default_checks_files() {
        let missing = std::env::temp_dir().join("infinitoon-missing.pem");
        assert!(matches!(
            QuicConfig::server_default(&missing, &missing),
            Err(TransportError::ConfigurationError(_))
        ));
    }

    #[test]
    fn test_ephemeral_server_and_clients_build() {
        let server = QuicConfig::server_ephemeral().unwrap();
        assert_eq!(server.max_concurrent_streams, 1000);
        server.build_server_config().unwrap();

        QuicConfig::client_default().build_client_config().unwrap();
        QuicConfig::client_insecure().build_client_config().unwrap();
    }

    #[test]
    fn test_pem_identity_from_disk() {
        let generated = infinitoon_cert::generate_self_signed_cert().unwrap();
        let dir = std::env::temp_dir();
        let id = uuid::Uuid::new_v4();
        let cert = dir.join(format!("infinitoon-quic-{}.crt", id));
        let key = dir.join(format!("infinitoon-quic-{}.key", id));
        generated.save_to_files(&cert, &key).unwrap();

        let config = QuicConfig::server_default(&cert, &key).unwrap();
        let result = config.build_server_config();

        std::fs::remove_file(&cert).unwrap();
        std::fs::remove_file(&key).unwrap();
        result.unwrap();
    }

    #[test]
    fn test_invalid_root_certificate() {
        let config = QuicConfig::client_default().with_root_certificate(b"not der".to_vec());
        assert!(matches!(
            config.build_client_config(),
            Err(TransportError::ConfigurationError(_))
        ));
    }
}
