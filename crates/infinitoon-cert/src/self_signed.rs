//! Self-signed certificate generation for development and testing

use rcgen::{CertificateParams, DistinguishedName, DnType, Ia5String, SanType};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::Path;
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tracing::debug;

/// Validity window of generated certificates
const VALIDITY: Duration = Duration::from_secs(90 * 24 * 60 * 60);

#[derive(Error, Debug)]
pub enum SelfSignedError {
    #[error("Certificate generation failed: {0}")]
    GenerationFailed(String),

    #[error("Key generation failed: {0}")]
    KeyGenerationFailed(String),

    #[error("Invalid domain name: {0}")]
    InvalidDomain(String),
}

/// Generate a self-signed certificate for `localhost`
///
/// The certificate covers `localhost`, `*.localhost`, `127.0.0.1` and `::1`,
/// is valid for 90 days and carries a random serial number.
/// **DO NOT use in production.**
///
/// # Example
/// ```no_run
/// use infinitoon_cert::generate_self_signed_cert;
///
/// let cert = generate_self_signed_cert().unwrap();
/// cert.save_to_files("relay.crt", "relay.key").unwrap();
/// ```
pub fn generate_self_signed_cert() -> Result<SelfSignedCertificate, SelfSignedError> {
    generate_self_signed_cert_with_domains(&["localhost", "*.localhost"])
}

/// Generate a self-signed certificate for the given DNS names
///
/// Loopback addresses are always included as IP SANs.
pub fn generate_self_signed_cert_with_domains(
    domains: &[&str],
) -> Result<SelfSignedCertificate, SelfSignedError> {
    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "Infinitoon Development Certificate");
    dn.push(DnType::OrganizationName, "Infinitoon Dev");
    params.distinguished_name = dn;

    let mut sans = Vec::with_capacity(domains.len() + 2);
    for domain in domains {
        let name = Ia5String::try_from(*domain)
            .map_err(|_| SelfSignedError::InvalidDomain(domain.to_string()))?;
        sans.push(SanType::DnsName(name));
    }
    sans.push(SanType::IpAddress(IpAddr::V4(Ipv4Addr::LOCALHOST)));
    sans.push(SanType::IpAddress(IpAddr::V6(Ipv6Addr::LOCALHOST)));
    params.subject_alt_names = sans;

    let now = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map_err(|e| SelfSignedError::GenerationFailed(e.to_string()))?;
    params.not_before = to_offset(now)?;
    params.not_after = to_offset(now + VALIDITY)?;

    params.serial_number = Some(rcgen::SerialNumber::from(rand::random::<u64>()));

    let key_pair = rcgen::KeyPair::generate()
        .map_err(|e| SelfSignedError::KeyGenerationFailed(e.to_string()))?;

    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| SelfSignedError::GenerationFailed(e.to_string()))?;

    debug!("Generated self-signed certificate for {:?}", domains);

    Ok(SelfSignedCertificate {
        cert_der: CertificateDer::from(cert.der().to_vec()),
        key_der: PrivateKeyDer::try_from(key_pair.serialize_der())
            .map_err(|e| SelfSignedError::KeyGenerationFailed(e.to_string()))?,
        pem_cert: cert.pem(),
        pem_key: key_pair.serialize_pem(),
    })
}

fn to_offset(since_epoch: Duration) -> Result<time::OffsetDateTime, SelfSignedError> {
    time::OffsetDateTime::from_unix_timestamp(since_epoch.as_secs() as i64)
        .map_err(|e| SelfSignedError::GenerationFailed(e.to_string()))
}

/// A self-signed certificate with its private key
pub struct SelfSignedCertificate {
    /// Certificate in DER format (binary)
    pub cert_der: CertificateDer<'static>,

    /// Private key in DER format (binary)
    pub key_der: PrivateKeyDer<'static>,

    /// Certificate in PEM format (text)
    pub pem_cert: String,

    /// Private key in PEM format (text)
    pub pem_key: String,
}

impl std::fmt::Debug for SelfSignedCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelfSignedCertificate")
            .field("cert_len", &self.cert_der.len())
            .finish_non_exhaustive()
    }
}

impl SelfSignedCertificate {
    /// Save certificate and key to PEM files
    pub fn save_to_files(
        &self,
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
    ) -> std::io::Result<()> {
        std::fs::write(cert_path, &self.pem_cert)?;
        std::fs::write(key_path, &self.pem_key)?;
        Ok(())
    }
}
