//! Certificate generation and parsing
//!
//! A fresh CA is created for every issuance; the serving certificate is signed
//! by it and both are returned together. There is never a partially rotated
//! chain: callers persist all three outputs or none.
//!
//! # Certificate profile
//!
//! Both certificates share subject and SANs derived from the owning Service:
//!
//! - CN: `<name>.<namespace>.svc`
//! - O: configurable organization
//! - DNS SANs: `name`, `name.namespace`, `name.namespace.svc`,
//!   `name.namespace.svc.cluster.local`
//!
//! The CA additionally carries `CA:TRUE`, keyCertSign and serverAuth/clientAuth.
//! The serving certificate is `CA:FALSE` with digitalSignature and serverAuth.

use rand::rngs::OsRng;
use rand::RngCore;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose, SerialNumber,
};
use rsa::pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey};
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey, LineEnding};
use rsa::traits::PublicKeyParts;
use rsa::RsaPrivateKey;
use thiserror::Error;
use ::time::OffsetDateTime;
use x509_parser::prelude::*;
use x509_parser::public_key::PublicKey;
use zeroize::Zeroizing;

/// RSA modulus size for both the CA and the serving key
pub const RSA_KEY_BITS: usize = 2048;

/// Validity window of newly issued certificates (1 year)
pub const CERT_VALIDITY_DAYS: i64 = 365;

/// Serial numbers are 128 bits of CSPRNG output
const SERIAL_NUMBER_BYTES: usize = 16;

/// PKI errors
#[derive(Debug, Error)]
pub enum PkiError {
    /// RSA key generation failed
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    /// Random source failed while drawing a serial number
    #[error("failed to generate serial number: {0}")]
    SerialNumber(String),

    /// Building or signing a certificate failed
    #[error("certificate generation failed: {0}")]
    CertificateGeneration(String),

    /// Stored PEM, certificate or key could not be parsed
    #[error("certificate parsing error: {0}")]
    Parse(String),

    /// Certificate public key does not belong to the private key
    #[error("certificate public key does not match private key")]
    KeyMismatch,

    /// Signature check against the CA failed
    #[error("certificate not signed by CA: {0}")]
    Untrusted(String),
}

/// Result type for PKI operations
pub type Result<T> = std::result::Result<T, PkiError>;

/// The Service a certificate is issued for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceIdentity {
    /// Service name
    pub name: String,
    /// Service namespace
    pub namespace: String,
}

impl ServiceIdentity {
    /// Create an identity for `name` in `namespace`
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
        }
    }

    /// Subject common name: `<name>.<namespace>.svc`
    pub fn common_name(&self) -> String {
        format!("{}.{}.svc", self.name, self.namespace)
    }

    /// DNS names the serving certificate must be valid for
    pub fn dns_names(&self) -> Vec<String> {
        let service = format!("{}.{}", self.name, self.namespace);
        vec![
            self.name.clone(),
            service.clone(),
            format!("{service}.svc"),
            format!("{service}.svc.cluster.local"),
        ]
    }
}

/// Output of [`generate_certs`]
pub struct GeneratedCerts {
    /// Server private key, PKCS#1 PEM (`RSA PRIVATE KEY`)
    pub server_key_pem: Zeroizing<String>,
    /// Server certificate PEM, signed by the CA
    pub server_cert_pem: String,
    /// Self-signed CA certificate PEM
    pub ca_cert_pem: String,
}

impl std::fmt::Debug for GeneratedCerts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeneratedCerts")
            .field("server_key_pem", &"<redacted>")
            .field("server_cert_pem", &self.server_cert_pem)
            .field("ca_cert_pem", &self.ca_cert_pem)
            .finish()
    }
}

/// Generate a new CA and a serving certificate signed by it.
///
/// Both certificates expire at `not_after`. Every call draws fresh keys and
/// serial numbers, so output is never repeatable.
pub fn generate_certs(
    identity: &ServiceIdentity,
    organization: &str,
    not_after: OffsetDateTime,
) -> Result<GeneratedCerts> {
    // CA first: key, self-signed certificate
    let (_, ca_key) = generate_rsa_key("CA")?;
    let ca_params = ca_params(identity, organization, not_after)?;
    let ca_cert = ca_params.self_signed(&ca_key).map_err(|e| {
        PkiError::CertificateGeneration(format!("failed to self-sign CA cert: {e}"))
    })?;
    let ca_cert_pem = ca_cert.pem();

    // Then the serving key, signed by the CA
    let (server_rsa_key, server_key) = generate_rsa_key("server")?;
    let server_params = server_params(identity, organization, not_after)?;
    let issuer = Issuer::new(ca_params, ca_key);
    let server_cert = server_params.signed_by(&server_key, &issuer).map_err(|e| {
        PkiError::CertificateGeneration(format!("failed to sign server cert: {e}"))
    })?;

    let server_key_pem = server_rsa_key.to_pkcs1_pem(LineEnding::LF).map_err(|e| {
        PkiError::KeyGeneration(format!("failed to encode server key: {e}"))
    })?;

    Ok(GeneratedCerts {
        server_key_pem,
        server_cert_pem: server_cert.pem(),
        ca_cert_pem,
    })
}

/// Generate an RSA key and load it into rcgen for signing
fn generate_rsa_key(role: &str) -> Result<(RsaPrivateKey, KeyPair)> {
    let key = RsaPrivateKey::new(&mut OsRng, RSA_KEY_BITS)
        .map_err(|e| PkiError::KeyGeneration(format!("failed to generate {role} key: {e}")))?;

    // rcgen picks RSA_PKCS1_SHA256 for RSA PKCS#8 input
    let pkcs8 = key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| PkiError::KeyGeneration(format!("failed to encode {role} key: {e}")))?;
    let key_pair = KeyPair::from_pem(&pkcs8)
        .map_err(|e| PkiError::KeyGeneration(format!("failed to load {role} key: {e}")))?;

    Ok((key, key_pair))
}

fn random_serial_number() -> Result<SerialNumber> {
    let mut bytes = [0u8; SERIAL_NUMBER_BYTES];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|e| PkiError::SerialNumber(e.to_string()))?;
    // Keep the DER INTEGER positive and within 20 octets
    bytes[0] &= 0x7f;
    Ok(SerialNumber::from(bytes.to_vec()))
}

/// Parts shared by the CA and the serving certificate
fn base_params(
    identity: &ServiceIdentity,
    organization: &str,
    not_after: OffsetDateTime,
) -> Result<CertificateParams> {
    let mut params = CertificateParams::new(identity.dns_names()).map_err(|e| {
        PkiError::CertificateGeneration(format!("invalid DNS names for {}: {e}", identity.name))
    })?;

    let mut dn = DistinguishedName::new();
    dn.push(
        DnType::CommonName,
        DnValue::Utf8String(identity.common_name()),
    );
    dn.push(
        DnType::OrganizationName,
        DnValue::Utf8String(organization.to_string()),
    );
    params.distinguished_name = dn;

    params.serial_number = Some(random_serial_number()?);
    params.not_before = OffsetDateTime::now_utc();
    params.not_after = not_after;

    Ok(params)
}

fn ca_params(
    identity: &ServiceIdentity,
    organization: &str,
    not_after: OffsetDateTime,
) -> Result<CertificateParams> {
    let mut params = base_params(identity, organization, not_after)?;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ServerAuth,
        ExtendedKeyUsagePurpose::ClientAuth,
    ];
    Ok(params)
}

fn server_params(
    identity: &ServiceIdentity,
    organization: &str,
    not_after: OffsetDateTime,
) -> Result<CertificateParams> {
    let mut params = base_params(identity, organization, not_after)?;
    params.is_ca = IsCa::ExplicitNoCa;
    params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    Ok(params)
}

/// Parse PEM-encoded data and return the DER bytes of the first block
pub fn parse_pem(pem_data: &[u8]) -> Result<Vec<u8>> {
    let pem_obj = ::pem::parse(pem_data)
        .map_err(|e| PkiError::Parse(format!("failed to parse PEM: {e}")))?;
    Ok(pem_obj.contents().to_vec())
}

/// Validity and subject details of a certificate
#[derive(Debug, Clone)]
pub struct CertificateInfo {
    /// When the certificate becomes valid (Unix timestamp)
    pub not_before: i64,
    /// When the certificate expires (Unix timestamp)
    pub not_after: i64,
    /// Subject common name
    pub common_name: String,
    /// Subject organization, if any
    pub organization: Option<String>,
    /// Whether basicConstraints marks this as a CA
    pub is_ca: bool,
    /// DNS subject alternative names
    pub dns_names: Vec<String>,
    /// Raw serial number bytes
    pub serial: Vec<u8>,
}

impl CertificateInfo {
    /// Parse certificate info from PEM-encoded certificate
    pub fn from_pem(pem_data: &[u8]) -> Result<Self> {
        let der = parse_pem(pem_data)?;
        Self::from_der(&der)
    }

    /// Parse certificate info from DER-encoded certificate
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| PkiError::Parse(format!("failed to parse certificate: {e}")))?;
        Ok(Self::from_x509(&cert))
    }

    fn from_x509(cert: &X509Certificate<'_>) -> Self {
        let common_name = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .unwrap_or("")
            .to_string();

        let organization = cert
            .subject()
            .iter_organization()
            .next()
            .and_then(|o| o.as_str().ok())
            .map(str::to_string);

        let dns_names = cert
            .subject_alternative_name()
            .ok()
            .flatten()
            .map(|san| {
                san.value
                    .general_names
                    .iter()
                    .filter_map(|name| match name {
                        GeneralName::DNSName(dns) => Some(dns.to_string()),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default();

        Self {
            not_before: cert.validity().not_before.timestamp(),
            not_after: cert.validity().not_after.timestamp(),
            common_name,
            organization,
            is_ca: cert.is_ca(),
            dns_names,
            serial: cert.tbs_certificate.raw_serial().to_vec(),
        }
    }

    /// True unless the certificate is still valid strictly after `instant`
    pub fn expires_by(&self, instant: OffsetDateTime) -> bool {
        self.not_after <= instant.unix_timestamp()
    }
}

/// Load a certificate/private-key pair the way a TLS server would.
///
/// The key may be PKCS#1 or PKCS#8. Fails when either half does not parse or
/// when the certificate's public key does not belong to the private key.
pub fn parse_key_pair(cert_pem: &[u8], key_pem: &[u8]) -> Result<CertificateInfo> {
    let key_str = std::str::from_utf8(key_pem)
        .map_err(|e| PkiError::Parse(format!("private key is not valid PEM text: {e}")))?;
    let key = RsaPrivateKey::from_pkcs1_pem(key_str)
        .or_else(|_| RsaPrivateKey::from_pkcs8_pem(key_str))
        .map_err(|e| PkiError::Parse(format!("failed to parse private key: {e}")))?;

    let der = parse_pem(cert_pem)?;
    let (_, cert) = X509Certificate::from_der(&der)
        .map_err(|e| PkiError::Parse(format!("failed to parse certificate: {e}")))?;

    let parsed = cert
        .public_key()
        .parsed()
        .map_err(|e| PkiError::Parse(format!("failed to parse certificate public key: {e}")))?;
    let modulus = match parsed {
        PublicKey::RSA(rsa) => rsa.modulus,
        _ => {
            return Err(PkiError::Parse(
                "certificate public key is not RSA".to_string(),
            ))
        }
    };

    if strip_leading_zeros(modulus) != strip_leading_zeros(&key.n().to_bytes_be()) {
        return Err(PkiError::KeyMismatch);
    }

    Ok(CertificateInfo::from_x509(&cert))
}

/// Verify `cert_pem` carries a valid signature from the CA in `ca_pem`
pub fn verify_issued_by(cert_pem: &[u8], ca_pem: &[u8]) -> Result<()> {
    let cert_der = parse_pem(cert_pem)?;
    let (_, cert) = X509Certificate::from_der(&cert_der)
        .map_err(|e| PkiError::Parse(format!("failed to parse certificate: {e}")))?;

    let ca_der = parse_pem(ca_pem)?;
    let (_, ca_cert) = X509Certificate::from_der(&ca_der)
        .map_err(|e| PkiError::Parse(format!("failed to parse CA cert: {e}")))?;

    if cert.issuer().as_raw() != ca_cert.subject().as_raw() {
        return Err(PkiError::Untrusted(
            "issuer does not match CA subject".to_string(),
        ));
    }

    cert.verify_signature(Some(ca_cert.public_key()))
        .map_err(|e| PkiError::Untrusted(e.to_string()))
}

fn strip_leading_zeros(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    &bytes[start..]
}
