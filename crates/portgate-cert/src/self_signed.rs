//! Self-signed fallback certificates
//!
//! Used when no fallback pair is configured, or the configured pair cannot
//! be loaded. Browsers will warn; this only keeps handshakes completing.

use crate::CertError;
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, SerialNumber};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use time::{Duration, OffsetDateTime};

const VALIDITY_DAYS: i64 = 90;

/// A generated certificate with its key, in both DER and PEM form
pub struct SelfSignedCertificate {
    pub cert_der: CertificateDer<'static>,
    pub key_der: PrivateKeyDer<'static>,
    pub pem_cert: String,
    pub pem_key: String,
}

/// Generate a certificate valid for `names` (DNS names, wildcards allowed)
pub fn generate_self_signed_cert(names: &[&str]) -> Result<SelfSignedCertificate, CertError> {
    let subject_alt_names: Vec<String> = names.iter().map(|name| name.to_string()).collect();
    let mut params = CertificateParams::new(subject_alt_names)
        .map_err(|e| CertError::Generation(e.to_string()))?;

    let mut dn = DistinguishedName::new();
    dn.push(
        DnType::CommonName,
        names.first().copied().unwrap_or("portgate"),
    );
    dn.push(DnType::OrganizationName, "Portgate");
    params.distinguished_name = dn;

    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::hours(1);
    params.not_after = now + Duration::days(VALIDITY_DAYS);
    params.serial_number = Some(SerialNumber::from(rand::random::<u64>()));

    let key_pair = KeyPair::generate().map_err(|e| CertError::Generation(e.to_string()))?;
    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| CertError::Generation(e.to_string()))?;

    Ok(SelfSignedCertificate {
        cert_der: cert.der().clone(),
        key_der: PrivateKeyDer::try_from(key_pair.serialize_der())
            .map_err(|e| CertError::Generation(e.to_string()))?,
        pem_cert: cert.pem(),
        pem_key: key_pair.serialize_pem(),
    })
}

/// Fallback names for a base domain: the apex and its wildcard
pub fn fallback_names(base_domain: &str) -> Vec<String> {
    let base = base_domain.trim_end_matches('.');
    if base.is_empty() {
        return vec!["localhost".to_string()];
    }
    vec![base.to_string(), format!("*.{}", base)]
}
