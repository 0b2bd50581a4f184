//! Validation of certificate/key pairs taken from TLS Secrets.
//!
//! An unparseable pair would be rejected by the device and break the whole
//! listener, so it is refused before a profile is generated. A certificate
//! that does not name the VirtualServer host is still accepted.

use crds::host_matches;
use thiserror::Error;
use tracing::debug;
use x509_parser::extensions::GeneralName;

/// Why a TLS Secret cannot be used
#[derive(Error, Debug)]
pub enum CertificateError {
    #[error("tls.crt is not PEM: {0}")]
    CertPem(#[source] pem::PemError),

    #[error("tls.key is not PEM: {0}")]
    KeyPem(#[source] pem::PemError),

    #[error("unexpected PEM block {found}, expected {expected}")]
    Tag { found: String, expected: &'static str },

    #[error("tls.crt is not an X.509 certificate: {0}")]
    X509(String),
}

/// DNS names a certificate is valid for: SAN entries, else the common name
fn certificate_names(cert: &x509_parser::certificate::X509Certificate<'_>) -> Vec<String> {
    let mut names: Vec<String> = match cert.subject_alternative_name() {
        Ok(Some(san)) => san
            .value
            .general_names
            .iter()
            .filter_map(|name| match name {
                GeneralName::DNSName(dns) => Some((*dns).to_string()),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    };
    if names.is_empty() {
        names.extend(
            cert.subject()
                .iter_common_name()
                .filter_map(|cn| cn.as_str().ok())
                .map(str::to_string),
        );
    }
    names
}

/// Check that `cert_pem` holds a certificate and `key_pem` a private key.
/// A host mismatch is only logged.
pub fn check_certificate(cert_pem: &str, key_pem: &str, host: &str) -> Result<(), CertificateError> {
    let cert_block = pem::parse(cert_pem).map_err(CertificateError::CertPem)?;
    if cert_block.tag() != "CERTIFICATE" {
        return Err(CertificateError::Tag {
            found: cert_block.tag().to_string(),
            expected: "CERTIFICATE",
        });
    }
    let key_block = pem::parse(key_pem).map_err(CertificateError::KeyPem)?;
    if !key_block.tag().ends_with("PRIVATE KEY") {
        return Err(CertificateError::Tag {
            found: key_block.tag().to_string(),
            expected: "PRIVATE KEY",
        });
    }

    let (_, cert) = x509_parser::parse_x509_certificate(cert_block.contents())
        .map_err(|e| CertificateError::X509(e.to_string()))?;
    if !host.is_empty() {
        let names = certificate_names(&cert);
        if !names.iter().any(|name| host_matches(name, host)) {
            debug!(host = %host, names = ?names, "Certificate does not name the host");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::self_signed;

    #[test]
    fn test_valid_pair_is_accepted() {
        let (cert, key) = self_signed(&["*.example.com"]);
        assert!(check_certificate(&cert, &key, "shop.example.com").is_ok());
        // a host the certificate does not name is tolerated
        assert!(check_certificate(&cert, &key, "other.org").is_ok());
    }

    #[test]
    fn test_truncated_certificate_is_rejected() {
        let (_, key) = self_signed(&["shop.example.com"]);
        let err = check_certificate("-----BEGIN CERTIFICATE-----", &key, "shop.example.com").unwrap_err();
        assert!(matches!(err, CertificateError::CertPem(_)));
    }

    #[test]
    fn test_swapped_pair_is_rejected() {
        let (cert, key) = self_signed(&["shop.example.com"]);
        let err = check_certificate(&key, &cert, "shop.example.com").unwrap_err();
        assert!(matches!(err, CertificateError::Tag { .. }));
    }

    #[test]
    fn test_garbage_der_is_rejected() {
        let (_, key) = self_signed(&["shop.example.com"]);
        let bogus = pem::encode(&pem::Pem::new("CERTIFICATE", vec![1, 2, 3, 4]));
        let err = check_certificate(&bogus, &key, "").unwrap_err();
        assert!(matches!(err, CertificateError::X509(_)));
    }
}
