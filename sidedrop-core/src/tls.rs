use anyhow::{Context, Result};

/// TLS server name used by transports that pin a per-offer certificate.
/// The certificate travels inside the offer, so the name only has to be
/// consistent between the two sides, not resolvable.
pub const TLS_SERVER_NAME: &str = "sidedrop.local";

/// Raw DER-encoded certificate and private key material.
///
/// Produced by [`generate_self_signed_cert`] and consumed by transport
/// implementations to build their TLS configs. The certificate half also
/// rides inside the offer description so the answering side can pin it.
pub struct CertKeyPair {
    pub cert_der: Vec<u8>,
    pub private_key_pkcs8_der: Vec<u8>,
}

/// Generates a self-signed certificate for [`TLS_SERVER_NAME`].
///
/// The returned DER bytes are transport-agnostic — callers wrap them in
/// whatever TLS library their transport requires (e.g. `rustls` for QUIC).
///
/// # Errors
///
/// Returns an error if certificate generation fails.
pub fn generate_self_signed_cert() -> Result<CertKeyPair> {
    let certified_key = rcgen::generate_simple_self_signed(vec![TLS_SERVER_NAME.to_string()])
        .context("failed to generate self-signed certificate")?;

    Ok(CertKeyPair {
        cert_der: certified_key.cert.der().to_vec(),
        private_key_pkcs8_der: certified_key.key_pair.serialize_der(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn given_generated_cert_when_inspected_then_der_is_non_empty() {
        let pair = generate_self_signed_cert().unwrap();
        assert!(!pair.cert_der.is_empty());
        assert!(!pair.private_key_pkcs8_der.is_empty());
    }

    #[test]
    fn given_two_generated_certs_when_compared_then_distinct() {
        let a = generate_self_signed_cert().unwrap();
        let b = generate_self_signed_cert().unwrap();
        assert_ne!(a.cert_der, b.cert_der, "each offer gets its own identity");
    }
}
