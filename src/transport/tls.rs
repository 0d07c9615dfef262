/*
 * tls.rs
 * Copyright (C) 2026 Yggmail developers
 *
 * This file is part of Yggmail, a peer-to-peer mail server.
 *
 * Yggmail is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Yggmail is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Yggmail.  If not, see <http://www.gnu.org/licenses/>.
 */

//! TLS 1.3 bound to node identity instead of web PKI. Each node carries a
//! self-signed certificate generated at startup from its Ed25519 key. The
//! verifiers here never consult a certificate chain: the dialer pins the
//! expected public key of the node it dialed, the acceptor takes the key
//! out of the client certificate, and both re-check the TLS handshake
//! signature against that raw Ed25519 key. Names prove nothing.

use std::sync::Arc;

use ed25519_dalek::pkcs8::EncodePrivateKey;
use ed25519_dalek::{Signature, VerifyingKey};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{
    CertificateError, ClientConfig, DigitallySignedStruct, DistinguishedName, Error as TlsError,
    ServerConfig, SignatureScheme,
};

use crate::config::Config;
use crate::transport::TransportError;

/// DER pattern of an Ed25519 SubjectPublicKeyInfo up to the key bytes:
/// SEQUENCE(0x2a) { SEQUENCE { OID 1.3.101.112 }, BIT STRING(0x21, 0x00) }.
const ED25519_SPKI_PREFIX: &[u8] = &[
    0x30, 0x2a, 0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x70, 0x03, 0x21, 0x00,
];

/// The local identity material handed to rustls: one self-signed cert and
/// the matching key, in both client and server roles.
pub struct TlsIdentity {
    certificate: CertificateDer<'static>,
    private_key: PrivateKeyDer<'static>,
    server_name: String,
}

impl TlsIdentity {
    /// Build the identity certificate for this node. The certificate's SAN
    /// (and the name dialers put in SNI) is derived from the public key
    /// alone; DNS label limits force the 64 hex digits into two labels.
    pub fn new(config: &Config) -> Result<Self, TransportError> {
        let server_name = server_name_for(&config.public_key_hex());
        let pkcs8 = config
            .signing_key()
            .to_pkcs8_der()
            .map_err(|e| TransportError::new(format!("identity key encoding failed: {}", e)))?;
        let key_der = PrivatePkcs8KeyDer::from(pkcs8.as_bytes().to_vec());
        let key_pair =
            rcgen::KeyPair::from_pkcs8_der_and_sign_algo(&key_der, &rcgen::PKCS_ED25519)
                .map_err(|e| TransportError::new(format!("identity key rejected: {}", e)))?;
        let params = rcgen::CertificateParams::new(vec![server_name.clone()])
            .map_err(|e| TransportError::new(format!("certificate parameters: {}", e)))?;
        let certificate = params
            .self_signed(&key_pair)
            .map_err(|e| TransportError::new(format!("certificate generation failed: {}", e)))?;
        Ok(Self {
            certificate: certificate.der().clone(),
            private_key: PrivateKeyDer::Pkcs8(key_der),
            server_name,
        })
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    /// Client config for dialing `expected`: we present our own certificate
    /// and accept only a server holding the expected key.
    pub fn client_config(&self, expected: VerifyingKey) -> Result<ClientConfig, TransportError> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = ClientConfig::builder_with_provider(provider)
            .with_protocol_versions(&[&rustls::version::TLS13])
            .map_err(|e| TransportError::new(e.to_string()))?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(PinnedServerVerifier { expected }))
            .with_client_auth_cert(
                vec![self.certificate.clone()],
                self.private_key.clone_key(),
            )
            .map_err(|e| TransportError::new(e.to_string()))?;
        Ok(config)
    }

    /// Server config: client certificates are required and verified against
    /// the key they themselves carry; the caller reads that key back out of
    /// the session after the handshake.
    pub fn server_config(&self) -> Result<ServerConfig, TransportError> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = ServerConfig::builder_with_provider(provider)
            .with_protocol_versions(&[&rustls::version::TLS13])
            .map_err(|e| TransportError::new(e.to_string()))?
            .with_client_cert_verifier(Arc::new(IdentityClientVerifier))
            .with_single_cert(
                vec![self.certificate.clone()],
                self.private_key.clone_key(),
            )
            .map_err(|e| TransportError::new(e.to_string()))?;
        Ok(config)
    }
}

/// SNI name for a node: its 64 hex digits split into two DNS labels.
pub fn server_name_for(public_key_hex: &str) -> String {
    if public_key_hex.len() == 64 {
        format!("{}.{}", &public_key_hex[..32], &public_key_hex[32..])
    } else {
        public_key_hex.to_string()
    }
}

/// Parse an SNI string for dialing.
pub fn dial_server_name(public_key_hex: &str) -> Result<ServerName<'static>, TransportError> {
    ServerName::try_from(server_name_for(public_key_hex))
        .map_err(|_| TransportError::new("destination key does not form a valid server name"))
}

/// Pull the raw Ed25519 public key out of a certificate's SPKI.
pub fn certificate_public_key(cert: &CertificateDer<'_>) -> Result<VerifyingKey, TlsError> {
    let der = cert.as_ref();
    let start = der
        .windows(ED25519_SPKI_PREFIX.len())
        .position(|w| w == ED25519_SPKI_PREFIX)
        .ok_or(TlsError::InvalidCertificate(CertificateError::BadEncoding))?
        + ED25519_SPKI_PREFIX.len();
    let key: [u8; 32] = der
        .get(start..start + 32)
        .and_then(|s| s.try_into().ok())
        .ok_or(TlsError::InvalidCertificate(CertificateError::BadEncoding))?;
    VerifyingKey::from_bytes(&key)
        .map_err(|_| TlsError::InvalidCertificate(CertificateError::BadEncoding))
}

fn verify_handshake_signature(
    key: &VerifyingKey,
    message: &[u8],
    dss: &DigitallySignedStruct,
) -> Result<HandshakeSignatureValid, TlsError> {
    if dss.scheme != SignatureScheme::ED25519 {
        return Err(TlsError::PeerMisbehaved(
            rustls::PeerMisbehaved::SignedHandshakeWithUnadvertisedSigScheme,
        ));
    }
    let signature = Signature::from_slice(dss.signature())
        .map_err(|_| TlsError::InvalidCertificate(CertificateError::BadSignature))?;
    key.verify_strict(message, &signature)
        .map_err(|_| TlsError::InvalidCertificate(CertificateError::BadSignature))?;
    Ok(HandshakeSignatureValid::assertion())
}

/// Dialer-side verifier: the server must hold exactly the key we dialed.
#[derive(Debug)]
struct PinnedServerVerifier {
    expected: VerifyingKey,
}

impl ServerCertVerifier for PinnedServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, TlsError> {
        let key = certificate_public_key(end_entity)?;
        if key != self.expected {
            return Err(TlsError::InvalidCertificate(
                CertificateError::ApplicationVerificationFailure,
            ));
        }
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        _cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        verify_handshake_signature(&self.expected, message, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        _cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        verify_handshake_signature(&self.expected, message, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![SignatureScheme::ED25519]
    }
}

/// Acceptor-side verifier: any client is welcome, but its handshake must
/// verify against the key inside its own certificate. That key becomes the
/// session's authenticated remote identity.
#[derive(Debug)]
struct IdentityClientVerifier;

impl ClientCertVerifier for IdentityClientVerifier {
    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        true
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, TlsError> {
        certificate_public_key(end_entity)?;
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        let key = certificate_public_key(cert)?;
        verify_handshake_signature(&key, message, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        let key = certificate_public_key(cert)?;
        verify_handshake_signature(&key, message, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![SignatureScheme::ED25519]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SigningKey;

    #[test]
    fn certificate_carries_identity_key() {
        let signing = SigningKey::from_bytes(&[0x42; 32]);
        let config = Config::new(signing.clone());
        let identity = TlsIdentity::new(&config).unwrap();
        let key = certificate_public_key(&identity.certificate).unwrap();
        assert_eq!(key, signing.verifying_key());
    }

    #[test]
    fn server_name_splits_hex() {
        let name = server_name_for(&"ab".repeat(32));
        let labels: Vec<&str> = name.split('.').collect();
        assert_eq!(labels.len(), 2);
        assert_eq!(labels[0].len(), 32);
        assert_eq!(labels[1].len(), 32);
        assert!(dial_server_name(&"ab".repeat(32)).is_ok());
    }
}
