use super::Transport;
use crate::error::TransportError;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use std::sync::Arc;
use tokio_rustls::TlsConnector;

/// A self-signed client certificate and its private key, used for the
/// `STLS` TLS upgrade. ADB devices anchor trust via the out-of-band
/// pairing step, not via a CA, so the client cert need not be signed by
/// anything in particular — a fresh self-signed one is generated per run
/// unless the caller supplies a persisted one.
pub struct TlsKeypair {
    pub cert: CertificateDer<'static>,
    pub key: PrivateKeyDer<'static>,
}

impl TlsKeypair {
    /// Generate a fresh self-signed client certificate.
    pub fn generate() -> Result<Self, TransportError> {
        let rcgen::CertifiedKey { cert, signing_key } =
            rcgen::generate_simple_self_signed(["adb-client".to_string()])
                .map_err(|e| TransportError::Tls(e.to_string()))?;
        let cert_der = CertificateDer::from(cert.der().to_vec());
        let key_der = PrivateKeyDer::try_from(signing_key.serialize_der())
            .map_err(|e| TransportError::Tls(e.to_string()))?;
        Ok(TlsKeypair { cert: cert_der, key: key_der })
    }
}

/// Accepts any server certificate. ADB devices present self-signed certs
/// with no shared CA; the pairing step is what establishes trust, not the
/// TLS certificate chain.
#[derive(Debug)]
struct AcceptAnyServerCert;

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
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ED25519,
            SignatureScheme::RSA_PSS_SHA256,
        ]
    }
}

/// Destructively upgrade a plain transport to TLS 1.2+, presenting `keys`
/// as the client certificate and verifying nothing on the peer side.
///
/// Per the handshake state machine, this is only called immediately after
/// exchanging `STLS`; the caller must not touch `transport` again if this
/// fails, since the underlying socket may be left in an indeterminate state.
pub async fn upgrade_tls(transport: Transport, keys: TlsKeypair) -> Result<Transport, TransportError> {
    let tcp = match transport {
        Transport::Plain(tcp) => tcp,
        Transport::Tls(_) => return Err(TransportError::Tls("transport is already TLS".into())),
    };

    let config = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
        .with_client_auth_cert(vec![keys.cert], keys.key)
        .map_err(|e| TransportError::Tls(e.to_string()))?;

    let connector = TlsConnector::from(Arc::new(config));
    let server_name = ServerName::try_from("adb").map_err(|e| TransportError::Tls(e.to_string()))?;
    let stream = connector
        .connect(server_name, tcp)
        .await
        .map_err(|e| TransportError::Tls(e.to_string()))?;
    Ok(Transport::Tls(Box::new(stream)))
}
