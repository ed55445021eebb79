//! TLS negotiation and certificate handling.
use rustls::{
    ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme,
    client::{
        WebPkiServerVerifier,
        danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    },
    crypto::CryptoProvider,
};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use std::{io, path::PathBuf, sync::Arc};
use tokio::net::TcpStream;
use tokio_rustls::{TlsConnector, client::TlsStream};

use crate::connection::Config;

/// When and how strictly to use TLS.
///
/// Ordering matters: everything from `Prefer` up attempts TLS,
/// everything from `Require` up refuses to continue without it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum SslMode {
    /// Never use TLS.
    #[default]
    Disable,
    /// No TLS attempt; kept distinct from `Disable` for compatibility
    /// with server-side pg conventions.
    Allow,
    /// Attempt TLS, fall back to cleartext when the server declines.
    Prefer,
    /// TLS or fail; the certificate chain is verified, the hostname is
    /// not.
    Require,
    /// TLS with chain verification against the trusted roots.
    VerifyCa,
    /// TLS with chain and hostname verification.
    VerifyFull,
}

impl SslMode {
    pub fn starts_ssl(self) -> bool {
        self >= SslMode::Prefer
    }

    pub fn requires_ssl(self) -> bool {
        self >= SslMode::Require
    }
}

impl std::str::FromStr for SslMode {
    type Err = TlsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "disable" => Ok(Self::Disable),
            "allow" => Ok(Self::Allow),
            "prefer" => Ok(Self::Prefer),
            "require" => Ok(Self::Require),
            "verify-ca" => Ok(Self::VerifyCa),
            "verify-full" => Ok(Self::VerifyFull),
            _ => Err(TlsError::BadConfig(format!("unknown sslmode {s:?}"))),
        }
    }
}

/// TLS layer errors.
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    /// The server answered `'N'` to the SSLRequest but the ssl mode
    /// requires TLS.
    #[error("server refused TLS and sslmode requires it")]
    Refused,
    #[error("TLS handshake failed: {0}")]
    Handshake(#[from] rustls::Error),
    #[error("invalid TLS server name: {0}")]
    ServerName(String),
    #[error("invalid TLS configuration: {0}")]
    BadConfig(String),
    #[error("failed to read certificate material: {0}")]
    Io(#[from] io::Error),
}

/// Run the client handshake over an accepted SSLRequest.
pub(super) async fn handshake(
    tcp: TcpStream,
    config: &Config,
) -> Result<TlsStream<TcpStream>, TlsError> {
    let client = client_config(config)?;
    let server_name = ServerName::try_from(config.host.as_str().to_owned())
        .map_err(|_| TlsError::ServerName(config.host.as_str().to_owned()))?;

    let connector = TlsConnector::from(Arc::new(client));
    let tls = connector.connect(server_name, tcp).await?;
    tracing::debug!(host = config.host.as_str(), "TLS handshake complete");
    Ok(tls)
}

fn client_config(config: &Config) -> Result<ClientConfig, TlsError> {
    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());

    let roots = root_store(config)?;
    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()?;

    let builder = match config.ssl_mode {
        SslMode::Require | SslMode::VerifyCa => {
            let inner = WebPkiServerVerifier::builder_with_provider(
                Arc::new(roots),
                provider,
            )
            .build()
            .map_err(|e| TlsError::BadConfig(e.to_string()))?;
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(ChainOnlyVerifier { inner }))
        },
        SslMode::VerifyFull => builder.with_root_certificates(roots),
        // Prefer (and below) talks TLS opportunistically, without
        // authentication of the peer
        _ => builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAllVerifier { provider })),
    };

    let client = match client_identity(config)? {
        Some((certs, key)) => builder
            .with_client_auth_cert(certs, key)
            .map_err(TlsError::Handshake)?,
        None => builder.with_no_client_auth(),
    };

    Ok(client)
}

fn root_store(config: &Config) -> Result<RootCertStore, TlsError> {
    let mut roots = RootCertStore::empty();
    match config.ssl_root_cert.as_deref() {
        Some(path) => {
            let pem = std::fs::read(path)?;
            for cert in rustls_pemfile::certs(&mut &pem[..]) {
                roots
                    .add(cert?)
                    .map_err(TlsError::Handshake)?;
            }
        },
        None => {
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        },
    }
    Ok(roots)
}

/// The configured client certificate, or the well-known per-user
/// location (`~/.postgresql/postgresql.crt` and `postgresql.pk8`).
fn client_identity(
    config: &Config,
) -> Result<Option<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)>, TlsError> {
    let (cert_path, key_path) = match (config.ssl_cert.as_deref(), config.ssl_key.as_deref()) {
        (Some(cert), Some(key)) => (cert.to_owned(), key.to_owned()),
        (None, None) => match default_identity_paths() {
            Some(paths) => paths,
            None => return Ok(None),
        },
        _ => {
            return Err(TlsError::BadConfig(
                "sslcert and sslkey must be configured together".into(),
            ));
        },
    };

    let pem = std::fs::read(cert_path)?;
    let certs = rustls_pemfile::certs(&mut &pem[..]).collect::<Result<Vec<_>, _>>()?;
    let key = private_key(&key_path, config.ssl_password.as_deref())?;
    Ok(Some((certs, key)))
}

fn default_identity_paths() -> Option<(PathBuf, PathBuf)> {
    let base = if cfg!(windows) {
        PathBuf::from(std::env::var_os("APPDATA")?).join("postgresql")
    } else {
        PathBuf::from(std::env::var_os("HOME")?).join(".postgresql")
    };
    let cert = base.join("postgresql.crt");
    let key = base.join("postgresql.pk8");
    (cert.is_file() && key.is_file()).then_some((cert, key))
}

/// Load a PKCS#8 private key, PEM or DER, decrypting it when a password
/// is configured.
fn private_key(
    path: &std::path::Path,
    password: Option<&str>,
) -> Result<PrivateKeyDer<'static>, TlsError> {
    let raw = std::fs::read(path)?;

    if raw.starts_with(b"-----") {
        return rustls_pemfile::private_key(&mut &raw[..])?
            .ok_or_else(|| TlsError::BadConfig(format!("no private key in {}", path.display())));
    }

    // raw DER; try the encrypted envelope first when a password is given
    if let Some(password) = password {
        if let Ok(encrypted) = pkcs8::EncryptedPrivateKeyInfo::try_from(&raw[..]) {
            let document = encrypted
                .decrypt(password)
                .map_err(|e| TlsError::BadConfig(format!("cannot decrypt sslkey: {e}")))?;
            let der = PrivatePkcs8KeyDer::from(document.as_bytes().to_vec());
            return Ok(PrivateKeyDer::Pkcs8(der));
        }
    }

    Ok(PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(raw)))
}

/// Verifies the chain but tolerates a hostname mismatch, for `require`
/// and `verify-ca`.
#[derive(Debug)]
struct ChainOnlyVerifier {
    inner: Arc<WebPkiServerVerifier>,
}

impl ServerCertVerifier for ChainOnlyVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        match self
            .inner
            .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
        {
            Err(rustls::Error::InvalidCertificate(
                rustls::CertificateError::NotValidForName
                | rustls::CertificateError::NotValidForNameContext { .. },
            )) => Ok(ServerCertVerified::assertion()),
            other => other,
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

/// No verification at all, for the opportunistic modes.
#[derive(Debug)]
struct AcceptAllVerifier {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptAllVerifier {
    fn verify_server_cert(
        &self,
        _: &CertificateDer<'_>,
        _: &[CertificateDer<'_>],
        _: &ServerName<'_>,
        _: &[u8],
        _: UnixTime,
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
            &self.provider.signature_verification_algorithms,
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
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn mode_ordering_drives_negotiation() {
        assert!(!SslMode::Disable.starts_ssl());
        assert!(!SslMode::Allow.starts_ssl());
        assert!(SslMode::Prefer.starts_ssl());
        assert!(!SslMode::Prefer.requires_ssl());
        assert!(SslMode::Require.requires_ssl());
        assert!(SslMode::VerifyFull.requires_ssl());
    }

    #[test]
    fn mode_parsing() {
        assert_eq!("disable".parse::<SslMode>().unwrap(), SslMode::Disable);
        assert_eq!("verify-ca".parse::<SslMode>().unwrap(), SslMode::VerifyCa);
        assert_eq!("verify-full".parse::<SslMode>().unwrap(), SslMode::VerifyFull);
        assert!("tls-please".parse::<SslMode>().is_err());
    }
}
