use std::{fs::File, io::BufReader, path::PathBuf, sync::Arc};

use rustls::{
    ProtocolVersion, ServerConfig, SupportedCipherSuite,
    pki_types::{CertificateDer, PrivateKeyDer},
    server::ServerConnection,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("cannot load certificate {path}: {source}")]
    CertificateLoad {
        path: String,
        source: std::io::Error,
    },

    #[error("cannot load key {path}: {reason}")]
    KeyLoad { path: String, reason: String },

    #[error(transparent)]
    Rustls(#[from] rustls::Error),

    #[error("negotiated connection is missing {0}")]
    ProtocolInfoMissing(String),
}

pub type TlsResult<T> = Result<T, TlsError>;

/// Certificate material plus the configured version floor.
#[derive(Debug, Clone)]
pub struct TlsSettings {
    pub certificate: PathBuf,
    pub key: PathBuf,
    /// Config values 1/2/3 ask for a TLS 1.0/1.1/1.2 floor. rustls does not
    /// implement 1.0/1.1, so 1 and 2 clamp to the 1.2 floor with a warning.
    pub min_version: u8,
}

impl TlsSettings {
    /// Builds the server-side rustls config. A key that does not match the
    /// certificate fails here, before any listener binds.
    ///
    /// # Errors
    ///
    /// See [`TlsError`].
    pub fn server_config(&self) -> TlsResult<Arc<ServerConfig>> {
        if self.min_version < 3 {
            tracing::warn!(
                configured = self.min_version,
                "min_tls_version below 3 requests TLS 1.0/1.1; clamping floor to TLS 1.2"
            );
        }

        let certs = load_certs(&self.certificate)?;
        let key = load_key(&self.key)?;

        // rustls' supported versions are 1.2 and 1.3; every configured floor
        // resolves to "1.2 and up", which also satisfies the >=128-bit cipher
        // requirement (all default suites qualify).
        let config = ServerConfig::builder_with_protocol_versions(&[
            &rustls::version::TLS12,
            &rustls::version::TLS13,
        ])
        .with_no_client_auth()
        .with_single_cert(certs, key)?;

        Ok(Arc::new(config))
    }
}

fn load_certs(path: &std::path::Path) -> TlsResult<Vec<CertificateDer<'static>>> {
    let file = File::open(path).map_err(|source| TlsError::CertificateLoad {
        path: path.display().to_string(),
        source,
    })?;

    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TlsError::CertificateLoad {
            path: path.display().to_string(),
            source,
        })?;

    if certs.is_empty() {
        return Err(TlsError::CertificateLoad {
            path: path.display().to_string(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, "no certificates in PEM"),
        });
    }

    Ok(certs)
}

fn load_key(path: &std::path::Path) -> TlsResult<PrivateKeyDer<'static>> {
    let path_str = path.display().to_string();
    let mut reader = BufReader::new(File::open(path).map_err(|e| TlsError::KeyLoad {
        path: path_str.clone(),
        reason: e.to_string(),
    })?);

    match rustls_pemfile::read_one(&mut reader).map_err(|e| TlsError::KeyLoad {
        path: path_str.clone(),
        reason: e.to_string(),
    })? {
        Some(rustls_pemfile::Item::Pkcs1Key(key)) => Ok(PrivateKeyDer::Pkcs1(key)),
        Some(rustls_pemfile::Item::Pkcs8Key(key)) => Ok(PrivateKeyDer::Pkcs8(key)),
        Some(rustls_pemfile::Item::Sec1Key(key)) => Ok(PrivateKeyDer::Sec1(key)),
        _ => Err(TlsError::KeyLoad {
            path: path_str,
            reason: "unable to determine key format (expected PKCS1, PKCS8, or SEC1)".to_string(),
        }),
    }
}

/// Negotiated protocol parameters, logged after every handshake.
#[derive(Debug)]
pub struct TlsInfo {
    version: ProtocolVersion,
    cipher: SupportedCipherSuite,
}

impl TlsInfo {
    /// # Errors
    ///
    /// Fails when called before the handshake has completed.
    pub fn of(conn: &ServerConnection) -> TlsResult<Self> {
        Ok(Self {
            version: conn
                .protocol_version()
                .ok_or_else(|| TlsError::ProtocolInfoMissing("protocol version".to_string()))?,
            cipher: conn
                .negotiated_cipher_suite()
                .ok_or_else(|| TlsError::ProtocolInfoMissing("cipher suite".to_string()))?,
        })
    }

    #[must_use]
    pub fn protocol(&self) -> String {
        self.version
            .as_str()
            .map_or_else(|| format!("{:?}", self.version), str::to_string)
    }

    #[must_use]
    pub fn cipher(&self) -> String {
        self.cipher
            .suite()
            .as_str()
            .map_or_else(|| format!("{:?}", self.cipher.suite()), str::to_string)
    }
}
