//! TLS context construction from channel SSL settings.
//!
//! Accepts a PEM triple (CA bundle, client certificate chain, client key).
//! Private keys may be PKCS#8, PKCS#1 RSA, or SEC1 EC. Container keystore
//! formats (JKS, PKCS#12) have no Rust-native loader and are rejected.

use std::io::BufReader;
use std::sync::Arc;

use dgfacade_config::{ConfigError, SslConfig};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tracing::debug;

use crate::error::{BrokerError, BrokerResult};

fn read_certs(path: &str) -> BrokerResult<Vec<CertificateDer<'static>>> {
    let file = std::fs::File::open(path)?;
    let mut reader = BufReader::new(file);
    let certs: Result<Vec<_>, _> = rustls_pemfile::certs(&mut reader).collect();
    let certs = certs?;
    if certs.is_empty() {
        return Err(BrokerError::Config(ConfigError::Invalid(format!(
            "no certificates found in {path}"
        ))));
    }
    Ok(certs)
}

fn read_private_key(path: &str) -> BrokerResult<PrivateKeyDer<'static>> {
    let file = std::fs::File::open(path)?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)?.ok_or_else(|| {
        BrokerError::Config(ConfigError::Invalid(format!(
            "no PKCS#8, PKCS#1, or SEC1 private key found in {path}"
        )))
    })
}

fn protocol_versions(
    protocol: Option<&str>,
) -> BrokerResult<&'static [&'static rustls::SupportedProtocolVersion]> {
    match protocol {
        // TLSv1.3 is the default minimum.
        None | Some("TLSv1.3") => {
            static TLS13_ONLY: [&rustls::SupportedProtocolVersion; 1] = [&rustls::version::TLS13];
            Ok(&TLS13_ONLY)
        }
        Some("TLSv1.2") => {
            static TLS12_AND_13: [&rustls::SupportedProtocolVersion; 2] =
                [&rustls::version::TLS12, &rustls::version::TLS13];
            Ok(&TLS12_AND_13)
        }
        Some(other) => Err(BrokerError::Config(ConfigError::Invalid(format!(
            "unsupported TLS protocol {other}"
        )))),
    }
}

/// Build a rustls client config from the channel's SSL block.
///
/// Returns `None` when SSL is disabled. With no `ca_cert`, the platform
/// trust store is used.
pub fn build_tls_config(ssl: &SslConfig) -> BrokerResult<Option<Arc<rustls::ClientConfig>>> {
    if !ssl.enabled {
        return Ok(None);
    }
    if let Some(format) = ssl.format.as_deref()
        && !format.eq_ignore_ascii_case("pem")
    {
        return Err(BrokerError::Config(ConfigError::Invalid(format!(
            "unsupported ssl format {format}: only PEM material is supported"
        ))));
    }

    let mut roots = rustls::RootCertStore::empty();
    if let Some(ca_path) = ssl.ca_cert.as_deref() {
        for cert in read_certs(ca_path)? {
            roots
                .add(cert)
                .map_err(|e| BrokerError::Protocol(e.to_string()))?;
        }
    } else {
        let native = rustls_native_certs::load_native_certs();
        for cert in native.certs {
            let _ = roots.add(cert);
        }
        if roots.is_empty() {
            return Err(BrokerError::Config(ConfigError::Invalid(
                "ssl enabled but no ca_cert configured and no platform roots found".to_owned(),
            )));
        }
    }

    let builder = rustls::ClientConfig::builder_with_protocol_versions(protocol_versions(
        ssl.protocol.as_deref(),
    )?)
    .with_root_certificates(roots);

    let config = match (ssl.client_cert.as_deref(), ssl.client_key.as_deref()) {
        (Some(cert_path), Some(key_path)) => {
            let certs = read_certs(cert_path)?;
            let key = read_private_key(key_path)?;
            builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| BrokerError::Protocol(e.to_string()))?
        },
        (None, None) => builder.with_no_client_auth(),
        _ => {
            return Err(BrokerError::Config(ConfigError::Invalid(
                "client_cert and client_key must be configured together".to_owned(),
            )));
        },
    };

    debug!(
        mutual = ssl.client_cert.is_some(),
        "TLS client config built"
    );
    Ok(Some(Arc::new(config)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_ssl_is_none() {
        let config = build_tls_config(&SslConfig::default()).unwrap();
        assert!(config.is_none());
    }

    #[test]
    fn non_pem_format_is_rejected() {
        let ssl = SslConfig {
            enabled: true,
            format: Some("jks".to_owned()),
            ..SslConfig::default()
        };
        let err = build_tls_config(&ssl).unwrap_err();
        assert!(matches!(err, BrokerError::Config(_)));
    }

    #[test]
    fn mismatched_client_pair_is_rejected() {
        // client_cert without client_key never reaches the handshake config.
        let ssl = SslConfig {
            enabled: true,
            client_cert: Some("/some/cert.pem".to_owned()),
            client_key: None,
            ..SslConfig::default()
        };
        assert!(build_tls_config(&ssl).is_err());
    }

    #[test]
    fn unknown_protocol_is_rejected() {
        let ssl = SslConfig {
            enabled: true,
            protocol: Some("SSLv3".to_owned()),
            ..SslConfig::default()
        };
        assert!(build_tls_config(&ssl).is_err());
    }

    #[test]
    fn empty_ca_file_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let ca = tmp.path().join("ca.pem");
        std::fs::write(&ca, "not a certificate").unwrap();

        let ssl = SslConfig {
            enabled: true,
            ca_cert: Some(ca.display().to_string()),
            ..SslConfig::default()
        };
        assert!(build_tls_config(&ssl).is_err());
    }
}
