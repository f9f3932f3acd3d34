//! TLS client configuration.
//!
//! Native root certificates are loaded once per process and cached, since the
//! OS certificate store lookup can be slow on some platforms. Trust store
//! files are read exactly once, when the transport configuration is built.

use rustls::client::WebPkiServerVerifier;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::{CertificateError, DigitallySignedStruct, RootCertStore, SignatureScheme};
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, ServerName, UnixTime};
use secrecy::{ExposeSecret, SecretString};
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use crate::config::{HostnameVerification, TlsMode, TrustStore};
use crate::error::ConfigError;

/// Cached native root certificates.
/// Always stores Ok; empty vec means no certs found (warned, not errored).
static NATIVE_ROOTS_CACHE: OnceLock<Vec<CertificateDer<'static>>> = OnceLock::new();

#[cfg(test)]
static LOAD_COUNT: std::sync::atomic::AtomicUsize = std::sync::atomic::AtomicUsize::new(0);

fn load_native_certs_inner() -> Vec<CertificateDer<'static>> {
    #[cfg(test)]
    LOAD_COUNT.fetch_add(1, std::sync::atomic::Ordering::SeqCst);

    let result = rustls_native_certs::load_native_certs();
    for err in &result.errors {
        tracing::warn!(error = %err, "error loading native root certificate");
    }

    let certs = result.certs;
    if certs.is_empty() {
        tracing::warn!("no native root CA certificates found");
    } else {
        tracing::debug!(count = certs.len(), "loaded native root certificates");
    }
    certs
}

/// Cached native root certificates (may be empty)
pub fn native_root_certs() -> &'static [CertificateDer<'static>] {
    NATIVE_ROOTS_CACHE
        .get_or_init(load_native_certs_inner)
        .as_slice()
}

/// Get the crypto provider for TLS connections.
///
/// Uses the globally installed default provider when there is one, otherwise
/// an aws-lc-rs provider that is not installed globally.
pub fn get_crypto_provider() -> Arc<rustls::crypto::CryptoProvider> {
    rustls::crypto::CryptoProvider::get_default()
        .cloned()
        .unwrap_or_else(|| Arc::new(rustls::crypto::aws_lc_rs::default_provider()))
}

/// Load a PEM trust store.
///
/// The file is read in one pass and the handle is released before parsing,
/// on success and failure alike. PEM bundles are not encrypted, so the only
/// password that opens one is none at all (an empty password counts as none).
///
/// # Errors
/// - `ConfigError::TrustStoreUnreadable` if the file cannot be read
/// - `ConfigError::TrustStorePassword` if a non-empty password is given
/// - `ConfigError::TrustStoreInvalid` if it holds no usable certificate
pub fn load_trust_store(
    path: impl Into<PathBuf>,
    password: Option<&SecretString>,
    hostname_verification: HostnameVerification,
) -> Result<TrustStore, ConfigError> {
    let path = path.into();
    let pem = std::fs::read(&path).map_err(|source| ConfigError::TrustStoreUnreadable {
        path: path.clone(),
        source,
    })?;

    if password.is_some_and(|p| !p.expose_secret().is_empty()) {
        return Err(ConfigError::TrustStorePassword { path });
    }

    let certs = CertificateDer::pem_slice_iter(&pem)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ConfigError::TrustStoreInvalid {
            path: path.clone(),
            reason: e.to_string(),
        })?;
    if certs.is_empty() {
        return Err(ConfigError::TrustStoreInvalid {
            path,
            reason: "no certificates found".to_owned(),
        });
    }

    let mut roots = RootCertStore::empty();
    let (added, ignored) = roots.add_parsable_certificates(certs);
    if added == 0 {
        return Err(ConfigError::TrustStoreInvalid {
            path,
            reason: format!("none of the {ignored} certificates could be parsed"),
        });
    }
    if ignored > 0 {
        tracing::warn!(
            path = %path.display(),
            added,
            ignored,
            "some trust store certificates could not be parsed"
        );
    }

    tracing::debug!(path = %path.display(), count = added, "loaded trust store");
    Ok(TrustStore::new(path, roots, hostname_verification))
}

fn webpki_roots() -> RootCertStore {
    RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    }
}

fn native_roots() -> Result<RootCertStore, ConfigError> {
    let certs = native_root_certs();
    if certs.is_empty() {
        return Err(ConfigError::Tls(
            "no native root CA certificates found in OS certificate store".into(),
        ));
    }

    let mut roots = RootCertStore::empty();
    let (added, ignored) = roots.add_parsable_certificates(certs.iter().cloned());
    if ignored > 0 {
        tracing::warn!(
            added,
            ignored,
            "some native root certificates could not be parsed"
        );
    }
    if added == 0 {
        return Err(ConfigError::Tls(
            format!(
                "no valid native root CA certificates parsed (found {}, all failed to parse)",
                certs.len()
            )
            .into(),
        ));
    }
    Ok(roots)
}

/// Build the rustls client configuration for a TLS mode.
///
/// No ALPN protocols are set; callers that need them add them to a clone.
///
/// # Errors
/// Returns `ConfigError::Tls` if native roots are unavailable or rustls
/// rejects the protocol or verifier setup.
pub fn client_config(mode: &TlsMode) -> Result<rustls::ClientConfig, ConfigError> {
    let provider = get_crypto_provider();
    let builder = rustls::ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()
        .map_err(|e| ConfigError::Tls(Box::new(e)))?;

    let config = match mode {
        TlsMode::Default => builder
            .with_root_certificates(webpki_roots())
            .with_no_client_auth(),
        TlsMode::SystemTrust => builder
            .with_root_certificates(native_roots()?)
            .with_no_client_auth(),
        TlsMode::CustomTrustStore(store) => match store.hostname_verification() {
            HostnameVerification::Strict => builder
                .with_root_certificates(store.roots())
                .with_no_client_auth(),
            HostnameVerification::AcceptAnyHostname => {
                tracing::warn!(
                    path = %store.path().display(),
                    "hostname verification disabled for trust store"
                );
                let inner = WebPkiServerVerifier::builder_with_provider(store.roots(), provider)
                    .build()
                    .map_err(|e| ConfigError::Tls(Box::new(e)))?;
                builder
                    .dangerous()
                    .with_custom_certificate_verifier(Arc::new(AnyHostnameVerifier { inner }))
                    .with_no_client_auth()
            }
        },
    };
    Ok(config)
}

/// Verifies the chain against the trust store but tolerates a host name mismatch.
#[derive(Debug)]
struct AnyHostnameVerifier {
    inner: Arc<WebPkiServerVerifier>,
}

fn is_name_mismatch(err: &rustls::Error) -> bool {
    matches!(
        err,
        rustls::Error::InvalidCertificate(
            CertificateError::NotValidForName | CertificateError::NotValidForNameContext { .. }
        )
    )
}

impl ServerCertVerifier for AnyHostnameVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        match self.inner.verify_server_cert(
            end_entity,
            intermediates,
            server_name,
            ocsp_response,
            now,
        ) {
            Err(err) if is_name_mismatch(&err) => {
                tracing::debug!(server = ?server_name, "accepting certificate despite host name mismatch");
                Ok(ServerCertVerified::assertion())
            }
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
