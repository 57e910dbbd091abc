//! TLS setup for the REST transport.
//!
//! Native root certificates are read from the OS store once per process;
//! every client built afterwards reuses the parsed set.

use crate::config::TlsRootConfig;
use crate::error::RestError;
use hyper_rustls::HttpsConnectorBuilder;
use hyper_rustls::builderstates::WantsSchemes;
use rustls_pki_types::CertificateDer;
use std::sync::{Arc, OnceLock};

static NATIVE_ROOTS: OnceLock<Vec<CertificateDer<'static>>> = OnceLock::new();

#[cfg(test)]
static NATIVE_LOADS: std::sync::atomic::AtomicUsize = std::sync::atomic::AtomicUsize::new(0);

fn load_native_roots() -> Vec<CertificateDer<'static>> {
    #[cfg(test)]
    NATIVE_LOADS.fetch_add(1, std::sync::atomic::Ordering::SeqCst);

    let loaded = rustls_native_certs::load_native_certs();
    for err in &loaded.errors {
        tracing::warn!(error = %err, "failed to load a native root certificate");
    }

    if loaded.certs.is_empty() {
        tracing::warn!("OS certificate store returned no root certificates");
    } else {
        tracing::debug!(count = loaded.certs.len(), "native root certificates loaded");
    }
    loaded.certs
}

/// Native root certificates, loaded on first use (may be empty).
pub fn native_root_certs() -> &'static [CertificateDer<'static>] {
    NATIVE_ROOTS.get_or_init(load_native_roots)
}

/// The process-wide rustls provider if one is installed, otherwise aws-lc-rs.
///
/// Never installs a global default.
pub fn crypto_provider() -> Arc<rustls::crypto::CryptoProvider> {
    rustls::crypto::CryptoProvider::get_default()
        .cloned()
        .unwrap_or_else(|| Arc::new(rustls::crypto::aws_lc_rs::default_provider()))
}

fn native_client_config() -> Result<rustls::ClientConfig, RestError> {
    let certs = native_root_certs();
    if certs.is_empty() {
        return Err(RestError::Tls(
            "no native root CA certificates found in OS certificate store".into(),
        ));
    }

    let mut roots = rustls::RootCertStore::empty();
    let (added, ignored) = roots.add_parsable_certificates(certs.iter().cloned());
    if ignored > 0 {
        tracing::warn!(added, ignored, "some native root certificates could not be parsed");
    }
    if added == 0 {
        return Err(RestError::Tls(
            format!("none of the {} native root certificates could be parsed", certs.len()).into(),
        ));
    }

    rustls::ClientConfig::builder_with_provider(crypto_provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| RestError::Tls(Box::new(e)))
        .map(|builder| {
            builder
                .with_root_certificates(roots)
                .with_no_client_auth()
        })
}

/// Start an HTTPS connector builder trusting the configured roots.
///
/// # Errors
///
/// Returns `RestError::Tls` if the provider rejects the protocol versions or,
/// for [`TlsRootConfig::Native`], if no usable OS root certificate exists.
pub fn https_connector_builder(
    roots: TlsRootConfig,
) -> Result<HttpsConnectorBuilder<WantsSchemes>, RestError> {
    match roots {
        TlsRootConfig::WebPki => HttpsConnectorBuilder::new()
            .with_provider_and_webpki_roots(crypto_provider())
            .map_err(|e| RestError::Tls(Box::new(e))),
        TlsRootConfig::Native => {
            Ok(HttpsConnectorBuilder::new().with_tls_config(native_client_config()?))
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    /// The loader runs at most once however many times the roots are read.
    ///
    /// Other tests may have filled the cache already, so the delta is 0 or 1.
    #[test]
    fn test_native_roots_loaded_once() {
        let before = NATIVE_LOADS.load(Ordering::SeqCst);

        let first = native_root_certs();
        let second = native_root_certs();

        assert!(NATIVE_LOADS.load(Ordering::SeqCst) <= before + 1);
        assert!(std::ptr::eq(first, second));
    }

    #[test]
    fn test_webpki_builder_available() {
        assert!(https_connector_builder(TlsRootConfig::WebPki).is_ok());
    }
}
