// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Server-side TLS context, built once per listener at startup.

use std::sync::Arc;

use rustls::ServerConfig;
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::TlsAcceptor;
use tracing::debug;

use crate::config::TlsConfig;

/// Loads the PEM certificate chain and private key and returns an acceptor.
///
/// Errors are returned as strings so the caller can attach the listener name.
pub fn build_acceptor(tls: &TlsConfig) -> Result<TlsAcceptor, String> {
    let certs = CertificateDer::pem_file_iter(&tls.cert_file)
        .map_err(|e| format!("cannot read {}: {e}", tls.cert_file.display()))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| format!("invalid certificate in {}: {e}", tls.cert_file.display()))?;
    if certs.is_empty() {
        return Err(format!(
            "no certificate found in {}",
            tls.cert_file.display()
        ));
    }

    let key = PrivateKeyDer::from_pem_file(&tls.key_file)
        .map_err(|e| format!("cannot read private key {}: {e}", tls.key_file.display()))?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| e.to_string())?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| format!("certificate and key do not match: {e}"))?;

    debug!(
        "Loaded TLS certificate {} for listener",
        tls.cert_file.display()
    );
    Ok(TlsAcceptor::from(Arc::new(config)))
}
