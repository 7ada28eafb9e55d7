//-
// Copyright (c) 2025, 2026, Jason Lingle
//
// This file is part of Postern.
//
// Postern is free software: you can  redistribute it and/or modify it under
// the terms of  the GNU General Public  License as published by  the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Postern is distributed  in the hope that it will  be useful, but WITHOUT
// ANY WARRANTY; without  even the implied warranty  of MERCHANTABILITY or
// FITNESS FOR  A PARTICULAR PURPOSE.  See the GNU General  Public License
// for more details.
//
// You should have received a copy of the GNU General Public License along
// with Postern. If not, see <http://www.gnu.org/licenses/>.

use std::collections::BTreeMap;
use std::sync::Arc;

use openssl::ssl::{
    AlpnError, NameType, SniError, SslAcceptor, SslContext, SslFiletype,
    SslMethod, SslVerifyMode,
};

use crate::support::error::Error;
use crate::support::system_config::TlsConfig;

/// The name under which the fallback certificate is stored.
pub const DEFAULT_CONTEXT: &str = "default";

/// Server certificates keyed by the SNI name clients ask for.
///
/// The store always contains a `default` entry, which is also the one
/// installed on the acceptor itself so that clients sending no SNI extension
/// at all still complete a handshake. Lookups are by exact lowercased name.
#[derive(Clone)]
pub struct TlsContextStore {
    contexts: Arc<BTreeMap<String, SslContext>>,
    acceptor: Arc<SslAcceptor>,
}

impl TlsContextStore {
    pub fn from_config(config: &TlsConfig) -> Result<Self, Error> {
        let mut contexts = BTreeMap::<String, SslContext>::new();
        contexts.insert(
            DEFAULT_CONTEXT.to_owned(),
            build_context(&config.private_key, &config.certificate_chain)?,
        );
        for (name, entry) in &config.named {
            contexts.insert(
                name.to_ascii_lowercase(),
                build_context(&entry.private_key, &entry.certificate_chain)?,
            );
        }

        let mut acceptor =
            SslAcceptor::mozilla_intermediate_v5(SslMethod::tls_server())?;
        acceptor
            .set_private_key_file(&config.private_key, SslFiletype::PEM)?;
        acceptor.set_certificate_chain_file(&config.certificate_chain)?;
        acceptor.check_private_key()?;

        if config.request_client_cert {
            let mut mode = SslVerifyMode::PEER;
            if config.require_client_cert {
                mode |= SslVerifyMode::FAIL_IF_NO_PEER_CERT;
            }
            acceptor.set_verify(mode);
        }

        if !config.alpn_protocols.is_empty() {
            let mut wire = Vec::<u8>::new();
            for proto in &config.alpn_protocols {
                wire.push(proto.len() as u8);
                wire.extend_from_slice(proto.as_bytes());
            }
            let wire: &'static [u8] = Box::leak(wire.into_boxed_slice());
            acceptor.set_alpn_select_callback(move |_ssl, client| {
                openssl::ssl::select_next_proto(wire, client)
                    .ok_or(AlpnError::NOACK)
            });
        }

        let contexts = Arc::new(contexts);
        let sni_contexts = Arc::clone(&contexts);
        acceptor.set_servername_callback(move |ssl, _alert| {
            let Some(name) = ssl.servername(NameType::HOST_NAME) else {
                return Ok(());
            };

            if let Some(ctx) = sni_contexts.get(&name.to_ascii_lowercase()) {
                ssl.set_ssl_context(ctx).map_err(|_| SniError::ALERT_FATAL)?;
            }

            // No match falls through to the default certificate.
            Ok(())
        });

        Ok(Self {
            contexts,
            acceptor: Arc::new(acceptor.build()),
        })
    }

    /// Builds a store holding only a `default` entry from in-memory key
    /// material.
    #[cfg(test)]
    pub fn from_single(
        key: &openssl::pkey::PKeyRef<openssl::pkey::Private>,
        cert: &openssl::x509::X509Ref,
    ) -> Self {
        let mut acceptor =
            SslAcceptor::mozilla_intermediate_v5(SslMethod::tls_server())
                .unwrap();
        acceptor.set_private_key(key).unwrap();
        acceptor.set_certificate(cert).unwrap();

        let mut contexts = BTreeMap::new();
        let mut builder =
            SslContext::builder(SslMethod::tls_server()).unwrap();
        builder.set_private_key(key).unwrap();
        builder.set_certificate(cert).unwrap();
        contexts.insert(DEFAULT_CONTEXT.to_owned(), builder.build());

        Self {
            contexts: Arc::new(contexts),
            acceptor: Arc::new(acceptor.build()),
        }
    }

    /// Looks a context up by SNI name, falling back to `default`.
    ///
    /// The acceptor's servername callback consults the same map during
    /// handshakes.
    pub fn get(&self, name: &str) -> Option<&SslContext> {
        self.contexts
            .get(&name.to_ascii_lowercase())
            .or_else(|| self.contexts.get(DEFAULT_CONTEXT))
    }

    pub fn acceptor(&self) -> &SslAcceptor {
        &self.acceptor
    }
}

fn build_context(
    private_key: &std::path::Path,
    certificate_chain: &std::path::Path,
) -> Result<SslContext, Error> {
    let mut builder = SslContext::builder(SslMethod::tls_server())?;
    builder.set_private_key_file(private_key, SslFiletype::PEM)?;
    builder.set_certificate_chain_file(certificate_chain)?;
    builder.check_private_key()?;
    Ok(builder.build())
}
