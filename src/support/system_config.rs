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
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// The system-wide configuration for Postern.
///
/// This is stored in a file named `postern.toml`, usually under
/// `/usr/local/etc/postern` or `/etc/postern`.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct SystemConfig {
    /// Options for the SMTP engine itself.
    #[serde(default)]
    pub smtp: SmtpConfig,

    /// Configuration for TLS. When absent, STARTTLS is not offered and
    /// implicit TLS cannot be enabled.
    #[serde(default)]
    pub tls: Option<TlsConfig>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SmtpConfig {
    /// The host name announced in the banner and in HELO/EHLO responses.
    ///
    /// When empty, the system host name is used.
    #[serde(default)]
    pub host_name: String,

    /// Extra text appended to the ESMTP banner.
    #[serde(default)]
    pub banner: Option<String>,

    /// The address `postern serve` listens on.
    #[serde(default = "defaults::listen")]
    pub listen: String,

    /// Maximum message size in bytes. Announced via the `SIZE` extension and
    /// enforced both against `MAIL FROM` size declarations and the actual
    /// payload. No limit when absent.
    #[serde(default)]
    pub max_message_size: Option<u64>,

    /// SASL mechanisms to offer, e.g. `["PLAIN", "LOGIN"]`. An empty list
    /// disables authentication entirely; a non-empty list makes
    /// authentication mandatory for mail transactions.
    #[serde(default)]
    pub auth_methods: Vec<String>,

    /// Command verbs to remove from the dispatch table.
    #[serde(default)]
    pub disabled_commands: Vec<String>,

    /// If true, STARTTLS stays usable but is not announced in EHLO and does
    /// not gate AUTH.
    #[serde(default)]
    pub hide_starttls: bool,

    /// Enables the XCLIENT extension for trusted front ends.
    #[serde(default)]
    pub enable_xclient: bool,

    /// Expect a PROXY protocol v1 header as the first line of every
    /// connection, before any greeting is sent.
    #[serde(default)]
    pub expect_proxy: bool,

    /// Maximum number of simultaneous connections. No limit when absent.
    #[serde(default)]
    pub max_clients: Option<usize>,

    /// Idle timeout, in milliseconds.
    #[serde(default = "defaults::socket_timeout_ms")]
    pub socket_timeout_ms: u64,

    /// Perform the TLS handshake before the banner, as on a dedicated
    /// SMTPS port. Requires `[tls]`.
    #[serde(default)]
    pub implicit_tls: bool,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            host_name: String::new(),
            banner: None,
            listen: defaults::listen(),
            max_message_size: None,
            auth_methods: Vec::new(),
            disabled_commands: Vec::new(),
            hide_starttls: false,
            enable_xclient: false,
            expect_proxy: false,
            max_clients: None,
            socket_timeout_ms: defaults::socket_timeout_ms(),
            implicit_tls: false,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct TlsConfig {
    /// The path to the default TLS private key, in PEM format.
    pub private_key: PathBuf,
    /// The path to the default TLS certificate chain, in PEM format.
    pub certificate_chain: PathBuf,

    /// Additional contexts selected by SNI name. A client that names one of
    /// these gets that certificate; everything else falls back to the
    /// default entry above.
    #[serde(default)]
    pub named: BTreeMap<String, TlsEntry>,

    /// Ask connecting clients for a certificate.
    #[serde(default)]
    pub request_client_cert: bool,

    /// Abort the handshake when the client presents no valid certificate.
    /// Only meaningful together with `request_client_cert`.
    #[serde(default)]
    pub require_client_cert: bool,

    /// ALPN protocol names to accept, in preference order.
    #[serde(default)]
    pub alpn_protocols: Vec<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct TlsEntry {
    pub private_key: PathBuf,
    pub certificate_chain: PathBuf,
}

mod defaults {
    pub(super) fn listen() -> String {
        "127.0.0.1:2525".to_owned()
    }

    pub(super) fn socket_timeout_ms() -> u64 {
        60_000
    }
}
