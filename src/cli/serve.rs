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

use std::rc::Rc;
use std::sync::Arc;

use log::{error, info, warn};
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;

use crate::smtp::inbound::bridge::{
    DataRequest, Rejection, Request, RequestPayload,
};
use crate::smtp::inbound::{serve_smtp, ConnectionParams, Connections};
use crate::support::{
    async_io::ServerIo, dns, system_config::SystemConfig,
    tls::TlsContextStore,
};

// Needs to use this and not a plain panic so that errors go to the
// configured log sink.
macro_rules! fatal {
    ($ex:ident, $($stuff:tt)*) => {{
        error!($($stuff)*);
        crate::support::sysexits::$ex.exit()
    }}
}

pub(super) fn serve(config: SystemConfig) {
    let config = Arc::new(config);

    let tls = match config.tls {
        Some(ref tls_config) => {
            match TlsContextStore::from_config(tls_config) {
                Ok(store) => Some(store),
                Err(e) => fatal!(
                    EX_CONFIG,
                    "Unable to load TLS configuration: {}",
                    e
                ),
            }
        },
        None => None,
    };
    if config.smtp.implicit_tls && tls.is_none() {
        fatal!(EX_CONFIG, "implicit_tls requires a [tls] section");
    }

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => fatal!(EX_OSERR, "Failed to start async runtime: {}", e),
    };

    // Connections are cooperative tasks on one thread; `ServerIo` is
    // deliberately not Send.
    let local = tokio::task::LocalSet::new();
    local.block_on(&runtime, run(config, tls));
}

async fn run(config: Arc<SystemConfig>, tls: Option<TlsContextStore>) {
    let resolver = match dns::system_resolver() {
        Ok(resolver) => Some(Rc::new(resolver)),
        Err(e) => {
            warn!("Reverse DNS disabled; no usable resolver: {}", e);
            None
        },
    };

    let listener =
        match tokio::net::TcpListener::bind(&config.smtp.listen).await {
            Ok(listener) => listener,
            Err(e) => fatal!(
                EX_UNAVAILABLE,
                "Unable to listen on {}: {}",
                config.smtp.listen,
                e
            ),
        };
    info!("Listening on {}", config.smtp.listen);

    let registry = Connections::default();

    loop {
        let (socket, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("accept() failed: {}", e);
                continue;
            },
        };

        let io = socket
            .into_std()
            .map_err(crate::support::error::Error::Io)
            .and_then(|s| ServerIo::new_owned_socket(s).map_err(Into::into));
        let io = match io {
            Ok(io) => io,
            Err(e) => {
                warn!("Unable to adopt connection from {}: {}", peer, e);
                continue;
            },
        };

        let (service_tx, service_rx) = mpsc::channel(1);
        tokio::task::spawn_local(demo_service(service_rx));

        let params = ConnectionParams {
            config: Arc::clone(&config),
            tls: tls.clone(),
            resolver: resolver.clone(),
            registry: registry.clone(),
            remote_address: peer.ip().to_string(),
        };
        tokio::task::spawn_local(async move {
            // serve_smtp logs its own outcome.
            let _ = serve_smtp(io, params, service_tx).await;
        });
    }
}

/// The service behind `postern serve`: accepts every envelope, reads and
/// discards each message, and refuses all credentials.
async fn demo_service(mut requests: mpsc::Receiver<Request>) {
    while let Some(request) = requests.recv().await {
        let Request { payload, respond } = request;
        match payload {
            RequestPayload::Connect(_)
            | RequestPayload::Mail(_)
            | RequestPayload::Recipient(_) => {
                let _ = respond.send(Ok(()));
            },

            RequestPayload::Auth(auth) => {
                info!(
                    "{} Refusing credentials for {:?}",
                    auth.session.id, auth.username,
                );
                let _ = respond.send(Err(Rejection::new(
                    "Error: authentication failed",
                )));
            },

            RequestPayload::Data(data_request) => {
                let DataRequest {
                    mut data,
                    outcome,
                    session,
                } = data_request;
                let _ = respond.send(Ok(()));

                let mut total = 0u64;
                let mut buf = [0u8; 4096];
                loop {
                    match data.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => total += n as u64,
                    }
                }

                info!(
                    "{} Discarding {} byte message from <{}> for {} \
                     recipient(s)",
                    session.id,
                    total,
                    session
                        .envelope
                        .mail_from
                        .map(|a| a.address)
                        .unwrap_or_default(),
                    session.envelope.rcpt_to.len(),
                );
                let _ = outcome.send(Ok(None));
            },
        }
    }
}
