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

use std::io::{self, BufRead, Read, Write};
use std::mem;
use std::os::unix::net::UnixStream;
use std::sync::{Arc, Mutex};

use openssl::ssl::{SslConnector, SslMethod, SslVerifyMode};
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;

use super::bridge::*;
use super::{serve_smtp, ConnectionParams, Connections};
use crate::smtp::syntax::AddressRecord;
use crate::support::async_io::ServerIo;
use crate::support::system_config::SystemConfig;
use crate::support::tls::TlsContextStore;
use crate::test_data::{CERTIFICATE, CERTIFICATE_PRIVATE_KEY};

/// The address every test connection appears to come from. Reverse DNS is
/// disabled in tests, so the engine derives `[192.0.2.25]` from this.
pub(super) const TEST_PEER: &str = "192.0.2.25";

/// Programmable behaviour for the test service.
#[derive(Default)]
pub(super) struct ServiceBehaviour {
    pub(super) reject_connect: Option<Rejection>,
    pub(super) reject_mail: Option<Rejection>,
    pub(super) reject_rcpt: Option<Rejection>,
    pub(super) reject_data: Option<Rejection>,
    /// Replaces the stock success text after DATA.
    pub(super) data_message: Option<String>,
    /// The one (username, password) pair the service accepts.
    pub(super) accept_credentials: Option<(String, String)>,
    /// Pretend this many other connections are already registered.
    pub(super) occupied_slots: usize,
}

/// What the test service observed, for assertions after the fact.
#[derive(Default)]
pub(super) struct ServiceState {
    pub(super) behaviour: ServiceBehaviour,
    pub(super) mail_from: Mutex<Vec<AddressRecord>>,
    pub(super) recipients: Mutex<Vec<AddressRecord>>,
    pub(super) data_sessions: Mutex<Vec<Session>>,
    pub(super) bodies: Mutex<Vec<Vec<u8>>>,
}

impl ServiceState {
    pub(super) fn with_behaviour(behaviour: ServiceBehaviour) -> Arc<Self> {
        Arc::new(Self {
            behaviour,
            ..Self::default()
        })
    }
}

/// Spawns a server thread talking to `state`'s service and returns a client
/// connected to it.
pub(super) fn connect(
    name: &'static str,
    config: SystemConfig,
    with_tls: bool,
    state: Arc<ServiceState>,
) -> SmtpClient {
    crate::init_test_log();

    let (server_io, client_io) = UnixStream::pair().unwrap();
    std::thread::spawn(move || run_server(server_io, config, with_tls, state));

    SmtpClient::new(name, client_io)
}

fn run_server(
    io: UnixStream,
    config: SystemConfig,
    with_tls: bool,
    state: Arc<ServiceState>,
) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let local = tokio::task::LocalSet::new();

    local.block_on(&runtime, async move {
        let io = ServerIo::new_owned_socket(io).unwrap();
        let tls = with_tls.then(|| {
            TlsContextStore::from_single(
                &CERTIFICATE_PRIVATE_KEY,
                &CERTIFICATE,
            )
        });

        let registry = Connections::default();
        for ix in 0..state.behaviour.occupied_slots {
            registry.occupy(&format!("occupied-{}", ix));
        }

        let (service_tx, service_rx) = mpsc::channel(1);
        tokio::task::spawn_local(test_service(
            service_rx,
            Arc::clone(&state),
        ));

        let params = ConnectionParams {
            config: Arc::new(config),
            tls,
            resolver: None,
            registry,
            remote_address: TEST_PEER.to_owned(),
        };
        let _ = serve_smtp(io, params, service_tx).await;
    });
}

async fn test_service(
    mut requests: mpsc::Receiver<Request>,
    state: Arc<ServiceState>,
) {
    while let Some(Request { payload, respond }) = requests.recv().await {
        match payload {
            RequestPayload::Connect(_) => {
                let _ = respond.send(veto(&state.behaviour.reject_connect));
            },

            RequestPayload::Auth(auth) => {
                let accept = state
                    .behaviour
                    .accept_credentials
                    .as_ref()
                    .map_or(false, |(user, password)| {
                        *user == auth.username && *password == auth.password
                    });
                let _ = respond.send(if accept {
                    Ok(())
                } else {
                    Err(Rejection::new("Error: authentication failed"))
                });
            },

            RequestPayload::Mail(mail) => {
                state.mail_from.lock().unwrap().push(mail.from);
                let _ = respond.send(veto(&state.behaviour.reject_mail));
            },

            RequestPayload::Recipient(rcpt) => {
                state.recipients.lock().unwrap().push(rcpt.to);
                let _ = respond.send(veto(&state.behaviour.reject_rcpt));
            },

            RequestPayload::Data(data_request) => {
                if let Some(ref rejection) = state.behaviour.reject_data {
                    let _ = respond.send(Err(rejection.clone()));
                    continue;
                }

                let DataRequest {
                    mut data,
                    outcome,
                    session,
                } = data_request;
                let _ = respond.send(Ok(()));
                state.data_sessions.lock().unwrap().push(session);

                let mut body = Vec::new();
                let _ = data.read_to_end(&mut body).await;
                state.bodies.lock().unwrap().push(body);

                let _ = outcome
                    .send(Ok(state.behaviour.data_message.clone()));
            },
        }
    }
}

fn veto(rejection: &Option<Rejection>) -> HookResult {
    match *rejection {
        Some(ref rejection) => Err(rejection.clone()),
        None => Ok(()),
    }
}

pub trait ReadWrite: Read + Write {}
impl<T: Read + Write + ?Sized> ReadWrite for T {}

pub(super) struct SmtpClient {
    name: &'static str,
    io: Box<dyn ReadWrite>,
}

impl SmtpClient {
    pub fn new(name: &'static str, io: impl ReadWrite + 'static) -> Self {
        Self {
            name,
            io: Box::new(io),
        }
    }

    /// Read responses from the server up to and including the final
    /// response.
    ///
    /// This creates a `BufReader` over `io` and will lose any data which
    /// was buffered after the last read line. This should be fine since we
    /// don't do pipelining here.
    pub fn read_responses(&mut self) -> Vec<String> {
        let mut ret = Vec::<String>::new();
        let mut r = io::BufReader::new(&mut self.io);

        loop {
            let mut line = String::new();
            r.read_line(&mut line).unwrap();
            println!("[{}] >> {:?}", self.name, line);

            if line.is_empty() {
                panic!("Unexpected EOF");
            }

            let last = " " == &line[3..4];
            ret.push(line);

            if last {
                break;
            }
        }

        ret
    }

    /// Asserts that the server has hung up on us.
    pub fn read_eof(&mut self) {
        let mut line = String::new();
        let mut r = io::BufReader::new(&mut self.io);
        r.read_line(&mut line).unwrap();
        assert_eq!("", line, "Expected EOF, read {:?}", line);
    }

    /// Writes the given complete line to the server.
    pub fn write_line(&mut self, s: &str) {
        assert!(s.ends_with('\n'));
        for line in s.split_inclusive('\n') {
            println!("[{}] << {:?}", self.name, line);
        }
        self.io.write_all(s.as_bytes()).unwrap();
    }

    /// Writes the given raw data to the server.
    pub fn write_raw(&mut self, data: &[u8]) {
        println!("[{}] << [{} bytes]", self.name, data.len());
        self.io.write_all(data).unwrap();
    }

    /// Skip the server greeting, then send the given command and consume
    /// the responses. Assert that the command succeeds.
    pub fn skip_pleasantries(&mut self, cmd: &str) {
        self.read_responses();
        self.write_line(&format!("{}\r\n", cmd));
        let responses = self.read_responses();
        assert!(responses.last().unwrap().starts_with("250"));
    }

    /// Send a command which is expected to have one response with the
    /// given prefix.
    pub fn simple_command(&mut self, command: &str, prefix: &str) {
        self.write_line(&format!("{}\r\n", command));
        let responses = self.read_responses();
        assert_eq!(1, responses.len());
        assert!(
            responses[0].starts_with(prefix),
            "Expected {:?}.., got {:?}",
            prefix,
            responses[0],
        );
    }

    /// Performs a TLS handshake on the connection.
    pub fn start_tls(&mut self) {
        let mut connector = SslConnector::builder(SslMethod::tls()).unwrap();
        connector.set_verify(SslVerifyMode::NONE);

        println!("[{}] <> Start TLS handshake", self.name);
        let cxn = mem::replace(&mut self.io, Box::new(io::empty()));
        let cxn = connector
            .build()
            .connect("localhost", cxn)
            .map_err(|_| "SSL handshake failed")
            .unwrap();
        println!("[{}] <> TLS handshake succeeded", self.name);
        self.io = Box::new(cxn);
    }
}
