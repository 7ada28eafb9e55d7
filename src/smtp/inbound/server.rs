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

use std::cell::RefCell;
use std::collections::{BTreeMap, HashSet};
use std::io;
use std::net::IpAddr;
use std::pin::Pin;
use std::rc::Rc;
use std::str;
use std::sync::Arc;
use std::task;
use std::time::Duration;

use log::{debug, error, info, warn};
use rand::{distributions::Alphanumeric, rngs::OsRng, Rng};
use tokio::io::{
    AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufStream, DuplexStream,
};
use tokio::sync::oneshot;

use super::bridge::*;
use super::sasl;
use crate::smtp::codes::*;
use crate::smtp::syntax::{
    command_verb, looks_like_http, parse_address_command,
};
use crate::support::{
    async_io::ServerIo, dns, error::Error, log_prefix::LogPrefix,
    system_config::SystemConfig, tls::TlsContextStore,
};

const MAX_LINE: usize = 1024;
const CONNECTION_TAG_LEN: usize = 12;
/// How long a freshly accepted client must hold its tongue. Spammers
/// blasting commands before the banner out themselves here.
const EARLY_TALKER_GRACE: Duration = Duration::from_millis(100);
const UNRECOGNIZED_LIMIT: u32 = 10;
const UNAUTHENTICATED_LIMIT: u32 = 10;
const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
/// The idle timeout is relaxed to this while a message body is streaming.
const DATA_TIMEOUT: Duration = Duration::from_secs(1800);
const DATA_PIPE_CAPACITY: usize = 4096;

static VERBS: &[&str] = &[
    "EHLO", "HELO", "MAIL", "RCPT", "DATA", "RSET", "NOOP", "HELP", "VRFY",
    "QUIT", "AUTH", "STARTTLS", "XCLIENT", "WIZ", "SHELL", "KILL",
];

/// The set of live connection tags under one server, used to enforce
/// `max_clients`.
///
/// Clones share the same underlying set. This is per-thread state; each
/// connection registers itself for its lifetime.
#[derive(Clone, Default)]
pub struct Connections {
    inner: Rc<RefCell<HashSet<String>>>,
}

impl Connections {
    pub fn len(&self) -> usize {
        self.inner.borrow().len()
    }

    fn adopt(&self, id: String) -> ConnectionGuard {
        self.inner.borrow_mut().insert(id.clone());
        ConnectionGuard {
            registry: self.clone(),
            id,
        }
    }

    /// Registers a tag with no owning connection, to simulate load.
    #[cfg(test)]
    pub(super) fn occupy(&self, id: &str) {
        self.inner.borrow_mut().insert(id.to_owned());
    }
}

struct ConnectionGuard {
    registry: Connections,
    id: String,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.registry.inner.borrow_mut().remove(&self.id);
    }
}

/// Everything a connection needs besides its transport and its service.
pub struct ConnectionParams {
    pub config: Arc<SystemConfig>,
    pub tls: Option<TlsContextStore>,
    pub resolver: Option<Rc<dns::Resolver>>,
    pub registry: Connections,
    /// Printable peer address, before any PROXY or XCLIENT overrides.
    pub remote_address: String,
}

/// Runs the SMTP engine over `io` until the client leaves or the transport
/// fails.
pub async fn serve_smtp(
    io: ServerIo,
    params: ConnectionParams,
    service: ServiceHandle,
) -> Result<(), Error> {
    let id: String = OsRng
        .sample_iter(&Alphanumeric)
        .take(CONNECTION_TAG_LEN)
        .map(char::from)
        .collect();
    let log_prefix =
        LogPrefix::new("smtp", params.remote_address.clone(), id.clone());
    let _guard = params.registry.adopt(id.clone());
    let over_capacity = params
        .config
        .smtp
        .max_clients
        .map_or(false, |max| params.registry.len() > max);

    let host_name = if params.config.smtp.host_name.is_empty() {
        nix::unistd::gethostname()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "localhost".to_owned())
    } else {
        params.config.smtp.host_name.clone()
    };

    info!("{} Connection established", log_prefix);

    let mut connection = Connection {
        io: BufStream::new(io.clone()),
        raw_io: io,
        config: params.config,
        tls: params.tls,
        resolver: params.resolver,
        service,
        log_prefix: log_prefix.clone(),
        host_name,
        over_capacity,

        id,
        remote_address: params.remote_address.clone(),
        client_hostname: format!("[{}]", params.remote_address),
        helo_name: None,
        user: None,
        envelope: Envelope::default(),
        wizard: false,
        transaction_counter: 0,
        xclient: BTreeMap::new(),

        secure: false,
        quit: false,
        unrecognized_count: 0,
        unauthenticated_count: 0,
    };

    match connection.run().await {
        Ok(()) => {
            info!("{} Normal client disconnect", log_prefix);
            Ok(())
        },
        Err(Error::Io(ref e))
            if io::ErrorKind::ConnectionReset == e.kind() =>
        {
            debug!("{} Connection reset by peer", log_prefix);
            Ok(())
        },
        Err(e) => {
            warn!("{} Abnormal client disconnect: {}", log_prefix, e);
            Err(e)
        },
    }
}

struct Connection {
    io: BufStream<ServerIo>,
    /// The unbuffered transport, kept so that STARTTLS can rebuild `io`
    /// without carrying over pre-handshake bytes.
    raw_io: ServerIo,
    config: Arc<SystemConfig>,
    tls: Option<TlsContextStore>,
    resolver: Option<Rc<dns::Resolver>>,
    service: ServiceHandle,
    log_prefix: LogPrefix,
    host_name: String,
    over_capacity: bool,

    id: String,
    remote_address: String,
    client_hostname: String,
    /// The lowercased argument of the most recent HELO/EHLO.
    helo_name: Option<String>,
    user: Option<AuthUser>,
    envelope: Envelope,
    wizard: bool,
    /// Number of completed DATA transactions.
    transaction_counter: u64,
    /// Keys a trusted front end has already overridden via XCLIENT. An
    /// ADDR entry makes further XCLIENT commands one-shot-expired.
    xclient: BTreeMap<String, String>,

    secure: bool,
    quit: bool,
    unrecognized_count: u32,
    unauthenticated_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResponseKind {
    /// The last in a series of responses. Forces a flush.
    Final,
    /// A non-final response that is safe to buffer.
    Delayable,
}

impl ResponseKind {
    fn or_final(self, phinal: bool) -> Self {
        if phinal {
            ResponseKind::Final
        } else {
            self
        }
    }

    fn indicator(self) -> char {
        match self {
            Final => ' ',
            Delayable => '-',
        }
    }
}

use self::ResponseKind::*;

enum LineRead {
    Line,
    TooLong,
    TimedOut,
}

impl Connection {
    async fn run(&mut self) -> Result<(), Error> {
        if self.over_capacity {
            let quip = format!(
                "{} Too many connected clients, try again in a moment",
                self.host_name,
            );
            warn!("{} Connection limit reached", self.log_prefix);
            return self
                .send_response(Final, pc::ServiceNotAvailableClosing, &quip)
                .await;
        }

        if self.config.smtp.expect_proxy {
            if !self.read_proxy_header().await? {
                return Ok(());
            }
        }

        if self.config.smtp.implicit_tls {
            if !self.start_tls_handshake().await? {
                return Ok(());
            }
        }

        if !self.config.smtp.expect_proxy && !self.wait_out_grace().await? {
            return Ok(());
        }

        self.client_hostname = self.resolve_client_hostname().await;

        let connect = ConnectRequest {
            session: self.session(),
        };
        if !self
            .service_request(
                RequestPayload::Connect(connect),
                pc::TransactionFailed,
            )
            .await?
        {
            return Ok(());
        }

        self.send_greeting().await?;

        let mut buffer = Vec::new();
        while !self.quit {
            self.run_command(&mut buffer).await?;
        }

        Ok(())
    }

    /// Consumes and validates the PROXY protocol v1 header that a trusting
    /// front end prepends to the stream.
    ///
    /// Returns false when the connection should be dropped.
    async fn read_proxy_header(&mut self) -> Result<bool, Error> {
        let mut buffer = Vec::new();
        match self.read_command_line(&mut buffer).await? {
            LineRead::Line => {},
            LineRead::TooLong => {
                self.send_response(
                    Final,
                    pc::CommandSyntaxError,
                    "Invalid PROXY header",
                )
                .await?;
                return Ok(false);
            },
            LineRead::TimedOut => {
                self.send_response(
                    Final,
                    pc::ActionAborted,
                    "Timeout - closing connection",
                )
                .await?;
                return Ok(false);
            },
        }

        let header = str::from_utf8(&buffer[..buffer.len() - 2]).ok();
        let mut tokens =
            header.unwrap_or("").split_ascii_whitespace();
        if Some("PROXY") != tokens.next() {
            warn!("{} Bad PROXY header", self.log_prefix);
            self.send_response(
                Final,
                pc::CommandSyntaxError,
                "Invalid PROXY header",
            )
            .await?;
            return Ok(false);
        }

        // PROXY <protocol> <source> <dest> <sport> <dport>
        let _protocol = tokens.next();
        if let Some(source) = tokens.next() {
            let source = source.to_ascii_lowercase();
            info!(
                "{} PROXY header reports source {}",
                self.log_prefix, source,
            );
            self.remote_address = source.clone();
            self.log_prefix.set_peer(source);
        }

        Ok(true)
    }

    /// Watches the stream for the early-talker grace period.
    ///
    /// A client with bytes on the wire before we ever spoke is not waiting
    /// for our banner and gets told off. Returns false when the connection
    /// should be dropped.
    async fn wait_out_grace(&mut self) -> Result<bool, Error> {
        match tokio::time::timeout(EARLY_TALKER_GRACE, self.io.fill_buf())
            .await
        {
            Err(_elapsed) => Ok(true),
            Ok(Ok([])) => {
                // Connected and hung up; nothing to say to them.
                Ok(false)
            },
            Ok(Ok(_)) => {
                warn!("{} Talked before the banner", self.log_prefix);
                let quip = format!("{} You talk too soon", self.host_name);
                self.send_response(
                    Final,
                    pc::ServiceNotAvailableClosing,
                    &quip,
                )
                .await?;
                Ok(false)
            },
            Ok(Err(e)) => Err(e.into()),
        }
    }

    async fn resolve_client_hostname(&self) -> String {
        if let (Some(resolver), Ok(ip)) = (
            self.resolver.as_ref(),
            self.remote_address.parse::<IpAddr>(),
        ) {
            if let Some(name) = dns::reverse_hostname(resolver, ip).await {
                return name;
            }
        }

        format!("[{}]", self.remote_address)
    }

    async fn run_command(&mut self, buffer: &mut Vec<u8>) -> Result<(), Error> {
        buffer.clear();
        match self.read_command_line(buffer).await? {
            LineRead::Line => {},
            LineRead::TooLong => {
                return self
                    .send_response(
                        Final,
                        pc::CommandSyntaxError,
                        "Error: command line too long",
                    )
                    .await;
            },
            LineRead::TimedOut => {
                self.send_response(
                    Final,
                    pc::ActionAborted,
                    "Timeout - closing connection",
                )
                .await?;
                self.quit = true;
                return Ok(());
            },
        }

        let line = &buffer[..buffer.len() - 2];
        if line.contains(&0) {
            warn!(
                "{} Remote is speaking binary, closing connection",
                self.log_prefix,
            );
            self.quit = true;
            return Ok(());
        }

        let Ok(command_line) = str::from_utf8(line) else {
            return self
                .send_response(
                    Final,
                    pc::CommandSyntaxError,
                    "Error: Malformed UTF-8",
                )
                .await;
        };

        if looks_like_http(command_line) {
            warn!("{} HTTP request on SMTP port", self.log_prefix);
            self.send_response(
                Final,
                pc::TransactionFailed,
                "HTTP requests not allowed",
            )
            .await?;
            self.quit = true;
            return Ok(());
        }

        let verb = command_verb(command_line);
        if !self.handler_enabled(&verb) {
            self.unrecognized_count += 1;
            if self.unrecognized_count >= UNRECOGNIZED_LIMIT {
                warn!(
                    "{} Disconnecting after {} unrecognized commands",
                    self.log_prefix, self.unrecognized_count,
                );
                self.send_response(
                    Final,
                    pc::TransactionFailed,
                    "Error: too many unrecognized commands",
                )
                .await?;
                self.quit = true;
            } else {
                self.send_response(
                    Final,
                    pc::CommandSyntaxError,
                    "Error: command not recognized",
                )
                .await?;
            }
            return Ok(());
        }

        if self.auth_enabled() && "AUTH" != verb && self.user.is_none() {
            self.unauthenticated_count += 1;
            if self.unauthenticated_count >= UNAUTHENTICATED_LIMIT {
                warn!(
                    "{} Disconnecting after {} unauthenticated commands",
                    self.log_prefix, self.unauthenticated_count,
                );
                self.send_response(
                    Final,
                    pc::TransactionFailed,
                    "Error: too many unauthenticated commands",
                )
                .await?;
                self.quit = true;
                return Ok(());
            }
            // The counter only gates disconnection; dispatch proceeds.
        }

        if matches!(verb.as_str(), "MAIL" | "RCPT" | "DATA" | "AUTH")
            && self.helo_name.is_none()
        {
            return self
                .send_response(
                    Final,
                    pc::BadSequenceOfCommands,
                    "Error: send HELO/EHLO first",
                )
                .await;
        }

        if matches!(verb.as_str(), "MAIL" | "RCPT" | "DATA")
            && self.auth_enabled()
            && self.user.is_none()
        {
            return self
                .send_response(
                    Final,
                    pc::AuthenticationRequired,
                    "Error: authentication Required",
                )
                .await;
        }

        match verb.as_str() {
            "EHLO" => self.cmd_helo(true, command_line).await,
            "HELO" => self.cmd_helo(false, command_line).await,
            "MAIL" => self.cmd_mail(command_line).await,
            "RCPT" => self.cmd_rcpt(command_line).await,
            "DATA" => self.cmd_data().await,
            "RSET" => self.cmd_rset().await,
            "NOOP" => self.cmd_noop().await,
            "HELP" => self.cmd_help().await,
            "VRFY" => self.cmd_vrfy().await,
            "QUIT" => self.cmd_quit().await,
            "AUTH" => self.cmd_auth(command_line).await,
            "STARTTLS" => self.cmd_starttls().await,
            "XCLIENT" => self.cmd_xclient(command_line).await,
            "WIZ" => self.cmd_wiz().await,
            "SHELL" => self.cmd_shell().await,
            "KILL" => self.cmd_kill().await,
            _ => unreachable!("verb table out of sync with dispatch"),
        }
    }

    /// Accumulates one CRLF-terminated line into `buffer`.
    ///
    /// A bare CR or LF does not terminate the line; it is carried as part
    /// of the content until a proper CRLF arrives or the length cap trips.
    async fn read_command_line(
        &mut self,
        buffer: &mut Vec<u8>,
    ) -> Result<LineRead, Error> {
        let idle = Duration::from_millis(self.config.smtp.socket_timeout_ms);

        loop {
            let len_before = buffer.len();
            match tokio::time::timeout(
                idle,
                (&mut self.io)
                    .take((MAX_LINE - buffer.len()) as u64)
                    .read_until(b'\n', buffer),
            )
            .await
            {
                Err(_elapsed) => return Ok(LineRead::TimedOut),
                Ok(result) => {
                    result?;
                },
            }

            if buffer.len() == len_before {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    if buffer.is_empty() {
                        "EOF reached at start of command"
                    } else {
                        "EOF reached within command"
                    },
                )));
            }

            if buffer.ends_with(b"\r\n") {
                return Ok(LineRead::Line);
            }

            if buffer.len() >= MAX_LINE {
                // Skip the rest of the oversized line.
                loop {
                    buffer.clear();
                    match tokio::time::timeout(
                        idle,
                        (&mut self.io)
                            .take(MAX_LINE as u64)
                            .read_until(b'\n', buffer),
                    )
                    .await
                    {
                        Err(_elapsed) => return Ok(LineRead::TimedOut),
                        Ok(result) => {
                            if 0 == result? {
                                return Err(Error::Io(io::Error::new(
                                    io::ErrorKind::UnexpectedEof,
                                    "EOF reached within command",
                                )));
                            }
                        },
                    }

                    if buffer.ends_with(b"\n") {
                        break;
                    }
                }

                buffer.clear();
                return Ok(LineRead::TooLong);
            }
        }
    }

    async fn cmd_helo(
        &mut self,
        extended: bool,
        line: &str,
    ) -> Result<(), Error> {
        let mut tokens = line.split_ascii_whitespace();
        let _verb = tokens.next();
        let (Some(origin), None) = (tokens.next(), tokens.next()) else {
            let quip = if extended {
                "Error: syntax: EHLO hostname"
            } else {
                "Error: syntax: HELO hostname"
            };
            return self
                .send_response(Final, pc::ParameterSyntaxError, quip)
                .await;
        };

        self.helo_name = Some(origin.to_ascii_lowercase());
        self.reset_session();
        info!(
            "{} {} from {}",
            self.log_prefix,
            if extended { "EHLO" } else { "HELO" },
            origin,
        );

        let greeting = format!("OK: Nice to meet you {}", self.client_hostname);
        if !extended {
            return self.send_response(Final, pc::Ok, &greeting).await;
        }

        let mut lines = vec![
            greeting,
            "PIPELINING".to_owned(),
            "8BITMIME".to_owned(),
            "SMTPUTF8".to_owned(),
        ];
        let mechanisms = self.mechanism_names();
        if !mechanisms.is_empty() {
            lines.push(format!("AUTH {}", mechanisms.join(" ")));
        }
        if self.starttls_advertised() {
            lines.push("STARTTLS".to_owned());
        }
        if let Some(size) = self.config.smtp.max_message_size {
            lines.push(format!("SIZE {}", size));
        }
        if self.xclient_advertised() {
            lines.push("XCLIENT NAME ADDR PORT PROTO HELO LOGIN".to_owned());
        }

        let count = lines.len();
        for (ix, feature) in lines.iter().enumerate() {
            self.send_response(
                Delayable.or_final(ix + 1 == count),
                pc::Ok,
                feature,
            )
            .await?;
        }

        Ok(())
    }

    async fn cmd_mail(&mut self, line: &str) -> Result<(), Error> {
        let Some(parsed) = parse_address_command("MAIL FROM", line) else {
            return self
                .send_response(
                    Final,
                    pc::ParameterSyntaxError,
                    "Error: command parse failure",
                )
                .await;
        };

        if self.envelope.mail_from.is_some() {
            return self
                .send_response(
                    Final,
                    pc::BadSequenceOfCommands,
                    "Error: nested MAIL command",
                )
                .await;
        }

        if let (Some(max), Some(declared)) = (
            self.config.smtp.max_message_size,
            parsed.args.get("SIZE").and_then(|v| v.parse::<u64>().ok()),
        ) {
            if declared > max {
                return self
                    .send_response(
                        Final,
                        pc::ExceededStorageAllocation,
                        "Error: message exceeds fixed maximum message size",
                    )
                    .await;
            }
        }

        let request = MailRequest {
            from: parsed.clone(),
            session: self.session(),
        };
        if !self
            .service_request(
                RequestPayload::Mail(request),
                pc::ActionNotTakenPermanent,
            )
            .await?
        {
            return Ok(());
        }

        info!(
            "{} Start mail transaction from <{}>",
            self.log_prefix, parsed.address,
        );
        self.envelope.mail_from = Some(parsed);
        self.send_response(Final, pc::Ok, "Accepted").await
    }

    async fn cmd_rcpt(&mut self, line: &str) -> Result<(), Error> {
        let parsed = parse_address_command("RCPT TO", line)
            .filter(|r| !r.address.is_empty());
        let Some(parsed) = parsed else {
            return self
                .send_response(
                    Final,
                    pc::ParameterSyntaxError,
                    "Error: command parse failure",
                )
                .await;
        };

        if self.envelope.mail_from.is_none() {
            return self
                .send_response(
                    Final,
                    pc::BadSequenceOfCommands,
                    "Error: need MAIL command",
                )
                .await;
        }

        let request = RecipientRequest {
            to: parsed.clone(),
            session: self.session(),
        };
        if !self
            .service_request(
                RequestPayload::Recipient(request),
                pc::ActionNotTakenPermanent,
            )
            .await?
        {
            return Ok(());
        }

        // A recipient repeated with different casing replaces the earlier
        // entry in place rather than growing the list.
        let existing = self
            .envelope
            .rcpt_to
            .iter()
            .position(|r| r.address.eq_ignore_ascii_case(&parsed.address));
        match existing {
            Some(ix) => self.envelope.rcpt_to[ix] = parsed,
            None => self.envelope.rcpt_to.push(parsed),
        }

        self.send_response(Final, pc::Ok, "Accepted").await
    }

    async fn cmd_data(&mut self) -> Result<(), Error> {
        if self.envelope.rcpt_to.is_empty() {
            return self
                .send_response(
                    Final,
                    pc::BadSequenceOfCommands,
                    "Error: need RCPT command",
                )
                .await;
        }

        let (service_end, mut engine_end) =
            tokio::io::duplex(DATA_PIPE_CAPACITY);
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let request = DataRequest {
            data: service_end,
            outcome: outcome_tx,
            session: self.session(),
        };
        if !self
            .service_request(
                RequestPayload::Data(request),
                pc::TransactionFailed,
            )
            .await?
        {
            return Ok(());
        }

        self.send_response(
            Final,
            pc::StartMailInput,
            "End data with <CR><LF>.<CR><LF>",
        )
        .await?;

        let copied = {
            let mut sink = DiscardOnError(&mut engine_end);
            tokio::time::timeout(
                DATA_TIMEOUT,
                copy_with_dot_unstuffing(
                    Pin::new(&mut sink),
                    Pin::new(&mut self.io),
                ),
            )
            .await
        };
        let raw_bytes = match copied {
            Ok(result) => result?,
            Err(_elapsed) => {
                self.send_response(
                    Final,
                    pc::ActionAborted,
                    "Timeout - closing connection",
                )
                .await?;
                self.quit = true;
                return Ok(());
            },
        };

        // Severing the stream is the service's end-of-data signal; it then
        // reports the disposition.
        drop(engine_end);
        let outcome = outcome_rx.await;

        let over_limit = self
            .config
            .smtp
            .max_message_size
            .map_or(false, |max| raw_bytes > max);

        match (over_limit, outcome) {
            (_, Err(_closed)) => {
                error!(
                    "{} [BUG] Service dropped the data outcome",
                    self.log_prefix,
                );
                self.send_response(
                    Final,
                    pc::ActionAborted,
                    "Error: internal server error",
                )
                .await?;
            },
            (true, Ok(_)) => {
                warn!(
                    "{} Rejecting {} byte message over size cap",
                    self.log_prefix, raw_bytes,
                );
                self.send_response(
                    Final,
                    pc::ExceededStorageAllocation,
                    "Error: message exceeds fixed maximum message size",
                )
                .await?;
            },
            (false, Ok(Ok(message))) => {
                info!(
                    "{} Completed transaction {} ({} bytes)",
                    self.log_prefix,
                    self.transaction_counter + 1,
                    raw_bytes,
                );
                self.send_numeric_response(
                    Final,
                    pc::Ok as u16,
                    message.as_deref().unwrap_or("OK: message queued"),
                )
                .await?;
            },
            (false, Ok(Err(rejection))) => {
                info!(
                    "{} Service rejected message ({} bytes)",
                    self.log_prefix, raw_bytes,
                );
                self.send_numeric_response(
                    Final,
                    rejection.code.unwrap_or(pc::TransactionFailed as u16),
                    &rejection.message,
                )
                .await?;
            },
        }

        self.transaction_counter += 1;
        self.unrecognized_count = 0;
        self.reset_session();
        Ok(())
    }

    async fn cmd_rset(&mut self) -> Result<(), Error> {
        self.reset_session();
        self.send_response(Final, pc::Ok, "Flushed").await
    }

    async fn cmd_noop(&mut self) -> Result<(), Error> {
        self.send_response(Final, pc::Ok, "OK").await
    }

    async fn cmd_help(&mut self) -> Result<(), Error> {
        self.send_response(
            Final,
            pc::HelpMessage,
            "See https://datatracker.ietf.org/doc/html/rfc5321 for details",
        )
        .await
    }

    async fn cmd_vrfy(&mut self) -> Result<(), Error> {
        self.send_response(
            Final,
            pc::CannotVerify,
            "Try to send something. No promises though",
        )
        .await
    }

    async fn cmd_quit(&mut self) -> Result<(), Error> {
        self.quit = true;
        self.send_response(Final, pc::ServiceClosing, "Bye").await
    }

    async fn cmd_starttls(&mut self) -> Result<(), Error> {
        if self.secure {
            return self
                .send_response(
                    Final,
                    pc::TransactionFailed,
                    "Error: TLS already active",
                )
                .await;
        }

        self.send_response(Final, pc::ServiceReady, "Ready to start TLS")
            .await?;

        // RFC 3207 requires the client to re-EHLO after the handshake; we
        // do not reset the session eagerly, but any helo state it sets next
        // will be post-TLS.
        self.start_tls_handshake().await?;
        Ok(())
    }

    /// Runs the server side of a TLS handshake on the raw transport,
    /// discarding anything the parser had buffered beforehand.
    ///
    /// Returns false (with `quit` set) when the handshake failed and the
    /// connection is unusable.
    async fn start_tls_handshake(&mut self) -> Result<bool, Error> {
        let Some(tls) = self.tls.clone() else {
            warn!(
                "{} TLS requested without a configured context store",
                self.log_prefix,
            );
            self.quit = true;
            return Ok(false);
        };

        // Rebuilding the buffered stream from the raw transport drops any
        // cleartext bytes the client pipelined behind the upgrade point.
        self.io = BufStream::new(self.raw_io.clone());

        info!("{} Start TLS handshake", self.log_prefix);
        match tokio::time::timeout(
            TLS_HANDSHAKE_TIMEOUT,
            self.raw_io.ssl_accept(tls.acceptor()),
        )
        .await
        {
            Ok(Ok(())) => {},
            Ok(Err(e)) => {
                warn!("{} TLS handshake failed: {}", self.log_prefix, e);
                self.quit = true;
                return Ok(false);
            },
            Err(_elapsed) => {
                warn!("{} TLS handshake timed out", self.log_prefix);
                self.quit = true;
                return Ok(false);
            },
        }

        self.secure = true;
        info!(
            "{} TLS handshake succeeded ({})",
            self.log_prefix,
            self.raw_io.tls_string().unwrap_or_default(),
        );
        Ok(true)
    }

    async fn cmd_auth(&mut self, line: &str) -> Result<(), Error> {
        let mut tokens = line.split_ascii_whitespace();
        let _verb = tokens.next();
        let Some(mechanism_name) = tokens.next() else {
            return self
                .send_response(
                    Final,
                    pc::ParameterSyntaxError,
                    "Error: syntax: AUTH mechanism",
                )
                .await;
        };
        let initial = tokens.next();

        if self.starttls_gates_auth() {
            return self
                .send_response(
                    Final,
                    pc::EncryptionRequiredForAuthentication,
                    "Error: Must issue a STARTTLS command first",
                )
                .await;
        }

        if self.user.is_some() {
            return self
                .send_response(
                    Final,
                    pc::BadSequenceOfCommands,
                    "Error: No identity changes permitted",
                )
                .await;
        }

        let configured = self
            .config
            .smtp
            .auth_methods
            .iter()
            .any(|m| m.eq_ignore_ascii_case(mechanism_name));
        let mechanism =
            sasl::Mechanism::for_name(mechanism_name).filter(|_| configured);
        let Some(mechanism) = mechanism else {
            warn!(
                "{} Rejected AUTH with mechanism {:?}",
                self.log_prefix, mechanism_name,
            );
            return self
                .send_response(
                    Final,
                    pc::CommandParameterNotImplemented,
                    "Error: Unrecognized authentication type",
                )
                .await;
        };

        let credentials = match mechanism {
            sasl::Mechanism::Plain => self.auth_plain(initial).await?,
            sasl::Mechanism::Login => self.auth_login(initial).await?,
        };
        let Some(credentials) = credentials else {
            // The mechanism flow already answered the client.
            return Ok(());
        };

        let request = AuthRequest {
            mechanism: mechanism.name().to_owned(),
            username: credentials.username.clone(),
            password: credentials.password,
            session: self.session(),
        };
        if !self
            .service_request(
                RequestPayload::Auth(request),
                pc::AuthenticationCredentialsInvalid,
            )
            .await?
        {
            return Ok(());
        }

        info!(
            "{} Authenticated as {:?}",
            self.log_prefix, credentials.username,
        );
        self.log_prefix.set_user(Some(credentials.username.clone()));
        self.user = Some(AuthUser {
            username: credentials.username,
        });
        self.send_response(
            Final,
            pc::AuthenticationSucceeded,
            "Authentication successful",
        )
        .await
    }

    async fn auth_plain(
        &mut self,
        initial: Option<&str>,
    ) -> Result<Option<sasl::Credentials>, Error> {
        let payload = match initial {
            // "=" is RFC 4954 for an empty initial response, which PLAIN
            // cannot use; challenge for the real thing.
            Some(payload) if "=" != payload => payload.to_owned(),
            _ => {
                self.send_response(Final, pc::ServerChallenge, "").await?;
                match self.read_continuation_line().await? {
                    Some(line) => line,
                    None => return Ok(None),
                }
            },
        };

        if "*" == payload {
            self.send_response(
                Final,
                pc::ParameterSyntaxError,
                "Error: authentication aborted",
            )
            .await?;
            return Ok(None);
        }

        match sasl::decode_plain(&payload) {
            Ok(credentials) => Ok(Some(credentials)),
            Err(sasl::PlainError::Encoding) => {
                self.send_response(
                    Final,
                    pc::CommandSyntaxError,
                    "Error: invalid BASE64",
                )
                .await?;
                Ok(None)
            },
            Err(sasl::PlainError::Syntax) => {
                self.send_response(
                    Final,
                    pc::CommandSyntaxError,
                    "Error: invalid SASL payload",
                )
                .await?;
                Ok(None)
            },
            Err(sasl::PlainError::AuthoriseMismatch) => {
                self.send_response(
                    Final,
                    pc::AuthenticationCredentialsInvalid,
                    "Error: authorise-id must match authenticate-id",
                )
                .await?;
                Ok(None)
            },
        }
    }

    async fn auth_login(
        &mut self,
        initial: Option<&str>,
    ) -> Result<Option<sasl::Credentials>, Error> {
        let username_payload = match initial {
            Some(payload) if "=" != payload => payload.to_owned(),
            _ => {
                self.send_response(
                    Final,
                    pc::ServerChallenge,
                    sasl::LOGIN_CHALLENGE_USERNAME,
                )
                .await?;
                match self.read_continuation_line().await? {
                    Some(line) => line,
                    None => return Ok(None),
                }
            },
        };
        let Some(username) =
            self.login_step(&username_payload).await?
        else {
            return Ok(None);
        };

        self.send_response(
            Final,
            pc::ServerChallenge,
            sasl::LOGIN_CHALLENGE_PASSWORD,
        )
        .await?;
        let Some(password_payload) = self.read_continuation_line().await?
        else {
            return Ok(None);
        };
        let Some(password) = self.login_step(&password_payload).await? else {
            return Ok(None);
        };

        Ok(Some(sasl::Credentials { username, password }))
    }

    /// Decodes one step of the LOGIN exchange, answering the client on
    /// abort or bad encoding.
    async fn login_step(
        &mut self,
        payload: &str,
    ) -> Result<Option<String>, Error> {
        if "*" == payload {
            self.send_response(
                Final,
                pc::ParameterSyntaxError,
                "Error: authentication aborted",
            )
            .await?;
            return Ok(None);
        }

        match sasl::decode_utf8(payload) {
            Some(text) => Ok(Some(text)),
            None => {
                self.send_response(
                    Final,
                    pc::CommandSyntaxError,
                    "Error: invalid BASE64",
                )
                .await?;
                Ok(None)
            },
        }
    }

    /// Reads the client's next line as SASL continuation input, outside the
    /// normal dispatch path.
    ///
    /// Returns `None` (with the client already answered) when the exchange
    /// cannot continue.
    async fn read_continuation_line(
        &mut self,
    ) -> Result<Option<String>, Error> {
        let mut buffer = Vec::new();
        match self.read_command_line(&mut buffer).await? {
            LineRead::Line => {},
            LineRead::TooLong => {
                self.send_response(
                    Final,
                    pc::CommandSyntaxError,
                    "Error: line too long",
                )
                .await?;
                return Ok(None);
            },
            LineRead::TimedOut => {
                self.send_response(
                    Final,
                    pc::ActionAborted,
                    "Timeout - closing connection",
                )
                .await?;
                self.quit = true;
                return Ok(None);
            },
        }

        match str::from_utf8(&buffer[..buffer.len() - 2]) {
            Ok(s) => Ok(Some(s.trim().to_owned())),
            Err(_) => {
                self.send_response(
                    Final,
                    pc::CommandSyntaxError,
                    "Error: Malformed UTF-8",
                )
                .await?;
                Ok(None)
            },
        }
    }

    async fn cmd_xclient(&mut self, line: &str) -> Result<(), Error> {
        // ADDR is one-shot: once a front end has rewritten the address, it
        // does not get to do so again.
        if !self.config.smtp.enable_xclient
            || self.xclient.contains_key("ADDR")
        {
            return self
                .send_response(
                    Final,
                    pc::ActionNotTakenPermanent,
                    "Error: Not allowed",
                )
                .await;
        }

        if self.envelope.mail_from.is_some() {
            return self
                .send_response(
                    Final,
                    pc::BadSequenceOfCommands,
                    "Error: MAIL transaction in progress",
                )
                .await;
        }

        static KEYS: &[&str] =
            &["NAME", "ADDR", "PORT", "PROTO", "HELO", "LOGIN"];

        // Validate every token before applying any effect, so a bad key
        // cannot leave a half-updated identity behind.
        let mut updates = Vec::<(String, Option<String>)>::new();
        let mut tokens = line.split_ascii_whitespace();
        let _verb = tokens.next();
        for token in tokens {
            let valid = token
                .split_once('=')
                .map(|(key, value)| (key.to_ascii_uppercase(), value))
                .filter(|(key, _)| KEYS.contains(&key.as_str()));
            let Some((key, value)) = valid else {
                return self
                    .send_response(
                        Final,
                        pc::ParameterSyntaxError,
                        "Error: Invalid arguments",
                    )
                    .await;
            };

            let value = if value.eq_ignore_ascii_case("[UNAVAILABLE]")
                || value.eq_ignore_ascii_case("[TEMPUNAVAIL]")
            {
                None
            } else {
                Some(value.to_owned())
            };
            updates.push((key, value));
        }

        if updates.is_empty() {
            return self
                .send_response(
                    Final,
                    pc::ParameterSyntaxError,
                    "Error: Invalid arguments",
                )
                .await;
        }

        for (key, value) in updates {
            match key.as_str() {
                "LOGIN" => match value.as_deref() {
                    Some(login) if !login.is_empty() => {
                        info!(
                            "{} XCLIENT login override: {:?}",
                            self.log_prefix, login,
                        );
                        self.log_prefix.set_user(Some(login.to_owned()));
                        self.user = Some(AuthUser {
                            username: login.to_owned(),
                        });
                    },
                    _ => {
                        self.log_prefix.set_user(None);
                        self.user = None;
                    },
                },
                "ADDR" => {
                    if let Some(addr) = value.as_deref() {
                        let addr = addr.to_ascii_lowercase();
                        info!(
                            "{} XCLIENT address override: {}",
                            self.log_prefix, addr,
                        );
                        self.remote_address = addr.clone();
                        self.log_prefix.set_peer(addr);
                        // The front end speaks for a new client now; it
                        // must introduce it with a fresh HELO/EHLO.
                        self.helo_name = None;
                    }
                },
                "NAME" => {
                    self.client_hostname = match value.as_deref() {
                        Some(name) if !name.is_empty() => name.to_owned(),
                        _ => format!("[{}]", self.remote_address),
                    };
                },
                // PORT, PROTO, and HELO are recorded but have no effect on
                // the engine.
                _ => {},
            }

            self.xclient.insert(key, value.unwrap_or_default());
        }

        self.send_greeting().await
    }

    async fn cmd_wiz(&mut self) -> Result<(), Error> {
        // Anyone who asks nicely is a wizard, faithful to the sendmail
        // lore. The flag grants nothing.
        warn!("{} WIZ", self.log_prefix);
        self.wizard = true;
        self.send_response(Final, pc::Ok, "Please pass, oh mighty wizard")
            .await
    }

    async fn cmd_shell(&mut self) -> Result<(), Error> {
        warn!("{} SHELL attempt refused", self.log_prefix);
        let quip = if self.wizard {
            "Error: this wizardry is beyond even you"
        } else {
            "Error: Mere mortals musn't mutter that mantra"
        };
        self.send_response(Final, pc::CommandSyntaxError, quip).await
    }

    async fn cmd_kill(&mut self) -> Result<(), Error> {
        warn!("{} KILL attempt refused", self.log_prefix);
        self.send_response(Final, pc::CommandSyntaxError, "Error: Can not kill Mom")
            .await
    }

    fn handler_enabled(&self, verb: &str) -> bool {
        if !VERBS.contains(&verb) {
            return false;
        }

        if "STARTTLS" == verb && self.tls.is_none() {
            return false;
        }

        !self
            .config
            .smtp
            .disabled_commands
            .iter()
            .any(|c| c.eq_ignore_ascii_case(verb))
    }

    /// The configured mechanisms we actually implement, in configuration
    /// order. Authentication is "supported" exactly when this is non-empty.
    fn mechanism_names(&self) -> Vec<&'static str> {
        self.config
            .smtp
            .auth_methods
            .iter()
            .filter_map(|name| sasl::Mechanism::for_name(name))
            .map(sasl::Mechanism::name)
            .collect()
    }

    fn auth_enabled(&self) -> bool {
        !self.mechanism_names().is_empty()
    }

    fn starttls_available(&self) -> bool {
        self.tls.is_some() && self.handler_enabled("STARTTLS")
    }

    fn starttls_advertised(&self) -> bool {
        self.starttls_available()
            && !self.secure
            && !self.config.smtp.hide_starttls
    }

    /// Whether AUTH must be refused until the transport is upgraded.
    fn starttls_gates_auth(&self) -> bool {
        self.starttls_advertised()
    }

    fn xclient_advertised(&self) -> bool {
        self.config.smtp.enable_xclient
            && self.handler_enabled("XCLIENT")
            && !self.xclient.contains_key("ADDR")
    }

    /// Snapshot of the session as the service sees it.
    fn session(&self) -> Session {
        Session {
            id: self.id.clone(),
            remote_address: self.remote_address.clone(),
            client_hostname: self.client_hostname.clone(),
            helo_name: self.helo_name.clone(),
            user: self.user.clone(),
            envelope: self.envelope.clone(),
            transaction: self.transaction_counter + 1,
            wizard: self.wizard,
        }
    }

    /// Discards the envelope, keeping the connection-scoped identity (the
    /// authenticated user included).
    fn reset_session(&mut self) {
        self.envelope = Envelope::default();
    }

    /// Sends `payload` as a request to the service and waits for its
    /// verdict.
    ///
    /// On rejection, the response (with `default_code` unless the service
    /// chose one) is sent and `false` is returned. On acceptance nothing is
    /// sent and `true` is returned.
    async fn service_request(
        &mut self,
        payload: RequestPayload,
        default_code: PrimaryCode,
    ) -> Result<bool, Error> {
        let (respond, response) = oneshot::channel();
        let sent = self
            .service
            .send(Request { payload, respond })
            .await
            .is_ok();
        let result = if sent { response.await.ok() } else { None };

        let Some(result) = result else {
            error!("{} [BUG] Service worker disappeared", self.log_prefix);
            self.send_response(
                Final,
                pc::ServiceNotAvailableClosing,
                "Error: internal server error",
            )
            .await?;
            self.quit = true;
            return Ok(false);
        };

        match result {
            Ok(()) => Ok(true),
            Err(rejection) => {
                self.send_numeric_response(
                    Final,
                    rejection.code.unwrap_or(default_code as u16),
                    &rejection.message,
                )
                .await?;
                Ok(false)
            },
        }
    }

    async fn send_greeting(&mut self) -> Result<(), Error> {
        let mut banner = format!("{} ESMTP", self.host_name);
        if let Some(ref extra) = self.config.smtp.banner {
            banner.push(' ');
            banner.push_str(extra);
        }

        self.send_response(Final, pc::ServiceReady, &banner).await
    }

    async fn send_response(
        &mut self,
        kind: ResponseKind,
        code: PrimaryCode,
        quip: &str,
    ) -> Result<(), Error> {
        self.send_numeric_response(kind, code as u16, quip).await
    }

    async fn send_numeric_response(
        &mut self,
        kind: ResponseKind,
        code: u16,
        quip: &str,
    ) -> Result<(), Error> {
        use std::fmt::Write as _;

        let mut s = String::new();
        let _ = write!(s, "{}{}{}\r\n", code, kind.indicator(), quip);
        self.io.write_all(s.as_bytes()).await?;
        if let Final = kind {
            self.io.flush().await?;
        }

        Ok(())
    }
}

/// Wraps `DuplexStream` to silently succeed and consume all data on any
/// error, so that a service which stops reading early does not abort the
/// protocol-mandated drain of the message body.
struct DiscardOnError<'a>(&'a mut DuplexStream);

impl tokio::io::AsyncWrite for DiscardOnError<'_> {
    fn poll_write(
        self: Pin<&mut Self>,
        ctx: &mut task::Context<'_>,
        buf: &[u8],
    ) -> task::Poll<io::Result<usize>> {
        match Pin::new(&mut *self.get_mut().0).poll_write(ctx, buf) {
            task::Poll::Ready(Err(_)) => task::Poll::Ready(Ok(buf.len())),
            poll => poll,
        }
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        ctx: &mut task::Context<'_>,
    ) -> task::Poll<io::Result<()>> {
        Pin::new(&mut *self.get_mut().0).poll_flush(ctx)
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        ctx: &mut task::Context<'_>,
    ) -> task::Poll<io::Result<()>> {
        Pin::new(&mut *self.get_mut().0).poll_shutdown(ctx)
    }
}

/// Copies the DATA payload from `src` to `dst`, stripping dot stuffing and
/// consuming up to and including the terminating `.` line. Returns the raw
/// payload byte count as received, before unstuffing and excluding the
/// terminator.
///
/// To be binary-safe, CRLFs are handled strictly: a lone LF is not a line
/// ending, so the sequence `\n.\n` may occur inside a message body and is
/// passed through as content. A bare `.` line with a UNIX ending is still
/// accepted as the terminator since it cannot be valid content.
async fn copy_with_dot_unstuffing(
    mut dst: Pin<&mut impl AsyncWriteExt>,
    mut src: Pin<&mut impl AsyncBufReadExt>,
) -> io::Result<u64> {
    // Whether the next read is reading from the start of a line; true at
    // the beginning of the payload and after each CRLF.
    let mut start_of_line = true;
    // Whether the last read ended with CR, so that a following lone "\n"
    // still counts as a line ending.
    let mut has_trailing_cr = false;
    let mut raw_bytes = 0u64;

    loop {
        let mut src_buffer = src.as_mut();
        let mut buffer = src_buffer.fill_buf().await?;

        if buffer.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "EOF encountered in DATA payload",
            ));
        }

        if let Some(eol) = memchr::memchr(b'\n', buffer) {
            buffer = &buffer[..=eol];
        }

        let buffer_len = buffer.len();

        if start_of_line {
            if b".\r\n" == buffer || b".\n" == buffer {
                // End of content
                src.as_mut().consume(buffer_len);
                break;
            }

            if b".\r" == buffer {
                // Maybe end of content, if we can get a \n next.
                src.as_mut().consume(buffer_len);

                let mut extra = [0u8; 1];
                src.as_mut().read_exact(&mut extra).await?;
                if b'\n' == extra[0] {
                    // End of content
                    break;
                }

                // Not the terminator. The isolated . at the start of the
                // line is illegal, so whether we include it is moot; pass
                // the CR through.
                raw_bytes += 2 + 1;
                dst.write_all(b"\r").await?;
                dst.write_all(&extra).await?;
                has_trailing_cr = b'\r' == extra[0];
                start_of_line = false;
                continue;
            }

            if b"." == buffer {
                // Could be end of content or a stuffed dot.
                src.as_mut().consume(buffer_len);

                let mut extra = [0u8; 2];
                src.as_mut().read_exact(&mut extra[..1]).await?;

                if b'\n' == extra[0] {
                    // ".\n"; treat like the terminator above.
                    break;
                }

                src.as_mut().read_exact(&mut extra[1..]).await?;

                if b"\r\n" == &extra {
                    // End of content
                    break;
                }

                // A stuffed dot (or garbage); either way the leading '.'
                // is dropped. We know extra[0] is not '\n', so the only
                // possible line ending is at the end of `extra`.
                raw_bytes += 1 + 2;
                dst.write_all(&extra).await?;
                has_trailing_cr = extra.ends_with(b"\r");
                start_of_line = false;
                continue;
            }
        }

        // Everything in the buffer is content, except possibly a leading
        // stuffed dot.
        let line_contents = if b'.' == buffer[0] && start_of_line {
            &buffer[1..]
        } else {
            buffer
        };
        dst.write_all(line_contents).await?;
        raw_bytes += buffer_len as u64;

        start_of_line = buffer.ends_with(b"\r\n")
            || (b"\n" == buffer && has_trailing_cr);
        has_trailing_cr = buffer.ends_with(b"\r");
        src.as_mut().consume(buffer_len);
    }

    Ok(raw_bytes)
}
