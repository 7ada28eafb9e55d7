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

//! The "bridge" between the connection engine and the application service
//! that decides what mail to accept.
//!
//! The engine and the service are modelled as separate actors so that each
//! service can be a single async function, which gives flexibility in
//! streaming the delivered message body. Data passed from the engine to the
//! service are "requests"; data passed the other way are "responses". The
//! engine issues at most one request at a time, and never delivers the next
//! client command before the current request has been answered.
//!
//! Each request carries a [`Session`] snapshot taken at the moment of the
//! callout. The service never mutates connection state directly; it only
//! answers requests.

use tokio::sync::{mpsc, oneshot};

use crate::smtp::syntax::AddressRecord;

/// A veto from the service.
///
/// `code` overrides the engine's per-command default response code when
/// present; `message` is used verbatim as the response text.
#[derive(Clone, Debug)]
pub struct Rejection {
    pub code: Option<u16>,
    pub message: String,
}

impl Rejection {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
        }
    }

    pub fn with_code(code: u16, message: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            message: message.into(),
        }
    }
}

pub type HookResult = Result<(), Rejection>;

/// The final disposition of a mail transaction. `Ok(Some(text))` replaces
/// the stock `OK: message queued` response text.
pub type DataResult = Result<Option<String>, Rejection>;

pub struct Request {
    pub payload: RequestPayload,
    /// The channel on which the primary response is sent.
    pub respond: oneshot::Sender<HookResult>,
}

pub enum RequestPayload {
    /// Gate for accepting the connection at all, issued before the banner.
    /// A rejection is sent with code `554` by default and closes the
    /// connection.
    Connect(ConnectRequest),
    /// Credentials collected by a SASL mechanism. Default rejection code
    /// `535`.
    Auth(AuthRequest),
    /// A `MAIL FROM` command. Default rejection code `550`.
    Mail(MailRequest),
    /// An `RCPT TO` command. Default rejection code `550`.
    Recipient(RecipientRequest),
    /// The start of the message data. Default rejection code `554`.
    Data(DataRequest),
}

pub struct ConnectRequest {
    pub session: Session,
}

pub struct AuthRequest {
    pub mechanism: String,
    pub username: String,
    pub password: String,
    pub session: Session,
}

pub struct MailRequest {
    pub from: AddressRecord,
    pub session: Session,
}

pub struct RecipientRequest {
    pub to: AddressRecord,
    pub session: Session,
}

/// The start of the message data.
///
/// Upon receiving `DataRequest`, the service immediately answers the
/// request's `respond` channel; a rejection there is sent instead of the
/// `354` go-ahead.
///
/// After accepting, the service consumes `data` until EOF (the engine severs
/// the stream at the terminating `.` line, after dot-unstuffing) and then
/// reports the transaction's disposition on `outcome`. The engine sends the
/// final response only once both the stream has ended and `outcome` has
/// resolved. Dropping `outcome` unanswered is reported to the client as an
/// internal server error.
pub struct DataRequest {
    pub data: tokio::io::DuplexStream,
    pub outcome: oneshot::Sender<DataResult>,
    pub session: Session,
}

/// A snapshot of the connection-scoped identity and the mail transaction in
/// progress, as passed to the service with each request.
#[derive(Clone, Debug)]
pub struct Session {
    /// Random tag identifying the connection in logs.
    pub id: String,
    /// The peer address as currently believed. XCLIENT and PROXY headers
    /// can replace it.
    pub remote_address: String,
    /// The reverse-resolved peer name, or `[<remote_address>]`.
    pub client_hostname: String,
    /// The lowercased argument of the most recent HELO/EHLO.
    pub helo_name: Option<String>,
    /// The authenticated identity. Survives RSET and HELO/EHLO;
    /// authentication is connection-scoped, not transaction-scoped.
    pub user: Option<AuthUser>,
    pub envelope: Envelope,
    /// 1-based ordinal of the transaction this session describes.
    pub transaction: u64,
    /// Set by the WIZ stub. Grants nothing.
    pub wizard: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthUser {
    pub username: String,
}

#[derive(Clone, Debug, Default)]
pub struct Envelope {
    pub mail_from: Option<AddressRecord>,
    pub rcpt_to: Vec<AddressRecord>,
}

/// The sending half of the service channel, as held by the engine.
pub type ServiceHandle = mpsc::Sender<Request>;
