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

//! The server side of the SMTP protocol: one cooperative task per accepted
//! connection, talking to an application-defined service through the
//! [`bridge`] channel types.

pub mod bridge;
mod sasl;
mod server;

#[cfg(test)]
mod integration_test_common;

pub use server::{serve_smtp, ConnectionParams, Connections};
