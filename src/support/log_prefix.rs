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

use std::fmt;
use std::sync::{Arc, Mutex};

/// Tracks text that should be included at the start of every log statement
/// for a connection.
///
/// The prefix carries the protocol, the peer address as currently believed
/// (XCLIENT and PROXY can change it mid-connection), the random connection
/// tag used for log correlation, and the authenticated user once there is
/// one.
///
/// Clones of a `LogPrefix` share the same underlying data.
#[derive(Clone)]
pub struct LogPrefix {
    inner: Arc<Mutex<Inner>>,
}

struct Inner {
    protocol: &'static str,
    peer: String,
    tag: String,
    user: Option<String>,
}

impl LogPrefix {
    pub fn new(protocol: &'static str, peer: String, tag: String) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                protocol,
                peer,
                tag,
                user: None,
            })),
        }
    }

    pub fn set_peer(&self, peer: String) {
        self.inner.lock().unwrap().peer = peer;
    }

    pub fn set_user(&self, user: Option<String>) {
        self.inner.lock().unwrap().user = user;
    }
}

impl fmt::Display for LogPrefix {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let inner = self.inner.lock().unwrap();
        write!(f, "{}:{}/{}", inner.protocol, inner.peer, inner.tag)?;
        if let Some(ref user) = inner.user {
            write!(f, "[{}]", user)?;
        }

        Ok(())
    }
}
