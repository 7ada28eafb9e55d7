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

//! Payload handling for the implemented SASL mechanisms.
//!
//! The wire choreography (334 challenges, abort, the continuation lines)
//! lives with the AUTH handler; this module only understands the encoded
//! payloads.

/// The SASL mechanisms this server implements. A mechanism listed in
/// `auth_methods` but not present here is never advertised and is answered
/// with 504.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) enum Mechanism {
    Plain,
    Login,
}

impl Mechanism {
    pub(super) fn for_name(name: &str) -> Option<Self> {
        if name.eq_ignore_ascii_case("PLAIN") {
            Some(Mechanism::Plain)
        } else if name.eq_ignore_ascii_case("LOGIN") {
            Some(Mechanism::Login)
        } else {
            None
        }
    }

    pub(super) fn name(self) -> &'static str {
        match self {
            Mechanism::Plain => "PLAIN",
            Mechanism::Login => "LOGIN",
        }
    }
}

/// Base64 of `Username:`, the first LOGIN challenge.
pub(super) const LOGIN_CHALLENGE_USERNAME: &str = "VXNlcm5hbWU6";
/// Base64 of `Password:`, the second LOGIN challenge.
pub(super) const LOGIN_CHALLENGE_PASSWORD: &str = "UGFzc3dvcmQ6";

#[derive(Clone, Debug, PartialEq, Eq)]
pub(super) struct Credentials {
    pub(super) username: String,
    pub(super) password: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) enum PlainError {
    /// Not decodable as base64-wrapped UTF-8.
    Encoding,
    /// Wrong number of NUL-separated fields.
    Syntax,
    /// RFC 2595 allows an authorise-id distinct from the authenticate-id;
    /// we do not support acting on someone else's behalf.
    AuthoriseMismatch,
}

/// Decodes an RFC 2595 PLAIN payload,
/// `<authorise-id> NUL <authenticate-id> NUL <password>`.
///
/// `<authorise-id>` is optional if it is the same as `<authenticate-id>`.
pub(super) fn decode_plain(b64: &str) -> Result<Credentials, PlainError> {
    let data = decode_utf8(b64).ok_or(PlainError::Encoding)?;

    let mut parts = data.split('\x00');
    let (Some(authorise), Some(authenticate), Some(password), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(PlainError::Syntax);
    };

    if !authorise.is_empty() && authorise != authenticate {
        return Err(PlainError::AuthoriseMismatch);
    }

    Ok(Credentials {
        username: authenticate.to_owned(),
        password: password.to_owned(),
    })
}

/// Decodes one base64 line into UTF-8 text, as used by the LOGIN steps.
pub(super) fn decode_utf8(b64: &str) -> Option<String> {
    base64::decode(b64.trim())
        .ok()
        .and_then(|d| String::from_utf8(d).ok())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn mechanism_lookup() {
        assert_eq!(Some(Mechanism::Plain), Mechanism::for_name("plain"));
        assert_eq!(Some(Mechanism::Login), Mechanism::for_name("LOGIN"));
        assert_eq!(None, Mechanism::for_name("CRAM-MD5"));
        assert_eq!(None, Mechanism::for_name(""));
    }

    #[test]
    fn plain_decoding() {
        assert_eq!(
            Ok(Credentials {
                username: "azure".to_owned(),
                password: "hunter2".to_owned(),
            }),
            decode_plain(&base64::encode("\x00azure\x00hunter2")),
        );
        // Matching explicit authorise-id is fine
        assert_eq!(
            Ok(Credentials {
                username: "azure".to_owned(),
                password: "hunter2".to_owned(),
            }),
            decode_plain(&base64::encode("azure\x00azure\x00hunter2")),
        );
        assert_eq!(
            Err(PlainError::AuthoriseMismatch),
            decode_plain(&base64::encode("gir\x00azure\x00hunter2")),
        );
        assert_eq!(
            Err(PlainError::Syntax),
            decode_plain(&base64::encode("azure")),
        );
        assert_eq!(
            Err(PlainError::Syntax),
            decode_plain(&base64::encode("a\x00b\x00c\x00d")),
        );
        assert_eq!(Err(PlainError::Encoding), decode_plain("!!!not-base64"));
        assert_eq!(
            Err(PlainError::Encoding),
            decode_plain(&base64::encode(b"\xff\x00\xfe\x00\xfd")),
        );
    }

    #[test]
    fn login_challenges_spell_what_they_say() {
        assert_eq!(
            "Username:",
            decode_utf8(LOGIN_CHALLENGE_USERNAME).unwrap(),
        );
        assert_eq!(
            "Password:",
            decode_utf8(LOGIN_CHALLENGE_PASSWORD).unwrap(),
        );
    }
}
