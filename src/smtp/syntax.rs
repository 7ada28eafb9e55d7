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

use lazy_static::lazy_static;
use regex::Regex;

/// A parsed `MAIL FROM`/`RCPT TO` path together with its ESMTP parameters.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AddressRecord {
    /// The mailbox, with the domain part decoded to Unicode. Empty for the
    /// null return path `<>`.
    pub address: String,
    /// Parameters with uppercased keys. A parameter given without `=value`
    /// maps to the string `"true"`.
    pub args: BTreeMap<String, String>,
}

lazy_static! {
    static ref RX_HTTP: Regex = Regex::new(
        r"(?i)^(OPTIONS|GET|HEAD|POST|PUT|DELETE|TRACE|CONNECT) /.* HTTP/\d\.\d$"
    )
    .unwrap();
    static ref RX_PATH: Regex = Regex::new("^<[^<>]*>$").unwrap();
}

/// Whether the line is a browser or proxy speaking HTTP at us.
pub fn looks_like_http(line: &str) -> bool {
    RX_HTTP.is_match(line)
}

/// The first whitespace-delimited token of the line, uppercased.
pub fn command_verb(line: &str) -> String {
    line.split_ascii_whitespace()
        .next()
        .unwrap_or("")
        .to_ascii_uppercase()
}

/// Parses an address-bearing command (`MAIL FROM:<...> PARAM ...` or
/// `RCPT TO:<...> PARAM ...`).
///
/// `expected_verb` is the full verb before the colon, e.g. `"MAIL FROM"`.
/// Returns `None` if the line is not a well-formed instance of that verb;
/// the caller turns that into a 501.
pub fn parse_address_command(
    expected_verb: &str,
    line: &str,
) -> Option<AddressRecord> {
    let (verb, rest) = line.split_once(':')?;
    if verb.trim().to_ascii_uppercase()
        != expected_verb.to_ascii_uppercase()
    {
        return None;
    }

    let mut tokens = rest.split_ascii_whitespace();
    let path = tokens.next()?;
    if !RX_PATH.is_match(path) {
        return None;
    }

    let address = decode_path(&path[1..path.len() - 1])?;

    let mut args = BTreeMap::new();
    for param in tokens {
        match param.split_once('=') {
            Some((key, value)) => {
                args.insert(key.to_ascii_uppercase(), value.to_owned());
            },
            None => {
                args.insert(param.to_ascii_uppercase(), "true".to_owned());
            },
        }
    }

    Some(AddressRecord { address, args })
}

/// Validates the bracket-stripped path and decodes its domain from punycode
/// to Unicode.
///
/// The empty path is valid (null return path). A non-empty path must be
/// exactly `local@domain` with both parts non-empty.
fn decode_path(path: &str) -> Option<String> {
    if path.is_empty() {
        return Some(String::new());
    }

    let (local, domain) = path.split_once('@')?;
    if local.is_empty() || domain.is_empty() || domain.contains('@') {
        return None;
    }

    // Tolerant decoding: an undecodable label is carried through in the
    // form the client sent it.
    let (domain, _errors) = idna::domain_to_unicode(domain);
    Some(format!("{}@{}", local, domain))
}

#[cfg(test)]
mod test {
    use super::*;

    fn args(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|&(k, v)| (k.to_owned(), v.to_owned()))
            .collect()
    }

    #[test]
    fn verb_extraction() {
        assert_eq!("EHLO", command_verb("ehlo mail.example.com"));
        assert_eq!("MAIL", command_verb("Mail FROM:<a@b>"));
        assert_eq!("QUIT", command_verb("  QUIT"));
        assert_eq!("", command_verb(""));
        assert_eq!("", command_verb("   "));
    }

    #[test]
    fn http_trap() {
        assert!(looks_like_http("GET / HTTP/1.0"));
        assert!(looks_like_http("get /index.html HTTP/1.1"));
        assert!(looks_like_http("POST /wp-login.php HTTP/1.1"));
        assert!(looks_like_http("CONNECT /tunnel HTTP/1.0"));
        assert!(looks_like_http("PUT /../../etc/passwd HTTP/1.2"));

        assert!(!looks_like_http("EHLO get.example.com"));
        assert!(!looks_like_http("GET lost"));
        assert!(!looks_like_http("GET / HTTP/1.0 extra"));
        // Requires the absolute-path form
        assert!(!looks_like_http("GET http://x/ HTTP/1.0"));
    }

    #[test]
    fn address_command_parsing() {
        assert_eq!(
            Some(AddressRecord {
                address: "a@b".to_owned(),
                args: args(&[("SIZE", "123")]),
            }),
            parse_address_command("MAIL FROM", "MAIL FROM:<a@b> SIZE=123"),
        );
        assert_eq!(
            Some(AddressRecord {
                address: "foo@bar.com".to_owned(),
                args: BTreeMap::new(),
            }),
            parse_address_command("MAIL FROM", "mail from:<foo@bar.com>"),
        );
        // Null return path
        assert_eq!(
            Some(AddressRecord {
                address: String::new(),
                args: BTreeMap::new(),
            }),
            parse_address_command("MAIL FROM", "MAIL FROM:<>"),
        );
        // A parameter with no value becomes the sentinel "true"; keys are
        // uppercased, values are not.
        assert_eq!(
            Some(AddressRecord {
                address: "a@b".to_owned(),
                args: args(&[
                    ("BODY", "8bitmime"),
                    ("FOO", "true"),
                    ("RET", ""),
                ]),
            }),
            parse_address_command(
                "MAIL FROM",
                "MAIL FROM:<a@b> body=8bitmime foo RET=",
            ),
        );
        // The value keeps any later '=' characters
        assert_eq!(
            Some(AddressRecord {
                address: "a@b".to_owned(),
                args: args(&[("AUTH", "dGVzdA==")]),
            }),
            parse_address_command(
                "MAIL FROM",
                "MAIL FROM:<a@b> auth=dGVzdA==",
            ),
        );

        // Punycode domains come out as Unicode
        assert_eq!(
            Some(AddressRecord {
                address: "post@bücher.example".to_owned(),
                args: BTreeMap::new(),
            }),
            parse_address_command(
                "RCPT TO",
                "RCPT TO:<post@xn--bcher-kva.example>",
            ),
        );

        // RCPT TO:<> parses; the empty address is the handler's problem
        assert_eq!(
            Some(AddressRecord {
                address: String::new(),
                args: BTreeMap::new(),
            }),
            parse_address_command("RCPT TO", "RCPT TO:<>"),
        );

        // Wrong verb
        assert_eq!(
            None,
            parse_address_command("RCPT TO", "MAIL FROM:<a@b>"),
        );
        // Missing colon / missing brackets / malformed paths
        assert_eq!(None, parse_address_command("MAIL FROM", "MAIL FROM"));
        assert_eq!(
            None,
            parse_address_command("MAIL FROM", "MAIL FROM:a@b"),
        );
        assert_eq!(
            None,
            parse_address_command("MAIL FROM", "MAIL FROM:<a@b"),
        );
        assert_eq!(
            None,
            parse_address_command("MAIL FROM", "MAIL FROM:<<a@b>>"),
        );
        assert_eq!(
            None,
            parse_address_command("MAIL FROM", "MAIL FROM:<ab>"),
        );
        assert_eq!(
            None,
            parse_address_command("MAIL FROM", "MAIL FROM:<@b>"),
        );
        assert_eq!(
            None,
            parse_address_command("MAIL FROM", "MAIL FROM:<a@>"),
        );
        assert_eq!(
            None,
            parse_address_command("MAIL FROM", "MAIL FROM:<a@b@c>"),
        );
        assert_eq!(None, parse_address_command("MAIL FROM", "MAIL FROM:"));
    }
}
