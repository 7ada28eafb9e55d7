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

use std::net::IpAddr;
use std::time::Duration;

use log::debug;

pub type Resolver = hickory_resolver::AsyncResolver<
    hickory_resolver::name_server::GenericConnector<
        hickory_resolver::name_server::TokioRuntimeProvider,
    >,
>;

/// How long we are willing to stall a new connection waiting for its PTR
/// record.
const REVERSE_LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Creates a resolver from the system DNS configuration.
pub fn system_resolver(
) -> Result<Resolver, hickory_resolver::error::ResolveError> {
    hickory_resolver::AsyncResolver::tokio_from_system_conf()
}

/// Reverse-resolves `ip` to its first PTR name, without the trailing dot.
///
/// Returns `None` on NXDOMAIN, resolution failure, or timeout; the caller
/// falls back to the bracketed address form. Failure here is never fatal.
pub async fn reverse_hostname(resolver: &Resolver, ip: IpAddr) -> Option<String> {
    let lookup = match tokio::time::timeout(
        REVERSE_LOOKUP_TIMEOUT,
        resolver.reverse_lookup(ip),
    )
    .await
    {
        Ok(Ok(lookup)) => lookup,
        Ok(Err(e)) => {
            debug!("PTR lookup for {} failed: {}", ip, e);
            return None;
        },
        Err(_timeout) => {
            debug!("PTR lookup for {} timed out", ip);
            return None;
        },
    };

    lookup.iter().next().map(|ptr| {
        let mut name = ptr.0.to_utf8();
        if name.ends_with('.') {
            name.pop();
        }
        name
    })
}
