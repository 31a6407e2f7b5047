/* This file is part of Ferroshare
 *
 * Copyright (C) 2024-2026 Ferroshare Contributors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as
 * published by the Free Software Foundation, either version 3 of the
 * License, or (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

use std::{
    fmt,
    hash::{Hash, Hasher},
    io::{Error as IoError, ErrorKind, Read, Write},
    net::{IpAddr, SocketAddr},
    str::FromStr,
    sync::OnceLock,
};

use darkfi_serial::{Decodable, Encodable, ReadExt, WriteExt};
use ipnet::{Ipv4Net, Ipv6Net};
use iprange::IpRange;

use crate::Error;

/// IPv4 ranges no publicly reachable hub can live in.
pub const IP4_RESERVED_RANGES: [&str; 11] = [
    "0.0.0.0/8",
    "10.0.0.0/8",
    "100.64.0.0/10",
    "127.0.0.0/8",
    "169.254.0.0/16",
    "172.16.0.0/12",
    "192.168.0.0/16",
    "198.18.0.0/15",
    "224.0.0.0/4",
    "240.0.0.0/4",
    "255.255.255.255/32",
];

/// IPv6 ranges no publicly reachable hub can live in.
pub const IP6_RESERVED_RANGES: [&str; 5] =
    ["::/128", "::1/128", "fc00::/7", "fe80::/10", "ff00::/8"];

fn ip4_reserved() -> &'static IpRange<Ipv4Net> {
    static RANGES: OnceLock<IpRange<Ipv4Net>> = OnceLock::new();
    RANGES.get_or_init(|| {
        let mut range: IpRange<Ipv4Net> =
            IP4_RESERVED_RANGES.iter().map(|s| s.parse().unwrap()).collect();
        // This will make the trie potentially smaller
        range.simplify();
        range
    })
}

fn ip6_reserved() -> &'static IpRange<Ipv6Net> {
    static RANGES: OnceLock<IpRange<Ipv6Net>> = OnceLock::new();
    RANGES.get_or_init(|| {
        let mut range: IpRange<Ipv6Net> =
            IP6_RESERVED_RANGES.iter().map(|s| s.parse().unwrap()).collect();
        range.simplify();
        range
    })
}

/// Country code reported for endpoints without GeoIP annotation. Also the
/// wildcard accepted by the host cache selection API.
pub const COUNTRY_NONE: &str = "ZZ";

/// A remote hub endpoint: IPv4/IPv6 address and port, plus an optional
/// GeoIP country code.
///
/// Equality and hashing consider only the socket address. The country code
/// is a presentation attribute filled in by whoever learned of the host,
/// and must not split the identity of a hub across cache entries.
#[derive(Clone, Debug)]
pub struct Endpoint {
    addr: SocketAddr,
    country: Option<String>,
}

impl Endpoint {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr, country: None }
    }

    pub fn with_country(addr: SocketAddr, country: &str) -> Self {
        Self { addr, country: Some(country.to_uppercase()) }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn ip(&self) -> IpAddr {
        self.addr.ip()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// GeoIP country code, `"ZZ"` when unknown.
    pub fn country(&self) -> &str {
        self.country.as_deref().unwrap_or(COUNTRY_NONE)
    }

    pub fn set_country(&mut self, country: &str) {
        self.country = Some(country.to_uppercase());
    }

    /// An endpoint we could at least in principle dial: real port, real
    /// address.
    pub fn is_valid(&self) -> bool {
        self.addr.port() != 0 && !self.addr.ip().is_unspecified()
    }

    /// True for endpoints inside private, loopback, link-local, multicast
    /// or otherwise reserved ranges. Such hosts sit behind NAT or never
    /// route at all, so they are useless as hub candidates.
    pub fn is_firewalled(&self) -> bool {
        match self.addr.ip() {
            IpAddr::V4(ip) => ip4_reserved().contains(&ip),
            IpAddr::V6(ip) => ip6_reserved().contains(&ip),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.addr)
    }
}

impl FromStr for Endpoint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let addr = SocketAddr::from_str(s)?;
        Ok(Self::new(addr))
    }
}

impl PartialEq for Endpoint {
    fn eq(&self, other: &Self) -> bool {
        self.addr == other.addr
    }
}

impl Eq for Endpoint {}

impl Hash for Endpoint {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.addr.hash(state);
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr)
    }
}

// Snapshot-file form: family tag, raw address octets, port. The country
// annotation is runtime-only and not persisted.
impl Encodable for Endpoint {
    fn encode<S: Write>(&self, s: &mut S) -> Result<usize, IoError> {
        let mut len = 0;
        match self.addr.ip() {
            IpAddr::V4(ip) => {
                s.write_u8(4)?;
                s.write_slice(&ip.octets())?;
                len += 5;
            }
            IpAddr::V6(ip) => {
                s.write_u8(6)?;
                s.write_slice(&ip.octets())?;
                len += 17;
            }
        }
        s.write_u16(self.addr.port())?;
        Ok(len + 2)
    }
}

impl Decodable for Endpoint {
    fn decode<D: Read>(d: &mut D) -> Result<Self, IoError> {
        let ip = match d.read_u8()? {
            4 => {
                let mut octets = [0u8; 4];
                d.read_slice(&mut octets)?;
                IpAddr::from(octets)
            }
            6 => {
                let mut octets = [0u8; 16];
                d.read_slice(&mut octets)?;
                IpAddr::from(octets)
            }
            _ => return Err(IoError::new(ErrorKind::Other, "Unknown address family")),
        };
        let port = d.read_u16()?;
        Ok(Self::new(SocketAddr::new(ip, port)))
    }
}
