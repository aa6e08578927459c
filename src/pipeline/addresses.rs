//! Address Supplier - the validated, de-duplicated list of public addresses to query

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Source of target addresses for a run
pub trait AddressSupplier {
    /// Public addresses in input order, without duplicates
    fn addresses(&self) -> Vec<IpAddr>;
}

/// Why an input was dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    Unparseable,
    NotPublic,
    Duplicate,
}

#[derive(Debug, Clone, Default)]
pub struct ParsedAddressList {
    addresses: Vec<IpAddr>,
    rejected: Vec<(String, Rejection)>,
}

impl ParsedAddressList {
    /// Parse raw inputs, dropping anything that is not a unique public address
    pub fn from_inputs<I, S>(inputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut list = Self::default();
        let mut seen = HashSet::new();

        for raw in inputs {
            let raw = raw.as_ref().trim();
            if raw.is_empty() {
                continue;
            }

            let rejection = match raw.parse::<IpAddr>() {
                Err(_) => Some(Rejection::Unparseable),
                Ok(addr) if !is_public(&addr) => Some(Rejection::NotPublic),
                Ok(addr) if !seen.insert(addr) => Some(Rejection::Duplicate),
                Ok(addr) => {
                    list.addresses.push(addr);
                    None
                }
            };

            if let Some(reason) = rejection {
                match reason {
                    Rejection::Unparseable => log::warn!("⚠️  Skipping '{}': not an IP address", raw),
                    Rejection::NotPublic => log::warn!("⚠️  Skipping {}: not a public address", raw),
                    Rejection::Duplicate => log::debug!("   ├─ Skipping duplicate {}", raw),
                }
                list.rejected.push((raw.to_string(), reason));
            }
        }

        list
    }

    pub fn rejected(&self) -> &[(String, Rejection)] {
        &self.rejected
    }

    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }
}

impl AddressSupplier for ParsedAddressList {
    fn addresses(&self) -> Vec<IpAddr> {
        self.addresses.clone()
    }
}

impl AddressSupplier for Vec<IpAddr> {
    fn addresses(&self) -> Vec<IpAddr> {
        self.clone()
    }
}

/// Globally routable unicast address
pub fn is_public(addr: &IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => is_public_v4(v4),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => is_public_v4(&v4),
            None => is_public_v6(v6),
        },
    }
}

fn is_public_v4(addr: &Ipv4Addr) -> bool {
    let [a, b, _, _] = addr.octets();
    !(addr.is_private()
        || addr.is_loopback()
        || addr.is_link_local()
        || addr.is_broadcast()
        || addr.is_documentation()
        || addr.is_multicast()
        || addr.is_unspecified()
        || a == 0
        // 100.64.0.0/10 shared address space
        || (a == 100 && (b & 0xc0) == 64)
        // 198.18.0.0/15 benchmarking
        || (a == 198 && (b & 0xfe) == 18)
        // 240.0.0.0/4 reserved
        || a >= 240)
}

fn is_public_v6(addr: &Ipv6Addr) -> bool {
    let first = addr.segments()[0];
    !(addr.is_loopback()
        || addr.is_unspecified()
        || addr.is_multicast()
        // fc00::/7 unique local
        || (first & 0xfe00) == 0xfc00
        // fe80::/10 link local
        || (first & 0xffc0) == 0xfe80
        // 2001:db8::/32 documentation
        || (first == 0x2001 && addr.segments()[1] == 0x0db8))
}
