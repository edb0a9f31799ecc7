use std::{fmt, net::Ipv4Addr};

/// Prefixes the subnet aggregates may be keyed at.
pub const VALID_PREFIXES: [u8; 4] = [8, 16, 24, 32];

#[derive(Debug, Clone, Copy)]
pub struct SubnetMask {
    prefix_bits: u8,
    mask: Ipv4Addr,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct Subnet {
    network: Ipv4Addr,
    prefix_bits: u8,
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix_bits)
    }
}

impl SubnetMask {
    /// `prefix_bits` must be one of [`VALID_PREFIXES`].
    pub fn new(prefix_bits: u8) -> SubnetMask {
        debug_assert!(VALID_PREFIXES.contains(&prefix_bits));
        SubnetMask {
            prefix_bits,
            mask: Ipv4Addr::from_bits(u32::MAX << (32 - u32::from(prefix_bits))),
        }
    }

    pub fn prefix_bits(&self) -> u8 {
        self.prefix_bits
    }

    pub fn apply(&self, ip: Ipv4Addr) -> Subnet {
        Subnet {
            network: ip & self.mask,
            prefix_bits: self.prefix_bits,
        }
    }
}

/// clap value parser for `--subnet-prefix`.
pub fn parse_prefix(s: &str) -> Result<u8, String> {
    let n: u8 = s.parse().map_err(|_| format!("invalid prefix {s:?}"))?;
    if VALID_PREFIXES.contains(&n) {
        Ok(n)
    } else {
        Err(format!("prefix must be one of {VALID_PREFIXES:?}"))
    }
}
