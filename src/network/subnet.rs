use std::fmt;
use std::net::Ipv4Addr;

use anyhow::{Context, Result, bail};

/// An IPv4 subnet held as host-order integers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subnet {
    pub net: u32,
    pub mask: u32,
}

impl Subnet {
    pub fn from_cidr(cidr: &str) -> Result<Self> {
        let Some((addr, prefix)) = cidr.split_once('/') else {
            bail!("Invalid CIDR: {}", cidr);
        };
        let addr: Ipv4Addr = addr
            .parse()
            .with_context(|| format!("Invalid CIDR: {}", cidr))?;
        let prefix = prefix
            .parse::<u32>()
            .with_context(|| format!("Invalid CIDR: {}", cidr))?;
        if prefix > 32 {
            bail!("Invalid CIDR: {}", cidr);
        }

        let mask = prefix_to_mask(prefix);
        Ok(Subnet {
            net: u32::from(addr) & mask,
            mask,
        })
    }

    /// Subnet containing `ip` under dotted-quad `netmask`.
    pub fn from_ip_and_mask(ip: &str, netmask: &str) -> Result<Self> {
        let ip: Ipv4Addr = ip
            .parse()
            .with_context(|| format!("Unable to parse IP address '{ip}'"))?;
        let mask = parse_netmask(netmask)?;
        Ok(Subnet {
            net: u32::from(ip) & mask,
            mask,
        })
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        u32::from(ip) & self.mask == self.net
    }

    pub fn netmask(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.mask)
    }

    pub fn prefix_len(&self) -> u32 {
        self.mask.count_ones()
    }

    /// Lowest address excluding the network address.
    pub fn first_usable(&self) -> Result<Ipv4Addr> {
        self.ensure_has_hosts()?;
        Ok(Ipv4Addr::from(self.net + 1))
    }

    /// Highest address excluding the broadcast address.
    pub fn last_usable(&self) -> Result<Ipv4Addr> {
        self.ensure_has_hosts()?;
        Ok(Ipv4Addr::from((self.net | !self.mask) - 1))
    }

    fn ensure_has_hosts(&self) -> Result<()> {
        if self.prefix_len() >= 31 {
            bail!("Subnet {} is too small to hold a host range", self);
        }
        Ok(())
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", Ipv4Addr::from(self.net), self.prefix_len())
    }
}

fn prefix_to_mask(prefix: u32) -> u32 {
    if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) }
}

/// Parse a dotted-quad netmask, rejecting non-contiguous masks.
pub fn parse_netmask(netmask: &str) -> Result<u32> {
    let mask: Ipv4Addr = netmask
        .parse()
        .with_context(|| format!("Unable to parse network mask '{netmask}'"))?;
    let mask = u32::from(mask);
    if mask.leading_ones() + mask.trailing_zeros() != 32 {
        bail!("Network mask '{netmask}' is not contiguous");
    }
    Ok(mask)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cidr() {
        let s = Subnet::from_cidr("10.0.2.0/24").unwrap();
        assert_eq!(s.net, 0x0a000200);
        assert_eq!(s.mask, 0xffffff00);
        assert_eq!(s.to_string(), "10.0.2.0/24");
        assert!(Subnet::from_cidr("10.0.2.0").is_err());
        assert!(Subnet::from_cidr("10.0.2.0/33").is_err());
    }

    #[test]
    fn test_from_ip_and_mask() {
        let s = Subnet::from_ip_and_mask("192.168.56.1", "255.255.255.0").unwrap();
        assert!(s.contains("192.168.56.77".parse().unwrap()));
        assert!(!s.contains("192.168.57.1".parse().unwrap()));
        assert_eq!(s.netmask(), Ipv4Addr::new(255, 255, 255, 0));
        assert!(Subnet::from_ip_and_mask("192.168.56.1", "255.0.255.0").is_err());
    }

    #[test]
    fn test_usable_range() {
        let s = Subnet::from_ip_and_mask("192.168.56.1", "255.255.255.0").unwrap();
        assert_eq!(s.first_usable().unwrap(), Ipv4Addr::new(192, 168, 56, 1));
        assert_eq!(s.last_usable().unwrap(), Ipv4Addr::new(192, 168, 56, 254));

        let s = Subnet::from_cidr("172.16.0.0/30").unwrap();
        assert_eq!(s.first_usable().unwrap(), Ipv4Addr::new(172, 16, 0, 1));
        assert_eq!(s.last_usable().unwrap(), Ipv4Addr::new(172, 16, 0, 2));

        assert!(Subnet::from_cidr("172.16.0.0/31").unwrap().first_usable().is_err());
    }
}
