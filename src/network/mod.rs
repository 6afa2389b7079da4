//! Host network model and VBoxManage listing decoders.
//!
//! VirtualBox exposes host networks only through `VBoxManage list ...`
//! text: blocks of `Key: value` lines separated by blank lines. The
//! decoders here turn those blocks into [`HostNetwork`] values and fail
//! loudly on any line they cannot account for, since that means the
//! installed VirtualBox prints a format this crate does not understand.
//!
//! [`reconcile::HostNetworks`] builds on these to find, create, enable and
//! verify the networks a VM asks for.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

pub mod reconcile;
pub mod subnet;

pub use reconcile::HostNetworks;
pub use subnet::Subnet;

// ---------------------------------------------------------------------------
// Kinds and requests
// ---------------------------------------------------------------------------

/// NIC attachment mode requested in a network's cloud properties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NetworkKind {
    Nat,
    NatNetwork,
    #[default]
    HostOnly,
    Bridged,
}

impl NetworkKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkKind::Nat => "nat",
            NetworkKind::NatNetwork => "natnetwork",
            NetworkKind::HostOnly => "hostonly",
            NetworkKind::Bridged => "bridged",
        }
    }
}

impl fmt::Display for NetworkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NetworkKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "nat" => Ok(NetworkKind::Nat),
            "natnetwork" => Ok(NetworkKind::NatNetwork),
            "hostonly" | "" => Ok(NetworkKind::HostOnly),
            "bridged" => Ok(NetworkKind::Bridged),
            other => bail!("Unknown network type: {other}"),
        }
    }
}

/// What a VM needs from one host network.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkIntent {
    pub kind: NetworkKind,
    /// Host network name from cloud properties; may be empty for
    /// host-only and bridged networks, which then match by address.
    pub name: String,
    /// Static IP for the VM; empty when the network is DHCP-managed.
    pub ip: String,
    pub netmask: String,
    pub gateway: String,
}

impl NetworkIntent {
    pub fn label(&self) -> String {
        if self.name.is_empty() {
            format!("{} network (gw {} netmask {})", self.kind, self.gateway, self.netmask)
        } else {
            format!("{} network '{}'", self.kind, self.name)
        }
    }
}

// ---------------------------------------------------------------------------
// Discovered host networks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NatNetworkInfo {
    pub name: String,
    pub cidr: String,
    pub subnet: Subnet,
    pub dhcp: bool,
    pub enabled: bool,
}

/// Which VBoxManage object family backs a host-only network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostOnlyModel {
    /// `hostonlyif`: VirtualBox names the interface itself.
    Interface,
    /// `hostonlynet` (VirtualBox 7 on macOS): caller-named, range based.
    Network,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostOnlyInfo {
    pub name: String,
    pub ip: String,
    pub netmask: String,
    pub subnet: Subnet,
    pub dhcp: bool,
    pub status: String,
    pub model: HostOnlyModel,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgedInfo {
    pub name: String,
    pub ip: String,
    pub netmask: String,
    pub subnet: Subnet,
    pub dhcp: bool,
    pub status: String,
}

/// A network object registered with VirtualBox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostNetwork {
    NatNetwork(NatNetworkInfo),
    HostOnly(HostOnlyInfo),
    Bridged(BridgedInfo),
}

impl HostNetwork {
    pub fn kind(&self) -> NetworkKind {
        match self {
            HostNetwork::NatNetwork(_) => NetworkKind::NatNetwork,
            HostNetwork::HostOnly(_) => NetworkKind::HostOnly,
            HostNetwork::Bridged(_) => NetworkKind::Bridged,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            HostNetwork::NatNetwork(n) => &n.name,
            HostNetwork::HostOnly(n) => &n.name,
            HostNetwork::Bridged(n) => &n.name,
        }
    }

    pub fn subnet(&self) -> Subnet {
        match self {
            HostNetwork::NatNetwork(n) => n.subnet,
            HostNetwork::HostOnly(n) => n.subnet,
            HostNetwork::Bridged(n) => n.subnet,
        }
    }

    pub fn is_enabled(&self) -> bool {
        match self {
            HostNetwork::NatNetwork(n) => n.enabled,
            HostNetwork::HostOnly(n) => n.status == "Up" || n.status == "Enabled",
            HostNetwork::Bridged(n) => n.status == "Up",
        }
    }

    pub fn dhcp_enabled(&self) -> bool {
        match self {
            HostNetwork::NatNetwork(n) => n.dhcp,
            HostNetwork::HostOnly(n) => n.dhcp,
            HostNetwork::Bridged(n) => n.dhcp,
        }
    }

    pub fn description(&self) -> String {
        match self {
            HostNetwork::NatNetwork(n) => {
                format!("NAT Network '{}' (network {})", n.name, n.cidr)
            }
            HostNetwork::HostOnly(n) => format!(
                "Host-only network '{}' (gw {} netmask {})",
                n.name, n.ip, n.netmask
            ),
            HostNetwork::Bridged(n) => format!(
                "Bridged network '{}' (ip {} netmask {})",
                n.name, n.ip, n.netmask
            ),
        }
    }

    fn enabled_description(&self) -> String {
        match self {
            HostNetwork::NatNetwork(_) => "be enabled".to_string(),
            HostNetwork::HostOnly(n) => format!("be enabled (status '{}')", n.status),
            HostNetwork::Bridged(n) => format!("have status 'Up' (status '{}')", n.status),
        }
    }

    /// Whether this object is the one `intent` refers to.
    pub fn matches(&self, intent: &NetworkIntent) -> bool {
        if self.kind() != intent.kind {
            return false;
        }
        if !intent.name.is_empty() {
            return self.name() == intent.name;
        }
        match self {
            // NAT networks carry no host address to match on.
            HostNetwork::NatNetwork(_) => false,
            HostNetwork::HostOnly(n) => n.ip == intent.gateway && n.netmask == intent.netmask,
            HostNetwork::Bridged(n) => {
                n.netmask == intent.netmask
                    && intent
                        .gateway
                        .parse::<Ipv4Addr>()
                        .is_ok_and(|gw| n.subnet.contains(gw))
            }
        }
    }

    /// Check the object's addressing against `intent`. Does not look at
    /// the enabled flag.
    pub fn verify_addressing(&self, intent: &NetworkIntent) -> Result<()> {
        if intent.ip.is_empty() {
            if !self.dhcp_enabled() {
                bail!("Expected {} to have DHCP enabled", self.description());
            }
            return Ok(());
        }

        let ip: Ipv4Addr = intent.ip.parse().with_context(|| {
            format!(
                "Unable to parse IP address '{}' for {}",
                intent.ip,
                intent.label()
            )
        })?;

        let subnet = self.subnet();
        if !subnet.contains(ip) {
            bail!(
                "Expected IP address '{}' to fit within {} ({})",
                intent.ip,
                self.description(),
                subnet
            );
        }

        let actual_mask = subnet.netmask().to_string();
        if actual_mask != intent.netmask {
            bail!(
                "Expected netmask '{}' to match {} netmask '{}'",
                intent.netmask,
                self.description(),
                actual_mask
            );
        }

        if self.dhcp_enabled() {
            bail!("Expected {} to not have DHCP enabled", self.description());
        }
        Ok(())
    }

    /// Full verification: enabled and correctly addressed.
    pub fn verify(&self, intent: &NetworkIntent) -> Result<()> {
        if !self.is_enabled() {
            bail!("Expected {} to {}", self.description(), self.enabled_description());
        }
        self.verify_addressing(intent)
    }
}

// ---------------------------------------------------------------------------
// Listing decoders
// ---------------------------------------------------------------------------

/// A listing line that fits none of the known shapes.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("Internal inconsistency: unexpected line '{line}' in `VBoxManage list {listing}` output")]
pub struct ParseError {
    pub listing: &'static str,
    pub line: String,
}

/// One `Key: value` block.
type Block = Vec<(String, String)>;

/// Split listing output into blocks. `spaced_keys` admits keys containing
/// spaces (`DHCP Enabled`). Lines from a stop marker to the end of the
/// block are skipped.
fn parse_blocks(
    output: &str,
    listing: &'static str,
    spaced_keys: bool,
    stop_markers: &[&str],
) -> Result<Vec<Block>, ParseError> {
    let normalized = output.replace("\r\n", "\n");
    let mut blocks = Vec::new();

    for chunk in normalized.trim().split("\n\n") {
        let mut block = Block::new();
        for line in chunk.lines() {
            if stop_markers.iter().any(|m| line.contains(m)) {
                break;
            }
            if line.trim().is_empty() || is_count_footer(line) {
                continue;
            }

            let malformed = || ParseError {
                listing,
                line: line.to_string(),
            };
            let (key, value) = line.split_once(':').ok_or_else(malformed)?;
            let key_ok = !key.is_empty()
                && key
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || (spaced_keys && c == ' '));
            if !key_ok {
                return Err(malformed());
            }
            block.push((key.trim().to_string(), value.trim().to_string()));
        }
        if !block.is_empty() {
            blocks.push(block);
        }
    }
    Ok(blocks)
}

/// `2 networks found` style trailer printed by newer VirtualBox releases.
fn is_count_footer(line: &str) -> bool {
    let mut words = line.split_whitespace();
    matches!(
        (words.next(), words.next(), words.next(), words.next()),
        (Some(n), Some("network" | "networks"), Some("found"), None)
            if n.chars().all(|c| c.is_ascii_digit())
    )
}

fn field<'a>(block: &'a Block, keys: &[&str]) -> Option<&'a str> {
    block
        .iter()
        .find(|(k, _)| keys.contains(&k.as_str()))
        .map(|(_, v)| v.as_str())
}

fn parse_bool(value: &str) -> Result<bool> {
    match value {
        "Enabled" | "Yes" => Ok(true),
        "Disabled" | "No" => Ok(false),
        other => bail!("Unknown boolean value '{other}'"),
    }
}

/// Decode `VBoxManage list natnetworks`.
pub fn parse_nat_networks(output: &str) -> Result<Vec<HostNetwork>> {
    let blocks = parse_blocks(
        output,
        "natnetworks",
        true,
        &["loopback mappings", "Port-forwarding"],
    )?;

    let mut nets = Vec::new();
    for block in blocks {
        let Some(name) = field(&block, &["NetworkName", "Name"]) else {
            continue;
        };
        let cidr = field(&block, &["Network"]).unwrap_or_default();
        let subnet = Subnet::from_cidr(cidr)
            .with_context(|| format!("Unable to parse CIDR '{cidr}' for network '{name}'"))?;
        let dhcp = parse_bool(field(&block, &["DHCP Enabled", "DHCP Server"]).unwrap_or("No"))?;
        let enabled = parse_bool(field(&block, &["Enabled"]).unwrap_or("No"))?;

        nets.push(HostNetwork::NatNetwork(NatNetworkInfo {
            name: name.to_string(),
            cidr: cidr.to_string(),
            subnet,
            dhcp,
            enabled,
        }));
    }
    Ok(nets)
}

/// Decode `VBoxManage list hostonlyifs`.
pub fn parse_host_only_ifs(output: &str) -> Result<Vec<HostNetwork>> {
    let mut nets = Vec::new();
    for block in parse_blocks(output, "hostonlyifs", false, &[])? {
        let Some(name) = field(&block, &["Name"]) else {
            continue;
        };
        let ip = field(&block, &["IPAddress"]).unwrap_or_default();
        let netmask = field(&block, &["NetworkMask"]).unwrap_or_default();
        let subnet = Subnet::from_ip_and_mask(ip, netmask)
            .with_context(|| format!("Parsing addressing of host-only network '{name}'"))?;

        nets.push(HostNetwork::HostOnly(HostOnlyInfo {
            name: name.to_string(),
            ip: ip.to_string(),
            netmask: netmask.to_string(),
            subnet,
            dhcp: parse_bool(field(&block, &["DHCP"]).unwrap_or("Disabled"))?,
            status: field(&block, &["Status"]).unwrap_or_default().to_string(),
            model: HostOnlyModel::Interface,
        }));
    }
    Ok(nets)
}

/// Decode `VBoxManage list hostonlynets` (VirtualBox 7 on macOS). The
/// host side of such a network takes its lower bound address.
pub fn parse_host_only_nets(output: &str) -> Result<Vec<HostNetwork>> {
    let mut nets = Vec::new();
    for block in parse_blocks(output, "hostonlynets", false, &[])? {
        let Some(name) = field(&block, &["Name"]) else {
            continue;
        };
        let ip = field(&block, &["LowerIP"]).unwrap_or_default();
        let netmask = field(&block, &["NetworkMask"]).unwrap_or_default();
        let subnet = Subnet::from_ip_and_mask(ip, netmask)
            .with_context(|| format!("Parsing addressing of host-only network '{name}'"))?;

        nets.push(HostNetwork::HostOnly(HostOnlyInfo {
            name: name.to_string(),
            ip: ip.to_string(),
            netmask: netmask.to_string(),
            subnet,
            dhcp: match field(&block, &["DHCP"]) {
                Some(v) => parse_bool(v)?,
                None => false,
            },
            status: field(&block, &["State"]).unwrap_or_default().to_string(),
            model: HostOnlyModel::Network,
        }));
    }
    Ok(nets)
}

/// Decode `VBoxManage list bridgedifs`.
pub fn parse_bridged_ifs(output: &str) -> Result<Vec<HostNetwork>> {
    let mut nets = Vec::new();
    for block in parse_blocks(output, "bridgedifs", false, &[])? {
        let Some(name) = field(&block, &["Name"]) else {
            continue;
        };
        let ip = field(&block, &["IPAddress"]).unwrap_or_default();
        let netmask = field(&block, &["NetworkMask"]).unwrap_or_default();
        let subnet = Subnet::from_ip_and_mask(ip, netmask)
            .with_context(|| format!("Parsing addressing of bridged network '{name}'"))?;

        nets.push(HostNetwork::Bridged(BridgedInfo {
            name: name.to_string(),
            ip: ip.to_string(),
            netmask: netmask.to_string(),
            subnet,
            dhcp: parse_bool(field(&block, &["DHCP"]).unwrap_or("Disabled"))?,
            status: field(&block, &["Status"]).unwrap_or_default().to_string(),
        }));
    }
    Ok(nets)
}

// ---------------------------------------------------------------------------
// System info
// ---------------------------------------------------------------------------

/// VirtualBox release and host OS, which together decide the host-only
/// object model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemInfo {
    pub host_os: String,
    pub major: u32,
    pub minor: u32,
}

impl SystemInfo {
    /// Parse `VBoxManage --version` output such as `7.0.14r161095`.
    pub fn parse(host_os: &str, version_output: &str) -> Result<Self> {
        let version = version_output.trim();
        let mut parts = version.split('.');
        let major: u32 = parts
            .next()
            .and_then(|p| p.parse().ok())
            .with_context(|| format!("Internal inconsistency: unexpected VirtualBox version '{version}'"))?;
        let minor: u32 = parts
            .next()
            .and_then(|p| {
                let digits: String = p.chars().take_while(|c| c.is_ascii_digit()).collect();
                digits.parse().ok()
            })
            .with_context(|| format!("Internal inconsistency: unexpected VirtualBox version '{version}'"))?;

        Ok(Self {
            host_os: host_os.to_string(),
            major,
            minor,
        })
    }

    /// VirtualBox 7 on macOS replaced `hostonlyif` with `hostonlynet`.
    pub fn uses_host_only_nets(&self) -> bool {
        self.host_os == "macos" && self.major >= 7
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
