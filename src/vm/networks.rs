//! Networks as requested by the director for one VM.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::network::{NetworkIntent, NetworkKind};

/// Requested networks keyed by deployment network name. Ordered so NICs
/// are assigned deterministically.
pub type Networks = BTreeMap<String, Network>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkCloudProps {
    #[serde(default, alias = "Name")]
    pub name: String,
    #[serde(rename = "type", default, alias = "Type")]
    pub kind: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Network {
    /// `manual`, `dynamic` or `vip`.
    #[serde(rename = "type", default)]
    pub net_type: String,
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub netmask: String,
    #[serde(default)]
    pub gateway: String,
    #[serde(default)]
    pub dns: Vec<String>,
    #[serde(default)]
    pub default: Vec<String>,
    /// Filled in once a NIC has been configured for this network.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub mac: String,
    #[serde(default)]
    pub cloud_properties: NetworkCloudProps,
}

impl Network {
    pub fn is_dynamic(&self) -> bool {
        self.net_type == "dynamic"
    }

    pub fn kind(&self) -> Result<NetworkKind> {
        self.cloud_properties.kind.parse()
    }

    /// What the host must provide for this network.
    pub fn intent(&self) -> Result<NetworkIntent> {
        let kind = self
            .kind()
            .with_context(|| format!("Resolving type of network '{}'", self.cloud_properties.name))?;
        Ok(NetworkIntent {
            kind,
            name: self.cloud_properties.name.clone(),
            ip: if self.is_dynamic() {
                String::new()
            } else {
                self.ip.clone()
            },
            netmask: self.netmask.clone(),
            gateway: self.gateway.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn cloud_properties_default_to_host_only() {
        let nets: Networks = serde_json::from_value(json!({
            "default": {
                "type": "manual",
                "ip": "192.168.56.10",
                "netmask": "255.255.255.0",
                "gateway": "192.168.56.1",
                "dns": ["8.8.8.8"],
                "default": ["dns", "gateway"]
            }
        }))
        .unwrap();

        let intent = nets["default"].intent().unwrap();
        assert_eq!(intent.kind, NetworkKind::HostOnly);
        assert_eq!(intent.ip, "192.168.56.10");
        assert_eq!(intent.gateway, "192.168.56.1");
        assert!(intent.name.is_empty());
    }

    #[test]
    fn dynamic_networks_carry_no_static_ip() {
        let net: Network = serde_json::from_value(json!({
            "type": "dynamic",
            "ip": "10.0.2.15",
            "cloud_properties": {"name": "outbound", "type": "natnetwork"}
        }))
        .unwrap();

        let intent = net.intent().unwrap();
        assert_eq!(intent.kind, NetworkKind::NatNetwork);
        assert_eq!(intent.name, "outbound");
        assert!(intent.ip.is_empty());
    }

    #[test]
    fn unknown_type_is_rejected() {
        let net = Network {
            cloud_properties: NetworkCloudProps {
                name: "x".into(),
                kind: "vlan".into(),
            },
            ..Network::default()
        };
        assert!(format!("{:#}", net.intent().unwrap_err()).contains("Unknown network type: vlan"));
    }
}
