//! Network adapters.

use anyhow::{Context, Result, bail};
use tracing::info;

use super::Vm;
use super::networks::{Network, Networks};
use crate::network::{HostNetwork, HostNetworks, HostOnlyModel, NetworkKind};

/// Adapters can only be added to a powered-off VM, so all of them are
/// configured before the first boot.
pub const MAX_NICS: usize = 4;

/// Random locally administered unicast address.
pub fn random_mac() -> [u8; 6] {
    let mut mac: [u8; 6] = rand::random();
    // VirtualBox rejects addresses whose first octet is odd.
    mac[0] = (mac[0] & 0xfc) | 0x02;
    mac
}

/// `02:ab:..` form used in the agent env.
pub fn format_mac(mac: &[u8; 6]) -> String {
    mac.iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

impl Vm {
    /// Attach one adapter per network, in name order, and record each
    /// generated MAC on its network.
    pub async fn configure_nics(&self, nets: &mut Networks, host: &HostNetworks) -> Result<()> {
        if nets.len() > MAX_NICS {
            bail!("Exceeded maximum # of NICs ({MAX_NICS})");
        }

        for (index, (name, net)) in nets.iter_mut().enumerate() {
            let nic = (index + 1).to_string();
            let mac = self
                .add_nic(&nic, net, host)
                .await
                .with_context(|| format!("Configuring NIC {nic} for network '{name}'"))?;
            net.mac = format_mac(&mac);
        }
        Ok(())
    }

    async fn add_nic(&self, nic: &str, net: &Network, host: &HostNetworks) -> Result<[u8; 6]> {
        let intent = net.intent()?;
        let mut argv = vec![
            "modifyvm".to_string(),
            self.id().to_string(),
            format!("--nic{nic}"),
        ];

        match intent.kind {
            NetworkKind::Nat => argv.push("nat".into()),
            kind => {
                let Some(actual) = host.find(&intent).await? else {
                    bail!("Expected to find {}", intent.label());
                };
                argv.extend(adapter_args(nic, kind, &actual));
            }
        }

        let mac = random_mac();
        let vbox_mac: String = mac.iter().map(|b| format!("{b:02X}")).collect();
        argv.push(format!("--macaddress{nic}"));
        argv.push(vbox_mac);

        info!(vm = %self.id(), nic, kind = %intent.kind, mac = %format_mac(&mac), "Adding NIC");
        let refs: Vec<&str> = argv.iter().map(String::as_str).collect();
        self.driver.run(&refs).await?;
        Ok(mac)
    }
}

fn adapter_args(nic: &str, kind: NetworkKind, actual: &HostNetwork) -> Vec<String> {
    let name = actual.name().to_string();
    match (kind, actual) {
        (NetworkKind::HostOnly, HostNetwork::HostOnly(h)) if h.model == HostOnlyModel::Network => {
            vec!["hostonlynet".into(), format!("--host-only-net{nic}"), name]
        }
        (NetworkKind::HostOnly, _) => {
            vec!["hostonly".into(), format!("--hostonlyadapter{nic}"), name]
        }
        (NetworkKind::NatNetwork, _) => {
            vec!["natnetwork".into(), format!("--nat-network{nic}"), name]
        }
        (NetworkKind::Bridged, _) => {
            vec!["bridged".into(), format!("--bridgeadapter{nic}"), name]
        }
        (NetworkKind::Nat, _) => vec!["nat".into()],
    }
}
