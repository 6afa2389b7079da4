//! Host network reconciliation.
//!
//! Turns a [`NetworkIntent`] into a verified, enabled [`HostNetwork`],
//! creating or enabling the host object when needed. Each call runs a
//! small state machine:
//!
//! ```text
//! Searching ─► MatchedEnabled ─► verify ─► done
//!     │
//!     ├──────► MatchedDisabled ─► enable (once) ─► Searching
//!     │
//!     └──────► Absent ─► create (once) ─► Searching
//! ```
//!
//! Enabling and creating are each attempted at most once per call, so a
//! call lists networks at most three times. Addressing is checked before
//! any mutation: a network that can never satisfy the intent is rejected
//! without being touched.

use anyhow::{Context, Result, bail};
use tokio::sync::OnceCell;
use tracing::{error, info};

use super::{
    HostNetwork, HostOnlyModel, NetworkIntent, NetworkKind, ParseError, Subnet, SystemInfo,
    parse_bridged_ifs, parse_host_only_ifs, parse_host_only_nets, parse_nat_networks,
};
use crate::driver::Driver;
use crate::driver::exec::error_output;

/// CIDR given to NAT networks this crate creates.
pub const NAT_NETWORK_CIDR: &str = "10.0.2.0/24";

/// The only name legacy `hostonlyif create` hands out first.
pub const DEFAULT_HOST_ONLY_NAME: &str = "vboxnet0";

const MAX_PASSES: usize = 3;

#[derive(Debug)]
enum State {
    Searching,
    MatchedEnabled(HostNetwork),
    MatchedDisabled(HostNetwork),
    Absent,
}

/// Host network operations against one VirtualBox installation.
pub struct HostNetworks {
    driver: Driver,
    host_os: String,
    system_info: OnceCell<SystemInfo>,
}

impl HostNetworks {
    pub fn new(driver: Driver) -> Self {
        Self::with_host_os(driver, std::env::consts::OS)
    }

    pub fn with_host_os(driver: Driver, host_os: &str) -> Self {
        Self {
            driver,
            host_os: host_os.to_string(),
            system_info: OnceCell::new(),
        }
    }

    pub async fn system_info(&self) -> Result<&SystemInfo> {
        self.system_info
            .get_or_try_init(|| async {
                let output = self.driver.run(&["--version"]).await?;
                SystemInfo::parse(&self.host_os, &output)
            })
            .await
    }

    async fn host_only_model(&self) -> Result<HostOnlyModel> {
        Ok(if self.system_info().await?.uses_host_only_nets() {
            HostOnlyModel::Network
        } else {
            HostOnlyModel::Interface
        })
    }

    /// Make sure the host network behind `intent` exists, is enabled and is
    /// addressed compatibly. Plain NAT needs no host object and yields
    /// `None`.
    pub async fn reconcile(&self, intent: &NetworkIntent) -> Result<Option<HostNetwork>> {
        if intent.kind == NetworkKind::Nat {
            return Ok(None);
        }
        if intent.kind == NetworkKind::NatNetwork && intent.name.is_empty() {
            bail!("NAT network requires a name in its cloud properties");
        }
        if intent.name.is_empty() && intent.gateway.is_empty() {
            bail!("{} requires either a name or a gateway", intent.kind);
        }

        let mut tried_enable = false;
        let mut tried_create = false;
        let mut state = State::Searching;

        for _ in 0..MAX_PASSES {
            if let State::Searching = state {
                let nets = self.list(intent.kind).await?;
                state = match nets.into_iter().find(|n| n.matches(intent)) {
                    Some(net) if net.is_enabled() => State::MatchedEnabled(net),
                    Some(net) => State::MatchedDisabled(net),
                    None => State::Absent,
                };
            }

            state = match state {
                State::MatchedEnabled(net) => {
                    net.verify(intent)?;
                    return Ok(Some(net));
                }
                State::MatchedDisabled(net) => {
                    net.verify_addressing(intent)?;
                    if tried_enable {
                        net.verify(intent)?;
                        bail!("Expected {} to be enabled", net.description());
                    }
                    tried_enable = true;
                    self.enable(&net)
                        .await
                        .with_context(|| format!("Enabling {}", net.description()))?;
                    State::Searching
                }
                State::Absent => {
                    if tried_create {
                        bail!("Expected to find {}", intent.label());
                    }
                    tried_create = true;
                    self.create(intent)
                        .await
                        .with_context(|| format!("Creating {}", intent.label()))?;
                    State::Searching
                }
                State::Searching => State::Searching,
            };
        }

        bail!("{} did not settle after {MAX_PASSES} passes", intent.label())
    }

    /// Look up the host network behind `intent` without changing anything.
    pub async fn find(&self, intent: &NetworkIntent) -> Result<Option<HostNetwork>> {
        if intent.kind == NetworkKind::Nat {
            return Ok(None);
        }
        let nets = self.list(intent.kind).await?;
        match nets.into_iter().find(|n| n.matches(intent)) {
            Some(net) => Ok(Some(net)),
            None => bail!("Expected to find {}", intent.label()),
        }
    }

    // -----------------------------------------------------------------------
    // Per-kind operations
    // -----------------------------------------------------------------------

    pub async fn list(&self, kind: NetworkKind) -> Result<Vec<HostNetwork>> {
        match kind {
            NetworkKind::Nat => Ok(Vec::new()),
            NetworkKind::NatNetwork => {
                parse_nat_networks(&self.driver.run(&["list", "natnetworks"]).await?)
            }
            NetworkKind::HostOnly => match self.host_only_model().await? {
                HostOnlyModel::Network => {
                    parse_host_only_nets(&self.driver.run(&["list", "hostonlynets"]).await?)
                }
                HostOnlyModel::Interface => {
                    parse_host_only_ifs(&self.driver.run(&["list", "hostonlyifs"]).await?)
                }
            },
            NetworkKind::Bridged => {
                parse_bridged_ifs(&self.driver.run(&["list", "bridgedifs"]).await?)
            }
        }
    }

    async fn enable(&self, net: &HostNetwork) -> Result<()> {
        info!(network = %net.name(), kind = %net.kind(), "Enabling host network");
        match net {
            HostNetwork::NatNetwork(n) => {
                let netname = n.name.as_str();
                self.driver
                    .run(&["natnetwork", "modify", "--netname", netname, "--enable"])
                    .await?;
            }
            HostNetwork::HostOnly(n) => match n.model {
                HostOnlyModel::Network => {
                    let name = format!("--name={}", n.name);
                    self.driver
                        .run(&["hostonlynet", "modify", &name, "--enable"])
                        .await?;
                }
                HostOnlyModel::Interface => {
                    self.configure_host_only_if(&n.name, &n.ip, &n.netmask)
                        .await?;
                }
            },
            HostNetwork::Bridged(n) => {
                bail!("Bridged network '{}' is down and cannot be enabled", n.name)
            }
        }
        Ok(())
    }

    async fn create(&self, intent: &NetworkIntent) -> Result<()> {
        match intent.kind {
            NetworkKind::Nat => Ok(()),
            NetworkKind::NatNetwork => self.create_nat_network(&intent.name).await,
            NetworkKind::HostOnly => match self.host_only_model().await? {
                HostOnlyModel::Network => self.create_host_only_net(intent).await,
                HostOnlyModel::Interface => self.create_host_only_if(intent).await,
            },
            NetworkKind::Bridged => bail!("Bridged networks cannot be created"),
        }
    }

    async fn create_nat_network(&self, name: &str) -> Result<()> {
        info!(network = %name, cidr = NAT_NETWORK_CIDR, "Creating NAT network");
        let result = self
            .driver
            .run(&[
                "natnetwork", "add",
                "--netname", name,
                "--network", NAT_NETWORK_CIDR,
                "--dhcp", "on",
            ])
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(err) if error_output(&err).is_some_and(|o| o.contains("already exists")) => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn create_host_only_net(&self, intent: &NetworkIntent) -> Result<()> {
        let name = if intent.name.is_empty() {
            DEFAULT_HOST_ONLY_NAME
        } else {
            intent.name.as_str()
        };
        if intent.gateway.is_empty() || intent.netmask.is_empty() {
            bail!("Creating host-only network '{name}' requires a gateway and netmask");
        }

        let subnet = Subnet::from_ip_and_mask(&intent.gateway, &intent.netmask)?;
        let lower = subnet.first_usable()?;
        let upper = subnet.last_usable()?;
        info!(network = %name, %lower, %upper, "Creating host-only network");

        self.driver
            .run(&[
                "hostonlynet",
                "add",
                &format!("--name={name}"),
                &format!("--netmask={}", intent.netmask),
                &format!("--lower-ip={lower}"),
                &format!("--upper-ip={upper}"),
                "--enable",
            ])
            .await?;
        Ok(())
    }

    async fn create_host_only_if(&self, intent: &NetworkIntent) -> Result<()> {
        // hostonlyif cannot be named; only the first interface is predictable.
        if !intent.name.is_empty() && intent.name != DEFAULT_HOST_ONLY_NAME {
            bail!("Expected to find Host-only network '{}'", intent.name);
        }

        let output = self.driver.run(&["hostonlyif", "create"]).await?;
        let created = parse_created_interface(&output)?;
        info!(network = %created, "Created host-only interface");

        if !intent.name.is_empty() && created != intent.name {
            self.cleanup_host_only(&created, HostOnlyModel::Interface).await;
            bail!(
                "Expected created host-only network '{}' to have name '{}'",
                created,
                intent.name
            );
        }

        if let Err(err) = self
            .configure_host_only_if(&created, &intent.gateway, &intent.netmask)
            .await
        {
            self.cleanup_host_only(&created, HostOnlyModel::Interface).await;
            return Err(err);
        }
        Ok(())
    }

    async fn configure_host_only_if(&self, name: &str, ip: &str, netmask: &str) -> Result<()> {
        let mut args = vec!["hostonlyif", "ipconfig", name];
        if ip.is_empty() {
            args.push("--dhcp");
        } else {
            args.extend(["--ip", ip, "--netmask", netmask]);
        }
        self.driver.run(&args).await?;
        Ok(())
    }

    /// Remove a partially created host-only object. Failures are logged
    /// and never returned.
    async fn cleanup_host_only(&self, name: &str, model: HostOnlyModel) {
        let result = match model {
            HostOnlyModel::Interface => self.driver.run(&["hostonlyif", "remove", name]).await,
            HostOnlyModel::Network => {
                let arg = format!("--name={name}");
                self.driver.run(&["hostonlynet", "remove", &arg]).await
            }
        };
        if let Err(err) = result {
            error!(network = %name, error = ?err, "Failed to clean up partially created host-only network");
        }
    }
}

fn parse_created_interface(output: &str) -> Result<String> {
    output
        .lines()
        .find_map(|line| {
            let rest = line.split("Interface '").nth(1)?;
            let (name, tail) = rest.split_once('\'')?;
            tail.contains("was successfully created")
                .then(|| name.to_string())
        })
        .ok_or_else(|| {
            ParseError {
                listing: "hostonlyif create",
                line: output.trim().to_string(),
            }
            .into()
        })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::fake::FakeRunner;
    use crate::driver::{Driver, Retrier};
    use std::sync::Arc;
    use std::time::Duration;

    const UP: &str = "Name:            vboxnet0
DHCP:            Disabled
IPAddress:       192.168.56.1
NetworkMask:     255.255.255.0
Status:          Up
";

    const DOWN: &str = "Name:            vboxnet0
DHCP:            Disabled
IPAddress:       192.168.56.1
NetworkMask:     255.255.255.0
Status:          Down
";

    const MUTATIONS: &[&str] = &[
        "hostonlyif create",
        "hostonlyif ipconfig",
        "hostonlyif remove",
        "hostonlynet add",
        "hostonlynet modify",
        "natnetwork add",
        "natnetwork modify",
    ];

    fn setup(os: &str, version: &str) -> (Arc<FakeRunner>, HostNetworks) {
        let runner = Arc::new(FakeRunner::new());
        runner.on("--version", version, 0);
        let driver = Driver::new(runner.clone(), Retrier::new(3, Duration::ZERO), "VBoxManage");
        (runner, HostNetworks::with_host_os(driver, os))
    }

    fn mutations(runner: &FakeRunner) -> Vec<String> {
        runner
            .commands()
            .into_iter()
            .filter(|c| MUTATIONS.iter().any(|m| c.starts_with(m)))
            .collect()
    }

    fn host_only(name: &str, ip: &str) -> NetworkIntent {
        NetworkIntent {
            kind: NetworkKind::HostOnly,
            name: name.into(),
            ip: ip.into(),
            netmask: "255.255.255.0".into(),
            gateway: "192.168.56.1".into(),
        }
    }

    #[tokio::test]
    async fn matching_enabled_network_needs_no_mutation() {
        let (runner, nets) = setup("linux", "7.0.14r1");
        runner.on("list hostonlyifs", UP, 0);

        let net = nets
            .reconcile(&host_only("vboxnet0", "192.168.56.10"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(net.name(), "vboxnet0");
        assert!(mutations(&runner).is_empty());
    }

    #[tokio::test]
    async fn disabled_network_is_enabled_once_then_verified() {
        let (runner, nets) = setup("linux", "6.1.50r1");
        runner.on_seq(
            "list hostonlyifs",
            vec![(DOWN.to_string(), 0), (UP.to_string(), 0)],
        );

        nets.reconcile(&host_only("", "192.168.56.10")).await.unwrap();
        assert_eq!(
            mutations(&runner),
            vec!["hostonlyif ipconfig vboxnet0 --ip 192.168.56.1 --netmask 255.255.255.0"]
        );
        assert_eq!(runner.commands_matching("list hostonlyifs").len(), 2);
    }

    #[tokio::test]
    async fn network_that_stays_disabled_fails_after_one_enable() {
        let (runner, nets) = setup("linux", "6.1.50r1");
        runner.on("list hostonlyifs", DOWN, 0);

        let err = nets
            .reconcile(&host_only("vboxnet0", "192.168.56.10"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("to be enabled"), "{err:#}");
        assert_eq!(mutations(&runner).len(), 1);
    }

    #[tokio::test]
    async fn absent_network_is_created_once_then_verified() {
        let (runner, nets) = setup("linux", "6.1.50r1");
        runner.on_seq("list hostonlyifs", vec![(String::new(), 0), (UP.to_string(), 0)]);
        runner.on(
            "hostonlyif create",
            "0%...10%...100%\nInterface 'vboxnet0' was successfully created\n",
            0,
        );

        nets.reconcile(&host_only("vboxnet0", "192.168.56.10")).await.unwrap();
        assert_eq!(runner.commands_matching("hostonlyif create").len(), 1);
        assert_eq!(
            mutations(&runner),
            vec![
                "hostonlyif create",
                "hostonlyif ipconfig vboxnet0 --ip 192.168.56.1 --netmask 255.255.255.0",
            ]
        );
        assert_eq!(runner.commands_matching("list hostonlyifs").len(), 2);
    }

    #[tokio::test]
    async fn static_ip_outside_subnet_fails_without_mutation() {
        let (runner, nets) = setup("linux", "6.1.50r1");
        runner.on("list hostonlyifs", DOWN, 0);

        let err = nets
            .reconcile(&host_only("vboxnet0", "10.1.1.5"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("to fit within"));
        assert!(mutations(&runner).is_empty());
    }

    #[tokio::test]
    async fn misnamed_interface_is_cleaned_up() {
        let (runner, nets) = setup("linux", "6.1.50r1");
        runner.on("list hostonlyifs", "", 0);
        runner.on("hostonlyif create", "Interface 'vboxnet3' was successfully created", 0);
        runner.on("hostonlyif remove", "VBoxManage: error: busy", 1);

        let err = nets
            .reconcile(&host_only("vboxnet0", "192.168.56.10"))
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("to have name 'vboxnet0'"));
        // The failing cleanup is logged, not returned.
        assert!(!format!("{err:#}").contains("busy"));
        assert_eq!(runner.commands_matching("hostonlyif remove vboxnet3").len(), 1);
    }

    #[tokio::test]
    async fn failed_configuration_removes_created_interface() {
        let (runner, nets) = setup("linux", "6.1.50r1");
        runner.on("list hostonlyifs", "", 0);
        runner.on("hostonlyif create", "Interface 'vboxnet0' was successfully created", 0);
        runner.on("hostonlyif ipconfig", "VBoxManage: error: nope", 1);

        nets.reconcile(&host_only("", "192.168.56.10")).await.unwrap_err();
        assert_eq!(runner.commands_matching("hostonlyif remove vboxnet0").len(), 1);
    }

    #[tokio::test]
    async fn unnameable_interface_is_not_created() {
        let (runner, nets) = setup("linux", "6.1.50r1");
        runner.on("list hostonlyifs", "", 0);

        let err = nets
            .reconcile(&host_only("vboxnet5", "192.168.56.10"))
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("Expected to find Host-only network 'vboxnet5'"));
        assert!(mutations(&runner).is_empty());
    }

    #[tokio::test]
    async fn virtualbox_7_on_macos_uses_host_only_nets() {
        let (runner, nets) = setup("macos", "7.0.14r161095");
        let enabled = "Name:            vboxnet0
State:           Enabled
NetworkMask:     255.255.255.0
LowerIP:         192.168.56.1
UpperIP:         192.168.56.254
";
        runner.on_seq("list hostonlynets", vec![(String::new(), 0), (enabled.to_string(), 0)]);

        nets.reconcile(&host_only("", "192.168.56.10")).await.unwrap();
        assert_eq!(
            mutations(&runner),
            vec![
                "hostonlynet add --name=vboxnet0 --netmask=255.255.255.0 \
                 --lower-ip=192.168.56.1 --upper-ip=192.168.56.254 --enable"
            ]
        );
    }

    #[tokio::test]
    async fn existing_nat_network_counts_as_created() {
        let (runner, nets) = setup("linux", "7.0.14r1");
        let listed = "Name:        NatNetwork
Network:     10.0.2.0/24
DHCP Server: Yes
Enabled:     Yes
";
        runner.on_seq("list natnetworks", vec![(String::new(), 0), (listed.to_string(), 0)]);
        runner.on(
            "natnetwork add",
            "VBoxManage: error: NAT network 'NatNetwork' already exists",
            1,
        );

        let intent = NetworkIntent {
            kind: NetworkKind::NatNetwork,
            name: "NatNetwork".into(),
            ..Default::default()
        };
        let net = nets.reconcile(&intent).await.unwrap().unwrap();
        assert_eq!(net.kind(), NetworkKind::NatNetwork);
    }

    #[tokio::test]
    async fn missing_bridged_interface_is_fatal() {
        let (runner, nets) = setup("linux", "7.0.14r1");
        runner.on("list bridgedifs", "", 0);

        let intent = NetworkIntent {
            kind: NetworkKind::Bridged,
            name: "en0".into(),
            ..Default::default()
        };
        let err = nets.reconcile(&intent).await.unwrap_err();
        assert!(format!("{err:#}").contains("cannot be created"));
    }

    #[tokio::test]
    async fn plain_nat_needs_no_host_object() {
        let (runner, nets) = setup("linux", "7.0.14r1");
        let intent = NetworkIntent {
            kind: NetworkKind::Nat,
            ..Default::default()
        };
        assert!(nets.reconcile(&intent).await.unwrap().is_none());
        assert!(runner.commands().is_empty());
    }

    #[test]
    fn created_interface_name_is_parsed() {
        assert_eq!(
            parse_created_interface("Interface 'vboxnet2' was successfully created").unwrap(),
            "vboxnet2"
        );
        assert!(parse_created_interface("0%...100%").is_err());
    }
}
