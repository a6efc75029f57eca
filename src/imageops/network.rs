//! Network files written into the root filesystem.

use std::fmt::Write as _;

use super::FileOperation;
use crate::config::NetworkConfig;
use crate::error::Error;

pub const DEFAULT_INTERFACE: &str = "eth0";
pub const NETPLAN_DIR: &str = "/etc/netplan";
pub const NETPLAN_FILE: &str = "/etc/netplan/50-tftpi.yaml";
pub const INTERFACES_FILE: &str = "/etc/network/interfaces";

pub fn hostname_file(net: &NetworkConfig) -> String {
    format!("{}\n", net.hostname)
}

pub fn hosts_file(net: &NetworkConfig) -> String {
    format!(
        "127.0.0.1\tlocalhost\n\
         127.0.1.1\t{host}\n\
         {addr}\t{host}\n\
         \n\
         ::1\tip6-localhost ip6-loopback\n\
         fe00::0\tip6-localnet\n\
         ff00::0\tip6-mcastprefix\n\
         ff02::1\tip6-allnodes\n\
         ff02::2\tip6-allrouters\n",
        host = net.hostname,
        addr = net.ip.addr,
    )
}

/// Netplan document for a static address on `iface`.
pub fn netplan_yaml(net: &NetworkConfig, iface: &str) -> Result<String, Error> {
    net.ip.netmask()?;
    let mut out = String::new();
    let _ = writeln!(out, "network:");
    let _ = writeln!(out, "  version: 2");
    let _ = writeln!(out, "  renderer: networkd");
    let _ = writeln!(out, "  ethernets:");
    let _ = writeln!(out, "    {iface}:");
    let _ = writeln!(out, "      dhcp4: false");
    let _ = writeln!(out, "      addresses:");
    let _ = writeln!(out, "        - {}", net.ip);
    if let Some(gw) = net.gateway {
        let _ = writeln!(out, "      routes:");
        let _ = writeln!(out, "        - to: default");
        let _ = writeln!(out, "          via: {gw}");
    }
    if !net.dns.is_empty() {
        let dns: Vec<String> = net.dns.iter().map(|d| d.to_string()).collect();
        let _ = writeln!(out, "      nameservers:");
        let _ = writeln!(out, "        addresses: [{}]", dns.join(", "));
    }
    Ok(out)
}

/// Debian-style `/etc/network/interfaces`.
pub fn interfaces_file(net: &NetworkConfig, iface: &str) -> Result<String, Error> {
    let netmask = net.ip.netmask()?;
    let mut out = String::from("auto lo\niface lo inet loopback\n\n");
    let _ = writeln!(out, "auto {iface}");
    let _ = writeln!(out, "iface {iface} inet static");
    let _ = writeln!(out, "    address {}", net.ip.addr);
    let _ = writeln!(out, "    netmask {netmask}");
    if let Some(gw) = net.gateway {
        let _ = writeln!(out, "    gateway {gw}");
    }
    if !net.dns.is_empty() {
        let dns: Vec<String> = net.dns.iter().map(|d| d.to_string()).collect();
        let _ = writeln!(out, "    dns-nameservers {}", dns.join(" "));
    }
    Ok(out)
}

/// Writes for hostname, hosts and the address configuration. `netplan`
/// selects which address file is produced.
pub fn network_operations(
    net: &NetworkConfig,
    iface: &str,
    netplan: bool,
) -> Result<Vec<FileOperation>, Error> {
    net.validate()?;
    let mut ops = vec![
        FileOperation::write("/etc/hostname", hostname_file(net), 0o644),
        FileOperation::write("/etc/hosts", hosts_file(net), 0o644),
    ];
    if netplan {
        ops.push(FileOperation::write(
            NETPLAN_FILE,
            netplan_yaml(net, iface)?,
            0o600,
        ));
    } else {
        ops.push(FileOperation::mkdir("/etc/network", 0o755));
        ops.push(FileOperation::write(
            INTERFACES_FILE,
            interfaces_file(net, iface)?,
            0o644,
        ));
    }
    Ok(ops)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Ipv4Cidr;

    fn net(prefix: u8) -> NetworkConfig {
        NetworkConfig {
            hostname: "rk1-node1".into(),
            ip: Ipv4Cidr {
                addr: "192.168.1.101".parse().unwrap(),
                prefix,
            },
            gateway: Some("192.168.1.1".parse().unwrap()),
            dns: vec!["1.1.1.1".parse().unwrap(), "8.8.8.8".parse().unwrap()],
        }
    }

    #[test]
    fn netplan_has_static_address() {
        let yaml = netplan_yaml(&net(24), "eth0").unwrap();
        assert!(yaml.contains("    eth0:\n"));
        assert!(yaml.contains("- 192.168.1.101/24"));
        assert!(yaml.contains("via: 192.168.1.1"));
        assert!(yaml.contains("addresses: [1.1.1.1, 8.8.8.8]"));
    }

    #[test]
    fn interfaces_uses_netmask() {
        let text = interfaces_file(&net(16), "eth0").unwrap();
        assert!(text.contains("iface eth0 inet static"));
        assert!(text.contains("netmask 255.255.0.0"));
        assert!(text.contains("dns-nameservers 1.1.1.1 8.8.8.8"));
    }

    #[test]
    fn unsupported_prefix_is_rejected() {
        assert!(netplan_yaml(&net(20), "eth0").is_err());
        assert!(network_operations(&net(20), "eth0", false).is_err());
    }

    #[test]
    fn netplan_file_is_private() {
        let ops = network_operations(&net(24), "eth0", true).unwrap();
        let netplan = ops
            .iter()
            .find(|op| op.target() == NETPLAN_FILE)
            .unwrap();
        assert!(matches!(netplan, FileOperation::Write { mode: 0o600, .. }));
        assert_eq!(ops[0].target(), "/etc/hostname");
        assert!(!ops.iter().any(|op| op.target() == INTERFACES_FILE));
    }

    #[test]
    fn hosts_maps_hostname() {
        let hosts = hosts_file(&net(24));
        assert!(hosts.contains("127.0.1.1\trk1-node1"));
        assert!(hosts.contains("192.168.1.101\trk1-node1"));
    }
}
