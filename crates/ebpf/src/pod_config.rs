use std::net::IpAddr;

use anyhow::{Result, bail};
use meshproxy_config::Config;

/// Maximal amount of items like ports or address ranges to include or
/// exclude. The dataplane objects allocate fixed 244-byte map values, so
/// this cannot grow without rebuilding them.
pub const MAX_ITEM_LEN: usize = 10;

/// An IPv4 network in the 8-byte map layout: address (network order),
/// prefix length, three bytes of padding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Cidr {
    pub net: u32,
    pub mask: u8,
}

impl Cidr {
    fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.net.to_be_bytes());
        out.push(self.mask);
        out.extend_from_slice(&[0u8; 3]);
    }
}

/// Per-instance value of the local-pod map. Field order and padding mirror
/// the C struct compiled into the dataplane objects.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PodConfig {
    pub status_port: u16,
    pub exclude_out_ranges: [Cidr; MAX_ITEM_LEN],
    pub include_out_ranges: [Cidr; MAX_ITEM_LEN],
    pub include_in_ports: [u16; MAX_ITEM_LEN],
    pub include_out_ports: [u16; MAX_ITEM_LEN],
    pub exclude_in_ports: [u16; MAX_ITEM_LEN],
    pub exclude_out_ports: [u16; MAX_ITEM_LEN],
}

pub const POD_CONFIG_LEN: usize = 244;

fn fill_ports(label: &str, slots: &mut [u16; MAX_ITEM_LEN], reserved: &[u16], ports: &[u16]) -> Result<()> {
    if reserved.len() + ports.len() > MAX_ITEM_LEN {
        bail!(
            "maximal allowed amount of {label} ports ({}) exceeded ({})",
            MAX_ITEM_LEN - reserved.len(),
            ports.len()
        );
    }
    for (slot, port) in slots.iter_mut().zip(reserved.iter().chain(ports)) {
        *slot = *port;
    }
    Ok(())
}

impl PodConfig {
    pub fn from_config(cfg: &Config) -> Result<Self> {
        let inbound = &cfg.redirect.inbound;
        let outbound = &cfg.redirect.outbound;
        let mut pod = PodConfig::default();

        // The redirect ports themselves must never be re-captured.
        let reserved = [inbound.port, inbound.port_ipv6, outbound.port];
        fill_ports(
            "exclude inbound",
            &mut pod.exclude_in_ports,
            &reserved,
            &inbound.exclude_ports,
        )?;
        fill_ports(
            "exclude outbound",
            &mut pod.exclude_out_ports,
            &[],
            &outbound.exclude_ports,
        )?;
        fill_ports(
            "include inbound",
            &mut pod.include_in_ports,
            &[],
            &inbound.include_ports,
        )?;
        fill_ports(
            "include outbound",
            &mut pod.include_out_ports,
            &[],
            &outbound.include_ports,
        )?;
        Ok(pod)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(POD_CONFIG_LEN);
        out.extend_from_slice(&self.status_port.to_le_bytes());
        out.extend_from_slice(&[0u8; 2]);
        for cidr in &self.exclude_out_ranges {
            cidr.write_to(&mut out);
        }
        for cidr in &self.include_out_ranges {
            cidr.write_to(&mut out);
        }
        for ports in [
            &self.include_in_ports,
            &self.include_out_ports,
            &self.exclude_in_ports,
            &self.exclude_out_ports,
        ] {
            for port in ports {
                out.extend_from_slice(&port.to_le_bytes());
            }
        }
        out
    }
}

/// Map key: the instance address widened to 16 bytes, IPv4 in the trailing
/// four.
pub fn map_key(ip: IpAddr) -> [u8; 16] {
    let mut key = [0u8; 16];
    match ip {
        IpAddr::V4(v4) => key[12..].copy_from_slice(&v4.octets()),
        IpAddr::V6(v6) => key.copy_from_slice(&v6.octets()),
    }
    key
}
