//! Normalized redirect configuration and the sparse overlay it is merged
//! from. The pipeline consumes one immutable [`Config`] per invocation.

mod overlay;

use std::path::PathBuf;

use anyhow::{Result, bail};
use meshproxy_rules::{IdSpec, PortSpec, Proto};
use serde::{Deserialize, Serialize};

pub use overlay::{ConfigOverlay, DnsOverlay, EbpfOverlay, FlowOverlay, LogOverlay};

pub const DNS_PORT: u16 = 53;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    pub fn name(self) -> &'static str {
        match self {
            Family::V4 => "ipv4",
            Family::V6 => "ipv6",
        }
    }

    pub fn localhost_cidr(self) -> &'static str {
        match self {
            Family::V4 => "127.0.0.1/32",
            Family::V6 => "::1/128",
        }
    }

    /// Source the sidecar uses when re-emitting inbound traffic on
    /// loopback, marking it as already processed.
    pub fn passthrough_source_cidr(self) -> &'static str {
        match self {
            Family::V4 => "127.0.0.6/32",
            Family::V6 => "::6/128",
        }
    }

    pub fn restore_binary(self) -> &'static str {
        match self {
            Family::V4 => "iptables-restore",
            Family::V6 => "ip6tables-restore",
        }
    }
}

/// One `(uids, ports, protocol)` bypass entry, rendered as an owner RETURN
/// in the OUTPUT chain ahead of any capture rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UidPortBypass {
    pub protocol: Proto,
    pub ports: PortSpec,
    pub uids: IdSpec,
}

#[derive(Debug, Clone)]
pub struct TrafficFlow {
    pub enabled: bool,
    pub port: u16,
    /// Alternate redirect port for the v6 script; 0 reuses `port`.
    pub port_ipv6: u16,
    pub chain_name: String,
    pub redirect_chain_name: String,
    pub include_ports: Vec<u16>,
    pub exclude_ports: Vec<u16>,
    pub exclude_ports_for_uids: Vec<UidPortBypass>,
}

impl TrafficFlow {
    pub fn redirect_port(&self, family: Family) -> u16 {
        match family {
            Family::V4 => self.port,
            Family::V6 if self.port_ipv6 != 0 => self.port_ipv6,
            Family::V6 => self.port,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DnsConfig {
    pub enabled: bool,
    pub port: u16,
    pub conntrack_zone_split: bool,
    pub capture_all: bool,
    pub resolv_conf_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub enabled: bool,
    pub level: u8,
}

#[derive(Debug, Clone)]
pub struct EbpfConfig {
    pub enabled: bool,
    pub bpffs_path: PathBuf,
    pub cgroup_path: PathBuf,
    pub programs_path: PathBuf,
    pub instance_ip: String,
    pub tc_attach_iface: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Redirect {
    pub name_prefix: String,
    pub inbound: TrafficFlow,
    pub outbound: TrafficFlow,
    pub dns: DnsConfig,
}

impl Redirect {
    pub fn full_name(&self, stem: &str) -> String {
        format!("{}{}", self.name_prefix, stem)
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub uid: u32,
    pub gid: Option<u32>,
    pub redirect: Redirect,
    pub ebpf: EbpfConfig,
    pub drop_invalid_packets: bool,
    pub ipv6: bool,
    pub verbose: bool,
    pub log: LogConfig,
}

impl Config {
    /// The documented defaults with the caller-supplied owner UID filled in.
    pub fn with_defaults(uid: u32) -> Self {
        Self {
            uid,
            gid: None,
            redirect: Redirect {
                name_prefix: String::new(),
                inbound: TrafficFlow {
                    enabled: true,
                    port: 15006,
                    port_ipv6: 15010,
                    chain_name: "MESH_INBOUND".to_string(),
                    redirect_chain_name: "MESH_INBOUND_REDIRECT".to_string(),
                    include_ports: Vec::new(),
                    exclude_ports: Vec::new(),
                    exclude_ports_for_uids: Vec::new(),
                },
                outbound: TrafficFlow {
                    enabled: true,
                    port: 15001,
                    port_ipv6: 0,
                    chain_name: "MESH_OUTBOUND".to_string(),
                    redirect_chain_name: "MESH_OUTBOUND_REDIRECT".to_string(),
                    include_ports: Vec::new(),
                    exclude_ports: Vec::new(),
                    exclude_ports_for_uids: Vec::new(),
                },
                dns: DnsConfig {
                    enabled: false,
                    port: 15053,
                    conntrack_zone_split: true,
                    capture_all: false,
                    resolv_conf_path: PathBuf::from("/etc/resolv.conf"),
                },
            },
            ebpf: EbpfConfig {
                enabled: false,
                bpffs_path: PathBuf::from("/sys/fs/bpf"),
                cgroup_path: PathBuf::from("/sys/fs/cgroup"),
                programs_path: PathBuf::from("/usr/local/lib/meshproxy/ebpf"),
                instance_ip: String::new(),
                tc_attach_iface: None,
            },
            drop_invalid_packets: false,
            ipv6: false,
            verbose: true,
            log: LogConfig {
                enabled: false,
                level: 7,
            },
        }
    }

    pub fn should_redirect_dns(&self) -> bool {
        self.redirect.dns.enabled
    }

    pub fn should_capture_all_dns(&self) -> bool {
        self.redirect.dns.capture_all
    }

    /// Zone splitting needs the CT extension, whose availability is probed
    /// once per run.
    pub fn should_conntrack_zone_split(&self, conntrack_probe_ok: bool) -> bool {
        self.redirect.dns.enabled && self.redirect.dns.conntrack_zone_split && conntrack_probe_ok
    }

    pub fn validate(&self) -> Result<()> {
        validate_flow("inbound", &self.redirect.inbound)?;
        validate_flow("outbound", &self.redirect.outbound)?;
        if self.log.enabled && self.log.level > 7 {
            bail!("log level {} is out of range (0-7)", self.log.level);
        }
        if self.ebpf.enabled && self.ebpf.instance_ip.is_empty() {
            bail!("ebpf backend requires the instance IP address");
        }
        Ok(())
    }
}

fn validate_flow(flow_name: &str, flow: &TrafficFlow) -> Result<()> {
    for port in flow.include_ports.iter().chain(&flow.exclude_ports) {
        if *port == 0 {
            bail!("{flow_name}: port 0 is not a valid include/exclude port");
        }
    }
    for bypass in &flow.exclude_ports_for_uids {
        match bypass.ports {
            PortSpec::Value(0) => {
                bail!("{flow_name}: port 0 is not a valid bypass port")
            }
            PortSpec::Range(begin, end) if begin == 0 || begin > end => {
                bail!("{flow_name}: invalid bypass port range {begin}:{end}")
            }
            _ => {}
        }
        if let IdSpec::Range(begin, end) = bypass.uids
            && begin > end
        {
            bail!("{flow_name}: invalid bypass uid range {begin}-{end}");
        }
    }
    Ok(())
}
