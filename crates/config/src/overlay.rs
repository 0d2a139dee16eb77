use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::{Config, UidPortBypass};

/// Sparse user configuration, merged field-by-field onto the defaults.
/// Absent or zero-valued fields keep the default.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigOverlay {
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub name_prefix: Option<String>,
    pub inbound: FlowOverlay,
    pub outbound: FlowOverlay,
    pub dns: DnsOverlay,
    pub ebpf: EbpfOverlay,
    pub drop_invalid_packets: Option<bool>,
    pub ipv6: Option<bool>,
    pub verbose: Option<bool>,
    pub log: LogOverlay,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FlowOverlay {
    pub enabled: Option<bool>,
    pub port: Option<u16>,
    pub port_ipv6: Option<u16>,
    pub chain_name: Option<String>,
    pub redirect_chain_name: Option<String>,
    pub include_ports: Vec<u16>,
    pub exclude_ports: Vec<u16>,
    pub exclude_ports_for_uids: Vec<UidPortBypass>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DnsOverlay {
    pub enabled: Option<bool>,
    pub port: Option<u16>,
    pub conntrack_zone_split: Option<bool>,
    pub capture_all: Option<bool>,
    pub resolv_conf_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EbpfOverlay {
    pub enabled: Option<bool>,
    pub bpffs_path: Option<PathBuf>,
    pub cgroup_path: Option<PathBuf>,
    pub programs_path: Option<PathBuf>,
    pub instance_ip: Option<String>,
    pub tc_attach_iface: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogOverlay {
    pub enabled: Option<bool>,
    pub level: Option<u8>,
}

fn port_or(value: Option<u16>, default: u16) -> u16 {
    match value {
        // port 0 is the "unset" sentinel
        None | Some(0) => default,
        Some(port) => port,
    }
}

fn name_or(value: Option<String>, default: String) -> String {
    match value {
        Some(name) if !name.is_empty() => name,
        _ => default,
    }
}

impl ConfigOverlay {
    /// Merges this overlay over another, with `self` winning. Used to put
    /// command-line flags on top of a configuration file.
    pub fn over(self, base: ConfigOverlay) -> ConfigOverlay {
        ConfigOverlay {
            uid: self.uid.or(base.uid),
            gid: self.gid.or(base.gid),
            name_prefix: self.name_prefix.or(base.name_prefix),
            inbound: self.inbound.over(base.inbound),
            outbound: self.outbound.over(base.outbound),
            dns: DnsOverlay {
                enabled: self.dns.enabled.or(base.dns.enabled),
                port: self.dns.port.or(base.dns.port),
                conntrack_zone_split: self
                    .dns
                    .conntrack_zone_split
                    .or(base.dns.conntrack_zone_split),
                capture_all: self.dns.capture_all.or(base.dns.capture_all),
                resolv_conf_path: self.dns.resolv_conf_path.or(base.dns.resolv_conf_path),
            },
            ebpf: EbpfOverlay {
                enabled: self.ebpf.enabled.or(base.ebpf.enabled),
                bpffs_path: self.ebpf.bpffs_path.or(base.ebpf.bpffs_path),
                cgroup_path: self.ebpf.cgroup_path.or(base.ebpf.cgroup_path),
                programs_path: self.ebpf.programs_path.or(base.ebpf.programs_path),
                instance_ip: self.ebpf.instance_ip.or(base.ebpf.instance_ip),
                tc_attach_iface: self.ebpf.tc_attach_iface.or(base.ebpf.tc_attach_iface),
            },
            drop_invalid_packets: self.drop_invalid_packets.or(base.drop_invalid_packets),
            ipv6: self.ipv6.or(base.ipv6),
            verbose: self.verbose.or(base.verbose),
            log: LogOverlay {
                enabled: self.log.enabled.or(base.log.enabled),
                level: self.log.level.or(base.log.level),
            },
        }
    }

    /// Normalizes into a full [`Config`]: defaults filled in, derived
    /// fields resolved, validation applied. Fails before any side effect.
    pub fn into_config(self) -> Result<Config> {
        let Some(uid) = self.uid else {
            bail!("the owner UID of the sidecar process is required");
        };

        let mut cfg = Config::with_defaults(uid);
        cfg.gid = self.gid;

        if let Some(prefix) = self.name_prefix {
            cfg.redirect.name_prefix = prefix;
        }

        merge_flow(&mut cfg.redirect.inbound, self.inbound);
        merge_flow(&mut cfg.redirect.outbound, self.outbound);

        let dns = &mut cfg.redirect.dns;
        if let Some(enabled) = self.dns.enabled {
            dns.enabled = enabled;
        }
        dns.port = port_or(self.dns.port, dns.port);
        if let Some(split) = self.dns.conntrack_zone_split {
            dns.conntrack_zone_split = split;
        }
        if let Some(capture_all) = self.dns.capture_all {
            dns.capture_all = capture_all;
        }
        if let Some(path) = self.dns.resolv_conf_path {
            dns.resolv_conf_path = path;
        }

        let ebpf = &mut cfg.ebpf;
        if let Some(enabled) = self.ebpf.enabled {
            ebpf.enabled = enabled;
        }
        if let Some(path) = self.ebpf.bpffs_path {
            ebpf.bpffs_path = path;
        }
        if let Some(path) = self.ebpf.cgroup_path {
            ebpf.cgroup_path = path;
        }
        if let Some(path) = self.ebpf.programs_path {
            ebpf.programs_path = path;
        }
        if let Some(ip) = self.ebpf.instance_ip {
            ebpf.instance_ip = ip;
        }
        ebpf.tc_attach_iface = self.ebpf.tc_attach_iface;

        if let Some(drop_invalid) = self.drop_invalid_packets {
            cfg.drop_invalid_packets = drop_invalid;
        }
        if let Some(ipv6) = self.ipv6 {
            cfg.ipv6 = ipv6;
        }
        if let Some(verbose) = self.verbose {
            cfg.verbose = verbose;
        }
        if let Some(enabled) = self.log.enabled {
            cfg.log.enabled = enabled;
        }
        if let Some(level) = self.log.level {
            cfg.log.enabled = true;
            cfg.log.level = level;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_json(contents: &str) -> Result<ConfigOverlay> {
        serde_json::from_str(contents).context("failed to parse configuration file")
    }
}

impl FlowOverlay {
    fn over(self, base: FlowOverlay) -> FlowOverlay {
        FlowOverlay {
            enabled: self.enabled.or(base.enabled),
            port: self.port.or(base.port),
            port_ipv6: self.port_ipv6.or(base.port_ipv6),
            chain_name: self.chain_name.or(base.chain_name),
            redirect_chain_name: self.redirect_chain_name.or(base.redirect_chain_name),
            include_ports: if self.include_ports.is_empty() {
                base.include_ports
            } else {
                self.include_ports
            },
            exclude_ports: if self.exclude_ports.is_empty() {
                base.exclude_ports
            } else {
                self.exclude_ports
            },
            exclude_ports_for_uids: if self.exclude_ports_for_uids.is_empty() {
                base.exclude_ports_for_uids
            } else {
                self.exclude_ports_for_uids
            },
        }
    }
}

fn merge_flow(flow: &mut crate::TrafficFlow, overlay: FlowOverlay) {
    if let Some(enabled) = overlay.enabled {
        flow.enabled = enabled;
    }
    flow.port = port_or(overlay.port, flow.port);
    flow.port_ipv6 = port_or(overlay.port_ipv6, flow.port_ipv6);
    flow.chain_name = name_or(overlay.chain_name, std::mem::take(&mut flow.chain_name));
    flow.redirect_chain_name = name_or(
        overlay.redirect_chain_name,
        std::mem::take(&mut flow.redirect_chain_name),
    );
    if !overlay.include_ports.is_empty() {
        flow.include_ports = overlay.include_ports;
    }
    if !overlay.exclude_ports.is_empty() {
        flow.exclude_ports = overlay.exclude_ports;
    }
    if !overlay.exclude_ports_for_uids.is_empty() {
        flow.exclude_ports_for_uids = overlay.exclude_ports_for_uids;
    }
}
