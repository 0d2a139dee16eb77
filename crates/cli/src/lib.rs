use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use meshproxy_config::{ConfigOverlay, UidPortBypass};
use meshproxy_rules::{IdSpec, PortSpec, Proto};

#[derive(Parser, Debug)]
#[command(
    name = "meshproxy",
    version,
    about = "Transparent traffic redirection for a mesh sidecar"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Install the redirect rules
    Install(RunArgs),
    /// Tear down backend state (eBPF backend only; packet-filter rules are
    /// applied additively and left to external tooling)
    Cleanup(RunArgs),
}

#[derive(Args, Debug, Clone, Default)]
pub struct RunArgs {
    /// Sparse JSON configuration file; flags override file values
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// UID of the sidecar process (required unless set in the config file)
    #[arg(long)]
    pub uid: Option<u32>,

    /// GID of the sidecar process
    #[arg(long)]
    pub gid: Option<u32>,

    /// Prefix applied to every generated chain name
    #[arg(long)]
    pub name_prefix: Option<String>,

    /// Port the sidecar accepts inbound traffic on
    #[arg(long)]
    pub inbound_port: Option<u16>,

    /// Inbound port for the IPv6 rules (defaults to a separate port)
    #[arg(long)]
    pub inbound_port_v6: Option<u16>,

    /// Port the sidecar accepts outbound traffic on
    #[arg(long)]
    pub outbound_port: Option<u16>,

    /// Skip inbound redirection
    #[arg(long)]
    pub disable_inbound: bool,

    /// Skip outbound redirection
    #[arg(long)]
    pub disable_outbound: bool,

    /// Redirect only these inbound ports (wins over excludes)
    #[arg(long, value_delimiter = ',')]
    pub include_inbound_ports: Vec<u16>,

    /// Never redirect these inbound ports
    #[arg(long, value_delimiter = ',')]
    pub exclude_inbound_ports: Vec<u16>,

    /// Redirect only these outbound ports (wins over excludes)
    #[arg(long, value_delimiter = ',')]
    pub include_outbound_ports: Vec<u16>,

    /// Never redirect these outbound ports
    #[arg(long, value_delimiter = ',')]
    pub exclude_outbound_ports: Vec<u16>,

    /// Bypass outbound traffic per owner, format <tcp|udp>:<port[-port]>:<uid[-uid]>
    #[arg(long, value_parser = parse_bypass_entry)]
    pub exclude_outbound_ports_for_uids: Vec<UidPortBypass>,

    /// Redirect DNS traffic to the sidecar
    #[arg(long)]
    pub redirect_dns: bool,

    /// Capture every UDP/53 flow, not only flows to the configured resolvers
    #[arg(long)]
    pub capture_all_dns: bool,

    /// Port the sidecar serves DNS on
    #[arg(long)]
    pub dns_port: Option<u16>,

    /// Disable the conntrack zone split for captured DNS
    #[arg(long)]
    pub no_conntrack_zone_split: bool,

    /// Resolver configuration to take upstream servers from
    #[arg(long)]
    pub resolv_conf: Option<PathBuf>,

    /// Drop packets conntrack considers invalid
    #[arg(long)]
    pub drop_invalid_packets: bool,

    /// Also generate and apply the IPv6 rules
    #[arg(long)]
    pub ipv6: bool,

    /// Log matched packets at this kernel log level (0-7)
    #[arg(long)]
    pub log_level: Option<u8>,

    /// Render short flags and skip script comments
    #[arg(long)]
    pub quiet: bool,

    /// Use the in-kernel socket/hook backend instead of the packet filter
    #[arg(long)]
    pub ebpf: bool,

    /// BPF filesystem root the programs and maps are pinned under
    #[arg(long)]
    pub bpffs_path: Option<PathBuf>,

    /// cgroup2 mount the programs are attached to
    #[arg(long)]
    pub cgroup_path: Option<PathBuf>,

    /// Directory holding the pre-built dataplane objects
    #[arg(long)]
    pub ebpf_programs_path: Option<PathBuf>,

    /// Address of this instance, the local-pod map key
    #[arg(long)]
    pub ebpf_instance_ip: Option<String>,

    /// Interface to attach the tc programs to (default: first non-loopback)
    #[arg(long)]
    pub ebpf_tc_attach_iface: Option<String>,

    /// Render the scripts without touching the host
    #[arg(long)]
    pub dry_run: bool,
}

pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// `<tcp|udp>:<port[-port]>:<uid[-uid]>`, e.g. `udp:53:106-108`.
pub fn parse_bypass_entry(raw: &str) -> Result<UidPortBypass, String> {
    let mut fields = raw.split(':');
    let (Some(proto), Some(ports), Some(uids), None) =
        (fields.next(), fields.next(), fields.next(), fields.next())
    else {
        return Err(format!("expected <protocol>:<ports>:<uids>, got {raw:?}"));
    };
    let protocol = match proto {
        "tcp" => Proto::Tcp,
        "udp" => Proto::Udp,
        other => return Err(format!("unknown protocol {other:?}")),
    };
    let ports = parse_range(ports, PortSpec::Value, PortSpec::Range)
        .ok_or_else(|| format!("invalid port specification {ports:?}"))?;
    let uids = parse_range(uids, IdSpec::Value, IdSpec::Range)
        .ok_or_else(|| format!("invalid uid specification {uids:?}"))?;
    Ok(UidPortBypass {
        protocol,
        ports,
        uids,
    })
}

fn parse_range<N: std::str::FromStr, S>(
    raw: &str,
    value: impl Fn(N) -> S,
    range: impl Fn(N, N) -> S,
) -> Option<S> {
    match raw.split_once('-') {
        Some((begin, end)) => Some(range(begin.parse().ok()?, end.parse().ok()?)),
        None => Some(value(raw.parse().ok()?)),
    }
}

impl RunArgs {
    /// Flags become an overlay with the same shape as the config file, so
    /// the merge precedence is flags > file > defaults.
    pub fn to_overlay(&self) -> ConfigOverlay {
        let mut overlay = ConfigOverlay {
            uid: self.uid,
            gid: self.gid,
            name_prefix: self.name_prefix.clone(),
            drop_invalid_packets: self.drop_invalid_packets.then_some(true),
            ipv6: self.ipv6.then_some(true),
            verbose: self.quiet.then_some(false),
            ..Default::default()
        };

        overlay.inbound.enabled = self.disable_inbound.then_some(false);
        overlay.inbound.port = self.inbound_port;
        overlay.inbound.port_ipv6 = self.inbound_port_v6;
        overlay.inbound.include_ports = self.include_inbound_ports.clone();
        overlay.inbound.exclude_ports = self.exclude_inbound_ports.clone();

        overlay.outbound.enabled = self.disable_outbound.then_some(false);
        overlay.outbound.port = self.outbound_port;
        overlay.outbound.include_ports = self.include_outbound_ports.clone();
        overlay.outbound.exclude_ports = self.exclude_outbound_ports.clone();
        overlay.outbound.exclude_ports_for_uids = self.exclude_outbound_ports_for_uids.clone();

        overlay.dns.enabled = self.redirect_dns.then_some(true);
        overlay.dns.capture_all = self.capture_all_dns.then_some(true);
        overlay.dns.port = self.dns_port;
        overlay.dns.conntrack_zone_split = self.no_conntrack_zone_split.then_some(false);
        overlay.dns.resolv_conf_path = self.resolv_conf.clone();

        overlay.ebpf.enabled = self.ebpf.then_some(true);
        overlay.ebpf.bpffs_path = self.bpffs_path.clone();
        overlay.ebpf.cgroup_path = self.cgroup_path.clone();
        overlay.ebpf.programs_path = self.ebpf_programs_path.clone();
        overlay.ebpf.instance_ip = self.ebpf_instance_ip.clone();
        overlay.ebpf.tc_attach_iface = self.ebpf_tc_attach_iface.clone();

        overlay.log.level = self.log_level;

        overlay
    }
}
