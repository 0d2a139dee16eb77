//! In-kernel socket/hook backend. Programs and maps are pinned under the
//! BPF filesystem and driven through external tooling (`bpftool`, `tc`); the
//! dataplane programs themselves ship as pre-built objects.

mod pod_config;
mod tc;

use std::io::Write;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use meshproxy_config::Config;
use meshproxy_util::{CommandRunner, ensure_root, net};

pub use pod_config::{MAX_ITEM_LEN, PodConfig};

/// Pinned map locations relative to the BPF filesystem root. The dataplane
/// objects hard-code these, so they are part of the wire contract.
pub const MAP_LOCAL_POD_IPS: &str = "tc/globals/local_pod_ips";
const MAP_NETNS_POD_IPS: &str = "tc/globals/netns_pod_ips";
const MAP_COOKIE_ORIG_DST: &str = "tc/globals/cookie_orig_dst";
const MAP_PROCESS_IP: &str = "tc/globals/process_ip";
const MAP_PAIR_ORIG_DST: &str = "tc/globals/pair_orig_dst";
const MAP_SOCK_PAIR_MAP: &str = "tc/globals/sock_pair_map";

enum Attach {
    Cgroup(&'static str),
    Tc,
    None,
}

struct Program {
    name: &'static str,
    attach: Attach,
    cleanup_paths: &'static [&'static str],
}

const PROGRAMS: &[Program] = &[
    Program {
        name: "mesh_connect",
        attach: Attach::Cgroup("connect4"),
        cleanup_paths: &[
            "connect",
            MAP_COOKIE_ORIG_DST,
            MAP_NETNS_POD_IPS,
            MAP_LOCAL_POD_IPS,
            MAP_PROCESS_IP,
        ],
    },
    Program {
        name: "mesh_sockops",
        attach: Attach::Cgroup("sock_ops"),
        cleanup_paths: &[
            "sockops",
            MAP_COOKIE_ORIG_DST,
            MAP_PROCESS_IP,
            MAP_PAIR_ORIG_DST,
            MAP_SOCK_PAIR_MAP,
        ],
    },
    Program {
        name: "mesh_get_sockopts",
        attach: Attach::Cgroup("getsockopt"),
        cleanup_paths: &["get_sockopts", MAP_PAIR_ORIG_DST],
    },
    Program {
        name: "mesh_sendmsg",
        attach: Attach::Cgroup("sendmsg4"),
        cleanup_paths: &["sendmsg", MAP_COOKIE_ORIG_DST],
    },
    Program {
        name: "mesh_recvmsg",
        attach: Attach::Cgroup("recvmsg4"),
        cleanup_paths: &["recvmsg", MAP_COOKIE_ORIG_DST],
    },
    Program {
        name: "mesh_redir",
        attach: Attach::None,
        cleanup_paths: &["redir", MAP_SOCK_PAIR_MAP],
    },
    Program {
        name: "mesh_tc",
        attach: Attach::Tc,
        cleanup_paths: &["tc", MAP_LOCAL_POD_IPS, MAP_PAIR_ORIG_DST],
    },
];

/// The dataplane maps carry fixed-size arrays, so the port and bypass lists
/// are bounded. Three exclude-inbound slots are reserved for the redirect
/// ports themselves.
pub fn validate(cfg: &Config) -> Result<()> {
    let inbound = &cfg.redirect.inbound;
    let outbound = &cfg.redirect.outbound;

    for (flow_name, flow) in [("inbound", inbound), ("outbound", outbound)] {
        if flow.exclude_ports_for_uids.len() > MAX_ITEM_LEN {
            bail!(
                "maximal allowed amount of {flow_name} bypass entries ({MAX_ITEM_LEN}) exceeded ({})",
                flow.exclude_ports_for_uids.len()
            );
        }
        if flow.include_ports.len() > MAX_ITEM_LEN {
            bail!(
                "maximal allowed amount of {flow_name} include ports ({MAX_ITEM_LEN}) exceeded ({})",
                flow.include_ports.len()
            );
        }
    }

    let reserved = 3;
    if inbound.exclude_ports.len() > MAX_ITEM_LEN - reserved {
        bail!(
            "maximal allowed amount of inbound exclude ports ({}) exceeded ({})",
            MAX_ITEM_LEN - reserved,
            inbound.exclude_ports.len()
        );
    }
    if outbound.exclude_ports.len() > MAX_ITEM_LEN {
        bail!(
            "maximal allowed amount of outbound exclude ports ({MAX_ITEM_LEN}) exceeded ({})",
            outbound.exclude_ports.len()
        );
    }
    Ok(())
}

pub fn setup(cfg: &Config, runner: &CommandRunner, sink: &mut dyn Write) -> Result<String> {
    validate(cfg)?;

    let bpffs = &cfg.ebpf.bpffs_path;
    if !runner.dry_run {
        ensure_root()?;
        if !bpffs.join("tc/globals").is_dir() {
            bail!(
                "BPF filesystem is not prepared at {} (tc/globals missing)",
                bpffs.display()
            );
        }
    }

    let mut failures = Vec::new();
    for program in PROGRAMS {
        if let Err(err) = load_and_attach(cfg, program, runner) {
            failures.push(err.to_string());
        }
    }
    if !failures.is_empty() {
        bail!(
            "loading and attaching ebpf programs failed:\n\t{}",
            failures.join("\n\t")
        );
    }

    update_local_pod_map(cfg, runner)?;
    writeln!(
        sink,
        "local_pod_ips map was updated with current instance IP: {}",
        cfg.ebpf.instance_ip
    )?;
    Ok(String::new())
}

pub fn cleanup(cfg: &Config, runner: &CommandRunner, sink: &mut dyn Write) -> Result<String> {
    if !runner.dry_run {
        ensure_root()?;
    }

    if let Some(iface) = tc_interface(cfg, runner.dry_run)
        && let Err(err) = tc::cleanup(runner, &iface)
    {
        writeln!(sink, "warning: tc cleanup on {iface} failed: {err}")?;
    }

    if !runner.dry_run {
        for path in pinned_cleanup_paths(&cfg.ebpf.bpffs_path) {
            if !path.exists() {
                continue;
            }
            let removed = if path.is_dir() {
                std::fs::remove_dir_all(&path)
            } else {
                std::fs::remove_file(&path)
            };
            if let Err(err) = removed {
                writeln!(sink, "warning: failed to remove {}: {err}", path.display())?;
            }
        }
    }
    Ok(String::new())
}

/// Deduplicated pinned paths of every program, in declaration order.
fn pinned_cleanup_paths(bpffs: &Path) -> Vec<PathBuf> {
    let mut paths: Vec<PathBuf> = Vec::new();
    for program in PROGRAMS {
        for relative in program.cleanup_paths {
            let path = bpffs.join(relative);
            if !paths.contains(&path) {
                paths.push(path);
            }
        }
    }
    paths
}

fn tc_interface(cfg: &Config, dry_run: bool) -> Option<String> {
    if let Some(iface) = &cfg.ebpf.tc_attach_iface
        && (dry_run || net::interface_is_up(iface))
    {
        return Some(iface.clone());
    }
    net::non_loopback_interface_name().ok()
}

fn load_and_attach(cfg: &Config, program: &Program, runner: &CommandRunner) -> Result<()> {
    let object = cfg.ebpf.programs_path.join(format!("{}.o", program.name));
    let object = object.to_string_lossy();
    let pin_dir = cfg.ebpf.bpffs_path.join(program.name);
    let pin_dir = pin_dir.to_string_lossy();

    match program.attach {
        Attach::Tc => {
            let iface = tc_interface(cfg, runner.dry_run)
                .ok_or_else(|| anyhow!("getting non-loopback interface failed"))?;
            tc::attach(runner, &iface, &object)
                .with_context(|| format!("attaching {} failed", program.name))
        }
        Attach::Cgroup(attach_type) => {
            runner
                .run_combined("bpftool", &["prog", "loadall", &object, &pin_dir])
                .with_context(|| format!("loading {} failed", program.name))?;
            let cgroup = cfg.ebpf.cgroup_path.to_string_lossy();
            let pinned = format!("{pin_dir}/{}", program.name);
            runner
                .run_combined(
                    "bpftool",
                    &["cgroup", "attach", &cgroup, attach_type, "pinned", &pinned],
                )
                .with_context(|| format!("attaching {} failed", program.name))?;
            Ok(())
        }
        Attach::None => {
            runner
                .run_combined("bpftool", &["prog", "loadall", &object, &pin_dir])
                .with_context(|| format!("loading {} failed", program.name))?;
            Ok(())
        }
    }
}

/// Writes this instance's pod configuration into the pinned map, keyed by
/// the instance address.
fn update_local_pod_map(cfg: &Config, runner: &CommandRunner) -> Result<()> {
    let ip: IpAddr = cfg
        .ebpf
        .instance_ip
        .parse()
        .with_context(|| format!("error parsing instance IP {}", cfg.ebpf.instance_ip))?;

    let pod_config = PodConfig::from_config(cfg)?;
    let map_path = cfg.ebpf.bpffs_path.join(MAP_LOCAL_POD_IPS);
    let map_path = map_path.to_string_lossy();

    let key_hex = hex_bytes(&pod_config::map_key(ip));
    let value_hex = hex_bytes(&pod_config.to_bytes());

    let mut args: Vec<&str> = vec!["map", "update", "pinned", &map_path, "key", "hex"];
    args.extend(key_hex.iter().map(String::as_str));
    args.push("value");
    args.push("hex");
    args.extend(value_hex.iter().map(String::as_str));
    args.push("any");

    runner
        .run_combined("bpftool", &args)
        .context("updating pinned local_pod_ips map failed")?;
    Ok(())
}

fn hex_bytes(bytes: &[u8]) -> Vec<String> {
    bytes.iter().map(|byte| format!("{byte:02x}")).collect()
}
