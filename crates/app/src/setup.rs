use std::io::Write;

use anyhow::{Result, anyhow};

use meshproxy_config::{Config, Family};
use meshproxy_policy::PolicyEnv;
use meshproxy_util::{CommandRunner, ensure_root, find_in_path};

use crate::ops::HostProbes;

/// Single dispatch point between the two data-plane backends.
pub fn setup(
    cfg: &Config,
    probes: &impl HostProbes,
    runner: &CommandRunner,
    sink: &mut dyn Write,
) -> Result<String> {
    if cfg.ebpf.enabled {
        return meshproxy_ebpf::setup(cfg, runner, sink);
    }

    if !runner.dry_run {
        ensure_root()?;
        ensure_restore_utilities(cfg)?;
    }

    let env = build_policy_env(cfg, probes)?;
    meshproxy_restore::install(cfg, &env, runner, sink)
}

/// The packet-filter rules are applied additively (`--noflush`), so their
/// removal is left to external tooling; only the eBPF backend owns state
/// worth tearing down.
pub fn cleanup(cfg: &Config, runner: &CommandRunner, sink: &mut dyn Write) -> Result<String> {
    if cfg.ebpf.enabled {
        return meshproxy_ebpf::cleanup(cfg, runner, sink);
    }
    Ok(String::new())
}

fn ensure_restore_utilities(cfg: &Config) -> Result<()> {
    let mut required = vec![Family::V4.restore_binary()];
    if cfg.ipv6 {
        required.push(Family::V6.restore_binary());
    }
    for utility in required {
        if find_in_path(utility).is_none() {
            return Err(anyhow!("missing dependency: {utility}"));
        }
    }
    Ok(())
}

fn build_policy_env(cfg: &Config, probes: &impl HostProbes) -> Result<PolicyEnv> {
    let loopback = probes.loopback_interface()?;
    let name_servers = if cfg.should_redirect_dns() && !cfg.should_capture_all_dns() {
        probes.name_servers(&cfg.redirect.dns.resolv_conf_path)?
    } else {
        Default::default()
    };
    Ok(PolicyEnv {
        loopback,
        name_servers,
    })
}
