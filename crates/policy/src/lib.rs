//! Translates a normalized configuration into restore-utility scripts,
//! one per address family.

mod mangle;
mod nat;
mod raw;

use anyhow::Result;
use meshproxy_config::{Config, Family};
use meshproxy_rules::Script;
use meshproxy_util::resolv::NameServers;

pub use mangle::build_mangle;
pub use nat::build_nat;
pub use raw::build_raw;

/// Host facts the policy depends on: the loopback interface name and the
/// upstream resolvers parsed from the resolver configuration.
#[derive(Debug, Clone, Default)]
pub struct PolicyEnv {
    pub loopback: String,
    pub name_servers: NameServers,
}

impl PolicyEnv {
    /// Resolver addresses of the given family, rendered for `-d` clauses,
    /// in file order.
    fn resolver_addresses(&self, family: Family) -> Vec<String> {
        match family {
            Family::V4 => self.name_servers.v4.iter().map(|ip| ip.to_string()).collect(),
            Family::V6 => self.name_servers.v6.iter().map(|ip| ip.to_string()).collect(),
        }
    }
}

/// Builds the complete script for one family: mangle only when invalid
/// packets are dropped, raw only when zone splitting applies, nat always.
pub fn build_script(
    cfg: &Config,
    env: &PolicyEnv,
    family: Family,
    conntrack_zone_split: bool,
) -> Result<String> {
    let mut script = Script::new();
    if cfg.drop_invalid_packets {
        script.push(build_mangle(cfg));
    }
    if conntrack_zone_split {
        script.push(build_raw(cfg, env, family)?);
    }
    script.push(build_nat(cfg, env, family)?);
    Ok(script.render(cfg.verbose))
}
