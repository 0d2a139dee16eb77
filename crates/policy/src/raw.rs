use anyhow::{Result, bail};
use meshproxy_config::{Config, DNS_PORT, Family};
use meshproxy_rules::{OwnerMatch, Param, PortMatch, Table, Target};

use crate::PolicyEnv;

/// Conntrack zone split for DNS. The sidecar's own resolver queries are
/// tracked in zone 1 and redirected application queries in zone 2, so the
/// two flavours of otherwise identical 5-tuples never collide.
pub fn build_raw(cfg: &Config, env: &PolicyEnv, family: Family) -> Result<Table> {
    let dns = &cfg.redirect.dns;
    let resolvers = env.resolver_addresses(family);
    if !dns.capture_all && resolvers.is_empty() {
        bail!(
            "conntrack zone splitting is enabled but {} yielded no {} nameservers",
            dns.resolv_conf_path.display(),
            family.name()
        );
    }

    let mut raw = Table::raw();

    let output = raw.output();
    output.append(
        vec![
            Param::udp_with(vec![PortMatch::dport(DNS_PORT)]),
            Param::owner(vec![OwnerMatch::uid(cfg.uid)]),
        ],
        Target::CtZone(1),
    );
    if let Some(gid) = cfg.gid {
        output.append(
            vec![
                Param::udp_with(vec![PortMatch::dport(DNS_PORT)]),
                Param::owner(vec![OwnerMatch::gid(gid)]),
            ],
            Target::CtZone(1),
        );
    }
    output.append(
        vec![
            Param::udp_with(vec![PortMatch::sport(dns.port)]),
            Param::owner(vec![OwnerMatch::uid(cfg.uid)]),
        ],
        Target::CtZone(2),
    );
    if let Some(gid) = cfg.gid {
        output.append(
            vec![
                Param::udp_with(vec![PortMatch::sport(dns.port)]),
                Param::owner(vec![OwnerMatch::gid(gid)]),
            ],
            Target::CtZone(2),
        );
    }
    if dns.capture_all {
        output.append(
            vec![Param::udp_with(vec![PortMatch::dport(DNS_PORT)])],
            Target::CtZone(2),
        );
    } else {
        for address in &resolvers {
            output.append(
                vec![
                    Param::destination(address.clone()),
                    Param::udp_with(vec![PortMatch::dport(DNS_PORT)]),
                ],
                Target::CtZone(2),
            );
        }
    }

    let prerouting = raw.prerouting();
    if dns.capture_all {
        prerouting.append(
            vec![Param::udp_with(vec![PortMatch::sport(DNS_PORT)])],
            Target::CtZone(1),
        );
    } else {
        for address in &resolvers {
            prerouting.append(
                vec![
                    Param::destination(address.clone()),
                    Param::udp_with(vec![PortMatch::sport(DNS_PORT)]),
                ],
                Target::CtZone(1),
            );
        }
    }

    Ok(raw)
}
