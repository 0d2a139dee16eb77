use anyhow::{Result, bail};
use meshproxy_config::{Config, DNS_PORT, Family};
use meshproxy_rules::{Chain, OwnerMatch, Param, PortMatch, Table, Target};

use crate::PolicyEnv;

const LOG_PREFIX_PREROUTING: &str = "meshproxy:prerouting";
const LOG_PREFIX_OUTPUT: &str = "meshproxy:output";

/// `-p tcp`, excluding the DNS port when DNS capture is on so that
/// captured DNS lookups are not swallowed by the TCP rules.
fn tcp_not_dns(redirect_dns: bool) -> Param {
    if redirect_dns {
        Param::tcp_with(vec![PortMatch::dport(DNS_PORT).negate()])
    } else {
        Param::tcp()
    }
}

pub fn build_nat(cfg: &Config, env: &PolicyEnv, family: Family) -> Result<Table> {
    let redirect = &cfg.redirect;
    let inbound_chain = redirect.full_name(&redirect.inbound.chain_name);
    let inbound_redirect_chain = redirect.full_name(&redirect.inbound.redirect_chain_name);
    let outbound_chain = redirect.full_name(&redirect.outbound.chain_name);
    let outbound_redirect_chain = redirect.full_name(&redirect.outbound.redirect_chain_name);

    let redirect_dns = cfg.should_redirect_dns();
    let capture_all_dns = cfg.should_capture_all_dns();
    let resolvers = env.resolver_addresses(family);
    if redirect_dns && !capture_all_dns && resolvers.is_empty() {
        bail!(
            "DNS redirection is enabled but {} yielded no {} nameservers",
            redirect.dns.resolv_conf_path.display(),
            family.name()
        );
    }

    let mut nat = Table::nat();

    nat.prerouting()
        .append_if(
            cfg.log.enabled,
            vec![],
            Target::log(LOG_PREFIX_PREROUTING, cfg.log.level),
        )
        .append(vec![Param::tcp()], Target::chain(inbound_chain.clone()));

    let output = nat.output();
    output.append_if(
        cfg.log.enabled,
        vec![],
        Target::log(LOG_PREFIX_OUTPUT, cfg.log.level),
    );
    // Operator bypass entries go first so they win over any capture rule.
    for bypass in &redirect.outbound.exclude_ports_for_uids {
        output.append(
            vec![
                Param::proto_with(bypass.protocol, vec![PortMatch::dport(bypass.ports)]),
                Param::owner(vec![OwnerMatch::uid(bypass.uids)]),
            ],
            Target::Return,
        );
    }
    if redirect_dns {
        // The sidecar itself must still reach the real resolvers.
        output.append(
            vec![
                Param::udp_with(vec![PortMatch::dport(DNS_PORT)]),
                Param::owner(vec![OwnerMatch::uid(cfg.uid)]),
            ],
            Target::Return,
        );
        if let Some(gid) = cfg.gid {
            output.append(
                vec![
                    Param::udp_with(vec![PortMatch::dport(DNS_PORT)]),
                    Param::owner(vec![OwnerMatch::gid(gid)]),
                ],
                Target::Return,
            );
        }
        if capture_all_dns {
            output.append(
                vec![Param::udp_with(vec![PortMatch::dport(DNS_PORT)])],
                Target::redirect_to(redirect.dns.port),
            );
        } else {
            for address in &resolvers {
                output.append(
                    vec![
                        Param::destination(address.clone()),
                        Param::udp_with(vec![PortMatch::dport(DNS_PORT)]),
                    ],
                    Target::redirect_to(redirect.dns.port),
                );
            }
        }
    }
    output.append(vec![Param::tcp()], Target::chain(outbound_chain.clone()));

    let mesh_inbound = build_mesh_inbound(cfg, &inbound_chain, &inbound_redirect_chain);
    let mesh_outbound = build_mesh_outbound(
        cfg,
        env,
        family,
        &resolvers,
        &outbound_chain,
        &inbound_redirect_chain,
        &outbound_redirect_chain,
    );
    let mesh_inbound_redirect = build_redirect_chain(
        &inbound_redirect_chain,
        redirect.inbound.redirect_port(family),
    );
    let mesh_outbound_redirect = build_redirect_chain(
        &outbound_redirect_chain,
        redirect.outbound.redirect_port(family),
    );

    Ok(nat
        .with_chain(mesh_inbound)
        .with_chain(mesh_outbound)
        .with_chain(mesh_inbound_redirect)
        .with_chain(mesh_outbound_redirect))
}

fn build_mesh_inbound(cfg: &Config, chain_name: &str, redirect_chain: &str) -> Chain {
    let flow = &cfg.redirect.inbound;
    let mut chain = Chain::new(chain_name);

    if !flow.enabled {
        chain.append(vec![Param::tcp()], Target::Return);
        return chain;
    }

    if !flow.include_ports.is_empty() {
        for port in &flow.include_ports {
            chain.append(
                vec![Param::tcp_with(vec![PortMatch::dport(*port)])],
                Target::chain(redirect_chain),
            );
        }
        return chain;
    }

    for port in &flow.exclude_ports {
        chain.append(
            vec![Param::tcp_with(vec![PortMatch::dport(*port)])],
            Target::Return,
        );
    }
    chain.append(vec![Param::tcp()], Target::chain(redirect_chain));
    chain
}

/// The rule order here is load-bearing: the passthrough return must precede
/// every owner match (the sidecar re-emits inbound traffic from the
/// passthrough source on loopback, which would otherwise loop back into the
/// proxy), and the sidecar-UID return sits after the loopback branches so
/// that sidecar-to-local-mesh traffic still reaches the inbound redirect.
fn build_mesh_outbound(
    cfg: &Config,
    env: &PolicyEnv,
    family: Family,
    resolvers: &[String],
    chain_name: &str,
    inbound_redirect_chain: &str,
    outbound_redirect_chain: &str,
) -> Chain {
    let flow = &cfg.redirect.outbound;
    let redirect_dns = cfg.should_redirect_dns();
    let localhost = family.localhost_cidr();
    let mut chain = Chain::new(chain_name);

    if !flow.enabled {
        chain.append(vec![Param::tcp()], Target::Return);
        return chain;
    }

    if flow.include_ports.is_empty() {
        for port in &flow.exclude_ports {
            chain.append(
                vec![Param::tcp_with(vec![PortMatch::dport(*port)])],
                Target::Return,
            );
        }
    }

    chain.append(
        vec![
            Param::source(family.passthrough_source_cidr()),
            Param::out_interface(&env.loopback),
        ],
        Target::Return,
    );

    let owner_rules = |chain: &mut Chain, owner: OwnerMatch, not_owner: OwnerMatch| {
        chain
            .append(
                vec![
                    tcp_not_dns(redirect_dns),
                    Param::out_interface(&env.loopback),
                    Param::not_destination(localhost),
                    Param::owner(vec![owner.clone()]),
                ],
                Target::chain(inbound_redirect_chain),
            )
            .append(
                vec![
                    tcp_not_dns(redirect_dns),
                    Param::out_interface(&env.loopback),
                    Param::owner(vec![not_owner]),
                ],
                Target::Return,
            )
            .append(vec![Param::owner(vec![owner])], Target::Return);
    };

    owner_rules(
        &mut chain,
        OwnerMatch::uid(cfg.uid),
        OwnerMatch::uid(cfg.uid).negate(),
    );
    if let Some(gid) = cfg.gid {
        owner_rules(&mut chain, OwnerMatch::gid(gid), OwnerMatch::gid(gid).negate());
    }

    if redirect_dns {
        if cfg.should_capture_all_dns() {
            chain.append(
                vec![Param::tcp_with(vec![PortMatch::dport(DNS_PORT)])],
                Target::redirect_to(cfg.redirect.dns.port),
            );
        } else {
            for address in resolvers {
                chain.append(
                    vec![
                        Param::destination(address.clone()),
                        Param::tcp_with(vec![PortMatch::dport(DNS_PORT)]),
                    ],
                    Target::redirect_to(cfg.redirect.dns.port),
                );
            }
        }
    }

    chain.append(vec![Param::destination(localhost)], Target::Return);

    if flow.include_ports.is_empty() {
        chain.append(vec![], Target::chain(outbound_redirect_chain));
    } else {
        for port in &flow.include_ports {
            chain.append(
                vec![Param::tcp_with(vec![PortMatch::dport(*port)])],
                Target::chain(outbound_redirect_chain),
            );
        }
    }

    chain
}

fn build_redirect_chain(chain_name: &str, port: u16) -> Chain {
    let mut chain = Chain::new(chain_name);
    chain.append(vec![Param::tcp()], Target::redirect_to(port));
    chain
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshproxy_config::UidPortBypass;
    use meshproxy_rules::{IdSpec, PortSpec, Proto};
    use meshproxy_util::resolv::NameServers;
    use std::net::{Ipv4Addr, Ipv6Addr};

    fn env() -> PolicyEnv {
        PolicyEnv {
            loopback: "lo".to_string(),
            name_servers: NameServers {
                v4: vec![Ipv4Addr::new(8, 8, 8, 8), Ipv4Addr::new(1, 1, 1, 1)],
                v6: vec!["2606:4700:4700::1111".parse::<Ipv6Addr>().unwrap()],
            },
        }
    }

    fn quiet(uid: u32) -> Config {
        let mut cfg = Config::with_defaults(uid);
        cfg.verbose = false;
        cfg
    }

    fn render(cfg: &Config, family: Family) -> String {
        build_nat(cfg, &env(), family).unwrap().render(cfg.verbose)
    }

    fn chain_rules(out: &str, chain: &str) -> Vec<String> {
        let prefix = format!("-A {chain} ");
        out.lines()
            .filter(|line| line.starts_with(&prefix))
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn default_outbound_only_capture_v4() {
        let mut cfg = quiet(1337);
        cfg.redirect.inbound.enabled = false;
        let out = render(&cfg, Family::V4);
        assert_eq!(
            out,
            "*nat\n\
             :PREROUTING ACCEPT [0:0]\n\
             :INPUT ACCEPT [0:0]\n\
             :OUTPUT ACCEPT [0:0]\n\
             :POSTROUTING ACCEPT [0:0]\n\
             -N MESH_INBOUND\n\
             -N MESH_OUTBOUND\n\
             -N MESH_INBOUND_REDIRECT\n\
             -N MESH_OUTBOUND_REDIRECT\n\
             -A PREROUTING -p tcp -j MESH_INBOUND\n\
             -A OUTPUT -p tcp -j MESH_OUTBOUND\n\
             -A MESH_INBOUND -p tcp -j RETURN\n\
             -A MESH_OUTBOUND -s 127.0.0.6/32 -o lo -j RETURN\n\
             -A MESH_OUTBOUND -p tcp -o lo ! -d 127.0.0.1/32 -m owner --uid-owner 1337 -j MESH_INBOUND_REDIRECT\n\
             -A MESH_OUTBOUND -p tcp -o lo -m owner ! --uid-owner 1337 -j RETURN\n\
             -A MESH_OUTBOUND -m owner --uid-owner 1337 -j RETURN\n\
             -A MESH_OUTBOUND -d 127.0.0.1/32 -j RETURN\n\
             -A MESH_OUTBOUND -j MESH_OUTBOUND_REDIRECT\n\
             -A MESH_INBOUND_REDIRECT -p tcp -j REDIRECT --to-ports 15006\n\
             -A MESH_OUTBOUND_REDIRECT -p tcp -j REDIRECT --to-ports 15001\n\
             COMMIT"
        );
    }

    #[test]
    fn capture_all_dns_output_order() {
        let mut cfg = quiet(1337);
        cfg.redirect.dns.enabled = true;
        cfg.redirect.dns.capture_all = true;
        let out = render(&cfg, Family::V4);
        assert_eq!(
            chain_rules(&out, "OUTPUT"),
            vec![
                "-A OUTPUT -p udp -m udp --dport 53 -m owner --uid-owner 1337 -j RETURN",
                "-A OUTPUT -p udp -m udp --dport 53 -j REDIRECT --to-ports 15053",
                "-A OUTPUT -p tcp -j MESH_OUTBOUND",
            ]
        );
    }

    #[test]
    fn capture_all_dns_excludes_port_53_from_tcp_owner_rules() {
        let mut cfg = quiet(1337);
        cfg.redirect.dns.enabled = true;
        cfg.redirect.dns.capture_all = true;
        let out = render(&cfg, Family::V4);
        let outbound = chain_rules(&out, "MESH_OUTBOUND");
        assert_eq!(
            outbound[1],
            "-A MESH_OUTBOUND -p tcp -m tcp ! --dport 53 -o lo ! -d 127.0.0.1/32 \
             -m owner --uid-owner 1337 -j MESH_INBOUND_REDIRECT"
        );
        assert_eq!(
            outbound[2],
            "-A MESH_OUTBOUND -p tcp -m tcp ! --dport 53 -o lo -m owner ! --uid-owner 1337 -j RETURN"
        );
        assert!(outbound.contains(
            &"-A MESH_OUTBOUND -p tcp -m tcp --dport 53 -j REDIRECT --to-ports 15053".to_string()
        ));
    }

    #[test]
    fn selective_dns_uses_resolver_order() {
        let mut cfg = quiet(1337);
        cfg.redirect.dns.enabled = true;
        let out = render(&cfg, Family::V4);
        assert_eq!(
            chain_rules(&out, "OUTPUT"),
            vec![
                "-A OUTPUT -p udp -m udp --dport 53 -m owner --uid-owner 1337 -j RETURN",
                "-A OUTPUT -d 8.8.8.8 -p udp -m udp --dport 53 -j REDIRECT --to-ports 15053",
                "-A OUTPUT -d 1.1.1.1 -p udp -m udp --dport 53 -j REDIRECT --to-ports 15053",
                "-A OUTPUT -p tcp -j MESH_OUTBOUND",
            ]
        );
        let outbound = chain_rules(&out, "MESH_OUTBOUND");
        assert!(outbound.contains(
            &"-A MESH_OUTBOUND -d 8.8.8.8 -p tcp -m tcp --dport 53 -j REDIRECT --to-ports 15053"
                .to_string()
        ));
        assert!(!out.contains("-A OUTPUT -p udp -m udp --dport 53 -j REDIRECT"));
    }

    #[test]
    fn selective_dns_without_family_resolvers_fails() {
        let mut cfg = quiet(1337);
        cfg.redirect.dns.enabled = true;
        let mut no_v6 = env();
        no_v6.name_servers.v6.clear();
        let err = build_nat(&cfg, &no_v6, Family::V6).unwrap_err();
        assert!(err.to_string().contains("no ipv6 nameservers"));
        cfg.redirect.dns.capture_all = true;
        assert!(build_nat(&cfg, &no_v6, Family::V6).is_ok());
    }

    #[test]
    fn ipv6_uses_alternate_inbound_port_and_family_cidrs() {
        let mut cfg = quiet(1337);
        cfg.ipv6 = true;
        cfg.redirect.outbound.enabled = false;
        let v4 = render(&cfg, Family::V4);
        let v6 = render(&cfg, Family::V6);
        assert!(v4.contains("-A MESH_INBOUND_REDIRECT -p tcp -j REDIRECT --to-ports 15006"));
        assert!(v6.contains("-A MESH_INBOUND_REDIRECT -p tcp -j REDIRECT --to-ports 15010"));
        assert_eq!(
            chain_rules(&v6, "MESH_OUTBOUND"),
            vec!["-A MESH_OUTBOUND -p tcp -j RETURN"]
        );

        cfg.redirect.outbound.enabled = true;
        let v4 = render(&cfg, Family::V4);
        let v6 = render(&cfg, Family::V6);
        assert!(v6.contains("-A MESH_OUTBOUND -s ::6/128 -o lo -j RETURN"));
        assert!(v6.contains("! -d ::1/128"));
        assert!(!v6.contains("127.0.0.6/32"));
        assert!(!v4.contains("::6/128"));
        assert!(v4.contains("-A MESH_OUTBOUND -s 127.0.0.6/32 -o lo -j RETURN"));
    }

    #[test]
    fn exclude_ports_precede_all_other_outbound_rules() {
        let mut cfg = quiet(1337);
        cfg.redirect.outbound.exclude_ports = vec![22, 8125];
        let out = render(&cfg, Family::V4);
        let outbound = chain_rules(&out, "MESH_OUTBOUND");
        assert_eq!(outbound[0], "-A MESH_OUTBOUND -p tcp -m tcp --dport 22 -j RETURN");
        assert_eq!(outbound[1], "-A MESH_OUTBOUND -p tcp -m tcp --dport 8125 -j RETURN");
        assert_eq!(outbound[2], "-A MESH_OUTBOUND -s 127.0.0.6/32 -o lo -j RETURN");
    }

    #[test]
    fn uid_bypass_entries_precede_dns_owner_return() {
        let mut cfg = quiet(1337);
        cfg.redirect.dns.enabled = true;
        cfg.redirect.dns.capture_all = true;
        cfg.redirect.outbound.exclude_ports_for_uids = vec![UidPortBypass {
            protocol: Proto::Udp,
            ports: PortSpec::Value(53),
            uids: IdSpec::Value(4201),
        }];
        let out = render(&cfg, Family::V4);
        let output = chain_rules(&out, "OUTPUT");
        assert_eq!(
            output[0],
            "-A OUTPUT -p udp -m udp --dport 53 -m owner --uid-owner 4201 -j RETURN"
        );
        assert_eq!(
            output[1],
            "-A OUTPUT -p udp -m udp --dport 53 -m owner --uid-owner 1337 -j RETURN"
        );
    }

    #[test]
    fn uid_bypass_ranges_render_both_range_separators() {
        let mut cfg = quiet(1337);
        cfg.redirect.outbound.exclude_ports_for_uids = vec![UidPortBypass {
            protocol: Proto::Tcp,
            ports: PortSpec::Range(1000, 2000),
            uids: IdSpec::Range(100, 200),
        }];
        let out = render(&cfg, Family::V4);
        assert!(out.contains(
            "-A OUTPUT -p tcp -m tcp --dport 1000:2000 -m owner --uid-owner 100-200 -j RETURN"
        ));
    }

    #[test]
    fn inbound_include_ports_win_over_excludes() {
        let mut cfg = quiet(1337);
        cfg.redirect.inbound.include_ports = vec![8080, 9090];
        cfg.redirect.inbound.exclude_ports = vec![22];
        let out = render(&cfg, Family::V4);
        assert_eq!(
            chain_rules(&out, "MESH_INBOUND"),
            vec![
                "-A MESH_INBOUND -p tcp -m tcp --dport 8080 -j MESH_INBOUND_REDIRECT",
                "-A MESH_INBOUND -p tcp -m tcp --dport 9090 -j MESH_INBOUND_REDIRECT",
            ]
        );
    }

    #[test]
    fn inbound_excludes_apply_when_no_includes() {
        let mut cfg = quiet(1337);
        cfg.redirect.inbound.exclude_ports = vec![22];
        let out = render(&cfg, Family::V4);
        assert_eq!(
            chain_rules(&out, "MESH_INBOUND"),
            vec![
                "-A MESH_INBOUND -p tcp -m tcp --dport 22 -j RETURN",
                "-A MESH_INBOUND -p tcp -j MESH_INBOUND_REDIRECT",
            ]
        );
    }

    #[test]
    fn inbound_empty_lists_redirect_everything() {
        let cfg = quiet(1337);
        let out = render(&cfg, Family::V4);
        assert_eq!(
            chain_rules(&out, "MESH_INBOUND"),
            vec!["-A MESH_INBOUND -p tcp -j MESH_INBOUND_REDIRECT"]
        );
    }

    #[test]
    fn outbound_include_ports_replace_final_jump_and_ignore_excludes() {
        let mut cfg = quiet(1337);
        cfg.redirect.outbound.include_ports = vec![80, 443];
        cfg.redirect.outbound.exclude_ports = vec![22];
        let out = render(&cfg, Family::V4);
        let outbound = chain_rules(&out, "MESH_OUTBOUND");
        assert!(!outbound.iter().any(|rule| rule.contains("--dport 22")));
        assert!(!outbound.contains(&"-A MESH_OUTBOUND -j MESH_OUTBOUND_REDIRECT".to_string()));
        let tail = &outbound[outbound.len() - 2..];
        assert_eq!(
            tail,
            [
                "-A MESH_OUTBOUND -p tcp -m tcp --dport 80 -j MESH_OUTBOUND_REDIRECT",
                "-A MESH_OUTBOUND -p tcp -m tcp --dport 443 -j MESH_OUTBOUND_REDIRECT",
            ]
        );
    }

    #[test]
    fn gid_rules_twin_the_uid_rules() {
        let mut cfg = quiet(1337);
        cfg.gid = Some(1338);
        cfg.redirect.dns.enabled = true;
        cfg.redirect.dns.capture_all = true;
        let out = render(&cfg, Family::V4);
        let output = chain_rules(&out, "OUTPUT");
        assert_eq!(
            output[1],
            "-A OUTPUT -p udp -m udp --dport 53 -m owner --gid-owner 1338 -j RETURN"
        );
        let outbound = chain_rules(&out, "MESH_OUTBOUND");
        assert_eq!(
            outbound[4],
            "-A MESH_OUTBOUND -p tcp -m tcp ! --dport 53 -o lo ! -d 127.0.0.1/32 \
             -m owner --gid-owner 1338 -j MESH_INBOUND_REDIRECT"
        );
        assert_eq!(
            outbound[5],
            "-A MESH_OUTBOUND -p tcp -m tcp ! --dport 53 -o lo -m owner ! --gid-owner 1338 -j RETURN"
        );
        assert_eq!(outbound[6], "-A MESH_OUTBOUND -m owner --gid-owner 1338 -j RETURN");
    }

    #[test]
    fn log_rules_lead_the_hook_chains() {
        let mut cfg = quiet(1337);
        cfg.log.enabled = true;
        cfg.log.level = 7;
        let out = render(&cfg, Family::V4);
        assert_eq!(
            chain_rules(&out, "PREROUTING")[0],
            "-A PREROUTING -j LOG --log-prefix \"meshproxy:prerouting\" --log-level 7"
        );
        assert_eq!(
            chain_rules(&out, "OUTPUT")[0],
            "-A OUTPUT -j LOG --log-prefix \"meshproxy:output\" --log-level 7"
        );
    }

    #[test]
    fn chain_name_prefix_applies_everywhere() {
        let mut cfg = quiet(1337);
        cfg.redirect.name_prefix = "KUMA_".to_string();
        let out = render(&cfg, Family::V4);
        assert!(out.contains("-N KUMA_MESH_INBOUND\n"));
        assert!(out.contains("-A PREROUTING -p tcp -j KUMA_MESH_INBOUND"));
        assert!(out.contains("-A KUMA_MESH_OUTBOUND -j KUMA_MESH_OUTBOUND_REDIRECT"));
        assert!(!out.contains("-j MESH_INBOUND\n"));
    }

    #[test]
    fn verbose_rendering_uses_long_flags() {
        let mut cfg = Config::with_defaults(1337);
        cfg.verbose = true;
        let out = build_nat(&cfg, &env(), Family::V4).unwrap().render(true);
        assert!(out.contains("# Rules:"));
        assert!(out.contains("--append PREROUTING --protocol tcp --jump MESH_INBOUND"));
        assert!(out.contains("--match owner --uid-owner 1337"));
        assert!(!out.contains("\n-A "));
    }

    #[test]
    fn disabled_outbound_is_a_single_return() {
        let mut cfg = quiet(1337);
        cfg.redirect.outbound.enabled = false;
        let out = render(&cfg, Family::V4);
        assert_eq!(
            chain_rules(&out, "MESH_OUTBOUND"),
            vec!["-A MESH_OUTBOUND -p tcp -j RETURN"]
        );
    }
}
