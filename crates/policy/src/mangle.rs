use meshproxy_config::Config;
use meshproxy_rules::{Param, Table, Target};

pub fn build_mangle(cfg: &Config) -> Table {
    let mut mangle = Table::mangle();
    mangle.prerouting().append_if(
        cfg.drop_invalid_packets,
        vec![Param::conntrack_invalid()],
        Target::Drop,
    );
    mangle
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drop_invalid_emits_conntrack_drop() {
        let mut cfg = Config::with_defaults(1337);
        cfg.drop_invalid_packets = true;
        let out = build_mangle(&cfg).render(false);
        assert!(out.contains("-A PREROUTING -m conntrack --ctstate INVALID -j DROP"));
    }

    #[test]
    fn without_drop_invalid_the_table_is_empty() {
        let cfg = Config::with_defaults(1337);
        assert!(!build_mangle(&cfg).has_rules());
    }
}
