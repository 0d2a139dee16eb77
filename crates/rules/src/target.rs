/// Terminal action of a rule, emitted after the jump flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Return,
    Drop,
    Log { prefix: String, level: u8 },
    RedirectTo { ports: Vec<u16> },
    /// Jump into a user-defined chain.
    Chain(String),
    CtZone(u8),
}

impl Target {
    pub fn log(prefix: impl Into<String>, level: u8) -> Self {
        Target::Log {
            prefix: prefix.into(),
            level,
        }
    }

    pub fn redirect_to(port: u16) -> Self {
        Target::RedirectTo { ports: vec![port] }
    }

    pub fn chain(name: impl Into<String>) -> Self {
        Target::Chain(name.into())
    }

    pub fn render(&self) -> String {
        match self {
            Target::Return => "RETURN".to_string(),
            Target::Drop => "DROP".to_string(),
            Target::Log { prefix, level } => {
                format!("LOG --log-prefix \"{prefix}\" --log-level {level}")
            }
            Target::RedirectTo { ports } => {
                let joined: Vec<String> = ports.iter().map(u16::to_string).collect();
                format!("REDIRECT --to-ports {}", joined.join(","))
            }
            Target::Chain(name) => name.clone(),
            Target::CtZone(zone) => format!("CT --zone {zone}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_targets_render() {
        assert_eq!(Target::Return.render(), "RETURN");
        assert_eq!(Target::Drop.render(), "DROP");
        assert_eq!(Target::chain("MESH_INBOUND").render(), "MESH_INBOUND");
    }

    #[test]
    fn redirect_renders_ports() {
        assert_eq!(Target::redirect_to(15001).render(), "REDIRECT --to-ports 15001");
        assert_eq!(
            Target::RedirectTo {
                ports: vec![15006, 15010]
            }
            .render(),
            "REDIRECT --to-ports 15006,15010"
        );
    }

    #[test]
    fn log_renders_quoted_prefix_and_level() {
        assert_eq!(
            Target::log("meshproxy:prerouting", 7).render(),
            "LOG --log-prefix \"meshproxy:prerouting\" --log-level 7"
        );
    }

    #[test]
    fn ct_zone_renders() {
        assert_eq!(Target::CtZone(1).render(), "CT --zone 1");
        assert_eq!(Target::CtZone(2).render(), "CT --zone 2");
    }
}
