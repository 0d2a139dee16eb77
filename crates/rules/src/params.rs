use std::fmt;

use serde::{Deserialize, Serialize};

/// Picks the flag spelling for the requested rendering mode. Flags without a
/// short variant always render long.
fn flag(verbose: bool, long: &'static str, short: &'static str) -> &'static str {
    if verbose || short.is_empty() { long } else { short }
}

fn maybe_negate(negated: bool, rendered: String) -> String {
    if negated {
        format!("! {rendered}")
    } else {
        rendered
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Proto {
    Tcp,
    Udp,
}

impl Proto {
    pub fn name(self) -> &'static str {
        match self {
            Proto::Tcp => "tcp",
            Proto::Udp => "udp",
        }
    }
}

/// A single port or an inclusive range, rendered `N` or `N:N`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PortSpec {
    Value(u16),
    Range(u16, u16),
}

impl From<u16> for PortSpec {
    fn from(port: u16) -> Self {
        PortSpec::Value(port)
    }
}

impl fmt::Display for PortSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortSpec::Value(port) => write!(f, "{port}"),
            PortSpec::Range(begin, end) => write!(f, "{begin}:{end}"),
        }
    }
}

/// A numeric UID/GID or an inclusive range, rendered `N` or `N-N`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IdSpec {
    Value(u32),
    Range(u32, u32),
}

impl From<u32> for IdSpec {
    fn from(id: u32) -> Self {
        IdSpec::Value(id)
    }
}

impl fmt::Display for IdSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdSpec::Value(id) => write!(f, "{id}"),
            IdSpec::Range(begin, end) => write!(f, "{begin}-{end}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PortSide {
    Source,
    Destination,
}

/// Port sub-parameter of a tcp/udp match clause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMatch {
    side: PortSide,
    ports: PortSpec,
    negated: bool,
}

impl PortMatch {
    pub fn sport(ports: impl Into<PortSpec>) -> Self {
        Self {
            side: PortSide::Source,
            ports: ports.into(),
            negated: false,
        }
    }

    pub fn dport(ports: impl Into<PortSpec>) -> Self {
        Self {
            side: PortSide::Destination,
            ports: ports.into(),
            negated: false,
        }
    }

    pub fn negate(mut self) -> Self {
        self.negated = !self.negated;
        self
    }

    pub fn negate_if(self, condition: bool) -> Self {
        if condition { self.negate() } else { self }
    }

    fn render(&self, verbose: bool) -> String {
        let spelled = match self.side {
            PortSide::Source => flag(verbose, "--source-port", "--sport"),
            PortSide::Destination => flag(verbose, "--destination-port", "--dport"),
        };
        maybe_negate(self.negated, format!("{} {}", spelled, self.ports))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OwnerKind {
    Uid,
    Gid,
}

/// UID/GID sub-parameter of an owner match clause. The owner module only
/// matches in OUTPUT and POSTROUTING.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerMatch {
    kind: OwnerKind,
    id: IdSpec,
    negated: bool,
}

impl OwnerMatch {
    pub fn uid(id: impl Into<IdSpec>) -> Self {
        Self {
            kind: OwnerKind::Uid,
            id: id.into(),
            negated: false,
        }
    }

    pub fn gid(id: impl Into<IdSpec>) -> Self {
        Self {
            kind: OwnerKind::Gid,
            id: id.into(),
            negated: false,
        }
    }

    pub fn negate(mut self) -> Self {
        self.negated = !self.negated;
        self
    }

    pub fn negate_if(self, condition: bool) -> Self {
        if condition { self.negate() } else { self }
    }

    fn render(&self) -> String {
        let spelled = match self.kind {
            OwnerKind::Uid => "--uid-owner",
            OwnerKind::Gid => "--gid-owner",
        };
        maybe_negate(self.negated, format!("{} {}", spelled, self.id))
    }
}

/// One match fragment of a rule line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Param {
    Source { address: String, negated: bool },
    Destination { address: String, negated: bool },
    OutInterface { name: String, negated: bool },
    Protocol { proto: Proto, ports: Vec<PortMatch> },
    Owner { matches: Vec<OwnerMatch> },
    ConntrackState { state: &'static str, negated: bool },
}

impl Param {
    pub fn source(address: impl Into<String>) -> Self {
        Param::Source {
            address: address.into(),
            negated: false,
        }
    }

    pub fn destination(address: impl Into<String>) -> Self {
        Param::Destination {
            address: address.into(),
            negated: false,
        }
    }

    pub fn not_destination(address: impl Into<String>) -> Self {
        Param::destination(address).negate()
    }

    pub fn out_interface(name: impl Into<String>) -> Self {
        Param::OutInterface {
            name: name.into(),
            negated: false,
        }
    }

    pub fn tcp() -> Self {
        Param::Protocol {
            proto: Proto::Tcp,
            ports: Vec::new(),
        }
    }

    pub fn tcp_with(ports: Vec<PortMatch>) -> Self {
        Param::Protocol {
            proto: Proto::Tcp,
            ports,
        }
    }

    pub fn udp() -> Self {
        Param::Protocol {
            proto: Proto::Udp,
            ports: Vec::new(),
        }
    }

    pub fn udp_with(ports: Vec<PortMatch>) -> Self {
        Param::Protocol {
            proto: Proto::Udp,
            ports,
        }
    }

    pub fn proto_with(proto: Proto, ports: Vec<PortMatch>) -> Self {
        Param::Protocol { proto, ports }
    }

    pub fn owner(matches: Vec<OwnerMatch>) -> Self {
        Param::Owner { matches }
    }

    pub fn conntrack_invalid() -> Self {
        Param::ConntrackState {
            state: "INVALID",
            negated: false,
        }
    }

    /// Negates the fragment. For composite protocol and owner clauses only
    /// the qualified sub-parameters flip; the clause itself stays positive.
    pub fn negate(self) -> Self {
        match self {
            Param::Source { address, negated } => Param::Source {
                address,
                negated: !negated,
            },
            Param::Destination { address, negated } => Param::Destination {
                address,
                negated: !negated,
            },
            Param::OutInterface { name, negated } => Param::OutInterface {
                name,
                negated: !negated,
            },
            Param::Protocol { proto, ports } => Param::Protocol {
                proto,
                ports: ports.into_iter().map(PortMatch::negate).collect(),
            },
            Param::Owner { matches } => Param::Owner {
                matches: matches.into_iter().map(OwnerMatch::negate).collect(),
            },
            Param::ConntrackState { state, negated } => Param::ConntrackState {
                state,
                negated: !negated,
            },
        }
    }

    pub fn negate_if(self, condition: bool) -> Self {
        if condition { self.negate() } else { self }
    }

    pub fn render(&self, verbose: bool) -> String {
        match self {
            Param::Source { address, negated } => maybe_negate(
                *negated,
                format!("{} {}", flag(verbose, "--source", "-s"), address),
            ),
            Param::Destination { address, negated } => maybe_negate(
                *negated,
                format!("{} {}", flag(verbose, "--destination", "-d"), address),
            ),
            Param::OutInterface { name, negated } => maybe_negate(
                *negated,
                format!("{} {}", flag(verbose, "--out-interface", "-o"), name),
            ),
            Param::Protocol { proto, ports } => {
                let mut parts = vec![format!(
                    "{} {}",
                    flag(verbose, "--protocol", "-p"),
                    proto.name()
                )];
                // Port sub-parameters need the protocol's own match
                // extension loaded, ref. iptables-extensions(8) > tcp/udp.
                if !ports.is_empty() {
                    parts.push(format!(
                        "{} {}",
                        flag(verbose, "--match", "-m"),
                        proto.name()
                    ));
                    for port in ports {
                        parts.push(port.render(verbose));
                    }
                }
                parts.join(" ")
            }
            Param::Owner { matches } => {
                let mut parts = vec![format!("{} owner", flag(verbose, "--match", "-m"))];
                for owner in matches {
                    parts.push(owner.render());
                }
                parts.join(" ")
            }
            Param::ConntrackState { state, negated } => {
                let ctstate = maybe_negate(*negated, format!("--ctstate {state}"));
                format!("{} conntrack {}", flag(verbose, "--match", "-m"), ctstate)
            }
        }
    }
}
