use crate::chain::Chain;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableKind {
    Raw,
    Nat,
    Mangle,
}

impl TableKind {
    pub fn name(self) -> &'static str {
        match self {
            TableKind::Raw => "raw",
            TableKind::Nat => "nat",
            TableKind::Mangle => "mangle",
        }
    }
}

/// Groups the four hook chains and any user chains under one table and
/// renders the restore-utility stanza: header, hook policies, `-N`
/// declarations, rules (hook chains first), COMMIT.
#[derive(Debug)]
pub struct Table {
    kind: TableKind,
    prerouting: Chain,
    input: Chain,
    output: Chain,
    postrouting: Chain,
    chains: Vec<Chain>,
}

impl Table {
    pub fn new(kind: TableKind) -> Self {
        Self {
            kind,
            prerouting: Chain::builtin("PREROUTING"),
            input: Chain::builtin("INPUT"),
            output: Chain::builtin("OUTPUT"),
            postrouting: Chain::builtin("POSTROUTING"),
            chains: Vec::new(),
        }
    }

    pub fn raw() -> Self {
        Self::new(TableKind::Raw)
    }

    pub fn nat() -> Self {
        Self::new(TableKind::Nat)
    }

    pub fn mangle() -> Self {
        Self::new(TableKind::Mangle)
    }

    pub fn kind(&self) -> TableKind {
        self.kind
    }

    pub fn prerouting(&mut self) -> &mut Chain {
        &mut self.prerouting
    }

    pub fn input(&mut self) -> &mut Chain {
        &mut self.input
    }

    pub fn output(&mut self) -> &mut Chain {
        &mut self.output
    }

    pub fn postrouting(&mut self) -> &mut Chain {
        &mut self.postrouting
    }

    pub fn with_chain(mut self, chain: Chain) -> Self {
        debug_assert!(
            !chain.is_builtin() && self.chains.iter().all(|c| c.name() != chain.name()),
            "user chain names must be unique within a table"
        );
        self.chains.push(chain);
        self
    }

    fn hook_chains(&self) -> [&Chain; 4] {
        [&self.prerouting, &self.input, &self.output, &self.postrouting]
    }

    pub fn has_rules(&self) -> bool {
        self.hook_chains().iter().any(|c| !c.rules().is_empty())
            || self.chains.iter().any(|c| !c.rules().is_empty())
    }

    pub fn render(&self, verbose: bool) -> String {
        let header = format!("*{}", self.kind.name());

        let mut policy_lines: Vec<String> = Vec::new();
        for chain in self.hook_chains() {
            policy_lines.push(chain.policy_line());
        }

        let mut declaration_lines: Vec<String> = Vec::new();
        for chain in &self.chains {
            declaration_lines.push(format!("-N {}", chain.name()));
        }

        let mut rule_lines: Vec<String> = Vec::new();
        for chain in self.hook_chains() {
            rule_lines.extend(chain.render_rules(verbose));
        }
        for chain in &self.chains {
            rule_lines.extend(chain.render_rules(verbose));
        }

        if verbose {
            let mut sections = vec![header];
            if !policy_lines.is_empty() {
                policy_lines.insert(0, "# Builtin Chains Default Policies:".to_string());
                sections.push(policy_lines.join("\n"));
            }
            if !declaration_lines.is_empty() {
                declaration_lines.insert(0, "# Custom Chains:".to_string());
                sections.push(declaration_lines.join("\n"));
            }
            if !rule_lines.is_empty() {
                rule_lines.insert(0, "# Rules:".to_string());
                sections.push(rule_lines.join("\n"));
            }
            sections.push("COMMIT".to_string());
            sections.join("\n\n")
        } else {
            let mut lines = vec![header];
            lines.extend(policy_lines);
            lines.extend(declaration_lines);
            lines.extend(rule_lines);
            lines.push("COMMIT".to_string());
            lines.join("\n")
        }
    }
}
