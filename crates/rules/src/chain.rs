use crate::params::Param;
use crate::rule::Rule;
use crate::target::Target;

/// An ordered sequence of rules bound to one chain name. Ordering is
/// significant: returns and jumps are position-dependent.
#[derive(Debug, Clone)]
pub struct Chain {
    name: String,
    builtin: bool,
    rules: Vec<Rule>,
}

impl Chain {
    /// A kernel hook chain (PREROUTING, INPUT, OUTPUT, POSTROUTING).
    pub fn builtin(name: &str) -> Self {
        Self {
            name: name.to_string(),
            builtin: true,
            rules: Vec::new(),
        }
    }

    /// An operator-defined chain, reachable only via explicit jumps.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            builtin: false,
            rules: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_builtin(&self) -> bool {
        self.builtin
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn append(&mut self, params: Vec<Param>, target: Target) -> &mut Self {
        let rule = Rule::new(self.name.clone(), params, target);
        self.rules.push(rule);
        self
    }

    pub fn append_if(&mut self, condition: bool, params: Vec<Param>, target: Target) -> &mut Self {
        if condition {
            self.append(params, target);
        }
        self
    }

    /// `:<name> ACCEPT [0:0]` for hook chains, `:<name> - [0:0]` for user
    /// chains (user chains have no default policy).
    pub fn policy_line(&self) -> String {
        if self.builtin {
            format!(":{} ACCEPT [0:0]", self.name)
        } else {
            format!(":{} - [0:0]", self.name)
        }
    }

    pub fn render_rules(&self, verbose: bool) -> Vec<String> {
        self.rules.iter().map(|rule| rule.render(verbose)).collect()
    }
}
