use crate::params::Param;
use crate::target::Target;

/// An append rule bound to a chain. A target is required at construction,
/// so a rule line without a terminal action cannot exist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    chain: String,
    params: Vec<Param>,
    target: Target,
}

impl Rule {
    pub fn new(chain: impl Into<String>, params: Vec<Param>, target: Target) -> Self {
        Self {
            chain: chain.into(),
            params,
            target,
        }
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    /// Pure: same inputs yield byte-identical lines.
    pub fn render(&self, verbose: bool) -> String {
        let mut parts = Vec::with_capacity(self.params.len() + 4);
        parts.push(if verbose { "--append" } else { "-A" }.to_string());
        parts.push(self.chain.clone());
        for param in &self.params {
            parts.push(param.render(verbose));
        }
        parts.push(if verbose { "--jump" } else { "-j" }.to_string());
        parts.push(self.target.render());
        parts.join(" ")
    }
}
