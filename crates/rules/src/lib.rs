//! Typed iptables-restore rule generation.
//!
//! The algebra is closed: parameters and targets are tagged variants with an
//! explicit `render`, so a rule that would be rejected by the restore utility
//! (a negated jump, a port match without a protocol) cannot be constructed.

mod chain;
mod params;
mod rule;
mod table;
mod target;

pub use chain::Chain;
pub use params::{IdSpec, OwnerMatch, Param, PortMatch, PortSpec, Proto};
pub use rule::Rule;
pub use table::{Table, TableKind};
pub use target::Target;

/// An ordered sequence of tables, rendered one script per address family.
#[derive(Debug, Default)]
pub struct Script {
    tables: Vec<Table>,
}

impl Script {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, table: Table) -> &mut Self {
        self.tables.push(table);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn render(&self, verbose: bool) -> String {
        let rendered: Vec<String> = self.tables.iter().map(|t| t.render(verbose)).collect();
        rendered.join("\n")
    }
}
