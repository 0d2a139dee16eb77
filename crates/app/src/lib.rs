mod ops;
mod setup;

use std::fs;

use anyhow::{Context, Result};

use meshproxy_cli::{Command, parse_cli};
use meshproxy_config::ConfigOverlay;
use meshproxy_util::CommandRunner;

pub use ops::{HostProbes, RealProbes};
pub use setup::{cleanup, setup};

pub fn run() -> Result<()> {
    let cli = parse_cli();
    let (args, install) = match cli.command {
        Command::Install(args) => (args, true),
        Command::Cleanup(args) => (args, false),
    };

    let mut overlay = args.to_overlay();
    if let Some(path) = &args.config {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        overlay = overlay.over(ConfigOverlay::from_json(&contents)?);
    }
    let cfg = overlay.into_config()?;

    let runner = CommandRunner::new(cfg.verbose, args.dry_run);
    let mut sink = std::io::stdout();
    let output = if install {
        setup(&cfg, &RealProbes, &runner, &mut sink)?
    } else {
        cleanup(&cfg, &runner, &mut sink)?
    };
    if !output.is_empty() {
        print!("{output}");
    }
    Ok(())
}
