//! Applies rendered scripts through the external restore utilities. Exactly
//! three side effects per family: probe (once per run), file write, spawn.

use std::io::Write;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use meshproxy_config::{Config, Family};
use meshproxy_policy::{PolicyEnv, build_script};
use meshproxy_util::CommandRunner;

/// Checks that the restore utility accepts conntrack rules. Spawn failures
/// and non-zero exits both count as "unavailable".
pub fn conntrack_extension_available(runner: &CommandRunner) -> bool {
    runner.probe(Family::V4.restore_binary(), &["-m", "conntrack", "--help"])
}

/// Renders and applies the scripts, v4 first so that a v6 failure does not
/// prevent v4 capture. Returns the concatenated restore-utility output.
pub fn install(
    cfg: &Config,
    env: &PolicyEnv,
    runner: &CommandRunner,
    sink: &mut dyn Write,
) -> Result<String> {
    let wants_zone_split = cfg.redirect.dns.enabled && cfg.redirect.dns.conntrack_zone_split;
    let conntrack_ok = wants_zone_split && conntrack_extension_available(runner);
    let zone_split = resolve_zone_split(cfg, conntrack_ok, sink)?;

    let mut families = vec![Family::V4];
    if cfg.ipv6 {
        families.push(Family::V6);
    }

    let mut combined = String::new();
    for family in families {
        let script = build_script(cfg, env, family, zone_split)?;
        let output = apply_script(family.restore_binary(), &script, runner, sink)?;
        combined.push_str(&output);
    }
    Ok(combined)
}

/// Decides whether the raw-table zone split applies, warning once when the
/// configuration asks for it but the CT extension is unavailable.
fn resolve_zone_split(cfg: &Config, conntrack_ok: bool, sink: &mut dyn Write) -> Result<bool> {
    let wants_zone_split = cfg.redirect.dns.enabled && cfg.redirect.dns.conntrack_zone_split;
    if wants_zone_split && !conntrack_ok {
        writeln!(
            sink,
            "warning: conntrack zone splitting is not available, skipping DNS conntrack rules"
        )?;
    }
    Ok(cfg.should_conntrack_zone_split(conntrack_ok))
}

fn rules_file_path(utility: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    std::env::temp_dir().join(format!("{utility}-rules-{nanos}.txt"))
}

fn apply_script(
    utility: &str,
    script: &str,
    runner: &CommandRunner,
    sink: &mut dyn Write,
) -> Result<String> {
    let path = rules_file_path(utility);
    writeln!(
        sink,
        "Writing following contents to rules file: {}",
        path.display()
    )?;
    writeln!(sink, "{script}")?;

    if runner.dry_run {
        return Ok(String::new());
    }

    if let Err(err) = std::fs::write(&path, script) {
        let _ = std::fs::remove_file(&path);
        return Err(err).with_context(|| format!("failed to write rules file {}", path.display()));
    }

    let result = runner.run_combined(utility, &["--noflush", &path.to_string_lossy()]);
    let _ = std::fs::remove_file(&path);
    result
}
