use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result, anyhow};
use nix::unistd::Uid;

pub mod net;
pub mod resolv;

#[derive(Clone)]
pub struct CommandRunner {
    pub verbose: bool,
    pub dry_run: bool,
}

impl CommandRunner {
    pub fn new(verbose: bool, dry_run: bool) -> Self {
        Self { verbose, dry_run }
    }

    /// Runs the program and returns its combined stdout+stderr. A non-zero
    /// exit is an error carrying the combined output.
    pub fn run_combined(&self, program: &str, args: &[&str]) -> Result<String> {
        if self.verbose {
            eprintln!("$ {} {}", program, args.join(" "));
        }
        if self.dry_run {
            return Ok(String::new());
        }
        let output = Command::new(program)
            .args(args)
            .output()
            .with_context(|| format!("failed to run {program}"))?;
        let combined = combine_output(&output.stdout, &output.stderr);
        if !output.status.success() {
            return Err(anyhow!(
                "command failed: {} {}\n{}",
                program,
                args.join(" "),
                combined.trim_end()
            ));
        }
        Ok(combined)
    }

    pub fn run_capture_allow_fail(&self, program: &str, args: &[&str]) -> Result<String> {
        if self.verbose {
            eprintln!("$ {} {}", program, args.join(" "));
        }
        if self.dry_run {
            return Ok(String::new());
        }
        let output = Command::new(program)
            .args(args)
            .output()
            .with_context(|| format!("failed to run {program}"))?;
        Ok(combine_output(&output.stdout, &output.stderr))
    }

    /// Zero-exit check for probe invocations. Spawn failures count as
    /// a failed probe, not an error.
    pub fn probe(&self, program: &str, args: &[&str]) -> bool {
        if self.verbose {
            eprintln!("$ {} {}", program, args.join(" "));
        }
        if self.dry_run {
            return true;
        }
        Command::new(program)
            .args(args)
            .output()
            .map(|output| output.status.success())
            .unwrap_or(false)
    }
}

fn combine_output(stdout: &[u8], stderr: &[u8]) -> String {
    let mut combined = String::from_utf8_lossy(stdout).into_owned();
    let err = String::from_utf8_lossy(stderr);
    if !err.is_empty() {
        if !combined.is_empty() && !combined.ends_with('\n') {
            combined.push('\n');
        }
        combined.push_str(&err);
    }
    combined
}

pub fn find_in_path<S: AsRef<OsStr>>(binary: S) -> Option<PathBuf> {
    let binary = binary.as_ref();
    if Path::new(binary).is_file() {
        return Some(PathBuf::from(binary));
    }
    let path_var = std::env::var_os("PATH")?;
    for path in std::env::split_paths(&path_var) {
        let full = path.join(binary);
        if full.is_file() {
            return Some(full);
        }
    }
    None
}

pub fn is_root() -> bool {
    Uid::effective().is_root()
}

pub fn ensure_root() -> Result<()> {
    if is_root() {
        return Ok(());
    }
    Err(anyhow!("root privileges are required to install redirect rules"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combine_output_joins_streams() {
        assert_eq!(combine_output(b"out\n", b"err\n"), "out\nerr\n");
        assert_eq!(combine_output(b"out", b"err\n"), "out\nerr\n");
        assert_eq!(combine_output(b"", b"err\n"), "err\n");
        assert_eq!(combine_output(b"out\n", b""), "out\n");
    }

    #[test]
    fn dry_run_skips_execution() {
        let runner = CommandRunner::new(false, true);
        let out = runner
            .run_combined("definitely-not-a-binary", &["--flag"])
            .unwrap();
        assert_eq!(out, "");
        assert!(runner.probe("definitely-not-a-binary", &[]));
    }

    #[test]
    fn run_combined_surfaces_exit_status() {
        let runner = CommandRunner::new(false, false);
        let err = runner.run_combined("false", &[]).unwrap_err();
        assert!(err.to_string().contains("command failed"));
    }

    #[test]
    fn run_capture_allow_fail_tolerates_exit_status() {
        let runner = CommandRunner::new(false, false);
        let out = runner.run_capture_allow_fail("false", &[]).unwrap();
        assert_eq!(out, "");
    }

    #[test]
    fn probe_reports_missing_binary_as_failure() {
        let runner = CommandRunner::new(false, false);
        assert!(!runner.probe("definitely-not-a-binary", &[]));
    }

    #[test]
    fn find_in_path_locates_sh() {
        assert!(find_in_path("sh").is_some());
        assert!(find_in_path("definitely-not-a-binary").is_none());
    }
}
