use anyhow::{Context, Result};
use meshproxy_util::CommandRunner;
use serde::Deserialize;

const CLSACT: &str = "clsact";
const FILTER_PRIO: &str = "66";

#[derive(Debug, Deserialize)]
struct TcQdisc {
    #[serde(default)]
    kind: String,
}

fn qdisc_json_contains(json: &str, kind: &str) -> Result<bool> {
    let qdiscs: Vec<TcQdisc> = serde_json::from_str(json).context("tc json decoding failed")?;
    Ok(qdiscs.iter().any(|qdisc| qdisc.kind == kind))
}

fn qdisc_present(runner: &CommandRunner, dev: &str) -> Result<bool> {
    let out = runner.run_combined("tc", &["-json", "qdisc", "show", "dev", dev])?;
    if out.trim().is_empty() {
        return Ok(false);
    }
    qdisc_json_contains(&out, CLSACT)
}

pub fn attach(runner: &CommandRunner, dev: &str, object: &str) -> Result<()> {
    if !qdisc_present(runner, dev)? {
        runner
            .run_combined("tc", &["qdisc", "add", "dev", dev, CLSACT])
            .with_context(|| format!("adding {CLSACT} qdisc to {dev} failed"))?;
    }
    for (direction, section) in [("ingress", "classifier_ingress"), ("egress", "classifier_egress")]
    {
        runner
            .run_combined(
                "tc",
                &[
                    "filter", "add", "prio", FILTER_PRIO, "dev", dev, direction, "bpf", "da",
                    "obj", object, "sec", section,
                ],
            )
            .with_context(|| format!("failed to attach tc({direction}) to {dev}"))?;
    }
    Ok(())
}

pub fn cleanup(runner: &CommandRunner, dev: &str) -> Result<()> {
    if qdisc_present(runner, dev)? {
        runner
            .run_combined("tc", &["qdisc", "delete", "dev", dev, CLSACT])
            .with_context(|| format!("failed to delete {CLSACT} qdisc from {dev}"))?;
        return Ok(());
    }
    for direction in ["egress", "ingress"] {
        runner
            .run_combined(
                "tc",
                &["filter", "delete", "dev", dev, direction, "prio", FILTER_PRIO],
            )
            .with_context(|| format!("failed to delete {direction} filter from {dev}"))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clsact_is_detected_in_qdisc_listing() {
        let json = r#"[{"kind":"noqueue"},{"kind":"clsact"}]"#;
        assert!(qdisc_json_contains(json, CLSACT).unwrap());
        assert!(!qdisc_json_contains(r#"[{"kind":"noqueue"}]"#, CLSACT).unwrap());
        assert!(!qdisc_json_contains("[]", CLSACT).unwrap());
    }

    #[test]
    fn entries_without_kind_are_tolerated() {
        let json = r#"[{"handle":"0:"},{"kind":"clsact"}]"#;
        assert!(qdisc_json_contains(json, CLSACT).unwrap());
    }

    #[test]
    fn garbage_json_is_an_error() {
        assert!(qdisc_json_contains("not json", CLSACT).is_err());
    }

    #[test]
    fn dry_run_attach_and_cleanup_succeed() {
        let runner = CommandRunner::new(false, true);
        attach(&runner, "eth0", "/tmp/mesh_tc.o").unwrap();
        cleanup(&runner, "eth0").unwrap();
    }
}
