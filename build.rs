//! Stamps the binary with a build id used by the CLI and label cache
//! snapshots. Labels depend on the physics code, so snapshots from another
//! build are refused.

use std::process::Command;

fn git(args: &[&str]) -> Option<String> {
    let output = Command::new("git").args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8(output.stdout).ok()?;
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}

fn main() {
    println!("cargo:rerun-if-changed=Cargo.toml");
    if let Some(head) = git(&["rev-parse", "--git-path", "HEAD"]) {
        println!("cargo:rerun-if-changed={head}");
    }

    let version = std::env::var("CARGO_PKG_VERSION").unwrap_or_default();
    let build_id = match git(&["rev-parse", "--short=12", "HEAD"]) {
        Some(hash) => format!("{version}+{hash}"),
        None => version,
    };
    println!("cargo:rustc-env=CHAINSIM_BUILD_ID={build_id}");
}
