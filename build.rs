use anyhow::Result;
use chrono::TimeZone;
use std::env;
use std::fs;
use std::process::Command;
use vergen_gitcl::{Emitter, GitclBuilder};

fn main() -> Result<()> {
    // Generate git information
    let gitcl = GitclBuilder::default()
        .describe(true, true, Some("[0-9]*"))
        .build()?;

    let gitcl_res = Emitter::default()
        .idempotent()
        .fail_on_error()
        .add_instructions(&gitcl)
        .and_then(|emitter| emitter.emit());

    if let Err(e) = gitcl_res {
        eprintln!("error occurred while generating instructions: {e:?}");
        Emitter::default().idempotent().fail_on_error().emit()?;
        println!("cargo:rustc-env=VERGEN_GIT_DESCRIBE=unknown");
    }

    // Add build timestamp
    let now = match env::var("SOURCE_DATE_EPOCH") {
        Ok(val) => chrono::Utc
            .timestamp_opt(val.parse::<i64>()?, 0)
            .single()
            .ok_or_else(|| anyhow::anyhow!("SOURCE_DATE_EPOCH out of range: {val}"))?,
        Err(_) => chrono::Utc::now(),
    };

    println!(
        "cargo:rustc-env=BUILD_TIMESTAMP={}",
        now.format("%Y-%m-%d %H:%M:%S UTC")
    );

    let oggplay_version = oggplay_version_from_metadata().unwrap_or_else(|_| {
        read_oggplay_version_fallback().unwrap_or_else(|_| "unknown".to_string())
    });
    println!("cargo:rustc-env=OGGPLAY_VERSION={oggplay_version}");

    println!("cargo:rerun-if-changed=oggplay/Cargo.toml");

    Ok(())
}

/// Library version from cargo metadata, for both path and registry
/// dependencies.
fn oggplay_version_from_metadata() -> Result<String> {
    let output = Command::new("cargo")
        .args(["metadata", "--format-version", "1"])
        .output()?;

    if !output.status.success() {
        anyhow::bail!("cargo metadata failed");
    }

    let metadata: serde_json::Value = serde_json::from_slice(&output.stdout)?;

    // Workspace member first (local development)
    if let Some(packages) = metadata["packages"].as_array() {
        let version = packages
            .iter()
            .filter(|p| p["name"].as_str() == Some("oggplay"))
            .find_map(|p| p["version"].as_str());
        if let Some(version) = version {
            return Ok(version.to_string());
        }
    }

    // Published package, "oggplay 0.3.0 (registry+...)"
    if let Some(nodes) = metadata["resolve"]["nodes"].as_array() {
        let version = nodes
            .iter()
            .filter_map(|n| n["id"].as_str())
            .filter_map(|id| id.strip_prefix("oggplay "))
            .find_map(|rest| rest.split(' ').next());
        if let Some(version) = version {
            return Ok(version.to_string());
        }
    }

    anyhow::bail!("oggplay package not found in metadata");
}

fn read_oggplay_version_fallback() -> Result<String> {
    let toml_content = fs::read_to_string("oggplay/Cargo.toml")?;

    for line in toml_content.lines() {
        let line = line.trim();
        if line.starts_with("version") {
            if let Some((_, value)) = line.split_once('=') {
                let version = value.trim().trim_matches('"').trim_matches('\'');
                return Ok(version.to_string());
            }
        }
    }

    anyhow::bail!("Could not find version in oggplay/Cargo.toml");
}
