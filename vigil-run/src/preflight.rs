//! Startup checks. Everything that can be verified before threads spawn
//! is verified here; a failure exits the process with code 1 before any
//! file or database is touched by the pipeline.

use std::path::Path;
use std::process::{Command, Stdio};

use anyhow::{bail, Context, Result};
use tracing::info;

use vigil_config_data::{
    load_behavior_file, parse_config_file, BehaviorRules, SourceKind, VigilConfig,
};
use vigil_store::Store;

/// Validated launch inputs.
pub struct Launch {
    pub config: VigilConfig,
    pub rules: BehaviorRules,
}

fn ffmpeg_available() -> Result<()> {
    let status = Command::new("ffmpeg")
        .arg("-version")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .context("ffmpeg is not runnable (is it installed and on PATH?)")?;
    if !status.success() {
        bail!("ffmpeg -version exited with {status}");
    }
    Ok(())
}

pub fn check(config_file: &Path) -> Result<Launch> {
    let config = parse_config_file(config_file)
        .with_context(|| format!("reading config file {}", config_file.display()))?;

    let rules = load_behavior_file(&config.paths.behavior_config)
        .with_context(|| {
            format!(
                "reading behavior rules {}",
                config.paths.behavior_config.display()
            )
        })?;

    if config.source.kind == SourceKind::File && !Path::new(&config.source.uri).is_file() {
        bail!("video file {} does not exist", config.source.uri);
    }

    ffmpeg_available()?;

    if config.analysis.detector_command.is_none() {
        bail!("no detector_command configured; the pipeline cannot analyze frames");
    }

    std::fs::create_dir_all(&config.paths.output_dir).with_context(|| {
        format!(
            "creating output directory {}",
            config.paths.output_dir.display()
        )
    })?;

    // Open once now so schema problems surface before capture starts.
    Store::open(&config.paths.database)
        .with_context(|| format!("opening database {}", config.paths.database.display()))?;

    info!("pre-flight checks passed");
    Ok(Launch { config, rules })
}
