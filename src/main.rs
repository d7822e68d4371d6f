//! Scan a video for NSFW frames.
//!
//! Usage: `cleo-nsfw <video> [output-dir]`
//!
//! Logs one line per frame. With an output directory, every frame is also
//! written there as `<frame>_<percent>.jpg` (1-based frame number). Settings
//! are read from the environment, see [`cleo_nsfw::config`].

use anyhow::{Context, Result, bail};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

use cleo_nsfw::{FrameOutcome, Pipeline, ScanConfig, logging, scan_video};

fn prepare_output_dir(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path)
        .with_context(|| format!("creating output directory {}", path.display()))?;
    if std::fs::read_dir(path)?.next().is_some() {
        bail!("output directory {} is not empty", path.display());
    }
    Ok(())
}

fn write_frame(dir: &Path, outcome: &FrameOutcome) {
    let percent = outcome
        .probability()
        .map(|p| ((p * 100.0) as u32).to_string())
        .unwrap_or_else(|| "err".to_string());
    let path = dir.join(format!("{}_{}.jpg", outcome.index + 1, percent));
    if let Err(e) = std::fs::write(&path, &outcome.frame) {
        log::warn!("[frames] Failed to write {:?}: {}", path, e);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();

    let mut args = std::env::args().skip(1);
    let Some(input) = args.next().map(PathBuf::from) else {
        bail!("usage: cleo-nsfw <video> [output-dir]");
    };
    let output_dir = args.next().map(PathBuf::from);
    if let Some(dir) = &output_dir {
        prepare_output_dir(dir)?;
    }

    let config = ScanConfig::from_env();
    log::info!(
        "[nsfw] Scanning {} ({} workers, models in {})",
        input.display(),
        config.workers,
        config.models_dir.display()
    );

    let pipeline = Pipeline::new(config.build_ensemble()?);

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("[nsfw] Interrupted, stopping scan");
            ctrl_c.cancel();
        }
    });

    let mut flagged = 0u64;
    let summary = scan_video(&input, &config, &pipeline, &cancel, |outcome| {
        match &outcome.result {
            Ok(result) => {
                if result.probability >= 0.5 {
                    flagged += 1;
                }
                log::info!(
                    "[nsfw] #{} {:.0}% ({})",
                    outcome.index + 1,
                    result.probability * 100.0,
                    result
                        .records
                        .iter()
                        .map(|r| format!("{}={:.2}", r.classifier, r.probability))
                        .collect::<Vec<_>>()
                        .join(", ")
                );
            }
            Err(e) => log::warn!("[nsfw] #{} failed: {}", outcome.index + 1, e),
        }
        if let Some(dir) = &output_dir {
            write_frame(dir, &outcome);
        }
    })
    .await?;

    log::info!(
        "[nsfw] Done: {} frames, {} scored, {} failed, {} at or above 50%",
        summary.frames,
        summary.scored,
        summary.failed,
        flagged
    );
    Ok(())
}
