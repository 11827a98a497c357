//! Frame-timing summary from the recorder's CSV output.

use anyhow::{Result, anyhow, bail};
use serde::{Deserialize, Serialize};

/// Column names carrying per-frame time in milliseconds, in lookup order.
const FRAME_TIME_COLUMNS: [&str; 2] = ["MsBetweenPresents", "FrameTime"];

/// Aggregate frame statistics for one measured window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameSummary {
    pub frames: usize,
    pub mean_frame_ms: f64,
    pub avg_fps: f64,
    /// FPS at the 99th percentile frame time.
    pub one_percent_low_fps: f64,
    pub max_frame_ms: f64,
}

/// Summarize a frame-timing CSV (header row followed by one row per frame).
///
/// Rows whose frame-time cell is empty or unparsable are skipped; the recorder
/// emits those for dropped presents.
pub fn summarize_csv(contents: &str) -> Result<FrameSummary> {
    let mut lines = contents.lines().filter(|line| !line.trim().is_empty());
    let header = lines.next().ok_or_else(|| anyhow!("frame csv is empty"))?;
    let columns: Vec<&str> = header.split(',').map(str::trim).collect();
    let index = FRAME_TIME_COLUMNS
        .iter()
        .find_map(|name| columns.iter().position(|col| col == name))
        .ok_or_else(|| anyhow!("frame csv has no {} column", FRAME_TIME_COLUMNS.join("/")))?;

    let mut frame_ms: Vec<f64> = lines
        .filter_map(|line| line.split(',').nth(index))
        .filter_map(|cell| cell.trim().parse::<f64>().ok())
        .filter(|ms| ms.is_finite() && *ms > 0.0)
        .collect();
    if frame_ms.is_empty() {
        bail!("frame csv has no frame rows");
    }

    frame_ms.sort_by(f64::total_cmp);
    let frames = frame_ms.len();
    let mean_frame_ms = frame_ms.iter().sum::<f64>() / frames as f64;
    let p99_index = ((frames as f64 * 0.99).ceil() as usize).clamp(1, frames) - 1;
    let p99_ms = frame_ms[p99_index];
    let max_frame_ms = frame_ms[frames - 1];

    Ok(FrameSummary {
        frames,
        mean_frame_ms,
        avg_fps: 1000.0 / mean_frame_ms,
        one_percent_low_fps: 1000.0 / p99_ms,
        max_frame_ms,
    })
}
