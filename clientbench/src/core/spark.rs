//! Extraction of spark profiler health figures from the client log.
//!
//! spark prints its health report as a header line followed by value lines,
//! each carrying the usual log prefix. Only the most recent report counts.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

static MEMORY_VALUE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([\d.]+)\s*GB\s*/\s*([\d.]+)\s*GB").expect("memory regex"));
static PROCESS_CPU_VALUE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([\d.]+)%.*\(process\)").expect("cpu regex"));

/// Figures taken from the last spark health report in a log.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SparkReport {
    pub memory_used_gb: Option<f64>,
    pub memory_max_gb: Option<f64>,
    /// Process CPU usage over the shortest reported window.
    pub process_cpu_percent: Option<f64>,
}

impl SparkReport {
    pub fn is_empty(&self) -> bool {
        self.memory_used_gb.is_none() && self.process_cpu_percent.is_none()
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Section {
    None,
    Memory,
    Cpu,
}

/// Scan log lines for spark's "Memory usage:" and "CPU usage" sections.
pub fn parse_health_report<'a>(lines: impl IntoIterator<Item = &'a str>) -> SparkReport {
    let mut report = SparkReport::default();
    let mut section = Section::None;

    for line in lines {
        if line.contains("Memory usage:") {
            section = Section::Memory;
        } else if line.contains("CPU usage") {
            section = Section::Cpu;
            continue;
        }

        match section {
            Section::Memory => {
                if let Some(caps) = MEMORY_VALUE.captures(line) {
                    report.memory_used_gb = caps[1].parse().ok();
                    report.memory_max_gb = caps[2].parse().ok();
                    section = Section::None;
                }
            }
            Section::Cpu => {
                if let Some(caps) = PROCESS_CPU_VALUE.captures(line) {
                    report.process_cpu_percent = caps[1].parse().ok();
                    section = Section::None;
                }
            }
            Section::None => {}
        }
    }

    report
}

/// Whether any mod jar name mentions spark.
pub fn is_spark_jar(file_name: &str) -> bool {
    file_name.ends_with(".jar") && file_name.to_ascii_lowercase().contains("spark")
}

#[cfg(test)]
mod tests {
    use super::*;

    const REPORT: &str = "\
[12:00:01] [Server thread/INFO]: [⚡] CPU usage from last 10s, 1m, 15m:
[12:00:01] [Server thread/INFO]: [⚡]  31%, 28%, 12% (system)
[12:00:01] [Server thread/INFO]: [⚡]  22%, 20%, 9% (process)
[12:00:01] [Server thread/INFO]: [⚡] Memory usage:
[12:00:01] [Server thread/INFO]: [⚡]  2.4 GB / 6.0 GB (40%)
";

    #[test]
    fn parses_multi_line_report() {
        let report = parse_health_report(REPORT.lines());
        assert_eq!(report.memory_used_gb, Some(2.4));
        assert_eq!(report.memory_max_gb, Some(6.0));
        assert_eq!(report.process_cpu_percent, Some(22.0));
    }

    #[test]
    fn latest_report_wins() {
        let log = format!("{REPORT}[12:05:00] [Server thread/INFO]: [⚡] Memory usage: 3.1 GB / 6.0 GB\n");
        let report = parse_health_report(log.lines());
        assert_eq!(report.memory_used_gb, Some(3.1));
        assert_eq!(report.process_cpu_percent, Some(22.0));
    }

    #[test]
    fn empty_log_yields_empty_report() {
        let report = parse_health_report(["[12:00:00] [main/INFO]: Loading"]);
        assert!(report.is_empty());
    }

    #[test]
    fn detects_spark_jars() {
        assert!(is_spark_jar("spark-1.10.53-fabric.jar"));
        assert!(is_spark_jar("Spark-forge.jar"));
        assert!(!is_spark_jar("sodium-fabric.jar"));
        assert!(!is_spark_jar("spark.txt"));
    }
}
