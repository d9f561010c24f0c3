//! Line coverage capture and summary.
//!
//! `lcov` writes a raw tracefile into a unique scratch path; the tracefile
//! is streamed once, scoped to the source tree, and removed no matter how
//! parsing ends.

pub mod runner;

use crate::config::Rules;
use crate::process::run_command_with_timeout;
use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::time::Duration;

const FILE_MARKER: &str = "SF:";
const LINE_MARKER: &str = "DA:";

const SUMMARY_DIR: &str = "coverage";
const SUMMARY_FILE: &str = "coverage_summary.txt";
const RULE: &str = "---------------------";

/// Instrumentable and covered line counts for one source file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileCoverage {
    pub total: u64,
    pub covered: u64,
}

/// Aggregated coverage of the files under one source directory.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CoverageSummary {
    pub source_dir: PathBuf,
    pub files: BTreeMap<PathBuf, FileCoverage>,
    pub total_lines: u64,
    pub covered_lines: u64,
}

impl CoverageSummary {
    /// Covered share of instrumentable lines, `None` when there are none.
    pub fn percentage(&self) -> Option<f64> {
        percentage(self.covered_lines, self.total_lines)
    }

    pub fn uncovered_lines(&self) -> u64 {
        self.total_lines - self.covered_lines
    }

    /// Undefined coverage never meets a threshold.
    pub fn meets_threshold(&self, threshold: f64) -> bool {
        self.percentage().is_some_and(|p| p >= threshold)
    }

    fn record(&mut self, file: &Path, hits: i64) {
        let entry = self.files.entry(file.to_path_buf()).or_default();
        entry.total += 1;
        self.total_lines += 1;
        if hits > 0 {
            entry.covered += 1;
            self.covered_lines += 1;
        }
    }

    /// Plain-text summary as written to the summary artifact.
    pub fn render(&self, threshold: f64, generated_at: DateTime<Local>) -> String {
        let mut out = String::new();
        out.push_str(&format!("{}\nCode Coverage Summary\n{}\n", RULE, RULE));
        out.push_str(&format!(
            "Generated:       {}\n",
            generated_at.format("%Y-%m-%d %H:%M:%S")
        ));
        out.push_str(&format!("Source:          {}\n", self.source_dir.display()));
        out.push_str(&format!("Total lines:     {}\n", self.total_lines));
        out.push_str(&format!("Covered lines:   {}\n", self.covered_lines));

        match self.percentage() {
            Some(p) => out.push_str(&format!("Coverage:        {:.2}%\n", p)),
            None => out.push_str("Coverage:        undefined (no instrumentable lines found)\n"),
        }
        out.push_str(&format!("Uncovered lines: {}\n", self.uncovered_lines()));
        out.push_str(&format!(
            "Threshold:       {:.2}% ({})\n",
            threshold,
            if self.meets_threshold(threshold) {
                "met"
            } else {
                "not met"
            }
        ));

        if !self.files.is_empty() {
            out.push_str(&format!("{}\nFiles:\n", RULE));
            for (file, cov) in &self.files {
                let shown = file.strip_prefix(&self.source_dir).unwrap_or(file);
                match percentage(cov.covered, cov.total) {
                    Some(p) => out.push_str(&format!(
                        "  {}: {}/{} ({:.2}%)\n",
                        shown.display(),
                        cov.covered,
                        cov.total,
                        p
                    )),
                    None => out.push_str(&format!("  {}: undefined\n", shown.display())),
                }
            }
        }
        out.push_str(RULE);
        out
    }
}

fn percentage(covered: u64, total: u64) -> Option<f64> {
    (total > 0).then(|| covered as f64 / total as f64 * 100.0)
}

/// Stream a raw tracefile, counting `DA:` records of files under `source_dir`.
///
/// `source_dir` must be absolute for scoping to match tracefile paths.
pub fn parse_report<R: BufRead>(reader: R, source_dir: &Path) -> Result<CoverageSummary> {
    let mut summary = CoverageSummary {
        source_dir: source_dir.to_path_buf(),
        ..Default::default()
    };
    let mut current: Option<PathBuf> = None;

    for line in reader.lines() {
        let line = line.context("Failed to read coverage report")?;

        if let Some(file) = line.strip_prefix(FILE_MARKER) {
            let file = PathBuf::from(file.trim());
            current = file.starts_with(source_dir).then_some(file);
            continue;
        }

        let (Some(file), Some(record)) = (&current, line.strip_prefix(LINE_MARKER)) else {
            continue;
        };

        match parse_line_record(record) {
            Some(hits) => summary.record(file, hits),
            None => tracing::debug!("Skipping malformed coverage record: {}", line),
        }
    }

    tracing::info!(
        "Parsed coverage for {} files: {}/{} lines",
        summary.files.len(),
        summary.covered_lines,
        summary.total_lines
    );
    Ok(summary)
}

/// `<line>,<hits>[,<checksum>]` -> hits
fn parse_line_record(record: &str) -> Option<i64> {
    let mut fields = record.trim().split(',');
    fields.next()?.trim().parse::<u64>().ok()?;
    fields.next()?.trim().parse::<i64>().ok()
}

/// Removes the raw tracefile when dropped.
struct RawReport {
    path: PathBuf,
}

impl RawReport {
    /// Reserve a fresh tracefile path in `dir`
    fn unique_in(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create temp directory {}", dir.display()))?;
        let path = tempfile::Builder::new()
            .prefix("coverage.")
            .suffix(".raw.info")
            .tempfile_in(dir)
            .context("Failed to reserve raw coverage report path")?
            .into_temp_path()
            .keep()
            .context("Failed to keep raw coverage report path")?;
        Ok(Self { path })
    }
}

impl Drop for RawReport {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => tracing::debug!("Removed raw coverage report {}", self.path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(
                "Failed to remove raw coverage report {}: {}",
                self.path.display(),
                e
            ),
        }
    }
}

/// Parse the raw report at `raw_path` and delete it, whatever the outcome.
pub fn analyze(raw_path: &Path, source_dir: &Path) -> Result<CoverageSummary> {
    let report = RawReport {
        path: raw_path.to_path_buf(),
    };
    let file = File::open(&report.path)
        .with_context(|| format!("Coverage report not found: {}", report.path.display()))?;
    parse_report(BufReader::new(file), source_dir)
}

/// `path` made absolute, resolving symlinks when it exists.
pub fn absolute_path(path: &Path) -> Result<PathBuf> {
    path.canonicalize()
        .or_else(|_| std::path::absolute(path))
        .with_context(|| format!("Failed to resolve path {}", path.display()))
}

/// Runs `lcov` and turns its tracefile into a summary artifact.
pub struct CoverageAnalyzer {
    temp_dir: PathBuf,
    tests_dir: PathBuf,
    exclude_patterns: Vec<String>,
    threshold: f64,
    timeout: Duration,
}

impl CoverageAnalyzer {
    pub fn from_rules(rules: &Rules) -> Self {
        Self {
            temp_dir: rules.paths.temp_dir(),
            tests_dir: rules.paths.tests_dir.clone(),
            exclude_patterns: rules.coverage.exclude_patterns.clone(),
            threshold: rules.coverage.minimum_threshold,
            timeout: Duration::from_secs(rules.coverage.tool_timeout_seconds),
        }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Where the summary artifact is written
    pub fn summary_path(&self) -> PathBuf {
        self.tests_dir.join(SUMMARY_DIR).join(SUMMARY_FILE)
    }

    /// `lcov` arguments capturing `test_dir` into `raw`
    pub fn capture_args(&self, test_dir: &Path, raw: &Path) -> Vec<String> {
        let mut args = vec![
            "--capture".to_string(),
            "--directory".to_string(),
            test_dir.display().to_string(),
            "--output-file".to_string(),
            raw.display().to_string(),
            "--ignore-errors".to_string(),
            "unsupported,inconsistent,unused".to_string(),
        ];
        for pattern in &self.exclude_patterns {
            args.push("--exclude".to_string());
            args.push(pattern.clone());
        }
        args
    }

    /// Capture coverage data from `test_dir`, summarize it for `source_dir`,
    /// and write the summary artifact.
    pub async fn run(&self, test_dir: &Path, source_dir: &Path) -> Result<CoverageSummary> {
        let test_dir = absolute_path(test_dir)?;
        let source_dir = absolute_path(source_dir)?;
        let raw = RawReport::unique_in(&self.temp_dir)?;

        tracing::info!(
            "Capturing coverage from {} into {}",
            test_dir.display(),
            raw.path.display()
        );
        let result = run_command_with_timeout(
            &test_dir,
            "lcov",
            self.capture_args(&test_dir, &raw.path),
            self.timeout,
        )
        .await;
        if !result.success {
            anyhow::bail!("lcov capture failed:\n{}", result.output);
        }
        tracing::debug!("lcov finished in {}ms", result.duration_ms);

        let summary = analyze(&raw.path, &source_dir)?;
        self.write_summary(&summary)?;
        Ok(summary)
    }

    /// Write `summary` to `<tests_dir>/coverage/coverage_summary.txt`.
    pub fn write_summary(&self, summary: &CoverageSummary) -> Result<PathBuf> {
        let path = self.summary_path();
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create coverage directory {}", dir.display()))?;
        }
        std::fs::write(&path, summary.render(self.threshold, Local::now()))
            .with_context(|| format!("Failed to write coverage summary {}", path.display()))?;
        tracing::info!("Coverage summary saved to {}", path.display());
        Ok(path)
    }
}
