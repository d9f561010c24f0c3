//! Test suites assembled from existing or generated test files.
//!
//! Files are parsed into [`TestCase`] records, collected into a
//! [`SuiteIndex`], deduplicated by quality score, and rendered back into a
//! single merged test file.

pub mod extractor;
pub mod quality;

use crate::config::Rules;
use crate::generation::unit::extract_includes;
use anyhow::{Context, Result};
use extractor::TestCaseExtractor;
use quality::QualityScorer;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// One test declaration and its verbatim body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestCase {
    pub suite: String,
    pub name: String,
    /// File the case was read from
    pub file: PathBuf,
    /// Declaration through the matching closing brace
    pub body: String,
}

impl TestCase {
    /// Identity key: `(suite, name)`
    pub fn key(&self) -> (&str, &str) {
        (&self.suite, &self.name)
    }
}

/// Test cases grouped by suite name, in insertion order within a suite.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SuiteIndex {
    suites: BTreeMap<String, Vec<TestCase>>,
}

impl SuiteIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, case: TestCase) {
        self.suites.entry(case.suite.clone()).or_default().push(case);
    }

    /// Total number of test cases across all suites
    pub fn len(&self) -> usize {
        self.suites.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn suite_count(&self) -> usize {
        self.suites.len()
    }

    /// Suites in name order
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Vec<TestCase>)> {
        self.suites.iter()
    }

    pub fn into_suites(self) -> BTreeMap<String, Vec<TestCase>> {
        self.suites
    }
}

impl FromIterator<TestCase> for SuiteIndex {
    fn from_iter<I: IntoIterator<Item = TestCase>>(iter: I) -> Self {
        let mut index = SuiteIndex::new();
        for case in iter {
            index.insert(case);
        }
        index
    }
}

/// Result of merging several test files into one
#[derive(Debug)]
pub struct MergedSuite {
    pub includes: Vec<String>,
    /// Top-level code the cases rely on (fixtures, helpers), first-seen order
    pub support: Vec<String>,
    pub index: SuiteIndex,
    /// Cases read before deduplication
    pub extracted: usize,
}

impl MergedSuite {
    pub fn duplicates_dropped(&self) -> usize {
        self.extracted - self.index.len()
    }

    /// Includes, then support code, then every suite's cases separated by
    /// blank lines.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for include in &self.includes {
            out.push_str(include);
            out.push('\n');
        }

        for block in &self.support {
            out.push('\n');
            out.push_str(block);
            out.push('\n');
        }

        for (suite, cases) in self.index.iter() {
            out.push_str(&format!("\n// {}\n", suite));
            for case in cases {
                out.push('\n');
                out.push_str(case.body.trim_end());
                out.push('\n');
            }
        }
        out
    }
}

/// Split the non-test text of a file into top-level blocks.
///
/// Include lines are dropped (they are merged separately). A blank line at
/// brace depth zero ends a block.
fn support_blocks(text: &str) -> Vec<String> {
    let mut blocks = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    let mut depth: i64 = 0;

    for line in text.lines() {
        if line.trim_start().starts_with("#include") {
            continue;
        }
        if line.trim().is_empty() && depth <= 0 {
            if !current.is_empty() {
                blocks.push(current.join("\n"));
                current.clear();
            }
            continue;
        }
        for ch in line.chars() {
            match ch {
                '{' => depth += 1,
                '}' => depth -= 1,
                _ => {}
            }
        }
        current.push(line);
    }
    if !current.is_empty() {
        blocks.push(current.join("\n"));
    }

    blocks
        .into_iter()
        .map(|b| b.trim_end().to_string())
        .filter(|b| !b.trim().is_empty())
        .collect()
}

/// Extract, deduplicate, and combine the test cases of `files`.
pub fn merge_files(files: &[PathBuf], rules: &Rules) -> Result<MergedSuite> {
    let extractor = TestCaseExtractor::new(rules.test_framework)?;
    let scorer = QualityScorer::from_rules(rules);

    let mut includes: Vec<String> = Vec::new();
    let mut support: Vec<String> = Vec::new();
    let mut index = SuiteIndex::new();

    for path in files {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read test file {}", path.display()))?;

        for include in extract_includes(&text) {
            if !includes.contains(&include) {
                includes.push(include);
            }
        }

        let (cases, rest) = extractor.extract_with_support(path, &text);
        tracing::debug!("{}: {} test cases", path.display(), cases.len());
        // Identical fixtures and helpers from several files appear once
        for block in support_blocks(&rest) {
            if !support.contains(&block) {
                support.push(block);
            }
        }
        for case in cases {
            index.insert(case);
        }
    }

    let extracted = index.len();
    let index = scorer.resolve(index);
    tracing::info!(
        "Merged {} files: {} test cases in {} suites ({} duplicates dropped)",
        files.len(),
        index.len(),
        index.suite_count(),
        extracted - index.len()
    );

    Ok(MergedSuite {
        includes,
        support,
        index,
        extracted,
    })
}

/// Merge `files` and write the result to `output`.
pub fn merge_into(files: &[PathBuf], output: &Path, rules: &Rules) -> Result<MergedSuite> {
    let merged = merge_files(files, rules)?;
    if let Some(dir) = output.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create directory {}", dir.display()))?;
    }
    std::fs::write(output, merged.render())
        .with_context(|| format!("Failed to write merged test file {}", output.display()))?;
    Ok(merged)
}
