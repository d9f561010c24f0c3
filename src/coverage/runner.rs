//! Compile and run one test file with coverage instrumentation.

use super::{absolute_path, CoverageAnalyzer, CoverageSummary};
use crate::build::{run_steps, BuildStep};
use crate::config::{BuildConfig, Rules};
use crate::context::RunContext;
use crate::process::run_command_with_timeout;
use crate::scan::list_source_files;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

const COMPILER: &str = "g++";

/// Google Test static libraries
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GtestLibs {
    pub gtest: PathBuf,
    pub gtest_main: PathBuf,
}

/// Include and library locations of a googletest checkout under
/// `<project_root>/external/googletest`.
#[derive(Debug, Clone)]
pub struct GtestLayout {
    root: PathBuf,
}

impl GtestLayout {
    pub fn new(project_root: &Path) -> Self {
        Self {
            root: project_root.join("external").join("googletest"),
        }
    }

    pub fn include_dirs(&self) -> [PathBuf; 2] {
        [
            self.root.join("googletest").join("include"),
            self.root.join("googlemock").join("include"),
        ]
    }

    fn build_dir(&self) -> PathBuf {
        self.root.join("build")
    }

    /// Find the libraries, configuring and building the checkout first when
    /// they are missing.
    pub async fn ensure_built(&self, tools: &BuildConfig, ctx: &RunContext) -> Result<GtestLibs> {
        if let Ok(libs) = self.find_libs() {
            ctx.debug("Google Test libraries found");
            return Ok(libs);
        }
        if !self.root.join("CMakeLists.txt").is_file() {
            anyhow::bail!(
                "Google Test sources not found at {}; clone googletest there first",
                self.root.display()
            );
        }

        ctx.info("Building Google Test libraries");
        let build = self.build_dir();
        std::fs::create_dir_all(&build)
            .with_context(|| format!("Failed to create {}", build.display()))?;

        let jobs = format!("-j{}", tools.make_jobs.max(1));
        let steps = [
            BuildStep::tool(&build, &tools.cmake, &["..", "-DCMAKE_BUILD_TYPE=Release"])?,
            BuildStep::tool(&build, &tools.make, &[jobs.as_str()])?,
        ];
        run_steps(&steps, Duration::from_secs(tools.timeout_seconds), ctx)
            .await
            .context("Failed to build Google Test")?;

        let libs = self.find_libs()?;
        ctx.success("Google Test built successfully");
        Ok(libs)
    }

    /// First build directory holding both libraries
    pub fn find_libs(&self) -> Result<GtestLibs> {
        let build = self.build_dir();
        let candidates = [
            build.join("lib"),
            build.join("googletest"),
            build.join("googlemock").join("gtest"),
        ];

        candidates
            .iter()
            .map(|dir| GtestLibs {
                gtest: dir.join("libgtest.a"),
                gtest_main: dir.join("libgtest_main.a"),
            })
            .find(|libs| libs.gtest.is_file() && libs.gtest_main.is_file())
            .with_context(|| {
                format!(
                    "Google Test libraries not found under {}",
                    build.display()
                )
            })
    }
}

/// Everything needed to build one instrumented test binary
#[derive(Debug, Clone)]
pub struct CompilePlan {
    pub standard_flag: String,
    pub include_dirs: Vec<PathBuf>,
    pub output: String,
    pub test_file: PathBuf,
    pub sources: Vec<PathBuf>,
    pub libs: GtestLibs,
}

impl CompilePlan {
    pub fn args(&self) -> Vec<String> {
        let mut args = vec![
            self.standard_flag.clone(),
            "-g".to_string(),
            "-O0".to_string(),
            "--coverage".to_string(),
        ];
        for dir in &self.include_dirs {
            args.push(format!("-I{}", dir.display()));
        }
        args.push("-pthread".to_string());
        args.push("-o".to_string());
        args.push(self.output.clone());
        args.push(self.test_file.display().to_string());
        args.extend(self.sources.iter().map(|s| s.display().to_string()));
        args.push(self.libs.gtest.display().to_string());
        args.push(self.libs.gtest_main.display().to_string());
        args
    }
}

/// `<stem>_executable` for `foo_test.cc`
pub fn executable_name(test_file: &Path) -> String {
    let stem = test_file
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "test".to_string());
    format!("{}_executable", stem)
}

/// Remove coverage notes, counters, the test binary and debug bundles from
/// `dir`. Returns how many entries were removed.
pub fn cleanup_intermediates(dir: &Path, executable: &str) -> usize {
    let patterns = ["*.gcno", "*.gcda", executable, "*.dSYM"];
    let mut removed = 0;

    for pattern in patterns {
        let full_pattern = dir.join(pattern);
        let paths = match glob::glob(&full_pattern.to_string_lossy()) {
            Ok(paths) => paths,
            Err(e) => {
                tracing::warn!("Invalid cleanup pattern {}: {}", full_pattern.display(), e);
                continue;
            }
        };

        for path in paths.filter_map(Result::ok) {
            let result = if path.is_dir() {
                std::fs::remove_dir_all(&path)
            } else {
                std::fs::remove_file(&path)
            };
            match result {
                Ok(()) => removed += 1,
                Err(e) => tracing::warn!("Failed to remove {}: {}", path.display(), e),
            }
        }
    }

    tracing::debug!("Removed {} intermediate files from {}", removed, dir.display());
    removed
}

/// Outcome of compiling and running one test file
#[derive(Debug)]
pub struct TestRun {
    pub passed: bool,
    pub output: String,
    /// `None` when coverage was disabled or could not be captured
    pub coverage: Option<CoverageSummary>,
}

/// Builds and executes test binaries, then hands off to coverage capture.
pub struct TestRunner {
    rules: Arc<Rules>,
    project_root: PathBuf,
    ctx: RunContext,
}

impl TestRunner {
    pub fn new(rules: Arc<Rules>, project_root: PathBuf, ctx: RunContext) -> Self {
        Self {
            rules,
            project_root,
            ctx,
        }
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.rules.coverage.tool_timeout_seconds)
    }

    pub fn plan(&self, test_file: &Path, source_dir: &Path) -> Result<CompilePlan> {
        let layout = GtestLayout::new(&self.project_root);
        let libs = layout.find_libs()?;

        let mut sources = Vec::new();
        for source in list_source_files(source_dir)? {
            sources.push(absolute_path(&source)?);
        }

        let mut include_dirs: Vec<PathBuf> = layout.include_dirs().into();
        include_dirs.push(source_dir.to_path_buf());

        Ok(CompilePlan {
            standard_flag: self.rules.standards.compiler_flag(),
            include_dirs,
            output: executable_name(test_file),
            test_file: test_file.to_path_buf(),
            sources,
            libs,
        })
    }

    /// Compile `test_file` with every source in `source_dir`, run it, and
    /// capture coverage. Intermediate files are removed before and after.
    pub async fn run_test_file(&self, test_file: &Path, source_dir: &Path) -> Result<TestRun> {
        if !test_file.is_file() {
            anyhow::bail!("Test file does not exist: {}", test_file.display());
        }
        let test_file = absolute_path(test_file)?;
        let source_dir = absolute_path(source_dir)?;
        let test_dir = test_file
            .parent()
            .map(Path::to_path_buf)
            .context("Test file has no parent directory")?;
        let executable = executable_name(&test_file);

        cleanup_intermediates(&test_dir, &executable);

        GtestLayout::new(&self.project_root)
            .ensure_built(&self.rules.build, &self.ctx)
            .await?;
        let plan = self.plan(&test_file, &source_dir)?;
        self.ctx.info(format!("Compiling {} with coverage", test_file.display()));
        let compile =
            run_command_with_timeout(&test_dir, COMPILER, plan.args(), self.timeout()).await;
        if !compile.success {
            cleanup_intermediates(&test_dir, &executable);
            anyhow::bail!("Compilation failed:\n{}", compile.output);
        }
        self.ctx.success("Compilation successful");

        let binary = test_dir.join(&executable);
        self.ctx.info(format!("Running tests from {}", test_file.display()));
        let run = run_command_with_timeout(
            &test_dir,
            &binary.to_string_lossy(),
            Vec::<&str>::new(),
            self.timeout(),
        )
        .await;
        tracing::info!("Test binary finished in {}ms", run.duration_ms);
        if run.timed_out {
            self.ctx.warning(format!("{} timed out", binary.display()));
        }

        // Failing tests still produce coverage data
        let coverage = if self.rules.coverage.enabled {
            let analyzer = CoverageAnalyzer::from_rules(&self.rules);
            match analyzer.run(&test_dir, &source_dir).await {
                Ok(summary) => Some(summary),
                Err(e) => {
                    self.ctx
                        .warning(format!("Coverage summary generation failed: {:#}", e));
                    None
                }
            }
        } else {
            None
        };

        cleanup_intermediates(&test_dir, &executable);

        Ok(TestRun {
            passed: run.success,
            output: run.output,
            coverage,
        })
    }
}
