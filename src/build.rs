//! Project builds.
//!
//! The build system is picked from marker files in the project root, in
//! order: `CMakeLists.txt`, `Makefile`, `build.sh`, `configure`. A project
//! with none of them has each non-test source compiled on its own.

use crate::config::BuildConfig;
use crate::context::RunContext;
use crate::process::{run_command_with_timeout, CommandResult};
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

const BUILD_DIR: &str = "build";

/// Extensions compiled when there is no build system
const DIRECT_EXTENSIONS: &[&str] = &["cpp", "cc", "cxx"];

const SKIP_DIRS: &[&str] = &["build", "external", "node_modules"];

const VERSION_CHECK_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildSystem {
    CMake,
    Makefile,
    Script,
    Configure,
    Direct,
}

impl BuildSystem {
    pub fn detect(root: &Path) -> Self {
        if root.join("CMakeLists.txt").is_file() {
            BuildSystem::CMake
        } else if root.join("Makefile").is_file() {
            BuildSystem::Makefile
        } else if root.join("build.sh").is_file() {
            BuildSystem::Script
        } else if root.join("configure").is_file() {
            BuildSystem::Configure
        } else {
            BuildSystem::Direct
        }
    }
}

impl std::fmt::Display for BuildSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BuildSystem::CMake => write!(f, "CMake"),
            BuildSystem::Makefile => write!(f, "make"),
            BuildSystem::Script => write!(f, "build.sh"),
            BuildSystem::Configure => write!(f, "configure + make"),
            BuildSystem::Direct => write!(f, "direct compilation"),
        }
    }
}

/// One external tool invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildStep {
    pub dir: PathBuf,
    pub program: String,
    pub args: Vec<String>,
}

impl BuildStep {
    /// Step from a configured command line (`"ccache g++"`) plus `extra` args
    pub fn tool(dir: &Path, command: &str, extra: &[&str]) -> Result<Self> {
        let mut words = command.split_whitespace();
        let program = words
            .next()
            .with_context(|| format!("Empty build command for {}", dir.display()))?;
        let args = words
            .map(str::to_string)
            .chain(extra.iter().map(|s| s.to_string()))
            .collect();
        Ok(Self {
            dir: dir.to_path_buf(),
            program: program.to_string(),
            args,
        })
    }

    /// Project script run by path from the project root
    fn script(root: &Path, name: &str) -> Self {
        Self {
            dir: root.to_path_buf(),
            program: root.join(name).display().to_string(),
            args: Vec::new(),
        }
    }

    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub async fn run(&self, timeout: Duration) -> CommandResult {
        run_command_with_timeout(&self.dir, &self.program, &self.args, timeout).await
    }
}

/// Run `steps` in order, stopping at the first that fails.
pub async fn run_steps(steps: &[BuildStep], timeout: Duration, ctx: &RunContext) -> Result<()> {
    for step in steps {
        ctx.info(format!("Executing: {}", step.command_line()));
        let result = step.run(timeout).await;
        tracing::debug!(
            "{} finished in {}ms",
            step.command_line(),
            result.duration_ms
        );
        if !result.success {
            anyhow::bail!(
                "{} failed:\n{}",
                step.command_line(),
                result.output.trim_end()
            );
        }
    }
    Ok(())
}

/// Tool steps for `system`; empty for direct compilation.
pub fn plan_steps(system: BuildSystem, root: &Path, tools: &BuildConfig) -> Result<Vec<BuildStep>> {
    let build_dir = root.join(BUILD_DIR);
    let steps = match system {
        BuildSystem::CMake => vec![
            BuildStep::tool(&build_dir, &tools.cmake, &["..", "-DCMAKE_BUILD_TYPE=Debug"])?,
            BuildStep::tool(&build_dir, &tools.cmake, &["--build", "."])?,
        ],
        BuildSystem::Makefile => vec![BuildStep::tool(root, &tools.make, &["all"])?],
        BuildSystem::Script => vec![BuildStep::script(root, "build.sh")],
        BuildSystem::Configure => vec![
            BuildStep::script(root, "configure"),
            BuildStep::tool(root, &tools.make, &[])?,
        ],
        BuildSystem::Direct => Vec::new(),
    };
    Ok(steps)
}

/// Non-test sources under `root` for direct compilation, relative and sorted.
pub fn direct_sources(root: &Path) -> Result<Vec<PathBuf>> {
    let mut sources = Vec::new();

    for entry in walkdir::WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| {
            let name = e.file_name().to_string_lossy();
            e.depth() == 0 || (!name.starts_with('.') && !SKIP_DIRS.contains(&name.as_ref()))
        })
    {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().to_lowercase();
        let is_source = path
            .extension()
            .map(|ext| ext.to_string_lossy().to_lowercase())
            .is_some_and(|ext| DIRECT_EXTENSIONS.contains(&ext.as_str()));

        if is_source && !name.contains("test") {
            sources.push(path.strip_prefix(root).unwrap_or(path).to_path_buf());
        }
    }

    sources.sort();
    Ok(sources)
}

/// Result of a project build
#[derive(Debug)]
pub struct BuildOutcome {
    pub system: BuildSystem,
    /// Sources compiled on their own (direct compilation only)
    pub compiled: Vec<PathBuf>,
    pub failed: Vec<PathBuf>,
    pub duration: Duration,
}

impl BuildOutcome {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Builds a C/C++ project with whatever build system it carries.
pub struct ProjectBuilder {
    root: PathBuf,
    tools: BuildConfig,
    standard_flag: String,
    ctx: RunContext,
}

impl ProjectBuilder {
    pub fn new(root: PathBuf, tools: BuildConfig, standard_flag: String, ctx: RunContext) -> Self {
        Self {
            root,
            tools,
            standard_flag,
            ctx,
        }
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.tools.timeout_seconds)
    }

    /// Detect the build system and run it.
    ///
    /// A failing build tool is an error; with direct compilation each
    /// source that fails is recorded and the rest still compile.
    pub async fn build(&self) -> Result<BuildOutcome> {
        if !self.root.is_dir() {
            anyhow::bail!("Project directory does not exist: {}", self.root.display());
        }

        let system = BuildSystem::detect(&self.root);
        self.ctx.info(format!(
            "Building {} ({})",
            self.root.display(),
            system
        ));
        let start = Instant::now();

        let (compiled, failed) = match system {
            BuildSystem::Direct => self.direct_compile().await?,
            _ => {
                if system == BuildSystem::CMake {
                    let build_dir = self.root.join(BUILD_DIR);
                    std::fs::create_dir_all(&build_dir).with_context(|| {
                        format!("Failed to create build directory {}", build_dir.display())
                    })?;
                }
                let steps = plan_steps(system, &self.root, &self.tools)?;
                run_steps(&steps, self.timeout(), &self.ctx)
                    .await
                    .with_context(|| format!("{} build failed", system))?;
                (Vec::new(), Vec::new())
            }
        };

        let outcome = BuildOutcome {
            system,
            compiled,
            failed,
            duration: start.elapsed(),
        };
        tracing::info!(
            "Build finished in {:?} ({} failed sources)",
            outcome.duration,
            outcome.failed.len()
        );
        Ok(outcome)
    }

    /// First configured compiler that answers `--version`
    async fn find_compiler(&self) -> Result<String> {
        for compiler in &self.tools.compilers {
            if compiler.trim().is_empty() {
                continue;
            }
            let version_check = BuildStep::tool(&self.root, compiler, &["--version"])?;
            if version_check.run(VERSION_CHECK_TIMEOUT).await.success {
                return Ok(compiler.clone());
            }
            tracing::debug!("Compiler {} is not usable", compiler);
        }
        anyhow::bail!(
            "No C++ compiler found (tried {})",
            self.tools.compilers.join(", ")
        )
    }

    async fn direct_compile(&self) -> Result<(Vec<PathBuf>, Vec<PathBuf>)> {
        self.ctx
            .info("No build system found. Attempting direct compilation");
        let sources = direct_sources(&self.root)?;
        if sources.is_empty() {
            anyhow::bail!("No C++ source files found in {}", self.root.display());
        }
        self.ctx.info(format!("Found {} C++ files", sources.len()));

        let compiler = self.find_compiler().await?;
        let build_dir = self.root.join(BUILD_DIR);
        let mut compiled = Vec::new();
        let mut failed = Vec::new();

        for source in sources {
            let output = build_dir.join(source.with_extension(""));
            if let Some(parent) = output.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }

            let output_arg = output.display().to_string();
            let source_arg = source.display().to_string();
            let step = BuildStep::tool(
                &self.root,
                &compiler,
                &[
                    self.standard_flag.as_str(),
                    "-Wall",
                    "-g",
                    "-o",
                    output_arg.as_str(),
                    source_arg.as_str(),
                ],
            )?;

            self.ctx.info(format!("Compiling {}", source.display()));
            let result = step.run(self.timeout()).await;
            if result.success {
                self.ctx.success(format!("Compiled {}", source.display()));
                compiled.push(source);
            } else {
                self.ctx.warning(format!(
                    "Failed to compile {}:\n{}",
                    source.display(),
                    result.output.trim_end()
                ));
                failed.push(source);
            }
        }

        Ok((compiled, failed))
    }
}


#[cfg(test)]
mod tests {
    use super::testing::stub_tool;
    use super::*;
    use crate::context::testing::{memory_context, MemorySink};
    use std::sync::Arc;
    use tempfile::TempDir;

    const STUB_COMPILER: &str = r#"if [ "$1" = "--version" ]; then echo stub; exit 0; fi
case "$*" in *broken.cpp*) echo "error: broken" >&2; exit 1;; esac
while [ $# -gt 0 ]; do
  if [ "$1" = "-o" ]; then shift; echo bin > "$1"; fi
  shift
done
"#;

    fn touch(path: &Path) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, "").unwrap();
    }

    fn builder(root: &Path, tools: BuildConfig) -> (ProjectBuilder, Arc<MemorySink>) {
        let (ctx, sink) = memory_context(false);
        (
            ProjectBuilder::new(root.to_path_buf(), tools, "-std=c++17".to_string(), ctx),
            sink,
        )
    }

    #[test]
    fn test_detect_priority() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        assert_eq!(BuildSystem::detect(root), BuildSystem::Direct);

        touch(&root.join("configure"));
        assert_eq!(BuildSystem::detect(root), BuildSystem::Configure);
        touch(&root.join("build.sh"));
        assert_eq!(BuildSystem::detect(root), BuildSystem::Script);
        touch(&root.join("Makefile"));
        assert_eq!(BuildSystem::detect(root), BuildSystem::Makefile);
        touch(&root.join("CMakeLists.txt"));
        assert_eq!(BuildSystem::detect(root), BuildSystem::CMake);
    }

    #[test]
    fn test_tool_command_keeps_leading_args() {
        let step = BuildStep::tool(Path::new("/p"), "ccache  g++", &["-c", "a.cpp"]).unwrap();
        assert_eq!(step.program, "ccache");
        assert_eq!(step.args, vec!["g++", "-c", "a.cpp"]);
        assert_eq!(step.command_line(), "ccache g++ -c a.cpp");
        assert!(BuildStep::tool(Path::new("/p"), "  ", &[]).is_err());
    }

    #[test]
    fn test_cmake_and_configure_plans() {
        let root = Path::new("/proj");
        let tools = BuildConfig::default();

        let cmake = plan_steps(BuildSystem::CMake, root, &tools).unwrap();
        assert_eq!(cmake.len(), 2);
        assert_eq!(cmake[0].dir, Path::new("/proj/build"));
        assert_eq!(cmake[0].command_line(), "cmake .. -DCMAKE_BUILD_TYPE=Debug");
        assert_eq!(cmake[1].command_line(), "cmake --build .");

        let configure = plan_steps(BuildSystem::Configure, root, &tools).unwrap();
        assert_eq!(configure[0].program, "/proj/configure");
        assert_eq!(configure[1].command_line(), "make");

        let make = plan_steps(BuildSystem::Makefile, root, &tools).unwrap();
        assert_eq!(make[0].command_line(), "make all");
        assert!(plan_steps(BuildSystem::Direct, root, &tools).unwrap().is_empty());
    }

    #[test]
    fn test_direct_sources_skip_tests_and_build_dirs() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        touch(&root.join("main.cpp"));
        touch(&root.join("lib/math.CC"));
        touch(&root.join("lib/math_test.cpp"));
        touch(&root.join("build/generated.cpp"));
        touch(&root.join("external/googletest/gtest.cc"));
        touch(&root.join("lib/math.h"));

        let sources = direct_sources(root).unwrap();
        assert_eq!(
            sources,
            vec![PathBuf::from("lib/math.CC"), PathBuf::from("main.cpp")]
        );
    }

    #[tokio::test]
    async fn test_makefile_build_runs_make_all() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        touch(&root.join("Makefile"));
        let tools = BuildConfig {
            make: stub_tool(root, "make.sh", "echo \"$@\" > make_args.txt\n"),
            ..Default::default()
        };

        let (builder, sink) = builder(root, tools);
        let outcome = builder.build().await.unwrap();

        assert_eq!(outcome.system, BuildSystem::Makefile);
        assert!(outcome.is_success());
        let args = std::fs::read_to_string(root.join("make_args.txt")).unwrap();
        assert_eq!(args.trim(), "all");
        assert!(sink.lines().iter().any(|(_, m)| m.contains("Executing:")));
    }

    #[tokio::test]
    async fn test_failing_tool_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        touch(&root.join("CMakeLists.txt"));
        let tools = BuildConfig {
            cmake: stub_tool(root, "cmake.sh", "echo 'CMake Error: no compiler' >&2\nexit 1\n"),
            ..Default::default()
        };

        let (builder, _) = builder(root, tools);
        let err = builder.build().await.unwrap_err();

        let message = format!("{:#}", err);
        assert!(message.contains("CMake build failed"));
        assert!(message.contains("no compiler"));
        assert!(root.join("build").is_dir());
    }

    #[tokio::test]
    async fn test_direct_compile_records_failures_and_continues() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        touch(&root.join("src/app.cpp"));
        touch(&root.join("src/broken.cpp"));
        touch(&root.join("src/app_test.cpp"));
        let tools = BuildConfig {
            compilers: vec![
                "testforge-missing-compiler".to_string(),
                stub_tool(root, "cc.sh", STUB_COMPILER),
            ],
            ..Default::default()
        };

        let (builder, _) = builder(root, tools);
        let outcome = builder.build().await.unwrap();

        assert_eq!(outcome.system, BuildSystem::Direct);
        assert_eq!(outcome.compiled, vec![PathBuf::from("src/app.cpp")]);
        assert_eq!(outcome.failed, vec![PathBuf::from("src/broken.cpp")]);
        assert!(!outcome.is_success());
        assert!(root.join("build/src/app").is_file());
        assert!(!root.join("build/src/app_test").exists());
    }

    #[tokio::test]
    async fn test_direct_compile_without_compiler() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        touch(&root.join("main.cpp"));
        let tools = BuildConfig {
            compilers: vec!["testforge-missing-compiler".to_string()],
            ..Default::default()
        };

        let (builder, _) = builder(root, tools);
        let err = builder.build().await.unwrap_err();
        assert!(err.to_string().contains("No C++ compiler found"));
    }

    #[tokio::test]
    async fn test_build_missing_project_dir() {
        let temp_dir = TempDir::new().unwrap();
        let (builder, _) = builder(&temp_dir.path().join("nope"), BuildConfig::default());
        assert!(builder.build().await.is_err());
    }
}
