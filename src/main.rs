mod build;
mod config;
mod context;
mod coverage;
mod generation;
mod llm;
mod process;
mod scan;
mod suite;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::build::ProjectBuilder;
use crate::config::{Rules, TestFramework};
use crate::context::RunContext;
use crate::coverage::runner::TestRunner;
use crate::coverage::CoverageAnalyzer;
use crate::generation::unit::group_units;
use crate::generation::TestGenerator;
use crate::llm::{ModelBackend, ModelOrchestrator, OllamaClient, RetryPolicy};

#[derive(Parser)]
#[command(name = "testforge")]
#[command(version)]
#[command(about = "A local-first, LLM-driven unit test generator for C/C++ codebases")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Print debug output (also enabled by DEBUG=true)
    #[arg(long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a test file for every source unit in the codebase
    Generate {
        /// Number of units to generate concurrently
        #[arg(short, long)]
        workers: Option<usize>,
    },
    /// Merge test files into one, dropping lower-quality duplicates
    Merge {
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Where to write the merged test file
        #[arg(short, long)]
        output: PathBuf,

        /// Declaration style to parse (defaults to the configured framework)
        #[arg(long, value_enum)]
        framework: Option<TestFramework>,
    },
    /// Compile and run a test file with coverage (every test file in the
    /// tests directory when none is given)
    Run {
        test_file: Option<PathBuf>,

        /// Directory of the sources under test (defaults to the codebase)
        #[arg(long)]
        source_dir: Option<PathBuf>,
    },
    /// Summarize coverage data already collected in a test directory
    Coverage {
        #[arg(long)]
        tests_dir: Option<PathBuf>,

        #[arg(long)]
        source_dir: Option<PathBuf>,
    },
    /// Build a C/C++ project with CMake, make, build.sh, configure, or
    /// direct compilation
    Build {
        /// Project directory (defaults to the current directory)
        dir: Option<PathBuf>,
    },
    /// List the models the backend currently serves
    Models,
    /// Write the default configuration to a file
    Init {
        /// Destination (defaults to the per-user config file)
        path: Option<PathBuf>,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn debug_from_env() -> bool {
    std::env::var("DEBUG").is_ok_and(|v| v.trim().eq_ignore_ascii_case("true"))
}

/// `RUST_LOG` wins over the configured level unless debug mode is forced.
fn init_logging(level: &str, debug: bool) {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
    };

    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    let debug = cli.debug || debug_from_env();

    let mut rules = Rules::load(cli.config.as_deref())?;
    init_logging(&rules.general.log_level, debug);

    tracing::info!(
        "Config path: {}",
        Rules::resolve_config_path(cli.config.as_deref())
            .filter(|p| p.exists())
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none, using defaults)".to_string())
    );

    let ctx = RunContext::console(debug);

    match cli.command {
        Commands::Generate { workers } => {
            if let Some(workers) = workers {
                rules.model_config.parallel_workers = workers.max(1);
            }
            generate(Arc::new(rules), ctx).await
        }
        Commands::Merge {
            files,
            output,
            framework,
        } => {
            if let Some(framework) = framework {
                rules.test_framework = framework;
            }
            let merged = suite::merge_into(&files, &output, &rules)?;
            if merged.index.is_empty() {
                ctx.warning("No test cases found in the given files");
            }
            ctx.success(format!(
                "Merged {} test cases into {} ({} duplicates dropped)",
                merged.index.len(),
                output.display(),
                merged.duplicates_dropped()
            ));
            Ok(ExitCode::SUCCESS)
        }
        Commands::Run {
            test_file,
            source_dir,
        } => {
            let source_dir = source_dir.unwrap_or_else(|| rules.paths.codebase_dir.clone());
            let test_files = match test_file {
                Some(file) => vec![file],
                None => scan::list_test_files(&rules.paths.tests_dir)?,
            };
            if test_files.is_empty() {
                ctx.error(format!(
                    "No C++ test files found in {}",
                    rules.paths.tests_dir.display()
                ));
                return Ok(ExitCode::FAILURE);
            }
            run_tests(Arc::new(rules), &test_files, &source_dir, ctx).await
        }
        Commands::Coverage {
            tests_dir,
            source_dir,
        } => {
            let tests_dir = tests_dir.unwrap_or_else(|| rules.paths.tests_dir.clone());
            let source_dir = source_dir.unwrap_or_else(|| rules.paths.codebase_dir.clone());
            let analyzer = CoverageAnalyzer::from_rules(&rules);

            let summary = analyzer.run(&tests_dir, &source_dir).await?;
            report_coverage(&ctx, &summary, analyzer.threshold());
            ctx.success(format!(
                "Summary saved to {}",
                analyzer.summary_path().display()
            ));
            Ok(ExitCode::SUCCESS)
        }
        Commands::Build { dir } => {
            let root = match dir {
                Some(dir) => dir,
                None => std::env::current_dir()?,
            };
            let builder = ProjectBuilder::new(
                root,
                rules.build.clone(),
                rules.standards.compiler_flag(),
                ctx.clone(),
            );
            let outcome = builder.build().await?;
            if outcome.is_success() {
                ctx.success(format!(
                    "Build completed with {} in {:.1?}",
                    outcome.system, outcome.duration
                ));
                Ok(ExitCode::SUCCESS)
            } else {
                ctx.error(format!(
                    "{} of {} sources failed to compile",
                    outcome.failed.len(),
                    outcome.failed.len() + outcome.compiled.len()
                ));
                Ok(ExitCode::FAILURE)
            }
        }
        Commands::Models => {
            let client = OllamaClient::new(&rules.model_config.ollama_url());
            let models = client.list_models().await?;
            if models.is_empty() {
                ctx.warning(format!("No models available at {}", client.base_url()));
            }
            for model in models {
                println!("{}", model);
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Init { path, force } => {
            let path = path
                .or_else(Rules::default_config_path)
                .ok_or_else(|| anyhow::anyhow!("No config directory available; pass a path"))?;
            if path.exists() && !force {
                ctx.error(format!(
                    "{} already exists (use --force to overwrite)",
                    path.display()
                ));
                return Ok(ExitCode::FAILURE);
            }
            Rules::default().save(&path)?;
            ctx.success(format!("Wrote default configuration to {}", path.display()));
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn run_tests(
    rules: Arc<Rules>,
    test_files: &[PathBuf],
    source_dir: &std::path::Path,
    ctx: RunContext,
) -> anyhow::Result<ExitCode> {
    let threshold = rules.coverage.minimum_threshold;
    let project_root = std::env::current_dir()?;
    let runner = TestRunner::new(rules, project_root, ctx.clone());
    let mut failed = 0;

    for test_file in test_files {
        let run = match runner.run_test_file(test_file, source_dir).await {
            Ok(run) => run,
            Err(e) => {
                ctx.error(format!("{}: {:#}", test_file.display(), e));
                failed += 1;
                continue;
            }
        };

        println!("{}", run.output.trim_end());
        if let Some(summary) = &run.coverage {
            report_coverage(&ctx, summary, threshold);
        }

        if run.passed {
            ctx.success(format!("{}: tests passed", test_file.display()));
        } else {
            ctx.error(format!("Test execution failed for {}", test_file.display()));
            failed += 1;
        }
    }

    if failed == 0 {
        Ok(ExitCode::SUCCESS)
    } else {
        ctx.error(format!("{} of {} test files failed", failed, test_files.len()));
        Ok(ExitCode::FAILURE)
    }
}

async fn generate(rules: Arc<Rules>, ctx: RunContext) -> anyhow::Result<ExitCode> {
    let client = OllamaClient::new(&rules.model_config.ollama_url());
    if !client.is_available().await {
        ctx.error(format!(
            "Ollama is not reachable at {}. Is it running?",
            client.base_url()
        ));
        return Ok(ExitCode::FAILURE);
    }
    tracing::info!("Using Ollama at {}", client.base_url());

    let files = scan::read_codebase(&rules.paths.codebase_dir, &rules.paths.folders_to_scan)?;
    let units = group_units(&files);
    if units.is_empty() {
        ctx.warning(format!(
            "No source units found in {}",
            rules.paths.codebase_dir.display()
        ));
        return Ok(ExitCode::SUCCESS);
    }

    let extra_guidance = rules.load_extra_prompt()?;
    if extra_guidance.is_some() {
        ctx.debug(format!(
            "Loaded extra guidance from {}",
            rules.paths.extra_prompt.display()
        ));
    }

    let backend: Arc<dyn ModelBackend> = Arc::new(client);
    let orchestrator =
        ModelOrchestrator::new(backend, RetryPolicy::from_config(&rules.model_config));
    let generator = Arc::new(TestGenerator::new(
        orchestrator,
        rules.clone(),
        extra_guidance,
        ctx.clone(),
    ));

    let report = generator.process_units(units).await;

    ctx.info(format!(
        "Generated {} of {} test files into {}",
        report.generated.len(),
        report.total(),
        rules.paths.tests_dir.display()
    ));
    if report.is_success() {
        Ok(ExitCode::SUCCESS)
    } else {
        let failed: Vec<String> = report
            .failures
            .iter()
            .map(|f| f.unit.display().to_string())
            .collect();
        ctx.error(format!(
            "{} source units failed: {}",
            failed.len(),
            failed.join(", ")
        ));
        Ok(ExitCode::FAILURE)
    }
}

fn report_coverage(ctx: &RunContext, summary: &coverage::CoverageSummary, threshold: f64) {
    match summary.percentage() {
        Some(p) => ctx.info(format!(
            "Coverage: {:.2}% ({}/{} lines, {} uncovered)",
            p,
            summary.covered_lines,
            summary.total_lines,
            summary.uncovered_lines()
        )),
        None => ctx.warning(
            "Coverage undefined: no instrumentable lines found. Check the source directory.",
        ),
    }

    if summary.meets_threshold(threshold) {
        ctx.success(format!("Coverage meets the {:.2}% threshold", threshold));
    } else {
        ctx.warning(format!("Coverage is below the {:.2}% threshold", threshold));
    }
}
