//! Test generation pipeline.
//!
//! Each source unit flows through prompt composition, the model
//! orchestrator, and the response sanitizer, and yields at most one test file.
//! Units are independent and may be processed by several workers at once.

pub mod prompt;
pub mod sanitize;
pub mod unit;

use crate::config::Rules;
use crate::context::RunContext;
use crate::llm::{GenerationRequest, ModelOrchestrator};
use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::sync::Mutex as TokioMutex;
use unit::{extract_includes, SourceUnit};

/// A unit that could not be turned into a test file
#[derive(Debug, Clone)]
pub struct UnitFailure {
    pub unit: PathBuf,
    pub cause: String,
}

/// Tally of a batch run
#[derive(Debug, Default)]
pub struct BatchReport {
    pub generated: Vec<PathBuf>,
    pub failures: Vec<UnitFailure>,
}

impl BatchReport {
    pub fn total(&self) -> usize {
        self.generated.len() + self.failures.len()
    }

    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    fn record(&mut self, outcome: UnitOutcome) {
        match outcome.result {
            Ok(path) => self.generated.push(path),
            Err(cause) => self.failures.push(UnitFailure {
                unit: outcome.unit,
                cause,
            }),
        }
    }
}

/// Result message a worker sends to the collector
struct UnitOutcome {
    unit: PathBuf,
    result: std::result::Result<PathBuf, String>,
}

/// Generates one test file per source unit.
pub struct TestGenerator {
    orchestrator: ModelOrchestrator,
    rules: Arc<Rules>,
    extra_guidance: Option<String>,
    ctx: RunContext,
}

impl TestGenerator {
    pub fn new(
        orchestrator: ModelOrchestrator,
        rules: Arc<Rules>,
        extra_guidance: Option<String>,
        ctx: RunContext,
    ) -> Self {
        Self {
            orchestrator,
            rules,
            extra_guidance,
            ctx,
        }
    }

    /// Compose the prompt and request for one unit.
    pub fn request_for(&self, unit: &SourceUnit) -> GenerationRequest {
        let source = unit.combined_source();
        let includes = extract_includes(&source);
        let prompt = prompt::compose(
            &source,
            &self.rules,
            self.extra_guidance.as_deref(),
            &includes,
        );
        GenerationRequest::new(prompt, &self.rules.model_config)
    }

    /// Generate and save the test file for one unit, returning its path.
    pub async fn generate_unit(&self, unit: &SourceUnit) -> Result<PathBuf> {
        let request = self.request_for(unit);
        tracing::info!(
            "Generating tests for {} (prompt: {} bytes)",
            unit.path.display(),
            request.prompt.len()
        );

        let generated = self
            .orchestrator
            .generate(&request)
            .await
            .with_context(|| format!("Failed to generate unit tests for {}", unit.path.display()))?;

        if generated.failed_attempts > 0 {
            self.ctx.debug(format!(
                "{}: succeeded with {} after {} failed attempts",
                unit.path.display(),
                generated.model,
                generated.failed_attempts
            ));
        }

        let output_path = unit.test_file_path(&self.rules.paths.tests_dir);
        save_test_file(&output_path, &generated.code).await?;

        tracing::info!(
            "Generated test file: {} ({} bytes)",
            output_path.display(),
            generated.code.len()
        );
        Ok(output_path)
    }

    /// Process every unit with `model_config.parallel_workers` workers.
    ///
    /// Failures are logged and counted; they never stop the batch.
    pub async fn process_units(self: &Arc<Self>, units: Vec<SourceUnit>) -> BatchReport {
        let start = Instant::now();
        let worker_count = self.rules.model_config.parallel_workers.max(1);
        self.ctx.info(format!(
            "Processing {} source units with {} worker(s)",
            units.len(),
            worker_count
        ));

        let (task_tx, task_rx) = mpsc::channel::<SourceUnit>(100);
        let task_rx = Arc::new(TokioMutex::new(task_rx));
        let (result_tx, mut result_rx) = mpsc::channel::<UnitOutcome>(100);

        let mut worker_handles = Vec::new();
        for worker_id in 0..worker_count {
            let generator = Arc::clone(self);
            let rx = Arc::clone(&task_rx);
            let tx = result_tx.clone();
            worker_handles.push(tokio::spawn(async move {
                generation_worker(worker_id, generator, rx, tx).await
            }));
        }
        drop(result_tx);

        let feeder = tokio::spawn(async move {
            for unit in units {
                if task_tx.send(unit).await.is_err() {
                    break;
                }
            }
        });

        // Single collector owns the tally
        let mut report = BatchReport::default();
        while let Some(outcome) = result_rx.recv().await {
            report.record(outcome);
        }

        if let Err(e) = feeder.await {
            tracing::warn!("Unit feeder failed: {}", e);
        }
        for handle in worker_handles {
            if let Err(e) = handle.await {
                tracing::warn!("Generation worker failed: {}", e);
            }
        }

        report.generated.sort();
        report.failures.sort_by(|a, b| a.unit.cmp(&b.unit));

        tracing::info!(
            "Processing complete in {:?}. Success: {}, Failures: {}",
            start.elapsed(),
            report.generated.len(),
            report.failures.len()
        );
        report
    }
}

async fn generation_worker(
    worker_id: usize,
    generator: Arc<TestGenerator>,
    receiver: Arc<TokioMutex<mpsc::Receiver<SourceUnit>>>,
    results: mpsc::Sender<UnitOutcome>,
) {
    tracing::debug!("Generation worker {} started", worker_id);

    loop {
        let unit = {
            let mut rx = receiver.lock().await;
            rx.recv().await
        };

        let Some(unit) = unit else {
            break;
        };

        let result = match generator.generate_unit(&unit).await {
            Ok(path) => {
                generator
                    .ctx
                    .success(format!("{} -> {}", unit.path.display(), path.display()));
                Ok(path)
            }
            Err(e) => {
                let cause = format!("{:#}", e);
                tracing::warn!("Failed to process {}: {}", unit.path.display(), cause);
                generator
                    .ctx
                    .error(format!("{}: {}", unit.path.display(), cause));
                Err(cause)
            }
        };

        let outcome = UnitOutcome {
            unit: unit.path,
            result,
        };
        if results.send(outcome).await.is_err() {
            break;
        }
    }

    tracing::debug!("Generation worker {} stopped", worker_id);
}

/// Write `code` to `path`, creating parent directories.
async fn save_test_file(path: &std::path::Path, code: &str) -> Result<()> {
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("Failed to create directory {}", dir.display()))?;
    }

    let mut contents = code.to_string();
    if !contents.ends_with('\n') {
        contents.push('\n');
    }
    tokio::fs::write(path, contents)
        .await
        .with_context(|| format!("Failed to write test file {}", path.display()))?;
    Ok(())
}
