use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Ollama endpoint used when neither the config nor the environment names one
pub const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";

/// Environment variable that overrides the default Ollama endpoint
pub const OLLAMA_HOST_ENV: &str = "OLLAMA_HOST";

/// Test generation rules and tool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rules {
    /// General settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// Target language of the codebase under test
    #[serde(default = "default_language")]
    pub language: String,

    /// Human-readable test framework name
    #[serde(default = "default_framework")]
    pub framework: String,

    /// Framework identifier used in prompts and for test extraction
    #[serde(default)]
    pub test_framework: TestFramework,

    #[serde(default)]
    pub naming: NamingConfig,

    /// Include directives every generated test file should carry
    #[serde(default = "default_includes")]
    pub includes: Vec<String>,

    #[serde(default)]
    pub standards: StandardsConfig,

    #[serde(default)]
    pub test_case_rules: TestCaseRules,

    #[serde(default)]
    pub assertions: AssertionConfig,

    #[serde(default)]
    pub methods_to_test: MethodsConfig,

    #[serde(default)]
    pub output_format: OutputFormat,

    #[serde(default)]
    pub prompt_guidance: PromptGuidance,

    #[serde(default)]
    pub coverage: CoverageConfig,

    #[serde(default)]
    pub model_config: ModelConfig,

    #[serde(default)]
    pub paths: PathsConfig,

    #[serde(default)]
    pub build: BuildConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Test framework whose declaration macros the generated tests use
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TestFramework {
    /// GoogleTest: `TEST(Suite, Name)` and `TEST_F(Fixture, Name)`
    #[default]
    Gtest,
    /// Catch2: `TEST_CASE("name", "[tag]")`
    Catch2,
    /// doctest: `TEST_CASE("name")`
    Doctest,
}

impl std::fmt::Display for TestFramework {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TestFramework::Gtest => write!(f, "gtest"),
            TestFramework::Catch2 => write!(f, "catch2"),
            TestFramework::Doctest => write!(f, "doctest"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamingConfig {
    /// Declaration macro generated tests should use
    #[serde(default = "default_test_prefix")]
    pub test_prefix: String,

    #[serde(default = "default_true")]
    pub descriptive_test_names: bool,

    #[serde(default = "default_true")]
    pub include_class_in_test_name: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StandardsConfig {
    /// Language standard, e.g. "C++17"
    #[serde(default = "default_cpp_standard")]
    pub cpp_standard: String,
}

impl StandardsConfig {
    /// Compiler flag for the configured standard ("C++17" -> "-std=c++17")
    pub fn compiler_flag(&self) -> String {
        format!("-std={}", self.cpp_standard.trim().to_lowercase())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCaseRules {
    /// Test cases to write for each method
    #[serde(default = "default_per_method")]
    pub per_method: u32,

    /// Ceiling on the number of tests in one generated file
    #[serde(default = "default_total_tests")]
    pub total_tests: u32,

    #[serde(default = "default_true")]
    pub include_positive_case: bool,

    #[serde(default = "default_true")]
    pub include_negative_case: bool,

    /// Values tests must not exercise; also penalized during scoring
    #[serde(default = "default_avoid_edge_cases")]
    pub avoid_edge_cases: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssertionConfig {
    /// Assertions that raise a test's quality score
    #[serde(default = "default_preferred_assertions")]
    pub preferred: Vec<String>,

    #[serde(default = "default_true")]
    pub complete_braces_required: bool,
}

/// Where the list of methods to focus on comes from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MethodSource {
    /// Let the model cover every method kind it finds
    Dynamic,
    /// Use `manual_list` verbatim
    #[default]
    Manual,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MethodsConfig {
    #[serde(default)]
    pub source: MethodSource,

    #[serde(default = "default_manual_list")]
    pub manual_list: Vec<String>,
}

impl MethodsConfig {
    /// Methods or method kinds the prompt asks the model to focus on
    pub fn methods_to_test(&self) -> Vec<String> {
        match self.source {
            MethodSource::Manual => self.manual_list.clone(),
            MethodSource::Dynamic => [
                "all public methods",
                "constructors",
                "destructors",
                "operators",
                "static methods",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputFormat {
    /// Language tag for code fences ("cpp")
    #[serde(default = "default_file_type")]
    pub file_type: String,

    /// Ask for (and send) markdown-fenced code
    #[serde(default)]
    pub markdown_code_fences: bool,

    /// Allow explanations as long as they stay in code comments
    #[serde(default)]
    pub extra_text: bool,

    /// Show the model a short example of the expected output
    #[serde(default = "default_true")]
    pub example_in_prompt: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptGuidance {
    /// Opening role framing for every prompt
    #[serde(default = "default_role_description")]
    pub role_description: String,

    #[serde(default = "default_true")]
    pub strict_formatting: bool,

    #[serde(default = "default_true")]
    pub code_to_test_in_prompt: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoverageConfig {
    /// Minimum acceptable line coverage, in percent
    #[serde(default = "default_minimum_threshold")]
    pub minimum_threshold: f64,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Upper bound for each compiler, test binary, or lcov invocation
    #[serde(default = "default_tool_timeout")]
    pub tool_timeout_seconds: u64,

    /// Path patterns handed to `lcov --exclude`
    #[serde(default = "default_exclude_patterns")]
    pub exclude_patterns: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Ollama API URL; falls back to `OLLAMA_HOST`, then localhost
    #[serde(default)]
    pub endpoint: Option<String>,

    #[serde(default = "default_primary_model")]
    pub primary_model: String,

    /// Tried in order once the primary model is exhausted
    #[serde(default)]
    pub fallback_models: Vec<String>,

    /// Attempts per model
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Deadline for a single attempt
    #[serde(default = "default_timeout_minutes")]
    pub timeout_minutes: u64,

    #[serde(default = "default_context_window")]
    pub context_window: u32,

    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Source units generated concurrently
    #[serde(default = "default_parallel_workers")]
    pub parallel_workers: usize,
}

impl ModelConfig {
    /// Primary model followed by the fallbacks, in priority order
    pub fn requested_models(&self) -> Vec<String> {
        std::iter::once(self.primary_model.clone())
            .chain(self.fallback_models.iter().cloned())
            .collect()
    }

    /// Resolve the Ollama URL from config, then the environment, then the default
    pub fn ollama_url(&self) -> String {
        resolve_ollama_url(
            self.endpoint.as_deref(),
            std::env::var(OLLAMA_HOST_ENV).ok().as_deref(),
        )
    }
}

/// Pick the first non-empty endpoint and normalize bare `host:port` values.
pub fn resolve_ollama_url(configured: Option<&str>, env: Option<&str>) -> String {
    let raw = configured
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .or_else(|| env.map(str::trim).filter(|s| !s.is_empty()))
        .unwrap_or(DEFAULT_OLLAMA_URL);

    let url = if raw.starts_with("http://") || raw.starts_with("https://") {
        raw.to_string()
    } else {
        format!("http://{}", raw)
    };
    url.trim_end_matches('/').to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Root of the codebase under test
    #[serde(default = "default_codebase_dir")]
    pub codebase_dir: PathBuf,

    /// Where generated tests and the coverage summary are written
    #[serde(default = "default_tests_dir")]
    pub tests_dir: PathBuf,

    /// Scratch space for raw coverage reports (system temp dir if unset)
    #[serde(default)]
    pub temp_dir: Option<PathBuf>,

    /// Top-level folders of the codebase to scan; "." is the root itself.
    /// Empty scans everything.
    #[serde(default)]
    pub folders_to_scan: Vec<String>,

    /// Optional free-text guidance appended to every prompt
    #[serde(default = "default_extra_prompt")]
    pub extra_prompt: PathBuf,
}

/// External build tools. Each command may carry leading arguments
/// (`"ccache g++"`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildConfig {
    #[serde(default = "default_cmake")]
    pub cmake: String,

    #[serde(default = "default_make")]
    pub make: String,

    /// Compilers tried in order when a project has no build system
    #[serde(default = "default_compilers")]
    pub compilers: Vec<String>,

    /// Parallel jobs for `make` when building googletest
    #[serde(default = "default_make_jobs")]
    pub make_jobs: u32,

    /// Upper bound for each build step
    #[serde(default = "default_build_timeout")]
    pub timeout_seconds: u64,
}

impl PathsConfig {
    pub fn temp_dir(&self) -> PathBuf {
        self.temp_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}

// Default value functions
fn default_cmake() -> String {
    "cmake".to_string()
}

fn default_make() -> String {
    "make".to_string()
}

fn default_compilers() -> Vec<String> {
    vec!["g++".to_string(), "clang++".to_string()]
}

fn default_make_jobs() -> u32 {
    4
}

fn default_build_timeout() -> u64 {
    1800 // 30 minutes
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_language() -> String {
    "C++".to_string()
}

fn default_framework() -> String {
    "Google Test".to_string()
}

fn default_test_prefix() -> String {
    "TEST".to_string()
}

fn default_includes() -> Vec<String> {
    vec![
        "#include <gtest/gtest.h>".to_string(),
        "#include <cmath>".to_string(),
        "#include <stdexcept>".to_string(),
    ]
}

fn default_cpp_standard() -> String {
    "C++17".to_string()
}

fn default_per_method() -> u32 {
    2
}

fn default_total_tests() -> u32 {
    4
}

fn default_avoid_edge_cases() -> Vec<String> {
    vec!["INT_MIN".to_string(), "INT_MAX".to_string()]
}

fn default_preferred_assertions() -> Vec<String> {
    ["EXPECT_EQ", "EXPECT_NE", "EXPECT_TRUE", "EXPECT_FALSE"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_manual_list() -> Vec<String> {
    vec!["add".to_string(), "subtract".to_string()]
}

fn default_file_type() -> String {
    "cpp".to_string()
}

fn default_role_description() -> String {
    "You are an expert C++ programmer tasked with generating unit tests using Google Test \
     for the provided C++ code. Follow these requirements strictly:"
        .to_string()
}

fn default_minimum_threshold() -> f64 {
    80.0
}

fn default_tool_timeout() -> u64 {
    600 // 10 minutes
}

fn default_exclude_patterns() -> Vec<String> {
    vec![
        "*/external/*".to_string(),
        "/usr/include/*".to_string(),
        "/Applications/*".to_string(),
        "*/Library/Developer/*".to_string(),
    ]
}

fn default_primary_model() -> String {
    "qwen2.5-coder:7b".to_string()
}

fn default_max_retries() -> u32 {
    3
}

fn default_timeout_minutes() -> u64 {
    5
}

fn default_context_window() -> u32 {
    4096
}

fn default_max_output_tokens() -> u32 {
    1024
}

fn default_temperature() -> f32 {
    0.7
}

fn default_parallel_workers() -> usize {
    1
}

fn default_codebase_dir() -> PathBuf {
    PathBuf::from("./codebase")
}

fn default_tests_dir() -> PathBuf {
    PathBuf::from("./tests")
}

fn default_extra_prompt() -> PathBuf {
    PathBuf::from("extra_prompt.txt")
}

impl Default for Rules {
    fn default() -> Self {
        Self {
            general: GeneralConfig::default(),
            language: default_language(),
            framework: default_framework(),
            test_framework: TestFramework::default(),
            naming: NamingConfig::default(),
            includes: default_includes(),
            standards: StandardsConfig::default(),
            test_case_rules: TestCaseRules::default(),
            assertions: AssertionConfig::default(),
            methods_to_test: MethodsConfig::default(),
            output_format: OutputFormat::default(),
            prompt_guidance: PromptGuidance::default(),
            coverage: CoverageConfig::default(),
            model_config: ModelConfig::default(),
            paths: PathsConfig::default(),
            build: BuildConfig::default(),
        }
    }
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

impl Default for NamingConfig {
    fn default() -> Self {
        Self {
            test_prefix: default_test_prefix(),
            descriptive_test_names: true,
            include_class_in_test_name: true,
        }
    }
}

impl Default for StandardsConfig {
    fn default() -> Self {
        Self {
            cpp_standard: default_cpp_standard(),
        }
    }
}

impl Default for TestCaseRules {
    fn default() -> Self {
        Self {
            per_method: default_per_method(),
            total_tests: default_total_tests(),
            include_positive_case: true,
            include_negative_case: true,
            avoid_edge_cases: default_avoid_edge_cases(),
        }
    }
}

impl Default for AssertionConfig {
    fn default() -> Self {
        Self {
            preferred: default_preferred_assertions(),
            complete_braces_required: true,
        }
    }
}

impl Default for MethodsConfig {
    fn default() -> Self {
        Self {
            source: MethodSource::default(),
            manual_list: default_manual_list(),
        }
    }
}

impl Default for OutputFormat {
    fn default() -> Self {
        Self {
            file_type: default_file_type(),
            markdown_code_fences: false,
            extra_text: false,
            example_in_prompt: true,
        }
    }
}

impl Default for PromptGuidance {
    fn default() -> Self {
        Self {
            role_description: default_role_description(),
            strict_formatting: true,
            code_to_test_in_prompt: true,
        }
    }
}

impl Default for CoverageConfig {
    fn default() -> Self {
        Self {
            minimum_threshold: default_minimum_threshold(),
            enabled: true,
            tool_timeout_seconds: default_tool_timeout(),
            exclude_patterns: default_exclude_patterns(),
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            primary_model: default_primary_model(),
            fallback_models: Vec::new(),
            max_retries: default_max_retries(),
            timeout_minutes: default_timeout_minutes(),
            context_window: default_context_window(),
            max_output_tokens: default_max_output_tokens(),
            temperature: default_temperature(),
            parallel_workers: default_parallel_workers(),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            codebase_dir: default_codebase_dir(),
            tests_dir: default_tests_dir(),
            temp_dir: None,
            folders_to_scan: Vec::new(),
            extra_prompt: default_extra_prompt(),
        }
    }
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            cmake: default_cmake(),
            make: default_make(),
            compilers: default_compilers(),
            make_jobs: default_make_jobs(),
            timeout_seconds: default_build_timeout(),
        }
    }
}

impl Rules {
    /// Load rules from file, or fall back to defaults if not found.
    ///
    /// Without an explicit path, `./testforge.toml` is tried before the
    /// per-user config directory.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let rules: Rules = match Self::resolve_config_path(path) {
            Some(ref path) if path.exists() => {
                let contents = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config from {:?}", path))?;
                toml::from_str(&contents)
                    .with_context(|| format!("Failed to parse config from {:?}", path))?
            }
            _ => Rules::default(),
        };

        rules.validate()?;
        Ok(rules)
    }

    /// Save rules to file
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents)
            .with_context(|| format!("Failed to write config to {:?}", path))?;

        Ok(())
    }

    /// Reject configurations that cannot drive a generation run.
    pub fn validate(&self) -> Result<()> {
        let model = &self.model_config;
        if model.primary_model.trim().is_empty() {
            anyhow::bail!("model_config.primary_model must not be empty");
        }
        if model.max_retries == 0 {
            anyhow::bail!("model_config.max_retries must be at least 1");
        }
        if model.timeout_minutes == 0 {
            anyhow::bail!("model_config.timeout_minutes must be at least 1");
        }
        if model.parallel_workers == 0 {
            anyhow::bail!("model_config.parallel_workers must be at least 1");
        }
        if self.methods_to_test.source == MethodSource::Manual
            && self.methods_to_test.manual_list.is_empty()
        {
            anyhow::bail!("methods_to_test.manual_list must not be empty when source = \"manual\"");
        }
        if self.build.cmake.trim().is_empty() || self.build.make.trim().is_empty() {
            anyhow::bail!("build.cmake and build.make must not be empty");
        }
        if self.build.compilers.iter().all(|c| c.trim().is_empty()) {
            anyhow::bail!("build.compilers must name at least one compiler");
        }
        if !(0.0..=100.0).contains(&self.coverage.minimum_threshold) {
            anyhow::bail!(
                "coverage.minimum_threshold must be between 0 and 100, got {}",
                self.coverage.minimum_threshold
            );
        }
        Ok(())
    }

    /// Read the extra prompt file. A missing file means no extra guidance.
    pub fn load_extra_prompt(&self) -> Result<Option<String>> {
        match std::fs::read_to_string(&self.paths.extra_prompt) {
            Ok(contents) if contents.trim().is_empty() => Ok(None),
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| {
                format!("Failed to read extra prompt from {:?}", self.paths.extra_prompt)
            }),
        }
    }

    /// The explicit path if given, else `./testforge.toml` if present,
    /// otherwise the per-user config file
    pub fn resolve_config_path(path: Option<&Path>) -> Option<PathBuf> {
        if let Some(path) = path {
            return Some(path.to_path_buf());
        }
        let local = PathBuf::from("testforge.toml");
        if local.exists() {
            return Some(local);
        }
        Self::default_config_path()
    }

    /// Get the default configuration file path
    pub fn default_config_path() -> Option<PathBuf> {
        ProjectDirs::from("com", "testforge", "testforge")
            .map(|dirs| dirs.config_dir().join("testforge.toml"))
    }
}
