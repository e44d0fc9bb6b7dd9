//! Command-line interface argument parsing.
//!
//! This module handles all CLI argument parsing using clap,
//! including validation and default values.

use crate::config::Provider;
use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::PathBuf;

/// GovSynth - synthetic agent-governance evaluation pipeline
///
/// Generates scenarios, governance traces and LLM-judge evaluations for a
/// corpus of agent runs, then aggregates the judgements into statistics.
///
/// Examples:
///   govsynth scenario --classes "Goal Drift,Normal Operation" --count 5
///   govsynth scenario --runs 4 --overwrite
///   govsynth governance --concurrency 8
///   govsynth evaluate --provider gemini --model gemini-1.5-flash-latest
///   govsynth evaluate --runs 3,7 --overwrite
///   govsynth run --count 2
///   govsynth stats --format markdown --output report.md
///   govsynth init-config
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Path to configuration file
    ///
    /// If not specified, looks for .govsynth.toml in the current directory
    #[arg(short, long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    /// Root directory holding the run directories
    #[arg(short, long, value_name = "DIR", global = true, env = "GOVSYNTH_ROOT")]
    pub root: Option<PathBuf>,

    /// Model to use for generation and judging
    #[arg(short, long, global = true, env = "GOVSYNTH_MODEL")]
    pub model: Option<String>,

    /// Model provider API
    #[arg(long, value_name = "PROVIDER", global = true)]
    pub provider: Option<Provider>,

    /// Provider API endpoint URL
    #[arg(long, value_name = "URL", global = true, env = "OLLAMA_URL")]
    pub endpoint: Option<String>,

    /// Number of concurrent model invocations
    #[arg(long, value_name = "NUM", global = true)]
    pub concurrency: Option<usize>,

    /// Per-attempt request timeout in seconds
    #[arg(long, value_name = "SECS", global = true)]
    pub timeout: Option<u64>,

    /// Total attempts per invocation, including the first
    #[arg(long, value_name = "NUM", global = true)]
    pub max_attempts: Option<u32>,

    /// Append every model attempt to <root>/audit.jsonl
    #[arg(long, global = true)]
    pub audit: bool,

    /// Enable verbose logging output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Run in quiet mode (minimal output)
    #[arg(short, long, global = true)]
    pub quiet: bool,
}

/// Pipeline commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Allocate new runs and synthesize a scenario for each
    Scenario(ScenarioArgs),

    /// Generate governance traces for runs that have a scenario
    Governance(StageArgs),

    /// Judge governance traces, then refresh the corpus summary
    Evaluate(StageArgs),

    /// Run all three stages end to end, then summarize
    Run(RunArgs),

    /// Aggregate stored evaluations into evaluation_summary.json
    Summarize,

    /// Print corpus statistics as Markdown or JSON
    Stats(StatsArgs),

    /// Generate a default .govsynth.toml configuration file
    InitConfig(InitConfigArgs),
}

/// Arguments for the scenario stage.
#[derive(ClapArgs, Debug, Clone, Default)]
pub struct ScenarioArgs {
    /// Scenario classes to generate (comma-separated)
    ///
    /// Example: --classes "Goal Drift,Prompt Injection Response"
    #[arg(long, value_name = "CLASSES", value_delimiter = ',')]
    pub classes: Option<Vec<String>>,

    /// Scenarios to generate per class
    #[arg(long, value_name = "COUNT")]
    pub count: Option<usize>,

    /// Regenerate scenarios for these existing run ids instead of allocating new runs
    #[arg(long, value_name = "IDS", value_delimiter = ',', conflicts_with_all = ["classes", "count"])]
    pub runs: Option<Vec<String>>,

    /// Regenerate scenarios that already exist (with --runs)
    #[arg(long, requires = "runs")]
    pub overwrite: bool,

    /// Prompt template to use instead of the configured one
    #[arg(long, value_name = "FILE")]
    pub prompt: Option<PathBuf>,
}

/// Arguments for the governance and evaluation stages.
#[derive(ClapArgs, Debug, Clone, Default)]
pub struct StageArgs {
    /// Only process these run ids (comma-separated)
    #[arg(long, value_name = "IDS", value_delimiter = ',')]
    pub runs: Option<Vec<String>>,

    /// Regenerate artifacts that already exist
    #[arg(long)]
    pub overwrite: bool,

    /// Prompt template to use instead of the configured one
    #[arg(long, value_name = "FILE")]
    pub prompt: Option<PathBuf>,
}

/// Arguments for the end-to-end pipeline.
#[derive(ClapArgs, Debug, Clone, Default)]
pub struct RunArgs {
    /// Scenario classes to generate (comma-separated)
    #[arg(long, value_name = "CLASSES", value_delimiter = ',')]
    pub classes: Option<Vec<String>>,

    /// Scenarios to generate per class
    #[arg(long, value_name = "COUNT")]
    pub count: Option<usize>,
}

/// Arguments for the stats command.
#[derive(ClapArgs, Debug, Clone, Default)]
pub struct StatsArgs {
    /// Output format (markdown, json)
    #[arg(long, default_value = "markdown", value_name = "FORMAT")]
    pub format: OutputFormat,

    /// Write the report to this file instead of stdout
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,
}

/// Arguments for init-config.
#[derive(ClapArgs, Debug, Clone, Default)]
pub struct InitConfigArgs {
    /// Overwrite an existing configuration file
    #[arg(long)]
    pub force: bool,
}

/// Output format for the report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum OutputFormat {
    /// Markdown format (default)
    #[default]
    Markdown,
    /// JSON format
    Json,
}

impl Args {
    /// Parse command-line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Validate the parsed arguments.
    pub fn validate(&self) -> Result<(), String> {
        // Check for conflicting options
        if self.verbose && self.quiet {
            return Err("Cannot use both --verbose and --quiet".to_string());
        }

        if let Some(ref endpoint) = self.endpoint {
            if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
                return Err("Endpoint URL must start with 'http://' or 'https://'".to_string());
            }
        }

        if self.concurrency == Some(0) {
            return Err("Concurrency must be at least 1".to_string());
        }

        if self.timeout == Some(0) {
            return Err("Timeout must be at least 1 second".to_string());
        }

        if self.max_attempts == Some(0) {
            return Err("Max attempts must be at least 1".to_string());
        }

        let (classes, count) = match &self.command {
            Command::Scenario(a) => (a.classes.as_ref(), a.count),
            Command::Run(a) => (a.classes.as_ref(), a.count),
            _ => (None, None),
        };
        if count == Some(0) {
            return Err("Count must be at least 1".to_string());
        }
        if let Some(classes) = classes {
            if classes.iter().all(|c| c.trim().is_empty()) {
                return Err("At least one scenario class is required".to_string());
            }
        }

        let runs = match &self.command {
            Command::Scenario(a) => a.runs.as_ref(),
            Command::Governance(a) | Command::Evaluate(a) => a.runs.as_ref(),
            _ => None,
        };
        if let Some(runs) = runs {
            if runs.iter().any(|r| r.trim().is_empty()) {
                return Err("Run ids must not be empty".to_string());
            }
        }

        Ok(())
    }

    /// Returns the log level based on verbosity settings.
    pub fn log_level(&self) -> tracing::Level {
        if self.quiet {
            tracing::Level::ERROR
        } else if self.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        }
    }
}
