// Diagnostic CLI for the recovery engine
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::{generate, Shell};
use serde_json::json;
use std::path::PathBuf;

use crate::backoff;
use crate::classifier::{ErrorClassifier, OperationContext};
use crate::config::EngineConfig;
use crate::error::{exit_codes, ErrorFormatter, Result};
use crate::logging::LogConfig;
use crate::policy::{RecoveryPolicy, RecoveryStrategy};
use crate::taxonomy::ErrorKind;

#[derive(Parser)]
#[command(
    name = "recovery-engine",
    about = "Inspect error classification and recovery policies",
    version = crate::VERSION,
    long_about = "Classify error messages, print the effective recovery policy table and backoff schedule, and validate engine configuration files."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    pub verbose: bool,

    /// Suppress output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Engine configuration file (.yaml, .yml or .toml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Control color output (auto, always, never)
    #[arg(long, global = true, value_name = "WHEN")]
    pub color: Option<String>,

    /// Output format
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Human)]
    pub format: OutputFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Human,
    Json,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Classify an error message and show the strategies that would run
    Classify {
        /// Name of the operation that failed
        #[arg(long, default_value = "unknown")]
        operation: String,

        /// Operation parameter as KEY=VALUE (repeatable)
        #[arg(long = "param", value_name = "KEY=VALUE", value_parser = parse_key_value)]
        params: Vec<(String, String)>,

        /// Error message to classify
        message: String,
    },

    /// Print the effective recovery policy table
    Policy {
        /// Only show this error kind
        #[arg(long)]
        kind: Option<ErrorKind>,
    },

    /// Print the backoff schedule without jitter
    Backoff {
        /// Number of retry delays to print
        #[arg(long, default_value_t = 5)]
        attempts: u32,
    },

    /// Load and validate a configuration file
    CheckConfig {
        /// Configuration file to validate
        path: PathBuf,
    },

    /// Generate shell completion scripts
    GenerateCompletion {
        /// Shell to generate completion for
        shell: Shell,
    },
}

impl Cli {
    pub fn run(&self) -> Result<i32> {
        self.init_logging();

        match &self.command {
            Commands::Classify {
                operation,
                params,
                message,
            } => {
                let config = self.load_config()?;
                self.classify(&config, operation, params, message)
            }
            Commands::Policy { kind } => {
                let config = self.load_config()?;
                self.print_policy(&config.effective_policy(), *kind)
            }
            Commands::Backoff { attempts } => {
                let config = self.load_config()?;
                self.print_backoff(&config, *attempts)
            }
            Commands::CheckConfig { path } => {
                let config = EngineConfig::from_file(path)?;
                match self.format {
                    OutputFormat::Json => print_json(&json!({
                        "valid": true,
                        "path": path.display().to_string(),
                        "config": config,
                    })),
                    OutputFormat::Human => {
                        println!("Configuration is valid: {}", path.display());
                        println!(
                            "  {} policy override(s), max {} retry attempt(s)",
                            config.policies.len(),
                            config.recovery.max_retry_attempts
                        );
                    }
                }
                Ok(exit_codes::SUCCESS)
            }
            Commands::GenerateCompletion { shell } => {
                let mut cmd = Self::command();
                let name = cmd.get_name().to_string();
                generate(*shell, &mut cmd, name, &mut std::io::stdout());
                Ok(exit_codes::SUCCESS)
            }
        }
    }

    pub fn use_colors(&self) -> bool {
        self.format == OutputFormat::Human && self.log_config().should_use_colors()
    }

    fn log_config(&self) -> LogConfig {
        LogConfig::from_cli(self.verbose, self.quiet, self.color.clone())
    }

    fn init_logging(&self) {
        if let Err(e) = crate::logging::init_logging(self.log_config()) {
            eprintln!("Failed to initialize logging: {e}");
            // Continue execution even if logging fails
        }
    }

    fn load_config(&self) -> Result<EngineConfig> {
        let mut config = match &self.config {
            Some(path) => EngineConfig::from_file(path)?,
            None => EngineConfig::default(),
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    fn classify(
        &self,
        config: &EngineConfig,
        operation: &str,
        params: &[(String, String)],
        message: &str,
    ) -> Result<i32> {
        let context = params
            .iter()
            .fold(OperationContext::new(operation), |ctx, (key, value)| {
                let value = serde_json::from_str(value)
                    .unwrap_or_else(|_| serde_json::Value::String(value.clone()));
                ctx.with_parameter(key.clone(), value)
            });

        let details = ErrorClassifier::new().classify_message(message, &context);
        let policy = config.effective_policy();
        let strategies = policy.strategies_for(details.kind());

        match self.format {
            OutputFormat::Json => print_json(&json!({
                "details": details,
                "strategies": strategies,
            })),
            OutputFormat::Human => {
                println!(
                    "{}",
                    ErrorFormatter::new(self.use_colors()).format_details(&details)
                );
                println!("  Strategies: {}", chain(strategies));
            }
        }
        Ok(exit_codes::SUCCESS)
    }

    fn print_policy(&self, policy: &RecoveryPolicy, kind: Option<ErrorKind>) -> Result<i32> {
        let kinds: Vec<ErrorKind> = match kind {
            Some(kind) => vec![kind],
            None => ErrorKind::ALL.to_vec(),
        };

        match self.format {
            OutputFormat::Json => {
                let table: serde_json::Map<String, serde_json::Value> = kinds
                    .iter()
                    .map(|kind| (kind.to_string(), json!(policy.strategies_for(*kind))))
                    .collect();
                print_json(&serde_json::Value::Object(table));
            }
            OutputFormat::Human => {
                for kind in kinds {
                    let marker = if policy.contains(kind) { "" } else { "  (default)" };
                    println!(
                        "{:<24} {:<16} {}{}",
                        kind.to_string(),
                        kind.category().to_string(),
                        chain(policy.strategies_for(kind)),
                        marker
                    );
                }
            }
        }
        Ok(exit_codes::SUCCESS)
    }

    fn print_backoff(&self, config: &EngineConfig, attempts: u32) -> Result<i32> {
        let delays = backoff::schedule(&config.recovery, attempts);

        match self.format {
            OutputFormat::Json => {
                let millis: Vec<u128> = delays.iter().map(|d| d.as_millis()).collect();
                print_json(&json!({
                    "delays_ms": millis,
                    "jitter": config.recovery.jitter,
                    "max_retry_attempts": config.recovery.max_retry_attempts,
                }));
            }
            OutputFormat::Human => {
                for (index, delay) in delays.iter().enumerate() {
                    println!("retry {:>2}: {:>8}ms", index + 1, delay.as_millis());
                }
                if config.recovery.jitter {
                    println!(
                        "jitter enabled: each delay varies by up to {:.0}%",
                        backoff::JITTER_RATIO * 100.0
                    );
                }
            }
        }
        Ok(exit_codes::SUCCESS)
    }
}

fn chain(strategies: &[RecoveryStrategy]) -> String {
    strategies
        .iter()
        .map(|s| s.as_str())
        .collect::<Vec<_>>()
        .join(" -> ")
}

fn print_json(value: &serde_json::Value) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{text}"),
        Err(e) => eprintln!("Failed to render JSON: {e}"),
    }
}

fn parse_key_value(raw: &str) -> std::result::Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected KEY=VALUE, got '{raw}'")),
    }
}
