//! Application abstraction for reducing main.rs boilerplate.
//!
//! Both binaries follow the same lifecycle: parse `-c`/`-C` arguments, load
//! and validate YAML, start logging and metrics, build one pipeline per
//! configured component, run until a shutdown signal.

use std::fmt::Display;
use std::process::ExitCode;

use clap::Parser;
use tracing::info;

use crate::config::{CliArgs, ConfigPath, Mergeable};
use crate::error::ConfigError;
use crate::topology::{Pipeline, PipelineContext, run_pipelines};
use crate::tracing::init_tracing;

/// Trait for application configurations that can be loaded and run.
pub trait AppConfig: Mergeable + Sized {
    /// The pipeline type this config produces.
    type Pipeline: Pipeline;

    /// Error raised while turning config into running pipelines.
    type BuildError: Display;

    /// Human-readable name for components (e.g., "table", "monitor").
    const COMPONENT_NAME: &'static str;

    /// Load config from paths with validation.
    fn from_paths(paths: &[ConfigPath]) -> Result<Self, ConfigError>;

    /// Create pipelines from this config.
    fn create_pipelines(
        &self,
        context: PipelineContext,
    ) -> Result<Vec<Self::Pipeline>, Self::BuildError>;

    /// Log startup info (component count and details).
    fn log_startup_info(&self);
}

/// Application runner that handles the full startup lifecycle.
pub struct Application<C: AppConfig> {
    config: C,
}

impl<C: AppConfig> Application<C> {
    /// Parse args, load config, run pipelines.
    pub fn run() -> ExitCode {
        let args = CliArgs::parse();
        let paths = args.config_paths();

        match Self::from_paths(&paths) {
            Ok(app) => {
                init_tracing(Mergeable::logging(&app.config).format);
                info!("Loaded config from {} source(s)", paths.len());
                app.execute()
            }
            Err(e) => {
                eprintln!("Failed to load config: {e}");
                ExitCode::FAILURE
            }
        }
    }

    /// Load config from paths (useful for testing).
    pub fn from_paths(paths: &[ConfigPath]) -> Result<Self, ConfigError> {
        let config = C::from_paths(paths)?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &C {
        &self.config
    }

    fn execute(self) -> ExitCode {
        self.config.log_startup_info();

        let runtime = match tokio::runtime::Runtime::new() {
            Ok(runtime) => runtime,
            Err(e) => {
                eprintln!("Failed to start async runtime: {e}");
                return ExitCode::FAILURE;
            }
        };

        let result = runtime.block_on(run_pipelines(
            &Mergeable::metrics(&self.config).address,
            Mergeable::global(&self.config),
            C::COMPONENT_NAME,
            |context| self.config.create_pipelines(context),
        ));

        match result {
            Ok(0) => ExitCode::SUCCESS,
            Ok(failures) => {
                eprintln!("{failures} {}(s) failed", C::COMPONENT_NAME);
                ExitCode::FAILURE
            }
            Err(e) => {
                eprintln!("{} failed: {e}", C::COMPONENT_NAME);
                ExitCode::FAILURE
            }
        }
    }
}
