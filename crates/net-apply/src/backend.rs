//! Configuration backend seam

use std::time::Duration;

use async_trait::async_trait;
use log::info;

use safenet_config::EngineSettings;
use safenet_core::Result;

use crate::command::{describe, CommandRunner};

/// The host mechanism that tests and persists the staged configuration
#[async_trait]
pub trait ConfigBackend: Send + Sync {
    /// Apply the staged configuration, reverting automatically after
    /// `timeout_seconds` unless it is accepted. Returns `Ok` when the
    /// candidate was accepted and the host stayed reachable, an error when
    /// it was rejected.
    async fn try_candidate(&self, timeout_seconds: u64) -> Result<()>;

    /// Make the staged configuration durable
    async fn apply(&self) -> Result<()>;
}

/// Netplan-driven backend
#[derive(Debug, Clone)]
pub struct NetplanBackend {
    runner: CommandRunner,
    netplan_path: String,
}

impl NetplanBackend {
    pub fn new(runner: CommandRunner) -> Self {
        Self {
            runner,
            netplan_path: "netplan".to_string(),
        }
    }

    pub fn from_settings(settings: &EngineSettings) -> Self {
        Self {
            runner: CommandRunner::new(Duration::from_secs(settings.command_timeout_seconds)),
            netplan_path: settings.netplan_path.clone(),
        }
    }

    pub fn try_args(timeout_seconds: u64) -> Vec<String> {
        vec!["try".to_string(), format!("--timeout={}", timeout_seconds)]
    }
}

#[async_trait]
impl ConfigBackend for NetplanBackend {
    async fn try_candidate(&self, timeout_seconds: u64) -> Result<()> {
        info!("Testing candidate configuration for {}s", timeout_seconds);
        let args = Self::try_args(timeout_seconds);
        // Unbounded here, the test session cancels it at its deadline
        self.runner
            .run_with_timeout(&self.netplan_path, &args, None)
            .await?
            .check(&describe(&self.netplan_path, &args))?;
        Ok(())
    }

    async fn apply(&self) -> Result<()> {
        info!("Applying configuration");
        let args = vec!["apply".to_string()];
        self.runner
            .run(&self.netplan_path, &args)
            .await?
            .check(&describe(&self.netplan_path, &args))?;
        Ok(())
    }
}
