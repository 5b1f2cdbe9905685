//! Routing table access and route preservation

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use safenet_config::EngineSettings;
use safenet_core::{ApplyError, Result, RouteEntry, RouteSnapshot};

use crate::command::{describe, CommandRunner};

/// Host routing table
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RouteTable: Send + Sync {
    /// Current routes, in table order
    async fn list_routes(&self) -> Result<Vec<RouteEntry>>;

    /// Insert a single route. Adding a route that already exists succeeds.
    async fn add_route(&self, route: &RouteEntry) -> Result<()>;
}

/// Routing table driven through iproute2
#[derive(Debug, Clone)]
pub struct IpRouteTable {
    runner: CommandRunner,
    ip_path: String,
}

impl IpRouteTable {
    pub fn new(runner: CommandRunner) -> Self {
        Self {
            runner,
            ip_path: "ip".to_string(),
        }
    }

    pub fn from_settings(settings: &EngineSettings) -> Self {
        Self {
            runner: CommandRunner::new(Duration::from_secs(settings.command_timeout_seconds)),
            ip_path: settings.ip_path.clone(),
        }
    }

    async fn show(&self, ipv6: bool) -> Result<Vec<RouteEntry>> {
        let mut args = Vec::new();
        if ipv6 {
            args.push("-6".to_string());
        }
        args.push("route".to_string());
        args.push("show".to_string());

        let output = self
            .runner
            .run(&self.ip_path, &args)
            .await?
            .check(&describe(&self.ip_path, &args))?;
        Ok(parse_routes(&output.stdout, ipv6))
    }
}

/// Parse `ip route show` output, or `ip -6 route show` output when `ipv6`
/// is set. Non-unicast lines are skipped; unparseable lines are warned and
/// skipped.
pub fn parse_routes(output: &str, ipv6: bool) -> Vec<RouteEntry> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !RouteEntry::is_special(line))
        .filter_map(|line| {
            let parsed = if ipv6 {
                RouteEntry::parse_ipv6(line)
            } else {
                RouteEntry::parse(line)
            };
            match parsed {
                Ok(route) => Some(route),
                Err(e) => {
                    warn!("Skipping route line: {}", e);
                    None
                }
            }
        })
        .collect()
}

#[async_trait]
impl RouteTable for IpRouteTable {
    async fn list_routes(&self) -> Result<Vec<RouteEntry>> {
        let mut routes = self.show(false).await?;
        match self.show(true).await {
            Ok(v6) => routes.extend(v6),
            Err(e) => warn!("Could not list IPv6 routes: {}", e),
        }
        Ok(routes)
    }

    async fn add_route(&self, route: &RouteEntry) -> Result<()> {
        let args = route.add_args();
        let output = self.runner.run(&self.ip_path, &args).await?;
        if !output.success && output.stderr.contains("File exists") {
            debug!("Route {} already present", route);
            return Ok(());
        }
        output.check(&describe(&self.ip_path, &args))?;
        Ok(())
    }
}

/// A route that could not be put back
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteFailure {
    pub route: RouteEntry,
    pub reason: String,
}

/// Result of restoring a snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreReport {
    /// Routes re-added
    pub restored: Vec<RouteEntry>,
    /// Snapshot routes that were still present
    pub already_present: usize,
    /// Routes that could not be re-added
    pub failed: Vec<RouteFailure>,
}

impl RestoreReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    /// Advisory error for a partially failed restoration
    pub fn partial_failure(&self) -> Option<ApplyError> {
        if self.failed.is_empty() {
            None
        } else {
            Some(ApplyError::RouteRestorationPartialFailure {
                failed: self.failed.len(),
            })
        }
    }
}

/// Snapshots routes before a risky change and puts back the ones it lost
#[derive(Clone)]
pub struct RouteGuardian {
    table: Arc<dyn RouteTable>,
}

impl RouteGuardian {
    pub fn new(table: Arc<dyn RouteTable>) -> Self {
        Self { table }
    }

    /// Copy of the live routing table owned by `attempt_id`
    pub async fn snapshot(&self, attempt_id: Uuid) -> Result<RouteSnapshot> {
        let routes = self.table.list_routes().await?;
        info!(
            "Captured {} route(s) for attempt {}",
            routes.len(),
            attempt_id
        );
        Ok(RouteSnapshot::new(attempt_id, routes))
    }

    /// Re-add every snapshot route missing from the live table.
    ///
    /// Each route is restored independently; failures are logged and
    /// reported, never returned as an error.
    pub async fn restore_missing(&self, snapshot: &RouteSnapshot) -> RestoreReport {
        let current = match self.table.list_routes().await {
            Ok(current) => current,
            Err(e) => {
                warn!(
                    "Could not list current routes, re-adding all preserved routes: {}",
                    e
                );
                Vec::new()
            }
        };

        let missing = snapshot.missing_from(&current);
        let candidates = snapshot.entries().iter().filter(|r| !r.is_kernel()).count();
        let mut report = RestoreReport {
            already_present: candidates - missing.len(),
            ..RestoreReport::default()
        };

        for route in missing {
            match self.table.add_route(route).await {
                Ok(()) => {
                    info!("Restored route {}", route);
                    report.restored.push(route.clone());
                }
                Err(e) => {
                    warn!("Failed to restore route {}: {}", route, e);
                    report.failed.push(RouteFailure {
                        route: route.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        if let Some(partial) = report.partial_failure() {
            warn!("Route restoration for attempt {}: {}", snapshot.attempt_id(), partial);
        } else {
            debug!(
                "Route restoration for attempt {}: {} restored, {} already present",
                snapshot.attempt_id(),
                report.restored.len(),
                report.already_present
            );
        }
        report
    }
}
