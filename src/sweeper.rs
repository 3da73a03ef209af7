//! Startup sweep for sandbox environments left behind by earlier processes.
//!
//! Everything here is best effort: a runtime that cannot be listed skips the
//! sweep, and an environment that cannot be removed is logged and counted.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::runtime::{EnvironmentInfo, SandboxRuntime};

/// Outcome of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Ids of environments that were removed.
    pub removed: Vec<String>,
    /// Ids of environments that matched but could not be removed.
    pub failed: Vec<String>,
}

/// Remove managed environments whose image matches one of `image_prefixes`
/// and that are at least `ttl` old. An empty prefix list matches every image,
/// as does a runtime that does not filter by image.
pub async fn sweep_stale_environments(
    runtime: &dyn SandboxRuntime,
    ttl: Duration,
    image_prefixes: &[String],
) -> SweepReport {
    let mut report = SweepReport::default();

    let environments = match runtime.list_environments().await {
        Ok(environments) => environments,
        Err(e) => {
            warn!(runtime = runtime.name(), error = %e, "Unable to list sandbox environments, skipping sweep");
            return report;
        }
    };

    let image_prefixes = if runtime.filters_by_image() {
        image_prefixes
    } else {
        &[]
    };

    let now = Utc::now();
    for env in environments
        .iter()
        .filter(|env| is_stale(env, now, ttl, image_prefixes))
    {
        match runtime.remove_environment(&env.id).await {
            Ok(()) => {
                debug!(id = %env.id, name = %env.name, image = %env.image, "Removed stale sandbox environment");
                report.removed.push(env.id.clone());
            }
            Err(e) => {
                warn!(id = %env.id, name = %env.name, error = %e, "Failed to remove stale sandbox environment");
                report.failed.push(env.id.clone());
            }
        }
    }

    if report.removed.is_empty() && report.failed.is_empty() {
        debug!(runtime = runtime.name(), "No stale sandbox environments");
    } else {
        info!(
            runtime = runtime.name(),
            removed = report.removed.len(),
            failed = report.failed.len(),
            "Stale sandbox sweep finished"
        );
    }
    report
}

fn is_stale(env: &EnvironmentInfo, now: DateTime<Utc>, ttl: Duration, image_prefixes: &[String]) -> bool {
    // registries sometimes prefix the image name, so match anywhere
    let image_matches =
        image_prefixes.is_empty() || image_prefixes.iter().any(|p| env.image.contains(p.as_str()));
    let age = (now - env.created_at).to_std().unwrap_or_default();
    image_matches && age >= ttl
}
