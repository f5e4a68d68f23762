//! Scheduled sweep: catch up, backfill and advance retag jobs for every
//! enabled workspace.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::automation::model::{RunSource, RunSummary};
use crate::automation::orchestrator::{Orchestrator, RunRequest};
use crate::automation::settings::{BackfillState, HistoricalPolicy};
use crate::error::DatabaseError;
use crate::retag::{RetagJob, RetagService};

/// What one sweep did.
#[derive(Debug, Default)]
pub struct SweepReport {
    pub workspaces: usize,
    pub runs: Vec<RunSummary>,
    pub retag_jobs: Vec<RetagJob>,
    /// Workspace-level failures, already logged.
    pub failures: u32,
}

pub struct Sweeper {
    orchestrator: Arc<Orchestrator>,
    retag: Arc<RetagService>,
}

impl Sweeper {
    pub fn new(orchestrator: Arc<Orchestrator>, retag: Arc<RetagService>) -> Self {
        Self {
            orchestrator,
            retag,
        }
    }

    /// One pass over all enabled workspaces. A failing workspace never stops
    /// the others.
    pub async fn sweep_once(&self) -> Result<SweepReport, DatabaseError> {
        let workspaces = self.orchestrator.settings().enabled_workspaces().await?;
        let mut report = SweepReport {
            workspaces: workspaces.len(),
            ..SweepReport::default()
        };

        for workspace_id in &workspaces {
            match self
                .orchestrator
                .run(RunRequest::new(workspace_id.as_str(), RunSource::Catchup))
                .await
            {
                Ok(summary) => report.runs.push(summary),
                Err(e) => {
                    warn!(workspace = %workspace_id, error = %e, "Catchup run failed");
                    report.failures += 1;
                }
            }

            match self.orchestrator.settings().get(workspace_id).await {
                Ok(settings)
                    if settings.historical_policy == HistoricalPolicy::AutoCatchup
                        && settings.backfill_state != BackfillState::Completed =>
                {
                    match self
                        .orchestrator
                        .run(RunRequest::new(workspace_id.as_str(), RunSource::Backfill))
                        .await
                    {
                        Ok(summary) => report.runs.push(summary),
                        Err(e) => {
                            warn!(workspace = %workspace_id, error = %e, "Backfill run failed");
                            report.failures += 1;
                        }
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(workspace = %workspace_id, error = %e, "Failed to load settings");
                    report.failures += 1;
                }
            }

            match self.retag.step_active(workspace_id).await {
                Ok(jobs) => report.retag_jobs.extend(jobs),
                Err(e) => {
                    warn!(workspace = %workspace_id, error = %e, "Retag step failed");
                    report.failures += 1;
                }
            }
        }

        info!(
            workspaces = report.workspaces,
            runs = report.runs.len(),
            retag_jobs = report.retag_jobs.len(),
            failures = report.failures,
            "Sweep finished"
        );
        Ok(report)
    }
}

/// Spawn the periodic sweep. The first tick fires after one full interval.
pub fn spawn_sweep_ticker(sweeper: Arc<Sweeper>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // Skip immediate first tick
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if let Err(e) = sweeper.sweep_once().await {
                warn!(error = %e, "Sweep failed");
            }
        }
    })
}
