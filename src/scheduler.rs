//! Periodic checklist scheduler: claims due and stuck checklists and emits one root
//! job per claimed run.

use std::sync::Arc;

use crate::clock::Clock;
use crate::config::{RunSettings, SettingsSource};
use crate::error::Result;
use crate::queue::{OutboundMessage, Publisher};
use crate::state_machine::Job;
use crate::store::{Checklist, ChecklistPatch, ChecklistStore};

/// Outcome of one scheduling pass.
#[derive(Debug, Default)]
pub struct PassReport {
    pub due: usize,
    pub stuck: usize,
    /// Selected, but another scheduler claimed them first or the patch failed.
    pub skipped: usize,
    /// Root jobs published by this pass.
    pub jobs: Vec<Job>,
}

pub struct ChecklistScheduler {
    checklists: Arc<dyn ChecklistStore>,
    settings: Arc<dyn SettingsSource>,
    publisher: Publisher,
    clock: Arc<dyn Clock>,
    reschedule_timeout: i64,
    fallback: RunSettings,
}

impl ChecklistScheduler {
    pub fn new(
        checklists: Arc<dyn ChecklistStore>,
        settings: Arc<dyn SettingsSource>,
        publisher: Publisher,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            checklists,
            settings,
            publisher,
            clock,
            reschedule_timeout: 86_400,
            fallback: RunSettings::default(),
        }
    }

    /// Seconds after which an unfinished run is started again.
    pub fn with_reschedule_timeout(mut self, secs: i64) -> Self {
        self.reschedule_timeout = secs;
        self
    }

    /// Settings used when the settings source fails.
    pub fn with_fallback_settings(mut self, settings: RunSettings) -> Self {
        self.fallback = settings;
        self
    }

    /// Claims every due or stuck checklist and publishes their root jobs as one batch.
    pub async fn run_pass(&self) -> Result<PassReport> {
        let now = self.clock.now();
        let mut report = PassReport::default();

        for checklist in self.checklists.list().await? {
            if checklist.is_due(now) {
                report.due += 1;
            } else if checklist.is_stuck(now, self.reschedule_timeout) {
                tracing::warn!(
                    checklist_id = %checklist.id,
                    organization_id = %checklist.organization_id,
                    last_run = checklist.last_run,
                    "checklist run did not finish, rescheduling"
                );
                report.stuck += 1;
            } else {
                continue;
            }

            match self.claim(&checklist, now).await {
                Some(job) => report.jobs.push(job),
                None => report.skipped += 1,
            }
        }

        let batch: Vec<_> = report.jobs.iter().cloned().map(OutboundMessage::new).collect();
        self.publisher.publish(&batch).await?;

        tracing::info!(
            due = report.due,
            stuck = report.stuck,
            skipped = report.skipped,
            published = report.jobs.len(),
            "scheduling pass done"
        );
        Ok(report)
    }

    async fn claim(&self, checklist: &Checklist, now: i64) -> Option<Job> {
        let settings = match self.settings.run_settings(&checklist.organization_id).await {
            Ok(settings) => settings,
            Err(e) => {
                tracing::warn!(
                    organization_id = %checklist.organization_id,
                    error = %e,
                    "settings unavailable, using defaults"
                );
                self.fallback.clone()
            }
        };

        let patch = ChecklistPatch::claim(checklist.last_run, now, settings.run_period);
        match self.checklists.patch(&checklist.id, &patch).await {
            Ok(true) => Some(Job::root(
                checklist.organization_id.clone(),
                checklist.id.clone(),
                now,
                &settings,
            )),
            Ok(false) => {
                tracing::debug!(checklist_id = %checklist.id, "already claimed");
                None
            }
            Err(e) => {
                tracing::error!(checklist_id = %checklist.id, error = %e, "failed to claim checklist");
                None
            }
        }
    }
}
