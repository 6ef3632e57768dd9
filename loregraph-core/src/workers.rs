//! Concurrent ingestion of several batches into one world.
//!
//! Each batch runs on the blocking pool, at most `workers` at a time. Once
//! every batch is in, a final resolution pass picks up references whose
//! targets arrived in a later batch.

use crate::batch::ExtractionBatch;
use crate::engine::Engine;
use crate::error::Result;
use crate::id::Scope;
use crate::report::MergeReport;
use crate::resolver::ResolutionSummary;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{info, info_span, warn, Instrument};

/// What a run produced.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    /// Reports of the batches that ran, in submission order.
    pub batches: Vec<MergeReport>,
    /// Positions of batches skipped because the run was cancelled.
    pub skipped: Vec<usize>,
    /// Positions of batches whose worker was aborted before it reported.
    pub aborted: Vec<usize>,
    /// The barrier pass; `None` when the run was cancelled.
    pub final_pass: Option<ResolutionSummary>,
    pub cancelled: bool,
}

impl RunReport {
    pub fn created(&self) -> usize {
        self.batches.iter().map(|b| b.created.len()).sum()
    }

    pub fn failed(&self) -> impl Iterator<Item = &MergeReport> {
        self.batches.iter().filter(|b| b.is_failed())
    }
}

/// Ingests a set of batches concurrently into one scope.
#[derive(Debug, Clone)]
pub struct IngestRun {
    engine: Arc<Engine>,
    scope: Scope,
}

impl IngestRun {
    pub fn new(engine: Arc<Engine>, scope: Scope) -> Self {
        Self { engine, scope }
    }

    /// Start the run on the current tokio runtime.
    pub fn spawn(self, batches: Vec<ExtractionBatch>) -> RunHandle {
        let (cancel, cancelled) = watch::channel(false);
        let span = info_span!("ingest_run", scope = %self.scope, batches = batches.len());
        let task = tokio::spawn(self.run(batches, cancelled).instrument(span));
        RunHandle { cancel, task }
    }

    async fn run(self, batches: Vec<ExtractionBatch>, cancelled: watch::Receiver<bool>) -> Result<RunReport> {
        let permits = Arc::new(Semaphore::new(self.engine.config().workers));
        let mut tasks = JoinSet::new();

        for (index, batch) in batches.into_iter().enumerate() {
            let engine = Arc::clone(&self.engine);
            let scope = self.scope.clone();
            let permits = Arc::clone(&permits);
            let cancelled = cancelled.clone();
            tasks.spawn(async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    return (index, None);
                };
                if *cancelled.borrow() {
                    return (index, None);
                }
                let report = tokio::task::spawn_blocking(move || engine.ingest(&scope, &batch)).await;
                (index, Some(report))
            });
        }

        let mut tally = Tally::new(tasks.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, Some(Ok(report)))) => tally.finished(index, report),
                Ok((index, None)) => tally.skipped(index),
                Ok((_, Some(Err(err)))) | Err(err) => {
                    if err.is_panic() {
                        std::panic::resume_unwind(err.into_panic());
                    }
                    warn!(error = %err, "ingest worker did not finish");
                }
            }
        }
        let (finished, skipped, aborted) = tally.into_parts();
        if !aborted.is_empty() {
            warn!(?aborted, "batches lost with their workers");
        }

        let was_cancelled = *cancelled.borrow();
        let final_pass = if was_cancelled {
            info!(skipped = skipped.len(), "run cancelled, skipping final resolution");
            None
        } else {
            let engine = Arc::clone(&self.engine);
            let scope = self.scope.clone();
            match tokio::task::spawn_blocking(move || engine.finalize_resolution(&scope)).await {
                Ok(summary) => Some(summary?),
                Err(err) => std::panic::resume_unwind(err.into_panic()),
            }
        };

        let report = RunReport {
            batches: finished,
            skipped,
            aborted,
            final_pass,
            cancelled: was_cancelled,
        };
        info!(
            batches = report.batches.len(),
            created = report.created(),
            failed = report.failed().count(),
            "run finished"
        );
        Ok(report)
    }
}

/// Batch outcomes keyed by submission position.
///
/// A position that never reports, because its worker was aborted, ends up
/// in the aborted list.
struct Tally {
    outstanding: BTreeSet<usize>,
    finished: Vec<(usize, MergeReport)>,
    skipped: Vec<usize>,
}

impl Tally {
    fn new(total: usize) -> Self {
        Self {
            outstanding: (0..total).collect(),
            finished: Vec::new(),
            skipped: Vec::new(),
        }
    }

    fn finished(&mut self, index: usize, report: MergeReport) {
        self.outstanding.remove(&index);
        self.finished.push((index, report));
    }

    fn skipped(&mut self, index: usize) {
        self.outstanding.remove(&index);
        self.skipped.push(index);
    }

    /// Reports in submission order, then skipped and aborted positions.
    fn into_parts(mut self) -> (Vec<MergeReport>, Vec<usize>, Vec<usize>) {
        self.finished.sort_by_key(|(index, _)| *index);
        self.skipped.sort_unstable();
        (
            self.finished.into_iter().map(|(_, report)| report).collect(),
            self.skipped,
            self.outstanding.into_iter().collect(),
        )
    }
}

/// Handle to a running [`IngestRun`].
#[derive(Debug)]
pub struct RunHandle {
    cancel: watch::Sender<bool>,
    task: JoinHandle<Result<RunReport>>,
}

impl RunHandle {
    /// Stop batches that have not started yet and skip the final pass.
    ///
    /// Batches already writing finish their transaction.
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    /// Wait for the run to finish.
    pub async fn join(self) -> Result<RunReport> {
        match self.task.await {
            Ok(report) => report,
            Err(err) => std::panic::resume_unwind(err.into_panic()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tally_keeps_positions() {
        let mut tally = Tally::new(4);
        tally.finished(2, MergeReport::default());
        tally.skipped(3);
        tally.finished(0, MergeReport::default());
        // Position 1 never reports.

        let (finished, skipped, aborted) = tally.into_parts();
        assert_eq!(finished.len(), 2);
        assert_eq!(skipped, vec![3]);
        assert_eq!(aborted, vec![1]);
    }
}
