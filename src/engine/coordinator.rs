//! Two-leg execution coordinator.
//!
//! Runs a batch of candidates on a per-batch [`WorkerPool`]. A candidate
//! whose event saw a placement within the minimum interval is skipped
//! whole. Otherwise the legs follow the sites' rolling order:
//! - equal priority: both legs run concurrently
//! - otherwise the lower value goes first, and the second leg only runs if
//!   the first was placed
//!
//! After both legs resolve the placement time is recorded, the candidate is
//! marked consumed, and a merged record is persisted if either leg reached
//! the placement call. Candidates cut off by the batch deadline are marked
//! consumed too and persisted with both legs failed.

use chrono::Utc;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::executor::LegExecutor;
use super::pool::{pool_size, WorkerPool};
use crate::config::AppConfig;
use crate::markers::PlacementMarkers;
use crate::store::HistoryStore;
use crate::types::{BetCandidate, LegOutcome, LegResult, LegSide, SkipReason, Stage, TwoLegBetRecord};

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// Where a candidate got to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CandidateState {
    Pending,
    LegsDispatched,
    /// Both legs resolved; nothing needed persisting.
    LegsResolved,
    Persisted,
    /// Executed by an earlier batch.
    AlreadyConsumed,
    /// Still running at the batch deadline, or the worker died. Both legs
    /// count as failed.
    TimedOut,
    /// Legs resolved but the record could not be written.
    Failed,
}

#[derive(Debug, Clone)]
pub struct CandidateReport {
    pub candidate_id: String,
    pub state: CandidateState,
    pub leg_a: Option<LegResult>,
    pub leg_b: Option<LegResult>,
    pub record: Option<TwoLegBetRecord>,
}

impl CandidateReport {
    fn new(candidate_id: &str, state: CandidateState) -> Self {
        Self {
            candidate_id: candidate_id.to_string(),
            state,
            leg_a: None,
            leg_b: None,
            record: None,
        }
    }

    pub fn leg(&self, side: LegSide) -> Option<&LegResult> {
        match side {
            LegSide::A => self.leg_a.as_ref(),
            LegSide::B => self.leg_b.as_ref(),
        }
    }

    fn legs(&self) -> impl Iterator<Item = &LegResult> {
        self.leg_a.iter().chain(self.leg_b.iter())
    }
}

/// Summary of one `run_batch` call, in submission order.
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub candidates: Vec<CandidateReport>,
    pub timed_out: bool,
}

impl BatchReport {
    pub fn count(&self, state: CandidateState) -> usize {
        self.candidates.iter().filter(|c| c.state == state).count()
    }

    pub fn placed_legs(&self) -> usize {
        self.candidates
            .iter()
            .flat_map(CandidateReport::legs)
            .filter(|l| l.outcome.is_placed())
            .count()
    }

    /// Legs that talked to the site and were not placed, including the
    /// legs of timed-out candidates.
    pub fn failed_legs(&self) -> usize {
        self.candidates
            .iter()
            .flat_map(CandidateReport::legs)
            .filter(|l| !l.outcome.is_placed() && !l.outcome.is_skipped())
            .count()
    }

    pub fn skipped_legs(&self) -> usize {
        self.candidates
            .iter()
            .flat_map(CandidateReport::legs)
            .filter(|l| l.outcome.is_skipped())
            .count()
    }

    /// Candidates with exactly one placed leg: open exposure to look at.
    pub fn one_sided(&self) -> Vec<&CandidateReport> {
        self.candidates
            .iter()
            .filter(|c| c.legs().filter(|l| l.outcome.is_placed()).count() == 1)
            .collect()
    }
}

impl fmt::Display for BatchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} candidates: {} persisted, {} resolved, {} consumed earlier, {} timed out, {} failed; legs placed={} failed={} skipped={}",
            self.candidates.len(),
            self.count(CandidateState::Persisted),
            self.count(CandidateState::LegsResolved),
            self.count(CandidateState::AlreadyConsumed),
            self.count(CandidateState::TimedOut),
            self.count(CandidateState::Failed),
            self.placed_legs(),
            self.failed_legs(),
            self.skipped_legs(),
        )
    }
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct BatchSettings {
    pub parallelism: usize,
    pub pool_cap: usize,
    pub backlog: usize,
    pub timeout: Duration,
}

impl BatchSettings {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            parallelism: std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
            pool_cap: cfg.engine.pool_cap,
            backlog: cfg.engine.pool_backlog,
            timeout: cfg.engine.batch_timeout(),
        }
    }
}

#[derive(Clone)]
pub struct Coordinator {
    executor: Arc<LegExecutor>,
    markers: Arc<PlacementMarkers>,
    history: Arc<dyn HistoryStore>,
    priorities: Arc<HashMap<String, u32>>,
    settings: BatchSettings,
}

impl Coordinator {
    pub fn new(
        executor: Arc<LegExecutor>,
        markers: Arc<PlacementMarkers>,
        history: Arc<dyn HistoryStore>,
        priorities: HashMap<String, u32>,
        settings: BatchSettings,
    ) -> Self {
        Self {
            executor,
            markers,
            history,
            priorities: Arc::new(priorities),
            settings,
        }
    }

    /// Rolling-order value of a site. Unlisted sites sort first.
    pub fn priority(&self, site_id: &str) -> u32 {
        self.priorities.get(site_id).copied().unwrap_or(0)
    }

    /// Execute every candidate and wait for the batch, bounded by the batch
    /// timeout. Candidates still running at the deadline are reported as
    /// timed out and can never run again.
    pub async fn run_batch(&self, candidates: Vec<BetCandidate>) -> BatchReport {
        if candidates.is_empty() {
            return BatchReport::default();
        }

        let size = pool_size(candidates.len(), self.settings.parallelism, self.settings.pool_cap);
        info!(candidates = candidates.len(), core = size.core, max = size.max, "Executing batch");

        let mut reports: Vec<CandidateReport> = candidates
            .iter()
            .map(|c| CandidateReport::new(&c.id, CandidateState::Pending))
            .collect();

        let mut pool = WorkerPool::new(size, self.settings.backlog);
        for (index, candidate) in candidates.iter().enumerate() {
            let this = self.clone();
            let candidate = candidate.clone();
            pool.submit(index, async move { this.run_candidate(candidate).await }).await;
        }

        let outcome = pool.join(self.settings.timeout).await;
        for (index, report) in outcome.completed {
            reports[index] = report;
        }
        for index in outcome.unfinished {
            warn!(candidate = %candidates[index].id, "Candidate did not finish, counting as failed");
            reports[index] = self.settle_unfinished(&candidates[index]).await;
        }

        let report = BatchReport {
            candidates: reports,
            timed_out: outcome.timed_out,
        };
        info!(summary = %report, "Batch complete");
        for c in report.one_sided() {
            warn!(candidate = %c.candidate_id, "Only one leg placed");
        }
        report
    }

    /// Drive one candidate to a final state.
    pub async fn run_candidate(&self, candidate: BetCandidate) -> CandidateReport {
        let user = candidate.user_id.as_str();
        if self.markers.is_consumed(user, &candidate.id).await {
            info!(candidate = %candidate.id, "Candidate already executed, skipping");
            return CandidateReport::new(&candidate.id, CandidateState::AlreadyConsumed);
        }

        let (leg_a, leg_b) = if self.too_soon(&candidate).await {
            info!(candidate = %candidate.id, "Minimum placement interval not elapsed, skipping candidate");
            let skip = |site: &str| {
                LegResult::without_account(site, LegOutcome::Skipped(SkipReason::IntervalNotElapsed))
            };
            (skip(&candidate.leg_a.site_id), skip(&candidate.leg_b.site_id))
        } else {
            debug!(candidate = %candidate.id, state = ?CandidateState::LegsDispatched, "Dispatching legs");
            self.dispatch(&candidate).await
        };
        let mut report = CandidateReport::new(&candidate.id, CandidateState::LegsResolved);

        self.record_placements(&candidate, [&leg_a, &leg_b]).await;
        if let Err(e) = self.markers.mark_consumed(user, &candidate.id).await {
            warn!(candidate = %candidate.id, error = %e, "Failed to mark candidate consumed");
        }

        if leg_a.outcome.attempted() || leg_b.outcome.attempted() {
            let record = TwoLegBetRecord::new(&candidate, &leg_a, &leg_b);
            match self.history.save(&record).await {
                Ok(()) => {
                    info!(record = %record, "Bet record saved");
                    report.state = CandidateState::Persisted;
                }
                Err(e) => {
                    error!(candidate = %candidate.id, error = %e, "Failed to persist bet record");
                    report.state = CandidateState::Failed;
                }
            }
            report.record = Some(record);
        }

        report.leg_a = Some(leg_a);
        report.leg_b = Some(leg_b);
        report
    }

    /// Whether any of the candidate's events saw a placement within the
    /// minimum interval.
    async fn too_soon(&self, candidate: &BetCandidate) -> bool {
        let interval = self.executor.settings().min_interval;
        let now = Utc::now();
        for event in events(candidate) {
            if self.markers.too_soon(&candidate.user_id, event, interval, now).await {
                return true;
            }
        }
        false
    }

    /// Stamp the latest placement per event once both legs have resolved,
    /// so a candidate's own first leg never gates its partner.
    async fn record_placements(&self, candidate: &BetCandidate, legs: [&LegResult; 2]) {
        for (leg, offer) in legs.into_iter().zip([&candidate.leg_a, &candidate.leg_b]) {
            let LegOutcome::Placed(placement) = &leg.outcome else {
                continue;
            };
            if let Err(e) = self
                .markers
                .record_placement(&candidate.user_id, &offer.event_id, placement.placed_at)
                .await
            {
                warn!(event = %offer.event_id, error = %e, "Failed to record placement time");
            }
        }
    }

    /// Close out a candidate cut off at the batch deadline. A leg may have
    /// reached the site before the abort, so the candidate is consumed and
    /// recorded with both legs failed rather than left to run again.
    async fn settle_unfinished(&self, candidate: &BetCandidate) -> CandidateReport {
        let user = candidate.user_id.as_str();
        if let Err(e) = self.markers.mark_consumed(user, &candidate.id).await {
            error!(candidate = %candidate.id, error = %e, "Failed to mark timed-out candidate consumed");
        }

        let failed = |site: &str| {
            LegResult::without_account(
                site,
                LegOutcome::TransportFailed {
                    stage: Stage::Placement,
                    reason: "batch timed out".to_string(),
                },
            )
        };
        let (leg_a, leg_b) = (failed(&candidate.leg_a.site_id), failed(&candidate.leg_b.site_id));
        let record = TwoLegBetRecord::new(candidate, &leg_a, &leg_b);
        if let Err(e) = self.history.save(&record).await {
            error!(candidate = %candidate.id, error = %e, "Failed to persist timed-out bet record");
        }

        let mut report = CandidateReport::new(&candidate.id, CandidateState::TimedOut);
        report.leg_a = Some(leg_a);
        report.leg_b = Some(leg_b);
        report.record = Some(record);
        report
    }

    /// Run both legs in rolling order. Returns (A, B).
    async fn dispatch(&self, candidate: &BetCandidate) -> (LegResult, LegResult) {
        let user = candidate.user_id.as_str();
        let (prio_a, prio_b) = (
            self.priority(&candidate.leg_a.site_id),
            self.priority(&candidate.leg_b.site_id),
        );

        if prio_a == prio_b {
            return tokio::join!(
                self.executor.execute(user, &candidate.leg_a),
                self.executor.execute(user, &candidate.leg_b),
            );
        }

        let first = if prio_a < prio_b { LegSide::A } else { LegSide::B };
        let second = first.other();
        let first_result = self.executor.execute(user, candidate.leg(first)).await;

        let second_result = if first_result.outcome.is_placed() {
            self.executor.execute(user, candidate.leg(second)).await
        } else {
            info!(
                candidate = %candidate.id,
                first = %first_result.site_id,
                outcome = %first_result.outcome,
                "First leg not placed, holding second leg"
            );
            LegResult::without_account(
                &candidate.leg(second).site_id,
                LegOutcome::Skipped(SkipReason::PartnerNotPlaced),
            )
        };

        match first {
            LegSide::A => (first_result, second_result),
            LegSide::B => (second_result, first_result),
        }
    }
}

fn events(candidate: &BetCandidate) -> BTreeSet<&str> {
    [candidate.leg_a.event_id.as_str(), candidate.leg_b.event_id.as_str()]
        .into_iter()
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
