#![allow(clippy::missing_errors_doc)]

//! Reconciliation engine: one poll cycle from delta fetch to postbacks.
//!
//! Per subscriber the trial lifecycle is `absent -> pending -> {confirmed,
//! cancelled}`. Cancellation removes the pending record at any time;
//! confirmation requires the grace period to elapse AND the confirmation
//! postback to succeed, in that order. All work is single-threaded and
//! run-to-completion; the external scheduler provides the cadence.

mod notify;
mod source;

pub use notify::{HttpPostbackClient, PostbackSink};
pub use source::{ClickHouseSource, EventSource, WarehouseConfig};

use std::collections::BTreeSet;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use time::OffsetDateTime;
use tracing::{debug, error, info, warn};
use trialgate_core::{
    classify, now_utc, plan_delta, ClassifiedBatch, ConversionStatus, DeltaPlan, PendingTrial,
};
use trialgate_store_sqlite::{TrialLedger, WatermarkFile};

/// Counters for one completed cycle, logged at the end of each run.
#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize)]
pub struct CycleReport {
    pub watermark_before: u64,
    pub current_total: u64,
    pub fetched: usize,

    pub installs_sent: usize,
    pub installs_failed: usize,
    pub activations_sent: usize,
    pub activations_failed: usize,

    pub trials_inserted: usize,
    pub trials_duplicate: usize,
    pub trials_insert_failed: usize,
    pub cancellations_applied: usize,
    pub cancellations_unmatched: usize,
    pub cancelled_in_batch: usize,

    pub confirmations_sent: usize,
    pub confirmations_failed: usize,

    pub watermark_reset: bool,
    pub watermark_save_failed: bool,
}

impl CycleReport {
    fn new(watermark_before: u64, current_total: u64) -> Self {
        Self {
            watermark_before,
            current_total,
            ..Self::default()
        }
    }
}

/// Orchestrates one cycle: delta plan, fetch, classify, reconcile the
/// ledger, persist the watermark, send postbacks, confirm matured trials.
pub struct Pipeline<'a, S, N> {
    source: &'a S,
    sink: &'a N,
    ledger: &'a TrialLedger,
    watermark: &'a WatermarkFile,
    grace_period: Duration,
}

impl<'a, S: EventSource, N: PostbackSink> Pipeline<'a, S, N> {
    pub fn new(
        source: &'a S,
        sink: &'a N,
        ledger: &'a TrialLedger,
        watermark: &'a WatermarkFile,
        grace_period: Duration,
    ) -> Self {
        Self {
            source,
            sink,
            ledger,
            watermark,
            grace_period,
        }
    }

    /// Runs one cycle against the current wall clock.
    pub fn run_cycle(&self) -> Result<CycleReport> {
        self.run_cycle_at(now_utc())
    }

    /// Runs one cycle as of `now`. Split out so tests can drive the clock.
    pub fn run_cycle_at(&self, now: OffsetDateTime) -> Result<CycleReport> {
        let watermark = self.watermark.load().context("failed to load watermark")?;
        let current_total = self
            .source
            .count_events()
            .context("failed to count warehouse events")?;
        let mut report = CycleReport::new(watermark, current_total);

        match plan_delta(watermark, current_total) {
            DeltaPlan::NoNewRows => {
                debug!(watermark, "no new warehouse rows");
                Ok(report)
            }
            DeltaPlan::Inconsistent {
                watermark,
                current_total,
            } => {
                warn!(
                    watermark,
                    current_total, "warehouse row count regressed; resetting watermark"
                );
                self.watermark
                    .save(current_total)
                    .context("failed to persist reset watermark")?;
                report.watermark_reset = true;
                Ok(report)
            }
            DeltaPlan::Fetch { limit } => {
                // A fetch failure aborts the whole cycle with the watermark
                // untouched; there is no partial or implied fetch.
                let events = self
                    .source
                    .fetch_latest(limit)
                    .context("failed to fetch warehouse events")?;
                report.fetched = events.len();
                info!(limit, fetched = report.fetched, "fetched new events");

                let batch = classify(events);
                self.reconcile(&batch, now, &mut report);

                // The watermark lands after the ledger mutations so a crash
                // between fetch and reconcile cannot advance it past a trial
                // that was never recorded. A failed save is reported and the
                // cycle continues; the next cycle re-derives the same delta
                // and the ledger operations are idempotent.
                if let Err(err) = self.watermark.save(current_total) {
                    error!("failed to persist watermark: {err:#}");
                    report.watermark_save_failed = true;
                }

                self.notify_direct(&batch, &mut report);
                self.confirm_matured(now, &mut report);
                Ok(report)
            }
        }
    }

    /// Applies the batch to the ledger. Cancellations are considered before
    /// insertions: a trial started and cancelled in the same batch is never
    /// inserted, so a same-cycle cancel always wins.
    fn reconcile(&self, batch: &ClassifiedBatch, now: OffsetDateTime, report: &mut CycleReport) {
        let cancelled_keys: BTreeSet<&str> = batch
            .trial_cancellations
            .iter()
            .map(|event| event.subscriber_id.as_str())
            .collect();

        for event in &batch.trial_cancellations {
            match self.ledger.delete_by_key(&event.subscriber_id) {
                Ok(true) => {
                    debug!(subscriber = %event.subscriber_id, "cancelled pending trial");
                    report.cancellations_applied += 1;
                }
                Ok(false) => {
                    debug!(
                        subscriber = %event.subscriber_id,
                        "cancellation without a pending trial"
                    );
                    report.cancellations_unmatched += 1;
                }
                Err(err) => {
                    error!(subscriber = %event.subscriber_id, "failed to cancel trial: {err:#}");
                }
            }
        }

        for event in &batch.trial_starts {
            if cancelled_keys.contains(event.subscriber_id.as_str()) {
                info!(
                    subscriber = %event.subscriber_id,
                    "trial started and cancelled in the same batch; not recording"
                );
                report.cancelled_in_batch += 1;
                continue;
            }

            let record = PendingTrial {
                subscriber_id: event.subscriber_id.clone(),
                event_time: event.event_time,
                event_name: event.event_name,
                inserted_at: now,
            };
            match self.ledger.insert_if_absent(&record) {
                Ok(true) => {
                    debug!(subscriber = %event.subscriber_id, "recorded pending trial");
                    report.trials_inserted += 1;
                }
                Ok(false) => {
                    warn!(
                        subscriber = %event.subscriber_id,
                        "pending trial already recorded; skipping"
                    );
                    report.trials_duplicate += 1;
                }
                Err(err) => {
                    error!(subscriber = %event.subscriber_id, "failed to record trial: {err:#}");
                    report.trials_insert_failed += 1;
                }
            }
        }
    }

    /// Sends the postbacks that need no ledger interaction: one per install
    /// and one per activation, unconditionally. A failure skips only that
    /// event.
    fn notify_direct(&self, batch: &ClassifiedBatch, report: &mut CycleReport) {
        for event in &batch.installs {
            match self
                .sink
                .notify(&event.subscriber_id, ConversionStatus::Install)
            {
                Ok(()) => report.installs_sent += 1,
                Err(err) => {
                    error!(subscriber = %event.subscriber_id, "install postback failed: {err:#}");
                    report.installs_failed += 1;
                }
            }
        }

        for event in &batch.activations {
            match self
                .sink
                .notify(&event.subscriber_id, ConversionStatus::TrialConverted)
            {
                Ok(()) => report.activations_sent += 1,
                Err(err) => {
                    error!(
                        subscriber = %event.subscriber_id,
                        "activation postback failed: {err:#}"
                    );
                    report.activations_failed += 1;
                }
            }
        }
    }

    /// Confirms trials whose grace period has elapsed. The ledger record is
    /// deleted only after the confirmation postback succeeds; a failed
    /// postback leaves the record pending for the next cycle.
    fn confirm_matured(&self, now: OffsetDateTime, report: &mut CycleReport) {
        let cutoff = now - self.grace_period;
        let matured = match self.ledger.scan_matured(cutoff) {
            Ok(matured) => matured,
            Err(err) => {
                error!("maturity scan failed: {err:#}");
                return;
            }
        };

        for trial in matured {
            match self
                .sink
                .notify(&trial.subscriber_id, ConversionStatus::TrialStarted)
            {
                Ok(()) => {
                    report.confirmations_sent += 1;
                    if let Err(err) = self.ledger.delete_by_key(&trial.subscriber_id) {
                        error!(
                            subscriber = %trial.subscriber_id,
                            "confirmed trial could not be removed, it will be re-sent next cycle: {err:#}"
                        );
                    }
                }
                Err(err) => {
                    error!(
                        subscriber = %trial.subscriber_id,
                        "confirmation postback failed, trial stays pending: {err:#}"
                    );
                    report.confirmations_failed += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::path::PathBuf;
    use trialgate_core::{parse_rfc3339_utc, Event, EventName};
    use ulid::Ulid;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err:#}"),
        }
    }

    fn must_utc(value: &str) -> OffsetDateTime {
        match parse_rfc3339_utc(value) {
            Ok(parsed) => parsed,
            Err(err) => panic!("invalid fixture timestamp: {err}"),
        }
    }

    const GRACE: Duration = Duration::from_secs(3600);

    struct MockSource {
        total: u64,
        rows: Vec<Event>,
        fail_fetch: bool,
    }

    impl EventSource for MockSource {
        fn count_events(&self) -> Result<u64> {
            Ok(self.total)
        }

        fn fetch_latest(&self, _limit: u64) -> Result<Vec<Event>> {
            if self.fail_fetch {
                return Err(anyhow::anyhow!("warehouse unreachable"));
            }
            Ok(self.rows.clone())
        }
    }

    #[derive(Default)]
    struct MockSink {
        delivered: RefCell<Vec<(String, ConversionStatus)>>,
        fail_statuses: Vec<ConversionStatus>,
    }

    impl MockSink {
        fn failing(statuses: Vec<ConversionStatus>) -> Self {
            Self {
                delivered: RefCell::new(Vec::new()),
                fail_statuses: statuses,
            }
        }

        fn sent(&self) -> Vec<(String, ConversionStatus)> {
            self.delivered.borrow().clone()
        }
    }

    impl PostbackSink for MockSink {
        fn notify(&self, subscriber_id: &str, status: ConversionStatus) -> Result<()> {
            if self.fail_statuses.contains(&status) {
                return Err(anyhow::anyhow!("tracker rejected {}", status.as_str()));
            }
            self.delivered
                .borrow_mut()
                .push((subscriber_id.to_string(), status));
            Ok(())
        }
    }

    struct Stores {
        ledger: TrialLedger,
        watermark: WatermarkFile,
        db_path: PathBuf,
        watermark_path: PathBuf,
    }

    impl Stores {
        fn new() -> Self {
            let suffix = Ulid::new();
            let db_path = std::env::temp_dir().join(format!("trialgate-engine-{suffix}.sqlite3"));
            let watermark_path =
                std::env::temp_dir().join(format!("trialgate-engine-{suffix}.json"));
            Self {
                ledger: must(TrialLedger::open(&db_path)),
                watermark: WatermarkFile::new(&watermark_path),
                db_path,
                watermark_path,
            }
        }
    }

    impl Drop for Stores {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.db_path);
            let _ = std::fs::remove_file(&self.watermark_path);
        }
    }

    fn event(name: EventName, subscriber_id: &str, event_time: OffsetDateTime) -> Event {
        Event {
            event_time,
            event_name: name,
            subscriber_id: subscriber_id.to_string(),
        }
    }

    #[test]
    fn equal_counts_end_the_cycle_without_work() {
        let stores = Stores::new();
        must(stores.watermark.save(100));
        let source = MockSource {
            total: 100,
            rows: Vec::new(),
            fail_fetch: true,
        };
        let sink = MockSink::default();
        let pipeline = Pipeline::new(&source, &sink, &stores.ledger, &stores.watermark, GRACE);

        let report = must(pipeline.run_cycle_at(must_utc("2026-08-07T12:00:00Z")));

        assert_eq!(report.fetched, 0);
        assert!(sink.sent().is_empty());
        assert_eq!(must(stores.watermark.load()), 100);
    }

    #[test]
    fn mixed_batch_notifies_inserts_and_ignores_unmatched_cancel() {
        // Watermark 100, total 103: one install, one fresh trial, one
        // cancellation with nothing pending.
        let stores = Stores::new();
        must(stores.watermark.save(100));
        let now = must_utc("2026-08-07T12:00:00Z");
        let source = MockSource {
            total: 103,
            rows: vec![
                event(EventName::Install, "A", now),
                event(EventName::TrialStarted, "B", now),
                event(EventName::TrialRenewalCancelled, "C", now),
            ],
            fail_fetch: false,
        };
        let sink = MockSink::default();
        let pipeline = Pipeline::new(&source, &sink, &stores.ledger, &stores.watermark, GRACE);

        let report = must(pipeline.run_cycle_at(now));

        assert_eq!(report.fetched, 3);
        assert_eq!(report.installs_sent, 1);
        assert_eq!(report.trials_inserted, 1);
        assert_eq!(report.cancellations_unmatched, 1);
        assert_eq!(report.cancellations_applied, 0);
        assert_eq!(report.confirmations_sent, 0);
        assert_eq!(
            sink.sent(),
            vec![("A".to_string(), ConversionStatus::Install)]
        );
        assert_eq!(must(stores.ledger.pending_count()), 1);
        assert_eq!(must(stores.watermark.load()), 103);
    }

    #[test]
    fn regressed_total_resets_the_watermark_and_processes_nothing() {
        let stores = Stores::new();
        must(stores.watermark.save(80));
        let source = MockSource {
            total: 50,
            rows: Vec::new(),
            fail_fetch: true,
        };
        let sink = MockSink::default();
        let pipeline = Pipeline::new(&source, &sink, &stores.ledger, &stores.watermark, GRACE);

        let report = must(pipeline.run_cycle_at(must_utc("2026-08-07T12:00:00Z")));

        assert!(report.watermark_reset);
        assert_eq!(report.fetched, 0);
        assert!(sink.sent().is_empty());
        assert_eq!(must(stores.watermark.load()), 50);
    }

    #[test]
    fn fetch_failure_aborts_without_advancing_the_watermark() {
        let stores = Stores::new();
        must(stores.watermark.save(10));
        let source = MockSource {
            total: 15,
            rows: Vec::new(),
            fail_fetch: true,
        };
        let sink = MockSink::default();
        let pipeline = Pipeline::new(&source, &sink, &stores.ledger, &stores.watermark, GRACE);

        assert!(pipeline
            .run_cycle_at(must_utc("2026-08-07T12:00:00Z"))
            .is_err());
        assert_eq!(must(stores.watermark.load()), 10);
        assert!(sink.sent().is_empty());
    }

    #[test]
    fn same_batch_cancel_always_wins_over_the_insert() {
        let stores = Stores::new();
        let now = must_utc("2026-08-07T12:00:00Z");
        let source = MockSource {
            total: 2,
            rows: vec![
                event(EventName::TrialStarted, "B", now),
                event(EventName::TrialRenewalCancelled, "B", now),
            ],
            fail_fetch: false,
        };
        let sink = MockSink::default();
        let pipeline = Pipeline::new(&source, &sink, &stores.ledger, &stores.watermark, GRACE);

        let report = must(pipeline.run_cycle_at(now));

        assert_eq!(report.cancelled_in_batch, 1);
        assert_eq!(report.trials_inserted, 0);
        assert_eq!(must(stores.ledger.pending_count()), 0);

        // Even well past the grace period no confirmation ever fires.
        let later_source = MockSource {
            total: 3,
            rows: vec![event(EventName::Install, "X", now)],
            fail_fetch: false,
        };
        let later = Pipeline::new(
            &later_source,
            &sink,
            &stores.ledger,
            &stores.watermark,
            GRACE,
        );
        let later_report = must(later.run_cycle_at(must_utc("2026-08-07T14:00:00Z")));
        assert_eq!(later_report.confirmations_sent, 0);
        assert!(!sink
            .sent()
            .iter()
            .any(|(_, status)| *status == ConversionStatus::TrialStarted));
    }

    #[test]
    fn cancellation_in_a_later_cycle_preempts_confirmation() {
        let stores = Stores::new();
        let started = must_utc("2026-08-07T12:00:00Z");
        let sink = MockSink::default();

        let first = MockSource {
            total: 1,
            rows: vec![event(EventName::TrialStarted, "S", started)],
            fail_fetch: false,
        };
        let pipeline = Pipeline::new(&first, &sink, &stores.ledger, &stores.watermark, GRACE);
        must(pipeline.run_cycle_at(started));
        assert_eq!(must(stores.ledger.pending_count()), 1);

        // Cancellation arrives 30 minutes in, before the grace elapses.
        let second = MockSource {
            total: 2,
            rows: vec![event(
                EventName::TrialRenewalCancelled,
                "S",
                must_utc("2026-08-07T12:30:00Z"),
            )],
            fail_fetch: false,
        };
        let pipeline = Pipeline::new(&second, &sink, &stores.ledger, &stores.watermark, GRACE);
        let report = must(pipeline.run_cycle_at(must_utc("2026-08-07T12:30:00Z")));

        assert_eq!(report.cancellations_applied, 1);
        assert_eq!(must(stores.ledger.pending_count()), 0);
        assert!(!sink
            .sent()
            .iter()
            .any(|(_, status)| *status == ConversionStatus::TrialStarted));
    }

    #[test]
    fn uncancelled_trial_confirms_exactly_once_after_the_grace_period() {
        let stores = Stores::new();
        let started = must_utc("2026-08-07T12:00:00Z");
        let sink = MockSink::default();

        let first = MockSource {
            total: 1,
            rows: vec![event(EventName::TrialStarted, "B", started)],
            fail_fetch: false,
        };
        let pipeline = Pipeline::new(&first, &sink, &stores.ledger, &stores.watermark, GRACE);
        let report = must(pipeline.run_cycle_at(started));
        assert_eq!(report.confirmations_sent, 0);

        // 59 minutes in (a later batch triggers the scan): still pending.
        let second = MockSource {
            total: 2,
            rows: vec![event(
                EventName::Install,
                "X",
                must_utc("2026-08-07T12:59:00Z"),
            )],
            fail_fetch: false,
        };
        let pipeline = Pipeline::new(&second, &sink, &stores.ledger, &stores.watermark, GRACE);
        let report = must(pipeline.run_cycle_at(must_utc("2026-08-07T12:59:00Z")));
        assert_eq!(report.confirmations_sent, 0);
        assert_eq!(must(stores.ledger.pending_count()), 1);

        // 61 minutes in: matured, confirmed, removed.
        let third = MockSource {
            total: 3,
            rows: vec![event(
                EventName::Install,
                "Y",
                must_utc("2026-08-07T13:01:00Z"),
            )],
            fail_fetch: false,
        };
        let pipeline = Pipeline::new(&third, &sink, &stores.ledger, &stores.watermark, GRACE);
        let report = must(pipeline.run_cycle_at(must_utc("2026-08-07T13:01:00Z")));
        assert_eq!(report.confirmations_sent, 1);
        assert_eq!(must(stores.ledger.pending_count()), 0);

        let confirmations: Vec<_> = sink
            .sent()
            .into_iter()
            .filter(|(_, status)| *status == ConversionStatus::TrialStarted)
            .collect();
        assert_eq!(
            confirmations,
            vec![("B".to_string(), ConversionStatus::TrialStarted)]
        );
        assert_eq!(must(stores.watermark.load()), 3);
    }

    #[test]
    fn failed_confirmation_keeps_the_trial_pending_for_the_next_cycle() {
        let stores = Stores::new();
        let started = must_utc("2026-08-07T12:00:00Z");

        let first = MockSource {
            total: 1,
            rows: vec![event(EventName::TrialStarted, "B", started)],
            fail_fetch: false,
        };
        let failing_sink = MockSink::failing(vec![ConversionStatus::TrialStarted]);
        let pipeline = Pipeline::new(
            &first,
            &failing_sink,
            &stores.ledger,
            &stores.watermark,
            GRACE,
        );
        must(pipeline.run_cycle_at(started));

        let second = MockSource {
            total: 2,
            rows: vec![event(
                EventName::Install,
                "X",
                must_utc("2026-08-07T13:30:00Z"),
            )],
            fail_fetch: false,
        };
        let report = must(Pipeline::new(
            &second,
            &failing_sink,
            &stores.ledger,
            &stores.watermark,
            GRACE,
        )
        .run_cycle_at(must_utc("2026-08-07T13:30:00Z")));
        assert_eq!(report.confirmations_failed, 1);
        assert_eq!(must(stores.ledger.pending_count()), 1);

        // Once the tracker recovers the trial confirms on the next cycle.
        let third = MockSource {
            total: 3,
            rows: vec![event(
                EventName::Install,
                "Y",
                must_utc("2026-08-07T13:40:00Z"),
            )],
            fail_fetch: false,
        };
        let healthy_sink = MockSink::default();
        let report = must(Pipeline::new(
            &third,
            &healthy_sink,
            &stores.ledger,
            &stores.watermark,
            GRACE,
        )
        .run_cycle_at(must_utc("2026-08-07T13:40:00Z")));
        assert_eq!(report.confirmations_sent, 1);
        assert_eq!(must(stores.ledger.pending_count()), 0);
    }

    #[test]
    fn reprocessing_a_batch_leaves_a_single_ledger_record() {
        // Simulates a watermark save that never landed: the same batch is
        // fetched and reconciled twice.
        let stores = Stores::new();
        let now = must_utc("2026-08-07T12:00:00Z");
        let sink = MockSink::default();
        let source = MockSource {
            total: 1,
            rows: vec![event(EventName::TrialStarted, "B", now)],
            fail_fetch: false,
        };

        let pipeline = Pipeline::new(&source, &sink, &stores.ledger, &stores.watermark, GRACE);
        let first = must(pipeline.run_cycle_at(now));
        assert_eq!(first.trials_inserted, 1);

        must(stores.watermark.save(0));
        let second = must(pipeline.run_cycle_at(now));
        assert_eq!(second.trials_duplicate, 1);
        assert_eq!(second.trials_inserted, 0);
        assert_eq!(must(stores.ledger.pending_count()), 1);
    }

    #[test]
    fn a_failed_install_postback_does_not_stop_the_batch() {
        let stores = Stores::new();
        let now = must_utc("2026-08-07T12:00:00Z");
        let sink = MockSink::failing(vec![ConversionStatus::Install]);
        let source = MockSource {
            total: 3,
            rows: vec![
                event(EventName::Install, "A1", now),
                event(EventName::Install, "A2", now),
                event(EventName::SubscribeActivated, "D", now),
            ],
            fail_fetch: false,
        };

        let pipeline = Pipeline::new(&source, &sink, &stores.ledger, &stores.watermark, GRACE);
        let report = must(pipeline.run_cycle_at(now));

        assert_eq!(report.installs_failed, 2);
        assert_eq!(report.activations_sent, 1);
        assert_eq!(
            sink.sent(),
            vec![("D".to_string(), ConversionStatus::TrialConverted)]
        );
        assert_eq!(must(stores.watermark.load()), 3);
    }

    #[test]
    fn watermark_is_nondecreasing_across_cycles() {
        let stores = Stores::new();
        let now = must_utc("2026-08-07T12:00:00Z");
        let sink = MockSink::default();

        for total in [5_u64, 5, 9, 12] {
            let source = MockSource {
                total,
                rows: vec![event(EventName::Install, "A", now)],
                fail_fetch: false,
            };
            let pipeline = Pipeline::new(&source, &sink, &stores.ledger, &stores.watermark, GRACE);
            let before = must(stores.watermark.load());
            must(pipeline.run_cycle_at(now));
            let after = must(stores.watermark.load());
            assert!(after >= before);
            assert_eq!(after, total);
        }
    }
}
