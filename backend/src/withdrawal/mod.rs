//! Withdrawal monitoring.
//!
//! Once a transfer has been submitted to the gateway, a monitor task follows it
//! to a terminal state: one status check after `initial_delay`, then a check
//! every `poll_interval`, abandoned at `timeout`. A progress entry is refreshed
//! every `progress_tick` so clients can render a countdown. Exactly one
//! [`MonitorOutcome`] is applied to the records through the [`WithdrawalStore`].

mod store;

pub use store::{settle, PgWithdrawalStore, WithdrawalStore};

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep_until, timeout_at, Instant, MissedTickBehavior};
use uuid::Uuid;

use crate::error::AppError;
use crate::models::WithdrawalStatus;
use crate::payment::{PaymentGateway, PaymentStatus};

/// Finished entries stay visible on the board this long.
const FINISHED_RETENTION: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Clone, Copy)]
pub struct MonitorSettings {
    pub initial_delay: Duration,
    pub poll_interval: Duration,
    pub timeout: Duration,
    pub progress_tick: Duration,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            poll_interval: Duration::from_secs(10),
            timeout: Duration::from_secs(60),
            progress_tick: Duration::from_secs(1),
        }
    }
}

/// Everything the monitor needs to follow one submitted withdrawal.
#[derive(Debug, Clone)]
pub struct WithdrawalTicket {
    pub withdrawal_id: Uuid,
    pub profile_id: Uuid,
    pub amount: i64,
    pub currency: String,
    pub reference: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorOutcome {
    Successful,
    Failed { reason: Option<String> },
    Expired,
    TimedOut,
}

impl MonitorOutcome {
    /// The status recorded for this outcome; a timeout is recorded as `UNKNOWN`.
    pub fn status(&self) -> WithdrawalStatus {
        match self {
            MonitorOutcome::Successful => WithdrawalStatus::Successful,
            MonitorOutcome::Failed { .. } => WithdrawalStatus::Failed,
            MonitorOutcome::Expired => WithdrawalStatus::Expired,
            MonitorOutcome::TimedOut => WithdrawalStatus::Unknown,
        }
    }

    fn from_status(status: PaymentStatus, reason: Option<String>) -> Option<Self> {
        match status {
            PaymentStatus::Pending => None,
            PaymentStatus::Successful => Some(MonitorOutcome::Successful),
            PaymentStatus::Failed => Some(MonitorOutcome::Failed { reason }),
            PaymentStatus::Expired => Some(MonitorOutcome::Expired),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub status: WithdrawalStatus,
    pub percent: u8,
    pub elapsed_secs: u64,
    pub checks: u32,
    #[serde(skip)]
    finished_at: Option<Instant>,
}

impl Progress {
    fn running(elapsed: Duration, timeout: Duration, checks: u32) -> Self {
        let percent = if timeout.is_zero() {
            99
        } else {
            ((elapsed.as_millis() * 100) / timeout.as_millis()).min(99) as u8
        };
        Self {
            status: WithdrawalStatus::Pending,
            percent,
            elapsed_secs: elapsed.as_secs(),
            checks,
            finished_at: None,
        }
    }

    fn finished(status: WithdrawalStatus, elapsed: Duration, checks: u32) -> Self {
        Self {
            status,
            percent: 100,
            elapsed_secs: elapsed.as_secs(),
            checks,
            finished_at: Some(Instant::now()),
        }
    }
}

/// Live progress of monitored withdrawals, keyed by withdrawal id.
#[derive(Debug, Clone, Default)]
pub struct ProgressBoard {
    entries: Arc<RwLock<HashMap<Uuid, Progress>>>,
}

impl ProgressBoard {
    pub fn get(&self, withdrawal_id: &Uuid) -> Option<Progress> {
        self.entries.read().ok()?.get(withdrawal_id).cloned()
    }

    fn set(&self, withdrawal_id: Uuid, progress: Progress) {
        if let Ok(mut entries) = self.entries.write() {
            entries.insert(withdrawal_id, progress);
        }
    }

    fn prune(&self) {
        if let Ok(mut entries) = self.entries.write() {
            entries.retain(|_, p| p.finished_at.map_or(true, |at| at.elapsed() < FINISHED_RETENTION));
        }
    }
}

#[derive(Clone)]
pub struct WithdrawalMonitor {
    gateway: Arc<dyn PaymentGateway>,
    store: Arc<dyn WithdrawalStore>,
    settings: MonitorSettings,
    board: ProgressBoard,
}

impl WithdrawalMonitor {
    pub fn new(gateway: Arc<dyn PaymentGateway>, store: Arc<dyn WithdrawalStore>, settings: MonitorSettings) -> Self {
        Self { gateway, store, settings, board: ProgressBoard::default() }
    }

    pub fn board(&self) -> &ProgressBoard {
        &self.board
    }

    pub fn spawn(&self, ticket: WithdrawalTicket) -> JoinHandle<MonitorOutcome> {
        let monitor = self.clone();
        tokio::spawn(async move { monitor.run(ticket).await })
    }

    pub async fn run(&self, ticket: WithdrawalTicket) -> MonitorOutcome {
        self.board.prune();
        log::info!("Monitoring withdrawal {} (reference {})", ticket.withdrawal_id, ticket.reference);
        let start = Instant::now();
        let (outcome, checks) = self.watch(&ticket, start).await;
        self.apply(&ticket, &outcome).await;
        self.board
            .set(ticket.withdrawal_id, Progress::finished(outcome.status(), start.elapsed(), checks));
        log::info!("Withdrawal {} finished as {}", ticket.withdrawal_id, outcome.status());
        outcome
    }

    async fn watch(&self, ticket: &WithdrawalTicket, start: Instant) -> (MonitorOutcome, u32) {
        let settings = self.settings;
        let deadline = start + settings.timeout;
        let expire = sleep_until(deadline);
        tokio::pin!(expire);

        let mut poll = interval_at(start + settings.initial_delay, settings.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut tick = interval_at(start + settings.progress_tick, settings.progress_tick);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut checks = 0u32;
        self.board.set(ticket.withdrawal_id, Progress::running(Duration::ZERO, settings.timeout, checks));

        loop {
            tokio::select! {
                biased;
                _ = &mut expire => return (MonitorOutcome::TimedOut, checks),
                _ = poll.tick() => {
                    checks += 1;
                    match timeout_at(deadline, self.gateway.transfer_status(&ticket.reference)).await {
                        Err(_) => return (MonitorOutcome::TimedOut, checks),
                        Ok(Ok(report)) => {
                            if let Some(outcome) = MonitorOutcome::from_status(report.status, report.reason) {
                                return (outcome, checks);
                            }
                            log::debug!("Withdrawal {} still pending after check {}", ticket.withdrawal_id, checks);
                        }
                        Ok(Err(e)) => {
                            log::warn!("Status check {} for withdrawal {} failed: {}", checks, ticket.withdrawal_id, e);
                        }
                    }
                }
                _ = tick.tick() => {
                    self.board.set(
                        ticket.withdrawal_id,
                        Progress::running(start.elapsed(), settings.timeout, checks),
                    );
                }
            }
        }
    }

    async fn apply(&self, ticket: &WithdrawalTicket, outcome: &MonitorOutcome) {
        let result = match outcome {
            MonitorOutcome::Successful => self.store.complete(ticket).await,
            MonitorOutcome::Failed { reason } => {
                self.store.fail(ticket, WithdrawalStatus::Failed, reason.clone()).await
            }
            MonitorOutcome::Expired => {
                self.store
                    .fail(ticket, WithdrawalStatus::Expired, Some("The transfer expired".to_string()))
                    .await
            }
            MonitorOutcome::TimedOut => self.store.mark_unknown(ticket).await,
        };
        if let Err(e) = result {
            log::error!("Failed to record outcome of withdrawal {}: {}", ticket.withdrawal_id, e);
        }
    }

    /// One status check outside the polling loop, for records left `PENDING` or `UNKNOWN`.
    pub async fn refresh(&self, ticket: &WithdrawalTicket) -> Result<WithdrawalStatus, AppError> {
        let report = self.gateway.transfer_status(&ticket.reference).await?;
        match MonitorOutcome::from_status(report.status, report.reason) {
            Some(outcome) => {
                self.apply(ticket, &outcome).await;
                self.board.set(ticket.withdrawal_id, Progress::finished(outcome.status(), Duration::ZERO, 1));
                Ok(outcome.status())
            }
            None => Ok(WithdrawalStatus::Pending),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payment::{GatewayError, PaymentOrder, StatusReport};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays scripted status responses, then answers `Pending` forever.
    struct ScriptedGateway {
        script: Mutex<VecDeque<Result<StatusReport, GatewayError>>>,
        calls: Mutex<Vec<Instant>>,
        hang: bool,
    }

    impl ScriptedGateway {
        fn new(script: Vec<Result<StatusReport, GatewayError>>) -> Arc<Self> {
            Arc::new(Self { script: Mutex::new(script.into()), calls: Mutex::new(Vec::new()), hang: false })
        }

        fn hanging() -> Arc<Self> {
            Arc::new(Self { script: Mutex::new(VecDeque::new()), calls: Mutex::new(Vec::new()), hang: true })
        }

        fn call_times(&self) -> Vec<Instant> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PaymentGateway for ScriptedGateway {
        async fn initiate_transfer(&self, _order: &PaymentOrder) -> Result<String, GatewayError> {
            Ok("ref-1".to_string())
        }

        async fn transfer_status(&self, _reference: &str) -> Result<StatusReport, GatewayError> {
            self.calls.lock().unwrap().push(Instant::now());
            if self.hang {
                std::future::pending::<()>().await;
            }
            let next = self.script.lock().unwrap().pop_front();
            next.unwrap_or_else(|| Ok(StatusReport::pending()))
        }

        async fn request_payment(&self, _order: &PaymentOrder) -> Result<String, GatewayError> {
            Ok("ref-2".to_string())
        }

        async fn payment_status(&self, _reference: &str) -> Result<StatusReport, GatewayError> {
            Ok(StatusReport::pending())
        }
    }

    #[derive(Default)]
    struct RecordingStore {
        applied: Mutex<Vec<WithdrawalStatus>>,
    }

    #[async_trait]
    impl WithdrawalStore for RecordingStore {
        async fn complete(&self, _ticket: &WithdrawalTicket) -> Result<(), AppError> {
            self.applied.lock().unwrap().push(WithdrawalStatus::Successful);
            Ok(())
        }

        async fn fail(
            &self,
            _ticket: &WithdrawalTicket,
            status: WithdrawalStatus,
            _reason: Option<String>,
        ) -> Result<(), AppError> {
            self.applied.lock().unwrap().push(status);
            Ok(())
        }

        async fn mark_unknown(&self, _ticket: &WithdrawalTicket) -> Result<(), AppError> {
            self.applied.lock().unwrap().push(WithdrawalStatus::Unknown);
            Ok(())
        }
    }

    fn ticket() -> WithdrawalTicket {
        WithdrawalTicket {
            withdrawal_id: Uuid::new_v4(),
            profile_id: Uuid::new_v4(),
            amount: 5_000,
            currency: "EUR".to_string(),
            reference: "ref-1".to_string(),
        }
    }

    fn status(status: PaymentStatus) -> Result<StatusReport, GatewayError> {
        Ok(StatusReport { status, reason: None })
    }

    fn monitor(gateway: Arc<ScriptedGateway>, store: Arc<RecordingStore>) -> WithdrawalMonitor {
        WithdrawalMonitor::new(gateway, store, MonitorSettings::default())
    }

    #[tokio::test(start_paused = true)]
    async fn immediate_check_can_finish_the_withdrawal() {
        let gateway = ScriptedGateway::new(vec![status(PaymentStatus::Successful)]);
        let store = Arc::new(RecordingStore::default());
        let start = Instant::now();

        let outcome = monitor(gateway.clone(), store.clone()).run(ticket()).await;

        assert_eq!(outcome, MonitorOutcome::Successful);
        assert_eq!(gateway.call_times(), vec![start + Duration::from_secs(5)]);
        assert_eq!(*store.applied.lock().unwrap(), vec![WithdrawalStatus::Successful]);
    }

    #[tokio::test(start_paused = true)]
    async fn polls_on_the_interval_until_terminal() {
        let gateway = ScriptedGateway::new(vec![
            status(PaymentStatus::Pending),
            status(PaymentStatus::Pending),
            Ok(StatusReport { status: PaymentStatus::Failed, reason: Some("PAYEE_NOT_FOUND".to_string()) }),
        ]);
        let store = Arc::new(RecordingStore::default());
        let start = Instant::now();

        let outcome = monitor(gateway.clone(), store.clone()).run(ticket()).await;

        assert_eq!(outcome, MonitorOutcome::Failed { reason: Some("PAYEE_NOT_FOUND".to_string()) });
        let offsets: Vec<u64> = gateway.call_times().iter().map(|t| (*t - start).as_secs()).collect();
        assert_eq!(offsets, vec![5, 15, 25]);
        assert_eq!(*store.applied.lock().unwrap(), vec![WithdrawalStatus::Failed]);
    }

    #[tokio::test(start_paused = true)]
    async fn network_errors_do_not_stop_polling() {
        let gateway = ScriptedGateway::new(vec![
            Err(GatewayError::Protocol("connection reset".to_string())),
            Err(GatewayError::Rejected { status: 503, body: "busy".to_string() }),
            status(PaymentStatus::Expired),
        ]);
        let store = Arc::new(RecordingStore::default());

        let outcome = monitor(gateway.clone(), store.clone()).run(ticket()).await;

        assert_eq!(outcome, MonitorOutcome::Expired);
        assert_eq!(gateway.call_times().len(), 3);
        assert_eq!(*store.applied.lock().unwrap(), vec![WithdrawalStatus::Expired]);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_at_the_timeout_with_unknown_status() {
        let gateway = ScriptedGateway::new(vec![]);
        let store = Arc::new(RecordingStore::default());
        let start = Instant::now();
        let t = ticket();
        let m = monitor(gateway.clone(), store.clone());

        let outcome = m.run(t.clone()).await;

        assert_eq!(outcome, MonitorOutcome::TimedOut);
        assert_eq!(start.elapsed(), Duration::from_secs(60));
        // Checks at 5, 15, 25, 35, 45 and 55 seconds.
        assert_eq!(gateway.call_times().len(), 6);
        assert_eq!(*store.applied.lock().unwrap(), vec![WithdrawalStatus::Unknown]);
        let progress = m.board().get(&t.withdrawal_id).unwrap();
        assert_eq!(progress.status, WithdrawalStatus::Unknown);
        assert_eq!(progress.percent, 100);
    }

    #[tokio::test(start_paused = true)]
    async fn a_hanging_status_call_cannot_outlive_the_timeout() {
        let gateway = ScriptedGateway::hanging();
        let store = Arc::new(RecordingStore::default());
        let start = Instant::now();

        let outcome = monitor(gateway, store.clone()).run(ticket()).await;

        assert_eq!(outcome, MonitorOutcome::TimedOut);
        assert!(start.elapsed() <= Duration::from_secs(60));
        assert_eq!(store.applied.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn progress_advances_on_the_tick() {
        let gateway = ScriptedGateway::new(vec![]);
        let store = Arc::new(RecordingStore::default());
        let m = monitor(gateway, store);
        let t = ticket();

        let handle = m.spawn(t.clone());
        tokio::time::sleep(Duration::from_millis(30_500)).await;

        let progress = m.board().get(&t.withdrawal_id).unwrap();
        assert_eq!(progress.status, WithdrawalStatus::Pending);
        assert_eq!(progress.elapsed_secs, 30);
        assert_eq!(progress.percent, 50);
        assert_eq!(progress.checks, 3);

        assert_eq!(handle.await.unwrap(), MonitorOutcome::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_applies_a_late_terminal_status() {
        let gateway = ScriptedGateway::new(vec![status(PaymentStatus::Pending), status(PaymentStatus::Successful)]);
        let store = Arc::new(RecordingStore::default());
        let m = monitor(gateway, store.clone());
        let t = ticket();

        assert_eq!(m.refresh(&t).await.unwrap(), WithdrawalStatus::Pending);
        assert!(store.applied.lock().unwrap().is_empty());
        assert_eq!(m.refresh(&t).await.unwrap(), WithdrawalStatus::Successful);
        assert_eq!(*store.applied.lock().unwrap(), vec![WithdrawalStatus::Successful]);
    }

    #[test]
    fn outcome_statuses() {
        assert_eq!(MonitorOutcome::TimedOut.status(), WithdrawalStatus::Unknown);
        assert_eq!(MonitorOutcome::Failed { reason: None }.status(), WithdrawalStatus::Failed);
        assert_eq!(MonitorOutcome::from_status(PaymentStatus::Pending, None), None);
    }
}
