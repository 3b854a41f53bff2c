//! Tier scheduler and manual trigger surface
//!
//! The [`Scheduler`] owns the two tier guards and drives each tier from its
//! own [`TimerSource`]. Every tick spawns a tier run; a run that finds its
//! tier already running is dropped, not queued. Manual triggers bypass the
//! tier guards and only contend on the per-receiver lock.

use log::{debug, error, info, warn};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use super::guard::TierGuards;
use super::timer::TimerSource;
use super::worker::SyncWorker;
use crate::error::{DirectoryError, GuardBusy, TriggerError};
use crate::models::{Receiver, ReceiverId, ReceiverOutcome, SyncRun, Tier, TriggerOrigin};
use crate::storage::ReceiverDirectory;

/// Default number of completed runs kept for inspection
pub const DEFAULT_HISTORY_SIZE: usize = 32;

/// Sync scheduler: timers, tier guards, manual triggers
pub struct Scheduler {
    directory: Arc<dyn ReceiverDirectory>,
    worker: SyncWorker,
    guards: TierGuards,
    next_run_id: AtomicU64,
    history: Mutex<VecDeque<SyncRun>>,
    history_size: usize,
    completed: broadcast::Sender<SyncRun>,
}

impl Scheduler {
    pub fn new(directory: Arc<dyn ReceiverDirectory>, worker: SyncWorker) -> Self {
        let (completed, _) = broadcast::channel(64);
        Self {
            directory,
            worker,
            guards: TierGuards::new(),
            next_run_id: AtomicU64::new(1),
            history: Mutex::new(VecDeque::new()),
            history_size: DEFAULT_HISTORY_SIZE,
            completed,
        }
    }

    pub fn with_history_size(mut self, history_size: usize) -> Self {
        self.history_size = history_size;
        self
    }

    pub fn guards(&self) -> &TierGuards {
        &self.guards
    }

    pub fn worker(&self) -> &SyncWorker {
        &self.worker
    }

    /// Receive every completed run, scheduled or manual
    pub fn subscribe(&self) -> broadcast::Receiver<SyncRun> {
        self.completed.subscribe()
    }

    /// Completed runs, oldest first
    pub fn recent_runs(&self) -> Vec<SyncRun> {
        let history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        history.iter().cloned().collect()
    }

    /// Execute one run of `tier` over all active receivers.
    ///
    /// Returns [`GuardBusy`] without touching any receiver if the tier is
    /// already running. Receivers are visited sequentially in directory
    /// order; the guard is released when this returns, whatever happened.
    pub async fn run_tier(&self, tier: Tier, origin: TriggerOrigin) -> Result<SyncRun, GuardBusy> {
        let guard = self.guards.get(tier);
        let Some(_permit) = guard.try_permit() else {
            debug!("{} tick skipped: previous run still in progress", guard.tier());
            return Err(GuardBusy(guard.tier()));
        };

        let mut run = SyncRun::start(self.allocate_run_id(), tier, origin);
        info!("{} run #{} started ({})", tier, run.id, origin);

        match self.list_active().await {
            Ok(receivers) => {
                for receiver in receivers {
                    let outcome = self.worker.sync_receiver(receiver, tier).await;
                    run.record(outcome);
                }
            }
            Err(e) => {
                error!("{} run #{} aborted: {}", tier, run.id, e);
                run.directory_error = Some(e.to_string());
            }
        }

        run.finish();
        info!(
            "{} run #{} finished: {} receivers, {} ok, {} failed",
            tier,
            run.id,
            run.outcomes.len(),
            run.succeeded(),
            run.failed()
        );
        self.publish(&run);
        Ok(run)
    }

    /// Manually run one incremental sync for a receiver
    pub async fn trigger_incremental_sync(
        &self,
        receiver_id: &ReceiverId,
    ) -> Result<ReceiverOutcome, TriggerError> {
        self.trigger_custom_sync(receiver_id, Tier::Incremental).await
    }

    /// Manually run one full sync for a receiver
    pub async fn trigger_full_sync(
        &self,
        receiver_id: &ReceiverId,
    ) -> Result<ReceiverOutcome, TriggerError> {
        self.trigger_custom_sync(receiver_id, Tier::Full).await
    }

    /// Manually run one sync of the given tier for a receiver.
    ///
    /// Does not take the tier guard, so it neither waits for nor blocks a
    /// scheduled run. A receiver already being synced yields an outcome of
    /// `SyncError::ReceiverBusy`.
    pub async fn trigger_custom_sync(
        &self,
        receiver_id: &ReceiverId,
        tier: Tier,
    ) -> Result<ReceiverOutcome, TriggerError> {
        let receiver = self
            .lookup(receiver_id)
            .await?
            .ok_or_else(|| TriggerError::NotFound(receiver_id.clone()))?;
        if !receiver.active {
            return Err(TriggerError::Inactive(receiver_id.clone()));
        }

        let mut run = SyncRun::start(self.allocate_run_id(), tier, TriggerOrigin::Manual);
        info!("manual {} sync #{} for {}", tier, run.id, receiver_id);

        let outcome = self.worker.sync_receiver(receiver, tier).await;
        run.record(outcome.clone());
        run.finish();
        self.publish(&run);
        Ok(outcome)
    }

    /// Start both tier timers on the current Tokio runtime
    pub fn start(
        self: &Arc<Self>,
        incremental: Box<dyn TimerSource>,
        full: Box<dyn TimerSource>,
    ) -> SchedulerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let tasks = vec![
            tokio::spawn(Arc::clone(self).drive_tier(Tier::Incremental, incremental, shutdown_rx.clone())),
            tokio::spawn(Arc::clone(self).drive_tier(Tier::Full, full, shutdown_rx)),
        ];
        SchedulerHandle { shutdown_tx, tasks }
    }

    /// Timer loop for one tier
    async fn drive_tier(
        self: Arc<Self>,
        tier: Tier,
        mut timer: Box<dyn TimerSource>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("{} timer started", tier);
        loop {
            let tick = tokio::select! {
                tick = timer.next_tick() => tick,
                _ = shutdown.changed() => break,
            };
            let Some(at) = tick else {
                break;
            };

            debug!("{} tick at {}", tier, at);
            let scheduler = Arc::clone(&self);
            // Spawned so an overlapping tick meets the guard instead of
            // waiting behind the previous run.
            tokio::spawn(async move {
                let _ = scheduler.run_tier(tier, TriggerOrigin::Scheduled).await;
            });
        }
        info!("{} timer stopped", tier);
    }

    async fn list_active(&self) -> Result<Vec<Receiver>, DirectoryError> {
        let directory = Arc::clone(&self.directory);
        self.query_directory(move || directory.list_active()).await
    }

    async fn lookup(&self, receiver_id: &ReceiverId) -> Result<Option<Receiver>, DirectoryError> {
        let directory = Arc::clone(&self.directory);
        let receiver_id = receiver_id.clone();
        self.query_directory(move || directory.get(&receiver_id)).await
    }

    /// Run a blocking directory call under the worker's timeout.
    ///
    /// A directory that never answers would otherwise hold the tier guard
    /// and turn every later tick into a dropped run.
    async fn query_directory<T, F>(&self, query: F) -> Result<T, DirectoryError>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, DirectoryError> + Send + 'static,
    {
        let timeout = self.worker.timeout();
        match tokio::time::timeout(timeout, tokio::task::spawn_blocking(query)).await {
            Ok(joined) => joined.unwrap_or_else(|e| Err(DirectoryError::new(e))),
            Err(_) => Err(DirectoryError::new(format!(
                "receiver directory did not answer within {:?}",
                timeout
            ))),
        }
    }

    fn allocate_run_id(&self) -> u64 {
        self.next_run_id.fetch_add(1, Ordering::Relaxed)
    }

    fn publish(&self, run: &SyncRun) {
        {
            let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
            history.push_back(run.clone());
            while history.len() > self.history_size {
                history.pop_front();
            }
        }
        // No subscribers is fine
        let _ = self.completed.send(run.clone());
    }
}

/// Running timer loops of a started [`Scheduler`]
pub struct SchedulerHandle {
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl SchedulerHandle {
    /// Stop both timers. Runs already in flight finish on their own.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!("timer task ended abnormally: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MailboxError;
    use crate::mailbox::{FullFetch, IncrementalFetch, MailboxClient};
    use crate::models::{Cursor, MailboxConnection, NormalizedMessage};
    use crate::storage::InMemoryInbox;
    use crate::sync::timer::ManualTimer;
    use chrono::Utc;
    use std::collections::HashSet;
    use std::time::Duration;

    /// Mailbox that returns one message per fetch, failing for chosen receivers
    #[derive(Default)]
    struct EchoMailbox {
        failing: HashSet<ReceiverId>,
    }

    impl EchoMailbox {
        fn fetch(&self, receiver: &Receiver) -> Result<Vec<NormalizedMessage>, MailboxError> {
            if self.failing.contains(&receiver.id) {
                return Err(MailboxError::connection(&receiver.id, "connection reset"));
            }
            let id = format!("{}-msg", receiver.id.id);
            Ok(vec![NormalizedMessage::new(receiver.id.clone(), id, "raw", Utc::now())])
        }
    }

    impl MailboxClient for EchoMailbox {
        fn fetch_incremental(&self, receiver: &Receiver) -> Result<IncrementalFetch, MailboxError> {
            let messages = self.fetch(receiver)?;
            Ok(IncrementalFetch {
                messages,
                cursor: receiver.cursor.map(|c| Cursor::new(c.value() + 1)),
            })
        }

        fn fetch_full(&self, receiver: &Receiver) -> Result<FullFetch, MailboxError> {
            let messages = self.fetch(receiver)?;
            Ok(FullFetch {
                messages,
                cursor: Some(Cursor::new(100)),
            })
        }
    }

    struct DownDirectory;

    impl ReceiverDirectory for DownDirectory {
        fn list_active(&self) -> Result<Vec<Receiver>, DirectoryError> {
            Err(DirectoryError::new("connection refused"))
        }

        fn get(&self, _id: &ReceiverId) -> Result<Option<Receiver>, DirectoryError> {
            Err(DirectoryError::new("connection refused"))
        }
    }

    fn receiver(id: &str) -> Receiver {
        Receiver::new(
            ReceiverId::new("acme", id),
            MailboxConnection::gmail(format!("{}@acme.test", id), "token"),
        )
        .with_cursor(Cursor::new(1))
    }

    fn scheduler(inbox: &Arc<InMemoryInbox>, mailbox: EchoMailbox) -> Scheduler {
        let worker = SyncWorker::new(Arc::new(mailbox), inbox.clone(), Duration::from_secs(5));
        Scheduler::new(inbox.clone(), worker)
    }

    #[tokio::test]
    async fn test_run_tier_visits_all_and_contains_failures() {
        let inbox = Arc::new(InMemoryInbox::new());
        for id in ["a", "b", "c"] {
            inbox.register_receiver(receiver(id));
        }
        let mailbox = EchoMailbox {
            failing: HashSet::from([ReceiverId::new("acme", "b")]),
        };
        let scheduler = scheduler(&inbox, mailbox);

        let run = scheduler
            .run_tier(Tier::Incremental, TriggerOrigin::Scheduled)
            .await
            .unwrap();
        assert_eq!(run.outcomes.len(), 3);
        assert_eq!(run.succeeded(), 2);
        assert_eq!(run.failed(), 1);
        assert!(run.finished_at.is_some());
        assert!(!scheduler.guards().get(Tier::Incremental).is_running());
        assert_eq!(inbox.message_count(&ReceiverId::new("acme", "c")), 1);
    }

    #[tokio::test]
    async fn test_run_tier_skips_inactive_receivers() {
        let inbox = Arc::new(InMemoryInbox::new());
        inbox.register_receiver(receiver("on"));
        inbox.register_receiver(receiver("off").with_active(false));
        let scheduler = scheduler(&inbox, EchoMailbox::default());

        let run = scheduler.run_tier(Tier::Full, TriggerOrigin::Scheduled).await.unwrap();
        assert_eq!(run.outcomes.len(), 1);
        assert!(run.outcome_for(&ReceiverId::new("acme", "off")).is_none());
    }

    #[tokio::test]
    async fn test_run_tier_busy_when_guard_held() {
        let inbox = Arc::new(InMemoryInbox::new());
        inbox.register_receiver(receiver("a"));
        let scheduler = scheduler(&inbox, EchoMailbox::default());

        let permit = scheduler.guards().get(Tier::Incremental).try_permit();
        assert!(permit.is_some());

        let busy = scheduler.run_tier(Tier::Incremental, TriggerOrigin::Scheduled).await;
        assert_eq!(busy.unwrap_err(), GuardBusy(Tier::Incremental));
        assert_eq!(inbox.message_count(&ReceiverId::new("acme", "a")), 0);

        // The other tier has its own guard
        assert!(scheduler.run_tier(Tier::Full, TriggerOrigin::Scheduled).await.is_ok());

        drop(permit);
        assert!(scheduler.run_tier(Tier::Incremental, TriggerOrigin::Scheduled).await.is_ok());
    }

    #[tokio::test]
    async fn test_directory_failure_recorded_and_guard_released() {
        let inbox = Arc::new(InMemoryInbox::new());
        let worker = SyncWorker::new(
            Arc::new(EchoMailbox::default()),
            inbox,
            Duration::from_secs(5),
        );
        let scheduler = Scheduler::new(Arc::new(DownDirectory), worker);

        let run = scheduler.run_tier(Tier::Incremental, TriggerOrigin::Scheduled).await.unwrap();
        assert!(run.outcomes.is_empty());
        assert!(run.directory_error.as_deref().unwrap().contains("connection refused"));
        assert!(!scheduler.guards().get(Tier::Incremental).is_running());

        let trigger = scheduler.trigger_full_sync(&ReceiverId::new("acme", "a")).await;
        assert!(matches!(trigger, Err(TriggerError::Directory(_))));
    }

    /// Directory that answers only after a long stall
    struct StalledDirectory(Duration);

    impl ReceiverDirectory for StalledDirectory {
        fn list_active(&self) -> Result<Vec<Receiver>, DirectoryError> {
            std::thread::sleep(self.0);
            Ok(vec![receiver("late")])
        }

        fn get(&self, _id: &ReceiverId) -> Result<Option<Receiver>, DirectoryError> {
            std::thread::sleep(self.0);
            Ok(Some(receiver("late")))
        }
    }

    #[tokio::test]
    async fn test_stalled_directory_times_out_and_releases_guard() {
        let inbox = Arc::new(InMemoryInbox::new());
        let worker = SyncWorker::new(
            Arc::new(EchoMailbox::default()),
            inbox,
            Duration::from_millis(50),
        );
        let scheduler = Scheduler::new(Arc::new(StalledDirectory(Duration::from_millis(500))), worker);

        let run = scheduler.run_tier(Tier::Full, TriggerOrigin::Scheduled).await.unwrap();
        assert!(run.outcomes.is_empty());
        assert!(run.directory_error.as_deref().unwrap().contains("did not answer"));
        assert!(!scheduler.guards().get(Tier::Full).is_running());

        // The next tick is not dropped as overlapping
        assert!(scheduler.run_tier(Tier::Full, TriggerOrigin::Scheduled).await.is_ok());

        let trigger = scheduler.trigger_incremental_sync(&ReceiverId::new("acme", "late")).await;
        assert!(matches!(trigger, Err(TriggerError::Directory(_))));
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let inbox = Arc::new(InMemoryInbox::new());
        inbox.register_receiver(receiver("a"));
        let scheduler = scheduler(&inbox, EchoMailbox::default()).with_history_size(2);

        for _ in 0..3 {
            scheduler.run_tier(Tier::Incremental, TriggerOrigin::Scheduled).await.unwrap();
        }
        let runs = scheduler.recent_runs();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs.iter().map(|r| r.id).collect::<Vec<_>>(), vec![2, 3]);
    }

    #[tokio::test]
    async fn test_manual_trigger_errors() {
        let inbox = Arc::new(InMemoryInbox::new());
        inbox.register_receiver(receiver("off").with_active(false));
        let scheduler = scheduler(&inbox, EchoMailbox::default());

        let missing = ReceiverId::new("acme", "missing");
        assert_eq!(
            scheduler.trigger_incremental_sync(&missing).await.unwrap_err(),
            TriggerError::NotFound(missing)
        );

        let off = ReceiverId::new("acme", "off");
        assert_eq!(
            scheduler.trigger_full_sync(&off).await.unwrap_err(),
            TriggerError::Inactive(off)
        );
    }

    #[tokio::test]
    async fn test_manual_trigger_records_run() {
        let inbox = Arc::new(InMemoryInbox::new());
        inbox.register_receiver(receiver("a"));
        let scheduler = scheduler(&inbox, EchoMailbox::default());
        let mut completed = scheduler.subscribe();

        let id = ReceiverId::new("acme", "a");
        let outcome = scheduler.trigger_custom_sync(&id, Tier::Full).await.unwrap();
        assert!(outcome.is_success());
        assert!(inbox.get_receiver(&id).unwrap().last_full_sync_at.is_some());

        let run = completed.recv().await.unwrap();
        assert_eq!(run.origin, TriggerOrigin::Manual);
        assert_eq!(run.tier, Tier::Full);
        assert_eq!(run.outcomes.len(), 1);
    }

    #[tokio::test]
    async fn test_timer_ticks_drive_runs_until_shutdown() {
        let inbox = Arc::new(InMemoryInbox::new());
        inbox.register_receiver(receiver("a"));
        let scheduler = Arc::new(scheduler(&inbox, EchoMailbox::default()));
        let mut completed = scheduler.subscribe();

        let (incremental_tick, incremental) = ManualTimer::channel();
        let (full_tick, full) = ManualTimer::channel();
        let handle = scheduler.start(Box::new(incremental), Box::new(full));

        assert!(full_tick.tick());
        let run = tokio::time::timeout(Duration::from_secs(5), completed.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(run.tier, Tier::Full);
        assert_eq!(run.origin, TriggerOrigin::Scheduled);

        assert!(incremental_tick.tick());
        let run = tokio::time::timeout(Duration::from_secs(5), completed.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(run.tier, Tier::Incremental);

        handle.shutdown().await;
        assert!(!incremental_tick.tick());
    }
}
