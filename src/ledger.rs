//! Race-free daily spend accounting with reserve/commit/refund semantics.
//!
//! The ledger gates a request before its true cost is known: a reservation
//! increments the day's spend atomically and is later reconciled by a
//! commit (recording the actual cost) or a refund (releasing it in full).
//! A reservation that is neither committed nor refunded by its expiry is
//! reclaimed on the next access to the same budget key, bounding the damage
//! of a crashed handler.
//!
//! Every mutating operation runs on a detached task. A caller that gives up
//! (per-step deadline, client disconnect) can only fail to observe the
//! outcome; it can never interrupt the sequence between a counter mutation
//! and the bookkeeping that makes it reconcilable. Within that sequence the
//! reservation table sits behind a synchronous mutex, so there is no
//! suspension point between the increment and the insert either.
//!
//! Money is integer micro-units everywhere. Floating-point never enters
//! this module.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

/// Monetary amount in micro-units (one millionth of the configured unit).
pub type Micros = i64;

/// Names a row in the ledger: one user, one UTC calendar day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BudgetKey {
    /// Owning user.
    pub user_id: Uuid,
    /// UTC calendar date.
    pub day: NaiveDate,
}

impl BudgetKey {
    /// The key for `user_id` on the current UTC day.
    pub fn today(user_id: Uuid) -> Self {
        Self {
            user_id,
            day: Utc::now().date_naive(),
        }
    }
}

impl std::fmt::Display for BudgetKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "budget:{}:{}", self.day, self.user_id)
    }
}

/// Short-lived token representing reserved (not yet reconciled) spend.
#[derive(Debug, Clone)]
pub struct BudgetReservation {
    /// Reservation identifier; the handle for commit/refund.
    pub reservation_id: Uuid,
    /// Owning user.
    pub user_id: Uuid,
    /// Reserved amount in micro-units.
    pub amount_micros: Micros,
    /// Auto-refund deadline.
    pub expires_at: DateTime<Utc>,
}

/// Ledger failures.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// The reservation would push the day's spend past the limit.
    #[error("daily budget exceeded: spent {spent_micros} of {limit_micros} micro-units")]
    BudgetExceeded {
        /// Spend already recorded for the day.
        spent_micros: Micros,
        /// Configured daily limit.
        limit_micros: Micros,
    },
    /// No reservation with this id exists.
    #[error("unknown reservation: {0}")]
    UnknownReservation(Uuid),
    /// The reservation already took its one terminal transition.
    #[error("reservation {0} already settled")]
    AlreadySettled(Uuid),
    /// The counter collaborator failed. The ledger fails closed.
    #[error("spend counter unavailable: {0}")]
    Counter(String),
}

/// Outcome of the counter's atomic check-and-increment.
#[derive(Debug, Clone, Copy)]
pub enum CounterVerdict {
    /// The increment was applied.
    Allowed {
        /// Balance after the increment.
        new_balance: Micros,
    },
    /// The increment would exceed the limit; nothing was mutated.
    Rejected {
        /// Current balance.
        current: Micros,
    },
}

/// The distributed counter collaborator.
///
/// `try_add` must be atomic per key: check current + amount against the
/// limit and increment only when allowed, with no interleaving window.
#[async_trait]
pub trait SpendCounter: Send + Sync {
    /// Atomically add `amount` unless the result would exceed `limit`.
    async fn try_add(
        &self,
        key: &BudgetKey,
        amount: Micros,
        limit: Micros,
    ) -> Result<CounterVerdict, String>;

    /// Unconditionally add `amount` (used for within-slack commit overruns).
    async fn force_add(&self, key: &BudgetKey, amount: Micros) -> Result<(), String>;

    /// Subtract `amount`, flooring at zero.
    async fn subtract(&self, key: &BudgetKey, amount: Micros) -> Result<(), String>;

    /// Current balance for the key.
    async fn current(&self, key: &BudgetKey) -> Result<Micros, String>;
}

/// In-process counter with per-key serialization via a single mutex.
///
/// Stands in for the external counter service in tests and single-node
/// deployments; the trait seam is where a networked counter plugs in.
#[derive(Default)]
pub struct InMemoryCounter {
    balances: Mutex<HashMap<BudgetKey, Micros>>,
}

impl InMemoryCounter {
    /// Empty counter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-seed a key's balance (tests).
    pub async fn seed(&self, key: BudgetKey, balance: Micros) {
        self.balances.lock().await.insert(key, balance);
    }
}

#[async_trait]
impl SpendCounter for InMemoryCounter {
    async fn try_add(
        &self,
        key: &BudgetKey,
        amount: Micros,
        limit: Micros,
    ) -> Result<CounterVerdict, String> {
        let mut balances = self.balances.lock().await;
        let current = balances.get(key).copied().unwrap_or(0);
        let next = current.saturating_add(amount);
        if next > limit {
            return Ok(CounterVerdict::Rejected { current });
        }
        balances.insert(*key, next);
        Ok(CounterVerdict::Allowed { new_balance: next })
    }

    async fn force_add(&self, key: &BudgetKey, amount: Micros) -> Result<(), String> {
        let mut balances = self.balances.lock().await;
        let entry = balances.entry(*key).or_insert(0);
        *entry = entry.saturating_add(amount);
        Ok(())
    }

    async fn subtract(&self, key: &BudgetKey, amount: Micros) -> Result<(), String> {
        let mut balances = self.balances.lock().await;
        let entry = balances.entry(*key).or_insert(0);
        *entry = entry.saturating_sub(amount).max(0);
        Ok(())
    }

    async fn current(&self, key: &BudgetKey) -> Result<Micros, String> {
        Ok(self.balances.lock().await.get(key).copied().unwrap_or(0))
    }
}

/// Observer for ledger events that warrant an audit marker.
///
/// Callbacks are synchronous and must not block; the telemetry queue
/// implements this with a non-blocking enqueue.
pub trait LedgerObserver: Send + Sync {
    /// A pending reservation expired and its amount was reclaimed.
    fn reservation_expired(&self, user_id: Uuid, amount_micros: Micros);
    /// A commit exceeded its reservation; `clamped` when beyond slack.
    fn commit_overrun(
        &self,
        user_id: Uuid,
        reserved_micros: Micros,
        actual_micros: Micros,
        clamped: bool,
    );
}

/// Observer that only logs. Default when no telemetry queue is wired.
pub struct LogOnlyObserver;

impl LedgerObserver for LogOnlyObserver {
    fn reservation_expired(&self, user_id: Uuid, amount_micros: Micros) {
        warn!(user = %user_id, amount_micros, "expired reservation reclaimed");
    }

    fn commit_overrun(
        &self,
        user_id: Uuid,
        reserved_micros: Micros,
        actual_micros: Micros,
        clamped: bool,
    ) {
        warn!(
            user = %user_id,
            reserved_micros,
            actual_micros,
            clamped,
            "commit exceeded reservation"
        );
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReservationState {
    Pending,
    Committed,
    Refunded,
    Expired,
}

#[derive(Debug, Clone)]
struct ReservationEntry {
    key: BudgetKey,
    amount_micros: Micros,
    expires_at: DateTime<Utc>,
    state: ReservationState,
}

/// Ledger configuration.
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// Daily spend cap per user, micro-units.
    pub daily_limit_micros: Micros,
    /// How long a reservation may stay pending.
    pub reserve_grace: Duration,
    /// Tolerated commit overrun before clamping.
    pub commit_slack_micros: Micros,
}

/// The budget ledger. See module docs for the protocol and the
/// cancellation model.
pub struct BudgetLedger {
    core: Arc<LedgerCore>,
}

impl BudgetLedger {
    /// Build a ledger over a counter with a log-only observer.
    pub fn new(counter: Arc<dyn SpendCounter>, config: LedgerConfig) -> Self {
        Self::with_observer(counter, config, Arc::new(LogOnlyObserver))
    }

    /// Build a ledger with an explicit event observer.
    pub fn with_observer(
        counter: Arc<dyn SpendCounter>,
        config: LedgerConfig,
        observer: Arc<dyn LedgerObserver>,
    ) -> Self {
        Self {
            core: Arc::new(LedgerCore {
                counter,
                config,
                reservations: std::sync::Mutex::new(HashMap::new()),
                observer,
            }),
        }
    }

    /// Reserve `amount_micros` against the user's budget for today.
    ///
    /// The counter performs the atomic check-and-increment; the reservation
    /// is recorded before any caller can observe the new balance, and the
    /// whole sequence runs detached, so a caller that times out or
    /// disconnects leaves behind a tracked reservation (reclaimed by
    /// auto-refund), never an untracked increment.
    ///
    /// # Errors
    ///
    /// [`LedgerError::BudgetExceeded`] when the day's limit would be
    /// breached (nothing is mutated), [`LedgerError::Counter`] when the
    /// counter is unreachable (the ledger fails closed).
    pub async fn reserve(
        &self,
        user_id: Uuid,
        amount_micros: Micros,
    ) -> Result<BudgetReservation, LedgerError> {
        let core = Arc::clone(&self.core);
        detached(async move { core.reserve(user_id, amount_micros).await }).await
    }

    /// Record the actual cost for a reservation.
    ///
    /// `actual_micros` below the reservation releases the difference; above
    /// it is honored up to the configured slack, beyond which the recorded
    /// amount is clamped and the overrun reported to the observer. A commit
    /// never fails an already-served response: clamping is the worst case.
    ///
    /// # Errors
    ///
    /// [`LedgerError::UnknownReservation`] or [`LedgerError::AlreadySettled`]
    /// when the reservation cannot take this transition, or
    /// [`LedgerError::Counter`] on counter failure.
    pub async fn commit(
        &self,
        reservation_id: Uuid,
        actual_micros: Micros,
    ) -> Result<(), LedgerError> {
        let core = Arc::clone(&self.core);
        detached(async move { core.commit(reservation_id, actual_micros).await }).await
    }

    /// Release a reservation in full.
    ///
    /// # Errors
    ///
    /// Same contract as [`commit`](Self::commit).
    pub async fn refund(&self, reservation_id: Uuid) -> Result<(), LedgerError> {
        let core = Arc::clone(&self.core);
        detached(async move { core.refund(reservation_id).await }).await
    }

    /// Current recorded spend for the user today.
    ///
    /// # Errors
    ///
    /// [`LedgerError::Counter`] on counter failure.
    pub async fn spent_today(&self, user_id: Uuid) -> Result<Micros, LedgerError> {
        let core = Arc::clone(&self.core);
        detached(async move { core.spent_today(user_id).await }).await
    }
}

/// Run a ledger operation to completion regardless of caller cancellation.
///
/// Dropping the returned future abandons the observation only; the spawned
/// operation still finishes, so counter mutations and their bookkeeping
/// always land together.
async fn detached<T, F>(op: F) -> Result<T, LedgerError>
where
    T: Send + 'static,
    F: Future<Output = Result<T, LedgerError>> + Send + 'static,
{
    tokio::spawn(op)
        .await
        .unwrap_or_else(|err| Err(LedgerError::Counter(format!("ledger task failed: {err}"))))
}

/// The ledger state shared with detached operation tasks.
struct LedgerCore {
    counter: Arc<dyn SpendCounter>,
    config: LedgerConfig,
    /// Synchronous mutex: bookkeeping between counter calls must not
    /// introduce a suspension point.
    reservations: std::sync::Mutex<HashMap<Uuid, ReservationEntry>>,
    observer: Arc<dyn LedgerObserver>,
}

impl LedgerCore {
    /// Reservation entries are plain state; keep using them after a panic
    /// elsewhere.
    fn lock_reservations(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, ReservationEntry>> {
        self.reservations
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    async fn reserve(
        &self,
        user_id: Uuid,
        amount_micros: Micros,
    ) -> Result<BudgetReservation, LedgerError> {
        debug_assert!(amount_micros >= 0, "negative reservation amount");
        let key = BudgetKey::today(user_id);
        self.reclaim_expired(user_id).await?;

        let verdict = self
            .counter
            .try_add(&key, amount_micros, self.config.daily_limit_micros)
            .await
            .map_err(LedgerError::Counter)?;

        match verdict {
            CounterVerdict::Rejected { current } => Err(LedgerError::BudgetExceeded {
                spent_micros: current,
                limit_micros: self.config.daily_limit_micros,
            }),
            CounterVerdict::Allowed { new_balance } => {
                let reservation_id = Uuid::new_v4();
                let expires_at = Utc::now()
                    + chrono::Duration::from_std(self.config.reserve_grace)
                        .unwrap_or_else(|_| chrono::Duration::seconds(120));
                // No await between the increment above and this insert: the
                // entry exists before anyone can observe the new balance.
                self.lock_reservations().insert(
                    reservation_id,
                    ReservationEntry {
                        key,
                        amount_micros,
                        expires_at,
                        state: ReservationState::Pending,
                    },
                );
                debug!(
                    user = %user_id,
                    reservation = %reservation_id,
                    amount_micros,
                    new_balance,
                    "budget reserved"
                );
                Ok(BudgetReservation {
                    reservation_id,
                    user_id,
                    amount_micros,
                    expires_at,
                })
            }
        }
    }

    async fn commit(
        &self,
        reservation_id: Uuid,
        actual_micros: Micros,
    ) -> Result<(), LedgerError> {
        let (key, reserved) = {
            let mut reservations = self.lock_reservations();
            let entry = reservations
                .get_mut(&reservation_id)
                .ok_or(LedgerError::UnknownReservation(reservation_id))?;
            if entry.state != ReservationState::Pending {
                return Err(LedgerError::AlreadySettled(reservation_id));
            }
            entry.state = ReservationState::Committed;
            (entry.key, entry.amount_micros)
        };

        if actual_micros <= reserved {
            let release = reserved - actual_micros;
            if release > 0 {
                self.counter
                    .subtract(&key, release)
                    .await
                    .map_err(LedgerError::Counter)?;
            }
        } else {
            let overrun = actual_micros - reserved;
            let clamped = overrun > self.config.commit_slack_micros;
            let extra = overrun.min(self.config.commit_slack_micros);
            if extra > 0 {
                self.counter
                    .force_add(&key, extra)
                    .await
                    .map_err(LedgerError::Counter)?;
            }
            self.observer
                .commit_overrun(key.user_id, reserved, actual_micros, clamped);
        }
        debug!(reservation = %reservation_id, actual_micros, "budget committed");
        Ok(())
    }

    async fn refund(&self, reservation_id: Uuid) -> Result<(), LedgerError> {
        let (key, reserved) = {
            let mut reservations = self.lock_reservations();
            let entry = reservations
                .get_mut(&reservation_id)
                .ok_or(LedgerError::UnknownReservation(reservation_id))?;
            if entry.state != ReservationState::Pending {
                return Err(LedgerError::AlreadySettled(reservation_id));
            }
            entry.state = ReservationState::Refunded;
            (entry.key, entry.amount_micros)
        };
        self.counter
            .subtract(&key, reserved)
            .await
            .map_err(LedgerError::Counter)?;
        debug!(reservation = %reservation_id, reserved, "budget refunded");
        Ok(())
    }

    async fn spent_today(&self, user_id: Uuid) -> Result<Micros, LedgerError> {
        self.reclaim_expired(user_id).await?;
        self.counter
            .current(&BudgetKey::today(user_id))
            .await
            .map_err(LedgerError::Counter)
    }

    /// Reclaim the user's expired pending reservations and prune settled
    /// entries older than a day.
    async fn reclaim_expired(&self, user_id: Uuid) -> Result<(), LedgerError> {
        let now = Utc::now();
        let mut to_release: Vec<(BudgetKey, Micros)> = Vec::new();
        {
            let mut reservations = self.lock_reservations();
            for entry in reservations.values_mut() {
                if entry.key.user_id == user_id
                    && entry.state == ReservationState::Pending
                    && entry.expires_at <= now
                {
                    entry.state = ReservationState::Expired;
                    to_release.push((entry.key, entry.amount_micros));
                }
            }
            reservations.retain(|_, entry| {
                entry.state == ReservationState::Pending
                    || now.signed_duration_since(entry.expires_at) < chrono::Duration::days(1)
            });
        }
        for (key, amount) in to_release {
            self.counter
                .subtract(&key, amount)
                .await
                .map_err(LedgerError::Counter)?;
            self.observer.reservation_expired(key.user_id, amount);
        }
        Ok(())
    }
}

/// Pipeline-owned handle that guarantees reconciliation.
///
/// Dropping an unsettled guard schedules a refund on the runtime, covering
/// client cancellation between reserve and commit; the ledger's auto-refund
/// remains the backstop if even that task never runs.
pub struct ReservationGuard {
    ledger: Arc<BudgetLedger>,
    reservation: BudgetReservation,
    settled: bool,
}

impl ReservationGuard {
    /// Wrap a fresh reservation.
    pub fn new(ledger: Arc<BudgetLedger>, reservation: BudgetReservation) -> Self {
        Self {
            ledger,
            reservation,
            settled: false,
        }
    }

    /// The wrapped reservation.
    pub fn reservation(&self) -> &BudgetReservation {
        &self.reservation
    }

    /// Commit the actual cost, consuming the guard.
    ///
    /// # Errors
    ///
    /// Propagates [`BudgetLedger::commit`] errors.
    pub async fn commit(mut self, actual_micros: Micros) -> Result<(), LedgerError> {
        self.settled = true;
        self.ledger
            .commit(self.reservation.reservation_id, actual_micros)
            .await
    }

    /// Refund in full, consuming the guard.
    ///
    /// # Errors
    ///
    /// Propagates [`BudgetLedger::refund`] errors.
    pub async fn refund(mut self) -> Result<(), LedgerError> {
        self.settled = true;
        self.ledger.refund(self.reservation.reservation_id).await
    }
}

impl Drop for ReservationGuard {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let ledger = Arc::clone(&self.ledger);
        let id = self.reservation.reservation_id;
        warn!(reservation = %id, "reservation guard dropped unsettled; scheduling refund");
        tokio::spawn(async move {
            if let Err(err) = ledger.refund(id).await {
                warn!(reservation = %id, error = %err, "drop-refund failed; auto-refund will reclaim");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger_with(limit: Micros, grace: Duration, slack: Micros) -> (Arc<InMemoryCounter>, BudgetLedger) {
        let counter = Arc::new(InMemoryCounter::new());
        let ledger = BudgetLedger::new(
            Arc::clone(&counter) as Arc<dyn SpendCounter>,
            LedgerConfig {
                daily_limit_micros: limit,
                reserve_grace: grace,
                commit_slack_micros: slack,
            },
        );
        (counter, ledger)
    }

    #[tokio::test]
    async fn reserve_respects_limit_without_mutating() {
        let (counter, ledger) = ledger_with(1_000_000, Duration::from_secs(60), 0);
        let user = Uuid::new_v4();
        counter.seed(BudgetKey::today(user), 999_999).await;

        let err = ledger.reserve(user, 10_000).await.expect_err("over limit");
        assert!(matches!(err, LedgerError::BudgetExceeded { spent_micros: 999_999, .. }));
        assert_eq!(ledger.spent_today(user).await.expect("spend"), 999_999);
    }

    #[tokio::test]
    async fn commit_below_reservation_releases_difference() {
        let (_, ledger) = ledger_with(1_000_000, Duration::from_secs(60), 0);
        let user = Uuid::new_v4();
        let reservation = ledger.reserve(user, 100_000).await.expect("reserve");
        ledger
            .commit(reservation.reservation_id, 40_000)
            .await
            .expect("commit");
        assert_eq!(ledger.spent_today(user).await.expect("spend"), 40_000);
    }

    #[tokio::test]
    async fn commit_overrun_within_slack_is_recorded() {
        let (_, ledger) = ledger_with(10_000_000, Duration::from_secs(60), 50_000);
        let user = Uuid::new_v4();
        let reservation = ledger.reserve(user, 100_000).await.expect("reserve");
        ledger
            .commit(reservation.reservation_id, 120_000)
            .await
            .expect("commit");
        assert_eq!(ledger.spent_today(user).await.expect("spend"), 120_000);
    }

    #[tokio::test]
    async fn commit_overrun_beyond_slack_clamps() {
        let (_, ledger) = ledger_with(10_000_000, Duration::from_secs(60), 50_000);
        let user = Uuid::new_v4();
        let reservation = ledger.reserve(user, 100_000).await.expect("reserve");
        ledger
            .commit(reservation.reservation_id, 400_000)
            .await
            .expect("commit never fails the response");
        assert_eq!(ledger.spent_today(user).await.expect("spend"), 150_000);
    }

    #[tokio::test]
    async fn refund_releases_full_amount() {
        let (_, ledger) = ledger_with(1_000_000, Duration::from_secs(60), 0);
        let user = Uuid::new_v4();
        let reservation = ledger.reserve(user, 250_000).await.expect("reserve");
        ledger.refund(reservation.reservation_id).await.expect("refund");
        assert_eq!(ledger.spent_today(user).await.expect("spend"), 0);
    }

    #[tokio::test]
    async fn exactly_one_terminal_transition() {
        let (_, ledger) = ledger_with(1_000_000, Duration::from_secs(60), 0);
        let user = Uuid::new_v4();
        let reservation = ledger.reserve(user, 100_000).await.expect("reserve");
        ledger.commit(reservation.reservation_id, 100_000).await.expect("commit");
        assert!(matches!(
            ledger.refund(reservation.reservation_id).await,
            Err(LedgerError::AlreadySettled(_))
        ));
        assert!(matches!(
            ledger.commit(reservation.reservation_id, 1).await,
            Err(LedgerError::AlreadySettled(_))
        ));
    }

    #[tokio::test]
    async fn expired_reservation_is_reclaimed_on_next_access() {
        let (_, ledger) = ledger_with(1_000_000, Duration::from_millis(10), 0);
        let user = Uuid::new_v4();
        let reservation = ledger.reserve(user, 900_000).await.expect("reserve");
        tokio::time::sleep(Duration::from_millis(30)).await;

        // Next access sweeps the expired reservation first, freeing budget.
        let second = ledger.reserve(user, 800_000).await.expect("reclaimed");
        assert_eq!(
            ledger.spent_today(user).await.expect("spend"),
            800_000
        );
        assert!(matches!(
            ledger.commit(reservation.reservation_id, 1).await,
            Err(LedgerError::AlreadySettled(_))
        ));
        ledger.refund(second.reservation_id).await.expect("refund");
    }

    #[tokio::test]
    async fn budget_conservation_over_interleavings() {
        let (_, ledger) = ledger_with(100_000_000, Duration::from_secs(60), 10_000);
        let user = Uuid::new_v4();

        let mut committed_total: Micros = 0;
        for i in 0..20i64 {
            let reservation = ledger.reserve(user, 50_000).await.expect("reserve");
            if i % 3 == 0 {
                ledger.refund(reservation.reservation_id).await.expect("refund");
            } else {
                let actual = 10_000 + i * 1_000;
                ledger
                    .commit(reservation.reservation_id, actual)
                    .await
                    .expect("commit");
                committed_total += actual;
            }
        }
        assert_eq!(
            ledger.spent_today(user).await.expect("spend"),
            committed_total
        );
    }

    #[tokio::test]
    async fn guard_drop_schedules_refund() {
        let (counter, ledger) = ledger_with(1_000_000, Duration::from_secs(60), 0);
        let ledger = Arc::new(ledger);
        let user = Uuid::new_v4();
        let reservation = ledger.reserve(user, 100_000).await.expect("reserve");
        drop(ReservationGuard::new(Arc::clone(&ledger), reservation));
        // The refund runs as a spawned task; yield until it lands.
        for _ in 0..50 {
            tokio::task::yield_now().await;
            if counter.current(&BudgetKey::today(user)).await.unwrap() == 0 {
                return;
            }
        }
        panic!("drop-refund never ran");
    }

    /// Counter that stalls inside `try_add`, so a caller-side timeout can
    /// fire mid-operation.
    struct SlowCounter {
        inner: InMemoryCounter,
        delay: Duration,
    }

    #[async_trait]
    impl SpendCounter for SlowCounter {
        async fn try_add(
            &self,
            key: &BudgetKey,
            amount: Micros,
            limit: Micros,
        ) -> Result<CounterVerdict, String> {
            tokio::time::sleep(self.delay).await;
            self.inner.try_add(key, amount, limit).await
        }

        async fn force_add(&self, key: &BudgetKey, amount: Micros) -> Result<(), String> {
            self.inner.force_add(key, amount).await
        }

        async fn subtract(&self, key: &BudgetKey, amount: Micros) -> Result<(), String> {
            self.inner.subtract(key, amount).await
        }

        async fn current(&self, key: &BudgetKey) -> Result<Micros, String> {
            self.inner.current(key).await
        }
    }

    #[tokio::test]
    async fn abandoned_reserve_still_lands_tracked_and_reclaimable() {
        let counter = Arc::new(SlowCounter {
            inner: InMemoryCounter::new(),
            delay: Duration::from_millis(40),
        });
        let ledger = BudgetLedger::new(
            Arc::clone(&counter) as Arc<dyn SpendCounter>,
            LedgerConfig {
                daily_limit_micros: 1_000_000,
                reserve_grace: Duration::from_millis(10),
                commit_slack_micros: 0,
            },
        );
        let user = Uuid::new_v4();

        // The caller gives up long before the counter answers.
        let abandoned =
            tokio::time::timeout(Duration::from_millis(5), ledger.reserve(user, 600_000)).await;
        assert!(abandoned.is_err(), "caller deadline fires first");

        // The detached operation still completes: the increment lands with
        // its bookkeeping, and the untouched reservation auto-refunds.
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(ledger.spent_today(user).await.expect("spend"), 0);
        let retry = ledger.reserve(user, 900_000).await.expect("budget fully usable");
        ledger.refund(retry.reservation_id).await.expect("refund");
    }
}
