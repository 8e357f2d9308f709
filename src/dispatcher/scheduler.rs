//! Periodic and appointment-driven keyword refresh.
//!
//! Appointments are one-shot and bucketed by whole second. Periodic items
//! sharing a period form one collection with a single next-event time. Both
//! are ordered by min-heaps; heap entries whose bucket or collection has
//! moved on are skipped when popped.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{Error, Result};

use super::Keyword;

/// Shortest accepted period.
pub const MIN_PERIOD: Duration = Duration::from_millis(100);
/// Consecutive periodic failures tolerated before an item is dropped.
pub const MAX_FAILURES: u32 = 5;

const MIN_SLEEP: Duration = Duration::from_millis(100);
const MAX_SLEEP: Duration = Duration::from_secs(300);

/// Something the scheduler can refresh.
pub trait Refresh: Send + Sync + 'static {
    fn label(&self) -> &str;
    fn refresh(&self) -> std::result::Result<(), String>;
}

impl Refresh for Keyword {
    fn label(&self) -> &str {
        self.name()
    }

    fn refresh(&self) -> std::result::Result<(), String> {
        self.update().map(|_| ()).map_err(|e| e.to_string())
    }
}

fn epoch_millis(time: SystemTime) -> i64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

struct Member<T> {
    item: Weak<T>,
    failures: u32,
}

struct Collection<T> {
    next_event: i64,
    members: Vec<Member<T>>,
    /// Taken for a run and not yet finished.
    running: bool,
}

/// Items due for refresh, taken from the state so they can run unlocked.
pub struct Due<T> {
    pub appointments: Vec<Arc<T>>,
    /// (period in ms, live members)
    pub periods: Vec<(i64, Vec<Arc<T>>)>,
}

/// Scheduling state, independent of any clock or task.
pub struct SchedulerState<T> {
    /// Whole second → items.
    appointments: HashMap<i64, Vec<Weak<T>>>,
    appointment_heap: BinaryHeap<Reverse<i64>>,
    /// Period in ms → collection.
    collections: HashMap<i64, Collection<T>>,
    /// (next event ms, period ms)
    period_heap: BinaryHeap<Reverse<(i64, i64)>>,
}

impl<T> Default for SchedulerState<T> {
    fn default() -> Self {
        Self {
            appointments: HashMap::new(),
            appointment_heap: BinaryHeap::new(),
            collections: HashMap::new(),
            period_heap: BinaryHeap::new(),
        }
    }
}

impl<T: Refresh> SchedulerState<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// One-shot refresh at `at` (truncated to the second).
    pub fn appointment(&mut self, item: &Arc<T>, at: SystemTime) {
        let second = epoch_millis(at).div_euclid(1000);
        let bucket = self.appointments.entry(second).or_insert_with(|| {
            self.appointment_heap.push(Reverse(second));
            Vec::new()
        });
        bucket.push(Arc::downgrade(item));
    }

    /// Refresh every `period`, first fire one period after `now`.
    pub fn period(&mut self, item: &Arc<T>, period: Duration, now: SystemTime) -> Result<()> {
        if period < MIN_PERIOD {
            return Err(Error::Dispatcher(format!(
                "period {period:?} for {} is shorter than {MIN_PERIOD:?}",
                item.label()
            )));
        }
        let period_ms = period.as_millis() as i64;

        let collection = self.collections.entry(period_ms).or_insert_with(|| {
            let next_event = epoch_millis(now) + period_ms;
            self.period_heap.push(Reverse((next_event, period_ms)));
            Collection {
                next_event,
                members: Vec::new(),
                running: false,
            }
        });

        let weak = Arc::downgrade(item);
        if !collection.members.iter().any(|m| m.item.ptr_eq(&weak)) {
            collection.members.push(Member {
                item: weak,
                failures: 0,
            });
        }
        Ok(())
    }

    /// Stop periodic refresh of `item`.
    pub fn remove_period(&mut self, item: &Arc<T>) {
        let weak = Arc::downgrade(item);
        for collection in self.collections.values_mut() {
            collection.members.retain(|m| !m.item.ptr_eq(&weak));
        }
    }

    pub fn period_count(&self) -> usize {
        self.collections.values().map(|c| c.members.len()).sum()
    }

    pub fn appointment_count(&self) -> usize {
        self.appointments.values().map(Vec::len).sum()
    }

    /// Earliest pending event, in ms since the epoch.
    pub fn next_event(&self) -> Option<i64> {
        let appointment = self.appointment_heap.peek().map(|Reverse(s)| s * 1000);
        let period = self.period_heap.peek().map(|Reverse((t, _))| *t);
        match (appointment, period) {
            (Some(a), Some(p)) => Some(a.min(p)),
            (a, p) => a.or(p),
        }
    }

    /// How long to sleep before the next event, within [0.1 s, 300 s].
    pub fn sleep_for(&self, now: SystemTime) -> Duration {
        match self.next_event() {
            Some(next) => {
                let wait = (next - epoch_millis(now)).max(0) as u64;
                Duration::from_millis(wait).clamp(MIN_SLEEP, MAX_SLEEP)
            }
            None => MAX_SLEEP,
        }
    }

    /// Remove and return everything due at `now`.
    pub fn take_due(&mut self, now: SystemTime) -> Due<T> {
        let now_ms = epoch_millis(now);
        let mut due = Due {
            appointments: Vec::new(),
            periods: Vec::new(),
        };

        while let Some(Reverse(second)) = self.appointment_heap.peek().copied() {
            if second * 1000 > now_ms {
                break;
            }
            self.appointment_heap.pop();
            if let Some(bucket) = self.appointments.remove(&second) {
                due.appointments
                    .extend(bucket.iter().filter_map(Weak::upgrade));
            }
        }

        while let Some(Reverse((next, period))) = self.period_heap.peek().copied() {
            if next > now_ms {
                break;
            }
            self.period_heap.pop();
            let Some(collection) = self.collections.get_mut(&period) else {
                continue;
            };
            if collection.next_event != next || collection.running {
                continue;
            }

            collection.members.retain(|m| m.item.strong_count() > 0);
            if collection.members.is_empty() {
                self.collections.remove(&period);
                continue;
            }
            collection.running = true;
            let items = collection
                .members
                .iter()
                .filter_map(|m| m.item.upgrade())
                .collect();
            due.periods.push((period, items));
        }

        due
    }

    /// Record the outcome of a periodic run and schedule the next fire.
    ///
    /// A run that overshot its period moves to the next period-aligned time
    /// after `finished` instead of firing repeatedly to catch up.
    pub fn finish_period(&mut self, period: i64, results: &[(Arc<T>, bool)], finished: SystemTime) {
        let Some(collection) = self.collections.get_mut(&period) else {
            return;
        };
        collection.running = false;

        for (item, ok) in results {
            let weak = Arc::downgrade(item);
            let Some(member) = collection.members.iter_mut().find(|m| m.item.ptr_eq(&weak)) else {
                continue;
            };
            if *ok {
                member.failures = 0;
            } else {
                member.failures += 1;
            }
        }

        collection.members.retain(|m| {
            let keep = m.failures <= MAX_FAILURES;
            if !keep {
                if let Some(item) = m.item.upgrade() {
                    warn!(item = item.label(), failures = m.failures, "Dropping from periodic refresh");
                }
            }
            keep
        });
        if collection.members.is_empty() {
            self.collections.remove(&period);
            return;
        }

        let finished_ms = epoch_millis(finished);
        let mut next = collection.next_event + period;
        if next <= finished_ms {
            next = (finished_ms.div_euclid(period) + 1) * period;
        }
        collection.next_event = next;
        self.period_heap.push(Reverse((next, period)));
    }
}

/// Run everything due at `now`. Refreshes run without the state lock held,
/// so an item may reschedule itself from inside its own refresh.
pub fn run_due<T: Refresh>(state: &Mutex<SchedulerState<T>>, now: SystemTime) -> usize {
    let due = state.lock().take_due(now);
    let mut ran = 0;

    for item in due.appointments {
        ran += 1;
        if let Err(e) = item.refresh() {
            warn!(item = item.label(), error = %e, "Appointment refresh failed");
        }
    }

    for (period, items) in due.periods {
        let results: Vec<(Arc<T>, bool)> = items
            .into_iter()
            .map(|item| {
                let ok = match item.refresh() {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(item = item.label(), error = %e, "Periodic refresh failed");
                        false
                    }
                };
                (item, ok)
            })
            .collect();
        ran += results.len();
        state
            .lock()
            .finish_period(period, &results, SystemTime::now().max(now));
    }
    ran
}

// ============================================================================
// Task
// ============================================================================

/// Handle to a dispatcher's scheduler.
#[derive(Clone)]
pub struct Scheduler {
    state: Arc<Mutex<SchedulerState<Keyword>>>,
    wake: Arc<Notify>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SchedulerState::new())),
            wake: Arc::new(Notify::new()),
        }
    }

    /// Refresh `keyword` once at `at`.
    pub fn appointment(&self, keyword: &Arc<Keyword>, at: SystemTime) {
        self.state.lock().appointment(keyword, at);
        self.wake.notify_one();
    }

    /// Refresh `keyword` every `period`.
    pub fn period(&self, keyword: &Arc<Keyword>, period: Duration) -> Result<()> {
        self.state
            .lock()
            .period(keyword, period, SystemTime::now())?;
        self.wake.notify_one();
        Ok(())
    }

    pub fn remove_period(&self, keyword: &Arc<Keyword>) {
        self.state.lock().remove_period(keyword);
    }

    pub fn period_count(&self) -> usize {
        self.state.lock().period_count()
    }

    pub(crate) fn spawn(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let state = Arc::clone(&self.state);
        let wake = Arc::clone(&self.wake);

        tokio::spawn(async move {
            loop {
                let sleep = state.lock().sleep_for(SystemTime::now());
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                        continue;
                    }
                    _ = wake.notified() => continue,
                    _ = tokio::time::sleep(sleep) => {}
                }

                let state = Arc::clone(&state);
                match tokio::task::spawn_blocking(move || run_due(&state, SystemTime::now())).await {
                    Ok(ran) if ran > 0 => debug!(ran, "Scheduled refreshes complete"),
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "Scheduler run failed"),
                }
            }
            debug!("Scheduler stopped");
        })
    }
}
