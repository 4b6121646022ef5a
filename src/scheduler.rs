//! One timer task per eligible room, firing at the configured local
//! wall-clock time once a day. Reload tears all timers down and rebuilds
//! them from the current room table, so access changes take effect without
//! a restart.

use crate::store::RoomConfigStore;
use async_trait::async_trait;
use chrono::{DateTime, Local, NaiveDate, NaiveTime};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Deadline for one scheduled run; a wedged job must not block tomorrow's.
const JOB_DEADLINE: Duration = Duration::from_secs(20 * 60);

/// What the scheduler fires. Implemented by the service; faked in tests.
#[async_trait]
pub trait DailyJobRunner: Send + Sync {
    async fn run_daily(&self, room_id: &str);
}

pub struct Scheduler {
    runner: Arc<dyn DailyJobRunner>,
    store: Arc<RoomConfigStore>,
    fire_at: NaiveTime,
    timers: std::sync::Mutex<HashMap<String, JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(
        runner: Arc<dyn DailyJobRunner>,
        store: Arc<RoomConfigStore>,
        fire_at: NaiveTime,
    ) -> Self {
        Self {
            runner,
            store,
            fire_at,
            timers: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Rebuilds the timer set from the room table. Idempotent: calling it
    /// twice in a row yields exactly one timer per eligible room.
    pub fn reload(&self) {
        let rooms = self.store.schedulable_rooms();
        let mut timers = self.timers.lock().unwrap_or_else(|e| e.into_inner());
        for handle in timers.drain().map(|(_, handle)| handle) {
            handle.abort();
        }
        for room in rooms {
            let runner = Arc::clone(&self.runner);
            let fire_at = self.fire_at;
            let handle = tokio::spawn(run_room_timer(runner, room.clone(), fire_at));
            timers.insert(room, handle);
        }
        info!(timers = timers.len(), at = %self.fire_at, "scheduler reloaded");
    }

    pub fn stop(&self) {
        let mut timers = self.timers.lock().unwrap_or_else(|e| e.into_inner());
        for handle in timers.drain().map(|(_, handle)| handle) {
            handle.abort();
        }
    }

    pub fn armed_rooms(&self) -> Vec<String> {
        let timers = self.timers.lock().unwrap_or_else(|e| e.into_inner());
        let mut rooms: Vec<String> = timers.keys().cloned().collect();
        rooms.sort();
        rooms
    }

    /// Immediate one-shot run, outside any timer. Used by the test command.
    pub async fn run_once(&self, room_id: &str) {
        run_guarded(self.runner.as_ref(), room_id).await;
    }
}

async fn run_room_timer(runner: Arc<dyn DailyJobRunner>, room_id: String, fire_at: NaiveTime) {
    let mut last_run: Option<NaiveDate> = None;
    loop {
        let now = Local::now();
        let delay = until_next(now, fire_at);
        info!(
            room = room_id,
            wait = %humantime::format_duration(Duration::from_secs(delay.as_secs())),
            "next scheduled analysis"
        );
        tokio::time::sleep(delay).await;

        let today = Local::now().date_naive();
        if last_run == Some(today) {
            // Clock adjustments can re-fire within the same day.
            continue;
        }
        last_run = Some(today);
        run_guarded(runner.as_ref(), &room_id).await;
    }
}

async fn run_guarded(runner: &dyn DailyJobRunner, room_id: &str) {
    if tokio::time::timeout(JOB_DEADLINE, runner.run_daily(room_id))
        .await
        .is_err()
    {
        warn!(room = room_id, "scheduled analysis hit its deadline");
    }
}

/// Time until the next local occurrence of `at`, from `now`.
fn until_next(now: DateTime<Local>, at: NaiveTime) -> Duration {
    let now_naive = now.naive_local();
    let mut next = now_naive.date().and_time(at);
    if next <= now_naive {
        next += chrono::Duration::days(1);
    }
    (next - now_naive).to_std().unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GroupAccessSettings;
    use chrono::TimeZone;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingRunner {
        runs: AtomicUsize,
    }

    #[async_trait]
    impl DailyJobRunner for CountingRunner {
        async fn run_daily(&self, _room_id: &str) {
            self.runs.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn store_with_rooms(name: &str, rooms: &[&str]) -> Arc<RoomConfigStore> {
        let path = PathBuf::from(std::env::temp_dir().join(format!(
            "roomdigest-sched-{name}-{}.toml",
            std::process::id()
        )));
        let _ = std::fs::remove_file(&path);
        let settings = GroupAccessSettings {
            mode: "whitelist".to_string(),
            list: rooms.iter().map(|s| s.to_string()).collect(),
        };
        Arc::new(RoomConfigStore::load(&path, &settings).unwrap())
    }

    #[test]
    fn until_next_rolls_over_midnight() {
        let at = NaiveTime::from_hms_opt(9, 0, 0).unwrap();

        let before = Local.with_ymd_and_hms(2026, 8, 29, 8, 0, 0).unwrap();
        assert_eq!(until_next(before, at), Duration::from_secs(3600));

        let after = Local.with_ymd_and_hms(2026, 8, 29, 10, 0, 0).unwrap();
        assert_eq!(until_next(after, at), Duration::from_secs(23 * 3600));

        let exact = Local.with_ymd_and_hms(2026, 8, 29, 9, 0, 0).unwrap();
        assert_eq!(until_next(exact, at), Duration::from_secs(24 * 3600));
    }

    #[tokio::test]
    async fn reload_is_idempotent() {
        let store = store_with_rooms("idem", &["!a:x", "!b:x"]);
        let runner = Arc::new(CountingRunner {
            runs: AtomicUsize::new(0),
        });
        let scheduler = Scheduler::new(
            runner,
            store,
            NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
        );

        scheduler.reload();
        scheduler.reload();
        assert_eq!(
            scheduler.armed_rooms(),
            vec!["!a:x".to_string(), "!b:x".to_string()]
        );
        scheduler.stop();
        assert!(scheduler.armed_rooms().is_empty());
    }

    #[tokio::test]
    async fn disabled_room_is_not_armed() {
        let store = store_with_rooms("disable", &["!a:x", "!b:x"]);
        store.disable("!b:x").await.unwrap();
        let runner = Arc::new(CountingRunner {
            runs: AtomicUsize::new(0),
        });
        let scheduler = Scheduler::new(
            runner,
            store,
            NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
        );
        scheduler.reload();
        assert_eq!(scheduler.armed_rooms(), vec!["!a:x".to_string()]);
        scheduler.stop();
    }

    #[tokio::test]
    async fn run_once_invokes_runner() {
        let store = store_with_rooms("once", &["!a:x"]);
        let runner = Arc::new(CountingRunner {
            runs: AtomicUsize::new(0),
        });
        let scheduler = Scheduler::new(
            runner.clone(),
            store,
            NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
        );
        scheduler.run_once("!a:x").await;
        assert_eq!(runner.runs.load(Ordering::SeqCst), 1);
    }
}
