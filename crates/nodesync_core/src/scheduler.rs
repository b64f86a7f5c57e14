//! Debounced, deduplicated job runner.
//!
//! Each job key gets one actor task that owns a [`JobMachine`]. Commands
//! (`schedule`, `trigger`) are sent to the actor over a channel, so checking
//! whether a job is running and arming its timer happen in one place.
//!
//! - `schedule` registers a job and runs it once, soon. If the key is
//!   already registered it behaves like `trigger`.
//! - `trigger` runs an idle job after its debounce delay, or marks a
//!   running job for exactly one re-run.
//! - After a run: re-run requested → debounce; else repeat interval; else idle.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};

use crate::error::Result;

/// Boxed future returned by job runs and transports.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A unit of recurring or triggered work.
pub trait Job: Send + Sync + 'static {
    /// Deterministic key derived from the job's parameters.
    fn key(&self) -> String;

    /// Delay between a trigger and the run it causes.
    fn debounce(&self) -> Duration;

    /// Delay before repeating after a run. Consulted after every run, so a
    /// job may lengthen it to back off.
    fn interval(&self) -> Option<Duration>;

    fn run(&self) -> BoxFuture<'_, Result<()>>;
}

/// Scheduling state of one job key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Idle,
    Scheduled(Instant),
    Running,
    /// Running, with one more run requested.
    RunningRerun,
}

/// Pure state machine behind a job actor.
#[derive(Debug, Clone)]
pub struct JobMachine {
    state: JobState,
}

impl JobMachine {
    pub fn new() -> Self {
        Self {
            state: JobState::Idle,
        }
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    /// When the machine wants to be woken, if it is waiting on a timer.
    pub fn deadline(&self) -> Option<Instant> {
        match self.state {
            JobState::Scheduled(at) => Some(at),
            _ => None,
        }
    }

    /// Run as soon as possible.
    pub fn schedule(&mut self, now: Instant) {
        self.request(now);
    }

    /// Run after `debounce`, or once more after the current run.
    pub fn trigger(&mut self, now: Instant, debounce: Duration) {
        self.request(now + debounce);
    }

    fn request(&mut self, at: Instant) {
        self.state = match self.state {
            JobState::Idle => JobState::Scheduled(at),
            // An earlier deadline already covers this request.
            JobState::Scheduled(existing) => JobState::Scheduled(existing.min(at)),
            JobState::Running | JobState::RunningRerun => JobState::RunningRerun,
        };
    }

    /// Move to `Running` if the deadline has passed.
    pub fn start(&mut self, now: Instant) -> bool {
        match self.state {
            JobState::Scheduled(at) if at <= now => {
                self.state = JobState::Running;
                true
            }
            _ => false,
        }
    }

    pub fn finish(&mut self, now: Instant, debounce: Duration, interval: Option<Duration>) {
        self.state = match self.state {
            JobState::RunningRerun => JobState::Scheduled(now + debounce),
            JobState::Running => match interval {
                Some(interval) if !interval.is_zero() => JobState::Scheduled(now + interval),
                _ => JobState::Idle,
            },
            other => other,
        };
    }
}

impl Default for JobMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
enum Command {
    Schedule,
    Trigger,
    Stop,
}

struct JobHandle {
    tx: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
}

/// Registry of job actors keyed by [`Job::key`].
#[derive(Default)]
pub struct Scheduler {
    jobs: Mutex<HashMap<String, JobHandle>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    fn jobs(&self) -> std::sync::MutexGuard<'_, HashMap<String, JobHandle>> {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register `job` and run it soon; trigger it if already registered.
    ///
    /// Must be called from within a tokio runtime.
    pub fn schedule(&self, job: Arc<dyn Job>) {
        let key = job.key();
        let mut jobs = self.jobs();
        if let Some(handle) = jobs.get(&key)
            && handle.tx.send(Command::Trigger).is_ok()
        {
            return;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(Command::Schedule);
        log::debug!("scheduler: registered job {}", key);
        let task = tokio::spawn(run_actor(job, rx));
        jobs.insert(key, JobHandle { tx, task });
    }

    /// Trigger a registered job. Returns false if `key` is unknown.
    pub fn trigger(&self, key: &str) -> bool {
        self.jobs()
            .get(key)
            .is_some_and(|handle| handle.tx.send(Command::Trigger).is_ok())
    }

    pub fn is_registered(&self, key: &str) -> bool {
        self.jobs().contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.jobs().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Unregister a job. An in-flight run is allowed to finish.
    pub fn cancel(&self, key: &str) -> bool {
        match self.jobs().remove(key) {
            Some(handle) => {
                let _ = handle.tx.send(Command::Stop);
                true
            }
            None => false,
        }
    }

    /// Stop every job and wait for in-flight runs to finish.
    pub async fn shutdown(&self) {
        let handles: Vec<JobHandle> = self.jobs().drain().map(|(_, h)| h).collect();
        for handle in &handles {
            let _ = handle.tx.send(Command::Stop);
        }
        for handle in handles {
            let _ = handle.task.await;
        }
    }
}

async fn run_actor(job: Arc<dyn Job>, mut rx: mpsc::UnboundedReceiver<Command>) {
    let key = job.key();
    let mut machine = JobMachine::new();

    loop {
        let deadline = machine.deadline();
        tokio::select! {
            command = rx.recv() => match command {
                Some(Command::Schedule) => machine.schedule(Instant::now()),
                Some(Command::Trigger) => machine.trigger(Instant::now(), job.debounce()),
                Some(Command::Stop) | None => break,
            },
            _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                if !machine.start(Instant::now()) {
                    continue;
                }
                let mut run = job.run();
                let (result, stopping) = loop {
                    tokio::select! {
                        result = &mut run => break (result, false),
                        command = rx.recv() => match command {
                            Some(Command::Schedule) | Some(Command::Trigger) => {
                                machine.trigger(Instant::now(), job.debounce())
                            }
                            Some(Command::Stop) | None => break ((&mut run).await, true),
                        },
                    }
                };
                if let Err(e) = result {
                    log::warn!("job {} failed: {}", key, e);
                }
                if stopping {
                    break;
                }
                machine.finish(Instant::now(), job.debounce(), job.interval());
            }
        }
    }
    log::debug!("scheduler: job {} stopped", key);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::sleep;

    struct CountingJob {
        key: String,
        runs: AtomicUsize,
        active: AtomicUsize,
        max_active: AtomicUsize,
        work: Duration,
        debounce: Duration,
        interval: Option<Duration>,
    }

    impl CountingJob {
        fn new(work: Duration, interval: Option<Duration>) -> Arc<Self> {
            Arc::new(Self {
                key: "test.counting".into(),
                runs: AtomicUsize::new(0),
                active: AtomicUsize::new(0),
                max_active: AtomicUsize::new(0),
                work,
                debounce: Duration::from_millis(100),
                interval,
            })
        }

        fn runs(&self) -> usize {
            self.runs.load(Ordering::SeqCst)
        }
    }

    impl Job for CountingJob {
        fn key(&self) -> String {
            self.key.clone()
        }

        fn debounce(&self) -> Duration {
            self.debounce
        }

        fn interval(&self) -> Option<Duration> {
            self.interval
        }

        fn run(&self) -> BoxFuture<'_, Result<()>> {
            Box::pin(async move {
                self.runs.fetch_add(1, Ordering::SeqCst);
                let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
                self.max_active.fetch_max(active, Ordering::SeqCst);
                if !self.work.is_zero() {
                    sleep(self.work).await;
                }
                self.active.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            })
        }
    }

    #[test]
    fn test_machine_transitions() {
        let t0 = Instant::now();
        let debounce = Duration::from_millis(100);
        let mut m = JobMachine::new();
        assert!(!m.start(t0));

        m.trigger(t0, debounce);
        assert_eq!(m.deadline(), Some(t0 + debounce));
        assert!(!m.start(t0));
        // schedule pulls the deadline forward
        m.schedule(t0);
        assert!(m.start(t0));
        assert_eq!(m.state(), JobState::Running);

        m.trigger(t0, debounce);
        m.trigger(t0, debounce);
        assert_eq!(m.state(), JobState::RunningRerun);
        m.finish(t0, debounce, None);
        assert_eq!(m.state(), JobState::Scheduled(t0 + debounce));

        assert!(m.start(t0 + debounce));
        m.finish(t0 + debounce, debounce, Some(Duration::from_secs(5)));
        assert_eq!(
            m.state(),
            JobState::Scheduled(t0 + debounce + Duration::from_secs(5))
        );

        assert!(m.start(t0 + Duration::from_secs(10)));
        m.finish(t0, debounce, None);
        assert_eq!(m.state(), JobState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_runs_once_soon() {
        let scheduler = Scheduler::new();
        let job = CountingJob::new(Duration::ZERO, None);
        scheduler.schedule(job.clone());
        sleep(Duration::from_millis(10)).await;
        assert_eq!(job.runs(), 1);
        sleep(Duration::from_secs(10)).await;
        assert_eq!(job.runs(), 1);
        assert!(scheduler.is_registered("test.counting"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_trigger_burst_collapses() {
        let scheduler = Scheduler::new();
        let job = CountingJob::new(Duration::ZERO, None);
        scheduler.schedule(job.clone());
        sleep(Duration::from_millis(10)).await;

        for _ in 0..5 {
            assert!(scheduler.trigger("test.counting"));
        }
        sleep(Duration::from_millis(50)).await;
        assert_eq!(job.runs(), 1);
        sleep(Duration::from_millis(100)).await;
        assert_eq!(job.runs(), 2);
        sleep(Duration::from_secs(5)).await;
        assert_eq!(job.runs(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trigger_while_running_reruns_once() {
        let scheduler = Scheduler::new();
        let job = CountingJob::new(Duration::from_secs(1), None);
        scheduler.schedule(job.clone());
        sleep(Duration::from_millis(500)).await;
        assert_eq!(job.runs(), 1);

        for _ in 0..3 {
            scheduler.trigger("test.counting");
        }
        sleep(Duration::from_millis(550)).await;
        assert_eq!(job.runs(), 1);
        sleep(Duration::from_millis(100)).await;
        assert_eq!(job.runs(), 2);
        sleep(Duration::from_secs(5)).await;
        assert_eq!(job.runs(), 2);
        assert_eq!(job.max_active.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_repeats() {
        let scheduler = Scheduler::new();
        let job = CountingJob::new(Duration::ZERO, Some(Duration::from_secs(1)));
        scheduler.schedule(job.clone());
        sleep(Duration::from_millis(3500)).await;
        assert_eq!(job.runs(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_twice_acts_as_trigger() {
        let scheduler = Scheduler::new();
        let job = CountingJob::new(Duration::ZERO, None);
        scheduler.schedule(job.clone());
        sleep(Duration::from_millis(10)).await;
        scheduler.schedule(job.clone());
        sleep(Duration::from_millis(50)).await;
        assert_eq!(job.runs(), 1);
        sleep(Duration::from_millis(100)).await;
        assert_eq!(job.runs(), 2);
        assert_eq!(scheduler.keys(), vec!["test.counting".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_do_not_stop_the_job() {
        struct Failing(AtomicUsize);
        impl Job for Failing {
            fn key(&self) -> String {
                "test.failing".into()
            }
            fn debounce(&self) -> Duration {
                Duration::ZERO
            }
            fn interval(&self) -> Option<Duration> {
                Some(Duration::from_secs(1))
            }
            fn run(&self) -> BoxFuture<'_, Result<()>> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Box::pin(async { Err(SyncError::Transport("offline".into())) })
            }
        }

        let scheduler = Scheduler::new();
        let job = Arc::new(Failing(AtomicUsize::new(0)));
        scheduler.schedule(job.clone());
        sleep(Duration::from_millis(2500)).await;
        assert_eq!(job.0.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_and_shutdown() {
        let scheduler = Scheduler::new();
        let job = CountingJob::new(Duration::ZERO, Some(Duration::from_secs(1)));
        scheduler.schedule(job.clone());
        sleep(Duration::from_millis(10)).await;
        assert!(scheduler.cancel("test.counting"));
        assert!(!scheduler.trigger("test.counting"));
        sleep(Duration::from_secs(3)).await;
        assert_eq!(job.runs(), 1);
        scheduler.shutdown().await;
        assert!(scheduler.keys().is_empty());
    }
}
