//! Daily trigger for evaluation passes
//!
//! A [`Scheduler`] owns one background thread that wakes every
//! `poll_interval_ms`, fires the job when the next cron time has passed and
//! exits promptly once [`Scheduler::stop`] is called. Cron expressions use the
//! five-field format (minute hour day month weekday) and are interpreted in the
//! configured IANA zone, UTC by default.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;

use crate::config::SchedulerConfig;
use crate::error::{Error, Result};

/// Parse the cron expression and zone of a scheduler section.
pub fn parse_schedule(config: &SchedulerConfig) -> Result<(Schedule, Tz)> {
    // The cron crate wants a leading seconds field
    let full_expr = format!("0 {}", config.cron.trim());
    let schedule = full_expr.parse::<Schedule>().map_err(|e| {
        Error::Config(format!("invalid cron expression '{}': {}", config.cron, e))
    })?;

    let tz = match config.timezone.as_deref() {
        None => Tz::UTC,
        Some(name) => name
            .parse::<Tz>()
            .map_err(|e| Error::Config(format!("invalid scheduler timezone '{}': {}", name, e)))?,
    };

    Ok((schedule, tz))
}

/// Snapshot of a scheduler's state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerStatus {
    pub running: bool,
    pub next_run: Option<DateTime<Utc>>,
    pub last_run: Option<DateTime<Utc>>,
    /// Jobs fired since start
    pub runs: u64,
}

struct Shared {
    stop: AtomicBool,
    status: Mutex<SchedulerStatus>,
}

impl Shared {
    fn update(&self, f: impl FnOnce(&mut SchedulerStatus)) {
        f(&mut self.status.lock().unwrap_or_else(|e| e.into_inner()));
    }
}

/// Cron-driven trigger running a job on its own thread.
pub struct Scheduler {
    schedule: Schedule,
    tz: Tz,
    poll_interval: Duration,
    run_on_start: bool,
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

impl Scheduler {
    pub fn new(config: &SchedulerConfig) -> Result<Self> {
        let (schedule, tz) = parse_schedule(config)?;
        Ok(Self {
            schedule,
            tz,
            poll_interval: Duration::from_millis(config.poll_interval_ms.max(10)),
            run_on_start: config.run_on_start,
            shared: Arc::new(Shared {
                stop: AtomicBool::new(false),
                status: Mutex::new(SchedulerStatus::default()),
            }),
            handle: None,
        })
    }

    /// First scheduled time strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        next_after(&self.schedule, self.tz, after)
    }

    /// Spawn the trigger thread. `job` receives the instant it was fired at.
    pub fn start<F>(&mut self, mut job: F) -> Result<()>
    where
        F: FnMut(DateTime<Utc>) + Send + 'static,
    {
        if self.handle.is_some() {
            return Err(Error::Scheduler("scheduler already running".to_string()));
        }

        self.shared.stop.store(false, Ordering::SeqCst);
        let first = self.next_after(Utc::now());
        self.shared.update(|s| {
            s.running = true;
            s.next_run = first;
        });

        let shared = self.shared.clone();
        let schedule = self.schedule.clone();
        let tz = self.tz;
        let poll_interval = self.poll_interval;
        let run_on_start = self.run_on_start;

        let handle = std::thread::Builder::new()
            .name("vigil-scheduler".to_string())
            .spawn(move || {
                tracing::info!(next_run = ?first, %tz, "Scheduler started");
                let mut next = first;

                let fire = |job: &mut F, at: DateTime<Utc>| {
                    job(at);
                    shared.update(|s| {
                        s.runs += 1;
                        s.last_run = Some(at);
                    });
                };

                if run_on_start {
                    fire(&mut job, Utc::now());
                }

                while !shared.stop.load(Ordering::SeqCst) {
                    let now = Utc::now();
                    match next {
                        Some(at) if now >= at => {
                            tracing::info!(scheduled = %at, "Scheduled run due");
                            fire(&mut job, now);
                            next = next_after(&schedule, tz, now);
                            shared.update(|s| s.next_run = next);
                        }
                        Some(_) => {}
                        None => {
                            tracing::warn!("Schedule has no upcoming times; stopping");
                            break;
                        }
                    }
                    std::thread::sleep(poll_interval);
                }

                shared.update(|s| s.running = false);
                tracing::info!("Scheduler stopped");
            })
            .map_err(|e| Error::Scheduler(format!("failed to spawn scheduler thread: {}", e)))?;

        self.handle = Some(handle);
        Ok(())
    }

    /// Ask the thread to exit and wait for it. A run in progress finishes first.
    pub fn stop(&mut self) -> Result<()> {
        self.shared.stop.store(true, Ordering::SeqCst);
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        handle
            .join()
            .map_err(|_| Error::Scheduler("scheduler thread panicked".to_string()))?;
        self.shared.update(|s| s.running = false);
        Ok(())
    }

    pub fn status(&self) -> SchedulerStatus {
        self.shared
            .status
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            tracing::warn!(error = %e, "Scheduler did not stop cleanly");
        }
    }
}

fn next_after(schedule: &Schedule, tz: Tz, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    schedule
        .after(&after.with_timezone(&tz))
        .next()
        .map(|t| t.with_timezone(&Utc))
}
