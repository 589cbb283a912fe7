//! Daily run scheduling.
//!
//! The scheduler wakes up every poll interval, compares the local wall clock
//! against the next scheduled time, and runs the pipeline when it is due.
//! Runs are awaited inline, so two runs never overlap.

use std::future::Future;
use std::time::Duration;

use chrono::{Days, Local, NaiveDateTime, NaiveTime};
use tracing::{error, info};

use crate::config::Config;
use crate::pipeline::Pipeline;

/// Returns the first occurrence of `time` strictly after `now`.
///
/// ```
/// use chrono::{NaiveDate, NaiveTime};
/// use ipsw_downloader_core::scheduler::next_run_after;
///
/// let now = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap().and_hms_opt(8, 0, 0).unwrap();
/// let next = next_run_after(now, NaiveTime::MIN);
/// assert_eq!(next, NaiveDate::from_ymd_opt(2024, 3, 2).unwrap().and_hms_opt(0, 0, 0).unwrap());
/// ```
#[must_use]
pub fn next_run_after(now: NaiveDateTime, time: NaiveTime) -> NaiveDateTime {
    let today = now.date().and_time(time);
    if today > now {
        return today;
    }
    today
        .checked_add_days(Days::new(1))
        .unwrap_or(NaiveDateTime::MAX)
}

/// Runs a job at startup and then once a day.
#[derive(Debug, Clone)]
pub struct Scheduler {
    daily_time: NaiveTime,
    poll_interval: Duration,
    run_on_startup: bool,
}

impl Scheduler {
    /// Creates a scheduler firing daily at `daily_time` local time.
    #[must_use]
    pub fn new(daily_time: NaiveTime, poll_interval: Duration, run_on_startup: bool) -> Self {
        Self {
            daily_time,
            poll_interval,
            run_on_startup,
        }
    }

    /// Creates a scheduler from the `schedule_time`, `poll_interval_secs` and
    /// `run_on_startup` settings.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.schedule_time,
            config.poll_interval(),
            config.run_on_startup,
        )
    }

    /// Runs `pipeline` on schedule until Ctrl-C.
    pub async fn run_forever(&self, pipeline: &Pipeline) {
        self.run_until(move || pipeline.run_logged(), shutdown_signal())
            .await;
    }

    /// Runs `job` on schedule until `shutdown` resolves.
    ///
    /// A job in progress when `shutdown` resolves is dropped.
    pub async fn run_until<J, Fut, S>(&self, mut job: J, shutdown: S)
    where
        J: FnMut() -> Fut,
        Fut: Future<Output = ()>,
        S: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        if self.run_on_startup {
            info!("running startup pass");
            tokio::select! {
                () = &mut shutdown => return stopped(),
                () = job() => {}
            }
        }

        let mut next = next_run_after(Local::now().naive_local(), self.daily_time);
        info!(next_run = %next, "scheduled next run");

        loop {
            tokio::select! {
                () = &mut shutdown => return stopped(),
                () = tokio::time::sleep(self.poll_interval) => {}
            }

            if Local::now().naive_local() < next {
                continue;
            }

            info!(scheduled_for = %next, "starting scheduled run");
            tokio::select! {
                () = &mut shutdown => return stopped(),
                () = job() => {}
            }

            next = next_run_after(Local::now().naive_local(), self.daily_time);
            info!(next_run = %next, "scheduled next run");
        }
    }
}

fn stopped() {
    info!("shutdown requested, scheduler stopped");
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        error!(%error, "cannot listen for Ctrl-C, running until killed");
        std::future::pending::<()>().await;
    }
}
