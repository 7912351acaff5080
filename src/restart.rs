//! Calendar-based self restart.
//!
//! A timer task signals the monitor loop when a configured time of day is
//! reached. The loop shuts the browser and MQTT connection down, and only
//! then is the process image replaced with a fresh copy of itself.

use crate::error::{AppError, Result};
use chrono::{Duration as ChronoDuration, Local, NaiveDateTime, NaiveTime};
use std::process::Command;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::info;

#[derive(Debug, Clone)]
struct Job {
    at: NaiveTime,
    next_run: NaiveDateTime,
}

#[derive(Debug, Clone)]
pub struct RestartSchedule {
    jobs: Vec<Job>,
}

impl RestartSchedule {
    pub fn new(times: &[NaiveTime], now: NaiveDateTime) -> Self {
        let jobs = times
            .iter()
            .map(|&at| Job {
                at,
                next_run: next_occurrence(at, now),
            })
            .collect();
        Self { jobs }
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Earliest pending trigger.
    pub fn next_run(&self) -> Option<NaiveDateTime> {
        self.jobs.iter().map(|j| j.next_run).min()
    }

    /// Returns the time of day that fired, if any job is due. Every due job
    /// is rescheduled so a late check never fires twice for the same slot.
    pub fn poll(&mut self, now: NaiveDateTime) -> Option<NaiveTime> {
        let mut fired = None;
        for job in &mut self.jobs {
            if job.next_run <= now {
                fired.get_or_insert(job.at);
                job.next_run = next_occurrence(job.at, now);
            }
        }
        fired
    }
}

/// The next instant strictly after `now` whose time of day is `at`.
pub fn next_occurrence(at: NaiveTime, now: NaiveDateTime) -> NaiveDateTime {
    let candidate = now.date().and_time(at);
    if candidate > now {
        candidate
    } else {
        candidate + ChronoDuration::days(1)
    }
}

/// Check the schedule once per second and signal the loop when a restart is due.
pub fn spawn(mut schedule: RestartSchedule) -> (mpsc::Receiver<NaiveTime>, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(1);
    let handle = tokio::spawn(async move {
        if schedule.is_empty() {
            info!("no restart times configured");
            return;
        }
        if let Some(next) = schedule.next_run() {
            info!(next = %next, "restart scheduler started");
        }
        let mut ticker = interval(Duration::from_secs(1));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if let Some(at) = schedule.poll(Local::now().naive_local()) {
                info!(at = %at.format("%H:%M"), "scheduled restart due");
                if tx.send(at).await.is_err() {
                    break;
                }
            }
        }
    });
    (rx, handle)
}

/// Same executable, same arguments.
pub fn relaunch_command() -> Result<Command> {
    let exe = std::env::current_exe()?;
    let mut cmd = Command::new(exe);
    cmd.args(std::env::args_os().skip(1));
    Ok(cmd)
}

/// Replace the running process with a fresh invocation. Only returns on failure.
pub fn relaunch() -> AppError {
    let mut cmd = match relaunch_command() {
        Ok(cmd) => cmd,
        Err(e) => return e,
    };
    info!(program = ?cmd.get_program(), "relaunching");
    exec(&mut cmd)
}

#[cfg(unix)]
fn exec(cmd: &mut Command) -> AppError {
    use std::os::unix::process::CommandExt;
    AppError::Io(cmd.exec())
}

#[cfg(not(unix))]
fn exec(cmd: &mut Command) -> AppError {
    match cmd.spawn() {
        Ok(_) => std::process::exit(0),
        Err(e) => {
            tracing::warn!(error = %e, "failed to spawn replacement process");
            AppError::Io(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use pretty_assertions::assert_eq;

    fn dt(d: u32, h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 6, d)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn next_occurrence_rolls_to_tomorrow() {
        assert_eq!(next_occurrence(t(2, 0), dt(1, 1, 0, 0)), dt(1, 2, 0, 0));
        assert_eq!(next_occurrence(t(2, 0), dt(1, 2, 0, 0)), dt(2, 2, 0, 0));
        assert_eq!(next_occurrence(t(2, 0), dt(1, 23, 0, 0)), dt(2, 2, 0, 0));
    }

    #[test]
    fn fires_once_at_two_am() {
        let times = [t(2, 0), t(4, 0), t(13, 0), t(22, 0)];
        let mut schedule = RestartSchedule::new(&times, dt(1, 1, 59, 0));
        assert_eq!(schedule.next_run(), Some(dt(1, 2, 0, 0)));

        assert_eq!(schedule.poll(dt(1, 1, 59, 59)), None);
        assert_eq!(schedule.poll(dt(1, 2, 0, 0)), Some(t(2, 0)));
        assert_eq!(schedule.poll(dt(1, 2, 0, 1)), None);
        assert_eq!(schedule.next_run(), Some(dt(1, 4, 0, 0)));
    }

    #[test]
    fn fresh_schedule_does_not_fire_for_past_slots() {
        // A process started right after a restart must not restart again.
        let mut schedule = RestartSchedule::new(&[t(2, 0)], dt(1, 2, 0, 0));
        assert_eq!(schedule.poll(dt(1, 2, 0, 1)), None);
        assert_eq!(schedule.next_run(), Some(dt(2, 2, 0, 0)));
    }

    #[test]
    fn late_check_fires_once() {
        let mut schedule = RestartSchedule::new(&[t(2, 0), t(4, 0)], dt(1, 0, 0, 0));
        assert_eq!(schedule.poll(dt(1, 5, 0, 0)), Some(t(2, 0)));
        assert_eq!(schedule.poll(dt(1, 5, 0, 1)), None);
    }

    #[test]
    fn relaunch_uses_same_executable_and_arguments() {
        let cmd = relaunch_command().unwrap();
        assert_eq!(cmd.get_program(), std::env::current_exe().unwrap().as_os_str());
        let args: Vec<_> = cmd.get_args().collect();
        let expected: Vec<_> = std::env::args_os().skip(1).collect();
        assert_eq!(args, expected.iter().map(|a| a.as_os_str()).collect::<Vec<_>>());
    }
}
