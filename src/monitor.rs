//! The poll loop: trigger fetches, route intercepted responses, archive once a day.

use crate::archive::Archiver;
use crate::error::Result;
use crate::publisher::{MessageSink, Publisher};
use crate::session::{DashboardSession, InterceptedResponse};
use crate::transform::{transform, Transformed};
use crate::upstream::ResponseKind;
use async_trait::async_trait;
use chrono::{DateTime, Local, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use serde_json::Value;
use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Seconds into a slot during which a cadence may still fire.
const SLOT_GRACE_SECS: u32 = 5;

/// Page actions the loop drives. Implemented by the browser session.
#[async_trait(?Send)]
pub trait PageDriver {
    async fn trigger_fetches(&self, paths: &[String]) -> Result<()>;
    async fn reload(&self) -> Result<()>;
}

#[async_trait(?Send)]
impl PageDriver for DashboardSession {
    async fn trigger_fetches(&self, paths: &[String]) -> Result<()> {
        DashboardSession::trigger_fetches(self, paths).await
    }

    async fn reload(&self) -> Result<()> {
        DashboardSession::reload(self).await
    }
}

/// Fires once per wall-clock-aligned slot of `period`, within the first few
/// seconds of the slot. Slots restart at local midnight.
#[derive(Debug, Clone)]
pub struct Cadence {
    period_secs: u32,
    grace_secs: u32,
    last_slot: Option<(NaiveDate, u32)>,
}

impl Cadence {
    pub fn new(period: Duration) -> Self {
        let period_secs = u32::try_from(period.as_secs()).unwrap_or(u32::MAX).max(1);
        Self {
            period_secs,
            grace_secs: SLOT_GRACE_SECS.min(period_secs),
            last_slot: None,
        }
    }

    pub fn due(&mut self, now: NaiveDateTime) -> bool {
        let secs = now.num_seconds_from_midnight();
        if secs % self.period_secs >= self.grace_secs {
            return false;
        }
        let slot = (now.date(), secs / self.period_secs);
        if self.last_slot == Some(slot) {
            return false;
        }
        self.last_slot = Some(slot);
        true
    }
}

/// Why the loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    Interrupted,
    Restart(NaiveTime),
}

/// Mutable state of the bridge. Owned by the loop alone.
pub struct Bridge<S> {
    publisher: Publisher<S>,
    archiver: Archiver,
    system_sn: String,
    latest_daily: Option<Value>,
    last_archived: Option<NaiveDate>,
}

impl<S: MessageSink> Bridge<S> {
    pub fn new(publisher: Publisher<S>, archiver: Archiver, system_sn: &str) -> Self {
        Self {
            publisher,
            archiver,
            system_sn: system_sn.to_string(),
            latest_daily: None,
            last_archived: None,
        }
    }

    pub fn publisher(&self) -> &Publisher<S> {
        &self.publisher
    }

    pub fn latest_daily(&self) -> Option<&Value> {
        self.latest_daily.as_ref()
    }

    pub fn last_archived(&self) -> Option<NaiveDate> {
        self.last_archived
    }

    pub async fn handle_response(&mut self, resp: &InterceptedResponse) -> Result<()> {
        let Some(out) = transform(resp.kind, &resp.body, &self.system_sn)? else {
            debug!(url = %resp.url, status = resp.status, "response carried no usable data");
            return Ok(());
        };
        match out {
            Transformed::Power(reading) => self.publisher.publish_power(&reading).await?,
            Transformed::Energy(stats) => self.publisher.publish_energy(&stats).await?,
            Transformed::Daily(data) => self.latest_daily = Some(data),
        }
        Ok(())
    }

    /// Write today's snapshot if the window is open and a value has been seen.
    /// Write errors are logged; the next tick inside the window tries again.
    pub fn archive_if_due(&mut self, now: DateTime<Local>) -> Option<PathBuf> {
        let value = self.latest_daily.as_ref()?;
        if !self.archiver.is_due(now, self.last_archived) {
            return None;
        }
        match self.archiver.write(now, value) {
            Ok(path) => {
                self.last_archived = Some(now.date_naive());
                Some(path)
            }
            Err(e) => {
                warn!(dir = %self.archiver.dir().display(), error = %e, "failed to save daily snapshot");
                None
            }
        }
    }
}

pub struct LoopSettings {
    pub poll_paths: Vec<String>,
    pub poll_interval: Duration,
    pub reload_interval: Duration,
    /// How often the cadences and the archive window are checked.
    pub tick: Duration,
}

impl LoopSettings {
    pub fn new(poll_paths: Vec<String>, poll_interval: Duration, reload_interval: Duration) -> Self {
        Self {
            poll_paths,
            poll_interval,
            reload_interval,
            tick: Duration::from_secs(1),
        }
    }
}

/// Run until `shutdown` completes or a restart is signalled. `clock` supplies
/// the wall-clock time for every tick; pass `Local::now` outside tests.
pub async fn run<S, D, C, F>(
    page: &D,
    bridge: &mut Bridge<S>,
    mut responses: mpsc::Receiver<InterceptedResponse>,
    mut restart: mpsc::Receiver<NaiveTime>,
    settings: &LoopSettings,
    clock: C,
    shutdown: F,
) -> ExitReason
where
    S: MessageSink,
    D: PageDriver + ?Sized,
    C: Fn() -> DateTime<Local>,
    F: Future<Output = ()>,
{
    let mut poll = Cadence::new(settings.poll_interval);
    let mut reload = Cadence::new(settings.reload_interval);
    let mut ticker = interval(settings.tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    tokio::pin!(shutdown);

    info!(
        poll_secs = settings.poll_interval.as_secs(),
        reload_secs = settings.reload_interval.as_secs(),
        "monitoring system data"
    );

    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => {
                info!("shutdown requested");
                return ExitReason::Interrupted;
            }
            Some(at) = restart.recv() => {
                return ExitReason::Restart(at);
            }
            Some(resp) = responses.recv() => {
                if resp.kind == ResponseKind::Unrecognized {
                    continue;
                }
                if let Err(e) = bridge.handle_response(&resp).await {
                    warn!(url = %resp.url, error = %e, "dropping upstream response");
                }
            }
            _ = ticker.tick() => {
                let now = clock();
                let naive = now.naive_local();
                if poll.due(naive) {
                    if let Err(e) = page.trigger_fetches(&settings.poll_paths).await {
                        warn!(error = %e, "failed to trigger fetches");
                    }
                }
                if let Some(path) = bridge.archive_if_due(now) {
                    debug!(path = %path.display(), "daily snapshot written");
                }
                if reload.due(naive) {
                    info!("reloading dashboard to keep the session alive");
                    if let Err(e) = page.reload().await {
                        warn!(error = %e, "page reload failed");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 6, 1)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    #[test]
    fn poll_cadence_fires_once_per_slot() {
        let mut c = Cadence::new(Duration::from_secs(30));
        assert!(c.due(at(10, 0, 0)));
        assert!(!c.due(at(10, 0, 1)));
        assert!(!c.due(at(10, 0, 15)));
        assert!(c.due(at(10, 0, 31)));
        assert!(!c.due(at(10, 0, 34)));
        assert!(!c.due(at(10, 0, 59)));
        assert!(c.due(at(10, 1, 0)));
    }

    #[test]
    fn reload_cadence_aligns_to_half_hours() {
        let mut c = Cadence::new(Duration::from_secs(30 * 60));
        assert!(!c.due(at(10, 15, 0)));
        assert!(c.due(at(10, 30, 2)));
        assert!(!c.due(at(10, 30, 3)));
        assert!(!c.due(at(10, 30, 5)));
        assert!(c.due(at(11, 0, 0)));
    }

    #[test]
    fn grace_never_exceeds_period() {
        let mut c = Cadence::new(Duration::from_secs(2));
        assert!(c.due(at(0, 0, 0)));
        assert!(!c.due(at(0, 0, 1)));
        assert!(c.due(at(0, 0, 2)));
    }
}
