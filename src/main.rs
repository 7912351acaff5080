use anyhow::Context;
use bytewatt_bridge::archive::{Archiver, DAILY_BASENAME};
use bytewatt_bridge::monitor::{self, Bridge, ExitReason, LoopSettings};
use bytewatt_bridge::restart::{self, RestartSchedule};
use bytewatt_bridge::session::DashboardSession;
use bytewatt_bridge::upstream::poll_paths;
use bytewatt_bridge::{mqtt, Config, MessageSink, Publisher};
use chrono::{Local, NaiveTime};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    let cfg = Config::from_env().context("invalid configuration")?;
    info!(
        broker = %cfg.mqtt.host,
        port = cfg.mqtt.port,
        prefix = %cfg.mqtt.topic_prefix,
        restarts = cfg.schedule.restart_times.len(),
        "loaded config"
    );
    if cfg.dashboard.sys_sn.is_empty() || cfg.dashboard.station_id.is_empty() {
        warn!("SYS_SN or STATION_ID is empty; upstream requests will likely return no data");
    }

    let archiver = Archiver::new(&cfg.data_dir, DAILY_BASENAME, cfg.schedule.archive_time);
    archiver.ensure_dir();

    let schedule = RestartSchedule::new(&cfg.schedule.restart_times, Local::now().naive_local());
    let (restart_rx, restart_task) = restart::spawn(schedule);

    let (client, driver) = mqtt::connect(&cfg.mqtt)
        .await
        .context("MQTT initialization failed")?;
    let publisher = Publisher::new(
        client.clone(),
        &cfg.mqtt.topic_prefix,
        &cfg.mqtt.discovery_prefix,
        &cfg.dashboard.sys_sn,
    );
    publisher.announce().await.context("failed to publish discovery")?;
    let mut bridge = Bridge::new(publisher, archiver, &cfg.dashboard.sys_sn);

    let outcome = monitor_dashboard(&cfg, &mut bridge, restart_rx).await;
    restart_task.abort();

    // Browser is closed by now; take the bridge offline before dropping the connection.
    if let Err(e) = bridge.publisher().go_offline().await {
        warn!(error = %e, "failed to publish offline status");
    }
    mqtt::shutdown(&client, driver).await;

    match outcome {
        Ok(ExitReason::Interrupted) => {
            info!("monitoring stopped by user");
            Ok(())
        }
        Ok(ExitReason::Restart(at)) => {
            info!(at = %at.format("%H:%M"), "restarting process");
            Err(anyhow::Error::new(restart::relaunch()).context("relaunch failed"))
        }
        Err(e) => {
            error!(error = %e, "monitoring aborted");
            Err(e.into())
        }
    }
}

/// Launch the browser, log in and run the poll loop. The browser is always
/// closed before this returns.
async fn monitor_dashboard<S: MessageSink>(
    cfg: &Config,
    bridge: &mut Bridge<S>,
    restart_rx: mpsc::Receiver<NaiveTime>,
) -> bytewatt_bridge::Result<ExitReason> {
    let mut session = DashboardSession::launch(&cfg.browser).await?;

    let dash = &cfg.dashboard;
    if let Err(e) = session
        .login(&dash.login_url, &dash.username, &dash.password, dash.login_timeout)
        .await
    {
        session.close().await?;
        return Err(e);
    }
    let responses = match session.intercept().await {
        Ok(rx) => rx,
        Err(e) => {
            session.close().await?;
            return Err(e);
        }
    };

    let settings = LoopSettings::new(
        poll_paths(&dash.sys_sn, &dash.station_id),
        cfg.schedule.poll_interval,
        cfg.schedule.reload_interval,
    );
    let interrupted = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for interrupt: {e}");
            std::future::pending::<()>().await;
        }
    };
    let reason = monitor::run(
        &session,
        bridge,
        responses,
        restart_rx,
        &settings,
        Local::now,
        interrupted,
    )
    .await;

    session.close().await?;
    Ok(reason)
}
