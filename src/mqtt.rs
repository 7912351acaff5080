use crate::config::MqttSettings;
use crate::error::{AppError, Result};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use rumqttc::{Event, LastWill, Outgoing, Packet, Transport};

pub type MqttOptions = rumqttc::MqttOptions;
pub type AsyncClient = rumqttc::AsyncClient;
pub type EventLoop = rumqttc::EventLoop;
pub type QoS = rumqttc::QoS;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

pub const ONLINE: &str = "online";
pub const OFFLINE: &str = "offline";

pub fn build_options(settings: &MqttSettings) -> MqttOptions {
    let mut opts = MqttOptions::new(&settings.client_id, &settings.host, settings.port);
    opts.set_keep_alive(Duration::from_secs(settings.keep_alive_secs));
    opts.set_clean_session(true);
    if let (Some(u), Some(p)) = (&settings.username, &settings.password) {
        opts.set_credentials(u.clone(), p.clone());
    }
    // Broker marks the bridge unavailable if the connection drops without a clean shutdown.
    opts.set_last_will(LastWill::new(
        settings.status_topic(),
        OFFLINE,
        QoS::AtLeastOnce,
        true,
    ));
    if settings.port == 8883 {
        opts.set_transport(Transport::tls_with_default_config());
    }
    opts
}

pub fn new(options: MqttOptions) -> (AsyncClient, EventLoop) {
    AsyncClient::new(options, 50)
}

/// Connect and wait for the broker to acknowledge. Any failure here is fatal
/// to startup, so the event loop is only handed to the background driver
/// after the first CONNACK.
pub async fn connect(settings: &MqttSettings) -> Result<(AsyncClient, JoinHandle<()>)> {
    let (client, mut eventloop) = new(build_options(settings));
    tokio::time::timeout(CONNECT_TIMEOUT, wait_for_connack(&mut eventloop))
        .await
        .map_err(|_| {
            AppError::Mqtt(format!(
                "no CONNACK from {}:{} within {}s",
                settings.host,
                settings.port,
                CONNECT_TIMEOUT.as_secs()
            ))
        })??;
    info!(host = %settings.host, port = settings.port, client_id = %settings.client_id, "connected to MQTT broker");

    let driver = spawn_driver(eventloop, client.clone(), settings.status_topic());
    Ok((client, driver))
}

async fn wait_for_connack(eventloop: &mut EventLoop) -> Result<()> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => return Ok(()),
            Ok(_) => continue,
            Err(e) => return Err(AppError::Mqtt(e.to_string())),
        }
    }
}

/// Drive the event loop until our own DISCONNECT goes out. rumqttc reconnects on
/// the next poll after an error; on every reconnect the status is set back to
/// online because the broker will have published the last will.
fn spawn_driver(mut eventloop: EventLoop, client: AsyncClient, status_topic: String) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    debug!("MQTT disconnect sent; stopping event loop");
                    break;
                }
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("reconnected to MQTT broker");
                    if let Err(e) = client.try_publish(&status_topic, QoS::AtLeastOnce, true, ONLINE) {
                        warn!(error = %e, "failed to restore online status");
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    error!("MQTT event loop error: {e}");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    })
}

/// Disconnect and give the driver a bounded amount of time to flush.
pub async fn shutdown(client: &AsyncClient, driver: JoinHandle<()>) {
    if let Err(e) = client.try_disconnect() {
        warn!(error = %e, "MQTT disconnect request failed");
        driver.abort();
        return;
    }
    match tokio::time::timeout(DRAIN_TIMEOUT, driver).await {
        Ok(_) => debug!("MQTT event loop drained"),
        Err(_) => warn!("MQTT event loop did not drain within {}s", DRAIN_TIMEOUT.as_secs()),
    }
}
