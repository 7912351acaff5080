use crate::discovery::discovery_messages;
use crate::error::{AppError, Result};
use crate::mqtt::{AsyncClient, QoS, OFFLINE, ONLINE};
use crate::transform::{EnergyStats, PowerReading};
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info};

/// Upper bound on a single publish, so a stalled broker cannot stall the caller.
pub const PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

/// Where published messages go. The MQTT client in production, a recorder in tests.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn publish(&self, topic: String, payload: Vec<u8>, retain: bool) -> Result<()>;
}

/// Queues without waiting. While the broker is unreachable rumqttc stops
/// draining its request queue; once that is full the message is rejected.
#[async_trait]
impl MessageSink for AsyncClient {
    async fn publish(&self, topic: String, payload: Vec<u8>, retain: bool) -> Result<()> {
        AsyncClient::try_publish(self, topic, QoS::AtLeastOnce, retain, payload)?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct Topics {
    pub power: String,
    pub energy: String,
    pub status: String,
}

impl Topics {
    pub fn new(prefix: &str) -> Self {
        Self {
            power: format!("{prefix}/power_data"),
            energy: format!("{prefix}/energy_stats"),
            status: format!("{prefix}/status"),
        }
    }
}

pub struct Publisher<S> {
    sink: S,
    topics: Topics,
    topic_prefix: String,
    discovery_prefix: String,
    system_sn: String,
    publish_timeout: Duration,
}

impl<S: MessageSink> Publisher<S> {
    pub fn new(sink: S, topic_prefix: &str, discovery_prefix: &str, system_sn: &str) -> Self {
        Self {
            sink,
            topics: Topics::new(topic_prefix),
            topic_prefix: topic_prefix.to_string(),
            discovery_prefix: discovery_prefix.to_string(),
            system_sn: system_sn.to_string(),
            publish_timeout: PUBLISH_TIMEOUT,
        }
    }

    pub fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }

    pub fn topics(&self) -> &Topics {
        &self.topics
    }

    /// Discovery configs for every sensor, then `online`. Call once per connection,
    /// before any reading is published.
    pub async fn announce(&self) -> Result<()> {
        let messages = discovery_messages(&self.discovery_prefix, &self.topic_prefix, &self.system_sn);
        let count = messages.len();
        for msg in messages {
            debug!(topic = %msg.topic, "publishing discovery config");
            self.publish_json(msg.topic, &msg.config).await?;
        }
        self.send(self.topics.status.clone(), ONLINE.as_bytes().to_vec()).await?;
        info!(sensors = count, status_topic = %self.topics.status, "published discovery and online status");
        Ok(())
    }

    pub async fn publish_power(&self, reading: &PowerReading) -> Result<()> {
        self.publish_json(self.topics.power.clone(), reading).await
    }

    pub async fn publish_energy(&self, stats: &EnergyStats) -> Result<()> {
        self.publish_json(self.topics.energy.clone(), stats).await
    }

    pub async fn go_offline(&self) -> Result<()> {
        self.send(self.topics.status.clone(), OFFLINE.as_bytes().to_vec()).await
    }

    async fn publish_json<T: Serialize + ?Sized>(&self, topic: String, value: &T) -> Result<()> {
        let payload = serde_json::to_vec(value)?;
        self.send(topic, payload).await
    }

    /// Retained publish, abandoned after `publish_timeout`.
    async fn send(&self, topic: String, payload: Vec<u8>) -> Result<()> {
        let publish = self.sink.publish(topic.clone(), payload, true);
        match tokio::time::timeout(self.publish_timeout, publish).await {
            Ok(result) => result,
            Err(_) => Err(AppError::Mqtt(format!(
                "publish to {topic} timed out after {}ms",
                self.publish_timeout.as_millis()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::PowerStats;
    use mockall::Sequence;
    use serde_json::Number;

    #[tokio::test]
    async fn announce_sends_discovery_before_online() {
        let mut sink = MockMessageSink::new();
        let mut seq = Sequence::new();
        sink.expect_publish()
            .withf(|topic, _, retain| topic.starts_with("homeassistant/sensor/bytewatt/") && *retain)
            .times(6)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(()));
        sink.expect_publish()
            .withf(|topic, payload, retain| {
                topic == "bytewatt/status" && payload.as_slice() == b"online" && *retain
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(()));

        let publisher = Publisher::new(sink, "bytewatt", "homeassistant", "SN1");
        publisher.announce().await.unwrap();
    }

    #[tokio::test]
    async fn power_reading_is_retained_json() {
        let mut sink = MockMessageSink::new();
        sink.expect_publish()
            .withf(|topic, payload, retain| {
                let value: serde_json::Value = serde_json::from_slice(payload).unwrap();
                topic == "solar/power_data" && *retain && value["power_stats"]["battery"] == -200
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        let publisher = Publisher::new(sink, "solar", "homeassistant", "");
        let reading = PowerReading {
            timestamp: "2024-06-01T12:00:00+02:00".into(),
            power_stats: PowerStats {
                pv_production: Number::from(1500),
                load: Number::from(800),
                battery: Number::from(-200),
                grid: Number::from(100),
            },
        };
        publisher.publish_power(&reading).await.unwrap();
    }

    #[tokio::test]
    async fn offline_is_retained_on_status_topic() {
        let mut sink = MockMessageSink::new();
        sink.expect_publish()
            .withf(|topic, payload, retain| {
                topic == "bytewatt/status" && payload.as_slice() == b"offline" && *retain
            })
            .times(1)
            .returning(|_, _, _| Ok(()));
        Publisher::new(sink, "bytewatt", "homeassistant", "")
            .go_offline()
            .await
            .unwrap();
    }

    /// Accepts a publish and never completes it.
    struct StalledSink;

    #[async_trait]
    impl MessageSink for StalledSink {
        async fn publish(&self, _topic: String, _payload: Vec<u8>, _retain: bool) -> Result<()> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn stalled_sink_times_out() {
        let publisher = Publisher::new(StalledSink, "bytewatt", "homeassistant", "")
            .with_publish_timeout(Duration::from_millis(50));

        let err = publisher.go_offline().await.unwrap_err();
        assert!(matches!(err, AppError::Mqtt(_)), "unexpected error: {err}");
    }

    #[tokio::test]
    async fn full_client_queue_is_rejected_without_blocking() {
        let mut options = rumqttc::MqttOptions::new("bytewatt-test", "127.0.0.1", 1);
        options.set_keep_alive(Duration::from_secs(5));
        // The event loop is never polled, so nothing drains the queue.
        let (client, _eventloop) = AsyncClient::new(options, 1);
        let publisher = Publisher::new(client, "bytewatt", "homeassistant", "");

        let outcomes = tokio::time::timeout(Duration::from_secs(2), async {
            let mut outcomes = Vec::new();
            for _ in 0..3 {
                outcomes.push(publisher.go_offline().await.is_ok());
            }
            outcomes
        })
        .await
        .expect("publishing blocked");
        assert_eq!(outcomes, vec![true, false, false]);
    }
}
