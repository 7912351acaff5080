//! Home Assistant MQTT discovery for the fixed sensor set.

use serde::Serialize;

#[derive(Debug, Clone, Copy)]
pub struct SensorDef {
    pub unique_id: &'static str,
    pub name: &'static str,
    /// Topic suffix under the configured prefix.
    pub state_suffix: &'static str,
    pub value_template: &'static str,
    pub unit: &'static str,
    pub device_class: &'static str,
    pub state_class: &'static str,
}

pub const SENSORS: [SensorDef; 6] = [
    SensorDef {
        unique_id: "bytewatt_current_solar_production",
        name: "Current Solar Production",
        state_suffix: "power_data",
        value_template: "{{ value_json.power_stats.pv_production }}",
        unit: "W",
        device_class: "power",
        state_class: "measurement",
    },
    SensorDef {
        unique_id: "bytewatt_current_load",
        name: "Current Power Load Requirements",
        state_suffix: "power_data",
        value_template: "{{ value_json.power_stats.load }}",
        unit: "W",
        device_class: "power",
        state_class: "measurement",
    },
    SensorDef {
        unique_id: "bytewatt_battery_power",
        name: "Battery Power",
        state_suffix: "power_data",
        value_template: "{{ value_json.power_stats.battery }}",
        unit: "W",
        device_class: "power",
        state_class: "measurement",
    },
    SensorDef {
        unique_id: "bytewatt_grid_power",
        name: "Grid Power",
        state_suffix: "power_data",
        value_template: "{{ value_json.power_stats.grid }}",
        unit: "W",
        device_class: "power",
        state_class: "measurement",
    },
    SensorDef {
        unique_id: "bytewatt_solar_today",
        name: "Today’s Solar Energy (kWh)",
        state_suffix: "energy_stats",
        value_template: "{{ value_json.energy_stats.solar_today / 1000 }}",
        unit: "kWh",
        device_class: "energy",
        state_class: "total_increasing",
    },
    SensorDef {
        unique_id: "bytewatt_consumption_today",
        name: "Today’s Consumption (kWh)",
        state_suffix: "energy_stats",
        value_template: "{{ value_json.energy_stats.total_consumption / 1000 }}",
        unit: "kWh",
        device_class: "energy",
        state_class: "total_increasing",
    },
];

#[derive(Debug, Clone, Serialize)]
pub struct DeviceInfo {
    pub identifiers: Vec<String>,
    pub name: String,
    pub manufacturer: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiscoveryConfig {
    pub name: String,
    pub state_topic: String,
    pub unique_id: String,
    pub unit_of_measurement: String,
    pub device_class: String,
    pub state_class: String,
    pub value_template: String,
    pub availability_topic: String,
    pub device: DeviceInfo,
}

/// A discovery message ready to publish.
#[derive(Debug, Clone)]
pub struct DiscoveryMessage {
    pub topic: String,
    pub config: DiscoveryConfig,
}

pub fn discovery_topic(discovery_prefix: &str, unique_id: &str) -> String {
    format!("{discovery_prefix}/sensor/bytewatt/{unique_id}/config")
}

/// Build one message per fixed sensor, in catalogue order.
pub fn discovery_messages(
    discovery_prefix: &str,
    topic_prefix: &str,
    system_sn: &str,
) -> Vec<DiscoveryMessage> {
    let device_id = if system_sn.is_empty() {
        "bytewatt".to_string()
    } else {
        format!("bytewatt_{system_sn}")
    };
    let device = DeviceInfo {
        identifiers: vec![device_id],
        name: "Byte-Watt Battery System".to_string(),
        manufacturer: "Byte-Watt".to_string(),
    };

    SENSORS
        .iter()
        .map(|s| DiscoveryMessage {
            topic: discovery_topic(discovery_prefix, s.unique_id),
            config: DiscoveryConfig {
                name: s.name.to_string(),
                state_topic: format!("{topic_prefix}/{}", s.state_suffix),
                unique_id: s.unique_id.to_string(),
                unit_of_measurement: s.unit.to_string(),
                device_class: s.device_class.to_string(),
                state_class: s.state_class.to_string(),
                value_template: s.value_template.to_string(),
                availability_topic: format!("{topic_prefix}/status"),
                device: device.clone(),
            },
        })
        .collect()
}
