//! Maps the upstream `{code, data}` envelopes onto the published payloads.

use crate::error::Result;
use crate::upstream::{ResponseKind, SUCCESS_CODE};
use chrono::Local;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

#[derive(Debug, Deserialize)]
struct Envelope {
    code: Option<i64>,
    data: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PowerStats {
    pub pv_production: Number,
    pub load: Number,
    pub battery: Number,
    pub grid: Number,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PowerReading {
    pub timestamp: String,
    pub power_stats: PowerStats,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnergyCounters {
    pub solar_today: Number,
    pub total_consumption: Number,
    pub feed_in: Number,
    pub grid_import: Number,
    pub battery_charge: Number,
    pub battery_discharge: Number,
    pub self_consumption: Number,
    pub self_sufficiency: Number,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnergyStats {
    pub timestamp: String,
    pub system_sn: String,
    pub energy_stats: EnergyCounters,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Transformed {
    Power(PowerReading),
    Energy(EnergyStats),
    /// Raw `data` object of the statistics-by-day response.
    Daily(Value),
}

/// Transform one intercepted body.
///
/// Returns `Ok(None)` when the envelope is not a success or carries no `data`.
/// Malformed JSON is an error for the caller to deal with.
pub fn transform(kind: ResponseKind, body: &[u8], system_sn: &str) -> Result<Option<Transformed>> {
    if kind == ResponseKind::Unrecognized {
        return Ok(None);
    }
    let envelope: Envelope = serde_json::from_slice(body)?;
    let data = match (envelope.code, envelope.data) {
        (Some(SUCCESS_CODE), Some(data)) => data,
        _ => return Ok(None),
    };
    let empty = Map::new();
    let fields = data.as_object().unwrap_or(&empty);
    let timestamp = Local::now().to_rfc3339();

    let out = match kind {
        ResponseKind::PowerData => Transformed::Power(PowerReading {
            timestamp,
            power_stats: PowerStats {
                pv_production: number_or_zero(fields, "pvPower"),
                load: number_or_zero(fields, "powerLoad"),
                battery: number_or_zero(fields, "batteryPower"),
                grid: number_or_zero(fields, "gridPower"),
            },
        }),
        ResponseKind::EnergyStats => Transformed::Energy(EnergyStats {
            timestamp,
            system_sn: system_sn.to_string(),
            energy_stats: EnergyCounters {
                solar_today: number_or_zero(fields, "epvT"),
                total_consumption: number_or_zero(fields, "eload"),
                feed_in: number_or_zero(fields, "eout"),
                grid_import: number_or_zero(fields, "einput"),
                battery_charge: number_or_zero(fields, "echarge"),
                battery_discharge: number_or_zero(fields, "edischarge"),
                self_consumption: number_or_zero(fields, "eselfConsumption"),
                self_sufficiency: number_or_zero(fields, "eselfSufficiency"),
            },
        }),
        ResponseKind::DailyStatic => Transformed::Daily(data),
        ResponseKind::Unrecognized => return Ok(None),
    };
    Ok(Some(out))
}

fn number_or_zero(fields: &Map<String, Value>, key: &str) -> Number {
    fields
        .get(key)
        .and_then(Value::as_number)
        .cloned()
        .unwrap_or_else(|| Number::from(0))
}
