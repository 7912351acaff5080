//! Dashboard API endpoints the bridge triggers from inside the logged-in page.

/// Upstream success sentinel in the top-level `code` field.
pub const SUCCESS_CODE: i64 = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    EnergyStatistics,
    LastPowerData,
    StaticsByDay,
}

impl Endpoint {
    pub const ALL: [Endpoint; 3] = [
        Endpoint::EnergyStatistics,
        Endpoint::LastPowerData,
        Endpoint::StaticsByDay,
    ];

    pub fn base_path(self) -> &'static str {
        match self {
            Endpoint::EnergyStatistics => "/api/report/energy/getEnergyStatistics",
            Endpoint::LastPowerData => "/api/report/energyStorage/getLastPowerData",
            Endpoint::StaticsByDay => "/api/report/energy/getStaticsByDay",
        }
    }

    /// Relative request path, parameterised by the account identifiers.
    pub fn path(self, sys_sn: &str, station_id: &str) -> String {
        format!(
            "{}?sysSn={}&stationId={}",
            self.base_path(),
            urlencoding::encode(sys_sn),
            urlencoding::encode(station_id)
        )
    }

    fn url_marker(self) -> &'static str {
        match self {
            Endpoint::EnergyStatistics => "/getEnergyStatistics",
            Endpoint::LastPowerData => "/getLastPowerData",
            Endpoint::StaticsByDay => "/getStaticsByDay",
        }
    }
}

/// What an intercepted response carries, decided by the endpoint it came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    PowerData,
    EnergyStats,
    DailyStatic,
    Unrecognized,
}

impl From<Endpoint> for ResponseKind {
    fn from(endpoint: Endpoint) -> Self {
        match endpoint {
            Endpoint::LastPowerData => ResponseKind::PowerData,
            Endpoint::EnergyStatistics => ResponseKind::EnergyStats,
            Endpoint::StaticsByDay => ResponseKind::DailyStatic,
        }
    }
}

/// Classify a response URL. Only the path is inspected, the query string is ignored.
pub fn classify(url: &str) -> ResponseKind {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    Endpoint::ALL
        .into_iter()
        .find(|e| path.ends_with(e.url_marker()))
        .map(ResponseKind::from)
        .unwrap_or(ResponseKind::Unrecognized)
}

/// The three paths fetched on every poll, in trigger order.
pub fn poll_paths(sys_sn: &str, station_id: &str) -> Vec<String> {
    Endpoint::ALL
        .into_iter()
        .map(|e| e.path(sys_sn, station_id))
        .collect()
}
