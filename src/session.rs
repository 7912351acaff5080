//! Headless Chromium session against the monitoring dashboard.

use crate::config::BrowserSettings;
use crate::error::{AppError, Result};
use crate::upstream::{classify, ResponseKind};
use base64::Engine;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::network::{
    EnableParams, EventLoadingFailed, EventLoadingFinished, EventResponseReceived,
    GetResponseBodyParams, RequestId,
};
use chromiumoxide::page::Page;
use futures::{Stream, StreamExt};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const USERNAME_INPUT: &str = r#"input[placeholder="Please enter username/email"]"#;
const PASSWORD_INPUT: &str = r#"input[placeholder="Please enter the password"]"#;
const LOGIN_BUTTON: &str = r#"//button[contains(normalize-space(.), "Log In")]"#;
const DASHBOARD_MARKER: &str = "Dashboard";
const LOGIN_POLL: Duration = Duration::from_millis(250);
/// How long a seen response may wait for `loadingFinished` before it is forgotten.
const PENDING_TTL: Duration = Duration::from_secs(60);

/// A response body captured from the page's own network traffic.
#[derive(Debug, Clone)]
pub struct InterceptedResponse {
    pub kind: ResponseKind,
    pub url: String,
    pub status: i64,
    pub body: Vec<u8>,
}

pub struct DashboardSession {
    browser: Browser,
    page: Page,
    handler: JoinHandle<()>,
    interceptor: Option<JoinHandle<()>>,
}

impl DashboardSession {
    /// Launch headless Chromium with a single blank page.
    pub async fn launch(settings: &BrowserSettings) -> Result<Self> {
        let mut builder = BrowserConfig::builder()
            .arg("--headless=new")
            .arg("--disable-gpu")
            .arg("--no-sandbox")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-extensions");
        if let Some(path) = &settings.chrome_path {
            builder = builder.chrome_executable(path);
        }
        let config = builder
            .build()
            .map_err(|e| AppError::Browser(format!("failed to build browser config: {e}")))?;

        let (browser, mut handler) = Browser::launch(config).await?;
        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!(error = %e, "browser handler event error");
                }
            }
        });

        let page = browser.new_page("about:blank").await?;
        page.execute(EnableParams::default()).await?;
        info!("headless browser launched");

        Ok(Self {
            browser,
            page,
            handler,
            interceptor: None,
        })
    }

    /// Fill the login form and wait for the dashboard to render.
    pub async fn login(&self, url: &str, username: &str, password: &str, timeout: Duration) -> Result<()> {
        self.page
            .goto(url)
            .await
            .map_err(|e| AppError::Login(format!("could not open {url}: {e}")))?;

        let attempt = async {
            self.submit_credentials(username, password).await?;
            self.wait_for_text(DASHBOARD_MARKER).await
        };
        tokio::time::timeout(timeout, attempt).await.map_err(|_| {
            AppError::Login(format!(
                "dashboard did not appear within {}s; check credentials",
                timeout.as_secs()
            ))
        })??;
        info!("logged in to dashboard");
        Ok(())
    }

    async fn submit_credentials(&self, username: &str, password: &str) -> Result<()> {
        let user = self.find_with_retry(USERNAME_INPUT).await?;
        user.click().await?.type_str(username).await?;
        let pass = self.page.find_element(PASSWORD_INPUT).await?;
        pass.click().await?.type_str(password).await?;
        self.page.find_xpath(LOGIN_BUTTON).await?.click().await?;
        Ok(())
    }

    async fn find_with_retry(&self, selector: &str) -> Result<chromiumoxide::element::Element> {
        loop {
            match self.page.find_element(selector).await {
                Ok(el) => return Ok(el),
                Err(_) => tokio::time::sleep(LOGIN_POLL).await,
            }
        }
    }

    async fn wait_for_text(&self, text: &str) -> Result<()> {
        let script = format!(
            "document.body !== null && document.body.innerText.includes({})",
            serde_json::to_string(text)?
        );
        loop {
            let found: bool = self
                .page
                .evaluate(script.as_str())
                .await?
                .into_value()
                .unwrap_or(false);
            if found {
                return Ok(());
            }
            tokio::time::sleep(LOGIN_POLL).await;
        }
    }

    /// Start observing network responses. Bodies of responses from known
    /// endpoints are delivered on the returned channel once loading finishes.
    pub async fn intercept(&mut self) -> Result<mpsc::Receiver<InterceptedResponse>> {
        let mut received = Box::pin(
            self.page
                .event_listener::<EventResponseReceived>()
                .await?
                .map(|ev| NetworkEvent::Received {
                    id: ev.request_id.inner().clone(),
                    url: ev.response.url.clone(),
                    status: ev.response.status,
                }),
        );
        let mut finished = Box::pin(
            self.page
                .event_listener::<EventLoadingFinished>()
                .await?
                .map(|ev| NetworkEvent::Finished {
                    id: ev.request_id.inner().clone(),
                }),
        );
        let mut failed = Box::pin(
            self.page
                .event_listener::<EventLoadingFailed>()
                .await?
                .map(|ev| NetworkEvent::Failed {
                    id: ev.request_id.inner().clone(),
                    reason: ev.error_text.clone(),
                }),
        );
        let page = self.page.clone();
        let (tx, rx) = mpsc::channel(32);

        let task = tokio::spawn(async move {
            let mut pending = PendingResponses::new(PENDING_TTL);
            while let Some(event) = next_event(&mut received, &mut finished, &mut failed).await {
                let Some(ready) = pending.apply(event, Instant::now()) else {
                    continue;
                };
                match read_body(&page, RequestId::new(ready.request_id)).await {
                    Ok(body) => {
                        let resp = InterceptedResponse {
                            kind: ready.kind,
                            url: ready.url,
                            status: ready.status,
                            body,
                        };
                        if tx.send(resp).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => debug!(url = %ready.url, error = %e, "could not read intercepted body"),
                }
            }
            debug!("response interception stopped");
        });
        self.interceptor = Some(task);
        Ok(rx)
    }

    /// Issue fire-and-forget `fetch()` calls from the page context, so the
    /// requests carry the session cookies. Nothing is awaited in the page.
    pub async fn trigger_fetches(&self, paths: &[String]) -> Result<()> {
        let calls = paths
            .iter()
            .map(|p| serde_json::to_string(p).map(|quoted| format!("fetch({quoted}).catch(() => {{}});")))
            .collect::<std::result::Result<Vec<_>, _>>()?
            .join(" ");
        let script = format!("(() => {{ {calls} return true; }})()");
        self.page.evaluate(script.as_str()).await?;
        Ok(())
    }

    pub async fn reload(&self) -> Result<()> {
        self.page.reload().await?;
        Ok(())
    }

    /// Close the browser and wait for its handler to finish.
    pub async fn close(mut self) -> Result<()> {
        if let Some(task) = self.interceptor.take() {
            task.abort();
        }
        if let Err(e) = self.browser.close().await {
            warn!(error = %e, "browser close failed");
        }
        if let Err(e) = self.browser.wait().await {
            warn!(error = %e, "waiting for browser exit failed");
        }
        if let Err(e) = self.handler.await {
            warn!(error = %e, "browser handler task ended abnormally");
        }
        info!("browser closed");
        Ok(())
    }
}

async fn read_body(page: &Page, request_id: RequestId) -> Result<Vec<u8>> {
    let resp = page.execute(GetResponseBodyParams::new(request_id)).await?;
    if resp.result.base64_encoded {
        base64::engine::general_purpose::STANDARD
            .decode(&resp.result.body)
            .map_err(|e| AppError::Browser(format!("invalid base64 body: {e}")))
    } else {
        Ok(resp.result.body.clone().into_bytes())
    }
}

/// CDP network events the interceptor cares about, flattened to owned data.
#[derive(Debug, Clone, PartialEq)]
enum NetworkEvent {
    Received { id: String, url: String, status: i64 },
    Finished { id: String },
    Failed { id: String, reason: String },
}

/// Next event across the three listeners. Chromium emits `responseReceived`
/// before `loadingFinished` for the same request, so the received stream is
/// always drained first to keep that order.
async fn next_event<R, F, L>(received: &mut R, finished: &mut F, failed: &mut L) -> Option<NetworkEvent>
where
    R: Stream<Item = NetworkEvent> + Unpin,
    F: Stream<Item = NetworkEvent> + Unpin,
    L: Stream<Item = NetworkEvent> + Unpin,
{
    tokio::select! {
        biased;
        Some(ev) = received.next() => Some(ev),
        Some(ev) = finished.next() => Some(ev),
        Some(ev) = failed.next() => Some(ev),
        else => None,
    }
}

/// A known-endpoint response whose body can now be read.
#[derive(Debug, Clone, PartialEq)]
struct ReadyResponse {
    request_id: String,
    kind: ResponseKind,
    url: String,
    status: i64,
}

#[derive(Debug)]
struct PendingEntry {
    kind: ResponseKind,
    url: String,
    status: i64,
    seen: Instant,
}

/// Responses seen but not yet finished, keyed by CDP request id. Entries that
/// never finish (page reloaded mid-request, lost events) expire after `ttl`.
#[derive(Debug)]
struct PendingResponses {
    entries: HashMap<String, PendingEntry>,
    ttl: Duration,
}

impl PendingResponses {
    fn new(ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            ttl,
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn apply(&mut self, event: NetworkEvent, now: Instant) -> Option<ReadyResponse> {
        match event {
            NetworkEvent::Received { id, url, status } => {
                self.prune(now);
                let kind = classify(&url);
                if kind != ResponseKind::Unrecognized {
                    self.entries.insert(id, PendingEntry { kind, url, status, seen: now });
                }
                None
            }
            NetworkEvent::Finished { id } => {
                let entry = self.entries.remove(&id)?;
                Some(ReadyResponse {
                    request_id: id,
                    kind: entry.kind,
                    url: entry.url,
                    status: entry.status,
                })
            }
            NetworkEvent::Failed { id, reason } => {
                if let Some(entry) = self.entries.remove(&id) {
                    debug!(url = %entry.url, %reason, "upstream request failed");
                }
                None
            }
        }
    }

    fn prune(&mut self, now: Instant) {
        let ttl = self.ttl;
        let before = self.len();
        self.entries
            .retain(|_, e| now.saturating_duration_since(e.seen) < ttl);
        let expired = before - self.len();
        if expired > 0 {
            debug!(expired, "dropped responses that never finished loading");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use pretty_assertions::assert_eq;

    const POWER_URL: &str =
        "https://monitor.byte-watt.com/api/report/energyStorage/getLastPowerData?sysSn=AL1&stationId=7";
    const ENERGY_URL: &str =
        "https://monitor.byte-watt.com/api/report/energy/getEnergyStatistics?sysSn=AL1&stationId=7";

    fn received(id: &str, url: &str) -> NetworkEvent {
        NetworkEvent::Received {
            id: id.into(),
            url: url.into(),
            status: 200,
        }
    }

    fn finished(id: &str) -> NetworkEvent {
        NetworkEvent::Finished { id: id.into() }
    }

    #[tokio::test]
    async fn queued_events_complete_every_request() {
        // Both fetches have fully loaded before the interceptor looks at any event.
        let mut rx = stream::iter(vec![received("1", POWER_URL), received("2", ENERGY_URL)]);
        let mut fin = stream::iter(vec![finished("1"), finished("2")]);
        let mut fail = stream::iter(Vec::<NetworkEvent>::new());

        let mut pending = PendingResponses::new(PENDING_TTL);
        let now = Instant::now();
        let mut ready = Vec::new();
        while let Some(ev) = next_event(&mut rx, &mut fin, &mut fail).await {
            ready.extend(pending.apply(ev, now));
        }

        let kinds: Vec<_> = ready.iter().map(|r| (r.request_id.as_str(), r.kind)).collect();
        assert_eq!(
            kinds,
            vec![("1", ResponseKind::PowerData), ("2", ResponseKind::EnergyStats)]
        );
        assert_eq!(pending.len(), 0);
    }

    #[test]
    fn unknown_and_failed_requests_leave_nothing_behind() {
        let mut pending = PendingResponses::new(PENDING_TTL);
        let now = Instant::now();
        assert_eq!(pending.apply(received("1", "https://x/api/other"), now), None);
        assert_eq!(pending.apply(received("2", POWER_URL), now), None);
        assert_eq!(pending.len(), 1);
        let failed = NetworkEvent::Failed {
            id: "2".into(),
            reason: "net::ERR_ABORTED".into(),
        };
        assert_eq!(pending.apply(failed, now), None);
        assert_eq!(pending.apply(finished("2"), now), None);
        assert_eq!(pending.len(), 0);
    }

    #[test]
    fn unfinished_requests_expire() {
        let mut pending = PendingResponses::new(Duration::from_secs(60));
        let start = Instant::now();
        pending.apply(received("1", POWER_URL), start);
        pending.apply(received("2", ENERGY_URL), start + Duration::from_secs(30));
        assert_eq!(pending.len(), 2);

        pending.apply(received("3", POWER_URL), start + Duration::from_secs(61));
        assert_eq!(pending.len(), 2);
        assert_eq!(pending.apply(finished("1"), start + Duration::from_secs(62)), None);
        let ready = pending.apply(finished("2"), start + Duration::from_secs(62));
        assert_eq!(ready.map(|r| r.kind), Some(ResponseKind::EnergyStats));
    }

    #[tokio::test]
    #[ignore] // Requires Chromium to be installed
    async fn test_fetch_trigger_is_intercepted() {
        let mut session = DashboardSession::launch(&BrowserSettings::default())
            .await
            .expect("failed to launch browser");
        let mut rx = session.intercept().await.expect("failed to intercept");

        // Relative fetches from a data: page fail, nothing is delivered for them.
        session
            .trigger_fetches(&["/api/report/energyStorage/getLastPowerData?sysSn=x&stationId=y".into()])
            .await
            .expect("trigger failed");
        let got = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await;
        assert!(got.is_err() || got.unwrap().is_none());

        session.close().await.expect("close failed");
    }

    #[tokio::test]
    #[ignore] // Requires Chromium to be installed
    async fn test_login_deadline_covers_form_and_dashboard() {
        // The form shows up late and the dashboard never does.
        let html = r#"<body><script>setTimeout(() => { document.body.innerHTML =
            '<input placeholder="Please enter username/email"><input placeholder="Please enter the password"><button>Log In</button>';
            }, 700);</script></body>"#;
        let url = format!("data:text/html,{}", urlencoding::encode(html));
        let session = DashboardSession::launch(&BrowserSettings::default())
            .await
            .expect("failed to launch browser");

        let started = Instant::now();
        let result = session.login(&url, "user", "secret", Duration::from_secs(1)).await;
        let elapsed = started.elapsed();

        assert!(matches!(result, Err(AppError::Login(_))));
        assert!(elapsed < Duration::from_millis(1500), "login took {elapsed:?}");
        session.close().await.expect("close failed");
    }
}
