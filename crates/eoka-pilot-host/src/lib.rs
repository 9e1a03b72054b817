//! # eoka-pilot-host
//!
//! [`Host`] implementation over real Chrome tabs, driven by the `eoka` CDP
//! crate. Each opened tab gets a background poller that watches
//! `document.readyState` and the URL and publishes one load event per finished
//! load.
//!
//! ```rust,no_run
//! use eoka_pilot_core::BrowserConfig;
//! use eoka_pilot_host::EokaHost;
//!
//! # async fn demo() -> eoka_pilot_core::Result<()> {
//! let host = EokaHost::launch(&BrowserConfig::default()).await?;
//! let tab = host.open("https://example.com/login").await?;
//! println!("driving {}", tab);
//! host.close().await?;
//! # Ok(())
//! # }
//! ```

mod scripts;

use async_trait::async_trait;
use eoka::{Browser, Page, StealthConfig};
use eoka_pilot_core::{BrowserConfig, Error, Host, PageScript, Result, TabInfo, TargetId};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

const LOAD_POLL: Duration = Duration::from_millis(250);
const LOAD_CHANNEL: usize = 64;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReadyState {
    url: String,
    ready_state: String,
}

impl ReadyState {
    fn complete(&self) -> bool {
        self.ready_state == "complete"
    }
}

struct Tab {
    page: Arc<Page>,
    watcher: JoinHandle<()>,
}

impl Drop for Tab {
    fn drop(&mut self) {
        self.watcher.abort();
    }
}

/// Chrome, with the tabs this process opened.
pub struct EokaHost {
    browser: Browser,
    tabs: Mutex<HashMap<TargetId, Tab>>,
    loads: broadcast::Sender<TargetId>,
}

impl EokaHost {
    /// Launch a browser with the given settings.
    pub async fn launch(config: &BrowserConfig) -> Result<Self> {
        let stealth = StealthConfig {
            headless: config.headless,
            proxy: config.proxy.clone(),
            user_agent: config.user_agent.clone(),
            viewport_width: config.viewport.as_ref().map(|v| v.width).unwrap_or(1280),
            viewport_height: config.viewport.as_ref().map(|v| v.height).unwrap_or(720),
            ..Default::default()
        };
        info!("launching browser (headless={})", config.headless);
        let browser = Browser::launch_with_config(stealth)
            .await
            .map_err(|e| Error::Host(e.to_string()))?;
        let (loads, _) = broadcast::channel(LOAD_CHANNEL);
        Ok(Self {
            browser,
            tabs: Mutex::new(HashMap::new()),
            loads,
        })
    }

    /// Open a tab at `url` and start watching it for loads.
    pub async fn open(&self, url: &str) -> Result<TargetId> {
        let page = self
            .browser
            .new_page(url)
            .await
            .map_err(|e| Error::Host(e.to_string()))?;
        let page = Arc::new(page);
        let target = TargetId::new(page.target_id().to_string());
        let watcher = tokio::spawn(watch_loads(
            page.clone(),
            target.clone(),
            self.loads.clone(),
        ));
        self.tabs
            .lock()
            .await
            .insert(target.clone(), Tab { page, watcher });
        debug!("opened {} at {}", target, url);
        Ok(target)
    }

    pub async fn close_tab(&self, target: &TargetId) -> Result<()> {
        if self.tabs.lock().await.remove(target).is_none() {
            return Err(Error::TargetClosed(target.to_string()));
        }
        self.browser
            .close_tab(target.as_str())
            .await
            .map_err(|e| Error::Host(e.to_string()))
    }

    /// Close every tab and the browser.
    pub async fn close(self) -> Result<()> {
        let Self { browser, tabs, .. } = self;
        drop(tabs);
        browser.close().await.map_err(|e| Error::Host(e.to_string()))
    }

    async fn page(&self, target: &TargetId) -> Result<Arc<Page>> {
        self.tabs
            .lock()
            .await
            .get(target)
            .map(|t| t.page.clone())
            .ok_or_else(|| Error::TargetClosed(target.to_string()))
    }

    /// Classify a CDP failure, forgetting the tab if it is gone.
    async fn cdp_error(&self, target: &TargetId, e: eoka::Error) -> Error {
        let message = e.to_string();
        if is_closed(&message) {
            self.tabs.lock().await.remove(target);
            Error::TargetClosed(target.to_string())
        } else {
            Error::Host(message)
        }
    }
}

fn is_closed(message: &str) -> bool {
    let msg = message.to_lowercase();
    msg.contains("no target with given id")
        || msg.contains("target closed")
        || msg.contains("session closed")
        || msg.contains("no session with given id")
}

async fn read_state(page: &Page) -> eoka::Result<Option<ReadyState>> {
    let raw: String = page.evaluate(scripts::READY_STATE).await?;
    Ok(serde_json::from_str(&raw).ok())
}

/// Publish `target` each time its document finishes loading, or its URL
/// changes while complete.
async fn watch_loads(page: Arc<Page>, target: TargetId, loads: broadcast::Sender<TargetId>) {
    let mut last: Option<ReadyState> = None;
    loop {
        tokio::time::sleep(LOAD_POLL).await;
        let state = match read_state(&page).await {
            Ok(Some(state)) => state,
            Ok(None) => continue,
            Err(e) => {
                // Evaluation fails while a navigation swaps the document.
                trace!("load poll {}: {}", target, e);
                continue;
            }
        };
        if let Some(prev) = &last {
            if state.complete() && (!prev.complete() || prev.url != state.url) {
                debug!("load finished in {}: {}", target, state.url);
                let _ = loads.send(target.clone());
            }
        }
        last = Some(state);
    }
}

#[async_trait]
impl Host for EokaHost {
    async fn tab_info(&self, target: &TargetId) -> Result<Option<TabInfo>> {
        let Some(page) = self.tabs.lock().await.get(target).map(|t| t.page.clone()) else {
            return Ok(None);
        };
        let open = self
            .browser
            .tabs()
            .await
            .map_err(|e| Error::Host(e.to_string()))?
            .iter()
            .any(|t| t.id == target.as_str());
        if !open {
            self.tabs.lock().await.remove(target);
            return Ok(None);
        }

        let title = page.title().await.unwrap_or_default();
        match read_state(&page).await {
            Ok(Some(state)) => Ok(Some(TabInfo {
                loading: !state.complete(),
                url: state.url,
                title,
            })),
            // Mid-navigation: no document to ask yet.
            Ok(None) | Err(_) => {
                let url = page
                    .url()
                    .await
                    .map_err(|e| Error::Host(e.to_string()))?;
                Ok(Some(TabInfo {
                    url,
                    title,
                    loading: true,
                }))
            }
        }
    }

    async fn run_script(&self, target: &TargetId, script: &PageScript) -> Result<serde_json::Value> {
        let page = self.page(target).await?;
        let js = scripts::render(script)?;
        let raw: String = match page.evaluate(&js).await {
            Ok(raw) => raw,
            Err(e) => return Err(self.cdp_error(target, e).await),
        };
        serde_json::from_str(&raw).map_err(|e| {
            Error::Host(format!("{} script returned invalid json: {}", script.name(), e))
        })
    }

    async fn navigate(&self, target: &TargetId, url: &str) -> Result<()> {
        let page = self.page(target).await?;
        let js = format!("window.location.href = {};", serde_json::to_string(url)?);
        match page.execute(&js).await {
            Ok(_) => Ok(()),
            Err(e) => Err(self.cdp_error(target, e).await),
        }
    }

    async fn capture_visible(&self, target: &TargetId) -> Result<Vec<u8>> {
        let page = self.page(target).await?;
        match page.screenshot().await {
            Ok(png) => Ok(png),
            Err(e) => Err(self.cdp_error(target, e).await),
        }
    }

    fn subscribe_loads(&self) -> broadcast::Receiver<TargetId> {
        self.loads.subscribe()
    }
}
