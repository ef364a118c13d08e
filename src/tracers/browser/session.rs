//! Disposable browser process scoped to a single trace.

use chromiumoxide::{Browser, BrowserConfig};
use futures::StreamExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;

use super::BrowserSettings;
use crate::modules::identity::ProxyIdentity;
use crate::modules::spoofing::Viewport;
use crate::tracers::TracerError;

const CLOSE_TIMEOUT: Duration = Duration::from_secs(3);

static PROFILE_COUNTER: AtomicU64 = AtomicU64::new(0);

const CHROME_PATHS: &[&str] = &[
    "/usr/bin/google-chrome",
    "/usr/bin/google-chrome-stable",
    "/usr/bin/chromium",
    "/usr/bin/chromium-browser",
    "/snap/bin/chromium",
    "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
    "/Applications/Chromium.app/Contents/MacOS/Chromium",
    "/opt/google/chrome/google-chrome",
];

/// Owns one Chrome process and its DevTools handler task.
///
/// Call [`BrowserSession::shutdown`] when the trace ends. Dropping without it
/// still stops the handler, and chromiumoxide kills the child on drop.
pub(crate) struct BrowserSession {
    browser: Browser,
    handler: JoinHandle<()>,
    profile_dir: PathBuf,
    closed: bool,
}

impl BrowserSession {
    pub(crate) async fn launch(
        settings: &BrowserSettings,
        identity: Option<&ProxyIdentity>,
        viewport: Viewport,
    ) -> Result<Self, TracerError> {
        let profile_dir = std::env::temp_dir().join(format!(
            "redirect-tracer-{}-{}",
            std::process::id(),
            PROFILE_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));

        let mut builder = BrowserConfig::builder()
            .user_data_dir(&profile_dir)
            .window_size(viewport.width, viewport.height);

        if let Some(path) = settings.chrome_executable.clone().or_else(detect_chrome) {
            builder = builder.chrome_executable(path);
        }
        if !settings.headless {
            builder = builder.with_head();
        }
        // Credentials go through the Fetch auth hook; Chrome ignores them in --proxy-server.
        if let Some(identity) = identity {
            builder = builder.arg(format!("--proxy-server={}", identity.proxy_url()));
        }

        builder = builder
            .arg("--disable-blink-features=AutomationControlled")
            .arg("--disable-infobars")
            .arg("--disable-dev-shm-usage")
            .arg("--no-first-run")
            .arg("--no-default-browser-check")
            .arg("--disable-background-networking")
            .arg("--disable-sync")
            .arg("--disable-translate")
            .arg("--disable-popup-blocking")
            // Keeps cross-site frames in the page's DevTools session so their
            // navigations and content stay visible.
            .arg("--disable-features=IsolateOrigins,site-per-process")
            .arg("--disable-site-isolation-trials")
            .arg("--metrics-recording-only")
            .arg("--no-sandbox")
            .arg("--disable-gpu");
        for arg in &settings.extra_args {
            builder = builder.arg(arg);
        }

        let config = builder.build().map_err(TracerError::BrowserLaunch)?;
        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|err| TracerError::BrowserLaunch(err.to_string()))?;

        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(err) = event {
                    log::debug!("browser handler stopped: {}", err);
                    break;
                }
            }
        });

        Ok(Self {
            browser,
            handler,
            profile_dir,
            closed: false,
        })
    }

    pub(crate) fn browser(&self) -> &Browser {
        &self.browser
    }

    /// Closes the browser, reaps the process and removes the profile directory.
    pub(crate) async fn shutdown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        match tokio::time::timeout(CLOSE_TIMEOUT, self.browser.close()).await {
            Ok(Ok(_)) => {
                let _ = tokio::time::timeout(CLOSE_TIMEOUT, self.browser.wait()).await;
            }
            Ok(Err(err)) => {
                log::debug!("browser close failed: {}", err);
                let _ = self.browser.kill().await;
            }
            Err(_) => {
                log::warn!("browser did not close within {:?}; killing", CLOSE_TIMEOUT);
                let _ = self.browser.kill().await;
            }
        }
        self.handler.abort();

        if let Err(err) = tokio::fs::remove_dir_all(&self.profile_dir).await {
            log::debug!("could not remove browser profile {}: {}", self.profile_dir.display(), err);
        }
    }
}

impl Drop for BrowserSession {
    fn drop(&mut self) {
        if !self.closed {
            self.handler.abort();
        }
    }
}

fn detect_chrome() -> Option<PathBuf> {
    CHROME_PATHS
        .iter()
        .map(PathBuf::from)
        .find(|path| path.exists())
}
