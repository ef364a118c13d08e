//! Runs one browser trace: instrumentation, a single navigation, idle
//! detection, hidden-redirect follow-ups and the side chains of popups.

use chromiumoxide::cdp::browser_protocol::emulation::{
    SetDeviceMetricsOverrideParams, SetTimezoneOverrideParams, SetTouchEmulationEnabledParams,
};
use chromiumoxide::cdp::browser_protocol::fetch::{
    self, AuthChallengeResponse, AuthChallengeResponseResponse, AuthChallengeSource, ContinueRequestParams,
    ContinueWithAuthParams, EventAuthRequired, EventRequestPaused, FailRequestParams, RequestPattern,
};
use chromiumoxide::cdp::browser_protocol::network::{
    self, ErrorReason, EventLoadingFailed, EventLoadingFinished, EventRequestWillBeSent, EventResponseReceived,
    ResourceType, SetUserAgentOverrideParams,
};
use chromiumoxide::cdp::browser_protocol::page::{
    AddScriptToEvaluateOnNewDocumentParams, EventFrameNavigated, EventWindowOpen, FrameTree, GetFrameTreeParams,
    GetResourceContentParams, NavigateParams, StopLoadingParams,
};
use chromiumoxide::cdp::js_protocol::runtime::{AddBindingParams, EvaluateParams, EventBindingCalled};
use chromiumoxide::{Browser, Page};
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{Notify, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use url::Url;

use super::instrumentation::{self, REPORT_BINDING, TARGET_VARIABLE_LOOKUP};
use super::recorder::{LoadingFailed, METHOD_DOCUMENT, METHOD_POPUP, Recorder, RequestSent, Settle, finalize_hops};
use super::session::BrowserSession;
use super::{BrowserSettings, signals};
use crate::tracers::anti_cloaking::{self, FollowUpCandidates, FollowUpPlan};
use crate::tracers::types::{BrowserExtras, FormSubmission, HopRecord, PopupChain, RedirectType, TraceResult};
use crate::tracers::{TraceContext, TracerError};

const CONTENT_TIMEOUT: Duration = Duration::from_secs(2);
/// How long a `window.open` may take to surface as a page target.
const POPUP_ATTACH_TIMEOUT: Duration = Duration::from_secs(2);
const POPUP_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Popups beyond this are reported from their `window.open` call only.
const MAX_TRACED_POPUPS: usize = 8;

/// Per-mode tuning of the shared driver.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RunProfile {
    pub anti_cloaking: bool,
    pub idle_window: Duration,
    pub min_navigation_window: Duration,
}

impl RunProfile {
    pub(crate) fn standard(settings: &BrowserSettings) -> Self {
        Self {
            anti_cloaking: false,
            idle_window: settings.idle_window(false),
            min_navigation_window: settings.min_navigation_window(),
        }
    }

    pub(crate) fn anti_cloaking(settings: &BrowserSettings) -> Self {
        Self {
            anti_cloaking: true,
            idle_window: settings.idle_window(true),
            min_navigation_window: settings.min_navigation_window(),
        }
    }
}

type Shared = Arc<Mutex<Recorder>>;

/// Username and password answered on proxy auth challenges.
type ProxyAuth = Option<(String, String)>;

fn lock(recorder: &Shared) -> MutexGuard<'_, Recorder> {
    recorder.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Listener tasks; aborted when dropped.
struct Listeners(Vec<JoinHandle<()>>);

impl Drop for Listeners {
    fn drop(&mut self) {
        for task in &self.0 {
            task.abort();
        }
    }
}

/// A `window.open` seen on the traced page.
#[derive(Debug, Clone)]
struct PopupOpened {
    url: String,
    opener_url: String,
}

fn browser_error(err: impl std::fmt::Display) -> TracerError {
    TracerError::Browser(err.to_string())
}

/// Launches a browser for `ctx`, traces, and always tears the browser down.
pub(crate) async fn run(
    settings: &BrowserSettings,
    ctx: &TraceContext,
    profile: RunProfile,
) -> Result<TraceResult, TracerError> {
    let deadline = Instant::now() + ctx.timeout;
    let mut session = BrowserSession::launch(settings, ctx.identity.as_ref(), ctx.fingerprint.viewport).await?;
    let outcome = drive(session.browser(), settings, ctx, profile, deadline).await;
    session.shutdown().await;
    outcome
}

async fn drive(
    browser: &Browser,
    settings: &BrowserSettings,
    ctx: &TraceContext,
    profile: RunProfile,
    deadline: Instant,
) -> Result<TraceResult, TracerError> {
    // Targets that exist before the trace are never taken for popups.
    let mut claimed: HashSet<String> = browser
        .pages()
        .await
        .map(|pages| pages.iter().map(|page| page.target_id().inner().clone()).collect())
        .unwrap_or_default();

    let page = browser.new_page("about:blank").await.map_err(browser_error)?;
    claimed.insert(page.target_id().inner().clone());
    let main_frame = page
        .mainframe()
        .await
        .map_err(browser_error)?
        .map(|id| id.inner().clone());
    let recorder: Shared = Arc::new(Mutex::new(Recorder::new(main_frame)));
    let expected = Arc::new(Notify::new());
    let auth = proxy_auth(ctx);
    let (popup_tx, popup_rx) = mpsc::unbounded_channel();

    let listeners = Listeners(vec![
        intercept(&page, settings, auth.clone(), &recorder).await?,
        record_network(&page, &recorder, Some((ctx.clone(), expected.clone()))).await?,
        record_page(&page, &recorder, Some(popup_tx)).await?,
    ]);
    enable_interception(&page).await?;
    instrument(&page, ctx, profile).await?;

    let mut start = NavigateParams::builder().url(ctx.url.as_str());
    if let Some(referrer) = ctx.referrer.as_deref() {
        start = start.referrer(referrer);
    }
    let start = start.build().map_err(TracerError::Browser)?;

    let watch = Watch {
        recorder: recorder.clone(),
        expected,
        idle_window: profile.idle_window,
        min_navigation_window: profile.min_navigation_window,
        deadline,
    };
    let popups = PopupWatcher {
        browser,
        claimed: Mutex::new(claimed),
        settings,
        auth,
        user_agent: &ctx.user_agent,
        profile,
        timeout: ctx.timeout,
        deadline,
    };

    let (done_tx, done_rx) = oneshot::channel();
    let (page_ref, watch_ref) = (&page, &watch);
    let main = async move {
        let settle = follow_main(page_ref, ctx, profile, watch_ref, start).await;
        let final_html = page_content(page_ref).await;
        let _ = done_tx.send(());
        (settle, final_html)
    };
    let ((settle, final_html), popup_chains) = tokio::join!(main, popups.run(popup_rx, done_rx));
    log::debug!("browser trace settled: {:?}, {} popup(s)", settle, popup_chains.len());
    drop(listeners);

    let (mut hops, js_log, stats) = lock(&recorder).take();
    let _ = page.close().await;

    finalize_hops(&mut hops, ctx.url.as_str(), METHOD_DOCUMENT, ctx.timeout, settle);

    let form_submissions = js_log
        .iter()
        .filter(|entry| entry.kind == "form_submit")
        .map(|entry| FormSubmission {
            action: entry.url.clone(),
            method: entry.method.clone().unwrap_or_else(|| "get".to_string()),
            timestamp: entry.timestamp,
        })
        .collect();

    let (cloaking_indicators, aggressiveness) = if profile.anti_cloaking {
        let (indicators, level) = anti_cloaking::assess(&final_html, popup_chains.len());
        (Some(indicators), Some(level))
    } else {
        (None, None)
    };

    let extras = BrowserExtras {
        js_redirect_log: js_log,
        form_submissions,
        popup_chains,
        network_stats: stats,
        cloaking_indicators,
        aggressiveness,
    };

    Ok(TraceResult::from_chain(ctx.url.as_str(), hops, &ctx.user_agent, ctx.max_redirects).with_browser_extras(extras))
}

/// The main navigation, at most one hidden-redirect follow, then the
/// anti-cloaking follow-ups.
async fn follow_main(page: &Page, ctx: &TraceContext, profile: RunProfile, watch: &Watch, start: NavigateParams) -> Settle {
    let mut settle = watch.navigate(page, start).await;

    let mut hidden_followed = false;
    let mut plan = FollowUpPlan::new();
    while settle == Settle::Idle {
        let Some(current) = current_url(page).await else { break };
        let html = page_content(page).await;

        if !hidden_followed && let Some(hidden) = signals::find_hidden_redirect(&current, &html) {
            hidden_followed = true;
            log::debug!("following hidden {} redirect to {}", hidden.kind.as_str(), hidden.target);
            lock(&watch.recorder).pending_method = Some(format!("browser_hidden_{}", hidden.kind.as_str()));
            settle = watch.navigate(page, NavigateParams::new(hidden.target.as_str())).await;
            continue;
        }

        if profile.anti_cloaking {
            let candidates = follow_up_candidates(page, &watch.recorder, &current, &html).await;
            if let Some((kind, target)) = plan.next(&current, &candidates) {
                log::debug!("anti-cloaking follow-up {:?} -> {} ({})", kind, target, ctx.url);
                lock(&watch.recorder).pending_method = Some(kind.method().to_string());
                settle = watch.navigate(page, NavigateParams::new(target.as_str())).await;
                continue;
            }
        }
        break;
    }
    settle
}

struct Watch {
    recorder: Shared,
    expected: Arc<Notify>,
    idle_window: Duration,
    min_navigation_window: Duration,
    deadline: Instant,
}

impl Watch {
    /// Starts a navigation (single attempt, never retried) and races it
    /// against idle detection.
    async fn navigate(&self, page: &Page, params: NavigateParams) -> Settle {
        let started = Instant::now();
        lock(&self.recorder).last_progress = started;
        let remaining = self.deadline.saturating_duration_since(started);

        let navigation = async {
            match tokio::time::timeout(remaining, page.goto(params)).await {
                Ok(Ok(_)) => {}
                Ok(Err(err)) => log::warn!("browser navigation failed: {}", err),
                Err(_) => log::debug!("navigation still loading at the trace deadline"),
            }
        };
        tokio::pin!(navigation);
        let settled = self.wait_until_settled(started);
        tokio::pin!(settled);

        tokio::select! {
            _ = &mut navigation => {}
            outcome = &mut settled => return outcome,
        }
        settled.await
    }

    async fn wait_until_settled(&self, navigation_started: Instant) -> Settle {
        let floor = navigation_started + self.min_navigation_window;
        loop {
            let now = Instant::now();
            if now >= self.deadline {
                return Settle::Deadline;
            }
            let (last_progress, expected_reached) = {
                let state = lock(&self.recorder);
                (state.last_progress, state.expected_reached)
            };
            if expected_reached {
                return Settle::ExpectedReached;
            }
            let idle_at = (last_progress + self.idle_window).max(floor);
            if now >= idle_at {
                return Settle::Idle;
            }
            tokio::select! {
                _ = tokio::time::sleep_until(idle_at.min(self.deadline)) => {}
                _ = self.expected.notified() => {}
            }
        }
    }
}

/// Follows windows opened by the traced page. Each popup runs on its own
/// page target with the opener's interception and proxy auth, and is closed
/// once its own navigation settles.
struct PopupWatcher<'a> {
    browser: &'a Browser,
    /// Target ids already owned by the trace or another popup.
    claimed: Mutex<HashSet<String>>,
    settings: &'a BrowserSettings,
    auth: ProxyAuth,
    user_agent: &'a str,
    profile: RunProfile,
    timeout: Duration,
    deadline: Instant,
}

impl PopupWatcher<'_> {
    /// Collects chains until the main trace is done and every popup opened
    /// before that has settled.
    async fn run(&self, mut opened: mpsc::UnboundedReceiver<PopupOpened>, mut done: oneshot::Receiver<()>) -> Vec<PopupChain> {
        let mut pending = FuturesUnordered::new();
        let mut chains = Vec::new();
        let mut seen = 0usize;
        let mut accepting = true;

        loop {
            let mut admitted = Vec::new();
            tokio::select! {
                Some(popup) = opened.recv(), if accepting => admitted.push(popup),
                _ = &mut done, if accepting => {
                    accepting = false;
                    while let Ok(popup) = opened.try_recv() {
                        admitted.push(popup);
                    }
                }
                Some(chain) = pending.next(), if !pending.is_empty() => chains.push(chain),
                else => break,
            }
            for popup in admitted {
                seen += 1;
                if seen > MAX_TRACED_POPUPS {
                    chains.push(unattached(&popup));
                } else {
                    pending.push(self.follow(popup));
                }
            }
        }
        chains
    }

    async fn follow(&self, popup: PopupOpened) -> PopupChain {
        let Some(page) = self.attach(&popup.url).await else {
            log::debug!("popup {} never produced a page", popup.url);
            return unattached(&popup);
        };

        let chain = match self.trace(&page, &popup).await {
            Ok(chain) => chain,
            Err(err) => {
                log::debug!("popup {} could not be traced: {}", popup.url, err);
                vec![HopRecord::failed(0, popup.url.clone(), 0, METHOD_POPUP, err.to_string())]
            }
        };
        if let Err(err) = page.close().await {
            log::debug!("could not close popup: {}", err);
        }
        popup_chain(&popup.opener_url, chain)
    }

    fn claim(&self, page: &Page) -> bool {
        let mut claimed = self.claimed.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        claimed.insert(page.target_id().inner().clone())
    }

    fn is_claimed(&self, page: &Page) -> bool {
        let claimed = self.claimed.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        claimed.contains(page.target_id().inner())
    }

    /// Waits for an unclaimed page target, preferring one already showing
    /// `url` when several popups open at once.
    async fn attach(&self, url: &str) -> Option<Page> {
        let give_up = (Instant::now() + POPUP_ATTACH_TIMEOUT).min(self.deadline);
        loop {
            if let Ok(pages) = self.browser.pages().await {
                let fresh: Vec<Page> = pages.into_iter().filter(|page| !self.is_claimed(page)).collect();
                let mut preferred = None;
                for (index, page) in fresh.iter().enumerate() {
                    if let Ok(Ok(Some(current))) = tokio::time::timeout(CONTENT_TIMEOUT, page.url()).await
                        && current == url
                    {
                        preferred = Some(index);
                        break;
                    }
                }
                let order = preferred.into_iter().chain(0..fresh.len());
                for index in order {
                    if self.claim(&fresh[index]) {
                        return Some(fresh[index].clone());
                    }
                }
            }
            if Instant::now() >= give_up {
                return None;
            }
            tokio::time::sleep(POPUP_POLL_INTERVAL).await;
        }
    }

    async fn trace(&self, page: &Page, popup: &PopupOpened) -> Result<Vec<HopRecord>, TracerError> {
        let main_frame = page
            .mainframe()
            .await
            .map_err(browser_error)?
            .map(|id| id.inner().clone());
        let recorder: Shared = Arc::new(Mutex::new(Recorder::new(main_frame)));
        lock(&recorder).pending_method = Some(METHOD_POPUP.to_string());

        let _listeners = Listeners(vec![
            intercept(page, self.settings, self.auth.clone(), &recorder).await?,
            record_network(page, &recorder, None).await?,
            record_page(page, &recorder, None).await?,
        ]);
        enable_interception(page).await?;
        if let Ok(params) = SetUserAgentOverrideParams::builder().user_agent(self.user_agent).build()
            && let Err(err) = page.execute(params).await
        {
            log::debug!("popup user agent override failed: {}", err);
        }

        let watch = Watch {
            recorder: recorder.clone(),
            expected: Arc::new(Notify::new()),
            idle_window: self.profile.idle_window,
            min_navigation_window: self.profile.min_navigation_window,
            deadline: self.deadline,
        };
        let mut settle = watch.wait_until_settled(Instant::now()).await;

        // A first load that ran before interception was attached never gets
        // past the proxy's 407; load it again through the auth hook.
        let recorded_nothing = lock(&recorder).hops.is_empty();
        if self.auth.is_some() && recorded_nothing && settle != Settle::Deadline && !popup.url.is_empty() {
            let landed = current_url(page).await;
            if landed.is_none() {
                log::debug!("popup {} stalled before interception; loading it again", popup.url);
                settle = watch.navigate(page, NavigateParams::new(popup.url.as_str())).await;
            }
        }

        let (mut hops, _, _) = lock(&recorder).take();
        if hops.is_empty()
            && let Some(landed) = current_url(page).await
        {
            // Loaded entirely before the listeners were attached.
            hops.push(HopRecord::new(0, popup.url.clone(), 0, RedirectType::Popup, METHOD_POPUP));
            if landed.as_str() != popup.url {
                hops.push(HopRecord::new(1, landed.to_string(), 0, RedirectType::Popup, METHOD_POPUP));
            }
            return Ok(hops);
        }
        finalize_hops(&mut hops, &popup.url, METHOD_POPUP, self.timeout, settle);
        Ok(hops)
    }
}

fn unattached(popup: &PopupOpened) -> PopupChain {
    let chain = vec![HopRecord::new(0, popup.url.clone(), 0, RedirectType::Popup, METHOD_POPUP)];
    popup_chain(&popup.opener_url, chain)
}

fn popup_chain(opener_url: &str, chain: Vec<HopRecord>) -> PopupChain {
    let final_url = chain.last().map(|hop| hop.url.clone()).unwrap_or_default();
    PopupChain {
        opener_url: opener_url.to_string(),
        chain,
        final_url,
    }
}

fn proxy_auth(ctx: &TraceContext) -> ProxyAuth {
    ctx.identity
        .as_ref()
        .map(|identity| (identity.username.clone(), identity.password.clone()))
}

fn request_sent(event: &EventRequestWillBeSent) -> RequestSent {
    let mut initiator_scripts = Vec::new();
    let mut stack = event.initiator.stack.as_ref();
    while let Some(trace) = stack {
        initiator_scripts.extend(
            trace
                .call_frames
                .iter()
                .map(|frame| frame.url.clone())
                .filter(|url| !url.is_empty()),
        );
        stack = trace.parent.as_deref();
    }
    initiator_scripts.extend(event.initiator.url.clone());

    RequestSent {
        request_id: event.request_id.inner().clone(),
        url: event.request.url.clone(),
        frame_id: event.frame_id.as_ref().map(|id| id.inner().clone()),
        document: matches!(event.r#type, Some(ResourceType::Document)),
        redirect_status: event
            .redirect_response
            .as_ref()
            .map(|response| u16::try_from(response.status).unwrap_or(0)),
        initiator_scripts,
    }
}

/// Request interception: block heavy resources, answer proxy auth.
async fn intercept(
    page: &Page,
    settings: &BrowserSettings,
    credentials: ProxyAuth,
    recorder: &Shared,
) -> Result<JoinHandle<()>, TracerError> {
    let mut paused = page.event_listener::<EventRequestPaused>().await.map_err(browser_error)?;
    let mut auth = page.event_listener::<EventAuthRequired>().await.map_err(browser_error)?;

    let page = page.clone();
    let recorder = recorder.clone();
    let settings = settings.clone();
    Ok(tokio::spawn(async move {
        let mut answered = HashSet::new();
        loop {
            tokio::select! {
                Some(event) = paused.next() => {
                    if settings.should_block(event.resource_type.as_ref(), &event.request.url) {
                        lock(&recorder).stats.blocked_requests += 1;
                        let params = FailRequestParams::new(event.request_id.clone(), ErrorReason::BlockedByClient);
                        let _ = page.execute(params).await;
                    } else {
                        let _ = page.execute(ContinueRequestParams::new(event.request_id.clone())).await;
                    }
                }
                Some(event) = auth.next() => {
                    let from_proxy = matches!(event.auth_challenge.source, Some(AuthChallengeSource::Proxy));
                    // A second challenge for the same request means the credentials were rejected.
                    let first = answered.insert(event.request_id.inner().clone());
                    let response = match (&credentials, from_proxy, first) {
                        (Some((username, password)), true, true) => AuthChallengeResponse::builder()
                            .response(AuthChallengeResponseResponse::ProvideCredentials)
                            .username(username.clone())
                            .password(password.clone())
                            .build(),
                        (_, _, false) => AuthChallengeResponse::builder()
                            .response(AuthChallengeResponseResponse::CancelAuth)
                            .build(),
                        _ => AuthChallengeResponse::builder()
                            .response(AuthChallengeResponseResponse::Default)
                            .build(),
                    };
                    match response {
                        Ok(response) => {
                            let _ = page
                                .execute(ContinueWithAuthParams::new(event.request_id.clone(), response))
                                .await;
                        }
                        Err(err) => log::debug!("could not build auth response: {}", err),
                    }
                }
                else => break,
            }
        }
    }))
}

/// Network domain: document hops and statistics. With `early_stop` the load
/// is stopped once the expected destination answers.
async fn record_network(
    page: &Page,
    recorder: &Shared,
    early_stop: Option<(TraceContext, Arc<Notify>)>,
) -> Result<JoinHandle<()>, TracerError> {
    let mut requests = page.event_listener::<EventRequestWillBeSent>().await.map_err(browser_error)?;
    let mut responses = page.event_listener::<EventResponseReceived>().await.map_err(browser_error)?;
    let mut finished = page.event_listener::<EventLoadingFinished>().await.map_err(browser_error)?;
    let mut failed = page.event_listener::<EventLoadingFailed>().await.map_err(browser_error)?;

    let page = page.clone();
    let recorder = recorder.clone();
    Ok(tokio::spawn(async move {
        loop {
            tokio::select! {
                Some(event) = requests.next() => {
                    let mut state = lock(&recorder);
                    if let Some(url) = state.on_request(&request_sent(&event))
                        && let Some((ctx, _)) = &early_stop
                        && let Ok(parsed) = Url::parse(&url)
                        && ctx.reached_expected_host(&parsed)
                    {
                        state.expected_request = Some(event.request_id.inner().clone());
                    }
                }
                Some(event) = responses.next() => {
                    let stop = {
                        let mut state = lock(&recorder);
                        state.on_response(event.request_id.inner(), event.response.status);
                        let hit = state.expected_request.as_deref() == Some(event.request_id.inner().as_str());
                        if hit {
                            state.expected_reached = true;
                        }
                        hit
                    };
                    if stop && let Some((_, expected)) = &early_stop {
                        log::debug!("expected destination reached; stopping page load");
                        let _ = page.execute(StopLoadingParams::default()).await;
                        expected.notify_one();
                    }
                }
                Some(event) = finished.next() => {
                    lock(&recorder).on_finished(event.request_id.inner(), event.encoded_data_length);
                }
                Some(event) = failed.next() => {
                    lock(&recorder).on_failed(&LoadingFailed {
                        request_id: event.request_id.inner().clone(),
                        error_text: event.error_text.clone(),
                        canceled: event.canceled.unwrap_or(false),
                        blocked: event.blocked_reason.is_some(),
                    });
                }
                else => break,
            }
        }
    }))
}

/// Page domain and instrumentation reports. Opened windows go to `popups`;
/// without a receiver they are only logged.
async fn record_page(
    page: &Page,
    recorder: &Shared,
    popups: Option<mpsc::UnboundedSender<PopupOpened>>,
) -> Result<JoinHandle<()>, TracerError> {
    let mut navigated = page.event_listener::<EventFrameNavigated>().await.map_err(browser_error)?;
    let mut opened = page.event_listener::<EventWindowOpen>().await.map_err(browser_error)?;
    let mut reports = page.event_listener::<EventBindingCalled>().await.map_err(browser_error)?;

    let recorder = recorder.clone();
    Ok(tokio::spawn(async move {
        loop {
            tokio::select! {
                Some(event) = navigated.next() => {
                    lock(&recorder).on_frame_navigated(
                        event.frame.id.inner(),
                        event.frame.parent_id.as_ref().map(|id| id.inner().as_str()),
                        &event.frame.url,
                    );
                }
                Some(event) = opened.next() => match &popups {
                    Some(popups) => {
                        let opener_url = lock(&recorder)
                            .hops
                            .last()
                            .map(|hop| hop.url.clone())
                            .unwrap_or_default();
                        let _ = popups.send(PopupOpened { url: event.url.clone(), opener_url });
                    }
                    None => log::debug!("nested popup {} not followed", event.url),
                },
                Some(event) = reports.next() => {
                    if event.name == REPORT_BINDING {
                        lock(&recorder).on_report(&event.payload);
                    }
                }
                else => break,
            }
        }
    }))
}

/// Network events plus Fetch interception with proxy auth handling.
async fn enable_interception(page: &Page) -> Result<(), TracerError> {
    page.execute(network::EnableParams::default()).await.map_err(browser_error)?;
    let interception = fetch::EnableParams::builder()
        .pattern(RequestPattern::builder().url_pattern("*").build())
        .handle_auth_requests(true)
        .build();
    page.execute(interception).await.map_err(browser_error)?;
    Ok(())
}

/// Fingerprint, stealth patches and hooks, applied before the first navigation.
async fn instrument(page: &Page, ctx: &TraceContext, profile: RunProfile) -> Result<(), TracerError> {
    let fingerprint = &ctx.fingerprint;

    page.execute(AddBindingParams::new(REPORT_BINDING))
        .await
        .map_err(browser_error)?;

    let user_agent = SetUserAgentOverrideParams::builder()
        .user_agent(ctx.user_agent.clone())
        .accept_language(fingerprint.accept_language.clone())
        .platform(instrumentation::platform_for(&ctx.user_agent))
        .build()
        .map_err(TracerError::Browser)?;
    page.execute(user_agent).await.map_err(browser_error)?;

    let metrics = SetDeviceMetricsOverrideParams::new(
        i64::from(fingerprint.viewport.width),
        i64::from(fingerprint.viewport.height),
        fingerprint.pixel_ratio,
        fingerprint.device_type.is_touch(),
    );
    if let Err(err) = page.execute(metrics).await {
        log::warn!("device metrics override failed: {}", err);
    }
    if fingerprint.device_type.is_touch()
        && let Err(err) = page.execute(SetTouchEmulationEnabledParams::new(true)).await
    {
        log::debug!("touch emulation failed: {}", err);
    }
    if let Err(err) = page
        .execute(SetTimezoneOverrideParams::new(fingerprint.timezone_label.clone()))
        .await
    {
        log::debug!("timezone override failed: {}", err);
    }

    let mut scripts = vec![
        instrumentation::stealth_script(fingerprint, &ctx.user_agent),
        instrumentation::redirect_hooks_script(),
    ];
    if profile.anti_cloaking {
        scripts.push(instrumentation::noise_script(fingerprint));
    }
    for source in scripts {
        page.execute(AddScriptToEvaluateOnNewDocumentParams::new(source))
            .await
            .map_err(browser_error)?;
    }
    Ok(())
}

async fn follow_up_candidates(page: &Page, recorder: &Shared, current: &Url, html: &str) -> FollowUpCandidates {
    let target_variable = match EvaluateParams::builder()
        .expression(TARGET_VARIABLE_LOOKUP)
        .return_by_value(true)
        .build()
    {
        Ok(params) => page
            .evaluate_expression(params)
            .await
            .ok()
            .and_then(|result| result.into_value::<Option<String>>().ok())
            .flatten(),
        Err(_) => None,
    };

    let captured_top = lock(recorder)
        .js_log
        .iter()
        .rev()
        .find(|entry| entry.kind == "top_navigation" && !entry.url.is_empty())
        .map(|entry| entry.url.clone());
    let top_navigation = match captured_top.or_else(|| signals::top_navigation_target(html)) {
        Some(target) => Some(target),
        None => child_frame_top_target(page).await,
    };

    FollowUpCandidates {
        target_variable,
        form_action: signals::first_form_action(html, current),
        top_navigation,
    }
}

/// First `top`/`parent` location assignment in the source of any child
/// frame, resolved against that frame's URL. Covers sandboxed frames whose
/// forced navigation the browser refused.
async fn child_frame_top_target(page: &Page) -> Option<String> {
    let tree = match page.execute(GetFrameTreeParams::default()).await {
        Ok(response) => response.result.frame_tree,
        Err(err) => {
            log::debug!("could not read frame tree: {}", err);
            return None;
        }
    };

    let mut frames: Vec<FrameTree> = tree.child_frames.unwrap_or_default();
    while let Some(node) = frames.pop() {
        let frame_url = node.frame.url.clone();
        let content = tokio::time::timeout(
            CONTENT_TIMEOUT,
            page.execute(GetResourceContentParams::new(node.frame.id.clone(), frame_url.clone())),
        )
        .await;
        if let Ok(Ok(response)) = content
            && !response.result.base64_encoded
            && let Some(target) = signals::top_navigation_target(&response.result.content)
        {
            let resolved = Url::parse(&frame_url)
                .ok()
                .and_then(|base| signals::resolve(&base, &target))
                .map(|url| url.to_string());
            log::debug!("child frame {} forces top navigation", frame_url);
            return Some(resolved.unwrap_or(target));
        }
        frames.extend(node.child_frames.unwrap_or_default());
    }
    None
}

async fn current_url(page: &Page) -> Option<Url> {
    let url = tokio::time::timeout(CONTENT_TIMEOUT, page.url()).await.ok()?.ok()??;
    Url::parse(&url)
        .ok()
        .filter(|url| matches!(url.scheme(), "http" | "https"))
}

async fn page_content(page: &Page) -> String {
    match tokio::time::timeout(CONTENT_TIMEOUT, page.content()).await {
        Ok(Ok(html)) => html,
        Ok(Err(err)) => {
            log::debug!("could not read page content: {}", err);
            String::new()
        }
        Err(_) => String::new(),
    }
}
