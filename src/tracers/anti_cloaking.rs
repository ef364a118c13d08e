//! Stealth variant of the browser tracer.
//!
//! Adds canvas/WebGL read-back noise, a longer idle window, captured
//! `top`/`parent` navigations, and a one-shot follow of page-level redirect
//! hints once the page settles. The settled page is scored for cloaking.

use async_trait::async_trait;
use url::Url;

use super::browser::{BrowserSettings, signals};
use super::types::{Aggressiveness, CloakingIndicator, TraceResult};
use super::{RedirectTracer, TraceContext, TraceMode, TracerError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FollowUpKind {
    /// A page-global `targetUrl`-style variable.
    TargetVariable,
    FormAction,
    /// A navigation a frame forced onto `top`/`parent`.
    TopNavigation,
}

impl FollowUpKind {
    pub fn method(self) -> &'static str {
        match self {
            FollowUpKind::TargetVariable => "anti_cloak_target_variable",
            FollowUpKind::FormAction => "anti_cloak_form_action",
            FollowUpKind::TopNavigation => "anti_cloak_top_navigation",
        }
    }
}

/// Redirect hints gathered from a settled page.
#[derive(Debug, Clone, Default)]
pub struct FollowUpCandidates {
    pub target_variable: Option<String>,
    pub form_action: Option<Url>,
    pub top_navigation: Option<String>,
}

/// Tracks which follow-ups were already taken. Each kind fires at most once
/// per trace, which bounds the extra navigations to three.
#[derive(Debug, Clone, Default)]
pub struct FollowUpPlan {
    used: Vec<FollowUpKind>,
}

impl FollowUpPlan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next target to navigate to, consuming its kind. Targets that resolve
    /// to the current document are skipped without consuming anything.
    pub fn next(&mut self, current: &Url, candidates: &FollowUpCandidates) -> Option<(FollowUpKind, Url)> {
        let ordered = [
            (
                FollowUpKind::TargetVariable,
                candidates
                    .target_variable
                    .as_deref()
                    .and_then(|target| signals::resolve(current, target)),
            ),
            (FollowUpKind::FormAction, candidates.form_action.clone()),
            (
                FollowUpKind::TopNavigation,
                candidates
                    .top_navigation
                    .as_deref()
                    .and_then(|target| signals::resolve(current, target)),
            ),
        ];

        let (kind, target) = ordered.into_iter().find_map(|(kind, target)| {
            if self.used.contains(&kind) {
                return None;
            }
            target
                .filter(|target| !signals::same_document(target, current))
                .map(|target| (kind, target))
        })?;
        self.used.push(kind);
        Some((kind, target))
    }

    pub fn used(&self) -> &[FollowUpKind] {
        &self.used
    }
}

/// Cloaking indicators of the settled page and the derived aggressiveness.
pub fn assess(html: &str, popups: usize) -> (Vec<CloakingIndicator>, Aggressiveness) {
    let indicators = signals::cloaking_indicators(html);
    let level = Aggressiveness::from_signals(indicators.len(), popups);
    (indicators, level)
}

#[derive(Debug, Clone, Default)]
pub struct AntiCloakingTracer {
    settings: BrowserSettings,
}

impl AntiCloakingTracer {
    pub fn new(settings: BrowserSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl RedirectTracer for AntiCloakingTracer {
    fn mode(&self) -> TraceMode {
        TraceMode::AntiCloaking
    }

    #[cfg(feature = "browser")]
    async fn trace(&self, ctx: &TraceContext) -> Result<TraceResult, TracerError> {
        use super::browser::driver;
        driver::run(&self.settings, ctx, driver::RunProfile::anti_cloaking(&self.settings)).await
    }

    #[cfg(not(feature = "browser"))]
    async fn trace(&self, _ctx: &TraceContext) -> Result<TraceResult, TracerError> {
        Err(TracerError::BrowserUnavailable)
    }
}
