//! Redirect and cloaking signals extracted from rendered pages.
//!
//! Everything here is a pure function over a URL and/or an HTML snapshot, so
//! the browser driver can stay a thin loop around the DevTools session.

use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{Html, Selector};
use url::Url;

use crate::tracers::types::CloakingIndicator;

/// Query parameters that commonly carry the next hop of a click wrapper.
const REDIRECT_PARAMS: &[&str] = &["url", "redirect", "target"];

/// How a hidden redirect was found after the page went idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HiddenRedirectKind {
    QueryParameter,
    MetaRefresh,
    ScriptLocation,
}

impl HiddenRedirectKind {
    pub fn as_str(self) -> &'static str {
        match self {
            HiddenRedirectKind::QueryParameter => "query_parameter",
            HiddenRedirectKind::MetaRefresh => "meta_refresh",
            HiddenRedirectKind::ScriptLocation => "script_location",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HiddenRedirect {
    pub kind: HiddenRedirectKind,
    pub target: Url,
}

static META_REFRESH_URL: Lazy<Regex> = Lazy::new(|| build_regex(r#"url\s*=\s*['"]?\s*([^'"\s>]+)"#));

static SCRIPT_LOCATION: Lazy<Regex> = Lazy::new(|| {
    build_regex(
        r#"(?:(?:window|document|self)\.)?location(?:\.href)?\s*=\s*['"]([^'"]+)['"]|location\.(?:replace|assign)\(\s*['"]([^'"]+)['"]"#,
    )
});

static TOP_LOCATION: Lazy<Regex> = Lazy::new(|| {
    build_regex(
        r#"(?:window\.)?(?:top|parent)\.location(?:\.href)?\s*=\s*['"]([^'"]+)['"]|(?:top|parent)\.location\.(?:replace|assign)\(\s*['"]([^'"]+)['"]"#,
    )
});

static OBFUSCATED_SCRIPT: Lazy<Regex> = Lazy::new(|| {
    build_regex(r"eval\s*\(\s*(?:atob|unescape|decodeURIComponent|String\.fromCharCode)|atob\s*\(\s*['\x22][A-Za-z0-9+/=]{40,}|[A-Za-z0-9+/]{200,}={0,2}")
});

static BOT_DETECTION: Lazy<Regex> = Lazy::new(|| {
    build_regex(r"navigator\.webdriver|\bheadless\b|phantomjs|selenium|puppeteer|bot[_-]?detect|\bis_?bot\b|callPhantom")
});

static DELAYED_REDIRECT: Lazy<Regex> =
    Lazy::new(|| build_regex(r"set(?:Timeout|Interval)\s*\(.{0,400}?(?:location|redirect)"));

static SCRIPT_SELECTOR: Lazy<Selector> = Lazy::new(|| build_selector("script"));
static META_SELECTOR: Lazy<Selector> = Lazy::new(|| build_selector("meta[http-equiv]"));
static FORM_SELECTOR: Lazy<Selector> = Lazy::new(|| build_selector("form"));

fn build_regex(pattern: &str) -> Regex {
    regex::RegexBuilder::new(pattern)
        .case_insensitive(true)
        .dot_matches_new_line(true)
        .build()
        .unwrap_or_else(|err| panic!("invalid redirect signal regex `{}`: {}", pattern, err))
}

fn build_selector(selector: &str) -> Selector {
    Selector::parse(selector).unwrap_or_else(|err| panic!("invalid selector `{}`: {:?}", selector, err))
}

/// `url=`/`redirect=`/`target=` parameter of `current` pointing at an absolute http(s) URL.
pub fn query_redirect_target(current: &Url) -> Option<Url> {
    current
        .query_pairs()
        .find(|(key, value)| {
            REDIRECT_PARAMS.iter().any(|name| key.eq_ignore_ascii_case(name)) && !value.is_empty()
        })
        .and_then(|(_, value)| Url::parse(value.trim()).ok())
        .filter(is_web_url)
}

/// Target of the first `<meta http-equiv="refresh">` tag, unresolved.
pub fn meta_refresh_target(html: &str) -> Option<String> {
    let document = Html::parse_document(html);
    document
        .select(&META_SELECTOR)
        .filter(|meta| {
            meta.value()
                .attr("http-equiv")
                .is_some_and(|value| value.trim().eq_ignore_ascii_case("refresh"))
        })
        .filter_map(|meta| meta.value().attr("content"))
        .find_map(|content| {
            META_REFRESH_URL
                .captures(content)
                .and_then(|caps| caps.get(1))
                .map(|m| html_escape::decode_html_entities(m.as_str()).trim().to_string())
        })
}

/// First `location` assignment found in inline scripts, unresolved.
pub fn script_location_target(html: &str) -> Option<String> {
    inline_scripts(html)
        .iter()
        .find_map(|script| first_capture(&SCRIPT_LOCATION, script))
}

/// First forced `top`/`parent` navigation found in inline scripts, unresolved.
pub fn top_navigation_target(html: &str) -> Option<String> {
    inline_scripts(html)
        .iter()
        .find_map(|script| first_capture(&TOP_LOCATION, script))
}

/// Action of the first form on the page, resolved against `base`.
pub fn first_form_action(html: &str, base: &Url) -> Option<Url> {
    let document = Html::parse_document(html);
    let action = document
        .select(&FORM_SELECTOR)
        .next()?
        .value()
        .attr("action")?
        .trim()
        .to_string();
    if action.is_empty() || action.starts_with('#') || action.to_ascii_lowercase().starts_with("javascript:") {
        return None;
    }
    base.join(&action).ok().filter(is_web_url)
}

/// Looks for a redirect the page did not perform on its own. Query
/// parameters win over meta refresh, meta refresh over script assignments.
/// Targets equal to the current page are ignored.
pub fn find_hidden_redirect(current: &Url, html: &str) -> Option<HiddenRedirect> {
    let candidates = [
        (HiddenRedirectKind::QueryParameter, query_redirect_target(current)),
        (
            HiddenRedirectKind::MetaRefresh,
            meta_refresh_target(html).and_then(|target| resolve(current, &target)),
        ),
        (
            HiddenRedirectKind::ScriptLocation,
            script_location_target(html).and_then(|target| resolve(current, &target)),
        ),
    ];
    candidates.into_iter().find_map(|(kind, target)| {
        target
            .filter(|target| !same_document(target, current))
            .map(|target| HiddenRedirect { kind, target })
    })
}

/// Resolves a possibly relative target against the page it was found on.
pub fn resolve(base: &Url, target: &str) -> Option<Url> {
    base.join(target.trim()).ok().filter(is_web_url)
}

/// Qualitative cloaking indicators present in a page body, in a fixed order.
pub fn cloaking_indicators(html: &str) -> Vec<CloakingIndicator> {
    let scripts = inline_scripts(html).join("\n");
    let mut indicators = Vec::new();
    if OBFUSCATED_SCRIPT.is_match(&scripts) {
        indicators.push(CloakingIndicator::ObfuscatedScript);
    }
    if BOT_DETECTION.is_match(&scripts) {
        indicators.push(CloakingIndicator::BotDetectionKeyword);
    }
    if DELAYED_REDIRECT.is_match(&scripts) {
        indicators.push(CloakingIndicator::DelayedRedirect);
    }
    if meta_refresh_target(html).is_some() {
        indicators.push(CloakingIndicator::MetaRefresh);
    }
    indicators
}

pub fn same_document(a: &Url, b: &Url) -> bool {
    let mut a = a.clone();
    let mut b = b.clone();
    a.set_fragment(None);
    b.set_fragment(None);
    a == b
}

fn inline_scripts(html: &str) -> Vec<String> {
    let document = Html::parse_document(html);
    document
        .select(&SCRIPT_SELECTOR)
        .filter(|script| script.value().attr("src").is_none())
        .map(|script| script.text().collect::<String>())
        .filter(|text| !text.trim().is_empty())
        .collect()
}

fn first_capture(regex: &Regex, haystack: &str) -> Option<String> {
    regex.captures(haystack).and_then(|caps| {
        caps.iter()
            .skip(1)
            .flatten()
            .next()
            .map(|m| m.as_str().trim().to_string())
    })
}

fn is_web_url(url: &Url) -> bool {
    matches!(url.scheme(), "http" | "https")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(value: &str) -> Url {
        Url::parse(value).unwrap()
    }

    #[test]
    fn finds_query_parameter_target() {
        let current = url("https://click.test/r?campaign=1&redirect=https%3A%2F%2Fshop.test%2Fp%3Fid%3D7");
        let target = query_redirect_target(&current).unwrap();
        assert_eq!(target.as_str(), "https://shop.test/p?id=7");
        assert!(query_redirect_target(&url("https://click.test/r?url=javascript:alert(1)")).is_none());
    }

    #[test]
    fn parses_meta_refresh_variants() {
        let html = r#"<html><head><meta http-equiv="Refresh" content="0; URL='https://shop.test/a?x=1&amp;y=2'"></head></html>"#;
        assert_eq!(meta_refresh_target(html).as_deref(), Some("https://shop.test/a?x=1&y=2"));
        let plain = r#"<meta http-equiv="refresh" content="3;url=/landing">"#;
        assert_eq!(meta_refresh_target(plain).as_deref(), Some("/landing"));
        assert!(meta_refresh_target(r#"<meta http-equiv="content-type" content="text/html">"#).is_none());
    }

    #[test]
    fn finds_script_location_assignments() {
        let html = r#"<script src="/app.js"></script><script>var x = 1; window.location.href = "https://shop.test/";</script>"#;
        assert_eq!(script_location_target(html).as_deref(), Some("https://shop.test/"));
        let replace = "<script>location.replace('/next')</script>";
        assert_eq!(script_location_target(replace).as_deref(), Some("/next"));
    }

    #[test]
    fn finds_top_navigation() {
        let html = "<script>if (self !== top) { top.location.href = 'https://real.test/'; }</script>";
        assert_eq!(top_navigation_target(html).as_deref(), Some("https://real.test/"));
    }

    #[test]
    fn hidden_redirect_priority_and_resolution() {
        let current = url("https://click.test/path/page");
        let html = r#"<meta http-equiv="refresh" content="0;url=../final"><script>location = "/other";</script>"#;
        let found = find_hidden_redirect(&current, html).unwrap();
        assert_eq!(found.kind, HiddenRedirectKind::MetaRefresh);
        assert_eq!(found.target.as_str(), "https://click.test/final");
    }

    #[test]
    fn ignores_self_targets() {
        let current = url("https://click.test/page");
        let html = r#"<meta http-equiv="refresh" content="30;url=/page#top">"#;
        assert!(find_hidden_redirect(&current, html).is_none());
    }

    #[test]
    fn resolves_first_form_action() {
        let html = r#"<form action="/go?c=1" method="post"></form><form action="/second"></form>"#;
        let action = first_form_action(html, &url("https://click.test/a/b")).unwrap();
        assert_eq!(action.as_str(), "https://click.test/go?c=1");
        assert!(first_form_action(r#"<form action="javascript:void(0)"></form>"#, &url("https://click.test/")).is_none());
    }

    #[test]
    fn scores_cloaking_indicators() {
        let html = r#"
            <meta http-equiv="refresh" content="5;url=https://real.test/">
            <script>if (navigator.webdriver) { document.body.innerHTML = ''; }</script>
            <script>setTimeout(function () { window.location = 'https://real.test/'; }, 3000);</script>
            <script>eval(atob('ZG9jdW1lbnQud3JpdGUoJ2hpJyk='));</script>
        "#;
        assert_eq!(
            cloaking_indicators(html),
            vec![
                CloakingIndicator::ObfuscatedScript,
                CloakingIndicator::BotDetectionKeyword,
                CloakingIndicator::DelayedRedirect,
                CloakingIndicator::MetaRefresh,
            ]
        );
        assert!(cloaking_indicators("<p>plain page</p>").is_empty());
    }
}
