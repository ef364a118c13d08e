//! Scripts injected before any page script runs.
//!
//! Two payloads: stealth patches that make the automated browser agree with
//! the trace fingerprint, and redirect hooks that report navigation attempts
//! through a DevTools runtime binding. Reports are JSON strings shaped like
//! [`JsRedirectEvent`](crate::tracers::types::JsRedirectEvent).

use serde_json::json;

use crate::modules::spoofing::Fingerprint;

/// Name of the runtime binding the hooks report through.
pub const REPORT_BINDING: &str = "__hoptraceReport";

/// Expression evaluated by the anti-cloaking follow-up to read a page-global
/// target URL, whether declared with `var`, `let`/`const` or on `window`.
pub const TARGET_VARIABLE_LOOKUP: &str = r#"(() => {
    const read = [
        () => typeof targetUrl !== 'undefined' ? targetUrl : null,
        () => typeof target_url !== 'undefined' ? target_url : null,
        () => typeof redirectUrl !== 'undefined' ? redirectUrl : null,
        () => typeof TARGET_URL !== 'undefined' ? TARGET_URL : null,
    ];
    for (const getter of read) {
        try {
            const value = getter();
            if (typeof value === 'string' && value.length > 0) return value;
        } catch (_) {}
    }
    return null;
})()"#;

const STEALTH_TEMPLATE: &str = r#"
(() => {
    const cfg = __CONFIG__;
    const define = (target, key, value) => {
        try {
            Object.defineProperty(target, key, { get: () => value, configurable: true });
        } catch (_) {}
    };
    define(Navigator.prototype, 'webdriver', undefined);
    define(navigator, 'languages', cfg.languages);
    define(navigator, 'language', cfg.languages[0] || 'en-US');
    define(navigator, 'platform', cfg.platform);
    define(navigator, 'hardwareConcurrency', cfg.hardwareConcurrency);
    define(navigator, 'maxTouchPoints', cfg.maxTouchPoints);
    define(screen, 'colorDepth', cfg.colorDepth);
    define(screen, 'pixelDepth', cfg.colorDepth);
    define(navigator, 'plugins', cfg.touch ? [] : [
        { name: 'PDF Viewer', filename: 'internal-pdf-viewer', description: 'Portable Document Format' },
        { name: 'Chrome PDF Viewer', filename: 'internal-pdf-viewer', description: 'Portable Document Format' },
        { name: 'Chromium PDF Viewer', filename: 'internal-pdf-viewer', description: 'Portable Document Format' },
    ]);
    if (!window.chrome) {
        window.chrome = { runtime: {}, loadTimes: function () {}, csi: function () {}, app: {} };
    }
    try {
        const query = window.navigator.permissions.query.bind(window.navigator.permissions);
        window.navigator.permissions.query = (parameters) => (
            parameters && parameters.name === 'notifications'
                ? Promise.resolve({ state: Notification.permission })
                : query(parameters)
        );
    } catch (_) {}
    const patchWebGl = (proto) => {
        if (!proto) return;
        const getParameter = proto.getParameter;
        proto.getParameter = function (parameter) {
            if (parameter === 37445) return cfg.webglVendor;
            if (parameter === 37446) return cfg.webglRenderer;
            return getParameter.call(this, parameter);
        };
    };
    patchWebGl(window.WebGLRenderingContext && WebGLRenderingContext.prototype);
    patchWebGl(window.WebGL2RenderingContext && WebGL2RenderingContext.prototype);
    for (const key of Object.keys(window)) {
        if (/^cdc_|^\$cdc_/.test(key)) {
            try { delete window[key]; } catch (_) {}
        }
    }
})();
"#;

const NOISE_TEMPLATE: &str = r#"
(() => {
    let seed = __SEED__ >>> 0;
    const next = () => {
        seed = (seed * 1664525 + 1013904223) >>> 0;
        return seed;
    };
    const perturb = (data) => {
        for (let i = 0; i < data.length; i += 4) {
            if ((next() & 0xff) < 8) data[i] = data[i] ^ 1;
        }
    };
    const ctx2d = window.CanvasRenderingContext2D && CanvasRenderingContext2D.prototype;
    const getImageData = ctx2d ? ctx2d.getImageData : null;
    if (getImageData) {
        ctx2d.getImageData = function (...args) {
            const image = getImageData.apply(this, args);
            perturb(image.data);
            return image;
        };
    }
    const canvas = window.HTMLCanvasElement && HTMLCanvasElement.prototype;
    if (canvas && getImageData) {
        const toDataURL = canvas.toDataURL;
        canvas.toDataURL = function (...args) {
            try {
                const context = this.getContext('2d');
                if (context && this.width > 0 && this.height > 0) {
                    const image = getImageData.call(context, 0, 0, this.width, this.height);
                    perturb(image.data);
                    context.putImageData(image, 0, 0);
                }
            } catch (_) {}
            return toDataURL.apply(this, args);
        };
    }
    for (const proto of [window.WebGLRenderingContext, window.WebGL2RenderingContext]) {
        if (!proto) continue;
        const readPixels = proto.prototype.readPixels;
        proto.prototype.readPixels = function (...args) {
            const result = readPixels.apply(this, args);
            const pixels = args[6];
            if (pixels && pixels.length) perturb(pixels);
            return result;
        };
    }
})();
"#;

const HOOKS_TEMPLATE: &str = r#"
(() => {
    if (window.__hoptraceHooked) return;
    window.__hoptraceHooked = true;
    const binding = __BINDING__;
    const frame = window === window.top ? 'main' : 'child';
    const report = (type, url, extra) => {
        try {
            const entry = Object.assign({ type, url: String(url || ''), timestamp: Date.now(), frame }, extra || {});
            window[binding](JSON.stringify(entry));
        } catch (_) {}
    };
    const absolute = (value) => {
        try { return new URL(String(value), document.baseURI).href; } catch (_) { return String(value || ''); }
    };
    const redirectish = /location|redirect/i;
    const firstUrl = (text) => {
        const match = /https?:\/\/[^'"\s)]+/i.exec(text);
        return match ? match[0] : '';
    };

    if (window.navigation && frame === 'main') {
        navigation.addEventListener('navigate', (event) => {
            if (event.destination && event.destination.url) {
                report('navigate', event.destination.url, { method: event.navigationType });
            }
        });
    }

    for (const name of ['setTimeout', 'setInterval']) {
        const original = window[name];
        window[name] = function (callback, delay, ...rest) {
            try {
                const body = typeof callback === 'function' ? Function.prototype.toString.call(callback) : String(callback);
                if (redirectish.test(body)) {
                    report('timer', firstUrl(body), { method: name + ':' + (delay || 0) });
                }
            } catch (_) {}
            return original.call(this, callback, delay, ...rest);
        };
    }

    const inspectMeta = (node) => {
        if (!node || node.nodeName !== 'META') return;
        const equiv = (node.getAttribute('http-equiv') || '').toLowerCase();
        if (equiv !== 'refresh') return;
        const content = node.getAttribute('content') || '';
        const match = /url\s*=\s*['"]?\s*([^'"\s>]+)/i.exec(content);
        report('meta_refresh', match ? absolute(match[1]) : '');
    };
    new MutationObserver((mutations) => {
        for (const mutation of mutations) {
            for (const node of mutation.addedNodes) inspectMeta(node);
        }
    }).observe(document, { childList: true, subtree: true });

    const submit = HTMLFormElement.prototype.submit;
    HTMLFormElement.prototype.submit = function () {
        report('form_submit', absolute(this.action), { method: (this.method || 'get').toLowerCase() });
        return submit.apply(this, arguments);
    };
    document.addEventListener('submit', (event) => {
        const form = event.target;
        if (form && form.action) {
            report('form_submit', absolute(form.action), { method: (form.method || 'get').toLowerCase() });
        }
    }, true);

    const open = window.open;
    window.open = function (url, target, features) {
        const name = String(target || '').toLowerCase();
        if (name === '_top' || name === '_parent') {
            report('top_navigation', absolute(url), { method: 'window.open' });
        } else {
            report('window_open', absolute(url));
        }
        return open.apply(this, arguments);
    };

    if (frame === 'child') {
        document.addEventListener('click', (event) => {
            const anchor = event.target && event.target.closest ? event.target.closest('a[target]') : null;
            if (!anchor) return;
            const name = anchor.target.toLowerCase();
            if (name === '_top' || name === '_parent') {
                report('top_navigation', absolute(anchor.href), { method: 'anchor' });
            }
        }, true);
    }
})();
"#;

/// Stealth patches matching `fingerprint` and the advertised user agent.
pub fn stealth_script(fingerprint: &Fingerprint, user_agent: &str) -> String {
    let config = json!({
        "languages": fingerprint.languages(),
        "platform": platform_for(user_agent),
        "hardwareConcurrency": if fingerprint.device_type.is_touch() { 8 } else { 4 + (fingerprint.noise_seed % 3) * 4 },
        "maxTouchPoints": if fingerprint.device_type.is_touch() { 5 } else { 0 },
        "touch": fingerprint.device_type.is_touch(),
        "colorDepth": fingerprint.color_depth,
        "webglVendor": fingerprint.webgl_vendor,
        "webglRenderer": fingerprint.webgl_renderer,
    });
    STEALTH_TEMPLATE.replace("__CONFIG__", &config.to_string())
}

/// Canvas and WebGL read-back perturbation seeded per trace.
pub fn noise_script(fingerprint: &Fingerprint) -> String {
    NOISE_TEMPLATE.replace("__SEED__", &fingerprint.noise_seed.to_string())
}

/// Navigation hooks reporting through [`REPORT_BINDING`].
pub fn redirect_hooks_script() -> String {
    HOOKS_TEMPLATE.replace("__BINDING__", &json!(REPORT_BINDING).to_string())
}

/// `navigator.platform` consistent with the user agent.
pub fn platform_for(user_agent: &str) -> &'static str {
    let lower = user_agent.to_ascii_lowercase();
    if lower.contains("iphone") {
        "iPhone"
    } else if lower.contains("ipad") {
        "iPad"
    } else if lower.contains("android") {
        "Linux armv8l"
    } else if lower.contains("windows") {
        "Win32"
    } else if lower.contains("mac os x") || lower.contains("macintosh") {
        "MacIntel"
    } else {
        "Linux x86_64"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::spoofing::FingerprintSynthesizer;

    const WINDOWS: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

    #[test]
    fn stealth_script_embeds_fingerprint() {
        let fingerprint = FingerprintSynthesizer::new().synthesize(WINDOWS);
        let script = stealth_script(&fingerprint, WINDOWS);
        assert!(!script.contains("__CONFIG__"));
        assert!(script.contains("\"platform\":\"Win32\""));
        assert!(script.contains(&fingerprint.webgl_renderer));
    }

    #[test]
    fn hooks_report_through_binding() {
        let script = redirect_hooks_script();
        assert!(script.contains("const binding = \"__hoptraceReport\";"));
        for kind in ["'navigate'", "'timer'", "'meta_refresh'", "'form_submit'", "'window_open'", "'top_navigation'"] {
            assert!(script.contains(kind), "missing {kind}");
        }
    }

    #[test]
    fn noise_script_is_seeded() {
        let mut fingerprint = FingerprintSynthesizer::new().synthesize(WINDOWS);
        fingerprint.noise_seed = 42;
        assert!(noise_script(&fingerprint).contains("let seed = 42 >>> 0;"));
    }

    #[test]
    fn platform_follows_user_agent() {
        assert_eq!(platform_for("Mozilla/5.0 (iPhone; CPU iPhone OS 17_0 like Mac OS X)"), "iPhone");
        assert_eq!(platform_for("Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7)"), "MacIntel");
        assert_eq!(platform_for("Mozilla/5.0 (X11; Linux x86_64)"), "Linux x86_64");
    }
}
