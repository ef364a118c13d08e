//! Device fingerprint synthesis.
//!
//! Derives a client fingerprint whose device category always matches the one
//! implied by the user-agent string, so the viewport, pixel ratio and headers a
//! destination observes never contradict the advertised browser.

use once_cell::sync::Lazy;
use rand::{Rng, seq::SliceRandom};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Device category implied by a user-agent string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Desktop,
    Mobile,
    Tablet,
}

impl DeviceType {
    pub fn as_str(self) -> &'static str {
        match self {
            DeviceType::Desktop => "desktop",
            DeviceType::Mobile => "mobile",
            DeviceType::Tablet => "tablet",
        }
    }

    pub fn is_touch(self) -> bool {
        !matches!(self, DeviceType::Desktop)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

/// Client-observable signals presented for the whole lifetime of one trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub device_type: DeviceType,
    pub viewport: Viewport,
    pub pixel_ratio: f64,
    pub color_depth: u8,
    pub accept_language: String,
    pub accept_encoding: String,
    pub timezone_label: String,
    pub webgl_vendor: String,
    pub webgl_renderer: String,
    /// Seed for canvas/WebGL output perturbation in stealth browser runs.
    pub noise_seed: u32,
}

impl Fingerprint {
    /// Language tags for `navigator.languages`, derived from the Accept-Language value.
    pub fn languages(&self) -> Vec<String> {
        self.accept_language
            .split(',')
            .map(|part| part.split(';').next().unwrap_or_default().trim().to_string())
            .filter(|tag| !tag.is_empty())
            .collect()
    }
}

static MOBILE_UA: Lazy<Regex> = Lazy::new(|| {
    build_regex(r"iphone|ipod|android.*mobile|windows phone|blackberry|iemobile|opera mini")
});

static TABLET_UA: Lazy<Regex> =
    Lazy::new(|| build_regex(r"ipad|tablet|kindle|silk|playbook|android"));

fn build_regex(pattern: &str) -> Regex {
    regex::RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .unwrap_or_else(|err| panic!("invalid device classification regex `{}`: {}", pattern, err))
}

/// Classifies a user-agent string. Mobile wins over tablet, tablet over desktop.
pub fn classify_device(user_agent: &str) -> DeviceType {
    if MOBILE_UA.is_match(user_agent) {
        DeviceType::Mobile
    } else if TABLET_UA.is_match(user_agent) {
        DeviceType::Tablet
    } else {
        DeviceType::Desktop
    }
}

const ACCEPT_LANGUAGES: &[&str] = &[
    "en-US,en;q=0.9",
    "en-GB,en;q=0.9",
    "en-US,en;q=0.8",
    "en-CA,en;q=0.9,fr-CA;q=0.7",
    "en-AU,en;q=0.9",
];

const ACCEPT_ENCODINGS: &[&str] = &["gzip, deflate, br", "gzip, deflate", "gzip, deflate, br, zstd"];

const TIMEZONES: &[&str] = &[
    "America/New_York",
    "America/Chicago",
    "America/Los_Angeles",
    "Europe/London",
    "Europe/Berlin",
    "Australia/Sydney",
];

const JITTER_PX: i32 = 10;

struct DeviceCatalog {
    resolutions: &'static [(u32, u32)],
    pixel_ratios: &'static [f64],
    webgl: &'static [(&'static str, &'static str)],
}

const DESKTOP: DeviceCatalog = DeviceCatalog {
    resolutions: &[
        (1920, 1080),
        (1366, 768),
        (1536, 864),
        (1440, 900),
        (1280, 720),
        (2560, 1440),
    ],
    pixel_ratios: &[1.0, 1.25, 1.5],
    webgl: &[
        ("Google Inc. (NVIDIA)", "ANGLE (NVIDIA, NVIDIA GeForce RTX 3060 Direct3D11 vs_5_0 ps_5_0, D3D11)"),
        ("Google Inc. (Intel)", "ANGLE (Intel, Intel(R) UHD Graphics 630 Direct3D11 vs_5_0 ps_5_0, D3D11)"),
        ("Google Inc. (AMD)", "ANGLE (AMD, AMD Radeon RX 6700 XT Direct3D11 vs_5_0 ps_5_0, D3D11)"),
    ],
};

const MOBILE: DeviceCatalog = DeviceCatalog {
    resolutions: &[
        (375, 667),
        (375, 812),
        (390, 844),
        (393, 851),
        (412, 915),
        (414, 896),
    ],
    pixel_ratios: &[2.0, 2.5, 3.0],
    webgl: &[
        ("Apple Inc.", "Apple GPU"),
        ("Qualcomm", "Adreno (TM) 730"),
        ("ARM", "Mali-G710"),
    ],
};

const TABLET: DeviceCatalog = DeviceCatalog {
    resolutions: &[(768, 1024), (810, 1080), (820, 1180), (834, 1194), (800, 1280)],
    pixel_ratios: &[1.5, 2.0],
    webgl: &[("Apple Inc.", "Apple GPU"), ("Qualcomm", "Adreno (TM) 650")],
};

fn catalog(device: DeviceType) -> &'static DeviceCatalog {
    match device {
        DeviceType::Desktop => &DESKTOP,
        DeviceType::Mobile => &MOBILE,
        DeviceType::Tablet => &TABLET,
    }
}

/// Stateless fingerprint generator.
///
/// Call [`FingerprintSynthesizer::synthesize`] once per trace and reuse the
/// result: regenerating mid-trace would present two different devices to the
/// same destination.
#[derive(Debug, Default, Clone, Copy)]
pub struct FingerprintSynthesizer;

impl FingerprintSynthesizer {
    pub fn new() -> Self {
        Self
    }

    pub fn synthesize(&self, user_agent: &str) -> Fingerprint {
        self.synthesize_with(user_agent, &mut rand::thread_rng())
    }

    pub fn synthesize_with<R: Rng + ?Sized>(&self, user_agent: &str, rng: &mut R) -> Fingerprint {
        let device_type = classify_device(user_agent);
        let catalog = catalog(device_type);

        let (base_width, base_height) = catalog
            .resolutions
            .choose(rng)
            .copied()
            .unwrap_or((1920, 1080));
        let viewport = Viewport {
            width: jitter(rng, base_width),
            height: jitter(rng, base_height),
        };

        let (webgl_vendor, webgl_renderer) = catalog
            .webgl
            .choose(rng)
            .copied()
            .unwrap_or(("Google Inc.", "ANGLE"));

        Fingerprint {
            device_type,
            viewport,
            pixel_ratio: catalog.pixel_ratios.choose(rng).copied().unwrap_or(1.0),
            color_depth: if rng.gen_bool(0.5) { 24 } else { 32 },
            accept_language: pick(rng, ACCEPT_LANGUAGES, "en-US,en;q=0.9"),
            accept_encoding: pick(rng, ACCEPT_ENCODINGS, "gzip, deflate"),
            timezone_label: pick(rng, TIMEZONES, "America/New_York"),
            webgl_vendor: webgl_vendor.to_string(),
            webgl_renderer: webgl_renderer.to_string(),
            noise_seed: rng.r#gen(),
        }
    }
}

fn jitter<R: Rng + ?Sized>(rng: &mut R, base: u32) -> u32 {
    let offset = rng.gen_range(-JITTER_PX..=JITTER_PX);
    (base as i32 + offset).max(1) as u32
}

fn pick<R: Rng + ?Sized>(rng: &mut R, items: &[&str], fallback: &str) -> String {
    items.choose(rng).copied().unwrap_or(fallback).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const IPHONE: &str = "Mozilla/5.0 (iPhone; CPU iPhone OS 17_0 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.0 Mobile/15E148 Safari/604.1";
    const IPAD: &str = "Mozilla/5.0 (iPad; CPU OS 17_0 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.0 Mobile/15E148 Safari/604.1";
    const ANDROID_TABLET: &str = "Mozilla/5.0 (Linux; Android 13; SM-X706B) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
    const ANDROID_PHONE: &str = "Mozilla/5.0 (Linux; Android 14; Pixel 8) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Mobile Safari/537.36";
    const WINDOWS: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

    #[test]
    fn classifies_devices_by_priority() {
        assert_eq!(classify_device(IPHONE), DeviceType::Mobile);
        assert_eq!(classify_device(ANDROID_PHONE), DeviceType::Mobile);
        assert_eq!(classify_device(IPAD), DeviceType::Tablet);
        assert_eq!(classify_device(ANDROID_TABLET), DeviceType::Tablet);
        assert_eq!(classify_device(WINDOWS), DeviceType::Desktop);
    }

    #[test]
    fn mobile_fingerprints_stay_in_range() {
        let synth = FingerprintSynthesizer::new();
        for _ in 0..200 {
            let fp = synth.synthesize(IPHONE);
            assert_eq!(fp.device_type, DeviceType::Mobile);
            assert!((365..=424).contains(&fp.viewport.width), "width {}", fp.viewport.width);
            assert!([2.0, 2.5, 3.0].contains(&fp.pixel_ratio));
            assert!(fp.color_depth == 24 || fp.color_depth == 32);
        }
    }

    #[test]
    fn tablet_and_desktop_fingerprints_stay_in_range() {
        let synth = FingerprintSynthesizer::new();
        for _ in 0..200 {
            let tablet = synth.synthesize(IPAD);
            assert!((758..=844).contains(&tablet.viewport.width));
            assert!([1.5, 2.0].contains(&tablet.pixel_ratio));

            let desktop = synth.synthesize(WINDOWS);
            assert!((1270..=2570).contains(&desktop.viewport.width));
            assert!([1.0, 1.25, 1.5].contains(&desktop.pixel_ratio));
        }
    }

    #[test]
    fn languages_follow_accept_language() {
        let mut fp = FingerprintSynthesizer::new().synthesize(WINDOWS);
        fp.accept_language = "en-CA,en;q=0.9,fr-CA;q=0.7".into();
        assert_eq!(fp.languages(), vec!["en-CA", "en", "fr-CA"]);
    }
}
