//! User-agent rotation.
//!
//! Responsibilities:
//! - Synthesize realistic user-agent strings with a weighted device draw.
//! - Serve them on demand, from a refreshing pool, or a hybrid of both.
//! - Report pool occupancy, repetition and device mix for observability.

use rand::Rng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::modules::spoofing::DeviceType;

/// Cap on the uniqueness window kept for dynamic mode statistics.
const SEEN_WINDOW: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum UserAgentMode {
    Dynamic,
    Pool,
    #[default]
    Hybrid,
}

#[derive(Debug, Clone)]
pub struct UserAgentRotatorConfig {
    pub mode: UserAgentMode,
    pub pool_size: usize,
    pub refresh_interval: Duration,
}

impl Default for UserAgentRotatorConfig {
    fn default() -> Self {
        Self {
            mode: UserAgentMode::Hybrid,
            pool_size: 50,
            refresh_interval: Duration::from_secs(6 * 3600),
        }
    }
}

/// A generated agent along with the device category it was drawn for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedAgent {
    pub user_agent: String,
    pub device: DeviceType,
}

/// Observability snapshot returned by [`UserAgentRotator::stats`].
#[derive(Debug, Clone, Serialize)]
pub struct UserAgentStats {
    pub mode: UserAgentMode,
    pub pool_size: usize,
    pub pool_occupancy: usize,
    pub requests_served: u64,
    pub total_generated: u64,
    pub unique_generated: u64,
    pub repetition_rate: f64,
    pub device_distribution: HashMap<DeviceType, u64>,
    pub seconds_since_refresh: u64,
}

#[derive(Debug)]
struct RotatorState {
    pool: Vec<GeneratedAgent>,
    cursor: usize,
    last_refresh: Instant,
    requests_served: u64,
    total_generated: u64,
    seen: HashSet<String>,
    unique_generated: u64,
    devices: HashMap<DeviceType, u64>,
}

impl RotatorState {
    fn new() -> Self {
        Self {
            pool: Vec::new(),
            cursor: 0,
            last_refresh: Instant::now(),
            requests_served: 0,
            total_generated: 0,
            seen: HashSet::new(),
            unique_generated: 0,
            devices: HashMap::new(),
        }
    }

    fn generate(&mut self) -> GeneratedAgent {
        let agent = generate_user_agent(&mut rand::thread_rng());
        self.total_generated += 1;
        *self.devices.entry(agent.device).or_insert(0) += 1;
        if self.seen.len() >= SEEN_WINDOW {
            self.seen.clear();
        }
        if self.seen.insert(agent.user_agent.clone()) {
            self.unique_generated += 1;
        }
        agent
    }

    /// Regenerates the pool until it holds `size` distinct agents.
    fn refill(&mut self, size: usize) {
        let mut fresh: Vec<GeneratedAgent> = Vec::with_capacity(size);
        let mut members = HashSet::with_capacity(size);
        while fresh.len() < size {
            let agent = self.generate();
            if members.insert(agent.user_agent.clone()) {
                fresh.push(agent);
            }
        }
        self.pool = fresh;
        self.cursor = 0;
        self.last_refresh = Instant::now();
    }
}

/// User-agent source shared by every trace in the process.
#[derive(Debug)]
pub struct UserAgentRotator {
    config: UserAgentRotatorConfig,
    state: Mutex<RotatorState>,
}

impl UserAgentRotator {
    pub fn new(config: UserAgentRotatorConfig) -> Self {
        let mut state = RotatorState::new();
        if config.mode != UserAgentMode::Dynamic {
            state.refill(config.pool_size);
        }
        log::debug!(
            "user-agent rotator ready (mode={:?}, pool={})",
            config.mode,
            state.pool.len()
        );
        Self {
            config,
            state: Mutex::new(state),
        }
    }

    pub fn mode(&self) -> UserAgentMode {
        self.config.mode
    }

    /// Round-robin selection in pool modes, fresh synthesis in dynamic mode.
    pub fn next(&self) -> String {
        self.serve(|state| {
            let agent = state.pool[state.cursor % state.pool.len()].user_agent.clone();
            state.cursor = (state.cursor + 1) % state.pool.len();
            agent
        })
    }

    /// Uniform random selection in pool modes, fresh synthesis in dynamic mode.
    pub fn random(&self) -> String {
        self.serve(|state| {
            state
                .pool
                .choose(&mut rand::thread_rng())
                .map(|agent| agent.user_agent.clone())
                .unwrap_or_default()
        })
    }

    /// Regenerates the pool immediately. No-op in dynamic mode.
    pub fn refresh(&self) {
        if self.config.mode == UserAgentMode::Dynamic {
            return;
        }
        let mut state = self.lock();
        state.refill(self.config.pool_size);
        log::info!("user-agent pool refreshed ({} agents)", state.pool.len());
    }

    pub fn stats(&self) -> UserAgentStats {
        let state = self.lock();
        let repetition_rate = if state.total_generated == 0 {
            0.0
        } else {
            1.0 - (state.unique_generated as f64 / state.total_generated as f64)
        };
        UserAgentStats {
            mode: self.config.mode,
            pool_size: self.config.pool_size,
            pool_occupancy: state.pool.len(),
            requests_served: state.requests_served,
            total_generated: state.total_generated,
            unique_generated: state.unique_generated,
            repetition_rate,
            device_distribution: state.devices.clone(),
            seconds_since_refresh: state.last_refresh.elapsed().as_secs(),
        }
    }

    fn serve(&self, select: impl FnOnce(&mut RotatorState) -> String) -> String {
        let mut state = self.lock();
        state.requests_served += 1;

        match self.config.mode {
            UserAgentMode::Dynamic => state.generate().user_agent,
            UserAgentMode::Pool | UserAgentMode::Hybrid => {
                if state.last_refresh.elapsed() >= self.config.refresh_interval {
                    state.refill(self.config.pool_size);
                }
                if state.pool.is_empty() {
                    // Pool mode with an empty pool still has to answer something.
                    if self.config.mode == UserAgentMode::Pool {
                        log::warn!("user-agent pool empty, generating on demand");
                    }
                    return state.generate().user_agent;
                }
                select(&mut state)
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, RotatorState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for UserAgentRotator {
    fn default() -> Self {
        Self::new(UserAgentRotatorConfig::default())
    }
}

/// Draws a device category (desktop 60% / mobile 30% / tablet 10%) and
/// synthesizes a matching user-agent string.
pub fn generate_user_agent<R: Rng + ?Sized>(rng: &mut R) -> GeneratedAgent {
    let device = match rng.gen_range(0..100) {
        0..=59 => DeviceType::Desktop,
        60..=89 => DeviceType::Mobile,
        _ => DeviceType::Tablet,
    };
    let user_agent = match device {
        DeviceType::Desktop => desktop_agent(rng),
        DeviceType::Mobile => mobile_agent(rng),
        DeviceType::Tablet => tablet_agent(rng),
    };
    GeneratedAgent { user_agent, device }
}

fn chrome_version<R: Rng + ?Sized>(rng: &mut R) -> String {
    let major = rng.gen_range(118..=131);
    let build = rng.gen_range(5993..=6778);
    let patch = rng.gen_range(0..=260);
    format!("{major}.0.{build}.{patch}")
}

fn desktop_agent<R: Rng + ?Sized>(rng: &mut R) -> String {
    match rng.gen_range(0..6) {
        0 | 1 => format!(
            "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/{} Safari/537.36",
            chrome_version(rng)
        ),
        2 => format!(
            "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/{} Safari/537.36",
            chrome_version(rng)
        ),
        3 => {
            let version = chrome_version(rng);
            let edge_patch = rng.gen_range(30..=120);
            let edge = format!("{}.{edge_patch}", version.rsplit_once('.').map(|(head, _)| head).unwrap_or(&version));
            format!(
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/{version} Safari/537.36 Edg/{edge}"
            )
        }
        4 => {
            let firefox = rng.gen_range(115..=133);
            let platform = *["Windows NT 10.0; Win64; x64", "X11; Linux x86_64", "Macintosh; Intel Mac OS X 10.15"]
                .choose(rng)
                .unwrap_or(&"Windows NT 10.0; Win64; x64");
            format!("Mozilla/5.0 ({platform}; rv:{firefox}.0) Gecko/20100101 Firefox/{firefox}.0")
        }
        _ => {
            let major = rng.gen_range(16..=18);
            let minor = rng.gen_range(0..=6);
            format!(
                "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/{major}.{minor} Safari/605.1.15"
            )
        }
    }
}

const ANDROID_PHONES: &[&str] = &[
    "Pixel 7",
    "Pixel 8 Pro",
    "SM-S918B",
    "SM-A546B",
    "SM-G991B",
    "M2101K6G",
    "CPH2451",
];

const ANDROID_TABLETS: &[&str] = &["SM-X706B", "SM-X810", "Lenovo TB-J716F", "Pixel Tablet"];

fn ios_version<R: Rng + ?Sized>(rng: &mut R) -> (u32, u32) {
    (rng.gen_range(16..=18), rng.gen_range(0..=6))
}

fn mobile_agent<R: Rng + ?Sized>(rng: &mut R) -> String {
    if rng.gen_bool(0.5) {
        let (major, minor) = ios_version(rng);
        format!(
            "Mozilla/5.0 (iPhone; CPU iPhone OS {major}_{minor} like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/{major}.{minor} Mobile/15E148 Safari/604.1"
        )
    } else {
        let android = rng.gen_range(12..=14);
        let model = ANDROID_PHONES.choose(rng).copied().unwrap_or("Pixel 7");
        format!(
            "Mozilla/5.0 (Linux; Android {android}; {model}) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/{} Mobile Safari/537.36",
            chrome_version(rng)
        )
    }
}

fn tablet_agent<R: Rng + ?Sized>(rng: &mut R) -> String {
    if rng.gen_bool(0.6) {
        let (major, minor) = ios_version(rng);
        format!(
            "Mozilla/5.0 (iPad; CPU OS {major}_{minor} like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/{major}.{minor} Mobile/15E148 Safari/604.1"
        )
    } else {
        let android = rng.gen_range(12..=14);
        let model = ANDROID_TABLETS.choose(rng).copied().unwrap_or("SM-X706B");
        format!(
            "Mozilla/5.0 (Linux; Android {android}; {model}) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/{} Safari/537.36",
            chrome_version(rng)
        )
    }
}
