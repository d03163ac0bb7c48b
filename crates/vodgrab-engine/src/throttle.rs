// Allowance Distributor: grants byte budget to fetchers round-robin, either at
// a fixed aggregate rate or at a rate re-derived from periodic bandwidth probes.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::config::SpeedLimitConfig;
use crate::fetcher::Allowance;
use crate::rate::TransferStats;

/// Active throttling mode as seen by operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SpeedLimit {
    None,
    /// Aggregate cap in KB/s.
    Fixed { kbps: u32 },
    /// Share of the probed bandwidth; `kbps` is the currently derived cap.
    Variable { percent: u8, kbps: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    None,
    Fixed,
    Variable,
}

#[derive(Debug)]
struct LimitState {
    mode: Mode,
    target_kbps: u32,
    percent: u8,
    /// Worker receiving the next rotation grant
    next_worker: usize,
    /// Bumped on every mode change so a stale probe result is discarded
    epoch: u64,
    measuring: bool,
    probe_immediately: bool,
}

pub struct Throttle {
    config: SpeedLimitConfig,
    allowances: Vec<Arc<Allowance>>,
    stats: Arc<TransferStats>,
    state: Mutex<LimitState>,
    rearm_probe: Notify,
}

impl Throttle {
    pub fn new(
        config: SpeedLimitConfig,
        allowances: Vec<Arc<Allowance>>,
        stats: Arc<TransferStats>,
    ) -> Self {
        let percent = config.default_percent;
        Self {
            config,
            allowances,
            stats,
            state: Mutex::new(LimitState {
                mode: Mode::None,
                target_kbps: 0,
                percent,
                next_worker: 0,
                epoch: 0,
                measuring: false,
                probe_immediately: false,
            }),
            rearm_probe: Notify::new(),
        }
    }

    fn workers(&self) -> usize {
        self.allowances.len().max(1)
    }

    pub fn speed_limit(&self) -> SpeedLimit {
        let state = self.state.lock();
        match state.mode {
            Mode::None => SpeedLimit::None,
            Mode::Fixed => SpeedLimit::Fixed {
                kbps: state.target_kbps,
            },
            Mode::Variable => SpeedLimit::Variable {
                percent: state.percent,
                kbps: state.target_kbps,
            },
        }
    }

    pub fn is_measuring(&self) -> bool {
        let state = self.state.lock();
        state.mode == Mode::Variable && state.measuring
    }

    /// Rotation tick length: one full round over all workers per second.
    pub fn rotation_period(&self) -> Duration {
        Duration::from_secs(1) / self.workers() as u32
    }

    fn set_all(&self, bytes: Option<i64>) {
        for allowance in &self.allowances {
            allowance.set(bytes);
        }
    }

    /// Seed budget handed to every worker when a limit is (re)applied.
    fn initial_share(&self, kbps: u32, divisor: i64) -> i64 {
        kbps as i64 * 1024 / self.workers() as i64 / divisor
    }

    fn reset_state(&self, state: &mut LimitState, mode: Mode) {
        if state.measuring {
            self.stats.finish_probe();
        }
        state.mode = mode;
        state.measuring = false;
        state.next_worker = 0;
        state.epoch += 1;
    }

    pub fn enable_fixed(&self, kbps: u32) {
        let kbps = kbps.max(1);
        let mut state = self.state.lock();
        self.reset_state(&mut state, Mode::Fixed);
        state.target_kbps = kbps;
        self.set_all(Some(self.initial_share(kbps, 8)));
        info!(kbps, "Fixed speed limit enabled");
    }

    pub fn enable_variable(&self, percent: u8) {
        let percent = percent.clamp(self.config.min_percent, self.config.max_percent);
        let (current_kbps, _) = self.stats.speeds();
        let kbps = (current_kbps * percent as f64 / 100.0) as u32;

        let mut state = self.state.lock();
        self.reset_state(&mut state, Mode::Variable);
        state.percent = percent;
        state.target_kbps = kbps;
        // Nothing measured yet: probe right away instead of stalling until
        // the first regular probe.
        state.probe_immediately = kbps == 0;
        self.set_all(Some(self.initial_share(kbps, 8)));
        drop(state);

        self.rearm_probe.notify_one();
        info!(percent, kbps, "Variable speed limit enabled");
    }

    pub fn disable(&self) {
        let mut state = self.state.lock();
        self.reset_state(&mut state, Mode::None);
        state.target_kbps = 0;
        self.set_all(None);
        info!("Speed limit disabled");
    }

    pub fn increase(&self) -> SpeedLimit {
        let mut state = self.state.lock();
        let mode = state.mode;
        match mode {
            Mode::Fixed => {
                let raised = (state.target_kbps as f64 * self.config.kbps_step_factor) as u32;
                if raised > self.config.max_kbps {
                    drop(state);
                    debug!("Fixed limit raised past maximum, lifting it");
                    self.disable();
                    return SpeedLimit::None;
                }
                state.target_kbps = raised;
            }
            Mode::Variable => {
                state.percent = state
                    .percent
                    .saturating_add(self.config.percent_step)
                    .min(self.config.max_percent);
            }
            Mode::None => {}
        }
        drop(state);
        self.speed_limit()
    }

    pub fn decrease(&self) -> SpeedLimit {
        let mut state = self.state.lock();
        let mode = state.mode;
        match mode {
            Mode::Fixed => {
                let lowered = (state.target_kbps as f64 / self.config.kbps_step_factor) as u32;
                state.target_kbps = lowered.max(self.config.min_kbps);
            }
            Mode::Variable => {
                state.percent = state
                    .percent
                    .saturating_sub(self.config.percent_step)
                    .max(self.config.min_percent);
            }
            Mode::None => {}
        }
        drop(state);
        self.speed_limit()
    }

    /// Grants the next worker in the rotation its per-tick share. Returns the
    /// worker and the granted bytes, or `None` while unthrottled or probing.
    pub fn rotate(&self) -> Option<(usize, i64)> {
        let mut state = self.state.lock();
        if state.mode == Mode::None || state.measuring {
            return None;
        }

        let workers = self.workers();
        let worker = state.next_worker % workers;
        state.next_worker = (worker + 1) % workers;

        let mut share = state.target_kbps as f64 * 1024.0 / workers as f64;
        if state.mode == Mode::Variable {
            // leave headroom for the unthrottled probe windows
            share *= 1.0
                - self.config.probe_window.as_secs_f64()
                    / self.config.probe_interval.as_secs_f64()
                    / 2.0;
        }
        let bytes = share as i64;
        self.allowances[worker].grant(bytes);
        trace!(worker, bytes, "Granted allowance");
        Some((worker, bytes))
    }

    /// Lifts all limits and starts counting bytes. Returns the epoch the
    /// measurement belongs to, `None` outside variable mode.
    fn begin_probe(&self) -> Option<u64> {
        let mut state = self.state.lock();
        if state.mode != Mode::Variable {
            return None;
        }
        state.measuring = true;
        state.probe_immediately = false;
        self.stats.begin_probe();
        self.set_all(None);
        debug!("Bandwidth probe started");
        Some(state.epoch)
    }

    /// Applies a finished probe. Results from an older epoch are dropped.
    fn complete_probe(&self, epoch: u64, bytes: u64) -> Option<u32> {
        let mut state = self.state.lock();
        if state.epoch != epoch || state.mode != Mode::Variable {
            return None;
        }
        state.measuring = false;

        let window = self.config.probe_window.as_secs_f64().max(f64::EPSILON);
        let bytes_per_second = bytes as f64 / window;
        let factor = self
            .config
            .correction
            .factor(self.workers(), self.stats.average_chunk_size());
        let kbps = (bytes_per_second / 1024.0 * (state.percent as f64 / 100.0) / factor) as u32;
        let kbps = kbps.max(self.config.min_kbps);

        state.target_kbps = kbps;
        state.next_worker = 0;
        self.set_all(Some(self.initial_share(kbps, 16)));
        info!(
            measured_kbps = (bytes_per_second / 1024.0) as u64,
            correction = factor,
            kbps,
            percent = state.percent,
            "Bandwidth probe finished, variable limit updated"
        );
        Some(kbps)
    }

    /// Round-robin grant loop. Idle while no limit is active.
    pub async fn run_rotation(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.rotation_period());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.rotate();
                }
            }
        }
    }

    /// Periodic bandwidth probe loop for variable mode. Enabling variable mode
    /// restarts the countdown.
    pub async fn run_probe(self: Arc<Self>, shutdown: CancellationToken) {
        loop {
            let delay = if self.state.lock().probe_immediately {
                Duration::ZERO
            } else {
                self.config.probe_interval
            };

            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = self.rearm_probe.notified() => continue,
                _ = tokio::time::sleep(delay) => {}
            }

            let Some(epoch) = self.begin_probe() else {
                continue;
            };

            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(self.config.probe_window) => {}
            }

            let bytes = self.stats.finish_probe();
            self.complete_probe(epoch, bytes);
        }
    }
}
