use std::sync::OnceLock;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue};
use tracing::debug;

use crate::error::DownloadError;

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/142.0.0.0 Safari/537.36";

/// Worker pool size used when the caller does not pick one.
pub const DEFAULT_THREAD_COUNT: usize = 6;

/// HTTP client options shared by every fetcher.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub user_agent: String,

    /// Time to establish the initial connection
    pub connect_timeout: Duration,

    /// Maximum time between two received body chunks
    pub read_timeout: Duration,

    /// Custom HTTP headers for requests
    pub headers: HeaderMap,

    pub pool_max_idle_per_host: usize,

    pub pool_idle_timeout: Duration,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            connect_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(30),
            headers: HttpConfig::get_default_headers(),
            // one idle connection per worker is plenty, the pool just needs headroom
            pool_max_idle_per_host: 10,
            pool_idle_timeout: Duration::from_secs(30),
        }
    }
}

impl HttpConfig {
    pub fn get_default_headers() -> HeaderMap {
        let mut default_headers = HeaderMap::new();

        default_headers.insert(
            reqwest::header::CONNECTION,
            HeaderValue::from_static("keep-alive"),
        );

        default_headers.insert(reqwest::header::ACCEPT, HeaderValue::from_static("*/*"));

        default_headers
    }

    pub fn build_client(&self) -> Result<reqwest::Client, DownloadError> {
        install_rustls_provider();
        reqwest::Client::builder()
            .user_agent(self.user_agent.clone())
            .default_headers(self.headers.clone())
            .connect_timeout(self.connect_timeout)
            .read_timeout(self.read_timeout)
            .pool_max_idle_per_host(self.pool_max_idle_per_host)
            .pool_idle_timeout(self.pool_idle_timeout)
            .build()
            .map_err(DownloadError::from)
    }
}

/// The TLS backend is built without a default crypto provider.
pub fn install_rustls_provider() {
    static PROVIDER_INSTALLED: OnceLock<()> = OnceLock::new();
    PROVIDER_INSTALLED.get_or_init(|| {
        if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
            debug!(existing_provider = ?e, "rustls CryptoProvider already installed");
        }
    });
}

/// Per-fetcher streaming options.
#[derive(Debug, Clone)]
pub struct FetcherConfig {
    /// Upper bound for a single gated read
    pub read_buffer_size: usize,
    /// Ceiling for allowance a fetcher may save up while idle
    pub max_saved_allowance: i64,
    /// Re-check interval while blocked on pause or allowance. Grants and
    /// resumes wake the fetcher immediately, this only bounds missed wakeups.
    pub gate_poll_interval: Duration,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: 64 * 1024,
            max_saved_allowance: 16 * 1024 * 1024,
            gate_poll_interval: Duration::from_millis(100),
        }
    }
}

/// Retry behavior for a single chunk. Retries use a fixed delay.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the initial attempt
    pub max_retries: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            delay: Duration::from_secs(5),
        }
    }
}

/// Graduated sleeps for fetchers that completed a chunk ahead of the write
/// cursor. Each step is `(factor, sleep)` where factor is
/// `buffered chunks / pool size`; the first step whose factor is reached wins.
#[derive(Debug, Clone)]
pub struct BackpressureLadder {
    steps: Vec<(f64, Duration)>,
}

impl BackpressureLadder {
    pub fn new(mut steps: Vec<(f64, Duration)>) -> Self {
        steps.sort_by(|a, b| b.0.total_cmp(&a.0));
        Self { steps }
    }

    /// No throttling at all.
    pub fn disabled() -> Self {
        Self { steps: Vec::new() }
    }

    pub fn delay_for(&self, buffered: usize, pool_size: usize) -> Option<Duration> {
        let factor = buffered as f64 / pool_size.max(1) as f64;
        self.steps
            .iter()
            .find(|(threshold, _)| factor >= *threshold)
            .map(|(_, delay)| *delay)
    }
}

impl Default for BackpressureLadder {
    fn default() -> Self {
        Self::new(vec![
            (6.0, Duration::from_secs(60)),
            (4.0, Duration::from_secs(30)),
            (3.0, Duration::from_secs(15)),
            (2.0, Duration::from_secs(5)),
        ])
    }
}

#[derive(Debug, Clone)]
pub struct ProgressConfig {
    pub interval: Duration,
    /// Trailing window for the reported download/write speeds
    pub averaging_window: Duration,
    /// Suggested bound for a subscriber's snapshot channel
    pub channel_capacity: usize,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(333),
            averaging_window: Duration::from_secs(20),
            channel_capacity: 16,
        }
    }
}

/// Empirical correction applied to a bandwidth probe measurement.
///
/// More parallel connections report bytes that were requested before the
/// probe window opened, and small segments skew the short window further.
/// The constants are tuned values, not derived ones.
#[derive(Debug, Clone)]
pub struct ProbeCorrection {
    pub base: f64,
    pub per_worker: f64,
    pub growth: f64,
    pub chunk_floor: f64,
    pub chunk_cap_mib: f64,
    pub chunk_slope: f64,
}

impl Default for ProbeCorrection {
    fn default() -> Self {
        Self {
            base: 1.06,
            per_worker: 0.021,
            growth: 1.021,
            chunk_floor: 0.5,
            chunk_cap_mib: 5.3,
            chunk_slope: 0.0943,
        }
    }
}

impl ProbeCorrection {
    /// Divisor applied to the probed bytes/sec. Never below 1.0.
    pub fn factor(&self, workers: usize, average_chunk_bytes: f64) -> f64 {
        let chunk_mib = average_chunk_bytes / 1024.0 / 1024.0;
        let chunk_factor =
            (self.chunk_floor + chunk_mib.min(self.chunk_cap_mib) * self.chunk_slope).min(1.0);
        let workers = workers as f64;
        ((self.base + self.per_worker * workers) * self.growth.powf(workers) * chunk_factor)
            .max(1.0)
    }
}

/// Bounds and defaults for the two throttling modes. All rates in KB/s
/// (1024 bytes per second).
#[derive(Debug, Clone)]
pub struct SpeedLimitConfig {
    pub default_kbps: u32,
    pub min_kbps: u32,
    pub max_kbps: u32,
    pub kbps_step_factor: f64,
    pub default_percent: u8,
    pub min_percent: u8,
    pub max_percent: u8,
    pub percent_step: u8,
    pub probe_interval: Duration,
    pub probe_window: Duration,
    /// Recent chunk sizes kept for the probe correction
    pub chunk_size_samples: usize,
    pub correction: ProbeCorrection,
}

impl Default for SpeedLimitConfig {
    fn default() -> Self {
        Self {
            default_kbps: 10 * 1024,
            min_kbps: 512,
            max_kbps: 60 * 1024,
            kbps_step_factor: 1.12,
            default_percent: 50,
            min_percent: 20,
            max_percent: 75,
            percent_step: 5,
            probe_interval: Duration::from_secs(30),
            probe_window: Duration::from_secs(1),
            chunk_size_samples: 50,
            correction: ProbeCorrection::default(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub http: HttpConfig,
    pub fetcher: FetcherConfig,
    pub retry: RetryPolicy,
    pub backpressure: BackpressureLadder,
    pub progress: ProgressConfig,
    pub speed_limit: SpeedLimitConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ladder_picks_highest_reached_step() {
        let ladder = BackpressureLadder::default();
        assert_eq!(ladder.delay_for(5, 6), None);
        assert_eq!(ladder.delay_for(12, 6), Some(Duration::from_secs(5)));
        assert_eq!(ladder.delay_for(18, 6), Some(Duration::from_secs(15)));
        assert_eq!(ladder.delay_for(24, 6), Some(Duration::from_secs(30)));
        assert_eq!(ladder.delay_for(100, 6), Some(Duration::from_secs(60)));
    }

    #[test]
    fn ladder_order_does_not_matter() {
        let ladder = BackpressureLadder::new(vec![
            (2.0, Duration::from_millis(10)),
            (4.0, Duration::from_millis(40)),
        ]);
        assert_eq!(ladder.delay_for(9, 2), Some(Duration::from_millis(40)));
        assert!(BackpressureLadder::disabled().delay_for(1000, 1).is_none());
    }

    #[test]
    fn correction_grows_with_workers() {
        let correction = ProbeCorrection::default();
        let big_chunks = 8.0 * 1024.0 * 1024.0;
        let few = correction.factor(2, big_chunks);
        let many = correction.factor(20, big_chunks);
        assert!(many > few);
        assert!(few >= 1.0);
    }

    #[test]
    fn correction_is_weaker_for_small_chunks() {
        let correction = ProbeCorrection::default();
        let small = correction.factor(16, 256.0 * 1024.0);
        let large = correction.factor(16, 6.0 * 1024.0 * 1024.0);
        assert!(small < large);
        // 6 workers, 2 MiB chunks: (1.06 + 0.126) * 1.021^6 * (0.5 + 2 * 0.0943)
        let expected = (1.06 + 0.021 * 6.0) * 1.021f64.powf(6.0) * (0.5 + 2.0 * 0.0943);
        let got = correction.factor(6, 2.0 * 1024.0 * 1024.0);
        assert!((got - expected.max(1.0)).abs() < 1e-9);
    }
}
