//! 설정 관리.
//!
//! 이 모듈은 피드 클라이언트의 타이밍/한도 설정을 정의하고 관리합니다.
//! 모든 주기 값은 밀리초 단위입니다.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// 피드 클라이언트 설정.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FeedConfig {
    /// 코얼레싱 버퍼 flush 주기 (밀리초)
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    /// 전송 큐 drain 주기 (밀리초)
    #[serde(default = "default_drain_interval_ms")]
    pub drain_interval_ms: u64,
    /// 요청 한도 추적 윈도우 (밀리초)
    #[serde(default = "default_rate_window_ms")]
    pub rate_window_ms: u64,
    /// 윈도우당 최대 요청 수
    #[serde(default = "default_max_requests_per_window")]
    pub max_requests_per_window: usize,
    /// 채널 join 타임아웃 (밀리초)
    #[serde(default = "default_join_timeout_ms")]
    pub join_timeout_ms: u64,
    /// 토픽당 최대 join 시도 횟수
    #[serde(default = "default_join_max_attempts")]
    pub join_max_attempts: u32,
    /// join 재시도 백오프 기준 지연 (밀리초)
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// join 재시도 백오프 상한 (밀리초)
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,
    /// 전송 큐 용량
    #[serde(default = "default_push_queue_capacity")]
    pub push_queue_capacity: usize,
}

fn default_flush_interval_ms() -> u64 {
    30
}
fn default_drain_interval_ms() -> u64 {
    100
}
fn default_rate_window_ms() -> u64 {
    1000
}
fn default_max_requests_per_window() -> usize {
    1
}
fn default_join_timeout_ms() -> u64 {
    10_000
}
fn default_join_max_attempts() -> u32 {
    3
}
fn default_backoff_base_ms() -> u64 {
    1000
}
fn default_backoff_cap_ms() -> u64 {
    5000
}
fn default_push_queue_capacity() -> usize {
    256
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: default_flush_interval_ms(),
            drain_interval_ms: default_drain_interval_ms(),
            rate_window_ms: default_rate_window_ms(),
            max_requests_per_window: default_max_requests_per_window(),
            join_timeout_ms: default_join_timeout_ms(),
            join_max_attempts: default_join_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            push_queue_capacity: default_push_queue_capacity(),
        }
    }
}

impl FeedConfig {
    /// 파일과 환경 변수에서 설정을 로드합니다.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder()
            // 파일에서 로드
            .add_source(config::File::from(path.as_ref()).required(false))
            // 환경 변수로 오버라이드 (예: FEED__FLUSH_INTERVAL_MS=50)
            .add_source(
                config::Environment::with_prefix("FEED")
                    .separator("__")
                    .try_parsing(true),
            );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// 기본 경로에서 설정을 로드합니다.
    pub fn load_default() -> Result<Self, config::ConfigError> {
        Self::load("config/feed.toml")
    }

    /// flush 주기를 Duration으로 반환.
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    /// drain 주기를 Duration으로 반환.
    pub fn drain_interval(&self) -> Duration {
        Duration::from_millis(self.drain_interval_ms)
    }

    /// 추적 윈도우를 Duration으로 반환.
    pub fn rate_window(&self) -> Duration {
        Duration::from_millis(self.rate_window_ms)
    }

    /// join 타임아웃을 Duration으로 반환.
    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_periods() {
        let config = FeedConfig::default();

        assert_eq!(config.flush_interval_ms, 30);
        assert_eq!(config.drain_interval_ms, 100);
        assert_eq!(config.rate_window_ms, 1000);
        assert_eq!(config.max_requests_per_window, 1);
        assert_eq!(config.join_timeout_ms, 10_000);
        assert_eq!(config.join_max_attempts, 3);
        assert_eq!(config.backoff_base_ms, 1000);
        assert_eq!(config.backoff_cap_ms, 5000);
        assert_eq!(config.push_queue_capacity, 256);
    }

    #[test]
    fn test_duration_helpers() {
        let config = FeedConfig::default();

        assert_eq!(config.flush_interval(), Duration::from_millis(30));
        assert_eq!(config.drain_interval(), Duration::from_millis(100));
        assert_eq!(config.rate_window(), Duration::from_secs(1));
        assert_eq!(config.join_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let parsed: FeedConfig = toml::from_str("flush_interval_ms = 50").unwrap();

        assert_eq!(parsed.flush_interval_ms, 50);
        assert_eq!(parsed.drain_interval_ms, 100);
        assert_eq!(parsed.join_max_attempts, 3);
    }
}
