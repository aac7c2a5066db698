//! 토픽 join 재시도 상태 머신.
//!
//! # 상태 전이
//!
//! ```text
//! Idle ──> Joining ──[ack]──────────> Joined (종결)
//!             │
//!             ├──[거부/타임아웃, 시도 남음]──> Retrying ──[백오프 경과]──> Joining
//!             │
//!             └──[거부/타임아웃, 시도 소진]──> Failed (종결)
//! ```
//!
//! 토픽 하나의 join 시도는 항상 이전 시도의 완료에서 출발하므로
//! 같은 토픽에 두 개의 `Joining`이 동시에 진행되지 않습니다.
//! 구독 해제는 어느 상태에서든 백오프 타이머를 취소하고 즉시
//! 상태 머신을 종료시킵니다.

use crate::registry::{ChannelEntry, ChannelRegistry};
use crate::transport::JoinParams;
use feed_core::{FeedConfig, FeedError, JoinState};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// n번째 시도 실패 후의 백오프 지연을 계산합니다.
///
/// `min(base · 2^n, cap)` — 기본값으로 n ∈ {1, 2, 3}에서
/// 2000ms, 4000ms, 5000ms가 됩니다.
pub fn backoff_delay(attempt: u32, base_ms: u64, cap_ms: u64) -> Duration {
    let shift = attempt.min(16);
    let delay = base_ms.saturating_mul(1u64 << shift);
    Duration::from_millis(delay.min(cap_ms))
}

/// 토픽의 join 상태 머신 태스크를 시작합니다.
///
/// join 관련 핸들러가 하나도 없으면 재시도 없이 단일 시도만
/// 수행합니다 (best-effort 멤버십).
pub fn spawn_join(
    entry: Arc<ChannelEntry>,
    registry: Arc<ChannelRegistry>,
    params: JoinParams,
    config: FeedConfig,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(run_join(entry, registry, params, config, token))
}

async fn run_join(
    entry: Arc<ChannelEntry>,
    registry: Arc<ChannelRegistry>,
    params: JoinParams,
    config: FeedConfig,
    token: CancellationToken,
) {
    let max_attempts = if entry.handlers().wants_join_result() {
        config.join_max_attempts.max(1)
    } else {
        1
    };
    let timeout = config.join_timeout();
    let channel = entry.channel();

    let mut attempt: u32 = 1;
    loop {
        entry.set_join_state(JoinState::Joining);
        debug!(topic = %entry.topic(), attempt, "Joining channel");

        let outcome = tokio::select! {
            _ = token.cancelled() => {
                debug!(topic = %entry.topic(), "Join cancelled");
                return;
            }
            res = tokio::time::timeout(timeout, channel.join(&params, timeout)) => {
                match res {
                    Ok(joined) => joined,
                    Err(_) => Err(FeedError::JoinTimeout(config.join_timeout_ms)),
                }
            }
        };

        match outcome {
            Ok(snapshot) => {
                entry.set_join_state(JoinState::Joined);
                info!(
                    topic = %entry.topic(),
                    attempt,
                    stocks = snapshot.stocks.len(),
                    "Channel joined"
                );
                if let Some(on_join) = &entry.handlers().on_join {
                    on_join(snapshot);
                }
                return;
            }
            Err(err) if attempt < max_attempts => {
                let delay = backoff_delay(attempt, config.backoff_base_ms, config.backoff_cap_ms);
                warn!(
                    topic = %entry.topic(),
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Join failed, retrying"
                );
                entry.set_join_state(JoinState::Retrying);

                tokio::select! {
                    _ = token.cancelled() => {
                        debug!(topic = %entry.topic(), "Join retry cancelled");
                        return;
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
                attempt += 1;
            }
            Err(err) => {
                // 시도 소진: 엔트리를 비활성으로 내리고 채널을 떠나
                // 다음 구독이 새 채널로 처음부터 시작하게 함
                entry.set_join_state(JoinState::Failed);
                entry.deactivate();
                registry.publish_topics();
                channel.leave().await;
                warn!(
                    topic = %entry.topic(),
                    attempts = attempt,
                    error = %err,
                    "Join retries exhausted"
                );
                if let Some(on_join_error) = &entry.handlers().on_join_error {
                    on_join_error(err);
                }
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::HandlerSet;
    use crate::simulated::SimulatedChannel;
    use feed_core::StockSnapshot;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn test_config() -> FeedConfig {
        FeedConfig::default()
    }

    fn entry_with(
        registry: &ChannelRegistry,
        channel: Arc<SimulatedChannel>,
        handlers: HandlerSet,
    ) -> Arc<ChannelEntry> {
        let entry = Arc::new(ChannelEntry::new(channel.topic_name(), channel, handlers));
        registry.try_insert(Arc::clone(&entry)).unwrap()
    }

    #[test]
    fn test_backoff_delay_formula() {
        // min(1000 · 2^n, 5000), n ∈ {1, 2, 3}
        assert_eq!(backoff_delay(1, 1000, 5000), Duration::from_millis(2000));
        assert_eq!(backoff_delay(2, 1000, 5000), Duration::from_millis(4000));
        assert_eq!(backoff_delay(3, 1000, 5000), Duration::from_millis(5000));
        // 상한 적용
        assert_eq!(backoff_delay(10, 1000, 5000), Duration::from_millis(5000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_success_invokes_on_join() {
        let channel = Arc::new(SimulatedChannel::new("stock:AAPL"));
        channel.script_join(Ok(StockSnapshot::default()));

        let joins = Arc::new(AtomicU32::new(0));
        let joins_seen = Arc::clone(&joins);
        let handlers = HandlerSet::new().on_join(move |_| {
            joins_seen.fetch_add(1, Ordering::SeqCst);
        });

        let registry = Arc::new(ChannelRegistry::new());
        let entry = entry_with(&registry, Arc::clone(&channel), handlers);
        let params = JoinParams {
            user_id: "user-1".to_string(),
        };

        spawn_join(
            Arc::clone(&entry),
            registry,
            params,
            test_config(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(entry.join_state(), JoinState::Joined);
        assert_eq!(joins.load(Ordering::SeqCst), 1);
        assert_eq!(channel.join_count(), 1);
        assert!(entry.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_retries_then_succeeds() {
        let channel = Arc::new(SimulatedChannel::new("stock:AAPL"));
        channel.script_join(Err(FeedError::JoinRejected("busy".to_string())));
        channel.script_join(Err(FeedError::JoinRejected("busy".to_string())));
        channel.script_join(Ok(StockSnapshot::default()));

        let registry = Arc::new(ChannelRegistry::new());
        let handlers = HandlerSet::new().on_join(|_| {});
        let entry = entry_with(&registry, Arc::clone(&channel), handlers);
        let params = JoinParams {
            user_id: "user-1".to_string(),
        };

        spawn_join(
            Arc::clone(&entry),
            registry,
            params,
            test_config(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        // 3번째 시도에서 성공
        assert_eq!(channel.join_count(), 3);
        assert_eq!(entry.join_state(), JoinState::Joined);
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_exhaustion_deactivates_entry() {
        let channel = Arc::new(SimulatedChannel::new("stock:AAPL"));
        for _ in 0..3 {
            channel.script_join(Err(FeedError::JoinTimeout(10_000)));
        }

        let errors = Arc::new(AtomicU32::new(0));
        let errors_seen = Arc::clone(&errors);
        let handlers = HandlerSet::new()
            .on_join(|_| {})
            .on_join_error(move |_| {
                errors_seen.fetch_add(1, Ordering::SeqCst);
            });

        let registry = Arc::new(ChannelRegistry::new());
        let entry = entry_with(&registry, Arc::clone(&channel), handlers);
        let watcher = registry.watch_topics();
        assert!(watcher.borrow().contains("stock:AAPL"));

        let params = JoinParams {
            user_id: "user-1".to_string(),
        };

        spawn_join(
            Arc::clone(&entry),
            Arc::clone(&registry),
            params,
            test_config(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        // 최대 3번 시도, on_join_error는 정확히 한 번
        assert_eq!(channel.join_count(), 3);
        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert_eq!(entry.join_state(), JoinState::Failed);
        assert!(!entry.is_active());
        assert!(channel.has_left());

        // 소진된 토픽은 관찰 중인 활성 집합에서도 빠져야 함
        assert!(!watcher.borrow().contains("stock:AAPL"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_best_effort_join_single_attempt() {
        let channel = Arc::new(SimulatedChannel::new("stock:AAPL"));
        channel.script_join(Err(FeedError::JoinRejected("busy".to_string())));

        // join 핸들러 없음 → 단일 시도, 재시도 없음
        let registry = Arc::new(ChannelRegistry::new());
        let entry = entry_with(&registry, Arc::clone(&channel), HandlerSet::new());
        let params = JoinParams {
            user_id: "user-1".to_string(),
        };

        spawn_join(
            Arc::clone(&entry),
            registry,
            params,
            test_config(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(channel.join_count(), 1);
        assert_eq!(entry.join_state(), JoinState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_stops_retry() {
        let channel = Arc::new(SimulatedChannel::new("stock:AAPL"));
        for _ in 0..3 {
            channel.script_join(Err(FeedError::JoinRejected("busy".to_string())));
        }

        let registry = Arc::new(ChannelRegistry::new());
        let handlers = HandlerSet::new().on_join(|_| {});
        let entry = entry_with(&registry, Arc::clone(&channel), handlers);
        let params = JoinParams {
            user_id: "user-1".to_string(),
        };

        let token = CancellationToken::new();
        let handle = spawn_join(
            Arc::clone(&entry),
            registry,
            params,
            test_config(),
            token.clone(),
        );

        // 첫 실패 후 백오프 진입까지 진행
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(entry.join_state(), JoinState::Retrying);

        token.cancel();
        handle.await.unwrap();

        // 취소 후 추가 시도 없음
        assert_eq!(channel.join_count(), 1);
    }
}
