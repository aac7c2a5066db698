//! 연결 상태 모니터.
//!
//! 연결 상태는 `watch` 채널로 배포되어 여러 관찰자가 현재 값과
//! 이후 전이를 함께 볼 수 있습니다. 트랜스포트 이벤트 스트림을
//! 구독하는 리스너 태스크가 상태를 갱신합니다.

use crate::transport::TransportEvent;
use feed_core::ConnectionState;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 연결 상태의 단일 진실 공급원.
pub struct ConnectionMonitor {
    tx: watch::Sender<ConnectionState>,
}

impl ConnectionMonitor {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(ConnectionState::Disconnected);
        Self { tx }
    }

    /// 현재 연결 상태.
    pub fn state(&self) -> ConnectionState {
        *self.tx.borrow()
    }

    /// 상태 변화를 관찰할 수신기를 반환합니다.
    pub fn watch(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }

    /// 상태를 전이합니다. 같은 값으로의 전이는 알림을 내지 않습니다.
    pub fn set(&self, state: ConnectionState) {
        self.tx.send_if_modified(|current| {
            if *current != state {
                info!(from = %current, to = %state, "Connection state changed");
                *current = state;
                true
            } else {
                false
            }
        });
    }
}

impl Default for ConnectionMonitor {
    fn default() -> Self {
        Self::new()
    }
}

/// 트랜스포트 이벤트를 연결 상태로 반영하는 리스너를 시작합니다.
pub fn spawn_listener(
    monitor: Arc<ConnectionMonitor>,
    mut events: broadcast::Receiver<TransportEvent>,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("Connection listener stopped");
                    return;
                }
                event = events.recv() => match event {
                    Ok(TransportEvent::Opened) => monitor.set(ConnectionState::Connected),
                    Ok(TransportEvent::Closed) => monitor.set(ConnectionState::Disconnected),
                    Ok(TransportEvent::Error(reason)) => {
                        warn!(%reason, "Transport error");
                        monitor.set(ConnectionState::Error);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        // 이벤트 유실 시 마지막으로 본 상태를 유지하고 계속 수신
                        warn!(skipped, "Transport event stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("Transport event stream closed");
                        monitor.set(ConnectionState::Disconnected);
                        return;
                    }
                },
            }
        }
    })
}
