//! 아웃바운드 push 레이트 리미터.
//!
//! push 요청은 유계 FIFO 큐에 쌓이고, 슬라이딩 윈도우(기본 1000ms)당
//! 허용 건수(기본 1건) 안에서만 전송됩니다. 드레인 틱(기본 100ms)마다
//! 만료된 타임스탬프를 정리하고 여유가 있으면 큐 앞에서 꺼내 보냅니다.
//!
//! 존재하지 않는 채널로의 push는 윈도우 슬롯을 소비하지 않고 즉시
//! 에러로 완료됩니다.

use crate::registry::ChannelRegistry;
use feed_core::{FeedError, FeedResult};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// 큐에 들어간 push 한 건.
struct QueuedPush {
    topic: String,
    event: String,
    payload: Value,
    done: oneshot::Sender<FeedResult<Value>>,
}

/// push 완료를 기다리는 수신 핸들.
#[derive(Debug)]
pub struct PushReceipt {
    rx: oneshot::Receiver<FeedResult<Value>>,
}

impl PushReceipt {
    /// 서버 응답(또는 실패)을 기다립니다.
    pub async fn ack(self) -> FeedResult<Value> {
        self.rx.await.unwrap_or(Err(FeedError::Shutdown))
    }
}

struct QueueInner {
    queue: VecDeque<QueuedPush>,
    sent_at: VecDeque<Instant>,
}

/// 유계 FIFO push 큐 + 슬라이딩 윈도우 카운터.
pub struct PushQueue {
    inner: Mutex<QueueInner>,
    capacity: usize,
    window: Duration,
    max_per_window: usize,
}

impl PushQueue {
    pub fn new(capacity: usize, window: Duration, max_per_window: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                queue: VecDeque::new(),
                sent_at: VecDeque::new(),
            }),
            capacity,
            window,
            max_per_window: max_per_window.max(1),
        }
    }

    /// push를 큐에 넣습니다. 큐가 가득 차면 즉시 `QueueFull`입니다.
    pub fn enqueue(
        &self,
        topic: impl Into<String>,
        event: impl Into<String>,
        payload: Value,
    ) -> FeedResult<PushReceipt> {
        let (done, rx) = oneshot::channel();
        let item = QueuedPush {
            topic: topic.into(),
            event: event.into(),
            payload,
            done,
        };

        let mut inner = self.inner.lock().expect("push queue lock poisoned");
        if inner.queue.len() >= self.capacity {
            warn!(capacity = self.capacity, "Push queue full, rejecting");
            return Err(FeedError::QueueFull(self.capacity));
        }
        trace!(topic = %item.topic, event = %item.event, depth = inner.queue.len(), "Push queued");
        inner.queue.push_back(item);
        Ok(PushReceipt { rx })
    }

    /// 대기 중인 push 수.
    pub fn depth(&self) -> usize {
        self.inner.lock().expect("push queue lock poisoned").queue.len()
    }

    /// 드레인 틱 한 번을 수행합니다.
    ///
    /// 윈도우 밖으로 밀려난 전송 기록을 정리한 뒤, 허용량이 남는 동안
    /// 큐 앞에서 꺼내 전송합니다. 채널이 없는 push는 허용량을 쓰지
    /// 않고 에러로 완료합니다.
    pub async fn drain_tick(&self, registry: &ChannelRegistry) {
        loop {
            // 슬롯 사용 결정과 대상 조회를 같은 락 구간에서 확정함
            let (item, target) = {
                let mut inner = self.inner.lock().expect("push queue lock poisoned");
                let now = Instant::now();
                while let Some(&front) = inner.sent_at.front() {
                    if now.duration_since(front) >= self.window {
                        inner.sent_at.pop_front();
                    } else {
                        break;
                    }
                }

                let Some(front) = inner.queue.front() else {
                    return;
                };

                match registry.get_active(&front.topic) {
                    // 채널 부재는 윈도우 슬롯 없이 처리
                    None => (inner.queue.pop_front(), None),
                    Some(entry) if inner.sent_at.len() < self.max_per_window => {
                        inner.sent_at.push_back(now);
                        (inner.queue.pop_front(), Some(entry))
                    }
                    // 윈도우 소진, 다음 틱까지 대기
                    Some(_) => return,
                }
            };

            let Some(item) = item else { return };

            match target {
                Some(entry) => {
                    debug!(topic = %item.topic, event = %item.event, "Dispatching push");
                    let result = entry.channel().push(&item.event, item.payload).await;
                    let _ = item.done.send(result);
                }
                None => {
                    let _ = item
                        .done
                        .send(Err(FeedError::ChannelNotFound(item.topic.clone())));
                }
            }
        }
    }

    /// 대기 중인 모든 push를 주어진 에러로 완료합니다 (teardown 용).
    pub fn fail_all(&self, err: FeedError) {
        let drained: Vec<QueuedPush> = {
            let mut inner = self.inner.lock().expect("push queue lock poisoned");
            inner.sent_at.clear();
            inner.queue.drain(..).collect()
        };
        if !drained.is_empty() {
            debug!(count = drained.len(), "Failing queued pushes");
        }
        for item in drained {
            let _ = item.done.send(Err(err.clone()));
        }
    }
}

/// 드레인 주기 드라이버.
pub async fn run_drain_loop(
    queue: Arc<PushQueue>,
    registry: Arc<ChannelRegistry>,
    interval: Duration,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = token.cancelled() => {
                debug!("Drain loop stopped");
                return;
            }
            _ = ticker.tick() => {
                queue.drain_tick(&registry).await;
            }
        }
    }
}
