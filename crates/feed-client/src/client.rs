//! 피드 클라이언트 본체.
//!
//! 연결 수명주기, 토픽 구독, push 전송을 하나의 컨텍스트 객체로
//! 묶습니다. 연결은 첫 구독 또는 push 시점에 lazy하게 수립되며,
//! 동시 호출이 겹쳐도 `open`은 한 번만 수행됩니다.

use crate::coalesce::{run_flush_loop, UpdateCoalescer};
use crate::connection::{spawn_listener, ConnectionMonitor};
use crate::credentials::CredentialStore;
use crate::join::spawn_join;
use crate::rate_limit::{run_drain_loop, PushQueue, PushReceipt};
use crate::registry::{ChannelEntry, ChannelRegistry, HandlerSet};
use crate::transport::{ChannelEvent, Identity, JoinParams, Transport};
use feed_core::{ConnectionState, FeedConfig, FeedError, FeedResult, Quote};
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 수립된 세션 하나의 상태.
struct Session {
    identity: Identity,
    /// 세션 소속 태스크(리스너, 플러시, 드레인, join, 펌프) 전체의 루트 토큰
    token: CancellationToken,
}

/// 피드 클라이언트.
///
/// `Arc`로 감싸 공유하며, 모든 메서드는 `&self`로 호출됩니다.
pub struct FeedClient {
    transport: Arc<dyn Transport>,
    credentials: Arc<dyn CredentialStore>,
    config: FeedConfig,
    monitor: Arc<ConnectionMonitor>,
    registry: Arc<ChannelRegistry>,
    coalescer: Arc<UpdateCoalescer>,
    push_queue: Arc<PushQueue>,
    session: Mutex<Option<Session>>,
}

impl FeedClient {
    pub fn new(
        transport: Arc<dyn Transport>,
        credentials: Arc<dyn CredentialStore>,
        config: FeedConfig,
    ) -> Self {
        let push_queue = Arc::new(PushQueue::new(
            config.push_queue_capacity,
            config.rate_window(),
            config.max_requests_per_window,
        ));
        Self {
            transport,
            credentials,
            config,
            monitor: Arc::new(ConnectionMonitor::new()),
            registry: Arc::new(ChannelRegistry::new()),
            coalescer: Arc::new(UpdateCoalescer::new()),
            push_queue,
            session: Mutex::new(None),
        }
    }

    /// 현재 연결 상태.
    pub fn state(&self) -> ConnectionState {
        self.monitor.state()
    }

    /// 연결 상태 변화를 관찰할 수신기.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.monitor.watch()
    }

    /// 활성 토픽 집합의 watch 스트림.
    pub fn watch_topics(&self) -> watch::Receiver<BTreeSet<String>> {
        self.registry.watch_topics()
    }

    /// 토픽의 활성 채널 엔트리를 조회합니다. 없으면 `None`입니다.
    pub fn channel_for(&self, topic: &str) -> Option<Arc<ChannelEntry>> {
        self.registry.get_active(topic)
    }

    /// 캐시된 최신 시세.
    pub fn quote(&self, symbol: &str) -> Option<Quote> {
        self.coalescer.quote(symbol)
    }

    /// 캐시된 전체 시세.
    pub fn quotes(&self) -> Vec<Quote> {
        self.coalescer.quotes()
    }

    /// 연결이 수립되어 있음을 보장합니다.
    ///
    /// 자격 증명이 없으면 연결 시도 없이 `MissingCredential`입니다.
    /// 세션 뮤텍스가 전 구간을 감싸므로 동시 호출이 겹쳐도 `open`은
    /// 한 번만 수행됩니다.
    async fn ensure_connected(&self) -> FeedResult<Identity> {
        let mut session = self.session.lock().await;
        if let Some(existing) = session.as_ref() {
            return Ok(existing.identity.clone());
        }

        let identity = self
            .credentials
            .identity()
            .ok_or(FeedError::MissingCredential)?;

        self.monitor.set(ConnectionState::Connecting);
        info!(user_id = %identity.user_id, "Opening feed connection");

        if let Err(err) = self.transport.open(&identity).await {
            warn!(error = %err, "Feed connection failed");
            self.monitor.set(ConnectionState::Error);
            return Err(err);
        }
        self.monitor.set(ConnectionState::Connected);

        let token = CancellationToken::new();
        spawn_listener(
            Arc::clone(&self.monitor),
            self.transport.events(),
            token.child_token(),
        );
        tokio::spawn(run_flush_loop(
            Arc::clone(&self.coalescer),
            Arc::clone(&self.registry),
            self.config.flush_interval(),
            token.child_token(),
        ));
        tokio::spawn(run_drain_loop(
            Arc::clone(&self.push_queue),
            Arc::clone(&self.registry),
            self.config.drain_interval(),
            token.child_token(),
        ));

        *session = Some(Session {
            identity: identity.clone(),
            token,
        });
        Ok(identity)
    }

    /// 토픽을 구독합니다.
    ///
    /// 이미 활성 구독이 있으면 새 채널을 만들지 않고 기존 구독
    /// 핸들을 반환합니다 (핸들러는 최초 구독자의 것이 유지됩니다).
    pub async fn subscribe(&self, topic: &str, handlers: HandlerSet) -> FeedResult<Subscription> {
        let identity = self.ensure_connected().await?;

        if let Some(existing) = self.registry.get_active(topic) {
            debug!(topic, "Subscription already active");
            return Ok(Subscription {
                entry: existing,
                registry: Arc::clone(&self.registry),
            });
        }

        let channel = self.transport.channel(topic).await?;
        let entry = Arc::new(ChannelEntry::new(topic, channel, handlers));

        // 동시 구독 경합은 레지스트리가 중재함
        let entry = match self.registry.try_insert(Arc::clone(&entry)) {
            Ok(inserted) => inserted,
            Err(existing) => {
                // 트랜스포트가 토픽당 핸들을 공유할 수 있으므로, 승자와
                // 같은 핸들이면 leave로 산 채널을 닫지 않음
                let lost = entry.channel();
                if !Arc::ptr_eq(&lost, &existing.channel()) {
                    lost.leave().await;
                }
                return Ok(Subscription {
                    entry: existing,
                    registry: Arc::clone(&self.registry),
                });
            }
        };

        let entry_token = {
            let session = self.session.lock().await;
            match session.as_ref() {
                Some(s) => s.token.child_token(),
                None => return Err(FeedError::NotConnected(topic.to_string())),
            }
        };
        entry.set_cancel_token(entry_token.clone());

        self.spawn_inbound_pump(&entry, entry_token.clone());
        spawn_join(
            Arc::clone(&entry),
            Arc::clone(&self.registry),
            JoinParams::from(&identity),
            self.config.clone(),
            entry_token,
        );

        Ok(Subscription {
            entry,
            registry: Arc::clone(&self.registry),
        })
    }

    /// 채널 인바운드 이벤트를 병합 버퍼로 퍼올리는 태스크를 시작합니다.
    fn spawn_inbound_pump(&self, entry: &Arc<ChannelEntry>, token: CancellationToken) {
        let coalescer = Arc::clone(&self.coalescer);
        let registry = Arc::clone(&self.registry);
        let topic = entry.topic().to_string();
        let mut updates = entry.channel().updates();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    event = updates.recv() => match event {
                        Ok(ChannelEvent::Price(update)) => {
                            coalescer.record(&registry, &topic, update);
                        }
                        Ok(ChannelEvent::Batch(stocks)) => {
                            coalescer.record_batch(&topic, stocks);
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(topic = %topic, skipped, "Inbound stream lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            debug!(topic = %topic, "Inbound stream closed");
                            return;
                        }
                    },
                }
            }
        });
    }

    /// 토픽으로 이벤트를 push합니다.
    ///
    /// 큐에 등록되는 즉시 반환되며, 서버 응답은 반환된 수신 핸들의
    /// `ack`으로 기다립니다. 레이트 리밋에 걸리면 큐에서 순서대로
    /// 대기합니다.
    pub async fn push(
        &self,
        topic: &str,
        event: &str,
        payload: Value,
    ) -> FeedResult<PushReceipt> {
        self.ensure_connected().await?;
        self.push_queue.enqueue(topic, event, payload)
    }

    /// 연결을 내리고 모든 상태를 정리합니다. 멱등입니다.
    ///
    /// 대기 중인 join 재시도와 push는 모두 취소/실패 처리되고,
    /// 시세 캐시는 비워지며, 상태는 `Disconnected`로 전이합니다.
    pub async fn teardown(&self) {
        let session = {
            let mut slot = self.session.lock().await;
            slot.take()
        };
        let Some(session) = session else {
            return;
        };
        info!("Tearing down feed connection");

        session.token.cancel();

        let entries = self.registry.drain();
        for entry in &entries {
            entry.cancel_tasks();
            entry.deactivate();
        }
        futures::future::join_all(entries.iter().map(|e| async move {
            e.channel().leave().await;
        }))
        .await;
        self.push_queue.fail_all(FeedError::Shutdown);
        self.coalescer.clear();

        if let Err(err) = self.transport.close().await {
            warn!(error = %err, "Transport close failed");
        }
        self.monitor.set(ConnectionState::Disconnected);
    }
}

impl std::fmt::Debug for FeedClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedClient")
            .field("state", &self.state())
            .field("subscriptions", &self.registry.len())
            .finish()
    }
}

/// 구독 핸들.
///
/// drop해도 구독은 유지됩니다. 해제는 명시적으로 `unsubscribe`를
/// 호출해야 합니다.
pub struct Subscription {
    entry: Arc<ChannelEntry>,
    registry: Arc<ChannelRegistry>,
}

impl Subscription {
    /// 구독 토픽.
    pub fn topic(&self) -> &str {
        self.entry.topic()
    }

    /// 구독이 아직 활성인지 확인.
    pub fn is_active(&self) -> bool {
        self.entry.is_active()
    }

    /// 현재 join 상태.
    pub fn join_state(&self) -> feed_core::JoinState {
        self.entry.join_state()
    }

    /// 구독을 해제합니다.
    ///
    /// 대기 중인 join 재시도를 취소하고 채널에서 떠납니다.
    pub async fn unsubscribe(self) {
        self.registry.remove(self.entry.topic()).await;
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic())
            .field("active", &self.is_active())
            .finish()
    }
}
