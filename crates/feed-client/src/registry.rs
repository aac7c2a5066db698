//! 토픽별 채널 레지스트리.
//!
//! 토픽 → 채널 핸들 매핑과 구독 활성 플래그를 관리합니다.
//!
//! # 불변식
//!
//! 하나의 토픽에는 어떤 시점에도 최대 하나의 엔트리만 존재합니다.
//! `active` 플래그는 명시적 제거 또는 join 재시도 소진으로만 false가
//! 됩니다. 일시적 join 실패만으로는 내려가지 않습니다.

use crate::transport::TransportChannel;
use feed_core::{FeedError, JoinState, PriceUpdate, StockSnapshot};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// 시세 업데이트 핸들러.
pub type PriceHandler = Arc<dyn Fn(PriceUpdate) + Send + Sync>;
/// join 성공 핸들러 (서버 스냅샷 수신).
pub type JoinHandler = Arc<dyn Fn(StockSnapshot) + Send + Sync>;
/// 종결 join 실패 핸들러.
pub type JoinErrorHandler = Arc<dyn Fn(FeedError) + Send + Sync>;

/// 구독자가 제공하는 핸들러 모음.
///
/// 모든 필드는 선택입니다. join 관련 핸들러가 하나도 없으면
/// join은 재시도 없이 단일 시도로 수행됩니다 (push 전용 구독).
#[derive(Clone, Default)]
pub struct HandlerSet {
    /// 시세 업데이트 콜백
    pub on_new_price: Option<PriceHandler>,
    /// join 성공 콜백
    pub on_join: Option<JoinHandler>,
    /// 종결 join 실패 콜백
    pub on_join_error: Option<JoinErrorHandler>,
}

impl HandlerSet {
    /// 빈 핸들러 모음을 생성합니다.
    pub fn new() -> Self {
        Self::default()
    }

    /// 시세 업데이트 핸들러를 설정합니다.
    pub fn on_new_price(mut self, handler: impl Fn(PriceUpdate) + Send + Sync + 'static) -> Self {
        self.on_new_price = Some(Arc::new(handler));
        self
    }

    /// join 성공 핸들러를 설정합니다.
    pub fn on_join(mut self, handler: impl Fn(StockSnapshot) + Send + Sync + 'static) -> Self {
        self.on_join = Some(Arc::new(handler));
        self
    }

    /// join 실패 핸들러를 설정합니다.
    pub fn on_join_error(mut self, handler: impl Fn(FeedError) + Send + Sync + 'static) -> Self {
        self.on_join_error = Some(Arc::new(handler));
        self
    }

    /// join 관련 핸들러가 하나라도 있는지 확인.
    pub fn wants_join_result(&self) -> bool {
        self.on_join.is_some() || self.on_join_error.is_some()
    }
}

impl std::fmt::Debug for HandlerSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerSet")
            .field("on_new_price", &self.on_new_price.is_some())
            .field("on_join", &self.on_join.is_some())
            .field("on_join_error", &self.on_join_error.is_some())
            .finish()
    }
}

/// 레지스트리에 등록된 토픽 하나의 상태.
pub struct ChannelEntry {
    topic: String,
    channel: Arc<dyn TransportChannel>,
    active: AtomicBool,
    join_state: Mutex<JoinState>,
    /// join 재시도 태스크와 인바운드 펌프를 함께 취소하는 토큰
    cancel: Mutex<Option<CancellationToken>>,
    handlers: HandlerSet,
}

impl ChannelEntry {
    /// 새 엔트리를 생성합니다. 생성 시점에 활성 상태입니다.
    pub fn new(
        topic: impl Into<String>,
        channel: Arc<dyn TransportChannel>,
        handlers: HandlerSet,
    ) -> Self {
        Self {
            topic: topic.into(),
            channel,
            active: AtomicBool::new(true),
            join_state: Mutex::new(JoinState::Idle),
            cancel: Mutex::new(None),
            handlers,
        }
    }

    /// 토픽 반환.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// 채널 핸들 반환.
    pub fn channel(&self) -> Arc<dyn TransportChannel> {
        Arc::clone(&self.channel)
    }

    /// 핸들러 모음 반환.
    pub fn handlers(&self) -> &HandlerSet {
        &self.handlers
    }

    /// 구독 활성 여부.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// 구독을 비활성으로 표시 (join 재시도 소진 시).
    ///
    /// 이후 같은 토픽에 대한 구독 요청은 이 엔트리를 재사용하지 않고
    /// 새 채널을 만듭니다.
    pub fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
    }

    /// 현재 join 상태.
    pub fn join_state(&self) -> JoinState {
        *self.join_state.lock().expect("join state lock poisoned")
    }

    pub(crate) fn set_join_state(&self, state: JoinState) {
        *self.join_state.lock().expect("join state lock poisoned") = state;
    }

    /// 이 엔트리에 속한 태스크들의 취소 토큰을 등록합니다.
    ///
    /// 기존 토큰이 있으면 먼저 취소합니다.
    pub fn set_cancel_token(&self, token: CancellationToken) {
        let mut slot = self.cancel.lock().expect("cancel token lock poisoned");
        if let Some(old) = slot.replace(token) {
            old.cancel();
        }
    }

    /// 대기 중인 join 재시도와 인바운드 펌프를 취소합니다.
    pub fn cancel_tasks(&self) {
        if let Some(token) = self
            .cancel
            .lock()
            .expect("cancel token lock poisoned")
            .take()
        {
            token.cancel();
        }
    }
}

impl std::fmt::Debug for ChannelEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelEntry")
            .field("topic", &self.topic)
            .field("active", &self.is_active())
            .field("join_state", &self.join_state())
            .finish()
    }
}

/// 토픽 → 채널 엔트리 레지스트리.
pub struct ChannelRegistry {
    entries: Mutex<HashMap<String, Arc<ChannelEntry>>>,
    topics_tx: watch::Sender<BTreeSet<String>>,
}

impl ChannelRegistry {
    /// 빈 레지스트리를 생성합니다.
    pub fn new() -> Self {
        let (topics_tx, _) = watch::channel(BTreeSet::new());
        Self {
            entries: Mutex::new(HashMap::new()),
            topics_tx,
        }
    }

    /// 활성 엔트리를 조회합니다.
    ///
    /// 비활성 엔트리(재시도 소진)는 없는 것으로 취급합니다.
    pub fn get_active(&self, topic: &str) -> Option<Arc<ChannelEntry>> {
        let entries = self.entries.lock().expect("registry lock poisoned");
        entries.get(topic).filter(|e| e.is_active()).cloned()
    }

    /// 엔트리를 등록합니다.
    ///
    /// 같은 토픽의 활성 엔트리가 이미 있으면 등록하지 않고 기존
    /// 엔트리를 `Err`로 반환합니다 (중복 구독 방지). 비활성 잔여
    /// 엔트리는 새 엔트리로 교체됩니다.
    pub fn try_insert(
        &self,
        entry: Arc<ChannelEntry>,
    ) -> Result<Arc<ChannelEntry>, Arc<ChannelEntry>> {
        let mut entries = self.entries.lock().expect("registry lock poisoned");
        if let Some(existing) = entries.get(entry.topic()) {
            if existing.is_active() {
                return Err(Arc::clone(existing));
            }
        }
        if let Some(replaced) = entries.insert(entry.topic().to_string(), Arc::clone(&entry)) {
            // 비활성 잔여 엔트리에 남은 펌프 태스크까지 정리
            replaced.cancel_tasks();
        }
        drop(entries);

        self.publish_topics();
        debug!(topic = %entry.topic(), "Channel entry registered");
        Ok(entry)
    }

    /// 엔트리를 제거합니다.
    ///
    /// 대기 중인 join 재시도를 취소하고 채널 leave를 수행한 뒤
    /// 삭제합니다. 엔트리가 없으면 no-op입니다.
    pub async fn remove(&self, topic: &str) -> Option<Arc<ChannelEntry>> {
        let entry = {
            let mut entries = self.entries.lock().expect("registry lock poisoned");
            entries.remove(topic)
        };

        if let Some(ref entry) = entry {
            entry.cancel_tasks();
            entry.deactivate();
            entry.channel().leave().await;
            self.publish_topics();
            debug!(topic = %topic, "Channel entry removed");
        }
        entry
    }

    /// 모든 엔트리를 비우고 반환합니다 (teardown 용).
    ///
    /// leave는 호출자가 수행합니다.
    pub fn drain(&self) -> Vec<Arc<ChannelEntry>> {
        let drained: Vec<_> = {
            let mut entries = self.entries.lock().expect("registry lock poisoned");
            entries.drain().map(|(_, e)| e).collect()
        };
        self.publish_topics();
        drained
    }

    /// 등록된 엔트리 수.
    pub fn len(&self) -> usize {
        self.entries.lock().expect("registry lock poisoned").len()
    }

    /// 레지스트리가 비었는지 확인.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 활성 토픽 집합의 watch 스트림을 반환합니다.
    pub fn watch_topics(&self) -> watch::Receiver<BTreeSet<String>> {
        self.topics_tx.subscribe()
    }

    pub(crate) fn publish_topics(&self) {
        let topics: BTreeSet<String> = {
            let entries = self.entries.lock().expect("registry lock poisoned");
            entries
                .values()
                .filter(|e| e.is_active())
                .map(|e| e.topic().to_string())
                .collect()
        };
        // 수신자가 아직 없어도 저장 값은 갱신되어야 함
        self.topics_tx.send_replace(topics);
    }
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulated::SimulatedChannel;

    fn entry_for(topic: &str) -> Arc<ChannelEntry> {
        let channel = Arc::new(SimulatedChannel::new(topic));
        Arc::new(ChannelEntry::new(topic, channel, HandlerSet::new()))
    }

    #[test]
    fn test_single_entry_per_topic() {
        let registry = ChannelRegistry::new();

        let first = registry.try_insert(entry_for("stock:AAPL")).unwrap();
        // 활성 엔트리가 있으면 새 엔트리는 거부되고 기존 것이 반환됨
        let second = registry.try_insert(entry_for("stock:AAPL"));
        assert!(second.is_err());
        assert!(Arc::ptr_eq(&first, &second.unwrap_err()));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_inactive_entry_replaced() {
        let registry = ChannelRegistry::new();

        let first = registry.try_insert(entry_for("stock:AAPL")).unwrap();
        first.deactivate();
        assert!(registry.get_active("stock:AAPL").is_none());

        let second = registry.try_insert(entry_for("stock:AAPL")).unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_remove_cancels_pending_tasks() {
        let registry = ChannelRegistry::new();
        let entry = registry.try_insert(entry_for("stock:AAPL")).unwrap();

        let token = CancellationToken::new();
        entry.set_cancel_token(token.clone());

        registry.remove("stock:AAPL").await;
        assert!(token.is_cancelled());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_late_watcher_sees_earlier_inserts() {
        let registry = ChannelRegistry::new();

        // 수신자가 생기기 전의 등록/제거도 저장 값에 반영되어야 함
        registry.try_insert(entry_for("stock:AAPL")).unwrap();
        registry.try_insert(entry_for("stock:MSFT")).unwrap();

        let rx = registry.watch_topics();
        let topics = rx.borrow().clone();
        assert!(topics.contains("stock:AAPL"));
        assert!(topics.contains("stock:MSFT"));
    }

    #[test]
    fn test_replacing_inactive_entry_cancels_its_tasks() {
        let registry = ChannelRegistry::new();

        let stale = registry.try_insert(entry_for("stock:AAPL")).unwrap();
        let stale_token = CancellationToken::new();
        stale.set_cancel_token(stale_token.clone());
        stale.deactivate();

        registry.try_insert(entry_for("stock:AAPL")).unwrap();
        assert!(stale_token.is_cancelled());
    }

    #[test]
    fn test_watch_topics_tracks_active_set() {
        let registry = ChannelRegistry::new();
        let rx = registry.watch_topics();

        registry.try_insert(entry_for("stock:AAPL")).unwrap();
        registry.try_insert(entry_for("stock:MSFT")).unwrap();

        let topics = rx.borrow().clone();
        assert!(topics.contains("stock:AAPL"));
        assert!(topics.contains("stock:MSFT"));
        assert_eq!(topics.len(), 2);
    }

    #[test]
    fn test_handler_set_builder() {
        let handlers = HandlerSet::new()
            .on_new_price(|_| {})
            .on_join_error(|_| {});

        assert!(handlers.on_new_price.is_some());
        assert!(handlers.on_join.is_none());
        assert!(handlers.wants_join_result());

        assert!(!HandlerSet::new().on_new_price(|_| {}).wants_join_result());
    }
}
