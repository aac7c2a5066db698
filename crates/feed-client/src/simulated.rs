//! 시뮬레이션 전송 백엔드.
//!
//! 실제 네트워크 없이 전체 클라이언트 경로를 구동할 수 있는
//! 인메모리 트랜스포트입니다. 테스트에서는 join/push 결과를
//! 스크립트로 주입하고, 데모에서는 랜덤 워크 티커로 가격을
//! 흘려보냅니다.

use crate::transport::{
    ChannelEvent, Identity, JoinParams, Transport, TransportChannel, TransportEvent,
};
use async_trait::async_trait;
use feed_core::{FeedError, FeedResult, PriceUpdate, Stock, StockSnapshot};
use rand::Rng;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// 인메모리 트랜스포트.
pub struct SimulatedTransport {
    open_results: Mutex<VecDeque<FeedResult<()>>>,
    channels: Mutex<HashMap<String, Arc<SimulatedChannel>>>,
    events_tx: broadcast::Sender<TransportEvent>,
    opened_as: Mutex<Option<Identity>>,
}

impl SimulatedTransport {
    pub fn new() -> Self {
        let (events_tx, _) = broadcast::channel(32);
        Self {
            open_results: Mutex::new(VecDeque::new()),
            channels: Mutex::new(HashMap::new()),
            events_tx,
            opened_as: Mutex::new(None),
        }
    }

    /// 다음 `open` 호출의 결과를 예약합니다. 예약이 없으면 성공합니다.
    pub fn script_open(&self, result: FeedResult<()>) {
        self.open_results.lock().unwrap().push_back(result);
    }

    /// 마지막으로 연결에 사용된 식별 정보.
    pub fn opened_identity(&self) -> Option<Identity> {
        self.opened_as.lock().unwrap().clone()
    }

    /// 생성된 채널 핸들을 조회합니다 (테스트 검증용).
    pub fn channel_handle(&self, topic: &str) -> Option<Arc<SimulatedChannel>> {
        self.channels.lock().unwrap().get(topic).cloned()
    }

    /// 전송 에러 이벤트를 주입합니다.
    pub fn emit_error(&self, reason: impl Into<String>) {
        let _ = self.events_tx.send(TransportEvent::Error(reason.into()));
    }
}

impl Default for SimulatedTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for SimulatedTransport {
    async fn open(&self, identity: &Identity) -> FeedResult<()> {
        let scripted = self.open_results.lock().unwrap().pop_front();
        match scripted.unwrap_or(Ok(())) {
            Ok(()) => {
                *self.opened_as.lock().unwrap() = Some(identity.clone());
                let _ = self.events_tx.send(TransportEvent::Opened);
                debug!(user_id = %identity.user_id, "Simulated transport opened");
                Ok(())
            }
            Err(err) => {
                let _ = self
                    .events_tx
                    .send(TransportEvent::Error(err.to_string()));
                Err(err)
            }
        }
    }

    async fn close(&self) -> FeedResult<()> {
        *self.opened_as.lock().unwrap() = None;
        let _ = self.events_tx.send(TransportEvent::Closed);
        Ok(())
    }

    async fn channel(&self, topic: &str) -> FeedResult<Arc<dyn TransportChannel>> {
        let mut channels = self.channels.lock().unwrap();
        // leave된 핸들은 재사용하지 않고 새로 만듦
        let reusable = channels
            .get(topic)
            .filter(|c| !c.has_left())
            .cloned();
        let channel = match reusable {
            Some(existing) => existing,
            None => {
                let fresh = Arc::new(SimulatedChannel::new(topic));
                channels.insert(topic.to_string(), Arc::clone(&fresh));
                fresh
            }
        };
        Ok(channel)
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events_tx.subscribe()
    }
}

/// 인메모리 채널.
///
/// join/push 결과를 `VecDeque`로 스크립트할 수 있으며, 예약이 없으면
/// 기본 성공 응답을 반환합니다.
pub struct SimulatedChannel {
    topic: String,
    join_results: Mutex<VecDeque<FeedResult<StockSnapshot>>>,
    join_delay: Mutex<Option<Duration>>,
    join_calls: AtomicU32,
    push_results: Mutex<VecDeque<FeedResult<Value>>>,
    pushes: Mutex<Vec<(String, Value)>>,
    updates_tx: broadcast::Sender<ChannelEvent>,
    left: AtomicBool,
}

impl SimulatedChannel {
    pub fn new(topic: impl Into<String>) -> Self {
        let (updates_tx, _) = broadcast::channel(64);
        Self {
            topic: topic.into(),
            join_results: Mutex::new(VecDeque::new()),
            join_delay: Mutex::new(None),
            join_calls: AtomicU32::new(0),
            push_results: Mutex::new(VecDeque::new()),
            pushes: Mutex::new(Vec::new()),
            updates_tx,
            left: AtomicBool::new(false),
        }
    }

    /// 토픽 문자열의 소유 복사본.
    pub fn topic_name(&self) -> String {
        self.topic.clone()
    }

    /// 다음 join 호출의 결과를 예약합니다.
    pub fn script_join(&self, result: FeedResult<StockSnapshot>) {
        self.join_results.lock().unwrap().push_back(result);
    }

    /// join 응답 전 지연을 설정합니다 (타임아웃 시나리오용).
    pub fn set_join_delay(&self, delay: Duration) {
        *self.join_delay.lock().unwrap() = Some(delay);
    }

    /// 지금까지의 join 호출 수.
    pub fn join_count(&self) -> u32 {
        self.join_calls.load(Ordering::SeqCst)
    }

    /// 다음 push 호출의 결과를 예약합니다.
    pub fn script_push(&self, result: FeedResult<Value>) {
        self.push_results.lock().unwrap().push_back(result);
    }

    /// 지금까지의 push 호출 수.
    pub fn push_count(&self) -> usize {
        self.pushes.lock().unwrap().len()
    }

    /// 수신된 push의 (이벤트, 페이로드) 로그.
    pub fn push_log(&self) -> Vec<(String, Value)> {
        self.pushes.lock().unwrap().clone()
    }

    /// 단건 가격 이벤트를 인바운드 스트림에 주입합니다.
    pub fn emit_price(&self, update: PriceUpdate) {
        let _ = self.updates_tx.send(ChannelEvent::Price(update));
    }

    /// 배치 스냅샷 이벤트를 인바운드 스트림에 주입합니다.
    pub fn emit_batch(&self, stocks: Vec<Stock>) {
        let _ = self.updates_tx.send(ChannelEvent::Batch(stocks));
    }

    /// leave가 호출되었는지 확인.
    pub fn has_left(&self) -> bool {
        self.left.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransportChannel for SimulatedChannel {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn join(&self, _params: &JoinParams, _timeout: Duration) -> FeedResult<StockSnapshot> {
        self.join_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.join_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let scripted = self.join_results.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| Ok(StockSnapshot::default()))
    }

    async fn push(&self, event: &str, payload: Value) -> FeedResult<Value> {
        if self.has_left() {
            return Err(FeedError::ChannelNotFound(self.topic.clone()));
        }
        self.pushes
            .lock()
            .unwrap()
            .push((event.to_string(), payload));
        let scripted = self.push_results.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| Ok(json!({"status": "ok"})))
    }

    fn updates(&self) -> broadcast::Receiver<ChannelEvent> {
        self.updates_tx.subscribe()
    }

    async fn leave(&self) {
        self.left.store(true, Ordering::SeqCst);
        debug!(topic = %self.topic, "Simulated channel left");
    }
}

/// 랜덤 워크 가격 티커를 시작합니다 (데모용 피드 소스).
pub fn spawn_random_ticker(
    channel: Arc<SimulatedChannel>,
    symbol: String,
    start_price: Decimal,
    interval: Duration,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut price = start_price;
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = ticker.tick() => {
                    let step_cents: i64 = rand::thread_rng().gen_range(-50..=50);
                    let change = Decimal::new(step_cents, 2);
                    price += change;
                    channel.emit_price(PriceUpdate {
                        symbol: symbol.clone(),
                        price,
                        change,
                    });
                }
            }
        }
    })
}
