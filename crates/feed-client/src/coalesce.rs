//! 가격 업데이트 병합 버퍼.
//!
//! 인바운드 업데이트는 심볼별로 버퍼에 쌓이고, 플러시 주기(기본 30ms)
//! 안에 같은 심볼로 여러 건이 도착하면 마지막 건만 남습니다.
//! 단건 업데이트는 버퍼와 별개로 해당 토픽의 핸들러에 즉시 전달되며,
//! 주기 플러시는 보조 전달 경로입니다. 배치 스냅샷은 플러시로만
//! 전달됩니다.
//!
//! 심볼별 최신 시세 캐시를 함께 유지하며, 배치 스냅샷의 변동폭
//! (change)은 캐시된 직전 가격 기준으로 재계산합니다.

use crate::registry::ChannelRegistry;
use feed_core::{PriceUpdate, Quote, Stock};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// 플러시 대기 중인 업데이트 한 건.
#[derive(Debug, Clone)]
struct Pending {
    topic: String,
    update: PriceUpdate,
}

/// 심볼 단위 last-write-wins 병합 버퍼 + 시세 캐시.
#[derive(Debug, Default)]
pub struct UpdateCoalescer {
    pending: Mutex<HashMap<String, Pending>>,
    quotes: Mutex<HashMap<String, Quote>>,
}

impl UpdateCoalescer {
    pub fn new() -> Self {
        Self::default()
    }

    /// 단건 업데이트를 기록합니다.
    ///
    /// 같은 심볼의 미플러시 건은 덮어쓰고, 토픽에 가격 핸들러가 있으면
    /// 즉시 동기 호출합니다. 핸들러 호출은 버퍼 락을 놓은 뒤입니다.
    pub fn record(&self, registry: &ChannelRegistry, topic: &str, mut update: PriceUpdate) {
        self.apply_change_policy(&mut update);
        self.cache_quote(&update, None);
        trace!(topic, symbol = %update.symbol, price = %update.price, "Update buffered");
        {
            let mut pending = self.pending.lock().expect("pending lock poisoned");
            pending.insert(
                update.symbol.clone(),
                Pending {
                    topic: topic.to_string(),
                    update: update.clone(),
                },
            );
        }

        if let Some(entry) = registry.get_active(topic) {
            if let Some(on_new_price) = &entry.handlers().on_new_price {
                on_new_price(update);
            }
        }
    }

    /// 배치 스냅샷을 기록합니다. 전달은 다음 플러시에서 이뤄집니다.
    ///
    /// 캐시에 직전 가격이 있으면 변동폭을 `price - cached_price`로
    /// 재계산하고, 없으면 피드가 준 값을 그대로 씁니다.
    pub fn record_batch(&self, topic: &str, stocks: Vec<Stock>) {
        for stock in stocks {
            let mut update = stock.to_update();
            self.apply_change_policy(&mut update);
            self.cache_quote(&update, stock.name);
            let mut pending = self.pending.lock().expect("pending lock poisoned");
            pending.insert(
                update.symbol.clone(),
                Pending {
                    topic: topic.to_string(),
                    update,
                },
            );
        }
    }

    /// 버퍼를 비우고 병합된 업데이트를 각 토픽의 가격 핸들러에 전달합니다.
    pub fn flush(&self, registry: &ChannelRegistry) {
        let drained: Vec<Pending> = {
            let mut pending = self.pending.lock().expect("pending lock poisoned");
            if pending.is_empty() {
                return;
            }
            pending.drain().map(|(_, p)| p).collect()
        };
        debug!(count = drained.len(), "Flushing coalesced updates");

        for item in drained {
            if let Some(entry) = registry.get_active(&item.topic) {
                if let Some(on_new_price) = &entry.handlers().on_new_price {
                    on_new_price(item.update);
                }
            }
        }
    }

    /// 캐시된 최신 시세를 조회합니다.
    pub fn quote(&self, symbol: &str) -> Option<Quote> {
        self.quotes
            .lock()
            .expect("quotes lock poisoned")
            .get(symbol)
            .cloned()
    }

    /// 캐시된 전체 시세의 스냅샷을 심볼 순으로 반환합니다.
    pub fn quotes(&self) -> Vec<Quote> {
        let mut all: Vec<Quote> = self
            .quotes
            .lock()
            .expect("quotes lock poisoned")
            .values()
            .cloned()
            .collect();
        all.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        all
    }

    /// 버퍼와 캐시를 모두 비웁니다. 연결 해제 시 호출됩니다.
    pub fn clear(&self) {
        self.pending.lock().expect("pending lock poisoned").clear();
        self.quotes.lock().expect("quotes lock poisoned").clear();
    }

    /// 캐시에 직전 가격이 있으면 `change`를 재계산하고, 없으면 피드가
    /// 준 값을 유지합니다. 단건/배치 경로에 동일하게 적용됩니다.
    fn apply_change_policy(&self, update: &mut PriceUpdate) {
        let cached = {
            let quotes = self.quotes.lock().expect("quotes lock poisoned");
            quotes.get(&update.symbol).map(|q| q.price)
        };
        if let Some(prev) = cached {
            update.change = update.price - prev;
        }
    }

    fn cache_quote(&self, update: &PriceUpdate, name: Option<String>) {
        let mut quotes = self.quotes.lock().expect("quotes lock poisoned");
        let quote = quotes
            .entry(update.symbol.clone())
            .or_insert_with(|| Quote {
                symbol: update.symbol.clone(),
                name: None,
                price: update.price,
                change: update.change,
                updated_at: chrono::Utc::now(),
            });
        quote.price = update.price;
        quote.change = update.change;
        quote.updated_at = chrono::Utc::now();
        if name.is_some() {
            quote.name = name;
        }
    }
}

/// 플러시 주기 드라이버. 취소 토큰이 내려가면 마지막 플러시 없이 종료합니다.
pub async fn run_flush_loop(
    coalescer: std::sync::Arc<UpdateCoalescer>,
    registry: std::sync::Arc<ChannelRegistry>,
    interval: Duration,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = token.cancelled() => {
                debug!("Flush loop stopped");
                return;
            }
            _ = ticker.tick() => {
                coalescer.flush(&registry);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ChannelEntry, HandlerSet};
    use crate::simulated::SimulatedChannel;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn update(symbol: &str, price: rust_decimal::Decimal) -> PriceUpdate {
        PriceUpdate {
            symbol: symbol.to_string(),
            price,
            change: dec!(0),
        }
    }

    fn registry_with_counter(topic: &str) -> (ChannelRegistry, Arc<AtomicU32>) {
        let registry = ChannelRegistry::new();
        let count = Arc::new(AtomicU32::new(0));
        let count_in = Arc::clone(&count);
        let handlers = HandlerSet::new().on_new_price(move |_| {
            count_in.fetch_add(1, Ordering::SeqCst);
        });
        let channel = Arc::new(SimulatedChannel::new(topic));
        registry
            .try_insert(Arc::new(ChannelEntry::new(topic, channel, handlers)))
            .unwrap();
        (registry, count)
    }

    #[test]
    fn test_record_delivers_synchronously_and_buffers_latest() {
        let (registry, count) = registry_with_counter("stock:AAPL");
        let coalescer = UpdateCoalescer::new();

        coalescer.record(&registry, "stock:AAPL", update("AAPL", dec!(100)));
        coalescer.record(&registry, "stock:AAPL", update("AAPL", dec!(101)));
        // 단건 경로는 즉시 전달
        assert_eq!(count.load(Ordering::SeqCst), 2);

        // 버퍼에는 마지막 건만 남고, change는 캐시된 직전가(100) 기준
        let pending = coalescer.pending.lock().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending["AAPL"].update.price, dec!(101));
        assert_eq!(pending["AAPL"].update.change, dec!(1));
    }

    #[test]
    fn test_flush_delivers_latest_once_then_clears() {
        let (registry, count) = registry_with_counter("stock:AAPL");
        let coalescer = UpdateCoalescer::new();

        coalescer.record(&registry, "stock:AAPL", update("AAPL", dec!(100)));
        coalescer.record(&registry, "stock:AAPL", update("AAPL", dec!(101)));
        assert_eq!(count.load(Ordering::SeqCst), 2);

        coalescer.flush(&registry);
        assert_eq!(count.load(Ordering::SeqCst), 3);

        // 빈 버퍼 플러시는 no-op
        coalescer.flush(&registry);
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_batch_change_recomputed_from_cache() {
        let (registry, count) = registry_with_counter("stock:AAPL");
        let coalescer = UpdateCoalescer::new();
        coalescer.record(&registry, "stock:AAPL", update("AAPL", dec!(100)));

        let stock = Stock {
            symbol: "AAPL".to_string(),
            name: Some("Apple".to_string()),
            price: dec!(105),
            change: dec!(99),
        };
        coalescer.record_batch("stock:AAPL", vec![stock]);
        // 배치 경로는 플러시 전까지 전달하지 않음
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // 피드가 준 change(99)가 아니라 캐시 기준 105 - 100
        let quote = coalescer.quote("AAPL").unwrap();
        assert_eq!(quote.change, dec!(5));
        assert_eq!(quote.name.as_deref(), Some("Apple"));
    }

    #[test]
    fn test_batch_without_cache_keeps_feed_change() {
        let coalescer = UpdateCoalescer::new();
        let stock = Stock {
            symbol: "TSLA".to_string(),
            name: None,
            price: dec!(200),
            change: dec!(3),
        };
        coalescer.record_batch("stock:TSLA", vec![stock]);

        assert_eq!(coalescer.quote("TSLA").unwrap().change, dec!(3));
    }

    #[test]
    fn test_clear_drops_cache() {
        let registry = ChannelRegistry::new();
        let coalescer = UpdateCoalescer::new();
        coalescer.record(&registry, "stock:AAPL", update("AAPL", dec!(100)));
        coalescer.clear();
        assert!(coalescer.quote("AAPL").is_none());
        assert!(coalescer.quotes().is_empty());
    }
}
