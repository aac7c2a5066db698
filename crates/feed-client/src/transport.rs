//! 추상 전송 계층 trait 정의.
//!
//! 프레이밍, 멀티플렉싱, 하트비트 등 전송 계층 자체는 이 크레이트의
//! 책임이 아닙니다. 엔진은 연결을 열고 닫을 수 있고, 토픽별 채널을
//! 생성할 수 있는 추상 능력만 소비합니다.

use async_trait::async_trait;
use feed_core::{FeedResult, PriceUpdate, Stock, StockSnapshot};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// 연결을 열 때 사용하는 클라이언트 식별 정보.
///
/// 영속화된 자격증명 저장소에서 읽어오며, 없으면 연결 자체가
/// 전제조건 실패로 거부됩니다.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// 사용자 식별자
    pub user_id: String,
    /// 인증 토큰 (선택)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl Identity {
    /// 새 식별 정보를 생성합니다.
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            token: None,
        }
    }

    /// 인증 토큰을 설정합니다.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }
}

/// 채널 join 요청에 실어 보내는 파라미터.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinParams {
    /// 사용자 식별자
    pub user_id: String,
}

impl From<&Identity> for JoinParams {
    fn from(identity: &Identity) -> Self {
        Self {
            user_id: identity.user_id.clone(),
        }
    }
}

/// 전송 계층 상태 이벤트.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// 연결 열림
    Opened,
    /// 연결 닫힘
    Closed,
    /// 전송 계층 에러
    Error(String),
}

/// 채널로 수신되는 인바운드 이벤트.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// 단일 심볼 시세 업데이트 (`new_price`)
    Price(PriceUpdate),
    /// 다중 심볼 일괄 업데이트 (`new_prices`)
    Batch(Vec<Stock>),
}

/// 추상 전송 연결.
///
/// 구현체는 연결 열기/닫기와 토픽별 채널 생성을 제공해야 합니다.
/// 상태 변화는 broadcast 스트림으로 통지됩니다.
#[async_trait]
pub trait Transport: Send + Sync {
    /// 식별 정보로 연결을 엽니다. 연결 수립 시점에 resolve됩니다.
    async fn open(&self, identity: &Identity) -> FeedResult<()>;

    /// 연결을 닫습니다.
    async fn close(&self) -> FeedResult<()>;

    /// 토픽에 대한 채널 핸들을 생성합니다.
    ///
    /// 구현은 같은 토픽에 대해 살아있는 기존 핸들을 공유 반환할 수
    /// 있습니다. 호출자는 핸들이 유일하다고 가정하면 안 됩니다.
    async fn channel(&self, topic: &str) -> FeedResult<Arc<dyn TransportChannel>>;

    /// 연결 상태 이벤트 스트림을 구독합니다.
    fn events(&self) -> broadcast::Receiver<TransportEvent>;
}

/// 하나의 토픽에 스코프된 논리 채널.
#[async_trait]
pub trait TransportChannel: Send + Sync {
    /// 채널이 속한 토픽.
    fn topic(&self) -> &str;

    /// 채널 join 핸드셰이크를 수행하고 초기 스냅샷을 반환합니다.
    async fn join(&self, params: &JoinParams, timeout: Duration) -> FeedResult<StockSnapshot>;

    /// 이벤트를 채널로 push하고 서버 응답을 반환합니다.
    async fn push(&self, event: &str, payload: Value) -> FeedResult<Value>;

    /// 인바운드 이벤트 스트림을 구독합니다.
    fn updates(&self) -> broadcast::Receiver<ChannelEvent>;

    /// 채널에서 떠납니다 (best-effort).
    async fn leave(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_builder() {
        let identity = Identity::new("user-1").with_token("t0k3n");
        assert_eq!(identity.user_id, "user-1");
        assert_eq!(identity.token.as_deref(), Some("t0k3n"));
    }

    #[test]
    fn test_join_params_from_identity() {
        let identity = Identity::new("user-1");
        let params = JoinParams::from(&identity);
        assert_eq!(params.user_id, "user-1");
    }
}
