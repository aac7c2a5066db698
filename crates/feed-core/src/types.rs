//! 연결 상태 및 시세 타입 정의.
//!
//! 이 모듈은 피드 클라이언트 전반에서 사용되는 타입을 정의합니다:
//! - `ConnectionState` - 전송 계층 연결 상태
//! - `PriceUpdate` - 심볼 단위 시세 업데이트
//! - `Stock` / `StockSnapshot` - join 응답으로 받는 초기 스냅샷
//! - `Quote` - 심볼별 최근 시세 캐시 항목

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// 전송 계층 연결 상태.
///
/// 상태 전이는 전송 계층 콜백(open/close/error)과 명시적 teardown으로만
/// 일어납니다.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// 연결 안 됨
    Disconnected,
    /// 연결 시도 중
    Connecting,
    /// 연결됨
    Connected,
    /// 전송 계층 에러
    Error,
}

impl ConnectionState {
    /// 연결된 상태인지 확인.
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Error => write!(f, "error"),
        }
    }
}

/// 토픽 join 상태 머신의 상태.
///
/// `Joined`와 `Failed`는 종결 상태입니다. `Retrying`에서는 백오프 지연 후
/// `Joining`으로 재진입합니다.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinState {
    /// join 시도 전
    Idle,
    /// join 요청 진행 중
    Joining,
    /// join 성공 (종결)
    Joined,
    /// 백오프 대기 중
    Retrying,
    /// 재시도 소진 (종결)
    Failed,
}

impl JoinState {
    /// 종결 상태인지 확인.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JoinState::Joined | JoinState::Failed)
    }
}

impl fmt::Display for JoinState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JoinState::Idle => write!(f, "idle"),
            JoinState::Joining => write!(f, "joining"),
            JoinState::Joined => write!(f, "joined"),
            JoinState::Retrying => write!(f, "retrying"),
            JoinState::Failed => write!(f, "failed"),
        }
    }
}

/// 심볼 단위 시세 업데이트.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceUpdate {
    /// 심볼 (예: "AAPL")
    pub symbol: String,
    /// 현재가
    pub price: Decimal,
    /// 전 시세 대비 변화량
    pub change: Decimal,
}

/// join 스냅샷에 포함되는 종목 정보.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stock {
    /// 심볼
    pub symbol: String,
    /// 종목명 (서버가 제공하지 않을 수 있음)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// 현재가
    pub price: Decimal,
    /// 변화량
    pub change: Decimal,
}

impl Stock {
    /// 종목을 시세 업데이트로 변환.
    pub fn to_update(&self) -> PriceUpdate {
        PriceUpdate {
            symbol: self.symbol.clone(),
            price: self.price,
            change: self.change,
        }
    }
}

/// 채널 join 성공 시 서버가 보내는 초기 스냅샷.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockSnapshot {
    /// 종목 목록
    pub stocks: Vec<Stock>,
}

/// 심볼별 최근 시세 캐시 항목.
///
/// 코얼레싱 버퍼가 업데이트를 기록할 때마다 갱신되며,
/// 소비자가 마지막으로 관측된 시세를 조회할 수 있습니다.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quote {
    /// 심볼
    pub symbol: String,
    /// 종목명 (알려진 경우)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// 마지막 관측가
    pub price: Decimal,
    /// 마지막 변화량
    pub change: Decimal,
    /// 마지막 갱신 시각
    pub updated_at: DateTime<Utc>,
}
