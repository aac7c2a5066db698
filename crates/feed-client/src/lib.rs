//! 실시간 주가 피드 구독 엔진.
//!
//! 이 크레이트는 다음을 제공합니다:
//! - Transport trait: 추상 전송 계층 인터페이스 (구현은 외부 책임)
//! - FeedClient: 단일 연결 위의 토픽 구독 관리
//! - 토픽당 채널 레지스트리 및 중복 구독 방지
//! - join 재시도 상태 머신 (지수 백오프)
//! - 고빈도 인바운드 업데이트 코얼레싱
//! - Rate limiting이 적용된 아웃바운드 push 큐
//! - 시뮬레이션 전송 계층 (테스트 및 데모용)

pub mod client;
pub mod coalesce;
pub mod connection;
pub mod credentials;
pub mod join;
pub mod rate_limit;
pub mod registry;
pub mod simulated;
pub mod transport;

pub use client::{FeedClient, Subscription};
pub use coalesce::UpdateCoalescer;
pub use connection::ConnectionMonitor;
pub use credentials::{CredentialStore, EnvCredentials, StaticCredentials};
pub use join::backoff_delay;
pub use rate_limit::{PushQueue, PushReceipt};
pub use registry::{ChannelEntry, ChannelRegistry, HandlerSet};
pub use simulated::{SimulatedChannel, SimulatedTransport};
pub use transport::{
    ChannelEvent, Identity, JoinParams, Transport, TransportChannel, TransportEvent,
};
