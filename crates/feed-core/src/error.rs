//! 피드 클라이언트 에러 타입.

use thiserror::Error;

/// 피드 작업을 위한 Result 타입.
pub type FeedResult<T> = Result<T, FeedError>;

/// 피드 관련 에러.
#[derive(Debug, Clone, Error)]
pub enum FeedError {
    /// 자격증명 없음 (설정 전제조건 실패)
    #[error("Missing credential: no user id available")]
    MissingCredential,

    /// 연결되지 않음
    #[error("Not connected: {0}")]
    NotConnected(String),

    /// 해당 토픽의 채널 없음
    #[error("Channel not found for topic: {0}")]
    ChannelNotFound(String),

    /// 채널 join 거부됨
    #[error("Join rejected: {0}")]
    JoinRejected(String),

    /// 채널 join 타임아웃
    #[error("Join timed out after {0}ms")]
    JoinTimeout(u64),

    /// push 요청 거부됨
    #[error("Push rejected: {0}")]
    PushRejected(String),

    /// 전송 큐 용량 초과
    #[error("Push queue full (capacity {0})")]
    QueueFull(usize),

    /// 전송 계층 에러
    #[error("Transport error: {0}")]
    Transport(String),

    /// 클라이언트 종료됨
    #[error("Feed client shut down")]
    Shutdown,

    /// 파싱/역직렬화 에러
    #[error("Parse error: {0}")]
    Parse(String),
}

impl FeedError {
    /// 재시도 가능한 에러인지 확인.
    ///
    /// join 재시도 정책은 일시적 프로토콜 실패에만 적용됩니다.
    /// 전제조건 실패는 즉시 호출자에게 보고되며 재시도되지 않습니다.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FeedError::JoinRejected(_)
                | FeedError::JoinTimeout(_)
                | FeedError::Transport(_)
                | FeedError::NotConnected(_)
        )
    }

    /// 설정/전제조건 실패인지 확인.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            FeedError::MissingCredential | FeedError::ChannelNotFound(_)
        )
    }
}

impl From<serde_json::Error> for FeedError {
    fn from(err: serde_json::Error) -> Self {
        FeedError::Parse(err.to_string())
    }
}
