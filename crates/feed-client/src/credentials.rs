//! 영속화된 자격증명 저장소.
//!
//! 연결을 열고 토픽에 join하려면 사용자 식별자가 필요합니다.
//! 식별자가 없으면 설정 전제조건 실패로 처리됩니다.

use crate::transport::Identity;

/// 클라이언트 측 자격증명 읽기 인터페이스.
pub trait CredentialStore: Send + Sync {
    /// 저장된 식별 정보를 반환합니다. 없으면 `None`.
    fn identity(&self) -> Option<Identity>;
}

/// 환경 변수 기반 자격증명 저장소.
///
/// `FEED_USER_ID`와 `FEED_TOKEN`(선택)을 읽습니다.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvCredentials;

impl CredentialStore for EnvCredentials {
    fn identity(&self) -> Option<Identity> {
        let user_id = std::env::var("FEED_USER_ID").ok()?;
        if user_id.is_empty() {
            return None;
        }

        let mut identity = Identity::new(user_id);
        if let Ok(token) = std::env::var("FEED_TOKEN") {
            if !token.is_empty() {
                identity = identity.with_token(token);
            }
        }
        Some(identity)
    }
}

/// 고정된 자격증명 저장소 (테스트 및 내장 설정용).
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    identity: Option<Identity>,
}

impl StaticCredentials {
    /// 주어진 식별 정보로 저장소를 생성합니다.
    pub fn new(identity: Identity) -> Self {
        Self {
            identity: Some(identity),
        }
    }

    /// 비어 있는 저장소를 생성합니다 (전제조건 실패 테스트용).
    pub fn empty() -> Self {
        Self { identity: None }
    }
}

impl CredentialStore for StaticCredentials {
    fn identity(&self) -> Option<Identity> {
        self.identity.clone()
    }
}
