//! # Feed Core
//!
//! 실시간 주가 피드 클라이언트의 핵심 도메인 모델 및 타입을 제공합니다.
//!
//! 이 크레이트는 피드 클라이언트 전반에서 사용되는 기본 타입을 제공합니다:
//! - 연결 상태 및 시세 업데이트 구조체
//! - 에러 타입 정의
//! - 설정 관리
//! - 로깅 인프라

pub mod config;
pub mod error;
pub mod logging;
pub mod types;

pub use config::*;
pub use error::*;
pub use logging::*;
pub use types::*;
