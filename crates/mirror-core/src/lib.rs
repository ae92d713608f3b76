//! # Mirror Core
//!
//! 원장 미러 클라이언트의 핵심 값 타입 및 공유 인프라를 제공합니다.
//!
//! 이 크레이트는 미러 시스템 전반에서 사용되는 기본 타입을 제공합니다:
//! - 원장 금액 타입 (`Amount`) 및 비교/산술 연산
//! - 계정 식별자 (`AccountId`)
//! - 통화 및 오더북 키 (`CurrencySpec`, `BookId`)
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
