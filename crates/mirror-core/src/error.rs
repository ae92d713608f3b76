//! 핵심 값 타입의 에러 타입.

use thiserror::Error;

/// 값 타입 및 설정 관련 에러.
#[derive(Debug, Error)]
pub enum CoreError {
    /// 유효하지 않은 계정 식별자
    #[error("Invalid account: {0}")]
    InvalidAccount(String),

    /// 유효하지 않은 금액 표현
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    /// 서로 다른 통화 간 산술 연산
    #[error("Currency mismatch: {left} vs {right}")]
    CurrencyMismatch { left: String, right: String },

    /// 0으로 나누기
    #[error("Division by zero")]
    DivisionByZero,

    /// 설정 에러
    #[error("Config error: {0}")]
    Config(String),
}
