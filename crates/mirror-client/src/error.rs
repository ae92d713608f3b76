//! 클라이언트 에러 타입.

use mirror_core::CoreError;
use thiserror::Error;

/// 클라이언트 작업을 위한 Result 타입.
pub type ClientResult<T> = Result<T, ClientError>;

/// 세션/서버셋/미러 계층의 에러.
#[derive(Debug, Error)]
pub enum ClientError {
    /// 전송 계층 에러 (연결 거부, 리셋, 타임아웃)
    #[error("Transport error: {0}")]
    Transport(String),

    /// 연결되지 않은 세션에 대한 요청
    #[error("Not connected: {0}")]
    NotConnected(String),

    /// 등록된 서버 없음
    #[error("No servers available")]
    NoServersAvailable,

    /// 프로토콜 에러 (응답 형식 불일치)
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// 서버가 명시적으로 보고한 에러
    #[error("Remote error {code}: {message}")]
    Remote { code: String, message: String },

    /// 트랜잭션 메타데이터 파싱 실패
    #[error("Diff parse error: {0}")]
    DiffParse(String),

    /// 해체된 세션/미러에 대한 요청
    #[error("Torn down")]
    TornDown,

    /// 값 타입 에러
    #[error(transparent)]
    Core(#[from] CoreError),
}

impl ClientError {
    /// 재시도 가능한 에러인지 확인.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClientError::Transport(_) | ClientError::NotConnected(_)
        )
    }
}
