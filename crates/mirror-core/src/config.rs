//! 설정 관리.
//!
//! 미러 클라이언트의 설정을 정의하고 파일/환경 변수에서 로드합니다.

use crate::error::CoreError;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// 미러 클라이언트 설정.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct MirrorConfig {
    /// 후보 서버 목록
    #[serde(default)]
    pub servers: Vec<ServerEndpoint>,
    /// 연결 관련 설정
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// 로깅 설정
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// 후보 서버 한 대의 설정.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerEndpoint {
    /// WebSocket 엔드포인트 URL (예: "wss://s1.example.net:443")
    pub url: String,
    /// 우선 서버 지정 여부
    #[serde(default)]
    pub primary: bool,
}

impl ServerEndpoint {
    /// 새 서버 엔드포인트를 생성합니다.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            primary: false,
        }
    }

    /// 우선 서버로 지정합니다.
    pub fn primary(mut self) -> Self {
        self.primary = true;
        self
    }
}

/// 연결 동작 설정.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConnectionConfig {
    /// 최근 수신 트랜잭션 해시 집합의 용량
    pub seen_tx_capacity: usize,
    /// 원장 마감 신호가 없을 때 연결을 끊은 것으로 간주하는 시간 (초)
    pub stale_after_secs: u64,
    /// 스테일 검사 주기 (초)
    pub watchdog_interval_secs: u64,
    /// 연결 시도 타임아웃 (초)
    pub connect_timeout_secs: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            seen_tx_capacity: 100,
            stale_after_secs: 60,
            watchdog_interval_secs: 15,
            connect_timeout_secs: 10,
        }
    }
}

/// 로깅 설정.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// 로그 레벨
    pub level: String,
    /// 로그 형식 (pretty, json, compact)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl MirrorConfig {
    /// 파일과 `MIRROR_` 환경 변수에서 설정을 로드합니다.
    ///
    /// 환경 변수가 파일 값을 덮어씁니다
    /// (예: `MIRROR_CONNECTION__STALE_AFTER_SECS=120`).
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let builder = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(config::Environment::with_prefix("MIRROR").separator("__"));

        builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| CoreError::Config(e.to_string()))
    }

    /// 환경 변수만으로 설정을 로드합니다.
    pub fn from_env() -> Result<Self, CoreError> {
        let builder = config::Config::builder()
            .add_source(config::Environment::with_prefix("MIRROR").separator("__"));

        builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| CoreError::Config(e.to_string()))
    }

    /// 서버를 추가합니다.
    pub fn with_server(mut self, endpoint: ServerEndpoint) -> Self {
        self.servers.push(endpoint);
        self
    }
}
