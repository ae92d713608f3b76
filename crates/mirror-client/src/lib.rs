//! 원장 미러 클라이언트.
//!
//! 여러 후보 서버와의 WebSocket 세션을 관리하고, 검증된 트랜잭션
//! 스트림에서 원장 변경(diff)을 해석해 구독자에게 전달하며,
//! 오더북의 살아있는 미러를 유지합니다.
//!
//! 계층 구조:
//! - [`transport`]: WebSocket 전송 추상화 (테스트 주입 지점)
//! - [`session`]: 서버 한 대와의 재연결 세션 액터
//! - [`server_set`]: 세션 집합, 중복 제거, 구독자 팬아웃
//! - [`diff`]: 트랜잭션 메타데이터를 정규화한 원장 변경 뷰
//! - [`book`]: 오더북 미러 (스냅샷 + 증분 갱신)

pub mod book;
pub mod diff;
pub mod error;
pub mod server_set;
pub mod session;
pub mod transport;

pub use book::{BookEvent, Offer, OrderBookMirror};
pub use diff::{DiffNode, DiffType, LedgerDiff};
pub use error::{ClientError, ClientResult};
pub use server_set::{ConnectionState, RawEvent, ServerSet, TransactionUpdate};
pub use session::{SessionHandle, SessionState};
pub use transport::{Connector, Transport, WsConnector};
