//! 계정 식별자 타입.
//!
//! 원장 계정 주소를 나타냅니다. 검증은 문법적(syntactic) 수준에서만
//! 수행됩니다: 선행 `r`, base58 알파벳, 길이 25~35자. 체크섬 검증은
//! 주소/키 처리 계층의 책임이며 이 크레이트의 범위가 아닙니다.

use crate::error::CoreError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// 원장 주소에서 사용되는 base58 알파벳.
const BASE58_ALPHABET: &str = "rpshnaf39wBUDNEGHJKLM4PQRST7VWXYZ2bcdeCg65jkm8oFqi1tuvAxyz";

const MIN_LEN: usize = 25;
const MAX_LEN: usize = 35;

/// 원장 계정 식별자.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AccountId(String);

impl AccountId {
    /// 문자열을 계정 식별자로 파싱합니다.
    pub fn parse(s: &str) -> Result<Self, CoreError> {
        if Self::is_valid(s) {
            Ok(Self(s.to_string()))
        } else {
            Err(CoreError::InvalidAccount(s.to_string()))
        }
    }

    /// 문자열이 문법적으로 유효한 계정 식별자인지 확인합니다.
    pub fn is_valid(s: &str) -> bool {
        if !(MIN_LEN..=MAX_LEN).contains(&s.len()) {
            return false;
        }
        if !s.starts_with('r') {
            return false;
        }
        s.chars().all(|c| BASE58_ALPHABET.contains(c))
    }

    /// 내부 문자열 표현을 반환합니다.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// serde(try_from)용 변환.
impl TryFrom<String> for AccountId {
    type Error = CoreError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<AccountId> for String {
    fn from(account: AccountId) -> String {
        account.0
    }
}
