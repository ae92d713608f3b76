//! 통화 및 오더북 키 타입.
//!
//! - `CurrencySpec` - 통화 한 종을 식별 (네이티브 XRP 또는 발행 통화+발행자)
//! - `BookId` - 오더북 한 면의 키 (gets 통화 : pays 통화)

use crate::error::CoreError;
use crate::types::account::AccountId;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;

/// 네이티브 통화 코드.
pub const NATIVE_CURRENCY: &str = "XRP";

/// 통화 식별자.
///
/// 네이티브 통화는 발행자가 없는 센티널로 정규화됩니다.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CurrencySpec {
    /// 네이티브 통화 (발행자 없음)
    Xrp,
    /// 발행 통화
    Issued {
        /// 통화 코드 (예: "USD")
        currency: String,
        /// 발행자 계정
        issuer: AccountId,
    },
}

impl CurrencySpec {
    /// 발행 통화를 생성합니다.
    pub fn issued(currency: impl Into<String>, issuer: AccountId) -> Self {
        Self::Issued {
            currency: currency.into(),
            issuer,
        }
    }

    /// 통화 코드와 선택적 발행자로부터 생성합니다.
    ///
    /// `XRP`는 발행자 유무와 무관하게 네이티브 센티널로 정규화됩니다.
    pub fn from_parts(currency: &str, issuer: Option<&str>) -> Result<Self, CoreError> {
        if currency == NATIVE_CURRENCY {
            return Ok(Self::Xrp);
        }
        let issuer = issuer.ok_or_else(|| {
            CoreError::InvalidAmount(format!("issued currency {} missing issuer", currency))
        })?;
        Ok(Self::Issued {
            currency: currency.to_string(),
            issuer: AccountId::parse(issuer)?,
        })
    }

    /// 네이티브 통화 여부를 반환합니다.
    pub fn is_native(&self) -> bool {
        matches!(self, Self::Xrp)
    }

    /// 통화 코드를 반환합니다.
    pub fn code(&self) -> &str {
        match self {
            Self::Xrp => NATIVE_CURRENCY,
            Self::Issued { currency, .. } => currency,
        }
    }

    /// 발행자를 반환합니다 (네이티브는 None).
    pub fn issuer(&self) -> Option<&AccountId> {
        match self {
            Self::Xrp => None,
            Self::Issued { issuer, .. } => Some(issuer),
        }
    }

    /// 요청 파라미터용 JSON 표현을 반환합니다.
    pub fn to_wire(&self) -> Value {
        match self {
            Self::Xrp => json!({ "currency": NATIVE_CURRENCY }),
            Self::Issued { currency, issuer } => json!({
                "currency": currency,
                "issuer": issuer.as_str(),
            }),
        }
    }
}

impl fmt::Display for CurrencySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Xrp => write!(f, "{}", NATIVE_CURRENCY),
            Self::Issued { currency, issuer } => write!(f, "{}/{}", currency, issuer),
        }
    }
}

/// 오더북 한 면의 키.
///
/// 표시 형식 `gets:pays`가 레지스트리 키로 사용됩니다.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BookId {
    /// 제안자가 내어주는 쪽 (taker gets)
    pub gets: CurrencySpec,
    /// 제안자가 받는 쪽 (taker pays)
    pub pays: CurrencySpec,
}

impl BookId {
    /// 새 오더북 키를 생성합니다.
    pub fn new(gets: CurrencySpec, pays: CurrencySpec) -> Self {
        Self { gets, pays }
    }

    /// 통화/발행자 쌍으로부터 생성합니다.
    pub fn from_parts(
        gets_currency: &str,
        gets_issuer: Option<&str>,
        pays_currency: &str,
        pays_issuer: Option<&str>,
    ) -> Result<Self, CoreError> {
        Ok(Self {
            gets: CurrencySpec::from_parts(gets_currency, gets_issuer)?,
            pays: CurrencySpec::from_parts(pays_currency, pays_issuer)?,
        })
    }

    /// 두 다리가 모두 유효한 조합인지 확인합니다 (양쪽 모두 네이티브는 불가).
    pub fn is_valid(&self) -> bool {
        !(self.gets.is_native() && self.pays.is_native())
    }
}

impl fmt::Display for BookId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.gets, self.pays)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ISSUER: &str = "rrrrrrrrrrrrrrrrrrrrrhoLvTp";

    #[test]
    fn test_native_normalization() {
        // XRP는 발행자가 주어져도 센티널로 정규화
        let spec = CurrencySpec::from_parts("XRP", Some(ISSUER)).unwrap();
        assert!(spec.is_native());
        assert_eq!(spec.issuer(), None);
    }

    #[test]
    fn test_issued_requires_issuer() {
        assert!(CurrencySpec::from_parts("USD", None).is_err());
        let spec = CurrencySpec::from_parts("USD", Some(ISSUER)).unwrap();
        assert_eq!(spec.code(), "USD");
        assert_eq!(spec.issuer().unwrap().as_str(), ISSUER);
    }

    #[test]
    fn test_book_key_format() {
        let book = BookId::from_parts("USD", Some(ISSUER), "XRP", None).unwrap();
        assert_eq!(book.to_string(), format!("USD/{}:XRP", ISSUER));
        assert!(book.is_valid());

        let both_native = BookId::new(CurrencySpec::Xrp, CurrencySpec::Xrp);
        assert!(!both_native.is_valid());
    }
}
