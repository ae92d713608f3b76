//! 원장 금액 타입.
//!
//! 네이티브 금액은 정수 drop 단위 문자열로, 발행 통화 금액은
//! `{value, currency, issuer}` 객체로 전송됩니다. 이 타입이 파싱,
//! 비교, 산술, 정규화 문자열 변환을 모두 담당하며, 미러/디프 계층은
//! 직접 소수점 연산을 수행하지 않습니다.

use crate::error::CoreError;
use crate::types::book::CurrencySpec;
use crate::AccountId;
use rust_decimal::Decimal;
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;

/// 발행자 수수료가 없는 기본 전송 수수료율.
pub const DEFAULT_TRANSFER_RATE: u32 = 1_000_000_000;

/// 원장 금액.
///
/// 네이티브 금액의 `value`는 drop 단위 정수입니다.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Amount {
    value: Decimal,
    currency: CurrencySpec,
}

impl Amount {
    /// 네이티브 금액을 drop 단위로 생성합니다.
    pub fn drops(value: Decimal) -> Self {
        Self {
            value,
            currency: CurrencySpec::Xrp,
        }
    }

    /// 발행 통화 금액을 생성합니다.
    pub fn issued(value: Decimal, currency: CurrencySpec) -> Self {
        Self { value, currency }
    }

    /// 주어진 통화의 0 금액을 생성합니다.
    pub fn zero(currency: CurrencySpec) -> Self {
        Self {
            value: Decimal::ZERO,
            currency,
        }
    }

    /// 전송 형식(JSON 값)에서 금액을 파싱합니다.
    ///
    /// 문자열은 네이티브 drop 금액, 객체는 발행 통화 금액입니다.
    pub fn parse(value: &Value) -> Result<Self, CoreError> {
        match value {
            Value::String(s) => {
                let drops: Decimal = s
                    .parse()
                    .map_err(|_| CoreError::InvalidAmount(s.clone()))?;
                if drops.fract() != Decimal::ZERO {
                    return Err(CoreError::InvalidAmount(format!(
                        "native amount must be whole drops: {}",
                        s
                    )));
                }
                Ok(Self::drops(drops))
            }
            Value::Object(map) => {
                let raw = map
                    .get("value")
                    .and_then(Value::as_str)
                    .ok_or_else(|| CoreError::InvalidAmount(value.to_string()))?;
                let parsed: Decimal = raw
                    .parse()
                    .map_err(|_| CoreError::InvalidAmount(raw.to_string()))?;
                let currency = map
                    .get("currency")
                    .and_then(Value::as_str)
                    .ok_or_else(|| CoreError::InvalidAmount(value.to_string()))?;
                let issuer = map.get("issuer").and_then(Value::as_str);
                Ok(Self {
                    value: parsed,
                    currency: CurrencySpec::from_parts(currency, issuer)?,
                })
            }
            other => Err(CoreError::InvalidAmount(other.to_string())),
        }
    }

    /// 수치 값을 반환합니다 (네이티브는 drop 단위).
    pub fn value(&self) -> Decimal {
        self.value
    }

    /// 통화를 반환합니다.
    pub fn currency(&self) -> &CurrencySpec {
        &self.currency
    }

    /// 발행자를 반환합니다 (네이티브는 None).
    pub fn issuer(&self) -> Option<&AccountId> {
        self.currency.issuer()
    }

    /// 0인지 확인합니다.
    pub fn is_zero(&self) -> bool {
        self.value.is_zero()
    }

    /// 음수인지 확인합니다.
    pub fn is_negative(&self) -> bool {
        self.value < Decimal::ZERO
    }

    /// 네이티브 금액인지 확인합니다.
    pub fn is_native(&self) -> bool {
        self.currency.is_native()
    }

    /// 두 금액을 비교합니다. 통화 코드가 다르면 비교 불가(None)입니다.
    pub fn compare(&self, other: &Amount) -> Option<Ordering> {
        if self.currency.code() != other.currency.code() {
            return None;
        }
        self.value.partial_cmp(&other.value)
    }

    /// 같은 통화의 금액을 더합니다.
    pub fn checked_add(&self, other: &Amount) -> Result<Amount, CoreError> {
        self.ensure_same_currency(other)?;
        Ok(Amount {
            value: self.value + other.value,
            currency: self.currency.clone(),
        })
    }

    /// 같은 통화의 금액을 뺍니다.
    pub fn checked_sub(&self, other: &Amount) -> Result<Amount, CoreError> {
        self.ensure_same_currency(other)?;
        Ok(Amount {
            value: self.value - other.value,
            currency: self.currency.clone(),
        })
    }

    /// 무차원 비율을 곱합니다. 네이티브 결과는 정수 drop으로 절사됩니다.
    pub fn scaled(&self, ratio: Decimal) -> Amount {
        let mut value = self.value * ratio;
        if self.currency.is_native() {
            value = value.trunc();
        }
        Amount {
            value,
            currency: self.currency.clone(),
        }
    }

    /// 두 금액의 수치 비율을 반환합니다 (단위 무시).
    pub fn ratio(&self, other: &Amount) -> Result<Decimal, CoreError> {
        if other.value.is_zero() {
            return Err(CoreError::DivisionByZero);
        }
        Ok(self.value / other.value)
    }

    /// 정규화된 문자열 표현을 반환합니다.
    ///
    /// 네이티브는 drop 단위 정수, 발행 통화는 정규화된 소수 표기입니다.
    pub fn to_canonical_string(&self) -> String {
        self.value.normalize().to_string()
    }

    fn ensure_same_currency(&self, other: &Amount) -> Result<(), CoreError> {
        if self.currency.code() != other.currency.code() {
            return Err(CoreError::CurrencyMismatch {
                left: self.currency.to_string(),
                right: other.currency.to_string(),
            });
        }
        Ok(())
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.to_canonical_string(), self.currency)
    }
}

/// 전송 수수료율을 반영한 사용 가능 잔고를 계산합니다.
///
/// 발행 통화 잔고는 `default_rate / issuer_rate` 비율로 축소됩니다.
/// 수수료가 없는 발행자(기본율)는 잔고를 그대로 반환합니다.
pub fn apply_transfer_rate(balance: Decimal, issuer_rate: u32) -> Decimal {
    if issuer_rate == DEFAULT_TRANSFER_RATE {
        return balance;
    }
    balance * Decimal::from(DEFAULT_TRANSFER_RATE) / Decimal::from(issuer_rate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    const ISSUER: &str = "rrrrrrrrrrrrrrrrrrrrrhoLvTp";

    fn usd(value: Decimal) -> Amount {
        Amount::issued(
            value,
            CurrencySpec::from_parts("USD", Some(ISSUER)).unwrap(),
        )
    }

    #[test]
    fn test_parse_native() {
        let amount = Amount::parse(&json!("1000000")).unwrap();
        assert!(amount.is_native());
        assert_eq!(amount.value(), dec!(1000000));
        assert_eq!(amount.to_canonical_string(), "1000000");

        // drop은 정수여야 함
        assert!(Amount::parse(&json!("1.5")).is_err());
    }

    #[test]
    fn test_parse_issued() {
        let amount = Amount::parse(&json!({
            "value": "10.25",
            "currency": "USD",
            "issuer": ISSUER,
        }))
        .unwrap();
        assert!(!amount.is_native());
        assert_eq!(amount.value(), dec!(10.25));
        assert_eq!(amount.issuer().unwrap().as_str(), ISSUER);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(Amount::parse(&json!(42)).is_err());
        assert!(Amount::parse(&json!({"currency": "USD"})).is_err());
    }

    #[test]
    fn test_compare_incomparable() {
        let xrp = Amount::drops(dec!(100));
        assert_eq!(usd(dec!(1)).compare(&xrp), None);
        assert_eq!(
            usd(dec!(2)).compare(&usd(dec!(1))),
            Some(Ordering::Greater)
        );
    }

    #[test]
    fn test_arithmetic() {
        let a = usd(dec!(3));
        let b = usd(dec!(1.5));
        assert_eq!(a.checked_add(&b).unwrap().value(), dec!(4.5));
        assert_eq!(a.checked_sub(&b).unwrap().value(), dec!(1.5));
        assert!(a.checked_add(&Amount::drops(dec!(1))).is_err());
    }

    #[test]
    fn test_scaled_truncates_native() {
        let drops = Amount::drops(dec!(7));
        assert_eq!(drops.scaled(dec!(0.5)).value(), dec!(3));

        let iou = usd(dec!(7));
        assert_eq!(iou.scaled(dec!(0.5)).value(), dec!(3.5));
    }

    #[test]
    fn test_transfer_rate_adjustment() {
        // 기본율은 무변환
        assert_eq!(apply_transfer_rate(dec!(100), DEFAULT_TRANSFER_RATE), dec!(100));
        // 0.2% 수수료 (1002000000)는 잔고를 축소
        let adjusted = apply_transfer_rate(dec!(100.2), 1_002_000_000);
        assert_eq!(adjusted, dec!(100));
    }

    #[test]
    fn test_canonical_string_normalizes() {
        assert_eq!(usd(dec!(1.500)).to_canonical_string(), "1.5");
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn prop_add_sub_roundtrip(a in -1_000_000i64..1_000_000, b in -1_000_000i64..1_000_000) {
                let x = usd(Decimal::from(a));
                let y = usd(Decimal::from(b));
                let sum = x.checked_add(&y).unwrap();
                prop_assert_eq!(sum.checked_sub(&y).unwrap().value(), x.value());
            }

            #[test]
            fn prop_native_scaled_stays_whole(drops in 0i64..10_000_000, num in 1u32..1000, den in 1u32..1000) {
                let ratio = Decimal::from(num) / Decimal::from(den);
                let scaled = Amount::drops(Decimal::from(drops)).scaled(ratio);
                prop_assert_eq!(scaled.value().fract(), Decimal::ZERO);
            }

            #[test]
            fn prop_transfer_rate_never_inflates(balance in 0i64..1_000_000, fee in 0u32..500_000_000) {
                let rate = DEFAULT_TRANSFER_RATE + fee;
                let adjusted = apply_transfer_rate(Decimal::from(balance), rate);
                prop_assert!(adjusted <= Decimal::from(balance));
                prop_assert!(adjusted >= Decimal::ZERO);
            }
        }
    }
}
