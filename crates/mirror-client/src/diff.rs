//! 트랜잭션 메타데이터의 정규화된 원장 변경 뷰.
//!
//! 검증된 트랜잭션의 메타데이터는 영향을 받은 원장 엔트리들의
//! 생성/수정/삭제 목록을 담고 있습니다. 이 모듈은 그 목록을
//! [`LedgerDiff`]로 해석하고, 영향 계정/오더북 추출과 잔고 변화
//! 계산을 제공합니다. 순수 해석 계층이며 I/O가 없습니다.

use crate::error::{ClientError, ClientResult};
use mirror_core::{AccountId, Amount, BookId, CurrencySpec};
use rust_decimal::Decimal;
use serde_json::{Map, Value};
use std::collections::HashSet;

/// 발행자 계정이 안에 들어 있는 금액/한도 필드.
const ISSUER_FIELDS: [&str; 4] = ["LowLimit", "HighLimit", "TakerPays", "TakerGets"];

/// 원장 엔트리에 가해진 변경의 종류.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffType {
    Created,
    Modified,
    Deleted,
}

/// 원장 엔트리 하나에 대한 변경.
#[derive(Debug, Clone)]
pub struct DiffNode {
    pub diff_type: DiffType,
    /// 엔트리 종류 (AccountRoot, Offer, RippleState, ...)
    pub entry_type: String,
    /// 원장 내 엔트리 식별자
    pub ledger_index: String,
    /// 변경 전 필드 값 (수정/삭제 시 변경된 필드만)
    pub fields_prev: Map<String, Value>,
    /// 생성 시의 필드 값
    pub fields_new: Map<String, Value>,
    /// 변경 후 필드 값
    pub fields_final: Map<String, Value>,
}

impl DiffNode {
    /// 모든 필드의 병합 뷰를 반환합니다 (prev < new < final 순으로 덮어씀).
    pub fn fields(&self) -> Map<String, Value> {
        let mut merged = self.fields_prev.clone();
        for (k, v) in &self.fields_new {
            merged.insert(k.clone(), v.clone());
        }
        for (k, v) in &self.fields_final {
            merged.insert(k.clone(), v.clone());
        }
        merged
    }

    /// 엔트리의 현재(변경 적용 후) 필드 집합을 반환합니다.
    ///
    /// 생성 노드는 NewFields, 나머지는 FinalFields입니다.
    pub fn source_fields(&self) -> &Map<String, Value> {
        match self.diff_type {
            DiffType::Created => &self.fields_new,
            _ => &self.fields_final,
        }
    }

    /// 엔트리의 소유 계정을 반환합니다.
    pub fn account(&self) -> Option<AccountId> {
        let fields = self.fields();
        fields
            .get("Account")
            .and_then(Value::as_str)
            .and_then(|s| AccountId::parse(s).ok())
    }

    /// Offer 엔트리가 속한 오더북 키를 반환합니다.
    pub fn offer_book(&self) -> Option<BookId> {
        if self.entry_type != "Offer" {
            return None;
        }
        let fields = self.fields();
        let gets = currency_of(fields.get("TakerGets")?)?;
        let pays = currency_of(fields.get("TakerPays")?)?;
        Some(BookId::new(gets, pays))
    }
}

/// 금액 값(문자열 또는 객체)의 통화를 추출합니다.
fn currency_of(value: &Value) -> Option<CurrencySpec> {
    match value {
        Value::String(_) => Some(CurrencySpec::Xrp),
        Value::Object(map) => {
            let currency = map.get("currency").and_then(Value::as_str)?;
            let issuer = map.get("issuer").and_then(Value::as_str);
            CurrencySpec::from_parts(currency, issuer).ok()
        }
        _ => None,
    }
}

/// 한 트랜잭션의 계정/오더북 잔고 변화.
#[derive(Debug, Clone)]
pub struct BalanceChange {
    /// 잔고가 변한 계정
    pub account: AccountId,
    /// 부호 있는 변화량 (발행 통화는 상대 계정이 발행자)
    pub change: Amount,
}

/// 트랜잭션 메타데이터에서 해석한 원장 변경 전체.
#[derive(Debug, Clone, Default)]
pub struct LedgerDiff {
    pub nodes: Vec<DiffNode>,
}

impl LedgerDiff {
    /// 메타데이터의 AffectedNodes를 해석합니다.
    ///
    /// AffectedNodes가 없으면 에러입니다. 알 수 없는 태그의 노드는
    /// 건너뛰고, 아는 태그인데 형식이 깨진 노드는 에러입니다.
    pub fn parse(meta: &Value) -> ClientResult<Self> {
        let affected = meta
            .get("AffectedNodes")
            .and_then(Value::as_array)
            .ok_or_else(|| {
                ClientError::DiffParse("metadata missing AffectedNodes".to_string())
            })?;

        let mut nodes = Vec::with_capacity(affected.len());
        for entry in affected {
            let (diff_type, tag) = if entry.get("CreatedNode").is_some() {
                (DiffType::Created, "CreatedNode")
            } else if entry.get("ModifiedNode").is_some() {
                (DiffType::Modified, "ModifiedNode")
            } else if entry.get("DeletedNode").is_some() {
                (DiffType::Deleted, "DeletedNode")
            } else {
                // 미래의 노드 태그와의 호환을 위해 무시
                continue;
            };

            let body = entry[tag].as_object().ok_or_else(|| {
                ClientError::DiffParse(format!("{} is not an object", tag))
            })?;

            nodes.push(DiffNode {
                diff_type,
                entry_type: body
                    .get("LedgerEntryType")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                ledger_index: body
                    .get("LedgerIndex")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                fields_prev: object_field(body, "PreviousFields"),
                fields_new: object_field(body, "NewFields"),
                fields_final: object_field(body, "FinalFields"),
            });
        }

        Ok(Self { nodes })
    }

    /// 트랜잭션의 영향을 받았을 수 있는 계정 전체.
    ///
    /// 의도적으로 과포함(over-inclusive)입니다: 노드 필드 중 계정
    /// 식별자로 유효한 모든 문자열 값과, 금액/한도 객체 안의 발행자
    /// 계정을 모읍니다. 누락보다 과잉 통지가 안전합니다.
    pub fn affected_accounts(&self) -> HashSet<AccountId> {
        let mut accounts = HashSet::new();
        for node in &self.nodes {
            for (key, value) in node.source_fields() {
                match value {
                    Value::String(s) => {
                        if let Ok(account) = AccountId::parse(s) {
                            accounts.insert(account);
                        }
                    }
                    Value::Object(map) if ISSUER_FIELDS.contains(&key.as_str()) => {
                        if let Some(issuer) = map.get("issuer").and_then(Value::as_str) {
                            if let Ok(account) = AccountId::parse(issuer) {
                                accounts.insert(account);
                            }
                        }
                    }
                    _ => {}
                }
            }
        }
        accounts
    }

    /// 트랜잭션이 건드린 오더북 전체.
    pub fn affected_books(&self) -> HashSet<BookId> {
        self.nodes
            .iter()
            .filter_map(DiffNode::offer_book)
            .collect()
    }

    /// 이 책에 속한 Offer 노드들을 순서대로 반환합니다.
    pub fn offer_nodes(&self, book: &BookId) -> Vec<&DiffNode> {
        self.nodes
            .iter()
            .filter(|node| node.offer_book().as_ref() == Some(book))
            .collect()
    }

    /// 계정별 잔고 변화를 계산합니다.
    ///
    /// AccountRoot 노드에서 네이티브 잔고 변화를, RippleState 노드에서
    /// 신뢰선 양쪽의 발행 통화 잔고 변화를 추출합니다. 변화가 없는
    /// 노드는 생략됩니다.
    pub fn balance_changes(&self) -> Vec<BalanceChange> {
        let mut changes = Vec::new();
        for node in &self.nodes {
            match node.entry_type.as_str() {
                "AccountRoot" => {
                    if let Some(change) = native_balance_change(node) {
                        changes.push(change);
                    }
                }
                "RippleState" => {
                    changes.extend(trust_line_balance_changes(node));
                }
                _ => {}
            }
        }
        changes
    }
}

fn object_field(body: &Map<String, Value>, key: &str) -> Map<String, Value> {
    body.get(key)
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default()
}

fn decimal_str(value: Option<&Value>) -> Option<Decimal> {
    value.and_then(Value::as_str).and_then(|s| s.parse().ok())
}

fn native_balance_change(node: &DiffNode) -> Option<BalanceChange> {
    let account = node.account()?;
    let (before, after) = match node.diff_type {
        DiffType::Created => (
            Decimal::ZERO,
            decimal_str(node.fields_new.get("Balance"))?,
        ),
        _ => {
            // PreviousFields에 Balance가 없으면 잔고는 변하지 않음
            let before = decimal_str(node.fields_prev.get("Balance"))?;
            let after = decimal_str(node.fields_final.get("Balance")).unwrap_or(Decimal::ZERO);
            (before, after)
        }
    };
    let delta = after - before;
    if delta.is_zero() {
        return None;
    }
    Some(BalanceChange {
        account,
        change: Amount::drops(delta),
    })
}

/// 신뢰선 잔고 변화를 양쪽 계정의 관점으로 반환합니다.
///
/// 신뢰선 잔고는 low 계정 관점의 부호를 가집니다. low 계정에는
/// 변화량 그대로(발행자 = high), high 계정에는 부호를 뒤집어
/// (발행자 = low) 기록합니다.
fn trust_line_balance_changes(node: &DiffNode) -> Vec<BalanceChange> {
    let fields = node.fields();

    let balance_obj = |map: &Map<String, Value>| -> Option<(Decimal, String)> {
        let balance = map.get("Balance")?.as_object()?;
        let value: Decimal = balance.get("value")?.as_str()?.parse().ok()?;
        let currency = balance.get("currency")?.as_str()?.to_string();
        Some((value, currency))
    };

    let (before, after, currency) = match node.diff_type {
        DiffType::Created => match balance_obj(&node.fields_new) {
            Some((after, currency)) => (Decimal::ZERO, after, currency),
            None => return Vec::new(),
        },
        _ => {
            let Some((before, currency)) = balance_obj(&node.fields_prev) else {
                return Vec::new();
            };
            let after = balance_obj(&node.fields_final)
                .map(|(v, _)| v)
                .unwrap_or(Decimal::ZERO);
            (before, after, currency)
        }
    };

    let delta = after - before;
    if delta.is_zero() {
        return Vec::new();
    }

    let limit_issuer = |key: &str| -> Option<AccountId> {
        fields
            .get(key)?
            .as_object()?
            .get("issuer")?
            .as_str()
            .and_then(|s| AccountId::parse(s).ok())
    };
    let (Some(low), Some(high)) = (limit_issuer("LowLimit"), limit_issuer("HighLimit")) else {
        return Vec::new();
    };

    vec![
        BalanceChange {
            account: low.clone(),
            change: Amount::issued(delta, CurrencySpec::issued(currency.clone(), high.clone())),
        },
        BalanceChange {
            account: high,
            change: Amount::issued(-delta, CurrencySpec::issued(currency, low)),
        },
    ]
}
