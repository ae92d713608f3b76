//! 목 전송 계층으로 세션/서버셋/미러를 통합 검증합니다.
//!
//! 네트워크 없이 채널 기반 `Connector`를 주입하고, 테스트가 서버
//! 역할(핸드셰이크 응답, 조회 응답, 스트림 메시지)을 수행합니다.

use async_trait::async_trait;
use mirror_client::{
    BookEvent, ClientError, ClientResult, ConnectionState, Connector, Offer, RawEvent, ServerSet,
    Transport,
};
use mirror_core::{ConnectionConfig, CurrencySpec};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

const OWNER1: &str = "rrrrrrrrrrrrrrrrrrrrrhoLvTp";
const OWNER2: &str = "rrrrrrrrrrrrrrrrrrrrBZbvji";
const OWNER3: &str = "rrrrrrrrrrrrrrrrrrrrrhoLvT1";
const ISSUER: &str = "rvYAfWj5gh67oV6fW32ZzP3Aw4Eubs59B";

async fn within<T>(fut: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), fut)
        .await
        .expect("future timed out")
}

// ---------------------------------------------------------------------------
// 목 전송
// ---------------------------------------------------------------------------

struct MockConnection {
    endpoint: String,
    /// 클라이언트가 보낸 프레임
    outbound: mpsc::UnboundedReceiver<String>,
    /// 클라이언트로 보낼 프레임 (Err은 소켓 오류로 전달됨)
    inbound: mpsc::UnboundedSender<Result<String, String>>,
}

struct MockConnector {
    announce: mpsc::UnboundedSender<MockConnection>,
}

impl MockConnector {
    fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<MockConnection>) {
        let (announce, connections) = mpsc::unbounded_channel();
        (Arc::new(Self { announce }), connections)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, endpoint: &str) -> ClientResult<Box<dyn Transport>> {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        self.announce
            .send(MockConnection {
                endpoint: endpoint.to_string(),
                outbound: out_rx,
                inbound: in_tx,
            })
            .map_err(|_| ClientError::Transport("mock listener gone".to_string()))?;
        Ok(Box::new(MockTransport {
            out: out_tx,
            incoming: in_rx,
        }))
    }
}

struct MockTransport {
    out: mpsc::UnboundedSender<String>,
    incoming: mpsc::UnboundedReceiver<Result<String, String>>,
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&mut self, text: String) -> ClientResult<()> {
        self.out
            .send(text)
            .map_err(|_| ClientError::Transport("mock connection closed".to_string()))
    }

    async fn recv(&mut self) -> Option<ClientResult<String>> {
        self.incoming
            .recv()
            .await
            .map(|frame| frame.map_err(ClientError::Transport))
    }

    async fn close(&mut self) {
        self.incoming.close();
    }
}

// ---------------------------------------------------------------------------
// 서버 역할 자동 응답기
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ServerScript {
    /// book_offers 응답 엔트리
    offers: Mutex<Vec<Value>>,
    /// account_lines 잔고 (계정 → USD 잔고)
    lines: Mutex<HashMap<String, String>>,
    /// 설정되어 있으면 다음 account_lines 응답을 신호까지 보류
    line_gate: Mutex<Option<tokio::sync::oneshot::Receiver<()>>>,
    /// 수신한 요청 로그
    requests: Mutex<Vec<Value>>,
}

impl ServerScript {
    fn requests_with_command(&self, command: &str) -> Vec<Value> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r["command"].as_str() == Some(command))
            .cloned()
            .collect()
    }
}

/// 알려진 명령에 성공 응답을 돌려주는 서버 태스크.
fn serve(mut conn: MockConnection, script: Arc<ServerScript>) {
    tokio::spawn(async move {
        while let Some(frame) = conn.outbound.recv().await {
            let request: Value = serde_json::from_str(&frame).unwrap();
            script.requests.lock().unwrap().push(request.clone());

            let command = request["command"].as_str().unwrap_or("");
            let result = match command {
                "subscribe" | "unsubscribe" => {
                    json!({ "server_status": "full", "ledger_index": 1000 })
                }
                "account_info" => {
                    let account = request["account"].as_str().unwrap_or("");
                    json!({ "account_data": { "Account": account, "Balance": "100000000" } })
                }
                "account_lines" => {
                    let gate = script.line_gate.lock().unwrap().take();
                    if let Some(gate) = gate {
                        let _ = gate.await;
                    }
                    let account = request["account"].as_str().unwrap_or("");
                    let balance = script
                        .lines
                        .lock()
                        .unwrap()
                        .get(account)
                        .cloned()
                        .unwrap_or_else(|| "0".to_string());
                    json!({ "lines": [ { "currency": "USD", "balance": balance } ] })
                }
                "book_offers" => json!({ "offers": script.offers.lock().unwrap().clone() }),
                _ => json!({}),
            };

            let response = json!({
                "type": "response",
                "id": request["id"],
                "status": "success",
                "result": result,
            });
            if conn.inbound.send(Ok(response.to_string())).is_err() {
                return;
            }
        }
    });
}

async fn wait_for_state(set: &ServerSet, target: ConnectionState) {
    let mut watch = set.state_watch();
    within(async {
        loop {
            if *watch.borrow_and_update() == target {
                return;
            }
            watch.changed().await.unwrap();
        }
    })
    .await;
}

/// 목 서버 하나를 온라인 상태로 구성합니다.
async fn online_set() -> (
    ServerSet,
    Arc<ServerScript>,
    mpsc::UnboundedSender<Result<String, String>>,
    mpsc::UnboundedReceiver<MockConnection>,
) {
    let (connector, mut connections) = MockConnector::new();
    let set = ServerSet::new(connector, ConnectionConfig::default());
    set.add_server("ws://mock-one", true);
    set.connect();

    let conn = within(connections.recv()).await.unwrap();
    assert_eq!(conn.endpoint, "ws://mock-one");
    let stream = conn.inbound.clone();
    let script = Arc::new(ServerScript::default());
    serve(conn, script.clone());

    wait_for_state(&set, ConnectionState::Online).await;
    (set, script, stream, connections)
}

fn snapshot_offer(
    index: &str,
    account: &str,
    gets_value: &str,
    pays_drops: &str,
    owner_funds: Option<&str>,
) -> Value {
    let mut offer = json!({
        "index": index,
        "Account": account,
        "Sequence": 1,
        "Flags": 0,
        "TakerGets": { "value": gets_value, "currency": "USD", "issuer": ISSUER },
        "TakerPays": pays_drops,
    });
    if let Some(funds) = owner_funds {
        offer["owner_funds"] = json!(funds);
    }
    offer
}

fn validated_tx(hash: &str, tx_type: &str, nodes: Value) -> Value {
    json!({
        "type": "transaction",
        "validated": true,
        "transaction": { "TransactionType": tx_type, "hash": hash },
        "meta": { "AffectedNodes": nodes },
    })
}

async fn next_model(events: &mut broadcast::Receiver<BookEvent>) -> Vec<Offer> {
    within(async {
        loop {
            if let BookEvent::Model(offers) = events.recv().await.unwrap() {
                return offers;
            }
        }
    })
    .await
}

fn usd_book(set: &ServerSet) -> mirror_client::OrderBookMirror {
    let issuer = mirror_core::AccountId::parse(ISSUER).unwrap();
    set.order_book(CurrencySpec::issued("USD", issuer), CurrencySpec::Xrp)
        .unwrap()
}

// ---------------------------------------------------------------------------
// 세션/서버셋
// ---------------------------------------------------------------------------

#[tokio::test]
async fn request_roundtrip() {
    let (set, _script, _stream, _connections) = online_set().await;
    let result = within(set.request("ping", json!({}))).await.unwrap();
    assert_eq!(result, json!({}));
}

#[tokio::test]
async fn request_without_servers_fails_fast() {
    let (connector, _connections) = MockConnector::new();
    let set = ServerSet::new(connector, ConnectionConfig::default());
    let error = set.request("ping", json!({})).await.unwrap_err();
    assert!(matches!(error, ClientError::NoServersAvailable));
}

#[tokio::test]
async fn request_waits_for_online_transition() {
    let (connector, mut connections) = MockConnector::new();
    let set = ServerSet::new(connector, ConnectionConfig::default());
    set.add_server("ws://mock-one", true);

    // 아직 연결 전: 요청은 온라인 전환까지 대기해야 함
    let pending = tokio::spawn({
        let set = set.clone();
        async move { set.request("ping", json!({})).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!pending.is_finished());

    set.connect();
    let conn = within(connections.recv()).await.unwrap();
    serve(conn, Arc::new(ServerScript::default()));

    let result = within(pending).await.unwrap().unwrap();
    assert_eq!(result, json!({}));
}

#[tokio::test]
async fn handshake_resubscribes_after_reconnect() {
    let (set, script, stream, mut connections) = online_set().await;
    assert_eq!(script.requests_with_command("subscribe").len(), 1);

    // 소켓 오류 주입 → 세션이 재연결하고 핸드셰이크를 다시 보냄
    stream.send(Err("connection reset".to_string())).unwrap();
    wait_for_state(&set, ConnectionState::Offline).await;

    let conn = within(connections.recv()).await.unwrap();
    let script2 = Arc::new(ServerScript::default());
    serve(conn, script2.clone());
    wait_for_state(&set, ConnectionState::Online).await;

    let handshakes = script2.requests_with_command("subscribe");
    assert_eq!(handshakes.len(), 1);
    let streams = handshakes[0]["streams"].as_array().unwrap();
    assert!(streams.contains(&json!("ledger")));
    assert!(streams.contains(&json!("server")));
}

#[tokio::test]
async fn duplicate_transactions_are_deduped() {
    let (set, _script, stream, _connections) = online_set().await;
    let mut raw = set.raw_events();

    let tx = validated_tx(
        "HASH-DUP",
        "Payment",
        json!([{
            "ModifiedNode": {
                "LedgerEntryType": "AccountRoot",
                "LedgerIndex": "A1",
                "PreviousFields": { "Balance": "2000000" },
                "FinalFields": { "Account": OWNER1, "Balance": "1000000" }
            }
        }]),
    );

    // 같은 해시를 두 번 전달 (두 서버가 같은 트랜잭션을 알리는 상황)
    stream.send(Ok(tx.to_string())).unwrap();
    stream.send(Ok(tx.to_string())).unwrap();
    stream
        .send(Ok(json!({
            "type": "ledgerClosed",
            "ledger_index": 2000,
            "ledger_hash": "LH"
        })
        .to_string()))
        .unwrap();

    let first = within(raw.recv()).await.unwrap();
    assert!(matches!(first, RawEvent::Transaction(_)));
    // 두 번째 복사본은 건너뛰어지고 바로 원장 마감이 따라옴
    let second = within(raw.recv()).await.unwrap();
    assert!(matches!(second, RawEvent::LedgerClosed(_)));
    assert_eq!(set.ledger_index(), Some(2000));
}

#[tokio::test]
async fn stale_ledger_close_is_ignored() {
    let (set, _script, stream, _connections) = online_set().await;
    let mut raw = set.raw_events();

    for index in [2000, 1500, 2500] {
        stream
            .send(Ok(json!({ "type": "ledgerClosed", "ledger_index": index }).to_string()))
            .unwrap();
    }

    // 1500은 이미 관측한 2000보다 과거이므로 전달되지 않음
    let indexes: Vec<u64> = [within(raw.recv()).await, within(raw.recv()).await]
        .into_iter()
        .map(|event| match event.unwrap() {
            RawEvent::LedgerClosed(message) => message["ledger_index"].as_u64().unwrap(),
            other => panic!("unexpected event: {:?}", other),
        })
        .collect();
    assert_eq!(indexes, vec![2000, 2500]);
    assert_eq!(set.ledger_index(), Some(2500));
}

#[tokio::test]
async fn unvalidated_transactions_are_skipped() {
    let (set, _script, stream, _connections) = online_set().await;
    let mut raw = set.raw_events();

    let mut tx = validated_tx("HASH-UNVAL", "Payment", json!([]));
    tx["validated"] = json!(false);
    stream.send(Ok(tx.to_string())).unwrap();
    stream
        .send(Ok(json!({ "type": "ledgerClosed", "ledger_index": 2001 }).to_string()))
        .unwrap();

    // 미검증 트랜잭션은 전달되지 않음
    let event = within(raw.recv()).await.unwrap();
    assert!(matches!(event, RawEvent::LedgerClosed(_)));
}

#[tokio::test]
async fn malformed_metadata_reports_diff_error() {
    let (set, _script, stream, _connections) = online_set().await;
    let mut raw = set.raw_events();

    let tx = json!({
        "type": "transaction",
        "validated": true,
        "transaction": { "TransactionType": "Payment", "hash": "HASH-BAD" },
        "meta": {},
    });
    stream.send(Ok(tx.to_string())).unwrap();

    let event = within(raw.recv()).await.unwrap();
    match event {
        RawEvent::DiffError { hash, .. } => assert_eq!(hash, "HASH-BAD"),
        other => panic!("unexpected event: {:?}", other),
    }
}

// ---------------------------------------------------------------------------
// 오더북 미러
// ---------------------------------------------------------------------------

/// 스냅샷 2건을 가진 표준 시나리오: OFFER1(가격 0.5, 부분 체결 가능),
/// OFFER2(가격 0.6, 완전 체결 가능).
fn seed_snapshot(script: &ServerScript) {
    *script.offers.lock().unwrap() = vec![
        snapshot_offer("OFFER1", OWNER1, "10", "5000000", Some("8")),
        snapshot_offer("OFFER2", OWNER2, "10", "6000000", Some("100")),
    ];
}

#[tokio::test]
async fn bootstrap_builds_sorted_funded_snapshot() {
    let (set, script, _stream, _connections) = online_set().await;
    seed_snapshot(&script);

    let mirror = usd_book(&set);
    let (count, mut events) = mirror.attach();
    assert_eq!(count, 1);

    let offers = next_model(&mut events).await;
    assert_eq!(offers.len(), 2);
    // 가격 오름차순
    assert_eq!(offers[0].index, "OFFER1");
    assert_eq!(offers[1].index, "OFFER2");
    assert!(offers[0].quality < offers[1].quality);

    // OWNER1은 잔고 8 < 명목 10: 부분 체결 가능
    assert!(!offers[0].is_fully_funded);
    assert_eq!(offers[0].taker_gets_funded.value(), dec!(8));
    assert_eq!(offers[0].taker_pays_funded.value(), dec!(4000000));
    // OWNER2는 완전 체결 가능
    assert!(offers[1].is_fully_funded);
    assert_eq!(offers[1].taker_gets_funded.value(), dec!(10));

    // get_offers는 동기화된 캐시를 바로 반환
    let cached = within(mirror.get_offers()).await.unwrap();
    assert_eq!(cached.len(), 2);

    // 수수료율 조회와 transactions 구독이 수행됨
    assert_eq!(script.requests_with_command("account_info").len(), 1);
    assert!(!script.requests_with_command("subscribe").is_empty());
}

#[tokio::test]
async fn created_offer_inserted_in_quality_order() {
    let (set, script, stream, _connections) = online_set().await;
    seed_snapshot(&script);

    let mirror = usd_book(&set);
    let (_, mut events) = mirror.attach();
    next_model(&mut events).await;

    // OWNER3의 새 오퍼: 가격 0.2 → 맨 앞에 삽입
    let mut tx = validated_tx(
        "HASH-CREATE",
        "OfferCreate",
        json!([{
            "CreatedNode": {
                "LedgerEntryType": "Offer",
                "LedgerIndex": "OFFER3",
                "NewFields": {
                    "Account": OWNER3,
                    "Sequence": 7,
                    "TakerGets": { "value": "5", "currency": "USD", "issuer": ISSUER },
                    "TakerPays": "1000000"
                }
            }
        }]),
    );
    // 잔고 힌트가 있으면 조회 없이 사용
    tx["transaction"]["owner_funds"] = json!("50");
    stream.send(Ok(tx.to_string())).unwrap();

    let added = within(async {
        loop {
            if let BookEvent::OfferAdded(offer) = events.recv().await.unwrap() {
                return offer;
            }
        }
    })
    .await;
    assert_eq!(added.index, "OFFER3");
    assert!(added.is_fully_funded);

    let model = next_model(&mut events).await;
    let indexes: Vec<&str> = model.iter().map(|o| o.index.as_str()).collect();
    assert_eq!(indexes, vec!["OFFER3", "OFFER1", "OFFER2"]);
}

#[tokio::test]
async fn consumed_offer_emits_trade_and_removal() {
    let (set, script, stream, _connections) = online_set().await;
    seed_snapshot(&script);

    let mirror = usd_book(&set);
    let (_, mut events) = mirror.attach();
    next_model(&mut events).await;

    // OFFER2가 전량 체결되어 삭제됨
    let tx = validated_tx(
        "HASH-TAKE",
        "OfferCreate",
        json!([{
            "DeletedNode": {
                "LedgerEntryType": "Offer",
                "LedgerIndex": "OFFER2",
                "PreviousFields": {
                    "TakerGets": { "value": "10", "currency": "USD", "issuer": ISSUER },
                    "TakerPays": "6000000"
                },
                "FinalFields": {
                    "Account": OWNER2,
                    "Sequence": 1,
                    "TakerGets": { "value": "0", "currency": "USD", "issuer": ISSUER },
                    "TakerPays": "0"
                }
            }
        }]),
    );
    stream.send(Ok(tx.to_string())).unwrap();

    let removed = within(async {
        loop {
            if let BookEvent::OfferRemoved(offer) = events.recv().await.unwrap() {
                return offer;
            }
        }
    })
    .await;
    assert_eq!(removed.index, "OFFER2");

    let trade = within(async {
        loop {
            if let BookEvent::Trade { gets, pays } = events.recv().await.unwrap() {
                return (gets, pays);
            }
        }
    })
    .await;
    // 삭제 전 금액 전체가 소비량
    assert_eq!(trade.0.value(), dec!(10));
    assert_eq!(trade.1.value(), dec!(6000000));

    let model = next_model(&mut events).await;
    assert_eq!(model.len(), 1);
    assert_eq!(model[0].index, "OFFER1");
}

#[tokio::test]
async fn cancelled_offer_is_removed_without_trade() {
    let (set, script, stream, _connections) = online_set().await;
    seed_snapshot(&script);

    let mirror = usd_book(&set);
    let (_, mut events) = mirror.attach();
    next_model(&mut events).await;

    let tx = validated_tx(
        "HASH-CANCEL",
        "OfferCancel",
        json!([{
            "DeletedNode": {
                "LedgerEntryType": "Offer",
                "LedgerIndex": "OFFER1",
                "FinalFields": {
                    "Account": OWNER1,
                    "Sequence": 1,
                    "TakerGets": { "value": "10", "currency": "USD", "issuer": ISSUER },
                    "TakerPays": "5000000"
                }
            }
        }]),
    );
    stream.send(Ok(tx.to_string())).unwrap();

    // OfferRemoved 후 Trade 없이 Model이 와야 함
    let mut saw_removed = false;
    within(async {
        loop {
            match events.recv().await.unwrap() {
                BookEvent::OfferRemoved(offer) => {
                    assert_eq!(offer.index, "OFFER1");
                    saw_removed = true;
                }
                BookEvent::Trade { .. } => panic!("cancel must not produce a trade"),
                BookEvent::Model(model) => {
                    assert_eq!(model.len(), 1);
                    return;
                }
                _ => {}
            }
        }
    })
    .await;
    assert!(saw_removed);
}

#[tokio::test]
async fn partial_consumption_updates_amounts() {
    let (set, script, stream, _connections) = online_set().await;
    seed_snapshot(&script);

    let mirror = usd_book(&set);
    let (_, mut events) = mirror.attach();
    next_model(&mut events).await;

    // OFFER2가 절반 체결됨
    let tx = validated_tx(
        "HASH-PARTIAL",
        "OfferCreate",
        json!([{
            "ModifiedNode": {
                "LedgerEntryType": "Offer",
                "LedgerIndex": "OFFER2",
                "PreviousFields": {
                    "TakerGets": { "value": "10", "currency": "USD", "issuer": ISSUER },
                    "TakerPays": "6000000"
                },
                "FinalFields": {
                    "Account": OWNER2,
                    "Sequence": 1,
                    "Flags": 131072,
                    "TakerGets": { "value": "5", "currency": "USD", "issuer": ISSUER },
                    "TakerPays": "3000000"
                }
            }
        }]),
    );
    stream.send(Ok(tx.to_string())).unwrap();

    let trade = within(async {
        loop {
            if let BookEvent::Trade { gets, pays } = events.recv().await.unwrap() {
                return (gets, pays);
            }
        }
    })
    .await;
    assert_eq!(trade.0.value(), dec!(5));
    assert_eq!(trade.1.value(), dec!(3000000));

    let model = next_model(&mut events).await;
    let offer2 = model.iter().find(|o| o.index == "OFFER2").unwrap();
    assert_eq!(offer2.taker_gets.value(), dec!(5));
    // 부분 체결은 가격을 바꾸지 않음
    assert_eq!(offer2.quality, dec!(600000));
    // 최종 필드 전체가 덮어써짐 (금액 외의 필드 포함)
    assert_eq!(offer2.flags, 131072);
}

#[tokio::test]
async fn owner_funds_spread_across_offers_in_quality_order() {
    let (set, script, stream, _connections) = online_set().await;
    // 같은 소유자의 오퍼 둘, 잔고 8: 명목 합계 20이 잔고를 초과
    *script.offers.lock().unwrap() = vec![
        snapshot_offer("GOOD", OWNER1, "10", "5000000", Some("8")),
        snapshot_offer("WORSE", OWNER1, "10", "7000000", None),
    ];

    let mirror = usd_book(&set);
    let (_, mut events) = mirror.attach();
    let offers = next_model(&mut events).await;
    assert_eq!(offers.len(), 2);

    let good = offers.iter().find(|o| o.index == "GOOD").unwrap();
    let worse = offers.iter().find(|o| o.index == "WORSE").unwrap();
    // 좋은 가격의 오퍼가 잔고 8을 먼저 차지하고 나머지는 0
    assert_eq!(good.taker_gets_funded.value(), dec!(8));
    assert!(!good.is_fully_funded);
    assert!(worse.taker_gets_funded.is_zero());
    assert!(!worse.is_fully_funded);
    // owner_funds에는 양쪽 모두 소유자 잔고 전체가 실림
    assert_eq!(good.owner_funds, Some(dec!(8)));
    assert_eq!(worse.owner_funds, Some(dec!(8)));

    // GOOD이 취소되면 잡고 있던 몫이 WORSE로 풀림
    let cancel = validated_tx(
        "HASH-FREE",
        "OfferCancel",
        json!([{
            "DeletedNode": {
                "LedgerEntryType": "Offer",
                "LedgerIndex": "GOOD",
                "FinalFields": {
                    "Account": OWNER1,
                    "Sequence": 1,
                    "TakerGets": { "value": "10", "currency": "USD", "issuer": ISSUER },
                    "TakerPays": "5000000"
                }
            }
        }]),
    );
    stream.send(Ok(cancel.to_string())).unwrap();

    let (previous, current) = within(async {
        loop {
            if let BookEvent::OfferFundsChanged {
                previous_funds,
                current_funds,
                ..
            } = events.recv().await.unwrap()
            {
                return (previous_funds, current_funds);
            }
        }
    })
    .await;
    assert!(previous.is_zero());
    assert_eq!(current.value(), dec!(8));
}

#[tokio::test]
async fn slow_funds_resolution_preserves_transaction_order() {
    let (set, script, stream, _connections) = online_set().await;
    seed_snapshot(&script);
    script
        .lines
        .lock()
        .unwrap()
        .insert(OWNER3.to_string(), "2".to_string());

    let mirror = usd_book(&set);
    let (_, mut events) = mirror.attach();
    next_model(&mut events).await;

    // 다음 account_lines 응답을 게이트 뒤로 미룸
    let (release, gate) = tokio::sync::oneshot::channel();
    *script.line_gate.lock().unwrap() = Some(gate);

    // T1: 힌트 없는 생성 (잔고 조회가 게이트에 막힘)
    let t1 = validated_tx(
        "HASH-T1",
        "OfferCreate",
        json!([{
            "CreatedNode": {
                "LedgerEntryType": "Offer",
                "LedgerIndex": "OFFER5",
                "NewFields": {
                    "Account": OWNER3,
                    "Sequence": 11,
                    "TakerGets": { "value": "5", "currency": "USD", "issuer": ISSUER },
                    "TakerPays": "4000000"
                }
            }
        }]),
    );
    stream.send(Ok(t1.to_string())).unwrap();

    // T2: OFFER2 취소 (T1보다 먼저 알려지면 안 됨)
    let t2 = validated_tx(
        "HASH-T2",
        "OfferCancel",
        json!([{
            "DeletedNode": {
                "LedgerEntryType": "Offer",
                "LedgerIndex": "OFFER2",
                "FinalFields": {
                    "Account": OWNER2,
                    "Sequence": 1,
                    "TakerGets": { "value": "10", "currency": "USD", "issuer": ISSUER },
                    "TakerPays": "6000000"
                }
            }
        }]),
    );
    stream.send(Ok(t2.to_string())).unwrap();

    // T1이 잔고 조회에 막혀 있는 동안은 어떤 알림도 없어야 함
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(matches!(
        events.try_recv(),
        Err(broadcast::error::TryRecvError::Empty)
    ));

    release.send(()).unwrap();

    // 게이트가 풀리면 T1의 삽입이 먼저, T2의 삭제가 그 뒤에 옴
    within(async {
        loop {
            match events.recv().await.unwrap() {
                BookEvent::OfferAdded(offer) => {
                    assert_eq!(offer.index, "OFFER5");
                    return;
                }
                BookEvent::OfferRemoved(_) => {
                    panic!("later transaction must not overtake an earlier one")
                }
                _ => {}
            }
        }
    })
    .await;
    let removed = within(async {
        loop {
            if let BookEvent::OfferRemoved(offer) = events.recv().await.unwrap() {
                return offer;
            }
        }
    })
    .await;
    assert_eq!(removed.index, "OFFER2");
}

#[tokio::test]
async fn evicted_owner_balance_updates_are_ignored() {
    let (set, script, stream, _connections) = online_set().await;
    seed_snapshot(&script);

    let mirror = usd_book(&set);
    let (_, mut events) = mirror.attach();
    next_model(&mut events).await;

    // OWNER1의 유일한 오퍼를 취소: 잔고 캐시와 계정 구독이 내려감
    let cancel = validated_tx(
        "HASH-LAST",
        "OfferCancel",
        json!([{
            "DeletedNode": {
                "LedgerEntryType": "Offer",
                "LedgerIndex": "OFFER1",
                "FinalFields": {
                    "Account": OWNER1,
                    "Sequence": 1,
                    "TakerGets": { "value": "10", "currency": "USD", "issuer": ISSUER },
                    "TakerPays": "5000000"
                }
            }
        }]),
    );
    stream.send(Ok(cancel.to_string())).unwrap();
    within(async {
        loop {
            if let BookEvent::Transaction(_) = events.recv().await.unwrap() {
                return;
            }
        }
    })
    .await;

    // 이후 OWNER1의 잔고 변화는 어떤 알림도 만들지 않음
    let balance_tx = validated_tx(
        "HASH-GONE",
        "Payment",
        json!([{
            "ModifiedNode": {
                "LedgerEntryType": "RippleState",
                "LedgerIndex": "TL1",
                "PreviousFields": {
                    "Balance": { "value": "8", "currency": "USD", "issuer": "rrrrrrrrrrrrrrrrrrrrrhoLvT1" }
                },
                "FinalFields": {
                    "Balance": { "value": "3", "currency": "USD", "issuer": "rrrrrrrrrrrrrrrrrrrrrhoLvT1" },
                    "LowLimit": { "value": "0", "currency": "USD", "issuer": OWNER1 },
                    "HighLimit": { "value": "500", "currency": "USD", "issuer": ISSUER }
                }
            }
        }]),
    );
    stream.send(Ok(balance_tx.to_string())).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(matches!(
        events.try_recv(),
        Err(broadcast::error::TryRecvError::Empty)
    ));
}

#[tokio::test]
async fn balance_change_refreshes_funded_amounts() {
    let (set, script, stream, _connections) = online_set().await;
    seed_snapshot(&script);

    let mirror = usd_book(&set);
    let (_, mut events) = mirror.attach();
    next_model(&mut events).await;

    // OWNER1의 신뢰선 잔고가 8 → 3으로 감소 (오퍼 노드 없는 송금)
    let tx = validated_tx(
        "HASH-BALANCE",
        "Payment",
        json!([{
            "ModifiedNode": {
                "LedgerEntryType": "RippleState",
                "LedgerIndex": "TL1",
                "PreviousFields": {
                    "Balance": { "value": "8", "currency": "USD", "issuer": "rrrrrrrrrrrrrrrrrrrrrhoLvT1" }
                },
                "FinalFields": {
                    "Balance": { "value": "3", "currency": "USD", "issuer": "rrrrrrrrrrrrrrrrrrrrrhoLvT1" },
                    "LowLimit": { "value": "0", "currency": "USD", "issuer": OWNER1 },
                    "HighLimit": { "value": "500", "currency": "USD", "issuer": ISSUER }
                }
            }
        }]),
    );
    stream.send(Ok(tx.to_string())).unwrap();

    let (previous, current) = within(async {
        loop {
            if let BookEvent::OfferFundsChanged {
                previous_funds,
                current_funds,
                ..
            } = events.recv().await.unwrap()
            {
                return (previous_funds, current_funds);
            }
        }
    })
    .await;
    assert_eq!(previous.value(), dec!(8));
    assert_eq!(current.value(), dec!(3));

    // 오퍼 노드가 없는 트랜잭션이므로 모델은 새로 오지 않음: 캐시로 확인
    let offers = mirror.get_offers_sync();
    let offer1 = offers.iter().find(|o| o.index == "OFFER1").unwrap();
    assert_eq!(offer1.taker_gets_funded.value(), dec!(3));
    assert!(!offer1.is_fully_funded);
}

#[tokio::test]
async fn balance_only_transaction_emits_no_model() {
    let (set, script, stream, _connections) = online_set().await;
    seed_snapshot(&script);

    let mirror = usd_book(&set);
    let (_, mut events) = mirror.attach();
    next_model(&mut events).await;

    // RippleState만 건드리는 송금: 잔고 갱신 외의 알림은 없어야 함
    let balance_tx = validated_tx(
        "HASH-CHURN",
        "Payment",
        json!([{
            "ModifiedNode": {
                "LedgerEntryType": "RippleState",
                "LedgerIndex": "TL1",
                "PreviousFields": {
                    "Balance": { "value": "8", "currency": "USD", "issuer": "rrrrrrrrrrrrrrrrrrrrrhoLvT1" }
                },
                "FinalFields": {
                    "Balance": { "value": "3", "currency": "USD", "issuer": "rrrrrrrrrrrrrrrrrrrrrhoLvT1" },
                    "LowLimit": { "value": "0", "currency": "USD", "issuer": OWNER1 },
                    "HighLimit": { "value": "500", "currency": "USD", "issuer": ISSUER }
                }
            }
        }]),
    );
    stream.send(Ok(balance_tx.to_string())).unwrap();

    // 이어서 오퍼 노드가 있는 취소를 보냄
    let cancel = validated_tx(
        "HASH-AFTER",
        "OfferCancel",
        json!([{
            "DeletedNode": {
                "LedgerEntryType": "Offer",
                "LedgerIndex": "OFFER2",
                "FinalFields": {
                    "Account": OWNER2,
                    "Sequence": 1,
                    "TakerGets": { "value": "10", "currency": "USD", "issuer": ISSUER },
                    "TakerPays": "6000000"
                }
            }
        }]),
    );
    stream.send(Ok(cancel.to_string())).unwrap();

    // 취소의 OfferRemoved보다 먼저 모델/트랜잭션 알림이 끼어들면
    // 잔고 송금이 스냅샷을 퍼뜨린 것
    within(async {
        loop {
            match events.recv().await.unwrap() {
                BookEvent::Model(_) => panic!("balance churn must not emit a model"),
                BookEvent::Transaction(_) => panic!("balance churn must not emit a transaction"),
                BookEvent::OfferRemoved(offer) => {
                    assert_eq!(offer.index, "OFFER2");
                    return;
                }
                _ => {}
            }
        }
    })
    .await;
}

#[tokio::test]
async fn reconnect_resynchronizes_the_book() {
    let (set, script, stream, mut connections) = online_set().await;
    seed_snapshot(&script);

    let mirror = usd_book(&set);
    let (_, mut events) = mirror.attach();
    assert_eq!(next_model(&mut events).await.len(), 2);

    // 연결 끊김: 재연결 후 서버에는 오퍼가 하나만 남음
    stream.send(Err("connection reset".to_string())).unwrap();
    wait_for_state(&set, ConnectionState::Offline).await;

    let conn = within(connections.recv()).await.unwrap();
    let script2 = Arc::new(ServerScript::default());
    *script2.offers.lock().unwrap() =
        vec![snapshot_offer("OFFER9", OWNER2, "10", "7000000", Some("100"))];
    serve(conn, script2.clone());
    wait_for_state(&set, ConnectionState::Online).await;

    let model = within(async {
        loop {
            let model = next_model(&mut events).await;
            if model.len() == 1 {
                return model;
            }
        }
    })
    .await;
    assert_eq!(model[0].index, "OFFER9");
}

#[tokio::test]
async fn shared_mirror_and_refcounted_teardown() {
    let (set, script, _stream, _connections) = online_set().await;
    seed_snapshot(&script);

    let issuer = mirror_core::AccountId::parse(ISSUER).unwrap();
    let mirror_a = set
        .order_book(
            CurrencySpec::issued("USD", issuer.clone()),
            CurrencySpec::Xrp,
        )
        .unwrap();
    let mirror_b = set
        .order_book(CurrencySpec::issued("USD", issuer), CurrencySpec::Xrp)
        .unwrap();

    let (count_a, mut events_a) = mirror_a.attach();
    let (count_b, _events_b) = mirror_b.attach();
    assert_eq!(count_a, 1);
    // 같은 북의 핸들은 하나의 미러를 공유
    assert_eq!(count_b, 2);

    next_model(&mut events_a).await;
    assert_eq!(mirror_b.get_offers_sync().len(), 2);

    // 리스너가 남아 있는 동안에는 해제되지 않음
    assert_eq!(mirror_a.detach(), 1);
    assert_eq!(mirror_b.get_offers_sync().len(), 2);

    assert_eq!(mirror_b.detach(), 0);
    within(async {
        loop {
            if mirror_b.get_offers_sync().is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;

    // 해제 후 다시 붙으면 북 구독이 복구되고 재동기화됨
    let (count, mut events_c) = mirror_a.attach();
    assert_eq!(count, 1);
    assert_eq!(next_model(&mut events_c).await.len(), 2);
}

#[tokio::test]
async fn both_native_book_is_rejected() {
    let (set, _script, _stream, _connections) = online_set().await;
    assert!(set.order_book(CurrencySpec::Xrp, CurrencySpec::Xrp).is_err());
}

#[tokio::test]
async fn funded_resolution_uses_trust_line_when_no_hint() {
    let (set, script, stream, _connections) = online_set().await;
    seed_snapshot(&script);
    script
        .lines
        .lock()
        .unwrap()
        .insert(OWNER3.to_string(), "2".to_string());

    let mirror = usd_book(&set);
    let (_, mut events) = mirror.attach();
    next_model(&mut events).await;

    // 힌트 없는 생성: account_lines 조회가 잔고 2를 돌려줌
    let tx = validated_tx(
        "HASH-NOHINT",
        "OfferCreate",
        json!([{
            "CreatedNode": {
                "LedgerEntryType": "Offer",
                "LedgerIndex": "OFFER4",
                "NewFields": {
                    "Account": OWNER3,
                    "Sequence": 9,
                    "TakerGets": { "value": "5", "currency": "USD", "issuer": ISSUER },
                    "TakerPays": "4000000"
                }
            }
        }]),
    );
    stream.send(Ok(tx.to_string())).unwrap();

    let added = within(async {
        loop {
            if let BookEvent::OfferAdded(offer) = events.recv().await.unwrap() {
                return offer;
            }
        }
    })
    .await;
    assert_eq!(added.index, "OFFER4");
    assert_eq!(added.owner_funds, Some(Decimal::TWO));
    assert_eq!(added.taker_gets_funded.value(), dec!(2));
    assert!(!added.is_fully_funded);
    assert!(!script.requests_with_command("account_lines").is_empty());
}
