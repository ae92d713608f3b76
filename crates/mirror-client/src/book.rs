//! 오더북의 살아있는 미러.
//!
//! 스냅샷(`book_offers`)으로 시작해 검증된 트랜잭션의 원장 변경을
//! 증분 적용하며, 각 오퍼의 실제 체결 가능 금액(funded amount)을
//! 소유자 잔고와 발행자 전송 수수료율로부터 유지합니다.
//!
//! 미러 하나당 워커 태스크 하나가 순서 보장 신호 채널을 소비하므로
//! 트랜잭션은 원장 전달 순서대로 끝까지 처리됩니다.

use crate::diff::{DiffNode, DiffType, LedgerDiff};
use crate::error::{ClientError, ClientResult};
use crate::server_set::{
    lock, MirrorSignal, ServerSet, SubscriberHandle, TransactionUpdate, WeakServerSet,
};
use mirror_core::{
    apply_transfer_rate, AccountId, Amount, BookId, DEFAULT_TRANSFER_RATE,
};
use rust_decimal::Decimal;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

/// 북 이벤트 브로드캐스트 채널 용량.
const BOOK_EVENT_CAPACITY: usize = 256;

/// 오더북의 오퍼 하나.
#[derive(Debug, Clone)]
pub struct Offer {
    /// 소유 계정
    pub account: AccountId,
    /// 소유 계정 내 시퀀스
    pub sequence: u64,
    /// 오퍼 플래그 (없으면 0)
    pub flags: u64,
    /// 원장 엔트리 식별자
    pub index: String,
    /// 명목 제공 금액
    pub taker_gets: Amount,
    /// 명목 요구 금액
    pub taker_pays: Amount,
    /// 가격: pays / gets (오름차순 = 테이커에게 좋은 순)
    pub quality: Decimal,
    /// 소유자의 사용 가능 잔고 (수수료율 반영)
    pub owner_funds: Option<Decimal>,
    /// 실제 체결 가능한 제공 금액
    pub taker_gets_funded: Amount,
    /// 실제 체결 가능한 요구 금액
    pub taker_pays_funded: Amount,
    /// 명목 금액 전부가 체결 가능한지
    pub is_fully_funded: bool,
}

impl Offer {
    /// 원장 엔트리 필드에서 오퍼를 만듭니다.
    ///
    /// `PreviousTxnID`/`PreviousTxnLgrSeq` 등 추적용 필드는 버려지고
    /// `Flags`가 없으면 0입니다. funded 필드는 0으로 시작합니다.
    pub(crate) fn from_fields(fields: &Map<String, Value>, index: &str) -> ClientResult<Self> {
        let account = fields
            .get("Account")
            .and_then(Value::as_str)
            .ok_or_else(|| ClientError::Protocol("offer missing Account".to_string()))
            .and_then(|s| AccountId::parse(s).map_err(ClientError::from))?;
        let taker_gets = Amount::parse(
            fields
                .get("TakerGets")
                .ok_or_else(|| ClientError::Protocol("offer missing TakerGets".to_string()))?,
        )?;
        let taker_pays = Amount::parse(
            fields
                .get("TakerPays")
                .ok_or_else(|| ClientError::Protocol("offer missing TakerPays".to_string()))?,
        )?;
        let quality = taker_pays.ratio(&taker_gets)?;

        Ok(Self {
            account,
            sequence: fields.get("Sequence").and_then(Value::as_u64).unwrap_or(0),
            flags: fields.get("Flags").and_then(Value::as_u64).unwrap_or(0),
            index: index.to_string(),
            taker_gets_funded: Amount::zero(taker_gets.currency().clone()),
            taker_pays_funded: Amount::zero(taker_pays.currency().clone()),
            taker_gets,
            taker_pays,
            quality,
            owner_funds: None,
            is_fully_funded: false,
        })
    }
}

/// 사용 가능 잔고를 오퍼의 funded 필드에 반영합니다.
///
/// 잔고가 0 이하이면 양쪽 funded 금액은 0입니다. 잔고가 명목 제공
/// 금액 이상이면 완전 체결 가능, 아니면 제공 금액은 잔고만큼, 요구
/// 금액은 잔고 × 가격을 명목 요구 금액으로 상한합니다.
fn apply_funds(offer: &mut Offer, available: Decimal) {
    if available <= Decimal::ZERO {
        offer.taker_gets_funded = Amount::zero(offer.taker_gets.currency().clone());
        offer.taker_pays_funded = Amount::zero(offer.taker_pays.currency().clone());
        offer.is_fully_funded = false;
        return;
    }

    if available >= offer.taker_gets.value() {
        offer.taker_gets_funded = offer.taker_gets.clone();
        offer.taker_pays_funded = offer.taker_pays.clone();
        offer.is_fully_funded = true;
        return;
    }

    // 요구 금액은 잔고 × 가격. 절사 규칙은 pays 통화를 따름.
    let scaled =
        Amount::issued(available, offer.taker_pays.currency().clone()).scaled(offer.quality);
    offer.taker_gets_funded = Amount::issued(available, offer.taker_gets.currency().clone());
    offer.taker_pays_funded = Amount::issued(
        scaled.value().min(offer.taker_pays.value()),
        offer.taker_pays.currency().clone(),
    );
    offer.is_fully_funded = false;
}

/// 소유자 잔고를 가격이 좋은 오퍼부터 차례로 배분합니다.
///
/// 앞선 오퍼의 명목 제공 금액이 잔고를 먼저 차지하고 나머지가 다음
/// 오퍼로 넘어갑니다. 명목 합계가 잔고를 넘으면 뒤쪽 오퍼는 0입니다.
/// `owner_funds`에는 배분과 무관하게 소유자 잔고 전체가 기록됩니다.
fn distribute_owner_funds(offers: &mut [Offer], account: &AccountId, funds: Decimal) {
    let mut remaining = funds;
    for offer in offers.iter_mut().filter(|o| &o.account == account) {
        offer.owner_funds = Some(funds);
        apply_funds(offer, remaining);
        remaining -= offer.taker_gets.value();
    }
}

/// 잔고를 다시 배분하고 체결 가능 금액이 달라진 오퍼의 변경 이벤트를
/// 모읍니다. `skip` 인덱스의 오퍼는 알리지 않습니다.
fn redistribute(
    state: &mut BookState,
    account: &AccountId,
    funds: Decimal,
    skip: Option<&str>,
) -> Vec<BookEvent> {
    let previous: Vec<Offer> = state
        .offers
        .iter()
        .filter(|o| &o.account == account)
        .cloned()
        .collect();
    distribute_owner_funds(&mut state.offers, account, funds);

    let mut events = Vec::new();
    for current in state.offers.iter().filter(|o| &o.account == account) {
        if skip == Some(current.index.as_str()) {
            continue;
        }
        let Some(prev) = previous.iter().find(|p| p.index == current.index) else {
            continue;
        };
        if current.taker_gets_funded != prev.taker_gets_funded {
            events.push(BookEvent::OfferChanged {
                previous: prev.clone(),
                current: current.clone(),
            });
            events.push(BookEvent::OfferFundsChanged {
                offer: current.clone(),
                previous_funds: prev.taker_gets_funded.clone(),
                current_funds: current.taker_gets_funded.clone(),
            });
        }
    }
    events
}

/// 가격 오름차순을 유지하는 삽입 위치를 찾습니다.
///
/// 같은 가격의 기존 오퍼들 뒤에 들어갑니다.
fn insert_position(offers: &[Offer], quality: Decimal) -> usize {
    offers
        .iter()
        .position(|offer| offer.quality > quality)
        .unwrap_or(offers.len())
}

/// 미러가 내보내는 이벤트.
#[derive(Debug, Clone)]
pub enum BookEvent {
    /// 전체 오퍼 시퀀스 (가격 오름차순)
    Model(Vec<Offer>),
    /// 이 북에 영향을 준 원본 트랜잭션 메시지
    Transaction(Arc<Value>),
    /// 한 트랜잭션에서 소비된 총량
    Trade { gets: Amount, pays: Amount },
    /// 오퍼 생성
    OfferAdded(Offer),
    /// 오퍼 삭제 (체결 완료 또는 취소)
    OfferRemoved(Offer),
    /// 오퍼 변경
    OfferChanged { previous: Offer, current: Offer },
    /// 잔고 변화로 체결 가능 금액이 변경됨
    OfferFundsChanged {
        offer: Offer,
        previous_funds: Amount,
        current_funds: Amount,
    },
}

enum WorkerCommand {
    Bootstrap,
    Teardown,
}

struct BookState {
    offers: Vec<Offer>,
    synchronized: bool,
}

struct MirrorInner {
    book: BookId,
    state: Mutex<BookState>,
    listeners: AtomicUsize,
    commands: mpsc::UnboundedSender<WorkerCommand>,
    events: broadcast::Sender<BookEvent>,
}

/// 오더북 미러 핸들.
///
/// 복제가 저렴하며 같은 북의 핸들들은 하나의 미러를 공유합니다.
/// 첫 리스너가 붙을 때 동기화가 시작되고 마지막 리스너가 떨어지면
/// 해제됩니다.
#[derive(Clone)]
pub struct OrderBookMirror {
    inner: Arc<MirrorInner>,
}

impl OrderBookMirror {
    pub(crate) fn new(set: ServerSet, book: BookId) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(BOOK_EVENT_CAPACITY);

        let inner = Arc::new(MirrorInner {
            book: book.clone(),
            state: Mutex::new(BookState {
                offers: Vec::new(),
                synchronized: false,
            }),
            listeners: AtomicUsize::new(0),
            commands: command_tx,
            events,
        });

        let subscriber_id = set.subscriber_id();
        let worker = BookWorker {
            inner: inner.clone(),
            set: set.downgrade(),
            subscriber_id,
            signal_tx,
            active: false,
            book_watched: false,
            tx_subscribed: false,
            transfer_rate: None,
            owner_funds: HashMap::new(),
            owner_funds_raw: HashMap::new(),
            owner_offer_count: HashMap::new(),
        };
        tokio::spawn(worker.run(command_rx, signal_rx));

        Self { inner }
    }

    /// 북 키를 반환합니다.
    pub fn book_id(&self) -> &BookId {
        &self.inner.book
    }

    /// 리스너를 등록하고 (새 리스너 수, 이벤트 수신기)를 반환합니다.
    ///
    /// 첫 리스너(0→1)에서만 동기화가 시작됩니다.
    pub fn attach(&self) -> (usize, broadcast::Receiver<BookEvent>) {
        let receiver = self.inner.events.subscribe();
        let count = self.inner.listeners.fetch_add(1, Ordering::SeqCst) + 1;
        if count == 1 {
            let _ = self.inner.commands.send(WorkerCommand::Bootstrap);
        }
        (count, receiver)
    }

    /// 리스너를 해제하고 남은 리스너 수를 반환합니다.
    ///
    /// 마지막 리스너(1→0)에서만 구독이 해제되고 캐시가 비워집니다.
    pub fn detach(&self) -> usize {
        let count = self
            .inner
            .listeners
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .map(|previous| previous - 1)
            .unwrap_or(0);
        if count == 0 {
            let _ = self.inner.commands.send(WorkerCommand::Teardown);
        }
        count
    }

    /// 이벤트 수신기를 반환합니다.
    pub fn events(&self) -> broadcast::Receiver<BookEvent> {
        self.inner.events.subscribe()
    }

    /// 현재 오퍼 시퀀스를 반환합니다.
    ///
    /// 동기화되어 있으면 캐시를, 아니면 다음 `Model` 이벤트를 기다립니다.
    pub async fn get_offers(&self) -> ClientResult<Vec<Offer>> {
        let mut events = self.inner.events.subscribe();
        {
            let state = lock(&self.inner.state);
            if state.synchronized {
                return Ok(state.offers.clone());
            }
        }
        loop {
            match events.recv().await {
                Ok(BookEvent::Model(offers)) => return Ok(offers),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    let state = lock(&self.inner.state);
                    if state.synchronized {
                        return Ok(state.offers.clone());
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return Err(ClientError::TornDown),
            }
        }
    }

    /// 즉시 사용 가능한 스냅샷을 반환합니다. 동기화 전에는 비어 있습니다.
    pub fn get_offers_sync(&self) -> Vec<Offer> {
        let state = lock(&self.inner.state);
        if state.synchronized {
            state.offers.clone()
        } else {
            Vec::new()
        }
    }
}

struct BookWorker {
    inner: Arc<MirrorInner>,
    /// 서버 집합을 살려두지 않도록 약한 핸들만 쥡니다.
    set: WeakServerSet,
    subscriber_id: u64,
    signal_tx: mpsc::UnboundedSender<MirrorSignal>,
    active: bool,
    book_watched: bool,
    tx_subscribed: bool,
    /// gets 발행자의 전송 수수료율 (리셋까지 캐시)
    transfer_rate: Option<u32>,
    /// 소유자별 사용 가능 잔고 (수수료율 반영)
    owner_funds: HashMap<AccountId, Decimal>,
    /// 소유자별 원시 잔고
    owner_funds_raw: HashMap<AccountId, Decimal>,
    /// 소유자별 이 북의 살아있는 오퍼 수
    owner_offer_count: HashMap<AccountId, usize>,
}

impl BookWorker {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<WorkerCommand>,
        mut signals: mpsc::UnboundedReceiver<MirrorSignal>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    None => {
                        self.deactivate();
                        return;
                    }
                    Some(WorkerCommand::Bootstrap) => {
                        if !self.active {
                            self.active = true;
                            self.bootstrap().await;
                        }
                    }
                    Some(WorkerCommand::Teardown) => self.deactivate(),
                },
                signal = signals.recv() => match signal {
                    None => return,
                    Some(MirrorSignal::Transaction(update)) => {
                        if self.active {
                            self.on_transaction(&update).await;
                        }
                    }
                    Some(MirrorSignal::Disconnected) => {
                        if self.active {
                            lock(&self.inner.state).synchronized = false;
                        }
                    }
                    Some(MirrorSignal::Reconnected) => {
                        if self.active {
                            self.bootstrap().await;
                        }
                    }
                },
            }
        }
    }

    fn emit(&self, event: BookEvent) {
        let _ = self.inner.events.send(event);
    }

    fn deactivate(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        self.reset_caches();
        if let Some(set) = self.set.upgrade() {
            if self.tx_subscribed {
                set.unsubscribe_transactions();
            }
            if self.book_watched {
                set.unwatch_book(&self.inner.book, self.subscriber_id);
            }
        }
        self.tx_subscribed = false;
        self.book_watched = false;
        info!(book = %self.inner.book, "Order book released");
    }

    /// 잔고/수수료율/오퍼 캐시를 비우고 계정 구독을 해제합니다.
    fn reset_caches(&mut self) {
        if let Some(set) = self.set.upgrade() {
            for account in self.owner_funds_raw.keys() {
                set.unwatch_account(account, self.subscriber_id);
            }
        }
        self.owner_funds.clear();
        self.owner_funds_raw.clear();
        self.owner_offer_count.clear();
        self.transfer_rate = None;

        let mut state = lock(&self.inner.state);
        state.offers.clear();
        state.synchronized = false;
    }

    /// 스냅샷 동기화: 수수료율 → book_offers → transactions 구독.
    ///
    /// 실패하면 동기화 상태로 들어가지 않으며, 다음 재연결 신호에서
    /// 다시 시도됩니다.
    async fn bootstrap(&mut self) {
        self.reset_caches();
        if !self.book_watched {
            if let Some(set) = self.set.upgrade() {
                set.watch_book(
                    &self.inner.book,
                    SubscriberHandle {
                        id: self.subscriber_id,
                        tx: self.signal_tx.clone(),
                    },
                );
                self.book_watched = true;
            }
        }
        match self.bootstrap_inner().await {
            Ok(count) => {
                info!(book = %self.inner.book, offers = count, "Order book synchronized");
            }
            Err(e) => {
                warn!(book = %self.inner.book, error = %e, "Order book bootstrap failed");
            }
        }
    }

    async fn bootstrap_inner(&mut self) -> ClientResult<usize> {
        let rate = self.resolve_transfer_rate().await?;
        self.transfer_rate = Some(rate);

        let book = self.inner.book.clone();
        let set = self.set.upgrade().ok_or(ClientError::TornDown)?;
        let result = set
            .request(
                "book_offers",
                json!({
                    "taker_gets": book.gets.to_wire(),
                    "taker_pays": book.pays.to_wire(),
                }),
            )
            .await?;
        drop(set);

        let entries = result["offers"].as_array().cloned().unwrap_or_default();
        let mut offers: Vec<Offer> = Vec::with_capacity(entries.len());
        for entry in &entries {
            let fields = match entry.as_object() {
                Some(fields) => fields,
                None => continue,
            };
            let index = entry["index"].as_str().unwrap_or_default();
            let offer = match Offer::from_fields(fields, index) {
                Ok(offer) => offer,
                Err(e) => {
                    debug!(book = %book, error = %e, "Snapshot offer skipped");
                    continue;
                }
            };

            if !self.owner_funds.contains_key(&offer.account) {
                // 소유자의 첫 오퍼에는 owner_funds가 실려 옴
                let raw = match entry["owner_funds"]
                    .as_str()
                    .and_then(|s| s.parse::<Decimal>().ok())
                {
                    Some(raw) => raw,
                    None => match self.resolve_owner_balance(&offer.account).await {
                        Ok(raw) => raw,
                        Err(e) => {
                            warn!(book = %book, account = %offer.account, error = %e,
                                "Owner funds unresolved; snapshot offer skipped");
                            continue;
                        }
                    },
                };
                self.cache_owner_funds(&offer.account, raw);
            }

            let position = insert_position(&offers, offer.quality);
            *self.owner_offer_count.entry(offer.account.clone()).or_insert(0) += 1;
            offers.insert(position, offer);
        }

        // 정렬이 끝난 뒤 소유자별로 잔고를 배분
        for (account, funds) in self.owner_funds.clone() {
            distribute_owner_funds(&mut offers, &account, funds);
        }

        if !self.tx_subscribed {
            let set = self.set.upgrade().ok_or(ClientError::TornDown)?;
            set.subscribe_transactions();
            self.tx_subscribed = true;
        }

        let count = offers.len();
        {
            let mut state = lock(&self.inner.state);
            state.offers = offers.clone();
            state.synchronized = true;
        }
        self.emit(BookEvent::Model(offers));
        Ok(count)
    }

    /// gets 발행자의 전송 수수료율을 조회합니다. 네이티브는 기본율입니다.
    async fn resolve_transfer_rate(&self) -> ClientResult<u32> {
        if let Some(rate) = self.transfer_rate {
            return Ok(rate);
        }
        let issuer = match self.inner.book.gets.issuer() {
            None => return Ok(DEFAULT_TRANSFER_RATE),
            Some(issuer) => issuer.clone(),
        };
        let set = self.set.upgrade().ok_or(ClientError::TornDown)?;
        let result = set
            .request("account_info", json!({ "account": issuer.as_str() }))
            .await?;
        Ok(result["account_data"]["TransferRate"]
            .as_u64()
            .map(|rate| rate as u32)
            .unwrap_or(DEFAULT_TRANSFER_RATE))
    }

    /// 소유자의 원시 잔고를 조회합니다.
    ///
    /// 네이티브 gets는 계정 잔고, 발행 통화 gets는 발행자와의 신뢰선
    /// 잔고입니다. 신뢰선이 없으면 0입니다.
    async fn resolve_owner_balance(&self, account: &AccountId) -> ClientResult<Decimal> {
        let set = self.set.upgrade().ok_or(ClientError::TornDown)?;
        match &self.inner.book.gets {
            gets if gets.is_native() => {
                let result = set
                    .request("account_info", json!({ "account": account.as_str() }))
                    .await?;
                result["account_data"]["Balance"]
                    .as_str()
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| {
                        ClientError::Protocol("account_info missing Balance".to_string())
                    })
            }
            gets => {
                let issuer = match gets.issuer() {
                    Some(issuer) => issuer.clone(),
                    None => return Ok(Decimal::ZERO),
                };
                let result = set
                    .request(
                        "account_lines",
                        json!({ "account": account.as_str(), "peer": issuer.as_str() }),
                    )
                    .await?;
                let balance = result["lines"]
                    .as_array()
                    .into_iter()
                    .flatten()
                    .find(|line| line["currency"].as_str() == Some(gets.code()))
                    .and_then(|line| line["balance"].as_str())
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(Decimal::ZERO);
                Ok(balance)
            }
        }
    }

    /// 원시 잔고를 캐시하고 수수료율 반영 잔고를 반환합니다.
    ///
    /// 새 소유자는 잔고 변화 추적을 위해 계정 구독에 등록됩니다.
    fn cache_owner_funds(&mut self, account: &AccountId, raw: Decimal) -> Decimal {
        let rate = self.transfer_rate.unwrap_or(DEFAULT_TRANSFER_RATE);
        let adjusted = apply_transfer_rate(raw, rate).max(Decimal::ZERO);
        if self.owner_funds_raw.insert(account.clone(), raw).is_none() {
            if let Some(set) = self.set.upgrade() {
                set.watch_account(
                    account,
                    SubscriberHandle {
                        id: self.subscriber_id,
                        tx: self.signal_tx.clone(),
                    },
                );
            }
        }
        self.owner_funds.insert(account.clone(), adjusted);
        adjusted
    }

    fn evict_owner(&mut self, account: &AccountId) {
        self.owner_funds.remove(account);
        self.owner_offer_count.remove(account);
        if self.owner_funds_raw.remove(account).is_some() {
            if let Some(set) = self.set.upgrade() {
                set.unwatch_account(account, self.subscriber_id);
            }
        }
    }

    async fn on_transaction(&mut self, update: &Arc<TransactionUpdate>) {
        if !lock(&self.inner.state).synchronized {
            return;
        }

        let book = self.inner.book.clone();
        let is_cancel =
            update.message["transaction"]["TransactionType"].as_str() == Some("OfferCancel");

        let nodes: Vec<DiffNode> = update
            .diff
            .offer_nodes(&book)
            .into_iter()
            .cloned()
            .collect();

        // 이 북의 오퍼를 건드리지 않은 트랜잭션은 잔고 갱신만 하고
        // 모델/트랜잭션 알림 없이 끝냅니다.
        if nodes.is_empty() {
            self.refresh_owner_funds(&update.diff);
            return;
        }

        let mut gets_total = Amount::zero(book.gets.clone());
        let mut pays_total = Amount::zero(book.pays.clone());

        for node in &nodes {
            match node.diff_type {
                DiffType::Created => self.on_offer_created(node, update).await,
                DiffType::Modified => self.on_offer_modified(node),
                DiffType::Deleted => self.on_offer_deleted(node),
            }

            // 소비량 집계. 취소는 체결이 아니므로 제외.
            if !is_cancel {
                if let Some((gets, pays)) = consumed_amounts(node) {
                    if let (Ok(g), Ok(p)) =
                        (gets_total.checked_add(&gets), pays_total.checked_add(&pays))
                    {
                        gets_total = g;
                        pays_total = p;
                    }
                }
            }
        }

        self.refresh_owner_funds(&update.diff);

        if !gets_total.is_zero() || !pays_total.is_zero() {
            self.emit(BookEvent::Trade {
                gets: gets_total,
                pays: pays_total,
            });
        }

        let offers = lock(&self.inner.state).offers.clone();
        self.emit(BookEvent::Model(offers));
        self.emit(BookEvent::Transaction(Arc::new(update.message.clone())));
    }

    async fn on_offer_created(&mut self, node: &DiffNode, update: &Arc<TransactionUpdate>) {
        let fields = node.source_fields();
        let offer = match Offer::from_fields(fields, &node.ledger_index) {
            Ok(offer) => offer,
            Err(e) => {
                debug!(book = %self.inner.book, error = %e, "Created offer unusable");
                return;
            }
        };

        // 이미 아는 인덱스면 중복 신호: 무시
        if position_of(&lock(&self.inner.state).offers, &node.ledger_index).is_some() {
            return;
        }

        let funds = match self.owner_funds.get(&offer.account) {
            Some(funds) => *funds,
            None => {
                // 트랜잭션에 실린 잔고 힌트가 있으면 조회 없이 사용
                let hinted = update.message["transaction"]["owner_funds"]
                    .as_str()
                    .and_then(|s| s.parse::<Decimal>().ok());
                let raw = match hinted {
                    Some(raw) => raw,
                    None => match self.resolve_owner_balance(&offer.account).await {
                        Ok(raw) => raw,
                        Err(e) => {
                            warn!(book = %self.inner.book, account = %offer.account,
                                error = %e, "Owner funds unresolved; offer not inserted");
                            return;
                        }
                    },
                };
                self.cache_owner_funds(&offer.account, raw)
            }
        };

        *self
            .owner_offer_count
            .entry(offer.account.clone())
            .or_insert(0) += 1;

        let account = offer.account.clone();
        let index = offer.index.clone();
        let (added, events) = {
            let mut state = lock(&self.inner.state);
            let position = insert_position(&state.offers, offer.quality);
            state.offers.insert(position, offer);
            // 새 오퍼가 같은 소유자의 기존 오퍼 몫을 가져갈 수 있음
            let events = redistribute(&mut state, &account, funds, Some(&index));
            let added = position_of(&state.offers, &index).map(|p| state.offers[p].clone());
            (added, events)
        };
        if let Some(added) = added {
            self.emit(BookEvent::OfferAdded(added));
        }
        for event in events {
            self.emit(event);
        }
    }

    /// 수정 노드: 최종 필드 전체를 덮어쓰고 funded를 다시 계산합니다.
    ///
    /// 부분 체결은 가격을 바꾸지 않으므로 quality와 정렬 위치는
    /// 유지됩니다. 수정된 오퍼 자체의 이벤트는 내지 않습니다
    /// (Model이 뒤따름).
    fn on_offer_modified(&mut self, node: &DiffNode) {
        let mut state = lock(&self.inner.state);
        let Some(position) = position_of(&state.offers, &node.ledger_index) else {
            // 모르는 오퍼: 다음 재동기화에서 복구
            return;
        };

        let fields = &node.fields_final;
        let offer = &mut state.offers[position];
        if let Some(gets) = fields.get("TakerGets").and_then(|v| Amount::parse(v).ok()) {
            offer.taker_gets = gets;
        }
        if let Some(pays) = fields.get("TakerPays").and_then(|v| Amount::parse(v).ok()) {
            offer.taker_pays = pays;
        }
        if let Some(flags) = fields.get("Flags").and_then(Value::as_u64) {
            offer.flags = flags;
        }
        if let Some(sequence) = fields.get("Sequence").and_then(Value::as_u64) {
            offer.sequence = sequence;
        }

        let account = offer.account.clone();
        let index = offer.index.clone();
        let funds = self
            .owner_funds
            .get(&account)
            .copied()
            .or(offer.owner_funds)
            .unwrap_or(Decimal::ZERO);
        // 소비된 만큼 같은 소유자의 다른 오퍼 몫이 달라질 수 있음
        let events = redistribute(&mut state, &account, funds, Some(&index));
        drop(state);
        for event in events {
            self.emit(event);
        }
    }

    fn on_offer_deleted(&mut self, node: &DiffNode) {
        let removed = {
            let mut state = lock(&self.inner.state);
            position_of(&state.offers, &node.ledger_index)
                .map(|position| state.offers.remove(position))
        };
        let Some(offer) = removed else {
            return;
        };

        let remaining = match self.owner_offer_count.get_mut(&offer.account) {
            Some(count) => {
                *count = count.saturating_sub(1);
                *count
            }
            None => 0,
        };
        self.emit(BookEvent::OfferRemoved(offer.clone()));
        if remaining == 0 {
            self.evict_owner(&offer.account);
            return;
        }

        // 삭제된 오퍼가 잡고 있던 몫이 남은 오퍼로 풀림
        if let Some(funds) = self.owner_funds.get(&offer.account).copied() {
            let events = {
                let mut state = lock(&self.inner.state);
                redistribute(&mut state, &offer.account, funds, None)
            };
            for event in events {
                self.emit(event);
            }
        }
    }

    /// 잔고가 변한 캐시된 소유자의 funded 금액을 다시 계산합니다.
    ///
    /// 네이티브 gets는 AccountRoot 잔고, 발행 통화 gets는 해당 신뢰선
    /// 잔고를 사용합니다. 신뢰선 잔고는 low 계정 관점이므로 발행자가
    /// high 쪽이면 그대로, low 쪽이면 부호를 뒤집습니다.
    fn refresh_owner_funds(&mut self, diff: &LedgerDiff) {
        let gets = self.inner.book.gets.clone();
        let mut updates: Vec<(AccountId, Decimal)> = Vec::new();

        for node in &diff.nodes {
            if gets.is_native() {
                if node.entry_type != "AccountRoot" {
                    continue;
                }
                let Some(account) = node.account() else { continue };
                if !self.owner_funds_raw.contains_key(&account) {
                    continue;
                }
                let balance = node
                    .source_fields()
                    .get("Balance")
                    .and_then(Value::as_str)
                    .and_then(|s| s.parse::<Decimal>().ok());
                if let Some(balance) = balance {
                    updates.push((account, balance));
                }
            } else {
                if node.entry_type != "RippleState" {
                    continue;
                }
                let fields = node.fields();
                let balance = fields
                    .get("Balance")
                    .and_then(Value::as_object)
                    .filter(|b| b.get("currency").and_then(Value::as_str) == Some(gets.code()))
                    .and_then(|b| b.get("value"))
                    .and_then(Value::as_str)
                    .and_then(|s| s.parse::<Decimal>().ok());
                let Some(balance) = balance else { continue };

                let side = |key: &str| {
                    fields
                        .get(key)
                        .and_then(Value::as_object)
                        .and_then(|limit| limit.get("issuer"))
                        .and_then(Value::as_str)
                        .and_then(|s| AccountId::parse(s).ok())
                };
                let (Some(low), Some(high)) = (side("LowLimit"), side("HighLimit")) else {
                    continue;
                };
                let issuer = gets.issuer();

                if issuer == Some(&high) && self.owner_funds_raw.contains_key(&low) {
                    updates.push((low, balance));
                } else if issuer == Some(&low) && self.owner_funds_raw.contains_key(&high) {
                    updates.push((high, -balance));
                }
            }
        }

        for (account, raw) in updates {
            let funds = self.cache_owner_funds(&account, raw);
            self.reapply_owner_funds(&account, funds);
        }
    }

    /// 소유자의 모든 오퍼에 새 잔고를 배분하고, 체결 가능 제공 금액이
    /// 실제로 달라진 오퍼만 알립니다.
    fn reapply_owner_funds(&mut self, account: &AccountId, funds: Decimal) {
        let events = {
            let mut state = lock(&self.inner.state);
            redistribute(&mut state, account, funds, None)
        };
        for event in events {
            self.emit(event);
        }
    }
}

fn position_of(offers: &[Offer], index: &str) -> Option<usize> {
    offers.iter().position(|offer| offer.index == index)
}

/// 노드 하나에서 소비된 (gets, pays)를 계산합니다.
///
/// 삭제 노드는 삭제 전 금액 전체, 수정 노드는 변경 전 − 변경 후입니다.
fn consumed_amounts(node: &DiffNode) -> Option<(Amount, Amount)> {
    let leg = |field: &str| -> Option<(Amount, Amount)> {
        let before = node
            .fields_prev
            .get(field)
            .or_else(|| node.fields_final.get(field))
            .and_then(|v| Amount::parse(v).ok())?;
        let after = node
            .fields_final
            .get(field)
            .and_then(|v| Amount::parse(v).ok())?;
        Some((before, after))
    };

    match node.diff_type {
        DiffType::Created => None,
        DiffType::Deleted => {
            let (gets_before, _) = leg("TakerGets")?;
            let (pays_before, _) = leg("TakerPays")?;
            Some((gets_before, pays_before))
        }
        DiffType::Modified => {
            // 변경 전 값이 없으면 금액은 그대로
            if node.fields_prev.get("TakerGets").is_none()
                && node.fields_prev.get("TakerPays").is_none()
            {
                return None;
            }
            let (gets_before, gets_after) = leg("TakerGets")?;
            let (pays_before, pays_after) = leg("TakerPays")?;
            let gets = gets_before.checked_sub(&gets_after).ok()?;
            let pays = pays_before.checked_sub(&pays_after).ok()?;
            Some((gets, pays))
        }
    }
}
