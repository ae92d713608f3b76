//! 서버 집합과 단일 논리 스트림.
//!
//! 여러 세션을 묶어 하나의 논리 서버처럼 제공합니다. 프라이머리 선출,
//! 트랜잭션 해시 중복 제거, 영향 계정/오더북 기준 구독자 팬아웃,
//! 재연결 시 구독 재발행을 담당합니다. 인바운드 처리는 단일 태스크가
//! 세션 이벤트 채널을 순서대로 비우는 한 갈래 스트림입니다.

use crate::book::OrderBookMirror;
use crate::diff::LedgerDiff;
use crate::error::{ClientError, ClientResult};
use crate::session::{
    spawn_session, HandshakeFn, SessionEvent, SessionHandle,
};
use crate::transport::{Connector, WsConnector};
use chrono::{DateTime, Utc};
use mirror_core::{AccountId, BookId, ConnectionConfig, CurrencySpec, MirrorConfig};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, warn};

/// 원시 이벤트 브로드캐스트 채널 용량.
const RAW_EVENT_CAPACITY: usize = 256;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// 집합 전체의 연결 상태.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// 온라인 세션 없음
    Offline,
    /// 하나 이상의 세션이 온라인
    Online,
}

/// 검증된 트랜잭션과 그 원장 변경 해석.
#[derive(Debug)]
pub struct TransactionUpdate {
    /// 수신한 원본 메시지
    pub message: Value,
    /// 메타데이터에서 해석한 변경
    pub diff: LedgerDiff,
    /// 수신 시각
    pub received_at: DateTime<Utc>,
}

/// 가공 없이 전달되는 스트림 이벤트.
#[derive(Debug, Clone)]
pub enum RawEvent {
    /// 검증된 트랜잭션 (중복 제거 후)
    Transaction(Arc<TransactionUpdate>),
    /// 원장 마감
    LedgerClosed(Arc<Value>),
    /// 서버 상태 변경
    ServerStatus(Arc<Value>),
    /// 메타데이터 해석 실패 (트랜잭션은 폐기됨)
    DiffError { hash: String, error: String },
    /// 알 수 없는 메시지 타입 (전방 호환)
    Unknown {
        message_type: String,
        message: Arc<Value>,
    },
}

/// 미러 워커로 전달되는 순서 보장 신호.
#[derive(Debug, Clone)]
pub(crate) enum MirrorSignal {
    /// 이 구독자와 관련된 검증 트랜잭션
    Transaction(Arc<TransactionUpdate>),
    /// 집합 전체가 오프라인으로 전환
    Disconnected,
    /// 오프라인에서 온라인으로 복귀 (재동기화 필요)
    Reconnected,
}

/// 구독자 등록 항목.
#[derive(Clone)]
pub(crate) struct SubscriberHandle {
    pub id: u64,
    pub tx: mpsc::UnboundedSender<MirrorSignal>,
}

/// 용량 제한이 있는 삽입 순서 해시 집합.
///
/// 가장 오래전에 삽입된 해시부터 밀려납니다.
struct SeenSet {
    capacity: usize,
    set: HashSet<String>,
    order: VecDeque<String>,
}

impl SeenSet {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            set: HashSet::new(),
            order: VecDeque::new(),
        }
    }

    fn contains(&self, hash: &str) -> bool {
        self.set.contains(hash)
    }

    fn insert(&mut self, hash: &str) {
        if !self.set.insert(hash.to_string()) {
            return;
        }
        self.order.push_back(hash.to_string());
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.set.remove(&evicted);
            }
        }
    }
}

/// 활성 구독 계획.
///
/// 세션 핸드셰이크가 이 계획에서 재구독 페이로드를 만듭니다.
pub(crate) struct SubscriptionPlan {
    state: Mutex<PlanState>,
}

#[derive(Default)]
struct PlanState {
    /// transactions 스트림 참조 수
    transactions: usize,
    /// 계정별 구독 참조 수
    accounts: HashMap<AccountId, usize>,
}

impl SubscriptionPlan {
    fn new() -> Self {
        Self {
            state: Mutex::new(PlanState::default()),
        }
    }

    /// 현재 계획 전체를 담은 subscribe 요청 페이로드.
    fn handshake_payload(&self) -> Value {
        let state = lock(&self.state);
        let mut streams = vec!["ledger", "server"];
        if state.transactions > 0 {
            streams.push("transactions");
        }
        let mut payload = json!({ "command": "subscribe", "streams": streams });
        if !state.accounts.is_empty() {
            let mut accounts: Vec<&str> =
                state.accounts.keys().map(AccountId::as_str).collect();
            accounts.sort_unstable();
            payload["accounts"] = json!(accounts);
        }
        payload
    }

    /// 참조 수를 올리고 0→1 전환 여부를 반환합니다.
    fn add_transactions(&self) -> bool {
        let mut state = lock(&self.state);
        state.transactions += 1;
        state.transactions == 1
    }

    fn remove_transactions(&self) -> bool {
        let mut state = lock(&self.state);
        if state.transactions == 0 {
            return false;
        }
        state.transactions -= 1;
        state.transactions == 0
    }

    fn add_account(&self, account: &AccountId) -> bool {
        let mut state = lock(&self.state);
        let count = state.accounts.entry(account.clone()).or_insert(0);
        *count += 1;
        *count == 1
    }

    fn remove_account(&self, account: &AccountId) -> bool {
        let mut state = lock(&self.state);
        match state.accounts.get_mut(account) {
            Some(count) if *count > 1 => {
                *count -= 1;
                false
            }
            Some(_) => {
                state.accounts.remove(account);
                true
            }
            None => false,
        }
    }
}

/// 팬아웃과 원장 추적의 공유 상태.
struct Shared {
    primary: Option<usize>,
    online: HashSet<usize>,
    seen: SeenSet,
    ledger_index: Option<u64>,
    ledger_hash: Option<String>,
    accounts: HashMap<AccountId, Vec<SubscriberHandle>>,
    books: HashMap<BookId, Vec<SubscriberHandle>>,
}

struct ServerSetInner {
    connector: Arc<dyn Connector>,
    connection: ConnectionConfig,
    sessions: Mutex<Vec<SessionHandle>>,
    shared: Mutex<Shared>,
    plan: Arc<SubscriptionPlan>,
    state_tx: watch::Sender<ConnectionState>,
    state_rx: watch::Receiver<ConnectionState>,
    raw_events: broadcast::Sender<RawEvent>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    books: Mutex<HashMap<BookId, OrderBookMirror>>,
    next_subscriber_id: AtomicU64,
}

/// 세션 집합에 대한 복제 가능한 핸들.
#[derive(Clone)]
pub struct ServerSet {
    inner: Arc<ServerSetInner>,
}

/// 집합을 살려두지 않는 약한 핸들.
///
/// 집합에 등록된 미러의 워커가 집합을 다시 참조할 때 사용합니다.
/// 강한 핸들이 모두 사라지면 업그레이드가 실패합니다.
#[derive(Clone)]
pub(crate) struct WeakServerSet {
    inner: Weak<ServerSetInner>,
}

impl WeakServerSet {
    pub(crate) fn upgrade(&self) -> Option<ServerSet> {
        self.inner.upgrade().map(|inner| ServerSet { inner })
    }
}

impl ServerSet {
    /// 빈 집합을 생성합니다. 서버는 [`ServerSet::add_server`]로 등록합니다.
    pub fn new(connector: Arc<dyn Connector>, connection: ConnectionConfig) -> Self {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Offline);
        let (raw_events, _) = broadcast::channel(RAW_EVENT_CAPACITY);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(ServerSetInner {
            connector,
            shared: Mutex::new(Shared {
                primary: None,
                online: HashSet::new(),
                seen: SeenSet::new(connection.seen_tx_capacity),
                ledger_index: None,
                ledger_hash: None,
                accounts: HashMap::new(),
                books: HashMap::new(),
            }),
            connection,
            sessions: Mutex::new(Vec::new()),
            plan: Arc::new(SubscriptionPlan::new()),
            state_tx,
            state_rx,
            raw_events,
            events_tx,
            books: Mutex::new(HashMap::new()),
            next_subscriber_id: AtomicU64::new(1),
        });

        tokio::spawn(process_events(Arc::downgrade(&inner), events_rx));

        Self { inner }
    }

    /// 설정에서 집합을 구성합니다.
    pub fn from_config(config: &MirrorConfig) -> Self {
        let set = Self::new(Arc::new(WsConnector), config.connection.clone());
        for server in &config.servers {
            set.add_server(&server.url, server.primary);
        }
        set
    }

    /// 서버를 등록하고 세션 핸들을 반환합니다.
    pub fn add_server(&self, url: &str, preferred: bool) -> SessionHandle {
        let plan = self.inner.plan.clone();
        let handshake: HandshakeFn = Arc::new(move || plan.handshake_payload());

        let mut sessions = lock(&self.inner.sessions);
        let handle = spawn_session(
            sessions.len(),
            url.to_string(),
            preferred,
            self.inner.connector.clone(),
            handshake,
            self.inner.events_tx.clone(),
            &self.inner.connection,
        );
        sessions.push(handle.clone());
        info!(endpoint = url, preferred, "Server registered");
        handle
    }

    /// 등록된 모든 서버에 연결을 시작합니다.
    pub fn connect(&self) {
        for session in lock(&self.inner.sessions).iter() {
            session.connect();
        }
    }

    /// 모든 세션을 해제합니다.
    pub fn disconnect(&self) {
        for session in lock(&self.inner.sessions).iter() {
            session.disconnect();
        }
    }

    /// 현재 집합 상태를 반환합니다.
    pub fn state(&self) -> ConnectionState {
        *self.inner.state_rx.borrow()
    }

    /// 상태 watch 수신기를 반환합니다.
    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_rx.clone()
    }

    /// 온라인 여부를 반환합니다.
    pub fn is_online(&self) -> bool {
        self.state() == ConnectionState::Online
    }

    /// 마지막으로 관측한 원장 인덱스를 반환합니다.
    pub fn ledger_index(&self) -> Option<u64> {
        lock(&self.inner.shared).ledger_index
    }

    /// 마지막으로 관측한 원장 해시를 반환합니다.
    pub fn ledger_hash(&self) -> Option<String> {
        lock(&self.inner.shared).ledger_hash.clone()
    }

    /// 원시 이벤트 스트림을 구독합니다.
    pub fn raw_events(&self) -> broadcast::Receiver<RawEvent> {
        self.inner.raw_events.subscribe()
    }

    /// 프라이머리 또는 아무 온라인 세션으로 요청을 보냅니다.
    ///
    /// 서버가 하나도 등록되지 않았으면 즉시 실패합니다. 모두 오프라인이면
    /// 다음 온라인 전환까지 기다린 후 전송합니다. 재시도 가능한 실패는
    /// 다른 세션으로 넘어갑니다.
    pub async fn request(&self, command: &str, params: Value) -> ClientResult<Value> {
        let payload = build_payload(command, params);
        let mut state_rx = self.inner.state_rx.clone();
        let mut avoid = None;

        loop {
            let picked = self.pick_session(avoid);
            match picked {
                Some(session) => match session.request(payload.clone()).await {
                    Ok(result) => return Ok(result),
                    Err(e) if e.is_retryable() => {
                        debug!(endpoint = session.endpoint(), error = %e,
                            "Request failed; trying another session");
                        avoid = Some(session.index());
                        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                    }
                    Err(e) => return Err(e),
                },
                None => {
                    if lock(&self.inner.sessions).is_empty() {
                        return Err(ClientError::NoServersAvailable);
                    }
                    state_rx
                        .changed()
                        .await
                        .map_err(|_| ClientError::TornDown)?;
                }
            }
        }
    }

    /// 특정 세션으로 요청을 보냅니다. 세션이 없으면 즉시 실패합니다.
    pub async fn request_on(
        &self,
        server: usize,
        command: &str,
        params: Value,
    ) -> ClientResult<Value> {
        let session = lock(&self.inner.sessions)
            .iter()
            .find(|s| s.index() == server)
            .cloned();
        match session {
            Some(session) => session.request(build_payload(command, params)).await,
            None => Err(ClientError::NotConnected(format!(
                "server {} is not registered",
                server
            ))),
        }
    }

    /// 오더북 미러를 생성하거나 기존 미러를 반환합니다.
    pub fn order_book(
        &self,
        gets: CurrencySpec,
        pays: CurrencySpec,
    ) -> ClientResult<OrderBookMirror> {
        let book = BookId::new(gets, pays);
        if !book.is_valid() {
            return Err(ClientError::Protocol(
                "order book legs cannot both be native".to_string(),
            ));
        }
        let mut books = lock(&self.inner.books);
        let mirror = books
            .entry(book.clone())
            .or_insert_with(|| OrderBookMirror::new(self.clone(), book))
            .clone();
        Ok(mirror)
    }

    /// 프라이머리 우선으로 온라인 세션 하나를 고릅니다.
    ///
    /// 프라이머리가 비어 있으면 고른 세션을 프라이머리로 선출합니다.
    fn pick_session(&self, avoid: Option<usize>) -> Option<SessionHandle> {
        let sessions = lock(&self.inner.sessions);
        let mut shared = lock(&self.inner.shared);

        if let Some(primary) = shared.primary {
            if avoid != Some(primary) && shared.online.contains(&primary) {
                if let Some(session) = sessions.iter().find(|s| s.index() == primary) {
                    return Some(session.clone());
                }
            }
        }

        let fallback = sessions
            .iter()
            .find(|s| shared.online.contains(&s.index()) && avoid != Some(s.index()))
            .or_else(|| sessions.iter().find(|s| shared.online.contains(&s.index())))
            .cloned();
        if let Some(session) = &fallback {
            shared.primary.get_or_insert(session.index());
        }
        fallback
    }

    pub(crate) fn downgrade(&self) -> WeakServerSet {
        WeakServerSet {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub(crate) fn subscriber_id(&self) -> u64 {
        self.inner.next_subscriber_id.fetch_add(1, Ordering::Relaxed)
    }

    /// transactions 스트림 구독 참조를 올립니다 (공유, 멱등).
    pub(crate) fn subscribe_transactions(&self) {
        if self.inner.plan.add_transactions() {
            self.broadcast_plan_delta("subscribe", json!({ "streams": ["transactions"] }));
        }
    }

    pub(crate) fn unsubscribe_transactions(&self) {
        if self.inner.plan.remove_transactions() {
            self.broadcast_plan_delta("unsubscribe", json!({ "streams": ["transactions"] }));
        }
    }

    /// 오더북 구독자를 등록합니다.
    pub(crate) fn watch_book(&self, book: &BookId, subscriber: SubscriberHandle) {
        lock(&self.inner.shared)
            .books
            .entry(book.clone())
            .or_default()
            .push(subscriber);
    }

    pub(crate) fn unwatch_book(&self, book: &BookId, id: u64) {
        let mut shared = lock(&self.inner.shared);
        if let Some(subs) = shared.books.get_mut(book) {
            subs.retain(|s| s.id != id);
            if subs.is_empty() {
                shared.books.remove(book);
            }
        }
    }

    /// 계정 구독자를 등록하고, 필요하면 서버 구독을 추가합니다.
    pub(crate) fn watch_account(&self, account: &AccountId, subscriber: SubscriberHandle) {
        lock(&self.inner.shared)
            .accounts
            .entry(account.clone())
            .or_default()
            .push(subscriber);
        if self.inner.plan.add_account(account) {
            self.broadcast_plan_delta("subscribe", json!({ "accounts": [account.as_str()] }));
        }
    }

    pub(crate) fn unwatch_account(&self, account: &AccountId, id: u64) {
        let mut shared = lock(&self.inner.shared);
        if let Some(subs) = shared.accounts.get_mut(account) {
            subs.retain(|s| s.id != id);
            if subs.is_empty() {
                shared.accounts.remove(account);
            }
        }
        drop(shared);
        if self.inner.plan.remove_account(account) {
            self.broadcast_plan_delta("unsubscribe", json!({ "accounts": [account.as_str()] }));
        }
    }

    /// 구독 계획 변경분을 모든 세션에 전파합니다.
    ///
    /// 오프라인 세션은 핸드셰이크 재구독이 전체 계획을 복원하므로
    /// 실패는 무시합니다.
    fn broadcast_plan_delta(&self, command: &str, params: Value) {
        let sessions: Vec<SessionHandle> = lock(&self.inner.sessions).clone();
        for session in sessions {
            let payload = build_payload(command, params.clone());
            tokio::spawn(async move {
                if let Err(e) = session.request(payload).await {
                    debug!(endpoint = session.endpoint(), error = %e,
                        "Subscription delta not delivered");
                }
            });
        }
    }
}

fn build_payload(command: &str, params: Value) -> Value {
    let mut payload = if params.is_object() { params } else { json!({}) };
    payload["command"] = json!(command);
    payload
}

/// 세션 이벤트를 순서대로 처리하는 단일 태스크.
async fn process_events(
    inner: Weak<ServerSetInner>,
    mut events: mpsc::UnboundedReceiver<SessionEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        match event {
            SessionEvent::Connecting { server } => {
                debug!(server, "Session connecting");
            }
            SessionEvent::Connected { server } => on_session_online(&inner, server),
            SessionEvent::Disconnected { server } => on_session_offline(&inner, server),
            SessionEvent::Stream { server, message } => on_stream(&inner, server, message),
        }
    }
}

fn on_session_online(inner: &Arc<ServerSetInner>, server: usize) {
    let sessions = lock(&inner.sessions);
    let mut shared = lock(&inner.shared);

    let was_offline = shared.online.is_empty();
    shared.online.insert(server);

    // 프라이머리 선출: preferred 플래그가 있는 온라인 세션 우선
    let preferred = sessions
        .iter()
        .find(|s| s.preferred() && shared.online.contains(&s.index()))
        .map(|s| s.index());
    match preferred {
        Some(index) => shared.primary = Some(index),
        None => {
            shared.primary.get_or_insert(server);
        }
    }

    if was_offline {
        info!(server, "Server set online");
        let _ = inner.state_tx.send(ConnectionState::Online);
        // 미러들에게 재동기화 신호. 구독 자체는 세션 핸드셰이크가 복원.
        signal_all_subscribers(&shared, MirrorSignal::Reconnected);
    }
}

fn on_session_offline(inner: &Arc<ServerSetInner>, server: usize) {
    let mut shared = lock(&inner.shared);
    shared.online.remove(&server);

    if shared.primary == Some(server) {
        shared.primary = shared.online.iter().min().copied();
    }

    if shared.online.is_empty() {
        warn!(server, "Server set offline");
        let _ = inner.state_tx.send(ConnectionState::Offline);
        signal_all_subscribers(&shared, MirrorSignal::Disconnected);
    }
}

/// 등록된 모든 구독자에게 한 번씩 신호를 보냅니다.
fn signal_all_subscribers(shared: &Shared, signal: MirrorSignal) {
    let mut notified = HashSet::new();
    for subscriber in shared
        .books
        .values()
        .flatten()
        .chain(shared.accounts.values().flatten())
    {
        if notified.insert(subscriber.id) {
            let _ = subscriber.tx.send(signal.clone());
        }
    }
}

fn on_stream(inner: &Arc<ServerSetInner>, server: usize, message: Value) {
    match message["type"].as_str() {
        Some("transaction") => on_transaction(inner, message),
        Some("ledgerClosed") => on_ledger_closed(inner, message),
        Some("serverStatus") => {
            let _ = inner
                .raw_events
                .send(RawEvent::ServerStatus(Arc::new(message)));
        }
        Some("response") => {
            // 핸드셰이크 구독 응답: 현재 원장 정보가 실려 옴
            if let Some(index) = message["result"]["ledger_index"].as_u64() {
                let mut shared = lock(&inner.shared);
                if shared.ledger_index.map_or(true, |current| index >= current) {
                    shared.ledger_index = Some(index);
                    if let Some(hash) = message["result"]["ledger_hash"].as_str() {
                        shared.ledger_hash = Some(hash.to_string());
                    }
                }
            }
        }
        other => {
            debug!(server, message_type = other.unwrap_or(""), "Unrecognized stream message");
            let _ = inner.raw_events.send(RawEvent::Unknown {
                message_type: other.unwrap_or("").to_string(),
                message: Arc::new(message),
            });
        }
    }
}

fn on_ledger_closed(inner: &Arc<ServerSetInner>, message: Value) {
    let index = message["ledger_index"].as_u64();
    {
        let mut shared = lock(&inner.shared);
        match (index, shared.ledger_index) {
            // 다른 서버가 이미 알린 과거 원장은 무시
            (Some(incoming), Some(current)) if incoming < current => return,
            (Some(incoming), _) => {
                shared.ledger_index = Some(incoming);
                if let Some(hash) = message["ledger_hash"].as_str() {
                    shared.ledger_hash = Some(hash.to_string());
                }
            }
            (None, _) => {}
        }
    }
    let _ = inner
        .raw_events
        .send(RawEvent::LedgerClosed(Arc::new(message)));
}

fn on_transaction(inner: &Arc<ServerSetInner>, message: Value) {
    let hash = match message["transaction"]["hash"].as_str() {
        Some(hash) => hash.to_string(),
        None => {
            debug!("Transaction without hash dropped");
            return;
        }
    };

    let validated = message["validated"].as_bool().unwrap_or(false);

    {
        let mut shared = lock(&inner.shared);
        if shared.seen.contains(&hash) {
            return;
        }
        if !validated {
            debug!(%hash, "Unvalidated transaction skipped");
            return;
        }
        shared.seen.insert(&hash);
    }

    let diff = match LedgerDiff::parse(&message["meta"]) {
        Ok(diff) => diff,
        Err(e) => {
            warn!(%hash, error = %e, "Transaction metadata unusable");
            let _ = inner.raw_events.send(RawEvent::DiffError {
                hash,
                error: e.to_string(),
            });
            return;
        }
    };

    let accounts = diff.affected_accounts();
    let books = diff.affected_books();
    let update = Arc::new(TransactionUpdate {
        message,
        diff,
        received_at: Utc::now(),
    });

    {
        let shared = lock(&inner.shared);
        let mut notified = HashSet::new();
        for subscriber in books
            .iter()
            .filter_map(|book| shared.books.get(book))
            .flatten()
            .chain(
                accounts
                    .iter()
                    .filter_map(|account| shared.accounts.get(account))
                    .flatten(),
            )
        {
            if notified.insert(subscriber.id) {
                let _ = subscriber
                    .tx
                    .send(MirrorSignal::Transaction(update.clone()));
            }
        }
    }

    let _ = inner.raw_events.send(RawEvent::Transaction(update));
}
