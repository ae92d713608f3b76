//! 후보 서버 한 대와의 세션.
//!
//! 세션은 소켓을 소유하는 액터 태스크입니다. 연결/재연결 수명 주기,
//! 요청 id 부여와 응답 디먹싱, 원장 마감 신호 기반 스테일 감지를
//! 담당합니다. 스트림 메시지(응답이 아닌 모든 메시지)는 소유자
//! (`ServerSet`)의 이벤트 채널로 그대로 전달됩니다.

use crate::error::{ClientError, ClientResult};
use crate::transport::{Connector, Transport};
use mirror_core::ConnectionConfig;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// 온라인으로 취급하는 서버 상태.
///
/// 서버가 트랜잭션을 처리하고 변경을 통지할 수 있는 상태여야 합니다.
const ONLINE_STATES: [&str; 5] = ["syncing", "tracking", "proposing", "validating", "full"];

pub(crate) fn is_online_status(status: &str) -> bool {
    ONLINE_STATES.contains(&status)
}

/// 재시도 대기 시간을 반환합니다.
///
/// 처음 약 2초는 빠르게, 이후 약 1분은 1초 간격, 이후 약 10분은
/// 10초 간격, 그 뒤로는 계속 30초 간격입니다.
pub(crate) fn retry_delay(attempt: u32) -> Duration {
    if attempt < 40 {
        Duration::from_millis(50)
    } else if attempt < 100 {
        Duration::from_secs(1)
    } else if attempt < 160 {
        Duration::from_secs(10)
    } else {
        Duration::from_secs(30)
    }
}

/// 세션 수명 주기 상태.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// 생성 후 연결 요청 전
    Idle,
    /// 연결 시도 중
    Connecting,
    /// 핸드셰이크 완료, 요청 가능
    Online,
    /// 연결 끊김 (재시도 대기 포함)
    Offline,
}

/// 세션이 소유자에게 보내는 이벤트.
#[derive(Debug)]
pub(crate) enum SessionEvent {
    Connecting { server: usize },
    Connected { server: usize },
    Disconnected { server: usize },
    Stream { server: usize, message: Value },
}

/// 핸드셰이크 구독 요청 페이로드를 생성하는 훅.
///
/// 소유자가 현재 활성 구독 상태를 반영한 페이로드를 돌려줍니다.
pub(crate) type HandshakeFn = Arc<dyn Fn() -> Value + Send + Sync>;

pub(crate) enum SessionCommand {
    Connect,
    Disconnect,
    Request {
        payload: Value,
        waiter: oneshot::Sender<ClientResult<Value>>,
    },
}

/// 세션 액터에 대한 복제 가능한 핸들.
#[derive(Clone)]
pub struct SessionHandle {
    index: usize,
    endpoint: String,
    preferred: bool,
    commands: mpsc::UnboundedSender<SessionCommand>,
    state: watch::Receiver<SessionState>,
}

impl SessionHandle {
    /// 세션 인덱스를 반환합니다.
    pub fn index(&self) -> usize {
        self.index
    }

    /// 대상 엔드포인트를 반환합니다.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// 우선(primary) 지정 여부를 반환합니다.
    pub fn preferred(&self) -> bool {
        self.preferred
    }

    /// 연결을 시작합니다. 이미 온라인이면 무시됩니다.
    pub fn connect(&self) {
        let _ = self.commands.send(SessionCommand::Connect);
    }

    /// 의도적으로 연결을 해제하고 재시도를 중단합니다.
    pub fn disconnect(&self) {
        let _ = self.commands.send(SessionCommand::Disconnect);
    }

    /// 현재 상태를 반환합니다.
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// 온라인 여부를 반환합니다.
    pub fn is_online(&self) -> bool {
        self.state() == SessionState::Online
    }

    /// 요청을 제출하고 응답을 기다립니다.
    ///
    /// id는 세션이 단조 증가로 부여합니다. 온라인이 아니면 다음 온라인
    /// 전환까지 전송이 유예됩니다 (핸드셰이크 중의 subscribe 요청은
    /// 즉시 전송).
    pub async fn request(&self, payload: Value) -> ClientResult<Value> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(SessionCommand::Request {
                payload,
                waiter: tx,
            })
            .map_err(|_| ClientError::TornDown)?;
        rx.await.map_err(|_| ClientError::TornDown)?
    }
}

/// 세션 액터를 생성하고 핸들을 반환합니다.
pub(crate) fn spawn_session(
    index: usize,
    endpoint: String,
    preferred: bool,
    connector: Arc<dyn Connector>,
    handshake: HandshakeFn,
    events: mpsc::UnboundedSender<SessionEvent>,
    connection: &ConnectionConfig,
) -> SessionHandle {
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (state_tx, state_rx) = watch::channel(SessionState::Idle);

    let core = SessionCore {
        index,
        endpoint: endpoint.clone(),
        connector,
        handshake,
        events,
        state_tx,
        next_id: 1,
        pending: HashMap::new(),
        deferred: Vec::new(),
        outbox: Vec::new(),
        handshake_id: None,
        should_connect: false,
        socket_open: false,
        online: false,
        attempt: 0,
        retry_at: None,
        last_ledger: Instant::now(),
        stale_after: Duration::from_secs(connection.stale_after_secs),
        watchdog_interval: Duration::from_secs(connection.watchdog_interval_secs),
        connect_timeout: Duration::from_secs(connection.connect_timeout_secs),
    };

    tokio::spawn(run(core, command_rx));

    SessionHandle {
        index,
        endpoint,
        preferred,
        commands: command_tx,
        state: state_rx,
    }
}

struct SessionCore {
    index: usize,
    endpoint: String,
    connector: Arc<dyn Connector>,
    handshake: HandshakeFn,
    events: mpsc::UnboundedSender<SessionEvent>,
    state_tx: watch::Sender<SessionState>,
    next_id: u64,
    pending: HashMap<u64, oneshot::Sender<ClientResult<Value>>>,
    /// 다음 온라인 전환까지 유예된 요청 페이로드
    deferred: Vec<Value>,
    /// 전송 대기 중인 프레임 (루프가 소켓으로 비움)
    outbox: Vec<String>,
    handshake_id: Option<u64>,
    should_connect: bool,
    socket_open: bool,
    online: bool,
    attempt: u32,
    retry_at: Option<Instant>,
    last_ledger: Instant,
    stale_after: Duration,
    watchdog_interval: Duration,
    connect_timeout: Duration,
}

/// 소켓 처리 지시.
enum Directive {
    Keep,
    Drop,
}

async fn run(mut core: SessionCore, mut commands: mpsc::UnboundedReceiver<SessionCommand>) {
    let mut ws: Option<Box<dyn Transport>> = None;
    let mut watchdog = tokio::time::interval(core.watchdog_interval);
    watchdog.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        let retry_at = core.retry_at;

        tokio::select! {
            cmd = commands.recv() => {
                match cmd {
                    None => {
                        // 핸들이 모두 drop됨: 해체
                        core.teardown();
                        if let Some(mut transport) = ws.take() {
                            transport.close().await;
                        }
                        return;
                    }
                    Some(SessionCommand::Connect) => {
                        core.should_connect = true;
                        if ws.is_none() && core.retry_at.is_none() {
                            try_connect(&mut core, &mut ws).await;
                        }
                    }
                    Some(SessionCommand::Disconnect) => {
                        core.teardown();
                        if let Some(mut transport) = ws.take() {
                            transport.close().await;
                        }
                    }
                    Some(SessionCommand::Request { payload, waiter }) => {
                        core.handle_request(payload, waiter);
                    }
                }
            }

            incoming = async {
                match ws.as_mut() {
                    Some(transport) => transport.recv().await,
                    None => std::future::pending().await,
                }
            } => {
                match incoming {
                    Some(Ok(text)) => {
                        if let Directive::Drop = core.handle_message(&text) {
                            if let Some(mut transport) = ws.take() {
                                transport.close().await;
                            }
                            core.handle_socket_closed();
                        }
                    }
                    Some(Err(e)) => {
                        debug!(server = core.index, endpoint = %core.endpoint, error = %e,
                            "Socket error");
                        ws = None;
                        core.handle_socket_closed();
                    }
                    None => {
                        debug!(server = core.index, endpoint = %core.endpoint, "Socket closed");
                        ws = None;
                        core.handle_socket_closed();
                    }
                }
            }

            _ = async {
                match retry_at {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            } => {
                core.retry_at = None;
                if core.should_connect && ws.is_none() {
                    try_connect(&mut core, &mut ws).await;
                }
            }

            _ = watchdog.tick() => {
                if core.online && core.last_ledger.elapsed() > core.stale_after {
                    warn!(server = core.index, endpoint = %core.endpoint,
                        "No ledger close observed within watchdog window; forcing reconnect");
                    if let Some(mut transport) = ws.take() {
                        transport.close().await;
                    }
                    core.handle_socket_closed();
                }
            }
        }

        // 누적된 아웃바운드 프레임을 비움. 전송 실패는 소켓 종료로 처리.
        if core.socket_open && !core.outbox.is_empty() {
            let frames = std::mem::take(&mut core.outbox);
            let mut send_failed = false;
            if let Some(transport) = ws.as_mut() {
                for frame in frames {
                    if let Err(e) = transport.send(frame).await {
                        debug!(server = core.index, error = %e, "Send failed");
                        send_failed = true;
                        break;
                    }
                }
            }
            if send_failed {
                if let Some(mut transport) = ws.take() {
                    transport.close().await;
                }
                core.handle_socket_closed();
            }
        }
    }
}

async fn try_connect(core: &mut SessionCore, ws: &mut Option<Box<dyn Transport>>) {
    core.retry_at = None;
    core.set_state(SessionState::Connecting);
    let _ = core.events.send(SessionEvent::Connecting { server: core.index });

    info!(server = core.index, endpoint = %core.endpoint, "Connecting");

    let opened = tokio::time::timeout(
        core.connect_timeout,
        core.connector.connect(&core.endpoint),
    )
    .await;

    match opened {
        Ok(Ok(transport)) => {
            *ws = Some(transport);
            core.socket_open = true;
            // 핸드셰이크: 소유자의 재구독 요청을 먼저 보내고, 성공 응답이
            // 도착해야 온라인으로 전환됩니다.
            let mut payload = (core.handshake)();
            let id = core.assign_id(&mut payload);
            core.handshake_id = Some(id);
            core.outbox.push(payload.to_string());
        }
        Ok(Err(e)) => {
            debug!(server = core.index, endpoint = %core.endpoint, error = %e,
                "Connect failed");
            core.set_state(SessionState::Offline);
            core.schedule_retry();
        }
        Err(_) => {
            debug!(server = core.index, endpoint = %core.endpoint, "Connect timed out");
            core.set_state(SessionState::Offline);
            core.schedule_retry();
        }
    }
}

impl SessionCore {
    fn assign_id(&mut self, payload: &mut Value) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        payload["id"] = Value::from(id);
        id
    }

    fn set_state(&mut self, state: SessionState) {
        let changed = *self.state_tx.borrow() != state;
        if !changed {
            return;
        }
        let _ = self.state_tx.send(state);

        match state {
            SessionState::Online => {
                self.online = true;
                let _ = self.events.send(SessionEvent::Connected { server: self.index });
            }
            SessionState::Offline | SessionState::Idle => {
                if self.online {
                    self.online = false;
                    let _ = self
                        .events
                        .send(SessionEvent::Disconnected { server: self.index });
                }
            }
            SessionState::Connecting => {}
        }
    }

    fn handle_request(&mut self, mut payload: Value, waiter: oneshot::Sender<ClientResult<Value>>) {
        if !payload.is_object() {
            let _ = waiter.send(Err(ClientError::Protocol(
                "request payload must be an object".to_string(),
            )));
            return;
        }
        if !self.should_connect {
            let _ = waiter.send(Err(ClientError::NotConnected(self.endpoint.clone())));
            return;
        }

        let is_subscribe = payload["command"] == "subscribe";
        let id = self.assign_id(&mut payload);
        self.pending.insert(id, waiter);

        if self.online || (is_subscribe && self.socket_open) {
            self.outbox.push(payload.to_string());
        } else {
            self.deferred.push(payload);
        }
    }

    fn handle_message(&mut self, text: &str) -> Directive {
        let mut message: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                debug!(server = self.index, error = %e, "Unparseable frame dropped");
                return Directive::Keep;
            }
        };

        match message["type"].as_str() {
            Some("response") => self.handle_response(&mut message),
            other => {
                if other == Some("ledgerClosed") {
                    self.last_ledger = Instant::now();
                }
                let _ = self.events.send(SessionEvent::Stream {
                    server: self.index,
                    message,
                });
                Directive::Keep
            }
        }
    }

    fn handle_response(&mut self, message: &mut Value) -> Directive {
        let id = match message["id"].as_u64() {
            Some(id) => id,
            None => {
                debug!(server = self.index, "Response without id dropped");
                return Directive::Keep;
            }
        };

        if self.handshake_id == Some(id) {
            return self.handle_handshake_response(message);
        }

        match self.pending.remove(&id) {
            None => {
                // 해체 이후 도착한 늦은 응답일 수 있음
                debug!(server = self.index, id, "Response for unknown request dropped");
            }
            Some(waiter) => {
                let result = if message["status"] == "success" {
                    Ok(message["result"].take())
                } else {
                    Err(remote_error(message))
                };
                let _ = waiter.send(result);
            }
        }
        Directive::Keep
    }

    fn handle_handshake_response(&mut self, message: &mut Value) -> Directive {
        self.handshake_id = None;

        // 거부 또는 비온라인 상태: 소켓을 닫으면 재시도가 예약됨
        if message["status"] != "success" {
            warn!(server = self.index, endpoint = %self.endpoint,
                error = %remote_error(message), "Handshake subscribe rejected");
            return Directive::Drop;
        }

        let status_online = message["result"]["server_status"]
            .as_str()
            .map(is_online_status)
            .unwrap_or(true);

        if !status_online {
            warn!(server = self.index, endpoint = %self.endpoint,
                "Server not in an online state; retrying");
            return Directive::Drop;
        }

        info!(server = self.index, endpoint = %self.endpoint, "Session online");
        self.attempt = 0;
        self.last_ledger = Instant::now();
        self.set_state(SessionState::Online);

        // 핸드셰이크 응답도 구독 상태 스트림 메시지로 전달 (원장 정보 포함)
        let _ = self.events.send(SessionEvent::Stream {
            server: self.index,
            message: message.clone(),
        });

        // 온라인 전환까지 유예된 요청들을 전송
        for payload in std::mem::take(&mut self.deferred) {
            self.outbox.push(payload.to_string());
        }
        Directive::Keep
    }

    /// 소켓 종료 처리: 전송된 요청은 실패시키고, 유예된 요청은 유지.
    fn handle_socket_closed(&mut self) {
        self.socket_open = false;
        self.handshake_id = None;
        self.outbox.clear();

        let deferred_ids: std::collections::HashSet<u64> = self
            .deferred
            .iter()
            .filter_map(|p| p["id"].as_u64())
            .collect();
        let in_flight: Vec<u64> = self
            .pending
            .keys()
            .copied()
            .filter(|id| !deferred_ids.contains(id))
            .collect();
        for id in in_flight {
            if let Some(waiter) = self.pending.remove(&id) {
                let _ = waiter.send(Err(ClientError::Transport(format!(
                    "connection to {} lost",
                    self.endpoint
                ))));
            }
        }

        self.set_state(SessionState::Offline);
        self.schedule_retry();
    }

    fn schedule_retry(&mut self) {
        if !self.should_connect {
            return;
        }
        self.attempt += 1;
        self.retry_at = Some(Instant::now() + retry_delay(self.attempt));
    }

    /// 의도적 해체: 재시도 중단, 대기 중인 요청 전부 실패 처리.
    fn teardown(&mut self) {
        self.should_connect = false;
        self.retry_at = None;
        self.attempt = 0;
        self.handshake_id = None;
        self.socket_open = false;
        self.deferred.clear();
        self.outbox.clear();
        for (_, waiter) in self.pending.drain() {
            let _ = waiter.send(Err(ClientError::NotConnected(self.endpoint.clone())));
        }
        self.set_state(SessionState::Offline);
    }
}

fn remote_error(message: &Value) -> ClientError {
    ClientError::Remote {
        code: message["error"].as_str().unwrap_or("unknown").to_string(),
        message: message["error_message"]
            .as_str()
            .unwrap_or("Remote reported an error.")
            .to_string(),
    }
}
