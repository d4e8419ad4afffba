//! 전송 세션
//!
//! 애플리케이션이 사용하는 공개 표면. 경로 목록, 채널 큐, 수신 버퍼,
//! 경로 전환 제어기를 하나로 묶는다.
//!
//! ## 태스크 구성
//! - 경로마다 수신 태스크 하나: 복호화, 프로브 응답, 수신 버퍼 전달
//! - 드라이버 태스크 하나: 제어기, 송신 시퀀스, 핸드쉐이크/프로브/ACK/재전송 타이머를 단독 소유
//!
//! 모든 태스크는 `CancellationToken` 하나로 취소된다.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chunk::{TransferBuilder, TransferKind};
use crate::crypto::{respond, PairingSecret, PendingHandshake, Role};
use crate::event::{now_us, ChannelId, EventPayload};
use crate::failover::{
    FailoverAction, FailoverController, FailoverSettings, FailureReason, PathView, SessionState,
};
use crate::frame::Frame;
use crate::health::{HealthThresholds, PathStatus};
use crate::message::{AckMessage, CloseReason, ControlMessage, HelloAckMessage, HelloMessage, RetransmitRequest};
use crate::multipath::{Path, PathId, PathLink, PathManager, PathSnapshot};
use crate::policy::ChannelPolicySet;
use crate::queue::{ChannelQueue, PushOutcome, QueuedEvent};
use crate::receiver::Inbound;
use crate::sender::Outbound;
use crate::sink::{EventSink, EventSource};
use crate::stats::{SessionStats, StatsCounters};
use crate::{Config, Error, Result};

/// close() 시 드라이버 종료 대기 한도
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// initiator의 진행 중인 핸드쉐이크
struct HandshakeAttempt {
    pending: PendingHandshake,
    started: Instant,
    last_sent: Instant,
}

/// responder가 마지막으로 보낸 HelloAck (재전송된 Hello에 그대로 응답)
struct CachedAck {
    hello_mac: [u8; 32],
    ack: HelloAckMessage,
}

/// 수신 태스크 → 드라이버
#[derive(Debug)]
enum DriverEvent {
    Ack { path: PathId, acks: Vec<(ChannelId, u64)> },
    Retransmit { path: PathId, request: RetransmitRequest },
    PeerClosed { path: PathId, reason: CloseReason },
    Close,
}

/// 태스크 간 공유 상태
struct SessionShared {
    config: Config,
    role: Role,
    session_id: Mutex<Option<u64>>,
    psk: PairingSecret,
    paths: PathManager,
    queues: [ChannelQueue<QueuedEvent>; 3],
    wake: Arc<Notify>,
    inbound: Inbound,
    stats: Arc<StatsCounters>,
    handshakes: Vec<Mutex<Option<HandshakeAttempt>>>,
    cached_acks: Vec<Mutex<Option<CachedAck>>>,
    events: mpsc::UnboundedSender<DriverEvent>,
    /// 제어기 상태 (드라이버만 기록)
    state: watch::Sender<SessionState>,
    cancel: CancellationToken,
}

impl SessionShared {
    fn session_id(&self) -> u64 {
        self.session_id.lock().unwrap_or(0)
    }

    fn current_state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// 큐 닫힘 등 세션 종료 후 호출자에게 돌려줄 에러
    fn terminal_error(&self) -> Error {
        match self.current_state() {
            SessionState::Failed(FailureReason::Disconnected) => Error::SessionClosed,
            SessionState::Failed(reason) => Error::SessionFailed(reason),
            _ => Error::SessionClosed,
        }
    }

    fn queue(&self, channel: ChannelId) -> Result<&ChannelQueue<QueuedEvent>> {
        self.queues
            .get(channel.index())
            .ok_or(Error::QueueClosed(channel))
    }

    fn count_drop(&self, outcome: PushOutcome) {
        if outcome != PushOutcome::Enqueued {
            StatsCounters::inc(&self.stats.queue_drops);
        }
    }

    async fn enqueue(&self, payload: EventPayload) -> Result<PushOutcome> {
        let queue = self.queue(payload.channel())?;
        let item = QueuedEvent {
            timestamp_us: now_us(),
            payload,
        };
        let outcome = queue.push(item).await.map_err(|_| self.terminal_error())?;
        self.count_drop(outcome);
        Ok(outcome)
    }

    fn try_enqueue(&self, payload: EventPayload) -> Result<PushOutcome> {
        let queue = self.queue(payload.channel())?;
        let item = QueuedEvent {
            timestamp_us: now_us(),
            payload,
        };
        let outcome = queue.try_push(item).map_err(|_| self.terminal_error())?;
        self.count_drop(outcome);
        Ok(outcome)
    }

    fn record_sent(&self, bytes: usize) {
        StatsCounters::inc(&self.stats.frames_sent);
        StatsCounters::add(&self.stats.bytes_sent, bytes as u64);
    }

    /// 봉인된 데이터 프레임 전송. 실패는 경로 상태 감시에 맡긴다.
    async fn send_frame(&self, id: PathId, frame: &Frame) {
        let Some(path) = self.paths.get(id) else {
            return;
        };
        match path.send_sealed(frame).await {
            Ok(sent) => self.record_sent(sent),
            Err(e) => debug!("{} 전송 실패: {}", id, e),
        }
    }

    async fn send_control(&self, path: &Path, msg: &ControlMessage) -> Result<()> {
        let frame = Frame::from_control(msg, 0, path.next_control_seq())?;
        let sent = path.send_sealed(&frame).await?;
        self.record_sent(sent);
        Ok(())
    }

    /// 평문 핸드쉐이크 메시지 전송
    async fn send_handshake(&self, path: &Path, msg: &ControlMessage, epoch: u32) -> Result<()> {
        let frame = Frame::from_control(msg, epoch, 0)?;
        let sent = path.send_plain(&frame).await?;
        self.record_sent(sent);
        Ok(())
    }

    fn notify_driver(&self, event: DriverEvent) {
        if self.events.send(event).is_err() {
            debug!("드라이버 종료됨, 이벤트 버림");
        }
    }

    /// 모든 대기 취소, 큐 닫기
    fn shutdown(&self) {
        self.cancel.cancel();
        for queue in &self.queues {
            queue.close();
        }
    }

    async fn on_datagram(&self, path: &Path, datagram: Bytes, from: Option<SocketAddr>) {
        let now = Instant::now();
        let frame = match Frame::from_bytes(&datagram) {
            Ok(frame) => frame,
            Err(e) => {
                StatsCounters::inc(&self.stats.malformed);
                debug!("{} {}", path.id(), e);
                return;
            }
        };

        if frame.header.frame_type.is_handshake() {
            match self.on_handshake(path, &frame, from, now).await {
                Ok(()) => {}
                Err(e @ Error::MalformedFrame(_)) => {
                    StatsCounters::inc(&self.stats.malformed);
                    debug!("{} {}", path.id(), e);
                }
                Err(e) => warn!("{} 핸드쉐이크 거부: {}", path.id(), e),
            }
            return;
        }

        let plain = match path.open(&frame) {
            Ok(plain) => plain,
            Err(e) => {
                self.on_open_error(path, e);
                return;
            }
        };
        StatsCounters::inc(&self.stats.frames_received);
        StatsCounters::add(&self.stats.bytes_received, datagram.len() as u64);
        path.with_health(|health| health.on_activity(now));

        let result = if plain.header.channel == ChannelId::Control {
            self.on_control(path, &plain, now).await
        } else {
            plain.decode_event().map(|event| {
                self.inbound.ingest(event, now);
                path.mark_ack_pending();
            })
        };

        match result {
            Ok(()) => {}
            Err(e @ Error::MalformedFrame(_)) => {
                StatsCounters::inc(&self.stats.malformed);
                debug!("{} {}", path.id(), e);
            }
            Err(e) => debug!("{} 제어 응답 실패: {}", path.id(), e),
        }
    }

    fn on_open_error(&self, path: &Path, error: Error) {
        match error {
            Error::StaleEpoch { .. } => {
                StatsCounters::inc(&self.stats.stale_epoch);
                debug!("{} {}", path.id(), error);
            }
            Error::ReplayedFrame { channel, .. } => {
                StatsCounters::inc(&self.stats.replays_rejected);
                // 이미 받은 데이터 프레임이 다시 오면 ACK도 다시 보냄
                if matches!(channel, ChannelId::Input | ChannelId::Transfer) {
                    path.mark_ack_pending();
                }
                debug!("{} {}", path.id(), error);
            }
            Error::IntegrityViolation { .. } => {
                StatsCounters::inc(&self.stats.integrity_violations);
                path.with_health(|health| health.on_integrity_violation());
                warn!("{} {}", path.id(), error);
            }
            other => debug!("{} 복호화 실패: {}", path.id(), other),
        }
    }

    async fn on_control(&self, path: &Path, plain: &Frame, now: Instant) -> Result<()> {
        match plain.decode_control()? {
            ControlMessage::Probe(probe) => {
                self.send_control(path, &ControlMessage::ProbeAck(probe)).await
            }
            ControlMessage::ProbeAck(probe) => {
                path.with_health(|health| health.on_probe_ack(&probe, now));
                Ok(())
            }
            ControlMessage::Ack(ack) => {
                self.notify_driver(DriverEvent::Ack {
                    path: path.id(),
                    acks: ack.acks,
                });
                Ok(())
            }
            ControlMessage::RetransmitRequest(request) => {
                self.notify_driver(DriverEvent::Retransmit {
                    path: path.id(),
                    request,
                });
                Ok(())
            }
            ControlMessage::Close(reason) => {
                self.notify_driver(DriverEvent::PeerClosed {
                    path: path.id(),
                    reason,
                });
                Ok(())
            }
            ControlMessage::Hello(_) | ControlMessage::HelloAck(_) => Err(Error::MalformedFrame(
                "봉인된 핸드쉐이크 메시지".into(),
            )),
        }
    }

    async fn on_handshake(
        &self,
        path: &Path,
        frame: &Frame,
        from: Option<SocketAddr>,
        now: Instant,
    ) -> Result<()> {
        match (self.role, frame.decode_control()?) {
            (Role::Responder, ControlMessage::Hello(hello)) => self.on_hello(path, hello, from, now).await,
            (Role::Initiator, ControlMessage::HelloAck(ack)) => self.on_hello_ack(path, &ack, now),
            (_, msg) => {
                debug!("{} 역할에 맞지 않는 핸드쉐이크 무시: {:?}", path.id(), msg.frame_type());
                Ok(())
            }
        }
    }

    async fn on_hello(
        &self,
        path: &Path,
        hello: HelloMessage,
        from: Option<SocketAddr>,
        now: Instant,
    ) -> Result<()> {
        if hello.path_id != path.id().0 {
            return Err(Error::HandshakeFailed(format!(
                "경로 번호 불일치: hello={}, local={}",
                hello.path_id,
                path.id()
            )));
        }
        let idx = path.id().index();

        // 응답을 잃은 initiator의 재전송
        let cached = self.cached_acks[idx]
            .lock()
            .as_ref()
            .filter(|cached| cached.hello_mac == hello.mac)
            .map(|cached| cached.ack.clone());
        if let Some(ack) = cached {
            debug!("{} 재전송된 Hello, 이전 응답 재송신", path.id());
            return self
                .send_handshake(path, &ControlMessage::HelloAck(ack), hello.path_epoch)
                .await;
        }

        if !path.accepts_epoch(hello.path_epoch) {
            debug!("{} 만료된 epoch의 Hello 무시: {}", path.id(), hello.path_epoch);
            return Ok(());
        }

        let (channel, ack) = respond(&self.psk, &hello)?;
        {
            let mut session = self.session_id.lock();
            match *session {
                Some(id) if id != hello.session_id => {
                    return Err(Error::HandshakeFailed(format!(
                        "다른 세션의 Hello: {:016x}",
                        hello.session_id
                    )))
                }
                _ => *session = Some(hello.session_id),
            }
        }

        // 인증된 Hello의 송신 주소로 상대 주소 학습
        if let Some(addr) = from {
            path.transport().set_peer(addr);
        }

        let epoch = channel.path_epoch();
        path.install(channel, now);
        *self.cached_acks[idx].lock() = Some(CachedAck {
            hello_mac: hello.mac,
            ack: ack.clone(),
        });
        info!("{} 보안 채널 수립 (epoch {}, responder)", path.id(), epoch);

        self.send_handshake(path, &ControlMessage::HelloAck(ack), epoch)
            .await
    }

    fn on_hello_ack(&self, path: &Path, ack: &HelloAckMessage, now: Instant) -> Result<()> {
        let mut slot = self.handshakes[path.id().index()].lock();
        let Some(attempt) = slot.as_ref() else {
            debug!("{} 대기 중인 핸드쉐이크 없음, HelloAck 무시", path.id());
            return Ok(());
        };
        if attempt.pending.path_epoch() != ack.path_epoch {
            debug!(
                "{} 이전 시도의 HelloAck 무시: epoch {} (현재 {})",
                path.id(),
                ack.path_epoch,
                attempt.pending.path_epoch()
            );
            return Ok(());
        }

        let channel = attempt.pending.finish(ack)?;
        *slot = None;
        drop(slot);

        let epoch = channel.path_epoch();
        path.install(channel, now);
        info!("{} 보안 채널 수립 (epoch {}, initiator)", path.id(), epoch);
        Ok(())
    }
}

/// 경로 수신 루프
async fn recv_loop(shared: Arc<SessionShared>, path: Arc<Path>) {
    loop {
        let received = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            received = path.transport().recv() => received,
        };

        match received {
            Ok((datagram, from)) => shared.on_datagram(&path, datagram, from).await,
            Err(Error::ChannelError) => {
                debug!("{} 전송 계층 닫힘", path.id());
                break;
            }
            Err(e) => {
                debug!("{} 수신 에러: {}", path.id(), e);
                tokio::time::sleep(shared.config.driver_tick()).await;
            }
        }
    }
    debug!("{} 수신 태스크 종료", path.id());
}

enum Step {
    Event(DriverEvent),
    Pump,
    Tick,
}

/// 드라이버 태스크 상태
struct Driver {
    shared: Arc<SessionShared>,
    controller: FailoverController,
    outbound: Outbound,
    events: mpsc::UnboundedReceiver<DriverEvent>,
    last_ack_at: Instant,
    /// 경로별 마지막 핸드쉐이크 시작 시각
    last_attempt: Vec<Option<Instant>>,
}

impl Driver {
    async fn run(mut self) {
        let shared = self.shared.clone();
        let mut tick = tokio::time::interval(shared.config.driver_tick());
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let step = tokio::select! {
                _ = shared.cancel.cancelled() => break,
                event = self.events.recv() => match event {
                    Some(event) => Step::Event(event),
                    None => break,
                },
                _ = shared.wake.notified() => Step::Pump,
                _ = tick.tick() => Step::Tick,
            };

            let now = Instant::now();
            match step {
                Step::Event(event) => self.on_event(event, now).await,
                Step::Pump => self.pump(now).await,
                Step::Tick => self.on_tick(now).await,
            }

            if self.controller.state().is_failed() {
                break;
            }
        }

        if self.controller.fail(FailureReason::Disconnected).is_some() {
            self.publish();
        }
        shared.shutdown();
        info!("세션 종료 ({:?}): {}", self.controller.state(), shared.stats.snapshot().summary());
    }

    fn publish(&self) {
        let state = self.controller.state();
        self.shared.state.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            *current = state;
            true
        });
    }

    async fn on_tick(&mut self, now: Instant) {
        if self.shared.role == Role::Initiator {
            self.drive_handshakes(now).await;
        }
        self.probe_paths(now).await;

        let views = self.path_views(now);
        if let Some(action) = self.controller.tick(now, &views) {
            self.apply(action, now).await;
        }
        if self.controller.state().is_failed() {
            return;
        }

        self.poll_reorder(now).await;
        self.send_acks(now).await;
        self.retransmit(now).await;
        self.pump(now).await;
    }

    async fn on_event(&mut self, event: DriverEvent, now: Instant) {
        match event {
            DriverEvent::Ack { path, acks } => {
                for (channel, next_expected) in acks {
                    self.outbound.on_ack(channel, next_expected);
                }
                if let Some(action) = self.controller.on_reception_confirmed(path) {
                    self.apply(action, now).await;
                }
                // 송신 윈도우가 열렸을 수 있음
                self.pump(now).await;
            }
            DriverEvent::Retransmit { path, request } => {
                let frames = self.outbound.on_retransmit_request(&request, now);
                if frames.is_empty() {
                    return;
                }
                debug!("{} 재전송 요청 처리: {}개", path, frames.len());
                StatsCounters::add(&self.shared.stats.retransmissions, frames.len() as u64);
                for frame in &frames {
                    self.shared.send_frame(path, frame).await;
                }
            }
            DriverEvent::PeerClosed { path, reason } => {
                info!("{} 상대 종료 수신: {:?}", path, reason);
                if let Some(action) = self.controller.fail(FailureReason::PeerClosed) {
                    self.apply(action, now).await;
                }
            }
            DriverEvent::Close => {
                self.broadcast_close(CloseReason::UserDisconnect).await;
                if let Some(action) = self.controller.fail(FailureReason::Disconnected) {
                    self.apply(action, now).await;
                }
            }
        }
    }

    async fn apply(&mut self, action: FailoverAction, now: Instant) {
        let shared = self.shared.clone();
        match action {
            FailoverAction::Activate(_) | FailoverAction::AbortSwitch { .. } => {}
            FailoverAction::BeginSwitch { to, .. } => {
                StatsCounters::inc(&shared.stats.switches);
                let replay = self.outbound.switch_replay(now);
                if !replay.is_empty() {
                    info!("{} 로 미확인 프레임 {}개 재송신", to, replay.len());
                    StatsCounters::add(&shared.stats.switch_replays, replay.len() as u64);
                }
                for frame in &replay {
                    shared.send_frame(to, frame).await;
                }
            }
            FailoverAction::CompleteSwitch { retired, .. } => {
                // 폐기한 경로는 다음 수립 때 새 epoch를 받는다
                if shared.role == Role::Initiator {
                    if let Some(path) = shared.paths.get(retired) {
                        path.retire();
                    }
                }
            }
            FailoverAction::Fail(reason) => {
                warn!("{}", Error::SessionFailed(reason));
                if reason == FailureReason::AllPathsExhausted {
                    self.broadcast_close(CloseReason::SessionFailed).await;
                }
            }
        }
        self.publish();
    }

    fn path_views(&self, now: Instant) -> Vec<PathView> {
        self.shared
            .paths
            .iter()
            .map(|path| {
                let (status, healthy_for) =
                    path.with_health(|health| (health.status(), health.healthy_for(now)));
                PathView {
                    id: path.id(),
                    role: path.role(),
                    established: path.is_established(),
                    status,
                    healthy_for,
                }
            })
            .collect()
    }

    /// initiator: Hello 전송/재전송, 응답 없는 시도 정리, 끊긴 경로 재수립
    async fn drive_handshakes(&mut self, now: Instant) {
        let shared = self.shared.clone();
        let retry = Duration::from_millis(shared.config.handshake_retry_ms);
        let timeout = shared.config.handshake_timeout();
        let interval = Duration::from_millis(shared.config.rehandshake_interval_ms);

        for path in shared.paths.iter() {
            let idx = path.id().index();
            let hello = {
                let mut slot = shared.handshakes[idx].lock();
                let expired = slot
                    .as_ref()
                    .filter(|attempt| now.saturating_duration_since(attempt.started) >= timeout)
                    .map(|attempt| attempt.pending.path_epoch());
                if let Some(epoch) = expired {
                    warn!(
                        "{}",
                        Error::HandshakeFailed(format!("{} 응답 없음 (epoch {})", path.id(), epoch))
                    );
                    *slot = None;
                }

                match slot.as_mut() {
                    Some(attempt) if now.saturating_duration_since(attempt.last_sent) >= retry => {
                        attempt.last_sent = now;
                        Some(attempt.pending.hello().clone())
                    }
                    Some(_) => None,
                    None if self.handshake_due(path, now, interval) => {
                        let epoch = path.next_epoch();
                        let pending = PendingHandshake::initiate(
                            &shared.psk,
                            shared.session_id(),
                            path.id().0,
                            epoch,
                        );
                        let hello = pending.hello().clone();
                        *slot = Some(HandshakeAttempt {
                            pending,
                            started: now,
                            last_sent: now,
                        });
                        self.last_attempt[idx] = Some(now);
                        debug!("{} 핸드쉐이크 시작 (epoch {})", path.id(), epoch);
                        Some(hello)
                    }
                    None => None,
                }
            };

            if let Some(hello) = hello {
                let epoch = hello.path_epoch;
                if let Err(e) = shared
                    .send_handshake(path, &ControlMessage::Hello(hello), epoch)
                    .await
                {
                    debug!("{} Hello 전송 실패: {}", path.id(), e);
                }
            }
        }
    }

    /// 수립되지 않았거나 끊긴 경로이고 마지막 시도 후 재수립 간격이 지났는지
    fn handshake_due(&self, path: &Path, now: Instant, interval: Duration) -> bool {
        let needed = !path.is_established() || path.status() == PathStatus::Dead;
        let due = self.last_attempt[path.id().index()]
            .map_or(true, |last| now.saturating_duration_since(last) >= interval);
        needed && due
    }

    async fn probe_paths(&mut self, now: Instant) {
        let shared = self.shared.clone();
        for path in shared.paths.iter().filter(|p| p.is_established()) {
            let (change, probe) = path.with_health(|health| {
                let change = health.evaluate(now);
                (change, health.due_probe(now, now_us()))
            });

            if let Some(change) = change {
                match change.to {
                    PathStatus::Healthy => info!("{} 상태: {:?} -> Healthy", path.id(), change.from),
                    _ => warn!("{} 상태: {:?} -> {:?}", path.id(), change.from, change.to),
                }
            }
            if let Some(probe) = probe {
                if let Err(e) = shared.send_control(path, &ControlMessage::Probe(probe)).await {
                    debug!("{} 프로브 전송 실패: {}", path.id(), e);
                }
            }
        }
    }

    async fn poll_reorder(&mut self, now: Instant) {
        let requests = self.shared.inbound.poll(now);
        let Some(&target) = self.controller.send_targets().first() else {
            return;
        };
        let Some(path) = self.shared.paths.get(target) else {
            return;
        };

        for request in requests {
            StatsCounters::inc(&self.shared.stats.retransmit_requests);
            debug!("재전송 요청: {:?} {}개", request.channel, request.missing.len());
            if let Err(e) = self
                .shared
                .send_control(path, &ControlMessage::RetransmitRequest(request))
                .await
            {
                debug!("{} 재전송 요청 실패: {}", target, e);
            }
        }
    }

    /// 데이터를 받은 경로마다 누적 ACK 전송
    async fn send_acks(&mut self, now: Instant) {
        let interval = Duration::from_millis(self.shared.config.ack_interval_ms);
        if now.saturating_duration_since(self.last_ack_at) < interval {
            return;
        }
        self.last_ack_at = now;

        let shared = self.shared.clone();
        let mut acks = None;
        for path in shared.paths.iter() {
            if !path.is_established() || !path.take_ack_pending() {
                continue;
            }
            let acks = acks.get_or_insert_with(|| shared.inbound.ack_snapshot()).clone();
            if let Err(e) = shared
                .send_control(path, &ControlMessage::Ack(AckMessage { acks }))
                .await
            {
                debug!("{} ACK 전송 실패: {}", path.id(), e);
            }
        }
    }

    async fn retransmit(&mut self, now: Instant) {
        let frames = self.outbound.due_retransmits(now);
        if frames.is_empty() {
            return;
        }
        StatsCounters::add(&self.shared.stats.retransmissions, frames.len() as u64);
        debug!("재전송 타임아웃: {}개", frames.len());

        for target in self.controller.send_targets() {
            for frame in &frames {
                self.shared.send_frame(target, frame).await;
            }
        }
    }

    /// 큐에서 꺼내 시퀀스 부여 후 전송 (Input → Audio → Transfer 순)
    async fn pump(&mut self, now: Instant) {
        if !self.controller.state().is_connected() {
            return;
        }
        let shared = self.shared.clone();
        let targets = self.controller.send_targets();

        for channel in [ChannelId::Input, ChannelId::Audio, ChannelId::Transfer] {
            let Ok(queue) = shared.queue(channel) else {
                continue;
            };
            while self.outbound.can_send(channel) {
                let Some(item) = queue.pop() else {
                    break;
                };
                match self.outbound.sequence(item, now) {
                    Ok(frame) => {
                        for target in &targets {
                            shared.send_frame(*target, &frame).await;
                        }
                    }
                    Err(e) => warn!("이벤트 인코딩 실패: {}", e),
                }
            }
        }
    }

    async fn broadcast_close(&self, reason: CloseReason) {
        for path in self.shared.paths.iter().filter(|p| p.is_established()) {
            if let Err(e) = self
                .shared
                .send_control(path, &ControlMessage::Close(reason))
                .await
            {
                debug!("{} 종료 알림 실패: {}", path.id(), e);
            }
        }
    }
}

/// 전송 세션
///
/// `connect`(initiator) 또는 `accept`(responder)로 생성한다. 양쪽의 경로 목록은
/// 같은 순서여야 한다 (경로 번호가 핸드쉐이크에 포함됨).
pub struct TransportSession {
    shared: Arc<SessionShared>,
    driver: Mutex<Option<JoinHandle<()>>>,
    receivers: Mutex<Vec<JoinHandle<()>>>,
}

impl TransportSession {
    /// 상대에 연결하고 경로가 활성화될 때까지 대기
    ///
    /// 수립 제한 시간 안에 활성화되지 않으면 `HandshakeFailed`.
    pub async fn connect(
        config: Config,
        links: Vec<PathLink>,
        sink: Arc<dyn EventSink>,
    ) -> Result<Self> {
        let session_id = rand::random::<u64>();
        let session = Self::start(config, Role::Initiator, links, sink, Some(session_id))?;
        info!("세션 {:016x} 연결 시작", session_id);
        session.wait_connected().await?;
        Ok(session)
    }

    /// 상대의 Hello를 기다려 세션 수립
    ///
    /// `accept_timeout_ms` 안에 유효한 Hello가 없으면 `Timeout`.
    pub async fn accept(
        config: Config,
        links: Vec<PathLink>,
        sink: Arc<dyn EventSink>,
    ) -> Result<Self> {
        let limit = Duration::from_millis(config.accept_timeout_ms);
        let session = Self::start(config, Role::Responder, links, sink, None)?;
        info!("연결 대기 중 ({}개 경로)", session.shared.paths.len());
        match tokio::time::timeout(limit, session.wait_connected()).await {
            Ok(result) => result?,
            Err(_) => return Err(Error::Timeout("accept")),
        }
        Ok(session)
    }

    fn start(
        config: Config,
        role: Role,
        links: Vec<PathLink>,
        sink: Arc<dyn EventSink>,
        session_id: Option<u64>,
    ) -> Result<Self> {
        config.validate()?;
        let now = Instant::now();

        let policies = ChannelPolicySet::from_config(&config);
        let paths = PathManager::new(links, HealthThresholds::from_config(&config), now)?;
        let stats = Arc::new(StatsCounters::new());
        let wake = Arc::new(Notify::new());
        let queue = |channel| ChannelQueue::new(policies.get(channel), wake.clone());
        let queues = [
            queue(ChannelId::Input),
            queue(ChannelId::Transfer),
            queue(ChannelId::Audio),
        ];

        let mut settings = FailoverSettings::from_config(&config);
        if role == Role::Responder {
            // 먼저 수립된 경로로 시작하고 기본 경로는 failback으로 복귀
            settings.establish_timeout = Some(Duration::ZERO);
            settings.establish_deadline = Duration::from_millis(config.accept_timeout_ms);
        }
        let controller = FailoverController::new(settings, paths.primary(), now);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(SessionState::Establishing);
        let path_count = paths.len();

        let shared = Arc::new(SessionShared {
            role,
            session_id: Mutex::new(session_id),
            psk: PairingSecret::derive(&config.pairing_secret),
            inbound: Inbound::new(&policies, sink, stats.clone()),
            handshakes: (0..path_count).map(|_| Mutex::new(None)).collect(),
            cached_acks: (0..path_count).map(|_| Mutex::new(None)).collect(),
            events: events_tx,
            state: state_tx,
            cancel: CancellationToken::new(),
            config,
            paths,
            queues,
            wake,
            stats,
        });

        let receivers = shared
            .paths
            .iter()
            .map(|path| tokio::spawn(recv_loop(shared.clone(), path.clone())))
            .collect();

        let driver = Driver {
            shared: shared.clone(),
            controller,
            outbound: Outbound::new(policies),
            events: events_rx,
            last_ack_at: now,
            last_attempt: vec![None; path_count],
        };
        let driver = tokio::spawn(driver.run());

        Ok(Self {
            shared,
            driver: Mutex::new(Some(driver)),
            receivers: Mutex::new(receivers),
        })
    }

    async fn wait_connected(&self) -> Result<()> {
        let mut state = self.shared.state.subscribe();
        loop {
            let current = *state.borrow_and_update();
            match current {
                SessionState::Failed(FailureReason::HandshakeFailed) => {
                    return Err(Error::HandshakeFailed("수립 제한 시간 초과".into()))
                }
                SessionState::Failed(reason) => return Err(Error::SessionFailed(reason)),
                s if s.is_connected() => return Ok(()),
                _ => {}
            }
            if state.changed().await.is_err() {
                return Err(Error::SessionClosed);
            }
        }
    }

    /// 이벤트 전송 요청. Input/Transfer 큐가 가득하면 잠시 대기한다.
    pub async fn send(&self, payload: EventPayload) -> Result<PushOutcome> {
        self.shared.enqueue(payload).await
    }

    /// 대기 없이 전송 요청
    pub fn try_send(&self, payload: EventPayload) -> Result<PushOutcome> {
        self.shared.try_enqueue(payload)
    }

    /// 클립보드 데이터 전송. 전송 ID 반환.
    pub async fn send_clipboard(&self, data: &[u8]) -> Result<u64> {
        self.send_transfer(TransferKind::Clipboard, None, data).await
    }

    /// 파일 전송. 전송 ID 반환.
    pub async fn send_file(&self, name: &str, data: &[u8]) -> Result<u64> {
        self.send_transfer(TransferKind::File, Some(name.to_string()), data)
            .await
    }

    async fn send_transfer(
        &self,
        kind: TransferKind,
        name: Option<String>,
        data: &[u8],
    ) -> Result<u64> {
        let config = &self.shared.config;
        let builder = TransferBuilder::new(config.transfer_chunk_size, config.max_transfer_size);
        let transfer_id = rand::random::<u64>();
        let payloads = builder.split(transfer_id, kind, name, data)?;
        let chunks = payloads.len();

        // 조각은 버리지 않는다
        let queue = self.shared.queue(ChannelId::Transfer)?;
        for payload in payloads {
            let item = QueuedEvent {
                timestamp_us: now_us(),
                payload,
            };
            queue
                .push_wait(item)
                .await
                .map_err(|_| self.shared.terminal_error())?;
        }

        debug!(
            "전송 {:016x} 대기열 추가: {:?} {} bytes, {}개 조각",
            transfer_id,
            kind,
            data.len(),
            chunks
        );
        Ok(transfer_id)
    }

    /// 캡처 생산자 연결. 생산자가 끝나거나 세션이 종료되면 태스크도 끝난다.
    pub fn attach_source<S>(&self, mut source: S) -> JoinHandle<()>
    where
        S: EventSource + 'static,
    {
        let shared = self.shared.clone();
        tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    _ = shared.cancel.cancelled() => break,
                    next = source.next_event() => next,
                };
                let Some(payload) = next else {
                    break;
                };
                if let Err(e) = shared.enqueue(payload).await {
                    debug!("생산자 연결 종료: {}", e);
                    break;
                }
            }
        })
    }

    pub fn state(&self) -> SessionState {
        self.shared.current_state()
    }

    /// 상태 변화 구독
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.shared.state.subscribe()
    }

    /// 현재 송신 경로 (전환 중이면 전환 대상)
    pub fn active_path(&self) -> Option<PathId> {
        match self.state() {
            SessionState::Active(path) => Some(path),
            SessionState::Switching { to, .. } => Some(to),
            _ => None,
        }
    }

    pub fn role(&self) -> Role {
        self.shared.role
    }

    pub fn session_id(&self) -> Option<u64> {
        *self.shared.session_id.lock()
    }

    /// 경로별 상태
    pub fn paths(&self) -> Vec<PathSnapshot> {
        self.shared.paths.snapshots(Instant::now())
    }

    pub fn stats(&self) -> SessionStats {
        self.shared.stats.snapshot()
    }

    /// 채널 큐에 대기 중인 이벤트 수
    pub fn queued(&self, channel: ChannelId) -> usize {
        self.shared.queue(channel).map_or(0, |queue| queue.len())
    }

    /// 상대에 종료를 알리고 모든 태스크 정리
    pub async fn close(&self) -> Result<()> {
        self.shared.notify_driver(DriverEvent::Close);

        let driver = self.driver.lock().take();
        if let Some(driver) = driver {
            if tokio::time::timeout(CLOSE_GRACE, driver).await.is_err() {
                warn!("드라이버 종료 대기 시간 초과");
            }
        }
        self.shared.shutdown();

        let receivers: Vec<JoinHandle<()>> = self.receivers.lock().drain(..).collect();
        for receiver in receivers {
            let _ = receiver.await;
        }
        Ok(())
    }
}

impl Drop for TransportSession {
    fn drop(&mut self) {
        self.shared.shutdown();
    }
}
