//! 경로 전환 제어기
//!
//! 활성 경로를 정하는 유일한 주체. 부수효과 없는 상태 기계로, 드라이버가 경로 상태
//! 스냅샷과 현재 시각을 넣으면 수행할 동작을 돌려준다.
//!
//! ```text
//! Establishing ──▶ Active(p) ──▶ Switching(p, q) ──▶ Active(q)
//!       │              │                │
//!       └──────────────┴────────────────┴──▶ Failed
//! ```

use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::health::PathStatus;
use crate::multipath::{PathId, PathRole};
use crate::{Config, Error};

/// 세션 실패 사유
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    /// 사용 가능한 경로가 terminal_timeout 동안 없음
    AllPathsExhausted,

    /// 로컬 사용자 종료
    Disconnected,

    /// 상대가 종료를 알림
    PeerClosed,

    /// 어떤 경로도 핸드쉐이크를 완료하지 못함
    HandshakeFailed,
}

/// 세션 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Establishing,
    Active(PathId),
    Switching { from: PathId, to: PathId },
    Failed(FailureReason),
}

impl SessionState {
    pub fn is_failed(&self) -> bool {
        matches!(self, SessionState::Failed(_))
    }

    /// 데이터를 보낼 수 있는 상태인지
    pub fn is_connected(&self) -> bool {
        matches!(self, SessionState::Active(_) | SessionState::Switching { .. })
    }
}

/// 제어기가 요청하는 동작
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailoverAction {
    /// 첫 활성 경로 지정
    Activate(PathId),

    /// 이중 송신 시작
    BeginSwitch { from: PathId, to: PathId },

    /// 전환 완료, 이전 경로 폐기
    CompleteSwitch { retired: PathId, active: PathId },

    /// 전환 대상이 사라져 원래 경로로 복귀
    AbortSwitch { from: PathId, to: PathId },

    /// 세션 종료
    Fail(FailureReason),
}

/// 제어기에 전달하는 경로 상태
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PathView {
    pub id: PathId,
    pub role: PathRole,
    pub established: bool,
    pub status: PathStatus,
    /// 연속 Healthy 유지 시간 (Healthy가 아니면 None)
    pub healthy_for: Option<Duration>,
}

impl PathView {
    /// 데이터를 실을 수 있는 경로 (Degraded 포함)
    fn reachable(&self) -> bool {
        self.established && self.status != PathStatus::Dead
    }

    fn healthy(&self) -> bool {
        self.established && self.status == PathStatus::Healthy
    }
}

/// 전환 정책 값
#[derive(Debug, Clone)]
pub struct FailoverSettings {
    pub min_dwell: Duration,
    pub overlap_window: Duration,
    pub terminal_timeout: Duration,
    /// 기본 경로를 기다리는 시간. None이면 기본 경로만 기다림.
    pub establish_timeout: Option<Duration>,
    /// 수립 단계 전체 제한. 초과하면 HandshakeFailed.
    pub establish_deadline: Duration,
    pub failback: bool,
}

impl FailoverSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            min_dwell: Duration::from_millis(config.min_dwell_ms),
            overlap_window: Duration::from_millis(config.overlap_window_ms),
            terminal_timeout: Duration::from_millis(config.terminal_timeout_ms),
            establish_timeout: Some(Duration::from_millis(config.establish_timeout_ms)),
            establish_deadline: Duration::from_millis(config.terminal_timeout_ms),
            failback: config.failback,
        }
    }
}

/// 경로 전환 제어기
#[derive(Debug)]
pub struct FailoverController {
    settings: FailoverSettings,
    primary: PathId,
    state: SessionState,
    started_at: Instant,
    switch_started: Option<Instant>,
    last_switch_at: Option<Instant>,
    unreachable_since: Option<Instant>,
}

impl FailoverController {
    pub fn new(settings: FailoverSettings, primary: PathId, now: Instant) -> Self {
        Self {
            settings,
            primary,
            state: SessionState::Establishing,
            started_at: now,
            switch_started: None,
            last_switch_at: None,
            unreachable_since: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// 송신 대상 경로 (전환 중에는 두 경로 모두)
    pub fn send_targets(&self) -> Vec<PathId> {
        match self.state {
            SessionState::Active(p) => vec![p],
            SessionState::Switching { from, to } => vec![to, from],
            _ => Vec::new(),
        }
    }

    /// 명시적 종료
    pub fn fail(&mut self, reason: FailureReason) -> Option<FailoverAction> {
        if self.state.is_failed() {
            return None;
        }
        self.state = SessionState::Failed(reason);
        Some(FailoverAction::Fail(reason))
    }

    /// 전환 대상 경로로 수신이 계속됨을 확인 (상대의 ACK)
    pub fn on_reception_confirmed(&mut self, path: PathId) -> Option<FailoverAction> {
        match self.state {
            SessionState::Switching { from, to } if to == path => Some(self.complete_switch(from, to)),
            _ => None,
        }
    }

    /// 타이머/상태 변화 처리
    pub fn tick(&mut self, now: Instant, paths: &[PathView]) -> Option<FailoverAction> {
        match self.state {
            SessionState::Failed(_) => None,
            SessionState::Establishing => self.tick_establishing(now, paths),
            SessionState::Active(active) => {
                if let Some(action) = self.check_terminal(now, paths) {
                    return Some(action);
                }
                self.tick_active(now, active, paths)
            }
            SessionState::Switching { from, to } => {
                if let Some(action) = self.check_terminal(now, paths) {
                    return Some(action);
                }
                self.tick_switching(now, from, to, paths)
            }
        }
    }

    fn tick_establishing(&mut self, now: Instant, paths: &[PathView]) -> Option<FailoverAction> {
        let primary_ready = paths.iter().any(|p| p.id == self.primary && p.healthy());
        let waited = now.saturating_duration_since(self.started_at);

        let chosen = if primary_ready {
            Some(self.primary)
        } else if self
            .settings
            .establish_timeout
            .is_some_and(|timeout| waited >= timeout)
        {
            paths.iter().find(|p| p.healthy()).map(|p| p.id)
        } else {
            None
        };

        if let Some(path) = chosen {
            info!("경로 활성화: {}", path);
            self.state = SessionState::Active(path);
            return Some(FailoverAction::Activate(path));
        }

        if waited >= self.settings.establish_deadline {
            warn!("경로 수립 실패: {:?} 경과", waited);
            self.state = SessionState::Failed(FailureReason::HandshakeFailed);
            return Some(FailoverAction::Fail(FailureReason::HandshakeFailed));
        }
        None
    }

    fn check_terminal(&mut self, now: Instant, paths: &[PathView]) -> Option<FailoverAction> {
        if paths.iter().any(|p| p.reachable()) {
            self.unreachable_since = None;
            return None;
        }

        let since = *self.unreachable_since.get_or_insert(now);
        if now.saturating_duration_since(since) < self.settings.terminal_timeout {
            return None;
        }

        warn!("{}", Error::SessionFailed(FailureReason::AllPathsExhausted));
        self.state = SessionState::Failed(FailureReason::AllPathsExhausted);
        Some(FailoverAction::Fail(FailureReason::AllPathsExhausted))
    }

    fn switch_allowed(&self, now: Instant) -> bool {
        match self.last_switch_at {
            Some(last) => now.saturating_duration_since(last) >= self.settings.min_dwell,
            None => true,
        }
    }

    fn eligible(&self, view: &PathView) -> bool {
        view.healthy() && view.healthy_for.is_some_and(|d| d >= self.settings.min_dwell)
    }

    fn tick_active(&mut self, now: Instant, active: PathId, paths: &[PathView]) -> Option<FailoverAction> {
        let current = paths.iter().find(|p| p.id == active)?;
        let impaired = !current.established || current.status != PathStatus::Healthy;

        let target = if impaired {
            // Primary 우선, 그 다음 목록 순서
            let mut candidates: Vec<&PathView> = paths
                .iter()
                .filter(|p| p.id != active && self.eligible(p))
                .collect();
            candidates.sort_by_key(|p| p.role != PathRole::Primary);
            candidates.first().map(|p| p.id)
        } else if self.settings.failback && active != self.primary {
            paths
                .iter()
                .find(|p| p.id == self.primary && self.eligible(p))
                .map(|p| p.id)
        } else {
            None
        };

        let to = target?;
        if !self.switch_allowed(now) {
            debug!("전환 보류 (dwell 미충족): {} -> {}", active, to);
            return None;
        }

        if impaired {
            match current.status {
                PathStatus::Dead => debug!("{}", Error::PathDead(active)),
                _ => debug!("{}", Error::PathDegraded(active)),
            }
        }
        info!("경로 전환 시작: {} -> {}", active, to);
        self.state = SessionState::Switching { from: active, to };
        self.switch_started = Some(now);
        self.last_switch_at = Some(now);
        Some(FailoverAction::BeginSwitch { from: active, to })
    }

    fn tick_switching(
        &mut self,
        now: Instant,
        from: PathId,
        to: PathId,
        paths: &[PathView],
    ) -> Option<FailoverAction> {
        let target_alive = paths.iter().any(|p| p.id == to && p.reachable());
        if !target_alive {
            warn!("전환 대상 경로 상실, 복귀: {} -> {}", to, from);
            self.state = SessionState::Active(from);
            self.switch_started = None;
            return Some(FailoverAction::AbortSwitch { from, to });
        }

        let started = self.switch_started.unwrap_or(now);
        if now.saturating_duration_since(started) >= self.settings.overlap_window {
            return Some(self.complete_switch(from, to));
        }
        None
    }

    fn complete_switch(&mut self, from: PathId, to: PathId) -> FailoverAction {
        info!("경로 전환 완료: {} 폐기, {} 활성", from, to);
        self.state = SessionState::Active(to);
        self.switch_started = None;
        FailoverAction::CompleteSwitch {
            retired: from,
            active: to,
        }
    }
}
