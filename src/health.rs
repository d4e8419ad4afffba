//! 경로 상태 감시
//!
//! 주기적인 프로브로 RTT와 최근 손실률을 측정하고 경로를 분류한다.
//! - Healthy
//! - Degraded: 손실률 또는 RTT 임계값 초과가 N회 연속
//! - Dead: 인증된 수신이 dead_timeout 동안 없음
//!
//! 분류 변화는 보고만 하고 데이터 이동에는 관여하지 않는다.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::message::ProbeMessage;
use crate::stats::ProbeWindow;
use crate::Config;

/// 경로 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PathStatus {
    Healthy,
    Degraded,
    Dead,
}

/// 상태 감시 임계값
#[derive(Debug, Clone)]
pub struct HealthThresholds {
    pub probe_interval: Duration,
    pub probe_timeout: Duration,
    pub window: usize,
    pub max_loss_rate: f64,
    pub max_rtt: Duration,
    pub consecutive: u32,
    pub dead_timeout: Duration,
}

impl HealthThresholds {
    pub fn from_config(config: &Config) -> Self {
        Self {
            probe_interval: Duration::from_millis(config.probe_interval_ms),
            probe_timeout: Duration::from_millis(config.probe_timeout_ms),
            window: config.probe_window,
            max_loss_rate: config.max_loss_rate,
            max_rtt: Duration::from_millis(config.max_rtt_ms),
            consecutive: config.degrade_after_probes.max(1),
            dead_timeout: Duration::from_millis(config.dead_timeout_ms),
        }
    }
}

/// 상태 변화
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusChange {
    pub from: PathStatus,
    pub to: PathStatus,
}

/// 읽기 전용 상태 스냅샷
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HealthSnapshot {
    pub status: PathStatus,
    pub rtt: Option<Duration>,
    pub loss_rate: f64,
    /// 마지막 인증된 수신 이후 경과 시간
    pub idle: Duration,
}

/// 경로 하나의 상태 감시기
#[derive(Debug)]
pub struct PathHealthMonitor {
    thresholds: HealthThresholds,
    window: ProbeWindow,
    status: PathStatus,
    healthy_since: Option<Instant>,
    last_activity: Instant,
    outstanding: BTreeMap<u64, Instant>,
    next_probe_id: u64,
    last_probe_at: Option<Instant>,
    bad_streak: u32,
    good_streak: u32,
}

impl PathHealthMonitor {
    /// 핸드쉐이크 직후 상태 (Healthy로 시작)
    pub fn new(thresholds: HealthThresholds, now: Instant) -> Self {
        let window = ProbeWindow::new(thresholds.window);
        Self {
            thresholds,
            window,
            status: PathStatus::Healthy,
            healthy_since: Some(now),
            last_activity: now,
            outstanding: BTreeMap::new(),
            next_probe_id: 1,
            last_probe_at: None,
            bad_streak: 0,
            good_streak: 0,
        }
    }

    /// 재수립 시 초기화
    pub fn reset(&mut self, now: Instant) {
        *self = Self::new(self.thresholds.clone(), now);
    }

    pub fn status(&self) -> PathStatus {
        self.status
    }

    /// 연속 Healthy 유지 시간
    pub fn healthy_for(&self, now: Instant) -> Option<Duration> {
        match (self.status, self.healthy_since) {
            (PathStatus::Healthy, Some(since)) => Some(now.saturating_duration_since(since)),
            _ => None,
        }
    }

    /// 프로브 송신 시점이면 새 프로브 생성
    pub fn due_probe(&mut self, now: Instant, now_us: u64) -> Option<ProbeMessage> {
        if let Some(last) = self.last_probe_at {
            if now.saturating_duration_since(last) < self.thresholds.probe_interval {
                return None;
            }
        }

        let probe = ProbeMessage {
            probe_id: self.next_probe_id,
            sent_at_us: now_us,
        };
        self.next_probe_id += 1;
        self.last_probe_at = Some(now);
        self.outstanding.insert(probe.probe_id, now);
        Some(probe)
    }

    /// 프로브 응답 수신
    pub fn on_probe_ack(&mut self, ack: &ProbeMessage, now: Instant) {
        self.on_activity(now);
        // 타임아웃 처리된 프로브의 늦은 응답은 무시
        let Some(sent) = self.outstanding.remove(&ack.probe_id) else {
            return;
        };

        let rtt = now.saturating_duration_since(sent);
        self.window.record_rtt(rtt);
        let bad = rtt > self.thresholds.max_rtt
            || self.window.loss_rate() > self.thresholds.max_loss_rate;
        self.record_probe(bad);
    }

    /// 인증된 프레임 수신
    pub fn on_activity(&mut self, now: Instant) {
        if now > self.last_activity {
            self.last_activity = now;
        }
    }

    /// 무결성 검증 실패는 손실로 계산
    pub fn on_integrity_violation(&mut self) {
        self.window.record_loss();
        self.record_probe(true);
    }

    fn record_probe(&mut self, bad: bool) {
        if bad {
            self.bad_streak += 1;
            self.good_streak = 0;
        } else {
            self.good_streak += 1;
            self.bad_streak = 0;
        }
    }

    fn expire_probes(&mut self, now: Instant) {
        let timeout = self.thresholds.probe_timeout;
        let expired: Vec<u64> = self
            .outstanding
            .iter()
            .filter(|(_, &sent)| now.saturating_duration_since(sent) >= timeout)
            .map(|(&id, _)| id)
            .collect();
        for id in expired {
            self.outstanding.remove(&id);
            self.window.record_loss();
            self.record_probe(true);
        }
    }

    /// 상태 재평가. 바뀌었으면 변화 반환.
    pub fn evaluate(&mut self, now: Instant) -> Option<StatusChange> {
        self.expire_probes(now);

        let idle = now.saturating_duration_since(self.last_activity);
        let consecutive = self.thresholds.consecutive;

        let next = if idle >= self.thresholds.dead_timeout {
            PathStatus::Dead
        } else {
            match self.status {
                // 살아난 경로는 Degraded를 거쳐 회복
                PathStatus::Dead => {
                    self.good_streak = 0;
                    PathStatus::Degraded
                }
                PathStatus::Healthy if self.bad_streak >= consecutive => PathStatus::Degraded,
                PathStatus::Degraded
                    if self.good_streak >= consecutive
                        && self.window.loss_rate() <= self.thresholds.max_loss_rate =>
                {
                    PathStatus::Healthy
                }
                current => current,
            }
        };

        if next == self.status {
            return None;
        }

        let change = StatusChange {
            from: self.status,
            to: next,
        };
        self.status = next;
        self.healthy_since = (next == PathStatus::Healthy).then_some(now);
        Some(change)
    }

    pub fn snapshot(&self, now: Instant) -> HealthSnapshot {
        HealthSnapshot {
            status: self.status,
            rtt: self.window.last_rtt(),
            loss_rate: self.window.loss_rate(),
            idle: now.saturating_duration_since(self.last_activity),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thresholds() -> HealthThresholds {
        HealthThresholds {
            probe_interval: Duration::from_millis(100),
            probe_timeout: Duration::from_millis(200),
            window: 10,
            max_loss_rate: 0.2,
            max_rtt: Duration::from_millis(50),
            consecutive: 3,
            dead_timeout: Duration::from_secs(1),
        }
    }

    fn answer(monitor: &mut PathHealthMonitor, now: Instant, rtt_ms: u64) {
        let probe = monitor.due_probe(now, 0).unwrap();
        monitor.on_probe_ack(&probe, now + Duration::from_millis(rtt_ms));
    }

    #[test]
    fn test_probe_interval() {
        let start = Instant::now();
        let mut monitor = PathHealthMonitor::new(thresholds(), start);
        assert!(monitor.due_probe(start, 0).is_some());
        assert!(monitor.due_probe(start + Duration::from_millis(50), 0).is_none());
        assert!(monitor.due_probe(start + Duration::from_millis(100), 0).is_some());
    }

    #[test]
    fn test_high_rtt_degrades_after_consecutive_probes() {
        let start = Instant::now();
        let mut monitor = PathHealthMonitor::new(thresholds(), start);

        let mut t = start;
        for i in 0..3 {
            answer(&mut monitor, t, 80);
            t += Duration::from_millis(100);
            let change = monitor.evaluate(t);
            if i < 2 {
                assert!(change.is_none());
            } else {
                assert_eq!(change.unwrap().to, PathStatus::Degraded);
            }
        }

        // 정상 RTT 3회 후 회복
        for _ in 0..3 {
            answer(&mut monitor, t, 5);
            t += Duration::from_millis(100);
            monitor.evaluate(t);
        }
        assert_eq!(monitor.status(), PathStatus::Healthy);
        assert_eq!(monitor.healthy_for(t), Some(Duration::ZERO));
    }

    #[test]
    fn test_single_bad_probe_does_not_degrade() {
        let start = Instant::now();
        let mut monitor = PathHealthMonitor::new(thresholds(), start);
        let mut t = start;
        for rtt in [80, 5, 80, 5, 80] {
            answer(&mut monitor, t, rtt);
            t += Duration::from_millis(100);
            assert!(monitor.evaluate(t).is_none());
        }
    }

    #[test]
    fn test_lost_probes_then_dead() {
        let start = Instant::now();
        let mut monitor = PathHealthMonitor::new(thresholds(), start);

        let mut t = start;
        for _ in 0..4 {
            monitor.due_probe(t, 0);
            t += Duration::from_millis(210);
            monitor.evaluate(t);
        }
        assert_eq!(monitor.status(), PathStatus::Degraded);

        let change = monitor.evaluate(start + Duration::from_secs(1)).unwrap();
        assert_eq!(change.to, PathStatus::Dead);
        assert!(monitor.healthy_for(start + Duration::from_secs(1)).is_none());
    }

    #[test]
    fn test_activity_keeps_path_alive() {
        let start = Instant::now();
        let mut monitor = PathHealthMonitor::new(thresholds(), start);
        monitor.on_activity(start + Duration::from_millis(900));
        assert!(monitor.evaluate(start + Duration::from_millis(1500)).is_none());
        assert_eq!(monitor.status(), PathStatus::Healthy);
    }

    #[test]
    fn test_dead_path_recovers_through_degraded() {
        let start = Instant::now();
        let mut monitor = PathHealthMonitor::new(thresholds(), start);
        let dead_at = start + Duration::from_secs(2);
        assert_eq!(monitor.evaluate(dead_at).unwrap().to, PathStatus::Dead);

        monitor.on_activity(dead_at);
        assert_eq!(monitor.evaluate(dead_at).unwrap().to, PathStatus::Degraded);
    }

    #[test]
    fn test_integrity_violations_count_as_loss() {
        let start = Instant::now();
        let mut monitor = PathHealthMonitor::new(thresholds(), start);
        for _ in 0..3 {
            monitor.on_integrity_violation();
        }
        assert_eq!(monitor.evaluate(start).unwrap().to, PathStatus::Degraded);
        assert!(monitor.snapshot(start).loss_rate > 0.2);
    }
}
