//! 전송 통계
//!
//! - ProbeWindow: 경로별 최근 프로브 결과 (손실률, RTT)
//! - StatsCounters: 세션 전체 카운터 (여러 태스크에서 갱신)
//! - SessionStats: 카운터 스냅샷

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::event::ChannelId;

/// 프로브 결과 하나
#[derive(Debug, Clone, Copy)]
enum ProbeOutcome {
    Answered { rtt: Duration },
    Lost,
}

/// 경로별 프로브 슬라이딩 윈도우
#[derive(Debug, Clone)]
pub struct ProbeWindow {
    outcomes: VecDeque<ProbeOutcome>,
    window_size: usize,

    /// 총 응답 프로브 수
    pub total_answered: u64,

    /// 총 손실 프로브 수
    pub total_lost: u64,

    last_update: Option<Instant>,
}

impl ProbeWindow {
    pub fn new(window_size: usize) -> Self {
        let window_size = window_size.max(1);
        Self {
            outcomes: VecDeque::with_capacity(window_size),
            window_size,
            total_answered: 0,
            total_lost: 0,
            last_update: None,
        }
    }

    fn push(&mut self, outcome: ProbeOutcome) {
        if self.outcomes.len() >= self.window_size {
            self.outcomes.pop_front();
        }
        self.outcomes.push_back(outcome);
        self.last_update = Some(Instant::now());
    }

    /// 응답 받은 프로브 기록
    pub fn record_rtt(&mut self, rtt: Duration) {
        self.push(ProbeOutcome::Answered { rtt });
        self.total_answered += 1;
    }

    /// 손실된 프로브 기록
    pub fn record_loss(&mut self) {
        self.push(ProbeOutcome::Lost);
        self.total_lost += 1;
    }

    /// 윈도우 내 손실률
    pub fn loss_rate(&self) -> f64 {
        if self.outcomes.is_empty() {
            return 0.0;
        }
        let lost = self
            .outcomes
            .iter()
            .filter(|o| matches!(o, ProbeOutcome::Lost))
            .count();
        lost as f64 / self.outcomes.len() as f64
    }

    /// 가장 최근 RTT
    pub fn last_rtt(&self) -> Option<Duration> {
        self.outcomes.iter().rev().find_map(|o| match o {
            ProbeOutcome::Answered { rtt } => Some(*rtt),
            ProbeOutcome::Lost => None,
        })
    }

    /// 윈도우 내 평균 RTT
    pub fn average_rtt(&self) -> Option<Duration> {
        let samples: Vec<Duration> = self
            .outcomes
            .iter()
            .filter_map(|o| match o {
                ProbeOutcome::Answered { rtt } => Some(*rtt),
                ProbeOutcome::Lost => None,
            })
            .collect();
        if samples.is_empty() {
            return None;
        }
        Some(samples.iter().sum::<Duration>() / samples.len() as u32)
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    /// 통계 리셋
    pub fn reset(&mut self) {
        self.outcomes.clear();
        self.total_answered = 0;
        self.total_lost = 0;
        self.last_update = None;
    }
}

/// 세션 카운터
#[derive(Debug, Default)]
pub struct StatsCounters {
    pub frames_sent: AtomicU64,
    pub frames_received: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
    delivered: [AtomicU64; 3],
    pub duplicates: AtomicU64,
    pub stale: AtomicU64,
    pub skipped: AtomicU64,
    pub overflow: AtomicU64,
    pub integrity_violations: AtomicU64,
    pub replays_rejected: AtomicU64,
    pub stale_epoch: AtomicU64,
    pub malformed: AtomicU64,
    pub retransmissions: AtomicU64,
    pub retransmit_requests: AtomicU64,
    pub switch_replays: AtomicU64,
    pub switches: AtomicU64,
    pub queue_drops: AtomicU64,
}

impl StatsCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delivered(&self, channel: ChannelId, n: u64) {
        if let Some(counter) = self.delivered.get(channel.index()) {
            counter.fetch_add(n, Ordering::Relaxed);
        }
    }

    /// 현재 값 스냅샷
    pub fn snapshot(&self) -> SessionStats {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        SessionStats {
            frames_sent: load(&self.frames_sent),
            frames_received: load(&self.frames_received),
            bytes_sent: load(&self.bytes_sent),
            bytes_received: load(&self.bytes_received),
            delivered_input: load(&self.delivered[0]),
            delivered_transfer: load(&self.delivered[1]),
            delivered_audio: load(&self.delivered[2]),
            duplicates: load(&self.duplicates),
            stale: load(&self.stale),
            skipped: load(&self.skipped),
            overflow: load(&self.overflow),
            integrity_violations: load(&self.integrity_violations),
            replays_rejected: load(&self.replays_rejected),
            stale_epoch: load(&self.stale_epoch),
            malformed: load(&self.malformed),
            retransmissions: load(&self.retransmissions),
            retransmit_requests: load(&self.retransmit_requests),
            switch_replays: load(&self.switch_replays),
            switches: load(&self.switches),
            queue_drops: load(&self.queue_drops),
        }
    }
}

/// 세션 통계 스냅샷
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub delivered_input: u64,
    pub delivered_transfer: u64,
    pub delivered_audio: u64,

    /// 중복으로 버려진 이벤트
    pub duplicates: u64,

    /// 건너뛴 슬롯에 늦게 도착한 이벤트
    pub stale: u64,

    /// 포기한 시퀀스 (Input/Audio)
    pub skipped: u64,

    /// 윈도우 밖으로 거부된 Transfer 이벤트
    pub overflow: u64,

    pub integrity_violations: u64,
    pub replays_rejected: u64,
    pub stale_epoch: u64,
    pub malformed: u64,
    pub retransmissions: u64,
    pub retransmit_requests: u64,

    /// 경로 전환 시 재송신한 프레임
    pub switch_replays: u64,

    pub switches: u64,
    pub queue_drops: u64,
}

impl SessionStats {
    /// 통계 요약 문자열
    pub fn summary(&self) -> String {
        format!(
            "Frames: {}/{} (tx/rx) | Delivered: input {} transfer {} audio {} | Dup: {} | Skipped: {} | Integrity: {} | Replay: {} | Retx: {} | Switches: {} | Queue drops: {}",
            self.frames_sent,
            self.frames_received,
            self.delivered_input,
            self.delivered_transfer,
            self.delivered_audio,
            self.duplicates,
            self.skipped,
            self.integrity_violations,
            self.replays_rejected,
            self.retransmissions,
            self.switches,
            self.queue_drops,
        )
    }
}
