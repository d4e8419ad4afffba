//! 재정렬 및 중복 제거 버퍼
//!
//! 수신측 채널마다 하나. 다음 기대 시퀀스보다 앞선 프레임을 윈도우 크기까지 보관하고,
//! 공백이 채워지거나 채널 정책의 대기 시간이 지나면 순서대로 내보낸다.
//!
//! 중복 판정 키는 채널 내 시퀀스. 시퀀스는 세션 전체에서 재사용되지 않으므로
//! 경로 전환 중 양쪽 경로로 받은 같은 프레임도 한 번만 전달된다.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

use crate::event::PeripheralEvent;
use crate::policy::{ChannelPolicy, GapAction};

/// 건너뛴 시퀀스 기억 개수 (늦게 도착한 프레임을 Stale로 분류하기 위함)
const SKIPPED_MEMORY: usize = 1024;

/// 한 번의 재전송 요청에 담는 최대 시퀀스 수
const MAX_RETRANSMIT_BATCH: usize = 64;

/// 프레임 수용 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// 보관 또는 전달됨
    Accepted,

    /// 이미 전달되었거나 보관 중
    Duplicate,

    /// 건너뛴 슬롯에 늦게 도착
    Stale,

    /// 윈도우 밖 (Transfer는 재전송으로 다시 받음)
    Overflow,
}

/// 버퍼 처리 결과
#[derive(Debug, Default)]
pub struct ReorderOutput {
    /// 순서대로 전달할 이벤트
    pub delivered: Vec<PeripheralEvent>,

    /// 포기한 시퀀스
    pub skipped: Vec<u64>,

    /// 재전송 요청할 시퀀스 (Transfer)
    pub retransmit: Vec<u64>,
}

impl ReorderOutput {
    pub fn is_empty(&self) -> bool {
        self.delivered.is_empty() && self.skipped.is_empty() && self.retransmit.is_empty()
    }
}

/// 채널별 재정렬 버퍼
#[derive(Debug)]
pub struct ReorderBuffer {
    policy: ChannelPolicy,
    next_expected: u64,
    pending: BTreeMap<u64, PeripheralEvent>,
    /// 현재 공백이 처음 관측된 (또는 마지막으로 처리된) 시각
    gap_since: Option<Instant>,
    skipped: BTreeSet<u64>,
}

impl ReorderBuffer {
    pub fn new(policy: ChannelPolicy) -> Self {
        Self {
            policy,
            next_expected: 0,
            pending: BTreeMap::new(),
            gap_since: None,
            skipped: BTreeSet::new(),
        }
    }

    /// 다음 기대 시퀀스 (누적 ACK 값)
    pub fn next_expected(&self) -> u64 {
        self.next_expected
    }

    /// 보관 중인 프레임 수
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// 이벤트 수용
    pub fn push(&mut self, event: PeripheralEvent, now: Instant) -> (Admission, ReorderOutput) {
        let mut output = ReorderOutput::default();
        let seq = event.sequence();

        if seq < self.next_expected {
            let admission = if self.skipped.contains(&seq) {
                Admission::Stale
            } else {
                Admission::Duplicate
            };
            return (admission, output);
        }
        if self.pending.contains_key(&seq) {
            return (Admission::Duplicate, output);
        }

        let window = self.policy.reorder_window.max(1) as u64;
        if seq >= self.next_expected + window {
            match self.policy.gap_action {
                GapAction::Retransmit => return (Admission::Overflow, output),
                // 윈도우 안에 들어오도록 앞부분을 포기
                GapAction::SkipAfterTimeout | GapAction::DropSlot => {
                    let new_base = seq + 1 - window;
                    self.advance_to(new_base, &mut output);
                }
            }
        }

        self.pending.insert(seq, event);
        self.drain_contiguous(&mut output);
        self.update_gap(now);
        (Admission::Accepted, output)
    }

    /// 타이머 처리
    pub fn poll(&mut self, now: Instant) -> ReorderOutput {
        let mut output = ReorderOutput::default();
        let Some(since) = self.gap_since else {
            return output;
        };
        if now.saturating_duration_since(since) < self.policy.reorder_timeout {
            return output;
        }

        match self.policy.gap_action {
            GapAction::SkipAfterTimeout | GapAction::DropSlot => {
                if let Some(&first) = self.pending.keys().next() {
                    self.advance_to(first, &mut output);
                    self.drain_contiguous(&mut output);
                }
                self.gap_since = None;
                self.update_gap(now);
            }
            GapAction::Retransmit => {
                output.retransmit = self.missing();
                self.gap_since = Some(now);
            }
        }
        output
    }

    /// 현재 공백 시퀀스 목록
    pub fn missing(&self) -> Vec<u64> {
        let Some(&last) = self.pending.keys().next_back() else {
            return Vec::new();
        };
        (self.next_expected..last)
            .filter(|seq| !self.pending.contains_key(seq))
            .take(MAX_RETRANSMIT_BATCH)
            .collect()
    }

    /// `target` 미만의 슬롯을 정리. 보관 중인 프레임은 전달, 빈 슬롯은 건너뜀.
    fn advance_to(&mut self, target: u64, output: &mut ReorderOutput) {
        while self.next_expected < target {
            let seq = self.next_expected;
            match self.pending.remove(&seq) {
                Some(event) => output.delivered.push(event),
                None => {
                    output.skipped.push(seq);
                    self.remember_skipped(seq);
                }
            }
            self.next_expected += 1;
        }
    }

    fn drain_contiguous(&mut self, output: &mut ReorderOutput) {
        while let Some(event) = self.pending.remove(&self.next_expected) {
            output.delivered.push(event);
            self.next_expected += 1;
        }
    }

    fn update_gap(&mut self, now: Instant) {
        if self.pending.is_empty() {
            self.gap_since = None;
        } else if self.gap_since.is_none() {
            self.gap_since = Some(now);
        }
    }

    fn remember_skipped(&mut self, seq: u64) {
        self.skipped.insert(seq);
        while self.skipped.len() > SKIPPED_MEMORY {
            self.skipped.pop_first();
        }
    }
}
