//! 송신측 채널 상태
//!
//! - 채널별 시퀀스 부여
//! - 미확인 프레임 보관 (Input: 경로 전환 재송신용, Transfer: 재전송용)
//! - 누적 ACK / 재전송 요청 처리
//!
//! 세션 드라이버 태스크가 단독으로 소유한다.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::event::{ChannelId, PeripheralEvent};
use crate::frame::Frame;
use crate::message::RetransmitRequest;
use crate::policy::ChannelPolicySet;
use crate::queue::QueuedEvent;
use crate::Result;

/// 미확인 프레임
#[derive(Debug, Clone)]
struct Unacked {
    /// 평문 프레임 (epoch는 봉인 시 경로 값으로 채워짐)
    frame: Frame,
    first_sent: Instant,
    last_sent: Instant,
}

/// 송신측 상태
#[derive(Debug)]
pub struct Outbound {
    policies: ChannelPolicySet,
    next_seq: [u64; 3],
    unacked: [BTreeMap<u64, Unacked>; 3],
}

impl Outbound {
    pub fn new(policies: ChannelPolicySet) -> Self {
        Self {
            policies,
            next_seq: [0; 3],
            unacked: Default::default(),
        }
    }

    /// 다음에 부여할 시퀀스
    pub fn next_sequence(&self, channel: ChannelId) -> u64 {
        self.next_seq.get(channel.index()).copied().unwrap_or(0)
    }

    /// 새 프레임을 보낼 수 있는지 (Transfer 송신 윈도우)
    pub fn can_send(&self, channel: ChannelId) -> bool {
        match channel {
            ChannelId::Transfer => {
                self.unacked[channel.index()].len() < self.policies.get(channel).unacked_limit
            }
            _ => true,
        }
    }

    /// 큐에서 꺼낸 이벤트에 시퀀스를 부여하고 평문 프레임 생성
    pub fn sequence(&mut self, queued: QueuedEvent, now: Instant) -> Result<Frame> {
        let channel = queued.payload.channel();
        let idx = channel.index();
        let sequence = self.next_seq[idx];

        let event = PeripheralEvent::new(sequence, queued.timestamp_us, queued.payload);
        let frame = Frame::from_event(&event, 0)?;
        self.next_seq[idx] += 1;

        let policy = self.policies.get(channel);
        if policy.acknowledged && policy.unacked_limit > 0 {
            let pending = &mut self.unacked[idx];
            pending.insert(
                sequence,
                Unacked {
                    frame: frame.clone(),
                    first_sent: now,
                    last_sent: now,
                },
            );
            // Input은 오래된 것부터 포기 (drop-if-stale)
            while pending.len() > policy.unacked_limit {
                pending.pop_first();
            }
        }
        Ok(frame)
    }

    /// 누적 ACK 반영. 제거된 프레임 수 반환.
    pub fn on_ack(&mut self, channel: ChannelId, next_expected: u64) -> usize {
        let Some(pending) = self.unacked.get_mut(channel.index()) else {
            return 0;
        };
        let before = pending.len();
        let kept = pending.split_off(&next_expected);
        *pending = kept;
        before - pending.len()
    }

    /// 재전송 타임아웃이 지난 Transfer 프레임
    pub fn due_retransmits(&mut self, now: Instant) -> Vec<Frame> {
        let channel = ChannelId::Transfer;
        let Some(timeout) = self.policies.get(channel).retransmit_timeout else {
            return Vec::new();
        };

        self.unacked[channel.index()]
            .values_mut()
            .filter(|entry| now.saturating_duration_since(entry.last_sent) >= timeout)
            .map(|entry| {
                entry.last_sent = now;
                entry.frame.clone()
            })
            .collect()
    }

    /// 수신측 재전송 요청 처리
    pub fn on_retransmit_request(&mut self, request: &RetransmitRequest, now: Instant) -> Vec<Frame> {
        if request.channel != ChannelId::Transfer {
            debug!("재전송 불가 채널 요청 무시: {:?}", request.channel);
            return Vec::new();
        }

        let pending = &mut self.unacked[request.channel.index()];
        let mut frames = Vec::with_capacity(request.missing.len());
        for seq in &request.missing {
            if let Some(entry) = pending.get_mut(seq) {
                entry.last_sent = now;
                frames.push(entry.frame.clone());
            }
        }
        frames
    }

    /// 경로 전환 시 새 경로로 다시 보낼 프레임
    ///
    /// Input은 input_stale_ms보다 오래되지 않은 것만, Transfer는 미확인 전부.
    pub fn switch_replay(&mut self, now: Instant) -> Vec<Frame> {
        let mut frames = Vec::new();

        let input = ChannelId::Input;
        let stale_after = self
            .policies
            .get(input)
            .replay_stale_after
            .unwrap_or(Duration::MAX);
        frames.extend(
            self.unacked[input.index()]
                .values()
                .filter(|entry| now.saturating_duration_since(entry.first_sent) < stale_after)
                .map(|entry| entry.frame.clone()),
        );

        frames.extend(
            self.unacked[ChannelId::Transfer.index()]
                .values_mut()
                .map(|entry| {
                    entry.last_sent = now;
                    entry.frame.clone()
                }),
        );
        frames
    }

    /// 미확인 프레임 수
    pub fn unacked_len(&self, channel: ChannelId) -> usize {
        self.unacked.get(channel.index()).map_or(0, |p| p.len())
    }
}
