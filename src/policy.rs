//! 채널 정책
//!
//! 채널 ID → 순서/전달 보장, 재정렬 윈도우, 재전송, 큐 동작.
//! 상태 없는 순수 조회 테이블.

use std::time::Duration;

use crate::event::ChannelId;
use crate::Config;

/// 순서 보장 수준
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderingMode {
    Strict,
    BestEffort,
}

/// 전달 보장 수준
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    ExactlyOnce,
    AtMostOnce,
    BestEffort,
}

/// 수신측 공백 처리 방식
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GapAction {
    /// 타임아웃 후 건너뛰고 뒤 프레임을 먼저 전달 (Input)
    SkipAfterTimeout,

    /// 빈 슬롯을 버림 (Audio)
    DropSlot,

    /// 채워질 때까지 막고 재전송 요청 (Transfer)
    Retransmit,
}

/// 송신 큐 오버플로우 처리
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// 잠시 생산자를 막고, 그래도 가득하면 가장 오래된 항목 버림
    BlockThenDropOldest { block: Duration },

    /// 막지 않고 새 항목을 버림
    DropNewest,
}

/// 채널 하나의 정책
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelPolicy {
    pub channel: ChannelId,
    pub ordering: OrderingMode,
    pub delivery: DeliveryMode,
    pub gap_action: GapAction,

    /// 다음 기대 시퀀스 이후 보관 가능한 범위
    pub reorder_window: usize,

    /// 공백 대기 시간
    pub reorder_timeout: Duration,

    /// 재전송 타임아웃 (재전송하지 않는 채널은 None)
    pub retransmit_timeout: Option<Duration>,

    /// 지터 버퍼 최대 깊이
    pub max_jitter_depth: usize,

    /// 송신 큐 깊이
    pub queue_depth: usize,

    pub overflow: OverflowPolicy,

    /// 수신측이 누적 ACK를 보내는지
    pub acknowledged: bool,

    /// 경로 전환 시 재송신 허용 나이
    pub replay_stale_after: Option<Duration>,

    /// 송신측 미확인 프레임 보관 한도
    pub unacked_limit: usize,
}

/// 전체 채널 정책 집합
#[derive(Debug, Clone)]
pub struct ChannelPolicySet {
    input: ChannelPolicy,
    transfer: ChannelPolicy,
    audio: ChannelPolicy,
    control: ChannelPolicy,
}

impl ChannelPolicySet {
    pub fn from_config(config: &Config) -> Self {
        let ch = &config.channels;
        let ms = Duration::from_millis;

        let input = ChannelPolicy {
            channel: ChannelId::Input,
            ordering: OrderingMode::Strict,
            delivery: DeliveryMode::AtMostOnce,
            gap_action: GapAction::SkipAfterTimeout,
            reorder_window: ch.input_reorder_window,
            reorder_timeout: ms(ch.input_reorder_timeout_ms),
            retransmit_timeout: None,
            max_jitter_depth: ch.input_reorder_window,
            queue_depth: ch.input_queue_depth,
            overflow: OverflowPolicy::BlockThenDropOldest { block: ms(ch.input_block_ms) },
            acknowledged: true,
            replay_stale_after: Some(ms(ch.input_stale_ms)),
            unacked_limit: ch.input_replay_depth,
        };

        let transfer = ChannelPolicy {
            channel: ChannelId::Transfer,
            ordering: OrderingMode::Strict,
            delivery: DeliveryMode::ExactlyOnce,
            gap_action: GapAction::Retransmit,
            reorder_window: ch.transfer_window,
            reorder_timeout: ms(ch.transfer_retransmit_timeout_ms),
            retransmit_timeout: Some(ms(ch.transfer_retransmit_timeout_ms)),
            max_jitter_depth: ch.transfer_window,
            queue_depth: ch.transfer_queue_depth,
            overflow: OverflowPolicy::BlockThenDropOldest { block: ms(ch.transfer_block_ms) },
            acknowledged: true,
            replay_stale_after: None,
            unacked_limit: ch.transfer_window,
        };

        let audio = ChannelPolicy {
            channel: ChannelId::Audio,
            ordering: OrderingMode::BestEffort,
            delivery: DeliveryMode::BestEffort,
            gap_action: GapAction::DropSlot,
            reorder_window: ch.audio_jitter_depth,
            reorder_timeout: ms(ch.audio_reorder_timeout_ms),
            retransmit_timeout: None,
            max_jitter_depth: ch.audio_jitter_depth,
            queue_depth: ch.audio_queue_depth,
            overflow: OverflowPolicy::DropNewest,
            acknowledged: false,
            replay_stale_after: None,
            unacked_limit: 0,
        };

        // Control은 재정렬 버퍼를 거치지 않음. 재전송 방지 윈도우 크기만 사용.
        let control = ChannelPolicy {
            channel: ChannelId::Control,
            ordering: OrderingMode::BestEffort,
            delivery: DeliveryMode::AtMostOnce,
            gap_action: GapAction::DropSlot,
            reorder_window: 256,
            reorder_timeout: Duration::ZERO,
            retransmit_timeout: None,
            max_jitter_depth: 0,
            queue_depth: 0,
            overflow: OverflowPolicy::DropNewest,
            acknowledged: false,
            replay_stale_after: None,
            unacked_limit: 0,
        };

        Self {
            input,
            transfer,
            audio,
            control,
        }
    }

    /// 채널 정책 조회
    pub fn get(&self, channel: ChannelId) -> &ChannelPolicy {
        match channel {
            ChannelId::Input => &self.input,
            ChannelId::Transfer => &self.transfer,
            ChannelId::Audio => &self.audio,
            ChannelId::Control => &self.control,
        }
    }
}
