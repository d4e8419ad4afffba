//! 수신측 채널 상태
//!
//! - 채널별 재정렬 버퍼 (채널마다 별도 락)
//! - 순서가 맞춰진 이벤트를 EventSink로 전달
//! - 누적 ACK 값, Transfer 재전송 요청 생성
//!
//! 경로별 수신 태스크가 동시에 호출한다. Transfer 버퍼가 막혀도
//! Input/Audio 전달은 영향을 받지 않는다.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::debug;

use crate::event::{ChannelId, PeripheralEvent};
use crate::message::RetransmitRequest;
use crate::policy::ChannelPolicySet;
use crate::reorder::{Admission, ReorderBuffer, ReorderOutput};
use crate::sink::EventSink;
use crate::stats::StatsCounters;
use crate::Error;

/// 수신측 상태
pub struct Inbound {
    buffers: [Mutex<ReorderBuffer>; 3],
    sink: Arc<dyn EventSink>,
    stats: Arc<StatsCounters>,
}

impl Inbound {
    pub fn new(policies: &ChannelPolicySet, sink: Arc<dyn EventSink>, stats: Arc<StatsCounters>) -> Self {
        let buffer = |channel| Mutex::new(ReorderBuffer::new(policies.get(channel).clone()));
        Self {
            buffers: [
                buffer(ChannelId::Input),
                buffer(ChannelId::Transfer),
                buffer(ChannelId::Audio),
            ],
            sink,
            stats,
        }
    }

    /// 복호화된 이벤트 수용
    pub fn ingest(&self, event: PeripheralEvent, now: Instant) -> Admission {
        let channel = event.channel();
        let Some(buffer) = self.buffers.get(channel.index()) else {
            return Admission::Duplicate;
        };
        let sequence = event.sequence();

        let mut buffer = buffer.lock();
        let (admission, output) = buffer.push(event, now);
        match admission {
            Admission::Accepted => {}
            Admission::Duplicate => {
                StatsCounters::inc(&self.stats.duplicates);
                debug!("중복 프레임 버림: {:?} seq={}", channel, sequence);
            }
            Admission::Stale => {
                StatsCounters::inc(&self.stats.stale);
                debug!("건너뛴 슬롯에 늦게 도착: {:?} seq={}", channel, sequence);
            }
            Admission::Overflow => {
                StatsCounters::inc(&self.stats.overflow);
                debug!(
                    "재정렬 윈도우 초과: {:?} seq={} next={}",
                    channel,
                    sequence,
                    buffer.next_expected()
                );
            }
        }
        self.emit(channel, output);
        admission
    }

    /// 채널별 대기 시간 처리. Transfer 공백은 재전송 요청으로 반환.
    pub fn poll(&self, now: Instant) -> Vec<RetransmitRequest> {
        let mut requests = Vec::new();
        for (buffer, channel) in self.buffers.iter().zip(ChannelId::DATA) {
            let mut buffer = buffer.lock();
            let mut output = buffer.poll(now);

            if let (Some(&first), Some(&last)) = (output.skipped.first(), output.skipped.last()) {
                let gap = Error::SequenceGap {
                    channel,
                    expected: first,
                    got: last + 1,
                };
                debug!("{}", gap);
            }
            if !output.retransmit.is_empty() {
                requests.push(RetransmitRequest {
                    channel,
                    missing: std::mem::take(&mut output.retransmit),
                });
            }
            self.emit(channel, output);
        }
        requests
    }

    /// 누적 ACK 값 (Input, Transfer)
    pub fn ack_snapshot(&self) -> Vec<(ChannelId, u64)> {
        [ChannelId::Input, ChannelId::Transfer]
            .into_iter()
            .map(|channel| (channel, self.buffers[channel.index()].lock().next_expected()))
            .collect()
    }

    /// 채널의 다음 기대 시퀀스
    pub fn next_expected(&self, channel: ChannelId) -> Option<u64> {
        self.buffers
            .get(channel.index())
            .map(|buffer| buffer.lock().next_expected())
    }

    /// 버퍼 락을 잡은 채로 전달해 채널 내 순서를 유지
    fn emit(&self, channel: ChannelId, output: ReorderOutput) {
        if !output.skipped.is_empty() {
            StatsCounters::add(&self.stats.skipped, output.skipped.len() as u64);
        }
        if output.delivered.is_empty() {
            return;
        }
        self.stats
            .record_delivered(channel, output.delivered.len() as u64);
        for event in output.delivered {
            self.sink.deliver(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventPayload, TransferChunk};
    use crate::sink::ChannelSink;
    use crate::Config;
    use std::time::Duration;

    fn inbound() -> (Inbound, crate::sink::DeliveredEvents, Arc<StatsCounters>) {
        let (sink, delivered) = ChannelSink::new();
        let stats = Arc::new(StatsCounters::new());
        let policies = ChannelPolicySet::from_config(&Config::default());
        (Inbound::new(&policies, Arc::new(sink), stats.clone()), delivered, stats)
    }

    fn key(seq: u64) -> PeripheralEvent {
        PeripheralEvent::new(seq, 0, EventPayload::Key { code: seq as u32, pressed: true, modifiers: 0 })
    }

    fn chunk(seq: u64) -> PeripheralEvent {
        PeripheralEvent::new(
            seq,
            0,
            EventPayload::FileChunk(TransferChunk {
                transfer_id: 1,
                index: seq as u32,
                total_chunks: 8,
                total_len: 8,
                offset: seq,
                crc32: crc32fast::hash(&[0]),
                name: None,
                data: vec![0],
            }),
        )
    }

    fn drain(rx: &mut tokio::sync::mpsc::UnboundedReceiver<PeripheralEvent>) -> Vec<u64> {
        let mut seqs = Vec::new();
        while let Ok(event) = rx.try_recv() {
            seqs.push(event.sequence());
        }
        seqs
    }

    #[test]
    fn test_in_order_delivery_with_duplicates() {
        let (inbound, mut delivered, stats) = inbound();
        let now = Instant::now();

        inbound.ingest(key(1), now);
        inbound.ingest(key(0), now);
        assert_eq!(inbound.ingest(key(1), now), Admission::Duplicate);
        inbound.ingest(key(2), now);

        assert_eq!(drain(&mut delivered.input), vec![0, 1, 2]);
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.delivered_input, 3);
        assert_eq!(snapshot.duplicates, 1);
    }

    #[test]
    fn test_input_gap_skipped_after_timeout() {
        let (inbound, mut delivered, stats) = inbound();
        let start = Instant::now();

        inbound.ingest(key(0), start);
        inbound.ingest(key(2), start);
        assert!(inbound.poll(start + Duration::from_millis(5)).is_empty());
        assert_eq!(drain(&mut delivered.input), vec![0]);

        inbound.poll(start + Duration::from_millis(40));
        assert_eq!(drain(&mut delivered.input), vec![2]);
        assert_eq!(stats.snapshot().skipped, 1);

        assert_eq!(inbound.ingest(key(1), start + Duration::from_millis(50)), Admission::Stale);
        assert!(drain(&mut delivered.input).is_empty());
    }

    #[test]
    fn test_transfer_gap_requests_retransmit() {
        let (inbound, mut delivered, _stats) = inbound();
        let start = Instant::now();

        inbound.ingest(chunk(0), start);
        inbound.ingest(chunk(3), start);
        let requests = inbound.poll(start + Duration::from_millis(250));
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].channel, ChannelId::Transfer);
        assert_eq!(requests[0].missing, vec![1, 2]);

        inbound.ingest(chunk(2), start);
        inbound.ingest(chunk(1), start);
        assert_eq!(drain(&mut delivered.transfer), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_blocked_transfer_does_not_stall_input() {
        let (inbound, mut delivered, _stats) = inbound();
        let now = Instant::now();

        inbound.ingest(chunk(5), now);
        inbound.ingest(key(0), now);
        assert_eq!(drain(&mut delivered.input), vec![0]);
        assert!(drain(&mut delivered.transfer).is_empty());

        let acks = inbound.ack_snapshot();
        assert_eq!(acks, vec![(ChannelId::Input, 1), (ChannelId::Transfer, 0)]);
    }
}
