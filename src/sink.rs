//! 캡처/주입 협력자 인터페이스
//!
//! 코어는 OS 입력 후킹이나 오디오 장치를 직접 다루지 않는다.
//! - EventSource: 로컬에서 캡처된 이벤트를 생산
//! - EventSink: 순서가 맞춰진 이벤트를 소비 (입력 주입, 오디오 재생, 파일 저장)

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::event::{ChannelId, EventPayload, PeripheralEvent};

/// 수신측 이벤트 소비자
///
/// 채널별 수신 락 안에서 호출되므로 오래 막으면 안 된다.
pub trait EventSink: Send + Sync {
    fn deliver(&self, event: PeripheralEvent);
}

/// 송신측 이벤트 생산자
#[async_trait]
pub trait EventSource: Send {
    /// 다음 캡처 이벤트. None이면 생산 종료.
    async fn next_event(&mut self) -> Option<EventPayload>;
}

/// mpsc 수신기를 생산자로 사용
#[async_trait]
impl EventSource for mpsc::Receiver<EventPayload> {
    async fn next_event(&mut self) -> Option<EventPayload> {
        self.recv().await
    }
}

/// 채널별 수신기
pub struct DeliveredEvents {
    pub input: mpsc::UnboundedReceiver<PeripheralEvent>,
    pub transfer: mpsc::UnboundedReceiver<PeripheralEvent>,
    pub audio: mpsc::UnboundedReceiver<PeripheralEvent>,
}

/// 채널별 mpsc로 전달하는 기본 소비자
///
/// 채널마다 별도 큐이므로 Transfer 소비가 늦어도 Input/Audio는 막히지 않는다.
pub struct ChannelSink {
    input: mpsc::UnboundedSender<PeripheralEvent>,
    transfer: mpsc::UnboundedSender<PeripheralEvent>,
    audio: mpsc::UnboundedSender<PeripheralEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, DeliveredEvents) {
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (transfer_tx, transfer_rx) = mpsc::unbounded_channel();
        let (audio_tx, audio_rx) = mpsc::unbounded_channel();
        (
            Self {
                input: input_tx,
                transfer: transfer_tx,
                audio: audio_tx,
            },
            DeliveredEvents {
                input: input_rx,
                transfer: transfer_rx,
                audio: audio_rx,
            },
        )
    }
}

impl EventSink for ChannelSink {
    fn deliver(&self, event: PeripheralEvent) {
        let tx = match event.channel() {
            ChannelId::Input => &self.input,
            ChannelId::Transfer => &self.transfer,
            ChannelId::Audio => &self.audio,
            ChannelId::Control => return,
        };
        if tx.send(event).is_err() {
            debug!("이벤트 소비자 없음, 버림");
        }
    }
}
