//! 프로토콜 설정
//!
//! 세션 생성 시 한 번 전달되는 정적 설정. TOML 파일에서 읽을 수 있고
//! 누락된 필드는 기본값을 사용.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::{Error, Result, DEFAULT_PRIMARY_PORT, DEFAULT_SECONDARY_PORT};

/// 채널별 신뢰성 임계값
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChannelThresholds {
    /// Input 재정렬 윈도우 (프레임 수)
    pub input_reorder_window: usize,

    /// Input 공백 대기 시간 (밀리초), 초과하면 건너뛰고 전달
    pub input_reorder_timeout_ms: u64,

    /// Input 송신 큐 깊이
    pub input_queue_depth: usize,

    /// Input 큐가 가득 찼을 때 생산자 대기 시간 (밀리초)
    pub input_block_ms: u64,

    /// 이 시간보다 오래된 Input은 경로 전환 시 재송신하지 않음 (밀리초)
    pub input_stale_ms: u64,

    /// 경로 전환 대비 보관하는 미확인 Input 프레임 수
    pub input_replay_depth: usize,

    /// Transfer 재정렬/송신 윈도우 (프레임 수)
    pub transfer_window: usize,

    /// Transfer 재전송 타임아웃 (밀리초)
    pub transfer_retransmit_timeout_ms: u64,

    /// Transfer 송신 큐 깊이
    pub transfer_queue_depth: usize,

    /// Transfer 큐 생산자 대기 시간 (밀리초)
    pub transfer_block_ms: u64,

    /// Audio 지터 버퍼 깊이 (프레임 수)
    pub audio_jitter_depth: usize,

    /// Audio 빈 슬롯 대기 시간 (밀리초)
    pub audio_reorder_timeout_ms: u64,

    /// Audio 송신 큐 깊이
    pub audio_queue_depth: usize,
}

impl Default for ChannelThresholds {
    fn default() -> Self {
        Self {
            input_reorder_window: 32,
            input_reorder_timeout_ms: 30,
            input_queue_depth: 256,
            input_block_ms: 20,
            input_stale_ms: 1000,
            input_replay_depth: 1024,
            transfer_window: 256,
            transfer_retransmit_timeout_ms: 200,
            transfer_queue_depth: 1024,
            transfer_block_ms: 1000,
            audio_jitter_depth: 8,
            audio_reorder_timeout_ms: 40,
            audio_queue_depth: 64,
        }
    }
}

/// PSTP 세션 설정
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// 기본 경로 포트 (유선 LAN)
    pub primary_port: u16,

    /// 보조 경로 포트 (Wi-Fi)
    pub secondary_port: u16,

    /// 페어링 비밀 (양측 동일)
    pub pairing_secret: String,

    /// 이 기기 이름 (로그용)
    pub device_name: String,

    /// 전송 청크 크기 (바이트)
    pub transfer_chunk_size: usize,

    /// 단일 전송 최대 크기 (바이트)
    pub max_transfer_size: u64,

    /// 최대 UDP 데이터그램 크기
    pub max_datagram_size: usize,

    /// 핸드쉐이크 전체 타임아웃 (밀리초)
    pub handshake_timeout_ms: u64,

    /// Hello 재전송 간격 (밀리초)
    pub handshake_retry_ms: u64,

    /// 끊긴 경로 재수립 시도 간격 (밀리초)
    pub rehandshake_interval_ms: u64,

    /// accept 대기 타임아웃 (밀리초)
    pub accept_timeout_ms: u64,

    /// 프로브 주기 (밀리초)
    pub probe_interval_ms: u64,

    /// 프로브 응답 타임아웃 (밀리초), 초과 시 손실로 처리
    pub probe_timeout_ms: u64,

    /// 손실률 계산용 프로브 윈도우 크기
    pub probe_window: usize,

    /// Degraded 판정 손실률 (0.0 ~ 1.0)
    pub max_loss_rate: f64,

    /// Degraded 판정 RTT (밀리초)
    pub max_rtt_ms: u64,

    /// 연속 불량 프로브 수 (Degraded 판정 및 회복 기준)
    pub degrade_after_probes: u32,

    /// 무응답 시 Dead 판정 (밀리초)
    pub dead_timeout_ms: u64,

    /// 전환 대상이 되기 위한 최소 Healthy 유지 시간 (밀리초)
    pub min_dwell_ms: u64,

    /// 전환 중 이중 송신 최대 시간 (밀리초)
    pub overlap_window_ms: u64,

    /// 사용 가능한 경로가 없을 때 세션 실패까지 시간 (밀리초)
    pub terminal_timeout_ms: u64,

    /// 기본 경로 수립 대기 시간 (밀리초), 초과 시 보조 경로로 시작
    pub establish_timeout_ms: u64,

    /// 기본 경로 회복 시 되돌아감
    pub failback: bool,

    /// 드라이버 타이머 주기 (밀리초)
    pub driver_tick_ms: u64,

    /// ACK 전송 주기 (밀리초)
    pub ack_interval_ms: u64,

    /// 채널별 임계값
    pub channels: ChannelThresholds,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            primary_port: DEFAULT_PRIMARY_PORT,
            secondary_port: DEFAULT_SECONDARY_PORT,
            pairing_secret: String::new(),
            device_name: default_device_name(),
            transfer_chunk_size: 1024,
            max_transfer_size: 100 * 1024 * 1024, // 100MB
            max_datagram_size: 1400,
            handshake_timeout_ms: 3000,
            handshake_retry_ms: 250,
            rehandshake_interval_ms: 1000,
            accept_timeout_ms: 30_000,
            probe_interval_ms: 500,
            probe_timeout_ms: 1000,
            probe_window: 20,
            max_loss_rate: 0.20,
            max_rtt_ms: 150,
            degrade_after_probes: 3,
            dead_timeout_ms: 3000,
            min_dwell_ms: 2000,
            overlap_window_ms: 500,
            terminal_timeout_ms: 10_000,
            establish_timeout_ms: 3000,
            failback: true,
            driver_tick_ms: 10,
            ack_interval_ms: 20,
            channels: ChannelThresholds::default(),
        }
    }
}

fn default_device_name() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "pstp-device".to_string())
}

impl Config {
    /// 새 설정 생성
    pub fn new() -> Self {
        Self::default()
    }

    /// 페어링 비밀을 지정한 설정
    pub fn with_secret(secret: impl Into<String>) -> Self {
        Self {
            pairing_secret: secret.into(),
            ..Self::default()
        }
    }

    /// TOML 문자열에서 읽기
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// TOML 파일에서 읽기
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// 값 검증
    pub fn validate(&self) -> Result<()> {
        if self.pairing_secret.is_empty() {
            return Err(Error::Config("pairing_secret 필요".into()));
        }
        if !(0.0..=1.0).contains(&self.max_loss_rate) {
            return Err(Error::Config(format!(
                "max_loss_rate 범위 오류: {}",
                self.max_loss_rate
            )));
        }
        if self.probe_window == 0 || self.degrade_after_probes == 0 {
            return Err(Error::Config("probe_window/degrade_after_probes는 1 이상".into()));
        }
        if self.transfer_chunk_size == 0
            || self.transfer_chunk_size + 128 > self.max_datagram_size
        {
            return Err(Error::Config(format!(
                "transfer_chunk_size {}가 데이터그램 크기 {}에 맞지 않음",
                self.transfer_chunk_size, self.max_datagram_size
            )));
        }
        let ch = &self.channels;
        if ch.input_reorder_window == 0
            || ch.transfer_window == 0
            || ch.audio_jitter_depth == 0
            || ch.input_queue_depth == 0
            || ch.transfer_queue_depth == 0
            || ch.audio_queue_depth == 0
        {
            return Err(Error::Config("채널 윈도우/큐 깊이는 1 이상".into()));
        }
        if self.probe_timeout_ms >= self.dead_timeout_ms {
            return Err(Error::Config("probe_timeout_ms < dead_timeout_ms 이어야 함".into()));
        }
        Ok(())
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn driver_tick(&self) -> Duration {
        Duration::from_millis(self.driver_tick_ms.max(1))
    }

    /// 저지연 LAN 환경용 설정
    pub fn low_latency() -> Self {
        Self {
            probe_interval_ms: 200,
            probe_timeout_ms: 400,
            max_rtt_ms: 50,
            dead_timeout_ms: 1500,
            min_dwell_ms: 1000,
            overlap_window_ms: 250,
            driver_tick_ms: 5,
            ack_interval_ms: 10,
            channels: ChannelThresholds {
                input_reorder_timeout_ms: 15,
                audio_reorder_timeout_ms: 20,
                audio_jitter_depth: 4,
                ..ChannelThresholds::default()
            },
            ..Self::default()
        }
    }

    /// 불안정한 네트워크용 설정
    pub fn unstable_network() -> Self {
        Self {
            probe_interval_ms: 500,
            probe_timeout_ms: 1500,
            probe_window: 30,
            max_loss_rate: 0.35,
            max_rtt_ms: 400,
            degrade_after_probes: 5,
            dead_timeout_ms: 5000,
            min_dwell_ms: 4000,
            overlap_window_ms: 1000,
            terminal_timeout_ms: 20_000,
            channels: ChannelThresholds {
                input_reorder_timeout_ms: 60,
                transfer_retransmit_timeout_ms: 400,
                audio_jitter_depth: 16,
                audio_reorder_timeout_ms: 80,
                ..ChannelThresholds::default()
            },
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = Config::with_secret("correct horse");
        assert!(config.validate().is_ok());
        assert!(Config::default().validate().is_err());
    }

    #[test]
    fn test_presets_validate() {
        for mut config in [Config::low_latency(), Config::unstable_network()] {
            config.pairing_secret = "s".into();
            assert!(config.validate().is_ok());
        }
    }

    #[test]
    fn test_from_toml_partial() {
        let text = r#"
            pairing_secret = "hunter2"
            primary_port = 9100
            min_dwell_ms = 500

            [channels]
            input_reorder_window = 16
        "#;
        let config = Config::from_toml_str(text).unwrap();
        assert_eq!(config.primary_port, 9100);
        assert_eq!(config.min_dwell_ms, 500);
        assert_eq!(config.channels.input_reorder_window, 16);
        assert_eq!(config.channels.transfer_window, 256);
        assert_eq!(config.secondary_port, DEFAULT_SECONDARY_PORT);
    }

    #[test]
    fn test_invalid_loss_rate() {
        let mut config = Config::with_secret("x");
        config.max_loss_rate = 1.5;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }
}
