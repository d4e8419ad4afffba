//! 세션 통합 테스트 (메모리 링크 사용)

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::timeout;

use pstp::{
    memory_link, ChannelId, ChannelSink, Config, DeliveredEvents, EventPayload, LinkControl,
    LinkEnd, PathId, PathLink, PathRole, PushOutcome, SessionState, TransferReassembler,
    TransportSession,
};

fn fast_config() -> Config {
    let mut config = Config::with_secret("integration pairing");
    config.handshake_retry_ms = 20;
    config.handshake_timeout_ms = 300;
    config.rehandshake_interval_ms = 100;
    config.probe_interval_ms = 20;
    config.probe_timeout_ms = 60;
    config.dead_timeout_ms = 300;
    config.min_dwell_ms = 50;
    config.overlap_window_ms = 50;
    config.terminal_timeout_ms = 3000;
    config.establish_timeout_ms = 200;
    config.accept_timeout_ms = 3000;
    config.driver_tick_ms = 5;
    config.ack_interval_ms = 10;
    config
}

struct Pair {
    client: TransportSession,
    server: TransportSession,
    delivered: DeliveredEvents,
    client_delivered: DeliveredEvents,
    controls: Vec<LinkControl>,
}

async fn connect_pair(config: Config, roles: &[PathRole]) -> Pair {
    let mut client_links = Vec::new();
    let mut server_links = Vec::new();
    let mut controls = Vec::new();
    for &role in roles {
        let (a, b, control) = memory_link();
        client_links.push(PathLink::new(role, Arc::new(a)));
        server_links.push(PathLink::new(role, Arc::new(b)));
        controls.push(control);
    }

    let (client_sink, client_delivered) = ChannelSink::new();
    let (server_sink, delivered) = ChannelSink::new();
    let (client, server) = tokio::join!(
        TransportSession::connect(config.clone(), client_links, Arc::new(client_sink)),
        TransportSession::accept(config, server_links, Arc::new(server_sink)),
    );

    Pair {
        client: client.expect("client connect"),
        server: server.expect("server accept"),
        delivered,
        client_delivered,
        controls,
    }
}

fn key(code: u32) -> EventPayload {
    EventPayload::Key { code, pressed: true, modifiers: 0 }
}

/// 전환 중에도 공백을 기다렸다가 재송신분으로 채우는 설정
fn failover_config() -> Config {
    let mut config = fast_config();
    config.channels.input_reorder_timeout_ms = 5000;
    config.channels.input_reorder_window = 2048;
    config.channels.input_stale_ms = 10_000;
    config
}

async fn expect_keys_in_order(delivered: &mut DeliveredEvents, count: u32) {
    for expected in 0..u64::from(count) {
        let event = timeout(Duration::from_secs(10), delivered.input.recv())
            .await
            .expect("input delivery timed out")
            .expect("sink closed");
        assert_eq!(event.sequence(), expected);
        match event.payload() {
            EventPayload::Key { code, .. } => assert_eq!(u64::from(*code), expected),
            other => panic!("unexpected payload: {:?}", other),
        }
    }
}

async fn wait_for_active(session: &TransportSession, path: PathId, limit: Duration) -> bool {
    timeout(limit, async {
        while session.active_path() != Some(path) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .is_ok()
}

#[tokio::test]
async fn test_failover_delivers_every_input_once_in_order() {
    let mut pair = connect_pair(failover_config(), &[PathRole::Primary, PathRole::Secondary]).await;
    assert_eq!(pair.client.active_path(), Some(PathId(0)));

    // 보조 경로가 수립되고 Healthy 유지 시간을 채울 때까지
    tokio::time::sleep(Duration::from_millis(200)).await;

    for code in 0..1000u32 {
        if code == 500 {
            pair.controls[0].set_down(true);
        }
        let outcome = pair.client.send(key(code)).await.unwrap();
        assert_eq!(outcome, PushOutcome::Enqueued);
        if code % 10 == 0 {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }

    expect_keys_in_order(&mut pair.delivered, 1000).await;

    // 중복 전달 없음
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(pair.delivered.input.try_recv().is_err());

    assert_eq!(pair.client.active_path(), Some(PathId(1)));
    let stats = pair.client.stats();
    assert!(stats.switches >= 1);
    assert_eq!(pair.server.stats().delivered_input, 1000);

    pair.client.close().await.unwrap();
}

#[tokio::test]
async fn test_responder_input_survives_failover() {
    let mut pair = connect_pair(failover_config(), &[PathRole::Primary, PathRole::Secondary]).await;
    assert_eq!(pair.server.active_path(), Some(PathId(0)));

    tokio::time::sleep(Duration::from_millis(200)).await;

    // 응답자 -> 개시자 방향
    for code in 0..1000u32 {
        if code == 500 {
            pair.controls[0].set_down(true);
        }
        let outcome = pair.server.send(key(code)).await.unwrap();
        assert_eq!(outcome, PushOutcome::Enqueued);
        if code % 10 == 0 {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }

    expect_keys_in_order(&mut pair.client_delivered, 1000).await;

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(pair.client_delivered.input.try_recv().is_err());

    assert_eq!(pair.server.active_path(), Some(PathId(1)));
    assert!(pair.server.stats().switches >= 1);
    assert_eq!(pair.client.stats().delivered_input, 1000);

    pair.client.close().await.unwrap();
}

#[tokio::test]
async fn test_failback_to_restored_primary_keeps_input_exact() {
    let mut pair = connect_pair(failover_config(), &[PathRole::Primary, PathRole::Secondary]).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let mut next = 0u32;
    for _ in 0..200 {
        pair.client.send(key(next)).await.unwrap();
        next += 1;
    }

    pair.controls[0].set_down(true);
    for _ in 0..200 {
        pair.client.send(key(next)).await.unwrap();
        next += 1;
        if next % 10 == 0 {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }
    assert!(wait_for_active(&pair.client, PathId(1), Duration::from_secs(3)).await);

    // 복구 후 재핸드쉐이크, Healthy 유지, 전환 완료까지 계속 전송
    pair.controls[0].set_down(false);
    let restored = timeout(Duration::from_secs(5), async {
        while pair.client.active_path() != Some(PathId(0)) {
            pair.client.send(key(next)).await.unwrap();
            next += 1;
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(restored.is_ok(), "failback did not happen");

    for _ in 0..200 {
        pair.client.send(key(next)).await.unwrap();
        next += 1;
    }

    expect_keys_in_order(&mut pair.delivered, next).await;

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(pair.delivered.input.try_recv().is_err());

    assert_eq!(pair.client.active_path(), Some(PathId(0)));
    assert!(pair.client.stats().switches >= 2);
    assert_eq!(pair.server.stats().delivered_input, u64::from(next));

    pair.client.close().await.unwrap();
}

#[tokio::test]
async fn test_lossy_transfer_reassembles_exactly() {
    let mut config = fast_config();
    config.max_loss_rate = 0.6;
    config.dead_timeout_ms = 1000;

    let mut pair = connect_pair(config.clone(), &[PathRole::Primary]).await;
    pair.controls[0].set_loss(0.1);

    let data: Vec<u8> = (0..64 * 1024u32).map(|i| (i * 31 % 251) as u8).collect();
    let transfer_id = pair.client.send_file("lossy.bin", &data).await.unwrap();

    let mut reassembler = TransferReassembler::new(config.max_transfer_size);
    let done = timeout(Duration::from_secs(15), async {
        while let Some(event) = pair.delivered.transfer.recv().await {
            if let Some(done) = reassembler.accept(event.payload()).unwrap() {
                return Some(done);
            }
        }
        None
    })
    .await
    .expect("transfer timed out")
    .expect("sink closed");

    assert_eq!(done.transfer_id, transfer_id);
    assert_eq!(done.name.as_deref(), Some("lossy.bin"));
    assert_eq!(done.data, Bytes::from(data));
    assert!(pair.server.stats().delivered_transfer >= 64);

    pair.controls[0].set_loss(0.0);
    pair.client.close().await.unwrap();
}

#[tokio::test]
async fn test_lossy_transfer_larger_than_window_completes() {
    let mut config = fast_config();
    config.channels.transfer_window = 4;
    // 단일 경로가 손실만으로 Dead 판정되지 않도록
    config.max_loss_rate = 0.9;
    config.dead_timeout_ms = 2000;

    let mut pair = connect_pair(config.clone(), &[PathRole::Primary]).await;
    pair.controls[0].set_loss(0.3);

    // 기본 조각 크기 1024 기준 100개 조각, 윈도우의 25배
    let data: Vec<u8> = (0..100 * 1024u32).map(|i| (i * 17 % 253) as u8).collect();
    let transfer_id = pair.client.send_file("window.bin", &data).await.unwrap();

    let mut reassembler = TransferReassembler::new(config.max_transfer_size);
    let done = timeout(Duration::from_secs(30), async {
        while let Some(event) = pair.delivered.transfer.recv().await {
            if let Some(done) = reassembler.accept(event.payload()).unwrap() {
                return Some(done);
            }
        }
        None
    })
    .await
    .expect("transfer stalled")
    .expect("sink closed");

    assert_eq!(done.transfer_id, transfer_id);
    assert_eq!(done.data, Bytes::from(data));
    assert_eq!(pair.client.queued(ChannelId::Transfer), 0);
    assert!(pair.client.stats().retransmissions > 0);

    pair.controls[0].set_loss(0.0);
    pair.client.close().await.unwrap();
}

#[tokio::test]
async fn test_replayed_datagrams_are_not_redelivered() {
    let mut pair = connect_pair(fast_config(), &[PathRole::Primary]).await;
    pair.controls[0].set_capture(true);

    for code in 0..20 {
        pair.client.send(key(code)).await.unwrap();
    }
    for expected in 0..20u64 {
        let event = timeout(Duration::from_secs(2), pair.delivered.input.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.sequence(), expected);
    }

    pair.controls[0].set_capture(false);
    let captured = pair.controls[0].captured(LinkEnd::A);
    assert!(!captured.is_empty());
    for datagram in captured {
        pair.controls[0].inject(LinkEnd::B, datagram);
    }

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(pair.delivered.input.try_recv().is_err());
    assert!(pair.server.stats().replays_rejected > 0);
    assert!(pair.server.state().is_connected());

    pair.client.close().await.unwrap();
}

#[tokio::test]
async fn test_tampered_datagram_is_dropped() {
    let mut pair = connect_pair(fast_config(), &[PathRole::Primary]).await;
    pair.controls[0].set_capture(true);
    pair.client.send(key(1)).await.unwrap();
    timeout(Duration::from_secs(2), pair.delivered.input.recv())
        .await
        .unwrap()
        .unwrap();
    pair.controls[0].set_capture(false);

    for datagram in pair.controls[0].captured(LinkEnd::A) {
        // 아직 보지 않은 시퀀스로 헤더 변조 (AAD 불일치)
        let mut bytes = datagram.to_vec();
        let mut seq = [0u8; 8];
        seq.copy_from_slice(&bytes[12..20]);
        let forged = u64::from_le_bytes(seq) + 100_000;
        bytes[12..20].copy_from_slice(&forged.to_le_bytes());
        pair.controls[0].inject(LinkEnd::B, Bytes::from(bytes));
    }

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(pair.delivered.input.try_recv().is_err());
    assert!(pair.server.stats().integrity_violations > 0);

    pair.client.close().await.unwrap();
}

#[tokio::test(flavor = "current_thread")]
async fn test_audio_queue_stays_bounded() {
    let config = fast_config();
    let depth = config.channels.audio_queue_depth;
    let pair = connect_pair(config, &[PathRole::Primary]).await;

    // 드라이버가 돌 틈 없이 밀어 넣음
    for i in 0..(depth as u64 * 10) {
        let frame = EventPayload::AudioFrame {
            stream_id: 1,
            sample_rate: 48_000,
            channels: 2,
            pts_us: i * 10_000,
            data: vec![0; 480],
        };
        pair.client.try_send(frame).unwrap();
        assert!(pair.client.queued(ChannelId::Audio) <= depth);
    }

    assert_eq!(pair.client.queued(ChannelId::Audio), depth);
    assert!(pair.client.stats().queue_drops >= depth as u64 * 9);

    pair.client.close().await.unwrap();
}

#[tokio::test]
async fn test_client_close_fails_server_session() {
    let pair = connect_pair(fast_config(), &[PathRole::Primary]).await;
    let mut state = pair.server.subscribe_state();

    pair.client.close().await.unwrap();

    let failed = timeout(Duration::from_secs(2), async {
        loop {
            let current = *state.borrow_and_update();
            if current.is_failed() {
                return current;
            }
            if state.changed().await.is_err() {
                return pair.server.state();
            }
        }
    })
    .await
    .unwrap();
    assert!(matches!(failed, SessionState::Failed(_)));
    assert!(pair.server.send(key(1)).await.is_err());
}
