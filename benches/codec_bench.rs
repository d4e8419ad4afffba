//! 프레임 코덱 / 보안 채널 벤치마크
//!
//! 입력 이벤트 하나가 큐에서 나와 와이어에 실리기까지의 비용 측정
//!
//! ```bash
//! cargo bench --bench codec_bench
//! ```

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use pstp::crypto::{respond, PairingSecret, PendingHandshake};
use pstp::{EventPayload, Frame, PeripheralEvent, SecureChannel, TransferChunk};

fn key_event(seq: u64) -> PeripheralEvent {
    PeripheralEvent::new(seq, 1, EventPayload::Key { code: 30, pressed: true, modifiers: 0 })
}

fn audio_event(seq: u64, len: usize) -> PeripheralEvent {
    PeripheralEvent::new(
        seq,
        1,
        EventPayload::AudioFrame {
            stream_id: 1,
            sample_rate: 48_000,
            channels: 2,
            pts_us: seq * 10_000,
            data: vec![0x5A; len],
        },
    )
}

fn file_chunk(seq: u64, len: usize) -> PeripheralEvent {
    let data = vec![0xA5; len];
    PeripheralEvent::new(
        seq,
        1,
        EventPayload::FileChunk(TransferChunk {
            transfer_id: 7,
            index: seq as u32,
            total_chunks: 1024,
            total_len: 1024 * len as u64,
            offset: seq * len as u64,
            crc32: crc32fast::hash(&data),
            name: None,
            data,
        }),
    )
}

fn channel_pair() -> (SecureChannel, SecureChannel) {
    let psk = PairingSecret::derive("bench pairing");
    let pending = PendingHandshake::initiate(&psk, 1, 0, 1);
    let Ok((responder, ack)) = respond(&psk, pending.hello()) else {
        panic!("핸드쉐이크 실패");
    };
    let Ok(initiator) = pending.finish(&ack) else {
        panic!("핸드쉐이크 실패");
    };
    (initiator, responder)
}

fn bench_frame_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_codec");

    let key = key_event(1);
    group.bench_function("encode_key", |b| {
        b.iter(|| Frame::from_event(black_box(&key), 1).map(|f| f.to_bytes()))
    });

    let key_bytes = Frame::from_event(&key, 1).map(|f| f.to_bytes()).unwrap();
    group.bench_function("decode_key", |b| {
        b.iter(|| Frame::from_bytes(black_box(&key_bytes)).and_then(|f| f.decode_event()))
    });

    for len in [256usize, 1024] {
        let chunk = file_chunk(3, len);
        group.throughput(Throughput::Bytes(len as u64));
        group.bench_with_input(BenchmarkId::new("encode_file_chunk", len), &chunk, |b, chunk| {
            b.iter(|| Frame::from_event(black_box(chunk), 1).map(|f| f.to_bytes()))
        });
    }
    group.finish();
}

fn bench_secure_channel(c: &mut Criterion) {
    let mut group = c.benchmark_group("secure_channel");
    let (initiator, _) = channel_pair();

    let key = Frame::from_event(&key_event(1), 0).unwrap();
    group.bench_function("seal_key", |b| b.iter(|| initiator.seal(black_box(&key))));

    for len in [480usize, 1024] {
        let audio = Frame::from_event(&audio_event(1, len), 0).unwrap();
        group.throughput(Throughput::Bytes(len as u64));
        group.bench_with_input(BenchmarkId::new("seal_audio", len), &audio, |b, frame| {
            b.iter(|| initiator.seal(black_box(frame)))
        });
    }

    // 재전송 방지 윈도우 때문에 매 반복마다 새 시퀀스 사용
    group.bench_function("seal_open_key", |b| {
        let (initiator, mut responder) = channel_pair();
        let mut seq = 0u64;
        b.iter(|| {
            seq += 1;
            let plain = Frame::from_event(&key_event(seq), 0).unwrap();
            let sealed = initiator.seal(&plain).unwrap();
            responder.open(black_box(&sealed)).unwrap()
        })
    });
    group.finish();
}

criterion_group!(benches, bench_frame_codec, bench_secure_channel);
criterion_main!(benches);
