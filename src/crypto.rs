//! 보안 채널 - 경로별 인증 키 교환 + 프레임 단위 AEAD
//!
//! 흐름:
//! 1. initiator가 X25519 임시 공개키 + nonce를 담은 Hello 전송 (페어링 비밀로 HMAC)
//! 2. responder가 MAC 검증 후 자신의 공개키를 담은 HelloAck 응답
//! 3. 양측이 DH 결과 + transcript로 방향별 키 유도
//! 4. 이후 모든 프레임을 ChaCha20-Poly1305로 봉인 (헤더는 AAD)
//!
//! 키는 (경로, epoch)마다 새로 유도된다. 이전 epoch의 프레임은 복호화되지 않는다.

use std::collections::BTreeSet;

use bytes::Bytes;
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce,
};
use hmac::{Hmac, Mac};
use rand::RngCore;
use rand_core::OsRng;
use sha2::{Digest, Sha256};
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};

use crate::event::ChannelId;
use crate::frame::{Frame, FrameHeader};
use crate::message::{HelloAckMessage, HelloMessage};
use crate::{Error, Result, PROTOCOL_VERSION};

type HmacSha256 = Hmac<Sha256>;

/// X25519 공개키 (32 bytes)
pub const PUBLIC_KEY_SIZE: usize = 32;

/// ChaCha20-Poly1305 nonce 크기 (12 bytes)
pub const NONCE_SIZE: usize = 12;

/// ChaCha20-Poly1305 태그 크기 (16 bytes)
pub const TAG_SIZE: usize = 16;

/// 채널별 재전송 방지 윈도우 (시퀀스 수)
pub const REPLAY_WINDOW: u64 = 4096;

/// 페어링 비밀 (양측이 사전 공유)
#[derive(Clone)]
pub struct PairingSecret([u8; 32]);

impl PairingSecret {
    /// 패스프레이즈에서 유도
    pub fn derive(passphrase: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"pstp pairing v1");
        hasher.update(passphrase.as_bytes());
        Self(hasher.finalize().into())
    }

    fn mac(&self, parts: &[&[u8]]) -> [u8; 32] {
        hmac_parts(&self.0, parts)
    }

    fn verify(&self, parts: &[&[u8]], tag: &[u8; 32]) -> bool {
        let Ok(mut mac) = <HmacSha256 as Mac>::new_from_slice(&self.0) else {
            return false;
        };
        for part in parts {
            mac.update(part);
        }
        mac.verify_slice(tag).is_ok()
    }
}

impl std::fmt::Debug for PairingSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PairingSecret(..)")
    }
}

fn hmac_parts(key: &[u8], parts: &[&[u8]]) -> [u8; 32] {
    // HMAC은 임의 길이 키를 허용하므로 실패하지 않음
    let mut mac = match <HmacSha256 as Mac>::new_from_slice(key) {
        Ok(mac) => mac,
        Err(_) => return [0u8; 32],
    };
    for part in parts {
        mac.update(part);
    }
    mac.finalize().into_bytes().into()
}

/// 개시자 키. 한 번의 핸드쉐이크 시도 동안 유지되며
/// 그 시도의 Hello 재전송은 모두 같은 공개키를 싣는다.
struct InitiatorKey {
    secret: StaticSecret,
    public: [u8; PUBLIC_KEY_SIZE],
}

impl InitiatorKey {
    fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = *PublicKey::from(&secret).as_bytes();
        Self { secret, public }
    }

    fn agree(&self, peer: &[u8; PUBLIC_KEY_SIZE]) -> [u8; 32] {
        *self.secret.diffie_hellman(&PublicKey::from(*peer)).as_bytes()
    }
}

/// 응답자 키. Hello 하나에 응답할 때 만들고 합의와 함께 소비한다.
struct ResponderKey {
    secret: EphemeralSecret,
    public: [u8; PUBLIC_KEY_SIZE],
}

impl ResponderKey {
    fn generate() -> Self {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = *PublicKey::from(&secret).as_bytes();
        Self { secret, public }
    }

    fn agree(self, peer: &[u8; PUBLIC_KEY_SIZE]) -> [u8; 32] {
        *self.secret.diffie_hellman(&PublicKey::from(*peer)).as_bytes()
    }
}

fn hello_transcript(hello: &HelloMessage) -> Vec<u8> {
    let mut buf = Vec::with_capacity(64);
    buf.push(hello.protocol_version);
    buf.extend_from_slice(&hello.session_id.to_le_bytes());
    buf.push(hello.path_id);
    buf.extend_from_slice(&hello.path_epoch.to_le_bytes());
    buf.extend_from_slice(&hello.public_key);
    buf.extend_from_slice(&hello.nonce);
    buf
}

fn ack_transcript(ack: &HelloAckMessage) -> Vec<u8> {
    let mut buf = Vec::with_capacity(64);
    buf.extend_from_slice(&ack.session_id.to_le_bytes());
    buf.push(ack.path_id);
    buf.extend_from_slice(&ack.path_epoch.to_le_bytes());
    buf.extend_from_slice(&ack.public_key);
    buf.extend_from_slice(&ack.nonce);
    buf
}

/// 키 유도 시 역할
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

fn derive_keys(
    psk: &PairingSecret,
    shared: &[u8; 32],
    hello: &HelloMessage,
    ack: &HelloAckMessage,
) -> ([u8; 32], [u8; 32]) {
    let hello_bytes = hello_transcript(hello);
    let ack_bytes = ack_transcript(ack);
    let prk = psk.mac(&[shared, &hello_bytes, &hello.mac, &ack_bytes]);

    let epoch = hello.path_epoch.to_le_bytes();
    let i2r = hmac_parts(&prk, &[b"pstp i2r", &epoch]);
    let r2i = hmac_parts(&prk, &[b"pstp r2i", &epoch]);
    (i2r, r2i)
}

/// 진행 중인 핸드쉐이크 (initiator 측)
pub struct PendingHandshake {
    psk: PairingSecret,
    key: InitiatorKey,
    hello: HelloMessage,
}

impl PendingHandshake {
    /// Hello 생성
    pub fn initiate(psk: &PairingSecret, session_id: u64, path_id: u8, path_epoch: u32) -> Self {
        let key = InitiatorKey::generate();
        let mut nonce = [0u8; 16];
        OsRng.fill_bytes(&mut nonce);

        let mut hello = HelloMessage {
            protocol_version: PROTOCOL_VERSION,
            session_id,
            path_id,
            path_epoch,
            public_key: key.public,
            nonce,
            mac: [0u8; 32],
        };
        hello.mac = psk.mac(&[&hello_transcript(&hello)]);

        Self {
            psk: psk.clone(),
            key,
            hello,
        }
    }

    /// 재전송용 Hello
    pub fn hello(&self) -> &HelloMessage {
        &self.hello
    }

    pub fn path_epoch(&self) -> u32 {
        self.hello.path_epoch
    }

    /// HelloAck 검증 후 보안 채널 생성
    ///
    /// 검증 실패 시 대기 상태는 유지되므로 정상 응답을 계속 기다릴 수 있다.
    pub fn finish(&self, ack: &HelloAckMessage) -> Result<SecureChannel> {
        if ack.session_id != self.hello.session_id
            || ack.path_id != self.hello.path_id
            || ack.path_epoch != self.hello.path_epoch
        {
            return Err(Error::HandshakeFailed(format!(
                "응답 불일치: session={:016x} path={} epoch={}",
                ack.session_id, ack.path_id, ack.path_epoch
            )));
        }

        let hello_bytes = hello_transcript(&self.hello);
        let ack_bytes = ack_transcript(ack);
        if !self
            .psk
            .verify(&[&hello_bytes, &self.hello.mac, &ack_bytes], &ack.mac)
        {
            return Err(Error::HandshakeFailed("HelloAck 인증 실패".into()));
        }

        let shared = self.key.agree(&ack.public_key);
        let (i2r, r2i) = derive_keys(&self.psk, &shared, &self.hello, ack);
        Ok(SecureChannel::new(Role::Initiator, self.hello.path_epoch, &i2r, &r2i))
    }
}

/// Hello 검증 후 HelloAck + 보안 채널 생성 (responder 측)
pub fn respond(psk: &PairingSecret, hello: &HelloMessage) -> Result<(SecureChannel, HelloAckMessage)> {
    if hello.protocol_version != PROTOCOL_VERSION {
        return Err(Error::HandshakeFailed(format!(
            "지원하지 않는 버전: {}",
            hello.protocol_version
        )));
    }
    if !psk.verify(&[&hello_transcript(hello)], &hello.mac) {
        return Err(Error::HandshakeFailed("Hello 인증 실패".into()));
    }

    let key = ResponderKey::generate();
    let mut nonce = [0u8; 16];
    OsRng.fill_bytes(&mut nonce);

    let mut ack = HelloAckMessage {
        session_id: hello.session_id,
        path_id: hello.path_id,
        path_epoch: hello.path_epoch,
        public_key: key.public,
        nonce,
        mac: [0u8; 32],
    };
    ack.mac = psk.mac(&[&hello_transcript(hello), &hello.mac, &ack_transcript(&ack)]);

    let shared = key.agree(&hello.public_key);
    let (i2r, r2i) = derive_keys(psk, &shared, hello, &ack);
    let channel = SecureChannel::new(Role::Responder, hello.path_epoch, &i2r, &r2i);
    Ok((channel, ack))
}

/// 채널별 슬라이딩 재전송 방지 윈도우
#[derive(Debug, Default)]
struct ReplayWindow {
    highest: Option<u64>,
    seen: BTreeSet<u64>,
}

impl ReplayWindow {
    fn is_fresh(&self, sequence: u64) -> bool {
        match self.highest {
            Some(highest) if sequence.saturating_add(REPLAY_WINDOW) <= highest => false,
            _ => !self.seen.contains(&sequence),
        }
    }

    fn commit(&mut self, sequence: u64) {
        self.seen.insert(sequence);
        let highest = self.highest.map_or(sequence, |h| h.max(sequence));
        self.highest = Some(highest);

        let floor = highest.saturating_sub(REPLAY_WINDOW);
        while let Some(&lowest) = self.seen.iter().next() {
            if lowest > floor {
                break;
            }
            self.seen.remove(&lowest);
        }
    }
}

/// 경로 하나의 (epoch별) 보안 채널
pub struct SecureChannel {
    path_epoch: u32,
    tx: ChaCha20Poly1305,
    rx: ChaCha20Poly1305,
    replay: [ReplayWindow; 4],
}

impl SecureChannel {
    fn new(role: Role, path_epoch: u32, i2r: &[u8; 32], r2i: &[u8; 32]) -> Self {
        let (tx_key, rx_key) = match role {
            Role::Initiator => (i2r, r2i),
            Role::Responder => (r2i, i2r),
        };
        Self {
            path_epoch,
            tx: ChaCha20Poly1305::new(Key::from_slice(tx_key)),
            rx: ChaCha20Poly1305::new(Key::from_slice(rx_key)),
            replay: Default::default(),
        }
    }

    pub fn path_epoch(&self) -> u32 {
        self.path_epoch
    }

    /// (channel, sequence)로 결정되는 nonce
    fn nonce(channel: ChannelId, sequence: u64) -> [u8; NONCE_SIZE] {
        let mut nonce = [0u8; NONCE_SIZE];
        nonce[0] = channel as u8;
        nonce[4..].copy_from_slice(&sequence.to_be_bytes());
        nonce
    }

    /// 평문 프레임 봉인 (헤더 epoch는 이 채널의 epoch로 설정)
    pub fn seal(&self, frame: &Frame) -> Result<Frame> {
        let header = FrameHeader {
            path_epoch: self.path_epoch,
            payload_len: (frame.payload.len() + TAG_SIZE) as u32,
            ..frame.header
        };
        let aad = header.to_bytes();
        let nonce_bytes = Self::nonce(header.channel, header.sequence);

        let ciphertext = self
            .tx
            .encrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: &frame.payload,
                    aad: &aad,
                },
            )
            .map_err(|_| Error::IntegrityViolation {
                channel: header.channel,
                path_epoch: header.path_epoch,
                sequence: header.sequence,
            })?;

        Ok(Frame::with_payload(header, Bytes::from(ciphertext)))
    }

    /// 봉인된 프레임 검증 및 복호화
    ///
    /// 순서: epoch 확인 → 재전송 윈도우 확인 → 복호화 → 윈도우 갱신.
    /// 인증에 실패한 프레임은 윈도우를 바꾸지 않는다.
    pub fn open(&mut self, frame: &Frame) -> Result<Frame> {
        let header = frame.header;
        if header.path_epoch != self.path_epoch {
            return Err(Error::StaleEpoch {
                expected: self.path_epoch,
                got: header.path_epoch,
            });
        }

        let window = &mut self.replay[header.channel.index()];
        if !window.is_fresh(header.sequence) {
            return Err(Error::ReplayedFrame {
                channel: header.channel,
                sequence: header.sequence,
            });
        }

        let aad = header.to_bytes();
        let nonce_bytes = Self::nonce(header.channel, header.sequence);
        let plaintext = self
            .rx
            .decrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: &frame.payload,
                    aad: &aad,
                },
            )
            .map_err(|_| Error::IntegrityViolation {
                channel: header.channel,
                path_epoch: header.path_epoch,
                sequence: header.sequence,
            })?;

        window.commit(header.sequence);
        Ok(Frame::with_payload(header, Bytes::from(plaintext)))
    }
}

impl std::fmt::Debug for SecureChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureChannel")
            .field("path_epoch", &self.path_epoch)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventPayload, PeripheralEvent};

    fn pair(epoch: u32) -> (SecureChannel, SecureChannel) {
        let psk = PairingSecret::derive("open sesame");
        let pending = PendingHandshake::initiate(&psk, 0xABCD, 0, epoch);
        let (responder, ack) = respond(&psk, pending.hello()).unwrap();
        let initiator = pending.finish(&ack).unwrap();
        (initiator, responder)
    }

    fn key_frame(seq: u64) -> Frame {
        let event = PeripheralEvent::new(
            seq,
            1,
            EventPayload::Key { code: 30, pressed: true, modifiers: 0 },
        );
        Frame::from_event(&event, 0).unwrap()
    }

    #[test]
    fn test_key_agreement() {
        let initiator = InitiatorKey::generate();
        let responder = ResponderKey::generate();
        let responder_public = responder.public;

        let from_responder = responder.agree(&initiator.public);
        // 같은 시도 안에서는 몇 번을 계산해도 같은 비밀
        assert_eq!(initiator.agree(&responder_public), from_responder);
        assert_eq!(initiator.agree(&responder_public), from_responder);
    }

    #[test]
    fn test_seal_open() {
        let (initiator, mut responder) = pair(1);
        let plain = key_frame(5);

        let sealed = initiator.seal(&plain).unwrap();
        assert_eq!(sealed.header.path_epoch, 1);
        assert_eq!(sealed.payload.len(), plain.payload.len() + TAG_SIZE);

        let opened = responder.open(&sealed).unwrap();
        assert_eq!(opened.payload, plain.payload);
        assert_eq!(opened.decode_event().unwrap().sequence(), 5);
    }

    #[test]
    fn test_tampered_frame_rejected() {
        let (initiator, mut responder) = pair(1);
        let sealed = initiator.seal(&key_frame(1)).unwrap();

        let mut bytes = sealed.to_bytes().to_vec();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        let tampered = Frame::from_bytes(&bytes).unwrap();
        assert!(matches!(
            responder.open(&tampered),
            Err(Error::IntegrityViolation { sequence: 1, .. })
        ));

        // 헤더 변조도 AAD로 검출
        let mut moved = sealed.clone();
        moved.header.sequence = 2;
        assert!(matches!(responder.open(&moved), Err(Error::IntegrityViolation { .. })));

        // 변조 시도 후에도 정상 프레임은 통과
        assert!(responder.open(&sealed).is_ok());
    }

    #[test]
    fn test_replay_rejected() {
        let (initiator, mut responder) = pair(1);
        let sealed = initiator.seal(&key_frame(3)).unwrap();

        assert!(responder.open(&sealed).is_ok());
        assert!(matches!(
            responder.open(&sealed),
            Err(Error::ReplayedFrame { sequence: 3, .. })
        ));
    }

    #[test]
    fn test_old_epoch_rejected() {
        let (old_initiator, _) = pair(1);
        let (_, mut responder) = pair(2);

        let sealed = old_initiator.seal(&key_frame(1)).unwrap();
        assert!(matches!(
            responder.open(&sealed),
            Err(Error::StaleEpoch { expected: 2, got: 1 })
        ));
    }

    #[test]
    fn test_direction_keys_differ() {
        let (initiator, _) = pair(1);
        let (_, mut other_responder) = pair(1);
        let sealed = initiator.seal(&key_frame(1)).unwrap();
        // 다른 핸드쉐이크의 키로는 열리지 않음
        assert!(matches!(
            other_responder.open(&sealed),
            Err(Error::IntegrityViolation { .. })
        ));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let psk = PairingSecret::derive("right");
        let wrong = PairingSecret::derive("wrong");
        let pending = PendingHandshake::initiate(&psk, 1, 0, 1);

        assert!(matches!(
            respond(&wrong, pending.hello()),
            Err(Error::HandshakeFailed(_))
        ));

        let (_, mut ack) = respond(&psk, pending.hello()).unwrap();
        ack.public_key[0] ^= 0xFF;
        assert!(matches!(pending.finish(&ack), Err(Error::HandshakeFailed(_))));
    }

    #[test]
    fn test_replay_window_slides() {
        let mut window = ReplayWindow::default();
        window.commit(10);
        assert!(!window.is_fresh(10));
        assert!(window.is_fresh(9));

        window.commit(10 + REPLAY_WINDOW);
        assert!(!window.is_fresh(10));
        assert!(!window.is_fresh(5));
        assert!(window.is_fresh(11));
    }
}
