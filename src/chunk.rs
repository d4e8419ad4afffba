//! 클립보드/파일 전송 분할 및 재조립
//!
//! - TransferBuilder: 데이터를 Transfer 채널 이벤트 크기의 조각으로 분할 (송신측)
//! - TransferAssembly: 전송 하나의 조각 수신 상태
//! - TransferReassembler: 전송 ID별 조립기, 완료되면 원본과 바이트 단위로 같은 데이터 반환

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use bytes::{Bytes, BytesMut};

use crate::event::{EventPayload, TransferChunk};
use crate::{Error, Result};

/// 전송 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    Clipboard,
    File,
}

/// 조립 완료된 전송
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedTransfer {
    pub transfer_id: u64,
    pub kind: TransferKind,
    pub name: Option<String>,
    pub data: Bytes,
}

impl CompletedTransfer {
    /// 디렉터리에 파일로 저장. 파일 이름의 경로 구성요소는 무시하고 마지막 이름만 사용.
    pub fn write_to(&self, dir: impl AsRef<Path>) -> Result<PathBuf> {
        let file_name = self
            .name
            .as_deref()
            .and_then(|n| Path::new(n).file_name())
            .map(|n| n.to_owned())
            .unwrap_or_else(|| format!("transfer-{:016x}.bin", self.transfer_id).into());

        let path = dir.as_ref().join(file_name);
        std::fs::write(&path, &self.data)?;
        Ok(path)
    }
}

/// 전송 하나의 수신 상태
#[derive(Debug)]
pub struct TransferAssembly {
    pub transfer_id: u64,
    pub kind: TransferKind,
    pub name: Option<String>,
    data: BytesMut,
    total_len: u64,
    total_chunks: u32,
    received_chunks: Vec<bool>,
    received_count: u32,
}

impl TransferAssembly {
    fn new(kind: TransferKind, chunk: &TransferChunk) -> Self {
        let mut data = BytesMut::with_capacity(chunk.total_len as usize);
        data.resize(chunk.total_len as usize, 0);

        Self {
            transfer_id: chunk.transfer_id,
            kind,
            name: None,
            data,
            total_len: chunk.total_len,
            total_chunks: chunk.total_chunks,
            received_chunks: vec![false; chunk.total_chunks as usize],
            received_count: 0,
        }
    }

    /// 조각 삽입. 새 조각이면 true, 이미 받은 조각이면 false.
    pub fn insert(&mut self, chunk: &TransferChunk) -> Result<bool> {
        let corrupted = || Error::TransferCorrupted {
            transfer_id: chunk.transfer_id,
            index: chunk.index,
        };

        if chunk.total_chunks != self.total_chunks || chunk.total_len != self.total_len {
            return Err(corrupted());
        }
        let index = chunk.index as usize;
        if index >= self.received_chunks.len() {
            return Err(corrupted());
        }
        if self.received_chunks[index] {
            return Ok(false);
        }
        if !chunk.verify_crc() {
            return Err(corrupted());
        }

        let offset = chunk.offset as usize;
        let end = offset
            .checked_add(chunk.data.len())
            .filter(|&end| end <= self.data.len())
            .ok_or_else(corrupted)?;
        self.data[offset..end].copy_from_slice(&chunk.data);

        if chunk.name.is_some() {
            self.name = chunk.name.clone();
        }
        self.received_chunks[index] = true;
        self.received_count += 1;
        Ok(true)
    }

    /// 완료 여부 확인
    pub fn is_complete(&self) -> bool {
        self.received_count >= self.total_chunks
    }

    fn finish(self) -> CompletedTransfer {
        CompletedTransfer {
            transfer_id: self.transfer_id,
            kind: self.kind,
            name: self.name,
            data: self.data.freeze(),
        }
    }
}

/// 전송 분할기 (송신측)
pub struct TransferBuilder {
    chunk_size: usize,
    max_transfer_size: u64,
}

impl TransferBuilder {
    pub fn new(chunk_size: usize, max_transfer_size: u64) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            max_transfer_size,
        }
    }

    /// 데이터를 조각 이벤트들로 분할. 빈 데이터도 조각 하나로 보낸다.
    pub fn split(
        &self,
        transfer_id: u64,
        kind: TransferKind,
        name: Option<String>,
        data: &[u8],
    ) -> Result<Vec<EventPayload>> {
        let total_len = data.len() as u64;
        if total_len > self.max_transfer_size {
            return Err(Error::TransferTooLarge {
                size: total_len,
                max: self.max_transfer_size,
            });
        }

        let total_chunks = data.len().div_ceil(self.chunk_size).max(1) as u32;
        let pieces: Vec<&[u8]> = if data.is_empty() {
            vec![&[][..]]
        } else {
            data.chunks(self.chunk_size).collect()
        };

        let payloads = pieces
            .into_iter()
            .enumerate()
            .map(|(idx, piece)| {
                let chunk = TransferChunk {
                    transfer_id,
                    index: idx as u32,
                    total_chunks,
                    total_len,
                    offset: (idx * self.chunk_size) as u64,
                    crc32: crc32fast::hash(piece),
                    name: if idx == 0 { name.clone() } else { None },
                    data: piece.to_vec(),
                };
                match kind {
                    TransferKind::Clipboard => EventPayload::ClipboardChunk(chunk),
                    TransferKind::File => EventPayload::FileChunk(chunk),
                }
            })
            .collect();
        Ok(payloads)
    }
}

/// 전송 ID별 재조립기 (수신측)
pub struct TransferReassembler {
    max_transfer_size: u64,
    assemblies: HashMap<u64, TransferAssembly>,
}

impl TransferReassembler {
    pub fn new(max_transfer_size: u64) -> Self {
        Self {
            max_transfer_size,
            assemblies: HashMap::new(),
        }
    }

    /// Transfer 이벤트 하나 반영. 전송이 완료되면 결과 반환.
    ///
    /// Transfer 채널이 아닌 이벤트는 무시한다.
    pub fn accept(&mut self, payload: &EventPayload) -> Result<Option<CompletedTransfer>> {
        let (kind, chunk) = match payload {
            EventPayload::ClipboardChunk(chunk) => (TransferKind::Clipboard, chunk),
            EventPayload::FileChunk(chunk) => (TransferKind::File, chunk),
            _ => return Ok(None),
        };

        if chunk.total_len > self.max_transfer_size {
            return Err(Error::TransferTooLarge {
                size: chunk.total_len,
                max: self.max_transfer_size,
            });
        }
        if chunk.total_chunks == 0 || u64::from(chunk.total_chunks) > chunk.total_len.max(1) {
            return Err(Error::TransferCorrupted {
                transfer_id: chunk.transfer_id,
                index: chunk.index,
            });
        }

        let assembly = self
            .assemblies
            .entry(chunk.transfer_id)
            .or_insert_with(|| TransferAssembly::new(kind, chunk));

        if assembly.kind != kind {
            return Err(Error::TransferCorrupted {
                transfer_id: chunk.transfer_id,
                index: chunk.index,
            });
        }
        assembly.insert(chunk)?;

        if assembly.is_complete() {
            if let Some(done) = self.assemblies.remove(&chunk.transfer_id) {
                return Ok(Some(done.finish()));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk_of(payload: &EventPayload) -> &TransferChunk {
        match payload {
            EventPayload::ClipboardChunk(c) | EventPayload::FileChunk(c) => c,
            _ => panic!("not a transfer chunk"),
        }
    }

    #[test]
    fn test_split_and_reassemble() {
        let builder = TransferBuilder::new(100, 1 << 20);
        let data: Vec<u8> = (0..250u32).map(|i| i as u8).collect();
        let payloads = builder
            .split(1, TransferKind::File, Some("notes.txt".into()), &data)
            .unwrap();
        assert_eq!(payloads.len(), 3);

        let mut reassembler = TransferReassembler::new(1 << 20);
        // 역순 + 중복 삽입
        assert!(reassembler.accept(&payloads[2]).unwrap().is_none());
        assert!(reassembler.accept(&payloads[2]).unwrap().is_none());
        assert!(reassembler.accept(&payloads[0]).unwrap().is_none());
        let done = reassembler.accept(&payloads[1]).unwrap().unwrap();

        assert_eq!(done.kind, TransferKind::File);
        assert_eq!(done.name.as_deref(), Some("notes.txt"));
        assert_eq!(done.data.as_ref(), data.as_slice());
    }

    #[test]
    fn test_empty_clipboard() {
        let builder = TransferBuilder::new(100, 1024);
        let payloads = builder.split(9, TransferKind::Clipboard, None, b"").unwrap();
        assert_eq!(payloads.len(), 1);

        let mut reassembler = TransferReassembler::new(1024);
        let done = reassembler.accept(&payloads[0]).unwrap().unwrap();
        assert!(done.data.is_empty());
        assert_eq!(done.kind, TransferKind::Clipboard);
    }

    #[test]
    fn test_corrupted_chunk_rejected() {
        let builder = TransferBuilder::new(4, 1024);
        let mut payloads = builder
            .split(2, TransferKind::Clipboard, None, b"hello world")
            .unwrap();
        if let EventPayload::ClipboardChunk(chunk) = &mut payloads[1] {
            chunk.data[0] ^= 0xFF;
        }

        let mut reassembler = TransferReassembler::new(1024);
        assert!(reassembler.accept(&payloads[0]).unwrap().is_none());
        assert!(matches!(
            reassembler.accept(&payloads[1]),
            Err(Error::TransferCorrupted { transfer_id: 2, index: 1 })
        ));
        assert_eq!(chunk_of(&payloads[2]).index, 2);
    }

    #[test]
    fn test_size_limits() {
        let builder = TransferBuilder::new(4, 8);
        assert!(matches!(
            builder.split(1, TransferKind::File, None, &[0u8; 9]),
            Err(Error::TransferTooLarge { size: 9, max: 8 })
        ));

        let big = TransferBuilder::new(4, 64)
            .split(1, TransferKind::File, None, &[0u8; 32])
            .unwrap();
        let mut reassembler = TransferReassembler::new(16);
        assert!(matches!(
            reassembler.accept(&big[0]),
            Err(Error::TransferTooLarge { .. })
        ));
    }

    #[test]
    fn test_write_to_dir() {
        let dir = tempfile::tempdir().unwrap();
        let done = CompletedTransfer {
            transfer_id: 5,
            kind: TransferKind::File,
            name: Some("../escape.txt".into()),
            data: Bytes::from_static(b"payload"),
        };
        let path = done.write_to(dir.path()).unwrap();
        assert_eq!(path, dir.path().join("escape.txt"));
        assert_eq!(std::fs::read(path).unwrap(), b"payload");
    }
}
