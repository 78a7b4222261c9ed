//! 混淆帧编解码
//!
//! 帧格式（整帧与密钥逐字节异或，密钥偏移每帧从 0 开始）：
//!
//! ```text
//! u16_be(payload_len) || u16_be(pad_len) || payload || padding
//! ```
//!
//! `payload_len == 0` 的帧是掩护流量，解码时丢弃。

use bytes::{Buf, BufMut, Bytes, BytesMut};
use rand::Rng;

use super::ObfsKey;

pub const HEADER_LEN: usize = 4;
pub const MAX_PAYLOAD: usize = u16::MAX as usize;
pub const MAX_PADDING: usize = u16::MAX as usize;

/// `ObfsKey` 保证密钥非空
fn xor_in_place(buf: &mut [u8], key: &ObfsKey) {
    for (b, k) in buf.iter_mut().zip(key.as_bytes().iter().cycle()) {
        *b ^= k;
    }
}

/// 编码单帧；payload 与 padding 都不得超过 16 位长度
pub fn encode_frame(payload: &[u8], padding: &[u8], key: &ObfsKey, out: &mut BytesMut) {
    debug_assert!(payload.len() <= MAX_PAYLOAD && padding.len() <= MAX_PADDING);
    let start = out.len();
    out.reserve(HEADER_LEN + payload.len() + padding.len());
    out.put_u16(payload.len() as u16);
    out.put_u16(padding.len() as u16);
    out.extend_from_slice(payload);
    out.extend_from_slice(padding);
    xor_in_place(&mut out[start..], key);
}

pub fn random_padding(min: usize, max: usize) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    let max = max.min(MAX_PADDING);
    let min = min.min(max);
    let len = rng.gen_range(min..=max);
    let mut pad = vec![0u8; len];
    rng.fill(pad.as_mut_slice());
    pad
}

/// 编码任意长度数据：超过 65535 字节时拆成多帧，每帧独立随机填充
pub fn encode(payload: &[u8], key: &ObfsKey, padding_min: usize, padding_max: usize, out: &mut BytesMut) {
    for chunk in payload.chunks(MAX_PAYLOAD) {
        let padding = random_padding(padding_min, padding_max);
        encode_frame(chunk, &padding, key, out);
    }
}

/// 流式解码器：喂入任意切分的字节，逐个吐出有效载荷
pub struct FrameDecoder {
    key: ObfsKey,
    buf: BytesMut,
}

impl FrameDecoder {
    pub fn new(key: &ObfsKey) -> Self {
        Self {
            key: key.clone(),
            buf: BytesMut::new(),
        }
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// 尚未组成完整帧的字节数
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn next_payload(&mut self) -> Option<Bytes> {
        loop {
            if self.buf.len() < HEADER_LEN {
                return None;
            }
            let mut header = [0u8; HEADER_LEN];
            header.copy_from_slice(&self.buf[..HEADER_LEN]);
            xor_in_place(&mut header, &self.key);
            let payload_len = u16::from_be_bytes([header[0], header[1]]) as usize;
            let pad_len = u16::from_be_bytes([header[2], header[3]]) as usize;
            let total = HEADER_LEN + payload_len + pad_len;
            if self.buf.len() < total {
                return None;
            }

            let mut frame = self.buf.split_to(total);
            if payload_len == 0 {
                continue;
            }
            xor_in_place(&mut frame[..HEADER_LEN + payload_len], &self.key);
            frame.advance(HEADER_LEN);
            frame.truncate(payload_len);
            return Some(frame.freeze());
        }
    }
}
