//! 混淆层：编解码往返与流式包装

use std::time::Duration;

use proptest::prelude::*;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use oblivion::proxy::obfs::frame::HEADER_LEN;
use oblivion::proxy::obfs::cover::{COVER_MAX, COVER_MIN};
use oblivion::proxy::obfs::{CoverConfig, ObfsKey, ObfsStream, TrafficObfuscator};

proptest! {
    #[test]
    fn decode_inverts_encode(
        payload in proptest::collection::vec(any::<u8>(), 0..4096),
        key in proptest::collection::vec(any::<u8>(), 1..64),
        pmin in 0usize..64,
        extra in 0usize..256,
    ) {
        let obfs = TrafficObfuscator::new(ObfsKey::from_bytes(&key).unwrap(), pmin, pmin + extra);
        let wire = obfs.encode(&payload);
        prop_assert_eq!(obfs.decode(&wire).unwrap(), payload);
    }
}

#[test]
fn large_payload_spans_frames() {
    let obfs = TrafficObfuscator::new(ObfsKey::generate(), 0, 0);
    let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    let wire = obfs.encode(&payload);
    assert!(wire.len() > payload.len());
    assert_eq!(obfs.decode(&wire).unwrap(), payload);
}

#[test]
fn key_base64_round_trip_and_mismatch() {
    let key = ObfsKey::generate();
    let restored = ObfsKey::from_base64(&key.to_base64()).unwrap();
    assert_eq!(restored.as_bytes(), key.as_bytes());

    let a = TrafficObfuscator::new(key, 8, 8);
    let b = TrafficObfuscator::new(ObfsKey::from_bytes(b"another key").unwrap(), 8, 8);
    let wire = a.encode(b"secret message");
    assert_ne!(b.decode(&wire).ok(), Some(b"secret message".to_vec()));
}

#[tokio::test]
async fn wrapped_stream_with_cover_traffic() {
    let key = ObfsKey::generate();
    let obfs = TrafficObfuscator::new(key.clone(), 4, 32).with_cover_traffic(CoverConfig {
        interval: Duration::from_millis(10),
        queue: 8,
    });
    assert!(obfs.cover_enabled());

    let (client, server) = tokio::io::duplex(64 * 1024);
    let cancel = CancellationToken::new();
    let mut client = obfs.wrap(Box::new(client), &cancel);
    let mut server = ObfsStream::new(server, &key, 0, 0);

    // 真实数据之前先混进几帧掩护流量
    tokio::time::sleep(Duration::from_millis(50)).await;
    for chunk in [&b"first "[..], b"second"] {
        client.write_all(chunk).await.unwrap();
        client.flush().await.unwrap();
    }

    let mut got = [0u8; 12];
    server.read_exact(&mut got).await.unwrap();
    assert_eq!(&got, b"first second");

    server.write_all(b"reply").await.unwrap();
    server.flush().await.unwrap();
    let mut reply = [0u8; 5];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"reply");
    cancel.cancel();
}

#[tokio::test]
async fn idle_stream_still_emits_cover_frames() {
    let key = ObfsKey::generate();
    let obfs = TrafficObfuscator::new(key.clone(), 0, 0).with_cover_traffic(CoverConfig {
        interval: Duration::from_millis(10),
        queue: 8,
    });
    let (client, mut raw) = tokio::io::duplex(64 * 1024);
    let cancel = CancellationToken::new();
    let _wrapped = obfs.wrap(Box::new(client), &cancel);

    // 不写任何数据，线路上也应出现掩护帧
    let mut header = [0u8; HEADER_LEN];
    tokio::time::timeout(Duration::from_secs(2), raw.read_exact(&mut header))
        .await
        .expect("no cover frame on an idle stream")
        .unwrap();
    for (b, k) in header.iter_mut().zip(key.as_bytes()) {
        *b ^= k;
    }
    let payload_len = u16::from_be_bytes([header[0], header[1]]) as usize;
    let pad_len = u16::from_be_bytes([header[2], header[3]]) as usize;
    assert_eq!(payload_len, 0);
    assert!((COVER_MIN..=COVER_MAX).contains(&pad_len));
    cancel.cancel();
}
