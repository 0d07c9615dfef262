/*
 * transport.rs
 * Copyright (C) 2026 Yggmail developers
 *
 * Transport behaviour over the in-memory fabric: mutual authentication,
 * remote identity on accepted streams, kick-byte handling, session reuse
 * and failure on unroutable keys.
 */

mod common;

use std::sync::Arc;

use common::MemoryHub;
use ed25519_dalek::SigningKey;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use yggmail::transport::Transport;
use yggmail::Config;

fn config_with(byte: u8) -> Config {
    Config::new(SigningKey::from_bytes(&[byte; 32]))
}

#[tokio::test]
async fn dial_authenticates_both_directions() {
    let hub = MemoryHub::new();
    let a = config_with(0x01);
    let b = config_with(0x02);
    let fabric_a = hub.join(a.public_key_bytes());
    let fabric_b = hub.join(b.public_key_bytes());

    let (transport_a, _listener_a) = Transport::new(a.clone(), fabric_a).unwrap();
    let (_transport_b, mut listener_b) = Transport::new(b.clone(), fabric_b).unwrap();

    let mut outbound = transport_a.dial(&b.public_key_hex()).await.unwrap();
    assert_eq!(outbound.remote_key(), b.public_key_hex());
    outbound.write_all(b"hello b").await.unwrap();
    outbound.flush().await.unwrap();

    let mut inbound = listener_b.accept().await.expect("inbound stream");
    // The accepting side sees the dialer's verified key, and the kick byte
    // never reaches the application.
    assert_eq!(inbound.remote_key(), a.public_key_hex());
    let mut buf = [0u8; 7];
    inbound.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello b");

    inbound.write_all(b"hello a").await.unwrap();
    let mut buf = [0u8; 7];
    outbound.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello a");
}

#[tokio::test]
async fn second_dial_reuses_the_session() {
    let hub = MemoryHub::new();
    let a = config_with(0x03);
    let b = config_with(0x04);
    let fabric_a = hub.join(a.public_key_bytes());
    let fabric_b = hub.join(b.public_key_bytes());

    let (transport_a, _la) = Transport::new(a.clone(), fabric_a).unwrap();
    let (_tb, mut listener_b) = Transport::new(b.clone(), fabric_b).unwrap();

    let _first = transport_a.dial(&b.public_key_hex()).await.unwrap();
    let _second = transport_a.dial(&b.public_key_hex()).await.unwrap();

    // Both streams surface on B.
    let s1 = listener_b.accept().await.expect("first stream");
    let s2 = listener_b.accept().await.expect("second stream");
    assert_eq!(s1.remote_key(), a.public_key_hex());
    assert_eq!(s2.remote_key(), a.public_key_hex());
}

#[tokio::test]
async fn concurrent_dials_share_one_attempt() {
    let hub = MemoryHub::new();
    let a = config_with(0x05);
    let b = config_with(0x06);
    let fabric_a = hub.join(a.public_key_bytes());
    let fabric_b = hub.join(b.public_key_bytes());

    let (transport_a, _la) = Transport::new(a.clone(), fabric_a).unwrap();
    let (_tb, mut listener_b) = Transport::new(b.clone(), fabric_b).unwrap();

    let transport = Arc::new(transport_a);
    let host = b.public_key_hex();
    let mut dials = Vec::new();
    for _ in 0..4 {
        let transport = transport.clone();
        let host = host.clone();
        dials.push(tokio::spawn(async move { transport.dial(&host).await }));
    }
    for dial in dials {
        dial.await.unwrap().expect("dial succeeds");
    }
    for _ in 0..4 {
        let stream = listener_b.accept().await.expect("stream");
        assert_eq!(stream.remote_key(), a.public_key_hex());
    }
}

#[tokio::test]
async fn dialing_an_unroutable_key_fails() {
    let hub = MemoryHub::new();
    let a = config_with(0x07);
    let fabric_a = hub.join(a.public_key_bytes());
    let (transport_a, _la) = Transport::new(a.clone(), fabric_a).unwrap();

    let stranger = config_with(0x08);
    let err = transport_a
        .dial(&stranger.public_key_hex())
        .await
        .expect_err("no route");
    assert!(!err.message.is_empty());
}

#[tokio::test]
async fn impersonating_fabric_peer_fails_the_handshake() {
    let hub = MemoryHub::new();
    let a = config_with(0x0a);
    let victim = config_with(0x0b);
    let impostor = config_with(0x0c);

    let fabric_a = hub.join(a.public_key_bytes());
    // The impostor squats on the victim's key at the routing layer, but
    // its TLS identity is its own.
    let fabric_impostor = hub.join(victim.public_key_bytes());

    let (transport_a, _la) = Transport::new(a.clone(), fabric_a).unwrap();
    let (_ti, mut listener_i) = Transport::new(impostor.clone(), fabric_impostor).unwrap();

    let victim_key = victim.public_key_hex();
    let dial = transport_a.dial(&victim_key);
    let accept = tokio::spawn(async move { listener_i.accept().await });
    assert!(dial.await.is_err(), "pinned verifier must reject the impostor");
    accept.abort();
}

#[tokio::test]
async fn dialing_garbage_fails_fast() {
    let hub = MemoryHub::new();
    let a = config_with(0x09);
    let fabric_a = hub.join(a.public_key_bytes());
    let (transport_a, _la) = Transport::new(a.clone(), fabric_a).unwrap();

    assert!(transport_a.dial("not-hex").await.is_err());
    assert!(transport_a.dial("abcd").await.is_err());
}
