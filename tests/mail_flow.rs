/*
 * mail_flow.rs
 * Copyright (C) 2026 Yggmail developers
 *
 * End-to-end scenarios over real listeners and the in-memory fabric:
 * self delivery, delivery between two nodes with the EXISTS push, sender
 * restrictions, overlay spoofing, and queue durability across a restart.
 */

mod common;

use std::time::Duration;

use common::{start_node, temp_db, LineClient, MemoryHub};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use yggmail::storage::{MAILBOX_INBOX, MAILBOX_OUTBOX};
use yggmail::transport::Transport;
use yggmail::Node;

async fn submit_mail(node: &Node, from: &str, to: &str, body: &str) -> String {
    let mut smtp = LineClient::connect(node.smtp_addr()).await;
    assert!(smtp.read_line().await.starts_with("220"));
    smtp.send("EHLO tester").await;
    smtp.read_until_prefix("250 ").await;
    // No password is set on the test nodes, so any credentials pass.
    use base64::Engine;
    let creds = base64::engine::general_purpose::STANDARD.encode("\0tester\0anything");
    smtp.send(&format!("AUTH PLAIN {}", creds)).await;
    assert!(smtp.read_line().await.starts_with("235"));
    smtp.send(&format!("MAIL FROM:<{}>", from)).await;
    let mail_reply = smtp.read_line().await;
    if !mail_reply.starts_with("250") {
        return mail_reply;
    }
    smtp.send(&format!("RCPT TO:<{}>", to)).await;
    assert!(smtp.read_line().await.starts_with("250"));
    smtp.send("DATA").await;
    assert!(smtp.read_line().await.starts_with("354"));
    smtp.send(&format!("Subject: test\r\n\r\n{}", body)).await;
    smtp.send(".").await;
    let reply = smtp.read_line().await;
    smtp.send("QUIT").await;
    reply
}

async fn wait_for_count(node: &Node, mailbox: &str, expected: u32) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let count = node.storage().mail_count(mailbox).await.unwrap();
        if count == expected {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!(
                "{} never reached {} messages (currently {})",
                mailbox, expected, count
            );
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn self_delivery_and_imap_retrieval() {
    let hub = MemoryHub::new();
    let node = start_node(&hub, &temp_db("self")).await;
    let address = node.config().mail_address();

    let reply = submit_mail(&node, &address, &address, "hello").await;
    assert!(reply.starts_with("250"), "unexpected reply {:?}", reply);
    wait_for_count(&node, MAILBOX_INBOX, 1).await;

    // Nothing was queued: the mail went straight to INBOX.
    assert_eq!(
        node.storage().mail_count(MAILBOX_OUTBOX).await.unwrap(),
        0
    );

    let mut imap = LineClient::connect(node.imap_addr()).await;
    assert!(imap.read_line().await.starts_with("* OK"));
    imap.send("a1 LOGIN tester anything").await;
    imap.read_until_prefix("a1 OK").await;
    imap.send("a2 SELECT INBOX").await;
    let exists = imap.read_until_prefix("* 1 EXISTS").await;
    assert_eq!(exists, "* 1 EXISTS");
    imap.read_until_prefix("a2 OK").await;

    imap.send("a3 FETCH 1 BODY[TEXT]").await;
    let mut saw_body = false;
    loop {
        let line = imap.read_line().await;
        if line.contains("hello") {
            saw_body = true;
        }
        if line.starts_with("a3 ") {
            assert!(line.starts_with("a3 OK"));
            break;
        }
    }
    assert!(saw_body, "FETCH BODY[TEXT] did not return the body");

    imap.send("a4 LOGOUT").await;
    node.stop();
}

#[tokio::test]
async fn delivery_between_two_nodes() {
    let hub = MemoryHub::new();
    let node_a = start_node(&hub, &temp_db("a")).await;
    let node_b = start_node(&hub, &temp_db("b")).await;

    // A selected INBOX session on B should get the EXISTS push.
    let mut imap_b = LineClient::connect(node_b.imap_addr()).await;
    imap_b.read_line().await;
    imap_b.send("b1 LOGIN user pass").await;
    imap_b.read_until_prefix("b1 OK").await;
    imap_b.send("b2 SELECT INBOX").await;
    imap_b.read_until_prefix("b2 OK").await;

    let reply = submit_mail(
        &node_a,
        &node_a.config().mail_address(),
        &node_b.config().mail_address(),
        "over the overlay",
    )
    .await;
    assert!(reply.starts_with("250"), "unexpected reply {:?}", reply);

    wait_for_count(&node_b, MAILBOX_INBOX, 1).await;
    // Delivered: A's Outbox and queue drain completely.
    wait_for_count(&node_a, MAILBOX_OUTBOX, 0).await;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !node_a
        .storage()
        .queue_list_destinations()
        .await
        .unwrap()
        .is_empty()
    {
        assert!(tokio::time::Instant::now() < deadline, "queue never drained");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let push = imap_b.read_until_prefix("* 1 EXISTS").await;
    assert_eq!(push, "* 1 EXISTS");

    node_a.stop();
    node_b.stop();
}

#[tokio::test]
async fn forbidden_sender_is_rejected() {
    let hub = MemoryHub::new();
    let node = start_node(&hub, &temp_db("forbidden")).await;

    let other = yggmail::address::format_address(&[0x99; 32]);
    let reply = submit_mail(&node, &other, &node.config().mail_address(), "nope").await;
    assert!(reply.starts_with("550"), "expected 550, got {:?}", reply);
    assert!(reply.contains("not allowed to send outgoing mail"));

    assert_eq!(node.storage().mail_count(MAILBOX_INBOX).await.unwrap(), 0);
    assert_eq!(node.storage().mail_count(MAILBOX_OUTBOX).await.unwrap(), 0);
    node.stop();
}

#[tokio::test]
async fn overlay_spoof_terminates_the_session() {
    let hub = MemoryHub::new();
    let node_b = start_node(&hub, &temp_db("spoof-b")).await;

    // X is a real overlay node that will claim to be Y in MAIL FROM.
    let x = yggmail::Config::new(ed25519_dalek::SigningKey::from_bytes(&[0x77; 32]));
    let y = yggmail::Config::new(ed25519_dalek::SigningKey::from_bytes(&[0x88; 32]));
    let fabric_x = hub.join(x.public_key_bytes());
    let (transport_x, _lx) = Transport::new(x.clone(), fabric_x).unwrap();

    let stream = transport_x
        .dial(&node_b.config().public_key_hex())
        .await
        .unwrap();
    let (read, mut write) = tokio::io::split(stream);
    let mut reader = BufReader::new(read);

    let mut line = String::new();
    reader.read_line(&mut line).await.unwrap();
    assert!(line.starts_with("220"));

    write.write_all(b"EHLO spoofer\r\n").await.unwrap();
    loop {
        line.clear();
        reader.read_line(&mut line).await.unwrap();
        if line.starts_with("250 ") {
            break;
        }
    }

    let spoofed = yggmail::address::format_address(&y.public_key_bytes());
    write
        .write_all(format!("MAIL FROM:<{}>\r\n", spoofed).as_bytes())
        .await
        .unwrap();
    line.clear();
    reader.read_line(&mut line).await.unwrap();
    assert!(line.starts_with("550"), "expected 550, got {:?}", line);
    assert!(line.contains("not allowed to send incoming mail"));

    // The session is terminated: the next read hits EOF.
    line.clear();
    let n = reader.read_line(&mut line).await.unwrap();
    assert_eq!(n, 0, "session should be closed after a spoofed MAIL FROM");

    assert_eq!(
        node_b.storage().mail_count(MAILBOX_INBOX).await.unwrap(),
        0
    );
    node_b.stop();
}

#[tokio::test]
async fn protected_mailboxes_survive_imap_delete() {
    let hub = MemoryHub::new();
    let node = start_node(&hub, &temp_db("protected")).await;

    let mut imap = LineClient::connect(node.imap_addr()).await;
    imap.read_line().await;
    imap.send("p1 LOGIN user pass").await;
    imap.read_until_prefix("p1 OK").await;

    imap.send("p2 DELETE Outbox").await;
    let reply = imap.read_until_prefix("p2 ").await;
    assert!(reply.starts_with("p2 NO"), "expected NO, got {:?}", reply);

    imap.send("p3 LIST \"\" *").await;
    let mut saw_outbox = false;
    loop {
        let line = imap.read_line().await;
        if line.contains("\"Outbox\"") {
            saw_outbox = true;
        }
        if line.starts_with("p3 ") {
            break;
        }
    }
    assert!(saw_outbox, "Outbox disappeared from LIST");
    node.stop();
}

#[tokio::test]
async fn queued_mail_survives_restart_and_delivers() {
    let lonely_hub = MemoryHub::new();
    let db_a = temp_db("durable-a");
    let node_a = start_node(&lonely_hub, &db_a).await;

    // B does not exist yet: the submission is accepted and queued, but
    // delivery cannot happen.
    let b_identity = yggmail::Config::new(ed25519_dalek::SigningKey::from_bytes(&[0x55; 32]));
    let b_address = b_identity.mail_address();
    let reply = submit_mail(&node_a, &node_a.config().mail_address(), &b_address, "later").await;
    assert!(reply.starts_with("250"), "unexpected reply {:?}", reply);

    wait_for_count(&node_a, MAILBOX_OUTBOX, 1).await;
    assert_eq!(
        node_a.storage().queue_list_destinations().await.unwrap(),
        vec![b_identity.public_key_hex()]
    );
    node_a.stop();
    drop(node_a);

    // Restart A on a hub where B is reachable; the manager's first pass
    // picks the queue row up from the store and delivers it.
    let hub = MemoryHub::new();
    let db_b = temp_db("durable-b");
    let storage_b = yggmail::storage::Storage::open(&db_b).await.unwrap();
    storage_b
        .config_set(
            "private_key",
            &hex::encode(ed25519_dalek::SigningKey::from_bytes(&[0x55; 32]).to_bytes()),
        )
        .await
        .unwrap();
    drop(storage_b);
    let node_b = start_node(&hub, &db_b).await;
    assert_eq!(node_b.config().mail_address(), b_address);

    let node_a = start_node(&hub, &db_a).await;
    wait_for_count(&node_b, MAILBOX_INBOX, 1).await;
    wait_for_count(&node_a, MAILBOX_OUTBOX, 0).await;
    assert!(node_a
        .storage()
        .queue_list_destinations()
        .await
        .unwrap()
        .is_empty());

    node_a.stop();
    node_b.stop();
}
