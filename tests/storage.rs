/*
 * storage.rs
 * Copyright (C) 2026 Yggmail developers
 *
 * Store invariants: UID assignment and monotonicity, flag semantics,
 * tombstone/expunge, protected mailboxes, rename cascade, queue
 * consistency and password handling, all against a real database file.
 */

mod common;

use common::temp_db;
use yggmail::storage::{Storage, StorageError, MAILBOX_INBOX, MAILBOX_OUTBOX};

async fn open() -> Storage {
    Storage::open(temp_db("storage")).await.expect("open")
}

#[tokio::test]
async fn mail_create_round_trips_bytes_and_time() {
    let storage = open().await;
    let before = chrono::Utc::now().timestamp();
    let uid = storage
        .mail_create(MAILBOX_INBOX, b"Subject: x\r\n\r\nbody".to_vec())
        .await
        .unwrap();
    let (seq, mail) = storage.mail_select(MAILBOX_INBOX, uid).await.unwrap();
    assert_eq!(seq, 1);
    assert_eq!(mail.mail, b"Subject: x\r\n\r\nbody");
    assert!(mail.datetime >= before);
    assert!(mail.datetime <= chrono::Utc::now().timestamp());
    assert_eq!(mail.flags(), (false, false, false, false));
}

#[tokio::test]
async fn uids_are_strictly_increasing_and_never_reused() {
    let storage = open().await;
    let a = storage.mail_create(MAILBOX_INBOX, b"a".to_vec()).await.unwrap();
    let b = storage.mail_create(MAILBOX_INBOX, b"b".to_vec()).await.unwrap();
    let c = storage.mail_create(MAILBOX_INBOX, b"c".to_vec()).await.unwrap();
    assert!(a < b && b < c);

    let uids = storage.mail_search(MAILBOX_INBOX).await.unwrap();
    assert_eq!(uids, vec![a, b, c]);
    assert_eq!(storage.mail_next_id(MAILBOX_INBOX).await.unwrap(), c + 1);

    // Expunging a middle message leaves a gap; new UIDs keep climbing.
    storage.mail_delete(MAILBOX_INBOX, b).await.unwrap();
    storage.mail_expunge(MAILBOX_INBOX).await.unwrap();
    let d = storage.mail_create(MAILBOX_INBOX, b"d".to_vec()).await.unwrap();
    assert!(d > c);
    assert_eq!(storage.mail_search(MAILBOX_INBOX).await.unwrap(), vec![a, c, d]);
}

#[tokio::test]
async fn empty_mailbox_next_id_is_one() {
    let storage = open().await;
    assert_eq!(storage.mail_next_id(MAILBOX_INBOX).await.unwrap(), 1);
}

#[tokio::test]
async fn sequence_numbers_are_a_view() {
    let storage = open().await;
    for body in [b"1", b"2", b"3"] {
        storage.mail_create(MAILBOX_INBOX, body.to_vec()).await.unwrap();
    }
    storage.mail_delete(MAILBOX_INBOX, 1).await.unwrap();
    storage.mail_expunge(MAILBOX_INBOX).await.unwrap();

    // UID 2 is now the first message.
    let (seq, mail) = storage.mail_select(MAILBOX_INBOX, 2).await.unwrap();
    assert_eq!(seq, 1);
    assert_eq!(mail.mail, b"2");
    assert_eq!(storage.mail_id_for_seq(MAILBOX_INBOX, 2).await.unwrap(), 3);
}

#[tokio::test]
async fn flag_updates_are_set_semantics() {
    let storage = open().await;
    let uid = storage.mail_create(MAILBOX_INBOX, b"m".to_vec()).await.unwrap();
    storage
        .mail_update_flags(MAILBOX_INBOX, uid, true, false, true, false)
        .await
        .unwrap();
    let (_, mail) = storage.mail_select(MAILBOX_INBOX, uid).await.unwrap();
    assert_eq!(mail.flags(), (true, false, true, false));

    storage
        .mail_update_flags(MAILBOX_INBOX, uid, false, true, false, true)
        .await
        .unwrap();
    let (_, mail) = storage.mail_select(MAILBOX_INBOX, uid).await.unwrap();
    assert_eq!(mail.flags(), (false, true, false, true));
    assert_eq!(storage.mail_unseen(MAILBOX_INBOX).await.unwrap(), 1);
}

#[tokio::test]
async fn expunge_removes_only_tombstoned_mail() {
    let storage = open().await;
    let keep = storage.mail_create(MAILBOX_INBOX, b"keep".to_vec()).await.unwrap();
    let gone = storage.mail_create(MAILBOX_INBOX, b"gone".to_vec()).await.unwrap();
    storage.mail_delete(MAILBOX_INBOX, gone).await.unwrap();

    // Tombstoned but still present until expunge.
    assert!(storage.mail_select(MAILBOX_INBOX, gone).await.is_ok());
    storage.mail_expunge(MAILBOX_INBOX).await.unwrap();
    assert!(matches!(
        storage.mail_select(MAILBOX_INBOX, gone).await,
        Err(StorageError::NotFound)
    ));
    assert!(storage.mail_select(MAILBOX_INBOX, keep).await.is_ok());
}

#[tokio::test]
async fn protected_mailboxes_cannot_be_deleted_or_renamed() {
    let storage = open().await;
    let uid = storage.mail_create(MAILBOX_INBOX, b"m".to_vec()).await.unwrap();
    for name in ["INBOX", "Outbox", "Sent"] {
        assert!(matches!(
            storage.mailbox_delete(name).await,
            Err(StorageError::Protected(_))
        ));
        assert!(matches!(
            storage.mailbox_rename(name, "Elsewhere").await,
            Err(StorageError::Protected(_))
        ));
    }
    // No side effects: INBOX still listed, mail still there.
    let names = storage.mailbox_list(false).await.unwrap();
    assert!(names.contains(&"INBOX".to_string()));
    assert!(names.contains(&"Outbox".to_string()));
    assert!(storage.mail_select(MAILBOX_INBOX, uid).await.is_ok());
}

#[tokio::test]
async fn rename_cascades_to_mails_and_queue() {
    let storage = open().await;
    storage.mailbox_create("Archive").await.unwrap();
    let uid = storage.mail_create("Archive", b"m".to_vec()).await.unwrap();
    storage.mailbox_rename("Archive", "Vault").await.unwrap();

    let (_, mail) = storage.mail_select("Vault", uid).await.unwrap();
    assert_eq!(mail.mailbox, "Vault");
    assert!(matches!(
        storage.mail_select("Archive", uid).await,
        Err(StorageError::NotFound)
    ));
    assert!(!storage.mailbox_select("Archive").await.unwrap());
    assert!(storage.mailbox_select("Vault").await.unwrap());
}

#[tokio::test]
async fn mailbox_delete_cascades_to_mails() {
    let storage = open().await;
    storage.mailbox_create("Junk").await.unwrap();
    let uid = storage.mail_create("Junk", b"m".to_vec()).await.unwrap();
    storage.mailbox_delete("Junk").await.unwrap();
    assert!(matches!(
        storage.mail_select("Junk", uid).await,
        Err(StorageError::NotFound)
    ));
}

#[tokio::test]
async fn mail_move_assigns_destination_uid() {
    let storage = open().await;
    storage.mailbox_create("Archive").await.unwrap();
    storage.mail_create("Archive", b"existing".to_vec()).await.unwrap();
    let uid = storage.mail_create(MAILBOX_INBOX, b"moving".to_vec()).await.unwrap();

    let new_uid = storage.mail_move(MAILBOX_INBOX, uid, "Archive").await.unwrap();
    assert_eq!(new_uid, 2);
    let (_, mail) = storage.mail_select("Archive", new_uid).await.unwrap();
    assert_eq!(mail.mail, b"moving");
    assert!(matches!(
        storage.mail_select(MAILBOX_INBOX, uid).await,
        Err(StorageError::NotFound)
    ));

    // Moving into the Outbox is refused.
    let uid = storage.mail_create(MAILBOX_INBOX, b"no".to_vec()).await.unwrap();
    assert!(matches!(
        storage.mail_move(MAILBOX_INBOX, uid, MAILBOX_OUTBOX).await,
        Err(StorageError::Protected(_))
    ));
}

#[tokio::test]
async fn queue_rows_track_destinations() {
    let storage = open().await;
    let uid = storage.mail_create(MAILBOX_OUTBOX, b"m".to_vec()).await.unwrap();
    let destinations = ["aa".repeat(32), "bb".repeat(32), "cc".repeat(32)];
    for dest in &destinations {
        storage
            .queue_insert_destination_for_id(dest, uid, "me@yggmail", "them@yggmail")
            .await
            .unwrap();
    }

    let mut listed = storage.queue_list_destinations().await.unwrap();
    listed.sort();
    assert_eq!(listed.len(), 3);
    assert!(storage
        .queue_select_is_message_pending_send(MAILBOX_OUTBOX, uid)
        .await
        .unwrap());

    // Drain two of three destinations; the mail must survive.
    for dest in &destinations[..2] {
        storage.queue_delete_destination_for_id(dest, uid).await.unwrap();
    }
    assert_eq!(storage.queue_list_destinations().await.unwrap().len(), 1);
    assert!(storage
        .queue_select_is_message_pending_send(MAILBOX_OUTBOX, uid)
        .await
        .unwrap());

    // Drain the last; now nothing is pending and the Outbox copy may go.
    storage
        .queue_delete_destination_for_id(&destinations[2], uid)
        .await
        .unwrap();
    assert!(!storage
        .queue_select_is_message_pending_send(MAILBOX_OUTBOX, uid)
        .await
        .unwrap());
}

#[tokio::test]
async fn queue_rows_ordered_by_uid_descending() {
    let storage = open().await;
    let dest = "dd".repeat(32);
    let first = storage.mail_create(MAILBOX_OUTBOX, b"1".to_vec()).await.unwrap();
    let second = storage.mail_create(MAILBOX_OUTBOX, b"2".to_vec()).await.unwrap();
    for uid in [first, second] {
        storage
            .queue_insert_destination_for_id(&dest, uid, "me@yggmail", "you@yggmail")
            .await
            .unwrap();
    }
    let entries = storage.queue_mail_ids_for_destination(&dest).await.unwrap();
    let ids: Vec<u32> = entries.iter().map(|e| e.id).collect();
    assert_eq!(ids, vec![second, first]);
    assert_eq!(entries[0].from, "me@yggmail");
    assert_eq!(entries[0].rcpt, "you@yggmail");
}

#[tokio::test]
async fn queue_rows_cascade_when_mail_is_expunged() {
    let storage = open().await;
    let uid = storage.mail_create(MAILBOX_OUTBOX, b"m".to_vec()).await.unwrap();
    storage
        .queue_insert_destination_for_id(&"ee".repeat(32), uid, "me@yggmail", "you@yggmail")
        .await
        .unwrap();
    storage.mail_delete(MAILBOX_OUTBOX, uid).await.unwrap();
    storage.mail_expunge(MAILBOX_OUTBOX).await.unwrap();
    assert!(storage.queue_list_destinations().await.unwrap().is_empty());
}

#[tokio::test]
async fn config_is_a_simple_upsert_table() {
    let storage = open().await;
    assert_eq!(storage.config_get("missing").await.unwrap(), "");
    storage.config_set("k", "v1").await.unwrap();
    storage.config_set("k", "v2").await.unwrap();
    assert_eq!(storage.config_get("k").await.unwrap(), "v2");
}

#[tokio::test]
async fn password_verification() {
    let storage = open().await;
    // No hash stored: anything goes.
    assert!(storage.config_try_password("whatever").await.unwrap());

    // Low cost keeps the test quick; the format is the same.
    let hash = bcrypt::hash("sekrit", 4).unwrap();
    storage.config_set_password(&hash).await.unwrap();
    assert!(storage.config_try_password("sekrit").await.unwrap());
    assert!(!storage.config_try_password("wrong").await.unwrap());

    // A malformed stored hash fails closed.
    storage.config_set_password("not-a-bcrypt-hash").await.unwrap();
    assert!(!storage.config_try_password("sekrit").await.unwrap());
}

#[tokio::test]
async fn mailboxes_are_created_idempotently() {
    let storage = open().await;
    storage.mailbox_create("Twice").await.unwrap();
    storage.mailbox_create("Twice").await.unwrap();
    let names = storage.mailbox_list(false).await.unwrap();
    assert_eq!(names.iter().filter(|n| n.as_str() == "Twice").count(), 1);
}

#[tokio::test]
async fn subscription_filters_list() {
    let storage = open().await;
    storage.mailbox_create("Quiet").await.unwrap();
    storage.mailbox_subscribe("Quiet", false).await.unwrap();
    let all = storage.mailbox_list(false).await.unwrap();
    let subscribed = storage.mailbox_list(true).await.unwrap();
    assert!(all.contains(&"Quiet".to_string()));
    assert!(!subscribed.contains(&"Quiet".to_string()));
    // Default subscription is on.
    assert!(subscribed.contains(&"INBOX".to_string()));
}
