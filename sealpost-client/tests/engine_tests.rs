mod support;

use pretty_assertions::assert_eq;
use sealpost_client::coordinator::{PLACEHOLDER_ENCRYPTED, PLACEHOLDER_FAILED, PLACEHOLDER_SENT};
use sealpost_client::{
    create_conversation_engine, ClientConfig, ClientError, ConversationEvent, ConversationHandle,
    DecryptState, DisplayLine, MemoryKeyStore, SecureKeyStore, UserId,
};
use sealpost_crypto::{EnvelopeEncoder, KeyPair, PayloadType};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use support::{FakeServer, ALICE, ALICE_ID, BOB, BOB_ID};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

struct Running {
    handle: ConversationHandle,
    events: mpsc::Receiver<ConversationEvent>,
    task: JoinHandle<()>,
}

fn config() -> ClientConfig {
    ClientConfig {
        // Tests drive polling through refresh().
        poll_interval_ms: 60_000,
        ..ClientConfig::default()
    }
}

fn start_with(
    server: &Arc<FakeServer>,
    store: Arc<dyn SecureKeyStore>,
    config: ClientConfig,
    local: UserId,
    contact: UserId,
) -> Running {
    support::init_tracing();
    let (event_tx, events) = mpsc::channel(256);
    let (handle, mut engine) = create_conversation_engine(
        Arc::clone(server),
        store,
        EnvelopeEncoder::default(),
        config,
        local,
        contact,
        event_tx,
    )
    .unwrap();
    let task = tokio::spawn(async move { engine.run().await });
    Running {
        handle,
        events,
        task,
    }
}

fn start(server: &Arc<FakeServer>, keys: &KeyPair, local: UserId, contact: UserId) -> Running {
    let store = Arc::new(MemoryKeyStore::with_key(keys.private_key.clone()));
    start_with(server, store, config(), local, contact)
}

/// Polls the snapshot until `done` holds, or panics after five seconds.
async fn wait_for(handle: &ConversationHandle, done: impl Fn(&[DisplayLine]) -> bool) -> Vec<DisplayLine> {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let lines = handle.snapshot().await;
            if done(&lines) {
                return lines;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time")
}

fn all_resolved(lines: &[DisplayLine]) -> bool {
    lines.iter().all(|l| l.state != DecryptState::Decrypting && l.state != DecryptState::Ciphertext)
}

fn seal_for_bob(text: &str) -> sealpost_crypto::Envelope {
    EnvelopeEncoder::default()
        .seal_text(text, &BOB.public_key.parse().unwrap())
        .unwrap()
}

// ── Poll and decrypt ──

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn poll_then_decrypt_all() {
    let server = Arc::new(FakeServer::alice_and_bob());
    server.deliver(ALICE_ID, BOB_ID, seal_for_bob("hello"));

    let bob = start(&server, &BOB, BOB_ID, ALICE_ID);
    bob.handle.refresh().await.unwrap();

    let lines = bob.handle.snapshot().await;
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0].text, PLACEHOLDER_ENCRYPTED);
    assert_eq!(bob.handle.stats().await.jobs_issued, 0);

    bob.handle.decrypt_all().await.unwrap();
    let lines = wait_for(&bob.handle, |l| all_resolved(l)).await;
    assert_eq!(lines[0].state, DecryptState::Decrypted);
    assert_eq!(lines[0].text, "hello");

    // Resolved messages never run crypto again.
    let stats = bob.handle.stats().await;
    bob.handle.decrypt_all().await.unwrap();
    bob.handle.refresh().await.unwrap();
    assert_eq!(bob.handle.stats().await, stats);

    bob.handle.stop().await.unwrap();
    bob.task.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn corrupt_message_renders_as_failed_among_good_ones() {
    let server = Arc::new(FakeServer::alice_and_bob());
    server.deliver(ALICE_ID, BOB_ID, seal_for_bob("before"));
    server.deliver_corrupt(ALICE_ID, BOB_ID);
    server.deliver(ALICE_ID, BOB_ID, seal_for_bob("after"));

    let bob = start(&server, &BOB, BOB_ID, ALICE_ID);
    assert_eq!(bob.handle.refresh().await.unwrap(), 3);

    bob.handle.decrypt_all().await.unwrap();
    let lines = wait_for(&bob.handle, |l| all_resolved(l)).await;
    let texts: Vec<&str> = lines.iter().map(|l| l.text.as_str()).collect();
    assert_eq!(texts, vec!["before", PLACEHOLDER_FAILED, "after"]);
    assert_eq!(lines[1].state, DecryptState::Failed);

    bob.handle.stop().await.unwrap();
    bob.task.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn new_messages_stay_encrypted_until_asked() {
    let server = Arc::new(FakeServer::alice_and_bob());
    server.deliver(ALICE_ID, BOB_ID, seal_for_bob("first"));

    let bob = start(&server, &BOB, BOB_ID, ALICE_ID);
    bob.handle.refresh().await.unwrap();
    bob.handle.decrypt_all().await.unwrap();
    wait_for(&bob.handle, |l| all_resolved(l)).await;

    server.deliver(ALICE_ID, BOB_ID, seal_for_bob("second"));
    assert_eq!(bob.handle.refresh().await.unwrap(), 1);

    let lines = bob.handle.snapshot().await;
    assert_eq!(lines[0].text, "first");
    assert_eq!(lines[1].text, PLACEHOLDER_ENCRYPTED);
    bob.handle.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn decrypt_single_message() {
    let server = Arc::new(FakeServer::alice_and_bob());
    let first = server.deliver(ALICE_ID, BOB_ID, seal_for_bob("one"));
    server.deliver(ALICE_ID, BOB_ID, seal_for_bob("two"));

    let bob = start(&server, &BOB, BOB_ID, ALICE_ID);
    bob.handle.refresh().await.unwrap();
    bob.handle.decrypt(first.clone()).await.unwrap();

    let lines = wait_for(&bob.handle, |l| l[0].state == DecryptState::Decrypted).await;
    assert_eq!(lines[0].text, "one");
    assert_eq!(lines[1].state, DecryptState::Ciphertext);
    bob.handle.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn many_messages_with_one_worker() {
    let server = Arc::new(FakeServer::alice_and_bob());
    for i in 0..6 {
        server.deliver(ALICE_ID, BOB_ID, seal_for_bob(&format!("msg {i}")));
    }

    let store = Arc::new(MemoryKeyStore::with_key(BOB.private_key.clone()));
    let config = ClientConfig {
        max_decrypt_workers: 1,
        ..config()
    };
    let bob = start_with(&server, store, config, BOB_ID, ALICE_ID);
    bob.handle.refresh().await.unwrap();
    bob.handle.decrypt_all().await.unwrap();

    let lines = wait_for(&bob.handle, |l| all_resolved(l)).await;
    let texts: Vec<&str> = lines.iter().map(|l| l.text.as_str()).collect();
    assert_eq!(texts, vec!["msg 0", "msg 1", "msg 2", "msg 3", "msg 4", "msg 5"]);
    assert_eq!(bob.handle.stats().await.decrypted, 6);
    bob.handle.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_private_key_fails_batch() {
    let server = Arc::new(FakeServer::alice_and_bob());
    server.deliver(ALICE_ID, BOB_ID, seal_for_bob("unreachable"));

    let bob = start_with(
        &server,
        Arc::new(MemoryKeyStore::new()),
        config(),
        BOB_ID,
        ALICE_ID,
    );
    bob.handle.refresh().await.unwrap();
    bob.handle.decrypt_all().await.unwrap();

    let lines = wait_for(&bob.handle, |l| all_resolved(l)).await;
    assert_eq!(lines[0].state, DecryptState::Failed);
    assert_eq!(lines[0].text, PLACEHOLDER_FAILED);
    bob.handle.stop().await.unwrap();
}

// ── Sending ──

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn alice_sends_bob_reads() {
    let server = Arc::new(FakeServer::alice_and_bob());

    let alice = start(&server, &ALICE, ALICE_ID, BOB_ID);
    let receipt = alice.handle.send_text("hello bob").await.unwrap();

    // Alice sees her retained plaintext, never a decrypt attempt.
    let lines = alice.handle.snapshot().await;
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0].id, receipt.id);
    assert_eq!(lines[0].state, DecryptState::Own);
    assert_eq!(lines[0].text, "hello bob");
    assert_eq!(alice.handle.stats().await.jobs_issued, 0);

    let bob = start(&server, &BOB, BOB_ID, ALICE_ID);
    bob.handle.refresh().await.unwrap();
    bob.handle.decrypt_all().await.unwrap();
    let lines = wait_for(&bob.handle, |l| all_resolved(l)).await;
    assert_eq!(lines[0].text, "hello bob");

    alice.handle.stop().await.unwrap();
    bob.handle.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sent_placeholder_without_retention() {
    let server = Arc::new(FakeServer::alice_and_bob());
    let store = Arc::new(MemoryKeyStore::with_key(ALICE.private_key.clone()));
    let config = ClientConfig {
        retain_sent_plaintext: false,
        ..config()
    };
    let alice = start_with(&server, store, config, ALICE_ID, BOB_ID);
    alice.handle.send_text("gone once sent").await.unwrap();

    let lines = alice.handle.snapshot().await;
    assert_eq!(lines[0].text, PLACEHOLDER_SENT);
    alice.handle.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn send_to_unknown_contact_fails() {
    let server = Arc::new(FakeServer::alice_and_bob());
    let alice = start(&server, &ALICE, ALICE_ID, 404);

    let err = alice.handle.send_text("anyone there?").await.unwrap_err();
    assert!(matches!(err, ClientError::NotFound(_)));
    assert_eq!(server.message_count(), 0);
    alice.handle.stop().await.unwrap();
}

// ── Attachments ──

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn attachment_flow() {
    let server = Arc::new(FakeServer::alice_and_bob());
    let photo: Vec<u8> = (0..=255u8).cycle().take(64 * 1024).collect();

    let alice = start(&server, &ALICE, ALICE_ID, BOB_ID);
    alice
        .handle
        .send_file(photo.clone(), PayloadType::Image, "cat.jpg")
        .await
        .unwrap();
    assert_eq!(alice.handle.snapshot().await[0].text, "[Image: cat.jpg]");

    let bob = start(&server, &BOB, BOB_ID, ALICE_ID);
    bob.handle.refresh().await.unwrap();
    let id = bob.handle.snapshot().await[0].id.clone();

    let err = bob.handle.open_attachment(id.clone()).await.unwrap_err();
    assert!(matches!(err, ClientError::NotReady(_)));

    bob.handle.decrypt_all().await.unwrap();
    let lines = wait_for(&bob.handle, |l| all_resolved(l)).await;
    assert_eq!(lines[0].text, "[Image]");

    let opened = bob.handle.open_attachment(id).await.unwrap();
    assert!(opened.as_slice() == photo.as_slice());

    alice.handle.stop().await.unwrap();
    bob.handle.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn tampered_attachment_blob_rejected() {
    let server = Arc::new(FakeServer::alice_and_bob());
    let enc = EnvelopeEncoder::default();
    let bob_pub = BOB.public_key.parse().unwrap();
    let id = server.deliver_attachment(
        ALICE_ID,
        BOB_ID,
        enc.seal_file(b"real", PayloadType::File, &bob_pub).unwrap(),
        "a.txt",
    );
    let other = enc.seal_file(b"fake", PayloadType::File, &bob_pub).unwrap();
    server.replace_file(&id, other.to_json_bytes().unwrap());

    let bob = start(&server, &BOB, BOB_ID, ALICE_ID);
    bob.handle.refresh().await.unwrap();
    bob.handle.decrypt_all().await.unwrap();
    wait_for(&bob.handle, |l| all_resolved(l)).await;

    assert!(bob.handle.open_attachment(id).await.is_err());
    bob.handle.stop().await.unwrap();
}

// ── Lifecycle ──

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_tears_down() {
    let server = Arc::new(FakeServer::alice_and_bob());
    for i in 0..4 {
        server.deliver(ALICE_ID, BOB_ID, seal_for_bob(&format!("{i}")));
    }

    let mut bob = start(&server, &BOB, BOB_ID, ALICE_ID);
    bob.handle.refresh().await.unwrap();
    bob.handle.decrypt_all().await.unwrap();
    bob.handle.stop().await.unwrap();
    bob.task.await.unwrap();

    assert!(bob.handle.snapshot().await.is_empty());
    assert!(matches!(bob.handle.decrypt_all().await, Err(ClientError::EngineStopped)));
    assert!(matches!(bob.handle.refresh().await, Err(ClientError::EngineStopped)));

    let mut saw_stopped = false;
    while let Ok(event) = bob.events.try_recv() {
        saw_stopped |= event == ConversationEvent::Stopped;
    }
    assert!(saw_stopped);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_abandons_hung_poll() {
    let server = Arc::new(FakeServer::alice_and_bob());
    server.stall_fetch.store(true, Ordering::SeqCst);

    // The first timer tick fires at once and its fetch never returns.
    let mut bob = start(&server, &BOB, BOB_ID, ALICE_ID);
    tokio::time::timeout(Duration::from_secs(5), async {
        while server.fetch_calls.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    let _ = bob.handle.stop().await;
    tokio::time::timeout(Duration::from_secs(2), &mut bob.task)
        .await
        .expect("engine waited on the hung poll")
        .unwrap();

    let mut saw_stopped = false;
    while let Ok(event) = bob.events.try_recv() {
        saw_stopped |= event == ConversationEvent::Stopped;
    }
    assert!(saw_stopped);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dropping_handles_stops_engine() {
    let server = Arc::new(FakeServer::alice_and_bob());
    let bob = start(&server, &BOB, BOB_ID, ALICE_ID);
    let extra = bob.handle.clone();
    drop(bob.handle);
    drop(extra);

    tokio::time::timeout(Duration::from_secs(5), bob.task)
        .await
        .expect("engine did not stop")
        .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn poll_failure_reported_and_engine_survives() {
    let server = Arc::new(FakeServer::alice_and_bob());
    server.fail_fetch.store(true, Ordering::SeqCst);

    let mut bob = start(&server, &BOB, BOB_ID, ALICE_ID);
    assert!(bob.handle.refresh().await.is_err());

    server.fail_fetch.store(false, Ordering::SeqCst);
    server.deliver(ALICE_ID, BOB_ID, seal_for_bob("back online"));
    assert_eq!(bob.handle.refresh().await.unwrap(), 1);

    // Failed polls are reported whether timer- or refresh-driven.
    let event = tokio::time::timeout(Duration::from_secs(5), bob.events.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(event, ConversationEvent::PollFailed { .. }));
    bob.handle.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn periodic_poll_picks_up_messages() {
    let server = Arc::new(FakeServer::alice_and_bob());
    let store = Arc::new(MemoryKeyStore::with_key(BOB.private_key.clone()));
    let config = ClientConfig {
        poll_interval_ms: 20,
        ..config()
    };
    let bob = start_with(&server, store, config, BOB_ID, ALICE_ID);

    tokio::time::timeout(Duration::from_secs(5), async {
        while server.fetch_calls.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    server.deliver(ALICE_ID, BOB_ID, seal_for_bob("polled"));
    let lines = wait_for(&bob.handle, |l| !l.is_empty()).await;
    assert_eq!(lines[0].state, DecryptState::Ciphertext);
    assert!(server.fetch_calls.load(Ordering::SeqCst) >= 2);
    bob.handle.stop().await.unwrap();
}
