mod common;

use common::Scratch;
use courrier::{
    Attributes, EventKind, Mailbox, MailboxEvent, ObserverAction, OpenOptions, OutgoingMessage,
};
use courrier::Envelope;

async fn open_rw(path: &std::path::Path) -> Mailbox {
    Mailbox::open(path.to_str().unwrap(), OpenOptions::create())
        .await
        .unwrap()
}

fn simple_message(subject: &str, body: &str) -> OutgoingMessage {
    OutgoingMessage::from_bytes(format!(
        "From: a@x\nSubject: {}\n\n{}",
        subject, body
    ))
}

#[tokio::test]
async fn minimal_append_lays_out_envelope_headers_and_uid() {
    let s = Scratch::new("mbox-minimal");
    let path = s.file("mbox1");
    std::fs::write(&path, b"").unwrap();

    let mbx = open_rw(&path).await;
    // Force UID initialization so the append records X-IMAPbase.
    assert!(mbx.uidvalidity().await.unwrap() > 0);
    mbx.append(&simple_message("s", "hi\n")).await.unwrap();

    assert_eq!(mbx.count().await.unwrap(), 1);
    assert_eq!(mbx.message_uid(1).await.unwrap(), 1);
    assert_eq!(mbx.uidnext().await.unwrap(), 2);
    mbx.close().await.unwrap();

    let data = std::fs::read(&path).unwrap();
    let text = String::from_utf8_lossy(&data);
    assert!(text.starts_with("From a@x "));
    // The envelope line carries a 24-byte ctime-style date.
    let envelope_line = text.lines().next().unwrap();
    assert_eq!(envelope_line.len(), "From a@x ".len() + 24);
    assert!(text.contains("\nFrom: a@x\nSubject: s\nX-IMAPbase:"));
    assert!(text.contains("\nX-UID: 1\n"));
    assert!(text.ends_with("\nhi\n"));
}

#[tokio::test]
async fn from_quoting_round_trips() {
    let s = Scratch::new("mbox-quote");
    let path = s.file("mbox");
    std::fs::write(&path, b"").unwrap();

    let mbx = open_rw(&path).await;
    mbx.append(&simple_message("q", "From the start\nOK\n"))
        .await
        .unwrap();

    let data = std::fs::read(&path).unwrap();
    assert!(String::from_utf8_lossy(&data).contains("\n>From the start\nOK\n"));

    let msg = mbx.get_message(1).await.unwrap();
    assert_eq!(msg.read_body().await.unwrap(), b"From the start\nOK\n");
    mbx.close().await.unwrap();
}

#[tokio::test]
async fn append_flush_reopen_preserves_message_bytes() {
    let s = Scratch::new("mbox-roundtrip");
    let path = s.file("mbox");
    std::fs::write(&path, b"").unwrap();

    let header_bytes = b"From: a@x\nX-Weird: first\n\tfolded tail\nSubject: round trip\n";
    let body = b"line one\n\nFrom here\n";
    let mut raw = header_bytes.to_vec();
    raw.push(b'\n');
    raw.extend_from_slice(body);
    let msg = OutgoingMessage::from_bytes(raw)
        .with_envelope(Envelope::new("sender@x", "Wed Dec  2 05:53:22 1992"));

    let mbx = open_rw(&path).await;
    mbx.uidvalidity().await.unwrap();
    mbx.append(&msg).await.unwrap();
    mbx.close().await.unwrap();

    let mbx = Mailbox::open(path.to_str().unwrap(), OpenOptions::read_only())
        .await
        .unwrap();
    let got = mbx.get_message(1).await.unwrap();
    assert_eq!(
        got.headers()
            .to_bytes_excluding(&["X-IMAPbase", "X-UID", "Status"]),
        header_bytes.to_vec()
    );
    assert_eq!(got.read_body().await.unwrap(), body.to_vec());
    assert_eq!(got.envelope().sender, "sender@x");
    assert_eq!(got.envelope().date, "Wed Dec  2 05:53:22 1992");
    mbx.close().await.unwrap();
}

#[tokio::test]
async fn uids_are_monotone_and_below_uidnext() {
    let s = Scratch::new("mbox-uids");
    let path = s.file("mbox");
    std::fs::write(&path, b"").unwrap();

    let mbx = open_rw(&path).await;
    mbx.uidvalidity().await.unwrap();
    for i in 0..3 {
        mbx.append(&simple_message(&format!("m{}", i), "x\n"))
            .await
            .unwrap();
    }
    let uidnext = mbx.uidnext().await.unwrap();
    let mut prev = 0;
    for ordinal in 1..=3 {
        let uid = mbx.message_uid(ordinal).await.unwrap();
        assert!(uid > prev);
        assert!(uid < uidnext);
        prev = uid;
    }
    mbx.close().await.unwrap();
}

#[tokio::test]
async fn flag_subsets_survive_flush_and_reopen() {
    let s = Scratch::new("mbox-flags");
    let path = s.file("mbox");
    std::fs::write(&path, b"").unwrap();

    let subsets = [
        Attributes::SEEN | Attributes::READ,
        Attributes::ANSWERED | Attributes::FLAGGED | Attributes::DRAFT,
        Attributes::DELETED | Attributes::FORWARDED,
    ];

    let mbx = open_rw(&path).await;
    for i in 0..subsets.len() {
        mbx.append(&simple_message(&format!("m{}", i), "x\n"))
            .await
            .unwrap();
    }
    for (i, attrs) in subsets.iter().enumerate() {
        mbx.set_attributes(i + 1, *attrs).await.unwrap();
    }
    mbx.sync().await.unwrap();
    mbx.close().await.unwrap();

    let mbx = Mailbox::open(path.to_str().unwrap(), OpenOptions::read_only())
        .await
        .unwrap();
    for (i, attrs) in subsets.iter().enumerate() {
        assert_eq!(mbx.get_attributes(i + 1).await.unwrap(), *attrs, "message {}", i + 1);
    }
    mbx.close().await.unwrap();
}

#[tokio::test]
async fn expunge_removes_deleted_and_keeps_survivor_uids() {
    let s = Scratch::new("mbox-expunge");
    let path = s.file("mbox");
    std::fs::write(&path, b"").unwrap();

    let mbx = open_rw(&path).await;
    mbx.uidvalidity().await.unwrap();
    for name in ["one", "two", "three"] {
        mbx.append(&simple_message(name, "x\n")).await.unwrap();
    }
    let uid1 = mbx.message_uid(1).await.unwrap();
    let uid3 = mbx.message_uid(3).await.unwrap();

    mbx.add_attributes(2, Attributes::DELETED).await.unwrap();
    mbx.expunge().await.unwrap();

    assert_eq!(mbx.count().await.unwrap(), 2);
    assert_eq!(mbx.message_uid(1).await.unwrap(), uid1);
    assert_eq!(mbx.message_uid(2).await.unwrap(), uid3);
    let survivors = (
        mbx.get_message(1).await.unwrap(),
        mbx.get_message(2).await.unwrap(),
    );
    assert_eq!(survivors.0.headers().get("Subject"), Some("one"));
    assert_eq!(survivors.1.headers().get("Subject"), Some("three"));
    mbx.close().await.unwrap();
}

#[tokio::test]
async fn sync_without_changes_is_idempotent() {
    let s = Scratch::new("mbox-idem");
    let path = s.file("mbox");
    std::fs::write(&path, b"").unwrap();

    let mbx = open_rw(&path).await;
    mbx.uidvalidity().await.unwrap();
    mbx.append(&simple_message("a", "body\n")).await.unwrap();
    mbx.add_attributes(1, Attributes::READ).await.unwrap();
    mbx.sync().await.unwrap();

    let first = std::fs::read(&path).unwrap();
    mbx.sync().await.unwrap();
    let second = std::fs::read(&path).unwrap();
    assert_eq!(first, second);
    mbx.close().await.unwrap();

    // No rewrite scaffolding survives a completed flush.
    let leftovers: Vec<String> = std::fs::read_dir(s.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|n| n != "mbox")
        .collect();
    assert!(leftovers.is_empty(), "leftovers: {:?}", leftovers);
}

#[tokio::test]
async fn wide_imapbase_is_patched_in_place() {
    let s = Scratch::new("mbox-inplace");
    let path = s.file("mbox");
    let original = b"From a@x Wed Dec  2 05:53:22 1992\n\
From: a@x\n\
X-IMAPbase:       1000          5\n\
X-UID: 4\n\
\n\
body\n";
    std::fs::write(&path, original).unwrap();

    let mbx = Mailbox::open(path.to_str().unwrap(), OpenOptions::read_write())
        .await
        .unwrap();
    assert_eq!(mbx.uidvalidity().await.unwrap(), 1000);
    assert_eq!(mbx.message_uid(1).await.unwrap(), 4);
    mbx.set_uidvalidity(2000).await.unwrap();
    mbx.sync().await.unwrap();
    mbx.close().await.unwrap();

    let rewritten = std::fs::read(&path).unwrap();
    assert_eq!(rewritten.len(), original.len());
    let text = String::from_utf8_lossy(&rewritten);
    assert!(text.contains("X-IMAPbase:       2000          5"));
    // Everything outside the patched header line is untouched.
    assert!(text.starts_with("From a@x Wed Dec  2 05:53:22 1992\nFrom: a@x\n"));
    assert!(text.ends_with("X-UID: 4\n\nbody\n"));
}

#[tokio::test]
async fn shrunken_file_raises_corrupt_event() {
    let s = Scratch::new("mbox-shrink");
    let path = s.file("mbox");
    std::fs::write(&path, b"").unwrap();

    let mbx = open_rw(&path).await;
    mbx.append(&simple_message("one", "x\n")).await.unwrap();
    mbx.append(&simple_message("two", "y\n")).await.unwrap();
    assert_eq!(mbx.count().await.unwrap(), 2);

    let hits = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let h = hits.clone();
    mbx.observable().subscribe(
        EventKind::CORRUPT,
        Box::new(move |event| {
            assert_eq!(*event, MailboxEvent::Corrupt);
            h.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            ObserverAction::Continue
        }),
    );

    // Another writer truncated the file down to a single message.
    std::fs::write(&path, b"From a@x Wed Dec  2 05:53:22 1992\n\nz\n").unwrap();
    assert_eq!(mbx.count().await.unwrap(), 1);
    assert_eq!(hits.load(std::sync::atomic::Ordering::SeqCst), 1);
    mbx.close().await.unwrap();
}

#[tokio::test]
async fn external_growth_is_picked_up_incrementally() {
    let s = Scratch::new("mbox-grow");
    let path = s.file("mbox");
    std::fs::write(&path, b"").unwrap();

    let mbx = open_rw(&path).await;
    mbx.append(&simple_message("ours", "x\n")).await.unwrap();
    assert_eq!(mbx.count().await.unwrap(), 1);

    // A concurrent appender adds a message directly.
    let mut data = std::fs::read(&path).unwrap();
    data.extend_from_slice(b"\nFrom other@y Wed Dec  2 05:53:22 1992\nSubject: alien\n\nz\n");
    std::fs::write(&path, data).unwrap();

    assert_eq!(mbx.count().await.unwrap(), 2);
    let alien = mbx.get_message(2).await.unwrap();
    assert_eq!(alien.headers().get("Subject"), Some("alien"));
    assert_eq!(alien.envelope().sender, "other@y");
    mbx.close().await.unwrap();
}

#[tokio::test]
async fn preexisting_blank_terminated_mailbox_scans_cleanly() {
    let s = Scratch::new("mbox-fixture");
    let path = s.file("mbox");
    // Written by another agent: the last message already carries its
    // blank separator before EOF.
    std::fs::write(
        &path,
        b"From a@x Wed Dec  2 05:53:22 1992\nSubject: s\n\nhi\n\n",
    )
    .unwrap();

    let mbx = Mailbox::open(path.to_str().unwrap(), OpenOptions::read_only())
        .await
        .unwrap();
    assert_eq!(mbx.count().await.unwrap(), 1);
    let msg = mbx.get_message(1).await.unwrap();
    // The trailing blank is the separator, not part of the body.
    assert_eq!(msg.read_body().await.unwrap(), b"hi\n");
    mbx.close().await.unwrap();

    // Same layout with a message before it, so the end-of-file case
    // matches the mid-file one.
    std::fs::write(
        &path,
        b"From a@x Wed Dec  2 05:53:22 1992\nSubject: one\n\nbody one\n\n\
From b@y Wed Dec  2 05:53:22 1992\nSubject: two\n\nbody two\n\n",
    )
    .unwrap();
    let mbx = Mailbox::open(path.to_str().unwrap(), OpenOptions::read_only())
        .await
        .unwrap();
    assert_eq!(mbx.count().await.unwrap(), 2);
    let first = mbx.get_message(1).await.unwrap();
    let second = mbx.get_message(2).await.unwrap();
    assert_eq!(first.read_body().await.unwrap(), b"body one\n");
    assert_eq!(second.read_body().await.unwrap(), b"body two\n");
    assert_eq!(second.envelope().sender, "b@y");
    mbx.close().await.unwrap();
}

#[tokio::test]
async fn quick_get_fetches_by_byte_offset() {
    let s = Scratch::new("mbox-qget");
    let path = s.file("mbox");
    std::fs::write(&path, b"").unwrap();

    let mbx = open_rw(&path).await;
    mbx.append(&simple_message("first", "x\n")).await.unwrap();
    mbx.close().await.unwrap();

    let mbx = Mailbox::open(path.to_str().unwrap(), OpenOptions::read_only())
        .await
        .unwrap();
    let msg = mbx.quick_get_message("0").await.unwrap();
    assert_eq!(msg.headers().get("Subject"), Some("first"));
    mbx.close().await.unwrap();
}

#[tokio::test]
async fn quick_get_works_on_an_already_scanned_mailbox() {
    let s = Scratch::new("mbox-qget-scanned");
    let path = s.file("mbox");
    std::fs::write(&path, b"").unwrap();

    let mbx = open_rw(&path).await;
    let offsets = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = offsets.clone();
    mbx.observable().subscribe(
        EventKind::MESSAGE_APPEND,
        Box::new(move |event| {
            if let MailboxEvent::MessageAppend { offset } = event {
                sink.lock().unwrap().push(offset.clone());
            }
            ObserverAction::Continue
        }),
    );
    for name in ["one", "two", "three"] {
        mbx.append(&simple_message(name, "x\n")).await.unwrap();
    }
    // The index is populated before the quick fetch.
    assert_eq!(mbx.count().await.unwrap(), 3);

    let offsets = offsets.lock().unwrap().clone();
    let msg = mbx.quick_get_message(&offsets[1]).await.unwrap();
    assert_eq!(msg.headers().get("Subject"), Some("two"));
    assert_eq!(msg.ordinal(), 2);
    let msg = mbx.quick_get_message(&offsets[2]).await.unwrap();
    assert_eq!(msg.headers().get("Subject"), Some("three"));

    // A token that names no message start is refused.
    let bogus = (offsets[1].parse::<u64>().unwrap() + 1).to_string();
    assert!(matches!(
        mbx.quick_get_message(&bogus).await,
        Err(courrier::Error::Exists)
    ));
    mbx.close().await.unwrap();
}

#[tokio::test]
async fn append_and_expunge_events_fire() {
    let s = Scratch::new("mbox-events");
    let path = s.file("mbox");
    std::fs::write(&path, b"").unwrap();

    let mbx = open_rw(&path).await;
    let events = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = events.clone();
    mbx.observable().subscribe(
        EventKind::MESSAGE_APPEND | EventKind::MESSAGE_EXPUNGE,
        Box::new(move |event| {
            sink.lock().unwrap().push(event.clone());
            ObserverAction::Continue
        }),
    );

    mbx.append(&simple_message("a", "x\n")).await.unwrap();
    mbx.add_attributes(1, Attributes::DELETED).await.unwrap();
    mbx.expunge().await.unwrap();
    mbx.close().await.unwrap();

    let events = events.lock().unwrap();
    assert_eq!(
        events[0],
        MailboxEvent::MessageAppend {
            offset: "0".to_string()
        }
    );
    assert_eq!(
        events[1],
        MailboxEvent::MessageExpunge {
            ordinal: 1,
            expunged: 0
        }
    );
}

#[tokio::test]
async fn multipart_messages_are_readable_through_the_engine() {
    let s = Scratch::new("mbox-mime");
    let path = s.file("mbox");
    std::fs::write(&path, b"").unwrap();

    let mut builder = courrier::mime::MultipartBuilder::with_boundary("frontier");
    builder.add_part_bytes(b"Content-Type: text/plain\n", b"plain part\n");
    builder.add_part_bytes(b"Content-Type: text/html\n", b"<p>html part</p>\n");
    let mut body_stream = builder.into_stream().await.unwrap();
    let mut body = Vec::new();
    let mut chunk = [0u8; 256];
    loop {
        let n = body_stream.read(&mut chunk).await.unwrap();
        if n == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..n]);
    }

    let mut raw = Vec::new();
    raw.extend_from_slice(
        b"From: a@x\nContent-Type: multipart/mixed; boundary=\"frontier\"\n\n",
    );
    raw.extend_from_slice(&body);

    let mbx = open_rw(&path).await;
    mbx.append(&OutgoingMessage::from_bytes(raw)).await.unwrap();

    let msg = mbx.get_message(1).await.unwrap();
    let parts = msg.multipart().await.unwrap().expect("multipart expected");
    assert_eq!(parts.count(), 2);
    let mut part0 = parts.part_body_stream(0).await.unwrap();
    let mut got = Vec::new();
    loop {
        let n = part0.read(&mut chunk).await.unwrap();
        if n == 0 {
            break;
        }
        got.extend_from_slice(&chunk[..n]);
    }
    assert_eq!(got, b"plain part\n");
    mbx.close().await.unwrap();
}
