mod common;

use common::Scratch;
use courrier::{Attributes, Mailbox, OpenOptions, OutgoingMessage};

fn url(dir: &std::path::Path) -> String {
    format!("maildir://{}", dir.display())
}

fn simple_message(subject: &str, body: &str) -> OutgoingMessage {
    OutgoingMessage::from_bytes(format!("From: a@x\nSubject: {}\n\n{}", subject, body))
}

fn dir_entries(path: &std::path::Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(path)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|n| !n.starts_with('.'))
        .collect();
    names.sort();
    names
}

#[tokio::test]
async fn delivery_lands_in_new_with_a_well_formed_name() {
    let s = Scratch::new("maildir-deliver");
    let root = s.file("md");
    let mbx = Mailbox::open(&url(&root), OpenOptions::create()).await.unwrap();
    mbx.append(&simple_message("hello", "hi\n")).await.unwrap();

    let new_entries = dir_entries(&root.join("new"));
    assert_eq!(new_entries.len(), 1);
    assert!(dir_entries(&root.join("cur")).is_empty());
    assert!(dir_entries(&root.join("tmp")).is_empty());

    // <sec>.R<hex>I<hex>V<hex>M<dec>P<dec>Q<dec>.<host>, no info suffix.
    let name = &new_entries[0];
    assert!(!name.contains(":2,"));
    let (secs, rest) = name.split_once('.').unwrap();
    assert!(!secs.is_empty() && secs.bytes().all(|b| b.is_ascii_digit()));
    assert!(rest.starts_with('R'));
    let mut tail = &rest[1..];
    for marker in ['I', 'V'] {
        let at = tail.find(marker).unwrap();
        assert!(at > 0 && tail[..at].bytes().all(|b| b.is_ascii_hexdigit()));
        tail = &tail[at + 1..];
    }
    for marker in ['M', 'P', 'Q'] {
        let at = tail.find(marker).unwrap();
        tail = &tail[at + 1..];
        assert!(tail.starts_with(|c: char| c.is_ascii_digit()));
    }
    assert!(tail.contains('.'));

    assert_eq!(mbx.count().await.unwrap(), 1);
    assert_eq!(mbx.message_uid(1).await.unwrap(), 1);
    assert_eq!(mbx.recent().await.unwrap(), 1);
    mbx.close().await.unwrap();
}

#[tokio::test]
async fn flag_change_renames_within_cur() {
    let s = Scratch::new("maildir-chattr");
    let root = s.file("md");
    for sub in ["tmp", "new", "cur"] {
        std::fs::create_dir_all(root.join(sub)).unwrap();
    }
    std::fs::write(
        root.join("cur").join("1600000000.M0P0Q0.host,u=5:2,"),
        b"From: a@x\n\nbody\n",
    )
    .unwrap();

    let mbx = Mailbox::open(&url(&root), OpenOptions::read_write())
        .await
        .unwrap();
    assert_eq!(mbx.message_uid(1).await.unwrap(), 5);
    mbx.add_attributes(1, Attributes::READ | Attributes::ANSWERED)
        .await
        .unwrap();
    mbx.sync().await.unwrap();
    mbx.close().await.unwrap();

    assert_eq!(
        dir_entries(&root.join("cur")),
        vec!["1600000000.M0P0Q0.host,u=5:2,RS".to_string()]
    );
}

#[tokio::test]
async fn read_messages_are_delivered_to_cur() {
    let s = Scratch::new("maildir-cur-delivery");
    let root = s.file("md");
    let mbx = Mailbox::open(&url(&root), OpenOptions::create()).await.unwrap();
    mbx.append(
        &simple_message("seen", "x\n").with_attributes(Attributes::READ),
    )
    .await
    .unwrap();

    assert!(dir_entries(&root.join("new")).is_empty());
    let cur = dir_entries(&root.join("cur"));
    assert_eq!(cur.len(), 1);
    assert!(cur[0].ends_with(":2,S"));
    assert!(cur[0].contains(",u=1:"));
    mbx.close().await.unwrap();
}

#[tokio::test]
async fn flag_subsets_survive_reopen() {
    let s = Scratch::new("maildir-flags");
    let root = s.file("md");
    let mbx = Mailbox::open(&url(&root), OpenOptions::create()).await.unwrap();
    mbx.append(&simple_message("m", "x\n")).await.unwrap();

    let attrs = Attributes::SEEN
        | Attributes::READ
        | Attributes::ANSWERED
        | Attributes::FLAGGED
        | Attributes::DRAFT
        | Attributes::FORWARDED
        | Attributes::DELETED;
    mbx.set_attributes(1, attrs).await.unwrap();
    mbx.sync().await.unwrap();
    mbx.close().await.unwrap();

    let mbx = Mailbox::open(&url(&root), OpenOptions::read_only())
        .await
        .unwrap();
    assert_eq!(mbx.get_attributes(1).await.unwrap(), attrs);
    mbx.close().await.unwrap();
}

#[tokio::test]
async fn seen_without_read_travels_in_the_a_attribute() {
    let s = Scratch::new("maildir-seen");
    let root = s.file("md");
    let mbx = Mailbox::open(&url(&root), OpenOptions::create()).await.unwrap();
    mbx.append(&simple_message("m", "x\n")).await.unwrap();
    mbx.set_attributes(1, Attributes::SEEN).await.unwrap();
    mbx.sync().await.unwrap();
    mbx.close().await.unwrap();

    let cur = dir_entries(&root.join("cur"));
    assert_eq!(cur.len(), 1);
    assert!(cur[0].contains(",a=O,"), "name: {}", cur[0]);
    assert!(cur[0].ends_with(":2,"));

    let mbx = Mailbox::open(&url(&root), OpenOptions::read_only())
        .await
        .unwrap();
    assert_eq!(mbx.get_attributes(1).await.unwrap(), Attributes::SEEN);
    mbx.close().await.unwrap();
}

#[tokio::test]
async fn bad_uids_renumber_and_reset_uidvalidity() {
    let s = Scratch::new("maildir-uidfix");
    let root = s.file("md");
    for sub in ["tmp", "new", "cur"] {
        std::fs::create_dir_all(root.join(sub)).unwrap();
    }
    std::fs::write(
        root.join("cur").join("100.M1P1Q1.h,u=7:2,S"),
        b"From: a@x\n\none\n",
    )
    .unwrap();
    std::fs::write(
        root.join("cur").join("200.M1P1Q2.h,u=3:2,"),
        b"From: a@x\n\ntwo\n",
    )
    .unwrap();

    let mbx = Mailbox::open(&url(&root), OpenOptions::read_write())
        .await
        .unwrap();
    assert_eq!(mbx.count().await.unwrap(), 2);
    assert_eq!(mbx.message_uid(1).await.unwrap(), 1);
    assert_eq!(mbx.message_uid(2).await.unwrap(), 2);
    let uidvalidity = mbx.uidvalidity().await.unwrap();
    assert!(uidvalidity > 0);
    mbx.close().await.unwrap();

    let cur = dir_entries(&root.join("cur"));
    assert_eq!(
        cur,
        vec![
            "100.M1P1Q1.h,u=1:2,S".to_string(),
            "200.M1P1Q2.h,u=2:2,".to_string()
        ]
    );
    let prop = std::fs::read_to_string(root.join(".mu-prop")).unwrap();
    assert!(prop.contains("version: "));
    assert!(prop.contains(&format!("uid-validity: {}", uidvalidity)));
}

#[tokio::test]
async fn legacy_info_letters_are_rewritten() {
    let s = Scratch::new("maildir-legacy");
    let root = s.file("md");
    for sub in ["tmp", "new", "cur"] {
        std::fs::create_dir_all(root.join(sub)).unwrap();
    }
    // Written by an old implementation: R meant read, a answered.
    std::fs::write(
        root.join("cur").join("100.M1P1Q1.h,u=1:2,Ra"),
        b"From: a@x\n\nbody\n",
    )
    .unwrap();
    std::fs::write(root.join(".mu-prop"), "version: 3.10\n").unwrap();

    let mbx = Mailbox::open(&url(&root), OpenOptions::read_write())
        .await
        .unwrap();
    let attrs = mbx.get_attributes(1).await.unwrap();
    assert!(attrs.contains(Attributes::READ));
    assert!(attrs.contains(Attributes::ANSWERED));
    assert!(!attrs.contains(Attributes::SEEN));
    mbx.close().await.unwrap();

    // Standard letters on disk now, and the store marked current.
    assert_eq!(
        dir_entries(&root.join("cur")),
        vec!["100.M1P1Q1.h,u=1:2,RS".to_string()]
    );
    let prop = std::fs::read_to_string(root.join(".mu-prop")).unwrap();
    assert!(!prop.contains("version: 3.10"));

    let mbx = Mailbox::open(&url(&root), OpenOptions::read_only())
        .await
        .unwrap();
    let attrs = mbx.get_attributes(1).await.unwrap();
    assert!(attrs.contains(Attributes::READ) && attrs.contains(Attributes::ANSWERED));
    mbx.close().await.unwrap();
}

#[tokio::test]
async fn expunge_unlinks_deleted_files_and_keeps_uids() {
    let s = Scratch::new("maildir-expunge");
    let root = s.file("md");
    let mbx = Mailbox::open(&url(&root), OpenOptions::create()).await.unwrap();
    for name in ["one", "two", "three"] {
        mbx.append(&simple_message(name, "x\n")).await.unwrap();
    }
    let uid3 = mbx.message_uid(3).await.unwrap();
    mbx.add_attributes(2, Attributes::DELETED).await.unwrap();
    mbx.expunge().await.unwrap();

    assert_eq!(mbx.count().await.unwrap(), 2);
    assert_eq!(mbx.message_uid(2).await.unwrap(), uid3);
    let remaining = dir_entries(&root.join("new")).len() + dir_entries(&root.join("cur")).len();
    assert_eq!(remaining, 2);
    mbx.close().await.unwrap();
}

#[tokio::test]
async fn size_sums_message_files() {
    let s = Scratch::new("maildir-size");
    let root = s.file("md");
    let mbx = Mailbox::open(&url(&root), OpenOptions::create()).await.unwrap();
    mbx.append(&simple_message("a", "12345\n")).await.unwrap();
    mbx.append(&simple_message("b", "6789\n")).await.unwrap();

    let mut expected = 0;
    for sub in ["new", "cur"] {
        for entry in std::fs::read_dir(root.join(sub)).unwrap() {
            expected += entry.unwrap().metadata().unwrap().len();
        }
    }
    assert_eq!(mbx.size().await.unwrap(), expected);
    assert!(expected > 0);
    mbx.close().await.unwrap();
}

#[tokio::test]
async fn message_bodies_are_served_verbatim() {
    let s = Scratch::new("maildir-body");
    let root = s.file("md");
    let mbx = Mailbox::open(&url(&root), OpenOptions::create()).await.unwrap();
    let body = b"From here\n.dots are fine too\n";
    let mut raw = b"From: a@x\nSubject: raw\n\n".to_vec();
    raw.extend_from_slice(body);
    mbx.append(&OutgoingMessage::from_bytes(raw)).await.unwrap();

    let msg = mbx.get_message(1).await.unwrap();
    // No quoting in maildir: files hold the message bytes untouched.
    assert_eq!(msg.read_body().await.unwrap(), body.to_vec());
    assert_eq!(msg.headers().get("Subject"), Some("raw"));
    mbx.close().await.unwrap();
}
