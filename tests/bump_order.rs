#![cfg(feature = "inmem-store")]

use serial_test::serial;
use std::time::Duration;
use tabula::models::*;
use tabula::repo::inmem::InMemRepo;
use tabula::repo::{AttachmentRepo, BoardRepo, PostRepo, ThreadRepo};

fn setup_env() {
    let tmp = tempfile::tempdir().unwrap();
    std::env::set_var("TABULA_DATA_DIR", tmp.path().to_str().unwrap());
    std::mem::forget(tmp);
}

fn board(name: &str) -> NewBoard {
    NewBoard {
        name: name.to_string(),
        short_description: String::new(),
        description: String::new(),
    }
}

fn thread(board: &str, subject: &str) -> NewThread {
    NewThread {
        board: board.to_string(),
        name: "Anonymous".into(),
        subject: subject.to_string(),
        comment: "op".into(),
        pseudoip: "aaaa".into(),
    }
}

fn post(thread_id: Id, comment: &str, pseudoip: &str) -> NewPost {
    NewPost {
        thread_id,
        name: "Anonymous".into(),
        subject: String::new(),
        comment: comment.to_string(),
        pseudoip: pseudoip.to_string(),
    }
}

// Timestamps come from the clock; keep successive writes distinguishable.
fn tick() {
    std::thread::sleep(Duration::from_millis(5));
}

#[actix_web::test]
#[serial]
async fn quiet_threads_order_by_creation_date() {
    setup_env();
    let repo = InMemRepo::new();
    repo.create_board(board("b")).await.unwrap();
    let t1 = repo.create_thread(thread("b", "one")).await.unwrap();
    tick();
    let t2 = repo.create_thread(thread("b", "two")).await.unwrap();

    let listings = repo.list_threads("b", 5).await.unwrap();
    let order: Vec<Id> = listings.iter().map(|l| l.thread.id).collect();
    assert_eq!(order, vec![t2.id, t1.id]);
}

#[actix_web::test]
#[serial]
async fn reply_bumps_thread_to_front() {
    setup_env();
    let repo = InMemRepo::new();
    repo.create_board(board("b")).await.unwrap();
    let t1 = repo.create_thread(thread("b", "one")).await.unwrap();
    tick();
    let t2 = repo.create_thread(thread("b", "two")).await.unwrap();
    tick();
    repo.create_post(post(t1.id, "bump", "aaaa")).await.unwrap();

    let listings = repo.list_threads("b", 5).await.unwrap();
    let order: Vec<Id> = listings.iter().map(|l| l.thread.id).collect();
    assert_eq!(order, vec![t1.id, t2.id]);

    // a thread created after the reply still wins on its own date
    tick();
    let t3 = repo.create_thread(thread("b", "three")).await.unwrap();
    let listings = repo.list_threads("b", 5).await.unwrap();
    assert_eq!(listings[0].thread.id, t3.id);
}

#[actix_web::test]
#[serial]
async fn preview_holds_oldest_posts() {
    setup_env();
    let repo = InMemRepo::new();
    repo.create_board(board("b")).await.unwrap();
    let t = repo.create_thread(thread("b", "s")).await.unwrap();
    for i in 0..5 {
        tick();
        repo.create_post(post(t.id, &format!("p{i}"), "aaaa")).await.unwrap();
    }

    let listings = repo.list_threads("b", 3).await.unwrap();
    assert_eq!(listings.len(), 1);
    let listing = &listings[0];
    assert_eq!(listing.post_count, 5);
    let comments: Vec<&str> = listing.preview.iter().map(|e| e.post.comment.as_str()).collect();
    assert_eq!(comments, vec!["p0", "p1", "p2"]);
}

#[actix_web::test]
#[serial]
async fn listing_scoped_to_board() {
    setup_env();
    let repo = InMemRepo::new();
    repo.create_board(board("a")).await.unwrap();
    repo.create_board(board("b")).await.unwrap();
    repo.create_thread(thread("a", "on a")).await.unwrap();

    assert_eq!(repo.list_threads("a", 5).await.unwrap().len(), 1);
    assert_eq!(repo.list_threads("b", 5).await.unwrap().len(), 0);
    assert!(repo.list_threads("missing", 5).await.is_err());
}

#[actix_web::test]
#[serial]
async fn reply_edges_skip_unknown_and_dedup() {
    setup_env();
    let repo = InMemRepo::new();
    repo.create_board(board("b")).await.unwrap();
    let t = repo.create_thread(thread("b", "s")).await.unwrap();
    let p1 = repo.create_post(post(t.id, "first", "aaaa")).await.unwrap();
    let p2 = repo.create_post(post(t.id, "second", "aaaa")).await.unwrap();

    let linked = repo
        .add_reply_edges(p2.id, &[p1.id, 9999, p1.id])
        .await
        .unwrap();
    assert_eq!(linked, vec![p1.id]);
    assert_eq!(repo.replies_to(p2.id).await.unwrap(), vec![p1.id]);
    assert_eq!(repo.replies(p1.id).await.unwrap(), vec![p2.id]);
    // re-adding the same edge is a no-op
    let linked = repo.add_reply_edges(p2.id, &[p1.id]).await.unwrap();
    assert!(linked.is_empty());
}

#[actix_web::test]
#[serial]
async fn delete_posts_scoped_and_cascading() {
    setup_env();
    let repo = InMemRepo::new();
    repo.create_board(board("a")).await.unwrap();
    repo.create_board(board("b")).await.unwrap();
    let ta = repo.create_thread(thread("a", "s")).await.unwrap();
    let tb = repo.create_thread(thread("b", "s")).await.unwrap();
    let pa = repo.create_post(post(ta.id, "on a", "aaaa")).await.unwrap();
    let pb = repo.create_post(post(tb.id, "on b", "aaaa")).await.unwrap();
    let replier = repo.create_post(post(ta.id, "replying", "aaaa")).await.unwrap();
    repo.add_reply_edges(replier.id, &[pa.id]).await.unwrap();
    repo.add_attachments(
        AttachmentOwner::Post,
        pa.id,
        vec![NewAttachment { file_name: "f.png".into(), hash: "ff".repeat(32), mime: "image/png".into() }],
    )
    .await
    .unwrap();

    // the other board's post id is passed in but must not count
    let outcome = repo.delete_posts("a", &[pa.id, pb.id, 12345]).await.unwrap();
    assert_eq!(outcome.deleted, 1);
    assert_eq!(outcome.orphaned_blobs, vec!["ff".repeat(32)]);
    assert!(repo.get_post(pa.id).await.is_err());
    assert!(repo.get_post(pb.id).await.is_ok());
    assert!(repo.attachments_for(AttachmentOwner::Post, pa.id).await.unwrap().is_empty());
    assert!(repo.replies_to(replier.id).await.unwrap().is_empty());
}

#[actix_web::test]
#[serial]
async fn shared_blob_reported_only_when_last_reference_goes() {
    setup_env();
    let repo = InMemRepo::new();
    repo.create_board(board("b")).await.unwrap();
    let t = repo.create_thread(thread("b", "s")).await.unwrap();
    let p1 = repo.create_post(post(t.id, "one", "aaaa")).await.unwrap();
    let p2 = repo.create_post(post(t.id, "two", "aaaa")).await.unwrap();
    let shared = "cd".repeat(32);
    for pid in [p1.id, p2.id] {
        repo.add_attachments(
            AttachmentOwner::Post,
            pid,
            vec![NewAttachment { file_name: "same.png".into(), hash: shared.clone(), mime: "image/png".into() }],
        )
        .await
        .unwrap();
    }

    // content-addressed blob still referenced by the surviving post
    let outcome = repo.delete_posts("b", &[p1.id]).await.unwrap();
    assert_eq!(outcome.deleted, 1);
    assert!(outcome.orphaned_blobs.is_empty());

    let outcome = repo.delete_posts("b", &[p2.id]).await.unwrap();
    assert_eq!(outcome.deleted, 1);
    assert_eq!(outcome.orphaned_blobs, vec![shared]);
}

#[actix_web::test]
#[serial]
async fn delete_posts_by_pseudoip_crosses_boards() {
    setup_env();
    let repo = InMemRepo::new();
    repo.create_board(board("a")).await.unwrap();
    repo.create_board(board("b")).await.unwrap();
    let ta = repo.create_thread(thread("a", "s")).await.unwrap();
    let tb = repo.create_thread(thread("b", "s")).await.unwrap();
    repo.create_post(post(ta.id, "spam", "bad0")).await.unwrap();
    repo.create_post(post(tb.id, "spam", "bad0")).await.unwrap();
    let keep = repo.create_post(post(ta.id, "fine", "good")).await.unwrap();

    let outcome = repo.delete_posts_by_pseudoip("bad0").await.unwrap();
    assert_eq!(outcome.deleted, 2);
    assert!(outcome.orphaned_blobs.is_empty());
    assert!(repo.get_post(keep.id).await.is_ok());
}

#[actix_web::test]
#[serial]
async fn delete_thread_cascades() {
    setup_env();
    let repo = InMemRepo::new();
    repo.create_board(board("b")).await.unwrap();
    let t = repo.create_thread(thread("b", "s")).await.unwrap();
    let p = repo.create_post(post(t.id, "reply", "aaaa")).await.unwrap();
    repo.add_attachments(
        AttachmentOwner::Thread,
        t.id,
        vec![NewAttachment { file_name: "op.png".into(), hash: "aa".repeat(32), mime: "image/png".into() }],
    )
    .await
    .unwrap();

    let orphaned = repo.delete_thread(t.id).await.unwrap();
    assert_eq!(orphaned, vec!["aa".repeat(32)]);
    assert!(repo.get_thread(t.id).await.is_err());
    assert!(repo.get_post(p.id).await.is_err());
    assert!(repo.attachments_for(AttachmentOwner::Thread, t.id).await.unwrap().is_empty());
    assert!(matches!(repo.delete_thread(t.id).await, Err(_)));
}

#[actix_web::test]
#[serial]
async fn snapshot_survives_restart() {
    setup_env();
    let repo = InMemRepo::new();
    repo.create_board(board("b")).await.unwrap();
    let t = repo.create_thread(thread("b", "kept")).await.unwrap();
    repo.create_post(post(t.id, "spam", "bad0")).await.unwrap();
    drop(repo);

    let reopened = InMemRepo::new();
    let found = reopened.get_thread(t.id).await.unwrap();
    assert_eq!(found.subject, "kept");
    assert_eq!(reopened.list_boards().await.unwrap().len(), 1);
    // origin attribution is part of the snapshot even though the records
    // hide it from serialization
    assert_eq!(reopened.delete_posts_by_pseudoip("bad0").await.unwrap().deleted, 1);
}
