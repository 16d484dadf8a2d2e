#![cfg(feature = "inmem-store")]

use actix_http::Request;
use actix_web::dev::{Service, ServiceResponse};
use actix_web::{test, App};
use serial_test::serial;
use std::sync::Arc;
use tabula::auth::{create_jwt, Role};
use tabula::captcha::CaptchaService;
use tabula::config::BoardConfig;
use tabula::models::NewBoard;
use tabula::pseudoip;
use tabula::rate_limit::{InMemoryRateLimiter, RateLimitConfig, RateLimiterFacade};
use tabula::repo::inmem::InMemRepo;
use tabula::repo::BoardRepo;
use tabula::routes::{config, AppState};
use tabula::storage::FsAttachmentStore;

fn setup_env() {
    std::env::set_var("JWT_SECRET", "test-secret-must-be-32-bytes-long!!");
    std::env::remove_var("PSEUDOIP_SECRET");
    let tmp = tempfile::tempdir().unwrap();
    std::env::set_var("TABULA_DATA_DIR", tmp.path().to_str().unwrap());
    std::mem::forget(tmp);
}

fn admin_token() -> String {
    create_jwt("1", vec![Role::Admin], vec![], true).unwrap()
}
fn user_token() -> String {
    create_jwt("2", vec![Role::User], vec![], true).unwrap()
}
fn mod_token(board: &str) -> String {
    create_jwt("3", vec![Role::Moderator], vec![board.to_string()], true).unwrap()
}

async fn seeded_repo(boards: &[&str]) -> InMemRepo {
    let repo = InMemRepo::new();
    for name in boards {
        repo.create_board(NewBoard {
            name: name.to_string(),
            short_description: String::new(),
            description: String::new(),
        })
        .await
        .unwrap();
    }
    repo
}

fn state(repo: InMemRepo) -> AppState {
    AppState {
        repo: Arc::new(repo),
        store: Arc::new(FsAttachmentStore::new()),
        config: BoardConfig { posts_previewed: 5, require_captcha: false },
        captcha: CaptchaService::new(),
        limiter: RateLimiterFacade::new(
            InMemoryRateLimiter::new(false),
            RateLimitConfig::from_env(),
        ),
    }
}

const BOUNDARY: &str = "------------------------tabulatest";

fn multipart(fields: &[(&str, &str)]) -> (String, Vec<u8>) {
    let mut body = Vec::new();
    for (name, value) in fields {
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
            )
            .as_bytes(),
        );
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
    (format!("multipart/form-data; boundary={BOUNDARY}"), body)
}

async fn open_thread(
    app: &impl Service<Request, Response = ServiceResponse, Error = actix_web::Error>,
    board: &str,
    addr: &str,
) -> i64 {
    let (ct, body) = multipart(&[("board", board), ("comment", "op")]);
    let req = test::TestRequest::post()
        .uri("/api/v1/threads")
        .insert_header(("Content-Type", ct))
        .insert_header(("X-Forwarded-For", addr))
        .set_payload(body)
        .to_request();
    let resp = test::call_service(app, req).await;
    assert_eq!(resp.status(), 303);
    let v: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    v["id"].as_i64().unwrap()
}

async fn add_post(
    app: &impl Service<Request, Response = ServiceResponse, Error = actix_web::Error>,
    thread_id: i64,
    comment: &str,
    addr: &str,
) -> i64 {
    let (ct, body) = multipart(&[("thread", &thread_id.to_string()), ("comment", comment)]);
    let req = test::TestRequest::post()
        .uri("/api/v1/posts")
        .insert_header(("Content-Type", ct))
        .insert_header(("X-Forwarded-For", addr))
        .set_payload(body)
        .to_request();
    let resp = test::call_service(app, req).await;
    assert_eq!(resp.status(), 303);
    let v: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    v["id"].as_i64().unwrap()
}

async fn thread_post_count(
    app: &impl Service<Request, Response = ServiceResponse, Error = actix_web::Error>,
    thread_id: i64,
) -> usize {
    let req = test::TestRequest::get()
        .uri(&format!("/api/v1/threads/{thread_id}"))
        .to_request();
    let resp = test::call_service(app, req).await;
    assert!(resp.status().is_success());
    let v: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    v["posts"].as_array().unwrap().len()
}

#[actix_web::test]
#[serial]
async fn test_moderation_delete_requires_board_permission() {
    setup_env();
    let app = test::init_service(
        App::new()
            .app_data(actix_web::web::Data::new(state(seeded_repo(&["a", "b"]).await)))
            .configure(config),
    )
    .await;
    let ta = open_thread(&app, "a", "1.1.1.1").await;
    let pa = add_post(&app, ta, "target", "1.1.1.1").await;

    // plain users cannot delete
    let req = test::TestRequest::post()
        .uri("/api/v1/moderation/delete")
        .insert_header(("Authorization", format!("Bearer {}", user_token())))
        .set_json(serde_json::json!({"board": "a", "ids": [pa.to_string()]}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 403);

    // moderating /b/ grants nothing on /a/
    let req = test::TestRequest::post()
        .uri("/api/v1/moderation/delete")
        .insert_header(("Authorization", format!("Bearer {}", mod_token("b"))))
        .set_json(serde_json::json!({"board": "a", "ids": [pa.to_string()]}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 403);

    assert_eq!(thread_post_count(&app, ta).await, 1);

    // empty board selector is malformed
    let req = test::TestRequest::post()
        .uri("/api/v1/moderation/delete")
        .insert_header(("Authorization", format!("Bearer {}", mod_token("a"))))
        .set_json(serde_json::json!({"board": "", "ids": [pa.to_string()]}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 400);
}

#[actix_web::test]
#[serial]
async fn test_moderation_delete_scoped_to_board() {
    setup_env();
    let app = test::init_service(
        App::new()
            .app_data(actix_web::web::Data::new(state(seeded_repo(&["a", "b"]).await)))
            .configure(config),
    )
    .await;
    let ta = open_thread(&app, "a", "1.1.1.1").await;
    let tb = open_thread(&app, "b", "1.1.1.1").await;
    let pa = add_post(&app, ta, "on a", "1.1.1.1").await;
    let pb = add_post(&app, tb, "on b", "1.1.1.1").await;

    // non-numeric ids and foreign-board ids are silently dropped
    let req = test::TestRequest::post()
        .uri("/api/v1/moderation/delete")
        .insert_header(("Authorization", format!("Bearer {}", mod_token("a"))))
        .set_json(serde_json::json!({
            "board": "a",
            "ids": [pa.to_string(), pb.to_string(), "junk", "close"]
        }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);
    let v: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(v["deleted"].as_u64().unwrap(), 1);

    assert_eq!(thread_post_count(&app, ta).await, 0);
    assert_eq!(thread_post_count(&app, tb).await, 1);

    // admins moderate every board
    let extra = add_post(&app, ta, "again", "1.1.1.1").await;
    let req = test::TestRequest::post()
        .uri("/api/v1/moderation/delete")
        .insert_header(("Authorization", format!("Bearer {}", admin_token())))
        .set_json(serde_json::json!({"board": "a", "ids": [extra.to_string()]}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);
    assert_eq!(thread_post_count(&app, ta).await, 0);
}

#[actix_web::test]
#[serial]
async fn test_exterminate_by_pseudoip() {
    setup_env();
    let app = test::init_service(
        App::new()
            .app_data(actix_web::web::Data::new(state(seeded_repo(&["a", "b"]).await)))
            .configure(config),
    )
    .await;
    let ta = open_thread(&app, "a", "1.1.1.1").await;
    let tb = open_thread(&app, "b", "1.1.1.1").await;
    add_post(&app, ta, "spam", "9.9.9.9").await;
    add_post(&app, tb, "more spam", "9.9.9.9").await;
    add_post(&app, ta, "bystander", "8.8.8.8").await;

    let target = pseudoip::derive("9.9.9.9", "");

    // admins only
    let req = test::TestRequest::post()
        .uri("/api/v1/admin/exterminate")
        .insert_header(("Authorization", format!("Bearer {}", mod_token("a"))))
        .set_json(serde_json::json!({"pseudoip": target}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 403);

    let req = test::TestRequest::post()
        .uri("/api/v1/admin/exterminate")
        .insert_header(("Authorization", format!("Bearer {}", admin_token())))
        .set_json(serde_json::json!({"pseudoip": target}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);
    let v: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(v["deleted"].as_u64().unwrap(), 2);

    // the bystander post survives on /a/
    assert_eq!(thread_post_count(&app, ta).await, 1);
    assert_eq!(thread_post_count(&app, tb).await, 0);
}

#[actix_web::test]
#[serial]
async fn test_ban_lifecycle() {
    setup_env();
    let app = test::init_service(
        App::new()
            .app_data(actix_web::web::Data::new(state(seeded_repo(&["a"]).await)))
            .configure(config),
    )
    .await;
    let ta = open_thread(&app, "a", "1.1.1.1").await;
    let target = pseudoip::derive("9.9.9.9", "");

    // admins only
    let req = test::TestRequest::post()
        .uri("/api/v1/admin/bans")
        .insert_header(("Authorization", format!("Bearer {}", mod_token("a"))))
        .set_json(serde_json::json!({"pseudoip": target}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 403);

    let req = test::TestRequest::post()
        .uri("/api/v1/admin/bans")
        .insert_header(("Authorization", format!("Bearer {}", admin_token())))
        .set_json(serde_json::json!({"pseudoip": target}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 204);

    // the banned origin can neither post nor open threads
    let (ct, body) = multipart(&[("thread", &ta.to_string()), ("comment", "blocked")]);
    let req = test::TestRequest::post()
        .uri("/api/v1/posts")
        .insert_header(("Content-Type", ct))
        .insert_header(("X-Forwarded-For", "9.9.9.9"))
        .set_payload(body)
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 403);

    let (ct, body) = multipart(&[("board", "a"), ("comment", "blocked op")]);
    let req = test::TestRequest::post()
        .uri("/api/v1/threads")
        .insert_header(("Content-Type", ct))
        .insert_header(("X-Forwarded-For", "9.9.9.9"))
        .set_payload(body)
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 403);

    // other origins are unaffected
    add_post(&app, ta, "fine", "8.8.8.8").await;

    let req = test::TestRequest::get()
        .uri("/api/v1/admin/bans")
        .insert_header(("Authorization", format!("Bearer {}", admin_token())))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);
    let v: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(v, serde_json::json!([target]));

    // lifting the ban restores posting
    let req = test::TestRequest::delete()
        .uri(&format!("/api/v1/admin/bans/{target}"))
        .insert_header(("Authorization", format!("Bearer {}", admin_token())))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 204);
    add_post(&app, ta, "back", "9.9.9.9").await;

    // unbanning an unknown origin is a 404
    let req = test::TestRequest::delete()
        .uri(&format!("/api/v1/admin/bans/{target}"))
        .insert_header(("Authorization", format!("Bearer {}", admin_token())))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 404);
}

#[actix_web::test]
#[serial]
async fn test_admin_thread_deletion() {
    setup_env();
    let app = test::init_service(
        App::new()
            .app_data(actix_web::web::Data::new(state(seeded_repo(&["a"]).await)))
            .configure(config),
    )
    .await;
    let ta = open_thread(&app, "a", "1.1.1.1").await;
    add_post(&app, ta, "reply", "1.1.1.1").await;

    let req = test::TestRequest::delete()
        .uri(&format!("/api/v1/admin/threads/{ta}"))
        .insert_header(("Authorization", format!("Bearer {}", user_token())))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 403);

    let req = test::TestRequest::delete()
        .uri(&format!("/api/v1/admin/threads/{ta}"))
        .insert_header(("Authorization", format!("Bearer {}", admin_token())))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 204);

    let req = test::TestRequest::get()
        .uri(&format!("/api/v1/threads/{ta}"))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 404);

    let req = test::TestRequest::get().uri("/api/v1/boards/a").to_request();
    let resp = test::call_service(&app, req).await;
    let v: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(v["threads"].as_array().unwrap().len(), 0);
}
