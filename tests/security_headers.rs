#![cfg(feature = "inmem-store")]

use actix_web::{test, App};
use serial_test::serial;
use std::sync::Arc;
use tabula::captcha::CaptchaService;
use tabula::config::BoardConfig;
use tabula::rate_limit::{InMemoryRateLimiter, RateLimitConfig, RateLimiterFacade};
use tabula::repo::inmem::InMemRepo;
use tabula::routes::{config, AppState};
use tabula::security::SecurityHeaders;
use tabula::storage::FsAttachmentStore;

fn setup_env() {
    std::env::set_var("JWT_SECRET", "test-secret-must-be-32-bytes-long!!");
    let tmp = tempfile::tempdir().unwrap();
    std::env::set_var("TABULA_DATA_DIR", tmp.path().to_str().unwrap());
    std::mem::forget(tmp);
}

fn state() -> AppState {
    AppState {
        repo: Arc::new(InMemRepo::new()),
        store: Arc::new(FsAttachmentStore::new()),
        config: BoardConfig { posts_previewed: 5, require_captcha: false },
        captcha: CaptchaService::new(),
        limiter: RateLimiterFacade::new(
            InMemoryRateLimiter::new(false),
            RateLimitConfig::from_env(),
        ),
    }
}

#[actix_web::test]
#[serial]
async fn test_default_headers_applied() {
    setup_env();
    let app = test::init_service(
        App::new()
            .wrap(SecurityHeaders::default())
            .app_data(actix_web::web::Data::new(state()))
            .configure(config),
    )
    .await;

    let req = test::TestRequest::get().uri("/api/v1/boards").to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());
    let headers = resp.headers();
    assert_eq!(headers.get("X-Content-Type-Options").unwrap(), "nosniff");
    assert_eq!(headers.get("X-Frame-Options").unwrap(), "DENY");
    assert_eq!(headers.get("Referrer-Policy").unwrap(), "no-referrer");
    let csp = headers.get("Content-Security-Policy").unwrap().to_str().unwrap();
    assert!(csp.contains("default-src 'self'"));
    // HSTS stays off unless opted in
    assert!(headers.get("Strict-Transport-Security").is_none());
}

#[actix_web::test]
#[serial]
async fn test_hsts_opt_in() {
    setup_env();
    let app = test::init_service(
        App::new()
            .wrap(SecurityHeaders::default().with_hsts(true))
            .app_data(actix_web::web::Data::new(state()))
            .configure(config),
    )
    .await;

    let req = test::TestRequest::get().uri("/api/v1/boards").to_request();
    let resp = test::call_service(&app, req).await;
    let hsts = resp
        .headers()
        .get("Strict-Transport-Security")
        .unwrap()
        .to_str()
        .unwrap();
    assert!(hsts.contains("max-age="));
}
