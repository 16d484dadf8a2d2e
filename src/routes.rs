use std::collections::HashMap;
use std::sync::Arc;

use actix_multipart::Multipart;
use actix_web::{web, HttpRequest, HttpResponse};
use futures_util::TryStreamExt as _;
use sha2::{Digest, Sha256};

use crate::auth::Auth;
use crate::captcha::CaptchaService;
use crate::config::BoardConfig;
use crate::error::ApiError;
use crate::markup::{find_all_replies, postmarkup, thread_url};
use crate::models::*;
use crate::pseudoip::pseudoip;
use crate::rate_limit::RateLimiterFacade;
use crate::repo::Repo;
use crate::storage::{AttachmentStore, StoreError};

pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1")
            .service(
                web::resource("/boards")
                    .route(web::get().to(list_boards))
                    .route(web::post().to(create_board)),
            )
            .service(web::resource("/boards/{name}").route(web::get().to(board_page)))
            .service(web::resource("/threads").route(web::post().to(create_thread)))
            .service(web::resource("/threads/{id}").route(web::get().to(thread_page)))
            .service(web::resource("/posts").route(web::post().to(create_post)))
            .service(web::resource("/posts/{id}").route(web::get().to(view_post)))
            .service(
                web::resource("/captcha")
                    .route(web::get().to(captcha_challenge))
                    .route(web::post().to(captcha_verify)),
            )
            .service(web::resource("/moderation/delete").route(web::post().to(moderation_delete)))
            .service(web::resource("/admin/exterminate").route(web::post().to(admin_exterminate)))
            .service(
                web::resource("/admin/threads/{id}").route(web::delete().to(admin_delete_thread)),
            )
            .service(
                web::resource("/admin/bans")
                    .route(web::get().to(admin_list_bans))
                    .route(web::post().to(admin_ban)),
            )
            .service(
                web::resource("/admin/bans/{pseudoip}").route(web::delete().to(admin_unban)),
            ),
    );
    // Public fetch route without the /api/v1 prefix so plain
    // <img src="/attachments/{hash}"> markup works.
    cfg.route("/attachments/{hash}", web::get().to(get_attachment));
}

#[derive(Clone)]
pub struct AppState {
    pub repo: Arc<dyn Repo>,
    pub store: Arc<dyn AttachmentStore>,
    pub config: BoardConfig,
    pub captcha: CaptchaService,
    pub limiter: RateLimiterFacade,
}

macro_rules! ensure_admin {
    ($auth:expr) => {
        if !$auth.0.is_admin() {
            return Err(ApiError::Forbidden);
        }
    };
}

// ---------------- Browsing -----------------------------------------------

#[utoipa::path(
    get,
    path = "/api/v1/boards",
    responses((status = 200, description = "List boards ordered by name", body = [Board]))
)]
pub async fn list_boards(data: web::Data<AppState>) -> Result<HttpResponse, ApiError> {
    let boards = data.repo.list_boards().await?;
    Ok(HttpResponse::Ok().json(boards))
}

#[utoipa::path(
    post,
    path = "/api/v1/boards",
    request_body = NewBoard,
    responses(
        (status = 201, description = "Board created", body = Board),
        (status = 403, description = "Forbidden - admins only"),
        (status = 409, description = "Board name already taken")
    )
)]
pub async fn create_board(
    auth: Auth,
    data: web::Data<AppState>,
    payload: web::Json<NewBoard>,
) -> Result<HttpResponse, ApiError> {
    ensure_admin!(auth);
    let new = payload.into_inner();
    if new.name.is_empty() || new.name.len() > BOARD_NAME_MAX {
        return Err(ApiError::Validation("Invalid board name".into()));
    }
    let board = data.repo.create_board(new).await?;
    Ok(HttpResponse::Created().json(board))
}

#[derive(Debug, serde::Serialize, utoipa::ToSchema)]
pub struct PreviewPost {
    pub post: Post,
    pub comment_html: String,
    pub attachments: Vec<Attachment>,
}

#[derive(Debug, serde::Serialize, utoipa::ToSchema)]
pub struct ThreadView {
    pub thread: Thread,
    pub comment_html: String,
    pub attachments: Vec<Attachment>,
    pub post_count: i64,
    pub preview: Vec<PreviewPost>,
}

#[derive(Debug, serde::Serialize, utoipa::ToSchema)]
pub struct BoardPage {
    pub board: Board,
    pub threads: Vec<ThreadView>,
}

#[utoipa::path(
    get,
    path = "/api/v1/boards/{name}",
    params(("name" = String, Path, description = "Board name")),
    responses(
        (status = 200, description = "Threads in bump order with previews", body = BoardPage),
        (status = 404, description = "Board not found")
    )
)]
pub async fn board_page(
    data: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    let name = path.into_inner();
    let board = data.repo.get_board(&name).await?;
    let listings = data
        .repo
        .list_threads(&name, data.config.posts_previewed)
        .await?;
    let threads = listings
        .into_iter()
        .map(|l| ThreadView {
            comment_html: postmarkup(&l.thread.comment, &[]),
            preview: l
                .preview
                .into_iter()
                .map(|e| PreviewPost {
                    comment_html: postmarkup(&e.post.comment, &[]),
                    post: e.post,
                    attachments: e.attachments,
                })
                .collect(),
            thread: l.thread,
            attachments: l.attachments,
            post_count: l.post_count,
        })
        .collect();
    Ok(HttpResponse::Ok().json(BoardPage { board, threads }))
}

#[derive(Debug, serde::Serialize, utoipa::ToSchema)]
pub struct PostView {
    pub post: Post,
    pub comment_html: String,
    pub attachments: Vec<Attachment>,
    pub replies_to: Vec<Id>,
    pub replies: Vec<Id>,
}

#[derive(Debug, serde::Serialize, utoipa::ToSchema)]
pub struct ThreadPage {
    pub thread: Thread,
    pub board: Board,
    pub comment_html: String,
    pub attachments: Vec<Attachment>,
    pub posts: Vec<PostView>,
    /// Whether the caller may delete posts on this board.
    pub moderation: bool,
}

#[utoipa::path(
    get,
    path = "/api/v1/threads/{id}",
    params(("id" = Id, Path, description = "Thread id")),
    responses(
        (status = 200, description = "Thread with all posts", body = ThreadPage),
        (status = 404, description = "Thread not found")
    )
)]
pub async fn thread_page(
    auth: Option<Auth>,
    data: web::Data<AppState>,
    path: web::Path<Id>,
) -> Result<HttpResponse, ApiError> {
    let thread = data.repo.get_thread(path.into_inner()).await?;
    let board = data.repo.get_board(&thread.board).await?;
    let posts = data.repo.list_posts(thread.id).await?;
    // References to posts on this page render as same-page anchors.
    let displayed: Vec<Id> = posts.iter().map(|p| p.id).collect();
    let mut views = Vec::with_capacity(posts.len());
    for post in posts {
        views.push(PostView {
            comment_html: postmarkup(&post.comment, &displayed),
            attachments: data
                .repo
                .attachments_for(AttachmentOwner::Post, post.id)
                .await?,
            replies_to: data.repo.replies_to(post.id).await?,
            replies: data.repo.replies(post.id).await?,
            post,
        });
    }
    let moderation = auth
        .as_ref()
        .map(|a| a.0.can_moderate(&board.name))
        .unwrap_or(false);
    let page = ThreadPage {
        comment_html: postmarkup(&thread.comment, &displayed),
        attachments: data
            .repo
            .attachments_for(AttachmentOwner::Thread, thread.id)
            .await?,
        board,
        thread,
        posts: views,
        moderation,
    };
    Ok(HttpResponse::Ok().json(page))
}

#[utoipa::path(
    get,
    path = "/api/v1/posts/{id}",
    params(("id" = Id, Path, description = "Post id")),
    responses(
        (status = 302, description = "Redirect to the owning thread, anchored at the post"),
        (status = 404, description = "Post not found")
    )
)]
pub async fn view_post(
    data: web::Data<AppState>,
    path: web::Path<Id>,
) -> Result<HttpResponse, ApiError> {
    let post = data.repo.get_post(path.into_inner()).await?;
    Ok(HttpResponse::Found()
        .insert_header(("Location", format!("{}#{}", thread_url(post.thread_id), post.id)))
        .finish())
}

// ---------------- Submission ---------------------------------------------

const ATTACHMENT_SIZE_LIMIT: usize = 10 * 1024 * 1024; // 10 MB per file

struct SubmittedFile {
    file_name: String,
    mime: String,
    bytes: Vec<u8>,
}

#[derive(Default)]
struct Submission {
    fields: HashMap<String, String>,
    files: Vec<SubmittedFile>,
}

/// Stream a multipart form into text fields plus `attachments` file parts.
async fn read_submission(payload: &mut Multipart) -> Result<Submission, ApiError> {
    let mut sub = Submission::default();
    while let Some(mut field) = payload.try_next().await.map_err(|e| {
        log::error!("multipart error: {e}");
        ApiError::BadRequest
    })? {
        let (name, file_name) = {
            let cd = field.content_disposition();
            (cd.get_name().map(str::to_string), cd.get_filename().map(str::to_string))
        };
        let Some(name) = name else { continue };
        let declared_mime = field.content_type().map(|m| m.to_string());
        let mut bytes: Vec<u8> = Vec::new();
        while let Some(chunk) = field.try_next().await.map_err(|e| {
            log::error!("stream read error: {e}");
            ApiError::BadRequest
        })? {
            if bytes.len() + chunk.len() > ATTACHMENT_SIZE_LIMIT {
                return Err(ApiError::PayloadTooLarge);
            }
            bytes.extend_from_slice(&chunk);
        }
        match file_name {
            Some(file_name) if name == "attachments" => {
                // Browsers submit an empty file part when the picker is left
                // blank.
                if file_name.is_empty() && bytes.is_empty() {
                    continue;
                }
                let mime = infer::get(&bytes)
                    .map(|t| t.mime_type().to_string())
                    .or(declared_mime)
                    .unwrap_or_else(|| "application/octet-stream".into());
                sub.files.push(SubmittedFile { file_name, mime, bytes });
            }
            _ => {
                sub.fields
                    .insert(name, String::from_utf8_lossy(&bytes).into_owned());
            }
        }
    }
    Ok(sub)
}

impl Submission {
    fn text(&self, name: &str) -> &str {
        self.fields.get(name).map(String::as_str).unwrap_or("")
    }

    /// Author name, subject, comment with the shared form validation rules.
    fn post_fields(&self) -> Result<(String, String, String), ApiError> {
        let name = match self.text("name").trim() {
            "" => "Anonymous".to_string(),
            n => n.to_string(),
        };
        let subject = self.text("subject").trim().to_string();
        let comment = self.text("comment").to_string();
        if comment.is_empty() && self.files.is_empty() {
            return Err(ApiError::Validation("Post is empty".into()));
        }
        if self.files.len() > MAX_ATTACHMENTS {
            return Err(ApiError::Validation("Too many attachments".into()));
        }
        if name.len() > NAME_MAX || subject.len() > SUBJECT_MAX || comment.len() > COMMENT_MAX {
            return Err(ApiError::Validation("Field too long".into()));
        }
        Ok((name, subject, comment))
    }
}

fn ensure_human(auth: &Option<Auth>, cfg: &BoardConfig) -> Result<(), ApiError> {
    if cfg.require_captcha && !auth.as_ref().map(|a| a.0.human).unwrap_or(false) {
        return Err(ApiError::Forbidden);
    }
    Ok(())
}

/// Persist attachment rows, then write the bytes. The store write is
/// best-effort once the rows exist; duplicates are fine (content-addressed).
async fn store_attachments(
    data: &web::Data<AppState>,
    owner: AttachmentOwner,
    owner_id: Id,
    files: Vec<SubmittedFile>,
) -> Result<Vec<Attachment>, ApiError> {
    let mut rows = Vec::with_capacity(files.len());
    let mut blobs = Vec::with_capacity(files.len());
    for f in files {
        let hash = format!("{:x}", Sha256::digest(&f.bytes));
        rows.push(NewAttachment {
            file_name: f.file_name,
            hash: hash.clone(),
            mime: f.mime.clone(),
        });
        blobs.push((hash, f.mime, f.bytes));
    }
    let created = data.repo.add_attachments(owner, owner_id, rows).await?;
    for (hash, mime, bytes) in blobs {
        match data.store.save(&hash, &mime, &bytes).await {
            Ok(()) | Err(StoreError::Duplicate) => {}
            Err(e) => log::error!("attachment store save failed hash={hash}: {e}"),
        }
    }
    Ok(created)
}

#[utoipa::path(
    post,
    path = "/api/v1/threads",
    responses(
        (status = 303, description = "Thread created; Location points at its page", body = Thread),
        (status = 400, description = "Validation failed"),
        (status = 403, description = "Human verification required, or origin banned"),
        (status = 404, description = "Board not found"),
        (status = 429, description = "Rate limited")
    )
)]
pub async fn create_thread(
    req: HttpRequest,
    auth: Option<Auth>,
    data: web::Data<AppState>,
    mut payload: Multipart,
) -> Result<HttpResponse, ApiError> {
    ensure_human(&auth, &data.config)?;
    let sub = read_submission(&mut payload).await?;
    let board = sub.text("board").to_string();
    if board.is_empty() {
        return Err(ApiError::BadRequest);
    }
    let (name, subject, comment) = sub.post_fields()?;
    let origin = pseudoip(&req);
    if data.repo.is_banned(&origin).await? {
        return Err(ApiError::Forbidden);
    }
    if !data.limiter.allow_thread(&origin) {
        return Err(ApiError::RateLimited);
    }
    let thread = data
        .repo
        .create_thread(NewThread { board, name, subject, comment, pseudoip: origin })
        .await?;
    store_attachments(&data, AttachmentOwner::Thread, thread.id, sub.files).await?;
    let location = match sub.fields.get("next") {
        Some(next) if !next.is_empty() => next.clone(),
        _ => thread_url(thread.id),
    };
    Ok(HttpResponse::SeeOther()
        .insert_header(("Location", location))
        .json(thread))
}

#[utoipa::path(
    post,
    path = "/api/v1/posts",
    responses(
        (status = 303, description = "Post created; Location anchors it on the thread page", body = Post),
        (status = 400, description = "Validation failed"),
        (status = 403, description = "Human verification required, or origin banned"),
        (status = 404, description = "Thread not found"),
        (status = 429, description = "Rate limited")
    )
)]
pub async fn create_post(
    req: HttpRequest,
    auth: Option<Auth>,
    data: web::Data<AppState>,
    mut payload: Multipart,
) -> Result<HttpResponse, ApiError> {
    ensure_human(&auth, &data.config)?;
    let sub = read_submission(&mut payload).await?;
    let thread_id: Id = sub
        .text("thread")
        .parse()
        .map_err(|_| ApiError::BadRequest)?;
    let (name, subject, comment) = sub.post_fields()?;
    let origin = pseudoip(&req);
    if data.repo.is_banned(&origin).await? {
        return Err(ApiError::Forbidden);
    }
    if !data.limiter.allow_post(&origin) {
        return Err(ApiError::RateLimited);
    }
    let post = data
        .repo
        .create_post(NewPost {
            thread_id,
            name,
            subject,
            comment: comment.clone(),
            pseudoip: origin,
        })
        .await?;
    store_attachments(&data, AttachmentOwner::Post, post.id, sub.files).await?;
    // Reply edges for every `>>id` that resolves to an existing post;
    // unknown ids are dropped by the repo.
    let mentioned = find_all_replies(&comment);
    if !mentioned.is_empty() {
        data.repo.add_reply_edges(post.id, &mentioned).await?;
    }
    let location = match sub.fields.get("next") {
        Some(next) if !next.is_empty() => next.clone(),
        _ => format!("{}#{}", thread_url(post.thread_id), post.id),
    };
    Ok(HttpResponse::SeeOther()
        .insert_header(("Location", location))
        .json(post))
}

// ---------------- Captcha gate -------------------------------------------

#[derive(serde::Serialize, utoipa::ToSchema)]
pub struct CaptchaChallengeResponse {
    pub challenge: String,
    pub question: String,
}

#[utoipa::path(
    get,
    path = "/api/v1/captcha",
    responses((status = 200, description = "New challenge", body = CaptchaChallengeResponse))
)]
pub async fn captcha_challenge(data: web::Data<AppState>) -> Result<HttpResponse, ApiError> {
    let ch = data.captcha.issue();
    Ok(HttpResponse::Ok().json(CaptchaChallengeResponse { challenge: ch.id, question: ch.question }))
}

#[derive(serde::Deserialize, utoipa::ToSchema)]
pub struct CaptchaVerifyRequest {
    pub challenge: String,
    pub answer: i64,
}

#[derive(serde::Serialize, utoipa::ToSchema)]
pub struct CaptchaVerifyResponse {
    pub token: String,
}

#[utoipa::path(
    post,
    path = "/api/v1/captcha",
    request_body = CaptchaVerifyRequest,
    responses(
        (status = 200, description = "Token with the human flag set", body = CaptchaVerifyResponse),
        (status = 400, description = "Wrong or expired answer")
    )
)]
pub async fn captcha_verify(
    req: HttpRequest,
    data: web::Data<AppState>,
    payload: web::Json<CaptchaVerifyRequest>,
) -> Result<HttpResponse, ApiError> {
    if !data.captcha.verify(&payload.challenge, payload.answer) {
        return Err(ApiError::Validation("Wrong answer".into()));
    }
    let sub = format!("anon:{}", pseudoip(&req));
    let token = crate::auth::create_human_jwt(&sub).map_err(|_| ApiError::Internal)?;
    Ok(HttpResponse::Ok().json(CaptchaVerifyResponse { token }))
}

// ---------------- Moderation ---------------------------------------------

/// Drop blobs whose last referencing attachment row was just deleted. The
/// store is advisory; failures are logged and the response is unaffected.
async fn sweep_blobs(data: &web::Data<AppState>, hashes: &[String]) {
    for hash in hashes {
        if let Err(e) = data.store.delete(hash).await {
            log::warn!("orphaned blob sweep failed hash={hash}: {e}");
        }
    }
}

#[derive(serde::Deserialize, utoipa::ToSchema)]
pub struct ModerationDeleteRequest {
    pub board: String,
    /// Candidate ids; only numeric-looking entries count.
    pub ids: Vec<String>,
}

#[derive(serde::Serialize, utoipa::ToSchema)]
pub struct DeletedResponse {
    pub deleted: u64,
}

#[utoipa::path(
    post,
    path = "/api/v1/moderation/delete",
    request_body = ModerationDeleteRequest,
    responses(
        (status = 200, description = "Posts deleted", body = DeletedResponse),
        (status = 403, description = "Missing board-scoped delete_posts permission")
    )
)]
pub async fn moderation_delete(
    auth: Auth,
    data: web::Data<AppState>,
    payload: web::Json<ModerationDeleteRequest>,
) -> Result<HttpResponse, ApiError> {
    let req = payload.into_inner();
    if req.board.is_empty() {
        return Err(ApiError::BadRequest);
    }
    if !auth.0.can_moderate(&req.board) {
        return Err(ApiError::Forbidden);
    }
    let ids: Vec<Id> = req.ids.iter().filter_map(|s| s.parse().ok()).collect();
    let outcome = data.repo.delete_posts(&req.board, &ids).await?;
    sweep_blobs(&data, &outcome.orphaned_blobs).await;
    log::info!("moderation delete on /{}/: {} posts", req.board, outcome.deleted);
    Ok(HttpResponse::Ok().json(DeletedResponse { deleted: outcome.deleted }))
}

#[derive(serde::Deserialize, utoipa::ToSchema)]
pub struct ExterminateRequest {
    pub pseudoip: String,
}

#[utoipa::path(
    post,
    path = "/api/v1/admin/exterminate",
    request_body = ExterminateRequest,
    responses(
        (status = 200, description = "All posts from the origin deleted", body = DeletedResponse),
        (status = 403, description = "Forbidden - admins only")
    )
)]
pub async fn admin_exterminate(
    auth: Auth,
    data: web::Data<AppState>,
    payload: web::Json<ExterminateRequest>,
) -> Result<HttpResponse, ApiError> {
    ensure_admin!(auth);
    let outcome = data
        .repo
        .delete_posts_by_pseudoip(&payload.pseudoip)
        .await?;
    sweep_blobs(&data, &outcome.orphaned_blobs).await;
    log::info!("exterminated {} posts from pseudoip {}", outcome.deleted, payload.pseudoip);
    Ok(HttpResponse::Ok().json(DeletedResponse { deleted: outcome.deleted }))
}

pub async fn admin_delete_thread(
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<Id>,
) -> Result<HttpResponse, ApiError> {
    ensure_admin!(auth);
    let orphaned = data.repo.delete_thread(path.into_inner()).await?;
    sweep_blobs(&data, &orphaned).await;
    Ok(HttpResponse::NoContent().finish())
}

#[derive(serde::Deserialize, utoipa::ToSchema)]
pub struct BanRequest {
    pub pseudoip: String,
}

#[utoipa::path(
    post,
    path = "/api/v1/admin/bans",
    request_body = BanRequest,
    responses(
        (status = 204, description = "Origin banned from posting"),
        (status = 403, description = "Forbidden - admins only")
    )
)]
pub async fn admin_ban(
    auth: Auth,
    data: web::Data<AppState>,
    payload: web::Json<BanRequest>,
) -> Result<HttpResponse, ApiError> {
    ensure_admin!(auth);
    if payload.pseudoip.is_empty() {
        return Err(ApiError::BadRequest);
    }
    data.repo.ban_pseudoip(&payload.pseudoip).await?;
    log::info!("banned pseudoip {}", payload.pseudoip);
    Ok(HttpResponse::NoContent().finish())
}

pub async fn admin_unban(
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    ensure_admin!(auth);
    let pseudoip = path.into_inner();
    data.repo.unban_pseudoip(&pseudoip).await?;
    log::info!("unbanned pseudoip {pseudoip}");
    Ok(HttpResponse::NoContent().finish())
}

#[utoipa::path(
    get,
    path = "/api/v1/admin/bans",
    responses(
        (status = 200, description = "Banned origins, sorted", body = [String]),
        (status = 403, description = "Forbidden - admins only")
    )
)]
pub async fn admin_list_bans(
    auth: Auth,
    data: web::Data<AppState>,
) -> Result<HttpResponse, ApiError> {
    ensure_admin!(auth);
    let bans = data.repo.list_bans().await?;
    Ok(HttpResponse::Ok().json(bans))
}

// ---------------- Attachments --------------------------------------------

pub async fn get_attachment(
    data: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    let hash = path.into_inner();
    if hash.len() < 2 {
        return Err(ApiError::NotFound);
    }
    match data.store.load(&hash).await {
        Ok((bytes, mime)) => Ok(HttpResponse::Ok()
            .insert_header(("Content-Type", mime))
            .body(bytes)),
        Err(StoreError::NotFound) => Err(ApiError::NotFound),
        Err(e) => {
            log::error!("attachment store load error: {e}");
            Err(ApiError::Internal)
        }
    }
}
