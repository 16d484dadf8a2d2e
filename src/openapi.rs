use crate::models::{Attachment, AttachmentOwner, Board, NewBoard, Post, Thread};
use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    paths(
        crate::routes::list_boards,
        crate::routes::create_board,
        crate::routes::board_page,
        crate::routes::thread_page,
        crate::routes::create_thread,
        crate::routes::create_post,
        crate::routes::view_post,
        crate::routes::captcha_challenge,
        crate::routes::captcha_verify,
        crate::routes::moderation_delete,
        crate::routes::admin_exterminate,
        crate::routes::admin_ban,
        crate::routes::admin_list_bans,
    ),
    components(schemas(
        Board, NewBoard, Thread, Post, Attachment, AttachmentOwner,
        crate::routes::BoardPage, crate::routes::ThreadView, crate::routes::PreviewPost,
        crate::routes::ThreadPage, crate::routes::PostView,
        crate::routes::CaptchaChallengeResponse, crate::routes::CaptchaVerifyRequest,
        crate::routes::CaptchaVerifyResponse,
        crate::routes::ModerationDeleteRequest, crate::routes::ExterminateRequest,
        crate::routes::DeletedResponse, crate::routes::BanRequest,
    )),
    tags(
        (name = "boards", description = "Board browsing"),
        (name = "threads", description = "Thread listing and creation"),
        (name = "posts", description = "Posting and reply references"),
        (name = "moderation", description = "Board-scoped moderation"),
    )
)]
pub struct ApiDoc;
