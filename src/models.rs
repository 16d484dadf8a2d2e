use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

pub type Id = i64;

pub const NAME_MAX: usize = 40;
pub const SUBJECT_MAX: usize = 100;
pub const COMMENT_MAX: usize = 1000;
pub const BOARD_NAME_MAX: usize = 10;
pub const MAX_ATTACHMENTS: usize = 2;

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[cfg_attr(feature = "postgres-store", derive(sqlx::FromRow))]
pub struct Board {
    /// Unique key; boards are addressed by name, not by numeric id.
    pub name: String,
    pub short_description: String,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct NewBoard {
    pub name: String,
    #[serde(default)]
    pub short_description: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[cfg_attr(feature = "postgres-store", derive(sqlx::FromRow))]
pub struct Thread {
    pub id: Id,
    pub board: String,
    pub name: String,
    pub subject: String,
    pub comment: String,
    pub date: DateTime<Utc>,
    #[serde(skip_serializing, default)]
    pub pseudoip: String, // origin attribution, hidden from API clients
}

#[derive(Debug, Clone)]
pub struct NewThread {
    pub board: String,
    pub name: String,
    pub subject: String,
    pub comment: String,
    pub pseudoip: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[cfg_attr(feature = "postgres-store", derive(sqlx::FromRow))]
pub struct Post {
    pub id: Id,
    pub thread_id: Id,
    pub name: String,
    pub subject: String,
    pub comment: String,
    pub date: DateTime<Utc>,
    #[serde(skip_serializing, default)]
    pub pseudoip: String,
}

#[derive(Debug, Clone)]
pub struct NewPost {
    pub thread_id: Id,
    pub name: String,
    pub subject: String,
    pub comment: String,
    pub pseudoip: String,
}

/// Polymorphic attachment owner (content-type + object-id pattern).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentOwner {
    Thread,
    Post,
}

impl AttachmentOwner {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttachmentOwner::Thread => "thread",
            AttachmentOwner::Post => "post",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Attachment {
    pub id: Id,
    pub owner: AttachmentOwner,
    pub owner_id: Id,
    pub file_name: String,
    /// sha256 of the bytes; addresses the blob in the attachment store.
    pub hash: String,
    pub mime: String,
}

#[derive(Debug, Clone)]
pub struct NewAttachment {
    pub file_name: String,
    pub hash: String,
    pub mime: String,
}

/// One entry of the board page: the thread plus its bounded preview.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ThreadListing {
    pub thread: Thread,
    pub attachments: Vec<Attachment>,
    pub post_count: i64,
    /// Oldest posts of the thread, at most the configured preview size.
    pub preview: Vec<PostEntry>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct PostEntry {
    pub post: Post,
    pub attachments: Vec<Attachment>,
}
