use crate::models::*;

#[derive(thiserror::Error, Debug)]
pub enum RepoError {
    #[error("not found")] NotFound,
    #[error("conflict")] Conflict,
    #[error("internal: {0}")] Internal(String),
}

pub type RepoResult<T> = Result<T, RepoError>;

use async_trait::async_trait;

#[async_trait]
pub trait BoardRepo: Send + Sync {
    async fn list_boards(&self) -> RepoResult<Vec<Board>>;
    async fn get_board(&self, name: &str) -> RepoResult<Board>;
    async fn create_board(&self, new: NewBoard) -> RepoResult<Board>;
}

/// Result of a bulk purge: records removed, plus content hashes whose last
/// referencing attachment row went with them. Blobs are content-addressed
/// and may be shared, so only unreferenced hashes are reported.
#[derive(Debug, Default)]
pub struct PurgeOutcome {
    pub deleted: u64,
    pub orphaned_blobs: Vec<String>,
}

#[async_trait]
pub trait ThreadRepo: Send + Sync {
    /// Threads of `board` in bump order: most recent activity first, where
    /// activity is the newest post date or the thread's own date when it has
    /// no posts. Each listing carries the oldest `preview` posts and all
    /// attachments, fetched in one bounded pass.
    async fn list_threads(&self, board: &str, preview: usize) -> RepoResult<Vec<ThreadListing>>;
    async fn create_thread(&self, new: NewThread) -> RepoResult<Thread>;
    async fn get_thread(&self, id: Id) -> RepoResult<Thread>;
    /// Hard delete, cascading posts, attachments and reply edges. Returns
    /// the blob hashes left without a referencing attachment.
    async fn delete_thread(&self, id: Id) -> RepoResult<Vec<String>>;
}

#[async_trait]
pub trait PostRepo: Send + Sync {
    async fn list_posts(&self, thread_id: Id) -> RepoResult<Vec<Post>>;
    async fn get_post(&self, id: Id) -> RepoResult<Post>;
    async fn create_post(&self, new: NewPost) -> RepoResult<Post>;
    /// Record reply edges from `post_id` to every target that resolves to an
    /// existing post; unknown ids are skipped. Returns the targets actually
    /// linked. Edges are a set: re-adding is a no-op.
    async fn add_reply_edges(&self, post_id: Id, targets: &[Id]) -> RepoResult<Vec<Id>>;
    /// Posts that `post_id` replies to.
    async fn replies_to(&self, post_id: Id) -> RepoResult<Vec<Id>>;
    /// Posts replying to `post_id`.
    async fn replies(&self, post_id: Id) -> RepoResult<Vec<Id>>;
    /// Delete the given posts, restricted to the ones belonging to `board`.
    /// Attachments and reply edges of deleted posts go with them.
    async fn delete_posts(&self, board: &str, ids: &[Id]) -> RepoResult<PurgeOutcome>;
    /// Board-wide purge of a single origin's posts.
    async fn delete_posts_by_pseudoip(&self, pseudoip: &str) -> RepoResult<PurgeOutcome>;
}

#[async_trait]
pub trait AttachmentRepo: Send + Sync {
    async fn add_attachments(
        &self,
        owner: AttachmentOwner,
        owner_id: Id,
        new: Vec<NewAttachment>,
    ) -> RepoResult<Vec<Attachment>>;
    async fn attachments_for(&self, owner: AttachmentOwner, owner_id: Id) -> RepoResult<Vec<Attachment>>;
}

/// Persistent origin bans. Distinct from rate limiting (which expires) and
/// exterminate (which deletes past posts): a banned pseudoip cannot submit
/// anything until unbanned.
#[async_trait]
pub trait BanRepo: Send + Sync {
    /// Idempotent; banning an already-banned origin is a no-op.
    async fn ban_pseudoip(&self, pseudoip: &str) -> RepoResult<()>;
    async fn unban_pseudoip(&self, pseudoip: &str) -> RepoResult<()>;
    async fn is_banned(&self, pseudoip: &str) -> RepoResult<bool>;
    async fn list_bans(&self) -> RepoResult<Vec<String>>;
}

pub trait Repo: BoardRepo + ThreadRepo + PostRepo + AttachmentRepo + BanRepo {}

impl<T> Repo for T where T: BoardRepo + ThreadRepo + PostRepo + AttachmentRepo + BanRepo {}

#[cfg(feature = "inmem-store")]
pub mod inmem {
    use super::*;
    use chrono::Utc;
    use serde::{Deserialize, Serialize};
    use std::collections::{BTreeSet, HashMap};
    use std::path::{Path, PathBuf};
    use std::sync::{Arc, RwLock};

    const SNAPSHOT_PATH: &str = "data/state.json";

    #[derive(Default, Serialize, Deserialize)]
    struct State {
        boards: HashMap<String, Board>,
        threads: HashMap<Id, Thread>,
        posts: HashMap<Id, Post>,
        attachments: HashMap<Id, Attachment>,
        /// Directed reply edges (replying post, target post).
        reply_edges: BTreeSet<(Id, Id)>,
        /// Pseudoip per thread/post id. The records skip the field when
        /// serialized, so the snapshot carries it out-of-band.
        #[serde(default)]
        origins: HashMap<Id, String>,
        /// Banned pseudoips; submissions from these are refused.
        #[serde(default)]
        bans: BTreeSet<String>,
        next_id: Id,
    }

    #[derive(Clone)]
    pub struct InMemRepo {
        state: Arc<RwLock<State>>,
        snapshot_path: Arc<PathBuf>,
    }

    impl InMemRepo {
        fn snapshot_path() -> PathBuf {
            match std::env::var("TABULA_DATA_DIR") {
                Ok(dir) => {
                    let mut p = PathBuf::from(dir);
                    p.push("state.json");
                    p
                }
                Err(_) => PathBuf::from(SNAPSHOT_PATH),
            }
        }

        fn load_state_from(path: &Path) -> State {
            match std::fs::read(path) {
                Ok(bytes) => match serde_json::from_slice::<State>(&bytes) {
                    Ok(mut s) => {
                        let origins = s.origins.clone();
                        for t in s.threads.values_mut() {
                            if let Some(o) = origins.get(&t.id) {
                                t.pseudoip = o.clone();
                            }
                        }
                        for p in s.posts.values_mut() {
                            if let Some(o) = origins.get(&p.id) {
                                p.pseudoip = o.clone();
                            }
                        }
                        log::info!("loaded snapshot '{}'", path.display());
                        s
                    }
                    Err(e) => {
                        log::warn!("failed to parse snapshot '{}': {e}; starting empty", path.display());
                        State::default()
                    }
                },
                Err(_) => State::default(),
            }
        }

        fn persist(&self) {
            let path = self.snapshot_path.clone();
            if let Ok(s) = serde_json::to_vec_pretty(&*self.state.read().unwrap()) {
                if let Some(dir) = path.parent() {
                    let _ = std::fs::create_dir_all(dir);
                }
                if let Err(e) = std::fs::write(&*path, s) {
                    log::warn!("failed to write snapshot '{}': {e}", path.display());
                }
            }
        }

        pub fn new() -> Self {
            let snapshot_path = Self::snapshot_path();
            let state = Self::load_state_from(&snapshot_path);
            Self {
                state: Arc::new(RwLock::new(state)),
                snapshot_path: Arc::new(snapshot_path),
            }
        }

        fn next_id(state: &mut State) -> Id {
            state.next_id += 1;
            state.next_id
        }

        fn attachments_of(state: &State, owner: AttachmentOwner, owner_id: Id) -> Vec<Attachment> {
            let mut v: Vec<_> = state
                .attachments
                .values()
                .filter(|a| a.owner == owner && a.owner_id == owner_id)
                .cloned()
                .collect();
            v.sort_by_key(|a| a.id);
            v
        }

        /// Remove posts plus their attachments and edges in either direction.
        /// Reports the removed attachments' hashes that no surviving row
        /// still references.
        fn purge_posts(state: &mut State, ids: &[Id]) -> PurgeOutcome {
            let mut deleted = 0;
            for id in ids {
                if state.posts.remove(id).is_some() {
                    deleted += 1;
                }
                state.origins.remove(id);
            }
            let mut candidates: Vec<String> = state
                .attachments
                .values()
                .filter(|a| a.owner == AttachmentOwner::Post && ids.contains(&a.owner_id))
                .map(|a| a.hash.clone())
                .collect();
            state
                .attachments
                .retain(|_, a| !(a.owner == AttachmentOwner::Post && ids.contains(&a.owner_id)));
            state
                .reply_edges
                .retain(|(from, to)| !ids.contains(from) && !ids.contains(to));
            candidates.sort();
            candidates.dedup();
            let orphaned_blobs = candidates
                .into_iter()
                .filter(|h| !state.attachments.values().any(|a| a.hash == *h))
                .collect();
            PurgeOutcome { deleted, orphaned_blobs }
        }
    }

    impl Default for InMemRepo {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl BoardRepo for InMemRepo {
        async fn list_boards(&self) -> RepoResult<Vec<Board>> {
            let s = self.state.read().unwrap();
            let mut v: Vec<_> = s.boards.values().cloned().collect();
            v.sort_by(|a, b| a.name.cmp(&b.name));
            Ok(v)
        }
        async fn get_board(&self, name: &str) -> RepoResult<Board> {
            let s = self.state.read().unwrap();
            s.boards.get(name).cloned().ok_or(RepoError::NotFound)
        }
        async fn create_board(&self, new: NewBoard) -> RepoResult<Board> {
            let mut s = self.state.write().unwrap();
            if s.boards.contains_key(&new.name) {
                return Err(RepoError::Conflict);
            }
            let board = Board {
                name: new.name.clone(),
                short_description: new.short_description,
                description: new.description,
            };
            s.boards.insert(new.name, board.clone());
            drop(s);
            self.persist();
            Ok(board)
        }
    }

    #[async_trait]
    impl ThreadRepo for InMemRepo {
        async fn list_threads(&self, board: &str, preview: usize) -> RepoResult<Vec<ThreadListing>> {
            let s = self.state.read().unwrap();
            if !s.boards.contains_key(board) {
                return Err(RepoError::NotFound);
            }
            let mut bumped: Vec<(chrono::DateTime<Utc>, ThreadListing)> = Vec::new();
            for thread in s.threads.values().filter(|t| t.board == board) {
                let mut posts: Vec<_> = s
                    .posts
                    .values()
                    .filter(|p| p.thread_id == thread.id)
                    .cloned()
                    .collect();
                posts.sort_by(|a, b| (a.date, a.id).cmp(&(b.date, b.id)));
                let post_count = posts.len() as i64;
                // Bump time: newest post date, own date for quiet threads.
                let last_bump = posts.last().map_or(thread.date, |p| p.date.max(thread.date));
                let preview_posts = posts
                    .into_iter()
                    .take(preview)
                    .map(|p| {
                        let attachments = Self::attachments_of(&s, AttachmentOwner::Post, p.id);
                        PostEntry { post: p, attachments }
                    })
                    .collect();
                let listing = ThreadListing {
                    attachments: Self::attachments_of(&s, AttachmentOwner::Thread, thread.id),
                    thread: thread.clone(),
                    post_count,
                    preview: preview_posts,
                };
                bumped.push((last_bump, listing));
            }
            bumped.sort_by(|a, b| (b.0, b.1.thread.id).cmp(&(a.0, a.1.thread.id)));
            Ok(bumped.into_iter().map(|(_, l)| l).collect())
        }
        async fn create_thread(&self, new: NewThread) -> RepoResult<Thread> {
            let mut s = self.state.write().unwrap();
            if !s.boards.contains_key(&new.board) {
                return Err(RepoError::NotFound);
            }
            let id = Self::next_id(&mut s);
            let thread = Thread {
                id,
                board: new.board,
                name: new.name,
                subject: new.subject,
                comment: new.comment,
                date: Utc::now(),
                pseudoip: new.pseudoip,
            };
            s.origins.insert(id, thread.pseudoip.clone());
            s.threads.insert(id, thread.clone());
            drop(s);
            self.persist();
            Ok(thread)
        }
        async fn get_thread(&self, id: Id) -> RepoResult<Thread> {
            let s = self.state.read().unwrap();
            s.threads.get(&id).cloned().ok_or(RepoError::NotFound)
        }
        async fn delete_thread(&self, id: Id) -> RepoResult<Vec<String>> {
            let mut s = self.state.write().unwrap();
            if s.threads.remove(&id).is_none() {
                return Err(RepoError::NotFound);
            }
            s.origins.remove(&id);
            let post_ids: Vec<Id> = s
                .posts
                .values()
                .filter(|p| p.thread_id == id)
                .map(|p| p.id)
                .collect();
            let mut orphans = Self::purge_posts(&mut s, &post_ids).orphaned_blobs;
            orphans.extend(
                s.attachments
                    .values()
                    .filter(|a| a.owner == AttachmentOwner::Thread && a.owner_id == id)
                    .map(|a| a.hash.clone()),
            );
            s.attachments
                .retain(|_, a| !(a.owner == AttachmentOwner::Thread && a.owner_id == id));
            orphans.sort();
            orphans.dedup();
            // a candidate may still be referenced from another owner
            orphans.retain(|h| !s.attachments.values().any(|a| a.hash == *h));
            drop(s);
            self.persist();
            Ok(orphans)
        }
    }

    #[async_trait]
    impl PostRepo for InMemRepo {
        async fn list_posts(&self, thread_id: Id) -> RepoResult<Vec<Post>> {
            let s = self.state.read().unwrap();
            let mut v: Vec<_> = s
                .posts
                .values()
                .filter(|p| p.thread_id == thread_id)
                .cloned()
                .collect();
            v.sort_by(|a, b| (a.date, a.id).cmp(&(b.date, b.id)));
            Ok(v)
        }
        async fn get_post(&self, id: Id) -> RepoResult<Post> {
            let s = self.state.read().unwrap();
            s.posts.get(&id).cloned().ok_or(RepoError::NotFound)
        }
        async fn create_post(&self, new: NewPost) -> RepoResult<Post> {
            let mut s = self.state.write().unwrap();
            if !s.threads.contains_key(&new.thread_id) {
                return Err(RepoError::NotFound);
            }
            let id = Self::next_id(&mut s);
            let post = Post {
                id,
                thread_id: new.thread_id,
                name: new.name,
                subject: new.subject,
                comment: new.comment,
                date: Utc::now(),
                pseudoip: new.pseudoip,
            };
            s.origins.insert(id, post.pseudoip.clone());
            s.posts.insert(id, post.clone());
            drop(s);
            self.persist();
            Ok(post)
        }
        async fn add_reply_edges(&self, post_id: Id, targets: &[Id]) -> RepoResult<Vec<Id>> {
            let mut s = self.state.write().unwrap();
            if !s.posts.contains_key(&post_id) {
                return Err(RepoError::NotFound);
            }
            let mut linked = Vec::new();
            for &target in targets {
                if s.posts.contains_key(&target) && s.reply_edges.insert((post_id, target)) {
                    linked.push(target);
                }
            }
            drop(s);
            self.persist();
            Ok(linked)
        }
        async fn replies_to(&self, post_id: Id) -> RepoResult<Vec<Id>> {
            let s = self.state.read().unwrap();
            Ok(s.reply_edges
                .iter()
                .filter(|(from, _)| *from == post_id)
                .map(|(_, to)| *to)
                .collect())
        }
        async fn replies(&self, post_id: Id) -> RepoResult<Vec<Id>> {
            let s = self.state.read().unwrap();
            Ok(s.reply_edges
                .iter()
                .filter(|(_, to)| *to == post_id)
                .map(|(from, _)| *from)
                .collect())
        }
        async fn delete_posts(&self, board: &str, ids: &[Id]) -> RepoResult<PurgeOutcome> {
            let mut s = self.state.write().unwrap();
            let in_board: Vec<Id> = ids
                .iter()
                .copied()
                .filter(|id| {
                    s.posts
                        .get(id)
                        .and_then(|p| s.threads.get(&p.thread_id))
                        .map(|t| t.board == board)
                        .unwrap_or(false)
                })
                .collect();
            let outcome = Self::purge_posts(&mut s, &in_board);
            drop(s);
            self.persist();
            Ok(outcome)
        }
        async fn delete_posts_by_pseudoip(&self, pseudoip: &str) -> RepoResult<PurgeOutcome> {
            let mut s = self.state.write().unwrap();
            let ids: Vec<Id> = s
                .posts
                .values()
                .filter(|p| p.pseudoip == pseudoip)
                .map(|p| p.id)
                .collect();
            let outcome = Self::purge_posts(&mut s, &ids);
            drop(s);
            self.persist();
            Ok(outcome)
        }
    }

    #[async_trait]
    impl BanRepo for InMemRepo {
        async fn ban_pseudoip(&self, pseudoip: &str) -> RepoResult<()> {
            let mut s = self.state.write().unwrap();
            s.bans.insert(pseudoip.to_string());
            drop(s);
            self.persist();
            Ok(())
        }
        async fn unban_pseudoip(&self, pseudoip: &str) -> RepoResult<()> {
            let mut s = self.state.write().unwrap();
            if !s.bans.remove(pseudoip) {
                return Err(RepoError::NotFound);
            }
            drop(s);
            self.persist();
            Ok(())
        }
        async fn is_banned(&self, pseudoip: &str) -> RepoResult<bool> {
            let s = self.state.read().unwrap();
            Ok(s.bans.contains(pseudoip))
        }
        async fn list_bans(&self) -> RepoResult<Vec<String>> {
            let s = self.state.read().unwrap();
            Ok(s.bans.iter().cloned().collect())
        }
    }

    #[async_trait]
    impl AttachmentRepo for InMemRepo {
        async fn add_attachments(
            &self,
            owner: AttachmentOwner,
            owner_id: Id,
            new: Vec<NewAttachment>,
        ) -> RepoResult<Vec<Attachment>> {
            let mut s = self.state.write().unwrap();
            let exists = match owner {
                AttachmentOwner::Thread => s.threads.contains_key(&owner_id),
                AttachmentOwner::Post => s.posts.contains_key(&owner_id),
            };
            if !exists {
                return Err(RepoError::NotFound);
            }
            let mut created = Vec::with_capacity(new.len());
            for n in new {
                let id = Self::next_id(&mut s);
                let att = Attachment {
                    id,
                    owner,
                    owner_id,
                    file_name: n.file_name,
                    hash: n.hash,
                    mime: n.mime,
                };
                s.attachments.insert(id, att.clone());
                created.push(att);
            }
            drop(s);
            self.persist();
            Ok(created)
        }
        async fn attachments_for(&self, owner: AttachmentOwner, owner_id: Id) -> RepoResult<Vec<Attachment>> {
            let s = self.state.read().unwrap();
            Ok(Self::attachments_of(&s, owner, owner_id))
        }
    }
}

// Postgres implementation (feature = "postgres-store")
#[cfg(feature = "postgres-store")]
pub mod pg {
    use super::*;
    use sqlx::{Pool, Postgres, Row};

    #[derive(Clone)]
    pub struct PgRepo {
        pool: Pool<Postgres>,
    }

    impl PgRepo {
        pub fn new(pool: Pool<Postgres>) -> Self {
            Self { pool }
        }

        /// Filter removed-attachment hashes down to the ones no surviving
        /// row still references (blobs are content-addressed and shared).
        async fn unreferenced(&self, mut hashes: Vec<String>) -> RepoResult<Vec<String>> {
            hashes.sort();
            hashes.dedup();
            if hashes.is_empty() {
                return Ok(hashes);
            }
            let live = sqlx::query("SELECT DISTINCT hash FROM attachments WHERE hash = ANY($1)")
                .bind(&hashes)
                .fetch_all(&self.pool)
                .await
                .map_err(internal)?;
            let live: Vec<String> = live.iter().map(|r| r.get("hash")).collect();
            hashes.retain(|h| !live.contains(h));
            Ok(hashes)
        }
    }

    fn internal(e: sqlx::Error) -> RepoError {
        RepoError::Internal(e.to_string())
    }

    fn attachment_from_row(row: &sqlx::postgres::PgRow) -> Attachment {
        let kind: String = row.get("owner_kind");
        Attachment {
            id: row.get("id"),
            owner: if kind == "thread" { AttachmentOwner::Thread } else { AttachmentOwner::Post },
            owner_id: row.get("owner_id"),
            file_name: row.get("file_name"),
            hash: row.get("hash"),
            mime: row.get("mime"),
        }
    }

    #[async_trait]
    impl BoardRepo for PgRepo {
        async fn list_boards(&self) -> RepoResult<Vec<Board>> {
            sqlx::query_as::<_, Board>(
                "SELECT name, short_description, description FROM boards ORDER BY name",
            )
            .fetch_all(&self.pool)
            .await
            .map_err(internal)
        }
        async fn get_board(&self, name: &str) -> RepoResult<Board> {
            sqlx::query_as::<_, Board>(
                "SELECT name, short_description, description FROM boards WHERE name = $1",
            )
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(internal)?
            .ok_or(RepoError::NotFound)
        }
        async fn create_board(&self, new: NewBoard) -> RepoResult<Board> {
            sqlx::query_as::<_, Board>(
                "INSERT INTO boards (name, short_description, description) VALUES ($1,$2,$3) \
                 RETURNING name, short_description, description",
            )
            .bind(&new.name)
            .bind(&new.short_description)
            .bind(&new.description)
            .fetch_one(&self.pool)
            .await
            .map_err(|_| RepoError::Conflict)
        }
    }

    #[async_trait]
    impl ThreadRepo for PgRepo {
        async fn list_threads(&self, board: &str, preview: usize) -> RepoResult<Vec<ThreadListing>> {
            self.get_board(board).await?;
            // Bump time via lateral aggregate; one pass over the board.
            let threads = sqlx::query_as::<_, Thread>(
                r#"
                SELECT t.id, t.board, t.name, t.subject, t.comment, t.date, t.pseudoip
                FROM threads t
                LEFT JOIN LATERAL (
                    SELECT max(p.date) AS last_post FROM posts p WHERE p.thread_id = t.id
                ) lp ON TRUE
                WHERE t.board = $1
                ORDER BY GREATEST(t.date, COALESCE(lp.last_post, t.date)) DESC, t.id DESC
                "#,
            )
            .bind(board)
            .fetch_all(&self.pool)
            .await
            .map_err(internal)?;

            let ids: Vec<Id> = threads.iter().map(|t| t.id).collect();
            // Oldest N posts per thread in a single windowed query.
            let preview_rows = sqlx::query_as::<_, Post>(
                r#"
                SELECT id, thread_id, name, subject, comment, date, pseudoip FROM (
                    SELECT p.*, row_number() OVER (PARTITION BY p.thread_id ORDER BY p.date, p.id) AS rn
                    FROM posts p WHERE p.thread_id = ANY($1)
                ) x WHERE rn <= $2
                ORDER BY thread_id, date, id
                "#,
            )
            .bind(&ids)
            .bind(preview as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(internal)?;

            let counts = sqlx::query(
                "SELECT thread_id, count(*) AS n FROM posts WHERE thread_id = ANY($1) GROUP BY thread_id",
            )
            .bind(&ids)
            .fetch_all(&self.pool)
            .await
            .map_err(internal)?;

            let post_ids: Vec<Id> = preview_rows.iter().map(|p| p.id).collect();
            let att_rows = sqlx::query(
                r#"
                SELECT id, owner_kind, owner_id, file_name, hash, mime FROM attachments
                WHERE (owner_kind = 'thread' AND owner_id = ANY($1))
                   OR (owner_kind = 'post' AND owner_id = ANY($2))
                ORDER BY id
                "#,
            )
            .bind(&ids)
            .bind(&post_ids)
            .fetch_all(&self.pool)
            .await
            .map_err(internal)?;
            let attachments: Vec<Attachment> = att_rows.iter().map(attachment_from_row).collect();

            let listings = threads
                .into_iter()
                .map(|t| {
                    let preview = preview_rows
                        .iter()
                        .filter(|p| p.thread_id == t.id)
                        .map(|p| PostEntry {
                            attachments: attachments
                                .iter()
                                .filter(|a| a.owner == AttachmentOwner::Post && a.owner_id == p.id)
                                .cloned()
                                .collect(),
                            post: p.clone(),
                        })
                        .collect();
                    let post_count = counts
                        .iter()
                        .find(|r| r.get::<Id, _>("thread_id") == t.id)
                        .map(|r| r.get::<i64, _>("n"))
                        .unwrap_or(0);
                    ThreadListing {
                        attachments: attachments
                            .iter()
                            .filter(|a| a.owner == AttachmentOwner::Thread && a.owner_id == t.id)
                            .cloned()
                            .collect(),
                        thread: t,
                        post_count,
                        preview,
                    }
                })
                .collect();
            Ok(listings)
        }
        async fn create_thread(&self, new: NewThread) -> RepoResult<Thread> {
            self.get_board(&new.board).await?;
            sqlx::query_as::<_, Thread>(
                "INSERT INTO threads (board, name, subject, comment, pseudoip) VALUES ($1,$2,$3,$4,$5) \
                 RETURNING id, board, name, subject, comment, date, pseudoip",
            )
            .bind(&new.board)
            .bind(&new.name)
            .bind(&new.subject)
            .bind(&new.comment)
            .bind(&new.pseudoip)
            .fetch_one(&self.pool)
            .await
            .map_err(internal)
        }
        async fn get_thread(&self, id: Id) -> RepoResult<Thread> {
            sqlx::query_as::<_, Thread>(
                "SELECT id, board, name, subject, comment, date, pseudoip FROM threads WHERE id = $1",
            )
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(internal)?
            .ok_or(RepoError::NotFound)
        }
        async fn delete_thread(&self, id: Id) -> RepoResult<Vec<String>> {
            let res = sqlx::query("DELETE FROM threads WHERE id = $1")
                .bind(id)
                .execute(&self.pool)
                .await
                .map_err(internal)?;
            if res.rows_affected() == 0 {
                return Err(RepoError::NotFound);
            }
            // Posts and edges cascade via FK; polymorphic attachments do not.
            let own = sqlx::query(
                "DELETE FROM attachments WHERE owner_kind = 'thread' AND owner_id = $1 \
                 RETURNING hash",
            )
            .bind(id)
            .fetch_all(&self.pool)
            .await
            .map_err(internal)?;
            let stranded = sqlx::query(
                "DELETE FROM attachments a WHERE a.owner_kind = 'post' \
                 AND NOT EXISTS (SELECT 1 FROM posts p WHERE p.id = a.owner_id) \
                 RETURNING hash",
            )
            .fetch_all(&self.pool)
            .await
            .map_err(internal)?;
            let removed = own
                .iter()
                .chain(stranded.iter())
                .map(|r| r.get("hash"))
                .collect();
            self.unreferenced(removed).await
        }
    }

    #[async_trait]
    impl PostRepo for PgRepo {
        async fn list_posts(&self, thread_id: Id) -> RepoResult<Vec<Post>> {
            sqlx::query_as::<_, Post>(
                "SELECT id, thread_id, name, subject, comment, date, pseudoip \
                 FROM posts WHERE thread_id = $1 ORDER BY date, id",
            )
            .bind(thread_id)
            .fetch_all(&self.pool)
            .await
            .map_err(internal)
        }
        async fn get_post(&self, id: Id) -> RepoResult<Post> {
            sqlx::query_as::<_, Post>(
                "SELECT id, thread_id, name, subject, comment, date, pseudoip FROM posts WHERE id = $1",
            )
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(internal)?
            .ok_or(RepoError::NotFound)
        }
        async fn create_post(&self, new: NewPost) -> RepoResult<Post> {
            self.get_thread(new.thread_id).await?;
            sqlx::query_as::<_, Post>(
                "INSERT INTO posts (thread_id, name, subject, comment, pseudoip) VALUES ($1,$2,$3,$4,$5) \
                 RETURNING id, thread_id, name, subject, comment, date, pseudoip",
            )
            .bind(new.thread_id)
            .bind(&new.name)
            .bind(&new.subject)
            .bind(&new.comment)
            .bind(&new.pseudoip)
            .fetch_one(&self.pool)
            .await
            .map_err(internal)
        }
        async fn add_reply_edges(&self, post_id: Id, targets: &[Id]) -> RepoResult<Vec<Id>> {
            self.get_post(post_id).await?;
            let rows = sqlx::query(
                "INSERT INTO reply_edges (post_id, target_id) \
                 SELECT $1, p.id FROM posts p WHERE p.id = ANY($2) \
                 ON CONFLICT DO NOTHING RETURNING target_id",
            )
            .bind(post_id)
            .bind(targets)
            .fetch_all(&self.pool)
            .await
            .map_err(internal)?;
            Ok(rows.iter().map(|r| r.get("target_id")).collect())
        }
        async fn replies_to(&self, post_id: Id) -> RepoResult<Vec<Id>> {
            let rows = sqlx::query("SELECT target_id FROM reply_edges WHERE post_id = $1 ORDER BY target_id")
                .bind(post_id)
                .fetch_all(&self.pool)
                .await
                .map_err(internal)?;
            Ok(rows.iter().map(|r| r.get("target_id")).collect())
        }
        async fn replies(&self, post_id: Id) -> RepoResult<Vec<Id>> {
            let rows = sqlx::query("SELECT post_id FROM reply_edges WHERE target_id = $1 ORDER BY post_id")
                .bind(post_id)
                .fetch_all(&self.pool)
                .await
                .map_err(internal)?;
            Ok(rows.iter().map(|r| r.get("post_id")).collect())
        }
        async fn delete_posts(&self, board: &str, ids: &[Id]) -> RepoResult<PurgeOutcome> {
            let res = sqlx::query(
                "DELETE FROM posts p USING threads t \
                 WHERE p.thread_id = t.id AND t.board = $1 AND p.id = ANY($2)",
            )
            .bind(board)
            .bind(ids)
            .execute(&self.pool)
            .await
            .map_err(internal)?;
            let removed = sqlx::query(
                "DELETE FROM attachments a WHERE a.owner_kind = 'post' \
                 AND NOT EXISTS (SELECT 1 FROM posts p WHERE p.id = a.owner_id) \
                 RETURNING hash",
            )
            .fetch_all(&self.pool)
            .await
            .map_err(internal)?;
            let orphaned_blobs = self
                .unreferenced(removed.iter().map(|r| r.get("hash")).collect())
                .await?;
            Ok(PurgeOutcome { deleted: res.rows_affected(), orphaned_blobs })
        }
        async fn delete_posts_by_pseudoip(&self, pseudoip: &str) -> RepoResult<PurgeOutcome> {
            let res = sqlx::query("DELETE FROM posts WHERE pseudoip = $1")
                .bind(pseudoip)
                .execute(&self.pool)
                .await
                .map_err(internal)?;
            let removed = sqlx::query(
                "DELETE FROM attachments a WHERE a.owner_kind = 'post' \
                 AND NOT EXISTS (SELECT 1 FROM posts p WHERE p.id = a.owner_id) \
                 RETURNING hash",
            )
            .fetch_all(&self.pool)
            .await
            .map_err(internal)?;
            let orphaned_blobs = self
                .unreferenced(removed.iter().map(|r| r.get("hash")).collect())
                .await?;
            Ok(PurgeOutcome { deleted: res.rows_affected(), orphaned_blobs })
        }
    }

    #[async_trait]
    impl BanRepo for PgRepo {
        async fn ban_pseudoip(&self, pseudoip: &str) -> RepoResult<()> {
            sqlx::query("INSERT INTO bans (pseudoip) VALUES ($1) ON CONFLICT DO NOTHING")
                .bind(pseudoip)
                .execute(&self.pool)
                .await
                .map_err(internal)?;
            Ok(())
        }
        async fn unban_pseudoip(&self, pseudoip: &str) -> RepoResult<()> {
            let res = sqlx::query("DELETE FROM bans WHERE pseudoip = $1")
                .bind(pseudoip)
                .execute(&self.pool)
                .await
                .map_err(internal)?;
            if res.rows_affected() == 0 {
                return Err(RepoError::NotFound);
            }
            Ok(())
        }
        async fn is_banned(&self, pseudoip: &str) -> RepoResult<bool> {
            let row = sqlx::query("SELECT EXISTS(SELECT 1 FROM bans WHERE pseudoip = $1) AS banned")
                .bind(pseudoip)
                .fetch_one(&self.pool)
                .await
                .map_err(internal)?;
            Ok(row.get("banned"))
        }
        async fn list_bans(&self) -> RepoResult<Vec<String>> {
            let rows = sqlx::query("SELECT pseudoip FROM bans ORDER BY pseudoip")
                .fetch_all(&self.pool)
                .await
                .map_err(internal)?;
            Ok(rows.iter().map(|r| r.get("pseudoip")).collect())
        }
    }

    #[async_trait]
    impl AttachmentRepo for PgRepo {
        async fn add_attachments(
            &self,
            owner: AttachmentOwner,
            owner_id: Id,
            new: Vec<NewAttachment>,
        ) -> RepoResult<Vec<Attachment>> {
            let mut created = Vec::with_capacity(new.len());
            for n in new {
                let row = sqlx::query(
                    "INSERT INTO attachments (owner_kind, owner_id, file_name, hash, mime) \
                     VALUES ($1,$2,$3,$4,$5) RETURNING id, owner_kind, owner_id, file_name, hash, mime",
                )
                .bind(owner.as_str())
                .bind(owner_id)
                .bind(&n.file_name)
                .bind(&n.hash)
                .bind(&n.mime)
                .fetch_one(&self.pool)
                .await
                .map_err(internal)?;
                created.push(attachment_from_row(&row));
            }
            Ok(created)
        }
        async fn attachments_for(&self, owner: AttachmentOwner, owner_id: Id) -> RepoResult<Vec<Attachment>> {
            let rows = sqlx::query(
                "SELECT id, owner_kind, owner_id, file_name, hash, mime FROM attachments \
                 WHERE owner_kind = $1 AND owner_id = $2 ORDER BY id",
            )
            .bind(owner.as_str())
            .bind(owner_id)
            .fetch_all(&self.pool)
            .await
            .map_err(internal)?;
            Ok(rows.iter().map(attachment_from_row).collect())
        }
    }
}
