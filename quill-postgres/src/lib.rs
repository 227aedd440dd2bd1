use std::time::Duration;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use futures::channel::mpsc;
use quill_api::{
    Change, ChangeFilter, ChangeStream, Comment, CommentId, Db, LikeEdge, LikeTarget,
    Notification, NotificationId, NotificationKind, Quote, QuoteEdge, QuoteEdgeKind, QuoteId,
    QuoteSnapshot, Reply, ReplyId, Table, Time, User, UserId, Uuid,
};
use sqlx::{postgres::PgRow, Row};

mod tests;

pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!();

/// Channel on which every committed write is announced
const CHANGES_CHANNEL: &str = "quill_changes";

/// How often a quiet change listener checks whether its feed was dropped
const FEED_CHECK_INTERVAL: Duration = Duration::from_secs(1);

pub struct PgDb {
    pool: sqlx::PgPool,
}

pub async fn create_sqlx_pool(url: &str) -> anyhow::Result<sqlx::PgPool> {
    sqlx::postgres::PgPoolOptions::new()
        .max_connections(8)
        .connect(url)
        .await
        .with_context(|| format!("connecting to postgres database {url:?}"))
}

impl PgDb {
    pub fn new(pool: sqlx::PgPool) -> PgDb {
        PgDb { pool }
    }

    /// Connects to `DATABASE_URL` and brings its schema up to date
    pub async fn from_env() -> anyhow::Result<PgDb> {
        let url = std::env::var("DATABASE_URL").context("reading DATABASE_URL")?;
        let pool = create_sqlx_pool(&url).await?;
        MIGRATOR
            .run(&pool)
            .await
            .context("applying database migrations")?;
        Ok(PgDb::new(pool))
    }

    async fn begin(&self) -> anyhow::Result<sqlx::Transaction<'static, sqlx::Postgres>> {
        self.pool.begin().await.context("starting transaction")
    }
}

/// Bumps the quote revision and announces the change, both only visible once
/// the transaction commits
async fn relay(conn: &mut sqlx::PgConnection, change: Change) -> anyhow::Result<()> {
    if let Some(quote) = change.quote_id {
        sqlx::query(
            "
                INSERT INTO quote_revisions (quote_id, revision)
                VALUES ($1, 1)
                ON CONFLICT (quote_id)
                DO UPDATE SET revision = quote_revisions.revision + 1
            ",
        )
        .bind(quote.0)
        .execute(&mut *conn)
        .await
        .with_context(|| format!("bumping revision of quote {quote:?}"))?;
    }
    let payload = serde_json::to_string(&change).context("serializing change")?;
    sqlx::query("SELECT pg_notify($1, $2)")
        .bind(CHANGES_CHANNEL)
        .bind(payload)
        .execute(&mut *conn)
        .await
        .context("notifying change")?;
    Ok(())
}

fn like_table(target: LikeTarget) -> (&'static str, &'static str, Uuid, Table) {
    match target {
        LikeTarget::Comment(c) => ("comment_likes", "comment_id", c.0, Table::CommentLikes),
        LikeTarget::Reply(r) => ("reply_likes", "reply_id", r.0, Table::ReplyLikes),
    }
}

fn edge_table(kind: QuoteEdgeKind) -> &'static str {
    match kind {
        QuoteEdgeKind::Like => "quote_likes",
        QuoteEdgeKind::Favorite => "quote_favorites",
    }
}

fn kind_name(kind: NotificationKind) -> &'static str {
    match kind {
        NotificationKind::Like => "like",
        NotificationKind::Favorite => "favorite",
        NotificationKind::Comment => "comment",
        NotificationKind::Message => "message",
    }
}

fn kind_from_name(name: &str) -> anyhow::Result<NotificationKind> {
    Ok(match name {
        "like" => NotificationKind::Like,
        "favorite" => NotificationKind::Favorite,
        "comment" => NotificationKind::Comment,
        "message" => NotificationKind::Message,
        _ => return Err(anyhow!("unknown notification kind {name:?}")),
    })
}

async fn quote_of_target(
    conn: &mut sqlx::PgConnection,
    target: LikeTarget,
) -> anyhow::Result<Option<QuoteId>> {
    let row = match target {
        LikeTarget::Comment(c) => sqlx::query("SELECT quote_id FROM comments WHERE id = $1")
            .bind(c.0)
            .fetch_optional(&mut *conn)
            .await
            .context("querying comments table")?,
        LikeTarget::Reply(r) => sqlx::query(
            "
                SELECT c.quote_id
                    FROM replies r
                INNER JOIN comments c
                    ON c.id = r.comment_id
                WHERE r.id = $1
            ",
        )
        .bind(r.0)
        .fetch_optional(&mut *conn)
        .await
        .context("querying replies table")?,
    };
    row.map(|r| {
        r.try_get("quote_id")
            .map(QuoteId)
            .context("retrieving the quote_id field")
    })
    .transpose()
}

fn quote_from_row(r: &PgRow) -> anyhow::Result<Quote> {
    Ok(Quote {
        id: QuoteId(r.try_get("id").context("retrieving the id field")?),
        owner_id: UserId(r.try_get("owner_id").context("retrieving the owner_id field")?),
        date: r
            .try_get::<Time, _>("date")
            .context("retrieving the date field")?,
        text: r.try_get("text").context("retrieving the text field")?,
        author: r.try_get("author").context("retrieving the author field")?,
        category: r
            .try_get("category")
            .context("retrieving the category field")?,
        hidden: r.try_get("hidden").context("retrieving the hidden field")?,
    })
}

fn comment_from_row(r: &PgRow) -> anyhow::Result<Comment> {
    Ok(Comment {
        id: CommentId(r.try_get("id").context("retrieving the id field")?),
        quote_id: QuoteId(r.try_get("quote_id").context("retrieving the quote_id field")?),
        owner_id: UserId(r.try_get("owner_id").context("retrieving the owner_id field")?),
        date: r
            .try_get::<Time, _>("date")
            .context("retrieving the date field")?,
        text: r.try_get("text").context("retrieving the text field")?,
    })
}

fn reply_from_row(r: &PgRow) -> anyhow::Result<Reply> {
    Ok(Reply {
        id: ReplyId(r.try_get("id").context("retrieving the id field")?),
        comment_id: CommentId(
            r.try_get("comment_id")
                .context("retrieving the comment_id field")?,
        ),
        parent_id: r
            .try_get::<Option<Uuid>, _>("parent_id")
            .context("retrieving the parent_id field")?
            .map(ReplyId),
        owner_id: UserId(r.try_get("owner_id").context("retrieving the owner_id field")?),
        date: r
            .try_get::<Time, _>("date")
            .context("retrieving the date field")?,
        text: r.try_get("text").context("retrieving the text field")?,
    })
}

fn quote_edge_from_row(kind: QuoteEdgeKind, r: &PgRow) -> anyhow::Result<QuoteEdge> {
    Ok(QuoteEdge {
        kind,
        owner_id: UserId(r.try_get("owner_id").context("retrieving the owner_id field")?),
        quote_id: QuoteId(r.try_get("quote_id").context("retrieving the quote_id field")?),
        date: r
            .try_get::<Time, _>("date")
            .context("retrieving the date field")?,
        snapshot: QuoteSnapshot {
            text: r.try_get("text").context("retrieving the text field")?,
            author: r.try_get("author").context("retrieving the author field")?,
            category: r
                .try_get("category")
                .context("retrieving the category field")?,
        },
    })
}

fn notification_from_row(r: &PgRow) -> anyhow::Result<Notification> {
    Ok(Notification {
        id: NotificationId(r.try_get("id").context("retrieving the id field")?),
        user_id: UserId(r.try_get("user_id").context("retrieving the user_id field")?),
        actor_id: UserId(r.try_get("actor_id").context("retrieving the actor_id field")?),
        kind: kind_from_name(r.try_get("kind").context("retrieving the kind field")?)?,
        title: r.try_get("title").context("retrieving the title field")?,
        message: r.try_get("message").context("retrieving the message field")?,
        read: r.try_get("read").context("retrieving the read field")?,
        date: r
            .try_get::<Time, _>("date")
            .context("retrieving the date field")?,
        quote_id: r
            .try_get::<Option<Uuid>, _>("quote_id")
            .context("retrieving the quote_id field")?
            .map(QuoteId),
    })
}

#[async_trait]
impl Db for PgDb {
    async fn revision(&self, quote: QuoteId) -> anyhow::Result<u64> {
        let rev = sqlx::query("SELECT revision FROM quote_revisions WHERE quote_id = $1")
            .bind(quote.0)
            .fetch_optional(&self.pool)
            .await
            .context("querying quote_revisions table")?
            .map(|r| r.try_get::<i64, _>("revision"))
            .transpose()
            .context("retrieving the revision field")?
            .unwrap_or(0);
        Ok(rev as u64)
    }

    async fn fetch_quote(&self, quote: QuoteId) -> anyhow::Result<Option<Quote>> {
        sqlx::query(
            "
                SELECT id, owner_id, date, text, author, category, hidden
                    FROM quotes
                WHERE id = $1
            ",
        )
        .bind(quote.0)
        .fetch_optional(&self.pool)
        .await
        .context("querying quotes table")?
        .as_ref()
        .map(quote_from_row)
        .transpose()
    }

    async fn insert_quote(&self, quote: Quote) -> anyhow::Result<()> {
        quill_api::validate_string(&quote.text)?;
        let mut tx = self.begin().await?;
        sqlx::query(
            "
                INSERT INTO quotes (id, owner_id, date, text, author, category, hidden)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
            ",
        )
        .bind(quote.id.0)
        .bind(quote.owner_id.0)
        .bind(quote.date)
        .bind(&quote.text)
        .bind(&quote.author)
        .bind(&quote.category)
        .bind(quote.hidden)
        .execute(&mut *tx)
        .await
        .with_context(|| format!("inserting quote {:?}", quote.id))?;
        let change = Change {
            table: Table::Quotes,
            quote_id: Some(quote.id),
            user_id: None,
        };
        relay(&mut *tx, change).await?;
        tx.commit().await.context("committing quote insertion")
    }

    async fn fetch_users(&self, users: &[UserId]) -> anyhow::Result<Vec<User>> {
        let ids = users.iter().map(|u| u.0).collect::<Vec<_>>();
        sqlx::query("SELECT id, name FROM users WHERE id = ANY($1)")
            .bind(ids)
            .fetch_all(&self.pool)
            .await
            .context("querying users table")?
            .iter()
            .map(|r| {
                Ok::<_, anyhow::Error>(User {
                    id: UserId(r.try_get("id").context("retrieving the id field")?),
                    name: r.try_get("name").context("retrieving the name field")?,
                })
            })
            .collect()
    }

    async fn insert_user(&self, user: User) -> anyhow::Result<()> {
        quill_api::validate_string(&user.name)?;
        sqlx::query("INSERT INTO users (id, name) VALUES ($1, $2)")
            .bind(user.id.0)
            .bind(&user.name)
            .execute(&self.pool)
            .await
            .with_context(|| format!("inserting user {:?}", user.id))?;
        Ok(())
    }

    async fn fetch_comments(&self, quote: QuoteId) -> anyhow::Result<Vec<Comment>> {
        sqlx::query(
            "
                SELECT id, quote_id, owner_id, date, text
                    FROM comments
                WHERE quote_id = $1
                ORDER BY date, id
            ",
        )
        .bind(quote.0)
        .fetch_all(&self.pool)
        .await
        .context("querying comments table")?
        .iter()
        .map(comment_from_row)
        .collect()
    }

    async fn fetch_comment(&self, comment: CommentId) -> anyhow::Result<Option<Comment>> {
        sqlx::query("SELECT id, quote_id, owner_id, date, text FROM comments WHERE id = $1")
            .bind(comment.0)
            .fetch_optional(&self.pool)
            .await
            .context("querying comments table")?
            .as_ref()
            .map(comment_from_row)
            .transpose()
    }

    async fn insert_comment(&self, comment: Comment) -> anyhow::Result<()> {
        quill_api::validate_string(&comment.text)?;
        let mut tx = self.begin().await?;
        sqlx::query(
            "
                INSERT INTO comments (id, quote_id, owner_id, date, text)
                VALUES ($1, $2, $3, $4, $5)
            ",
        )
        .bind(comment.id.0)
        .bind(comment.quote_id.0)
        .bind(comment.owner_id.0)
        .bind(comment.date)
        .bind(&comment.text)
        .execute(&mut *tx)
        .await
        .with_context(|| format!("inserting comment {:?}", comment.id))?;
        let change = Change {
            table: Table::Comments,
            quote_id: Some(comment.quote_id),
            user_id: None,
        };
        relay(&mut *tx, change).await?;
        tx.commit().await.context("committing comment insertion")
    }

    async fn fetch_replies(&self, comments: &[CommentId]) -> anyhow::Result<Vec<Reply>> {
        let ids = comments.iter().map(|c| c.0).collect::<Vec<_>>();
        sqlx::query(
            "
                SELECT id, comment_id, parent_id, owner_id, date, text
                    FROM replies
                WHERE comment_id = ANY($1)
                ORDER BY date, id
            ",
        )
        .bind(ids)
        .fetch_all(&self.pool)
        .await
        .context("querying replies table")?
        .iter()
        .map(reply_from_row)
        .collect()
    }

    async fn fetch_reply(&self, reply: ReplyId) -> anyhow::Result<Option<Reply>> {
        sqlx::query(
            "
                SELECT id, comment_id, parent_id, owner_id, date, text
                    FROM replies
                WHERE id = $1
            ",
        )
        .bind(reply.0)
        .fetch_optional(&self.pool)
        .await
        .context("querying replies table")?
        .as_ref()
        .map(reply_from_row)
        .transpose()
    }

    async fn insert_reply(&self, reply: Reply) -> anyhow::Result<()> {
        quill_api::validate_string(&reply.text)?;
        let mut tx = self.begin().await?;
        let quote = quote_of_target(&mut *tx, LikeTarget::Comment(reply.comment_id))
            .await?
            .ok_or_else(|| {
                anyhow!(
                    "reply {:?} references missing comment {:?}",
                    reply.id,
                    reply.comment_id
                )
            })?;
        sqlx::query(
            "
                INSERT INTO replies (id, comment_id, parent_id, owner_id, date, text)
                VALUES ($1, $2, $3, $4, $5, $6)
            ",
        )
        .bind(reply.id.0)
        .bind(reply.comment_id.0)
        .bind(reply.parent_id.map(|p| p.0))
        .bind(reply.owner_id.0)
        .bind(reply.date)
        .bind(&reply.text)
        .execute(&mut *tx)
        .await
        .with_context(|| format!("inserting reply {:?}", reply.id))?;
        let change = Change {
            table: Table::Replies,
            quote_id: Some(quote),
            user_id: None,
        };
        relay(&mut *tx, change).await?;
        tx.commit().await.context("committing reply insertion")
    }

    async fn fetch_likes(&self, targets: &[LikeTarget]) -> anyhow::Result<Vec<LikeEdge>> {
        let (mut comments, mut replies) = (Vec::new(), Vec::new());
        for t in targets {
            match t {
                LikeTarget::Comment(c) => comments.push(c.0),
                LikeTarget::Reply(r) => replies.push(r.0),
            }
        }
        let mut res = Vec::new();
        for r in sqlx::query(
            "SELECT owner_id, comment_id, date FROM comment_likes WHERE comment_id = ANY($1)",
        )
        .bind(comments)
        .fetch_all(&self.pool)
        .await
        .context("querying comment_likes table")?
        {
            res.push(LikeEdge {
                owner_id: UserId(r.try_get("owner_id").context("retrieving the owner_id field")?),
                target: LikeTarget::Comment(CommentId(
                    r.try_get("comment_id")
                        .context("retrieving the comment_id field")?,
                )),
                date: r.try_get("date").context("retrieving the date field")?,
            });
        }
        for r in
            sqlx::query("SELECT owner_id, reply_id, date FROM reply_likes WHERE reply_id = ANY($1)")
                .bind(replies)
                .fetch_all(&self.pool)
                .await
                .context("querying reply_likes table")?
        {
            res.push(LikeEdge {
                owner_id: UserId(r.try_get("owner_id").context("retrieving the owner_id field")?),
                target: LikeTarget::Reply(ReplyId(
                    r.try_get("reply_id")
                        .context("retrieving the reply_id field")?,
                )),
                date: r.try_get("date").context("retrieving the date field")?,
            });
        }
        Ok(res)
    }

    async fn count_likes(&self, target: LikeTarget) -> anyhow::Result<u64> {
        let (table, column, id, _) = like_table(target);
        let count = sqlx::query(&format!(
            "SELECT COUNT(*) AS count FROM {table} WHERE {column} = $1"
        ))
        .bind(id)
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("counting {table} table"))?
        .try_get::<i64, _>("count")
        .context("retrieving the count field")?;
        Ok(count as u64)
    }

    async fn insert_like(&self, like: LikeEdge) -> anyhow::Result<bool> {
        let (table, column, id, changed) = like_table(like.target);
        let mut tx = self.begin().await?;
        let quote = quote_of_target(&mut *tx, like.target)
            .await?
            .ok_or_else(|| anyhow!("like references missing target {:?}", like.target))?;
        let inserted = sqlx::query(&format!(
            "
                INSERT INTO {table} (owner_id, {column}, date)
                VALUES ($1, $2, $3)
                ON CONFLICT DO NOTHING
            "
        ))
        .bind(like.owner_id.0)
        .bind(id)
        .bind(like.date)
        .execute(&mut *tx)
        .await
        .with_context(|| format!("inserting into {table} table"))?
        .rows_affected()
            > 0;
        if !inserted {
            return Ok(false);
        }
        let change = Change {
            table: changed,
            quote_id: Some(quote),
            user_id: Some(like.owner_id),
        };
        relay(&mut *tx, change).await?;
        tx.commit().await.context("committing like insertion")?;
        Ok(true)
    }

    async fn delete_like(&self, owner: UserId, target: LikeTarget) -> anyhow::Result<bool> {
        let (table, column, id, changed) = like_table(target);
        let mut tx = self.begin().await?;
        let deleted = sqlx::query(&format!(
            "DELETE FROM {table} WHERE owner_id = $1 AND {column} = $2"
        ))
        .bind(owner.0)
        .bind(id)
        .execute(&mut *tx)
        .await
        .with_context(|| format!("deleting from {table} table"))?
        .rows_affected()
            > 0;
        if !deleted {
            return Ok(false);
        }
        let change = Change {
            table: changed,
            quote_id: quote_of_target(&mut *tx, target).await?,
            user_id: Some(owner),
        };
        relay(&mut *tx, change).await?;
        tx.commit().await.context("committing like deletion")?;
        Ok(true)
    }

    async fn fetch_quote_edges_of(&self, owner: UserId) -> anyhow::Result<Vec<QuoteEdge>> {
        let mut res = Vec::new();
        for kind in [QuoteEdgeKind::Like, QuoteEdgeKind::Favorite] {
            let table = edge_table(kind);
            for r in sqlx::query(&format!(
                "
                    SELECT owner_id, quote_id, date, text, author, category
                        FROM {table}
                    WHERE owner_id = $1
                "
            ))
            .bind(owner.0)
            .fetch_all(&self.pool)
            .await
            .with_context(|| format!("querying {table} table"))?
            {
                res.push(quote_edge_from_row(kind, &r)?);
            }
        }
        res.sort_unstable_by_key(|e| (e.date, e.quote_id, e.kind));
        Ok(res)
    }

    async fn has_quote_edge(
        &self,
        kind: QuoteEdgeKind,
        owner: UserId,
        quote: QuoteId,
    ) -> anyhow::Result<bool> {
        let table = edge_table(kind);
        Ok(sqlx::query(&format!(
            "SELECT 1 FROM {table} WHERE owner_id = $1 AND quote_id = $2"
        ))
        .bind(owner.0)
        .bind(quote.0)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("querying {table} table"))?
        .is_some())
    }

    async fn count_quote_edges(&self, kind: QuoteEdgeKind, quote: QuoteId) -> anyhow::Result<u64> {
        let table = edge_table(kind);
        let count = sqlx::query(&format!(
            "SELECT COUNT(*) AS count FROM {table} WHERE quote_id = $1"
        ))
        .bind(quote.0)
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("counting {table} table"))?
        .try_get::<i64, _>("count")
        .context("retrieving the count field")?;
        Ok(count as u64)
    }

    async fn insert_quote_edge(&self, edge: QuoteEdge) -> anyhow::Result<bool> {
        let table = edge_table(edge.kind);
        let mut tx = self.begin().await?;
        let inserted = sqlx::query(&format!(
            "
                INSERT INTO {table} (owner_id, quote_id, date, text, author, category)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT DO NOTHING
            "
        ))
        .bind(edge.owner_id.0)
        .bind(edge.quote_id.0)
        .bind(edge.date)
        .bind(&edge.snapshot.text)
        .bind(&edge.snapshot.author)
        .bind(&edge.snapshot.category)
        .execute(&mut *tx)
        .await
        .with_context(|| format!("inserting into {table} table"))?
        .rows_affected()
            > 0;
        if !inserted {
            return Ok(false);
        }
        let change = Change {
            table: Table::QuoteEdges,
            quote_id: Some(edge.quote_id),
            user_id: Some(edge.owner_id),
        };
        relay(&mut *tx, change).await?;
        tx.commit().await.context("committing quote edge insertion")?;
        Ok(true)
    }

    async fn delete_quote_edge(
        &self,
        kind: QuoteEdgeKind,
        owner: UserId,
        quote: QuoteId,
    ) -> anyhow::Result<bool> {
        let table = edge_table(kind);
        let mut tx = self.begin().await?;
        let deleted = sqlx::query(&format!(
            "DELETE FROM {table} WHERE owner_id = $1 AND quote_id = $2"
        ))
        .bind(owner.0)
        .bind(quote.0)
        .execute(&mut *tx)
        .await
        .with_context(|| format!("deleting from {table} table"))?
        .rows_affected()
            > 0;
        if !deleted {
            return Ok(false);
        }
        let change = Change {
            table: Table::QuoteEdges,
            quote_id: Some(quote),
            user_id: Some(owner),
        };
        relay(&mut *tx, change).await?;
        tx.commit().await.context("committing quote edge deletion")?;
        Ok(true)
    }

    async fn insert_notification(&self, notif: Notification) -> anyhow::Result<()> {
        quill_api::validate_string(&notif.message)?;
        let mut tx = self.begin().await?;
        sqlx::query(
            "
                INSERT INTO notifications
                    (id, user_id, actor_id, kind, title, message, read, date, quote_id)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ",
        )
        .bind(notif.id.0)
        .bind(notif.user_id.0)
        .bind(notif.actor_id.0)
        .bind(kind_name(notif.kind))
        .bind(&notif.title)
        .bind(&notif.message)
        .bind(notif.read)
        .bind(notif.date)
        .bind(notif.quote_id.map(|q| q.0))
        .execute(&mut *tx)
        .await
        .with_context(|| format!("inserting notification {:?}", notif.id))?;
        let change = Change {
            table: Table::Notifications,
            quote_id: None,
            user_id: Some(notif.user_id),
        };
        relay(&mut *tx, change).await?;
        tx.commit().await.context("committing notification insertion")
    }

    async fn fetch_notifications(&self, user: UserId) -> anyhow::Result<Vec<Notification>> {
        sqlx::query(
            "
                SELECT id, user_id, actor_id, kind, title, message, read, date, quote_id
                    FROM notifications
                WHERE user_id = $1
                ORDER BY date DESC
            ",
        )
        .bind(user.0)
        .fetch_all(&self.pool)
        .await
        .context("querying notifications table")?
        .iter()
        .map(notification_from_row)
        .collect()
    }

    async fn mark_notification_read(
        &self,
        user: UserId,
        notif: NotificationId,
    ) -> anyhow::Result<bool> {
        let mut tx = self.begin().await?;
        let updated = sqlx::query(
            "UPDATE notifications SET read = true WHERE id = $1 AND user_id = $2",
        )
        .bind(notif.0)
        .bind(user.0)
        .execute(&mut *tx)
        .await
        .with_context(|| format!("marking notification {notif:?} as read"))?
        .rows_affected()
            > 0;
        if !updated {
            return Ok(false);
        }
        let change = Change {
            table: Table::Notifications,
            quote_id: None,
            user_id: Some(user),
        };
        relay(&mut *tx, change).await?;
        tx.commit().await.context("committing notification update")?;
        Ok(true)
    }

    async fn subscribe(&self, filter: ChangeFilter) -> anyhow::Result<ChangeStream> {
        let mut listener = sqlx::postgres::PgListener::connect_with(&self.pool)
            .await
            .context("connecting change listener")?;
        listener
            .listen(CHANGES_CHANNEL)
            .await
            .context("listening for changes")?;
        let (sender, receiver) = mpsc::unbounded();
        tokio::spawn(async move {
            let mut check = tokio::time::interval(FEED_CHECK_INTERVAL);
            loop {
                // the pending recv is kept across checks, so that no
                // notification is lost to a cancellation
                let recv = listener.recv();
                tokio::pin!(recv);
                let res = loop {
                    tokio::select! {
                        res = &mut recv => break res,
                        _ = check.tick() => {
                            if sender.is_closed() {
                                tracing::debug!(?filter, "change feed dropped, stopping listener");
                                return;
                            }
                        }
                    }
                };
                let notif = match res {
                    Ok(n) => n,
                    Err(err) => {
                        tracing::error!(?err, "change listener failed, closing feed");
                        return;
                    }
                };
                let change = match serde_json::from_str::<Change>(notif.payload()) {
                    Ok(c) => c,
                    Err(err) => {
                        tracing::warn!(?err, payload = notif.payload(), "ignoring unparseable change");
                        continue;
                    }
                };
                if filter.matches(&change) && sender.unbounded_send(change).is_err() {
                    tracing::debug!(?filter, "change feed dropped, stopping listener");
                    return;
                }
            }
        });
        Ok(receiver)
    }
}
