#![cfg(test)]

use std::{panic::AssertUnwindSafe, path::Path, sync::Arc, time::Duration};

use futures::StreamExt;
use quill_api::{
    ChangeFilter, Comment, Db, LikeEdge, LikeTarget, Notification, NotificationKind, Quote,
    QuoteEdge, QuoteEdgeKind, QuoteId, Reply, Table, User, UserId,
};
use quill_client::{Config, ThreadMutator, ThreadRepository};

use crate::{create_sqlx_pool, PgDb, MIGRATOR};

fn build_pg_cluster(data: &Path) -> Option<postgresfixture::cluster::Cluster> {
    let mut runtime = None;
    let mut best_version = None;
    for r in postgresfixture::runtime::Runtime::find_on_path() {
        if let Ok(v) = r.version() {
            match (&mut runtime, &mut best_version) {
                (None, None) => {
                    runtime = Some(r);
                    best_version = Some(v);
                }
                (Some(runtime), Some(best_version)) => {
                    if *best_version < v {
                        *runtime = r;
                        *best_version = v;
                    }
                }
                _ => unreachable!(),
            }
        }
    }
    Some(postgresfixture::cluster::Cluster::new(data, runtime?))
}

macro_rules! do_pg_test {
    ( $name:ident, $fn:expr ) => {
        #[test]
        fn $name() {
            if std::env::var("RUST_LOG").is_ok() {
                let _ = tracing_subscriber::fmt::try_init();
            }
            let lockfile = tempfile::tempfile().expect("creating tempfile");
            let datadir = tempfile::tempdir().expect("creating tempdir");
            let datadir_path: &Path = datadir.as_ref();
            let Some(cluster) = build_pg_cluster(datadir_path) else {
                eprintln!("postgresql is not installed in path, skipping {}", stringify!($name));
                return;
            };
            let datadir_path: &str = datadir_path.to_str().expect("tempdir is not valid utf8");
            postgresfixture::coordinate::run_and_destroy(&cluster, lockfile.into(), || {
                cluster.createdb("test_db").expect("creating test_db database");
                let runtime = AssertUnwindSafe(
                    tokio::runtime::Builder::new_current_thread()
                        .enable_all()
                        .build()
                        .expect("failed initializing tokio runtime"),
                );
                runtime.block_on(async move {
                    let pool = create_sqlx_pool(&format!(
                        "postgresql://?host={}&dbname=test_db",
                        datadir_path
                    ))
                    .await
                    .expect("creating sqlx pool");
                    MIGRATOR
                        .run(&pool)
                        .await
                        .expect("failed applying migrations");
                    let () = $fn(Arc::new(PgDb::new(pool.clone()))).await;
                    sqlx::query(include_str!("../reset-test-db.sql"))
                        .execute(&pool)
                        .await
                        .expect("failed cleaning up database");
                })
            })
            .expect("coordinating spinup and shutdown of the pg cluster");
        }
    };
}

async fn quote_with_comment(db: &PgDb) -> (Quote, Comment) {
    let quote = Quote::now(UserId::new(), String::from("Cogito ergo sum"));
    let comment = Comment::now(quote.id, UserId::new(), String::from("am I though"));
    db.insert_quote(quote.clone()).await.unwrap();
    db.insert_comment(comment.clone()).await.unwrap();
    (quote, comment)
}

do_pg_test!(edges_are_unique, |db: Arc<PgDb>| async move {
    let (quote, comment) = quote_with_comment(&db).await;
    let user = UserId::new();
    let target = LikeTarget::Comment(comment.id);
    assert!(db.insert_like(LikeEdge::now(user, target)).await.unwrap());
    assert!(!db.insert_like(LikeEdge::now(user, target)).await.unwrap());
    assert_eq!(db.count_likes(target).await.unwrap(), 1);
    assert!(db.delete_like(user, target).await.unwrap());
    assert!(!db.delete_like(user, target).await.unwrap());

    let edge = QuoteEdge::now(QuoteEdgeKind::Favorite, user, &quote);
    assert!(db.insert_quote_edge(edge.clone()).await.unwrap());
    assert!(!db.insert_quote_edge(edge).await.unwrap());
    assert_eq!(
        db.count_quote_edges(QuoteEdgeKind::Favorite, quote.id)
            .await
            .unwrap(),
        1
    );
    assert_eq!(
        db.count_quote_edges(QuoteEdgeKind::Like, quote.id)
            .await
            .unwrap(),
        0
    );
    let edges = db.fetch_quote_edges_of(user).await.unwrap();
    assert_eq!(edges.len(), 1);
    assert_eq!(edges[0].snapshot.text, quote.text);
});

do_pg_test!(orphans_are_refused, |db: Arc<PgDb>| async move {
    let (_, comment) = quote_with_comment(&db).await;
    let reply = Reply::now(comment.id, None, UserId::new(), String::from("hi"));
    db.insert_reply(reply.clone()).await.unwrap();
    let mut orphan = Reply::now(comment.id, None, UserId::new(), String::from("hi"));
    orphan.parent_id = Some(quill_api::ReplyId(quill_api::Uuid::new_v4()));
    assert!(db.insert_reply(orphan).await.is_err());
    let stray = LikeEdge::now(
        UserId::new(),
        LikeTarget::Reply(quill_api::ReplyId(quill_api::Uuid::new_v4())),
    );
    assert!(db.insert_like(stray).await.is_err());
    let replies = db.fetch_replies(&[comment.id]).await.unwrap();
    assert_eq!(
        replies.iter().map(|r| r.id).collect::<Vec<_>>(),
        vec![reply.id]
    );
});

do_pg_test!(writes_bump_revision_and_notify, |db: Arc<PgDb>| async move {
    let (quote, comment) = quote_with_comment(&db).await;
    let mut feed = db.subscribe(ChangeFilter::Quote(quote.id)).await.unwrap();
    let before = db.revision(quote.id).await.unwrap();
    db.insert_like(LikeEdge::now(UserId::new(), LikeTarget::Comment(comment.id)))
        .await
        .unwrap();
    assert_eq!(db.revision(quote.id).await.unwrap(), before + 1);
    let change = tokio::time::timeout(Duration::from_secs(5), feed.next())
        .await
        .expect("no change notification received")
        .unwrap();
    assert_eq!(change.table, Table::CommentLikes);
    assert_eq!(change.quote_id, Some(quote.id));
});

async fn num_listeners(pool: &sqlx::PgPool) -> i64 {
    sqlx::query_scalar::<_, i64>(
        "SELECT count(*) FROM pg_stat_activity
            WHERE datname = current_database() AND query LIKE 'LISTEN%'",
    )
    .fetch_one(pool)
    .await
    .unwrap()
}

do_pg_test!(dropped_feeds_release_their_listener, |db: Arc<PgDb>| async move {
    let feed = db
        .subscribe(ChangeFilter::Quote(QuoteId(quill_api::Uuid::new_v4())))
        .await
        .unwrap();
    assert_eq!(num_listeners(&db.pool).await, 1);
    drop(feed);
    let released = tokio::time::timeout(Duration::from_secs(10), async {
        while num_listeners(&db.pool).await != 0 {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await;
    assert!(released.is_ok(), "listener still running after its feed was dropped");
});

do_pg_test!(threads_load_from_postgres, |db: Arc<PgDb>| async move {
    let (u2, u3) = (UserId::new(), UserId::new());
    for (id, name) in [(u2, "u2"), (u3, "u3")] {
        db.insert_user(User {
            id,
            name: String::from(name),
        })
        .await
        .unwrap();
    }
    let (quote, comment) = quote_with_comment(&db).await;
    let config = Config::default();
    let mutator = ThreadMutator::new(db.clone(), config.clone());
    let top = mutator
        .add_reply(comment.id, u2, "Great point", None)
        .await
        .unwrap();
    let nested = mutator
        .add_reply(comment.id, u3, "Agreed", Some(top.reply.id))
        .await
        .unwrap();
    mutator
        .toggle_like(LikeTarget::Reply(nested.reply.id), u2)
        .await
        .unwrap();

    let repo = ThreadRepository::new(db.clone(), config);
    let thread = repo.load_thread(quote.id, Some(u2)).await.unwrap();
    assert_eq!(thread.reply_ids(&comment.id), vec![top.reply.id, nested.reply.id]);
    let nested_node = thread.reply(&nested.reply.id).unwrap();
    assert_eq!(nested_node.reply.text, "@u2 Agreed");
    assert_eq!(nested_node.author_name.as_deref(), Some("u3"));
    assert_eq!(
        thread.like_state(&LikeTarget::Reply(nested.reply.id)),
        Some((true, 1))
    );
});

do_pg_test!(notifications_are_read_by_recipient, |db: Arc<PgDb>| async move {
    let (owner, actor) = (UserId::new(), UserId::new());
    let notif = Notification::now(
        owner,
        actor,
        NotificationKind::Comment,
        String::from("someone commented"),
        None,
    );
    db.insert_notification(notif.clone()).await.unwrap();
    assert!(!db.mark_notification_read(actor, notif.id).await.unwrap());
    assert!(db.mark_notification_read(owner, notif.id).await.unwrap());
    let fetched = db.fetch_notifications(owner).await.unwrap();
    assert_eq!(fetched.len(), 1);
    assert!(fetched[0].read);
    assert_eq!(fetched[0].kind, NotificationKind::Comment);
    assert_eq!(fetched[0].title, "New comment");
});
