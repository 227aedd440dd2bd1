#![cfg(test)]

use std::{
    collections::{HashSet, VecDeque},
    panic::AssertUnwindSafe,
    sync::Arc,
};

use quill_mock_server::MockServer;

use crate::{
    api::{Comment, Db, LikeTarget, Quote, QuoteId, Reply, UserId},
    optimistic::Overlay,
    Config, ThreadMutator, ThreadRepository,
};

macro_rules! do_tokio_test {
    ( $name:ident, $typ:ty, $fn:expr ) => {
        #[test]
        fn $name() {
            if std::env::var("RUST_LOG").is_ok() {
                let _ = tracing_subscriber::fmt::try_init();
            }
            let runtime = AssertUnwindSafe(
                tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .expect("failed initializing tokio runtime"),
            );
            bolero::check!()
                .with_type::<$typ>()
                .cloned()
                .for_each(move |v| {
                    let () = runtime.block_on($fn(v));
                })
        }
    };
}

struct Setup {
    db: Arc<MockServer>,
    quote: QuoteId,
    actors: Vec<UserId>,
    targets: Vec<LikeTarget>,
}

async fn setup() -> Setup {
    let db = Arc::new(MockServer::new());
    let actors = (0..3).map(|_| UserId::new()).collect::<Vec<_>>();
    let quote = Quote::now(actors[0], String::from("Memento mori"));
    let comment = Comment::now(quote.id, actors[0], String::from("grim"));
    let reply = Reply::now(comment.id, None, actors[1], String::from("but true"));
    let quote_id = quote.id;
    db.insert_quote(quote).await.unwrap();
    db.insert_comment(comment.clone()).await.unwrap();
    db.insert_reply(reply.clone()).await.unwrap();
    Setup {
        db,
        quote: quote_id,
        actors,
        targets: vec![LikeTarget::Comment(comment.id), LikeTarget::Reply(reply.id)],
    }
}

do_tokio_test!(
    fuzz_like_toggles_match_edge_set,
    Vec<(u8, u8)>,
    |ops: Vec<(u8, u8)>| async move {
        let s = setup().await;
        let mutator = ThreadMutator::new(s.db.clone(), Config::default());
        let mut model = HashSet::new();
        for (actor, target) in ops {
            let actor = s.actors[actor as usize % s.actors.len()];
            let target = s.targets[target as usize % s.targets.len()];
            let liked = !model.remove(&(actor, target));
            if liked {
                model.insert((actor, target));
            }
            let expected_count = model.iter().filter(|(_, t)| *t == target).count() as u64;
            let res = mutator.toggle_like(target, actor).await.unwrap();
            assert_eq!(res.active, liked);
            assert_eq!(res.count, Some(expected_count));
        }

        let repo = ThreadRepository::new(s.db.clone(), Config::default());
        for actor in &s.actors {
            let thread = repo.load_thread(s.quote, Some(*actor)).await.unwrap();
            for target in &s.targets {
                let count = model.iter().filter(|(_, t)| t == target).count() as u64;
                let liked = model.contains(&(*actor, *target));
                assert_eq!(thread.like_state(target), Some((liked, count)));
                assert_eq!(s.db.count_likes(*target).await.unwrap(), count);
            }
        }
    }
);

do_tokio_test!(
    fuzz_even_toggles_restore_state,
    (u8, u8, Vec<u8>),
    |(actor, repeats, noise): (u8, u8, Vec<u8>)| async move {
        let s = setup().await;
        let mutator = ThreadMutator::new(s.db.clone(), Config::default());
        // other actors' likes must not be affected by the repetition
        for (i, n) in noise.iter().enumerate().take(8) {
            let other = s.actors[1 + (*n as usize) % 2];
            mutator.toggle_like(s.targets[i % 2], other).await.unwrap();
        }
        let actor = s.actors[actor as usize % s.actors.len()];
        let target = s.targets[0];
        let before = s.db.test_likes_on(target).len() as u64;
        let was_liked = s
            .db
            .test_likes_on(target)
            .iter()
            .any(|l| l.owner_id == actor);

        let repeats = repeats % 8;
        for _ in 0..repeats {
            mutator.toggle_like(target, actor).await.unwrap();
        }
        let is_liked = s
            .db
            .test_likes_on(target)
            .iter()
            .any(|l| l.owner_id == actor);
        let after = s.db.test_likes_on(target).len() as u64;
        if repeats % 2 == 0 {
            assert_eq!((is_liked, after), (was_liked, before));
        } else {
            assert_eq!(is_liked, !was_liked);
            assert_eq!(after, if was_liked { before - 1 } else { before + 1 });
        }
    }
);

#[test]
fn fuzz_overlay_converges_to_server() {
    bolero::check!()
        .with_type::<(bool, u8, Vec<u8>)>()
        .cloned()
        .for_each(|(liked, others, ops)| {
            let others = u64::from(others % 8);
            let mut server = liked;
            let mut o = Overlay::new(server, others + u64::from(server));
            let mut in_flight = VecDeque::new();
            for (op, action) in ops.into_iter().enumerate() {
                let op = op as u64;
                match action % 4 {
                    0 => {
                        let target = o.push(op);
                        in_flight.push_back((op, target));
                    }
                    1 => {
                        if let Some((op, target)) = in_flight.pop_front() {
                            server = target;
                            o.confirm(op, server, Some(others + u64::from(server)));
                        }
                    }
                    2 => {
                        if let Some((op, _)) = in_flight.pop_back() {
                            o.roll_back(op);
                        }
                    }
                    _ => o.reload(server, others + u64::from(server)),
                }
                assert_eq!(o.count(), others + u64::from(o.active()));
                if in_flight.is_empty() {
                    assert!(!o.is_pending());
                    assert_eq!(o.active(), server);
                }
            }
        })
}
