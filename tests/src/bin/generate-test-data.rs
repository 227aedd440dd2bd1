use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};
use structopt::StructOpt;
use uuid::Uuid;

/// Print SQL seeding a quill database with random quotes and threads
#[derive(Debug, StructOpt)]
struct Opt {
    #[structopt(long, default_value = "5")]
    users: usize,

    #[structopt(long, default_value = "20")]
    quotes: usize,

    #[structopt(long, default_value = "4")]
    comments_per_quote: usize,

    #[structopt(long, default_value = "3")]
    replies_per_comment: usize,

    /// Number of like attempts per edge set, duplicates are dropped
    #[structopt(long, default_value = "200")]
    likes: usize,

    /// Seed for reproducible output
    #[structopt(long)]
    seed: Option<u64>,
}

const QUOTE_WORD_COUNT: usize = 12;
const COMMENT_WORD_COUNT: usize = 20;
const CATEGORIES: &[&str] = &["wisdom", "love", "life", "humor", "courage"];

fn gen_n_items(table: &str, n: usize, mut f: impl FnMut(usize) -> String) {
    if n == 0 {
        return;
    }
    println!("INSERT INTO {} VALUES", table);
    for i in 0..n {
        if i != 0 {
            println!(",");
        }
        print!("    {}", f(i));
    }
    println!();
    println!("ON CONFLICT DO NOTHING;");
}

fn sql_str(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

fn sql_date(d: DateTime<Utc>) -> String {
    format!("'{}'", d.to_rfc3339())
}

struct Row {
    id: Uuid,
    date: DateTime<Utc>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .init();
    let opt = Opt::from_args();
    anyhow::ensure!(opt.users > 0, "at least one user is needed to own the quotes");
    let mut rng = match opt.seed {
        Some(s) => StdRng::seed_from_u64(s),
        None => StdRng::from_entropy(),
    };
    tracing::info!(?opt, "generating test data");
    let start = Utc::now() - Duration::days(30);

    let users = (0..opt.users).map(|_| Uuid::new_v4()).collect::<Vec<_>>();
    gen_n_items("users (id, name)", users.len(), |i| {
        format!("('{}', {})", users[i], sql_str(&format!("user{}", i + 1)))
    });

    let mut quotes = Vec::new();
    gen_n_items(
        "quotes (id, owner_id, date, text, author, category, hidden)",
        opt.quotes,
        |_| {
            let id = Uuid::new_v4();
            let date = start + Duration::minutes(rng.gen_range(0..60 * 24 * 10));
            let text = lipsum::lipsum_words_with_rng(&mut rng, QUOTE_WORD_COUNT);
            let author = match rng.gen_bool(0.7) {
                true => sql_str(&lipsum::lipsum_title_with_rng(&mut rng)),
                false => String::from("NULL"),
            };
            let category = CATEGORIES.choose(&mut rng).copied().unwrap_or("life");
            let owner = users[rng.gen_range(0..users.len())];
            quotes.push((Row { id, date }, text.clone()));
            format!(
                "('{}', '{}', {}, {}, {}, {}, {})",
                id,
                owner,
                sql_date(date),
                sql_str(&text),
                author,
                sql_str(category),
                rng.gen_bool(0.05),
            )
        },
    );

    let mut comments = Vec::new();
    gen_n_items(
        "comments (id, quote_id, owner_id, date, text)",
        quotes.len() * opt.comments_per_quote,
        |i| {
            let quote = &quotes[i / opt.comments_per_quote].0;
            let id = Uuid::new_v4();
            let date = quote.date + Duration::minutes(rng.gen_range(1..60 * 24 * 5));
            comments.push(Row { id, date });
            format!(
                "('{}', '{}', '{}', {}, {})",
                id,
                quote.id,
                users[rng.gen_range(0..users.len())],
                sql_date(date),
                sql_str(&lipsum::lipsum_words_with_rng(&mut rng, COMMENT_WORD_COUNT)),
            )
        },
    );

    // Replies are generated oldest first per comment, so that each one can
    // only answer replies that already exist
    let mut replies: Vec<(Row, usize)> = Vec::new();
    gen_n_items(
        "replies (id, comment_id, parent_id, owner_id, date, text)",
        comments.len() * opt.replies_per_comment,
        |i| {
            let c = i / opt.replies_per_comment;
            let comment = &comments[c];
            let siblings = replies
                .iter()
                .filter(|(_, rc)| *rc == c)
                .map(|(r, _)| r)
                .collect::<Vec<_>>();
            let (parent, after) = match siblings.choose(&mut rng) {
                Some(p) if rng.gen_bool(0.5) => (format!("'{}'", p.id), p.date),
                _ => (String::from("NULL"), comment.date),
            };
            let latest = siblings.iter().map(|r| r.date).max().unwrap_or(after);
            let date = latest.max(after) + Duration::minutes(rng.gen_range(1..600));
            let id = Uuid::new_v4();
            let res = format!(
                "('{}', '{}', {}, '{}', {}, {})",
                id,
                comment.id,
                parent,
                users[rng.gen_range(0..users.len())],
                sql_date(date),
                sql_str(&lipsum::lipsum_words_with_rng(&mut rng, COMMENT_WORD_COUNT)),
            );
            replies.push((Row { id, date }, c));
            res
        },
    );

    let mut gen_edges = |targets: &[Uuid]| -> Vec<(Uuid, Uuid)> {
        if targets.is_empty() {
            return Vec::new();
        }
        let mut seen = HashSet::new();
        for _ in 0..opt.likes {
            let user = users[rng.gen_range(0..users.len())];
            let target = targets[rng.gen_range(0..targets.len())];
            seen.insert((user, target));
        }
        let mut res = seen.into_iter().collect::<Vec<_>>();
        res.sort_unstable();
        res
    };
    let comment_likes = gen_edges(&comments.iter().map(|c| c.id).collect::<Vec<_>>());
    let reply_likes = gen_edges(&replies.iter().map(|(r, _)| r.id).collect::<Vec<_>>());
    let quote_ids = quotes.iter().map(|(q, _)| q.id).collect::<Vec<_>>();
    let quote_likes = gen_edges(&quote_ids);
    let quote_favorites = gen_edges(&quote_ids);

    let now = sql_date(Utc::now());
    gen_n_items(
        "comment_likes (owner_id, comment_id, date)",
        comment_likes.len(),
        |i| format!("('{}', '{}', {})", comment_likes[i].0, comment_likes[i].1, now),
    );
    gen_n_items(
        "reply_likes (owner_id, reply_id, date)",
        reply_likes.len(),
        |i| format!("('{}', '{}', {})", reply_likes[i].0, reply_likes[i].1, now),
    );
    for (table, edges) in [
        ("quote_likes", &quote_likes),
        ("quote_favorites", &quote_favorites),
    ] {
        gen_n_items(
            &format!("{table} (owner_id, quote_id, date, text, author, category)"),
            edges.len(),
            |i| {
                let (user, quote) = edges[i];
                let text = quotes
                    .iter()
                    .find(|(q, _)| q.id == quote)
                    .map(|(_, t)| t.as_str())
                    .unwrap_or_default();
                format!("('{}', '{}', {}, {}, NULL, NULL)", user, quote, now, sql_str(text))
            },
        );
    }

    tracing::info!(
        users = users.len(),
        quotes = quotes.len(),
        comments = comments.len(),
        replies = replies.len(),
        "done"
    );
    Ok(())
}
