use std::collections::{HashMap, HashSet};

use crate::api::{
    count_by_target, Comment, CommentId, LikeEdge, LikeTarget, QuoteId, Reply, ReplyId, User,
    UserId,
};

/// The comment forest of a quote, as seen by one viewer at one point in time
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Thread {
    pub quote_id: QuoteId,

    /// Oldest first
    pub comments: Vec<ThreadComment>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ThreadComment {
    pub comment: Comment,
    pub author_name: Option<String>,
    pub like_count: u64,

    /// Always false for anonymous viewers
    pub viewer_liked: bool,

    /// Direct replies, oldest first
    pub replies: Vec<ThreadReply>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ThreadReply {
    pub reply: Reply,
    pub author_name: Option<String>,
    pub like_count: u64,
    pub viewer_liked: bool,

    /// Nested replies, oldest first
    pub replies: Vec<ThreadReply>,
}

impl ThreadComment {
    pub fn new(comment: Comment, author_name: Option<String>) -> ThreadComment {
        ThreadComment {
            comment,
            author_name,
            like_count: 0,
            viewer_liked: false,
            replies: Vec::new(),
        }
    }
}

impl ThreadReply {
    pub fn new(reply: Reply, author_name: Option<String>) -> ThreadReply {
        ThreadReply {
            reply,
            author_name,
            like_count: 0,
            viewer_liked: false,
            replies: Vec::new(),
        }
    }

    pub fn find_in<'a>(replies: &'a mut [ThreadReply], id: &ReplyId) -> Option<&'a mut ThreadReply> {
        for r in replies.iter_mut() {
            if r.reply.id == *id {
                return Some(r);
            }
            if let Some(res) = ThreadReply::find_in(&mut r.replies, id) {
                return Some(res);
            }
        }
        None
    }

    fn collect_ids(replies: &[ThreadReply], res: &mut Vec<ReplyId>) {
        for r in replies {
            res.push(r.reply.id);
            ThreadReply::collect_ids(&r.replies, res);
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
enum Parent {
    Comment(CommentId),
    Reply(ReplyId),
}

struct Annotations<'a> {
    counts: HashMap<LikeTarget, u64>,
    viewer_likes: HashSet<LikeTarget>,
    users: &'a HashMap<UserId, User>,
}

impl Annotations<'_> {
    fn author_name(&self, u: &UserId) -> Option<String> {
        self.users.get(u).map(|u| u.name.clone())
    }

    fn reply(&self, reply: Reply, replies: Vec<ThreadReply>) -> ThreadReply {
        let target = LikeTarget::Reply(reply.id);
        ThreadReply {
            author_name: self.author_name(&reply.owner_id),
            like_count: self.counts.get(&target).copied().unwrap_or(0),
            viewer_liked: self.viewer_likes.contains(&target),
            reply,
            replies,
        }
    }
}

fn build_replies(
    parent: Parent,
    children: &mut HashMap<Parent, Vec<Reply>>,
    ann: &Annotations,
) -> Vec<ThreadReply> {
    children
        .remove(&parent)
        .unwrap_or_default()
        .into_iter()
        .map(|r| {
            let nested = build_replies(Parent::Reply(r.id), children, ann);
            ann.reply(r, nested)
        })
        .collect()
}

impl Thread {
    pub fn empty(quote_id: QuoteId) -> Thread {
        Thread {
            quote_id,
            comments: Vec::new(),
        }
    }

    /// Merges separately fetched rows into one thread
    ///
    /// Rows may come in any order. Replies whose parent reply is missing or
    /// belongs to another comment are shown directly under their comment.
    pub fn build(
        quote_id: QuoteId,
        mut comments: Vec<Comment>,
        mut replies: Vec<Reply>,
        likes: &[LikeEdge],
        users: &HashMap<UserId, User>,
        viewer: Option<UserId>,
    ) -> Thread {
        comments.retain(|c| c.quote_id == quote_id);
        comments.sort_unstable_by_key(|c| (c.date, c.id));
        let comment_ids = comments.iter().map(|c| c.id).collect::<HashSet<_>>();
        replies.retain(|r| comment_ids.contains(&r.comment_id));
        replies.sort_unstable_by_key(|r| (r.date, r.id));

        let targets = comments
            .iter()
            .map(|c| LikeTarget::Comment(c.id))
            .chain(replies.iter().map(|r| LikeTarget::Reply(r.id)))
            .collect::<Vec<_>>();
        let ann = Annotations {
            counts: count_by_target(&targets, likes),
            viewer_likes: likes
                .iter()
                .filter(|l| Some(l.owner_id) == viewer)
                .map(|l| l.target)
                .collect(),
            users,
        };

        let reply_comment = replies
            .iter()
            .map(|r| (r.id, r.comment_id))
            .collect::<HashMap<_, _>>();
        let num_replies = replies.len();
        let mut children: HashMap<Parent, Vec<Reply>> = HashMap::new();
        for r in replies {
            let parent = match r.parent_id {
                None => Parent::Comment(r.comment_id),
                Some(p) if reply_comment.get(&p) == Some(&r.comment_id) => Parent::Reply(p),
                Some(p) => {
                    tracing::warn!(reply=?r.id, parent=?p, "reply parent is not in the same comment");
                    Parent::Comment(r.comment_id)
                }
            };
            children.entry(parent).or_insert_with(Vec::new).push(r);
        }

        let comments = comments
            .into_iter()
            .map(|c| {
                let target = LikeTarget::Comment(c.id);
                ThreadComment {
                    author_name: ann.author_name(&c.owner_id),
                    like_count: ann.counts.get(&target).copied().unwrap_or(0),
                    viewer_liked: ann.viewer_likes.contains(&target),
                    replies: build_replies(Parent::Comment(c.id), &mut children, &ann),
                    comment: c,
                }
            })
            .collect::<Vec<_>>();

        let thread = Thread { quote_id, comments };
        let placed = thread.num_replies();
        if placed != num_replies {
            // only reply cycles can end up here
            tracing::warn!(
                quote=?quote_id,
                dropped = num_replies - placed,
                "some replies could not be attached to the thread"
            );
        }
        thread
    }

    pub fn comment_ids(&self) -> Vec<CommentId> {
        self.comments.iter().map(|c| c.comment.id).collect()
    }

    /// Ids of all the replies under this comment, depth-first
    pub fn reply_ids(&self, comment: &CommentId) -> Vec<ReplyId> {
        let mut res = Vec::new();
        if let Some(c) = self.comments.iter().find(|c| c.comment.id == *comment) {
            ThreadReply::collect_ids(&c.replies, &mut res);
        }
        res
    }

    pub fn num_replies(&self) -> usize {
        self.comments
            .iter()
            .map(|c| {
                let mut ids = Vec::new();
                ThreadReply::collect_ids(&c.replies, &mut ids);
                ids.len()
            })
            .sum()
    }

    pub fn comment(&self, id: &CommentId) -> Option<&ThreadComment> {
        self.comments.iter().find(|c| c.comment.id == *id)
    }

    pub fn reply(&self, id: &ReplyId) -> Option<&ThreadReply> {
        fn find<'a>(replies: &'a [ThreadReply], id: &ReplyId) -> Option<&'a ThreadReply> {
            replies
                .iter()
                .find_map(|r| (r.reply.id == *id).then_some(r).or_else(|| find(&r.replies, id)))
        }
        self.comments.iter().find_map(|c| find(&c.replies, id))
    }

    /// Returns whether the viewer likes this target, and its like count
    pub fn like_state(&self, target: &LikeTarget) -> Option<(bool, u64)> {
        match target {
            LikeTarget::Comment(id) => self.comment(id).map(|c| (c.viewer_liked, c.like_count)),
            LikeTarget::Reply(id) => self.reply(id).map(|r| (r.viewer_liked, r.like_count)),
        }
    }

    /// Overwrites the like state of this target, returning false if it is not
    /// in this thread
    pub fn set_like_state(&mut self, target: &LikeTarget, liked: bool, count: u64) -> bool {
        let (viewer_liked, like_count) = match target {
            LikeTarget::Comment(id) => {
                match self.comments.iter_mut().find(|c| c.comment.id == *id) {
                    None => return false,
                    Some(c) => (&mut c.viewer_liked, &mut c.like_count),
                }
            }
            LikeTarget::Reply(id) => match self
                .comments
                .iter_mut()
                .find_map(|c| ThreadReply::find_in(&mut c.replies, id))
            {
                None => return false,
                Some(r) => (&mut r.viewer_liked, &mut r.like_count),
            },
        };
        *viewer_liked = liked;
        *like_count = count;
        true
    }
}
