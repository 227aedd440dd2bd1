use std::{collections::HashMap, sync::Arc};

use anyhow::Context;
use futures::{channel::mpsc, future};
use parking_lot::Mutex;

use crate::{
    api::{Db, Error, QuoteEdgeKind, QuoteId, UserId},
    optimistic::Overlay,
    Config, ThreadMutator,
};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Phase {
    Unknown,
    Loaded,
    /// Shown values include changes the server did not confirm yet
    Mutating,
    /// The last change was refused, values are back to before it
    RolledBack,
}

/// What one viewer sees of their interactions with one quote
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Interaction {
    pub is_liked: bool,
    pub is_favorited: bool,
    pub like_count: u64,
    pub favorite_count: u64,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InteractionChange {
    pub quote_id: QuoteId,
    pub phase: Phase,
    pub interaction: Interaction,
}

struct Entry {
    phase: Phase,
    like: Overlay,
    favorite: Overlay,
}

impl Entry {
    fn new() -> Entry {
        Entry {
            phase: Phase::Unknown,
            like: Overlay::new(false, 0),
            favorite: Overlay::new(false, 0),
        }
    }

    fn overlay(&mut self, kind: QuoteEdgeKind) -> &mut Overlay {
        match kind {
            QuoteEdgeKind::Like => &mut self.like,
            QuoteEdgeKind::Favorite => &mut self.favorite,
        }
    }

    fn settled_phase(&self) -> Phase {
        match self.like.is_pending() || self.favorite.is_pending() {
            true => Phase::Mutating,
            false => Phase::Loaded,
        }
    }

    fn interaction(&self) -> Interaction {
        Interaction {
            is_liked: self.like.active(),
            is_favorited: self.favorite.active(),
            like_count: self.like.count(),
            favorite_count: self.favorite.count(),
        }
    }
}

struct State {
    viewer: Option<UserId>,
    entries: HashMap<QuoteId, Entry>,
    next_op: u64,
    observers: Vec<mpsc::UnboundedSender<InteractionChange>>,
}

impl State {
    fn emit(&mut self, quote: QuoteId) {
        let Some(entry) = self.entries.get(&quote) else {
            return;
        };
        let change = InteractionChange {
            quote_id: quote,
            phase: entry.phase,
            interaction: entry.interaction(),
        };
        tracing::trace!(?change, "interaction changed");
        self.observers
            .retain(|o| matches!(o.unbounded_send(change.clone()), Ok(())));
    }

    fn reload(&mut self, quote: QuoteId, liked: bool, favorited: bool, counts: (u64, u64)) {
        let entry = self.entries.entry(quote).or_insert_with(Entry::new);
        entry.like.reload(liked, counts.0);
        entry.favorite.reload(favorited, counts.1);
        entry.phase = entry.settled_phase();
        self.emit(quote);
    }
}

/// Per-quote like and favorite state of the signed-in viewer, updated
/// optimistically on toggles
///
/// This is a cache: the persisted edges are the source of truth.
pub struct InteractionStore {
    db: Arc<dyn Db>,
    mutator: Arc<ThreadMutator>,
    config: Config,
    state: Mutex<State>,
}

impl InteractionStore {
    pub fn new(db: Arc<dyn Db>, mutator: Arc<ThreadMutator>, config: Config) -> InteractionStore {
        InteractionStore {
            db,
            mutator,
            config,
            state: Mutex::new(State {
                viewer: None,
                entries: HashMap::new(),
                next_op: 0,
                observers: Vec::new(),
            }),
        }
    }

    pub fn viewer(&self) -> Option<UserId> {
        self.state.lock().viewer
    }

    /// Returns the quotes already known for this viewer
    fn switch_viewer(&self, viewer: Option<UserId>) -> Vec<QuoteId> {
        let mut state = self.state.lock();
        if state.viewer != viewer {
            tracing::debug!(old=?state.viewer, new=?viewer, "viewer changed, forgetting interactions");
            state.viewer = viewer;
            state.entries.clear();
        }
        state.entries.keys().copied().collect()
    }

    async fn counts(&self, quote: QuoteId) -> anyhow::Result<(QuoteId, (u64, u64))> {
        let counts = futures::try_join!(
            self.db.count_quote_edges(QuoteEdgeKind::Like, quote),
            self.db.count_quote_edges(QuoteEdgeKind::Favorite, quote),
        )
        .with_context(|| format!("counting edges of quote {quote:?}"))?;
        Ok((quote, counts))
    }

    /// Loads all the likes and favorites of `viewer` in one go, and refreshes
    /// the quotes already known
    pub async fn load_user_interactions(&self, viewer: Option<UserId>) -> Result<(), Error> {
        let known = self.switch_viewer(viewer);
        let edges = match viewer {
            None => Vec::new(),
            Some(v) => self
                .db
                .fetch_quote_edges_of(v)
                .await
                .with_context(|| format!("fetching quote edges of {v:?}"))
                .map_err(Error::persistence)?,
        };

        // liking and favoriting are independent, one edge must not reset
        // the other flag
        let mut flags = known
            .into_iter()
            .map(|q| (q, (false, false)))
            .collect::<HashMap<_, _>>();
        for e in edges {
            let f = flags.entry(e.quote_id).or_default();
            match e.kind {
                QuoteEdgeKind::Like => f.0 = true,
                QuoteEdgeKind::Favorite => f.1 = true,
            }
        }
        let counts = future::try_join_all(flags.keys().map(|q| self.counts(*q)))
            .await
            .map_err(Error::persistence)?;

        let mut state = self.state.lock();
        if state.viewer != viewer {
            tracing::debug!(?viewer, "viewer changed while loading interactions, discarding");
            return Ok(());
        }
        for (quote, counts) in counts {
            let (liked, favorited) = flags.get(&quote).copied().unwrap_or_default();
            state.reload(quote, liked, favorited, counts);
        }
        tracing::debug!(?viewer, num_quotes = flags.len(), "loaded interactions");
        Ok(())
    }

    /// Refreshes the state of one quote from the server
    pub async fn load_quote(
        &self,
        quote: QuoteId,
        viewer: Option<UserId>,
    ) -> Result<Interaction, Error> {
        self.switch_viewer(viewer);
        let (liked, favorited) = match viewer {
            None => (false, false),
            Some(v) => futures::try_join!(
                self.db.has_quote_edge(QuoteEdgeKind::Like, v, quote),
                self.db.has_quote_edge(QuoteEdgeKind::Favorite, v, quote),
            )
            .with_context(|| format!("fetching edges of {v:?} on quote {quote:?}"))
            .map_err(Error::persistence)?,
        };
        let (_, counts) = self.counts(quote).await.map_err(Error::persistence)?;

        let mut state = self.state.lock();
        if state.viewer != viewer {
            return Err(Error::NotSignedIn);
        }
        state.reload(quote, liked, favorited, counts);
        Ok(state
            .entries
            .get(&quote)
            .map(Entry::interaction)
            .unwrap_or_default())
    }

    pub fn get(&self, quote: QuoteId) -> Option<Interaction> {
        self.state.lock().entries.get(&quote).map(Entry::interaction)
    }

    pub fn phase(&self, quote: QuoteId) -> Phase {
        self.state
            .lock()
            .entries
            .get(&quote)
            .map(|e| e.phase)
            .unwrap_or(Phase::Unknown)
    }

    /// Receives every transition of every quote from now on
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<InteractionChange> {
        let (sender, receiver) = mpsc::unbounded();
        self.state.lock().observers.push(sender);
        receiver
    }

    pub async fn toggle_like(&self, quote: QuoteId) -> Result<Interaction, Error> {
        self.toggle(QuoteEdgeKind::Like, quote).await
    }

    pub async fn toggle_favorite(&self, quote: QuoteId) -> Result<Interaction, Error> {
        self.toggle(QuoteEdgeKind::Favorite, quote).await
    }

    /// Shows the toggle at once, then either confirms it or reverts it
    ///
    /// On error, the value shown is back to what it was before the call.
    async fn toggle(&self, kind: QuoteEdgeKind, quote: QuoteId) -> Result<Interaction, Error> {
        let viewer = self.viewer().ok_or(Error::NotSignedIn)?;
        if self.phase(quote) == Phase::Unknown {
            self.load_quote(quote, Some(viewer)).await?;
        }

        let (op, target) = {
            let mut state = self.state.lock();
            if state.viewer != Some(viewer) {
                return Err(Error::NotSignedIn);
            }
            state.next_op += 1;
            let op = state.next_op;
            let entry = state.entries.entry(quote).or_insert_with(Entry::new);
            let target = entry.overlay(kind).push(op);
            entry.phase = Phase::Mutating;
            state.emit(quote);
            (op, target)
        };
        tracing::debug!(?kind, ?quote, ?viewer, target, "optimistically toggled");

        // nothing awaits between the push above and the mutator queueing on
        // the edge, so writes apply in the order of the pushes
        let res = tokio::time::timeout(
            self.config.mutation_timeout,
            self.mutator.set_quote_edge(kind, quote, viewer, target),
        )
        .await
        .unwrap_or(Err(Error::Timeout));

        let mut state = self.state.lock();
        let stale = state.viewer != Some(viewer);
        let Some(entry) = state.entries.get_mut(&quote).filter(|_| !stale) else {
            // signed out meanwhile, the result is no longer shown to anyone
            return res.map(|t| Interaction {
                is_liked: kind == QuoteEdgeKind::Like && t.active,
                is_favorited: kind == QuoteEdgeKind::Favorite && t.active,
                ..Interaction::default()
            });
        };
        match res {
            Ok(toggled) => {
                entry.overlay(kind).confirm(op, toggled.active, toggled.count);
                entry.phase = entry.settled_phase();
                let res = entry.interaction();
                state.emit(quote);
                Ok(res)
            }
            Err(err) => {
                tracing::warn!(?kind, ?quote, ?viewer, %err, "toggle failed, rolling back");
                entry.overlay(kind).roll_back(op);
                entry.phase = Phase::RolledBack;
                state.emit(quote);
                if let Some(entry) = state.entries.get_mut(&quote) {
                    entry.phase = entry.settled_phase();
                }
                state.emit(quote);
                Err(err)
            }
        }
    }
}
