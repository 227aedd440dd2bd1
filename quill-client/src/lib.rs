mod config;
pub use config::Config;

#[cfg(test)]
mod fuzz;

mod interactions;
pub use interactions::{Interaction, InteractionChange, InteractionStore, Phase};

mod live;
pub use live::LiveThread;

mod mutator;
pub use mutator::{ThreadMutator, Toggled};

mod notify;
pub use notify::{DispatchOutcome, NotificationDispatcher};

mod optimistic;

mod repository;
pub use repository::ThreadRepository;

mod thread;
pub use thread::{Thread, ThreadComment, ThreadReply};

pub mod api {
    pub use quill_api::*;
}
