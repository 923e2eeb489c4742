//! Process-wide sync services and the flows built on them.

mod dedup;
mod flags;
mod history;
mod pubsub;
mod sequence;
mod service;
mod state;

pub use flags::{FlagRequest, FullSyncFlag};
pub use history::PurgeEntry;
pub use service::{
    error_frame, Mutation, MutationAction, PurgeRequest, ResetRequest, RestoreRequest, Submission, SyncService,
};
