//! Trait surfaces the pipeline core is written against.
//!
//! The core never talks to a concrete database, queue or HTTP client. It
//! expresses every mutation as a conditional write through [`store`], every
//! dispatch through [`queue`], and every external call through
//! [`collaborators`].

pub mod collaborators;
pub mod queue;
pub mod store;

pub mod prelude {
    pub use super::collaborators::{
        ArtifactStore, Classification, CollaboratorFailure, ImageryFetcher,
        VisionClassifier,
    };
    pub use super::queue::{
        BatchSendFailure, BatchSendReport, QueueError, TileQueue,
    };
    pub use super::store::{
        ConditionalWrite, LockChange, RunCondition, RunStore, RunUpdate,
        StoreError, TileJobCondition, TileJobStore, TileJobUpdate,
    };
}
