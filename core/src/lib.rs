pub mod backoff;
pub mod cleaning;
pub mod completion;
pub mod config;
pub mod enrichment;
pub mod error;
pub mod locks;
pub mod matcher;
pub mod models;
pub mod queue;
pub mod reference;
pub mod remote;
pub mod shortcuts;
pub mod store;
pub mod sync;

pub use enrichment::{EnrichmentCoordinator, EnrichmentProgress, EnrichmentState};
pub use matcher::MatchEngine;
pub use store::{LocalStore, SharedStore};
pub use sync::{DeleteOutcome, SyncCoordinator, SyncSnapshot, SyncWorker};
