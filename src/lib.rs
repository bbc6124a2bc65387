pub mod core;
pub mod dispatch;
pub mod features;
pub mod portal;
pub mod session;
pub mod sources;

// --- Primary core exports ---
pub use core::config::{load_warden_config, Settings, WardenConfig};
pub use core::types;
pub use core::AppState;

// --- Frequently-used domain types ---
pub use dispatch::{Blacklist, Dispatcher, RunState, TaskRecord, TaskState, TaskTracker};
pub use features::{blob_store, metrics, session_store};
pub use portal::probe::ProbeOutcome;
pub use portal::submit::SubmitOutcome;
pub use sources::SourceKind;
