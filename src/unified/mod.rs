//! Identity-keyed queries that do not care whether a client is online.

pub mod stream_cache;
pub mod view;

pub use stream_cache::{OfflineSkipMode, UnifiedClientRef, UnifiedStreamCache};
pub use view::{ClientSummary, ClientType, UnifiedClientView};
