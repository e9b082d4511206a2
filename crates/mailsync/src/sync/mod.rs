//! Sync engine: fetch, upsert, checkpoint

mod cancel;
mod engine;
mod events;
mod progress;
mod retry;
mod timing;
mod upsert;

pub use cancel::CancelToken;
pub use engine::SyncEngine;
pub use events::{ChannelEventSink, CompletionEvent, EventSink, LogEventSink};
pub use progress::{ProgressHandle, RunProgress};
pub use retry::{RetryError, RetryPolicy};
pub use timing::{is_eligible, is_stale, staleness_order};
pub use upsert::{ApplyReport, MAX_EXTERNAL_ID_LEN, PreparedBatch, Upserter};
