mod account;
mod checkpoint;
mod record;
mod sync_run;

pub use account::{Account, AccountId};
pub use checkpoint::Checkpoint;
pub use record::{ExternalId, RawRecord, Record};
pub use sync_run::{MAX_RECORDED_FAILURES, RecordFailure, RunId, RunOutcome, StopReason, SyncRun};
