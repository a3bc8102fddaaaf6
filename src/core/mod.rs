pub mod engine;
pub mod executor;
pub mod filter;
pub mod observer;

pub use engine::{SyncOrchestrator, SyncPhase, SyncStatus};
pub use executor::{
    FolderNode, RemoteFolder, SizeEstimate, TransferExecutor, TransferHandle, TransferRequest,
    TransferResult,
};
pub use filter::{compile_filters, FilterAction, FilterRule};
pub use observer::{
    ChannelObserver, LargeSyncWarning, NoopObserver, SyncEvent, SyncObserver, WarningKind,
};
