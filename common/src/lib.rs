pub mod bytes;
pub mod serde;
pub mod storage;

pub use bytes::BytesRange;
pub use storage::config::StorageConfig;
pub use storage::factory::{StorageSemantics, create_storage};
pub use storage::{
    ChangeKind, MergeOperator, Record, RecordOp, Storage, StorageChange, StorageError,
    StorageRead, StorageResult,
};
