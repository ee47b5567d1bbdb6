#![forbid(unsafe_code)]
//! strata public API facade.
//!
//! Re-exports the engine surface through one crate so downstream
//! consumers depend on a single stable interface.

pub use strata_error::{Result, StrataError};
pub use strata_types::{BlkId, BlockSize, ChunkId, DevId, StoreUuid, VdevId};
pub use strata_vol::{
    CachePolicy, Config, Engine, VolCompletion, VolCompletionCb, VolMetrics, VolOp, VolParams,
    Volume,
};

pub use strata_alloc as alloc;
pub use strata_cache as cache;
pub use strata_device as device;
pub use strata_io as io;
pub use strata_store as store;
