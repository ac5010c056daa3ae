//! Second-level cache for Dormant
//!
//! This crate provides:
//! - PutFromLoadValidator: refuses stale database reads from repopulating
//!   the cache after a concurrent invalidation
//! - CacheRegion: named concurrent entry maps
//! - RegionAccessStrategy: read-only, nonstrict read-write and transactional
//!   access to a region
//! - RegionFactory: builds regions and strategies from CacheSettings
//! - Clock: millisecond time source (ManualClock in tests)

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod access;
pub mod clock;
pub mod config;
pub mod factory;
pub mod key;
pub mod owner;
pub mod region;
pub mod stats;
pub mod validator;

pub use access::{
    NonstrictReadWriteAccess, ReadOnlyAccess, RegionAccessStrategy, RegionValidator,
    TransactionalAccess,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{AccessType, CacheSettings, RegionSettings, ValidatorSettings};
pub use factory::{InMemoryRegionFactory, RegionFactory};
pub use key::{CacheEntry, CacheKey};
pub use owner::LockOwner;
pub use region::CacheRegion;
pub use stats::{RegionStatisticsSnapshot, ValidatorStatisticsSnapshot};
pub use validator::{PutFromLoadLock, PutFromLoadValidator, PutState, ValidatorKey};
