//! # gnix-core
//!
//! Platform-agnostic building blocks for the GNIX provider.
//!
//! ## Modules
//!
//! - `error` - Provider error taxonomy and libfabric errno mapping
//! - `freelist` - Chunked pool allocator for fixed-size records
//! - `fastlock` - Spinning lock for short critical sections
//! - `id` - VC ids, fabric addresses, object ids
//! - `state` - VC connection state machine and mode flags
//! - `kprint` - Subsystem-tagged leveled logging macros
//! - `env` - Environment variable helpers

pub mod error;
pub mod freelist;
pub mod fastlock;
pub mod id;
pub mod state;
pub mod kprint;
pub mod env;

pub use error::{CloseError, FabricError, FabricResult};
pub use freelist::{Freelist, FreelistConfig, Slot};
pub use fastlock::{FastLock, FastLockGuard};
pub use id::{Address, Fid, VcId};
pub use state::{VcModes, VcState};
pub use kprint::{LogLevel, Subsys};
pub use env::{env_get, env_get_bool, env_get_opt, env_get_str};
