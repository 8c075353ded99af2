//! # gnix-prov
//!
//! Provider objects built on `gnix-core`.
//!
//! ```text
//! Fabric ──► EventQueue ◄──────────────┐ CONNECTED / SHUTDOWN / errors
//!   │                                   │
//!   └──► Nic ──► VcTable ──► Vc ──► Endpoint
//!         │
//!         └──► Wire (connection handshake, mailbox notifications)
//! ```
//!
//! ## Modules
//!
//! - `fabric` - Top-level object; config, wire and job services
//! - `eq` - Event Queue with error-priority reads
//! - `nic` - VC table, handshake matching, progress work queue
//! - `vc` - Virtual channel record and state transitions
//! - `ep` - Endpoint API over the NIC's VC entry points
//! - `wire` - Pluggable handshake transport and loopback implementation
//! - `cm` - Connection event payload
//! - `config` - Provider configuration
//! - `job` - Job launcher / credential services

pub mod cm;
pub mod config;
pub mod ep;
pub mod eq;
pub mod fabric;
pub mod job;
pub mod nic;
pub mod vc;
pub mod wire;

pub use cm::CmEntry;
pub use config::ProviderConfig;
pub use ep::{Endpoint, RxMessage};
pub use eq::{eq_flags, EqAttr, EqBinding, EqErrEntry, EqEvent, EventQueue, EventType, WaitObj};
pub use fabric::Fabric;
pub use job::{EnvJobServices, JobServices, RdmaCredentials};
pub use nic::Nic;
pub use vc::HwEp;
pub use wire::{LoopbackWire, Mailbox, Wire, WireEvent};
