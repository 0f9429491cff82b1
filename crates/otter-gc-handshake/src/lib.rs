//! # Otter GC Handshake
//!
//! Mutator/collector synchronization and publication barrier.
//!
//! ## Design
//!
//! - **Publication bitmap**: one side-metadata bit per heap granule, set once
//!   an object becomes reachable from more than its creating thread
//! - **Write barrier**: inline bitmap test, recorder call only when a public
//!   object starts pointing at a private one
//! - **Stop-the-world**: phase machine plus an epoch counter waiters block on
//! - **Thread-local collection**: per-mutator request flag and condition,
//!   collected without stopping other threads
//! - **Roots**: batched into collector-supplied buffers; mutator, VM-wide and
//!   compiled-code roots all go through the same closure

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod address;
pub mod barrier;
pub mod closure;
pub mod code_roots;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod handshake;
pub mod local_gc;
pub mod mutator;
pub mod oom;
pub mod registry;
pub mod side_metadata;
pub mod vm;

pub use address::{Address, MutatorId, ObjectReference, VmThread};
pub use barrier::{BarrierMode, BarrierRecorder, BarrierStats, PublicObjectBarrier, PublishingRecorder};
pub use closure::{RootsSink, ThreadLocalRootsClosure};
pub use code_roots::CodeRootRegistry;
pub use config::HandshakeConfig;
pub use coordinator::{EpochTicket, StwCoordinator, StwPhase, StwStats};
pub use error::{ConfigError, HandshakeError};
pub use handshake::Handshake;
pub use local_gc::ThreadLocalGcBlocker;
pub use mutator::{LocalGcStatus, Mutator, MutatorHandle};
pub use oom::{OutOfMemory, report_out_of_memory};
pub use registry::MutatorRegistry;
pub use side_metadata::PublicBitmap;
pub use vm::{GcThreadContext, GcThreadKind, ObjectModel, VmRuntime};
