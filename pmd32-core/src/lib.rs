//! PMD32 Floppy-Disk Controller Emulation Core
//!
//! This crate emulates the PMD32 disk controller for a vintage 8-bit
//! computer: up to four virtual drives backed by fixed-size 360K image
//! files, driven over the original byte-oriented parallel-bus protocol so
//! unmodified vintage software works unchanged.
//!
//! # Architecture
//!
//! The engine is layered over two collaborator capabilities:
//! - `HandshakeBus` trait: the five-signal parallel cable (a GPIO binding
//!   on real hardware, [`SimBus`] in tests and tooling)
//! - `Storage` trait: the medium holding the images ([`DiskStorage`] over a
//!   host directory, [`MemoryStorage`] in tests)
//! - `Pmd32Engine`: link state machine, byte transport with per-transaction
//!   XOR checksums, command dispatch, block I/O and the extended command set
//! - `HostClient`: the host's half of the protocol, for exercising the
//!   engine end to end
//!
//! Everything is single-threaded and cooperative: one [`Pmd32Engine::poll`]
//! call performs at most one transaction, and all waits are bounded.

pub mod automount;
pub mod bus;
pub mod drives;
pub mod engine;
pub mod error;
pub mod fs;
pub mod geometry;
pub mod host;
pub mod protocol;

pub use automount::{restore_system_image, AutoMountStore, SlotRecord, SYSTEM_IMAGE};
pub use bus::{HandshakeBus, SimBus, SimHost};
pub use drives::DriveSlots;
pub use engine::{Pmd32Engine, SETTLE_WINDOW};
pub use error::{Pmd32Error, Pmd32Result};
pub use fs::{DirEntry, DiskStorage, ImageFile, MemoryStorage, Storage};
pub use host::{HostClient, HostError, ListEntry};
pub use protocol::{Command, Status};
