//! Z80 Mark IV / RomWBW system emulator core.
//!
//! Runs unmodified RomWBW firmware images and CP/M software by combining:
//!
//! - the [`zilog_z80`] functional CPU interpreter,
//! - a banked memory controller (16 ROM + 16 RAM banks of 32K, a fixed
//!   common window, copy-on-write ROM shadow),
//! - a synthetic HBIOS service layer reached through a sentinel I/O port,
//! - a disk store with hd1k/hd512 slice geometry,
//! - a host-I/O capability trait the embedder implements.
//!
//! The embedder owns a [`System`] and drives it in instruction batches;
//! the core never creates threads and never blocks (unless the embedder
//! opts into blocking console reads).

pub mod bus;
pub mod disk;
pub mod hbios;
pub mod hcb;
pub mod host;
pub mod init;
pub mod memory;
pub mod system;

pub use bus::SystemBus;
pub use disk::{DiskGeometry, DiskKind, DiskStore};
pub use hbios::{HbiosDispatch, HbiosFunction};
pub use host::{DiskFormat, DiskMode, HostIo, StdHostIo, WallClock};
pub use memory::BankedMemory;
pub use system::{BATCH_SIZE, System};
