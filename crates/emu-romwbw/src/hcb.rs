//! HCB (Hardware Configuration Block) layout and the guest-visible
//! identification records.
//!
//! The HCB is a 256-byte structure the firmware keeps at 0x0100 in ROM
//! bank 0. `complete_init` patches it and mirrors it into RAM bank 0x80;
//! lazy RAM-bank initialisation copies it again into every bank a banked
//! guest OS switches in.

/// Guest address of the HCB (in the lower, banked window).
pub const HCB_BASE: u16 = 0x0100;

/// API type byte. 0x00 = HBIOS; the stock firmware image ships 0xFF (UNA)
/// and must be patched, or REBOOT-style utilities refuse to run.
pub const HCB_APITYPE: u16 = 0x12;
/// Device count (number of assigned drive letters).
pub const HCB_DEVCNT: u16 = 0x0C;
/// Drive map: 16 bytes, one per drive letter, `(slice << 4) | unit`.
pub const HCB_DRVMAP: u16 = 0x20;
/// Disk unit table: up to 16 four-byte entries.
pub const HCB_DISKUT: u16 = 0x60;
/// RAM disk bank count.
pub const HCB_RAMD_BNKS: u16 = 0xDD;
/// ROM disk bank count.
pub const HCB_ROMD_BNKS: u16 = 0xDF;

/// Absolute guest address of the drive map (HCB + 0x20).
pub const DRVMAP_BASE: u16 = HCB_BASE + HCB_DRVMAP;
/// Absolute guest address of the disk unit table (HCB + 0x60).
pub const DISKUT_BASE: u16 = HCB_BASE + HCB_DISKUT;

/// APITYPE value for HBIOS.
pub const API_TYPE_HBIOS: u8 = 0x00;

/// Firmware version presented to the guest.
pub const VERSION_MAJOR: u8 = 3;
pub const VERSION_MINOR: u8 = 5;
/// Combined version nibbles, as stored in the ident record.
pub const IDENT_VERSION: u8 = (VERSION_MAJOR << 4) | VERSION_MINOR;
/// Version word returned by the system-version service.
pub const VERSION_WORD: u16 = ((VERSION_MAJOR as u16) << 12) | ((VERSION_MINOR as u16) << 8);

/// Ident records let guest utilities probe for HBIOS: `'W', ~'W', version`.
pub const IDENT_ADDR: u16 = 0xFF00;
/// Secondary ident record (some utilities look here instead).
pub const IDENT_ADDR_ALT: u16 = 0xFE00;
/// Little-endian pointer to the primary ident record.
pub const IDENT_PTR_ADDR: u16 = 0xFFFC;

/// The RST 08 service stub planted in common RAM: `OUT (0xEF),A; RET`.
pub const HBIOS_STUB_ADDR: u16 = 0xFFF0;
pub const HBIOS_STUB: [u8; 3] = [0xD3, 0xEF, 0xC9];
