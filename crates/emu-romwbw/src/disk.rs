//! Disk store: per-unit images and slice geometry.
//!
//! Unit numbering follows the firmware convention: units 0 and 1 are the
//! memory disks (RAM disk and ROM disk), hard-disk images occupy units 2
//! and up. Each hard-disk unit holds the whole image as a byte vector and
//! optionally a host file handle for write-through.
//!
//! Supported image layouts:
//! - hd1k single slice: exactly 8 MB, data starts at offset 0.
//! - hd1k combo: 1 MB partition/prefix area + N × 8 MB slices; LBA 0
//!   addresses the first byte after the prefix.
//! - hd512: 8.32 MB per slice, data starts at offset 0.

use log::warn;

use crate::host::DiskHandle;

/// Logical block size.
pub const SECTOR_SIZE: usize = 512;

/// 8 MB: one hd1k slice.
pub const HD1K_SINGLE_SIZE: u64 = 8_388_608;
/// 1 MB combo-image prefix.
pub const HD1K_PREFIX_SIZE: u64 = 1_048_576;
/// 8.32 MB: one hd512 slice.
pub const HD512_SINGLE_SIZE: u64 = 8_519_680;

/// RomWBW hd1k partition type.
pub const PART_TYPE_ROMWBW: u8 = 0x2E;
/// FAT16 partition type (incompatible with RomWBW).
pub const PART_TYPE_FAT16: u8 = 0x06;
/// FAT32 partition type (incompatible with RomWBW).
pub const PART_TYPE_FAT32: u8 = 0x0B;

/// Unit slots in the firmware's disk unit table.
pub const MAX_UNITS: usize = 16;
/// Hard-disk images the embedder can attach.
pub const MAX_HARD_DISKS: usize = 4;
/// First hard-disk unit number (0 and 1 are the memory disks).
pub const FIRST_HARD_DISK_UNIT: usize = 2;

/// Device type of a unit, as reported in the disk unit table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskKind {
    MemoryDisk,
    HardDisk,
    Empty,
}

impl DiskKind {
    /// The firmware's device type byte.
    #[must_use]
    pub fn code(self) -> u8 {
        match self {
            DiskKind::MemoryDisk => 0x00,
            DiskKind::HardDisk => 0x09,
            DiskKind::Empty => 0xFF,
        }
    }
}

/// Sector-level failures, mapped to guest status codes by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskError {
    /// Unit is empty or out of range.
    NoUnit,
    /// LBA beyond the unit's capacity.
    OutOfRange,
    /// Write to a read-only unit (the ROM disk).
    ReadOnly,
}

/// Cylinder/head/sector figures synthesised from the image size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskGeometry {
    pub cylinders: u16,
    pub heads: u8,
    pub sectors: u8,
}

/// A logical storage unit.
pub struct DiskUnit {
    pub kind: DiskKind,
    data: Vec<u8>,
    /// Host file handle for write-through, when the image came from a path.
    pub handle: Option<DiskHandle>,
    /// Slices exposed as drive letters (1-8). Set by the embedder.
    pub slices: u8,
    /// Byte offset of LBA 0 (1 MB for combo images).
    data_offset: u64,
    read_only: bool,
}

impl DiskUnit {
    fn empty() -> Self {
        Self {
            kind: DiskKind::Empty,
            data: Vec::new(),
            handle: None,
            slices: 1,
            data_offset: 0,
            read_only: false,
        }
    }

    #[must_use]
    pub fn is_loaded(&self) -> bool {
        self.kind != DiskKind::Empty
    }

    /// Total addressable blocks.
    #[must_use]
    pub fn capacity_blocks(&self) -> u32 {
        let data = (self.data.len() as u64).saturating_sub(self.data_offset);
        (data / SECTOR_SIZE as u64) as u32
    }

    /// Byte offset of LBA 0 within the image.
    #[must_use]
    pub fn data_offset(&self) -> u64 {
        self.data_offset
    }

    /// Whole image bytes (saving, tests).
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Geometry synthesised so a guest CBIOS can size its drive table:
    /// 16 heads of 16 sectors, cylinders from the block count.
    #[must_use]
    pub fn geometry(&self) -> DiskGeometry {
        let blocks = self.capacity_blocks();
        DiskGeometry {
            cylinders: (blocks / (16 * 16)).min(0xFFFF) as u16,
            heads: 16,
            sectors: 16,
        }
    }

    /// Copy one sector into `buf`.
    pub fn read_sector(&self, lba: u32, buf: &mut [u8]) -> Result<(), DiskError> {
        if !self.is_loaded() {
            return Err(DiskError::NoUnit);
        }
        if lba >= self.capacity_blocks() {
            return Err(DiskError::OutOfRange);
        }
        let start = (self.data_offset + u64::from(lba) * SECTOR_SIZE as u64) as usize;
        buf[..SECTOR_SIZE].copy_from_slice(&self.data[start..start + SECTOR_SIZE]);
        Ok(())
    }

    /// Store one sector. Returns the image byte offset written, so the
    /// caller can mirror it to the host file.
    pub fn write_sector(&mut self, lba: u32, buf: &[u8]) -> Result<u64, DiskError> {
        if !self.is_loaded() {
            return Err(DiskError::NoUnit);
        }
        if self.read_only {
            return Err(DiskError::ReadOnly);
        }
        if lba >= self.capacity_blocks() {
            return Err(DiskError::OutOfRange);
        }
        let offset = self.data_offset + u64::from(lba) * SECTOR_SIZE as u64;
        let start = offset as usize;
        self.data[start..start + SECTOR_SIZE].copy_from_slice(&buf[..SECTOR_SIZE]);
        Ok(offset)
    }
}

/// All units of the system.
pub struct DiskStore {
    units: Vec<DiskUnit>,
}

impl Default for DiskStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DiskStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            units: (0..MAX_UNITS).map(|_| DiskUnit::empty()).collect(),
        }
    }

    #[must_use]
    pub fn unit(&self, unit: usize) -> Option<&DiskUnit> {
        self.units.get(unit).filter(|u| u.is_loaded())
    }

    pub fn unit_mut(&mut self, unit: usize) -> Option<&mut DiskUnit> {
        self.units.get_mut(unit).filter(|u| u.is_loaded())
    }

    /// All unit slots, loaded or not, in unit order.
    #[must_use]
    pub fn units(&self) -> &[DiskUnit] {
        &self.units
    }

    /// Attach a hard-disk image to slot `index` (0-based; unit `index + 2`).
    /// Validates the size, detects the combo layout, and logs the MBR
    /// heuristic warning if the image looks like a stray FAT disk.
    pub fn load_hard_disk(
        &mut self,
        index: usize,
        data: Vec<u8>,
        handle: Option<DiskHandle>,
    ) -> Result<(), String> {
        if index >= MAX_HARD_DISKS {
            return Err(format!("hard disk index {index} out of range"));
        }
        let size = data.len() as u64;
        validate_image_size(size)?;
        if let Some(warning) = check_mbr(&data) {
            warn!("disk {index}: {warning}");
        }

        let data_offset = if is_combo_size(size) { HD1K_PREFIX_SIZE } else { 0 };
        let slot = &mut self.units[FIRST_HARD_DISK_UNIT + index];
        let slices = slot.slices.clamp(1, 8);
        *slot = DiskUnit {
            kind: DiskKind::HardDisk,
            data,
            handle,
            slices,
            data_offset,
            read_only: false,
        };
        Ok(())
    }

    /// Attach a memory disk (unit 0 = RAM disk, unit 1 = ROM disk).
    pub fn attach_memory_disk(&mut self, unit: usize, data: Vec<u8>, read_only: bool) {
        if unit > 1 {
            return;
        }
        self.units[unit] = DiskUnit {
            kind: DiskKind::MemoryDisk,
            data,
            handle: None,
            slices: 1,
            data_offset: 0,
            read_only,
        };
    }

    /// Detach a unit, returning its host handle so the embedder can close
    /// the backing file.
    pub fn close(&mut self, unit: usize) -> Option<DiskHandle> {
        if unit >= MAX_UNITS {
            return None;
        }
        let handle = self.units[unit].handle;
        self.units[unit] = DiskUnit::empty();
        handle
    }

    #[must_use]
    pub fn is_hard_disk_loaded(&self, index: usize) -> bool {
        index < MAX_HARD_DISKS && self.units[FIRST_HARD_DISK_UNIT + index].is_loaded()
    }

    /// Set the slice count exposed for a hard disk (clamped to 1-8). May be
    /// called before or after the image is attached.
    pub fn set_slice_count(&mut self, index: usize, slices: u8) {
        if index < MAX_HARD_DISKS {
            self.units[FIRST_HARD_DISK_UNIT + index].slices = slices.clamp(1, 8);
        }
    }
}

/// True for the combo layout: 1 MB prefix plus a whole number of slices.
#[must_use]
pub fn is_combo_size(size: u64) -> bool {
    size > HD1K_PREFIX_SIZE && (size - HD1K_PREFIX_SIZE) % HD1K_SINGLE_SIZE == 0
}

/// Accept hd1k single, hd1k combo and hd512 multiples.
pub fn validate_image_size(size: u64) -> Result<(), String> {
    if size == HD1K_SINGLE_SIZE || is_combo_size(size) {
        return Ok(());
    }
    if size > 0 && size % HD512_SINGLE_SIZE == 0 {
        return Ok(());
    }
    Err("invalid disk size (must be 8MB for hd1k or 8.32MB for hd512)".to_string())
}

/// MBR sanity heuristic for 8 MB single-slice images.
///
/// A raw hd1k slice has no MBR; an image carrying an MBR signature without
/// a RomWBW partition is usually an accidentally-formatted FAT disk. The
/// Z80 jump check (0x18/0xC3 at byte 0) rescues slices that merely carry a
/// stale signature.
#[must_use]
pub fn check_mbr(data: &[u8]) -> Option<&'static str> {
    if data.len() as u64 != HD1K_SINGLE_SIZE {
        return None;
    }
    if data[510] != 0x55 || data[511] != 0xAA {
        return None;
    }

    let mut has_romwbw = false;
    let mut has_fat = false;
    for p in 0..4 {
        let ptype = data[0x1BE + p * 16 + 4];
        if ptype == PART_TYPE_ROMWBW {
            has_romwbw = true;
        }
        if ptype == PART_TYPE_FAT16 || ptype == PART_TYPE_FAT32 {
            has_fat = true;
        }
    }

    if has_romwbw {
        return None;
    }
    if has_fat {
        return Some(
            "disk has FAT16/FAT32 MBR but no RomWBW partition - may not work correctly",
        );
    }
    if data[0] == 0x18 || data[0] == 0xC3 {
        return None;
    }
    Some("disk has MBR but no RomWBW partition (0x2E) - format may be invalid")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single_image() -> Vec<u8> {
        vec![0; HD1K_SINGLE_SIZE as usize]
    }

    fn combo_image(slices: u64) -> Vec<u8> {
        vec![0; (HD1K_PREFIX_SIZE + slices * HD1K_SINGLE_SIZE) as usize]
    }

    #[test]
    fn size_validation() {
        assert!(validate_image_size(HD1K_SINGLE_SIZE).is_ok());
        assert!(validate_image_size(HD1K_PREFIX_SIZE + 2 * HD1K_SINGLE_SIZE).is_ok());
        assert!(validate_image_size(HD512_SINGLE_SIZE).is_ok());
        assert!(validate_image_size(3 * HD512_SINGLE_SIZE).is_ok());
        assert!(validate_image_size(1234).is_err());
        assert!(validate_image_size(0).is_err());
    }

    #[test]
    fn single_slice_capacity_and_geometry() {
        let mut store = DiskStore::new();
        store.load_hard_disk(0, single_image(), None).unwrap();
        let unit = store.unit(FIRST_HARD_DISK_UNIT).unwrap();
        assert_eq!(unit.capacity_blocks(), 16384);
        assert_eq!(unit.data_offset(), 0);
        let geom = unit.geometry();
        assert_eq!(geom.heads, 16);
        assert_eq!(geom.sectors, 16);
        assert_eq!(geom.cylinders, 64);
    }

    #[test]
    fn combo_image_skips_prefix() {
        let mut image = combo_image(2);
        image[HD1K_PREFIX_SIZE as usize] = 0x4A; // first data byte
        let mut store = DiskStore::new();
        store.load_hard_disk(0, image, None).unwrap();
        let unit = store.unit(FIRST_HARD_DISK_UNIT).unwrap();
        assert_eq!(unit.data_offset(), HD1K_PREFIX_SIZE);
        assert_eq!(unit.capacity_blocks(), 2 * 16384);

        let mut buf = [0u8; SECTOR_SIZE];
        unit.read_sector(0, &mut buf).unwrap();
        assert_eq!(buf[0], 0x4A);
    }

    #[test]
    fn sector_round_trip_and_range_check() {
        let mut store = DiskStore::new();
        store.load_hard_disk(1, single_image(), None).unwrap();
        let unit = store.unit_mut(FIRST_HARD_DISK_UNIT + 1).unwrap();

        let mut sector = [0u8; SECTOR_SIZE];
        sector[0] = 0xAB;
        sector[511] = 0xCD;
        let offset = unit.write_sector(100, &sector).unwrap();
        assert_eq!(offset, 100 * SECTOR_SIZE as u64);

        let mut back = [0u8; SECTOR_SIZE];
        unit.read_sector(100, &mut back).unwrap();
        assert_eq!(back[0], 0xAB);
        assert_eq!(back[511], 0xCD);

        assert_eq!(unit.read_sector(16384, &mut back), Err(DiskError::OutOfRange));
        assert_eq!(unit.write_sector(16384, &sector), Err(DiskError::OutOfRange));
    }

    #[test]
    fn rom_disk_rejects_writes() {
        let mut store = DiskStore::new();
        store.attach_memory_disk(1, vec![0; 0x8000], true);
        let unit = store.unit_mut(1).unwrap();
        let sector = [0u8; SECTOR_SIZE];
        assert_eq!(unit.write_sector(0, &sector), Err(DiskError::ReadOnly));
    }

    #[test]
    fn close_empties_the_unit() {
        let mut store = DiskStore::new();
        store.load_hard_disk(0, single_image(), None).unwrap();
        assert!(store.is_hard_disk_loaded(0));
        store.close(FIRST_HARD_DISK_UNIT);
        assert!(!store.is_hard_disk_loaded(0));
        assert!(store.unit(FIRST_HARD_DISK_UNIT).is_none());
    }

    #[test]
    fn slice_count_persists_across_load_order() {
        let mut store = DiskStore::new();
        store.set_slice_count(0, 4);
        store.load_hard_disk(0, single_image(), None).unwrap();
        assert_eq!(store.unit(FIRST_HARD_DISK_UNIT).unwrap().slices, 4);

        store.set_slice_count(0, 99);
        assert_eq!(store.unit(FIRST_HARD_DISK_UNIT).unwrap().slices, 8);
        store.set_slice_count(0, 0);
        assert_eq!(store.unit(FIRST_HARD_DISK_UNIT).unwrap().slices, 1);
    }

    #[test]
    fn mbr_heuristic() {
        // No signature: fine.
        assert_eq!(check_mbr(&single_image()), None);

        // Signature + RomWBW partition: fine.
        let mut image = single_image();
        image[510] = 0x55;
        image[511] = 0xAA;
        image[0x1BE + 4] = PART_TYPE_ROMWBW;
        assert_eq!(check_mbr(&image), None);

        // Signature + FAT partition: FAT warning.
        let mut image = single_image();
        image[510] = 0x55;
        image[511] = 0xAA;
        image[0x1BE + 4] = PART_TYPE_FAT16;
        assert!(check_mbr(&image).unwrap().contains("FAT16/FAT32"));

        // Signature, no partitions, Z80 jump at byte 0: stale MBR, fine.
        let mut image = single_image();
        image[510] = 0x55;
        image[511] = 0xAA;
        image[0] = 0xC3;
        assert_eq!(check_mbr(&image), None);

        // Signature, no partitions, no boot code: suspicious.
        let mut image = single_image();
        image[510] = 0x55;
        image[511] = 0xAA;
        assert!(check_mbr(&image).unwrap().contains("0x2E"));

        // Wrong size: heuristic does not apply.
        assert_eq!(check_mbr(&[0x55; 4]), None);
    }
}
