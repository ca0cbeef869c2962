//! ROM loading and system initialisation.
//!
//! `complete_init` is the one sequence embedders call after the ROM and all
//! disks are loaded. It patches the HCB, mirrors it into RAM bank 0x80,
//! plants the ident records and the HBIOS stub in common RAM, creates the
//! memory-disk units the HCB asks for, and populates the disk unit table
//! and drive map in both ROM bank 0 (for the boot loader) and RAM bank
//! 0x80 (for the live system).

use log::{info, warn};

use crate::disk::{DiskStore, FIRST_HARD_DISK_UNIT, MAX_HARD_DISKS, MAX_UNITS};
use crate::hcb::{
    API_TYPE_HBIOS, DISKUT_BASE, DRVMAP_BASE, HBIOS_STUB, HBIOS_STUB_ADDR, HCB_APITYPE,
    HCB_BASE, HCB_DEVCNT, HCB_RAMD_BNKS, HCB_ROMD_BNKS, IDENT_ADDR, IDENT_ADDR_ALT,
    IDENT_PTR_ADDR, IDENT_VERSION,
};
use crate::memory::{BANK_SIZE, BankedMemory, COMMON_BANK, COMMON_BASE, NUM_BANKS, ROM_SIZE};

/// Load a ROM image into the ROM array, starting at bank 0. Enables
/// banking if the embedder has not done so yet.
pub fn load_rom(mem: &mut BankedMemory, data: &[u8]) -> Result<(), String> {
    if data.is_empty() {
        return Err("empty ROM image".to_string());
    }
    if data.len() > ROM_SIZE {
        return Err(format!(
            "ROM image too large: {} bytes (max {ROM_SIZE})",
            data.len()
        ));
    }
    mem.enable_banking();
    mem.rom_mut()[..data.len()].copy_from_slice(data);
    info!("loaded {} bytes ROM", data.len());
    Ok(())
}

/// Load a full RomWBW image for the romldr boot menu: banks 1-15 come from
/// the image, bank 0 keeps the synthetic firmware already in place.
pub fn load_romldr(mem: &mut BankedMemory, data: &[u8]) -> Result<(), String> {
    if data.is_empty() {
        return Err("empty ROM image".to_string());
    }
    mem.enable_banking();
    let mut bank0 = [0u8; BANK_SIZE];
    bank0.copy_from_slice(&mem.rom()[..BANK_SIZE]);
    let len = data.len().min(ROM_SIZE);
    mem.rom_mut()[..len].copy_from_slice(&data[..len]);
    mem.rom_mut()[..BANK_SIZE].copy_from_slice(&bank0);
    info!("loaded {len} bytes romldr (banks 1-15), bank 0 preserved");
    Ok(())
}

/// Patch APITYPE in the ROM's HCB to HBIOS (0x00). The stock image ships
/// 0xFF (UNA), which makes REBOOT-style utilities refuse to run.
pub fn patch_api_type(mem: &mut BankedMemory) {
    mem.write_bank(0x00, HCB_BASE + HCB_APITYPE, API_TYPE_HBIOS);
}

/// Mirror page zero and the HCB (0x0000-0x01FF) from ROM bank 0 into RAM
/// bank 0x80. Call after `patch_api_type`.
pub fn copy_hcb_to_ram(mem: &mut BankedMemory) {
    for offset in 0x0000..0x0200u16 {
        let byte = mem.read_bank(0x00, offset);
        mem.write_bank(0x80, offset, byte);
    }
}

/// Plant the ident records guest utilities probe for: `'W', ~'W', version`
/// at 0xFF00 and 0xFE00, and the little-endian pointer at 0xFFFC.
pub fn setup_ident(mem: &mut BankedMemory) {
    for base in [IDENT_ADDR, IDENT_ADDR_ALT] {
        let offset = base - COMMON_BASE;
        mem.write_bank(COMMON_BANK, offset, b'W');
        mem.write_bank(COMMON_BANK, offset + 1, !b'W');
        mem.write_bank(COMMON_BANK, offset + 2, IDENT_VERSION);
    }
    let ptr = IDENT_PTR_ADDR - COMMON_BASE;
    mem.write_bank(COMMON_BANK, ptr, (IDENT_ADDR & 0xFF) as u8);
    mem.write_bank(COMMON_BANK, ptr + 1, (IDENT_ADDR >> 8) as u8);
}

/// Plant the service stub in common RAM: `OUT (0xEF),A; RET`.
pub fn plant_hbios_stub(mem: &mut BankedMemory) {
    for (i, byte) in HBIOS_STUB.iter().enumerate() {
        mem.write_bank(COMMON_BANK, HBIOS_STUB_ADDR - COMMON_BASE + i as u16, *byte);
    }
}

/// Create the memory-disk units the HCB declares: unit 0 is the RAM disk
/// (zero-filled, writable), unit 1 the ROM disk (a read-only copy of the
/// top ROM banks). Units that already exist are left alone so guest data
/// survives re-initialisation.
pub fn init_memory_disks(mem: &BankedMemory, disks: &mut DiskStore) {
    let ramd_banks = mem.read_bank(0x00, HCB_BASE + HCB_RAMD_BNKS) as usize;
    let romd_banks = mem.read_bank(0x00, HCB_BASE + HCB_ROMD_BNKS) as usize;

    if ramd_banks > 0 && disks.unit(0).is_none() {
        let banks = ramd_banks.min(NUM_BANKS);
        disks.attach_memory_disk(0, vec![0; banks * BANK_SIZE], false);
        info!("RAM disk: {banks} banks");
    }
    if romd_banks > 0 && disks.unit(1).is_none() {
        let banks = romd_banks.min(NUM_BANKS);
        let start = (NUM_BANKS - banks) * BANK_SIZE;
        let data = mem.rom()[start..].to_vec();
        disks.attach_memory_disk(1, data, true);
        info!("ROM disk: {banks} banks");
    }
}

/// Write the disk unit table at HCB+0x60 into both ROM bank 0 and RAM
/// bank 0x80. Entry format: type, unit, slice count, reserved.
pub fn populate_disk_unit_table(mem: &mut BankedMemory, disks: &DiskStore) {
    for unit in 0..MAX_UNITS {
        let offset = DISKUT_BASE + (unit as u16) * 4;
        let entry = match disks.unit(unit) {
            Some(u) => [u.kind.code(), unit as u8, u.slices, 0x00],
            None => [0xFF; 4],
        };
        for (i, byte) in entry.iter().enumerate() {
            mem.write_bank(0x00, offset + i as u16, *byte);
            mem.write_bank(0x80, offset + i as u16, *byte);
        }
    }
}

/// Build the drive map at HCB+0x20 in both ROM bank 0 and RAM bank 0x80:
/// RAM disk, then ROM disk, then every hard-disk slice, one drive letter
/// each, `(slice << 4) | unit` per entry and 0xFF when unused. Returns the
/// number of letters assigned.
pub fn populate_drive_map(mem: &mut BankedMemory, disks: &DiskStore) -> u8 {
    let mut map = [0xFFu8; 16];
    let mut letter = 0usize;

    if disks.unit(0).is_some() && letter < 16 {
        map[letter] = 0x00; // A: = MD0 (RAM disk)
        letter += 1;
    }
    if disks.unit(1).is_some() && letter < 16 {
        map[letter] = 0x01; // next = MD1 (ROM disk)
        letter += 1;
    }
    for hd in 0..MAX_HARD_DISKS {
        let unit = FIRST_HARD_DISK_UNIT + hd;
        let Some(disk) = disks.unit(unit) else {
            continue;
        };
        for slice in 0..disk.slices {
            if letter >= 16 {
                warn!("drive map full, dropping unit {unit} slice {slice}");
                break;
            }
            map[letter] = (slice << 4) | (unit as u8 & 0x0F);
            letter += 1;
        }
    }

    for (i, byte) in map.iter().enumerate() {
        mem.write_bank(0x00, DRVMAP_BASE + i as u16, *byte);
        mem.write_bank(0x80, DRVMAP_BASE + i as u16, *byte);
    }
    letter as u8
}

/// The complete initialisation sequence, in dependency order. Safe to run
/// more than once: every step is idempotent against the same ROM and disk
/// set.
pub fn complete_init(mem: &mut BankedMemory, disks: &mut DiskStore) {
    patch_api_type(mem);
    copy_hcb_to_ram(mem);
    setup_ident(mem);
    plant_hbios_stub(mem);
    init_memory_disks(mem, disks);
    populate_disk_unit_table(mem, disks);
    let drive_count = populate_drive_map(mem, disks);
    mem.write_bank(0x00, HCB_BASE + HCB_DEVCNT, drive_count);
    mem.write_bank(0x80, HCB_BASE + HCB_DEVCNT, drive_count);
    info!("init complete: {drive_count} drive letters");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::HD1K_SINGLE_SIZE;
    use crate::hcb::HBIOS_STUB_ADDR;

    fn fresh() -> (BankedMemory, DiskStore) {
        let mut mem = BankedMemory::new();
        mem.enable_banking();
        (mem, DiskStore::new())
    }

    fn hcb_snapshot(mem: &BankedMemory, bank: u8) -> Vec<u8> {
        (0..0x100u16)
            .map(|i| mem.read_bank(bank, HCB_BASE + i))
            .collect()
    }

    #[test]
    fn load_rom_rejects_bad_sizes() {
        let mut mem = BankedMemory::new();
        assert!(load_rom(&mut mem, &[]).is_err());
        assert!(load_rom(&mut mem, &vec![0; ROM_SIZE + 1]).is_err());
        assert!(load_rom(&mut mem, &[0x76]).is_ok());
        assert!(mem.is_banking_enabled());
    }

    #[test]
    fn romldr_preserves_bank_zero() {
        let (mut mem, _) = fresh();
        mem.rom_mut()[0x0000] = 0xAA; // synthetic firmware marker
        mem.rom_mut()[0x0123] = 0xBB;

        let image = vec![0x11u8; ROM_SIZE];
        load_romldr(&mut mem, &image).unwrap();

        assert_eq!(mem.rom()[0x0000], 0xAA, "bank 0 kept");
        assert_eq!(mem.rom()[0x0123], 0xBB);
        assert_eq!(mem.rom()[BANK_SIZE], 0x11, "bank 1 from the image");
        assert_eq!(mem.rom()[ROM_SIZE - 1], 0x11);
    }

    #[test]
    fn ident_records_and_pointer() {
        let (mut mem, _) = fresh();
        setup_ident(&mut mem);

        // Through the guest's eyes (common window, any bank selected).
        assert_eq!(mem.read(0xFF00), b'W');
        assert_eq!(mem.read(0xFF01), 0xA8);
        assert_eq!(mem.read(0xFF02), IDENT_VERSION);
        assert_eq!(mem.read(0xFE00), b'W');
        assert_eq!(mem.read(0xFE01), 0xA8);
        let ptr = u16::from(mem.read(0xFFFC)) | (u16::from(mem.read(0xFFFD)) << 8);
        assert_eq!(ptr, 0xFF00);
    }

    #[test]
    fn stub_is_out_ef_ret() {
        let (mut mem, _) = fresh();
        plant_hbios_stub(&mut mem);
        assert_eq!(mem.read(HBIOS_STUB_ADDR), 0xD3);
        assert_eq!(mem.read(HBIOS_STUB_ADDR + 1), 0xEF);
        assert_eq!(mem.read(HBIOS_STUB_ADDR + 2), 0xC9);
    }

    #[test]
    fn apitype_patched_in_rom_and_ram_mirror() {
        let (mut mem, mut disks) = fresh();
        mem.rom_mut()[(HCB_BASE + HCB_APITYPE) as usize] = 0xFF; // UNA
        complete_init(&mut mem, &mut disks);
        assert_eq!(mem.read_bank(0x00, HCB_BASE + HCB_APITYPE), 0x00);
        assert_eq!(mem.read_bank(0x80, HCB_BASE + HCB_APITYPE), 0x00);
    }

    #[test]
    fn complete_init_is_idempotent() {
        let (mut mem, mut disks) = fresh();
        // A ROM with memory-disk config and some HCB content.
        mem.rom_mut()[(HCB_BASE + HCB_RAMD_BNKS) as usize] = 4;
        mem.rom_mut()[(HCB_BASE + HCB_ROMD_BNKS) as usize] = 2;
        mem.rom_mut()[(HCB_BASE + 0x40) as usize] = 0x5A;
        disks
            .load_hard_disk(0, vec![0; HD1K_SINGLE_SIZE as usize], None)
            .unwrap();

        complete_init(&mut mem, &mut disks);
        let rom_once = hcb_snapshot(&mem, 0x00);
        let ram_once = hcb_snapshot(&mem, 0x80);

        complete_init(&mut mem, &mut disks);
        assert_eq!(hcb_snapshot(&mem, 0x00), rom_once);
        assert_eq!(hcb_snapshot(&mem, 0x80), ram_once);
    }

    #[test]
    fn memory_disks_created_from_hcb_counts() {
        let (mut mem, mut disks) = fresh();
        mem.rom_mut()[(HCB_BASE + HCB_RAMD_BNKS) as usize] = 2;
        mem.rom_mut()[(HCB_BASE + HCB_ROMD_BNKS) as usize] = 1;
        // Recognisable byte in the top ROM bank (the ROM disk source).
        mem.rom_mut()[(NUM_BANKS - 1) * BANK_SIZE] = 0xE5;

        init_memory_disks(&mem, &mut disks);

        let ramd = disks.unit(0).expect("RAM disk");
        assert_eq!(ramd.data().len(), 2 * BANK_SIZE);
        let romd = disks.unit(1).expect("ROM disk");
        assert_eq!(romd.data().len(), BANK_SIZE);
        assert_eq!(romd.data()[0], 0xE5);

        // Re-running must not clobber existing units.
        let mut sector = vec![0u8; 512];
        sector[0] = 0x42;
        disks.unit_mut(0).unwrap().write_sector(0, &sector).unwrap();
        init_memory_disks(&mem, &mut disks);
        let mut back = [0u8; 512];
        disks.unit(0).unwrap().read_sector(0, &mut back).unwrap();
        assert_eq!(back[0], 0x42);
    }

    #[test]
    fn no_memory_disks_without_hcb_counts() {
        let (mem, mut disks) = fresh();
        init_memory_disks(&mem, &mut disks);
        assert!(disks.unit(0).is_none());
        assert!(disks.unit(1).is_none());
    }

    #[test]
    fn drive_map_walks_memory_disks_then_slices() {
        let (mut mem, mut disks) = fresh();
        mem.rom_mut()[(HCB_BASE + HCB_RAMD_BNKS) as usize] = 1;
        mem.rom_mut()[(HCB_BASE + HCB_ROMD_BNKS) as usize] = 1;
        init_memory_disks(&mem, &mut disks);

        disks.set_slice_count(0, 2);
        disks
            .load_hard_disk(0, vec![0; HD1K_SINGLE_SIZE as usize], None)
            .unwrap();
        disks.set_slice_count(1, 3);
        disks
            .load_hard_disk(1, vec![0; HD1K_SINGLE_SIZE as usize], None)
            .unwrap();

        let count = populate_drive_map(&mut mem, &disks);
        assert_eq!(count, 2 + 2 + 3);

        let map: Vec<u8> = (0..16)
            .map(|i| mem.read_bank(0x00, DRVMAP_BASE + i))
            .collect();
        assert_eq!(
            &map[..7],
            &[
                0x00, // A: RAM disk
                0x01, // B: ROM disk
                0x02, // C: unit 2 slice 0
                0x12, // D: unit 2 slice 1
                0x03, // E: unit 3 slice 0
                0x13, // F: unit 3 slice 1
                0x23, // G: unit 3 slice 2
            ]
        );
        assert!(map[7..].iter().all(|&b| b == 0xFF));

        // Mirrored into RAM bank 0x80.
        let ram_map: Vec<u8> = (0..16)
            .map(|i| mem.read_bank(0x80, DRVMAP_BASE + i))
            .collect();
        assert_eq!(map, ram_map);

        // Device count recorded in both HCBs by complete_init.
        complete_init(&mut mem, &mut disks);
        assert_eq!(mem.read_bank(0x00, HCB_BASE + HCB_DEVCNT), 7);
        assert_eq!(mem.read_bank(0x80, HCB_BASE + HCB_DEVCNT), 7);
    }

    #[test]
    fn unit_table_entries() {
        let (mut mem, mut disks) = fresh();
        disks.set_slice_count(0, 4);
        disks
            .load_hard_disk(0, vec![0; HD1K_SINGLE_SIZE as usize], None)
            .unwrap();
        populate_disk_unit_table(&mut mem, &disks);

        // Unit 2: hard disk, 4 slices.
        let base = DISKUT_BASE + 2 * 4;
        assert_eq!(mem.read_bank(0x00, base), 0x09);
        assert_eq!(mem.read_bank(0x00, base + 1), 2);
        assert_eq!(mem.read_bank(0x00, base + 2), 4);
        // Unit 0: empty.
        assert_eq!(mem.read_bank(0x00, DISKUT_BASE), 0xFF);
        // RAM mirror.
        assert_eq!(mem.read_bank(0x80, base), 0x09);
    }
}
