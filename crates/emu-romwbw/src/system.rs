//! The system engine: one owning container for CPU, bus, dispatcher,
//! disks and host.
//!
//! The embedder drives execution in batches from a timer or foreground
//! loop. Inside a batch the core is strictly single-threaded: the CPU
//! steps, sentinel OUTs latch dispatch requests, and the engine services
//! them between instructions with plain `&mut` borrows — no component
//! holds a pointer to another.

use log::error;

use crate::bus::{PortInHandler, PortOutHandler, SystemBus};
use crate::disk::MAX_HARD_DISKS;
use crate::hbios::HbiosDispatch;
use crate::host::{DiskMode, HostIo};
use crate::init;
use crate::memory::{BankedMemory, WriteHook};
use zilog_z80::Z80;

/// Conventional batch length for timer-driven embedders.
pub const BATCH_SIZE: u32 = 100_000;

/// The emulated system.
pub struct System<H: HostIo> {
    cpu: Z80,
    bus: SystemBus,
    hbios: HbiosDispatch,
    disks: crate::disk::DiskStore,
    host: H,
    running: bool,
    stop_requested: bool,
    instruction_count: u64,
    boot_string: Option<String>,
}

impl<H: HostIo> System<H> {
    /// Build a system around the given host capabilities. Banking starts
    /// enabled; the dispatcher runs in skip-RET, non-blocking mode (the
    /// engine plants the stub itself and GUI-style embedders must never
    /// block inside a batch).
    pub fn new(host: H) -> Self {
        let mut bus = SystemBus::new();
        bus.memory.enable_banking();
        let mut hbios = HbiosDispatch::new();
        hbios.set_skip_ret(true);
        hbios.set_blocking_allowed(false);
        Self {
            cpu: Z80::new(),
            bus,
            hbios,
            disks: crate::disk::DiskStore::new(),
            host,
            running: false,
            stop_requested: false,
            instruction_count: 0,
            boot_string: None,
        }
    }

    // --- Loading ----------------------------------------------------------

    /// Load a ROM image from a host path. Returns false on failure.
    pub fn load_rom(&mut self, path: &str) -> bool {
        match self.host.file_load(path) {
            Ok(data) => self.load_rom_bytes(&data),
            Err(err) => {
                error!("cannot load ROM {path}: {err}");
                false
            }
        }
    }

    pub fn load_rom_bytes(&mut self, data: &[u8]) -> bool {
        match init::load_rom(&mut self.bus.memory, data) {
            Ok(()) => true,
            Err(err) => {
                error!("ROM load failed: {err}");
                false
            }
        }
    }

    /// Load a full RomWBW image into banks 1-15, keeping the synthetic
    /// firmware in bank 0.
    pub fn load_romldr(&mut self, path: &str) -> bool {
        match self.host.file_load(path) {
            Ok(data) => match init::load_romldr(&mut self.bus.memory, &data) {
                Ok(()) => true,
                Err(err) => {
                    error!("romldr load failed: {err}");
                    false
                }
            },
            Err(err) => {
                error!("cannot load romldr {path}: {err}");
                false
            }
        }
    }

    /// Attach a hard-disk image from a host path (slot 0-3, HBIOS unit
    /// `slot + 2`). The file stays open read/write so sector writes are
    /// mirrored back; if it cannot be reopened writable the image still
    /// loads, in-memory only.
    pub fn load_disk(&mut self, slot: usize, path: &str) -> bool {
        let data = match self.host.file_load(path) {
            Ok(data) => data,
            Err(err) => {
                error!("cannot load disk {path}: {err}");
                return false;
            }
        };
        let handle = self.host.disk_open(path, DiskMode::ReadWrite).ok();
        match self.disks.load_hard_disk(slot, data, handle) {
            Ok(()) => true,
            Err(err) => {
                error!("disk {slot}: {err}");
                if let Some(handle) = handle {
                    self.host.disk_close(handle);
                }
                false
            }
        }
    }

    /// Attach a hard-disk image from a buffer (no write-through).
    pub fn load_disk_bytes(&mut self, slot: usize, data: Vec<u8>) -> bool {
        match self.disks.load_hard_disk(slot, data, None) {
            Ok(()) => true,
            Err(err) => {
                error!("disk {slot}: {err}");
                false
            }
        }
    }

    /// Save a unit's image back to a host path.
    pub fn save_disk(&mut self, slot: usize, path: &str) -> bool {
        let Some(unit) = self.disks.unit(crate::disk::FIRST_HARD_DISK_UNIT + slot) else {
            return false;
        };
        let data = unit.data().to_vec();
        match self.host.file_save(path, &data) {
            Ok(()) => true,
            Err(err) => {
                error!("cannot save disk {path}: {err}");
                false
            }
        }
    }

    #[must_use]
    pub fn is_disk_loaded(&self, slot: usize) -> bool {
        self.disks.is_hard_disk_loaded(slot)
    }

    /// Slices exposed per hard disk (1-8). The auto-slice policy belongs
    /// to the embedder; the core just takes the count.
    pub fn set_disk_slice_count(&mut self, slot: usize, slices: u8) {
        self.disks.set_slice_count(slot, slices);
    }

    /// Detach a unit and release its backing file.
    pub fn close_disk(&mut self, slot: usize) {
        if slot < MAX_HARD_DISKS
            && let Some(handle) = self.disks.close(crate::disk::FIRST_HARD_DISK_UNIT + slot)
        {
            self.host.disk_close(handle);
        }
    }

    /// Characters auto-typed into the console queue on start (plus CR) —
    /// drives the firmware boot menu unattended.
    pub fn set_boot_string(&mut self, s: &str) {
        self.boot_string = if s.is_empty() { None } else { Some(s.to_string()) };
    }

    // --- Lifecycle --------------------------------------------------------

    /// Prime the CPU, run the complete initialisation sequence (HCB patch,
    /// ident, stub, disk tables) and start executing from PC=0.
    pub fn start(&mut self) {
        if self.running {
            return;
        }
        self.stop_requested = false;
        self.running = true;

        self.cpu.regs.pc = 0;
        self.cpu.regs.sp = 0;
        self.cpu.regs.iff1 = false;
        self.cpu.regs.iff2 = false;
        self.cpu.regs.halted = false;
        self.bus.memory.select_bank(0);
        self.bus.memory.clear_ram_initialized();

        // After all disks are loaded, so the unit table sees everything.
        init::complete_init(&mut self.bus.memory, &mut self.disks);

        if let Some(boot) = self.boot_string.clone() {
            for ch in boot.bytes() {
                self.host.console_queue_char(ch);
            }
            self.host.console_queue_char(b'\r');
        }
        self.host.status("Running");
    }

    /// Request a stop; the current batch ends at the next instruction
    /// boundary.
    pub fn stop(&mut self) {
        if self.running {
            self.stop_requested = true;
            self.running = false;
            self.host.status("Stopped");
        }
    }

    /// Full reset: CPU cleared, bank 0 selected, shadow overlay and
    /// RAM-init bitmap dropped, console queue drained, in-flight dispatcher
    /// state discarded. Disks persist. Restarts if it was running.
    pub fn reset(&mut self) {
        let was_running = self.running;
        self.running = false;
        self.stop_requested = false;
        self.cpu.reset();
        self.bus.memory.reset();
        self.hbios.reset();
        self.host.console_clear_queue();
        self.instruction_count = 0;
        if was_running {
            self.start();
        }
        self.host.status("Reset");
    }

    // --- Execution --------------------------------------------------------

    /// Execute up to `n` instructions. Returns the number executed. The
    /// batch ends early on stop request, halt, a decode miss, or a console
    /// read parked waiting for input.
    pub fn run_batch(&mut self, n: u32) -> u32 {
        if !self.running {
            return 0;
        }
        let mut executed = 0;
        for _ in 0..n {
            if self.stop_requested {
                break;
            }
            self.cpu.step(&mut self.bus);
            executed += 1;
            self.instruction_count += 1;

            if self.bus.take_hbios_request() {
                self.hbios.dispatch(
                    &mut self.cpu,
                    &mut self.bus.memory,
                    &mut self.disks,
                    &mut self.host,
                );
                if self.hbios.is_waiting_for_input() && !self.host.console_has_input() {
                    // Legitimate suspension point: the embedder polls
                    // `is_waiting_for_input` and resumes once input lands.
                    break;
                }
            }

            if let Some((opcode, pc)) = self.cpu.take_unimplemented() {
                error!("unimplemented opcode {opcode:#04X} at PC={pc:#06X}");
                break;
            }
            if self.cpu.is_halted() {
                break;
            }
        }
        self.hbios.advance_timer();
        if self.hbios.is_waiting_for_input() && self.host.console_has_input() {
            self.hbios.clear_waiting_for_input();
        }
        executed
    }

    /// Drain buffered console output into the host's write-char sink.
    pub fn flush_output(&mut self) {
        for ch in self.hbios.take_output() {
            self.host.console_write_char(ch);
        }
    }

    // --- Input ------------------------------------------------------------

    pub fn send_char(&mut self, ch: u8) {
        self.host.console_queue_char(ch);
        if self.hbios.is_waiting_for_input() {
            self.hbios.clear_waiting_for_input();
        }
    }

    pub fn send_string(&mut self, s: &str) {
        for ch in s.bytes() {
            self.send_char(ch);
        }
    }

    // --- Introspection and wiring ----------------------------------------

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running
    }

    #[must_use]
    pub fn is_halted(&self) -> bool {
        self.cpu.is_halted()
    }

    #[must_use]
    pub fn is_waiting_for_input(&self) -> bool {
        self.hbios.is_waiting_for_input()
    }

    #[must_use]
    pub fn pc(&self) -> u16 {
        self.cpu.regs.pc
    }

    #[must_use]
    pub fn instruction_count(&self) -> u64 {
        self.instruction_count
    }

    /// Register a memory-write subscriber (framebuffer collaborators,
    /// trace sinks, dirty-page trackers).
    pub fn add_memory_write_hook(&mut self, hook: WriteHook) {
        self.bus.memory.add_write_hook(hook);
    }

    /// Drop all memory-write subscribers.
    pub fn clear_memory_write_hooks(&mut self) {
        self.bus.memory.clear_write_hooks();
    }

    /// Route IN on non-reserved ports to the embedder.
    pub fn set_port_in_handler(&mut self, handler: PortInHandler) {
        self.bus.set_port_in_handler(handler);
    }

    /// Route OUT on non-reserved ports to the embedder.
    pub fn set_port_out_handler(&mut self, handler: PortOutHandler) {
        self.bus.set_port_out_handler(handler);
    }

    /// Allow the dispatcher to issue console reads that may block in the
    /// host (CLI embedders only).
    pub fn set_blocking_allowed(&mut self, allowed: bool) {
        self.hbios.set_blocking_allowed(allowed);
    }

    #[must_use]
    pub fn memory(&self) -> &BankedMemory {
        &self.bus.memory
    }

    pub fn memory_mut(&mut self) -> &mut BankedMemory {
        &mut self.bus.memory
    }

    #[must_use]
    pub fn cpu(&self) -> &Z80 {
        &self.cpu
    }

    pub fn cpu_mut(&mut self) -> &mut Z80 {
        &mut self.cpu
    }

    #[must_use]
    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }
}
