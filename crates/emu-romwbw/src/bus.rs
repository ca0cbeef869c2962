//! System bus: memory and I/O port routing.
//!
//! Three ports have reserved meaning and never reach the embedder:
//! 0x78/0x7C select the bank mapped into the lower window, and an OUT to
//! 0xEF latches an HBIOS dispatch request for the engine to service after
//! the instruction retires. Every other port passes through to the
//! embedder's handlers (reads of unmapped ports float to 0xFF).

use emu_core::{Bus, IoBus};

use crate::hbios::HBIOS_PORT;
use crate::memory::BankedMemory;

/// Primary bank-select port.
pub const BANK_PORT: u8 = 0x78;
/// Alias used by some firmware builds.
pub const BANK_PORT_ALT: u8 = 0x7C;

/// Embedder handler for IN on a non-reserved port.
pub type PortInHandler = Box<dyn FnMut(u8) -> u8>;
/// Embedder handler for OUT on a non-reserved port.
pub type PortOutHandler = Box<dyn FnMut(u8, u8)>;

/// The bus the CPU executes against.
pub struct SystemBus {
    pub memory: BankedMemory,
    hbios_request: bool,
    port_in: Option<PortInHandler>,
    port_out: Option<PortOutHandler>,
}

impl Default for SystemBus {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemBus {
    #[must_use]
    pub fn new() -> Self {
        Self {
            memory: BankedMemory::new(),
            hbios_request: false,
            port_in: None,
            port_out: None,
        }
    }

    /// Install the embedder's IN handler for non-reserved ports.
    pub fn set_port_in_handler(&mut self, handler: PortInHandler) {
        self.port_in = Some(handler);
    }

    /// Install the embedder's OUT handler for non-reserved ports.
    pub fn set_port_out_handler(&mut self, handler: PortOutHandler) {
        self.port_out = Some(handler);
    }

    /// Take the pending HBIOS dispatch request, if any. The engine calls
    /// this after every instruction.
    pub fn take_hbios_request(&mut self) -> bool {
        std::mem::take(&mut self.hbios_request)
    }
}

impl Bus for SystemBus {
    fn read(&mut self, address: u16) -> u8 {
        self.memory.read(address)
    }

    fn write(&mut self, address: u16, value: u8) {
        self.memory.write(address, value);
    }
}

impl IoBus for SystemBus {
    fn read_io(&mut self, port: u16) -> u8 {
        let port = port as u8;
        match &mut self.port_in {
            Some(handler) => handler(port),
            None => 0xFF,
        }
    }

    fn write_io(&mut self, port: u16, value: u8) {
        match port as u8 {
            BANK_PORT | BANK_PORT_ALT => {
                // First select of a RAM bank initialises it (page zero +
                // HCB from ROM bank 0).
                if value & 0x80 != 0 {
                    self.memory.init_ram_bank(value);
                }
                self.memory.select_bank(value);
            }
            HBIOS_PORT => {
                self.hbios_request = true;
            }
            port => {
                if let Some(handler) = &mut self.port_out {
                    handler(port, value);
                }
            }
        }
    }
}
