//! Z80 CPU state and the fetch/execute loop.

mod execute;

use emu_core::{Cpu, IoBus};

use crate::flags::{CF, PF, SF, ZF};
use crate::registers::Registers;

/// Which index register a DD/FD prefix selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Index {
    Ix,
    Iy,
}

/// The Z80 CPU.
///
/// `step()` executes one complete instruction. Interrupt requests are
/// latched and serviced before the next fetch. The returned T-state counts
/// are nominal (fetch/memory/io weights without wait states); batch-driven
/// embedders count instructions, not cycles.
pub struct Z80 {
    pub regs: Registers,
    int_pending: bool,
    nmi_pending: bool,
    /// Set by EI: interrupts are not accepted until after the following
    /// instruction has executed.
    ei_delay: bool,
    /// T-states accumulated during the current step.
    cycles: u32,
    /// Recorded decode miss `(opcode, pc)`, collected by the embedder.
    unimplemented: Option<(u8, u16)>,
}

impl Default for Z80 {
    fn default() -> Self {
        Self::new()
    }
}

impl Z80 {
    #[must_use]
    pub fn new() -> Self {
        Self {
            regs: Registers::default(),
            int_pending: false,
            nmi_pending: false,
            ei_delay: false,
            cycles: 0,
            unimplemented: None,
        }
    }

    /// Execute one instruction (or accept a pending interrupt).
    pub fn step<B: IoBus>(&mut self, bus: &mut B) -> u32 {
        self.cycles = 0;

        // EI shields exactly one instruction from maskable interrupts.
        let ei_blocked = self.ei_delay;
        self.ei_delay = false;

        if self.nmi_pending {
            self.nmi_pending = false;
            self.accept_nmi(bus);
            return self.cycles;
        }
        if self.int_pending && self.regs.iff1 && !ei_blocked {
            self.int_pending = false;
            self.accept_interrupt(bus);
            return self.cycles;
        }

        if self.regs.halted {
            // Idle: PC stays parked after the HALT opcode.
            return 4;
        }

        let op = self.fetch_opcode(bus);
        match op {
            0xCB => {
                let op = self.fetch_opcode(bus);
                self.execute_cb(bus, op);
            }
            0xED => {
                let op = self.fetch_opcode(bus);
                self.execute_ed(bus, op);
            }
            0xDD | 0xFD => self.execute_prefixed(bus, op),
            _ => self.execute_main(bus, op),
        }
        self.cycles
    }

    /// Latch a maskable interrupt request. It stays pending until IFF1
    /// allows acceptance.
    pub fn interrupt_request(&mut self) {
        self.int_pending = true;
    }

    /// Latch a non-maskable interrupt request.
    pub fn nmi_request(&mut self) {
        self.nmi_pending = true;
    }

    /// Reset: clears interrupt state, zeroes PC, SP, I and R, selects IM 0.
    pub fn reset(&mut self) {
        self.regs.pc = 0;
        self.regs.sp = 0;
        self.regs.i = 0;
        self.regs.r = 0;
        self.regs.iff1 = false;
        self.regs.iff2 = false;
        self.regs.im = 0;
        self.regs.halted = false;
        self.int_pending = false;
        self.nmi_pending = false;
        self.ei_delay = false;
        self.unimplemented = None;
    }

    /// Take the recorded decode miss, if any. The CPU halts when it records
    /// one; conformant guests never reach this path.
    pub fn take_unimplemented(&mut self) -> Option<(u8, u16)> {
        self.unimplemented.take()
    }

    /// Force the program counter (service-layer returns, snapshot loads).
    pub fn force_pc(&mut self, pc: u16) {
        self.regs.pc = pc;
    }

    /// True if HALT is in effect.
    #[must_use]
    pub fn is_halted(&self) -> bool {
        self.regs.halted
    }

    // ---------------------------------------------------------------------
    // Interrupt acceptance
    // ---------------------------------------------------------------------

    fn accept_nmi<B: IoBus>(&mut self, bus: &mut B) {
        self.regs.halted = false;
        self.regs.iff2 = self.regs.iff1;
        self.regs.iff1 = false;
        self.regs.bump_r(1);
        let pc = self.regs.pc;
        self.push(bus, pc);
        self.regs.pc = 0x0066;
        self.cycles += 5;
    }

    fn accept_interrupt<B: IoBus>(&mut self, bus: &mut B) {
        self.regs.halted = false;
        self.regs.iff1 = false;
        self.regs.iff2 = false;
        self.regs.bump_r(1);
        let pc = self.regs.pc;
        self.push(bus, pc);
        match self.regs.im {
            // IM 0 is serviced as IM 1: nothing on this bus supplies an
            // interrupt opcode, and RST 38h is what the hardware does when
            // the data bus floats to 0xFF anyway.
            0 | 1 => {
                self.regs.pc = 0x0038;
                self.cycles += 7;
            }
            _ => {
                // IM 2: vector table entry at I:0xFF.
                let vector = (u16::from(self.regs.i) << 8) | 0x00FF;
                self.regs.pc = self.read_word(bus, vector);
                self.cycles += 7;
            }
        }
    }

    // ---------------------------------------------------------------------
    // Fetch and memory helpers
    // ---------------------------------------------------------------------

    fn fetch_opcode<B: IoBus>(&mut self, bus: &mut B) -> u8 {
        let op = bus.fetch(self.regs.pc);
        self.regs.pc = self.regs.pc.wrapping_add(1);
        self.regs.bump_r(1);
        self.cycles += 4;
        op
    }

    fn fetch_byte<B: IoBus>(&mut self, bus: &mut B) -> u8 {
        let value = bus.read(self.regs.pc);
        self.regs.pc = self.regs.pc.wrapping_add(1);
        self.cycles += 3;
        value
    }

    fn fetch_word<B: IoBus>(&mut self, bus: &mut B) -> u16 {
        let lo = self.fetch_byte(bus);
        let hi = self.fetch_byte(bus);
        u16::from(lo) | (u16::from(hi) << 8)
    }

    fn read_byte<B: IoBus>(&mut self, bus: &mut B, addr: u16) -> u8 {
        self.cycles += 3;
        bus.read(addr)
    }

    fn write_byte<B: IoBus>(&mut self, bus: &mut B, addr: u16, value: u8) {
        self.cycles += 3;
        bus.write(addr, value);
    }

    fn read_word<B: IoBus>(&mut self, bus: &mut B, addr: u16) -> u16 {
        let lo = self.read_byte(bus, addr);
        let hi = self.read_byte(bus, addr.wrapping_add(1));
        u16::from(lo) | (u16::from(hi) << 8)
    }

    fn write_word<B: IoBus>(&mut self, bus: &mut B, addr: u16, value: u16) {
        self.write_byte(bus, addr, value as u8);
        self.write_byte(bus, addr.wrapping_add(1), (value >> 8) as u8);
    }

    fn push<B: IoBus>(&mut self, bus: &mut B, value: u16) {
        self.regs.sp = self.regs.sp.wrapping_sub(1);
        self.write_byte(bus, self.regs.sp, (value >> 8) as u8);
        self.regs.sp = self.regs.sp.wrapping_sub(1);
        self.write_byte(bus, self.regs.sp, value as u8);
    }

    fn pop<B: IoBus>(&mut self, bus: &mut B) -> u16 {
        let lo = self.read_byte(bus, self.regs.sp);
        self.regs.sp = self.regs.sp.wrapping_add(1);
        let hi = self.read_byte(bus, self.regs.sp);
        self.regs.sp = self.regs.sp.wrapping_add(1);
        u16::from(lo) | (u16::from(hi) << 8)
    }

    fn io_read<B: IoBus>(&mut self, bus: &mut B, port: u16) -> u8 {
        self.cycles += 4;
        bus.read_io(port)
    }

    fn io_write<B: IoBus>(&mut self, bus: &mut B, port: u16, value: u8) {
        self.cycles += 4;
        bus.write_io(port, value);
    }

    // ---------------------------------------------------------------------
    // Register selectors
    // ---------------------------------------------------------------------

    /// Register by 3-bit code: B C D E H L - A. Code 6 is (HL) and is
    /// handled by the caller.
    pub(crate) fn get_reg8(&self, r: u8) -> u8 {
        match r {
            0 => self.regs.b,
            1 => self.regs.c,
            2 => self.regs.d,
            3 => self.regs.e,
            4 => self.regs.h,
            5 => self.regs.l,
            7 => self.regs.a,
            _ => panic!("(HL) is not a simple register"),
        }
    }

    pub(crate) fn set_reg8(&mut self, r: u8, value: u8) {
        match r {
            0 => self.regs.b = value,
            1 => self.regs.c = value,
            2 => self.regs.d = value,
            3 => self.regs.e = value,
            4 => self.regs.h = value,
            5 => self.regs.l = value,
            7 => self.regs.a = value,
            _ => panic!("(HL) is not a simple register"),
        }
    }

    /// Register pair by 2-bit code: BC DE HL SP.
    pub(crate) fn get_reg16(&self, rp: u8) -> u16 {
        match rp {
            0 => self.regs.bc(),
            1 => self.regs.de(),
            2 => self.regs.hl(),
            _ => self.regs.sp,
        }
    }

    pub(crate) fn set_reg16(&mut self, rp: u8, value: u16) {
        match rp {
            0 => self.regs.set_bc(value),
            1 => self.regs.set_de(value),
            2 => self.regs.set_hl(value),
            _ => self.regs.sp = value,
        }
    }

    /// PUSH/POP variant: code 3 is AF instead of SP.
    pub(crate) fn get_reg16_af(&self, rp: u8) -> u16 {
        match rp {
            0 => self.regs.bc(),
            1 => self.regs.de(),
            2 => self.regs.hl(),
            _ => self.regs.af(),
        }
    }

    pub(crate) fn set_reg16_af(&mut self, rp: u8, value: u16) {
        match rp {
            0 => self.regs.set_bc(value),
            1 => self.regs.set_de(value),
            2 => self.regs.set_hl(value),
            _ => self.regs.set_af(value),
        }
    }

    /// Condition by 3-bit code: NZ Z NC C PO PE P M.
    pub(crate) fn condition(&self, cc: u8) -> bool {
        match cc {
            0 => self.regs.f & ZF == 0,
            1 => self.regs.f & ZF != 0,
            2 => self.regs.f & CF == 0,
            3 => self.regs.f & CF != 0,
            4 => self.regs.f & PF == 0,
            5 => self.regs.f & PF != 0,
            6 => self.regs.f & SF == 0,
            _ => self.regs.f & SF != 0,
        }
    }

    fn get_index(&self, index: Index) -> u16 {
        match index {
            Index::Ix => self.regs.ix,
            Index::Iy => self.regs.iy,
        }
    }

    fn set_index(&mut self, index: Index, value: u16) {
        match index {
            Index::Ix => self.regs.ix = value,
            Index::Iy => self.regs.iy = value,
        }
    }

    /// Register by 3-bit code with H/L replaced by the index halves.
    fn get_reg8_indexed(&self, index: Index, r: u8) -> u8 {
        match r {
            4 => (self.get_index(index) >> 8) as u8,
            5 => self.get_index(index) as u8,
            _ => self.get_reg8(r),
        }
    }

    fn set_reg8_indexed(&mut self, index: Index, r: u8, value: u8) {
        match r {
            4 => {
                let idx = self.get_index(index);
                self.set_index(index, (idx & 0x00FF) | (u16::from(value) << 8));
            }
            5 => {
                let idx = self.get_index(index);
                self.set_index(index, (idx & 0xFF00) | u16::from(value));
            }
            _ => self.set_reg8(r, value),
        }
    }

    fn add_cycles(&mut self, n: u32) {
        self.cycles += n;
    }
}

impl<B: IoBus> Cpu<B> for Z80 {
    fn step(&mut self, bus: &mut B) -> u32 {
        Z80::step(self, bus)
    }

    fn reset(&mut self) {
        Z80::reset(self);
    }

    fn interrupt_request(&mut self) {
        Z80::interrupt_request(self);
    }

    fn nmi_request(&mut self) {
        Z80::nmi_request(self);
    }

    fn pc(&self) -> u16 {
        self.regs.pc
    }

    fn is_halted(&self) -> bool {
        Z80::is_halted(self)
    }
}
