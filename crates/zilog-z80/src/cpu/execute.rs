//! Instruction execution for the Z80.

#![allow(clippy::too_many_lines)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

use emu_core::IoBus;

use crate::alu;
use crate::flags::{CF, HF, NF, PF, SF, XF, YF, ZF, sz53p};

use super::{Index, Z80};

impl Z80 {
    // =========================================================================
    // Unprefixed instructions
    // =========================================================================

    /// Execute an unprefixed instruction.
    pub(super) fn execute_main<B: IoBus>(&mut self, bus: &mut B, op: u8) {
        match op {
            // NOP
            0x00 => {}

            // LD rr, nn (01=BC, 11=DE, 21=HL, 31=SP)
            0x01 | 0x11 | 0x21 | 0x31 => {
                let value = self.fetch_word(bus);
                self.set_reg16((op >> 4) & 3, value);
            }

            // LD (BC), A
            0x02 => {
                let addr = self.regs.bc();
                let a = self.regs.a;
                self.write_byte(bus, addr, a);
            }

            // INC rr (03=BC, 13=DE, 23=HL, 33=SP)
            0x03 | 0x13 | 0x23 | 0x33 => {
                self.add_cycles(2);
                let rp = (op >> 4) & 3;
                let value = self.get_reg16(rp).wrapping_add(1);
                self.set_reg16(rp, value);
            }

            // INC r (04=B, 0C=C, 14=D, 1C=E, 24=H, 2C=L, 3C=A)
            0x04 | 0x0C | 0x14 | 0x1C | 0x24 | 0x2C | 0x3C => {
                let r = (op >> 3) & 7;
                let result = alu::inc8(self.get_reg8(r));
                self.set_reg8(r, result.value);
                self.regs.f = (self.regs.f & CF) | result.flags;
            }

            // DEC r (05=B, 0D=C, 15=D, 1D=E, 25=H, 2D=L, 3D=A)
            0x05 | 0x0D | 0x15 | 0x1D | 0x25 | 0x2D | 0x3D => {
                let r = (op >> 3) & 7;
                let result = alu::dec8(self.get_reg8(r));
                self.set_reg8(r, result.value);
                self.regs.f = (self.regs.f & CF) | result.flags;
            }

            // LD r, n (06=B, 0E=C, 16=D, 1E=E, 26=H, 2E=L, 3E=A)
            0x06 | 0x0E | 0x16 | 0x1E | 0x26 | 0x2E | 0x3E => {
                let value = self.fetch_byte(bus);
                self.set_reg8((op >> 3) & 7, value);
            }

            // RLCA
            0x07 => {
                let carry = self.regs.a >> 7;
                self.regs.a = (self.regs.a << 1) | carry;
                self.regs.f = (self.regs.f & (SF | ZF | PF))
                    | (self.regs.a & (YF | XF))
                    | if carry != 0 { CF } else { 0 };
            }

            // EX AF, AF'
            0x08 => {
                core::mem::swap(&mut self.regs.a, &mut self.regs.a_alt);
                core::mem::swap(&mut self.regs.f, &mut self.regs.f_alt);
            }

            // ADD HL, rr (09=BC, 19=DE, 29=HL, 39=SP)
            0x09 | 0x19 | 0x29 | 0x39 => {
                self.add_cycles(7);
                let rr = self.get_reg16((op >> 4) & 3);
                let (result, flags) = alu::add16(self.regs.hl(), rr);
                self.regs.set_hl(result);
                self.regs.f = (self.regs.f & (SF | ZF | PF)) | flags;
            }

            // LD A, (BC)
            0x0A => {
                let addr = self.regs.bc();
                self.regs.a = self.read_byte(bus, addr);
            }

            // DEC rr (0B=BC, 1B=DE, 2B=HL, 3B=SP)
            0x0B | 0x1B | 0x2B | 0x3B => {
                self.add_cycles(2);
                let rp = (op >> 4) & 3;
                let value = self.get_reg16(rp).wrapping_sub(1);
                self.set_reg16(rp, value);
            }

            // RRCA
            0x0F => {
                let carry = self.regs.a & 1;
                self.regs.a = (self.regs.a >> 1) | (carry << 7);
                self.regs.f = (self.regs.f & (SF | ZF | PF))
                    | (self.regs.a & (YF | XF))
                    | if carry != 0 { CF } else { 0 };
            }

            // DJNZ e
            0x10 => {
                self.add_cycles(1);
                let offset = self.fetch_byte(bus) as i8;
                self.regs.b = self.regs.b.wrapping_sub(1);
                if self.regs.b != 0 {
                    self.add_cycles(5);
                    self.regs.pc = self.regs.pc.wrapping_add(offset as u16);
                }
            }

            // LD (DE), A
            0x12 => {
                let addr = self.regs.de();
                let a = self.regs.a;
                self.write_byte(bus, addr, a);
            }

            // RLA
            0x17 => {
                let old_carry = self.regs.f & CF;
                let new_carry = self.regs.a >> 7;
                self.regs.a = (self.regs.a << 1) | old_carry;
                self.regs.f = (self.regs.f & (SF | ZF | PF))
                    | (self.regs.a & (YF | XF))
                    | if new_carry != 0 { CF } else { 0 };
            }

            // JR e
            0x18 => {
                let offset = self.fetch_byte(bus) as i8;
                self.add_cycles(5);
                self.regs.pc = self.regs.pc.wrapping_add(offset as u16);
            }

            // LD A, (DE)
            0x1A => {
                let addr = self.regs.de();
                self.regs.a = self.read_byte(bus, addr);
            }

            // RRA
            0x1F => {
                let old_carry = if self.regs.f & CF != 0 { 0x80 } else { 0 };
                let new_carry = self.regs.a & 1;
                self.regs.a = (self.regs.a >> 1) | old_carry;
                self.regs.f = (self.regs.f & (SF | ZF | PF))
                    | (self.regs.a & (YF | XF))
                    | if new_carry != 0 { CF } else { 0 };
            }

            // JR cc, e (20=NZ, 28=Z, 30=NC, 38=C)
            0x20 | 0x28 | 0x30 | 0x38 => {
                let offset = self.fetch_byte(bus) as i8;
                let taken = match (op >> 3) & 3 {
                    0 => self.regs.f & ZF == 0,
                    1 => self.regs.f & ZF != 0,
                    2 => self.regs.f & CF == 0,
                    _ => self.regs.f & CF != 0,
                };
                if taken {
                    self.add_cycles(5);
                    self.regs.pc = self.regs.pc.wrapping_add(offset as u16);
                }
            }

            // LD (nn), HL
            0x22 => {
                let addr = self.fetch_word(bus);
                let hl = self.regs.hl();
                self.write_word(bus, addr, hl);
            }

            // DAA
            0x27 => {
                let a = self.regs.a;
                let nf = self.regs.f & NF != 0;
                let cf = self.regs.f & CF != 0;
                let hf = self.regs.f & HF != 0;

                let mut correction: u8 = 0;
                let mut new_cf = cf;

                if hf || (a & 0x0F) > 9 {
                    correction |= 0x06;
                }
                if cf || a > 0x99 {
                    correction |= 0x60;
                    new_cf = true;
                }

                let result = if nf {
                    a.wrapping_sub(correction)
                } else {
                    a.wrapping_add(correction)
                };

                let new_hf = if nf {
                    hf && (a & 0x0F) < 6
                } else {
                    (a & 0x0F) > 9
                };

                self.regs.a = result;
                self.regs.f = sz53p(result)
                    | if nf { NF } else { 0 }
                    | if new_cf { CF } else { 0 }
                    | if new_hf { HF } else { 0 };
            }

            // LD HL, (nn)
            0x2A => {
                let addr = self.fetch_word(bus);
                let value = self.read_word(bus, addr);
                self.regs.set_hl(value);
            }

            // CPL
            0x2F => {
                self.regs.a = !self.regs.a;
                self.regs.f = (self.regs.f & (SF | ZF | PF | CF))
                    | HF
                    | NF
                    | (self.regs.a & (XF | YF));
            }

            // LD (nn), A
            0x32 => {
                let addr = self.fetch_word(bus);
                let a = self.regs.a;
                self.write_byte(bus, addr, a);
            }

            // INC (HL)
            0x34 => {
                let addr = self.regs.hl();
                let result = alu::inc8(self.read_byte(bus, addr));
                self.add_cycles(1);
                self.write_byte(bus, addr, result.value);
                self.regs.f = (self.regs.f & CF) | result.flags;
            }

            // DEC (HL)
            0x35 => {
                let addr = self.regs.hl();
                let result = alu::dec8(self.read_byte(bus, addr));
                self.add_cycles(1);
                self.write_byte(bus, addr, result.value);
                self.regs.f = (self.regs.f & CF) | result.flags;
            }

            // LD (HL), n
            0x36 => {
                let value = self.fetch_byte(bus);
                let addr = self.regs.hl();
                self.write_byte(bus, addr, value);
            }

            // SCF
            0x37 => {
                self.regs.f =
                    (self.regs.f & (SF | ZF | PF)) | CF | (self.regs.a & (XF | YF));
            }

            // LD A, (nn)
            0x3A => {
                let addr = self.fetch_word(bus);
                self.regs.a = self.read_byte(bus, addr);
            }

            // CCF
            0x3F => {
                let old_cf = self.regs.f & CF;
                self.regs.f = (self.regs.f & (SF | ZF | PF))
                    | (self.regs.a & (XF | YF))
                    | if old_cf != 0 { HF } else { CF };
            }

            // HALT
            0x76 => {
                self.regs.halted = true;
            }

            // LD r, r' (40-7F except 76)
            0x40..=0x7F => {
                let src = op & 7;
                let dst = (op >> 3) & 7;
                if src == 6 {
                    // LD r, (HL)
                    let addr = self.regs.hl();
                    let value = self.read_byte(bus, addr);
                    self.set_reg8(dst, value);
                } else if dst == 6 {
                    // LD (HL), r
                    let addr = self.regs.hl();
                    let value = self.get_reg8(src);
                    self.write_byte(bus, addr, value);
                } else {
                    let value = self.get_reg8(src);
                    self.set_reg8(dst, value);
                }
            }

            // ALU A, r / (HL) (80-BF)
            0x80..=0xBF => {
                let r = op & 7;
                let value = if r == 6 {
                    let addr = self.regs.hl();
                    self.read_byte(bus, addr)
                } else {
                    self.get_reg8(r)
                };
                self.alu_a(op, value);
            }

            // RET cc (C0=NZ, C8=Z, D0=NC, D8=C, E0=PO, E8=PE, F0=P, F8=M)
            0xC0 | 0xC8 | 0xD0 | 0xD8 | 0xE0 | 0xE8 | 0xF0 | 0xF8 => {
                self.add_cycles(1);
                if self.condition((op >> 3) & 7) {
                    self.regs.pc = self.pop(bus);
                }
            }

            // POP rr (C1=BC, D1=DE, E1=HL, F1=AF)
            0xC1 | 0xD1 | 0xE1 | 0xF1 => {
                let value = self.pop(bus);
                self.set_reg16_af((op >> 4) & 3, value);
            }

            // JP cc, nn
            0xC2 | 0xCA | 0xD2 | 0xDA | 0xE2 | 0xEA | 0xF2 | 0xFA => {
                let target = self.fetch_word(bus);
                if self.condition((op >> 3) & 7) {
                    self.regs.pc = target;
                }
            }

            // JP nn
            0xC3 => {
                self.regs.pc = self.fetch_word(bus);
            }

            // CALL cc, nn
            0xC4 | 0xCC | 0xD4 | 0xDC | 0xE4 | 0xEC | 0xF4 | 0xFC => {
                let target = self.fetch_word(bus);
                if self.condition((op >> 3) & 7) {
                    self.add_cycles(1);
                    let pc = self.regs.pc;
                    self.push(bus, pc);
                    self.regs.pc = target;
                }
            }

            // PUSH rr (C5=BC, D5=DE, E5=HL, F5=AF)
            0xC5 | 0xD5 | 0xE5 | 0xF5 => {
                self.add_cycles(1);
                let value = self.get_reg16_af((op >> 4) & 3);
                self.push(bus, value);
            }

            // ALU A, n (C6=ADD, CE=ADC, D6=SUB, DE=SBC, E6=AND, EE=XOR, F6=OR, FE=CP)
            0xC6 | 0xCE | 0xD6 | 0xDE | 0xE6 | 0xEE | 0xF6 | 0xFE => {
                let value = self.fetch_byte(bus);
                self.alu_a(op, value);
            }

            // RST n (C7=00, CF=08, D7=10, DF=18, E7=20, EF=28, F7=30, FF=38)
            0xC7 | 0xCF | 0xD7 | 0xDF | 0xE7 | 0xEF | 0xF7 | 0xFF => {
                self.add_cycles(1);
                let pc = self.regs.pc;
                self.push(bus, pc);
                self.regs.pc = u16::from(op & 0x38);
            }

            // RET
            0xC9 => {
                self.regs.pc = self.pop(bus);
            }

            // CALL nn
            0xCD => {
                let target = self.fetch_word(bus);
                self.add_cycles(1);
                let pc = self.regs.pc;
                self.push(bus, pc);
                self.regs.pc = target;
            }

            // OUT (n), A — port address is (A << 8) | n
            0xD3 => {
                let n = self.fetch_byte(bus);
                let port = (u16::from(self.regs.a) << 8) | u16::from(n);
                let a = self.regs.a;
                self.io_write(bus, port, a);
            }

            // EXX
            0xD9 => {
                core::mem::swap(&mut self.regs.b, &mut self.regs.b_alt);
                core::mem::swap(&mut self.regs.c, &mut self.regs.c_alt);
                core::mem::swap(&mut self.regs.d, &mut self.regs.d_alt);
                core::mem::swap(&mut self.regs.e, &mut self.regs.e_alt);
                core::mem::swap(&mut self.regs.h, &mut self.regs.h_alt);
                core::mem::swap(&mut self.regs.l, &mut self.regs.l_alt);
            }

            // IN A, (n) — no flags, port address is (A << 8) | n
            0xDB => {
                let n = self.fetch_byte(bus);
                let port = (u16::from(self.regs.a) << 8) | u16::from(n);
                self.regs.a = self.io_read(bus, port);
            }

            // EX (SP), HL
            0xE3 => {
                let sp = self.regs.sp;
                let stack = self.read_word(bus, sp);
                let hl = self.regs.hl();
                self.add_cycles(3);
                self.write_word(bus, sp, hl);
                self.regs.set_hl(stack);
            }

            // JP (HL)
            0xE9 => {
                self.regs.pc = self.regs.hl();
            }

            // EX DE, HL
            0xEB => {
                let de = self.regs.de();
                let hl = self.regs.hl();
                self.regs.set_de(hl);
                self.regs.set_hl(de);
            }

            // DI
            0xF3 => {
                self.regs.iff1 = false;
                self.regs.iff2 = false;
            }

            // LD SP, HL
            0xF9 => {
                self.add_cycles(2);
                self.regs.sp = self.regs.hl();
            }

            // EI — interrupts stay masked for one more instruction
            0xFB => {
                self.regs.iff1 = true;
                self.regs.iff2 = true;
                self.ei_delay = true;
            }

            // Prefixes are consumed by the fetch loop before decode.
            0xCB | 0xDD | 0xED | 0xFD => {
                unreachable!("prefix byte reached the unprefixed decoder")
            }
        }
    }

    /// Perform an ALU operation on A; the operation is bits 3-5 of the opcode.
    fn alu_a(&mut self, op: u8, value: u8) {
        match (op >> 3) & 7 {
            // ADD
            0 => {
                let result = alu::add8(self.regs.a, value, false);
                self.regs.a = result.value;
                self.regs.f = result.flags;
            }
            // ADC
            1 => {
                let carry = self.regs.f & CF != 0;
                let result = alu::add8(self.regs.a, value, carry);
                self.regs.a = result.value;
                self.regs.f = result.flags;
            }
            // SUB
            2 => {
                let result = alu::sub8(self.regs.a, value, false);
                self.regs.a = result.value;
                self.regs.f = result.flags;
            }
            // SBC
            3 => {
                let carry = self.regs.f & CF != 0;
                let result = alu::sub8(self.regs.a, value, carry);
                self.regs.a = result.value;
                self.regs.f = result.flags;
            }
            // AND
            4 => {
                self.regs.a &= value;
                self.regs.f = sz53p(self.regs.a) | HF;
            }
            // XOR
            5 => {
                self.regs.a ^= value;
                self.regs.f = sz53p(self.regs.a);
            }
            // OR
            6 => {
                self.regs.a |= value;
                self.regs.f = sz53p(self.regs.a);
            }
            // CP — X/Y come from the operand, not the difference
            _ => {
                let result = alu::sub8(self.regs.a, value, false);
                self.regs.f = (result.flags & !(YF | XF)) | (value & (YF | XF));
            }
        }
    }

    // =========================================================================
    // CB-prefixed instructions
    // =========================================================================

    /// Execute a CB-prefixed instruction.
    pub(super) fn execute_cb<B: IoBus>(&mut self, bus: &mut B, op: u8) {
        let r = op & 7;

        if r == 6 {
            let addr = self.regs.hl();
            let value = self.read_byte(bus, addr);
            self.add_cycles(1);
            if let Some(result) = self.cb_operation(op, value) {
                self.write_byte(bus, addr, result);
            }
            return;
        }

        let value = self.get_reg8(r);
        if let Some(result) = self.cb_operation(op, value) {
            self.set_reg8(r, result);
        }
    }

    /// Rotate/shift/bit operation. Returns `Some(result)` for write-back,
    /// `None` for BIT.
    fn cb_operation(&mut self, op: u8, value: u8) -> Option<u8> {
        match op & 0xF8 {
            0x00 => {
                let res = alu::rlc8(value);
                self.regs.f = res.flags;
                Some(res.value)
            }
            0x08 => {
                let res = alu::rrc8(value);
                self.regs.f = res.flags;
                Some(res.value)
            }
            0x10 => {
                let res = alu::rl8(value, self.regs.f & CF != 0);
                self.regs.f = res.flags;
                Some(res.value)
            }
            0x18 => {
                let res = alu::rr8(value, self.regs.f & CF != 0);
                self.regs.f = res.flags;
                Some(res.value)
            }
            0x20 => {
                let res = alu::sla8(value);
                self.regs.f = res.flags;
                Some(res.value)
            }
            0x28 => {
                let res = alu::sra8(value);
                self.regs.f = res.flags;
                Some(res.value)
            }
            0x30 => {
                let res = alu::sll8(value);
                self.regs.f = res.flags;
                Some(res.value)
            }
            0x38 => {
                let res = alu::srl8(value);
                self.regs.f = res.flags;
                Some(res.value)
            }
            // BIT — X/Y come from the tested operand
            0x40..=0x78 => {
                let bit = (op >> 3) & 7;
                let is_zero = value & (1 << bit) == 0;
                let mut flags = (self.regs.f & CF) | HF;
                if is_zero {
                    flags |= ZF | PF;
                }
                if bit == 7 && !is_zero {
                    flags |= SF;
                }
                flags |= value & (XF | YF);
                self.regs.f = flags;
                None
            }
            // RES
            0x80..=0xB8 => Some(value & !(1 << ((op >> 3) & 7))),
            // SET
            _ => Some(value | (1 << ((op >> 3) & 7))),
        }
    }

    // =========================================================================
    // ED-prefixed instructions
    // =========================================================================

    /// Execute an ED-prefixed instruction.
    pub(super) fn execute_ed<B: IoBus>(&mut self, bus: &mut B, op: u8) {
        match op {
            // IN r, (C); 70 = IN (C), flags only
            0x40 | 0x48 | 0x50 | 0x58 | 0x60 | 0x68 | 0x70 | 0x78 => {
                let port = self.regs.bc();
                let value = self.io_read(bus, port);
                let r = (op >> 3) & 7;
                if r != 6 {
                    self.set_reg8(r, value);
                }
                self.regs.f = sz53p(value) | (self.regs.f & CF);
            }

            // OUT (C), r; 71 = OUT (C), 0
            0x41 | 0x49 | 0x51 | 0x59 | 0x61 | 0x69 | 0x71 | 0x79 => {
                let port = self.regs.bc();
                let r = (op >> 3) & 7;
                let value = if r == 6 { 0 } else { self.get_reg8(r) };
                self.io_write(bus, port, value);
            }

            // SBC HL, rr (42=BC, 52=DE, 62=HL, 72=SP)
            0x42 | 0x52 | 0x62 | 0x72 => {
                self.add_cycles(7);
                let rr = self.get_reg16((op >> 4) & 3);
                let (result, flags) =
                    alu::sbc16(self.regs.hl(), rr, self.regs.f & CF != 0);
                self.regs.set_hl(result);
                self.regs.f = flags;
            }

            // LD (nn), rr (43=BC, 53=DE, 63=HL, 73=SP)
            0x43 | 0x53 | 0x63 | 0x73 => {
                let addr = self.fetch_word(bus);
                let value = self.get_reg16((op >> 4) & 3);
                self.write_word(bus, addr, value);
            }

            // NEG (and undocumented mirrors)
            0x44 | 0x4C | 0x54 | 0x5C | 0x64 | 0x6C | 0x74 | 0x7C => {
                let result = alu::sub8(0, self.regs.a, false);
                self.regs.a = result.value;
                self.regs.f = result.flags;
            }

            // RETN / RETI (and undocumented mirrors)
            0x45 | 0x55 | 0x65 | 0x75 | 0x4D | 0x5D | 0x6D | 0x7D => {
                self.regs.iff1 = self.regs.iff2;
                self.regs.pc = self.pop(bus);
            }

            // IM 0 (and mirrors)
            0x46 | 0x66 | 0x4E | 0x6E => {
                self.regs.im = 0;
            }

            // LD I, A
            0x47 => {
                self.add_cycles(1);
                self.regs.i = self.regs.a;
            }

            // ADC HL, rr (4A=BC, 5A=DE, 6A=HL, 7A=SP)
            0x4A | 0x5A | 0x6A | 0x7A => {
                self.add_cycles(7);
                let rr = self.get_reg16((op >> 4) & 3);
                let (result, flags) =
                    alu::adc16(self.regs.hl(), rr, self.regs.f & CF != 0);
                self.regs.set_hl(result);
                self.regs.f = flags;
            }

            // LD rr, (nn) (4B=BC, 5B=DE, 6B=HL, 7B=SP)
            0x4B | 0x5B | 0x6B | 0x7B => {
                let addr = self.fetch_word(bus);
                let value = self.read_word(bus, addr);
                self.set_reg16((op >> 4) & 3, value);
            }

            // LD R, A
            0x4F => {
                self.add_cycles(1);
                self.regs.r = self.regs.a;
            }

            // IM 1
            0x56 | 0x76 => {
                self.regs.im = 1;
            }

            // LD A, I — P/V reflects IFF2
            0x57 => {
                self.add_cycles(1);
                self.regs.a = self.regs.i;
                self.ld_a_ir_flags();
            }

            // IM 2
            0x5E | 0x7E => {
                self.regs.im = 2;
            }

            // LD A, R — P/V reflects IFF2
            0x5F => {
                self.add_cycles(1);
                self.regs.a = self.regs.r;
                self.ld_a_ir_flags();
            }

            // RRD
            0x67 => {
                let addr = self.regs.hl();
                let mem = self.read_byte(bus, addr);
                self.add_cycles(4);
                let new_a = (self.regs.a & 0xF0) | (mem & 0x0F);
                let new_mem = ((self.regs.a & 0x0F) << 4) | (mem >> 4);
                self.regs.a = new_a;
                self.write_byte(bus, addr, new_mem);
                self.regs.f = sz53p(self.regs.a) | (self.regs.f & CF);
            }

            // RLD
            0x6F => {
                let addr = self.regs.hl();
                let mem = self.read_byte(bus, addr);
                self.add_cycles(4);
                let new_a = (self.regs.a & 0xF0) | (mem >> 4);
                let new_mem = ((mem & 0x0F) << 4) | (self.regs.a & 0x0F);
                self.regs.a = new_a;
                self.write_byte(bus, addr, new_mem);
                self.regs.f = sz53p(self.regs.a) | (self.regs.f & CF);
            }

            // LDI / LDD / LDIR / LDDR
            0xA0 => self.ld_block(bus, 1, false),
            0xA8 => self.ld_block(bus, -1, false),
            0xB0 => self.ld_block(bus, 1, true),
            0xB8 => self.ld_block(bus, -1, true),

            // CPI / CPD / CPIR / CPDR
            0xA1 => self.cp_block(bus, 1, false),
            0xA9 => self.cp_block(bus, -1, false),
            0xB1 => self.cp_block(bus, 1, true),
            0xB9 => self.cp_block(bus, -1, true),

            // INI / IND / INIR / INDR
            0xA2 => self.in_block(bus, 1, false),
            0xAA => self.in_block(bus, -1, false),
            0xB2 => self.in_block(bus, 1, true),
            0xBA => self.in_block(bus, -1, true),

            // OUTI / OUTD / OTIR / OTDR
            0xA3 => self.out_block(bus, 1, false),
            0xAB => self.out_block(bus, -1, false),
            0xB3 => self.out_block(bus, 1, true),
            0xBB => self.out_block(bus, -1, true),

            // Undefined ED forms: a genuine decode miss. Record it and halt;
            // conformant guests never execute these.
            _ => {
                let pc = self.regs.pc.wrapping_sub(2);
                self.unimplemented = Some((op, pc));
                self.regs.halted = true;
            }
        }
    }

    /// Shared flag update for LD A,I and LD A,R.
    fn ld_a_ir_flags(&mut self) {
        self.regs.f = (self.regs.f & CF)
            | (self.regs.a & (SF | YF | XF))
            | if self.regs.a == 0 { ZF } else { 0 }
            | if self.regs.iff2 { PF } else { 0 };
    }

    // ---------------------------------------------------------------------
    // Block operations. Each call performs one iteration; repeating forms
    // rewind PC onto the instruction while work remains, so an interrupt
    // observes the exact mid-loop register state.
    // ---------------------------------------------------------------------

    /// LDI/LDD body; `repeat` adds the LDIR/LDDR rewind.
    fn ld_block<B: IoBus>(&mut self, bus: &mut B, dir: i16, repeat: bool) {
        let hl = self.regs.hl();
        let de = self.regs.de();
        let value = self.read_byte(bus, hl);
        self.write_byte(bus, de, value);
        self.add_cycles(2);
        self.regs.set_hl(hl.wrapping_add(dir as u16));
        self.regs.set_de(de.wrapping_add(dir as u16));
        self.regs.set_bc(self.regs.bc().wrapping_sub(1));

        let n = value.wrapping_add(self.regs.a);
        if repeat && self.regs.bc() != 0 {
            self.add_cycles(5);
            self.regs.pc = self.regs.pc.wrapping_sub(2);
            let pch = (self.regs.pc >> 8) as u8;
            self.regs.f = (self.regs.f & (SF | ZF | CF)) | PF | (pch & (XF | YF));
        } else {
            self.regs.f = (self.regs.f & (SF | ZF | CF))
                | (n & XF)
                | if n & 0x02 != 0 { YF } else { 0 }
                | if self.regs.bc() != 0 { PF } else { 0 };
        }
    }

    /// CPI/CPD body; `repeat` adds the CPIR/CPDR rewind (stops on match).
    fn cp_block<B: IoBus>(&mut self, bus: &mut B, dir: i16, repeat: bool) {
        let hl = self.regs.hl();
        let value = self.read_byte(bus, hl);
        self.add_cycles(5);
        let result = self.regs.a.wrapping_sub(value);
        let hf = (self.regs.a & 0x0F) < (value & 0x0F);
        let n = result.wrapping_sub(u8::from(hf));
        self.regs.set_hl(hl.wrapping_add(dir as u16));
        self.regs.set_bc(self.regs.bc().wrapping_sub(1));

        let base = (self.regs.f & CF)
            | NF
            | if result == 0 { ZF } else { 0 }
            | if result & 0x80 != 0 { SF } else { 0 }
            | if hf { HF } else { 0 }
            | if self.regs.bc() != 0 { PF } else { 0 };
        if repeat && self.regs.bc() != 0 && result != 0 {
            self.add_cycles(5);
            self.regs.pc = self.regs.pc.wrapping_sub(2);
            let pch = (self.regs.pc >> 8) as u8;
            self.regs.f = base | (pch & (XF | YF));
        } else {
            self.regs.f = base | (n & XF) | if n & 0x02 != 0 { YF } else { 0 };
        }
    }

    /// INI/IND body; `repeat` adds the INIR/INDR rewind.
    fn in_block<B: IoBus>(&mut self, bus: &mut B, dir: i16, repeat: bool) {
        self.add_cycles(1);
        let port = self.regs.bc();
        let value = self.io_read(bus, port);
        let hl = self.regs.hl();
        self.write_byte(bus, hl, value);
        self.regs.b = self.regs.b.wrapping_sub(1);
        self.regs.set_hl(hl.wrapping_add(dir as u16));
        let c_next = if dir > 0 {
            self.regs.c.wrapping_add(1)
        } else {
            self.regs.c.wrapping_sub(1)
        };
        let k = u16::from(value) + u16::from(c_next);
        self.io_block_flags(value, k, repeat);
    }

    /// OUTI/OUTD body; `repeat` adds the OTIR/OTDR rewind. B decrements
    /// before the port write, so the port sees the new B.
    fn out_block<B: IoBus>(&mut self, bus: &mut B, dir: i16, repeat: bool) {
        self.add_cycles(1);
        let hl = self.regs.hl();
        let value = self.read_byte(bus, hl);
        self.regs.b = self.regs.b.wrapping_sub(1);
        let port = self.regs.bc();
        self.io_write(bus, port, value);
        self.regs.set_hl(hl.wrapping_add(dir as u16));
        let k = u16::from(value) + u16::from(self.regs.l);
        self.io_block_flags(value, k, repeat);
    }

    /// Shared flag epilogue for the I/O block ops. `k` is the internal
    /// carry sum the hardware leaks into H/C and parity.
    fn io_block_flags(&mut self, value: u8, k: u16, repeat: bool) {
        let b = self.regs.b;
        let hcf = k > 0xFF;
        let nf = value & 0x80 != 0;
        let p = ((k as u8) & 7) ^ b;

        if repeat && b != 0 {
            self.add_cycles(5);
            self.regs.pc = self.regs.pc.wrapping_sub(2);
            let pch = (self.regs.pc >> 8) as u8;
            let (hf, pf) = if hcf {
                if nf {
                    (
                        if b & 0x0F == 0 { HF } else { 0 },
                        sz53p(p ^ (b.wrapping_sub(1) & 7)) & PF,
                    )
                } else {
                    (
                        if b & 0x0F == 0x0F { HF } else { 0 },
                        sz53p(p ^ (b.wrapping_add(1) & 7)) & PF,
                    )
                }
            } else {
                (0, sz53p(p ^ (b & 7)) & PF)
            };
            self.regs.f = (b & SF)
                | (pch & (XF | YF))
                | if nf { NF } else { 0 }
                | if hcf { CF } else { 0 }
                | hf
                | pf;
        } else {
            self.regs.f = (if b == 0 { ZF } else { 0 })
                | (b & (SF | YF | XF))
                | if nf { NF } else { 0 }
                | if hcf { HF | CF } else { 0 }
                | (sz53p(p) & PF);
        }
    }

    // =========================================================================
    // DD/FD-prefixed instructions
    // =========================================================================

    /// Consume a DD/FD prefix chain (latest prefix wins) and dispatch.
    pub(super) fn execute_prefixed<B: IoBus>(&mut self, bus: &mut B, first: u8) {
        let mut index = if first == 0xDD { Index::Ix } else { Index::Iy };
        loop {
            let op = self.fetch_opcode(bus);
            match op {
                0xDD => index = Index::Ix,
                0xFD => index = Index::Iy,
                0xCB => {
                    // DDCB/FDCB: displacement precedes the opcode byte, and
                    // neither counts as a refresh fetch.
                    let d = self.fetch_byte(bus) as i8;
                    let sub = self.fetch_byte(bus);
                    self.execute_indexed_cb(bus, index, d, sub);
                    return;
                }
                // DD ED: the index prefix has no effect on ED forms.
                0xED => {
                    let sub = self.fetch_opcode(bus);
                    self.execute_ed(bus, sub);
                    return;
                }
                _ => {
                    self.execute_indexed(bus, index, op);
                    return;
                }
            }
        }
    }

    /// Fetch the displacement and form the indexed address.
    fn indexed_addr<B: IoBus>(&mut self, bus: &mut B, index: Index) -> u16 {
        let d = self.fetch_byte(bus) as i8;
        self.add_cycles(5);
        self.get_index(index).wrapping_add(d as u16)
    }

    /// Execute a DD/FD-prefixed instruction.
    fn execute_indexed<B: IoBus>(&mut self, bus: &mut B, index: Index, op: u8) {
        match op {
            // ADD IX/IY, rr (09=BC, 19=DE, 29=IX/IY, 39=SP)
            0x09 | 0x19 | 0x29 | 0x39 => {
                self.add_cycles(7);
                let idx = self.get_index(index);
                let rr = match (op >> 4) & 3 {
                    0 => self.regs.bc(),
                    1 => self.regs.de(),
                    2 => idx,
                    _ => self.regs.sp,
                };
                let (result, flags) = alu::add16(idx, rr);
                self.set_index(index, result);
                self.regs.f = (self.regs.f & (SF | ZF | PF)) | flags;
            }

            // LD IX/IY, nn
            0x21 => {
                let value = self.fetch_word(bus);
                self.set_index(index, value);
            }

            // LD (nn), IX/IY
            0x22 => {
                let addr = self.fetch_word(bus);
                let idx = self.get_index(index);
                self.write_word(bus, addr, idx);
            }

            // INC IX/IY
            0x23 => {
                self.add_cycles(2);
                let idx = self.get_index(index).wrapping_add(1);
                self.set_index(index, idx);
            }

            // INC/DEC IXH/IYH, IXL/IYL (undocumented)
            0x24 | 0x25 | 0x2C | 0x2D => {
                let r = (op >> 3) & 7;
                let value = self.get_reg8_indexed(index, r);
                let result = if op & 1 == 0 {
                    alu::inc8(value)
                } else {
                    alu::dec8(value)
                };
                self.set_reg8_indexed(index, r, result.value);
                self.regs.f = (self.regs.f & CF) | result.flags;
            }

            // LD IXH/IYH, n and LD IXL/IYL, n (undocumented)
            0x26 | 0x2E => {
                let value = self.fetch_byte(bus);
                self.set_reg8_indexed(index, (op >> 3) & 7, value);
            }

            // LD IX/IY, (nn)
            0x2A => {
                let addr = self.fetch_word(bus);
                let value = self.read_word(bus, addr);
                self.set_index(index, value);
            }

            // DEC IX/IY
            0x2B => {
                self.add_cycles(2);
                let idx = self.get_index(index).wrapping_sub(1);
                self.set_index(index, idx);
            }

            // INC (IX+d)/(IY+d)
            0x34 => {
                let addr = self.indexed_addr(bus, index);
                let result = alu::inc8(self.read_byte(bus, addr));
                self.add_cycles(1);
                self.write_byte(bus, addr, result.value);
                self.regs.f = (self.regs.f & CF) | result.flags;
            }

            // DEC (IX+d)/(IY+d)
            0x35 => {
                let addr = self.indexed_addr(bus, index);
                let result = alu::dec8(self.read_byte(bus, addr));
                self.add_cycles(1);
                self.write_byte(bus, addr, result.value);
                self.regs.f = (self.regs.f & CF) | result.flags;
            }

            // LD (IX+d)/(IY+d), n
            0x36 => {
                let d = self.fetch_byte(bus) as i8;
                let value = self.fetch_byte(bus);
                self.add_cycles(2);
                let addr = self.get_index(index).wrapping_add(d as u16);
                self.write_byte(bus, addr, value);
            }

            // LD r, (IX+d)/(IY+d) — destination is the normal register set
            0x46 | 0x4E | 0x56 | 0x5E | 0x66 | 0x6E | 0x7E => {
                let addr = self.indexed_addr(bus, index);
                let value = self.read_byte(bus, addr);
                self.set_reg8((op >> 3) & 7, value);
            }

            // LD (IX+d)/(IY+d), r — source is the normal register set
            0x70 | 0x71 | 0x72 | 0x73 | 0x74 | 0x75 | 0x77 => {
                let addr = self.indexed_addr(bus, index);
                let value = self.get_reg8(op & 7);
                self.write_byte(bus, addr, value);
            }

            // LD r, r' with IXH/IXL/IYH/IYL substitution (undocumented)
            0x40..=0x7F if op != 0x76 => {
                let value = self.get_reg8_indexed(index, op & 7);
                self.set_reg8_indexed(index, (op >> 3) & 7, value);
            }

            // ALU A, (IX+d)/(IY+d)
            0x86 | 0x8E | 0x96 | 0x9E | 0xA6 | 0xAE | 0xB6 | 0xBE => {
                let addr = self.indexed_addr(bus, index);
                let value = self.read_byte(bus, addr);
                self.alu_a(op, value);
            }

            // ALU A, IXH/IXL/IYH/IYL (undocumented)
            0x84 | 0x85 | 0x8C | 0x8D | 0x94 | 0x95 | 0x9C | 0x9D | 0xA4 | 0xA5 | 0xAC
            | 0xAD | 0xB4 | 0xB5 | 0xBC | 0xBD => {
                let value = self.get_reg8_indexed(index, op & 7);
                self.alu_a(op, value);
            }

            // POP IX/IY
            0xE1 => {
                let value = self.pop(bus);
                self.set_index(index, value);
            }

            // EX (SP), IX/IY
            0xE3 => {
                let sp = self.regs.sp;
                let stack = self.read_word(bus, sp);
                let idx = self.get_index(index);
                self.add_cycles(3);
                self.write_word(bus, sp, idx);
                self.set_index(index, stack);
            }

            // PUSH IX/IY
            0xE5 => {
                self.add_cycles(1);
                let idx = self.get_index(index);
                self.push(bus, idx);
            }

            // JP (IX)/(IY)
            0xE9 => {
                self.regs.pc = self.get_index(index);
            }

            // LD SP, IX/IY
            0xF9 => {
                self.add_cycles(2);
                self.regs.sp = self.get_index(index);
            }

            // Everything else executes as if unprefixed.
            _ => self.execute_main(bus, op),
        }
    }

    /// Execute a DDCB/FDCB-prefixed instruction.
    fn execute_indexed_cb<B: IoBus>(&mut self, bus: &mut B, index: Index, d: i8, op: u8) {
        let addr = self.get_index(index).wrapping_add(d as u16);
        self.add_cycles(2);
        let value = self.read_byte(bus, addr);
        let r = op & 7;

        // BIT n, (IX+d) — test only, no write-back
        if (0x40..=0x7F).contains(&op) {
            let bit = (op >> 3) & 7;
            let is_zero = value & (1 << bit) == 0;
            let mut flags = (self.regs.f & CF) | HF;
            if is_zero {
                flags |= ZF | PF;
            }
            if bit == 7 && !is_zero {
                flags |= SF;
            }
            flags |= value & (XF | YF);
            self.regs.f = flags;
            return;
        }

        let result = match op & 0xF8 {
            0x00 => {
                let res = alu::rlc8(value);
                self.regs.f = res.flags;
                res.value
            }
            0x08 => {
                let res = alu::rrc8(value);
                self.regs.f = res.flags;
                res.value
            }
            0x10 => {
                let res = alu::rl8(value, self.regs.f & CF != 0);
                self.regs.f = res.flags;
                res.value
            }
            0x18 => {
                let res = alu::rr8(value, self.regs.f & CF != 0);
                self.regs.f = res.flags;
                res.value
            }
            0x20 => {
                let res = alu::sla8(value);
                self.regs.f = res.flags;
                res.value
            }
            0x28 => {
                let res = alu::sra8(value);
                self.regs.f = res.flags;
                res.value
            }
            0x30 => {
                let res = alu::sll8(value);
                self.regs.f = res.flags;
                res.value
            }
            0x38 => {
                let res = alu::srl8(value);
                self.regs.f = res.flags;
                res.value
            }
            // RES
            0x80..=0xB8 => value & !(1 << ((op >> 3) & 7)),
            // SET
            _ => value | (1 << ((op >> 3) & 7)),
        };

        self.write_byte(bus, addr, result);

        // Undocumented: the result is also copied to the named register.
        if r != 6 {
            self.set_reg8(r, result);
        }
    }
}
