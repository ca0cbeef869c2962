//! CPU core trait.

use crate::IoBus;

/// A CPU that can execute instructions.
///
/// The type parameter `B` is the bus type this CPU operates on. Interrupt
/// requests are latched and serviced before the next instruction fetch.
pub trait Cpu<B: IoBus> {
    /// Execute one instruction. Returns an approximate T-state count.
    fn step(&mut self, bus: &mut B) -> u32;

    /// Reset the CPU to its initial state.
    fn reset(&mut self);

    /// Latch a maskable interrupt request.
    fn interrupt_request(&mut self);

    /// Latch a non-maskable interrupt request.
    fn nmi_request(&mut self);

    /// Current program counter.
    fn pc(&self) -> u16;

    /// True if the CPU has executed HALT and no interrupt has arrived.
    fn is_halted(&self) -> bool;
}
