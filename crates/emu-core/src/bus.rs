//! Memory and I/O bus interfaces.

/// A bus that supports memory read/write operations.
///
/// Components access memory through this trait. The bus handles address
/// decoding and routing to the appropriate device or bank.
pub trait Bus {
    /// Read a byte from the given address.
    fn read(&mut self, address: u16) -> u8;

    /// Write a byte to the given address.
    fn write(&mut self, address: u16, value: u8);

    /// Read a byte as part of an instruction fetch.
    ///
    /// Defaults to a plain `read()`. Buses that feed a tracer can override
    /// this to distinguish opcode fetches from data reads.
    fn fetch(&mut self, address: u16) -> u8 {
        self.read(address)
    }
}

/// A bus that also supports separate I/O port operations.
///
/// The Z80 has a separate 16-bit I/O address space accessed via IN and OUT
/// instructions. The full 16-bit port address is passed through (the Z80
/// places A or B on the upper half of the address bus); implementations
/// usually decode the low byte.
pub trait IoBus: Bus {
    /// Read a byte from the given I/O port.
    fn read_io(&mut self, port: u16) -> u8;

    /// Write a byte to the given I/O port.
    fn write_io(&mut self, port: u16, value: u8);
}
