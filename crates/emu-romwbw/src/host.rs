//! Host I/O contract.
//!
//! Everything the core needs from the surrounding platform goes through a
//! single capability trait passed in at construction: console, printer and
//! auxiliary streams, wall-clock time, randomness, whole files, disk image
//! files, and the byte-at-a-time transfer channel the guest R8/W8 utilities
//! use. The core never touches globals.
//!
//! `StdHostIo` is the stock implementation for terminal embedders. Its
//! input queue is mutex-guarded: a UI thread may enqueue characters while
//! the batch thread drains them.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::Mutex;

use chrono::{Datelike, Local, Timelike};
use log::warn;
use rand::Rng;

/// Host wall-clock record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WallClock {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
    /// 0 = Sunday.
    pub weekday: u8,
}

/// Open mode for disk image files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskMode {
    /// Read only.
    Read,
    /// Read/write, must exist.
    ReadWrite,
    /// Read/write, created if missing.
    ReadWriteCreate,
}

/// Formats `disk_create` knows how to produce (zero-filled).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskFormat {
    /// Single hd1k slice: 8 MB.
    Hd1kSingle,
    /// Combo image: 1 MB prefix + 127 slices + partition table = 128 MB.
    Hd1kCombo,
}

impl DiskFormat {
    #[must_use]
    pub fn size(self) -> u64 {
        match self {
            DiskFormat::Hd1kSingle => 8 * 1024 * 1024,
            DiskFormat::Hd1kCombo => 128 * 1024 * 1024,
        }
    }
}

/// Opaque handle to a host disk image file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskHandle(pub(crate) usize);

/// The capability record the core consumes.
pub trait HostIo {
    // --- Console ---------------------------------------------------------

    fn console_has_input(&mut self) -> bool;

    /// Next queued character, or `None` when the queue is empty. A blocking
    /// host (CLI with raw stdin) may block here instead of returning `None`.
    fn console_read_char(&mut self) -> Option<u8>;

    fn console_queue_char(&mut self, ch: u8);

    fn console_clear_queue(&mut self);

    /// The embedder's write-char sink; `flush_output` drains into this.
    fn console_write_char(&mut self, ch: u8);

    // --- Printer and auxiliary streams -----------------------------------

    fn printer_write(&mut self, _ch: u8) {}

    fn printer_ready(&mut self) -> bool {
        true
    }

    /// Auxiliary input; 0x1A (^Z) at end of stream, CP/M convention.
    fn aux_read(&mut self) -> u8 {
        0x1A
    }

    fn aux_write(&mut self, _ch: u8) {}

    // --- Time and randomness ---------------------------------------------

    fn now(&mut self) -> WallClock;

    /// Uniform integer in `[min, max)`.
    fn random(&mut self, min: u32, max: u32) -> u32;

    // --- Whole files ------------------------------------------------------

    fn file_load(&mut self, path: &str) -> io::Result<Vec<u8>>;

    /// Load a file directly into a caller-provided buffer; returns the
    /// number of bytes copied (short when the buffer is smaller).
    fn file_load_into(&mut self, path: &str, buf: &mut [u8]) -> io::Result<usize> {
        let data = self.file_load(path)?;
        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        Ok(n)
    }

    fn file_save(&mut self, path: &str, data: &[u8]) -> io::Result<()>;

    fn file_exists(&mut self, path: &str) -> bool;

    fn file_size(&mut self, path: &str) -> u64;

    // --- Disk image files -------------------------------------------------

    fn disk_open(&mut self, path: &str, mode: DiskMode) -> io::Result<DiskHandle>;

    fn disk_close(&mut self, handle: DiskHandle);

    fn disk_read(&mut self, handle: DiskHandle, offset: u64, buf: &mut [u8])
    -> io::Result<usize>;

    fn disk_write(&mut self, handle: DiskHandle, offset: u64, buf: &[u8]) -> io::Result<usize>;

    fn disk_flush(&mut self, handle: DiskHandle) -> io::Result<()>;

    fn disk_flush_all(&mut self) -> io::Result<()>;

    fn disk_size(&mut self, handle: DiskHandle) -> u64;

    /// Create a zero-filled image of the given format.
    fn disk_create(&mut self, path: &str, format: DiskFormat) -> io::Result<()>;

    // --- Host file transfer (guest R8/W8 utilities) -----------------------

    fn transfer_open_read(&mut self, name: &str) -> bool;

    /// Next byte of the transfer source, or `None` at end of file.
    fn transfer_read_byte(&mut self) -> Option<u8>;

    fn transfer_close_read(&mut self);

    fn transfer_open_write(&mut self, name: &str) -> bool;

    fn transfer_write_byte(&mut self, byte: u8) -> bool;

    /// Commit the buffered transfer to its destination.
    fn transfer_close_write(&mut self);

    // --- Status sink ------------------------------------------------------

    /// Status-change notification ("Running", "Stopped", ...).
    fn status(&mut self, _msg: &str) {}
}

/// Stock host implementation over std: stdout console, `std::fs` files,
/// `chrono` clock, `rand` RNG.
pub struct StdHostIo {
    input: Mutex<VecDeque<u8>>,
    disk_files: Vec<Option<File>>,
    transfer_read: Option<File>,
    transfer_write: Option<(String, Vec<u8>)>,
}

impl Default for StdHostIo {
    fn default() -> Self {
        Self::new()
    }
}

impl StdHostIo {
    #[must_use]
    pub fn new() -> Self {
        Self {
            input: Mutex::new(VecDeque::new()),
            disk_files: Vec::new(),
            transfer_read: None,
            transfer_write: None,
        }
    }

    fn file(&mut self, handle: DiskHandle) -> Option<&mut File> {
        self.disk_files.get_mut(handle.0).and_then(Option::as_mut)
    }
}

impl HostIo for StdHostIo {
    fn console_has_input(&mut self) -> bool {
        !self.input.lock().unwrap().is_empty()
    }

    fn console_read_char(&mut self) -> Option<u8> {
        let ch = self.input.lock().unwrap().pop_front()?;
        // CP/M wants CR line endings.
        Some(if ch == b'\n' { b'\r' } else { ch })
    }

    fn console_queue_char(&mut self, ch: u8) {
        self.input.lock().unwrap().push_back(ch);
    }

    fn console_clear_queue(&mut self) {
        self.input.lock().unwrap().clear();
    }

    fn console_write_char(&mut self, ch: u8) {
        let mut out = io::stdout();
        let _ = out.write_all(&[ch & 0x7F]);
        let _ = out.flush();
    }

    fn now(&mut self) -> WallClock {
        let now = Local::now();
        WallClock {
            year: now.year() as u16,
            month: now.month() as u8,
            day: now.day() as u8,
            hour: now.hour() as u8,
            minute: now.minute() as u8,
            second: now.second() as u8,
            weekday: now.weekday().num_days_from_sunday() as u8,
        }
    }

    fn random(&mut self, min: u32, max: u32) -> u32 {
        if min >= max {
            return min;
        }
        rand::thread_rng().gen_range(min..max)
    }

    fn file_load(&mut self, path: &str) -> io::Result<Vec<u8>> {
        std::fs::read(path)
    }

    fn file_save(&mut self, path: &str, data: &[u8]) -> io::Result<()> {
        std::fs::write(path, data)
    }

    fn file_exists(&mut self, path: &str) -> bool {
        std::fs::metadata(path).is_ok()
    }

    fn file_size(&mut self, path: &str) -> u64 {
        std::fs::metadata(path).map_or(0, |m| m.len())
    }

    fn disk_open(&mut self, path: &str, mode: DiskMode) -> io::Result<DiskHandle> {
        let file = match mode {
            DiskMode::Read => OpenOptions::new().read(true).open(path)?,
            DiskMode::ReadWrite => OpenOptions::new().read(true).write(true).open(path)?,
            DiskMode::ReadWriteCreate => OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(path)?,
        };
        // Reuse a freed slot if one exists.
        if let Some(slot) = self.disk_files.iter().position(Option::is_none) {
            self.disk_files[slot] = Some(file);
            Ok(DiskHandle(slot))
        } else {
            self.disk_files.push(Some(file));
            Ok(DiskHandle(self.disk_files.len() - 1))
        }
    }

    fn disk_close(&mut self, handle: DiskHandle) {
        if let Some(slot) = self.disk_files.get_mut(handle.0) {
            *slot = None;
        }
    }

    fn disk_read(
        &mut self,
        handle: DiskHandle,
        offset: u64,
        buf: &mut [u8],
    ) -> io::Result<usize> {
        let Some(file) = self.file(handle) else {
            return Err(io::Error::new(io::ErrorKind::NotFound, "disk handle closed"));
        };
        file.seek(SeekFrom::Start(offset))?;
        file.read(buf)
    }

    fn disk_write(&mut self, handle: DiskHandle, offset: u64, buf: &[u8]) -> io::Result<usize> {
        let Some(file) = self.file(handle) else {
            return Err(io::Error::new(io::ErrorKind::NotFound, "disk handle closed"));
        };
        file.seek(SeekFrom::Start(offset))?;
        file.write(buf)
    }

    fn disk_flush(&mut self, handle: DiskHandle) -> io::Result<()> {
        match self.file(handle) {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }

    fn disk_flush_all(&mut self) -> io::Result<()> {
        for file in self.disk_files.iter_mut().flatten() {
            file.flush()?;
        }
        Ok(())
    }

    fn disk_size(&mut self, handle: DiskHandle) -> u64 {
        self.file(handle)
            .and_then(|f| f.metadata().ok())
            .map_or(0, |m| m.len())
    }

    fn disk_create(&mut self, path: &str, format: DiskFormat) -> io::Result<()> {
        let file = File::create(path)?;
        file.set_len(format.size())?;
        Ok(())
    }

    fn transfer_open_read(&mut self, name: &str) -> bool {
        match File::open(name) {
            Ok(file) => {
                self.transfer_read = Some(file);
                true
            }
            Err(err) => {
                warn!("host transfer: cannot open {name}: {err}");
                false
            }
        }
    }

    fn transfer_read_byte(&mut self) -> Option<u8> {
        let file = self.transfer_read.as_mut()?;
        let mut byte = [0u8; 1];
        match file.read(&mut byte) {
            Ok(1) => Some(byte[0]),
            _ => None,
        }
    }

    fn transfer_close_read(&mut self) {
        self.transfer_read = None;
    }

    fn transfer_open_write(&mut self, name: &str) -> bool {
        self.transfer_write = Some((name.to_string(), Vec::new()));
        true
    }

    fn transfer_write_byte(&mut self, byte: u8) -> bool {
        match &mut self.transfer_write {
            Some((_, buffer)) => {
                buffer.push(byte);
                true
            }
            None => false,
        }
    }

    fn transfer_close_write(&mut self) {
        if let Some((name, buffer)) = self.transfer_write.take()
            && let Err(err) = std::fs::write(&name, &buffer)
        {
            warn!("host transfer: cannot write {name}: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_queue_is_fifo() {
        let mut host = StdHostIo::new();
        assert!(!host.console_has_input());
        host.console_queue_char(b'a');
        host.console_queue_char(b'b');
        assert!(host.console_has_input());
        assert_eq!(host.console_read_char(), Some(b'a'));
        assert_eq!(host.console_read_char(), Some(b'b'));
        assert_eq!(host.console_read_char(), None);
    }

    #[test]
    fn newline_becomes_carriage_return() {
        let mut host = StdHostIo::new();
        host.console_queue_char(b'\n');
        assert_eq!(host.console_read_char(), Some(b'\r'));
    }

    #[test]
    fn clear_queue_drops_everything() {
        let mut host = StdHostIo::new();
        for ch in b"hello" {
            host.console_queue_char(*ch);
        }
        host.console_clear_queue();
        assert!(!host.console_has_input());
    }

    #[test]
    fn random_is_in_range() {
        let mut host = StdHostIo::new();
        for _ in 0..100 {
            let v = host.random(10, 20);
            assert!((10..20).contains(&v));
        }
        assert_eq!(host.random(5, 5), 5);
    }

    #[test]
    fn transfer_write_buffers_until_close() {
        let mut host = StdHostIo::new();
        assert!(!host.transfer_write_byte(0x00), "no transfer open");
        assert!(host.transfer_open_write("/nonexistent-dir/x/y"));
        assert!(host.transfer_write_byte(0x41));
        // Close attempts the write and fails quietly (bad path); state resets.
        host.transfer_close_write();
        assert!(!host.transfer_write_byte(0x42));
    }

    #[test]
    fn wall_clock_fields_are_plausible() {
        let mut host = StdHostIo::new();
        let t = host.now();
        assert!(t.year >= 2024);
        assert!((1..=12).contains(&t.month));
        assert!((1..=31).contains(&t.day));
        assert!(t.weekday < 7);
    }
}
