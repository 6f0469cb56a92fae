//! The PMD32 protocol engine.
//!
//! Owns the bus, the storage backend and the drive table, and processes one
//! host transaction per [`Pmd32Engine::poll`] call: either the idle-byte
//! presence handshake or a full command. All waits are bounded busy-polls;
//! a timeout aborts the transaction and, on the opcode read, drops the link
//! so the next poll resynchronizes from the handshake.
//!
//! Integrity: every received byte is folded into an 8-bit XOR accumulator
//! seeded with the opcode; the trailing checksum byte must bring it to zero
//! or the engine answers NAK and performs no storage access. Outbound
//! payloads carry their own checksum, accumulated from zero.

use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::bus::HandshakeBus;
use crate::drives::DriveSlots;
use crate::error::{Pmd32Error, Pmd32Result};
use crate::fs::{DirEntry, ImageFile, Storage};
use crate::geometry::{
    has_image_ext, DiskAddress, DRIVE_COUNT, FORMAT_FILL, IMAGE_EXT, IMAGE_SIZE,
    PHYS_SECTOR_SIZE, SECTORS_PER_TRACK, SECTOR_SIZE, TRACK_COUNT, TRACK_SIZE,
};
use crate::protocol::{
    timeouts, truncate_str, Command, Status, ACK, IDLE, MAX_CWD, MAX_WIRE_STR, NAK,
};

/// How long a burst of commands may pause before the surrounding caller
/// takes the bus time for its own work.
pub const SETTLE_WINDOW: Duration = Duration::from_millis(150);

/// Open directory listing, advanced one entry per host call.
struct DirCursor {
    entries: Vec<DirEntry>,
    index: usize,
}

/// The emulated controller.
pub struct Pmd32Engine<B: HandshakeBus, S: Storage> {
    bus: B,
    storage: S,
    drives: DriveSlots<S::File>,
    /// Running transaction checksum.
    crc: u8,
    /// Link state; true once the host echoed the idle byte.
    host_responding: bool,
    /// Sector payloads and string marshalling, reused across transactions.
    buffer: [u8; PHYS_SECTOR_SIZE],
    /// Current working directory, "/"-rooted, trailing slash below root.
    cwd: String,
    dir_cursor: Option<DirCursor>,
}

impl<B: HandshakeBus, S: Storage> Pmd32Engine<B, S> {
    pub fn new(bus: B, storage: S) -> Self {
        Self {
            bus,
            storage,
            drives: DriveSlots::new(),
            crc: 0,
            host_responding: false,
            buffer: [0; PHYS_SECTOR_SIZE],
            cwd: "/".to_string(),
            dir_cursor: None,
        }
    }

    pub fn drives(&self) -> &DriveSlots<S::File> {
        &self.drives
    }

    pub fn drives_mut(&mut self) -> &mut DriveSlots<S::File> {
        &mut self.drives
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn storage_mut(&mut self) -> &mut S {
        &mut self.storage
    }

    /// Current working directory, including the leading root marker.
    pub fn cwd(&self) -> &str {
        &self.cwd
    }

    pub fn is_linked(&self) -> bool {
        self.host_responding
    }

    /// Mount an image outside the wire protocol, as the on-device menu does.
    pub fn mount_drive(&mut self, drive: u8, path: &str, read_only: bool) -> Pmd32Result<()> {
        self.drives.set_path(drive, path)?;
        self.drives.mount(&mut self.storage, drive, read_only)
    }

    /// Unmount a drive outside the wire protocol.
    pub fn unmount_drive(&mut self, drive: u8) {
        self.drives.unmount(drive);
    }

    /// Process at most one transaction. Returns true only when a real
    /// (non-idle) command was dispatched, whatever its storage outcome.
    pub fn poll(&mut self) -> bool {
        // exchange presence bytes until the host answers
        if !self.host_responding {
            if self.send_byte(IDLE, timeouts::SEND_IDLE) {
                if let Some(echo) = self.read_byte(timeouts::READ_IDLE, false) {
                    if echo == IDLE {
                        debug!("host link established");
                        self.host_responding = true;
                    }
                }
            }
            if !self.host_responding {
                return false;
            }
        }

        let Some(opcode) = self.read_byte(timeouts::READ_CMD, false) else {
            debug!("opcode read timed out, link dropped");
            self.host_responding = false;
            return false;
        };
        if opcode == IDLE {
            return false;
        }

        // the opcode seeds the transaction checksum
        self.crc = opcode;

        let Ok(command) = Command::try_from(opcode) else {
            trace!(opcode, "unrecognized opcode");
            self.send_byte(NAK, timeouts::SEND_NAK);
            return false;
        };
        trace!(?command, "dispatching");

        match command {
            Command::ReadBoot => self.rw_operation(false, false, true, SECTOR_SIZE),
            Command::ReadLogical | Command::ReadLogicalAlt => {
                self.rw_operation(false, false, false, SECTOR_SIZE)
            }
            Command::WriteLogical | Command::WriteLogicalAlt => {
                self.rw_operation(true, false, false, SECTOR_SIZE)
            }
            Command::WritePhysical => self.rw_operation(true, false, false, PHYS_SECTOR_SIZE),
            Command::FormatTrack => self.rw_operation(false, true, false, 0),
            Command::ChangeDrive => self.change_drive(),
            Command::ReadRam => self.inert_command(4, 2),
            Command::WriteRam => self.inert_command(5, 1),
            Command::ExecuteRam => self.inert_command(2, 1),
            Command::SlowMode | Command::FastMode => self.inert_command(0, 1),
            Command::GetImagePath => self.get_image_path(),
            Command::MountImage => self.mount_image(),
            Command::GetCwd => self.get_cwd(),
            Command::DirListing => self.dir_listing(),
            Command::ChangeCwd => self.change_cwd(),
            Command::CreateImage => self.create_image(),
            Command::ImageInfo => self.image_info(),
        }
        true
    }

    /// Poll until no command has arrived for `settle`, so bursts of rapid
    /// commands are not interrupted by the caller's own work.
    pub fn service(&mut self, settle: Duration) -> bool {
        let mut any = false;
        let mut last_traffic: Option<Instant> = None;
        loop {
            if self.poll() {
                any = true;
                last_traffic = Some(Instant::now());
            } else {
                match last_traffic {
                    None => break,
                    Some(at) if at.elapsed() > settle => break,
                    Some(_) => {}
                }
            }
        }
        any
    }

    // ==================== Byte transport ====================

    /// Strobe one byte towards the host and wait for it to be accepted.
    /// Always returns the data lines to high impedance and the direction
    /// line to input before returning.
    fn send_byte(&mut self, value: u8, timeout: Duration) -> bool {
        self.bus.set_direction_out(true);
        self.bus.drive_data(value);

        self.bus.set_strobe(false);
        self.bus.settle();
        self.bus.set_strobe(true);

        let started = Instant::now();
        let mut accepted = false;
        loop {
            // IBF low: host took the byte
            if !self.bus.input_full() {
                accepted = true;
                break;
            }
            if started.elapsed() > timeout {
                break;
            }
        }

        self.bus.release_data();
        self.bus.set_direction_out(false);
        accepted
    }

    /// Wait for a host byte and latch it with an /ACK pulse, folding it into
    /// the transaction checksum. With `check_crc` this also closes the
    /// inbound transfer: zero accumulator earns an ACK, anything else a NAK
    /// and a failed call. A timed-out wait NAKs too when `check_crc` is set.
    fn read_byte(&mut self, timeout: Duration, check_crc: bool) -> Option<u8> {
        let started = Instant::now();
        let mut latched = None;
        loop {
            // /OBF low: data ready
            if !self.bus.output_full() {
                self.bus.set_ack(false);
                self.bus.settle();
                let value = self.bus.read_data();
                self.bus.set_ack(true);
                latched = Some(value);
                break;
            }
            if started.elapsed() > timeout {
                break;
            }
        }

        let Some(value) = latched else {
            if check_crc {
                self.send_byte(NAK, timeouts::SEND_NAK);
            }
            return None;
        };

        self.crc ^= value;
        if !check_crc {
            return Some(value);
        }

        if self.crc == 0 && self.send_byte(ACK, timeouts::SEND_ACK) {
            return Some(value);
        }
        self.send_byte(NAK, timeouts::SEND_NAK);
        None
    }

    /// Payload byte with the standard short timeout.
    fn read_data_byte(&mut self) -> Option<u8> {
        self.read_byte(timeouts::READ, false)
    }

    /// Trailing checksum byte: verify the accumulator and ACK or NAK.
    fn read_checksum(&mut self) -> bool {
        self.read_byte(timeouts::READ, true).is_some()
    }

    /// Length-prefixed string with trailing checksum, capped at `max` bytes.
    /// The caller must pass a string that does not borrow from the engine.
    fn send_bounded_str(&mut self, max: usize, s: &str) {
        let len = s.len().min(max);
        self.crc ^= len as u8;
        if !self.send_byte(len as u8, timeouts::SEND) {
            return;
        }
        for index in 0..len {
            let byte = s.as_bytes()[index];
            self.crc ^= byte;
            if !self.send_byte(byte, timeouts::SEND) {
                return;
            }
        }
        self.send_byte(self.crc, timeouts::SEND);
    }

    fn send_result(&mut self, status: Status) {
        self.send_byte(status.as_byte(), timeouts::SEND_RESULT);
    }

    fn at_root(&self) -> bool {
        self.cwd == "/"
    }

    // ==================== Block I/O ====================

    /// Sector read, sector write, track format and boot-sector read.
    ///
    /// Exactly one of `write`/`format`/`boot` may be set; a violated flag
    /// combination, an oversized byte count or a zero count outside a format
    /// abort silently with no protocol traffic.
    fn rw_operation(&mut self, write: bool, format: bool, boot: bool, byte_count: usize) {
        let flags = write as u8 + format as u8 + boot as u8;
        if flags != 1 || byte_count > self.buffer.len() || (byte_count == 0 && !format) {
            return;
        }

        let addr = if boot {
            DiskAddress::BOOT
        } else {
            let Some(selector) = self.read_data_byte() else {
                return;
            };
            let Some(track) = self.read_data_byte() else {
                return;
            };
            DiskAddress::decode(selector, track, byte_count)
        };

        if write {
            for index in 0..byte_count {
                let Some(byte) = self.read_data_byte() else {
                    return;
                };
                self.buffer[index] = byte;
            }
            // a physical-sector write puts 513 bytes on the wire; the last
            // one is a protocol artifact and is dropped
            if byte_count == PHYS_SECTOR_SIZE && self.read_data_byte().is_none() {
                return;
            }
        }

        if !self.read_checksum() {
            return;
        }

        // assume failure until the storage attempt proves otherwise
        let mut result = if write {
            Status::WriteError
        } else if format {
            Status::FormatError
        } else {
            Status::ReadError
        };

        if let Some(file) = self.drives.file(addr.drive) {
            let offset = addr.byte_offset(format);

            if write {
                if !file.writable() {
                    result = Status::WriteProtect;
                } else if matches!(
                    file.write_at(offset, &self.buffer[..byte_count]),
                    Ok(n) if n == byte_count
                ) {
                    result = Status::Ok;
                }
            } else if format {
                if !file.writable() {
                    result = Status::WriteProtect;
                } else {
                    let fill = [FORMAT_FILL; TRACK_SIZE];
                    if matches!(file.write_at(offset, &fill), Ok(n) if n == TRACK_SIZE)
                        && file.flush().is_ok()
                    {
                        result = Status::Ok;
                    }
                }
            } else if matches!(
                file.read_at(offset, &mut self.buffer[..byte_count]),
                Ok(n) if n == byte_count
            ) {
                result = Status::Ok;
            }
        } else {
            // unmounted slot or out-of-range index: no storage access at all
            result = Status::InvalidDrive;
        }

        trace!(
            drive = addr.drive,
            track = addr.track,
            sector = addr.sector,
            ?result,
            "block I/O"
        );

        // nothing follows a failed operation; the host owns the retry
        if !self.send_byte(result.as_byte(), timeouts::SEND_RESULT) || result != Status::Ok {
            return;
        }

        if !write && !format {
            self.crc = 0;
            for index in 0..byte_count {
                let byte = self.buffer[index];
                self.crc ^= byte;
                if !self.send_byte(byte, timeouts::SEND) {
                    return;
                }
            }
            self.send_byte(self.crc, timeouts::SEND);
        }
    }

    // ==================== Drive-change / inert commands ====================

    /// Originally a drive select plus recalibrate to track 0; here only the
    /// slot's mount state matters.
    fn change_drive(&mut self) {
        let Some(drive) = self.read_data_byte() else {
            return;
        };
        if !self.read_checksum() {
            return;
        }
        let status = if self.drives.file(drive).is_some() {
            Status::Ok
        } else {
            Status::InvalidDrive
        };
        self.send_result(status);
    }

    /// Legacy opcodes kept for protocol compatibility: consume the argument
    /// bytes, complete the checksum handshake, answer with zeros. They never
    /// NAK on their own, only on broken transport.
    fn inert_command(&mut self, argument_count: usize, zero_count: usize) {
        for _ in 0..argument_count {
            if self.read_data_byte().is_none() {
                return;
            }
        }
        if !self.read_checksum() {
            return;
        }
        for _ in 0..zero_count {
            if !self.send_byte(0, timeouts::SEND) {
                return;
            }
        }
    }

    // ==================== Extended commands ====================

    fn get_image_path(&mut self) {
        let Some(drive) = self.read_data_byte() else {
            return;
        };
        if !self.read_checksum() {
            return;
        }
        self.crc = 0;

        if drive as usize >= DRIVE_COUNT {
            self.send_result(Status::InvalidDrive);
            return;
        }

        if self.drives.is_mounted(drive) {
            if !self.send_byte(Status::Ok.as_byte(), timeouts::SEND_RESULT) {
                return;
            }
            let wp = if self.drives.writable(drive) { 0 } else { 1 };
            self.crc ^= wp;
            if !self.send_byte(wp, timeouts::SEND) {
                return;
            }
            // slot paths hold up to 255 bytes; the wire truncates to 63,
            // relative to the root
            let full = self.drives.path(drive).unwrap_or("").to_string();
            let relative = full.strip_prefix('/').unwrap_or(&full).to_string();
            self.send_bounded_str(MAX_WIRE_STR, &relative);
        } else {
            if !self.send_byte(Status::Ok.as_byte(), timeouts::SEND_RESULT) {
                return;
            }
            self.send_byte(0, timeouts::SEND); // not write protected
            self.send_byte(0, timeouts::SEND); // zero-length path
            self.send_byte(0, timeouts::SEND); // checksum of nothing
        }
    }

    fn mount_image(&mut self) {
        let Some(drive) = self.read_data_byte() else {
            return;
        };
        let Some(read_only) = self.read_data_byte() else {
            return;
        };
        let Some(length) = self.read_data_byte() else {
            return;
        };

        // the supplied name is relative to the working directory;
        // 0 and 0xFF carry no path bytes
        let mut path = self.cwd.clone();
        if length != 0 && length != 0xFF {
            for _ in 0..length {
                let Some(byte) = self.read_data_byte() else {
                    return;
                };
                path.push(byte as char);
            }
        }

        if !self.read_checksum() {
            return;
        }
        self.crc = 0;

        if drive as usize >= DRIVE_COUNT {
            self.send_result(Status::InvalidDrive);
            return;
        }

        self.drives.unmount(drive);
        if length == 0 {
            // unmount only
            self.send_result(Status::Ok);
            return;
        }

        // 0xFF remounts the slot's stored path with the new write flag
        if length != 0xFF {
            let _ = self.drives.set_path(drive, &path);
        }

        match self.drives.mount(&mut self.storage, drive, read_only != 0) {
            Ok(()) => self.send_result(Status::Ok),
            Err(Pmd32Error::ImageSize { .. }) => self.send_result(Status::ImageUnknown),
            Err(Pmd32Error::AlreadyMounted(_)) => {
                // mounted on another slot and the like
                self.send_byte(NAK, timeouts::SEND_RESULT);
            }
            Err(_) => self.send_result(Status::PathNotFound),
        }
    }

    fn get_cwd(&mut self) {
        if !self.read_checksum() {
            return;
        }
        self.crc = 0;
        let cwd = self
            .cwd
            .strip_prefix('/')
            .unwrap_or(&self.cwd)
            .to_string();
        self.send_bounded_str(MAX_WIRE_STR, &cwd);
    }

    fn dir_listing(&mut self) {
        let Some(next_entry) = self.read_data_byte() else {
            return;
        };
        if !self.read_checksum() {
            return;
        }
        self.crc = 0;

        let mut entry = String::new();

        if next_entry == 0 {
            // reset: a fresh cursor discards whatever was open
            self.dir_cursor = None;
            match self.storage.read_dir(&self.cwd) {
                Ok(entries) => {
                    self.dir_cursor = Some(DirCursor { entries, index: 0 });
                    entry = if self.at_root() { "[.]" } else { "[..]" }.to_string();
                }
                Err(_) => {
                    self.send_result(Status::PathNotFound);
                    return;
                }
            }
        } else if let Some(mut cursor) = self.dir_cursor.take() {
            // advance past anything that is neither a directory nor an image
            while let Some(found) = cursor.entries.get(cursor.index).cloned() {
                cursor.index += 1;
                if found.is_hidden {
                    continue;
                }
                if found.is_dir {
                    entry = format!("[{}]", truncate_str(&found.name, MAX_WIRE_STR - 2));
                    break;
                }
                if has_image_ext(&found.name) {
                    entry = truncate_str(&found.name, MAX_WIRE_STR).to_string();
                    break;
                }
            }
            // an exhausted cursor stays closed
            if !entry.is_empty() {
                self.dir_cursor = Some(cursor);
            }
        }

        let max = entry.len();
        self.send_bounded_str(max, &entry);
    }

    fn change_cwd(&mut self) {
        let Some(length) = self.read_data_byte() else {
            return;
        };

        let mut path = self.cwd.clone();
        let supplied_at = path.len();
        for _ in 0..length {
            let Some(byte) = self.read_data_byte() else {
                return;
            };
            path.push(byte as char);
        }

        if !self.read_checksum() {
            return;
        }
        self.crc = 0;

        let supplied = &path[supplied_at..];
        if supplied == "." {
            self.send_result(Status::Ok);
            return;
        }
        if supplied == ".." {
            if !self.at_root() {
                // "/A/B/" -> "/A/"
                let parent = self.cwd[..self.cwd.len() - 1]
                    .rfind('/')
                    .map(|index| index + 1)
                    .unwrap_or(1);
                self.cwd.truncate(parent);
            }
            self.send_result(Status::Ok);
            return;
        }

        if !path.ends_with('/') {
            path.push('/');
        }
        if path.len() > MAX_CWD {
            self.send_result(Status::PathTooLong);
            return;
        }

        // probe; the last known good directory stays current on failure
        if !self.storage.chdir(&path) {
            self.send_result(Status::PathNotFound);
            return;
        }

        debug!(cwd = %path, "working directory changed");
        self.cwd = path;
        self.send_result(Status::Ok);
    }

    fn create_image(&mut self) {
        let Some(length) = self.read_data_byte() else {
            return;
        };

        let mut path = self.cwd.clone();
        for _ in 0..length {
            let Some(byte) = self.read_data_byte() else {
                return;
            };
            path.push(byte as char);
        }

        if !self.read_checksum() {
            return;
        }
        self.crc = 0;

        if !path.to_ascii_lowercase().contains(IMAGE_EXT) {
            path.push_str(IMAGE_EXT);
        }
        if path.len() > MAX_CWD {
            self.send_result(Status::PathTooLong);
            return;
        }

        let Ok(mut file) = self.storage.create(&path) else {
            self.send_result(Status::CreateError);
            return;
        };

        // blank image, formatted end to end
        self.buffer.fill(FORMAT_FILL);
        let mut offset = 0u64;
        while offset < IMAGE_SIZE {
            let chunk = self.buffer.len();
            if !matches!(file.write_at(offset, &self.buffer), Ok(n) if n == chunk) {
                self.send_result(Status::CreateError);
                return;
            }
            offset += chunk as u64;
        }
        let _ = file.flush();

        debug!(path = %path, "image created");
        self.send_result(Status::Ok);
    }

    fn image_info(&mut self) {
        let Some(drive) = self.read_data_byte() else {
            return;
        };
        if !self.read_checksum() {
            return;
        }
        self.crc = 0;

        if drive as usize >= DRIVE_COUNT {
            self.send_result(Status::InvalidDrive);
            return;
        }
        if !self.send_byte(Status::Ok.as_byte(), timeouts::SEND_RESULT) {
            return;
        }

        // 360K P32: 80 tracks over both sides, 36 logical sectors per
        // track, physical sector size code 2 = 512 bytes
        let record = if self.drives.is_mounted(drive) {
            [TRACK_COUNT as u8, SECTORS_PER_TRACK as u8, 2]
        } else {
            [0, 0, 0]
        };
        for byte in record {
            self.crc ^= byte;
            if !self.send_byte(byte, timeouts::SEND) {
                return;
            }
        }
        self.send_byte(self.crc, timeouts::SEND);
    }
}
