//! Host-side protocol client.
//!
//! Plays the vintage computer's half of the wire protocol over a simulated
//! cable: frames commands with their trailing checksum, pumps the engine,
//! then parses the reply including ACK/NAK, result bytes and checksummed
//! payloads. Used by the integration tests and by the CLI, which runs host
//! and engine in one process.
//!
//! One engine poll covers the presence handshake and one command, so the
//! client queues the idle echo together with the first frame whenever the
//! link is down.

use thiserror::Error;

use crate::bus::{SimBus, SimHost};
use crate::engine::Pmd32Engine;
use crate::fs::Storage;
use crate::geometry::{PHYS_SECTOR_SIZE, SECTOR_SIZE};
use crate::protocol::{Command, ACK, IDLE, NAK};

/// Host-visible failures of one transaction.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HostError {
    #[error("engine rejected the transfer with NAK")]
    Nak,
    #[error("reply ended early")]
    Truncated,
    #[error("reply payload failed its checksum")]
    BadChecksum,
    #[error("unexpected reply byte {0:#04X}")]
    Unexpected(u8),
    #[error("operation failed with result code {0}")]
    Failed(u8),
}

/// Outcome of one directory-listing call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListEntry {
    /// A directory (bracketed on the wire) or image name.
    Name(String),
    /// Empty name: enumeration finished.
    End,
}

/// The host side of the protocol.
pub struct HostClient {
    host: SimHost,
}

/// Reply bytes with a read cursor.
struct Reply {
    bytes: Vec<u8>,
    pos: usize,
}

impl Reply {
    fn next(&mut self) -> Result<u8, HostError> {
        let byte = *self.bytes.get(self.pos).ok_or(HostError::Truncated)?;
        self.pos += 1;
        Ok(byte)
    }

    fn take(&mut self, count: usize) -> Result<Vec<u8>, HostError> {
        if self.bytes.len() < self.pos + count {
            return Err(HostError::Truncated);
        }
        let taken = self.bytes[self.pos..self.pos + count].to_vec();
        self.pos += count;
        Ok(taken)
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    fn expect_ack(&mut self) -> Result<(), HostError> {
        match self.next()? {
            ACK => Ok(()),
            NAK => Err(HostError::Nak),
            other => Err(HostError::Unexpected(other)),
        }
    }

    fn expect_ok(&mut self) -> Result<(), HostError> {
        match self.next()? {
            0 => Ok(()),
            code => Err(HostError::Failed(code)),
        }
    }

    /// Length-prefixed string whose length, bytes and trailing checksum XOR
    /// to `seed` (zero unless earlier reply bytes joined the checksum).
    fn checked_string(&mut self, seed: u8) -> Result<String, HostError> {
        let len = self.next()? as usize;
        let bytes = self.take(len)?;
        let crc = self.next()?;
        let folded = bytes
            .iter()
            .fold(seed ^ len as u8 ^ crc, |acc, byte| acc ^ byte);
        if folded != 0 {
            return Err(HostError::BadChecksum);
        }
        Ok(bytes.iter().map(|&b| b as char).collect())
    }
}

/// Selector byte from drive and sector, applying the same 1/2 drive swap
/// the engine undoes (the mapping is its own inverse).
pub fn encode_selector(drive: u8, sector: u8) -> u8 {
    let raw = if drive == 1 || drive == 2 {
        drive ^ 3
    } else {
        drive
    };
    (raw << 6) | (sector & 0x3F)
}

impl HostClient {
    pub fn new(host: SimHost) -> Self {
        Self { host }
    }

    /// Raw cable access for malformed-frame tests.
    pub fn host(&self) -> &SimHost {
        &self.host
    }

    /// Frame a command: opcode, arguments, trailing checksum bringing the
    /// XOR of the whole frame to zero.
    fn frame(opcode: u8, args: &[u8]) -> Vec<u8> {
        let mut bytes = vec![opcode];
        bytes.extend_from_slice(args);
        let crc = bytes.iter().fold(0u8, |acc, byte| acc ^ byte);
        bytes.push(crc);
        bytes
    }

    /// Queue one frame (preceded by the idle echo when the link is down),
    /// run one engine poll, and collect the reply.
    fn transact<S: Storage>(
        &mut self,
        engine: &mut Pmd32Engine<SimBus, S>,
        frame: &[u8],
    ) -> Reply {
        let was_linked = engine.is_linked();
        if !was_linked {
            self.host.queue(&[IDLE]);
        }
        self.host.queue(frame);
        engine.poll();

        let mut bytes = self.host.take_sent();
        if !was_linked && bytes.first() == Some(&IDLE) {
            bytes.remove(0);
        }
        Reply { bytes, pos: 0 }
    }

    fn read_op<S: Storage>(
        &mut self,
        engine: &mut Pmd32Engine<SimBus, S>,
        opcode: u8,
        args: &[u8],
    ) -> Result<Vec<u8>, HostError> {
        let mut reply = self.transact(engine, &Self::frame(opcode, args));
        reply.expect_ack()?;
        reply.expect_ok()?;
        let payload = reply.take(SECTOR_SIZE)?;
        let crc = reply.next()?;
        if payload.iter().fold(crc, |acc, byte| acc ^ byte) != 0 {
            return Err(HostError::BadChecksum);
        }
        Ok(payload)
    }

    fn simple_op<S: Storage>(
        &mut self,
        engine: &mut Pmd32Engine<SimBus, S>,
        opcode: u8,
        args: &[u8],
    ) -> Result<(), HostError> {
        let mut reply = self.transact(engine, &Self::frame(opcode, args));
        reply.expect_ack()?;
        reply.expect_ok()
    }

    // ==================== Original commands ====================

    pub fn read_boot<S: Storage>(
        &mut self,
        engine: &mut Pmd32Engine<SimBus, S>,
    ) -> Result<Vec<u8>, HostError> {
        self.read_op(engine, Command::ReadBoot as u8, &[])
    }

    pub fn read_sector<S: Storage>(
        &mut self,
        engine: &mut Pmd32Engine<SimBus, S>,
        drive: u8,
        track: u8,
        sector: u8,
    ) -> Result<Vec<u8>, HostError> {
        let args = [encode_selector(drive, sector), track];
        self.read_op(engine, Command::ReadLogical as u8, &args)
    }

    pub fn write_sector<S: Storage>(
        &mut self,
        engine: &mut Pmd32Engine<SimBus, S>,
        drive: u8,
        track: u8,
        sector: u8,
        payload: &[u8; SECTOR_SIZE],
    ) -> Result<(), HostError> {
        let mut args = vec![encode_selector(drive, sector), track];
        args.extend_from_slice(payload);
        self.simple_op(engine, Command::WriteLogical as u8, &args)
    }

    /// Physical-sector write; 513 payload bytes go over the wire, the last
    /// one a protocol artifact.
    pub fn write_physical<S: Storage>(
        &mut self,
        engine: &mut Pmd32Engine<SimBus, S>,
        drive: u8,
        track: u8,
        sector: u8,
        payload: &[u8; PHYS_SECTOR_SIZE],
    ) -> Result<(), HostError> {
        let mut args = vec![encode_selector(drive, sector), track];
        args.extend_from_slice(payload);
        args.push(0);
        self.simple_op(engine, Command::WritePhysical as u8, &args)
    }

    pub fn format_track<S: Storage>(
        &mut self,
        engine: &mut Pmd32Engine<SimBus, S>,
        drive: u8,
        track: u8,
    ) -> Result<(), HostError> {
        let args = [encode_selector(drive, 0), track];
        self.simple_op(engine, Command::FormatTrack as u8, &args)
    }

    pub fn change_drive<S: Storage>(
        &mut self,
        engine: &mut Pmd32Engine<SimBus, S>,
        drive: u8,
    ) -> Result<(), HostError> {
        self.simple_op(engine, Command::ChangeDrive as u8, &[drive])
    }

    // ==================== Extended commands ====================

    /// Write-protect flag and root-relative path of a mounted drive; an
    /// unmounted slot answers with an empty path.
    pub fn get_image_path<S: Storage>(
        &mut self,
        engine: &mut Pmd32Engine<SimBus, S>,
        drive: u8,
    ) -> Result<(bool, String), HostError> {
        let frame = Self::frame(Command::GetImagePath as u8, &[drive]);
        let mut reply = self.transact(engine, &frame);
        reply.expect_ack()?;
        reply.expect_ok()?;
        let wp = reply.next()?;
        if reply.remaining() == 2 {
            // unmounted: zero length, zero checksum, nothing to fold
            let len = reply.next()?;
            let crc = reply.next()?;
            if len != 0 || crc != 0 {
                return Err(HostError::BadChecksum);
            }
            return Ok((false, String::new()));
        }
        let path = reply.checked_string(wp)?;
        Ok((wp != 0, path))
    }

    pub fn mount<S: Storage>(
        &mut self,
        engine: &mut Pmd32Engine<SimBus, S>,
        drive: u8,
        read_only: bool,
        name: &str,
    ) -> Result<(), HostError> {
        let mut args = vec![drive, read_only as u8, name.len() as u8];
        args.extend_from_slice(name.as_bytes());
        self.simple_op(engine, Command::MountImage as u8, &args)
    }

    /// Length 0: unmount only.
    pub fn unmount<S: Storage>(
        &mut self,
        engine: &mut Pmd32Engine<SimBus, S>,
        drive: u8,
    ) -> Result<(), HostError> {
        self.simple_op(engine, Command::MountImage as u8, &[drive, 0, 0])
    }

    /// Length 0xFF: remount the slot's stored path with a new write flag.
    pub fn remount<S: Storage>(
        &mut self,
        engine: &mut Pmd32Engine<SimBus, S>,
        drive: u8,
        read_only: bool,
    ) -> Result<(), HostError> {
        self.simple_op(
            engine,
            Command::MountImage as u8,
            &[drive, read_only as u8, 0xFF],
        )
    }

    pub fn get_cwd<S: Storage>(
        &mut self,
        engine: &mut Pmd32Engine<SimBus, S>,
    ) -> Result<String, HostError> {
        let frame = Self::frame(Command::GetCwd as u8, &[]);
        let mut reply = self.transact(engine, &frame);
        reply.expect_ack()?;
        reply.checked_string(0)
    }

    /// One listing step; `reset` restarts the enumeration at the cwd.
    pub fn list_dir<S: Storage>(
        &mut self,
        engine: &mut Pmd32Engine<SimBus, S>,
        reset: bool,
    ) -> Result<ListEntry, HostError> {
        let flag = if reset { 0 } else { 1 };
        let frame = Self::frame(Command::DirListing as u8, &[flag]);
        let mut reply = self.transact(engine, &frame);
        reply.expect_ack()?;
        if reply.remaining() == 1 {
            // a lone result byte: the cwd could not be opened
            return Err(HostError::Failed(reply.next()?));
        }
        let name = reply.checked_string(0)?;
        if name.is_empty() {
            Ok(ListEntry::End)
        } else {
            Ok(ListEntry::Name(name))
        }
    }

    pub fn change_cwd<S: Storage>(
        &mut self,
        engine: &mut Pmd32Engine<SimBus, S>,
        path: &str,
    ) -> Result<(), HostError> {
        let mut args = vec![path.len() as u8];
        args.extend_from_slice(path.as_bytes());
        self.simple_op(engine, Command::ChangeCwd as u8, &args)
    }

    pub fn create_image<S: Storage>(
        &mut self,
        engine: &mut Pmd32Engine<SimBus, S>,
        name: &str,
    ) -> Result<(), HostError> {
        let mut args = vec![name.len() as u8];
        args.extend_from_slice(name.as_bytes());
        self.simple_op(engine, Command::CreateImage as u8, &args)
    }

    /// Geometry record (tracks, sectors per track, physical size code);
    /// zeros when nothing is mounted.
    pub fn image_info<S: Storage>(
        &mut self,
        engine: &mut Pmd32Engine<SimBus, S>,
        drive: u8,
    ) -> Result<(u8, u8, u8), HostError> {
        let frame = Self::frame(Command::ImageInfo as u8, &[drive]);
        let mut reply = self.transact(engine, &frame);
        reply.expect_ack()?;
        reply.expect_ok()?;
        let record = reply.take(3)?;
        let crc = reply.next()?;
        if record.iter().fold(crc, |acc, byte| acc ^ byte) != 0 {
            return Err(HostError::BadChecksum);
        }
        Ok((record[0], record[1], record[2]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selector_encoding_round_trip() {
        use crate::geometry::DiskAddress;
        for drive in 0..4u8 {
            for sector in [0u8, 1, 35, 63] {
                let addr = DiskAddress::decode(encode_selector(drive, sector), 0, SECTOR_SIZE);
                assert_eq!(addr.drive, drive);
                assert_eq!(addr.sector, sector);
            }
        }
    }

    #[test]
    fn test_frame_checksum_folds_to_zero() {
        let frame = HostClient::frame(0x51, &[0x00, 0x00]);
        assert_eq!(frame, vec![0x51, 0x00, 0x00, 0x51]);
        assert_eq!(frame.iter().fold(0u8, |acc, byte| acc ^ byte), 0);
    }
}
