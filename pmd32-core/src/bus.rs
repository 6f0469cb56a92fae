//! Parallel handshake bus abstraction.
//!
//! The original controller talks to the host over an 8-bit data path and
//! five control lines wired to the host's 8255 peripheral: DIR (transfer
//! direction), /STB (strobe a byte towards the host), /ACK (latch a byte
//! from the host), IBF (host input buffer full) and /OBF (host output
//! buffer full). The [`HandshakeBus`] trait captures those lines so a
//! concrete GPIO binding stays pluggable; [`SimBus`] emulates the host side
//! of the 8255 for tests and for the CLI, which runs host and engine in one
//! process.
//!
//! Polarity contract, as on the cable:
//! - IBF read low means the host accepted the last strobed byte.
//! - /OBF read low means the host has a byte ready to be latched.
//! - DIR is held low only while the engine drives the data lines.
//! - /STB and /ACK idle high and pulse low.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

/// The five-signal parallel bus the engine drives.
///
/// Implementations are not required to be `Send`; the engine is
/// single-threaded and cooperative by design.
pub trait HandshakeBus {
    /// Drive the DIR line: `true` puts the cable into engine-to-host mode.
    fn set_direction_out(&mut self, out: bool);

    /// Drive a value onto the data lines.
    fn drive_data(&mut self, value: u8);

    /// Return the data lines to high impedance.
    fn release_data(&mut self);

    /// Sample the data lines.
    fn read_data(&mut self) -> u8;

    /// Drive the /STB level; `true` is the idle high level.
    fn set_strobe(&mut self, level: bool);

    /// Drive the /ACK level; `true` is the idle high level.
    fn set_ack(&mut self, level: bool);

    /// Raw IBF level; low after the host accepts a strobed byte.
    fn input_full(&self) -> bool;

    /// Raw /OBF level; low while the host holds a byte for us.
    fn output_full(&self) -> bool;

    /// Fixed pulse-width settle delay between edges.
    fn settle(&mut self);
}

/// Shared state of one simulated cable.
struct SimState {
    /// Whether a host is wired up at all; detached leaves IBF stuck high.
    host_attached: bool,
    /// Bytes strobed out by the engine, not yet read by the host side.
    to_host: VecDeque<u8>,
    /// Bytes the host queued for the engine.
    from_host: VecDeque<u8>,
    direction_out: bool,
    driven: Option<u8>,
    strobe: bool,
    ack: bool,
}

impl SimState {
    fn new() -> Self {
        Self {
            host_attached: true,
            to_host: VecDeque::new(),
            from_host: VecDeque::new(),
            direction_out: false,
            driven: None,
            strobe: true,
            ack: true,
        }
    }
}

/// Engine-side endpoint of the simulated cable.
///
/// The paired [`SimHost`] plays the host's 8255: strobed bytes land in its
/// inbox and are accepted immediately (IBF low) while attached; bytes it
/// queues hold /OBF low until the engine latches them with an /ACK pulse.
pub struct SimBus {
    state: Rc<RefCell<SimState>>,
}

/// Host-side endpoint of the simulated cable.
#[derive(Clone)]
pub struct SimHost {
    state: Rc<RefCell<SimState>>,
}

impl SimBus {
    /// Create a connected bus/host pair.
    pub fn pair() -> (SimBus, SimHost) {
        let state = Rc::new(RefCell::new(SimState::new()));
        (
            SimBus {
                state: state.clone(),
            },
            SimHost { state },
        )
    }
}

impl HandshakeBus for SimBus {
    fn set_direction_out(&mut self, out: bool) {
        self.state.borrow_mut().direction_out = out;
    }

    fn drive_data(&mut self, value: u8) {
        self.state.borrow_mut().driven = Some(value);
    }

    fn release_data(&mut self) {
        self.state.borrow_mut().driven = None;
    }

    fn read_data(&mut self) -> u8 {
        let state = self.state.borrow();
        // valid only during the /ACK low window; floats high otherwise
        if !state.ack {
            state.from_host.front().copied().unwrap_or(0xFF)
        } else {
            0xFF
        }
    }

    fn set_strobe(&mut self, level: bool) {
        let mut state = self.state.borrow_mut();
        let rising = level && !state.strobe;
        state.strobe = level;
        // the 8255 latches on the trailing edge of /STB
        if rising && state.host_attached && state.direction_out {
            if let Some(value) = state.driven {
                state.to_host.push_back(value);
            }
        }
    }

    fn set_ack(&mut self, level: bool) {
        let mut state = self.state.borrow_mut();
        let rising = level && !state.ack;
        state.ack = level;
        // byte is consumed when /ACK returns high
        if rising {
            state.from_host.pop_front();
        }
    }

    fn input_full(&self) -> bool {
        // an attached host services its input buffer between strobes, so the
        // engine sees IBF low; with nothing on the cable the pullup wins
        !self.state.borrow().host_attached
    }

    fn output_full(&self) -> bool {
        self.state.borrow().from_host.is_empty()
    }

    fn settle(&mut self) {}
}

impl SimHost {
    /// Queue bytes for the engine to latch.
    pub fn queue(&self, bytes: &[u8]) {
        self.state
            .borrow_mut()
            .from_host
            .extend(bytes.iter().copied());
    }

    /// Take one byte the engine strobed out.
    pub fn recv(&self) -> Option<u8> {
        self.state.borrow_mut().to_host.pop_front()
    }

    /// Drain everything the engine strobed out.
    pub fn take_sent(&self) -> Vec<u8> {
        self.state.borrow_mut().to_host.drain(..).collect()
    }

    /// Number of engine bytes waiting on the host side.
    pub fn pending(&self) -> usize {
        self.state.borrow().to_host.len()
    }

    /// Bytes queued for the engine that it has not latched yet.
    pub fn unread(&self) -> usize {
        self.state.borrow().from_host.len()
    }

    /// Simulate plugging the cable in.
    pub fn attach(&self) {
        self.state.borrow_mut().host_attached = true;
    }

    /// Simulate pulling the cable; IBF sticks high and sends time out.
    pub fn detach(&self) {
        self.state.borrow_mut().host_attached = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strobe_out(bus: &mut SimBus, value: u8) {
        bus.set_direction_out(true);
        bus.drive_data(value);
        bus.set_strobe(false);
        bus.settle();
        bus.set_strobe(true);
        bus.release_data();
        bus.set_direction_out(false);
    }

    fn latch_in(bus: &mut SimBus) -> u8 {
        bus.set_ack(false);
        bus.settle();
        let value = bus.read_data();
        bus.set_ack(true);
        value
    }

    #[test]
    fn test_strobe_reaches_host() {
        let (mut bus, host) = SimBus::pair();
        strobe_out(&mut bus, 0x42);
        strobe_out(&mut bus, 0xAA);
        assert_eq!(host.take_sent(), vec![0x42, 0xAA]);
        assert!(!bus.input_full());
    }

    #[test]
    fn test_detached_host_leaves_ibf_high() {
        let (mut bus, host) = SimBus::pair();
        host.detach();
        strobe_out(&mut bus, 0x42);
        assert!(bus.input_full());
        assert_eq!(host.pending(), 0);
    }

    #[test]
    fn test_ack_pulse_consumes_queued_byte() {
        let (mut bus, host) = SimBus::pair();
        host.queue(&[0x51, 0x00]);

        assert!(!bus.output_full());
        assert_eq!(latch_in(&mut bus), 0x51);
        assert_eq!(latch_in(&mut bus), 0x00);
        assert!(bus.output_full());
    }

    #[test]
    fn test_data_lines_float_high_outside_ack_window() {
        let (mut bus, host) = SimBus::pair();
        host.queue(&[0x12]);
        assert_eq!(bus.read_data(), 0xFF);
        assert_eq!(latch_in(&mut bus), 0x12);
    }
}
