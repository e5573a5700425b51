//! Demo Mode - Simulated Ziv meter for testing
//!
//! Answers the client's HDLC frames the way the meter does on its optical
//! port, so the whole read cycle can run without hardware. Registers drift
//! between reads: energy counters climb, power wanders around a base load.
//!
//! Replies are released at a fixed number of bytes per elapsed millisecond
//! to mimic a 9600 baud line. The clock is either simulated (advanced by
//! the caller) or the wall clock.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{HashMap, VecDeque};
use std::io;
use std::time::Instant;

use crate::dlms::hdlc::{self, control, Frame, FLAG, LLC_REQUEST, LLC_RESPONSE};
use crate::dlms::{obis, LinkSettings};
use crate::protocol::Transport;

/// Roughly 9600 baud
const DEFAULT_BYTES_PER_MS: usize = 1;

/// Largest information field the simulated meter handles
const MAX_INFO: u16 = 128;

/// Data access result: object-undefined
const OBJECT_UNDEFINED: u8 = 4;

/// Data access result: object-unavailable
const OBJECT_UNAVAILABLE: u8 = 11;

/// Association diagnostic: authentication failure
const AUTHENTICATION_FAILURE: u8 = 13;

/// How a register value changes between reads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Drift {
    /// Value never changes
    Fixed,
    /// Grows by up to the given amount per read
    Counter(i64),
    /// Wanders by up to the given amount around its base
    Wander {
        /// Centre value
        base: i64,
        /// Largest distance from `base`
        spread: i64,
    },
}

/// A simulated register
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Register {
    /// Value returned by the next read
    pub value: i64,
    /// How the value moves after each read
    pub drift: Drift,
}

enum Clock {
    Simulated(u64),
    Wall(Instant),
}

/// Simulated meter implementing [`Transport`]
pub struct DemoMeter {
    password: Vec<u8>,
    client: Vec<u8>,
    server: Vec<u8>,
    clock: Clock,
    /// Client bytes not yet parsed into frames
    inbound: Vec<u8>,
    /// Reply bytes not yet read by the client
    pending: VecDeque<u8>,
    /// Bytes of `pending` released to the client
    released: usize,
    last_release_ms: u64,
    bytes_per_ms: usize,
    /// Information fields of a segmented request
    segments: Vec<u8>,
    registers: HashMap<[u8; 6], Register>,
    connected: bool,
    associated: bool,
    send_seq: u8,
    recv_seq: u8,
    echo: bool,
    silent: bool,
    corrupt_next: bool,
    requests: u64,
    rng: StdRng,
}

impl Default for DemoMeter {
    fn default() -> Self {
        Self::new(&LinkSettings::default())
    }
}

impl DemoMeter {
    /// Meter with a simulated clock starting at zero
    pub fn new(link: &LinkSettings) -> Self {
        let mut meter = Self {
            password: link.password.as_bytes().to_vec(),
            client: hdlc::client_address(link.client_address),
            server: hdlc::server_address(link.server_address),
            clock: Clock::Simulated(0),
            inbound: Vec::new(),
            pending: VecDeque::new(),
            released: 0,
            last_release_ms: 0,
            bytes_per_ms: DEFAULT_BYTES_PER_MS,
            segments: Vec::new(),
            registers: HashMap::new(),
            connected: false,
            associated: false,
            send_seq: 0,
            recv_seq: 0,
            echo: false,
            silent: false,
            corrupt_next: false,
            requests: 0,
            rng: StdRng::from_entropy(),
        };
        meter.insert_default_registers();
        meter
    }

    /// Meter driven by the wall clock
    pub fn realtime(link: &LinkSettings) -> Self {
        Self {
            clock: Clock::Wall(Instant::now()),
            ..Self::new(link)
        }
    }

    /// Use a seeded random source
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    fn insert_default_registers(&mut self) {
        let registers = [
            ([1, 0, 1, 8, 0, 255], 1_523_004, Drift::Counter(3)),
            ([1, 0, 2, 8, 0, 255], 48_210, Drift::Counter(1)),
            ([1, 0, 1, 7, 0, 255], 42, Drift::Wander { base: 42, spread: 8 }),
            ([1, 0, 2, 7, 0, 255], 0, Drift::Fixed),
        ];
        for (name, value, drift) in registers {
            self.registers.insert(name, Register { value, drift });
        }
    }

    /// Set or add a register; false if the logical name does not parse
    pub fn set_register(&mut self, logical_name: &str, value: i64, drift: Drift) -> bool {
        match obis::parse_logical_name(logical_name) {
            Ok(name) => {
                self.registers.insert(name, Register { value, drift });
                true
            }
            Err(e) => {
                tracing::warn!("demo meter: {e}");
                false
            }
        }
    }

    /// Current state of a register, if the meter has it
    pub fn register(&self, logical_name: &str) -> Option<Register> {
        let name = obis::parse_logical_name(logical_name).ok()?;
        self.registers.get(&name).copied()
    }

    /// Reply release rate
    pub fn set_bytes_per_ms(&mut self, rate: usize) {
        self.bytes_per_ms = rate.max(1);
    }

    /// Echo every client byte back, as some optical heads do
    pub fn set_echo(&mut self, echo: bool) {
        self.echo = echo;
    }

    /// Ignore all requests
    pub fn set_silent(&mut self, silent: bool) {
        self.silent = silent;
    }

    /// Damage the check sequence of the next reply frame
    pub fn corrupt_next_reply(&mut self) {
        self.corrupt_next = true;
    }

    /// Advance the simulated clock; no effect in realtime mode
    pub fn advance_clock(&mut self, ms: u64) {
        if let Clock::Simulated(now) = &mut self.clock {
            *now += ms;
        }
    }

    /// Frames the meter has answered
    pub fn requests(&self) -> u64 {
        self.requests
    }

    /// Whether an application association is open
    pub fn is_associated(&self) -> bool {
        self.associated
    }

    /// Parse every complete frame the client has written
    fn process_inbound(&mut self) {
        loop {
            let Some(start) = self.inbound.iter().position(|&b| b == FLAG) else {
                self.inbound.clear();
                return;
            };
            self.inbound.drain(..start);
            if self.inbound.len() < 3 {
                return;
            }
            if !hdlc::is_format_byte(self.inbound[1]) {
                self.inbound.drain(..1);
                continue;
            }
            let len = hdlc::frame_length(self.inbound[1], self.inbound[2]);
            if self.inbound.len() < len + 2 {
                return;
            }
            let decoded = Frame::decode(&self.inbound[1..=len]);
            self.inbound.drain(..=len);
            match decoded {
                Ok(frame) => self.handle_frame(frame),
                Err(e) => tracing::debug!("demo meter: dropping frame: {e}"),
            }
        }
    }

    fn handle_frame(&mut self, frame: Frame) {
        if frame.dest != self.server || frame.src != self.client {
            return;
        }
        if self.silent {
            tracing::trace!("demo meter: ignoring frame {:#04x}", frame.control);
            return;
        }
        self.requests += 1;

        match frame.control {
            control::SNRM => {
                self.connected = true;
                self.associated = false;
                self.send_seq = 0;
                self.recv_seq = 0;
                self.segments.clear();
                let info = ua_parameters(MAX_INFO, MAX_INFO);
                self.reply(control::UA, info, false);
            }
            control::DISC => {
                let was_connected = self.connected;
                self.connected = false;
                self.associated = false;
                let answer = if was_connected { control::UA } else { control::DM };
                self.reply(answer, Vec::new(), false);
            }
            _ if !self.connected => self.reply(control::DM, Vec::new(), false),
            _ if frame.is_information() => {
                self.recv_seq = (frame.send_sequence() + 1) & 0x07;
                self.segments.extend_from_slice(&frame.info);
                if frame.segmented {
                    // RR: ready for the next segment
                    let rr = ((self.recv_seq & 0x07) << 5) | 0x11;
                    self.reply(rr, Vec::new(), false);
                    return;
                }
                let payload = std::mem::take(&mut self.segments);
                let Some(apdu) = payload.strip_prefix(&LLC_REQUEST[..]) else {
                    tracing::debug!("demo meter: missing LLC header");
                    return;
                };
                let response = self.handle_apdu(apdu);
                let mut info = LLC_RESPONSE.to_vec();
                info.extend(response);
                self.reply(0, info, true);
            }
            other => tracing::debug!("demo meter: unhandled control {other:#04x}"),
        }
    }

    fn handle_apdu(&mut self, apdu: &[u8]) -> Vec<u8> {
        match apdu.first() {
            Some(0x60) => self.handle_aarq(apdu),
            Some(0xC0) if self.associated => self.handle_get(apdu),
            // Exception response: service not allowed
            _ => vec![0xD8, 0x01, 0x01],
        }
    }

    fn handle_aarq(&mut self, apdu: &[u8]) -> Vec<u8> {
        let password = find_password(apdu);
        let accepted = self.password.is_empty() || password == Some(self.password.as_slice());
        self.associated = accepted;
        if accepted {
            tracing::debug!("demo meter: association accepted");
        } else {
            tracing::debug!("demo meter: wrong password");
        }
        aare(accepted)
    }

    fn handle_get(&mut self, apdu: &[u8]) -> Vec<u8> {
        if apdu.len() < 12 || apdu[1] != 0x01 {
            return vec![0xD8, 0x01, 0x02];
        }
        let invoke_id = apdu[2];
        let mut name = [0u8; 6];
        name.copy_from_slice(&apdu[5..11]);
        let attribute = apdu[11];
        tracing::trace!("demo meter: get {}/{attribute}", obis::format_logical_name(&name));

        let mut response = vec![0xC4, 0x01, invoke_id];
        let Some(register) = self.registers.get_mut(&name) else {
            response.extend([0x01, OBJECT_UNDEFINED]);
            return response;
        };
        match attribute {
            1 => {
                response.extend([0x00, 0x09, 0x06]);
                response.extend(name);
            }
            2 => {
                let value = register.value;
                register.value = next_value(&mut self.rng, register);
                response.push(0x00);
                if let Ok(v) = u32::try_from(value) {
                    response.push(0x06);
                    response.extend(v.to_be_bytes());
                } else {
                    response.push(0x14);
                    response.extend(value.to_be_bytes());
                }
            }
            _ => response.extend([0x01, OBJECT_UNAVAILABLE]),
        }
        response
    }

    /// Queue a reply frame; `information` frames get sequence numbers
    fn reply(&mut self, control: u8, info: Vec<u8>, information: bool) {
        let control = if information {
            let c = Frame::i_control(self.send_seq, self.recv_seq);
            self.send_seq = (self.send_seq + 1) & 0x07;
            c
        } else {
            control
        };
        let frame = Frame {
            dest: self.client.clone(),
            src: self.server.clone(),
            control,
            segmented: false,
            info,
        };
        let mut bytes = match frame.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::debug!("demo meter: cannot encode reply: {e}");
                return;
            }
        };
        if self.corrupt_next {
            self.corrupt_next = false;
            let at = bytes.len() - 2;
            bytes[at] ^= 0x5A;
        }
        self.queue(&bytes);
    }

    fn queue(&mut self, bytes: &[u8]) {
        if self.pending.is_empty() {
            self.last_release_ms = self.now_ms();
        }
        self.pending.extend(bytes);
    }

    fn release(&mut self) {
        let now = self.now_ms();
        if now <= self.last_release_ms {
            return;
        }
        let elapsed = (now - self.last_release_ms) as usize;
        self.last_release_ms = now;
        self.released = (self.released + elapsed.saturating_mul(self.bytes_per_ms)).min(self.pending.len());
    }
}

impl Transport for DemoMeter {
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        if self.echo {
            self.queue(bytes);
        }
        self.inbound.extend_from_slice(bytes);
        self.process_inbound();
        Ok(bytes.len())
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = buf.len().min(self.released);
        for (slot, byte) in buf.iter_mut().zip(self.pending.drain(..n)) {
            *slot = byte;
        }
        self.released -= n;
        Ok(n)
    }

    fn available(&mut self) -> io::Result<usize> {
        self.release();
        Ok(self.released)
    }

    fn now_ms(&self) -> u64 {
        match &self.clock {
            Clock::Simulated(now) => *now,
            Clock::Wall(start) => start.elapsed().as_millis() as u64,
        }
    }
}

fn next_value(rng: &mut StdRng, register: &Register) -> i64 {
    match register.drift {
        Drift::Fixed => register.value,
        Drift::Counter(step) => register.value + rng.gen_range(0..=step.max(0)),
        Drift::Wander { base, spread } => {
            let spread = spread.max(0);
            (base + rng.gen_range(-spread..=spread)).max(0)
        }
    }
}

/// UA information field with max info lengths and window size 1
fn ua_parameters(max_tx: u16, max_rx: u16) -> Vec<u8> {
    let mut group = Vec::with_capacity(20);
    group.extend([0x05, 0x02]);
    group.extend(max_tx.to_be_bytes());
    group.extend([0x06, 0x02]);
    group.extend(max_rx.to_be_bytes());
    group.extend([0x07, 0x04, 0x00, 0x00, 0x00, 0x01]);
    group.extend([0x08, 0x04, 0x00, 0x00, 0x00, 0x01]);

    let mut info = vec![0x81, 0x80, group.len() as u8];
    info.extend(group);
    info
}

/// Calling authentication value of an AARQ
fn find_password(aarq: &[u8]) -> Option<&[u8]> {
    let body = aarq.get(2..)?;
    let mut i = 0;
    while i + 2 <= body.len() {
        let tag = body[i];
        let len = usize::from(body[i + 1]);
        let value = body.get(i + 2..i + 2 + len)?;
        if tag == 0xAC {
            // [0] GraphicString
            return value.get(2..2 + usize::from(*value.get(1)?));
        }
        i += 2 + len;
    }
    None
}

/// AARE for an accepted or password-rejected association
fn aare(accepted: bool) -> Vec<u8> {
    let mut body = vec![0xA1, 0x09, 0x06, 0x07, 0x60, 0x85, 0x74, 0x05, 0x08, 0x01, 0x01];
    let (result, diagnostic) = if accepted {
        (0x00, 0x00)
    } else {
        (0x01, AUTHENTICATION_FAILURE)
    };
    body.extend([0xA2, 0x03, 0x02, 0x01, result]);
    body.extend([0xA3, 0x05, 0xA1, 0x03, 0x02, 0x01, diagnostic]);
    if accepted {
        // InitiateResponse: version 6, conformance, max PDU 0x00EF, VAA 7
        body.extend([
            0xBE, 0x10, 0x04, 0x0E, 0x08, 0x00, 0x06, 0x5F, 0x1F, 0x04, 0x00, 0x00, 0x10, 0x1D,
            0x00, 0xEF, 0x00, 0x07,
        ]);
    }
    let mut apdu = vec![0x61, body.len() as u8];
    apdu.extend(body);
    apdu
}
