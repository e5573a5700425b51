//! Communication engine
//!
//! Drives one step attempt a tick at a time. Each [`tick`](CommunicationEngine::tick)
//! either sends a bounded chunk of the queued request or, once the request
//! is out, drains whatever the meter has answered so far, looks for a frame
//! end and hands complete replies to the codec and the step handler. No call
//! waits on the link: the host scheduler gives each tick only a few
//! milliseconds, and at 9600 baud without a transmit buffer a whole request
//! does not fit in that.

use serde::{Deserialize, Serialize};

use super::{
    Assembly, Codec, OutboundQueue, ProtocolError, ReceiveBuffer, ReplyRecord, StepHandler,
    Transport, DEFAULT_MIN_FRAME_LEN, DEFAULT_RECEIVE_CAPACITY, DEFAULT_SEND_CHUNK,
    DEFAULT_TIMEOUT_MS, FRAME_END_MARKER, RECEIVE_SLACK,
};

/// Timing and framing knobs of the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Reply deadline after the last request byte, in milliseconds
    pub timeout_ms: u64,
    /// Most bytes written per tick
    pub send_chunk: usize,
    /// Frame-end scanning starts once more than this many bytes are held
    pub min_frame_len: usize,
    /// Byte marking the end of a frame on the wire
    pub frame_end_marker: u8,
    /// Initial receive buffer capacity
    pub initial_capacity: usize,
    /// Extra bytes reserved whenever the receive buffer grows
    pub slack: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_TIMEOUT_MS,
            send_chunk: DEFAULT_SEND_CHUNK,
            min_frame_len: DEFAULT_MIN_FRAME_LEN,
            frame_end_marker: FRAME_END_MARKER,
            initial_capacity: DEFAULT_RECEIVE_CAPACITY,
            slack: RECEIVE_SLACK,
        }
    }
}

/// Tick-driven request/response driver
pub struct CommunicationEngine<T, C: Codec> {
    transport: T,
    codec: C,
    config: EngineConfig,
    outbound: OutboundQueue,
    rx: ReceiveBuffer,
    reply: C::Reply,
    /// A frame-end marker was seen and assembly is due
    boundary: bool,
    /// Bytes before this index have been scanned for a marker
    scan_from: usize,
    /// Reply deadline, armed once the request is fully sent
    deadline: Option<u64>,
    /// Why the current attempt was forced to fail
    fault: Option<ProtocolError>,
}

impl<T: Transport, C: Codec> CommunicationEngine<T, C> {
    /// Create an idle engine over `transport`
    ///
    /// A `send_chunk` of 0 is treated as 1 so every tick makes progress.
    pub fn new(transport: T, codec: C, mut config: EngineConfig) -> Self {
        config.send_chunk = config.send_chunk.max(1);
        let rx = ReceiveBuffer::with_capacity(config.initial_capacity, config.slack);
        Self {
            transport,
            codec,
            config,
            outbound: OutboundQueue::new(),
            rx,
            reply: C::Reply::default(),
            boundary: false,
            scan_from: 0,
            deadline: None,
            fault: None,
        }
    }

    /// Settings in effect
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Underlying transport
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Underlying transport, mutably
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Protocol codec
    pub fn codec(&self) -> &C {
        &self.codec
    }

    /// Request bytes of the current attempt and the send cursor
    pub fn outbound(&self) -> &OutboundQueue {
        &self.outbound
    }

    /// Bytes received during the current attempt
    pub fn receive_buffer(&self) -> &ReceiveBuffer {
        &self.rx
    }

    /// Reply record assembled so far
    pub fn reply(&self) -> &C::Reply {
        &self.reply
    }

    /// Reply deadline in transport milliseconds, once the request is out
    pub fn deadline(&self) -> Option<u64> {
        self.deadline
    }

    /// Whether a frame-end marker is waiting to be assembled
    pub fn boundary_found(&self) -> bool {
        self.boundary
    }

    /// Index up to which received bytes have been scanned for a frame end
    pub fn scanned_up_to(&self) -> usize {
        self.scan_from
    }

    /// Fault recorded when the current attempt was forced to fail
    pub fn fault(&self) -> Option<&ProtocolError> {
        self.fault.as_ref()
    }

    /// Drop all per-attempt state
    pub fn reset(&mut self) {
        self.outbound.clear();
        self.rx.reset();
        self.reply = C::Reply::default();
        self.boundary = false;
        self.scan_from = 0;
        self.deadline = None;
        self.fault = None;
    }

    /// Start a fresh attempt for `handler`
    pub fn begin(&mut self, handler: &mut StepHandler) {
        self.reset();
        handler.start(&mut self.codec, &mut self.outbound);
    }

    /// Do one bounded slice of work for the active step
    pub fn tick(&mut self, handler: &mut StepHandler) {
        if !self.outbound.is_drained() {
            self.send(handler);
            return;
        }

        let Some(deadline) = self.deadline else {
            if handler.result().is_pending() {
                self.fail(handler, ProtocolError::EmptyRequest);
            }
            return;
        };

        if !self.reply.is_complete() {
            if self.transport.now_ms() > deadline {
                let after_ms = self.config.timeout_ms;
                self.fail(handler, ProtocolError::Timeout { after_ms });
                return;
            }

            if !self.boundary {
                if let Err(e) = self.drain() {
                    self.fail(handler, e.into());
                    return;
                }
                self.scan_for_boundary();
            }

            if self.boundary {
                tracing::trace!(
                    "frame end found: pos {} size {}",
                    self.rx.position(),
                    self.rx.size()
                );
                match self.codec.assemble(&mut self.rx, &mut self.reply) {
                    Ok(Assembly::NeedMore) => self.boundary = false,
                    Ok(Assembly::Complete) => tracing::trace!("reply complete"),
                    Err(e) => {
                        self.fail(handler, e);
                        return;
                    }
                }
            }
        }

        if self.reply.is_complete() {
            handler.parse(&mut self.codec, &self.reply);
        }
    }

    /// Write at most one chunk, arming the deadline when the queue empties
    fn send(&mut self, handler: &mut StepHandler) {
        let mut budget = self.config.send_chunk;
        while budget > 0 && !self.outbound.is_drained() {
            let pending = self.outbound.pending();
            if pending.is_empty() {
                self.outbound.advance(0);
                continue;
            }
            let n = pending.len().min(budget);
            let written = match self.transport.write(&pending[..n]) {
                Ok(written) => written.min(n),
                Err(e) => {
                    self.fail(handler, e.into());
                    return;
                }
            };
            tracing::trace!("sent {written} of {n} bytes, cursor {}", self.outbound.sent() + written);
            self.outbound.advance(written);
            budget -= written;
            if written < n {
                break;
            }
        }

        if self.outbound.is_drained() && self.deadline.is_none() {
            let deadline = self.transport.now_ms().saturating_add(self.config.timeout_ms);
            self.deadline = Some(deadline);
            tracing::trace!("request sent ({} bytes), reply due by {deadline}ms", self.outbound.sent());
        }
    }

    /// Move every byte the transport has ready into the receive buffer
    fn drain(&mut self) -> std::io::Result<usize> {
        let mut total = 0;
        loop {
            let ready = self.transport.available()?;
            if ready == 0 {
                break;
            }
            let spare = self.rx.spare_mut(ready);
            let n = self.transport.read(spare)?;
            self.rx.commit(n);
            total += n;
            if n == 0 {
                break;
            }
        }
        if total > 0 {
            tracing::trace!("received {total} bytes, holding {}", self.rx.size());
        }
        Ok(total)
    }

    /// Look for a frame-end marker among bytes not scanned before
    fn scan_for_boundary(&mut self) {
        let size = self.rx.size();
        if size <= self.config.min_frame_len {
            return;
        }
        let from = self.scan_from.min(size);
        self.scan_from = size;

        let marker = self.config.frame_end_marker;
        if self.rx.as_slice()[from..size]
            .iter()
            .rev()
            .any(|&b| b == marker)
        {
            self.boundary = true;
        }
    }

    fn fail(&mut self, handler: &mut StepHandler, fault: ProtocolError) {
        tracing::warn!("{}: {fault}", handler.step());
        handler.error();
        self.fault = Some(fault);
    }
}
