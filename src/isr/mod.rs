//! Interrupt-context receive/transmit channel: runs the four wire-format
//! parsers in parallel on every incoming byte, owns the seqlock snapshot and
//! the single-slot TX buffer, and is the sole writer of the stats counters.
//! The main loop never calls into this module except through
//! [`Channel::copy_last_frame`] and [`Channel::get_stats`], both of which are
//! lock-free with respect to the ISR.

mod parsers;
mod snapshot;

pub use parsers::FeedResult;
pub use snapshot::{CapturedFrame, FrameSnapshot, CAPACITY};

use crate::codec::{shengyi, CodecError, ProtocolId};
use crate::events::{EventQueue, MotorEvent};
use crate::stats::Stats;
use crate::util::elapsed_at_least;
use parsers::{AuthParser, FrameParser, ShengyiParser, Stx02Parser, V2Parser};

/// Single-slot pending-TX buffer capacity.
pub const TX_BUF_CAPACITY: usize = 96;
/// Default TX cadence; `link` may queue more often for some protocols but
/// the pump itself never fires faster than this.
pub const DEFAULT_TX_INTERVAL_MS: u32 = 50;
/// RX silence, measured from the last TX or the first byte of a partial
/// frame, after which the receive side gives up and resets.
pub const RX_TIMEOUT_MS: u32 = 100;
/// Bounded per-byte TX-ready spin. Exhausting this abandons the frame rather
/// than blocking the ISR indefinitely (design note: bounded over unbounded).
pub const MAX_TX_SPIN: u32 = 128;
/// Upper bound on RX bytes drained per `tick` call.
pub const MAX_RX_BYTES_PER_TICK: usize = 128;

/// Minimal hardware seam: the ISR channel never talks to a concrete UART
/// peripheral type directly, so the core stays host-testable.
pub trait Uart {
    /// Non-blocking read of one byte, if the RX FIFO has one ready.
    fn try_read(&mut self) -> Option<u8>;
    /// True if a byte can be written without blocking.
    fn tx_ready(&mut self) -> bool;
    /// Write one byte. Only called after `tx_ready()` returned `true`.
    fn write_byte(&mut self, byte: u8);
}

/// Interrupt-context receive/transmit state machine.
///
/// `N` is the event-queue slot count; `init` wires in the externally-owned
/// queue (typically a `'static` the runtime driver declares once at boot).
pub struct Channel<U: Uart, const N: usize = 32> {
    uart: U,
    shengyi: ShengyiParser,
    stx02: Stx02Parser,
    auth: AuthParser,
    v2: V2Parser,

    snapshot: FrameSnapshot,
    events: Option<&'static EventQueue<N>>,
    stats: Stats,
    motor_ready_emitted: bool,

    tx_buf: [u8; TX_BUF_CAPACITY],
    tx_len: usize,
    tx_pending: bool,
    tx_interval_ms: u32,
    last_tx_ms: u32,

    // Covers both WAIT_RESPONSE (armed right after a TX send) and RX_ACTIVE
    // (armed on the first byte of an otherwise-idle reception window); both
    // share one deadline since the spec's rule for either is the same
    // `(now - start) >= RX_TIMEOUT_MS` check.
    rx_timer_active: bool,
    rx_start_ms: u32,
}

impl<U: Uart, const N: usize> Channel<U, N> {
    pub fn new(uart: U) -> Self {
        Self {
            uart,
            shengyi: ShengyiParser::default(),
            stx02: Stx02Parser::default(),
            auth: AuthParser::default(),
            v2: V2Parser::default(),
            snapshot: FrameSnapshot::new(),
            events: None,
            stats: Stats::default(),
            motor_ready_emitted: false,
            tx_buf: [0; TX_BUF_CAPACITY],
            tx_len: 0,
            tx_pending: false,
            tx_interval_ms: DEFAULT_TX_INTERVAL_MS,
            last_tx_ms: 0,
            rx_timer_active: false,
            rx_start_ms: 0,
        }
    }

    /// Wire the event queue and reset all state. Never fails.
    pub fn init(&mut self, event_queue: &'static EventQueue<N>) {
        self.shengyi.reset();
        self.stx02.reset();
        self.auth.reset();
        self.v2.reset();
        self.stats = Stats::default();
        self.motor_ready_emitted = false;
        self.tx_pending = false;
        self.tx_len = 0;
        self.rx_timer_active = false;
        self.events = Some(event_queue);
    }

    /// Drain up to `MAX_RX_BYTES_PER_TICK` RX bytes, advance the RX timeout
    /// clock, and pump TX if a frame is pending and due.
    pub fn tick(&mut self, now_ms: u32) {
        for _ in 0..MAX_RX_BYTES_PER_TICK {
            match self.uart.try_read() {
                Some(byte) => self.on_rx_byte(byte, now_ms),
                None => break,
            }
        }

        if self.rx_timer_active && elapsed_at_least(now_ms, self.rx_start_ms, RX_TIMEOUT_MS) {
            self.stats.timeouts += 1;
            self.push_event(MotorEvent::motor_timeout(now_ms));
            self.shengyi.reset();
            self.stx02.reset();
            self.auth.reset();
            self.v2.reset();
            self.rx_timer_active = false;
        }

        if self.tx_pending && elapsed_at_least(now_ms, self.last_tx_ms, self.tx_interval_ms) {
            self.pump_tx(now_ms);
        }
    }

    /// Build a Shengyi `0x52` request into the pending slot. `assist` is the
    /// already OEM-mapped wire byte (the mapper lives in `cmd`/`link`, not
    /// here). Returns `false` if the frame didn't build.
    pub fn queue_cmd(
        &mut self,
        assist: u8,
        light: bool,
        walk: bool,
        battery_low: bool,
        speed_over: bool,
    ) -> bool {
        let flags = ((light as u8) << 7)
            | ((battery_low as u8) << 5)
            | ((walk as u8) << 4)
            | (speed_over as u8);
        let mut buf = [0u8; 10];
        let n = shengyi::build_frame(0x52, &[assist, flags], &mut buf);
        if n == 0 {
            return false;
        }
        self.load_tx(&buf[..n])
    }

    /// Queue a pre-built frame of any protocol.
    pub fn queue_frame(&mut self, bytes: &[u8], len: usize) -> bool {
        if len == 0 || len > bytes.len() {
            return false;
        }
        self.load_tx(&bytes[..len])
    }

    /// True while the pending TX slot holds an unsent frame.
    pub fn tx_busy(&self) -> bool {
        self.tx_pending
    }

    /// Arm deterministic V2 capture: the next `total_len` bytes are
    /// captured as one frame, tagged with `msg_id` as `aux16`.
    pub fn v2_expect(&mut self, msg_id: u16, total_len: usize) {
        self.v2.arm_deterministic(msg_id, total_len);
    }

    /// Seqlock-protected copy of the most recently published frame.
    pub fn copy_last_frame(&self, out: &mut CapturedFrame) -> bool {
        self.snapshot.copy_last_frame(out)
    }

    pub fn get_stats(&self) -> Stats {
        self.stats
    }

    /// Direct access to the underlying UART, for baud reconfiguration.
    /// `link`'s `sync_baud` is the only expected caller.
    pub fn uart_mut(&mut self) -> &mut U {
        &mut self.uart
    }

    fn load_tx(&mut self, bytes: &[u8]) -> bool {
        if bytes.len() > TX_BUF_CAPACITY {
            return false;
        }
        self.tx_buf[..bytes.len()].copy_from_slice(bytes);
        self.tx_len = bytes.len();
        self.tx_pending = true;
        true
    }

    fn on_rx_byte(&mut self, byte: u8, now_ms: u32) {
        if !self.rx_timer_active {
            self.rx_timer_active = true;
            self.rx_start_ms = now_ms;
        }

        let results = [
            (ProtocolId::Shengyi3a1a, self.shengyi.feed_byte(byte)),
            (ProtocolId::Stx02Xor, self.stx02.feed_byte(byte)),
            (ProtocolId::AuthXorCr, self.auth.feed_byte(byte)),
            (ProtocolId::V2Fixed, self.v2.feed_byte(byte)),
        ];

        for (protocol, result) in results {
            match result {
                FeedResult::Pending => {}
                FeedResult::Error(e) => self.on_rx_error(e, now_ms),
                FeedResult::Frame { len, opcode, aux16 } => {
                    let mut local = [0u8; CAPACITY];
                    let source: &[u8] = match protocol {
                        ProtocolId::Shengyi3a1a => self.shengyi.buffer(),
                        ProtocolId::Stx02Xor => self.stx02.buffer(),
                        ProtocolId::AuthXorCr => self.auth.buffer(),
                        ProtocolId::V2Fixed => self.v2.buffer(),
                    };
                    local[..len].copy_from_slice(&source[..len]);
                    self.capture(protocol, &local[..len], opcode, aux16, now_ms);
                }
            }
        }
    }

    /// Capture protocol: publish the snapshot, then emit `MOTOR_READY`
    /// (first frame only) followed by `MOTOR_STATE`, exactly in that order.
    fn capture(&mut self, protocol: ProtocolId, bytes: &[u8], opcode: u8, aux16: u16, now_ms: u32) {
        self.snapshot.publish(bytes, opcode, protocol, aux16);
        self.stats.rx_count += 1;
        self.stats.last_rx_ms = now_ms;
        self.rx_timer_active = false;

        if !self.motor_ready_emitted {
            self.push_event(MotorEvent::motor_ready(now_ms));
            self.motor_ready_emitted = true;
        }
        self.push_event(MotorEvent::motor_state(protocol.into(), opcode, now_ms));
    }

    fn on_rx_error(&mut self, err: CodecError, now_ms: u32) {
        self.stats.rx_errors += 1;
        // Spec's wire-stable MOTOR_ERROR taxonomy only names four codes;
        // a bad header collapses into the same "too short/garbage" code as
        // an undersized frame.
        let code: u8 = match err {
            CodecError::TooShort | CodecError::BadHeader => 0x01,
            CodecError::Checksum => 0x02,
            CodecError::LengthOutOfRange => 0xFE,
            CodecError::Overflow => 0xFF,
        };
        self.push_event(MotorEvent::motor_error(code, now_ms));
    }

    fn push_event(&mut self, event: MotorEvent) {
        if let Some(q) = self.events {
            if !q.push(event) {
                self.stats.queue_full += 1;
            }
        }
    }

    fn pump_tx(&mut self, now_ms: u32) {
        self.last_tx_ms = now_ms;
        let mut i = 0;
        while i < self.tx_len {
            let mut spins = 0u32;
            while !self.uart.tx_ready() {
                spins += 1;
                if spins >= MAX_TX_SPIN {
                    self.tx_pending = false;
                    return;
                }
            }
            self.uart.write_byte(self.tx_buf[i]);
            i += 1;
        }
        self.tx_pending = false;
        self.stats.tx_count += 1;
        self.rx_timer_active = true;
        self.rx_start_ms = now_ms;
    }
}

/// What `cmd` needs from the ISR channel, narrowed to a trait so command
/// processing doesn't have to carry the channel's `Uart`/`N` generics
/// through every signature.
pub trait FrameSource {
    fn copy_last_frame(&self, out: &mut CapturedFrame) -> bool;
    fn queue_frame(&mut self, bytes: &[u8], len: usize) -> bool;
    fn queue_cmd(
        &mut self,
        assist: u8,
        light: bool,
        walk: bool,
        battery_low: bool,
        speed_over: bool,
    ) -> bool;
    /// True while a previously queued frame hasn't gone out yet; `link`'s
    /// periodic encoders skip a tick rather than clobber the pending slot.
    fn tx_busy_hint(&self) -> bool;
    fn v2_expect(&mut self, msg_id: u16, total_len: usize);
}

impl<U: Uart, const N: usize> FrameSource for Channel<U, N> {
    fn copy_last_frame(&self, out: &mut CapturedFrame) -> bool {
        Channel::copy_last_frame(self, out)
    }
    fn queue_frame(&mut self, bytes: &[u8], len: usize) -> bool {
        Channel::queue_frame(self, bytes, len)
    }
    fn queue_cmd(
        &mut self,
        assist: u8,
        light: bool,
        walk: bool,
        battery_low: bool,
        speed_over: bool,
    ) -> bool {
        Channel::queue_cmd(self, assist, light, walk, battery_low, speed_over)
    }
    fn tx_busy_hint(&self) -> bool {
        Channel::tx_busy(self)
    }
    fn v2_expect(&mut self, msg_id: u16, total_len: usize) {
        Channel::v2_expect(self, msg_id, total_len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{auth, stx02};
    use std::collections::VecDeque;

    #[derive(Default)]
    struct MockUart {
        rx: VecDeque<u8>,
        tx: std::vec::Vec<u8>,
        ready: bool,
    }

    impl Uart for MockUart {
        fn try_read(&mut self) -> Option<u8> {
            self.rx.pop_front()
        }
        fn tx_ready(&mut self) -> bool {
            self.ready
        }
        fn write_byte(&mut self, byte: u8) {
            self.tx.push(byte);
        }
    }

    static EVENTS: EventQueue<32> = EventQueue::new();

    fn new_channel() -> Channel<MockUart, 32> {
        let mut ch = Channel::new(MockUart {
            ready: true,
            ..Default::default()
        });
        ch.init(&EVENTS);
        ch
    }

    #[test]
    fn valid_frame_publishes_snapshot_and_events() {
        let mut ch = new_channel();
        let mut buf = [0u8; 32];
        let n = shengyi::build_frame(0x52, &[1, 2], &mut buf);
        for &b in &buf[..n] {
            ch.on_rx_byte(b, 10);
        }

        let mut out = CapturedFrame::default();
        assert!(ch.copy_last_frame(&mut out));
        assert_eq!(out.opcode, 0x52);
        assert_eq!(out.protocol, ProtocolId::Shengyi3a1a);

        let ready = EVENTS.pop().unwrap();
        assert_eq!(ready.kind, crate::events::EventKind::MotorReady);
        let state = EVENTS.pop().unwrap();
        assert_eq!(state.kind, crate::events::EventKind::MotorState);
        assert_eq!(state.state_protocol_opcode(), (ProtocolId::Shengyi3a1a.into(), 0x52));
    }

    #[test]
    fn checksum_error_increments_rx_errors_and_emits_no_state() {
        let mut ch = new_channel();
        let mut buf = [0u8; 32];
        let n = shengyi::build_frame(0x52, &[1, 2], &mut buf);
        buf[4] ^= 0xFF;
        for &b in &buf[..n] {
            ch.on_rx_byte(b, 10);
        }
        assert_eq!(ch.get_stats().rx_errors, 1);
        let mut out = CapturedFrame::default();
        assert!(!ch.copy_last_frame(&mut out));
    }

    #[test]
    fn rx_timeout_fires_after_partial_frame() {
        let mut ch = new_channel();
        ch.on_rx_byte(shengyi::SOF, 0);
        ch.on_rx_byte(shengyi::SECOND_BYTE, 0);
        ch.tick(50);
        assert_eq!(ch.get_stats().timeouts, 0);
        ch.tick(120);
        assert_eq!(ch.get_stats().timeouts, 1);
    }

    #[test]
    fn queue_cmd_sets_tx_busy_until_pumped() {
        let mut ch = new_channel();
        assert!(!ch.tx_busy());
        assert!(ch.queue_cmd(5, false, false, false, false));
        assert!(ch.tx_busy());
        ch.tick(0);
        ch.tick(DEFAULT_TX_INTERVAL_MS);
        assert!(!ch.tx_busy());
        assert_eq!(ch.get_stats().tx_count, 1);
    }

    #[test]
    fn tx_spin_exhaustion_abandons_without_stats_bump() {
        let mut ch = Channel::<MockUart, 32>::new(MockUart::default()); // ready == false
        ch.init(&EVENTS);
        while EVENTS.pop().is_some() {}
        assert!(ch.queue_cmd(5, false, false, false, false));
        ch.tick(0);
        ch.tick(DEFAULT_TX_INTERVAL_MS);
        assert!(!ch.tx_busy());
        assert_eq!(ch.get_stats().tx_count, 0);
    }

    #[test]
    fn stx02_and_auth_frames_both_captured_independently() {
        let mut ch = new_channel();
        let mut buf = [0u8; 32];
        let n = stx02::build_frame(0x01, &[1, 2, 3], &mut buf);
        for &b in &buf[..n] {
            ch.on_rx_byte(b, 1);
        }
        let mut out = CapturedFrame::default();
        assert!(ch.copy_last_frame(&mut out));
        assert_eq!(out.protocol, ProtocolId::Stx02Xor);

        while EVENTS.pop().is_some() {}
        let n2 = auth::build_frame(auth::SOF_A, &[0x11, 0x22], &mut buf);
        for &b in &buf[..n2] {
            ch.on_rx_byte(b, 2);
        }
        assert!(ch.copy_last_frame(&mut out));
        assert_eq!(out.protocol, ProtocolId::AuthXorCr);
    }
}
