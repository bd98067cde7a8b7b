//! Link manager: protocol auto-detection/locking, the per-protocol periodic
//! TX encoders, baud switching, and the virtual-gear table. Runs in the main
//! loop, one tick at a time, driving the ISR channel through [`crate::isr::FrameSource`]
//! the same way `cmd` does.

use crate::cmd::{CommandIntent, MotorStatus};
use crate::codec::{auth, shengyi, stx02, v2, ProtocolId};
use crate::config::PersistedConfig;
use crate::isr::FrameSource;
use crate::util::{elapsed_at_least, round_div_u32};
use crate::vgear::VGearTable;

/// Probe cadence while unlocked and in `Auto` mode.
const PROBE_INTERVAL_MS: u32 = 200;
/// Receive-score threshold at which `Auto` mode locks onto a protocol.
const LOCK_SCORE: u8 = 2;

const SHENGYI_LOCKED_MS: u32 = 100;
const SHENGYI_HANDSHAKE_MS: u32 = 500;
const STX02_LOCKED_MS: u32 = 100;
const AUTH_LOCKED_MS: u32 = 250;
const V2_LOCKED_MS: u32 = 120;

pub const BAUD_9600: u32 = 9600;
pub const BAUD_1200: u32 = 1200;

const STX02_STATUS_CMD: u8 = 0x14;

/// Cycled during V2's locked-phase polling. Eight request message ids,
/// mirroring the single probe id (`0x1190`) the motor is known to answer.
const V2_MSG_IDS: [u16; 8] = [
    0x1190, 0x1191, 0x1192, 0x1193, 0x1194, 0x1195, 0x1196, 0x1197,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(not(test), derive(defmt::Format))]
pub enum LinkMode {
    Auto,
    ForceShengyi,
    ForceStx02,
    ForceAuth,
    ForceV2,
}

/// Hardware seam for baud switching: the teacher's pattern of disabling the
/// peripheral, applying the new divisor, then re-enabling it.
pub trait BaudControl {
    fn disable(&mut self);
    fn set_brr(&mut self, brr: u32);
    fn enable(&mut self);
}

/// `BRR = round(pclk_hz / baud)`, the standard USART divisor computation.
pub fn compute_brr(pclk_hz: u32, baud: u32) -> u32 {
    round_div_u32(pclk_hz, baud.max(1))
}

pub struct LinkManager {
    mode: LinkMode,
    locked: bool,
    locked_proto: Option<ProtocolId>,
    scores: [u8; 4],

    probe_step: u8,
    last_probe_ms: u32,

    last_tx_shengyi_ms: u32,
    last_handshake_attempt_ms: u32,
    last_tx_stx02_ms: u32,
    last_tx_auth_ms: u32,
    auth_toggle: bool,
    auth_nonce: u8,
    last_tx_v2_ms: u32,
    v2_cycle: usize,

    baud: u32,
    vgear: VGearTable,
}

impl Default for LinkManager {
    fn default() -> Self {
        Self {
            mode: LinkMode::Auto,
            locked: false,
            locked_proto: None,
            scores: [0; 4],
            probe_step: 0,
            last_probe_ms: 0,
            last_tx_shengyi_ms: 0,
            last_handshake_attempt_ms: 0,
            last_tx_stx02_ms: 0,
            last_tx_auth_ms: 0,
            auth_toggle: false,
            auth_nonce: 0,
            last_tx_v2_ms: 0,
            v2_cycle: 0,
            baud: BAUD_9600,
            vgear: VGearTable::default(),
        }
    }
}

impl LinkManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mode(&self) -> LinkMode {
        self.mode
    }

    pub fn locked(&self) -> bool {
        self.locked
    }

    pub fn locked_protocol(&self) -> Option<ProtocolId> {
        self.locked_proto
    }

    pub fn baud(&self) -> u32 {
        self.baud
    }

    pub fn vgear(&self) -> &VGearTable {
        &self.vgear
    }

    pub fn vgear_mut(&mut self) -> &mut VGearTable {
        &mut self.vgear
    }

    /// Switch mode, resetting all per-protocol detection/timing state. The
    /// `Auto` case re-arms detection from scratch; a `Force*` case locks
    /// immediately onto its named protocol.
    pub fn set_mode(&mut self, mode: LinkMode) {
        self.mode = mode;
        self.scores = [0; 4];
        self.probe_step = 0;
        self.last_probe_ms = 0;
        self.last_tx_shengyi_ms = 0;
        self.last_handshake_attempt_ms = 0;
        self.last_tx_stx02_ms = 0;
        self.last_tx_auth_ms = 0;
        self.last_tx_v2_ms = 0;
        self.v2_cycle = 0;
        self.locked = match mode {
            LinkMode::Auto => false,
            _ => true,
        };
        self.locked_proto = match mode {
            LinkMode::Auto => None,
            LinkMode::ForceShengyi => Some(ProtocolId::Shengyi3a1a),
            LinkMode::ForceStx02 => Some(ProtocolId::Stx02Xor),
            LinkMode::ForceAuth => Some(ProtocolId::AuthXorCr),
            LinkMode::ForceV2 => Some(ProtocolId::V2Fixed),
        };
        self.baud = match self.locked_proto {
            Some(ProtocolId::V2Fixed) => BAUD_1200,
            _ => BAUD_9600,
        };
    }

    /// Map a `0xAB` motor-requested-switch payload byte to a forced mode.
    pub fn switch_protocol(&mut self, idx: u8) {
        let mode = match idx {
            0 => LinkMode::ForceShengyi,
            1 => LinkMode::ForceStx02,
            2 => LinkMode::ForceV2,
            3 => LinkMode::ForceAuth,
            _ => return,
        };
        self.set_mode(mode);
    }

    /// Record that a frame of `protocol` was just decoded. Drives `Auto`
    /// mode's scoring/locking; a no-op under a forced mode.
    pub fn on_frame_observed(&mut self, protocol: ProtocolId) {
        let idx = protocol_index(protocol);
        self.scores[idx] = self.scores[idx].saturating_add(1).min(250);
        if self.mode == LinkMode::Auto && !self.locked && self.scores[idx] >= LOCK_SCORE {
            self.locked = true;
            self.locked_proto = Some(protocol);
        }
    }

    /// Apply `self.baud` to the UART if it differs from what's currently
    /// configured, disabling/re-enabling the peripheral around the change.
    pub fn sync_baud(&self, current_brr_pclk_hz: u32, ctrl: &mut impl BaudControl) {
        ctrl.disable();
        ctrl.set_brr(compute_brr(current_brr_pclk_hz, self.baud));
        ctrl.enable();
    }

    /// Drive probing (unlocked) or the locked-phase periodic encoders.
    pub fn tick(
        &mut self,
        now_ms: u32,
        frames: &mut impl FrameSource,
        cfg: &PersistedConfig,
        intent: &CommandIntent,
        status: &MotorStatus,
        handshake_ok: bool,
    ) {
        if !self.locked {
            self.probe_tick(now_ms, frames);
            return;
        }

        match self.locked_proto {
            Some(ProtocolId::Shengyi3a1a) => self.shengyi_locked_tick(now_ms, frames, intent, status, handshake_ok),
            Some(ProtocolId::Stx02Xor) => self.stx02_locked_tick(now_ms, frames, cfg),
            Some(ProtocolId::AuthXorCr) => self.auth_locked_tick(now_ms, frames, cfg, intent),
            Some(ProtocolId::V2Fixed) => self.v2_locked_tick(now_ms, frames),
            None => {}
        }
    }

    fn probe_tick(&mut self, now_ms: u32, frames: &mut impl FrameSource) {
        if !elapsed_at_least(now_ms, self.last_probe_ms, PROBE_INTERVAL_MS) {
            return;
        }
        if frames.tx_busy_hint() {
            return;
        }
        self.last_probe_ms = now_ms;

        match self.probe_step % 4 {
            0 => {
                frames.queue_cmd(0, false, false, false, false);
            }
            1 => {
                let mut buf = [0u8; 8];
                let n = stx02::build_frame(STX02_STATUS_CMD, &[], &mut buf);
                if n > 0 {
                    frames.queue_frame(&buf, n);
                }
            }
            2 => {
                let mut buf = [0u8; 8];
                let n = auth::build_frame(auth::SOF_A, &[self.next_nonce()], &mut buf);
                if n > 0 {
                    frames.queue_frame(&buf, n);
                }
            }
            _ => {
                let mut buf = [0u8; 8];
                let n = v2::build_frame(&[0x11, 0x90, 0x00], &mut buf);
                if n > 0 {
                    frames.queue_frame(&buf, n);
                }
                frames.v2_expect(0x1190, 5);
            }
        }
        self.probe_step = self.probe_step.wrapping_add(1);
    }

    fn shengyi_locked_tick(
        &mut self,
        now_ms: u32,
        frames: &mut impl FrameSource,
        intent: &CommandIntent,
        status: &MotorStatus,
        handshake_ok: bool,
    ) {
        if !elapsed_at_least(now_ms, self.last_tx_shengyi_ms, SHENGYI_LOCKED_MS) {
            return;
        }
        if frames.tx_busy_hint() {
            return;
        }
        self.last_tx_shengyi_ms = now_ms;

        if !handshake_ok {
            if elapsed_at_least(now_ms, self.last_handshake_attempt_ms, SHENGYI_HANDSHAKE_MS) {
                self.last_handshake_attempt_ms = now_ms;
                let mut buf = [0u8; 8];
                let n = shengyi::build_frame(0x53, &[], &mut buf);
                if n > 0 {
                    frames.queue_frame(&buf, n);
                }
            }
            return;
        }

        let battery_low = status.valid && status.soc_pct == 0;
        frames.queue_cmd(
            intent.assist_level,
            intent.light,
            intent.walk,
            battery_low,
            intent.speed_over,
        );
    }

    fn stx02_locked_tick(&mut self, now_ms: u32, frames: &mut impl FrameSource, cfg: &PersistedConfig) {
        if !elapsed_at_least(now_ms, self.last_tx_stx02_ms, STX02_LOCKED_MS) {
            return;
        }
        if frames.tx_busy_hint() {
            return;
        }
        self.last_tx_stx02_ms = now_ms;

        let payload = [cfg.stx02_options, cfg.current_cap_a, cfg.speed_cap_kph];
        let mut buf = [0u8; 24];
        let n = stx02::build_frame(STX02_STATUS_CMD, &payload, &mut buf);
        if n > 0 {
            frames.queue_frame(&buf, n);
        }
    }

    fn auth_locked_tick(
        &mut self,
        now_ms: u32,
        frames: &mut impl FrameSource,
        cfg: &PersistedConfig,
        intent: &CommandIntent,
    ) {
        if !elapsed_at_least(now_ms, self.last_tx_auth_ms, AUTH_LOCKED_MS) {
            return;
        }
        if frames.tx_busy_hint() {
            return;
        }
        self.last_tx_auth_ms = now_ms;

        let sof = if self.auth_toggle { auth::SOF_B } else { auth::SOF_A };
        self.auth_toggle = !self.auth_toggle;

        let flags = ((intent.light as u8) << 2) | ((intent.walk as u8) << 1) | (intent.assist_level > 0) as u8;
        let mut buf = [0u8; 16];
        // `build_frame` refuses a payload whose XOR collides with the frame
        // terminator; vary the spare nonce byte until one is accepted.
        let mut n = 0;
        for _ in 0..4 {
            let nonce = self.next_nonce();
            n = auth::build_frame(sof, &[flags, cfg.wheel_code(), nonce], &mut buf);
            if n > 0 {
                break;
            }
        }
        if n > 0 {
            frames.queue_frame(&buf, n);
        }
    }

    fn v2_locked_tick(&mut self, now_ms: u32, frames: &mut impl FrameSource) {
        if !elapsed_at_least(now_ms, self.last_tx_v2_ms, V2_LOCKED_MS) {
            return;
        }
        if frames.tx_busy_hint() {
            return;
        }
        self.last_tx_v2_ms = now_ms;

        let msg_id = V2_MSG_IDS[self.v2_cycle % V2_MSG_IDS.len()];
        self.v2_cycle = self.v2_cycle.wrapping_add(1);
        let mut buf = [0u8; 8];
        let n = v2::build_frame(&[(msg_id >> 8) as u8, (msg_id & 0xFF) as u8, 0x00], &mut buf);
        if n > 0 {
            frames.queue_frame(&buf, n);
            frames.v2_expect(msg_id, 5);
        }
    }

    fn next_nonce(&mut self) -> u8 {
        self.auth_nonce = self.auth_nonce.wrapping_add(1);
        if self.auth_nonce == 0x0D {
            self.auth_nonce = self.auth_nonce.wrapping_add(1);
        }
        self.auth_nonce
    }
}

fn protocol_index(protocol: ProtocolId) -> usize {
    match protocol {
        ProtocolId::Shengyi3a1a => 0,
        ProtocolId::Stx02Xor => 1,
        ProtocolId::AuthXorCr => 2,
        ProtocolId::V2Fixed => 3,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isr::CapturedFrame;
    use std::cell::RefCell;

    struct MockFrames {
        busy: bool,
        queued: RefCell<Vec<Vec<u8>>>,
        v2_armed: RefCell<Option<(u16, usize)>>,
    }

    impl MockFrames {
        fn new() -> Self {
            Self {
                busy: false,
                queued: RefCell::new(Vec::new()),
                v2_armed: RefCell::new(None),
            }
        }
    }

    impl FrameSource for MockFrames {
        fn copy_last_frame(&self, _out: &mut CapturedFrame) -> bool {
            false
        }
        fn queue_frame(&mut self, bytes: &[u8], len: usize) -> bool {
            if len == 0 {
                return false;
            }
            self.queued.borrow_mut().push(bytes[..len].to_vec());
            true
        }
        fn queue_cmd(&mut self, assist: u8, light: bool, _walk: bool, _battery_low: bool, _speed_over: bool) -> bool {
            self.queued.borrow_mut().push(vec![assist, light as u8]);
            true
        }
        fn tx_busy_hint(&self) -> bool {
            self.busy
        }
        fn v2_expect(&mut self, msg_id: u16, total_len: usize) {
            *self.v2_armed.borrow_mut() = Some((msg_id, total_len));
        }
    }

    #[test]
    fn auto_mode_locks_after_reaching_score_threshold() {
        let mut link = LinkManager::new();
        assert!(!link.locked());
        link.on_frame_observed(ProtocolId::Stx02Xor);
        assert!(!link.locked());
        link.on_frame_observed(ProtocolId::Stx02Xor);
        assert!(link.locked());
        assert_eq!(link.locked_protocol(), Some(ProtocolId::Stx02Xor));
    }

    #[test]
    fn switch_protocol_forces_mode_and_resets_lock() {
        let mut link = LinkManager::new();
        link.on_frame_observed(ProtocolId::Shengyi3a1a);
        link.on_frame_observed(ProtocolId::Shengyi3a1a);
        assert_eq!(link.locked_protocol(), Some(ProtocolId::Shengyi3a1a));

        link.switch_protocol(2); // -> ForceV2
        assert_eq!(link.mode(), LinkMode::ForceV2);
        assert_eq!(link.locked_protocol(), Some(ProtocolId::V2Fixed));
        assert_eq!(link.baud(), BAUD_1200);
    }

    #[test]
    fn set_mode_auto_unlocks_and_clears_scores() {
        let mut link = LinkManager::new();
        link.on_frame_observed(ProtocolId::AuthXorCr);
        link.on_frame_observed(ProtocolId::AuthXorCr);
        assert!(link.locked());
        link.set_mode(LinkMode::Auto);
        assert!(!link.locked());
        link.on_frame_observed(ProtocolId::AuthXorCr);
        assert!(!link.locked()); // score reset, one hit isn't enough yet
    }

    #[test]
    fn compute_brr_matches_standard_usart_formula() {
        assert_eq!(compute_brr(48_000_000, 9600), 5000);
    }

    #[test]
    fn next_nonce_never_lands_on_terminator_byte() {
        let mut link = LinkManager::new();
        for _ in 0..300 {
            assert_ne!(link.next_nonce(), 0x0D);
        }
    }
}
