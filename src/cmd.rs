//! Main-loop command processor: decodes `MotorState` events into the status
//! cache, applies configuration frames, and gates outbound command frames
//! behind a dirty flag and (for Shengyi) a handshake. This is the event
//! consumer side of the ISR/main-loop split — everything here runs outside
//! interrupt context and may take as long as it needs to.

use crate::codec::{auth, shengyi, stx02, v2, ProtocolId};
use crate::config::{self, PersistedConfig};
use crate::events::{EventKind, MotorEvent};
use crate::isr::{CapturedFrame, FrameSource};
use crate::mapper;
use crate::stats::{CmdStats, LinkHealth};
use crate::util::{clamp_i32, clamp_u16, elapsed_at_least, round_div_u32};

/// RX timeout that latches a comm fault, in ms.
const COMM_FAULT_MS: u32 = 500;
/// How stale an ADC battery-voltage sample may be and still take priority
/// over the decoded status-frame value, in ms.
const ADC_FRESHNESS_MS: u32 = 200;
/// Period (ms) at or above which a motor is considered stationary.
const STOPPED_PERIOD_MS: u32 = 3000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmdError {
    StaleFrame,
    BadLength,
    UnknownOpcode,
    OutOfRange,
}

/// Cached telemetry from the most recently decoded motor-state frame.
/// `brake_active` and `last_assist` aren't named in the external status
/// model this mirrors, but the decode formulas below compute them anyway
/// and downstream collaborators (cruise control, UI) need somewhere to
/// read them from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(not(test), derive(defmt::Format))]
pub struct MotorStatus {
    pub speed_dmph: u16,
    pub battery_dv: u16,
    pub battery_da: i16,
    pub soc_pct: u8,
    pub last_error: u8,
    pub last_assist: u8,
    pub brake_active: bool,
    pub last_update_ms: u32,
    pub valid: bool,
}

/// What the main loop wants the motor to do, as set by the UI layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(not(test), derive(defmt::Format))]
pub struct CommandIntent {
    pub assist_level: u8,
    pub light: bool,
    pub walk: bool,
    pub speed_over: bool,
    pub cmd_dirty: bool,
}

/// Effect a decoded frame asks the caller to carry out beyond updating
/// `cmd`'s own state. `cmd` never reaches into `link` directly (it sits
/// below `link` in the module order), so protocol-switch requests are
/// handed back to the driver that owns both.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmdEffect {
    None,
    ProtocolSwitchRequested(u8),
}

pub struct CommandProcessor {
    pub status: MotorStatus,
    pub intent: CommandIntent,
    stats: CmdStats,
    health: LinkHealth,
    handshake_ok: bool,
    last_motor_ms: u32,
    oem_max: u8,
    active_gear: u8,
    adc_battery_dv: Option<(u16, u32)>,
}

impl Default for CommandProcessor {
    fn default() -> Self {
        Self {
            status: MotorStatus::default(),
            intent: CommandIntent::default(),
            stats: CmdStats::default(),
            health: LinkHealth::default(),
            handshake_ok: false,
            last_motor_ms: 0,
            oem_max: mapper::oem_max(5),
            active_gear: 1,
            adc_battery_dv: None,
        }
    }
}

impl CommandProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> CmdStats {
        self.stats
    }

    pub fn health(&self) -> LinkHealth {
        self.health
    }

    pub fn oem_max(&self) -> u8 {
        self.oem_max
    }

    pub fn active_gear(&self) -> u8 {
        self.active_gear
    }

    pub fn handshake_ok(&self) -> bool {
        self.handshake_ok
    }

    /// Feed a fresh ADC-sampled battery voltage. An external collaborator
    /// (not modeled here) owns the actual ADC read.
    pub fn set_adc_battery_sample(&mut self, dv: u16, now_ms: u32) {
        self.adc_battery_dv = Some((dv, now_ms));
    }

    /// Dispatch one drained event. Returns the effect the caller must act on.
    pub fn handle_event(
        &mut self,
        event: MotorEvent,
        frames: &mut impl FrameSource,
        cfg: &mut PersistedConfig,
        now_ms: u32,
    ) -> CmdEffect {
        match event.kind {
            EventKind::MotorState => self.handle_motor_state(event, frames, cfg, now_ms),
            EventKind::MotorError => CmdEffect::None,
            EventKind::MotorTimeout => {
                self.handle_timeout(now_ms);
                CmdEffect::None
            }
            EventKind::MotorReady => {
                self.intent.cmd_dirty = true;
                CmdEffect::None
            }
        }
    }

    fn handle_timeout(&mut self, now_ms: u32) {
        if elapsed_at_least(now_ms, self.last_motor_ms, COMM_FAULT_MS) {
            self.status.valid = false;
            self.health = LinkHealth::CommFault;
        }
    }

    fn handle_motor_state(
        &mut self,
        event: MotorEvent,
        frames: &mut impl FrameSource,
        cfg: &mut PersistedConfig,
        now_ms: u32,
    ) -> CmdEffect {
        let (event_protocol, event_opcode) = event.state_protocol_opcode();

        let mut frame = CapturedFrame::default();
        if !frames.copy_last_frame(&mut frame) {
            self.stats.parse_errors += 1;
            return CmdEffect::None;
        }
        let frame_protocol: u8 = frame.protocol.into();
        if frame_protocol != event_protocol || frame.opcode != event_opcode {
            // The ISR has already published something newer; this event is stale.
            return CmdEffect::None;
        }

        let bytes = &frame.bytes[..frame.len];
        let result = match frame.protocol {
            ProtocolId::Shengyi3a1a => self.decode_shengyi(event_opcode, bytes, cfg, frames, now_ms),
            ProtocolId::Stx02Xor => self.decode_stx02(bytes),
            ProtocolId::AuthXorCr => self.decode_auth(event_opcode, bytes),
            ProtocolId::V2Fixed => self.decode_v2(bytes),
        };

        match result {
            Ok(effect) => {
                self.status.valid = true;
                self.status.last_update_ms = now_ms;
                self.last_motor_ms = now_ms;
                self.health = LinkHealth::Connected;
                effect
            }
            Err(_) => {
                self.stats.parse_errors += 1;
                CmdEffect::None
            }
        }
    }

    fn decode_shengyi(
        &mut self,
        opcode: u8,
        bytes: &[u8],
        cfg: &mut PersistedConfig,
        frames: &mut impl FrameSource,
        now_ms: u32,
    ) -> Result<CmdEffect, CmdError> {
        let v = shengyi::validate_frame(bytes, bytes.len()).map_err(|_| CmdError::BadLength)?;
        match opcode {
            0x52 => {
                self.apply_shengyi_status(v.payload, cfg, now_ms)?;
                Ok(CmdEffect::None)
            }
            0x53 => {
                self.handshake_ok = true;
                Ok(CmdEffect::None)
            }
            0xC0 => {
                self.apply_shengyi_config(v.payload, cfg, frames);
                Ok(CmdEffect::None)
            }
            0xC2 => {
                self.send_c3_echo(cfg, frames);
                Ok(CmdEffect::None)
            }
            0xAB => {
                if v.payload.len() < 2 {
                    return Err(CmdError::BadLength);
                }
                Ok(CmdEffect::ProtocolSwitchRequested(v.payload[1]))
            }
            _ => Err(CmdError::UnknownOpcode),
        }
    }

    fn apply_shengyi_status(
        &mut self,
        payload: &[u8],
        cfg: &PersistedConfig,
        now_ms: u32,
    ) -> Result<(), CmdError> {
        if payload.len() < 5 {
            return Err(CmdError::BadLength);
        }
        let b0 = payload[0];
        let b1 = payload[1];
        let brake = b0 & 0x40 != 0;
        let battery_dv_raw = ((b0 & 0x3F) as u16) * 10;
        let battery_da = round_div_u32(b1 as u32 * 1000, 300) as i16;
        let speed_raw = u16::from_be_bytes([payload[2], payload[3]]);
        let speed_dmph = shengyi_speed_dmph(cfg.wheel_circumference_mm, speed_raw);
        let err = normalize_shengyi_error(payload[4]);

        self.status.battery_dv = self.battery_dv_with_adc_priority(battery_dv_raw, now_ms);
        self.status.battery_da = battery_da;
        self.status.speed_dmph = speed_dmph;
        self.status.last_error = err;
        self.status.brake_active = brake;
        self.status.soc_pct = soc_from_voltage(cfg.nominal_voltage, self.status.battery_dv);
        self.status.last_assist = self.active_gear;
        Ok(())
    }

    fn battery_dv_with_adc_priority(&self, status_dv: u16, now_ms: u32) -> u16 {
        if let Some((adc_dv, adc_ts)) = self.adc_battery_dv {
            if !elapsed_at_least(now_ms, adc_ts, ADC_FRESHNESS_MS + 1) {
                return adc_dv;
            }
        }
        status_dv
    }

    fn apply_shengyi_config(
        &mut self,
        payload: &[u8],
        cfg: &mut PersistedConfig,
        frames: &mut impl FrameSource,
    ) {
        let mut applied = false;
        if payload.len() >= 3 {
            if config::OEM_ASSIST_COUNTS.contains(&payload[0]) {
                cfg.oem_assist_count = payload[0];
                applied = true;
            }
            if config::NOMINAL_VOLTAGES.contains(&payload[1]) {
                cfg.nominal_voltage = payload[1];
                applied = true;
            }
            if (payload[2] as usize) < config::WHEEL_CODES_MM.len() {
                cfg.wheel_circumference_mm = config::WHEEL_CODES_MM[payload[2] as usize];
                applied = true;
            }
        }

        let status_byte = if applied { 1u8 } else { 0u8 };
        let mut ack = [0u8; 16];
        let n = shengyi::build_frame(0xC1, &[status_byte], &mut ack);
        if n > 0 {
            frames.queue_frame(&ack, n);
        }
        self.send_c3_echo(cfg, frames);
    }

    fn send_c3_echo(&self, cfg: &PersistedConfig, frames: &mut impl FrameSource) {
        let mut payload = [0u8; 47];
        payload[0] = cfg.wheel_code();
        payload[1] = cfg.nominal_voltage;
        payload[2] = cfg.oem_assist_count;
        payload[3] = cfg.current_cap_a;
        payload[4] = cfg.speed_cap_kph;
        payload[5] = cfg.stx02_options;

        let mut buf = [0u8; 64];
        let n = shengyi::build_frame(0xC3, &payload, &mut buf);
        if n > 0 {
            frames.queue_frame(&buf, n);
        }
    }

    fn decode_stx02(&mut self, bytes: &[u8]) -> Result<CmdEffect, CmdError> {
        let v = stx02::validate_frame(bytes, bytes.len()).map_err(|_| CmdError::BadLength)?;
        if v.opcode != 1 {
            return Err(CmdError::UnknownOpcode);
        }
        let p = v.payload;
        if p.len() < 8 {
            return Err(CmdError::BadLength);
        }

        let err = stx02_error_from_flags(p[0]);
        let raw = u16::from_be_bytes([p[1], p[2]]);
        let magnitude = (raw & 0x3FFF) as i32;
        let scale = if raw & 0x4000 != 0 { 1 } else { 10 };
        let current_da = clamp_i32(magnitude * scale, 0, 32767) as i16;
        let period = u16::from_be_bytes([p[5], p[6]]);
        let speed_dmph = period_to_dmph_stopping(period, STOPPED_PERIOD_MS);
        let soc_raw = p[7];

        self.status.last_error = err;
        self.status.battery_da = current_da;
        self.status.speed_dmph = speed_dmph;
        if soc_raw <= 100 {
            self.status.soc_pct = soc_raw;
        }
        Ok(CmdEffect::None)
    }

    fn decode_auth(&mut self, opcode: u8, bytes: &[u8]) -> Result<CmdEffect, CmdError> {
        let v = auth::validate_frame(bytes, bytes.len()).map_err(|_| CmdError::BadLength)?;
        if opcode != auth::SOF_A {
            return Err(CmdError::UnknownOpcode);
        }
        let p = v.payload;
        if p.len() < 4 {
            return Err(CmdError::BadLength);
        }

        let soc = clamp_u16(20u16.saturating_mul(p[0] as u16), 0, 100) as u8;
        let current_da = ((p[1] as u32 * 10 + 1) / 3) as i16;
        let period = u16::from_be_bytes([p[2], p[3]]);
        let speed_dmph = period_to_dmph_stopping(period, STOPPED_PERIOD_MS);

        self.status.soc_pct = soc;
        self.status.battery_da = current_da;
        self.status.speed_dmph = speed_dmph;
        Ok(CmdEffect::None)
    }

    fn decode_v2(&mut self, bytes: &[u8]) -> Result<CmdEffect, CmdError> {
        let v = v2::validate_frame(bytes, bytes.len()).map_err(|_| CmdError::BadLength)?;
        let p = v.payload;
        if p.len() < 4 {
            // Shorter V2 acks carry no period field; nothing to decode.
            return Ok(CmdEffect::None);
        }
        let period = u16::from_be_bytes([p[2], p[3]]);
        if !(50..=5000).contains(&period) {
            return Err(CmdError::OutOfRange);
        }
        self.status.speed_dmph = period_to_dmph_raw(period);
        Ok(CmdEffect::None)
    }

    /// Shengyi-fast-path: attempt an immediate out-of-cadence 0x52 send.
    /// A no-op until the Shengyi handshake (0x53) has been observed; the
    /// link manager's own periodic encoders are what actually drive the
    /// other three protocols and Shengyi's steady-state heartbeat.
    pub fn update_command(&mut self, frames: &mut impl FrameSource) {
        if !self.handshake_ok {
            return;
        }
        let battery_low = self.status.valid && self.status.soc_pct == 0;
        let assist_byte = mapper::assist_byte(self.oem_max, self.active_gear, self.status.brake_active);
        let queued = frames.queue_cmd(
            assist_byte,
            self.intent.light,
            self.intent.walk,
            battery_low,
            self.intent.speed_over,
        );
        if queued {
            self.intent.cmd_dirty = false;
        }
    }

    pub fn set_assist(&mut self, level: u8, frames: &mut impl FrameSource) {
        let clamped = level.clamp(1, self.oem_max.max(1));
        if self.active_gear != clamped {
            self.active_gear = clamped;
            self.intent.assist_level = clamped;
            self.intent.cmd_dirty = true;
        }
        self.update_command(frames);
    }

    pub fn set_light(&mut self, on: bool, frames: &mut impl FrameSource) {
        if self.intent.light != on {
            self.intent.light = on;
            self.intent.cmd_dirty = true;
        }
        self.update_command(frames);
    }

    pub fn set_walk(&mut self, on: bool, frames: &mut impl FrameSource) {
        if self.intent.walk != on {
            self.intent.walk = on;
            self.intent.cmd_dirty = true;
        }
        self.update_command(frames);
    }

    pub fn set_speed_over(&mut self, on: bool, frames: &mut impl FrameSource) {
        if self.intent.speed_over != on {
            self.intent.speed_over = on;
            self.intent.cmd_dirty = true;
        }
        self.update_command(frames);
    }

    /// Snap to the nearest OEM assist-count choice and clamp the active gear
    /// to the new count.
    pub fn set_oem_gear_count(&mut self, requested: u8, frames: &mut impl FrameSource) {
        let new_max = mapper::oem_max(requested);
        if self.oem_max != new_max {
            self.oem_max = new_max;
            self.active_gear = self.active_gear.clamp(1, new_max.max(1));
            self.intent.cmd_dirty = true;
        }
        self.update_command(frames);
    }

    pub fn set_active_gear(&mut self, gear: u8, frames: &mut impl FrameSource) {
        let clamped = gear.clamp(1, self.oem_max.max(1));
        if self.active_gear != clamped {
            self.active_gear = clamped;
            self.intent.assist_level = clamped;
            self.intent.cmd_dirty = true;
        }
        self.update_command(frames);
    }
}

fn normalize_shengyi_error(code: u8) -> u8 {
    if code == 0 || (33..=38).contains(&code) {
        code
    } else {
        0xFF
    }
}

fn soc_from_voltage(nominal: u8, battery_dv: u16) -> u8 {
    let (min_dv, max_dv): (u16, u16) = match nominal {
        24 => (200, 290),
        48 => (400, 580),
        _ => (300, 420), // 36V default
    };
    if battery_dv <= min_dv {
        0
    } else if battery_dv >= max_dv {
        100
    } else {
        (((battery_dv - min_dv) as u32 * 100) / (max_dv - min_dv) as u32) as u8
    }
}

/// `(wheel_mm * 36 / speed_raw) * 62137 / 100000`, rounded once at the end
/// rather than truncated at each intermediate division, for the one
/// rounding decision that actually matters to this firmware's speed display.
fn shengyi_speed_dmph(wheel_mm: u16, speed_raw: u16) -> u16 {
    if speed_raw == 0 {
        return 0;
    }
    let num = wheel_mm as u64 * 36 * 62137;
    let den = speed_raw as u64 * 100000;
    round_div_u64(num, den) as u16
}

/// `round(((36000 / period_ms) * 621) / 1000)`, clamped to 621, collapsed
/// into a single rounded division as above. Reports zero at or above
/// `stopped_ms`.
fn period_to_dmph_stopping(period_ms: u16, stopped_ms: u32) -> u16 {
    if period_ms == 0 || period_ms as u32 >= stopped_ms {
        return 0;
    }
    clamp_u16(period_to_dmph_raw(period_ms), 0, 621)
}

fn period_to_dmph_raw(period_ms: u16) -> u16 {
    if period_ms == 0 {
        return 0;
    }
    let num = 36000u64 * 621;
    let den = period_ms as u64 * 1000;
    round_div_u64(num, den) as u16
}

fn round_div_u64(num: u64, den: u64) -> u64 {
    (num + den / 2) / den
}

fn stx02_error_from_flags(flags: u8) -> u8 {
    if flags & 0x02 != 0 {
        2
    } else if flags & 0x08 != 0 {
        6
    } else if flags & 0x01 != 0 {
        7
    } else if flags & 0x20 != 0 {
        8
    } else if flags & 0x10 != 0 {
        9
    } else if flags & 0x40 != 0 {
        20
    } else {
        0
    }
}
