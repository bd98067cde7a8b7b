//! The core's view onto persisted configuration.
//!
//! Persistent storage itself (flash read/write) is an external collaborator
//! per the system scope; this module only defines the shape of the config
//! this core reads, mirroring the teacher's `UserCfg` / `cfg_storage.rs`
//! split between "what the data is" and "how it's saved".

/// Wheel circumference in mm for each wire wheel-size code the Shengyi 0xC0
/// configuration frame accepts, indexed by the code itself (0..=7). The wire
/// codes name wheel *diameter* in tenths of an inch (16.0"..29.0"); this
/// table is the corresponding circumference (`diameter_mm * pi`), since
/// that's the unit `wheel_circumference_mm` and the speed-decode formula
/// actually use.
pub const WHEEL_CODES_MM: [u16; 8] = [1277, 1436, 1596, 1756, 1915, 2075, 2194, 2314];

/// Nominal pack voltages the SOC lookup supports.
pub const NOMINAL_VOLTAGES: [u8; 3] = [24, 36, 48];

/// OEM assist-count choices the Shengyi family supports.
pub const OEM_ASSIST_COUNTS: [u8; 5] = [1, 3, 5, 6, 9];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(not(test), derive(defmt::Format))]
pub struct PersistedConfig {
    /// Wheel circumference in mm.
    pub wheel_circumference_mm: u16,
    /// Nominal pack voltage, one of `NOMINAL_VOLTAGES`.
    pub nominal_voltage: u8,
    /// OEM assist-count choice, one of `OEM_ASSIST_COUNTS`.
    pub oem_assist_count: u8,
    /// STX02 option bits, sourced from persisted configuration per spec.
    pub stx02_options: u8,
    /// Current cap, in amps, echoed into the STX02/Shengyi periodic frames.
    pub current_cap_a: u8,
    /// Speed cap, in km/h, echoed into the STX02 periodic frame.
    pub speed_cap_kph: u8,
}

impl Default for PersistedConfig {
    fn default() -> Self {
        Self {
            wheel_circumference_mm: 2194, // 27.5" wheel
            nominal_voltage: 36,
            oem_assist_count: 5,
            stx02_options: 0,
            current_cap_a: 20,
            speed_cap_kph: 25,
        }
    }
}

impl PersistedConfig {
    /// Map this config's wheel circumference to the nearest Shengyi wheel
    /// code, for encoding into outbound config frames.
    pub fn wheel_code(&self) -> u8 {
        let mut best_idx = 0usize;
        let mut best_diff = u16::MAX;
        for (i, &mm) in WHEEL_CODES_MM.iter().enumerate() {
            let diff = mm.abs_diff(self.wheel_circumference_mm);
            if diff < best_diff {
                best_diff = diff;
                best_idx = i;
            }
        }
        best_idx as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_sane() {
        let cfg = PersistedConfig::default();
        assert!(NOMINAL_VOLTAGES.contains(&cfg.nominal_voltage));
        assert!(OEM_ASSIST_COUNTS.contains(&cfg.oem_assist_count));
    }

    #[test]
    fn wheel_code_picks_nearest() {
        let mut cfg = PersistedConfig::default();
        cfg.wheel_circumference_mm = 2101; // closer to the 26" entry (2075) than 27.5" (2194)
        assert_eq!(WHEEL_CODES_MM[cfg.wheel_code() as usize], 2075);
    }
}
