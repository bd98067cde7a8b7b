//! Counters and health status surfaced for the (out-of-scope) telemetry
//! collaborator, in the style of the teacher's `SystemStatus`/`ArmStatus`
//! small status types.

/// Running counters maintained by the ISR channel. Read (not written) by the
/// main loop; `isr::Channel::get_stats` returns a copy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(not(test), derive(defmt::Format))]
pub struct Stats {
    pub tx_count: u32,
    pub rx_count: u32,
    pub rx_errors: u32,
    pub timeouts: u32,
    pub queue_full: u32,
    pub last_rx_ms: u32,
}

/// Main-loop-only counters maintained by the command processor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(not(test), derive(defmt::Format))]
pub struct CmdStats {
    pub parse_errors: u32,
}

/// Link health, as observed by the main loop. `Disconnected` carries "how
/// long", since lost-link procedures (out of scope here) care about it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(not(test), derive(defmt::Format))]
pub enum LinkHealth {
    /// No frame decoded yet since boot.
    AwaitingFirstFrame,
    /// Motor traffic is current; status cache is valid.
    Connected,
    /// `(now - last_motor_ms) > 500`; status cache is stale, comm fault latched.
    CommFault,
}

impl Default for LinkHealth {
    fn default() -> Self {
        Self::AwaitingFirstFrame
    }
}
