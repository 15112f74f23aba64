use std::time::Duration;

use cfg_if::cfg_if;

use tidelink_serde::MTU_SIZE_BITS;

cfg_if! {
    if #[cfg(debug_assertions)] {
        // debug builds hitch under debuggers and instrumented runs; give
        // peers longer before declaring them gone
        const DEFAULT_TIMEOUT_MULTIPLIER: u32 = 4;
    } else {
        const DEFAULT_TIMEOUT_MULTIPLIER: u32 = 1;
    }
}

/// Settings for the out-of-order packet correction cache
#[derive(Clone, Debug)]
pub struct OrderCorrectionConfig {
    /// Master switch for order correction
    pub enabled: bool,
    /// Out-of-order events observed before the cache is allocated at all;
    /// occasional reordering is cheaper to treat as loss
    pub enable_threshold: u32,
    /// Largest sequence gap that will be cached rather than counted as loss
    pub max_missing_packets: i32,
    /// Cache capacity in packets; rounded up to a power of two
    pub max_cached_packets: usize,
    /// How long the cache waits for a missing sequence before giving up and
    /// replaying everything it holds
    pub time_limit: Duration,
}

impl Default for OrderCorrectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            enable_threshold: 6,
            max_missing_packets: 3,
            max_cached_packets: 32,
            time_limit: Duration::from_millis(100),
        }
    }
}

/// Contains Config properties which will be shared by a Connection's
/// send/receive/tick machinery
#[derive(Clone, Debug)]
pub struct ConnectionConfig {
    /// Number of channel slots in the channel table; bunches addressing an
    /// index at or beyond this bound are a protocol violation
    pub max_channels: u32,
    /// The duration to wait before sending a keep-alive packet when no data
    /// has gone out
    pub keep_alive_interval: Duration,
    /// The duration without any received packet after which the connection
    /// is closed with a timeout cause
    pub timeout: Duration,
    /// Multiplier applied to `timeout` (debug builds / lenient deployments)
    pub timeout_multiplier: u32,
    /// Short timeout applied once the owner has marked the connection
    /// pending-destroy, long enough to drain remaining reliable traffic
    pub pending_destroy_timeout: Duration,
    /// Largest packet handed to the transport, in bits
    pub max_packet_bits: u32,
    /// Outgoing bandwidth budget used by the pacing debt counter
    pub net_speed_bits_per_second: u32,
    /// Whether initial packet sequences are randomized rather than zero
    pub randomize_initial_sequence: bool,
    /// Out-of-order correction tunables
    pub order_correction: OrderCorrectionConfig,
    /// Tick every open channel each frame instead of only those that asked
    /// to keep ticking
    pub tick_all_channels: bool,
    /// Flush after every buffered write (debugging aid)
    pub force_flush_on_write: bool,
    /// Rejected operations tolerated within one second before the
    /// connection is treated as abusive and closed
    pub abuse_close_threshold: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_channels: 32,
            keep_alive_interval: Duration::from_secs(4),
            timeout: Duration::from_secs(10),
            timeout_multiplier: DEFAULT_TIMEOUT_MULTIPLIER,
            pending_destroy_timeout: Duration::from_secs(2),
            max_packet_bits: MTU_SIZE_BITS,
            net_speed_bits_per_second: 1_000_000,
            randomize_initial_sequence: false,
            order_correction: OrderCorrectionConfig::default(),
            tick_all_channels: false,
            force_flush_on_write: false,
            abuse_close_threshold: 128,
        }
    }
}
