//! Engine configuration.

use crate::address::Ipv4Address;
use std::time::Duration;
use thiserror::Error as ThisError;

/// Tunables for an [`Engine`](crate::Engine).
///
/// Queue capacity only affects throughput. Timer durations are converted to
/// scan rounds using `step_period`: one scan round visits every session once
/// and takes `max_sessions` steps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToeConfig {
    /// The address the engine terminates connections for
    pub local_address: Ipv4Address,
    /// The number of session slots in every table
    pub max_sessions: u16,
    /// Bytes in each session's receive buffer and in each session's transmit
    /// buffer. Must be a power of two.
    pub buffer_size: u32,
    /// Capacity of every inter-stage queue, at least two
    pub queue_capacity: usize,
    /// Wall-clock time represented by one engine step
    pub step_period: Duration,
    /// Maximum segment size used for congestion window growth
    pub mss: u16,
    /// Initial slow start threshold
    pub slow_start_threshold: u32,
    /// Retransmission timeouts indexed by retry count. The last entry applies
    /// to every retry beyond the list.
    pub retransmit_stages: Vec<Duration>,
    /// Expiries after which a session is aborted
    pub max_retries: u8,
    /// How long a session lingers in TIME_WAIT
    pub time_wait: Duration,
    /// Delay before a zero-window probe is requested
    pub probe_interval: Duration,
    /// Physical base address of the receive buffers
    pub rx_base: u64,
    /// Physical base address of the transmit buffers
    pub tx_base: u64,
    /// Fixed initial sequence number. A random one is drawn per connection
    /// when unset.
    pub fixed_iss: Option<u32>,
}

impl Default for ToeConfig {
    fn default() -> Self {
        let max_sessions = 1024;
        let buffer_size = 0x1_0000;
        Self {
            local_address: Ipv4Address::new([10, 0, 0, 1]),
            max_sessions,
            buffer_size,
            queue_capacity: 32,
            step_period: Duration::from_micros(1),
            mss: 1460,
            slow_start_threshold: 0xffff,
            retransmit_stages: vec![
                Duration::from_secs(1),
                Duration::from_secs(5),
                Duration::from_secs(10),
                Duration::from_secs(15),
                Duration::from_secs(30),
            ],
            max_retries: 4,
            time_wait: Duration::from_secs(60),
            probe_interval: Duration::from_millis(100),
            rx_base: 0,
            tx_base: max_sessions as u64 * buffer_size as u64,
            fixed_iss: None,
        }
    }
}

impl ToeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn local_address(mut self, address: Ipv4Address) -> Self {
        self.local_address = address;
        self
    }

    /// Sets the session count and moves the transmit region right behind the
    /// receive region.
    pub fn max_sessions(mut self, sessions: u16) -> Self {
        self.max_sessions = sessions;
        self.tx_base = self.rx_base + self.rx_region_len();
        self
    }

    /// Sets the per-session buffer size and moves the transmit region right
    /// behind the receive region.
    pub fn buffer_size(mut self, size: u32) -> Self {
        self.buffer_size = size;
        self.tx_base = self.rx_base + self.rx_region_len();
        self
    }

    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn step_period(mut self, period: Duration) -> Self {
        self.step_period = period;
        self
    }

    pub fn retransmit_stages(mut self, stages: Vec<Duration>) -> Self {
        self.retransmit_stages = stages;
        self
    }

    pub fn max_retries(mut self, retries: u8) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn time_wait(mut self, time_wait: Duration) -> Self {
        self.time_wait = time_wait;
        self
    }

    pub fn probe_interval(mut self, interval: Duration) -> Self {
        self.probe_interval = interval;
        self
    }

    pub fn fixed_iss(mut self, iss: u32) -> Self {
        self.fixed_iss = Some(iss);
        self
    }

    /// Checks that the configuration describes a usable engine.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_sessions == 0 {
            Err(ConfigError::NoSessions)?
        }
        if !self.buffer_size.is_power_of_two() || self.buffer_size < 2 {
            Err(ConfigError::BufferSize(self.buffer_size))?
        }
        if self.queue_capacity < 2 {
            Err(ConfigError::QueueCapacity)?
        }
        if self.step_period.is_zero() {
            Err(ConfigError::StepPeriod)?
        }
        if self.retransmit_stages.is_empty() {
            Err(ConfigError::NoRetransmitStages)?
        }
        if self.max_retries == 0 {
            Err(ConfigError::NoRetries)?
        }
        let rx = self.rx_base..self.rx_base + self.rx_region_len();
        let tx = self.tx_base..self.tx_base + self.rx_region_len();
        if rx.start < tx.end && tx.start < rx.end {
            Err(ConfigError::OverlappingRegions)?
        }
        Ok(())
    }

    /// Bytes covered by all receive buffers together.
    pub fn rx_region_len(&self) -> u64 {
        self.max_sessions as u64 * self.buffer_size as u64
    }

    /// The number of scan rounds that cover `duration`, at least one.
    pub fn rounds(&self, duration: Duration) -> u32 {
        let round = (self.step_period.as_nanos() * self.max_sessions as u128).max(1);
        let rounds = (duration.as_nanos() + round - 1) / round;
        rounds.clamp(1, u32::MAX as u128) as u32
    }

    /// The retransmission timeout for the given retry count, in scan rounds.
    pub fn retransmit_rounds(&self, retries: u8) -> u32 {
        let stage = (retries as usize).min(self.retransmit_stages.len() - 1);
        self.rounds(self.retransmit_stages[stage])
    }
}

/// A configuration that cannot drive an engine
#[derive(Debug, ThisError, PartialEq, Eq, Clone, Copy)]
pub enum ConfigError {
    #[error("At least one session slot is required")]
    NoSessions,
    #[error("Buffer size {0} is not a power of two")]
    BufferSize(u32),
    #[error("Queues need room for at least two items")]
    QueueCapacity,
    #[error("The step period must be nonzero")]
    StepPeriod,
    #[error("At least one retransmission stage is required")]
    NoRetransmitStages,
    #[error("At least one retransmission attempt is required")]
    NoRetries,
    #[error("The receive and transmit buffer regions overlap")]
    OverlappingRegions,
}
