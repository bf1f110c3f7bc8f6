//! Timing and limit parameters of the transport layer.

/// Parameter set shared by transmitter and receiver. All values are fixed
/// once constructed; no copy is held inside the protocol components.
///
/// Timeouts are configured in milliseconds and converted to microseconds
/// at use, since all timer comparisons run over the 32 bit microsecond
/// tick domain supplied by `now_us`.
pub struct DoCanParameters<'p> {
    now_us: &'p dyn Fn() -> u32,
    wait_allocate_timeout_ms: u16,
    wait_rx_timeout_ms: u16,
    wait_tx_callback_timeout_ms: u16,
    wait_flow_control_timeout_ms: u16,
    max_allocate_retry_count: u8,
    max_flow_control_wait_count: u8,
    min_separation_time_us: u32,
    max_block_size: u8,
}

impl<'p> DoCanParameters<'p> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        now_us: &'p dyn Fn() -> u32,
        wait_allocate_timeout_ms: u16,
        wait_rx_timeout_ms: u16,
        wait_tx_callback_timeout_ms: u16,
        wait_flow_control_timeout_ms: u16,
        max_allocate_retry_count: u8,
        max_flow_control_wait_count: u8,
        min_separation_time_us: u32,
        max_block_size: u8,
    ) -> Self {
        Self {
            now_us,
            wait_allocate_timeout_ms,
            wait_rx_timeout_ms,
            wait_tx_callback_timeout_ms,
            wait_flow_control_timeout_ms,
            max_allocate_retry_count,
            max_flow_control_wait_count,
            min_separation_time_us,
            max_block_size,
        }
    }

    /// Current value of the free running microsecond tick counter.
    #[inline]
    pub fn now_us(&self) -> u32 {
        (self.now_us)()
    }

    /// Timeout for allocating a message buffer, in microseconds.
    pub fn wait_allocate_timeout_us(&self) -> u32 {
        u32::from(self.wait_allocate_timeout_ms) * 1000
    }

    /// Timeout for the next consecutive frame of a reception, in
    /// microseconds.
    pub fn wait_rx_timeout_us(&self) -> u32 {
        u32::from(self.wait_rx_timeout_ms) * 1000
    }

    /// Timeout for the transmit confirmation of a sent frame, in
    /// microseconds.
    pub fn wait_tx_callback_timeout_us(&self) -> u32 {
        u32::from(self.wait_tx_callback_timeout_ms) * 1000
    }

    /// Timeout for an expected flow control frame, in microseconds.
    pub fn wait_flow_control_timeout_us(&self) -> u32 {
        u32::from(self.wait_flow_control_timeout_ms) * 1000
    }

    /// Maximum number of buffer allocation attempts per reception.
    pub fn max_allocate_retry_count(&self) -> u8 {
        self.max_allocate_retry_count
    }

    /// Maximum number of consecutive WAIT flow control frames accepted
    /// from a receiver.
    pub fn max_flow_control_wait_count(&self) -> u8 {
        self.max_flow_control_wait_count
    }

    /// Minimum separation time advertised in outgoing flow control
    /// frames, in microseconds.
    pub fn min_separation_time_us(&self) -> u32 {
        self.min_separation_time_us
    }

    /// Block size advertised in outgoing flow control frames (0 = no
    /// further flow control until the end of the message).
    pub fn max_block_size(&self) -> u8 {
        self.max_block_size
    }

    /// The configured minimum separation time in its wire encoding.
    pub fn encoded_min_separation_time(&self) -> u8 {
        encode_min_separation_time(self.min_separation_time_us)
    }
}

/// Decodes a wire encoded minimum separation time into microseconds.
///
/// `0x00..=0x7F` encode whole milliseconds, `0xF1..=0xF9` encode 100 to
/// 900 microseconds. All other values are reserved and read as zero.
pub fn decode_min_separation_time(encoded: u8) -> u32 {
    match encoded {
        0x00..=0x7f => u32::from(encoded) * 1000,
        0xf1..=0xf9 => u32::from(encoded - 0xf0) * 100,
        _ => 0,
    }
}

/// Encodes a minimum separation time given in microseconds.
///
/// Sub-millisecond values are rounded up to the next 100 microsecond
/// step; values of a millisecond and above are rounded up to whole
/// milliseconds and saturate at the maximum encodable 127 ms.
pub fn encode_min_separation_time(micros: u32) -> u8 {
    if micros == 0 {
        0
    } else if micros < 1000 {
        0xf0 + micros.div_ceil(100) as u8
    } else {
        micros.div_ceil(1000).min(0x7f) as u8
    }
}
