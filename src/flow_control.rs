//! Flow control (C10): connection- and stream-level, for both directions.
//! Send and receive sides are independent, per §4.10.

/// Receive-side flow control for one scope (connection or a single stream).
pub struct ReceiveFlowControl {
    max_data: u64,
    consumed: u64,
    window: u64,
}

impl ReceiveFlowControl {
    pub fn new(initial_max_data: u64) -> Self {
        Self { max_data: initial_max_data, consumed: 0, window: initial_max_data }
    }

    pub fn max_data(&self) -> u64 {
        self.max_data
    }

    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    /// Records `n` newly consumed bytes. Returns `Some(new_max_data)` if
    /// the window should be doubled and announced (§4.10: past half the
    /// advertised window).
    pub fn on_bytes_consumed(&mut self, n: u64) -> Option<u64> {
        self.consumed += n;
        if self.consumed > self.max_data / 2 {
            self.max_data += self.window;
            Some(self.max_data)
        } else {
            None
        }
    }

    pub fn would_violate(&self, highest_offset: u64) -> bool {
        highest_offset > self.max_data
    }
}

/// Send-side flow control for one scope.
pub struct SendFlowControl {
    max_data: u64,
    sent: u64,
    last_blocked_at: Option<u64>,
}

impl SendFlowControl {
    pub fn new(initial_max_data: u64) -> Self {
        Self { max_data: initial_max_data, sent: 0, last_blocked_at: None }
    }

    pub fn available(&self) -> u64 {
        self.max_data.saturating_sub(self.sent)
    }

    pub fn on_bytes_sent(&mut self, n: u64) {
        self.sent += n;
    }

    pub fn on_max_data_update(&mut self, new_max: u64) {
        if new_max > self.max_data {
            self.max_data = new_max;
            self.last_blocked_at = None;
        }
    }

    /// Returns `true` exactly once per distinct limit value the sender has
    /// hit, so the caller emits DATA_BLOCKED / STREAM_DATA_BLOCKED at most
    /// once per limit (§4.10).
    pub fn should_signal_blocked(&mut self) -> bool {
        if self.available() > 0 {
            return false;
        }
        if self.last_blocked_at == Some(self.max_data) {
            return false;
        }
        self.last_blocked_at = Some(self.max_data);
        true
    }
}

/// Combines a stream's own limit with the connection-wide limit: the
/// stream's effective send budget is the smaller of the two (§4.10).
pub fn effective_send_budget(stream: &SendFlowControl, connection: &SendFlowControl) -> u64 {
    stream.available().min(connection.available())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn receive_window_doubles_past_half_consumption() {
        let mut rfc = ReceiveFlowControl::new(100);
        assert_eq!(rfc.on_bytes_consumed(40), None);
        assert_eq!(rfc.on_bytes_consumed(20), Some(200));
    }

    #[test]
    fn send_blocks_exactly_at_limit_and_signals_once() {
        let mut sfc = SendFlowControl::new(100);
        sfc.on_bytes_sent(100);
        assert_eq!(sfc.available(), 0);
        assert!(sfc.should_signal_blocked());
        assert!(!sfc.should_signal_blocked());
        sfc.on_max_data_update(200);
        sfc.on_bytes_sent(100);
        assert!(sfc.should_signal_blocked());
    }

    #[test]
    fn effective_budget_is_the_tighter_of_stream_and_connection() {
        let mut stream = SendFlowControl::new(50);
        let mut conn = SendFlowControl::new(1000);
        stream.on_bytes_sent(10);
        conn.on_bytes_sent(990);
        assert_eq!(effective_send_budget(&stream, &conn), 10);
    }
}
