//! Per-connection traffic counters, printed at teardown when `-S` is set.

#[derive(Clone, Copy, Debug, Default)]
pub struct Stats {
    pub shift_count: u64,
    pub chunk_count: u64,
    pub bit_count: u64,
    pub largest_shift_request_bits: usize,
    pub largest_write_request_bytes: usize,
    pub largest_write_sent_bytes: usize,
    pub largest_read_request_bytes: usize,
}

impl Stats {
    pub fn record_shift(&mut self, n_bits: usize) {
        self.shift_count += 1;
        self.bit_count += n_bits as u64;
        self.largest_shift_request_bits = self.largest_shift_request_bits.max(n_bits);
    }

    pub fn record_chunk(&mut self, write_len: usize, read_len: usize) {
        self.chunk_count += 1;
        self.largest_write_request_bytes = self.largest_write_request_bytes.max(write_len);
        self.largest_write_sent_bytes = self.largest_write_sent_bytes.max(write_len);
        self.largest_read_request_bytes = self.largest_read_request_bytes.max(read_len);
    }
}

impl std::fmt::Display for Stats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "shifts={} chunks={} bits={} largest_shift={}b largest_write_req={}B largest_write_sent={}B largest_read_req={}B",
            self.shift_count,
            self.chunk_count,
            self.bit_count,
            self.largest_shift_request_bits,
            self.largest_write_request_bytes,
            self.largest_write_sent_bytes,
            self.largest_read_request_bytes,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_running_maxima() {
        let mut stats = Stats::default();
        stats.record_shift(8);
        stats.record_shift(128);
        stats.record_shift(32);
        assert_eq!(stats.shift_count, 3);
        assert_eq!(stats.bit_count, 168);
        assert_eq!(stats.largest_shift_request_bits, 128);
    }
}
