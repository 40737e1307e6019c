//! Raw sample buffering and flush policy.

use std::collections::BTreeMap;

use scanner_traits::RawSample;

/// Samples held back before a flush when nobody asked for lower latency.
pub const STREAM_BUFFER_LIMIT_DEFAULT: usize = 100;
/// Seconds without samples, while engaged, before the stream is declared dead.
pub const STREAM_TIMEOUT: f64 = 2.0;

/// Handle of an outstanding latency request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct LatencyKey(u64);

/// Append-only buffer of raw samples with a latency-driven flush limit.
///
/// Samples are released in arrival order. A batch is released when the
/// stream is disengaged, when the buffer reaches the current limit, or once
/// right after the limit was lowered.
#[derive(Debug, Default)]
pub struct StreamBuffer {
    buffer: Vec<RawSample>,
    limit: usize,
    limit_lowered: bool,
    requests: BTreeMap<LatencyKey, usize>,
}

impl StreamBuffer {
    pub fn new() -> Self {
        Self {
            limit: STREAM_BUFFER_LIMIT_DEFAULT,
            ..Self::default()
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Ask for batches of at most `samples`.
    pub fn request_latency(&mut self, samples: usize) -> LatencyKey {
        let key = LatencyKey(self.requests.keys().next_back().map_or(0, |k| k.0 + 1));
        self.requests.insert(key, samples);
        self.update_limit();
        key
    }

    pub fn drop_latency(&mut self, key: LatencyKey) {
        self.requests.remove(&key);
        self.update_limit();
    }

    fn update_limit(&mut self) {
        let wanted = self
            .requests
            .values()
            .copied()
            .min()
            .unwrap_or(STREAM_BUFFER_LIMIT_DEFAULT)
            .clamp(1, STREAM_BUFFER_LIMIT_DEFAULT);
        if wanted < self.limit {
            self.limit_lowered = true;
        }
        self.limit = wanted;
    }

    pub fn push(&mut self, raw: RawSample) {
        self.buffer.push(raw);
    }

    /// Release the pending batch if the flush policy allows it.
    pub fn take_batch(&mut self, engaged: bool) -> Option<Vec<RawSample>> {
        if self.buffer.is_empty() {
            return None;
        }
        let force = !engaged || std::mem::take(&mut self.limit_lowered);
        if force || self.buffer.len() >= self.limit {
            return Some(std::mem::take(&mut self.buffer));
        }
        None
    }

    /// Release everything regardless of policy.
    pub fn drain(&mut self) -> Vec<RawSample> {
        self.limit_lowered = false;
        std::mem::take(&mut self.buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(clock: u32) -> RawSample {
        RawSample {
            clock,
            data: clock,
            temp: 0,
        }
    }

    #[test]
    fn holds_until_limit_then_releases_in_order() {
        let mut b = StreamBuffer::new();
        let key = b.request_latency(3);
        assert!(b.take_batch(true).is_none());
        b.push(raw(1));
        // The lowered limit forces one early flush.
        assert_eq!(b.take_batch(true).map(|v| v.len()), Some(1));
        b.push(raw(2));
        b.push(raw(3));
        assert!(b.take_batch(true).is_none());
        b.push(raw(4));
        let batch = b.take_batch(true).unwrap();
        assert_eq!(batch.iter().map(|r| r.clock).collect::<Vec<_>>(), [2, 3, 4]);
        b.drop_latency(key);
        assert_eq!(b.limit(), STREAM_BUFFER_LIMIT_DEFAULT);
    }

    #[test]
    fn limit_is_min_of_requests_clamped() {
        let mut b = StreamBuffer::new();
        let a = b.request_latency(500);
        assert_eq!(b.limit(), STREAM_BUFFER_LIMIT_DEFAULT);
        let c = b.request_latency(0);
        assert_eq!(b.limit(), 1);
        b.drop_latency(c);
        assert_eq!(b.limit(), STREAM_BUFFER_LIMIT_DEFAULT);
        b.drop_latency(a);
    }

    #[test]
    fn disengaged_stream_flushes_everything() {
        let mut b = StreamBuffer::new();
        b.push(raw(1));
        b.push(raw(2));
        assert!(b.take_batch(true).is_none());
        assert_eq!(b.take_batch(false).map(|v| v.len()), Some(2));
    }

    #[test]
    fn keys_follow_the_largest_outstanding() {
        let mut b = StreamBuffer::new();
        let k0 = b.request_latency(10);
        let k1 = b.request_latency(20);
        assert!(k1 > k0);
        b.drop_latency(k1);
        let k2 = b.request_latency(30);
        assert_eq!(k2, k1);
    }
}
