//! MCU transport thread.
//!
//! Spawns a thread that owns the `SampleSource`, forwards raw samples over a
//! bounded channel in arrival order and tracks the last-ok timestamp for the
//! stream watchdog. The reactor side consumes it through `SampleFeed`.
//!
//! Each `SampleTransport` owns exactly one thread, shut down and joined on
//! drop.
use crossbeam_channel as xch;
use scanner_traits::clock::Clock;
use scanner_traits::{RawSample, SampleFeed, SampleSource};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Raw samples in flight between the transport thread and the reactor.
pub const TRANSPORT_CAPACITY: usize = 1024;

pub struct SampleTransport {
    rx: xch::Receiver<RawSample>,
    last_ok: Arc<AtomicU64>,
    epoch: Instant,
    shutdown: Arc<AtomicBool>,
    join_handle: Option<std::thread::JoinHandle<()>>,
}

impl SampleTransport {
    /// Start reading `source`; each read blocks at most `read_timeout`.
    pub fn spawn<S: SampleSource + 'static, C: Clock + Send + Sync + 'static>(
        mut source: S,
        read_timeout: Duration,
        clock: C,
    ) -> Self {
        let (tx, rx) = xch::bounded(TRANSPORT_CAPACITY);
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_clone = shutdown.clone();
        let last_ok = Arc::new(AtomicU64::new(0));
        let last_ok_clone = last_ok.clone();
        let epoch = clock.now();

        let join_handle = std::thread::spawn(move || {
            tracing::debug!("transport thread started");
            loop {
                if shutdown_clone.load(Ordering::Relaxed) {
                    tracing::debug!("transport thread received shutdown signal");
                    break;
                }

                match source.read(read_timeout) {
                    Ok(Some(raw)) => {
                        // Blocking send keeps every sample; only a dead consumer ends the loop.
                        if tx.send(raw).is_err() {
                            tracing::debug!("transport consumer disconnected, exiting thread");
                            break;
                        }
                        let now = clock.now().saturating_duration_since(epoch).as_millis();
                        last_ok_clone.store(now.min(u128::from(u64::MAX)) as u64, Ordering::Relaxed);
                    }
                    Ok(None) => {}
                    Err(e) => {
                        // The reactor's stream watchdog decides whether silence is fatal.
                        tracing::trace!(error = %e, "sample read failed");
                    }
                }
            }
            tracing::trace!("transport thread exiting cleanly");
        });

        Self {
            rx,
            last_ok,
            epoch,
            shutdown,
            join_handle: Some(join_handle),
        }
    }

    /// Milliseconds since the last sample arrived, measured on `now_ms`
    /// relative to this transport's epoch.
    pub fn stalled_for(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.last_ok.load(Ordering::Relaxed))
    }

    pub fn stalled_for_now(&self) -> u64 {
        let ms = Instant::now().saturating_duration_since(self.epoch).as_millis();
        self.stalled_for(ms.min(u128::from(u64::MAX)) as u64)
    }

    /// Samples already queued.
    pub fn pending(&self) -> usize {
        self.rx.len()
    }
}

impl SampleFeed for SampleTransport {
    fn recv(&mut self, timeout: Duration) -> Option<RawSample> {
        self.rx.recv_timeout(timeout).ok()
    }
}

impl Drop for SampleTransport {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        // Unblock a sender stuck on a full channel.
        while self.rx.try_recv().is_ok() {}
        if let Some(handle) = self.join_handle.take() {
            // A send may block again before the flag is seen; keep draining.
            while !handle.is_finished() {
                while self.rx.try_recv().is_ok() {}
                std::thread::sleep(Duration::from_millis(1));
            }
            match handle.join() {
                Ok(()) => {
                    tracing::trace!("transport thread joined successfully");
                }
                Err(e) => {
                    tracing::warn!(?e, "transport thread panicked during shutdown");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scanner_hardware::ReplaySource;
    use scanner_traits::MonotonicClock;

    fn raw(clock: u32) -> RawSample {
        RawSample {
            clock,
            data: 1000 + clock,
            temp: 0,
        }
    }

    #[test]
    fn forwards_samples_in_order() {
        let src = ReplaySource::new((0..50).map(raw));
        let mut t = SampleTransport::spawn(src, Duration::from_millis(5), MonotonicClock::new());
        let mut got = Vec::new();
        while got.len() < 50 {
            match t.recv(Duration::from_secs(2)) {
                Some(s) => got.push(s.clock),
                None => break,
            }
        }
        assert_eq!(got, (0..50).collect::<Vec<_>>());
        assert!(t.recv(Duration::from_millis(20)).is_none());
    }

    #[test]
    fn drop_joins_with_full_channel() {
        let src = ReplaySource::new((0..(TRANSPORT_CAPACITY as u32 * 2)).map(raw));
        let t = SampleTransport::spawn(src, Duration::from_millis(5), MonotonicClock::new());
        std::thread::sleep(Duration::from_millis(20));
        drop(t);
    }
}
