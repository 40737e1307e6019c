use std::collections::VecDeque;
use std::time::Duration;

use scanner_traits::{HostResult, RawSample, SampleSource};

use crate::error::HwError;

/// Sample source replaying a recorded sequence, optionally paced.
///
/// Once drained it behaves like a silent link and reports timeouts, or
/// errors if `fail_when_drained` is set.
#[derive(Debug, Default)]
pub struct ReplaySource {
    samples: VecDeque<RawSample>,
    period: Duration,
    fail_when_drained: bool,
}

impl ReplaySource {
    pub fn new(samples: impl IntoIterator<Item = RawSample>) -> Self {
        Self {
            samples: samples.into_iter().collect(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    #[must_use]
    pub fn fail_when_drained(mut self) -> Self {
        self.fail_when_drained = true;
        self
    }

    pub fn remaining(&self) -> usize {
        self.samples.len()
    }
}

impl SampleSource for ReplaySource {
    fn read(&mut self, timeout: Duration) -> HostResult<Option<RawSample>> {
        match self.samples.pop_front() {
            Some(s) => {
                if !self.period.is_zero() {
                    std::thread::sleep(self.period);
                }
                Ok(Some(s))
            }
            None if self.fail_when_drained => Err(Box::new(HwError::Timeout)),
            None => {
                std::thread::sleep(timeout.min(Duration::from_millis(2)));
                Ok(None)
            }
        }
    }
}
