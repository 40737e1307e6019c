//! Trigger mode state machine.
//!
//! The sensor arms the endstop either on a frequency threshold (scan) or on
//! the firmware's contact detector (touch). Touch carries the detect
//! threshold it was entered with, so touch-only cleanup cannot run in scan
//! mode and the threshold cannot leak past the mode.

/// Active trigger method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TriggerMode {
    #[default]
    Scan,
    Touch { threshold: u32 },
}

impl TriggerMode {
    /// `trigger_method` field of the home command.
    pub const fn method(self) -> u8 {
        match self {
            Self::Scan => 0,
            Self::Touch { .. } => 1,
        }
    }

    pub const fn is_touch(self) -> bool {
        matches!(self, Self::Touch { .. })
    }

    pub const fn touch_threshold(self) -> Option<u32> {
        match self {
            Self::Scan => None,
            Self::Touch { threshold } => Some(threshold),
        }
    }

    #[must_use]
    pub const fn enter_touch(self, threshold: u32) -> Self {
        Self::Touch { threshold }
    }

    /// Back to the default mode.
    #[must_use]
    pub const fn reset(self) -> Self {
        Self::Scan
    }
}

impl std::fmt::Display for TriggerMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Scan => f.write_str("SCAN"),
            Self::Touch { .. } => f.write_str("TOUCH"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_values() {
        assert_eq!(TriggerMode::Scan.method(), 0);
        assert_eq!(TriggerMode::Scan.enter_touch(2500).method(), 1);
    }

    #[test]
    fn reset_drops_threshold() {
        let m = TriggerMode::default().enter_touch(1750);
        assert_eq!(m.touch_threshold(), Some(1750));
        let m = m.reset();
        assert_eq!(m, TriggerMode::Scan);
        assert_eq!(m.touch_threshold(), None);
    }
}
