use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

const MICROS_PER_SECOND: i64 = 1_000_000;

/// A microsecond-resolution wall-clock time point.
///
/// The loop stamps each poller return with one of these and hands it to
/// every read callback of that dispatch batch, so handlers can account
/// for receive latency without re-reading the clock per channel.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp {
    micros_since_epoch: i64,
}

impl Timestamp {
    /// The current wall-clock time.
    pub fn now() -> Self {
        let since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            micros_since_epoch: since_epoch.as_micros() as i64,
        }
    }

    /// A timestamp that orders before every valid one.
    pub fn invalid() -> Self {
        Self::default()
    }

    pub fn is_valid(&self) -> bool {
        self.micros_since_epoch > 0
    }

    pub fn micros_since_epoch(&self) -> i64 {
        self.micros_since_epoch
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let seconds = self.micros_since_epoch / MICROS_PER_SECOND;
        let micros = self.micros_since_epoch % MICROS_PER_SECOND;
        write!(f, "{}.{:06}", seconds, micros)
    }
}
