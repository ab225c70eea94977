use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

const MICROS_PER_SECOND: i64 = 1_000_000;

/// Microsecond-precision wall-clock timestamp.
///
/// Each poll iteration produces one timestamp, taken right after the wait
/// returns; it is handed to the read path so message callbacks observe the
/// receive time without an extra clock read per connection.
#[derive(Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct Timestamp {
    micros_since_epoch: i64,
}

impl Timestamp {
    /// The current wall-clock time.
    pub fn now() -> Timestamp {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as i64)
            .unwrap_or(0);
        Timestamp {
            micros_since_epoch: micros,
        }
    }

    /// An invalid (zero) timestamp.
    pub fn invalid() -> Timestamp {
        Timestamp::default()
    }

    /// Whether this timestamp holds a real point in time.
    pub fn is_valid(&self) -> bool {
        self.micros_since_epoch > 0
    }

    /// Microseconds since the Unix epoch.
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
