use std::{fmt, ops};

/// Readiness interest a [`Channel`] registers with its loop's poller.
///
/// Unlike a registration-time-only interest set, the empty mask is a
/// meaningful state here: a channel with no interest bits is detached from
/// the kernel but may be re-armed later.
///
/// [`Channel`]: crate::channel::Channel
#[derive(Copy, Clone, PartialEq, Eq)]
#[repr(transparent)]
pub struct Interest(u8);

const READABLE: u8 = 0b01;
const WRITABLE: u8 = 0b10;

impl Interest {
    /// The empty interest set.
    pub const NONE: Interest = Interest(0);

    /// Interest in read readiness.
    pub const READABLE: Interest = Interest(READABLE);

    /// Interest in write readiness.
    pub const WRITABLE: Interest = Interest(WRITABLE);

    /// Add together two `Interest`s.
    pub const fn add(self, other: Interest) -> Interest {
        Interest(self.0 | other.0)
    }

    /// Remove `other` from `self`.
    pub const fn remove(self, other: Interest) -> Interest {
        Interest(self.0 & !other.0)
    }

    /// Returns true if the value includes readable interest.
    pub const fn is_readable(self) -> bool {
        (self.0 & READABLE) != 0
    }

    /// Returns true if the value includes writable interest.
    pub const fn is_writable(self) -> bool {
        (self.0 & WRITABLE) != 0
    }

    /// Returns true if no interest bits are set.
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub(crate) const fn bits(self) -> u8 {
        self.0
    }

    pub(crate) const fn from_bits(bits: u8) -> Interest {
        Interest(bits)
    }
}

impl ops::BitOr for Interest {
    type Output = Self;

    #[inline]
    fn bitor(self, other: Self) -> Self {
        self.add(other)
    }
}

impl ops::BitOrAssign for Interest {
    #[inline]
    fn bitor_assign(&mut self, other: Self) {
        *self = self.add(other);
    }
}

impl fmt::Debug for Interest {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut one = false;
        if self.is_readable() {
            write!(fmt, "READABLE")?;
            one = true;
        }
        if self.is_writable() {
            if one {
                write!(fmt, " | ")?;
            }
            write!(fmt, "WRITABLE")?;
            one = true;
        }
        if !one {
            write!(fmt, "NONE")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::Interest;

    #[test]
    fn add_and_remove() {
        let both = Interest::READABLE | Interest::WRITABLE;
        assert!(both.is_readable());
        assert!(both.is_writable());

        let read_only = both.remove(Interest::WRITABLE);
        assert!(read_only.is_readable());
        assert!(!read_only.is_writable());

        assert!(read_only.remove(Interest::READABLE).is_empty());
    }

    #[test]
    fn empty_is_distinct() {
        assert!(Interest::NONE.is_empty());
        assert!(!Interest::NONE.is_readable());
        assert_ne!(Interest::NONE, Interest::READABLE);
    }

    #[test]
    fn debug_output() {
        assert_eq!(format!("{:?}", Interest::READABLE), "READABLE");
        assert_eq!(
            format!("{:?}", Interest::READABLE | Interest::WRITABLE),
            "READABLE | WRITABLE"
        );
        assert_eq!(format!("{:?}", Interest::NONE), "NONE");
    }
}
