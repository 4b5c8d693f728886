use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, AddAssign, Sub};

/// An address in the traced child's address space. Arithmetic is explicit
/// and the value never turns into a host reference; everything that touches
/// guest memory goes through a `GuestMem` view.
#[derive(
    Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize,
)]
pub struct GuestPtr(pub u64);

impl GuestPtr {
    pub fn null() -> GuestPtr {
        GuestPtr(0)
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    pub fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// Byte distance to `other`, which must not be above `self`.
    pub fn offset_from(self, other: GuestPtr) -> u64 {
        debug_assert!(self.0 >= other.0);
        self.0 - other.0
    }
}

impl Add<u64> for GuestPtr {
    type Output = GuestPtr;

    fn add(self, rhs: u64) -> GuestPtr {
        GuestPtr(self.0.wrapping_add(rhs))
    }
}

impl Add<usize> for GuestPtr {
    type Output = GuestPtr;

    fn add(self, rhs: usize) -> GuestPtr {
        GuestPtr(self.0.wrapping_add(rhs as u64))
    }
}

impl AddAssign<u64> for GuestPtr {
    fn add_assign(&mut self, rhs: u64) {
        self.0 = self.0.wrapping_add(rhs);
    }
}

impl Sub<u64> for GuestPtr {
    type Output = GuestPtr;

    fn sub(self, rhs: u64) -> GuestPtr {
        GuestPtr(self.0.wrapping_sub(rhs))
    }
}

impl From<u64> for GuestPtr {
    fn from(v: u64) -> GuestPtr {
        GuestPtr(v)
    }
}

impl fmt::Display for GuestPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Debug for GuestPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arithmetic() {
        let p = GuestPtr(0x1000);
        assert_eq!(p + 0x10u64, GuestPtr(0x1010));
        assert_eq!(p - 0x10, GuestPtr(0xff0));
        assert_eq!((p + 8usize).offset_from(p), 8);
        assert!(GuestPtr::null().is_null());
        assert!(!p.is_null());
    }

    #[test]
    fn ordering_and_display() {
        assert!(GuestPtr(1) < GuestPtr(2));
        assert_eq!(format!("{}", GuestPtr(0xdead)), "0xdead");
    }
}
