// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Sector quantities and the arithmetic the table compiler relies on.

use std::{
    fmt,
    iter::Sum,
    ops::{Add, AddAssign, Deref, Sub},
};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::result::{DmError, DmResult, ErrorEnum};

/// The size of a sector in bytes. All sizes and offsets in this library
/// are counts of these.
pub const SECTOR_SIZE: usize = 512;

/// A count of 512-byte sectors.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Sectors(pub u64);

impl Sectors {
    /// The sum of self and rhs, or None on overflow.
    pub fn checked_add(self, rhs: Sectors) -> Option<Sectors> {
        self.0.checked_add(rhs.0).map(Sectors)
    }
}

impl Deref for Sectors {
    type Target = u64;

    fn deref(&self) -> &u64 {
        &self.0
    }
}

impl From<u64> for Sectors {
    fn from(val: u64) -> Sectors {
        Sectors(val)
    }
}

impl Add for Sectors {
    type Output = Sectors;

    fn add(self, rhs: Sectors) -> Sectors {
        Sectors(self.0 + rhs.0)
    }
}

impl AddAssign for Sectors {
    fn add_assign(&mut self, rhs: Sectors) {
        self.0 += rhs.0
    }
}

impl Sub for Sectors {
    type Output = Sectors;

    fn sub(self, rhs: Sectors) -> Sectors {
        Sectors(self.0 - rhs.0)
    }
}

impl Sum for Sectors {
    fn sum<I: Iterator<Item = Sectors>>(iter: I) -> Sectors {
        iter.fold(Sectors(0), |a, b| a + b)
    }
}

impl fmt::Display for Sectors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for Sectors {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(self.0)
    }
}

impl<'de> Deserialize<'de> for Sectors {
    fn deserialize<D>(deserializer: D) -> Result<Sectors, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Sectors(u64::deserialize(deserializer)?))
    }
}

/// The smallest multiple of size that is not less than n.
pub fn round_up(n: u64, size: u64) -> DmResult<u64> {
    if size == 0 {
        return Err(DmError::Dm(
            ErrorEnum::Invalid,
            "round_up size must be non-zero".into(),
        ));
    }
    let r = n % size;
    let pad = if r == 0 { 0 } else { size - r };
    n.checked_add(pad).ok_or_else(|| {
        DmError::Dm(
            ErrorEnum::Overflow,
            format!("rounding {n} up to a multiple of {size} overflows"),
        )
    })
}

/// ceiling(n / size)
pub fn div_up(n: u64, size: u64) -> DmResult<u64> {
    Ok(round_up(n, size)? / size)
}

/// The smallest non-negative k such that base^k >= n, computed by
/// iterated div_up.
pub fn int_log(base: u64, n: u64) -> DmResult<u32> {
    if base < 2 {
        return Err(DmError::Dm(
            ErrorEnum::Invalid,
            "int_log base must be at least 2".into(),
        ));
    }

    let mut n = n;
    let mut result = 0;
    while n > 1 {
        n = div_up(n, base)?;
        result += 1;
    }

    Ok(result)
}
