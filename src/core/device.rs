// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::{
    collections::BTreeSet,
    fmt,
    fs::File,
    io::{BufRead, BufReader},
    path::{Path, PathBuf},
    str::FromStr,
};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::result::{DmError, DmResult, ErrorEnum};

/// A struct containing the device's major and minor numbers
///
/// Also allows conversion to/from a single 64bit value.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Copy)]
pub struct Device {
    /// Device major number
    pub major: u32,
    /// Device minor number
    pub minor: u32,
}

impl Device {
    /// Make a Device from a kernel encoded dev_t, the "huge" format
    /// used in ioctl response payloads.
    pub fn from_kdev_t(val: u32) -> Device {
        Device {
            major: (val & 0xfff00) >> 8,
            minor: (val & 0xff) | ((val >> 12) & 0xfff00),
        }
    }

    /// Convert to the kernel encoded dev_t format.
    pub fn to_kdev_t(self) -> Option<u32> {
        if self.major > 0xfff || self.minor > 0xfffff {
            return None;
        }
        Some((self.minor & 0xff) | (self.major << 8) | ((self.minor & !0xffu32) << 12))
    }

    /// Returns the path in `/dev` that corresponds with the device
    /// number, if /proc/partitions lists one.
    pub fn path(&self) -> DmResult<Option<PathBuf>> {
        let f = File::open("/proc/partitions")
            .map_err(|err| DmError::Dm(ErrorEnum::NotFound, err.to_string()))?;

        for line in BufReader::new(f).lines().skip(2) {
            let line = line.map_err(|err| DmError::Dm(ErrorEnum::Invalid, err.to_string()))?;
            let spl: Vec<_> = line.split_whitespace().collect();
            if spl.len() < 4 {
                continue;
            }

            if spl[0].parse::<u32>() == Ok(self.major) && spl[1].parse::<u32>() == Ok(self.minor) {
                return Ok(Some(PathBuf::from(format!("/dev/{}", spl[3]))));
            }
        }
        Ok(None)
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.major, self.minor)
    }
}

impl FromStr for Device {
    type Err = DmError;

    /// Parse a "major:minor" pair, or failing that take the device
    /// number of the node at the given path.
    fn from_str(s: &str) -> DmResult<Device> {
        if let Some((maj, min)) = s.split_once(':') {
            if let (Ok(major), Ok(minor)) = (maj.parse::<u32>(), min.parse::<u32>()) {
                return Ok(Device { major, minor });
            }
        }

        match nix::sys::stat::stat(Path::new(s)) {
            Ok(metadata) => Ok(Device::from(metadata.st_rdev)),
            Err(err) => Err(DmError::Dm(
                ErrorEnum::NotFound,
                format!("{s} is neither a major:minor pair nor a device node: {err}"),
            )),
        }
    }
}

impl From<u64> for Device {
    fn from(val: u64) -> Device {
        Device {
            major: nix::sys::stat::major(val) as u32,
            minor: nix::sys::stat::minor(val) as u32,
        }
    }
}

impl From<Device> for u64 {
    fn from(dev: Device) -> u64 {
        nix::sys::stat::makedev(u64::from(dev.major), u64::from(dev.minor))
    }
}

impl Serialize for Device {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{self}"))
    }
}

impl<'de> Deserialize<'de> for Device {
    fn deserialize<D>(deserializer: D) -> Result<Device, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        let (maj, min) = text
            .split_once(':')
            .ok_or_else(|| serde::de::Error::custom("expected a major:minor pair"))?;
        Ok(Device {
            major: maj.parse().map_err(serde::de::Error::custom)?,
            minor: min.parse().map_err(serde::de::Error::custom)?,
        })
    }
}

/// Major numbers claimed by device-mapper, from /proc/devices.
pub fn dm_majors() -> DmResult<BTreeSet<u32>> {
    let mut set = BTreeSet::new();

    let f = File::open("/proc/devices")
        .map_err(|err| DmError::Dm(ErrorEnum::NotFound, err.to_string()))?;

    for line in BufReader::new(f)
        .lines()
        .map_while(|x| x.ok())
        .skip_while(|x| x != "Block devices:")
        .skip(1)
    {
        let spl: Vec<_> = line.split_whitespace().collect();
        if spl.len() == 2 && spl[1] == "device-mapper" {
            if let Ok(major) = spl[0].parse::<u32>() {
                set.insert(major);
            }
        }
    }

    Ok(set)
}

/// Determine whether a major number belongs to device-mapper or not.
pub fn is_dm_major(major: u32) -> DmResult<bool> {
    Ok(dm_majors()?.contains(&major))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kdev_t_round_trip() {
        let dev = Device {
            major: 253,
            minor: 7,
        };
        assert_eq!(Device::from_kdev_t(dev.to_kdev_t().unwrap()), dev);

        let huge = Device {
            major: 253,
            minor: 0x1_0000,
        };
        assert_eq!(Device::from_kdev_t(huge.to_kdev_t().unwrap()), huge);

        let too_big = Device {
            major: 0x1000,
            minor: 0,
        };
        assert_eq!(too_big.to_kdev_t(), None);
    }

    #[test]
    fn test_dev_t_round_trip() {
        let dev = Device {
            major: 8,
            minor: 16,
        };
        assert_eq!(Device::from(u64::from(dev)), dev);
    }

    #[test]
    fn test_from_str() {
        assert_eq!(
            "253:7".parse::<Device>().unwrap(),
            Device {
                major: 253,
                minor: 7
            }
        );
        assert!("not-a-device".parse::<Device>().is_err());
    }

    #[test]
    fn test_serde() {
        let dev = Device {
            major: 8,
            minor: 32,
        };
        let text = serde_json::to_string(&dev).unwrap();
        assert_eq!(text, "\"8:32\"");
        assert_eq!(serde_json::from_str::<Device>(&text).unwrap(), dev);
    }
}
