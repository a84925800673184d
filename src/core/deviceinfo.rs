// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::fmt;

use crate::{
    core::{
        device::Device,
        dm_flags::DmFlags,
        dm_ioctl as dmi,
        types::{DmName, DmUuid},
        util::str_from_c_str,
    },
    result::{DmError, DmResult, ErrorEnum},
};

/// Contains information about the device, parsed from an ioctl
/// response header.
#[derive(Clone, Copy)]
pub struct DeviceInfo {
    hdr: dmi::Struct_dm_ioctl,
}

impl DeviceInfo {
    /// Wrap a response header, verifying that its name and UUID fields
    /// hold NUL-terminated UTF-8.
    pub(crate) fn new(hdr: dmi::Struct_dm_ioctl) -> DmResult<DeviceInfo> {
        if str_from_c_str(&hdr.name).is_none() || str_from_c_str(&hdr.uuid).is_none() {
            return Err(DmError::Dm(
                ErrorEnum::Invalid,
                "kernel response header holds an invalid name or UUID".into(),
            ));
        }
        Ok(DeviceInfo { hdr })
    }

    /// The major, minor, and patchlevel versions of devicemapper.
    pub fn version(&self) -> (u32, u32, u32) {
        (
            self.hdr.version[0],
            self.hdr.version[1],
            self.hdr.version[2],
        )
    }

    /// The number of times the device is currently open.
    pub fn open_count(&self) -> i32 {
        self.hdr.open_count
    }

    /// The last event number for the device.
    pub fn event_nr(&self) -> u32 {
        self.hdr.event_nr
    }

    /// The number of targets in the device's table.
    pub fn target_count(&self) -> u32 {
        self.hdr.target_count
    }

    /// The device's major and minor device numbers, as a Device, if
    /// the kernel reported any.
    pub fn device(&self) -> Option<Device> {
        if self.hdr.dev == 0 {
            None
        } else {
            Some(Device::from(self.hdr.dev))
        }
    }

    /// The device's name.
    pub fn name(&self) -> Option<&DmName> {
        // Validated in the constructor.
        let name = str_from_c_str(&self.hdr.name).expect("checked in new()");
        if name.is_empty() {
            None
        } else {
            Some(DmName::new(name).expect("checked in new()"))
        }
    }

    /// The device's UUID.
    pub fn uuid(&self) -> Option<&DmUuid> {
        let uuid = str_from_c_str(&self.hdr.uuid).expect("checked in new()");
        if uuid.is_empty() {
            None
        } else {
            Some(DmUuid::new(uuid).expect("checked in new()"))
        }
    }

    /// The flags returned from the device.
    pub fn flags(&self) -> DmFlags {
        DmFlags::from_bits_truncate(self.hdr.flags)
    }
}

impl fmt::Debug for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceInfo")
            .field("name", &self.name())
            .field("uuid", &self.uuid())
            .field("device", &self.device())
            .field("flags", &self.flags())
            .field("open_count", &self.open_count())
            .field("event_nr", &self.event_nr())
            .field("target_count", &self.target_count())
            .finish()
    }
}

/// A plain summary of a device's state, the response shape shared by
/// the kernel boundary and the registry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DmInfo {
    /// The device exists.
    pub exists: bool,
    /// The device is suspended.
    pub suspended: bool,
    /// A live (active) table is present.
    pub live_table: bool,
    /// An inactive table is staged.
    pub inactive_table: bool,
    /// The device's open count, as last observed.
    pub open_count: i32,
    /// The device's event counter, as last observed.
    pub event_nr: u32,
    /// The device's major and minor numbers, once realised.
    pub device: Option<Device>,
    /// The device is read-only.
    pub read_only: bool,
    /// The number of targets in the live table.
    pub target_count: u32,
}

impl From<&DeviceInfo> for DmInfo {
    fn from(info: &DeviceInfo) -> DmInfo {
        let flags = info.flags();
        DmInfo {
            exists: true,
            suspended: flags.contains(DmFlags::DM_SUSPEND),
            live_table: flags.contains(DmFlags::DM_ACTIVE_PRESENT),
            inactive_table: flags.contains(DmFlags::DM_INACTIVE_PRESENT),
            open_count: info.open_count(),
            event_nr: info.event_nr(),
            device: info.device(),
            read_only: flags.contains(DmFlags::DM_READONLY),
            target_count: info.target_count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use crate::core::util::mut_slice_from_c_str;

    use super::*;

    fn hdr_with_name(name: &str) -> dmi::Struct_dm_ioctl {
        let mut hdr = dmi::Struct_dm_ioctl::default();
        let _ = name.as_bytes().read(mut_slice_from_c_str(&mut hdr.name));
        hdr
    }

    #[test]
    fn test_name_and_uuid_parsing() {
        let info = DeviceInfo::new(hdr_with_name("pear")).unwrap();
        assert_eq!(info.name().unwrap().to_string(), "pear");
        assert_eq!(info.uuid(), None);
    }

    #[test]
    fn test_flags_mapped_into_plain_info() {
        let mut hdr = hdr_with_name("fig");
        hdr.flags = (DmFlags::DM_ACTIVE_PRESENT | DmFlags::DM_READONLY).bits();
        hdr.open_count = 2;
        hdr.event_nr = 9;
        hdr.dev = u64::from(Device {
            major: 253,
            minor: 1,
        });

        let info = DmInfo::from(&DeviceInfo::new(hdr).unwrap());
        assert!(info.exists);
        assert!(info.live_table);
        assert!(!info.inactive_table);
        assert!(info.read_only);
        assert_eq!(info.open_count, 2);
        assert_eq!(info.event_nr, 9);
        assert_eq!(
            info.device,
            Some(Device {
                major: 253,
                minor: 1
            })
        );
    }
}
