// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

mod device;
mod deviceinfo;
mod dm;
mod dm_flags;
mod dm_ioctl;
mod dm_options;
pub mod errors;
mod types;
mod util;

pub use self::{
    device::{dm_majors, is_dm_major, Device},
    deviceinfo::{DeviceInfo, DmInfo},
    dm::{DmControl, TargetLine, DM},
    dm_flags::DmFlags,
    dm_options::DmOptions,
    types::{DevId, DmName, DmNameBuf, DmUuid, DmUuidBuf},
};
