// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::{
    cmp,
    fs::File,
    io::{Cursor, Read, Write},
    mem::size_of,
    os::unix::io::{AsRawFd, RawFd},
    str,
};

use nix::{errno::Errno, libc::ioctl as nix_ioctl};
use retry::{delay::Fixed, retry_with_index, Error as RetryError, OperationResult};
use semver::{Version, VersionReq};

use crate::{
    core::{
        device::Device,
        deviceinfo::{DeviceInfo, DmInfo},
        dm_flags::DmFlags,
        dm_ioctl as dmi,
        dm_options::DmOptions,
        errors,
        types::{DevId, DmName, DmNameBuf, DmUuid},
        util::{
            align_to, c_struct_from_slice, mut_slice_from_c_str, slice_from_c_struct,
            str_from_byte_slice, str_from_c_str,
        },
    },
    result::{DmError, DmResult, ErrorEnum},
};

#[cfg(target_os = "linux")]
/// Control path for user space to pass IOCTL to kernel DM
const DM_CTL_PATH: &str = "/dev/mapper/control";
#[cfg(target_os = "android")]
/// Control path for user space to pass IOCTL to kernel DM
const DM_CTL_PATH: &str = "/dev/device-mapper";

/// Start with a large buffer to make BUFFER_FULL rare. Libdm does this too.
const MIN_BUF_SIZE: usize = 16 * 1024;

/// An interrupted ioctl is retried this many times before the
/// interruption is surfaced.
const IOCTL_RETRIES: usize = 1;

/// The oldest driver interface this library drives.
const DM_REQUIRED_DRIVER_VERSION: &str = ">=4.0.0";

/// One serialised table entry: start sector, length in sectors, target
/// type, target parameters.
pub type TargetLine = (u64, u64, String, String);

/// The per-device operations the activation planner issues. `DM`
/// carries them to the kernel; tests substitute their own endpoint.
pub trait DmControl {
    /// Create a device. It starts out suspended, with no table.
    fn device_create(
        &mut self,
        name: &DmName,
        uuid: Option<&DmUuid>,
        options: DmOptions,
    ) -> DmResult<DmInfo>;

    /// Remove a device and its tables.
    fn device_remove(&mut self, id: &DevId<'_>, options: DmOptions) -> DmResult<DmInfo>;

    /// Rename a device, or set its UUID for the first time.
    fn device_rename(&mut self, old_name: &DmName, new: &DevId<'_>) -> DmResult<DmInfo>;

    /// Suspend or resume a device, depending on DM_SUSPEND.
    fn device_suspend(&mut self, id: &DevId<'_>, options: DmOptions) -> DmResult<DmInfo>;

    /// The device's current state.
    fn device_info(&mut self, id: &DevId<'_>) -> DmResult<DmInfo>;

    /// Load a table into the device's inactive slot.
    fn table_load(
        &mut self,
        id: &DevId<'_>,
        targets: &[TargetLine],
        options: DmOptions,
    ) -> DmResult<DmInfo>;

    /// Clear the device's inactive slot.
    fn table_clear(&mut self, id: &DevId<'_>) -> DmResult<DmInfo>;
}

/// Context needed for communicating with devicemapper.
pub struct DM {
    file: File,
}

impl DmOptions {
    /// Generate a header to be used for IOCTL.
    fn to_ioctl_hdr(
        self,
        id: Option<&DevId<'_>>,
        allowable_flags: DmFlags,
    ) -> DmResult<dmi::Struct_dm_ioctl> {
        let clean_flags = allowable_flags & self.flags();
        let mut hdr = dmi::Struct_dm_ioctl {
            flags: clean_flags.bits(),
            data_start: size_of::<dmi::Struct_dm_ioctl>() as u32,
            ..Default::default()
        };

        if let Some(id) = id {
            match id {
                DevId::Name(name) => DM::hdr_set_name(&mut hdr, name)?,
                DevId::Uuid(uuid) => DM::hdr_set_uuid(&mut hdr, uuid)?,
            };
        };

        Ok(hdr)
    }
}

impl DM {
    /// Create a new context for communicating with DM.
    pub fn new() -> DmResult<DM> {
        Ok(DM {
            file: File::open(DM_CTL_PATH)
                .map_err(|err| DmError::Core(errors::Error::ContextInit(err.to_string())))?,
        })
    }

    fn hdr_set_name(hdr: &mut dmi::Struct_dm_ioctl, name: &DmName) -> DmResult<()> {
        let _ = name
            .as_bytes()
            .read(mut_slice_from_c_str(&mut hdr.name))
            .map_err(|err| errors::Error::GeneralIo(err.to_string()))?;
        Ok(())
    }

    fn hdr_set_uuid(hdr: &mut dmi::Struct_dm_ioctl, uuid: &DmUuid) -> DmResult<()> {
        let _ = uuid
            .as_bytes()
            .read(mut_slice_from_c_str(&mut hdr.uuid))
            .map_err(|err| errors::Error::GeneralIo(err.to_string()))?;
        Ok(())
    }

    /// Get the file within the DM context, likely for polling purposes.
    pub fn file(&self) -> &File {
        &self.file
    }

    fn ioctl(
        &self,
        ioctl: u8,
        hdr: &mut dmi::Struct_dm_ioctl,
        in_data: Option<&[u8]>,
    ) -> DmResult<Vec<u8>> {
        match retry_with_index(
            Fixed::from_millis(0).take(IOCTL_RETRIES),
            |i| {
                trace!("do_ioctl try {} of {}", i, IOCTL_RETRIES + 1);
                self.do_ioctl(ioctl, hdr, in_data)
            },
        ) {
            Ok(res) => Ok(res),
            Err(RetryError::Operation { error, .. }) => Err(error),
            Err(RetryError::Internal(msg)) => {
                Err(DmError::Core(errors::Error::GeneralIo(msg)))
            }
        }
    }

    // Give this a filled-in header and optionally add'l stuff.
    // Does the ioctl and maybe returns stuff. Handles BUFFER_FULL flag.
    fn do_ioctl(
        &self,
        ioctl: u8,
        hdr: &mut dmi::Struct_dm_ioctl,
        in_data: Option<&[u8]>,
    ) -> OperationResult<Vec<u8>, DmError> {
        let ioctl_version = dmi::ioctl_to_version(ioctl);
        hdr.version[0] = ioctl_version.0;
        hdr.version[1] = ioctl_version.1;
        hdr.version[2] = ioctl_version.2;

        hdr.data_size = cmp::max(
            MIN_BUF_SIZE,
            size_of::<dmi::Struct_dm_ioctl>() + in_data.map_or(0, |x| x.len()),
        ) as u32;

        let mut v: Vec<u8> = Vec::with_capacity(hdr.data_size as usize);
        v.extend_from_slice(slice_from_c_struct(&*hdr));
        if let Some(in_data) = in_data {
            v.extend_from_slice(in_data);
        }

        // zero out the rest
        let cap = v.capacity();
        v.resize(cap, 0);

        let op = request_code_readwrite!(dmi::DM_IOCTL, ioctl, size_of::<dmi::Struct_dm_ioctl>());
        loop {
            // The buffer may have grown; refresh the header's idea of
            // its size and rewrite the header bytes.
            hdr.data_size = v.len() as u32;
            v[..hdr.data_start as usize].copy_from_slice(slice_from_c_struct(&*hdr));

            #[cfg(target_os = "android")]
            let op = op as i32;
            if let Err(err) =
                unsafe { convert_ioctl_res!(nix_ioctl(self.file.as_raw_fd(), op, v.as_mut_ptr())) }
            {
                let info = c_struct_from_slice::<dmi::Struct_dm_ioctl>(&v)
                    .and_then(|hdr| DeviceInfo::new(hdr).ok())
                    .map(Box::new);
                return if err == Errno::EINTR {
                    OperationResult::Retry(DmError::Core(errors::Error::Interrupted(info)))
                } else {
                    OperationResult::Err(DmError::Core(errors::Error::Ioctl(
                        info,
                        Box::new(err),
                    )))
                };
            }

            let flags = c_struct_from_slice::<dmi::Struct_dm_ioctl>(&v)
                .map_or(0, |resp| resp.flags);

            // If DM was able to write the requested data into the provided buffer, break the loop
            if (flags & DmFlags::DM_BUFFER_FULL.bits()) == 0 {
                break;
            }

            // If DM_BUFFER_FULL is set, DM requires more space for the
            // response. Double the size of the buffer and re-try the
            // ioctl. If the size of the buffer is already as large as
            // can be possibly expressed in hdr.data_size field, return
            // an error. Never allow the size to exceed u32::MAX.
            let len = v.len();
            if len == u32::MAX as usize {
                return OperationResult::Err(DmError::Core(errors::Error::IoctlResultTooLarge));
            }
            v.resize((len as u32).saturating_mul(2) as usize, 0);
        }

        // hdr possibly modified so copy back
        if let Some(resp) = c_struct_from_slice::<dmi::Struct_dm_ioctl>(&v) {
            *hdr = resp;
        }

        // Return header data section.
        let new_data_off = cmp::max(hdr.data_start, hdr.data_size);
        OperationResult::Ok(v[hdr.data_start as usize..new_data_off as usize].to_vec())
    }

    /// Devicemapper version information: Major, Minor, and patchlevel versions.
    pub fn version(&self) -> DmResult<(u32, u32, u32)> {
        let mut hdr = DmOptions::default().to_ioctl_hdr(None, DmFlags::empty())?;

        self.ioctl(dmi::DM_VERSION_CMD as u8, &mut hdr, None)?;

        Ok((hdr.version[0], hdr.version[1], hdr.version[2]))
    }

    /// Verify that the driver speaks an interface version this library
    /// can drive.
    pub fn verify_version(&self) -> DmResult<()> {
        let (major, minor, patch) = self.version()?;
        let found = Version::new(u64::from(major), u64::from(minor), u64::from(patch));
        let required = VersionReq::parse(DM_REQUIRED_DRIVER_VERSION)
            .map_err(|err| DmError::Dm(ErrorEnum::Invalid, err.to_string()))?;

        if !required.matches(&found) {
            return Err(DmError::Dm(
                ErrorEnum::Invalid,
                format!("driver interface version {found} does not satisfy {required}"),
            ));
        }
        Ok(())
    }

    /// Remove all DM devices and tables. Use discouraged other than
    /// for debugging.
    ///
    /// If DM_DEFERRED_REMOVE is set, the request will succeed for
    /// in-use devices, and they will be removed when released.
    ///
    /// Valid flags: DM_DEFERRED_REMOVE
    pub fn remove_all(&self, options: DmOptions) -> DmResult<()> {
        let mut hdr = options.to_ioctl_hdr(None, DmFlags::DM_DEFERRED_REMOVE)?;

        self.ioctl(dmi::DM_REMOVE_ALL_CMD as u8, &mut hdr, None)?;

        Ok(())
    }

    /// Returns a list of tuples containing DM device names, a Device,
    /// which holds their major and minor device numbers, and on
    /// kernels that support it, each device's last event_nr.
    pub fn list_devices(&self) -> DmResult<Vec<(DmNameBuf, Device, Option<u32>)>> {
        let mut hdr = DmOptions::default().to_ioctl_hdr(None, DmFlags::empty())?;
        let data_out = self.ioctl(dmi::DM_LIST_DEVICES_CMD as u8, &mut hdr, None)?;

        parse_name_list(hdr.version[1], &data_out)
    }

    /// Create a DM device. It starts out in a "suspended" state.
    ///
    /// Valid flags: DM_READONLY, DM_PERSISTENT_DEV
    ///
    /// # Example
    ///
    /// ```no_run
    /// use dm_engine::{DM, DmOptions, DmName};
    ///
    /// let dm = DM::new().unwrap();
    ///
    /// // Setting a uuid is optional
    /// let name = DmName::new("example-dev").expect("is valid DM name");
    /// let dev = dm.device_create(name, None, DmOptions::default()).unwrap();
    /// ```
    pub fn device_create(
        &self,
        name: &DmName,
        uuid: Option<&DmUuid>,
        options: DmOptions,
    ) -> DmResult<DeviceInfo> {
        let mut hdr =
            options.to_ioctl_hdr(None, DmFlags::DM_READONLY | DmFlags::DM_PERSISTENT_DEV)?;

        Self::hdr_set_name(&mut hdr, name)?;
        if let Some(uuid) = uuid {
            Self::hdr_set_uuid(&mut hdr, uuid)?;
        }
        debug!("Creating device {} (uuid={:?})", name, uuid);
        self.ioctl(dmi::DM_DEV_CREATE_CMD as u8, &mut hdr, None)?;

        DeviceInfo::new(hdr)
    }

    /// Remove a DM device and its mapping tables.
    ///
    /// If DM_DEFERRED_REMOVE is set, the request for an in-use device
    /// will succeed, and it will be removed when no longer used.
    ///
    /// Valid flags: DM_DEFERRED_REMOVE
    pub fn device_remove(&self, id: &DevId<'_>, options: DmOptions) -> DmResult<DeviceInfo> {
        let mut hdr = options.to_ioctl_hdr(Some(id), DmFlags::DM_DEFERRED_REMOVE)?;

        debug!("Removing device {}", id);
        self.ioctl(dmi::DM_DEV_REMOVE_CMD as u8, &mut hdr, None)?;

        DeviceInfo::new(hdr)
    }

    /// Change a DM device's name OR set the device's uuid for the
    /// first time.
    ///
    /// Prerequisite: if new == DevId::Name(new_name), old_name != new_name
    /// Prerequisite: if new == DevId::Uuid(uuid), device's current uuid
    /// must be "".
    /// Note: Possibly surprisingly, returned DeviceInfo's uuid or name
    /// field contains the previous value, not the newly set value.
    pub fn device_rename(&self, old_name: &DmName, new: &DevId<'_>) -> DmResult<DeviceInfo> {
        let (options, id_in) = match *new {
            DevId::Name(name) => (DmOptions::default(), name.as_bytes()),
            DevId::Uuid(uuid) => (
                DmOptions::default().set_flags(DmFlags::DM_UUID),
                uuid.as_bytes(),
            ),
        };

        let data_in = [id_in, &[b'\0']].concat();

        let mut hdr = options.to_ioctl_hdr(None, DmFlags::DM_UUID)?;
        Self::hdr_set_name(&mut hdr, old_name)?;

        debug!("Renaming device {} to {}", old_name, new);
        self.ioctl(dmi::DM_DEV_RENAME_CMD as u8, &mut hdr, Some(&data_in))?;

        DeviceInfo::new(hdr)
    }

    /// Suspend or resume a DM device, depending on if DM_SUSPEND flag
    /// is set or not.
    ///
    /// Resuming a DM device moves a table loaded into the "inactive"
    /// slot by `table_load()` into the "active" slot.
    ///
    /// Will block until pending I/O is completed unless DM_NOFLUSH
    /// flag is given. Will freeze filesystem unless DM_SKIP_LOCKFS
    /// flag is given. Additional I/O to a suspended device will be
    /// held until it is resumed.
    ///
    /// Valid flags: DM_SUSPEND, DM_NOFLUSH, DM_SKIP_LOCKFS
    ///
    /// # Example
    ///
    /// ```no_run
    /// use dm_engine::{DM, DevId, DmFlags, DmOptions, DmName};
    /// let dm = DM::new().unwrap();
    ///
    /// let name = DmName::new("example-dev").expect("is valid DM name");
    /// let id = DevId::Name(name);
    /// dm.device_suspend(&id, DmOptions::default().set_flags(DmFlags::DM_SUSPEND)).unwrap();
    /// ```
    pub fn device_suspend(&self, id: &DevId<'_>, options: DmOptions) -> DmResult<DeviceInfo> {
        let mut hdr = options.to_ioctl_hdr(
            Some(id),
            DmFlags::DM_SUSPEND | DmFlags::DM_NOFLUSH | DmFlags::DM_SKIP_LOCKFS,
        )?;
        let action = if options.flags().contains(DmFlags::DM_SUSPEND) {
            "Suspending"
        } else {
            "Resuming"
        };
        debug!("{} device {}", action, id);
        self.ioctl(dmi::DM_DEV_SUSPEND_CMD as u8, &mut hdr, None)?;

        DeviceInfo::new(hdr)
    }

    /// Get DeviceInfo for a device. This is also returned by other
    /// methods, but if just the DeviceInfo is desired then this just
    /// gets it.
    pub fn device_info(&self, id: &DevId<'_>) -> DmResult<DeviceInfo> {
        let mut hdr = DmOptions::default().to_ioctl_hdr(Some(id), DmFlags::empty())?;

        debug!("Retrieving info for {}", id);
        self.ioctl(dmi::DM_DEV_STATUS_CMD as u8, &mut hdr, None)?;

        DeviceInfo::new(hdr)
    }

    /// Wait for a device to report an event.
    ///
    /// Once an event occurs, this function behaves just like
    /// `table_status`, see that function for more details.
    ///
    /// This interface is not very friendly to monitoring multiple devices.
    /// Events are also exported via uevents, that method may be preferable.
    #[allow(clippy::type_complexity)]
    pub fn device_wait(
        &self,
        id: &DevId<'_>,
        options: DmOptions,
    ) -> DmResult<(DeviceInfo, Vec<TargetLine>)> {
        let mut hdr = options.to_ioctl_hdr(Some(id), DmFlags::DM_QUERY_INACTIVE_TABLE)?;

        debug!("Waiting on event for {}", id);
        let data_out = self.ioctl(dmi::DM_DEV_WAIT_CMD as u8, &mut hdr, None)?;

        let status = parse_table_status(hdr.target_count, &data_out)?;

        DeviceInfo::new(hdr).map(|info| (info, status))
    }

    /// Load targets for a device into its inactive table slot.
    ///
    /// `targets` is an array of (sector_start, sector_length, type, params).
    ///
    /// `params` are target-specific, please see [Linux kernel documentation]
    /// https://git.kernel.org/cgit/linux/kernel/git/torvalds/linux.git/tree/ ->
    /// Documentation/device-mapper
    /// for more.
    ///
    /// `options` Valid flags: DM_READONLY, DM_SECURE_DATA
    pub fn table_load(
        &self,
        id: &DevId<'_>,
        targets: &[TargetLine],
        options: DmOptions,
    ) -> DmResult<DeviceInfo> {
        let data_in = serialize_targets(targets)?;

        let mut hdr =
            options.to_ioctl_hdr(Some(id), DmFlags::DM_READONLY | DmFlags::DM_SECURE_DATA)?;

        // do_ioctl() will set hdr.data_size but we must set target_count
        hdr.target_count = targets.len() as u32;

        debug!("Loading table \"{:?}\" for {}", targets, id);
        self.ioctl(dmi::DM_TABLE_LOAD_CMD as u8, &mut hdr, Some(&data_in))?;

        DeviceInfo::new(hdr)
    }

    /// Clear the "inactive" table for a device.
    pub fn table_clear(&self, id: &DevId<'_>) -> DmResult<DeviceInfo> {
        let mut hdr = DmOptions::default().to_ioctl_hdr(Some(id), DmFlags::empty())?;

        debug!("Clearing inactive table for {}", id);
        self.ioctl(dmi::DM_TABLE_CLEAR_CMD as u8, &mut hdr, None)?;

        DeviceInfo::new(hdr)
    }

    /// Query DM for which devices are referenced by the "active"
    /// table for this device.
    ///
    /// If DM_QUERY_INACTIVE_TABLE is set, instead return for the
    /// inactive table.
    ///
    /// Valid flags: DM_QUERY_INACTIVE_TABLE
    pub fn table_deps(&self, id: &DevId<'_>, options: DmOptions) -> DmResult<Vec<Device>> {
        let mut hdr = options.to_ioctl_hdr(Some(id), DmFlags::DM_QUERY_INACTIVE_TABLE)?;

        debug!("Querying dependencies for {}", id);
        let data_out = self.ioctl(dmi::DM_TABLE_DEPS_CMD as u8, &mut hdr, None)?;

        if data_out.is_empty() {
            Ok(vec![])
        } else {
            let result = &data_out[..];
            let target_deps =
                c_struct_from_slice::<dmi::Struct_dm_target_deps>(result).ok_or_else(|| {
                    DmError::Dm(
                        ErrorEnum::Invalid,
                        "Incomplete dependency response from kernel".to_string(),
                    )
                })?;

            // Note: The DM target_deps struct reserves 64 bits for each entry
            // but only 32 bits is used by kernel "huge" dev_t encoding.
            Ok(result[size_of::<dmi::Struct_dm_target_deps>()..]
                .chunks_exact(size_of::<u64>())
                .take(target_deps.count as usize)
                .map(|chunk| {
                    let dev =
                        u64::from_ne_bytes(chunk.try_into().expect("chunks_exact yields 8 bytes"));
                    Device::from_kdev_t(dev as u32)
                })
                .collect())
        }
    }

    /// Return the status of all targets for a device's "active"
    /// table.
    ///
    /// Returns DeviceInfo and a Vec of (sector_start, sector_length, type, params).
    ///
    /// If DM_STATUS_TABLE flag is set, returns the current table value. Otherwise
    /// returns target-specific status information.
    ///
    /// If DM_NOFLUSH is set, retrieving the target-specific status information for
    /// targets with metadata will not cause a metadata write.
    ///
    /// If DM_QUERY_INACTIVE_TABLE is set, instead return the status of the
    /// inactive table.
    ///
    /// Valid flags: DM_NOFLUSH, DM_STATUS_TABLE, DM_QUERY_INACTIVE_TABLE
    #[allow(clippy::type_complexity)]
    pub fn table_status(
        &self,
        id: &DevId<'_>,
        options: DmOptions,
    ) -> DmResult<(DeviceInfo, Vec<TargetLine>)> {
        let mut hdr = options.to_ioctl_hdr(
            Some(id),
            DmFlags::DM_NOFLUSH | DmFlags::DM_STATUS_TABLE | DmFlags::DM_QUERY_INACTIVE_TABLE,
        )?;

        debug!("Retrieving table status for {}", id);
        let data_out = self.ioctl(dmi::DM_TABLE_STATUS_CMD as u8, &mut hdr, None)?;

        let status = parse_table_status(hdr.target_count, &data_out)?;

        DeviceInfo::new(hdr).map(|info| (info, status))
    }

    /// Returns a list of each loaded target type with its name, and
    /// version broken into major, minor, and patchlevel.
    pub fn list_versions(&self) -> DmResult<Vec<(String, u32, u32, u32)>> {
        let mut hdr = DmOptions::default().to_ioctl_hdr(None, DmFlags::empty())?;

        debug!("Listing loaded target versions");
        let data_out = self.ioctl(dmi::DM_LIST_VERSIONS_CMD as u8, &mut hdr, None)?;

        parse_versions_list(&data_out)
    }

    /// Send a message to the device specified by id and the sector
    /// specified by sector. If sending to the whole device, set sector
    /// to None.
    pub fn target_msg(
        &self,
        id: &DevId<'_>,
        sector: Option<u64>,
        msg: &str,
    ) -> DmResult<(DeviceInfo, Option<String>)> {
        let mut hdr = DmOptions::default().to_ioctl_hdr(Some(id), DmFlags::empty())?;

        let msg_struct = dmi::Struct_dm_target_msg {
            sector: sector.unwrap_or_default(),
            ..Default::default()
        };
        let mut data_in = slice_from_c_struct(&msg_struct).to_vec();
        data_in.extend(msg.as_bytes());
        data_in.push(b'\0');

        debug!("Sending target message \"{}\" to {}", msg, id);
        let data_out = self.ioctl(dmi::DM_TARGET_MSG_CMD as u8, &mut hdr, Some(&data_in))?;

        let output = if (hdr.flags & DmFlags::DM_DATA_OUT.bits()) > 0 {
            Some(
                str::from_utf8(&data_out[..data_out.len() - 1])
                    .map(|res| res.to_string())
                    .map_err(|_| {
                        DmError::Dm(
                            ErrorEnum::Invalid,
                            "Could not convert output to a String".to_string(),
                        )
                    })?,
            )
        } else {
            None
        };
        DeviceInfo::new(hdr).map(|info| (info, output))
    }

    /// Create device nodes under the device directory for the listed
    /// devices, or for one device if a name is given. Nodes whose
    /// device numbers have gone stale are replaced.
    pub fn mknodes(&self, name: Option<&DmName>) -> DmResult<()> {
        let mode = nix::sys::stat::Mode::S_IRUSR | nix::sys::stat::Mode::S_IWUSR;

        for (dev_name, device, _) in self.list_devices()? {
            if let Some(name) = name {
                if &*dev_name != name {
                    continue;
                }
            }

            let path = crate::dev_dir().join(dev_name.to_string());
            let rdev = u64::from(device);

            match nix::sys::stat::stat(&path) {
                Ok(existing) if existing.st_rdev == rdev => continue,
                Ok(_) => {
                    std::fs::remove_file(&path)
                        .map_err(|err| errors::Error::GeneralIo(err.to_string()))?;
                }
                Err(Errno::ENOENT) => {}
                Err(err) => return Err(errors::Error::GeneralIo(err.to_string()).into()),
            }

            debug!("Creating node {} for {}", path.display(), device);
            nix::sys::stat::mknod(&path, nix::sys::stat::SFlag::S_IFBLK, mode, rdev)
                .map_err(|err| errors::Error::GeneralIo(err.to_string()))?;
        }

        Ok(())
    }
}

impl AsRawFd for DM {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

impl DmControl for DM {
    fn device_create(
        &mut self,
        name: &DmName,
        uuid: Option<&DmUuid>,
        options: DmOptions,
    ) -> DmResult<DmInfo> {
        DM::device_create(self, name, uuid, options).map(|info| DmInfo::from(&info))
    }

    fn device_remove(&mut self, id: &DevId<'_>, options: DmOptions) -> DmResult<DmInfo> {
        DM::device_remove(self, id, options).map(|info| DmInfo::from(&info))
    }

    fn device_rename(&mut self, old_name: &DmName, new: &DevId<'_>) -> DmResult<DmInfo> {
        DM::device_rename(self, old_name, new).map(|info| DmInfo::from(&info))
    }

    fn device_suspend(&mut self, id: &DevId<'_>, options: DmOptions) -> DmResult<DmInfo> {
        DM::device_suspend(self, id, options).map(|info| DmInfo::from(&info))
    }

    fn device_info(&mut self, id: &DevId<'_>) -> DmResult<DmInfo> {
        DM::device_info(self, id).map(|info| DmInfo::from(&info))
    }

    fn table_load(
        &mut self,
        id: &DevId<'_>,
        targets: &[TargetLine],
        options: DmOptions,
    ) -> DmResult<DmInfo> {
        DM::table_load(self, id, targets, options).map(|info| DmInfo::from(&info))
    }

    fn table_clear(&mut self, id: &DevId<'_>) -> DmResult<DmInfo> {
        DM::table_clear(self, id).map(|info| DmInfo::from(&info))
    }
}

/// Flatten target lines into the CREATE/RELOAD payload: a target spec
/// per line, its parameter string NUL-terminated and padded out to an
/// 8-byte boundary.
fn serialize_targets(targets: &[TargetLine]) -> DmResult<Vec<u8>> {
    let mut cursor = Cursor::new(Vec::new());

    for (sector_start, length, target_type, params) in targets {
        let mut targ = dmi::Struct_dm_target_spec {
            sector_start: *sector_start,
            length: *length,
            status: 0,
            ..Default::default()
        };

        let dst = mut_slice_from_c_str(&mut targ.target_type);
        if target_type.len() > dst.len() {
            return Err(DmError::Dm(
                ErrorEnum::Invalid,
                format!("target type {target_type} exceeds {} bytes", dst.len()),
            ));
        }
        let _ = target_type
            .as_bytes()
            .read(dst)
            .map_err(|err| errors::Error::GeneralIo(err.to_string()))?;

        // Size of the largest single member of dm_target_spec
        let align_to_size = size_of::<u64>();
        let aligned_len = align_to(params.len() + 1usize, align_to_size);
        targ.next = (size_of::<dmi::Struct_dm_target_spec>() + aligned_len) as u32;

        cursor
            .write_all(slice_from_c_struct(&targ))
            .map_err(|err| errors::Error::GeneralIo(err.to_string()))?;
        cursor
            .write_all(params.as_bytes())
            .map_err(|err| errors::Error::GeneralIo(err.to_string()))?;

        let padding = aligned_len - params.len();
        cursor
            .write_all(vec![0; padding].as_slice())
            .map_err(|err| errors::Error::GeneralIo(err.to_string()))?;
    }

    Ok(cursor.into_inner())
}

/// Parse a device's table. The table value is in buf, count indicates
/// the expected number of lines. Each spec's `next` is the offset of
/// the following record from the start of the payload.
fn parse_table_status(count: u32, buf: &[u8]) -> DmResult<Vec<TargetLine>> {
    let mut targets = Vec::new();
    if !buf.is_empty() {
        let mut next_off = 0;

        for _ in 0..count {
            let result = &buf[next_off..];
            let targ =
                c_struct_from_slice::<dmi::Struct_dm_target_spec>(result).ok_or_else(|| {
                    DmError::Dm(
                        ErrorEnum::Invalid,
                        "Incomplete target spec returned from kernel".to_string(),
                    )
                })?;

            let target_type = str_from_c_str(&targ.target_type)
                .ok_or_else(|| {
                    DmError::Dm(
                        ErrorEnum::Invalid,
                        "Could not convert target type to a String".to_string(),
                    )
                })?
                .to_string();

            let params = str_from_byte_slice(&result[size_of::<dmi::Struct_dm_target_spec>()..])
                .ok_or_else(|| {
                    DmError::Dm(
                        ErrorEnum::Invalid,
                        "Invalid DM target parameters returned from kernel".to_string(),
                    )
                })?
                .to_string();

            targets.push((targ.sector_start, targ.length, target_type, params));

            next_off = targ.next as usize;
        }
    }
    Ok(targets)
}

/// Parse a LIST response: records chained by byte deltas, a NUL
/// terminated name after each, and on minor versions above 36 an
/// event number aligned after the name.
fn parse_name_list(
    minor_version: u32,
    buf: &[u8],
) -> DmResult<Vec<(DmNameBuf, Device, Option<u32>)>> {
    let mut devs = Vec::new();

    if buf.is_empty() {
        return Ok(devs);
    }

    let mut result = &buf[..];
    loop {
        let device = c_struct_from_slice::<dmi::Struct_dm_name_list>(result).ok_or_else(|| {
            DmError::Dm(
                ErrorEnum::Invalid,
                "Incomplete name list record from kernel".to_string(),
            )
        })?;
        let name_offset = unsafe {
            (device.name.as_ptr() as *const u8).offset_from(&device as *const _ as *const u8)
        } as usize;

        let dm_name = str_from_byte_slice(&result[name_offset..])
            .map(|s| s.to_owned())
            .ok_or_else(|| {
                DmError::Dm(
                    ErrorEnum::Invalid,
                    "Devicemapper name is not valid UTF8".to_string(),
                )
            })?;

        // Get each device's event number after its name, if the kernel
        // DM version supports it. Should match offset calc in kernel's
        // drivers/md/dm-ioctl.c:list_devices
        let event_nr = match minor_version {
            0..=36 => None,
            _ => {
                let offset = align_to(name_offset + dm_name.len() + 1, size_of::<u64>());
                let nr = u32::from_ne_bytes(
                    result[offset..offset + size_of::<u32>()]
                        .try_into()
                        .map_err(|_| {
                            DmError::Dm(
                                ErrorEnum::Invalid,
                                "Incorrectly sized slice for u32".to_string(),
                            )
                        })?,
                );

                Some(nr)
            }
        };

        devs.push((
            DmNameBuf::new(dm_name)?,
            Device::from(device.dev),
            event_nr,
        ));

        if device.next == 0 {
            break;
        }

        result = &result[device.next as usize..];
    }

    Ok(devs)
}

/// Parse a LIST_VERSIONS response: records chained by byte deltas,
/// each a version triple and a NUL terminated target name.
fn parse_versions_list(buf: &[u8]) -> DmResult<Vec<(String, u32, u32, u32)>> {
    let mut targets = Vec::new();

    if buf.is_empty() {
        return Ok(targets);
    }

    let mut result = &buf[..];
    loop {
        let tver =
            c_struct_from_slice::<dmi::Struct_dm_target_versions>(result).ok_or_else(|| {
                DmError::Dm(
                    ErrorEnum::Invalid,
                    "Incomplete version record from kernel".to_string(),
                )
            })?;

        let name = str_from_byte_slice(&result[size_of::<dmi::Struct_dm_target_versions>()..])
            .ok_or_else(|| {
                DmError::Dm(
                    ErrorEnum::Invalid,
                    "Invalid DM target name returned from kernel".to_string(),
                )
            })?
            .to_string();
        targets.push((name, tver.version[0], tver.version[1], tver.version[2]));

        if tver.next == 0 {
            break;
        }

        result = &result[tver.next as usize..];
    }

    Ok(targets)
}
