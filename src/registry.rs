// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The registry of mapped devices.
//!
//! A record is born the first time a name and UUID are mentioned and
//! may be referenced as backing storage before it has any table. Each
//! record carries a live table slot, an inactive (staged) slot, and an
//! in-progress table under construction. Open counts and event numbers
//! are observations of kernel state, not owned by the registry.

use std::collections::{BTreeMap, HashMap};

use crate::{
    core::{DevId, Device, DmInfo, DmName, DmNameBuf, DmUuid, DmUuidBuf, TargetLine},
    result::{DmError, DmResult, ErrorEnum},
    table::TargetTable,
    target::{Target, TargetArea},
    units::Sectors,
};

bitflags! {
    /// The state bits of a mapped-device record.
    #[derive(Default)]
    pub struct DevFlags: u32 {
        /// A table is being built for this device.
        const LOADING          = 1;
        /// The most recent table build completed.
        const LOADED           = 1 << 1;
        /// A live table is serving I/O.
        const LIVE_TABLE       = 1 << 2;
        /// The device is suspended.
        const SUSPENDED        = 1 << 3;
        /// A staged table awaits resume.
        const INACTIVE_PRESENT = 1 << 4;
        /// The device is read-only.
        const READ_ONLY        = 1 << 5;
        /// Removal is deferred until the last close.
        const DEFERRED_REMOVE  = 1 << 6;
    }
}

/// The table slot an operation addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableSlot {
    /// The table serving I/O.
    Live,
    /// The staged replacement.
    Inactive,
}

/// One mapped device.
#[derive(Debug)]
pub struct MappedDevice {
    name: DmNameBuf,
    uuid: DmUuidBuf,
    device: Option<Device>,
    flags: DevFlags,
    live_table: Option<TargetTable>,
    inactive_table: Option<TargetTable>,
    staged: Option<TargetTable>,
    event_nr: u32,
    open_count: i32,
    target_count: u32,
}

impl MappedDevice {
    /// The device's name.
    pub fn name(&self) -> &DmName {
        &self.name
    }

    /// The device's UUID, its stable identity.
    pub fn uuid(&self) -> &DmUuid {
        &self.uuid
    }

    /// The device numbers, once realised by the kernel.
    pub fn device(&self) -> Option<Device> {
        self.device
    }

    /// The record's state bits.
    pub fn flags(&self) -> DevFlags {
        self.flags
    }

    /// The table serving I/O, if any.
    pub fn live_table(&self) -> Option<&TargetTable> {
        self.live_table.as_ref()
    }

    /// The staged table awaiting resume, if any.
    pub fn inactive_table(&self) -> Option<&TargetTable> {
        self.inactive_table.as_ref()
    }

    /// The device's event counter, as last observed.
    pub fn event_nr(&self) -> u32 {
        self.event_nr
    }

    /// The device's open count, as last observed.
    pub fn open_count(&self) -> i32 {
        self.open_count
    }

    fn info(&self) -> DmInfo {
        DmInfo {
            exists: true,
            suspended: self.flags.contains(DevFlags::SUSPENDED),
            live_table: self.live_table.is_some(),
            inactive_table: self.inactive_table.is_some(),
            open_count: self.open_count,
            event_nr: self.event_nr,
            device: self.device,
            read_only: self.flags.contains(DevFlags::READ_ONLY),
            target_count: self.target_count,
        }
    }
}

/// The registry, keyed simultaneously by name and by UUID, with the
/// device numbers as a secondary key populated at activation.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: BTreeMap<u32, MappedDevice>,
    by_name: HashMap<DmNameBuf, u32>,
    by_uuid: HashMap<DmUuidBuf, u32>,
    by_dev: HashMap<Device, u32>,
    next_serial: u32,
}

impl DeviceRegistry {
    /// An empty registry.
    pub fn new() -> DeviceRegistry {
        DeviceRegistry::default()
    }

    fn serial_of(&self, id: &DevId<'_>) -> DmResult<u32> {
        let serial = match *id {
            DevId::Name(name) => self.by_name.get(name),
            DevId::Uuid(uuid) => self.by_uuid.get(uuid),
        };
        serial
            .copied()
            .ok_or_else(|| DmError::Dm(ErrorEnum::NotFound, format!("no device {id}")))
    }

    fn record(&self, id: &DevId<'_>) -> DmResult<&MappedDevice> {
        let serial = self.serial_of(id)?;
        Ok(self
            .devices
            .get(&serial)
            .expect("every serial in an index map has a record"))
    }

    fn record_mut(&mut self, id: &DevId<'_>) -> DmResult<&mut MappedDevice> {
        let serial = self.serial_of(id)?;
        Ok(self
            .devices
            .get_mut(&serial)
            .expect("every serial in an index map has a record"))
    }

    /// Look up a device, or create an empty record under the given
    /// name and UUID. Fails if either key is already bound to a
    /// different device.
    pub fn open_or_create(&mut self, name: &DmName, uuid: &DmUuid) -> DmResult<&MappedDevice> {
        if let Some(&serial) = self.by_name.get(name) {
            let record = &self.devices[&serial];
            if record.uuid.as_ref() != uuid {
                return Err(DmError::Dm(
                    ErrorEnum::Invalid,
                    format!(
                        "device {} already exists with UUID {}, not {}",
                        name, record.uuid, uuid
                    ),
                ));
            }
            return Ok(record);
        }

        if let Some(&serial) = self.by_uuid.get(uuid) {
            let record = &self.devices[&serial];
            return Err(DmError::Dm(
                ErrorEnum::Invalid,
                format!(
                    "UUID {} already names device {}, not {}",
                    uuid, record.name, name
                ),
            ));
        }

        let serial = self.next_serial;
        self.next_serial += 1;
        self.by_name.insert(name.to_owned(), serial);
        self.by_uuid.insert(uuid.to_owned(), serial);
        self.devices.insert(
            serial,
            MappedDevice {
                name: name.to_owned(),
                uuid: uuid.to_owned(),
                device: None,
                flags: DevFlags::empty(),
                live_table: None,
                inactive_table: None,
                staged: None,
                event_nr: 0,
                open_count: 0,
                target_count: 0,
            },
        );

        debug!("Created device record {} (uuid={})", name, uuid);
        Ok(&self.devices[&serial])
    }

    /// The device record for `id`.
    pub fn get(&self, id: &DevId<'_>) -> DmResult<&MappedDevice> {
        self.record(id)
    }

    /// The device record realised as `device`, if any.
    pub fn get_by_device(&self, device: Device) -> Option<&MappedDevice> {
        self.by_dev.get(&device).map(|serial| &self.devices[serial])
    }

    /// Every record, in creation order.
    pub fn devices(&self) -> impl Iterator<Item = &MappedDevice> {
        self.devices.values()
    }

    /// Record the device numbers the kernel realised `id` under.
    pub fn set_device(&mut self, id: &DevId<'_>, device: Device) -> DmResult<()> {
        let serial = self.serial_of(id)?;
        self.by_dev.insert(device, serial);
        self.devices
            .get_mut(&serial)
            .expect("every serial in an index map has a record")
            .device = Some(device);
        Ok(())
    }

    /// Mark the device read-only or read-write.
    pub fn set_read_only(&mut self, id: &DevId<'_>, read_only: bool) -> DmResult<()> {
        let record = self.record_mut(id)?;
        record.flags.set(DevFlags::READ_ONLY, read_only);
        Ok(())
    }

    /// Arrange for removal to be deferred while the device is open.
    pub fn set_deferred_remove(&mut self, id: &DevId<'_>, deferred: bool) -> DmResult<()> {
        let record = self.record_mut(id)?;
        record.flags.set(DevFlags::DEFERRED_REMOVE, deferred);
        Ok(())
    }

    /// Begin building a table for `id`, discarding any build already
    /// in progress.
    pub fn table_start(&mut self, id: &DevId<'_>) -> DmResult<()> {
        let record = self.record_mut(id)?;
        record.staged = Some(TargetTable::start()?);
        record.flags.insert(DevFlags::LOADING);
        record.flags.remove(DevFlags::LOADED);
        Ok(())
    }

    /// Append an entry to the table being built for `id`.
    pub fn table_add_target(
        &mut self,
        id: &DevId<'_>,
        high: Sectors,
        target: Target,
    ) -> DmResult<()> {
        let record = self.record_mut(id)?;
        match record.staged {
            Some(ref mut table) => table.add_entry(high, target),
            None => Err(DmError::Dm(
                ErrorEnum::StateViolation,
                format!("no table is being built for device {id}"),
            )),
        }
    }

    /// Seal the table being built for `id` and compile its index.
    pub fn table_complete(&mut self, id: &DevId<'_>) -> DmResult<()> {
        let record = self.record_mut(id)?;
        match record.staged {
            Some(ref mut table) => {
                table.complete()?;
                record.flags.remove(DevFlags::LOADING);
                record.flags.insert(DevFlags::LOADED);
                Ok(())
            }
            None => Err(DmError::Dm(
                ErrorEnum::StateViolation,
                format!("no table is being built for device {id}"),
            )),
        }
    }

    /// Drop the table being built for `id`.
    pub fn table_abandon(&mut self, id: &DevId<'_>) -> DmResult<()> {
        let record = self.record_mut(id)?;
        record.staged = None;
        record.flags.remove(DevFlags::LOADING);
        record.flags.set(
            DevFlags::LOADED,
            record.live_table.is_some() || record.inactive_table.is_some(),
        );
        Ok(())
    }

    fn check_areas(&self, table: &TargetTable) -> DmResult<()> {
        for target in table.targets() {
            for area in target.areas() {
                if !self.by_uuid.contains_key(area.uuid())
                    && !self.by_name.contains_key(area.name().as_ref())
                {
                    return Err(DmError::Dm(
                        ErrorEnum::NotFound,
                        format!(
                            "table references unknown backing device {} (uuid={})",
                            area.name(),
                            area.uuid()
                        ),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Place a table in one of `id`'s slots. Only the inactive slot
    /// accepts direct writes; the live slot is filled exclusively by a
    /// committed activation's resume. Every backing device the table
    /// references must already have a record.
    pub fn set_table(
        &mut self,
        id: &DevId<'_>,
        table: TargetTable,
        slot: TableSlot,
    ) -> DmResult<()> {
        if slot == TableSlot::Live {
            return Err(DmError::Dm(
                ErrorEnum::StateViolation,
                "the live slot is only written by resume".into(),
            ));
        }

        self.check_areas(&table)?;

        let loaded = table.is_complete();
        let record = self.record_mut(id)?;
        record.inactive_table = Some(table);
        record.flags.insert(DevFlags::INACTIVE_PRESENT);
        record.flags.set(DevFlags::LOADED, loaded);
        record.flags.remove(DevFlags::LOADING);

        Ok(())
    }

    /// Move the table built by `table_start`..`table_complete` into
    /// one of `id`'s slots. On failure the build stays in place so the
    /// caller can fix and retry, or abandon.
    pub fn commit_staged(&mut self, id: &DevId<'_>, slot: TableSlot) -> DmResult<()> {
        if slot == TableSlot::Live {
            return Err(DmError::Dm(
                ErrorEnum::StateViolation,
                "the live slot is only written by resume".into(),
            ));
        }

        {
            let record = self.record(id)?;
            let staged = record.staged.as_ref().ok_or_else(|| {
                DmError::Dm(
                    ErrorEnum::StateViolation,
                    format!("no table has been built for device {id}"),
                )
            })?;
            self.check_areas(staged)?;
        }

        let record = self.record_mut(id)?;
        let staged = record.staged.take().expect("presence checked above");
        let loaded = staged.is_complete();
        record.inactive_table = Some(staged);
        record.flags.insert(DevFlags::INACTIVE_PRESENT);
        record.flags.set(DevFlags::LOADED, loaded);
        record.flags.remove(DevFlags::LOADING);

        Ok(())
    }

    /// Ensure `id`'s inactive table has a compiled index.
    pub(crate) fn complete_inactive(&mut self, id: &DevId<'_>) -> DmResult<()> {
        let record = self.record_mut(id)?;
        if let Some(ref mut table) = record.inactive_table {
            table.complete()?;
            record.flags.insert(DevFlags::LOADED);
        }
        Ok(())
    }

    /// Promote `id`'s inactive table to live and clear suspension, the
    /// registry half of a successful resume.
    pub(crate) fn promote_inactive(&mut self, id: &DevId<'_>) -> DmResult<()> {
        let record = self.record_mut(id)?;
        if let Some(table) = record.inactive_table.take() {
            record.target_count = table.len() as u32;
            record.live_table = Some(table);
            record.flags.insert(DevFlags::LIVE_TABLE);
            record.flags.remove(DevFlags::INACTIVE_PRESENT);
        }
        record.flags.remove(DevFlags::SUSPENDED);
        Ok(())
    }

    /// Note that `id` was suspended.
    pub(crate) fn mark_suspended(&mut self, id: &DevId<'_>) -> DmResult<()> {
        let record = self.record_mut(id)?;
        record.flags.insert(DevFlags::SUSPENDED);
        Ok(())
    }

    /// Fold kernel-reported state into `id`'s record.
    pub(crate) fn update_from_info(&mut self, id: &DevId<'_>, info: &DmInfo) -> DmResult<()> {
        let serial = self.serial_of(id)?;
        if let Some(device) = info.device {
            self.by_dev.insert(device, serial);
        }
        let record = self
            .devices
            .get_mut(&serial)
            .expect("every serial in an index map has a record");
        if let Some(device) = info.device {
            record.device = Some(device);
        }
        record.event_nr = info.event_nr;
        record.open_count = info.open_count;
        record.target_count = info.target_count;
        Ok(())
    }

    /// A summary of `id`'s state, in the same shape the kernel
    /// boundary reports. A device with no record reports
    /// `exists: false`.
    pub fn info(&self, id: &DevId<'_>) -> DmInfo {
        match self.record(id) {
            Ok(record) => record.info(),
            Err(_) => DmInfo::default(),
        }
    }

    /// Give `id` a new name. The UUID, the stable key, is immutable.
    pub fn rename(&mut self, id: &DevId<'_>, new_name: &DmName) -> DmResult<()> {
        if self.by_name.contains_key(new_name) {
            return Err(DmError::Dm(
                ErrorEnum::Invalid,
                format!("a device named {new_name} already exists"),
            ));
        }

        let serial = self.serial_of(id)?;
        let record = self
            .devices
            .get_mut(&serial)
            .expect("every serial in an index map has a record");
        let old_name = std::mem::replace(&mut record.name, new_name.to_owned());
        self.by_name.remove(&old_name);
        self.by_name.insert(new_name.to_owned(), serial);

        debug!("Renamed device {} to {}", old_name, new_name);
        Ok(())
    }

    /// Drop `id`'s record. Fails with Busy while the device is open,
    /// unless removal is deferred.
    pub fn remove(&mut self, id: &DevId<'_>) -> DmResult<()> {
        let serial = self.serial_of(id)?;
        let record = &self.devices[&serial];
        if record.open_count > 0 && !record.flags.contains(DevFlags::DEFERRED_REMOVE) {
            return Err(DmError::Dm(
                ErrorEnum::Busy,
                format!("device {} has open count {}", record.name, record.open_count),
            ));
        }

        let record = self
            .devices
            .remove(&serial)
            .expect("every serial in an index map has a record");
        self.by_name.remove(&record.name);
        self.by_uuid.remove(&record.uuid);
        if let Some(device) = record.device {
            self.by_dev.remove(&device);
        }

        debug!("Removed device record {}", record.name);
        Ok(())
    }

    /// Resolve a target area to the device numbers its backing device
    /// is realised under. The UUID is authoritative; the name is a
    /// fallback for records created without one.
    pub fn resolve_area(&self, area: &TargetArea) -> DmResult<Device> {
        let serial = self
            .by_uuid
            .get(area.uuid())
            .or_else(|| self.by_name.get(area.name().as_ref()))
            .ok_or_else(|| {
                DmError::Dm(
                    ErrorEnum::NotFound,
                    format!("no backing device {} (uuid={})", area.name(), area.uuid()),
                )
            })?;
        self.devices[serial].device.ok_or_else(|| {
            DmError::Dm(
                ErrorEnum::NotFound,
                format!("backing device {} is not realised", area.name()),
            )
        })
    }

    /// Serialise the table in `id`'s slot for the kernel boundary.
    pub fn load_lines(&self, id: &DevId<'_>, slot: TableSlot) -> DmResult<Vec<TargetLine>> {
        let record = self.record(id)?;
        let table = match slot {
            TableSlot::Live => record.live_table.as_ref(),
            TableSlot::Inactive => record.inactive_table.as_ref(),
        };
        let table = table.ok_or_else(|| {
            DmError::Dm(
                ErrorEnum::NotFound,
                format!("device {id} has no table in the requested slot"),
            )
        })?;
        table.load_lines(|area| self.resolve_area(area))
    }
}
