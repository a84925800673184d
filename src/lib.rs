// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! A user-space engine for Linux devicemapper configuration.
//!
//! # Overview
//!
//! Linux's devicemapper allows the creation of block devices whose
//! storage is mapped to other block devices in useful ways, either by
//! changing the location of its data blocks, or performing some
//! operation on the data itself. This crate is the core of a volume
//! manager built on that facility: it takes a declarative description
//! of virtual block devices and realises them as live kernel devices.
//!
//! Three layers cooperate:
//!
//! * A [`TargetTable`] maps each sector range of a device onto a
//!   [`Target`]. Completing a table compiles a flat-array implicit
//!   B-tree over the entry boundaries, so translating a sector to its
//!   target is a handful of comparisons over contiguous memory.
//! * A [`DeviceRegistry`] records every mapped device by name and
//!   UUID, with its live and staged tables and observed kernel state.
//! * A [`DmTree`] is built from the registry before each orchestrated
//!   operation: a DAG whose edges mean "references as backing
//!   storage", with a sentinel root above and below. Its walks
//!   preload, resume, suspend, and remove whole stacks in dependency
//!   order, scoped to one administrative domain by UUID prefix.
//!
//! The [`DM`] context carries each per-device operation to the kernel
//! as an ioctl on the control device; the walks drive any
//! [`DmControl`] endpoint, so the planner can be exercised without a
//! kernel.
//!
//! # Usage
//!
//! Before they can be used, DM devices must be created and have a
//! mapping table loaded, then be activated by a resume. Once
//! activated, they can be used as regular block devices, including
//! having other DM devices map to them. Stacks come up
//! dependencies-first and come down dependents-first:
//!
//! ```no_run
//! use dm_engine::{DeviceRegistry, DmTree, DM};
//!
//! let mut registry = DeviceRegistry::new();
//! // ... declare devices and stage tables ...
//! let tree = DmTree::build(&registry).unwrap();
//! let mut dm = DM::new().unwrap();
//! tree.preload_children(DmTree::ROOT, "vg0-", true, &mut registry, &mut dm)
//!     .unwrap();
//! ```

#![warn(missing_docs)]

#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate log;
#[macro_use]
extern crate nix;

mod core;
mod registry;
mod result;
mod table;
mod target;
mod tree;
mod units;

use std::{path::PathBuf, sync::RwLock};

pub use crate::{
    core::{
        dm_majors, errors, is_dm_major, DevId, Device, DeviceInfo, DmControl, DmFlags, DmInfo,
        DmName, DmNameBuf, DmOptions, DmUuid, DmUuidBuf, TargetLine, DM,
    },
    registry::{DevFlags, DeviceRegistry, MappedDevice, TableSlot},
    result::{DmError, DmResult, ErrorEnum},
    table::{TargetTable, KEYS_PER_NODE, MAX_SECTOR},
    target::{MirrorLog, Target, TargetArea, TargetKind},
    tree::{DmTree, NodeDisposition, NodeId, NodeReport, TreeNode, WalkReport, WalkStatus},
    units::{div_up, int_log, round_up, Sectors, SECTOR_SIZE},
};

const DEFAULT_DM_DEV_DIR: &str = "/dev/mapper";

lazy_static! {
    static ref DEV_DIR: RwLock<PathBuf> = RwLock::new(PathBuf::from(DEFAULT_DM_DEV_DIR));
}

/// The directory under which device nodes are created and displayed.
pub fn dev_dir() -> PathBuf {
    DEV_DIR
        .read()
        .expect("no user of this lock panics while holding it")
        .clone()
}

/// Configure the device directory. Process-wide; takes effect for
/// subsequent calls only.
pub fn set_dev_dir<P: Into<PathBuf>>(dir: P) {
    *DEV_DIR
        .write()
        .expect("no user of this lock panics while holding it") = dir.into();
}

/// Install the process-wide logging backend at the given verbosity.
/// Calling again adjusts the level for subsequent calls.
pub fn log_init_verbose(level: log::LevelFilter) {
    let _ = env_logger::Builder::new().filter_level(level).try_init();
    log::set_max_level(level);
}

/// The version of this library.
pub fn library_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
