// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The target kinds a table entry may carry.
//!
//! The engine records each target's parameters and backing-device
//! references; it does not interpret them. Serialisation produces the
//! parameter line the kernel's target drivers parse, with each backing
//! device rendered as "major:minor". New kinds need only an enum case
//! and a formatter arm.

use std::fmt::Write;

use crate::{
    core::{Device, DmNameBuf, DmUuidBuf},
    result::{DmError, DmResult, ErrorEnum},
    units::Sectors,
};

/// Size of a target type name at the kernel boundary, NUL included.
const MAX_TYPE_NAME: usize = 16;

/// One backing-device reference inside a target: the device by name
/// and UUID, plus the offset on it where this target's data begins.
/// The name is for display and may change; the UUID is the stable key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetArea {
    name: DmNameBuf,
    uuid: DmUuidBuf,
    offset: Sectors,
}

impl TargetArea {
    /// Reference `offset` sectors into the device known by `name` and
    /// `uuid`.
    pub fn new(name: DmNameBuf, uuid: DmUuidBuf, offset: Sectors) -> TargetArea {
        TargetArea { name, uuid, offset }
    }

    /// The backing device's name.
    pub fn name(&self) -> &DmNameBuf {
        &self.name
    }

    /// The backing device's UUID.
    pub fn uuid(&self) -> &DmUuidBuf {
        &self.uuid
    }

    /// The offset on the backing device.
    pub fn offset(&self) -> Sectors {
        self.offset
    }
}

/// The mirror log a mirror target maintains.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MirrorLog {
    /// An in-core log, rebuilt on every activation.
    Core {
        /// The size of a dirty-region in sectors.
        region_size: Sectors,
    },
    /// A log persisted on its own backing device.
    Disk {
        /// The device holding the log.
        log: TargetArea,
        /// The size of a dirty-region in sectors.
        region_size: Sectors,
    },
}

/// The per-kind parameter record of a target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetKind {
    /// A linear remapping onto one backing device.
    Linear,
    /// Data striped across the areas in chunks.
    Striped {
        /// The size of a stripe chunk in sectors; a power of two.
        chunk_size: Sectors,
    },
    /// Identical copies of the data on every area.
    Mirror {
        /// The dirty-region log.
        log: MirrorLog,
    },
    /// The origin of one or more snapshots; areas[0] is the real
    /// device.
    SnapshotOrigin,
    /// A copy-on-write snapshot; areas[0] is the origin, areas[1] the
    /// COW store.
    Snapshot {
        /// Whether the exception store survives reboot.
        persistent: bool,
        /// The size of a COW chunk in sectors; a power of two.
        chunk_size: Sectors,
    },
    /// Fails every I/O.
    Error,
    /// Reads as zeroes, discards writes.
    Zero,
    /// A target kind this engine does not model; parameters are passed
    /// through verbatim.
    Custom {
        /// The kernel target type name.
        type_name: String,
        /// The pre-formatted parameter line.
        params: String,
    },
}

/// A rule mapping a contiguous sector range of a mapped device onto
/// backing storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    kind: TargetKind,
    areas: Vec<TargetArea>,
}

fn check_chunk_size(chunk_size: Sectors, what: &str) -> DmResult<()> {
    if !chunk_size.0.is_power_of_two() {
        return Err(DmError::Dm(
            ErrorEnum::Invalid,
            format!("{what} chunk size {chunk_size} is not a power of two"),
        ));
    }
    Ok(())
}

impl Target {
    /// A linear target over one backing area.
    pub fn linear(area: TargetArea) -> Target {
        Target {
            kind: TargetKind::Linear,
            areas: vec![area],
        }
    }

    /// A striped target over the given areas.
    pub fn striped(chunk_size: Sectors, areas: Vec<TargetArea>) -> DmResult<Target> {
        if areas.is_empty() {
            return Err(DmError::Dm(
                ErrorEnum::Invalid,
                "a striped target needs at least one stripe".into(),
            ));
        }
        check_chunk_size(chunk_size, "stripe")?;
        Ok(Target {
            kind: TargetKind::Striped { chunk_size },
            areas,
        })
    }

    /// A mirror target over the given images.
    pub fn mirror(log: MirrorLog, areas: Vec<TargetArea>) -> DmResult<Target> {
        if areas.len() < 2 {
            return Err(DmError::Dm(
                ErrorEnum::Invalid,
                "a mirror target needs at least two images".into(),
            ));
        }
        Ok(Target {
            kind: TargetKind::Mirror { log },
            areas,
        })
    }

    /// A snapshot-origin target over the real device.
    pub fn snapshot_origin(origin: TargetArea) -> Target {
        Target {
            kind: TargetKind::SnapshotOrigin,
            areas: vec![origin],
        }
    }

    /// A snapshot of `origin` with exceptions stored on `cow`.
    pub fn snapshot(
        origin: TargetArea,
        cow: TargetArea,
        persistent: bool,
        chunk_size: Sectors,
    ) -> DmResult<Target> {
        check_chunk_size(chunk_size, "snapshot")?;
        Ok(Target {
            kind: TargetKind::Snapshot {
                persistent,
                chunk_size,
            },
            areas: vec![origin, cow],
        })
    }

    /// A target that fails every I/O.
    pub fn error() -> Target {
        Target {
            kind: TargetKind::Error,
            areas: vec![],
        }
    }

    /// A target that reads as zeroes and discards writes.
    pub fn zero() -> Target {
        Target {
            kind: TargetKind::Zero,
            areas: vec![],
        }
    }

    /// A target of a kind this engine does not model. `params` is
    /// emitted verbatim; `areas` declares the backing devices the
    /// parameters refer to so dependency edges stay complete.
    pub fn custom(type_name: String, params: String, areas: Vec<TargetArea>) -> DmResult<Target> {
        if type_name.is_empty()
            || type_name.len() > MAX_TYPE_NAME - 1
            || type_name.contains(|c: char| c.is_whitespace() || c == '\0')
        {
            return Err(DmError::Dm(
                ErrorEnum::Invalid,
                format!("malformed target type name {:?}", type_name),
            ));
        }
        Ok(Target {
            kind: TargetKind::Custom { type_name, params },
            areas,
        })
    }

    /// The per-kind parameter record.
    pub fn kind(&self) -> &TargetKind {
        &self.kind
    }

    /// Every backing-device reference this target carries, the mirror
    /// log's included.
    pub fn areas(&self) -> impl Iterator<Item = &TargetArea> {
        let log_area = match self.kind {
            TargetKind::Mirror {
                log: MirrorLog::Disk { ref log, .. },
            } => Some(log),
            _ => None,
        };
        self.areas.iter().chain(log_area)
    }

    /// The type name the kernel knows this target by.
    pub fn type_name(&self) -> &str {
        match self.kind {
            TargetKind::Linear => "linear",
            TargetKind::Striped { .. } => "striped",
            TargetKind::Mirror { .. } => "mirror",
            TargetKind::SnapshotOrigin => "snapshot-origin",
            TargetKind::Snapshot { .. } => "snapshot",
            TargetKind::Error => "error",
            TargetKind::Zero => "zero",
            TargetKind::Custom { ref type_name, .. } => type_name,
        }
    }

    /// The parameter line for the kernel's target driver. `resolve`
    /// supplies the device numbers the areas' UUIDs currently map to.
    pub fn params_string<F>(&self, mut resolve: F) -> DmResult<String>
    where
        F: FnMut(&TargetArea) -> DmResult<Device>,
    {
        fn emit_areas_line<'a, F>(
            line: &mut String,
            areas: impl Iterator<Item = &'a TargetArea>,
            resolve: &mut F,
            with_offset: bool,
        ) -> DmResult<()>
        where
            F: FnMut(&TargetArea) -> DmResult<Device>,
        {
            for area in areas {
                let dev = resolve(area)?;
                if !line.is_empty() {
                    line.push(' ');
                }
                if with_offset {
                    write!(line, "{} {}", dev, area.offset())
                } else {
                    write!(line, "{dev}")
                }
                .expect("writing to a String cannot fail");
            }
            Ok(())
        }

        let mut line = String::new();
        match self.kind {
            TargetKind::Linear => {
                emit_areas_line(&mut line, self.areas.iter(), &mut resolve, true)?;
            }
            TargetKind::Striped { chunk_size } => {
                write!(line, "{} {}", self.areas.len(), chunk_size)
                    .expect("writing to a String cannot fail");
                emit_areas_line(&mut line, self.areas.iter(), &mut resolve, true)?;
            }
            TargetKind::Mirror { ref log } => {
                match *log {
                    MirrorLog::Core { region_size } => {
                        write!(line, "core 1 {region_size}")
                    }
                    MirrorLog::Disk {
                        ref log,
                        region_size,
                    } => {
                        let log_dev = resolve(log)?;
                        write!(line, "disk 2 {log_dev} {region_size}")
                    }
                }
                .expect("writing to a String cannot fail");
                write!(line, " {}", self.areas.len()).expect("writing to a String cannot fail");
                emit_areas_line(&mut line, self.areas.iter(), &mut resolve, true)?;
            }
            TargetKind::SnapshotOrigin => {
                emit_areas_line(&mut line, self.areas.iter(), &mut resolve, false)?;
            }
            TargetKind::Snapshot {
                persistent,
                chunk_size,
            } => {
                emit_areas_line(&mut line, self.areas.iter(), &mut resolve, false)?;
                write!(
                    line,
                    " {} {}",
                    if persistent { "P" } else { "N" },
                    chunk_size
                )
                .expect("writing to a String cannot fail");
            }
            TargetKind::Error | TargetKind::Zero => {}
            TargetKind::Custom { ref params, .. } => {
                line.push_str(params);
            }
        }

        Ok(line)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use crate::core::{DmNameBuf, DmUuidBuf};

    use super::*;

    fn area(name: &str, uuid: &str, offset: u64) -> TargetArea {
        TargetArea::new(
            DmNameBuf::new(name.into()).unwrap(),
            DmUuidBuf::new(uuid.into()).unwrap(),
            Sectors(offset),
        )
    }

    fn fixed_resolver(area: &TargetArea) -> DmResult<Device> {
        match area.uuid().to_string().as_str() {
            "uuid-a" => Ok(Device { major: 8, minor: 16 }),
            "uuid-b" => Ok(Device { major: 8, minor: 32 }),
            "uuid-log" => Ok(Device { major: 8, minor: 48 }),
            _ => Err(DmError::Dm(ErrorEnum::NotFound, "no such device".into())),
        }
    }

    #[test]
    fn test_linear_params() {
        let t = Target::linear(area("leg", "uuid-a", 2048));
        assert_eq!(t.type_name(), "linear");
        assert_eq!(t.params_string(fixed_resolver).unwrap(), "8:16 2048");
    }

    #[test]
    fn test_striped_params() {
        let t = Target::striped(
            Sectors(128),
            vec![area("s0", "uuid-a", 0), area("s1", "uuid-b", 0)],
        )
        .unwrap();
        assert_eq!(t.params_string(fixed_resolver).unwrap(), "2 128 8:16 0 8:32 0");
    }

    #[test]
    fn test_striped_chunk_size_must_be_power_of_two() {
        assert_matches!(
            Target::striped(Sectors(100), vec![area("s0", "uuid-a", 0)]),
            Err(DmError::Dm(ErrorEnum::Invalid, _))
        );
    }

    #[test]
    fn test_mirror_params_core_log() {
        let t = Target::mirror(
            MirrorLog::Core {
                region_size: Sectors(1024),
            },
            vec![area("m0", "uuid-a", 0), area("m1", "uuid-b", 0)],
        )
        .unwrap();
        assert_eq!(
            t.params_string(fixed_resolver).unwrap(),
            "core 1 1024 2 8:16 0 8:32 0"
        );
        assert_eq!(t.areas().count(), 2);
    }

    #[test]
    fn test_mirror_disk_log_is_an_area() {
        let t = Target::mirror(
            MirrorLog::Disk {
                log: area("log", "uuid-log", 0),
                region_size: Sectors(1024),
            },
            vec![area("m0", "uuid-a", 0), area("m1", "uuid-b", 0)],
        )
        .unwrap();
        assert_eq!(
            t.params_string(fixed_resolver).unwrap(),
            "disk 2 8:48 1024 2 8:16 0 8:32 0"
        );
        // The log counts as a backing reference.
        assert_eq!(t.areas().count(), 3);
    }

    #[test]
    fn test_mirror_needs_two_images() {
        assert_matches!(
            Target::mirror(
                MirrorLog::Core {
                    region_size: Sectors(1024)
                },
                vec![area("m0", "uuid-a", 0)]
            ),
            Err(DmError::Dm(ErrorEnum::Invalid, _))
        );
    }

    #[test]
    fn test_snapshot_params() {
        let t = Target::snapshot(
            area("origin", "uuid-a", 0),
            area("cow", "uuid-b", 0),
            true,
            Sectors(8),
        )
        .unwrap();
        assert_eq!(t.params_string(fixed_resolver).unwrap(), "8:16 8:32 P 8");

        let origin = Target::snapshot_origin(area("origin", "uuid-a", 0));
        assert_eq!(origin.params_string(fixed_resolver).unwrap(), "8:16");
    }

    #[test]
    fn test_trivial_targets() {
        assert_eq!(Target::error().params_string(fixed_resolver).unwrap(), "");
        assert_eq!(Target::zero().params_string(fixed_resolver).unwrap(), "");
        assert_eq!(Target::zero().areas().count(), 0);
    }

    #[test]
    fn test_custom_type_name_checked() {
        assert_matches!(
            Target::custom("has space".into(), "".into(), vec![]),
            Err(DmError::Dm(ErrorEnum::Invalid, _))
        );
        assert_matches!(
            Target::custom("seventeen-chars-x".into(), "".into(), vec![]),
            Err(DmError::Dm(ErrorEnum::Invalid, _))
        );

        let t = Target::custom("thin".into(), "253:4 1".into(), vec![]).unwrap();
        assert_eq!(t.type_name(), "thin");
        assert_eq!(t.params_string(fixed_resolver).unwrap(), "253:4 1");
    }

    #[test]
    fn test_unresolvable_area_is_an_error() {
        let t = Target::linear(area("leg", "uuid-missing", 0));
        assert_matches!(
            t.params_string(fixed_resolver),
            Err(DmError::Dm(ErrorEnum::NotFound, _))
        );
    }
}
