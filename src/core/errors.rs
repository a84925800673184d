// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::fmt;

use crate::core::deviceinfo::DeviceInfo;

/// Errors raised at the kernel boundary.
#[derive(Debug)]
pub enum Error {
    /// An error opening the control device.
    ContextInit(String),
    /// A failure while marshalling a request buffer.
    GeneralIo(String),
    /// The kernel returned a non-zero status for an ioctl. Carries
    /// whatever header information could be recovered and the errno.
    Ioctl(Option<Box<DeviceInfo>>, Box<nix::errno::Errno>),
    /// The kernel's response could not fit in the largest buffer the
    /// header's 32-bit size field can describe.
    IoctlResultTooLarge,
    /// An ioctl was interrupted and the retry was interrupted as well.
    Interrupted(Option<Box<DeviceInfo>>),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Error::ContextInit(ref msg) => {
                write!(f, "failed to open the control device: {msg}")
            }
            Error::GeneralIo(ref msg) => write!(f, "I/O error: {msg}"),
            Error::Ioctl(_, ref errno) => write!(f, "ioctl failed: {errno}"),
            Error::IoctlResultTooLarge => {
                write!(f, "kernel response too large for a 32-bit data size")
            }
            Error::Interrupted(_) => write!(f, "ioctl interrupted"),
        }
    }
}

impl std::error::Error for Error {}
