// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::fmt;

use crate::core::errors;

/// A very simple breakdown of outer errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorEnum {
    /// An invalid argument: a malformed target string, a misordered
    /// high sector, an out-of-range sector.
    Invalid,
    /// An allocation failed.
    NoMemory,
    /// Sector arithmetic overflowed a 64-bit quantity.
    Overflow,
    /// The operation was attempted in the wrong device or table state.
    StateViolation,
    /// No device, node, or UUID by that identity.
    NotFound,
    /// An open count prevented the operation.
    Busy,
    /// The device graph contains a reference cycle.
    CyclicDependency,
}

impl fmt::Display for ErrorEnum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            ErrorEnum::Invalid => write!(f, "invalid argument"),
            ErrorEnum::NoMemory => write!(f, "out of memory"),
            ErrorEnum::Overflow => write!(f, "arithmetic overflow"),
            ErrorEnum::StateViolation => write!(f, "wrong device state"),
            ErrorEnum::NotFound => write!(f, "not found"),
            ErrorEnum::Busy => write!(f, "device busy"),
            ErrorEnum::CyclicDependency => write!(f, "cyclic dependency"),
        }
    }
}

/// Top-level error for this library.
#[derive(Debug)]
pub enum DmError {
    /// An error communicating with the kernel boundary.
    Core(errors::Error),
    /// An error produced by the engine itself.
    Dm(ErrorEnum, String),
}

impl fmt::Display for DmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            DmError::Core(ref err) => write!(f, "core error: {err}"),
            DmError::Dm(ref kind, ref msg) => write!(f, "DM error: {kind}: {msg}"),
        }
    }
}

impl std::error::Error for DmError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match *self {
            DmError::Core(ref err) => Some(err),
            DmError::Dm(..) => None,
        }
    }
}

impl From<errors::Error> for DmError {
    fn from(err: errors::Error) -> DmError {
        DmError::Core(err)
    }
}

/// Return type for this library.
pub type DmResult<T> = Result<T, DmError>;
