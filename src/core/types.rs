// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::{borrow::Borrow, fmt, ops::Deref};

use crate::{
    core::dm_ioctl::{DM_NAME_LEN, DM_UUID_LEN},
    result::{DmError, DmResult, ErrorEnum},
};

/// A devicemapper name is bounded by the size of its ioctl header
/// field, NUL included, and may not itself contain a NUL or a '/'.
fn check_name(name: &str) -> DmResult<()> {
    if name.is_empty() {
        return Err(DmError::Dm(
            ErrorEnum::Invalid,
            "device name is empty".into(),
        ));
    }
    if name.as_bytes().len() > DM_NAME_LEN - 1 {
        return Err(DmError::Dm(
            ErrorEnum::Invalid,
            format!(
                "device name {} exceeds {} bytes",
                name,
                DM_NAME_LEN - 1
            ),
        ));
    }
    if name.contains('\0') || name.contains('/') {
        return Err(DmError::Dm(
            ErrorEnum::Invalid,
            format!("device name {} contains a NUL or '/'", name.escape_default()),
        ));
    }
    Ok(())
}

/// A devicemapper UUID may be empty (the kernel allows devices with no
/// UUID) but is bounded by its header field and may not contain a NUL.
fn check_uuid(uuid: &str) -> DmResult<()> {
    if uuid.as_bytes().len() > DM_UUID_LEN - 1 {
        return Err(DmError::Dm(
            ErrorEnum::Invalid,
            format!(
                "device UUID {} exceeds {} bytes",
                uuid,
                DM_UUID_LEN - 1
            ),
        ));
    }
    if uuid.contains('\0') {
        return Err(DmError::Dm(
            ErrorEnum::Invalid,
            format!("device UUID {} contains a NUL", uuid.escape_default()),
        ));
    }
    Ok(())
}

macro_rules! str_id {
    ($B:ident, $O:ident, $check:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $B(str);

        impl $B {
            /// Create a borrowed identifier, verifying the constraints.
            pub fn new(value: &str) -> DmResult<&$B> {
                $check(value)?;
                Ok(unsafe { &*(value as *const str as *const $B) })
            }

            /// The identifier as a byte slice, without a trailing NUL.
            pub fn as_bytes(&self) -> &[u8] {
                self.0.as_bytes()
            }
        }

        impl ToOwned for $B {
            type Owned = $O;

            fn to_owned(&self) -> $O {
                $O(self.0.to_owned())
            }
        }

        impl fmt::Display for $B {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", &self.0)
            }
        }

        #[doc = $doc]
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $O(String);

        impl $O {
            /// Create an owned identifier, verifying the constraints.
            pub fn new(value: String) -> DmResult<$O> {
                $check(&value)?;
                Ok($O(value))
            }
        }

        impl AsRef<$B> for $O {
            fn as_ref(&self) -> &$B {
                self
            }
        }

        impl Borrow<$B> for $O {
            fn borrow(&self) -> &$B {
                self
            }
        }

        impl Deref for $O {
            type Target = $B;

            fn deref(&self) -> &$B {
                // The string was checked on construction.
                unsafe { &*(self.0.as_str() as *const str as *const $B) }
            }
        }

        impl fmt::Display for $O {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", &self.0)
            }
        }
    };
}

str_id!(
    DmName,
    DmNameBuf,
    check_name,
    "The name of a mapped device."
);
str_id!(
    DmUuid,
    DmUuidBuf,
    check_uuid,
    "The UUID of a mapped device."
);

/// An identifier for a mapped device: its name or its UUID.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum DevId<'a> {
    /// The device's name.
    Name(&'a DmName),
    /// The device's devicemapper UUID.
    Uuid(&'a DmUuid),
}

impl<'a> fmt::Display for DevId<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            DevId::Name(name) => write!(f, "{name}"),
            DevId::Uuid(uuid) => write!(f, "{uuid}"),
        }
    }
}
