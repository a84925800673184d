// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::{mem::size_of, slice, str};

/// Round num up to the nearest multiple of align_to. align_to must be a
/// power of two.
pub fn align_to(num: usize, align_to: usize) -> usize {
    let agn = align_to - 1;
    (num + agn) & !agn
}

/// A byte view of a C-layout struct, suitable for writing into a
/// request buffer.
pub fn slice_from_c_struct<T>(val: &T) -> &[u8] {
    unsafe { slice::from_raw_parts(val as *const T as *const u8, size_of::<T>()) }
}

/// Read the front of a response buffer as a C-layout struct. The
/// buffer carries no alignment guarantee, so the value is copied out.
/// Returns None if the buffer is too short.
pub fn c_struct_from_slice<T: Copy>(slc: &[u8]) -> Option<T> {
    if slc.len() < size_of::<T>() {
        None
    } else {
        Some(unsafe { std::ptr::read_unaligned(slc.as_ptr() as *const T) })
    }
}

/// A writable view of a fixed-size C string field, one byte short so
/// the trailing NUL survives any write.
pub fn mut_slice_from_c_str(buf: &mut [u8]) -> &mut [u8] {
    let len = buf.len();
    &mut buf[..len - 1]
}

/// The string stored in a fixed-size NUL-terminated field, or None if
/// the field has no NUL or holds invalid UTF-8.
pub fn str_from_c_str(slc: &[u8]) -> Option<&str> {
    slc.iter()
        .position(|c| *c == b'\0')
        .and_then(|i| str::from_utf8(&slc[..i]).ok())
}

/// The string at the front of a variable-length response region, up to
/// the first NUL.
pub fn str_from_byte_slice(slc: &[u8]) -> Option<&str> {
    str_from_c_str(slc)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_to() {
        assert_eq!(align_to(0, 8), 0);
        assert_eq!(align_to(1, 8), 8);
        assert_eq!(align_to(8, 8), 8);
        assert_eq!(align_to(9, 8), 16);
        assert_eq!(align_to(17, 4), 20);
    }

    #[test]
    fn test_str_from_c_str() {
        assert_eq!(str_from_c_str(b"linear\0junk"), Some("linear"));
        assert_eq!(str_from_c_str(b"\0"), Some(""));
        assert_eq!(str_from_c_str(b"no-nul"), None);
    }

    #[test]
    fn test_mut_slice_reserves_nul() {
        let mut buf = [0xffu8; 8];
        mut_slice_from_c_str(&mut buf).copy_from_slice(b"1234567");
        assert_eq!(&buf, b"1234567\xff");
    }
}
