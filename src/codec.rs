//! Byte-level primitives shared by the serialisation paths.
//!
//! Audit records, vault entries and store snapshots all use the same cursor
//! convention: a `&mut &[u8]` that advances as fields are read, so nested
//! readers compose without length bookkeeping.

use core::convert::{TryFrom, TryInto};

pub(crate) trait Int {
    type Bytes: Sized + for<'a> TryFrom<&'a [u8]>;

    fn from_be_bytes(bytes: Self::Bytes) -> Self;
    fn from_le_bytes(bytes: Self::Bytes) -> Self;
}

macro_rules! impl_int {
    ($($type:ty),*) => {
        $(
            impl Int for $type {
                type Bytes = [u8; core::mem::size_of::<$type>()];

                fn from_be_bytes(bytes: Self::Bytes) -> Self {
                    <$type>::from_be_bytes(bytes)
                }

                fn from_le_bytes(bytes: Self::Bytes) -> Self {
                    <$type>::from_le_bytes(bytes)
                }
            }
        )*
    }
}

impl_int!(u16, u32, u64);

pub(crate) fn be<T: Int>(bytes: &mut &[u8]) -> Result<T, UnexpectedEnd> {
    if bytes.len() < core::mem::size_of::<T::Bytes>() {
        return Err(UnexpectedEnd);
    }
    let byte_arr: T::Bytes = bytes[..core::mem::size_of::<T::Bytes>()].try_into().map_err(|_| UnexpectedEnd)?;
    *bytes = &bytes[core::mem::size_of::<T::Bytes>()..];
    Ok(T::from_be_bytes(byte_arr))
}

pub(crate) fn le<T: Int>(bytes: &mut &[u8]) -> Result<T, UnexpectedEnd> {
    if bytes.len() < core::mem::size_of::<T::Bytes>() {
        return Err(UnexpectedEnd);
    }
    let byte_arr: T::Bytes = bytes[..core::mem::size_of::<T::Bytes>()].try_into().map_err(|_| UnexpectedEnd)?;
    *bytes = &bytes[core::mem::size_of::<T::Bytes>()..];
    Ok(T::from_le_bytes(byte_arr))
}

/// Reads a fixed-size byte array off the front of the cursor.
pub(crate) fn array<const N: usize>(bytes: &mut &[u8]) -> Result<[u8; N], UnexpectedEnd> {
    if bytes.len() < N {
        return Err(UnexpectedEnd);
    }
    let arr = bytes[..N].try_into().expect("checked above");
    *bytes = &bytes[N..];
    Ok(arr)
}

/// Writes a byte string prefixed with its compact-size length.
pub(crate) fn write_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    write_compact_size(out, bytes.len() as u64);
    out.extend_from_slice(bytes);
}

pub(crate) fn read_bytes(bytes: &mut &[u8]) -> Result<Vec<u8>, UnexpectedEnd> {
    let len = read_compact_size(bytes)?;
    if (bytes.len() as u64) < len {
        return Err(UnexpectedEnd);
    }
    let len = len as usize;
    let vec = bytes[..len].to_vec();
    *bytes = &bytes[len..];
    Ok(vec)
}

/// Bitcoin compact-size encoding, used where records embed consensus-shaped
/// counts.
pub(crate) fn write_compact_size(out: &mut Vec<u8>, value: u64) {
    match value {
        0..=0xfc => out.push(value as u8),
        0xfd..=0xffff => {
            out.push(0xfd);
            out.extend_from_slice(&(value as u16).to_le_bytes());
        },
        0x10000..=0xffff_ffff => {
            out.push(0xfe);
            out.extend_from_slice(&(value as u32).to_le_bytes());
        },
        _ => {
            out.push(0xff);
            out.extend_from_slice(&value.to_le_bytes());
        },
    }
}

pub(crate) fn read_compact_size(bytes: &mut &[u8]) -> Result<u64, UnexpectedEnd> {
    let first = *bytes.first().ok_or(UnexpectedEnd)?;
    *bytes = &bytes[1..];
    match first {
        0xfd => le::<u16>(bytes).map(u64::from),
        0xfe => le::<u32>(bytes).map(u64::from),
        0xff => le::<u64>(bytes),
        n => Ok(u64::from(n)),
    }
}

#[derive(Debug)]
pub struct UnexpectedEnd;

/// Just to avoid duplicating version values (SSOT).
macro_rules! version_enum {
    (pub enum $name:ident { $($variant:ident = $value:expr),* $(,)? }) => {
        #[must_use = "Protect the code against forgetting to handle new variants"]
        #[derive(Copy, Clone, Eq, PartialEq, Debug)]
        pub enum $name {
            $($variant = $value,)*
        }

        impl $name {
            pub const fn from_num(num: u32) -> Option<Self> {
                match num {
                    $(
                        $value => Some(Self::$variant),
                    )*
                    _ => None,
                }
            }
        }
    }
}
pub(crate) use version_enum;

version_enum! {
    pub enum RecordVersion {
        V0 = 0x00,
    }
}

impl RecordVersion {
    pub const CURRENT: Self = Self::V0;

    pub fn serialize(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&(self as u32).to_be_bytes());
    }

    pub fn deserialize(bytes: &mut &[u8]) -> Result<Self, RecordVersionError> {
        let num = be::<u32>(bytes)?;
        Self::from_num(num).ok_or(RecordVersionError::UnsupportedVersion(num))
    }
}

#[derive(Debug)]
pub enum RecordVersionError {
    UnexpectedEnd,
    /// The version number is not supported (currently always higher).
    UnsupportedVersion(u32),
}

impl From<UnexpectedEnd> for RecordVersionError {
    fn from(_: UnexpectedEnd) -> Self {
        RecordVersionError::UnexpectedEnd
    }
}
