use std::fmt;

use anyhow::{Context, Result};
use bytecheck::CheckBytes;
use nix::errno::Errno;
use rkyv::{Archive, Deserialize, Serialize};

use crate::util::anyhow_errno;

pub const MIN_PAGE_SIZE: u32 = 512;
pub const MAX_PAGE_SIZE: u32 = 65_536;

/// Offset of the big-endian page size field inside block 0.
pub const PAGE_SIZE_OFFSET: usize = 16;

/// Header bytes compared on lock upgrade (the file change counter region).
pub const CHANGE_COUNTER_RANGE: std::ops::Range<usize> = 24..40;

/// Store key of the metadata record.
pub const META_KEY: i64 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum LockLevel {
    None = 0,
    Shared = 1,
    Reserved = 2,
    Pending = 3,
    Exclusive = 4,
}

impl LockLevel {
    pub fn from_i32(raw: i32) -> Result<Self> {
        match raw {
            0 => Ok(Self::None),
            1 => Ok(Self::Shared),
            2 => Ok(Self::Reserved),
            3 => Ok(Self::Pending),
            4 => Ok(Self::Exclusive),
            other => Err(anyhow_errno(
                Errno::EINVAL,
                format!("invalid lock level {other}"),
            )),
        }
    }

    pub fn as_i32(self) -> i32 {
        self as i32
    }

    /// RESERVED and PENDING collapse into EXCLUSIVE: the store already
    /// serializes read/write transactions.
    pub fn effective(self) -> Self {
        match self {
            Self::Reserved | Self::Pending => Self::Exclusive,
            other => other,
        }
    }
}

impl fmt::Display for LockLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::None => "NONE",
            Self::Shared => "SHARED",
            Self::Reserved => "RESERVED",
            Self::Pending => "PENDING",
            Self::Exclusive => "EXCLUSIVE",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub pos: u64,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileMeta {
    pub size: u64,
    pub block_size: Option<u32>,
    pub mode: Option<u32>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SetAttr {
    pub size: Option<u64>,
    pub mode: Option<u32>,
    pub block_size: Option<u32>,
}

/// Durable form of [`FileMeta`], stored at [`META_KEY`].
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[rkyv(bytecheck())]
pub struct MetaRecord {
    pub size: u64,
    pub block_size: u32,
}

pub fn encode_rkyv<T>(value: &T) -> Result<Vec<u8>>
where
    T: Archive
        + for<'a> Serialize<
            rkyv::api::high::HighSerializer<
                rkyv::util::AlignedVec,
                rkyv::ser::allocator::ArenaHandle<'a>,
                rkyv::rancor::Error,
            >,
        >,
{
    rkyv::to_bytes::<rkyv::rancor::Error>(value)
        .map(|bytes| bytes.to_vec())
        .context("rkyv encode failed")
}

pub fn decode_rkyv<T>(bytes: &[u8]) -> Result<T>
where
    T: Archive,
    T::Archived: for<'a> CheckBytes<rkyv::api::high::HighValidator<'a, rkyv::rancor::Error>>
        + Deserialize<T, rkyv::api::high::HighDeserializer<rkyv::rancor::Error>>,
{
    rkyv::from_bytes::<T, rkyv::rancor::Error>(bytes).context("rkyv decode failed")
}

pub fn block_key(pos: u64, block_size: u32) -> u64 {
    pos / u64::from(block_size)
}

pub fn block_pos(key: u64, block_size: u32) -> u64 {
    key * u64::from(block_size)
}

pub fn is_valid_page_size(size: u32) -> bool {
    (MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&size) && size.is_power_of_two()
}

/// Reads the page size field of a database header. `None` when the header is
/// too short to carry one.
pub fn page_size_field(header: &[u8]) -> Option<u32> {
    let raw = header.get(PAGE_SIZE_OFFSET..PAGE_SIZE_OFFSET + 2)?;
    let value = u16::from_be_bytes([raw[0], raw[1]]);
    Some(if value == 1 {
        MAX_PAGE_SIZE
    } else {
        u32::from(value)
    })
}

/// Page size encoded in a header, rejected unless it is a supported size.
pub fn read_page_size(header: &[u8]) -> Result<u32> {
    let Some(size) = page_size_field(header) else {
        return Err(anyhow_errno(
            Errno::EINVAL,
            format!(
                "corrupt page size: header is {} bytes, need at least {}",
                header.len(),
                PAGE_SIZE_OFFSET + 2
            ),
        ));
    };
    if !is_valid_page_size(size) {
        return Err(anyhow_errno(
            Errno::EINVAL,
            format!("corrupt page size {size}: expected a power of two in 512..=65536"),
        ));
    }
    Ok(size)
}

/// Whether the change counter region of two first blocks is identical.
/// Both absent counts as unchanged, exactly one absent as changed.
pub fn first_block_unchanged(cached: Option<&[u8]>, current: Option<&[u8]>) -> bool {
    match (cached, current) {
        (Some(cached), Some(current)) => {
            cached.get(CHANGE_COUNTER_RANGE) == current.get(CHANGE_COUNTER_RANGE)
        }
        (None, None) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(raw: u16) -> Vec<u8> {
        let mut block = vec![0_u8; 100];
        block[16..18].copy_from_slice(&raw.to_be_bytes());
        block
    }

    #[test]
    fn page_size_one_means_64k() {
        assert_eq!(read_page_size(&header(1)).expect("valid"), 65_536);
        assert_eq!(read_page_size(&header(4096)).expect("valid"), 4096);
    }

    #[test]
    fn page_size_rejects_non_power_of_two_and_short_headers() {
        let err = read_page_size(&header(1000)).expect_err("1000 is not a page size");
        assert!(err.to_string().contains("corrupt page size"), "unexpected error: {err}");
        assert!(read_page_size(&header(256)).is_err());
        assert!(read_page_size(&[0_u8; 10]).is_err());
    }

    #[test]
    fn meta_record_roundtrip() {
        let record = MetaRecord {
            size: 100,
            block_size: 4096,
        };
        let raw = encode_rkyv(&record).expect("encode");
        let back: MetaRecord = decode_rkyv(&raw).expect("decode");
        assert_eq!(back, record);
    }

    #[test]
    fn change_counter_comparison() {
        let mut a = vec![0_u8; 64];
        let b = a.clone();
        assert!(first_block_unchanged(Some(&a), Some(&b)));
        a[30] = 7;
        assert!(!first_block_unchanged(Some(&a), Some(&b)));
        a[30] = 0;
        a[50] = 9;
        assert!(first_block_unchanged(Some(&a), Some(&b)));
        assert!(first_block_unchanged(None, None));
        assert!(!first_block_unchanged(None, Some(&b)));
    }

    #[test]
    fn effective_level_collapses_intermediate_levels() {
        assert_eq!(LockLevel::Reserved.effective(), LockLevel::Exclusive);
        assert_eq!(LockLevel::Pending.effective(), LockLevel::Exclusive);
        assert_eq!(LockLevel::Shared.effective(), LockLevel::Shared);
        assert!(LockLevel::from_i32(5).is_err());
    }
}
