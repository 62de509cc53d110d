//! System attribute queries

use crate::error::{Result, RuntimeError};
use std::fmt;

/// Runtime API version reported through `VersionMajor`/`VersionMinor`
pub const VERSION_MAJOR: u16 = 1;
pub const VERSION_MINOR: u16 = 1;

/// Keys accepted by `get_system_info`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum SystemAttribute {
    VersionMajor = 0,
    VersionMinor = 1,
    Timestamp = 2,
    TimestampFrequency = 3,
    SignalMaxWait = 4,
    Endianness = 5,
    MachineModel = 6,
    Extensions = 7,
    SvmStart = 0x200,
    SvmEnd = 0x201,
}

impl TryFrom<u32> for SystemAttribute {
    type Error = RuntimeError;

    fn try_from(key: u32) -> Result<Self> {
        Ok(match key {
            0 => Self::VersionMajor,
            1 => Self::VersionMinor,
            2 => Self::Timestamp,
            3 => Self::TimestampFrequency,
            4 => Self::SignalMaxWait,
            5 => Self::Endianness,
            6 => Self::MachineModel,
            7 => Self::Extensions,
            0x200 => Self::SvmStart,
            0x201 => Self::SvmEnd,
            other => return Err(RuntimeError::UnknownAttribute(other)),
        })
    }
}

impl From<SystemAttribute> for u32 {
    fn from(attribute: SystemAttribute) -> u32 {
        attribute as u32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endianness {
    Little,
    Big,
}

impl Endianness {
    /// Byte order of the running host
    pub const fn host() -> Self {
        if cfg!(target_endian = "little") {
            Endianness::Little
        } else {
            Endianness::Big
        }
    }
}

/// Address width of the host process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineModel {
    /// 32-bit pointers
    Small,
    /// 64-bit pointers
    Large,
}

impl MachineModel {
    pub const fn host() -> Self {
        if cfg!(target_pointer_width = "64") {
            MachineModel::Large
        } else {
            MachineModel::Small
        }
    }
}

/// Typed answer to a system attribute query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemInfoValue {
    Version(u16),
    Timestamp(u64),
    Frequency(u64),
    MaxWait(u64),
    Endianness(Endianness),
    MachineModel(MachineModel),
    /// Bit mask of loaded extensions
    Extensions(u64),
    Address(u64),
}

impl SystemInfoValue {
    /// Numeric view of the value, where one exists
    pub fn as_u64(&self) -> Option<u64> {
        match *self {
            SystemInfoValue::Version(v) => Some(u64::from(v)),
            SystemInfoValue::Timestamp(v)
            | SystemInfoValue::Frequency(v)
            | SystemInfoValue::MaxWait(v)
            | SystemInfoValue::Extensions(v)
            | SystemInfoValue::Address(v) => Some(v),
            SystemInfoValue::Endianness(_) | SystemInfoValue::MachineModel(_) => None,
        }
    }
}

impl fmt::Display for SystemInfoValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SystemInfoValue::Endianness(e) => write!(f, "{e:?}"),
            SystemInfoValue::MachineModel(m) => write!(f, "{m:?}"),
            SystemInfoValue::Address(a) => write!(f, "{a:#x}"),
            other => match other.as_u64() {
                Some(v) => write!(f, "{v}"),
                None => Ok(()),
            },
        }
    }
}

/// Session facts needed to answer attribute queries
#[derive(Debug, Clone, Copy)]
pub(crate) struct SystemFacts {
    pub timestamp: u64,
    pub timestamp_frequency: u64,
    pub extensions: u64,
    pub svm_start: u64,
    pub svm_end: u64,
}

pub(crate) fn query(attribute: SystemAttribute, facts: &SystemFacts) -> SystemInfoValue {
    match attribute {
        SystemAttribute::VersionMajor => SystemInfoValue::Version(VERSION_MAJOR),
        SystemAttribute::VersionMinor => SystemInfoValue::Version(VERSION_MINOR),
        SystemAttribute::Timestamp => SystemInfoValue::Timestamp(facts.timestamp),
        SystemAttribute::TimestampFrequency => SystemInfoValue::Frequency(facts.timestamp_frequency),
        SystemAttribute::SignalMaxWait => SystemInfoValue::MaxWait(u64::MAX),
        SystemAttribute::Endianness => SystemInfoValue::Endianness(Endianness::host()),
        SystemAttribute::MachineModel => SystemInfoValue::MachineModel(MachineModel::host()),
        SystemAttribute::Extensions => SystemInfoValue::Extensions(facts.extensions),
        SystemAttribute::SvmStart => SystemInfoValue::Address(facts.svm_start),
        SystemAttribute::SvmEnd => SystemInfoValue::Address(facts.svm_end),
    }
}
