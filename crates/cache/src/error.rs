//! Error types for residency and configuration operations

use std::io;

use crate::bindless::HandleValue;
use crate::object::ObjectId;

/// Errors reported by the residency cache and the sparse/bindless texture manager.
///
/// Construction-time errors (`OutOfRange`, `LevelOutOfRange`) are programmer
/// errors and are never retried. `CapacityExceeded` and `NotYetResident` are
/// frame-time conditions: the scheduler drops the affected task for the
/// current frame and tries again on the next one.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResidencyError {
    /// A single object (or page request) needs more memory than the whole budget
    #[error("object {object} needs {footprint} bytes but the residency budget is {budget} bytes")]
    CapacityExceeded {
        object: ObjectId,
        footprint: usize,
        budget: usize,
    },

    /// A sparse paging request reaches past the addressable extent
    #[error("paging request reaches texel {requested}, beyond the addressable limit of {limit}")]
    OutOfRange { requested: u32, limit: u32 },

    /// A sparse paging request names a mip level the texture does not have
    #[error("mip level {level} does not exist (texture has {levels} levels)")]
    LevelOutOfRange { level: u32, levels: u32 },

    /// The device has not yet signalled completion of a residency request
    #[error("object {object} has a residency request still in flight")]
    NotYetResident { object: ObjectId },

    /// A bindless handle was used before being made resident
    #[error("bindless handle {handle} is not resident")]
    HandleNotResident { handle: HandleValue },

    /// A bindless handle is still referenced by submitted work
    #[error("bindless handle {handle} is referenced by {in_flight} in-flight task(s)")]
    HandleInUse { handle: HandleValue, in_flight: usize },

    /// An explicit non-residency request targeted an object that is still live
    #[error("object {object} is live and cannot be made non-resident")]
    ObjectLive { object: ObjectId },

    /// The object is already tracked by a different residency cache
    #[error("object {object} is tracked by another residency cache")]
    TrackedByOtherCache { object: ObjectId },
}

/// Errors that can occur while loading or saving configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Invalid value for a configuration key
    #[error("invalid value {value:?} for configuration key {key}")]
    InvalidValue { key: String, value: String },

    /// I/O error reading or writing a configuration file
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The configuration file is not valid TOML for this schema
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// The configuration could not be rendered as TOML
    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),
}
