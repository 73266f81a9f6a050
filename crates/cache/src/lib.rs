//! Lumen Residency Library
//!
//! GPU memory residency with LRU eviction under a device memory budget,
//! page-granular sparse textures and bindless handles.

pub mod bindless;
pub mod config;
pub mod device;
pub mod diagnostics;
pub mod error;
pub mod lru;
pub mod memory_budget;
pub mod object;
pub mod residency;
pub mod signal;
pub mod sparse;

pub use bindless::{BindlessHandle, HandleValue, InFlightGuard};
pub use config::ResidencyConfig;
pub use device::{DeviceContext, DeviceLimits, HeadlessDevice, MemoryInfo, ResidencyUnit};
pub use diagnostics::{DiagnosticsSink, FrameDiagnostic, RecordingDiagnostics, SoftOverBudget, TracingDiagnostics};
pub use error::{ConfigError, ResidencyError};
pub use lru::RecencyList;
pub use memory_budget::{MemoryPressure, PressureThresholds};
pub use object::{CacheableObject, ObjectId, ResourceKind};
pub use residency::{EvictionReport, ResidencyCache, ResidencyStats};
pub use signal::{ResidencySignal, SignalSet};
pub use sparse::{Extent3, PageCoord, PageRegion, SparseDimension, SparseTexture, SparseTextureManager};
