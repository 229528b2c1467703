//! Device-facing backend: driver contract, reference driver, residency
//! tracking and pool-frame scoping

pub mod device;
pub mod host;
pub mod pool_frame;
pub mod residency;

pub use device::{page_size, DeviceInfo, GpuDriver, RawBuffer, RawHeap, ResourceOptions};
pub use host::HostDriver;
pub use pool_frame::PoolFrame;
pub use residency::ResidencySet;
