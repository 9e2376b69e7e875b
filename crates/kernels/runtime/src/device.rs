//! Execution context and per-device memory.
//!
//! The [`ExecutionContext`] owns one [`DeviceContext`] per compute device.
//! Device memory is addressed through [`DevicePtr`] handles: a pointer names
//! its device, the allocation it points into and a byte offset. Handles are
//! `Copy` and carry no lifetime, so memory blocks can store them next to
//! their host buffer and hand them to kernels as launch arguments.
//!
//! A device context can be lost (see [`ExecutionContext::reset_device`]).
//! Freeing memory on a lost context is a no-op; every other access reports
//! [`Error::DeviceUnavailable`]. Pointers handed out before a reset are stale
//! forever, even after the context is revived.
//!
//! # Example
//!
//! ```ignore
//! let mut ctx = ExecutionContext::new(&DeviceConfig::default());
//! let ptr = ctx.allocate(DeviceId::PRIMARY, 16)?;
//! ctx.write(ptr, &[1, 2, 3, 4])?;
//! ctx.free(ptr)?;
//! ```

use brainflow_foundation::{DeviceId, Element};
use indexmap::IndexMap;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::memory::AlignedBytes;

/// Identifier of one allocation inside a device context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AllocationId(u64);

/// Handle to a byte position inside a device allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DevicePtr {
    device: DeviceId,
    generation: u32,
    allocation: AllocationId,
    offset: usize,
}

impl DevicePtr {
    /// Device holding the allocation.
    pub fn device(self) -> DeviceId {
        self.device
    }

    /// Byte offset from the start of the allocation.
    pub fn offset(self) -> usize {
        self.offset
    }

    /// A pointer `bytes` further into the same allocation.
    ///
    /// Saturates on overflow; the result then fails every bounds check.
    pub fn offset_by(self, bytes: usize) -> Self {
        Self {
            offset: self.offset.saturating_add(bytes),
            ..self
        }
    }
}

/// A device buffer owned by someone other than the memory block that uses it.
///
/// Unmanaged blocks bind to an external pointer instead of allocating. The
/// block never frees it; the registering party calls
/// [`ExecutionContext::release_external`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExternalPointer {
    ptr: DevicePtr,
    len: usize,
}

impl ExternalPointer {
    pub fn ptr(self) -> DevicePtr {
        self.ptr
    }

    /// Size of the external buffer in bytes.
    pub fn len(self) -> usize {
        self.len
    }

    pub fn is_empty(self) -> bool {
        self.len == 0
    }

    pub fn device(self) -> DeviceId {
        self.ptr.device
    }
}

/// Device setup for an execution context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Number of devices to create. At least one is always created.
    pub device_count: usize,
    /// Per-device memory budget in bytes. `None` means unlimited.
    pub memory_limit_bytes: Option<usize>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            device_count: 1,
            memory_limit_bytes: None,
        }
    }
}

#[derive(Debug)]
struct Allocation {
    bytes: AlignedBytes,
    external: bool,
}

/// Memory and bookkeeping of a single compute device.
#[derive(Debug)]
pub struct DeviceContext {
    id: DeviceId,
    alive: bool,
    generation: u32,
    allocations: IndexMap<AllocationId, Allocation>,
    used_bytes: usize,
    memory_limit: Option<usize>,
    kernel_launches: u64,
}

impl DeviceContext {
    fn new(id: DeviceId, memory_limit: Option<usize>) -> Self {
        Self {
            id,
            alive: true,
            generation: 0,
            allocations: IndexMap::new(),
            used_bytes: 0,
            memory_limit,
            kernel_launches: 0,
        }
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn is_alive(&self) -> bool {
        self.alive
    }

    /// Bytes currently allocated, external buffers included.
    pub fn used_bytes(&self) -> usize {
        self.used_bytes
    }

    pub fn allocation_count(&self) -> usize {
        self.allocations.len()
    }

    pub fn memory_limit(&self) -> Option<usize> {
        self.memory_limit
    }

    /// Number of kernel launches recorded on this device.
    pub fn kernel_launches(&self) -> u64 {
        self.kernel_launches
    }

    fn check(&self, ptr: DevicePtr) -> Result<()> {
        if !self.alive {
            return Err(Error::DeviceUnavailable(self.id));
        }
        if ptr.generation != self.generation {
            return Err(Error::InvalidDevicePointer {
                device: self.id,
                reason: "allocation predates a device reset".to_string(),
            });
        }
        Ok(())
    }

    fn slice(&self, ptr: DevicePtr, len: usize) -> Result<&[u8]> {
        self.check(ptr)?;
        let allocation = self
            .allocations
            .get(&ptr.allocation)
            .ok_or_else(|| self.unknown_allocation())?;
        allocation
            .bytes
            .as_bytes()
            .get(ptr.offset..ptr.offset.saturating_add(len))
            .ok_or_else(|| self.out_of_bounds(ptr, len, allocation.bytes.len()))
    }

    fn slice_mut(&mut self, ptr: DevicePtr, len: usize) -> Result<&mut [u8]> {
        self.check(ptr)?;
        let id = self.id;
        let allocation = self
            .allocations
            .get_mut(&ptr.allocation)
            .ok_or(Error::InvalidDevicePointer {
                device: id,
                reason: "unknown allocation".to_string(),
            })?;
        let size = allocation.bytes.len();
        allocation
            .bytes
            .as_bytes_mut()
            .get_mut(ptr.offset..ptr.offset.saturating_add(len))
            .ok_or_else(|| Error::InvalidDevicePointer {
                device: id,
                reason: format!(
                    "range {}..{} exceeds allocation of {size} bytes",
                    ptr.offset,
                    ptr.offset.saturating_add(len)
                ),
            })
    }

    fn unknown_allocation(&self) -> Error {
        Error::InvalidDevicePointer {
            device: self.id,
            reason: "unknown allocation".to_string(),
        }
    }

    fn out_of_bounds(&self, ptr: DevicePtr, len: usize, size: usize) -> Error {
        Error::InvalidDevicePointer {
            device: self.id,
            reason: format!(
                "range {}..{} exceeds allocation of {size} bytes",
                ptr.offset,
                ptr.offset.saturating_add(len)
            ),
        }
    }
}

/// All compute devices available to a simulation.
#[derive(Debug)]
pub struct ExecutionContext {
    devices: Vec<DeviceContext>,
    next_allocation: u64,
}

impl ExecutionContext {
    pub fn new(config: &DeviceConfig) -> Self {
        let count = config.device_count.max(1);
        debug!(devices = count, limit = ?config.memory_limit_bytes, "creating execution context");
        Self {
            devices: (0..count)
                .map(|i| DeviceContext::new(DeviceId(i), config.memory_limit_bytes))
                .collect(),
            next_allocation: 0,
        }
    }

    /// Shorthand for an unlimited context with `count` devices.
    pub fn with_devices(count: usize) -> Self {
        Self::new(&DeviceConfig {
            device_count: count,
            memory_limit_bytes: None,
        })
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    pub fn devices(&self) -> impl Iterator<Item = &DeviceContext> {
        self.devices.iter()
    }

    pub fn device(&self, device: DeviceId) -> Result<&DeviceContext> {
        self.devices.get(device.index()).ok_or(Error::DeviceOutOfRange {
            device,
            count: self.devices.len(),
        })
    }

    fn device_mut(&mut self, device: DeviceId) -> Result<&mut DeviceContext> {
        let count = self.devices.len();
        self.devices
            .get_mut(device.index())
            .ok_or(Error::DeviceOutOfRange { device, count })
    }

    /// Whether `device` exists and its context is usable.
    pub fn is_alive(&self, device: DeviceId) -> bool {
        self.devices
            .get(device.index())
            .is_some_and(DeviceContext::is_alive)
    }

    /// The device observers read from: the last one in the context.
    pub fn observer_device(&self) -> DeviceId {
        DeviceId(self.devices.len() - 1)
    }

    /// Allocate `len` zeroed bytes on `device`.
    pub fn allocate(&mut self, device: DeviceId, len: usize) -> Result<DevicePtr> {
        self.insert_allocation(device, len, false)
    }

    /// Register a buffer owned outside any memory block.
    pub fn register_external(&mut self, device: DeviceId, len: usize) -> Result<ExternalPointer> {
        let ptr = self.insert_allocation(device, len, true)?;
        Ok(ExternalPointer { ptr, len })
    }

    /// Release an external buffer. Lost devices are skipped.
    pub fn release_external(&mut self, external: ExternalPointer) -> Result<()> {
        self.free(external.ptr)
    }

    fn insert_allocation(&mut self, device: DeviceId, len: usize, external: bool) -> Result<DevicePtr> {
        let id = AllocationId(self.next_allocation);
        let context = self.device_mut(device)?;
        if !context.alive {
            return Err(Error::DeviceUnavailable(device));
        }
        if let Some(limit) = context.memory_limit {
            let available = limit.saturating_sub(context.used_bytes);
            if len > available {
                return Err(Error::OutOfDeviceMemory {
                    device,
                    requested: len,
                    available,
                });
            }
        }
        context.allocations.insert(
            id,
            Allocation {
                bytes: AlignedBytes::zeroed(len),
                external,
            },
        );
        context.used_bytes += len;
        let generation = context.generation;
        self.next_allocation += 1;
        trace!(%device, bytes = len, external, "device allocation");
        Ok(DevicePtr {
            device,
            generation,
            allocation: id,
            offset: 0,
        })
    }

    /// Free the allocation `ptr` points into.
    ///
    /// Lost contexts and pointers from before a reset are skipped silently:
    /// their memory is already gone.
    pub fn free(&mut self, ptr: DevicePtr) -> Result<()> {
        let context = self.device_mut(ptr.device)?;
        if !context.alive || ptr.generation != context.generation {
            trace!(device = %ptr.device, "skipping free on lost device context");
            return Ok(());
        }
        let allocation = context
            .allocations
            .shift_remove(&ptr.allocation)
            .ok_or_else(|| context.unknown_allocation())?;
        context.used_bytes -= allocation.bytes.len();
        trace!(device = %ptr.device, bytes = allocation.bytes.len(), external = allocation.external, "device free");
        Ok(())
    }

    pub fn bytes(&self, ptr: DevicePtr, len: usize) -> Result<&[u8]> {
        self.device(ptr.device)?.slice(ptr, len)
    }

    pub fn bytes_mut(&mut self, ptr: DevicePtr, len: usize) -> Result<&mut [u8]> {
        self.device_mut(ptr.device)?.slice_mut(ptr, len)
    }

    /// Device to host transfer.
    pub fn read(&self, ptr: DevicePtr, dst: &mut [u8]) -> Result<()> {
        dst.copy_from_slice(self.bytes(ptr, dst.len())?);
        Ok(())
    }

    /// Host to device transfer.
    pub fn write(&mut self, ptr: DevicePtr, src: &[u8]) -> Result<()> {
        self.bytes_mut(ptr, src.len())?.copy_from_slice(src);
        Ok(())
    }

    /// Typed view of `count` elements starting at `ptr`.
    pub fn view<T: Element>(&self, ptr: DevicePtr, count: usize) -> Result<&[T]> {
        let bytes = self.bytes(ptr, count * std::mem::size_of::<T>())?;
        bytemuck::try_cast_slice(bytes).map_err(|e| Error::InvalidDevicePointer {
            device: ptr.device,
            reason: format!("cannot view as {}: {e}", T::TYPE),
        })
    }

    /// Mutable typed view of `count` elements starting at `ptr`.
    pub fn view_mut<T: Element>(&mut self, ptr: DevicePtr, count: usize) -> Result<&mut [T]> {
        let bytes = self.bytes_mut(ptr, count * std::mem::size_of::<T>())?;
        bytemuck::try_cast_slice_mut(bytes).map_err(|e| Error::InvalidDevicePointer {
            device: ptr.device,
            reason: format!("cannot view as {}: {e}", T::TYPE),
        })
    }

    /// Repeat `pattern` over `len` bytes at `ptr`.
    pub fn memset(&mut self, ptr: DevicePtr, len: usize, pattern: &[u8]) -> Result<()> {
        let target = self.bytes_mut(ptr, len)?;
        if pattern.is_empty() {
            target.fill(0);
        } else {
            for (dst, src) in target.iter_mut().zip(pattern.iter().cycle()) {
                *dst = *src;
            }
        }
        Ok(())
    }

    /// Copy `len` bytes between two device locations, possibly on different devices.
    pub fn copy(&mut self, dst: DevicePtr, src: DevicePtr, len: usize) -> Result<()> {
        let data = self.bytes(src, len)?.to_vec();
        self.write(dst, &data)
    }

    /// Copy `len` bytes from `src` to every pointer in `targets`.
    ///
    /// Devices are written in parallel; targets on the same device are
    /// written in order.
    pub fn broadcast(&mut self, src: DevicePtr, targets: &[DevicePtr], len: usize) -> Result<()> {
        if targets.is_empty() {
            return Ok(());
        }
        for target in targets {
            self.device(target.device)?;
        }
        let data = self.bytes(src, len)?.to_vec();
        self.devices.par_iter_mut().try_for_each(|context| {
            let id = context.id;
            for target in targets.iter().filter(|t| t.device == id) {
                context.slice_mut(*target, len)?.copy_from_slice(&data);
            }
            Ok(())
        })
    }

    /// Wait for outstanding work on `device`.
    ///
    /// Transfers and kernels complete synchronously, so this only checks that
    /// the context is still alive.
    pub fn synchronize(&self, device: DeviceId) -> Result<()> {
        if !self.device(device)?.alive {
            return Err(Error::DeviceUnavailable(device));
        }
        Ok(())
    }

    /// Synchronize every live device. Lost devices are skipped.
    pub fn synchronize_all(&self) -> Result<()> {
        for context in self.devices.iter().filter(|d| d.alive) {
            self.synchronize(context.id)?;
        }
        Ok(())
    }

    /// Drop a device context, releasing all of its memory.
    pub fn reset_device(&mut self, device: DeviceId) -> Result<()> {
        let context = self.device_mut(device)?;
        warn!(%device, allocations = context.allocations.len(), "device context reset");
        context.alive = false;
        context.allocations.clear();
        context.used_bytes = 0;
        context.generation += 1;
        Ok(())
    }

    /// Bring a reset device back with empty memory.
    pub fn revive_device(&mut self, device: DeviceId) -> Result<()> {
        let context = self.device_mut(device)?;
        debug!(%device, "device context revived");
        context.alive = true;
        Ok(())
    }

    pub(crate) fn record_launch(&mut self, device: DeviceId) -> Result<()> {
        let context = self.device_mut(device)?;
        if !context.alive {
            return Err(Error::DeviceUnavailable(device));
        }
        context.kernel_launches += 1;
        Ok(())
    }
}
