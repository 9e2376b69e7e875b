//! Memory blocks: typed buffers with a host copy and per-device replicas.
//!
//! A [`MemoryBlock`] is the unit of data flowing along graph edges. Its size
//! (`count` elements plus a `column_hint` for 2-D interpretation) is decided
//! during memory-model resolution; allocation happens afterwards.
//!
//! # Replicas
//!
//! - The **host** copy is allocated on demand.
//! - The **owner** replica lives on the owning node's device and is the
//!   source of truth during a step.
//! - **Peer** replicas are created lazily when a consumer on another device
//!   asks for the block ([`MemoryBlock::get_device`]). They are refreshed from
//!   the owner only on [`MemoryBlock::synchronize`].
//!
//! Unmanaged blocks never allocate their owner replica; they bind to an
//! [`ExternalPointer`] registered by whoever owns the memory.

mod bytes;
mod replica;

pub use bytes::AlignedBytes;
pub use replica::{Replica, ReplicaMap};

use brainflow_foundation::{BlockId, DeviceId, Element, ElementType, NodeId, decode_f64};
use tracing::{debug, trace, warn};

use crate::device::{DevicePtr, ExecutionContext, ExternalPointer};
use crate::error::{Error, Result};

/// Static properties of a block, fixed when its node is created.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockSpec {
    pub name: String,
    pub element: ElementType,
    /// Visible to other nodes through connections.
    pub is_output: bool,
    /// Included in persisted state.
    pub persistable: bool,
    /// Backed by an external pointer instead of an allocation.
    pub unmanaged: bool,
}

impl BlockSpec {
    pub fn new(name: impl Into<String>, element: ElementType) -> Self {
        Self {
            name: name.into(),
            element,
            is_output: true,
            persistable: false,
            unmanaged: false,
        }
    }
}

/// A typed buffer with host and device replicas.
#[derive(Debug)]
pub struct MemoryBlock {
    id: BlockId,
    spec: BlockSpec,
    owner: NodeId,
    owner_device: DeviceId,

    count: usize,
    column_hint: usize,
    min_value_hint: f32,
    max_value_hint: f32,
    previous_size: (usize, usize),

    shared: bool,
    external_pointer: Option<ExternalPointer>,
    host: Option<AlignedBytes>,
    replicas: ReplicaMap,
}

impl MemoryBlock {
    pub fn new(id: BlockId, spec: BlockSpec, owner: NodeId, owner_device: DeviceId) -> Self {
        Self {
            id,
            spec,
            owner,
            owner_device,
            count: 0,
            column_hint: 1,
            min_value_hint: f32::NEG_INFINITY,
            max_value_hint: f32::INFINITY,
            previous_size: (0, 1),
            shared: false,
            external_pointer: None,
            host: None,
            replicas: ReplicaMap::default(),
        }
    }

    pub fn id(&self) -> BlockId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn element(&self) -> ElementType {
        self.spec.element
    }

    pub fn owner(&self) -> NodeId {
        self.owner
    }

    pub fn owner_device(&self) -> DeviceId {
        self.owner_device
    }

    pub fn is_output(&self) -> bool {
        self.spec.is_output
    }

    pub fn is_persistable(&self) -> bool {
        self.spec.persistable
    }

    pub fn is_unmanaged(&self) -> bool {
        self.spec.unmanaged
    }

    /// Number of elements.
    pub fn count(&self) -> usize {
        self.count
    }

    pub fn set_count(&mut self, count: usize) {
        self.count = count;
    }

    pub fn column_hint(&self) -> usize {
        self.column_hint
    }

    /// Row length for 2-D interpretation. Values below one are stored as one.
    pub fn set_column_hint(&mut self, column_hint: usize) {
        self.column_hint = column_hint.max(1);
    }

    pub fn min_value_hint(&self) -> f32 {
        self.min_value_hint
    }

    pub fn max_value_hint(&self) -> f32 {
        self.max_value_hint
    }

    /// Expected value range, used by observers for scaling.
    pub fn set_value_hints(&mut self, min: f32, max: f32) {
        self.min_value_hint = min;
        self.max_value_hint = max;
    }

    /// Size in bytes for the current count.
    pub fn size_bytes(&self) -> usize {
        self.count * self.spec.element.size()
    }

    pub fn on_host(&self) -> bool {
        self.host.is_some()
    }

    pub fn on_device(&self) -> bool {
        self.replicas.owner().is_some()
    }

    /// Set once a peer replica has been created.
    pub fn is_shared(&self) -> bool {
        self.shared
    }

    pub fn external_pointer(&self) -> Option<ExternalPointer> {
        self.external_pointer
    }

    /// Bind (or unbind) the external buffer of an unmanaged block.
    pub fn set_external_pointer(&mut self, external: Option<ExternalPointer>) {
        self.external_pointer = external;
    }

    pub fn replicas(&self) -> &ReplicaMap {
        &self.replicas
    }

    /// Owner replica pointer, if allocated.
    pub fn device_ptr(&self) -> Option<DevicePtr> {
        self.replicas.owner().map(|r| r.ptr)
    }

    pub(crate) fn set_owner_device(&mut self, device: DeviceId) -> Result<()> {
        if self.on_device() {
            return Err(Error::AlreadyAllocated {
                block: self.spec.name.clone(),
            });
        }
        self.owner_device = device;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Size tracking
    // ------------------------------------------------------------------

    /// Remember the current size before a node recomputes it.
    pub fn push_sizes(&mut self) {
        self.previous_size = (self.count, self.column_hint);
    }

    /// Whether the size changed since the last [`MemoryBlock::push_sizes`].
    pub fn size_changed(&self) -> bool {
        self.previous_size != (self.count, self.column_hint)
    }

    // ------------------------------------------------------------------
    // Allocation
    // ------------------------------------------------------------------

    /// Allocate a zeroed host buffer. No-op if present or `count == 0`.
    pub fn allocate_host(&mut self) {
        if self.host.is_none() && self.count > 0 {
            self.host = Some(AlignedBytes::zeroed(self.size_bytes()));
        }
    }

    pub fn free_host(&mut self) {
        self.host = None;
    }

    /// Allocate the owner replica and zero it.
    ///
    /// Unmanaged blocks bind their external pointer instead. Idempotent;
    /// `count == 0` allocates nothing.
    pub fn allocate_device(&mut self, ctx: &mut ExecutionContext) -> Result<()> {
        if self.count == 0 || self.on_device() {
            return Ok(());
        }
        let len = self.size_bytes();

        if self.spec.unmanaged {
            let external = self.external_pointer.ok_or_else(|| Error::ExternalPointerMissing {
                block: self.spec.name.clone(),
            })?;
            if external.len() < len {
                return Err(Error::BufferTooSmall {
                    block: self.spec.name.clone(),
                    required: len,
                    provided: external.len(),
                });
            }
            self.replicas.set_owner(Replica {
                ptr: external.ptr(),
                len,
                external: true,
            });
            trace!(block = %self.spec.name, device = %external.device(), "bound external pointer");
            return Ok(());
        }

        let ptr = ctx.allocate(self.owner_device, len)?;
        ctx.memset(ptr, len, &[])?;
        self.replicas.set_owner(Replica {
            ptr,
            len,
            external: false,
        });
        trace!(block = %self.spec.name, device = %self.owner_device, bytes = len, "allocated device replica");
        Ok(())
    }

    /// Release the owner replica and every peer.
    ///
    /// External buffers are unbound, never freed. Lost device contexts are
    /// skipped by the execution context.
    ///
    /// Every replica is released even when one of them fails; the first
    /// error is returned.
    pub fn free_device(&mut self, ctx: &mut ExecutionContext) -> Result<()> {
        let mut first_error = None;
        for replica in self.replicas.drain() {
            if replica.external {
                continue;
            }
            if let Err(e) = ctx.free(replica.ptr) {
                warn!(block = %self.spec.name, device = %replica.ptr.device(), "failed to free replica: {}", e);
                first_error.get_or_insert(e);
            }
        }
        self.shared = false;
        first_error.map_or(Ok(()), Err)
    }

    /// Re-allocate every existing replica whose size no longer matches `count`.
    ///
    /// Returns whether anything was reallocated. Contents are not preserved.
    pub fn reallocate_if_resized(&mut self, ctx: &mut ExecutionContext) -> Result<bool> {
        let len = self.size_bytes();
        let mut changed = false;
        if self.host.as_ref().is_some_and(|h| h.len() != len) {
            self.host = None;
            self.allocate_host();
            changed = true;
        }
        if self.replicas.owner().is_some_and(|r| r.len != len) {
            debug!(block = %self.spec.name, bytes = len, "reallocating resized block");
            self.free_device(ctx)?;
            self.allocate_device(ctx)?;
            changed = true;
        }
        Ok(changed)
    }

    // ------------------------------------------------------------------
    // Host/device transfers
    // ------------------------------------------------------------------

    /// Push the host copy to the owner replica, allocating what is missing.
    ///
    /// Returns `false` when the block is empty and there is nothing to copy.
    pub fn safe_copy_to_device(&mut self, ctx: &mut ExecutionContext) -> Result<bool> {
        self.safe_copy_to_device_range(ctx, 0, self.count)
    }

    /// Push `count` elements starting at element `offset` to the owner replica.
    pub fn safe_copy_to_device_range(
        &mut self,
        ctx: &mut ExecutionContext,
        offset: usize,
        count: usize,
    ) -> Result<bool> {
        if self.count == 0 {
            return Ok(false);
        }
        self.check_range(offset, count)?;
        self.allocate_device(ctx)?;
        self.allocate_host();
        let (Some(owner), Some(host)) = (self.replicas.owner(), self.host.as_ref()) else {
            return Ok(false);
        };
        let size = self.spec.element.size();
        let range = offset * size..(offset + count) * size;
        ctx.write(owner.ptr.offset_by(range.start), &host.as_bytes()[range])?;
        Ok(true)
    }

    /// Pull the owner replica into the host copy.
    ///
    /// Without a device replica the host copy is left untouched.
    pub fn safe_copy_to_host(&mut self, ctx: &ExecutionContext) -> Result<()> {
        self.safe_copy_to_host_range(ctx, 0, self.count)
    }

    /// Pull `count` elements starting at element `offset` into the host copy.
    pub fn safe_copy_to_host_range(
        &mut self,
        ctx: &ExecutionContext,
        offset: usize,
        count: usize,
    ) -> Result<()> {
        if self.count == 0 {
            return Ok(());
        }
        self.check_range(offset, count)?;
        self.allocate_host();
        let (Some(owner), Some(host)) = (self.replicas.owner(), self.host.as_mut()) else {
            return Ok(());
        };
        let size = self.spec.element.size();
        let range = offset * size..(offset + count) * size;
        ctx.read(owner.ptr.offset_by(range.start), &mut host.as_bytes_mut()[range])
    }

    /// Overwrite the block from raw bytes and push to the device.
    pub fn fill_bytes(&mut self, ctx: &mut ExecutionContext, src: &[u8]) -> Result<()> {
        let len = self.size_bytes();
        if src.len() < len {
            return Err(Error::BufferTooSmall {
                block: self.spec.name.clone(),
                required: len,
                provided: src.len(),
            });
        }
        self.allocate_host();
        if let Some(host) = self.host.as_mut() {
            host.as_bytes_mut().copy_from_slice(&src[..len]);
        }
        self.safe_copy_to_device(ctx)?;
        Ok(())
    }

    /// Read the device contents into `dst`.
    pub fn get_bytes(&mut self, ctx: &ExecutionContext, dst: &mut [u8]) -> Result<()> {
        let len = self.size_bytes();
        if dst.len() < len {
            return Err(Error::BufferTooSmall {
                block: self.spec.name.clone(),
                required: len,
                provided: dst.len(),
            });
        }
        self.safe_copy_to_host(ctx)?;
        if let Some(host) = self.host.as_ref() {
            dst[..len].copy_from_slice(host.as_bytes());
        }
        Ok(())
    }

    /// Set every element of the owner replica to `value`.
    pub fn fill<T: Element>(&mut self, ctx: &mut ExecutionContext, value: T) -> Result<()> {
        self.check_type::<T>()?;
        if self.count == 0 {
            return Ok(());
        }
        let owner = self.require_owner()?;
        ctx.memset(owner.ptr, self.size_bytes(), bytemuck::bytes_of(&value))
    }

    // ------------------------------------------------------------------
    // Host views
    // ------------------------------------------------------------------

    /// The host copy as elements of `T`. Empty blocks yield an empty slice.
    pub fn host<T: Element>(&self) -> Result<&[T]> {
        self.check_type::<T>()?;
        match &self.host {
            Some(host) => Ok(host.view::<T>()),
            None if self.count == 0 => Ok(&[]),
            None => Err(self.not_allocated("host")),
        }
    }

    /// Mutable host copy, allocated on demand.
    pub fn host_mut<T: Element>(&mut self) -> Result<&mut [T]> {
        self.check_type::<T>()?;
        self.allocate_host();
        match &mut self.host {
            Some(host) => Ok(host.view_mut::<T>()),
            None => Ok(&mut []),
        }
    }

    /// Raw host bytes, if allocated.
    pub fn host_bytes(&self) -> Option<&[u8]> {
        self.host.as_ref().map(AlignedBytes::as_bytes)
    }

    // ------------------------------------------------------------------
    // Device access
    // ------------------------------------------------------------------

    /// Element `index` read straight from the owner replica.
    ///
    /// Returns `T::default()` when the block has no device replica yet.
    pub fn value_at<T: Element>(&self, ctx: &ExecutionContext, index: usize) -> Result<T> {
        self.check_type::<T>()?;
        self.check_range(index, 1)?;
        let Some(owner) = self.replicas.owner() else {
            return Ok(T::default());
        };
        let size = self.spec.element.size();
        let bytes = ctx.bytes(owner.ptr.offset_by(index * size), size)?;
        Ok(bytemuck::pod_read_unaligned(bytes))
    }

    /// Element `index` widened to `f64`, whatever the element type.
    pub fn value_at_f64(&self, ctx: &ExecutionContext, index: usize) -> Result<f64> {
        self.check_range(index, 1)?;
        let Some(owner) = self.replicas.owner() else {
            return Ok(0.0);
        };
        let size = self.spec.element.size();
        let bytes = ctx.bytes(owner.ptr.offset_by(index * size), size)?;
        Ok(decode_f64(self.spec.element, bytes).unwrap_or_default())
    }

    /// Pointer to the replica on `device`.
    ///
    /// The owner device gets the owner replica. Any other device gets a
    /// peer replica, created and filled from the owner on first request; the
    /// block is then marked shared. Returns `None` while the block has no
    /// owner replica.
    pub fn get_device(&mut self, ctx: &mut ExecutionContext, device: DeviceId) -> Result<Option<DevicePtr>> {
        let Some(owner) = self.replicas.owner() else {
            return Ok(None);
        };
        if owner.ptr.device() == device {
            return Ok(Some(owner.ptr));
        }
        if let Some(peer) = self.replicas.peer(device) {
            return Ok(Some(peer.ptr));
        }

        let ptr = ctx.allocate(device, owner.len)?;
        if let Err(e) = ctx.copy(ptr, owner.ptr, owner.len) {
            ctx.free(ptr)?;
            return Err(e);
        }
        self.replicas.insert_peer(
            device,
            Replica {
                ptr,
                len: owner.len,
                external: false,
            },
        );
        self.shared = true;
        debug!(block = %self.spec.name, from = %owner.ptr.device(), to = %device, "created peer replica");
        Ok(Some(ptr))
    }

    /// Pointer `offset` elements into the replica on `device`.
    pub fn get_device_ptr(
        &mut self,
        ctx: &mut ExecutionContext,
        device: DeviceId,
        offset: usize,
    ) -> Result<Option<DevicePtr>> {
        let size = self.spec.element.size();
        Ok(self
            .get_device(ctx, device)?
            .map(|ptr| ptr.offset_by(offset.saturating_mul(size))))
    }

    /// Pointer on the observer device (the last device in the context).
    pub fn device_ptr_for_observer(&mut self, ctx: &mut ExecutionContext) -> Result<Option<DevicePtr>> {
        let device = ctx.observer_device();
        self.get_device(ctx, device)
    }

    /// Refresh every peer replica from the owner.
    pub fn synchronize(&self, ctx: &mut ExecutionContext) -> Result<()> {
        if !self.shared {
            return Ok(());
        }
        let Some(owner) = self.replicas.owner() else {
            return Ok(());
        };
        let targets: Vec<DevicePtr> = self.replicas.peers().map(|(_, r)| r.ptr).collect();
        ctx.broadcast(owner.ptr, &targets, owner.len)
    }

    /// Copy `count` elements from `source` into this block's owner replica.
    ///
    /// The source is read from its replica on this block's device, which may
    /// create a peer replica there.
    pub fn copy_from_block(
        &self,
        ctx: &mut ExecutionContext,
        source: &mut MemoryBlock,
        src_offset: usize,
        dst_offset: usize,
        count: usize,
    ) -> Result<()> {
        if source.spec.element != self.spec.element {
            return Err(Error::TypeMismatch {
                block: source.spec.name.clone(),
                expected: self.spec.element,
                actual: source.spec.element,
            });
        }
        source.check_range(src_offset, count)?;
        self.check_range(dst_offset, count)?;
        let dst = self.require_owner()?;
        let src = source
            .get_device_ptr(ctx, self.owner_device, src_offset)?
            .ok_or_else(|| source.not_allocated("device"))?;
        let size = self.spec.element.size();
        ctx.copy(dst.ptr.offset_by(dst_offset * size), src, count * size)
    }

    /// Copy `count` elements from this block into `destination`.
    ///
    /// Writes into the destination's replica on this block's device.
    pub fn copy_to_block(
        &self,
        ctx: &mut ExecutionContext,
        destination: &mut MemoryBlock,
        src_offset: usize,
        dst_offset: usize,
        count: usize,
    ) -> Result<()> {
        if destination.spec.element != self.spec.element {
            return Err(Error::TypeMismatch {
                block: destination.spec.name.clone(),
                expected: self.spec.element,
                actual: destination.spec.element,
            });
        }
        self.check_range(src_offset, count)?;
        destination.check_range(dst_offset, count)?;
        let src = self.require_owner()?;
        let dst = destination
            .get_device_ptr(ctx, self.owner_device, dst_offset)?
            .ok_or_else(|| destination.not_allocated("device"))?;
        let size = self.spec.element.size();
        ctx.copy(dst, src.ptr.offset_by(src_offset * size), count * size)
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn check_type<T: Element>(&self) -> Result<()> {
        if T::TYPE != self.spec.element {
            return Err(Error::TypeMismatch {
                block: self.spec.name.clone(),
                expected: T::TYPE,
                actual: self.spec.element,
            });
        }
        Ok(())
    }

    fn check_range(&self, offset: usize, count: usize) -> Result<()> {
        offset
            .checked_add(count)
            .filter(|end| *end <= self.count)
            .map(|_| ())
            .ok_or_else(|| Error::IndexOutOfRange {
                block: self.spec.name.clone(),
                index: offset.saturating_add(count.saturating_sub(1)),
                count: self.count,
            })
    }

    fn require_owner(&self) -> Result<Replica> {
        self.replicas
            .owner()
            .ok_or_else(|| self.not_allocated(&self.owner_device.to_string()))
    }

    fn not_allocated(&self, location: &str) -> Error {
        Error::NotAllocated {
            block: self.spec.name.clone(),
            location: location.to_string(),
        }
    }
}

/// Arena holding every memory block of a graph.
///
/// Ids are never reused, so a stale id fails lookup instead of aliasing a
/// newer block.
#[derive(Debug, Default)]
pub struct BlockStore {
    slots: Vec<Option<MemoryBlock>>,
}

impl BlockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a block owned by `owner` on `device`.
    pub fn insert(&mut self, spec: BlockSpec, owner: NodeId, device: DeviceId) -> BlockId {
        let id = BlockId(self.slots.len() as u32);
        self.slots.push(Some(MemoryBlock::new(id, spec, owner, device)));
        id
    }

    pub fn remove(&mut self, id: BlockId) -> Option<MemoryBlock> {
        self.slots.get_mut(id.0 as usize)?.take()
    }

    pub fn get(&self, id: BlockId) -> Result<&MemoryBlock> {
        self.slots
            .get(id.0 as usize)
            .and_then(Option::as_ref)
            .ok_or(Error::BlockNotFound(id))
    }

    pub fn get_mut(&mut self, id: BlockId) -> Result<&mut MemoryBlock> {
        self.slots
            .get_mut(id.0 as usize)
            .and_then(Option::as_mut)
            .ok_or(Error::BlockNotFound(id))
    }

    /// Borrow two distinct blocks at once.
    pub fn pair_mut(&mut self, a: BlockId, b: BlockId) -> Result<(&mut MemoryBlock, &mut MemoryBlock)> {
        let (ia, ib) = (a.0 as usize, b.0 as usize);
        if ia == ib {
            return Err(Error::BlockNotFound(b));
        }
        if ia.max(ib) >= self.slots.len() {
            return Err(Error::BlockNotFound(if ia > ib { a } else { b }));
        }
        let (first, second) = if ia < ib {
            let (left, right) = self.slots.split_at_mut(ib);
            (&mut left[ia], &mut right[0])
        } else {
            let (left, right) = self.slots.split_at_mut(ia);
            (&mut right[0], &mut left[ib])
        };
        match (first.as_mut(), second.as_mut()) {
            (Some(x), Some(y)) => Ok((x, y)),
            (None, _) => Err(Error::BlockNotFound(a)),
            (_, None) => Err(Error::BlockNotFound(b)),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = &MemoryBlock> {
        self.slots.iter().flatten()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut MemoryBlock> {
        self.slots.iter_mut().flatten()
    }

    /// Refresh the peer replicas of every shared block.
    pub fn synchronize_all(&self, ctx: &mut ExecutionContext) -> Result<()> {
        for block in self.iter().filter(|b| b.is_shared()) {
            block.synchronize(ctx)?;
        }
        Ok(())
    }
}
