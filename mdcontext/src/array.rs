// SPDX-License-Identifier: AGPL-3.0-only

//! Typed device arrays.
//!
//! A [`DeviceArray`] is either uninitialized, the owner of one device
//! allocation, or a view of a sub-range of an allocation it does not own.
//! Only owners release memory, and only owners can be resized. A view
//! whose owner has been dropped keeps its id; every later use reports the
//! allocation as released instead of touching freed memory.

use crate::backend::{AllocationId, BufferBinding, ComputeBackend, KernelArg};
use crate::error::{ContextError, Result};
use bytemuck::Pod;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Storage {
    Uninitialized,
    Owned(AllocationId),
    View { allocation: AllocationId, offset: u64 },
}

/// A device buffer of `size` elements of `element_size` bytes.
pub struct DeviceArray {
    backend: Option<Arc<dyn ComputeBackend>>,
    storage: Storage,
    size: usize,
    element_size: usize,
    name: String,
}

impl Default for DeviceArray {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceArray {
    /// An uninitialized array.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            backend: None,
            storage: Storage::Uninitialized,
            size: 0,
            element_size: 0,
            name: String::new(),
        }
    }

    /// Allocate `size × element_size` bytes.
    ///
    /// # Errors
    ///
    /// [`ContextError::Allocation`] if the device cannot hold the array.
    pub fn create(
        backend: &Arc<dyn ComputeBackend>,
        size: usize,
        element_size: usize,
        name: &str,
    ) -> Result<Self> {
        let mut array = Self::new();
        array.initialize(backend, size, element_size, name)?;
        Ok(array)
    }

    /// Allocate `size` elements of `T`.
    ///
    /// # Errors
    ///
    /// As [`Self::create`].
    pub fn create_typed<T: Pod>(backend: &Arc<dyn ComputeBackend>, size: usize, name: &str) -> Result<Self> {
        Self::create(backend, size, std::mem::size_of::<T>(), name)
    }

    /// Wrap `size` elements of an existing allocation starting at byte
    /// `offset`. The view never frees the allocation.
    ///
    /// # Errors
    ///
    /// [`ContextError::IllegalArgument`] for a zero element size.
    pub fn create_view(
        backend: &Arc<dyn ComputeBackend>,
        allocation: AllocationId,
        offset: u64,
        size: usize,
        element_size: usize,
        name: &str,
    ) -> Result<Self> {
        if element_size == 0 {
            return Err(ContextError::IllegalArgument(format!(
                "Error creating array {name}: element size must be positive"
            )));
        }
        Ok(Self {
            backend: Some(Arc::clone(backend)),
            storage: Storage::View { allocation, offset },
            size,
            element_size,
            name: name.to_string(),
        })
    }

    /// View of `size` elements of `element_size` bytes starting at this
    /// array's first byte.
    ///
    /// # Errors
    ///
    /// [`ContextError::InvalidState`] if this array is uninitialized,
    /// [`ContextError::IllegalArgument`] if the view would extend past it.
    pub fn view(&self, size: usize, element_size: usize, name: &str) -> Result<Self> {
        let binding = self.binding()?;
        let bytes = size
            .checked_mul(element_size)
            .and_then(|b| u64::try_from(b).ok())
            .ok_or_else(|| {
                ContextError::IllegalArgument(format!(
                    "view {name} of {size} elements of {element_size} bytes overflows"
                ))
            })?;
        if bytes > binding.size {
            return Err(ContextError::IllegalArgument(format!(
                "view {name} of {bytes} bytes exceeds array {} of {} bytes",
                self.name, binding.size
            )));
        }
        let backend = self.backend()?;
        Self::create_view(backend, binding.allocation, binding.offset, size, element_size, name)
    }

    /// (Re)initialize as the owner of a fresh allocation, releasing any
    /// allocation this array owned before.
    ///
    /// # Errors
    ///
    /// [`ContextError::Allocation`] if the device cannot hold the array.
    pub fn initialize(
        &mut self,
        backend: &Arc<dyn ComputeBackend>,
        size: usize,
        element_size: usize,
        name: &str,
    ) -> Result<()> {
        if element_size == 0 {
            return Err(ContextError::IllegalArgument(format!(
                "Error creating array {name}: element size must be positive"
            )));
        }
        let bytes = size
            .checked_mul(element_size)
            .ok_or_else(|| ContextError::Allocation {
                name: name.to_string(),
                bytes: u64::MAX,
            })?;
        let id = backend.allocate(bytes as u64, name)?;
        self.release();
        self.backend = Some(Arc::clone(backend));
        self.storage = Storage::Owned(id);
        self.size = size;
        self.element_size = element_size;
        self.name = name.to_string();
        Ok(())
    }

    /// Reallocate with a new element count. Contents are not preserved.
    ///
    /// # Errors
    ///
    /// [`ContextError::InvalidState`] for an uninitialized array or a view.
    pub fn resize(&mut self, size: usize) -> Result<()> {
        match self.storage {
            Storage::Uninitialized => Err(ContextError::InvalidState(format!(
                "DeviceArray {} has not been initialized",
                self.name
            ))),
            Storage::View { .. } => Err(ContextError::InvalidState(format!(
                "DeviceArray {} does not own its memory and cannot be resized",
                self.name
            ))),
            Storage::Owned(_) => {
                let backend = Arc::clone(self.backend()?);
                let name = self.name.clone();
                self.initialize(&backend, size, self.element_size, &name)
            }
        }
    }

    #[must_use]
    pub const fn is_initialized(&self) -> bool {
        !matches!(self.storage, Storage::Uninitialized)
    }

    /// Owns its allocation (as opposed to being a view).
    #[must_use]
    pub const fn owns_memory(&self) -> bool {
        matches!(self.storage, Storage::Owned(_))
    }

    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    #[must_use]
    pub const fn element_size(&self) -> usize {
        self.element_size
    }

    #[must_use]
    pub const fn byte_len(&self) -> usize {
        self.size * self.element_size
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    fn backend(&self) -> Result<&Arc<dyn ComputeBackend>> {
        self.backend.as_ref().ok_or_else(|| self.uninitialized())
    }

    fn uninitialized(&self) -> ContextError {
        ContextError::InvalidState(format!("DeviceArray {} has not been initialized", self.name))
    }

    /// Allocation and byte range this array covers.
    ///
    /// # Errors
    ///
    /// [`ContextError::InvalidState`] if uninitialized.
    pub fn binding(&self) -> Result<BufferBinding> {
        let (allocation, offset) = match self.storage {
            Storage::Uninitialized => return Err(self.uninitialized()),
            Storage::Owned(id) => (id, 0),
            Storage::View { allocation, offset } => (allocation, offset),
        };
        Ok(BufferBinding {
            allocation,
            offset,
            size: self.byte_len() as u64,
        })
    }

    /// This array as a kernel argument.
    ///
    /// # Errors
    ///
    /// [`ContextError::InvalidState`] if uninitialized.
    pub fn arg(&self) -> Result<KernelArg> {
        Ok(KernelArg::Buffer(self.binding()?))
    }

    /// Upload raw bytes covering the whole array.
    ///
    /// # Errors
    ///
    /// [`ContextError::IllegalArgument`] when the length differs from
    /// [`Self::byte_len`].
    pub fn upload_bytes(&self, data: &[u8], blocking: bool) -> Result<()> {
        if data.len() != self.byte_len() {
            return Err(ContextError::IllegalArgument(format!(
                "Called upload() on array {} with incompatible size: {} bytes for {} elements of {} bytes",
                self.name,
                data.len(),
                self.size,
                self.element_size
            )));
        }
        let b = self.binding()?;
        self.backend()?.write(b.allocation, b.offset, data, blocking)
    }

    /// Upload a whole array of host elements.
    ///
    /// # Errors
    ///
    /// As [`Self::upload_bytes`].
    pub fn upload<T: Pod>(&self, data: &[T], blocking: bool) -> Result<()> {
        self.upload_bytes(bytemuck::cast_slice(data), blocking)
    }

    /// Upload `data` into elements `offset..offset + data.len()`, where
    /// each `T` is one element.
    ///
    /// # Errors
    ///
    /// [`ContextError::IllegalArgument`] if the range leaves the array or
    /// `T` is not the element size.
    pub fn upload_sub_array<T: Pod>(&self, data: &[T], offset: usize, blocking: bool) -> Result<()> {
        if std::mem::size_of::<T>() != self.element_size {
            return Err(ContextError::IllegalArgument(format!(
                "uploadSubArray: {}-byte elements uploaded to array {} of {}-byte elements",
                std::mem::size_of::<T>(),
                self.name,
                self.element_size
            )));
        }
        self.upload_sub_bytes(bytemuck::cast_slice(data), offset, data.len(), blocking)
    }

    /// Upload `count` elements of raw bytes starting at element `offset`.
    ///
    /// # Errors
    ///
    /// [`ContextError::IllegalArgument`] if the range leaves the array.
    pub fn upload_sub_bytes(&self, data: &[u8], offset: usize, count: usize, blocking: bool) -> Result<()> {
        let end = offset.checked_add(count);
        let bytes = count.checked_mul(self.element_size);
        if end.map_or(true, |end| end > self.size) || bytes != Some(data.len()) {
            return Err(ContextError::IllegalArgument(format!(
                "uploadSubArray: data exceeds range of array {}",
                self.name
            )));
        }
        let b = self.binding()?;
        let start = b.offset + (offset * self.element_size) as u64;
        self.backend()?.write(b.allocation, start, data, blocking)
    }

    /// Upload f64 host values, narrowing them to f32 when `convert` is set
    /// and the array stores 4-byte scalars.
    ///
    /// # Errors
    ///
    /// [`ContextError::IllegalArgument`] if the data does not fill the
    /// array in either representation.
    #[allow(clippy::cast_possible_truncation)]
    pub fn upload_f64(&self, data: &[f64], convert: bool, blocking: bool) -> Result<()> {
        if convert && data.len() * 4 == self.byte_len() && self.element_size % 4 == 0 {
            let narrow: Vec<f32> = data.iter().map(|&v| v as f32).collect();
            return self.upload_bytes(bytemuck::cast_slice(&narrow), blocking);
        }
        self.upload_bytes(bytemuck::cast_slice(data), blocking)
    }

    /// Download the whole array into `out` (blocking).
    ///
    /// # Errors
    ///
    /// [`ContextError::IllegalArgument`] when `out` is not the array's size.
    pub fn download_into<T: Pod>(&self, out: &mut [T]) -> Result<()> {
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(out);
        self.download_bytes(bytes)
    }

    /// Download the whole array as raw bytes (blocking).
    ///
    /// # Errors
    ///
    /// [`ContextError::IllegalArgument`] when `out` is not the array's size.
    pub fn download_bytes(&self, out: &mut [u8]) -> Result<()> {
        if out.len() != self.byte_len() {
            return Err(ContextError::IllegalArgument(format!(
                "Called download() on array {} with incompatible size",
                self.name
            )));
        }
        let b = self.binding()?;
        self.backend()?.read(b.allocation, b.offset, out)
    }

    /// Download the whole array as a vector of `T`.
    ///
    /// # Errors
    ///
    /// [`ContextError::IllegalArgument`] if the array's bytes are not a
    /// whole number of `T`.
    pub fn download<T: Pod>(&self) -> Result<Vec<T>> {
        let elem = std::mem::size_of::<T>();
        if elem == 0 || self.byte_len() % elem != 0 {
            return Err(ContextError::IllegalArgument(format!(
                "Called download() on array {} with incompatible element type",
                self.name
            )));
        }
        let mut out = vec![T::zeroed(); self.byte_len() / elem];
        self.download_into(&mut out)?;
        Ok(out)
    }

    /// Device-to-device copy into `dest`, which must have the same shape.
    ///
    /// # Errors
    ///
    /// [`ContextError::SizeMismatch`] for a different size or element size.
    pub fn copy_to(&self, dest: &Self) -> Result<()> {
        if dest.size != self.size || dest.element_size != self.element_size {
            return Err(ContextError::SizeMismatch {
                source_name: self.name.clone(),
                dest_name: dest.name.clone(),
            });
        }
        self.backend()?.copy(self.binding()?, dest.binding()?)
    }

    fn release(&mut self) {
        if let (Storage::Owned(id), Some(backend)) = (self.storage, self.backend.as_ref()) {
            backend.release(id);
        }
        self.storage = Storage::Uninitialized;
    }
}

impl Drop for DeviceArray {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for DeviceArray {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceArray")
            .field("name", &self.name)
            .field("storage", &self.storage)
            .field("size", &self.size)
            .field("element_size", &self.element_size)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::backend::{DeviceInfo, HostBackend};
    use proptest::prelude::*;

    fn backend() -> Arc<dyn ComputeBackend> {
        Arc::new(HostBackend::new(DeviceInfo {
            name: "host".into(),
            vendor: "host".into(),
            max_buffer_bytes: 1 << 20,
            max_work_group_size: 256,
            supports_fp64: true,
            supports_timestamps: false,
        }))
    }

    fn roundtrip<T: Pod + PartialEq + std::fmt::Debug>(data: &[T]) -> Vec<T> {
        let b = backend();
        let a = DeviceArray::create_typed::<T>(&b, data.len(), "roundtrip").unwrap();
        a.upload(data, true).unwrap();
        a.download().unwrap()
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn upload_download_roundtrip_u32(data in prop::collection::vec(any::<u32>(), 0..64)) {
            prop_assert_eq!(roundtrip(&data), data);
        }

        #[test]
        fn upload_download_roundtrip_f32(data in prop::collection::vec(-1.0e6f32..1.0e6, 0..64)) {
            prop_assert_eq!(roundtrip(&data), data);
        }

        #[test]
        fn upload_download_roundtrip_real4(data in prop::collection::vec(prop::array::uniform4(-1.0e3f32..1.0e3), 0..32)) {
            prop_assert_eq!(roundtrip(&data), data);
        }

        #[test]
        fn upload_download_roundtrip_f64(data in prop::collection::vec(-1.0e12f64..1.0e12, 0..64)) {
            prop_assert_eq!(roundtrip(&data), data);
        }
    }

    #[test]
    fn empty_and_single_element_arrays_roundtrip() {
        assert!(roundtrip::<u32>(&[]).is_empty());
        assert_eq!(roundtrip(&[[1.0f32, 2.0, 3.0, 4.0]]), [[1.0f32, 2.0, 3.0, 4.0]]);
        assert_eq!(roundtrip(&[-0.5f64]), [-0.5]);
    }

    #[test]
    fn oversized_ranges_are_illegal_not_overflow() {
        let b = backend();
        let a = DeviceArray::create_typed::<u32>(&b, 4, "a").unwrap();
        let err = a.upload_sub_bytes(&[0u8; 4], usize::MAX, 1, true).unwrap_err();
        assert!(matches!(err, ContextError::IllegalArgument(_)));
        let err = a.upload_sub_bytes(&[], 0, usize::MAX, true).unwrap_err();
        assert!(matches!(err, ContextError::IllegalArgument(_)));
        let err = a.view(usize::MAX, 16, "huge").unwrap_err();
        assert!(matches!(err, ContextError::IllegalArgument(_)));
    }

    #[test]
    fn uninitialized_array_rejects_use() {
        let a = DeviceArray::new();
        assert!(!a.is_initialized());
        assert!(matches!(a.binding(), Err(ContextError::InvalidState(_))));
        assert!(a.upload::<u8>(&[], true).is_err());
    }

    #[test]
    fn wrong_upload_size_is_illegal_argument() {
        let b = backend();
        let a = DeviceArray::create_typed::<f32>(&b, 4, "a").unwrap();
        let err = a.upload(&[1.0f32; 3], true).unwrap_err();
        assert!(matches!(err, ContextError::IllegalArgument(_)));
    }

    #[test]
    fn resize_changes_size_and_drops_contents() {
        let b = backend();
        let mut a = DeviceArray::create_typed::<u32>(&b, 4, "a").unwrap();
        a.upload(&[7u32; 4], true).unwrap();
        a.resize(10).unwrap();
        assert_eq!(a.size(), 10);
        assert_eq!(a.element_size(), 4);
        assert_eq!(a.name(), "a");
        assert_eq!(a.download::<u32>().unwrap().len(), 10);
    }

    #[test]
    fn views_cannot_resize_and_do_not_free() {
        let b = backend();
        let owner = DeviceArray::create_typed::<f32>(&b, 8, "owner").unwrap();
        let mut view = owner.view(4, 4, "view").unwrap();
        assert!(!view.owns_memory());
        assert!(matches!(view.resize(2), Err(ContextError::InvalidState(_))));
        drop(view);
        owner.upload(&[1.0f32; 8], true).unwrap();
    }

    #[test]
    fn view_after_owner_dropped_reports_released() {
        let b = backend();
        let owner = DeviceArray::create_typed::<f32>(&b, 8, "owner").unwrap();
        let view = owner.view(8, 4, "view").unwrap();
        drop(owner);
        let err = view.download::<f32>().unwrap_err();
        assert!(matches!(err, ContextError::InvalidState(_)));
    }

    #[test]
    fn sub_array_upload_lands_at_offset() {
        let b = backend();
        let a = DeviceArray::create_typed::<u32>(&b, 6, "a").unwrap();
        a.upload(&[0u32; 6], true).unwrap();
        a.upload_sub_array(&[5u32, 6], 3, true).unwrap();
        assert_eq!(a.download::<u32>().unwrap(), [0, 0, 0, 5, 6, 0]);
        assert!(a.upload_sub_array(&[1u32, 2], 5, true).is_err());
    }

    #[test]
    fn copy_requires_matching_shape() {
        let b = backend();
        let src = DeviceArray::create_typed::<u32>(&b, 4, "src").unwrap();
        let same = DeviceArray::create_typed::<u32>(&b, 4, "same").unwrap();
        let other = DeviceArray::create_typed::<u32>(&b, 5, "other").unwrap();
        src.upload(&[1u32, 2, 3, 4], true).unwrap();
        src.copy_to(&same).unwrap();
        assert_eq!(same.download::<u32>().unwrap(), [1, 2, 3, 4]);
        let err = src.copy_to(&other).unwrap_err();
        assert!(matches!(err, ContextError::SizeMismatch { .. }));
    }

    #[test]
    fn converted_upload_narrows_to_f32() {
        let b = backend();
        let a = DeviceArray::create_typed::<f32>(&b, 3, "charges").unwrap();
        a.upload_f64(&[0.5, -1.0, 2.25], true, true).unwrap();
        assert_eq!(a.download::<f32>().unwrap(), [0.5, -1.0, 2.25]);
    }

    #[test]
    fn dropping_owner_releases_allocation() {
        let host = Arc::new(HostBackend::new(DeviceInfo {
            name: "host".into(),
            vendor: "host".into(),
            max_buffer_bytes: 1 << 20,
            max_work_group_size: 256,
            supports_fp64: true,
            supports_timestamps: false,
        }));
        let b: Arc<dyn ComputeBackend> = host.clone();
        let a = DeviceArray::create_typed::<f32>(&b, 4, "a").unwrap();
        assert_eq!(host.live_allocations(), 1);
        drop(a);
        assert_eq!(host.live_allocations(), 0);
    }
}
