// SPDX-License-Identifier: AGPL-3.0-only

//! Storage-buffer allocation, upload and staging readback.
//!
//! wgpu copies move whole 4-byte words. Uploads and downloads of arbitrary
//! byte ranges are widened to the enclosing aligned window; an unaligned
//! upload reads the window back first so neighbouring bytes survive.

use super::WgpuBackend;
use crate::error::{ContextError, Result};

const ALIGN: u64 = wgpu::COPY_BUFFER_ALIGNMENT;

/// The 4-byte aligned window `[start, end)` covering `offset..offset + len`.
pub(super) const fn aligned_window(offset: u64, len: u64) -> (u64, u64) {
    let start = offset / ALIGN * ALIGN;
    let end = (offset + len).div_ceil(ALIGN) * ALIGN;
    (start, end)
}

impl WgpuBackend {
    pub(super) fn create_storage_buffer(&self, bytes: u64, label: &str) -> Result<wgpu::Buffer> {
        if bytes > self.info.max_buffer_bytes {
            return Err(ContextError::Allocation {
                name: label.to_string(),
                bytes,
            });
        }
        let size = bytes.max(ALIGN).div_ceil(ALIGN) * ALIGN;
        let (buffer, err) = self.scoped(|| {
            self.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(label),
                size,
                usage: wgpu::BufferUsages::STORAGE
                    | wgpu::BufferUsages::COPY_SRC
                    | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            })
        });
        match err {
            Some(e) => {
                log::warn!("allocation of {bytes} bytes for {label} failed: {e}");
                Err(ContextError::Allocation {
                    name: label.to_string(),
                    bytes,
                })
            }
            None => Ok(buffer),
        }
    }

    fn create_staging_buffer(&self, size: u64, label: &str) -> wgpu::Buffer {
        self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        })
    }

    fn check_range(buffer: &wgpu::Buffer, offset: u64, len: u64) -> Result<()> {
        if offset + len > buffer.size() {
            return Err(ContextError::IllegalArgument(format!(
                "access of {len} bytes at offset {offset} exceeds a {}-byte buffer",
                buffer.size()
            )));
        }
        Ok(())
    }

    pub(super) fn write_bytes(&self, buffer: &wgpu::Buffer, offset: u64, data: &[u8]) -> Result<()> {
        let len = data.len() as u64;
        Self::check_range(buffer, offset, len)?;
        if len == 0 {
            return Ok(());
        }
        if offset % ALIGN == 0 && len % ALIGN == 0 {
            self.queue.write_buffer(buffer, offset, data);
            return Ok(());
        }
        let (start, end) = aligned_window(offset, len);
        let mut window = vec![0u8; (end - start) as usize];
        self.read_bytes(buffer, start, &mut window)?;
        let at = (offset - start) as usize;
        window[at..at + data.len()].copy_from_slice(data);
        self.queue.write_buffer(buffer, start, &window);
        Ok(())
    }

    /// Blocking readback of `out.len()` bytes at `offset` via a staging copy.
    pub(super) fn read_bytes(&self, buffer: &wgpu::Buffer, offset: u64, out: &mut [u8]) -> Result<()> {
        let len = out.len() as u64;
        Self::check_range(buffer, offset, len)?;
        if len == 0 {
            return Ok(());
        }
        let (start, end) = aligned_window(offset, len);
        let staging = self.create_staging_buffer(end - start, "readback");
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("readback"),
            });
        encoder.copy_buffer_to_buffer(buffer, start, &staging, 0, end - start);
        self.queue.submit(std::iter::once(encoder.finish()));

        let mapped = self.map_staging(&staging)?;
        let at = (offset - start) as usize;
        out.copy_from_slice(&mapped[at..at + out.len()]);
        Ok(())
    }

    /// Map a staging buffer, wait, and copy its contents out.
    pub(super) fn map_staging(&self, staging: &wgpu::Buffer) -> Result<Vec<u8>> {
        let slice = staging.slice(..);
        let (sender, receiver) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        self.device.poll(wgpu::Maintain::Wait);
        receiver
            .recv()
            .map_err(|_| ContextError::Backend("GPU map callback: channel recv failed".into()))?
            .map_err(|e| ContextError::Backend(format!("GPU buffer mapping: {e}")))?;
        let data = slice.get_mapped_range();
        let bytes = data.to_vec();
        drop(data);
        staging.unmap();
        Ok(bytes)
    }

    pub(super) fn copy_range(
        &self,
        from: &wgpu::Buffer,
        from_offset: u64,
        to: &wgpu::Buffer,
        to_offset: u64,
        len: u64,
    ) -> Result<()> {
        Self::check_range(from, from_offset, len)?;
        Self::check_range(to, to_offset, len)?;
        if from_offset % ALIGN != 0 || to_offset % ALIGN != 0 || len % ALIGN != 0 {
            return Err(ContextError::IllegalArgument(format!(
                "device copies must be {ALIGN}-byte aligned (offsets {from_offset}, {to_offset}, length {len})"
            )));
        }
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("copy") });
        encoder.copy_buffer_to_buffer(from, from_offset, to, to_offset, len);
        self.queue.submit(std::iter::once(encoder.finish()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aligned_window_covers_range() {
        assert_eq!(aligned_window(0, 8), (0, 8));
        assert_eq!(aligned_window(5, 1), (4, 8));
        assert_eq!(aligned_window(3, 6), (0, 12));
        assert_eq!(aligned_window(12, 0), (12, 12));
    }
}
