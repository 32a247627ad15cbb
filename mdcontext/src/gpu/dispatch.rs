// SPDX-License-Identifier: AGPL-3.0-only

//! Shader compilation and kernel dispatch.
//!
//! ```text
//! compile()          → ShaderModule   (validated under an error scope)
//! create_pipeline()  → ComputePipeline (auto layout, one entry point)
//! encode_dispatch()  → bind group + one compute pass + submit
//! ```
//!
//! Buffer arguments bind at 0..n in argument order; scalar arguments are
//! packed into one uniform block at binding n.

use super::{GpuState, WgpuBackend};
use crate::backend::{pack_scalars, DispatchTiming, KernelArg};
use crate::error::{ContextError, Result};
use crate::program;
use std::num::NonZeroU64;
use wgpu::util::DeviceExt;

/// Split workgroup count into (x, y, 1) for 2D dispatch when x > 65535.
/// Shaders must linearize via `gid.x + gid.y * num_workgroups.x * WG_SIZE`.
#[must_use]
pub const fn split_workgroups(total: u32) -> (u32, u32, u32) {
    if total <= 65535 {
        (total, 1, 1)
    } else {
        let y = total.div_ceil(65535);
        let x = total.div_ceil(y);
        (x, y, 1)
    }
}

impl WgpuBackend {
    /// Preprocess and validate a composed source.
    pub(super) fn compile(&self, source: &str) -> Result<wgpu::ShaderModule> {
        let (wgsl, _) = program::preprocess(source)?;
        let (module, err) = self.scoped(|| {
            self.device
                .create_shader_module(wgpu::ShaderModuleDescriptor {
                    label: Some("mdcontext program"),
                    source: wgpu::ShaderSource::Wgsl(wgsl.as_str().into()),
                })
        });
        if let Some(e) = err {
            log::warn!("kernel compilation failed: {e}");
            return Err(ContextError::Compile { log: e.to_string() });
        }
        Ok(module)
    }

    pub(super) fn create_pipeline(&self, module: &wgpu::ShaderModule, name: &str) -> Result<wgpu::ComputePipeline> {
        let (pipeline, err) = self.scoped(|| {
            self.device
                .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                    label: Some(name),
                    layout: None,
                    module,
                    entry_point: name,
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                    cache: None,
                })
        });
        match err {
            Some(e) => Err(ContextError::InvalidState(format!(
                "No kernel named {name} in program: {e}"
            ))),
            None => Ok(pipeline),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub(super) fn encode_dispatch(
        &self,
        state: &GpuState,
        pipeline: &wgpu::ComputePipeline,
        name: &str,
        args: &[KernelArg],
        global_size: u32,
        block_size: u32,
        timed: bool,
    ) -> Result<Option<DispatchTiming>> {
        let fail = |message: String| ContextError::Dispatch {
            kernel: name.to_string(),
            message,
        };
        if block_size == 0 || global_size % block_size != 0 {
            return Err(fail(format!(
                "global size {global_size} is not a multiple of block size {block_size}"
            )));
        }

        let scalars = pack_scalars(args);
        let uniform = (!scalars.is_empty()).then(|| {
            self.device
                .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some("kernel scalars"),
                    contents: &scalars,
                    usage: wgpu::BufferUsages::UNIFORM,
                })
        });

        let mut entries = Vec::with_capacity(args.len() + 1);
        for arg in args {
            if let KernelArg::Buffer(b) = arg {
                let buffer = state.buffer(b.allocation)?;
                entries.push(wgpu::BindGroupEntry {
                    binding: entries.len() as u32,
                    resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                        buffer,
                        offset: b.offset,
                        size: NonZeroU64::new(b.size),
                    }),
                });
            }
        }
        if let Some(u) = &uniform {
            entries.push(wgpu::BindGroupEntry {
                binding: entries.len() as u32,
                resource: u.as_entire_binding(),
            });
        }

        let timestamps = (timed && self.info.supports_timestamps).then(|| {
            self.device.create_query_set(&wgpu::QuerySetDescriptor {
                label: Some("kernel timing"),
                ty: wgpu::QueryType::Timestamp,
                count: 2,
            })
        });

        let ((), err) = self.scoped(|| {
            let layout = pipeline.get_bind_group_layout(0);
            let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some(name),
                layout: &layout,
                entries: &entries,
            });
            let mut encoder = self
                .device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some(name) });
            {
                let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                    label: Some(name),
                    timestamp_writes: timestamps.as_ref().map(|qs| wgpu::ComputePassTimestampWrites {
                        query_set: qs,
                        beginning_of_pass_write_index: Some(0),
                        end_of_pass_write_index: Some(1),
                    }),
                });
                pass.set_pipeline(pipeline);
                pass.set_bind_group(0, &bind_group, &[]);
                let (wx, wy, wz) = split_workgroups(global_size / block_size);
                pass.dispatch_workgroups(wx, wy, wz);
            }
            self.queue.submit(std::iter::once(encoder.finish()));
        });
        if let Some(e) = err {
            return Err(fail(e.to_string()));
        }

        if !timed {
            return Ok(None);
        }
        match timestamps {
            Some(query_set) => self.resolve_timestamps(&query_set).map(Some),
            None => {
                let start_ns = self.now_ns();
                self.device.poll(wgpu::Maintain::Wait);
                Ok(Some(DispatchTiming {
                    start_ns,
                    end_ns: self.now_ns(),
                }))
            }
        }
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
    fn resolve_timestamps(&self, query_set: &wgpu::QuerySet) -> Result<DispatchTiming> {
        let resolve = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("timestamp resolve"),
            size: 16,
            usage: wgpu::BufferUsages::QUERY_RESOLVE | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("timestamp readback"),
            size: 16,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("timestamp resolve"),
            });
        encoder.resolve_query_set(query_set, 0..2, &resolve, 0);
        encoder.copy_buffer_to_buffer(&resolve, 0, &staging, 0, 16);
        self.queue.submit(std::iter::once(encoder.finish()));

        let bytes = self.map_staging(&staging)?;
        let ticks: Vec<u64> = bytemuck::pod_collect_to_vec(&bytes);
        let period = f64::from(self.queue.get_timestamp_period());
        let to_ns = |t: u64| (t as f64 * period) as u64;
        Ok(DispatchTiming {
            start_ns: to_ns(ticks[0]),
            end_ns: to_ns(ticks[1]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_grids_stay_one_dimensional() {
        assert_eq!(split_workgroups(1), (1, 1, 1));
        assert_eq!(split_workgroups(65535), (65535, 1, 1));
    }

    #[test]
    fn large_grids_split_and_cover() {
        for total in [65536u32, 100_000, 1_000_000, 16_777_216] {
            let (x, y, z) = split_workgroups(total);
            assert!(x <= 65535 && y <= 65535);
            assert_eq!(z, 1);
            assert!(x * y >= total);
        }
    }
}
