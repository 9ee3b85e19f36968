//! Offscreen wgpu implementation of [`GraphicsBackend`].
//!
//! - `context` requests a headless adapter/device and owns the render target.
//! - `pipeline` turns WGSL `vs_main`/`fs_main` pairs into render pipelines
//!   with one uniform buffer each (bind group 0) and uploads textures with a
//!   sampler (bind group 1).
//!
//! Every `clear` and `draw` is encoded into its own pass and submitted right
//! away. Only texture unit 0 exists. Pixels can be read back with
//! [`WgpuBackend::read_pixels`].

mod context;
mod pipeline;

use std::collections::HashMap;

use crate::backend::{BackendError, GraphicsBackend, ProgramHandle, TextureHandle, Viewport};
use crate::uniforms::{UniformDescriptor, UniformValue};

pub use context::{GpuOptions, GpuPower};
pub use pipeline::UNIFORM_BLOCK_BYTES;

use context::{GpuContext, RenderTarget};
use pipeline::{GpuProgram, GpuTexture, PipelineLayouts};

const FALLBACK_PIXEL: [u8; 4] = [255, 0, 255, 255];

fn check_uniform_range(slot: &UniformDescriptor) -> Result<(), BackendError> {
    match slot.offset.checked_add(slot.size_bytes()) {
        Some(end) if end <= UNIFORM_BLOCK_BYTES => Ok(()),
        _ => Err(BackendError::UniformOutOfRange {
            name: slot.name.clone(),
        }),
    }
}

fn check_texture_unit(unit: u32) -> Result<(), BackendError> {
    if unit == 0 {
        Ok(())
    } else {
        Err(BackendError::Device(format!(
            "texture unit {unit} is not available; only unit 0 exists"
        )))
    }
}

/// Target size needed to hold `viewport`, never shrinking and capped at the
/// device limit.
fn grown_extent(viewport: Viewport, current: (u32, u32), max_dimension: u32) -> (u32, u32) {
    let width = viewport.x.saturating_add(viewport.width).min(max_dimension);
    let height = viewport.y.saturating_add(viewport.height).min(max_dimension);
    (width.max(current.0), height.max(current.1))
}

pub struct WgpuBackend {
    context: GpuContext,
    layouts: PipelineLayouts,
    target: RenderTarget,
    programs: HashMap<ProgramHandle, GpuProgram>,
    textures: HashMap<TextureHandle, GpuTexture>,
    next_handle: u64,
    active: Option<ProgramHandle>,
    bound_texture: Option<TextureHandle>,
    fallback_texture: TextureHandle,
    viewport: Viewport,
    clear_color: wgpu::Color,
}

impl WgpuBackend {
    pub fn new(options: GpuOptions) -> Result<Self, BackendError> {
        let context = GpuContext::new_headless(&options)?;
        let layouts = PipelineLayouts::new(&context.device);
        let target = RenderTarget::new(&context.device, options.width, options.height);
        let viewport = Viewport::new(target.width, target.height);
        let mut backend = Self {
            context,
            layouts,
            target,
            programs: HashMap::new(),
            textures: HashMap::new(),
            next_handle: 0,
            active: None,
            bound_texture: None,
            fallback_texture: TextureHandle(0),
            viewport,
            clear_color: wgpu::Color::BLACK,
        };
        backend.fallback_texture =
            backend.create_texture("fallback texture", 1, 1, &FALLBACK_PIXEL)?;
        tracing::info!(
            adapter = %backend.context.adapter_name,
            width = backend.target.width,
            height = backend.target.height,
            "initialised offscreen wgpu backend"
        );
        Ok(backend)
    }

    pub fn adapter_name(&self) -> &str {
        &self.context.adapter_name
    }

    pub fn target_size(&self) -> (u32, u32) {
        (self.target.width, self.target.height)
    }

    /// Copies the render target back as tightly packed RGBA8 rows.
    pub fn read_pixels(&self) -> Result<Vec<u8>, BackendError> {
        let device = &self.context.device;
        let width = self.target.width;
        let height = self.target.height;
        let unpadded_row = width * 4;
        let align = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
        let padded_row = unpadded_row.div_ceil(align) * align;

        let buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("readback buffer"),
            size: u64::from(padded_row) * u64::from(height),
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });
        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("readback encoder"),
        });
        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture: &self.target.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &buffer,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(padded_row),
                    rows_per_image: Some(height),
                },
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
        self.context.queue.submit(Some(encoder.finish()));

        let slice = buffer.slice(..);
        let (tx, rx) = crossbeam_channel::bounded(1);
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        device
            .poll(wgpu::PollType::Wait)
            .map_err(|err| BackendError::Device(format!("device poll failed: {err}")))?;
        rx.recv()
            .map_err(|_| BackendError::Device("readback callback never ran".into()))?
            .map_err(|err| BackendError::Device(format!("failed to map readback buffer: {err}")))?;

        let mapped = slice.get_mapped_range();
        let mut pixels = Vec::with_capacity((unpadded_row * height) as usize);
        for row in mapped.chunks(padded_row as usize) {
            pixels.extend_from_slice(&row[..unpadded_row as usize]);
        }
        drop(mapped);
        buffer.unmap();
        Ok(pixels)
    }

    fn next_id(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn submit_pass(&self, load: wgpu::LoadOp<wgpu::Color>, draw: Option<(ProgramHandle, u32)>) {
        let device = &self.context.device;
        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("renderloop encoder"),
        });
        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("renderloop pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &self.target.view,
                    depth_slice: None,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load,
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                occlusion_query_set: None,
                timestamp_writes: None,
            });
            if let Some((handle, vertex_count)) = draw {
                let texture = self
                    .bound_texture
                    .and_then(|texture| self.textures.get(&texture))
                    .or_else(|| self.textures.get(&self.fallback_texture));
                if let (Some(program), Some(texture)) = (self.programs.get(&handle), texture) {
                    let viewport = self.viewport;
                    pass.set_viewport(
                        viewport.x as f32,
                        viewport.y as f32,
                        viewport.width as f32,
                        viewport.height as f32,
                        0.0,
                        1.0,
                    );
                    pass.set_pipeline(&program.pipeline);
                    pass.set_bind_group(0, &program.uniform_bind_group, &[]);
                    pass.set_bind_group(1, &texture.bind_group, &[]);
                    pass.draw(0..vertex_count, 0..1);
                }
            }
        }
        self.context.queue.submit(Some(encoder.finish()));
    }
}

impl GraphicsBackend for WgpuBackend {
    fn compile_program(
        &mut self,
        label: &str,
        vertex_source: &str,
        fragment_source: &str,
    ) -> Result<ProgramHandle, BackendError> {
        let program = GpuProgram::compile(
            &self.context.device,
            &self.layouts,
            label,
            vertex_source,
            fragment_source,
        )?;
        let handle = ProgramHandle(self.next_id());
        self.programs.insert(handle, program);
        tracing::debug!(%handle, label, "compiled wgpu program");
        Ok(handle)
    }

    fn release_program(&mut self, program: ProgramHandle) {
        self.programs.remove(&program);
        if self.active == Some(program) {
            self.active = None;
        }
    }

    fn bind_program(&mut self, program: Option<ProgramHandle>) -> Result<(), BackendError> {
        if let Some(handle) = program {
            if !self.programs.contains_key(&handle) {
                return Err(BackendError::UnknownProgram(handle));
            }
        }
        self.active = program;
        Ok(())
    }

    fn active_program(&self) -> Option<ProgramHandle> {
        self.active
    }

    fn set_uniform(
        &mut self,
        program: ProgramHandle,
        slot: &UniformDescriptor,
        value: &UniformValue,
    ) -> Result<(), BackendError> {
        let target = self
            .programs
            .get(&program)
            .ok_or(BackendError::UnknownProgram(program))?;
        check_uniform_range(slot)?;
        self.context
            .queue
            .write_buffer(&target.uniform_buffer, slot.offset, &value.to_bytes());
        Ok(())
    }

    fn create_texture(
        &mut self,
        label: &str,
        width: u32,
        height: u32,
        rgba: &[u8],
    ) -> Result<TextureHandle, BackendError> {
        let texture = GpuTexture::from_rgba(
            &self.context.device,
            &self.context.queue,
            &self.layouts,
            label,
            width,
            height,
            rgba,
        )?;
        let handle = TextureHandle(self.next_id());
        self.textures.insert(handle, texture);
        Ok(handle)
    }

    fn release_texture(&mut self, texture: TextureHandle) {
        if texture == self.fallback_texture {
            return;
        }
        self.textures.remove(&texture);
        if self.bound_texture == Some(texture) {
            self.bound_texture = None;
        }
    }

    fn fallback_texture(&self) -> TextureHandle {
        self.fallback_texture
    }

    fn bind_texture(&mut self, texture: TextureHandle, unit: u32) -> Result<(), BackendError> {
        check_texture_unit(unit)?;
        if !self.textures.contains_key(&texture) {
            return Err(BackendError::UnknownTexture(texture));
        }
        self.bound_texture = Some(texture);
        Ok(())
    }

    fn set_viewport(&mut self, viewport: Viewport) {
        let current = (self.target.width, self.target.height);
        let (width, height) = grown_extent(viewport, current, self.context.max_dimension);
        if (width, height) != current {
            self.target = RenderTarget::new(&self.context.device, width, height);
        }
        self.viewport = Viewport {
            x: viewport.x.min(self.target.width - 1),
            y: viewport.y.min(self.target.height - 1),
            width: viewport.width.clamp(1, self.target.width),
            height: viewport.height.clamp(1, self.target.height),
        };
    }

    fn clear_color(&mut self, rgba: [f32; 4]) {
        self.clear_color = wgpu::Color {
            r: f64::from(rgba[0]),
            g: f64::from(rgba[1]),
            b: f64::from(rgba[2]),
            a: f64::from(rgba[3]),
        };
    }

    fn clear(&mut self) -> Result<(), BackendError> {
        self.submit_pass(wgpu::LoadOp::Clear(self.clear_color), None);
        Ok(())
    }

    fn draw(&mut self, vertex_count: u32) -> Result<(), BackendError> {
        let handle = self.active.ok_or_else(|| {
            BackendError::Device(format!(
                "draw of {vertex_count} vertices without an active program"
            ))
        })?;
        self.submit_pass(wgpu::LoadOp::Load, Some((handle, vertex_count)));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uniforms::{UniformKind, UniformValue};

    fn slot(offset: u64, count: usize) -> UniformDescriptor {
        UniformDescriptor {
            name: "tint".into(),
            kind: UniformKind::FloatVec,
            count,
            offset,
        }
    }

    const FLAT_VERTEX: &str = r#"
@vertex
fn vs_main(@builtin(vertex_index) index: u32) -> @builtin(position) vec4<f32> {
    return vec4<f32>(f32(index), 0.0, 0.0, 1.0);
}
"#;

    const FLAT_FRAGMENT: &str = r#"
@fragment
fn fs_main() -> @location(0) vec4<f32> {
    return vec4<f32>(1.0);
}
"#;

    /// Software adapter when one exists; CI machines without any adapter skip.
    fn backend() -> Option<WgpuBackend> {
        let options = GpuOptions {
            width: 8,
            height: 4,
            force_fallback_adapter: true,
            ..GpuOptions::default()
        };
        match WgpuBackend::new(options) {
            Ok(backend) => Some(backend),
            Err(err) => {
                eprintln!("skipping wgpu test: {err}");
                None
            }
        }
    }

    #[test]
    fn uniform_block_bound() {
        assert!(check_uniform_range(&slot(1008, 4)).is_ok());
        assert!(matches!(
            check_uniform_range(&slot(1016, 4)),
            Err(BackendError::UniformOutOfRange { name }) if name == "tint"
        ));
        assert!(check_uniform_range(&slot(u64::MAX, 4)).is_err());
    }

    #[test]
    fn only_texture_unit_zero_exists() {
        assert!(check_texture_unit(0).is_ok());
        assert!(matches!(check_texture_unit(1), Err(BackendError::Device(_))));
    }

    #[test]
    fn viewport_growth_saturates() {
        let huge = Viewport {
            x: u32::MAX,
            y: 10,
            width: 10,
            height: u32::MAX,
        };
        assert_eq!(grown_extent(huge, (64, 64), 4096), (4096, 4096));
        assert_eq!(grown_extent(Viewport::new(32, 16), (64, 64), 4096), (64, 64));
        assert_eq!(grown_extent(Viewport::new(100, 16), (64, 64), 4096), (100, 64));
    }

    #[test]
    fn offscreen_clear_and_fallback_texture() {
        let Some(mut backend) = backend() else {
            return;
        };
        assert_eq!(backend.target_size(), (8, 4));

        let fallback = backend.fallback_texture();
        backend.bind_texture(fallback, 0).unwrap();
        assert!(backend.bind_texture(fallback, 1).is_err());
        backend.release_texture(fallback);
        backend.bind_texture(fallback, 0).unwrap();
        assert!(backend.create_texture("short", 2, 2, &[0; 4]).is_err());

        backend.clear_color([1.0, 0.0, 0.0, 1.0]);
        backend.clear().unwrap();
        let pixels = backend.read_pixels().unwrap();
        assert_eq!(pixels.len(), 8 * 4 * 4);
        assert!(pixels.chunks_exact(4).all(|pixel| pixel == [255, 0, 0, 255]));
    }

    #[test]
    fn oversized_uniform_is_rejected_by_the_device_backend() {
        let Some(mut backend) = backend() else {
            return;
        };
        let program = backend
            .compile_program("flat", FLAT_VERTEX, FLAT_FRAGMENT)
            .unwrap();
        let value = UniformValue::Float(vec![1.0; 4]);
        backend.set_uniform(program, &slot(0, 4), &value).unwrap();
        assert!(matches!(
            backend.set_uniform(program, &slot(1020, 4), &value),
            Err(BackendError::UniformOutOfRange { .. })
        ));
    }
}
