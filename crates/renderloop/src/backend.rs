//! Narrow interfaces to the collaborators the render loop drives.
//!
//! The core never talks to a graphics API directly. Everything it needs from
//! the GPU goes through [`GraphicsBackend`], and placeholder resources come
//! from a [`ResourceRegistry`]. Both are synchronous: a call either completes
//! within the frame or reports a [`BackendError`].

use std::fmt;

use crate::uniforms::{UniformDescriptor, UniformValue};

/// Opaque handle to a linked GPU program, owned by one `ShaderProgram`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProgramHandle(pub u64);

impl fmt::Display for ProgramHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "program#{}", self.0)
    }
}

/// Opaque handle to a GPU texture.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TextureHandle(pub u64);

impl fmt::Display for TextureHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "texture#{}", self.0)
    }
}

/// Pixel rectangle used by [`GraphicsBackend::set_viewport`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Viewport {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Viewport {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            x: 0,
            y: 0,
            width,
            height,
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BackendError {
    #[error("failed to compile program '{label}': {message}")]
    Compile { label: String, message: String },
    #[error("unknown program handle {0}")]
    UnknownProgram(ProgramHandle),
    #[error("unknown texture handle {0}")]
    UnknownTexture(TextureHandle),
    #[error("uniform '{name}' does not fit the program's uniform block")]
    UniformOutOfRange { name: String },
    #[error("graphics device error: {0}")]
    Device(String),
}

/// Synchronous graphics API used by shader programs and render routines.
pub trait GraphicsBackend {
    /// Compiles and links a vertex/fragment pair.
    fn compile_program(
        &mut self,
        label: &str,
        vertex_source: &str,
        fragment_source: &str,
    ) -> Result<ProgramHandle, BackendError>;

    fn release_program(&mut self, program: ProgramHandle);

    /// Makes `program` current, or unbinds everything for `None`.
    fn bind_program(&mut self, program: Option<ProgramHandle>) -> Result<(), BackendError>;

    fn active_program(&self) -> Option<ProgramHandle>;

    /// Writes one uniform value. Callers are expected to skip redundant writes.
    fn set_uniform(
        &mut self,
        program: ProgramHandle,
        slot: &UniformDescriptor,
        value: &UniformValue,
    ) -> Result<(), BackendError>;

    /// Uploads a tightly packed RGBA8 image.
    fn create_texture(
        &mut self,
        label: &str,
        width: u32,
        height: u32,
        rgba: &[u8],
    ) -> Result<TextureHandle, BackendError>;

    /// Releasing the fallback texture is a no-op.
    fn release_texture(&mut self, texture: TextureHandle);

    /// Always-bindable placeholder texture.
    fn fallback_texture(&self) -> TextureHandle;

    fn bind_texture(&mut self, texture: TextureHandle, unit: u32) -> Result<(), BackendError>;

    fn set_viewport(&mut self, viewport: Viewport);

    fn clear_color(&mut self, rgba: [f32; 4]);

    fn clear(&mut self) -> Result<(), BackendError>;

    /// Draws `vertex_count` vertices with the active program and textures.
    fn draw(&mut self, vertex_count: u32) -> Result<(), BackendError>;
}

/// Provider of placeholder resources substituted for missing entries.
pub trait ResourceRegistry {
    type Resource: Clone;

    /// Must always succeed.
    fn fallback_resource(&self) -> Self::Resource;
}

impl<B: GraphicsBackend + ?Sized> ResourceRegistry for B {
    type Resource = TextureHandle;

    fn fallback_resource(&self) -> TextureHandle {
        self.fallback_texture()
    }
}

pub(crate) fn check_rgba_len(
    label: &str,
    width: u32,
    height: u32,
    rgba: &[u8],
) -> Result<(), BackendError> {
    let expected = width as usize * height as usize * 4;
    if width == 0 || height == 0 || rgba.len() != expected {
        return Err(BackendError::Device(format!(
            "texture '{label}' is {width}x{height} but {} bytes were supplied (expected {expected})",
            rgba.len()
        )));
    }
    Ok(())
}
