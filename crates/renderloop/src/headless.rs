//! Headless backend that records every call instead of talking to a GPU.
//!
//! Used by the test suite and by the demo host when no adapter is wanted.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::backend::{
    check_rgba_len, BackendError, GraphicsBackend, ProgramHandle, TextureHandle, Viewport,
};
use crate::uniforms::{UniformDescriptor, UniformValue};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub compiles: u64,
    pub binds: u64,
    pub uniform_writes: u64,
    pub texture_binds: u64,
    pub clears: u64,
    pub draws: u64,
}

#[derive(Debug, Default)]
pub struct RecordingBackend {
    next_handle: u64,
    programs: HashSet<ProgramHandle>,
    textures: HashSet<TextureHandle>,
    active: Option<ProgramHandle>,
    uniforms: HashMap<(ProgramHandle, String), UniformValue>,
    bound_textures: BTreeMap<u32, TextureHandle>,
    viewport: Option<Viewport>,
    clear_color: [f32; 4],
    counts: CallCounts,
    fail_next_compile: Option<String>,
    texture_uploads_left: Option<usize>,
}

impl RecordingBackend {
    /// Always bindable; handed out as the fallback resource.
    pub const FALLBACK_TEXTURE: TextureHandle = TextureHandle(0);

    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `compile_program` call fail with `message`.
    pub fn fail_next_compile(&mut self, message: impl Into<String>) {
        self.fail_next_compile = Some(message.into());
    }

    /// Accepts `uploads` more `create_texture` calls, then fails them all.
    pub fn fail_texture_upload_after(&mut self, uploads: usize) {
        self.texture_uploads_left = Some(uploads);
    }

    pub fn counts(&self) -> CallCounts {
        self.counts
    }

    pub fn uniform_writes(&self) -> u64 {
        self.counts.uniform_writes
    }

    pub fn live_programs(&self) -> usize {
        self.programs.len()
    }

    pub fn live_textures(&self) -> usize {
        self.textures.len()
    }

    pub fn uniform_value(&self, program: ProgramHandle, name: &str) -> Option<&UniformValue> {
        self.uniforms.get(&(program, name.to_string()))
    }

    pub fn bound_texture(&self, unit: u32) -> Option<TextureHandle> {
        self.bound_textures.get(&unit).copied()
    }

    pub fn viewport(&self) -> Option<Viewport> {
        self.viewport
    }

    pub fn current_clear_color(&self) -> [f32; 4] {
        self.clear_color
    }
}

impl GraphicsBackend for RecordingBackend {
    fn compile_program(
        &mut self,
        label: &str,
        vertex_source: &str,
        fragment_source: &str,
    ) -> Result<ProgramHandle, BackendError> {
        self.counts.compiles += 1;
        if let Some(message) = self.fail_next_compile.take() {
            return Err(BackendError::Compile {
                label: label.to_string(),
                message,
            });
        }
        if vertex_source.trim().is_empty() || fragment_source.trim().is_empty() {
            return Err(BackendError::Compile {
                label: label.to_string(),
                message: "empty shader stage".into(),
            });
        }
        self.next_handle += 1;
        let handle = ProgramHandle(self.next_handle);
        self.programs.insert(handle);
        Ok(handle)
    }

    fn release_program(&mut self, program: ProgramHandle) {
        self.programs.remove(&program);
        self.uniforms.retain(|(owner, _), _| *owner != program);
        if self.active == Some(program) {
            self.active = None;
        }
    }

    fn bind_program(&mut self, program: Option<ProgramHandle>) -> Result<(), BackendError> {
        if let Some(handle) = program {
            if !self.programs.contains(&handle) {
                return Err(BackendError::UnknownProgram(handle));
            }
        }
        self.counts.binds += 1;
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
        if !self.programs.contains(&program) {
            return Err(BackendError::UnknownProgram(program));
        }
        self.counts.uniform_writes += 1;
        self.uniforms
            .insert((program, slot.name.clone()), value.clone());
        Ok(())
    }

    fn create_texture(
        &mut self,
        label: &str,
        width: u32,
        height: u32,
        rgba: &[u8],
    ) -> Result<TextureHandle, BackendError> {
        check_rgba_len(label, width, height, rgba)?;
        if let Some(left) = self.texture_uploads_left.as_mut() {
            if *left == 0 {
                return Err(BackendError::Device(format!(
                    "texture '{label}' rejected: upload budget exhausted"
                )));
            }
            *left -= 1;
        }
        self.next_handle += 1;
        let handle = TextureHandle(self.next_handle);
        self.textures.insert(handle);
        Ok(handle)
    }

    fn release_texture(&mut self, texture: TextureHandle) {
        if texture == Self::FALLBACK_TEXTURE {
            return;
        }
        self.textures.remove(&texture);
        self.bound_textures.retain(|_, bound| *bound != texture);
    }

    fn fallback_texture(&self) -> TextureHandle {
        Self::FALLBACK_TEXTURE
    }

    fn bind_texture(&mut self, texture: TextureHandle, unit: u32) -> Result<(), BackendError> {
        if texture != Self::FALLBACK_TEXTURE && !self.textures.contains(&texture) {
            return Err(BackendError::UnknownTexture(texture));
        }
        self.counts.texture_binds += 1;
        self.bound_textures.insert(unit, texture);
        Ok(())
    }

    fn set_viewport(&mut self, viewport: Viewport) {
        self.viewport = Some(viewport);
    }

    fn clear_color(&mut self, rgba: [f32; 4]) {
        self.clear_color = rgba;
    }

    fn clear(&mut self) -> Result<(), BackendError> {
        self.counts.clears += 1;
        Ok(())
    }

    fn draw(&mut self, vertex_count: u32) -> Result<(), BackendError> {
        if self.active.is_none() {
            return Err(BackendError::Device(format!(
                "draw of {vertex_count} vertices without an active program"
            )));
        }
        self.counts.draws += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ResourceRegistry;

    #[test]
    fn release_clears_active_program_and_uniforms() {
        let mut backend = RecordingBackend::new();
        let handle = backend.compile_program("a", "vs", "fs").unwrap();
        backend.bind_program(Some(handle)).unwrap();
        backend.release_program(handle);
        assert_eq!(backend.active_program(), None);
        assert!(backend.bind_program(Some(handle)).is_err());
    }

    #[test]
    fn injected_compile_failure_is_one_shot() {
        let mut backend = RecordingBackend::new();
        backend.fail_next_compile("syntax error");
        assert!(backend.compile_program("a", "vs", "fs").is_err());
        assert!(backend.compile_program("a", "vs", "fs").is_ok());
        assert_eq!(backend.counts().compiles, 2);
    }

    #[test]
    fn draw_requires_program() {
        let mut backend = RecordingBackend::new();
        assert!(backend.draw(3).is_err());
    }

    #[test]
    fn texture_upload_checks_pixel_count() {
        let mut backend = RecordingBackend::new();
        assert!(backend.create_texture("short", 2, 2, &[0; 12]).is_err());
        let texture = backend.create_texture("ok", 2, 2, &[0; 16]).unwrap();
        backend.bind_texture(texture, 1).unwrap();
        backend.release_texture(texture);
        assert_eq!(backend.bound_texture(1), None);
        assert!(backend.bind_texture(texture, 1).is_err());
    }

    #[test]
    fn fallback_texture_is_always_bindable() {
        let mut backend = RecordingBackend::new();
        let fallback = backend.fallback_resource();
        backend.bind_texture(fallback, 0).unwrap();
        assert_eq!(backend.bound_texture(0), Some(fallback));
        assert!(backend.bind_texture(TextureHandle(42), 0).is_err());
    }
}
