//! Shader programs and the uniform slots they own.
//!
//! A [`ShaderProgram`] pairs a [`ShaderSource`] with the backend handle it
//! compiles into. Uniform slots only exist while the program is compiled:
//! a successful `compile` registers every declared uniform at once, a failed
//! one registers nothing. Binding goes through [`ActiveProgram`], a guard
//! that restores whatever program was current before it, however the scope
//! is left.

use std::collections::HashMap;
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, warn};

use crate::backend::{GraphicsBackend, ProgramHandle, TextureHandle};
use crate::error::{RenderError, Result};
use crate::remote::{RemoteUpdate, UniformRemote};
use crate::uniforms::{UniformDescriptor, UniformKind, UniformSlot, UniformValue};

/// A uniform the program declares up front.
#[derive(Clone, Debug, PartialEq)]
pub struct UniformDeclaration {
    pub name: String,
    pub kind: UniformKind,
    pub count: usize,
    pub default: UniformValue,
}

impl UniformDeclaration {
    pub fn new(
        name: impl Into<String>,
        kind: UniformKind,
        count: usize,
        default: UniformValue,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            count,
            default,
        }
    }

    pub fn floats(name: impl Into<String>, default: &[f32]) -> Self {
        Self::new(
            name,
            UniformKind::FloatVec,
            default.len(),
            UniformValue::Float(default.to_vec()),
        )
    }

    pub fn ints(name: impl Into<String>, default: &[i32]) -> Self {
        Self::new(
            name,
            UniformKind::IntVec,
            default.len(),
            UniformValue::Int(default.to_vec()),
        )
    }

    /// Square matrix initialised to identity.
    pub fn matrix(name: impl Into<String>, size: usize) -> Self {
        Self::new(
            name,
            UniformKind::Matrix,
            size * size,
            UniformValue::identity(size),
        )
    }
}

#[derive(Clone, Debug, Default)]
pub struct ShaderSource {
    pub vertex: String,
    pub fragment: String,
    pub uniforms: Vec<UniformDeclaration>,
}

impl ShaderSource {
    pub fn new(vertex: impl Into<String>, fragment: impl Into<String>) -> Self {
        Self {
            vertex: vertex.into(),
            fragment: fragment.into(),
            uniforms: Vec::new(),
        }
    }

    pub fn with_uniform(mut self, declaration: UniformDeclaration) -> Self {
        self.uniforms.push(declaration);
        self
    }
}

pub struct ShaderProgram {
    name: String,
    source: ShaderSource,
    handle: Option<ProgramHandle>,
    uniforms: HashMap<String, UniformSlot>,
    next_offset: u64,
    last_error: Option<RenderError>,
    remote_tx: Sender<RemoteUpdate>,
    remote_rx: Receiver<RemoteUpdate>,
}

impl ShaderProgram {
    pub fn new(name: impl Into<String>, source: ShaderSource) -> Self {
        let (remote_tx, remote_rx) = crossbeam_channel::unbounded();
        Self {
            name: name.into(),
            source,
            handle: None,
            uniforms: HashMap::new(),
            next_offset: 0,
            last_error: None,
            remote_tx,
            remote_rx,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source(&self) -> &ShaderSource {
        &self.source
    }

    pub fn handle(&self) -> Option<ProgramHandle> {
        self.handle
    }

    pub fn is_compiled(&self) -> bool {
        self.handle.is_some()
    }

    /// Error from the most recent failed `compile`.
    pub fn last_error(&self) -> Option<&RenderError> {
        self.last_error.as_ref()
    }

    /// Compiles and links the program, then registers its declared uniforms.
    ///
    /// Returns `false` on any failure; the program is then uncompiled and has
    /// no uniform slots. Recompiling releases the previous handle first.
    pub fn compile(&mut self, backend: &mut dyn GraphicsBackend) -> bool {
        self.teardown(backend);
        match self.try_compile(backend) {
            Ok(()) => {
                self.last_error = None;
                debug!(
                    program = %self.name,
                    uniforms = self.uniforms.len(),
                    "compiled shader program"
                );
                true
            }
            Err(err) => {
                warn!(program = %self.name, error = %err, "shader program failed to compile");
                self.last_error = Some(err);
                false
            }
        }
    }

    fn try_compile(&mut self, backend: &mut dyn GraphicsBackend) -> Result<()> {
        let (slots, next_offset) = layout_declarations(&self.source.uniforms)?;
        let handle =
            backend.compile_program(&self.name, &self.source.vertex, &self.source.fragment)?;
        self.handle = Some(handle);
        self.uniforms = slots;
        self.next_offset = next_offset;
        Ok(())
    }

    fn teardown(&mut self, backend: &mut dyn GraphicsBackend) {
        if let Some(handle) = self.handle.take() {
            backend.release_program(handle);
        }
        self.uniforms.clear();
        self.next_offset = 0;
    }

    /// Releases the GPU program and drops every uniform slot.
    pub fn destroy(&mut self, backend: &mut dyn GraphicsBackend) {
        self.teardown(backend);
    }

    fn require_compiled(&self) -> Result<ProgramHandle> {
        self.handle.ok_or_else(|| RenderError::NotCompiled {
            program: self.name.clone(),
        })
    }

    /// Returns the slot registered under `name`, creating it from `default`
    /// when absent.
    ///
    /// With `strict`, an existing slot of a different kind is an error;
    /// without it the slot is replaced.
    pub fn get_or_create_uniform(
        &mut self,
        name: &str,
        kind: UniformKind,
        default: UniformValue,
        strict: bool,
    ) -> Result<&mut UniformSlot> {
        self.require_compiled()?;
        match self.uniforms.get(name).map(UniformSlot::kind) {
            Some(existing) if existing == kind => {}
            Some(existing) if strict => {
                return Err(RenderError::TypeMismatch {
                    name: name.to_string(),
                    declared: existing,
                    requested: kind,
                });
            }
            _ => {
                let descriptor = UniformDescriptor {
                    name: name.to_string(),
                    kind,
                    count: default.len(),
                    offset: self.next_offset,
                };
                let slot = UniformSlot::new(descriptor, default)?;
                self.next_offset = slot.descriptor().end_aligned();
                self.uniforms.insert(name.to_string(), slot);
            }
        }
        self.uniform_mut(name)
    }

    pub fn uniform(&self, name: &str) -> Result<&UniformSlot> {
        self.require_compiled()?;
        self.uniforms
            .get(name)
            .ok_or_else(|| self.unknown_uniform(name))
    }

    pub fn uniform_mut(&mut self, name: &str) -> Result<&mut UniformSlot> {
        self.require_compiled()?;
        let program = &self.name;
        self.uniforms
            .get_mut(name)
            .ok_or_else(|| RenderError::UnknownUniform {
                program: program.clone(),
                name: name.to_string(),
            })
    }

    fn unknown_uniform(&self, name: &str) -> RenderError {
        RenderError::UnknownUniform {
            program: self.name.clone(),
            name: name.to_string(),
        }
    }

    pub fn uniform_count(&self) -> usize {
        self.uniforms.len()
    }

    /// Size in bytes of the uniform block implied by the registered slots.
    pub fn uniform_block_size(&self) -> u64 {
        self.next_offset
    }

    /// Stores a pending value; it reaches the GPU on the next flush.
    pub fn set_uniform(&mut self, name: &str, value: UniformValue) -> Result<()> {
        self.uniform_mut(name)?.set_cached_value(value)
    }

    /// Caches and uploads a value, skipping the write when it is unchanged.
    pub fn upload(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        name: &str,
        value: UniformValue,
    ) -> Result<bool> {
        let handle = self.require_compiled()?;
        self.uniform_mut(name)?.upload_value(backend, handle, value)
    }

    /// Applies queued remote updates, then uploads every dirty slot.
    /// Returns the number of backend writes.
    pub fn flush_uniforms(&mut self, backend: &mut dyn GraphicsBackend) -> Result<usize> {
        let handle = self.require_compiled()?;
        self.apply_remote();
        let mut writes = 0;
        for slot in self.uniforms.values_mut() {
            if slot.flush(backend, handle)? {
                writes += 1;
            }
        }
        Ok(writes)
    }

    /// Returns a handle other threads can use to queue uniform values.
    pub fn remote(&self) -> Result<UniformRemote> {
        self.require_compiled()?;
        let layout = self
            .uniforms
            .iter()
            .map(|(name, slot)| (name.clone(), slot.descriptor().clone()))
            .collect();
        Ok(UniformRemote::new(
            self.name.clone(),
            Arc::new(layout),
            self.remote_tx.clone(),
        ))
    }

    /// Moves queued remote values into their slots' cached values.
    pub fn apply_remote(&mut self) -> usize {
        let mut applied = 0;
        for update in self.remote_rx.try_iter() {
            let Some(slot) = self.uniforms.get_mut(&update.name) else {
                warn!(
                    program = %self.name,
                    uniform = %update.name,
                    "dropping queued value for unknown uniform"
                );
                continue;
            };
            match slot.set_cached_value(update.value) {
                Ok(()) => applied += 1,
                Err(err) => warn!(program = %self.name, error = %err, "dropping queued value"),
            }
        }
        applied
    }

    /// Binds the program until the returned guard is dropped.
    pub fn bind<'a>(
        &'a mut self,
        backend: &'a mut dyn GraphicsBackend,
    ) -> Result<ActiveProgram<'a>> {
        let handle = self.require_compiled()?;
        let previous = backend.active_program();
        backend.bind_program(Some(handle))?;
        Ok(ActiveProgram {
            program: self,
            backend,
            handle,
            previous,
        })
    }

    /// Runs `f` with the program bound, restoring the previous program after.
    pub fn with_program<T, E>(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        f: impl FnOnce(&mut ActiveProgram<'_>) -> std::result::Result<T, E>,
    ) -> std::result::Result<T, E>
    where
        E: From<RenderError>,
    {
        let mut active = self.bind(backend)?;
        f(&mut active)
    }
}

impl Drop for ShaderProgram {
    fn drop(&mut self) {
        if let Some(handle) = self.handle {
            debug!(
                program = %self.name,
                %handle,
                "shader program dropped without destroy; backend handle left to the backend"
            );
        }
    }
}

fn layout_declarations(
    declarations: &[UniformDeclaration],
) -> Result<(HashMap<String, UniformSlot>, u64)> {
    let mut slots: HashMap<String, UniformSlot> = HashMap::with_capacity(declarations.len());
    let mut offset = 0;
    for declaration in declarations {
        if let Some(existing) = slots.get(&declaration.name) {
            if existing.kind() != declaration.kind || existing.count() != declaration.count {
                return Err(RenderError::TypeMismatch {
                    name: declaration.name.clone(),
                    declared: existing.kind(),
                    requested: declaration.kind,
                });
            }
            continue;
        }
        let descriptor = UniformDescriptor {
            name: declaration.name.clone(),
            kind: declaration.kind,
            count: declaration.count,
            offset,
        };
        let slot = UniformSlot::new(descriptor, declaration.default.clone())?;
        offset = slot.descriptor().end_aligned();
        slots.insert(declaration.name.clone(), slot);
    }
    Ok((slots, offset))
}

/// A bound program. Dropping it rebinds whatever was active before.
pub struct ActiveProgram<'a> {
    program: &'a mut ShaderProgram,
    backend: &'a mut dyn GraphicsBackend,
    handle: ProgramHandle,
    previous: Option<ProgramHandle>,
}

impl ActiveProgram<'_> {
    pub fn handle(&self) -> ProgramHandle {
        self.handle
    }

    pub fn program(&self) -> &ShaderProgram {
        &*self.program
    }

    pub fn program_mut(&mut self) -> &mut ShaderProgram {
        &mut *self.program
    }

    pub fn backend(&mut self) -> &mut dyn GraphicsBackend {
        &mut *self.backend
    }

    pub fn set(&mut self, name: &str, value: UniformValue) -> Result<()> {
        self.program.set_uniform(name, value)
    }

    pub fn upload(&mut self, name: &str, value: UniformValue) -> Result<bool> {
        self.program.upload(&mut *self.backend, name, value)
    }

    pub fn flush(&mut self) -> Result<usize> {
        self.program.flush_uniforms(&mut *self.backend)
    }

    pub fn bind_texture(&mut self, texture: TextureHandle, unit: u32) -> Result<()> {
        self.backend.bind_texture(texture, unit)?;
        Ok(())
    }

    /// Flushes pending uniforms and draws.
    pub fn draw(&mut self, vertex_count: u32) -> Result<()> {
        self.flush()?;
        self.backend.draw(vertex_count)?;
        Ok(())
    }
}

impl Drop for ActiveProgram<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.backend.bind_program(self.previous) {
            warn!(
                program = %self.program.name,
                error = %err,
                "failed to restore previously bound program"
            );
        }
    }
}
