//! Cached uniform values with redundant-upload suppression.
//!
//! A [`UniformSlot`] keeps two copies of its value: the one application code
//! asked for most recently (`cached`) and the one the GPU actually holds
//! (`last_uploaded`). Uploads compare the two bit for bit and skip the
//! backend call when nothing changed, which keeps per-frame uniform traffic
//! proportional to what really moved.

use std::fmt;

use crate::backend::{GraphicsBackend, ProgramHandle};
use crate::error::{RenderError, Result};

/// Every slot starts on a 16-byte boundary inside the uniform block.
pub const UNIFORM_ALIGNMENT: u64 = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum UniformKind {
    FloatVec,
    IntVec,
    Matrix,
}

impl fmt::Display for UniformKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UniformKind::FloatVec => f.write_str("float vector"),
            UniformKind::IntVec => f.write_str("int vector"),
            UniformKind::Matrix => f.write_str("matrix"),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum UniformValue {
    Float(Vec<f32>),
    Int(Vec<i32>),
    /// Column-major matrix elements.
    Matrix(Vec<f32>),
}

impl UniformValue {
    /// `size` x `size` identity matrix.
    pub fn identity(size: usize) -> Self {
        let mut values = vec![0.0; size * size];
        for index in 0..size {
            values[index * size + index] = 1.0;
        }
        UniformValue::Matrix(values)
    }

    pub fn kind(&self) -> UniformKind {
        match self {
            UniformValue::Float(_) => UniformKind::FloatVec,
            UniformValue::Int(_) => UniformKind::IntVec,
            UniformValue::Matrix(_) => UniformKind::Matrix,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            UniformValue::Float(values) | UniformValue::Matrix(values) => values.len(),
            UniformValue::Int(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Exact comparison: `-0.0` and `0.0` differ, identical NaN payloads match.
    pub fn same_bits(&self, other: &UniformValue) -> bool {
        match (self, other) {
            (UniformValue::Float(a), UniformValue::Float(b))
            | (UniformValue::Matrix(a), UniformValue::Matrix(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.to_bits() == y.to_bits())
            }
            (UniformValue::Int(a), UniformValue::Int(b)) => a == b,
            _ => false,
        }
    }

    /// Native-endian bytes as laid out in the uniform block.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            UniformValue::Float(values) | UniformValue::Matrix(values) => {
                bytemuck::cast_slice::<f32, u8>(values).to_vec()
            }
            UniformValue::Int(values) => bytemuck::cast_slice::<i32, u8>(values).to_vec(),
        }
    }
}

/// Identity of a uniform as the backend sees it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UniformDescriptor {
    pub name: String,
    pub kind: UniformKind,
    pub count: usize,
    /// Byte offset inside the program's uniform block.
    pub offset: u64,
}

impl UniformDescriptor {
    pub fn size_bytes(&self) -> u64 {
        self.count as u64 * 4
    }

    /// Offset of the first slot that may follow this one.
    pub fn end_aligned(&self) -> u64 {
        align_up(self.offset + self.size_bytes(), UNIFORM_ALIGNMENT)
    }

    pub(crate) fn validate(&self, value: &UniformValue) -> Result<()> {
        if value.kind() != self.kind || value.len() != self.count {
            return Err(RenderError::InvalidArity {
                name: self.name.clone(),
                kind: self.kind,
                expected: self.count,
                actual: value.len(),
            });
        }
        Ok(())
    }
}

pub(crate) fn align_up(value: u64, alignment: u64) -> u64 {
    value.div_ceil(alignment) * alignment
}

#[derive(Debug)]
pub struct UniformSlot {
    descriptor: UniformDescriptor,
    default: UniformValue,
    cached: UniformValue,
    last_uploaded: Option<UniformValue>,
    gpu_writes: u64,
}

impl UniformSlot {
    pub(crate) fn new(descriptor: UniformDescriptor, default: UniformValue) -> Result<Self> {
        descriptor.validate(&default)?;
        Ok(Self {
            descriptor,
            cached: default.clone(),
            default,
            last_uploaded: None,
            gpu_writes: 0,
        })
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn kind(&self) -> UniformKind {
        self.descriptor.kind
    }

    pub fn count(&self) -> usize {
        self.descriptor.count
    }

    pub fn descriptor(&self) -> &UniformDescriptor {
        &self.descriptor
    }

    pub fn default_value(&self) -> &UniformValue {
        &self.default
    }

    /// Stores `value` as pending without touching the GPU.
    pub fn set_cached_value(&mut self, value: UniformValue) -> Result<()> {
        self.descriptor.validate(&value)?;
        self.cached = value;
        Ok(())
    }

    pub fn cached_value(&self) -> &UniformValue {
        &self.cached
    }

    pub fn last_uploaded(&self) -> Option<&UniformValue> {
        self.last_uploaded.as_ref()
    }

    pub fn is_dirty(&self) -> bool {
        self.last_uploaded
            .as_ref()
            .is_none_or(|uploaded| !uploaded.same_bits(&self.cached))
    }

    /// Number of backend writes this slot has issued.
    pub fn gpu_writes(&self) -> u64 {
        self.gpu_writes
    }

    /// Caches `value` and writes it to the GPU unless it matches what is
    /// already there. Returns whether a backend write happened.
    pub fn upload_value(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        program: ProgramHandle,
        value: UniformValue,
    ) -> Result<bool> {
        self.set_cached_value(value)?;
        self.flush(backend, program)
    }

    /// Writes the pending cached value if it differs from the uploaded one.
    pub fn flush(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        program: ProgramHandle,
    ) -> Result<bool> {
        if !self.is_dirty() {
            return Ok(false);
        }
        backend.set_uniform(program, &self.descriptor, &self.cached)?;
        self.last_uploaded = Some(self.cached.clone());
        self.gpu_writes += 1;
        tracing::trace!(
            uniform = %self.descriptor.name,
            %program,
            writes = self.gpu_writes,
            "uploaded uniform"
        );
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::RecordingBackend;

    fn color_slot() -> UniformSlot {
        UniformSlot::new(
            UniformDescriptor {
                name: "tint".into(),
                kind: UniformKind::FloatVec,
                count: 4,
                offset: 0,
            },
            UniformValue::Float(vec![0.0; 4]),
        )
        .unwrap()
    }

    fn program(backend: &mut RecordingBackend) -> ProgramHandle {
        backend.compile_program("test", "vs", "fs").unwrap()
    }

    #[test]
    fn identical_upload_is_skipped() {
        let mut backend = RecordingBackend::new();
        let handle = program(&mut backend);
        let mut slot = color_slot();

        let first = slot
            .upload_value(&mut backend, handle, UniformValue::Float(vec![1.0; 4]))
            .unwrap();
        let second = slot
            .upload_value(&mut backend, handle, UniformValue::Float(vec![1.0; 4]))
            .unwrap();

        assert!(first);
        assert!(!second);
        assert_eq!(backend.uniform_writes(), 1);
        assert_eq!(slot.cached_value(), &UniformValue::Float(vec![1.0; 4]));
    }

    #[test]
    fn distinct_values_each_write_once() {
        let mut backend = RecordingBackend::new();
        let handle = program(&mut backend);
        let mut slot = color_slot();
        for rgba in [[1.0, 0.0, 0.0, 1.0], [0.0, 1.0, 0.0, 1.0], [1.0, 0.0, 0.0, 1.0]] {
            let value = UniformValue::Float(rgba.to_vec());
            slot.upload_value(&mut backend, handle, value).unwrap();
        }
        assert_eq!(slot.gpu_writes(), 3);
        assert_eq!(
            backend.uniform_value(handle, "tint"),
            Some(&UniformValue::Float(vec![1.0, 0.0, 0.0, 1.0]))
        );
    }

    #[test]
    fn comparison_is_bit_exact() {
        let mut backend = RecordingBackend::new();
        let handle = program(&mut backend);
        let mut slot = color_slot();
        slot.upload_value(&mut backend, handle, UniformValue::Float(vec![0.0; 4]))
            .unwrap();
        let wrote = slot
            .upload_value(
                &mut backend,
                handle,
                UniformValue::Float(vec![-0.0, 0.0, 0.0, 0.0]),
            )
            .unwrap();
        assert!(wrote, "negative zero is a different bit pattern");
    }

    #[test]
    fn wrong_arity_is_rejected_without_caching() {
        let mut slot = color_slot();
        let err = slot
            .set_cached_value(UniformValue::Float(vec![1.0, 2.0, 3.0]))
            .unwrap_err();
        assert!(matches!(
            err,
            RenderError::InvalidArity {
                expected: 4,
                actual: 3,
                ..
            }
        ));
        assert_eq!(slot.cached_value(), slot.default_value());

        let err = slot
            .set_cached_value(UniformValue::Int(vec![1, 2, 3, 4]))
            .unwrap_err();
        assert!(matches!(err, RenderError::InvalidArity { .. }));
    }

    #[test]
    fn cached_value_defers_upload_until_flush() {
        let mut backend = RecordingBackend::new();
        let handle = program(&mut backend);
        let mut slot = color_slot();

        let pending = UniformValue::Float(vec![0.5; 4]);
        slot.set_cached_value(pending).unwrap();
        assert_eq!(backend.uniform_writes(), 0);
        assert!(slot.is_dirty());

        assert!(slot.flush(&mut backend, handle).unwrap());
        assert!(!slot.is_dirty());
        assert!(!slot.flush(&mut backend, handle).unwrap());
        assert_eq!(backend.uniform_writes(), 1);
    }

    #[test]
    fn identity_matrix_layout() {
        let identity = UniformValue::identity(4);
        assert_eq!(identity.len(), 16);
        if let UniformValue::Matrix(values) = identity {
            assert_eq!(values[0], 1.0);
            assert_eq!(values[5], 1.0);
            assert_eq!(values[1], 0.0);
            assert_eq!(values[15], 1.0);
        }
    }

    #[test]
    fn descriptor_alignment() {
        let descriptor = UniformDescriptor {
            name: "offset".into(),
            kind: UniformKind::FloatVec,
            count: 3,
            offset: 16,
        };
        assert_eq!(descriptor.size_bytes(), 12);
        assert_eq!(descriptor.end_aligned(), 32);
    }
}
