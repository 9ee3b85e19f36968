use std::collections::HashMap;
use std::sync::Arc;

use crossbeam_channel::Sender;

use crate::error::{RenderError, Result};
use crate::uniforms::{UniformDescriptor, UniformValue};

#[derive(Debug)]
pub(crate) struct RemoteUpdate {
    pub name: String,
    pub value: UniformValue,
}

/// Cross-thread handle for queuing uniform values to a program.
///
/// Values are validated against the program's layout at the time the handle
/// was created, then delivered over a channel. The render thread applies
/// them on its next flush; there is no ordering guarantee relative to values
/// set directly on the render thread within the same frame.
#[derive(Clone, Debug)]
pub struct UniformRemote {
    program: String,
    layout: Arc<HashMap<String, UniformDescriptor>>,
    sender: Sender<RemoteUpdate>,
}

impl UniformRemote {
    pub(crate) fn new(
        program: String,
        layout: Arc<HashMap<String, UniformDescriptor>>,
        sender: Sender<RemoteUpdate>,
    ) -> Self {
        Self {
            program,
            layout,
            sender,
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn set(&self, name: &str, value: UniformValue) -> Result<()> {
        let descriptor = self
            .layout
            .get(name)
            .ok_or_else(|| RenderError::UnknownUniform {
                program: self.program.clone(),
                name: name.to_string(),
            })?;
        descriptor.validate(&value)?;
        self.sender
            .send(RemoteUpdate {
                name: name.to_string(),
                value,
            })
            .map_err(|_| RenderError::Disconnected {
                program: self.program.clone(),
            })
    }
}
