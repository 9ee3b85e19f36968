//! Cyclic resource sequences, i.e. animated textures.

use crate::accumulator::FrameAccumulator;
use crate::backend::ResourceRegistry;
use crate::error::Result;

/// An ordered, never-empty ring of resources that advances on a timer.
///
/// Missing entries are replaced by the registry's fallback resource, so every
/// index always resolves to something drawable. Editing operations report
/// bad indices through their return value instead of erroring.
#[derive(Clone, Debug)]
pub struct RenderableSequence<R> {
    resources: Vec<R>,
    index: usize,
    fallback: R,
    clock: FrameAccumulator,
}

impl<R: Clone> RenderableSequence<R> {
    pub fn new<G>(
        resources: impl IntoIterator<Item = Option<R>>,
        registry: &G,
        frame_millis: f64,
    ) -> Result<Self>
    where
        G: ResourceRegistry<Resource = R> + ?Sized,
    {
        let clock = FrameAccumulator::new(frame_millis)?;
        let fallback = registry.fallback_resource();
        let mut resources: Vec<R> = resources
            .into_iter()
            .map(|resource| resource.unwrap_or_else(|| fallback.clone()))
            .collect();
        if resources.is_empty() {
            resources.push(fallback.clone());
        }
        Ok(Self {
            resources,
            index: 0,
            fallback,
            clock,
        })
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    /// Always false; kept for API symmetry with `len`.
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn frame_millis(&self) -> f64 {
        self.clock.threshold()
    }

    pub fn set_frame_millis(&mut self, frame_millis: f64) -> Result<()> {
        let advances = self.clock.set_threshold(frame_millis)?;
        for _ in 0..advances {
            self.advance();
        }
        Ok(())
    }

    pub fn fallback(&self) -> &R {
        &self.fallback
    }

    pub fn iter(&self) -> impl Iterator<Item = &R> {
        self.resources.iter()
    }

    /// Steps to the next resource, wrapping at the end.
    pub fn advance(&mut self) {
        self.index = (self.index + 1) % self.resources.len();
    }

    /// Feeds frame time; returns how many frames were advanced.
    pub fn update(&mut self, delta_millis: f64) -> u32 {
        let advances = self.clock.update(delta_millis);
        let len = self.resources.len();
        self.index = (self.index + advances as usize % len) % len;
        advances
    }

    pub fn current_resource(&self) -> &R {
        self.resources.get(self.index).unwrap_or(&self.fallback)
    }

    /// Inserts at `index` (`0..=len`). The resource currently shown stays
    /// current. Returns false, leaving the sequence untouched, when out of
    /// range.
    pub fn insert_at(&mut self, index: usize, resource: Option<R>) -> bool {
        if index > self.resources.len() {
            return false;
        }
        let resource = resource.unwrap_or_else(|| self.fallback.clone());
        self.resources.insert(index, resource);
        if index <= self.index {
            self.index += 1;
        }
        true
    }

    /// Replaces the resource at `index`, returning the previous one.
    pub fn set_at(&mut self, index: usize, resource: Option<R>) -> Option<R> {
        let resource = resource.unwrap_or_else(|| self.fallback.clone());
        let slot = self.resources.get_mut(index)?;
        Some(std::mem::replace(slot, resource))
    }

    /// Removes the resource at `index`. Removing the last entry leaves the
    /// fallback in its place.
    pub fn remove_at(&mut self, index: usize) -> Option<R> {
        if index >= self.resources.len() {
            return None;
        }
        let removed = self.resources.remove(index);
        if self.resources.is_empty() {
            self.resources.push(self.fallback.clone());
        }
        if index < self.index {
            self.index -= 1;
        }
        if self.index >= self.resources.len() {
            self.index = 0;
        }
        Some(removed)
    }
}
