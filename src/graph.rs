//! Render graph definition.
//!
//! A [`Renderer`] is an arena of [`RenderStep`]s plus dependency edges.
//! Steps are addressed by [`StepHandle`]; the arena owns every step, so
//! there is no shared ownership between definition nodes. The definition is
//! pure data: nothing here touches the GPU. Instantiation against a device
//! happens in [`crate::instance`].
//!
//! Exactly one step must be marked as the present step; it is the root of
//! the per-frame traversal and its color output goes to the swapchain
//! image. [`Renderer::validate`] checks this and rejects cyclic
//! dependencies before any instance is built.

use std::hash::{Hash, Hasher};
use std::sync::Arc;

use glam::UVec2;

use crate::error::GraphicsError;
use crate::instance::{ChunkContext, RecordContext};
use crate::types::{ClearValue, ColorFormat};

/// Handle to a step inside a [`Renderer`] arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StepHandle(pub u32);

/// Per-frame pass logic supplied by the application.
pub trait RenderPassLogic: Send + Sync {
    /// Record this pass's commands for the current frame.
    fn record(&self, ctx: &mut RecordContext);

    /// Number of chunks this pass's command recording splits into. For
    /// values above 1 the instance dispatches [`Self::record_chunk`] once
    /// per chunk to the attached job queue instead of calling
    /// [`Self::record`], and joins every chunk before submitting.
    fn record_threads(&self) -> usize {
        1
    }

    /// Record one chunk of a split recording. Runs on job queue workers;
    /// must not call back into the owning instance.
    fn record_chunk(&self, _ctx: &ChunkContext) {}

    /// Called after the pass's per-frame resources were recreated at a new
    /// resolution.
    fn on_resize(&self, _resolution: UVec2) {}
}

/// One output attachment of a step.
///
/// Equality and hashing ignore the attachment name and the clear payload;
/// two attachments are interchangeable for pass-object purposes when they
/// share a format and agree on whether they clear at all. Names exist for
/// resource lookup only.
#[derive(Debug, Clone)]
pub struct Attachment {
    pub name: String,
    pub format: ColorFormat,
    pub clear: ClearValue,
}

impl Attachment {
    pub fn new(name: impl Into<String>, format: ColorFormat, clear: ClearValue) -> Self {
        Self {
            name: name.into(),
            format,
            clear,
        }
    }
}

impl PartialEq for Attachment {
    fn eq(&self, other: &Self) -> bool {
        self.format == other.format && self.clear.is_none() == other.clear.is_none()
    }
}

impl Eq for Attachment {}

impl Hash for Attachment {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.format.hash(state);
        self.clear.is_none().hash(state);
    }
}

/// Pass-object identity: the attachment layout that matters to the GPU.
///
/// Each entry is `(format, clears)`. Steps with equal keys share one pass
/// object through [`crate::device::GpuDevice::find_or_create_pass_object`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PassKey {
    pub attachments: Vec<(ColorFormat, bool)>,
    pub present: bool,
}

impl PassKey {
    pub fn for_step(step: &RenderStep) -> Self {
        Self {
            attachments: step
                .attachments
                .iter()
                .map(|a| (a.format, !a.clear.is_none()))
                .collect(),
            present: step.present,
        }
    }
}

/// Definition of one render step.
pub struct RenderStep {
    name: String,
    attachments: Vec<Attachment>,
    resolution: Option<UVec2>,
    present: bool,
    logic: Arc<dyn RenderPassLogic>,
}

impl RenderStep {
    pub fn new(name: impl Into<String>, logic: Arc<dyn RenderPassLogic>) -> Self {
        Self {
            name: name.into(),
            attachments: Vec::new(),
            resolution: None,
            present: false,
            logic,
        }
    }

    /// Append an output attachment. Order is preserved and is part of the
    /// pass-object identity.
    pub fn attach(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }

    /// Render at a fixed resolution instead of following the surface.
    pub fn resolution(mut self, resolution: UVec2) -> Self {
        self.resolution = Some(resolution);
        self
    }

    /// Mark this step as the present step. Its color output is the
    /// swapchain image; it needs no own color attachment for it.
    pub fn present(mut self) -> Self {
        self.present = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn attachments(&self) -> &[Attachment] {
        &self.attachments
    }

    pub fn fixed_resolution(&self) -> Option<UVec2> {
        self.resolution
    }

    pub fn is_present(&self) -> bool {
        self.present
    }

    pub fn logic(&self) -> &Arc<dyn RenderPassLogic> {
        &self.logic
    }
}

/// The render graph definition arena.
#[derive(Default)]
pub struct Renderer {
    steps: Vec<RenderStep>,
    // (step, depends_on) pairs; duplicates are rejected at insertion.
    edges: Vec<(StepHandle, StepHandle)>,
}

impl Renderer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a step to the arena and return its handle.
    pub fn add_step(&mut self, step: RenderStep) -> StepHandle {
        let handle = StepHandle(self.steps.len() as u32);
        log::trace!("Renderer: added step '{}' as {handle:?}", step.name);
        self.steps.push(step);
        handle
    }

    /// Declare that `step` consumes the output of `depends_on`.
    ///
    /// # Panics
    ///
    /// Panics if either handle is out of range, the edge is a self loop, or
    /// the edge already exists.
    pub fn add_dependency(&mut self, step: StepHandle, depends_on: StepHandle) {
        assert!((step.0 as usize) < self.steps.len(), "invalid step handle");
        assert!(
            (depends_on.0 as usize) < self.steps.len(),
            "invalid dependency handle"
        );
        assert_ne!(step, depends_on, "step cannot depend on itself");
        assert!(
            !self.edges.contains(&(step, depends_on)),
            "duplicate dependency"
        );
        self.edges.push((step, depends_on));
    }

    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    pub fn step(&self, handle: StepHandle) -> &RenderStep {
        &self.steps[handle.0 as usize]
    }

    /// Handles of the steps `handle` depends on, in declaration order.
    pub fn dependencies_of(&self, handle: StepHandle) -> Vec<StepHandle> {
        self.edges
            .iter()
            .filter(|(step, _)| *step == handle)
            .map(|(_, dep)| *dep)
            .collect()
    }

    /// Check the definition and return the present step's handle.
    ///
    /// Rejects graphs with no present step, more than one present step, or
    /// a dependency cycle.
    pub fn validate(&self) -> Result<StepHandle, GraphicsError> {
        let mut present = None;
        for (index, step) in self.steps.iter().enumerate() {
            if step.present {
                if present.is_some() {
                    return Err(GraphicsError::InvalidGraph(format!(
                        "more than one present step ('{}' and another)",
                        step.name
                    )));
                }
                present = Some(StepHandle(index as u32));
            }
        }
        let present = present.ok_or_else(|| {
            GraphicsError::InvalidGraph("no step is marked as the present step".to_string())
        })?;

        self.check_acyclic()?;
        Ok(present)
    }

    fn check_acyclic(&self) -> Result<(), GraphicsError> {
        // Coloring DFS: 0 = unvisited, 1 = on stack, 2 = done.
        let mut color = vec![0u8; self.steps.len()];
        for start in 0..self.steps.len() {
            if color[start] == 0 {
                self.dfs(StepHandle(start as u32), &mut color)?;
            }
        }
        Ok(())
    }

    fn dfs(&self, node: StepHandle, color: &mut [u8]) -> Result<(), GraphicsError> {
        color[node.0 as usize] = 1;
        for dep in self.dependencies_of(node) {
            match color[dep.0 as usize] {
                1 => {
                    return Err(GraphicsError::InvalidGraph(format!(
                        "dependency cycle through '{}'",
                        self.step(dep).name
                    )));
                }
                0 => self.dfs(dep, color)?,
                _ => {}
            }
        }
        color[node.0 as usize] = 2;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopLogic;

    impl RenderPassLogic for NoopLogic {
        fn record(&self, _ctx: &mut RecordContext) {}
    }

    fn step(name: &str) -> RenderStep {
        RenderStep::new(name, Arc::new(NoopLogic))
    }

    #[test]
    fn test_validate_returns_present_handle() {
        let mut renderer = Renderer::new();
        let a = renderer.add_step(step("geometry"));
        let root = renderer.add_step(step("compose").present());
        renderer.add_dependency(root, a);
        assert_eq!(renderer.validate().unwrap(), root);
    }

    #[test]
    fn test_validate_requires_present_step() {
        let mut renderer = Renderer::new();
        renderer.add_step(step("geometry"));
        assert!(matches!(
            renderer.validate(),
            Err(GraphicsError::InvalidGraph(_))
        ));
    }

    #[test]
    fn test_validate_rejects_two_present_steps() {
        let mut renderer = Renderer::new();
        renderer.add_step(step("a").present());
        renderer.add_step(step("b").present());
        assert!(renderer.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_cycle() {
        let mut renderer = Renderer::new();
        let a = renderer.add_step(step("a"));
        let b = renderer.add_step(step("b"));
        let c = renderer.add_step(step("c").present());
        renderer.add_dependency(a, b);
        renderer.add_dependency(b, a);
        renderer.add_dependency(c, a);

        let err = renderer.validate().unwrap_err();
        assert!(matches!(err, GraphicsError::InvalidGraph(_)));
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    #[should_panic(expected = "step cannot depend on itself")]
    fn test_self_dependency_panics() {
        let mut renderer = Renderer::new();
        let a = renderer.add_step(step("a"));
        renderer.add_dependency(a, a);
    }

    #[test]
    #[should_panic(expected = "duplicate dependency")]
    fn test_duplicate_dependency_panics() {
        let mut renderer = Renderer::new();
        let a = renderer.add_step(step("a"));
        let b = renderer.add_step(step("b"));
        renderer.add_dependency(a, b);
        renderer.add_dependency(a, b);
    }

    #[test]
    fn test_attachment_identity_ignores_name_and_clear_payload() {
        let a = Attachment::new("albedo", ColorFormat::Rgba8Unorm, ClearValue::black());
        let b = Attachment::new(
            "normals",
            ColorFormat::Rgba8Unorm,
            ClearValue::Color([1.0; 4]),
        );
        let c = Attachment::new("albedo", ColorFormat::Rgba8Unorm, ClearValue::None);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_pass_key_tracks_layout() {
        let lit = step("lit")
            .attach(Attachment::new(
                "color",
                ColorFormat::Rgba16Float,
                ClearValue::black(),
            ))
            .attach(Attachment::new(
                "depth",
                ColorFormat::Depth32Float,
                ClearValue::far_depth(),
            ));
        let key = PassKey::for_step(&lit);
        assert_eq!(
            key.attachments,
            vec![
                (ColorFormat::Rgba16Float, true),
                (ColorFormat::Depth32Float, true)
            ]
        );
        assert!(!key.present);
    }
}
