//! Render pass instances.
//!
//! A [`PassInstance`] is the runtime side of a [`crate::graph::RenderStep`]:
//! it owns the step's per-in-flight-slot GPU resources (one image view per
//! attachment per slot, one framebuffer per slot), its per-slot
//! render-finished semaphores, and the per-frame `prepared`/`submitted`
//! flags.
//!
//! Instances form the same DAG as the definition, but shared: every step is
//! instantiated exactly once and parents hold `Arc`s to it, so a fan-in
//! dependency is rendered once per frame no matter how many passes consume
//! it. [`PassInstance::render`] memoizes through the `submitted` flag;
//! [`PassInstance::create_or_resize`] memoizes through `prepared` and is
//! otherwise idempotent for an unchanged resolution.
//!
//! Replaced resources are never destroyed inline. They go to the device's
//! deferred queue on the current frame slot, since commands from earlier
//! in-flight frames may still read them.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use glam::UVec2;
use parking_lot::Mutex;

use crate::backend::{FramebufferId, ImageViewId, PassObjectId, SubmitInfo};
use crate::buffer::Buffer;
use crate::deferred::DeferredResource;
use crate::device::GpuDevice;
use crate::error::GraphicsError;
use crate::graph::{Attachment, PassKey, RenderPassLogic, Renderer, StepHandle};
use crate::jobs::JobQueue;
use crate::sync::{Fence, Semaphore};
use crate::types::ColorFormat;

/// One attachment's image views, one per in-flight slot.
pub struct ImageViewSet {
    name: String,
    format: ColorFormat,
    views: Vec<ImageViewId>,
}

impl ImageViewSet {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn format(&self) -> ColorFormat {
        self.format
    }

    pub fn view_for(&self, slot: usize) -> ImageViewId {
        self.views[slot]
    }
}

/// The per-slot GPU resources of one instance at one resolution.
pub struct FrameResources {
    views: Vec<Arc<ImageViewSet>>,
    framebuffers: Vec<FramebufferId>,
}

impl FrameResources {
    fn view_set(&self, name: &str) -> Option<&Arc<ImageViewSet>> {
        self.views.iter().find(|set| set.name == name)
    }
}

/// What pass logic sees while recording one frame.
///
/// Everything the logic needs is reachable from here; calling back into the
/// instance's own accessors from `record` is not supported.
pub struct RecordContext<'a> {
    pass_name: &'a str,
    slot: usize,
    resolution: UVec2,
    resources: &'a FrameResources,
    buffers: &'a HashMap<String, Arc<Mutex<Buffer>>>,
}

impl<'a> RecordContext<'a> {
    pub fn pass_name(&self) -> &str {
        self.pass_name
    }

    /// Current in-flight slot index.
    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn resolution(&self) -> UVec2 {
        self.resolution
    }

    /// This frame's view of one of the pass's own attachments.
    pub fn view(&self, attachment: &str) -> Option<ImageViewId> {
        self.resources
            .view_set(attachment)
            .map(|set| set.view_for(self.slot))
    }

    /// A buffer registered on this instance.
    pub fn buffer(&self, name: &str) -> Option<&Arc<Mutex<Buffer>>> {
        self.buffers.get(name)
    }
}

/// What pass logic sees while recording one chunk of a split recording.
///
/// Owned rather than borrowed: chunks run on job queue workers.
#[derive(Debug, Clone)]
pub struct ChunkContext {
    pass_name: String,
    slot: usize,
    thread_index: usize,
    thread_count: usize,
    resolution: UVec2,
}

impl ChunkContext {
    pub fn pass_name(&self) -> &str {
        &self.pass_name
    }

    /// Current in-flight slot index.
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Index of this chunk, in `0..thread_count`.
    pub fn thread_index(&self) -> usize {
        self.thread_index
    }

    pub fn thread_count(&self) -> usize {
        self.thread_count
    }

    pub fn resolution(&self) -> UVec2 {
        self.resolution
    }
}

struct InstanceState {
    resolution: UVec2,
    resources: Option<FrameResources>,
    prepared: bool,
    submitted: bool,
    buffers: HashMap<String, Arc<Mutex<Buffer>>>,
    custom_passes: Vec<(String, Arc<dyn RenderPassLogic>)>,
}

pub struct PassInstance {
    device: Weak<GpuDevice>,
    name: String,
    attachments: Vec<Attachment>,
    fixed_resolution: Option<UVec2>,
    present: bool,
    logic: Arc<dyn RenderPassLogic>,
    dependencies: Vec<Arc<PassInstance>>,
    pass_object: PassObjectId,
    // One render-finished semaphore per in-flight slot.
    semaphores: Vec<Semaphore>,
    jobs: Mutex<Option<Arc<JobQueue>>>,
    state: Mutex<InstanceState>,
}

impl PassInstance {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_present(&self) -> bool {
        self.present
    }

    /// The render-finished semaphore signaled by this instance's
    /// submission on the given slot.
    pub fn semaphore(&self, slot: usize) -> Semaphore {
        self.semaphores[slot]
    }

    pub fn dependencies(&self) -> &[Arc<PassInstance>] {
        &self.dependencies
    }

    /// Walk every dependency, depth first.
    pub fn for_each_dependency(&self, f: &mut impl FnMut(&Arc<PassInstance>)) {
        for dep in &self.dependencies {
            dep.for_each_dependency(f);
            f(dep);
        }
    }

    /// Find an instance by step name anywhere below this one.
    pub fn find_dependency(&self, name: &str) -> Option<Arc<PassInstance>> {
        for dep in &self.dependencies {
            if dep.name == name {
                return Some(Arc::clone(dep));
            }
            if let Some(found) = dep.find_dependency(name) {
                return Some(found);
            }
        }
        None
    }

    /// The resolution this instance last built resources at.
    pub fn resolution(&self) -> UVec2 {
        self.state.lock().resolution
    }

    pub fn is_prepared(&self) -> bool {
        self.state.lock().prepared
    }

    pub fn is_submitted(&self) -> bool {
        self.state.lock().submitted
    }

    /// Register a buffer under a name so pass logic can reach it from
    /// [`RecordContext::buffer`]. Replacing a name drops the old buffer
    /// (its allocations retire through the deferred queue).
    pub fn register_buffer(&self, name: impl Into<String>, buffer: Buffer) -> Arc<Mutex<Buffer>> {
        let buffer = Arc::new(Mutex::new(buffer));
        self.state
            .lock()
            .buffers
            .insert(name.into(), Arc::clone(&buffer));
        buffer
    }

    /// Look up a registered buffer. A miss is a soft failure: the returned
    /// weak simply fails to upgrade.
    pub fn buffer(&self, name: &str) -> Weak<Mutex<Buffer>> {
        match self.state.lock().buffers.get(name) {
            Some(buffer) => Arc::downgrade(buffer),
            None => Weak::new(),
        }
    }

    /// Look up one of the instance's attachments. A miss, or an instance
    /// whose resources have not been created yet, yields a weak that fails
    /// to upgrade.
    pub fn image(&self, attachment: &str) -> Weak<ImageViewSet> {
        let state = self.state.lock();
        match state
            .resources
            .as_ref()
            .and_then(|r| r.view_set(attachment))
        {
            Some(set) => Arc::downgrade(set),
            None => Weak::new(),
        }
    }

    /// Attach an extra record callback that runs after this instance's own
    /// logic every frame. Re-adding a key replaces the previous callback.
    pub fn add_custom_pass(&self, key: impl Into<String>, logic: Arc<dyn RenderPassLogic>) {
        let key = key.into();
        let mut state = self.state.lock();
        state.custom_passes.retain(|(k, _)| *k != key);
        state.custom_passes.push((key, logic));
    }

    pub fn remove_custom_pass(&self, key: &str) {
        self.state.lock().custom_passes.retain(|(k, _)| k != key);
    }

    /// Attach a job queue to this instance and its whole subtree. Passes
    /// whose logic declares a record-thread count above 1 dispatch their
    /// recording chunks to it.
    pub fn set_job_queue(&self, jobs: Arc<JobQueue>) {
        for dep in &self.dependencies {
            dep.set_job_queue(Arc::clone(&jobs));
        }
        *self.jobs.lock() = Some(jobs);
    }

    fn device(&self) -> Arc<GpuDevice> {
        match self.device.upgrade() {
            Some(device) => device,
            None => panic!("pass instance '{}' outlived its device", self.name),
        }
    }

    /// Ensure this instance and its whole dependency subtree have resources
    /// for the given resolution.
    ///
    /// Called once per frame by the driver. Re-entry in the same frame (a
    /// fan-in parent arriving second) is a no-op through the `prepared`
    /// flag. An unchanged resolution without `force` keeps the existing
    /// resources; `force` rebuilds unconditionally, retiring the old ones
    /// on the current frame slot.
    ///
    /// `surface_views` is only read by the present instance, whose
    /// framebuffers target the swapchain images.
    pub fn create_or_resize(
        &self,
        resolution: UVec2,
        surface_views: &[ImageViewId],
        force: bool,
    ) -> Result<(), GraphicsError> {
        let device = self.device();
        let target = self.fixed_resolution.unwrap_or(resolution);

        {
            let mut state = self.state.lock();
            if state.prepared {
                return Ok(());
            }

            let rebuild =
                force || state.resources.is_none() || state.resolution != target;
            if rebuild {
                if let Some(old) = state.resources.take() {
                    retire_resources(&device, old);
                }
                state.resources = Some(self.build_resources(&device, target, surface_views)?);
                state.resolution = target;
                log::trace!(
                    "PassInstance: '{}' rebuilt resources at {target}",
                    self.name
                );
            }
            state.prepared = true;
        }

        for dep in &self.dependencies {
            dep.create_or_resize(resolution, &[], force)?;
        }
        Ok(())
    }

    fn build_resources(
        &self,
        device: &Arc<GpuDevice>,
        resolution: UVec2,
        surface_views: &[ImageViewId],
    ) -> Result<FrameResources, GraphicsError> {
        let slot_count = device.image_count();
        if self.present {
            assert_eq!(
                surface_views.len(),
                slot_count,
                "present pass '{}' needs one surface view per in-flight slot",
                self.name
            );
        }

        let mut view_sets = Vec::with_capacity(self.attachments.len());
        for attachment in &self.attachments {
            let mut views = Vec::with_capacity(slot_count);
            for slot in 0..slot_count {
                let view = device.backend().create_image_view(
                    attachment.format,
                    resolution,
                    &format!("{}.{}[{slot}]", self.name, attachment.name),
                )?;
                views.push(view);
            }
            view_sets.push(Arc::new(ImageViewSet {
                name: attachment.name.clone(),
                format: attachment.format,
                views,
            }));
        }

        let mut framebuffers = Vec::with_capacity(slot_count);
        for slot in 0..slot_count {
            let mut slot_views = Vec::new();
            if self.present {
                slot_views.push(surface_views[slot]);
            }
            slot_views.extend(view_sets.iter().map(|set| set.views[slot]));
            let framebuffer =
                device
                    .backend()
                    .create_framebuffer(self.pass_object, &slot_views, resolution)?;
            framebuffers.push(framebuffer);
        }

        self.logic.on_resize(resolution);
        Ok(FrameResources {
            views: view_sets,
            framebuffers,
        })
    }

    /// Render this instance and everything below it for the current frame.
    ///
    /// Dependencies submit first; their render-finished semaphores become
    /// this submission's waits. An instance that already submitted this
    /// frame just returns its semaphore, so shared subtrees execute once.
    ///
    /// A pass whose logic declares a record-thread count above 1 has its
    /// recording split into that many chunks; with a job queue attached the
    /// chunks run on its workers, and every chunk is joined before the
    /// submission goes out.
    ///
    /// `fence` is attached to this instance's own submission; the driver
    /// passes the frame slot's fence to the root.
    ///
    /// # Panics
    ///
    /// Panics if [`Self::create_or_resize`] has not run this frame.
    pub fn render(&self, slot: usize, fence: Option<Fence>) -> Semaphore {
        let mut waits = Vec::with_capacity(self.dependencies.len());
        for dep in &self.dependencies {
            waits.push(dep.render(slot, None).id());
        }

        let device = self.device();
        let mut state = self.state.lock();
        if state.submitted {
            return self.semaphores[slot];
        }
        assert!(
            state.prepared,
            "pass '{}' rendered before create_or_resize",
            self.name
        );
        let InstanceState {
            resources,
            buffers,
            custom_passes,
            resolution,
            ..
        } = &mut *state;
        let resources = resources
            .as_ref()
            .unwrap_or_else(|| panic!("pass '{}' has no frame resources", self.name));

        let mut ctx = RecordContext {
            pass_name: &self.name,
            slot,
            resolution: *resolution,
            resources,
            buffers,
        };
        let threads = self.logic.record_threads();
        if threads > 1 {
            self.record_split(threads, slot, *resolution);
        } else {
            self.logic.record(&mut ctx);
        }
        for (_, custom) in custom_passes.iter() {
            custom.record(&mut ctx);
        }

        device.backend().submit(&SubmitInfo {
            pass_name: self.name.clone(),
            pass_object: self.pass_object,
            framebuffer: resources.framebuffers[slot],
            wait_semaphores: waits,
            signal_semaphore: self.semaphores[slot].id(),
            signal_fence: fence,
        });
        state.submitted = true;
        self.semaphores[slot]
    }

    fn record_split(&self, threads: usize, slot: usize, resolution: UVec2) {
        let chunk = |thread_index: usize| ChunkContext {
            pass_name: self.name.clone(),
            slot,
            thread_index,
            thread_count: threads,
            resolution,
        };
        let jobs = self.jobs.lock().clone();
        match jobs {
            Some(jobs) => {
                let handles: Vec<_> = (0..threads)
                    .map(|thread_index| {
                        let logic = Arc::clone(&self.logic);
                        let ctx = chunk(thread_index);
                        jobs.push(move || logic.record_chunk(&ctx))
                    })
                    .collect();
                // Every chunk joins before this pass submits.
                for handle in &handles {
                    handle.wait();
                }
            }
            None => {
                for thread_index in 0..threads {
                    self.logic.record_chunk(&chunk(thread_index));
                }
            }
        }
    }

    /// Clear the per-frame flags on this instance and its subtree. Called
    /// by the driver at the start of every frame.
    pub fn reset_for_next_frame(&self) {
        for dep in &self.dependencies {
            dep.reset_for_next_frame();
        }
        let mut state = self.state.lock();
        state.prepared = false;
        state.submitted = false;
    }
}

impl Drop for PassInstance {
    fn drop(&mut self) {
        if let Some(device) = self.device.upgrade() {
            if let Some(resources) = self.state.lock().resources.take() {
                retire_resources(&device, resources);
            }
        }
    }
}

fn retire_resources(device: &Arc<GpuDevice>, resources: FrameResources) {
    for framebuffer in resources.framebuffers {
        device.drop_resource(DeferredResource::Framebuffer(framebuffer));
    }
    for set in resources.views {
        for view in &set.views {
            device.drop_resource(DeferredResource::ImageView(*view));
        }
    }
}

/// Instantiate a validated [`Renderer`] against a device.
///
/// Returns the present step's instance, the root of the per-frame
/// traversal. Every step reachable from it is instantiated exactly once;
/// fan-in edges share the same `Arc`.
///
/// The present step renders into the swapchain image, so its pass object
/// gets a `surface_format` color attachment in front of its own.
pub fn create_graph(
    renderer: &Renderer,
    device: &Arc<GpuDevice>,
    surface_format: ColorFormat,
) -> Result<Arc<PassInstance>, GraphicsError> {
    let root = renderer.validate()?;
    let mut memo: Vec<Option<Arc<PassInstance>>> = vec![None; renderer.step_count()];
    instantiate(renderer, device, surface_format, root, &mut memo)
}

fn instantiate(
    renderer: &Renderer,
    device: &Arc<GpuDevice>,
    surface_format: ColorFormat,
    handle: StepHandle,
    memo: &mut Vec<Option<Arc<PassInstance>>>,
) -> Result<Arc<PassInstance>, GraphicsError> {
    if let Some(instance) = &memo[handle.0 as usize] {
        return Ok(Arc::clone(instance));
    }

    let step = renderer.step(handle);
    if !step.is_present() && step.attachments().is_empty() {
        return Err(GraphicsError::InvalidGraph(format!(
            "step '{}' has no attachments",
            step.name()
        )));
    }

    let mut dependencies = Vec::new();
    for dep in renderer.dependencies_of(handle) {
        dependencies.push(instantiate(renderer, device, surface_format, dep, memo)?);
    }

    let mut key = PassKey::for_step(step);
    if step.is_present() {
        key.attachments.insert(0, (surface_format, true));
    }
    let pass_object = device.find_or_create_pass_object(&key)?;

    let instance = Arc::new(PassInstance {
        device: Arc::downgrade(device),
        name: step.name().to_string(),
        attachments: step.attachments().to_vec(),
        fixed_resolution: step.fixed_resolution(),
        present: step.is_present(),
        logic: Arc::clone(step.logic()),
        dependencies,
        pass_object,
        semaphores: (0..device.image_count()).map(|_| Semaphore::new()).collect(),
        jobs: Mutex::new(None),
        state: Mutex::new(InstanceState {
            resolution: UVec2::ZERO,
            resources: None,
            prepared: false,
            submitted: false,
            buffers: HashMap::new(),
            custom_passes: Vec::new(),
        }),
    });
    memo[handle.0 as usize] = Some(Arc::clone(&instance));
    Ok(instance)
}

static_assertions::assert_impl_all!(PassInstance: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{DummyBackend, GpuBackend};
    use crate::graph::RenderStep;
    use crate::types::ClearValue;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingLogic {
        records: AtomicUsize,
        resizes: AtomicUsize,
    }

    impl CountingLogic {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                records: AtomicUsize::new(0),
                resizes: AtomicUsize::new(0),
            })
        }
    }

    impl RenderPassLogic for CountingLogic {
        fn record(&self, _ctx: &mut RecordContext) {
            self.records.fetch_add(1, Ordering::SeqCst);
        }

        fn on_resize(&self, _resolution: UVec2) {
            self.resizes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn color_attachment(name: &str) -> Attachment {
        Attachment::new(name, ColorFormat::Rgba8Unorm, ClearValue::black())
    }

    fn setup(image_count: usize) -> (Arc<DummyBackend>, Arc<GpuDevice>) {
        let backend = Arc::new(DummyBackend::new());
        let device =
            GpuDevice::new(Arc::clone(&backend) as Arc<dyn GpuBackend>, image_count).unwrap();
        (backend, device)
    }

    fn surface_views(
        backend: &DummyBackend,
        count: usize,
        resolution: UVec2,
    ) -> Vec<ImageViewId> {
        (0..count)
            .map(|i| {
                backend
                    .create_image_view(
                        ColorFormat::Bgra8Unorm,
                        resolution,
                        &format!("swapchain[{i}]"),
                    )
                    .unwrap()
            })
            .collect()
    }

    #[test]
    fn test_fan_in_shares_one_instance() {
        let (_backend, device) = setup(2);
        let shadow_logic = CountingLogic::new();

        let mut renderer = Renderer::new();
        let shadows = renderer.add_step(
            RenderStep::new("shadows", shadow_logic.clone()).attach(color_attachment("map")),
        );
        let lit = renderer
            .add_step(RenderStep::new("lit", CountingLogic::new()).attach(color_attachment("hdr")));
        let ui = renderer
            .add_step(RenderStep::new("ui", CountingLogic::new()).attach(color_attachment("ui")));
        let root = renderer.add_step(RenderStep::new("compose", CountingLogic::new()).present());
        renderer.add_dependency(lit, shadows);
        renderer.add_dependency(ui, shadows);
        renderer.add_dependency(root, lit);
        renderer.add_dependency(root, ui);

        let root = create_graph(&renderer, &device, ColorFormat::Bgra8Unorm).unwrap();

        let mut seen = Vec::new();
        root.for_each_dependency(&mut |dep| seen.push(Arc::as_ptr(dep)));
        // "shadows" shows up through both parents but points at one
        // allocation.
        let shadow_ptrs: Vec<_> = {
            let mut ptrs = seen.clone();
            ptrs.sort();
            ptrs.dedup();
            ptrs
        };
        assert_eq!(seen.len(), 4);
        assert_eq!(shadow_ptrs.len(), 3);

        let via_lit = root.find_dependency("shadows").unwrap();
        assert_eq!(via_lit.name(), "shadows");
        assert!(root.find_dependency("nonexistent").is_none());
    }

    #[test]
    fn test_render_memoizes_shared_subtree() {
        let (backend, device) = setup(2);
        let shadow_logic = CountingLogic::new();

        let mut renderer = Renderer::new();
        let shadows = renderer.add_step(
            RenderStep::new("shadows", shadow_logic.clone()).attach(color_attachment("map")),
        );
        let lit = renderer
            .add_step(RenderStep::new("lit", CountingLogic::new()).attach(color_attachment("hdr")));
        let ui = renderer
            .add_step(RenderStep::new("ui", CountingLogic::new()).attach(color_attachment("ui")));
        let root = renderer.add_step(RenderStep::new("compose", CountingLogic::new()).present());
        renderer.add_dependency(lit, shadows);
        renderer.add_dependency(ui, shadows);
        renderer.add_dependency(root, lit);
        renderer.add_dependency(root, ui);

        let root = create_graph(&renderer, &device, ColorFormat::Bgra8Unorm).unwrap();
        let views = surface_views(&backend, 2, UVec2::new(64, 64));
        root.create_or_resize(UVec2::new(64, 64), &views, false)
            .unwrap();
        root.render(0, None);

        assert_eq!(shadow_logic.records.load(Ordering::SeqCst), 1);
        assert_eq!(backend.submission_count(), 4);
        assert_eq!(
            backend.submitted_passes(),
            vec!["shadows", "lit", "ui", "compose"]
        );
    }

    #[test]
    fn test_create_or_resize_is_idempotent() {
        let (backend, device) = setup(2);
        let logic = CountingLogic::new();

        let mut renderer = Renderer::new();
        renderer.add_step(
            RenderStep::new("main", logic.clone())
                .attach(color_attachment("color"))
                .present(),
        );
        let root = create_graph(&renderer, &device, ColorFormat::Bgra8Unorm).unwrap();
        let views = surface_views(&backend, 2, UVec2::new(32, 32));

        root.create_or_resize(UVec2::new(32, 32), &views, false)
            .unwrap();
        let after_first = backend.alive_image_views() + backend.alive_framebuffers();
        assert_eq!(logic.resizes.load(Ordering::SeqCst), 1);

        // Same resolution next frame: nothing is recreated, nothing retired.
        root.reset_for_next_frame();
        root.create_or_resize(UVec2::new(32, 32), &views, false)
            .unwrap();
        assert_eq!(
            backend.alive_image_views() + backend.alive_framebuffers(),
            after_first
        );
        assert_eq!(logic.resizes.load(Ordering::SeqCst), 1);
        assert_eq!(device.pending_destruction(device.current_image()), 0);
    }

    #[test]
    fn test_force_rebuild_retires_old_resources() {
        let (backend, device) = setup(2);
        let mut renderer = Renderer::new();
        renderer.add_step(
            RenderStep::new("main", CountingLogic::new())
                .attach(color_attachment("color"))
                .present(),
        );
        let root = create_graph(&renderer, &device, ColorFormat::Bgra8Unorm).unwrap();
        let views = surface_views(&backend, 2, UVec2::new(32, 32));

        root.create_or_resize(UVec2::new(32, 32), &views, false)
            .unwrap();
        assert_eq!(device.pending_destruction(device.current_image()), 0);

        root.reset_for_next_frame();
        root.create_or_resize(UVec2::new(32, 32), &views, true)
            .unwrap();
        // 2 views + 2 framebuffers from the first build are now pending.
        assert_eq!(device.pending_destruction(device.current_image()), 4);
    }

    #[test]
    fn test_resolution_change_rebuilds() {
        let (backend, device) = setup(2);
        let logic = CountingLogic::new();
        let mut renderer = Renderer::new();
        renderer.add_step(
            RenderStep::new("main", logic.clone())
                .attach(color_attachment("color"))
                .present(),
        );
        let root = create_graph(&renderer, &device, ColorFormat::Bgra8Unorm).unwrap();
        let views = surface_views(&backend, 2, UVec2::new(32, 32));

        root.create_or_resize(UVec2::new(32, 32), &views, false)
            .unwrap();
        root.reset_for_next_frame();
        root.create_or_resize(UVec2::new(64, 64), &views, false)
            .unwrap();

        assert_eq!(root.resolution(), UVec2::new(64, 64));
        assert_eq!(logic.resizes.load(Ordering::SeqCst), 2);
        assert!(device.pending_destruction(device.current_image()) > 0);
    }

    #[test]
    fn test_fixed_resolution_ignores_surface_size() {
        let (backend, device) = setup(1);
        let mut renderer = Renderer::new();
        let shadows = renderer.add_step(
            RenderStep::new("shadows", CountingLogic::new())
                .attach(color_attachment("map"))
                .resolution(UVec2::new(1024, 1024)),
        );
        let root = renderer.add_step(RenderStep::new("compose", CountingLogic::new()).present());
        renderer.add_dependency(root, shadows);

        let root = create_graph(&renderer, &device, ColorFormat::Bgra8Unorm).unwrap();
        let views = surface_views(&backend, 1, UVec2::new(640, 480));
        root.create_or_resize(UVec2::new(640, 480), &views, false)
            .unwrap();

        assert_eq!(root.dependencies()[0].resolution(), UVec2::new(1024, 1024));
        assert_eq!(root.resolution(), UVec2::new(640, 480));
    }

    #[test]
    fn test_buffer_and_image_lookup_misses_are_soft() {
        let (_backend, device) = setup(1);
        let mut renderer = Renderer::new();
        renderer.add_step(
            RenderStep::new("main", CountingLogic::new())
                .attach(color_attachment("color"))
                .present(),
        );
        let root = create_graph(&renderer, &device, ColorFormat::Bgra8Unorm).unwrap();

        assert!(root.buffer("missing").upgrade().is_none());
        assert!(root.image("missing").upgrade().is_none());
        // "color" exists in the definition but has no resources yet.
        assert!(root.image("color").upgrade().is_none());
    }

    #[test]
    fn test_custom_passes_record_after_main_logic() {
        let (backend, device) = setup(1);
        let main_logic = CountingLogic::new();
        let custom_logic = CountingLogic::new();

        let mut renderer = Renderer::new();
        renderer.add_step(
            RenderStep::new("main", main_logic.clone())
                .attach(color_attachment("color"))
                .present(),
        );
        let root = create_graph(&renderer, &device, ColorFormat::Bgra8Unorm).unwrap();
        root.add_custom_pass("debug-overlay", custom_logic.clone());

        let views = surface_views(&backend, 1, UVec2::new(16, 16));
        root.create_or_resize(UVec2::new(16, 16), &views, false)
            .unwrap();
        root.render(0, None);
        assert_eq!(custom_logic.records.load(Ordering::SeqCst), 1);
        // One submission; custom passes piggyback on the host pass.
        assert_eq!(backend.submission_count(), 1);

        root.remove_custom_pass("debug-overlay");
        root.reset_for_next_frame();
        root.create_or_resize(UVec2::new(16, 16), &views, false)
            .unwrap();
        root.render(0, None);
        assert_eq!(custom_logic.records.load(Ordering::SeqCst), 1);
        assert_eq!(main_logic.records.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_non_present_step_without_attachments_rejected() {
        let (_backend, device) = setup(1);
        let mut renderer = Renderer::new();
        let bare = renderer.add_step(RenderStep::new("bare", CountingLogic::new()));
        let root = renderer.add_step(RenderStep::new("compose", CountingLogic::new()).present());
        renderer.add_dependency(root, bare);

        let result = create_graph(&renderer, &device, ColorFormat::Bgra8Unorm);
        assert!(matches!(result, Err(GraphicsError::InvalidGraph(_))));
    }

    struct SplitLogic {
        chunks: AtomicUsize,
        serial: AtomicUsize,
    }

    impl SplitLogic {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                chunks: AtomicUsize::new(0),
                serial: AtomicUsize::new(0),
            })
        }
    }

    impl RenderPassLogic for SplitLogic {
        fn record(&self, _ctx: &mut RecordContext) {
            self.serial.fetch_add(1, Ordering::SeqCst);
        }

        fn record_threads(&self) -> usize {
            3
        }

        fn record_chunk(&self, ctx: &ChunkContext) {
            assert!(ctx.thread_index() < ctx.thread_count());
            self.chunks.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_split_recording_dispatches_chunks_to_queue() {
        let (backend, device) = setup(1);
        let logic = SplitLogic::new();
        let mut renderer = Renderer::new();
        renderer.add_step(
            RenderStep::new("main", logic.clone())
                .attach(color_attachment("color"))
                .present(),
        );
        let root = create_graph(&renderer, &device, ColorFormat::Bgra8Unorm).unwrap();
        root.set_job_queue(Arc::new(crate::jobs::JobQueue::new(2)));

        let views = surface_views(&backend, 1, UVec2::new(16, 16));
        root.create_or_resize(UVec2::new(16, 16), &views, false)
            .unwrap();
        root.render(0, None);

        // Split recording replaces the serial record call and still ends
        // in one submission.
        assert_eq!(logic.chunks.load(Ordering::SeqCst), 3);
        assert_eq!(logic.serial.load(Ordering::SeqCst), 0);
        assert_eq!(backend.submission_count(), 1);
    }

    #[test]
    fn test_split_recording_without_queue_runs_inline() {
        let (backend, device) = setup(1);
        let logic = SplitLogic::new();
        let mut renderer = Renderer::new();
        renderer.add_step(
            RenderStep::new("main", logic.clone())
                .attach(color_attachment("color"))
                .present(),
        );
        let root = create_graph(&renderer, &device, ColorFormat::Bgra8Unorm).unwrap();

        let views = surface_views(&backend, 1, UVec2::new(16, 16));
        root.create_or_resize(UVec2::new(16, 16), &views, false)
            .unwrap();
        root.render(0, None);

        assert_eq!(logic.chunks.load(Ordering::SeqCst), 3);
        assert_eq!(logic.serial.load(Ordering::SeqCst), 0);
        assert_eq!(backend.submission_count(), 1);
    }

    #[test]
    #[should_panic(expected = "rendered before create_or_resize")]
    fn test_render_without_prepare_panics() {
        let (_backend, device) = setup(1);
        let mut renderer = Renderer::new();
        renderer.add_step(
            RenderStep::new("main", CountingLogic::new())
                .attach(color_attachment("color"))
                .present(),
        );
        let root = create_graph(&renderer, &device, ColorFormat::Bgra8Unorm).unwrap();
        root.render(0, None);
    }
}
