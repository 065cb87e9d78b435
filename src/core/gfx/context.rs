use crate::core::gfx::GfxError;
use crate::core::gfx::framebuffer::FramebufferRegistry;
use crate::core::gfx::platform::{PlatformBinding, WindowTarget};
use crate::core::gfx::state::RenderStateCache;
use log::{debug, error, info, warn};
use parking_lot::{Mutex, MutexGuard};
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::thread::{self, ThreadId};

/// A thread's render-state cache. Only the owning thread ever locks it, so a lock that is
/// already held means re-entry and is reported as `GfxError::RenderStateBusy`.
pub type SharedRenderState = Arc<Mutex<RenderStateCache>>;

/// A GL object whose owner let go of it while the thread's render state was in use. It is
/// deleted the next time that thread takes its render state, or when it unbinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PendingRelease {
    Texture(u32),
    Renderbuffer(u32),
}

struct ThreadBinding {
    count: usize,
    state: SharedRenderState,
    releases: Vec<PendingRelease>,
}

fn lock_state(shared: &SharedRenderState) -> Result<MutexGuard<'_, RenderStateCache>, GfxError> {
    shared.try_lock().ok_or_else(|| {
        warn!(
            "Render state on {:?} is already in use; refusing re-entrant access.",
            thread::current().id()
        );
        GfxError::RenderStateBusy
    })
}

struct ContextInner {
    platform: Box<dyn PlatformBinding>,
    bindings: Mutex<FxHashMap<ThreadId, ThreadBinding>>,
    framebuffers: FramebufferRegistry,
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        let bound = self.bindings.get_mut().len();
        if bound > 0 {
            warn!("Graphics context dropped while still bound on {bound} thread(s).");
        }
    }
}

/// One logical connection to the GPU, bindable from any number of threads at once. Each
/// bound thread gets its own render-state cache and its own set of framebuffer objects.
///
/// Cloning is cheap and yields another handle to the same context.
#[derive(Clone)]
pub struct GraphicsContext {
    inner: Arc<ContextInner>,
}

impl GraphicsContext {
    pub fn new(platform: Box<dyn PlatformBinding>) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                platform,
                bindings: Mutex::new(FxHashMap::default()),
                framebuffers: FramebufferRegistry::new(),
            }),
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.inner.platform.name()
    }

    /// Makes the context current on the calling thread. Nested binds only bump a counter.
    pub fn bind(&self, target: Option<&WindowTarget>) -> Result<(), GfxError> {
        let thread = thread::current().id();
        if let Some(binding) = self.inner.bindings.lock().get_mut(&thread) {
            binding.count += 1;
            return Ok(());
        }

        let platform = &self.inner.platform;
        if let Err(e) = platform.bind(target) {
            error!("Failed to bind {} context on {thread:?}: {e}", platform.name());
            return Err(GfxError::Platform(e));
        }
        let Some(device) = platform.device() else {
            error!("{} context bound without a device on {thread:?}.", platform.name());
            let _ = platform.unbind();
            return Err(GfxError::Platform("no device for bound context".to_string()));
        };

        let mut state = RenderStateCache::new(device);
        if let Err(e) = state.reset() {
            error!("Render state reset failed on {thread:?}: {e}");
            let _ = platform.unbind();
            return Err(e);
        }

        self.inner.bindings.lock().insert(
            thread,
            ThreadBinding {
                count: 1,
                state: Arc::new(Mutex::new(state)),
                releases: Vec::new(),
            },
        );
        info!("Bound {} context on {thread:?}.", platform.name());
        Ok(())
    }

    pub fn unbind(&self) -> Result<(), GfxError> {
        let thread = thread::current().id();
        let shared = {
            let mut bindings = self.inner.bindings.lock();
            match bindings.get_mut(&thread) {
                None => {
                    warn!("unbind called on {thread:?}, which has no bound context.");
                    return Err(GfxError::NoContext);
                }
                Some(binding) if binding.count > 1 => {
                    binding.count -= 1;
                    return Ok(());
                }
                Some(binding) => Arc::clone(&binding.state),
            }
        };

        {
            // Stays bound when the state is busy; the caller may retry once it is released.
            let mut state = lock_state(&shared)?;
            self.delete_pending_releases(&mut state);
            self.inner.bindings.lock().remove(&thread);
            self.inner.framebuffers.clear_thread(&mut state);
            state.release();
            state.finish();
        }

        let platform = &self.inner.platform;
        platform.unbind().map_err(|e| {
            error!("Failed to unbind {} context on {thread:?}: {e}", platform.name());
            GfxError::Platform(e)
        })?;
        info!("Unbound {} context on {thread:?}.", platform.name());
        Ok(())
    }

    /// Binds for the lifetime of the returned guard.
    pub fn bind_scoped(&self, target: Option<&WindowTarget>) -> Result<ContextGuard<'_>, GfxError> {
        self.bind(target)?;
        Ok(ContextGuard { context: self })
    }

    pub fn is_bound(&self) -> bool {
        self.inner
            .bindings
            .lock()
            .contains_key(&thread::current().id())
    }

    pub fn bound_thread_count(&self) -> usize {
        self.inner.bindings.lock().len()
    }

    /// Nesting depth of `bind` on the calling thread.
    pub fn bind_count(&self) -> usize {
        self.inner
            .bindings
            .lock()
            .get(&thread::current().id())
            .map_or(0, |b| b.count)
    }

    pub fn render_state(&self) -> Result<SharedRenderState, GfxError> {
        self.inner
            .bindings
            .lock()
            .get(&thread::current().id())
            .map(|b| Arc::clone(&b.state))
            .ok_or(GfxError::NoContext)
    }

    /// Runs `f` on this thread's render state. Calling back into anything that needs the
    /// state from inside `f` yields `GfxError::RenderStateBusy` instead of blocking.
    pub fn with_render_state<R>(
        &self,
        f: impl FnOnce(&mut RenderStateCache) -> R,
    ) -> Result<R, GfxError> {
        let shared = self.render_state()?;
        let mut state = lock_state(&shared)?;
        self.delete_pending_releases(&mut state);
        Ok(f(&mut state))
    }

    /// Queues `object` for deletion on this thread. Used by owners dropped while the render
    /// state was busy.
    pub fn release_later(&self, object: PendingRelease) -> Result<(), GfxError> {
        let mut bindings = self.inner.bindings.lock();
        let binding = bindings
            .get_mut(&thread::current().id())
            .ok_or(GfxError::NoContext)?;
        debug!("Deferring release of {object:?}.");
        binding.releases.push(object);
        Ok(())
    }

    /// Objects queued by `release_later` on the calling thread.
    pub fn pending_release_count(&self) -> usize {
        self.inner
            .bindings
            .lock()
            .get(&thread::current().id())
            .map_or(0, |b| b.releases.len())
    }

    pub fn framebuffers(&self) -> &FramebufferRegistry {
        &self.inner.framebuffers
    }

    pub fn flush(&self) -> Result<(), GfxError> {
        self.require_bound()?;
        self.inner.platform.flush();
        Ok(())
    }

    pub fn finish(&self) -> Result<(), GfxError> {
        self.require_bound()?;
        self.inner.platform.finish();
        Ok(())
    }

    pub fn present(&self) -> Result<(), GfxError> {
        self.require_bound()?;
        self.inner.platform.present().map_err(GfxError::Platform)
    }

    /// Polls the platform; when the surface had to be re-established the thread's
    /// framebuffers are dropped and its render state is reset. Returns whether that happened.
    pub fn update(&self) -> Result<bool, GfxError> {
        let shared = self.render_state()?;
        let mut state = lock_state(&shared)?;
        if !self.inner.platform.update() {
            return Ok(false);
        }
        warn!("Surface invalidated on {:?}; resetting render state.", thread::current().id());
        self.delete_pending_releases(&mut state);
        self.inner.framebuffers.clear_thread(&mut state);
        state.reset()?;
        Ok(true)
    }

    pub fn reset_render_state(&self) -> Result<(), GfxError> {
        let shared = self.render_state()?;
        let mut state = lock_state(&shared)?;
        self.delete_pending_releases(&mut state);
        self.inner.framebuffers.clear_thread(&mut state);
        state.reset()
    }

    pub fn resize_surface(&self, width: u32, height: u32) -> Result<(), GfxError> {
        self.require_bound()?;
        self.inner.platform.resize_surface(width, height);
        Ok(())
    }

    pub fn swap_interval(&self) -> bool {
        self.inner.platform.swap_interval()
    }

    pub fn set_swap_interval(&self, vsync: bool) -> Result<(), GfxError> {
        self.require_bound()?;
        self.inner
            .platform
            .set_swap_interval(vsync)
            .map_err(GfxError::Platform)
    }

    pub fn framebuffer_id(&self) -> u32 {
        self.inner.platform.framebuffer_id()
    }

    fn delete_pending_releases(&self, state: &mut RenderStateCache) {
        let releases = match self.inner.bindings.lock().get_mut(&thread::current().id()) {
            Some(binding) if !binding.releases.is_empty() => {
                std::mem::take(&mut binding.releases)
            }
            _ => return,
        };
        for object in releases {
            match object {
                PendingRelease::Texture(texture) => state.delete_texture(texture),
                PendingRelease::Renderbuffer(renderbuffer) => {
                    state.delete_renderbuffer(renderbuffer);
                }
            }
        }
    }

    fn require_bound(&self) -> Result<(), GfxError> {
        if self.is_bound() {
            Ok(())
        } else {
            Err(GfxError::NoContext)
        }
    }
}

/// Unbinds its context when dropped.
pub struct ContextGuard<'a> {
    context: &'a GraphicsContext,
}

impl ContextGuard<'_> {
    pub fn context(&self) -> &GraphicsContext {
        self.context
    }
}

impl Drop for ContextGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.context.unbind() {
            error!("Scoped unbind failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::gfx::backends::recording::{GlCall, RecordingDevice, RecordingPlatform};
    use crate::core::gfx::framebuffer::TargetKey;
    use raw_window_handle::{RawWindowHandle, WebWindowHandle};

    fn window_target() -> WindowTarget {
        WindowTarget {
            window: RawWindowHandle::Web(WebWindowHandle::new(1)),
            width: 640,
            height: 480,
        }
    }

    fn recording_context() -> (RecordingPlatform, GraphicsContext) {
        let platform = RecordingPlatform::new(Arc::new(RecordingDevice::new()));
        let context = GraphicsContext::new(Box::new(platform.clone()));
        (platform, context)
    }

    #[test]
    fn nested_binds_touch_the_platform_once() {
        let (platform, context) = recording_context();

        context.bind(None).expect("first bind");
        context.bind(None).expect("nested bind");
        assert_eq!(context.bind_count(), 2);
        assert_eq!(platform.bind_calls(), 1);

        context.unbind().expect("inner unbind");
        assert!(context.is_bound());
        assert_eq!(platform.unbind_calls(), 0);

        context.unbind().expect("outer unbind");
        assert!(!context.is_bound());
        assert_eq!(platform.unbind_calls(), 1);
        assert_eq!(context.unbind(), Err(GfxError::NoContext));
    }

    #[test]
    fn render_state_requires_a_bound_thread() {
        let (_platform, context) = recording_context();
        assert!(matches!(context.render_state(), Err(GfxError::NoContext)));
        assert_eq!(context.flush(), Err(GfxError::NoContext));
        assert_eq!(context.present(), Err(GfxError::NoContext));
        assert_eq!(context.update(), Err(GfxError::NoContext));
    }

    #[test]
    fn each_thread_gets_its_own_render_state() {
        let (_platform, context) = recording_context();
        context.bind(None).expect("bind main");
        context
            .with_render_state(|s| s.use_program(5))
            .expect("main state");

        thread::scope(|s| {
            s.spawn(|| {
                context.bind(None).expect("bind worker");
                assert_eq!(context.bound_thread_count(), 2);
                let program = context.with_render_state(|s| s.program()).expect("worker state");
                assert_eq!(program, 0);
                context.unbind().expect("unbind worker");
            });
        });

        assert_eq!(context.bound_thread_count(), 1);
        let program = context.with_render_state(|s| s.program()).expect("main state");
        assert_eq!(program, 5);
        context.unbind().expect("unbind main");
    }

    #[test]
    fn platform_failure_leaves_thread_unbound() {
        let platform = RecordingPlatform::new(Arc::new(RecordingDevice::new()));
        platform.fail_binds("no pixel format");
        let context = GraphicsContext::new(Box::new(platform.clone()));

        assert_eq!(
            context.bind(None),
            Err(GfxError::Platform("no pixel format".to_string()))
        );
        assert!(!context.is_bound());
        assert_eq!(context.bound_thread_count(), 0);
    }

    #[test]
    fn final_unbind_deletes_the_threads_framebuffers() {
        let (platform, context) = recording_context();
        context.bind(None).expect("bind");
        let key = TargetKey::next();
        context
            .with_render_state(|s| context.framebuffers().register(s, key, 77))
            .expect("state")
            .expect("register");
        let default_va = context
            .with_render_state(|s| s.default_vertex_array())
            .expect("state");

        context.unbind().expect("unbind");
        let device = platform.device_handle();
        assert_eq!(
            device.count(|c| matches!(c, GlCall::DeleteFramebuffers(fbs) if fbs == &vec![77])),
            1
        );
        assert_eq!(
            device.count(|c| matches!(c, GlCall::DeleteVertexArray(id) if *id == default_va)),
            1
        );
        assert_eq!(context.framebuffers().live_count(thread::current().id()), 0);
    }

    #[test]
    fn update_resets_state_after_surface_loss() {
        let (platform, context) = recording_context();
        context.bind(None).expect("bind");
        context
            .with_render_state(|s| s.use_program(3))
            .expect("state");

        assert_eq!(context.update(), Ok(false));
        platform.invalidate_surface();
        assert_eq!(context.update(), Ok(true));
        let program = context.with_render_state(|s| s.program()).expect("state");
        assert_eq!(program, 0);
        context.unbind().expect("unbind");
    }

    #[test]
    fn guard_unbinds_on_drop() {
        let (platform, context) = recording_context();
        {
            let guard = context.bind_scoped(None).expect("scoped bind");
            assert!(guard.context().is_bound());
        }
        assert!(!context.is_bound());
        assert_eq!(platform.unbind_calls(), 1);
    }

    #[test]
    fn only_the_window_thread_can_present() {
        let (platform, context) = recording_context();
        context.bind(Some(&window_target())).expect("bind window");

        thread::scope(|s| {
            s.spawn(|| {
                context.bind(None).expect("bind worker");
                assert!(matches!(context.present(), Err(GfxError::Platform(_))));
                context.unbind().expect("unbind worker");
            });
        });
        assert_eq!(platform.present_calls(), 0);

        context.present().expect("present from the window thread");
        assert_eq!(platform.present_calls(), 1);
        context.unbind().expect("unbind");
    }

    #[test]
    fn bind_survives_a_device_error_raised_before_reset() {
        let _ = env_logger::builder().is_test(true).try_init();
        let device = Arc::new(RecordingDevice::new());
        device.raise_error(glow::INVALID_ENUM);
        let context = GraphicsContext::new(Box::new(RecordingPlatform::new(device.clone())));

        context.bind(None).expect("bind reports the error but succeeds");
        let leftover = context.with_render_state(|s| s.check_error()).expect("state");
        assert_eq!(leftover, None);
        context.unbind().expect("unbind");
    }

    #[test]
    fn surface_loss_resets_every_bound_thread() {
        let (platform, context) = recording_context();
        context.bind(None).expect("bind main");
        context
            .with_render_state(|s| s.use_program(4))
            .expect("state");

        thread::scope(|s| {
            s.spawn(|| {
                context.bind(None).expect("bind worker");
                platform.invalidate_surface();
                assert_eq!(context.update(), Ok(true));
                context.unbind().expect("unbind worker");
            });
        });

        assert_eq!(context.update(), Ok(true));
        let program = context.with_render_state(|s| s.program()).expect("state");
        assert_eq!(program, 0);
        context.unbind().expect("unbind main");
    }

    #[test]
    fn nested_state_access_is_refused_and_unbind_keeps_the_binding() {
        let (platform, context) = recording_context();
        context.bind(None).expect("bind");

        let nested = context
            .with_render_state(|_| context.with_render_state(|s| s.program()))
            .expect("outer state");
        assert_eq!(nested, Err(GfxError::RenderStateBusy));

        let unbound = context
            .with_render_state(|_| context.unbind())
            .expect("outer state");
        assert_eq!(unbound, Err(GfxError::RenderStateBusy));
        assert!(context.is_bound());
        assert_eq!(platform.unbind_calls(), 0);

        context.unbind().expect("unbind");
    }

    #[test]
    fn released_objects_are_deleted_on_next_state_access() {
        let (platform, context) = recording_context();
        context.bind(None).expect("bind");
        let device = platform.device_handle();

        context
            .with_render_state(|_| {
                context.release_later(PendingRelease::Texture(31)).expect("texture");
                context
                    .release_later(PendingRelease::Renderbuffer(32))
                    .expect("renderbuffer");
            })
            .expect("state");
        assert_eq!(context.pending_release_count(), 2);
        assert_eq!(device.count(|c| *c == GlCall::DeleteTexture(31)), 0);

        context.with_render_state(|_| ()).expect("state");
        assert_eq!(context.pending_release_count(), 0);
        assert_eq!(device.count(|c| *c == GlCall::DeleteTexture(31)), 1);
        assert_eq!(device.count(|c| *c == GlCall::DeleteRenderbuffer(32)), 1);
        context.unbind().expect("unbind");

        assert_eq!(
            context.release_later(PendingRelease::Texture(33)),
            Err(GfxError::NoContext)
        );
    }
}
