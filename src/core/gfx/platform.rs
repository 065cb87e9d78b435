use crate::core::gfx::GfxError;
use crate::core::gfx::device::Device;
use raw_window_handle::{HasWindowHandle, RawWindowHandle};
use std::sync::Arc;
use winit::window::Window;

/// The window surface a thread wants to draw to. Threads that only render offscreen bind
/// with `None`.
#[derive(Clone, Copy, Debug)]
pub struct WindowTarget {
    pub window: RawWindowHandle,
    pub width: u32,
    pub height: u32,
}

impl WindowTarget {
    pub fn from_window(window: &Window) -> Result<Self, GfxError> {
        let handle = window
            .window_handle()
            .map_err(|e| GfxError::Platform(e.to_string()))?;
        let size = window.inner_size();
        Ok(Self {
            window: handle.as_raw(),
            width: size.width.max(1),
            height: size.height.max(1),
        })
    }
}

/// Window-system glue for one context group. Every method acts on the calling thread: `bind`
/// makes a context of the group current here, `unbind` releases it, and so on. The
/// `GraphicsContext` refcounts nested binds, so an implementation sees at most one `bind`
/// per thread before the matching `unbind`.
pub trait PlatformBinding: Send + Sync {
    fn name(&self) -> &'static str;

    fn bind(&self, target: Option<&WindowTarget>) -> Result<(), String>;
    fn unbind(&self) -> Result<(), String>;
    fn is_bound(&self) -> bool;

    /// Function table for the context current on this thread.
    fn device(&self) -> Option<Arc<dyn Device>>;

    fn flush(&self);
    fn finish(&self);
    /// Swaps the window surface. Only the thread owning the window may present.
    fn present(&self) -> Result<(), String>;
    /// Returns `true` when the surface was lost and the context had to be re-established;
    /// cached state must be considered stale afterwards.
    fn update(&self) -> bool;
    /// Follows a window resize on this thread's surface.
    fn resize_surface(&self, _width: u32, _height: u32) {}

    fn swap_interval(&self) -> bool;
    fn set_swap_interval(&self, vsync: bool) -> Result<(), String>;

    /// Native name of the default framebuffer for this thread's surface (0 on desktop GL).
    fn framebuffer_id(&self) -> u32;
}
