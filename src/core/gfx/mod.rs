pub mod backends;
pub mod context;
pub mod device;
pub mod error;
pub mod framebuffer;
pub mod platform;
pub mod state;
pub mod target;
pub mod texture;

use crate::core::gfx::backends::{opengl, recording};
use std::{str::FromStr, sync::Arc};
use winit::window::Window;

pub use context::{ContextGuard, GraphicsContext, PendingRelease, SharedRenderState};
pub use device::Device;
pub use error::GfxError;
pub use framebuffer::{FramebufferRegistry, TargetKey};
pub use platform::{PlatformBinding, WindowTarget};
pub use state::{
    BlendEquation, BlendFactor, BlendFunc, Capability, CompareFunc, CullFace, DeviceLimits,
    EnableFlags, FrontFace, GlError, Rect, RenderStateCache, TextureTarget,
};
pub use target::{DepthFormat, RenderTarget, TargetQuery};
pub use texture::{Texture2D, TextureFormat, TextureSource};

// --- Public API Facade ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendType {
    OpenGL,
    Recording,
}

/// Creates the context group for `backend_type`. OpenGL needs the window to find a display
/// and pixel format; the recording backend runs headless and ignores it.
pub fn create_context(
    backend_type: BackendType,
    window: Option<&Window>,
    vsync_enabled: bool,
    gfx_debug_enabled: bool,
) -> Result<GraphicsContext, GfxError> {
    let platform: Box<dyn PlatformBinding> = match backend_type {
        BackendType::OpenGL => {
            let window = window.ok_or_else(|| {
                GfxError::Platform("the OpenGL backend needs a window".to_string())
            })?;
            Box::new(
                opengl::GlutinPlatform::new(window, vsync_enabled, gfx_debug_enabled)
                    .map_err(GfxError::Platform)?,
            )
        }
        BackendType::Recording => {
            let platform = recording::RecordingPlatform::new(Arc::new(
                recording::RecordingDevice::new(),
            ));
            if let Err(e) = platform.set_swap_interval(vsync_enabled) {
                log::warn!("Recording backend rejected swap interval: {e}");
            }
            Box::new(platform)
        }
    };
    Ok(GraphicsContext::new(platform))
}

// -- Boilerplate impls --
impl core::fmt::Display for BackendType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::OpenGL => write!(f, "OpenGL"),
            Self::Recording => write!(f, "Recording"),
        }
    }
}
impl FromStr for BackendType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "opengl" | "gl" => Ok(Self::OpenGL),
            "recording" | "headless" | "null" => Ok(Self::Recording),
            _ => Err(format!("'{s}' is not a valid video renderer")),
        }
    }
}
