use crate::core::gfx::texture::TextureFormat;
use thiserror::Error;

/// Every recoverable failure the gfx core reports. Nothing here is fatal: callers decide
/// whether to skip the frame, fall back, or retry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GfxError {
    #[error("no graphics context is bound on this thread")]
    NoContext,
    #[error("this thread's render state is already in use further up the call stack")]
    RenderStateBusy,
    #[error("platform binding failed: {0}")]
    Platform(String),
    #[error("failed to create GL object: {0}")]
    ObjectCreation(String),
    #[error("proxy render targets do not own attachments")]
    ProxyTarget,
    #[error("texture format {0:?} is not valid for this attachment")]
    UnsupportedFormat(TextureFormat),
    #[error("invalid size {width}x{height}")]
    InvalidSize { width: u32, height: u32 },
    #[error("{requested} color attachments requested, device supports {max}")]
    TooManyColorAttachments { requested: usize, max: usize },
    #[error("framebuffer incomplete (status 0x{0:x})")]
    IncompleteFramebuffer(u32),
    #[error("a framebuffer is already registered for this target on this thread")]
    FramebufferAlreadyRegistered,
    #[error("render target has no color attachment {0}")]
    NoSuchAttachment(usize),
    #[error("resolution mismatch: expected {expected:?}, found {found:?}")]
    ResolutionMismatch {
        expected: (u32, u32),
        found: (u32, u32),
    },
}
