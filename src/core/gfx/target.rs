//! Render targets: a set of color attachments plus an optional depth source, resolved lazily
//! to one native framebuffer per thread.

use crate::core::gfx::framebuffer::TargetKey;
use crate::core::gfx::state::{RenderStateCache, TextureTarget};
use crate::core::gfx::texture::{Texture2D, TextureFormat, TextureSource};
use crate::core::gfx::{GfxError, GraphicsContext, PendingRelease};
use log::{debug, error, warn};
use smallvec::SmallVec;
use std::sync::Arc;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DepthFormat {
    #[default]
    None,
    Depth16,
    Depth24,
    Depth32,
}

impl DepthFormat {
    pub const fn texture_format(self) -> Option<TextureFormat> {
        match self {
            Self::None => None,
            Self::Depth16 => Some(TextureFormat::Depth16),
            Self::Depth24 => Some(TextureFormat::Depth24),
            Self::Depth32 => Some(TextureFormat::Depth32),
        }
    }

    pub const fn from_texture_format(format: TextureFormat) -> Self {
        match format {
            TextureFormat::Depth16 => Self::Depth16,
            TextureFormat::Depth24 => Self::Depth24,
            TextureFormat::Depth32 => Self::Depth32,
            _ => Self::None,
        }
    }
}

/// What a proxy target reports about the surface it mirrors.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TargetQuery {
    pub width: u32,
    pub height: u32,
    pub depth: DepthFormat,
    pub framebuffer: u32,
}

type ProxyQuery = Box<dyn Fn() -> TargetQuery + Send + Sync>;

enum DepthSlot {
    None,
    Texture(Arc<dyn TextureSource>),
    Buffer {
        renderbuffer: u32,
        format: DepthFormat,
        width: u32,
        height: u32,
    },
}

enum TargetKind {
    Owned {
        color: SmallVec<[Arc<dyn TextureSource>; 4]>,
        depth: DepthSlot,
    },
    Proxy(ProxyQuery),
}

/// Reconfiguring takes `&mut self`; validating and binding take `&self`, so a target behind
/// an `Arc` can be bound from every thread while changes to its attachments stay serialized.
pub struct RenderTarget {
    key: TargetKey,
    context: GraphicsContext,
    kind: TargetKind,
}

impl RenderTarget {
    pub fn new(context: &GraphicsContext) -> Self {
        Self {
            key: TargetKey::next(),
            context: context.clone(),
            kind: TargetKind::Owned {
                color: SmallVec::new(),
                depth: DepthSlot::None,
            },
        }
    }

    /// An RGBA color texture plus a depth render-buffer, both `width`x`height`. Needs a
    /// context bound on the calling thread.
    pub fn create(
        context: &GraphicsContext,
        width: u32,
        height: u32,
        depth: DepthFormat,
    ) -> Result<Self, GfxError> {
        let color: Arc<dyn TextureSource> =
            Arc::new(Texture2D::create(context, width, height, TextureFormat::Rgba)?);
        let mut target = Self::new(context);
        target.set_color_textures(&[color])?;
        target.set_depth_buffer(width, height, depth)?;
        Ok(target)
    }

    /// A target that mirrors a surface managed elsewhere, typically the window's default
    /// framebuffer. It owns no attachments and never registers framebuffers.
    pub fn proxy(
        context: &GraphicsContext,
        query: impl Fn() -> TargetQuery + Send + Sync + 'static,
    ) -> Self {
        Self {
            key: TargetKey::next(),
            context: context.clone(),
            kind: TargetKind::Proxy(Box::new(query)),
        }
    }

    pub const fn key(&self) -> TargetKey {
        self.key
    }

    pub fn context(&self) -> &GraphicsContext {
        &self.context
    }

    pub const fn is_proxy(&self) -> bool {
        matches!(self.kind, TargetKind::Proxy(_))
    }

    pub fn set_color_textures(
        &mut self,
        textures: &[Arc<dyn TextureSource>],
    ) -> Result<(), GfxError> {
        let TargetKind::Owned { color, .. } = &self.kind else {
            warn!("Color textures cannot be attached to a proxy render target.");
            return Err(GfxError::ProxyTarget);
        };
        if color.is_empty() && textures.is_empty() {
            return Ok(());
        }
        if let Some(bad) = textures.iter().find(|t| !t.format().is_color()) {
            warn!("Rejecting {:?} texture as a color attachment.", bad.format());
            return Err(GfxError::UnsupportedFormat(bad.format()));
        }
        if let Ok(max) = self.context.with_render_state(|s| Self::max_color_textures(s))
            && textures.len() > max
        {
            warn!("{} color attachments requested, device supports {max}.", textures.len());
            return Err(GfxError::TooManyColorAttachments {
                requested: textures.len(),
                max,
            });
        }

        self.invalidate();
        if let TargetKind::Owned { color, .. } = &mut self.kind {
            *color = textures.iter().cloned().collect();
        }
        Ok(())
    }

    /// Sets (or with `None` removes) the depth texture. Any depth render-buffer is released.
    pub fn set_depth_texture(
        &mut self,
        texture: Option<Arc<dyn TextureSource>>,
    ) -> Result<(), GfxError> {
        let TargetKind::Owned { depth, .. } = &self.kind else {
            warn!("A depth texture cannot be attached to a proxy render target.");
            return Err(GfxError::ProxyTarget);
        };
        match (&texture, depth) {
            (Some(t), _) if !t.format().is_depth() => {
                warn!("Rejecting {:?} texture as a depth attachment.", t.format());
                return Err(GfxError::UnsupportedFormat(t.format()));
            }
            (Some(t), DepthSlot::Texture(current)) if Arc::ptr_eq(t, current) => return Ok(()),
            (None, DepthSlot::None) => return Ok(()),
            _ => {}
        }

        self.invalidate();
        let slot = texture.map_or(DepthSlot::None, DepthSlot::Texture);
        let old = self.replace_depth(slot);
        self.release_depth(old);
        Ok(())
    }

    /// Gives the target its own depth render-buffer, or removes depth with
    /// `DepthFormat::None`. Any depth texture is detached.
    pub fn set_depth_buffer(
        &mut self,
        width: u32,
        height: u32,
        format: DepthFormat,
    ) -> Result<(), GfxError> {
        let TargetKind::Owned { depth, .. } = &self.kind else {
            warn!("A depth buffer cannot be attached to a proxy render target.");
            return Err(GfxError::ProxyTarget);
        };

        let Some(texture_format) = format.texture_format() else {
            if matches!(depth, DepthSlot::None) {
                return Ok(());
            }
            self.invalidate();
            let old = self.replace_depth(DepthSlot::None);
            self.release_depth(old);
            return Ok(());
        };

        if width == 0 || height == 0 {
            warn!("Rejecting {width}x{height} depth buffer.");
            return Err(GfxError::InvalidSize { width, height });
        }
        if let DepthSlot::Buffer {
            format: f,
            width: w,
            height: h,
            ..
        } = depth
            && (*f, *w, *h) == (format, width, height)
        {
            return Ok(());
        }

        let renderbuffer = self.context.with_render_state(|state| {
            let device = state.device();
            let renderbuffer = device
                .create_renderbuffer()
                .map_err(GfxError::ObjectCreation)?;
            device.bind_renderbuffer(glow::RENDERBUFFER, renderbuffer);
            device.renderbuffer_storage(
                glow::RENDERBUFFER,
                texture_format.internal_format(),
                width as i32,
                height as i32,
            );
            device.bind_renderbuffer(glow::RENDERBUFFER, 0);
            Ok::<_, GfxError>(renderbuffer)
        })??;

        self.invalidate();
        let old = self.replace_depth(DepthSlot::Buffer {
            renderbuffer,
            format,
            width,
            height,
        });
        self.release_depth(old);
        Ok(())
    }

    pub fn color_texture(&self, index: usize) -> Option<&Arc<dyn TextureSource>> {
        match &self.kind {
            TargetKind::Owned { color, .. } => color.get(index),
            TargetKind::Proxy(_) => None,
        }
    }

    pub fn color_texture_count(&self) -> usize {
        match &self.kind {
            TargetKind::Owned { color, .. } => color.len(),
            TargetKind::Proxy(_) => 0,
        }
    }

    pub fn depth_texture(&self) -> Option<&Arc<dyn TextureSource>> {
        match &self.kind {
            TargetKind::Owned {
                depth: DepthSlot::Texture(t),
                ..
            } => Some(t),
            _ => None,
        }
    }

    pub fn has_depth_buffer(&self) -> bool {
        matches!(
            self.kind,
            TargetKind::Owned {
                depth: DepthSlot::Buffer { .. },
                ..
            }
        )
    }

    pub fn depth_format(&self) -> DepthFormat {
        match &self.kind {
            TargetKind::Proxy(query) => query().depth,
            TargetKind::Owned { depth, .. } => match depth {
                DepthSlot::None => DepthFormat::None,
                DepthSlot::Texture(t) => DepthFormat::from_texture_format(t.format()),
                DepthSlot::Buffer { format, .. } => *format,
            },
        }
    }

    /// Total: proxies report their query, otherwise the first color attachment wins, then
    /// the depth source, then 1x1.
    pub fn resolution(&self) -> (u32, u32) {
        let (width, height) = match &self.kind {
            TargetKind::Proxy(query) => {
                let q = query();
                (q.width, q.height)
            }
            TargetKind::Owned { color, depth } => match (color.first(), depth) {
                (Some(first), _) => first.resolution(),
                (None, DepthSlot::Texture(t)) => t.resolution(),
                (None, DepthSlot::Buffer { width, height, .. }) => (*width, *height),
                (None, DepthSlot::None) => (1, 1),
            },
        };
        (width.max(1), height.max(1))
    }

    /// Color attachments usable at once on the bound device.
    pub fn max_color_textures(state: &RenderStateCache) -> usize {
        let limits = state.limits();
        limits
            .max_color_attachments
            .min(limits.max_draw_buffers)
            .max(1) as usize
    }

    /// Makes sure this thread has a complete framebuffer for the target.
    pub fn validate(&self) -> Result<(), GfxError> {
        if self.is_proxy() {
            return Ok(());
        }
        self.context
            .with_render_state(|state| self.resolve(state).map(|_| ()))?
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }

    pub fn bind(&self) -> Result<(), GfxError> {
        self.context.with_render_state(|state| self.bind_with(state))?
    }

    /// `bind` for callers already holding this thread's render state.
    pub fn bind_with(&self, state: &mut RenderStateCache) -> Result<(), GfxError> {
        let framebuffer = self.resolve(state)?;
        state.bind_framebuffer(framebuffer);
        Ok(())
    }

    /// Copies color attachment `index` into `dst`, which must match its resolution.
    pub fn copy_color_texture(&self, index: usize, dst: &dyn TextureSource) -> Result<(), GfxError> {
        let TargetKind::Owned { color, .. } = &self.kind else {
            return Err(GfxError::ProxyTarget);
        };
        let src = color.get(index).ok_or(GfxError::NoSuchAttachment(index))?;
        if !dst.format().is_color() {
            return Err(GfxError::UnsupportedFormat(dst.format()));
        }
        let (width, height) = src.resolution();
        if dst.resolution() != (width, height) {
            return Err(GfxError::ResolutionMismatch {
                expected: (width, height),
                found: dst.resolution(),
            });
        }

        self.context.with_render_state(|state| {
            self.bind_with(state)?;
            state.bind_texture(TextureTarget::Texture2D, dst.handle());
            state.device().copy_tex_sub_image_2d(
                glow::TEXTURE_2D,
                0,
                0,
                0,
                0,
                0,
                width as i32,
                height as i32,
            );
            Ok::<_, GfxError>(())
        })?
    }

    fn resolve(&self, state: &mut RenderStateCache) -> Result<u32, GfxError> {
        let (color, depth) = match &self.kind {
            TargetKind::Proxy(query) => return Ok(query().framebuffer),
            TargetKind::Owned { color, depth } => (color, depth),
        };

        let registry = self.context.framebuffers();
        if let Some(framebuffer) = registry.find(state, self.key) {
            return Ok(framebuffer);
        }

        // Never attach to whatever framebuffer happens to be bound.
        state.bind_framebuffer(0);
        let device = Arc::clone(state.device());
        let framebuffer = device
            .create_framebuffer()
            .map_err(GfxError::ObjectCreation)?;
        state.bind_framebuffer(framebuffer);

        match depth {
            DepthSlot::None => {}
            DepthSlot::Texture(t) => device.framebuffer_texture_2d(
                glow::FRAMEBUFFER,
                glow::DEPTH_ATTACHMENT,
                glow::TEXTURE_2D,
                t.handle(),
                0,
            ),
            DepthSlot::Buffer { renderbuffer, .. } => {
                device.bind_renderbuffer(glow::RENDERBUFFER, *renderbuffer);
                device.framebuffer_renderbuffer(
                    glow::FRAMEBUFFER,
                    glow::DEPTH_ATTACHMENT,
                    glow::RENDERBUFFER,
                    *renderbuffer,
                );
                device.bind_renderbuffer(glow::RENDERBUFFER, 0);
            }
        }

        let draw_buffers: SmallVec<[u32; 8]> = color
            .iter()
            .enumerate()
            .map(|(i, t)| {
                let attachment = glow::COLOR_ATTACHMENT0 + i as u32;
                device.framebuffer_texture_2d(
                    glow::FRAMEBUFFER,
                    attachment,
                    glow::TEXTURE_2D,
                    t.handle(),
                    0,
                );
                attachment
            })
            .collect();
        match draw_buffers.first() {
            Some(&first) => {
                device.draw_buffers(&draw_buffers);
                device.read_buffer(first);
            }
            None => {
                device.draw_buffers(&[glow::NONE]);
                device.read_buffer(glow::NONE);
            }
        }

        let status = device.check_framebuffer_status(glow::FRAMEBUFFER);
        if status != glow::FRAMEBUFFER_COMPLETE {
            error!(
                "Framebuffer for target {} is incomplete (status 0x{status:x}).",
                self.key.get()
            );
            state.delete_framebuffers(&[framebuffer]);
            return Err(GfxError::IncompleteFramebuffer(status));
        }
        if let Err(e) = registry.register(state, self.key, framebuffer) {
            state.delete_framebuffers(&[framebuffer]);
            return Err(e);
        }
        debug!(
            "Created framebuffer {framebuffer} for target {} ({} color, depth {:?}).",
            self.key.get(),
            draw_buffers.len(),
            self.depth_format()
        );
        Ok(framebuffer)
    }

    // Every thread's framebuffer for this target is now stale.
    fn invalidate(&self) {
        let registry = self.context.framebuffers();
        let key = self.key;
        let unregistered = self.context.with_render_state(|state| {
            state.bind_framebuffer(0);
            registry.unregister(Some(state), key);
        });
        if unregistered.is_err() {
            registry.unregister(None, key);
        }
    }

    fn replace_depth(&mut self, slot: DepthSlot) -> DepthSlot {
        match &mut self.kind {
            TargetKind::Owned { depth, .. } => std::mem::replace(depth, slot),
            TargetKind::Proxy(_) => slot,
        }
    }

    fn release_depth(&self, slot: DepthSlot) {
        let DepthSlot::Buffer { renderbuffer, .. } = slot else {
            return;
        };
        let deleted = self
            .context
            .with_render_state(|state| state.delete_renderbuffer(renderbuffer));
        match deleted {
            Ok(()) => {}
            Err(GfxError::RenderStateBusy)
                if self
                    .context
                    .release_later(PendingRelease::Renderbuffer(renderbuffer))
                    .is_ok() => {}
            Err(_) => {
                warn!(
                    "Depth renderbuffer {renderbuffer} released without a bound context; leaking it."
                );
            }
        }
    }
}

impl Drop for RenderTarget {
    fn drop(&mut self) {
        if self.is_proxy() {
            return;
        }
        self.invalidate();
        let old = self.replace_depth(DepthSlot::None);
        self.release_depth(old);
    }
}
