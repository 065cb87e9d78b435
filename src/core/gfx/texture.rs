use crate::core::gfx::{GfxError, GraphicsContext, PendingRelease, TextureTarget};
use log::{debug, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    Alpha,
    Rgb,
    Rgba,
    Depth16,
    Depth24,
    Depth32,
}

impl TextureFormat {
    /// Formats a render target accepts in its color slots.
    pub const fn is_color(self) -> bool {
        matches!(self, Self::Alpha | Self::Rgb | Self::Rgba)
    }

    pub const fn is_depth(self) -> bool {
        matches!(self, Self::Depth16 | Self::Depth24 | Self::Depth32)
    }

    pub const fn internal_format(self) -> u32 {
        match self {
            Self::Alpha => glow::R8,
            Self::Rgb => glow::RGB8,
            Self::Rgba => glow::RGBA8,
            Self::Depth16 => glow::DEPTH_COMPONENT16,
            Self::Depth24 => glow::DEPTH_COMPONENT24,
            Self::Depth32 => glow::DEPTH_COMPONENT32F,
        }
    }

    // (pixel format, pixel type) used when allocating storage without data.
    const fn upload_format(self) -> (u32, u32) {
        match self {
            Self::Alpha => (glow::RED, glow::UNSIGNED_BYTE),
            Self::Rgb => (glow::RGB, glow::UNSIGNED_BYTE),
            Self::Rgba => (glow::RGBA, glow::UNSIGNED_BYTE),
            Self::Depth16 => (glow::DEPTH_COMPONENT, glow::UNSIGNED_SHORT),
            Self::Depth24 => (glow::DEPTH_COMPONENT, glow::UNSIGNED_INT),
            Self::Depth32 => (glow::DEPTH_COMPONENT, glow::FLOAT),
        }
    }
}

/// Anything 2D a render target can attach. The core only looks at the format, the size and
/// the native name; ownership of the texture stays with whoever created it.
pub trait TextureSource: Send + Sync {
    fn format(&self) -> TextureFormat;
    fn width(&self) -> u32;
    fn height(&self) -> u32;
    fn handle(&self) -> u32;

    fn resolution(&self) -> (u32, u32) {
        (self.width(), self.height())
    }
}

/// A plain 2D texture. Either wraps a name created elsewhere (`from_raw`, never deleted here)
/// or owns one created through a context (`create`, deleted on drop by whichever thread is
/// bound at that point; texture names are shared across the context group).
pub struct Texture2D {
    handle: u32,
    width: u32,
    height: u32,
    format: TextureFormat,
    owner: Option<GraphicsContext>,
}

impl Texture2D {
    pub const fn from_raw(handle: u32, width: u32, height: u32, format: TextureFormat) -> Self {
        Self {
            handle,
            width,
            height,
            format,
            owner: None,
        }
    }

    pub fn create(
        context: &GraphicsContext,
        width: u32,
        height: u32,
        format: TextureFormat,
    ) -> Result<Self, GfxError> {
        if width == 0 || height == 0 {
            return Err(GfxError::InvalidSize { width, height });
        }
        context.with_render_state(|state| {
            let max = state.limits().max_texture_size.max(1) as u32;
            if width > max || height > max {
                return Err(GfxError::InvalidSize { width, height });
            }
            let device = state.device().clone();
            let handle = device.create_texture().map_err(GfxError::ObjectCreation)?;
            let target = TextureTarget::Texture2D;
            state.bind_texture(target, handle);

            let t = target.to_gl();
            device.tex_parameter_i32(t, glow::TEXTURE_WRAP_S, glow::CLAMP_TO_EDGE as i32);
            device.tex_parameter_i32(t, glow::TEXTURE_WRAP_T, glow::CLAMP_TO_EDGE as i32);
            device.tex_parameter_i32(t, glow::TEXTURE_MIN_FILTER, glow::LINEAR as i32);
            device.tex_parameter_i32(t, glow::TEXTURE_MAG_FILTER, glow::LINEAR as i32);
            device.tex_parameter_i32(t, glow::TEXTURE_BASE_LEVEL, 0);
            device.tex_parameter_i32(t, glow::TEXTURE_MAX_LEVEL, 0);

            let (pixel_format, pixel_type) = format.upload_format();
            device.tex_image_2d(
                t,
                0,
                format.internal_format() as i32,
                width as i32,
                height as i32,
                pixel_format,
                pixel_type,
            );
            state.bind_texture(target, 0);
            debug!("Created {width}x{height} {format:?} texture {handle}.");

            Ok(Self {
                handle,
                width,
                height,
                format,
                owner: Some(context.clone()),
            })
        })?
    }
}

impl TextureSource for Texture2D {
    fn format(&self) -> TextureFormat {
        self.format
    }

    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn handle(&self) -> u32 {
        self.handle
    }
}

impl Drop for Texture2D {
    fn drop(&mut self) {
        let Some(owner) = self.owner.take() else {
            return;
        };
        let handle = self.handle;
        match owner.with_render_state(|state| state.delete_texture(handle)) {
            Ok(()) => {}
            Err(GfxError::RenderStateBusy)
                if owner.release_later(PendingRelease::Texture(handle)).is_ok() => {}
            Err(_) => {
                warn!("Texture {handle} dropped on a thread without a bound context; leaking it.");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::gfx::backends::recording::{GlCall, RecordingDevice, RecordingPlatform};
    use std::sync::Arc;

    fn bound_context() -> (Arc<RecordingDevice>, GraphicsContext) {
        let device = Arc::new(RecordingDevice::new());
        let context = GraphicsContext::new(Box::new(RecordingPlatform::new(device.clone())));
        context.bind(None).expect("bind");
        (device, context)
    }

    #[test]
    fn create_checks_size_against_the_device_limit() {
        let (_device, context) = bound_context();
        assert_eq!(
            Texture2D::create(&context, 0, 8, TextureFormat::Rgba).err(),
            Some(GfxError::InvalidSize { width: 0, height: 8 })
        );
        assert_eq!(
            Texture2D::create(&context, 8192, 8, TextureFormat::Rgba).err(),
            Some(GfxError::InvalidSize {
                width: 8192,
                height: 8
            })
        );
        let texture = Texture2D::create(&context, 16, 8, TextureFormat::Depth24).expect("texture");
        assert_eq!(texture.resolution(), (16, 8));
    }

    #[test]
    fn texture_dropped_inside_render_state_is_deleted_afterwards() {
        let (device, context) = bound_context();
        let texture = Texture2D::create(&context, 8, 8, TextureFormat::Rgba).expect("texture");
        let handle = texture.handle();

        context
            .with_render_state(move |_| drop(texture))
            .expect("outer state");
        assert_eq!(device.count(|c| *c == GlCall::DeleteTexture(handle)), 0);
        assert_eq!(context.pending_release_count(), 1);

        context.with_render_state(|_| ()).expect("state");
        assert_eq!(device.count(|c| *c == GlCall::DeleteTexture(handle)), 1);
        assert_eq!(context.pending_release_count(), 0);
    }

    #[test]
    fn texture_outliving_its_binding_is_not_deleted() {
        let (device, context) = bound_context();
        let texture = Texture2D::create(&context, 4, 4, TextureFormat::Alpha).expect("texture");
        let handle = texture.handle();
        context.unbind().expect("unbind");

        drop(texture);
        assert_eq!(device.count(|c| *c == GlCall::DeleteTexture(handle)), 0);
    }
}
