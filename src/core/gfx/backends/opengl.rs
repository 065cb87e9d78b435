use crate::core::gfx::device::Device;
use crate::core::gfx::platform::{PlatformBinding, WindowTarget};
use glow::{HasContext, PixelUnpackData};
use glutin::{
    config::{Config, ConfigTemplateBuilder},
    context::{ContextAttributesBuilder, NotCurrentContext, PossiblyCurrentContext},
    display::{Display, DisplayApiPreference},
    prelude::*,
    surface::{Surface, SurfaceAttributesBuilder, WindowSurface},
};
use log::{info, warn};
use parking_lot::Mutex;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use rustc_hash::FxHashMap;
use std::{
    cell::RefCell,
    ffi::CStr,
    num::NonZeroU32,
    sync::{
        Arc, OnceLock,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};
use winit::window::Window;

/// glow's function table behind the raw-name `Device` interface.
pub struct GlowDevice {
    gl: glow::Context,
}

// SAFETY: the context only holds loaded function pointers and the queried version and
// extension set. Every call acts on whatever context is current on the calling thread, and
// `GlutinPlatform` only hands the device to threads with a context of its group current.
unsafe impl Send for GlowDevice {}
unsafe impl Sync for GlowDevice {}

impl GlowDevice {
    pub fn new(gl: glow::Context) -> Self {
        Self { gl }
    }
}

fn nz(name: u32) -> Option<NonZeroU32> {
    NonZeroU32::new(name)
}

impl Device for GlowDevice {
    fn get_integer(&self, pname: u32) -> i32 {
        unsafe { self.gl.get_parameter_i32(pname) }
    }

    fn get_error(&self) -> u32 {
        unsafe { self.gl.get_error() }
    }

    fn flush(&self) {
        unsafe { self.gl.flush() }
    }

    fn finish(&self) {
        unsafe { self.gl.finish() }
    }

    fn enable(&self, cap: u32) {
        unsafe { self.gl.enable(cap) }
    }

    fn disable(&self, cap: u32) {
        unsafe { self.gl.disable(cap) }
    }

    fn use_program(&self, program: u32) {
        unsafe { self.gl.use_program(nz(program).map(glow::NativeProgram)) }
    }

    fn create_vertex_array(&self) -> Result<u32, String> {
        unsafe { self.gl.create_vertex_array().map(|va| va.0.get()) }
    }

    fn delete_vertex_array(&self, vertex_array: u32) {
        if let Some(va) = nz(vertex_array) {
            unsafe { self.gl.delete_vertex_array(glow::NativeVertexArray(va)) }
        }
    }

    fn bind_vertex_array(&self, vertex_array: u32) {
        unsafe {
            self.gl
                .bind_vertex_array(nz(vertex_array).map(glow::NativeVertexArray))
        }
    }

    fn bind_buffer(&self, target: u32, buffer: u32) {
        unsafe { self.gl.bind_buffer(target, nz(buffer).map(glow::NativeBuffer)) }
    }

    fn enable_vertex_attrib_array(&self, index: u32) {
        unsafe { self.gl.enable_vertex_attrib_array(index) }
    }

    fn disable_vertex_attrib_array(&self, index: u32) {
        unsafe { self.gl.disable_vertex_attrib_array(index) }
    }

    fn active_texture(&self, unit: u32) {
        unsafe { self.gl.active_texture(unit) }
    }

    fn bind_texture(&self, target: u32, texture: u32) {
        unsafe { self.gl.bind_texture(target, nz(texture).map(glow::NativeTexture)) }
    }

    fn create_texture(&self) -> Result<u32, String> {
        unsafe { self.gl.create_texture().map(|t| t.0.get()) }
    }

    fn delete_texture(&self, texture: u32) {
        if let Some(t) = nz(texture) {
            unsafe { self.gl.delete_texture(glow::NativeTexture(t)) }
        }
    }

    fn tex_parameter_i32(&self, target: u32, pname: u32, param: i32) {
        unsafe { self.gl.tex_parameter_i32(target, pname, param) }
    }

    fn tex_image_2d(
        &self,
        target: u32,
        level: i32,
        internal_format: i32,
        width: i32,
        height: i32,
        format: u32,
        ty: u32,
    ) {
        unsafe {
            self.gl.tex_image_2d(
                target,
                level,
                internal_format,
                width,
                height,
                0,
                format,
                ty,
                PixelUnpackData::Slice(None),
            );
        }
    }

    fn copy_tex_sub_image_2d(
        &self,
        target: u32,
        level: i32,
        x_offset: i32,
        y_offset: i32,
        x: i32,
        y: i32,
        width: i32,
        height: i32,
    ) {
        unsafe {
            self.gl.copy_tex_sub_image_2d(
                target, level, x_offset, y_offset, x, y, width, height,
            );
        }
    }

    fn blend_equation(&self, mode: u32) {
        unsafe { self.gl.blend_equation(mode) }
    }

    fn blend_equation_separate(&self, mode_rgb: u32, mode_alpha: u32) {
        unsafe { self.gl.blend_equation_separate(mode_rgb, mode_alpha) }
    }

    fn blend_func(&self, src: u32, dst: u32) {
        unsafe { self.gl.blend_func(src, dst) }
    }

    fn blend_func_separate(&self, src_rgb: u32, dst_rgb: u32, src_alpha: u32, dst_alpha: u32) {
        unsafe {
            self.gl
                .blend_func_separate(src_rgb, dst_rgb, src_alpha, dst_alpha)
        }
    }

    fn blend_color(&self, r: f32, g: f32, b: f32, a: f32) {
        unsafe { self.gl.blend_color(r, g, b, a) }
    }

    fn depth_func(&self, func: u32) {
        unsafe { self.gl.depth_func(func) }
    }

    fn depth_mask(&self, mask: bool) {
        unsafe { self.gl.depth_mask(mask) }
    }

    fn depth_range(&self, near: f32, far: f32) {
        unsafe { self.gl.depth_range_f32(near, far) }
    }

    fn color_mask(&self, r: bool, g: bool, b: bool, a: bool) {
        unsafe { self.gl.color_mask(r, g, b, a) }
    }

    fn cull_face(&self, mode: u32) {
        unsafe { self.gl.cull_face(mode) }
    }

    fn front_face(&self, mode: u32) {
        unsafe { self.gl.front_face(mode) }
    }

    fn viewport(&self, x: i32, y: i32, width: i32, height: i32) {
        unsafe { self.gl.viewport(x, y, width, height) }
    }

    fn scissor(&self, x: i32, y: i32, width: i32, height: i32) {
        unsafe { self.gl.scissor(x, y, width, height) }
    }

    fn polygon_offset(&self, factor: f32, units: f32) {
        unsafe { self.gl.polygon_offset(factor, units) }
    }

    fn line_width(&self, width: f32) {
        unsafe { self.gl.line_width(width) }
    }

    fn clear_color(&self, r: f32, g: f32, b: f32, a: f32) {
        unsafe { self.gl.clear_color(r, g, b, a) }
    }

    fn clear_depth(&self, depth: f32) {
        unsafe { self.gl.clear_depth_f32(depth) }
    }

    fn clear(&self, mask: u32) {
        unsafe { self.gl.clear(mask) }
    }

    fn create_framebuffer(&self) -> Result<u32, String> {
        unsafe { self.gl.create_framebuffer().map(|fb| fb.0.get()) }
    }

    fn delete_framebuffers(&self, framebuffers: &[u32]) {
        for fb in framebuffers.iter().filter_map(|&fb| nz(fb)) {
            unsafe { self.gl.delete_framebuffer(glow::NativeFramebuffer(fb)) }
        }
    }

    fn bind_framebuffer(&self, target: u32, framebuffer: u32) {
        unsafe {
            self.gl
                .bind_framebuffer(target, nz(framebuffer).map(glow::NativeFramebuffer))
        }
    }

    fn framebuffer_texture_2d(
        &self,
        target: u32,
        attachment: u32,
        texture_target: u32,
        texture: u32,
        level: i32,
    ) {
        unsafe {
            self.gl.framebuffer_texture_2d(
                target,
                attachment,
                texture_target,
                nz(texture).map(glow::NativeTexture),
                level,
            );
        }
    }

    fn framebuffer_renderbuffer(
        &self,
        target: u32,
        attachment: u32,
        renderbuffer_target: u32,
        renderbuffer: u32,
    ) {
        unsafe {
            self.gl.framebuffer_renderbuffer(
                target,
                attachment,
                renderbuffer_target,
                nz(renderbuffer).map(glow::NativeRenderbuffer),
            );
        }
    }

    fn draw_buffers(&self, buffers: &[u32]) {
        unsafe { self.gl.draw_buffers(buffers) }
    }

    fn read_buffer(&self, buffer: u32) {
        unsafe { self.gl.read_buffer(buffer) }
    }

    fn check_framebuffer_status(&self, target: u32) -> u32 {
        unsafe { self.gl.check_framebuffer_status(target) }
    }

    fn create_renderbuffer(&self) -> Result<u32, String> {
        unsafe { self.gl.create_renderbuffer().map(|rb| rb.0.get()) }
    }

    fn delete_renderbuffer(&self, renderbuffer: u32) {
        if let Some(rb) = nz(renderbuffer) {
            unsafe { self.gl.delete_renderbuffer(glow::NativeRenderbuffer(rb)) }
        }
    }

    fn bind_renderbuffer(&self, target: u32, renderbuffer: u32) {
        unsafe {
            self.gl
                .bind_renderbuffer(target, nz(renderbuffer).map(glow::NativeRenderbuffer))
        }
    }

    fn renderbuffer_storage(&self, target: u32, internal_format: u32, width: i32, height: i32) {
        unsafe {
            self.gl
                .renderbuffer_storage(target, internal_format, width, height)
        }
    }
}

// The group's display, pixel config and the never-current root context every per-thread
// context shares objects with.
struct Group {
    display: Display,
    config: Config,
    root: NotCurrentContext,
}

// SAFETY: `Group` is only reached through `GlutinPlatform::group`'s mutex. `root` is never
// made current, it only serves as the share-list parent for contexts created on any thread.
unsafe impl Send for Group {}

struct ThreadGl {
    context: PossiblyCurrentContext,
    surface: Option<Surface<WindowSurface>>,
}

thread_local! {
    // Keyed by platform id; one thread may bind contexts of several groups over its life.
    static CURRENT: RefCell<FxHashMap<u64, ThreadGl>> = RefCell::new(FxHashMap::default());
}

/// A glutin-backed context group: every bound thread gets its own context sharing objects
/// with a common root. Only the thread that bound with a window can present.
pub struct GlutinPlatform {
    id: u64,
    group: Mutex<Group>,
    device: OnceLock<Arc<GlowDevice>>,
    vsync: AtomicBool,
    gfx_debug: bool,
}

impl GlutinPlatform {
    pub fn new(window: &Window, vsync_enabled: bool, gfx_debug_enabled: bool) -> Result<Self, String> {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);

        info!("Initializing OpenGL backend...");
        if gfx_debug_enabled {
            info!("OpenGL debug context requested.");
        }

        let display_handle = window
            .display_handle()
            .map_err(|e| e.to_string())?
            .as_raw();

        #[cfg(target_os = "windows")]
        let preference = {
            info!("Using WGL for OpenGL context.");
            DisplayApiPreference::Wgl(None)
        };

        #[cfg(target_os = "macos")]
        let preference = {
            info!("Using CGL for OpenGL context.");
            DisplayApiPreference::Cgl
        };

        #[cfg(all(unix, not(target_os = "macos")))]
        let preference = {
            info!("Using EGL for OpenGL context.");
            DisplayApiPreference::Egl
        };

        let display =
            unsafe { Display::new(display_handle, preference) }.map_err(|e| e.to_string())?;

        let template = ConfigTemplateBuilder::new()
            .with_alpha_size(0)
            .with_stencil_size(8)
            .with_transparency(false)
            .build();

        let config = unsafe { display.find_configs(template) }
            .map_err(|e| e.to_string())?
            .next()
            .ok_or("Failed to find a suitable GL config")?;

        let raw_window_handle = window.window_handle().map_err(|e| e.to_string())?.as_raw();
        let root_attributes = ContextAttributesBuilder::new()
            .with_debug(gfx_debug_enabled)
            .build(Some(raw_window_handle));
        let root = unsafe { display.create_context(&config, &root_attributes) }
            .map_err(|e| e.to_string())?;

        info!("OpenGL backend initialized successfully.");
        Ok(Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            group: Mutex::new(Group {
                display,
                config,
                root,
            }),
            device: OnceLock::new(),
            vsync: AtomicBool::new(vsync_enabled),
            gfx_debug: gfx_debug_enabled,
        })
    }

    fn with_thread<R>(&self, f: impl FnOnce(Option<&ThreadGl>) -> R) -> R {
        CURRENT.with_borrow(|map| f(map.get(&self.id)))
    }
}

impl PlatformBinding for GlutinPlatform {
    fn name(&self) -> &'static str {
        "opengl"
    }

    fn bind(&self, target: Option<&WindowTarget>) -> Result<(), String> {
        if self.with_thread(|gl| gl.is_some()) {
            return Err("thread already holds a context of this group".to_string());
        }

        let group = self.group.lock();
        let attributes = ContextAttributesBuilder::new()
            .with_sharing(&group.root)
            .with_debug(self.gfx_debug)
            .build(target.map(|t| t.window));
        let not_current = unsafe { group.display.create_context(&group.config, &attributes) }
            .map_err(|e| e.to_string())?;

        let thread_gl = match target {
            Some(target) => {
                let surface_attributes = SurfaceAttributesBuilder::<WindowSurface>::new().build(
                    target.window,
                    NonZeroU32::new(target.width).unwrap_or(NonZeroU32::MIN),
                    NonZeroU32::new(target.height).unwrap_or(NonZeroU32::MIN),
                );
                let surface = unsafe {
                    group
                        .display
                        .create_window_surface(&group.config, &surface_attributes)
                }
                .map_err(|e| e.to_string())?;
                let context = not_current
                    .make_current(&surface)
                    .map_err(|e| e.to_string())?;
                apply_swap_interval(
                    &group.display,
                    &surface,
                    &context,
                    self.vsync.load(Ordering::Relaxed),
                );
                ThreadGl {
                    context,
                    surface: Some(surface),
                }
            }
            None => ThreadGl {
                context: make_current_surfaceless(not_current)?,
                surface: None,
            },
        };

        self.device.get_or_init(|| {
            let display = &group.display;
            let gl = unsafe {
                glow::Context::from_loader_function_cstr(|s: &CStr| display.get_proc_address(s))
            };
            Arc::new(GlowDevice::new(gl))
        });
        drop(group);

        CURRENT.with_borrow_mut(|map| map.insert(self.id, thread_gl));
        Ok(())
    }

    fn unbind(&self) -> Result<(), String> {
        let Some(thread_gl) = CURRENT.with_borrow_mut(|map| map.remove(&self.id)) else {
            return Err("thread holds no context of this group".to_string());
        };
        let ThreadGl { context, surface } = thread_gl;
        let result = context.make_not_current().map(drop).map_err(|e| e.to_string());
        drop(surface);
        result
    }

    fn is_bound(&self) -> bool {
        self.with_thread(|gl| gl.is_some_and(|gl| gl.context.is_current()))
    }

    fn device(&self) -> Option<Arc<dyn Device>> {
        if !self.is_bound() {
            return None;
        }
        let device: Arc<dyn Device> = self.device.get()?.clone();
        Some(device)
    }

    fn flush(&self) {
        if let Some(device) = self.device.get() {
            device.flush();
        }
    }

    fn finish(&self) {
        if let Some(device) = self.device.get() {
            device.finish();
        }
    }

    fn present(&self) -> Result<(), String> {
        self.with_thread(|gl| {
            let gl = gl.ok_or("thread holds no context of this group")?;
            let surface = gl
                .surface
                .as_ref()
                .ok_or("thread was bound without a window surface")?;
            surface.swap_buffers(&gl.context).map_err(|e| e.to_string())
        })
    }

    fn update(&self) -> bool {
        self.with_thread(|gl| {
            let Some(gl) = gl else {
                return false;
            };
            if gl.context.is_current() {
                return false;
            }
            warn!("OpenGL context lost currency; making it current again.");
            let restored = match &gl.surface {
                Some(surface) => gl.context.make_current(surface).map_err(|e| e.to_string()),
                None => restore_surfaceless(&gl.context),
            };
            if let Err(e) = restored {
                warn!("Failed to restore OpenGL context: {e}");
            }
            true
        })
    }

    fn resize_surface(&self, width: u32, height: u32) {
        if width == 0 || height == 0 {
            warn!("Ignoring resize to zero dimensions.");
            return;
        }
        self.with_thread(|gl| {
            if let Some(ThreadGl {
                context,
                surface: Some(surface),
            }) = gl
            {
                surface.resize(
                    context,
                    NonZeroU32::new(width).unwrap_or(NonZeroU32::MIN),
                    NonZeroU32::new(height).unwrap_or(NonZeroU32::MIN),
                );
            }
        });
    }

    fn swap_interval(&self) -> bool {
        self.vsync.load(Ordering::Relaxed)
    }

    fn set_swap_interval(&self, vsync: bool) -> Result<(), String> {
        self.vsync.store(vsync, Ordering::Relaxed);
        let group = self.group.lock();
        self.with_thread(|gl| {
            if let Some(ThreadGl {
                context,
                surface: Some(surface),
            }) = gl
            {
                apply_swap_interval(&group.display, surface, context, vsync);
            }
        });
        Ok(())
    }

    fn framebuffer_id(&self) -> u32 {
        0
    }
}

// glutin only exposes surfaceless binds on the per-API context types.
fn make_current_surfaceless(context: NotCurrentContext) -> Result<PossiblyCurrentContext, String> {
    match context {
        #[cfg(any(windows, all(unix, not(target_vendor = "apple"))))]
        NotCurrentContext::Egl(c) => c
            .make_current_surfaceless()
            .map(PossiblyCurrentContext::Egl)
            .map_err(|e| e.to_string()),
        #[cfg(all(unix, not(target_vendor = "apple"), not(target_os = "android")))]
        NotCurrentContext::Glx(c) => c
            .make_current_surfaceless()
            .map(PossiblyCurrentContext::Glx)
            .map_err(|e| e.to_string()),
        #[cfg(windows)]
        NotCurrentContext::Wgl(c) => c
            .make_current_surfaceless()
            .map(PossiblyCurrentContext::Wgl)
            .map_err(|e| e.to_string()),
        #[cfg(target_os = "macos")]
        NotCurrentContext::Cgl(c) => c
            .make_current_surfaceless()
            .map(PossiblyCurrentContext::Cgl)
            .map_err(|e| e.to_string()),
        #[allow(unreachable_patterns)]
        _ => Err("this GL API cannot bind a context without a surface".to_string()),
    }
}

fn restore_surfaceless(context: &PossiblyCurrentContext) -> Result<(), String> {
    match context {
        #[cfg(any(windows, all(unix, not(target_vendor = "apple"))))]
        PossiblyCurrentContext::Egl(c) => c.make_current_surfaceless().map_err(|e| e.to_string()),
        #[cfg(all(unix, not(target_vendor = "apple"), not(target_os = "android")))]
        PossiblyCurrentContext::Glx(c) => c.make_current_surfaceless().map_err(|e| e.to_string()),
        #[cfg(windows)]
        PossiblyCurrentContext::Wgl(c) => c.make_current_surfaceless().map_err(|e| e.to_string()),
        #[cfg(target_os = "macos")]
        PossiblyCurrentContext::Cgl(c) => c.make_current_surfaceless().map_err(|e| e.to_string()),
        #[allow(unreachable_patterns)]
        _ => Err("this GL API cannot bind a context without a surface".to_string()),
    }
}

#[cfg(target_os = "windows")]
fn apply_swap_interval(
    display: &Display,
    _surface: &Surface<WindowSurface>,
    _context: &PossiblyCurrentContext,
    vsync_enabled: bool,
) {
    info!("Attempting to set VSync via wglSwapIntervalEXT...");
    type SwapIntervalFn = extern "system" fn(i32) -> i32;
    let proc_name = c"wglSwapIntervalEXT";
    let proc = display.get_proc_address(proc_name);
    if !proc.is_null() {
        let f: SwapIntervalFn = unsafe { std::mem::transmute(proc) };
        let interval = i32::from(vsync_enabled);
        if f(interval) != 0 {
            info!(
                "Successfully set VSync to: {}",
                if vsync_enabled { "on" } else { "off" }
            );
        } else {
            warn!("wglSwapIntervalEXT call failed. VSync state may not be as requested.");
        }
    } else {
        warn!("wglSwapIntervalEXT function not found. Cannot control VSync.");
    }
}

#[cfg(not(target_os = "windows"))]
fn apply_swap_interval(
    _display: &Display,
    surface: &Surface<WindowSurface>,
    context: &PossiblyCurrentContext,
    vsync_enabled: bool,
) {
    use glutin::surface::SwapInterval;
    let interval = if vsync_enabled {
        SwapInterval::Wait(NonZeroU32::MIN)
    } else {
        SwapInterval::DontWait
    };

    if let Err(e) = surface.set_swap_interval(context, interval) {
        warn!("Failed to set swap interval (VSync): {:?}", e);
    } else {
        info!(
            "Successfully set VSync to: {}",
            if vsync_enabled { "on" } else { "off" }
        );
    }
}
