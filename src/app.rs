use glcore::config::{self, Config};
use glcore::core::gfx::{
    self, BackendType, DepthFormat, Device, GfxError, GraphicsContext, Rect, RenderTarget,
    TargetQuery, Texture2D, TextureFormat, WindowTarget,
};
use log::{debug, error, info, warn};
use std::error::Error;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use winit::application::ApplicationHandler;
use winit::dpi::PhysicalSize;
use winit::event::{ElementState, KeyEvent, WindowEvent};
use winit::event_loop::{ActiveEventLoop, EventLoop};
use winit::keyboard::{Key, NamedKey};
use winit::window::{Window, WindowId};

const OFFSCREEN_SIZE: u32 = 256;
const WORKER_FRAME: Duration = Duration::from_millis(16);
const HEADLESS_FRAMES: u32 = 120;

/// Offscreen render threads sharing one context and one render target.
struct Workers {
    stop: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

impl Workers {
    fn spawn(context: &GraphicsContext, shared: &Arc<RenderTarget>, count: u8) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let handles = (0..count)
            .filter_map(|index| {
                let context = context.clone();
                let shared = Arc::clone(shared);
                let stop = Arc::clone(&stop);
                thread::Builder::new()
                    .name(format!("gfx-worker-{index}"))
                    .spawn(move || worker_loop(&context, &shared, index, &stop))
                    .map_err(|e| error!("Failed to spawn render worker {index}: {e}"))
                    .ok()
            })
            .collect();
        Self { stop, handles }
    }

    fn join(self) {
        self.stop.store(true, Ordering::Relaxed);
        for handle in self.handles {
            if handle.join().is_err() {
                error!("A render worker panicked.");
            }
        }
    }
}

fn worker_loop(context: &GraphicsContext, shared: &RenderTarget, index: u8, stop: &AtomicBool) {
    let Ok(_guard) = context.bind_scoped(None) else {
        return;
    };

    let local = match RenderTarget::create(context, OFFSCREEN_SIZE, OFFSCREEN_SIZE, DepthFormat::Depth24)
    {
        Ok(target) => target,
        Err(e) => {
            error!("Worker {index}: offscreen target unavailable: {e}");
            return;
        }
    };
    if let Err(e) = shared.validate() {
        error!("Worker {index}: shared target incomplete: {e}");
        return;
    }

    let snapshot = Texture2D::create(context, OFFSCREEN_SIZE, OFFSCREEN_SIZE, TextureFormat::Rgba);
    let mut frames = 0u32;
    while !stop.load(Ordering::Relaxed) {
        let shade = f32::from(index) / 8.0;
        let drawn = draw_frame(context, &local, [shade, 0.2, 0.3, 1.0])
            .and_then(|()| draw_frame(context, shared, [0.0, shade, 0.0, 1.0]));
        if let Err(e) = drawn {
            warn!("Worker {index}: frame {frames} failed: {e}");
            break;
        }
        if frames == 0
            && let Ok(snapshot) = &snapshot
            && let Err(e) = local.copy_color_texture(0, snapshot)
        {
            warn!("Worker {index}: snapshot copy failed: {e}");
        }
        frames += 1;
        thread::sleep(WORKER_FRAME);
    }
    debug!("Worker {index} rendered {frames} frame(s).");
}

fn draw_frame(context: &GraphicsContext, target: &RenderTarget, color: [f32; 4]) -> Result<(), GfxError> {
    context.with_render_state(|state| {
        target.bind_with(state)?;
        let (width, height) = target.resolution();
        state.viewport(Rect::new(0, 0, width as i32, height as i32));
        state.clear_color(color[0], color[1], color[2], color[3]);
        state.depth_mask(true);
        state
            .device()
            .clear(glow::COLOR_BUFFER_BIT | glow::DEPTH_BUFFER_BIT);
        state.flush();
        if let Some(e) = state.check_error() {
            warn!("GL error after clear: {}", e.as_str());
        }
        Ok::<_, GfxError>(())
    })?
}

/// The window's default framebuffer, viewed as a render target.
fn screen_target(context: &GraphicsContext, size: &Arc<(AtomicU32, AtomicU32)>) -> RenderTarget {
    let size = Arc::clone(size);
    let framebuffer = context.framebuffer_id();
    RenderTarget::proxy(context, move || TargetQuery {
        width: size.0.load(Ordering::Relaxed),
        height: size.1.load(Ordering::Relaxed),
        depth: DepthFormat::Depth24,
        framebuffer,
    })
}

/// Binds a context on this thread plus the shared offscreen target every worker resolves.
fn start(
    context: &GraphicsContext,
    window: Option<&WindowTarget>,
    worker_threads: u8,
) -> Result<(Arc<RenderTarget>, Workers), GfxError> {
    context.bind(window)?;
    let shared = match RenderTarget::create(context, OFFSCREEN_SIZE, OFFSCREEN_SIZE, DepthFormat::Depth16)
    {
        Ok(target) => Arc::new(target),
        Err(e) => {
            let _ = context.unbind();
            return Err(e);
        }
    };
    let workers = Workers::spawn(context, &shared, worker_threads);
    info!(
        "{} context bound; {} worker thread(s) running.",
        context.backend_name(),
        workers.handles.len()
    );
    Ok((shared, workers))
}

fn stop(context: &GraphicsContext, shared: Arc<RenderTarget>, workers: Workers) {
    workers.join();
    drop(shared);
    info!(
        "Framebuffers still queued for deletion: {}.",
        context.framebuffers().pending_count(thread::current().id())
    );
    if let Err(e) = context.unbind() {
        error!("Failed to unbind on shutdown: {e}");
    }
}

pub struct App {
    config: Config,
    window: Option<Arc<Window>>,
    context: Option<GraphicsContext>,
    screen: Option<RenderTarget>,
    shared: Option<Arc<RenderTarget>>,
    workers: Option<Workers>,
    size: Arc<(AtomicU32, AtomicU32)>,
    vsync: bool,
    frames: u64,
    last_report: Instant,
}

impl App {
    fn new(config: Config) -> Self {
        Self {
            vsync: config.vsync,
            size: Arc::new((
                AtomicU32::new(config.display_width),
                AtomicU32::new(config.display_height),
            )),
            config,
            window: None,
            context: None,
            screen: None,
            shared: None,
            workers: None,
            frames: 0,
            last_report: Instant::now(),
        }
    }

    fn init_graphics(&mut self, event_loop: &ActiveEventLoop) -> Result<(), Box<dyn Error>> {
        let attributes = Window::default_attributes()
            .with_title("glcore probe")
            .with_inner_size(PhysicalSize::new(
                self.config.display_width,
                self.config.display_height,
            ));
        let window = Arc::new(event_loop.create_window(attributes)?);
        let size = window.inner_size();
        self.size.0.store(size.width.max(1), Ordering::Relaxed);
        self.size.1.store(size.height.max(1), Ordering::Relaxed);

        let context = gfx::create_context(
            BackendType::OpenGL,
            Some(&*window),
            self.vsync,
            self.config.gfx_debug,
        )?;
        let surface = WindowTarget::from_window(&window)?;
        let (shared, workers) = start(&context, Some(&surface), self.config.worker_threads)?;

        self.screen = Some(screen_target(&context, &self.size));
        self.shared = Some(shared);
        self.workers = Some(workers);
        self.context = Some(context);
        self.window = Some(window);
        info!("Starting event loop...");
        Ok(())
    }

    fn handle_key_event(&mut self, event_loop: &ActiveEventLoop, event: &KeyEvent) {
        if event.state != ElementState::Pressed || event.repeat {
            return;
        }
        match &event.logical_key {
            Key::Named(NamedKey::Escape) => event_loop.exit(),
            Key::Character(c) if c.eq_ignore_ascii_case("v") => self.toggle_vsync(),
            _ => {}
        }
    }

    fn toggle_vsync(&mut self) {
        let Some(context) = &self.context else {
            return;
        };
        let vsync = !self.vsync;
        match context.set_swap_interval(vsync) {
            Ok(()) => {
                self.vsync = vsync;
                config::update_vsync(vsync);
                info!("VSync {}.", if vsync { "enabled" } else { "disabled" });
            }
            Err(e) => warn!("Failed to change swap interval: {e}"),
        }
    }

    fn redraw(&mut self) {
        let (Some(context), Some(screen), Some(shared)) = (&self.context, &self.screen, &self.shared)
        else {
            return;
        };

        match context.update() {
            Ok(true) => debug!("Render state rebuilt after surface loss."),
            Ok(false) => {}
            Err(e) => {
                error!("Context update failed: {e}");
                return;
            }
        }

        let t = self.frames as f32 / 240.0;
        let frame = draw_frame(context, shared, [t.fract(), 0.0, 0.0, 1.0])
            .and_then(|()| draw_frame(context, screen, [0.1, 0.1, t.sin().abs() * 0.5, 1.0]))
            .and_then(|()| context.present());
        if let Err(e) = frame {
            warn!("Frame {} failed: {e}", self.frames);
        }

        self.frames += 1;
        let elapsed = self.last_report.elapsed();
        if elapsed >= Duration::from_secs(5) {
            debug!(
                "{:.1} fps, {} thread(s) bound.",
                self.frames as f64 / elapsed.as_secs_f64(),
                context.bound_thread_count()
            );
            self.frames = 0;
            self.last_report = Instant::now();
        }
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_none()
            && let Err(e) = self.init_graphics(event_loop)
        {
            error!("Failed to initialize graphics: {e}");
            event_loop.exit();
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, window_id: WindowId, event: WindowEvent) {
        let Some(window) = self.window.as_ref() else {
            return;
        };
        if window_id != window.id() {
            return;
        }

        match event {
            WindowEvent::CloseRequested => {
                info!("Close requested. Shutting down.");
                event_loop.exit();
            }
            WindowEvent::Resized(new_size) => {
                if new_size.width > 0 && new_size.height > 0 {
                    self.size.0.store(new_size.width, Ordering::Relaxed);
                    self.size.1.store(new_size.height, Ordering::Relaxed);
                    if let Some(context) = &self.context
                        && let Err(e) = context.resize_surface(new_size.width, new_size.height)
                    {
                        warn!("Surface resize failed: {e}");
                    }
                    config::update_display_resolution(new_size.width, new_size.height);
                }
            }
            WindowEvent::KeyboardInput { event, .. } => self.handle_key_event(event_loop, &event),
            WindowEvent::RedrawRequested => self.redraw(),
            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(window) = &self.window {
            window.request_redraw();
        }
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        self.screen = None;
        if let (Some(context), Some(shared), Some(workers)) =
            (&self.context, self.shared.take(), self.workers.take())
        {
            stop(context, shared, workers);
        }
    }
}

/// Recording backend: no window, the main thread renders alongside the workers for a fixed
/// number of frames and then tears everything down.
fn run_headless(config: &Config) -> Result<(), Box<dyn Error>> {
    let context = gfx::create_context(BackendType::Recording, None, config.vsync, config.gfx_debug)?;
    let (shared, workers) = start(&context, None, config.worker_threads)?;
    let size = Arc::new((
        AtomicU32::new(config.display_width),
        AtomicU32::new(config.display_height),
    ));
    let screen = screen_target(&context, &size);

    for frame in 0..HEADLESS_FRAMES {
        let drawn = draw_frame(&context, &shared, [1.0, 0.0, 0.0, 1.0])
            .and_then(|()| draw_frame(&context, &screen, [0.0, 0.0, 0.0, 1.0]));
        if let Err(e) = drawn {
            warn!("Headless frame {frame} failed: {e}");
            break;
        }
        thread::sleep(WORKER_FRAME);
    }

    drop(screen);
    stop(&context, shared, workers);
    Ok(())
}

pub fn run() -> Result<(), Box<dyn Error>> {
    let config = config::get();
    info!("Video renderer: {}", config.video_renderer);
    match config.video_renderer {
        BackendType::Recording => run_headless(&config),
        BackendType::OpenGL => {
            let event_loop = EventLoop::new()?;
            let mut app = App::new(config);
            event_loop.run_app(&mut app)?;
            Ok(())
        }
    }
}
