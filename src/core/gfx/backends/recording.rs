//! A headless backend that records every GL call instead of issuing it.
//!
//! Object names are handed out from a counter, integer queries answer from a configurable
//! limits table, and framebuffer completeness can be forced. Each call is stored together
//! with the thread that issued it, which is what the cross-thread ownership checks look at.
//! The log keeps the most recent calls only, so long headless runs stay bounded.

use crate::core::gfx::device::Device;
use crate::core::gfx::platform::{PlatformBinding, WindowTarget};
use log::debug;
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::thread::{self, ThreadId};

/// Calls kept by `RecordingDevice::new`.
pub const DEFAULT_CALL_LIMIT: usize = 1 << 16;

#[derive(Clone, Debug, PartialEq)]
pub enum GlCall {
    Flush,
    Finish,
    Enable(u32),
    Disable(u32),
    UseProgram(u32),
    CreateVertexArray(u32),
    DeleteVertexArray(u32),
    BindVertexArray(u32),
    BindBuffer(u32, u32),
    EnableVertexAttribArray(u32),
    DisableVertexAttribArray(u32),
    ActiveTexture(u32),
    BindTexture(u32, u32),
    CreateTexture(u32),
    DeleteTexture(u32),
    TexParameter(u32, u32, i32),
    TexImage2D {
        target: u32,
        internal_format: i32,
        width: i32,
        height: i32,
    },
    CopyTexSubImage2D {
        target: u32,
        width: i32,
        height: i32,
    },
    BlendEquation(u32),
    BlendEquationSeparate(u32, u32),
    BlendFunc(u32, u32),
    BlendFuncSeparate(u32, u32, u32, u32),
    BlendColor([f32; 4]),
    DepthFunc(u32),
    DepthMask(bool),
    DepthRange(f32, f32),
    ColorMask([bool; 4]),
    CullFace(u32),
    FrontFace(u32),
    Viewport([i32; 4]),
    Scissor([i32; 4]),
    PolygonOffset(f32, f32),
    LineWidth(f32),
    ClearColor([f32; 4]),
    ClearDepth(f32),
    Clear(u32),
    CreateFramebuffer(u32),
    DeleteFramebuffers(Vec<u32>),
    BindFramebuffer(u32, u32),
    FramebufferTexture2D {
        attachment: u32,
        texture: u32,
    },
    FramebufferRenderbuffer {
        attachment: u32,
        renderbuffer: u32,
    },
    DrawBuffers(Vec<u32>),
    ReadBuffer(u32),
    CheckFramebufferStatus,
    CreateRenderbuffer(u32),
    DeleteRenderbuffer(u32),
    BindRenderbuffer(u32),
    RenderbufferStorage {
        internal_format: u32,
        width: i32,
        height: i32,
    },
}

#[derive(Clone, Debug)]
pub struct Recorded {
    pub thread: ThreadId,
    pub call: GlCall,
}

pub struct RecordingDevice {
    calls: Mutex<VecDeque<Recorded>>,
    call_limit: usize,
    next_name: AtomicU32,
    integers: Mutex<FxHashMap<u32, i32>>,
    framebuffer_status: AtomicU32,
    pending_error: AtomicU32,
}

impl Default for RecordingDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingDevice {
    pub fn new() -> Self {
        Self::with_call_limit(DEFAULT_CALL_LIMIT)
    }

    /// Keeps at most `limit` calls (at least one), dropping the oldest first.
    pub fn with_call_limit(limit: usize) -> Self {
        let integers = [
            (glow::MAX_COMBINED_TEXTURE_IMAGE_UNITS, 16),
            (glow::MAX_VERTEX_ATTRIBS, 16),
            (glow::MAX_TEXTURE_SIZE, 4096),
            (glow::MAX_DRAW_BUFFERS, 8),
            (glow::MAX_COLOR_ATTACHMENTS, 8),
        ];
        Self {
            calls: Mutex::new(VecDeque::new()),
            call_limit: limit.max(1),
            next_name: AtomicU32::new(1),
            integers: Mutex::new(integers.into_iter().collect()),
            framebuffer_status: AtomicU32::new(glow::FRAMEBUFFER_COMPLETE),
            pending_error: AtomicU32::new(glow::NO_ERROR),
        }
    }

    /// Overrides the answer to `glGetIntegerv(pname)`.
    pub fn set_integer(&self, pname: u32, value: i32) {
        self.integers.lock().insert(pname, value);
    }

    pub fn set_framebuffer_status(&self, status: u32) {
        self.framebuffer_status.store(status, Ordering::Relaxed);
    }

    /// Makes the next `glGetError` report `code`.
    pub fn raise_error(&self, code: u32) {
        self.pending_error.store(code, Ordering::Relaxed);
    }

    pub fn records(&self) -> Vec<Recorded> {
        self.calls.lock().iter().cloned().collect()
    }

    pub fn calls(&self) -> Vec<GlCall> {
        self.calls.lock().iter().map(|r| r.call.clone()).collect()
    }

    pub fn count(&self, pred: impl Fn(&GlCall) -> bool) -> usize {
        self.calls.lock().iter().filter(|r| pred(&r.call)).count()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    /// Every framebuffer deletion as `(deleting thread, name)`.
    pub fn deleted_framebuffers(&self) -> Vec<(ThreadId, u32)> {
        self.calls
            .lock()
            .iter()
            .filter_map(|r| match &r.call {
                GlCall::DeleteFramebuffers(fbs) => Some(fbs.iter().map(|&fb| (r.thread, fb))),
                _ => None,
            })
            .flatten()
            .collect()
    }

    /// Every framebuffer creation as `(creating thread, name)`.
    pub fn created_framebuffers(&self) -> Vec<(ThreadId, u32)> {
        self.calls
            .lock()
            .iter()
            .filter_map(|r| match r.call {
                GlCall::CreateFramebuffer(fb) => Some((r.thread, fb)),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: GlCall) {
        let mut calls = self.calls.lock();
        if calls.len() == self.call_limit {
            calls.pop_front();
        }
        calls.push_back(Recorded {
            thread: thread::current().id(),
            call,
        });
    }

    fn name(&self) -> u32 {
        self.next_name.fetch_add(1, Ordering::Relaxed)
    }
}

impl Device for RecordingDevice {
    fn get_integer(&self, pname: u32) -> i32 {
        self.integers.lock().get(&pname).copied().unwrap_or(0)
    }

    fn get_error(&self) -> u32 {
        self.pending_error.swap(glow::NO_ERROR, Ordering::Relaxed)
    }

    fn flush(&self) {
        self.record(GlCall::Flush);
    }

    fn finish(&self) {
        self.record(GlCall::Finish);
    }

    fn enable(&self, cap: u32) {
        self.record(GlCall::Enable(cap));
    }

    fn disable(&self, cap: u32) {
        self.record(GlCall::Disable(cap));
    }

    fn use_program(&self, program: u32) {
        self.record(GlCall::UseProgram(program));
    }

    fn create_vertex_array(&self) -> Result<u32, String> {
        let name = self.name();
        self.record(GlCall::CreateVertexArray(name));
        Ok(name)
    }

    fn delete_vertex_array(&self, vertex_array: u32) {
        self.record(GlCall::DeleteVertexArray(vertex_array));
    }

    fn bind_vertex_array(&self, vertex_array: u32) {
        self.record(GlCall::BindVertexArray(vertex_array));
    }

    fn bind_buffer(&self, target: u32, buffer: u32) {
        self.record(GlCall::BindBuffer(target, buffer));
    }

    fn enable_vertex_attrib_array(&self, index: u32) {
        self.record(GlCall::EnableVertexAttribArray(index));
    }

    fn disable_vertex_attrib_array(&self, index: u32) {
        self.record(GlCall::DisableVertexAttribArray(index));
    }

    fn active_texture(&self, unit: u32) {
        self.record(GlCall::ActiveTexture(unit));
    }

    fn bind_texture(&self, target: u32, texture: u32) {
        self.record(GlCall::BindTexture(target, texture));
    }

    fn create_texture(&self) -> Result<u32, String> {
        let name = self.name();
        self.record(GlCall::CreateTexture(name));
        Ok(name)
    }

    fn delete_texture(&self, texture: u32) {
        self.record(GlCall::DeleteTexture(texture));
    }

    fn tex_parameter_i32(&self, target: u32, pname: u32, param: i32) {
        self.record(GlCall::TexParameter(target, pname, param));
    }

    fn tex_image_2d(
        &self,
        target: u32,
        _level: i32,
        internal_format: i32,
        width: i32,
        height: i32,
        _format: u32,
        _ty: u32,
    ) {
        self.record(GlCall::TexImage2D {
            target,
            internal_format,
            width,
            height,
        });
    }

    fn copy_tex_sub_image_2d(
        &self,
        target: u32,
        _level: i32,
        _x_offset: i32,
        _y_offset: i32,
        _x: i32,
        _y: i32,
        width: i32,
        height: i32,
    ) {
        self.record(GlCall::CopyTexSubImage2D {
            target,
            width,
            height,
        });
    }

    fn blend_equation(&self, mode: u32) {
        self.record(GlCall::BlendEquation(mode));
    }

    fn blend_equation_separate(&self, mode_rgb: u32, mode_alpha: u32) {
        self.record(GlCall::BlendEquationSeparate(mode_rgb, mode_alpha));
    }

    fn blend_func(&self, src: u32, dst: u32) {
        self.record(GlCall::BlendFunc(src, dst));
    }

    fn blend_func_separate(&self, src_rgb: u32, dst_rgb: u32, src_alpha: u32, dst_alpha: u32) {
        self.record(GlCall::BlendFuncSeparate(
            src_rgb, dst_rgb, src_alpha, dst_alpha,
        ));
    }

    fn blend_color(&self, r: f32, g: f32, b: f32, a: f32) {
        self.record(GlCall::BlendColor([r, g, b, a]));
    }

    fn depth_func(&self, func: u32) {
        self.record(GlCall::DepthFunc(func));
    }

    fn depth_mask(&self, mask: bool) {
        self.record(GlCall::DepthMask(mask));
    }

    fn depth_range(&self, near: f32, far: f32) {
        self.record(GlCall::DepthRange(near, far));
    }

    fn color_mask(&self, r: bool, g: bool, b: bool, a: bool) {
        self.record(GlCall::ColorMask([r, g, b, a]));
    }

    fn cull_face(&self, mode: u32) {
        self.record(GlCall::CullFace(mode));
    }

    fn front_face(&self, mode: u32) {
        self.record(GlCall::FrontFace(mode));
    }

    fn viewport(&self, x: i32, y: i32, width: i32, height: i32) {
        self.record(GlCall::Viewport([x, y, width, height]));
    }

    fn scissor(&self, x: i32, y: i32, width: i32, height: i32) {
        self.record(GlCall::Scissor([x, y, width, height]));
    }

    fn polygon_offset(&self, factor: f32, units: f32) {
        self.record(GlCall::PolygonOffset(factor, units));
    }

    fn line_width(&self, width: f32) {
        self.record(GlCall::LineWidth(width));
    }

    fn clear_color(&self, r: f32, g: f32, b: f32, a: f32) {
        self.record(GlCall::ClearColor([r, g, b, a]));
    }

    fn clear_depth(&self, depth: f32) {
        self.record(GlCall::ClearDepth(depth));
    }

    fn clear(&self, mask: u32) {
        self.record(GlCall::Clear(mask));
    }

    fn create_framebuffer(&self) -> Result<u32, String> {
        let name = self.name();
        self.record(GlCall::CreateFramebuffer(name));
        Ok(name)
    }

    fn delete_framebuffers(&self, framebuffers: &[u32]) {
        self.record(GlCall::DeleteFramebuffers(framebuffers.to_vec()));
    }

    fn bind_framebuffer(&self, target: u32, framebuffer: u32) {
        self.record(GlCall::BindFramebuffer(target, framebuffer));
    }

    fn framebuffer_texture_2d(
        &self,
        _target: u32,
        attachment: u32,
        _texture_target: u32,
        texture: u32,
        _level: i32,
    ) {
        self.record(GlCall::FramebufferTexture2D {
            attachment,
            texture,
        });
    }

    fn framebuffer_renderbuffer(
        &self,
        _target: u32,
        attachment: u32,
        _renderbuffer_target: u32,
        renderbuffer: u32,
    ) {
        self.record(GlCall::FramebufferRenderbuffer {
            attachment,
            renderbuffer,
        });
    }

    fn draw_buffers(&self, buffers: &[u32]) {
        self.record(GlCall::DrawBuffers(buffers.to_vec()));
    }

    fn read_buffer(&self, buffer: u32) {
        self.record(GlCall::ReadBuffer(buffer));
    }

    fn check_framebuffer_status(&self, _target: u32) -> u32 {
        self.record(GlCall::CheckFramebufferStatus);
        self.framebuffer_status.load(Ordering::Relaxed)
    }

    fn create_renderbuffer(&self) -> Result<u32, String> {
        let name = self.name();
        self.record(GlCall::CreateRenderbuffer(name));
        Ok(name)
    }

    fn delete_renderbuffer(&self, renderbuffer: u32) {
        self.record(GlCall::DeleteRenderbuffer(renderbuffer));
    }

    fn bind_renderbuffer(&self, _target: u32, renderbuffer: u32) {
        self.record(GlCall::BindRenderbuffer(renderbuffer));
    }

    fn renderbuffer_storage(&self, _target: u32, internal_format: u32, width: i32, height: i32) {
        self.record(GlCall::RenderbufferStorage {
            internal_format,
            width,
            height,
        });
    }
}

struct PlatformState {
    device: Arc<RecordingDevice>,
    bound: Mutex<FxHashSet<ThreadId>>,
    window_thread: Mutex<Option<ThreadId>>,
    bind_failure: Mutex<Option<String>>,
    surface_lost: Mutex<FxHashSet<ThreadId>>,
    vsync: AtomicBool,
    binds: AtomicUsize,
    unbinds: AtomicUsize,
    presents: AtomicUsize,
}

/// Platform half of the recording backend. Clones share state, so a test can keep one
/// handle while the context owns another.
#[derive(Clone)]
pub struct RecordingPlatform {
    inner: Arc<PlatformState>,
}

impl RecordingPlatform {
    pub fn new(device: Arc<RecordingDevice>) -> Self {
        Self {
            inner: Arc::new(PlatformState {
                device,
                bound: Mutex::new(FxHashSet::default()),
                window_thread: Mutex::new(None),
                bind_failure: Mutex::new(None),
                surface_lost: Mutex::new(FxHashSet::default()),
                vsync: AtomicBool::new(true),
                binds: AtomicUsize::new(0),
                unbinds: AtomicUsize::new(0),
                presents: AtomicUsize::new(0),
            }),
        }
    }

    pub fn device_handle(&self) -> Arc<RecordingDevice> {
        Arc::clone(&self.inner.device)
    }

    /// Every following `bind` fails with `reason`.
    pub fn fail_binds(&self, reason: &str) {
        *self.inner.bind_failure.lock() = Some(reason.to_string());
    }

    /// Every thread bound right now sees a lost surface on its next `update`.
    pub fn invalidate_surface(&self) {
        let bound = self.inner.bound.lock().clone();
        self.inner.surface_lost.lock().extend(bound);
    }

    pub fn bind_calls(&self) -> usize {
        self.inner.binds.load(Ordering::Relaxed)
    }

    pub fn unbind_calls(&self) -> usize {
        self.inner.unbinds.load(Ordering::Relaxed)
    }

    pub fn present_calls(&self) -> usize {
        self.inner.presents.load(Ordering::Relaxed)
    }
}

impl PlatformBinding for RecordingPlatform {
    fn name(&self) -> &'static str {
        "recording"
    }

    fn bind(&self, target: Option<&WindowTarget>) -> Result<(), String> {
        if let Some(reason) = self.inner.bind_failure.lock().clone() {
            return Err(reason);
        }
        let me = thread::current().id();
        if !self.inner.bound.lock().insert(me) {
            return Err(format!("{me:?} is already bound"));
        }
        if let Some(target) = target {
            debug!("Recording bind to {}x{} window on {me:?}.", target.width, target.height);
            *self.inner.window_thread.lock() = Some(me);
        }
        self.inner.binds.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn unbind(&self) -> Result<(), String> {
        let me = thread::current().id();
        if !self.inner.bound.lock().remove(&me) {
            return Err(format!("{me:?} is not bound"));
        }
        self.inner.surface_lost.lock().remove(&me);
        let mut window_thread = self.inner.window_thread.lock();
        if *window_thread == Some(me) {
            *window_thread = None;
        }
        self.inner.unbinds.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn is_bound(&self) -> bool {
        self.inner.bound.lock().contains(&thread::current().id())
    }

    fn device(&self) -> Option<Arc<dyn Device>> {
        if !self.is_bound() {
            return None;
        }
        let device: Arc<dyn Device> = self.inner.device.clone();
        Some(device)
    }

    fn flush(&self) {
        self.inner.device.flush();
    }

    fn finish(&self) {
        self.inner.device.finish();
    }

    fn present(&self) -> Result<(), String> {
        let me = thread::current().id();
        if *self.inner.window_thread.lock() != Some(me) {
            return Err(format!("{me:?} does not own the window surface"));
        }
        self.inner.presents.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn update(&self) -> bool {
        self.inner
            .surface_lost
            .lock()
            .remove(&thread::current().id())
    }

    fn swap_interval(&self) -> bool {
        self.inner.vsync.load(Ordering::Relaxed)
    }

    fn set_swap_interval(&self, vsync: bool) -> Result<(), String> {
        self.inner.vsync.store(vsync, Ordering::Relaxed);
        Ok(())
    }

    fn framebuffer_id(&self) -> u32 {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_log_keeps_only_the_most_recent_calls() {
        let device = RecordingDevice::with_call_limit(3);
        for program in 1..=5 {
            device.use_program(program);
        }
        assert_eq!(
            device.calls(),
            vec![
                GlCall::UseProgram(3),
                GlCall::UseProgram(4),
                GlCall::UseProgram(5)
            ]
        );
        device.clear_calls();
        device.flush();
        assert_eq!(device.calls(), vec![GlCall::Flush]);
    }

    #[test]
    fn surface_loss_is_reported_once_per_bound_thread() {
        let platform = RecordingPlatform::new(Arc::new(RecordingDevice::new()));
        platform.bind(None).expect("bind");
        thread::scope(|s| {
            s.spawn(|| {
                platform.bind(None).expect("bind worker");
                platform.invalidate_surface();
                assert!(platform.update());
                assert!(!platform.update());
                platform.unbind().expect("unbind worker");
            });
        });
        assert!(platform.update());
        assert!(!platform.update());
        platform.unbind().expect("unbind");
    }
}
