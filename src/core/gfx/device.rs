//! The raw GL entry points the state cache, the framebuffer registry and render targets drive.
//!
//! Object names are plain `u32`s with `0` meaning "none", exactly as GL itself hands them
//! out. Implementations issue the call against whatever context is current on the calling
//! thread; they keep no state of their own beyond the function table.

/// A table of GL functions. Shared by every thread bound to the same context group, so it
/// must be `Send + Sync`; each call still only affects the caller's current context.
pub trait Device: Send + Sync {
    fn get_integer(&self, pname: u32) -> i32;
    fn get_error(&self) -> u32;
    fn flush(&self);
    fn finish(&self);

    fn enable(&self, cap: u32);
    fn disable(&self, cap: u32);
    fn use_program(&self, program: u32);

    fn create_vertex_array(&self) -> Result<u32, String>;
    fn delete_vertex_array(&self, vertex_array: u32);
    fn bind_vertex_array(&self, vertex_array: u32);
    fn bind_buffer(&self, target: u32, buffer: u32);
    fn enable_vertex_attrib_array(&self, index: u32);
    fn disable_vertex_attrib_array(&self, index: u32);

    fn active_texture(&self, unit: u32);
    fn bind_texture(&self, target: u32, texture: u32);
    fn create_texture(&self) -> Result<u32, String>;
    fn delete_texture(&self, texture: u32);
    fn tex_parameter_i32(&self, target: u32, pname: u32, param: i32);
    #[allow(clippy::too_many_arguments)]
    fn tex_image_2d(
        &self,
        target: u32,
        level: i32,
        internal_format: i32,
        width: i32,
        height: i32,
        format: u32,
        ty: u32,
    );
    #[allow(clippy::too_many_arguments)]
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
    );

    fn blend_equation(&self, mode: u32);
    fn blend_equation_separate(&self, mode_rgb: u32, mode_alpha: u32);
    fn blend_func(&self, src: u32, dst: u32);
    fn blend_func_separate(&self, src_rgb: u32, dst_rgb: u32, src_alpha: u32, dst_alpha: u32);
    fn blend_color(&self, r: f32, g: f32, b: f32, a: f32);
    fn depth_func(&self, func: u32);
    fn depth_mask(&self, mask: bool);
    fn depth_range(&self, near: f32, far: f32);
    fn color_mask(&self, r: bool, g: bool, b: bool, a: bool);
    fn cull_face(&self, mode: u32);
    fn front_face(&self, mode: u32);
    fn viewport(&self, x: i32, y: i32, width: i32, height: i32);
    fn scissor(&self, x: i32, y: i32, width: i32, height: i32);
    fn polygon_offset(&self, factor: f32, units: f32);
    fn line_width(&self, width: f32);
    fn clear_color(&self, r: f32, g: f32, b: f32, a: f32);
    fn clear_depth(&self, depth: f32);
    fn clear(&self, mask: u32);

    fn create_framebuffer(&self) -> Result<u32, String>;
    fn delete_framebuffers(&self, framebuffers: &[u32]);
    fn bind_framebuffer(&self, target: u32, framebuffer: u32);
    fn framebuffer_texture_2d(
        &self,
        target: u32,
        attachment: u32,
        texture_target: u32,
        texture: u32,
        level: i32,
    );
    fn framebuffer_renderbuffer(
        &self,
        target: u32,
        attachment: u32,
        renderbuffer_target: u32,
        renderbuffer: u32,
    );
    fn draw_buffers(&self, buffers: &[u32]);
    fn read_buffer(&self, buffer: u32);
    fn check_framebuffer_status(&self, target: u32) -> u32;

    fn create_renderbuffer(&self) -> Result<u32, String>;
    fn delete_renderbuffer(&self, renderbuffer: u32);
    fn bind_renderbuffer(&self, target: u32, renderbuffer: u32);
    fn renderbuffer_storage(&self, target: u32, internal_format: u32, width: i32, height: i32);
}
