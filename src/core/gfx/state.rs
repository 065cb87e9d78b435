//! Per-thread mirror of the GL state that is expensive to query.
//!
//! One `RenderStateCache` exists for every thread that currently holds a bound context. It
//! must always agree with the device: each mutator compares against the cached value, issues
//! the call only when something changes, and then records the new value.

use crate::core::gfx::GfxError;
use crate::core::gfx::device::Device;
use bitflags::bitflags;
use log::{error, warn};
use rustc_hash::FxHashMap;
use smallvec::{SmallVec, smallvec};
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Capability {
    Blend,
    DepthTest,
    CullFace,
    PolygonOffsetFill,
    ScissorTest,
}

impl Capability {
    pub const ALL: [Self; 5] = [
        Self::Blend,
        Self::DepthTest,
        Self::CullFace,
        Self::PolygonOffsetFill,
        Self::ScissorTest,
    ];

    pub const fn to_gl(self) -> u32 {
        match self {
            Self::Blend => glow::BLEND,
            Self::DepthTest => glow::DEPTH_TEST,
            Self::CullFace => glow::CULL_FACE,
            Self::PolygonOffsetFill => glow::POLYGON_OFFSET_FILL,
            Self::ScissorTest => glow::SCISSOR_TEST,
        }
    }

    pub const fn from_gl(value: u32) -> Option<Self> {
        match value {
            glow::BLEND => Some(Self::Blend),
            glow::DEPTH_TEST => Some(Self::DepthTest),
            glow::CULL_FACE => Some(Self::CullFace),
            glow::POLYGON_OFFSET_FILL => Some(Self::PolygonOffsetFill),
            glow::SCISSOR_TEST => Some(Self::ScissorTest),
            _ => None,
        }
    }

    const fn flag(self) -> EnableFlags {
        match self {
            Self::Blend => EnableFlags::BLEND,
            Self::DepthTest => EnableFlags::DEPTH_TEST,
            Self::CullFace => EnableFlags::CULL_FACE,
            Self::PolygonOffsetFill => EnableFlags::POLYGON_OFFSET_FILL,
            Self::ScissorTest => EnableFlags::SCISSOR_TEST,
        }
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct EnableFlags: u8 {
        const BLEND = 1;
        const DEPTH_TEST = 1 << 1;
        const CULL_FACE = 1 << 2;
        const POLYGON_OFFSET_FILL = 1 << 3;
        const SCISSOR_TEST = 1 << 4;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrontFace {
    Ccw,
    Cw,
}

impl FrontFace {
    pub const fn to_gl(self) -> u32 {
        match self {
            Self::Ccw => glow::CCW,
            Self::Cw => glow::CW,
        }
    }

    pub const fn from_gl(value: u32) -> Option<Self> {
        match value {
            glow::CCW => Some(Self::Ccw),
            glow::CW => Some(Self::Cw),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CullFace {
    Front,
    Back,
    FrontAndBack,
}

impl CullFace {
    pub const fn to_gl(self) -> u32 {
        match self {
            Self::Front => glow::FRONT,
            Self::Back => glow::BACK,
            Self::FrontAndBack => glow::FRONT_AND_BACK,
        }
    }

    pub const fn from_gl(value: u32) -> Option<Self> {
        match value {
            glow::FRONT => Some(Self::Front),
            glow::BACK => Some(Self::Back),
            glow::FRONT_AND_BACK => Some(Self::FrontAndBack),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompareFunc {
    Never,
    Less,
    Equal,
    LessEqual,
    Greater,
    NotEqual,
    GreaterEqual,
    Always,
}

impl CompareFunc {
    pub const fn to_gl(self) -> u32 {
        match self {
            Self::Never => glow::NEVER,
            Self::Less => glow::LESS,
            Self::Equal => glow::EQUAL,
            Self::LessEqual => glow::LEQUAL,
            Self::Greater => glow::GREATER,
            Self::NotEqual => glow::NOTEQUAL,
            Self::GreaterEqual => glow::GEQUAL,
            Self::Always => glow::ALWAYS,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlendEquation {
    Add,
    Subtract,
    ReverseSubtract,
    Min,
    Max,
}

impl BlendEquation {
    pub const fn to_gl(self) -> u32 {
        match self {
            Self::Add => glow::FUNC_ADD,
            Self::Subtract => glow::FUNC_SUBTRACT,
            Self::ReverseSubtract => glow::FUNC_REVERSE_SUBTRACT,
            Self::Min => glow::MIN,
            Self::Max => glow::MAX,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlendFactor {
    Zero,
    One,
    SrcColor,
    OneMinusSrcColor,
    DstColor,
    OneMinusDstColor,
    SrcAlpha,
    OneMinusSrcAlpha,
    DstAlpha,
    OneMinusDstAlpha,
    ConstantColor,
    OneMinusConstantColor,
    ConstantAlpha,
    OneMinusConstantAlpha,
    SrcAlphaSaturate,
}

impl BlendFactor {
    pub const fn to_gl(self) -> u32 {
        match self {
            Self::Zero => glow::ZERO,
            Self::One => glow::ONE,
            Self::SrcColor => glow::SRC_COLOR,
            Self::OneMinusSrcColor => glow::ONE_MINUS_SRC_COLOR,
            Self::DstColor => glow::DST_COLOR,
            Self::OneMinusDstColor => glow::ONE_MINUS_DST_COLOR,
            Self::SrcAlpha => glow::SRC_ALPHA,
            Self::OneMinusSrcAlpha => glow::ONE_MINUS_SRC_ALPHA,
            Self::DstAlpha => glow::DST_ALPHA,
            Self::OneMinusDstAlpha => glow::ONE_MINUS_DST_ALPHA,
            Self::ConstantColor => glow::CONSTANT_COLOR,
            Self::OneMinusConstantColor => glow::ONE_MINUS_CONSTANT_COLOR,
            Self::ConstantAlpha => glow::CONSTANT_ALPHA,
            Self::OneMinusConstantAlpha => glow::ONE_MINUS_CONSTANT_ALPHA,
            Self::SrcAlphaSaturate => glow::SRC_ALPHA_SATURATE,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlendFunc {
    pub src_rgb: BlendFactor,
    pub dst_rgb: BlendFactor,
    pub src_alpha: BlendFactor,
    pub dst_alpha: BlendFactor,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TextureTarget {
    Texture2D,
    Texture3D,
    Texture2DArray,
    TextureCubeMap,
}

impl TextureTarget {
    pub const fn to_gl(self) -> u32 {
        match self {
            Self::Texture2D => glow::TEXTURE_2D,
            Self::Texture3D => glow::TEXTURE_3D,
            Self::Texture2DArray => glow::TEXTURE_2D_ARRAY,
            Self::TextureCubeMap => glow::TEXTURE_CUBE_MAP,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl Rect {
    pub const fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeviceLimits {
    pub max_combined_texture_units: i32,
    pub max_vertex_attribs: i32,
    pub max_texture_size: i32,
    pub max_draw_buffers: i32,
    pub max_color_attachments: i32,
}

impl DeviceLimits {
    fn query(device: &dyn Device) -> Self {
        let get = |pname: u32, name: &str| {
            let value = device.get_integer(pname);
            if value > 0 {
                value
            } else {
                warn!("Device reported {name}={value}; assuming 1.");
                1
            }
        };
        Self {
            max_combined_texture_units: get(
                glow::MAX_COMBINED_TEXTURE_IMAGE_UNITS,
                "MAX_COMBINED_TEXTURE_IMAGE_UNITS",
            ),
            max_vertex_attribs: get(glow::MAX_VERTEX_ATTRIBS, "MAX_VERTEX_ATTRIBS"),
            max_texture_size: get(glow::MAX_TEXTURE_SIZE, "MAX_TEXTURE_SIZE"),
            max_draw_buffers: get(glow::MAX_DRAW_BUFFERS, "MAX_DRAW_BUFFERS"),
            max_color_attachments: get(glow::MAX_COLOR_ATTACHMENTS, "MAX_COLOR_ATTACHMENTS"),
        }
    }
}

/// A named `glGetError` result.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GlError {
    InvalidEnum,
    InvalidValue,
    InvalidOperation,
    StackOverflow,
    StackUnderflow,
    OutOfMemory,
    InvalidFramebufferOperation,
    Unknown(u32),
}

impl GlError {
    pub const fn from_code(code: u32) -> Option<Self> {
        match code {
            glow::NO_ERROR => None,
            glow::INVALID_ENUM => Some(Self::InvalidEnum),
            glow::INVALID_VALUE => Some(Self::InvalidValue),
            glow::INVALID_OPERATION => Some(Self::InvalidOperation),
            glow::STACK_OVERFLOW => Some(Self::StackOverflow),
            glow::STACK_UNDERFLOW => Some(Self::StackUnderflow),
            glow::OUT_OF_MEMORY => Some(Self::OutOfMemory),
            glow::INVALID_FRAMEBUFFER_OPERATION => Some(Self::InvalidFramebufferOperation),
            other => Some(Self::Unknown(other)),
        }
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidEnum => "GL_INVALID_ENUM",
            Self::InvalidValue => "GL_INVALID_VALUE",
            Self::InvalidOperation => "GL_INVALID_OPERATION",
            Self::StackOverflow => "GL_STACK_OVERFLOW",
            Self::StackUnderflow => "GL_STACK_UNDERFLOW",
            Self::OutOfMemory => "GL_OUT_OF_MEMORY",
            Self::InvalidFramebufferOperation => "GL_INVALID_FRAMEBUFFER_OPERATION",
            Self::Unknown(_) => "Unknown",
        }
    }
}

// State that belongs to a vertex array object rather than to the context.
#[derive(Clone, Debug)]
struct VertexArrayState {
    vertex_buffer: u32,
    index_buffer: u32,
    attribs_enabled: SmallVec<[bool; 16]>,
}

impl VertexArrayState {
    fn disabled(attribs: usize) -> Self {
        Self {
            vertex_buffer: 0,
            index_buffer: 0,
            attribs_enabled: smallvec![false; attribs],
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct TextureUnit {
    target: TextureTarget,
    texture: u32,
}

const UNBOUND_UNIT: TextureUnit = TextureUnit {
    target: TextureTarget::Texture2D,
    texture: 0,
};

// Engine defaults re-established by `reset`.
const DEFAULT_BLEND_FUNC: BlendFunc = BlendFunc {
    src_rgb: BlendFactor::One,
    dst_rgb: BlendFactor::Zero,
    src_alpha: BlendFactor::One,
    dst_alpha: BlendFactor::Zero,
};
const DEFAULT_RECT: Rect = Rect::new(0, 0, 1, 1);

pub struct RenderStateCache {
    device: Arc<dyn Device>,
    limits: DeviceLimits,
    enabled: EnableFlags,
    framebuffer: u32,
    vertex_array: u32,
    default_vertex_array: u32,
    program: u32,
    color_mask: [bool; 4],
    clear_color: [f32; 4],
    clear_depth: f32,
    blend_color: [f32; 4],
    blend_equation: (BlendEquation, BlendEquation),
    blend_func: BlendFunc,
    depth_mask: bool,
    depth_func: CompareFunc,
    active_texture: u32,
    texture_units: Vec<TextureUnit>,
    front_face: FrontFace,
    cull_face: CullFace,
    viewport: Rect,
    scissor: Rect,
    depth_range: (f32, f32),
    polygon_offset: (f32, f32),
    line_width: f32,
    vertex_arrays: FxHashMap<u32, VertexArrayState>,
}

impl RenderStateCache {
    /// A cache that has not talked to the device yet. Call `reset` once the context is
    /// current before using it.
    pub fn new(device: Arc<dyn Device>) -> Self {
        Self {
            device,
            limits: DeviceLimits::default(),
            enabled: EnableFlags::empty(),
            framebuffer: 0,
            vertex_array: 0,
            default_vertex_array: 0,
            program: 0,
            color_mask: [true; 4],
            clear_color: [0.0; 4],
            clear_depth: 1.0,
            blend_color: [0.0; 4],
            blend_equation: (BlendEquation::Add, BlendEquation::Add),
            blend_func: DEFAULT_BLEND_FUNC,
            depth_mask: false,
            depth_func: CompareFunc::Always,
            active_texture: 0,
            texture_units: Vec::new(),
            front_face: FrontFace::Ccw,
            cull_face: CullFace::Back,
            viewport: DEFAULT_RECT,
            scissor: DEFAULT_RECT,
            depth_range: (0.0, 1.0),
            polygon_offset: (0.0, 0.0),
            line_width: 1.0,
            vertex_arrays: FxHashMap::default(),
        }
    }

    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }

    pub const fn limits(&self) -> DeviceLimits {
        self.limits
    }

    /// Re-queries device limits, recreates the default vertex array, forgets every tracked
    /// array object and pushes engine defaults for every cached value to the device.
    pub fn reset(&mut self) -> Result<(), GfxError> {
        let d = Arc::clone(&self.device);

        if self.default_vertex_array != 0 {
            d.delete_vertex_array(self.default_vertex_array);
            self.default_vertex_array = 0;
        }
        self.vertex_arrays.clear();

        self.limits = DeviceLimits::query(d.as_ref());
        let default_vertex_array = d.create_vertex_array().map_err(GfxError::ObjectCreation)?;
        self.default_vertex_array = default_vertex_array;

        let units = self.limits.max_combined_texture_units as usize;
        self.texture_units = vec![UNBOUND_UNIT; units];
        for unit in 0..units as u32 {
            d.active_texture(glow::TEXTURE0 + unit);
            d.bind_texture(glow::TEXTURE_2D, 0);
        }
        d.active_texture(glow::TEXTURE0);
        self.active_texture = 0;

        self.framebuffer = 0;
        d.bind_framebuffer(glow::FRAMEBUFFER, 0);
        self.vertex_array = default_vertex_array;
        d.bind_vertex_array(default_vertex_array);
        d.bind_buffer(glow::ARRAY_BUFFER, 0);
        d.bind_buffer(glow::ELEMENT_ARRAY_BUFFER, 0);
        self.program = 0;
        d.use_program(0);

        self.color_mask = [true; 4];
        d.color_mask(true, true, true, true);
        self.clear_color = [0.0; 4];
        d.clear_color(0.0, 0.0, 0.0, 0.0);
        self.blend_color = [0.0; 4];
        d.blend_color(0.0, 0.0, 0.0, 0.0);
        self.blend_func = DEFAULT_BLEND_FUNC;
        d.blend_func(glow::ONE, glow::ZERO);
        self.blend_equation = (BlendEquation::Add, BlendEquation::Add);
        d.blend_equation(glow::FUNC_ADD);
        self.front_face = FrontFace::Ccw;
        d.front_face(glow::CCW);
        self.cull_face = CullFace::Back;
        d.cull_face(glow::BACK);
        self.depth_mask = false;
        d.depth_mask(false);
        self.depth_func = CompareFunc::Always;
        d.depth_func(glow::ALWAYS);
        self.clear_depth = 1.0;
        d.clear_depth(1.0);
        self.depth_range = (0.0, 1.0);
        d.depth_range(0.0, 1.0);
        self.polygon_offset = (0.0, 0.0);
        d.polygon_offset(0.0, 0.0);
        self.viewport = DEFAULT_RECT;
        d.viewport(0, 0, 1, 1);
        self.scissor = DEFAULT_RECT;
        d.scissor(0, 0, 1, 1);
        self.line_width = 1.0;
        d.line_width(1.0);

        // AA'd point/line/polygon smoothing is never touched; it is pathologically slow on
        // some drivers.
        self.enabled = EnableFlags::empty();
        for cap in Capability::ALL {
            d.disable(cap.to_gl());
        }

        let attribs = self.limits.max_vertex_attribs as usize;
        self.vertex_arrays
            .insert(default_vertex_array, VertexArrayState::disabled(attribs));
        for index in 0..attribs as u32 {
            d.disable_vertex_attrib_array(index);
        }

        if let Some(err) = self.check_error() {
            error!("Render state reset reported {} ({err:?}).", err.as_str());
        }
        d.flush();
        Ok(())
    }

    /// Deletes the default vertex array. The cache is unusable afterwards until `reset`.
    pub fn release(&mut self) {
        if self.default_vertex_array != 0 {
            self.device.delete_vertex_array(self.default_vertex_array);
        }
        self.default_vertex_array = 0;
        self.vertex_array = 0;
        self.vertex_arrays.clear();
    }

    pub fn enable(&mut self, cap: Capability) {
        let flag = cap.flag();
        if self.enabled.contains(flag) {
            return;
        }
        self.device.enable(cap.to_gl());
        self.enabled.insert(flag);
    }

    pub fn disable(&mut self, cap: Capability) {
        let flag = cap.flag();
        if !self.enabled.contains(flag) {
            return;
        }
        self.device.disable(cap.to_gl());
        self.enabled.remove(flag);
    }

    pub fn set_enabled(&mut self, cap: Capability, enabled: bool) {
        if enabled {
            self.enable(cap);
        } else {
            self.disable(cap);
        }
    }

    /// Raw-enum variant of `enable`; values the cache does not track are logged and ignored.
    pub fn enable_gl(&mut self, cap: u32) {
        match Capability::from_gl(cap) {
            Some(cap) => self.enable(cap),
            None => warn!("Ignoring enable of unsupported capability 0x{cap:x}."),
        }
    }

    pub fn disable_gl(&mut self, cap: u32) {
        match Capability::from_gl(cap) {
            Some(cap) => self.disable(cap),
            None => warn!("Ignoring disable of unsupported capability 0x{cap:x}."),
        }
    }

    pub const fn is_enabled(&self, cap: Capability) -> bool {
        self.enabled.contains(cap.flag())
    }

    pub const fn enabled_flags(&self) -> EnableFlags {
        self.enabled
    }

    pub fn use_program(&mut self, program: u32) {
        if self.program == program {
            return;
        }
        self.device.use_program(program);
        self.program = program;
    }

    pub const fn program(&self) -> u32 {
        self.program
    }

    /// Binds `vertex_array` (`0` selects the engine's default array object). The attribute
    /// enables and the index buffer are properties of the array object, so switching arrays
    /// switches the tracked set. Unseen arrays start out with every attribute disabled.
    pub fn bind_vertex_array(&mut self, vertex_array: u32) {
        let id = if vertex_array == 0 {
            self.default_vertex_array
        } else {
            vertex_array
        };
        if self.vertex_array == id {
            return;
        }

        let previous_vertex_buffer = self
            .vertex_arrays
            .get(&self.vertex_array)
            .map_or(0, |va| va.vertex_buffer);

        self.device.bind_vertex_array(id);
        self.vertex_array = id;

        let attribs = self.limits.max_vertex_attribs as usize;
        let (vertex_buffer, fresh) = match self.vertex_arrays.get(&id) {
            Some(va) => (va.vertex_buffer, false),
            None => {
                self.vertex_arrays
                    .insert(id, VertexArrayState::disabled(attribs));
                (0, true)
            }
        };

        // GL_ARRAY_BUFFER is context state; restore the one this array object was last
        // used with so the cached value stays truthful.
        if vertex_buffer != previous_vertex_buffer || fresh {
            self.device.bind_buffer(glow::ARRAY_BUFFER, vertex_buffer);
        }
        if fresh {
            self.device.bind_buffer(glow::ELEMENT_ARRAY_BUFFER, 0);
            for index in 0..attribs as u32 {
                self.device.disable_vertex_attrib_array(index);
            }
        }
    }

    /// Drops tracking for an array object that has been deleted elsewhere.
    pub fn forget_vertex_array(&mut self, vertex_array: u32) {
        if vertex_array == 0 || vertex_array == self.default_vertex_array {
            return;
        }
        if self.vertex_array == vertex_array {
            self.bind_vertex_array(0);
        }
        self.vertex_arrays.remove(&vertex_array);
    }

    pub const fn vertex_array(&self) -> u32 {
        self.vertex_array
    }

    pub const fn default_vertex_array(&self) -> u32 {
        self.default_vertex_array
    }

    pub fn tracked_vertex_arrays(&self) -> usize {
        self.vertex_arrays.len()
    }

    pub fn bind_framebuffer(&mut self, framebuffer: u32) {
        if self.framebuffer == framebuffer {
            return;
        }
        self.device.bind_framebuffer(glow::FRAMEBUFFER, framebuffer);
        self.framebuffer = framebuffer;
    }

    pub const fn framebuffer(&self) -> u32 {
        self.framebuffer
    }

    /// Deletes framebuffer names owned by this thread. A deleted framebuffer that is bound
    /// reverts to 0 on the device, and the cache follows.
    pub fn delete_framebuffers(&mut self, framebuffers: &[u32]) {
        if framebuffers.is_empty() {
            return;
        }
        self.device.delete_framebuffers(framebuffers);
        if framebuffers.contains(&self.framebuffer) {
            self.framebuffer = 0;
        }
    }

    pub fn bind_vertex_buffer(&mut self, buffer: u32) {
        let Some(va) = self.vertex_arrays.get_mut(&self.vertex_array) else {
            warn!("bind_vertex_buffer without a reset render state; ignored.");
            return;
        };
        if va.vertex_buffer == buffer {
            return;
        }
        self.device.bind_buffer(glow::ARRAY_BUFFER, buffer);
        va.vertex_buffer = buffer;
    }

    pub fn bind_index_buffer(&mut self, buffer: u32) {
        let Some(va) = self.vertex_arrays.get_mut(&self.vertex_array) else {
            warn!("bind_index_buffer without a reset render state; ignored.");
            return;
        };
        if va.index_buffer == buffer {
            return;
        }
        self.device.bind_buffer(glow::ELEMENT_ARRAY_BUFFER, buffer);
        va.index_buffer = buffer;
    }

    pub fn vertex_buffer(&self) -> u32 {
        self.vertex_arrays
            .get(&self.vertex_array)
            .map_or(0, |va| va.vertex_buffer)
    }

    pub fn index_buffer(&self) -> u32 {
        self.vertex_arrays
            .get(&self.vertex_array)
            .map_or(0, |va| va.index_buffer)
    }

    pub fn enable_vertex_attrib_array(&mut self, index: u32) {
        self.set_vertex_attrib_array(index, true);
    }

    pub fn disable_vertex_attrib_array(&mut self, index: u32) {
        self.set_vertex_attrib_array(index, false);
    }

    fn set_vertex_attrib_array(&mut self, index: u32, enabled: bool) {
        let Some(va) = self.vertex_arrays.get_mut(&self.vertex_array) else {
            return;
        };
        let Some(slot) = va.attribs_enabled.get_mut(index as usize) else {
            return;
        };
        if *slot == enabled {
            return;
        }
        if enabled {
            self.device.enable_vertex_attrib_array(index);
        } else {
            self.device.disable_vertex_attrib_array(index);
        }
        *slot = enabled;
    }

    pub fn is_vertex_attrib_array_enabled(&self, index: u32) -> bool {
        self.vertex_arrays
            .get(&self.vertex_array)
            .and_then(|va| va.attribs_enabled.get(index as usize).copied())
            .unwrap_or(false)
    }

    /// Selects texture unit `index`; out-of-range units fall back to unit 0.
    pub fn active_texture(&mut self, index: u32) {
        let index = if (index as usize) < self.texture_units.len() {
            index
        } else {
            0
        };
        if self.active_texture == index {
            return;
        }
        self.device.active_texture(glow::TEXTURE0 + index);
        self.active_texture = index;
    }

    pub const fn active_texture_unit(&self) -> u32 {
        self.active_texture
    }

    pub fn bind_texture(&mut self, target: TextureTarget, texture: u32) {
        let wanted = TextureUnit { target, texture };
        let Some(unit) = self.texture_units.get_mut(self.active_texture as usize) else {
            warn!("bind_texture without a reset render state; ignored.");
            return;
        };
        if *unit == wanted {
            return;
        }
        self.device.bind_texture(target.to_gl(), texture);
        *unit = wanted;
    }

    /// `(target, texture)` last bound on `unit`.
    pub fn bound_texture(&self, unit: u32) -> Option<(TextureTarget, u32)> {
        self.texture_units
            .get(unit as usize)
            .map(|u| (u.target, u.texture))
    }

    /// Deletes a texture name. GL unbinds it from every unit of the current context.
    pub fn delete_texture(&mut self, texture: u32) {
        if texture == 0 {
            return;
        }
        self.device.delete_texture(texture);
        for unit in &mut self.texture_units {
            if unit.texture == texture {
                unit.texture = 0;
            }
        }
    }

    pub fn delete_renderbuffer(&mut self, renderbuffer: u32) {
        if renderbuffer != 0 {
            self.device.delete_renderbuffer(renderbuffer);
        }
    }

    pub fn blend_equation(&mut self, equation: BlendEquation) {
        self.blend_equation_separate(equation, equation);
    }

    pub fn blend_equation_separate(&mut self, rgb: BlendEquation, alpha: BlendEquation) {
        if self.blend_equation == (rgb, alpha) {
            return;
        }
        if rgb == alpha {
            self.device.blend_equation(rgb.to_gl());
        } else {
            self.device
                .blend_equation_separate(rgb.to_gl(), alpha.to_gl());
        }
        self.blend_equation = (rgb, alpha);
    }

    /// `(rgb, alpha)` blend equations.
    pub const fn blend_equations(&self) -> (BlendEquation, BlendEquation) {
        self.blend_equation
    }

    pub fn blend_func(&mut self, src: BlendFactor, dst: BlendFactor) {
        self.blend_func_separate(src, dst, src, dst);
    }

    pub fn blend_func_separate(
        &mut self,
        src_rgb: BlendFactor,
        dst_rgb: BlendFactor,
        src_alpha: BlendFactor,
        dst_alpha: BlendFactor,
    ) {
        let wanted = BlendFunc {
            src_rgb,
            dst_rgb,
            src_alpha,
            dst_alpha,
        };
        if self.blend_func == wanted {
            return;
        }
        if src_rgb == src_alpha && dst_rgb == dst_alpha {
            self.device.blend_func(src_rgb.to_gl(), dst_rgb.to_gl());
        } else {
            self.device.blend_func_separate(
                src_rgb.to_gl(),
                dst_rgb.to_gl(),
                src_alpha.to_gl(),
                dst_alpha.to_gl(),
            );
        }
        self.blend_func = wanted;
    }

    pub const fn blend_funcs(&self) -> BlendFunc {
        self.blend_func
    }

    pub fn blend_color(&mut self, r: f32, g: f32, b: f32, a: f32) {
        let wanted = clamp4([r, g, b, a]);
        if self.blend_color == wanted {
            return;
        }
        let [r, g, b, a] = wanted;
        self.device.blend_color(r, g, b, a);
        self.blend_color = wanted;
    }

    pub const fn blend_color_value(&self) -> [f32; 4] {
        self.blend_color
    }

    pub fn depth_func(&mut self, func: CompareFunc) {
        if self.depth_func == func {
            return;
        }
        self.device.depth_func(func.to_gl());
        self.depth_func = func;
    }

    pub const fn depth_func_value(&self) -> CompareFunc {
        self.depth_func
    }

    pub fn depth_mask(&mut self, mask: bool) {
        if self.depth_mask == mask {
            return;
        }
        self.device.depth_mask(mask);
        self.depth_mask = mask;
    }

    pub const fn depth_mask_value(&self) -> bool {
        self.depth_mask
    }

    pub fn depth_range(&mut self, near: f32, far: f32) {
        let wanted = (near.clamp(0.0, 1.0), far.clamp(0.0, 1.0));
        if self.depth_range == wanted {
            return;
        }
        self.device.depth_range(wanted.0, wanted.1);
        self.depth_range = wanted;
    }

    pub const fn depth_range_value(&self) -> (f32, f32) {
        self.depth_range
    }

    pub fn color_mask(&mut self, r: bool, g: bool, b: bool, a: bool) {
        let wanted = [r, g, b, a];
        if self.color_mask == wanted {
            return;
        }
        self.device.color_mask(r, g, b, a);
        self.color_mask = wanted;
    }

    pub const fn color_mask_value(&self) -> [bool; 4] {
        self.color_mask
    }

    pub fn cull_face(&mut self, face: CullFace) {
        if self.cull_face == face {
            return;
        }
        self.device.cull_face(face.to_gl());
        self.cull_face = face;
    }

    pub fn cull_face_gl(&mut self, mode: u32) {
        match CullFace::from_gl(mode) {
            Some(face) => self.cull_face(face),
            None => warn!("Ignoring unsupported cull face mode 0x{mode:x}."),
        }
    }

    pub const fn cull_face_value(&self) -> CullFace {
        self.cull_face
    }

    pub fn front_face(&mut self, face: FrontFace) {
        if self.front_face == face {
            return;
        }
        self.device.front_face(face.to_gl());
        self.front_face = face;
    }

    pub fn front_face_gl(&mut self, mode: u32) {
        match FrontFace::from_gl(mode) {
            Some(face) => self.front_face(face),
            None => warn!("Ignoring unsupported front face mode 0x{mode:x}."),
        }
    }

    pub const fn front_face_value(&self) -> FrontFace {
        self.front_face
    }

    pub fn viewport(&mut self, rect: Rect) {
        if self.viewport == rect {
            return;
        }
        self.device
            .viewport(rect.x, rect.y, rect.width, rect.height);
        self.viewport = rect;
    }

    pub const fn viewport_rect(&self) -> Rect {
        self.viewport
    }

    pub fn scissor(&mut self, rect: Rect) {
        if self.scissor == rect {
            return;
        }
        self.device
            .scissor(rect.x, rect.y, rect.width, rect.height);
        self.scissor = rect;
    }

    pub const fn scissor_rect(&self) -> Rect {
        self.scissor
    }

    pub fn polygon_offset(&mut self, factor: f32, units: f32) {
        if self.polygon_offset == (factor, units) {
            return;
        }
        self.device.polygon_offset(factor, units);
        self.polygon_offset = (factor, units);
    }

    pub const fn polygon_offset_value(&self) -> (f32, f32) {
        self.polygon_offset
    }

    /// Wide lines are not portable; anything above 1.0 may be clamped by the driver.
    pub fn line_width(&mut self, width: f32) {
        if self.line_width == width {
            return;
        }
        self.device.line_width(width);
        self.line_width = width;
    }

    pub const fn line_width_value(&self) -> f32 {
        self.line_width
    }

    pub fn clear_color(&mut self, r: f32, g: f32, b: f32, a: f32) {
        let wanted = clamp4([r, g, b, a]);
        if self.clear_color == wanted {
            return;
        }
        let [r, g, b, a] = wanted;
        self.device.clear_color(r, g, b, a);
        self.clear_color = wanted;
    }

    pub const fn clear_color_value(&self) -> [f32; 4] {
        self.clear_color
    }

    pub fn clear_depth(&mut self, depth: f32) {
        let depth = depth.clamp(0.0, 1.0);
        if self.clear_depth == depth {
            return;
        }
        self.device.clear_depth(depth);
        self.clear_depth = depth;
    }

    pub const fn clear_depth_value(&self) -> f32 {
        self.clear_depth
    }

    pub fn flush(&self) {
        self.device.flush();
    }

    pub fn finish(&self) {
        self.device.finish();
    }

    pub fn check_error(&self) -> Option<GlError> {
        GlError::from_code(self.device.get_error())
    }
}

#[inline(always)]
fn clamp4(v: [f32; 4]) -> [f32; 4] {
    v.map(|c| c.clamp(0.0, 1.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::gfx::backends::recording::{GlCall, RecordingDevice};

    fn reset_cache() -> (Arc<RecordingDevice>, RenderStateCache) {
        let device = Arc::new(RecordingDevice::new());
        let mut state = RenderStateCache::new(device.clone());
        state.reset().expect("reset against the recording device");
        device.clear_calls();
        (device, state)
    }

    #[test]
    fn repeated_mutators_issue_one_device_call() {
        let (device, mut state) = reset_cache();

        for _ in 0..3 {
            state.use_program(7);
            state.enable(Capability::Blend);
            state.blend_func(BlendFactor::SrcAlpha, BlendFactor::OneMinusSrcAlpha);
            state.blend_equation(BlendEquation::ReverseSubtract);
            state.blend_color(0.5, 0.5, 0.5, 1.0);
            state.depth_func(CompareFunc::LessEqual);
            state.depth_mask(true);
            state.depth_range(0.1, 0.9);
            state.color_mask(true, false, true, false);
            state.cull_face(CullFace::Front);
            state.front_face(FrontFace::Cw);
            state.viewport(Rect::new(0, 0, 640, 480));
            state.scissor(Rect::new(8, 8, 32, 32));
            state.polygon_offset(1.0, 2.0);
            state.line_width(2.0);
            state.clear_color(0.2, 0.3, 0.4, 1.0);
            state.clear_depth(0.5);
            state.bind_framebuffer(3);
            state.bind_vertex_buffer(11);
            state.bind_index_buffer(12);
            state.active_texture(2);
            state.bind_texture(TextureTarget::Texture2D, 21);
            state.enable_vertex_attrib_array(4);
        }

        assert_eq!(device.count(|c| matches!(c, GlCall::UseProgram(_))), 1);
        assert_eq!(device.count(|c| matches!(c, GlCall::Enable(_))), 1);
        assert_eq!(device.count(|c| matches!(c, GlCall::BlendFunc(..))), 1);
        assert_eq!(device.count(|c| matches!(c, GlCall::BlendEquation(_))), 1);
        assert_eq!(device.count(|c| matches!(c, GlCall::BlendColor(_))), 1);
        assert_eq!(device.count(|c| matches!(c, GlCall::DepthFunc(_))), 1);
        assert_eq!(device.count(|c| matches!(c, GlCall::DepthMask(_))), 1);
        assert_eq!(device.count(|c| matches!(c, GlCall::DepthRange(..))), 1);
        assert_eq!(device.count(|c| matches!(c, GlCall::ColorMask(_))), 1);
        assert_eq!(device.count(|c| matches!(c, GlCall::CullFace(_))), 1);
        assert_eq!(device.count(|c| matches!(c, GlCall::FrontFace(_))), 1);
        assert_eq!(device.count(|c| matches!(c, GlCall::Viewport(_))), 1);
        assert_eq!(device.count(|c| matches!(c, GlCall::Scissor(_))), 1);
        assert_eq!(device.count(|c| matches!(c, GlCall::PolygonOffset(..))), 1);
        assert_eq!(device.count(|c| matches!(c, GlCall::LineWidth(_))), 1);
        assert_eq!(device.count(|c| matches!(c, GlCall::ClearColor(_))), 1);
        assert_eq!(device.count(|c| matches!(c, GlCall::ClearDepth(_))), 1);
        assert_eq!(device.count(|c| matches!(c, GlCall::BindFramebuffer(..))), 1);
        assert_eq!(device.count(|c| matches!(c, GlCall::BindBuffer(..))), 2);
        assert_eq!(device.count(|c| matches!(c, GlCall::ActiveTexture(_))), 1);
        assert_eq!(device.count(|c| matches!(c, GlCall::BindTexture(..))), 1);
        assert_eq!(
            device.count(|c| matches!(c, GlCall::EnableVertexAttribArray(_))),
            1
        );
    }

    #[test]
    fn values_that_match_defaults_after_reset_are_suppressed() {
        let (device, mut state) = reset_cache();
        state.disable(Capability::DepthTest);
        state.use_program(0);
        state.bind_framebuffer(0);
        state.clear_depth(1.0);
        state.viewport(Rect::new(0, 0, 1, 1));
        state.blend_func(BlendFactor::One, BlendFactor::Zero);
        assert!(device.calls().is_empty());
    }

    #[test]
    fn reset_restores_engine_defaults_and_binds_default_vertex_array() {
        let device = Arc::new(RecordingDevice::new());
        let mut state = RenderStateCache::new(device.clone());
        state.reset().expect("first reset");

        state.enable(Capability::Blend);
        state.enable(Capability::ScissorTest);
        state.use_program(9);
        state.bind_framebuffer(4);
        state.bind_vertex_array(40);
        state.enable_vertex_attrib_array(1);
        state.depth_mask(true);
        state.clear_color(1.0, 1.0, 1.0, 1.0);
        state.active_texture(3);
        state.bind_texture(TextureTarget::TextureCubeMap, 8);
        let first_default = state.default_vertex_array();

        state.reset().expect("second reset");

        assert!(Capability::ALL.iter().all(|&cap| !state.is_enabled(cap)));
        assert_eq!(state.program(), 0);
        assert_eq!(state.framebuffer(), 0);
        assert_ne!(state.default_vertex_array(), 0);
        assert_ne!(state.default_vertex_array(), first_default);
        assert_eq!(state.vertex_array(), state.default_vertex_array());
        assert_eq!(state.tracked_vertex_arrays(), 1);
        assert_eq!(state.vertex_buffer(), 0);
        assert_eq!(state.index_buffer(), 0);
        assert!(!state.is_vertex_attrib_array_enabled(1));
        assert!(!state.depth_mask_value());
        assert_eq!(state.depth_func_value(), CompareFunc::Always);
        assert_eq!(state.clear_color_value(), [0.0; 4]);
        assert_eq!(state.clear_depth_value(), 1.0);
        assert_eq!(state.blend_color_value(), [0.0; 4]);
        assert_eq!(state.blend_funcs(), DEFAULT_BLEND_FUNC);
        assert_eq!(
            state.blend_equations(),
            (BlendEquation::Add, BlendEquation::Add)
        );
        assert_eq!(state.color_mask_value(), [true; 4]);
        assert_eq!(state.cull_face_value(), CullFace::Back);
        assert_eq!(state.front_face_value(), FrontFace::Ccw);
        assert_eq!(state.viewport_rect(), Rect::new(0, 0, 1, 1));
        assert_eq!(state.scissor_rect(), Rect::new(0, 0, 1, 1));
        assert_eq!(state.depth_range_value(), (0.0, 1.0));
        assert_eq!(state.polygon_offset_value(), (0.0, 0.0));
        assert_eq!(state.line_width_value(), 1.0);
        assert_eq!(state.active_texture_unit(), 0);
        assert_eq!(state.bound_texture(3), Some((TextureTarget::Texture2D, 0)));
        assert_eq!(state.limits().max_vertex_attribs, 16);

        assert_eq!(
            device.count(|c| matches!(c, GlCall::DeleteVertexArray(id) if *id == first_default)),
            1
        );
    }

    #[test]
    fn unseen_vertex_array_gets_attributes_disabled() {
        let (device, mut state) = reset_cache();
        state.bind_vertex_array(50);

        let attribs = state.limits().max_vertex_attribs as usize;
        assert_eq!(
            device.count(|c| matches!(c, GlCall::DisableVertexAttribArray(_))),
            attribs
        );
        assert_eq!(state.vertex_array(), 50);
        assert_eq!(state.tracked_vertex_arrays(), 2);

        // Known array: switching back and forth issues only the bind.
        state.bind_vertex_array(0);
        device.clear_calls();
        state.bind_vertex_array(50);
        assert_eq!(device.calls(), vec![GlCall::BindVertexArray(50)]);
    }

    #[test]
    fn attribute_enables_follow_the_bound_vertex_array() {
        let (_device, mut state) = reset_cache();
        state.bind_vertex_array(60);
        state.enable_vertex_attrib_array(2);
        state.bind_index_buffer(5);

        state.bind_vertex_array(0);
        assert!(!state.is_vertex_attrib_array_enabled(2));
        assert_eq!(state.index_buffer(), 0);

        state.bind_vertex_array(60);
        assert!(state.is_vertex_attrib_array_enabled(2));
        assert_eq!(state.index_buffer(), 5);
    }

    #[test]
    fn switching_vertex_arrays_restores_their_vertex_buffer() {
        let (device, mut state) = reset_cache();
        state.bind_vertex_buffer(30);
        state.bind_vertex_array(70);
        state.bind_vertex_buffer(31);
        device.clear_calls();

        state.bind_vertex_array(0);
        assert_eq!(
            device.calls(),
            vec![
                GlCall::BindVertexArray(state.default_vertex_array()),
                GlCall::BindBuffer(glow::ARRAY_BUFFER, 30),
            ]
        );
        assert_eq!(state.vertex_buffer(), 30);
    }

    #[test]
    fn forgetting_current_vertex_array_falls_back_to_default() {
        let (_device, mut state) = reset_cache();
        state.bind_vertex_array(80);
        state.forget_vertex_array(80);
        assert_eq!(state.vertex_array(), state.default_vertex_array());
        assert_eq!(state.tracked_vertex_arrays(), 1);
    }

    #[test]
    fn unsupported_raw_values_are_ignored() {
        // Legacy GL_POINT_SMOOTH; glow does not export it.
        const POINT_SMOOTH: u32 = 0x0B10;
        let (device, mut state) = reset_cache();
        state.enable_gl(POINT_SMOOTH);
        state.cull_face_gl(glow::CCW);
        state.front_face_gl(glow::BACK);
        assert!(device.calls().is_empty());

        state.enable_gl(glow::DEPTH_TEST);
        assert!(state.is_enabled(Capability::DepthTest));
        assert_eq!(device.calls(), vec![GlCall::Enable(glow::DEPTH_TEST)]);
    }

    #[test]
    fn set_enabled_tracks_the_flag_set() {
        let (device, mut state) = reset_cache();
        state.set_enabled(Capability::CullFace, true);
        state.set_enabled(Capability::ScissorTest, true);
        state.set_enabled(Capability::CullFace, true);
        assert_eq!(
            state.enabled_flags(),
            EnableFlags::CULL_FACE | EnableFlags::SCISSOR_TEST
        );

        state.set_enabled(Capability::CullFace, false);
        state.set_enabled(Capability::Blend, false);
        assert_eq!(state.enabled_flags(), EnableFlags::SCISSOR_TEST);
        assert_eq!(
            device.calls(),
            vec![
                GlCall::Enable(glow::CULL_FACE),
                GlCall::Enable(glow::SCISSOR_TEST),
                GlCall::Disable(glow::CULL_FACE),
            ]
        );
    }

    #[test]
    fn device_error_during_reset_is_drained() {
        let device = Arc::new(RecordingDevice::new());
        let mut state = RenderStateCache::new(device.clone());
        device.raise_error(glow::INVALID_OPERATION);
        state.reset().expect("reset survives a device error");
        assert_eq!(state.check_error(), None);

        device.raise_error(glow::OUT_OF_MEMORY);
        assert_eq!(state.check_error(), Some(GlError::OutOfMemory));
    }

    #[test]
    fn colors_and_depth_are_clamped_before_comparison() {
        let (device, mut state) = reset_cache();
        state.clear_color(-1.0, 0.0, 0.0, 0.0);
        state.clear_depth(4.0);
        state.depth_range(-2.0, 3.0);
        assert!(device.calls().is_empty());
        assert_eq!(state.clear_color_value(), [0.0; 4]);
    }

    #[test]
    fn separate_blend_uses_the_separate_entry_points() {
        let (device, mut state) = reset_cache();
        state.blend_func_separate(
            BlendFactor::SrcAlpha,
            BlendFactor::OneMinusSrcAlpha,
            BlendFactor::One,
            BlendFactor::Zero,
        );
        state.blend_equation_separate(BlendEquation::Add, BlendEquation::Max);
        assert_eq!(
            device.calls(),
            vec![
                GlCall::BlendFuncSeparate(
                    glow::SRC_ALPHA,
                    glow::ONE_MINUS_SRC_ALPHA,
                    glow::ONE,
                    glow::ZERO
                ),
                GlCall::BlendEquationSeparate(glow::FUNC_ADD, glow::MAX),
            ]
        );
    }

    #[test]
    fn out_of_range_texture_unit_falls_back_to_zero() {
        let (device, mut state) = reset_cache();
        state.active_texture(1);
        state.active_texture(10_000);
        assert_eq!(state.active_texture_unit(), 0);
        assert_eq!(
            device.calls(),
            vec![
                GlCall::ActiveTexture(glow::TEXTURE0 + 1),
                GlCall::ActiveTexture(glow::TEXTURE0),
            ]
        );
    }

    #[test]
    fn deleting_bound_objects_clears_cached_bindings() {
        let (device, mut state) = reset_cache();
        state.bind_framebuffer(6);
        state.bind_texture(TextureTarget::Texture2D, 13);
        state.delete_framebuffers(&[6]);
        state.delete_texture(13);
        assert_eq!(state.framebuffer(), 0);
        assert_eq!(state.bound_texture(0), Some((TextureTarget::Texture2D, 0)));

        device.clear_calls();
        state.bind_framebuffer(6);
        assert_eq!(
            device.calls(),
            vec![GlCall::BindFramebuffer(glow::FRAMEBUFFER, 6)]
        );
    }
}
