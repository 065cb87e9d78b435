pub mod opengl;
pub mod recording;
