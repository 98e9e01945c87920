//! Resource pools owned by one pipeline.
//!
//! Both pools are single-writer: every method takes `&mut self`, and the
//! owning [`EditPipeline`](crate::EditPipeline) serializes access.

mod staging;
mod texture;

pub use staging::{ReadbackHandle, StagingBuffer, StagingBufferPool, StagingStats};
pub use texture::{PooledTexture, TextureKey, TexturePool, TexturePoolStats};
