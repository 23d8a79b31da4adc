//! 上游 chat/completions 客户端：整包响应与逐块流式两种模式。

pub mod client;
pub mod stream;
pub mod types;

pub use client::{UpstreamClient, UpstreamError};
pub use stream::{ChunkStream, StreamEvent};
