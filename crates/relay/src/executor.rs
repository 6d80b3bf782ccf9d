//! The seam between the streaming server and whatever generates chunks.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::chunk::Chunk;
use crate::history::ChatHistory;
use crate::modelfile::Modelfile;

/// A lazy, finite, non-restartable sequence of chunks.
pub type ChunkStream = Pin<Box<dyn Stream<Item = anyhow::Result<Chunk>> + Send>>;

/// A generation backend: anything that can turn a rectified chat history and
/// a modelfile into a chunk stream. The server guarantees at most one
/// concurrent call per process; backends must honor `abort` by terminating
/// their stream early.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn llm_compute(&self, history: ChatHistory, modelfile: Modelfile) -> ChunkStream;

    /// Cooperative cancellation hook. Backends without one return `None`,
    /// which the server reports as unsupported.
    async fn abort(&self) -> Option<String> {
        None
    }
}
