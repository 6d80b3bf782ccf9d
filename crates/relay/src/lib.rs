pub mod agent;
pub mod chunk;
pub mod client;
pub mod executor;
pub mod flow;
pub mod history;
pub mod lang;
pub mod modelfile;

pub use chunk::{Chunk, LogLevel};
pub use executor::{ChunkStream, Executor};
pub use history::{ChatHistory, ChatMessage, Role};
pub use modelfile::{Directive, Modelfile};
