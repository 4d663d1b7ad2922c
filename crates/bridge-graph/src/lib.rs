//! Reference pipeline for the bridge.
//!
//! [`ConversationGraph`] runs a keyword-check node and a chat-model node per
//! message, remembering each thread's history in memory. [`ScriptedPipeline`]
//! replays canned event sequences for tests.

pub mod checkpoint;
pub mod graph;
pub mod mock;
pub mod model;
pub mod openai;

pub use checkpoint::{ChatMessage, MemoryCheckpointer, Role};
pub use graph::{keyword_hit, ConversationGraph, GraphConfig};
pub use mock::{reply_events, RecordedCall, ScriptedPipeline, ScriptedRun};
pub use model::{ChatModel, EchoModel, FragmentStream};
pub use openai::{OpenAiChatModel, OpenAiConfig};
