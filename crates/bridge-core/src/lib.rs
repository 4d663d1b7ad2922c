pub mod errors;
pub mod events;
pub mod ids;
pub mod pipeline;
pub mod protocol;

pub use errors::PipelineError;
pub use events::PipelineEvent;
pub use ids::{ConnectionId, ConversationId};
pub use pipeline::{EventStream, Pipeline, PipelineInput, RunConfig};
pub use protocol::{FrameIntent, InboundFrame, OutboundMessage};
