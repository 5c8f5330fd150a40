pub mod agent;
pub mod agent_loop;
pub mod agent_types;
pub mod driver;
pub mod event_stream;
pub mod types;

pub use agent::{Agent, AgentCoreError, AgentOptions};
pub use agent_loop::{AgentEventStream, agent_loop, agent_loop_continue};
pub use agent_types::{
    AgentEvent, AgentMessage, AgentTool, AgentToolResult, ConvertToLlmFn, CustomMessage,
    FollowUpMode, QueueHandles, QueueMode, TurnConfig, TurnContext, default_convert_to_llm,
};
pub use driver::{ModelDriver, assistant_text, complete, final_message};
pub use event_stream::{AssistantEventStream, EventStream, new_assistant_event_stream};
