//! Chat orchestration — the request path of Chatline.
//!
//! A user message flows through:
//!
//! 1. **Cache append** — the hot copy readers see immediately
//! 2. **Queue publish** — the durable copy, persisted by the consumer
//! 3. **Context assembly** — system prompt, optional summary, recent window
//! 4. **Model stream** — deltas forwarded to the caller as they arrive
//! 5. **Assistant message** — cached and published like the user message

pub mod context;
pub mod service;
pub mod stream_event;

pub use context::ContextAssembler;
pub use service::ChatService;
pub use stream_event::ChatStreamEvent;

#[cfg(test)]
pub(crate) mod test_helpers;
