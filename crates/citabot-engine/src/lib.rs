pub mod engine;
pub mod gate;
pub mod messages;
pub mod pipeline;
pub mod reminder_reply;
pub mod slots;

pub use engine::Engine;
