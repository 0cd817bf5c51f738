mod document_store_memory;
mod presence_channel_memory;

pub use document_store_memory::*;
pub use presence_channel_memory::*;
