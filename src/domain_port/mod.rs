// store

mod document;
mod document_store;
mod write_batch;

pub use document::*;
pub use document_store::*;
pub use write_batch::*;

// channel

mod presence_channel;

pub use presence_channel::*;

mod subscription;

pub use subscription::*;
