mod conversation_service;
mod presence_service;
mod read_receipt_service;

pub use conversation_service::*;
pub use presence_service::*;
pub use read_receipt_service::*;
