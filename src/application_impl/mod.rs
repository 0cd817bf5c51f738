mod conversation_service_impl;
mod presence_tracker_impl;
mod read_receipt_impl;

pub use conversation_service_impl::*;
pub use presence_tracker_impl::*;
pub use read_receipt_impl::*;
