mod port;
mod runtime;
mod unread_notifier;

pub use port::*;
pub use runtime::*;
pub use unread_notifier::*;
