mod conversation;
mod message;
mod time;
mod user;

pub use conversation::*;
pub use message::*;
pub use time::*;
pub use user::*;
