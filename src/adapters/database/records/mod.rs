pub mod account;
pub mod friendship;
pub mod message;
pub mod user;

pub use account::AccountRecord;
pub use friendship::FriendshipRecord;
pub use message::MessageRecord;
pub use user::PresenceRow;
