pub mod change_feed;
pub mod friend_status;
pub mod friend_summary;
pub mod message_sync;
pub mod presence_heartbeat;
pub mod read_receipts;
pub mod session;
pub mod store;
