pub mod message;
pub mod notification;

pub use message::{Attachment, MessagePayload};
pub use notification::NotificationItem;
