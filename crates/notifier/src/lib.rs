//! Notification delivery: drains pending deliveries through the idempotency
//! guard and sends them over a messaging channel.

pub mod message;
pub mod notifier;
pub mod telegram;

pub use notifier::{DeliveryResult, NotifySummary, Notifier};
pub use telegram::TelegramChannel;
