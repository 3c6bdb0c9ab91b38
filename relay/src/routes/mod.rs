pub mod auth;
pub mod files;
pub mod key_exchange;
pub mod messages;
pub mod users;
