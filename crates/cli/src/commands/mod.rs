pub mod chat;
pub mod config_cmd;
pub mod consume;
pub mod history;
pub mod sessions;
