//! HTTP request handlers.

mod admin;
mod health;
mod organization;
mod tasks;
mod uploads;

pub use admin::{create_key, list_keys, pool_status};
pub use health::{health_check, metrics_handler};
pub use organization::organization;
pub use tasks::{cancel_task, get_task, submit_task};
pub use uploads::{create_upload, receive_upload};
