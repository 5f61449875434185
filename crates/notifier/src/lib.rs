//! Push delivery for the relay.
//!
//! - `push`: payload types and the `PushClient` seam
//! - `fcm`: Firebase Cloud Messaging HTTP v1 client
//! - `auth`: service-account OAuth access tokens for FCM
//! - `dispatch`: bounded batch fan-out with partial-failure accounting
//! - `invalid`: side channel for tokens the push service rejected

pub mod auth;
pub mod dispatch;
pub mod fcm;
pub mod invalid;
pub mod push;
