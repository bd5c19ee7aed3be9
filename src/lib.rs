//! Mail-merge engine: recipient sessions, per-row rendering and bulk
//! delivery over SMTP, provider APIs or the local mail program.

pub mod bulk;
pub mod config;
pub mod email_sender;
pub mod http;
pub mod oauth;
pub mod preview;
pub mod service;
pub mod session;
pub mod template;
