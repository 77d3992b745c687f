pub mod app;
pub mod bridge;
pub mod config;
pub mod directory;
pub mod dispatch;
pub mod handler;
pub mod history;
pub mod ivr;
pub mod provider;
pub mod routing;
pub mod session;
pub mod twiml;

#[cfg(test)]
pub(crate) mod fixtures;
