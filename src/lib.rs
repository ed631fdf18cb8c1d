pub mod auth;
pub mod calendar;
pub mod catalog;
pub mod config;
pub mod engine;
pub mod identity;
pub mod invoices;
pub mod journal;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod ratelimit;
pub mod reaper;
pub mod request;
pub mod wire;
#[cfg(test)]
pub(crate) mod testkit;
