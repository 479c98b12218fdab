#![forbid(unsafe_code)]

pub mod auth;
pub mod connection;
pub mod engine;
pub mod errors;
pub mod flood;
pub mod health;
pub mod hub;
pub mod moderation;
pub mod permissions;
pub mod presence;
pub mod relay;
pub mod reports;
pub mod rooms;
pub mod session_cache;
pub mod store;
pub mod work_queue;

#[cfg(test)]
mod testkit;



#[cfg(test)]
mod moderation_tests;


#[cfg(test)]
mod presence_tests;
