#![forbid(unsafe_code)]

pub mod connections;
pub mod directory;
pub mod dispatcher;
pub mod emitter;
pub mod health;
pub mod message_hub;
pub mod subscription_hub;
pub mod websocket;

#[cfg(test)]
mod connections_tests;


#[cfg(test)]
mod emitter_tests;

#[cfg(test)]
mod subscription_hub_tests;

#[cfg(test)]
mod test_support;
