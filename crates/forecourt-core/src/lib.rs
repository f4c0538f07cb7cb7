// Library root: the station core (session lifecycle, live sync, broadcast,
// health, measurements) and the event loop that owns it.

pub mod app;
pub mod assets;
pub mod bootstrap;
pub mod broadcast;
pub mod config;
pub mod error;
pub mod health;
pub mod measure;
pub mod model;
pub mod protocol;
pub mod remote;
pub mod store;
pub mod sync;
pub mod theme;

pub use error::{Error, Input, Result};
