//! PipeWire backend driven through `pactl`
//!
//! Listings use `pactl --format=json`, mutations use load/unload-module and
//! the stream move/kill verbs.

pub mod backend;
pub mod command;
pub mod parse;

pub use backend::PactlAudioServer;
pub use command::Pactl;
