//! Media bridge audio manager core
//!
//! Domain model and orchestration for the appliance's audio personas: the
//! intercom virtual devices, the loopback links that bridge them to the USB
//! headset, per-application isolation rules and the network-audio clock.
//! The live audio server is reached only through [`domain::graph::AudioServer`].

pub mod domain;
