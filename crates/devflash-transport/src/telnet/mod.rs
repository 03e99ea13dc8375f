//! Line-oriented TCP control-protocol client
//!
//! Used to drive the debug-adapter daemon's telnet-style control port:
//! [`options`] holds the option-negotiation automaton, [`parser`] the wire
//! parser, and [`client`] the connection/command layer.

pub mod client;
pub mod options;
pub mod parser;

pub use client::{ClientState, ControlClient, ControlClientConfig};
pub use options::{Negotiation, OptionEvent, OptionNegotiator, OptionState};
pub use parser::{WireEvent, WireParser};
