//! Wire parser for the control protocol
//!
//! Splits the byte stream into text and command events. Commands are
//! introduced by IAC (0xFF) and span two bytes (plain commands) or three
//! (negotiations); subnegotiation payloads are consumed and discarded. CR
//! and NUL are filtered from the text stream.

use super::options::Negotiation;

/// Interpret-as-command escape byte.
pub const IAC: u8 = 255;

const CMD_SE: u8 = 240;
const CMD_SB: u8 = 250;
const CMD_WILL: u8 = 251;
const CMD_WONT: u8 = 252;
const CMD_DO: u8 = 253;
const CMD_DONT: u8 = 254;

/// One parsed protocol event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireEvent {
    /// A byte of session text
    Text(u8),
    /// A negotiation verb plus option code
    Negotiate(Negotiation, u8),
    /// A plain two-byte command we have no use for
    Command(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum ParserState {
    #[default]
    Text,
    Escape,
    Negotiate(Negotiation),
    Subnegotiation,
    SubnegotiationEscape,
}

/// Incremental protocol parser.
#[derive(Debug, Default)]
pub struct WireParser {
    state: ParserState,
}

impl WireParser {
    /// New parser in the text state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one byte; returns at most one event.
    pub fn push(&mut self, byte: u8) -> Option<WireEvent> {
        match self.state {
            ParserState::Text => match byte {
                IAC => {
                    self.state = ParserState::Escape;
                    None
                }
                b'\r' | 0 => None,
                other => Some(WireEvent::Text(other)),
            },
            ParserState::Escape => match byte {
                IAC => {
                    // Escaped literal 0xFF.
                    self.state = ParserState::Text;
                    Some(WireEvent::Text(IAC))
                }
                CMD_WILL => {
                    self.state = ParserState::Negotiate(Negotiation::Will);
                    None
                }
                CMD_WONT => {
                    self.state = ParserState::Negotiate(Negotiation::Wont);
                    None
                }
                CMD_DO => {
                    self.state = ParserState::Negotiate(Negotiation::Do);
                    None
                }
                CMD_DONT => {
                    self.state = ParserState::Negotiate(Negotiation::Dont);
                    None
                }
                CMD_SB => {
                    self.state = ParserState::Subnegotiation;
                    None
                }
                other => {
                    self.state = ParserState::Text;
                    Some(WireEvent::Command(other))
                }
            },
            ParserState::Negotiate(negotiation) => {
                self.state = ParserState::Text;
                Some(WireEvent::Negotiate(negotiation, byte))
            }
            ParserState::Subnegotiation => {
                if byte == IAC {
                    self.state = ParserState::SubnegotiationEscape;
                }
                None
            }
            ParserState::SubnegotiationEscape => {
                self.state = if byte == CMD_SE {
                    ParserState::Text
                } else {
                    ParserState::Subnegotiation
                };
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_all(parser: &mut WireParser, bytes: &[u8]) -> Vec<WireEvent> {
        bytes.iter().filter_map(|&b| parser.push(b)).collect()
    }

    #[test]
    fn plain_text_passes_through() {
        let mut parser = WireParser::new();
        let events = parse_all(&mut parser, b"ok\n");
        assert_eq!(
            events,
            vec![
                WireEvent::Text(b'o'),
                WireEvent::Text(b'k'),
                WireEvent::Text(b'\n'),
            ]
        );
    }

    #[test]
    fn cr_and_nul_are_filtered() {
        let mut parser = WireParser::new();
        let events = parse_all(&mut parser, b"a\r\n\0b");
        assert_eq!(
            events,
            vec![
                WireEvent::Text(b'a'),
                WireEvent::Text(b'\n'),
                WireEvent::Text(b'b'),
            ]
        );
    }

    #[test]
    fn negotiations_are_three_byte_sequences() {
        let mut parser = WireParser::new();
        let events = parse_all(&mut parser, &[IAC, CMD_WILL, 3, b'x', IAC, CMD_DONT, 1]);
        assert_eq!(
            events,
            vec![
                WireEvent::Negotiate(Negotiation::Will, 3),
                WireEvent::Text(b'x'),
                WireEvent::Negotiate(Negotiation::Dont, 1),
            ]
        );
    }

    #[test]
    fn escaped_iac_is_a_literal_byte() {
        let mut parser = WireParser::new();
        let events = parse_all(&mut parser, &[IAC, IAC]);
        assert_eq!(events, vec![WireEvent::Text(IAC)]);
    }

    #[test]
    fn two_byte_commands_are_reported() {
        let mut parser = WireParser::new();
        // 241 is NOP.
        let events = parse_all(&mut parser, &[IAC, 241, b'z']);
        assert_eq!(events, vec![WireEvent::Command(241), WireEvent::Text(b'z')]);
    }

    #[test]
    fn subnegotiation_payloads_are_discarded() {
        let mut parser = WireParser::new();
        let events = parse_all(
            &mut parser,
            &[IAC, CMD_SB, 31, 0, 80, 0, 24, IAC, CMD_SE, b'a'],
        );
        assert_eq!(events, vec![WireEvent::Text(b'a')]);
    }
}
