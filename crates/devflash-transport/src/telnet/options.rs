//! Option-negotiation state machine
//!
//! One automaton instance per option code, with independent halves for the
//! local ("us", driven by the peer's DO/DONT) and remote ("him", driven by
//! the peer's WILL/WONT) side of the option. States follow the classic
//! queue method, so a request that crosses a contradictory answer on the
//! wire settles without loops.

use std::collections::HashMap;
use std::collections::HashSet;

/// ECHO option code.
pub const OPT_ECHO: u8 = 1;

/// SUPPRESS-GO-AHEAD option code.
pub const OPT_SUPPRESS_GO_AHEAD: u8 = 3;

/// Negotiation verbs as they appear on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Negotiation {
    /// Peer offers (or confirms) enabling an option on its side
    Will,
    /// Peer refuses (or revokes) an option on its side
    Wont,
    /// Peer asks us to enable an option on our side
    Do,
    /// Peer asks us to disable an option on our side
    Dont,
}

/// Per-half option state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OptionState {
    /// Disabled
    #[default]
    No,
    /// Enabled
    Yes,
    /// We asked to enable and wait for the answer
    WantYes,
    /// We asked to disable and wait for the answer
    WantNo,
    /// Enable requested, then disable queued behind it
    WantYesOpposite,
    /// Disable requested, then enable queued behind it
    WantNoOpposite,
}

/// Side of an option the automaton is deciding about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Half {
    /// Our side (peer speaks DO/DONT, we answer WILL/WONT)
    Us,
    /// Peer's side (peer speaks WILL/WONT, we answer DO/DONT)
    Him,
}

/// State change worth reporting to the session layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionEvent {
    /// The option is now enabled on the peer's side
    RemoteEnabled(u8),
    /// The option is now disabled on the peer's side
    RemoteDisabled(u8),
    /// The option is now enabled on our side
    LocalEnabled(u8),
    /// The option is now disabled on our side
    LocalDisabled(u8),
    /// The peer refused to enable the option on its side
    RemoteRefused(u8),
    /// The peer refused to let us enable the option on our side
    LocalRefused(u8),
}

/// What to put on the wire in response to a received negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reply {
    /// Verb to send
    pub negotiation: Negotiation,
    /// Option code
    pub option: u8,
}

#[derive(Debug, Clone, Copy, Default)]
struct OptionPair {
    us: OptionState,
    him: OptionState,
}

/// The full negotiation automaton: per-option state plus the local policy of
/// which options we are willing to enable on each side.
#[derive(Debug, Default)]
pub struct OptionNegotiator {
    states: HashMap<u8, OptionPair>,
    accept_local: HashSet<u8>,
    accept_remote: HashSet<u8>,
}

impl OptionNegotiator {
    /// Automaton that refuses everything until told otherwise.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allow the peer to ask for `option` on our side.
    pub fn accept_local(&mut self, option: u8) {
        self.accept_local.insert(option);
    }

    /// Accept the peer enabling `option` on its side.
    pub fn accept_remote(&mut self, option: u8) {
        self.accept_remote.insert(option);
    }

    /// Current state of our half of an option.
    pub fn local_state(&self, option: u8) -> OptionState {
        self.states.get(&option).map(|p| p.us).unwrap_or_default()
    }

    /// Current state of the peer's half of an option.
    pub fn remote_state(&self, option: u8) -> OptionState {
        self.states.get(&option).map(|p| p.him).unwrap_or_default()
    }

    /// Ask the peer to enable an option on its side (send DO).
    pub fn request_remote_enable(&mut self, option: u8) -> Option<Reply> {
        self.accept_remote.insert(option);
        let pair = self.states.entry(option).or_default();
        match pair.him {
            OptionState::No => {
                pair.him = OptionState::WantYes;
                Some(Reply {
                    negotiation: Negotiation::Do,
                    option,
                })
            }
            OptionState::WantNo => {
                pair.him = OptionState::WantNoOpposite;
                None
            }
            _ => None,
        }
    }

    /// Offer to enable an option on our side (send WILL).
    pub fn request_local_enable(&mut self, option: u8) -> Option<Reply> {
        self.accept_local.insert(option);
        let pair = self.states.entry(option).or_default();
        match pair.us {
            OptionState::No => {
                pair.us = OptionState::WantYes;
                Some(Reply {
                    negotiation: Negotiation::Will,
                    option,
                })
            }
            OptionState::WantNo => {
                pair.us = OptionState::WantNoOpposite;
                None
            }
            _ => None,
        }
    }

    /// Feed one received negotiation through the automaton.
    pub fn receive(
        &mut self,
        negotiation: Negotiation,
        option: u8,
    ) -> (Option<Reply>, Option<OptionEvent>) {
        match negotiation {
            Negotiation::Will => self.receive_positive(Half::Him, option),
            Negotiation::Wont => self.receive_negative(Half::Him, option),
            Negotiation::Do => self.receive_positive(Half::Us, option),
            Negotiation::Dont => self.receive_negative(Half::Us, option),
        }
    }

    fn half_state(&mut self, half: Half, option: u8) -> &mut OptionState {
        let pair = self.states.entry(option).or_default();
        match half {
            Half::Us => &mut pair.us,
            Half::Him => &mut pair.him,
        }
    }

    fn accepts(&self, half: Half, option: u8) -> bool {
        match half {
            Half::Us => self.accept_local.contains(&option),
            Half::Him => self.accept_remote.contains(&option),
        }
    }

    fn agree(half: Half, option: u8) -> Reply {
        Reply {
            negotiation: match half {
                Half::Us => Negotiation::Will,
                Half::Him => Negotiation::Do,
            },
            option,
        }
    }

    fn refuse(half: Half, option: u8) -> Reply {
        Reply {
            negotiation: match half {
                Half::Us => Negotiation::Wont,
                Half::Him => Negotiation::Dont,
            },
            option,
        }
    }

    fn enabled_event(half: Half, option: u8) -> OptionEvent {
        match half {
            Half::Us => OptionEvent::LocalEnabled(option),
            Half::Him => OptionEvent::RemoteEnabled(option),
        }
    }

    fn disabled_event(half: Half, option: u8) -> OptionEvent {
        match half {
            Half::Us => OptionEvent::LocalDisabled(option),
            Half::Him => OptionEvent::RemoteDisabled(option),
        }
    }

    fn refused_event(half: Half, option: u8) -> OptionEvent {
        match half {
            Half::Us => OptionEvent::LocalRefused(option),
            Half::Him => OptionEvent::RemoteRefused(option),
        }
    }

    /// Peer said WILL (him) or DO (us).
    fn receive_positive(
        &mut self,
        half: Half,
        option: u8,
    ) -> (Option<Reply>, Option<OptionEvent>) {
        let accepts = self.accepts(half, option);
        let state = self.half_state(half, option);
        match *state {
            OptionState::No => {
                if accepts {
                    *state = OptionState::Yes;
                    (
                        Some(Self::agree(half, option)),
                        Some(Self::enabled_event(half, option)),
                    )
                } else {
                    (Some(Self::refuse(half, option)), None)
                }
            }
            OptionState::Yes => (None, None),
            OptionState::WantYes => {
                *state = OptionState::Yes;
                (None, Some(Self::enabled_event(half, option)))
            }
            OptionState::WantYesOpposite => {
                // Enable confirmed, but a disable is queued behind it.
                *state = OptionState::WantNo;
                (Some(Self::refuse(half, option)), None)
            }
            OptionState::WantNo => {
                // Peer answered our DONT/WONT with the opposite; treat the
                // option as settled off rather than looping.
                *state = OptionState::No;
                (None, Some(Self::disabled_event(half, option)))
            }
            OptionState::WantNoOpposite => {
                *state = OptionState::Yes;
                (None, Some(Self::enabled_event(half, option)))
            }
        }
    }

    /// Peer said WONT (him) or DONT (us).
    fn receive_negative(
        &mut self,
        half: Half,
        option: u8,
    ) -> (Option<Reply>, Option<OptionEvent>) {
        let state = self.half_state(half, option);
        match *state {
            OptionState::No => (None, None),
            OptionState::Yes => {
                *state = OptionState::No;
                (
                    Some(Self::refuse(half, option)),
                    Some(Self::disabled_event(half, option)),
                )
            }
            OptionState::WantYes => {
                *state = OptionState::No;
                (None, Some(Self::refused_event(half, option)))
            }
            OptionState::WantYesOpposite => {
                *state = OptionState::No;
                (None, Some(Self::refused_event(half, option)))
            }
            OptionState::WantNo => {
                *state = OptionState::No;
                (None, Some(Self::disabled_event(half, option)))
            }
            OptionState::WantNoOpposite => {
                *state = OptionState::WantYes;
                (Some(Self::agree(half, option)), None)
            }
        }
    }
}
