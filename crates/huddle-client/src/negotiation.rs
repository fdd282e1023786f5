//! Per-peer negotiation state machine.
//!
//! A pure reducer: `(state, input) -> (state, steps)`. It never touches the
//! transport. The engine performs the returned steps in order and feeds their
//! outcome back in as new inputs.
//!
//! ```text
//!   Idle ──Start(initiator)──▶ OfferSent ──RemoteAnswer──▶ Connected
//!   Idle ──RemoteOffer──▶ OfferReceived ──AnswerSent──▶ Connected
//!   Connected ──LocalTracksChanged──▶ OfferSent        (renegotiation)
//!   Connected ──RemoteOffer──▶ OfferReceived            (remote renegotiation)
//!   * ──Close──▶ Closed
//! ```
//!
//! Glare (an offer arriving while ours is outstanding) is settled by role:
//! the initiator keeps its offer, the responder rolls back, answers, and
//! re-offers its own changes afterwards.
//!
//! The initiator offers on `Start` whether or not it has local media. An
//! offer without tracks still asks to receive, so a participant whose camera
//! was denied keeps seeing and hearing everyone else.

use huddle_common::ConnectionId;

/// Which side of a pair creates the first offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

impl Role {
    /// The smaller connection id initiates. Both sides evaluate the same
    /// comparison, so exactly one offer is generated per pair.
    pub fn for_pair(local: ConnectionId, remote: ConnectionId) -> Self {
        if local < remote {
            Self::Initiator
        } else {
            Self::Responder
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    OfferSent,
    OfferReceived,
    Connected,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Input {
    /// Session created; local media may or may not be attached yet.
    Start,
    /// A local track was attached to or detached from the connection.
    LocalTracksChanged,
    RemoteOffer,
    RemoteAnswer,
    /// Our answer to a remote offer went out.
    AnswerSent,
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Create and send an offer.
    SendOffer,
    /// Apply the remote offer, create and send an answer.
    AcceptOffer,
    /// Apply the remote answer.
    ApplyAnswer,
    /// Discard our outstanding local offer.
    Rollback,
    CloseConnection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Negotiation {
    phase: Phase,
    role: Role,
    /// Local changes arrived mid-exchange; offer again once connected.
    pending_renegotiation: bool,
    /// At least one offer/answer exchange has completed.
    established: bool,
}

impl Negotiation {
    pub fn new(role: Role) -> Self {
        Self {
            phase: Phase::Idle,
            role,
            pending_renegotiation: false,
            established: false,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn has_pending_renegotiation(&self) -> bool {
        self.pending_renegotiation
    }

    pub fn apply(self, input: Input) -> (Self, Vec<Step>) {
        use Phase::*;

        match (self.phase, input) {
            (Closed, _) => (self, Vec::new()),
            (_, Input::Close) => (self.with_phase(Closed), vec![Step::CloseConnection]),

            (Idle, Input::Start) if self.role == Role::Initiator => {
                (self.with_phase(OfferSent), vec![Step::SendOffer])
            }
            (_, Input::Start) => (self, Vec::new()),

            // A fresh offer carries every local change, deferred ones included.
            (Idle | Connected, Input::LocalTracksChanged) => (
                Self {
                    phase: OfferSent,
                    pending_renegotiation: false,
                    ..self
                },
                vec![Step::SendOffer],
            ),
            (OfferSent | OfferReceived, Input::LocalTracksChanged) => (
                Self {
                    pending_renegotiation: true,
                    ..self
                },
                Vec::new(),
            ),

            (Idle | Connected | OfferReceived, Input::RemoteOffer) => {
                (self.with_phase(OfferReceived), vec![Step::AcceptOffer])
            }
            (OfferSent, Input::RemoteOffer) => match self.role {
                Role::Initiator => (self, Vec::new()),
                Role::Responder => (
                    Self {
                        phase: OfferReceived,
                        pending_renegotiation: true,
                        ..self
                    },
                    vec![Step::Rollback, Step::AcceptOffer],
                ),
            },

            (OfferReceived, Input::AnswerSent) => self.settle(vec![]),
            (OfferSent, Input::RemoteAnswer) => self.settle(vec![Step::ApplyAnswer]),

            // Stale answers and unmatched completions.
            (_, Input::AnswerSent | Input::RemoteAnswer) => (self, Vec::new()),
        }
    }

    /// State to fall back to once our outstanding offer was rolled back
    /// and the exchange that replaced it failed. The discarded changes stay
    /// pending and go out with the next completed exchange.
    pub fn rolled_back(self) -> Self {
        let phase = if self.established {
            Phase::Connected
        } else {
            Phase::Idle
        };
        Self {
            phase,
            pending_renegotiation: true,
            ..self
        }
    }

    /// Enter `Connected`, immediately re-offering if changes were deferred.
    fn settle(self, mut steps: Vec<Step>) -> (Self, Vec<Step>) {
        let settled = Self {
            established: true,
            ..self
        };
        if settled.pending_renegotiation {
            steps.push(Step::SendOffer);
            (
                Self {
                    phase: Phase::OfferSent,
                    pending_renegotiation: false,
                    ..settled
                },
                steps,
            )
        } else {
            (settled.with_phase(Phase::Connected), steps)
        }
    }

    fn with_phase(self, phase: Phase) -> Self {
        Self { phase, ..self }
    }
}
