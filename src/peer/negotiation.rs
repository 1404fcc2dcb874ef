//! Handshake bookkeeping shared by both session types.
//!
//! A handshake is one offer/answer pair plus its ICE candidates. Each offer
//! gets a fresh negotiation id; answers and candidates carrying an older id,
//! or coming from a connection other than the current remote, belong to a
//! superseded handshake and are never applied.

use std::collections::VecDeque;

use crate::error::{ProctorError, Result};
use crate::signaling::{ConnectionId, IceCandidatePayload};

const MAX_PENDING_CANDIDATES: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationRole {
    Offerer,
    Answerer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    ExpectingAnswer,
    AwaitingRemoteOffer,
    Established,
}

#[derive(Debug, Clone)]
struct Handshake {
    id: Option<u64>,
    remote: Option<ConnectionId>,
    phase: Phase,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Relation {
    Current,
    Older,
    Unrelated,
}

impl Handshake {
    fn relation(&self, from: Option<&ConnectionId>, negotiation_id: Option<u64>) -> Relation {
        if let (Some(remote), Some(from)) = (&self.remote, from) {
            if remote != from {
                return Relation::Unrelated;
            }
        }
        match (self.id, negotiation_id) {
            (Some(current), Some(id)) if id < current => Relation::Older,
            (Some(current), Some(id)) if id > current => Relation::Unrelated,
            _ => Relation::Current,
        }
    }
}

#[derive(Debug, Clone)]
struct PendingCandidate {
    payload: IceCandidatePayload,
    from: Option<ConnectionId>,
    negotiation_id: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CandidateDisposition {
    Apply(IceCandidatePayload),
    /// Held until the matching remote description is set
    Queued,
    Stale,
}

#[derive(Debug)]
pub struct Negotiation {
    role: NegotiationRole,
    next_id: u64,
    current: Option<Handshake>,
    pending: VecDeque<PendingCandidate>,
}

impl Negotiation {
    pub fn new(role: NegotiationRole) -> Self {
        Self {
            role,
            next_id: 0,
            current: None,
            pending: VecDeque::new(),
        }
    }

    pub fn current_id(&self) -> Option<u64> {
        self.current.as_ref().and_then(|h| h.id)
    }

    pub fn remote(&self) -> Option<&ConnectionId> {
        self.current.as_ref().and_then(|h| h.remote.as_ref())
    }

    pub fn is_expecting_answer(&self) -> bool {
        matches!(&self.current, Some(h) if h.phase == Phase::ExpectingAnswer)
    }

    pub fn has_remote_description(&self) -> bool {
        matches!(&self.current, Some(h) if h.phase == Phase::Established)
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending.len()
    }

    /// Start a new offer, superseding whatever handshake was in flight
    pub fn begin_offer(&mut self, remote: Option<ConnectionId>) -> u64 {
        self.next_id += 1;
        self.current = Some(Handshake {
            id: Some(self.next_id),
            remote,
            phase: Phase::ExpectingAnswer,
        });
        self.pending.clear();
        self.next_id
    }

    /// Guard for an incoming answer. On success the answer's sender becomes
    /// the handshake's remote if it was not known yet.
    pub fn accept_answer(&mut self, from: &ConnectionId, negotiation_id: Option<u64>) -> Result<()> {
        let handshake = match self.current.as_mut() {
            Some(h) if h.phase == Phase::ExpectingAnswer => h,
            _ => {
                return Err(ProctorError::InvalidNegotiationState(
                    "no offer is awaiting an answer".to_string(),
                ))
            }
        };

        if handshake.relation(Some(from), negotiation_id) != Relation::Current {
            return Err(ProctorError::StaleHandshake(format!(
                "answer from {} for negotiation {:?}, current {:?}",
                from, negotiation_id, handshake.id
            )));
        }

        if handshake.remote.is_none() {
            handshake.remote = Some(from.clone());
        }
        Ok(())
    }

    /// Start answering a remote offer. Candidates queued ahead of the offer
    /// are kept only if they belong to it.
    pub fn begin_answer(&mut self, from: ConnectionId, negotiation_id: Option<u64>) {
        let handshake = Handshake {
            id: negotiation_id,
            remote: Some(from),
            phase: Phase::AwaitingRemoteOffer,
        };
        self.pending
            .retain(|c| handshake.relation(c.from.as_ref(), c.negotiation_id) == Relation::Current);
        self.current = Some(handshake);
    }

    /// Record that the remote description is applied; returns the queued
    /// candidates that can now be added
    pub fn mark_remote_description(&mut self) -> Vec<IceCandidatePayload> {
        let Some(handshake) = self.current.as_mut() else {
            return Vec::new();
        };
        handshake.phase = Phase::Established;

        let mut ready = Vec::new();
        let mut kept = VecDeque::new();
        for candidate in self.pending.drain(..) {
            match handshake.relation(candidate.from.as_ref(), candidate.negotiation_id) {
                Relation::Current => ready.push(candidate.payload),
                Relation::Unrelated if self.role == NegotiationRole::Answerer => kept.push_back(candidate),
                _ => {}
            }
        }
        self.pending = kept;
        ready
    }

    pub fn accept_candidate(
        &mut self,
        payload: IceCandidatePayload,
        from: Option<ConnectionId>,
        negotiation_id: Option<u64>,
    ) -> CandidateDisposition {
        let relation = match &self.current {
            Some(h) => h.relation(from.as_ref(), negotiation_id),
            None => Relation::Unrelated,
        };

        match relation {
            Relation::Current if self.has_remote_description() => CandidateDisposition::Apply(payload),
            Relation::Current => {
                self.queue(payload, from, negotiation_id);
                CandidateDisposition::Queued
            }
            // An answerer may see candidates ahead of the offer they belong to
            Relation::Unrelated if self.role == NegotiationRole::Answerer => {
                self.queue(payload, from, negotiation_id);
                CandidateDisposition::Queued
            }
            _ => CandidateDisposition::Stale,
        }
    }

    /// Forget the handshake and every queued candidate
    pub fn reset(&mut self) {
        self.current = None;
        self.pending.clear();
    }

    fn queue(&mut self, payload: IceCandidatePayload, from: Option<ConnectionId>, negotiation_id: Option<u64>) {
        if self.pending.len() >= MAX_PENDING_CANDIDATES {
            self.pending.pop_front();
        }
        self.pending.push_back(PendingCandidate {
            payload,
            from,
            negotiation_id,
        });
    }
}
