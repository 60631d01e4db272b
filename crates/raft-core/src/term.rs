//! # term
//!
//! why: the durable (current_term, voted_for) ratchet behind "one vote per term"
//! relations: owned by context.rs, persisted through persistence.rs
//! what: ElectionTerm with update/observe and vote eligibility checks

use tracing::info;

use crate::error::{RaftError, Result};
use crate::persistence::SharedGateway;
use crate::{PeerId, Term};

/// Durable record of the current term and the vote cast in it.
pub struct ElectionTerm {
    current_term: Term,
    voted_for: Option<PeerId>,
    gateway: SharedGateway,
}

impl std::fmt::Debug for ElectionTerm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ElectionTerm")
            .field("current_term", &self.current_term)
            .field("voted_for", &self.voted_for)
            .finish()
    }
}

impl ElectionTerm {
    /// Rebuild from recovered state. Nothing is written.
    pub fn new(current_term: Term, voted_for: Option<PeerId>, gateway: SharedGateway) -> Self {
        Self {
            current_term,
            voted_for,
            gateway,
        }
    }

    pub fn current_term(&self) -> Term {
        self.current_term
    }

    pub fn voted_for(&self) -> Option<&str> {
        self.voted_for.as_deref()
    }

    /// Durably move to `term` with `voted_for` as this term's vote.
    ///
    /// Lower terms fail with `StaleTerm`. Within the current term the vote
    /// may be cast once: repeating the same vote is a no-op, anything else
    /// fails with `AlreadyVoted`.
    pub fn update(&mut self, term: Term, voted_for: Option<&str>) -> Result<()> {
        if term < self.current_term {
            return Err(RaftError::StaleTerm {
                presented: term,
                current: self.current_term,
            });
        }

        if term == self.current_term {
            match (self.voted_for.as_deref(), voted_for) {
                (current, requested) if current == requested => return Ok(()),
                (None, Some(_)) => {}
                (current, requested) => {
                    return Err(RaftError::AlreadyVoted {
                        term,
                        voted_for: current.map(str::to_owned),
                        requested: requested.map(str::to_owned),
                    });
                }
            }
        }

        // durable first: a failed write must not leave a vote only in memory
        self.gateway.persist_term(term, voted_for)?;

        if term > self.current_term {
            info!(from = self.current_term, to = term, "term advanced");
        }
        if let Some(candidate) = voted_for {
            info!(term, candidate, "vote recorded");
        }
        self.current_term = term;
        self.voted_for = voted_for.map(str::to_owned);
        Ok(())
    }

    /// Adopt a higher term seen on the wire, clearing the vote.
    ///
    /// Returns whether the term advanced. Equal and lower terms are ignored.
    pub fn observe(&mut self, term: Term) -> Result<bool> {
        if term <= self.current_term {
            return Ok(false);
        }
        self.update(term, None)?;
        Ok(true)
    }

    /// Whether a vote for `candidate` in `term` would be accepted by `update`.
    pub fn can_vote_for(&self, term: Term, candidate: &str) -> bool {
        if term < self.current_term {
            return false;
        }
        if term > self.current_term {
            return true;
        }
        self.voted_for.as_deref().map_or(true, |v| v == candidate)
    }
}
