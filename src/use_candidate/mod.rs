#[cfg(test)]
mod use_candidate_test;

use stun::attributes::ATTR_USE_CANDIDATE;
use stun::message::*;

/// The USE-CANDIDATE attribute.
///
/// It carries no value; its presence on a Binding request is the
/// controlling agent's nomination signal for the pair being checked
/// (regular nomination, RFC 8445 §8.1.1).
#[derive(Default, Debug, Copy, Clone)]
pub struct UseCandidateAttr;

impl Setter for UseCandidateAttr {
    /// Marks the request as a nomination.
    fn add_to(&self, m: &mut Message) -> Result<(), stun::Error> {
        m.add(ATTR_USE_CANDIDATE, &[]);
        Ok(())
    }
}

impl UseCandidateAttr {
    /// Whether a message carries the nomination marker.
    #[must_use]
    pub fn is_set(m: &Message) -> bool {
        m.get(ATTR_USE_CANDIDATE).is_ok()
    }
}
