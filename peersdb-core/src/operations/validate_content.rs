use crate::constants::{QUORUM_WINDOW, VALIDATION_TOPIC};
use crate::node::NodeContext;
use crate::transport::TopicSubscription;
use crate::types::{
    ContentRef, ValidationRecord, ValidationRequest, ValidationVote, decode_message,
    encode_message,
};
use crate::{PeersError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;

/// Local judgement of whether content is acceptable.
#[async_trait]
pub trait ValidityPredicate: Send + Sync {
    async fn validate(&self, content_ref: &ContentRef, data: &Bytes) -> Result<bool>;
}

/// Accepts all content.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

#[async_trait]
impl ValidityPredicate for AcceptAll {
    async fn validate(&self, _content_ref: &ContentRef, _data: &Bytes) -> Result<bool> {
        Ok(true)
    }
}

/// Majority is measured against connected peers; silence counts as "no".
pub fn quorum_reached(yes_votes: u32, connected_peers: usize) -> bool {
    f64::from(yes_votes) > 0.5 * connected_peers as f64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuorumPhase {
    Collecting,
    Deciding,
    Fallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuorumOutcome {
    Valid,
    Fallback,
}

/// Vote tally of one validity lookup.
#[derive(Debug, Clone)]
pub struct QuorumRound {
    phase: QuorumPhase,
    yes: u32,
    no: u32,
}

impl Default for QuorumRound {
    fn default() -> Self {
        Self::new()
    }
}

impl QuorumRound {
    pub fn new() -> Self {
        Self {
            phase: QuorumPhase::Collecting,
            yes: 0,
            no: 0,
        }
    }

    pub fn phase(&self) -> QuorumPhase {
        self.phase
    }

    pub fn yes_votes(&self) -> u32 {
        self.yes
    }

    pub fn vote_count(&self) -> u32 {
        self.yes + self.no
    }

    /// Count a vote. Votes arriving after collection closed are ignored.
    pub fn observe(&mut self, vote: ValidationVote) -> bool {
        if self.phase != QuorumPhase::Collecting {
            return false;
        }
        if vote.vote {
            self.yes += 1;
        } else {
            self.no += 1;
        }
        true
    }

    /// Close collection and decide. A round decides exactly once.
    pub fn decide(&mut self, connected_peers: usize) -> Result<QuorumOutcome> {
        if self.phase != QuorumPhase::Collecting {
            return Err(PeersError::Internal(
                "quorum round already decided".to_string(),
            ));
        }
        self.phase = QuorumPhase::Deciding;

        if quorum_reached(self.yes, connected_peers) {
            return Ok(QuorumOutcome::Valid);
        }
        self.phase = QuorumPhase::Fallback;
        Ok(QuorumOutcome::Fallback)
    }
}

#[derive(Clone)]
pub struct ValidateContentOperation {
    ctx: Arc<NodeContext>,
}

impl ValidateContentOperation {
    pub fn new(ctx: Arc<NodeContext>) -> Self {
        Self { ctx }
    }

    pub async fn is_valid(&self, content_ref: &ContentRef) -> Result<bool> {
        Ok(self.run(content_ref).await?.is_valid)
    }

    /// Return the local record for `content_ref`, running a quorum round if
    /// there is none yet.
    pub async fn run(&self, content_ref: &ContentRef) -> Result<ValidationRecord> {
        if let Some(record) = self.ctx.validations.get(content_ref)? {
            tracing::debug!(content_ref = %content_ref, "Validation cache hit");
            return Ok(record);
        }

        let mut round = self.collect_votes(content_ref).await?;
        let connected = self.ctx.transport.connected_peers().await?.len();

        let record = match round.decide(connected)? {
            QuorumOutcome::Valid => ValidationRecord {
                content_ref: content_ref.clone(),
                is_valid: true,
                vote_count: round.vote_count(),
            },
            QuorumOutcome::Fallback => {
                tracing::debug!(
                    content_ref = %content_ref,
                    yes = round.yes_votes(),
                    connected,
                    "No quorum, validating locally"
                );
                ValidationRecord {
                    content_ref: content_ref.clone(),
                    is_valid: self.validate_locally(content_ref).await?,
                    vote_count: round.vote_count(),
                }
            }
        };

        self.ctx.validations.upsert(&record)?;
        tracing::info!(
            "validated {} with result {} ({} vote(s))",
            content_ref,
            record.is_valid,
            record.vote_count
        );
        Ok(record)
    }

    /// Fetch the content and apply the node's predicate.
    pub async fn validate_locally(&self, content_ref: &ContentRef) -> Result<bool> {
        let data = self.ctx.content.get(content_ref).await?;
        self.ctx.predicate.validate(content_ref, &data).await
    }

    /// Ask peers for their opinion and tally replies for the quorum window.
    async fn collect_votes(&self, content_ref: &ContentRef) -> Result<QuorumRound> {
        let request = ValidationRequest {
            content_ref: content_ref.clone(),
            requester: self.ctx.peer_id.clone(),
        };

        let mut replies = self.ctx.transport.subscribe(&request.reply_topic()).await?;
        self.ctx
            .transport
            .publish(VALIDATION_TOPIC, Bytes::from(encode_message(&request)?))
            .await?;

        let mut round = QuorumRound::new();
        tally(&mut replies, &mut round).await;
        Ok(round)
    }
}

async fn tally(replies: &mut TopicSubscription, round: &mut QuorumRound) {
    let window = tokio::time::sleep(QUORUM_WINDOW);
    tokio::pin!(window);

    loop {
        tokio::select! {
            _ = &mut window => break,
            reply = replies.next() => match reply {
                Some(data) => match decode_message::<ValidationVote>(&data) {
                    Ok(vote) => {
                        round.observe(vote);
                    }
                    Err(error) => {
                        tracing::warn!(topic = %replies.topic(), "Ignoring malformed vote: {}", error);
                    }
                },
                None => {
                    (&mut window).await;
                    break;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vote(vote: bool) -> ValidationVote {
        ValidationVote { vote }
    }

    #[test]
    fn test_quorum_law() {
        assert!(!quorum_reached(0, 0));
        assert!(quorum_reached(1, 0));
        assert!(quorum_reached(1, 1));
        assert!(!quorum_reached(1, 2));
        assert!(quorum_reached(2, 3));
        assert!(!quorum_reached(2, 4));
        assert!(quorum_reached(3, 4));
    }

    #[test]
    fn test_round_ignores_no_votes_for_decision() {
        let mut round = QuorumRound::new();
        round.observe(vote(true));
        round.observe(vote(true));
        for _ in 0..10 {
            round.observe(vote(false));
        }
        assert_eq!(round.vote_count(), 12);
        assert_eq!(round.decide(3).unwrap(), QuorumOutcome::Valid);
        assert_eq!(round.phase(), QuorumPhase::Deciding);
    }

    #[test]
    fn test_round_decides_once() {
        let mut round = QuorumRound::new();
        round.observe(vote(true));
        assert_eq!(round.decide(2).unwrap(), QuorumOutcome::Fallback);
        assert_eq!(round.phase(), QuorumPhase::Fallback);

        assert!(!round.observe(vote(true)));
        assert!(round.decide(2).is_err());
        assert_eq!(round.vote_count(), 1);
    }
}
