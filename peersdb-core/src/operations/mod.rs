pub mod connect_peer;
pub mod get_content;
pub mod post_contribution;
pub mod query_contributions;
pub mod validate_content;

pub use connect_peer::{
    ConnectPeerOperation, ConnectPeerOperationRequest, ConnectPeerOperationResult,
};
pub use get_content::{
    GetContentOperation, GetContentOperationRequest, GetContentOperationResult, expand_home,
};
pub use post_contribution::{
    PostContributionOperation, PostContributionOperationRequest, PostContributionOperationResult,
};
pub use query_contributions::{QueryContributionsOperation, QueryContributionsOperationResult};
pub use validate_content::{
    AcceptAll, QuorumOutcome, QuorumPhase, QuorumRound, ValidateContentOperation,
    ValidityPredicate, quorum_reached,
};
