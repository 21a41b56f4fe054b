//! Resolution of inbound `group_call_answered` events
//!
//! Every member of a call sees every answer, because the hub only broadcasts.
//! [`resolve`] decides what a single answer means to the local client. The
//! rules are checked in a fixed order and depend only on the envelope, the
//! local role and the link (if any) already held for the answerer, so every
//! client reaches the same conclusion for the same pair.

use crate::peer::{SdpType, SignalingState};
use crate::session::CallRole;
use crate::signaling::AnswerPayload;

/// Local facts the resolution depends on
#[derive(Debug, Clone, Copy)]
pub struct AnswerContext<'a> {
    /// Our own identity
    pub local_identity: &'a str,

    /// Whether we sent the broadcast offer
    pub role: CallRole,

    /// Whether the placeholder link was already renamed to a first answerer
    pub placeholder_claimed: bool,

    /// Negotiation state of the link held for the answerer, if any
    pub existing_link: Option<SignalingState>,
}

/// Why an answer is dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// Targeted at another member
    AddressedElsewhere,
    /// Link already negotiated
    AlreadyStable,
}

/// What to do with an answer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnswerAction {
    /// Drop it
    Ignore(IgnoreReason),
    /// A later joiner offered us a fresh link: replace any link to them and answer
    AnswerTargetedOffer,
    /// Reply to an offer we sent them
    ApplyTargetedAnswer,
    /// First answer to our broadcast offer: the placeholder link becomes theirs
    ClaimPlaceholder,
    /// Another answer to our broadcast offer: offer them a link of their own
    OfferNewAnswerer,
    /// Pair of non-callers where we sort first: we offer
    OriginateOffer,
    /// Pair of non-callers where they sort first: they will offer
    AwaitOffer,
    /// Link exists mid-negotiation: apply as its remote description
    ApplyAnswer,
}

/// Whether `local` originates the link to `remote` between two non-callers
pub fn originates(local: &str, remote: &str) -> bool {
    local < remote
}

/// Decide how to handle an answer envelope from `answerer`
pub fn resolve(ctx: &AnswerContext<'_>, answerer: &str, payload: &AnswerPayload) -> AnswerAction {
    if let Some(target) = payload.target_identity.as_deref() {
        if target != ctx.local_identity {
            return AnswerAction::Ignore(IgnoreReason::AddressedElsewhere);
        }

        return match payload.sdp_type {
            SdpType::Offer => AnswerAction::AnswerTargetedOffer,
            SdpType::Answer => AnswerAction::ApplyTargetedAnswer,
        };
    }

    if ctx.role == CallRole::Caller && !ctx.placeholder_claimed {
        return AnswerAction::ClaimPlaceholder;
    }

    // Fan-out and pairing only concern members we hold no link for yet
    if ctx.existing_link.is_none() {
        if ctx.role == CallRole::Caller {
            return AnswerAction::OfferNewAnswerer;
        }

        return if originates(ctx.local_identity, answerer) {
            AnswerAction::OriginateOffer
        } else {
            AnswerAction::AwaitOffer
        };
    }

    match ctx.existing_link {
        Some(SignalingState::Stable) => AnswerAction::Ignore(IgnoreReason::AlreadyStable),
        _ => AnswerAction::ApplyAnswer,
    }
}
