//! Group Call Mesh Test Harness
//!
//! Runs several orchestrators against an in-memory hub:
//! - Each client gets its own fakes (signaling, ICE, devices, connections)
//! - RPCs a client records are turned into hub events and broadcast to every
//!   other member of the group, in the order they were sent
//! - Link callback events are fed back into the owning orchestrator
//!
//! Basic usage pattern:
//!
//! 1. Create a `MeshHarness` with the member identities
//! 2. Drive clients through `harness.client_mut(name).orchestrator`
//! 3. Call `harness.settle()` to deliver everything in flight
//! 4. Inspect links, rosters and the routed RPC log

#![allow(dead_code)]

use group_call::orchestrator::GroupCallOrchestrator;
use group_call::peer::{LinkEvent, SdpType, SignalingState};
use group_call::testing::{FakeServices, FakeSignaling, HubCall};
use group_call::GroupCallConfig;
use std::collections::BTreeMap;
use tokio::sync::mpsc;
use tracing::debug;

/// Group every harness client belongs to
pub const GROUP: &str = "g1";

/// Placeholder identity of the default configuration
pub const PLACEHOLDER: &str = group_call::config::DEFAULT_PLACEHOLDER_IDENTITY;

/// Delivery rounds before the mesh is considered stuck
const MAX_ROUNDS: usize = 64;

/// Result type for test harness operations
pub type HarnessResult<T> = Result<T, HarnessError>;

/// Error type for test harness operations
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("Client error: {0}")]
    ClientError(String),

    #[error("Timeout: {0}")]
    Timeout(String),
}

/// RPC that went through the hub
#[derive(Debug, Clone)]
pub struct RoutedCall {
    pub sender: String,
    pub call: HubCall,
}

impl RoutedCall {
    /// Whether this is an SDP offer from `from` targeted at `to`
    pub fn is_targeted_offer(&self, from: &str, to: &str) -> bool {
        match &self.call {
            HubCall::AnswerGroupCall { payload, .. } => {
                self.sender == from
                    && payload.sdp_type == SdpType::Offer
                    && payload.target_identity.as_deref() == Some(to)
            }
            _ => false,
        }
    }
}

/// One simulated participant
pub struct MeshClient {
    pub identity: String,
    pub orchestrator: GroupCallOrchestrator,
    pub fakes: FakeServices,
    link_events: mpsc::UnboundedReceiver<LinkEvent>,
}

impl MeshClient {
    fn new(identity: &str) -> HarnessResult<Self> {
        let fakes =
            FakeServices::with_signaling(FakeSignaling::with_call_id(&format!("call-{}", identity)));
        let config = GroupCallConfig::new(identity);

        let (orchestrator, link_events) =
            GroupCallOrchestrator::new(&config, fakes.services())
                .map_err(|e| HarnessError::ClientError(e.to_string()))?;

        Ok(Self {
            identity: identity.to_string(),
            orchestrator,
            fakes,
            link_events,
        })
    }

    /// Negotiation state of our link to `peer`
    pub fn link_state(&self, peer: &str) -> Option<SignalingState> {
        self.orchestrator
            .registry()
            .get(peer)
            .map(|link| link.signaling_state())
    }

    /// Rostered usernames
    pub fn roster(&self) -> Vec<String> {
        self.orchestrator.store_handle().snapshot().usernames()
    }
}

/// In-memory hub connecting several clients
pub struct MeshHarness {
    clients: BTreeMap<String, MeshClient>,
    routed: Vec<RoutedCall>,
}

impl MeshHarness {
    /// Create a harness with one client per identity
    pub fn new(identities: &[&str]) -> HarnessResult<Self> {
        let mut clients = BTreeMap::new();
        for identity in identities {
            clients.insert(identity.to_string(), MeshClient::new(identity)?);
        }

        Ok(Self {
            clients,
            routed: Vec::new(),
        })
    }

    /// Get a client by identity
    pub fn client(&self, identity: &str) -> &MeshClient {
        match self.clients.get(identity) {
            Some(client) => client,
            None => panic!("no client {}", identity),
        }
    }

    /// Get a client mutably by identity
    pub fn client_mut(&mut self, identity: &str) -> &mut MeshClient {
        match self.clients.get_mut(identity) {
            Some(client) => client,
            None => panic!("no client {}", identity),
        }
    }

    /// Every RPC routed so far
    pub fn routed(&self) -> &[RoutedCall] {
        &self.routed
    }

    /// Number of targeted offers `from` sent to `to`
    pub fn targeted_offers(&self, from: &str, to: &str) -> usize {
        self.routed
            .iter()
            .filter(|routed| routed.is_targeted_offer(from, to))
            .count()
    }

    /// Deliver everything in flight, routing senders in identity order
    pub async fn settle(&mut self) -> HarnessResult<usize> {
        let order: Vec<String> = self.clients.keys().cloned().collect();
        let order: Vec<&str> = order.iter().map(String::as_str).collect();
        self.settle_in_order(&order).await
    }

    /// Deliver everything in flight, routing senders in the given order
    ///
    /// Returns the number of delivery rounds it took.
    pub async fn settle_in_order(&mut self, order: &[&str]) -> HarnessResult<usize> {
        for round in 0..MAX_ROUNDS {
            let mut progress = false;

            for identity in order {
                progress |= self.drain_link_events(identity).await;
            }
            for identity in order {
                progress |= self.route_from(identity).await;
            }

            if !progress {
                return Ok(round);
            }
        }

        Err(HarnessError::Timeout(format!(
            "mesh still busy after {} rounds",
            MAX_ROUNDS
        )))
    }

    async fn drain_link_events(&mut self, identity: &str) -> bool {
        let client = self.client_mut(identity);
        let mut progress = false;

        while let Ok(event) = client.link_events.try_recv() {
            client.orchestrator.handle_link_event(event).await;
            progress = true;
        }
        progress
    }

    async fn route_from(&mut self, sender: &str) -> bool {
        let (calls, call_id) = {
            let client = self.client(sender);
            (
                client.fakes.signaling.take_calls(),
                client.fakes.signaling.call_id().to_string(),
            )
        };
        if calls.is_empty() {
            return false;
        }

        let members: Vec<String> = self
            .clients
            .keys()
            .filter(|identity| identity.as_str() != sender)
            .cloned()
            .collect();

        for call in calls {
            debug!("hub: {} -> {:?}", sender, call);
            self.routed.push(RoutedCall {
                sender: sender.to_string(),
                call: call.clone(),
            });

            if call.group_id() != GROUP {
                continue;
            }

            let event = call.into_event(sender, &call_id);
            for member in &members {
                self.client_mut(member)
                    .orchestrator
                    .handle_hub_event(event.clone())
                    .await;
            }
        }
        true
    }

    /// Assert every pair of `members` holds a stable link to each other and
    /// has the other rostered
    pub fn assert_full_mesh(&self, members: &[&str]) {
        for a in members {
            let client = self.client(a);
            assert!(
                !client.orchestrator.registry().contains(PLACEHOLDER),
                "{} still holds the placeholder link",
                a
            );

            for b in members {
                if a == b {
                    continue;
                }
                assert_eq!(
                    client.link_state(b),
                    Some(SignalingState::Stable),
                    "{} -> {} link",
                    a,
                    b
                );
                assert!(
                    client.roster().iter().any(|name| name == b),
                    "{} does not roster {}",
                    a,
                    b
                );
            }
        }
    }
}
