//! Call task: the single owner of the orchestrator
//!
//! User commands, hub events and link callback events are all funnelled into
//! one task, so the orchestrator never sees two of them interleaved. The one
//! exception is hang-up, which raises a flag directly so that a start/accept
//! suspended inside the task can notice it.

use crate::orchestrator::{GroupCallOrchestrator, HangupFlag};
use crate::peer::LinkEvent;
use crate::session::{CallSnapshot, CallStoreHandle};
use crate::signaling::{CallKind, HubEvent};
use crate::{Error, Result};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

type Reply = oneshot::Sender<Result<()>>;

/// Command sent from a [`CallHandle`] to the call task
#[derive(Debug)]
pub enum CallCommand {
    Start {
        group_id: String,
        kind: CallKind,
        reply: Reply,
    },
    Accept {
        reply: Reply,
    },
    Reject {
        reply: Reply,
    },
    Leave {
        reply: Reply,
    },
    ToggleCamera {
        enabled: bool,
        reply: Reply,
    },
    ToggleMicrophone {
        enabled: bool,
        reply: Reply,
    },
    Shutdown,
}

/// Cloneable front end of a running call task
#[derive(Clone)]
pub struct CallHandle {
    commands: mpsc::UnboundedSender<CallCommand>,
    hangup: HangupFlag,
    store: CallStoreHandle,
}

impl CallHandle {
    /// Start a call in `group_id`
    pub async fn start_call(&self, group_id: &str, kind: CallKind) -> Result<()> {
        self.request(|reply| CallCommand::Start {
            group_id: group_id.to_string(),
            kind,
            reply,
        })
        .await
    }

    /// Accept the ringing call
    pub async fn accept_call(&self) -> Result<()> {
        self.request(|reply| CallCommand::Accept { reply }).await
    }

    /// Decline the ringing call
    pub async fn reject_call(&self) -> Result<()> {
        self.request(|reply| CallCommand::Reject { reply }).await
    }

    /// Leave the call, cancelling a start/accept in progress
    pub async fn leave_call(&self) -> Result<()> {
        self.hang_up();
        self.request(|reply| CallCommand::Leave { reply }).await
    }

    /// Cancel a start/accept in progress without waiting for the call task
    pub fn hang_up(&self) {
        self.hangup.raise();
    }

    /// Mute or unmute the camera
    pub async fn toggle_camera(&self, enabled: bool) -> Result<()> {
        self.request(|reply| CallCommand::ToggleCamera { enabled, reply })
            .await
    }

    /// Mute or unmute the microphone
    pub async fn toggle_microphone(&self, enabled: bool) -> Result<()> {
        self.request(|reply| CallCommand::ToggleMicrophone { enabled, reply })
            .await
    }

    /// Stop the call task, leaving any active call first
    pub fn shutdown(&self) {
        if self.commands.send(CallCommand::Shutdown).is_err() {
            debug!("Call task already stopped");
        }
    }

    /// Latest call state
    pub fn snapshot(&self) -> CallSnapshot {
        self.store.snapshot()
    }

    /// Read handle of the session store
    pub fn store(&self) -> &CallStoreHandle {
        &self.store
    }

    async fn request(&self, command: impl FnOnce(Reply) -> CallCommand) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();

        self.commands
            .send(command(reply_tx))
            .map_err(|_| Error::InvalidState("call task stopped".to_string()))?;

        reply_rx
            .await
            .map_err(|_| Error::InvalidState("call task stopped before replying".to_string()))?
    }
}

/// Spawns the call task
pub struct CallRuntime;

impl CallRuntime {
    /// Spawn the task driving `orchestrator`
    ///
    /// # Arguments
    ///
    /// * `orchestrator` - Idle orchestrator, moved into the task
    /// * `link_events` - Receiver returned by [`GroupCallOrchestrator::new`]
    /// * `hub_events` - Inbound hub events (e.g. from [`WsSignalingClient::connect`](crate::WsSignalingClient::connect))
    pub fn spawn(
        orchestrator: GroupCallOrchestrator,
        link_events: mpsc::UnboundedReceiver<LinkEvent>,
        hub_events: mpsc::UnboundedReceiver<HubEvent>,
    ) -> (CallHandle, JoinHandle<()>) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();

        let handle = CallHandle {
            commands: commands_tx,
            hangup: orchestrator.hangup_flag(),
            store: orchestrator.store_handle(),
        };

        let task = tokio::spawn(run(orchestrator, commands_rx, link_events, hub_events));

        (handle, task)
    }
}

async fn run(
    mut orchestrator: GroupCallOrchestrator,
    mut commands: mpsc::UnboundedReceiver<CallCommand>,
    mut link_events: mpsc::UnboundedReceiver<LinkEvent>,
    mut hub_events: mpsc::UnboundedReceiver<HubEvent>,
) {
    info!("Call task started for {}", orchestrator.local_identity());
    let mut hub_open = true;

    loop {
        tokio::select! {
            command = commands.recv() => {
                match command {
                    Some(CallCommand::Shutdown) | None => {
                        info!("Call task shutting down");
                        break;
                    }
                    Some(command) => execute(&mut orchestrator, command).await,
                }
            }

            Some(event) = link_events.recv() => {
                orchestrator.handle_link_event(event).await;
            }

            event = hub_events.recv(), if hub_open => {
                match event {
                    Some(event) => orchestrator.handle_hub_event(event).await,
                    None => {
                        warn!("Hub event stream closed");
                        hub_open = false;
                    }
                }
            }
        }
    }

    orchestrator.shutdown().await;
}

async fn execute(orchestrator: &mut GroupCallOrchestrator, command: CallCommand) {
    let (result, reply) = match command {
        CallCommand::Start {
            group_id,
            kind,
            reply,
        } => (orchestrator.start_call(&group_id, kind).await, reply),
        CallCommand::Accept { reply } => (orchestrator.accept_ringing().await, reply),
        CallCommand::Reject { reply } => (orchestrator.reject_call().await, reply),
        CallCommand::Leave { reply } => (orchestrator.leave_call().await, reply),
        CallCommand::ToggleCamera { enabled, reply } => {
            (orchestrator.toggle_camera(enabled).await, reply)
        }
        CallCommand::ToggleMicrophone { enabled, reply } => {
            (orchestrator.toggle_microphone(enabled).await, reply)
        }
        CallCommand::Shutdown => return,
    };

    if reply.send(result).is_err() {
        debug!("Command issuer went away before the reply");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GroupCallConfig;
    use crate::session::{CallNotice, Lifecycle};
    use crate::testing::{FakeServices, HubCall};
    use std::time::Duration;

    fn spawn(
        identity: &str,
        fakes: &FakeServices,
    ) -> (CallHandle, JoinHandle<()>, mpsc::UnboundedSender<HubEvent>) {
        let config = GroupCallConfig::new(identity);
        let (orchestrator, link_rx) =
            GroupCallOrchestrator::new(&config, fakes.services()).unwrap();
        let (hub_tx, hub_rx) = mpsc::unbounded_channel();
        let (handle, task) = CallRuntime::spawn(orchestrator, link_rx, hub_rx);
        (handle, task, hub_tx)
    }

    #[tokio::test]
    async fn test_commands_round_trip() {
        let fakes = FakeServices::new();
        let (handle, task, _hub) = spawn("carol", &fakes);

        handle.start_call("g1", CallKind::Audio).await.unwrap();
        assert_eq!(handle.snapshot().lifecycle(), Lifecycle::Active);

        handle.toggle_microphone(false).await.unwrap();
        assert!(!handle.snapshot().local_audio_enabled);

        handle.leave_call().await.unwrap();
        assert_eq!(handle.snapshot().lifecycle(), Lifecycle::Idle);

        handle.shutdown();
        task.await.unwrap();
        assert!(handle.accept_call().await.is_err());
    }

    #[tokio::test]
    async fn test_leave_cancels_suspended_start() {
        let fakes = FakeServices::new();
        let gate = fakes.signaling.hold_call_group();
        let (handle, task, _hub) = spawn("carol", &fakes);
        let mut notices = handle.store().notices();

        let starter = handle.clone();
        let start = tokio::spawn(async move { starter.start_call("g1", CallKind::Video).await });

        let mut snapshots = handle.store().subscribe();
        tokio::time::timeout(
            Duration::from_secs(1),
            snapshots.wait_for(|s| s.lifecycle() == Lifecycle::Starting),
        )
        .await
        .unwrap()
        .unwrap();

        handle.hang_up();
        gate.notify_one();

        let err = start.await.unwrap().err().unwrap();
        assert!(matches!(err, Error::Cancelled(_)));
        handle.leave_call().await.unwrap();

        let snapshot = handle.snapshot();
        assert_eq!(snapshot.lifecycle(), Lifecycle::Idle);
        assert!(snapshot.participants.is_empty());
        assert_eq!(notices.recv().await.unwrap(), CallNotice::CallEnded);
        assert!(fakes
            .signaling
            .calls()
            .iter()
            .any(|call| matches!(call, HubCall::EndGroupCall { .. })));

        handle.shutdown();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_hub_events_reach_orchestrator() {
        let fakes = FakeServices::new();
        let (handle, task, hub) = spawn("xavier", &fakes);
        let mut notices = handle.store().notices();

        let offer = HubCall::CallGroup {
            group_id: "g1".to_string(),
            kind: CallKind::Audio,
            offer: crate::peer::SessionDescription::offer("offer:carol:1"),
        };
        hub.send(offer.into_event("carol", "call-1")).unwrap();

        let notice = notices.recv().await.unwrap();
        assert!(matches!(notice, CallNotice::IncomingCall(_)));

        handle.accept_call().await.unwrap();
        let snapshot = handle.snapshot();
        assert_eq!(snapshot.lifecycle(), Lifecycle::Active);
        assert_eq!(snapshot.usernames(), vec!["carol"]);

        handle.shutdown();
        task.await.unwrap();
        assert!(fakes.connections.connection("carol").unwrap().is_closed());
    }
}
