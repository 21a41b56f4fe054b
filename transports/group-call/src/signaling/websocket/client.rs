//! WebSocket hub client

use super::super::protocol::*;
use super::super::SignalingClient;
use crate::peer::SessionDescription;
use crate::{Error, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

type PendingReplies = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<serde_json::Value>>>>>;

/// Hub client speaking JSON-RPC 2.0 over a WebSocket
///
/// Requests are matched to replies by numeric id; notifications are decoded
/// into [`HubEvent`]s and forwarded on the channel returned by
/// [`connect`](Self::connect).
pub struct WsSignalingClient {
    /// Outgoing frame sender
    tx: mpsc::UnboundedSender<Message>,

    /// Requests awaiting a reply
    pending: PendingReplies,

    /// Next request id
    next_id: AtomicU64,

    /// How long a request waits for its reply
    rpc_timeout: Duration,
}

impl WsSignalingClient {
    /// Connect to the hub
    ///
    /// # Arguments
    ///
    /// * `url` - Hub URL (ws:// or wss://)
    /// * `rpc_timeout` - Reply timeout for every outbound RPC
    pub async fn connect(
        url: &str,
        rpc_timeout: Duration,
    ) -> Result<(Self, mpsc::UnboundedReceiver<HubEvent>)> {
        info!("Connecting to signaling hub: {}", url);

        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|e| Error::WebSocketError(format!("Failed to connect: {}", e)))?;

        info!("Connected to signaling hub");

        let (write, read) = ws_stream.split();
        let (tx, rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let client = Self::with_sender(tx, rpc_timeout);

        tokio::spawn(Self::sender_task(write, rx));
        tokio::spawn(Self::receiver_task(read, client.pending.clone(), event_tx));

        Ok((client, event_rx))
    }

    fn with_sender(tx: mpsc::UnboundedSender<Message>, rpc_timeout: Duration) -> Self {
        Self {
            tx,
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            rpc_timeout,
        }
    }

    /// Close the socket; pending requests fail once the receiver exits
    pub fn close(&self) {
        let _ = self.tx.send(Message::Close(None));
    }

    /// Sender task: writes queued frames to the socket
    async fn sender_task(
        mut write: futures::stream::SplitSink<WsStream, Message>,
        mut rx: mpsc::UnboundedReceiver<Message>,
    ) {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if let Err(e) = write.send(msg).await {
                error!("Failed to send WebSocket message: {}", e);
                break;
            }
            if closing {
                break;
            }
        }

        debug!("Sender task terminated");
    }

    /// Receiver task: resolves replies and forwards hub events
    async fn receiver_task(
        mut read: futures::stream::SplitStream<WsStream>,
        pending: PendingReplies,
        events: mpsc::UnboundedSender<HubEvent>,
    ) {
        while let Some(msg_result) = read.next().await {
            match msg_result {
                Ok(Message::Text(text)) => {
                    if let Err(e) = dispatch(&text, &pending, &events) {
                        warn!("Failed to handle hub message: {}", e);
                    }
                }
                Ok(Message::Close(_)) => {
                    info!("Hub connection closed");
                    break;
                }
                Err(e) => {
                    error!("WebSocket error: {}", e);
                    break;
                }
                _ => {}
            }
        }

        // Dropping the senders fails every outstanding request
        let abandoned = std::mem::take(&mut *pending.lock());
        if !abandoned.is_empty() {
            warn!("{} hub requests abandoned by closed connection", abandoned.len());
        }

        debug!("Receiver task terminated");
    }

    async fn request<P: Serialize>(&self, method: &str, params: P) -> Result<serde_json::Value> {
        let params = serde_json::to_value(params).map_err(|e| {
            Error::SerializationError(format!("Failed to serialize {} params: {}", method, e))
        })?;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let frame = JsonRpcRequest::new(method, params, id).to_json()?;

        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.lock().insert(id, reply_tx);

        debug!("Sending hub request {} (id {})", method, id);
        if self.tx.send(Message::Text(frame)).is_err() {
            self.pending.lock().remove(&id);
            return Err(Error::WebSocketError(
                "Hub connection is closed".to_string(),
            ));
        }

        match tokio::time::timeout(self.rpc_timeout, reply_rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(Error::SignalingRpcFailed(format!(
                "{} aborted: hub connection closed",
                method
            ))),
            Err(_) => {
                self.pending.lock().remove(&id);
                Err(Error::SignalingRpcFailed(format!(
                    "{} timed out after {:?}",
                    method, self.rpc_timeout
                )))
            }
        }
    }
}

/// Route one inbound text frame
fn dispatch(
    text: &str,
    pending: &PendingReplies,
    events: &mpsc::UnboundedSender<HubEvent>,
) -> Result<()> {
    match JsonRpcMessage::from_json(text)? {
        JsonRpcMessage::Request(req) => {
            if req.id.is_some() {
                warn!("Ignoring hub request for {}", req.method);
                return Ok(());
            }

            match HubEvent::from_notification(&req.method, req.params)? {
                Some(event) => {
                    debug!("Hub event {}", event.method_name());
                    let _ = events.send(event);
                }
                None => debug!("Skipping unknown hub event {}", req.method),
            }
        }
        JsonRpcMessage::Response(resp) => complete(pending, &resp.id, Ok(resp.result)),
        JsonRpcMessage::Error(err) => complete(
            pending,
            &err.id,
            Err(Error::SignalingRpcFailed(format!(
                "{} (code {})",
                err.error.message, err.error.code
            ))),
        ),
    }

    Ok(())
}

fn complete(pending: &PendingReplies, id: &serde_json::Value, reply: Result<serde_json::Value>) {
    let waiter = id.as_u64().and_then(|id| pending.lock().remove(&id));
    match waiter {
        Some(waiter) => {
            let _ = waiter.send(reply);
        }
        None => debug!("Reply for unknown request id {}", id),
    }
}

#[async_trait]
impl SignalingClient for WsSignalingClient {
    async fn call_group(
        &self,
        group_id: &str,
        kind: CallKind,
        offer: SessionDescription,
    ) -> Result<String> {
        let result = self
            .request(
                methods::CALL_GROUP,
                CallGroupParams {
                    group_id: group_id.to_string(),
                    kind,
                    offer,
                },
            )
            .await?;

        let reply: CallGroupResult = serde_json::from_value(result).map_err(|e| {
            Error::SignalingRpcFailed(format!("Invalid callGroup reply: {}", e))
        })?;

        Ok(reply.call_id)
    }

    async fn answer_group_call(
        &self,
        call_id: &str,
        group_id: &str,
        kind: CallKind,
        payload: AnswerPayload,
    ) -> Result<()> {
        self.request(
            methods::ANSWER_GROUP_CALL,
            AnswerGroupCallParams {
                call_id: call_id.to_string(),
                group_id: group_id.to_string(),
                kind,
                answer_payload: payload,
            },
        )
        .await
        .map(|_| ())
    }

    async fn send_group_ice_candidate(
        &self,
        group_id: &str,
        payload: CandidatePayload,
    ) -> Result<()> {
        self.request(
            methods::SEND_GROUP_ICE_CANDIDATE,
            SendGroupIceCandidateParams {
                group_id: group_id.to_string(),
                candidate_payload: payload,
            },
        )
        .await
        .map(|_| ())
    }

    async fn reject_group_call(&self, call_id: &str, group_id: &str) -> Result<()> {
        self.request(
            methods::REJECT_GROUP_CALL,
            CallRefParams {
                call_id: call_id.to_string(),
                group_id: group_id.to_string(),
            },
        )
        .await
        .map(|_| ())
    }

    async fn end_group_call(&self, call_id: &str, group_id: &str) -> Result<()> {
        self.request(
            methods::END_GROUP_CALL,
            CallRefParams {
                call_id: call_id.to_string(),
                group_id: group_id.to_string(),
            },
        )
        .await
        .map(|_| ())
    }

    async fn toggle_group_camera(&self, group_id: &str, enabled: bool) -> Result<()> {
        self.request(
            methods::TOGGLE_GROUP_CAMERA,
            ToggleParams {
                group_id: group_id.to_string(),
                enabled,
            },
        )
        .await
        .map(|_| ())
    }

    async fn toggle_group_microphone(&self, group_id: &str, enabled: bool) -> Result<()> {
        self.request(
            methods::TOGGLE_GROUP_MICROPHONE,
            ToggleParams {
                group_id: group_id.to_string(),
                enabled,
            },
        )
        .await
        .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::net::TcpListener;

    /// Client whose outgoing frames land on the returned receiver
    fn loopback(timeout: Duration) -> (WsSignalingClient, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (WsSignalingClient::with_sender(tx, timeout), rx)
    }

    fn sent_request(msg: Message) -> JsonRpcRequest {
        match msg {
            Message::Text(text) => serde_json::from_str(&text).unwrap(),
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_reply_resolves_request() {
        let (client, mut outgoing) = loopback(Duration::from_secs(5));
        let client = Arc::new(client);
        let (events, _event_rx) = mpsc::unbounded_channel();

        let caller = {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .call_group("g1", CallKind::Video, SessionDescription::offer("v=0"))
                    .await
            })
        };

        let req = sent_request(outgoing.recv().await.unwrap());
        assert_eq!(req.method, methods::CALL_GROUP);
        assert_eq!(req.params["groupId"], "g1");
        assert_eq!(req.params["offer"]["type"], "offer");

        let reply = JsonRpcResponse::new(json!({"callId": "call-7"}), req.id.unwrap());
        dispatch(&reply.to_json().unwrap(), &client.pending, &events).unwrap();

        assert_eq!(caller.await.unwrap().unwrap(), "call-7");
    }

    #[tokio::test]
    async fn test_error_reply_is_rpc_failure() {
        let (client, mut outgoing) = loopback(Duration::from_secs(5));
        let client = Arc::new(client);
        let (events, _event_rx) = mpsc::unbounded_channel();

        let caller = {
            let client = client.clone();
            tokio::spawn(async move { client.end_group_call("c1", "g1").await })
        };

        let req = sent_request(outgoing.recv().await.unwrap());
        let err = JsonRpcError::new(
            error_codes::INTERNAL_ERROR,
            "not a member",
            req.id.unwrap(),
        );
        dispatch(&err.to_json().unwrap(), &client.pending, &events).unwrap();

        let result = caller.await.unwrap();
        assert!(matches!(result, Err(Error::SignalingRpcFailed(ref m)) if m.contains("not a member")));
    }

    #[tokio::test]
    async fn test_request_times_out() {
        let (client, _outgoing) = loopback(Duration::from_millis(20));

        let result = client.toggle_group_camera("g1", false).await;

        assert!(matches!(result, Err(Error::SignalingRpcFailed(ref m)) if m.contains("timed out")));
        assert!(client.pending.lock().is_empty());
    }

    #[tokio::test]
    async fn test_closed_sender_fails_fast() {
        let (client, outgoing) = loopback(Duration::from_secs(5));
        drop(outgoing);

        let result = client.reject_group_call("c1", "g1").await;
        assert!(matches!(result, Err(Error::WebSocketError(_))));
    }

    #[tokio::test]
    async fn test_notification_becomes_event() {
        let pending: PendingReplies = Arc::new(Mutex::new(HashMap::new()));
        let (events, mut event_rx) = mpsc::unbounded_channel();

        dispatch(
            r#"{"jsonrpc":"2.0","method":"group_call_rejected","params":{"identity":"bob"}}"#,
            &pending,
            &events,
        )
        .unwrap();
        dispatch(
            r#"{"jsonrpc":"2.0","method":"presence","params":{}}"#,
            &pending,
            &events,
        )
        .unwrap();

        assert_eq!(
            event_rx.try_recv().unwrap(),
            HubEvent::GroupCallRejected(ParticipantGone {
                identity: "bob".to_string()
            })
        );
        assert!(event_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_against_socket_hub() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let hub = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

            let Some(Ok(Message::Text(text))) = ws.next().await else {
                panic!("expected request");
            };
            let req: JsonRpcRequest = serde_json::from_str(&text).unwrap();
            assert_eq!(req.method, methods::SEND_GROUP_ICE_CANDIDATE);
            assert_eq!(req.params["candidatePayload"]["_targetIdentity"], "bob");

            let reply = JsonRpcResponse::new(json!(null), req.id.unwrap());
            ws.send(Message::Text(reply.to_json().unwrap())).await.unwrap();

            let event = HubEvent::GroupMicrophoneToggle(MediaToggle {
                identity: "bob".to_string(),
                enabled: false,
            });
            let frame = event.to_notification().unwrap().to_json().unwrap();
            ws.send(Message::Text(frame)).await.unwrap();
        });

        let (client, mut events) =
            WsSignalingClient::connect(&format!("ws://{}", addr), Duration::from_secs(5))
                .await
                .unwrap();

        client
            .send_group_ice_candidate(
                "g1",
                CandidatePayload::targeted(crate::peer::IceCandidate::new("candidate:1"), "bob"),
            )
            .await
            .unwrap();

        let event = events.recv().await.unwrap();
        assert!(matches!(event, HubEvent::GroupMicrophoneToggle(ref t) if !t.enabled));

        hub.await.unwrap();
        client.close();
    }
}
