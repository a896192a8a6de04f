//! # Streaming Gateway
//!
//! Websocket endpoint at `/api/v1/purity/stream`. One actor per connection.
//!
//! ## Protocol:
//! - **Client → Server** (JSON, tagged by `action`):
//!   - `{"action":"frame","data":"<base64 or data: URL>","itemIndex":2}`
//!   - `{"action":"start","cameraIndex":0}`, `{"action":"stop"}`, `{"action":"reset"}`
//!   - `{"action":"ping"}`
//! - **Server → Client** (JSON, tagged by `type`):
//!   - `frame`: an annotated frame result (from this connection's session or the pipeline)
//!   - `control`: outcome of `start` / `stop` / `reset`
//!   - `status`: current stage status (answer to `ping`, and pushed every 0.5 s while idle)
//!   - `error`: a frame that could not be decoded
//!
//! ## Sessions:
//! Frames sent by the client run through a per-connection [`PuritySession`];
//! `start` / `stop` / `reset` drive the shared pipeline, whose results are
//! forwarded while it runs. At most one client frame is processed at a time;
//! a frame arriving meanwhile replaces any frame already waiting.
//!
//! Session locks are only taken on blocking threads. The actor keeps the
//! last status its own session reported, and reads the pipeline's published
//! snapshot, so `ping` and the idle push never wait on a frame in progress.

use crate::confirmation::StageStatus;
use crate::session::{FrameResult, PuritySession};
use crate::state::AppState;
use crate::vision::codec::{decode_base64_frame, FrameCodecError};
use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);
const STATUS_PUSH_INTERVAL: Duration = Duration::from_millis(500);
const FORWARD_INTERVAL: Duration = Duration::from_millis(30);
/// A client counts as streaming if it sent a frame this recently.
const CLIENT_FRAME_IDLE: Duration = Duration::from_secs(1);

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum ClientAction {
    #[serde(rename_all = "camelCase")]
    Frame { data: String, item_index: Option<u32> },
    #[serde(rename_all = "camelCase")]
    Start {
        #[serde(default)]
        camera_index: u32,
    },
    Stop,
    Reset,
    Ping,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    Frame(FrameResult),
    Control { result: serde_json::Value },
    Status { status: StageStatus },
    Error { message: String },
}

impl ServerMessage {
    fn to_json(&self) -> Option<String> {
        serde_json::to_string(self)
            .map_err(|e| error!(error = %e, "Failed to serialize websocket message"))
            .ok()
    }
}

struct PendingFrame {
    data: String,
    item_index: Option<u32>,
}

pub struct StreamingGateway {
    state: web::Data<AppState>,
    session: Arc<Mutex<PuritySession>>,
    /// Status of `session` as of its last frame or reset.
    client_status: StageStatus,
    last_heartbeat: Instant,
    last_client_frame: Option<Instant>,
    frame_in_flight: bool,
    pending_frame: Option<PendingFrame>,
}

impl StreamingGateway {
    pub fn new(state: web::Data<AppState>) -> Self {
        let session_id = format!("ws-{}", &Uuid::new_v4().simple().to_string()[..8]);
        let session = PuritySession::new(session_id, &state.session_services(), &state.get_config());
        Self {
            client_status: session.status(),
            session: Arc::new(Mutex::new(session)),
            last_heartbeat: Instant::now(),
            last_client_frame: None,
            frame_in_flight: false,
            pending_frame: None,
            state,
        }
    }

    fn send(ctx: &mut ws::WebsocketContext<Self>, message: &ServerMessage) {
        if let Some(json) = message.to_json() {
            ctx.text(json);
        }
    }

    fn is_idle(&self) -> bool {
        !self.state.pipeline.is_running() && !client_streaming(self.last_client_frame, Instant::now())
    }

    /// Status of whichever session the client is currently driving.
    fn current_status(&self) -> StageStatus {
        if self.last_client_frame.is_some() && !self.state.pipeline.is_running() {
            self.client_status.clone()
        } else {
            self.state.pipeline.stage_status()
        }
    }

    fn handle_action(&mut self, action: ClientAction, ctx: &mut ws::WebsocketContext<Self>) {
        match action {
            ClientAction::Frame { data, item_index } => {
                self.last_client_frame = Some(Instant::now());
                let frame = PendingFrame { data, item_index };
                if self.frame_in_flight {
                    if self.pending_frame.replace(frame).is_some() {
                        debug!("Replaced waiting websocket frame");
                    }
                } else {
                    self.process_frame(frame, ctx);
                }
            }
            ClientAction::Start { camera_index } => {
                let pipeline = Arc::clone(&self.state.pipeline);
                let config = self.state.get_config();
                let work = tokio::task::spawn_blocking(move || pipeline.start(camera_index, &config));
                ctx.spawn(work.into_actor(self).map(move |joined, _act, ctx| {
                    let result = match joined {
                        Ok(Ok(info)) => json!({ "action": "start", "ok": true, "pipeline": info }),
                        Ok(Err(e)) => {
                            warn!(camera = camera_index, error = %e, "Websocket start failed");
                            json!({ "action": "start", "ok": false, "error": e.to_string() })
                        }
                        Err(e) => json!({ "action": "start", "ok": false, "error": e.to_string() }),
                    };
                    Self::send(ctx, &ServerMessage::Control { result });
                }));
            }
            ClientAction::Stop => {
                let pipeline = Arc::clone(&self.state.pipeline);
                let work = tokio::task::spawn_blocking(move || pipeline.stop());
                ctx.spawn(work.into_actor(self).map(|joined, _act, ctx| {
                    let stopped = joined.unwrap_or(false);
                    let result = json!({ "action": "stop", "ok": true, "wasRunning": stopped });
                    Self::send(ctx, &ServerMessage::Control { result });
                }));
            }
            ClientAction::Reset => {
                self.pending_frame = None;
                let session = Arc::clone(&self.session);
                let pipeline = Arc::clone(&self.state.pipeline);
                let work = tokio::task::spawn_blocking(move || {
                    let client = {
                        let mut session = session.lock().unwrap_or_else(PoisonError::into_inner);
                        session.reset();
                        session.status()
                    };
                    (client, pipeline.reset())
                });
                ctx.spawn(work.into_actor(self).map(|joined, act, ctx| {
                    let result = match joined {
                        Ok((client, status)) => {
                            act.client_status = client;
                            json!({ "action": "reset", "ok": true, "status": status })
                        }
                        Err(e) => {
                            error!(error = %e, "Websocket reset task failed");
                            json!({ "action": "reset", "ok": false, "error": e.to_string() })
                        }
                    };
                    Self::send(ctx, &ServerMessage::Control { result });
                }));
            }
            ClientAction::Ping => {
                Self::send(ctx, &ServerMessage::Status { status: self.current_status() });
            }
        }
    }

    fn process_frame(&mut self, frame: PendingFrame, ctx: &mut ws::WebsocketContext<Self>) {
        self.frame_in_flight = true;
        let session = Arc::clone(&self.session);
        let work = tokio::task::spawn_blocking(move || run_client_frame(&session, &frame.data, frame.item_index));

        ctx.spawn(work.into_actor(self).map(|joined, act, ctx| {
            act.frame_in_flight = false;
            let message = match joined {
                Ok(Ok(result)) => {
                    act.client_status = result.status.clone();
                    ServerMessage::Frame(result)
                }
                Ok(Err(e)) => {
                    debug!(error = %e, "Rejected websocket frame");
                    ServerMessage::Error { message: e.to_string() }
                }
                Err(e) => {
                    error!(error = %e, "Websocket frame task failed");
                    ServerMessage::Error { message: "frame processing failed".to_string() }
                }
            };
            Self::send(ctx, &message);

            if let Some(next) = act.pending_frame.take() {
                act.process_frame(next, ctx);
            }
        }));
    }
}

fn run_client_frame(
    session: &Mutex<PuritySession>,
    data: &str,
    item_index: Option<u32>,
) -> Result<FrameResult, FrameCodecError> {
    let frame = decode_base64_frame(data)?;
    let mut session = session.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(index) = item_index {
        session.set_item_index(index);
    }
    Ok(session.process_frame_encoded(frame)?.result)
}

fn client_streaming(last_client_frame: Option<Instant>, now: Instant) -> bool {
    last_client_frame.is_some_and(|at| now.duration_since(at) < CLIENT_FRAME_IDLE)
}

impl Actor for StreamingGateway {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        self.state.connection_opened();
        info!("Streaming gateway connected");

        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!("Websocket heartbeat timeout, closing connection");
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });

        ctx.run_interval(FORWARD_INTERVAL, |act, ctx| {
            while let Some(frame) = act.state.pipeline.next_result() {
                Self::send(ctx, &ServerMessage::Frame(frame.encoded.result.clone()));
            }
        });

        ctx.run_interval(STATUS_PUSH_INTERVAL, |act, ctx| {
            if act.is_idle() {
                Self::send(ctx, &ServerMessage::Status { status: act.current_status() });
            }
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        self.state.connection_closed();
        info!("Streaming gateway disconnected");
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for StreamingGateway {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => {
                self.last_heartbeat = Instant::now();
                match serde_json::from_str::<ClientAction>(&text) {
                    Ok(action) => self.handle_action(action, ctx),
                    Err(e) => debug!(error = %e, "Ignoring malformed websocket message"),
                }
            }
            Ok(ws::Message::Binary(_)) => {
                self.last_heartbeat = Instant::now();
                debug!("Ignoring binary websocket message");
            }
            Ok(ws::Message::Ping(data)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!(reason = ?reason, "Websocket closed by client");
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!("Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(e) => {
                error!(error = %e, "Websocket protocol error");
                ctx.stop();
            }
        }
    }
}

/// Upgrade `GET /api/v1/purity/stream` to a websocket.
pub async fn stream_ws(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> Result<HttpResponse, actix_web::Error> {
    debug!(peer = ?req.connection_info().peer_addr(), "Websocket upgrade requested");
    ws::start(StreamingGateway::new(state), &req, stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::confirmation::Stage;
    use crate::config::AppConfig;
    use crate::session::tests::services;
    use crate::state::tests::test_state;
    use crate::vision::codec::encode_base64_jpeg;
    use crate::vision::rubbing::tests::RubbingScene;
    use image::RgbImage;

    #[test]
    fn test_client_action_parsing() {
        let frame: ClientAction = serde_json::from_str(r#"{"action":"frame","data":"abc","itemIndex":4}"#).unwrap();
        assert!(matches!(frame, ClientAction::Frame { ref data, item_index: Some(4) } if data == "abc"));

        let start: ClientAction = serde_json::from_str(r#"{"action":"start","cameraIndex":2}"#).unwrap();
        assert!(matches!(start, ClientAction::Start { camera_index: 2 }));

        let start: ClientAction = serde_json::from_str(r#"{"action":"start"}"#).unwrap();
        assert!(matches!(start, ClientAction::Start { camera_index: 0 }));

        assert!(matches!(serde_json::from_str(r#"{"action":"ping"}"#).unwrap(), ClientAction::Ping));
        assert!(serde_json::from_str::<ClientAction>(r#"{"action":"dance"}"#).is_err());
        assert!(serde_json::from_str::<ClientAction>("not json").is_err());
    }

    #[test]
    fn test_server_message_shapes() {
        let error = ServerMessage::Error { message: "bad frame".into() }.to_json().unwrap();
        let error: serde_json::Value = serde_json::from_str(&error).unwrap();
        assert_eq!(error, json!({ "type": "error", "message": "bad frame" }));

        let control = ServerMessage::Control { result: json!({ "action": "stop" }) }.to_json().unwrap();
        assert!(control.contains(r#""type":"control""#));
    }

    #[test]
    fn test_client_frame_round_trip() {
        let scene = Arc::new(RubbingScene::new((50.0, 50.0, 150.0, 150.0)));
        let session = Mutex::new(PuritySession::new("ws-test", &services(scene, None), &AppConfig::default()));
        let data = encode_base64_jpeg(&RgbImage::new(200, 200), 80).unwrap();

        let result = run_client_frame(&session, &data, Some(6)).unwrap();
        assert_eq!(result.frame_index, 1);
        assert_eq!(result.status.item_index, 6);
        assert_eq!(result.status.task, Stage::Rubbing);

        let message = ServerMessage::Frame(result).to_json().unwrap();
        let message: serde_json::Value = serde_json::from_str(&message).unwrap();
        assert_eq!(message["type"], "frame");
        assert!(message["frame"].is_string());

        assert!(matches!(run_client_frame(&session, "%%%", None), Err(FrameCodecError::Base64(_))));
    }

    #[test]
    fn test_status_is_read_without_session_lock() {
        let mut gateway = StreamingGateway::new(web::Data::new(test_state(AppConfig::default())));
        gateway.last_client_frame = Some(Instant::now());
        let session = Arc::clone(&gateway.session);
        // stands in for a client frame stuck in a slow detector call
        let _processing = session.lock().unwrap();

        let (tx, rx) = crossbeam_channel::bounded(1);
        std::thread::spawn(move || {
            let _ = tx.send(gateway.current_status().task);
        });
        let task = rx
            .recv_timeout(Duration::from_secs(1))
            .expect("status waited on the connection session");
        assert_eq!(task, Stage::Rubbing);
    }

    #[test]
    fn test_client_streaming_window() {
        let now = Instant::now();
        assert!(!client_streaming(None, now));
        assert!(client_streaming(Some(now), now));
        assert!(!client_streaming(Some(now), now + Duration::from_secs(2)));
    }
}
