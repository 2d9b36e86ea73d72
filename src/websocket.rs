//! # Call Monitor WebSocket
//!
//! One actor per monitoring client. Clients connect to
//! `/ws/calls/{call_id}?display_name=<caller label>` and receive the call's
//! audio and transcript in conversational order.
//!
//! ## What the actor owns:
//! - the `CallSession` reducer for this call
//! - the playback scheduler task and its device-ready flag
//! - the upstream call stream link
//! - every timer of the call (status watchdog, transcript deadlines, keepalive)
//!
//! Everything is created when the socket starts and released when it stops.
//!
//! ## Message Format:
//! - **Client → Server**: JSON `ClientCommand`s (`audio_unlocked`, `mute`, `end_call`, `pong`)
//! - **Server → Client**: JSON `ClientEvent`s plus binary audio frames

use crate::audio::chunk::Party;
use crate::audio::codec::CodecError;
use crate::audio::enhance::VoiceEnhancer;
use crate::call::event::{encode_audio_frame, ClientCommand, ClientEvent};
use crate::call::playback::{PlaybackHandle, PlaybackReport, PlaybackScheduler, RenderedFrame};
use crate::call::session::{CallPhase, CallSession, DecodeOutcome, Effect};
use crate::config::AppConfig;
use crate::error::AppError;
use crate::state::AppState;
use crate::upstream::{self, LinkError, UpstreamLink, UpstreamMessage};

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Query parameters of the monitoring socket.
#[derive(Debug, Default, Deserialize)]
pub struct MonitorQuery {
    /// Caller label shown on transcript lines
    pub display_name: Option<String>,
}

/// Result of the upstream connect task.
#[derive(Message)]
#[rtype(result = "()")]
struct UpstreamConnected(Result<UpstreamLink, LinkError>);

/// A decode job finished on the blocking pool.
#[derive(Message)]
#[rtype(result = "()")]
struct DecodeFinished(DecodeOutcome);

pub struct CallMonitorSocket {
    monitor_id: Uuid,
    state: AppState,
    config: AppConfig,
    session: CallSession,
    enhancer: Arc<VoiceEnhancer>,
    playback: Option<PlaybackHandle>,
    device_ready: watch::Sender<bool>,
    upstream: Option<UpstreamLink>,
    status_watchdog: Option<SpawnHandle>,
    last_heartbeat: Instant,
    released: bool,
}

impl CallMonitorSocket {
    pub fn new(call_id: String, display_name: Option<String>, state: AppState) -> Self {
        let config = state.get_config();
        let settings = config.session_settings(display_name.as_deref());
        let (device_ready, _) = watch::channel(false);
        Self {
            monitor_id: Uuid::new_v4(),
            session: CallSession::new(call_id, settings),
            enhancer: Arc::new(VoiceEnhancer::new(config.enhancement.clone())),
            config,
            state,
            playback: None,
            device_ready,
            upstream: None,
            status_watchdog: None,
            last_heartbeat: Instant::now(),
            released: false,
        }
    }

    /// Execute the effects returned by the session, in order.
    fn apply(&mut self, effects: Vec<Effect>, ctx: &mut ws::WebsocketContext<Self>) {
        for effect in effects {
            match effect {
                Effect::Decode(job) => {
                    let ticket = job.ticket;
                    let enhancer = self.enhancer.clone();
                    let addr = ctx.address();
                    tokio::spawn(async move {
                        let outcome = match tokio::task::spawn_blocking(move || job.run(&enhancer)).await {
                            Ok(outcome) => outcome,
                            Err(e) => DecodeOutcome {
                                ticket,
                                result: Err(CodecError::Aborted(e.to_string())),
                            },
                        };
                        addr.do_send(DecodeFinished(outcome));
                    });
                }
                Effect::Playback(command) => {
                    if let Some(playback) = &self.playback {
                        if !playback.send(command) {
                            warn!(call_id = %self.session.call_id(), "Playback scheduler is gone");
                        }
                    }
                }
                Effect::Client(event) => self.send_event(&event, ctx),
                Effect::ArmStatusWatchdog(after) => {
                    if let Some(handle) = self.status_watchdog.take() {
                        ctx.cancel_future(handle);
                    }
                    self.status_watchdog = Some(ctx.run_later(after, |act, ctx| {
                        act.status_watchdog = None;
                        let effects = act.session.status_timeout();
                        act.apply(effects, ctx);
                    }));
                }
                Effect::DisarmStatusWatchdog => {
                    if let Some(handle) = self.status_watchdog.take() {
                        ctx.cancel_future(handle);
                    }
                }
                Effect::ScheduleTranscriptDeadline { token, after } => {
                    ctx.run_later(after, move |act, ctx| {
                        let effects = act.session.transcript_deadline(token);
                        act.apply(effects, ctx);
                    });
                }
                Effect::Teardown => {
                    self.release();
                    let description = match self.session.phase() {
                        CallPhase::Failed(reason) => reason.clone(),
                        phase => phase.to_string(),
                    };
                    ctx.close(Some(ws::CloseReason {
                        code: ws::CloseCode::Normal,
                        description: Some(description),
                    }));
                    ctx.stop();
                }
            }
        }
    }

    fn send_event(&self, event: &ClientEvent, ctx: &mut ws::WebsocketContext<Self>) {
        match serde_json::to_string(event) {
            Ok(json) => ctx.text(json),
            Err(e) => error!(error = %e, "Failed to serialize client event"),
        }
    }

    fn send_error(&self, ctx: &mut ws::WebsocketContext<Self>, code: &str, message: &str) {
        self.send_event(
            &ClientEvent::Error {
                code: code.to_string(),
                message: message.to_string(),
            },
            ctx,
        );
        warn!(monitor_id = %self.monitor_id, "WebSocket error {}: {}", code, message);
    }

    fn handle_command(&mut self, command: ClientCommand, ctx: &mut ws::WebsocketContext<Self>) {
        match command {
            ClientCommand::AudioUnlocked => {
                self.device_ready.send_replace(true);
                let effects = self.session.device_ready();
                self.apply(effects, ctx);
            }
            ClientCommand::Mute { party, muted } => {
                let effects = self.session.set_muted(party, muted);
                self.apply(effects, ctx);
            }
            ClientCommand::EndCall => {
                let effects = self.session.end_call();
                self.apply(effects, ctx);
            }
            ClientCommand::Pong { .. } => {
                self.last_heartbeat = Instant::now();
            }
        }
    }

    /// Close the upstream link, stop playback and fold counters into service metrics.
    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        if let Some(link) = self.upstream.take() {
            link.close();
        }
        if let Some(playback) = self.playback.take() {
            playback.shutdown();
        }

        let failed = matches!(self.session.phase(), CallPhase::Failed(_));
        self.state.finish_call(self.session.stats(), failed);
        info!(
            call_id = %self.session.call_id(),
            monitor_id = %self.monitor_id,
            phase = %self.session.phase(),
            stats = ?self.session.stats(),
            "Call monitor released"
        );
    }
}

impl Actor for CallMonitorSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        let call_id = self.session.call_id().to_string();
        info!(%call_id, monitor_id = %self.monitor_id, "Call monitor connected");

        let (frame_tx, frame_rx) = mpsc::unbounded_channel::<RenderedFrame>();
        let (report_tx, report_rx) = mpsc::unbounded_channel::<PlaybackReport>();
        let (handle, _task) = PlaybackScheduler::spawn(self.device_ready.subscribe(), frame_tx, report_tx);
        self.playback = Some(handle);
        ctx.add_stream(UnboundedReceiverStream::new(frame_rx));
        ctx.add_stream(UnboundedReceiverStream::new(report_rx));

        let (upstream_tx, upstream_rx) = mpsc::unbounded_channel::<UpstreamMessage>();
        ctx.add_stream(UnboundedReceiverStream::new(upstream_rx));
        let url = upstream::stream_url(&self.config.upstream.stream_url, &call_id);
        let addr = ctx.address();
        tokio::spawn(async move {
            let result = upstream::connect(&url, upstream_tx).await;
            addr.do_send(UpstreamConnected(result));
        });

        let effects = self.session.start();
        self.apply(effects, ctx);

        for (party, muted) in [
            (Party::Caller, self.config.playback.mute_caller_on_start),
            (Party::Agent, self.config.playback.mute_agent_on_start),
        ] {
            if muted {
                let effects = self.session.set_muted(party, true);
                self.apply(effects, ctx);
            }
        }

        let keepalive = Duration::from_secs(self.config.upstream.keepalive_interval_secs);
        ctx.run_interval(keepalive, |act, _ctx| {
            if let Some(link) = &act.upstream {
                link.send_ping();
            }
        });

        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!(monitor_id = %act.monitor_id, "WebSocket heartbeat timeout, closing connection");
                ctx.stop();
            } else {
                let ping = ClientEvent::Ping {
                    timestamp: chrono::Utc::now().timestamp_millis().max(0) as u64,
                };
                act.send_event(&ping, ctx);
            }
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        info!(call_id = %self.session.call_id(), monitor_id = %self.monitor_id, "Call monitor disconnected");
        self.release();
    }
}

/// Handle incoming WebSocket messages from the monitoring client.
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for CallMonitorSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => match serde_json::from_str::<ClientCommand>(&text) {
                Ok(command) => self.handle_command(command, ctx),
                Err(err) => self.send_error(ctx, "invalid_json", &format!("Invalid JSON: {}", err)),
            },
            Ok(ws::Message::Binary(_)) => {
                self.send_error(ctx, "unexpected_binary", "Binary messages are not accepted");
            }
            Ok(ws::Message::Ping(data)) => {
                ctx.pong(&data);
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!(monitor_id = %self.monitor_id, "WebSocket closed: {:?}", reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!("Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!("WebSocket protocol error: {}", err);
                ctx.stop();
            }
        }
    }
}

/// Frames and close notices from the upstream call stream.
impl StreamHandler<UpstreamMessage> for CallMonitorSocket {
    fn handle(&mut self, msg: UpstreamMessage, ctx: &mut Self::Context) {
        let effects = match msg {
            UpstreamMessage::Frame(text) => self.session.handle_text(&text),
            UpstreamMessage::Closed(reason) => self.session.transport_closed(&reason),
        };
        self.apply(effects, ctx);
    }

    fn finished(&mut self, _ctx: &mut Self::Context) {
        debug!(monitor_id = %self.monitor_id, "Upstream channel closed");
    }
}

/// Audio leaving the scheduler: forward to the client as binary frames.
impl StreamHandler<RenderedFrame> for CallMonitorSocket {
    fn handle(&mut self, frame: RenderedFrame, ctx: &mut Self::Context) {
        ctx.binary(encode_audio_frame(frame.turn_id, &frame.chunk));
    }

    fn finished(&mut self, _ctx: &mut Self::Context) {}
}

impl StreamHandler<PlaybackReport> for CallMonitorSocket {
    fn handle(&mut self, report: PlaybackReport, ctx: &mut Self::Context) {
        let effects = self.session.playback_report(report);
        self.apply(effects, ctx);
    }

    fn finished(&mut self, _ctx: &mut Self::Context) {}
}

impl Handler<UpstreamConnected> for CallMonitorSocket {
    type Result = ();

    fn handle(&mut self, msg: UpstreamConnected, ctx: &mut Self::Context) {
        match msg.0 {
            Ok(link) => {
                if self.released {
                    link.close();
                } else {
                    self.upstream = Some(link);
                }
            }
            Err(e) => {
                let effects = self.session.transport_closed(&e.to_string());
                self.apply(effects, ctx);
            }
        }
    }
}

impl Handler<DecodeFinished> for CallMonitorSocket {
    type Result = ();

    fn handle(&mut self, msg: DecodeFinished, ctx: &mut Self::Context) {
        let effects = self.session.decode_finished(msg.0);
        self.apply(effects, ctx);
    }
}

/// WebSocket endpoint handler.
///
/// ## HTTP to WebSocket Upgrade:
/// Claims a call slot, then upgrades the connection. The slot is released
/// when the actor stops (or right away if the upgrade fails).
pub async fn call_monitor_websocket(
    req: HttpRequest,
    stream: web::Payload,
    path: web::Path<String>,
    query: web::Query<MonitorQuery>,
    app_state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    let call_id = path.into_inner();
    if call_id.trim().is_empty() {
        return Err(AppError::BadRequest("call id is required".to_string()).into());
    }
    info!(%call_id, peer = ?req.connection_info().peer_addr(), "New call monitor connection request");

    let limit = app_state.get_config().server.max_concurrent_calls;
    if !app_state.try_begin_call(limit) {
        warn!(%call_id, limit, "Refusing call monitor, call limit reached");
        return Err(AppError::CallLimitReached(limit).into());
    }

    let state = app_state.get_ref().clone();
    let socket = CallMonitorSocket::new(call_id, query.into_inner().display_name, state);

    ws::start(socket, &req, stream).map_err(|e| {
        // The actor never started, so nothing else will release the slot.
        app_state.finish_call(&Default::default(), false);
        e
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{test as actix_test, App};

    #[test]
    fn test_monitor_query_parsing() {
        let query = web::Query::<MonitorQuery>::from_query("display_name=Dana%20R").unwrap();
        assert_eq!(query.display_name.as_deref(), Some("Dana R"));
        let query = web::Query::<MonitorQuery>::from_query("").unwrap();
        assert!(query.display_name.is_none());
    }

    #[actix_web::test]
    async fn test_call_limit_refuses_connection() {
        let mut config = AppConfig::default();
        config.server.max_concurrent_calls = 1;
        let state = web::Data::new(AppState::new(config));
        state.try_begin_call(1);

        let app = actix_test::init_service(
            App::new()
                .app_data(state.clone())
                .route("/ws/calls/{call_id}", web::get().to(call_monitor_websocket)),
        )
        .await;
        let req = actix_test::TestRequest::get().uri("/ws/calls/abc").to_request();
        let resp = actix_test::call_service(&app, req).await;
        assert_eq!(resp.status(), actix_web::http::StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(state.get_metrics_snapshot().rejected_calls, 1);
    }

    #[actix_web::test]
    async fn test_failed_upgrade_releases_slot() {
        let state = web::Data::new(AppState::new(AppConfig::default()));
        let app = actix_test::init_service(
            App::new()
                .app_data(state.clone())
                .route("/ws/calls/{call_id}", web::get().to(call_monitor_websocket)),
        )
        .await;
        // No upgrade headers: the handshake is rejected.
        let req = actix_test::TestRequest::get().uri("/ws/calls/abc").to_request();
        let resp = actix_test::call_service(&app, req).await;
        assert!(resp.status().is_client_error());
        assert_eq!(state.get_metrics_snapshot().active_calls, 0);
    }
}
