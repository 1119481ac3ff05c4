//! The session state machine.
//!
//! One controller owns the single-operator lease and fans inbound messages
//! out to authentication, monitors, input, and WebRTC. Inbound traffic
//! arrives from two receivers (signaling events, WebRTC events); outbound
//! control replies prefer the WebRTC control channel and fall back to
//! signaling. Frames take a three-tier path chosen per frame: VP8 RTP over
//! the video track, PNG envelope over the frames channel, base64 JSON over
//! whichever text transport is up.
//!
//! Lease rules: at most one lease exists; only a signaling drop (or
//! shutdown) releases it. WebRTC failure alone triggers a debounced re-offer
//! that preserves the lease.

use crate::capture::CapturePipeline;
use crate::config::ConfigStore;
use crate::encoder::Vp8RtpAdapter;
use crate::input::InputInjector;
use crate::lockout::LockoutEngine;
use crate::monitors::MonitorRegistry;
use crate::password;
use crate::rtc::{ConnState, RtcEvent, WebRtcCore};
use crate::signaling::{SignalingClient, SignalingEvent};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use p2prd_protocol::{AuthStatus, FrameHeader, Password, WireMessage};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const REOFFER_DEBOUNCE: Duration = Duration::from_secs(5);

/// The unique right to act as the current operator.
#[derive(Debug, Clone)]
pub struct Lease {
    pub session_id: Uuid,
    pub authenticated: bool,
    pub monitor_id: String,
}

/// Debounce for ICE-recovery offers: at most one per five-second window no
/// matter how often the connection state flaps.
pub struct ReofferGate {
    last: Option<Instant>,
    min_gap: Duration,
}

impl ReofferGate {
    pub fn new(min_gap: Duration) -> Self {
        Self {
            last: None,
            min_gap,
        }
    }

    pub fn try_fire(&mut self, now: Instant) -> bool {
        let allowed = self
            .last
            .is_none_or(|last| now.duration_since(last) >= self.min_gap);
        if allowed {
            self.last = Some(now);
        }
        allowed
    }
}

/// Outbound path onto the signaling socket. A trait seam so tests observe
/// replies without a live WebSocket.
pub trait ControlSink: Send + Sync {
    fn send_signaling(&self, msg: &WireMessage) -> bool;
}

impl ControlSink for SignalingClient {
    fn send_signaling(&self, msg: &WireMessage) -> bool {
        self.send(msg)
    }
}

pub struct SessionController {
    store: Arc<ConfigStore>,
    lockout: LockoutEngine,
    monitors: Arc<Mutex<MonitorRegistry>>,
    injector: Arc<InputInjector>,
    capture: Arc<Mutex<CapturePipeline>>,
    adapter: Arc<Mutex<Vp8RtpAdapter>>,
    rtc: Arc<WebRtcCore>,
    signaling: Arc<dyn ControlSink>,
    lease: Arc<tokio::sync::Mutex<Option<Lease>>>,
    reoffer: Mutex<ReofferGate>,
    frame_task: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
    reconnect: Arc<Notify>,
}

impl SessionController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<ConfigStore>,
        monitors: Arc<Mutex<MonitorRegistry>>,
        injector: Arc<InputInjector>,
        capture: Arc<Mutex<CapturePipeline>>,
        adapter: Arc<Mutex<Vp8RtpAdapter>>,
        rtc: Arc<WebRtcCore>,
        signaling: Arc<dyn ControlSink>,
        reconnect: Arc<Notify>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            lockout: LockoutEngine::new(Arc::clone(&store)),
            store,
            monitors,
            injector,
            capture,
            adapter,
            rtc,
            signaling,
            lease: Arc::new(tokio::sync::Mutex::new(None)),
            reoffer: Mutex::new(ReofferGate::new(REOFFER_DEBOUNCE)),
            frame_task: Mutex::new(None),
            cancel,
            reconnect,
        }
    }

    /// Main loop: consume both inbound channels until shutdown.
    pub async fn run(
        self: Arc<Self>,
        mut signaling_events: mpsc::Receiver<SignalingEvent>,
        mut rtc_events: mpsc::Receiver<RtcEvent>,
    ) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.teardown().await;
                    return;
                }
                ev = signaling_events.recv() => match ev {
                    Some(SignalingEvent::Message(text)) => self.on_signaling_message(&text).await,
                    Some(SignalingEvent::Disconnected) => self.on_signaling_drop().await,
                    None => {
                        self.teardown().await;
                        return;
                    }
                },
                ev = rtc_events.recv() => {
                    if let Some(ev) = ev {
                        self.on_rtc_event(ev).await;
                    }
                }
            }
        }
    }

    pub async fn on_signaling_message(&self, text: &str) {
        match serde_json::from_str::<WireMessage>(text) {
            Ok(msg) => self.handle_message(msg).await,
            Err(e) => warn!("Unparseable signaling message: {e}"),
        }
    }

    pub async fn on_rtc_event(&self, event: RtcEvent) {
        match event {
            RtcEvent::OfferReady { sdp } => {
                self.send_control(&WireMessage::SdpOffer {
                    sdp,
                    sdp_type: "offer".to_string(),
                })
                .await;
            }
            RtcEvent::LocalCandidate {
                candidate,
                sdp_mid,
                sdp_mline_index,
            } => {
                self.send_control(&WireMessage::IceCandidate {
                    candidate,
                    sdp_mid,
                    sdp_mline_index,
                })
                .await;
            }
            RtcEvent::IceState(state) => {
                self.send_control(&WireMessage::IceState {
                    state: state.as_str().to_string(),
                })
                .await;
                self.maybe_reoffer(state).await;
            }
            RtcEvent::ChannelOpen(kind) => {
                info!(?kind, "Data channel open");
            }
            RtcEvent::ChannelClosed(kind) => {
                // Control replies fall back to signaling automatically.
                debug!(?kind, "Data channel closed");
            }
            RtcEvent::ControlMessage(text) => {
                match serde_json::from_str::<WireMessage>(&text) {
                    Ok(msg) => self.handle_message(msg).await,
                    Err(e) => warn!("Unparseable control-channel message: {e}"),
                }
            }
        }
    }

    async fn handle_message(&self, msg: WireMessage) {
        match msg {
            WireMessage::OperatorHello { session_id } => self.on_operator_hello(session_id).await,
            WireMessage::Auth { password } => self.on_auth(password).await,
            WireMessage::MonitorListRequest { .. } => {
                if !self.is_authenticated().await {
                    debug!("monitor_list_request before authentication, dropped");
                    return;
                }
                let (monitors, active) = {
                    let mut registry = self.monitors.lock().unwrap_or_else(|e| e.into_inner());
                    registry.refresh();
                    (registry.list().to_vec(), registry.active_id().to_string())
                };
                self.send_control(&WireMessage::MonitorList {
                    monitors,
                    active_monitor_id: active,
                })
                .await;
            }
            WireMessage::MonitorSwitch { id } => {
                if !self.is_authenticated().await {
                    debug!("monitor_switch before authentication, dropped");
                    return;
                }
                let active = {
                    let mut registry = self.monitors.lock().unwrap_or_else(|e| e.into_inner());
                    registry.switch(&id).to_string()
                };
                if let Some(lease) = self.lease.lock().await.as_mut() {
                    lease.monitor_id = active.clone();
                }
                info!(monitor = %active, "Active monitor switched");
                self.send_control(&WireMessage::MonitorSwitchResult {
                    active_monitor_id: active,
                })
                .await;
            }
            WireMessage::Input {
                mouse,
                keyboard,
                special,
            } => {
                if !self.is_authenticated().await {
                    warn!("Input before authentication, dropped");
                    return;
                }
                let monitor = {
                    let registry = self.monitors.lock().unwrap_or_else(|e| e.into_inner());
                    registry.active().clone()
                };
                let injector = Arc::clone(&self.injector);
                // Injection is blocking FFI behind a desktop switch; keep it
                // off the event loop.
                let _ = tokio::task::spawn_blocking(move || {
                    injector.handle(mouse.as_ref(), keyboard.as_ref(), special, &monitor);
                })
                .await;
            }
            WireMessage::SdpAnswer { sdp, .. } => {
                if let Err(e) = self.rtc.accept_answer(&sdp).await {
                    warn!("Failed to apply SDP answer: {e:#}");
                }
            }
            WireMessage::IceCandidate {
                candidate,
                sdp_mid,
                sdp_mline_index,
            } => {
                if let Err(e) = self
                    .rtc
                    .add_remote_candidate(&candidate, sdp_mid, sdp_mline_index)
                    .await
                {
                    warn!("Failed to add remote candidate: {e:#}");
                }
            }
            other => {
                debug!(?other, "Unexpected message from operator, ignored");
            }
        }
    }

    async fn on_operator_hello(&self, session_id: Uuid) {
        #[derive(Clone, Copy)]
        enum Outcome {
            Busy,
            Repeat,
            Acquired,
        }

        let active = {
            let registry = self.monitors.lock().unwrap_or_else(|e| e.into_inner());
            registry.active_id().to_string()
        };

        // Non-blocking acquisition: a hello racing another hello loses.
        let outcome = match self.lease.try_lock() {
            Err(_) => Outcome::Busy,
            Ok(mut slot) => {
                let outcome = match &*slot {
                    Some(lease) if lease.session_id != session_id => Outcome::Busy,
                    Some(_) => Outcome::Repeat,
                    None => Outcome::Acquired,
                };
                if let Outcome::Acquired = outcome {
                    *slot = Some(Lease {
                        session_id,
                        authenticated: false,
                        monitor_id: active,
                    });
                }
                outcome
            }
        };

        match outcome {
            Outcome::Busy => {
                info!(%session_id, "Rejecting hello, lease held by another session");
                // host_busy goes over signaling: the control channel belongs
                // to the current operator, not the rejected one.
                self.signaling
                    .send_signaling(&WireMessage::host_busy_active_session());
                return;
            }
            Outcome::Repeat => debug!(%session_id, "Repeated hello for current lease"),
            Outcome::Acquired => info!(%session_id, "Lease acquired"),
        }

        let config = self.store.snapshot();
        let (monitors, active) = {
            let registry = self.monitors.lock().unwrap_or_else(|e| e.into_inner());
            (registry.list().to_vec(), registry.active_id().to_string())
        };
        self.signaling.send_signaling(&WireMessage::HostHello {
            host_id: config.host_id.clone(),
            monitors: monitors.clone(),
            active_monitor_id: active.clone(),
        });
        self.signaling.send_signaling(&WireMessage::MonitorList {
            monitors,
            active_monitor_id: active,
        });

        if let Err(e) = self
            .rtc
            .start_offer(&config.stun, Some(&config.turn))
            .await
        {
            warn!("WebRTC offer failed, staying on signaling transport: {e:#}");
        }
    }

    async fn on_auth(&self, Password(password): Password) {
        if self.lease.lock().await.is_none() {
            debug!("auth without a session, dropped");
            return;
        }

        if let Some(retry_after_ms) = self.lockout.is_locked() {
            self.send_control(&WireMessage::AuthResult {
                status: AuthStatus::Locked,
                retry_after_ms: Some(retry_after_ms),
            })
            .await;
            return;
        }

        let stored = self.store.snapshot().password_hash;
        let verified = if stored.is_empty() {
            warn!("Auth attempt but no password is configured");
            false
        } else {
            // KDF verification is deliberately slow; keep it off the loop.
            tokio::task::spawn_blocking(move || password::verify_password(&password, &stored))
                .await
                .ok()
                .and_then(|r| {
                    r.map_err(|e| warn!("Stored password hash unusable: {e}"))
                        .ok()
                })
                .unwrap_or(false)
        };

        if verified {
            self.lockout.register_success();
            if let Some(lease) = self.lease.lock().await.as_mut() {
                lease.authenticated = true;
            }
            info!("Operator authenticated");
            self.send_control(&WireMessage::AuthResult {
                status: AuthStatus::Ok,
                retry_after_ms: None,
            })
            .await;
            self.start_frame_loop();
        } else {
            let retry_after_ms = self.lockout.register_failure();
            self.send_control(&WireMessage::AuthResult {
                status: AuthStatus::Invalid,
                retry_after_ms,
            })
            .await;
        }
    }

    /// Signaling socket loss: the lease dies, WebRTC resets, reconnect arms.
    /// Host identity and config are untouched.
    pub async fn on_signaling_drop(&self) {
        info!("Signaling dropped, releasing session");
        self.stop_frame_loop();
        *self.lease.lock().await = None;
        self.rtc.reset().await;
        self.reset_encoder();
        self.reconnect.notify_one();
    }

    /// Drop encoder state so the next frame starts with a keyframe, which a
    /// freshly negotiated peer needs before it can decode anything.
    fn reset_encoder(&self) {
        self.adapter
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .reset();
    }

    async fn maybe_reoffer(&self, state: ConnState) {
        if !state.needs_reoffer() {
            return;
        }
        if self.lease.lock().await.is_none() {
            return;
        }
        let fire = {
            let mut gate = self.reoffer.lock().unwrap_or_else(|e| e.into_inner());
            gate.try_fire(Instant::now())
        };
        if !fire {
            debug!(state = state.as_str(), "Re-offer suppressed by debounce");
            return;
        }
        info!(state = state.as_str(), "ICE degraded, starting recovery offer");
        self.reset_encoder();
        let config = self.store.snapshot();
        if let Err(e) = self
            .rtc
            .start_offer(&config.stun, Some(&config.turn))
            .await
        {
            warn!("Recovery offer failed: {e:#}");
        }
    }

    async fn is_authenticated(&self) -> bool {
        self.lease
            .lock()
            .await
            .as_ref()
            .is_some_and(|l| l.authenticated)
    }

    /// Prefer the control channel, fall back to the signaling socket.
    async fn send_control(&self, msg: &WireMessage) {
        if let Ok(json) = serde_json::to_string(msg)
            && self.rtc.try_send_control(&json).await
        {
            return;
        }
        if !self.signaling.send_signaling(msg) {
            debug!("No transport for outbound message, dropped");
        }
    }

    fn start_frame_loop(&self) {
        self.stop_frame_loop();
        let lease = Arc::clone(&self.lease);
        let capture = Arc::clone(&self.capture);
        let adapter = Arc::clone(&self.adapter);
        let rtc = Arc::clone(&self.rtc);
        let signaling = Arc::clone(&self.signaling);
        let cancel = self.cancel.child_token();
        let handle = tokio::spawn(frame_loop(lease, capture, adapter, rtc, signaling, cancel));
        *self
            .frame_task
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }

    fn stop_frame_loop(&self) {
        if let Some(handle) = self
            .frame_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            handle.abort();
        }
    }

    async fn teardown(&self) {
        self.stop_frame_loop();
        *self.lease.lock().await = None;
        self.rtc.reset().await;
        info!("Session controller stopped");
    }
}

/// Capture → encode → send at the target frame rate, while the lease stays
/// authenticated. Transport tiering is evaluated per frame.
async fn frame_loop(
    lease: Arc<tokio::sync::Mutex<Option<Lease>>>,
    capture: Arc<Mutex<CapturePipeline>>,
    adapter: Arc<Mutex<Vp8RtpAdapter>>,
    rtc: Arc<WebRtcCore>,
    signaling: Arc<dyn ControlSink>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(Duration::from_millis(
        1000 / crate::encoder::TARGET_FPS as u64,
    ));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    info!("Frame loop started");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let monitor_id = match lease.lock().await.as_ref() {
            Some(lease) if lease.authenticated => lease.monitor_id.clone(),
            _ => break,
        };

        let capture_for_tick = Arc::clone(&capture);
        let adapter_for_tick = Arc::clone(&adapter);
        let Ok((frame, packets)) = tokio::task::spawn_blocking(move || {
            let frame = capture_for_tick
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .capture(&monitor_id);
            let packets = adapter_for_tick
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .packets_for(&frame)
                .ok();
            (frame, packets)
        })
        .await
        else {
            continue;
        };

        // Tier 1: VP8 RTP over the negotiated video track.
        if let Some(packets) = packets
            && rtc.try_send_video(&packets).await
        {
            continue;
        }

        // Tier 2 and 3 need the still image.
        let (width, height) = (frame.width, frame.height);
        let Ok(Ok(png)) = tokio::task::spawn_blocking(move || frame.encode_png()).await else {
            continue;
        };

        if rtc.try_send_frame(&FrameHeader::png(width, height), &png).await {
            continue;
        }

        let msg = WireMessage::Frame {
            width,
            height,
            format: "image/png".to_string(),
            data: BASE64.encode(&png),
        };
        if let Ok(json) = serde_json::to_string(&msg)
            && rtc.try_send_control(&json).await
        {
            continue;
        }
        let _ = signaling.send_signaling(&msg);
    }
    info!("Frame loop stopped");
}
