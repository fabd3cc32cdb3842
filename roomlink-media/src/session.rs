//! Media session actor
//!
//! One `MediaSession` per WebRTC transport. All shared mutable state —
//! the consumer registry, the learned route table, the stream-index map
//! and the transport session — is owned by a single actor task; every
//! mutation arrives as a message on its command channel, so route updates
//! are atomic with respect to the hot dispatch path without any external
//! locking. Decoded frames leave through a bounded channel so a slow
//! renderer can never back up packet intake.

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::codec_io::{DecoderFactory, FrameDecoder, MediaFrame};
use crate::config::MediaConfig;
use crate::consumer::{ConsumerEntry, ConsumerRegistry};
use crate::depacketizer::Depacketizer;
use crate::error::MediaError;
use crate::keyframe::{FailureStreak, KeyframeThrottle, ThrottleKey};
use crate::router::{PacketRouter, RouteOutcome};
use crate::rtp::{self, RtpPacket};
use crate::sdp::{self, DtlsParameters, IceCandidate, IceParameters};
use crate::signaling::{NewConsumer, RtpParameters, SignalingClient};
use crate::transport::{
    EngineConnectionState, TransportSession, TransportState, WebRtcEngine,
};
use crate::types::{ConsumerId, MediaKind, ProducerId, TransportId};

/// Events surfaced to the embedding shell.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// One negotiation pass finished; the caller may run its handshake
    /// finalize step with the signaling server.
    NegotiationCompleted {
        consumers: usize,
        tracks_added: usize,
    },
    TransportStateChanged(TransportState),
    /// A wire SSRC was bound to a consumer (any resolution tier).
    ConsumerBound { consumer_id: ConsumerId, ssrc: u32 },
    /// RTCP feedback on an outbound stream asked for a keyframe; the local
    /// encoder should force one.
    EncoderKeyframeRequested,
    /// An upstream keyframe request went out for this consumer.
    KeyframeRequested { consumer_id: ConsumerId },
}

/// Point-in-time view of the actor state, mainly for diagnostics.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub transport_state: TransportState,
    /// Consumer ids in registration order.
    pub consumers: Vec<ConsumerId>,
    pub stream_index_map: HashMap<u32, ConsumerId>,
    pub recv_video_tracks: u32,
    pub recv_audio_tracks: u32,
    pub send_video_tracks: u32,
    pub send_audio_tracks: u32,
}

/// Session-wide counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionStats {
    pub packets_received: u64,
    pub packets_routed: u64,
    pub routing_misses: u64,
    pub probe_drops: u64,
    pub rtx_drops: u64,
    pub rtcp_received: u64,
    pub parse_errors: u64,
    pub malformed_fragments: u64,
    pub frames_completed: u64,
    pub frames_decoded: u64,
    pub frames_dropped: u64,
    pub decode_failures: u64,
    pub keyframe_requests: u64,
    pub keyframe_requests_suppressed: u64,
    pub negotiation_passes: u64,
    pub negotiation_failures: u64,
    pub intake_drops: u64,
}

/// Per-consumer counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConsumerStats {
    pub packets: u64,
    pub bytes: u64,
    pub frames_completed: u64,
    pub frames_decoded: u64,
    pub decode_failures: u64,
    pub keyframes: u64,
}

#[derive(Default)]
struct SharedStats {
    packets_received: AtomicU64,
    packets_routed: AtomicU64,
    routing_misses: AtomicU64,
    probe_drops: AtomicU64,
    rtx_drops: AtomicU64,
    rtcp_received: AtomicU64,
    parse_errors: AtomicU64,
    malformed_fragments: AtomicU64,
    frames_completed: AtomicU64,
    frames_decoded: AtomicU64,
    frames_dropped: AtomicU64,
    decode_failures: AtomicU64,
    keyframe_requests: AtomicU64,
    keyframe_requests_suppressed: AtomicU64,
    negotiation_passes: AtomicU64,
    negotiation_failures: AtomicU64,
    intake_drops: AtomicU64,
    consumers: DashMap<ConsumerId, ConsumerStats>,
}

impl SharedStats {
    fn snapshot(&self) -> SessionStats {
        SessionStats {
            packets_received: self.packets_received.load(Ordering::Relaxed),
            packets_routed: self.packets_routed.load(Ordering::Relaxed),
            routing_misses: self.routing_misses.load(Ordering::Relaxed),
            probe_drops: self.probe_drops.load(Ordering::Relaxed),
            rtx_drops: self.rtx_drops.load(Ordering::Relaxed),
            rtcp_received: self.rtcp_received.load(Ordering::Relaxed),
            parse_errors: self.parse_errors.load(Ordering::Relaxed),
            malformed_fragments: self.malformed_fragments.load(Ordering::Relaxed),
            frames_completed: self.frames_completed.load(Ordering::Relaxed),
            frames_decoded: self.frames_decoded.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            keyframe_requests: self.keyframe_requests.load(Ordering::Relaxed),
            keyframe_requests_suppressed: self
                .keyframe_requests_suppressed
                .load(Ordering::Relaxed),
            negotiation_passes: self.negotiation_passes.load(Ordering::Relaxed),
            negotiation_failures: self.negotiation_failures.load(Ordering::Relaxed),
            intake_drops: self.intake_drops.load(Ordering::Relaxed),
        }
    }
}

enum Command {
    Initialize {
        ice: IceParameters,
        candidates: Vec<IceCandidate>,
        dtls: DtlsParameters,
        reply: oneshot::Sender<Result<(), MediaError>>,
    },
    Connect {
        reply: oneshot::Sender<Result<(), MediaError>>,
    },
    RegisterConsumer {
        announcement: Box<NewConsumer>,
        reply: oneshot::Sender<Result<(), MediaError>>,
    },
    RemoveConsumer {
        consumer_id: ConsumerId,
        reply: oneshot::Sender<Result<(), MediaError>>,
    },
    Produce {
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        source: String,
        reply: oneshot::Sender<Result<ProducerId, MediaError>>,
    },
    MediaPacket {
        kind: MediaKind,
        data: Bytes,
        stream_index: Option<u32>,
    },
    ConnectionState(EngineConnectionState),
    NegotiationFinished(NegotiationOutcome),
    Snapshot {
        reply: oneshot::Sender<SessionSnapshot>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

struct NegotiationOutcome {
    /// `(stream index, consumer, kind)` for every track appended this pass.
    /// Populated even when a later step failed: the engine owns those
    /// tracks either way, and media-line index i must keep meaning engine
    /// track i across the retry.
    mappings: Vec<(u32, ConsumerId, MediaKind)>,
    did_start: bool,
    error: Option<MediaError>,
}

/// Handle to a running media session. Cheap to share; all methods are safe
/// to call from any task.
pub struct MediaSession {
    cmd_tx: mpsc::Sender<Command>,
    engine: Arc<dyn WebRtcEngine>,
    connected: Arc<AtomicBool>,
    stats: Arc<SharedStats>,
    frames_rx: Mutex<Option<mpsc::Receiver<MediaFrame>>>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<SessionEvent>>>,
    cancel: CancellationToken,
}

impl MediaSession {
    /// Spawn the session actor. The engine, signaling client and decoder
    /// factory are created by the caller once at startup and injected here.
    pub fn new(
        transport_id: TransportId,
        config: MediaConfig,
        engine: Arc<dyn WebRtcEngine>,
        signaling: Arc<dyn SignalingClient>,
        decoders: Arc<dyn DecoderFactory>,
    ) -> Arc<Self> {
        let (cmd_tx, cmd_rx) = mpsc::channel(config.packet_channel_capacity);
        let (frames_tx, frames_rx) = mpsc::channel(config.frame_channel_capacity);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let connected = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(SharedStats::default());
        let cancel = CancellationToken::new();

        let actor = SessionActor {
            transport_id,
            throttle: KeyframeThrottle::new(config.keyframe_request_min_interval()),
            config,
            engine: Arc::clone(&engine),
            signaling,
            decoders,
            registry: ConsumerRegistry::new(),
            router: PacketRouter::new(),
            transport: TransportSession::new(),
            pipelines: HashMap::new(),
            produced_ssrcs: HashMap::new(),
            negotiate_at: None,
            negotiating: false,
            renegotiate: false,
            started: false,
            cname: format!("roomlink-{}", uuid::Uuid::new_v4().simple()),
            sdp_session_id: sdp::random_session_id(),
            sdp_version: 0,
            cmd_tx: cmd_tx.clone(),
            cmd_rx,
            frames_tx,
            events_tx,
            connected: Arc::clone(&connected),
            stats: Arc::clone(&stats),
            cancel: cancel.clone(),
        };
        tokio::spawn(actor.run());

        Arc::new(Self {
            cmd_tx,
            engine,
            connected,
            stats,
            frames_rx: Mutex::new(Some(frames_rx)),
            events_rx: Mutex::new(Some(events_rx)),
            cancel,
        })
    }

    /// Store the server transport's ICE/DTLS parameters. Safe against
    /// double invocation: the second call is a warning-level no-op.
    pub async fn initialize(
        &self,
        ice: IceParameters,
        candidates: Vec<IceCandidate>,
        dtls: DtlsParameters,
    ) -> Result<(), MediaError> {
        self.request(|reply| Command::Initialize {
            ice,
            candidates,
            dtls,
            reply,
        })
        .await?
    }

    /// Compute local DTLS parameters and hand them to the signaling server.
    /// Returns once the request is sent; connection completion is observed
    /// through [`SessionEvent::TransportStateChanged`].
    pub async fn connect(&self) -> Result<(), MediaError> {
        self.request(|reply| Command::Connect { reply }).await?
    }

    /// Register a remote stream announced via `newConsumer`. Each call
    /// resets the negotiation debounce window; one pass serves every
    /// consumer registered inside it.
    pub async fn register_consumer(&self, announcement: NewConsumer) -> Result<(), MediaError> {
        self.request(|reply| Command::RegisterConsumer {
            announcement: Box::new(announcement),
            reply,
        })
        .await?
    }

    /// Tear down a consumer: its routes, stream-index mapping and
    /// depacketizer/decoder state go as one atomic step.
    pub async fn remove_consumer(&self, consumer_id: &ConsumerId) -> Result<(), MediaError> {
        self.request(|reply| Command::RemoveConsumer {
            consumer_id: consumer_id.clone(),
            reply,
        })
        .await?
    }

    /// Register an outbound stream with the signaling server.
    pub async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        source: impl Into<String>,
    ) -> Result<ProducerId, MediaError> {
        self.request(|reply| Command::Produce {
            kind,
            rtp_parameters,
            source: source.into(),
            reply,
        })
        .await?
    }

    /// Entry point for the engine's receive callback. Never blocks: when
    /// the actor's intake channel is full the packet is dropped and
    /// counted, matching the no-retransmission delivery model.
    pub fn handle_media_packet(&self, kind: MediaKind, data: Bytes, stream_index: Option<u32>) {
        if self
            .cmd_tx
            .try_send(Command::MediaPacket {
                kind,
                data,
                stream_index,
            })
            .is_err()
        {
            self.stats.intake_drops.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Entry point for engine connectivity transitions.
    pub fn handle_connection_state(&self, state: EngineConnectionState) {
        if self
            .cmd_tx
            .try_send(Command::ConnectionState(state))
            .is_err()
        {
            warn!(?state, "Dropped connection state update, session closing");
        }
    }

    /// Send one outbound media packet. Bypasses the actor: sending touches
    /// no registry state, only the connected latch.
    pub async fn send_media(&self, packet: Bytes) -> Result<(), MediaError> {
        if !self.connected.load(Ordering::Acquire) {
            return Err(MediaError::InvalidState(
                "transport not connected".into(),
            ));
        }
        self.engine
            .send_media(packet)
            .await
            .map_err(|e| MediaError::Transport(e.to_string()))
    }

    /// Take the bounded decoded-frame receiver (once).
    pub fn take_frame_receiver(&self) -> Option<mpsc::Receiver<MediaFrame>> {
        self.frames_rx.lock().take()
    }

    /// Take the session event receiver (once).
    pub fn take_event_receiver(&self) -> Option<mpsc::UnboundedReceiver<SessionEvent>> {
        self.events_rx.lock().take()
    }

    #[must_use]
    pub fn stats(&self) -> SessionStats {
        self.stats.snapshot()
    }

    #[must_use]
    pub fn consumer_stats(&self, consumer_id: &ConsumerId) -> Option<ConsumerStats> {
        self.stats.consumers.get(consumer_id).map(|s| s.clone())
    }

    /// Diagnostic view of the actor state.
    pub async fn snapshot(&self) -> Result<SessionSnapshot, MediaError> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    /// Close the session. Terminal: releases routes, registry and decoder
    /// state and shuts the actor down.
    pub async fn close(&self) {
        let (reply, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Close { reply }).await.is_ok() {
            let _ = rx.await;
        }
        self.cancel.cancel();
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, MediaError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(make(reply))
            .await
            .map_err(|_| MediaError::Closed)?;
        rx.await.map_err(|_| MediaError::Closed)
    }
}

/// Per-consumer dispatch pipeline owned by the actor.
struct ConsumerPipeline {
    kind: MediaKind,
    depacketizer: Option<Depacketizer>,
    decoder: Box<dyn FrameDecoder>,
    failures: FailureStreak,
}

enum Flow {
    Continue,
    Shutdown,
}

struct SessionActor {
    transport_id: TransportId,
    config: MediaConfig,
    engine: Arc<dyn WebRtcEngine>,
    signaling: Arc<dyn SignalingClient>,
    decoders: Arc<dyn DecoderFactory>,
    registry: ConsumerRegistry,
    router: PacketRouter,
    transport: TransportSession,
    pipelines: HashMap<ConsumerId, ConsumerPipeline>,
    /// SSRCs of our outbound streams, for RTCP feedback attribution.
    produced_ssrcs: HashMap<u32, MediaKind>,
    throttle: KeyframeThrottle,
    /// Pending debounce deadline. Registrations extend it; it never queues.
    negotiate_at: Option<Instant>,
    /// Single in-flight guard: at most one negotiation pass at a time.
    negotiating: bool,
    /// A trigger fired while a pass was in flight; run once more after.
    renegotiate: bool,
    /// Transport start latch; the engine is started exactly once.
    started: bool,
    cname: String,
    /// SDP origin id, fixed for the session lifetime; renegotiated offers
    /// keep it and bump only the version.
    sdp_session_id: u64,
    sdp_version: u64,
    cmd_tx: mpsc::Sender<Command>,
    cmd_rx: mpsc::Receiver<Command>,
    frames_tx: mpsc::Sender<MediaFrame>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    connected: Arc<AtomicBool>,
    stats: Arc<SharedStats>,
    cancel: CancellationToken,
}

impl SessionActor {
    async fn run(mut self) {
        let cancel = self.cancel.clone();
        loop {
            let deadline = self.negotiate_at;
            tokio::select! {
                () = cancel.cancelled() => break,
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => {
                        if let Flow::Shutdown = self.handle_command(cmd).await {
                            break;
                        }
                    }
                    None => break,
                },
                () = debounce_wait(deadline), if deadline.is_some() => {
                    self.start_negotiation_pass();
                }
            }
        }
        debug!(transport_id = %self.transport_id, "Session actor stopped");
    }

    async fn handle_command(&mut self, cmd: Command) -> Flow {
        match cmd {
            Command::Initialize {
                ice,
                candidates,
                dtls,
                reply,
            } => {
                self.transport.initialize(ice, candidates, dtls);
                if self.registry.has_unbacked() {
                    self.arm_debounce();
                }
                let _ = reply.send(Ok(()));
            }
            Command::Connect { reply } => {
                let _ = reply.send(self.connect().await);
            }
            Command::RegisterConsumer {
                announcement,
                reply,
            } => {
                let _ = reply.send(self.register_consumer(&announcement));
            }
            Command::RemoveConsumer { consumer_id, reply } => {
                self.remove_consumer(&consumer_id);
                let _ = reply.send(Ok(()));
            }
            Command::Produce {
                kind,
                rtp_parameters,
                source,
                reply,
            } => {
                let _ = reply.send(self.produce(kind, rtp_parameters, &source).await);
            }
            Command::MediaPacket {
                kind,
                data,
                stream_index,
            } => self.on_packet(kind, &data, stream_index),
            Command::ConnectionState(state) => self.on_connection_state(state),
            Command::NegotiationFinished(outcome) => self.on_negotiation_finished(outcome),
            Command::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            Command::Close { reply } => {
                self.close().await;
                let _ = reply.send(());
                return Flow::Shutdown;
            }
        }
        Flow::Continue
    }

    async fn connect(&mut self) -> Result<(), MediaError> {
        if !self.transport.is_initialized() {
            return Err(MediaError::InvalidState(
                "connect called before initialize".into(),
            ));
        }
        let dtls = self
            .engine
            .local_dtls_parameters()
            .await
            .map_err(|e| MediaError::Transport(format!("local DTLS parameters: {e}")))?;
        self.signaling
            .connect_transport(&self.transport_id, dtls)
            .await
            .map_err(|e| MediaError::Signaling(format!("connectWebRtcTransport: {e}")))?;
        if self.transport.state() == TransportState::New {
            self.transport.set_state(TransportState::Negotiating);
        }
        info!(transport_id = %self.transport_id, "Local DTLS parameters sent to signaling");
        Ok(())
    }

    fn register_consumer(&mut self, announcement: &NewConsumer) -> Result<(), MediaError> {
        let entry = self.registry.insert(announcement)?;
        let (id, kind, codec) = (entry.id.clone(), entry.kind, entry.codec);

        let decoder = match self.decoders.create(kind, codec) {
            Ok(decoder) => decoder,
            Err(e) => {
                self.registry.remove(&id);
                return Err(MediaError::InvalidParameters(format!(
                    "decoder for {id}: {e}"
                )));
            }
        };
        self.pipelines.insert(
            id.clone(),
            ConsumerPipeline {
                kind,
                depacketizer: Depacketizer::for_codec(codec),
                decoder,
                failures: FailureStreak::default(),
            },
        );
        self.stats.consumers.insert(id, ConsumerStats::default());

        // Every registration resets the debounce window; the pass that
        // eventually fires covers everything registered inside it.
        self.arm_debounce();
        Ok(())
    }

    /// Teardown is one atomic step under the actor: registry entry, learned
    /// routes, stream-index mapping, depacketizer and decoder all go
    /// together, so a late packet with the same SSRC finds nothing to
    /// resurrect.
    fn remove_consumer(&mut self, consumer_id: &ConsumerId) {
        if self.registry.remove(consumer_id).is_none() {
            debug!(consumer_id = %consumer_id, "Remove for unknown consumer ignored");
            return;
        }
        self.router.purge_consumer(consumer_id);
        self.pipelines.remove(consumer_id);
        self.throttle
            .forget(&ThrottleKey::Consumer(consumer_id.clone()));
        self.stats.consumers.remove(consumer_id);
        info!(consumer_id = %consumer_id, "Consumer removed");
    }

    async fn produce(
        &mut self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        source: &str,
    ) -> Result<ProducerId, MediaError> {
        let ssrcs: Vec<u32> = rtp_parameters
            .encodings
            .iter()
            .filter_map(|e| e.ssrc)
            .collect();
        let producer_id = self
            .signaling
            .produce(kind, rtp_parameters, source)
            .await
            .map_err(|e| MediaError::Signaling(format!("produce: {e}")))?;
        self.transport.record_send_track(kind);
        for ssrc in ssrcs {
            self.produced_ssrcs.insert(ssrc, kind);
        }
        info!(producer_id = %producer_id, kind = %kind, source, "Producer registered");
        Ok(producer_id)
    }

    // ---- negotiation ----

    fn arm_debounce(&mut self) {
        self.negotiate_at = Some(Instant::now() + self.config.negotiation_debounce());
    }

    fn start_negotiation_pass(&mut self) {
        self.negotiate_at = None;
        if self.negotiating {
            // Coalesce: one pending re-run, never a queue.
            self.renegotiate = true;
            return;
        }
        if !self.transport.is_initialized() {
            debug!("Negotiation deferred, transport not initialized");
            return;
        }
        if self.registry.is_empty() {
            return;
        }
        let Some((ice, candidates, dtls)) = self
            .transport
            .remote_parameters()
            .map(|(i, c, d)| (i.clone(), c.to_vec(), d.clone()))
        else {
            return;
        };

        if self.transport.state() == TransportState::New {
            self.transport.set_state(TransportState::Negotiating);
        }
        self.negotiating = true;

        let entries: Vec<ConsumerEntry> =
            self.registry.ordered().into_iter().cloned().collect();
        let engine = Arc::clone(&self.engine);
        let cname = self.cname.clone();
        let started = self.started;
        let session_id = self.sdp_session_id;
        self.sdp_version += 1;
        let sdp_version = self.sdp_version;
        let cmd_tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            let outcome = run_negotiation_pass(
                engine,
                ice,
                candidates,
                dtls,
                entries,
                started,
                &cname,
                session_id,
                sdp_version,
            )
            .await;
            // The actor applies the outcome; if it is gone, so is the need.
            let _ = cmd_tx.send(Command::NegotiationFinished(outcome)).await;
        });
    }

    fn on_negotiation_finished(&mut self, outcome: NegotiationOutcome) {
        self.negotiating = false;
        let tracks_added = outcome.mappings.len();
        // Mappings are recorded even for a failed pass: the engine holds
        // the appended tracks regardless, so the retry must not append
        // duplicates. A consumer removed mid-pass keeps its track slot
        // unmapped; tracks are append-only so nothing shifts.
        for (index, consumer_id, kind) in outcome.mappings {
            if let Some(entry) = self.registry.get_mut(&consumer_id) {
                entry.track_index = Some(index);
                self.router.record_stream_index(index, consumer_id);
                self.transport.record_recv_track(kind);
            } else {
                debug!(%consumer_id, index, "Consumer vanished during negotiation pass");
            }
        }
        self.started |= outcome.did_start;
        match outcome.error {
            None => {
                self.stats
                    .negotiation_passes
                    .fetch_add(1, Ordering::Relaxed);
                info!(
                    consumers = self.registry.len(),
                    tracks_added, "Negotiation pass completed"
                );
                self.emit(SessionEvent::NegotiationCompleted {
                    consumers: self.registry.len(),
                    tracks_added,
                });
                if self.renegotiate || self.registry.has_unbacked() {
                    self.renegotiate = false;
                    self.arm_debounce();
                }
            }
            Some(e) => {
                // Not fatal: re-arm the window so the pass is retried on
                // the next debounce trigger without waiting for an
                // unrelated registration.
                self.stats
                    .negotiation_failures
                    .fetch_add(1, Ordering::Relaxed);
                error!(error = %e, "Negotiation pass failed, retrying after the debounce window");
                self.renegotiate = false;
                self.arm_debounce();
            }
        }
    }

    // ---- dispatch ----

    fn on_packet(&mut self, kind: MediaKind, data: &Bytes, stream_index: Option<u32>) {
        self.stats.packets_received.fetch_add(1, Ordering::Relaxed);
        if self.transport.state() != TransportState::Connected {
            return;
        }

        if rtp::is_rtcp(data) {
            self.stats.rtcp_received.fetch_add(1, Ordering::Relaxed);
            self.on_rtcp(data);
            return;
        }

        let packet = match RtpPacket::parse(data) {
            Ok(packet) => packet,
            Err(e) => {
                self.stats.parse_errors.fetch_add(1, Ordering::Relaxed);
                debug!(error = %e, "Dropped unparseable packet");
                return;
            }
        };

        // Synthetic bandwidth-probe traffic never reaches the router.
        if packet.payload_type == self.config.probe_payload_type
            && packet.ssrc == self.config.probe_ssrc
        {
            self.stats.probe_drops.fetch_add(1, Ordering::Relaxed);
            return;
        }

        match self.router.resolve(
            &mut self.registry,
            packet.ssrc,
            packet.payload_type,
            kind,
            stream_index,
            self.config.assignment_freshness(),
        ) {
            RouteOutcome::Deliver {
                consumer_id,
                newly_bound,
            } => {
                if newly_bound {
                    self.emit(SessionEvent::ConsumerBound {
                        consumer_id: consumer_id.clone(),
                        ssrc: packet.ssrc,
                    });
                }
                self.deliver(&consumer_id, &packet);
            }
            RouteOutcome::RepairDropped => {
                self.stats.rtx_drops.fetch_add(1, Ordering::Relaxed);
            }
            RouteOutcome::NoMatch => {
                self.stats.routing_misses.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn deliver(&mut self, consumer_id: &ConsumerId, packet: &RtpPacket) {
        let Some(pipeline) = self.pipelines.get_mut(consumer_id) else {
            self.stats.routing_misses.fetch_add(1, Ordering::Relaxed);
            return;
        };
        self.stats.packets_routed.fetch_add(1, Ordering::Relaxed);
        if let Some(mut stats) = self.stats.consumers.get_mut(consumer_id) {
            stats.packets += 1;
            stats.bytes += packet.payload.len() as u64;
        }

        let completed = match pipeline.depacketizer.as_mut() {
            Some(depacketizer) => {
                if let Err(e) = depacketizer.add_packet(&packet.payload, packet.marker) {
                    // Malformed fragment: discard it, keep accumulated
                    // state, wait for the next marker-bit boundary.
                    self.stats
                        .malformed_fragments
                        .fetch_add(1, Ordering::Relaxed);
                    debug!(consumer_id = %consumer_id, error = %e, "Discarded malformed fragment");
                    None
                } else if depacketizer.frame_complete() {
                    let keyframe = depacketizer.is_keyframe();
                    let frame = depacketizer.take_frame();
                    depacketizer.reset();
                    Some((frame, keyframe))
                } else {
                    None
                }
            }
            // Audio payloads are self-contained frames.
            None => Some((packet.payload.clone(), false)),
        };
        let Some((frame, keyframe)) = completed else {
            return;
        };

        self.stats.frames_completed.fetch_add(1, Ordering::Relaxed);
        if let Some(mut stats) = self.stats.consumers.get_mut(consumer_id) {
            stats.frames_completed += 1;
            if keyframe {
                stats.keyframes += 1;
            }
        }

        match pipeline.decoder.decode(&frame) {
            Ok(Some(decoded)) => {
                pipeline.failures.record_success();
                self.stats.frames_decoded.fetch_add(1, Ordering::Relaxed);
                if let Some(mut stats) = self.stats.consumers.get_mut(consumer_id) {
                    stats.frames_decoded += 1;
                }
                let media_frame = MediaFrame {
                    consumer_id: consumer_id.clone(),
                    kind: pipeline.kind,
                    is_keyframe: keyframe,
                    frame: decoded,
                };
                // Bounded handoff: a slow renderer costs frames, not
                // packet intake.
                if self.frames_tx.try_send(media_frame).is_err() {
                    self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
            Ok(None) => pipeline.failures.record_success(),
            Err(e) => {
                self.stats.decode_failures.fetch_add(1, Ordering::Relaxed);
                if let Some(mut stats) = self.stats.consumers.get_mut(consumer_id) {
                    stats.decode_failures += 1;
                }
                debug!(consumer_id = %consumer_id, error = %e, "Decode failure");
                if pipeline
                    .failures
                    .record_failure(self.config.decode_failure_threshold)
                {
                    self.request_upstream_keyframe(consumer_id);
                }
            }
        }
    }

    fn on_rtcp(&mut self, data: &[u8]) {
        for ssrc in rtp::receiver_report_ssrcs(data) {
            if self.produced_ssrcs.get(&ssrc) == Some(&MediaKind::Video) {
                // Feedback about an outbound video stream: ask the local
                // encoder for a keyframe, rate-limited.
                if self.throttle.allow(ThrottleKey::LocalEncoder) {
                    self.stats.keyframe_requests.fetch_add(1, Ordering::Relaxed);
                    self.emit(SessionEvent::EncoderKeyframeRequested);
                } else {
                    self.stats
                        .keyframe_requests_suppressed
                        .fetch_add(1, Ordering::Relaxed);
                }
            } else if let Some(consumer_id) = self.router.route_for(ssrc).cloned() {
                if self
                    .registry
                    .get(&consumer_id)
                    .is_some_and(|e| e.kind == MediaKind::Video)
                {
                    self.request_upstream_keyframe(&consumer_id);
                }
            }
        }
    }

    fn request_upstream_keyframe(&mut self, consumer_id: &ConsumerId) {
        if !self
            .throttle
            .allow(ThrottleKey::Consumer(consumer_id.clone()))
        {
            self.stats
                .keyframe_requests_suppressed
                .fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.stats.keyframe_requests.fetch_add(1, Ordering::Relaxed);
        self.emit(SessionEvent::KeyframeRequested {
            consumer_id: consumer_id.clone(),
        });
        let signaling = Arc::clone(&self.signaling);
        let id = consumer_id.clone();
        tokio::spawn(async move {
            if let Err(e) = signaling.request_keyframe(&id).await {
                warn!(consumer_id = %id, error = %e, "Keyframe request failed");
            }
        });
    }

    fn on_connection_state(&mut self, state: EngineConnectionState) {
        let next = TransportState::from(state);
        if self.transport.set_state(next) {
            self.connected.store(
                next == TransportState::Connected,
                Ordering::Release,
            );
            self.emit(SessionEvent::TransportStateChanged(next));
        }
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            transport_state: self.transport.state(),
            consumers: self
                .registry
                .ordered()
                .into_iter()
                .map(|e| e.id.clone())
                .collect(),
            stream_index_map: self.router.stream_index_map().clone(),
            recv_video_tracks: self.transport.recv_video_tracks,
            recv_audio_tracks: self.transport.recv_audio_tracks,
            send_video_tracks: self.transport.send_video_tracks,
            send_audio_tracks: self.transport.send_audio_tracks,
        }
    }

    /// Terminal teardown: everything owned by the session is released
    /// before the reply goes out.
    async fn close(&mut self) {
        self.transport.set_state(TransportState::Closed);
        self.connected.store(false, Ordering::Release);
        self.registry.clear();
        self.router.clear();
        self.pipelines.clear();
        self.throttle.clear();
        self.stats.consumers.clear();
        self.negotiate_at = None;
        if let Err(e) = self.engine.close().await {
            warn!(error = %e, "Engine close failed");
        }
        self.emit(SessionEvent::TransportStateChanged(TransportState::Closed));
        info!(transport_id = %self.transport_id, "Session closed");
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events_tx.send(event);
    }
}

async fn debounce_wait(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// One negotiation pass, run off the actor so packet intake keeps flowing.
/// Serialization is guaranteed by the actor's in-flight flag. Track
/// mappings are returned even on failure so the actor can record every
/// slot the engine now owns.
#[allow(clippy::too_many_arguments)]
async fn run_negotiation_pass(
    engine: Arc<dyn WebRtcEngine>,
    ice: IceParameters,
    candidates: Vec<IceCandidate>,
    dtls: DtlsParameters,
    mut entries: Vec<ConsumerEntry>,
    already_started: bool,
    cname: &str,
    session_id: u64,
    sdp_version: u64,
) -> NegotiationOutcome {
    let mut mappings = Vec::new();

    // Entries arrive sorted by registration order; tracks are append-only,
    // which is what keeps media-line order stable across passes.
    for entry in entries.iter_mut().filter(|e| e.track_index.is_none()) {
        match engine
            .add_recv_track(entry.kind, entry.codec, entry.payload_type, entry.clock_rate)
            .await
        {
            Ok(index) => {
                entry.track_index = Some(index);
                mappings.push((index, entry.id.clone(), entry.kind));
            }
            Err(e) => {
                return NegotiationOutcome {
                    mappings,
                    did_start: false,
                    error: Some(MediaError::Negotiation(format!("add_recv_track: {e}"))),
                };
            }
        }
    }

    let exchange: Result<bool, MediaError> = async {
        let refs: Vec<&ConsumerEntry> = entries.iter().collect();
        let offer = sdp::build_remote_offer(
            &ice,
            &candidates,
            &dtls,
            &refs,
            cname,
            session_id,
            sdp_version,
        );
        engine
            .set_remote_description(&offer)
            .await
            .map_err(|e| MediaError::Negotiation(format!("set remote description: {e}")))?;

        let answer = engine
            .create_local_description()
            .await
            .map_err(|e| MediaError::Negotiation(format!("create local description: {e}")))?;
        let rewritten = sdp::rewrite_inactive_media(&answer);
        if rewritten != answer {
            warn!("Rewrote inactive media sections to recvonly in local answer");
        }
        engine
            .set_local_description(&rewritten)
            .await
            .map_err(|e| MediaError::Negotiation(format!("set local description: {e}")))?;

        if already_started {
            Ok(false)
        } else {
            engine
                .start()
                .await
                .map_err(|e| MediaError::Negotiation(format!("transport start: {e}")))?;
            Ok(true)
        }
    }
    .await;

    match exchange {
        Ok(did_start) => NegotiationOutcome {
            mappings,
            did_start,
            error: None,
        },
        Err(e) => NegotiationOutcome {
            mappings,
            did_start: false,
            error: Some(e),
        },
    }
}
