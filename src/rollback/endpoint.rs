//! One remote player as seen by the rollback engine: the sync handshake, input exchange with
//! acknowledgement and retransmission, quality reports, and checksum reports.
//!
//! ```text
//!   Synchronizing ── N sync round trips ──► Running ── disconnect() ──► Disconnected
//!                                            │   ▲
//!                        no traffic for      │   │ any valid message
//!                  disconnect_notify_start   ▼   │
//!                                          (interrupted)
//! ```

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use tracing::trace;
use web_time::{Duration, Instant};

use super::input_queue::PlayerInput;
use super::messages::{
    ChecksumReport, Input, InputAck, Message, MessageBody, MessageHeader, QualityReply,
    QualityReport, SyncReply, SyncRequest,
};
use super::time_sync::TimeSync;
use crate::config::EndpointConfig;
use crate::network::codec;
use crate::network::network_stats::NetworkStats;
use crate::report_violation;
use crate::rng::{Pcg32, Rng, SeedableRng};
use crate::telemetry::{ViolationKind, ViolationSeverity};
use crate::transport::PeerId;
use crate::{Frame, NetInput, PlayerHandle};

/// Unacknowledged inputs kept before the peer is considered gone.
const PENDING_OUTPUT_LIMIT: usize = 128;
/// Remote checksums kept while waiting for the local frame to be confirmed.
const MAX_CHECKSUM_HISTORY: usize = 32;
/// Size of the IP and UDP headers, for bandwidth estimates.
const UDP_HEADER_SIZE: usize = 28;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EndpointState {
    Synchronizing,
    Running,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum EndpointEvent<I> {
    Connected,
    Synchronizing { count: u32, total: u32 },
    Synchronized,
    Input(PlayerInput<I>),
    NetworkInterrupted { disconnect_timeout: Duration },
    NetworkResumed,
    Disconnected,
}

pub(crate) struct Endpoint<I> {
    peer: PeerId,
    handle: PlayerHandle,
    state: EndpointState,
    config: EndpointConfig,
    tick_rate_hz: f64,
    epoch: u32,
    magic: u16,
    remote_magic: u16,
    rng: Pcg32,
    heard_from_peer: bool,

    send_queue: VecDeque<Message>,
    event_queue: VecDeque<EndpointEvent<I>>,

    sync_remaining_roundtrips: u32,
    sync_random_requests: BTreeSet<u32>,

    pending_output: VecDeque<PlayerInput<I>>,
    last_acked_frame: Frame,
    last_recv_frame: Frame,
    overflow_reported: bool,

    time_sync: TimeSync,
    local_frame_advantage: i32,
    remote_frame_advantage: i32,

    created: Instant,
    stats_start_time: Instant,
    packets_sent: usize,
    bytes_sent: usize,
    round_trip_time: u64,
    last_send_time: Instant,
    last_recv_time: Instant,
    running_last_quality_report: Instant,
    running_last_input_recv: Instant,
    disconnect_notify_sent: bool,

    pending_checksums: BTreeMap<Frame, u32>,
}

impl<I: NetInput> Endpoint<I> {
    pub fn new(
        peer: PeerId,
        handle: PlayerHandle,
        epoch: u32,
        config: EndpointConfig,
        tick_rate_hz: f64,
        time_sync_window: usize,
    ) -> Self {
        let mut rng = Pcg32::from_entropy();
        let mut magic: u16 = rng.gen();
        while magic == 0 {
            magic = rng.gen();
        }
        let now = Instant::now();
        Self {
            peer,
            handle,
            state: EndpointState::Synchronizing,
            config,
            tick_rate_hz,
            epoch,
            magic,
            remote_magic: 0,
            rng,
            heard_from_peer: false,
            send_queue: VecDeque::new(),
            event_queue: VecDeque::new(),
            sync_remaining_roundtrips: config.num_sync_packets,
            sync_random_requests: BTreeSet::new(),
            pending_output: VecDeque::new(),
            last_acked_frame: Frame::NULL,
            last_recv_frame: Frame::NULL,
            overflow_reported: false,
            time_sync: TimeSync::new(time_sync_window),
            local_frame_advantage: 0,
            remote_frame_advantage: 0,
            created: now,
            stats_start_time: now,
            packets_sent: 0,
            bytes_sent: 0,
            round_trip_time: 0,
            last_send_time: now,
            last_recv_time: now,
            running_last_quality_report: now,
            running_last_input_recv: now,
            disconnect_notify_sent: false,
            pending_checksums: BTreeMap::new(),
        }
    }

    pub fn peer(&self) -> PeerId {
        self.peer
    }

    pub fn handle(&self) -> PlayerHandle {
        self.handle
    }

    pub fn state(&self) -> EndpointState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == EndpointState::Running
    }

    /// Starts the handshake. The first request goes out immediately.
    pub fn synchronize(&mut self) {
        self.state = EndpointState::Synchronizing;
        self.sync_remaining_roundtrips = self.config.num_sync_packets;
        self.stats_start_time = Instant::now();
        self.send_sync_request();
    }

    pub fn disconnect(&mut self) {
        self.state = EndpointState::Disconnected;
    }

    pub fn frames_ahead(&self) -> f32 {
        self.time_sync.frames_ahead()
    }

    pub fn round_trip_time(&self) -> u64 {
        self.round_trip_time
    }

    /// Estimates where the peer is now from the last frame it sent and half the round trip.
    pub fn update_local_frame_advantage(&mut self, local_frame: Frame) {
        if local_frame.is_null() || self.last_recv_frame.is_null() {
            return;
        }
        let ping = (self.round_trip_time / 2) as f64;
        let remote_frame = self.last_recv_frame + (ping * self.tick_rate_hz / 1000.0) as i32;
        self.local_frame_advantage = remote_frame - local_frame;
    }

    pub fn network_stats(&self) -> Option<NetworkStats> {
        if self.state != EndpointState::Running {
            return None;
        }
        let seconds = self.stats_start_time.elapsed().as_secs().max(1) as usize;
        let total_bytes_sent = self.bytes_sent + self.packets_sent * UDP_HEADER_SIZE;
        Some(NetworkStats {
            pending_inputs: self.pending_output.len(),
            ping_ms: self.round_trip_time,
            kbps_sent: total_bytes_sent * 8 / 1024 / seconds,
            local_frames_behind: self.local_frame_advantage,
            remote_frames_behind: self.remote_frame_advantage,
            ..NetworkStats::default()
        })
    }

    /// Runs the timers: handshake retries, input retransmission, quality reports, keep-alives and
    /// the interrupted notification.
    pub fn poll(&mut self, now: Instant) {
        match self.state {
            EndpointState::Synchronizing => {
                if self.last_send_time + self.config.sync_retry_interval < now {
                    self.send_sync_request();
                }
            },
            EndpointState::Running => {
                if self.running_last_input_recv + self.config.running_retry_interval < now {
                    self.send_pending_output();
                    self.running_last_input_recv = now;
                }
                if self.running_last_quality_report + self.config.quality_report_interval < now {
                    self.send_quality_report(now);
                }
                if self.last_send_time + self.config.keepalive_interval < now {
                    self.send_keep_alive();
                }
                if !self.disconnect_notify_sent
                    && self.last_recv_time + self.config.disconnect_notify_start < now
                {
                    self.disconnect_notify_sent = true;
                    self.event_queue
                        .push_back(EndpointEvent::NetworkInterrupted {
                            disconnect_timeout: self.config.disconnect_notify_start,
                        });
                }
            },
            EndpointState::Disconnected => (),
        }
    }

    pub fn drain_events(&mut self) -> std::collections::vec_deque::Drain<'_, EndpointEvent<I>> {
        self.event_queue.drain(..)
    }

    pub fn drain_messages(&mut self) -> std::collections::vec_deque::Drain<'_, Message> {
        self.send_queue.drain(..)
    }

    /*
     *  SENDING MESSAGES
     */

    /// Queues a local input (already shifted by the frame delay) and sends everything unacked.
    pub fn send_input(&mut self, input: PlayerInput<I>) {
        if self.state != EndpointState::Running {
            return;
        }
        self.time_sync.advance_frame(
            input.frame,
            self.local_frame_advantage,
            self.remote_frame_advantage,
        );
        self.pending_output.push_back(input);
        if self.pending_output.len() > PENDING_OUTPUT_LIMIT {
            self.pending_output.pop_front();
            if !self.overflow_reported {
                self.overflow_reported = true;
                report_violation!(
                    ViolationSeverity::Warning,
                    ViolationKind::RollbackProtocol,
                    "player {} stopped acknowledging inputs; dropping the oldest",
                    self.handle
                );
            }
        }
        self.send_pending_output();
    }

    fn send_pending_output(&mut self) {
        let Some(first) = self.pending_output.front() else {
            return;
        };
        let start_frame = first.frame;
        let inputs: Vec<I> = self.pending_output.iter().map(|i| i.input).collect();
        let bytes = match codec::encode(&inputs) {
            Ok(bytes) => bytes,
            Err(e) => {
                report_violation!(
                    ViolationSeverity::Error,
                    ViolationKind::RollbackProtocol,
                    "failed to encode {} pending inputs: {}",
                    inputs.len(),
                    e
                );
                return;
            },
        };
        let body = Input {
            disconnect_requested: self.state == EndpointState::Disconnected,
            start_frame,
            ack_frame: self.last_recv_frame,
            bytes,
        };
        self.queue_message(MessageBody::Input(body));
    }

    fn send_input_ack(&mut self) {
        let body = InputAck {
            ack_frame: self.last_recv_frame,
        };
        self.queue_message(MessageBody::InputAck(body));
    }

    fn send_keep_alive(&mut self) {
        self.queue_message(MessageBody::KeepAlive);
    }

    fn send_sync_request(&mut self) {
        let random_request: u32 = self.rng.gen();
        self.sync_random_requests.insert(random_request);
        self.queue_message(MessageBody::SyncRequest(SyncRequest { random_request }));
    }

    fn send_quality_report(&mut self, now: Instant) {
        self.running_last_quality_report = now;
        let frame_advantage = self
            .local_frame_advantage
            .clamp(i32::from(i16::MIN), i32::from(i16::MAX)) as i16;
        let body = QualityReport {
            frame_advantage,
            ping: self.millis_since_created(now),
        };
        self.queue_message(MessageBody::QualityReport(body));
    }

    pub fn send_checksum_report(&mut self, frame: Frame, checksum: u32) {
        self.queue_message(MessageBody::ChecksumReport(ChecksumReport { checksum, frame }));
    }

    fn queue_message(&mut self, body: MessageBody) {
        trace!("Queuing rollback message to {}: {:?}", self.peer, body);
        let msg = Message {
            header: MessageHeader {
                epoch: self.epoch,
                magic: self.magic,
            },
            body,
        };
        self.packets_sent += 1;
        self.last_send_time = Instant::now();
        self.bytes_sent += std::mem::size_of_val(&msg);
        self.send_queue.push_back(msg);
    }

    fn millis_since_created(&self, now: Instant) -> u64 {
        u64::try_from(now.saturating_duration_since(self.created).as_millis()).unwrap_or(u64::MAX)
    }

    /*
     *  RECEIVING MESSAGES
     */

    pub fn handle_message(&mut self, msg: &Message) {
        trace!("Handling rollback message from {}: {:?}", self.peer, msg);
        if msg.header.epoch != self.epoch {
            trace!(
                "Dropping message from epoch {} (ours is {})",
                msg.header.epoch,
                self.epoch
            );
            return;
        }
        if self.remote_magic != 0 && msg.header.magic != self.remote_magic {
            trace!("Dropping message with wrong magic");
            return;
        }

        self.last_recv_time = Instant::now();
        if !self.heard_from_peer {
            self.heard_from_peer = true;
            self.event_queue.push_back(EndpointEvent::Connected);
        }
        if self.disconnect_notify_sent && self.state == EndpointState::Running {
            self.disconnect_notify_sent = false;
            self.event_queue.push_back(EndpointEvent::NetworkResumed);
        }

        match &msg.body {
            MessageBody::SyncRequest(body) => self.on_sync_request(*body),
            MessageBody::SyncReply(body) => self.on_sync_reply(msg.header, *body),
            MessageBody::Input(body) => self.on_input(body),
            MessageBody::InputAck(body) => self.pop_pending_output(body.ack_frame),
            MessageBody::QualityReport(body) => self.on_quality_report(*body),
            MessageBody::QualityReply(body) => self.on_quality_reply(*body),
            MessageBody::ChecksumReport(body) => self.on_checksum_report(*body),
            MessageBody::KeepAlive => (),
        }
    }

    fn on_sync_request(&mut self, body: SyncRequest) {
        let reply = SyncReply {
            random_reply: body.random_request,
        };
        self.queue_message(MessageBody::SyncReply(reply));
    }

    fn on_sync_reply(&mut self, header: MessageHeader, body: SyncReply) {
        if self.state != EndpointState::Synchronizing {
            return;
        }
        if !self.sync_random_requests.remove(&body.random_reply) {
            return;
        }

        self.sync_remaining_roundtrips = self.sync_remaining_roundtrips.saturating_sub(1);
        if self.sync_remaining_roundtrips > 0 {
            self.event_queue.push_back(EndpointEvent::Synchronizing {
                count: self.config.num_sync_packets - self.sync_remaining_roundtrips,
                total: self.config.num_sync_packets,
            });
            self.send_sync_request();
        } else {
            let now = Instant::now();
            self.state = EndpointState::Running;
            self.remote_magic = header.magic;
            self.running_last_input_recv = now;
            self.running_last_quality_report = now;
            self.event_queue.push_back(EndpointEvent::Synchronized);
        }
    }

    fn on_input(&mut self, body: &Input) {
        if self.state == EndpointState::Synchronizing {
            return;
        }
        self.pop_pending_output(body.ack_frame);

        if body.disconnect_requested {
            if self.state != EndpointState::Disconnected {
                self.event_queue.push_back(EndpointEvent::Disconnected);
                self.state = EndpointState::Disconnected;
            }
            return;
        }

        if !self.last_recv_frame.is_null() && body.start_frame > self.last_recv_frame + 1 {
            report_violation!(
                ViolationSeverity::Warning,
                ViolationKind::RollbackProtocol,
                "input from player {} starts at frame {} but the last received frame is {}",
                self.handle,
                body.start_frame,
                self.last_recv_frame
            );
            return;
        }

        let inputs: Vec<I> = match codec::decode_value(&body.bytes) {
            Ok(inputs) => inputs,
            Err(e) => {
                report_violation!(
                    ViolationSeverity::Warning,
                    ViolationKind::RollbackProtocol,
                    "undecodable input packet from player {}: {}",
                    self.handle,
                    e
                );
                return;
            },
        };

        self.running_last_input_recv = Instant::now();
        for (offset, input) in inputs.into_iter().enumerate() {
            let frame = body.start_frame + offset as i32;
            if !self.last_recv_frame.is_null() && frame <= self.last_recv_frame {
                continue;
            }
            self.last_recv_frame = frame;
            self.event_queue
                .push_back(EndpointEvent::Input(PlayerInput::new(frame, input)));
        }
        self.send_input_ack();
    }

    fn pop_pending_output(&mut self, ack_frame: Frame) {
        if ack_frame.is_null() {
            return;
        }
        while let Some(front) = self.pending_output.front() {
            if front.frame > ack_frame {
                break;
            }
            self.last_acked_frame = front.frame;
            self.pending_output.pop_front();
        }
    }

    fn on_quality_report(&mut self, body: QualityReport) {
        self.remote_frame_advantage = i32::from(body.frame_advantage);
        self.queue_message(MessageBody::QualityReply(QualityReply { pong: body.ping }));
    }

    fn on_quality_reply(&mut self, body: QualityReply) {
        let now = self.millis_since_created(Instant::now());
        self.round_trip_time = now.saturating_sub(body.pong);
    }

    fn on_checksum_report(&mut self, body: ChecksumReport) {
        if self.pending_checksums.len() >= MAX_CHECKSUM_HISTORY {
            self.pending_checksums.pop_first();
        }
        self.pending_checksums.insert(body.frame, body.checksum);
    }

    /// Takes every remote checksum for frames strictly before `confirmed`.
    pub fn take_checksums_before(&mut self, confirmed: Frame) -> Vec<(Frame, u32)> {
        let keep = self.pending_checksums.split_off(&confirmed);
        std::mem::replace(&mut self.pending_checksums, keep)
            .into_iter()
            .collect()
    }

    #[cfg(test)]
    pub fn pending_output_len(&self) -> usize {
        self.pending_output.len()
    }

    #[cfg(test)]
    pub fn last_acked_frame(&self) -> Frame {
        self.last_acked_frame
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    fn endpoint(peer: u32, handle: usize) -> Endpoint<u16> {
        Endpoint::new(
            PeerId::new(peer),
            PlayerHandle::new(handle),
            7,
            EndpointConfig::default(),
            60.0,
            30,
        )
    }

    /// Delivers everything `from` queued to `to`.
    fn pump(from: &mut Endpoint<u16>, to: &mut Endpoint<u16>) {
        let messages: Vec<Message> = from.drain_messages().collect();
        for msg in &messages {
            let bytes = msg.to_bytes().unwrap();
            to.handle_message(&Message::from_bytes(&bytes).unwrap());
        }
    }

    fn synchronized_pair() -> (Endpoint<u16>, Endpoint<u16>) {
        let mut a = endpoint(1, 1);
        let mut b = endpoint(0, 0);
        a.synchronize();
        b.synchronize();
        for _ in 0..20 {
            pump(&mut a, &mut b);
            pump(&mut b, &mut a);
        }
        assert!(a.is_running() && b.is_running());
        a.drain_events().for_each(drop);
        b.drain_events().for_each(drop);
        (a, b)
    }

    #[test]
    fn handshake_reports_progress_then_synchronizes() {
        let mut a = endpoint(1, 1);
        let mut b = endpoint(0, 0);
        a.synchronize();
        b.synchronize();
        for _ in 0..20 {
            pump(&mut a, &mut b);
            pump(&mut b, &mut a);
        }
        let events: Vec<_> = a.drain_events().collect();
        let progress = events
            .iter()
            .filter(|e| matches!(e, EndpointEvent::Synchronizing { .. }))
            .count();
        assert_eq!(progress as u32, EndpointConfig::default().num_sync_packets - 1);
        assert_eq!(events.first(), Some(&EndpointEvent::Connected));
        assert_eq!(events.last(), Some(&EndpointEvent::Synchronized));
    }

    #[test]
    fn inputs_are_delivered_in_order_and_acked() {
        let (mut a, mut b) = synchronized_pair();
        for frame in 0..5 {
            a.send_input(PlayerInput::new(Frame::new(frame), frame as u16 * 10));
        }
        pump(&mut a, &mut b);

        let received: Vec<PlayerInput<u16>> = b
            .drain_events()
            .filter_map(|e| match e {
                EndpointEvent::Input(input) => Some(input),
                _ => None,
            })
            .collect();
        assert_eq!(received.len(), 5);
        for (i, input) in received.iter().enumerate() {
            assert_eq!(input.frame, Frame::new(i as i32));
            assert_eq!(input.input, i as u16 * 10);
        }

        pump(&mut b, &mut a);
        assert_eq!(a.pending_output_len(), 0);
        assert_eq!(a.last_acked_frame(), Frame::new(4));
    }

    #[test]
    fn lost_packets_are_covered_by_the_next_send() {
        let (mut a, mut b) = synchronized_pair();
        a.send_input(PlayerInput::new(Frame::new(0), 1));
        a.drain_messages().for_each(drop);
        a.send_input(PlayerInput::new(Frame::new(1), 2));
        pump(&mut a, &mut b);

        let frames: Vec<Frame> = b
            .drain_events()
            .filter_map(|e| match e {
                EndpointEvent::Input(input) => Some(input.frame),
                _ => None,
            })
            .collect();
        assert_eq!(frames, vec![Frame::new(0), Frame::new(1)]);
    }

    #[test]
    fn messages_from_another_epoch_are_ignored() {
        let (mut a, _) = synchronized_pair();
        let mut stale = Endpoint::<u16>::new(
            PeerId::new(0),
            PlayerHandle::new(0),
            6,
            EndpointConfig::default(),
            60.0,
            30,
        );
        stale.synchronize();
        pump(&mut stale, &mut a);
        assert_eq!(a.drain_messages().count(), 0);
    }

    #[test]
    fn disconnect_request_is_reported_once() {
        let (mut a, mut b) = synchronized_pair();
        a.send_input(PlayerInput::new(Frame::new(0), 1));
        a.drain_messages().for_each(drop);
        a.disconnect();
        a.send_pending_output();
        let msg: Vec<Message> = a.drain_messages().collect();
        for m in msg.iter().chain(msg.iter()) {
            b.handle_message(m);
        }
        let disconnects = b
            .drain_events()
            .filter(|e| *e == EndpointEvent::Disconnected)
            .count();
        assert_eq!(disconnects, 1);
        assert_eq!(b.state(), EndpointState::Disconnected);
    }

    #[test]
    fn silence_raises_interrupted_and_traffic_resumes() {
        let (mut a, mut b) = synchronized_pair();
        let later = Instant::now() + Duration::from_secs(5);
        a.poll(later);
        assert!(a
            .drain_events()
            .any(|e| matches!(e, EndpointEvent::NetworkInterrupted { .. })));

        b.send_keep_alive();
        pump(&mut b, &mut a);
        assert!(a.drain_events().any(|e| e == EndpointEvent::NetworkResumed));
    }

    #[test]
    fn checksums_are_taken_up_to_the_confirmed_frame() {
        let (mut a, mut b) = synchronized_pair();
        b.send_checksum_report(Frame::new(16), 0xAA);
        b.send_checksum_report(Frame::new(32), 0xBB);
        pump(&mut b, &mut a);

        assert!(a.take_checksums_before(Frame::new(16)).is_empty());
        assert_eq!(a.take_checksums_before(Frame::new(20)), vec![(Frame::new(16), 0xAA)]);
        assert_eq!(a.take_checksums_before(Frame::new(40)), vec![(Frame::new(32), 0xBB)]);
    }

    #[test]
    fn quality_report_round_trip_sets_remote_advantage() {
        let (mut a, mut b) = synchronized_pair();
        a.local_frame_advantage = 3;
        a.send_quality_report(Instant::now());
        pump(&mut a, &mut b);
        assert_eq!(b.remote_frame_advantage, 3);
        pump(&mut b, &mut a);
        assert!(a.network_stats().is_some());
    }
}
