use std::{
    collections::{HashSet, VecDeque},
    time::{Duration, Instant},
};

use log::{info, trace, warn};
use rand::Rng;

use tidelink_serde::{BitCounter, BitReader, BitWrite, BitWriter, Serde};

use crate::{
    channels::{
        bunch::{BunchHeader, CloseReason, InBunch, OutBunch},
        channel::{ChannelName, ChannelSignal},
        channel_table::{ChannelTable, ChannelTableError, CONTROL_CHANNEL_INDEX},
    },
    connection::{
        channel_record::ChannelRecord,
        config::ConnectionConfig,
        error::{CloseCause, ConnectionError, ProtocolViolation},
        events::ConnectionEvent,
        handler::{HandlerPipeline, PacketHandler},
        packet_notify::{PacketNotify, PacketNotifyHeader},
        packet_order_cache::PacketOrderCache,
        sequence_history::HISTORY_LENGTH,
        transport::{PacketTraits, Transport},
    },
    constants::{MAX_CHSEQUENCE, NOTIFY_HEADER_BITS, PACKET_TRAILER_BITS},
    timer::Timer,
    types::{ChannelIndex, HostType, PacketIndex},
    wrapping_number::make_relative,
};

/// Lifecycle of a connection. Transitions are monotonic; there is no way
/// back from Closed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Invalid,
    Pending,
    Open,
    Closed,
}

/// The per-peer protocol engine: turns a stream of unreliable, unordered
/// packets into ordered, reliable logical channels, and back.
///
/// Owns one PacketNotify, one ChannelRecord, an optional PacketOrderCache
/// and the channel table. All operations are synchronous; the owner drives
/// the engine with `received_raw_packet` and a periodic `tick`, and drains
/// results through `take_events`.
pub struct Connection {
    config: ConnectionConfig,
    host_type: HostType,
    state: ConnectionState,

    notify: PacketNotify,
    record: ChannelRecord,
    channels: ChannelTable,
    pipeline: HandlerPipeline,

    // out-of-order correction, allocated lazily after enough evidence of a
    // reordering path
    order_cache: Option<PacketOrderCache>,
    out_of_order_events: u32,
    /// When the cache started waiting for its current gap
    cache_fill_start: Option<Instant>,

    send_buffer: Option<BitWriter>,
    /// Bunch data has been written into the open send buffer; distinguishes
    /// data packets from ack-only keep-alives
    buffer_has_data: bool,
    /// Ack decisions recorded since the last flush
    dirty_acks: u32,
    /// Every flushed packet is treated as implicitly delivered; used by
    /// fully-reliable offline-record owners
    internal_ack: bool,

    keep_alive_timer: Timer,
    last_receive: Instant,
    last_tick: Instant,
    pending_destroy: bool,

    /// Bandwidth pacing debt, in bits
    queued_bits: i64,

    /// Incoming byte rate sampling for the piggybacked packet info
    rate_timer: Timer,
    bytes_received_window: u64,
    in_rate_byte: u8,

    /// Channel indices refused during the packet currently being processed
    rejected_channels: HashSet<ChannelIndex>,
    reject_window: Timer,
    rejects_in_window: u32,

    events: VecDeque<ConnectionEvent>,
}

impl Connection {
    pub fn new(host_type: HostType, config: ConnectionConfig) -> Self {
        let now = Instant::now();
        let mut notify = PacketNotify::new();
        if config.randomize_initial_sequence {
            let mut rng = rand::thread_rng();
            let initial_out: PacketIndex = rng.gen();
            notify.init(PacketIndex::MAX, initial_out);
        }

        Self {
            channels: ChannelTable::new(config.max_channels),
            keep_alive_timer: Timer::new(config.keep_alive_interval),
            rate_timer: Timer::new(Duration::from_secs(1)),
            reject_window: Timer::new(Duration::from_secs(1)),
            config,
            host_type,
            state: ConnectionState::Pending,
            notify,
            record: ChannelRecord::new(),
            pipeline: HandlerPipeline::new(),
            order_cache: None,
            out_of_order_events: 0,
            cache_fill_start: None,
            send_buffer: None,
            buffer_has_data: false,
            dirty_acks: 0,
            internal_ack: false,
            last_receive: now,
            last_tick: now,
            pending_destroy: false,
            queued_bits: 0,
            bytes_received_window: 0,
            in_rate_byte: 0,
            rejected_channels: HashSet::new(),
            rejects_in_window: 0,
            events: VecDeque::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn host_type(&self) -> HostType {
        self.host_type
    }

    /// Overrides the sequence seeds, for owners that exchange them during a
    /// handshake. Must be called before any traffic.
    pub fn init_sequences(&mut self, initial_in: PacketIndex, initial_out: PacketIndex) {
        self.notify.init(initial_in.wrapping_sub(1), initial_out);
    }

    /// The sequence the next flushed packet will carry
    pub fn out_seq(&self) -> PacketIndex {
        self.notify.out_seq()
    }

    /// Switches the connection to internal-ack mode: no peer is expected to
    /// answer, every flushed packet is treated as delivered
    pub fn enable_internal_ack(&mut self) {
        self.internal_ack = true;
    }

    /// Appends a packet-handler stage (encryption, compression). Stages run
    /// outermost on the wire.
    pub fn push_handler(&mut self, stage: Box<dyn PacketHandler>) {
        self.pipeline.push(stage);
    }

    pub fn take_events(&mut self) -> Vec<ConnectionEvent> {
        self.events.drain(..).collect()
    }

    /// Timeout currently in force. Connections marked pending-destroy get a
    /// short grace period to drain remaining reliable traffic.
    pub fn timeout_value(&self) -> Duration {
        if self.pending_destroy {
            self.config.pending_destroy_timeout
        } else {
            self.config.timeout * self.config.timeout_multiplier
        }
    }

    pub fn set_pending_destroy(&mut self) {
        self.pending_destroy = true;
    }

    /// Whether more data may be queued without exceeding the bandwidth
    /// budget's saturation point
    pub fn is_net_ready(&self) -> bool {
        let buffered = self
            .send_buffer
            .as_ref()
            .map_or(0, |buffer| i64::from(buffer.bits_written()));
        self.queued_bits + buffered <= 0
    }

    // --- channel operations ---

    /// Opens a channel locally and queues its open bunch. The control
    /// channel must be opened first; opening it moves the connection to
    /// Open.
    pub fn open_channel(
        &mut self,
        name: ChannelName,
        transport: &mut dyn Transport,
    ) -> Result<ChannelIndex, ConnectionError> {
        if self.state == ConnectionState::Closed {
            return Err(ConnectionError::Closed);
        }
        if name != ChannelName::Control && !self.channels.has_control_channel() {
            return Err(ConnectionError::SendFailed {
                channel_index: 0,
                reason: "control channel must be opened first",
            });
        }

        let channel_index = if name == ChannelName::Control {
            self.channels.create_at(CONTROL_CHANNEL_INDEX, name)?;
            CONTROL_CHANNEL_INDEX
        } else {
            self.channels.allocate(name)?
        };

        let bunches = match self.channels.get_mut(channel_index) {
            Some(channel) => channel.send_open_bunch()?,
            None => Vec::new(),
        };
        self.write_bunches(channel_index, bunches, transport);

        info!("Opened {} channel at index {}", name.as_str(), channel_index);
        if channel_index == CONTROL_CHANNEL_INDEX && self.state == ConnectionState::Pending {
            self.state = ConnectionState::Open;
            self.events.push_back(ConnectionEvent::Opened);
        }
        Ok(channel_index)
    }

    /// Frames and queues a payload on a channel, fragmenting oversized
    /// reliable payloads into partial bunches
    pub fn send(
        &mut self,
        channel_index: ChannelIndex,
        payload: &[u8],
        payload_bits: u32,
        reliable: bool,
        transport: &mut dyn Transport,
    ) -> Result<(), ConnectionError> {
        if self.state == ConnectionState::Closed {
            return Err(ConnectionError::Closed);
        }
        let Some(channel) = self.channels.get_mut(channel_index) else {
            return Err(ConnectionError::SendFailed {
                channel_index,
                reason: "no channel at this index",
            });
        };
        let bunches = channel.send_bunch(payload, payload_bits, reliable)?;
        self.write_bunches(channel_index, bunches, transport);
        Ok(())
    }

    /// Queues a reliable close bunch for a channel. The channel's slot is
    /// reclaimed once every reliable bunch it sent has been acked.
    pub fn close_channel(
        &mut self,
        channel_index: ChannelIndex,
        reason: CloseReason,
        transport: &mut dyn Transport,
    ) -> Result<(), ConnectionError> {
        if self.state == ConnectionState::Closed {
            return Err(ConnectionError::Closed);
        }
        let Some(channel) = self.channels.get_mut(channel_index) else {
            return Err(ConnectionError::SendFailed {
                channel_index,
                reason: "no channel at this index",
            });
        };
        let bunches = channel.send_close_bunch(reason)?;
        self.write_bunches(channel_index, bunches, transport);
        self.events
            .push_back(ConnectionEvent::ChannelClosed { channel_index });
        Ok(())
    }

    // --- receive path ---

    /// Entry point for bytes handed up by the transport. Adversarial or
    /// corrupted packets close the connection; transient anomalies (loss,
    /// reordering, duplicates) never do.
    pub fn received_raw_packet(&mut self, bytes: &[u8], transport: &mut dyn Transport) {
        if self.state == ConnectionState::Closed {
            return;
        }

        let processed = match self.pipeline.process_incoming(bytes) {
            Ok(processed) => processed,
            Err(reason) => {
                self.shutdown(
                    CloseCause::Violation(ProtocolViolation::HandlerRejected { reason }),
                    transport,
                );
                return;
            }
        };

        self.last_receive = Instant::now();
        self.bytes_received_window += processed.len() as u64;

        if let Err(cause) = self.received_packet(&processed, false, transport) {
            self.shutdown(cause, transport);
        }
    }

    fn received_packet(
        &mut self,
        bytes: &[u8],
        flushing_cache: bool,
        transport: &mut dyn Transport,
    ) -> Result<(), CloseCause> {
        if self.state == ConnectionState::Closed {
            return Ok(());
        }
        let mut reader = BitReader::from_packet(bytes).map_err(|_| {
            CloseCause::Violation(ProtocolViolation::MalformedPacket {
                byte_len: bytes.len(),
            })
        })?;
        let header = PacketNotify::read_header(&mut reader)
            .map_err(|_| CloseCause::Violation(ProtocolViolation::MalformedNotifyHeader))?;

        let sequence_delta = self.notify.get_sequence_delta(&header);
        if sequence_delta <= 0 {
            // duplicate or stale sequence: drop without processing, so a
            // replayed packet can never be applied twice (SECURITY)
            trace!(
                "Dropping out-of-order packet, sequence {} delta {}",
                header.seq,
                sequence_delta
            );
            self.out_of_order_events += 1;
            self.maybe_enable_order_cache();
            return Ok(());
        }

        if !flushing_cache {
            if let Some(cache) = &mut self.order_cache {
                let missing_packets = sequence_delta - 1;
                let filling = cache.is_filling();
                // while the cache holds anything, every packet goes through
                // it, keeping slot positions aligned with sequences; the
                // in-order packet lands in slot 0 and flushes straight out
                if filling
                    || (missing_packets > 0
                        && missing_packets <= self.config.order_correction.max_missing_packets)
                {
                    if cache.try_cache(sequence_delta, bytes.into()) && !filling {
                        self.cache_fill_start = Some(Instant::now());
                    }
                    return self.replay_order_cache(false, transport);
                }
                // gap too large to wait for; fall through and count it as
                // loss
            }
        }

        self.process_in_packet(&header, &mut reader, transport)?;
        Ok(())
    }

    fn maybe_enable_order_cache(&mut self) {
        let correction = &self.config.order_correction;
        if correction.enabled
            && self.order_cache.is_none()
            && self.out_of_order_events >= correction.enable_threshold
        {
            info!(
                "Out-of-order threshold reached ({} events), enabling packet order cache",
                self.out_of_order_events
            );
            self.order_cache = Some(PacketOrderCache::new(correction.max_cached_packets));
        }
    }

    fn replay_order_cache(
        &mut self,
        force: bool,
        transport: &mut dyn Transport,
    ) -> Result<(), CloseCause> {
        let drained = match &mut self.order_cache {
            Some(cache) if cache.is_filling() => cache.flush(force),
            _ => return Ok(()),
        };
        for slot in drained {
            // holes are sequences that never arrived; the replayed packet
            // after a hole reports the loss through its own delta
            if let Some(packet) = slot {
                self.received_packet(&packet, true, transport)?;
            }
        }
        let still_filling = self
            .order_cache
            .as_ref()
            .is_some_and(|cache| cache.is_filling());
        self.cache_fill_start = if still_filling {
            // restart the clock for the next outstanding gap
            Some(Instant::now())
        } else {
            None
        };
        Ok(())
    }

    fn process_in_packet(
        &mut self,
        header: &PacketNotifyHeader,
        reader: &mut BitReader,
        transport: &mut dyn Transport,
    ) -> Result<(), CloseCause> {
        self.rejected_channels.clear();
        // captured before the notify state advances; gap naks below record
        // one history entry per skipped sequence
        let sequence_delta = self.notify.get_sequence_delta(header).max(1) as u32;

        // piggybacked packet info
        let has_packet_info = bool::de(reader)
            .map_err(|_| CloseCause::Violation(ProtocolViolation::MalformedNotifyHeader))?;
        if has_packet_info {
            let _peer_in_rate = u8::de(reader)
                .map_err(|_| CloseCause::Violation(ProtocolViolation::MalformedNotifyHeader))?;
        }

        // dispatch delivered/lost notifications for our own packets, in the
        // order the peer's header declares them
        let mut notifications: Vec<(PacketIndex, bool)> = Vec::new();
        self.notify
            .update(header, |seq, delivered| notifications.push((seq, delivered)))
            .map_err(|error| {
                CloseCause::Violation(ProtocolViolation::InvalidAckData(error))
            })?;

        for (seq, delivered) in notifications {
            let channels = &mut self.channels;
            self.record
                .consume_for_packet(seq, |packet_id, channel_index| {
                    if let Some(channel) = channels.get_mut(channel_index) {
                        if delivered {
                            channel.received_ack(packet_id);
                        } else {
                            channel.received_nak(packet_id);
                        }
                    }
                })
                .map_err(CloseCause::InternalError)?;
        }

        // disassemble bunches
        let mut skip_ack = false;
        let mut control_closed = false;
        while reader.bits_remaining() > 0 {
            let bunch_header = BunchHeader::de(reader)
                .map_err(|_| CloseCause::Violation(ProtocolViolation::MalformedBunchHeader))?;
            let channel_index = bunch_header.channel_index;

            if channel_index >= self.config.max_channels {
                return Err(CloseCause::Violation(
                    ProtocolViolation::ChannelIndexOutOfBounds {
                        channel_index,
                        max_channels: self.config.max_channels,
                    },
                ));
            }
            if bunch_header.payload_bits > reader.bits_remaining() {
                return Err(CloseCause::Violation(ProtocolViolation::BunchDataOverflow {
                    claimed_bits: bunch_header.payload_bits,
                    remaining_bits: reader.bits_remaining(),
                }));
            }
            let payload = reader
                .read_bits_to_boxed(bunch_header.payload_bits)
                .map_err(|_| CloseCause::Violation(ProtocolViolation::MalformedBunchHeader))?;

            if self.rejected_channels.contains(&channel_index) {
                continue;
            }
            if channel_index != CONTROL_CHANNEL_INDEX && !self.channels.has_control_channel() {
                return Err(CloseCause::Violation(
                    ProtocolViolation::BunchBeforeControlChannel { channel_index },
                ));
            }

            if self.channels.get(channel_index).is_none() {
                if channel_index == CONTROL_CHANNEL_INDEX && bunch_header.close {
                    return Err(CloseCause::Violation(
                        ProtocolViolation::ControlChannelCloseBeforeOpen,
                    ));
                }
                if !bunch_header.open {
                    // data for a channel that no longer exists; recoverable,
                    // but the peer must learn the packet was not applied
                    trace!(
                        "Dropping bunch for unknown channel {}, no open flag",
                        channel_index
                    );
                    skip_ack = true;
                    self.count_reject()?;
                    continue;
                }
                let Some(name) = bunch_header.channel_name else {
                    return Err(CloseCause::Violation(ProtocolViolation::MalformedBunchHeader));
                };
                let opener = self.host_type.invert();
                if !name.openable_by(opener) {
                    warn!(
                        "Peer attempted to open a {} channel at index {} without permission",
                        name.as_str(),
                        channel_index
                    );
                    self.refuse_channel(channel_index, transport);
                    skip_ack = true;
                    self.count_reject()?;
                    continue;
                }
                match self.channels.create_at(channel_index, name) {
                    Ok(_) => {}
                    Err(
                        ChannelTableError::IndexDraining { .. }
                        | ChannelTableError::IndexOccupied { .. }
                        | ChannelTableError::TableFull { .. },
                    ) => {
                        self.refuse_channel(channel_index, transport);
                        skip_ack = true;
                        self.count_reject()?;
                        continue;
                    }
                    Err(ChannelTableError::IndexOutOfBounds { .. }) => {
                        return Err(CloseCause::Violation(
                            ProtocolViolation::ChannelIndexOutOfBounds {
                                channel_index,
                                max_channels: self.config.max_channels,
                            },
                        ));
                    }
                }
            } else if let Some(incoming_name) = bunch_header.channel_name {
                let existing = self
                    .channels
                    .get(channel_index)
                    .map(|channel| channel.name());
                if existing != Some(incoming_name) {
                    return Err(CloseCause::Violation(ProtocolViolation::ChannelNameMismatch {
                        channel_index,
                        existing: existing.map_or("<none>", |name| name.as_str()),
                        incoming: incoming_name.as_str(),
                    }));
                }
                let draining = self
                    .channels
                    .get(channel_index)
                    .is_some_and(|channel| channel.is_closing());
                if draining && bunch_header.open {
                    // previous occupant is still draining; its index may not
                    // host a new channel yet
                    self.refuse_channel(channel_index, transport);
                    skip_ack = true;
                    self.count_reject()?;
                    continue;
                }
            }

            let Some(channel) = self.channels.get_mut(channel_index) else {
                continue;
            };
            let ch_sequence = if bunch_header.reliable {
                make_relative(
                    bunch_header.wrapped_reliable_seq,
                    channel.in_reliable(),
                    MAX_CHSEQUENCE,
                )
            } else {
                0
            };
            let name = channel.name();
            let signals = channel
                .received_raw_bunch(InBunch {
                    header: bunch_header,
                    ch_sequence,
                    payload,
                })
                .map_err(CloseCause::Violation)?;

            for signal in signals {
                match signal {
                    ChannelSignal::Opened => {
                        self.events.push_back(ConnectionEvent::ChannelOpened {
                            channel_index,
                            name,
                        });
                        if channel_index == CONTROL_CHANNEL_INDEX
                            && self.state == ConnectionState::Pending
                        {
                            self.state = ConnectionState::Open;
                            self.events.push_back(ConnectionEvent::Opened);
                        }
                    }
                    ChannelSignal::Delivered {
                        payload,
                        payload_bits,
                    } => {
                        self.events.push_back(ConnectionEvent::Bunch {
                            channel_index,
                            payload,
                            payload_bits,
                        });
                    }
                    ChannelSignal::Closed(_reason) => {
                        self.events
                            .push_back(ConnectionEvent::ChannelClosed { channel_index });
                        if channel_index == CONTROL_CHANNEL_INDEX {
                            control_closed = true;
                        }
                    }
                }
            }
        }

        // exactly one ack or nak per processed sequence, even when part of
        // the packet was skipped
        if skip_ack {
            self.notify.nak_seq(header.seq);
        } else {
            self.notify.ack_seq(header.seq);
        }
        self.dirty_acks += sequence_delta;
        if self.dirty_acks >= HISTORY_LENGTH {
            // the history window would overrun and lose ack information
            self.flush_net(transport);
        }

        if control_closed {
            self.shutdown(CloseCause::Requested, transport);
        }
        Ok(())
    }

    fn refuse_channel(&mut self, channel_index: ChannelIndex, transport: &mut dyn Transport) {
        self.rejected_channels.insert(channel_index);
        // tell the peer immediately so it stops sending on this index
        let close = OutBunch {
            header: BunchHeader {
                close: true,
                close_reason: CloseReason::Error,
                channel_index,
                ..Default::default()
            },
            ch_sequence: 0,
            payload: Box::default(),
            packet_index: 0,
        };
        self.write_out_bunch(&close, transport);
    }

    fn count_reject(&mut self) -> Result<(), CloseCause> {
        if self.reject_window.ringing() {
            self.reject_window.reset();
            self.rejects_in_window = 0;
        }
        self.rejects_in_window += 1;
        if self.rejects_in_window > self.config.abuse_close_threshold {
            return Err(CloseCause::Abuse {
                rejected_per_second: self.rejects_in_window,
            });
        }
        Ok(())
    }

    // --- send path ---

    fn ensure_send_buffer(&mut self) {
        if self.send_buffer.is_some() {
            return;
        }
        let mut buffer = BitWriter::with_max_bits(self.config.max_packet_bits);
        // the notify header goes first and is refreshed in place at flush
        // time; it must stay bit-identical in size
        self.notify.write_header(&mut buffer);
        // piggybacked packet info: observed incoming rate
        true.ser(&mut buffer);
        self.in_rate_byte.ser(&mut buffer);
        self.send_buffer = Some(buffer);
    }

    fn write_bunches(
        &mut self,
        channel_index: ChannelIndex,
        bunches: Vec<OutBunch>,
        transport: &mut dyn Transport,
    ) {
        for bunch in bunches {
            let packet_id = self.write_out_bunch(&bunch, transport);
            if bunch.header.reliable {
                if let Some(channel) = self.channels.get_mut(channel_index) {
                    channel.bunch_sent(bunch.ch_sequence, packet_id);
                }
            }
        }
        if self.config.force_flush_on_write {
            self.flush_net(transport);
        }
    }

    /// Appends one framed bunch to the open send buffer, flushing first when
    /// it would not fit. Returns the sequence of the packet the bunch was
    /// written into.
    fn write_out_bunch(&mut self, bunch: &OutBunch, transport: &mut dyn Transport) -> PacketIndex {
        self.ensure_send_buffer();
        let free_bits = self
            .send_buffer
            .as_ref()
            .map_or(0, |buffer| buffer.bits_free().saturating_sub(PACKET_TRAILER_BITS));
        let mut counter = BitCounter::new(free_bits);
        bunch.header.ser(&mut counter);
        counter.count_bits(bunch.header.payload_bits);
        if counter.overflowed() {
            self.flush_net(transport);
            self.ensure_send_buffer();
        }

        if let Some(buffer) = &mut self.send_buffer {
            bunch.header.ser(buffer);
            buffer.write_bits(&bunch.payload, bunch.header.payload_bits);
        }
        self.buffer_has_data = true;

        let packet_id = self.notify.out_seq();
        self.record
            .push_channel_record(packet_id, bunch.header.channel_index);
        packet_id
    }

    /// Seals and sends the open buffer: the notify header is refreshed in
    /// place with the latest ack state, the termination marker is appended,
    /// handler stages transform the bytes, and the outgoing sequence is
    /// committed. A packet-id marker is pushed even for ack-only packets,
    /// so every transmitted sequence is trackable.
    pub fn flush_net(&mut self, transport: &mut dyn Transport) {
        if self.send_buffer.is_none() && self.dirty_acks == 0 {
            return;
        }
        self.ensure_send_buffer();
        let Some(mut buffer) = self.send_buffer.take() else {
            return;
        };

        let mut header_writer = BitWriter::with_max_bits(NOTIFY_HEADER_BITS);
        self.notify.write_header(&mut header_writer);
        buffer.overwrite_front_bytes(&header_writer.to_bytes());

        let packet = buffer.to_packet();
        let bit_count = (packet.len() * 8) as u32;
        let traits = PacketTraits {
            is_keep_alive: !self.buffer_has_data,
        };
        let wire = if self.pipeline.is_empty() {
            packet.into_vec()
        } else {
            self.pipeline.process_outgoing(packet.into_vec())
        };
        transport.low_level_send(&wire, bit_count, traits);

        self.queued_bits += i64::from(bit_count);

        let packet_id = self.notify.out_seq();
        self.record.push_packet_id(packet_id);
        if self.internal_ack {
            let channels = &mut self.channels;
            self.record.consume_all(|channel_index| {
                if let Some(channel) = channels.get_mut(channel_index) {
                    channel.received_ack(packet_id);
                }
            });
        }
        self.notify.commit_and_increment_out_seq();

        trace!(
            "Flushed packet {} ({} bits{})",
            packet_id,
            bit_count,
            if traits.is_keep_alive { ", keep-alive" } else { "" }
        );
        self.dirty_acks = 0;
        self.buffer_has_data = false;
        self.keep_alive_timer.reset();
    }

    // --- tick ---

    /// Advances timers, pacing and retransmission. Call once per frame.
    pub fn tick(&mut self, now: Instant, transport: &mut dyn Transport) {
        if self.state == ConnectionState::Closed {
            return;
        }

        // timeout detection
        if now.saturating_duration_since(self.last_receive) > self.timeout_value() {
            let elapsed = now.saturating_duration_since(self.last_receive);
            warn!(
                "Connection timed out after {:.1}s without traffic",
                elapsed.as_secs_f32()
            );
            self.shutdown(CloseCause::Timeout, transport);
            return;
        }

        // bandwidth pacing: pay down the debt, clamped so a long hitch does
        // not bank an unbounded burst
        let delta_seconds = now.saturating_duration_since(self.last_tick).as_secs_f64();
        let delta_bits =
            (f64::from(self.config.net_speed_bits_per_second) * delta_seconds) as i64;
        self.queued_bits -= delta_bits;
        if self.queued_bits < -2 * delta_bits {
            self.queued_bits = -2 * delta_bits;
        }
        self.last_tick = now;

        // visit channels with per-tick work; kinds that ask to be ticked are
        // always visited, the rest only when a retransmission is pending
        let tick_indices: Vec<ChannelIndex> = self
            .channels
            .iter()
            .filter(|channel| {
                self.config.tick_all_channels
                    || channel.name().permissions().tick
                    || channel.has_pending_resends()
            })
            .map(|channel| channel.index())
            .collect();
        for channel_index in tick_indices {
            let resends = match self.channels.get_mut(channel_index) {
                Some(channel) => channel.take_resends(),
                None => continue,
            };
            if resends.is_empty() {
                continue;
            }
            trace!(
                "Retransmitting {} reliable bunches on channel {}",
                resends.len(),
                channel_index
            );
            self.write_bunches(channel_index, resends, transport);
        }

        // give up on gaps the order cache has waited too long for
        let cache_expired = self.cache_fill_start.is_some_and(|start| {
            now.saturating_duration_since(start) > self.config.order_correction.time_limit
        });
        if cache_expired {
            trace!("Order cache time limit reached, replaying with holes");
            if let Err(cause) = self.replay_order_cache(true, transport) {
                self.shutdown(cause, transport);
                return;
            }
        }

        // release drained closing channels; their indices become reusable
        self.channels.reap_drained();

        // sample the incoming rate for the piggybacked packet info
        if self.rate_timer.ringing_at(now) {
            self.in_rate_byte = (self.bytes_received_window / 1024).min(255) as u8;
            self.bytes_received_window = 0;
            self.rate_timer.reset_at(now);
        }

        // keep-alive and pending-ack flush
        if self.buffer_has_data
            || self.dirty_acks > 0
            || self.keep_alive_timer.ringing_at(now)
        {
            // an ack-only keep-alive still needs a buffer to seal
            self.ensure_send_buffer();
            self.flush_net(transport);
        }
    }

    // --- close ---

    /// Closes the connection at the owner's request. Idempotent.
    pub fn close(&mut self, transport: &mut dyn Transport) {
        self.shutdown(CloseCause::Requested, transport);
    }

    /// The single cleanup path every close funnels through: closes channel 0
    /// first (cascading to the rest), flushes pending acks and data, and
    /// reports the terminal state exactly once.
    fn shutdown(&mut self, cause: CloseCause, transport: &mut dyn Transport) {
        if self.state == ConnectionState::Closed {
            return;
        }
        info!("Closing connection: {:?}", cause);

        let mut close_order: Vec<ChannelIndex> = self
            .channels
            .iter()
            .filter(|channel| !channel.is_closing())
            .map(|channel| channel.index())
            .collect();
        close_order.sort_unstable();

        for channel_index in close_order {
            let bunches = match self.channels.get_mut(channel_index) {
                Some(channel) => channel.send_close_bunch(CloseReason::Destroyed),
                None => continue,
            };
            if let Ok(bunches) = bunches {
                self.write_bunches(channel_index, bunches, transport);
            }
            self.events
                .push_back(ConnectionEvent::ChannelClosed { channel_index });
        }

        self.flush_net(transport);
        self.state = ConnectionState::Closed;
        self.events.push_back(ConnectionEvent::Closed { cause });
    }
}
