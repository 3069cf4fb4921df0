//! QBB network device
//!
//! [`QbbNetDevice`] is one port of a host NIC or a switch. It owns the egress
//! queue, the transmit state machine, the local pause state and (on NICs) the
//! per-flow rate controllers, send buffers and receiver state. Everything
//! outside the device is reached through a [`DeviceContext`].
//!
//! ## Entry points
//!
//! - [`QbbNetDevice::send`]: the node hands a packet to the port
//! - [`QbbNetDevice::receive`]: the channel delivers a packet
//! - [`QbbNetDevice::on_timer`]: a timer the device scheduled fires
//!
//! ## Roles
//!
//! A **NIC** classifies outgoing data into flows, paces each flow at its QCN
//! rate, retains sent data for go-back-N recovery, and on the receive side
//! acknowledges data and reports ECN marks back to the sender.
//!
//! A **switch** runs shared-buffer admission on the way in, ECN marking on
//! the way out, and pauses upstream ports whose ingress accounting crosses
//! the PFC thresholds.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use tracing::{debug, info, instrument, trace, warn};

use qbb_core::{
    Address, CnHeader, DeviceContext, DeviceTimer, DropReason, Ecn, ErrorModel, FlowIndex, FlowKey,
    Frame, NodeId, NodeRole, Packet, PauseHeader, PortIndex, PriorityMask, ProtocolError,
    QbbHeader, SeqTsHeader, SimTime, TraceEvent, UdpHeader, PRIORITY_COUNT,
};

use crate::config::QbbConfig;
use crate::ecn::{ClassMarker, EcnAccount, RootEcnParams};
use crate::error::{DeviceError, DeviceResult};
use crate::flows::{FlowRecord, FlowTable};
use crate::link::{TxMachine, TxState};
use crate::queue::{EgressQueue, CONTROL_CLASS, QCN_CONTROL_CLASS};
use crate::rate::{FlowRate, RateParams};
use crate::reliable::{chunk_floor, AckPolicy, ReceiverState, SendBuffer, SeqOutcome};
use crate::timers::{TimerSlot, TimerTable};

/// Destination of link-local PFC frames
const BROADCAST: Address = Address::new(255, 255, 255, 255);

/// Class of non-UDP traffic on a NIC without QCN and on switches
const OTHER_CLASS: usize = 1;

/// Priority of a data frame; the control class is reserved
fn data_priority(pg: u16) -> DeviceResult<u8> {
    match u8::try_from(pg) {
        Ok(p) if usize::from(p) < CONTROL_CLASS => Ok(p),
        _ => Err(ProtocolError::InvalidPriority(pg).into()),
    }
}

/// Whether `packet` is a data packet of the sender-side flow `key`
fn belongs_to(packet: &Packet, key: &FlowKey) -> bool {
    if packet.header.destination != key.address {
        return false;
    }
    match Frame::decode(packet) {
        Ok(Frame::Data { udp, seq_ts }) => {
            udp.source_port == key.port && seq_ts.pg == u16::from(key.priority)
        }
        _ => false,
    }
}

/// Receive-side state for one remote flow
#[derive(Debug, Clone)]
struct ReceiverEntry {
    seq: ReceiverState,
    ecn: EcnAccount,
    cnp_timer: TimerSlot,
}

impl ReceiverEntry {
    fn new(policy: &AckPolicy) -> Self {
        Self {
            seq: ReceiverState::new(policy),
            ecn: EcnAccount::default(),
            cnp_timer: TimerSlot::empty(),
        }
    }
}

/// One port of a NIC or switch on a lossless fabric
pub struct QbbNetDevice {
    node: NodeId,
    port: PortIndex,
    role: NodeRole,
    address: Address,
    config: QbbConfig,
    rate_params: RateParams,
    ack_policy: AckPolicy,
    root_params: RootEcnParams,
    link_up: bool,

    tx: TxMachine,
    tx_complete: TimerSlot,
    queue: EgressQueue,

    /// Local egress classes paused by the peer
    paused: PriorityMask,
    pause_timers: [TimerSlot; PRIORITY_COUNT],

    flows: FlowTable,
    next_send: TimerSlot,
    receivers: HashMap<FlowKey, ReceiverEntry>,

    /// Pending re-evaluation of pauses this switch port asked for upstream
    recheck_timers: TimerTable<(PortIndex, u8)>,
    markers: [ClassMarker; PRIORITY_COUNT],

    error_model: Option<Box<dyn ErrorModel>>,
    sample_timer: TimerSlot,
}

impl fmt::Debug for QbbNetDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QbbNetDevice")
            .field("node", &self.node)
            .field("port", &self.port)
            .field("role", &self.role)
            .field("address", &self.address)
            .field("link_up", &self.link_up)
            .field("tx", &self.tx.state())
            .field("paused", &self.paused)
            .field("queued_bytes", &self.queue.total_bytes())
            .field("flows", &self.flows.len())
            .finish()
    }
}

impl QbbNetDevice {
    /// Create a device; rejects configurations the device cannot run
    pub fn new(
        node: NodeId,
        port: PortIndex,
        role: NodeRole,
        address: Address,
        config: QbbConfig,
    ) -> DeviceResult<Self> {
        config.validate()?;
        Ok(Self {
            node,
            port,
            role,
            address,
            rate_params: RateParams::from_config(&config),
            ack_policy: AckPolicy::from_config(&config),
            root_params: RootEcnParams::from_config(&config),
            config,
            link_up: true,
            tx: TxMachine::new(),
            tx_complete: TimerSlot::empty(),
            queue: EgressQueue::default(),
            paused: PriorityMask::EMPTY,
            pause_timers: [TimerSlot::empty(); PRIORITY_COUNT],
            flows: FlowTable::new(),
            next_send: TimerSlot::empty(),
            receivers: HashMap::new(),
            recheck_timers: TimerTable::new(),
            markers: Default::default(),
            error_model: None,
            sample_timer: TimerSlot::empty(),
        })
    }

    /// Arm the periodic sampler, if configured
    pub fn start(&mut self, ctx: &mut impl DeviceContext) {
        if let Some(interval) = self.config.sample_interval() {
            self.sample_timer.replace(ctx, interval, DeviceTimer::Sample);
        }
        debug!(node = %self.node, port = %self.port, role = ?self.role, "Device started");
    }

    pub fn set_error_model(&mut self, model: Box<dyn ErrorModel>) {
        self.error_model = Some(model);
    }

    pub fn set_link_up(&mut self, up: bool) {
        if self.link_up != up {
            info!(node = %self.node, port = %self.port, up, "Link state changed");
        }
        self.link_up = up;
    }

    // ---------------------------------------------------------------------
    // Accessors
    // ---------------------------------------------------------------------

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn port(&self) -> PortIndex {
        self.port
    }

    pub fn role(&self) -> NodeRole {
        self.role
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn config(&self) -> &QbbConfig {
        &self.config
    }

    pub fn is_link_up(&self) -> bool {
        self.link_up
    }

    pub fn tx_state(&self) -> TxState {
        self.tx.state()
    }

    pub fn paused(&self) -> PriorityMask {
        self.paused
    }

    pub fn is_paused(&self, priority: usize) -> bool {
        self.paused.contains(priority)
    }

    pub fn queue(&self) -> &EgressQueue {
        &self.queue
    }

    pub fn flows(&self) -> &FlowTable {
        &self.flows
    }

    /// Sender-side state of the flow to (`destination`, `port`, `priority`)
    pub fn flow(&self, key: &FlowKey) -> Option<&FlowRecord> {
        self.flows.get(self.flows.lookup(key)?)
    }

    /// Receiver-side sequence state of a remote flow
    pub fn receiver(&self, key: &FlowKey) -> Option<&ReceiverState> {
        self.receivers.get(key).map(|entry| &entry.seq)
    }

    pub fn marker(&self, priority: usize) -> Option<&ClassMarker> {
        self.markers.get(priority)
    }

    /// Bytes currently queued on this port
    pub fn used_buffer(&self) -> u64 {
        self.queue.total_bytes()
    }

    /// One-line queue summary: `q` marks a paused class, `Q` a running one
    pub fn status(&self) -> String {
        let mut line = String::from("Size:");
        for class in 0..PRIORITY_COUNT {
            let flag = if self.paused.contains(class) { 'q' } else { 'Q' };
            line.push_str(&format!(" {}[{}]={}", flag, class, self.queue.bytes_in(class)));
        }
        line.push_str(&format!(" sum={}", self.used_buffer()));
        line
    }

    /// Log [`QbbNetDevice::status`] and return the queued bytes
    pub fn print_status(&self) -> u64 {
        info!(node = %self.node, port = %self.port, "{}", self.status());
        self.used_buffer()
    }

    fn nic_control_class(&self) -> usize {
        if self.config.qcn_enabled {
            QCN_CONTROL_CLASS
        } else {
            CONTROL_CLASS
        }
    }

    // ---------------------------------------------------------------------
    // Send path
    // ---------------------------------------------------------------------

    /// Hand a packet to this port for transmission
    ///
    /// Returns false when the link is down, the packet cannot be decoded or
    /// the switch buffer refused it.
    #[instrument(level = "trace", skip(self, ctx, packet), fields(node = %self.node, port = %self.port, uid = packet.uid()))]
    pub fn send(&mut self, ctx: &mut impl DeviceContext, packet: Packet) -> bool {
        if !self.link_up {
            ctx.trace(TraceEvent::MacTxDrop {
                uid: packet.uid(),
                size: packet.size(),
                reason: DropReason::LinkDown,
            });
            return false;
        }
        let result = match self.role {
            NodeRole::Nic => self.send_from_nic(ctx, packet),
            NodeRole::Switch => self.send_from_switch(ctx, packet),
        };
        match result {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!(node = %self.node, port = %self.port, error = %err, "Refused packet");
                false
            }
        }
    }

    fn send_from_nic(&mut self, ctx: &mut impl DeviceContext, packet: Packet) -> DeviceResult<bool> {
        let frame = Frame::decode(&packet)?;
        let class = match frame {
            Frame::Data { udp, seq_ts } => {
                let priority = data_priority(seq_ts.pg)?;
                let key = FlowKey::new(packet.header.destination, udp.source_port, priority);
                let index = self.flow_for(key);
                let Some(flow) = self.flows.get_mut(index) else {
                    return Err(DeviceError::UnknownFlow(key));
                };
                if let Some((evicted, _)) = flow.send_buffer.push(seq_ts.seq, packet.clone()) {
                    trace!(flow = %key, seq = evicted, "Send buffer full, dropped oldest");
                }
                flow.class
            }
            Frame::Other if self.config.qcn_enabled => QCN_CONTROL_CLASS,
            Frame::Other => OTHER_CLASS,
            _ => self.nic_control_class(),
        };
        ctx.trace(TraceEvent::MacTx {
            uid: packet.uid(),
            size: packet.size(),
        });
        self.queue.enqueue(packet, class);
        self.dequeue_and_transmit(ctx);
        Ok(true)
    }

    /// Flow index for `key`, creating the flow on first use
    fn flow_for(&mut self, key: FlowKey) -> FlowIndex {
        let qcn = self.config.qcn_enabled;
        let milestone_tx = if self.config.wait_for_ack {
            self.config.chunk_size
        } else {
            0
        };
        let rate = FlowRate::new(&self.rate_params, self.config.hops);
        let capacity = self.config.send_buffer_capacity;
        let node = self.node;
        self.flows.insert_with(key, |index| {
            let class = if qcn {
                index.as_usize() + 1
            } else {
                usize::from(key.priority)
            };
            debug!(%node, flow = %key, %index, class, "New flow");
            FlowRecord {
                key,
                index,
                class,
                rate,
                credits: 0.0,
                next_avail: SimTime::ZERO,
                waiting_ack: false,
                milestone_tx,
                send_buffer: SendBuffer::new(capacity),
                retransmit_timer: TimerSlot::empty(),
            }
        })
    }

    fn send_from_switch(
        &mut self,
        ctx: &mut impl DeviceContext,
        packet: Packet,
    ) -> DeviceResult<bool> {
        let frame = Frame::decode(&packet)?;
        let class = match frame {
            Frame::Data { seq_ts, .. } => usize::from(data_priority(seq_ts.pg)?),
            // ACKs share the buffer with the data they acknowledge
            Frame::Ack(_) | Frame::Other => OTHER_CLASS,
            Frame::Pause(_) | Frame::Congestion(_) | Frame::Nack(_) => {
                self.queue.enqueue(packet, CONTROL_CLASS);
                self.dequeue_and_transmit(ctx);
                return Ok(true);
            }
        };

        let ingress = packet.ingress_port.unwrap_or(self.port);
        let egress = self.port;
        let size = packet.size();
        let admitted = match ctx.admission() {
            Some(admission) => {
                let fits = admission.check_ingress(ingress, class, size)
                    && admission.check_egress(egress, class, size);
                if fits {
                    admission.update_ingress(ingress, class, size);
                    admission.update_egress(egress, class, size);
                }
                fits
            }
            None => true,
        };

        if admitted {
            ctx.trace(TraceEvent::MacTx {
                uid: packet.uid(),
                size,
            });
            self.queue.enqueue(packet, class);
        } else {
            debug!(node = %self.node, port = %self.port, %ingress, class, size, "Admission refused packet");
            ctx.trace(TraceEvent::MacTxDrop {
                uid: packet.uid(),
                size,
                reason: DropReason::Admission,
            });
        }
        self.dequeue_and_transmit(ctx);
        self.check_queue_full(ctx, ingress, class);
        Ok(admitted)
    }

    // ---------------------------------------------------------------------
    // Transmit loop
    // ---------------------------------------------------------------------

    /// Start the next eligible packet if the link is idle
    pub fn dequeue_and_transmit(&mut self, ctx: &mut impl DeviceContext) {
        if self.tx.is_busy() {
            return;
        }
        let now = ctx.now();
        let rate_limited = self.role == NodeRole::Nic && self.config.qcn_enabled;
        let packet = match self.role {
            NodeRole::Nic if rate_limited => {
                let gates = self.flows.gates();
                self.queue.dequeue_rate_limited(self.paused, &gates, now)
            }
            NodeRole::Nic => self.queue.dequeue_strict(self.paused),
            NodeRole::Switch => self.queue.dequeue_round_robin(self.paused),
        };
        let Some(packet) = packet else {
            if rate_limited {
                self.schedule_next_send(ctx);
            }
            return;
        };
        match self.role {
            NodeRole::Nic => self.nic_departure(ctx, packet, rate_limited),
            NodeRole::Switch => self.switch_departure(ctx, packet),
        }
    }

    /// Wake up when the earliest backlogged flow becomes eligible
    fn schedule_next_send(&mut self, ctx: &mut impl DeviceContext) {
        if self.next_send.is_pending(ctx) {
            return;
        }
        let now = ctx.now();
        let earliest = self
            .flows
            .iter()
            .filter(|flow| self.queue.packets_in(flow.class) > 0)
            .map(|flow| flow.next_avail)
            .filter(|&at| at > now && at != SimTime::MAX)
            .min();
        if let Some(at) = earliest {
            self.next_send
                .replace(ctx, at.saturating_since(now), DeviceTimer::NextSend);
        }
    }

    fn nic_departure(&mut self, ctx: &mut impl DeviceContext, packet: Packet, rate_limited: bool) {
        let flow_class = self
            .queue
            .last_class()
            .filter(|&class| rate_limited && class != QCN_CONTROL_CLASS);
        if let Some(class) = flow_class {
            self.pace_flow(ctx, FlowIndex((class - 1) as u32), &packet);
        }
        self.transmit_start(ctx, packet);
    }

    /// Credit pacing, byte counter and wait-for-ACK gating of one departure
    fn pace_flow(&mut self, ctx: &mut impl DeviceContext, index: FlowIndex, packet: &Packet) {
        let now = ctx.now();
        let line = self.config.data_rate;
        let gap = self.config.interframe_gap();
        let size = packet.size();

        let Some(flow) = self.flows.get_mut(index) else {
            return;
        };
        let credits_due =
            (line.ratio(flow.rate.rate()) * (f64::from(size) - flow.credits)).max(0.0);
        flow.next_avail = now + gap + line.tx_time_f64(credits_due);

        for other in self.flows.iter_mut() {
            if other.next_avail <= now {
                other.credits += other.rate.rate().ratio(line) * credits_due;
            }
        }

        let Some(flow) = self.flows.get_mut(index) else {
            return;
        };
        flow.credits = 0.0;
        flow.rate.on_bytes_sent(&self.rate_params, size);

        if !self.config.wait_for_ack {
            return;
        }
        let Ok(Frame::Data { seq_ts, .. }) = Frame::decode(packet) else {
            return;
        };
        if seq_ts.seq >= flow.milestone_tx.saturating_sub(1) {
            flow.next_avail = SimTime::MAX;
            if !flow.waiting_ack {
                flow.retransmit_timer.replace(
                    ctx,
                    self.config.wait_ack_timer(),
                    DeviceTimer::Retransmit { flow: index },
                );
                flow.waiting_ack = true;
                debug!(flow = %flow.key, seq = seq_ts.seq, milestone = flow.milestone_tx, "Waiting for ACK");
            }
        }
    }

    fn switch_departure(&mut self, ctx: &mut impl DeviceContext, mut packet: Packet) {
        let Some(class) = self.queue.last_class() else {
            return;
        };
        if class == CONTROL_CLASS {
            self.transmit_start(ctx, packet);
            return;
        }

        let now = ctx.now();
        let ingress = packet.ingress_port.unwrap_or(self.port);
        let egress = self.port;
        let size = packet.size();
        let (congested, shared_bytes) = match ctx.admission() {
            Some(admission) => {
                admission.remove_from_ingress(ingress, class, size);
                admission.remove_from_egress(egress, class, size);
                let congested = admission.should_send_cn(ingress, egress, class);
                (congested, admission.egress_shared_bytes(egress, class))
            }
            None => (false, 0),
        };

        let variant = self.config.ecn_variant();
        let current = packet.header.ecn;
        if let Some(marker) = self.markers.get_mut(class) {
            if let Some(ecn) =
                marker.decide(variant, &self.root_params, congested, shared_bytes, current, now)
            {
                packet.set_ecn(ecn);
            }
        }

        if self.transmit_start(ctx, packet) {
            if let Some(marker) = self.markers.get_mut(class) {
                marker.on_transmitted();
            }
        }
    }

    /// Put `packet` on the wire; returns whether the channel accepted it
    fn transmit_start(&mut self, ctx: &mut impl DeviceContext, packet: Packet) -> bool {
        let uid = packet.uid();
        let size = packet.size();
        let tx_time = self.tx.begin(&packet, self.config.data_rate);
        ctx.trace(TraceEvent::PhyTxBegin { uid, size });
        self.tx_complete.replace(
            ctx,
            tx_time + self.config.interframe_gap(),
            DeviceTimer::TransmitComplete,
        );
        if ctx.transmit_start(packet, tx_time) {
            return true;
        }
        debug!(node = %self.node, port = %self.port, uid, "Channel refused packet");
        ctx.trace(TraceEvent::PhyTxDrop { uid, size });
        false
    }

    fn transmit_complete(&mut self, ctx: &mut impl DeviceContext) {
        if let Some(done) = self.tx.complete() {
            ctx.trace(TraceEvent::PhyTxEnd {
                uid: done.uid,
                size: done.size,
            });
        }
        self.dequeue_and_transmit(ctx);
    }

    // ---------------------------------------------------------------------
    // Pause and resume
    // ---------------------------------------------------------------------

    /// Lift a local pause and restart transmission
    ///
    /// # Panics
    ///
    /// If `priority` is not paused.
    pub fn resume(&mut self, ctx: &mut impl DeviceContext, priority: usize) {
        assert!(
            self.paused.contains(priority),
            "resumed priority {} that was not paused",
            priority
        );
        self.paused.remove(priority);
        if self.role == NodeRole::Switch {
            let now = ctx.now();
            let shared = ctx
                .admission()
                .map_or(0, |admission| admission.egress_shared_bytes(self.port, priority));
            let queued = self.queue.packets_in(priority);
            if let Some(marker) = self.markers.get_mut(priority) {
                marker.on_resume(now, queued, shared);
            }
        }
        debug!(node = %self.node, port = %self.port, priority, "Resumed");
        self.dequeue_and_transmit(ctx);
    }

    fn on_pause(&mut self, ctx: &mut impl DeviceContext, header: PauseHeader) -> DeviceResult<()> {
        if !self.config.qbb_enabled {
            return Ok(());
        }
        let priority = usize::from(header.priority);
        if priority >= PRIORITY_COUNT {
            return Err(ProtocolError::InvalidPriority(u16::from(header.priority)).into());
        }
        ctx.trace(TraceEvent::PauseReceived {
            priority: header.priority,
            duration_us: header.time_us,
        });

        let was_paused = self.paused.contains(priority);
        self.paused.insert(priority);
        if !header.is_resume() {
            self.pause_timers[priority].replace(
                ctx,
                Duration::from_micros(u64::from(header.time_us)),
                DeviceTimer::PauseExpired {
                    priority: header.priority,
                },
            );
            debug!(node = %self.node, port = %self.port, priority, time_us = header.time_us, "Paused");
        } else if was_paused {
            self.pause_timers[priority].cancel(ctx);
            self.resume(ctx, priority);
        } else {
            self.paused.remove(priority);
        }
        Ok(())
    }

    /// Pause or resume the upstream of `in_port` according to its buffer use
    ///
    /// Pauses are re-sent every half pause time while the condition holds;
    /// a resume is sent as soon as the ingress drains below the resume point.
    #[instrument(level = "trace", skip(self, ctx), fields(node = %self.node, port = %self.port))]
    pub fn check_queue_full(
        &mut self,
        ctx: &mut impl DeviceContext,
        in_port: PortIndex,
        priority: usize,
    ) {
        if self.role != NodeRole::Switch || !self.config.qbb_enabled {
            return;
        }
        let (pause, resume) = {
            let Some(admission) = ctx.admission() else {
                return;
            };
            let pause = admission.pause_classes(in_port, priority);
            for class in pause.iter() {
                admission.set_remote_paused(in_port, class, true);
            }
            let resume: PriorityMask = (0..PRIORITY_COUNT)
                .filter(|&class| {
                    admission.is_remote_paused(in_port, class)
                        && admission.should_resume(in_port, class)
                })
                .collect();
            for class in resume.iter() {
                admission.set_remote_paused(in_port, class, false);
            }
            (pause, resume)
        };

        let pause_time = self.config.pause_time();
        for class in pause.iter() {
            let tag = class as u8;
            self.send_pause_frame(ctx, in_port, tag, self.config.pause_time_us);
            self.recheck_timers.replace(
                ctx,
                (in_port, tag),
                pause_time / 2,
                DeviceTimer::RecheckPause {
                    port: in_port,
                    priority: tag,
                },
            );
        }
        for class in resume.iter() {
            let tag = class as u8;
            self.send_pause_frame(ctx, in_port, tag, 0);
            self.recheck_timers.cancel(ctx, (in_port, tag));
        }
    }

    fn send_pause_frame(
        &mut self,
        ctx: &mut impl DeviceContext,
        in_port: PortIndex,
        priority: u8,
        time_us: u32,
    ) {
        let qlen = u32::try_from(self.queue.bytes_in(usize::from(priority))).unwrap_or(u32::MAX);
        let frame = Frame::Pause(PauseHeader::new(time_us, qlen, priority));
        let packet = frame.to_packet(self.address, BROADCAST, ctx.now());
        debug!(node = %self.node, %in_port, priority, resume = time_us == 0, "Sending PFC frame upstream");
        ctx.trace(TraceEvent::PauseSent {
            port: in_port,
            priority,
            resume: time_us == 0,
        });
        ctx.send_on_port(in_port, packet);
    }

    // ---------------------------------------------------------------------
    // Receive path
    // ---------------------------------------------------------------------

    /// Accept a packet from the channel
    ///
    /// Packets the error model corrupts are dropped. Protocol violations are
    /// logged and the packet abandoned; the device state stays consistent.
    #[instrument(level = "trace", skip(self, ctx, packet), fields(node = %self.node, port = %self.port, uid = packet.uid()))]
    pub fn receive(&mut self, ctx: &mut impl DeviceContext, packet: Packet) {
        let uid = packet.uid();
        let size = packet.size();
        if let Some(model) = self.error_model.as_mut() {
            if model.is_corrupt(&packet) {
                ctx.trace(TraceEvent::PhyRxDrop { uid, size });
                return;
            }
        }
        ctx.trace(TraceEvent::PhyRxEnd { uid, size });
        if let Err(err) = self.handle_receive(ctx, packet) {
            warn!(node = %self.node, port = %self.port, uid, error = %err, "Abandoned received packet");
        }
    }

    fn handle_receive(&mut self, ctx: &mut impl DeviceContext, packet: Packet) -> DeviceResult<()> {
        let frame = Frame::decode(&packet)?;
        if let Frame::Pause(header) = frame {
            return self.on_pause(ctx, header);
        }
        if self.role == NodeRole::Switch {
            let tagged = packet.with_ingress_port(self.port);
            self.deliver(ctx, tagged);
            return Ok(());
        }
        match frame {
            Frame::Congestion(cn) => self.on_congestion(ctx, &packet, cn),
            Frame::Nack(header) => self.on_nack(ctx, &packet, header),
            Frame::Ack(header) => self.on_ack(ctx, &packet, header),
            Frame::Data { udp, seq_ts } => self.on_data(ctx, packet, udp, seq_ts),
            Frame::Other | Frame::Pause(_) => {
                self.deliver(ctx, packet);
                Ok(())
            }
        }
    }

    fn deliver(&mut self, ctx: &mut impl DeviceContext, packet: Packet) {
        ctx.trace(TraceEvent::MacRx {
            uid: packet.uid(),
            size: packet.size(),
        });
        ctx.deliver_up(packet);
    }

    /// Sender-side flow an ACK, NACK or CN frame from `packet`'s source refers to
    fn feedback_flow(&self, packet: &Packet, port: u16, priority: u16) -> DeviceResult<FlowIndex> {
        let priority = data_priority(priority)?;
        let key = FlowKey::new(packet.header.source, port, priority);
        self.flows.lookup(&key).ok_or(DeviceError::UnknownFlow(key))
    }

    fn on_congestion(
        &mut self,
        ctx: &mut impl DeviceContext,
        packet: &Packet,
        cn: CnHeader,
    ) -> DeviceResult<()> {
        let index = self.feedback_flow(packet, cn.flow_port, u16::from(cn.priority))?;
        let Some(flow) = self.flows.get_mut(index) else {
            return Ok(());
        };
        if cn.qfb == 0 {
            return Err(DeviceError::UselessFeedback(flow.key));
        }
        if cn.ecn_bits == Ecn::Ce.bits() {
            let fraction = cn.fraction();
            flow.rate
                .cnm_received(ctx, &self.rate_params, index, 0, fraction);
            ctx.trace(TraceEvent::CongestionNotified {
                flow: flow.key,
                fraction,
            });
        }
        if self.config.root_ecn_cc && cn.ecn_bits == Ecn::Ect0.bits() {
            flow.rate.cnm_received(ctx, &self.rate_params, index, 0, 2.0);
        }
        debug!(flow = %flow.key, rate = %flow.rate.rate(), "Congestion feedback applied");
        Ok(())
    }

    /// Sequence the buffer must be trimmed to for an ACK/NACK carrying `seq`
    fn ack_target(&self, seq: u32) -> u32 {
        if self.config.back_to_zero {
            chunk_floor(seq, self.config.chunk_size)
        } else {
            seq
        }
    }

    fn on_nack(
        &mut self,
        ctx: &mut impl DeviceContext,
        packet: &Packet,
        header: QbbHeader,
    ) -> DeviceResult<()> {
        let index = self.feedback_flow(packet, header.port, header.priority)?;
        let target = self.ack_target(header.seq);
        let now = ctx.now();
        let Some(flow) = self.flows.get_mut(index) else {
            return Ok(());
        };
        if let Some(head) = flow.send_buffer.head_seq() {
            if head > target {
                return Err(DeviceError::SendBufferMismatch {
                    flow: flow.key,
                    head,
                    requested: target,
                });
            }
        }
        flow.send_buffer.trim_below(target);
        if flow.waiting_ack {
            flow.next_avail = now;
            flow.retransmit_timer.cancel(ctx);
            flow.waiting_ack = false;
        }
        debug!(flow = %flow.key, from = target, "NACK received, going back");
        self.recover_queue(ctx, index);
        self.dequeue_and_transmit(ctx);
        Ok(())
    }

    fn on_ack(
        &mut self,
        ctx: &mut impl DeviceContext,
        packet: &Packet,
        header: QbbHeader,
    ) -> DeviceResult<()> {
        let index = self.feedback_flow(packet, header.port, header.priority)?;
        let target = self.ack_target(header.seq);
        let now = ctx.now();
        let ack_interval = self.config.ack_interval;
        let wait_for_ack = self.config.wait_for_ack;
        let chunk = self.config.chunk_size;
        let Some(flow) = self.flows.get_mut(index) else {
            return Ok(());
        };
        if ack_interval == 0 {
            return Err(DeviceError::UnexpectedAck(flow.key));
        }
        flow.send_buffer.trim_below(target);
        if wait_for_ack && header.seq >= flow.milestone_tx {
            flow.next_avail = now;
            flow.retransmit_timer.cancel(ctx);
            flow.waiting_ack = false;
            flow.milestone_tx += chunk;
            trace!(flow = %flow.key, milestone = flow.milestone_tx, "Milestone reached");
            self.dequeue_and_transmit(ctx);
        }
        Ok(())
    }

    /// Replace the flow's queued packets with the contents of its send buffer
    fn recover_queue(&mut self, ctx: &mut impl DeviceContext, index: FlowIndex) -> usize {
        let Some(flow) = self.flows.get(index) else {
            return 0;
        };
        let key = flow.key;
        let class = flow.class;
        let replay: Vec<Packet> = flow.send_buffer.packets().cloned().collect();
        let replayed = self
            .queue
            .recover(class, replay, |packet| belongs_to(packet, &key));
        ctx.trace(TraceEvent::Retransmit {
            flow: key,
            packets: replayed,
        });
        replayed
    }

    /// Replay a flow whose ACK did not arrive in time
    pub fn retransmit(&mut self, ctx: &mut impl DeviceContext, index: FlowIndex) {
        let replayed = self.recover_queue(ctx, index);
        let now = ctx.now();
        if let Some(flow) = self.flows.get_mut(index) {
            flow.next_avail = now;
            flow.waiting_ack = false;
            info!(flow = %flow.key, packets = replayed, "ACK timeout, retransmitting");
        }
        self.dequeue_and_transmit(ctx);
    }

    fn on_data(
        &mut self,
        ctx: &mut impl DeviceContext,
        packet: Packet,
        udp: UdpHeader,
        seq_ts: SeqTsHeader,
    ) -> DeviceResult<()> {
        let now = ctx.now();
        let priority = data_priority(seq_ts.pg)?;
        let key = FlowKey::new(packet.header.source, udp.source_port, priority);
        let sampling = now > SimTime::ZERO + self.config.np_sampling_interval() && priority != 1;

        let is_new = !self.receivers.contains_key(&key);
        let entry = self
            .receivers
            .entry(key)
            .or_insert_with(|| ReceiverEntry::new(&self.ack_policy));
        entry.ecn.record(packet.header.ecn, sampling);
        if is_new {
            self.check_and_send_qcn(ctx, key);
        }

        let Some(entry) = self.receivers.get_mut(&key) else {
            return Ok(());
        };
        let outcome = entry.seq.check_seq(seq_ts.seq, now, &self.ack_policy);
        let pg = u16::from(priority);
        match outcome {
            SeqOutcome::Ack(next) => {
                self.deliver(ctx, packet);
                self.send_feedback(ctx, key.address, Frame::Ack(QbbHeader::new(next, pg, key.port)));
            }
            SeqOutcome::Nack(next) => {
                debug!(flow = %key, seq = seq_ts.seq, expected = next, "Gap detected, sending NACK");
                self.send_feedback(ctx, key.address, Frame::Nack(QbbHeader::new(next, pg, key.port)));
            }
            SeqOutcome::Accepted => self.deliver(ctx, packet),
            SeqOutcome::NackSuppressed | SeqOutcome::Duplicate => {
                trace!(flow = %key, seq = seq_ts.seq, ?outcome, "Discarded out-of-order data");
            }
        }
        Ok(())
    }

    /// Report the ECN marks seen on a remote flow and re-arm the report timer
    fn check_and_send_qcn(&mut self, ctx: &mut impl DeviceContext, key: FlowKey) {
        if self.role != NodeRole::Nic || !self.config.qcn_enabled {
            return;
        }
        let no_pause = self.config.np_ecn;
        let interval = self.config.cnp_interval();
        let Some(entry) = self.receivers.get_mut(&key) else {
            return;
        };
        let feedback = entry.ecn.take_feedback(no_pause);
        entry
            .cnp_timer
            .replace(ctx, interval, DeviceTimer::CnpCheck { key });
        if let Some(feedback) = feedback {
            let frame = Frame::Congestion(CnHeader {
                flow_port: key.port,
                priority: key.priority,
                ecn_bits: feedback.ecn_bits,
                qfb: feedback.qfb,
                total: feedback.total,
            });
            trace!(flow = %key, qfb = feedback.qfb, total = feedback.total, "Sending congestion notification");
            self.send_feedback(ctx, key.address, frame);
        }
    }

    /// Queue a device-generated control frame and kick the transmitter
    fn send_feedback(&mut self, ctx: &mut impl DeviceContext, destination: Address, frame: Frame) {
        let packet = frame.to_packet(self.address, destination, ctx.now());
        self.queue.enqueue(packet, self.nic_control_class());
        self.dequeue_and_transmit(ctx);
    }

    // ---------------------------------------------------------------------
    // Timers
    // ---------------------------------------------------------------------

    /// Dispatch a timer this device scheduled
    pub fn on_timer(&mut self, ctx: &mut impl DeviceContext, timer: DeviceTimer) {
        match timer {
            DeviceTimer::TransmitComplete => self.transmit_complete(ctx),
            DeviceTimer::NextSend => self.dequeue_and_transmit(ctx),
            DeviceTimer::PauseExpired { priority } => self.resume(ctx, usize::from(priority)),
            DeviceTimer::RecheckPause { port, priority } => {
                self.check_queue_full(ctx, port, usize::from(priority))
            }
            DeviceTimer::RateIncrease { flow, hop } => {
                if let Some(record) = self.flows.get_mut(flow) {
                    record
                        .rate
                        .on_rate_timer(ctx, &self.rate_params, flow, usize::from(hop));
                }
            }
            DeviceTimer::AlphaResume { flow, hop } => {
                if let Some(record) = self.flows.get_mut(flow) {
                    record
                        .rate
                        .on_alpha_timer(ctx, &self.rate_params, flow, usize::from(hop));
                }
            }
            DeviceTimer::Retransmit { flow } => self.retransmit(ctx, flow),
            DeviceTimer::CnpCheck { key } => self.check_and_send_qcn(ctx, key),
            DeviceTimer::Sample => self.sample(ctx),
        }
    }

    fn sample(&mut self, ctx: &mut impl DeviceContext) {
        for flow in self.flows.iter() {
            ctx.trace(TraceEvent::RateSample {
                flow: flow.key,
                rate: flow.rate.rate(),
            });
        }
        for class in 0..self.queue.class_count() {
            ctx.trace(TraceEvent::QueueSample {
                priority: u8::try_from(class).unwrap_or(u8::MAX),
                bytes: self.queue.bytes_in(class),
            });
        }
        if let Some(interval) = self.config.sample_interval() {
            self.sample_timer.replace(ctx, interval, DeviceTimer::Sample);
        }
    }

    /// Cancel every timer the device owns and drop queued packets
    pub fn dispose(&mut self, ctx: &mut impl DeviceContext) {
        self.tx_complete.cancel(ctx);
        self.next_send.cancel(ctx);
        self.sample_timer.cancel(ctx);
        for slot in &mut self.pause_timers {
            slot.cancel(ctx);
        }
        for flow in self.flows.iter_mut() {
            flow.rate.cancel_timers(ctx);
            flow.retransmit_timer.cancel(ctx);
        }
        for entry in self.receivers.values_mut() {
            entry.cnp_timer.cancel(ctx);
        }
        self.recheck_timers.cancel_all(ctx);
        self.queue.clear();
        debug!(node = %self.node, port = %self.port, "Device disposed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qbb_core::{data_packet, DataRate, MockContext};

    fn nic(config: QbbConfig) -> QbbNetDevice {
        QbbNetDevice::new(
            NodeId(0),
            PortIndex(0),
            NodeRole::Nic,
            Address::new(10, 0, 0, 1),
            config,
        )
        .unwrap()
    }

    fn data(seq: u32, pg: u16) -> Packet {
        data_packet(
            Address::new(10, 0, 0, 1),
            Address::new(10, 0, 0, 2),
            UdpHeader {
                source_port: 4000,
                destination_port: 5000,
            },
            SeqTsHeader {
                seq,
                ts: SimTime::ZERO,
                pg,
            },
            1000,
            SimTime::ZERO,
        )
    }

    #[test]
    fn test_rejects_invalid_config() {
        let config = QbbConfig::default().with_data_rate(DataRate::ZERO);
        let result = QbbNetDevice::new(
            NodeId(0),
            PortIndex(0),
            NodeRole::Nic,
            Address::new(10, 0, 0, 1),
            config,
        );
        assert!(matches!(result, Err(DeviceError::Config(_))));
    }

    #[test]
    fn test_send_starts_transmission() {
        let mut ctx = MockContext::new();
        let mut device = nic(QbbConfig::default());
        assert!(device.send(&mut ctx, data(0, 3)));
        assert_eq!(ctx.transmitted.len(), 1);
        assert_eq!(device.tx_state(), TxState::Busy);
        assert_eq!(ctx.count_timers(|t| *t == DeviceTimer::TransmitComplete), 1);
    }

    #[test]
    fn test_link_down_drops() {
        let mut ctx = MockContext::new();
        let mut device = nic(QbbConfig::default());
        device.set_link_up(false);
        assert!(!device.send(&mut ctx, data(0, 3)));
        assert!(ctx.transmitted.is_empty());
        let drops = ctx.traces_matching(|e| {
            matches!(e, TraceEvent::MacTxDrop { reason: DropReason::LinkDown, .. })
        });
        assert_eq!(drops.len(), 1);
    }

    #[test]
    fn test_control_priority_rejected_for_data() {
        let mut ctx = MockContext::new();
        let mut device = nic(QbbConfig::default());
        assert!(!device.send(&mut ctx, data(0, 7)));
        assert!(device.flows().is_empty());
    }

    #[test]
    fn test_status_line() {
        let mut ctx = MockContext::new();
        let mut device = nic(QbbConfig::default());
        device.send(&mut ctx, data(0, 3));
        device.send(&mut ctx, data(1, 3));
        let status = device.status();
        assert!(status.starts_with("Size: Q[0]=0"));
        assert!(status.contains("Q[3]=1030"));
        assert!(status.ends_with("sum=1030"));
        assert_eq!(device.print_status(), 1030);
    }

    #[test]
    fn test_qcn_flows_get_own_class() {
        let mut ctx = MockContext::new();
        let mut device = nic(QbbConfig::dcqcn());
        device.send(&mut ctx, data(0, 3));
        let key = FlowKey::new(Address::new(10, 0, 0, 2), 4000, 3);
        let flow = device.flow(&key).unwrap();
        assert_eq!(flow.class, 1);
        assert_eq!(flow.send_buffer.len(), 1);
        assert!(flow.next_avail > SimTime::ZERO);
    }

    #[test]
    fn test_dispose_cancels_timers() {
        let mut ctx = MockContext::new();
        let mut device = nic(QbbConfig::dcqcn().with_sample_interval_us(10.0));
        device.start(&mut ctx);
        device.send(&mut ctx, data(0, 3));
        assert!(!ctx.pending().is_empty());
        device.dispose(&mut ctx);
        assert!(ctx.pending().is_empty());
        assert_eq!(device.used_buffer(), 0);
    }
}
