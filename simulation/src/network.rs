//! Fabric of QBB devices driven by the scheduler
//!
//! A [`Network`] owns every node of a [`Topology`]: one [`QbbNetDevice`] per
//! port, a [`SharedBuffer`] per switch and a [`UdpSink`] per host. Each
//! scheduled event runs exactly one device entry point through a
//! per-event [`DeviceContext`]; whatever the device hands back to its node
//! (deliveries, sends on other ports) is carried out before the next event.
//!
//! ## Event flow
//!
//! 1. **AppSend**: a sender builds a packet and its host routes it to a port
//! 2. **Timer**: a device timer fires and is dispatched to its device
//! 3. **Arrive**: a packet reaches the far end of a channel
//!
//! Switches forward delivered packets along static shortest-path routes;
//! hosts hand them to their sink, which detects flow completion.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use qbb_core::{
    Address, AdmissionControl, DeviceContext, DeviceTimer, ErrorModel, FlowKey, NodeId, NodeRole,
    Packet, PortIndex, SimTime, TimerId, TopologyError, TraceEvent,
};
use qbb_device::{BufferConfig, QbbConfig, QbbNetDevice, SharedBuffer};
use qbb_logging::NodeContextGuard;

use crate::apps::{FlowSpec, UdpSender, UdpSink};
use crate::error::{SimResult, SimulationError};
use crate::scheduler::{EventId, Scheduler};
use crate::stats::{FctSummary, FlowCompletion, TraceCounters};
use crate::topology::Topology;
use crate::types::{AppId, NodeAction, PortLink, SimEvent};

/// Device and buffer configuration applied to every node
#[derive(Debug, Clone, Default)]
pub struct NetworkSettings {
    /// Configuration of host NIC ports; the data rate comes from the link
    pub nic: QbbConfig,
    /// Configuration of switch ports; the data rate comes from the link
    pub switch: QbbConfig,
    pub buffer: BufferConfig,
    /// Seed of every switch's ECN marking
    pub seed: u64,
}

struct Node {
    role: NodeRole,
    address: Address,
    devices: Vec<QbbNetDevice>,
    links: Vec<PortLink>,
    routes: HashMap<Address, PortIndex>,
    buffer: Option<SharedBuffer>,
    sink: UdpSink,
}

/// A running fabric simulation
pub struct Network {
    scheduler: Scheduler<SimEvent>,
    nodes: Vec<Node>,
    addresses: HashMap<Address, NodeId>,
    senders: Vec<UdpSender>,
    flows: Vec<FlowCompletion>,
    /// Sink-side key of every flow, per receiving node
    expected: HashMap<(NodeId, FlowKey), AppId>,
    counters: TraceCounters,
    actions: VecDeque<NodeAction>,
    unroutable: u64,
    instance_id: Uuid,
}

impl Network {
    /// Create devices, buffers and routes for `topology`
    pub fn build(topology: &Topology, settings: &NetworkSettings) -> SimResult<Self> {
        topology.validate()?;
        settings.buffer.validate()?;
        let routes = topology.routes();
        let mut nodes = Vec::with_capacity(topology.node_count());
        let mut addresses = HashMap::new();

        for (index, links) in topology.ports().into_iter().enumerate() {
            let id = NodeId(index as u32);
            let role = topology
                .role(id)
                .ok_or(TopologyError::UnknownNode(id.0))?;
            let address = Address::for_node(id);
            let base = match role {
                NodeRole::Nic => &settings.nic,
                NodeRole::Switch => &settings.switch,
            };
            let devices = links
                .iter()
                .enumerate()
                .map(|(port, link)| {
                    let config = base.clone().with_data_rate(link.rate);
                    QbbNetDevice::new(id, PortIndex(port as u32), role, address, config)
                })
                .collect::<Result<Vec<_>, _>>()?;
            let buffer = (role == NodeRole::Switch).then(|| {
                SharedBuffer::new(
                    settings.buffer.clone(),
                    links.len(),
                    settings.seed.wrapping_add(u64::from(id.0)),
                )
            });
            let routes = routes
                .get(&id)
                .map(|table| {
                    table
                        .iter()
                        .map(|(destination, port)| (Address::for_node(*destination), *port))
                        .collect()
                })
                .unwrap_or_default();

            addresses.insert(address, id);
            nodes.push(Node {
                role,
                address,
                devices,
                links,
                routes,
                buffer,
                sink: UdpSink::new(),
            });
        }

        let instance_id = Uuid::new_v4();
        info!(
            nodes = nodes.len(),
            links = topology.link_count(),
            %instance_id,
            "Network built"
        );
        Ok(Self {
            scheduler: Scheduler::new(),
            nodes,
            addresses,
            senders: Vec::new(),
            flows: Vec::new(),
            expected: HashMap::new(),
            counters: TraceCounters::default(),
            actions: VecDeque::new(),
            unroutable: 0,
            instance_id,
        })
    }

    // ---------------------------------------------------------------------
    // Setup
    // ---------------------------------------------------------------------

    /// Arm every device's periodic timers
    pub fn start(&mut self) -> SimResult<()> {
        for (node, port) in self.device_ids() {
            self.with_device(node, port, |device, ctx| device.start(ctx))?;
        }
        Ok(())
    }

    /// Register a flow and schedule its first packet
    pub fn add_flow(&mut self, spec: FlowSpec) -> SimResult<AppId> {
        if spec.packets == 0 {
            return Err(SimulationError::EmptyFlow {
                from: spec.source,
                to: spec.destination,
            });
        }
        for node in [spec.source, spec.destination] {
            if self.node(node)?.role != NodeRole::Nic {
                return Err(SimulationError::NotAHost(node));
            }
        }

        let path = self.path(spec.source, spec.destination)?;
        let line_rate = path.first().map(|link| link.rate).unwrap_or_default();
        let ideal = ideal_fct(&path, &spec);

        let id = AppId(self.senders.len());
        let source = self.node(spec.source)?.address;
        let destination = self.node(spec.destination)?.address;
        let sender = UdpSender::new(id, spec.clone(), source, destination, line_rate);
        self.expected
            .insert((spec.destination, sender.receiver_key()), id);
        self.flows.push(FlowCompletion {
            app: id,
            source: spec.source,
            destination: spec.destination,
            packets: spec.packets,
            bytes: spec.total_bytes(),
            start: spec.start,
            finish: None,
            ideal,
        });
        self.scheduler
            .schedule_at(spec.start, SimEvent::AppSend { app: id });
        debug!(app = %id, from = %spec.source, to = %spec.destination, packets = spec.packets, "Flow added");
        self.senders.push(sender);
        Ok(id)
    }

    pub fn set_error_model(
        &mut self,
        node: NodeId,
        port: PortIndex,
        model: Box<dyn ErrorModel>,
    ) -> SimResult<()> {
        self.device_mut(node, port)?.set_error_model(model);
        Ok(())
    }

    pub fn set_link_up(&mut self, node: NodeId, port: PortIndex, up: bool) -> SimResult<()> {
        self.device_mut(node, port)?.set_link_up(up);
        Ok(())
    }

    /// Route `packet` from `node` as if an application on it had sent it
    pub fn inject(&mut self, node: NodeId, packet: Packet) -> SimResult<()> {
        self.route(node, packet)?;
        self.drain_actions()
    }

    // ---------------------------------------------------------------------
    // Running
    // ---------------------------------------------------------------------

    /// Fire every event up to and including `limit`
    pub fn run_until(&mut self, limit: SimTime) -> SimResult<SimTime> {
        while let Some((_, _, event)) = self.scheduler.pop_until(limit) {
            self.dispatch(event)?;
        }
        self.scheduler.advance_to(limit);
        Ok(self.now())
    }

    /// Fire events until every flow completed or `limit` is reached
    ///
    /// Returns whether every flow completed.
    pub fn run_until_complete(&mut self, limit: SimTime) -> SimResult<bool> {
        while !self.all_flows_complete() {
            let Some((_, _, event)) = self.scheduler.pop_until(limit) else {
                break;
            };
            self.dispatch(event)?;
        }
        let complete = self.all_flows_complete();
        if !complete {
            self.scheduler.advance_to(limit);
        }
        info!(
            now = %self.now(),
            complete,
            events = self.scheduler.fired(),
            "Run finished"
        );
        Ok(complete)
    }

    fn dispatch(&mut self, event: SimEvent) -> SimResult<()> {
        trace!(now = %self.now(), event = event.name(), "Dispatching event");
        match event {
            SimEvent::Arrive { node, port, packet } => {
                self.with_device(node, port, |device, ctx| device.receive(ctx, packet))?;
            }
            SimEvent::Timer { node, port, timer } => {
                self.with_device(node, port, |device, ctx| device.on_timer(ctx, timer))?;
            }
            SimEvent::AppSend { app } => self.app_send(app)?,
        }
        self.drain_actions()
    }

    fn app_send(&mut self, app: AppId) -> SimResult<()> {
        let now = self.now();
        let Some(sender) = self.senders.get_mut(app.0) else {
            return Ok(());
        };
        let Some(packet) = sender.next_packet(now) else {
            return Ok(());
        };
        let node = sender.spec.source;
        if !sender.is_done() {
            let interval = sender.interval(packet.size());
            self.scheduler.schedule(interval, SimEvent::AppSend { app });
        }
        self.route(node, packet)
    }

    /// Queue `packet` on the port `node` routes its destination through
    fn route(&mut self, node: NodeId, packet: Packet) -> SimResult<()> {
        let destination = packet.header.destination;
        match self.node(node)?.routes.get(&destination) {
            Some(&port) => {
                self.actions
                    .push_back(NodeAction::Send { node, port, packet });
            }
            None => {
                self.unroutable += 1;
                warn!(%node, %destination, uid = packet.uid(), "No route, dropping packet");
            }
        }
        Ok(())
    }

    fn drain_actions(&mut self) -> SimResult<()> {
        while let Some(action) = self.actions.pop_front() {
            match action {
                NodeAction::Send { node, port, packet } => {
                    self.with_device(node, port, |device, ctx| {
                        device.send(ctx, packet);
                    })?;
                }
                NodeAction::Deliver { node, port, packet } => self.deliver(node, port, packet)?,
            }
        }
        Ok(())
    }

    /// A device handed `packet` to its node
    fn deliver(&mut self, node: NodeId, port: PortIndex, packet: Packet) -> SimResult<()> {
        let now = self.now();
        let state = self.node_mut(node)?;
        if state.role == NodeRole::Switch {
            trace!(%node, %port, uid = packet.uid(), "Forwarding");
            return self.route(node, packet);
        }
        let Some((key, received)) = state.sink.receive(&packet, now) else {
            return Ok(());
        };
        let Some(&app) = self.expected.get(&(node, key)) else {
            return Ok(());
        };
        if let Some(flow) = self.flows.get_mut(app.0) {
            if flow.finish.is_none() && received >= flow.packets {
                flow.finish = Some(now);
                info!(
                    app = %app,
                    fct = ?flow.fct(),
                    "Flow completed"
                );
            }
        }
        Ok(())
    }

    /// Run `f` against one device with a context for the current event
    fn with_device<F>(&mut self, node: NodeId, port: PortIndex, f: F) -> SimResult<()>
    where
        F: FnOnce(&mut QbbNetDevice, &mut NetContext<'_>),
    {
        let now = self.scheduler.now();
        let state = self
            .nodes
            .get_mut(node.0 as usize)
            .ok_or(SimulationError::NoDevice { node, port })?;
        let link = state.links.get(port.as_usize()).copied();
        let device = state
            .devices
            .get_mut(port.as_usize())
            .ok_or(SimulationError::NoDevice { node, port })?;

        let _guard = NodeContextGuard::at(node, state.role, self.instance_id, now);
        let mut ctx = NetContext {
            now,
            node,
            port,
            link,
            scheduler: &mut self.scheduler,
            admission: state.buffer.as_mut(),
            counters: &mut self.counters,
            actions: &mut self.actions,
        };
        f(device, &mut ctx);
        Ok(())
    }

    /// Cancel every device timer and drop queued packets
    pub fn dispose(&mut self) -> SimResult<()> {
        for (node, port) in self.device_ids() {
            self.with_device(node, port, |device, ctx| device.dispose(ctx))?;
        }
        Ok(())
    }

    /// Log the queue status of every port; returns the total queued bytes
    pub fn log_status(&self) -> u64 {
        self.nodes
            .iter()
            .flat_map(|node| node.devices.iter())
            .map(QbbNetDevice::print_status)
            .sum()
    }

    // ---------------------------------------------------------------------
    // Accessors
    // ---------------------------------------------------------------------

    pub fn now(&self) -> SimTime {
        self.scheduler.now()
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn address(&self, node: NodeId) -> Option<Address> {
        self.nodes.get(node.0 as usize).map(|state| state.address)
    }

    pub fn node_of(&self, address: Address) -> Option<NodeId> {
        self.addresses.get(&address).copied()
    }

    pub fn device(&self, node: NodeId, port: PortIndex) -> Option<&QbbNetDevice> {
        self.nodes
            .get(node.0 as usize)?
            .devices
            .get(port.as_usize())
    }

    /// Shared buffer of a switch
    pub fn buffer(&self, node: NodeId) -> Option<&SharedBuffer> {
        self.nodes.get(node.0 as usize)?.buffer.as_ref()
    }

    pub fn sink(&self, node: NodeId) -> Option<&UdpSink> {
        self.nodes.get(node.0 as usize).map(|state| &state.sink)
    }

    pub fn counters(&self) -> &TraceCounters {
        &self.counters
    }

    pub fn flows(&self) -> &[FlowCompletion] {
        &self.flows
    }

    pub fn summary(&self) -> FctSummary {
        FctSummary::from_flows(&self.flows)
    }

    pub fn all_flows_complete(&self) -> bool {
        self.flows.iter().all(|flow| flow.finish.is_some())
    }

    /// Packets hosts received more than once
    pub fn duplicates(&self) -> u64 {
        self.nodes.iter().map(|node| node.sink.duplicates()).sum()
    }

    /// Packets dropped for lack of a route
    pub fn unroutable(&self) -> u64 {
        self.unroutable
    }

    /// Live events waiting in the scheduler
    pub fn pending_events(&self) -> usize {
        self.scheduler.len()
    }

    fn node(&self, node: NodeId) -> SimResult<&Node> {
        self.nodes
            .get(node.0 as usize)
            .ok_or_else(|| TopologyError::UnknownNode(node.0).into())
    }

    fn node_mut(&mut self, node: NodeId) -> SimResult<&mut Node> {
        self.nodes
            .get_mut(node.0 as usize)
            .ok_or_else(|| TopologyError::UnknownNode(node.0).into())
    }

    fn device_mut(&mut self, node: NodeId, port: PortIndex) -> SimResult<&mut QbbNetDevice> {
        self.node_mut(node)?
            .devices
            .get_mut(port.as_usize())
            .ok_or(SimulationError::NoDevice { node, port })
    }

    fn device_ids(&self) -> Vec<(NodeId, PortIndex)> {
        self.nodes
            .iter()
            .enumerate()
            .flat_map(|(index, node)| {
                (0..node.devices.len()).map(move |port| (NodeId(index as u32), PortIndex(port as u32)))
            })
            .collect()
    }

    /// Links a packet from `source` to `destination` crosses
    fn path(&self, source: NodeId, destination: NodeId) -> SimResult<Vec<PortLink>> {
        let target = self.node(destination)?.address;
        let no_route = || TopologyError::NoRoute {
            from: source.0,
            destination: target.to_string(),
        };
        let mut path = Vec::new();
        let mut node = source;
        while node != destination {
            if path.len() > self.nodes.len() {
                return Err(no_route().into());
            }
            let state = self.node(node)?;
            let port = state.routes.get(&target).ok_or_else(no_route)?;
            let link = state
                .links
                .get(port.as_usize())
                .copied()
                .ok_or(SimulationError::NoDevice { node, port: *port })?;
            path.push(link);
            node = link.peer;
        }
        Ok(path)
    }
}

/// Completion time of `spec` on an idle fabric along `path`
///
/// The whole flow serializes once at the slowest link; every further hop
/// adds one packet's store-and-forward time. Propagation adds up per link.
fn ideal_fct(path: &[PortLink], spec: &FlowSpec) -> Duration {
    let Some(bottleneck) = path.iter().map(|link| link.rate).min() else {
        return Duration::ZERO;
    };
    let propagation: Duration = path.iter().map(|link| link.delay).sum();
    let hops = u32::try_from(path.len().saturating_sub(1)).unwrap_or(u32::MAX);
    let serialization = match u32::try_from(spec.total_bytes()) {
        Ok(bytes) => bottleneck.tx_time(bytes),
        Err(_) => bottleneck.tx_time_f64(spec.total_bytes() as f64),
    };
    serialization + bottleneck.tx_time(spec.wire_size()) * hops
        + propagation
}

/// [`DeviceContext`] of one device for the duration of one event
struct NetContext<'a> {
    now: SimTime,
    node: NodeId,
    port: PortIndex,
    link: Option<PortLink>,
    scheduler: &'a mut Scheduler<SimEvent>,
    admission: Option<&'a mut SharedBuffer>,
    counters: &'a mut TraceCounters,
    actions: &'a mut VecDeque<NodeAction>,
}

impl DeviceContext for NetContext<'_> {
    fn now(&self) -> SimTime {
        self.now
    }

    fn schedule(&mut self, delay: Duration, timer: DeviceTimer) -> TimerId {
        let id = self.scheduler.schedule(
            delay,
            SimEvent::Timer {
                node: self.node,
                port: self.port,
                timer,
            },
        );
        TimerId(id.0)
    }

    fn cancel(&mut self, id: TimerId) {
        self.scheduler.cancel(EventId(id.0));
    }

    fn is_pending(&self, id: TimerId) -> bool {
        self.scheduler.is_pending(EventId(id.0))
    }

    fn transmit_start(&mut self, packet: Packet, tx_time: Duration) -> bool {
        let Some(link) = self.link else {
            return false;
        };
        self.scheduler.schedule(
            tx_time + link.delay,
            SimEvent::Arrive {
                node: link.peer,
                port: link.peer_port,
                packet,
            },
        );
        true
    }

    fn deliver_up(&mut self, packet: Packet) {
        self.actions.push_back(NodeAction::Deliver {
            node: self.node,
            port: self.port,
            packet,
        });
    }

    fn send_on_port(&mut self, port: PortIndex, packet: Packet) {
        self.actions.push_back(NodeAction::Send {
            node: self.node,
            port,
            packet,
        });
    }

    fn admission(&mut self) -> Option<&mut dyn AdmissionControl> {
        self.admission
            .as_deref_mut()
            .map(|buffer| buffer as &mut dyn AdmissionControl)
    }

    fn trace(&mut self, event: TraceEvent) {
        trace!(node = %self.node, port = %self.port, event = event.name(), "Device trace");
        self.counters.record(&event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::TopologyBuilder;
    use qbb_core::DataRate;

    fn star(hosts: usize) -> Network {
        let topology =
            TopologyBuilder::new(DataRate::from_gbps(40), Duration::from_micros(1)).star(hosts);
        Network::build(&topology, &NetworkSettings::default()).unwrap()
    }

    #[test]
    fn test_build_creates_devices_per_port() {
        let network = star(3);
        assert_eq!(network.node_count(), 4);
        assert!(network.device(NodeId(0), PortIndex(0)).is_some());
        assert!(network.device(NodeId(0), PortIndex(1)).is_none());
        assert!(network.device(NodeId(3), PortIndex(2)).is_some());
        assert!(network.buffer(NodeId(3)).is_some());
        assert!(network.buffer(NodeId(0)).is_none());
        assert_eq!(
            network.node_of(Address::for_node(NodeId(2))),
            Some(NodeId(2))
        );
    }

    #[test]
    fn test_single_packet_crosses_switch() {
        let mut network = star(2);
        network
            .add_flow(FlowSpec::new(NodeId(0), NodeId(1), 1))
            .unwrap();
        assert!(network.run_until_complete(SimTime::from_millis(1)).unwrap());

        // Two hops: 206 ns serialization plus 1 us propagation each
        let flow = &network.flows()[0];
        assert_eq!(flow.fct(), Some(Duration::from_nanos(2 * (206 + 1_000))));
        assert_eq!(flow.ideal, Duration::from_nanos(2 * (206 + 1_000)));
        assert_eq!(flow.slowdown(), Some(1.0));
    }

    #[test]
    fn test_flows_to_non_hosts_are_rejected() {
        let mut network = star(2);
        let result = network.add_flow(FlowSpec::new(NodeId(0), NodeId(2), 1));
        assert!(matches!(result, Err(SimulationError::NotAHost(NodeId(2)))));
        let result = network.add_flow(FlowSpec::new(NodeId(0), NodeId(1), 0));
        assert!(matches!(result, Err(SimulationError::EmptyFlow { .. })));
    }

    #[test]
    fn test_down_link_drops_at_source() {
        let mut network = star(2);
        network.set_link_up(NodeId(0), PortIndex(0), false).unwrap();
        network
            .add_flow(FlowSpec::new(NodeId(0), NodeId(1), 3))
            .unwrap();
        assert!(!network.run_until_complete(SimTime::from_micros(100)).unwrap());
        assert_eq!(network.counters().count("mac_tx_drop"), 3);
        assert_eq!(network.now(), SimTime::from_micros(100));
    }

    #[test]
    fn test_dispose_cancels_timers() {
        let mut network = star(2);
        network
            .add_flow(FlowSpec::new(NodeId(0), NodeId(1), 50))
            .unwrap();
        network.run_until(SimTime::from_micros(2)).unwrap();
        let before = network.pending_events();
        network.dispose().unwrap();
        assert!(network.pending_events() < before);
        assert!(network.device(NodeId(0), PortIndex(0)).unwrap().queue().is_empty());
    }
}
