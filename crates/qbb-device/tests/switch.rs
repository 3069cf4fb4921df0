//! Switch ports on a shared buffer
//!
//! Tests for:
//! - Upstream PFC generation, refresh and resume from ingress accounting
//! - Admission drops when the buffer is full
//! - Control frames bypassing admission, ACKs going through it
//! - Standard and no-pause ECN marking at departure
//! - Ingress tagging of received data

use qbb_core::{
    data_packet, Address, DeviceContext, DeviceTimer, DropReason, Ecn, Frame,
    MockContext, NodeId, NodeRole, Packet, PauseHeader, PortIndex, QbbHeader, SeqTsHeader, SimTime,
    TraceEvent, UdpHeader,
};
use qbb_device::{BufferConfig, EcnVariant, QbbConfig, QbbNetDevice, SharedBuffer, CELL_SIZE};

const SWITCH: Address = Address::new(10, 0, 1, 1);
const HOST_A: Address = Address::new(10, 0, 0, 1);
const HOST_B: Address = Address::new(10, 0, 0, 2);
const BROADCAST: Address = Address::new(255, 255, 255, 255);

const INGRESS: PortIndex = PortIndex(0);
const EGRESS: PortIndex = PortIndex(1);

// ============================================================================
// Helper functions for test setup
// ============================================================================

/// Egress port 1 of a two-port switch with `buffer` as its packet memory
fn switch_port(config: QbbConfig, buffer: BufferConfig) -> (QbbNetDevice, MockContext) {
    let device = QbbNetDevice::new(NodeId(5), EGRESS, NodeRole::Switch, SWITCH, config).unwrap();
    let ctx = MockContext::new().with_admission(Box::new(SharedBuffer::new(buffer, 2, 42)));
    (device, ctx)
}

/// A data packet that arrived on the ingress port
fn forwarded(seq: u32, pg: u16, now: SimTime) -> Packet {
    data_packet(
        HOST_A,
        HOST_B,
        UdpHeader {
            source_port: 4000,
            destination_port: 5000,
        },
        SeqTsHeader { seq, ts: now, pg },
        1000,
        now,
    )
    .with_ingress_port(INGRESS)
}

fn pause(time_us: u32, priority: u8, now: SimTime) -> Packet {
    Frame::Pause(PauseHeader::new(time_us, 0, priority)).to_packet(HOST_B, BROADCAST, now)
}

/// Pause frames the switch sent upstream, as (port, header)
fn upstream_pauses(ctx: &MockContext) -> Vec<(PortIndex, PauseHeader)> {
    ctx.port_sends
        .iter()
        .filter_map(|(port, packet)| match Frame::decode(packet) {
            Ok(Frame::Pause(header)) => Some((*port, header)),
            _ => None,
        })
        .collect()
}

fn drain_until(device: &mut QbbNetDevice, ctx: &mut MockContext, limit: SimTime) {
    while let Some(timer) = ctx.pop_next_until(limit) {
        device.on_timer(ctx, timer);
    }
}

fn ecn_sent(ctx: &mut MockContext) -> Vec<Ecn> {
    ctx.take_transmitted()
        .iter()
        .map(|p| p.header.ecn)
        .collect()
}

// ============================================================================
// Upstream PFC
// ============================================================================

#[test]
fn test_ingress_over_limit_pauses_upstream() {
    let buffer = BufferConfig::default().with_pg_shared_limit(4 * CELL_SIZE);
    let (mut port, mut ctx) = switch_port(QbbConfig::default(), buffer);

    // Downstream holds class 3 so everything stays buffered
    port.receive(&mut ctx, pause(100, 3, SimTime::ZERO));
    for seq in 0..3 {
        assert!(port.send(&mut ctx, forwarded(seq, 3, SimTime::ZERO)));
    }
    assert!(ctx.port_sends.is_empty());

    assert!(port.send(&mut ctx, forwarded(3, 3, SimTime::ZERO)));
    let pauses = upstream_pauses(&ctx);
    assert_eq!(pauses.len(), 1);
    let (out, header) = pauses[0];
    assert_eq!(out, INGRESS);
    assert_eq!(header.time_us, 5);
    assert_eq!(header.priority, 3);
    assert_eq!(u64::from(header.qlen), 4 * CELL_SIZE);

    let (_, frame) = &ctx.port_sends[0];
    assert_eq!(frame.header.destination, BROADCAST);
    assert_eq!(frame.header.ttl, 1);

    let recheck = ctx
        .find_timer(|t| matches!(t, DeviceTimer::RecheckPause { .. }))
        .unwrap();
    assert_eq!(recheck.at, SimTime::from_nanos(2_500));
    assert_eq!(
        ctx.traces_matching(|e| matches!(e, TraceEvent::PauseSent { resume: false, .. }))
            .len(),
        1
    );
}

#[test]
fn test_pause_is_refreshed_while_congested() {
    let buffer = BufferConfig::default().with_pg_shared_limit(4 * CELL_SIZE);
    let (mut port, mut ctx) = switch_port(QbbConfig::default(), buffer);
    port.receive(&mut ctx, pause(100, 3, SimTime::ZERO));
    for seq in 0..4 {
        port.send(&mut ctx, forwarded(seq, 3, SimTime::ZERO));
    }

    drain_until(&mut port, &mut ctx, SimTime::from_micros(5));
    let pauses = upstream_pauses(&ctx);
    // Initial pause plus refreshes at 2.5 and 5 microseconds
    assert_eq!(pauses.len(), 3);
    assert!(pauses.iter().all(|(_, h)| h.time_us == 5));
}

#[test]
fn test_drained_ingress_resumes_upstream() {
    let buffer = BufferConfig::default().with_pg_shared_limit(4 * CELL_SIZE);
    let (mut port, mut ctx) = switch_port(QbbConfig::default(), buffer);
    port.receive(&mut ctx, pause(100, 3, SimTime::ZERO));
    for seq in 0..4 {
        port.send(&mut ctx, forwarded(seq, 3, SimTime::ZERO));
    }
    ctx.port_sends.clear();

    // Downstream lets go before the first refresh; the queue drains in 824 ns
    ctx.set_now(SimTime::from_micros(1));
    let now = ctx.now();
    port.receive(&mut ctx, pause(0, 3, now));
    drain_until(&mut port, &mut ctx, SimTime::from_micros(3));

    assert_eq!(ctx.take_transmitted().len(), 4);
    let pauses = upstream_pauses(&ctx);
    assert_eq!(pauses.len(), 1);
    assert_eq!(pauses[0].0, INGRESS);
    assert!(pauses[0].1.is_resume());
    assert_eq!(
        ctx.count_timers(|t| matches!(t, DeviceTimer::RecheckPause { .. })),
        0
    );
    let admission = ctx.admission_ref().unwrap();
    assert!(!admission.is_remote_paused(INGRESS, 3));
}

#[test]
fn test_no_upstream_pause_without_pfc() {
    let buffer = BufferConfig::default().with_pg_shared_limit(CELL_SIZE);
    let (mut port, mut ctx) = switch_port(QbbConfig::default().with_pfc(false), buffer);
    port.send(&mut ctx, forwarded(0, 3, SimTime::ZERO));
    port.send(&mut ctx, forwarded(1, 3, SimTime::ZERO));
    assert!(ctx.port_sends.is_empty());
}

// ============================================================================
// Admission
// ============================================================================

#[test]
fn test_full_buffer_drops_arrivals() {
    let buffer = BufferConfig {
        max_buffer_bytes: 3 * CELL_SIZE,
        ..BufferConfig::default()
    };
    let (mut port, mut ctx) = switch_port(QbbConfig::default(), buffer);
    port.receive(&mut ctx, pause(100, 3, SimTime::ZERO));

    for seq in 0..3 {
        assert!(port.send(&mut ctx, forwarded(seq, 3, SimTime::ZERO)));
    }
    assert!(!port.send(&mut ctx, forwarded(3, 3, SimTime::ZERO)));

    assert_eq!(port.queue().packets_in(3), 3);
    assert_eq!(port.used_buffer(), 3 * CELL_SIZE);
    assert_eq!(
        ctx.traces_matching(|e| matches!(
            e,
            TraceEvent::MacTxDrop {
                reason: DropReason::Admission,
                ..
            }
        ))
        .len(),
        1
    );
}

#[test]
fn test_departures_release_buffer() {
    let (mut port, mut ctx) = switch_port(QbbConfig::default(), BufferConfig::default());
    for seq in 0..3 {
        port.send(&mut ctx, forwarded(seq, 3, SimTime::ZERO));
    }
    drain_until(&mut port, &mut ctx, SimTime::from_micros(10));

    assert_eq!(ctx.take_transmitted().len(), 3);
    let admission = ctx.admission_ref().unwrap();
    assert_eq!(admission.egress_shared_bytes(EGRESS, 3), 0);
    assert_eq!(port.used_buffer(), 0);
}

#[test]
fn test_control_frames_bypass_admission() {
    let buffer = BufferConfig {
        max_buffer_bytes: 0,
        ..BufferConfig::default()
    };
    let (mut port, mut ctx) = switch_port(QbbConfig::default(), buffer);

    assert!(!port.send(&mut ctx, forwarded(0, 3, SimTime::ZERO)));
    let nack = Frame::Nack(QbbHeader::new(5, 3, 4000))
        .to_packet(HOST_B, HOST_A, SimTime::ZERO)
        .with_ingress_port(INGRESS);
    assert!(port.send(&mut ctx, nack));

    let sent = ctx.take_transmitted();
    assert_eq!(sent.len(), 1);
    assert!(matches!(Frame::decode(&sent[0]), Ok(Frame::Nack(_))));
}

#[test]
fn test_ack_is_refused_by_full_buffer() {
    let buffer = BufferConfig {
        max_buffer_bytes: 0,
        ..BufferConfig::default()
    };
    let (mut port, mut ctx) = switch_port(QbbConfig::default(), buffer);

    let ack = Frame::Ack(QbbHeader::new(5, 3, 4000))
        .to_packet(HOST_B, HOST_A, SimTime::ZERO)
        .with_ingress_port(INGRESS);
    assert!(!port.send(&mut ctx, ack));

    assert!(ctx.take_transmitted().is_empty());
    assert_eq!(
        ctx.traces_matching(|e| matches!(
            e,
            TraceEvent::MacTxDrop {
                reason: DropReason::Admission,
                ..
            }
        ))
        .len(),
        1
    );
}

#[test]
fn test_ack_is_queued_in_class_one() {
    let buffer = BufferConfig {
        queue_min_bytes: 0,
        ..BufferConfig::default()
    };
    let (mut port, mut ctx) = switch_port(QbbConfig::default(), buffer);
    port.receive(&mut ctx, pause(100, 1, SimTime::ZERO));

    let ack = Frame::Ack(QbbHeader::new(5, 3, 4000))
        .to_packet(HOST_B, HOST_A, SimTime::ZERO)
        .with_ingress_port(INGRESS);
    assert!(port.send(&mut ctx, ack));

    // Held by the pause on class 1 and counted against the buffer
    assert!(ctx.take_transmitted().is_empty());
    assert_eq!(port.queue().packets_in(1), 1);
    assert!(ctx.admission_ref().unwrap().egress_shared_bytes(EGRESS, 1) > 0);
}

// ============================================================================
// ECN marking
// ============================================================================

#[test]
fn test_standard_marking_follows_egress_depth() {
    let buffer = BufferConfig::default().with_ecn(0, 1, 0.01);
    let (mut port, mut ctx) = switch_port(QbbConfig::default(), buffer);
    for seq in 0..3 {
        port.send(&mut ctx, forwarded(seq, 3, SimTime::ZERO));
    }
    drain_until(&mut port, &mut ctx, SimTime::from_micros(10));

    // Depth left behind each departure: 0, one cell, 0
    assert_eq!(ecn_sent(&mut ctx), vec![Ecn::NotEct, Ecn::Ce, Ecn::NotEct]);
}

#[test]
fn test_standard_marks_packets_held_by_pause() {
    let buffer = BufferConfig::default().with_ecn(0, 1, 0.01);
    let (mut port, mut ctx) = switch_port(QbbConfig::default(), buffer);
    port.receive(&mut ctx, pause(100, 3, SimTime::ZERO));
    for seq in 0..3 {
        port.send(&mut ctx, forwarded(seq, 3, SimTime::ZERO));
    }
    ctx.set_now(SimTime::from_micros(1));
    let now = ctx.now();
    port.receive(&mut ctx, pause(0, 3, now));
    drain_until(&mut port, &mut ctx, SimTime::from_micros(10));

    assert_eq!(ecn_sent(&mut ctx), vec![Ecn::Ce, Ecn::Ce, Ecn::NotEct]);
}

#[test]
fn test_no_pause_marking_spares_paused_backlog() {
    let buffer = BufferConfig::default().with_ecn(0, 1, 0.01);
    let config = QbbConfig::default().with_ecn_variant(EcnVariant::NoPause);
    let (mut port, mut ctx) = switch_port(config, buffer);
    port.receive(&mut ctx, pause(100, 3, SimTime::ZERO));
    for seq in 0..3 {
        port.send(&mut ctx, forwarded(seq, 3, SimTime::ZERO));
    }
    ctx.set_now(SimTime::from_micros(1));
    let now = ctx.now();
    port.receive(&mut ctx, pause(0, 3, now));
    drain_until(&mut port, &mut ctx, SimTime::from_micros(10));

    assert_eq!(ecn_sent(&mut ctx), vec![Ecn::NotEct; 3]);
    assert_eq!(port.marker(3).unwrap().paused_packets(), 0);
}

// ============================================================================
// Receive
// ============================================================================

#[test]
fn test_received_data_is_tagged_and_delivered() {
    let (mut port, mut ctx) = switch_port(QbbConfig::default(), BufferConfig::default());
    let packet = data_packet(
        HOST_B,
        HOST_A,
        UdpHeader {
            source_port: 5000,
            destination_port: 4000,
        },
        SeqTsHeader {
            seq: 0,
            ts: SimTime::ZERO,
            pg: 3,
        },
        1000,
        SimTime::ZERO,
    );
    port.receive(&mut ctx, packet);

    assert_eq!(ctx.delivered.len(), 1);
    assert_eq!(ctx.delivered[0].ingress_port, Some(EGRESS));
    assert!(port.receiver(&qbb_core::FlowKey::new(HOST_B, 5000, 3)).is_none());
}

#[test]
fn test_received_pause_is_consumed() {
    let (mut port, mut ctx) = switch_port(QbbConfig::default(), BufferConfig::default());
    port.receive(&mut ctx, pause(100, 3, SimTime::ZERO));
    assert!(ctx.delivered.is_empty());
    assert!(port.is_paused(3));
    assert!(port.status().contains("q[3]=0"));
}
