//! Auxiliaries sharing one transport through a proxy

mod common;

use auxlink_core::{
    AckType, Auxiliary, AuxiliaryConfig, CommandData, CommandType, ControllerContext,
    LoopbackTransport, Message, MessageKind, ProxyAuxiliary, ProxyChannel, ProxyOptions,
    ProxyTarget, ReportType, Routing, TraceConfig, TraceFormat, TransportConfig,
};
use common::ScriptedDevice;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

fn subscriber(name: &str, ctx: &Arc<ControllerContext>, config: AuxiliaryConfig) -> Auxiliary {
    Auxiliary::new(name, config, Arc::new(ProxyChannel::new()), ctx.clone())
}

fn engine_config() -> AuxiliaryConfig {
    AuxiliaryConfig {
        ack_timeout_ms: 200,
        poll_interval_ms: 2,
        ..AuxiliaryConfig::default()
    }
    .proxy_capable()
}

fn fast_options() -> ProxyOptions {
    ProxyOptions {
        poll_interval_ms: 2,
        ..ProxyOptions::default()
    }
}

#[test]
fn two_engines_share_one_device() {
    let ctx = ControllerContext::shared();
    let a = subscriber("fw_a", &ctx, engine_config());
    let b = subscriber("fw_b", &ctx, engine_config());
    let device = ScriptedDevice::new([]);

    let proxy = ProxyAuxiliary::new(
        "uart",
        ProxyTarget::Local(device.clone()),
        &[a.clone(), b.clone()],
        fast_options(),
    )
    .unwrap();

    // Opening the first channel starts the proxy; both handshakes pass through it
    a.create_instance().unwrap();
    b.create_instance().unwrap();
    assert!(proxy.is_running());
    assert_eq!(device.opens(), 1);

    let acked: bool = a
        .run_command(CommandType::TestCaseRun, CommandData::new(4, 2), true, None, false)
        .unwrap();
    assert!(acked);
    let acked: bool = b
        .run_command(CommandType::TestCaseRun, CommandData::new(4, 3), true, None, false)
        .unwrap();
    assert!(acked);

    // Two pings and two test runs, each sent exactly once
    assert_eq!(device.commands_sent(), 4);

    a.delete_instance();
    assert!(proxy.is_running());
    b.delete_instance();
    assert!(!proxy.is_running());
    assert_eq!(device.closes(), 1);
}

#[test]
fn addressed_subscribers_only_take_their_own_reports() {
    let ctx = ControllerContext::shared();
    let config = engine_config().without_handshake();
    let a = subscriber("fw_a", &ctx, config.clone().addressed(1));
    let b = subscriber("fw_b", &ctx, config.addressed(2));
    let device = ScriptedDevice::new([]);

    let _proxy = ProxyAuxiliary::new(
        "uart",
        ProxyTarget::Local(device.clone()),
        &[a.clone(), b.clone()],
        fast_options(),
    )
    .unwrap();
    a.create_instance().unwrap();
    b.create_instance().unwrap();

    let report = Message::new(MessageKind::Report(ReportType::TestPass), 99, 1, 1);
    device.emit_from(&report, Some(1));

    let at_a = a.wait_report(Some(Duration::from_secs(2))).unwrap();
    assert_eq!(at_a.token, 99);
    assert!(b.wait_report(Some(Duration::from_millis(100))).is_none());

    let acks = device
        .sent()
        .iter()
        .filter(|m| m.kind == MessageKind::Ack(AckType::Ack) && m.token == 99)
        .count();
    assert_eq!(acks, 1);

    a.delete_instance();
    b.delete_instance();
}

#[test]
fn trace_records_forwarded_frames() {
    let dir = tempfile::tempdir().unwrap();
    let trace_path = dir.path().join("uart.trace");

    let ctx = ControllerContext::shared();
    let a = subscriber("fw_a", &ctx, AuxiliaryConfig::default().proxy_capable());
    let b = subscriber("fw_b", &ctx, AuxiliaryConfig::default().proxy_capable());
    let real = Arc::new(LoopbackTransport::new());

    let proxy = ProxyAuxiliary::new(
        "uart",
        ProxyTarget::Local(real.clone()),
        &[a.clone(), b.clone()],
        ProxyOptions {
            trace: Some(TraceConfig {
                path: trace_path.clone(),
                format: TraceFormat::Text,
            }),
            ..fast_options()
        },
    )
    .unwrap();

    let chan_a = a.transport();
    let chan_b = b.transport();
    chan_a.open().unwrap();
    chan_b.open().unwrap();

    chan_a.send(b"ping", Routing::to(3)).unwrap();
    // Echo to b, then the loopback hands it back to everyone
    let echo = chan_b.receive(Duration::from_secs(2)).unwrap();
    assert_eq!(echo.msg.as_deref(), Some(&b"ping"[..]));
    let looped = chan_a.receive(Duration::from_secs(2)).unwrap();
    assert_eq!(looped.remote_id, Some(3));

    chan_a.close().unwrap();
    chan_b.close().unwrap();
    drop(proxy);

    let content = std::fs::read_to_string(&trace_path).unwrap();
    let tx_line = content.lines().find(|l| l.contains("TX")).unwrap();
    assert!(tx_line.contains("from=fw_a"));
    assert!(tx_line.contains("id=3"));
    assert!(content.lines().any(|l| l.contains("RX")));
}

#[test]
fn process_mode_end_to_end() {
    let ctx = ControllerContext::shared();
    let a = subscriber("fw_a", &ctx, AuxiliaryConfig::default().proxy_capable());
    let b = subscriber("fw_b", &ctx, AuxiliaryConfig::default().proxy_capable());

    let proxy = ProxyAuxiliary::new(
        "child",
        ProxyTarget::Process(TransportConfig::Loopback),
        &[a.clone(), b.clone()],
        ProxyOptions {
            program: Some(PathBuf::from(env!("CARGO_BIN_EXE_auxlink-proxyd"))),
            ..fast_options()
        },
    )
    .unwrap();

    let chan_a = a.transport();
    let chan_b = b.transport();
    chan_a.open().unwrap();
    chan_b.open().unwrap();
    assert!(proxy.is_running());
    assert!(chan_a.as_proxy_channel().unwrap().physical().is_err());

    chan_b.send(b"\x00\x01\x02", Routing::default()).unwrap();

    // a sees the echo of b's send; b only sees the loopback copy
    let at_a = chan_a.receive(Duration::from_secs(5)).unwrap();
    assert_eq!(at_a.msg.as_deref(), Some(&b"\x00\x01\x02"[..]));
    let at_b = chan_b.receive(Duration::from_secs(5)).unwrap();
    assert_eq!(at_b.msg.as_deref(), Some(&b"\x00\x01\x02"[..]));

    chan_a.close().unwrap();
    chan_b.close().unwrap();
    assert!(!proxy.is_running());
}
