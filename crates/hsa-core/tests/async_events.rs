use hsa_core::{
    HandlerAction, MonitorState, Runtime, RuntimeBuilder, RuntimeConfig, RuntimeError, Signal, SignalCondition,
    VirtualDriver,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

const DELIVERY_TIMEOUT: Duration = Duration::from_secs(5);
const QUIET_PERIOD: Duration = Duration::from_millis(100);

fn open_runtime() -> Runtime {
    hsa_tracing::init_test_logging();
    let runtime = Runtime::new(Arc::new(VirtualDriver::new()));
    runtime.acquire().expect("acquire");
    runtime
}

#[test]
fn handler_fires_once_when_countdown_reaches_zero() {
    let runtime = open_runtime();
    let signal = Signal::new(5);
    let (tx, rx) = mpsc::channel();

    runtime
        .set_async_signal_handler(&signal, SignalCondition::Eq, 0, move |value| {
            tx.send(value).ok();
            HandlerAction::Continue
        })
        .expect("register handler");

    for _ in 0..5 {
        signal.subtract(1);
    }

    assert_eq!(rx.recv_timeout(DELIVERY_TIMEOUT).expect("delivery"), 0);
    assert!(rx.recv_timeout(QUIET_PERIOD).is_err(), "handler fired twice");
    runtime.release();
}

#[test]
fn stop_monitoring_is_final_and_continue_rearms() {
    let runtime = open_runtime();
    let stopping = Signal::new(1);
    let continuing = Signal::new(1);
    let stop_calls = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = mpsc::channel();

    {
        let stop_calls = Arc::clone(&stop_calls);
        runtime
            .set_async_signal_handler(&stopping, SignalCondition::Eq, 0, move |_| {
                stop_calls.fetch_add(1, Ordering::SeqCst);
                HandlerAction::StopMonitoring
            })
            .expect("register stopping handler");
    }
    runtime
        .set_async_signal_handler(&continuing, SignalCondition::Eq, 0, move |value| {
            tx.send(value).ok();
            HandlerAction::Continue
        })
        .expect("register continuing handler");

    for _ in 0..3 {
        stopping.store(0);
        continuing.store(0);
        assert_eq!(rx.recv_timeout(DELIVERY_TIMEOUT).expect("delivery"), 0);
        stopping.store(1);
        continuing.store(1);
    }

    std::thread::sleep(QUIET_PERIOD);
    assert_eq!(stop_calls.load(Ordering::SeqCst), 1);
    runtime.release();
}

#[test]
fn handlers_observe_satisfying_value() {
    let runtime = open_runtime();
    let signal = Signal::new(0);
    let (tx, rx) = mpsc::channel();

    runtime
        .set_async_signal_handler(&signal, SignalCondition::Gte, 100, move |value| {
            tx.send(value).ok();
            HandlerAction::StopMonitoring
        })
        .expect("register handler");

    signal.add(40);
    signal.add(70);
    assert_eq!(rx.recv_timeout(DELIVERY_TIMEOUT).expect("delivery"), 110);
    runtime.release();
}

#[test]
fn panicking_handler_does_not_stop_the_monitor() {
    let runtime = open_runtime();
    let bad = Signal::new(1);
    let good = Signal::new(1);
    let (tx, rx) = mpsc::channel();

    runtime
        .set_async_signal_handler(&bad, SignalCondition::Eq, 0, |_| panic!("handler failure"))
        .expect("register panicking handler");
    bad.store(0);

    runtime
        .set_async_signal_handler(&good, SignalCondition::Eq, 0, move |value| {
            tx.send(value).ok();
            HandlerAction::StopMonitoring
        })
        .expect("register handler");
    good.store(0);

    assert_eq!(rx.recv_timeout(DELIVERY_TIMEOUT).expect("delivery"), 0);
    let session = runtime.session().expect("session");
    assert_eq!(session.monitor().state(), MonitorState::Running);
    drop(session);
    runtime.release();
}

#[test]
fn shutdown_leaves_both_buffers_empty() {
    let runtime = open_runtime();
    let session = runtime.session().expect("session");
    let never = Signal::new(1);

    for _ in 0..16 {
        runtime
            .set_async_signal_handler(&never, SignalCondition::Eq, 0, |_| HandlerAction::Continue)
            .expect("register handler");
    }

    assert!(runtime.release());
    assert_eq!(session.monitor().state(), MonitorState::Stopped);
    assert_eq!(session.monitor().pending_len(), 0);
    assert_eq!(session.monitor().active_len(), 0);

    assert!(matches!(
        session
            .monitor()
            .set_async_signal_handler(&never, SignalCondition::Eq, 0, |_| HandlerAction::Continue),
        Err(RuntimeError::NotInitialized)
    ));
    assert!(matches!(
        runtime.set_async_signal_handler(&never, SignalCondition::Eq, 0, |_| HandlerAction::Continue),
        Err(RuntimeError::NotInitialized)
    ));
}

#[test]
fn no_handler_runs_after_shutdown() {
    let runtime = open_runtime();
    let signal = Signal::new(1);
    let calls = Arc::new(AtomicUsize::new(0));
    {
        let calls = Arc::clone(&calls);
        runtime
            .set_async_signal_handler(&signal, SignalCondition::Eq, 0, move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                HandlerAction::Continue
            })
            .expect("register handler");
    }

    runtime.release();
    signal.store(0);
    std::thread::sleep(QUIET_PERIOD);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[test]
fn polling_mode_delivers_events() {
    let config = RuntimeConfig {
        use_interrupt_wait: false,
        poll_interval: Duration::from_micros(50),
        ..RuntimeConfig::default()
    };
    let runtime = RuntimeBuilder::new(Arc::new(VirtualDriver::new())).config(config).build();
    runtime.acquire().expect("acquire");

    let signal = Signal::new(2);
    let (tx, rx) = mpsc::channel();
    runtime
        .set_async_signal_handler(&signal, SignalCondition::Lt, 1, move |value| {
            tx.send(value).ok();
            HandlerAction::StopMonitoring
        })
        .expect("register handler");

    signal.subtract(2);
    assert_eq!(rx.recv_timeout(DELIVERY_TIMEOUT).expect("delivery"), 0);
    runtime.release();
}
