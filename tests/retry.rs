mod common;

use captains_log::logfn;
use common::*;
use razor_invoke::*;
use rstest::rstest;
use std::sync::Arc;
use std::time::Duration;

fn immediate_retries(n: usize) -> ClientConfig {
    ClientConfig { retry_intervals: vec![Duration::ZERO; n], ..Default::default() }
}

#[logfn]
#[rstest]
fn test_retryable_failures_within_budget_succeed(runner: TestRunner) {
    let channel = MockChannel::new(vec![
        SendOutcome::Fail(InvokeError::ConnectFailed("refused".into())),
        SendOutcome::Fail(InvokeError::ConnectFailed("refused".into())),
        SendOutcome::Reply(ok_reply(b"third time")),
    ]);
    let proxy = proxy_over(runner.engine_with(immediate_retries(3)), Arc::clone(&channel));
    let delivery = WaitDelivery::new();

    proxy.invoke_async("greet", b"", delivery.clone()).expect("invoke");

    let reply = delivery.wait().expect("exactly one terminal outcome, a reply");
    assert_eq!(reply.payload, b"third time");
    assert_eq!(channel.send_count(), 3);
}

#[logfn]
#[rstest]
fn test_exhausted_retries_surface_the_original_error(runner: TestRunner) {
    let lost = InvokeError::ConnectionLost("reset".into());
    let channel = MockChannel::new(vec![
        SendOutcome::Fail(lost.clone()),
        SendOutcome::Fail(lost.clone()),
    ]);
    let proxy = proxy_over(runner.engine_with(immediate_retries(1)), Arc::clone(&channel));
    let delivery = WaitDelivery::new();

    proxy.invoke_async("greet", b"", delivery.clone()).expect("invoke");

    assert_eq!(delivery.wait(), Err(lost));
    assert_eq!(channel.send_count(), 2);
}

#[logfn]
#[rstest]
fn test_nonzero_interval_goes_through_the_retry_queue(runner: TestRunner) {
    let channel = MockChannel::new(vec![
        SendOutcome::Fail(InvokeError::ConnectFailed("refused".into())),
        SendOutcome::Reply(ok_reply(b"later")),
    ]);
    let config = ClientConfig {
        retry_intervals: vec![Duration::from_millis(200)],
        ..Default::default()
    };
    let proxy = proxy_over(runner.engine_with(config), Arc::clone(&channel));
    let delivery = WaitDelivery::new();

    let started = std::time::Instant::now();
    proxy.invoke_async("greet", b"", delivery.clone()).expect("invoke");
    // the first attempt failed; the second runs off the queue
    assert_eq!(channel.send_count(), 1);

    let reply = delivery.wait().expect("reply after the delayed retry");
    assert_eq!(reply.payload, b"later");
    assert_eq!(channel.send_count(), 2);
    assert!(started.elapsed() >= Duration::from_millis(200));
}

#[logfn]
#[rstest]
fn test_stale_channel_reresolves_without_a_retry_slot(runner: TestRunner) {
    let channel = MockChannel::new(vec![
        SendOutcome::Fail(InvokeError::StaleChannel),
        SendOutcome::Fail(InvokeError::StaleChannel),
        SendOutcome::Reply(ok_reply(b"fresh")),
    ]);
    // zero retry budget: only the stale loop can reach the third attempt
    let config = ClientConfig { retry_intervals: vec![], ..Default::default() };
    let proxy = proxy_over(runner.engine_with(config), Arc::clone(&channel));
    let delivery = WaitDelivery::new();

    proxy.invoke_async("greet", b"", delivery.clone()).expect("invoke");

    assert_eq!(delivery.wait().expect("reply").payload, b"fresh");
    assert_eq!(channel.send_count(), 3);
}

#[logfn]
#[rstest]
fn test_destroy_aborts_queued_retries_with_shutdown(runner: TestRunner) {
    let channel = MockChannel::new(vec![SendOutcome::Fail(InvokeError::ConnectFailed(
        "refused".into(),
    ))]);
    let config = ClientConfig {
        retry_intervals: vec![Duration::from_secs(60)],
        ..Default::default()
    };
    let engine = runner.engine_with(config);
    let proxy = proxy_over(Arc::clone(&engine), Arc::clone(&channel));
    let delivery = WaitDelivery::new();

    proxy.invoke_async("greet", b"", delivery.clone()).expect("invoke");
    assert_eq!(channel.send_count(), 1);

    engine.destroy();

    assert_eq!(delivery.wait(), Err(InvokeError::Shutdown));
    assert_eq!(channel.send_count(), 1);
}

#[logfn]
#[rstest]
fn test_observer_sees_retries_and_detaches_once(runner: TestRunner) {
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct Counting {
        attached: AtomicU32,
        detached: AtomicU32,
        retried: AtomicU32,
    }

    impl InvocationObserver for Counting {
        fn attach(&self) {
            self.attached.fetch_add(1, Ordering::SeqCst);
        }
        fn detach(&self) {
            self.detached.fetch_add(1, Ordering::SeqCst);
        }
        fn retried(&self) {
            self.retried.fetch_add(1, Ordering::SeqCst);
        }
    }

    let channel = MockChannel::new(vec![
        SendOutcome::Fail(InvokeError::ConnectFailed("refused".into())),
        SendOutcome::Fail(InvokeError::ConnectFailed("refused".into())),
        SendOutcome::Reply(ok_reply(b"done")),
    ]);
    let observer = Arc::new(Counting::default());
    let proxy = Proxy::new(
        runner.engine_with(immediate_retries(3)),
        TargetRef::new(Identity::new("service", "")),
        registry(),
        FixedResolver::new(channel),
    )
    .with_observer(Arc::clone(&observer) as Arc<dyn InvocationObserver>);
    let delivery = WaitDelivery::new();

    proxy.invoke_async("greet", b"", delivery.clone()).expect("invoke");
    delivery.wait().expect("reply");

    assert_eq!(observer.attached.load(Ordering::SeqCst), 1);
    assert_eq!(observer.retried.load(Ordering::SeqCst), 2);
    // detach happens right after the callback the wait saw; give the
    // executor worker a moment
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(observer.detached.load(Ordering::SeqCst), 1);
}

#[logfn]
#[rstest]
fn test_cancel_during_a_retry_delay_is_terminal(runner: TestRunner) {
    let channel = MockChannel::new(vec![SendOutcome::Fail(InvokeError::ConnectFailed(
        "refused".into(),
    ))]);
    let config = ClientConfig {
        retry_intervals: vec![Duration::from_millis(300)],
        ..Default::default()
    };
    let proxy = proxy_over(runner.engine_with(config), Arc::clone(&channel));
    let delivery = WaitDelivery::new();

    let out = proxy.invoke_async("greet", b"", delivery.clone()).expect("invoke");
    assert_eq!(channel.send_count(), 1);

    // the invocation is parked in the retry queue; cancel must reach it there
    out.cancel();
    assert_eq!(delivery.wait(), Err(InvokeError::Canceled));

    // the armed retry must not fire after the terminal outcome
    std::thread::sleep(Duration::from_millis(500));
    assert_eq!(channel.send_count(), 1);
    // the dead attempt's channel is not the cancellation route anymore
    assert!(channel.canceled_with().is_empty());
}

#[logfn]
#[rstest]
fn test_cancel_terminates_a_queued_request_without_retry(runner: TestRunner) {
    let channel = MockChannel::new(vec![SendOutcome::Hang]);
    let proxy = proxy_over(runner.engine_with(immediate_retries(5)), Arc::clone(&channel));
    let delivery = WaitDelivery::new();

    let out = proxy.invoke_async("greet", b"", delivery.clone()).expect("invoke");
    out.cancel();

    // cancellation is terminal even with retry budget left
    assert_eq!(delivery.wait(), Err(InvokeError::Canceled));
    assert_eq!(channel.send_count(), 1);
    assert_eq!(channel.canceled_with(), vec![InvokeError::Canceled]);
}
