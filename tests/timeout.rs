mod common;

use captains_log::logfn;
use common::*;
use razor_invoke::*;
use rstest::rstest;
use std::sync::Arc;
use std::sync::mpsc;
use std::time::Duration;

#[logfn]
#[rstest]
fn test_invocation_timeout_on_a_silent_channel(runner: TestRunner) {
    let channel = MockChannel::new(vec![SendOutcome::Hang]);
    let mut target = TargetRef::new(Identity::new("service", ""));
    target.invocation_timeout = Some(Duration::from_millis(100));
    let proxy =
        Proxy::new(
            runner.engine(),
            target,
            registry(),
            FixedResolver::new(Arc::clone(&channel) as Arc<dyn RequestChannel>),
        );
    let (tx, rx) = mpsc::channel();
    let delivery = CallbackDelivery::builder()
        .on_exception(move |ex| tx.send(ex).unwrap())
        .on_response(|_, _| panic!("no response may be delivered after a timeout"))
        .build();

    let started = std::time::Instant::now();
    proxy.invoke_async("greet", b"", delivery).expect("invoke");

    let ex = rx.recv_timeout(Duration::from_secs(2)).expect("exception callback");
    assert_eq!(ex, InvokeError::TimedOut);
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert_eq!(channel.send_count(), 1);
    assert_eq!(channel.canceled_with(), vec![InvokeError::TimedOut]);
}

#[logfn]
#[rstest]
fn test_config_timeout_applies_when_target_has_none(runner: TestRunner) {
    let channel = MockChannel::new(vec![SendOutcome::Hang]);
    let config = ClientConfig {
        invocation_timeout: Some(Duration::from_millis(100)),
        ..Default::default()
    };
    let proxy = proxy_over(runner.engine_with(config), Arc::clone(&channel));
    let delivery = WaitDelivery::new();

    proxy.invoke_async("greet", b"", delivery.clone()).expect("invoke");

    assert_eq!(delivery.wait(), Err(InvokeError::TimedOut));
}

#[logfn]
#[rstest]
fn test_timer_is_disarmed_by_the_reply(runner: TestRunner) {
    let channel = MockChannel::new(vec![SendOutcome::Reply(ok_reply(b"quick"))]);
    let mut target = TargetRef::new(Identity::new("service", ""));
    target.invocation_timeout = Some(Duration::from_millis(50));
    let proxy =
        Proxy::new(
            runner.engine(),
            target,
            registry(),
            FixedResolver::new(Arc::clone(&channel) as Arc<dyn RequestChannel>),
        );
    let delivery = WaitDelivery::new();

    proxy.invoke_async("greet", b"", delivery.clone()).expect("invoke");
    assert_eq!(delivery.wait().expect("reply").payload, b"quick");

    // past the deadline, the outcome must not have been displaced
    std::thread::sleep(Duration::from_millis(150));
    assert_eq!(delivery.poll().unwrap().expect("still the reply").payload, b"quick");
    assert!(channel.canceled_with().is_empty());
}
