//! Integration tests for complete dispatcher runs.
//!
//! Every test drives a real [`Dispatcher`] over scripted in-memory pools and
//! checks what reached the pools and the handlers.

use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::Result;
use volley_core::{EventKind, ExecutionError, Outcome, Request, RequestId};
use volley_dispatch::{
    Context, DispatchError, Dispatcher, Handler, RequestPool, RunOutcome, Stager,
};
use volley_testing::{fast_config, requests, InvocationLog, MockPool, MockReply, TestClock};

fn pools(pools: Vec<MockPool>) -> Vec<Box<dyn RequestPool>> {
    pools.into_iter().map(MockPool::boxed).collect()
}

fn record_everything(dispatcher: &mut Dispatcher, log: &InvocationLog) {
    dispatcher.on(EventKind::Response, log.handler());
    dispatcher.on(EventKind::Error, log.handler());
}

#[tokio::test]
async fn admission_goes_to_the_least_loaded_pool() -> Result<()> {
    let busy = MockPool::new("busy").in_group("api").with_capacity(10).with_outstanding(3);
    let idle = MockPool::new("idle").in_group("api").with_capacity(10).with_outstanding(1);
    let busiest = MockPool::new("busiest").in_group("api").with_capacity(10).with_outstanding(4);
    let probes = [busy.probe(), idle.probe(), busiest.probe()];

    let mut dispatcher = Dispatcher::new(fast_config(50.0), pools(vec![busy, idle, busiest]))?;
    let log = InvocationLog::new();
    record_everything(&mut dispatcher, &log);
    dispatcher.stage_all(requests("http://api.test", 1))?;

    let report = dispatcher.run().await?;

    assert_eq!(report.outcome, RunOutcome::Drained);
    assert_eq!(probes[0].submission_count(), 0);
    assert_eq!(probes[1].submission_count(), 1);
    assert_eq!(probes[2].submission_count(), 0);
    Ok(())
}

#[tokio::test]
async fn every_staged_item_is_dispatched_exactly_once() -> Result<()> {
    let first = MockPool::new("first").with_latency(Duration::from_millis(5));
    let second = MockPool::new("second").with_latency(Duration::from_millis(5));
    let probes = [first.probe(), second.probe()];

    let mut dispatcher = Dispatcher::new(fast_config(200.0), pools(vec![first, second]))?;
    let log = InvocationLog::new();
    record_everything(&mut dispatcher, &log);

    let staged = requests("http://api.test", 40);
    let ids: Vec<RequestId> = staged.iter().map(|request| request.id).collect();
    dispatcher.stage_all(staged)?;

    let report = dispatcher.run().await?;

    assert_eq!(report.outcome, RunOutcome::Drained);
    assert_eq!(report.staged, 40);
    assert_eq!(report.responses, 40);
    assert_eq!(report.admitted, 40);
    assert!(report.tickets_emitted >= report.admitted);
    assert_eq!(probes.iter().map(|probe| probe.submission_count()).sum::<usize>(), 40);
    assert_eq!(log.len().await, 40);
    for id in ids {
        assert_eq!(log.count_for(id).await, 1, "request {id} dispatched more than once");
    }
    assert_eq!(dispatcher.pending(), 0);
    Ok(())
}

#[tokio::test]
async fn admissions_are_paced_by_the_rate() -> Result<()> {
    let pool = MockPool::new("paced").with_latency(Duration::from_millis(1));
    let mut dispatcher = Dispatcher::new(fast_config(50.0), pools(vec![pool]))?;
    let log = InvocationLog::new();
    record_everything(&mut dispatcher, &log);
    dispatcher.stage_all(requests("http://api.test", 25))?;

    let report = dispatcher.run().await?;

    // 25 admissions need 25 tickets spaced more than 20ms apart.
    assert!(report.elapsed >= Duration::from_millis(480), "elapsed {:?}", report.elapsed);
    assert_eq!(report.responses, 25);
    Ok(())
}

// The generator emits only once the clock has moved more than one period
// past the previous emission, whichever task's sleep moved it. A run that
// needed 100 tickets therefore advanced the clock by more than 99 periods.
#[tokio::test]
async fn hundred_items_at_ten_per_second_take_ten_seconds_of_clock_time() -> Result<()> {
    let clock = TestClock::new();
    let mut config = fast_config(10.0);
    config.max_connections = Some(5);
    let pool = MockPool::new("solo").with_latency(Duration::from_millis(2));
    let probe = pool.probe();

    let mut dispatcher = Dispatcher::with_clock(config, pools(vec![pool]), Arc::new(clock.clone()))?;
    let log = InvocationLog::new();
    record_everything(&mut dispatcher, &log);
    dispatcher.stage_all(requests("http://api.test", 100))?;

    let report = dispatcher.run().await?;

    assert_eq!(report.outcome, RunOutcome::Drained);
    assert_eq!(report.responses, 100);
    assert_eq!(log.len().await, 100);
    assert!(report.elapsed >= Duration::from_millis(9_900), "elapsed {:?}", report.elapsed);
    assert!(report.tickets_emitted >= 100);
    assert_eq!(probe.setups(), vec![(8, 5)]);
    assert!(probe.peak_in_flight() <= 5);
    Ok(())
}

#[tokio::test]
#[ignore = "takes ten seconds of wall-clock time"]
async fn hundred_items_at_ten_per_second_take_ten_wall_clock_seconds() -> Result<()> {
    let mut config = fast_config(10.0);
    config.max_connections = Some(5);
    let pool = MockPool::new("solo").with_latency(Duration::from_millis(2));

    let mut dispatcher = Dispatcher::new(config, pools(vec![pool]))?;
    let log = InvocationLog::new();
    record_everything(&mut dispatcher, &log);
    dispatcher.stage_all(requests("http://api.test", 100))?;

    let started = std::time::Instant::now();
    let report = dispatcher.run().await?;
    let wall_clock = started.elapsed();

    assert_eq!(report.outcome, RunOutcome::Drained);
    assert_eq!(log.len().await, 100);
    assert!(wall_clock >= Duration::from_millis(9_900), "wall clock {wall_clock:?}");
    assert!(report.elapsed >= Duration::from_millis(9_900), "elapsed {:?}", report.elapsed);
    Ok(())
}

#[tokio::test]
async fn pools_never_exceed_their_connection_budget() -> Result<()> {
    let mut config = fast_config(200.0);
    config.max_connections = Some(2);
    let pool = MockPool::new("narrow").with_latency(Duration::from_millis(30));
    let probe = pool.probe();

    let mut dispatcher = Dispatcher::new(config, pools(vec![pool]))?;
    let log = InvocationLog::new();
    record_everything(&mut dispatcher, &log);
    dispatcher.stage_all(requests("http://api.test", 10))?;

    let report = dispatcher.run().await?;

    assert_eq!(report.responses, 10);
    assert!(probe.peak_in_flight() <= 2, "peak {}", probe.peak_in_flight());
    Ok(())
}

#[tokio::test]
async fn observed_rate_converges_to_the_configured_rate() -> Result<()> {
    let pool = MockPool::new("steady").with_latency(Duration::from_millis(5));
    let mut dispatcher = Dispatcher::new(fast_config(20.0), pools(vec![pool]))?;
    let log = InvocationLog::new();
    record_everything(&mut dispatcher, &log);
    dispatcher.stage_all(requests("http://api.test", 40))?;

    let report = dispatcher.run().await?;

    let rates = report.rates.expect("telemetry enabled by default");
    assert_eq!(rates.total, 40);
    assert!((rates.average - 20.0).abs() < 4.0, "average {}", rates.average);
    assert!(rates.last_second <= 22);
    assert_eq!(dispatcher.rates(), Some(rates));
    for entry in log.entries().await {
        assert!(entry.rates.is_some());
    }
    Ok(())
}

/// Read-modify-write with a suspension point in the middle.
struct SlowIncrement;

#[async_trait::async_trait]
impl Handler for SlowIncrement {
    async fn handle(&self, _outcome: &Outcome, ctx: &mut Context<'_>) {
        let current = ctx.get("count").ok().flatten().and_then(|value| value.as_u64()).unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(1)).await;
        ctx.set("count", current + 1).ok();
    }
}

#[tokio::test]
async fn store_updates_are_exclusive_across_controllers() -> Result<()> {
    let first = MockPool::new("first").with_latency(Duration::from_millis(2));
    let second = MockPool::new("second").with_latency(Duration::from_millis(2));
    let mut dispatcher = Dispatcher::new(fast_config(500.0), pools(vec![first, second]))?;
    dispatcher.on(EventKind::Response, SlowIncrement);
    dispatcher.stage_all(requests("http://api.test", 30))?;

    let report = dispatcher.run().await?;

    assert_eq!(report.responses, 30);
    assert_eq!(dispatcher.get("count").await?, Some(serde_json::json!(30)));
    Ok(())
}

#[tokio::test]
async fn disabled_features_raise_capability_errors() -> Result<()> {
    let mut config = fast_config(100.0);
    config.use_store = false;
    config.use_rps = false;
    let mut dispatcher = Dispatcher::new(config, pools(vec![MockPool::new("bare")]))?;

    let seen = Arc::new(Mutex::new(Vec::new()));
    {
        let seen = seen.clone();
        dispatcher.on_fn(EventKind::Response, move |_, ctx| {
            let store_error = ctx.get("anything").err();
            let rates = ctx.rates();
            seen.lock().unwrap().push((store_error, rates));
        });
    }
    dispatcher.stage_all(requests("http://api.test", 2))?;

    let report = dispatcher.run().await?;

    assert!(report.rates.is_none());
    assert!(dispatcher.rates().is_none());
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 2);
    for (store_error, rates) in seen.iter() {
        assert!(matches!(store_error, Some(DispatchError::Capability { .. })));
        assert!(rates.is_none());
    }
    assert!(matches!(dispatcher.get("key").await, Err(DispatchError::Capability { .. })));
    assert!(matches!(dispatcher.set("key", 1).await, Err(DispatchError::Capability { .. })));
    assert!(matches!(dispatcher.store(), Err(DispatchError::Capability { .. })));
    Ok(())
}

#[tokio::test]
async fn retries_stop_at_the_bound() -> Result<()> {
    let pool = MockPool::new("failing")
        .with_latency(Duration::from_millis(2))
        .failing_with(ExecutionError::server_error(503, "unavailable"));
    let mut dispatcher = Dispatcher::new(fast_config(200.0), pools(vec![pool]))?;

    let attempts = Arc::new(Mutex::new(Vec::new()));
    {
        let attempts = attempts.clone();
        dispatcher.on_fn(EventKind::Error, move |outcome, ctx| {
            let retry = ctx.retry();
            attempts.lock().unwrap().push((outcome.attempt(), retry));
        });
    }
    dispatcher.stage(volley_core::Request::get("http://api.test/flaky"))?;

    let report = dispatcher.run().await?;

    assert_eq!(report.outcome, RunOutcome::Drained);
    assert_eq!(report.errors, 4);
    assert_eq!(report.retries, 3);
    assert_eq!(report.admitted, 4);
    let attempts = attempts.lock().unwrap();
    assert_eq!(attempts.iter().map(|(attempt, _)| *attempt).collect::<Vec<_>>(), vec![1, 2, 3, 4]);
    assert!(attempts[..3].iter().all(|(_, retry)| retry.is_ok()));
    assert!(matches!(attempts[3].1, Err(DispatchError::RetryLimit { attempts: 4 })));
    Ok(())
}

#[tokio::test]
async fn retried_items_keep_their_identifier() -> Result<()> {
    let pool = MockPool::new("once").with_latency(Duration::from_millis(2)).with_script(|request| {
        if request.attempt == 1 {
            MockReply::Fail(ExecutionError::client_error(429, "slow down"))
        } else {
            MockReply::Respond(200)
        }
    });
    let probe = pool.probe();
    let mut dispatcher = Dispatcher::new(fast_config(200.0), pools(vec![pool]))?;
    dispatcher.on_fn(EventKind::Error, |outcome, ctx| {
        if outcome.as_error().is_some_and(|error| error.error.is_retryable()) {
            ctx.retry().ok();
        }
    });
    let log = InvocationLog::new();
    dispatcher.on(EventKind::Response, log.handler());
    let id = dispatcher.stage(volley_core::Request::get("http://api.test/limited"))?;

    let report = dispatcher.run().await?;

    assert_eq!(report.errors, 1);
    assert_eq!(report.responses, 1);
    let submissions = probe.submissions();
    assert_eq!(submissions.len(), 2);
    assert!(submissions.iter().all(|request| request.id == id));
    assert_eq!(log.entries().await[0].attempt, 2);
    Ok(())
}

#[tokio::test]
async fn exit_hook_stops_admissions_and_abandons_pending_work() -> Result<()> {
    let pool = MockPool::new("slow").with_latency(Duration::from_millis(20));
    let mut dispatcher = Dispatcher::new(fast_config(50.0), pools(vec![pool]))?;
    let log = InvocationLog::new();
    dispatcher.on(EventKind::Response, log.handler());
    dispatcher.on_fn(EventKind::Response, |_, ctx| ctx.exit());
    dispatcher.stage_all(requests("http://api.test", 20))?;

    let report = dispatcher.run().await?;

    assert_eq!(report.outcome, RunOutcome::Exited);
    assert!(report.abandoned > 0);
    assert_eq!(report.responses as usize + report.abandoned, 20);
    assert_eq!(report.admitted, report.responses, "in-flight requests still complete");
    assert_eq!(log.len().await as u64, report.responses);
    assert_eq!(dispatcher.pending(), 0);
    Ok(())
}

#[tokio::test]
async fn lost_pool_reports_its_in_flight_requests_as_errors() -> Result<()> {
    let pool = MockPool::new("flaky").with_latency(Duration::from_millis(5)).crash_after(2);
    let mut dispatcher = Dispatcher::new(fast_config(100.0), pools(vec![pool]))?;
    let log = InvocationLog::new();
    dispatcher.on(EventKind::Response, log.handler());
    let errors = Arc::new(Mutex::new(Vec::new()));
    {
        let errors = errors.clone();
        dispatcher.on_fn(EventKind::Error, move |outcome, _| {
            if let Some(error) = outcome.as_error() {
                errors.lock().unwrap().push(error.error.clone());
            }
        });
    }
    dispatcher.stage_all(requests("http://api.test", 5))?;

    let report = dispatcher.run().await?;

    assert_eq!(report.outcome, RunOutcome::Stalled);
    assert_eq!(report.responses, 2);
    assert_eq!(report.errors, 1);
    assert_eq!(report.abandoned, 2);
    assert_eq!(*errors.lock().unwrap(), vec![ExecutionError::pool_lost("flaky")]);
    Ok(())
}

#[tokio::test]
async fn surviving_pool_keeps_draining_after_another_is_lost() -> Result<()> {
    let flaky = MockPool::new("flaky")
        .in_group("api")
        .with_latency(Duration::from_millis(5))
        .crash_after(1);
    let healthy = MockPool::new("healthy").in_group("api").with_latency(Duration::from_millis(5));
    let mut dispatcher = Dispatcher::new(fast_config(100.0), pools(vec![flaky, healthy]))?;
    let log = InvocationLog::new();
    record_everything(&mut dispatcher, &log);
    dispatcher.stage_all(requests("http://api.test", 12))?;

    let report = dispatcher.run().await?;

    assert_eq!(report.outcome, RunOutcome::Drained);
    assert_eq!(report.errors, 1);
    assert_eq!(report.responses, 11);
    assert_eq!(report.abandoned, 0);
    Ok(())
}

#[tokio::test]
async fn pools_are_reused_by_the_next_run() -> Result<()> {
    let pool = MockPool::new("reused").with_latency(Duration::from_millis(2));
    let probe = pool.probe();
    let mut dispatcher = Dispatcher::new(fast_config(200.0), pools(vec![pool]))?;
    let log = InvocationLog::new();
    record_everything(&mut dispatcher, &log);

    dispatcher.stage_all(requests("http://api.test", 3))?;
    let first = dispatcher.run().await?;
    dispatcher.stage_all(requests("http://api.test", 2))?;
    let second = dispatcher.run().await?;

    assert_eq!(first.responses, 3);
    assert_eq!(second.responses, 2);
    assert_eq!(second.staged, 2);
    assert_eq!(dispatcher.pool_count(), 1);
    assert_eq!(probe.setups().len(), 2);
    assert_eq!(probe.teardown_count(), 2);
    assert_eq!(probe.submission_count(), 5);
    Ok(())
}

#[tokio::test]
async fn staging_is_refused_while_a_run_is_in_progress() -> Result<()> {
    let pool = MockPool::new("busy").with_latency(Duration::from_millis(2));
    let mut dispatcher = Dispatcher::new(fast_config(200.0), pools(vec![pool]))?;
    let stager: Stager = dispatcher.stager();
    let refusals = Arc::new(Mutex::new(Vec::new()));
    {
        let refusals = refusals.clone();
        let stager = stager.clone();
        dispatcher.on_fn(EventKind::Response, move |_, _| {
            let result = stager.stage(volley_core::Request::get("http://api.test/late"));
            refusals.lock().unwrap().push(result.err());
        });
    }
    dispatcher.stage_all(requests("http://api.test", 3))?;

    let report = dispatcher.run().await?;

    assert_eq!(report.responses, 3);
    assert!(refusals
        .lock()
        .unwrap()
        .iter()
        .all(|refusal| matches!(refusal, Some(DispatchError::QueueClosed))));
    stager.stage(volley_core::Request::get("http://api.test/after"))?;
    assert_eq!(dispatcher.pending(), 1);
    Ok(())
}

#[tokio::test]
async fn store_contents_survive_across_runs() -> Result<()> {
    let mut dispatcher = Dispatcher::new(fast_config(200.0), pools(vec![MockPool::new("p")]))?;
    dispatcher.set("seed", 10).await?;
    dispatcher.on_fn(EventKind::Response, |_, ctx| {
        let seed = ctx.get("seed").ok().flatten().and_then(|value| value.as_u64()).unwrap_or(0);
        ctx.set("seed", seed + 1).ok();
    });

    dispatcher.stage_all(requests("http://api.test", 2))?;
    dispatcher.run().await?;
    dispatcher.stage_all(requests("http://api.test", 1))?;
    dispatcher.run().await?;

    assert_eq!(dispatcher.get("seed").await?, Some(serde_json::json!(13)));
    Ok(())
}

#[tokio::test]
async fn panicking_handler_does_not_lose_the_item() -> Result<()> {
    let mut dispatcher = Dispatcher::new(fast_config(200.0), pools(vec![MockPool::new("p")]))?;
    dispatcher.on_fn(EventKind::Response, |_, _| panic!("handler bug"));
    let log = InvocationLog::new();
    dispatcher.on(EventKind::Response, log.handler());
    dispatcher.stage_all(requests("http://api.test", 3))?;

    let report = dispatcher.run().await?;

    assert_eq!(report.outcome, RunOutcome::Drained);
    assert_eq!(log.len().await, 3);
    Ok(())
}

#[tokio::test]
async fn run_without_handlers_is_rejected() -> Result<()> {
    let mut dispatcher = Dispatcher::new(fast_config(10.0), pools(vec![MockPool::new("p")]))?;
    dispatcher.stage_all(requests("http://api.test", 1))?;

    let result = dispatcher.run().await;

    assert!(matches!(result, Err(DispatchError::Configuration { .. })));
    assert_eq!(dispatcher.pending(), 1);
    Ok(())
}

#[tokio::test]
async fn empty_run_drains_immediately() -> Result<()> {
    let pool = MockPool::new("idle");
    let probe = pool.probe();
    let mut dispatcher = Dispatcher::new(fast_config(10.0), pools(vec![pool]))?;
    let log = InvocationLog::new();
    record_everything(&mut dispatcher, &log);

    let report = dispatcher.run().await?;

    assert_eq!(report.outcome, RunOutcome::Drained);
    assert_eq!(report.dispatched(), 0);
    assert!(log.is_empty().await);
    assert_eq!(probe.teardown_count(), 1);
    Ok(())
}

#[tokio::test]
async fn pool_setup_failure_aborts_the_run() -> Result<()> {
    let broken = MockPool::new("broken").failing_setup();
    let healthy = MockPool::new("healthy").with_latency(Duration::from_millis(50));
    let mut dispatcher = Dispatcher::new(fast_config(20.0), pools(vec![broken, healthy]))?;
    let log = InvocationLog::new();
    record_everything(&mut dispatcher, &log);
    dispatcher.stage_all(requests("http://api.test", 10))?;

    let result = dispatcher.run().await;

    assert!(matches!(result, Err(DispatchError::Pool { .. })));
    assert_eq!(dispatcher.pool_count(), 2, "pools are handed back after a failed run");
    assert_eq!(dispatcher.pending(), 0);
    dispatcher.stage_all(requests("http://api.test", 1))?;
    Ok(())
}

#[tokio::test]
async fn controller_panic_is_reported_and_its_pools_are_dropped() -> Result<()> {
    let pool = MockPool::new("explosive").panicking_on_submit();
    let mut dispatcher = Dispatcher::new(fast_config(50.0), pools(vec![pool]))?;
    let log = InvocationLog::new();
    record_everything(&mut dispatcher, &log);
    dispatcher.stage_all(requests("http://api.test", 3))?;

    let result = dispatcher.run().await;

    assert!(matches!(result, Err(DispatchError::ControllerPanic { controller_id: 0, .. })));
    assert_eq!(dispatcher.pool_count(), 0);
    assert!(log.is_empty().await);

    let rerun = dispatcher.run().await;
    assert!(matches!(rerun, Err(DispatchError::Configuration { .. })));
    Ok(())
}

#[tokio::test]
async fn grouped_pools_share_their_ticket_stream() -> Result<()> {
    let pools_in_group: Vec<MockPool> = (0..3)
        .map(|index| {
            MockPool::new(format!("member-{index}"))
                .in_group("shared")
                .with_latency(Duration::from_millis(5))
        })
        .collect();
    let probes: Vec<_> = pools_in_group.iter().map(MockPool::probe).collect();
    let mut dispatcher = Dispatcher::new(fast_config(300.0), pools(pools_in_group))?;
    let log = InvocationLog::new();
    record_everything(&mut dispatcher, &log);
    let staged = requests("http://api.test", 30);
    let expected: HashSet<RequestId> = staged.iter().map(|request| request.id).collect();
    dispatcher.stage_all(staged)?;

    let report = dispatcher.run().await?;

    assert_eq!(report.responses, 30);
    let submitted: HashSet<RequestId> = probes
        .iter()
        .flat_map(|probe| probe.submissions().into_iter().map(|request| request.id))
        .collect();
    assert_eq!(submitted, expected);
    Ok(())
}

#[tokio::test]
async fn items_sharing_an_identifier_each_reach_a_handler() -> Result<()> {
    let pool = MockPool::new("twins").with_capacity(5).with_latency(Duration::from_millis(200));
    let probe = pool.probe();
    let mut dispatcher = Dispatcher::new(fast_config(100.0), pools(vec![pool]))?;
    let log = InvocationLog::new();
    record_everything(&mut dispatcher, &log);

    let request = Request::get("http://api.test/twin");
    let id = dispatcher.stage(request.clone())?;
    dispatcher.stage(request)?;

    let report = dispatcher.run().await?;

    assert_eq!(report.outcome, RunOutcome::Drained);
    assert_eq!(report.staged, 2);
    assert_eq!(report.responses, 2);
    assert_eq!(report.abandoned, 0);
    assert_eq!(probe.peak_in_flight(), 2, "both copies were in flight together");
    assert_eq!(log.count_for(id).await, 2);
    Ok(())
}

#[tokio::test]
async fn lost_pool_fails_every_in_flight_copy_of_an_identifier() -> Result<()> {
    let pool = MockPool::new("fragile")
        .with_capacity(5)
        .with_latency(Duration::from_millis(200))
        .crash_after(1);
    let mut dispatcher = Dispatcher::new(fast_config(100.0), pools(vec![pool]))?;
    let log = InvocationLog::new();
    record_everything(&mut dispatcher, &log);

    let request = Request::get("http://api.test/twin");
    let id = dispatcher.stage(request.clone())?;
    dispatcher.stage(request)?;

    let report = dispatcher.run().await?;

    assert_eq!(report.responses + report.errors, 2);
    assert_eq!(log.count_for(id).await, 2);
    Ok(())
}

#[tokio::test]
async fn rate_without_a_ticket_period_is_rejected() {
    let result = Dispatcher::new(fast_config(1e-20), pools(vec![MockPool::new("slow")]));

    assert!(matches!(result, Err(DispatchError::Configuration { .. })));
}

#[tokio::test]
async fn controllers_stuck_in_teardown_hit_the_shutdown_timeout() -> Result<()> {
    let mut config = fast_config(100.0);
    config.shutdown_timeout = Duration::from_millis(200);
    let pool = MockPool::new("stuck").hanging_on_teardown();
    let probe = pool.probe();
    let mut dispatcher = Dispatcher::new(config, pools(vec![pool]))?;
    let log = InvocationLog::new();
    record_everything(&mut dispatcher, &log);
    dispatcher.stage_all(requests("http://api.test", 2))?;

    let result = tokio::time::timeout(Duration::from_secs(5), dispatcher.run())
        .await
        .expect("run returns once the shutdown timeout elapses");

    assert!(matches!(
        result,
        Err(DispatchError::ShutdownTimeout { timeout }) if timeout == Duration::from_millis(200)
    ));
    assert_eq!(log.len().await, 2);
    assert_eq!(probe.teardown_count(), 1);
    assert_eq!(dispatcher.pool_count(), 0, "aborted controllers take their pools with them");
    assert_eq!(dispatcher.pending(), 0);
    Ok(())
}
