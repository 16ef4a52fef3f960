use harvest::gateway::SimulatedGateway;
use harvest::{
    cancel_pair, AppConfig, ApyQuote, ApyRefresher, CancelSignal, ChainGateway, Desk, EntryFailure, Farm,
    FarmId, FailureReason, HarvestError, JobOutcome, FULL_ALLOCATION_BPS,
};
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

fn config() -> AppConfig {
    let mut config = AppConfig::default_config();
    config.executor.poll_interval_ms = 1;
    config.retry.min_delay_ms = 1;
    config.retry.max_delay_ms = 2;
    config
}

fn farms() -> Vec<Farm> {
    vec![
        Farm::new("Aave", 500, 3000),
        Farm::new("Compound", 650, 2000),
        Farm::new("Curve", 800, 4000),
        Farm::new("Yearn", 900, 1000),
    ]
}

async fn desk_with(gateway: Arc<SimulatedGateway>) -> Desk {
    let mut desk = Desk::new(gateway, &config());
    desk.resync().await.unwrap();
    desk
}

fn share(desk: &Desk, farm: &str) -> u32 {
    desk.registry()
        .get(&FarmId::new(farm))
        .unwrap()
        .allocation_bps
}

#[tokio::test]
async fn two_farm_scenario_moves_capped_share() {
    let gateway = Arc::new(SimulatedGateway::new(vec![
        Farm::new("A", 500, 5000),
        Farm::new("B", 800, 5000),
    ]));
    let mut desk = desk_with(gateway).await;

    let plan = desk.plan().unwrap();
    assert_eq!(plan.projected_apy, dec!(740));

    let report = desk.execute(&plan).await.unwrap();
    assert_eq!(report.outcome, JobOutcome::Success);
    assert_eq!(report.progress_pct, 100);
    assert_eq!(share(&desk, "A"), 2000);
    assert_eq!(share(&desk, "B"), 8000);
    assert_eq!(desk.snapshot().blended_apy, Some(dec!(740)));
}

#[tokio::test]
async fn confirmed_job_matches_chain_state() {
    let gateway = Arc::new(SimulatedGateway::new(farms()));
    gateway.set_confirmation_polls(2);
    let mut desk = desk_with(gateway.clone()).await;
    let rx = desk.subscribe();

    let plan = desk.plan().unwrap();
    desk.execute(&plan).await.unwrap();

    for target in &plan.targets {
        assert_eq!(share(&desk, target.farm.as_str()), target.target_bps);
        assert_eq!(
            gateway.farm(&target.farm).unwrap().allocation_bps,
            target.target_bps
        );
    }
    assert!(desk.registry().is_settled());
    assert_eq!(rx.borrow().total_active_allocation, FULL_ALLOCATION_BPS);
}

#[tokio::test]
async fn partial_failure_then_retry_settles_registry() {
    let gateway = Arc::new(SimulatedGateway::new(farms()));
    gateway.reject_farm(&"Curve".into(), FailureReason::UserRejected);
    gateway.revert_farm(&"Compound".into(), FailureReason::Unknown("out of gas".into()));
    let mut desk = desk_with(gateway.clone()).await;

    let plan = desk.plan().unwrap();
    let report = desk.execute(&plan).await.unwrap();

    match &report.outcome {
        JobOutcome::Partial { failed_farms } => {
            assert_eq!(failed_farms.len(), 2);
            assert!(failed_farms.contains(&FarmId::new("Curve")));
            assert!(failed_farms.contains(&FarmId::new("Compound")));
        }
        other => panic!("expected partial outcome, got {other:?}"),
    }
    assert_eq!(share(&desk, "Curve"), 4000);
    assert_eq!(share(&desk, "Compound"), 2000);
    assert!(!desk.registry().is_settled());

    let job = desk.job(report.job_id).unwrap();
    let compound = job
        .entries
        .iter()
        .find(|entry| entry.farm.as_str() == "Compound")
        .unwrap();
    assert!(matches!(compound.failure, Some(EntryFailure::Reverted(_))));

    gateway.allow_farm(&"Curve".into());
    gateway.allow_farm(&"Compound".into());
    let submitted_before = gateway.submit_calls();

    let retried = desk.retry_failed(report.job_id).await.unwrap();
    assert_eq!(retried.outcome, JobOutcome::Success);
    assert_eq!(retried.submissions, 2);
    assert_eq!(gateway.submit_calls(), submitted_before + 2);
    assert!(desk.registry().is_settled());

    let again = desk.retry_failed(report.job_id).await.unwrap();
    assert_eq!(again.submissions, 0);
    assert_eq!(gateway.submit_calls(), submitted_before + 2);
}

#[tokio::test]
async fn plan_after_partial_failure_restores_full_allocation() {
    let gateway = Arc::new(SimulatedGateway::new(farms()));
    gateway.reject_farm(&"Aave".into(), FailureReason::UserRejected);
    let mut desk = desk_with(gateway).await;

    let plan = desk.plan().unwrap();
    desk.execute(&plan).await.unwrap();
    assert!(!desk.registry().is_settled());

    let next = desk.plan().unwrap();
    let total: u32 = next.targets.iter().map(|target| target.target_bps).sum();
    assert_eq!(total, FULL_ALLOCATION_BPS);
}

#[tokio::test]
async fn cancellation_before_execution_submits_nothing() {
    let gateway = Arc::new(SimulatedGateway::new(farms()));
    let mut desk = desk_with(gateway.clone()).await;
    let (canceller, cancel) = cancel_pair();
    canceller.cancel();

    let plan = desk.plan().unwrap();
    let report = desk.execute_cancellable(&plan, &cancel).await.unwrap();

    assert_eq!(report.submissions, 0);
    assert_eq!(report.progress_pct, 0);
    assert_eq!(gateway.submit_calls(), 0);
    assert_eq!(share(&desk, "Aave"), 3000);
}

#[tokio::test]
async fn retry_after_cancellation_submits_discarded_entries() {
    let gateway = Arc::new(SimulatedGateway::new(farms()));
    let mut desk = desk_with(gateway.clone()).await;
    let (canceller, cancel) = cancel_pair();
    canceller.cancel();

    let plan = desk.plan().unwrap();
    let report = desk.execute_cancellable(&plan, &cancel).await.unwrap();
    let retried = desk.retry_failed(report.job_id).await.unwrap();

    assert_eq!(retried.outcome, JobOutcome::Success);
    assert_eq!(retried.submissions, plan.changes().count());
}

#[tokio::test]
async fn refresher_updates_flow_into_the_registry() {
    let gateway = Arc::new(SimulatedGateway::new(farms()));
    let mut desk = desk_with(gateway.clone()).await;
    let mut rx = desk.subscribe();

    let refresher = ApyRefresher::new(
        gateway.clone() as Arc<dyn ChainGateway>,
        &config().refresh,
        config().retry,
    )
    .with_interval(Duration::from_millis(5));
    let (tx, mut updates) = mpsc::channel(1);
    let (canceller, cancel) = cancel_pair();
    let handle = refresher.spawn(tx, cancel);

    gateway.set_farm(Farm::new("Aave", 1200, 3000));
    loop {
        let farms = updates.recv().await.unwrap();
        desk.apply_apy_update(farms).unwrap();
        if desk.registry().get(&"Aave".into()).unwrap().apy_bps == 1200 {
            break;
        }
    }
    canceller.cancel();
    drop(updates);
    handle.await.unwrap();

    assert!(rx.has_changed().unwrap());
    let snapshot = rx.borrow_and_update().clone();
    assert_eq!(snapshot.farms[0].apy_bps, 1200);
    assert_eq!(desk.best_farm().unwrap().id, FarmId::new("Aave"));
}

#[tokio::test]
async fn resync_converts_quoted_apys_before_planning() {
    let gateway = Arc::new(SimulatedGateway::new(vec![
        Farm::new("A", 0, 5000),
        Farm::new("B", 0, 5000),
    ]));
    gateway.quote_apy(&"A".into(), ApyQuote::Percent(dec!(5)));
    gateway.quote_apy(&"B".into(), ApyQuote::Fraction(dec!(0.08)));
    let desk = desk_with(gateway).await;

    assert_eq!(desk.registry().get(&"A".into()).unwrap().apy_bps, 500);
    assert_eq!(desk.registry().get(&"B".into()).unwrap().apy_bps, 800);
    let plan = desk.plan().unwrap();
    assert_eq!(plan.current_apy, dec!(650));
    assert_eq!(plan.projected_apy, dec!(740));
}

#[tokio::test]
async fn deactivated_farm_drops_out_of_plans() {
    let gateway = Arc::new(SimulatedGateway::new(farms()));
    let mut desk = desk_with(gateway).await;

    desk.apply_apy_update(vec![
        Farm::new("Aave", 500, 5000),
        Farm::new("Curve", 800, 5000),
    ])
    .unwrap();

    let plan = desk.plan().unwrap();
    assert_eq!(plan.targets.len(), 2);
    assert!(plan.target_for(&"Yearn".into()).is_none());
    assert!(!desk.registry().get(&"Yearn".into()).unwrap().active);
}

#[tokio::test]
async fn empty_registry_cannot_be_planned() {
    let desk = Desk::new(Arc::new(SimulatedGateway::new(vec![])), &config());
    assert!(matches!(desk.plan(), Err(HarvestError::EmptyRegistry)));
    assert_eq!(desk.snapshot().blended_apy, None);

    // a never-raised signal is usable on its own
    assert!(!CancelSignal::never().is_cancelled());
}
