//! End-to-end lifecycle scenarios driven against the paper gateway and a
//! scratch SQLite store. Time is simulated by passing explicit instants to
//! the engine's manual processing entry point.

use chrono::{DateTime, Duration, Utc};
use rust_decimal_macros::dec;
use std::sync::Arc;

use sentra::config::{
    AppConfig, IbGatewayConfig, LimitsConfig, LoggingConfig, RuntimeConfig, VerificationConfig,
    WorkerConfig,
};
use sentra::domain::{
    ConditionItem, ConditionLogic, ConditionType, ExpireMode, Metric, Operator, OrderSide,
    OrderType, PriceBasis, StrategyStatus, StrategySymbol, SymbolTradeType, TimeInForce,
    TradeAction, TradeType, TriggerMode,
};
use sentra::engine::activation::{ActivationHandler, ChainActivation};
use sentra::engine::expiry::ExpiryHandler;
use sentra::engine::scheduler::WorkerEngine;
use sentra::engine::EngineContext;
use sentra::gateway::{GatewayBars, GatewayClient, PaperGateway};
use sentra::marketdata::{ContractRef, HistoricalBar, MarketDataCache};
use sentra::rules::RulesConfig;
use sentra::store::{CreateStrategyInput, SentraStore};
use sentra::SentraError;

struct Harness {
    ctx: Arc<EngineContext>,
    engine: Arc<WorkerEngine>,
    gateway: Arc<PaperGateway>,
    _tmp: tempfile::TempDir,
}

fn test_config() -> AppConfig {
    AppConfig {
        ib_gateway: IbGatewayConfig {
            host: "127.0.0.1".to_string(),
            paper_port: 4002,
            live_port: 4001,
            client_id: 1,
            timeout_seconds: 5,
            account_code: String::new(),
            trading_mode: "paper".to_string(),
        },
        runtime: RuntimeConfig::default(),
        worker: WorkerConfig::default(),
        verification: VerificationConfig::default(),
        limits: LimitsConfig::default(),
        logging: LoggingConfig::default(),
        api_port: 0,
    }
}

async fn harness_with(tweak: impl FnOnce(&mut AppConfig)) -> Harness {
    let tmp = tempfile::tempdir().unwrap();
    let mut config = test_config();
    tweak(&mut config);

    let db_path = tmp.path().join("engine.sqlite3");
    let store = SentraStore::connect(
        db_path.to_str().unwrap(),
        config.limits.max_conditions_per_strategy,
    )
    .await
    .unwrap();
    store.migrate().await.unwrap();

    let gateway = Arc::new(PaperGateway::new(false));
    let dyn_gateway: Arc<dyn GatewayClient> = gateway.clone();
    let cache_path = tmp.path().join("cache.sqlite3");
    let cache = Arc::new(
        MarketDataCache::connect(
            cache_path.to_str().unwrap(),
            Arc::new(GatewayBars::new(dyn_gateway.clone())),
        )
        .await
        .unwrap(),
    );
    let rules = RulesConfig::load_from(None).unwrap();

    let ctx = Arc::new(EngineContext::new(
        store,
        cache,
        dyn_gateway,
        None,
        config,
        rules,
    ));
    let engine = WorkerEngine::new(ctx.clone());
    Harness {
        ctx,
        engine,
        gateway,
        _tmp: tmp,
    }
}

async fn harness() -> Harness {
    harness_with(|_| {}).await
}

fn base_time() -> DateTime<Utc> {
    Utc::now() - Duration::hours(3)
}

fn minute(base: DateTime<Utc>, minutes: i64) -> DateTime<Utc> {
    base + Duration::minutes(minutes)
}

fn bar(ts: DateTime<Utc>, price: f64) -> HistoricalBar {
    HistoricalBar::new(ts, price, price, price, price)
}

fn price_condition(operator: Operator, value: f64) -> ConditionItem {
    ConditionItem {
        condition_id: None,
        condition_type: ConditionType::SingleProduct,
        metric: Metric::Price,
        trigger_mode: TriggerMode::LevelInstant,
        evaluation_window: "1m".to_string(),
        window_price_basis: PriceBasis::Close,
        operator,
        value,
        product: Some("SLV".to_string()),
        product_b: None,
        contract_id: None,
        contract_id_b: None,
    }
}

fn drawdown_condition(value: f64) -> ConditionItem {
    ConditionItem {
        condition_id: None,
        condition_type: ConditionType::SingleProduct,
        metric: Metric::DrawdownPct,
        trigger_mode: TriggerMode::LevelInstant,
        evaluation_window: "1m".to_string(),
        window_price_basis: PriceBasis::Close,
        operator: Operator::Gte,
        value,
        product: Some("SLV".to_string()),
        product_b: None,
        contract_id: None,
        contract_id_b: None,
    }
}

fn stock_action(side: OrderSide, quantity: rust_decimal::Decimal, cancel_on_expiry: bool) -> TradeAction {
    TradeAction::StockTrade {
        symbol: "SLV".to_string(),
        side,
        quantity,
        order_type: OrderType::Market,
        limit_price: None,
        tif: TimeInForce::Day,
        allow_overnight: false,
        cancel_on_expiry,
    }
}

fn create_input(
    id: &str,
    trade_type: TradeType,
    symbols: Vec<StrategySymbol>,
    conditions: Vec<ConditionItem>,
    trade_action: Option<TradeAction>,
    next_strategy_id: Option<&str>,
) -> CreateStrategyInput {
    CreateStrategyInput {
        id: Some(id.to_string()),
        idempotency_key: None,
        description: format!("test strategy {id}"),
        market: "US_STOCK".to_string(),
        trade_type,
        symbols,
        currency: None,
        upstream_only_activation: false,
        expire_mode: ExpireMode::Relative,
        expire_in_seconds: Some(172_800),
        expire_at: None,
        condition_logic: ConditionLogic::And,
        conditions,
        trade_action,
        next_strategy_id: next_strategy_id.map(str::to_string),
        next_strategy_note: None,
    }
}

fn slv_contract() -> ContractRef {
    ContractRef::new("US_STOCK", "SLV")
}

async fn status_of(h: &Harness, id: &str) -> StrategyStatus {
    h.ctx.store.get_strategy(id).await.unwrap().status
}

/// Instants survive a store round-trip at sub-second precision; compare
/// with a tolerance rather than bit-for-bit.
fn close_to(a: DateTime<Utc>, b: DateTime<Utc>) -> bool {
    (a - b).num_milliseconds().abs() < 1000
}

async fn step(h: &Harness, id: &str, now: DateTime<Utc>) {
    h.engine.process_strategy_at(id, now).await.unwrap();
}

#[tokio::test]
async fn price_trigger_fills_exactly_one_order() {
    let h = harness().await;
    let t0 = base_time();

    h.ctx
        .store
        .create_strategy(create_input(
            "S-PRICE",
            TradeType::Buy,
            vec![StrategySymbol::new("SLV", SymbolTradeType::Buy)],
            vec![price_condition(Operator::Lte, 60.0)],
            Some(stock_action(OrderSide::Buy, dec!(100), false)),
            None,
        ))
        .await
        .unwrap();

    h.ctx.store.activate("S-PRICE").await.unwrap();
    assert_eq!(status_of(&h, "S-PRICE").await, StrategyStatus::Verifying);

    // Preflight commits VERIFYING -> ACTIVE at the simulated activation time.
    step(&h, "S-PRICE", minute(t0, 0)).await;
    assert_eq!(status_of(&h, "S-PRICE").await, StrategyStatus::Active);

    // Price walks down toward the threshold; nothing at/below 60 yet.
    h.gateway.push_bars(
        &slv_contract(),
        "1m",
        vec![
            bar(minute(t0, 1), 61.2),
            bar(minute(t0, 2), 60.8),
            bar(minute(t0, 3), 60.4),
        ],
    );
    step(&h, "S-PRICE", minute(t0, 5)).await;
    assert_eq!(status_of(&h, "S-PRICE").await, StrategyStatus::Active);

    // The 60.0 bar satisfies <= 60 on the latest basis.
    h.gateway
        .push_bars(&slv_contract(), "1m", vec![bar(minute(t0, 6), 60.0)]);
    step(&h, "S-PRICE", minute(t0, 8)).await;
    assert_eq!(status_of(&h, "S-PRICE").await, StrategyStatus::Triggered);

    // Verification + submission
    step(&h, "S-PRICE", minute(t0, 8)).await;
    assert_eq!(status_of(&h, "S-PRICE").await, StrategyStatus::OrderSubmitted);
    assert_eq!(h.gateway.submitted_order_count(), 1);

    let orders = h.ctx.store.orders_for_strategy("S-PRICE").await.unwrap();
    assert_eq!(orders.len(), 1);
    let ib_order_id = orders[0].ib_order_id.unwrap();

    // Simulated fill closes the lifecycle.
    h.gateway.fill_order(ib_order_id, dec!(59.95)).unwrap();
    step(&h, "S-PRICE", minute(t0, 9)).await;
    assert_eq!(status_of(&h, "S-PRICE").await, StrategyStatus::Filled);

    // At-most-once: still exactly one gateway order after extra cycles.
    step(&h, "S-PRICE", minute(t0, 10)).await;
    assert_eq!(h.gateway.submitted_order_count(), 1);

    let record = h.ctx.store.get_strategy("S-PRICE").await.unwrap();
    // relative expiry resolved against activated_at
    assert!(close_to(
        record.expire_at.unwrap(),
        record.activated_at.unwrap() + Duration::seconds(172_800)
    ));
}

#[tokio::test]
async fn chained_drawdown_strategies_activate_and_trigger() {
    let h = harness().await;
    let t0 = base_time();

    // S2 <- S1 <- S0, built leaves-first.
    h.ctx
        .store
        .create_strategy({
            let mut input = create_input(
                "S2",
                TradeType::Sell,
                vec![StrategySymbol::new("SLV", SymbolTradeType::Sell)],
                vec![drawdown_condition(0.2)],
                Some(stock_action(OrderSide::Sell, dec!(100), false)),
                None,
            );
            input.upstream_only_activation = true;
            input
        })
        .await
        .unwrap();
    h.ctx
        .store
        .create_strategy({
            let mut input = create_input(
                "S1",
                TradeType::Sell,
                vec![StrategySymbol::new("SLV", SymbolTradeType::Sell)],
                vec![drawdown_condition(0.1)],
                Some(stock_action(OrderSide::Sell, dec!(100), false)),
                Some("S2"),
            );
            input.upstream_only_activation = true;
            input
        })
        .await
        .unwrap();
    h.ctx
        .store
        .create_strategy(create_input(
            "S0",
            TradeType::Buy,
            vec![StrategySymbol::new("SLV", SymbolTradeType::Buy)],
            vec![price_condition(Operator::Gte, 100.0)],
            None, // pure chain gate
            Some("S1"),
        ))
        .await
        .unwrap();

    // Manual activation of an upstream-only strategy is forbidden.
    let err = h.ctx.store.activate("S1").await.unwrap_err();
    assert!(matches!(err, SentraError::UpstreamOnlyActivation(_)));

    h.ctx.store.activate("S0").await.unwrap();
    step(&h, "S0", minute(t0, 0)).await;
    assert_eq!(status_of(&h, "S0").await, StrategyStatus::Active);

    // 95 does not trigger, 101 does.
    h.gateway
        .push_bars(&slv_contract(), "1m", vec![bar(minute(t0, 0), 95.0)]);
    step(&h, "S0", minute(t0, 1)).await;
    assert_eq!(status_of(&h, "S0").await, StrategyStatus::Active);

    h.gateway
        .push_bars(&slv_contract(), "1m", vec![bar(minute(t0, 2), 101.0)]);
    step(&h, "S0", minute(t0, 3)).await;
    assert_eq!(status_of(&h, "S0").await, StrategyStatus::Triggered);

    // TRIGGERED handler: chain-activates S1 and retires the gate as FILLED.
    step(&h, "S0", minute(t0, 3)).await;
    assert_eq!(status_of(&h, "S0").await, StrategyStatus::Filled);
    assert_eq!(status_of(&h, "S1").await, StrategyStatus::Verifying);

    step(&h, "S1", minute(t0, 3)).await;
    let s1 = h.ctx.store.get_strategy("S1").await.unwrap();
    assert_eq!(s1.status, StrategyStatus::Active);
    assert!(close_to(s1.logical_activated_at.unwrap(), minute(t0, 3)));
    assert_eq!(s1.upstream_strategy_id.as_deref(), Some("S0"));
    // anchor snapshot from the latest bar at the trigger moment
    assert_eq!(s1.anchor_price, Some(101.0));

    // Rally to 112 then ease: drawdown from the since-activation high.
    h.gateway.push_bars(
        &slv_contract(),
        "1m",
        vec![bar(minute(t0, 40), 112.0), bar(minute(t0, 41), 110.0)],
    );
    step(&h, "S1", minute(t0, 42)).await;
    assert_eq!(status_of(&h, "S1").await, StrategyStatus::Active);

    // 100.7 is just past a 10% drawdown from the 112 high.
    h.gateway
        .push_bars(&slv_contract(), "1m", vec![bar(minute(t0, 45), 100.7)]);
    step(&h, "S1", minute(t0, 46)).await;
    assert_eq!(status_of(&h, "S1").await, StrategyStatus::Triggered);

    step(&h, "S1", minute(t0, 46)).await;
    assert_eq!(status_of(&h, "S1").await, StrategyStatus::OrderSubmitted);
    assert_eq!(status_of(&h, "S2").await, StrategyStatus::Verifying);
    assert_eq!(h.ctx.store.activation_count("S2").await.unwrap(), 1);

    step(&h, "S2", minute(t0, 46)).await;
    let s2 = h.ctx.store.get_strategy("S2").await.unwrap();
    assert_eq!(s2.status, StrategyStatus::Active);
    assert!(close_to(s2.logical_activated_at.unwrap(), minute(t0, 46)));

    // S2 sees its own rally to 112, then 89.5 = just past 20% off that high.
    h.gateway
        .push_bars(&slv_contract(), "1m", vec![bar(minute(t0, 50), 112.0)]);
    step(&h, "S2", minute(t0, 51)).await;
    assert_eq!(status_of(&h, "S2").await, StrategyStatus::Active);

    h.gateway
        .push_bars(&slv_contract(), "1m", vec![bar(minute(t0, 55), 89.5)]);
    step(&h, "S2", minute(t0, 56)).await;
    assert_eq!(status_of(&h, "S2").await, StrategyStatus::Triggered);

    // S1's order fills.
    let orders = h.ctx.store.orders_for_strategy("S1").await.unwrap();
    assert_eq!(orders.len(), 1);
    h.gateway
        .fill_order(orders[0].ib_order_id.unwrap(), dec!(100.5))
        .unwrap();
    step(&h, "S1", minute(t0, 47)).await;
    assert_eq!(status_of(&h, "S1").await, StrategyStatus::Filled);
}

#[tokio::test]
async fn chain_activation_is_at_most_once_per_trigger_event() {
    let h = harness().await;
    let t0 = base_time();

    h.ctx
        .store
        .create_strategy({
            let mut input = create_input(
                "DOWN",
                TradeType::Buy,
                vec![StrategySymbol::new("SLV", SymbolTradeType::Buy)],
                vec![price_condition(Operator::Lte, 60.0)],
                Some(stock_action(OrderSide::Buy, dec!(10), false)),
                None,
            );
            input.upstream_only_activation = true;
            input
        })
        .await
        .unwrap();
    let upstream = h
        .ctx
        .store
        .create_strategy(create_input(
            "UP",
            TradeType::Buy,
            vec![StrategySymbol::new("SLV", SymbolTradeType::Buy)],
            vec![price_condition(Operator::Gte, 100.0)],
            None,
            Some("DOWN"),
        ))
        .await
        .unwrap();

    let first = ActivationHandler::activate_downstream(
        &h.ctx,
        &upstream,
        "evt-1",
        minute(t0, 0),
        minute(t0, 0),
    )
    .await
    .unwrap();
    assert_eq!(first, ChainActivation::Activated);

    // A retried handler sees the downstream already out of
    // PENDING_ACTIVATION and skips.
    let second = ActivationHandler::activate_downstream(
        &h.ctx,
        &upstream,
        "evt-1",
        minute(t0, 0),
        minute(t0, 1),
    )
    .await
    .unwrap();
    assert_eq!(second, ChainActivation::Skipped);

    // The unique (trigger_event_id, downstream) row itself also dedups a
    // raced insert at the store level.
    let raced = h
        .ctx
        .store
        .chain_activate(
            "UP",
            "DOWN",
            "evt-1",
            minute(t0, 0),
            None,
            None,
            None,
            minute(t0, 1),
        )
        .await
        .unwrap();
    assert!(!raced);
    assert_eq!(h.ctx.store.activation_count("DOWN").await.unwrap(), 1);
}

#[tokio::test]
async fn pair_spread_confirm_waits_for_consecutive_bars() {
    let h = harness().await;
    let t0 = base_time();
    let spy = ContractRef::new("US_STOCK", "SPY");
    let qqq = ContractRef::new("US_STOCK", "QQQ");

    let condition = ConditionItem {
        condition_id: None,
        condition_type: ConditionType::PairProducts,
        metric: Metric::Spread,
        trigger_mode: TriggerMode::LevelConfirm,
        evaluation_window: "1h".to_string(),
        window_price_basis: PriceBasis::Close,
        operator: Operator::Lte,
        value: -120.0,
        product: Some("SPY".to_string()),
        product_b: Some("QQQ".to_string()),
        contract_id: None,
        contract_id_b: None,
    };
    h.ctx
        .store
        .create_strategy(create_input(
            "S-SPREAD",
            TradeType::Buy,
            vec![
                StrategySymbol::new("SPY", SymbolTradeType::Buy),
                StrategySymbol::new("QQQ", SymbolTradeType::Ref),
            ],
            vec![condition],
            Some(TradeAction::StockTrade {
                symbol: "SPY".to_string(),
                side: OrderSide::Buy,
                quantity: dec!(10),
                order_type: OrderType::Market,
                limit_price: None,
                tif: TimeInForce::Day,
                allow_overnight: false,
                cancel_on_expiry: false,
            }),
            None,
        ))
        .await
        .unwrap();

    h.ctx.store.activate("S-SPREAD").await.unwrap();
    step(&h, "S-SPREAD", minute(t0, 0)).await;
    assert_eq!(status_of(&h, "S-SPREAD").await, StrategyStatus::Active);

    // 1h LEVEL_CONFIRM runs on 5m base bars with confirm_consecutive=2.
    h.gateway.push_bars(
        &spy,
        "5m",
        vec![bar(minute(t0, 0), 480.0), bar(minute(t0, 5), 480.0)],
    );
    h.gateway.push_bars(
        &qqq,
        "5m",
        vec![bar(minute(t0, 0), 590.0), bar(minute(t0, 5), 601.0)],
    );
    // spreads: -110, -121 -- only one satisfying bar, not confirmed
    step(&h, "S-SPREAD", minute(t0, 7)).await;
    assert_eq!(status_of(&h, "S-SPREAD").await, StrategyStatus::Active);

    // Second consecutive satisfying bar confirms.
    h.gateway.push_bars(&spy, "5m", vec![bar(minute(t0, 10), 479.0)]);
    h.gateway.push_bars(&qqq, "5m", vec![bar(minute(t0, 10), 600.0)]);
    step(&h, "S-SPREAD", minute(t0, 17)).await;
    assert_eq!(status_of(&h, "S-SPREAD").await, StrategyStatus::Triggered);
}

#[tokio::test]
async fn expiry_cancels_in_flight_order_when_configured() {
    let h = harness().await;
    let t0 = base_time();

    let mut input = create_input(
        "S-EXP",
        TradeType::Buy,
        vec![StrategySymbol::new("SLV", SymbolTradeType::Buy)],
        vec![price_condition(Operator::Lte, 60.0)],
        Some(stock_action(OrderSide::Buy, dec!(10), true)),
        None,
    );
    input.expire_in_seconds = Some(3600);
    h.ctx.store.create_strategy(input).await.unwrap();

    h.ctx.store.activate("S-EXP").await.unwrap();
    step(&h, "S-EXP", minute(t0, 0)).await;
    h.gateway
        .push_bars(&slv_contract(), "1m", vec![bar(minute(t0, 5), 59.0)]);
    step(&h, "S-EXP", minute(t0, 6)).await;
    step(&h, "S-EXP", minute(t0, 6)).await;
    assert_eq!(status_of(&h, "S-EXP").await, StrategyStatus::OrderSubmitted);

    // Before expiry the sweep leaves the order alone.
    ExpiryHandler::sweep(&h.ctx, minute(t0, 30)).await.unwrap();
    assert_eq!(status_of(&h, "S-EXP").await, StrategyStatus::OrderSubmitted);

    // expire_at = activated_at + 3600s = t0 + 60m
    ExpiryHandler::sweep(&h.ctx, minute(t0, 61)).await.unwrap();
    assert_eq!(status_of(&h, "S-EXP").await, StrategyStatus::OrderSubmitted);

    // The gateway acked the cancel; the next status sync settles CANCELLED.
    step(&h, "S-EXP", minute(t0, 62)).await;
    assert_eq!(status_of(&h, "S-EXP").await, StrategyStatus::Cancelled);
}

#[tokio::test]
async fn expiry_keeps_tracking_when_cancel_on_expiry_is_off() {
    let h = harness().await;
    let t0 = base_time();

    let mut input = create_input(
        "S-KEEP",
        TradeType::Buy,
        vec![StrategySymbol::new("SLV", SymbolTradeType::Buy)],
        vec![price_condition(Operator::Lte, 60.0)],
        Some(stock_action(OrderSide::Buy, dec!(10), false)),
        None,
    );
    input.expire_in_seconds = Some(3600);
    h.ctx.store.create_strategy(input).await.unwrap();

    h.ctx.store.activate("S-KEEP").await.unwrap();
    step(&h, "S-KEEP", minute(t0, 0)).await;
    h.gateway
        .push_bars(&slv_contract(), "1m", vec![bar(minute(t0, 5), 59.0)]);
    step(&h, "S-KEEP", minute(t0, 6)).await;
    step(&h, "S-KEEP", minute(t0, 6)).await;
    assert_eq!(status_of(&h, "S-KEEP").await, StrategyStatus::OrderSubmitted);

    // Past expiry, the strategy stays ORDER_SUBMITTED and keeps tracking.
    ExpiryHandler::sweep(&h.ctx, minute(t0, 61)).await.unwrap();
    step(&h, "S-KEEP", minute(t0, 62)).await;
    assert_eq!(status_of(&h, "S-KEEP").await, StrategyStatus::OrderSubmitted);

    // A late fill still wins.
    let orders = h.ctx.store.orders_for_strategy("S-KEEP").await.unwrap();
    h.gateway
        .fill_order(orders[0].ib_order_id.unwrap(), dec!(58.9))
        .unwrap();
    step(&h, "S-KEEP", minute(t0, 63)).await;
    assert_eq!(status_of(&h, "S-KEEP").await, StrategyStatus::Filled);
}

#[tokio::test]
async fn chain_cycle_is_rejected() {
    let h = harness().await;

    h.ctx
        .store
        .create_strategy(create_input(
            "CYC-A",
            TradeType::Buy,
            vec![StrategySymbol::new("SLV", SymbolTradeType::Buy)],
            vec![price_condition(Operator::Lte, 60.0)],
            None,
            Some("CYC-B"),
        ))
        .await
        .unwrap();
    let b = h
        .ctx
        .store
        .create_strategy(create_input(
            "CYC-B",
            TradeType::Buy,
            vec![StrategySymbol::new("SLV", SymbolTradeType::Buy)],
            vec![price_condition(Operator::Lte, 50.0)],
            None,
            None,
        ))
        .await
        .unwrap();

    let err = h
        .ctx
        .store
        .put_actions(
            "CYC-B",
            sentra::store::ActionsPutInput {
                trade_action: None,
                next_strategy_id: Some("CYC-A".to_string()),
                next_strategy_note: None,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SentraError::CycleDetected { .. }));
    assert_eq!(err.code(), "CYCLE_DETECTED");

    // The rejected write left CYC-B untouched.
    let reloaded = h.ctx.store.get_strategy("CYC-B").await.unwrap();
    assert_eq!(reloaded.version, b.version);
    assert!(reloaded.next_strategy_id.is_none());

    // Self-reference is rejected outright.
    let err = h
        .ctx
        .store
        .put_actions(
            "CYC-B",
            sentra::store::ActionsPutInput {
                trade_action: None,
                next_strategy_id: Some("CYC-B".to_string()),
                next_strategy_note: None,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SentraError::Validation(_)));
}

#[tokio::test]
async fn idempotent_create_returns_existing_strategy() {
    let h = harness().await;

    let mut first = create_input(
        "IDEM-1",
        TradeType::Buy,
        vec![StrategySymbol::new("SLV", SymbolTradeType::Buy)],
        vec![price_condition(Operator::Lte, 60.0)],
        Some(stock_action(OrderSide::Buy, dec!(10), false)),
        None,
    );
    first.idempotency_key = Some("key-123".to_string());
    let created = h.ctx.store.create_strategy(first).await.unwrap();

    let mut second = create_input(
        "IDEM-2",
        TradeType::Buy,
        vec![StrategySymbol::new("SLV", SymbolTradeType::Buy)],
        vec![price_condition(Operator::Lte, 55.0)],
        None,
        None,
    );
    second.id = None;
    second.idempotency_key = Some("key-123".to_string());
    let collided = h.ctx.store.create_strategy(second).await.unwrap();

    assert_eq!(collided.id, created.id);
    assert_eq!(h.ctx.store.list_strategies().await.unwrap().len(), 1);
}

#[tokio::test]
async fn verification_reject_fails_strategy_without_an_order() {
    let h = harness_with(|config| {
        config.verification.max_notional_usd = dec!(5000);
    })
    .await;
    let t0 = base_time();

    h.ctx
        .store
        .create_strategy(create_input(
            "S-VER",
            TradeType::Buy,
            vec![StrategySymbol::new("SLV", SymbolTradeType::Buy)],
            vec![price_condition(Operator::Lte, 60.0)],
            Some(TradeAction::StockTrade {
                symbol: "SLV".to_string(),
                side: OrderSide::Buy,
                quantity: dec!(100),
                order_type: OrderType::Limit,
                limit_price: Some(dec!(60)),
                tif: TimeInForce::Day,
                allow_overnight: false,
                cancel_on_expiry: false,
            }),
            None,
        ))
        .await
        .unwrap();

    h.ctx.store.activate("S-VER").await.unwrap();
    step(&h, "S-VER", minute(t0, 0)).await;
    h.gateway
        .push_bars(&slv_contract(), "1m", vec![bar(minute(t0, 2), 59.5)]);
    step(&h, "S-VER", minute(t0, 3)).await;
    assert_eq!(status_of(&h, "S-VER").await, StrategyStatus::Triggered);

    // 100 x $60 = $6000 against the $5000 cap.
    step(&h, "S-VER", minute(t0, 3)).await;
    assert_eq!(status_of(&h, "S-VER").await, StrategyStatus::Failed);

    let events = h
        .ctx
        .store
        .verification_events_for_strategy("S-VER")
        .await
        .unwrap();
    assert!(events.iter().any(|e| e.rule_id == "notional_cap" && !e.passed));
    assert!(h.ctx.store.orders_for_strategy("S-VER").await.unwrap().is_empty());
    assert_eq!(h.gateway.submitted_order_count(), 0);
}

#[tokio::test]
async fn leased_strategy_rejects_user_operations() {
    let h = harness().await;

    let record = h
        .ctx
        .store
        .create_strategy(create_input(
            "S-LOCK",
            TradeType::Buy,
            vec![StrategySymbol::new("SLV", SymbolTradeType::Buy)],
            vec![price_condition(Operator::Lte, 60.0)],
            Some(stock_action(OrderSide::Buy, dec!(10), false)),
            None,
        ))
        .await
        .unwrap();

    let token = h
        .ctx
        .store
        .acquire_lease("S-LOCK", StrategyStatus::PendingActivation, record.version, 120)
        .await
        .unwrap()
        .expect("lease should be free");

    let err = h.ctx.store.activate("S-LOCK").await.unwrap_err();
    match err {
        SentraError::StrategyLocked { lock_until, .. } => assert!(close_to(lock_until, token)),
        other => panic!("expected STRATEGY_LOCKED, got {other}"),
    }

    // A second lease on the same snapshot must not be granted.
    let second = h
        .ctx
        .store
        .acquire_lease("S-LOCK", StrategyStatus::PendingActivation, record.version, 120)
        .await
        .unwrap();
    assert!(second.is_none());

    h.ctx.store.release_lease("S-LOCK", token).await.unwrap();
    h.ctx.store.activate("S-LOCK").await.unwrap();
}

#[tokio::test]
async fn edits_reset_status_and_bump_version() {
    let h = harness().await;

    let record = h
        .ctx
        .store
        .create_strategy(create_input(
            "S-EDIT",
            TradeType::Buy,
            vec![StrategySymbol::new("SLV", SymbolTradeType::Buy)],
            vec![price_condition(Operator::Lte, 60.0)],
            Some(stock_action(OrderSide::Buy, dec!(10), false)),
            None,
        ))
        .await
        .unwrap();

    let patched = h
        .ctx
        .store
        .patch_basic(
            "S-EDIT",
            sentra::store::BasicPatchInput {
                description: Some("updated".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(patched.status, StrategyStatus::PendingActivation);
    assert_eq!(patched.version, record.version + 1);
    assert_eq!(patched.description, "updated");

    let conditions = h
        .ctx
        .store
        .put_conditions(
            "S-EDIT",
            sentra::store::ConditionsPutInput {
                condition_logic: ConditionLogic::Or,
                conditions: vec![price_condition(Operator::Lte, 58.0)],
            },
        )
        .await
        .unwrap();
    assert_eq!(conditions.version, patched.version + 1);
    assert_eq!(conditions.conditions.len(), 1);
    assert_eq!(
        conditions.conditions[0].condition_id.as_deref(),
        Some("c1")
    );

    // Condition runtime reset to NOT_EVALUATED
    let runtime = h.ctx.store.condition_states("S-EDIT").await.unwrap();
    assert_eq!(runtime.len(), 1);
    assert_eq!(
        runtime[0].state,
        sentra::domain::ConditionState::NotEvaluated
    );
}

#[tokio::test]
async fn recovery_clears_stale_leases_and_reconciles_orders() {
    let h = harness().await;
    let t0 = base_time();

    h.ctx
        .store
        .create_strategy(create_input(
            "S-REC",
            TradeType::Buy,
            vec![StrategySymbol::new("SLV", SymbolTradeType::Buy)],
            vec![price_condition(Operator::Lte, 60.0)],
            Some(stock_action(OrderSide::Buy, dec!(10), false)),
            None,
        ))
        .await
        .unwrap();
    h.ctx.store.activate("S-REC").await.unwrap();
    step(&h, "S-REC", minute(t0, 0)).await;
    h.gateway
        .push_bars(&slv_contract(), "1m", vec![bar(minute(t0, 2), 59.0)]);
    step(&h, "S-REC", minute(t0, 3)).await;
    step(&h, "S-REC", minute(t0, 3)).await;
    assert_eq!(status_of(&h, "S-REC").await, StrategyStatus::OrderSubmitted);

    // The order filled while the process was down.
    let orders = h.ctx.store.orders_for_strategy("S-REC").await.unwrap();
    h.gateway
        .fill_order(orders[0].ib_order_id.unwrap(), dec!(58.8))
        .unwrap();

    let report = sentra::engine::recovery::RecoveryLoop::run(&h.ctx).await.unwrap();
    assert_eq!(report.reconcile_failures, 0);
    assert_eq!(status_of(&h, "S-REC").await, StrategyStatus::Filled);
}
