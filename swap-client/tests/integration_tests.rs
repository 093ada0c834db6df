
use std::sync::Arc;

use swap_client::abi::{Erc20Call, SwapCall};
use swap_client::testing::InMemoryChain;
use swap_client::{BindingState, ChangeOutcome, ListenMode, OpenAsBuyerRequest, WalletEvent};
use swap_common::{derive_asset_id, hash_secret, LockKind, SwapError, TimestampSource, H256, U256};
use test_config::*;

fn buyer_request() -> OpenAsBuyerRequest {
    OpenAsBuyerRequest {
        token: TOKEN,
        recipient: ACCOUNT_B,
        hashed_secret: H256::repeat_byte(0x01),
        timeout_epoch_seconds: 3_600,
        value: "100".to_string(),
        sell_asset_id: "asset-1".to_string(),
        sell_price: "50".to_string(),
        value_is_raw: false,
        price_is_raw: false,
    }
}

#[tokio::test]
async fn test_open_as_buyer_end_to_end() {
    let chain = Arc::new(InMemoryChain::with_accounts(vec![ACCOUNT_A]));
    chain.set_token(TOKEN, 6, "TKX");
    chain.mint(TOKEN, ACCOUNT_A, U256::from(1_000_000_000u64));
    let context = context(&chain, ListenMode::Auto);

    context.connect().await.unwrap();
    let receipt = context.open_as_buyer(buyer_request()).await.unwrap();

    // exactly one approval, sent before the lock
    let sent = chain.sent_transactions();
    assert_eq!(sent.len(), 2);
    assert_eq!(
        sent[0].erc20_call(),
        Some(Erc20Call::Approve {
            spender: InMemoryChain::SWAP_CONTRACT,
            amount: U256::from(100_000_000u64),
        })
    );
    match sent[1].swap_call() {
        Some(SwapCall::LockBuy { value, sell_price, sell_asset_id, .. }) => {
            assert_eq!(value, U256::from(100_000_000u64));
            assert_eq!(sell_price, U256::from(50_000_000u64));
            assert_eq!(sell_asset_id, derive_asset_id("asset-1").unwrap());
        }
        other => panic!("expected lockBuy, got {:?}", other),
    }
    assert_eq!(receipt.approval_tx, Some(sent[0].hash));
    assert!(receipt.lock_id.is_some());

    let ctx = &context;
    assert!(eventually(|| async move { ctx.ledger().await.len() == 1 }).await);
    // a backfill over the same history must not duplicate the live entry
    context.refresh().await;

    let ledger = context.ledger().await;
    assert_eq!(ledger.len(), 1);
    assert_eq!(ledger[0].kind, LockKind::OpenAsBuyer);
    assert_eq!(ledger[0].recipient, ACCOUNT_B);
    assert_eq!(Some(ledger[0].lock_id), receipt.lock_id);
}

#[tokio::test]
async fn test_account_switch_resets_ledger() {
    let chain = Arc::new(InMemoryChain::with_accounts(vec![ACCOUNT_A]));
    chain.emit(buy_event(ACCOUNT_A, ACCOUNT_C, 1));
    chain.emit(buy_event(ACCOUNT_B, ACCOUNT_D, 2));
    let context = context(&chain, ListenMode::Auto);

    context.connect().await.unwrap();
    assert_eq!(context.ledger().await.len(), 1);

    // a backfill started for A finishes after the switch to B
    let engine = context.engine().clone();
    let ticket = engine.begin_backfill().await;
    let outcome = engine.collect_backfill(ticket).await;

    chain.switch_accounts(vec![ACCOUNT_B]);
    let rebound = &engine;
    assert!(
        eventually(|| async move {
            rebound.active_account().await == Some(ACCOUNT_B) && rebound.state().await == BindingState::Live
        })
        .await
    );
    assert_eq!(context.connection_state().account, Some(ACCOUNT_B));

    assert!(matches!(
        engine.apply_backfill(ticket, outcome).await,
        Err(SwapError::ReconciliationStale { .. })
    ));
    let ledger = context.ledger().await;
    assert_eq!(ledger.len(), 1);
    assert!(ledger.iter().all(|event| event.involves(&ACCOUNT_B)));
}

#[tokio::test]
async fn test_relevance_notifications() {
    let chain = Arc::new(InMemoryChain::with_accounts(vec![ACCOUNT_A]));
    let context = context(&chain, ListenMode::Global);
    let mut notifications = context.notifications();
    context.connect().await.unwrap();

    chain.emit(buy_event(ACCOUNT_C, ACCOUNT_D, 1));
    chain.emit(buy_event(ACCOUNT_A, ACCOUNT_B, 2));

    let ctx = &context;
    assert!(eventually(|| async move { ctx.ledger().await.len() == 2 }).await);

    let notified = notifications.recv().await.unwrap();
    assert_eq!(notified.creator, ACCOUNT_A);
    assert_eq!(notified.recipient, ACCOUNT_B);
    assert!(notifications.try_recv().is_err());

    // already known events never notify again
    context.refresh().await;
    assert!(notifications.try_recv().is_err());
}

#[tokio::test]
async fn test_concurrent_backfills_apply_latest_only() {
    let chain = Arc::new(InMemoryChain::with_accounts(vec![ACCOUNT_A]));
    chain.emit(buy_event(ACCOUNT_A, ACCOUNT_B, 1));
    let context = context(&chain, ListenMode::Auto);
    context.connect().await.unwrap();
    let engine = context.engine().clone();

    let first = engine.begin_backfill().await;
    let second = engine.begin_backfill().await;
    let (first_outcome, second_outcome) = tokio::join!(engine.collect_backfill(first), engine.collect_backfill(second));

    assert_eq!(engine.apply_backfill(second, second_outcome).await.unwrap(), 0);
    assert!(matches!(
        engine.apply_backfill(first, first_outcome).await,
        Err(SwapError::ReconciliationStale { .. })
    ));
    assert_eq!(context.ledger().await.len(), 1);

    // a result that lands after a teardown is discarded
    let late = engine.begin_backfill().await;
    let late_outcome = engine.collect_backfill(late).await;
    context.disconnect().await;
    assert!(engine.apply_backfill(late, late_outcome).await.is_err());
    assert!(context.ledger().await.is_empty());

    // overlapping refreshes settle on one consistent ledger
    context.connect().await.unwrap();
    let (a, b) = tokio::join!(context.refresh(), context.refresh());
    assert!(a.applied || b.applied);
    assert_eq!(context.ledger().await.len(), 1);
}

#[tokio::test]
async fn test_degraded_backfill_is_silent() {
    let chain = Arc::new(InMemoryChain::with_accounts(vec![ACCOUNT_A]));
    chain.emit(buy_event(ACCOUNT_A, ACCOUNT_B, 1));
    chain.set_logs_available(false);
    let context = context(&chain, ListenMode::Auto);

    context.connect().await.unwrap();
    let summary = context.refresh().await;
    assert!(summary.applied);
    assert_eq!(summary.degraded_kinds.len(), 5);
    assert!(context.ledger().await.is_empty());
    assert_eq!(context.binding_state().await, BindingState::Live);

    // recovery is a manual refresh once the provider answers again
    chain.set_logs_available(true);
    chain.set_block_timestamps_available(false);
    context.refresh().await;
    let ledger = context.ledger().await;
    assert_eq!(ledger.len(), 1);
    assert_eq!(ledger[0].timestamp_source, TimestampSource::Ingestion);
}

#[tokio::test]
async fn test_block_number_outage_uses_unranged_query() {
    let chain = Arc::new(InMemoryChain::with_accounts(vec![ACCOUNT_A]));
    chain.emit(buy_event(ACCOUNT_A, ACCOUNT_B, 1));
    chain.set_block_number_available(false);
    chain.fail_ranged_logs(10);
    let context = context(&chain, ListenMode::Auto);

    context.connect().await.unwrap();
    let ledger = context.ledger().await;
    assert_eq!(ledger.len(), 1);
    assert_eq!(ledger[0].timestamp_source, TimestampSource::Block);
}

#[tokio::test]
async fn test_ledger_view_is_newest_first() {
    let chain = Arc::new(InMemoryChain::with_accounts(vec![ACCOUNT_A]));
    for lock in 1..=3 {
        chain.emit(buy_event(ACCOUNT_A, ACCOUNT_B, lock));
    }
    let context = context(&chain, ListenMode::Auto);
    context.connect().await.unwrap();

    let locks: Vec<H256> = context.ledger().await.iter().map(|e| e.lock_id).collect();
    assert_eq!(locks, vec![H256::repeat_byte(3), H256::repeat_byte(2), H256::repeat_byte(1)]);
}

#[tokio::test]
async fn test_refresh_after_reconnect_starts_fresh_binding() {
    let chain = Arc::new(InMemoryChain::with_accounts(vec![ACCOUNT_A]));
    chain.emit(buy_event(ACCOUNT_A, ACCOUNT_B, 1));
    let context = context(&chain, ListenMode::Auto);

    context.connect().await.unwrap();
    context.disconnect().await;
    assert_eq!(context.binding_state().await, BindingState::Uninitialized);

    // refresh while disconnected is harmless
    context.refresh().await;
    context.disconnect().await;

    context.connect().await.unwrap();
    let summary = context.refresh().await;
    assert!(summary.applied);
    assert_eq!(context.ledger().await.len(), 1);
}

#[tokio::test]
async fn test_push_and_poll_paths_agree() {
    let chain = Arc::new(InMemoryChain::with_accounts(vec![ACCOUNT_A]));
    let context = context(&chain, ListenMode::Auto);
    context.connect().await.unwrap();
    let connection = context.connection().clone();
    let epoch_before = context.engine().epoch().await;

    chain.switch_chain(5);
    let ctx = &context;
    assert!(
        eventually(|| async move {
            ctx.engine().epoch().await > epoch_before && ctx.binding_state().await == BindingState::Live
        })
        .await
    );
    assert_eq!(context.connection_state().chain_id, Some(U256::from(5u64)));
    let epoch_after_push = context.engine().epoch().await;

    // the poll then sees the same chain and does nothing
    connection.poll_once().await;
    assert_eq!(context.engine().epoch().await, epoch_after_push);
    assert_eq!(
        connection.handle_chain_changed(U256::from(5u64)).await.unwrap(),
        ChangeOutcome::Unchanged
    );

    chain.push_wallet_event(WalletEvent::Disconnected);
    assert!(eventually(|| async move { !ctx.connection_state().is_connected }).await);
}

#[tokio::test]
async fn test_expected_chain_is_enforced() {
    init_test_logging();
    let chain = Arc::new(InMemoryChain::with_accounts(vec![ACCOUNT_A]));
    let mut config = test_config(ListenMode::Auto);
    config.network.expected_chain_id = Some(1);
    let context = swap_client::SwapContext::new(chain, config).unwrap();

    assert!(context.connect().await.is_err());
    assert!(!context.connection_state().is_connected);
}

#[tokio::test]
async fn test_settlement_actions_reach_the_ledger() {
    let chain = Arc::new(InMemoryChain::with_accounts(vec![ACCOUNT_A]));
    chain.set_token(TOKEN, 6, "TKX");
    chain.mint(TOKEN, ACCOUNT_A, U256::from(1_000_000_000u64));
    let context = context(&chain, ListenMode::Auto);
    context.connect().await.unwrap();

    let secret = H256::repeat_byte(0x5e);
    let to_unlock = hash_secret(&secret);
    let to_decline = H256::repeat_byte(0x02);
    let to_retrieve = H256::repeat_byte(0x03);
    for hashed_secret in [to_unlock, to_decline, to_retrieve] {
        let mut request = buyer_request();
        request.hashed_secret = hashed_secret;
        context.open_as_buyer(request).await.unwrap();
    }

    // the creator takes one lock back
    context.retrieve(TOKEN, ACCOUNT_B, to_retrieve, 3_600).await.unwrap();
    let ctx = &context;
    assert!(eventually(|| async move { ctx.ledger().await.len() == 4 }).await);

    // the recipient settles the other two
    chain.switch_accounts(vec![ACCOUNT_B]);
    let engine = context.engine().clone();
    let rebound = &engine;
    assert!(
        eventually(|| async move {
            rebound.active_account().await == Some(ACCOUNT_B) && rebound.state().await == BindingState::Live
        })
        .await
    );
    assert_eq!(context.ledger().await.len(), 4);

    let unlocked = context.unlock(TOKEN, ACCOUNT_A, secret, 3_600).await.unwrap();
    assert!(unlocked.block_number.is_some());
    context.decline(TOKEN, ACCOUNT_A, to_decline, 3_600).await.unwrap();
    assert!(eventually(|| async move { ctx.ledger().await.len() == 6 }).await);

    let ledger = context.ledger().await;
    let count = |kind: LockKind| ledger.iter().filter(|event| event.kind == kind).count();
    assert_eq!(count(LockKind::OpenAsBuyer), 3);
    assert_eq!(count(LockKind::Retrieved), 1);
    assert_eq!(count(LockKind::Declined), 1);
    let unlock_event = ledger.iter().find(|event| event.kind == LockKind::Unlocked).unwrap();
    assert_eq!(unlock_event.secret, Some(secret));
    assert_eq!(unlock_event.recipient, ACCOUNT_B);

    assert_eq!(chain.balance_of(TOKEN, ACCOUNT_B), U256::from(100_000_000u64));
    assert_eq!(chain.balance_of(TOKEN, ACCOUNT_A), U256::from(900_000_000u64));
}
