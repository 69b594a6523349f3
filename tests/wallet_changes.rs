use battle_royale::{
    alert::Alert,
    bridge::BridgeState,
    test_helpers::*,
    types::{
        Account,
        BattleStatus,
    },
    wallet_session::ConnectionState,
};

#[tokio::test]
async fn account_switch__rebinds_to_new_account() {
    // given
    let ctx = TestContext::new(vec![alice()]);
    let context = ctx.context();
    context.connect().await.unwrap();
    let before = context.session().id;

    // when
    ctx.wallet.switch_accounts(vec![bob()]);
    settle().await;

    // then
    let session = context.session();
    assert_eq!(session.state, ConnectionState::Connected);
    assert_eq!(session.address, Some(bob()));
    assert!(session.id > before);
    assert_eq!(context.account(), Some(bob()));
    assert_eq!(
        context.bridge_state(),
        BridgeState::Armed {
            session_id: session.id
        }
    );
    assert_eq!(context.live_subscriptions(), 1);
}

#[tokio::test]
async fn account_switch__reprojects_for_the_new_account() {
    // given
    let carol = Account::new("0x0000000000000000000000000000000000000C0C");
    let chain = FakeChain::with_battles(vec![
        genesis(),
        battle(1, &[alice(), bob()], BattleStatus::Active, Account::null()),
        battle(2, &[bob(), carol], BattleStatus::Active, Account::null()),
    ]);
    let ctx = TestContext::with_chain(chain, vec![bob()]);
    let context = ctx.context();
    context.connect().await.unwrap();

    // when
    ctx.wallet.switch_accounts(vec![alice()]);
    settle().await;

    // then
    let active = context.game_view().active_battle.unwrap();
    assert_eq!(active.id, 1);
}

#[tokio::test]
async fn account_switch__same_account_in_other_case_is_ignored() {
    // given
    let ctx = TestContext::new(vec![alice()]);
    let context = ctx.context();
    context.connect().await.unwrap();
    let before = context.session().id;

    // when
    ctx.wallet
        .switch_accounts(vec![Account::new(ALICE.to_lowercase())]);
    settle().await;

    // then
    assert_eq!(context.session().id, before);
    assert_eq!(context.session().state, ConnectionState::Connected);
    assert_eq!(context.live_subscriptions(), 1);
}

#[tokio::test]
async fn account_switch__emptied_wallet_disconnects() {
    // given
    let ctx = TestContext::with_chain(
        FakeChain::with_battles(vec![
            genesis(),
            battle(1, &[bob()], BattleStatus::Pending, Account::null()),
        ]),
        vec![alice()],
    );
    let context = ctx.context();
    context.connect().await.unwrap();

    // when
    ctx.wallet.switch_accounts(Vec::new());
    settle().await;

    // then
    assert_eq!(context.session().state, ConnectionState::Disconnected);
    assert_eq!(context.live_subscriptions(), 0);
    assert_eq!(context.bridge_state(), BridgeState::Unarmed);
    assert_eq!(context.game_view(), Default::default());
    assert_eq!(context.alert(), Alert::info("Wallet disconnected"));
}

#[tokio::test]
async fn chain_switch__always_rebinds() {
    // given
    let ctx = TestContext::new(vec![alice()]);
    let context = ctx.context();
    context.connect().await.unwrap();
    let before = context.session().id;

    // when
    ctx.wallet.switch_chain(43_113);
    settle().await;

    // then
    let session = context.session();
    assert!(session.id > before);
    assert_eq!(session.address, Some(alice()));
    assert_eq!(session.state, ConnectionState::Connected);
    assert_eq!(context.live_subscriptions(), 1);
}

#[tokio::test]
async fn wallet_change__while_disconnected_is_ignored() {
    // given
    let ctx = TestContext::new(vec![alice()]);
    let context = ctx.context();

    // when
    ctx.wallet.switch_accounts(vec![bob()]);
    settle().await;

    // then
    assert_eq!(context.session().state, ConnectionState::Disconnected);
    assert_eq!(context.live_subscriptions(), 0);
}

#[tokio::test]
async fn shutdown__stops_reacting_to_the_wallet() {
    // given
    let ctx = TestContext::new(vec![alice()]);
    let context = ctx.context();
    context.connect().await.unwrap();

    // when
    context.shutdown();
    ctx.wallet.switch_accounts(vec![bob()]);
    settle().await;

    // then
    assert_eq!(context.session().state, ConnectionState::Disconnected);
    assert_eq!(context.account(), None);
    assert_eq!(context.live_subscriptions(), 0);
}
