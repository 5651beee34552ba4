//! End-to-end scenarios for the wallet indexer.
//!
//! Each test runs the full service (chain monitor, indexing engine, store,
//! RPC) against a simulated node, mines blocks, and checks the wallet views
//! once the engine has caught up with the node's tip.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use jsonrpsee::core::client::{ClientT, Error as ClientError};
use jsonrpsee::core::params::ArrayParams;
use parking_lot::RwLock;

use tally_core::error::{IndexError, TallyError};
use tally_core::store::{MemoryWalletStore, WalletStore};
use tally_core::types::{OutPoint, PageQuery};
use tally_indexer::IndexerState;
use tally_node_lib::{RocksWalletStore, Service, ServiceConfig, WalletRegistry};
use tally_sync::memory::MemoryChain;
use tally_tests::helpers::*;

const ADDRESS_A: &str = "bcrt1qalice0receive0a";
const ELSEWHERE: &str = "bcrt1qsomebody0else";

/// An output on the simulated node that no wallet tracks.
fn external_coin(n: u64) -> OutPoint {
    OutPoint { txid: txid(1_000_000 + n), index: 0 }
}

#[tokio::test]
async fn receive_spend_and_replace() {
    let h = Harness::start().await;
    h.synced().await;
    let registry = h.service.registry();
    registry.create_wallet("alice").unwrap();
    registry.import_address("alice", ADDRESS_A).unwrap();

    // Receive 10 coins to A.
    let receive = payment(h.fresh_txid(), &[external_coin(1)], &[(ADDRESS_A, coins(10))]);
    h.mine(vec![receive.clone()]).await;
    let view = h.overview("alice");
    assert_eq!(view.balance, coins(10));
    assert_eq!(view.txids, vec![receive.txid]);
    assert_eq!(view.utxos.len(), 1);
    assert_eq!(view.utxos[0].satoshis, coins(10));
    assert_eq!(view.utxos[0].address.as_str(), ADDRESS_A);

    // Spend it elsewhere.
    let received = OutPoint { txid: receive.txid, index: 0 };
    let spend = payment(h.fresh_txid(), &[received], &[(ELSEWHERE, coins(10) - 1_000)]);
    h.mine(vec![spend]).await;
    let view = h.overview("alice");
    assert!(view.utxos.is_empty());
    assert_eq!(view.balance, 0);

    // A replaceable payment confirmed, then forked out and replaced with a
    // different payout.
    let before = h.overview("alice");
    let replaceable = payment(h.fresh_txid(), &[external_coin(2)], &[(ADDRESS_A, coins(10))]);
    h.mine(vec![replaceable.clone()]).await;
    h.mine(Vec::new()).await;
    let view = h.overview("alice");
    assert_eq!(view.txids.len(), 3);
    // Pages ascend by (height, index), so the newest entry comes last.
    assert_eq!(view.txids.last(), Some(&replaceable.txid));
    assert_eq!(view.balance, coins(10));
    assert_eq!(view.utxos.len(), 1);

    let replacement = payment(h.fresh_txid(), &[external_coin(2)], &[(ELSEWHERE, coins(10) - 5_000)]);
    h.chain.reorg(2, vec![vec![replacement], Vec::new()]);
    h.synced().await;
    assert_eq!(h.overview("alice"), before);

    h.stop().await;
}

#[tokio::test]
async fn txid_pages_cover_one_busy_block() {
    let h = Harness::start().await;
    h.synced().await;
    let registry = h.service.registry();
    registry.create_wallet("alice").unwrap();
    registry.import_address("alice", ADDRESS_A).unwrap();

    let payments: Vec<_> = (0..20)
        .map(|n| payment(h.fresh_txid(), &[external_coin(n)], &[(ADDRESS_A, 10_000 + n as i64)]))
        .collect();
    let sent: BTreeSet<_> = payments.iter().map(|tx| tx.txid).collect();
    h.mine(payments).await;

    let query = h.query();
    let first = query.get_txids("alice", &PageQuery::default()).unwrap();
    assert_eq!(first.items.len(), 10);
    let end = first.end.expect("first page should carry a cursor");

    let rest = query.get_txids("alice", &PageQuery::after(end, Some(100))).unwrap();
    assert_eq!(rest.items.len(), 10);
    assert!(rest.end.is_none());

    let union: Vec<_> = first.items.iter().chain(&rest.items).map(|e| e.txid).collect();
    let unique: BTreeSet<_> = union.iter().copied().collect();
    assert_eq!(unique.len(), union.len());
    assert_eq!(unique, sent);

    h.stop().await;
}

#[tokio::test]
async fn invalidated_spend_restores_the_output() {
    let h = Harness::start().await;
    h.synced().await;
    let registry = h.service.registry();
    registry.create_wallet("alice").unwrap();
    registry.import_address("alice", ADDRESS_A).unwrap();

    let receive = payment(h.fresh_txid(), &[external_coin(1)], &[(ADDRESS_A, coins(3))]);
    h.mine(vec![receive.clone()]).await;
    let original = h.overview("alice").utxos;
    assert_eq!(original.len(), 1);

    let received = OutPoint { txid: receive.txid, index: 0 };
    let spend = payment(h.fresh_txid(), &[received], &[(ELSEWHERE, coins(3) - 1_000)]);
    h.mine(vec![spend]).await;
    assert!(h.overview("alice").utxos.is_empty());

    // The node drops the spending block.
    h.chain.reorg(1, Vec::new());
    h.synced().await;
    let restored = h.overview("alice").utxos;
    assert_eq!(restored, original);
    assert_eq!(
        serde_json::to_string(&restored[0]).unwrap(),
        serde_json::to_string(&original[0]).unwrap()
    );
    assert_eq!(h.overview("alice").balance, coins(3));

    let respend = payment(h.fresh_txid(), &[received], &[(ELSEWHERE, coins(3) - 9_000)]);
    h.mine(vec![respend]).await;
    assert!(h.overview("alice").utxos.is_empty());
    assert_eq!(h.overview("alice").balance, 0);

    h.stop().await;
}

#[tokio::test]
async fn imports_apply_to_later_blocks_only() {
    let h = Harness::start().await;
    h.synced().await;
    let registry = h.service.registry();
    registry.create_wallet("alice").unwrap();

    let early = payment(h.fresh_txid(), &[external_coin(1)], &[(ADDRESS_A, 500)]);
    h.mine(vec![early]).await;
    registry.import_address("alice", ADDRESS_A).unwrap();
    assert_eq!(h.overview("alice").balance, 0);

    let late = payment(h.fresh_txid(), &[external_coin(2)], &[(ADDRESS_A, 700)]);
    h.mine(vec![late.clone()]).await;
    let view = h.overview("alice");
    assert_eq!(view.balance, 700);
    assert_eq!(view.txids, vec![late.txid]);

    h.stop().await;
}

#[tokio::test]
async fn shared_address_counts_for_every_wallet() {
    let h = Harness::start().await;
    h.synced().await;
    let registry = h.service.registry();
    for w in ["alice", "bob"] {
        registry.create_wallet(w).unwrap();
        registry.import_address(w, ADDRESS_A).unwrap();
    }
    let tx = payment(h.fresh_txid(), &[external_coin(1)], &[(ADDRESS_A, 1_234)]);
    h.mine(vec![tx]).await;
    assert_eq!(h.overview("alice"), h.overview("bob"));
    assert_eq!(h.overview("bob").balance, 1_234);
    h.stop().await;
}

#[tokio::test]
async fn catches_up_after_node_outage() {
    let h = Harness::start().await;
    h.synced().await;
    h.service.registry().create_wallet("alice").unwrap();
    h.service.registry().import_address("alice", ADDRESS_A).unwrap();

    h.chain.set_offline(true);
    for n in 0..3 {
        let tx = payment(h.fresh_txid(), &[external_coin(n)], &[(ADDRESS_A, 100)]);
        h.chain.mine(vec![tx]);
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.overview("alice").balance, 0);

    h.chain.set_offline(false);
    h.synced().await;
    assert_eq!(h.overview("alice").balance, 300);
    h.stop().await;
}

#[tokio::test]
async fn resumes_from_persisted_tip_across_a_reorg() {
    let dir = tempfile::tempdir().unwrap();
    let config = ServiceConfig {
        data_dir: dir.path().to_path_buf(),
        ..fast_config()
    };
    std::fs::create_dir_all(config.db_path()).unwrap();
    let chain = Arc::new(MemoryChain::new());
    let tx = payment(txid(1), &[external_coin(1)], &[(ADDRESS_A, 900)]);
    chain.mine(vec![tx]);
    chain.mine_empty(2);

    {
        let store = Arc::new(RwLock::new(RocksWalletStore::open(config.db_path()).unwrap()));
        let registry = WalletRegistry::new(Arc::clone(&store));
        registry.create_wallet("alice").unwrap();
        registry.import_address("alice", ADDRESS_A).unwrap();
        let service = Service::start(&config, Arc::clone(&store), Arc::clone(&chain))
            .await
            .unwrap();
        let late = payment(txid(2), &[external_coin(2)], &[(ADDRESS_A, 50)]);
        chain.mine(vec![late]);
        let status = service.wait_until_live(500, Duration::from_millis(10)).await.unwrap();
        assert!(status.height.is_some());
        let mut status = service.status();
        let tip = chain.tip().map(|b| b.hash);
        status.wait_for(|s| s.tip == tip).await.unwrap();
        service.shutdown().await.unwrap();
    }

    // While the service is down, the node replaces its last two blocks.
    let replacement = payment(txid(3), &[external_coin(3)], &[(ADDRESS_A, 7)]);
    chain.reorg(2, vec![vec![replacement], Vec::new(), Vec::new()]);

    let store = Arc::new(RwLock::new(RocksWalletStore::open(config.db_path()).unwrap()));
    let service = Service::start(&config, Arc::clone(&store), Arc::clone(&chain))
        .await
        .unwrap();
    let mut status = service.status();
    let tip = chain.tip().map(|b| b.hash);
    tokio::time::timeout(
        Duration::from_secs(10),
        status.wait_for(|s| s.tip == tip && s.state == IndexerState::Live),
    )
    .await
    .unwrap()
    .unwrap();
    // The 50 paid in a dropped block is gone, the replacement's 7 is in.
    assert_eq!(service.query().get_balance("alice").unwrap(), 907);
    service.shutdown().await.unwrap();
}

#[tokio::test]
async fn shutdown_flushes_the_index_store() {
    let dir = tempfile::tempdir().unwrap();
    let config = ServiceConfig {
        data_dir: dir.path().to_path_buf(),
        ..fast_config()
    };
    std::fs::create_dir_all(config.db_path()).unwrap();
    let chain = Arc::new(MemoryChain::new());
    chain.mine(vec![payment(txid(1), &[external_coin(1)], &[(ADDRESS_A, 900)])]);

    let store = Arc::new(RwLock::new(RocksWalletStore::open(config.db_path()).unwrap()));
    let registry = WalletRegistry::new(Arc::clone(&store));
    registry.create_wallet("alice").unwrap();
    registry.import_address("alice", ADDRESS_A).unwrap();
    let service = Service::start(&config, Arc::clone(&store), Arc::clone(&chain))
        .await
        .unwrap();
    let mut status = service.status();
    let tip = chain.tip().map(|b| b.hash);
    status.wait_for(|s| s.tip == tip).await.unwrap();
    service.shutdown().await.unwrap();

    // Flushed memtables land in table files next to the write-ahead log.
    let tables = std::fs::read_dir(config.db_path())
        .unwrap()
        .filter(|entry| {
            entry.as_ref().unwrap().path().extension().is_some_and(|ext| ext == "sst")
        })
        .count();
    assert!(tables > 0);
    assert_eq!(store.read().balance(&wallet("alice")).unwrap(), 900);
}

#[tokio::test]
async fn reorg_deeper_than_undo_history_halts() {
    let config = ServiceConfig { undo_depth: 2, ..fast_config() };
    let mut h = Harness::start_with(config, Arc::new(MemoryChain::new())).await;
    h.chain.mine_empty(5);
    h.synced().await;

    h.chain.reorg(3, vec![Vec::new(), Vec::new(), Vec::new(), Vec::new()]);
    let result = tokio::time::timeout(Duration::from_secs(10), h.service.stopped())
        .await
        .unwrap();
    assert!(matches!(
        result,
        Err(TallyError::Index(IndexError::ReorgDepthExceeded { .. }))
    ));
    // Whatever was committed stays readable.
    assert_eq!(h.service.query().get_info().unwrap().wallets, 0);
}

#[tokio::test]
async fn rpc_surface_end_to_end() {
    let h = Harness::start().await;
    h.synced().await;
    let url = format!("http://{}", h.service.rpc_addr());
    let client = jsonrpsee::http_client::HttpClientBuilder::default()
        .build(&url)
        .unwrap();

    let mut params = ArrayParams::new();
    params.insert("alice").unwrap();
    let created: bool = client.request("createwallet", params).await.unwrap();
    assert!(created);

    let mut params = ArrayParams::new();
    params.insert("alice").unwrap();
    let dup = client.request::<bool, _>("createwallet", params).await.unwrap_err();
    assert!(matches!(dup, ClientError::Call(ref e) if e.code() == -6));

    let mut params = ArrayParams::new();
    params.insert("alice").unwrap();
    params.insert(ADDRESS_A).unwrap();
    let imported: bool = client.request("importaddress", params).await.unwrap();
    assert!(imported);

    let payments: Vec<_> = (0..3)
        .map(|n| payment(h.fresh_txid(), &[external_coin(n)], &[(ADDRESS_A, 1_000)]))
        .collect();
    h.mine(payments.clone()).await;

    let mut params = ArrayParams::new();
    params.insert("alice").unwrap();
    let balance: serde_json::Value = client.request("getbalance", params).await.unwrap();
    assert_eq!(balance["balance"], 3_000);

    let mut params = ArrayParams::new();
    params.insert("alice").unwrap();
    params.insert(serde_json::json!({ "limit": 2 })).unwrap();
    let page: serde_json::Value = client.request("gettxids", params).await.unwrap();
    assert_eq!(page["txids"].as_array().unwrap().len(), 2);
    assert_eq!(page["txids"][0], payments[0].txid.to_string());
    let end = page["end"].clone();
    assert!(end.is_object());

    let mut params = ArrayParams::new();
    params.insert("alice").unwrap();
    params
        .insert(serde_json::json!({ "height": end["height"], "index": end["index"] }))
        .unwrap();
    let page: serde_json::Value = client.request("gettransactions", params).await.unwrap();
    let transactions = page["transactions"].as_array().unwrap();
    assert_eq!(transactions.len(), 1);
    assert_eq!(transactions[0]["hash"], payments[2].txid.to_string());
    assert_eq!(transactions[0]["index"], 2);
    assert!(page.get("end").is_none());

    let mut params = ArrayParams::new();
    params.insert("alice").unwrap();
    let utxos: serde_json::Value = client.request("getutxos", params).await.unwrap();
    assert_eq!(utxos["utxos"].as_array().unwrap().len(), 3);
    assert_eq!(utxos["utxos"][0]["address"], ADDRESS_A);

    let mut params = ArrayParams::new();
    params.insert("alice").unwrap();
    params.insert(serde_json::json!({ "height": 1 })).unwrap();
    let bad = client.request::<serde_json::Value, _>("gettxids", params).await.unwrap_err();
    assert!(matches!(bad, ClientError::Call(ref e) if e.code() == -8));

    let mut params = ArrayParams::new();
    params.insert("nobody").unwrap();
    let missing = client.request::<serde_json::Value, _>("getbalance", params).await.unwrap_err();
    assert!(matches!(missing, ClientError::Call(ref e) if e.code() == -4));

    let info: serde_json::Value = client.request("getinfo", ArrayParams::new()).await.unwrap();
    assert_eq!(info["state"], "live");
    assert_eq!(info["wallets"], 1);
    assert_eq!(info["height"], 1);

    h.stop().await;
}

#[tokio::test]
async fn queries_are_consistent_with_a_separate_store_handle() {
    // A second service over the same store sees the same committed views.
    let h = Harness::start().await;
    h.synced().await;
    h.service.registry().create_wallet("alice").unwrap();
    h.service.registry().import_address("alice", ADDRESS_A).unwrap();
    let tx = payment(h.fresh_txid(), &[external_coin(1)], &[(ADDRESS_A, 42)]);
    h.mine(vec![tx]).await;

    let shared: Arc<RwLock<MemoryWalletStore>> = Arc::clone(&h.store);
    let snapshot = shared.read().clone();
    let mut standalone = snapshot.clone();
    let next = h.chain.mine(Vec::new());
    h.synced().await;
    apply_block(&mut standalone, &next, 288);
    assert_eq!(*shared.read(), standalone);
    revert_block(&mut standalone, &next);
    assert_eq!(standalone, snapshot);
    h.stop().await;
}
