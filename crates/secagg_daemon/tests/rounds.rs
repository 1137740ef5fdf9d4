//! End-to-end rounds over loopback TCP: one aggregator task plus a set of
//! client tasks, with dropouts modelled as clients that stop partway
//! through the phase sequence.

use rand::rngs::OsRng;
use secagg_core::sign::SigningKey;
use secagg_core::{ClientId, SecAggError};
use secagg_daemon::aggregator::Aggregator;
use secagg_daemon::client::{Client, ClientError};
use secagg_daemon::config::{
    AggregatorConfig, ClientConfig, Config, KeyDirTransport, NetworkConfig, ProtocolConfig,
};
use secagg_daemon::registry::KeyDirectory;
use secagg_daemon::round::{Phase, RoundError};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

fn protocol(n: usize, t: usize, shape: Vec<usize>) -> ProtocolConfig {
    ProtocolConfig {
        expected_clients: n,
        threshold: Some(t),
        phase_wait_secs: 3,
        dissent_grace_secs: 1,
        rounds: 1,
        shape,
    }
}

fn loopback_network() -> NetworkConfig {
    NetworkConfig {
        bind_host: "127.0.0.1".into(),
        aggregator_host: "127.0.0.1".into(),
        advertise_port: 0,
        share_port: 0,
        masking_port: 0,
        consistency_port: 0,
        unmasking_port: 0,
        broadcast_port: 0,
        broadcast_host: "127.0.0.1".into(),
        key_dir_transport: KeyDirTransport::Tcp,
    }
}

/// Bind an aggregator and one client per id on ephemeral loopback ports.
/// `rogue` names a client whose signing key does not match the published
/// directory entry.
async fn setup(
    ids: &[&str],
    t: usize,
    shape: Vec<usize>,
    rogue: Option<&str>,
) -> (Arc<Aggregator>, Vec<Client>) {
    let mut signing_keys = BTreeMap::new();
    let mut directory_keys = BTreeMap::new();
    for &id in ids {
        let key = SigningKey::generate(&mut OsRng);
        if rogue == Some(id) {
            // publish a different key so every verification of this
            // client's bundle fails
            let decoy = SigningKey::generate(&mut OsRng);
            directory_keys.insert(ClientId::from(id), decoy.verifying_key());
        } else {
            directory_keys.insert(ClientId::from(id), key.verifying_key());
        }
        signing_keys.insert(ClientId::from(id), key);
    }
    let directory = KeyDirectory::new(directory_keys);

    let protocol_cfg = protocol(ids.len(), t, shape);
    let config = Config {
        protocol: protocol_cfg.clone(),
        network: loopback_network(),
        aggregator: AggregatorConfig::default(),
        client: ClientConfig::default(),
        directory_path: PathBuf::new(),
    };
    let aggregator = Arc::new(Aggregator::bind(config).await.unwrap());

    let ports = aggregator.ports();
    let mut network = loopback_network();
    network.advertise_port = ports.advertise;
    network.share_port = ports.share;
    network.masking_port = ports.masking;
    network.consistency_port = ports.consistency;
    network.unmasking_port = ports.unmasking;

    let mut clients = Vec::new();
    for &id in ids {
        let id = ClientId::from(id);
        let client = Client::bind(
            id.clone(),
            signing_keys.remove(&id).unwrap(),
            directory.clone(),
            protocol_cfg.clone(),
            network.clone(),
            0,
        )
        .await
        .unwrap();
        aggregator.register_client(id, client.delivery_addr().unwrap().to_string());
        clients.push(client);
    }

    (aggregator, clients)
}

fn spawn_round(
    aggregator: &Arc<Aggregator>,
) -> tokio::task::JoinHandle<Result<Vec<f64>, RoundError>> {
    let aggregator = aggregator.clone();
    tokio::spawn(async move { aggregator.run_round().await })
}

fn assert_close(output: &[f64], expected: &[f64]) {
    assert_eq!(output.len(), expected.len());
    for (o, e) in output.iter().zip(expected) {
        assert!((o - e).abs() < 1e-6, "component {o} != {e}");
    }
}

#[tokio::test]
async fn full_round_produces_the_sum() {
    let (aggregator, clients) = setup(&["1", "2", "3"], 2, vec![2], None).await;
    let inputs = [vec![1.0, 2.0], vec![3.0, 4.0], vec![5.0, 6.0]];

    let round = spawn_round(&aggregator);
    let mut tasks = Vec::new();
    for (mut client, input) in clients.into_iter().zip(inputs) {
        tasks.push(tokio::spawn(async move {
            client.run_round(&input).await.map(|_| client)
        }));
    }

    for task in tasks {
        task.await.unwrap().unwrap();
    }
    let output = round.await.unwrap().unwrap();
    assert_close(&output, &[9.0, 12.0]);
}

#[tokio::test]
async fn dropout_at_masking_yields_the_survivor_sum() {
    let (aggregator, clients) = setup(&["1", "2", "3"], 2, vec![2], None).await;
    let mut clients = clients.into_iter();
    let mut c1 = clients.next().unwrap();
    let mut c2 = clients.next().unwrap();
    let mut c3 = clients.next().unwrap();

    let round = spawn_round(&aggregator);
    let t1 = tokio::spawn(async move { c1.run_round(&[1.0, 2.0]).await.map(|_| c1) });
    let t2 = tokio::spawn(async move { c2.run_round(&[3.0, 4.0]).await.map(|_| c2) });
    // client 3 shares its keys, then drops before the masking phase
    let t3 = tokio::spawn(async move {
        c3.advertise_keys().await?;
        c3.share_keys().await?;
        Ok::<Client, ClientError>(c3)
    });

    t1.await.unwrap().unwrap();
    t2.await.unwrap().unwrap();
    let _held = t3.await.unwrap().unwrap();

    // exactly t clients finish phase 5, and the aggregate covers survivors
    let output = round.await.unwrap().unwrap();
    assert_close(&output, &[4.0, 6.0]);
}

#[tokio::test]
async fn dropout_before_advertising_is_tolerated() {
    let ids = ["1", "2", "3", "4", "5"];
    let (aggregator, clients) = setup(&ids, 4, vec![3], None).await;

    let inputs: BTreeMap<ClientId, Vec<f64>> = ids
        .iter()
        .map(|&id| {
            (
                ClientId::from(id),
                (0..3).map(|_| rand::random::<f64>()).collect(),
            )
        })
        .collect();
    let expected: Vec<f64> = (0..3)
        .map(|i| {
            inputs
                .iter()
                .filter(|(id, _)| id.as_str() != "2")
                .map(|(_, x)| x[i])
                .sum()
        })
        .collect();

    let round = spawn_round(&aggregator);
    let mut tasks = Vec::new();
    for mut client in clients {
        if client.id().as_str() == "2" {
            continue; // never even advertises
        }
        let input = inputs[client.id()].clone();
        tasks.push(tokio::spawn(async move {
            client.run_round(&input).await.map(|_| client)
        }));
    }

    for task in tasks {
        task.await.unwrap().unwrap();
    }
    let output = round.await.unwrap().unwrap();
    assert_close(&output, &expected);
}

#[tokio::test]
async fn too_many_unmasking_dropouts_fail_the_round() {
    let (aggregator, clients) = setup(&["1", "2", "3", "4"], 3, vec![1], None).await;
    let round = spawn_round(&aggregator);

    let mut tasks = Vec::new();
    for (i, mut client) in clients.into_iter().enumerate() {
        tasks.push(tokio::spawn(async move {
            if i < 2 {
                client.run_round(&[1.0]).await.map(|_| client)
            } else {
                // finishes the consistency check, then withholds its shares
                client.advertise_keys().await?;
                client.share_keys().await?;
                client.mask_input(&[1.0]).await?;
                client.consistency_check().await?;
                Ok(client)
            }
        }));
    }

    let error = round.await.unwrap().unwrap_err();
    match error {
        RoundError::InsufficientSubmissions {
            phase: Phase::Unmasking,
            received,
            required,
        } => {
            assert_eq!(received, 2);
            assert_eq!(required, 3);
        }
        other => panic!("unexpected round outcome: {other}"),
    }
    assert_eq!(error.exit_code(), 1);

    for task in tasks {
        let _ = task.await.unwrap();
    }
}

#[tokio::test]
async fn bad_advertise_signature_stalls_key_sharing() {
    let (aggregator, clients) = setup(&["1", "2", "3"], 2, vec![1], Some("2")).await;
    let round = spawn_round(&aggregator);

    let mut tasks = Vec::new();
    for mut client in clients {
        tasks.push(tokio::spawn(async move {
            client.run_round(&[1.0]).await
        }));
    }

    // every client rejects client 2's bundle and withholds its shares
    for task in tasks {
        let error = task.await.unwrap().unwrap_err();
        match error {
            ClientError::Core(SecAggError::SignatureInvalid(id)) => {
                assert_eq!(id, ClientId::from("2"));
            }
            other => panic!("unexpected client outcome: {other}"),
        }
    }

    let error = round.await.unwrap().unwrap_err();
    match error {
        RoundError::InsufficientSubmissions {
            phase: Phase::ShareKeys,
            received,
            ..
        } => assert_eq!(received, 0),
        other => panic!("unexpected round outcome: {other}"),
    }
}

#[tokio::test]
async fn broadcast_key_directory_reaches_the_client() {
    // a single client pins down the datagram path deterministically: the
    // announce plus chunks go to its broadcast listener over loopback
    let mut signing_keys = BTreeMap::new();
    let mut directory_keys = BTreeMap::new();
    let key = SigningKey::generate(&mut OsRng);
    directory_keys.insert(ClientId::from("1"), key.verifying_key());
    signing_keys.insert(ClientId::from("1"), key);
    let directory = KeyDirectory::new(directory_keys);

    // reserve a UDP port for the broadcast channel
    let probe = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    let broadcast_port = probe.local_addr().unwrap().port();
    drop(probe);

    let protocol_cfg = protocol(1, 1, vec![2]);
    let mut network = loopback_network();
    network.broadcast_port = broadcast_port;
    network.key_dir_transport = KeyDirTransport::Broadcast;

    let config = Config {
        protocol: protocol_cfg.clone(),
        network: network.clone(),
        aggregator: AggregatorConfig::default(),
        client: ClientConfig::default(),
        directory_path: PathBuf::new(),
    };
    let aggregator = Arc::new(Aggregator::bind(config).await.unwrap());

    let ports = aggregator.ports();
    network.advertise_port = ports.advertise;
    network.share_port = ports.share;
    network.masking_port = ports.masking;
    network.consistency_port = ports.consistency;
    network.unmasking_port = ports.unmasking;

    let mut client = Client::bind(
        ClientId::from("1"),
        signing_keys.remove(&ClientId::from("1")).unwrap(),
        directory,
        protocol_cfg,
        network,
        0,
    )
    .await
    .unwrap();
    aggregator.register_client(
        ClientId::from("1"),
        client.delivery_addr().unwrap().to_string(),
    );

    let round = spawn_round(&aggregator);
    let task = tokio::spawn(async move { client.run_round(&[0.25, 0.75]).await.map(|_| client) });

    task.await.unwrap().unwrap();
    let output = round.await.unwrap().unwrap();
    assert_close(&output, &[0.25, 0.75]);
}

#[tokio::test]
async fn two_rounds_back_to_back() {
    let (aggregator, clients) = setup(&["1", "2"], 2, vec![1], None).await;

    let agg_task = {
        let aggregator = aggregator.clone();
        tokio::spawn(async move {
            let first = aggregator.run_round().await;
            aggregator.clean();
            let second = aggregator.run_round().await;
            (first, second)
        })
    };

    let mut tasks = Vec::new();
    for (mut client, input) in clients.into_iter().zip([[1.5], [2.5]]) {
        tasks.push(tokio::spawn(async move {
            client.run_round(&input).await?;
            client.reset();
            // wait out the dissent grace window so the aggregator has
            // finished the round and reset its state
            tokio::time::sleep(Duration::from_secs(2)).await;
            client.run_round(&input).await?;
            Ok::<Client, ClientError>(client)
        }));
    }

    for task in tasks {
        task.await.unwrap().unwrap();
    }
    let (first, second) = agg_task.await.unwrap();
    assert_close(&first.unwrap(), &[4.0]);
    assert_close(&second.unwrap(), &[4.0]);
}
