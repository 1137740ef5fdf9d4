//! The aggregator: five phase endpoints, barriers, and the unmasking
//! computation.
//!
//! Each phase has its own TCP listener; accept loops run for the server's
//! lifetime and spawn one task per connection. Handlers decode a single
//! framed message and write it into the current round's pool, so a handler
//! that races past a barrier lands harmlessly in a closed phase. All
//! round-scoped state lives in [`RoundState`], replaced wholesale by
//! [`Aggregator::clean`] between rounds.

use crate::config::{Config, KeyDirTransport};
use crate::framing::{self, read_frame, write_frame};
use crate::phase::PhasePool;
use crate::round::{Phase, RoundError};
use secagg_core::id::mask_sign;
use secagg_core::ka::agree_raw;
use secagg_core::masking::{add_scaled, expand, pairwise_seed, seed_from_bytes, shape_len};
use secagg_core::shamir::{self, Share};
use secagg_core::wire::{self, KeyBundle, Message};
use secagg_core::ClientId;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// One phase-5 submission: key shares for dropouts, seed shares for
/// survivors.
#[derive(Debug, Clone)]
pub struct UnmaskSubmission {
    pub key_shares: BTreeMap<ClientId, Share>,
    pub seed_shares: BTreeMap<ClientId, Share>,
}

/// All round-scoped aggregator state. Created at round start, dropped at
/// round end; nothing carries over.
pub struct RoundState {
    advertise: PhasePool<KeyBundle>,
    shares: PhasePool<BTreeMap<ClientId, Vec<u8>>>,
    masked: PhasePool<Vec<f64>>,
    consistency: PhasePool<Vec<u8>>,
    unmask: PhasePool<UnmaskSubmission>,
    dissents: Mutex<Vec<ClientId>>,
}

impl RoundState {
    fn new() -> Self {
        Self {
            advertise: PhasePool::new(),
            shares: PhasePool::new(),
            masked: PhasePool::new(),
            consistency: PhasePool::new(),
            unmask: PhasePool::new(),
            dissents: Mutex::new(Vec::new()),
        }
    }

    fn record_dissent(&self, id: ClientId) {
        self.dissents.lock().expect("dissent list poisoned").push(id);
    }

    fn dissenters(&self) -> Vec<ClientId> {
        self.dissents.lock().expect("dissent list poisoned").clone()
    }
}

/// State shared between the accept loops and the round driver.
struct Shared {
    shape: Vec<usize>,
    round: Mutex<Arc<RoundState>>,
}

impl Shared {
    fn current(&self) -> Arc<RoundState> {
        self.round.lock().expect("round slot poisoned").clone()
    }
}

/// Resolved listener ports, useful when binding on port 0.
#[derive(Debug, Clone, Copy)]
pub struct BoundPorts {
    pub advertise: u16,
    pub share: u16,
    pub masking: u16,
    pub consistency: u16,
    pub unmasking: u16,
}

pub struct Aggregator {
    config: Config,
    shared: Arc<Shared>,
    /// Delivery address per client, for key-directory, inbox, survivor-set,
    /// and signature-map fan-out.
    delivery: Mutex<BTreeMap<ClientId, String>>,
    ports: BoundPorts,
    accept_tasks: Vec<JoinHandle<()>>,
}

impl Aggregator {
    /// Bind all five phase listeners and start serving connections.
    pub async fn bind(config: Config) -> anyhow::Result<Self> {
        config.protocol.validate()?;

        let shared = Arc::new(Shared {
            shape: config.protocol.shape.clone(),
            round: Mutex::new(Arc::new(RoundState::new())),
        });

        let host = config.network.bind_host.clone();
        let mut accept_tasks = Vec::new();

        let advertise = bind_phase(
            &host,
            config.network.advertise_port,
            Phase::Advertise,
            &shared,
            &mut accept_tasks,
        )
        .await?;
        let share = bind_phase(
            &host,
            config.network.share_port,
            Phase::ShareKeys,
            &shared,
            &mut accept_tasks,
        )
        .await?;
        let masking = bind_phase(
            &host,
            config.network.masking_port,
            Phase::Masking,
            &shared,
            &mut accept_tasks,
        )
        .await?;
        let consistency = bind_phase(
            &host,
            config.network.consistency_port,
            Phase::Consistency,
            &shared,
            &mut accept_tasks,
        )
        .await?;
        let unmasking = bind_phase(
            &host,
            config.network.unmasking_port,
            Phase::Unmasking,
            &shared,
            &mut accept_tasks,
        )
        .await?;

        let delivery = config
            .aggregator
            .clients
            .iter()
            .map(|(id, addr)| (ClientId::from(id.as_str()), addr.clone()))
            .collect();

        info!(
            advertise,
            share, masking, consistency, unmasking, "aggregator listening"
        );

        Ok(Self {
            config,
            shared,
            delivery: Mutex::new(delivery),
            ports: BoundPorts {
                advertise,
                share,
                masking,
                consistency,
                unmasking,
            },
            accept_tasks,
        })
    }

    pub fn ports(&self) -> BoundPorts {
        self.ports
    }

    /// Register or update a client's delivery address.
    pub fn register_client(&self, id: ClientId, addr: String) {
        self.delivery
            .lock()
            .expect("delivery map poisoned")
            .insert(id, addr);
    }

    /// Reset all round-scoped state for the next round.
    pub fn clean(&self) {
        *self.shared.round.lock().expect("round slot poisoned") = Arc::new(RoundState::new());
    }

    /// Drive one full round and produce the aggregate vector.
    pub async fn run_round(&self) -> Result<Vec<f64>, RoundError> {
        let n = self.config.protocol.expected_clients;
        let t = self.config.protocol.threshold();
        let window = Duration::from_secs(self.config.protocol.phase_wait_secs);
        let round = self.shared.current();

        // Phase 1: advertise keys
        round.advertise.set_expected(n);
        let count = round.advertise.wait(n, window).await;
        if count < t {
            return Err(insufficient(Phase::Advertise, count, t));
        }
        let key_dir = round.advertise.snapshot();
        let u1: BTreeSet<ClientId> = key_dir.keys().cloned().collect();
        info!(online = u1.len(), expected = n, "advertise barrier closed");

        // Phase 2: share keys
        round.shares.set_expected(u1.len());
        self.distribute_key_directory(&key_dir, &u1).await?;

        let count = round.shares.wait(u1.len(), window).await;
        if count < t {
            return Err(insufficient(Phase::ShareKeys, count, t));
        }
        let submissions = round.shares.snapshot();
        let u2: BTreeSet<ClientId> = submissions.keys().cloned().collect();
        info!(online = u2.len(), "share barrier closed");

        // transpose sender → {recipient → ct} into per-recipient inboxes
        let mut inboxes: BTreeMap<ClientId, BTreeMap<ClientId, Vec<u8>>> = BTreeMap::new();
        for (sender, ciphertexts) in &submissions {
            for (recipient, ct) in ciphertexts {
                inboxes
                    .entry(recipient.clone())
                    .or_default()
                    .insert(sender.clone(), ct.clone());
            }
        }
        // Phase 3: masked input collection
        round.masked.set_expected(u2.len());
        for recipient in &u2 {
            let inbox = inboxes.remove(recipient).unwrap_or_default();
            let payload = encode(&Message::Inbox(inbox))?;
            self.deliver(recipient, &payload).await;
        }

        let count = round.masked.wait(u2.len(), window).await;
        if count < t {
            return Err(insufficient(Phase::Masking, count, t));
        }
        let masked = round.masked.snapshot();
        let u3: BTreeSet<ClientId> = masked.keys().cloned().collect();
        info!(online = u3.len(), "masking barrier closed");

        // Phase 4: consistency check over the survivor set
        round.consistency.set_expected(u3.len());
        let survivor_payload = encode(&Message::SurvivorSet(u3.clone()))?;
        for id in &u3 {
            self.deliver(id, &survivor_payload).await;
        }

        let count = round.consistency.wait(u3.len(), window).await;
        if count < t {
            return Err(insufficient(Phase::Consistency, count, t));
        }
        let signatures = round.consistency.snapshot();
        let u4: BTreeSet<ClientId> = signatures.keys().cloned().collect();
        info!(online = u4.len(), "consistency barrier closed");

        round.unmask.set_expected(u4.len());
        let sig_map_payload = encode(&Message::SignatureMap(signatures))?;
        for id in &u4 {
            self.deliver(id, &sig_map_payload).await;
        }

        // any dissent inside the grace window is fatal
        tokio::time::sleep(Duration::from_secs(self.config.protocol.dissent_grace_secs)).await;
        let dissenters = round.dissenters();
        if !dissenters.is_empty() {
            return Err(RoundError::ConsistencyViolation { dissenters });
        }

        // Phase 5: unmasking
        let count = round.unmask.wait(u4.len(), window).await;
        if count < t {
            return Err(insufficient(Phase::Unmasking, count, t));
        }
        let unmask_submissions = round.unmask.snapshot();
        info!(online = unmask_submissions.len(), "unmasking barrier closed");

        let mut key_shares: BTreeMap<ClientId, Vec<Share>> = BTreeMap::new();
        let mut seed_shares: BTreeMap<ClientId, Vec<Share>> = BTreeMap::new();
        for submission in unmask_submissions.values() {
            for (id, share) in &submission.key_shares {
                key_shares.entry(id.clone()).or_default().push(share.clone());
            }
            for (id, share) in &submission.seed_shares {
                seed_shares.entry(id.clone()).or_default().push(share.clone());
            }
        }

        unmask(
            &self.config.protocol.shape,
            &key_dir,
            &u2,
            &u3,
            &masked,
            &key_shares,
            &seed_shares,
        )
    }

    /// Send the phase-1 key directory to every online client, over TCP or
    /// UDP broadcast depending on configuration.
    async fn distribute_key_directory(
        &self,
        key_dir: &BTreeMap<ClientId, KeyBundle>,
        u1: &BTreeSet<ClientId>,
    ) -> Result<(), RoundError> {
        let payload = encode(&Message::KeyDirectory(key_dir.clone()))?;

        match self.config.network.key_dir_transport {
            KeyDirTransport::Tcp => {
                for id in u1 {
                    self.deliver(id, &payload).await;
                }
            }
            KeyDirTransport::Broadcast => {
                let target = format!(
                    "{}:{}",
                    self.config.network.broadcast_host, self.config.network.broadcast_port
                );
                let mut addrs = tokio::net::lookup_host(target.as_str())
                    .await
                    .map_err(|e| RoundError::Internal(format!("resolving {target}: {e}")))?;
                let addr = addrs
                    .next()
                    .ok_or_else(|| RoundError::Internal(format!("no address for {target}")))?;
                let sock = framing::bind_broadcast_sender()
                    .await
                    .map_err(|e| RoundError::Internal(format!("broadcast socket: {e}")))?;
                framing::broadcast_payload(&sock, addr, &payload)
                    .await
                    .map_err(|e| RoundError::Internal(format!("broadcast send: {e}")))?;
                info!(bytes = payload.len(), "broadcasted key directory");
            }
        }
        Ok(())
    }

    /// Deliver one framed message to a client. Failure is not fatal: the
    /// client simply misses the phase and drops out of the round.
    async fn deliver(&self, id: &ClientId, payload: &[u8]) {
        let addr = self
            .delivery
            .lock()
            .expect("delivery map poisoned")
            .get(id)
            .cloned();
        let Some(addr) = addr else {
            warn!(id = %id, "no delivery address registered");
            return;
        };

        let result = async {
            let mut stream = TcpStream::connect(&addr).await?;
            write_frame(&mut stream, payload).await
        }
        .await;

        if let Err(e) = result {
            warn!(id = %id, addr = %addr, error = %e, "delivery failed, client drops out");
        }
    }
}

impl Drop for Aggregator {
    fn drop(&mut self) {
        for task in &self.accept_tasks {
            task.abort();
        }
    }
}

async fn bind_phase(
    host: &str,
    port: u16,
    phase: Phase,
    shared: &Arc<Shared>,
    tasks: &mut Vec<JoinHandle<()>>,
) -> anyhow::Result<u16> {
    let listener = TcpListener::bind((host, port)).await?;
    let bound = listener.local_addr()?.port();
    tasks.push(tokio::spawn(serve(listener, phase, shared.clone())));
    Ok(bound)
}

fn insufficient(phase: Phase, received: usize, required: usize) -> RoundError {
    RoundError::InsufficientSubmissions {
        phase,
        received,
        required,
    }
}

fn encode(msg: &Message) -> Result<Vec<u8>, RoundError> {
    wire::encode(msg).map_err(|e| RoundError::Internal(e.to_string()))
}

/// Accept loop for one phase endpoint. Runs until the aggregator is
/// dropped.
async fn serve(listener: TcpListener, phase: Phase, shared: Arc<Shared>) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(%phase, error = %e, "accept failed");
                continue;
            }
        };
        let shared = shared.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, phase, &shared).await {
                debug!(%phase, %peer, error = %e, "connection dropped");
            }
        });
    }
}

/// Read one framed submission and record it in the current round.
///
/// Any transport or decode failure here only costs the submitting client
/// its slot in the phase.
async fn handle_connection(
    mut stream: TcpStream,
    phase: Phase,
    shared: &Shared,
) -> anyhow::Result<()> {
    let payload = read_frame(&mut stream).await?;
    let message = wire::decode(&payload)?;
    let round = shared.current();

    match (phase, message) {
        (Phase::Advertise, Message::Advertise { id, bundle }) => {
            round.advertise.submit(id.clone(), bundle);
            info!(
                received = round.advertise.len(),
                expected = round.advertise.expected(),
                id = %id,
                "received key bundle"
            );
        }
        (Phase::ShareKeys, Message::Shares { id, ciphertexts }) => {
            round.shares.submit(id.clone(), ciphertexts);
            info!(
                received = round.shares.len(),
                expected = round.shares.expected(),
                id = %id,
                "received encrypted shares"
            );
        }
        (Phase::Masking, Message::MaskedInput { id, vector }) => {
            let expected_len = shape_len(&shared.shape);
            if vector.len() != expected_len {
                anyhow::bail!(
                    "masked input from {id} has {} elements, expected {expected_len}",
                    vector.len()
                );
            }
            round.masked.submit(id.clone(), vector);
            info!(
                received = round.masked.len(),
                expected = round.masked.expected(),
                id = %id,
                "received masked input"
            );
        }
        (Phase::Consistency, Message::SurvivorSig { id, sig }) => {
            round.consistency.submit(id.clone(), sig);
            info!(
                received = round.consistency.len(),
                expected = round.consistency.expected(),
                id = %id,
                "received survivor signature"
            );
        }
        (Phase::Consistency, Message::Dissent { id }) => {
            warn!(id = %id, "received dissent");
            round.record_dissent(id);
        }
        (Phase::Unmasking, Message::UnmaskShares { id, key_shares, seed_shares }) => {
            round.unmask.submit(
                id.clone(),
                UnmaskSubmission {
                    key_shares,
                    seed_shares,
                },
            );
            info!(
                received = round.unmask.len(),
                expected = round.unmask.expected(),
                id = %id,
                "received unmask shares"
            );
        }
        (phase, message) => {
            anyhow::bail!("unexpected message {message:?} on {phase} endpoint");
        }
    }

    Ok(())
}

/// The unmasking computation.
///
/// Starting from `Y = Σ y_u` over the survivor set, re-add the pairwise
/// masks that dropouts left dangling (sign from the dropout's perspective)
/// and strip every survivor's private mask.
fn unmask(
    shape: &[usize],
    key_dir: &BTreeMap<ClientId, KeyBundle>,
    u2: &BTreeSet<ClientId>,
    u3: &BTreeSet<ClientId>,
    masked: &BTreeMap<ClientId, Vec<f64>>,
    key_shares: &BTreeMap<ClientId, Vec<Share>>,
    seed_shares: &BTreeMap<ClientId, Vec<Share>>,
) -> Result<Vec<f64>, RoundError> {
    let mut output = vec![0.0; shape_len(shape)];
    for vector in masked.values() {
        add_scaled(&mut output, vector, 1.0);
    }

    // dropouts: reconstruct the "s" secret and cancel the pairwise masks
    // survivors applied for them
    for dropout in u2.difference(u3) {
        let shares = key_shares.get(dropout).ok_or_else(|| {
            RoundError::Internal(format!("no key shares recovered for dropout {dropout}"))
        })?;
        let secret = shamir::reconstruct(shares)
            .map_err(|e| RoundError::Internal(format!("dropout {dropout}: {e}")))?;
        let secret: [u8; 32] = secret.as_slice().try_into().map_err(|_| {
            RoundError::Internal(format!("dropout {dropout}: reconstructed key has wrong length"))
        })?;

        for survivor in u3 {
            let bundle = key_dir.get(survivor).ok_or_else(|| {
                RoundError::Internal(format!("survivor {survivor} missing from key directory"))
            })?;
            let shared = agree_raw(secret, bundle.s_pk);
            let mask = expand(pairwise_seed(&shared), shape);
            add_scaled(&mut output, &mask, mask_sign(dropout, survivor));
        }
    }

    // survivors: reconstruct the private seed and strip the private mask
    for survivor in u3 {
        let shares = seed_shares.get(survivor).ok_or_else(|| {
            RoundError::Internal(format!("no seed shares recovered for survivor {survivor}"))
        })?;
        let seed_bytes = shamir::reconstruct(shares)
            .map_err(|e| RoundError::Internal(format!("survivor {survivor}: {e}")))?;
        let seed = seed_from_bytes(&seed_bytes)
            .map_err(|e| RoundError::Internal(format!("survivor {survivor}: {e}")))?;
        let mask = expand(seed, shape);
        add_scaled(&mut output, &mask, -1.0);
    }

    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;
    use secagg_core::ka::DhKeyPair;
    use secagg_core::masking::{mask_input, seed_to_bytes};

    struct TestClient {
        id: ClientId,
        s_pair: DhKeyPair,
        seed: u32,
    }

    fn build_clients(ids: &[&str]) -> Vec<TestClient> {
        ids.iter()
            .map(|&id| TestClient {
                id: ClientId::from(id),
                s_pair: DhKeyPair::generate(&mut OsRng),
                seed: rand::random(),
            })
            .collect()
    }

    fn key_dir_of(clients: &[TestClient]) -> BTreeMap<ClientId, KeyBundle> {
        clients
            .iter()
            .map(|c| {
                (
                    c.id.clone(),
                    KeyBundle {
                        c_pk: [0u8; 32],
                        s_pk: c.s_pair.public_bytes(),
                        sig: vec![],
                    },
                )
            })
            .collect()
    }

    fn mask_for(client: &TestClient, peers: &[TestClient], x: &[f64], shape: &[usize]) -> Vec<f64> {
        let pairwise: Vec<(ClientId, u32)> = peers
            .iter()
            .filter(|p| p.id != client.id)
            .map(|p| {
                let shared = client.s_pair.agree(&p.s_pair.public_bytes());
                (p.id.clone(), pairwise_seed(&shared))
            })
            .collect();
        mask_input(&client.id, x, shape, client.seed, &pairwise).unwrap()
    }

    /// Full-strength sharing for tests: every peer holds every share.
    fn all_shares(secret: &[u8], n: usize) -> Vec<Share> {
        shamir::share(secret, 2, n, &mut OsRng).unwrap()
    }

    #[test]
    fn unmask_recovers_the_sum_without_dropouts() {
        let shape = [2usize];
        let clients = build_clients(&["1", "2", "3"]);
        let inputs = [vec![1.0, 2.0], vec![3.0, 4.0], vec![5.0, 6.0]];

        let key_dir = key_dir_of(&clients);
        let ids: BTreeSet<ClientId> = clients.iter().map(|c| c.id.clone()).collect();

        let masked: BTreeMap<ClientId, Vec<f64>> = clients
            .iter()
            .zip(&inputs)
            .map(|(c, x)| (c.id.clone(), mask_for(c, &clients, x, &shape)))
            .collect();

        let seed_shares: BTreeMap<ClientId, Vec<Share>> = clients
            .iter()
            .map(|c| (c.id.clone(), all_shares(&seed_to_bytes(c.seed), 3)))
            .collect();

        let output = unmask(
            &shape,
            &key_dir,
            &ids,
            &ids,
            &masked,
            &BTreeMap::new(),
            &seed_shares,
        )
        .unwrap();

        let expected = [9.0, 12.0];
        for (o, e) in output.iter().zip(expected) {
            assert!((o - e).abs() < 1e-6, "got {o}, expected {e}");
        }
    }

    #[test]
    fn unmask_repairs_a_masking_phase_dropout() {
        let shape = [2usize];
        let clients = build_clients(&["1", "2", "3"]);
        let inputs = [vec![1.0, 2.0], vec![3.0, 4.0], vec![5.0, 6.0]];

        let key_dir = key_dir_of(&clients);
        let u2: BTreeSet<ClientId> = clients.iter().map(|c| c.id.clone()).collect();
        // client 3 drops after sharing but before masking
        let u3: BTreeSet<ClientId> = [&clients[0], &clients[1]]
            .iter()
            .map(|c| c.id.clone())
            .collect();

        let masked: BTreeMap<ClientId, Vec<f64>> = clients[..2]
            .iter()
            .zip(&inputs[..2])
            .map(|(c, x)| (c.id.clone(), mask_for(c, &clients, x, &shape)))
            .collect();

        let mut key_shares = BTreeMap::new();
        key_shares.insert(
            clients[2].id.clone(),
            all_shares(&clients[2].s_pair.secret_bytes(), 3),
        );

        let seed_shares: BTreeMap<ClientId, Vec<Share>> = clients[..2]
            .iter()
            .map(|c| (c.id.clone(), all_shares(&seed_to_bytes(c.seed), 3)))
            .collect();

        let output = unmask(&shape, &key_dir, &u2, &u3, &masked, &key_shares, &seed_shares).unwrap();

        let expected = [4.0, 6.0];
        for (o, e) in output.iter().zip(expected) {
            assert!((o - e).abs() < 1e-6, "got {o}, expected {e}");
        }
    }

    #[test]
    fn unmask_fails_without_dropout_key_shares() {
        let shape = [1usize];
        let clients = build_clients(&["1", "2"]);
        let key_dir = key_dir_of(&clients);

        let u2: BTreeSet<ClientId> = clients.iter().map(|c| c.id.clone()).collect();
        let u3: BTreeSet<ClientId> = [clients[0].id.clone()].into();
        let masked: BTreeMap<ClientId, Vec<f64>> =
            [(clients[0].id.clone(), vec![1.0])].into_iter().collect();
        let seed_shares: BTreeMap<ClientId, Vec<Share>> = [(
            clients[0].id.clone(),
            all_shares(&seed_to_bytes(clients[0].seed), 2),
        )]
        .into_iter()
        .collect();

        let result = unmask(
            &shape,
            &key_dir,
            &u2,
            &u3,
            &masked,
            &BTreeMap::new(),
            &seed_shares,
        );
        assert!(matches!(result, Err(RoundError::Internal(_))));
    }
}
