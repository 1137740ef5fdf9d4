//! The client: a linear per-round program over the five phases.
//!
//! Submissions go to the aggregator's phase ports over fresh TCP
//! connections; deliveries (key directory, inbox, survivor set, signature
//! map) arrive on the client's own delivery listener, accepted one at a
//! time in phase order. Each phase is a separate method so tests can model
//! a client that drops out mid-round by simply not calling the rest.

use crate::config::{KeyDirTransport, NetworkConfig, ProtocolConfig};
use crate::framing::{self, read_frame, write_frame};
use crate::registry::KeyDirectory;
use rand::rngs::OsRng;
use secagg_core::aead::{self, share_nonce};
use secagg_core::ka::DhKeyPair;
use secagg_core::masking::{self, pairwise_seed, seed_to_bytes};
use secagg_core::shamir::{self, Share};
use secagg_core::sign::{
    sign_key_bundle, sign_survivor_set, verify_key_bundle, verify_survivor_set, SigningKey,
};
use secagg_core::wire::{self, KeyBundle, Message, SharePayload};
use secagg_core::{ClientId, SecAggError};
use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("transport: {0}")]
    Transport(#[from] std::io::Error),

    #[error(transparent)]
    Core(#[from] SecAggError),

    /// The aggregator sent something other than what this phase expects.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// A peer signed a different survivor set than this client received;
    /// dissent has been sent and the round is abandoned locally.
    #[error("survivor transcript mismatch for client {0}")]
    Inconsistent(ClientId),
}

pub struct Client {
    id: ClientId,
    signing_key: SigningKey,
    directory: KeyDirectory,
    protocol: ProtocolConfig,
    network: NetworkConfig,
    delivery: TcpListener,
    broadcast: Option<UdpSocket>,
    round_index: u64,

    // round-scoped state, cleared by `reset`
    c_pair: Option<DhKeyPair>,
    s_pair: Option<DhKeyPair>,
    private_seed: Option<u32>,
    own_seed_share: Option<Share>,
    key_dir: BTreeMap<ClientId, KeyBundle>,
    inbox: BTreeMap<ClientId, Vec<u8>>,
    survivors: BTreeSet<ClientId>,
    survivor_bytes: Vec<u8>,
}

impl Client {
    /// Bind the delivery listener (and the broadcast receiver when the key
    /// directory travels over UDP) and prepare for round zero.
    pub async fn bind(
        id: ClientId,
        signing_key: SigningKey,
        directory: KeyDirectory,
        protocol: ProtocolConfig,
        network: NetworkConfig,
        delivery_port: u16,
    ) -> anyhow::Result<Self> {
        if id.is_empty() {
            anyhow::bail!("client id must be non-empty");
        }
        protocol.validate()?;

        let delivery = TcpListener::bind((network.bind_host.as_str(), delivery_port)).await?;
        let broadcast = match network.key_dir_transport {
            KeyDirTransport::Broadcast => {
                Some(framing::bind_broadcast_listener(network.broadcast_port)?)
            }
            KeyDirTransport::Tcp => None,
        };

        info!(id = %id, addr = %delivery.local_addr()?, "client listening for deliveries");

        Ok(Self {
            id,
            signing_key,
            directory,
            protocol,
            network,
            delivery,
            broadcast,
            round_index: 0,
            c_pair: None,
            s_pair: None,
            private_seed: None,
            own_seed_share: None,
            key_dir: BTreeMap::new(),
            inbox: BTreeMap::new(),
            survivors: BTreeSet::new(),
            survivor_bytes: Vec::new(),
        })
    }

    pub fn id(&self) -> &ClientId {
        &self.id
    }

    pub fn delivery_addr(&self) -> std::io::Result<SocketAddr> {
        self.delivery.local_addr()
    }

    /// Phase 1: advertise fresh ephemeral keys, then wait for the key
    /// directory.
    pub async fn advertise_keys(&mut self) -> Result<(), ClientError> {
        let c_pair = DhKeyPair::generate(&mut OsRng);
        let s_pair = DhKeyPair::generate(&mut OsRng);
        let c_pk = c_pair.public_bytes();
        let s_pk = s_pair.public_bytes();
        let sig = sign_key_bundle(&self.signing_key, &c_pk, &s_pk);

        self.submit(
            self.network.advertise_port,
            &Message::Advertise {
                id: self.id.clone(),
                bundle: KeyBundle {
                    c_pk,
                    s_pk,
                    sig: sig.to_bytes().to_vec(),
                },
            },
        )
        .await?;

        let payload = match self.network.key_dir_transport {
            KeyDirTransport::Tcp => self.receive_delivery().await?,
            KeyDirTransport::Broadcast => {
                let sock = self.broadcast.as_ref().ok_or_else(|| {
                    ClientError::Protocol("broadcast transport configured without a socket".into())
                })?;
                framing::recv_broadcast(sock).await?
            }
        };
        match wire::decode(&payload)? {
            Message::KeyDirectory(map) => self.key_dir = map,
            other => return Err(unexpected("key directory", &other)),
        }
        info!(id = %self.id, peers = self.key_dir.len(), "received key directory");

        self.c_pair = Some(c_pair);
        self.s_pair = Some(s_pair);
        Ok(())
    }

    /// Phase 2: verify every advertised bundle, Shamir-share the "s"
    /// secret and a fresh private seed, and send the encrypted shares.
    pub async fn share_keys(&mut self) -> Result<(), ClientError> {
        for (peer, bundle) in &self.key_dir {
            let key = self
                .directory
                .get(peer)
                .ok_or_else(|| SecAggError::SignatureInvalid(peer.clone()))?;
            verify_key_bundle(peer, key, &bundle.c_pk, &bundle.s_pk, &bundle.sig)?;
        }

        let c_pair = self.round_pair(&self.c_pair)?;
        let s_pair = self.round_pair(&self.s_pair)?;
        let seed: u32 = rand::random();
        let members: Vec<ClientId> = self.key_dir.keys().cloned().collect();
        let threshold = self.protocol.threshold();

        let key_shares = shamir::share(&s_pair.secret_bytes(), threshold, members.len(), &mut OsRng)?;
        let seed_shares = shamir::share(&seed_to_bytes(seed), threshold, members.len(), &mut OsRng)?;

        let mut ciphertexts = BTreeMap::new();
        let mut own_seed_share = None;
        for (i, peer) in members.iter().enumerate() {
            if *peer == self.id {
                // keep the own-index seed share: it is released in phase 5
                // if this client survives, so b can be reconstructed from a
                // full t shares even when exactly t clients finish
                own_seed_share = Some(seed_shares[i].clone());
                continue;
            }
            let bundle = &self.key_dir[peer];
            let shared = c_pair.agree(&bundle.c_pk);
            let nonce = share_nonce(&self.id, peer, self.round_index);
            let payload = wire::encode_share_payload(&SharePayload {
                sender: self.id.clone(),
                recipient: peer.clone(),
                key_share: key_shares[i].clone(),
                seed_share: seed_shares[i].clone(),
            })?;
            ciphertexts.insert(peer.clone(), aead::encrypt(&shared, &nonce, &payload)?);
        }

        self.submit(
            self.network.share_port,
            &Message::Shares {
                id: self.id.clone(),
                ciphertexts,
            },
        )
        .await?;

        let payload = self.receive_delivery().await?;
        match wire::decode(&payload)? {
            Message::Inbox(map) => self.inbox = map,
            other => return Err(unexpected("inbox", &other)),
        }
        info!(id = %self.id, shares = self.inbox.len(), "received share inbox");

        self.private_seed = Some(seed);
        self.own_seed_share = own_seed_share;
        Ok(())
    }

    /// Phase 3: mask the input vector and submit it.
    pub async fn mask_input(&mut self, input: &[f64]) -> Result<(), ClientError> {
        let s_pair = self.round_pair(&self.s_pair)?;
        let seed = self
            .private_seed
            .ok_or_else(|| ClientError::Protocol("mask_input before share_keys".into()))?;

        let mut pairwise = Vec::with_capacity(self.inbox.len());
        for peer in self.inbox.keys() {
            let bundle = self.key_dir.get(peer).ok_or_else(|| {
                ClientError::Protocol(format!("inbox sender {peer} missing from key directory"))
            })?;
            pairwise.push((peer.clone(), pairwise_seed(&s_pair.agree(&bundle.s_pk))));
        }

        let masked = masking::mask_input(&self.id, input, &self.protocol.shape, seed, &pairwise)?;
        self.submit(
            self.network.masking_port,
            &Message::MaskedInput {
                id: self.id.clone(),
                vector: masked,
            },
        )
        .await?;
        info!(id = %self.id, peers = pairwise.len(), "submitted masked input");
        Ok(())
    }

    /// Phase 4: sign the survivor set exactly as received, then cross-check
    /// every other signature. A mismatch sends dissent and aborts the round.
    pub async fn consistency_check(&mut self) -> Result<(), ClientError> {
        let payload = self.receive_delivery().await?;
        let survivors = match wire::decode(&payload)? {
            Message::SurvivorSet(set) => set,
            other => return Err(unexpected("survivor set", &other)),
        };

        let sig = sign_survivor_set(&self.signing_key, &payload);
        self.submit(
            self.network.consistency_port,
            &Message::SurvivorSig {
                id: self.id.clone(),
                sig: sig.to_bytes().to_vec(),
            },
        )
        .await?;
        self.survivors = survivors;
        self.survivor_bytes = payload;

        let payload = self.receive_delivery().await?;
        let signature_map = match wire::decode(&payload)? {
            Message::SignatureMap(map) => map,
            other => return Err(unexpected("signature map", &other)),
        };

        for (peer, sig) in &signature_map {
            let verified = self
                .directory
                .get(peer)
                .map(|key| verify_survivor_set(peer, key, &self.survivor_bytes, sig).is_ok())
                .unwrap_or(false);

            if !verified {
                warn!(id = %self.id, peer = %peer, "survivor signature mismatch, dissenting");
                self.submit(
                    self.network.consistency_port,
                    &Message::Dissent {
                        id: self.id.clone(),
                    },
                )
                .await?;
                return Err(ClientError::Inconsistent(peer.clone()));
            }
        }
        info!(id = %self.id, signers = signature_map.len(), "survivor transcript consistent");
        Ok(())
    }

    /// Phase 5: open the inbox ciphertexts and release, per peer, the key
    /// share for dropouts or the seed share for survivors — never both.
    pub async fn unmask(&mut self) -> Result<(), ClientError> {
        let c_pair = self.round_pair(&self.c_pair)?;

        let mut key_shares = BTreeMap::new();
        let mut seed_shares = BTreeMap::new();
        for (peer, ciphertext) in &self.inbox {
            let bundle = self.key_dir.get(peer).ok_or_else(|| {
                ClientError::Protocol(format!("inbox sender {peer} missing from key directory"))
            })?;
            let shared = c_pair.agree(&bundle.c_pk);
            let nonce = share_nonce(peer, &self.id, self.round_index);
            let plaintext = aead::decrypt(&shared, &nonce, ciphertext)?;
            let payload = wire::decode_share_payload(&plaintext)?;
            if payload.sender != *peer || payload.recipient != self.id {
                return Err(ClientError::Protocol(format!(
                    "share payload from {peer} is misaddressed"
                )));
            }

            if self.survivors.contains(peer) {
                seed_shares.insert(peer.clone(), payload.seed_share);
            } else {
                key_shares.insert(peer.clone(), payload.key_share);
            }
        }

        // a surviving client also releases its own seed share (its "s" key
        // share is never released, for anyone)
        if self.survivors.contains(&self.id) {
            if let Some(share) = self.own_seed_share.clone() {
                seed_shares.insert(self.id.clone(), share);
            }
        }

        info!(
            id = %self.id,
            dropouts = key_shares.len(),
            survivors = seed_shares.len(),
            "releasing recovery shares"
        );
        self.submit(
            self.network.unmasking_port,
            &Message::UnmaskShares {
                id: self.id.clone(),
                key_shares,
                seed_shares,
            },
        )
        .await
    }

    /// One full round.
    pub async fn run_round(&mut self, input: &[f64]) -> Result<(), ClientError> {
        self.advertise_keys().await?;
        self.share_keys().await?;
        self.mask_input(input).await?;
        self.consistency_check().await?;
        self.unmask().await
    }

    /// Clear round-scoped state for the next round.
    pub fn reset(&mut self) {
        self.round_index += 1;
        self.c_pair = None;
        self.s_pair = None;
        self.private_seed = None;
        self.own_seed_share = None;
        self.key_dir.clear();
        self.inbox.clear();
        self.survivors.clear();
        self.survivor_bytes.clear();
    }

    fn round_pair<'a>(&self, pair: &'a Option<DhKeyPair>) -> Result<&'a DhKeyPair, ClientError> {
        pair.as_ref()
            .ok_or_else(|| ClientError::Protocol("phase run before advertise_keys".into()))
    }

    async fn submit(&self, port: u16, message: &Message) -> Result<(), ClientError> {
        let payload = wire::encode(message)?;
        let addr = (self.network.aggregator_host.as_str(), port);
        let mut stream = TcpStream::connect(addr).await?;
        write_frame(&mut stream, &payload).await?;
        Ok(())
    }

    async fn receive_delivery(&self) -> Result<Vec<u8>, ClientError> {
        let (mut stream, _) = self.delivery.accept().await?;
        Ok(read_frame(&mut stream).await?)
    }
}

fn unexpected(wanted: &str, got: &Message) -> ClientError {
    ClientError::Protocol(format!("expected {wanted}, got {got:?}"))
}
