//! Double Ratchet session.
//!
//! - HKDF-SHA256 for root, chain and message key derivation
//! - X25519 for the Diffie-Hellman ratchet
//! - AES-256-GCM per message, header bound as associated data
//!
//! Every session starts from fresh ratchet keypairs announced in the signed
//! presence exchange. The initiator (CLI) derives its first sending chain
//! from the static-static secret and `DH(own ratchet, responder ratchet)`;
//! the responder (browser) derives the matching chain when the first message
//! arrives and can only send after that. Two sessions between the same
//! devices therefore never share a chain key, and envelopes recorded from an
//! earlier session do not decrypt in a later one.
//!
//! Decryption is transactional. Chain advancement, skipped keys and DH steps
//! are staged on a copy of the state and committed only after the tag
//! verifies, so a forged envelope leaves the session untouched.
//!
//! Reference: https://signal.org/docs/specifications/doubleratchet/

use aes_gcm::{
    aead::{AeadInPlace, KeyInit},
    Aes256Gcm, Nonce, Tag,
};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use std::collections::{BTreeMap, HashMap};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::config::{DEFAULT_MAX_SKIPPED_KEYS, DEFAULT_MAX_SKIP_PER_MESSAGE};
use crate::envelope::{binary_format::NONCE_SIZE, Envelope, RatchetHeader};
use crate::error::{Result, SessionError};

type Key = [u8; 32];

const INIT_INFO: &[u8] = b"botster-e2e/ratchet-init";
const ROOT_INFO: &[u8] = b"botster-e2e/ratchet-root";
const CHAIN_INFO: &[u8] = b"botster-e2e/ratchet-chain";
const MESSAGE_INFO: &[u8] = b"botster-e2e/ratchet-message";

/// Memory bounds for out-of-order delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RatchetLimits {
    /// Capacity of the skipped message-key cache; oldest entries are evicted.
    pub max_skipped_keys: usize,
    /// Largest counter jump a single envelope may request.
    pub max_skip_per_message: u32,
}

impl Default for RatchetLimits {
    fn default() -> Self {
        Self {
            max_skipped_keys: DEFAULT_MAX_SKIPPED_KEYS,
            max_skip_per_message: DEFAULT_MAX_SKIP_PER_MESSAGE,
        }
    }
}

fn decrypt_error(msg: impl Into<String>) -> SessionError {
    SessionError::Decrypt(msg.into())
}

/// HKDF-SHA256 producing two 32-byte keys.
fn kdf(input_key: &[u8], salt: &[u8], info: &[u8]) -> Result<(Zeroizing<Key>, Zeroizing<Key>)> {
    let hk = Hkdf::<Sha256>::new(Some(salt), input_key);
    let mut output = Zeroizing::new([0u8; 64]);
    hk.expand(info, &mut output[..])
        .map_err(|e| decrypt_error(format!("HKDF expansion failed: {e}")))?;

    let mut first = Zeroizing::new([0u8; 32]);
    let mut second = Zeroizing::new([0u8; 32]);
    first.copy_from_slice(&output[..32]);
    second.copy_from_slice(&output[32..]);
    Ok((first, second))
}

/// Symmetric ratchet step: `(next_chain_key, message_key)`.
fn kdf_chain(chain_key: &Key) -> Result<(Zeroizing<Key>, Zeroizing<Key>)> {
    kdf(chain_key, &[0u8; 32], CHAIN_INFO)
}

/// DH ratchet step: `(next_root_key, chain_key)`.
fn kdf_root(root_key: &Key, dh_output: &Key) -> Result<(Zeroizing<Key>, Zeroizing<Key>)> {
    kdf(dh_output, root_key, ROOT_INFO)
}

fn cipher_for(message_key: &Key) -> Result<Aes256Gcm> {
    let hk = Hkdf::<Sha256>::new(None, message_key);
    let mut key = Zeroizing::new([0u8; 32]);
    hk.expand(MESSAGE_INFO, &mut key[..])
        .map_err(|e| decrypt_error(format!("HKDF expansion failed: {e}")))?;
    Ok(Aes256Gcm::new((&*key).into()))
}

/// Nonce for a message counter. Message keys are single-use, so the counter
/// alone keeps (key, nonce) pairs unique.
fn nonce_for(counter: u32) -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    nonce[NONCE_SIZE - 4..].copy_from_slice(&counter.to_be_bytes());
    nonce
}

fn overwrite(slot: &mut Option<Key>, value: &Key) {
    match slot {
        Some(existing) => existing.copy_from_slice(value),
        None => *slot = Some(*value),
    }
}

fn random_key() -> Key {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    bytes
}

/// X25519 keypair for the DH ratchet.
///
/// A session's first keypair is generated before the handshake so its public
/// half can be signed into the presence announcement.
pub struct RatchetKeyPair {
    secret: Zeroizing<Key>,
    public: [u8; 32],
}

impl RatchetKeyPair {
    /// Fresh random keypair.
    pub fn generate() -> Self {
        let secret = Zeroizing::new(random_key());
        let public = PublicKey::from(&StaticSecret::from(*secret)).to_bytes();
        Self { secret, public }
    }

    /// Public half, as announced and carried in the first headers.
    pub fn public_key(&self) -> &[u8; 32] {
        &self.public
    }
}

impl std::fmt::Debug for RatchetKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RatchetKeyPair").finish_non_exhaustive()
    }
}

// ============================================================================
// Skipped message keys
// ============================================================================

/// (sender ratchet key, counter)
type SkippedKeyId = ([u8; 32], u32);

/// Bounded, insertion-ordered cache of message keys for late envelopes.
struct SkippedKeys {
    capacity: usize,
    next_seq: u64,
    keys: HashMap<SkippedKeyId, (u64, Key)>,
    order: BTreeMap<u64, SkippedKeyId>,
}

impl SkippedKeys {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            next_seq: 0,
            keys: HashMap::new(),
            order: BTreeMap::new(),
        }
    }

    fn len(&self) -> usize {
        self.keys.len()
    }

    fn get(&self, id: &SkippedKeyId) -> Option<&Key> {
        self.keys.get(id).map(|(_, key)| key)
    }

    fn insert(&mut self, id: SkippedKeyId, key: &Key) {
        if self.capacity == 0 {
            return;
        }
        self.remove(&id);
        while self.keys.len() >= self.capacity && self.evict_oldest() {}

        let seq = self.next_seq;
        self.next_seq += 1;
        self.order.insert(seq, id);
        self.keys.insert(id, (seq, *key));
    }

    fn remove(&mut self, id: &SkippedKeyId) {
        if let Some((seq, key)) = self.keys.get_mut(id) {
            key.zeroize();
            let seq = *seq;
            self.order.remove(&seq);
            self.keys.remove(id);
        }
    }

    fn evict_oldest(&mut self) -> bool {
        let Some((_, oldest)) = self.order.pop_first() else {
            return false;
        };
        if let Some((_, key)) = self.keys.get_mut(&oldest) {
            key.zeroize();
        }
        self.keys.remove(&oldest);
        log::trace!("Evicted oldest skipped message key (capacity {})", self.capacity);
        true
    }

    fn clear(&mut self) {
        for (_, key) in self.keys.values_mut() {
            key.zeroize();
        }
        self.keys.clear();
        self.order.clear();
    }
}

impl Drop for SkippedKeys {
    fn drop(&mut self) {
        self.clear();
    }
}

// ============================================================================
// Chain state
// ============================================================================

/// Everything a decrypt may change besides the skipped-key cache.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
struct ChainState {
    root_key: Key,
    send_chain_key: Option<Key>,
    recv_chain_key: Option<Key>,
    /// Our current ratchet private key.
    dh_private_key: Key,
    dh_public_key: [u8; 32],
    /// Peer's current ratchet public key.
    peer_public_key: Option<[u8; 32]>,
    /// Ratchet key the peer announced; the responder's first message must carry it.
    announced_peer_key: [u8; 32],
    send_count: u32,
    recv_count: u32,
    /// Messages sent in our previous sending chain.
    prev_chain_length: u32,
    is_initiator: bool,
}

/// Message keys derived while catching up, cached only on commit.
type Staged = Vec<(SkippedKeyId, Zeroizing<Key>)>;

impl ChainState {
    fn rotate_dh_keypair(&mut self) {
        self.dh_private_key = random_key();
        self.dh_public_key = PublicKey::from(&StaticSecret::from(self.dh_private_key)).to_bytes();
    }

    fn dh(&self, peer: &[u8; 32]) -> Result<Zeroizing<Key>> {
        let secret = StaticSecret::from(self.dh_private_key);
        let shared = secret.diffie_hellman(&PublicKey::from(*peer));
        if !shared.was_contributory() {
            return Err(decrypt_error("non-contributory ratchet key"));
        }
        Ok(Zeroizing::new(shared.to_bytes()))
    }

    /// Derive the receiving chain for a new peer ratchet key.
    fn receive_step(&mut self, peer: [u8; 32]) -> Result<()> {
        let dh = self.dh(&peer)?;
        let (root, chain) = kdf_root(&self.root_key, &dh)?;
        self.root_key.copy_from_slice(&*root);
        overwrite(&mut self.recv_chain_key, &chain);
        self.recv_count = 0;
        self.peer_public_key = Some(peer);
        Ok(())
    }

    /// Start a new sending chain under a fresh ratchet keypair.
    fn send_step(&mut self) -> Result<()> {
        let peer = self
            .peer_public_key
            .ok_or_else(|| decrypt_error("no peer ratchet key"))?;
        self.prev_chain_length = self.send_count;
        self.rotate_dh_keypair();
        let dh = self.dh(&peer)?;
        let (root, chain) = kdf_root(&self.root_key, &dh)?;
        self.root_key.copy_from_slice(&*root);
        overwrite(&mut self.send_chain_key, &chain);
        self.send_count = 0;
        Ok(())
    }

    fn next_recv_message_key(&mut self) -> Result<Zeroizing<Key>> {
        let chain = self
            .recv_chain_key
            .as_ref()
            .ok_or_else(|| decrypt_error("receiving chain not initialized"))?;
        let (next, message_key) = kdf_chain(chain)?;
        overwrite(&mut self.recv_chain_key, &next);
        self.recv_count = self
            .recv_count
            .checked_add(1)
            .ok_or_else(|| decrypt_error("receiving chain exhausted"))?;
        Ok(message_key)
    }

    /// Advance the receiving chain to `until`, staging every skipped key.
    fn skip_until(
        &mut self,
        until: u32,
        limits: &RatchetLimits,
        staged: &mut Staged,
    ) -> Result<()> {
        if until <= self.recv_count {
            return Ok(());
        }
        let gap = until - self.recv_count;
        if gap > limits.max_skip_per_message {
            return Err(decrypt_error(format!(
                "counter jump of {gap} exceeds limit of {}",
                limits.max_skip_per_message
            )));
        }
        let peer = self
            .peer_public_key
            .ok_or_else(|| decrypt_error("no peer ratchet key"))?;
        while self.recv_count < until {
            let counter = self.recv_count;
            let message_key = self.next_recv_message_key()?;
            staged.push(((peer, counter), message_key));
        }
        Ok(())
    }

    /// Locate the message key for `header`, performing any DH step it implies.
    fn message_key_for(
        &mut self,
        header: &RatchetHeader,
        limits: &RatchetLimits,
        staged: &mut Staged,
    ) -> Result<Zeroizing<Key>> {
        match self.peer_public_key {
            Some(current) if current == header.ratchet_key => {}
            Some(_) => {
                self.skip_until(header.previous_chain_length, limits, staged)?;
                self.receive_step(header.ratchet_key)?;
                self.send_step()?;
            }
            None => {
                if header.ratchet_key != self.announced_peer_key {
                    return Err(decrypt_error(
                        "first message does not carry the announced ratchet key",
                    ));
                }
                self.receive_step(header.ratchet_key)?;
                self.send_step()?;
            }
        }

        if header.counter < self.recv_count {
            return Err(decrypt_error(format!(
                "message {} already consumed or expired",
                header.counter
            )));
        }
        self.skip_until(header.counter, limits, staged)?;
        self.next_recv_message_key()
    }
}

// ============================================================================
// Session
// ============================================================================

/// Double Ratchet session for E2E encryption with forward secrecy.
///
/// Each message uses a unique key derived from the ratchet state.
/// Compromising one key doesn't compromise past or future messages.
/// All key material is wiped on [`RatchetSession::zeroize`] and on drop.
pub struct RatchetSession {
    chains: ChainState,
    skipped: SkippedKeys,
    limits: RatchetLimits,
    zeroized: bool,
}

impl ZeroizeOnDrop for RatchetSession {}

impl std::fmt::Debug for RatchetSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RatchetSession")
            .field("send_count", &self.chains.send_count)
            .field("recv_count", &self.chains.recv_count)
            .field("is_initiator", &self.chains.is_initiator)
            .field("skipped", &self.skipped.len())
            .field("zeroized", &self.zeroized)
            .finish_non_exhaustive()
    }
}

impl RatchetSession {
    /// Session for the side that sends first (the CLI).
    ///
    /// # Arguments
    /// * `shared_secret` - 32-byte output of the long-term X25519 exchange
    /// * `own_key` - our announced ratchet keypair
    /// * `peer_ratchet_key` - the responder's announced ratchet key
    /// * `limits` - bounds for out-of-order delivery
    pub fn initiator(
        shared_secret: &[u8; 32],
        own_key: RatchetKeyPair,
        peer_ratchet_key: &[u8; 32],
        limits: RatchetLimits,
    ) -> Result<Self> {
        let (mut session, dh) =
            Self::seed(shared_secret, own_key, peer_ratchet_key, true, limits)?;
        let (root, chain) = kdf_root(&session.chains.root_key, &dh)?;
        session.chains.root_key.copy_from_slice(&*root);
        session.chains.send_chain_key = Some(*chain);
        session.chains.peer_public_key = Some(*peer_ratchet_key);
        Ok(session)
    }

    /// Session for the side that waits for the first message (the browser).
    ///
    /// The sending chain appears once a message carrying `peer_ratchet_key`
    /// (the initiator's announced key) decrypts.
    pub fn responder(
        shared_secret: &[u8; 32],
        own_key: RatchetKeyPair,
        peer_ratchet_key: &[u8; 32],
        limits: RatchetLimits,
    ) -> Result<Self> {
        let (session, _) = Self::seed(shared_secret, own_key, peer_ratchet_key, false, limits)?;
        Ok(session)
    }

    fn seed(
        shared_secret: &[u8; 32],
        own_key: RatchetKeyPair,
        peer_ratchet_key: &[u8; 32],
        is_initiator: bool,
        limits: RatchetLimits,
    ) -> Result<(Self, Zeroizing<Key>)> {
        let (root_key, _) = kdf(shared_secret, &[0u8; 32], INIT_INFO)?;

        let chains = ChainState {
            root_key: *root_key,
            send_chain_key: None,
            recv_chain_key: None,
            dh_private_key: *own_key.secret,
            dh_public_key: own_key.public,
            peer_public_key: None,
            announced_peer_key: *peer_ratchet_key,
            send_count: 0,
            recv_count: 0,
            prev_chain_length: 0,
            is_initiator,
        };
        let dh = chains.dh(peer_ratchet_key).map_err(|_| {
            SessionError::WeakPeerKey("peer ratchet key is a low-order point".into())
        })?;

        let session = Self {
            chains,
            skipped: SkippedKeys::with_capacity(limits.max_skipped_keys),
            limits,
            zeroized: false,
        };
        Ok((session, dh))
    }

    fn ensure_live(&self) -> Result<()> {
        if self.zeroized {
            return Err(SessionError::NotReady("ratchet state has been zeroized".into()));
        }
        Ok(())
    }

    /// Whether a sending chain exists yet.
    pub fn can_send(&self) -> bool {
        !self.zeroized && self.chains.send_chain_key.is_some()
    }

    /// Whether this side sends first.
    pub fn is_initiator(&self) -> bool {
        self.chains.is_initiator
    }

    /// Current ratchet public key, as carried in outgoing headers.
    pub fn public_key(&self) -> &[u8; 32] {
        &self.chains.dh_public_key
    }

    /// Number of cached skipped message keys.
    pub fn skipped_keys(&self) -> usize {
        self.skipped.len()
    }

    /// Encrypt one message, advancing the sending chain.
    ///
    /// Fails with [`SessionError::NotReady`] on a responder that has not yet
    /// received anything, or after [`RatchetSession::zeroize`].
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Envelope> {
        self.ensure_live()?;
        let chain = self.chains.send_chain_key.as_ref().ok_or_else(|| {
            SessionError::NotReady("no sending chain until the peer's first message arrives".into())
        })?;
        let (next_chain, message_key) = kdf_chain(chain)?;

        let counter = self.chains.send_count;
        let next_count = counter
            .checked_add(1)
            .ok_or_else(|| SessionError::NotReady("sending chain exhausted".into()))?;

        let header = RatchetHeader {
            ratchet_key: self.chains.dh_public_key,
            previous_chain_length: self.chains.prev_chain_length,
            counter,
        };
        let nonce = nonce_for(counter);

        let mut buffer = plaintext.to_vec();
        let tag = cipher_for(&message_key)?
            .encrypt_in_place_detached(Nonce::from_slice(&nonce), &header.to_bytes(), &mut buffer)
            .map_err(|_| SessionError::Frame("payload too large to encrypt".into()))?;

        overwrite(&mut self.chains.send_chain_key, &next_chain);
        self.chains.send_count = next_count;

        let mut tag_bytes = [0u8; 16];
        tag_bytes.copy_from_slice(&tag);
        Ok(Envelope {
            header,
            nonce,
            tag: tag_bytes,
            ciphertext: buffer,
        })
    }

    /// Decrypt one envelope.
    ///
    /// On any failure the session state is exactly as before the call.
    pub fn decrypt(&mut self, envelope: &Envelope) -> Result<Vec<u8>> {
        self.ensure_live()?;
        let header = &envelope.header;

        if header.ratchet_key == self.chains.dh_public_key {
            return Err(decrypt_error("envelope carries our own ratchet key"));
        }
        if envelope.nonce != nonce_for(header.counter) {
            return Err(decrypt_error("nonce does not match message counter"));
        }

        let id = (header.ratchet_key, header.counter);
        if let Some(message_key) = self.skipped.get(&id) {
            let plaintext = open(message_key, envelope)?;
            self.skipped.remove(&id);
            return Ok(plaintext);
        }

        let mut next = self.chains.clone();
        let mut staged = Staged::new();
        let message_key = next.message_key_for(header, &self.limits, &mut staged)?;
        let plaintext = open(&message_key, envelope)?;

        self.chains = next;
        for (id, key) in &staged {
            self.skipped.insert(*id, key);
        }
        Ok(plaintext)
    }

    /// Overwrite all key material with zeros. Idempotent.
    pub fn zeroize(&mut self) {
        if self.zeroized {
            return;
        }
        self.chains.zeroize();
        self.skipped.clear();
        self.zeroized = true;
        log::debug!("Ratchet state zeroized");
    }

    /// Whether [`RatchetSession::zeroize`] has run.
    pub fn is_zeroized(&self) -> bool {
        self.zeroized
    }

    /// Every byte of secret state currently held.
    #[cfg(test)]
    pub(crate) fn key_material(&self) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&self.chains.root_key);
        bytes.extend_from_slice(&self.chains.dh_private_key);
        for chain in [&self.chains.send_chain_key, &self.chains.recv_chain_key]
            .into_iter()
            .flatten()
        {
            bytes.extend_from_slice(chain);
        }
        for (_, key) in self.skipped.keys.values() {
            bytes.extend_from_slice(key);
        }
        bytes
    }
}

/// Initiator/responder pair with freshly announced ratchet keys.
#[cfg(test)]
pub(crate) fn test_pair(
    shared_secret: &[u8; 32],
    limits: RatchetLimits,
) -> (RatchetSession, RatchetSession) {
    let cli_key = RatchetKeyPair::generate();
    let browser_key = RatchetKeyPair::generate();
    let cli_public = *cli_key.public_key();
    let browser_public = *browser_key.public_key();
    (
        RatchetSession::initiator(shared_secret, cli_key, &browser_public, limits).unwrap(),
        RatchetSession::responder(shared_secret, browser_key, &cli_public, limits).unwrap(),
    )
}

fn open(message_key: &Key, envelope: &Envelope) -> Result<Vec<u8>> {
    let mut buffer = envelope.ciphertext.clone();
    cipher_for(message_key)?
        .decrypt_in_place_detached(
            Nonce::from_slice(&envelope.nonce),
            &envelope.header.to_bytes(),
            &mut buffer,
            Tag::from_slice(&envelope.tag),
        )
        .map_err(|_| decrypt_error("authentication failed"))?;
    Ok(buffer)
}
