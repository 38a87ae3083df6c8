use anyhow::Context;
use ed25519_dalek::{Signature, VerifyingKey};
use sha2::{Digest as _, Sha256};
use std::collections::BTreeSet;
use std::fmt;

pub const DIGEST_LEN: usize = 32;
pub const SIGNATURE_LEN: usize = 64;
pub const PUBLIC_KEY_LEN: usize = 32;

pub type Digest = [u8; DIGEST_LEN];

/// Running SHA-256 over a byte stream.
#[derive(Clone, Default)]
pub struct HashState {
  inner: Sha256,
}

impl fmt::Debug for HashState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str("HashState(sha256)")
  }
}

impl HashState {
  pub fn new() -> Self {
    Self { inner: Sha256::new() }
  }

  pub fn update(&mut self, bytes: &[u8]) {
    self.inner.update(bytes);
  }

  pub fn finalize(self) -> Digest {
    self.inner.finalize().into()
  }
}

/// Raw signature bytes as carried by a manifest. Not validated until
/// [`verify`] runs, so a garbage signature is representable and simply
/// never matches.
#[derive(Clone, PartialEq, Eq)]
pub struct ManifestSignature([u8; SIGNATURE_LEN]);

impl ManifestSignature {
  pub fn from_hex(text: &str) -> anyhow::Result<Self> {
    let raw = hex::decode(text.trim()).context("decode signature hex")?;
    let arr: [u8; SIGNATURE_LEN] = raw
      .try_into()
      .map_err(|_| anyhow::anyhow!("invalid signature length (expected {SIGNATURE_LEN} bytes)"))?;
    Ok(Self(arr))
  }

  pub fn from_bytes(bytes: [u8; SIGNATURE_LEN]) -> Self {
    Self(bytes)
  }
}

impl fmt::Debug for ManifestSignature {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "ManifestSignature({}..)", hex::encode(&self.0[..4]))
  }
}

/// Raw public key bytes from the configuration.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PublicKey([u8; PUBLIC_KEY_LEN]);

impl PublicKey {
  pub fn from_hex(text: &str) -> anyhow::Result<Self> {
    let raw = hex::decode(text.trim()).context("decode public key hex")?;
    let arr: [u8; PUBLIC_KEY_LEN] = raw
      .try_into()
      .map_err(|_| anyhow::anyhow!("public key must be {PUBLIC_KEY_LEN} bytes (ed25519)"))?;
    Ok(Self(arr))
  }

  pub fn from_bytes(bytes: [u8; PUBLIC_KEY_LEN]) -> Self {
    Self(bytes)
  }

  fn verifying_key(&self) -> Option<VerifyingKey> {
    VerifyingKey::from_bytes(&self.0).ok()
  }
}

impl fmt::Debug for PublicKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "PublicKey({})", hex::encode(self.0))
  }
}

/// Counts distinct (signature, key) pairings that verify against `digest`.
///
/// Every signature is matched against at most one key and every key
/// against at most one signature, so neither a signature that happens to
/// validate under several keys nor a key that signed twice can inflate the
/// count. Keys or signatures that do not decode are treated as
/// non-matching.
pub fn verify(digest: &Digest, signatures: &[ManifestSignature], pubkeys: &BTreeSet<PublicKey>) -> usize {
  let mut used = vec![false; signatures.len()];
  let mut good = 0;

  for key in pubkeys {
    let Some(vk) = key.verifying_key() else {
      tracing::debug!(key = ?key, "ignoring undecodable public key");
      continue;
    };

    for (idx, sig) in signatures.iter().enumerate() {
      if used[idx] {
        continue;
      }
      let sig = Signature::from_bytes(&sig.0);
      if vk.verify_strict(digest, &sig).is_ok() {
        used[idx] = true;
        good += 1;
        break;
      }
    }
  }

  good
}

#[cfg(test)]
mod tests {
  use super::*;
  use ed25519_dalek::{Signer, SigningKey};

  fn keypair(seed: u8) -> (SigningKey, PublicKey) {
    let sk = SigningKey::from_bytes(&[seed; 32]);
    let pk = PublicKey::from_bytes(sk.verifying_key().to_bytes());
    (sk, pk)
  }

  fn sign(sk: &SigningKey, digest: &Digest) -> ManifestSignature {
    ManifestSignature::from_bytes(sk.sign(digest).to_bytes())
  }

  fn digest_of(data: &[u8]) -> Digest {
    let mut h = HashState::new();
    h.update(data);
    h.finalize()
  }

  #[test]
  fn hash_matches_known_sha256() {
    let d = digest_of(b"abc");
    assert_eq!(
      hex::encode(d),
      "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
    );
  }

  #[test]
  fn hash_is_independent_of_chunking() {
    let mut h = HashState::new();
    h.update(b"BRANCH=st");
    h.update(b"able\n");
    assert_eq!(h.finalize(), digest_of(b"BRANCH=stable\n"));
  }

  #[test]
  fn counts_each_valid_signature_once() {
    let digest = digest_of(b"manifest body");
    let (sk1, pk1) = keypair(1);
    let (sk2, pk2) = keypair(2);
    let (_, pk3) = keypair(3);
    let keys: BTreeSet<_> = [pk1, pk2, pk3].into_iter().collect();

    let sigs = vec![sign(&sk1, &digest), sign(&sk2, &digest)];
    assert_eq!(verify(&digest, &sigs, &keys), 2);
  }

  #[test]
  fn duplicate_signature_from_one_key_counts_once() {
    let digest = digest_of(b"manifest body");
    let (sk1, pk1) = keypair(1);
    let (_, pk2) = keypair(2);
    let keys: BTreeSet<_> = [pk1, pk2].into_iter().collect();

    let sig = sign(&sk1, &digest);
    let sigs = vec![sig.clone(), sig.clone(), sig];
    assert_eq!(verify(&digest, &sigs, &keys), 1);
  }

  #[test]
  fn signature_over_other_digest_is_rejected() {
    let digest = digest_of(b"manifest body");
    let other = digest_of(b"tampered body");
    let (sk1, pk1) = keypair(1);
    let keys: BTreeSet<_> = [pk1].into_iter().collect();

    let sigs = vec![sign(&sk1, &other)];
    assert_eq!(verify(&digest, &sigs, &keys), 0);
  }

  #[test]
  fn garbage_signatures_and_keys_degrade_to_zero() {
    let digest = digest_of(b"manifest body");
    let keys: BTreeSet<_> = [PublicKey::from_bytes([0xff; 32])].into_iter().collect();
    let sigs = vec![ManifestSignature::from_bytes([0u8; 64])];
    assert_eq!(verify(&digest, &sigs, &keys), 0);
    assert_eq!(verify(&digest, &[], &BTreeSet::new()), 0);
  }

  #[test]
  fn hex_parsing_rejects_wrong_lengths() {
    assert!(ManifestSignature::from_hex("abcd").is_err());
    assert!(ManifestSignature::from_hex(&"zz".repeat(64)).is_err());
    assert!(ManifestSignature::from_hex(&"00".repeat(64)).is_ok());
    assert!(PublicKey::from_hex(&"11".repeat(31)).is_err());
    assert!(PublicKey::from_hex(&format!("  {}\n", "11".repeat(32))).is_ok());
  }
}
