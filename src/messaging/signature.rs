use std::fmt::{Debug, Formatter};

use anyhow::anyhow;
use bytes::{Buf, BufMut, Bytes};
use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};

use crate::util::buf_ext::{BufExt, BufMutExt};

/// An encoded public key. Its interpretation is up to the [SignatureProvider] that created it.
#[derive(Clone, Eq, PartialEq, Hash)]
pub struct PublicKey(pub Bytes);

#[derive(Clone, Eq, PartialEq)]
pub struct PrivateKey(pub Bytes);

#[derive(Clone, Eq, PartialEq, Hash)]
pub struct Signature(pub Bytes);

impl Debug for PublicKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey({} bytes)", self.0.len())
    }
}
impl Debug for PrivateKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "PrivateKey(..)")
    }
}
impl Debug for Signature {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Signature({} bytes)", self.0.len())
    }
}

#[derive(Clone, Debug)]
pub struct KeyPair {
    pub public_key: PublicKey,
    pub private_key: PrivateKey,
}

const MAX_KEY_LEN: usize = 1024;
const MAX_SIGNATURE_LEN: usize = 1024;

/// Signs and verifies message bytes, and embeds public keys in message headers.
pub trait SignatureProvider: Send + Sync + 'static {
    fn generate_key_pair(&self) -> KeyPair;

    fn sign(&self, private_key: &PrivateKey, data: &[u8]) -> anyhow::Result<Signature>;

    /// `false` for a malformed key or signature as well as for a signature that does not match
    fn verify(&self, public_key: &PublicKey, data: &[u8], signature: &Signature) -> bool;

    fn encode_public_key(&self, public_key: &PublicKey, buf: &mut dyn BufMut) {
        let mut buf = buf;
        buf.put_len_prefixed(&public_key.0);
    }

    fn decode_public_key(&self, buf: &mut dyn Buf) -> anyhow::Result<PublicKey> {
        let mut buf = buf;
        Ok(PublicKey(buf.try_get_len_prefixed(MAX_KEY_LEN)?))
    }

    fn encode_signature(&self, signature: &Signature, buf: &mut dyn BufMut) {
        let mut buf = buf;
        buf.put_len_prefixed(&signature.0);
    }

    fn decode_signature(&self, buf: &mut dyn Buf) -> anyhow::Result<Signature> {
        let mut buf = buf;
        Ok(Signature(buf.try_get_len_prefixed(MAX_SIGNATURE_LEN)?))
    }
}

pub struct Ed25519SignatureProvider;

impl Ed25519SignatureProvider {
    fn signing_key(private_key: &PrivateKey) -> anyhow::Result<SigningKey> {
        let bytes: [u8; 32] = private_key.0.as_ref().try_into()
            .map_err(|_| anyhow!("Ed25519 private key must be 32 bytes, was {}", private_key.0.len()))?;
        Ok(SigningKey::from_bytes(&bytes))
    }
}

impl SignatureProvider for Ed25519SignatureProvider {
    fn generate_key_pair(&self) -> KeyPair {
        let seed: [u8; 32] = rand::random();
        let signing_key = SigningKey::from_bytes(&seed);
        KeyPair {
            public_key: PublicKey(Bytes::copy_from_slice(signing_key.verifying_key().as_bytes())),
            private_key: PrivateKey(Bytes::copy_from_slice(&seed)),
        }
    }

    fn sign(&self, private_key: &PrivateKey, data: &[u8]) -> anyhow::Result<Signature> {
        let signing_key = Self::signing_key(private_key)?;
        let signature = signing_key.sign(data);
        Ok(Signature(Bytes::copy_from_slice(&signature.to_bytes())))
    }

    fn verify(&self, public_key: &PublicKey, data: &[u8], signature: &Signature) -> bool {
        let Ok(key_bytes) = <[u8; 32]>::try_from(public_key.0.as_ref()) else {
            return false;
        };
        let Ok(verifying_key) = VerifyingKey::from_bytes(&key_bytes) else {
            return false;
        };
        let Ok(signature) = ed25519_dalek::Signature::from_slice(&signature.0) else {
            return false;
        };
        verifying_key.verify(data, &signature).is_ok()
    }
}

#[cfg(test)]
mod test {
    use bytes::BytesMut;

    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let provider = Ed25519SignatureProvider;
        let key_pair = provider.generate_key_pair();

        let signature = provider.sign(&key_pair.private_key, b"payload").unwrap();
        assert!(provider.verify(&key_pair.public_key, b"payload", &signature));
        assert!(!provider.verify(&key_pair.public_key, b"payload!", &signature));

        let other = provider.generate_key_pair();
        assert!(!provider.verify(&other.public_key, b"payload", &signature));
    }

    #[test]
    fn test_verify_rejects_malformed_input() {
        let provider = Ed25519SignatureProvider;
        let key_pair = provider.generate_key_pair();
        let signature = provider.sign(&key_pair.private_key, b"x").unwrap();

        assert!(!provider.verify(&PublicKey(Bytes::from_static(b"short")), b"x", &signature));
        assert!(!provider.verify(&key_pair.public_key, b"x", &Signature(Bytes::from_static(b"short"))));
    }

    #[test]
    fn test_sign_rejects_bad_private_key() {
        assert!(Ed25519SignatureProvider.sign(&PrivateKey(Bytes::from_static(b"abc")), b"x").is_err());
    }

    #[test]
    fn test_public_key_encoding() {
        let provider = Ed25519SignatureProvider;
        let key_pair = provider.generate_key_pair();

        let mut buf = BytesMut::new();
        provider.encode_public_key(&key_pair.public_key, &mut buf);
        assert_eq!(buf.len(), 33);

        let mut b = buf.freeze();
        assert_eq!(provider.decode_public_key(&mut b).unwrap(), key_pair.public_key);
    }
}
