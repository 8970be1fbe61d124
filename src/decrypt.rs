//! Streaming AES-128-CBC segment decryption.
//!
//! Ciphertext arrives in arbitrary chunks. Complete blocks are decrypted as
//! soon as they are available, but the most recent plaintext block is held
//! back until the stream ends, because only then is it known to carry the
//! PKCS#7 padding. Memory use is bounded by two cipher blocks regardless of
//! segment size.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecryptMut, KeyIvInit};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use streamgate_common::{Error, Result};

type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

const BLOCK: usize = 16;

enum Cipher {
    /// IV is the first block of the payload.
    AwaitingIv,
    Ready(Aes128CbcDec),
}

/// Incremental AES-128-CBC decryptor with PKCS#7 unpadding.
pub struct SegmentDecryptor {
    key: [u8; BLOCK],
    cipher: Cipher,
    /// Ciphertext not yet forming a full block.
    pending: Vec<u8>,
    /// Last decrypted block, released on the next update or at finish.
    held: Option<[u8; BLOCK]>,
}

impl SegmentDecryptor {
    /// Decryptor with an explicit IV (`EXT-X-KEY` IV or media sequence).
    pub fn new(key: [u8; BLOCK], iv: [u8; BLOCK]) -> Self {
        Self {
            key,
            cipher: Cipher::Ready(Aes128CbcDec::new(&key.into(), &iv.into())),
            pending: Vec::with_capacity(BLOCK * 2),
            held: None,
        }
    }

    /// Decryptor that takes its IV from the first 16 bytes of the payload.
    pub fn with_leading_iv(key: [u8; BLOCK]) -> Self {
        Self {
            key,
            cipher: Cipher::AwaitingIv,
            pending: Vec::with_capacity(BLOCK * 2),
            held: None,
        }
    }

    /// Feed ciphertext, returning whatever plaintext is safe to release.
    pub fn update(&mut self, chunk: &[u8]) -> Bytes {
        self.pending.extend_from_slice(chunk);

        if let Cipher::AwaitingIv = self.cipher {
            if self.pending.len() < BLOCK {
                return Bytes::new();
            }
            let mut iv = [0u8; BLOCK];
            iv.copy_from_slice(&self.pending[..BLOCK]);
            self.pending.drain(..BLOCK);
            self.cipher = Cipher::Ready(Aes128CbcDec::new(&self.key.into(), &iv.into()));
        }
        let Cipher::Ready(decryptor) = &mut self.cipher else {
            return Bytes::new();
        };

        let full = self.pending.len() / BLOCK * BLOCK;
        if full == 0 {
            return Bytes::new();
        }

        let mut out = Vec::with_capacity(full + BLOCK);
        if let Some(held) = self.held.take() {
            out.extend_from_slice(&held);
        }
        for block in self.pending[..full].chunks_exact_mut(BLOCK) {
            decryptor.decrypt_block_mut(GenericArray::from_mut_slice(block));
        }
        let (released, last) = self.pending[..full].split_at(full - BLOCK);
        out.extend_from_slice(released);
        let mut held = [0u8; BLOCK];
        held.copy_from_slice(last);
        self.held = Some(held);
        self.pending.drain(..full);

        Bytes::from(out)
    }

    /// Validate and strip the padding of the final block.
    pub fn finish(self) -> Result<Bytes> {
        if !self.pending.is_empty() {
            return Err(Error::decryption(
                "ciphertext length is not a multiple of the block size",
            ));
        }
        let Some(last) = self.held else {
            return Err(Error::decryption("ciphertext is empty"));
        };
        let pad = last[BLOCK - 1] as usize;
        if pad == 0 || pad > BLOCK || last[BLOCK - pad..].iter().any(|&b| b as usize != pad) {
            return Err(Error::decryption("invalid padding"));
        }
        Ok(Bytes::copy_from_slice(&last[..BLOCK - pad]))
    }
}

impl std::fmt::Debug for SegmentDecryptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material.
        f.debug_struct("SegmentDecryptor")
            .field("pending", &self.pending.len())
            .field("held", &self.held.is_some())
            .finish_non_exhaustive()
    }
}

/// Decrypt a ciphertext stream. A decryption failure ends the stream with
/// an error after the plaintext released so far.
pub fn decrypt_stream<S>(
    ciphertext: S,
    mut decryptor: SegmentDecryptor,
) -> impl Stream<Item = Result<Bytes>> + Send
where
    S: Stream<Item = Result<Bytes>> + Send,
{
    async_stream::try_stream! {
        futures::pin_mut!(ciphertext);
        while let Some(chunk) = ciphertext.next().await {
            let plain = decryptor.update(&chunk?);
            if !plain.is_empty() {
                yield plain;
            }
        }
        let tail = decryptor.finish()?;
        if !tail.is_empty() {
            yield tail;
        }
    }
}
