//! Tokenizer vocabulary handling.
//!
//! `TokenizerInfo` encapsulates the vocabulary of an LLM tokenizer, providing:
//! - Decoded vocabulary (encoded token strings → the bytes they produce)
//! - Lexicographically sorted vocabulary for efficient prefix-based iteration
//! - Trie subtree ranges for batch prefix rejection during token mask generation
//! - Stop and special token classification

use std::hash::{Hash, Hasher};

use anyhow::anyhow;
use rustc_hash::FxHasher;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::{Setting, SERIALIZATION_VERSION};
use crate::grammar::serialize::{from_versioned_json, to_json};
use crate::Error;

/// Encoded token strings recognized as end-of-sequence markers when the stop
/// tokens are not given explicitly.
const STOP_TOKEN_STRINGS: &[&str] = &[
    "</s>",
    "<|end_of_text|>",
    "<|eot_id|>",
    "<|im_end|>",
    "<|endoftext|>",
    "<|end|>",
    "<eos>",
    "<end_of_turn>",
    "<|eom_id|>",
    "<｜end▁of▁sentence｜>",
];

/// The type of vocabulary encoding used by the tokenizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum VocabType {
    /// Tokens are used as-is, no decoding needed.
    #[default]
    Raw,
    /// Byte fallback encoding: `<0xAB>` → byte 0xAB, `▁` (U+2581) → space.
    /// Used by SentencePiece tokenizers (e.g., Llama).
    ByteFallback,
    /// Byte-level BPE: each byte is mapped to a unique Unicode character.
    /// Used by GPT-2/GPT-3 style tokenizers.
    ByteLevel,
}

impl From<VocabType> for u8 {
    fn from(value: VocabType) -> Self {
        match value {
            VocabType::Raw => 0,
            VocabType::ByteFallback => 1,
            VocabType::ByteLevel => 2,
        }
    }
}

impl TryFrom<u8> for VocabType {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(VocabType::Raw),
            1 => Ok(VocabType::ByteFallback),
            2 => Ok(VocabType::ByteLevel),
            other => Err(format!("unknown vocab_type {other}")),
        }
    }
}

/// Tokenizer metadata as exchanged in JSON form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Metadata {
    vocab_type: VocabType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    vocab_size: Option<usize>,
    #[serde(default)]
    add_prefix_space: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    stop_token_ids: Option<Vec<u32>>,
}

#[derive(Serialize, Deserialize)]
struct TokenizerRepr {
    version: String,
    encoded_vocab: Vec<String>,
    #[serde(flatten)]
    metadata: Metadata,
}

/// Tokenizer vocabulary information for grammar-guided generation. Immutable.
#[derive(Debug, Clone)]
pub struct TokenizerInfo {
    encoded_vocab: Vec<String>,
    /// `decoded_vocab[token_id]` = bytes the token produces.
    decoded_vocab: Vec<Vec<u8>>,
    /// Total vocabulary size; ids past `encoded_vocab.len()` are padding.
    vocab_size: usize,
    vocab_type: VocabType,
    add_prefix_space: bool,
    stop_token_ids: Vec<u32>,
    /// Tokens with no surface text, padding included.
    special_token_ids: Vec<u32>,
    /// Matchable token ids ordered by decoded bytes. Stop and special tokens
    /// are left out.
    sorted_ids: Vec<u32>,
    /// For `sorted_ids[i]`, the index of the first entry whose bytes do NOT
    /// start with the bytes of entry `i`. Used to skip whole subtrees.
    trie_subtree_end: Vec<u32>,
    fingerprint: u64,
}

impl TokenizerInfo {
    /// Create a new TokenizerInfo from an encoded vocabulary.
    ///
    /// - `encoded_vocab`: The raw token strings from the tokenizer.
    /// - `vocab_type`: How to decode token strings.
    /// - `vocab_size`: Total vocabulary size (if larger than encoded_vocab.len(), extra tokens are
    ///   treated as special).
    /// - `stop_token_ids`: `Unset` detects well-known end-of-sequence tokens.
    pub fn new(
        encoded_vocab: &[String],
        vocab_type: VocabType,
        vocab_size: Option<usize>,
        stop_token_ids: Setting<Vec<u32>>,
        add_prefix_space: bool,
    ) -> crate::Result<Self> {
        let vocab_size = vocab_size.unwrap_or(encoded_vocab.len());
        if vocab_size < encoded_vocab.len() {
            return Err(Error::InvalidTokenizer(format!(
                "vocab_size ({}) must be >= encoded_vocab.len() ({})",
                vocab_size,
                encoded_vocab.len()
            )));
        }

        let mut decoded_vocab: Vec<Vec<u8>> = encoded_vocab
            .iter()
            .map(|tok| decode_token(tok, vocab_type))
            .collect::<anyhow::Result<_>>()
            .map_err(|e| Error::InvalidTokenizer(format!("{e:#}")))?;

        let stop_token_ids = match stop_token_ids {
            Setting::Set(ids) => {
                if let Some(bad) = ids.iter().find(|&&id| id as usize >= vocab_size) {
                    return Err(Error::InvalidTokenizer(format!(
                        "stop token id {bad} is out of range for vocab_size {vocab_size}"
                    )));
                }
                ids
            }
            Setting::Unset => {
                let detected: Vec<u32> = encoded_vocab
                    .iter()
                    .enumerate()
                    .filter(|(_, tok)| STOP_TOKEN_STRINGS.contains(&tok.as_str()))
                    .map(|(id, _)| id as u32)
                    .collect();
                tracing::debug!(?detected, "detected stop tokens");
                detected
            }
        };

        let mut special_token_ids: Vec<u32> = decoded_vocab
            .iter()
            .enumerate()
            .filter(|(id, bytes)| bytes.is_empty() && !stop_token_ids.contains(&(*id as u32)))
            .map(|(id, _)| id as u32)
            .collect();
        special_token_ids.extend(encoded_vocab.len() as u32..vocab_size as u32);
        decoded_vocab.resize(vocab_size, Vec::new());

        let mut excluded = vec![false; decoded_vocab.len()];
        for &id in stop_token_ids.iter().chain(&special_token_ids) {
            if let Some(slot) = excluded.get_mut(id as usize) {
                *slot = true;
            }
        }
        let mut sorted_ids: Vec<u32> = (0..decoded_vocab.len() as u32)
            .filter(|&id| !excluded[id as usize])
            .collect();
        sorted_ids.sort_by(|&a, &b| decoded_vocab[a as usize].cmp(&decoded_vocab[b as usize]));
        let trie_subtree_end = build_trie_subtree_ranges(&sorted_ids, &decoded_vocab);

        let mut hasher = FxHasher::default();
        (vocab_type, vocab_size, add_prefix_space, &stop_token_ids, &decoded_vocab).hash(&mut hasher);

        Ok(Self {
            encoded_vocab: encoded_vocab.to_vec(),
            decoded_vocab,
            vocab_size,
            vocab_type,
            add_prefix_space,
            stop_token_ids,
            special_token_ids,
            sorted_ids,
            trie_subtree_end,
            fingerprint: hasher.finish(),
        })
    }

    /// Build from a vocabulary plus the metadata JSON produced by
    /// [`TokenizerInfo::dump_metadata`] or
    /// [`TokenizerInfo::detect_metadata_from_hf`].
    pub fn from_vocab_and_metadata(encoded_vocab: &[String], metadata: &str) -> crate::Result<Self> {
        let value: Value = serde_json::from_str(metadata).map_err(Error::json)?;
        let metadata: Metadata = serde_json::from_value(value)
            .map_err(|e| Error::InvalidTokenizer(format!("bad tokenizer metadata: {e}")))?;
        Self::from_metadata(encoded_vocab, metadata)
    }

    fn from_metadata(encoded_vocab: &[String], metadata: Metadata) -> crate::Result<Self> {
        Self::new(
            encoded_vocab,
            metadata.vocab_type,
            metadata.vocab_size,
            metadata.stop_token_ids.into(),
            metadata.add_prefix_space,
        )
    }

    fn metadata(&self) -> Metadata {
        Metadata {
            vocab_type: self.vocab_type,
            vocab_size: Some(self.vocab_size),
            add_prefix_space: self.add_prefix_space,
            stop_token_ids: Some(self.stop_token_ids.clone()),
        }
    }

    /// Metadata JSON: `vocab_type`, `vocab_size`, `add_prefix_space` and
    /// `stop_token_ids`.
    pub fn dump_metadata(&self) -> String {
        to_json(&self.metadata())
    }

    /// Derive metadata JSON from a HuggingFace `tokenizer.json` descriptor.
    pub fn detect_metadata_from_hf(backend_json: &str) -> crate::Result<String> {
        let value: Value = serde_json::from_str(backend_json).map_err(Error::json)?;
        let metadata = detect_hf_metadata(&value);
        tracing::debug!(?metadata.vocab_type, metadata.add_prefix_space, "detected tokenizer metadata");
        Ok(to_json(&metadata))
    }

    pub fn serialize_json(&self) -> String {
        to_json(&TokenizerRepr {
            version: SERIALIZATION_VERSION.to_string(),
            encoded_vocab: self.encoded_vocab.clone(),
            metadata: self.metadata(),
        })
    }

    pub fn deserialize_json(json: &str) -> crate::Result<Self> {
        let repr: TokenizerRepr = from_versioned_json(json)?;
        Self::from_metadata(&repr.encoded_vocab, repr.metadata).map_err(|e| match e {
            Error::InvalidTokenizer(msg) => Error::DeserializeFormat(msg),
            other => other,
        })
    }

    pub fn vocab_type(&self) -> VocabType {
        self.vocab_type
    }

    pub fn add_prefix_space(&self) -> bool {
        self.add_prefix_space
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    pub fn decoded_vocab(&self) -> &[Vec<u8>] {
        &self.decoded_vocab
    }

    pub fn stop_token_ids(&self) -> &[u32] {
        &self.stop_token_ids
    }

    pub fn special_token_ids(&self) -> &[u32] {
        &self.special_token_ids
    }

    /// Decoded bytes of a token; empty for special, padding and out-of-range ids.
    pub fn decoded_token_at(&self, token_id: u32) -> &[u8] {
        self.decoded_vocab
            .get(token_id as usize)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// The `index`-th stop token id, or 0 out of range.
    pub fn stop_token_id_at(&self, index: usize) -> u32 {
        self.stop_token_ids.get(index).copied().unwrap_or(0)
    }

    /// The `index`-th special token id, or 0 out of range.
    pub fn special_token_id_at(&self, index: usize) -> u32 {
        self.special_token_ids.get(index).copied().unwrap_or(0)
    }

    pub(crate) fn sorted_ids(&self) -> &[u32] {
        &self.sorted_ids
    }

    pub(crate) fn trie_subtree_end(&self) -> &[u32] {
        &self.trie_subtree_end
    }

    /// Hash of everything that influences token masks.
    pub(crate) fn fingerprint(&self) -> u64 {
        self.fingerprint
    }

    pub(crate) fn is_special(&self, token_id: u32) -> bool {
        token_id as usize >= self.vocab_size
            || self.special_token_ids.binary_search(&token_id).is_ok()
    }

}

/// Decode a single token according to the vocabulary type.
fn decode_token(encoded: &str, vocab_type: VocabType) -> anyhow::Result<Vec<u8>> {
    match vocab_type {
        VocabType::Raw => Ok(encoded.as_bytes().to_vec()),
        VocabType::ByteFallback => decode_byte_fallback(encoded),
        VocabType::ByteLevel => Ok(decode_byte_level(encoded)),
    }
}

/// SentencePiece style: `<0xAB>` → byte 0xAB, `▁` (U+2581) → space.
fn decode_byte_fallback(encoded: &str) -> anyhow::Result<Vec<u8>> {
    if let Some(hex) = encoded.strip_prefix("<0x").and_then(|s| s.strip_suffix('>')) {
        if hex.len() == 2 {
            let byte = u8::from_str_radix(hex, 16)
                .map_err(|_| anyhow!("invalid byte fallback token: {}", encoded))?;
            return Ok(vec![byte]);
        }
    }
    Ok(encoded.replace('\u{2581}', " ").into_bytes())
}

/// GPT-2 style: every char maps back to one byte through the inverse of
/// `bytes_to_unicode()`. Chars outside the table keep their UTF-8 bytes.
fn decode_byte_level(encoded: &str) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(encoded.len());
    for c in encoded.chars() {
        match byte_level_char_to_byte(c as u32) {
            Some(b) => bytes.push(b),
            None => {
                let mut buf = [0u8; 4];
                bytes.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            }
        }
    }
    bytes
}

/// Printable bytes map to themselves; the 68 others were shifted to
/// `256..=323` in ascending byte order.
fn byte_level_char_to_byte(cp: u32) -> Option<u8> {
    match cp {
        0x21..=0x7E | 0xA1..=0xAC | 0xAE..=0xFF => Some(cp as u8),
        256..=288 => Some((cp - 256) as u8),
        289..=322 => Some((cp - 289 + 0x7F) as u8),
        323 => Some(0xAD),
        _ => None,
    }
}

fn detect_hf_metadata(tokenizer: &Value) -> Metadata {
    let decoder = &tokenizer["decoder"];
    let vocab_type = if component_has_type(decoder, "ByteLevel") {
        VocabType::ByteLevel
    } else if component_has_type(decoder, "ByteFallback") {
        VocabType::ByteFallback
    } else {
        VocabType::Raw
    };

    let add_prefix_space = [&tokenizer["normalizer"], &tokenizer["pre_tokenizer"]]
        .into_iter()
        .any(adds_prefix_space);

    Metadata {
        vocab_type,
        vocab_size: None,
        add_prefix_space,
        stop_token_ids: None,
    }
}

/// Components are either a single `{"type": ...}` object or a `Sequence`
/// holding a list of them.
fn components(value: &Value) -> Vec<&Value> {
    let nested = ["decoders", "normalizers", "pretokenizers"]
        .iter()
        .filter_map(|key| value.get(key).and_then(Value::as_array))
        .flatten();
    std::iter::once(value).chain(nested).collect()
}

fn component_has_type(value: &Value, ty: &str) -> bool {
    components(value)
        .into_iter()
        .any(|c| c.get("type").and_then(Value::as_str) == Some(ty))
}

fn adds_prefix_space(value: &Value) -> bool {
    components(value).into_iter().any(|c| {
        match c.get("type").and_then(Value::as_str) {
            Some("Prepend") => c.get("prepend").and_then(Value::as_str) == Some("\u{2581}"),
            Some("Metaspace") => {
                c.get("add_prefix_space").and_then(Value::as_bool) == Some(true)
                    || matches!(
                        c.get("prepend_scheme").and_then(Value::as_str),
                        Some("always" | "first")
                    )
            }
            _ => false,
        }
    })
}

fn build_trie_subtree_ranges(sorted_ids: &[u32], decoded: &[Vec<u8>]) -> Vec<u32> {
    let n = sorted_ids.len();
    let mut ranges = vec![n as u32; n];
    let mut stack: Vec<usize> = Vec::new();

    for (i, &id) in sorted_ids.iter().enumerate() {
        let bytes = &decoded[id as usize];
        while let Some(&top) = stack.last() {
            if bytes.starts_with(&decoded[sorted_ids[top] as usize]) {
                break;
            }
            ranges[top] = i as u32;
            stack.pop();
        }
        stack.push(i);
    }
    ranges
}
