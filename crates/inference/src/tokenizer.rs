//! Tokenizer loading.
//!
//! Prefers a serialized `tokenizer.json`. MOSS checkpoints ship the GPT-2
//! style files instead (`vocab.json`, `merges.txt`, `added_tokens.json`,
//! `special_tokens_map.json`); from those a byte-level BPE tokenizer is
//! assembled in the `tokenizers` JSON format and deserialized.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use serde_json::{json, Value};
use tokenizers::Tokenizer;

/// Load the tokenizer of a model directory.
pub fn load_tokenizer(dir: &Path) -> Result<Tokenizer> {
    let tokenizer_path = dir.join("tokenizer.json");
    if tokenizer_path.exists() {
        return Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| anyhow!("load tokenizer {}: {e}", tokenizer_path.display()));
    }
    let description = byte_level_bpe_json(dir)?;
    Tokenizer::from_bytes(serde_json::to_vec(&description)?)
        .map_err(|e| anyhow!("assemble tokenizer from {}: {e}", dir.display()))
}

fn read_json(path: &Path) -> Result<Value> {
    let text =
        std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parse {}", path.display()))
}

/// Token strings named by `special_tokens_map.json`. Entries are either plain
/// strings or `{"content": ...}` objects; `additional_special_tokens` is a list.
fn special_token_contents(map: &Value) -> HashSet<String> {
    fn content(v: &Value) -> Option<String> {
        match v {
            Value::String(s) => Some(s.clone()),
            Value::Object(o) => o.get("content").and_then(Value::as_str).map(str::to_string),
            _ => None,
        }
    }
    let mut out = HashSet::new();
    if let Value::Object(entries) = map {
        for value in entries.values() {
            match value {
                Value::Array(items) => out.extend(items.iter().filter_map(content)),
                other => out.extend(content(other)),
            }
        }
    }
    out
}

/// Build the `tokenizers` JSON description of a GPT-2 style tokenizer.
fn byte_level_bpe_json(dir: &Path) -> Result<Value> {
    let vocab = read_json(&dir.join("vocab.json"))?;
    let vocab_map = vocab
        .as_object()
        .ok_or_else(|| anyhow!("vocab.json is not an object"))?;

    let merges_path = dir.join("merges.txt");
    let merges_text = std::fs::read_to_string(&merges_path)
        .with_context(|| format!("read {}", merges_path.display()))?;
    let merges: Vec<&str> = merges_text
        .lines()
        .filter(|l| !l.is_empty() && !l.starts_with("#version"))
        .collect();

    let added_path = dir.join("added_tokens.json");
    let added: BTreeMap<String, u64> = if added_path.exists() {
        serde_json::from_value(read_json(&added_path)?)
            .with_context(|| format!("parse {}", added_path.display()))?
    } else {
        BTreeMap::new()
    };
    let special_path = dir.join("special_tokens_map.json");
    let special = if special_path.exists() {
        special_token_contents(&read_json(&special_path)?)
    } else {
        HashSet::new()
    };

    // Added tokens plus special tokens that already live in the base vocab.
    let mut registered: BTreeMap<u64, (String, bool)> = added
        .iter()
        .map(|(content, id)| (*id, (content.clone(), special.contains(content))))
        .collect();
    for content in &special {
        if let Some(id) = vocab_map.get(content).and_then(Value::as_u64) {
            registered.entry(id).or_insert_with(|| (content.clone(), true));
        }
    }
    let added_tokens: Vec<Value> = registered
        .into_iter()
        .map(|(id, (content, special))| {
            json!({
                "id": id,
                "content": content,
                "single_word": false,
                "lstrip": false,
                "rstrip": false,
                "normalized": false,
                "special": special,
            })
        })
        .collect();

    Ok(json!({
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": added_tokens,
        "normalizer": null,
        "pre_tokenizer": {
            "type": "ByteLevel",
            "add_prefix_space": false,
            "trim_offsets": true,
            "use_regex": true
        },
        "post_processor": null,
        "decoder": {
            "type": "ByteLevel",
            "add_prefix_space": true,
            "trim_offsets": true,
            "use_regex": true
        },
        "model": {
            "type": "BPE",
            "dropout": null,
            "unk_token": null,
            "continuing_subword_prefix": null,
            "end_of_word_suffix": null,
            "fuse_unk": false,
            "byte_fallback": false,
            "vocab": vocab,
            "merges": merges
        }
    }))
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn gpt2_style_dir() -> TempDir {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path();
        std::fs::write(
            dir.join("vocab.json"),
            r#"{"h": 0, "i": 1, "hi": 2, "Ġ": 3, "Ġhi": 4, "<|endoftext|>": 5}"#,
        )
        .unwrap();
        std::fs::write(dir.join("merges.txt"), "#version: 0.2\nh i\nĠ hi\n").unwrap();
        std::fs::write(
            dir.join("added_tokens.json"),
            r#"{"<eoh>": 6, "<eom>": 7}"#,
        )
        .unwrap();
        std::fs::write(
            dir.join("special_tokens_map.json"),
            r#"{"bos_token": "<|endoftext|>",
                "eos_token": {"content": "<|endoftext|>", "lstrip": false},
                "unk_token": "<|endoftext|>"}"#,
        )
        .unwrap();
        tmp
    }

    #[test]
    fn assembles_byte_level_bpe_with_added_tokens() {
        let dir = gpt2_style_dir();
        let tokenizer = load_tokenizer(dir.path()).unwrap();
        let enc = tokenizer.encode("hi hi<eoh>", false).unwrap();
        assert_eq!(enc.get_ids(), &[2, 4, 6]);
        assert_eq!(tokenizer.token_to_id("<eom>"), Some(7));
    }

    #[test]
    fn decode_skips_only_special_tokens() {
        let dir = gpt2_style_dir();
        let tokenizer = load_tokenizer(dir.path()).unwrap();
        let text = tokenizer.decode(&[2, 4, 7, 5], true).unwrap();
        assert_eq!(text, "hi hi<eom>");
    }

    #[test]
    fn special_map_accepts_strings_objects_and_lists() {
        let map = json!({
            "eos_token": "<a>",
            "pad_token": {"content": "<b>"},
            "additional_special_tokens": ["<c>", {"content": "<d>"}]
        });
        let got = special_token_contents(&map);
        for t in ["<a>", "<b>", "<c>", "<d>"] {
            assert!(got.contains(t), "{t}");
        }
    }

    #[test]
    fn missing_files_are_reported() {
        let dir = TempDir::new().unwrap();
        let err = load_tokenizer(dir.path()).unwrap_err();
        assert!(format!("{err:#}").contains("vocab.json"));
    }
}
