//! NameResolver — prefix-probing × pattern-rewrite cross product for
//! locating a logical tensor under whatever naming convention a given
//! manifest happens to use (spec §4.7).
//!
//! Grounded on the alias-table approach in
//! `other_examples/.../production_loader.rs` (a fixed list of known
//! checkpoint prefixes tried in order against a canonical parameter
//! name) but kept pure/memoizable: this module only builds candidate
//! strings, `materializer.rs` does the actual lookup.

use std::collections::HashMap;

use parking_lot::Mutex;

/// Known top-level prefixes a checkpoint might nest its tensors under,
/// tried widest-to-narrowest.
const KNOWN_PREFIXES: &[&str] = &["", "model.", "transformer.", "language_model.", "module."];

/// A logical tensor name, independent of checkpoint convention (spec
/// §4.7: "embeddings", "layer.{i}.attn.q_proj", etc).
#[derive(Debug, Clone)]
pub enum LogicalName {
    Embeddings,
    FinalNorm,
    LmHead,
    Layer { index: usize, suffix: &'static str },
    Expert { layer: usize, expert: usize, suffix: &'static str },
}

impl LogicalName {
    /// The canonical (un-prefixed) dotted path, in the convention the
    /// original checkpoint format itself uses most commonly.
    fn canonical_suffix(&self) -> String {
        match self {
            LogicalName::Embeddings => "embed_tokens.weight".to_string(),
            LogicalName::FinalNorm => "norm.weight".to_string(),
            LogicalName::LmHead => "lm_head.weight".to_string(),
            LogicalName::Layer { index, suffix } => format!("layers.{index}.{suffix}"),
            LogicalName::Expert { layer, expert, suffix } => {
                format!("layers.{layer}.block_sparse_moe.experts.{expert}.{suffix}")
            }
        }
    }

    /// Alternate checkpoint-convention rewrites of the same logical
    /// tensor, tried after the canonical suffix (e.g. GGUF-style
    /// flattened names that some quantized exports use).
    fn pattern_rewrites(&self) -> Vec<String> {
        match self {
            LogicalName::Layer { index, suffix } => {
                vec![format!("blk.{index}.{}", gguf_suffix(suffix))]
            }
            LogicalName::LmHead => vec!["output.weight".to_string()],
            LogicalName::FinalNorm => vec!["output_norm.weight".to_string()],
            _ => Vec::new(),
        }
    }
}

fn gguf_suffix(suffix: &str) -> &'static str {
    match suffix {
        "self_attn.q_proj.weight" => "attn_q.weight",
        "self_attn.k_proj.weight" => "attn_k.weight",
        "self_attn.v_proj.weight" => "attn_v.weight",
        "self_attn.o_proj.weight" => "attn_output.weight",
        "mlp.gate_proj.weight" => "ffn_gate.weight",
        "mlp.up_proj.weight" => "ffn_up.weight",
        "mlp.down_proj.weight" => "ffn_down.weight",
        "input_layernorm.weight" => "attn_norm.weight",
        "post_attention_layernorm.weight" => "ffn_norm.weight",
        other => other,
    }
}

/// Builds and caches the candidate-alias list for each logical name
/// (spec §4.7: "resolution is pure and memoizable per manifest"). One
/// resolver is owned per `Loader`/manifest pair.
pub struct NameResolver {
    cache: Mutex<HashMap<String, Vec<String>>>,
}

impl NameResolver {
    pub fn new() -> Self {
        Self { cache: Mutex::new(HashMap::new()) }
    }

    /// All candidate aliases for `name`, in the order they should be
    /// tried: each known prefix crossed with the canonical suffix, then
    /// each known prefix crossed with every pattern rewrite.
    pub fn candidates(&self, name: &LogicalName) -> Vec<String> {
        let key = format!("{:?}", name);
        if let Some(hit) = self.cache.lock().get(&key).cloned() {
            return hit;
        }

        let mut out = Vec::new();
        let canonical = name.canonical_suffix();
        for prefix in KNOWN_PREFIXES {
            out.push(format!("{prefix}{canonical}"));
        }
        for rewrite in name.pattern_rewrites() {
            for prefix in KNOWN_PREFIXES {
                out.push(format!("{prefix}{rewrite}"));
            }
        }

        self.cache.lock().insert(key, out.clone());
        out
    }
}

impl Default for NameResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embeddings_tries_every_known_prefix_first() {
        let resolver = NameResolver::new();
        let candidates = resolver.candidates(&LogicalName::Embeddings);
        assert_eq!(candidates[0], "embed_tokens.weight");
        assert!(candidates.contains(&"model.embed_tokens.weight".to_string()));
    }

    #[test]
    fn layer_tensor_falls_back_to_gguf_style_name() {
        let resolver = NameResolver::new();
        let name = LogicalName::Layer { index: 3, suffix: "self_attn.q_proj.weight" };
        let candidates = resolver.candidates(&name);
        assert!(candidates.contains(&"layers.3.self_attn.q_proj.weight".to_string()));
        assert!(candidates.contains(&"blk.3.attn_q.weight".to_string()));
    }

    #[test]
    fn repeated_lookup_is_cached_and_stable() {
        let resolver = NameResolver::new();
        let name = LogicalName::LmHead;
        let first = resolver.candidates(&name);
        let second = resolver.candidates(&name);
        assert_eq!(first, second);
    }

    #[test]
    fn expert_tensor_builds_moe_path() {
        let resolver = NameResolver::new();
        let name = LogicalName::Expert { layer: 1, expert: 2, suffix: "w1.weight" };
        let candidates = resolver.candidates(&name);
        assert!(candidates[0].ends_with("layers.1.block_sparse_moe.experts.2.w1.weight"));
    }
}
