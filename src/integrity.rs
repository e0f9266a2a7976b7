//! IntegrityChecker — one pass over every shard between manifest parse
//! and first materialization (spec §4.3).

use crate::manifest::Manifest;
use crate::shard_source::ShardSource;

/// `{valid, missing, corrupt}` — missing/corrupt shards are reported by
/// index so the caller (`Loader::load`) can build the fatal error.
#[derive(Debug, Default)]
pub struct IntegrityReport {
    pub missing: Vec<usize>,
    pub corrupt: Vec<usize>,
}

impl IntegrityReport {
    pub fn is_valid(&self) -> bool {
        self.missing.is_empty() && self.corrupt.is_empty()
    }
}

/// Fetch every shard, compare length and hash against the manifest.
/// Verification is optional (callers that pass `verify_hashes=false`
/// skip this entirely) but enabled by default.
pub async fn check(manifest: &Manifest, source: &dyn ShardSource) -> IntegrityReport {
    let mut report = IntegrityReport::default();

    for shard in &manifest.shards {
        let bytes = match source.fetch(shard.index).await {
            Ok(b) => b,
            Err(_) => {
                report.missing.push(shard.index);
                continue;
            }
        };

        if bytes.len() != shard.size {
            tracing::warn!(
                shard = shard.index,
                expected = shard.size,
                actual = bytes.len(),
                "shard size mismatch"
            );
            report.corrupt.push(shard.index);
            continue;
        }

        let digest = manifest.hash_algorithm.hex_digest(bytes.as_slice());
        if !digest.eq_ignore_ascii_case(&shard.hash) {
            tracing::warn!(shard = shard.index, "shard hash mismatch");
            report.corrupt.push(shard.index);
        }
    }

    report
}
