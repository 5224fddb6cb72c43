//! Allow-mask mini-language.
//!
//! An allow spec is a comma-separated list of `+`/`-` (allow/deny) tokens,
//! each followed by one of:
//!
//! - a class index: `+42`
//! - a half-open index range: `-1103:1589`
//! - a name resolved through the session's [`ClassRegistry`]: `+insects`
//!
//! If the op list is empty or its first entry denies, the mask starts as
//! allow-all; otherwise it starts as deny-all. Ops are then applied in
//! order. Malformed tokens and unknown names are configuration errors at
//! construction time; nothing is validated lazily.

use anyhow::{anyhow, Result};

use super::registry::ClassRegistry;

/// A single mask operation target.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MaskOp {
    Index(usize),
    /// Half-open range `lo..hi`.
    Slice(usize, usize),
    Name(String),
}

/// One parsed token: allow/deny valence plus its target.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MaskToken {
    pub allow: bool,
    pub op: MaskOp,
}

/// Parse an allow spec into tokens. An empty spec parses to no tokens.
pub fn parse_allow_spec(spec: &str) -> Result<Vec<MaskToken>> {
    let spec = spec.trim();
    if spec.is_empty() {
        return Ok(Vec::new());
    }

    let mut tokens = Vec::new();
    for raw in spec.split(',') {
        let raw = raw.trim();
        let Some(valence) = raw.chars().next() else {
            return Err(anyhow!("empty allow token in spec '{}'", spec));
        };
        if valence != '+' && valence != '-' {
            return Err(anyhow!(
                "allow token '{}' missing leading + or -",
                raw
            ));
        }
        let allow = valence == '+';
        let operation = &raw[1..];
        if operation.is_empty() {
            return Err(anyhow!("allow token '{}' has no operand", raw));
        }

        let op = if let Some((lo, hi)) = operation.split_once(':') {
            if hi.contains(':') {
                return Err(anyhow!("allow token '{}' has more than one ':'", raw));
            }
            let lo: usize = lo
                .parse()
                .map_err(|_| anyhow!("allow token '{}' range bound is not a number", raw))?;
            let hi: usize = hi
                .parse()
                .map_err(|_| anyhow!("allow token '{}' range bound is not a number", raw))?;
            MaskOp::Slice(lo, hi)
        } else if operation.chars().all(|c| c.is_ascii_digit()) {
            MaskOp::Index(
                operation
                    .parse()
                    .map_err(|_| anyhow!("allow token '{}' index is not a number", raw))?,
            )
        } else {
            MaskOp::Name(operation.to_string())
        };

        tokens.push(MaskToken { allow, op });
    }
    Ok(tokens)
}

/// Build a per-class allow mask from parsed tokens.
pub fn build_allow_mask(
    n_classes: usize,
    tokens: &[MaskToken],
    registry: &ClassRegistry,
) -> Result<Vec<bool>> {
    // First-op valence picks the starting mask: a leading deny (or no ops)
    // implies everything else is allowed, a leading allow implies everything
    // else is denied.
    let default_allow = tokens.first().map(|token| !token.allow).unwrap_or(true);
    let mut mask = vec![default_allow; n_classes];

    for token in tokens {
        match &token.op {
            MaskOp::Index(index) => {
                if *index >= n_classes {
                    return Err(anyhow!(
                        "allow mask index {} out of range for {} classes",
                        index,
                        n_classes
                    ));
                }
                mask[*index] = token.allow;
            }
            MaskOp::Slice(lo, hi) => {
                let hi = (*hi).min(n_classes);
                for slot in mask.iter_mut().take(hi).skip(*lo) {
                    *slot = token.allow;
                }
            }
            MaskOp::Name(name) => {
                let indices = registry
                    .resolve(name)
                    .ok_or_else(|| anyhow!("unknown class or group '{}' in allow mask", name))?;
                for index in indices {
                    if index >= n_classes {
                        return Err(anyhow!(
                            "allow mask name '{}' resolves to index {} out of range",
                            name,
                            index
                        ));
                    }
                    mask[index] = token.allow;
                }
            }
        }
    }

    log::debug!("built allow mask over {} classes: {:?}", n_classes, mask);
    Ok(mask)
}
