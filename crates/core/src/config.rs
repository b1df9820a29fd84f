//! Allocator configuration string grammar: `type[:k=v[,k=v]*]`.
//!
//! Grounded directly in the size-suffix parser and depth-aware bracket
//! tokenizer this grammar is distilled from: `strtoull`-style leading
//! digits plus an optional K/M/G/T multiplier and an optional trailing `B`
//! or `i`; `[...]` nesting tracked by bracket depth, never split on a
//! delimiter inside a bracketed value.

use std::sync::Arc;

use crate::allocator::{
    ArenaType, AutoAllocator, BumpArena, DedupConfig, DedupStore, GrowableArena, GrowableConfig, MallocWrapper,
    ScenarioType,
};
use crate::error::{CoreError, CoreResult};
use crate::Allocator;

/// A fully parsed allocator configuration, ready to hand to the builder.
#[derive(Debug, Clone)]
pub enum AllocatorConfig {
    Default,
    Malloc,
    Linear { size: Option<usize> },
    Mremap(GrowableConfig),
    Dedup { parent: Box<AllocatorConfig>, dedup: DedupConfig },
    Auto { scenario: ScenarioType, estimated_max_size: usize },
}

/// Parse bytes with an optional K/M/G/T suffix (binary, 1024-based) and an
/// optional trailing `B`/`i` into a byte count.
pub fn parse_size_suffix(s: &str) -> Result<usize, CoreError> {
    let s = s.trim();
    let bytes = s.as_bytes();
    let mut end = 0;
    while end < bytes.len() && bytes[end].is_ascii_digit() {
        end += 1;
    }
    if end == 0 {
        return Err(CoreError::ConfigParse(format!("invalid size value: '{s}'")));
    }
    let val: u128 = s[..end]
        .parse()
        .map_err(|_| CoreError::ConfigParse(format!("invalid size value: '{s}'")))?;

    let rest = s[end..].trim_start();
    let (multiplier, after): (u128, &str) = if rest.is_empty() {
        (1, rest)
    } else {
        let suffix = rest.chars().next().unwrap();
        let multiplier = match suffix.to_ascii_uppercase() {
            'K' => 1024u128,
            'M' => 1024u128 * 1024,
            'G' => 1024u128 * 1024 * 1024,
            'T' => 1024u128 * 1024 * 1024 * 1024,
            _ => return Err(CoreError::ConfigParse(format!("invalid size suffix in '{s}'"))),
        };
        let mut rest = &rest[suffix.len_utf8()..];
        if let Some(stripped) = rest.strip_prefix('B').or_else(|| rest.strip_prefix('b')) {
            rest = stripped;
        } else if let Some(stripped) = rest.strip_prefix('i') {
            rest = stripped;
        }
        (multiplier, rest.trim_start())
    };
    if !after.is_empty() {
        return Err(CoreError::ConfigParse(format!("trailing characters in size value: '{s}'")));
    }
    let total = val
        .checked_mul(multiplier)
        .ok_or_else(|| CoreError::ConfigParse(format!("size value overflow: '{s}'")))?;
    usize::try_from(total).map_err(|_| CoreError::ConfigParse(format!("size value overflow: '{s}'")))
}

pub fn parse_float_value(s: &str) -> Result<f32, CoreError> {
    let t = s.trim();
    if t.is_empty() {
        return Err(CoreError::ConfigParse("empty float value".to_string()));
    }
    t.parse::<f64>()
        .map(|v| v as f32)
        .map_err(|_| CoreError::ConfigParse(format!("invalid float value: '{s}'")))
}

pub fn parse_unsigned_value(s: &str) -> Result<u32, CoreError> {
    let t = s.trim();
    if t.is_empty() {
        return Err(CoreError::ConfigParse("empty unsigned value".to_string()));
    }
    t.parse::<u32>()
        .map_err(|_| CoreError::ConfigParse(format!("invalid unsigned value: '{s}'")))
}

/// Extract the content of a matched `[...]` pair. The value must start at
/// `[`, the matching `]` must be the value's last character, and bracket
/// depth must return to zero exactly there.
pub fn extract_bracketed_value(value: &str) -> Result<String, CoreError> {
    if !value.starts_with('[') {
        return Err(CoreError::ConfigParse(format!("unmatched brackets in config: '{value}'")));
    }
    let mut depth = 0i32;
    let mut end = None;
    for (i, c) in value.char_indices() {
        match c {
            '[' => depth += 1,
            ']' => {
                depth -= 1;
                if depth == 0 {
                    end = Some(i);
                    break;
                }
            }
            _ => {}
        }
    }
    let Some(end) = end else {
        return Err(CoreError::ConfigParse(format!("unmatched brackets in config: '{value}'")));
    };
    if end != value.len() - 1 {
        return Err(CoreError::ConfigParse(format!("unmatched brackets in config: '{value}'")));
    }
    if end <= 1 {
        return Ok(String::new());
    }
    Ok(value[1..end].to_string())
}

/// Split `s` on `delim` without splitting inside a bracketed span; bracket
/// depth must return to zero by the end of the string.
fn split_top_level(s: &str, delim: char) -> Result<Vec<&str>, CoreError> {
    let mut out = Vec::new();
    let mut depth = 0i32;
    let mut start = 0usize;
    for (i, c) in s.char_indices() {
        match c {
            '[' => depth += 1,
            ']' => {
                depth -= 1;
                if depth < 0 {
                    return Err(CoreError::ConfigParse("unmatched closing bracket in config".to_string()));
                }
            }
            c if c == delim && depth == 0 => {
                out.push(&s[start..i]);
                start = i + delim.len_utf8();
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(CoreError::ConfigParse("unmatched opening bracket in config".to_string()));
    }
    out.push(&s[start..]);
    Ok(out)
}

/// Find the first top-level occurrence of `delim`, ignoring any inside a
/// bracketed span.
fn find_top_level(s: &str, delim: char) -> Option<usize> {
    let mut depth = 0i32;
    for (i, c) in s.char_indices() {
        match c {
            '[' => depth += 1,
            ']' => depth -= 1,
            c if c == delim && depth == 0 => return Some(i),
            _ => {}
        }
    }
    None
}

fn split_kv(pair: &str) -> Result<(&str, &str), CoreError> {
    match find_top_level(pair, '=') {
        Some(i) => Ok((&pair[..i], &pair[i + 1..])),
        None => Err(CoreError::ConfigParse(format!("expected key=value in '{pair}'"))),
    }
}

fn parse_arena_type(s: &str) -> Result<ArenaType, CoreError> {
    match s {
        "default" => Ok(ArenaType::Default),
        "malloc" => Ok(ArenaType::Malloc),
        "mmap" => Ok(ArenaType::Mmap),
        other => Err(CoreError::ConfigParse(format!("unknown arena_type '{other}'"))),
    }
}

fn parse_scenario(s: &str) -> Result<ScenarioType, CoreError> {
    match s {
        "per_tag_free" => Ok(ScenarioType::PerTagFree),
        "per_tag_free_dedup" => Ok(ScenarioType::PerTagFreeDedup),
        "per_obj_free" => Ok(ScenarioType::PerObjFree),
        "per_obj_free_dedup" => Ok(ScenarioType::PerObjFreeDedup),
        "single_linear" => Ok(ScenarioType::SingleLinear),
        "single_linear_dedup" => Ok(ScenarioType::SingleLinearDedup),
        other => Err(CoreError::ConfigParse(format!("unknown scenario '{other}'"))),
    }
}

/// Parse a `type[:k=v[,k=v]*]` allocator configuration string.
pub fn parse_allocator_config(input: &str) -> Result<AllocatorConfig, CoreError> {
    let (kind, rest) = match find_top_level(input, ':') {
        Some(i) => (&input[..i], Some(&input[i + 1..])),
        None => (input, None),
    };
    let pairs: Vec<(&str, &str)> = match rest {
        Some(rest) if !rest.is_empty() => {
            split_top_level(rest, ',')?.into_iter().map(split_kv).collect::<Result<_, _>>()?
        }
        _ => Vec::new(),
    };

    match kind {
        "default" => Ok(AllocatorConfig::Default),
        "malloc" => Ok(AllocatorConfig::Malloc),
        "linear" => {
            let mut size = None;
            for (k, v) in pairs {
                match k {
                    "size" => size = Some(parse_size_suffix(v)?),
                    other => return Err(CoreError::ConfigParse(format!("unknown linear key '{other}'"))),
                }
            }
            Ok(AllocatorConfig::Linear { size })
        }
        "mremap" => {
            let mut cfg = GrowableConfig::default();
            for (k, v) in pairs {
                match k {
                    "big_alloc_threshold" => cfg.big_alloc_threshold = parse_size_suffix(v)?,
                    "empty_threshold" => cfg.empty_threshold = parse_float_value(v)?,
                    "minimum_arena_size" => cfg.minimum_arena_size = parse_size_suffix(v)?,
                    "grow_ratio" => cfg.grow_ratio = parse_float_value(v)?,
                    "balloon_ratio" => cfg.balloon_ratio = parse_float_value(v)?,
                    "arena_type" => cfg.arena_type = parse_arena_type(v)?,
                    other => return Err(CoreError::ConfigParse(format!("unknown mremap key '{other}'"))),
                }
            }
            Ok(AllocatorConfig::Mremap(cfg))
        }
        "dedup" => {
            let mut dedup = DedupConfig::default();
            let mut parent = Box::new(AllocatorConfig::Mremap(GrowableConfig::default()));
            for (k, v) in pairs {
                match k {
                    "parent" => {
                        let inner = if let Some(stripped) = v.strip_prefix('[') {
                            let _ = stripped;
                            extract_bracketed_value(v)?
                        } else {
                            v.to_string()
                        };
                        parent = Box::new(parse_allocator_config(&inner)?);
                    }
                    "bloom_filter_bits" => dedup.bloom_filter_bits = parse_unsigned_value(v)?,
                    "bucket_count_bits" => dedup.bucket_count_bits = parse_unsigned_value(v)?,
                    "dedup_threshold" => dedup.dedup_threshold = parse_size_suffix(v)?,
                    "chain_length_grow_trigger" => {
                        dedup.chain_length_grow_trigger = parse_unsigned_value(v)? as usize
                    }
                    "estimated_content_size" => dedup.estimated_content_size = parse_size_suffix(v)?,
                    "minimum_bucket_occupancy" => {
                        dedup.minimum_bucket_occupancy = parse_unsigned_value(v)? as usize
                    }
                    other => return Err(CoreError::ConfigParse(format!("unknown dedup key '{other}'"))),
                }
            }
            Ok(AllocatorConfig::Dedup { parent, dedup })
        }
        "auto" => {
            let mut scenario = ScenarioType::PerTagFree;
            let mut estimated_max_size = 0usize;
            for (k, v) in pairs {
                match k {
                    "scenario" => scenario = parse_scenario(v)?,
                    "estimated_max_size" => estimated_max_size = parse_size_suffix(v)?,
                    other => return Err(CoreError::ConfigParse(format!("unknown auto key '{other}'"))),
                }
            }
            Ok(AllocatorConfig::Auto { scenario, estimated_max_size })
        }
        other => Err(CoreError::ConfigParse(format!("unknown allocator type '{other}'"))),
    }
}

const DEFAULT_LINEAR_SIZE: usize = 4096;

/// Instantiate a live allocator from a parsed configuration. The `dedup`
/// variant's `parent` is restricted to `{malloc, linear, mremap}` per
/// §6.2's key table — `auto` and `dedup` are not valid dedup parents.
pub fn instantiate(cfg: &AllocatorConfig) -> CoreResult<Arc<dyn Allocator>> {
    Ok(match cfg {
        AllocatorConfig::Default => Arc::new(GrowableArena::new(GrowableConfig::default())),
        AllocatorConfig::Malloc => Arc::new(MallocWrapper::new()),
        AllocatorConfig::Linear { size } => Arc::new(BumpArena::with_capacity(size.unwrap_or(DEFAULT_LINEAR_SIZE))),
        AllocatorConfig::Mremap(growable) => Arc::new(GrowableArena::new(*growable)),
        AllocatorConfig::Dedup { parent, dedup } => match parent.as_ref() {
            AllocatorConfig::Malloc => Arc::new(DedupStore::new(MallocWrapper::new(), *dedup)),
            AllocatorConfig::Linear { size } => {
                Arc::new(DedupStore::new(BumpArena::with_capacity(size.unwrap_or(DEFAULT_LINEAR_SIZE)), *dedup))
            }
            AllocatorConfig::Mremap(growable) => Arc::new(DedupStore::new(GrowableArena::new(*growable), *dedup)),
            other => {
                return Err(CoreError::ConfigParse(format!(
                    "dedup parent must be one of malloc/linear/mremap, got {other:?}"
                )))
            }
        },
        AllocatorConfig::Auto { scenario, estimated_max_size } => {
            Arc::new(AutoAllocator::new(*scenario, *estimated_max_size))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_suffixes() {
        assert_eq!(parse_size_suffix("4096").unwrap(), 4096);
        assert_eq!(parse_size_suffix("4K").unwrap(), 4096);
        assert_eq!(parse_size_suffix("4KB").unwrap(), 4096);
        assert_eq!(parse_size_suffix("4Ki").unwrap(), 4096);
        assert_eq!(parse_size_suffix("1M").unwrap(), 1024 * 1024);
        assert_eq!(parse_size_suffix("1G").unwrap(), 1024 * 1024 * 1024);
    }

    #[test]
    fn size_suffix_rejects_garbage() {
        assert!(parse_size_suffix("abc").is_err());
        assert!(parse_size_suffix("4Q").is_err());
        assert!(parse_size_suffix("4K trailing").is_err());
    }

    #[test]
    fn bracket_extraction() {
        assert_eq!(extract_bracketed_value("[abc]").unwrap(), "abc");
        assert_eq!(extract_bracketed_value("[]").unwrap(), "");
        assert_eq!(extract_bracketed_value("[a[b]c]").unwrap(), "a[b]c");
        assert!(extract_bracketed_value("abc").is_err());
        assert!(extract_bracketed_value("[abc").is_err());
        assert!(extract_bracketed_value("[abc]x").is_err());
    }

    #[test]
    fn split_top_level_respects_nesting() {
        let parts = split_top_level("a=[x,y],b=c", ',').unwrap();
        assert_eq!(parts, vec!["a=[x,y]", "b=c"]);
    }

    #[test]
    fn scenario_s7_config_parse() {
        // S7.
        let cfg = parse_allocator_config("dedup:parent=mremap,dedup_threshold=32,bucket_count_bits=10")
            .unwrap();
        match cfg {
            AllocatorConfig::Dedup { parent, dedup } => {
                assert!(matches!(*parent, AllocatorConfig::Mremap(_)));
                assert_eq!(dedup.dedup_threshold, 32);
                assert_eq!(dedup.bucket_count_bits, 10);
                assert_eq!(dedup.bloom_filter_bits, DedupConfig::default().bloom_filter_bits);
            }
            other => panic!("expected Dedup, got {other:?}"),
        }
    }

    #[test]
    fn nested_bracketed_parent_config() {
        let cfg = parse_allocator_config("dedup:parent=[mremap:grow_ratio=2.0]").unwrap();
        match cfg {
            AllocatorConfig::Dedup { parent, .. } => match *parent {
                AllocatorConfig::Mremap(growable) => assert_eq!(growable.grow_ratio, 2.0),
                other => panic!("expected Mremap, got {other:?}"),
            },
            other => panic!("expected Dedup, got {other:?}"),
        }
    }

    #[test]
    fn auto_scenario_config() {
        let cfg = parse_allocator_config("auto:scenario=single_linear_dedup,estimated_max_size=1M").unwrap();
        match cfg {
            AllocatorConfig::Auto { scenario, estimated_max_size } => {
                assert_eq!(scenario, ScenarioType::SingleLinearDedup);
                assert_eq!(estimated_max_size, 1024 * 1024);
            }
            other => panic!("expected Auto, got {other:?}"),
        }
    }

    #[test]
    fn instantiate_builds_a_live_allocator_that_dedups() {
        let cfg = parse_allocator_config("dedup:parent=malloc,dedup_threshold=0").unwrap();
        let allocator = instantiate(&cfg).unwrap();
        let tag = allocator.get_tag().unwrap();
        let a = allocator.store(tag, b"same", 1).unwrap();
        let b = allocator.store(tag, b"same", 1).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn instantiate_rejects_dedup_of_dedup_parent() {
        let cfg = AllocatorConfig::Dedup {
            parent: Box::new(AllocatorConfig::Dedup {
                parent: Box::new(AllocatorConfig::Malloc),
                dedup: DedupConfig::default(),
            }),
            dedup: DedupConfig::default(),
        };
        assert!(instantiate(&cfg).is_err());
    }
}
