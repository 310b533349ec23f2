//! SQL `LIKE` matching for filter predicates.

use crate::core::{PersistError, Result};
use lru::LruCache;
use regex::{Regex, RegexBuilder};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, PoisonError};

const COMPILED_PATTERNS: NonZeroUsize = NonZeroUsize::new(128).unwrap();

lazy_static::lazy_static! {
    static ref PATTERN_CACHE: Mutex<LruCache<String, Arc<Regex>>> =
        Mutex::new(LruCache::new(COMPILED_PATTERNS));
}

/// Translates `%` and `_` wildcards; `\` escapes the next character.
fn like_to_regex(pattern: &str) -> String {
    let mut translated = String::with_capacity(pattern.len() + 2);
    translated.push('^');

    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        match c {
            '%' => translated.push_str(".*"),
            '_' => translated.push('.'),
            '\\' => match chars.next() {
                Some(escaped) => translated.push_str(&regex::escape(&escaped.to_string())),
                None => translated.push_str(r"\\"),
            },
            c => translated.push_str(&regex::escape(&c.to_string())),
        }
    }

    translated.push('$');
    translated
}

/// Answers the common shapes (`abc`, `abc%`, `%abc`, `%abc%`) without a regex.
fn match_simple(text: &str, pattern: &str, case_sensitive: bool) -> Option<bool> {
    if pattern.contains('_') || pattern.contains('\\') {
        return None;
    }
    let (text, pattern) = if case_sensitive {
        (text.to_string(), pattern.to_string())
    } else {
        (text.to_lowercase(), pattern.to_lowercase())
    };

    let inner = pattern.trim_matches('%');
    if inner.contains('%') {
        return None;
    }
    let leading = pattern.starts_with('%');
    let trailing = pattern.len() > inner.len() + usize::from(leading);

    Some(match (leading, trailing) {
        (false, false) => text == inner,
        (false, true) => text.starts_with(inner),
        (true, false) => text.ends_with(inner),
        (true, true) => text.contains(inner),
    })
}

fn compiled(pattern: &str, case_sensitive: bool) -> Result<Arc<Regex>> {
    let cache_key = format!("{}:{}", if case_sensitive { 's' } else { 'i' }, pattern);

    if let Some(regex) = PATTERN_CACHE
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .get(&cache_key)
    {
        return Ok(Arc::clone(regex));
    }

    let regex = RegexBuilder::new(&like_to_regex(pattern))
        .case_insensitive(!case_sensitive)
        .build()
        .map_err(|e| PersistError::Query(format!("Invalid LIKE pattern '{}': {}", pattern, e)))?;
    let regex = Arc::new(regex);

    PATTERN_CACHE
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .put(cache_key, Arc::clone(&regex));
    Ok(regex)
}

pub fn eval_like(text: &str, pattern: &str, case_sensitive: bool) -> Result<bool> {
    if let Some(matched) = match_simple(text, pattern, case_sensitive) {
        return Ok(matched);
    }
    Ok(compiled(pattern, case_sensitive)?.is_match(text))
}
