//! Declarative cache bindings.
//!
//! [`Cacheable`] wraps an async function so its result is cached under a key
//! rendered from the call arguments. [`CacheInvalidate`] wraps a mutating
//! function and invalidates keys or patterns around it.
//!
//! ```ignore
//! let get_report = Cacheable::new(
//!     cache.clone(),
//!     CacheableOptions::new("report:{0}").ttl_secs(30),
//!     |(month,): (&'static str,)| async move { build_report(month).await },
//! )?;
//! let report = get_report.call(("2025-01",)).await?;
//! ```

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::coordinator::{Condition, TieredCache};
use crate::error::{CacheError, CacheResult};
use crate::options::{CacheLevel, CacheOptions};

/// Canonical, order-stable string form of a key argument.
///
/// Implemented for primitives; structured types implement it explicitly
/// (typically by returning their id) so keys do not depend on field order.
pub trait KeyPart {
    fn key_part(&self) -> String;
}

macro_rules! key_part_via_to_string {
    ($($t:ty),* $(,)?) => {
        $(
            impl KeyPart for $t {
                fn key_part(&self) -> String {
                    self.to_string()
                }
            }
        )*
    };
}

key_part_via_to_string!(
    str, String, char, bool, i8, i16, i32, i64, i128, isize, u8, u16, u32, u64, u128, usize,
    f32, f64,
);

impl<T: KeyPart + ?Sized> KeyPart for &T {
    fn key_part(&self) -> String {
        (**self).key_part()
    }
}

impl<T: KeyPart> KeyPart for Option<T> {
    fn key_part(&self) -> String {
        match self {
            Some(value) => value.key_part(),
            None => "null".to_string(),
        }
    }
}

impl<T: KeyPart + ?Sized> KeyPart for Arc<T> {
    fn key_part(&self) -> String {
        (**self).key_part()
    }
}

/// Positional arguments of a wrapped call.
pub trait KeyArgs {
    fn key_parts(&self) -> Vec<String>;
}

impl KeyArgs for () {
    fn key_parts(&self) -> Vec<String> {
        Vec::new()
    }
}

macro_rules! key_args_tuple {
    ($($name:ident : $idx:tt),+) => {
        impl<$($name: KeyPart),+> KeyArgs for ($($name,)+) {
            fn key_parts(&self) -> Vec<String> {
                vec![$(self.$idx.key_part()),+]
            }
        }
    };
}

key_args_tuple!(A: 0);
key_args_tuple!(A: 0, B: 1);
key_args_tuple!(A: 0, B: 1, C: 2);
key_args_tuple!(A: 0, B: 1, C: 2, D: 3);
key_args_tuple!(A: 0, B: 1, C: 2, D: 3, E: 4);
key_args_tuple!(A: 0, B: 1, C: 2, D: 3, E: 4, F: 5);

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Arg(usize),
}

/// Key template with `{0}`, `{1}`, … placeholders for positional arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyTemplate {
    raw: String,
    segments: Vec<Segment>,
}

impl KeyTemplate {
    /// Parse `template`. Unbalanced braces and non-numeric placeholders are
    /// rejected.
    pub fn parse(template: &str) -> CacheResult<Self> {
        let malformed = |why: &str| {
            CacheError::invalid_configuration(format!("malformed key template '{template}': {why}"))
        };

        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = template.chars();

        while let Some(c) = chars.next() {
            match c {
                '{' => {
                    let mut digits = String::new();
                    let mut closed = false;
                    for c in chars.by_ref() {
                        if c == '}' {
                            closed = true;
                            break;
                        }
                        digits.push(c);
                    }
                    if !closed {
                        return Err(malformed("unclosed '{'"));
                    }
                    let index = digits
                        .parse::<usize>()
                        .map_err(|_| malformed("placeholders must be argument indexes like {0}"))?;
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(Segment::Arg(index));
                }
                '}' => return Err(malformed("unmatched '}'")),
                c => literal.push(c),
            }
        }
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Ok(Self {
            raw: template.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Number of arguments the template needs, i.e. highest index + 1.
    pub fn arity(&self) -> usize {
        self.segments
            .iter()
            .filter_map(|s| match s {
                Segment::Arg(i) => Some(i + 1),
                Segment::Literal(_) => None,
            })
            .max()
            .unwrap_or(0)
    }

    /// Substitute rendered arguments into the template.
    pub fn render(&self, args: &[String]) -> CacheResult<String> {
        let mut key = String::with_capacity(self.raw.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => key.push_str(text),
                Segment::Arg(i) => {
                    let part = args.get(*i).ok_or_else(|| {
                        CacheError::invalid_configuration(format!(
                            "key template '{}' references argument {i} but the call has {}",
                            self.raw,
                            args.len()
                        ))
                    })?;
                    key.push_str(part);
                }
            }
        }
        Ok(key)
    }

    /// Render with the positional arguments of a call.
    pub fn render_args<A: KeyArgs + ?Sized>(&self, args: &A) -> CacheResult<String> {
        self.render(&args.key_parts())
    }
}

impl fmt::Display for KeyTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// One-shot form of [`KeyTemplate::parse`] + [`KeyTemplate::render`].
pub fn build_cache_key(template: &str, args: &[&dyn KeyPart]) -> CacheResult<String> {
    let parts: Vec<String> = args.iter().map(|a| a.key_part()).collect();
    KeyTemplate::parse(template)?.render(&parts)
}

/// Options for [`Cacheable`].
pub struct CacheableOptions<T> {
    /// Key template, e.g. `"user:{0}"`
    pub key: String,
    pub ttl: Option<Duration>,
    pub prefix: Option<String>,
    pub level: Option<CacheLevel>,
    /// Results rejected by the condition are returned but not cached
    pub condition: Option<Condition<T>>,
}

impl<T> Clone for CacheableOptions<T> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            ttl: self.ttl,
            prefix: self.prefix.clone(),
            level: self.level,
            condition: self.condition.clone(),
        }
    }
}

impl<T> CacheableOptions<T> {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ttl: None,
            prefix: None,
            level: None,
            condition: None,
        }
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn ttl_secs(self, secs: u64) -> Self {
        self.ttl(Duration::from_secs(secs))
    }

    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    pub fn level(mut self, level: CacheLevel) -> Self {
        self.level = Some(level);
        self
    }

    pub fn condition(mut self, condition: impl Fn(&T) -> bool + Send + Sync + 'static) -> Self {
        self.condition = Some(Arc::new(condition));
        self
    }

    fn cache_options(&self) -> CacheOptions {
        CacheOptions {
            ttl: self.ttl,
            prefix: self.prefix.clone(),
            level: self.level,
        }
    }
}

/// An async function whose results are cached per rendered key.
///
/// Concurrent calls with the same key share one invocation of the function.
pub struct Cacheable<T, F> {
    cache: TieredCache,
    template: KeyTemplate,
    options: CacheOptions,
    condition: Option<Condition<T>>,
    func: Arc<F>,
}

impl<T, F> Clone for Cacheable<T, F> {
    fn clone(&self) -> Self {
        Self {
            cache: self.cache.clone(),
            template: self.template.clone(),
            options: self.options.clone(),
            condition: self.condition.clone(),
            func: Arc::clone(&self.func),
        }
    }
}

impl<T, F> Cacheable<T, F> {
    /// Wrap `func`. Fails with `InvalidConfiguration` on a malformed key
    /// template.
    pub fn new(cache: TieredCache, options: CacheableOptions<T>, func: F) -> CacheResult<Self> {
        let template = KeyTemplate::parse(&options.key)?;
        Ok(Self {
            cache,
            options: options.cache_options(),
            condition: options.condition,
            template,
            func: Arc::new(func),
        })
    }

    pub fn template(&self) -> &KeyTemplate {
        &self.template
    }

    /// Key a call with `args` would use, without the cache prefixes.
    pub fn key_for<A: KeyArgs>(&self, args: &A) -> CacheResult<String> {
        self.template.render_args(args)
    }

    /// Return the cached result for `args`, invoking the function on a miss.
    pub async fn call<A, Fut>(&self, args: A) -> CacheResult<T>
    where
        A: KeyArgs + Send + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
        T: Serialize + DeserializeOwned + Send + 'static,
    {
        let key = self.key_for(&args)?;
        let func = Arc::clone(&self.func);
        self.cache
            .get_or_compute_if(&key, &self.options, self.condition.clone(), move || {
                (*func)(args)
            })
            .await
    }
}

/// One key/pattern or several.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidationKeys {
    One(String),
    Many(Vec<String>),
}

impl InvalidationKeys {
    /// Flatten to a list of templates.
    pub fn normalize(self) -> Vec<String> {
        match self {
            InvalidationKeys::One(key) => vec![key],
            InvalidationKeys::Many(keys) => keys,
        }
    }
}

impl From<&str> for InvalidationKeys {
    fn from(key: &str) -> Self {
        InvalidationKeys::One(key.to_string())
    }
}

impl From<String> for InvalidationKeys {
    fn from(key: String) -> Self {
        InvalidationKeys::One(key)
    }
}

impl From<Vec<String>> for InvalidationKeys {
    fn from(keys: Vec<String>) -> Self {
        InvalidationKeys::Many(keys)
    }
}

impl From<Vec<&str>> for InvalidationKeys {
    fn from(keys: Vec<&str>) -> Self {
        InvalidationKeys::Many(keys.into_iter().map(str::to_string).collect())
    }
}

impl<const N: usize> From<[&str; N]> for InvalidationKeys {
    fn from(keys: [&str; N]) -> Self {
        InvalidationKeys::Many(keys.iter().map(|k| k.to_string()).collect())
    }
}

/// Options for [`CacheInvalidate`].
#[derive(Debug, Clone)]
pub struct CacheInvalidateOptions {
    /// Key or pattern templates, e.g. `"user:{0}"` or `"users:*"`
    pub keys: InvalidationKeys,
    /// Invalidate before running the wrapped function instead of after
    pub before_invocation: bool,
    pub prefix: Option<String>,
    pub level: Option<CacheLevel>,
}

impl CacheInvalidateOptions {
    pub fn new(keys: impl Into<InvalidationKeys>) -> Self {
        Self {
            keys: keys.into(),
            before_invocation: false,
            prefix: None,
            level: None,
        }
    }

    pub fn before_invocation(mut self, before: bool) -> Self {
        self.before_invocation = before;
        self
    }

    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    pub fn level(mut self, level: CacheLevel) -> Self {
        self.level = Some(level);
        self
    }
}

/// An async function that invalidates cache entries around each call.
///
/// By default the function runs first and keys are invalidated only when it
/// succeeds. With `before_invocation` the keys are invalidated first, whatever
/// the outcome of the call.
///
/// Invalidation faults are logged and counted by the cache but never replace
/// the outcome of the wrapped call.
pub struct CacheInvalidate<F> {
    cache: TieredCache,
    templates: Vec<KeyTemplate>,
    before_invocation: bool,
    options: CacheOptions,
    func: F,
}

impl<F> CacheInvalidate<F> {
    pub fn new(cache: TieredCache, options: CacheInvalidateOptions, func: F) -> CacheResult<Self> {
        let templates = options
            .keys
            .normalize()
            .iter()
            .map(|t| KeyTemplate::parse(t))
            .collect::<CacheResult<Vec<_>>>()?;
        Ok(Self {
            cache,
            templates,
            before_invocation: options.before_invocation,
            options: CacheOptions {
                ttl: None,
                prefix: options.prefix,
                level: options.level,
            },
            func,
        })
    }

    /// Keys and patterns a call with `args` would invalidate.
    pub fn patterns_for<A: KeyArgs>(&self, args: &A) -> CacheResult<Vec<String>> {
        let parts = args.key_parts();
        self.templates.iter().map(|t| t.render(&parts)).collect()
    }

    async fn invalidate(&self, patterns: &[String]) {
        if let Err(e) = self.cache.invalidate_with(patterns, &self.options).await {
            tracing::warn!(patterns = ?patterns, error = %e, "cache invalidation failed");
        }
    }

    pub async fn call<A, R, Fut>(&self, args: A) -> CacheResult<R>
    where
        A: KeyArgs,
        F: Fn(A) -> Fut,
        Fut: Future<Output = anyhow::Result<R>>,
    {
        let patterns = self.patterns_for(&args)?;

        if self.before_invocation {
            self.invalidate(&patterns).await;
            return (self.func)(args).await.map_err(CacheError::compute);
        }

        let result = (self.func)(args).await.map_err(CacheError::compute)?;
        self.invalidate(&patterns).await;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Entity {
        id: &'static str,
        #[allow(dead_code)]
        name: &'static str,
    }

    impl KeyPart for Entity {
        fn key_part(&self) -> String {
            self.id.to_string()
        }
    }

    #[test]
    fn replaces_single_placeholder() {
        assert_eq!(build_cache_key("user:{0}", &[&"123"]).unwrap(), "user:123");
    }

    #[test]
    fn replaces_multiple_placeholders() {
        let key = build_cache_key("user:{0}:profile:{1}", &[&"123", &"avatar"]).unwrap();
        assert_eq!(key, "user:123:profile:avatar");
    }

    #[test]
    fn renders_numbers_and_repeated_indexes() {
        assert_eq!(
            build_cache_key("page:{0}:limit:{1}", &[&1u32, &50i64]).unwrap(),
            "page:1:limit:50"
        );
        assert_eq!(build_cache_key("{0}-{0}", &[&true]).unwrap(), "true-true");
    }

    #[test]
    fn structured_arguments_use_their_key_part() {
        let entity = Entity {
            id: "abc-123",
            name: "Test",
        };
        assert_eq!(
            build_cache_key("entity:{0}", &[&entity]).unwrap(),
            "entity:abc-123"
        );
    }

    #[test]
    fn none_renders_as_null() {
        let missing: Option<u32> = None;
        assert_eq!(build_cache_key("key:{0}", &[&missing]).unwrap(), "key:null");
        assert_eq!(build_cache_key("key:{0}", &[&Some(7u32)]).unwrap(), "key:7");
    }

    #[test]
    fn malformed_templates_are_rejected() {
        for bad in ["user:{0", "user:{x}", "user:{}", "user:0}"] {
            assert!(
                matches!(KeyTemplate::parse(bad), Err(CacheError::InvalidConfiguration(_))),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn missing_argument_fails_at_render() {
        let template = KeyTemplate::parse("a:{0}:b:{2}").unwrap();
        assert_eq!(template.arity(), 3);
        assert!(template.render_args(&("x", "y")).is_err());
        assert_eq!(template.render_args(&("x", "y", "z")).unwrap(), "a:x:b:z");
    }

    #[test]
    fn template_without_placeholders_is_literal() {
        let template = KeyTemplate::parse("users:list").unwrap();
        assert_eq!(template.arity(), 0);
        assert_eq!(template.render_args(&()).unwrap(), "users:list");
    }

    #[test]
    fn normalizes_invalidation_keys() {
        assert_eq!(
            InvalidationKeys::from("user:{0}").normalize(),
            vec!["user:{0}".to_string()]
        );
        assert_eq!(
            InvalidationKeys::from(["user:{0}", "users:list"]).normalize(),
            vec!["user:{0}".to_string(), "users:list".to_string()]
        );
        assert!(InvalidationKeys::from(Vec::<String>::new()).normalize().is_empty());
    }
}
