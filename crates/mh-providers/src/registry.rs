use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::provider::Provider;
use crate::ProviderError;

// ---------------------------------------------------------------------------
// Reference parsing
// ---------------------------------------------------------------------------

/// Split a task reference into an optional scheme prefix and the rest.
/// `file:task.md` → `(Some("file"), "task.md")`; `task.md` → `(None, ..)`.
///
/// A scheme is a run of ASCII alphanumerics/`-`/`+` before the first `:`.
/// Anything else (absolute paths, single letters followed by `\` on odd
/// setups) is treated as scheme-less.
pub fn split_reference(reference: &str) -> (Option<&str>, &str) {
    if let Some((scheme, rest)) = reference.split_once(':') {
        let valid = !scheme.is_empty()
            && scheme
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '+');
        if valid {
            return (Some(scheme), rest);
        }
    }
    (None, reference)
}

// ---------------------------------------------------------------------------
// ProviderRegistry
// ---------------------------------------------------------------------------

type ProviderCtor = Box<dyn Fn() -> Arc<dyn Provider> + Send + Sync>;

/// Lookup table from scheme name to provider constructor.
#[derive(Default)]
pub struct ProviderRegistry {
    ctors: HashMap<String, ProviderCtor>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the built-in `file:`, `dir:` and `github:` providers.
    pub fn with_builtins() -> Self {
        let mut reg = Self::new();
        reg.register("file", || Arc::new(crate::file::FileProvider))
            .expect("fresh registry");
        reg.register("dir", || Arc::new(crate::dir::DirProvider))
            .expect("fresh registry");
        reg.register("github", || Arc::new(crate::github::GithubProvider::new()))
            .expect("fresh registry");
        reg
    }

    pub fn register<F>(&mut self, scheme: impl Into<String>, ctor: F) -> Result<(), ProviderError>
    where
        F: Fn() -> Arc<dyn Provider> + Send + Sync + 'static,
    {
        let scheme = scheme.into();
        if self.ctors.contains_key(&scheme) {
            return Err(ProviderError::DuplicateProvider(scheme));
        }
        debug!(scheme = %scheme, "registered provider");
        self.ctors.insert(scheme, Box::new(ctor));
        Ok(())
    }

    pub fn get(&self, scheme: &str) -> Result<Arc<dyn Provider>, ProviderError> {
        self.ctors
            .get(scheme)
            .map(|ctor| ctor())
            .ok_or_else(|| ProviderError::UnknownScheme(scheme.to_string()))
    }

    pub fn contains(&self, scheme: &str) -> bool {
        self.ctors.contains_key(scheme)
    }

    /// Resolve a reference to (provider, provider-local reference), using
    /// the workspace default when no scheme prefix is present.
    pub fn resolve(
        &self,
        reference: &str,
        default: Option<&str>,
    ) -> Result<(Arc<dyn Provider>, String), ProviderError> {
        match split_reference(reference) {
            (Some(scheme), rest) => Ok((self.get(scheme)?, rest.to_string())),
            (None, rest) => {
                let scheme = default.unwrap_or("file");
                Ok((self.get(scheme)?, rest.to_string()))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_reference_variants() {
        assert_eq!(split_reference("file:task.md"), (Some("file"), "task.md"));
        assert_eq!(split_reference("dir:tasks/"), (Some("dir"), "tasks/"));
        assert_eq!(
            split_reference("github:owner/repo#12"),
            (Some("github"), "owner/repo#12")
        );
        assert_eq!(split_reference("task.md"), (None, "task.md"));
        assert_eq!(split_reference(":oops"), (None, ":oops"));
    }

    #[test]
    fn resolve_by_scheme() {
        let reg = ProviderRegistry::with_builtins();
        let (provider, rest) = reg.resolve("file:task.md", None).unwrap();
        assert_eq!(provider.name(), "file");
        assert_eq!(rest, "task.md");
    }

    #[test]
    fn resolve_falls_back_to_default() {
        let reg = ProviderRegistry::with_builtins();
        let (provider, rest) = reg.resolve("tasks/", Some("dir")).unwrap();
        assert_eq!(provider.name(), "dir");
        assert_eq!(rest, "tasks/");
    }

    #[test]
    fn unknown_scheme_is_an_error() {
        let reg = ProviderRegistry::with_builtins();
        assert!(matches!(
            reg.resolve("jira:PROJ-7", None),
            Err(ProviderError::UnknownScheme(_))
        ));
    }

    #[test]
    fn duplicate_scheme_rejected() {
        let mut reg = ProviderRegistry::with_builtins();
        let err = reg
            .register("file", || Arc::new(crate::file::FileProvider))
            .unwrap_err();
        assert!(matches!(err, ProviderError::DuplicateProvider(_)));
    }
}
