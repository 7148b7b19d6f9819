//! Placeholder resolver
//!
//! Substitutes `${resource:<name>.<property>}`, `${secret:<name>}` and
//! `${auth:<provider>}` tokens inside string values of a resolved descriptor.
//!
//! - A string that is exactly one token takes the referenced value's type.
//! - Otherwise scalars are interpolated; maps and sequences cannot be.
//! - Substitution is a single left-to-right pass. A substituted value that
//!   itself contains a token is rejected.
//! - Every error is collected; resolution never stops at the first one.

use crate::document::{Document, Mapping, join_path};
use crate::error::PlaceholderError;
use crate::inheritance::MergedDescriptor;
use crate::provider::Outputs;
use regex::{Captures, Regex};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::LazyLock;
use tracing::debug;

static TOKEN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{(resource|secret|auth):([^}]*)\}").expect("placeholder pattern is valid")
});

static EMPTY_OUTPUTS: BTreeMap<String, Outputs> = BTreeMap::new();
static EMPTY_PENDING: BTreeSet<String> = BTreeSet::new();
static EMPTY_CREDENTIALS: BTreeMap<String, String> = BTreeMap::new();

/// Token kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TokenKind {
    Resource,
    Secret,
    Auth,
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenKind::Resource => write!(f, "resource"),
            TokenKind::Secret => write!(f, "secret"),
            TokenKind::Auth => write!(f, "auth"),
        }
    }
}

/// A well-formed placeholder found in a document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaceholderToken {
    pub kind: TokenKind,
    /// Resource, secret or auth provider name
    pub target: String,
    /// Dotted output path, resource tokens only
    pub property: Option<String>,
    /// Field path of the string containing the token
    pub field: String,
}

impl PlaceholderToken {
    /// Stable marker used while the referenced resource is not applied
    pub fn pending_marker(&self) -> String {
        match &self.property {
            Some(property) => format!("<pending:{}:{}.{}>", self.kind, self.target, property),
            None => format!("<pending:{}:{}>", self.kind, self.target),
        }
    }
}

impl fmt::Display for PlaceholderToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.property {
            Some(property) => write!(f, "${{{}:{}.{}}}", self.kind, self.target, property),
            None => write!(f, "${{{}:{}}}", self.kind, self.target),
        }
    }
}

/// Decrypted secret source
pub trait SecretLookup: Send + Sync {
    fn secret(&self, name: &str) -> Option<&str>;
}

impl SecretLookup for BTreeMap<String, String> {
    fn secret(&self, name: &str) -> Option<&str> {
        self.get(name).map(String::as_str)
    }
}

/// Whether unapplied resources may be deferred
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveMode {
    Apply,
    Preview,
}

/// Inputs available while substituting
#[derive(Clone, Copy)]
pub struct PlaceholderContext<'a> {
    pub mode: ResolveMode,
    /// Persisted outputs by resource name
    pub outputs: &'a BTreeMap<String, Outputs>,
    /// Resources that will be applied earlier in the same run
    pub pending: &'a BTreeSet<String>,
    pub secrets: Option<&'a dyn SecretLookup>,
    /// Pre-fetched credential tokens by auth provider
    pub credentials: &'a BTreeMap<String, String>,
}

impl<'a> PlaceholderContext<'a> {
    pub fn new(mode: ResolveMode) -> Self {
        Self {
            mode,
            outputs: &EMPTY_OUTPUTS,
            pending: &EMPTY_PENDING,
            secrets: None,
            credentials: &EMPTY_CREDENTIALS,
        }
    }

    pub fn with_outputs(mut self, outputs: &'a BTreeMap<String, Outputs>) -> Self {
        self.outputs = outputs;
        self
    }

    pub fn with_pending(mut self, pending: &'a BTreeSet<String>) -> Self {
        self.pending = pending;
        self
    }

    pub fn with_secrets(mut self, secrets: &'a dyn SecretLookup) -> Self {
        self.secrets = Some(secrets);
        self
    }

    pub fn with_credentials(mut self, credentials: &'a BTreeMap<String, String>) -> Self {
        self.credentials = credentials;
        self
    }
}

impl fmt::Debug for PlaceholderContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlaceholderContext")
            .field("mode", &self.mode)
            .field("outputs", &self.outputs.keys().collect::<Vec<_>>())
            .field("pending", &self.pending)
            .field("secrets", &self.secrets.is_some())
            .field("credentials", &self.credentials.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Result of substituting one document
#[derive(Debug, Clone, PartialEq)]
pub struct Resolved {
    pub value: Document,
    /// Same document with secret and credential values obfuscated
    pub redacted: Document,
    /// Field paths that received a secret or credential
    pub sensitive: BTreeSet<String>,
    /// Resource tokens left as pending markers
    pub deferred: Vec<PlaceholderToken>,
    /// Resource names referenced
    pub references: BTreeSet<String>,
    /// SHA-256 over the substituted secret values, `None` without secrets.
    /// Changes when a secret is rotated even if `redacted` does not.
    pub secret_digest: Option<String>,
    /// Plaintext substituted for secret and credential tokens
    pub sensitive_values: SensitiveValues,
}

/// Secret and credential values substituted into a document
///
/// Used to mask those values wherever a provider echoes them back, so that
/// nothing derived from a secret is persisted in plain text.
#[derive(Clone, Default, PartialEq)]
pub struct SensitiveValues {
    values: Vec<String>,
}

impl SensitiveValues {
    fn insert(&mut self, value: &str) {
        if !value.is_empty() && !self.values.iter().any(|v| v == value) {
            self.values.push(value.to_string());
            // Longest first, so a value containing another is masked whole
            self.values.sort_by(|a, b| b.len().cmp(&a.len()));
        }
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Obfuscate every occurrence of a sensitive value inside a string
    pub fn mask_str(&self, input: &str) -> String {
        self.values.iter().fold(input.to_string(), |masked, value| {
            masked.replace(value.as_str(), &obfuscate(value))
        })
    }

    pub fn mask(&self, document: &Document) -> Document {
        if self.is_empty() {
            return document.clone();
        }
        document.map_strings("", &mut |_, s| Document::String(self.mask_str(s)))
    }

    pub fn mask_outputs(&self, outputs: &Outputs) -> Outputs {
        outputs
            .iter()
            .map(|(key, value)| (key.clone(), self.mask(value)))
            .collect()
    }
}

impl fmt::Debug for SensitiveValues {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SensitiveValues({} redacted)", self.values.len())
    }
}

/// Result of substituting a resolved descriptor
#[derive(Debug, Clone, PartialEq)]
pub struct Substituted {
    pub descriptor: MergedDescriptor,
    redacted_config: Document,
    pub sensitive: BTreeSet<String>,
    pub deferred: Vec<PlaceholderToken>,
    pub references: BTreeSet<String>,
}

impl Substituted {
    /// Descriptor with sensitive values masked, safe to print
    pub fn redacted(&self) -> MergedDescriptor {
        MergedDescriptor {
            config: self.redacted_config.clone(),
            ..self.descriptor.clone()
        }
    }

    pub fn is_complete(&self) -> bool {
        self.deferred.is_empty()
    }
}

/// Find every well-formed token in the descriptor's config
pub fn scan(descriptor: &MergedDescriptor) -> Vec<PlaceholderToken> {
    scan_document(&descriptor.config, "config")
}

/// Find every well-formed token in a document
pub fn scan_document(document: &Document, base: &str) -> Vec<PlaceholderToken> {
    let mut tokens = Vec::new();
    document.visit_strings(base, &mut |field, value| {
        for captures in TOKEN_RE.captures_iter(value) {
            if let Ok(token) = parse_token(&captures, field) {
                tokens.push(token);
            }
        }
    });
    tokens
}

/// Names of resources a document references through `${resource:..}`
pub fn resource_dependencies(document: &Document) -> BTreeSet<String> {
    scan_document(document, "")
        .into_iter()
        .filter(|t| t.kind == TokenKind::Resource)
        .map(|t| t.target)
        .collect()
}

/// Whether a string contains any placeholder
pub fn contains_placeholder(value: &str) -> bool {
    TOKEN_RE.is_match(value)
}

/// Substitute the config of a resolved descriptor
///
/// Resource tokens may only name the descriptor's own resources or its `uses`.
pub fn resolve(
    descriptor: &MergedDescriptor,
    ctx: &PlaceholderContext<'_>,
) -> Result<Substituted, Vec<PlaceholderError>> {
    let scope = |name: &str| descriptor.referenceable(name).is_some();
    let resolved = resolve_document(&descriptor.config, "config", &scope, ctx)?;
    debug!(
        stack = %descriptor.name,
        references = resolved.references.len(),
        deferred = resolved.deferred.len(),
        sensitive = resolved.sensitive.len(),
        "Substituted placeholders"
    );
    Ok(Substituted {
        descriptor: MergedDescriptor {
            config: resolved.value,
            ..descriptor.clone()
        },
        redacted_config: resolved.redacted,
        sensitive: resolved.sensitive,
        deferred: resolved.deferred,
        references: resolved.references,
    })
}

/// Substitute a single document
///
/// `scope` decides which resource names may be referenced.
pub fn resolve_document(
    document: &Document,
    base: &str,
    scope: &dyn Fn(&str) -> bool,
    ctx: &PlaceholderContext<'_>,
) -> Result<Resolved, Vec<PlaceholderError>> {
    let mut walker = Walker {
        scope,
        ctx,
        errors: Vec::new(),
        sensitive: BTreeSet::new(),
        deferred: Vec::new(),
        references: BTreeSet::new(),
        secrets: Vec::new(),
        sensitive_values: SensitiveValues::default(),
    };
    let (value, redacted) = walker.walk(document, base);

    if walker.errors.is_empty() {
        Ok(Resolved {
            value,
            redacted,
            secret_digest: secret_digest(walker.secrets),
            sensitive: walker.sensitive,
            deferred: walker.deferred,
            references: walker.references,
            sensitive_values: walker.sensitive_values,
        })
    } else {
        Err(walker.errors)
    }
}

/// Mask a sensitive value, keeping only the first and last character
pub fn obfuscate(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    match chars.len() {
        0..=2 => "*".repeat(chars.len()),
        n => format!("{}{}{}", chars[0], "*".repeat(n - 2), chars[n - 1]),
    }
}

/// Digest over (field, secret name, value), in field order
fn secret_digest(mut secrets: Vec<(String, String, String)>) -> Option<String> {
    if secrets.is_empty() {
        return None;
    }
    secrets.sort();
    let mut hasher = Sha256::new();
    for (field, name, value) in &secrets {
        for part in [field, name, value] {
            hasher.update(part.as_bytes());
            hasher.update([0u8]);
        }
    }
    Some(format!("sha256:{:x}", hasher.finalize()))
}

fn parse_token(captures: &Captures<'_>, field: &str) -> Result<PlaceholderToken, PlaceholderError> {
    let raw = &captures[0];
    let body = &captures[2];
    let malformed = |message: &str| PlaceholderError::Malformed {
        field: field.to_string(),
        token: raw.to_string(),
        message: message.to_string(),
    };

    if body.contains("${") {
        return Err(PlaceholderError::Nested {
            field: field.to_string(),
            token: raw.to_string(),
        });
    }

    let kind = match &captures[1] {
        "resource" => TokenKind::Resource,
        "secret" => TokenKind::Secret,
        _ => TokenKind::Auth,
    };

    let (target, property) = match kind {
        TokenKind::Resource => {
            let (name, property) = body
                .split_once('.')
                .ok_or_else(|| malformed("expected <name>.<property>"))?;
            if property.is_empty() || property.split('.').any(|s| !is_identifier(s)) {
                return Err(malformed("invalid property path"));
            }
            (name, Some(property.to_string()))
        }
        TokenKind::Secret | TokenKind::Auth => (body, None),
    };
    if !is_identifier(target) {
        return Err(malformed("invalid name"));
    }

    Ok(PlaceholderToken {
        kind,
        target: target.to_string(),
        property,
        field: field.to_string(),
    })
}

fn is_identifier(s: &str) -> bool {
    !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// One substituted token value
struct Replacement {
    value: Document,
    redacted: Document,
}

struct Walker<'s, 'c> {
    scope: &'s dyn Fn(&str) -> bool,
    ctx: &'s PlaceholderContext<'c>,
    errors: Vec<PlaceholderError>,
    sensitive: BTreeSet<String>,
    deferred: Vec<PlaceholderToken>,
    references: BTreeSet<String>,
    /// (field, name, value) of every substituted secret
    secrets: Vec<(String, String, String)>,
    sensitive_values: SensitiveValues,
}

impl Walker<'_, '_> {
    fn walk(&mut self, document: &Document, path: &str) -> (Document, Document) {
        match document {
            Document::String(s) => self.substitute(s, path),
            Document::Map(m) => {
                let mut value = Mapping::new();
                let mut redacted = Mapping::new();
                for (key, item) in m.iter() {
                    let (v, r) = self.walk(item, &join_path(path, key));
                    value.insert(key.clone(), v);
                    redacted.insert(key.clone(), r);
                }
                (Document::Map(value), Document::Map(redacted))
            }
            Document::Seq(items) => {
                let (value, redacted): (Vec<Document>, Vec<Document>) = items
                    .iter()
                    .enumerate()
                    .map(|(i, item)| self.walk(item, &join_path(path, &i.to_string())))
                    .unzip();
                (Document::Seq(value), Document::Seq(redacted))
            }
            other => (other.clone(), other.clone()),
        }
    }

    fn substitute(&mut self, input: &str, field: &str) -> (Document, Document) {
        let original = Document::String(input.to_string());
        let matches: Vec<Captures<'_>> = TOKEN_RE.captures_iter(input).collect();
        if matches.is_empty() {
            return (original.clone(), original);
        }

        // 完全一致トークンは参照先の型を保持する
        if matches.len() == 1 && &matches[0][0] == input {
            return match self.replacement(&matches[0], field) {
                Some(r) => (r.value, r.redacted),
                None => (original.clone(), original),
            };
        }

        let mut value = String::with_capacity(input.len());
        let mut redacted = String::with_capacity(input.len());
        let mut last = 0;
        let mut failed = false;
        for captures in &matches {
            let whole = captures.get(0).map(|m| m.range()).unwrap_or(0..0);
            value.push_str(&input[last..whole.start]);
            redacted.push_str(&input[last..whole.start]);
            last = whole.end;

            let Some(replacement) = self.replacement(captures, field) else {
                failed = true;
                continue;
            };
            match (
                replacement.value.render_scalar(),
                replacement.redacted.render_scalar(),
            ) {
                (Some(v), Some(r)) => {
                    value.push_str(&v);
                    redacted.push_str(&r);
                }
                _ => {
                    failed = true;
                    self.errors.push(PlaceholderError::NonScalar {
                        field: field.to_string(),
                        token: captures[0].to_string(),
                    });
                }
            }
        }
        value.push_str(&input[last..]);
        redacted.push_str(&input[last..]);

        if failed {
            return (original.clone(), original);
        }
        (Document::String(value), Document::String(redacted))
    }

    /// Value for one token, or `None` after recording an error
    fn replacement(&mut self, captures: &Captures<'_>, field: &str) -> Option<Replacement> {
        let token = match parse_token(captures, field) {
            Ok(token) => token,
            Err(err) => {
                self.errors.push(err);
                return None;
            }
        };

        let replacement = match token.kind {
            TokenKind::Resource => self.resource_value(&token)?,
            TokenKind::Secret => {
                let secret = self.ctx.secrets.and_then(|s| s.secret(&token.target));
                let Some(secret) = secret else {
                    self.errors.push(PlaceholderError::MissingSecret {
                        field: field.to_string(),
                        name: token.target.clone(),
                    });
                    return None;
                };
                self.sensitive.insert(field.to_string());
                self.sensitive_values.insert(secret);
                self.secrets.push((
                    field.to_string(),
                    token.target.clone(),
                    secret.to_string(),
                ));
                Replacement {
                    value: Document::String(secret.to_string()),
                    redacted: Document::String(obfuscate(secret)),
                }
            }
            TokenKind::Auth => {
                let Some(credential) = self.ctx.credentials.get(&token.target) else {
                    self.errors.push(PlaceholderError::MissingCredential {
                        field: field.to_string(),
                        provider: token.target.clone(),
                    });
                    return None;
                };
                self.sensitive.insert(field.to_string());
                self.sensitive_values.insert(credential);
                Replacement {
                    value: Document::String(credential.clone()),
                    redacted: Document::String(obfuscate(credential)),
                }
            }
        };

        if replacement.value.any_str(&|s| contains_placeholder(s)) {
            self.errors.push(PlaceholderError::Nested {
                field: field.to_string(),
                token: token.to_string(),
            });
            return None;
        }
        Some(replacement)
    }

    fn resource_value(&mut self, token: &PlaceholderToken) -> Option<Replacement> {
        let field = token.field.clone();
        let property = token.property.clone().unwrap_or_default();

        if !(self.scope)(&token.target) {
            self.errors.push(PlaceholderError::UnknownResource {
                field,
                resource: token.target.clone(),
            });
            return None;
        }
        self.references.insert(token.target.clone());

        if let Some(outputs) = self.ctx.outputs.get(&token.target) {
            let (head, rest) = match property.split_once('.') {
                Some((head, rest)) => (head, rest),
                None => (property.as_str(), ""),
            };
            let found = outputs.get(head).and_then(|v| v.pointer(rest)).cloned();
            return match found {
                Some(value) => Some(Replacement {
                    redacted: value.clone(),
                    value,
                }),
                None => {
                    self.errors.push(PlaceholderError::MissingOutput {
                        field,
                        resource: token.target.clone(),
                        property,
                    });
                    None
                }
            };
        }

        let deferrable = match self.ctx.mode {
            ResolveMode::Preview => true,
            ResolveMode::Apply => self.ctx.pending.contains(&token.target),
        };
        if !deferrable {
            self.errors.push(PlaceholderError::ResourceNotApplied {
                field,
                resource: token.target.clone(),
            });
            return None;
        }

        let marker = Document::String(token.pending_marker());
        self.deferred.push(token.clone());
        Some(Replacement {
            value: marker.clone(),
            redacted: marker,
        })
    }
}
