//! PolicyGate Store - Rule file storage
//!
//! Owns the flat rule file that feeds the policy engine and serializes every
//! mutation of it behind a single reader-writer lock:
//!
//! - `list` takes the shared lock, so any number of listings run in parallel
//! - `append` and `remove` take the exclusive lock for one read and one write
//! - no reader can observe a file in the middle of a read-modify-write
//!
//! A [`PolicyStore`] is an owned handle with an explicit lifecycle: it is
//! opened once at startup and closed at shutdown.

mod rule;

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

pub use rule::PolicyRule;

/// Errors raised by the rule store
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Rule file {} unavailable: {source}", path.display())]
    Unavailable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Rule store for {} is closed", path.display())]
    Closed { path: PathBuf },

    #[error("Malformed rule: {message}")]
    MalformedRule { message: String },

    #[error("Rule {name} already exists")]
    RuleExists { name: String },
}

impl StoreError {
    /// Whether the failure is an I/O or lifecycle problem rather than bad input
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable { .. } | Self::Closed { .. })
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// State guarded by the store lock. The lock also stands for exclusive
/// ownership of the file contents.
#[derive(Debug)]
struct StoreState {
    open: bool,
}

/// Handle on one rule file
#[derive(Debug)]
pub struct PolicyStore {
    path: PathBuf,
    state: RwLock<StoreState>,
}

impl PolicyStore {
    /// Open a handle on an existing, readable rule file
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|source| StoreError::Unavailable {
                path: path.clone(),
                source,
            })?;
        if !metadata.is_file() {
            return Err(StoreError::Unavailable {
                path,
                source: io::Error::new(io::ErrorKind::InvalidInput, "not a regular file"),
            });
        }

        let store = Self {
            path,
            state: RwLock::new(StoreState { open: true }),
        };
        // Fail at startup rather than on the first request
        let content = store.read_file().await?;

        info!(
            path = %store.path.display(),
            bytes = content.len(),
            "Rule store opened"
        );
        Ok(store)
    }

    /// Path of the backing rule file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Return the rule file contents verbatim
    pub async fn list(&self) -> Result<Vec<u8>> {
        let state = self.state.read().await;
        self.ensure_open(&state)?;
        self.read_file().await
    }

    /// Parse the `name = "body"` lines of the rule file.
    ///
    /// Lines that are not rule assignments (package header, imports,
    /// hand-written Rego) are skipped.
    pub async fn rules(&self) -> Result<Vec<PolicyRule>> {
        let content = self.list().await?;
        Ok(String::from_utf8_lossy(&content)
            .lines()
            .filter_map(rule::parse_line)
            .collect())
    }

    /// Append a rule to the end of the file.
    ///
    /// Nothing is written unless the whole new document is ready, so a
    /// failed append leaves the file as it was.
    pub async fn append(&self, rule: &PolicyRule) -> Result<()> {
        rule.validate()?;

        let state = self.state.write().await;
        self.ensure_open(&state)?;

        let mut content = self.read_file().await?;
        if rule::defines(&content, &rule.name) {
            return Err(StoreError::RuleExists {
                name: rule.name.clone(),
            });
        }
        content.extend_from_slice(rule.encode().as_bytes());

        self.write_file(&content).await?;
        drop(state);

        metrics::counter!("policygate_store_mutations_total", "op" => "append").increment(1);
        info!(rule = %rule.name, "Policy rule appended");
        Ok(())
    }

    /// Drop every line that contains `name` as a substring and return how
    /// many lines were dropped.
    ///
    /// Matching is by substring, not by rule name: removing
    /// `db` also removes a rule named `mongodb`, or any rule whose body
    /// mentions `db`.
    pub async fn remove(&self, name: &str) -> Result<usize> {
        // An empty needle matches every line
        if name.is_empty() {
            return Err(StoreError::MalformedRule {
                message: "rule name must not be empty".to_string(),
            });
        }

        let state = self.state.write().await;
        self.ensure_open(&state)?;

        let content = self.read_file().await?;
        let needle = name.as_bytes();

        let mut removed = 0;
        let kept: Vec<&[u8]> = content
            .split(|b| *b == b'\n')
            .filter(|line| {
                let matched = rule::contains(line, needle);
                if matched {
                    removed += 1;
                }
                !matched
            })
            .collect();
        let updated = kept.join(&b'\n');

        self.write_file(&updated).await?;
        drop(state);

        metrics::counter!("policygate_store_mutations_total", "op" => "remove").increment(1);
        if removed > 1 {
            warn!(pattern = %name, removed, "Removal matched more than one line");
        } else {
            info!(pattern = %name, removed, "Policy rule removed");
        }
        Ok(removed)
    }

    /// Close the store. Waits for in-flight mutations; later calls fail.
    pub async fn close(&self) {
        let mut state = self.state.write().await;
        if state.open {
            state.open = false;
            info!(path = %self.path.display(), "Rule store closed");
        }
    }

    fn ensure_open(&self, state: &StoreState) -> Result<()> {
        if state.open {
            Ok(())
        } else {
            Err(StoreError::Closed {
                path: self.path.clone(),
            })
        }
    }

    async fn read_file(&self) -> Result<Vec<u8>> {
        tokio::fs::read(&self.path)
            .await
            .map_err(|source| StoreError::Unavailable {
                path: self.path.clone(),
                source,
            })
    }

    async fn write_file(&self, content: &[u8]) -> Result<()> {
        debug!(path = %self.path.display(), bytes = content.len(), "Writing rule file");
        tokio::fs::write(&self.path, content)
            .await
            .map_err(|source| StoreError::Unavailable {
                path: self.path.clone(),
                source,
            })
    }
}
