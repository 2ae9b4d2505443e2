//! Certificate bundle ratio
//!
//! A [`CertificateBundle`] can only be obtained from
//! [`BundleRatio::assemble`], which checks the selection against the ratio.
//! Holding one therefore means the per-category counts are exactly right.

use std::collections::{BTreeMap, HashSet};

use serde::Serialize;

use crate::db::Category;
use crate::error::LedgerError;

/// Tokens required per category for one certificate
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BundleRatio {
    counts: BTreeMap<Category, u32>,
    total: u32,
}

impl BundleRatio {
    /// Build a ratio; categories with a zero count are dropped.
    pub fn new(counts: BTreeMap<Category, u32>) -> Result<Self, LedgerError> {
        let counts: BTreeMap<Category, u32> = counts.into_iter().filter(|(_, n)| *n > 0).collect();
        if counts.is_empty() {
            return Err(LedgerError::Config(
                "Certificate bundle must require at least one token".into(),
            ));
        }

        let total = counts
            .values()
            .try_fold(0u32, |acc, n| acc.checked_add(*n))
            .ok_or_else(|| LedgerError::Config("Certificate bundle total overflows".into()))?;

        Ok(Self { counts, total })
    }

    /// Tokens required for `category` (0 if the bundle does not use it)
    pub fn required(&self, category: Category) -> u32 {
        self.counts.get(&category).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u32 {
        self.total
    }

    /// Categories the bundle draws from, with their counts
    pub fn iter(&self) -> impl Iterator<Item = (Category, u32)> + '_ {
        self.counts.iter().map(|(c, n)| (*c, *n))
    }

    /// Check a selection against the ratio.
    ///
    /// Every category must contribute exactly its count, no other category may
    /// appear, and no token id may be listed twice.
    pub fn assemble(
        &self,
        selection: BTreeMap<Category, Vec<String>>,
    ) -> Result<CertificateBundle, LedgerError> {
        for (category, ids) in &selection {
            let required = self.required(*category) as usize;
            if ids.len() != required {
                return Err(LedgerError::Invariant(format!(
                    "Bundle needs {} {} tokens, selection has {}",
                    required,
                    category,
                    ids.len()
                )));
            }
        }
        for (category, required) in self.iter() {
            if !selection.contains_key(&category) {
                return Err(LedgerError::Invariant(format!(
                    "Bundle needs {} {} tokens, selection has none",
                    required, category
                )));
            }
        }

        let mut seen = HashSet::with_capacity(self.total as usize);
        for id in selection.values().flatten() {
            if !seen.insert(id.as_str()) {
                return Err(LedgerError::Invariant(format!("Token {} selected twice", id)));
            }
        }

        Ok(CertificateBundle { tokens: selection })
    }
}

impl Default for BundleRatio {
    /// 250 residue + 5 education + 1 product = 256
    fn default() -> Self {
        Self {
            counts: BTreeMap::from([
                (Category::Residue, 250),
                (Category::Education, 5),
                (Category::Product, 1),
            ]),
            total: 256,
        }
    }
}

/// Token ids of one certificate, per category, matching a [`BundleRatio`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CertificateBundle {
    tokens: BTreeMap<Category, Vec<String>>,
}

impl CertificateBundle {
    pub fn by_category(&self) -> &BTreeMap<Category, Vec<String>> {
        &self.tokens
    }

    /// All ids, category order then FIFO order
    pub fn token_ids(&self) -> Vec<String> {
        self.tokens.values().flatten().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.tokens.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
