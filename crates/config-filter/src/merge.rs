use std::collections::BTreeMap;

use log::debug;

use crate::filter::{cmp_specificity, is_superset, Filter};

/// One parsed configuration fragment and the filter guarding it.
#[derive(Clone, Debug)]
pub struct Fragment {
    pub filter: Filter,
    pub settings: BTreeMap<String, String>,
    /// `file:line` the fragment came from, for conflict diagnostics.
    pub source: String,
}

/// A generic fragment contradicted a more specific setting it had no
/// authority over.
#[derive(Debug, Eq, PartialEq)]
pub struct Conflict {
    pub key: String,
    pub source: String,
}

impl std::fmt::Display for Conflict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "conflict in setting {} found from filter at {}",
            self.key, self.source
        )
    }
}

impl std::error::Error for Conflict {}

/// An ordered collection of configuration fragments.
#[derive(Debug, Default)]
pub struct FilterSet {
    fragments: Vec<Fragment>,
    errors: Vec<String>,
}

impl FilterSet {
    pub fn new(fragments: Vec<Fragment>) -> Self {
        Self {
            fragments,
            errors: Vec::new(),
        }
    }

    /// Fragments whose filter matches `conn`, most specific first.
    pub fn matching(&self, conn: &Filter) -> Vec<&Fragment> {
        let mut matched: Vec<&Fragment> = self
            .fragments
            .iter()
            .filter(|fragment| fragment.filter.matches(conn))
            .collect();
        matched.sort_by(|a, b| cmp_specificity(&a.filter, &b.filter));
        matched
    }

    /// All fragments, most generic first.
    pub fn by_generality(&self) -> Vec<&Fragment> {
        let mut all: Vec<&Fragment> = self.fragments.iter().collect();
        all.sort_by(|a, b| cmp_specificity(&b.filter, &a.filter));
        all
    }

    /// Merge the settings of every fragment matching `conn`.
    ///
    /// The most specific fragments are handled first, so a generic fragment
    /// trying to override an already-made setting fails, unless it is a
    /// superset of the fragment handled before it, in which case the more
    /// specific value simply wins.
    pub fn merged(&self, conn: &Filter) -> Result<BTreeMap<String, String>, Conflict> {
        let matched = self.matching(conn);
        let Some((first, rest)) = matched.split_first() else {
            return Ok(BTreeMap::new());
        };
        debug!("merging {} fragments, starting at {}", matched.len(), first.source);

        let mut settings = first.settings.clone();
        let mut prev = *first;
        for &fragment in rest {
            let check_conflicts = !is_superset(&fragment.filter, &prev.filter);
            apply_changes(&mut settings, fragment, check_conflicts)?;
            prev = fragment;
        }
        Ok(settings)
    }

    /// Record a non-fatal problem found while assembling the fragments.
    pub fn add_error(&mut self, error: impl Into<String>) {
        self.errors.push(error.into());
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }
}

/// Copy `src`'s settings into `dest`; existing keys win. With
/// `check_conflicts`, contradicting an existing key is an error.
fn apply_changes(
    dest: &mut BTreeMap<String, String>,
    src: &Fragment,
    check_conflicts: bool,
) -> Result<(), Conflict> {
    for (key, value) in &src.settings {
        match dest.get(key) {
            None => {
                dest.insert(key.clone(), value.clone());
            }
            Some(existing) if existing == value => {}
            Some(_) if !check_conflicts => {}
            Some(_) => {
                return Err(Conflict {
                    key: key.clone(),
                    source: src.source.clone(),
                });
            }
        }
    }
    Ok(())
}
