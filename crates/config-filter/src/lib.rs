//! Selection and merging of filtered configuration fragments.
//!
//! A configuration file may scope blocks of settings to a service, a TLS
//! SNI name, or a local/remote network:
//!
//! ```text
//! service imap {
//!     local_name "mail.example.com *.example.org" { ... }
//!     remote 10.0.0.0/8 { ... }
//! }
//! ```
//!
//! Each block becomes a [`Fragment`] guarded by a [`Filter`]. Given the
//! concrete parameters of a connection, [`FilterSet::merged`] picks the
//! matching fragments, orders them most specific first, and merges their
//! settings: a more specific fragment always wins, and a generic fragment
//! that is not a superset of the one before it must not contradict settings
//! already made. Such a contradiction is reported as a [`Conflict`] instead
//! of being silently resolved.

mod filter;
mod merge;

pub use crate::{
    filter::{cmp_specificity, dns_match_wildcard, is_superset, Filter, NetMask},
    merge::{Conflict, FilterSet, Fragment},
};
