use std::collections::BTreeSet;

use crate::Deal;

/// What the user is currently filtering the deal list by.
///
/// `stores` is a set, so two criteria built from the same stores in a different
/// order compare equal. Equality is by content and drives cache resets.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct FilterCriteria {
    pub search: String,
    pub has_coupon: Option<bool>,
    pub stores: BTreeSet<String>,
}

impl FilterCriteria {
    pub fn with_search(mut self, search: impl Into<String>) -> Self {
        self.search = search.into();
        self
    }

    pub fn with_has_coupon(mut self, has_coupon: Option<bool>) -> Self {
        self.has_coupon = has_coupon;
        self
    }

    pub fn with_stores<S: Into<String>>(mut self, stores: impl IntoIterator<Item = S>) -> Self {
        self.stores = stores.into_iter().map(Into::into).collect();
        self
    }

    /// True when no clause would reject anything.
    pub fn is_unfiltered(&self) -> bool {
        self.search.is_empty() && self.has_coupon.is_none() && self.stores.is_empty()
    }
}

/// Does `deal` pass every clause of `criteria`?
pub fn matches(deal: &Deal, criteria: &FilterCriteria) -> bool {
    let search_ok = criteria.search.is_empty() || {
        let needle = criteria.search.to_lowercase();
        searchable_text(deal).to_lowercase().contains(&needle)
    };

    let coupon_ok = match criteria.has_coupon {
        None => true,
        Some(wanted) => wanted == deal.has_coupons(),
    };

    // Deals without a store, or with an empty one, are never rejected by the store clause.
    let store_ok = criteria.stores.is_empty()
        || deal
            .store
            .as_ref()
            .filter(|store| !store.is_empty())
            .is_none_or(|store| criteria.stores.contains(store));

    search_ok && coupon_ok && store_ok
}

fn searchable_text(deal: &Deal) -> String {
    [
        deal.product.as_deref(),
        deal.description.as_deref(),
        Some(deal.text.as_str()),
        deal.store.as_deref(),
    ]
    .into_iter()
    .flatten()
    .filter(|field| !field.is_empty())
    .collect::<Vec<_>>()
    .join(" ")
}
