//! Offer items and set-replacement diffs
use std::collections::BTreeSet;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Card {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub name: String,
    #[n(2)]
    pub set_code: Option<String>,
}

impl Card {
    pub fn new(id: &str, name: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            set_code: None,
        }
    }
}

/// One card offered by one participant within one trade.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct OfferItem {
    #[n(0)]
    pub trade_id: String,
    #[n(1)]
    pub user_id: String,
    #[n(2)]
    pub card_id: String,
}

impl OfferItem {
    pub fn new(trade_id: &str, user_id: &str, card_id: &str) -> Self {
        Self {
            trade_id: trade_id.to_string(),
            user_id: user_id.to_string(),
            card_id: card_id.to_string(),
        }
    }

    // (trade, user, card) is unique, so it doubles as the storage key
    pub fn key(&self) -> String {
        offer_key(&self.trade_id, &self.user_id, &self.card_id)
    }
}

pub(crate) fn offer_key(trade_id: &str, user_id: &str, card_id: &str) -> String {
    format!("{trade_id}/{user_id}/{card_id}")
}

pub(crate) fn offer_prefix(trade_id: &str, user_id: Option<&str>) -> String {
    match user_id {
        Some(user_id) => format!("{trade_id}/{user_id}/"),
        None => format!("{trade_id}/"),
    }
}

/// Changes needed to turn one participant's current offer into the target set.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct OfferDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

impl OfferDiff {
    pub fn between<'a>(
        current: impl IntoIterator<Item = &'a str>,
        target: impl IntoIterator<Item = &'a str>,
    ) -> Self {
        let current: BTreeSet<&str> = current.into_iter().collect();
        let target: BTreeSet<&str> = target.into_iter().collect();

        Self {
            added: target.difference(&current).map(|c| c.to_string()).collect(),
            removed: current.difference(&target).map(|c| c.to_string()).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diff_is_a_set_replacement() {
        let diff = OfferDiff::between(["c1", "c2", "c3"], ["c3", "c4", "c4"]);

        assert_eq!(diff.added, vec!["c4".to_string()]);
        assert_eq!(diff.removed, vec!["c1".to_string(), "c2".to_string()]);
    }

    #[test]
    fn same_set_yields_empty_diff() {
        let diff = OfferDiff::between(["c2", "c1"], ["c1", "c2"]);
        assert!(diff.is_empty());
    }

    #[test]
    fn keys_scope_to_participant() {
        let item = OfferItem::new("trade1", "user_a", "c1");

        assert!(item.key().starts_with(&offer_prefix("trade1", Some("user_a"))));
        assert!(item.key().starts_with(&offer_prefix("trade1", None)));
        assert!(!item.key().starts_with(&offer_prefix("trade1", Some("user_b"))));
    }
}
