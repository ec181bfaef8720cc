//! sled-backed persistence for trades, offers, cards and profiles
//!
//! Every trade write is conditional on the version that was read before the
//! change was computed. A write against a stale read aborts with
//! `INVALID_TRANSITION` and the caller re-fetches; nothing is retried here.
use super::error::{Result, TradeError};
use super::offer::{Card, OfferDiff, OfferItem, offer_key, offer_prefix};
use super::trade::{Trade, TradeStatus};
use super::trust::UserProfile;
use sled::Transactional;
use sled::transaction::{ConflictableTransactionError, TransactionError};
use std::sync::Arc;

const TRADES: &str = "trades";
const SLUGS: &str = "slugs";
const OFFERS: &str = "offers";
const CARDS: &str = "cards";
const PROFILES: &str = "profiles";
const STATS: &str = "stats";
const REVIEWS: &str = "reviews";
const TRUST: &str = "trust";
const TRUST_JOBS: &str = "trust_jobs";

/// A trade together with every offer item attached to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TradeAggregate {
    pub trade: Trade,
    pub offers: Vec<OfferItem>,
}

impl TradeAggregate {
    pub fn offer_of(&self, user_id: &str) -> Vec<&str> {
        self.offers
            .iter()
            .filter(|item| item.user_id == user_id)
            .map(|item| item.card_id.as_str())
            .collect()
    }
}

pub struct Store {
    instance: Arc<sled::Db>,
    pub(crate) trades: sled::Tree,
    pub(crate) slugs: sled::Tree,
    pub(crate) offers: sled::Tree,
    pub(crate) cards: sled::Tree,
    pub(crate) profiles: sled::Tree,
    pub(crate) stats: sled::Tree,
    pub(crate) reviews: sled::Tree,
    pub(crate) trust: sled::Tree,
    pub(crate) trust_jobs: sled::Tree,
}

pub(crate) fn encode<T: minicbor::Encode<()>>(value: &T) -> Result<Vec<u8>> {
    Ok(minicbor::to_vec(value)?)
}

pub(crate) fn decode<T: for<'b> minicbor::Decode<'b, ()>>(bytes: &[u8]) -> Result<T> {
    Ok(minicbor::decode(bytes)?)
}

pub(crate) type TxResult<T = ()> = std::result::Result<T, ConflictableTransactionError<TradeError>>;

pub(crate) fn abort<T>(err: TradeError) -> TxResult<T> {
    Err(ConflictableTransactionError::Abort(err))
}

impl From<TransactionError<TradeError>> for TradeError {
    fn from(value: TransactionError<TradeError>) -> Self {
        match value {
            TransactionError::Abort(err) => err,
            TransactionError::Storage(err) => TradeError::Storage(err),
        }
    }
}

impl Store {
    pub fn open(instance: Arc<sled::Db>) -> Result<Self> {
        Ok(Self {
            trades: instance.open_tree(TRADES)?,
            slugs: instance.open_tree(SLUGS)?,
            offers: instance.open_tree(OFFERS)?,
            cards: instance.open_tree(CARDS)?,
            profiles: instance.open_tree(PROFILES)?,
            stats: instance.open_tree(STATS)?,
            reviews: instance.open_tree(REVIEWS)?,
            trust: instance.open_tree(TRUST)?,
            trust_jobs: instance.open_tree(TRUST_JOBS)?,
            instance,
        })
    }

    pub fn flush(&self) -> Result<()> {
        self.instance.flush()?;
        Ok(())
    }

    /// Insert a freshly created trade, its slug index and an optional first offer item.
    pub fn insert_trade(&self, trade: &Trade, initial_offer: Option<&OfferItem>) -> Result<()> {
        let trade_bytes = encode(trade)?;
        let offer = match initial_offer {
            Some(item) => Some((item.key(), encode(item)?)),
            None => None,
        };

        (&self.trades, &self.slugs, &self.offers).transaction(|(trades, slugs, offers)| -> TxResult {
            if trades.get(trade.id.as_bytes())?.is_some() {
                return abort(TradeError::Validation(format!(
                    "trade {} already exists",
                    trade.id
                )));
            }
            if slugs.get(trade.room_slug.as_bytes())?.is_some() {
                return abort(TradeError::Validation("room slug collision".into()));
            }
            trades.insert(trade.id.as_bytes(), trade_bytes.as_slice())?;
            slugs.insert(trade.room_slug.as_bytes(), trade.id.as_bytes())?;
            if let Some((key, bytes)) = &offer {
                offers.insert(key.as_bytes(), bytes.as_slice())?;
            }
            Ok(())
        })?;

        Ok(())
    }

    pub fn trade(&self, trade_id: &str) -> Result<Trade> {
        match self.trades.get(trade_id.as_bytes())? {
            Some(bytes) => decode(&bytes),
            None => Err(TradeError::not_found("trade", trade_id)),
        }
    }

    pub fn trade_by_slug(&self, room_slug: &str) -> Result<Trade> {
        match self.slugs.get(room_slug.as_bytes())? {
            Some(id) => self.trade(&String::from_utf8_lossy(&id)),
            None => Err(TradeError::not_found("room", room_slug)),
        }
    }

    pub fn offers(&self, trade_id: &str, user_id: Option<&str>) -> Result<Vec<OfferItem>> {
        let mut items = vec![];
        for bytes in self
            .offers
            .scan_prefix(offer_prefix(trade_id, user_id).as_bytes())
            .values()
        {
            let item: OfferItem = decode(&bytes?)?;
            // a prefix scan alone would also match longer ids sharing the prefix
            if item.trade_id == trade_id && user_id.is_none_or(|user| item.user_id == user) {
                items.push(item);
            }
        }
        Ok(items)
    }

    pub fn load_aggregate(&self, trade_id: &str) -> Result<TradeAggregate> {
        let trade = self.trade(trade_id)?;
        let offers = self.offers(trade_id, None)?;
        Ok(TradeAggregate { trade, offers })
    }

    /// Write `trade` only if the stored copy still carries `trade.version`.
    ///
    /// On success the in-memory trade is advanced to the stored version.
    pub fn save_trade(&self, trade: &mut Trade) -> Result<()> {
        let expected = trade.version;
        let mut next = trade.clone();
        next.version = expected + 1;
        let bytes = encode(&next)?;

        self.trades.transaction(|tx| -> TxResult {
            check_version(tx.get(next.id.as_bytes())?.as_deref(), &next.id, expected)?;
            tx.insert(next.id.as_bytes(), bytes.as_slice())?;
            Ok(())
        })?;

        *trade = next;
        Ok(())
    }

    /// Apply an offer diff for one participant and bump the trade version in
    /// the same transaction, so the other side never observes half an edit.
    pub fn replace_offer(&self, trade: &mut Trade, user_id: &str, diff: &OfferDiff) -> Result<()> {
        let expected = trade.version;
        let mut next = trade.clone();
        next.version = expected + 1;
        let trade_bytes = encode(&next)?;
        let added = diff
            .added
            .iter()
            .map(|card_id| {
                let item = OfferItem::new(&next.id, user_id, card_id);
                Ok((item.key(), encode(&item)?))
            })
            .collect::<Result<Vec<_>>>()?;
        let removed: Vec<String> = diff
            .removed
            .iter()
            .map(|card_id| offer_key(&next.id, user_id, card_id))
            .collect();

        (&self.trades, &self.offers).transaction(|(trades, offers)| -> TxResult {
            check_version(trades.get(next.id.as_bytes())?.as_deref(), &next.id, expected)?;
            for key in &removed {
                offers.remove(key.as_bytes())?;
            }
            for (key, bytes) in &added {
                offers.insert(key.as_bytes(), bytes.as_slice())?;
            }
            trades.insert(next.id.as_bytes(), trade_bytes.as_slice())?;
            Ok(())
        })?;

        *trade = next;
        Ok(())
    }

    pub fn put_card(&self, card: &Card) -> Result<()> {
        crate::trade::validate_card_id(&card.id)?;
        self.cards.insert(card.id.as_bytes(), encode(card)?)?;
        Ok(())
    }

    pub fn card(&self, card_id: &str) -> Result<Card> {
        match self.cards.get(card_id.as_bytes())? {
            Some(bytes) => decode(&bytes),
            None => Err(TradeError::not_found("card", card_id)),
        }
    }

    /// Ids from `card_ids` with no catalog entry, in input order.
    pub fn missing_cards<'a>(&self, card_ids: impl IntoIterator<Item = &'a str>) -> Result<Vec<String>> {
        let mut missing = vec![];
        for card_id in card_ids {
            if !self.cards.contains_key(card_id.as_bytes())? {
                missing.push(card_id.to_string());
            }
        }
        Ok(missing)
    }

    pub fn put_profile(&self, user_id: &str, profile: &UserProfile) -> Result<()> {
        self.profiles.insert(user_id.as_bytes(), encode(profile)?)?;
        Ok(())
    }

    /// Users without a stored profile have no verification signals.
    pub fn profile(&self, user_id: &str) -> Result<UserProfile> {
        match self.profiles.get(user_id.as_bytes())? {
            Some(bytes) => decode(&bytes),
            None => Ok(UserProfile::default()),
        }
    }
}

fn check_version(stored: Option<&[u8]>, trade_id: &str, expected: u64) -> TxResult {
    let Some(stored) = stored else {
        return abort(TradeError::not_found("trade", trade_id));
    };
    let stored: Trade = match decode(stored) {
        Ok(trade) => trade,
        Err(err) => return abort(err),
    };
    if stored.version != expected {
        return abort(stale(stored.status));
    }
    Ok(())
}

fn stale(current: TradeStatus) -> TradeError {
    TradeError::invalid(current, "trade changed concurrently; re-fetch and retry")
}
