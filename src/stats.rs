//! Per-user trade counters and review averages
use super::error::{Result, TradeError};
use super::storage::{Store, TxResult, abort, decode, encode};
use super::trade::{TimeStamp, TradeStatus};
use chrono::Utc;
use sled::Transactional;

pub const MIN_RATING: u8 = 1;
pub const MAX_RATING: u8 = 5;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Default, PartialEq)]
pub struct UserStats {
    #[n(0)]
    pub completed_count: u64,
    #[n(1)]
    pub canceled_count: u64,
    #[n(2)]
    pub disputed_count: u64,
    #[n(3)]
    pub review_count: u64,
    #[n(4)]
    pub avg_rating: f64,
}

/// Terminal outcome counted against both participants of a trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradeOutcome {
    Completed,
    Canceled,
    Disputed,
}

impl TradeOutcome {
    /// Outcome to record for a status change, if it counts at all.
    ///
    /// Cancellation only counts once the parties had agreed; walking away from
    /// a draft or an open proposal is not held against anyone.
    pub fn for_transition(from: TradeStatus, to: TradeStatus) -> Option<Self> {
        match (from, to) {
            (_, TradeStatus::Completed) => Some(TradeOutcome::Completed),
            (_, TradeStatus::Disputed) => Some(TradeOutcome::Disputed),
            (TradeStatus::Agreed, TradeStatus::Canceled) => Some(TradeOutcome::Canceled),
            _ => None,
        }
    }
}

impl UserStats {
    /// Trades that reached an outcome counted here.
    pub fn finished_count(&self) -> u64 {
        self.completed_count + self.canceled_count + self.disputed_count
    }

    pub fn record_outcome(&mut self, outcome: TradeOutcome) {
        match outcome {
            TradeOutcome::Completed => self.completed_count += 1,
            TradeOutcome::Canceled => self.canceled_count += 1,
            TradeOutcome::Disputed => self.disputed_count += 1,
        }
    }

    /// Incremental mean, O(1) per review.
    pub fn fold_rating(&mut self, rating: u8) {
        self.review_count += 1;
        self.avg_rating += (rating as f64 - self.avg_rating) / self.review_count as f64;
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Review {
    #[n(0)]
    pub trade_id: String,
    #[n(1)]
    pub reviewer_user_id: String,
    #[n(2)]
    pub reviewee_user_id: String,
    #[n(3)]
    pub rating: u8,
    #[n(4)]
    pub comment: Option<String>,
    #[n(5)]
    pub created_at: TimeStamp<Utc>,
}

impl Review {
    // one review per reviewer per trade
    pub fn key(&self) -> String {
        review_key(&self.trade_id, &self.reviewer_user_id)
    }
}

pub(crate) fn review_key(trade_id: &str, reviewer: &str) -> String {
    format!("{trade_id}/{reviewer}")
}

pub fn validate_rating(rating: u8) -> Result<()> {
    if !(MIN_RATING..=MAX_RATING).contains(&rating) {
        return Err(TradeError::Validation(format!(
            "rating must be between {MIN_RATING} and {MAX_RATING}, got {rating}"
        )));
    }
    Ok(())
}

impl Store {
    pub fn user_stats(&self, user_id: &str) -> Result<UserStats> {
        match self.stats.get(user_id.as_bytes())? {
            Some(bytes) => decode(&bytes),
            None => Ok(UserStats::default()),
        }
    }

    /// Count `outcome` against every user in one transaction. The counters are
    /// read and rewritten inside the storage transaction, so concurrent
    /// completions never lose an increment.
    pub fn record_outcome(&self, user_ids: &[&str], outcome: TradeOutcome) -> Result<()> {
        self.stats.transaction(|tx| -> TxResult {
            for user_id in user_ids {
                let mut stats = match tx.get(user_id.as_bytes())? {
                    Some(bytes) => decode::<UserStats>(&bytes).or_else(abort)?,
                    None => UserStats::default(),
                };
                stats.record_outcome(outcome);
                tx.insert(user_id.as_bytes(), encode(&stats).or_else(abort)?)?;
            }
            Ok(())
        })?;
        Ok(())
    }

    /// Store a review and fold its rating into the reviewee's running mean.
    pub fn insert_review(&self, review: &Review) -> Result<UserStats> {
        validate_rating(review.rating)?;
        let key = review.key();
        let review_bytes = encode(review)?;

        let stats = (&self.reviews, &self.stats).transaction(|(reviews, stats)| -> TxResult<UserStats> {
            if reviews.get(key.as_bytes())?.is_some() {
                return abort(TradeError::Validation(format!(
                    "{} already reviewed trade {}",
                    review.reviewer_user_id, review.trade_id
                )));
            }
            let reviewee = review.reviewee_user_id.as_bytes();
            let mut current = match stats.get(reviewee)? {
                Some(bytes) => decode::<UserStats>(&bytes).or_else(abort)?,
                None => UserStats::default(),
            };
            current.fold_rating(review.rating);
            reviews.insert(key.as_bytes(), review_bytes.as_slice())?;
            stats.insert(reviewee, encode(&current).or_else(abort)?)?;
            Ok(current)
        })?;

        Ok(stats)
    }

    pub fn review(&self, trade_id: &str, reviewer: &str) -> Result<Option<Review>> {
        match self.reviews.get(review_key(trade_id, reviewer).as_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }
}
