//! Service layer API for trade room operations
//!
//! Every operation takes the trade as the caller last read it. Writes only land
//! if nobody else wrote the trade in between; otherwise the call fails with
//! `INVALID_TRANSITION` and may be repeated safely after a fresh read.
use super::clock::{Clock, SystemClock};
use super::config::MarketConfig;
use super::error::{Result, TradeError};
use super::jobs::{JobStatus, TrustJob};
use super::machine::{self, DeadlinePolicy, Outcome, Transition};
use super::matching::PartnerFilter;
use super::notify::{LogNotifier, MarketEvent, Notifier};
use super::offer::{Card, OfferDiff, OfferItem};
use super::stats::{Review, TradeOutcome, UserStats, validate_rating};
use super::storage::{Store, TradeAggregate};
use super::trade::{NewTrade, TimeStamp, Trade, TradeStatus, validate_card_id};
use super::trust::{TrustScore, UserProfile};
use super::utils;
use chrono::Utc;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct TradeService {
    store: Store,
    config: MarketConfig,
    policy: DeadlinePolicy,
    clock: Arc<dyn Clock>,
    notifier: Arc<dyn Notifier>,
}

impl TradeService {
    pub fn new(instance: Arc<sled::Db>) -> Result<Self> {
        Self::with_config(instance, MarketConfig::default())
    }

    pub fn with_config(instance: Arc<sled::Db>, config: MarketConfig) -> Result<Self> {
        Ok(Self {
            store: Store::open(instance)?,
            policy: config.deadline_policy(),
            config,
            clock: Arc::new(SystemClock),
            notifier: Arc::new(LogNotifier),
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn register_card(&self, card: &Card) -> Result<()> {
        self.store.put_card(card)
    }

    /// Replace a user's verification signals and refresh their trust score.
    pub fn upsert_profile(&self, user_id: &str, profile: &UserProfile) -> Result<()> {
        self.store.put_profile(user_id, profile)?;
        self.refresh_trust(&[user_id]);
        Ok(())
    }

    /// Open a new trade room in `draft`.
    pub fn create_trade(&self, new_trade: NewTrade) -> Result<Trade> {
        let now = self.clock.now();
        let initial_card = new_trade.initial_card_id().map(str::to_string);
        let initiator = new_trade.initiator().to_string();

        let id = utils::new_uuid_to_bech32("trade").map_err(internal)?;
        let slug = utils::new_room_slug().map_err(internal)?;
        let trade = new_trade.validate_and_finalise(id, slug, &now)?;

        let initial_offer = match initial_card {
            Some(card_id) => {
                if !self.store.missing_cards([card_id.as_str()])?.is_empty() {
                    return Err(TradeError::MissingCards(vec![card_id]));
                }
                Some(OfferItem::new(&trade.id, &initiator, &card_id))
            }
            None => None,
        };

        self.store.insert_trade(&trade, initial_offer.as_ref())?;
        info!(trade_id = %trade.id, room = %trade.room_slug, initiator = %initiator, "trade created");
        Ok(trade)
    }

    pub fn trade(&self, trade_id: &str) -> Result<Trade> {
        self.store.trade(trade_id)
    }

    pub fn trade_by_slug(&self, room_slug: &str) -> Result<Trade> {
        self.store.trade_by_slug(room_slug)
    }

    pub fn load_aggregate(&self, trade_id: &str) -> Result<TradeAggregate> {
        self.store.load_aggregate(trade_id)
    }

    /// Move `trade` toward `target` on behalf of `actor`.
    ///
    /// `deadline` overrides the default expiry of the state being entered
    /// (`proposed` or `agreed`) and is ignored otherwise.
    pub fn transition_trade(
        &self,
        trade: &Trade,
        target: TradeStatus,
        actor: &str,
        deadline: Option<TimeStamp<Utc>>,
    ) -> Result<Trade> {
        let Some(transition) = Transition::toward(target, deadline) else {
            return Err(TradeError::invalid(
                trade.status,
                format!("{target} cannot be requested by a participant"),
            ));
        };
        self.run_transition(trade, &transition, actor)
    }

    /// Same as [`TradeService::transition_trade`], reading the trade first.
    pub fn transition_by_id(
        &self,
        trade_id: &str,
        target: TradeStatus,
        actor: &str,
        deadline: Option<TimeStamp<Utc>>,
    ) -> Result<Trade> {
        let trade = self.store.trade(trade_id)?;
        self.transition_trade(&trade, target, actor, deadline)
    }

    /// Restore a canceled trade to the status it was canceled from.
    pub fn uncancel_trade(&self, trade: &Trade, actor: &str) -> Result<TradeStatus> {
        let trade = self.run_transition(trade, &Transition::Uncancel, actor)?;
        Ok(trade.status)
    }

    fn run_transition(&self, trade: &Trade, transition: &Transition, actor: &str) -> Result<Trade> {
        let now = self.clock.now();
        let mut next = trade.clone();

        match machine::apply(&mut next, transition, actor, &now, &self.policy)? {
            Outcome::Unchanged => {
                debug!(trade_id = %trade.id, %actor, transition = transition.name(), "no-op transition");
                Ok(next)
            }
            Outcome::Applied { from, to } => {
                self.store.save_trade(&mut next)?;
                info!(trade_id = %next.id, %actor, %from, %to, "trade transitioned");
                self.after_status_change(&next, from, to, Some(actor));
                Ok(next)
            }
            Outcome::Expired { from } => Err(self.record_expiry(next, from)),
        }
    }

    /// Persist an expiry sweep on a trade already marked canceled.
    fn record_expiry(&self, mut expired: Trade, from: TradeStatus) -> TradeError {
        if let Err(err) = self.store.save_trade(&mut expired) {
            return err;
        }
        warn!(trade_id = %expired.id, %from, "trade expired and was canceled");
        self.after_status_change(&expired, from, TradeStatus::Canceled, None);
        TradeError::Expired {
            trade_id: expired.id,
            status: from,
        }
    }

    /// Side effects of a persisted status change. Failures are logged and
    /// swallowed; the trade record stays as written.
    fn after_status_change(
        &self,
        trade: &Trade,
        from: TradeStatus,
        to: TradeStatus,
        actor: Option<&str>,
    ) {
        let participants = trade.participants();
        if let Some(outcome) = TradeOutcome::for_transition(from, to) {
            match self.store.record_outcome(&participants, outcome) {
                Ok(()) => self.refresh_trust(&participants),
                Err(err) => {
                    warn!(trade_id = %trade.id, ?outcome, error = %err, "failed to record trade outcome")
                }
            }
        }

        self.publish(MarketEvent::TradeStateChanged {
            trade_id: trade.id.clone(),
            room_slug: trade.room_slug.clone(),
            from,
            to,
            actor: actor.map(str::to_string),
        });
    }

    fn publish(&self, event: MarketEvent) {
        if let Err(err) = self.notifier.notify(&event) {
            warn!(?event, error = %err, "notification dispatch failed");
        }
    }

    /// Seat `user_id` as the second party of an open trade.
    pub fn set_responder(&self, trade: &Trade, user_id: &str) -> Result<Trade> {
        let now = self.clock.now();
        let mut next = trade.clone();

        if machine::set_responder(&mut next, user_id, &now)? {
            self.store.save_trade(&mut next)?;
            info!(trade_id = %next.id, responder = %user_id, "responder joined");
        }
        Ok(next)
    }

    /// Replace `actor`'s whole offer with `card_ids`.
    ///
    /// Duplicate ids collapse. Every unknown card is reported at once and
    /// nothing is written unless the whole replacement applies.
    pub fn update_offer(&self, trade: &Trade, actor: &str, card_ids: &[&str]) -> Result<TradeAggregate> {
        let now = self.clock.now();
        let mut next = trade.clone();

        if !next.is_participant(actor) {
            return Err(TradeError::unauthorized(&next.id, actor));
        }
        if next.is_expired(&now) {
            let from = next.status;
            machine::expire(&mut next, &now);
            return Err(self.record_expiry(next, from));
        }
        if !next.status.is_editable() {
            return Err(TradeError::invalid(next.status, "offers are frozen"));
        }

        let target: BTreeSet<&str> = card_ids.iter().copied().collect();
        for card_id in &target {
            validate_card_id(card_id)?;
        }
        let missing = self.store.missing_cards(target.iter().copied())?;
        if !missing.is_empty() {
            return Err(TradeError::MissingCards(missing));
        }

        let current = self.store.offers(&next.id, Some(actor))?;
        let diff = OfferDiff::between(
            current.iter().map(|item| item.card_id.as_str()),
            target.iter().copied(),
        );
        if diff.is_empty() {
            debug!(trade_id = %next.id, %actor, "offer unchanged");
            return self.store.load_aggregate(&next.id);
        }

        next.updated_at = now;
        self.store.replace_offer(&mut next, actor, &diff)?;
        info!(
            trade_id = %next.id,
            %actor,
            added = diff.added.len(),
            removed = diff.removed.len(),
            "offer updated"
        );

        let offers = self.store.offers(&next.id, None)?;
        Ok(TradeAggregate {
            trade: next,
            offers,
        })
    }

    /// Raise a complaint on an agreed trade, blocking completion until cleared.
    pub fn flag_dispute(&self, trade: &Trade, actor: &str, reason: &str) -> Result<Trade> {
        let now = self.clock.now();
        let mut next = trade.clone();

        machine::flag_dispute(&mut next, actor, reason, &now)?;
        self.store.save_trade(&mut next)?;
        info!(trade_id = %next.id, %actor, "dispute flagged");
        Ok(next)
    }

    pub fn clear_dispute(&self, trade: &Trade, actor: &str) -> Result<Trade> {
        let now = self.clock.now();
        let mut next = trade.clone();

        if machine::clear_dispute(&mut next, actor, &now)? {
            self.store.save_trade(&mut next)?;
            info!(trade_id = %next.id, %actor, "dispute cleared");
        }
        Ok(next)
    }

    /// Moderation escalation of an agreed trade into `disputed`.
    pub fn mark_disputed(&self, trade: &Trade, moderator_note: &str) -> Result<Trade> {
        let now = self.clock.now();
        let mut next = trade.clone();

        if let Outcome::Applied { from, to } = machine::mark_disputed(&mut next, &now)? {
            self.store.save_trade(&mut next)?;
            info!(trade_id = %next.id, note = %moderator_note, "trade escalated to dispute");
            self.after_status_change(&next, from, to, None);
        }
        Ok(next)
    }

    /// Rate the counterparty of a completed trade. One review per reviewer.
    pub fn submit_review(
        &self,
        trade_id: &str,
        reviewer: &str,
        rating: u8,
        comment: Option<&str>,
    ) -> Result<Review> {
        let trade = self.store.trade(trade_id)?;

        let Some(reviewee) = trade.counterparty_of(reviewer) else {
            return Err(TradeError::unauthorized(trade_id, reviewer));
        };
        if trade.status != TradeStatus::Completed {
            return Err(TradeError::invalid(
                trade.status,
                "only completed trades can be reviewed",
            ));
        }
        validate_rating(rating)?;

        let review = Review {
            trade_id: trade.id.clone(),
            reviewer_user_id: reviewer.to_string(),
            reviewee_user_id: reviewee.to_string(),
            rating,
            comment: comment.map(str::to_string),
            created_at: self.clock.now(),
        };
        let stats = self.store.insert_review(&review)?;
        info!(
            trade_id = %review.trade_id,
            reviewee = %review.reviewee_user_id,
            rating,
            avg_rating = stats.avg_rating,
            "review recorded"
        );

        self.refresh_trust(&[reviewee]);
        self.publish(MarketEvent::ReviewReceived {
            trade_id: review.trade_id.clone(),
            reviewee_user_id: review.reviewee_user_id.clone(),
            rating,
        });
        Ok(review)
    }

    pub fn user_stats(&self, user_id: &str) -> Result<UserStats> {
        self.store.user_stats(user_id)
    }

    pub fn trust_score(&self, user_id: &str) -> Result<Option<TrustScore>> {
        self.store.trust_score(user_id)
    }

    pub fn recompute_trust_score(&self, user_id: &str) -> Result<TrustScore> {
        self.store.recompute_trust_score(user_id, &self.clock.now())
    }

    pub fn trust_job(&self, user_id: &str) -> Result<Option<TrustJob>> {
        self.store.trust_job(user_id)
    }

    pub fn enqueue_trust_job(&self, user_id: &str) -> Result<TrustJob> {
        self.store.enqueue_trust_job(user_id, &self.clock.now())
    }

    /// Run up to `limit` queued trust jobs. Returns how many succeeded.
    pub fn process_trust_jobs(&self, limit: usize) -> Result<usize> {
        let mut succeeded = 0;
        for user_id in self.store.queued_trust_jobs(limit)? {
            if let Some(job) = self.run_trust_job(&user_id)? {
                if job.last_error.is_none() {
                    succeeded += 1;
                }
            }
        }
        Ok(succeeded)
    }

    fn run_trust_job(&self, user_id: &str) -> Result<Option<TrustJob>> {
        if self.store.claim_trust_job(user_id, &self.clock.now())?.is_none() {
            return Ok(None);
        }
        let outcome = self.recompute_for_job(user_id);
        self.settle_trust_job(user_id, outcome).map(Some)
    }

    fn recompute_for_job(&self, user_id: &str) -> std::result::Result<(), String> {
        self.store
            .recompute_trust_score(user_id, &self.clock.now())
            .map(|score| {
                debug!(%user_id, score = score.trust_score, grade = %score.trust_grade, "trust score recomputed");
            })
            .map_err(|err| err.to_string())
    }

    /// Finish a claimed job. Enqueues that landed while it ran send it
    /// straight back through recomputation, so the stored score is never left
    /// behind the stats it was asked to reflect.
    fn settle_trust_job(
        &self,
        user_id: &str,
        mut outcome: std::result::Result<(), String>,
    ) -> Result<TrustJob> {
        loop {
            let now = self.clock.now();
            let job = self.store.finish_trust_job(
                user_id,
                outcome,
                self.config.trust_job_max_attempts,
                &now,
            )?;
            if let Some(error) = &job.last_error {
                warn!(%user_id, attempts = job.attempts, %error, "trust recomputation failed");
                return Ok(job);
            }
            if job.status != JobStatus::Queued
                || self.store.claim_trust_job(user_id, &now)?.is_none()
            {
                return Ok(job);
            }
            debug!(%user_id, "trust inputs changed during recomputation, running again");
            outcome = self.recompute_for_job(user_id);
        }
    }

    /// Queue trust recomputation for `user_ids` and, when configured, run it now.
    fn refresh_trust(&self, user_ids: &[&str]) {
        for user_id in user_ids {
            if let Err(err) = self.store.enqueue_trust_job(user_id, &self.clock.now()) {
                warn!(%user_id, error = %err, "failed to queue trust recomputation");
                continue;
            }
            if self.config.reactive_trust_recompute {
                if let Err(err) = self.run_trust_job(user_id) {
                    warn!(%user_id, error = %err, "trust recomputation job errored");
                }
            }
        }
    }

    pub fn find_partners(&self, filter: &PartnerFilter) -> Result<Vec<TrustScore>> {
        self.store.find_partners(filter)
    }
}

fn internal(err: anyhow::Error) -> TradeError {
    TradeError::Internal(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn service() -> (tempfile::TempDir, TradeService) {
        let dir = tempdir().unwrap();
        let db = sled::open(dir.path().join("service.db")).unwrap();
        (dir, TradeService::new(Arc::new(db)).unwrap())
    }

    #[test]
    fn completion_during_a_running_job_is_not_lost() {
        let (_dir, service) = service();
        let trade = service
            .create_trade(NewTrade::new("user_a").set_responder("user_b"))
            .unwrap();
        let trade = service
            .transition_trade(&trade, TradeStatus::Proposed, "user_a", None)
            .unwrap();
        let trade = service
            .transition_trade(&trade, TradeStatus::Agreed, "user_b", None)
            .unwrap();

        // a worker claims user_b and reads the stats before the trade completes
        let now = service.clock.now();
        service.store.enqueue_trust_job("user_b", &now).unwrap();
        service.store.claim_trust_job("user_b", &now).unwrap().unwrap();
        let outcome = service.recompute_for_job("user_b");
        assert_eq!(service.trust_score("user_b").unwrap().unwrap().components.behavior, 0);

        service
            .transition_trade(&trade, TradeStatus::Completed, "user_a", None)
            .unwrap();
        assert!(service.trust_job("user_b").unwrap().unwrap().rerun);

        let job = service.settle_trust_job("user_b", outcome).unwrap();

        assert_eq!(job.status, JobStatus::Succeeded);
        let score = service.trust_score("user_b").unwrap().unwrap();
        assert_eq!(score.components.behavior, 41);
    }

    #[test]
    fn id_generation_failures_are_internal() {
        let err = internal(anyhow::anyhow!("invalid hrp"));
        assert!(matches!(err, TradeError::Internal(_)));
        assert_eq!(err.http_status(), 500);
    }
}
