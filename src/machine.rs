//! Trade lifecycle rules
//!
//! Everything here is pure: a transition takes the trade as it was read, the
//! acting user and the current time, and mutates the trade in place. Persisting
//! the result (and rejecting stale reads) is the repository's job.
use super::error::{Result, TradeError};
use super::trade::{DisputeMarker, TimeStamp, Trade, TradeStatus, validate_user_id};
use chrono::Utc;

/// A participant-driven lifecycle step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Propose {
        proposed_expired_at: Option<TimeStamp<Utc>>,
    },
    Agree {
        agreed_expired_at: Option<TimeStamp<Utc>>,
    },
    Complete,
    Cancel,
    Uncancel,
}

impl Transition {
    /// Transition requested by target status. `draft` and `disputed` have no
    /// participant-driven edge into them; uncancel is requested separately.
    pub fn toward(target: TradeStatus, deadline: Option<TimeStamp<Utc>>) -> Option<Self> {
        match target {
            TradeStatus::Proposed => Some(Transition::Propose {
                proposed_expired_at: deadline,
            }),
            TradeStatus::Agreed => Some(Transition::Agree {
                agreed_expired_at: deadline,
            }),
            TradeStatus::Completed => Some(Transition::Complete),
            TradeStatus::Canceled => Some(Transition::Cancel),
            TradeStatus::Draft | TradeStatus::Disputed => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Transition::Propose { .. } => "propose",
            Transition::Agree { .. } => "agree",
            Transition::Complete => "complete",
            Transition::Cancel => "cancel",
            Transition::Uncancel => "uncancel",
        }
    }
}

/// Default deadlines applied when a transition payload carries none.
#[derive(Debug, Clone, Default)]
pub struct DeadlinePolicy {
    pub proposal_ttl_hours: Option<i64>,
    pub agreement_ttl_hours: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Applied { from: TradeStatus, to: TradeStatus },
    /// Accepted without effect (cancel on an already canceled trade).
    Unchanged,
    /// The trade sat past its deadline and has been marked canceled instead.
    Expired { from: TradeStatus },
}

/// Every status directly reachable from `from`, moderation edges included.
pub fn reachable_from(from: TradeStatus) -> &'static [TradeStatus] {
    use TradeStatus::*;
    match from {
        Draft => &[Proposed, Canceled],
        Proposed => &[Agreed, Canceled],
        Agreed => &[Completed, Canceled, Disputed],
        Canceled => &[Draft, Proposed, Agreed],
        Completed | Disputed => &[],
    }
}

pub fn is_edge(from: TradeStatus, to: TradeStatus) -> bool {
    reachable_from(from).contains(&to)
}

/// Validate `transition` for `actor` and apply it to `trade`.
pub fn apply(
    trade: &mut Trade,
    transition: &Transition,
    actor: &str,
    now: &TimeStamp<Utc>,
    policy: &DeadlinePolicy,
) -> Result<Outcome> {
    authorize(trade, transition, actor)?;

    if trade.is_expired(now) {
        let from = trade.status;
        expire(trade, now);
        return Ok(Outcome::Expired { from });
    }

    let from = trade.status;
    let to = match (from, transition) {
        (TradeStatus::Draft, Transition::Propose { proposed_expired_at }) => {
            if trade.responder_user_id.is_none() {
                return Err(TradeError::invalid(from, "no responder has joined the trade"));
            }
            let requested = proposed_expired_at
                .clone()
                .or_else(|| trade.proposed_expired_at.clone());
            let deadline = match requested {
                Some(deadline) => Some(deadline),
                None => ttl_deadline(policy.proposal_ttl_hours, now)?,
            };
            trade.proposed_expired_at = future_deadline(deadline, now)?;
            TradeStatus::Proposed
        }
        (TradeStatus::Proposed, Transition::Agree { agreed_expired_at }) => {
            if trade.responder_user_id.is_none() && actor == trade.initiator_user_id {
                return Err(TradeError::invalid(from, "no responder to agree with"));
            }
            if trade.responder_user_id.is_none() {
                validate_user_id(actor)?;
            }
            let deadline = match agreed_expired_at {
                Some(deadline) => Some(deadline.clone()),
                None => ttl_deadline(policy.agreement_ttl_hours, now)?,
            };
            trade.agreed_expired_at = future_deadline(deadline, now)?;
            if trade.responder_user_id.is_none() {
                trade.responder_user_id = Some(actor.to_string());
            }
            TradeStatus::Agreed
        }
        (TradeStatus::Agreed, Transition::Complete) => {
            if let Some(dispute) = &trade.dispute {
                return Err(TradeError::invalid(
                    from,
                    format!("dispute raised by {} is unresolved", dispute.raised_by),
                ));
            }
            TradeStatus::Completed
        }
        (TradeStatus::Draft | TradeStatus::Proposed | TradeStatus::Agreed, Transition::Cancel) => {
            trade.previous_status = Some(from);
            TradeStatus::Canceled
        }
        (TradeStatus::Canceled, Transition::Cancel) => return Ok(Outcome::Unchanged),
        (TradeStatus::Canceled, Transition::Uncancel) => {
            let Some(target) = trade.previous_status else {
                return Err(TradeError::invalid(from, "no prior status to restore"));
            };
            if trade.deadline_for(target).is_some_and(|deadline| now > deadline) {
                return Err(TradeError::Expired {
                    trade_id: trade.id.clone(),
                    status: target,
                });
            }
            trade.previous_status = None;
            target
        }
        (from, transition) => {
            return Err(TradeError::invalid(
                from,
                format!("{} is not allowed", transition.name()),
            ));
        }
    };

    trade.status = to;
    trade.updated_at = now.clone();
    Ok(Outcome::Applied { from, to })
}

fn authorize(trade: &Trade, transition: &Transition, actor: &str) -> Result<()> {
    if trade.is_participant(actor) {
        return Ok(());
    }
    // the first agree on an open room seats the caller as responder
    let joins_as_responder = matches!(transition, Transition::Agree { .. })
        && trade.responder_user_id.is_none()
        && !actor.is_empty();
    if joins_as_responder {
        return Ok(());
    }
    Err(TradeError::unauthorized(&trade.id, actor))
}

fn future_deadline(
    deadline: Option<TimeStamp<Utc>>,
    now: &TimeStamp<Utc>,
) -> Result<Option<TimeStamp<Utc>>> {
    match deadline {
        Some(deadline) if &deadline <= now => Err(TradeError::Validation(
            "deadline is already in the past".into(),
        )),
        Some(deadline) if !deadline.is_storable() => Err(TradeError::Validation(
            "deadline is too far in the future".into(),
        )),
        deadline => Ok(deadline),
    }
}

fn ttl_deadline(hours: Option<i64>, now: &TimeStamp<Utc>) -> Result<Option<TimeStamp<Utc>>> {
    let Some(hours) = hours else {
        return Ok(None);
    };
    match now.checked_plus_hours(hours) {
        Some(deadline) => Ok(Some(deadline)),
        None => Err(TradeError::Validation(format!(
            "deadline ttl of {hours} hours is out of range"
        ))),
    }
}

/// Mark a trade that sat past its deadline as canceled.
pub fn expire(trade: &mut Trade, now: &TimeStamp<Utc>) {
    trade.previous_status = Some(trade.status);
    trade.status = TradeStatus::Canceled;
    trade.updated_at = now.clone();
}

/// Seat `user_id` as responder on an open trade.
///
/// Returns false when the user already holds the seat.
pub fn set_responder(trade: &mut Trade, user_id: &str, now: &TimeStamp<Utc>) -> Result<bool> {
    validate_user_id(user_id)?;
    if user_id == trade.initiator_user_id {
        return Err(TradeError::Validation(
            "responder must differ from initiator".into(),
        ));
    }
    match trade.responder_user_id.as_deref() {
        Some(current) if current == user_id => return Ok(false),
        Some(_) => {
            return Err(TradeError::invalid(
                trade.status,
                "a responder has already joined",
            ));
        }
        None => {}
    }
    if !trade.status.is_editable() {
        return Err(TradeError::invalid(trade.status, "trade is no longer open"));
    }
    trade.responder_user_id = Some(user_id.to_string());
    trade.updated_at = now.clone();
    Ok(true)
}

pub fn flag_dispute(
    trade: &mut Trade,
    actor: &str,
    reason: &str,
    now: &TimeStamp<Utc>,
) -> Result<()> {
    if !trade.is_participant(actor) {
        return Err(TradeError::unauthorized(&trade.id, actor));
    }
    if trade.status != TradeStatus::Agreed {
        return Err(TradeError::invalid(
            trade.status,
            "disputes can only be raised on agreed trades",
        ));
    }
    if reason.trim().is_empty() {
        return Err(TradeError::Validation("dispute reason is required".into()));
    }
    trade.dispute = Some(DisputeMarker {
        raised_by: actor.to_string(),
        reason: reason.to_string(),
        raised_at: now.clone(),
    });
    trade.updated_at = now.clone();
    Ok(())
}

/// Withdraw an open dispute. Only the participant who raised it may do so.
pub fn clear_dispute(trade: &mut Trade, actor: &str, now: &TimeStamp<Utc>) -> Result<bool> {
    if !trade.is_participant(actor) {
        return Err(TradeError::unauthorized(&trade.id, actor));
    }
    match &trade.dispute {
        None => Ok(false),
        Some(dispute) if dispute.raised_by != actor => {
            Err(TradeError::unauthorized(&trade.id, actor))
        }
        Some(_) => {
            trade.dispute = None;
            trade.updated_at = now.clone();
            Ok(true)
        }
    }
}

/// Moderation edge into `disputed`. Not reachable by participants.
pub fn mark_disputed(trade: &mut Trade, now: &TimeStamp<Utc>) -> Result<Outcome> {
    if trade.status != TradeStatus::Agreed {
        return Err(TradeError::invalid(
            trade.status,
            "only agreed trades can be escalated to a dispute",
        ));
    }
    trade.status = TradeStatus::Disputed;
    trade.updated_at = now.clone();
    Ok(Outcome::Applied {
        from: TradeStatus::Agreed,
        to: TradeStatus::Disputed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trade::NewTrade;

    const A: &str = "user_a";
    const B: &str = "user_b";
    const C: &str = "user_c";

    fn policy() -> DeadlinePolicy {
        DeadlinePolicy {
            proposal_ttl_hours: Some(72),
            agreement_ttl_hours: Some(168),
        }
    }

    fn trade_with(responder: Option<&str>, now: &TimeStamp<Utc>) -> Trade {
        let mut new_trade = NewTrade::new(A);
        if let Some(responder) = responder {
            new_trade = new_trade.set_responder(responder);
        }
        new_trade
            .validate_and_finalise("trade1".into(), "room1".into(), now)
            .unwrap()
    }

    fn propose() -> Transition {
        Transition::Propose {
            proposed_expired_at: None,
        }
    }

    fn agree() -> Transition {
        Transition::Agree {
            agreed_expired_at: None,
        }
    }

    #[test]
    fn happy_path_reaches_completed() {
        let now = TimeStamp::new();
        let mut trade = trade_with(Some(B), &now);

        assert_eq!(
            apply(&mut trade, &propose(), B, &now, &policy()).unwrap(),
            Outcome::Applied {
                from: TradeStatus::Draft,
                to: TradeStatus::Proposed
            }
        );
        assert_eq!(trade.proposed_expired_at, Some(now.plus_hours(72)));
        apply(&mut trade, &agree(), A, &now, &policy()).unwrap();
        assert_eq!(trade.agreed_expired_at, Some(now.plus_hours(168)));
        apply(&mut trade, &Transition::Complete, B, &now, &policy()).unwrap();

        assert_eq!(trade.status, TradeStatus::Completed);
    }

    #[test]
    fn outsider_cannot_propose() {
        let now = TimeStamp::new();
        let mut trade = trade_with(None, &now);

        let err = apply(&mut trade, &propose(), B, &now, &policy()).unwrap_err();
        assert!(matches!(err, TradeError::Unauthorized { .. }));
        assert_eq!(trade.status, TradeStatus::Draft);
    }

    #[test]
    fn propose_requires_a_responder() {
        let now = TimeStamp::new();
        let mut trade = trade_with(None, &now);

        let err = apply(&mut trade, &propose(), A, &now, &policy()).unwrap_err();
        assert!(matches!(err, TradeError::InvalidTransition { .. }));
    }

    #[test]
    fn first_agree_seats_the_caller_once() {
        let now = TimeStamp::new();
        let mut trade = trade_with(None, &now);
        trade.status = TradeStatus::Proposed;

        apply(&mut trade, &agree(), B, &now, &policy()).unwrap();
        assert_eq!(trade.responder_user_id.as_deref(), Some(B));

        let err = apply(&mut trade, &agree(), C, &now, &policy()).unwrap_err();
        assert!(matches!(err, TradeError::Unauthorized { .. }));
        assert_eq!(trade.responder_user_id.as_deref(), Some(B));
    }

    #[test]
    fn initiator_cannot_agree_without_counterparty() {
        let now = TimeStamp::new();
        let mut trade = trade_with(None, &now);
        trade.status = TradeStatus::Proposed;

        let err = apply(&mut trade, &agree(), A, &now, &policy()).unwrap_err();
        assert!(matches!(err, TradeError::InvalidTransition { .. }));
        assert!(trade.responder_user_id.is_none());
    }

    #[test]
    fn cancel_twice_is_a_noop() {
        let now = TimeStamp::new();
        let mut trade = trade_with(Some(B), &now);

        apply(&mut trade, &Transition::Cancel, A, &now, &policy()).unwrap();
        let before = trade.clone();
        let outcome = apply(&mut trade, &Transition::Cancel, B, &now, &policy()).unwrap();

        assert_eq!(outcome, Outcome::Unchanged);
        assert_eq!(trade, before);
    }

    #[test]
    fn uncancel_restores_previous_status() {
        let now = TimeStamp::new();
        let mut trade = trade_with(Some(B), &now);
        apply(&mut trade, &propose(), A, &now, &policy()).unwrap();
        apply(&mut trade, &Transition::Cancel, B, &now, &policy()).unwrap();
        assert_eq!(trade.previous_status, Some(TradeStatus::Proposed));

        apply(&mut trade, &Transition::Uncancel, A, &now, &policy()).unwrap();
        assert_eq!(trade.status, TradeStatus::Proposed);
        assert_eq!(trade.previous_status, None);
    }

    #[test]
    fn uncancel_without_snapshot_is_invalid() {
        let now = TimeStamp::new();
        let mut trade = trade_with(Some(B), &now);
        trade.status = TradeStatus::Canceled;

        let err = apply(&mut trade, &Transition::Uncancel, A, &now, &policy()).unwrap_err();
        assert!(matches!(err, TradeError::InvalidTransition { .. }));
    }

    #[test]
    fn uncancel_past_the_restored_deadline_is_expired() {
        let now = TimeStamp::new();
        let mut trade = trade_with(Some(B), &now);
        trade.status = TradeStatus::Canceled;
        trade.previous_status = Some(TradeStatus::Agreed);
        trade.agreed_expired_at = Some(now.minus_hours(1));

        let err = apply(&mut trade, &Transition::Uncancel, B, &now, &policy()).unwrap_err();
        assert!(matches!(err, TradeError::Expired { .. }));
        assert_eq!(trade.status, TradeStatus::Canceled);
    }

    #[test]
    fn expired_proposal_is_canceled_on_touch() {
        let now = TimeStamp::new();
        let mut trade = trade_with(Some(B), &now);
        trade.status = TradeStatus::Proposed;
        trade.proposed_expired_at = Some(now.minus_hours(1));

        let outcome = apply(&mut trade, &agree(), A, &now, &policy()).unwrap();
        assert_eq!(
            outcome,
            Outcome::Expired {
                from: TradeStatus::Proposed
            }
        );
        assert_eq!(trade.status, TradeStatus::Canceled);
        assert_eq!(trade.previous_status, Some(TradeStatus::Proposed));
    }

    #[test]
    fn open_dispute_blocks_completion() {
        let now = TimeStamp::new();
        let mut trade = trade_with(Some(B), &now);
        trade.status = TradeStatus::Agreed;

        flag_dispute(&mut trade, B, "card arrived damaged", &now).unwrap();
        let err = apply(&mut trade, &Transition::Complete, A, &now, &policy()).unwrap_err();
        assert!(matches!(err, TradeError::InvalidTransition { .. }));

        assert!(clear_dispute(&mut trade, A, &now).is_err());
        assert!(clear_dispute(&mut trade, B, &now).unwrap());
        apply(&mut trade, &Transition::Complete, A, &now, &policy()).unwrap();
        assert_eq!(trade.status, TradeStatus::Completed);
    }

    #[test]
    fn terminal_statuses_reject_everything() {
        let now = TimeStamp::new();
        for status in [TradeStatus::Completed, TradeStatus::Disputed] {
            let mut trade = trade_with(Some(B), &now);
            trade.status = status;
            for transition in [propose(), agree(), Transition::Complete, Transition::Cancel] {
                let err = apply(&mut trade, &transition, A, &now, &policy()).unwrap_err();
                assert!(matches!(err, TradeError::InvalidTransition { .. }));
            }
        }
    }

    #[test]
    fn past_agree_deadline_is_rejected() {
        let now = TimeStamp::new();
        let mut trade = trade_with(Some(B), &now);
        trade.status = TradeStatus::Proposed;
        let transition = Transition::Agree {
            agreed_expired_at: Some(now.minus_hours(2)),
        };

        let err = apply(&mut trade, &transition, A, &now, &policy()).unwrap_err();
        assert!(matches!(err, TradeError::Validation(_)));
        assert_eq!(trade.status, TradeStatus::Proposed);
    }

    #[test]
    fn out_of_range_ttl_is_a_validation_error() {
        let now = TimeStamp::new();
        let mut trade = trade_with(Some(B), &now);
        let policy = DeadlinePolicy {
            proposal_ttl_hours: Some(i64::MAX),
            agreement_ttl_hours: Some(168),
        };

        let err = apply(&mut trade, &propose(), A, &now, &policy).unwrap_err();
        assert!(matches!(err, TradeError::Validation(_)));
        assert_eq!(trade.status, TradeStatus::Draft);
    }

    #[test]
    fn unstorable_agree_deadline_is_rejected() {
        let now = TimeStamp::new();
        let mut trade = trade_with(Some(B), &now);
        trade.status = TradeStatus::Proposed;
        let transition = Transition::Agree {
            agreed_expired_at: Some(TimeStamp::new_with(2300, 1, 1, 0, 0, 0)),
        };

        let err = apply(&mut trade, &transition, B, &now, &policy()).unwrap_err();
        assert!(matches!(err, TradeError::Validation(_)));
        assert_eq!(trade.agreed_expired_at, None);
    }

    #[test]
    fn responder_ids_cannot_carry_the_key_separator() {
        let now = TimeStamp::new();
        let mut trade = trade_with(None, &now);

        let err = set_responder(&mut trade, "user_a/x", &now).unwrap_err();
        assert!(matches!(err, TradeError::Validation(_)));

        trade.status = TradeStatus::Proposed;
        let err = apply(&mut trade, &agree(), "user_a/x", &now, &policy()).unwrap_err();
        assert!(matches!(err, TradeError::Validation(_)));
        assert_eq!(trade.responder_user_id, None);
    }

    #[test]
    fn set_responder_rules() {
        let now = TimeStamp::new();
        let mut trade = trade_with(None, &now);

        assert!(set_responder(&mut trade, A, &now).is_err());
        assert!(set_responder(&mut trade, B, &now).unwrap());
        assert!(!set_responder(&mut trade, B, &now).unwrap());
        assert!(set_responder(&mut trade, C, &now).is_err());
    }

    #[test]
    fn moderation_escalates_agreed_only() {
        let now = TimeStamp::new();
        let mut trade = trade_with(Some(B), &now);
        assert!(mark_disputed(&mut trade, &now).is_err());

        trade.status = TradeStatus::Agreed;
        mark_disputed(&mut trade, &now).unwrap();
        assert!(trade.status.is_terminal());
    }
}
