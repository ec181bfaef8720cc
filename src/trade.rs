//! Core trade aggregate types
use super::error::{Result, TradeError};
use chrono::{DateTime, Duration, TimeZone, Utc};

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TradeStatus {
    #[n(0)]
    Draft,
    #[n(1)]
    Proposed,
    #[n(2)]
    Agreed,
    #[n(3)]
    Completed,
    #[n(4)]
    Canceled,
    #[n(5)]
    Disputed,
}

impl TradeStatus {
    pub const ALL: [TradeStatus; 6] = [
        TradeStatus::Draft,
        TradeStatus::Proposed,
        TradeStatus::Agreed,
        TradeStatus::Completed,
        TradeStatus::Canceled,
        TradeStatus::Disputed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TradeStatus::Draft => "draft",
            TradeStatus::Proposed => "proposed",
            TradeStatus::Agreed => "agreed",
            TradeStatus::Completed => "completed",
            TradeStatus::Canceled => "canceled",
            TradeStatus::Disputed => "disputed",
        }
    }

    /// No outgoing transition exists from a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TradeStatus::Completed | TradeStatus::Disputed)
    }

    /// Offers may only change while the trade is still being negotiated.
    pub fn is_editable(&self) -> bool {
        matches!(self, TradeStatus::Draft | TradeStatus::Proposed)
    }
}

impl std::fmt::Display for TradeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct TimeStamp<T: TimeZone>(DateTime<T>);

impl PartialOrd for TimeStamp<Utc> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimeStamp<Utc> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}

impl TimeStamp<Utc> {
    pub fn new() -> Self {
        Self(Utc::now())
    }
    /// Panics on an invalid calendar date; meant for fixed literals.
    pub fn new_with(year: i32, month: u32, day: u32, hour: u32, min: u32, sec: u32) -> Self {
        Utc.with_ymd_and_hms(year, month, day, hour, min, sec)
            .unwrap()
            .into()
    }
    pub fn to_datetime_utc(&self) -> DateTime<Utc> {
        self.0
    }
    /// `None` when the result leaves the range a stored timestamp can hold.
    pub fn checked_plus_hours(&self, hours: i64) -> Option<Self> {
        let later = self.0.checked_add_signed(Duration::try_hours(hours)?)?;
        later.timestamp_nanos_opt().map(|_| Self(later))
    }
    /// Whether the timestamp fits the nanosecond encoding used on disk.
    pub fn is_storable(&self) -> bool {
        self.0.timestamp_nanos_opt().is_some()
    }
    pub fn plus_hours(&self, hours: i64) -> Self {
        Self(self.0 + Duration::hours(hours))
    }
    pub fn minus_hours(&self, hours: i64) -> Self {
        Self(self.0 - Duration::hours(hours))
    }
}

impl Default for TimeStamp<Utc> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: TimeZone> From<DateTime<T>> for TimeStamp<T> {
    fn from(value: DateTime<T>) -> Self {
        TimeStamp(value)
    }
}

impl<C> minicbor::Encode<C> for TimeStamp<Utc> {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> std::result::Result<(), minicbor::encode::Error<W::Error>> {
        if let Some(nsec) = self.0.timestamp_nanos_opt() {
            return e.i64(nsec)?.ok();
        }

        Err(minicbor::encode::Error::message(
            "failed to encode timestamp. timestamp_nanos_opt returned None",
        ))
    }
}

impl<'b, C> minicbor::Decode<'b, C> for TimeStamp<Utc> {
    fn decode(
        d: &mut minicbor::Decoder<'b>,
        _: &mut C,
    ) -> std::result::Result<Self, minicbor::decode::Error> {
        let nsecs = d.i64()?;

        Ok(TimeStamp(DateTime::from_timestamp_nanos(nsecs)))
    }
}

/// Open complaint raised by a participant on an agreed trade. Blocks completion.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct DisputeMarker {
    #[n(0)]
    pub raised_by: String,
    #[n(1)]
    pub reason: String,
    #[n(2)]
    pub raised_at: TimeStamp<Utc>,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Trade {
    #[n(0)]
    pub id: String, // bech32m uuid7, internal
    #[n(1)]
    pub room_slug: String, // public, unguessable
    #[n(2)]
    pub status: TradeStatus,
    #[n(3)]
    pub initiator_user_id: String,
    #[n(4)]
    pub responder_user_id: Option<String>,
    #[n(5)]
    pub proposed_expired_at: Option<TimeStamp<Utc>>,
    #[n(6)]
    pub agreed_expired_at: Option<TimeStamp<Utc>>,
    #[n(7)]
    pub previous_status: Option<TradeStatus>,
    #[n(8)]
    pub dispute: Option<DisputeMarker>,
    #[n(9)]
    pub version: u64, // bumped on every persisted write
    #[n(10)]
    pub created_at: TimeStamp<Utc>,
    #[n(11)]
    pub updated_at: TimeStamp<Utc>,
}

impl Trade {
    pub fn is_participant(&self, user_id: &str) -> bool {
        self.initiator_user_id == user_id || self.responder_user_id.as_deref() == Some(user_id)
    }

    /// Both sides of the trade, initiator first.
    pub fn participants(&self) -> Vec<&str> {
        let mut users = vec![self.initiator_user_id.as_str()];
        if let Some(responder) = self.responder_user_id.as_deref() {
            users.push(responder);
        }
        users
    }

    pub fn counterparty_of(&self, user_id: &str) -> Option<&str> {
        if self.initiator_user_id == user_id {
            self.responder_user_id.as_deref()
        } else if self.responder_user_id.as_deref() == Some(user_id) {
            Some(self.initiator_user_id.as_str())
        } else {
            None
        }
    }

    /// Deadline governing `status`, if that status carries one.
    pub fn deadline_for(&self, status: TradeStatus) -> Option<&TimeStamp<Utc>> {
        match status {
            TradeStatus::Proposed => self.proposed_expired_at.as_ref(),
            TradeStatus::Agreed => self.agreed_expired_at.as_ref(),
            _ => None,
        }
    }

    pub fn is_expired(&self, now: &TimeStamp<Utc>) -> bool {
        self.deadline_for(self.status)
            .is_some_and(|deadline| now > deadline)
    }
}

/// Request to open a new trade room. Built up then validated on creation.
#[derive(Debug, Default, Clone)]
pub struct NewTrade {
    initiator_user_id: String,
    responder_user_id: Option<String>,
    proposed_expired_at: Option<TimeStamp<Utc>>,
    initial_card_id: Option<String>,
}

impl NewTrade {
    pub fn new(initiator_user_id: &str) -> Self {
        Self {
            initiator_user_id: initiator_user_id.to_string(),
            ..Self::default()
        }
    }
    pub fn set_responder(mut self, user_id: &str) -> Self {
        self.responder_user_id = Some(user_id.to_string());
        self
    }
    pub fn set_proposed_expired_at(mut self, deadline: TimeStamp<Utc>) -> Self {
        self.proposed_expired_at = Some(deadline);
        self
    }
    pub fn set_initial_card(mut self, card_id: &str) -> Self {
        self.initial_card_id = Some(card_id.to_string());
        self
    }
    pub fn initiator(&self) -> &str {
        &self.initiator_user_id
    }
    pub fn initial_card_id(&self) -> Option<&str> {
        self.initial_card_id.as_deref()
    }

    /// Checks fields, then produces the draft trade under the given ids.
    pub fn validate_and_finalise(
        self,
        id: String,
        room_slug: String,
        now: &TimeStamp<Utc>,
    ) -> Result<Trade> {
        if self.initiator_user_id.is_empty() {
            return Err(TradeError::Validation("initiator is required".into()));
        }
        validate_user_id(&self.initiator_user_id)?;
        if self.responder_user_id.as_deref() == Some(self.initiator_user_id.as_str()) {
            return Err(TradeError::Validation(
                "responder must differ from initiator".into(),
            ));
        }
        if let Some(responder) = self.responder_user_id.as_deref() {
            validate_user_id(responder)?;
        }
        if let Some(deadline) = &self.proposed_expired_at {
            if deadline <= now {
                return Err(TradeError::Validation(
                    "proposal deadline is already in the past".into(),
                ));
            }
            if !deadline.is_storable() {
                return Err(TradeError::Validation(
                    "proposal deadline is too far in the future".into(),
                ));
            }
        }
        if let Some(card_id) = self.initial_card_id.as_deref() {
            validate_card_id(card_id)?;
        }

        Ok(Trade {
            id,
            room_slug,
            status: TradeStatus::Draft,
            initiator_user_id: self.initiator_user_id,
            responder_user_id: self.responder_user_id,
            proposed_expired_at: self.proposed_expired_at,
            agreed_expired_at: None,
            previous_status: None,
            dispute: None,
            version: 0,
            created_at: now.clone(),
            updated_at: now.clone(),
        })
    }
}

// user ids also become part of offer keys
pub(crate) fn validate_user_id(user_id: &str) -> Result<()> {
    if user_id.is_empty() || user_id.contains('/') {
        return Err(TradeError::Validation(format!(
            "malformed user id '{user_id}'"
        )));
    }
    Ok(())
}

// card ids become part of offer keys, so the separator is reserved
pub(crate) fn validate_card_id(card_id: &str) -> Result<()> {
    if card_id.is_empty() || card_id.contains('/') {
        return Err(TradeError::Validation(format!(
            "malformed card id '{card_id}'"
        )));
    }
    Ok(())
}
