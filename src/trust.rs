//! Trust score computation
//!
//! The score is a materialized view over a user's profile signals and trade
//! stats: it is always recomputed wholesale from those inputs and never
//! patched in place.
use super::error::Result;
use super::stats::UserStats;
use super::storage::{Store, decode, encode};
use super::trade::TimeStamp;
use chrono::Utc;

pub const PROFILE_CAP: u8 = 20;
pub const BEHAVIOR_CAP: u8 = 50;
pub const REVIEW_CAP: u8 = 30;

const EMAIL_VERIFIED_POINTS: u8 = 10;
const SOCIAL_LINKED_POINTS: u8 = 10;
const COMPLETION_RATE_POINTS: f64 = 40.0;
const VOLUME_POINTS: f64 = 10.0;
const VOLUME_SATURATION: u64 = 10;
const DISPUTE_PENALTY: f64 = 5.0;
const RATING_POINTS: f64 = 25.0;
const REVIEW_CONFIDENCE_POINTS: f64 = 5.0;
const REVIEW_SATURATION: u64 = 5;
const MAX_RATING: f64 = 5.0;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrustGrade {
    #[n(0)]
    U,
    #[n(1)]
    D,
    #[n(2)]
    C,
    #[n(3)]
    B,
    #[n(4)]
    A,
    #[n(5)]
    S,
}

impl TrustGrade {
    /// Step function over the aggregate score. Monotonic in `score`.
    pub fn from_score(score: u8) -> Self {
        match score {
            90.. => TrustGrade::S,
            75..=89 => TrustGrade::A,
            55..=74 => TrustGrade::B,
            35..=54 => TrustGrade::C,
            15..=34 => TrustGrade::D,
            _ => TrustGrade::U,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            TrustGrade::U => 0,
            TrustGrade::D => 1,
            TrustGrade::C => 2,
            TrustGrade::B => 3,
            TrustGrade::A => 4,
            TrustGrade::S => 5,
        }
    }
}

impl PartialOrd for TrustGrade {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TrustGrade {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.rank().cmp(&other.rank())
    }
}

impl std::fmt::Display for TrustGrade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let letter = match self {
            TrustGrade::S => "S",
            TrustGrade::A => "A",
            TrustGrade::B => "B",
            TrustGrade::C => "C",
            TrustGrade::D => "D",
            TrustGrade::U => "U",
        };
        f.write_str(letter)
    }
}

impl std::str::FromStr for TrustGrade {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "S" => Ok(TrustGrade::S),
            "A" => Ok(TrustGrade::A),
            "B" => Ok(TrustGrade::B),
            "C" => Ok(TrustGrade::C),
            "D" => Ok(TrustGrade::D),
            "U" => Ok(TrustGrade::U),
            other => Err(format!("unknown trust grade '{other}'")),
        }
    }
}

/// Profile verification signals for one user.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Default, PartialEq, Eq)]
pub struct UserProfile {
    #[n(0)]
    pub email_verified: bool,
    #[n(1)]
    pub x_linked: bool,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrustComponents {
    #[n(0)]
    pub x_profile: u8,
    #[n(1)]
    pub behavior: u8,
    #[n(2)]
    pub review: u8,
}

impl TrustComponents {
    pub fn total(&self) -> u8 {
        let sum = self.x_profile as u16 + self.behavior as u16 + self.review as u16;
        sum.min(100) as u8
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct TrustScore {
    #[n(0)]
    pub user_id: String,
    #[n(1)]
    pub trust_score: u8,
    #[n(2)]
    pub trust_grade: TrustGrade,
    #[n(3)]
    pub components: TrustComponents,
    #[n(4)]
    pub updated_at: TimeStamp<Utc>,
}

impl TrustScore {
    pub fn from_components(
        user_id: &str,
        components: TrustComponents,
        updated_at: TimeStamp<Utc>,
    ) -> Self {
        let trust_score = components.total();
        Self {
            user_id: user_id.to_string(),
            trust_score,
            trust_grade: TrustGrade::from_score(trust_score),
            components,
            updated_at,
        }
    }
}

pub fn profile_score(profile: &UserProfile) -> u8 {
    let mut score = 0;
    if profile.email_verified {
        score += EMAIL_VERIFIED_POINTS;
    }
    if profile.x_linked {
        score += SOCIAL_LINKED_POINTS;
    }
    score.min(PROFILE_CAP)
}

pub fn behavior_score(stats: &UserStats) -> u8 {
    let finished = stats.finished_count();
    if finished == 0 {
        return 0;
    }
    let rate = stats.completed_count as f64 / finished as f64;
    let volume = stats.completed_count.min(VOLUME_SATURATION) as f64 / VOLUME_SATURATION as f64;
    let raw = COMPLETION_RATE_POINTS * rate + VOLUME_POINTS * volume
        - DISPUTE_PENALTY * stats.disputed_count as f64;

    raw.round().clamp(0.0, BEHAVIOR_CAP as f64) as u8
}

pub fn review_score(stats: &UserStats) -> u8 {
    if stats.review_count == 0 {
        return 0;
    }
    let rating = stats.avg_rating.clamp(0.0, MAX_RATING) / MAX_RATING;
    let confidence =
        stats.review_count.min(REVIEW_SATURATION) as f64 / REVIEW_SATURATION as f64;
    let raw = RATING_POINTS * rating + REVIEW_CONFIDENCE_POINTS * confidence;

    raw.round().clamp(0.0, REVIEW_CAP as f64) as u8
}

/// Deterministic: equal inputs always give equal components.
pub fn compute(profile: &UserProfile, stats: &UserStats) -> TrustComponents {
    TrustComponents {
        x_profile: profile_score(profile),
        behavior: behavior_score(stats),
        review: review_score(stats),
    }
}

impl Store {
    pub fn trust_score(&self, user_id: &str) -> Result<Option<TrustScore>> {
        match self.trust.get(user_id.as_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn trust_scores(&self) -> Result<Vec<TrustScore>> {
        self.trust
            .iter()
            .values()
            .map(|bytes| decode(&bytes?))
            .collect()
    }

    /// Recompute a user's snapshot from their profile and stats and replace
    /// the stored one wholesale.
    ///
    /// When nothing changed the stored snapshot is returned untouched, so
    /// repeated calls over the same inputs yield identical bytes.
    pub fn recompute_trust_score(&self, user_id: &str, now: &TimeStamp<Utc>) -> Result<TrustScore> {
        let profile = self.profile(user_id)?;
        let stats = self.user_stats(user_id)?;
        let components = compute(&profile, &stats);

        if let Some(current) = self.trust_score(user_id)? {
            if current.components == components {
                return Ok(current);
            }
        }

        let snapshot = TrustScore::from_components(user_id, components, now.clone());
        self.trust.insert(user_id.as_bytes(), encode(&snapshot)?)?;
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(completed: u64, canceled: u64, disputed: u64, reviews: u64, avg: f64) -> UserStats {
        UserStats {
            completed_count: completed,
            canceled_count: canceled,
            disputed_count: disputed,
            review_count: reviews,
            avg_rating: avg,
        }
    }

    #[test]
    fn recompute_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let db = sled::open(dir.path().join("trust.db")).unwrap();
        let store = Store::open(std::sync::Arc::new(db)).unwrap();
        store
            .put_profile(
                "user_a",
                &UserProfile {
                    email_verified: true,
                    x_linked: false,
                },
            )
            .unwrap();

        let first = store.recompute_trust_score("user_a", &TimeStamp::new()).unwrap();
        let bytes = store.trust.get("user_a").unwrap().unwrap();
        let second = store
            .recompute_trust_score("user_a", &TimeStamp::new().plus_hours(5))
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(store.trust.get("user_a").unwrap().unwrap(), bytes);
        assert_eq!(first.trust_score, 10);
        assert_eq!(first.trust_grade, TrustGrade::U);
    }

    #[test]
    fn fresh_user_is_unrated() {
        let components = compute(&UserProfile::default(), &UserStats::default());

        assert_eq!(components, TrustComponents::default());
        assert_eq!(TrustGrade::from_score(components.total()), TrustGrade::U);
    }

    #[test]
    fn perfect_record_reaches_s() {
        let profile = UserProfile {
            email_verified: true,
            x_linked: true,
        };
        let components = compute(&profile, &stats(12, 0, 0, 8, 5.0));

        assert_eq!(components.x_profile, PROFILE_CAP);
        assert_eq!(components.behavior, BEHAVIOR_CAP);
        assert_eq!(components.review, REVIEW_CAP);
        assert_eq!(components.total(), 100);
        assert_eq!(TrustGrade::from_score(components.total()), TrustGrade::S);
    }

    #[test]
    fn disputes_reduce_behavior() {
        let clean = behavior_score(&stats(5, 1, 0, 0, 0.0));
        let disputed = behavior_score(&stats(5, 1, 2, 0, 0.0));

        assert!(disputed < clean);
    }

    #[test]
    fn behavior_never_negative() {
        assert_eq!(behavior_score(&stats(0, 0, 9, 0, 0.0)), 0);
    }

    #[test]
    fn grades_order_and_parse() {
        assert!(TrustGrade::S > TrustGrade::A);
        assert!(TrustGrade::D > TrustGrade::U);
        assert_eq!("b".parse::<TrustGrade>().unwrap(), TrustGrade::B);
        assert!("Z".parse::<TrustGrade>().is_err());
    }

    #[test]
    fn grade_thresholds() {
        assert_eq!(TrustGrade::from_score(90), TrustGrade::S);
        assert_eq!(TrustGrade::from_score(89), TrustGrade::A);
        assert_eq!(TrustGrade::from_score(55), TrustGrade::B);
        assert_eq!(TrustGrade::from_score(35), TrustGrade::C);
        assert_eq!(TrustGrade::from_score(15), TrustGrade::D);
        assert_eq!(TrustGrade::from_score(14), TrustGrade::U);
    }
}
