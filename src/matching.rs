//! Candidate partner lookup gated on trust grade
use super::error::Result;
use super::storage::Store;
use super::trust::{TrustGrade, TrustScore};

#[derive(Debug, Clone)]
pub struct PartnerFilter {
    pub min_grade: TrustGrade,
    pub exclude_user_id: Option<String>,
    pub limit: usize,
}

impl PartnerFilter {
    pub fn new(min_grade: TrustGrade) -> Self {
        Self {
            min_grade,
            exclude_user_id: None,
            limit: 50,
        }
    }
    pub fn excluding(mut self, user_id: &str) -> Self {
        self.exclude_user_id = Some(user_id.to_string());
        self
    }
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    fn admits(&self, score: &TrustScore) -> bool {
        score.trust_grade >= self.min_grade
            && self.exclude_user_id.as_deref() != Some(score.user_id.as_str())
    }
}

impl Store {
    /// Users whose persisted grade clears the filter, best score first.
    ///
    /// Reads stored snapshots only; a user never recomputed is not a candidate.
    pub fn find_partners(&self, filter: &PartnerFilter) -> Result<Vec<TrustScore>> {
        let mut candidates: Vec<TrustScore> = self
            .trust_scores()?
            .into_iter()
            .filter(|score| filter.admits(score))
            .collect();

        candidates.sort_by(|a, b| {
            b.trust_score
                .cmp(&a.trust_score)
                .then_with(|| a.user_id.cmp(&b.user_id))
        });
        candidates.truncate(filter.limit);
        Ok(candidates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trade::TimeStamp;
    use crate::trust::TrustComponents;

    fn score(user_id: &str, behavior: u8) -> TrustScore {
        TrustScore::from_components(
            user_id,
            TrustComponents {
                x_profile: 20,
                behavior,
                review: 0,
            },
            TimeStamp::new(),
        )
    }

    #[test]
    fn filter_applies_grade_and_exclusion() {
        let filter = PartnerFilter::new(TrustGrade::B).excluding("user_a");

        assert!(filter.admits(&score("user_b", 40)));
        assert!(!filter.admits(&score("user_a", 50)));
        assert!(!filter.admits(&score("user_c", 10)));
    }
}
