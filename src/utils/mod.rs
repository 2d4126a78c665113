use chrono::{Datelike, NaiveDate};
use statrs::statistics::Statistics;

/// Calculate the difference between two dates in days
pub fn days_between(earlier: NaiveDate, later: NaiveDate) -> i64 {
    (later - earlier).num_days()
}

/// Season label for a match date, with seasons starting in July ("2023-24")
pub fn season_label(date: NaiveDate) -> String {
    let start = if date.month() >= 7 { date.year() } else { date.year() - 1 };
    format!("{}-{:02}", start, (start + 1) % 100)
}

/// Convert probability to decimal odds after applying a margin multiplier.
/// The result never drops below `min_odds`.
pub fn probability_to_odds(probability: f64, margin: f64, min_odds: f64) -> f64 {
    if !probability.is_finite() || probability <= 0.0 {
        return 1000.0; // Very high odds for impossible events
    }
    (1.0 / (probability * margin)).max(min_odds)
}

/// Normalize probabilities to sum to 1.0
pub fn normalize_probabilities(probs: &[f64]) -> Vec<f64> {
    let sum: f64 = probs.iter().sum();
    if sum <= 0.0 || !sum.is_finite() {
        let even = 1.0 / probs.len().max(1) as f64;
        return vec![even; probs.len()];
    }
    probs.iter().map(|p| p / sum).collect()
}

/// Mean of the values that are present, or None when nothing was recorded
pub fn mean_present<I>(values: I) -> Option<f64>
where
    I: IntoIterator<Item = Option<f64>>,
{
    let present: Vec<f64> = values.into_iter().flatten().collect();
    if present.is_empty() {
        None
    } else {
        Some(present.iter().mean())
    }
}

/// Population standard deviation; 0.0 for fewer than two samples
pub fn population_std(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    values.iter().population_std_dev()
}

/// Weighted mean over present values
pub fn weighted_mean(values: &[(Option<f64>, f64)]) -> Option<f64> {
    let (sum, weight) = values
        .iter()
        .filter_map(|(v, w)| v.map(|v| (v * w, *w)))
        .fold((0.0, 0.0), |(s, tw), (vw, w)| (s + vw, tw + w));
    if weight > 0.0 {
        Some(sum / weight)
    } else {
        None
    }
}

/// Weighted population standard deviation; equals `population_std` for equal weights
pub fn weighted_std(values: &[(f64, f64)]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let total: f64 = values.iter().map(|(_, w)| w).sum();
    if total <= 0.0 {
        return 0.0;
    }
    let mean = values.iter().map(|(v, w)| v * w).sum::<f64>() / total;
    let var = values.iter().map(|(v, w)| w * (v - mean).powi(2)).sum::<f64>() / total;
    var.sqrt()
}

/// Exponential decay weight for a sample `age_days` old
pub fn recency_weight(age_days: f64, half_life_days: f64) -> f64 {
    if half_life_days <= 0.0 {
        return 1.0;
    }
    0.5f64.powf(age_days.max(0.0) / half_life_days)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probability_to_odds() {
        assert_eq!(probability_to_odds(0.5, 1.0, 1.01), 2.0);
        assert_eq!(probability_to_odds(0.25, 1.0, 1.01), 4.0);
        assert!(probability_to_odds(0.0, 1.05, 1.01) > 100.0);
        assert_eq!(probability_to_odds(0.99, 1.05, 1.01), 1.01);
    }

    #[test]
    fn test_normalize_probabilities() {
        let normalized = normalize_probabilities(&[0.4, 0.3, 0.2]);
        let sum: f64 = normalized.iter().sum();
        assert!((sum - 1.0).abs() < 0.001);
        assert_eq!(normalize_probabilities(&[0.0, 0.0]), vec![0.5, 0.5]);
    }

    #[test]
    fn test_weighted_std_matches_population_std() {
        let values = [2.0, 1.0, 0.0, 3.0];
        let weighted: Vec<(f64, f64)> = values.iter().map(|v| (*v, 1.0)).collect();
        assert!((weighted_std(&weighted) - population_std(&values)).abs() < 1e-12);
    }

    #[test]
    fn test_season_label() {
        assert_eq!(season_label(NaiveDate::from_ymd_opt(2023, 8, 12).unwrap()), "2023-24");
        assert_eq!(season_label(NaiveDate::from_ymd_opt(2024, 5, 19).unwrap()), "2023-24");
        assert_eq!(season_label(NaiveDate::from_ymd_opt(1999, 9, 1).unwrap()), "1999-00");
    }

    #[test]
    fn test_recency_weight_halves_per_half_life() {
        assert!((recency_weight(365.0, 365.0) - 0.5).abs() < 1e-12);
        assert_eq!(recency_weight(0.0, 365.0), 1.0);
    }
}
