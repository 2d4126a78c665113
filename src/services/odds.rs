//! Decimal odds for a prediction.
//!
//! Supplied bookmaker prices always win and are passed through untouched.
//! Everything else is synthesized from model output.

use crate::config::OddsConfig;
use crate::models::{
    ExpectedGoals, GoalLine, KnownOdds, Market, OddsSource, OutcomeProbabilities, OverUnder, PricedMarket,
    ResultCode, Side,
};
use crate::utils::probability_to_odds;

/// Power-law chance that goals exceed `line`: r^k / (1 + r^k) with r = xg / line
pub fn over_probability(expected_goals: f64, line: f64, power: f64) -> f64 {
    if !expected_goals.is_finite() || expected_goals <= 0.0 || line <= 0.0 {
        return 0.0;
    }
    let rk = (expected_goals / line).powf(power);
    if rk.is_infinite() {
        return 1.0;
    }
    rk / (1.0 + rk)
}

/// Markets priced for every prediction
pub fn default_markets() -> Vec<Market> {
    let mut markets = vec![
        Market::MatchResult(ResultCode::Home),
        Market::MatchResult(ResultCode::Draw),
        Market::MatchResult(ResultCode::Away),
    ];
    for line in [GoalLine::OneAndHalf, GoalLine::TwoAndHalf] {
        for side in [OverUnder::Over, OverUnder::Under] {
            markets.push(Market::TotalGoals { line, side });
        }
    }
    markets.push(Market::BothTeamsScore(true));
    markets.push(Market::BothTeamsScore(false));
    for team in [Side::Home, Side::Away] {
        for line in [GoalLine::Half, GoalLine::OneAndHalf] {
            for side in [OverUnder::Over, OverUnder::Under] {
                markets.push(Market::TeamTotal { team, line, side });
            }
        }
    }
    markets
}

/// Engine probability for a market outcome
pub fn model_probability(
    market: Market,
    probabilities: &OutcomeProbabilities,
    expected_goals: &ExpectedGoals,
    power: f64,
) -> f64 {
    let with_side = |p_over: f64, side: OverUnder| match side {
        OverUnder::Over => p_over,
        OverUnder::Under => 1.0 - p_over,
    };
    match market {
        Market::MatchResult(ResultCode::Home) => probabilities.home_win,
        Market::MatchResult(ResultCode::Draw) => probabilities.draw,
        Market::MatchResult(ResultCode::Away) => probabilities.away_win,
        Market::TotalGoals { line, side } => {
            with_side(over_probability(expected_goals.total(), line.value(), power), side)
        }
        Market::BothTeamsScore(true) => probabilities.btts,
        Market::BothTeamsScore(false) => 1.0 - probabilities.btts,
        Market::TeamTotal { team, line, side } => {
            let xg = match team {
                Side::Home => expected_goals.home,
                Side::Away => expected_goals.away,
            };
            with_side(over_probability(xg, line.value(), power), side)
        }
    }
}

fn priced(market: Market, decimal_odds: f64, model_probability: f64, source: OddsSource) -> PricedMarket {
    PricedMarket {
        market,
        key: market.key(),
        decimal_odds,
        implied_probability: 1.0 / decimal_odds,
        model_probability,
        source,
    }
}

/// Price the default markets plus any extra market that came with known odds
pub fn resolve_odds(
    probabilities: &OutcomeProbabilities,
    expected_goals: &ExpectedGoals,
    known: Option<&KnownOdds>,
    config: &OddsConfig,
) -> Vec<PricedMarket> {
    let min_odds = config.min_decimal_odds.max(1.0 + f64::EPSILON);
    let mut markets = default_markets();
    if let Some(known) = known {
        for (market, _) in &known.prices {
            if !markets.contains(market) {
                markets.push(*market);
            }
        }
    }

    markets
        .into_iter()
        .map(|market| {
            let p = model_probability(market, probabilities, expected_goals, config.goal_power);
            match known.and_then(|k| k.get(market)) {
                Some(price) => priced(market, price, p, OddsSource::Market),
                None => priced(
                    market,
                    probability_to_odds(p, config.margin, min_odds),
                    p,
                    OddsSource::Model,
                ),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn probs(home: f64, draw: f64, away: f64) -> OutcomeProbabilities {
        OutcomeProbabilities {
            home_win: home,
            draw,
            away_win: away,
            over15: 0.7,
            over25: 0.5,
            btts: 0.55,
        }
    }

    fn xg(home: f64, away: f64) -> ExpectedGoals {
        ExpectedGoals { home, away }
    }

    #[test]
    fn test_power_law() {
        assert!((over_probability(2.5, 2.5, 2.2) - 0.5).abs() < 1e-12);
        assert!(over_probability(3.5, 2.5, 2.2) > 0.5);
        assert!(over_probability(1.0, 2.5, 2.2) < 0.5);
        assert_eq!(over_probability(0.0, 2.5, 2.2), 0.0);
        assert_eq!(over_probability(f64::NAN, 2.5, 2.2), 0.0);
    }

    #[test]
    fn test_all_prices_exceed_one() {
        let config = OddsConfig::default();
        for (p, goals) in [
            (probs(1.0, 0.0, 0.0), xg(0.0, 0.0)),
            (probs(0.45, 0.3, 0.25), xg(1.6, 1.1)),
            (probs(0.0, 0.0, 1.0), xg(9.0, 7.0)),
        ] {
            let odds = resolve_odds(&p, &goals, None, &config);
            assert_eq!(odds.len(), default_markets().len());
            for priced in &odds {
                assert!(priced.decimal_odds > 1.0, "{} priced at {}", priced.key, priced.decimal_odds);
                assert_eq!(priced.source, OddsSource::Model);
            }
        }
    }

    #[test]
    fn test_synthesized_prices_carry_margin() {
        let config = OddsConfig::default();
        let odds = resolve_odds(&probs(0.5, 0.25, 0.25), &xg(1.5, 1.0), None, &config);
        let home = odds.iter().find(|o| o.key == "home").unwrap();
        assert!((home.decimal_odds - 1.0 / (0.5 * 1.05)).abs() < 1e-12);
        assert!(home.edge() < 0.0);

        let over = odds.iter().find(|o| o.key == "over25").unwrap();
        let under = odds.iter().find(|o| o.key == "under25").unwrap();
        assert!((over.model_probability + under.model_probability - 1.0).abs() < 1e-12);
        assert!((over.model_probability - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_known_odds_pass_through_verbatim() {
        let (known, rejected) = KnownOdds::from_keyed([("home", 1.80), ("draw", 3.40), ("away", 4.50), ("over35", 3.1)]);
        assert!(rejected.is_empty());
        let odds = resolve_odds(&probs(0.3, 0.3, 0.4), &xg(1.2, 1.4), Some(&known), &OddsConfig::default());

        let price = |key: &str| odds.iter().find(|o| o.key == key).unwrap();
        assert_eq!(price("home").decimal_odds, 1.80);
        assert_eq!(price("draw").decimal_odds, 3.40);
        assert_eq!(price("away").decimal_odds, 4.50);
        assert_eq!(price("home").source, OddsSource::Market);
        assert_eq!(price("over35").decimal_odds, 3.1);
        assert_eq!(price("over25").source, OddsSource::Model);
        assert_eq!(odds.len(), default_markets().len() + 1);
    }
}
