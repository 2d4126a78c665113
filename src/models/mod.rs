use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::NeutralDefaults;

/// Full-time result code as published by match feeds ("H", "D", "A").
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ResultCode {
    Home,
    Draw,
    Away,
}

impl ResultCode {
    pub fn from_score(home_goals: u32, away_goals: u32) -> Self {
        match home_goals.cmp(&away_goals) {
            std::cmp::Ordering::Greater => ResultCode::Home,
            std::cmp::Ordering::Equal => ResultCode::Draw,
            std::cmp::Ordering::Less => ResultCode::Away,
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code.trim().to_uppercase().as_str() {
            "H" => Some(ResultCode::Home),
            "D" => Some(ResultCode::Draw),
            "A" => Some(ResultCode::Away),
            _ => None,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ResultCode::Home => "H",
            ResultCode::Draw => "D",
            ResultCode::Away => "A",
        }
    }
}

/// Per-side match statistics. Feeds frequently omit columns, so every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SideStats {
    pub shots: Option<u32>,
    pub shots_on_target: Option<u32>,
    pub corners: Option<u32>,
    pub fouls: Option<u32>,
    pub yellow_cards: Option<u32>,
    pub red_cards: Option<u32>,
}

impl SideStats {
    /// Yellow plus red cards, or None when neither column was recorded
    pub fn cards(&self) -> Option<u32> {
        match (self.yellow_cards, self.red_cards) {
            (None, None) => None,
            (y, r) => Some(y.unwrap_or(0) + r.unwrap_or(0)),
        }
    }
}

/// A settled historical match. Immutable once ingested.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchRecord {
    pub date: NaiveDate,
    pub league: String,
    pub season: String,
    pub home_team: String,
    pub away_team: String,
    pub home_goals: u32,
    pub away_goals: u32,
    pub result: ResultCode,
    pub home_stats: SideStats,
    pub away_stats: SideStats,
    pub referee: Option<String>,
}

impl MatchRecord {
    pub fn is_home(&self, team: &str) -> Option<bool> {
        if self.home_team == team {
            Some(true)
        } else if self.away_team == team {
            Some(false)
        } else {
            None
        }
    }

    pub fn opponent(&self, team: &str) -> Option<&str> {
        self.is_home(team)
            .map(|home| if home { self.away_team.as_str() } else { self.home_team.as_str() })
    }

    pub fn goals_for(&self, team: &str) -> Option<u32> {
        self.is_home(team)
            .map(|home| if home { self.home_goals } else { self.away_goals })
    }

    pub fn goals_against(&self, team: &str) -> Option<u32> {
        self.is_home(team)
            .map(|home| if home { self.away_goals } else { self.home_goals })
    }

    pub fn stats_for(&self, team: &str) -> Option<&SideStats> {
        self.is_home(team)
            .map(|home| if home { &self.home_stats } else { &self.away_stats })
    }

    pub fn stats_against(&self, team: &str) -> Option<&SideStats> {
        self.is_home(team)
            .map(|home| if home { &self.away_stats } else { &self.home_stats })
    }

    /// League points earned by `team` (3 win, 1 draw, 0 loss)
    pub fn points_for(&self, team: &str) -> Option<u32> {
        let gf = self.goals_for(team)?;
        let ga = self.goals_against(team)?;
        Some(match gf.cmp(&ga) {
            std::cmp::Ordering::Greater => 3,
            std::cmp::Ordering::Equal => 1,
            std::cmp::Ordering::Less => 0,
        })
    }

    pub fn total_goals(&self) -> u32 {
        self.home_goals + self.away_goals
    }

    /// Cards shown in the match, summed over whichever sides recorded them
    pub fn total_cards(&self) -> Option<u32> {
        match (self.home_stats.cards(), self.away_stats.cards()) {
            (None, None) => None,
            (h, a) => Some(h.unwrap_or(0) + a.unwrap_or(0)),
        }
    }
}

/// A team's entering-match statistics as of a cutoff date.
///
/// Only matches dated strictly before `as_of` contribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeamTemporalState {
    pub team: String,
    pub as_of: NaiveDate,
    /// Number of prior matches the averages were computed from (0 = neutral defaults)
    pub matches_considered: usize,
    pub avg_goals_for: f64,
    pub avg_goals_against: f64,
    pub avg_shots_for: f64,
    pub avg_shots_against: f64,
    pub avg_sot_for: f64,
    pub avg_sot_against: f64,
    pub avg_corners_for: f64,
    pub avg_corners_against: f64,
    pub avg_cards: f64,
    pub avg_fouls: f64,
    pub ppg: f64,
    /// Results over the last `form_window` matches, whatever the aggregation mode
    pub wins: u32,
    pub draws: u32,
    pub losses: u32,
    pub btts_rate: f64,
    pub over25_rate: f64,
    pub clean_sheet_rate: f64,
    pub failed_to_score_rate: f64,
    pub goal_volatility: f64,
    pub schedule_difficulty: f64,
    pub rest_days: f64,
    pub last_match_date: Option<NaiveDate>,
}

impl TeamTemporalState {
    /// State for a team with no usable history
    pub fn neutral(team: &str, as_of: NaiveDate, defaults: &NeutralDefaults, rest_days: f64) -> Self {
        Self {
            team: team.to_string(),
            as_of,
            matches_considered: 0,
            avg_goals_for: defaults.goals,
            avg_goals_against: defaults.goals,
            avg_shots_for: defaults.shots,
            avg_shots_against: defaults.shots,
            avg_sot_for: defaults.shots_on_target,
            avg_sot_against: defaults.shots_on_target,
            avg_corners_for: defaults.corners,
            avg_corners_against: defaults.corners,
            avg_cards: defaults.cards,
            avg_fouls: defaults.fouls,
            ppg: defaults.ppg,
            wins: 0,
            draws: 0,
            losses: 0,
            btts_rate: defaults.rate,
            over25_rate: defaults.rate,
            clean_sheet_rate: defaults.rate,
            failed_to_score_rate: defaults.rate,
            goal_volatility: defaults.volatility,
            schedule_difficulty: defaults.ppg,
            rest_days,
            last_match_date: None,
        }
    }
}

/// How confidently an external team name was mapped onto a canonical identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NameMatch {
    Exact,
    Alias,
    /// Substring fallback; never treat as a confident match
    Recovered,
}

impl fmt::Display for NameMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NameMatch::Exact => write!(f, "exact"),
            NameMatch::Alias => write!(f, "alias"),
            NameMatch::Recovered => write!(f, "recovered"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedTeam {
    pub query: String,
    pub canonical: String,
    pub matched: NameMatch,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeamSnapshot {
    pub team: ResolvedTeam,
    pub state: TeamTemporalState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefereeProfile {
    pub name: String,
    pub avg_cards: f64,
    pub matches: usize,
}

/// Referee input as seen by the models: a sufficient-sample profile or the baseline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefereeContext {
    pub name: Option<String>,
    pub avg_cards: f64,
    pub sample: usize,
    pub is_baseline: bool,
}

impl RefereeContext {
    pub fn baseline(name: Option<String>, default_cards: f64) -> Self {
        Self {
            name,
            avg_cards: default_cards,
            sample: 0,
            is_baseline: true,
        }
    }

    /// Use the profile only when it meets the minimum sample size
    pub fn from_profile(
        name: Option<String>,
        profile: Option<RefereeProfile>,
        min_sample: usize,
        default_cards: f64,
    ) -> Self {
        match profile {
            Some(p) if p.matches >= min_sample => Self {
                name,
                avg_cards: p.avg_cards,
                sample: p.matches,
                is_baseline: false,
            },
            Some(p) => Self {
                sample: p.matches,
                ..Self::baseline(name, default_cards)
            },
            None => Self::baseline(name, default_cards),
        }
    }
}

// ── Markets ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Side {
    Home,
    Away,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum OverUnder {
    Over,
    Under,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum GoalLine {
    Half,
    OneAndHalf,
    TwoAndHalf,
    ThreeAndHalf,
}

impl GoalLine {
    pub fn value(&self) -> f64 {
        match self {
            GoalLine::Half => 0.5,
            GoalLine::OneAndHalf => 1.5,
            GoalLine::TwoAndHalf => 2.5,
            GoalLine::ThreeAndHalf => 3.5,
        }
    }

    fn key(&self) -> &'static str {
        match self {
            GoalLine::Half => "05",
            GoalLine::OneAndHalf => "15",
            GoalLine::TwoAndHalf => "25",
            GoalLine::ThreeAndHalf => "35",
        }
    }

    fn from_key(key: &str) -> Option<Self> {
        match key {
            "05" => Some(GoalLine::Half),
            "15" => Some(GoalLine::OneAndHalf),
            "25" => Some(GoalLine::TwoAndHalf),
            "35" => Some(GoalLine::ThreeAndHalf),
            _ => None,
        }
    }
}

/// Closed set of priced markets
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Market {
    MatchResult(ResultCode),
    TotalGoals { line: GoalLine, side: OverUnder },
    BothTeamsScore(bool),
    TeamTotal { team: Side, line: GoalLine, side: OverUnder },
}

impl Market {
    /// Stable key used on the CLI and in API payloads, e.g. `home`, `over25`, `btts_yes`, `away_over15`
    pub fn key(&self) -> String {
        let ou = |side: &OverUnder| match side {
            OverUnder::Over => "over",
            OverUnder::Under => "under",
        };
        match self {
            Market::MatchResult(ResultCode::Home) => "home".to_string(),
            Market::MatchResult(ResultCode::Draw) => "draw".to_string(),
            Market::MatchResult(ResultCode::Away) => "away".to_string(),
            Market::TotalGoals { line, side } => format!("{}{}", ou(side), line.key()),
            Market::BothTeamsScore(true) => "btts_yes".to_string(),
            Market::BothTeamsScore(false) => "btts_no".to_string(),
            Market::TeamTotal { team, line, side } => {
                let team = match team {
                    Side::Home => "home",
                    Side::Away => "away",
                };
                format!("{}_{}{}", team, ou(side), line.key())
            }
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        let key = key.trim().to_lowercase();
        match key.as_str() {
            "home" | "1" => return Some(Market::MatchResult(ResultCode::Home)),
            "draw" | "x" => return Some(Market::MatchResult(ResultCode::Draw)),
            "away" | "2" => return Some(Market::MatchResult(ResultCode::Away)),
            "btts_yes" => return Some(Market::BothTeamsScore(true)),
            "btts_no" => return Some(Market::BothTeamsScore(false)),
            _ => {}
        }

        let parse_total = |s: &str| -> Option<(GoalLine, OverUnder)> {
            if let Some(line) = s.strip_prefix("over") {
                Some((GoalLine::from_key(line)?, OverUnder::Over))
            } else if let Some(line) = s.strip_prefix("under") {
                Some((GoalLine::from_key(line)?, OverUnder::Under))
            } else {
                None
            }
        };

        if let Some(rest) = key.strip_prefix("home_") {
            let (line, side) = parse_total(rest)?;
            return Some(Market::TeamTotal { team: Side::Home, line, side });
        }
        if let Some(rest) = key.strip_prefix("away_") {
            let (line, side) = parse_total(rest)?;
            return Some(Market::TeamTotal { team: Side::Away, line, side });
        }
        let (line, side) = parse_total(&key)?;
        Some(Market::TotalGoals { line, side })
    }
}

/// Bookmaker prices supplied alongside a fixture
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KnownOdds {
    pub prices: Vec<(Market, f64)>,
}

impl KnownOdds {
    /// Parses `key -> price` pairs, returning the odds and any keys that were not recognised.
    /// Prices at or below 1.0 are not valid decimal odds and are rejected with the unknown keys.
    pub fn from_keyed<'a, I>(pairs: I) -> (Self, Vec<String>)
    where
        I: IntoIterator<Item = (&'a str, f64)>,
    {
        let mut odds = KnownOdds::default();
        let mut rejected = Vec::new();
        for (key, price) in pairs {
            match Market::from_key(key) {
                Some(market) if price.is_finite() && price > 1.0 => odds.insert(market, price),
                _ => rejected.push(key.to_string()),
            }
        }
        (odds, rejected)
    }

    pub fn insert(&mut self, market: Market, price: f64) {
        if let Some(existing) = self.prices.iter_mut().find(|(m, _)| *m == market) {
            existing.1 = price;
        } else {
            self.prices.push((market, price));
        }
    }

    pub fn get(&self, market: Market) -> Option<f64> {
        self.prices.iter().find(|(m, _)| *m == market).map(|(_, p)| *p)
    }

    pub fn is_empty(&self) -> bool {
        self.prices.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OddsSource {
    /// Bookmaker price, passed through unchanged
    Market,
    /// Synthesized from model output
    Model,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricedMarket {
    pub market: Market,
    pub key: String,
    pub decimal_odds: f64,
    /// 1 / decimal_odds
    pub implied_probability: f64,
    /// Engine probability for the same outcome, before any margin
    pub model_probability: f64,
    pub source: OddsSource,
}

impl PricedMarket {
    /// Model probability minus the price's implied probability; positive means the price looks generous
    pub fn edge(&self) -> f64 {
        self.model_probability - self.implied_probability
    }
}

// ── Model targets and predictions ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    Classifier,
    Regressor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Target {
    HomeWin,
    AwayWin,
    Draw,
    Over15,
    Over25,
    Btts,
    HomeGoals,
    AwayGoals,
}

impl Target {
    pub const ALL: [Target; 8] = [
        Target::HomeWin,
        Target::AwayWin,
        Target::Draw,
        Target::Over15,
        Target::Over25,
        Target::Btts,
        Target::HomeGoals,
        Target::AwayGoals,
    ];

    pub fn kind(&self) -> TargetKind {
        match self {
            Target::HomeGoals | Target::AwayGoals => TargetKind::Regressor,
            _ => TargetKind::Classifier,
        }
    }

    /// Label derived deterministically from the final score
    pub fn label(&self, home_goals: u32, away_goals: u32) -> f64 {
        let flag = |b: bool| if b { 1.0 } else { 0.0 };
        match self {
            Target::HomeWin => flag(home_goals > away_goals),
            Target::AwayWin => flag(away_goals > home_goals),
            Target::Draw => flag(home_goals == away_goals),
            Target::Over15 => flag(home_goals + away_goals > 1),
            Target::Over25 => flag(home_goals + away_goals > 2),
            Target::Btts => flag(home_goals > 0 && away_goals > 0),
            Target::HomeGoals => home_goals as f64,
            Target::AwayGoals => away_goals as f64,
        }
    }

    /// Neutral value used when this target's model cannot answer
    pub fn fallback(&self) -> f64 {
        match self.kind() {
            TargetKind::Classifier => 0.5,
            TargetKind::Regressor => 0.0,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Target::HomeWin => "home_win",
            Target::AwayWin => "away_win",
            Target::Draw => "draw",
            Target::Over15 => "over_1_5",
            Target::Over25 => "over_2_5",
            Target::Btts => "btts",
            Target::HomeGoals => "home_goals",
            Target::AwayGoals => "away_goals",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeProbabilities {
    pub home_win: f64,
    pub draw: f64,
    pub away_win: f64,
    pub over15: f64,
    pub over25: f64,
    pub btts: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpectedGoals {
    pub home: f64,
    pub away: f64,
}

impl ExpectedGoals {
    pub fn total(&self) -> f64 {
        self.home + self.away
    }

    /// Rounded scoreline for display; odds math keeps the continuous values
    pub fn display_score(&self) -> (u32, u32) {
        (self.home.round().max(0.0) as u32, self.away.round().max(0.0) as u32)
    }
}

/// Boolean context risks used to temper overconfident predictions
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrapFlags {
    /// Late season and closely matched form
    pub timing: bool,
    /// Either side is short on rest
    pub fatigue: bool,
    /// Both sides historically low shot volume
    pub stylistic_clash: bool,
    pub closely_matched: bool,
}

impl TrapFlags {
    pub fn labels(&self) -> Vec<&'static str> {
        let mut labels = Vec::new();
        if self.timing {
            labels.push("timing");
        }
        if self.fatigue {
            labels.push("fatigue");
        }
        if self.stylistic_clash {
            labels.push("stylistic_clash");
        }
        if self.closely_matched {
            labels.push("closely_matched");
        }
        labels
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub home: ResolvedTeam,
    pub away: ResolvedTeam,
    pub match_date: NaiveDate,
    pub league: Option<String>,
    pub referee: RefereeContext,
    pub home_state: TeamTemporalState,
    pub away_state: TeamTemporalState,
    pub probabilities: OutcomeProbabilities,
    pub expected_goals: ExpectedGoals,
    pub odds: Vec<PricedMarket>,
    pub traps: TrapFlags,
    /// Targets whose model failed and were replaced by their neutral fallback
    pub fallbacks: Vec<Target>,
    pub model_version: String,
}

impl Prediction {
    pub fn odds_for(&self, market: Market) -> Option<&PricedMarket> {
        self.odds.iter().find(|p| p.market == market)
    }
}

/// An upcoming match from the fixture source, with any bookmaker prices merged on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fixture {
    pub date: NaiveDate,
    pub kickoff: Option<String>,
    pub league: String,
    pub home_team: String,
    pub away_team: String,
    pub referee: Option<String>,
    pub odds: KnownOdds,
}

/// A cup or continental fixture; only its date matters, for rest-day calculation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecondaryFixture {
    pub team: String,
    pub date: NaiveDate,
    pub competition: Option<String>,
}

// API Response types
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            timestamp: Utc::now(),
        }
    }
}
