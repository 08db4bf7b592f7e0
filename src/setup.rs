//! Liquidity-sweep setup detection
//!
//! Causal state machine that walks each symbol candle-by-candle:
//! WATCHING_LIQ1 -> WATCHING_CONSOL -> WATCHING_LIQ2 -> WAITING_ENTRY ->
//! SETUP_COMPLETE or INVALIDATED. Decisions at candle T use only candles
//! admitted strictly before T; the consolidation window is frozen exactly
//! once and never re-derived from later candles.

use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Timelike, Utc};
use chrono_tz::America::New_York;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::types::Candle;

/// Configuration for the setup state machine
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Points added beyond the spike-rule level for the stop
    pub stop_buffer: f64,
    /// Minimum body/range ratio for the no-wick reference candle
    pub no_wick_ratio: f64,
    /// Target distance as a multiple of entry-to-stop risk
    pub target_r: f64,
    /// Max candles in consolidation before timeout
    pub max_consol_candles: usize,
    /// Max candles awaiting the no-wick candle before timeout
    pub max_liq2_wait_candles: usize,
    /// Max candles awaiting the entry trigger before timeout
    pub max_entry_wait_candles: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            stop_buffer: 2.0,
            no_wick_ratio: 0.7,
            target_r: 2.0,
            max_consol_candles: 120,
            max_liq2_wait_candles: 30,
            max_entry_wait_candles: 30,
        }
    }
}

/// Setup lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SetupState {
    WatchingLiq1,
    WatchingConsol,
    WatchingLiq2,
    WaitingEntry,
    SetupComplete,
    Invalidated,
}

impl SetupState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::SetupComplete | Self::Invalidated)
    }
}

impl std::fmt::Display for SetupState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::WatchingLiq1 => write!(f, "WATCHING_LIQ1"),
            Self::WatchingConsol => write!(f, "WATCHING_CONSOL"),
            Self::WatchingLiq2 => write!(f, "WATCHING_LIQ2"),
            Self::WaitingEntry => write!(f, "WAITING_ENTRY"),
            Self::SetupComplete => write!(f, "SETUP_COMPLETE"),
            Self::Invalidated => write!(f, "INVALIDATED"),
        }
    }
}

/// Reference high/low from the prior session window
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SessionLevels {
    pub session_high: f64,
    pub session_low: f64,
}

impl SessionLevels {
    /// Compute the reference levels over a candle window
    pub fn from_candles(candles: &[Candle]) -> Option<Self> {
        if candles.is_empty() {
            return None;
        }
        let mut high = f64::MIN;
        let mut low = f64::MAX;
        for c in candles {
            high = high.max(c.high);
            low = low.min(c.low);
        }
        Some(Self {
            session_high: high,
            session_low: low,
        })
    }
}

/// Overnight reference window for a trading day: 18:00 ET the prior calendar
/// day through 09:30 ET on the trading day
pub fn overnight_window(trading_day: NaiveDate) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let prev = trading_day.pred_opt()?;
    let start = New_York
        .with_ymd_and_hms(prev.year(), prev.month(), prev.day(), 18, 0, 0)
        .earliest()?;
    let end = New_York
        .with_ymd_and_hms(trading_day.year(), trading_day.month(), trading_day.day(), 9, 30, 0)
        .earliest()?;
    Some((start.with_timezone(&Utc), end.with_timezone(&Utc)))
}

/// Trading day a timestamp belongs to: the ET evening (18:00 onward) rolls
/// into the next day's session
pub fn trading_day_for(ts: DateTime<Utc>) -> NaiveDate {
    let et = ts.with_timezone(&New_York);
    if et.hour() >= 18 {
        et.date_naive().succ_opt().unwrap_or_else(|| et.date_naive())
    } else {
        et.date_naive()
    }
}

/// Accumulates overnight candles and yields the session reference levels
/// once the window closes
///
/// Used at engine warmup when no explicit levels are supplied: candles
/// inside the overnight window are collected, and the first candle at or
/// past 09:30 ET fixes the high/low for the day.
#[derive(Debug, Default)]
pub struct SessionWarmup {
    window: Option<(DateTime<Utc>, DateTime<Utc>)>,
    candles: Vec<Candle>,
}

impl SessionWarmup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Observe one completed candle, in timestamp order
    ///
    /// Returns the derived levels on the first candle at or past the window
    /// end; candles before the window open contribute nothing. After a
    /// yield the warmup rolls to the next session's window.
    pub fn observe(&mut self, candle: &Candle) -> Option<SessionLevels> {
        let (start, end) = match self.window {
            Some(w) => w,
            None => {
                let w = overnight_window(trading_day_for(candle.timestamp))?;
                self.window = Some(w);
                w
            }
        };

        if candle.timestamp < end {
            if candle.timestamp >= start {
                self.candles.push(candle.clone());
            }
            return None;
        }

        let levels = SessionLevels::from_candles(&self.candles);
        self.candles.clear();
        self.window = trading_day_for(candle.timestamp)
            .succ_opt()
            .and_then(overnight_window);
        levels
    }
}

/// One detection attempt, owned by the tracker until terminal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetupCandidate {
    /// Unique per detection attempt
    pub id: Uuid,
    pub symbol: String,
    pub state: SetupState,

    /// Prior-session reference levels active when the candidate was spawned
    pub session_high: f64,
    pub session_low: f64,

    /// First liquidity sweep: the close that broke the session high
    pub liq1_time: DateTime<Utc>,
    pub liq1_price: f64,

    /// Candles admitted to the consolidation window, in order
    pub consolidation: Vec<Candle>,

    /// Bounds over the admitted consolidation candles
    pub consol_high: Option<f64>,
    pub consol_low: Option<f64>,

    /// Set once when the consolidation window is frozen; never cleared
    pub frozen: bool,

    /// High of the candle that broke the consolidation (sweep extreme)
    pub sweep_high: Option<f64>,

    /// Frozen OHLC snapshot of the no-wick reference candle
    pub liq2_candle: Option<Candle>,

    pub entry_price: Option<f64>,
    pub stop_price: Option<f64>,
    pub target_price: Option<f64>,

    pub created_at: DateTime<Utc>,
    /// Timestamp of the candle that drove each state transition
    pub transitions: Vec<(SetupState, DateTime<Utc>)>,
    pub invalidation_reason: Option<String>,

    /// Candles seen since entering the current waiting state
    candles_in_state: usize,
}

impl SetupCandidate {
    fn new(symbol: &str, levels: SessionLevels, liq1: &Candle) -> Self {
        Self {
            id: Uuid::new_v4(),
            symbol: symbol.to_string(),
            state: SetupState::WatchingConsol,
            session_high: levels.session_high,
            session_low: levels.session_low,
            liq1_time: liq1.timestamp,
            liq1_price: liq1.close,
            consolidation: Vec::new(),
            consol_high: None,
            consol_low: None,
            frozen: false,
            sweep_high: None,
            liq2_candle: None,
            entry_price: None,
            stop_price: None,
            target_price: None,
            created_at: Utc::now(),
            transitions: vec![(SetupState::WatchingConsol, liq1.timestamp)],
            invalidation_reason: None,
            candles_in_state: 0,
        }
    }

    fn transition(&mut self, state: SetupState, at: DateTime<Utc>) {
        self.state = state;
        self.transitions.push((state, at));
        self.candles_in_state = 0;
    }

    fn admit_consol_candle(&mut self, candle: &Candle) {
        self.consolidation.push(candle.clone());
        self.consol_high = Some(match self.consol_high {
            Some(h) => h.max(candle.high),
            None => candle.high,
        });
        self.consol_low = Some(match self.consol_low {
            Some(l) => l.min(candle.low),
            None => candle.low,
        });
    }

    /// Is `candle` a no-wick reference candle (body dominates range)?
    fn is_no_wick(&self, candle: &Candle, ratio: f64) -> bool {
        let range = candle.range();
        range > 0.0 && candle.body() >= ratio * range
    }
}

/// State transitions reported to the engine
#[derive(Debug, Clone)]
pub enum SetupTransition {
    /// Session high swept; consolidation tracking begins
    Liq1Swept {
        setup_id: Uuid,
        price: f64,
        time: DateTime<Utc>,
    },
    /// Consolidation high broken; bounds frozen from strictly earlier candles
    ConsolBroken {
        setup_id: Uuid,
        frozen_high: f64,
        frozen_low: f64,
    },
    /// No-wick reference candle found and snapshotted
    Liq2Confirmed { setup_id: Uuid, liq2: Candle },
    /// Entry trigger fired; levels computed and immutable from here on
    EntryTriggered {
        setup_id: Uuid,
        entry: f64,
        stop: f64,
        target: f64,
    },
    Invalidated { setup_id: Uuid, reason: String },
}

/// Stop-loss derivation from the frozen LIQ#2 candle ("spike rule")
///
/// When the upper wick disproportionately exceeds the body, the stop anchors
/// to the body top instead of the wick extreme.
pub fn spike_rule_stop(liq2: &Candle, buffer: f64) -> f64 {
    let body = liq2.body();
    let upper_wick = liq2.upper_wick();
    if upper_wick > 2.0 * body && body > 0.0 {
        liq2.body_top() + buffer
    } else {
        liq2.high + buffer
    }
}

/// Per-symbol setup detector
pub struct SetupTracker {
    config: TrackerConfig,
    symbol: String,
    levels: Option<SessionLevels>,
    candidates: HashMap<Uuid, SetupCandidate>,
    last_candle_ts: Option<DateTime<Utc>>,
}

impl SetupTracker {
    pub fn new(symbol: &str, config: TrackerConfig) -> Self {
        Self {
            config,
            symbol: symbol.to_string(),
            levels: None,
            candidates: HashMap::new(),
            last_candle_ts: None,
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Set the prior-session reference levels used for LIQ#1 detection
    pub fn set_session_levels(&mut self, levels: SessionLevels) {
        info!(
            "{}: session levels set: high={:.2} low={:.2}",
            self.symbol, levels.session_high, levels.session_low
        );
        self.levels = Some(levels);
    }

    pub fn session_levels(&self) -> Option<SessionLevels> {
        self.levels
    }

    pub fn get(&self, id: &Uuid) -> Option<&SetupCandidate> {
        self.candidates.get(id)
    }

    /// Non-terminal candidates
    pub fn active_candidates(&self) -> Vec<&SetupCandidate> {
        self.candidates
            .values()
            .filter(|c| !c.state.is_terminal())
            .collect()
    }

    /// All candidates (including terminal), for persistence
    pub fn all_candidates(&self) -> Vec<&SetupCandidate> {
        self.candidates.values().collect()
    }

    /// Rehydrate persisted candidates at startup
    pub fn restore(&mut self, candidates: Vec<SetupCandidate>) {
        for c in candidates {
            if c.symbol != self.symbol {
                continue;
            }
            debug!("{}: restored setup {} in {}", self.symbol, c.id, c.state);
            self.candidates.insert(c.id, c);
        }
    }

    /// Apply one completed candle, strictly in timestamp order
    ///
    /// Out-of-order or malformed candles are rejected and logged; candidate
    /// state is left untouched.
    pub fn process_candle(&mut self, candle: &Candle) -> Vec<SetupTransition> {
        if candle.symbol != self.symbol {
            warn!(
                "{}: candle for {} routed to wrong tracker, rejected",
                self.symbol, candle.symbol
            );
            return Vec::new();
        }
        if candle.high < candle.low
            || candle.open > candle.high
            || candle.open < candle.low
            || candle.close > candle.high
            || candle.close < candle.low
        {
            warn!("{}: malformed candle at {}, rejected", self.symbol, candle.timestamp);
            return Vec::new();
        }
        if let Some(last) = self.last_candle_ts {
            if candle.timestamp <= last {
                warn!(
                    "{}: out-of-order candle at {} (last admitted {}), rejected",
                    self.symbol, candle.timestamp, last
                );
                return Vec::new();
            }
        }
        self.last_candle_ts = Some(candle.timestamp);

        let mut transitions = Vec::new();

        // Advance the single active candidate, if any
        let active_id = self
            .candidates
            .values()
            .find(|c| !c.state.is_terminal())
            .map(|c| c.id);

        if let Some(id) = active_id {
            let mut steps = Vec::new();
            if let Some(candidate) = self.candidates.get_mut(&id) {
                Self::step_candidate(&self.config, candidate, candle, &mut steps);
            }
            transitions.extend(steps);
        } else if let Some(levels) = self.levels {
            // LIQ#1: a close beyond the prior-session high spawns a candidate
            if candle.close > levels.session_high {
                let candidate = SetupCandidate::new(&self.symbol, levels, candle);
                info!(
                    "{}: LIQ#1 swept at {:.2} ({} > session high {:.2})",
                    self.symbol, candle.close, candle.timestamp, levels.session_high
                );
                transitions.push(SetupTransition::Liq1Swept {
                    setup_id: candidate.id,
                    price: candidate.liq1_price,
                    time: candidate.liq1_time,
                });
                self.candidates.insert(candidate.id, candidate);
            }
        }

        transitions
    }

    fn step_candidate(
        config: &TrackerConfig,
        candidate: &mut SetupCandidate,
        candle: &Candle,
        out: &mut Vec<SetupTransition>,
    ) {
        candidate.candles_in_state += 1;

        match candidate.state {
            SetupState::WatchingConsol => {
                Self::step_consolidation(config, candidate, candle, out);
            }
            SetupState::WatchingLiq2 => {
                Self::step_liq2_wait(config, candidate, candle, out);
            }
            SetupState::WaitingEntry => {
                Self::step_entry_wait(config, candidate, candle, out);
            }
            SetupState::WatchingLiq1 | SetupState::SetupComplete | SetupState::Invalidated => {}
        }
    }

    fn step_consolidation(
        config: &TrackerConfig,
        candidate: &mut SetupCandidate,
        candle: &Candle,
        out: &mut Vec<SetupTransition>,
    ) {
        // Break is judged against bounds over candles admitted strictly
        // before this one. The breaking candle itself is never admitted:
        // the window freezes excluding it, then the same candle is
        // re-evaluated against the frozen bounds as the LIQ#2 candidate.
        let breaks = matches!(candidate.consol_high, Some(h) if candle.high > h);

        if !breaks {
            candidate.admit_consol_candle(candle);
            if candidate.consolidation.len() > config.max_consol_candles {
                Self::invalidate(candidate, candle, "consolidation timeout", out);
            }
            return;
        }

        candidate.frozen = true;
        candidate.sweep_high = Some(candle.high);
        let frozen_high = candidate.consol_high.unwrap_or(candle.high);
        let frozen_low = candidate.consol_low.unwrap_or(candle.low);
        candidate.transition(SetupState::WatchingLiq2, candle.timestamp);
        debug!(
            "{}: consolidation broken at {}; window frozen high={:.2} low={:.2}",
            candidate.symbol, candle.timestamp, frozen_high, frozen_low
        );
        out.push(SetupTransition::ConsolBroken {
            setup_id: candidate.id,
            frozen_high,
            frozen_low,
        });

        // Same-step re-evaluation: the excluded candle may itself qualify as
        // the no-wick reference. If it does not, the window stays frozen.
        Self::try_confirm_liq2(config, candidate, candle, out);
    }

    fn step_liq2_wait(
        config: &TrackerConfig,
        candidate: &mut SetupCandidate,
        candle: &Candle,
        out: &mut Vec<SetupTransition>,
    ) {
        if candidate.candles_in_state > config.max_liq2_wait_candles {
            Self::invalidate(candidate, candle, "no-wick candle timeout", out);
            return;
        }

        // Continuation beyond the sweep extreme means the breakout is real,
        // not a sweep: opposing structure for a mean-reversion short.
        if let Some(sweep_high) = candidate.sweep_high {
            if candle.close > sweep_high {
                Self::invalidate(candidate, candle, "breakout continuation above sweep high", out);
                return;
            }
        }

        // Losing the frozen consolidation low abandons the structure
        if let Some(low) = candidate.consol_low {
            if candle.close < low {
                Self::invalidate(candidate, candle, "close below consolidation low", out);
                return;
            }
        }

        Self::try_confirm_liq2(config, candidate, candle, out);
    }

    fn try_confirm_liq2(
        config: &TrackerConfig,
        candidate: &mut SetupCandidate,
        candle: &Candle,
        out: &mut Vec<SetupTransition>,
    ) {
        // Callers arrive here already in WatchingLiq2; a non-qualifying
        // candle simply leaves the frozen window waiting.
        if !candidate.is_no_wick(candle, config.no_wick_ratio) {
            return;
        }

        // Snapshot the full OHLC; never recomputed from later candles
        candidate.liq2_candle = Some(candle.clone());
        candidate.transition(SetupState::WaitingEntry, candle.timestamp);
        info!(
            "{}: LIQ#2 confirmed at {} (low={:.2})",
            candidate.symbol, candle.timestamp, candle.low
        );
        out.push(SetupTransition::Liq2Confirmed {
            setup_id: candidate.id,
            liq2: candle.clone(),
        });
    }

    fn step_entry_wait(
        config: &TrackerConfig,
        candidate: &mut SetupCandidate,
        candle: &Candle,
        out: &mut Vec<SetupTransition>,
    ) {
        if candidate.candles_in_state > config.max_entry_wait_candles {
            Self::invalidate(candidate, candle, "entry trigger timeout", out);
            return;
        }

        let liq2 = match candidate.liq2_candle.clone() {
            Some(liq2) => liq2,
            None => {
                // Corrupted rehydration; refuse to trade on partial state
                Self::invalidate(candidate, candle, "missing LIQ#2 snapshot", out);
                return;
            }
        };

        if candle.close > liq2.high {
            Self::invalidate(candidate, candle, "close above LIQ#2 high", out);
            return;
        }

        if candle.close >= liq2.low {
            return;
        }

        // Entry: close below the no-wick candle's low. Stop and target come
        // from the frozen LIQ#2 snapshot only.
        let entry = candle.close;
        let stop = spike_rule_stop(&liq2, config.stop_buffer);
        let target = entry - config.target_r * (stop - entry);

        candidate.entry_price = Some(entry);
        candidate.stop_price = Some(stop);
        candidate.target_price = Some(target);
        candidate.transition(SetupState::SetupComplete, candle.timestamp);
        info!(
            "{}: setup {} complete: entry={:.2} stop={:.2} target={:.2}",
            candidate.symbol, candidate.id, entry, stop, target
        );
        out.push(SetupTransition::EntryTriggered {
            setup_id: candidate.id,
            entry,
            stop,
            target,
        });
    }

    fn invalidate(
        candidate: &mut SetupCandidate,
        candle: &Candle,
        reason: &str,
        out: &mut Vec<SetupTransition>,
    ) {
        info!(
            "{}: setup {} invalidated at {}: {}",
            candidate.symbol, candidate.id, candle.timestamp, reason
        );
        candidate.invalidation_reason = Some(reason.to_string());
        candidate.transition(SetupState::Invalidated, candle.timestamp);
        out.push(SetupTransition::Invalidated {
            setup_id: candidate.id,
            reason: reason.to_string(),
        });
    }

    /// Invalidate every non-terminal candidate at session close
    pub fn end_session(&mut self) -> Vec<SetupTransition> {
        let mut out = Vec::new();
        let now = self.last_candle_ts.unwrap_or_else(Utc::now);
        for candidate in self.candidates.values_mut() {
            if !candidate.state.is_terminal() {
                info!(
                    "{}: setup {} invalidated: session close",
                    candidate.symbol, candidate.id
                );
                candidate.invalidation_reason = Some("session close".to_string());
                candidate.transition(SetupState::Invalidated, now);
                out.push(SetupTransition::Invalidated {
                    setup_id: candidate.id,
                    reason: "session close".to_string(),
                });
            }
        }
        out
    }
}
